use crate::{
    config::{LinearSolver, SimulationParameters},
    datatypes::{BoundaryFacet, Element, Node, TetMesh, SUPPORT_MARKER},
    error::{Result, StrainsetError},
};
use indicatif::ProgressBar;
use nalgebra::{DMatrix, DVector, Matrix3, SMatrix, Vector3, Vector6};
use nalgebra_sparse::{factorization::CscCholesky, CooMatrix, CscMatrix, CsrMatrix};
use tracing::{debug, info, warn};

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        ArgminFloat, Error, Executor, Operator, State, KV,
    },
    solver::conjugategradient::ConjugateGradient,
};

pub const DOF: usize = 3;
/// Relative volume below which a tetrahedron is considered flat
const DEGENERATE_VOLUME: f64 = 1e-12;
/// Largest accepted `|Ku - f| / |f|` after a solve
const RESIDUAL_TOLERANCE: f64 = 1e-6;

/// Runs multiplication for Conjugate Gradient Solver
struct ConjugateGradientOperator<'a> {
    a: &'a CsrMatrix<f64>,
}

impl<'a> Operator for ConjugateGradientOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> std::result::Result<Self::Output, Error> {
        let product = self.a * &DVector::from_column_slice(x);
        Ok(product.iter().copied().collect())
    }
}

/// Observer bar for argmin solver
struct ConjugateGradientObserverBar {
    bar: ProgressBar,
    final_mag: f64,
}

impl ConjugateGradientObserverBar {
    fn new(target_cost: f64) -> ConjugateGradientObserverBar {
        ConjugateGradientObserverBar {
            bar: ProgressBar::new(1000),
            final_mag: target_cost.log10().floor(),
        }
    }

    fn argmin_float_to_f64<F: ArgminFloat>(&self, value: F) -> Option<f64> {
        format!("{:?}", value).parse().ok()
    }
}

impl<I> Observe<I> for ConjugateGradientObserverBar
where
    I: State,
{
    fn observe_init(&mut self, _name: &str, _state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        Ok(())
    }

    fn observe_iter(&mut self, state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        let cost = match self.argmin_float_to_f64(state.get_cost()) {
            Some(c) => c,
            None => return Ok(()), // skip if we can't parse
        };
        let cost_mag = cost.log10().floor();
        let remaining = (cost_mag - self.final_mag).max(1.0);
        let progress = (1000. / f64::sqrt(remaining)) as u64;
        self.bar.set_position(progress.min(1000));

        Ok(())
    }

    fn observe_final(&mut self, _state: &I) -> std::result::Result<(), Error> {
        self.bar.finish_and_clear();
        Ok(())
    }
}

/// Solves a system of equations using the conjugate gradient method.
///
/// This function returns an approximation for x in `Ax=b`
///
/// # Arguments
/// * `a` - A square positive definite matrix
/// * `b` - A vector of the solutions to the system
/// * `max_iters` - Iteration cap
/// * `target_cost` - Cost at which the solver stops
///
/// # Returns
/// A DVector that represents `x` from the system
fn run_conjugate_gradient(
    a: &CsrMatrix<f64>,
    b: &DVector<f64>,
    max_iters: u64,
    target_cost: f64,
) -> Result<DVector<f64>> {
    let b_flat: Vec<f64> = b.iter().copied().collect();
    let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b_flat);
    let initial_guess: Vec<f64> = vec![0.0; b.nrows()];

    let operator = ConjugateGradientOperator { a };
    let observer = ConjugateGradientObserverBar::new(target_cost);

    // Run solver
    let res = match Executor::new(operator, solver)
        .configure(|state| {
            state
                .param(initial_guess)
                .max_iters(max_iters)
                .target_cost(target_cost)
        })
        .add_observer(observer, ObserverMode::NewBest)
        .run()
    {
        Ok(r) => r,
        Err(err) => {
            return Err(StrainsetError::Solver(format!(
                "Conjugate Gradient error: {err}"
            )))
        }
    };

    let best_param = match &res.state().best_param {
        Some(vec) => DVector::from_vec(vec.clone()),
        None => {
            return Err(StrainsetError::Solver(
                "Conjugate Gradient could not produce best parameter".to_owned(),
            ))
        }
    };

    Ok(best_param)
}

/// Solves `Ax=b` with a sparse Cholesky factorization
fn run_cholesky(a: &CscMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    let cholesky = CscCholesky::factor(a).map_err(|err| {
        StrainsetError::Solver(format!("Cholesky factorization failed: {err:?}"))
    })?;
    let rhs = DMatrix::from_column_slice(b.nrows(), 1, b.as_slice());
    let solution = cholesky.solve(&rhs);
    Ok(DVector::from_column_slice(solution.as_slice()))
}

/// Calculates the shape function gradients and volume of a linear tetrahedron
///
/// # Arguments
/// * `element` - The Element to target
/// * `nodes` - A reference to the vector of nodes
///
/// # Returns
/// A 4x3 matrix whose row `i` is the gradient of node `i`'s shape function,
/// and the element volume
pub fn compute_shape_gradients(element: &Element, nodes: &[Node]) -> Result<(SMatrix<f64, 4, 3>, f64)> {
    let p: [Vector3<f64>; 4] = element.nodes.map(|i| nodes[i].vertex.coords());
    let jacobian = Matrix3::from_columns(&[p[1] - p[0], p[2] - p[0], p[3] - p[0]]);

    let scale = jacobian
        .column_iter()
        .map(|c| c.norm())
        .fold(0.0_f64, f64::max);
    let det = jacobian.determinant();
    if scale == 0.0 || det.abs() <= DEGENERATE_VOLUME * scale.powi(3) {
        return Err(StrainsetError::Solver(format!(
            "Degenerate element with nodes {:?}",
            element.nodes
        )));
    }
    let inverse = jacobian.try_inverse().ok_or_else(|| {
        StrainsetError::Solver(format!("Singular element with nodes {:?}", element.nodes))
    })?;

    let reference_gradients = SMatrix::<f64, 4, 3>::new(
        -1.0, -1.0, -1.0, //
        1.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, //
        0.0, 0.0, 1.0,
    );

    Ok((reference_gradients * inverse, det.abs() / 6.0))
}

/// Calculates the strain-displacement matrix of the element, with strains
/// ordered xx, yy, zz, yz, xz, xy and engineering shear
///
/// # Arguments
/// * `gradients` - The shape function gradients of the element
///
/// # Returns
/// A 6x12 strain-displacement matrix
pub fn compute_strain_displacement_matrix(gradients: &SMatrix<f64, 4, 3>) -> SMatrix<f64, 6, 12> {
    let mut strain_displacement_mat = SMatrix::<f64, 6, 12>::zeros();

    for node in 0..4 {
        let (bx, by, bz) = (
            gradients[(node, 0)],
            gradients[(node, 1)],
            gradients[(node, 2)],
        );
        let col = DOF * node;

        strain_displacement_mat[(0, col)] = bx;
        strain_displacement_mat[(1, col + 1)] = by;
        strain_displacement_mat[(2, col + 2)] = bz;

        strain_displacement_mat[(3, col + 1)] = bz;
        strain_displacement_mat[(3, col + 2)] = by;

        strain_displacement_mat[(4, col)] = bz;
        strain_displacement_mat[(4, col + 2)] = bx;

        strain_displacement_mat[(5, col)] = by;
        strain_displacement_mat[(5, col + 1)] = bx;
    }

    strain_displacement_mat
}

/// Calculates the isotropic stress-strain matrix
///
/// # Arguments
/// * `params` - The simulation parameters holding the material
///
/// # Returns
/// A 6x6 stress-strain matrix
pub fn compute_stress_strain_matrix(params: &SimulationParameters) -> SMatrix<f64, 6, 6> {
    let lambda = params.lame_lambda();
    let mu = params.lame_mu();

    let mut stress_strain_mat = SMatrix::<f64, 6, 6>::zeros();
    for i in 0..3 {
        for j in 0..3 {
            stress_strain_mat[(i, j)] = lambda;
        }
        stress_strain_mat[(i, i)] += 2.0 * mu;
        stress_strain_mat[(i + 3, i + 3)] = mu;
    }

    stress_strain_mat
}

/// Symmetric part of the inherent strain in the same ordering as the strains
pub fn inherent_strain_voigt(inherent_strain: &Matrix3<f64>) -> Vector6<f64> {
    let a = inherent_strain;
    Vector6::new(
        a[(0, 0)],
        a[(1, 1)],
        a[(2, 2)],
        0.5 * (a[(1, 2)] + a[(2, 1)]),
        0.5 * (a[(0, 2)] + a[(2, 0)]),
        0.5 * (a[(0, 1)] + a[(1, 0)]),
    )
}

/// Stiffness matrix and inherent strain load of one element
///
/// # Returns
/// The 12x12 stiffness matrix and the 12 entry load vector
pub fn compute_element_system(
    element: &Element,
    nodes: &[Node],
    stress_strain_mat: &SMatrix<f64, 6, 6>,
    inherent_strain: &Vector6<f64>,
) -> Result<(SMatrix<f64, 12, 12>, SMatrix<f64, 12, 1>)> {
    let (gradients, volume) = compute_shape_gradients(element, nodes)?;
    let strain_displacement_mat = compute_strain_displacement_matrix(&gradients);

    let stiffness = (strain_displacement_mat.transpose() * stress_strain_mat)
        * strain_displacement_mat
        * volume;
    let load = strain_displacement_mat.transpose() * inherent_strain * volume;

    Ok((stiffness, load))
}

/// Finds the exterior facets of the mesh and marks the supports
///
/// # Arguments
/// * `mesh` - The tetrahedral mesh
/// * `z_clamping_tolerance` - Facets with every vertex below this height
///     are supports
pub fn find_boundary_facets(mesh: &TetMesh, z_clamping_tolerance: f64) -> Vec<BoundaryFacet> {
    mesh.exterior_faces()
        .into_iter()
        .map(|nodes| {
            let supported = nodes
                .iter()
                .all(|&n| mesh.nodes[n].vertex.z < z_clamping_tolerance);
            BoundaryFacet {
                nodes,
                marker: if supported { SUPPORT_MARKER } else { 0 },
            }
        })
        .collect()
}

/// Consistent mass matrix of a linear triangle
fn compute_facet_mass_matrix(facet: &BoundaryFacet, nodes: &[Node]) -> SMatrix<f64, 3, 3> {
    let a = nodes[facet.nodes[0]].vertex.coords();
    let b = nodes[facet.nodes[1]].vertex.coords();
    let c = nodes[facet.nodes[2]].vertex.coords();
    let area = 0.5 * (b - a).cross(&(c - a)).norm();

    let mut mass = SMatrix::<f64, 3, 3>::repeat(area / 12.0);
    for i in 0..3 {
        mass[(i, i)] *= 2.0;
    }
    mass
}

/// Assembles the global stiffness matrix and load vector
///
/// # Arguments
/// * `nodes` - A reference to the vector of nodes
/// * `elements` - A reference to the vector of elements
/// * `facets` - The marked boundary facets
/// * `params` - The simulation parameters
///
/// # Returns
/// The stiffness matrix in coordinate form and the load vector
fn build_system(
    nodes: &[Node],
    elements: &[Element],
    facets: &[BoundaryFacet],
    params: &SimulationParameters,
) -> Result<(CooMatrix<f64>, DVector<f64>)> {
    let size = DOF * nodes.len();
    let mut stiffness = CooMatrix::new(size, size);
    let mut load = DVector::zeros(size);

    let stress_strain_mat = compute_stress_strain_matrix(params);
    let inherent_strain = inherent_strain_voigt(&params.inherent_strain);

    let bar = ProgressBar::new(elements.len() as u64);
    for element in elements {
        bar.inc(1);
        let (element_stiffness, element_load) =
            compute_element_system(element, nodes, &stress_strain_mat, &inherent_strain)?;

        for (local_row, node_row) in element.nodes.iter().enumerate() {
            for row_dof in 0..DOF {
                let global_row = DOF * node_row + row_dof;
                let local_row = DOF * local_row + row_dof;
                load[global_row] += element_load[local_row];

                for (local_col, node_col) in element.nodes.iter().enumerate() {
                    for col_dof in 0..DOF {
                        stiffness.push(
                            global_row,
                            DOF * node_col + col_dof,
                            element_stiffness[(local_row, DOF * local_col + col_dof)],
                        );
                    }
                }
            }
        }
    }
    bar.finish_and_clear();

    // penalty support: k * (u, v) over the marked facets
    for facet in facets.iter().filter(|f| f.marker == SUPPORT_MARKER) {
        let mass = compute_facet_mass_matrix(facet, nodes) * params.support_stiffness;
        for (local_row, node_row) in facet.nodes.iter().enumerate() {
            for (local_col, node_col) in facet.nodes.iter().enumerate() {
                for dof in 0..DOF {
                    stiffness.push(
                        DOF * node_row + dof,
                        DOF * node_col + dof,
                        mass[(local_row, local_col)],
                    );
                }
            }
        }
    }

    Ok((stiffness, load))
}

/// Calculates the von Mises stress of `sigma(u) - A` in every element
///
/// # Arguments
/// * `elements` - A mutable reference to the vector of elements
/// * `nodes` - A reference to the solved nodes
/// * `params` - The simulation parameters
fn compute_stress(
    elements: &mut [Element],
    nodes: &[Node],
    params: &SimulationParameters,
) -> Result<()> {
    let stress_strain_mat = compute_stress_strain_matrix(params);
    let inherent_strain = inherent_strain_voigt(&params.inherent_strain);

    for element in elements {
        let mut displacement_mat = SMatrix::<f64, 12, 1>::zeros();
        for (local, &n) in element.nodes.iter().enumerate() {
            let u = nodes[n].displacement().ok_or_else(|| {
                StrainsetError::Solver(format!("Unknown displacement at node {n} after solve"))
            })?;
            displacement_mat
                .fixed_view_mut::<3, 1>(DOF * local, 0)
                .copy_from(&u);
        }

        let (gradients, _) = compute_shape_gradients(element, nodes)?;
        let stress = stress_strain_mat
            * compute_strain_displacement_matrix(&gradients)
            * displacement_mat
            - inherent_strain;

        element.stress = Some(von_mises(&stress));
    }
    Ok(())
}

/// Von Mises equivalent of a stress in xx, yy, zz, yz, xz, xy order
pub fn von_mises(stress: &Vector6<f64>) -> f64 {
    let s = stress;
    f64::sqrt(
        0.5 * ((s[0] - s[1]).powi(2) + (s[1] - s[2]).powi(2) + (s[2] - s[0]).powi(2))
            + 3.0 * (s[3].powi(2) + s[4].powi(2) + s[5].powi(2)),
    )
}

/// What the solve produced besides the nodal displacements
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub facets: Vec<BoundaryFacet>,
    pub supported_facets: usize,
    pub solve_seconds: f32,
}

/// Runs the inherent strain solve. Loads the displacements into the nodes
/// and the residual stress into the elements.
///
/// # Arguments
/// * `mesh` - A mutable reference to the tetrahedral mesh
/// * `params` - The simulation parameters
pub fn run(mesh: &mut TetMesh, params: &SimulationParameters) -> Result<SimulationResult> {
    if mesh.elements.is_empty() {
        return Err(StrainsetError::Solver(
            "Mesh has no tetrahedra to simulate".to_owned(),
        ));
    }
    let dropped = mesh.retain_referenced_nodes();
    if dropped > 0 {
        warn!("dropped {dropped} nodes that belong to no tetrahedron");
    }

    let facets = find_boundary_facets(mesh, params.z_clamping_tolerance);
    let supported_facets = facets
        .iter()
        .filter(|f| f.marker == SUPPORT_MARKER)
        .count();
    if supported_facets == 0 {
        return Err(StrainsetError::Solver(format!(
            "No boundary facet lies below z = {}; the part is unsupported",
            params.z_clamping_tolerance
        )));
    }
    info!(
        "{} boundary facets, {} supported",
        facets.len(),
        supported_facets
    );

    info!("building stiffness matrix for {} elements...", mesh.elements.len());
    let (stiffness, load) = build_system(&mesh.nodes, &mesh.elements, &facets, params)?;
    let stiffness_csr = CsrMatrix::from(&stiffness);
    debug!(
        "assembled {n} x {n} system with {nnz} non-zeros",
        n = stiffness_csr.nrows(),
        nnz = stiffness_csr.nnz()
    );

    let start = std::time::Instant::now();
    let solution = match params.linear_solver {
        LinearSolver::Cholesky => run_cholesky(&CscMatrix::from(&stiffness), &load)?,
        LinearSolver::ConjugateGradient => run_conjugate_gradient(
            &stiffness_csr,
            &load,
            params.cg_max_iters,
            params.cg_target_cost,
        )?,
    };
    let solve_seconds = start.elapsed().as_secs_f32();

    let residual = (&stiffness_csr * &solution - &load).norm();
    let load_norm = load.norm();
    let relative = if load_norm > 0.0 {
        residual / load_norm
    } else {
        residual
    };
    info!(
        "solved system in {:.3} seconds (relative residual {:.3e})",
        solve_seconds, relative
    );
    if !relative.is_finite() {
        return Err(StrainsetError::Solver(
            "Solution contains non-finite values".to_owned(),
        ));
    }
    if relative > RESIDUAL_TOLERANCE {
        return Err(StrainsetError::Solver(format!(
            "Linear solve did not converge: relative residual {relative:.3e} exceeds {RESIDUAL_TOLERANCE:.0e}"
        )));
    }

    // Load results into nodes
    for (i, node) in mesh.nodes.iter_mut().enumerate() {
        node.ux = Some(solution[DOF * i]);
        node.uy = Some(solution[DOF * i + 1]);
        node.uz = Some(solution[DOF * i + 2]);
    }

    compute_stress(&mut mesh.elements, &mesh.nodes, params)?;

    Ok(SimulationResult {
        facets,
        supported_facets,
        solve_seconds,
    })
}
