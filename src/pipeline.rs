use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use rand::Rng;
use tracing::{error, info, warn};

use crate::{
    config::{DatasetConfig, Phase, SimulationParameters},
    datatypes::{BoundaryFacet, TetMesh},
    error::{Result, StrainsetError},
    filter, mesher,
    post_processor::{self, DataArray, UnstructuredGrid, PIECE_SUFFIX, VTK_TRIANGLE},
    shapes, solver,
};

/// Files written by one simulation
#[derive(Debug, Clone)]
pub struct SimulationOutputs {
    pub boundary_marker: PathBuf,
    pub inherent_strain: PathBuf,
    pub displacement: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetSummary {
    pub generated: usize,
    pub filtered_out: usize,
    pub meshed: usize,
    pub simulated: usize,
    pub exported: usize,
}

/// Files directly inside `folder` whose name ends with `suffix`, sorted
fn list_files(folder: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(folder)
        .map_err(|err| StrainsetError::io(folder, err))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(suffix))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn boundary_marker_grid(mesh: &TetMesh, facets: &[BoundaryFacet]) -> UnstructuredGrid {
    UnstructuredGrid {
        points: mesh.nodes.iter().map(|n| n.vertex).collect(),
        cells: facets.iter().map(|f| f.nodes.to_vec()).collect(),
        cell_types: vec![VTK_TRIANGLE; facets.len()],
        point_data: Vec::new(),
        cell_data: vec![DataArray::scalars(
            "boundary_marker",
            facets.iter().map(|f| f.marker as f64).collect(),
        )],
    }
}

fn inherent_strain_grid(mesh: &TetMesh, params: &SimulationParameters) -> UnstructuredGrid {
    let tensor: Vec<f64> = params.inherent_strain.transpose().iter().copied().collect();
    let mut grid = UnstructuredGrid::from_tet_mesh(mesh);
    grid.cell_data.push(DataArray {
        name: "inherent_strain".to_owned(),
        components: 9,
        values: tensor.repeat(mesh.elements.len()),
    });
    grid
}

fn displacement_grid(mesh: &TetMesh) -> Result<UnstructuredGrid> {
    let displacement = mesh
        .nodes
        .iter()
        .map(|n| n.displacement())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| StrainsetError::PostProcessor("Mesh has not been solved".to_owned()))?;
    let stress: Vec<f64> = mesh
        .elements
        .iter()
        .map(|e| e.stress.unwrap_or(0.0))
        .collect();

    let mut grid = UnstructuredGrid::from_tet_mesh(mesh);
    grid.point_data
        .push(DataArray::vectors("displacement", &displacement));
    grid.cell_data.push(DataArray::scalars("von_mises", stress));
    Ok(grid)
}

/// Runs the inherent strain solve on one `.msh` and writes the boundary
/// markers, the inherent strain and the displacement as pvd collections
///
/// # Arguments
/// * `input_msh` - The tetrahedral mesh
/// * `output_folder` - Where `<name>._<Field>.pvd` and its piece are written
/// * `params` - Material, support and load
pub fn simulate(
    input_msh: &Path,
    output_folder: &Path,
    params: &SimulationParameters,
) -> Result<SimulationOutputs> {
    let name = input_msh
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| StrainsetError::Input(format!("Bad mesh name {}", input_msh.display())))?;
    info!("Start simulating {}", input_msh.display());

    let mut mesh = mesher::parse_mesh(input_msh)?;
    let result = solver::run(&mut mesh, params)?;

    let outputs = SimulationOutputs {
        boundary_marker: post_processor::write_collection(
            &boundary_marker_grid(&mesh, &result.facets),
            output_folder,
            &format!("{name}._BoundaryMarker"),
        )?,
        inherent_strain: post_processor::write_collection(
            &inherent_strain_grid(&mesh, params),
            output_folder,
            &format!("{name}._InherentStrain"),
        )?,
        displacement: post_processor::write_collection(
            &displacement_grid(&mesh)?,
            output_folder,
            &format!("{name}._Displacement"),
        )?,
    };

    info!(
        "End simulating {} ({} supported facets, solve took {:.3} s)",
        input_msh.display(),
        result.supported_facets,
        result.solve_seconds
    );
    Ok(outputs)
}

/// Builds one dataset split end to end
///
/// # Arguments
/// * `dataset_path` - Scratch folder for surfaces, meshes and results
/// * `final_path` - Folder receiving the exported samples
/// * `samples` - How many shapes to generate
/// * `config` - The dataset configuration
/// * `log_file` - Log copied next to the samples when present
/// * `rng` - Random source of the shape generator
pub fn generate_dataset<R: Rng + ?Sized>(
    dataset_path: &Path,
    final_path: &Path,
    samples: usize,
    config: &DatasetConfig,
    log_file: Option<&Path>,
    rng: &mut R,
) -> Result<DatasetSummary> {
    for dir in [dataset_path, final_path] {
        std::fs::create_dir_all(dir).map_err(|err| StrainsetError::io(dir, err))?;
    }
    let mut summary = DatasetSummary::default();

    summary.generated = shapes::generate(dataset_path, samples, &config.generator, rng)?.generated;
    summary.filtered_out =
        filter::remove_not_exact(dataset_path, config.generator.edges_target)?;
    summary.meshed = mesher::run_batch(dataset_path, &config.mesher, &config.batch)?.meshed;

    let meshes = list_files(dataset_path, ".msh")?;
    info!("simulating {} meshes", meshes.len());
    for msh in &meshes {
        match simulate(msh, dataset_path, &config.simulation) {
            Ok(_) => summary.simulated += 1,
            Err(err) => error!("simulation of {} skipped: {err}", msh.display()),
        }
    }

    if let Some(log_file) = log_file.filter(|p| p.exists()) {
        if let Some(file_name) = log_file.file_name() {
            let target = final_path.join(file_name);
            if let Err(err) = std::fs::copy(log_file, &target) {
                warn!("unable to copy {} to {}: {err}", log_file.display(), target.display());
            }
        }
    }

    let pieces = list_files(dataset_path, &format!("_Displacement{PIECE_SUFFIX}.vtu"))?;
    info!(
        "Start exporting the results to the final folder, {} files found",
        pieces.len()
    );
    let bar = ProgressBar::new(pieces.len() as u64);
    for vtu in &pieces {
        bar.inc(1);
        match post_processor::export_sample(vtu, final_path) {
            Ok(_) => summary.exported += 1,
            Err(err) => error!("export of {} skipped: {err}", vtu.display()),
        }
    }
    bar.finish();

    info!("{:?}", summary);
    Ok(summary)
}

/// Generates every configured split, `<process_root>/<phase>` as scratch
/// space and `<final_root>/<phase>` as destination
pub fn run_phases<R: Rng + ?Sized>(
    config: &DatasetConfig,
    phases: &[Phase],
    process_root: &Path,
    final_root: &Path,
    log_file: Option<&Path>,
    rng: &mut R,
) -> Result<Vec<(String, DatasetSummary)>> {
    let mut summaries = Vec::with_capacity(phases.len());
    for phase in phases {
        info!(
            "phase {}: {} samples, shape {:?}, target faces {}, edges target {}",
            phase.name,
            phase.samples,
            config.generator.shape,
            config.generator.target_faces,
            config.generator.edges_target
        );
        let summary = generate_dataset(
            &process_root.join(&phase.name),
            &final_root.join(&phase.name),
            phase.samples,
            config,
            log_file,
            rng,
        )?;
        summaries.push((phase.name.clone(), summary));
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchParameters, GeneratorParameters, MeshParameters};
    use crate::datatypes::unit_cube_tet_mesh;
    use crate::mesh_io::scratch_dir;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fmt::Write;
    use std::time::Duration;

    fn write_msh(mesh: &TetMesh, path: &Path) {
        let mut text = String::from("$MeshFormat\n2.2 0 8\n$EndMeshFormat\n$Nodes\n");
        writeln!(text, "{}", mesh.nodes.len()).unwrap();
        for (i, node) in mesh.nodes.iter().enumerate() {
            let v = node.vertex;
            writeln!(text, "{} {} {} {}", i + 1, v.x, v.y, v.z).unwrap();
        }
        writeln!(text, "$EndNodes\n$Elements\n{}", mesh.elements.len()).unwrap();
        for (i, element) in mesh.elements.iter().enumerate() {
            let [a, b, c, d] = element.nodes.map(|n| n + 1);
            writeln!(text, "{} 4 2 0 1 {a} {b} {c} {d}", i + 1).unwrap();
        }
        text.push_str("$EndElements\n");
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn test_simulate_writes_collections() {
        let dir = scratch_dir("simulate");
        let msh = dir.join("4.msh");
        write_msh(&unit_cube_tet_mesh(2), &msh);

        let outputs = simulate(&msh, &dir, &SimulationParameters::default()).unwrap();
        assert_eq!(outputs.displacement, dir.join("4._Displacement000000.vtu"));
        for field in ["BoundaryMarker", "InherentStrain", "Displacement"] {
            assert!(dir.join(format!("4._{field}.pvd")).exists());
            assert!(dir.join(format!("4._{field}000000.vtu")).exists());
        }

        let markers = post_processor::read_vtu(&outputs.boundary_marker).unwrap();
        assert_eq!(markers.cells.len(), 48);
        let supported = markers
            .cell_array("boundary_marker")
            .unwrap()
            .values
            .iter()
            .filter(|m| **m == 1.0)
            .count();
        assert_eq!(supported, 8);

        let strain = post_processor::read_vtu(&outputs.inherent_strain).unwrap();
        let tensor = strain.cell_array("inherent_strain").unwrap();
        assert_eq!(tensor.components, 9);
        assert_eq!(&tensor.values[..9], &[-1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -0.5]);

        let exported = dir.join("final");
        std::fs::create_dir_all(&exported).unwrap();
        assert_eq!(
            post_processor::export_sample(&outputs.displacement, &exported).unwrap(),
            "4"
        );
        assert!(exported.join("4.txt").exists());
    }

    #[test]
    fn test_simulate_rejects_missing_mesh() {
        let dir = scratch_dir("simulate-missing");
        assert!(simulate(&dir.join("none.msh"), &dir, &SimulationParameters::default()).is_err());
    }

    #[test]
    fn test_generate_dataset_without_gmsh() {
        let dir = scratch_dir("dataset");
        let log = dir.join("Logs.log");
        std::fs::write(&log, "log line\n").unwrap();

        let config = DatasetConfig {
            generator: GeneratorParameters {
                height_min: 1.0,
                height_max: 2.0,
                max_edge_size: 0.5,
                target_faces: 100,
                edges_target: 150,
                ..GeneratorParameters::default()
            },
            mesher: MeshParameters {
                gmsh_path: PathBuf::from("/nonexistent/gmsh"),
                ..MeshParameters::default()
            },
            batch: BatchParameters {
                batch_size: 2,
                batch_delay: Duration::ZERO,
            },
            ..DatasetConfig::default()
        };
        let phases = [Phase {
            name: "validation".to_owned(),
            samples: 3,
        }];

        let mut rng = StdRng::seed_from_u64(3);
        let summaries = run_phases(
            &config,
            &phases,
            &dir.join("cubes_process"),
            &dir.join("cubes"),
            Some(&log),
            &mut rng,
        )
        .unwrap();

        let (name, summary) = &summaries[0];
        assert_eq!(name, "validation");
        assert!(summary.generated > 0);
        assert!(summary.generated <= 3);
        assert!(summary.filtered_out <= summary.generated);

        // every surface left behind passed the edge filter with its obj sibling
        let kept = list_files(&dir.join("cubes_process/validation"), ".stl").unwrap();
        assert_eq!(kept.len(), summary.generated - summary.filtered_out);
        for stl in &kept {
            let surface = crate::mesh_io::read_stl(stl).unwrap();
            assert_eq!(surface.unique_edge_count(), 150);
            assert!(surface.face_count() <= 100);
            assert!(stl.with_extension("obj").exists());
        }
        assert_eq!(summary.meshed, 0);
        assert_eq!(summary.simulated, 0);
        assert_eq!(summary.exported, 0);
        assert!(dir.join("cubes/validation/Logs.log").exists());
    }
}
