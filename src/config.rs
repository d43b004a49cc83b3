use std::path::{Path, PathBuf};
use std::time::Duration;

use json::JsonValue;
use nalgebra::Matrix3;

use crate::error::{Result, StrainsetError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Cube,
    Polygon,
}

impl ShapeKind {
    pub fn parse(name: &str) -> Result<ShapeKind> {
        match name {
            "cube" => Ok(ShapeKind::Cube),
            "polygon" => Ok(ShapeKind::Polygon),
            _ => Err(StrainsetError::Input(format!(
                "Unknown shape '{name}'. Expected cube or polygon"
            ))),
        }
    }
}

/// Parameters for the random shape generator
#[derive(Debug, Clone)]
pub struct GeneratorParameters {
    pub shape: ShapeKind,
    /// Amplitude of the per-vertex jitter added before decimation
    pub noise: f64,
    pub height_min: f64,
    pub height_max: f64,
    /// Longest edge allowed after subdivision, before decimation
    pub max_edge_size: f64,
    /// Face count after decimation
    pub target_faces: usize,
    /// Unique edge count a surface must have to be kept
    pub edges_target: usize,
    pub name_prefix: String,
}

impl Default for GeneratorParameters {
    fn default() -> Self {
        GeneratorParameters {
            shape: ShapeKind::Cube,
            noise: 0.005,
            height_min: 10.0,
            height_max: 30.0,
            max_edge_size: 1.4,
            target_faces: 2000,
            edges_target: 3000,
            name_prefix: String::new(),
        }
    }
}

/// Options forwarded to gmsh for tetrahedralization
#[derive(Debug, Clone)]
pub struct MeshParameters {
    /// 1 is Delaunay
    pub algorithm_3d: u32,
    pub characteristic_length_min: f64,
    pub characteristic_length_max: f64,
    pub optimize_netgen: bool,
    /// 2 is gamma ~ vol / sum_face / max_edge
    pub quality_type: u32,
    pub msh_file_version: f64,
    pub max_iter_delaunay_3d: u64,
    pub angle_tolerance_facet_overlap: f64,
    pub gmsh_path: PathBuf,
}

impl Default for MeshParameters {
    fn default() -> Self {
        MeshParameters {
            algorithm_3d: 1,
            characteristic_length_min: 0.01,
            characteristic_length_max: 15.0,
            optimize_netgen: false,
            quality_type: 2,
            msh_file_version: 2.2,
            max_iter_delaunay_3d: 2_155_000,
            angle_tolerance_facet_overlap: 0.05,
            gmsh_path: PathBuf::from("gmsh"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchParameters {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for BatchParameters {
    fn default() -> Self {
        BatchParameters {
            batch_size: 8,
            batch_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolver {
    Cholesky,
    ConjugateGradient,
}

impl LinearSolver {
    pub fn parse(name: &str) -> Result<LinearSolver> {
        match name {
            "cholesky" => Ok(LinearSolver::Cholesky),
            "conjugate-gradient" | "cg" => Ok(LinearSolver::ConjugateGradient),
            _ => Err(StrainsetError::Input(format!(
                "Unknown linear solver '{name}'. Expected cholesky or conjugate-gradient"
            ))),
        }
    }
}

/// Material, support and load of the inherent strain solve
#[derive(Debug, Clone)]
pub struct SimulationParameters {
    pub youngs_modulus: f64,
    pub poisson_ratio: f64,
    /// Rigidity of the penalty support
    pub support_stiffness: f64,
    /// Boundary facets entirely below this height are supports
    pub z_clamping_tolerance: f64,
    pub inherent_strain: Matrix3<f64>,
    pub linear_solver: LinearSolver,
    pub cg_max_iters: u64,
    pub cg_target_cost: f64,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        SimulationParameters {
            youngs_modulus: 1.0,
            poisson_ratio: 0.3,
            support_stiffness: 5.0,
            z_clamping_tolerance: 0.1,
            inherent_strain: Matrix3::from_diagonal(&nalgebra::Vector3::new(-1.0, -1.0, -0.5)),
            linear_solver: LinearSolver::Cholesky,
            cg_max_iters: 1e7 as u64,
            cg_target_cost: 1e-10,
        }
    }
}

impl SimulationParameters {
    pub fn lame_mu(&self) -> f64 {
        self.youngs_modulus / (2.0 * (1.0 + self.poisson_ratio))
    }

    pub fn lame_lambda(&self) -> f64 {
        let nu = self.poisson_ratio;
        self.youngs_modulus * nu / ((1.0 + nu) * (1.0 - 2.0 * nu))
    }
}

/// A dataset split and its sample count
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub name: String,
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub generator: GeneratorParameters,
    pub mesher: MeshParameters,
    pub batch: BatchParameters,
    pub simulation: SimulationParameters,
    pub phases: Vec<Phase>,
    pub seed: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            generator: GeneratorParameters::default(),
            mesher: MeshParameters::default(),
            batch: BatchParameters::default(),
            simulation: SimulationParameters::default(),
            phases: vec![
                Phase {
                    name: "train".to_owned(),
                    samples: 6000,
                },
                Phase {
                    name: "test".to_owned(),
                    samples: 2000,
                },
                Phase {
                    name: "validation".to_owned(),
                    samples: 500,
                },
            ],
            seed: None,
        }
    }
}

/// Loads the dataset configuration from a json file
///
/// # Arguments
/// * `config_file` - The path to the json file
///
/// # Returns
/// A validated DatasetConfig. Missing keys keep their defaults.
pub fn load_config(config_file: &Path) -> Result<DatasetConfig> {
    let contents = match std::fs::read_to_string(config_file) {
        Ok(c) => c,
        Err(_err) => {
            return Err(StrainsetError::Input(format!(
                "Unable to open config file {}",
                config_file.display()
            )))
        }
    };
    parse_config(&contents)
}

/// Parses and validates a json configuration string
pub fn parse_config(contents: &str) -> Result<DatasetConfig> {
    let root = match json::parse(contents) {
        Ok(r) => r,
        Err(err) => {
            return Err(StrainsetError::Input(format!(
                "Error in config file json: {err}"
            )))
        }
    };
    if !root.is_object() {
        return Err(StrainsetError::Input(
            "Config file must contain a json object".to_owned(),
        ));
    }

    let mut config = DatasetConfig::default();

    if root.has_key("generator") {
        parse_generator(&root["generator"], &mut config.generator)?;
    }
    if root.has_key("mesher") {
        parse_mesher(&root["mesher"], &mut config.mesher, &mut config.batch)?;
    }
    if root.has_key("simulation") {
        parse_simulation(&root["simulation"], &mut config.simulation)?;
    }
    if root.has_key("phases") {
        config.phases = parse_phases(&root["phases"])?;
    }
    if root.has_key("seed") {
        config.seed = Some(read_u64(&root, "config", "seed", 0)?);
    }

    config.validate()?;
    Ok(config)
}

fn read_f64(section: &JsonValue, section_name: &str, key: &str, default: f64) -> Result<f64> {
    if !section.has_key(key) {
        return Ok(default);
    }
    section[key].as_f64().ok_or_else(|| {
        StrainsetError::Input(format!("Bad value for {key} in {section_name}"))
    })
}

fn read_u64(section: &JsonValue, section_name: &str, key: &str, default: u64) -> Result<u64> {
    if !section.has_key(key) {
        return Ok(default);
    }
    section[key].as_u64().ok_or_else(|| {
        StrainsetError::Input(format!("Bad value for {key} in {section_name}"))
    })
}

fn read_str<'a>(
    section: &'a JsonValue,
    section_name: &str,
    key: &str,
) -> Result<Option<&'a str>> {
    if !section.has_key(key) {
        return Ok(None);
    }
    match section[key].as_str() {
        Some(s) => Ok(Some(s)),
        None => Err(StrainsetError::Input(format!(
            "Bad value for {key} in {section_name}"
        ))),
    }
}

fn parse_generator(section: &JsonValue, generator: &mut GeneratorParameters) -> Result<()> {
    let name = "generator";
    if let Some(shape) = read_str(section, name, "shape")? {
        generator.shape = ShapeKind::parse(shape)?;
    }
    generator.noise = read_f64(section, name, "noise", generator.noise)?;
    generator.height_min = read_f64(section, name, "height_min", generator.height_min)?;
    generator.height_max = read_f64(section, name, "height_max", generator.height_max)?;
    generator.max_edge_size = read_f64(section, name, "max_edge_size", generator.max_edge_size)?;
    generator.target_faces =
        read_u64(section, name, "target_faces", generator.target_faces as u64)? as usize;
    generator.edges_target =
        read_u64(section, name, "edges_target", generator.edges_target as u64)? as usize;
    if let Some(prefix) = read_str(section, name, "name_prefix")? {
        generator.name_prefix = prefix.to_owned();
    }
    Ok(())
}

fn parse_mesher(
    section: &JsonValue,
    mesher: &mut MeshParameters,
    batch: &mut BatchParameters,
) -> Result<()> {
    let name = "mesher";
    mesher.algorithm_3d = read_u64(section, name, "algorithm_3d", mesher.algorithm_3d as u64)? as u32;
    mesher.characteristic_length_min = read_f64(
        section,
        name,
        "characteristic_length_min",
        mesher.characteristic_length_min,
    )?;
    mesher.characteristic_length_max = read_f64(
        section,
        name,
        "characteristic_length_max",
        mesher.characteristic_length_max,
    )?;
    if section.has_key("optimize_netgen") {
        mesher.optimize_netgen = section["optimize_netgen"].as_bool().ok_or_else(|| {
            StrainsetError::Input("Bad value for optimize_netgen in mesher".to_owned())
        })?;
    }
    mesher.quality_type = read_u64(section, name, "quality_type", mesher.quality_type as u64)? as u32;
    mesher.msh_file_version =
        read_f64(section, name, "msh_file_version", mesher.msh_file_version)?;
    mesher.max_iter_delaunay_3d =
        read_u64(section, name, "max_iter_delaunay_3d", mesher.max_iter_delaunay_3d)?;
    mesher.angle_tolerance_facet_overlap = read_f64(
        section,
        name,
        "angle_tolerance_facet_overlap",
        mesher.angle_tolerance_facet_overlap,
    )?;
    if let Some(path) = read_str(section, name, "gmsh_path")? {
        mesher.gmsh_path = PathBuf::from(path);
    }

    batch.batch_size = read_u64(section, name, "batch_size", batch.batch_size as u64)? as usize;
    let delay = read_f64(
        section,
        name,
        "batch_delay_secs",
        batch.batch_delay.as_secs_f64(),
    )?;
    if delay < 0.0 || !delay.is_finite() {
        return Err(StrainsetError::Input(
            "batch_delay_secs in mesher must be a non-negative number".to_owned(),
        ));
    }
    batch.batch_delay = Duration::from_secs_f64(delay);
    Ok(())
}

fn parse_simulation(section: &JsonValue, simulation: &mut SimulationParameters) -> Result<()> {
    let name = "simulation";
    simulation.youngs_modulus =
        read_f64(section, name, "youngs_modulus", simulation.youngs_modulus)?;
    simulation.poisson_ratio = read_f64(section, name, "poisson_ratio", simulation.poisson_ratio)?;
    simulation.support_stiffness =
        read_f64(section, name, "support_stiffness", simulation.support_stiffness)?;
    simulation.z_clamping_tolerance = read_f64(
        section,
        name,
        "z_clamping_tolerance",
        simulation.z_clamping_tolerance,
    )?;
    if section.has_key("inherent_strain") {
        simulation.inherent_strain = parse_tensor(&section["inherent_strain"])?;
    }
    if let Some(solver) = read_str(section, name, "linear_solver")? {
        simulation.linear_solver = LinearSolver::parse(solver)?;
    }
    simulation.cg_max_iters = read_u64(section, name, "cg_max_iters", simulation.cg_max_iters)?;
    simulation.cg_target_cost =
        read_f64(section, name, "cg_target_cost", simulation.cg_target_cost)?;
    Ok(())
}

/// Reads a 3x3 row-major nested array
fn parse_tensor(value: &JsonValue) -> Result<Matrix3<f64>> {
    let bad_shape =
        || StrainsetError::Input("inherent_strain must be a 3x3 array of numbers".to_owned());

    if !value.is_array() || value.len() != 3 {
        return Err(bad_shape());
    }
    let mut tensor = Matrix3::zeros();
    for (i, row) in value.members().enumerate() {
        if !row.is_array() || row.len() != 3 {
            return Err(bad_shape());
        }
        for (j, entry) in row.members().enumerate() {
            tensor[(i, j)] = entry.as_f64().ok_or_else(bad_shape)?;
        }
    }
    Ok(tensor)
}

fn parse_phases(value: &JsonValue) -> Result<Vec<Phase>> {
    if !value.is_object() {
        return Err(StrainsetError::Input(
            "phases must map a phase name to its sample count".to_owned(),
        ));
    }
    let mut phases = Vec::new();
    for (name, samples) in value.entries() {
        let samples = samples.as_usize().ok_or_else(|| {
            StrainsetError::Input(format!("Bad sample count for phase {name}"))
        })?;
        phases.push(Phase {
            name: name.to_owned(),
            samples,
        });
    }
    Ok(phases)
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<()> {
        let g = &self.generator;
        if !(g.height_min > 0.0 && g.height_min <= g.height_max) {
            return Err(StrainsetError::Input(
                "generator height_min must be positive and not greater than height_max".to_owned(),
            ));
        }
        if g.noise < 0.0 {
            return Err(StrainsetError::Input(
                "generator noise must be non-negative".to_owned(),
            ));
        }
        if g.max_edge_size <= 0.0 {
            return Err(StrainsetError::Input(
                "generator max_edge_size must be positive".to_owned(),
            ));
        }
        if g.target_faces < 4 {
            return Err(StrainsetError::Input(
                "generator target_faces must be at least 4".to_owned(),
            ));
        }

        let m = &self.mesher;
        if m.characteristic_length_min <= 0.0
            || m.characteristic_length_min > m.characteristic_length_max
        {
            return Err(StrainsetError::Input(
                "mesher characteristic lengths must satisfy 0 < min <= max".to_owned(),
            ));
        }
        if self.batch.batch_size == 0 {
            return Err(StrainsetError::Input(
                "mesher batch_size must be at least 1".to_owned(),
            ));
        }

        let s = &self.simulation;
        if s.youngs_modulus <= 0.0 {
            return Err(StrainsetError::Input(
                "simulation youngs_modulus must be positive".to_owned(),
            ));
        }
        if !(s.poisson_ratio > -1.0 && s.poisson_ratio < 0.5) {
            return Err(StrainsetError::Input(
                "simulation poisson_ratio must lie in (-1, 0.5)".to_owned(),
            ));
        }
        if s.support_stiffness <= 0.0 {
            return Err(StrainsetError::Input(
                "simulation support_stiffness must be positive".to_owned(),
            ));
        }
        if s.cg_target_cost <= 0.0 {
            return Err(StrainsetError::Input(
                "simulation cg_target_cost must be positive".to_owned(),
            ));
        }

        for phase in &self.phases {
            if phase.name.is_empty() || phase.name.contains(['/', '\\']) {
                return Err(StrainsetError::Input(format!(
                    "Phase name '{}' is not a valid folder name",
                    phase.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_keeps_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.generator.noise, 0.005);
        assert_eq!(config.generator.max_edge_size, 1.4);
        assert_eq!(config.generator.target_faces, 2000);
        assert_eq!(config.generator.edges_target, 3000);
        assert_eq!(config.batch.batch_size, 8);
        assert_eq!(config.simulation.inherent_strain[(2, 2)], -0.5);
        assert_eq!(config.phases.len(), 3);
        assert_eq!(config.phases[2].name, "validation");
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_full_config() {
        let text = r#"{
            "seed": 7,
            "generator": { "shape": "polygon", "noise": 0.01, "target_faces": 500, "name_prefix": "p_" },
            "mesher": { "gmsh_path": "/opt/gmsh/bin/gmsh", "batch_size": 2, "batch_delay_secs": 0 },
            "simulation": {
                "poisson_ratio": 0.25,
                "support_stiffness": 1e8,
                "inherent_strain": [[-1, 0, 0], [0, -1, 0], [0, 0, -0.25]],
                "linear_solver": "cg"
            },
            "phases": { "train": 10, "test": 2 }
        }"#;
        let config = parse_config(text).unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.generator.shape, ShapeKind::Polygon);
        assert_eq!(config.generator.name_prefix, "p_");
        assert_eq!(config.mesher.gmsh_path, PathBuf::from("/opt/gmsh/bin/gmsh"));
        assert_eq!(config.batch.batch_size, 2);
        assert_eq!(config.batch.batch_delay, Duration::ZERO);
        assert_eq!(config.simulation.linear_solver, LinearSolver::ConjugateGradient);
        assert_eq!(config.simulation.inherent_strain[(2, 2)], -0.25);
        assert_eq!(
            config.phases,
            vec![
                Phase {
                    name: "train".to_owned(),
                    samples: 10
                },
                Phase {
                    name: "test".to_owned(),
                    samples: 2
                },
            ]
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse_config(r#"{"simulation": {"poisson_ratio": 0.5}}"#).is_err());
        assert!(parse_config(r#"{"simulation": {"inherent_strain": [[1, 0], [0, 1]]}}"#).is_err());
        assert!(parse_config(r#"{"generator": {"height_min": 40}}"#).is_err());
        assert!(parse_config(r#"{"generator": {"noise": "loud"}}"#).is_err());
        assert!(parse_config(r#"{"mesher": {"batch_size": 0}}"#).is_err());
        assert!(parse_config(r#"{"generator": {"shape": "sphere"}}"#).is_err());
        assert!(parse_config("[1, 2]").is_err());
    }

    #[test]
    fn test_lame_parameters() {
        let params = SimulationParameters::default();
        approx::assert_relative_eq!(params.lame_mu(), 1.0 / 2.6, epsilon = 1e-12);
        approx::assert_relative_eq!(params.lame_lambda(), 0.3 / (1.3 * 0.4), epsilon = 1e-12);
    }
}
