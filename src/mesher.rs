use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use indicatif::ProgressBar;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    config::{BatchParameters, MeshParameters},
    datatypes::{Element, Node, TetMesh, Vertex},
    error::{Result, StrainsetError},
};

/// Gmsh element type codes
const GMSH_TRIANGLE: usize = 2;
const GMSH_TETRAHEDRON: usize = 4;

pub const REPORT_FILE: &str = "report.txt";

enum MeshParseState {
    Format,
    Nodes,
    Elements,
    Limbo,
}

/// Builds a .geo script that turns a closed stl surface into one volume
///
/// # Arguments
/// * `stl_file` - The surface to merge
/// * `params` - Gmsh meshing options
/// * `output_file` - The output .geo file
pub fn build_geo(stl_file: &Path, params: &MeshParameters, output_file: &Path) -> Result<()> {
    let stl_file = stl_file
        .canonicalize()
        .map_err(|err| StrainsetError::io(stl_file, err))?;

    let mut geo_file = std::fs::File::create(output_file)
        .map_err(|err| StrainsetError::io(output_file, err))?;

    write!(
        geo_file,
        "// Define Mesh Settings\n\
        Mesh.Algorithm3D = {algorithm};\n\
        Mesh.CharacteristicLengthMin = {cl_min};\n\
        Mesh.CharacteristicLengthMax = {cl_max};\n\
        Mesh.OptimizeNetgen = {netgen};\n\
        Mesh.QualityType = {quality};\n\
        Mesh.MshFileVersion = {version};\n\
        Mesh.MaxIterDelaunay3D = {iterations};\n\
        Mesh.AngleToleranceFacetOverlap = {angle_tol};\n\
        \n\
        // Capture the surface\n\
        Merge \"{stl}\";\n\
        \n\
        // Close it into a volume\n\
        Surface Loop(1) = Surface{{:}};\n\
        Volume(1) = {{1}};\n",
        algorithm = params.algorithm_3d,
        cl_min = params.characteristic_length_min,
        cl_max = params.characteristic_length_max,
        netgen = params.optimize_netgen as u8,
        quality = params.quality_type,
        version = params.msh_file_version,
        iterations = params.max_iter_delaunay_3d,
        angle_tol = params.angle_tolerance_facet_overlap,
        stl = stl_file.display().to_string().replace('\\', "/"),
    )
    .map_err(|err| StrainsetError::io(output_file, err))?;

    Ok(())
}

/// First line gmsh reported as an error, if any
fn gmsh_error_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("Error"))
}

/// Runs Gmsh to create a tetrahedral mesh from a closed stl surface
///
/// # Arguments
/// * `stl_file` - The input surface
/// * `output` - The output filepath of the .msh file
/// * `params` - Gmsh meshing options
pub fn compute_mesh(stl_file: &Path, output: &Path, params: &MeshParameters) -> Result<()> {
    let geo_filepath = output.with_extension("geo");
    build_geo(stl_file, params, &geo_filepath)?;

    debug!("running gmsh on {}", stl_file.display());
    let result = std::process::Command::new(&params.gmsh_path)
        .arg(&geo_filepath)
        .arg("-3")
        .arg("-nopopup")
        .arg("-o")
        .arg(output)
        .output();

    if let Err(err) = std::fs::remove_file(&geo_filepath) {
        warn!("unable to delete {}: {err}", geo_filepath.display());
    }

    let out = match result {
        Ok(out) => out,
        Err(err) => {
            return Err(StrainsetError::Mesher(format!(
                "Gmsh failed to start ({}): {err}",
                params.gmsh_path.display()
            )));
        }
    };

    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    if let Some(line) = gmsh_error_line(&stdout).or_else(|| gmsh_error_line(&stderr)) {
        return Err(StrainsetError::Mesher(line.to_owned()));
    }
    if !out.status.success() {
        return Err(StrainsetError::Mesher(format!(
            "Gmsh exited with {}",
            out.status
        )));
    }
    if !output.exists() {
        return Err(StrainsetError::Mesher(format!(
            "Gmsh did not write {}",
            output.display()
        )));
    }

    Ok(())
}

fn parse_numbers<T: std::str::FromStr>(line: &str, what: &str) -> Result<Vec<T>> {
    line.split_whitespace()
        .map(|i| {
            i.parse().map_err(|_| {
                StrainsetError::Mesher(format!("Unexpected value '{i}' in mesh {what}"))
            })
        })
        .collect()
}

fn next_line<'a>(lines: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<&'a str> {
    lines
        .next()
        .ok_or_else(|| StrainsetError::Mesher(format!("Mesh file ends inside {what}")))
}

/// Parses a .msh file into a tetrahedral mesh
///
/// # Arguments
/// * `mesh_file` - The path to the mesh file
///
/// # Returns
/// The parsed mesh with node tags renumbered densely from zero
pub fn parse_mesh(mesh_file: &Path) -> Result<TetMesh> {
    let mesh_contents = match std::fs::read_to_string(mesh_file) {
        Ok(c) => c,
        Err(err) => {
            return Err(StrainsetError::Mesher(format!(
                "Unable to open mesh file {}: {err}",
                mesh_file.display()
            )))
        }
    };
    let mesh = parse_mesh_str(&mesh_contents)?;

    info!(
        "loaded {} nodes and {} elements from {}",
        mesh.nodes.len(),
        mesh.elements.len(),
        mesh_file.display()
    );
    Ok(mesh)
}

/// Parses the ascii contents of a gmsh 2.2 or 4.x mesh
pub fn parse_mesh_str(mesh_contents: &str) -> Result<TetMesh> {
    let mut parser_state = MeshParseState::Limbo;
    let mut version: Option<u32> = None;
    let mut lines = mesh_contents.lines().map(str::trim);

    let mut vertices: Vec<Vertex> = Vec::new();
    let mut tag_to_index: HashMap<usize, usize> = HashMap::new();
    let mut tets_by_tag: Vec<[usize; 4]> = Vec::new();
    let mut surface_triangles = 0;

    while let Some(line) = lines.next() {
        if line.is_empty() {
            continue;
        }

        if line.starts_with("$End") {
            parser_state = MeshParseState::Limbo;
            continue;
        }

        match parser_state {
            MeshParseState::Limbo => {
                if line.starts_with("$MeshFormat") {
                    parser_state = MeshParseState::Format;
                } else if line.starts_with("$Nodes") {
                    parser_state = MeshParseState::Nodes;
                } else if line.starts_with("$Elements") {
                    parser_state = MeshParseState::Elements;
                }
                continue;
            }
            MeshParseState::Format => {
                let major = line.split(['.', ' ']).next().unwrap_or_default();
                version = Some(major.parse().map_err(|_| {
                    StrainsetError::Mesher(format!("Unreadable mesh format '{line}'"))
                })?);
                if line.split_whitespace().nth(1) != Some("0") {
                    return Err(StrainsetError::Mesher(
                        "Only ascii .msh files are supported".to_owned(),
                    ));
                }
            }
            MeshParseState::Nodes => match version {
                Some(2) => {
                    let count: usize = line.parse().map_err(|_| {
                        StrainsetError::Mesher(format!("Bad node count '{line}'"))
                    })?;
                    for _ in 0..count {
                        let data: Vec<f64> = parse_numbers(next_line(&mut lines, "$Nodes")?, "nodes")?;
                        if data.len() < 4 {
                            return Err(StrainsetError::Mesher("Short node record".to_owned()));
                        }
                        tag_to_index.insert(data[0] as usize, vertices.len());
                        vertices.push(Vertex::new(data[1], data[2], data[3]));
                    }
                    // the section is fully consumed
                    parser_state = MeshParseState::Limbo;
                }
                Some(4) => {
                    // numEntityBlocks numNodes minNodeTag maxNodeTag
                    let header: Vec<usize> = parse_numbers(line, "nodes")?;
                    let blocks = *header.first().ok_or_else(|| {
                        StrainsetError::Mesher("Empty $Nodes header".to_owned())
                    })?;
                    for _ in 0..blocks {
                        // entityDim entityTag parametric numNodesInBlock
                        let block: Vec<usize> =
                            parse_numbers(next_line(&mut lines, "$Nodes")?, "nodes")?;
                        if block.len() < 4 {
                            return Err(StrainsetError::Mesher("Short node block".to_owned()));
                        }
                        if block[2] != 0 {
                            return Err(StrainsetError::Mesher(
                                "Parametric node coordinates are not supported".to_owned(),
                            ));
                        }
                        let num_nodes_local = block[3];

                        let mut node_tags: Vec<usize> = Vec::with_capacity(num_nodes_local);
                        for _ in 0..num_nodes_local {
                            let tag: Vec<usize> =
                                parse_numbers(next_line(&mut lines, "$Nodes")?, "node tags")?;
                            node_tags.extend(tag);
                        }
                        for tag in node_tags {
                            let coords: Vec<f64> =
                                parse_numbers(next_line(&mut lines, "$Nodes")?, "coordinates")?;
                            if coords.len() < 3 {
                                return Err(StrainsetError::Mesher(
                                    "Short node coordinates".to_owned(),
                                ));
                            }
                            tag_to_index.insert(tag, vertices.len());
                            vertices.push(Vertex::new(coords[0], coords[1], coords[2]));
                        }
                    }
                    parser_state = MeshParseState::Limbo;
                }
                _ => {
                    return Err(StrainsetError::Mesher(
                        "Missing or unsupported $MeshFormat before $Nodes".to_owned(),
                    ))
                }
            },
            MeshParseState::Elements => match version {
                Some(2) => {
                    let count: usize = line.parse().map_err(|_| {
                        StrainsetError::Mesher(format!("Bad element count '{line}'"))
                    })?;
                    for _ in 0..count {
                        // tag type numTags tags... nodes...
                        let data: Vec<usize> =
                            parse_numbers(next_line(&mut lines, "$Elements")?, "elements")?;
                        if data.len() < 3 {
                            return Err(StrainsetError::Mesher("Short element record".to_owned()));
                        }
                        let node_start = 3 + data[2];
                        match data[1] {
                            GMSH_TETRAHEDRON if data.len() >= node_start + 4 => {
                                tets_by_tag.push([
                                    data[node_start],
                                    data[node_start + 1],
                                    data[node_start + 2],
                                    data[node_start + 3],
                                ]);
                            }
                            GMSH_TRIANGLE => surface_triangles += 1,
                            GMSH_TETRAHEDRON => {
                                return Err(StrainsetError::Mesher(
                                    "Tetrahedron with fewer than 4 nodes".to_owned(),
                                ))
                            }
                            _ => continue,
                        }
                    }
                    parser_state = MeshParseState::Limbo;
                }
                Some(4) => {
                    // numEntityBlocks numElements minElementTag maxElementTag
                    let header: Vec<usize> = parse_numbers(line, "elements")?;
                    let blocks = *header.first().ok_or_else(|| {
                        StrainsetError::Mesher("Empty $Elements header".to_owned())
                    })?;
                    for _ in 0..blocks {
                        // entityDim entityTag elementType numElementsInBlock
                        let block: Vec<usize> =
                            parse_numbers(next_line(&mut lines, "$Elements")?, "elements")?;
                        if block.len() < 4 {
                            return Err(StrainsetError::Mesher("Short element block".to_owned()));
                        }
                        let element_type = block[2];
                        for _ in 0..block[3] {
                            let data: Vec<usize> =
                                parse_numbers(next_line(&mut lines, "$Elements")?, "elements")?;
                            match element_type {
                                GMSH_TETRAHEDRON if data.len() >= 5 => {
                                    tets_by_tag.push([data[1], data[2], data[3], data[4]]);
                                }
                                GMSH_TRIANGLE => surface_triangles += 1,
                                GMSH_TETRAHEDRON => {
                                    return Err(StrainsetError::Mesher(
                                        "Tetrahedron with fewer than 4 nodes".to_owned(),
                                    ))
                                }
                                _ => continue,
                            }
                        }
                    }
                    parser_state = MeshParseState::Limbo;
                }
                _ => {
                    return Err(StrainsetError::Mesher(
                        "Missing or unsupported $MeshFormat before $Elements".to_owned(),
                    ))
                }
            },
        }
    }

    let mut elements: Vec<Element> = Vec::with_capacity(tets_by_tag.len());
    for tet in tets_by_tag {
        let mut nodes = [0usize; 4];
        for (slot, tag) in nodes.iter_mut().zip(tet) {
            *slot = *tag_to_index.get(&tag).ok_or_else(|| {
                StrainsetError::Mesher(format!("Element references unknown node {tag}"))
            })?;
        }
        elements.push(Element {
            nodes,
            stress: None,
        });
    }

    Ok(TetMesh {
        nodes: vertices.into_iter().map(Node::new).collect(),
        elements,
        surface_triangles,
    })
}

/// Appends a timestamped problem line to the report file
///
/// # Arguments
/// * `file` - The input that failed
/// * `problem` - What went wrong
/// * `report_file` - The text report to append to
pub fn report(file: &str, problem: &str, report_file: &Path) -> Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut out = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(report_file)
        .map_err(|err| StrainsetError::io(report_file, err))?;
    writeln!(out, "{timestamp} The file {file} has the problem: {problem}")
        .map_err(|err| StrainsetError::io(report_file, err))
}

/// Lists the .stl files of a folder, sorted by name
pub fn list_stl_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(folder).map_err(|err| StrainsetError::io(folder, err))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("stl"))
        .collect();
    files.sort();
    Ok(files)
}

/// Counts the .stl inputs of a folder and logs it
pub fn count_stl_files(folder: &Path) -> Result<usize> {
    let count = list_stl_files(folder)?.len();
    info!("there are {count} .stl files inside {}", folder.display());
    Ok(count)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub meshed: usize,
    pub failed: usize,
}

/// Meshes every .stl of a folder into a sibling .msh. Files are processed in
/// batches of `batch.batch_size` on a pool of as many threads, with a pause
/// between batches. Failures are appended to `report.txt` in the folder.
///
/// # Arguments
/// * `folder` - The folder holding the .stl files
/// * `params` - Gmsh meshing options
/// * `batch` - Batch size and pause
pub fn run_batch(
    folder: &Path,
    params: &MeshParameters,
    batch: &BatchParameters,
) -> Result<BatchSummary> {
    let files = list_stl_files(folder)?;
    info!("there are {} .stl files inside {}", files.len(), folder.display());
    let report_file = folder.join(REPORT_FILE);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(batch.batch_size)
        .build()
        .map_err(|err| StrainsetError::Mesher(format!("Unable to build worker pool: {err}")))?;

    let start = Instant::now();
    let mut summary = BatchSummary::default();
    let bar = ProgressBar::new(files.len() as u64);

    let chunks: Vec<&[PathBuf]> = files.chunks(batch.batch_size).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        debug!("batch {} of {}: {:?}", i + 1, chunks.len(), chunk);

        let results: Vec<(&PathBuf, Result<()>)> = pool.install(|| {
            chunk
                .par_iter()
                .map(|stl| (stl, compute_mesh(stl, &stl.with_extension("msh"), params)))
                .collect()
        });

        for (stl, result) in results {
            bar.inc(1);
            match result {
                Ok(()) => summary.meshed += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!("{} has a problem: {err}", stl.display());
                    let name = stl
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    report(&name, &err.to_string(), &report_file)?;
                }
            }
        }

        if i + 1 < chunks.len() && !batch.batch_delay.is_zero() {
            std::thread::sleep(batch.batch_delay);
        }
    }
    bar.finish();

    info!(
        "meshed {} files ({} failed) in {:.1} seconds",
        summary.meshed,
        summary.failed,
        start.elapsed().as_secs_f32()
    );
    Ok(summary)
}
