use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use nalgebra::Vector3;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::{debug, error, info};

use crate::{
    datatypes::{SurfaceMesh, TetMesh, Vertex},
    error::{Result, StrainsetError},
    filter, mesh_io,
};

pub const VTK_TRIANGLE: u8 = 5;
pub const VTK_TETRA: u8 = 10;
/// Suffix of the first (and only) piece of a pvd collection
pub const PIECE_SUFFIX: &str = "000000";
/// Exported file stems that are not samples
const SKIPPED_STEMS: [&str; 2] = ["label_extract", "results"];

/// A named array attached to points or cells
#[derive(Debug, Clone, PartialEq)]
pub struct DataArray {
    pub name: String,
    pub components: usize,
    pub values: Vec<f64>,
}

impl DataArray {
    pub fn vectors(name: &str, vectors: &[Vector3<f64>]) -> DataArray {
        DataArray {
            name: name.to_owned(),
            components: 3,
            values: vectors.iter().flat_map(|v| [v.x, v.y, v.z]).collect(),
        }
    }

    pub fn scalars(name: &str, values: Vec<f64>) -> DataArray {
        DataArray {
            name: name.to_owned(),
            components: 1,
            values,
        }
    }

    /// Number of tuples held by the array
    pub fn tuple_count(&self) -> usize {
        self.values.len() / self.components.max(1)
    }

    /// Values read back as 3-vectors, or None when not three components wide
    pub fn as_vectors(&self) -> Option<Vec<Vector3<f64>>> {
        if self.components != 3 {
            return None;
        }
        Some(
            self.values
                .chunks_exact(3)
                .map(|c| Vector3::new(c[0], c[1], c[2]))
                .collect(),
        )
    }
}

/// In-memory form of a vtk unstructured grid piece
#[derive(Debug, Clone, Default)]
pub struct UnstructuredGrid {
    pub points: Vec<Vertex>,
    pub cells: Vec<Vec<usize>>,
    pub cell_types: Vec<u8>,
    pub point_data: Vec<DataArray>,
    pub cell_data: Vec<DataArray>,
}

impl UnstructuredGrid {
    /// Grid of the tetrahedra of a mesh
    pub fn from_tet_mesh(mesh: &TetMesh) -> UnstructuredGrid {
        UnstructuredGrid {
            points: mesh.nodes.iter().map(|n| n.vertex).collect(),
            cells: mesh.elements.iter().map(|e| e.nodes.to_vec()).collect(),
            cell_types: vec![VTK_TETRA; mesh.elements.len()],
            ..UnstructuredGrid::default()
        }
    }

    pub fn point_array(&self, name: &str) -> Option<&DataArray> {
        self.point_data.iter().find(|a| a.name == name)
    }

    pub fn cell_array(&self, name: &str) -> Option<&DataArray> {
        self.cell_data.iter().find(|a| a.name == name)
    }

    /// Tetrahedral part of the grid; other cell types are ignored
    pub fn to_tet_mesh(&self) -> TetMesh {
        let tets = self
            .cells
            .iter()
            .zip(&self.cell_types)
            .filter(|(cell, kind)| **kind == VTK_TETRA && cell.len() == 4)
            .map(|(cell, _)| [cell[0], cell[1], cell[2], cell[3]])
            .collect();
        TetMesh::new(self.points.clone(), tets)
    }
}

fn xml_error(path: &Path, err: impl std::fmt::Display) -> StrainsetError {
    StrainsetError::PostProcessor(format!("Failed to write {}: {err}", path.display()))
}

fn join<T: ToString>(values: impl Iterator<Item = T>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

fn write_data_array<W: Write>(
    writer: &mut Writer<W>,
    name: Option<&str>,
    kind: &str,
    components: usize,
    text: &str,
) -> std::result::Result<(), quick_xml::Error> {
    let mut start = BytesStart::new("DataArray");
    start.push_attribute(("type", kind));
    if let Some(name) = name {
        start.push_attribute(("Name", name));
    }
    if components > 1 {
        start.push_attribute(("NumberOfComponents", components.to_string().as_str()));
    }
    start.push_attribute(("format", "ascii"));

    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new("DataArray")))?;
    Ok(())
}

/// Writes an ascii `.vtu` unstructured grid
///
/// # Arguments
/// * `grid` - The grid with its point and cell data
/// * `path` - Output file
pub fn write_vtu(grid: &UnstructuredGrid, path: &Path) -> Result<()> {
    if grid.cells.len() != grid.cell_types.len() {
        return Err(StrainsetError::PostProcessor(format!(
            "{} cells but {} cell types",
            grid.cells.len(),
            grid.cell_types.len()
        )));
    }
    for array in &grid.point_data {
        if array.tuple_count() != grid.points.len() {
            return Err(StrainsetError::PostProcessor(format!(
                "Point array {} has {} tuples for {} points",
                array.name,
                array.tuple_count(),
                grid.points.len()
            )));
        }
    }
    for array in &grid.cell_data {
        if array.tuple_count() != grid.cells.len() {
            return Err(StrainsetError::PostProcessor(format!(
                "Cell array {} has {} tuples for {} cells",
                array.name,
                array.tuple_count(),
                grid.cells.len()
            )));
        }
    }

    let file = File::create(path).map_err(|err| StrainsetError::io(path, err))?;
    let mut writer = Writer::new_with_indent(BufWriter::new(file), b' ', 2);

    let mut write = || -> std::result::Result<(), quick_xml::Error> {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))?;

        let mut root = BytesStart::new("VTKFile");
        root.push_attribute(("type", "UnstructuredGrid"));
        root.push_attribute(("version", "0.1"));
        root.push_attribute(("byte_order", "LittleEndian"));
        writer.write_event(Event::Start(root))?;
        writer.write_event(Event::Start(BytesStart::new("UnstructuredGrid")))?;

        let mut piece = BytesStart::new("Piece");
        piece.push_attribute(("NumberOfPoints", grid.points.len().to_string().as_str()));
        piece.push_attribute(("NumberOfCells", grid.cells.len().to_string().as_str()));
        writer.write_event(Event::Start(piece))?;

        writer.write_event(Event::Start(BytesStart::new("Points")))?;
        let points = join(grid.points.iter().flat_map(|p| [p.x, p.y, p.z]));
        write_data_array(&mut writer, None, "Float64", 3, &points)?;
        writer.write_event(Event::End(BytesEnd::new("Points")))?;

        writer.write_event(Event::Start(BytesStart::new("Cells")))?;
        let connectivity = join(grid.cells.iter().flatten());
        write_data_array(&mut writer, Some("connectivity"), "Int64", 1, &connectivity)?;
        let offsets = join(grid.cells.iter().scan(0, |offset, cell| {
            *offset += cell.len();
            Some(*offset)
        }));
        write_data_array(&mut writer, Some("offsets"), "Int64", 1, &offsets)?;
        let types = join(grid.cell_types.iter());
        write_data_array(&mut writer, Some("types"), "UInt8", 1, &types)?;
        writer.write_event(Event::End(BytesEnd::new("Cells")))?;

        for (tag, arrays) in [("PointData", &grid.point_data), ("CellData", &grid.cell_data)] {
            if arrays.is_empty() {
                continue;
            }
            writer.write_event(Event::Start(BytesStart::new(tag)))?;
            for array in arrays.iter() {
                write_data_array(
                    &mut writer,
                    Some(&array.name),
                    "Float64",
                    array.components,
                    &join(array.values.iter()),
                )?;
            }
            writer.write_event(Event::End(BytesEnd::new(tag)))?;
        }

        writer.write_event(Event::End(BytesEnd::new("Piece")))?;
        writer.write_event(Event::End(BytesEnd::new("UnstructuredGrid")))?;
        writer.write_event(Event::End(BytesEnd::new("VTKFile")))?;
        Ok(())
    };
    write().map_err(|err| xml_error(path, err))?;

    writer
        .into_inner()
        .flush()
        .map_err(|err| StrainsetError::io(path, err))
}

/// Writes a `.pvd` collection pointing at a single piece at time 0
pub fn write_pvd(piece_file: &str, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|err| StrainsetError::io(path, err))?;
    let mut writer = Writer::new_with_indent(BufWriter::new(file), b' ', 2);

    let mut write = || -> std::result::Result<(), quick_xml::Error> {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))?;
        let mut root = BytesStart::new("VTKFile");
        root.push_attribute(("type", "Collection"));
        root.push_attribute(("version", "0.1"));
        writer.write_event(Event::Start(root))?;
        writer.write_event(Event::Start(BytesStart::new("Collection")))?;

        let mut dataset = BytesStart::new("DataSet");
        dataset.push_attribute(("timestep", "0"));
        dataset.push_attribute(("part", "0"));
        dataset.push_attribute(("file", piece_file));
        writer.write_event(Event::Empty(dataset))?;

        writer.write_event(Event::End(BytesEnd::new("Collection")))?;
        writer.write_event(Event::End(BytesEnd::new("VTKFile")))?;
        Ok(())
    };
    write().map_err(|err| xml_error(path, err))?;

    writer
        .into_inner()
        .flush()
        .map_err(|err| StrainsetError::io(path, err))
}

/// Writes `<stem>.pvd` and its `<stem>000000.vtu` piece in `folder`
///
/// # Returns
/// The path of the written piece
pub fn write_collection(grid: &UnstructuredGrid, folder: &Path, stem: &str) -> Result<PathBuf> {
    let piece_name = format!("{stem}{PIECE_SUFFIX}.vtu");
    let piece_path = folder.join(&piece_name);
    write_vtu(grid, &piece_path)?;
    write_pvd(&piece_name, &folder.join(format!("{stem}.pvd")))?;
    Ok(piece_path)
}

fn vtu_error(path: &Path, msg: impl std::fmt::Display) -> StrainsetError {
    StrainsetError::Input(format!("{}: {msg}", path.display()))
}

fn parse_values<T: std::str::FromStr>(node: roxmltree::Node, path: &Path) -> Result<Vec<T>> {
    if let Some(format) = node.attribute("format") {
        if format != "ascii" {
            return Err(vtu_error(
                path,
                format!("Only ascii data arrays are supported, found {format}"),
            ));
        }
    }
    node.text()
        .unwrap_or_default()
        .split_whitespace()
        .map(|t| {
            t.parse()
                .map_err(|_| vtu_error(path, format!("Bad value {t} in data array")))
        })
        .collect()
}

fn parse_arrays(parent: Option<roxmltree::Node>, path: &Path) -> Result<Vec<DataArray>> {
    let Some(parent) = parent else {
        return Ok(Vec::new());
    };
    parent
        .children()
        .filter(|n| n.has_tag_name("DataArray"))
        .map(|n| {
            Ok(DataArray {
                name: n.attribute("Name").unwrap_or_default().to_owned(),
                components: n
                    .attribute("NumberOfComponents")
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(1),
                values: parse_values(n, path)?,
            })
        })
        .collect()
}

/// Reads an ascii `.vtu` unstructured grid
pub fn read_vtu(path: &Path) -> Result<UnstructuredGrid> {
    let contents = std::fs::read_to_string(path).map_err(|err| StrainsetError::io(path, err))?;
    let document = roxmltree::Document::parse(&contents).map_err(|err| vtu_error(path, err))?;

    let piece = document
        .descendants()
        .find(|n| n.has_tag_name("Piece"))
        .ok_or_else(|| vtu_error(path, "Missing Piece element"))?;
    let child = |name: &str| piece.children().find(|n| n.has_tag_name(name));

    let coordinates: Vec<f64> = match child("Points")
        .and_then(|p| p.children().find(|n| n.has_tag_name("DataArray")))
    {
        Some(array) => parse_values(array, path)?,
        None => return Err(vtu_error(path, "Missing Points")),
    };
    let points: Vec<Vertex> = coordinates
        .chunks_exact(3)
        .map(|c| Vertex::new(c[0], c[1], c[2]))
        .collect();

    let cells_node = child("Cells").ok_or_else(|| vtu_error(path, "Missing Cells"))?;
    let cell_array = |name: &str| -> Result<Vec<usize>> {
        match cells_node
            .children()
            .find(|n| n.has_tag_name("DataArray") && n.attribute("Name") == Some(name))
        {
            Some(array) => parse_values(array, path),
            None => Err(vtu_error(path, format!("Missing cell array {name}"))),
        }
    };
    let connectivity = cell_array("connectivity")?;
    let offsets = cell_array("offsets")?;
    let cell_types: Vec<u8> = cell_array("types")?.into_iter().map(|t| t as u8).collect();

    let mut cells = Vec::with_capacity(offsets.len());
    let mut start = 0;
    for &end in &offsets {
        if end < start || end > connectivity.len() {
            return Err(vtu_error(path, "Cell offsets out of range"));
        }
        let cell = connectivity[start..end].to_vec();
        if cell.iter().any(|&i| i >= points.len()) {
            return Err(vtu_error(path, "Cell refers to a missing point"));
        }
        cells.push(cell);
        start = end;
    }
    if cells.len() != cell_types.len() {
        return Err(vtu_error(path, "Cell types do not match the cells"));
    }

    Ok(UnstructuredGrid {
        points,
        cells,
        cell_types,
        point_data: parse_arrays(child("PointData"), path)?,
        cell_data: parse_arrays(child("CellData"), path)?,
    })
}

/// Extracts the outer surface of the tetrahedra in a grid
///
/// # Arguments
/// * `grid` - Grid holding tetrahedra and optionally point data
/// * `label` - Name of the 3 component point array carried to the surface
///
/// # Returns
/// The surface, with points compacted in ascending input order, and the
/// label of each surface point
pub fn extract_surface(
    grid: &UnstructuredGrid,
    label: &str,
) -> Result<(SurfaceMesh, Vec<Vector3<f64>>)> {
    let labels = grid
        .point_array(label)
        .and_then(DataArray::as_vectors)
        .ok_or_else(|| {
            StrainsetError::PostProcessor(format!("Missing 3 component point array {label}"))
        })?;
    if labels.len() != grid.points.len() {
        return Err(StrainsetError::PostProcessor(format!(
            "Point array {label} does not match the points"
        )));
    }

    let faces = grid.to_tet_mesh().exterior_faces();
    if faces.is_empty() {
        return Err(StrainsetError::PostProcessor(
            "Grid has no tetrahedra to extract a surface from".to_owned(),
        ));
    }

    let mut surface = SurfaceMesh::new(grid.points.clone(), faces);
    let mut used = vec![false; grid.points.len()];
    for face in &surface.faces {
        for &i in face {
            used[i] = true;
        }
    }
    surface.remove_unreferenced_vertices();
    let surface_labels: Vec<Vector3<f64>> = labels
        .into_iter()
        .zip(used)
        .filter_map(|(label, used)| used.then_some(label))
        .collect();

    Ok((surface, surface_labels))
}

/// Sample name of a result piece: the file name up to the first `._`
pub fn sample_name(vtu_file: &Path) -> Result<String> {
    let file_name = vtu_file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StrainsetError::Input(format!("Bad file name {}", vtu_file.display())))?;
    Ok(match file_name.split_once("._") {
        Some((name, _)) => name.to_owned(),
        None => file_name.trim_end_matches(".vtu").to_owned(),
    })
}

/// Converts a displacement piece into the dataset files of one sample:
/// `<name>.vtk`, `<name>.stl` (ascii), `<name>.txt` and `<name>.obj`
///
/// # Arguments
/// * `vtu_file` - A `<name>._Displacement000000.vtu` piece
/// * `final_path` - Destination folder
///
/// # Returns
/// The sample name
pub fn export_sample(vtu_file: &Path, final_path: &Path) -> Result<String> {
    let name = sample_name(vtu_file)?;
    let grid = read_vtu(vtu_file)?;
    let (surface, displacement) = extract_surface(&grid, "displacement")?;

    let target = final_path.join(&name);
    mesh_io::write_vtk(&surface, Some(&displacement), &target.with_extension("vtk"))?;
    mesh_io::write_stl_ascii(&surface, &target.with_extension("stl"))?;
    mesh_io::write_displacement_txt(&displacement, &target.with_extension("txt"))?;
    mesh_io::write_obj(&surface, &target.with_extension("obj"))?;

    debug!(
        "exported {name} with {} points and {} faces",
        surface.vertices.len(),
        surface.faces.len()
    );
    Ok(name)
}

fn has_directed_edge(face: &[usize; 3], a: usize, b: usize) -> bool {
    (0..3).any(|i| face[i] == a && face[(i + 1) % 3] == b)
}

/// Makes face winding consistent within every connected component and
/// orients each closed component outward
///
/// # Returns
/// How many faces were flipped
pub fn fix_normals(mesh: &mut SurfaceMesh) -> usize {
    let mut edge_faces: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
    for (f, face) in mesh.faces.iter().enumerate() {
        for i in 0..3 {
            let (a, b) = (face[i], face[(i + 1) % 3]);
            edge_faces.entry((a.min(b), a.max(b))).or_default().push(f);
        }
    }

    let mut flipped = vec![false; mesh.faces.len()];
    let mut visited = vec![false; mesh.faces.len()];
    for seed in 0..mesh.faces.len() {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;
        let mut component = vec![seed];
        let mut queue = VecDeque::from([seed]);

        while let Some(f) = queue.pop_front() {
            let face = mesh.faces[f];
            for i in 0..3 {
                let (a, b) = (face[i], face[(i + 1) % 3]);
                let Some(neighbors) = edge_faces.get(&(a.min(b), a.max(b))) else {
                    continue;
                };
                for &g in neighbors {
                    if visited[g] {
                        continue;
                    }
                    // a neighbor sharing the edge in the same direction is inverted
                    if has_directed_edge(&mesh.faces[g], a, b) {
                        mesh.faces[g].swap(1, 2);
                        flipped[g] = !flipped[g];
                    }
                    visited[g] = true;
                    component.push(g);
                    queue.push_back(g);
                }
            }
        }

        let volume: f64 = component
            .iter()
            .map(|&f| {
                let face = mesh.faces[f];
                let a = mesh.vertices[face[0]].coords();
                let b = mesh.vertices[face[1]].coords();
                let c = mesh.vertices[face[2]].coords();
                a.dot(&b.cross(&c))
            })
            .sum();
        if volume < 0.0 {
            for &f in &component {
                mesh.faces[f].swap(1, 2);
                flipped[f] = !flipped[f];
            }
        }
    }

    flipped.into_iter().filter(|f| *f).count()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrectionSummary {
    pub corrected: usize,
    pub removed: usize,
}

/// Re-orients every exported `.vtk` surface in `path`, rewriting its `.obj`
/// and `.stl`, then drops the samples whose edge count is off
///
/// # Arguments
/// * `path` - Folder of exported samples
/// * `edges_target` - Exact number of unique edges a sample must have
pub fn extraction_correction(path: &Path, edges_target: usize) -> Result<CorrectionSummary> {
    let mut vtk_files: Vec<PathBuf> = std::fs::read_dir(path)
        .map_err(|err| StrainsetError::io(path, err))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("vtk"))
        .collect();
    vtk_files.sort();

    let mut summary = CorrectionSummary::default();
    let bar = ProgressBar::new(vtk_files.len() as u64);
    for vtk_file in &vtk_files {
        bar.inc(1);
        let stem = vtk_file.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if SKIPPED_STEMS.contains(&stem) {
            continue;
        }

        let corrected = mesh_io::read_vtk(vtk_file).and_then(|(mut surface, _)| {
            let flipped = fix_normals(&mut surface);
            debug!("{}: flipped {flipped} faces", vtk_file.display());
            mesh_io::write_obj(&surface, &vtk_file.with_extension("obj"))?;
            mesh_io::write_stl_binary(&surface, &vtk_file.with_extension("stl"))
        });
        match corrected {
            Ok(()) => summary.corrected += 1,
            Err(err) => error!("failed to correct {}: {err}", vtk_file.display()),
        }
    }
    bar.finish_and_clear();

    summary.removed = filter::remove_not_exact(path, edges_target)?;
    info!(
        "corrected {} surfaces in {}, removed {}",
        summary.corrected,
        path.display(),
        summary.removed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::unit_cube_tet_mesh;
    use crate::mesh_io::scratch_dir;
    use crate::shapes::box_mesh;
    use approx::assert_relative_eq;

    fn displaced_cube() -> UnstructuredGrid {
        let mesh = unit_cube_tet_mesh(2);
        let mut grid = UnstructuredGrid::from_tet_mesh(&mesh);
        let displacement: Vec<Vector3<f64>> = grid
            .points
            .iter()
            .map(|p| Vector3::new(0.0, 0.0, 0.1 * p.z))
            .collect();
        grid.point_data.push(DataArray::vectors("displacement", &displacement));
        grid.cell_data
            .push(DataArray::scalars("von_mises", vec![0.5; grid.cells.len()]));
        grid
    }

    #[test]
    fn test_vtu_write_read() {
        let dir = scratch_dir("vtu");
        let grid = displaced_cube();
        let piece = write_collection(&grid, &dir, "cube._Displacement").unwrap();
        assert_eq!(piece, dir.join("cube._Displacement000000.vtu"));

        let read = read_vtu(&piece).unwrap();
        assert_eq!(read.points, grid.points);
        assert_eq!(read.cells, grid.cells);
        assert_eq!(read.cell_types, vec![VTK_TETRA; 48]);
        assert_eq!(read.point_array("displacement"), grid.point_array("displacement"));
        assert_eq!(read.cell_array("von_mises").unwrap().values.len(), 48);

        let pvd = std::fs::read_to_string(dir.join("cube._Displacement.pvd")).unwrap();
        assert!(pvd.contains("file=\"cube._Displacement000000.vtu\""));
        assert!(pvd.contains("type=\"Collection\""));
    }

    #[test]
    fn test_vtu_rejects_mismatched_arrays() {
        let dir = scratch_dir("vtu-mismatch");
        let mut grid = displaced_cube();
        grid.point_data.push(DataArray::scalars("short", vec![1.0]));
        assert!(matches!(
            write_vtu(&grid, &dir.join("bad.vtu")),
            Err(StrainsetError::PostProcessor(_))
        ));
    }

    #[test]
    fn test_read_vtu_rejects_binary_arrays() {
        let dir = scratch_dir("vtu-binary");
        let path = dir.join("binary.vtu");
        std::fs::write(
            &path,
            r#"<?xml version="1.0"?>
<VTKFile type="UnstructuredGrid" version="0.1">
  <UnstructuredGrid>
    <Piece NumberOfPoints="1" NumberOfCells="0">
      <Points>
        <DataArray type="Float64" NumberOfComponents="3" format="binary">AAAA</DataArray>
      </Points>
    </Piece>
  </UnstructuredGrid>
</VTKFile>
"#,
        )
        .unwrap();
        assert!(matches!(read_vtu(&path), Err(StrainsetError::Input(_))));
    }

    #[test]
    fn test_extract_surface_keeps_labels_with_points() {
        let grid = displaced_cube();
        let (surface, labels) = extract_surface(&grid, "displacement").unwrap();

        // the 2x2x2 cube has a single interior point
        assert_eq!(surface.vertices.len(), 26);
        assert_eq!(surface.faces.len(), 48);
        assert_eq!(labels.len(), 26);
        assert_relative_eq!(surface.signed_volume(), 1.0, epsilon = 1e-12);
        for (vertex, label) in surface.vertices.iter().zip(&labels) {
            assert_relative_eq!(label.z, 0.1 * vertex.z, epsilon = 1e-12);
        }
        // compaction keeps ascending order
        assert_eq!(surface.vertices[0], Vertex::new(0.0, 0.0, 0.0));
        assert_eq!(surface.vertices[25], Vertex::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn test_extract_surface_requires_label() {
        let mut grid = displaced_cube();
        grid.point_data.clear();
        assert!(extract_surface(&grid, "displacement").is_err());
    }

    #[test]
    fn test_sample_name() {
        assert_eq!(
            sample_name(Path::new("/tmp/12._Displacement000000.vtu")).unwrap(),
            "12"
        );
        assert_eq!(sample_name(Path::new("plain.vtu")).unwrap(), "plain");
    }

    #[test]
    fn test_export_sample_writes_dataset_files() {
        let dir = scratch_dir("export");
        let piece = write_collection(&displaced_cube(), &dir, "7._Displacement").unwrap();
        let out = dir.join("final");
        std::fs::create_dir_all(&out).unwrap();

        assert_eq!(export_sample(&piece, &out).unwrap(), "7");
        for ext in ["vtk", "stl", "txt", "obj"] {
            assert!(out.join(format!("7.{ext}")).exists(), "missing 7.{ext}");
        }

        let (surface, displacement) = mesh_io::read_vtk(&out.join("7.vtk")).unwrap();
        assert_eq!(surface.vertices.len(), 26);
        assert_eq!(displacement.unwrap().len(), 26);
        let txt = std::fs::read_to_string(out.join("7.txt")).unwrap();
        assert_eq!(txt.lines().count(), 26);
        assert!(std::fs::read_to_string(out.join("7.stl"))
            .unwrap()
            .starts_with("solid"));
    }

    #[test]
    fn test_fix_normals_restores_outward_winding() {
        let reference = box_mesh([2.0, 1.0, 1.0]);
        let mut mesh = reference.clone();
        // invert everything, then scramble a few faces back
        for face in mesh.faces.iter_mut() {
            face.swap(1, 2);
        }
        mesh.faces[0].swap(1, 2);
        mesh.faces[5].swap(1, 2);
        assert!(mesh.signed_volume() < 2.0);

        let flipped = fix_normals(&mut mesh);
        assert_eq!(flipped, mesh.faces.len() - 2);
        assert_relative_eq!(mesh.signed_volume(), 2.0, epsilon = 1e-12);
        assert_eq!(fix_normals(&mut mesh), 0);
    }

    #[test]
    fn test_extraction_correction_skips_reserved_stems() {
        let dir = scratch_dir("correction");
        let mut inverted = box_mesh([1.0, 1.0, 1.0]);
        for face in inverted.faces.iter_mut() {
            face.swap(1, 2);
        }
        let edges = inverted.unique_edge_count();
        mesh_io::write_vtk(&inverted, None, &dir.join("3.vtk")).unwrap();
        mesh_io::write_vtk(&inverted, None, &dir.join("results.vtk")).unwrap();

        let summary = extraction_correction(&dir, edges).unwrap();
        assert_eq!(summary, CorrectionSummary { corrected: 1, removed: 0 });
        assert!(!dir.join("results.obj").exists());

        let fixed = mesh_io::read_obj(&dir.join("3.obj")).unwrap();
        assert_relative_eq!(fixed.signed_volume(), 1.0, epsilon = 1e-12);
        assert!(dir.join("3.stl").exists());

        // a different target removes the sample
        let summary = extraction_correction(&dir, edges + 1).unwrap();
        assert_eq!(summary.removed, 1);
        assert!(!dir.join("3.stl").exists());
        assert!(!dir.join("3.obj").exists());
    }
}
