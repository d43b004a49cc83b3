use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::Vector3;
use obj::{Group, IndexTuple, ObjData, Object, SimplePolygon};
use vtkio::model::{
    Attribute, Attributes, ByteOrder, DataSet, ElementType, IOBuffer, Piece, PolyDataPiece,
    Version, VertexNumbers, Vtk,
};

use crate::{
    datatypes::{SurfaceMesh, Vertex},
    error::{Result, StrainsetError},
};

fn create(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|err| StrainsetError::io(path, err))
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|err| StrainsetError::io(path, err))
}

fn input_error(path: &Path, msg: impl std::fmt::Display) -> StrainsetError {
    StrainsetError::Input(format!("{}: {msg}", path.display()))
}

/// Writes a Wavefront obj holding one object with one group
pub fn write_obj(mesh: &SurfaceMesh, path: &Path) -> Result<()> {
    let data = ObjData {
        position: mesh
            .vertices
            .iter()
            .map(|v| [v.x as f32, v.y as f32, v.z as f32])
            .collect(),
        objects: vec![Object {
            groups: vec![Group {
                polys: mesh
                    .faces
                    .iter()
                    .map(|f| {
                        SimplePolygon(f.iter().map(|&i| IndexTuple(i, None, None)).collect())
                    })
                    .collect(),
                name: String::new(),
                index: 0,
                material: None,
            }],
            name: String::new(),
        }],
        ..Default::default()
    };

    let mut out = create(path)?;
    data.write_to_buf(&mut out)
        .map_err(|err| StrainsetError::PostProcessor(format!("{}: {err}", path.display())))?;
    out.flush().map_err(|err| StrainsetError::io(path, err))
}

/// Reads a Wavefront obj. Polygons are fan triangulated; texture and normal
/// indices are ignored.
pub fn read_obj(path: &Path) -> Result<SurfaceMesh> {
    let data = ObjData::load_buf(BufReader::new(open(path)?))
        .map_err(|err| input_error(path, err))?;
    surface_from_obj(&data).map_err(|msg| input_error(path, msg))
}

fn surface_from_obj(data: &ObjData) -> std::result::Result<SurfaceMesh, String> {
    let mut mesh = SurfaceMesh::new(
        data.position
            .iter()
            .map(|p| Vertex::new(p[0] as f64, p[1] as f64, p[2] as f64))
            .collect(),
        Vec::new(),
    );

    let polygons = data
        .objects
        .iter()
        .flat_map(|o| o.groups.iter())
        .flat_map(|g| g.polys.iter());
    for polygon in polygons {
        let ids: Vec<usize> = polygon.0.iter().map(|t| t.0).collect();
        if ids.len() < 3 {
            return Err(format!("Degenerate face with {} corners", ids.len()));
        }
        if ids.iter().any(|&i| i >= mesh.vertices.len()) {
            return Err("Face index out of range".to_string());
        }
        for i in 1..ids.len() - 1 {
            mesh.faces.push([ids[0], ids[i], ids[i + 1]]);
        }
    }

    Ok(mesh)
}

/// Writes an ascii stl. The stl crate only emits binary files.
pub fn write_stl_ascii(mesh: &SurfaceMesh, path: &Path) -> Result<()> {
    let mut out = create(path)?;
    let mut write = || -> std::io::Result<()> {
        writeln!(out, "solid mesh")?;
        for face in &mesh.faces {
            let n = mesh.face_normal(face);
            writeln!(out, "  facet normal {:e} {:e} {:e}", n.x, n.y, n.z)?;
            writeln!(out, "    outer loop")?;
            for &i in face {
                let v = &mesh.vertices[i];
                writeln!(out, "      vertex {:e} {:e} {:e}", v.x, v.y, v.z)?;
            }
            writeln!(out, "    endloop")?;
            writeln!(out, "  endfacet")?;
        }
        writeln!(out, "endsolid mesh")?;
        out.flush()
    };
    write().map_err(|err| StrainsetError::io(path, err))
}

pub fn write_stl_binary(mesh: &SurfaceMesh, path: &Path) -> Result<()> {
    let triangles: Vec<stl_io::Triangle> = mesh
        .faces
        .iter()
        .map(|face| {
            let n = mesh.face_normal(face);
            stl_io::Triangle {
                normal: stl_io::Normal::new([n.x as f32, n.y as f32, n.z as f32]),
                vertices: face.map(|i| {
                    let v = &mesh.vertices[i];
                    stl_io::Vertex::new([v.x as f32, v.y as f32, v.z as f32])
                }),
            }
        })
        .collect();

    let mut out = create(path)?;
    stl_io::write_stl(&mut out, triangles.iter())
        .and_then(|()| out.flush())
        .map_err(|err| StrainsetError::io(path, err))
}

/// Reads an ascii or binary stl and welds duplicate corners
pub fn read_stl(path: &Path) -> Result<SurfaceMesh> {
    let mut file = open(path)?;
    let stl = stl_io::read_stl(&mut file).map_err(|err| input_error(path, err))?;

    let vertices = stl
        .vertices
        .iter()
        .map(|v| Vertex::new(v[0] as f64, v[1] as f64, v[2] as f64))
        .collect();
    let faces = stl.faces.iter().map(|f| f.vertices).collect();

    let mut mesh = SurfaceMesh::new(vertices, faces);
    if mesh.faces.iter().flatten().any(|&i| i >= mesh.vertices.len()) {
        return Err(input_error(path, "Stl face index out of range"));
    }
    mesh.merge_vertices();
    Ok(mesh)
}

fn flatten(vectors: impl Iterator<Item = Vector3<f64>>) -> Vec<f64> {
    vectors.flat_map(|v| [v.x, v.y, v.z]).collect()
}

/// Writes a legacy ascii VTK polydata file, optionally carrying a
/// `displacement` vector per point
pub fn write_vtk(
    mesh: &SurfaceMesh,
    displacement: Option<&[Vector3<f64>]>,
    path: &Path,
) -> Result<()> {
    let mut data = Attributes::new();
    if let Some(d) = displacement {
        if d.len() != mesh.vertices.len() {
            return Err(StrainsetError::PostProcessor(format!(
                "{} displacement vectors for {} points",
                d.len(),
                mesh.vertices.len()
            )));
        }
        data.point.push(Attribute::DataArray(vtkio::model::DataArray {
            name: "displacement".to_owned(),
            elem: ElementType::Vectors,
            data: IOBuffer::F64(flatten(d.iter().copied())),
        }));
    }

    let vertices: Vec<u32> = mesh
        .faces
        .iter()
        .flat_map(|f| [3, f[0] as u32, f[1] as u32, f[2] as u32])
        .collect();
    let vtk = Vtk {
        version: Version { major: 4, minor: 2 },
        title: "strainset surface".to_owned(),
        byte_order: ByteOrder::BigEndian,
        file_path: None,
        data: DataSet::inline(PolyDataPiece {
            points: IOBuffer::F64(flatten(mesh.vertices.iter().map(|v| v.coords()))),
            polys: Some(VertexNumbers::Legacy {
                num_cells: mesh.faces.len() as u32,
                vertices,
            }),
            data,
            ..Default::default()
        }),
    };

    vtk.export_ascii(path)
        .map_err(|err| StrainsetError::PostProcessor(format!("{}: {err}", path.display())))
}

fn to_vectors(buffer: IOBuffer) -> Option<Vec<Vector3<f64>>> {
    let values: Vec<f64> = buffer.cast_into()?;
    Some(
        values
            .chunks_exact(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect(),
    )
}

/// Reads a legacy VTK polydata file. Returns the surface and the
/// `displacement` point vectors when present.
pub fn read_vtk(path: &Path) -> Result<(SurfaceMesh, Option<Vec<Vector3<f64>>>)> {
    let vtk = Vtk::import(path).map_err(|err| input_error(path, err))?;
    let DataSet::PolyData { pieces, .. } = vtk.data else {
        return Err(input_error(path, "Only polydata is supported"));
    };
    let piece = match pieces.into_iter().next() {
        Some(Piece::Inline(piece)) => *piece,
        _ => return Err(input_error(path, "Missing inline polydata piece")),
    };

    let points = to_vectors(piece.points).ok_or_else(|| input_error(path, "Bad point buffer"))?;
    let mut mesh = SurfaceMesh::new(points.iter().map(Vertex::from_coords).collect(), Vec::new());

    if let Some(polys) = piece.polys {
        let (num_cells, ids) = polys.into_legacy();
        let mut ids = ids.into_iter().map(|i| i as usize);
        for _ in 0..num_cells {
            let size = ids.next().unwrap_or(0);
            let corners: Vec<usize> = ids.by_ref().take(size).collect();
            if corners.len() != size || size < 3 {
                return Err(input_error(path, "Truncated polygon list"));
            }
            if corners.iter().any(|&i| i >= mesh.vertices.len()) {
                return Err(input_error(path, "Polygon index out of range"));
            }
            for i in 1..size - 1 {
                mesh.faces.push([corners[0], corners[i], corners[i + 1]]);
            }
        }
    }

    let displacement = piece.data.point.into_iter().find_map(|attribute| match attribute {
        Attribute::DataArray(array) if array.name == "displacement" => to_vectors(array.data),
        _ => None,
    });

    Ok((mesh, displacement))
}

/// Formats like numpy's `%.18e`: mantissa with 18 decimals and a signed,
/// at least two digit exponent
pub fn format_scientific(value: f64) -> String {
    let formatted = format!("{:.18e}", value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => formatted,
    }
}

/// Writes one `x y z` row per vector in `%.18e` notation
pub fn write_displacement_txt(displacement: &[Vector3<f64>], path: &Path) -> Result<()> {
    let mut out = create(path)?;
    let mut write = || -> std::io::Result<()> {
        for u in displacement {
            writeln!(
                out,
                "{} {} {}",
                format_scientific(u.x),
                format_scientific(u.y),
                format_scientific(u.z)
            )?;
        }
        out.flush()
    };
    write().map_err(|err| StrainsetError::io(path, err))
}

#[cfg(test)]
pub(crate) fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("strainset-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("failed to create scratch dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::box_mesh;
    use approx::assert_relative_eq;

    #[test]
    fn test_format_scientific_matches_numpy() {
        assert_eq!(format_scientific(1.0), "1.000000000000000000e+00");
        assert_eq!(format_scientific(-0.00125), "-1.250000000000000026e-03");
        assert_eq!(format_scientific(0.0), "0.000000000000000000e+00");
        assert_eq!(format_scientific(2.5e120), "2.500000000000000000e+120");
    }

    #[test]
    fn test_read_obj_fans_quads() {
        let dir = scratch_dir("obj-quad");
        let path = dir.join("quad.obj");
        let text = "# comment\nv 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3 4\n";
        std::fs::write(&path, text).unwrap();

        let mesh = read_obj(&path).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.faces, vec![[0, 1, 2], [0, 2, 3]]);
    }

    #[test]
    fn test_read_obj_rejects_out_of_range() {
        let dir = scratch_dir("obj-range");
        let path = dir.join("bad.obj");
        std::fs::write(&path, "v 0 0 0\nf 1 2 3\n").unwrap();
        assert!(read_obj(&path).is_err());
    }

    #[test]
    fn test_read_stl_rejects_garbage() {
        let dir = scratch_dir("stl-garbage");
        let path = dir.join("bad.stl");
        std::fs::write(&path, "not a mesh").unwrap();
        assert!(read_stl(&path).is_err());
    }

    #[test]
    fn test_obj_round_trip_keeps_faces() {
        let dir = scratch_dir("obj");
        let path = dir.join("box.obj");
        let mesh = box_mesh([1.0, 2.0, 3.0]);
        write_obj(&mesh, &path).unwrap();

        let back = read_obj(&path).unwrap();
        assert_eq!(back.faces, mesh.faces);
        assert_relative_eq!(back.signed_volume(), 6.0, epsilon = 1e-9);
    }

    #[test]
    fn test_stl_binary_and_ascii_weld_to_same_mesh() {
        let dir = scratch_dir("stl");
        let mesh = box_mesh([2.0, 2.0, 2.0]);

        let binary = dir.join("box.stl");
        write_stl_binary(&mesh, &binary).unwrap();
        let ascii = dir.join("box_ascii.stl");
        write_stl_ascii(&mesh, &ascii).unwrap();

        for path in [binary, ascii] {
            let back = read_stl(&path).unwrap();
            assert_eq!(back.vertices.len(), 8);
            assert_eq!(back.faces.len(), 12);
            assert_eq!(back.unique_edge_count(), 18);
            assert_relative_eq!(back.signed_volume(), 8.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_vtk_keeps_displacement() {
        let dir = scratch_dir("vtk");
        let path = dir.join("sample.vtk");
        let mesh = box_mesh([1.0, 1.0, 1.0]);
        let displacement: Vec<Vector3<f64>> = mesh
            .vertices
            .iter()
            .map(|v| Vector3::new(0.0, 0.0, v.z * 0.1))
            .collect();

        write_vtk(&mesh, Some(&displacement), &path).unwrap();
        let (back, labels) = read_vtk(&path).unwrap();

        assert_eq!(back.faces, mesh.faces);
        let labels = labels.expect("displacement missing");
        assert_eq!(labels.len(), 8);
        assert_relative_eq!(labels[7].z, displacement[7].z, epsilon = 1e-12);

        let (_, none) = {
            let plain = dir.join("plain.vtk");
            write_vtk(&mesh, None, &plain).unwrap();
            read_vtk(&plain).unwrap()
        };
        assert!(none.is_none());
    }

    #[test]
    fn test_vtk_rejects_mismatched_labels() {
        let dir = scratch_dir("vtk-mismatch");
        let mesh = box_mesh([1.0, 1.0, 1.0]);
        let result = write_vtk(&mesh, Some(&[Vector3::zeros()]), &dir.join("bad.vtk"));
        assert!(matches!(result, Err(StrainsetError::PostProcessor(_))));
    }
}
