use std::collections::HashMap;
use std::f64::consts::PI;
use std::path::Path;

use indicatif::ProgressBar;
use nalgebra::Vector3;
use rand::Rng;
use tracing::{debug, error, info};

use crate::{
    config::{GeneratorParameters, ShapeKind},
    datatypes::{SurfaceMesh, Vertex},
    decimation,
    error::{Result, StrainsetError},
    mesh_io,
};

pub const MAX_SUBDIVISION_PASSES: usize = 10;
pub const MIN_POLYGON_SEGMENTS: usize = 4;
pub const MAX_POLYGON_SEGMENTS: usize = 10;

/// Builds an axis-aligned box centered on the origin
///
/// # Arguments
/// * `extents` - The box size along x, y and z
///
/// # Returns
/// A closed 8 vertex, 12 face surface with outward winding
pub fn box_mesh(extents: [f64; 3]) -> SurfaceMesh {
    let [hx, hy, hz] = extents.map(|e| e / 2.0);
    let vertices = vec![
        Vertex::new(-hx, -hy, -hz),
        Vertex::new(hx, -hy, -hz),
        Vertex::new(hx, hy, -hz),
        Vertex::new(-hx, hy, -hz),
        Vertex::new(-hx, -hy, hz),
        Vertex::new(hx, -hy, hz),
        Vertex::new(hx, hy, hz),
        Vertex::new(-hx, hy, hz),
    ];
    let faces = vec![
        [0, 2, 1],
        [0, 3, 2],
        [4, 5, 6],
        [4, 6, 7],
        [0, 1, 5],
        [0, 5, 4],
        [3, 7, 6],
        [3, 6, 2],
        [0, 4, 7],
        [0, 7, 3],
        [1, 2, 6],
        [1, 6, 5],
    ];
    SurfaceMesh::new(vertices, faces)
}

/// Generates a random counter-clockwise polygon that is star shaped around
/// the origin
///
/// # Arguments
/// * `segments` - Number of corners
/// * `radius` - Largest distance of a corner from the origin
/// * `rng` - Random source
pub fn random_polygon<R: Rng + ?Sized>(segments: usize, radius: f64, rng: &mut R) -> Vec<[f64; 2]> {
    let sector = 2.0 * PI / segments as f64;

    (0..segments)
        .map(|i| {
            // jitter inside the first half of each sector keeps consecutive
            // corners less than PI apart
            let angle = (i as f64 + rng.gen_range(0.0..0.5)) * sector;
            let r = radius * rng.gen_range(0.25..=1.0);
            [r * angle.cos(), r * angle.sin()]
        })
        .collect()
}

/// Extrudes a polygon that is star shaped around the origin into a closed
/// prism standing on z = 0
///
/// # Arguments
/// * `polygon` - Counter-clockwise corners
/// * `height` - Prism height
pub fn extrude_polygon(polygon: &[[f64; 2]], height: f64) -> Result<SurfaceMesh> {
    let n = polygon.len();
    if n < 3 {
        return Err(StrainsetError::Generator(format!(
            "Cannot extrude a polygon with {n} corners"
        )));
    }

    let mut vertices: Vec<Vertex> = Vec::with_capacity(2 * n + 2);
    for p in polygon {
        vertices.push(Vertex::new(p[0], p[1], 0.0));
    }
    for p in polygon {
        vertices.push(Vertex::new(p[0], p[1], height));
    }
    let bottom_center = vertices.len();
    vertices.push(Vertex::new(0.0, 0.0, 0.0));
    let top_center = vertices.len();
    vertices.push(Vertex::new(0.0, 0.0, height));

    let mut faces = Vec::with_capacity(4 * n);
    for i in 0..n {
        let j = (i + 1) % n;
        faces.push([bottom_center, j, i]);
        faces.push([top_center, n + i, n + j]);
        faces.push([i, j, n + j]);
        faces.push([i, n + j, n + i]);
    }

    Ok(SurfaceMesh::new(vertices, faces))
}

/// Splits every triangle into four until no edge is longer than `max_edge`.
/// Edge midpoints are shared between neighbours so a closed input stays
/// closed.
pub fn subdivide_to_size(mesh: &SurfaceMesh, max_edge: f64) -> Result<SurfaceMesh> {
    if max_edge <= 0.0 {
        return Err(StrainsetError::Generator(
            "max edge size must be positive".to_owned(),
        ));
    }

    // every pass halves every edge
    let ratio = mesh.max_edge_length() / max_edge;
    if ratio > 1.0 && ratio.log2().ceil() as usize > MAX_SUBDIVISION_PASSES {
        return Err(StrainsetError::Generator(format!(
            "Edges cannot reach {max_edge} within {MAX_SUBDIVISION_PASSES} subdivisions"
        )));
    }

    let mut current = mesh.clone();
    let mut passes = 0;
    while current.max_edge_length() > max_edge {
        if passes == MAX_SUBDIVISION_PASSES {
            return Err(StrainsetError::Generator(format!(
                "Edges still longer than {max_edge} after {passes} subdivisions"
            )));
        }
        current = subdivide(&current);
        passes += 1;
    }
    Ok(current)
}

fn subdivide(mesh: &SurfaceMesh) -> SurfaceMesh {
    let mut vertices = mesh.vertices.clone();
    let mut midpoints: HashMap<(usize, usize), usize> = HashMap::new();
    let mut faces = Vec::with_capacity(mesh.faces.len() * 4);

    let mut midpoint = |a: usize, b: usize, vertices: &mut Vec<Vertex>| -> usize {
        *midpoints.entry((a.min(b), a.max(b))).or_insert_with(|| {
            let m = (vertices[a].coords() + vertices[b].coords()) / 2.0;
            vertices.push(Vertex::from_coords(&m));
            vertices.len() - 1
        })
    };

    for &[a, b, c] in &mesh.faces {
        let ab = midpoint(a, b, &mut vertices);
        let bc = midpoint(b, c, &mut vertices);
        let ca = midpoint(c, a, &mut vertices);
        faces.push([a, ab, ca]);
        faces.push([ab, b, bc]);
        faces.push([ca, bc, c]);
        faces.push([ab, bc, ca]);
    }

    SurfaceMesh::new(vertices, faces)
}

/// Moves every vertex by a uniform random offset in `[-magnitude, magnitude]`
/// per axis
pub fn add_noise<R: Rng + ?Sized>(mesh: &mut SurfaceMesh, magnitude: f64, rng: &mut R) {
    if magnitude <= 0.0 {
        return;
    }
    for vertex in mesh.vertices.iter_mut() {
        vertex.x += rng.gen_range(-magnitude..=magnitude);
        vertex.y += rng.gen_range(-magnitude..=magnitude);
        vertex.z += rng.gen_range(-magnitude..=magnitude);
    }
}

/// Translates the mesh so its lowest point sits on z = 0
pub fn rest_on_ground(mesh: &mut SurfaceMesh) {
    if let Some(z_min) = mesh.z_min() {
        mesh.translate(&Vector3::new(0.0, 0.0, -z_min));
    }
}

/// Builds one random, decimated sample resting on z = 0
pub fn generate_sample<R: Rng + ?Sized>(
    params: &GeneratorParameters,
    rng: &mut R,
) -> Result<SurfaceMesh> {
    let (low, high) = (params.height_min, params.height_max);
    let primitive = match params.shape {
        ShapeKind::Cube => {
            let extents = [
                rng.gen_range(low..=high),
                rng.gen_range(low..=high),
                rng.gen_range(low..=high),
            ];
            debug!("box extents {:?}", extents);
            box_mesh(extents)
        }
        ShapeKind::Polygon => {
            let height = rng.gen_range(low..=high);
            let segments = rng.gen_range(MIN_POLYGON_SEGMENTS..=MAX_POLYGON_SEGMENTS);
            let radius = rng.gen_range(low..=high);
            debug!("polygon with {segments} segments, radius {radius:.3}, height {height:.3}");
            extrude_polygon(&random_polygon(segments, radius, rng), height)?
        }
    };

    let mut mesh = subdivide_to_size(&primitive, params.max_edge_size)?;
    debug!("subdivision finished with {} faces", mesh.face_count());

    add_noise(&mut mesh, params.noise, rng);
    let mut mesh = decimation::reduce(&mesh, params.target_faces)?;
    debug!("reduce finished with {} faces", mesh.face_count());
    if mesh.signed_volume() <= 0.0 {
        return Err(StrainsetError::Generator(
            "Decimated surface encloses no volume".to_owned(),
        ));
    }

    rest_on_ground(&mut mesh);
    Ok(mesh)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSummary {
    pub generated: usize,
    pub failed: usize,
}

/// Generates `count` random samples and exports each as `<prefix><i>.obj`
/// and `<prefix><i>.stl` inside `path`. A sample that fails is logged and
/// skipped.
///
/// # Arguments
/// * `path` - The output folder
/// * `count` - How many samples to attempt
/// * `params` - Generator parameters
/// * `rng` - Random source
pub fn generate<R: Rng + ?Sized>(
    path: &Path,
    count: usize,
    params: &GeneratorParameters,
    rng: &mut R,
) -> Result<GenerationSummary> {
    std::fs::create_dir_all(path).map_err(|err| StrainsetError::io(path, err))?;

    let mut summary = GenerationSummary::default();
    let bar = ProgressBar::new(count as u64);
    for i in 0..count {
        bar.inc(1);
        let name = format!("{}{}", params.name_prefix, i);

        let result = generate_sample(params, rng).and_then(|mesh| {
            let export_path = path.join(&name).with_extension("obj");
            mesh_io::write_obj(&mesh, &export_path)?;
            mesh_io::write_stl_binary(&mesh, &export_path.with_extension("stl"))
        });

        match result {
            Ok(()) => {
                debug!("{:?} sample {name}: finished", params.shape);
                summary.generated += 1;
            }
            Err(err) => {
                error!("{:?} sample {name} skipped: {err}", params.shape);
                summary.failed += 1;
            }
        }
    }
    bar.finish();

    info!(
        "generated {} {:?} samples in {} ({} failed)",
        summary.generated,
        params.shape,
        path.display(),
        summary.failed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_box_volume_and_topology() {
        let mesh = box_mesh([2.0, 3.0, 4.0]);
        assert_relative_eq!(mesh.signed_volume(), 24.0, epsilon = 1e-12);
        assert_eq!(mesh.unique_edge_count(), 18);
        assert_relative_eq!(mesh.z_min().unwrap(), -2.0);
    }

    #[test]
    fn test_random_polygon_is_ccw_and_bounded() {
        let mut rng = StdRng::seed_from_u64(3);
        for segments in MIN_POLYGON_SEGMENTS..=MAX_POLYGON_SEGMENTS {
            let polygon = random_polygon(segments, 5.0, &mut rng);
            assert_eq!(polygon.len(), segments);

            let mut twice_area = 0.0;
            for i in 0..segments {
                let (p, q) = (polygon[i], polygon[(i + 1) % segments]);
                // every fan triangle around the origin must be counter-clockwise
                let cross = p[0] * q[1] - p[1] * q[0];
                assert!(cross > 0.0);
                twice_area += cross;
                assert!((p[0] * p[0] + p[1] * p[1]).sqrt() <= 5.0 + 1e-12);
            }
            assert!(twice_area > 0.0);
        }
    }

    #[test]
    fn test_extruded_square_is_closed_prism() {
        let square = [[1.0, 0.0], [0.0, 1.0], [-1.0, 0.0], [0.0, -1.0]];
        let mesh = extrude_polygon(&square, 3.0).unwrap();
        // square of diagonal 2 has area 2
        assert_relative_eq!(mesh.signed_volume(), 6.0, epsilon = 1e-12);
        // closed genus-0 surface: E = 3F / 2
        assert_eq!(mesh.unique_edge_count() * 2, mesh.face_count() * 3);
    }

    #[test]
    fn test_extrude_rejects_degenerate_polygon() {
        assert!(extrude_polygon(&[[0.0, 0.0], [1.0, 0.0]], 1.0).is_err());
    }

    #[test]
    fn test_subdivide_to_size_stays_watertight() {
        let mesh = box_mesh([4.0, 2.0, 1.0]);
        let fine = subdivide_to_size(&mesh, 1.0).unwrap();

        assert!(fine.max_edge_length() <= 1.0);
        assert_relative_eq!(fine.signed_volume(), 8.0, epsilon = 1e-9);
        assert_eq!(fine.unique_edge_count() * 2, fine.face_count() * 3);
        // Euler characteristic of a sphere
        let euler = fine.vertices.len() as i64 - fine.unique_edge_count() as i64
            + fine.face_count() as i64;
        assert_eq!(euler, 2);
    }

    #[test]
    fn test_subdivide_gives_up_on_tiny_edges() {
        let mesh = box_mesh([1000.0, 1000.0, 1000.0]);
        assert!(matches!(
            subdivide_to_size(&mesh, 0.01),
            Err(StrainsetError::Generator(_))
        ));
    }

    #[test]
    fn test_noise_is_bounded() {
        let mut rng = StdRng::seed_from_u64(11);
        let original = box_mesh([1.0, 1.0, 1.0]);
        let mut noisy = original.clone();
        add_noise(&mut noisy, 0.01, &mut rng);
        for (a, b) in original.vertices.iter().zip(&noisy.vertices) {
            assert!((a.x - b.x).abs() <= 0.01);
            assert!((a.y - b.y).abs() <= 0.01);
            assert!((a.z - b.z).abs() <= 0.01);
        }
    }

    #[test]
    fn test_rest_on_ground() {
        let mut mesh = box_mesh([1.0, 1.0, 6.0]);
        rest_on_ground(&mut mesh);
        assert_relative_eq!(mesh.z_min().unwrap(), 0.0);
        assert_relative_eq!(
            mesh.vertices.iter().map(|v| v.z).fold(f64::MIN, f64::max),
            6.0
        );
    }

    #[test]
    fn test_generate_writes_obj_and_stl() {
        let dir = mesh_io::scratch_dir("generate");
        let params = GeneratorParameters {
            height_min: 2.0,
            height_max: 3.0,
            max_edge_size: 0.5,
            noise: 0.001,
            target_faces: 200,
            ..GeneratorParameters::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let summary = generate(&dir, 2, &params, &mut rng).unwrap();

        assert_eq!(summary.generated + summary.failed, 2);
        assert!(summary.generated > 0);
        let mut found = 0;
        for i in 0..2 {
            let stl = dir.join(format!("{i}.stl"));
            if !stl.exists() {
                assert!(!dir.join(format!("{i}.obj")).exists());
                continue;
            }
            found += 1;
            let mesh = mesh_io::read_stl(&stl).unwrap();
            assert!(mesh.face_count() > 0 && mesh.face_count() <= 200);
            assert!(mesh.z_min().unwrap().abs() < 1e-6);
            assert!(mesh.signed_volume() > 0.0);

            let obj = mesh_io::read_obj(&dir.join(format!("{i}.obj"))).unwrap();
            assert_eq!(obj.face_count(), mesh.face_count());
            assert_relative_eq!(obj.signed_volume(), mesh.signed_volume(), max_relative = 1e-4);
        }
        assert_eq!(found, summary.generated);
    }
}
