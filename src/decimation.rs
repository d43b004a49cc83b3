use meshopt::{SimplifyOptions, VertexDataAdapter};
use tracing::debug;

use crate::{
    datatypes::SurfaceMesh,
    error::{Result, StrainsetError},
};

pub const MIN_STEPS: usize = 10;
pub const MAX_STEPS: usize = 10_000;
/// The face count is sampled every this many steps to detect a stall
pub const HISTORY_INTERVAL: usize = 100;
/// meshopt measures error relative to the mesh extent; 1.0 never limits
const UNBOUNDED_ERROR: f32 = 1.0;

/// Number of steps used to walk the face count down to the target
pub fn step_count(faces: usize, max_faces: usize) -> usize {
    (faces.saturating_sub(max_faces) / 100).clamp(MIN_STEPS, MAX_STEPS)
}

/// Face count requested at step `x` of the linear schedule from `start`
/// down to `max_faces` over `steps` steps
pub fn scheduled_target(x: usize, steps: usize, start: usize, max_faces: usize) -> usize {
    if x >= steps {
        return max_faces;
    }
    let slope = (max_faces as f64 - start as f64) / steps as f64;
    let target = (slope * x as f64 + start as f64) as usize;
    target.max(max_faces)
}

/// One quadric edge-collapse pass down to at most `target_faces` faces
fn collapse(positions: &[[f32; 3]], indices: &[u32], target_faces: usize) -> Result<Vec<u32>> {
    let adapter = VertexDataAdapter::new(
        bytemuck::cast_slice(positions),
        std::mem::size_of::<[f32; 3]>(),
        0,
    )
    .map_err(|err| StrainsetError::Decimation(format!("Invalid vertex buffer: {err:?}")))?;

    Ok(meshopt::simplify(
        indices,
        &adapter,
        target_faces * 3,
        UNBOUNDED_ERROR,
        SimplifyOptions::None,
        None,
    ))
}

/// Reduces the face count of a mesh to `max_faces` with repeated quadric
/// edge collapses. The target shrinks linearly so early passes stay gentle.
///
/// # Arguments
/// * `mesh` - The mesh to reduce
/// * `max_faces` - Face count to reach
///
/// # Returns
/// A new mesh with at most `max_faces` faces and only referenced vertices
pub fn reduce(mesh: &SurfaceMesh, max_faces: usize) -> Result<SurfaceMesh> {
    let start = mesh.face_count();
    if start <= max_faces {
        return Err(StrainsetError::Decimation(format!(
            "Mesh with {start} faces does not have enough faces to reach {max_faces}, skipped"
        )));
    }

    let steps = step_count(start, max_faces);
    debug!("will be reduced in {steps} steps");

    let positions: Vec<[f32; 3]> = mesh
        .vertices
        .iter()
        .map(|v| [v.x as f32, v.y as f32, v.z as f32])
        .collect();
    let mut indices: Vec<u32> = mesh
        .faces
        .iter()
        .flat_map(|f| f.iter().map(|&i| i as u32))
        .collect();

    let mut history: Vec<usize> = Vec::new();
    let mut x = 0;
    while indices.len() / 3 > max_faces {
        let target = scheduled_target(x, steps, start, max_faces);
        indices = collapse(&positions, &indices, target)?;
        x += 1;

        if x % HISTORY_INTERVAL == 0 {
            history.push(indices.len() / 3);
            if history.len() > 3 && history[history.len() - 3..].windows(2).all(|w| w[0] == w[1]) {
                return Err(StrainsetError::Decimation(format!(
                    "The mesh is not decimable with those parameters (stuck at {} faces)",
                    indices.len() / 3
                )));
            }
        }
    }

    let faces: Vec<[usize; 3]> = indices
        .chunks_exact(3)
        .map(|t| [t[0] as usize, t[1] as usize, t[2] as usize])
        .collect();
    let mut reduced = SurfaceMesh::new(mesh.vertices.clone(), faces);
    reduced.remove_unreferenced_vertices();
    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{add_noise, box_mesh, subdivide_to_size};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_step_count_is_clamped() {
        assert_eq!(step_count(1200, 1000), 10);
        assert_eq!(step_count(6000, 1000), 50);
        assert_eq!(step_count(5_000_000, 1000), 10_000);
    }

    #[test]
    fn test_schedule_is_linear_and_floored() {
        assert_eq!(scheduled_target(0, 10, 2000, 1000), 2000);
        assert_eq!(scheduled_target(5, 10, 2000, 1000), 1500);
        assert_eq!(scheduled_target(10, 10, 2000, 1000), 1000);
        assert_eq!(scheduled_target(50, 10, 2000, 1000), 1000);
        for x in 0..10 {
            assert!(scheduled_target(x, 10, 2000, 1000) >= 1000);
            assert!(scheduled_target(x + 1, 10, 2000, 1000) <= scheduled_target(x, 10, 2000, 1000));
        }
    }

    #[test]
    fn test_reduce_rejects_small_mesh() {
        let mesh = box_mesh([1.0, 1.0, 1.0]);
        assert!(matches!(
            reduce(&mesh, 12),
            Err(StrainsetError::Decimation(_))
        ));
        assert!(reduce(&mesh, 100).is_err());
    }

    #[test]
    fn test_reduce_reaches_target() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut mesh = subdivide_to_size(&box_mesh([3.0, 2.0, 1.0]), 0.2).unwrap();
        add_noise(&mut mesh, 0.001, &mut rng);
        let before = mesh.face_count();

        let reduced = reduce(&mesh, 300).unwrap();
        assert!(before > 300);
        assert!(reduced.face_count() <= 300);
        assert!(reduced.face_count() > 0);
        assert!(reduced.vertices.len() < mesh.vertices.len());
        assert!(reduced
            .faces
            .iter()
            .all(|f| f.iter().all(|&i| i < reduced.vertices.len())));
    }
}
