use std::path::Path;

use tracing::{debug, info, warn};

use crate::{
    error::{Result, StrainsetError},
    mesh_io,
};

/// Deletes every surface in `folder` whose unique edge count differs from
/// `edges_target`. The `.stl` and its sibling `.obj` are both removed.
///
/// # Arguments
/// * `folder` - Folder holding `.stl` surfaces
/// * `edges_target` - Exact edge count to keep
///
/// # Returns
/// The number of removed surfaces
pub fn remove_not_exact(folder: &Path, edges_target: usize) -> Result<usize> {
    let mut stl_files: Vec<_> = std::fs::read_dir(folder)
        .map_err(|err| StrainsetError::io(folder, err))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("stl"))
        .collect();
    stl_files.sort();

    let mut removed = 0;
    for stl in &stl_files {
        let edges = match mesh_io::read_stl(stl) {
            Ok(mesh) => mesh.unique_edge_count(),
            Err(err) => {
                warn!("removing unreadable surface: {err}");
                0
            }
        };
        if edges == edges_target {
            continue;
        }

        debug!("{} has {edges} edges, removing", stl.display());
        std::fs::remove_file(stl).map_err(|err| StrainsetError::io(stl, err))?;
        let obj = stl.with_extension("obj");
        if obj.exists() {
            std::fs::remove_file(&obj).map_err(|err| StrainsetError::io(&obj, err))?;
        }
        removed += 1;
    }

    info!(
        "{removed} of {} meshes removed from {} (edges != {edges_target})",
        stl_files.len(),
        folder.display()
    );
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh_io::scratch_dir;
    use crate::shapes::{box_mesh, subdivide_to_size};

    #[test]
    fn test_remove_not_exact() {
        let dir = scratch_dir("filter");
        let cube = box_mesh([1.0, 1.0, 1.0]);
        let fine = subdivide_to_size(&cube, 0.5).unwrap();
        assert_ne!(cube.unique_edge_count(), fine.unique_edge_count());

        for (name, mesh) in [("0", &cube), ("1", &fine), ("2", &cube)] {
            mesh_io::write_stl_binary(mesh, &dir.join(format!("{name}.stl"))).unwrap();
            mesh_io::write_obj(mesh, &dir.join(format!("{name}.obj"))).unwrap();
        }
        std::fs::write(dir.join("broken.stl"), b"not a mesh").unwrap();

        let removed = remove_not_exact(&dir, cube.unique_edge_count()).unwrap();
        assert_eq!(removed, 2);
        assert!(dir.join("0.stl").exists() && dir.join("0.obj").exists());
        assert!(dir.join("2.stl").exists());
        assert!(!dir.join("1.stl").exists() && !dir.join("1.obj").exists());
        assert!(!dir.join("broken.stl").exists());

        assert_eq!(remove_not_exact(&dir, cube.unique_edge_count()).unwrap(), 0);
    }

    #[test]
    fn test_missing_folder_is_an_error() {
        let dir = scratch_dir("filter-missing").join("nope");
        assert!(matches!(
            remove_not_exact(&dir, 3000),
            Err(StrainsetError::Io { .. })
        ));
    }
}
