use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vertex {
    pub fn new(x: f64, y: f64, z: f64) -> Vertex {
        Vertex { x, y, z }
    }

    pub fn coords(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn from_coords(coords: &Vector3<f64>) -> Vertex {
        Vertex::new(coords.x, coords.y, coords.z)
    }
}

/// A closed triangle surface
#[derive(Debug, Clone, Default)]
pub struct SurfaceMesh {
    pub vertices: Vec<Vertex>,
    pub faces: Vec<[usize; 3]>,
}

impl SurfaceMesh {
    pub fn new(vertices: Vec<Vertex>, faces: Vec<[usize; 3]>) -> SurfaceMesh {
        SurfaceMesh { vertices, faces }
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Number of distinct undirected edges
    pub fn unique_edge_count(&self) -> usize {
        let mut edges: HashSet<(usize, usize)> = HashSet::with_capacity(self.faces.len() * 3 / 2);
        for face in &self.faces {
            for i in 0..3 {
                let (a, b) = (face[i], face[(i + 1) % 3]);
                edges.insert((a.min(b), a.max(b)));
            }
        }
        edges.len()
    }

    /// Lowest z coordinate of the surface, or None when empty
    pub fn z_min(&self) -> Option<f64> {
        self.vertices.iter().map(|v| v.z).reduce(f64::min)
    }

    pub fn translate(&mut self, offset: &Vector3<f64>) {
        for vertex in self.vertices.iter_mut() {
            vertex.x += offset.x;
            vertex.y += offset.y;
            vertex.z += offset.z;
        }
    }

    /// Longest edge length over every face
    pub fn max_edge_length(&self) -> f64 {
        let mut longest: f64 = 0.0;
        for face in &self.faces {
            for i in 0..3 {
                let a = self.vertices[face[i]].coords();
                let b = self.vertices[face[(i + 1) % 3]].coords();
                longest = longest.max((b - a).norm());
            }
        }
        longest
    }

    /// Signed enclosed volume. Positive when the faces wind outward.
    pub fn signed_volume(&self) -> f64 {
        self.faces
            .iter()
            .map(|f| signed_face_volume(&self.vertices, f))
            .sum()
    }

    pub fn face_normal(&self, face: &[usize; 3]) -> Vector3<f64> {
        let a = self.vertices[face[0]].coords();
        let b = self.vertices[face[1]].coords();
        let c = self.vertices[face[2]].coords();
        let normal = (b - a).cross(&(c - a));
        let norm = normal.norm();
        if norm > 0.0 {
            normal / norm
        } else {
            Vector3::zeros()
        }
    }

    /// Drops vertices that no face references, keeping the order of the rest
    pub fn remove_unreferenced_vertices(&mut self) {
        let mut used = vec![false; self.vertices.len()];
        for face in &self.faces {
            for &i in face {
                used[i] = true;
            }
        }

        let mut remap = vec![usize::MAX; self.vertices.len()];
        let mut vertices = Vec::with_capacity(self.vertices.len());
        for (i, vertex) in self.vertices.iter().enumerate() {
            if used[i] {
                remap[i] = vertices.len();
                vertices.push(*vertex);
            }
        }

        for face in self.faces.iter_mut() {
            for i in face.iter_mut() {
                *i = remap[*i];
            }
        }
        self.vertices = vertices;
    }

    /// Merges vertices with bitwise identical coordinates
    pub fn merge_vertices(&mut self) {
        let mut seen: HashMap<[u64; 3], usize> = HashMap::with_capacity(self.vertices.len());
        let mut remap = Vec::with_capacity(self.vertices.len());
        let mut vertices = Vec::new();

        for vertex in &self.vertices {
            let key = [vertex.x.to_bits(), vertex.y.to_bits(), vertex.z.to_bits()];
            let idx = *seen.entry(key).or_insert_with(|| {
                vertices.push(*vertex);
                vertices.len() - 1
            });
            remap.push(idx);
        }

        for face in self.faces.iter_mut() {
            for i in face.iter_mut() {
                *i = remap[*i];
            }
        }
        // collapsed triangles can appear after merging
        self.faces
            .retain(|f| f[0] != f[1] && f[1] != f[2] && f[0] != f[2]);
        self.vertices = vertices;
    }
}

fn signed_face_volume(vertices: &[Vertex], face: &[usize; 3]) -> f64 {
    let a = vertices[face[0]].coords();
    let b = vertices[face[1]].coords();
    let c = vertices[face[2]].coords();
    a.dot(&b.cross(&c)) / 6.0
}

#[derive(Debug, Clone)]
pub struct Node {
    pub vertex: Vertex,
    pub ux: Option<f64>,
    pub uy: Option<f64>,
    pub uz: Option<f64>,
}

impl Node {
    pub fn new(vertex: Vertex) -> Node {
        Node {
            vertex,
            ux: None,
            uy: None,
            uz: None,
        }
    }

    /// Solved displacement, or None before the solve
    pub fn displacement(&self) -> Option<Vector3<f64>> {
        Some(Vector3::new(self.ux?, self.uy?, self.uz?))
    }
}

/// Linear tetrahedron
#[derive(Debug, Clone)]
pub struct Element {
    pub nodes: [usize; 4],
    pub stress: Option<f64>,
}

/// Exterior triangle of a tetrahedral mesh
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryFacet {
    pub nodes: [usize; 3],
    pub marker: u8,
}

pub const SUPPORT_MARKER: u8 = 1;

#[derive(Debug, Clone, Default)]
pub struct TetMesh {
    pub nodes: Vec<Node>,
    pub elements: Vec<Element>,
    /// Triangles listed in the source .msh; informational only
    pub surface_triangles: usize,
}

impl TetMesh {
    pub fn new(vertices: Vec<Vertex>, tets: Vec<[usize; 4]>) -> TetMesh {
        TetMesh {
            nodes: vertices.into_iter().map(Node::new).collect(),
            elements: tets
                .into_iter()
                .map(|nodes| Element {
                    nodes,
                    stress: None,
                })
                .collect(),
            surface_triangles: 0,
        }
    }

    /// Drops nodes that belong to no element and renumbers the elements.
    /// Returns how many nodes were dropped.
    pub fn retain_referenced_nodes(&mut self) -> usize {
        let mut used = vec![false; self.nodes.len()];
        for element in &self.elements {
            for &n in &element.nodes {
                used[n] = true;
            }
        }

        let mut remap = vec![usize::MAX; self.nodes.len()];
        let mut next = 0;
        for (i, is_used) in used.iter().enumerate() {
            if *is_used {
                remap[i] = next;
                next += 1;
            }
        }
        let dropped = self.nodes.len() - next;
        if dropped == 0 {
            return 0;
        }

        let mut i = 0;
        self.nodes.retain(|_| {
            let keep = used[i];
            i += 1;
            keep
        });
        for element in self.elements.iter_mut() {
            for n in element.nodes.iter_mut() {
                *n = remap[*n];
            }
        }
        dropped
    }

    /// Triangles used by exactly one tetrahedron, wound so their normal points
    /// away from the owning element
    pub fn exterior_faces(&self) -> Vec<[usize; 3]> {
        let mut counts: HashMap<[usize; 3], (usize, [usize; 3])> = HashMap::new();
        let mut order: Vec<[usize; 3]> = Vec::new();

        for element in &self.elements {
            let [a, b, c, d] = element.nodes;
            for (face, opposite) in [([a, b, c], d), ([a, b, d], c), ([a, c, d], b), ([b, c, d], a)]
            {
                let oriented = self.orient_outward(face, opposite);
                let mut key = face;
                key.sort_unstable();
                let entry = counts.entry(key).or_insert_with(|| {
                    order.push(key);
                    (0, oriented)
                });
                entry.0 += 1;
            }
        }

        order
            .into_iter()
            .filter_map(|key| match counts.get(&key) {
                Some((1, oriented)) => Some(*oriented),
                _ => None,
            })
            .collect()
    }

    fn orient_outward(&self, face: [usize; 3], opposite: usize) -> [usize; 3] {
        let a = self.nodes[face[0]].vertex.coords();
        let b = self.nodes[face[1]].vertex.coords();
        let c = self.nodes[face[2]].vertex.coords();
        let d = self.nodes[opposite].vertex.coords();

        if (b - a).cross(&(c - a)).dot(&(d - a)) > 0.0 {
            [face[0], face[2], face[1]]
        } else {
            face
        }
    }
}

/// Structured cube `[0, 1]^3` split into `6 * n^3` tetrahedra
#[cfg(test)]
pub fn unit_cube_tet_mesh(n: usize) -> TetMesh {
    let h = 1.0 / n as f64;
    let index = |i: usize, j: usize, k: usize| i + (n + 1) * (j + (n + 1) * k);

    let mut vertices = Vec::new();
    for k in 0..=n {
        for j in 0..=n {
            for i in 0..=n {
                vertices.push(Vertex::new(i as f64 * h, j as f64 * h, k as f64 * h));
            }
        }
    }

    // every cube is cut along its main diagonal into six tetrahedra
    let paths: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    let mut tets = Vec::new();
    for k in 0..n {
        for j in 0..n {
            for i in 0..n {
                for path in paths {
                    let mut corner = [i, j, k];
                    let mut tet = [index(i, j, k), 0, 0, 0];
                    for (step, axis) in path.iter().enumerate() {
                        corner[*axis] += 1;
                        tet[step + 1] = index(corner[0], corner[1], corner[2]);
                    }
                    tets.push(tet);
                }
            }
        }
    }

    TetMesh::new(vertices, tets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tetrahedron() -> SurfaceMesh {
        SurfaceMesh::new(
            vec![
                Vertex::new(0.0, 0.0, 0.0),
                Vertex::new(1.0, 0.0, 0.0),
                Vertex::new(0.0, 1.0, 0.0),
                Vertex::new(0.0, 0.0, 1.0),
            ],
            vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
        )
    }

    #[test]
    fn test_tetrahedron_volume_and_edges() {
        let mesh = tetrahedron();
        assert_relative_eq!(mesh.signed_volume(), 1.0 / 6.0, epsilon = 1e-12);
        assert_eq!(mesh.unique_edge_count(), 6);
        assert_eq!(mesh.z_min(), Some(0.0));
    }

    #[test]
    fn test_merge_vertices_welds_duplicates() {
        let mut mesh = SurfaceMesh::new(
            vec![
                Vertex::new(0.0, 0.0, 0.0),
                Vertex::new(1.0, 0.0, 0.0),
                Vertex::new(0.0, 1.0, 0.0),
                Vertex::new(1.0, 0.0, 0.0),
                Vertex::new(0.0, 1.0, 0.0),
                Vertex::new(1.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [3, 5, 4]],
        );
        mesh.merge_vertices();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.unique_edge_count(), 5);
    }

    #[test]
    fn test_remove_unreferenced_vertices() {
        let mut mesh = tetrahedron();
        mesh.vertices.insert(0, Vertex::new(9.0, 9.0, 9.0));
        for face in mesh.faces.iter_mut() {
            for i in face.iter_mut() {
                *i += 1;
            }
        }
        mesh.remove_unreferenced_vertices();
        assert_eq!(mesh.vertices.len(), 4);
        assert_relative_eq!(mesh.signed_volume(), 1.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_unit_cube_exterior_faces() {
        let mesh = unit_cube_tet_mesh(2);
        assert_eq!(mesh.elements.len(), 48);
        let faces = mesh.exterior_faces();
        // 6 sides, 4 squares per side, 2 triangles per square
        assert_eq!(faces.len(), 48);

        let vertices: Vec<Vertex> = mesh.nodes.iter().map(|n| n.vertex).collect();
        let surface = SurfaceMesh::new(vertices, faces);
        assert_relative_eq!(surface.signed_volume(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_retain_referenced_nodes() {
        let mut mesh = unit_cube_tet_mesh(1);
        mesh.nodes.push(Node::new(Vertex::new(5.0, 5.0, 5.0)));
        mesh.nodes.insert(0, Node::new(Vertex::new(-5.0, 0.0, 0.0)));
        for element in mesh.elements.iter_mut() {
            for n in element.nodes.iter_mut() {
                *n += 1;
            }
        }
        assert_eq!(mesh.retain_referenced_nodes(), 2);
        assert_eq!(mesh.nodes.len(), 8);
        assert!(mesh
            .elements
            .iter()
            .all(|e| e.nodes.iter().all(|&n| n < 8)));
        assert_eq!(mesh.nodes[0].vertex, Vertex::new(0.0, 0.0, 0.0));
    }
}
