use std::path::Path;

use anyhow::{bail, Context, Result};
use glam::Vec3;

use crate::scene::MeshSource;

/// Triangle list geometry: tightly packed positions, three indices per face.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    pub positions: Vec<Vec3>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

pub fn cube() -> MeshData {
    let positions = vec![
        // front
        Vec3::new(-0.5, -0.5, 0.5),
        Vec3::new(0.5, -0.5, 0.5),
        Vec3::new(0.5, 0.5, 0.5),
        Vec3::new(-0.5, 0.5, 0.5),
        // back
        Vec3::new(-0.5, -0.5, -0.5),
        Vec3::new(0.5, -0.5, -0.5),
        Vec3::new(0.5, 0.5, -0.5),
        Vec3::new(-0.5, 0.5, -0.5),
    ];

    #[rustfmt::skip]
    let indices = vec![
        0, 1, 2, 2, 3, 0, // front
        1, 5, 6, 6, 2, 1, // right
        5, 4, 7, 7, 6, 5, // back
        4, 0, 3, 3, 7, 4, // left
        3, 2, 6, 6, 7, 3, // top
        4, 5, 1, 1, 0, 4, // bottom
    ];

    MeshData { positions, indices }
}

/// Loads every model of an OBJ file into one triangulated mesh.
pub fn load_obj(path: &Path) -> Result<MeshData> {
    let (models, _materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
    )
    .with_context(|| format!("failed to load {}", path.display()))?;

    let mut out = MeshData {
        positions: Vec::new(),
        indices: Vec::new(),
    };
    for model in models {
        let base = out.positions.len() as u32;
        out.positions.extend(
            model
                .mesh
                .positions
                .chunks_exact(3)
                .map(|p| Vec3::new(p[0], p[1], p[2])),
        );
        out.indices
            .extend(model.mesh.indices.iter().map(|i| base + i));
    }

    if out.indices.is_empty() {
        bail!("{} contains no triangles", path.display());
    }
    Ok(out)
}

impl MeshSource {
    pub fn load(&self) -> Result<MeshData> {
        match self {
            MeshSource::Cube => Ok(cube()),
            MeshSource::Obj(path) => load_obj(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_is_closed_unit_box() {
        let cube = cube();
        assert_eq!(cube.positions.len(), 8);
        assert_eq!(cube.indices.len(), 36);
        assert_eq!(cube.triangle_count(), 12);
        assert!(cube.indices.iter().all(|&i| (i as usize) < cube.positions.len()));
        assert!(cube
            .positions
            .iter()
            .all(|p| p.abs() == Vec3::splat(0.5)));

        // every corner touches three faces, twice on a face diagonal
        for v in 0..8 {
            let uses = cube.indices.iter().filter(|&&i| i == v).count();
            assert!((4..=5).contains(&uses), "vertex {v} used {uses} times");
        }
    }

    #[test]
    fn loads_quad_from_obj() {
        let path = std::env::temp_dir().join(format!("dungeon-rt-quad-{}.obj", std::process::id()));
        std::fs::write(
            &path,
            "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3 4\n",
        )
        .unwrap();

        let mesh = load_obj(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(mesh.positions.len(), 4);
        assert_eq!(mesh.triangle_count(), 2);
        assert!(mesh.indices.iter().all(|&i| i < 4));
    }

    #[test]
    fn missing_obj_is_an_error() {
        assert!(MeshSource::Obj("does/not/exist.obj".into()).load().is_err());
    }
}
