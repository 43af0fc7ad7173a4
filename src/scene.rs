use std::path::PathBuf;

use anyhow::{bail, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use log::warn;

use crate::camera::CameraPose;

pub mod description;
pub mod dungeon;
pub mod geometry;

pub const DEFAULT_MASK: u32 = 0xff;

/// Shading parameters of one instance. The closest hit shader finds them
/// through `gl_InstanceCustomIndexEXT`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ShadingInstance {
    /// rgb = albedo, a = roughness
    pub color: Vec4,
    /// rgb = emission color, a = power
    pub emission: Vec4,
}

impl ShadingInstance {
    pub fn matte(color: Vec3, roughness: f32) -> ShadingInstance {
        ShadingInstance {
            color: color.extend(roughness),
            emission: Vec4::ZERO,
        }
    }

    pub fn glowing(color: Vec3, roughness: f32, emission: Vec3, power: f32) -> ShadingInstance {
        ShadingInstance {
            color: color.extend(roughness),
            emission: emission.extend(power),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Light {
    /// xyz = position, w = radius
    pub position: Vec4,
    /// rgb = color, a = power
    pub color: Vec4,
}

impl Light {
    /// Terminates the light array. The shader stops at the first zero power.
    pub const SENTINEL: Light = Light {
        position: Vec4::ZERO,
        color: Vec4::ZERO,
    };

    pub fn point(position: Vec3, radius: f32, color: Vec3, power: f32) -> Light {
        Light {
            position: position.extend(radius),
            color: color.extend(power),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.color.w == 0.0
    }
}

/// Lights as uploaded to the GPU: always terminated by [`Light::SENTINEL`].
#[derive(Debug, Clone, PartialEq)]
pub struct LightList {
    lights: Vec<Light>,
}

impl Default for LightList {
    fn default() -> Self {
        LightList {
            lights: vec![Light::SENTINEL],
        }
    }
}

impl LightList {
    pub fn new() -> LightList {
        Self::default()
    }

    /// Zero power lights would end the list early on the GPU and are dropped.
    pub fn push(&mut self, light: Light) {
        if light.is_sentinel() {
            warn!("dropping light at {} with zero power", light.position.truncate());
            return;
        }
        let end = self.lights.len() - 1;
        self.lights.insert(end, light);
    }

    /// Number of real lights, sentinel excluded.
    pub fn count(&self) -> usize {
        self.lights.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// The GPU array including the trailing sentinel.
    pub fn as_gpu_slice(&self) -> &[Light] {
        &self.lights
    }
}

impl FromIterator<Light> for LightList {
    fn from_iter<I: IntoIterator<Item = Light>>(iter: I) -> Self {
        let mut out = LightList::new();
        for light in iter {
            out.push(light);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshSource {
    /// the unit cube centered on the origin
    Cube,
    Obj(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mesh {
    pub name: String,
    pub source: MeshSource,
}

/// One placed mesh. Its position in [`Scene::objects`] is its custom index,
/// which keeps geometry instances and shading records in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneObject {
    pub mesh: usize,
    pub transform: Mat4,
    pub mask: u32,
    pub shading: ShadingInstance,
}

impl SceneObject {
    pub fn new(mesh: usize, transform: Mat4, shading: ShadingInstance) -> SceneObject {
        SceneObject {
            mesh,
            transform,
            mask: DEFAULT_MASK,
            shading,
        }
    }
}

/// Shading records in custom index order.
pub fn shading_records(objects: &[SceneObject]) -> Vec<ShadingInstance> {
    objects.iter().map(|x| x.shading).collect()
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub camera: CameraPose,
    pub meshes: Vec<Mesh>,
    pub objects: Vec<SceneObject>,
    pub lights: LightList,
}

impl Scene {
    pub fn validate(&self) -> Result<()> {
        validate_objects(&self.objects, self.meshes.len())
    }
}

pub fn validate_objects(objects: &[SceneObject], mesh_count: usize) -> Result<()> {
    for (i, object) in objects.iter().enumerate() {
        if object.mesh >= mesh_count {
            bail!(
                "object {i} references mesh {} but only {mesh_count} meshes exist",
                object.mesh
            );
        }
        if object.mask > 0xff {
            bail!("object {i} has mask {:#x} wider than 8 bits", object.mask);
        }
    }
    Ok(())
}

/// Names accepted by [`builtin`].
pub const BUILTIN_SCENES: &[&str] = &["dungeon", "cube"];

/// The built-in scenes selectable by name instead of a scene file.
pub fn builtin(name: &str) -> Option<Scene> {
    match name {
        "dungeon" => Some(dungeon::dungeon_scene()),
        "cube" => Some(dungeon::single_cube_scene()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light(power: f32) -> Light {
        Light::point(Vec3::new(0.0, 2.0, 0.0), 10.0, Vec3::ONE, power)
    }

    #[test]
    fn gpu_records_have_expected_size() {
        assert_eq!(std::mem::size_of::<ShadingInstance>(), 32);
        assert_eq!(std::mem::size_of::<Light>(), 32);
    }

    #[test]
    fn empty_list_is_only_the_sentinel() {
        let list = LightList::new();
        assert_eq!(list.count(), 0);
        assert!(list.is_empty());
        assert_eq!(list.as_gpu_slice(), &[Light::SENTINEL]);
    }

    #[test]
    fn count_excludes_sentinel() {
        let list: LightList = [light(5.0), light(1.5), light(8.0)].into_iter().collect();
        assert_eq!(list.count(), 3);
        assert_eq!(list.as_gpu_slice().len(), list.count() + 1);
        assert!(list.as_gpu_slice().last().unwrap().is_sentinel());
        assert_eq!(
            list.as_gpu_slice().iter().filter(|x| x.is_sentinel()).count(),
            1
        );
    }

    #[test]
    fn zero_power_lights_are_dropped() {
        let mut list = LightList::new();
        list.push(light(0.0));
        list.push(light(2.0));
        assert_eq!(list.count(), 1);
        assert_eq!(list.as_gpu_slice()[0].color.w, 2.0);
    }

    #[test]
    fn unknown_mesh_fails_validation() {
        let scene = Scene {
            meshes: vec![Mesh {
                name: "cube".into(),
                source: MeshSource::Cube,
            }],
            objects: vec![SceneObject::new(
                1,
                Mat4::IDENTITY,
                ShadingInstance::matte(Vec3::ONE, 0.5),
            )],
            ..Default::default()
        };
        assert!(scene.validate().is_err());
    }

    #[test]
    fn wide_mask_fails_validation() {
        let mut object = SceneObject::new(0, Mat4::IDENTITY, ShadingInstance::matte(Vec3::ONE, 0.5));
        object.mask = 0x100;
        assert!(validate_objects(&[object], 1).is_err());
        object.mask = 0x01;
        assert!(validate_objects(&[object], 1).is_ok());
    }

    #[test]
    fn builtins_are_valid() {
        for name in BUILTIN_SCENES {
            let scene = builtin(name).unwrap();
            scene.validate().unwrap();
            assert!(!scene.objects.is_empty());
            assert!(!scene.lights.is_empty());
        }
        assert!(builtin("castle").is_none());
    }
}
