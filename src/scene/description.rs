use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use glam::{Mat4, Vec3, Vec4};
use serde::Deserialize;

use crate::camera::CameraPose;
use crate::scene::{Light, LightList, Mesh, MeshSource, Scene, SceneObject, ShadingInstance};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SceneFile {
    camera: Option<CameraEntry>,
    #[serde(default)]
    meshes: Vec<MeshEntry>,
    #[serde(default)]
    objects: Vec<ObjectEntry>,
    #[serde(default)]
    lights: Vec<LightEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CameraEntry {
    position: [f32; 3],
    #[serde(default)]
    yaw: f32,
    #[serde(default)]
    pitch: f32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MeshEntry {
    name: String,
    source: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ObjectEntry {
    mesh: String,
    #[serde(default)]
    transform: String,
    color: [f32; 4],
    #[serde(default)]
    emission: [f32; 4],
    #[serde(default = "default_mask")]
    mask: u32,
}

fn default_mask() -> u32 {
    super::DEFAULT_MASK
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LightEntry {
    position: [f32; 3],
    radius: f32,
    color: [f32; 3],
    power: f32,
}

pub fn load_scene(path: &Path) -> Result<Scene> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scene {}", path.display()))?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    parse_scene(&text, base_dir).with_context(|| format!("invalid scene {}", path.display()))
}

/// Parses a TOML scene. Relative OBJ paths are resolved against `base_dir`.
pub fn parse_scene(text: &str, base_dir: &Path) -> Result<Scene> {
    let file: SceneFile = toml::from_str(text)?;

    let mut meshes = Vec::new();
    for entry in file.meshes {
        if meshes.iter().any(|x: &Mesh| x.name == entry.name) {
            bail!("mesh '{}' is defined twice", entry.name);
        }
        let source = match entry.source.as_str() {
            "cube" => MeshSource::Cube,
            path => MeshSource::Obj(base_dir.join(path)),
        };
        meshes.push(Mesh {
            name: entry.name,
            source,
        });
    }

    let mut objects = Vec::new();
    for (i, entry) in file.objects.into_iter().enumerate() {
        let mesh = meshes
            .iter()
            .position(|x| x.name == entry.mesh)
            .ok_or_else(|| anyhow!("object {i} uses unknown mesh '{}'", entry.mesh))?;
        let transform = parse_transform(&entry.transform)
            .with_context(|| format!("object {i} has an invalid transform"))?;

        let mut object = SceneObject::new(
            mesh,
            transform,
            ShadingInstance {
                color: Vec4::from_array(entry.color),
                emission: Vec4::from_array(entry.emission),
            },
        );
        object.mask = entry.mask;
        objects.push(object);
    }

    let mut lights = LightList::new();
    for (i, entry) in file.lights.into_iter().enumerate() {
        if entry.power <= 0.0 {
            bail!("light {i} must have positive power");
        }
        lights.push(Light::point(
            Vec3::from_array(entry.position),
            entry.radius,
            Vec3::from_array(entry.color),
            entry.power,
        ));
    }

    let camera = match file.camera {
        Some(entry) => CameraPose {
            position: Vec3::from_array(entry.position),
            yaw: entry.yaw,
            pitch: entry.pitch,
        },
        None => CameraPose::default(),
    };

    let scene = Scene {
        camera,
        meshes,
        objects,
        lights,
    };
    scene.validate()?;
    Ok(scene)
}

/// Evaluates a line based transform program. Each line applies on top of
/// everything above it:
///
/// ```text
/// # comment
/// scale 1 0.1 1
/// rotate 90 0 1 0
/// translate 2 -0.5 3
/// ```
pub fn parse_transform(program: &str) -> Result<Mat4> {
    let mut transform = Mat4::IDENTITY;

    for line in program.lines() {
        let mut tokens = line.split_ascii_whitespace();

        let Some(action) = tokens.next() else {
            // empty means we ignore
            continue;
        };

        let step = match action {
            _ if action.starts_with('#') => continue,
            "identity" => {
                expect_end(action, &mut tokens)?;
                transform = Mat4::IDENTITY;
                continue;
            }
            "translate" => Mat4::from_translation(parse_vec3(action, &mut tokens)?),
            "rotate" => {
                let angle = parse_f32(action, &mut tokens)?.to_radians();
                let axis = parse_vec3(action, &mut tokens)?;
                if axis.length_squared() == 0.0 {
                    bail!("rotate needs a non-zero axis");
                }
                Mat4::from_axis_angle(axis.normalize(), angle)
            }
            "scale" => Mat4::from_scale(parse_vec3(action, &mut tokens)?),
            x => bail!("invalid transform action: {x}"),
        };
        expect_end(action, &mut tokens)?;
        transform = step * transform;
    }

    Ok(transform)
}

fn parse_f32<'a>(action: &str, mut tokens: impl Iterator<Item = &'a str>) -> Result<f32> {
    let num = tokens
        .next()
        .ok_or_else(|| anyhow!("{action}: float expected but not found"))?;
    num.parse()
        .with_context(|| format!("{action}: '{num}' is not a float"))
}

fn parse_vec3<'a>(action: &str, mut tokens: impl Iterator<Item = &'a str>) -> Result<Vec3> {
    let x = parse_f32(action, &mut tokens)?;
    let y = parse_f32(action, &mut tokens)?;
    let z = parse_f32(action, &mut tokens)?;
    Ok(Vec3::new(x, y, z))
}

fn expect_end<'a>(action: &str, mut tokens: impl Iterator<Item = &'a str>) -> Result<()> {
    if let Some(extra) = tokens.next() {
        bail!("{action}: unexpected extra argument '{extra}'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Mat4, b: Mat4) -> bool {
        a.abs_diff_eq(b, 1e-5)
    }

    #[test]
    fn transform_lines_premultiply() {
        let transform = parse_transform(
            "
            # this is a comment that should be ignored
            scale 2 2 2
            translate 1 0 0
            ",
        )
        .unwrap();
        assert!(close(
            transform,
            Mat4::from_translation(Vec3::X) * Mat4::from_scale(Vec3::splat(2.0))
        ));
        assert_eq!(transform.transform_point3(Vec3::ONE), Vec3::new(3.0, 2.0, 2.0));
    }

    #[test]
    fn rotate_uses_degrees() {
        let transform = parse_transform("rotate 90 0 2 0").unwrap();
        let p = transform.transform_point3(Vec3::X);
        assert!((p - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-5);
    }

    #[test]
    fn identity_resets() {
        let transform = parse_transform("translate 5 5 5\nidentity\nscale 1 2 1").unwrap();
        assert!(close(transform, Mat4::from_scale(Vec3::new(1.0, 2.0, 1.0))));
    }

    #[test]
    fn empty_program_is_identity() {
        assert_eq!(parse_transform("").unwrap(), Mat4::IDENTITY);
    }

    #[test]
    fn bad_programs_are_rejected() {
        for program in [
            "translate 1 2",
            "translate 1 2 3 4",
            "scale a b c",
            "rotate 90 0 0 0",
            "identity 1",
            "lookat 0 0 0 1 1 1 0 1 0",
        ] {
            assert!(parse_transform(program).is_err(), "{program}");
        }
    }

    const SCENE: &str = r#"
        [camera]
        position = [1.0, 2.0, 3.0]
        yaw = 1.5

        [[meshes]]
        name = "block"
        source = "cube"

        [[meshes]]
        name = "statue"
        source = "models/statue.obj"

        [[objects]]
        mesh = "block"
        transform = "scale 1 0.1 1\ntranslate 0 -0.5 0"
        color = [0.2, 0.2, 0.2, 0.9]

        [[objects]]
        mesh = "statue"
        color = [1.0, 1.0, 1.0, 0.3]
        emission = [1.0, 0.5, 0.1, 4.0]
        mask = 1

        [[lights]]
        position = [0.0, 3.0, 0.0]
        radius = 8.0
        color = [1.0, 0.9, 0.8]
        power = 5.0
    "#;

    #[test]
    fn parses_full_scene() {
        let scene = parse_scene(SCENE, Path::new("assets")).unwrap();

        assert_eq!(scene.camera.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(scene.camera.yaw, 1.5);
        assert_eq!(scene.camera.pitch, 0.0);

        assert_eq!(scene.meshes.len(), 2);
        assert_eq!(scene.meshes[0].source, MeshSource::Cube);
        assert_eq!(
            scene.meshes[1].source,
            MeshSource::Obj(Path::new("assets").join("models/statue.obj"))
        );

        assert_eq!(scene.objects.len(), 2);
        assert_eq!(scene.objects[0].mesh, 0);
        assert_eq!(scene.objects[0].mask, 0xff);
        assert_eq!(scene.objects[0].shading.emission, Vec4::ZERO);
        assert_eq!(scene.objects[1].mesh, 1);
        assert_eq!(scene.objects[1].mask, 1);
        assert_eq!(scene.objects[1].transform, Mat4::IDENTITY);

        assert_eq!(scene.lights.count(), 1);
        assert_eq!(scene.lights.as_gpu_slice().len(), 2);
    }

    #[test]
    fn missing_camera_uses_default_pose() {
        let scene = parse_scene("", Path::new(".")).unwrap();
        assert_eq!(scene.camera, CameraPose::default());
        assert!(scene.objects.is_empty());
    }

    #[test]
    fn unknown_mesh_is_an_error() {
        let text = r#"
            [[objects]]
            mesh = "ghost"
            color = [1.0, 1.0, 1.0, 1.0]
        "#;
        let err = parse_scene(text, Path::new(".")).unwrap_err();
        assert!(format!("{err:#}").contains("ghost"));
    }

    #[test]
    fn duplicate_mesh_names_are_an_error() {
        let text = r#"
            [[meshes]]
            name = "a"
            source = "cube"
            [[meshes]]
            name = "a"
            source = "cube"
        "#;
        assert!(parse_scene(text, Path::new(".")).is_err());
    }

    #[test]
    fn unlit_light_is_an_error() {
        let text = r#"
            [[lights]]
            position = [0.0, 0.0, 0.0]
            radius = 1.0
            color = [1.0, 1.0, 1.0]
            power = 0.0
        "#;
        assert!(parse_scene(text, Path::new(".")).is_err());
    }

    #[test]
    fn unknown_fields_are_an_error() {
        assert!(parse_scene("[camera]\nposition = [0.0, 0.0, 0.0]\nfov = 90", Path::new(".")).is_err());
    }
}
