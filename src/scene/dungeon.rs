use glam::{Mat4, Quat, Vec3, Vec4};

use crate::camera::CameraPose;
use crate::scene::{Light, LightList, Mesh, MeshSource, Scene, SceneObject, ShadingInstance};

const ROOM_SIZE: usize = 10;
const WALL_HEIGHT: f32 = 1.0;
const CUBE: usize = 0;

fn cube_mesh() -> Vec<Mesh> {
    vec![Mesh {
        name: "cube".into(),
        source: MeshSource::Cube,
    }]
}

fn block(position: Vec3, size: Vec3, shading: ShadingInstance) -> SceneObject {
    SceneObject::new(
        CUBE,
        Mat4::from_translation(position) * Mat4::from_scale(size),
        shading,
    )
}

/// A letter "A" out of four cubes: two slanted legs, a crossbar and a cap.
fn letter_a(
    objects: &mut Vec<SceneObject>,
    position: Vec3,
    scale: f32,
    yaw: f32,
    shading: ShadingInstance,
) {
    const WIDTH: f32 = 1.0;
    const HEIGHT: f32 = 1.5;
    const DEPTH: f32 = 0.3;
    const LEG_WIDTH: f32 = 0.15;

    let base = Mat4::from_translation(position)
        * Mat4::from_rotation_y(yaw)
        * Mat4::from_scale(Vec3::splat(scale));

    let leg = |x: f32, tilt_degrees: f32| {
        base * Mat4::from_scale_rotation_translation(
            Vec3::new(LEG_WIDTH, HEIGHT * 0.9, DEPTH),
            Quat::from_rotation_z(tilt_degrees.to_radians()),
            Vec3::new(x, 0.0, 0.0),
        )
    };
    let bar = |y: f32, size: Vec3| base * Mat4::from_translation(Vec3::new(0.0, y, 0.0)) * Mat4::from_scale(size);

    for transform in [
        leg(-WIDTH * 0.22, -12.0),
        leg(WIDTH * 0.22, 12.0),
        bar(-HEIGHT * 0.15, Vec3::new(WIDTH * 0.5, LEG_WIDTH * 0.8, DEPTH)),
        bar(HEIGHT * 0.4, Vec3::new(LEG_WIDTH * 1.2, LEG_WIDTH * 0.8, DEPTH)),
    ] {
        objects.push(SceneObject::new(CUBE, transform, shading));
    }
}

/// The demo room: a 10x10 tiled floor enclosed by walls, a torch on a centre
/// pillar, torches in the corners and three coloured letters lit by matching
/// accent lights.
pub fn dungeon_scene() -> Scene {
    let size = ROOM_SIZE as f32;
    let center = size / 2.0;
    let mut objects = Vec::new();
    let mut lights = LightList::new();

    let floor = ShadingInstance::matte(Vec3::splat(0.15), 0.95);
    for z in 0..ROOM_SIZE {
        for x in 0..ROOM_SIZE {
            objects.push(block(
                Vec3::new(x as f32, -0.5, z as f32),
                Vec3::new(1.0, 0.1, 1.0),
                floor,
            ));
        }
    }

    let wall = ShadingInstance::matte(Vec3::new(0.3, 0.3, 0.35), 0.9);
    let y = WALL_HEIGHT / 2.0;
    for i in 0..ROOM_SIZE {
        let i = i as f32;
        let along_x = Vec3::new(1.0, WALL_HEIGHT, 0.2);
        let along_z = Vec3::new(0.2, WALL_HEIGHT, 1.0);
        objects.push(block(Vec3::new(i, y, -0.5), along_x, wall));
        objects.push(block(Vec3::new(i, y, size - 0.5), along_x, wall));
        objects.push(block(Vec3::new(-0.5, y, i), along_z, wall));
        objects.push(block(Vec3::new(size - 0.5, y, i), along_z, wall));
    }

    objects.push(block(
        Vec3::new(center, WALL_HEIGHT / 2.0, center),
        Vec3::new(0.5, WALL_HEIGHT, 0.5),
        ShadingInstance::matte(Vec3::new(0.4, 0.35, 0.3), 0.85),
    ));
    objects.push(block(
        Vec3::new(center, WALL_HEIGHT + 0.2, center),
        Vec3::new(0.2, 0.35, 0.2),
        ShadingInstance::glowing(Vec3::new(1.0, 0.7, 0.3), 0.15, Vec3::new(1.0, 0.55, 0.15), 8.0),
    ));

    letter_a(
        &mut objects,
        Vec3::new(3.0, 1.0, 3.0),
        1.5,
        30f32.to_radians(),
        ShadingInstance::matte(Vec3::new(1.0, 0.1, 0.1), 0.6),
    );
    letter_a(
        &mut objects,
        Vec3::new(center, 1.5, center - 2.0),
        2.5,
        0.0,
        ShadingInstance::matte(Vec3::new(0.1, 1.0, 0.2), 0.6),
    );
    letter_a(
        &mut objects,
        Vec3::new(7.0, 1.2, 3.0),
        1.8,
        -20f32.to_radians(),
        ShadingInstance::matte(Vec3::new(0.1, 0.3, 1.0), 0.6),
    );

    // pillar torch
    lights.push(Light::point(
        Vec3::new(center, WALL_HEIGHT + 0.5, center),
        12.0,
        Vec3::new(1.0, 0.6, 0.3),
        8.0,
    ));

    let offset = 1.5;
    let far = size - offset - 1.0;
    let torch_y = WALL_HEIGHT * 0.7;
    for (x, z) in [(offset, offset), (far, offset), (offset, far), (far, far)] {
        let position = Vec3::new(x, torch_y, z);
        objects.push(block(
            position,
            Vec3::new(0.12, 0.25, 0.12),
            ShadingInstance::glowing(Vec3::new(1.0, 0.6, 0.2), 0.2, Vec3::new(1.0, 0.5, 0.1), 5.0),
        ));
        lights.push(Light::point(
            position + Vec3::new(0.0, 0.3, 0.0),
            10.0,
            Vec3::new(1.0, 0.55, 0.25),
            5.0,
        ));
    }

    // accents next to each letter
    lights.push(Light::point(Vec3::new(3.0, 2.5, 3.0), 5.0, Vec3::new(1.0, 0.2, 0.1), 6.0));
    lights.push(Light::point(
        Vec3::new(center, 3.5, center - 2.0),
        6.0,
        Vec3::new(0.2, 1.0, 0.3),
        6.0,
    ));
    lights.push(Light::point(Vec3::new(7.0, 2.5, 3.0), 5.0, Vec3::new(0.2, 0.4, 1.0), 6.0));

    // overhead fill
    lights.push(Light::point(
        Vec3::new(center, WALL_HEIGHT + 2.0, center),
        20.0,
        Vec3::ONE,
        1.5,
    ));

    Scene {
        camera: CameraPose::default(),
        meshes: cube_mesh(),
        objects,
        lights,
    }
}

/// One grey cube at the origin under a single white light.
pub fn single_cube_scene() -> Scene {
    Scene {
        camera: CameraPose {
            position: Vec3::new(0.0, 1.0, 3.0),
            yaw: std::f32::consts::PI,
            pitch: -0.3,
        },
        meshes: cube_mesh(),
        objects: vec![SceneObject::new(
            CUBE,
            Mat4::IDENTITY,
            ShadingInstance {
                color: Vec4::new(0.5, 0.5, 0.5, 0.8),
                emission: Vec4::ZERO,
            },
        )],
        lights: [Light::point(Vec3::new(0.0, 2.0, 0.0), 10.0, Vec3::ONE, 5.0)]
            .into_iter()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dungeon_contents() {
        let scene = dungeon_scene();
        // floor, walls, pillar, pillar torch, three letters, corner torches
        assert_eq!(scene.objects.len(), 100 + 40 + 1 + 1 + 3 * 4 + 4);
        assert_eq!(scene.lights.count(), 9);
        assert_eq!(scene.lights.as_gpu_slice().len(), 10);
        scene.validate().unwrap();
    }

    #[test]
    fn torches_glow() {
        let scene = dungeon_scene();
        let glowing = scene
            .objects
            .iter()
            .filter(|x| x.shading.emission.w > 0.0)
            .count();
        assert_eq!(glowing, 5);
    }

    #[test]
    fn floor_stays_inside_the_room() {
        let scene = dungeon_scene();
        for object in &scene.objects[..100] {
            let p = object.transform.col(3).truncate();
            assert_eq!(p.y, -0.5);
            assert!((0.0..ROOM_SIZE as f32).contains(&p.x));
            assert!((0.0..ROOM_SIZE as f32).contains(&p.z));
        }
    }

    #[test]
    fn single_cube_matches_smoke_scene() {
        let scene = single_cube_scene();
        assert_eq!(scene.objects.len(), 1);
        assert_eq!(scene.objects[0].transform, Mat4::IDENTITY);
        assert_eq!(scene.lights.count(), 1);
        assert_eq!(
            scene.lights.as_gpu_slice()[0].position,
            Vec4::new(0.0, 2.0, 0.0, 10.0)
        );
    }
}
