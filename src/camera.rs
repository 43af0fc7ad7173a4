use std::collections::BTreeMap;
use std::f32::consts::PI;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use winit::keyboard::KeyCode;

#[derive(Debug, Copy, Clone)]
enum Direction {
    None = 0,
    Forward = 0x1,
    Backward = 0x2,
    Left = 0x4,
    Right = 0x8,
    Up = 0x10,
    Down = 0x20,
}

pub const FOV_DEGREES: f32 = 75.0;
pub const NEAR: f32 = 0.1;
pub const FAR: f32 = 100.0;
pub const PITCH_LIMIT: f32 = 1.5;

/// Where the camera is and where it looks. Y is up, yaw 0 looks down +Z.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
}

impl Default for CameraPose {
    fn default() -> Self {
        // just inside the room, facing the glyphs
        CameraPose {
            position: Vec3::new(5.0, 1.0, 8.0),
            yaw: PI,
            pitch: 0.0,
        }
    }
}

impl CameraPose {
    pub fn forward(&self) -> Vec3 {
        Vec3::new(
            self.yaw.sin() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.cos() * self.pitch.cos(),
        )
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(Vec3::Y).normalize()
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward(), Vec3::Y)
    }

    fn clamped(mut self) -> CameraPose {
        self.pitch = self.pitch.clamp(-PITCH_LIMIT, PITCH_LIMIT);
        self
    }
}

/// Vulkan style projection: right handed, depth 0..1, clip space y down.
pub fn perspective(aspect: f32) -> Mat4 {
    let mut perspective = Mat4::perspective_rh(FOV_DEGREES.to_radians(), aspect, NEAR, FAR);
    perspective.y_axis = -perspective.y_axis;
    perspective
}

/// Pushed once per frame. Matches the raygen shader's push constant block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraPushConstants {
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
    /// xyz = position, w = seconds since start
    pub position: Vec4,
}

pub struct Camera {
    pose: CameraPose,
    aspect: f32,

    key_movements: BTreeMap<KeyCode, (Direction, fn(&CameraPose) -> Vec3)>,
    movement_direction: u32,
    speed_modifier: f32,
    moved: bool,
}

impl Camera {
    const SPEED: f32 = 3.0;
    const MOUSE_SENSITIVITY: f32 = 0.002;

    pub fn new(pose: CameraPose, width: u32, height: u32) -> Camera {
        let mut key_movements: BTreeMap<KeyCode, (Direction, fn(&CameraPose) -> Vec3)> =
            BTreeMap::new();
        key_movements.insert(KeyCode::KeyW, (Direction::Forward, |p: &CameraPose| p.forward()));
        key_movements.insert(KeyCode::KeyS, (Direction::Backward, |p: &CameraPose| -p.forward()));
        key_movements.insert(KeyCode::KeyA, (Direction::Left, |p: &CameraPose| -p.right()));
        key_movements.insert(KeyCode::KeyD, (Direction::Right, |p: &CameraPose| p.right()));
        key_movements.insert(KeyCode::Space, (Direction::Up, |_: &CameraPose| Vec3::Y));
        key_movements.insert(KeyCode::ControlLeft, (Direction::Down, |_: &CameraPose| -Vec3::Y));

        let mut out = Camera {
            pose: pose.clamped(),
            aspect: 1.0,
            key_movements,
            movement_direction: Direction::None as u32,
            speed_modifier: 1.0,
            moved: false,
        };
        out.handle_resize(width, height);
        out
    }

    pub fn pose(&self) -> CameraPose {
        self.pose
    }

    /// Replaces the pose, e.g. when set from the control channel.
    pub fn set_pose(&mut self, pose: CameraPose) {
        self.pose = pose.clamped();
    }

    pub fn handle_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.aspect = width as f32 / height as f32;
    }

    pub fn handle_key_input(&mut self, key: KeyCode, pressed: bool) {
        if let Some((direction, _)) = self.key_movements.get(&key) {
            if pressed {
                self.movement_direction |= *direction as u32;
            } else {
                self.movement_direction &= !(*direction as u32);
            }
        }
        if key == KeyCode::ShiftLeft || key == KeyCode::ShiftRight {
            self.speed_modifier = if pressed { 2.0 } else { 1.0 };
        }
    }

    /// Takes raw mouse motion in pixels.
    pub fn handle_mouse_input(&mut self, dx: f32, dy: f32) {
        self.pose.yaw -= dx * Self::MOUSE_SENSITIVITY;
        self.pose.pitch -= dy * Self::MOUSE_SENSITIVITY;
        self.pose = self.pose.clamped();
        self.moved = true;
    }

    pub fn handle_movement(&mut self, dt: f32) {
        let mut step = Vec3::ZERO;
        for (d, movement_fn) in self.key_movements.values() {
            if self.movement_direction & (*d as u32) == (*d as u32) {
                step += movement_fn(&self.pose);
            }
        }
        if step != Vec3::ZERO {
            self.pose.position += Self::SPEED * dt * self.speed_modifier * step;
            self.moved = true;
        }
    }

    /// Whether the pose changed through input since the last call.
    pub fn take_moved(&mut self) -> bool {
        std::mem::take(&mut self.moved)
    }

    pub fn push_constants(&self, time: f32) -> CameraPushConstants {
        CameraPushConstants {
            view_inverse: self.pose.view().inverse(),
            proj_inverse: perspective(self.aspect).inverse(),
            position: self.pose.position.extend(time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn push_block_fits_minimum_push_constant_size() {
        assert_eq!(std::mem::size_of::<CameraPushConstants>(), 144);
        assert!(std::mem::size_of::<CameraPushConstants>() <= 256);
    }

    #[test]
    fn default_pose_looks_into_the_room() {
        let pose = CameraPose::default();
        assert!(close(pose.forward(), Vec3::new(0.0, 0.0, -1.0)));
        assert!(close(pose.right(), Vec3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn pitch_is_clamped() {
        let mut camera = Camera::new(CameraPose::default(), 640, 480);
        camera.handle_mouse_input(0.0, -100_000.0);
        assert_eq!(camera.pose().pitch, PITCH_LIMIT);
        camera.handle_mouse_input(0.0, 100_000.0);
        assert_eq!(camera.pose().pitch, -PITCH_LIMIT);
        assert!(camera.take_moved());
        assert!(!camera.take_moved());
    }

    #[test]
    fn moving_right_follows_mouse() {
        let mut camera = Camera::new(CameraPose::default(), 640, 480);
        let right = camera.pose().right();
        camera.handle_mouse_input(100.0, 0.0);
        // turning right swings the view toward the old right vector
        assert!(camera.pose().forward().dot(right) > 0.0);
    }

    #[test]
    fn shift_doubles_speed() {
        let mut camera = Camera::new(CameraPose::default(), 640, 480);
        camera.handle_key_input(KeyCode::KeyW, true);
        camera.handle_movement(1.0);
        let walked = camera.pose().position;
        assert!(close(walked, Vec3::new(5.0, 1.0, 5.0)));

        camera.handle_key_input(KeyCode::ShiftLeft, true);
        camera.handle_movement(0.5);
        assert!(close(camera.pose().position, Vec3::new(5.0, 1.0, 2.0)));

        camera.handle_key_input(KeyCode::KeyW, false);
        camera.take_moved();
        camera.handle_movement(1.0);
        assert!(!camera.take_moved());
    }

    #[test]
    fn push_constants_invert_view_and_projection() {
        let camera = Camera::new(CameraPose::default(), 1280, 720);
        let constants = camera.push_constants(2.5);

        assert!(close(
            constants.view_inverse.col(3).truncate(),
            Vec3::new(5.0, 1.0, 8.0)
        ));
        assert_eq!(constants.position.w, 2.5);

        let projection = constants.proj_inverse.inverse();
        // y points down in clip space
        assert!(projection.y_axis.y < 0.0);
        assert!((projection.y_axis.y.abs() * 720.0 / 1280.0 - projection.x_axis.x).abs() < 1e-4);
    }
}
