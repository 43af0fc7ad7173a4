use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::camera::CameraPose;
use crate::scene::{validate_objects, LightList, Scene, SceneObject};
use crate::window::WindowBounds;

/// Timing and content counters, published once per frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    pub frame: u64,
    pub fps: f32,
    pub frame_time_ms: f32,
    pub instance_count: usize,
    /// sentinel excluded
    pub light_count: usize,
}

/// Everything written through a [`SceneHandle`] since the last
/// [`SceneHandle::take_changes`]. Unchanged parts are `None`.
#[derive(Debug, Clone, Default)]
pub struct SceneChanges {
    pub camera: Option<CameraPose>,
    pub objects: Option<Vec<SceneObject>>,
    pub lights: Option<LightList>,
    pub window_bounds: Option<WindowBounds>,
}

impl SceneChanges {
    pub fn is_empty(&self) -> bool {
        self.camera.is_none()
            && self.objects.is_none()
            && self.lights.is_none()
            && self.window_bounds.is_none()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Dirty {
    camera: bool,
    objects: bool,
    lights: bool,
    window_bounds: bool,
}

struct ControlState {
    camera: CameraPose,
    objects: Vec<SceneObject>,
    lights: LightList,
    mesh_count: usize,
    stats: FrameStats,
    observed_bounds: Option<WindowBounds>,
    requested_bounds: Option<WindowBounds>,
    dirty: Dirty,
}

/// Shared scene state between the frame loop and an external controller
/// such as an editor, possibly on another thread.
///
/// Setters only record the new value; the frame loop applies whatever was
/// written last before it starts the next frame.
#[derive(Clone)]
pub struct SceneHandle {
    inner: Arc<Mutex<ControlState>>,
}

impl SceneHandle {
    pub fn new(scene: &Scene) -> SceneHandle {
        SceneHandle {
            inner: Arc::new(Mutex::new(ControlState {
                camera: scene.camera,
                objects: scene.objects.clone(),
                lights: scene.lights.clone(),
                mesh_count: scene.meshes.len(),
                stats: FrameStats {
                    instance_count: scene.objects.len(),
                    light_count: scene.lights.count(),
                    ..Default::default()
                },
                observed_bounds: None,
                requested_bounds: None,
                dirty: Dirty::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        // the state stays consistent even if a writer panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn camera(&self) -> CameraPose {
        self.lock().camera
    }

    pub fn set_camera(&self, pose: CameraPose) {
        let mut state = self.lock();
        state.camera = pose;
        state.dirty.camera = true;
    }

    /// Mirrors a pose the frame loop moved to itself, without flagging a change.
    pub fn record_camera(&self, pose: CameraPose) {
        self.lock().camera = pose;
    }

    pub fn objects(&self) -> Vec<SceneObject> {
        self.lock().objects.clone()
    }

    /// Fails without changing anything if an object references a mesh that
    /// was never loaded.
    pub fn set_objects(&self, objects: Vec<SceneObject>) -> Result<()> {
        let mut state = self.lock();
        validate_objects(&objects, state.mesh_count)?;
        state.objects = objects;
        state.dirty.objects = true;
        Ok(())
    }

    pub fn lights(&self) -> LightList {
        self.lock().lights.clone()
    }

    pub fn set_lights(&self, lights: LightList) {
        let mut state = self.lock();
        state.lights = lights;
        state.dirty.lights = true;
    }

    pub fn stats(&self) -> FrameStats {
        self.lock().stats
    }

    pub fn publish_stats(&self, stats: FrameStats) {
        self.lock().stats = stats;
    }

    /// Last window geometry reported by the platform.
    pub fn window_bounds(&self) -> Option<WindowBounds> {
        self.lock().observed_bounds
    }

    pub fn observe_window_bounds(&self, bounds: WindowBounds) {
        self.lock().observed_bounds = Some(bounds);
    }

    /// Asks the frame loop to move and resize the window.
    pub fn request_window_bounds(&self, bounds: WindowBounds) {
        let mut state = self.lock();
        state.requested_bounds = Some(bounds);
        state.dirty.window_bounds = true;
    }

    /// Drains the pending changes. Called once per frame.
    pub fn take_changes(&self) -> SceneChanges {
        let mut state = self.lock();
        let dirty = std::mem::take(&mut state.dirty);

        SceneChanges {
            camera: dirty.camera.then_some(state.camera),
            objects: dirty.objects.then(|| state.objects.clone()),
            lights: dirty.lights.then(|| state.lights.clone()),
            window_bounds: if dirty.window_bounds {
                state.requested_bounds.take()
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::*;
    use crate::scene::dungeon::single_cube_scene;
    use crate::scene::{Light, ShadingInstance};

    fn object(mesh: usize) -> SceneObject {
        SceneObject::new(mesh, Mat4::IDENTITY, ShadingInstance::matte(Vec3::ONE, 0.5))
    }

    #[test]
    fn starts_without_changes() {
        let handle = SceneHandle::new(&single_cube_scene());
        assert!(handle.take_changes().is_empty());
        assert_eq!(handle.stats().instance_count, 1);
        assert_eq!(handle.stats().light_count, 1);
    }

    #[test]
    fn changes_are_drained_once() {
        let handle = SceneHandle::new(&single_cube_scene());
        handle.set_objects(vec![object(0), object(0)]).unwrap();

        let changes = handle.take_changes();
        assert_eq!(changes.objects.map(|x| x.len()), Some(2));
        assert!(changes.camera.is_none());
        assert!(changes.lights.is_none());
        assert!(handle.take_changes().is_empty());
        assert_eq!(handle.objects().len(), 2);
    }

    #[test]
    fn last_write_wins() {
        let handle = SceneHandle::new(&single_cube_scene());
        let mut pose = CameraPose::default();
        for x in 0..5 {
            pose.position.x = x as f32;
            handle.set_camera(pose);
        }
        assert_eq!(handle.take_changes().camera.unwrap().position.x, 4.0);
    }

    #[test]
    fn unknown_mesh_is_rejected() {
        let handle = SceneHandle::new(&single_cube_scene());
        assert!(handle.set_objects(vec![object(0), object(3)]).is_err());
        assert!(handle.take_changes().is_empty());
        assert_eq!(handle.objects().len(), 1);
    }

    #[test]
    fn recorded_camera_is_not_a_change() {
        let handle = SceneHandle::new(&single_cube_scene());
        let pose = CameraPose::default();
        handle.record_camera(pose);
        assert_eq!(handle.camera(), pose);
        assert!(handle.take_changes().is_empty());
    }

    #[test]
    fn window_requests_are_consumed() {
        let handle = SceneHandle::new(&single_cube_scene());
        let bounds = WindowBounds {
            x: 10,
            y: 20,
            width: 300,
            height: 200,
        };
        handle.observe_window_bounds(bounds);
        assert_eq!(handle.window_bounds(), Some(bounds));
        assert!(handle.take_changes().is_empty());

        handle.request_window_bounds(bounds);
        assert_eq!(handle.take_changes().window_bounds, Some(bounds));
        assert!(handle.take_changes().window_bounds.is_none());
    }

    #[test]
    fn writes_from_another_thread_are_seen() {
        let handle = SceneHandle::new(&single_cube_scene());
        let remote = handle.clone();
        std::thread::spawn(move || {
            let lights: LightList = [
                Light::point(Vec3::ZERO, 1.0, Vec3::ONE, 1.0),
                Light::point(Vec3::ONE, 1.0, Vec3::ONE, 2.0),
            ]
            .into_iter()
            .collect();
            remote.set_lights(lights);
        })
        .join()
        .unwrap();

        let lights = handle.take_changes().lights.unwrap();
        assert_eq!(lights.count(), 2);
    }
}
