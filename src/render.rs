use std::ffi::c_char;
use std::path::Path;
use std::rc::Rc;

use crate::camera::CameraPushConstants;
use crate::context::FrameTarget;
use crate::control::SceneChanges;
use crate::gpu::Gpu;
use crate::scene::Scene;

pub mod accel;
pub mod bind;
pub mod buffer;
pub mod image;
pub mod pipeline;
pub mod renderers;
pub mod sbt;

/// Tightly packed RGBA8 pixels read back from the renderer's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Screenshot {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Screenshot {
    pub fn is_empty(&self) -> bool {
        self.rgba.is_empty()
    }
}

// Device and swapchain are owned outside the renderer, the renderer only
// borrows the shared gpu and records into frames it is handed

pub trait Renderer
where
    Self: Sized,
{
    fn new(gpu: &Rc<Gpu>, shader_dir: &Path) -> anyhow::Result<Self>;

    /// Uploads everything `scene` needs. Called once before the first frame.
    fn ingest_scene(&mut self, scene: &Scene) -> anyhow::Result<()>;

    /// Applies edits made since the last frame. Must not be called while a
    /// frame is being recorded.
    fn apply_changes(&mut self, changes: &SceneChanges) -> anyhow::Result<()>;

    fn record_frame(
        &mut self,
        target: &FrameTarget,
        camera: &CameraPushConstants,
    ) -> anyhow::Result<()>;

    fn screenshot(&self) -> anyhow::Result<Screenshot>;

    fn instance_count(&self) -> usize;
    fn light_count(&self) -> usize;

    fn required_device_extensions() -> &'static [*const c_char];
}
