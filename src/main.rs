use std::ffi::{c_char, CStr};
use std::process::ExitCode;
use std::ptr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ash::vk::{
    DebugUtilsMessageSeverityFlagsEXT, DebugUtilsMessageTypeFlagsEXT,
    DebugUtilsMessengerCreateInfoEXT, EXT_DEBUG_UTILS_NAME,
};
use ash::{ext, vk, Entry, Instance};
use clap::Parser;
use env_logger::Builder;
use log::{debug, error, info, warn, LevelFilter};
use winit::application::ApplicationHandler;
use winit::dpi::{PhysicalPosition, PhysicalSize};
use winit::event::{DeviceEvent, DeviceId, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::raw_window_handle::HasDisplayHandle;
use winit::window::{CursorGrabMode, WindowAttributes, WindowId};

use camera::Camera;
use config::{Args, RunConfig};
use context::VulkanContext;
use control::{FrameStats, SceneHandle};
use debug::DebugUtilsData;
use defer::Defer;
use render::renderers::RaytraceRenderer;
use render::Renderer;
use scene::Scene;
use window::{WindowBounds, WindowData, WindowRegistry};

mod camera;
mod capture;
mod config;
mod context;
mod control;
mod debug;
mod defer;
mod features;
mod gpu;
mod render;
mod scene;
mod swapchain;
mod utils;
mod window;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const APPLICATION_NAME: &CStr = c"dungeon-rt";
const TITLE_INTERVAL: Duration = Duration::from_millis(500);

struct App<R> {
    // WARNING: ORDER MATTERS HERE!!!
    // fields are dropped from top to bottom (not bottom to top like C++)
    // make sure to also update the Drop impl when adding fields
    renderer: Option<R>,
    context: Option<VulkanContext>,
    windows: WindowRegistry<WindowId, WindowData>,
    debug_data: Option<DebugUtilsData>,
    instance: Instance,
    vk_lib: Entry,

    config: RunConfig,
    scene: Scene,
    handle: SceneHandle,
    camera: Camera,

    started: Instant,
    last_frame: Instant,
    frames_rendered: u64,
    title_updated: Instant,
    frames_since_title: u32,
    fps: f32,
    error: Option<anyhow::Error>,
}

impl<R: Renderer> App<R> {
    pub fn new(event_loop: &EventLoop<()>, config: RunConfig, scene: Scene) -> Result<Self> {
        let vk_lib = unsafe { Entry::load() }.context("failed to load Vulkan library")?;

        let enable_vk_debug = config.validation && Self::is_vk_debug_supported(&vk_lib)?;
        if config.validation && !enable_vk_debug {
            warn!("validation requested, but validation layer/debug_utils extension are not found/supported");
        }

        let mut debug_utils_info = enable_vk_debug.then(|| DebugUtilsMessengerCreateInfoEXT {
            message_severity: DebugUtilsMessageSeverityFlagsEXT::ERROR
                | DebugUtilsMessageSeverityFlagsEXT::WARNING
                | DebugUtilsMessageSeverityFlagsEXT::INFO
                | DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            message_type: DebugUtilsMessageTypeFlagsEXT::GENERAL
                | DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                | DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            pfn_user_callback: Some(debug::debug_callback),
            p_user_data: ptr::null_mut(),
            ..Default::default()
        });

        let validation_feature_enable = [
            vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION,
            vk::ValidationFeatureEnableEXT::BEST_PRACTICES,
        ];
        let mut validation_features = enable_vk_debug.then(|| vk::ValidationFeaturesEXT {
            enabled_validation_feature_count: validation_feature_enable.len() as u32,
            p_enabled_validation_features: validation_feature_enable.as_ptr(),
            ..Default::default()
        });

        let instance = Self::create_instance(
            &vk_lib,
            event_loop,
            debug_utils_info.as_mut(),
            validation_features.as_mut(),
        )?
        .defer(|x| unsafe { x.destroy_instance(None) });

        let debug_data = debug_utils_info
            .map(|x| {
                let loader = ext::debug_utils::Instance::new(&vk_lib, &instance);
                unsafe { DebugUtilsData::new(loader, &x) }
            })
            .transpose()?;

        let handle = SceneHandle::new(&scene);
        let camera = Camera::new(scene.camera, config.width, config.height);
        let now = Instant::now();

        Ok(App {
            renderer: None,
            context: None,
            windows: WindowRegistry::new(),
            debug_data,
            instance: instance.undefer(),
            vk_lib,
            config,
            scene,
            handle,
            camera,
            started: now,
            last_frame: now,
            frames_rendered: 0,
            title_updated: now,
            frames_since_title: 0,
            fps: 0.0,
            error: None,
        })
    }

    fn is_vk_debug_supported(vk_lib: &Entry) -> Result<bool> {
        let available_layers = unsafe { vk_lib.enumerate_instance_layer_properties()? };
        let supported_extensions = unsafe { vk_lib.enumerate_instance_extension_properties(None)? };

        let validation_layer_supported = available_layers
            .iter()
            .any(|x| x.layer_name_as_c_str().is_ok_and(|x| x == VALIDATION_LAYER));
        let debug_extensions_supported = supported_extensions
            .iter()
            .any(|x| x.extension_name_as_c_str().is_ok_and(|x| x == EXT_DEBUG_UTILS_NAME));

        Ok(validation_layer_supported && debug_extensions_supported)
    }

    fn get_layers_and_extensions(
        event_loop: &EventLoop<()>,
        use_debug_layers: bool,
    ) -> Result<(Vec<*const c_char>, Vec<*const c_char>)> {
        let mut layers = Vec::new();
        let mut extensions = Vec::new();

        if use_debug_layers {
            layers.push(VALIDATION_LAYER.as_ptr());
            extensions.push(EXT_DEBUG_UTILS_NAME.as_ptr());
        }

        let display_handle = event_loop.owned_display_handle();
        let raw_display_handle = display_handle.display_handle()?.as_raw();
        let required_extensions = ash_window::enumerate_required_extensions(raw_display_handle)?;
        extensions.extend_from_slice(required_extensions);

        Ok((layers, extensions))
    }

    fn create_instance(
        vk_lib: &Entry,
        event_loop: &EventLoop<()>,
        debug_utils_info: Option<&mut DebugUtilsMessengerCreateInfoEXT>,
        validation_features: Option<&mut vk::ValidationFeaturesEXT>,
    ) -> Result<Instance> {
        let (layers, extensions) =
            Self::get_layers_and_extensions(event_loop, debug_utils_info.is_some())?;

        let app_info = vk::ApplicationInfo {
            p_application_name: APPLICATION_NAME.as_ptr(),
            application_version: vk::make_api_version(
                0,
                env!("CARGO_PKG_VERSION_MAJOR").parse()?,
                env!("CARGO_PKG_VERSION_MINOR").parse()?,
                env!("CARGO_PKG_VERSION_PATCH").parse()?,
            ),
            api_version: vk::API_VERSION_1_3,
            ..Default::default()
        };

        let mut create_info = vk::InstanceCreateInfo {
            p_application_info: &app_info,
            enabled_layer_count: layers.len() as u32,
            pp_enabled_layer_names: layers.as_ptr(),
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            ..Default::default()
        };

        if let Some(debug_utils_info) = debug_utils_info {
            create_info = create_info.push_next(debug_utils_info);
        }

        if let Some(validation_features) = validation_features {
            create_info = create_info.push_next(validation_features);
        }

        unsafe { vk_lib.create_instance(&create_info, None) }.context("failed to create instance")
    }

    /// Creates the window, the device behind it and the renderer, then
    /// uploads the initial scene. Later changes arrive through the scene handle.
    fn init_graphics(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop.create_window(
            WindowAttributes::default()
                .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
                .with_title("dungeon-rt"),
        )?;
        debug!("created window: {:?}", window.title());

        if !self.config.editor_mode {
            let grabbed = window
                .set_cursor_grab(CursorGrabMode::Confined)
                .or_else(|_| window.set_cursor_grab(CursorGrabMode::Locked));
            if let Err(e) = grabbed {
                warn!("could not grab the cursor: {e}");
            }
            window.set_cursor_visible(false);
        }

        let id = window.id();
        let data = WindowData::new(window);
        self.handle.observe_window_bounds(data.bounds());

        let extensions = [
            VulkanContext::required_device_extensions(),
            R::required_device_extensions(),
        ]
        .concat();
        let context = VulkanContext::new(&self.vk_lib, &self.instance, &data, &extensions)?;
        let extent = context.extent();
        info!(
            "presenting {:?} at {}x{}",
            context.surface_format(),
            extent.width,
            extent.height
        );
        self.camera.handle_resize(extent.width, extent.height);

        let mut renderer = R::new(context.gpu(), &self.config.shader_dir)?;
        renderer.ingest_scene(&self.scene)?;

        data.window().request_redraw();
        self.windows.register(id, data);
        self.context = Some(context);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn apply_window_bounds(&self, bounds: WindowBounds) {
        let Some(data) = self.windows.primary() else {
            return;
        };
        let window = data.window();
        window.set_outer_position(PhysicalPosition::new(bounds.x, bounds.y));
        if bounds.width > 0 && bounds.height > 0 {
            // the resize event arrives later and triggers swapchain recreation
            let _ = window.request_inner_size(PhysicalSize::new(bounds.width, bounds.height));
        }
    }

    fn draw_frame(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame);
        self.last_frame = now;

        // everything written since the last frame lands before this one starts
        let changes = self.handle.take_changes();
        if !changes.is_empty() {
            if let Some(pose) = changes.camera {
                self.camera.set_pose(pose);
            }
            if let Some(bounds) = changes.window_bounds {
                self.apply_window_bounds(bounds);
            }
            if let Some(renderer) = self.renderer.as_mut() {
                renderer.apply_changes(&changes)?;
            }
        }

        self.camera.handle_movement(dt.as_secs_f32());
        if self.camera.take_moved() {
            self.handle.record_camera(self.camera.pose());
        }

        let (Some(renderer), Some(context), Some(window)) = (
            self.renderer.as_mut(),
            self.context.as_mut(),
            self.windows.primary_mut(),
        ) else {
            return Ok(());
        };

        let Some(target) = context.begin_frame(window)? else {
            return Ok(());
        };
        self.camera
            .handle_resize(target.extent.width, target.extent.height);
        let push_constants = self
            .camera
            .push_constants(self.started.elapsed().as_secs_f32());
        renderer.record_frame(&target, &push_constants)?;
        context.end_frame(window)?;

        self.frames_rendered += 1;
        self.publish_stats(now, dt);

        if self
            .config
            .frames
            .is_some_and(|limit| self.frames_rendered >= limit)
        {
            event_loop.exit();
        }
        Ok(())
    }

    fn publish_stats(&mut self, now: Instant, dt: Duration) {
        let Some(renderer) = self.renderer.as_ref() else {
            return;
        };
        let instance_count = renderer.instance_count();
        let light_count = renderer.light_count();

        self.frames_since_title += 1;
        let since_title = now.duration_since(self.title_updated);
        if since_title >= TITLE_INTERVAL {
            self.fps = self.frames_since_title as f32 / since_title.as_secs_f32();
            self.frames_since_title = 0;
            self.title_updated = now;
            if let Some(data) = self.windows.primary() {
                data.window().set_title(&format!(
                    "dungeon-rt | {:.0} fps | {instance_count} instances | {light_count} lights",
                    self.fps
                ));
            }
        }

        self.handle.publish_stats(FrameStats {
            frame: self.frames_rendered,
            fps: self.fps,
            frame_time_ms: dt.as_secs_f32() * 1000.0,
            instance_count,
            light_count,
        });
    }

    fn write_screenshot(&mut self) -> Result<()> {
        let (Some(path), Some(renderer), Some(context)) = (
            self.config.screenshot.as_ref(),
            self.renderer.as_ref(),
            self.context.as_ref(),
        ) else {
            return Ok(());
        };

        context.wait_idle()?;
        let shot = renderer.screenshot()?;
        if shot.is_empty() {
            warn!("nothing was rendered, no screenshot written");
            return Ok(());
        }
        capture::save_ppm(path, &shot.rgba, shot.width, shot.height)
    }

    /// Keeps the first error for `main` to report and stops the loop.
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        self.error.get_or_insert(e);
        event_loop.exit();
    }
}

impl<R> Drop for App<R> {
    fn drop(&mut self) {
        drop(self.renderer.take());
        drop(self.context.take());
        drop(std::mem::replace(&mut self.windows, WindowRegistry::new()));
        drop(self.debug_data.take());
        unsafe { self.instance.destroy_instance(None) };
    }
}

impl<R: Renderer> ApplicationHandler for App<R> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        debug!("App resuming...");
        if self.context.is_none() {
            if let Err(e) = self.init_graphics(event_loop) {
                self.fail(event_loop, e.context("failed to initialize graphics"));
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(data) = self.windows.get_mut(window_id) else {
            return;
        };
        data.observe(&event);

        match event {
            WindowEvent::CloseRequested => {
                debug!("Closing window...");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                self.handle.observe_window_bounds(data.bounds());
                self.camera.handle_resize(size.width, size.height);
            }
            WindowEvent::Moved(_) => self.handle.observe_window_bounds(data.bounds()),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        repeat: false,
                        ..
                    },
                ..
            } => {
                if code == KeyCode::Escape && state.is_pressed() {
                    event_loop.exit();
                } else {
                    self.camera.handle_key_input(code, state.is_pressed());
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.draw_frame(event_loop) {
                    self.fail(event_loop, e.context("frame failed"));
                }
            }
            _ => (),
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _device_id: DeviceId, event: DeviceEvent) {
        if self.config.editor_mode {
            return;
        }
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            self.camera.handle_mouse_input(dx as f32, dy as f32);
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(data) = self.windows.primary() else {
            return;
        };
        match self.config.fps_limit {
            Some(fps) => {
                let next = self.last_frame + Duration::from_secs_f32(1.0 / fps);
                if Instant::now() >= next {
                    data.window().request_redraw();
                    event_loop.set_control_flow(ControlFlow::Wait);
                } else {
                    event_loop.set_control_flow(ControlFlow::WaitUntil(next));
                }
            }
            None => data.window().request_redraw(),
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        info!("exiting after {} frames", self.frames_rendered);
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.write_screenshot() {
            self.error = Some(e.context("failed to write screenshot"));
        }
    }
}

fn run(config: RunConfig) -> Result<()> {
    let scene = config.scene.load()?;
    info!(
        "loaded scene: {} meshes, {} objects, {} lights",
        scene.meshes.len(),
        scene.objects.len(),
        scene.lights.count()
    );

    let event_loop = EventLoop::new()?;
    let mut app: App<RaytraceRenderer> = App::new(&event_loop, config, scene)?;
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn main() -> ExitCode {
    let config = Args::parse().resolve();

    let verbose = config.as_ref().is_ok_and(|x| x.verbose);
    Builder::new()
        .filter_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .init();

    let result = config.and_then(run);
    if let Err(e) = result {
        error!("{e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
