use std::ffi::{c_char, CStr};
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use ash::{khr, vk, Entry, Instance};
use log::{debug, error, info, warn};

use crate::defer::Defer;
use crate::features::FeatureChain;
use crate::gpu::Gpu;
use crate::swapchain::{SurfaceHealth, Swapchain, SwapchainSupportDetails};
use crate::utils::{self, QueueFamilyInfo};
use crate::window::{self, SurfaceSource};

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

pub fn next_frame_index(index: usize) -> usize {
    (index + 1) % MAX_FRAMES_IN_FLIGHT
}

/// Higher is better. A discrete GPU wins over an integrated one of the same
/// size, but a much larger integrated GPU can still outrank it.
pub fn device_score(device_type: vk::PhysicalDeviceType, max_image_dimension_2d: u32) -> u64 {
    let discrete_bonus = if device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        1000
    } else {
        0
    };
    discrete_bonus + max_image_dimension_2d as u64
}

#[derive(Clone, Copy)]
struct FrameSync {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
    command_buffer: vk::CommandBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Ready,
    Recording { image_index: u32 },
}

/// Everything the frame loop needs to record into the acquired image.
#[derive(Debug, Clone, Copy)]
pub struct FrameTarget {
    pub command_buffer: vk::CommandBuffer,
    pub image: vk::Image,
    pub extent: vk::Extent2D,
}

/// Device, swapchain and the per-frame synchronization that paces the CPU
/// at most [`MAX_FRAMES_IN_FLIGHT`] frames ahead of the GPU.
pub struct VulkanContext {
    // WARNING: ORDER MATTERS HERE!!!
    // the swapchain must go before the last reference to the device
    frames: Vec<FrameSync>,
    swapchain: Swapchain,
    gpu: Rc<Gpu>,
    entry: Entry,
    instance: Instance,
    frame_index: usize,
    state: FrameState,
}

impl VulkanContext {
    pub fn required_device_extensions() -> &'static [*const c_char] {
        const EXTENSIONS: &[*const c_char] = &[khr::swapchain::NAME.as_ptr()];
        EXTENSIONS
    }

    pub fn new(
        entry: &Entry,
        instance: &Instance,
        window: &impl SurfaceSource,
        device_extensions: &[*const c_char],
    ) -> Result<VulkanContext> {
        let surface_loader = khr::surface::Instance::new(entry, instance);
        let surface = unsafe { window.create_surface(entry, instance) }
            .context("failed to create presentation surface")?
            .defer(|x| unsafe { surface_loader.destroy_surface(*x, None) });

        let (physical_device, queue_families) =
            Self::pick_physical_device(instance, &surface_loader, *surface, device_extensions)?;

        let gpu = Rc::new(Gpu::new(
            instance,
            physical_device,
            queue_families,
            device_extensions,
        )?);

        let swapchain = Swapchain::new(
            gpu.clone(),
            surface_loader.clone(),
            surface.undefer(),
            window.drawable_size(),
        )?;

        let command_buffers = gpu.allocate_command_buffers(MAX_FRAMES_IN_FLIGHT as u32)?;
        let mut context = VulkanContext {
            frames: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
            swapchain,
            gpu,
            entry: entry.clone(),
            instance: instance.clone(),
            frame_index: 0,
            state: FrameState::Ready,
        };

        for command_buffer in command_buffers {
            let frame = context.create_frame_sync(command_buffer)?;
            context.frames.push(frame);
        }

        Ok(context)
    }

    fn create_frame_sync(&self, command_buffer: vk::CommandBuffer) -> Result<FrameSync> {
        let device = &self.gpu.device;
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // signaled so the very first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo {
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };

        unsafe {
            let image_available = device
                .create_semaphore(&semaphore_info, None)?
                .defer(|x| device.destroy_semaphore(*x, None));
            let render_finished = device
                .create_semaphore(&semaphore_info, None)?
                .defer(|x| device.destroy_semaphore(*x, None));
            let in_flight = device.create_fence(&fence_info, None)?;

            Ok(FrameSync {
                image_available: image_available.undefer(),
                render_finished: render_finished.undefer(),
                in_flight,
                command_buffer,
            })
        }
    }

    fn pick_physical_device(
        instance: &Instance,
        surface_loader: &khr::surface::Instance,
        surface: vk::SurfaceKHR,
        device_extensions: &[*const c_char],
    ) -> Result<(vk::PhysicalDevice, QueueFamilyInfo)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("failed to enumerate physical devices")?;

        let mut best: Option<(u64, vk::PhysicalDevice, QueueFamilyInfo)> = None;
        for device in devices {
            let rated = Self::rate_device(instance, surface_loader, device, surface, device_extensions)
                .unwrap_or_else(|e| {
                    warn!("failed to check if device was suitable: {e:#}");
                    None
                });
            if let Some((score, families)) = rated {
                if best.as_ref().map_or(true, |(best_score, ..)| score > *best_score) {
                    best = Some((score, device, families));
                }
            }
        }

        let (_, device, families) = best.ok_or(anyhow!(
            "no GPU with ray tracing pipeline and presentation support was found"
        ))?;

        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = properties
            .device_name_as_c_str()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".into());
        info!("using GPU: {name} ({:?})", properties.device_type);

        Ok((device, families))
    }

    fn rate_device(
        instance: &Instance,
        surface_loader: &khr::surface::Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        device_extensions: &[*const c_char],
    ) -> Result<Option<(u64, QueueFamilyInfo)>> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let supported_extensions =
            unsafe { instance.enumerate_device_extension_properties(device) }?;

        for ext in device_extensions {
            let ext_name = unsafe { CStr::from_ptr(*ext) };
            if !supported_extensions
                .iter()
                .any(|x| x.extension_name_as_c_str().is_ok_and(|x| x == ext_name))
            {
                debug!("{:?} lacks extension {ext_name:?}", properties.device_type);
                return Ok(None);
            }
        }

        let missing = FeatureChain::required()
            .missing_from(&FeatureChain::supported(instance, device));
        if !missing.is_empty() {
            debug!("{:?} lacks features {missing:?}", properties.device_type);
            return Ok(None);
        }

        if !SwapchainSupportDetails::query(surface_loader, device, surface)?.is_adequate() {
            return Ok(None);
        }

        let families = utils::query_queue_families(surface_loader, instance, device, surface)?;
        if !families.is_complete() {
            return Ok(None);
        }

        let score = device_score(
            properties.device_type,
            properties.limits.max_image_dimension2_d,
        );
        Ok(Some((score, families)))
    }

    pub fn gpu(&self) -> &Rc<Gpu> {
        &self.gpu
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn surface_format(&self) -> vk::Format {
        self.swapchain.format()
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.gpu.wait_idle()
    }

    /// Waits for this slot's previous submission, acquires the next image and
    /// starts recording. `Ok(None)` means no frame this tick, usually because
    /// the swapchain had to be rebuilt.
    pub fn begin_frame(&mut self, window: &mut impl SurfaceSource) -> Result<Option<FrameTarget>> {
        if let FrameState::Recording { .. } = self.state {
            bail!("begin_frame called while a frame is still being recorded");
        }

        let frame = self.frames[self.frame_index];
        let device = &self.gpu.device;
        unsafe { device.wait_for_fences(&[frame.in_flight], true, u64::MAX) }
            .context("failed waiting for in-flight fence")?;

        let acquired = unsafe {
            self.swapchain.loader().acquire_next_image(
                self.swapchain.handle(),
                u64::MAX,
                frame.image_available,
                vk::Fence::null(),
            )
        };
        let image_index = match acquired {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR) => {
                debug!("swapchain out of date on acquire");
                self.recreate_swapchain(window)?;
                return Ok(None);
            }
            Err(e) => return Err(anyhow!(e).context("failed to acquire swapchain image")),
        };

        let device = &self.gpu.device;
        unsafe {
            device.reset_fences(&[frame.in_flight])?;
            device.reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(
                frame.command_buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )?;
        }

        self.state = FrameState::Recording { image_index };
        self.gpu.set_frame_open(true);

        Ok(Some(FrameTarget {
            command_buffer: frame.command_buffer,
            image: self.swapchain.image(image_index),
            extent: self.swapchain.extent(),
        }))
    }

    /// Submits the recorded frame and presents it, rebuilding the swapchain
    /// afterwards when presentation or the window asks for it.
    pub fn end_frame(&mut self, window: &mut impl SurfaceSource) -> Result<()> {
        let FrameState::Recording { image_index } = self.state else {
            bail!("end_frame called without a matching begin_frame");
        };
        self.state = FrameState::Ready;
        self.gpu.set_frame_open(false);

        let frame = self.frames[self.frame_index];
        let device = &self.gpu.device;
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit_info = vk::SubmitInfo {
            wait_semaphore_count: 1,
            p_wait_semaphores: &frame.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &frame.command_buffer,
            signal_semaphore_count: 1,
            p_signal_semaphores: &frame.render_finished,
            ..Default::default()
        };

        unsafe {
            device.end_command_buffer(frame.command_buffer)?;
            device
                .queue_submit(self.gpu.graphics_queue, &[submit_info], frame.in_flight)
                .context("failed to submit frame")?;
        }

        let swapchain = self.swapchain.handle();
        let present_info = vk::PresentInfoKHR {
            wait_semaphore_count: 1,
            p_wait_semaphores: &frame.render_finished,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let presented = unsafe {
            self.swapchain
                .loader()
                .queue_present(self.gpu.present_queue, &present_info)
        };
        let stale = match presented {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR) => true,
            Err(e) => return Err(anyhow!(e).context("failed to present")),
        };

        self.frame_index = next_frame_index(self.frame_index);

        if stale || window.was_resized() {
            window.reset_resized();
            self.recreate_swapchain(window)?;
        }

        Ok(())
    }

    /// Rebuilds the swapchain at the window's current size. Returns `false`
    /// when the cycle was skipped, e.g. the window stayed minimized.
    pub fn recreate_swapchain(&mut self, window: &mut impl SurfaceSource) -> Result<bool> {
        let Some(drawable) = window::wait_for_drawable_size(window, window::MINIMIZED_POLL_ATTEMPTS)
        else {
            warn!("window is minimized, skipping swapchain recreation");
            window.reset_resized();
            return Ok(false);
        };

        self.gpu.wait_idle()?;

        match self.swapchain.surface_health() {
            SurfaceHealth::Usable => self.swapchain.destroy_swapchain(),
            health @ (SurfaceHealth::Lost | SurfaceHealth::Implausible) => {
                warn!("surface unusable ({health:?}), recreating it");
                self.swapchain.destroy_swapchain();
                let surface = unsafe { window.create_surface(&self.entry, &self.instance) }
                    .context("failed to recreate presentation surface")?;
                self.swapchain.replace_surface(surface);
            }
            SurfaceHealth::QueryFailed(e) => {
                error!("failed to query surface capabilities: {e}");
                return Ok(false);
            }
        }

        self.swapchain.build(drawable)?;
        window.reset_resized();
        Ok(true)
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            error!("{e:#}");
        }
        let device = &self.gpu.device;
        for frame in self.frames.drain(..) {
            unsafe {
                device.destroy_semaphore(frame.image_available, None);
                device.destroy_semaphore(frame.render_finished, None);
                device.destroy_fence(frame.in_flight, None);
            }
            self.gpu.free_command_buffers(&[frame.command_buffer]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_wraps_over_two_slots() {
        let mut index = 0;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(index);
            index = next_frame_index(index);
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn discrete_gpu_outranks_same_size_integrated() {
        let discrete = device_score(vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        let integrated = device_score(vk::PhysicalDeviceType::INTEGRATED_GPU, 8192);
        assert!(discrete > integrated);
        assert_eq!(discrete, 9192);
        assert_eq!(integrated, 8192);
    }

    #[test]
    fn much_larger_integrated_gpu_can_win() {
        let discrete = device_score(vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        let integrated = device_score(vk::PhysicalDeviceType::INTEGRATED_GPU, 16384);
        assert!(integrated > discrete);
    }

    #[test]
    fn image_dimension_breaks_ties() {
        let small = device_score(vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        let big = device_score(vk::PhysicalDeviceType::DISCRETE_GPU, 32768);
        assert!(big > small);
    }
}
