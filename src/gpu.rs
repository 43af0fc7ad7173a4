use std::cell::{Cell, RefCell, RefMut};
use std::ffi::{c_char, c_void};
use std::mem::ManuallyDrop;

use anyhow::{bail, Context, Result};
use ash::{vk, Device, Instance};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use log::{debug, error};

use crate::defer::Defer;
use crate::features::FeatureChain;
use crate::utils::QueueFamilyInfo;

/// The logical device and everything hanging directly off it: queues, the
/// shared command pool and the memory allocator.
///
/// Shared as `Rc<Gpu>` by every object that owns device memory, so the device
/// is only destroyed after the last of them is gone.
pub struct Gpu {
    pub instance: Instance,
    pub device: Device,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub rt_pipeline_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static>,
    pub accel_properties: vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'static>,
    pub queue_families: QueueFamilyInfo,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    command_pool: vk::CommandPool,
    allocator: ManuallyDrop<RefCell<Allocator>>,
    frame_open: Cell<bool>,
}

impl Gpu {
    pub fn new(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilyInfo,
        extensions: &[*const c_char],
    ) -> Result<Gpu> {
        let (Some(graphics_index), Some(present_index)) =
            (queue_families.graphics_index, queue_families.present_index)
        else {
            bail!("device is missing a graphics or present queue family");
        };

        let priority = 1.0f32;
        let queue_infos: Vec<_> = queue_families
            .unique_indices()
            .into_iter()
            .map(|queue_family_index| vk::DeviceQueueCreateInfo {
                queue_family_index,
                queue_count: 1,
                p_queue_priorities: &priority,
                ..Default::default()
            })
            .collect();

        let features = FeatureChain::required();
        let create_info = vk::DeviceCreateInfo {
            p_next: features.as_ptr(),
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            ..Default::default()
        };
        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("failed to create logical device")?
            .defer(|x| unsafe { x.destroy_device(None) });

        let graphics_queue = unsafe { device.get_device_queue(graphics_index, 0) };
        let present_queue = unsafe { device.get_device_queue(present_index, 0) };

        let command_pool = {
            let create_info = vk::CommandPoolCreateInfo {
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                queue_family_index: graphics_index,
                ..Default::default()
            };
            unsafe { device.create_command_pool(&create_info, None) }?
                .defer(|x| unsafe { device.destroy_command_pool(*x, None) })
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .context("failed to create allocator")?;

        let mut accel_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut rt_pipeline_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
            p_next: &raw mut accel_properties as *mut c_void,
            ..Default::default()
        };
        let mut properties2 = vk::PhysicalDeviceProperties2 {
            p_next: &raw mut rt_pipeline_properties as *mut c_void,
            ..Default::default()
        };
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        // the chain pointed into this stack frame
        rt_pipeline_properties.p_next = std::ptr::null_mut();

        debug!(
            "ray tracing: handle size {}, handle alignment {}, base alignment {}, max recursion {}",
            rt_pipeline_properties.shader_group_handle_size,
            rt_pipeline_properties.shader_group_handle_alignment,
            rt_pipeline_properties.shader_group_base_alignment,
            rt_pipeline_properties.max_ray_recursion_depth,
        );

        let command_pool = command_pool.undefer();
        Ok(Gpu {
            instance: instance.clone(),
            device: device.undefer(),
            physical_device,
            properties: properties2.properties,
            rt_pipeline_properties,
            accel_properties,
            queue_families,
            graphics_queue,
            present_queue,
            command_pool,
            allocator: ManuallyDrop::new(RefCell::new(allocator)),
            frame_open: Cell::new(false),
        })
    }

    /// Borrows the allocator. Do not hold the borrow across calls that create
    /// or drop buffers and images.
    pub fn allocator(&self) -> RefMut<'_, Allocator> {
        self.allocator.borrow_mut()
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("failed to wait for device idle")
    }

    pub fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo {
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        Ok(unsafe { self.device.allocate_command_buffers(&allocate_info) }?)
    }

    pub fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, command_buffers)
        };
    }

    /// Marks whether a per-frame command buffer is currently being recorded.
    /// Single-time commands are refused while it is set.
    pub fn set_frame_open(&self, open: bool) {
        self.frame_open.set(open);
    }

    pub fn begin_single_time_commands(&self) -> Result<vk::CommandBuffer> {
        if self.frame_open.get() {
            bail!("single-time commands cannot be issued while a frame is being recorded");
        }

        let command_buffer = self.allocate_command_buffers(1)?[0];
        let begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        if let Err(e) = unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) } {
            self.free_command_buffers(&[command_buffer]);
            return Err(e.into());
        }
        Ok(command_buffer)
    }

    /// Submits `command_buffer`, blocks until the queue drains and frees it.
    pub fn end_single_time_commands(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let command_buffer =
            command_buffer.defer(|x| self.free_command_buffers(std::slice::from_ref(x)));

        let submit_info = vk::SubmitInfo {
            command_buffer_count: 1,
            p_command_buffers: &*command_buffer,
            ..Default::default()
        };
        unsafe {
            self.device.end_command_buffer(*command_buffer)?;
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())?;
            self.device.queue_wait_idle(self.graphics_queue)?;
        }
        Ok(())
    }

    /// Records with `record`, then submits and waits. Not for the frame path.
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer),
    {
        let command_buffer = self.begin_single_time_commands()?;
        record(&self.device, command_buffer);
        self.end_single_time_commands(command_buffer)
    }

    pub fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo {
            buffer,
            ..Default::default()
        };
        unsafe { self.device.get_buffer_device_address(&info) }
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            error!("{e:#}");
        }
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            // allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        debug!("destroyed logical device");
    }
}
