use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use log::error;

use crate::gpu::Gpu;
use crate::utils::align_up;

/// A buffer handle bound to its own sub-allocation.
///
/// Owns both exclusively and frees them on drop, so it is move-only. Host
/// visible placements stay persistently mapped by the allocator; [`Buffer::map`]
/// hands out a borrow of that mapping which cannot outlive the buffer.
pub struct Buffer {
    gpu: Rc<Gpu>,
    handle: vk::Buffer,
    allocation: Allocation,
}

impl Buffer {
    pub fn new(
        gpu: &Rc<Gpu>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Buffer> {
        Self::with_alignment(gpu, name, size, usage, location, 0)
    }

    /// Like [`Buffer::new`] but with the allocation offset rounded up to at
    /// least `alignment`, e.g. for acceleration structure scratch memory.
    pub fn with_alignment(
        gpu: &Rc<Gpu>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        alignment: vk::DeviceSize,
    ) -> Result<Buffer> {
        let device = &gpu.device;
        let buffer_info = vk::BufferCreateInfo {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let handle = unsafe { device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("failed to create buffer '{name}'"))?;

        let mut requirements = unsafe { device.get_buffer_memory_requirements(handle) };
        if alignment > 0 {
            requirements.alignment = align_up(requirements.alignment, alignment);
        }

        let allocation = gpu.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(x) => x,
            Err(e) => {
                unsafe { device.destroy_buffer(handle, None) };
                return Err(e).with_context(|| format!("failed to allocate {size} bytes for '{name}'"));
            }
        };

        let buffer = Buffer {
            gpu: gpu.clone(),
            handle,
            allocation,
        };
        unsafe { device.bind_buffer_memory(handle, buffer.allocation.memory(), buffer.allocation.offset()) }?;

        Ok(buffer)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Host access to the whole buffer. Fails for device-local placements.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        self.allocation
            .mapped_slice_mut()
            .ok_or(anyhow!("buffer is not host visible"))
    }

    /// Read-only host access, e.g. for readback buffers.
    pub fn mapped(&self) -> Result<&[u8]> {
        self.allocation
            .mapped_slice()
            .ok_or(anyhow!("buffer is not host visible"))
    }

    /// Copies `data` into the buffer at byte `offset`.
    pub fn upload<T: Copy>(&mut self, data: &[T], offset: usize) -> Result<()> {
        presser::copy_from_slice_to_offset_with_align(
            data,
            &mut self.allocation,
            offset,
            std::mem::align_of::<T>(),
        )
        .map_err(|e| anyhow!("upload of {} bytes failed: {e:?}", std::mem::size_of_val(data)))?;
        Ok(())
    }

    /// Requires `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.gpu.buffer_device_address(self.handle)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.gpu.device.destroy_buffer(self.handle, None) };
        let allocation = std::mem::take(&mut self.allocation);
        if let Err(e) = self.gpu.allocator().free(allocation) {
            error!("failed to free buffer memory: {e}");
        }
    }
}
