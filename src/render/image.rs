use std::rc::Rc;

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use log::error;

use crate::gpu::Gpu;
use crate::utils::COLOR_SUBRESOURCE_RANGE;

pub const STORAGE_IMAGE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// The ray tracing output image: device local, shader writable, clearable and
/// usable as a blit/copy source.
pub struct StorageImage {
    gpu: Rc<Gpu>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Allocation,
    extent: vk::Extent2D,
}

impl StorageImage {
    pub fn new(gpu: &Rc<Gpu>, extent: vk::Extent2D) -> Result<StorageImage> {
        let device = &gpu.device;
        let image_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format: STORAGE_IMAGE_FORMAT,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { device.create_image(&image_info, None) }
            .context("failed to create storage image")?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = gpu.allocator().allocate(&AllocationCreateDesc {
            name: "storage image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(x) => x,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e).context("failed to allocate storage image");
            }
        };

        // from here on Drop cleans up, view included once it exists
        let mut out = StorageImage {
            gpu: gpu.clone(),
            image,
            view: vk::ImageView::null(),
            allocation,
            extent,
        };
        unsafe {
            device.bind_image_memory(image, out.allocation.memory(), out.allocation.offset())?;
        }

        let view_info = vk::ImageViewCreateInfo {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format: STORAGE_IMAGE_FORMAT,
            subresource_range: COLOR_SUBRESOURCE_RANGE,
            ..Default::default()
        };
        out.view = unsafe { device.create_image_view(&view_info, None) }?;

        Ok(out)
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Bytes needed to read the whole image back as RGBA8.
    pub fn byte_size(&self) -> vk::DeviceSize {
        self.extent.width as vk::DeviceSize * self.extent.height as vk::DeviceSize * 4
    }
}

impl Drop for StorageImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.gpu.device.destroy_image_view(self.view, None);
            }
            self.gpu.device.destroy_image(self.image, None);
        }
        let allocation = std::mem::take(&mut self.allocation);
        if let Err(e) = self.gpu.allocator().free(allocation) {
            error!("failed to free storage image memory: {e}");
        }
    }
}
