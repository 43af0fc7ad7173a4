use std::rc::Rc;

use anyhow::{Context, Result};
use ash::{khr, vk};
use log::{debug, info};

use crate::gpu::Gpu;

/// Anything above these bounds is treated as a corrupted surface report.
const MAX_PLAUSIBLE_IMAGE_COUNT: u32 = 100;
const MAX_PLAUSIBLE_EXTENT: u32 = 16384;

pub struct SwapchainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    pub fn query(
        surface_loader: &khr::surface::Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<SwapchainSupportDetails> {
        let capabilities =
            unsafe { surface_loader.get_physical_device_surface_capabilities(device, surface) }?;
        let formats =
            unsafe { surface_loader.get_physical_device_surface_formats(device, surface) }?;
        let present_modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(device, surface) }?;

        Ok(SwapchainSupportDetails {
            capabilities,
            formats,
            present_modes,
        })
    }

    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Result of re-querying the surface before a swapchain rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceHealth {
    Usable,
    Lost,
    Implausible,
    QueryFailed(vk::Result),
}

pub fn capabilities_plausible(capabilities: &vk::SurfaceCapabilitiesKHR) -> bool {
    let extent = capabilities.current_extent;
    // u32::MAX means the surface lets the swapchain decide
    let extent_ok = |x: u32| x == u32::MAX || x <= MAX_PLAUSIBLE_EXTENT;

    capabilities.min_image_count <= MAX_PLAUSIBLE_IMAGE_COUNT
        && extent_ok(extent.width)
        && extent_ok(extent.height)
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|x| {
            x.format == vk::Format::B8G8R8A8_SRGB
                && x.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or(formats.first())
        .copied()
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    (width, height): (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min_extent = capabilities.min_image_extent;
    let max_extent = capabilities.max_image_extent;
    vk::Extent2D {
        width: width.clamp(min_extent.width, max_extent.width),
        height: height.clamp(min_extent.height, max_extent.height),
    }
}

pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        wanted.min(capabilities.max_image_count)
    } else {
        wanted
    }
}

/// The presentation surface plus the swapchain built on it.
pub struct Swapchain {
    gpu: Rc<Gpu>,
    surface_loader: khr::surface::Instance,
    swapchain_loader: khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
}

impl Swapchain {
    /// Takes ownership of `surface`, including on error.
    pub fn new(
        gpu: Rc<Gpu>,
        surface_loader: khr::surface::Instance,
        surface: vk::SurfaceKHR,
        drawable: (u32, u32),
    ) -> Result<Swapchain> {
        let swapchain_loader = khr::swapchain::Device::new(&gpu.instance, &gpu.device);
        let mut out = Swapchain {
            gpu,
            surface_loader,
            swapchain_loader,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            format: Default::default(),
            extent: Default::default(),
            images: Vec::new(),
            image_views: Vec::new(),
        };
        out.build(drawable)?;
        Ok(out)
    }

    /// Creates the swapchain and its image views. The previous swapchain must
    /// already be destroyed.
    pub fn build(&mut self, drawable: (u32, u32)) -> Result<()> {
        let support = SwapchainSupportDetails::query(
            &self.surface_loader,
            self.gpu.physical_device,
            self.surface,
        )?;
        let format = choose_surface_format(&support.formats)
            .context("surface reports no formats")?;
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, drawable);
        let image_count = choose_image_count(&support.capabilities);

        let families = &self.gpu.queue_families;
        let queue_indices = families.unique_indices();
        let (image_sharing_mode, queue_family_indices): (_, &[u32]) = if queue_indices.len() > 1 {
            (vk::SharingMode::CONCURRENT, queue_indices.as_slice())
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        };

        let create_info = vk::SwapchainCreateInfoKHR {
            surface: self.surface,
            min_image_count: image_count,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            image_sharing_mode,
            queue_family_index_count: queue_family_indices.len() as u32,
            p_queue_family_indices: queue_family_indices.as_ptr(),
            pre_transform: support.capabilities.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        self.swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .context("failed to create swapchain")?;
        self.images = unsafe { self.swapchain_loader.get_swapchain_images(self.swapchain) }?;

        for image in &self.images {
            let view_info = vk::ImageViewCreateInfo {
                image: *image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: format.format,
                subresource_range: crate::utils::COLOR_SUBRESOURCE_RANGE,
                ..Default::default()
            };
            let view = unsafe { self.gpu.device.create_image_view(&view_info, None) }?;
            self.image_views.push(view);
        }

        self.format = format;
        self.extent = extent;
        info!(
            "swapchain ready: {}x{} {:?}, {} images, {:?}",
            extent.width,
            extent.height,
            format.format,
            self.images.len(),
            present_mode
        );
        Ok(())
    }

    /// Destroys the image views and swapchain, keeping the surface.
    pub fn destroy_swapchain(&mut self) {
        unsafe {
            for view in self.image_views.drain(..) {
                self.gpu.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
        }
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
    }

    /// Swaps in a freshly created platform surface. The swapchain must already
    /// be destroyed.
    pub fn replace_surface(&mut self, surface: vk::SurfaceKHR) {
        debug!("replacing presentation surface");
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
        self.surface = surface;
    }

    pub fn surface_health(&self) -> SurfaceHealth {
        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.gpu.physical_device, self.surface)
        };
        match capabilities {
            Ok(x) if capabilities_plausible(&x) => SurfaceHealth::Usable,
            Ok(_) => SurfaceHealth::Implausible,
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => SurfaceHealth::Lost,
            Err(e) => SurfaceHealth::QueryFailed(e),
        }
    }

    pub fn loader(&self) -> &khr::swapchain::Device {
        &self.swapchain_loader
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_swapchain();
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min_images: u32, max_images: u32, extent: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            current_extent: vk::Extent2D {
                width: extent.0,
                height: extent.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn ordinary_capabilities_are_plausible() {
        assert!(capabilities_plausible(&capabilities(2, 8, (1920, 1080))));
        assert!(capabilities_plausible(&capabilities(3, 0, (16384, 16384))));
    }

    #[test]
    fn surface_defined_extent_is_plausible() {
        assert!(capabilities_plausible(&capabilities(2, 0, (u32::MAX, u32::MAX))));
    }

    #[test]
    fn garbage_capabilities_are_rejected() {
        assert!(!capabilities_plausible(&capabilities(101, 0, (800, 600))));
        assert!(!capabilities_plausible(&capabilities(2, 0, (16385, 600))));
        assert!(!capabilities_plausible(&capabilities(2, 0, (800, 70000))));
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let caps = capabilities(2, 3, (1024, 768));
        let extent = choose_extent(&caps, (10, 10));
        assert_eq!((extent.width, extent.height), (1024, 768));
    }

    #[test]
    fn extent_clamps_window_size_when_surface_defers() {
        let caps = capabilities(2, 3, (u32::MAX, u32::MAX));
        let extent = choose_extent(&caps, (8000, 0));
        assert_eq!((extent.width, extent.height), (4096, 1));
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        assert_eq!(choose_image_count(&capabilities(2, 0, (1, 1))), 3);
        assert_eq!(choose_image_count(&capabilities(2, 8, (1, 1))), 3);
        assert_eq!(choose_image_count(&capabilities(3, 3, (1, 1))), 3);
    }

    #[test]
    fn prefers_srgb_bgra_and_mailbox() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|x| x.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert_eq!(
            choose_surface_format(&formats[..1]).map(|x| x.format),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert_eq!(choose_surface_format(&[]), None);

        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::FIFO
        );
    }
}
