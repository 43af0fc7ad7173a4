use anyhow::Result;
use ash::{khr, vk, Device, Instance};

pub const COLOR_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub const COLOR_SUBRESOURCE_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

#[derive(Default, Clone, Copy, Debug)]
pub struct QueueFamilyInfo {
    pub graphics_index: Option<u32>,
    pub present_index: Option<u32>,
}

impl QueueFamilyInfo {
    pub fn is_complete(&self) -> bool {
        self.graphics_index.is_some() && self.present_index.is_some()
    }

    /// Distinct family indices, graphics first.
    pub fn unique_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = [self.graphics_index, self.present_index]
            .into_iter()
            .flatten()
            .collect();
        indices.dedup();
        indices
    }
}

pub fn query_queue_families(
    surface_loader: &khr::surface::Instance,
    instance: &Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<QueueFamilyInfo> {
    let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let mut info = QueueFamilyInfo::default();

    // first family that fits wins; a shared graphics+present family is preferred
    for (i, family) in queue_families.iter().enumerate() {
        let index = i as u32;
        let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = unsafe {
            surface_loader.get_physical_device_surface_support(device, index, surface)
        }?;

        if graphics && present {
            return Ok(QueueFamilyInfo {
                graphics_index: Some(index),
                present_index: Some(index),
            });
        }
        if info.graphics_index.is_none() && graphics {
            info.graphics_index = Some(index);
        }
        if info.present_index.is_none() && present {
            info.present_index = Some(index);
        }
    }

    Ok(info)
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

#[derive(Clone, Copy, Debug)]
pub struct ImageTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

/// Records a single color image layout transition into `command_buffer`.
///
/// # Safety
/// `command_buffer` must be in the recording state and `image` must be a live
/// single-mip, single-layer color image.
pub unsafe fn transition_image(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    transition: ImageTransition,
) {
    let barrier = vk::ImageMemoryBarrier {
        src_access_mask: transition.src_access,
        dst_access_mask: transition.dst_access,
        old_layout: transition.old_layout,
        new_layout: transition.new_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: COLOR_SUBRESOURCE_RANGE,
        ..Default::default()
    };

    device.cmd_pipeline_barrier(
        command_buffer,
        transition.src_stage,
        transition.dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(32, 32), 32);
    }

    #[test]
    fn align_up_zero_alignment_is_identity() {
        assert_eq!(align_up(37, 0), 37);
    }

    #[test]
    fn unique_indices_collapses_shared_family() {
        let shared = QueueFamilyInfo {
            graphics_index: Some(0),
            present_index: Some(0),
        };
        assert_eq!(shared.unique_indices(), vec![0]);

        let split = QueueFamilyInfo {
            graphics_index: Some(0),
            present_index: Some(2),
        };
        assert_eq!(split.unique_indices(), vec![0, 2]);
        assert!(split.is_complete());
        assert!(!QueueFamilyInfo::default().is_complete());
    }
}
