use std::ffi::c_void;

use ash::{vk, Instance};

type FeatureCheck = (&'static str, fn(&FeatureChain) -> vk::Bool32);

// every feature the renderer turns on, checked against what the device reports
const CHECKS: &[FeatureCheck] = &[
    ("bufferDeviceAddress", |c| c.vulkan12.buffer_device_address),
    ("descriptorIndexing", |c| c.vulkan12.descriptor_indexing),
    ("runtimeDescriptorArray", |c| c.vulkan12.runtime_descriptor_array),
    ("accelerationStructure", |c| c.accel.acceleration_structure),
    ("rayTracingPipeline", |c| c.ray_tracing.ray_tracing_pipeline),
];

/// A `PhysicalDeviceFeatures2` chain with the extension structs the renderer
/// cares about. Boxed so the `p_next` links stay valid when it is moved.
pub struct FeatureChain {
    features2: vk::PhysicalDeviceFeatures2<'static>,
    vulkan12: vk::PhysicalDeviceVulkan12Features<'static>,
    accel: vk::PhysicalDeviceAccelerationStructureFeaturesKHR<'static>,
    ray_tracing: vk::PhysicalDeviceRayTracingPipelineFeaturesKHR<'static>,
}

impl FeatureChain {
    fn empty() -> Box<FeatureChain> {
        let mut chain = Box::new(FeatureChain {
            features2: Default::default(),
            vulkan12: Default::default(),
            accel: Default::default(),
            ray_tracing: Default::default(),
        });

        chain.features2.p_next = &raw mut chain.vulkan12 as *mut c_void;
        chain.vulkan12.p_next = &raw mut chain.accel as *mut c_void;
        chain.accel.p_next = &raw mut chain.ray_tracing as *mut c_void;
        chain
    }

    /// The features to enable at device creation.
    pub fn required() -> Box<FeatureChain> {
        let mut chain = Self::empty();
        chain.vulkan12.buffer_device_address = vk::TRUE;
        chain.vulkan12.descriptor_indexing = vk::TRUE;
        chain.vulkan12.runtime_descriptor_array = vk::TRUE;
        chain.accel.acceleration_structure = vk::TRUE;
        chain.ray_tracing.ray_tracing_pipeline = vk::TRUE;
        chain
    }

    /// What `device` actually supports.
    pub fn supported(instance: &Instance, device: vk::PhysicalDevice) -> Box<FeatureChain> {
        let mut chain = Self::empty();
        unsafe { instance.get_physical_device_features2(device, &mut chain.features2) };
        chain
    }

    /// Names of features set in `self` that `supported` lacks.
    pub fn missing_from(&self, supported: &FeatureChain) -> Vec<&'static str> {
        CHECKS
            .iter()
            .filter(|(_, get)| get(self) == vk::TRUE && get(supported) != vk::TRUE)
            .map(|(name, _)| *name)
            .collect()
    }

    /// Head of the chain, suitable for `DeviceCreateInfo::p_next`.
    pub fn as_ptr(&self) -> *const c_void {
        &raw const self.features2 as *const c_void
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_is_subset_of_itself() {
        let required = FeatureChain::required();
        let also_required = FeatureChain::required();
        assert!(required.missing_from(&also_required).is_empty());
    }

    #[test]
    fn reports_missing_features_by_name() {
        let required = FeatureChain::required();
        let mut supported = FeatureChain::required();
        supported.ray_tracing.ray_tracing_pipeline = vk::FALSE;
        supported.vulkan12.buffer_device_address = vk::FALSE;

        assert_eq!(
            required.missing_from(&supported),
            vec!["bufferDeviceAddress", "rayTracingPipeline"]
        );
    }

    #[test]
    fn chain_links_survive_moves() {
        let chain = FeatureChain::required();
        let moved = chain;
        assert_eq!(
            moved.features2.p_next as *const c_void,
            &raw const moved.vulkan12 as *const c_void
        );
        assert_eq!(
            moved.accel.p_next as *const c_void,
            &raw const moved.ray_tracing as *const c_void
        );
    }
}
