use std::ffi::c_void;
use std::marker::PhantomData;
use std::rc::Rc;

use anyhow::{bail, Result};
use ash::{vk, Device};
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use log::debug;

use crate::gpu::Gpu;
use crate::render::buffer::Buffer;

/// Whatever a descriptor currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    StorageBuffer(vk::Buffer),
    StorageImage(vk::ImageView),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl BoundResource {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            BoundResource::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            BoundResource::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
            BoundResource::AccelerationStructure(_) => {
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
            }
        }
    }
}

/// One binding of a descriptor set together with the resource it was last
/// written with. Every site that replaces a backing buffer or image goes
/// through [`BindPoint::rebind`].
#[derive(Debug)]
pub struct BindPoint {
    set: vk::DescriptorSet,
    binding: u32,
    ty: vk::DescriptorType,
    current: Option<BoundResource>,
}

impl BindPoint {
    pub fn new(set: vk::DescriptorSet, binding: u32, ty: vk::DescriptorType) -> BindPoint {
        BindPoint {
            set,
            binding,
            ty,
            current: None,
        }
    }

    pub fn current(&self) -> Option<BoundResource> {
        self.current
    }

    /// Writes `resource` into the descriptor.
    ///
    /// The caller must make sure no submitted or recorded-but-unsubmitted
    /// command buffer still uses the set.
    pub fn rebind(&mut self, device: &Device, resource: BoundResource) -> Result<()> {
        if resource.descriptor_type() != self.ty {
            bail!(
                "binding {} expects {:?}, got {:?}",
                self.binding,
                self.ty,
                resource.descriptor_type()
            );
        }

        let mut write = vk::WriteDescriptorSet {
            dst_set: self.set,
            dst_binding: self.binding,
            dst_array_element: 0,
            descriptor_type: self.ty,
            descriptor_count: 1,
            ..Default::default()
        };

        // the infos must outlive the update call below
        let buffer_info;
        let image_info;
        let accel_info;
        let accel_handle;
        match resource {
            BoundResource::StorageBuffer(buffer) => {
                buffer_info = vk::DescriptorBufferInfo {
                    buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                };
                write.p_buffer_info = &raw const buffer_info;
            }
            BoundResource::StorageImage(image_view) => {
                image_info = vk::DescriptorImageInfo {
                    image_layout: vk::ImageLayout::GENERAL,
                    image_view,
                    sampler: vk::Sampler::null(),
                };
                write.p_image_info = &raw const image_info;
            }
            BoundResource::AccelerationStructure(handle) => {
                accel_handle = handle;
                accel_info = vk::WriteDescriptorSetAccelerationStructureKHR {
                    acceleration_structure_count: 1,
                    p_acceleration_structures: &raw const accel_handle,
                    ..Default::default()
                };
                write.p_next = &raw const accel_info as *const c_void;
            }
        }

        unsafe { device.update_descriptor_sets(&[write], &[]) };
        self.current = Some(resource);
        Ok(())
    }
}

/// New capacity when `required` records no longer fit into `current`.
pub fn grown_capacity(current: u64, required: u64) -> Option<u64> {
    if required <= current {
        None
    } else {
        Some(required * 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPlan {
    /// empty upload, contents stay
    Skip,
    InPlace,
    /// reallocate to this many records first
    Grow(u64),
}

pub fn plan_upload(capacity: u64, len: usize) -> UploadPlan {
    if len == 0 {
        return UploadPlan::Skip;
    }
    match grown_capacity(capacity, len as u64) {
        Some(capacity) => UploadPlan::Grow(capacity),
        None => UploadPlan::InPlace,
    }
}

/// A host visible storage buffer of `T` records that only ever grows.
///
/// Every [`GrowableBuffer::set`] uploads the whole array from offset zero.
/// When it does not fit, the device is idled, the buffer is replaced by one
/// of twice the required capacity and the descriptor is rebound.
pub struct GrowableBuffer<T: Pod> {
    gpu: Rc<Gpu>,
    name: &'static str,
    buffer: Buffer,
    capacity: u64,
    len: usize,
    bind_point: BindPoint,
    _marker: PhantomData<T>,
}

impl<T: Pod> GrowableBuffer<T> {
    pub fn new(
        gpu: &Rc<Gpu>,
        name: &'static str,
        capacity: u64,
        mut bind_point: BindPoint,
    ) -> Result<GrowableBuffer<T>> {
        let capacity = capacity.max(1);
        let buffer = Self::allocate(gpu, name, capacity)?;
        bind_point.rebind(&gpu.device, BoundResource::StorageBuffer(buffer.handle()))?;

        Ok(GrowableBuffer {
            gpu: gpu.clone(),
            name,
            buffer,
            capacity,
            len: 0,
            bind_point,
            _marker: PhantomData,
        })
    }

    fn allocate(gpu: &Rc<Gpu>, name: &str, capacity: u64) -> Result<Buffer> {
        Buffer::new(
            gpu,
            name,
            capacity * std::mem::size_of::<T>() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
        )
    }

    /// Replaces the contents with `items`. An empty slice changes nothing.
    pub fn set(&mut self, items: &[T]) -> Result<()> {
        let plan = plan_upload(self.capacity, items.len());
        if plan == UploadPlan::Skip {
            debug!("{}: ignoring empty upload", self.name);
            return Ok(());
        }

        if let UploadPlan::Grow(capacity) = plan {
            debug!(
                "{}: growing from {} to {} records",
                self.name, self.capacity, capacity
            );
            // in-flight frames may still read the old buffer
            self.gpu.wait_idle()?;
            let buffer = Self::allocate(&self.gpu, self.name, capacity)?;
            self.bind_point
                .rebind(&self.gpu.device, BoundResource::StorageBuffer(buffer.handle()))?;
            self.buffer = buffer;
            self.capacity = capacity;
        }

        self.buffer.upload(bytemuck::cast_slice::<T, u8>(items), 0)?;
        self.len = items.len();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_without_growing() {
        assert_eq!(grown_capacity(1024, 1), None);
        assert_eq!(grown_capacity(1024, 1024), None);
    }

    #[test]
    fn grows_to_twice_the_requirement() {
        assert_eq!(grown_capacity(1024, 1025), Some(2050));
        assert_eq!(grown_capacity(64, 300), Some(600));
    }

    #[test]
    fn increasing_sizes_reallocate_rarely() {
        let mut capacity = 4;
        let mut reallocations = 0;
        for required in 1..=1000 {
            if let Some(next) = grown_capacity(capacity, required) {
                assert!(next >= 2 * required);
                capacity = next;
                reallocations += 1;
            }
        }
        assert!(capacity >= 1000);
        // doubling keeps this logarithmic
        assert!(reallocations <= 8, "{reallocations} reallocations");
    }

    #[test]
    fn empty_upload_is_skipped() {
        assert_eq!(plan_upload(0, 0), UploadPlan::Skip);
        assert_eq!(plan_upload(1024, 0), UploadPlan::Skip);
        assert_eq!(plan_upload(1024, 10), UploadPlan::InPlace);
        assert_eq!(plan_upload(4, 10), UploadPlan::Grow(20));
    }

    #[test]
    fn resources_map_to_their_descriptor_type() {
        assert_eq!(
            BoundResource::StorageBuffer(vk::Buffer::null()).descriptor_type(),
            vk::DescriptorType::STORAGE_BUFFER
        );
        assert_eq!(
            BoundResource::StorageImage(vk::ImageView::null()).descriptor_type(),
            vk::DescriptorType::STORAGE_IMAGE
        );
        assert_eq!(
            BoundResource::AccelerationStructure(vk::AccelerationStructureKHR::null())
                .descriptor_type(),
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
    }
}
