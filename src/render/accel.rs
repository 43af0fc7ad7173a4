use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use ash::{khr, vk};
use glam::{Mat4, Vec3};
use gpu_allocator::MemoryLocation;
use log::{debug, info, warn};

use crate::gpu::Gpu;
use crate::render::buffer::Buffer;
use crate::scene::geometry;

/// Index of a bottom level structure inside its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlasHandle(pub(crate) u32);

impl BlasHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

const PACKED_24_MAX: u32 = (1 << 24) - 1;

/// One placement of a bottom level structure in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instance {
    pub transform: Mat4,
    /// `gl_InstanceCustomIndexEXT`, the index into the shading records
    pub custom_index: u32,
    pub mask: u32,
    pub sbt_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    pub blas: BlasHandle,
}

impl Instance {
    pub fn new(blas: BlasHandle, transform: Mat4, custom_index: u32) -> Instance {
        Instance {
            transform,
            custom_index,
            mask: 0xff,
            sbt_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas,
        }
    }

    /// The device record, with the transform as the top three rows in row
    /// major order.
    pub fn to_vk(&self, blas_address: vk::DeviceAddress) -> Result<vk::AccelerationStructureInstanceKHR> {
        if self.custom_index > PACKED_24_MAX {
            bail!("custom index {} does not fit in 24 bits", self.custom_index);
        }
        if self.sbt_offset > PACKED_24_MAX {
            bail!("shader binding table offset {} does not fit in 24 bits", self.sbt_offset);
        }
        if self.mask > 0xff {
            bail!("mask {:#x} does not fit in 8 bits", self.mask);
        }

        let rows = self.transform.transpose().to_cols_array();
        let mut matrix = [0f32; 12];
        matrix.copy_from_slice(&rows[0..12]);

        Ok(vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR { matrix },
            instance_custom_index_and_mask: vk::Packed24_8::new(self.custom_index, self.mask as u8),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                self.sbt_offset,
                self.flags.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas_address,
            },
        })
    }
}

/// A top level rebuild only happens for a non-empty instance list.
pub fn tlas_rebuild_needed(instances: &[Instance]) -> bool {
    !instances.is_empty()
}

/// Checks a triangle list before it is handed to the device.
pub fn validate_geometry(vertex_count: usize, indices: &[u32]) -> Result<()> {
    if vertex_count == 0 || indices.is_empty() {
        bail!("geometry needs at least one vertex and one triangle");
    }
    if indices.len() % 3 != 0 {
        bail!("index count {} is not a multiple of 3", indices.len());
    }
    if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        bail!("index {bad} is out of range for {vertex_count} vertices");
    }
    Ok(())
}

/// A built structure and the buffer backing it.
struct AccelerationStructure {
    loader: khr::acceleration_structure::Device,
    handle: vk::AccelerationStructureKHR,
    address: vk::DeviceAddress,
    // dropped after the handle is destroyed
    _buffer: Buffer,
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_acceleration_structure(self.handle, None) };
    }
}

struct Tlas {
    structure: AccelerationStructure,
    _instance_buffer: Buffer,
    instance_count: u32,
}

/// Owns every bottom level structure for the life of the process and the one
/// top level structure over the current instance list.
pub struct AccelerationStructureManager {
    gpu: Rc<Gpu>,
    loader: khr::acceleration_structure::Device,
    blas_list: Vec<AccelerationStructure>,
    tlas: Option<Tlas>,
}

impl AccelerationStructureManager {
    pub fn new(gpu: &Rc<Gpu>) -> AccelerationStructureManager {
        AccelerationStructureManager {
            gpu: gpu.clone(),
            loader: khr::acceleration_structure::Device::new(&gpu.instance, &gpu.device),
            blas_list: Vec::new(),
            tlas: None,
        }
    }

    /// Builds an opaque triangle structure from packed positions and 32 bit
    /// indices. Blocks until the build has finished.
    pub fn create_blas(&mut self, vertices: &[Vec3], indices: &[u32]) -> Result<BlasHandle> {
        validate_geometry(vertices.len(), indices)?;

        let input_usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::STORAGE_BUFFER;

        let mut vertex_buffer = Buffer::new(
            &self.gpu,
            "blas vertices",
            std::mem::size_of_val(vertices) as vk::DeviceSize,
            input_usage,
            MemoryLocation::CpuToGpu,
        )?;
        vertex_buffer.upload(vertices, 0)?;

        let mut index_buffer = Buffer::new(
            &self.gpu,
            "blas indices",
            std::mem::size_of_val(indices) as vk::DeviceSize,
            input_usage,
            MemoryLocation::CpuToGpu,
        )?;
        index_buffer.upload(indices, 0)?;

        let geometry = vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::TRIANGLES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                    vertex_format: vk::Format::R32G32B32_SFLOAT,
                    vertex_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: vertex_buffer.device_address(),
                    },
                    vertex_stride: std::mem::size_of::<Vec3>() as vk::DeviceSize,
                    max_vertex: vertices.len() as u32 - 1,
                    index_type: vk::IndexType::UINT32,
                    index_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: index_buffer.device_address(),
                    },
                    ..Default::default()
                },
            },
            flags: vk::GeometryFlagsKHR::OPAQUE,
            ..Default::default()
        };

        let structure = self.build(
            "blas",
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            geometry,
            (indices.len() / 3) as u32,
        )?;

        let handle = BlasHandle(self.blas_list.len() as u32);
        debug!(
            "built blas {} from {} vertices, {} triangles",
            handle.0,
            vertices.len(),
            indices.len() / 3
        );
        self.blas_list.push(structure);
        Ok(handle)
    }

    pub fn create_cube_blas(&mut self) -> Result<BlasHandle> {
        let cube = geometry::cube();
        self.create_blas(&cube.positions, &cube.indices)
    }

    /// Replaces the top level structure with one over `instances`.
    ///
    /// An empty list is ignored and the current structure stays. Otherwise
    /// the device is idled and the old structure destroyed before the new one
    /// is built, so descriptors pointing at it must be rewritten afterwards.
    pub fn build_tlas(&mut self, instances: &[Instance]) -> Result<()> {
        if !tlas_rebuild_needed(instances) {
            warn!("no instances given, keeping the current top level structure");
            return Ok(());
        }

        let records = instances
            .iter()
            .map(|x| {
                let address = self
                    .blas_address(x.blas)
                    .ok_or_else(|| anyhow!("instance uses unknown blas {}", x.blas.0))?;
                x.to_vk(address)
            })
            .collect::<Result<Vec<_>>>()?;

        // frames in flight may still trace against the old structure
        self.gpu.wait_idle()?;
        self.tlas = None;

        let mut instance_buffer = Buffer::with_alignment(
            &self.gpu,
            "tlas instances",
            std::mem::size_of_val(records.as_slice()) as vk::DeviceSize,
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            MemoryLocation::CpuToGpu,
            16,
        )?;
        instance_buffer.upload(&records, 0)?;

        let geometry = vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::INSTANCES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                    array_of_pointers: vk::FALSE,
                    data: vk::DeviceOrHostAddressConstKHR {
                        device_address: instance_buffer.device_address(),
                    },
                    ..Default::default()
                },
            },
            flags: vk::GeometryFlagsKHR::OPAQUE,
            ..Default::default()
        };

        let instance_count = records.len() as u32;
        let structure = self.build(
            "tlas",
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            geometry,
            instance_count,
        )?;

        info!("built top level structure with {instance_count} instances");
        self.tlas = Some(Tlas {
            structure,
            _instance_buffer: instance_buffer,
            instance_count,
        });
        Ok(())
    }

    fn build(
        &self,
        name: &str,
        ty: vk::AccelerationStructureTypeKHR,
        geometry: vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
    ) -> Result<AccelerationStructure> {
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            ty,
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            geometry_count: 1,
            p_geometries: &raw const geometry,
            ..Default::default()
        };

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
                &mut size_info,
            );
        }

        let buffer = Buffer::new(
            &self.gpu,
            name,
            size_info.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR {
            ty,
            size: size_info.acceleration_structure_size,
            buffer: buffer.handle(),
            offset: 0,
            ..Default::default()
        };
        let handle = unsafe { self.loader.create_acceleration_structure(&create_info, None) }?;
        let mut structure = AccelerationStructure {
            loader: self.loader.clone(),
            handle,
            address: 0,
            _buffer: buffer,
        };

        let scratch = Buffer::with_alignment(
            &self.gpu,
            "acceleration structure scratch",
            size_info.build_scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            self.gpu
                .accel_properties
                .min_acceleration_structure_scratch_offset_alignment as vk::DeviceSize,
        )?;

        build_info.dst_acceleration_structure = handle;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: scratch.device_address(),
        };
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        self.gpu.one_shot(|_, command_buffer| unsafe {
            self.loader.cmd_build_acceleration_structures(
                command_buffer,
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&range)],
            );
        })?;

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR {
            acceleration_structure: handle,
            ..Default::default()
        };
        structure.address =
            unsafe { self.loader.get_acceleration_structure_device_address(&address_info) };

        // scratch is only needed until the build has completed, which one_shot waited for
        drop(scratch);
        Ok(structure)
    }

    pub fn blas_address(&self, handle: BlasHandle) -> Option<vk::DeviceAddress> {
        self.blas_list.get(handle.index()).map(|x| x.address)
    }

    pub fn blas_count(&self) -> usize {
        self.blas_list.len()
    }

    pub fn tlas(&self) -> Option<vk::AccelerationStructureKHR> {
        self.tlas.as_ref().map(|x| x.structure.handle)
    }

    /// Instances in the current top level structure, zero before the first build.
    pub fn tlas_instance_count(&self) -> u32 {
        self.tlas.as_ref().map_or(0, |x| x.instance_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_checks() {
        assert!(validate_geometry(3, &[0, 1, 2]).is_ok());
        assert!(validate_geometry(0, &[]).is_err());
        assert!(validate_geometry(3, &[]).is_err());
        assert!(validate_geometry(3, &[0, 1]).is_err());
        assert!(validate_geometry(3, &[0, 1, 3]).is_err());

        let cube = geometry::cube();
        assert!(validate_geometry(cube.positions.len(), &cube.indices).is_ok());
    }

    #[test]
    fn instance_record_is_row_major() {
        let transform = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0))
            * Mat4::from_scale(Vec3::new(4.0, 5.0, 6.0));
        let instance = Instance::new(BlasHandle(0), transform, 7);
        let record = instance.to_vk(0xdead_0000).unwrap();

        assert_eq!(
            record.transform.matrix,
            [4.0, 0.0, 0.0, 1.0, 0.0, 5.0, 0.0, 2.0, 0.0, 0.0, 6.0, 3.0]
        );
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 7);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xff);
        assert_eq!(
            record
                .instance_shader_binding_table_record_offset_and_flags
                .high_8() as u32,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(
            unsafe { record.acceleration_structure_reference.device_handle },
            0xdead_0000
        );
    }

    #[test]
    fn empty_instance_list_keeps_the_structure() {
        assert!(!tlas_rebuild_needed(&[]));
        assert!(tlas_rebuild_needed(&[Instance::new(BlasHandle(0), Mat4::IDENTITY, 0)]));
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let mut instance = Instance::new(BlasHandle(0), Mat4::IDENTITY, 1 << 24);
        assert!(instance.to_vk(1).is_err());

        instance.custom_index = PACKED_24_MAX;
        assert!(instance.to_vk(1).is_ok());

        instance.mask = 0x1ff;
        assert!(instance.to_vk(1).is_err());

        instance.mask = 0x0f;
        instance.sbt_offset = 1 << 24;
        assert!(instance.to_vk(1).is_err());
    }
}
