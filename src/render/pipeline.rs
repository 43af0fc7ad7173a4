use std::fs::File;
use std::path::Path;
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use ash::{khr, vk};
use gpu_allocator::MemoryLocation;
use log::{debug, error, info, warn};

use crate::camera::CameraPushConstants;
use crate::defer::Defer;
use crate::gpu::Gpu;
use crate::render::accel::AccelerationStructureManager;
use crate::render::bind::{BindPoint, BoundResource, GrowableBuffer};
use crate::render::buffer::Buffer;
use crate::render::image::StorageImage;
use crate::render::sbt::{SbtLayout, SbtRegions, SHADER_GROUP_COUNT};
use crate::scene::{Light, LightList, ShadingInstance};
use crate::utils::{
    transition_image, ImageTransition, COLOR_SUBRESOURCE_LAYERS, COLOR_SUBRESOURCE_RANGE,
};

/// Shader binaries in shader group order. Miss shaders are selected by
/// their position: 0 primary, 1 shadow, 2 bounce.
pub const SHADER_FILES: [(&str, vk::ShaderStageFlags); SHADER_GROUP_COUNT as usize] = [
    ("rt_raygen.rgen.spv", vk::ShaderStageFlags::RAYGEN_KHR),
    ("rt_miss.rmiss.spv", vk::ShaderStageFlags::MISS_KHR),
    ("rt_shadow.rmiss.spv", vk::ShaderStageFlags::MISS_KHR),
    ("rt_bounce_miss.rmiss.spv", vk::ShaderStageFlags::MISS_KHR),
    ("rt_closesthit.rchit.spv", vk::ShaderStageFlags::CLOSEST_HIT_KHR),
];

/// primary ray, two bounces and the shadow rays cast from them
pub const MAX_RECURSION_DEPTH: u32 = 4;

const INITIAL_INSTANCE_CAPACITY: u64 = 1024;
const INITIAL_LIGHT_CAPACITY: u64 = 64;

const TLAS_BINDING: u32 = 0;
const IMAGE_BINDING: u32 = 1;
const INSTANCE_BINDING: u32 = 2;
const LIGHT_BINDING: u32 = 3;

/// Whether the output image has to be recreated for a `width` x `height`
/// frame. Zero sizes never do.
pub fn needs_resize(current: Option<vk::Extent2D>, width: u32, height: u32) -> bool {
    width != 0 && height != 0 && current != Some(vk::Extent2D { width, height })
}

/// Extent to read back for a screenshot, `None` until a frame was written.
pub fn readback_extent(current: Option<vk::Extent2D>, written: bool) -> Option<vk::Extent2D> {
    current.filter(|_| written)
}

/// What a frame records into the output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPass {
    Trace,
    /// nothing to trace against, the image is cleared to black
    Clear,
}

pub fn output_pass(tlas_bound: bool) -> OutputPass {
    if tlas_bound {
        OutputPass::Trace
    } else {
        OutputPass::Clear
    }
}

pub fn recursion_depth(device_max: u32) -> u32 {
    MAX_RECURSION_DEPTH.min(device_max)
}

pub fn check_push_constant_budget(max_push_constants_size: u32) -> Result<()> {
    let needed = std::mem::size_of::<CameraPushConstants>() as u32;
    if max_push_constants_size < needed {
        bail!(
            "camera push constants need {needed} bytes but the device allows {max_push_constants_size}"
        );
    }
    Ok(())
}

pub fn load_shader(path: &Path) -> Result<Vec<u32>> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open shader {}", path.display()))?;
    ash::util::read_spv(&mut file)
        .with_context(|| format!("{} is not valid SPIR-V", path.display()))
}

/// The ray tracing pipeline and everything its single descriptor set points
/// at: the top level structure, the output image and the instance and light
/// buffers.
pub struct RtPipeline {
    gpu: Rc<Gpu>,
    loader: khr::ray_tracing_pipeline::Device,

    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,

    _sbt_buffer: Buffer,
    regions: SbtRegions,

    tlas_binding: BindPoint,
    bound_instance_count: u32,

    image_binding: BindPoint,
    storage_image: Option<StorageImage>,
    image_written: bool,

    instances: GrowableBuffer<ShadingInstance>,
    lights: GrowableBuffer<Light>,
}

impl RtPipeline {
    pub fn new(gpu: &Rc<Gpu>, shader_dir: &Path) -> Result<RtPipeline> {
        let device = &gpu.device;
        check_push_constant_budget(gpu.properties.limits.max_push_constants_size)?;

        let code = SHADER_FILES
            .iter()
            .map(|(name, _)| load_shader(&shader_dir.join(name)))
            .collect::<Result<Vec<_>>>()?;

        let bindings = [
            vk::DescriptorSetLayoutBinding {
                binding: TLAS_BINDING,
                descriptor_type: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::RAYGEN_KHR
                    | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ..Default::default()
            },
            vk::DescriptorSetLayoutBinding {
                binding: IMAGE_BINDING,
                descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::RAYGEN_KHR,
                ..Default::default()
            },
            // shading records
            vk::DescriptorSetLayoutBinding {
                binding: INSTANCE_BINDING,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ..Default::default()
            },
            // lights
            vk::DescriptorSetLayoutBinding {
                binding: LIGHT_BINDING,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ..Default::default()
            },
        ];

        let descriptor_set_layout = {
            let create_info = vk::DescriptorSetLayoutCreateInfo {
                binding_count: bindings.len() as u32,
                p_bindings: bindings.as_ptr(),
                ..Default::default()
            };
            unsafe { device.create_descriptor_set_layout(&create_info, None) }?
                .defer(|x| unsafe { device.destroy_descriptor_set_layout(*x, None) })
        };

        let descriptor_pool = {
            let sizes: Vec<_> = bindings
                .iter()
                .map(|x| vk::DescriptorPoolSize {
                    ty: x.descriptor_type,
                    descriptor_count: x.descriptor_count,
                })
                .collect();
            let create_info = vk::DescriptorPoolCreateInfo {
                max_sets: 1,
                pool_size_count: sizes.len() as u32,
                p_pool_sizes: sizes.as_ptr(),
                ..Default::default()
            };
            unsafe { device.create_descriptor_pool(&create_info, None) }?
                .defer(|x| unsafe { device.destroy_descriptor_pool(*x, None) })
        };

        let descriptor_set = {
            let allocate_info = vk::DescriptorSetAllocateInfo {
                descriptor_pool: *descriptor_pool,
                descriptor_set_count: 1,
                p_set_layouts: &*descriptor_set_layout,
                ..Default::default()
            };
            unsafe { device.allocate_descriptor_sets(&allocate_info) }?[0]
        };

        let pipeline_layout = {
            let push_constant_range = vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::RAYGEN_KHR
                    | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                offset: 0,
                size: std::mem::size_of::<CameraPushConstants>() as u32,
            };
            let create_info = vk::PipelineLayoutCreateInfo {
                set_layout_count: 1,
                p_set_layouts: &*descriptor_set_layout,
                push_constant_range_count: 1,
                p_push_constant_ranges: &raw const push_constant_range,
                ..Default::default()
            };
            unsafe { device.create_pipeline_layout(&create_info, None) }?
                .defer(|x| unsafe { device.destroy_pipeline_layout(*x, None) })
        };

        let loader = khr::ray_tracing_pipeline::Device::new(&gpu.instance, device);

        let modules = {
            let mut modules = Vec::new().defer(|x: &Vec<vk::ShaderModule>| {
                for module in x {
                    unsafe { device.destroy_shader_module(*module, None) };
                }
            });
            for words in &code {
                let create_info = vk::ShaderModuleCreateInfo {
                    code_size: words.len() * 4,
                    p_code: words.as_ptr(),
                    ..Default::default()
                };
                modules.push(unsafe { device.create_shader_module(&create_info, None) }?);
            }
            modules
        };

        let stages: Vec<_> = modules
            .iter()
            .zip(SHADER_FILES)
            .map(|(module, (_, stage))| vk::PipelineShaderStageCreateInfo {
                stage,
                module: *module,
                p_name: c"main".as_ptr(),
                ..Default::default()
            })
            .collect();

        let groups: Vec<_> = SHADER_FILES
            .iter()
            .enumerate()
            .map(|(i, (_, stage))| {
                if *stage == vk::ShaderStageFlags::CLOSEST_HIT_KHR {
                    vk::RayTracingShaderGroupCreateInfoKHR {
                        ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                        general_shader: vk::SHADER_UNUSED_KHR,
                        closest_hit_shader: i as u32,
                        any_hit_shader: vk::SHADER_UNUSED_KHR,
                        intersection_shader: vk::SHADER_UNUSED_KHR,
                        ..Default::default()
                    }
                } else {
                    vk::RayTracingShaderGroupCreateInfoKHR {
                        ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
                        general_shader: i as u32,
                        closest_hit_shader: vk::SHADER_UNUSED_KHR,
                        any_hit_shader: vk::SHADER_UNUSED_KHR,
                        intersection_shader: vk::SHADER_UNUSED_KHR,
                        ..Default::default()
                    }
                }
            })
            .collect();

        let depth = recursion_depth(gpu.rt_pipeline_properties.max_ray_recursion_depth);
        let pipeline = unsafe {
            let out = loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[vk::RayTracingPipelineCreateInfoKHR {
                    stage_count: stages.len() as u32,
                    p_stages: stages.as_ptr(),
                    group_count: groups.len() as u32,
                    p_groups: groups.as_ptr(),
                    max_pipeline_ray_recursion_depth: depth,
                    layout: *pipeline_layout,
                    ..Default::default()
                }],
                None,
            );
            match out {
                Ok(x) => x[0],
                Err((_, e)) => bail!("failed to create ray tracing pipeline: {e}"),
            }
        }
        .defer(|x| unsafe { device.destroy_pipeline(*x, None) });
        // modules are no longer needed once the pipeline exists
        drop(modules);
        debug!("created ray tracing pipeline with recursion depth {depth}");

        let props = &gpu.rt_pipeline_properties;
        let layout = SbtLayout::new(
            props.shader_group_handle_size,
            props.shader_group_handle_alignment,
            props.shader_group_base_alignment,
        );
        let handles = unsafe {
            loader.get_ray_tracing_shader_group_handles(
                *pipeline,
                0,
                SHADER_GROUP_COUNT as u32,
                (layout.handle_size * SHADER_GROUP_COUNT) as usize,
            )
        }?;
        let table = layout.write(&handles)?;

        let mut sbt_buffer = Buffer::with_alignment(
            gpu,
            "shader binding table",
            layout.total_size,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            props.shader_group_base_alignment as vk::DeviceSize,
        )?;
        sbt_buffer.upload(&table, 0)?;
        let regions = layout.regions(sbt_buffer.device_address());

        let instances = GrowableBuffer::new(
            gpu,
            "instance buffer",
            INITIAL_INSTANCE_CAPACITY,
            BindPoint::new(descriptor_set, INSTANCE_BINDING, vk::DescriptorType::STORAGE_BUFFER),
        )?;
        let mut lights = GrowableBuffer::new(
            gpu,
            "light buffer",
            INITIAL_LIGHT_CAPACITY,
            BindPoint::new(descriptor_set, LIGHT_BINDING, vk::DescriptorType::STORAGE_BUFFER),
        )?;
        // an unset light buffer must still read as terminated
        lights.set(LightList::new().as_gpu_slice())?;

        info!("ray tracing pipeline ready");
        Ok(RtPipeline {
            gpu: gpu.clone(),
            loader,
            descriptor_set_layout: descriptor_set_layout.undefer(),
            descriptor_pool: descriptor_pool.undefer(),
            descriptor_set,
            pipeline_layout: pipeline_layout.undefer(),
            pipeline: pipeline.undefer(),
            _sbt_buffer: sbt_buffer,
            regions,
            tlas_binding: BindPoint::new(
                descriptor_set,
                TLAS_BINDING,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            ),
            bound_instance_count: 0,
            image_binding: BindPoint::new(
                descriptor_set,
                IMAGE_BINDING,
                vk::DescriptorType::STORAGE_IMAGE,
            ),
            storage_image: None,
            image_written: false,
            instances,
            lights,
        })
    }

    /// Uploads the shading records, one per instance in custom index order.
    pub fn set_instances(&mut self, instances: &[ShadingInstance]) -> Result<()> {
        self.instances.set(instances)
    }

    pub fn set_lights(&mut self, lights: &LightList) -> Result<()> {
        self.lights.set(lights.as_gpu_slice())
    }

    /// Re-points the structure binding at the manager's current top level
    /// structure. Needed after every rebuild.
    pub fn update_tlas_descriptor(&mut self, accel: &AccelerationStructureManager) -> Result<()> {
        let Some(tlas) = accel.tlas() else {
            warn!("no top level structure built yet, descriptor left unbound");
            return Ok(());
        };
        self.tlas_binding
            .rebind(&self.gpu.device, BoundResource::AccelerationStructure(tlas))?;
        self.bound_instance_count = accel.tlas_instance_count();
        Ok(())
    }

    /// Makes the output image exactly `width` x `height`. Zero sizes are ignored.
    pub fn resize_storage_image(&mut self, width: u32, height: u32) -> Result<()> {
        if !needs_resize(self.storage_image.as_ref().map(|x| x.extent()), width, height) {
            if width == 0 || height == 0 {
                debug!("ignoring {width}x{height} storage image request");
            }
            return Ok(());
        }
        let extent = vk::Extent2D { width, height };

        // the old image may still be written by frames in flight
        self.gpu.wait_idle()?;
        self.storage_image = None;
        self.image_written = false;

        let image = StorageImage::new(&self.gpu, extent)?;
        self.image_binding
            .rebind(&self.gpu.device, BoundResource::StorageImage(image.view()))?;
        debug!("storage image is now {width}x{height}");
        self.storage_image = Some(image);
        Ok(())
    }

    /// Records a `width` x `height` dispatch into `command_buffer`. The output
    /// image must already be in the `GENERAL` layout.
    ///
    /// Without a bound top level structure the image is cleared instead.
    pub fn trace_rays(
        &mut self,
        command_buffer: vk::CommandBuffer,
        width: u32,
        height: u32,
        camera: &CameraPushConstants,
    ) -> Result<()> {
        self.resize_storage_image(width, height)?;
        let Some(image) = self.storage_image.as_ref().map(|x| x.image()) else {
            bail!("no storage image to trace into");
        };

        let device = &self.gpu.device;
        if output_pass(self.tlas_binding.current().is_some()) == OutputPass::Clear {
            debug!("no top level structure bound, clearing the frame");
            unsafe {
                device.cmd_clear_color_image(
                    command_buffer,
                    image,
                    vk::ImageLayout::GENERAL,
                    &vk::ClearColorValue {
                        float32: [0.0, 0.0, 0.0, 1.0],
                    },
                    &[COLOR_SUBRESOURCE_RANGE],
                );
            }
            self.image_written = true;
            return Ok(());
        }

        unsafe {
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline_layout,
                0,
                &[self.descriptor_set],
                &[],
            );
            device.cmd_push_constants(
                command_buffer,
                self.pipeline_layout,
                vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                0,
                bytemuck::bytes_of(camera),
            );
            self.loader.cmd_trace_rays(
                command_buffer,
                &self.regions.raygen,
                &self.regions.miss,
                &self.regions.hit,
                &self.regions.callable,
                width,
                height,
                1,
            );
        }
        self.image_written = true;
        Ok(())
    }

    /// Reads the output image back as tightly packed RGBA8.
    ///
    /// Idles the device. Returns an empty vector if nothing was traced yet.
    pub fn capture_screenshot(&self) -> Result<Vec<u8>> {
        let current = self.storage_image.as_ref().map(|x| x.extent());
        let (Some(image), Some(extent)) = (
            self.storage_image.as_ref(),
            readback_extent(current, self.image_written),
        ) else {
            warn!("screenshot requested before any frame was traced");
            return Ok(Vec::new());
        };

        self.gpu.wait_idle()?;

        let size = image.byte_size();
        let staging = Buffer::new(
            &self.gpu,
            "screenshot staging",
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        self.gpu.one_shot(|device, command_buffer| unsafe {
            transition_image(
                device,
                command_buffer,
                image.image(),
                ImageTransition {
                    old_layout: vk::ImageLayout::GENERAL,
                    new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    src_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                        | vk::PipelineStageFlags::TRANSFER,
                    src_access: vk::AccessFlags::SHADER_WRITE
                        | vk::AccessFlags::TRANSFER_READ
                        | vk::AccessFlags::TRANSFER_WRITE,
                    dst_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_access: vk::AccessFlags::TRANSFER_READ,
                },
            );
            device.cmd_copy_image_to_buffer(
                command_buffer,
                image.image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                staging.handle(),
                &[vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: COLOR_SUBRESOURCE_LAYERS,
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    },
                }],
            );
            transition_image(
                device,
                command_buffer,
                image.image(),
                ImageTransition {
                    old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    new_layout: vk::ImageLayout::GENERAL,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    src_access: vk::AccessFlags::TRANSFER_READ,
                    dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                    dst_access: vk::AccessFlags::SHADER_WRITE,
                },
            );
        })?;

        let pixels = staging
            .mapped()?
            .get(..size as usize)
            .ok_or(anyhow!("screenshot staging buffer is smaller than the image"))?;
        Ok(pixels.to_vec())
    }

    pub fn storage_image(&self) -> Option<&StorageImage> {
        self.storage_image.as_ref()
    }

    /// Instances in the structure the descriptor currently points at.
    pub fn instance_count(&self) -> u32 {
        self.bound_instance_count
    }

    /// Lights in the buffer, sentinel excluded.
    pub fn light_count(&self) -> usize {
        self.lights.len().saturating_sub(1)
    }
}

impl Drop for RtPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            error!("{e:#}");
        }
        let device = &self.gpu.device;
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            // frees the set with it
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursion_depth_respects_device_limit() {
        assert_eq!(recursion_depth(31), 4);
        assert_eq!(recursion_depth(4), 4);
        assert_eq!(recursion_depth(1), 1);
    }

    #[test]
    fn push_constant_budget() {
        assert!(check_push_constant_budget(128).is_err());
        assert!(check_push_constant_budget(144).is_ok());
        assert!(check_push_constant_budget(256).is_ok());
    }

    #[test]
    fn shader_groups_follow_miss_index_convention() {
        let stages: Vec<_> = SHADER_FILES.iter().map(|(_, stage)| *stage).collect();
        assert_eq!(stages[0], vk::ShaderStageFlags::RAYGEN_KHR);
        assert!(stages[1..4].iter().all(|x| *x == vk::ShaderStageFlags::MISS_KHR));
        assert_eq!(stages[4], vk::ShaderStageFlags::CLOSEST_HIT_KHR);
        assert_eq!(SHADER_FILES[2].0, "rt_shadow.rmiss.spv");
        assert_eq!(SHADER_FILES[3].0, "rt_bounce_miss.rmiss.spv");
    }

    #[test]
    fn resize_only_on_a_new_nonzero_size() {
        let current = Some(vk::Extent2D {
            width: 640,
            height: 480,
        });
        assert!(!needs_resize(current, 640, 480));
        assert!(needs_resize(current, 800, 480));
        assert!(needs_resize(None, 640, 480));
        assert!(!needs_resize(current, 0, 480));
        assert!(!needs_resize(None, 640, 0));
    }

    #[test]
    fn screenshot_needs_a_written_frame() {
        let extent = vk::Extent2D {
            width: 8,
            height: 4,
        };
        assert_eq!(readback_extent(Some(extent), false), None);
        assert_eq!(readback_extent(None, true), None);
        assert_eq!(readback_extent(Some(extent), true), Some(extent));
    }

    #[test]
    fn unbound_structure_clears_the_frame() {
        assert_eq!(output_pass(false), OutputPass::Clear);
        assert_eq!(output_pass(true), OutputPass::Trace);
    }

    #[test]
    fn missing_shader_is_an_error() {
        let err = load_shader(Path::new("no/such/shader.spv")).unwrap_err();
        assert!(format!("{err:#}").contains("no/such/shader.spv"));
    }

    #[test]
    fn malformed_shader_is_an_error() {
        let path = std::env::temp_dir().join(format!("dungeon-rt-bad-{}.spv", std::process::id()));
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let result = load_shader(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
