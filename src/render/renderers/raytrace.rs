use std::ffi::c_char;
use std::path::Path;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use ash::{khr, vk};
use log::{debug, info, warn};

use crate::camera::CameraPushConstants;
use crate::context::FrameTarget;
use crate::control::SceneChanges;
use crate::gpu::Gpu;
use crate::render::accel::{AccelerationStructureManager, BlasHandle, Instance};
use crate::render::pipeline::RtPipeline;
use crate::render::{Renderer, Screenshot};
use crate::scene::{shading_records, LightList, MeshSource, Scene, SceneObject};
use crate::utils::{transition_image, ImageTransition, COLOR_SUBRESOURCE_LAYERS};

/// Builds one structure instance per object. The custom index is the
/// object's position, which is also where its shading record lives.
pub fn object_instances(objects: &[SceneObject], mesh_blas: &[BlasHandle]) -> Result<Vec<Instance>> {
    objects
        .iter()
        .enumerate()
        .map(|(i, object)| {
            let blas = mesh_blas
                .get(object.mesh)
                .ok_or_else(|| anyhow!("object {i} references unloaded mesh {}", object.mesh))?;
            let mut instance = Instance::new(*blas, object.transform, i as u32);
            instance.mask = object.mask;
            Ok(instance)
        })
        .collect()
}

pub struct RaytraceRenderer {
    // WARNING: ORDER MATTERS HERE!!!
    // the pipeline's descriptors point into the structures, drop it first
    pipeline: RtPipeline,
    accel: AccelerationStructureManager,
    mesh_blas: Vec<BlasHandle>,
    gpu: Rc<Gpu>,
}

impl RaytraceRenderer {
    fn load_meshes(&mut self, scene: &Scene) -> Result<()> {
        for mesh in &scene.meshes {
            let handle = match &mesh.source {
                MeshSource::Cube => self.accel.create_cube_blas()?,
                source @ MeshSource::Obj(_) => {
                    let data = source
                        .load()
                        .with_context(|| format!("failed to load mesh '{}'", mesh.name))?;
                    debug!("mesh '{}' has {} triangles", mesh.name, data.triangle_count());
                    self.accel.create_blas(&data.positions, &data.indices)?
                }
            };
            debug!("mesh '{}' is blas {}", mesh.name, handle.index());
            self.mesh_blas.push(handle);
        }
        Ok(())
    }

    fn set_objects(&mut self, objects: &[SceneObject]) -> Result<()> {
        let instances = object_instances(objects, &self.mesh_blas)?;
        self.accel.build_tlas(&instances)?;

        self.pipeline.set_instances(&shading_records(objects))?;
        self.pipeline.update_tlas_descriptor(&self.accel)
    }

    fn set_lights(&mut self, lights: &LightList) -> Result<()> {
        self.pipeline.set_lights(lights)
    }
}

impl Renderer for RaytraceRenderer {
    fn new(gpu: &Rc<Gpu>, shader_dir: &Path) -> Result<Self> {
        let pipeline = RtPipeline::new(gpu, shader_dir)?;
        let accel = AccelerationStructureManager::new(gpu);

        Ok(RaytraceRenderer {
            pipeline,
            accel,
            mesh_blas: Vec::new(),
            gpu: gpu.clone(),
        })
    }

    fn ingest_scene(&mut self, scene: &Scene) -> Result<()> {
        scene.validate()?;
        self.load_meshes(scene)?;
        self.set_objects(&scene.objects)?;
        self.set_lights(&scene.lights)?;
        if scene.lights.is_empty() {
            warn!("scene has no lights");
        }

        info!(
            "scene ingested: {} meshes in {} blas, {} instances, {} lights",
            scene.meshes.len(),
            self.accel.blas_count(),
            self.pipeline.instance_count(),
            self.pipeline.light_count(),
        );
        Ok(())
    }

    fn apply_changes(&mut self, changes: &SceneChanges) -> Result<()> {
        if let Some(objects) = &changes.objects {
            self.set_objects(objects)?;
            debug!("rebuilt scene with {} instances", self.pipeline.instance_count());
        }
        if let Some(lights) = &changes.lights {
            self.set_lights(lights)?;
            debug!("updated {} lights", self.pipeline.light_count());
        }
        Ok(())
    }

    fn record_frame(&mut self, target: &FrameTarget, camera: &CameraPushConstants) -> Result<()> {
        let vk::Extent2D { width, height } = target.extent;
        self.pipeline.resize_storage_image(width, height)?;
        let storage_image = self
            .pipeline
            .storage_image()
            .ok_or_else(|| anyhow!("no storage image for a {width}x{height} frame"))?
            .image();

        let device = &self.gpu.device;
        let command_buffer = target.command_buffer;

        unsafe {
            // previous contents are not needed, only the last blit has to finish
            transition_image(
                device,
                command_buffer,
                storage_image,
                ImageTransition {
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::GENERAL,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    src_access: vk::AccessFlags::empty(),
                    dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                        | vk::PipelineStageFlags::TRANSFER,
                    dst_access: vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE,
                },
            );
        }

        // clears instead of tracing while no structure is bound
        self.pipeline
            .trace_rays(command_buffer, width, height, camera)?;

        let full = [
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D {
                x: width as i32,
                y: height as i32,
                z: 1,
            },
        ];

        unsafe {
            transition_image(
                device,
                command_buffer,
                storage_image,
                ImageTransition {
                    old_layout: vk::ImageLayout::GENERAL,
                    new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    src_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                        | vk::PipelineStageFlags::TRANSFER,
                    src_access: vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE,
                    dst_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_access: vk::AccessFlags::TRANSFER_READ,
                },
            );
            // chains onto the acquire semaphore wait
            transition_image(
                device,
                command_buffer,
                target.image,
                ImageTransition {
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    src_access: vk::AccessFlags::empty(),
                    dst_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_access: vk::AccessFlags::TRANSFER_WRITE,
                },
            );

            device.cmd_blit_image(
                command_buffer,
                storage_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[vk::ImageBlit {
                    src_subresource: COLOR_SUBRESOURCE_LAYERS,
                    src_offsets: full,
                    dst_subresource: COLOR_SUBRESOURCE_LAYERS,
                    dst_offsets: full,
                }],
                vk::Filter::NEAREST,
            );

            transition_image(
                device,
                command_buffer,
                target.image,
                ImageTransition {
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    src_access: vk::AccessFlags::TRANSFER_WRITE,
                    dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    dst_access: vk::AccessFlags::empty(),
                },
            );
            // screenshots expect the storage image in GENERAL between frames
            transition_image(
                device,
                command_buffer,
                storage_image,
                ImageTransition {
                    old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    new_layout: vk::ImageLayout::GENERAL,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    src_access: vk::AccessFlags::TRANSFER_READ,
                    dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                        | vk::PipelineStageFlags::TRANSFER,
                    dst_access: vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE,
                },
            );
        }

        Ok(())
    }

    fn screenshot(&self) -> Result<Screenshot> {
        let rgba = self.pipeline.capture_screenshot()?;
        let (width, height) = match self.pipeline.storage_image() {
            Some(image) if !rgba.is_empty() => (image.extent().width, image.extent().height),
            _ => (0, 0),
        };
        Ok(Screenshot {
            rgba,
            width,
            height,
        })
    }

    fn instance_count(&self) -> usize {
        self.pipeline.instance_count() as usize
    }

    fn light_count(&self) -> usize {
        self.pipeline.light_count()
    }

    fn required_device_extensions() -> &'static [*const c_char] {
        const EXTENSIONS: &[*const c_char] = &[
            khr::acceleration_structure::NAME.as_ptr(),
            khr::deferred_host_operations::NAME.as_ptr(),
            khr::ray_tracing_pipeline::NAME.as_ptr(),
            khr::buffer_device_address::NAME.as_ptr(),
            ash::ext::descriptor_indexing::NAME.as_ptr(),
            khr::spirv_1_4::NAME.as_ptr(),
            khr::shader_float_controls::NAME.as_ptr(),
        ];
        EXTENSIONS
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::*;
    use crate::render::accel::tlas_rebuild_needed;
    use crate::render::pipeline::{output_pass, OutputPass};
    use crate::scene::dungeon::dungeon_scene;
    use crate::scene::ShadingInstance;

    fn object(mesh: usize) -> SceneObject {
        SceneObject::new(mesh, Mat4::IDENTITY, ShadingInstance::matte(Vec3::ONE, 0.5))
    }

    #[test]
    fn custom_index_follows_object_order() {
        let blas = [BlasHandle(0), BlasHandle(1)];
        let mut objects = vec![object(1), object(0), object(1)];
        objects[2].mask = 0x01;

        let instances = object_instances(&objects, &blas).unwrap();
        let indices: Vec<_> = instances.iter().map(|x| x.custom_index).collect();
        assert_eq!(indices, [0, 1, 2]);
        assert_eq!(instances[0].blas, BlasHandle(1));
        assert_eq!(instances[1].blas, BlasHandle(0));
        assert_eq!(instances[0].mask, 0xff);
        assert_eq!(instances[2].mask, 0x01);
    }

    #[test]
    fn unloaded_mesh_is_an_error() {
        let err = object_instances(&[object(0), object(2)], &[BlasHandle(0)]).unwrap_err();
        assert!(err.to_string().contains("object 1"));
    }

    #[test]
    fn dungeon_instances_match_shading_records() {
        let scene = dungeon_scene();
        let instances = object_instances(&scene.objects, &[BlasHandle(0)]).unwrap();
        assert_eq!(instances.len(), shading_records(&scene.objects).len());
        assert!(instances
            .iter()
            .zip(&scene.objects)
            .all(|(instance, object)| instance.transform == object.transform));
    }

    #[test]
    fn empty_scene_renders_a_cleared_frame() {
        let instances = object_instances(&[], &[BlasHandle(0)]).unwrap();
        assert!(instances.is_empty());
        // no structure gets built, so nothing is ever bound
        assert!(!tlas_rebuild_needed(&instances));
        assert_eq!(output_pass(false), OutputPass::Clear);
    }

    #[test]
    fn extension_list_has_ray_tracing_set() {
        let names: Vec<_> = RaytraceRenderer::required_device_extensions()
            .iter()
            .map(|x| unsafe { std::ffi::CStr::from_ptr(*x) })
            .collect();
        assert!(names.contains(&khr::ray_tracing_pipeline::NAME));
        assert!(names.contains(&khr::acceleration_structure::NAME));
        assert!(!names.contains(&khr::swapchain::NAME));
    }
}
