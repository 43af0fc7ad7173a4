mod raytrace;

pub use raytrace::RaytraceRenderer;
