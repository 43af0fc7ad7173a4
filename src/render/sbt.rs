use anyhow::{bail, Result};
use ash::vk;

use crate::utils::align_up;

/// Miss shaders by miss index: primary rays, shadow rays, bounce rays. The
/// shaders select them through the `missIndex` argument of `traceRayEXT`.
pub const MISS_SHADER_COUNT: u64 = 3;
/// Raygen, the miss shaders and one closest hit group, in that order.
pub const SHADER_GROUP_COUNT: u64 = 2 + MISS_SHADER_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

impl SbtRegion {
    fn to_vk(self, base_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

/// Where every shader group handle lives inside the binding table buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub total_size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

impl SbtLayout {
    pub fn new(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> SbtLayout {
        let handle_size = handle_size as u64;
        let base_alignment = base_alignment as u64;
        let handle_stride = align_up(handle_size, handle_alignment as u64);

        // raygen stride has to equal its size
        let raygen_size = align_up(handle_stride, base_alignment);
        let raygen = SbtRegion {
            offset: 0,
            stride: raygen_size,
            size: raygen_size,
        };
        let miss = SbtRegion {
            offset: raygen.offset + raygen.size,
            stride: handle_stride,
            size: align_up(MISS_SHADER_COUNT * handle_stride, base_alignment),
        };
        let hit = SbtRegion {
            offset: miss.offset + miss.size,
            stride: handle_stride,
            size: align_up(handle_stride, base_alignment),
        };

        SbtLayout {
            handle_size,
            raygen,
            miss,
            hit,
            total_size: hit.offset + hit.size,
        }
    }

    /// Byte offset of each group's handle, in group order.
    pub fn handle_offsets(&self) -> [u64; SHADER_GROUP_COUNT as usize] {
        let mut out = [0; SHADER_GROUP_COUNT as usize];
        out[0] = self.raygen.offset;
        for i in 0..MISS_SHADER_COUNT {
            out[1 + i as usize] = self.miss.offset + i * self.miss.stride;
        }
        out[SHADER_GROUP_COUNT as usize - 1] = self.hit.offset;
        out
    }

    /// Scatters the tightly packed `handles` returned by the driver into a
    /// zero padded table.
    pub fn write(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        if handles.len() != handle_size * SHADER_GROUP_COUNT as usize {
            bail!(
                "expected {} shader group handle bytes, got {}",
                handle_size * SHADER_GROUP_COUNT as usize,
                handles.len()
            );
        }

        let mut table = vec![0u8; self.total_size as usize];
        for (handle, offset) in handles
            .chunks_exact(handle_size)
            .zip(self.handle_offsets())
        {
            let offset = offset as usize;
            table[offset..offset + handle_size].copy_from_slice(handle);
        }
        Ok(table)
    }

    pub fn regions(&self, base_address: vk::DeviceAddress) -> SbtRegions {
        SbtRegions {
            raygen: self.raygen.to_vk(base_address),
            miss: self.miss.to_vk(base_address),
            hit: self.hit.to_vk(base_address),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typical_discrete_layout() {
        let layout = SbtLayout::new(32, 32, 64);
        assert_eq!(layout.raygen, SbtRegion { offset: 0, stride: 64, size: 64 });
        assert_eq!(layout.miss, SbtRegion { offset: 64, stride: 32, size: 128 });
        assert_eq!(layout.hit, SbtRegion { offset: 192, stride: 32, size: 64 });
        assert_eq!(layout.total_size, 256);
        assert_eq!(layout.handle_offsets(), [0, 64, 96, 128, 192]);
    }

    #[test]
    fn handle_alignment_pads_miss_entries() {
        let layout = SbtLayout::new(32, 64, 64);
        assert_eq!(layout.miss.stride, 64);
        assert_eq!(layout.miss.size, 192);
        assert_eq!(layout.handle_offsets(), [0, 64, 128, 192, 256]);
        assert_eq!(layout.total_size, 320);
    }

    #[test]
    fn regions_start_on_base_alignment() {
        for (size, handle, base) in [(32, 32, 64), (32, 32, 32), (16, 16, 128), (32, 64, 256)] {
            let layout = SbtLayout::new(size, handle, base);
            for region in [layout.raygen, layout.miss, layout.hit] {
                assert_eq!(region.offset % base as u64, 0);
                assert!(region.size >= region.stride);
            }
        }
    }

    #[test]
    fn write_places_handles() {
        let layout = SbtLayout::new(4, 8, 16);
        let handles: Vec<u8> = (1..=20).collect();
        let table = layout.write(&handles).unwrap();

        assert_eq!(table.len() as u64, layout.total_size);
        for (group, offset) in layout.handle_offsets().into_iter().enumerate() {
            let offset = offset as usize;
            assert_eq!(&table[offset..offset + 4], &handles[group * 4..group * 4 + 4]);
        }
        // padding after the raygen handle stays zero
        assert!(table[4..16].iter().all(|&x| x == 0));
    }

    #[test]
    fn write_rejects_wrong_handle_count() {
        let layout = SbtLayout::new(32, 32, 64);
        assert!(layout.write(&[0u8; 32 * 4]).is_err());
    }

    #[test]
    fn regions_offset_from_base_address() {
        let layout = SbtLayout::new(32, 32, 64);
        let regions = layout.regions(0x1000);
        assert_eq!(regions.raygen.device_address, 0x1000);
        assert_eq!(regions.miss.device_address, 0x1040);
        assert_eq!(regions.hit.device_address, 0x10c0);
        assert_eq!(regions.callable.size, 0);
    }
}
