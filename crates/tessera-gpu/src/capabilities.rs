//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    /// Software implementation without a PCI vendor.
    Software,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            0x10005 => Self::Software,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Synchronization2 support (VK 1.3 core)
    pub supports_synchronization2: bool,
    /// Descriptor indexing support
    pub supports_descriptor_indexing: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,

    /// Required alignment of dynamic uniform buffer offsets
    pub min_uniform_buffer_offset_alignment: u64,
    /// Required alignment of dynamic storage buffer offsets
    pub min_storage_buffer_offset_alignment: u64,
    /// Maximum push constant block size in bytes
    pub max_push_constants_size: u32,
    /// Maximum descriptor sets bound at once
    pub max_bound_descriptor_sets: u32,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_3 = has_api_1_3(api_version);
        let limits = properties.limits;

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_synchronization2: has_vulkan_1_3
                || available_extensions.contains("VK_KHR_synchronization2"),
            supports_descriptor_indexing: has_vulkan_1_3
                || available_extensions.contains("VK_EXT_descriptor_indexing"),

            device_local_memory_mb,
            max_memory_allocation_count: limits.max_memory_allocation_count,

            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            max_push_constants_size: limits.max_push_constants_size,
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,

            available_extensions,
        }
    }

    /// Capabilities reported by the CPU-side backend.
    pub fn headless() -> Self {
        Self {
            vendor: GpuVendor::Software,
            device_name: "Headless".to_string(),
            api_version: vk::API_VERSION_1_3,
            driver_version: 0,
            supports_synchronization2: true,
            supports_descriptor_indexing: true,
            device_local_memory_mb: 0,
            max_memory_allocation_count: u32::MAX,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 16,
            max_push_constants_size: 128,
            max_bound_descriptor_sets: 8,
            available_extensions: HashSet::new(),
        }
    }

    /// Check if the GPU meets minimum requirements for the device.
    pub fn meets_requirements(&self) -> bool {
        // Barriers are recorded through synchronization2
        has_api_1_3(self.api_version) && self.supports_synchronization2
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

pub(crate) fn has_api_1_3(api_version: u32) -> bool {
    let major = vk::api_version_major(api_version);
    let minor = vk::api_version_minor(api_version);
    major > 1 || (major == 1 && minor >= 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn headless_meets_requirements() {
        let caps = GpuCapabilities::headless();
        assert!(caps.meets_requirements());
        assert!(caps.summary().starts_with("Headless (Software) - Vulkan 1.3.0"));
    }

    #[test]
    fn api_version_check() {
        assert!(has_api_1_3(vk::make_api_version(0, 1, 3, 0)));
        assert!(has_api_1_3(vk::make_api_version(0, 1, 4, 0)));
        assert!(!has_api_1_3(vk::make_api_version(0, 1, 2, 200)));
    }
}
