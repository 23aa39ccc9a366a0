//! Device memory for buffers and images, backed by gpu-allocator.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle as _;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use tracing::{error, warn};

use crate::backend::{NativeBuffer, NativeImage};
use crate::error::{GpuError, Result};
use crate::resource::{aspect_mask, BufferDesc, ImageDesc, MappedMemory, MemoryResidency};

/// Owns every allocation made for buffers and images.
///
/// Allocations are keyed by the raw handle of the object they back, so an
/// object is freed from its handle alone.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    /// Queue families resources are shared between; CONCURRENT when more than one.
    queue_families: Vec<u32>,
    buffers: HashMap<u64, Allocation>,
    images: HashMap<u64, Allocation>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        queue_families: Vec<u32>,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            queue_families,
            buffers: HashMap::new(),
            images: HashMap::new(),
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    fn sharing_mode(&self) -> vk::SharingMode {
        if self.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        }
    }

    /// Create a buffer and bind memory for its residency.
    pub fn create_buffer(&mut self, desc: &BufferDesc) -> Result<NativeBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage.to_vk())
            .sharing_mode(self.sharing_mode())
            .queue_family_indices(&self.queue_families);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = match desc.residency {
            MemoryResidency::DeviceLocal => MemoryLocation::GpuOnly,
            MemoryResidency::HostVisible | MemoryResidency::HostVisibleCoherent => {
                MemoryLocation::CpuToGpu
            }
        };
        let allocation = self.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: &desc.label,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.release(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        let mapped_ptr = allocation.mapped_ptr();
        self.buffers.insert(buffer.as_raw(), allocation);

        let mapped = if desc.residency.is_host_visible() {
            let len = usize::try_from(desc.size).ok();
            let (Some(ptr), Some(len)) = (mapped_ptr, len) else {
                self.destroy_buffer(buffer);
                return Err(GpuError::AllocationFailed(format!(
                    "Buffer '{}' is not mappable",
                    desc.label
                )));
            };
            // SAFETY: the mapping stays valid until the allocation is freed
            // together with the buffer.
            Some(unsafe { MappedMemory::new(ptr.cast(), len) })
        } else {
            None
        };

        Ok(NativeBuffer {
            raw: buffer,
            mapped,
        })
    }

    /// Destroy a buffer and free its memory.
    pub fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
        match self.buffers.remove(&buffer.as_raw()) {
            Some(allocation) => self.release(allocation),
            None => error!("Destroyed buffer {buffer:?} without an allocation"),
        }
    }

    /// Create an optimally tiled image with its default view.
    pub fn create_image(&mut self, desc: &ImageDesc) -> Result<NativeImage> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type())
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::from_raw(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage.to_vk())
            .sharing_mode(self.sharing_mode())
            .queue_family_indices(&self.queue_families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: &desc.label,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|()| {
                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(desc.view_type())
                        .format(desc.format)
                        .components(vk::ComponentMapping::default())
                        .subresource_range(
                            vk::ImageSubresourceRange::default()
                                .aspect_mask(aspect_mask(desc.format))
                                .base_mip_level(0)
                                .level_count(desc.mip_levels)
                                .base_array_layer(0)
                                .layer_count(1),
                        );
                    self.device.create_image_view(&view_info, None)
                })
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                self.release(allocation);
                unsafe { self.device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        self.images.insert(image.as_raw(), allocation);
        Ok(NativeImage { raw: image, view })
    }

    /// Destroy an image, its view, and its memory.
    pub fn destroy_image(&mut self, image: NativeImage) {
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.raw, None);
        }
        match self.images.remove(&image.raw.as_raw()) {
            Some(allocation) => self.release(allocation),
            None => error!("Destroyed image {:?} without an allocation", image.raw),
        }
    }

    fn release(&mut self, allocation: Allocation) {
        let freed = self
            .allocator()
            .and_then(|allocator| {
                allocator
                    .free(allocation)
                    .map_err(|e| GpuError::AllocationFailed(e.to_string()))
            });
        if let Err(e) = freed {
            error!("Failed to free allocation: {e}");
        }
    }

    /// Shut the allocator down, freeing all GPU memory.
    ///
    /// Must be called before the Vulkan device is destroyed.
    pub fn shutdown(&mut self) {
        let leaked = self.buffers.len() + self.images.len();
        if leaked > 0 {
            warn!("{leaked} allocations still alive at allocator shutdown");
        }
        self.buffers.clear();
        self.images.clear();
        self.allocator = None;
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
