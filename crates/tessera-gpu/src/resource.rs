//! Plain-data descriptions of GPU resources and the records the device keeps for them.

use std::ffi::CString;
use std::io::Cursor;
use std::ptr::NonNull;

use ash::vk;
use bitflags::bitflags;
use tessera_core::Handle;

use crate::error::{GpuError, Result};
use crate::usage::ImageUsageState;

/// Handle to a buffer owned by a [`Device`](crate::Device).
pub type BufferHandle = Handle<BufferResource>;
/// Handle to an image owned by a [`Device`](crate::Device).
pub type ImageHandle = Handle<ImageResource>;
/// Handle to a sampler owned by a [`Device`](crate::Device).
pub type SamplerHandle = Handle<SamplerResource>;
/// Handle to a shader module owned by a [`Device`](crate::Device).
pub type ShaderHandle = Handle<ShaderResource>;

bitflags! {
    /// How a buffer may be used by the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
        const INDIRECT = 1 << 6;
    }
}

impl BufferUsage {
    /// Convert to Vulkan usage flags.
    #[must_use]
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.contains(Self::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::UNIFORM) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(Self::TRANSFER_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::TRANSFER_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.contains(Self::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        flags
    }
}

/// Where buffer memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryResidency {
    /// Fastest for the GPU, not CPU-visible.
    #[default]
    DeviceLocal,
    /// CPU-visible, writes need explicit flushes on non-coherent heaps.
    HostVisible,
    /// CPU-visible and coherent, persistently mapped.
    HostVisibleCoherent,
}

impl MemoryResidency {
    /// Returns `true` if the CPU can map this memory.
    #[must_use]
    pub const fn is_host_visible(self) -> bool {
        matches!(self, Self::HostVisible | Self::HostVisibleCoherent)
    }
}

/// Buffer creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub residency: MemoryResidency,
    pub label: String,
}

impl BufferDesc {
    /// Create a description with an empty label.
    pub fn new(size: u64, usage: BufferUsage, residency: MemoryResidency) -> Self {
        Self {
            size,
            usage,
            residency,
            label: String::new(),
        }
    }

    /// Host-visible buffer used as the source of a staging upload.
    pub fn staging(size: u64) -> Self {
        Self::new(
            size,
            BufferUsage::TRANSFER_SRC,
            MemoryResidency::HostVisibleCoherent,
        )
        .with_label("staging")
    }

    /// Set the debug label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// A persistently mapped CPU view of buffer memory.
///
/// The mapping stays valid until the owning buffer is destroyed; the device
/// only hands it out through the buffer record.
#[derive(Debug)]
pub struct MappedMemory {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedMemory {
    /// Wrap a mapped pointer.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// this value exists.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Mapped size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for an empty mapping.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copy `data` into the mapping at `offset`.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let start = self.checked_range(offset, data.len())?;
        // SAFETY: the range was bounds-checked against the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(start), data.len());
        }
        Ok(())
    }

    /// Copy typed data into the mapping at `offset`.
    pub fn write<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Copy bytes out of the mapping at `offset` into `out`.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let start = self.checked_range(offset, out.len())?;
        // SAFETY: the range was bounds-checked against the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(start), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn checked_range(&self, offset: u64, len: usize) -> Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| GpuError::InvalidState("Offset overflow".to_string()))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.len {
            return Err(GpuError::InvalidState(format!(
                "Range {start}..{end} exceeds mapped size {}",
                self.len
            )));
        }
        Ok(start)
    }
}

/// A buffer owned by the device.
#[derive(Debug)]
pub struct BufferResource {
    pub(crate) desc: BufferDesc,
    pub(crate) raw: vk::Buffer,
    pub(crate) mapped: Option<MappedMemory>,
}

impl BufferResource {
    /// Creation parameters.
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    /// Native buffer handle.
    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    /// Persistent mapping, present for host-visible buffers.
    pub fn mapped(&self) -> Option<&MappedMemory> {
        self.mapped.as_ref()
    }
}

bitflags! {
    /// How an image may be used by the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_TARGET = 1 << 2;
        const DEPTH_TARGET = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

impl ImageUsage {
    /// Convert to Vulkan usage flags.
    #[must_use]
    pub fn to_vk(self) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::empty();
        if self.contains(Self::SAMPLED) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        if self.contains(Self::COLOR_TARGET) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if self.contains(Self::DEPTH_TARGET) {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if self.contains(Self::TRANSFER_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::TRANSFER_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        flags
    }
}

/// Image creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub format: vk::Format,
    pub samples: u32,
    pub usage: ImageUsage,
    pub label: String,
}

impl ImageDesc {
    /// Single-sampled 2D image with one mip level.
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: ImageUsage) -> Self {
        Self {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            format,
            samples: 1,
            usage,
            label: String::new(),
        }
    }

    /// Set the number of mip levels.
    #[must_use]
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Set the sample count.
    #[must_use]
    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    /// Set the debug label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Vulkan image type implied by the extent.
    pub fn image_type(&self) -> vk::ImageType {
        if self.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        }
    }

    /// Vulkan view type for the default full-extent view.
    pub fn view_type(&self) -> vk::ImageViewType {
        if self.extent.depth > 1 {
            vk::ImageViewType::TYPE_3D
        } else {
            vk::ImageViewType::TYPE_2D
        }
    }

    /// Byte size of mip level 0, if the format's texel size is known.
    pub fn base_level_size(&self) -> Option<u64> {
        let texel = u64::from(texel_block_size(self.format)?);
        Some(
            u64::from(self.extent.width)
                * u64::from(self.extent.height)
                * u64::from(self.extent.depth)
                * texel,
        )
    }
}

/// Returns `true` for formats with a depth aspect.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Returns `true` for formats with a stencil aspect.
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspect flags covering every aspect of `format`.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match (is_depth_format(format), has_stencil(format)) {
        (true, true) => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        (true, false) => vk::ImageAspectFlags::DEPTH,
        (false, true) => vk::ImageAspectFlags::STENCIL,
        (false, false) => vk::ImageAspectFlags::COLOR,
    }
}

/// Size in bytes of one texel of an uncompressed format.
pub fn texel_block_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::R8_SRGB | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::D32_SFLOAT
        | vk::Format::X8_D24_UNORM_PACK32
        | vk::Format::D24_UNORM_S8_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT | vk::Format::D32_SFLOAT_S8_UINT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

/// An image owned by, or registered with, the device.
#[derive(Debug)]
pub struct ImageResource {
    pub(crate) desc: ImageDesc,
    pub(crate) raw: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) usage: ImageUsageState,
    /// Presentable images belong to the surface, not the device allocator.
    pub(crate) external: bool,
}

impl ImageResource {
    /// Creation parameters.
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Native image handle.
    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    /// Default full-extent view.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Usage state recorded by the last barrier.
    pub fn usage(&self) -> ImageUsageState {
        self.usage
    }

    /// Returns `true` for images owned by the presentation surface.
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Subresource range covering every mip level and aspect.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_mask(self.desc.format))
            .base_mip_level(0)
            .level_count(self.desc.mip_levels)
            .base_array_layer(0)
            .layer_count(1)
    }
}

/// Sampler creation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
        }
    }
}

impl SamplerDesc {
    /// Point sampling with clamped addressing.
    pub fn nearest_clamped() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_anisotropy: None,
        }
    }
}

/// A sampler owned by the device.
#[derive(Debug)]
pub struct SamplerResource {
    pub(crate) desc: SamplerDesc,
    pub(crate) raw: vk::Sampler,
}

impl SamplerResource {
    /// Creation parameters.
    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }

    /// Native sampler handle.
    pub fn raw(&self) -> vk::Sampler {
        self.raw
    }
}

/// Programmable pipeline stage a shader runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Convert to Vulkan stage flags.
    pub const fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Shader creation parameters. `code` is SPIR-V.
#[derive(Debug, Clone, Copy)]
pub struct ShaderDesc<'a> {
    pub stage: ShaderStage,
    pub code: &'a [u32],
    pub entry_point: &'a str,
}

impl<'a> ShaderDesc<'a> {
    /// Shader with a `main` entry point.
    pub fn new(stage: ShaderStage, code: &'a [u32]) -> Self {
        Self {
            stage,
            code,
            entry_point: "main",
        }
    }
}

/// Reinterpret a SPIR-V byte blob as words, checking size and magic number.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    const SPIRV_MAGIC: u32 = 0x0723_0203;

    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| GpuError::ShaderCreation(format!("Invalid SPIR-V: {e}")))?;
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(GpuError::ShaderCreation(
            "Invalid SPIR-V: missing magic number".to_string(),
        ));
    }
    Ok(words)
}

/// A shader module owned by the device.
#[derive(Debug)]
pub struct ShaderResource {
    pub(crate) stage: ShaderStage,
    pub(crate) raw: vk::ShaderModule,
    pub(crate) entry_point: CString,
}

impl ShaderResource {
    /// Stage this module was created for.
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Native module handle.
    pub fn raw(&self) -> vk::ShaderModule {
        self.raw
    }

    /// Entry point name.
    pub fn entry_point(&self) -> &std::ffi::CStr {
        &self.entry_point
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_get_depth_aspect() {
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_mask(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn base_level_size_uses_texel_size() {
        let desc = ImageDesc::new_2d(4, 2, vk::Format::R8G8B8A8_UNORM, ImageUsage::SAMPLED);
        assert_eq!(desc.base_level_size(), Some(32));

        let unknown = ImageDesc::new_2d(4, 4, vk::Format::BC1_RGB_UNORM_BLOCK, ImageUsage::SAMPLED);
        assert_eq!(unknown.base_level_size(), None);
    }

    #[test]
    fn buffer_usage_maps_to_vk() {
        let usage = BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST;
        assert_eq!(
            usage.to_vk(),
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
    }

    #[test]
    fn mapped_memory_bounds_checked() {
        let mut backing = vec![0u8; 16];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        // SAFETY: `backing` outlives `mapped`.
        let mapped = unsafe { MappedMemory::new(ptr, backing.len()) };

        mapped.write::<u32>(4, &[0xAABB_CCDD]).unwrap();
        assert!(mapped.write_bytes(12, &[0; 8]).is_err());
        assert!(mapped.write_bytes(u64::MAX, &[0]).is_err());

        let mut out = [0u8; 4];
        mapped.read_bytes(4, &mut out).unwrap();
        assert_eq!(u32::from_ne_bytes(out), 0xAABB_CCDD);
        drop(mapped);
        assert_eq!(backing[4..8], 0xAABB_CCDDu32.to_ne_bytes());
    }

    #[test]
    fn spirv_rejects_bad_magic() {
        assert!(spirv_words(&[0u8; 8]).is_err());
        let words = spirv_words(&0x0723_0203u32.to_le_bytes()).unwrap();
        assert_eq!(words, vec![0x0723_0203]);
    }
}
