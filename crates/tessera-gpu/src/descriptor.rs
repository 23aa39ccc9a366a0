//! Descriptor layouts and the content-addressed binding cache.
//!
//! A [`DescriptorBindingSet`] is a logical set: the bindings staged by the
//! application plus a small history of physical descriptor sets realized
//! from earlier snapshots. Realizing hashes the staged bindings; a matching
//! history entry is reused as is, otherwise a new physical set is allocated
//! and written. Physical sets are never rewritten, so a set still read by an
//! in-flight frame is never touched.

use std::hash::{DefaultHasher, Hash, Hasher};

use ash::vk;
use tessera_core::Handle;
use tracing::debug;

use crate::backend::{Backend, DescriptorPoolSizes};
use crate::deferred::RetiredObject;
use crate::error::{GpuError, Result};
use crate::resource::{BufferHandle, ImageHandle, SamplerHandle};
use crate::usage::ImageUsageState;

/// Handle to a descriptor layout owned by a [`Device`](crate::Device).
pub type DescriptorLayoutHandle = Handle<DescriptorLayout>;
/// Handle to a logical descriptor set owned by a [`Device`](crate::Device).
pub type DescriptorSetHandle = Handle<DescriptorBindingSet>;

/// Kind of resource a binding slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    /// Uniform buffer whose offset is supplied at bind time.
    DynamicUniformBuffer,
    StorageBuffer,
    /// Storage buffer whose offset is supplied at bind time.
    DynamicStorageBuffer,
    /// Image paired with a sampler.
    SampledImage,
    StorageImage,
}

impl BindingKind {
    /// Native descriptor type.
    pub const fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::DynamicUniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::DynamicStorageBuffer => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            Self::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    /// Returns `true` for kinds taking a bind-time offset.
    pub const fn is_dynamic(self) -> bool {
        matches!(
            self,
            Self::DynamicUniformBuffer | Self::DynamicStorageBuffer
        )
    }

    /// Returns `true` for buffer kinds.
    pub const fn is_buffer(self) -> bool {
        !self.is_image()
    }

    /// Returns `true` for image kinds.
    pub const fn is_image(self) -> bool {
        matches!(self, Self::SampledImage | Self::StorageImage)
    }

    /// Usage an image must be in while bound through this kind.
    pub const fn image_usage(self) -> Option<ImageUsageState> {
        match self {
            Self::SampledImage => Some(ImageUsageState::ShaderRead),
            Self::StorageImage => Some(ImageUsageState::ShaderReadWrite),
            _ => None,
        }
    }
}

/// One slot of a descriptor layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: vk::ShaderStageFlags,
}

/// Descriptor layout builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorLayoutDesc {
    bindings: Vec<LayoutBinding>,
}

impl DescriptorLayoutDesc {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    #[must_use]
    pub fn binding(mut self, binding: u32, kind: BindingKind, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push(LayoutBinding {
            binding,
            kind,
            stages,
        });
        self
    }

    /// Add a uniform buffer binding.
    #[must_use]
    pub fn uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, BindingKind::UniformBuffer, stages)
    }

    /// Add a dynamic uniform buffer binding.
    #[must_use]
    pub fn dynamic_uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, BindingKind::DynamicUniformBuffer, stages)
    }

    /// Add a storage buffer binding.
    #[must_use]
    pub fn storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, BindingKind::StorageBuffer, stages)
    }

    /// Add a sampled image binding.
    #[must_use]
    pub fn sampled_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, BindingKind::SampledImage, stages)
    }

    /// Add a storage image binding.
    #[must_use]
    pub fn storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, BindingKind::StorageImage, stages)
    }

    /// Bindings sorted by binding number, rejecting duplicates.
    pub fn into_sorted(mut self) -> Result<Vec<LayoutBinding>> {
        self.bindings.sort_by_key(|b| b.binding);
        if let Some(pair) = self
            .bindings
            .windows(2)
            .find(|pair| pair[0].binding == pair[1].binding)
        {
            return Err(GpuError::InvalidBinding(format!(
                "Binding {} declared twice",
                pair[0].binding
            )));
        }
        Ok(self.bindings)
    }
}

/// A descriptor layout owned by the device.
#[derive(Debug)]
pub struct DescriptorLayout {
    pub(crate) bindings: Vec<LayoutBinding>,
    pub(crate) raw: vk::DescriptorSetLayout,
}

impl DescriptorLayout {
    /// Bindings in binding-number order.
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    /// Native layout handle.
    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }
}

/// A resource staged into a binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingResource {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    Image {
        image: ImageHandle,
        sampler: Option<SamplerHandle>,
    },
}

impl BindingResource {
    /// The whole of `buffer`.
    pub const fn buffer(buffer: BufferHandle) -> Self {
        Self::Buffer {
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    /// `range` bytes of `buffer` starting at `offset`.
    pub const fn buffer_range(buffer: BufferHandle, offset: u64, range: u64) -> Self {
        Self::Buffer {
            buffer,
            offset,
            range,
        }
    }

    /// `image` read through `sampler`.
    pub const fn sampled(image: ImageHandle, sampler: SamplerHandle) -> Self {
        Self::Image {
            image,
            sampler: Some(sampler),
        }
    }

    /// `image` as a storage image.
    pub const fn storage_image(image: ImageHandle) -> Self {
        Self::Image {
            image,
            sampler: None,
        }
    }
}

/// A physical descriptor set realized from one snapshot of the bindings.
#[derive(Debug, Clone)]
struct RealizedInstance {
    hash: u64,
    snapshot: Vec<Option<BindingResource>>,
    raw: vk::DescriptorSet,
    pool: vk::DescriptorPool,
    last_used: u64,
}

/// A logical descriptor set and its realized instances.
#[derive(Debug)]
pub struct DescriptorBindingSet {
    layout: DescriptorLayoutHandle,
    bindings: Vec<LayoutBinding>,
    staged: Vec<Option<BindingResource>>,
    dynamic_offsets: Vec<u32>,
    history: Vec<RealizedInstance>,
    tick: u64,
}

impl DescriptorBindingSet {
    pub(crate) fn new(layout: DescriptorLayoutHandle, bindings: Vec<LayoutBinding>) -> Self {
        let dynamic_count = bindings.iter().filter(|b| b.kind.is_dynamic()).count();
        Self {
            layout,
            staged: vec![None; bindings.len()],
            bindings,
            dynamic_offsets: vec![0; dynamic_count],
            history: Vec::new(),
            tick: 0,
        }
    }

    /// Layout this set was created from.
    pub fn layout(&self) -> DescriptorLayoutHandle {
        self.layout
    }

    /// Stage `resource` at `binding`.
    ///
    /// Only checks the resource against the slot kind; handle validity is
    /// checked when the set is realized.
    pub fn bind(&mut self, binding: u32, resource: BindingResource) -> Result<()> {
        let slot = self.slot(binding)?;
        let kind = self.bindings[slot].kind;

        match (kind, resource) {
            (kind, BindingResource::Buffer { range, .. }) if kind.is_buffer() => {
                if kind.is_dynamic() && range == vk::WHOLE_SIZE {
                    return Err(GpuError::InvalidBinding(format!(
                        "Dynamic binding {binding} needs an explicit range"
                    )));
                }
            }
            (BindingKind::SampledImage, BindingResource::Image { sampler: None, .. }) => {
                return Err(GpuError::InvalidBinding(format!(
                    "Sampled image binding {binding} needs a sampler"
                )));
            }
            (kind, BindingResource::Image { .. }) if kind.is_image() => {}
            (kind, _) => {
                return Err(GpuError::InvalidBinding(format!(
                    "Binding {binding} expects {kind:?}"
                )));
            }
        }

        self.staged[slot] = Some(resource);
        Ok(())
    }

    /// Resource staged at `binding`, if any.
    pub fn binding(&self, binding: u32) -> Option<&BindingResource> {
        let slot = self.slot(binding).ok()?;
        self.staged[slot].as_ref()
    }

    /// Kind of the layout slot at `binding`.
    pub fn binding_kind(&self, binding: u32) -> Result<BindingKind> {
        Ok(self.bindings[self.slot(binding)?].kind)
    }

    /// Set the bind-time offset of a dynamic binding.
    ///
    /// Offsets are not part of the content hash; changing one never
    /// realizes a new instance. Alignment and bounds against the bound
    /// buffer are checked by [`Device::set_dynamic_offset`](crate::Device::set_dynamic_offset).
    pub fn set_dynamic_offset(&mut self, binding: u32, offset: u32) -> Result<()> {
        let slot = self.slot(binding)?;
        if !self.bindings[slot].kind.is_dynamic() {
            return Err(GpuError::InvalidBinding(format!(
                "Binding {binding} is not dynamic"
            )));
        }
        let index = self.dynamic_index(slot);
        self.dynamic_offsets[index] = offset;
        Ok(())
    }

    /// Bind-time offset of `binding`; zero for static bindings.
    pub(crate) fn dynamic_offset(&self, binding: u32) -> u64 {
        match self.slot(binding) {
            Ok(slot) if self.bindings[slot].kind.is_dynamic() => {
                u64::from(self.dynamic_offsets[self.dynamic_index(slot)])
            }
            _ => 0,
        }
    }

    /// Offsets of dynamic bindings, in binding order.
    pub fn dynamic_offsets(&self) -> &[u32] {
        &self.dynamic_offsets
    }

    /// Number of physical instances currently kept.
    pub fn instance_count(&self) -> usize {
        self.history.len()
    }

    /// Hash of the layout and every staged binding.
    ///
    /// Fails if a slot has nothing staged.
    pub fn content_hash(&self) -> Result<u64> {
        if let Some(slot) = self.staged.iter().position(Option::is_none) {
            return Err(GpuError::InvalidBinding(format!(
                "Binding {} has nothing bound",
                self.bindings[slot].binding
            )));
        }
        let mut hasher = DefaultHasher::new();
        self.layout.hash(&mut hasher);
        self.staged.hash(&mut hasher);
        Ok(hasher.finish())
    }

    /// Layout slots paired with what is staged in them.
    pub(crate) fn staged(&self) -> impl Iterator<Item = (&LayoutBinding, Option<&BindingResource>)> {
        self.bindings.iter().zip(self.staged.iter().map(Option::as_ref))
    }

    /// Look up the instance realized from the staged bindings, marking it used.
    ///
    /// `hash` only narrows the search; the snapshot itself must match.
    pub(crate) fn find_instance(&mut self, hash: u64) -> Option<vk::DescriptorSet> {
        self.tick += 1;
        let tick = self.tick;
        let staged = &self.staged;
        let instance = self
            .history
            .iter_mut()
            .find(|i| i.hash == hash && i.snapshot == *staged)?;
        instance.last_used = tick;
        Some(instance.raw)
    }

    /// Remember a new instance, evicting the least recently used one beyond `limit`.
    pub(crate) fn record_instance(
        &mut self,
        hash: u64,
        raw: vk::DescriptorSet,
        pool: vk::DescriptorPool,
        limit: usize,
    ) -> Option<RetiredObject> {
        self.tick += 1;
        let evicted = if self.history.len() >= limit {
            self.history
                .iter()
                .enumerate()
                .min_by_key(|(_, instance)| instance.last_used)
                .map(|(index, _)| index)
                .map(|index| self.history.swap_remove(index))
                .map(|instance| RetiredObject::DescriptorSet {
                    pool: instance.pool,
                    set: instance.raw,
                })
        } else {
            None
        };

        self.history.push(RealizedInstance {
            hash,
            snapshot: self.staged.clone(),
            raw,
            pool,
            last_used: self.tick,
        });
        evicted
    }

    /// Forget every realized instance, returning them for retirement.
    pub(crate) fn take_instances(&mut self) -> Vec<RetiredObject> {
        self.history
            .drain(..)
            .map(|instance| RetiredObject::DescriptorSet {
                pool: instance.pool,
                set: instance.raw,
            })
            .collect()
    }

    fn dynamic_index(&self, slot: usize) -> usize {
        self.bindings[..slot]
            .iter()
            .filter(|b| b.kind.is_dynamic())
            .count()
    }

    fn slot(&self, binding: u32) -> Result<usize> {
        self.bindings
            .binary_search_by_key(&binding, |b| b.binding)
            .map_err(|_| GpuError::InvalidBinding(format!("Layout has no binding {binding}")))
    }
}

/// Chain of native descriptor pools.
///
/// Sets come from the newest pool; when it is exhausted another pool with
/// the same sizes is appended.
#[derive(Debug)]
pub struct DescriptorAllocator {
    sizes: DescriptorPoolSizes,
    pools: Vec<vk::DescriptorPool>,
    allocated: usize,
}

impl DescriptorAllocator {
    /// Create an allocator; pools are created on first use.
    pub fn new(sizes: DescriptorPoolSizes) -> Self {
        Self {
            sizes,
            pools: Vec::new(),
            allocated: 0,
        }
    }

    /// Native pools created so far.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Sets allocated over the allocator's lifetime.
    pub fn allocated_count(&self) -> usize {
        self.allocated
    }

    /// Allocate one set for `layout`.
    pub fn allocate<B: Backend>(
        &mut self,
        backend: &mut B,
        layout: vk::DescriptorSetLayout,
    ) -> Result<(vk::DescriptorSet, vk::DescriptorPool)> {
        if let Some(&pool) = self.pools.last() {
            if let Some(set) = backend.allocate_descriptor_set(pool, layout)? {
                self.allocated += 1;
                return Ok((set, pool));
            }
        }

        let pool = backend.create_descriptor_pool(&self.sizes)?;
        self.pools.push(pool);
        debug!("Created descriptor pool #{}", self.pools.len());

        let set = backend
            .allocate_descriptor_set(pool, layout)?
            .ok_or_else(|| {
                GpuError::AllocationFailed(
                    "Descriptor set does not fit in an empty pool".to_string(),
                )
            })?;
        self.allocated += 1;
        Ok((set, pool))
    }

    /// Destroy every pool. All sets allocated from them become invalid.
    pub fn destroy<B: Backend>(&mut self, backend: &mut B) {
        for pool in self.pools.drain(..) {
            backend.destroy_descriptor_pool(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle as _;
    use tessera_core::Pool;

    fn layout() -> (DescriptorLayoutHandle, Vec<LayoutBinding>) {
        let bindings = DescriptorLayoutDesc::new()
            .sampled_image(2, vk::ShaderStageFlags::FRAGMENT)
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .dynamic_uniform_buffer(1, vk::ShaderStageFlags::VERTEX)
            .into_sorted()
            .unwrap();
        let mut layouts = Pool::<()>::new();
        (layouts.insert(()).cast(), bindings)
    }

    fn handles<T>(count: usize) -> Vec<Handle<T>> {
        let mut pool = Pool::<()>::new();
        (0..count).map(|_| pool.insert(()).cast()).collect()
    }

    fn filled_set() -> DescriptorBindingSet {
        let (layout, bindings) = layout();
        let buffers = handles(2);
        let images = handles(1);
        let samplers = handles(1);

        let mut set = DescriptorBindingSet::new(layout, bindings);
        set.bind(0, BindingResource::buffer(buffers[0])).unwrap();
        set.bind(1, BindingResource::buffer_range(buffers[1], 0, 64))
            .unwrap();
        set.bind(2, BindingResource::sampled(images[0], samplers[0]))
            .unwrap();
        set
    }

    #[test]
    fn layout_rejects_duplicates() {
        let result = DescriptorLayoutDesc::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .into_sorted();
        assert!(matches!(result, Err(GpuError::InvalidBinding(_))));
    }

    #[test]
    fn bind_checks_kind() {
        let (layout, bindings) = layout();
        let images: Vec<ImageHandle> = handles(1);
        let buffers: Vec<BufferHandle> = handles(1);
        let mut set = DescriptorBindingSet::new(layout, bindings);

        assert!(set.bind(0, BindingResource::storage_image(images[0])).is_err());
        assert!(set.bind(2, BindingResource::buffer(buffers[0])).is_err());
        assert!(set.bind(2, BindingResource::storage_image(images[0])).is_err());
        assert!(set.bind(1, BindingResource::buffer(buffers[0])).is_err());
        assert!(set.bind(7, BindingResource::buffer(buffers[0])).is_err());
        assert!(set.bind(0, BindingResource::buffer(buffers[0])).is_ok());
    }

    #[test]
    fn hash_requires_every_binding() {
        let (layout, bindings) = layout();
        let set = DescriptorBindingSet::new(layout, bindings);
        assert!(set.content_hash().is_err());
        assert!(filled_set().content_hash().is_ok());
    }

    #[test]
    fn hash_follows_content_not_offsets() {
        let mut set = filled_set();
        let before = set.content_hash().unwrap();

        set.set_dynamic_offset(1, 256).unwrap();
        assert_eq!(set.dynamic_offsets(), &[256]);
        assert_eq!(set.content_hash().unwrap(), before);

        let other: Vec<BufferHandle> = handles(3);
        set.bind(0, BindingResource::buffer(other[2])).unwrap();
        assert_ne!(set.content_hash().unwrap(), before);
    }

    #[test]
    fn offsets_only_on_dynamic_bindings() {
        let mut set = filled_set();
        assert!(set.set_dynamic_offset(0, 16).is_err());
    }

    #[test]
    fn history_evicts_least_recently_used() {
        let mut set = filled_set();
        let pool = vk::DescriptorPool::from_raw(1);
        let raw = |n| vk::DescriptorSet::from_raw(n);

        assert!(set.record_instance(10, raw(10), pool, 2).is_none());
        assert!(set.record_instance(20, raw(20), pool, 2).is_none());
        // Touch 10 so 20 becomes the eviction candidate.
        assert_eq!(set.find_instance(10), Some(raw(10)));

        let evicted = set.record_instance(30, raw(30), pool, 2);
        assert_eq!(
            evicted,
            Some(RetiredObject::DescriptorSet {
                pool,
                set: raw(20)
            })
        );
        assert_eq!(set.instance_count(), 2);
        assert!(set.find_instance(20).is_none());
        assert_eq!(set.take_instances().len(), 2);
        assert_eq!(set.instance_count(), 0);
    }

    #[test]
    fn colliding_hash_with_other_bindings_is_a_miss() {
        let mut set = filled_set();
        let hash = set.content_hash().unwrap();
        let pool = vk::DescriptorPool::from_raw(1);
        let raw = vk::DescriptorSet::from_raw(5);
        assert!(set.record_instance(hash, raw, pool, 4).is_none());
        assert_eq!(set.find_instance(hash), Some(raw));

        let other: Vec<BufferHandle> = handles(3);
        set.bind(0, BindingResource::buffer(other[2])).unwrap();
        assert!(set.find_instance(hash).is_none());
    }
}
