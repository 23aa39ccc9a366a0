//! Descriptor set layouts, pools and writes.

use ash::vk;

use crate::backend::{DescriptorPoolSizes, DescriptorResource, DescriptorWrite};
use crate::descriptor::LayoutBinding;
use crate::error::Result;

/// Create a descriptor set layout.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_set_layout(
    device: &ash::Device,
    bindings: &[LayoutBinding],
) -> Result<vk::DescriptorSetLayout> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
        .iter()
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding.binding)
                .descriptor_type(binding.kind.to_vk())
                .descriptor_count(1)
                .stage_flags(binding.stages)
        })
        .collect();

    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    Ok(device.create_descriptor_set_layout(&create_info, None)?)
}

/// Create a pool whose sets can be freed individually.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_pool(
    device: &ash::Device,
    sizes: &DescriptorPoolSizes,
) -> Result<vk::DescriptorPool> {
    let pool_sizes = sizes.pool_sizes();
    let create_info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(sizes.max_sets)
        .pool_sizes(&pool_sizes);

    Ok(device.create_descriptor_pool(&create_info, None)?)
}

/// Allocate one set. Returns `Ok(None)` when the pool is exhausted.
///
/// # Safety
/// The device, pool and layout must be valid.
pub unsafe fn allocate_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> Result<Option<vk::DescriptorSet>> {
    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    match device.allocate_descriptor_sets(&alloc_info) {
        Ok(sets) => Ok(sets.first().copied()),
        Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Apply `writes` to `set`.
///
/// # Safety
/// The device, set and every referenced resource must be valid.
pub unsafe fn write_set(device: &ash::Device, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
    // Info structs must outlive the write array that points into them
    let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = writes
        .iter()
        .map(|write| match write.resource {
            DescriptorResource::Buffer {
                buffer,
                offset,
                range,
            } => [vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            }],
            DescriptorResource::Image { .. } => [vk::DescriptorBufferInfo::default()],
        })
        .collect();
    let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = writes
        .iter()
        .map(|write| match write.resource {
            DescriptorResource::Image {
                view,
                layout,
                sampler,
            } => [vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            }],
            DescriptorResource::Buffer { .. } => [vk::DescriptorImageInfo::default()],
        })
        .collect();

    let vk_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .enumerate()
        .map(|(index, write)| {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(write.binding)
                .dst_array_element(0)
                .descriptor_type(write.kind.to_vk());
            match write.resource {
                DescriptorResource::Buffer { .. } => base.buffer_info(&buffer_infos[index]),
                DescriptorResource::Image { .. } => base.image_info(&image_infos[index]),
            }
        })
        .collect();

    device.update_descriptor_sets(&vk_writes, &[]);
}
