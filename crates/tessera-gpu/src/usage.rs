//! Resource usage states and the barriers derived from them.
//!
//! Every usage maps to a fixed `(stage, access, layout)` triple in two roles:
//! as the *source* of a transition only writes need to be made available, as
//! the *destination* every access the new usage performs must be covered.
//! A barrier is the source triple of the old usage joined with the
//! destination triple of the new one. Nothing is elided: asking for the
//! usage an image already has still produces a full barrier.

use ash::vk;

use crate::error::{GpuError, Result};

const SHADER_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
);

const FRAGMENT_TESTS: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
);

/// The role an image currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageUsageState {
    /// Contents are undefined; the initial state of every image.
    #[default]
    Undefined,
    /// Any access, general layout.
    General,
    /// Sampled by shaders.
    ShaderRead,
    /// Read and written as a storage image.
    ShaderReadWrite,
    /// Source of a copy or blit.
    TransferSrc,
    /// Destination of a copy, blit, or clear.
    TransferDst,
    /// Bound as a color attachment.
    ColorTarget,
    /// Bound as a writable depth attachment.
    DepthTarget,
    /// Read-only depth, both as attachment and sampled.
    DepthRead,
    /// Handed to the presentation engine.
    Present,
}

/// One side of a transition: what must be waited on or made visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsageScope {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl UsageScope {
    const fn new(
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> Self {
        Self {
            stage,
            access,
            layout,
        }
    }
}

impl ImageUsageState {
    /// All states, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Undefined,
        Self::General,
        Self::ShaderRead,
        Self::ShaderReadWrite,
        Self::TransferSrc,
        Self::TransferDst,
        Self::ColorTarget,
        Self::DepthTarget,
        Self::DepthRead,
        Self::Present,
    ];

    /// Image layout this usage requires.
    pub const fn layout(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::General | Self::ShaderReadWrite => vk::ImageLayout::GENERAL,
            Self::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::ColorTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthTarget => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::DepthRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            Self::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Scope used when this usage is the state being left.
    ///
    /// Reads never need to be made available, so only write accesses appear,
    /// but the stages still cover every reader to order later writes after them.
    pub const fn source_scope(self) -> UsageScope {
        let layout = self.layout();
        match self {
            // Chains with the acquire semaphore wait regardless of its stage.
            Self::Undefined | Self::Present => UsageScope::new(
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::NONE,
                layout,
            ),
            Self::General => UsageScope::new(
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_WRITE,
                layout,
            ),
            Self::ShaderRead => UsageScope::new(SHADER_STAGES, vk::AccessFlags2::NONE, layout),
            Self::ShaderReadWrite => {
                UsageScope::new(SHADER_STAGES, vk::AccessFlags2::SHADER_STORAGE_WRITE, layout)
            }
            Self::TransferSrc => UsageScope::new(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::NONE,
                layout,
            ),
            Self::TransferDst => UsageScope::new(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                layout,
            ),
            Self::ColorTarget => UsageScope::new(
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                layout,
            ),
            Self::DepthTarget => UsageScope::new(
                FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                layout,
            ),
            Self::DepthRead => UsageScope::new(
                vk::PipelineStageFlags2::from_raw(
                    FRAGMENT_TESTS.as_raw() | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw(),
                ),
                vk::AccessFlags2::NONE,
                layout,
            ),
        }
    }

    /// Scope used when this usage is the state being entered.
    ///
    /// Returns `None` for usages that cannot be transitioned into.
    pub const fn destination_scope(self) -> Option<UsageScope> {
        let layout = self.layout();
        let scope = match self {
            Self::Undefined => return None,
            Self::General => UsageScope::new(
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
                ),
                layout,
            ),
            Self::ShaderRead => {
                UsageScope::new(SHADER_STAGES, vk::AccessFlags2::SHADER_SAMPLED_READ, layout)
            }
            Self::ShaderReadWrite => UsageScope::new(
                SHADER_STAGES,
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
                        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
                ),
                layout,
            ),
            Self::TransferSrc => UsageScope::new(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
                layout,
            ),
            Self::TransferDst => UsageScope::new(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                layout,
            ),
            Self::ColorTarget => UsageScope::new(
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
                        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
                ),
                layout,
            ),
            Self::DepthTarget => UsageScope::new(
                FRAGMENT_TESTS,
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
                ),
                layout,
            ),
            Self::DepthRead => UsageScope::new(
                vk::PipelineStageFlags2::from_raw(
                    FRAGMENT_TESTS.as_raw() | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw(),
                ),
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                        | vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw(),
                ),
                layout,
            ),
            Self::Present => UsageScope::new(
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
                layout,
            ),
        };
        Some(scope)
    }

    /// Returns `true` if this usage writes the image.
    pub fn is_write(self) -> bool {
        !self.source_scope().access.is_empty()
    }

    const fn is_depth_only(self) -> bool {
        matches!(self, Self::DepthTarget | Self::DepthRead)
    }

    const fn is_color_only(self) -> bool {
        matches!(self, Self::ColorTarget | Self::Present)
    }
}

/// A synchronization point between two usages of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageBarrier {
    /// Stages that must finish before the barrier.
    pub wait_stage: vk::PipelineStageFlags2,
    /// Stages held back until the barrier completes.
    pub signal_stage: vk::PipelineStageFlags2,
    pub access_before: vk::AccessFlags2,
    pub access_after: vk::AccessFlags2,
    pub layout_before: vk::ImageLayout,
    pub layout_after: vk::ImageLayout,
}

impl ImageBarrier {
    /// Build the native barrier for `image` over `range`.
    pub fn to_vk(
        &self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
    ) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.wait_stage)
            .src_access_mask(self.access_before)
            .dst_stage_mask(self.signal_stage)
            .dst_access_mask(self.access_after)
            .old_layout(self.layout_before)
            .new_layout(self.layout_after)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
    }
}

/// Derive the barrier that moves an image from `current` to `requested` usage.
///
/// Fails with [`GpuError::UnsupportedTransition`] when no image could
/// legitimately make the transition (entering `Undefined`, or switching
/// between depth-only and color-only roles). That is a design error in the
/// caller, not a runtime condition.
pub fn derive_barrier(
    current: ImageUsageState,
    requested: ImageUsageState,
) -> Result<ImageBarrier> {
    let unsupported = || GpuError::UnsupportedTransition {
        from: current,
        to: requested,
    };

    if (current.is_depth_only() && requested.is_color_only())
        || (current.is_color_only() && requested.is_depth_only())
    {
        return Err(unsupported());
    }

    let src = current.source_scope();
    let dst = requested.destination_scope().ok_or_else(unsupported)?;

    Ok(ImageBarrier {
        wait_stage: src.stage,
        signal_stage: dst.stage,
        access_before: src.access,
        access_after: dst.access,
        layout_before: src.layout,
        layout_after: dst.layout,
    })
}

/// How a buffer range is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferAccess {
    /// Not yet used by the GPU.
    None,
    /// Written by the CPU through a mapping.
    HostWrite,
    TransferRead,
    TransferWrite,
    UniformRead,
    StorageRead,
    StorageReadWrite,
    VertexRead,
    IndexRead,
    IndirectRead,
}

impl BufferAccess {
    /// Stage and access flags of this usage; `write_only` keeps just the writes.
    pub const fn scope(self, write_only: bool) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        let (stage, read, write) = match self {
            Self::None => (
                vk::PipelineStageFlags2::NONE,
                vk::AccessFlags2::NONE,
                vk::AccessFlags2::NONE,
            ),
            Self::HostWrite => (
                vk::PipelineStageFlags2::HOST,
                vk::AccessFlags2::NONE,
                vk::AccessFlags2::HOST_WRITE,
            ),
            Self::TransferRead => (
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
                vk::AccessFlags2::NONE,
            ),
            Self::TransferWrite => (
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::NONE,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
            Self::UniformRead => (
                SHADER_STAGES,
                vk::AccessFlags2::UNIFORM_READ,
                vk::AccessFlags2::NONE,
            ),
            Self::StorageRead => (
                SHADER_STAGES,
                vk::AccessFlags2::SHADER_STORAGE_READ,
                vk::AccessFlags2::NONE,
            ),
            Self::StorageReadWrite => (
                SHADER_STAGES,
                vk::AccessFlags2::SHADER_STORAGE_READ,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
            Self::VertexRead => (
                vk::PipelineStageFlags2::VERTEX_INPUT,
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
                vk::AccessFlags2::NONE,
            ),
            Self::IndexRead => (
                vk::PipelineStageFlags2::INDEX_INPUT,
                vk::AccessFlags2::INDEX_READ,
                vk::AccessFlags2::NONE,
            ),
            Self::IndirectRead => (
                vk::PipelineStageFlags2::DRAW_INDIRECT,
                vk::AccessFlags2::INDIRECT_COMMAND_READ,
                vk::AccessFlags2::NONE,
            ),
        };
        if write_only {
            (stage, write)
        } else {
            (stage, vk::AccessFlags2::from_raw(read.as_raw() | write.as_raw()))
        }
    }
}

/// A memory dependency between two accesses of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBarrier {
    pub wait_stage: vk::PipelineStageFlags2,
    pub signal_stage: vk::PipelineStageFlags2,
    pub access_before: vk::AccessFlags2,
    pub access_after: vk::AccessFlags2,
}

impl BufferBarrier {
    /// Build the native barrier for the whole of `buffer`.
    pub fn to_vk(&self, buffer: vk::Buffer) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(self.wait_stage)
            .src_access_mask(self.access_before)
            .dst_stage_mask(self.signal_stage)
            .dst_access_mask(self.access_after)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }
}

/// Derive the barrier ordering `after` behind `before` on the same buffer.
pub fn derive_buffer_barrier(before: BufferAccess, after: BufferAccess) -> BufferBarrier {
    let (wait_stage, access_before) = before.scope(true);
    let (signal_stage, access_after) = after.scope(false);
    BufferBarrier {
        wait_stage,
        signal_stage,
        access_before,
        access_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_chain_layouts_match() {
        let first = derive_barrier(ImageUsageState::Undefined, ImageUsageState::TransferDst).unwrap();
        let second =
            derive_barrier(ImageUsageState::TransferDst, ImageUsageState::ShaderRead).unwrap();

        assert_eq!(first.layout_before, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.layout_after, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(first.layout_after, second.layout_before);
        assert_eq!(second.layout_after, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(second.access_before, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(second.wait_stage, vk::PipelineStageFlags2::TRANSFER);
        assert!(second.access_after.contains(vk::AccessFlags2::SHADER_SAMPLED_READ));
    }

    #[test]
    fn same_usage_still_emits_full_barrier() {
        for usage in ImageUsageState::ALL {
            if usage == ImageUsageState::Undefined {
                continue;
            }
            let barrier = derive_barrier(usage, usage).unwrap();
            let src = usage.source_scope();
            let dst = usage.destination_scope().unwrap();

            assert_eq!(barrier.layout_before, barrier.layout_after, "{usage:?}");
            assert!(!barrier.wait_stage.is_empty(), "{usage:?}");
            assert!(!barrier.signal_stage.is_empty(), "{usage:?}");
            assert_eq!(barrier.access_before, src.access, "{usage:?}");
            assert_eq!(barrier.access_after, dst.access, "{usage:?}");
            // Writes performed in this usage are flushed before the repeat.
            if usage.is_write() {
                assert!(!barrier.access_before.is_empty(), "{usage:?}");
            }
        }
    }

    #[test]
    fn source_access_only_holds_writes() {
        assert!(ImageUsageState::ShaderRead.source_scope().access.is_empty());
        assert!(ImageUsageState::TransferSrc.source_scope().access.is_empty());
        assert_eq!(
            ImageUsageState::ColorTarget.source_scope().access,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn entering_undefined_is_unsupported() {
        let err = derive_barrier(ImageUsageState::ShaderRead, ImageUsageState::Undefined);
        assert!(matches!(
            err,
            Err(GpuError::UnsupportedTransition {
                from: ImageUsageState::ShaderRead,
                to: ImageUsageState::Undefined,
            })
        ));
    }

    #[test]
    fn depth_and_color_roles_do_not_mix() {
        assert!(derive_barrier(ImageUsageState::DepthTarget, ImageUsageState::Present).is_err());
        assert!(derive_barrier(ImageUsageState::ColorTarget, ImageUsageState::DepthRead).is_err());
        assert!(derive_barrier(ImageUsageState::DepthTarget, ImageUsageState::DepthRead).is_ok());
        assert!(derive_barrier(ImageUsageState::ColorTarget, ImageUsageState::Present).is_ok());
    }

    #[test]
    fn present_barrier_targets_present_layout() {
        let barrier =
            derive_barrier(ImageUsageState::ColorTarget, ImageUsageState::Present).unwrap();
        assert_eq!(barrier.layout_after, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(barrier.access_after, vk::AccessFlags2::NONE);
        assert_eq!(
            barrier.wait_stage,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
    }

    #[test]
    fn buffer_upload_barrier() {
        let barrier = derive_buffer_barrier(BufferAccess::TransferWrite, BufferAccess::UniformRead);
        assert_eq!(barrier.wait_stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(barrier.access_before, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barrier.access_after, vk::AccessFlags2::UNIFORM_READ);

        let read_after_read = derive_buffer_barrier(BufferAccess::VertexRead, BufferAccess::TransferWrite);
        assert!(read_after_read.access_before.is_empty());
        assert_eq!(read_after_read.wait_stage, vk::PipelineStageFlags2::VERTEX_INPUT);
    }
}
