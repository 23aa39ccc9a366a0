//! Pipeline programs, render state, and render targets.
//!
//! A [`PipelineProgram`] is pipeline-layout-equivalent across every variant
//! it compiles. Variants are keyed by the packed [`RenderState`] together
//! with the [`TargetLayout`] they render into and are kept in a short list
//! scanned linearly. A [`RenderTarget`] memoizes one render pass per exact
//! sequence of attachment load operations.

use ash::vk;
use tessera_core::Handle;

use crate::backend::{AttachmentRequest, RenderPassRequest};
use crate::deferred::RetiredObject;
use crate::descriptor::DescriptorLayoutHandle;
use crate::resource::{ImageHandle, ShaderHandle};

/// Handle to a pipeline program owned by a [`Device`](crate::Device).
pub type PipelineProgramHandle = Handle<PipelineProgram>;
/// Handle to a render target owned by a [`Device`](crate::Device).
pub type RenderTargetHandle = Handle<RenderTarget>;

/// Primitive topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Topology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    LineStrip,
    PointList,
}

impl Topology {
    const ALL: [Self; 5] = [
        Self::TriangleList,
        Self::TriangleStrip,
        Self::LineList,
        Self::LineStrip,
        Self::PointList,
    ];

    pub const fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            Self::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Self::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Self::LineList => vk::PrimitiveTopology::LINE_LIST,
            Self::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            Self::PointList => vk::PrimitiveTopology::POINT_LIST,
        }
    }
}

/// Polygon fill mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillMode {
    #[default]
    Fill,
    Line,
    Point,
}

impl FillMode {
    const ALL: [Self; 3] = [Self::Fill, Self::Line, Self::Point];

    pub const fn to_vk(self) -> vk::PolygonMode {
        match self {
            Self::Fill => vk::PolygonMode::FILL,
            Self::Line => vk::PolygonMode::LINE,
            Self::Point => vk::PolygonMode::POINT,
        }
    }
}

/// Face culling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
    FrontAndBack,
}

impl CullMode {
    const ALL: [Self; 4] = [Self::None, Self::Front, Self::Back, Self::FrontAndBack];

    pub const fn to_vk(self) -> vk::CullModeFlags {
        match self {
            Self::None => vk::CullModeFlags::NONE,
            Self::Front => vk::CullModeFlags::FRONT,
            Self::Back => vk::CullModeFlags::BACK,
            Self::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

/// Winding of front-facing triangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

impl FrontFace {
    pub const fn to_vk(self) -> vk::FrontFace {
        match self {
            Self::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
            Self::Clockwise => vk::FrontFace::CLOCKWISE,
        }
    }
}

/// Depth comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    const ALL: [Self; 8] = [
        Self::Never,
        Self::Less,
        Self::Equal,
        Self::LessOrEqual,
        Self::Greater,
        Self::NotEqual,
        Self::GreaterOrEqual,
        Self::Always,
    ];

    pub const fn to_vk(self) -> vk::CompareOp {
        match self {
            Self::Never => vk::CompareOp::NEVER,
            Self::Less => vk::CompareOp::LESS,
            Self::Equal => vk::CompareOp::EQUAL,
            Self::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            Self::Greater => vk::CompareOp::GREATER,
            Self::NotEqual => vk::CompareOp::NOT_EQUAL,
            Self::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            Self::Always => vk::CompareOp::ALWAYS,
        }
    }
}

/// Color blending preset applied to every color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// `src * a + dst * (1 - a)`
    Alpha,
    /// `src + dst`
    Additive,
    /// `src + dst * (1 - a)`
    Premultiplied,
}

impl BlendMode {
    const ALL: [Self; 4] = [
        Self::Opaque,
        Self::Alpha,
        Self::Additive,
        Self::Premultiplied,
    ];

    /// Blend state of one color attachment.
    pub fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let (src, dst) = match self {
            Self::Opaque => return state.blend_enable(false),
            Self::Alpha => (
                vk::BlendFactor::SRC_ALPHA,
                vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            ),
            Self::Additive => (vk::BlendFactor::ONE, vk::BlendFactor::ONE),
            Self::Premultiplied => (vk::BlendFactor::ONE, vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
        };
        state
            .blend_enable(true)
            .src_color_blend_factor(src)
            .dst_color_blend_factor(dst)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
    }
}

/// Fixed-function state that distinguishes pipeline variants.
///
/// Packs losslessly into 32 bits:
///
/// | bits  | field       |
/// |-------|-------------|
/// | 0-2   | topology    |
/// | 3-4   | fill mode   |
/// | 5-6   | cull mode   |
/// | 7     | front face  |
/// | 8     | depth test  |
/// | 9     | depth write |
/// | 10-12 | depth compare |
/// | 13-15 | blend       |
/// | 16-23 | line width  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub topology: Topology,
    pub fill: FillMode,
    pub cull: CullMode,
    pub front_face: FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareOp,
    pub blend: BlendMode,
    /// Rasterized line width in whole pixels.
    pub line_width: u8,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            fill: FillMode::default(),
            cull: CullMode::default(),
            front_face: FrontFace::default(),
            depth_test: true,
            depth_write: true,
            depth_compare: CompareOp::default(),
            blend: BlendMode::default(),
            line_width: 1,
        }
    }
}

impl RenderState {
    /// Opaque triangles without depth, for full-screen and 2D passes.
    pub fn no_depth() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    #[must_use]
    pub fn with_fill(mut self, fill: FillMode) -> Self {
        self.fill = fill;
        self
    }

    #[must_use]
    pub fn with_cull(mut self, cull: CullMode) -> Self {
        self.cull = cull;
        self
    }

    #[must_use]
    pub fn with_depth(mut self, test: bool, write: bool, compare: CompareOp) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self.depth_compare = compare;
        self
    }

    #[must_use]
    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    #[must_use]
    pub fn with_line_width(mut self, line_width: u8) -> Self {
        self.line_width = line_width;
        self
    }

    /// Packed 32-bit encoding.
    pub const fn pack(&self) -> u32 {
        (self.topology as u32)
            | (self.fill as u32) << 3
            | (self.cull as u32) << 5
            | (self.front_face as u32) << 7
            | (self.depth_test as u32) << 8
            | (self.depth_write as u32) << 9
            | (self.depth_compare as u32) << 10
            | (self.blend as u32) << 13
            | (self.line_width as u32) << 16
    }

    /// Decode a value produced by [`RenderState::pack`].
    pub fn unpack(bits: u32) -> Option<Self> {
        let field = |shift: u32, width: u32| ((bits >> shift) & ((1 << width) - 1)) as usize;
        if bits >> 24 != 0 {
            return None;
        }
        Some(Self {
            topology: *Topology::ALL.get(field(0, 3))?,
            fill: *FillMode::ALL.get(field(3, 2))?,
            cull: CullMode::ALL[field(5, 2)],
            front_face: if field(7, 1) == 0 {
                FrontFace::CounterClockwise
            } else {
                FrontFace::Clockwise
            },
            depth_test: field(8, 1) != 0,
            depth_write: field(9, 1) != 0,
            depth_compare: CompareOp::ALL[field(10, 3)],
            blend: *BlendMode::ALL.get(field(13, 3))?,
            line_width: field(16, 8) as u8,
        })
    }
}

/// Formats and sample count of the attachments a pipeline renders into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetLayout {
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub samples: u32,
}

impl TargetLayout {
    /// Single-sampled layout.
    pub fn new(color_formats: Vec<vk::Format>, depth_format: Option<vk::Format>) -> Self {
        Self {
            color_formats,
            depth_format,
            samples: 1,
        }
    }

    /// Render pass for this layout using `load_ops`, one per attachment,
    /// colors first.
    pub(crate) fn render_pass_request(&self, load_ops: &[LoadOp]) -> RenderPassRequest {
        let attachment = |format, load_op: LoadOp, optimal| AttachmentRequest {
            format,
            samples: self.samples,
            load_op,
            initial_layout: if load_op == LoadOp::Load {
                optimal
            } else {
                vk::ImageLayout::UNDEFINED
            },
            final_layout: optimal,
        };

        let colors = self
            .color_formats
            .iter()
            .zip(load_ops)
            .map(|(&format, &op)| attachment(format, op, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
            .collect();
        let depth = self.depth_format.map(|format| {
            let op = load_ops
                .get(self.color_formats.len())
                .copied()
                .unwrap_or(LoadOp::DontCare);
            attachment(format, op, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        });
        RenderPassRequest { colors, depth }
    }

    /// Number of attachments, depth included.
    pub fn attachment_count(&self) -> usize {
        self.color_formats.len() + usize::from(self.depth_format.is_some())
    }
}

/// Per-attachment load operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    /// Preserve previous contents.
    Load,
    /// Clear to the value supplied at pass begin.
    Clear,
    /// Previous contents are irrelevant.
    DontCare,
}

impl LoadOp {
    pub const fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            Self::Load => vk::AttachmentLoadOp::LOAD,
            Self::Clear => vk::AttachmentLoadOp::CLEAR,
            Self::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

/// One vertex buffer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
}

/// One vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Vertex input description; empty for vertex-pulling shaders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Add a per-vertex buffer binding.
    #[must_use]
    pub fn binding(mut self, binding: u32, stride: u32) -> Self {
        self.bindings.push(VertexBinding {
            binding,
            stride,
            per_instance: false,
        });
        self
    }

    /// Add an attribute.
    #[must_use]
    pub fn attribute(mut self, location: u32, binding: u32, format: vk::Format, offset: u32) -> Self {
        self.attributes.push(VertexAttribute {
            location,
            binding,
            format,
            offset,
        });
        self
    }

    pub(crate) fn binding_descriptions(&self) -> Vec<vk::VertexInputBindingDescription> {
        self.bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: if b.per_instance {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                },
            })
            .collect()
    }

    pub(crate) fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: a.format,
                offset: a.offset,
            })
            .collect()
    }
}

/// Shader stages of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramStages {
    Graphics {
        vertex: ShaderHandle,
        fragment: Option<ShaderHandle>,
    },
    Compute {
        compute: ShaderHandle,
    },
}

/// Program creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDesc {
    pub stages: ProgramStages,
    /// Descriptor layouts in set-index order.
    pub set_layouts: Vec<DescriptorLayoutHandle>,
    /// Push constant block size in bytes, visible to every stage.
    pub push_constant_size: u32,
    pub vertex_layout: VertexLayout,
}

impl ProgramDesc {
    /// Vertex + fragment program.
    pub fn graphics(vertex: ShaderHandle, fragment: ShaderHandle) -> Self {
        Self {
            stages: ProgramStages::Graphics {
                vertex,
                fragment: Some(fragment),
            },
            set_layouts: Vec::new(),
            push_constant_size: 0,
            vertex_layout: VertexLayout::default(),
        }
    }

    /// Compute program.
    pub fn compute(compute: ShaderHandle) -> Self {
        Self {
            stages: ProgramStages::Compute { compute },
            set_layouts: Vec::new(),
            push_constant_size: 0,
            vertex_layout: VertexLayout::default(),
        }
    }

    #[must_use]
    pub fn with_set_layouts(mut self, set_layouts: Vec<DescriptorLayoutHandle>) -> Self {
        self.set_layouts = set_layouts;
        self
    }

    #[must_use]
    pub fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    #[must_use]
    pub fn with_vertex_layout(mut self, vertex_layout: VertexLayout) -> Self {
        self.vertex_layout = vertex_layout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VariantKey {
    state: u32,
    targets: TargetLayout,
}

#[derive(Debug)]
struct PipelineVariant {
    key: VariantKey,
    pipeline: vk::Pipeline,
    last_used: u64,
}

/// Shader stages, layout, and the compiled variants of one program.
#[derive(Debug)]
pub struct PipelineProgram {
    pub(crate) desc: ProgramDesc,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) push_constant_stages: vk::ShaderStageFlags,
    variants: Vec<PipelineVariant>,
    tick: u64,
}

impl PipelineProgram {
    pub(crate) fn new(desc: ProgramDesc, layout: vk::PipelineLayout) -> Self {
        let push_constant_stages = match desc.stages {
            ProgramStages::Graphics { .. } => vk::ShaderStageFlags::ALL_GRAPHICS,
            ProgramStages::Compute { .. } => vk::ShaderStageFlags::COMPUTE,
        };
        Self {
            desc,
            layout,
            push_constant_stages,
            variants: Vec::new(),
            tick: 0,
        }
    }

    /// Creation parameters.
    pub fn desc(&self) -> &ProgramDesc {
        &self.desc
    }

    /// Native pipeline layout shared by all variants.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Returns `true` for compute programs.
    pub fn is_compute(&self) -> bool {
        matches!(self.desc.stages, ProgramStages::Compute { .. })
    }

    /// Bind point of every variant.
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        if self.is_compute() {
            vk::PipelineBindPoint::COMPUTE
        } else {
            vk::PipelineBindPoint::GRAPHICS
        }
    }

    /// Number of compiled variants currently kept.
    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// Compiled render states, in insertion order.
    pub fn variant_states(&self) -> impl Iterator<Item = RenderState> + '_ {
        self.variants
            .iter()
            .filter_map(|v| RenderState::unpack(v.key.state))
    }

    pub(crate) fn find_variant(
        &mut self,
        state: &RenderState,
        targets: &TargetLayout,
    ) -> Option<vk::Pipeline> {
        self.tick += 1;
        let tick = self.tick;
        let packed = state.pack();
        let variant = self
            .variants
            .iter_mut()
            .find(|v| v.key.state == packed && v.key.targets == *targets)?;
        variant.last_used = tick;
        Some(variant.pipeline)
    }

    /// Remember a new variant, evicting the least recently used one beyond `limit`.
    pub(crate) fn record_variant(
        &mut self,
        state: &RenderState,
        targets: &TargetLayout,
        pipeline: vk::Pipeline,
        limit: usize,
    ) -> Option<RetiredObject> {
        self.tick += 1;
        let oldest = if self.variants.len() >= limit {
            self.variants
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| v.last_used)
                .map(|(index, _)| index)
        } else {
            None
        };
        let evicted =
            oldest.map(|index| RetiredObject::Pipeline(self.variants.swap_remove(index).pipeline));
        self.variants.push(PipelineVariant {
            key: VariantKey {
                state: state.pack(),
                targets: targets.clone(),
            },
            pipeline,
            last_used: self.tick,
        });
        evicted
    }

    /// Forget every native object, returning them for retirement.
    pub(crate) fn take_native(&mut self) -> Vec<RetiredObject> {
        let mut retired: Vec<_> = self
            .variants
            .drain(..)
            .map(|v| RetiredObject::Pipeline(v.pipeline))
            .collect();
        retired.push(RetiredObject::PipelineLayout(self.layout));
        self.layout = vk::PipelineLayout::null();
        retired
    }
}

/// Color and depth images rendered into together.
#[derive(Debug)]
pub struct RenderTarget {
    pub(crate) colors: Vec<ImageHandle>,
    pub(crate) depth: Option<ImageHandle>,
    pub(crate) extent: vk::Extent2D,
    pub(crate) layout: TargetLayout,
    pub(crate) framebuffer: Option<vk::Framebuffer>,
    passes: Vec<(Vec<LoadOp>, vk::RenderPass)>,
}

impl RenderTarget {
    pub(crate) fn new(
        colors: Vec<ImageHandle>,
        depth: Option<ImageHandle>,
        extent: vk::Extent2D,
        layout: TargetLayout,
    ) -> Self {
        Self {
            colors,
            depth,
            extent,
            layout,
            framebuffer: None,
            passes: Vec::new(),
        }
    }

    /// Color attachments in order.
    pub fn colors(&self) -> &[ImageHandle] {
        &self.colors
    }

    /// Depth attachment.
    pub fn depth(&self) -> Option<ImageHandle> {
        self.depth
    }

    /// Shared extent of all attachments.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Attachment formats, usable as a pipeline variant key.
    pub fn layout(&self) -> &TargetLayout {
        &self.layout
    }

    /// Number of memoized pass variants.
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Every attachment, colors first.
    pub fn attachments(&self) -> impl Iterator<Item = ImageHandle> + '_ {
        self.colors.iter().copied().chain(self.depth)
    }

    pub(crate) fn find_pass(&self, load_ops: &[LoadOp]) -> Option<vk::RenderPass> {
        self.passes
            .iter()
            .find(|(ops, _)| ops.as_slice() == load_ops)
            .map(|(_, pass)| *pass)
    }

    pub(crate) fn record_pass(&mut self, load_ops: &[LoadOp], pass: vk::RenderPass) {
        self.passes.push((load_ops.to_vec(), pass));
    }

    /// Forget every native object, returning them for retirement.
    pub(crate) fn take_native(&mut self) -> Vec<RetiredObject> {
        let mut retired: Vec<_> = self
            .passes
            .drain(..)
            .map(|(_, pass)| RetiredObject::RenderPass(pass))
            .collect();
        retired.extend(self.framebuffer.take().map(RetiredObject::Framebuffer));
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_packs_stably() {
        let state = RenderState::default();
        // back cull (2 << 5), depth test + write, LESS (1 << 10), width 1
        assert_eq!(
            state.pack(),
            (2 << 5) | (1 << 8) | (1 << 9) | (1 << 10) | (1 << 16)
        );
    }

    #[test]
    fn pack_is_lossless() {
        let states = [
            RenderState::default(),
            RenderState::no_depth().with_cull(CullMode::None),
            RenderState::default()
                .with_topology(Topology::PointList)
                .with_fill(FillMode::Point)
                .with_depth(true, false, CompareOp::Always)
                .with_blend(BlendMode::Premultiplied)
                .with_line_width(255),
        ];
        for state in states {
            assert_eq!(RenderState::unpack(state.pack()), Some(state));
        }
    }

    #[test]
    fn single_field_changes_encoding() {
        let base = RenderState::default();
        let culled = base.with_cull(CullMode::Front);
        assert_ne!(base, culled);
        assert_ne!(base.pack(), culled.pack());
    }

    #[test]
    fn unpack_rejects_out_of_range_fields() {
        assert!(RenderState::unpack(7).is_none());
        assert!(RenderState::unpack(1 << 24).is_none());
        assert!(RenderState::unpack(7 << 13).is_none());
    }

    #[test]
    fn render_pass_layouts_follow_load_ops() {
        let layout = TargetLayout::new(
            vec![vk::Format::B8G8R8A8_SRGB, vk::Format::R16G16B16A16_SFLOAT],
            Some(vk::Format::D32_SFLOAT),
        );
        let request =
            layout.render_pass_request(&[LoadOp::Clear, LoadOp::Load, LoadOp::DontCare]);

        assert_eq!(request.colors[0].initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            request.colors[1].initial_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        let depth = request.depth.unwrap();
        assert_eq!(depth.load_op, LoadOp::DontCare);
        assert_eq!(
            depth.final_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(layout.attachment_count(), 3);
    }
}
