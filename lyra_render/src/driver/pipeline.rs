use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use bitflags::bitflags;

use super::descriptor::DescTable;
use super::format::{PixelFormat, VertexFormat};
use super::pass::RenderPass;
use super::resource::ShaderCode;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topology {
    Point,
    Line,
    LineStrip,
    Triangle,
    TriangleStrip,
    TriangleFan,
}

impl Topology {
    /// Whether `count` vertices (or indices) can form whole primitives.
    pub const fn valid_count(&self, count: u32) -> bool {
        match self {
            Self::Point => count >= 1,
            Self::Line => count >= 2 && count % 2 == 0,
            Self::LineStrip => count >= 2,
            Self::Triangle => count >= 3 && count % 3 == 0,
            Self::TriangleStrip | Self::TriangleFan => count >= 3,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FillMode {
    Fill,
    Lines,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DepthBias {
    pub value: f32,
    pub slope: f32,
    pub clamp: f32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RasterState {
    /// Winding order of front-facing primitives.
    pub clockwise: bool,
    pub cull: CullMode,
    pub fill: FillMode,
    pub depth_bias: Option<DepthBias>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncClamp,
    DecClamp,
    Invert,
    IncWrap,
    DecWrap,
}

/// Per-face stencil configuration.
///
/// The reference value is dynamic state set during recording.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StencilTest {
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
    pub compare: CompareOp,
    pub read_mask: u32,
    pub write_mask: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareOp,
    pub stencil_test: bool,
    pub front: StencilTest,
    pub back: StencilTest,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ColorMask: u32 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    BlendColor,
    OneMinusBlendColor,
    SrcAlphaSaturated,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    RevSubtract,
    Min,
    Max,
}

/// Blend configuration of one color target.
///
/// RGB and alpha blend independently.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlend {
    pub blend: bool,
    pub write_mask: ColorMask,
    pub color_op: BlendOp,
    pub color_src: BlendFactor,
    pub color_dst: BlendFactor,
    pub alpha_op: BlendOp,
    pub alpha_src: BlendFactor,
    pub alpha_dst: BlendFactor,
}

impl Default for ColorBlend {
    fn default() -> Self {
        Self {
            blend: false,
            write_mask: ColorMask::all(),
            color_op: BlendOp::Add,
            color_src: BlendFactor::One,
            color_dst: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            alpha_src: BlendFactor::One,
            alpha_dst: BlendFactor::Zero,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlendState {
    /// When unset, `targets[0]` applies to every color target.
    pub independent: bool,
    pub targets: Vec<ColorBlend>,
}

/// One vertex attribute consumed by a graphics pipeline.
///
/// Each input is fed from its own buffer binding; `nr` is both the input
/// location and the binding number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexInput {
    pub format: VertexFormat,
    pub stride: u32,
    pub nr: u32,
}

/// A shader entry point within a [`ShaderCode`] blob.
#[derive(Clone, Debug)]
pub struct ShaderFn {
    pub code: Arc<dyn ShaderCode>,
    pub name: String,
}

/// Complete state of a graphics pipeline.
#[derive(Clone, Debug)]
pub struct GraphState {
    pub vertex: ShaderFn,
    pub fragment: Option<ShaderFn>,
    pub desc: DescTable,
    pub inputs: Vec<VertexInput>,
    pub topology: Topology,
    pub raster: RasterState,
    pub samples: u32,
    pub depth_stencil: Option<DepthStencilState>,
    pub blend: BlendState,
    pub color_formats: Vec<PixelFormat>,
    pub ds_format: Option<PixelFormat>,
    /// The render pass and subpass the pipeline is valid in.
    pub pass: Arc<dyn RenderPass>,
    pub subpass: u32,
}

/// Complete state of a compute pipeline.
#[derive(Clone, Debug)]
pub struct CompState {
    pub shader: ShaderFn,
    pub desc: DescTable,
}

/// State bundle passed to pipeline creation.
#[derive(Clone, Debug)]
pub enum PipelineState {
    Graphics(GraphState),
    Compute(CompState),
}

pub trait Pipeline: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::Topology;

    #[test]
    fn topology_counts() {
        assert!(Topology::Triangle.valid_count(3));
        assert!(Topology::Triangle.valid_count(6));
        assert!(!Topology::Triangle.valid_count(4));
        assert!(!Topology::Triangle.valid_count(0));

        assert!(Topology::Line.valid_count(2));
        assert!(!Topology::Line.valid_count(3));

        assert!(Topology::LineStrip.valid_count(2));
        assert!(!Topology::LineStrip.valid_count(1));

        assert!(Topology::TriangleStrip.valid_count(3));
        assert!(!Topology::TriangleFan.valid_count(2));

        assert!(Topology::Point.valid_count(1));
        assert!(!Topology::Point.valid_count(0));
    }
}
