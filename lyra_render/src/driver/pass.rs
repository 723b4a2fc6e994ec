use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use super::format::PixelFormat;
use super::resource::ImageView;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

/// Description of one render target of a render pass.
#[derive(Copy, Clone, Debug)]
pub struct Attachment {
    pub format: PixelFormat,
    pub samples: u32,
    pub load: LoadOp,
    pub store: StoreOp,
    /// Ignored unless the format has a stencil aspect.
    pub stencil_load: LoadOp,
    pub stencil_store: StoreOp,
}

/// Description of one subpass of a render pass.
///
/// Indices refer to the render pass' attachment list.
#[derive(Clone, Debug)]
pub struct Subpass {
    pub colors: Vec<u32>,
    pub depth_stencil: Option<u32>,
    /// Multisample resolve destination per color attachment.
    pub resolves: Vec<Option<u32>>,
    /// Stall previous work before the subpass executes.
    pub wait: bool,
}

pub trait RenderPass: Send + Sync + Debug {
    fn attachments(&self) -> &[Attachment];

    fn subpasses(&self) -> &[Subpass];

    fn as_any(&self) -> &dyn Any;
}

/// Creation parameters of a [`Framebuf`].
///
/// The formats and sample counts of `views` must match the render pass'
/// attachment descriptions. All framebufs derived from a render pass must
/// be dropped before the render pass itself.
#[derive(Debug)]
pub struct FramebufDescriptor<'a> {
    pub pass: &'a Arc<dyn RenderPass>,
    pub views: &'a [Arc<dyn ImageView>],
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

pub trait Framebuf: Send + Sync + Debug {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn layers(&self) -> u32;

    fn as_any(&self) -> &dyn Any;
}

/// Clear value of an attachment whose load op is [`LoadOp::Clear`].
#[derive(Copy, Clone, Debug)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}
