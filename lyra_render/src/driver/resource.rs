use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use bitflags::bitflags;
use glam::UVec3;

use super::format::PixelFormat;
use super::pipeline::CompareOp;
use super::Error;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        /// Constant (uniform) data read by shaders.
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const VERTEX = 1 << 4;
        const INDEX = 1 << 5;
        const INDIRECT = 1 << 6;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const RENDER_TARGET = 1 << 4;
    }
}

/// A driver buffer resource.
///
/// Handles are obtained from [`Gpu::new_buffer`] and released by dropping
/// the last reference.
///
/// [`Gpu::new_buffer`]: super::Gpu::new_buffer
pub trait Buffer: Send + Sync + Debug {
    fn size(&self) -> u64;

    fn usage(&self) -> BufferUsage;

    /// Whether the buffer memory is host-visible.
    fn visible(&self) -> bool;

    /// Writes `data` into the buffer at `offset`.
    ///
    /// Panics if the buffer is not host-visible or the range is out of
    /// bounds.
    fn write(&self, offset: u64, data: &[u8]);

    /// Reads bytes from the buffer at `offset` into `out`.
    ///
    /// Panics if the buffer is not host-visible or the range is out of
    /// bounds.
    fn read(&self, offset: u64, out: &mut [u8]);

    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone, Debug)]
pub struct ImageDescriptor {
    pub format: PixelFormat,
    /// Texel extent; `z` is 0 for non-3D images.
    pub size: UVec3,
    pub layers: u32,
    pub levels: u32,
    pub samples: u32,
    pub usage: ImageUsage,
}

/// A driver image resource.
pub trait Image: Send + Sync + Debug {
    fn format(&self) -> PixelFormat;

    fn size(&self) -> UVec3;

    fn layers(&self) -> u32;

    fn levels(&self) -> u32;

    fn samples(&self) -> u32;

    fn usage(&self) -> ImageUsage;

    /// Creates a view over a subresource range of the image.
    fn new_view(&self, descriptor: &ViewDescriptor) -> Result<Arc<dyn ImageView>, Error>;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ViewKind {
    D2,
    D2Array,
    Cube,
    CubeArray,
    D3,
}

#[derive(Copy, Clone, Debug)]
pub struct ViewDescriptor {
    pub kind: ViewKind,
    pub first_layer: u32,
    pub layers: u32,
    pub first_level: u32,
    pub levels: u32,
}

/// A view over a subresource range of an [`Image`].
pub trait ImageView: Send + Sync + Debug {
    fn image(&self) -> Arc<dyn Image>;

    fn kind(&self) -> ViewKind;

    fn format(&self) -> PixelFormat;

    fn first_layer(&self) -> u32;

    fn layers(&self) -> u32;

    fn first_level(&self) -> u32;

    fn levels(&self) -> u32;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Wrap {
    Repeat,
    MirrorRepeat,
    ClampToEdge,
    ClampToBorder,
}

/// Immutable sampler configuration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sampling {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mipmap_filter: Filter,
    pub wrap_u: Wrap,
    pub wrap_v: Wrap,
    pub wrap_w: Wrap,
    /// 1.0 disables anisotropic filtering.
    pub max_anisotropy: f32,
    pub compare: Option<CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            min_filter: Filter::Nearest,
            mag_filter: Filter::Nearest,
            mipmap_filter: Filter::Nearest,
            wrap_u: Wrap::Repeat,
            wrap_v: Wrap::Repeat,
            wrap_w: Wrap::Repeat,
            max_anisotropy: 1.0,
            compare: None,
            min_lod: 0.0,
            max_lod: f32::MAX,
        }
    }
}

pub trait Sampler: Send + Sync + Debug {
    fn sampling(&self) -> Sampling;

    fn as_any(&self) -> &dyn Any;
}

/// An opaque shader binary owned by the driver.
pub trait ShaderCode: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}
