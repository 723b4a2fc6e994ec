//! The hardware-agnostic driver contract.
//!
//! A backend registers a [`Driver`] factory; [`Driver::open`] yields the
//! [`Gpu`], which is the sole constructor of every other driver-side
//! resource. Commands are recorded into [`CmdBuffer`]s, wrapped in a
//! [`WorkItem`] and submitted through [`Gpu::commit`]; completion is
//! signaled by delivering the item back on a caller-provided channel.

pub mod command;
pub mod descriptor;
pub mod format;
pub mod pass;
pub mod pipeline;
pub mod queue;
pub mod resource;
pub mod soft;
pub mod swapchain;
pub mod sync;

use std::fmt::Debug;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use glam::{UVec2, UVec3};
use parking_lot::Mutex;
use thiserror::Error;

pub use command::{
    BufImgCopy, BufferCopy, Cmd, CmdBuffer, ImageCopy, Scissor, State, Viewport,
};
pub use descriptor::{DescHeap, DescTable, DescType, Descriptor, Stages};
pub use format::{IndexFormat, PixelFormat, VertexFormat};
pub use pass::{
    Attachment, ClearValue, Framebuf, FramebufDescriptor, LoadOp, RenderPass, StoreOp, Subpass,
};
pub use pipeline::{
    BlendFactor, BlendOp, BlendState, ColorBlend, ColorMask, CompState, CompareOp, CullMode,
    DepthBias, DepthStencilState, FillMode, GraphState, Pipeline, PipelineState, RasterState,
    ShaderFn, StencilOp, StencilTest, Topology, VertexInput,
};
pub use resource::{
    Buffer, BufferUsage, Filter, Image, ImageDescriptor, ImageUsage, ImageView, Sampler, Sampling,
    ShaderCode, ViewDescriptor, ViewKind, Wrap,
};
pub use swapchain::{Presenter, Swapchain, WindowSource};
// The `Sync` scope mask stays under its module so it cannot shadow the
// marker trait in supertrait bounds; address it as `sync::Sync`.
pub use sync::{Access, Barrier, Layout, Transition};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The platform library of the backend is missing.
    #[error("driver not installed")]
    NotInstalled,
    /// No suitable device is available.
    #[error("no device found")]
    NoDevice,
    #[error("out of host memory")]
    NoHostMemory,
    #[error("out of device memory")]
    NoDeviceMemory,
    /// The driver is unrecoverable. The client must destroy every
    /// resource and close the driver; it may be reopened afterwards.
    #[error("fatal driver error")]
    Fatal,
    /// The device cannot present to the given window.
    #[error("cannot present")]
    CannotPresent,
    #[error("window error")]
    Window,
    /// The swapchain is out of date and must be recreated.
    #[error("swapchain must be recreated")]
    Swapchain,
    /// Every backbuffer is in flight. Transient; retry.
    #[error("no backbuffer available")]
    NoBackbuffer,
}

/// A batch of command buffers submitted as a single unit.
///
/// The same item is delivered on the completion channel once all work in
/// the batch finished, with [`err`] set on failure.
///
/// [`err`]: WorkItem::err
#[derive(Debug, Default)]
pub struct WorkItem {
    pub work: Vec<CmdBuffer>,
    pub err: Option<Error>,
}

/// Immutable implementation limits of a [`Gpu`].
#[derive(Copy, Clone, Debug)]
pub struct Limits {
    pub max_image_1d: u32,
    pub max_image_2d: u32,
    pub max_image_cube: u32,
    pub max_image_3d: u32,
    pub max_layers: u32,
    /// Maximum number of heaps in a bound descriptor table.
    pub max_desc_heaps: u32,
    pub max_desc_buffers: u32,
    pub max_desc_images: u32,
    pub max_desc_constants: u32,
    pub max_desc_textures: u32,
    pub max_desc_samplers: u32,
    pub max_color_targets: u32,
    pub max_fb_size: UVec2,
    pub max_fb_layers: u32,
    pub max_dispatch: UVec3,
    pub max_dispatch_invocations: u32,
    pub max_viewports: u32,
    pub max_vertex_inputs: u32,
    pub max_anisotropy: f32,
}

/// A backend factory.
///
/// [`open`] on an already open driver returns the same [`Gpu`] instance;
/// [`close`] on a driver that is not open is a no-op. `open`/`close` are
/// not safe for concurrent invocation on the same factory.
///
/// [`open`]: Driver::open
/// [`close`]: Driver::close
pub trait Driver: Send + Sync + Debug {
    /// The registry name. Never triggers [`open`].
    ///
    /// [`open`]: Driver::open
    fn name(&self) -> &str;

    fn open(&self) -> Result<Arc<dyn Gpu>, Error>;

    fn close(&self);
}

/// A device obtained from a [`Driver`].
///
/// The GPU is the sole constructor of all other driver-side resources.
pub trait Gpu: Send + Sync + Debug {
    fn limits(&self) -> Limits;

    fn new_cmd_buffer(&self) -> Result<CmdBuffer, Error>;

    fn new_buffer(
        &self,
        size: u64,
        visible: bool,
        usage: BufferUsage,
    ) -> Result<Arc<dyn Buffer>, Error>;

    fn new_image(&self, descriptor: &ImageDescriptor) -> Result<Arc<dyn Image>, Error>;

    fn new_sampler(&self, sampling: &Sampling) -> Result<Arc<dyn Sampler>, Error>;

    /// Wraps an opaque shader binary.
    fn new_shader_code(&self, code: &[u8]) -> Result<Arc<dyn ShaderCode>, Error>;

    fn new_desc_heap(&self, descriptors: &[Descriptor]) -> Result<Arc<dyn DescHeap>, Error>;

    fn new_pipeline(&self, state: &PipelineState) -> Result<Arc<dyn Pipeline>, Error>;

    fn new_render_pass(
        &self,
        attachments: &[Attachment],
        subpasses: &[Subpass],
    ) -> Result<Arc<dyn RenderPass>, Error>;

    fn new_framebuf(&self, descriptor: &FramebufDescriptor<'_>) -> Result<Arc<dyn Framebuf>, Error>;

    /// Accepts an ordered batch for execution and returns immediately.
    ///
    /// Ordering within the batch is meaningful: a command buffer may
    /// declare waits that apply to all preceding work in the batch; no
    /// other cross-buffer synchronization is implied. Once all work
    /// completes, the same item is delivered on `done` with a possible
    /// error. Until then every buffer in the batch is pending and cannot
    /// be recorded into.
    fn commit(&self, item: WorkItem, done: Sender<WorkItem>) -> Result<(), Error>;

    /// Queries the optional presentation capability.
    fn presenter(&self) -> Option<&dyn Presenter> {
        None
    }
}

static DRIVERS: Mutex<Vec<Arc<dyn Driver>>> = Mutex::new(Vec::new());

/// Registers a driver factory.
///
/// Intended to run once per backend at initialization time. A name
/// collision replaces the existing entry; duplicate registration is not
/// an error.
pub fn register(driver: Arc<dyn Driver>) {
    let mut drivers = DRIVERS.lock();

    if let Some(entry) = drivers.iter_mut().find(|d| d.name() == driver.name()) {
        tracing::warn!("replacing registered driver {:?}", driver.name());
        *entry = driver;
        return;
    }

    drivers.push(driver);
}

/// Returns a snapshot of the registered drivers.
pub fn drivers() -> Vec<Arc<dyn Driver>> {
    DRIVERS.lock().clone()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::soft::SoftDriver;
    use super::{drivers, register, Driver, Error, Gpu};

    #[derive(Debug)]
    struct NullDriver(&'static str);

    impl Driver for NullDriver {
        fn name(&self) -> &str {
            self.0
        }

        fn open(&self) -> Result<Arc<dyn Gpu>, Error> {
            Err(Error::NoDevice)
        }

        fn close(&self) {}
    }

    #[test]
    fn registry_replaces_on_collision() {
        register(Arc::new(NullDriver("x")));
        register(Arc::new(NullDriver("registry-y")));
        register(Arc::new(NullDriver("x")));

        let names: Vec<_> = drivers()
            .iter()
            .filter(|d| d.name() == "x")
            .map(|d| d.name().to_owned())
            .collect();
        assert_eq!(names, ["x"]);

        assert!(drivers().iter().any(|d| d.name() == "registry-y"));
    }

    #[test]
    fn driver_open_close() {
        let driver = SoftDriver::new();

        // Close on a not-open driver is a no-op.
        driver.close();
        assert_eq!(driver.name(), "soft");

        let a = driver.open().unwrap();
        let b = driver.open().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        driver.close();
        assert_eq!(driver.name(), "soft");

        // Reopening yields a fresh instance.
        let c = driver.open().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
