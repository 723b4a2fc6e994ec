use std::fmt::Debug;
use std::sync::Arc;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use super::format::PixelFormat;
use super::resource::{ImageUsage, ImageView};
use super::Error;

/// A window the presentation engine can target.
pub trait WindowSource: HasDisplayHandle + HasWindowHandle {}

impl<T: HasDisplayHandle + HasWindowHandle> WindowSource for T {}

/// Optional presentation capability of a [`Gpu`].
///
/// Discovered through [`Gpu::presenter`].
///
/// [`Gpu`]: super::Gpu
/// [`Gpu::presenter`]: super::Gpu::presenter
pub trait Presenter {
    /// Creates a swapchain targeting `window` with the desired number of
    /// backbuffers.
    ///
    /// The driver may clamp the backbuffer count to what the presentation
    /// engine supports.
    fn new_swapchain(
        &self,
        window: &dyn WindowSource,
        count: u32,
    ) -> Result<Arc<dyn Swapchain>, Error>;
}

/// A chain of presentable backbuffers.
pub trait Swapchain: Send + Sync + Debug {
    /// The backbuffer views. Immutable between recreations.
    fn views(&self) -> Vec<Arc<dyn ImageView>>;

    /// Acquires the index of a writable view.
    ///
    /// The returned view is in [`Layout::Undefined`], or
    /// [`Layout::Present`] if its prior presentation succeeded.
    ///
    /// Errors: [`Error::NoBackbuffer`] when every view is in flight
    /// (transient; retry), [`Error::Swapchain`] when the swapchain must be
    /// recreated.
    ///
    /// [`Layout::Undefined`]: super::Layout::Undefined
    /// [`Layout::Present`]: super::Layout::Present
    fn next(&self) -> Result<usize, Error>;

    /// Presents the view at `index`.
    ///
    /// Must be preceded by a completed transition of the view to
    /// [`Layout::Present`].
    ///
    /// [`Layout::Present`]: super::Layout::Present
    fn present(&self, index: usize) -> Result<(), Error>;

    /// Re-establishes the swapchain after [`Error::Swapchain`].
    ///
    /// The format and view count may change.
    fn recreate(&self) -> Result<(), Error>;

    fn format(&self) -> PixelFormat;

    /// Always includes render-target capability.
    fn usage(&self) -> ImageUsage;
}
