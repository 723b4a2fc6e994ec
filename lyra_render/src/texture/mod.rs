//! Textures and the staging pipeline.
//!
//! A [`Texture`] wraps one image resource plus a plan of views over its
//! layers, and tracks the driver layout of every layer in an atomic cell.
//! Uploads and readbacks go through the process-wide [`staging`] pool.

pub mod staging;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use glam::UVec3;
use tracing::trace_span;

use crate::driver::sync::Sync;
use crate::driver::{
    self, Access, Barrier, BufImgCopy, Error, Gpu, Image, ImageDescriptor, ImageUsage, ImageView,
    Layout, Sampling, Transition, ViewDescriptor, ViewKind,
};

/// Sentinel stored in a layer's layout cell while a transition is
/// outstanding.
const INVALID_LAYOUT: i32 = -1;

/// Creation parameters of a [`Texture`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TexParam {
    pub format: driver::PixelFormat,
    pub width: u32,
    pub height: u32,
    /// 0 for 2D and cube textures.
    pub depth: u32,
    pub layers: u32,
    pub levels: u32,
    pub samples: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TexKind {
    D2,
    Target,
    Cube,
}

/// A texture: one image plus its views and per-layer layout state.
///
/// The view plan depends on the texture kind and layer count:
/// - non-arrayed 2D/target: one view;
/// - arrayed (N > 1): N per-layer views plus a whole-array view at
///   index N;
/// - cube with 6 layers: one cube view;
/// - cube with M > 6 layers: M/6 cube views plus a cube-array view at
///   index M/6.
#[derive(Debug)]
pub struct Texture {
    image: Arc<dyn Image>,
    views: Vec<Arc<dyn ImageView>>,
    /// One cell per layer holding the current [`Layout`], or
    /// [`INVALID_LAYOUT`] while a transition is outstanding.
    layouts: Vec<AtomicI32>,
    param: TexParam,
}

impl Texture {
    /// Creates a sampled 2D (or 2D array) texture.
    pub fn new_2d(gpu: &Arc<dyn Gpu>, param: &TexParam) -> Result<Self, Error> {
        Self::new(
            gpu,
            param,
            TexKind::D2,
            ImageUsage::SAMPLED | ImageUsage::COPY_SRC | ImageUsage::COPY_DST,
        )
    }

    /// Creates a render-target texture.
    pub fn new_target(gpu: &Arc<dyn Gpu>, param: &TexParam) -> Result<Self, Error> {
        Self::new(
            gpu,
            param,
            TexKind::Target,
            ImageUsage::RENDER_TARGET
                | ImageUsage::SAMPLED
                | ImageUsage::COPY_SRC
                | ImageUsage::COPY_DST,
        )
    }

    /// Creates a cube (or cube array) texture. `layers` must be a
    /// multiple of 6.
    pub fn new_cube(gpu: &Arc<dyn Gpu>, param: &TexParam) -> Result<Self, Error> {
        assert_eq!(param.layers % 6, 0, "cube layers must be a multiple of 6");
        Self::new(
            gpu,
            param,
            TexKind::Cube,
            ImageUsage::SAMPLED | ImageUsage::COPY_SRC | ImageUsage::COPY_DST,
        )
    }

    fn new(
        gpu: &Arc<dyn Gpu>,
        param: &TexParam,
        kind: TexKind,
        usage: ImageUsage,
    ) -> Result<Self, Error> {
        assert!(param.width >= 1 && param.height >= 1);
        assert!(param.layers >= 1);
        assert!(param.levels >= 1);
        assert!(param.samples >= 1 && param.samples.is_power_of_two());

        let image = gpu.new_image(&ImageDescriptor {
            format: param.format,
            size: UVec3::new(param.width, param.height, param.depth),
            layers: param.layers,
            levels: param.levels,
            samples: param.samples,
            usage,
        })?;

        let views = Self::make_views(&image, kind, param)?;

        let layouts = (0..param.layers)
            .map(|_| AtomicI32::new(Layout::Undefined.as_i32()))
            .collect();

        Ok(Self {
            image,
            views,
            layouts,
            param: *param,
        })
    }

    /// Builds the view plan. A failure drops the views created so far.
    fn make_views(
        image: &Arc<dyn Image>,
        kind: TexKind,
        param: &TexParam,
    ) -> Result<Vec<Arc<dyn ImageView>>, Error> {
        let mut views = Vec::new();

        match kind {
            TexKind::D2 | TexKind::Target => {
                if param.layers == 1 {
                    views.push(image.new_view(&ViewDescriptor {
                        kind: ViewKind::D2,
                        first_layer: 0,
                        layers: 1,
                        first_level: 0,
                        levels: param.levels,
                    })?);
                } else {
                    for layer in 0..param.layers {
                        views.push(image.new_view(&ViewDescriptor {
                            kind: ViewKind::D2,
                            first_layer: layer,
                            layers: 1,
                            first_level: 0,
                            levels: param.levels,
                        })?);
                    }
                    views.push(image.new_view(&ViewDescriptor {
                        kind: ViewKind::D2Array,
                        first_layer: 0,
                        layers: param.layers,
                        first_level: 0,
                        levels: param.levels,
                    })?);
                }
            }
            TexKind::Cube => {
                if param.layers == 6 {
                    views.push(image.new_view(&ViewDescriptor {
                        kind: ViewKind::Cube,
                        first_layer: 0,
                        layers: 6,
                        first_level: 0,
                        levels: param.levels,
                    })?);
                } else {
                    for pack in 0..param.layers / 6 {
                        views.push(image.new_view(&ViewDescriptor {
                            kind: ViewKind::Cube,
                            first_layer: pack * 6,
                            layers: 6,
                            first_level: 0,
                            levels: param.levels,
                        })?);
                    }
                    views.push(image.new_view(&ViewDescriptor {
                        kind: ViewKind::CubeArray,
                        first_layer: 0,
                        layers: param.layers,
                        first_level: 0,
                        levels: param.levels,
                    })?);
                }
            }
        }

        Ok(views)
    }

    pub fn image(&self) -> &Arc<dyn Image> {
        &self.image
    }

    pub fn views(&self) -> &[Arc<dyn ImageView>] {
        &self.views
    }

    pub fn view(&self, index: usize) -> &Arc<dyn ImageView> {
        &self.views[index]
    }

    pub fn param(&self) -> &TexParam {
        &self.param
    }

    pub fn usage(&self) -> ImageUsage {
        self.image.usage()
    }

    /// The current layout of a layer, or `None` while a transition is
    /// outstanding.
    pub fn layout(&self, layer: u32) -> Option<Layout> {
        Layout::from_i32(self.layouts[layer as usize].load(Ordering::Acquire))
    }

    /// Bytes of one layer at level 0.
    fn layer_size(&self) -> u64 {
        self.param.format.size() as u64
            * self.param.width as u64
            * self.param.height as u64
            * self.param.depth.max(1) as u64
    }

    fn view_layers(&self, view: usize) -> (u32, u32) {
        let v = &self.views[view];
        (v.first_layer(), v.layers())
    }

    /// Atomically marks every layer covered by `view` as having a
    /// transition outstanding, returning the previous layouts.
    ///
    /// Panics if any covered layer is already pending: two transitions
    /// may not target the same layer concurrently, and a deferred
    /// transition must be completed with [`set_layout`] first.
    ///
    /// [`set_layout`]: Texture::set_layout
    fn set_pending(&self, view: usize) -> Vec<Layout> {
        let (first, count) = self.view_layers(view);

        (first..first + count)
            .map(|i| {
                let prev = self.layouts[i as usize].swap(INVALID_LAYOUT, Ordering::AcqRel);
                match Layout::from_i32(prev) {
                    Some(layout) => layout,
                    None => panic!("layer {} already has a transition outstanding", i),
                }
            })
            .collect()
    }

    /// Completes an outstanding transition of every layer covered by
    /// `view`, storing `layout`.
    ///
    /// The client calls this after ensuring the recorded transition
    /// executed. Panics if a covered layer is not pending.
    pub fn set_layout(&self, view: usize, layout: Layout) {
        let (first, count) = self.view_layers(view);
        let layouts = vec![layout; count as usize];
        self.restore_layouts(first, &layouts);
    }

    fn restore_layouts(&self, first: u32, layouts: &[Layout]) {
        for (i, layout) in layouts.iter().enumerate() {
            let prev = self.layouts[first as usize + i].swap(layout.as_i32(), Ordering::AcqRel);
            assert_eq!(
                prev, INVALID_LAYOUT,
                "layer {} has no transition outstanding",
                first as usize + i,
            );
        }
    }

    /// Builds the transition records taking the view's layers from
    /// `before` to `after`.
    ///
    /// Uniform ranges coalesce into a single record; layers whose
    /// layouts drifted apart get one record each.
    fn transitions(
        &self,
        view: usize,
        before: &[Layout],
        after: &[Layout],
        barrier: Barrier,
    ) -> Vec<Transition> {
        let (first, count) = self.view_layers(view);
        debug_assert_eq!(before.len(), count as usize);
        debug_assert_eq!(after.len(), count as usize);

        let uniform = before.iter().all(|&b| b == before[0])
            && after.iter().all(|&a| a == after[0]);

        if uniform {
            return vec![Transition {
                barrier,
                layout_before: before[0],
                layout_after: after[0],
                image: self.image.clone(),
                layer: first,
                layers: count,
                level: 0,
                levels: self.param.levels,
            }];
        }

        (0..count)
            .map(|i| Transition {
                barrier,
                layout_before: before[i as usize],
                layout_after: after[i as usize],
                image: self.image.clone(),
                layer: first + i,
                layers: 1,
                level: 0,
                levels: self.param.levels,
            })
            .collect()
    }

    /// Uploads `data` to every layer covered by `view`, truncated to the
    /// view size, and leaves the layers in [`Layout::ShaderRead`].
    ///
    /// With `commit` set the copy executes before returning and the
    /// layer state is restored by this call; otherwise the copy is
    /// deferred into the staging batch and the client must call
    /// [`set_layout`]`(view, Layout::ShaderRead)` once it ensured
    /// execution.
    ///
    /// Returns the number of bytes consumed.
    ///
    /// [`set_layout`]: Texture::set_layout
    pub fn copy_to_view(&self, view: usize, data: &[u8], commit: bool) -> Result<u64, Error> {
        let _span = trace_span!("Texture::copy_to_view").entered();

        let mut buf = staging::take();
        let result = self.copy_to_view_inner(&mut buf, view, data, commit);
        staging::put(buf);
        result
    }

    fn copy_to_view_inner(
        &self,
        buf: &mut staging::StagingBuffer,
        view: usize,
        data: &[u8],
        commit: bool,
    ) -> Result<u64, Error> {
        let n = self.layer_size();
        // Each layer gets its own 512-byte aligned slot so the per-layer
        // buffer offsets satisfy the copy alignment contract.
        let slot = n.next_multiple_of(512);
        let (first_layer, layer_count) = self.view_layers(view);
        let total = n * layer_count as u64;
        let len = (data.len() as u64).min(total);
        // Partial rows cannot be addressed by the copy; whole layers
        // only.
        let layers = (len / n) as u32;

        let prev = self.set_pending(view);

        let offset = match buf.reserve(slot * layers.max(1) as u64) {
            Ok(offset) => offset,
            Err(err) => {
                self.restore_layouts(first_layer, &prev);
                return Err(err);
            }
        };
        for i in 0..layers as u64 {
            buf.buffer()
                .write(offset + slot * i, &data[(n * i) as usize..][..n as usize]);
        }

        let barrier = Barrier {
            sync_before: Sync::all(),
            sync_after: Sync::COPY,
            access_before: Access::empty(),
            access_after: Access::COPY_WRITE,
        };
        let to_copy = self.transitions(view, &prev, &vec![Layout::CopyDst; prev.len()], barrier);
        let to_read = self.transitions(
            view,
            &vec![Layout::CopyDst; prev.len()],
            &vec![Layout::ShaderRead; prev.len()],
            Barrier {
                sync_before: Sync::COPY,
                sync_after: Sync::all(),
                access_before: Access::COPY_WRITE,
                access_after: Access::SHADER_READ,
            },
        );

        let image = self.image.clone();
        let extent = UVec3::new(self.param.width, self.param.height, self.param.depth);
        let shared = buf.buffer().clone();
        let recorded = buf.record(|cb| {
            cb.transition(&to_copy);
            cb.begin_blit(false);
            for i in 0..layers {
                cb.copy_buf_to_img(&BufImgCopy {
                    buffer: shared.clone(),
                    buffer_offset: offset + slot * i as u64,
                    row_stride: 0,
                    slice_stride: 0,
                    image: image.clone(),
                    image_offset: UVec3::ZERO,
                    layer: first_layer + i,
                    level: 0,
                    size: extent,
                    depth_copy: false,
                });
            }
            cb.end_blit();
            cb.transition(&to_read);
        });
        if let Err(err) = recorded {
            self.restore_layouts(first_layer, &prev);
            return Err(err);
        }

        if commit {
            match buf.commit() {
                Ok(()) => self.set_layout(view, Layout::ShaderRead),
                Err(err) => {
                    self.restore_layouts(first_layer, &prev);
                    return Err(err);
                }
            }
        }

        Ok(len)
    }

    /// Reads every layer covered by `view` back into `dst` and restores
    /// the layers to their prior layouts.
    ///
    /// The copy always commits. Returns the number of bytes written.
    pub fn copy_from_view(&self, view: usize, dst: &mut [u8]) -> Result<usize, Error> {
        let _span = trace_span!("Texture::copy_from_view").entered();

        let mut buf = staging::take();
        let result = self.copy_from_view_inner(&mut buf, view, dst);
        staging::put(buf);
        result
    }

    fn copy_from_view_inner(
        &self,
        buf: &mut staging::StagingBuffer,
        view: usize,
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        let n = self.layer_size();
        let slot = n.next_multiple_of(512);
        let (first_layer, layer_count) = self.view_layers(view);
        let total = n * layer_count as u64;
        let len = (dst.len() as u64).min(total) as usize;

        let prev = self.set_pending(view);

        let offset = match buf.reserve(slot * layer_count as u64) {
            Ok(offset) => offset,
            Err(err) => {
                self.restore_layouts(first_layer, &prev);
                return Err(err);
            }
        };

        let to_copy = self.transitions(
            view,
            &prev,
            &vec![Layout::CopySrc; prev.len()],
            Barrier {
                sync_before: Sync::all(),
                sync_after: Sync::COPY,
                access_before: Access::empty(),
                access_after: Access::COPY_READ,
            },
        );
        let to_prev = self.transitions(
            view,
            &vec![Layout::CopySrc; prev.len()],
            &prev,
            Barrier {
                sync_before: Sync::COPY,
                sync_after: Sync::all(),
                access_before: Access::COPY_READ,
                access_after: Access::empty(),
            },
        );

        let image = self.image.clone();
        let extent = UVec3::new(self.param.width, self.param.height, self.param.depth);
        let shared = buf.buffer().clone();
        let recorded = buf.record(|cb| {
            cb.transition(&to_copy);
            cb.begin_blit(false);
            for i in 0..layer_count {
                cb.copy_img_to_buf(&BufImgCopy {
                    buffer: shared.clone(),
                    buffer_offset: offset + slot * i as u64,
                    row_stride: 0,
                    slice_stride: 0,
                    image: image.clone(),
                    image_offset: UVec3::ZERO,
                    layer: first_layer + i,
                    level: 0,
                    size: extent,
                    depth_copy: false,
                });
            }
            cb.end_blit();
            cb.transition(&to_prev);
        });
        if let Err(err) = recorded {
            self.restore_layouts(first_layer, &prev);
            return Err(err);
        }

        if let Err(err) = buf.commit() {
            self.restore_layouts(first_layer, &prev);
            return Err(err);
        }

        // The recorded tail transition put the layers back.
        self.restore_layouts(first_layer, &prev);

        let mut written = 0;
        let mut layer = 0;
        while written < len {
            let chunk = (len - written).min(n as usize);
            buf.unstage(offset + slot * layer, &mut dst[written..written + chunk]);
            written += chunk;
            layer += 1;
        }
        Ok(len)
    }
}

/// A sampler bound to its immutable [`Sampling`] configuration.
#[derive(Debug)]
pub struct Sampler {
    sampler: Arc<dyn driver::Sampler>,
    sampling: Sampling,
}

impl Sampler {
    pub fn new(gpu: &Arc<dyn Gpu>, sampling: &Sampling) -> Result<Self, Error> {
        let sampler = gpu.new_sampler(sampling)?;
        Ok(Self {
            sampler,
            sampling: *sampling,
        })
    }

    pub fn handle(&self) -> &Arc<dyn driver::Sampler> {
        &self.sampler
    }

    pub fn sampling(&self) -> &Sampling {
        &self.sampling
    }
}
