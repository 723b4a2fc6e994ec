//! A CPU reference driver.
//!
//! Buffers live in host memory and images as one byte plane per
//! (layer, level). The command stream is executed on a worker thread:
//! copies and fills move bytes, draws and dispatches validate but do not
//! rasterize. The driver registers under the name `"soft"` and backs the
//! end-to-end tests of the higher-level modules.

use std::any::Any;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};

use glam::{UVec2, UVec3};
use parking_lot::Mutex;

use super::command::{BufImgCopy, Cmd, CmdBuffer, ImageCopy};
use super::descriptor::{DescHeap, DescType, Descriptor};
use super::format::PixelFormat;
use super::pass::{Attachment, ClearValue, Framebuf, FramebufDescriptor, LoadOp, RenderPass, Subpass};
use super::pipeline::{Pipeline, PipelineState};
use super::queue::WorkQueue;
use super::resource::{
    Buffer, BufferUsage, Image, ImageDescriptor, ImageUsage, ImageView, Sampler, Sampling,
    ShaderCode, ViewDescriptor, ViewKind,
};
use super::swapchain::{Presenter, Swapchain, WindowSource};
use super::{Error, Gpu, Limits, WorkItem};

const SWAPCHAIN_EXTENT: UVec2 = UVec2::new(256, 256);

#[derive(Debug)]
pub struct SoftDriver {
    gpu: Mutex<Option<Arc<SoftGpu>>>,
}

impl SoftDriver {
    pub fn new() -> Self {
        Self {
            gpu: Mutex::new(None),
        }
    }
}

impl Default for SoftDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl super::Driver for SoftDriver {
    fn name(&self) -> &str {
        "soft"
    }

    fn open(&self) -> Result<Arc<dyn Gpu>, Error> {
        let mut gpu = self.gpu.lock();

        if let Some(gpu) = &*gpu {
            return Ok(gpu.clone());
        }

        tracing::info!("opening soft driver");
        let new = Arc::new(SoftGpu {
            queue: WorkQueue::new(execute),
        });
        *gpu = Some(new.clone());
        Ok(new)
    }

    fn close(&self) {
        if self.gpu.lock().take().is_some() {
            tracing::info!("closing soft driver");
        }
    }
}

#[derive(Debug)]
pub struct SoftGpu {
    queue: WorkQueue,
}

impl Gpu for SoftGpu {
    fn limits(&self) -> Limits {
        Limits {
            max_image_1d: 16384,
            max_image_2d: 16384,
            max_image_cube: 16384,
            max_image_3d: 2048,
            max_layers: 2048,
            max_desc_heaps: 8,
            max_desc_buffers: 1 << 20,
            max_desc_images: 1 << 20,
            max_desc_constants: 1 << 20,
            max_desc_textures: 1 << 20,
            max_desc_samplers: 4096,
            max_color_targets: 8,
            max_fb_size: UVec2::new(16384, 16384),
            max_fb_layers: 2048,
            max_dispatch: UVec3::new(65535, 65535, 65535),
            max_dispatch_invocations: 1024,
            max_viewports: 16,
            max_vertex_inputs: 16,
            max_anisotropy: 16.0,
        }
    }

    fn new_cmd_buffer(&self) -> Result<CmdBuffer, Error> {
        Ok(CmdBuffer::new())
    }

    fn new_buffer(
        &self,
        size: u64,
        visible: bool,
        usage: BufferUsage,
    ) -> Result<Arc<dyn Buffer>, Error> {
        assert_ne!(size, 0);
        assert!(!usage.is_empty(), "BufferUsage flags must not be empty");

        Ok(Arc::new(SoftBuffer {
            size,
            usage,
            visible,
            mem: Mutex::new(vec![0; size as usize]),
        }))
    }

    fn new_image(&self, descriptor: &ImageDescriptor) -> Result<Arc<dyn Image>, Error> {
        assert!(!descriptor.usage.is_empty(), "ImageUsage flags must not be empty");
        assert!(descriptor.size.x >= 1 && descriptor.size.y >= 1);
        assert!(descriptor.layers >= 1);
        assert!(descriptor.levels >= 1);
        assert!(descriptor.samples.is_power_of_two());

        let limits = self.limits();
        if descriptor.size.x > limits.max_image_2d
            || descriptor.size.y > limits.max_image_2d
            || descriptor.layers > limits.max_layers
        {
            return Err(Error::NoDeviceMemory);
        }

        let mut planes = Vec::with_capacity((descriptor.layers * descriptor.levels) as usize);
        for _ in 0..descriptor.layers {
            for level in 0..descriptor.levels {
                let (w, h, d) = mip_extent(descriptor.size, level);
                let bytes = descriptor.format.size() as usize * w * h * d;
                planes.push(vec![0; bytes]);
            }
        }

        Ok(Arc::new_cyclic(|this| SoftImage {
            this: this.clone(),
            format: descriptor.format,
            size: descriptor.size,
            layers: descriptor.layers,
            levels: descriptor.levels,
            samples: descriptor.samples,
            usage: descriptor.usage,
            planes: Mutex::new(planes),
        }))
    }

    fn new_sampler(&self, sampling: &Sampling) -> Result<Arc<dyn Sampler>, Error> {
        assert!(sampling.max_anisotropy >= 1.0);
        Ok(Arc::new(SoftSampler {
            sampling: *sampling,
        }))
    }

    fn new_shader_code(&self, code: &[u8]) -> Result<Arc<dyn ShaderCode>, Error> {
        Ok(Arc::new(SoftShaderCode {
            code: code.to_vec(),
        }))
    }

    fn new_desc_heap(&self, descriptors: &[Descriptor]) -> Result<Arc<dyn DescHeap>, Error> {
        for descriptor in descriptors {
            assert!(descriptor.len >= 1, "descriptor array length must be >= 1");
        }

        Ok(Arc::new(SoftDescHeap {
            descriptors: descriptors.to_vec(),
            copies: Mutex::new(Vec::new()),
        }))
    }

    fn new_pipeline(&self, state: &PipelineState) -> Result<Arc<dyn Pipeline>, Error> {
        if let PipelineState::Graphics(state) = state {
            assert!(state.inputs.len() <= self.limits().max_vertex_inputs as usize);
            assert!(
                (state.subpass as usize) < state.pass.subpasses().len(),
                "pipeline subpass out of bounds",
            );
        }

        Ok(Arc::new(SoftPipeline {
            state: state.clone(),
        }))
    }

    fn new_render_pass(
        &self,
        attachments: &[Attachment],
        subpasses: &[Subpass],
    ) -> Result<Arc<dyn RenderPass>, Error> {
        assert!(!subpasses.is_empty());
        for subpass in subpasses {
            for &i in subpass.colors.iter().chain(subpass.depth_stencil.iter()) {
                assert!((i as usize) < attachments.len(), "attachment out of bounds");
            }
        }

        Ok(Arc::new(SoftRenderPass {
            attachments: attachments.to_vec(),
            subpasses: subpasses.to_vec(),
        }))
    }

    fn new_framebuf(&self, descriptor: &FramebufDescriptor<'_>) -> Result<Arc<dyn Framebuf>, Error> {
        let attachments = descriptor.pass.attachments();
        assert_eq!(descriptor.views.len(), attachments.len());
        for (view, attachment) in descriptor.views.iter().zip(attachments) {
            assert_eq!(view.format(), attachment.format, "attachment format mismatch");
            assert_eq!(
                view.image().samples(),
                attachment.samples,
                "attachment sample count mismatch",
            );
        }

        Ok(Arc::new(SoftFramebuf {
            pass: descriptor.pass.clone(),
            views: descriptor.views.to_vec(),
            width: descriptor.width,
            height: descriptor.height,
            layers: descriptor.layers,
        }))
    }

    fn commit(&self, item: WorkItem, done: Sender<WorkItem>) -> Result<(), Error> {
        self.queue.submit(item, done)
    }

    fn presenter(&self) -> Option<&dyn Presenter> {
        Some(self)
    }
}

impl Presenter for SoftGpu {
    fn new_swapchain(
        &self,
        _window: &dyn WindowSource,
        count: u32,
    ) -> Result<Arc<dyn Swapchain>, Error> {
        assert!(count >= 1);

        let format = PixelFormat::BGRA8_UNORM;
        let usage = ImageUsage::RENDER_TARGET | ImageUsage::COPY_SRC | ImageUsage::COPY_DST;

        let mut views = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let image = self.new_image(&ImageDescriptor {
                format,
                size: UVec3::new(SWAPCHAIN_EXTENT.x, SWAPCHAIN_EXTENT.y, 0),
                layers: 1,
                levels: 1,
                samples: 1,
                usage,
            })?;
            views.push(image.new_view(&ViewDescriptor {
                kind: ViewKind::D2,
                first_layer: 0,
                layers: 1,
                first_level: 0,
                levels: 1,
            })?);
        }

        Ok(Arc::new(SoftSwapchain {
            format,
            usage,
            views,
            acquired: Mutex::new(vec![false; count as usize]),
        }))
    }
}

#[derive(Debug)]
struct SoftBuffer {
    size: u64,
    usage: BufferUsage,
    visible: bool,
    mem: Mutex<Vec<u8>>,
}

impl Buffer for SoftBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn visible(&self) -> bool {
        self.visible
    }

    fn write(&self, offset: u64, data: &[u8]) {
        assert!(self.visible, "write to non-visible buffer");
        let mut mem = self.mem.lock();
        let offset = offset as usize;
        assert!(offset + data.len() <= mem.len());
        mem[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read(&self, offset: u64, out: &mut [u8]) {
        assert!(self.visible, "read from non-visible buffer");
        let mem = self.mem.lock();
        let offset = offset as usize;
        assert!(offset + out.len() <= mem.len());
        out.copy_from_slice(&mem[offset..offset + out.len()]);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn mip_extent(size: UVec3, level: u32) -> (usize, usize, usize) {
    let w = (size.x >> level).max(1) as usize;
    let h = (size.y >> level).max(1) as usize;
    let d = (size.z >> level).max(1) as usize;
    (w, h, d)
}

#[derive(Debug)]
struct SoftImage {
    /// Back reference for view creation.
    this: Weak<SoftImage>,
    format: PixelFormat,
    size: UVec3,
    layers: u32,
    levels: u32,
    samples: u32,
    usage: ImageUsage,
    /// One tightly packed byte plane per (layer, level).
    planes: Mutex<Vec<Vec<u8>>>,
}

impl SoftImage {
    fn plane_index(&self, layer: u32, level: u32) -> usize {
        (layer * self.levels + level) as usize
    }
}

impl Image for SoftImage {
    fn format(&self) -> PixelFormat {
        self.format
    }

    fn size(&self) -> UVec3 {
        self.size
    }

    fn layers(&self) -> u32 {
        self.layers
    }

    fn levels(&self) -> u32 {
        self.levels
    }

    fn samples(&self) -> u32 {
        self.samples
    }

    fn usage(&self) -> ImageUsage {
        self.usage
    }

    fn new_view(&self, descriptor: &ViewDescriptor) -> Result<Arc<dyn ImageView>, Error> {
        assert!(descriptor.layers >= 1);
        assert!(descriptor.levels >= 1);
        assert!(
            descriptor.first_layer + descriptor.layers <= self.layers,
            "view layer range out of bounds",
        );
        assert!(
            descriptor.first_level + descriptor.levels <= self.levels,
            "view level range out of bounds",
        );
        match descriptor.kind {
            ViewKind::Cube => assert_eq!(descriptor.layers, 6),
            ViewKind::CubeArray => assert_eq!(descriptor.layers % 6, 0),
            ViewKind::D2 => assert_eq!(descriptor.layers, 1),
            ViewKind::D2Array | ViewKind::D3 => (),
        }

        let image = self.this.upgrade().unwrap();

        Ok(Arc::new(SoftImageView {
            image,
            kind: descriptor.kind,
            first_layer: descriptor.first_layer,
            layers: descriptor.layers,
            first_level: descriptor.first_level,
            levels: descriptor.levels,
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct SoftImageView {
    image: Arc<SoftImage>,
    kind: ViewKind,
    first_layer: u32,
    layers: u32,
    first_level: u32,
    levels: u32,
}

impl ImageView for SoftImageView {
    fn image(&self) -> Arc<dyn Image> {
        self.image.clone()
    }

    fn kind(&self) -> ViewKind {
        self.kind
    }

    fn format(&self) -> PixelFormat {
        self.image.format
    }

    fn first_layer(&self) -> u32 {
        self.first_layer
    }

    fn layers(&self) -> u32 {
        self.layers
    }

    fn first_level(&self) -> u32 {
        self.first_level
    }

    fn levels(&self) -> u32 {
        self.levels
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct SoftSampler {
    sampling: Sampling,
}

impl Sampler for SoftSampler {
    fn sampling(&self) -> Sampling {
        self.sampling
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct SoftShaderCode {
    #[allow(dead_code)]
    code: Vec<u8>,
}

impl ShaderCode for SoftShaderCode {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
enum DescEntry {
    Buffer(Arc<dyn Buffer>, u64, u64),
    Image(Arc<dyn ImageView>),
    Sampler(Arc<dyn Sampler>),
}

#[derive(Debug)]
struct SoftDescHeap {
    descriptors: Vec<Descriptor>,
    /// copies[copy][descriptor][array element]
    copies: Mutex<Vec<Vec<Vec<Option<DescEntry>>>>>,
}

impl SoftDescHeap {
    fn descriptor(&self, nr: u32) -> (usize, &Descriptor) {
        self.descriptors
            .iter()
            .enumerate()
            .find(|(_, d)| d.nr == nr)
            .unwrap_or_else(|| panic!("no descriptor with binding {}", nr))
    }
}

impl DescHeap for SoftDescHeap {
    fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    fn count(&self) -> usize {
        self.copies.lock().len()
    }

    fn resize(&self, n: usize) -> Result<(), Error> {
        let mut copies = self.copies.lock();
        if copies.len() == n {
            return Ok(());
        }

        *copies = (0..n)
            .map(|_| {
                self.descriptors
                    .iter()
                    .map(|d| (0..d.len).map(|_| None).collect())
                    .collect()
            })
            .collect();
        Ok(())
    }

    fn set_buffer(
        &self,
        copy: usize,
        nr: u32,
        start: usize,
        buffers: &[Arc<dyn Buffer>],
        offsets: &[u64],
        sizes: &[u64],
    ) {
        assert_eq!(buffers.len(), offsets.len());
        assert_eq!(buffers.len(), sizes.len());

        let (slot, descriptor) = self.descriptor(nr);
        assert!(
            matches!(descriptor.kind, DescType::Buffer | DescType::Constant),
            "descriptor {} is not a buffer descriptor",
            nr,
        );
        assert!(start + buffers.len() <= descriptor.len as usize);

        let mut copies = self.copies.lock();
        let entries = &mut copies[copy][slot];
        for (i, buffer) in buffers.iter().enumerate() {
            assert_eq!(offsets[i] % 256, 0, "buffer range must be 256-byte aligned");
            assert_eq!(sizes[i] % 256, 0, "buffer range must be 256-byte aligned");
            entries[start + i] = Some(DescEntry::Buffer(buffer.clone(), offsets[i], sizes[i]));
        }
    }

    fn set_image(&self, copy: usize, nr: u32, start: usize, views: &[Arc<dyn ImageView>]) {
        let (slot, descriptor) = self.descriptor(nr);
        assert!(
            matches!(descriptor.kind, DescType::Image | DescType::Texture),
            "descriptor {} is not an image descriptor",
            nr,
        );
        assert!(start + views.len() <= descriptor.len as usize);

        let mut copies = self.copies.lock();
        let entries = &mut copies[copy][slot];
        for (i, view) in views.iter().enumerate() {
            entries[start + i] = Some(DescEntry::Image(view.clone()));
        }
    }

    fn set_sampler(&self, copy: usize, nr: u32, start: usize, samplers: &[Arc<dyn Sampler>]) {
        let (slot, descriptor) = self.descriptor(nr);
        assert!(
            matches!(descriptor.kind, DescType::Sampler),
            "descriptor {} is not a sampler descriptor",
            nr,
        );
        assert!(start + samplers.len() <= descriptor.len as usize);

        let mut copies = self.copies.lock();
        let entries = &mut copies[copy][slot];
        for (i, sampler) in samplers.iter().enumerate() {
            entries[start + i] = Some(DescEntry::Sampler(sampler.clone()));
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct SoftRenderPass {
    attachments: Vec<Attachment>,
    subpasses: Vec<Subpass>,
}

impl RenderPass for SoftRenderPass {
    fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    fn subpasses(&self) -> &[Subpass] {
        &self.subpasses
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct SoftFramebuf {
    #[allow(dead_code)]
    pass: Arc<dyn RenderPass>,
    views: Vec<Arc<dyn ImageView>>,
    width: u32,
    height: u32,
    layers: u32,
}

impl Framebuf for SoftFramebuf {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn layers(&self) -> u32 {
        self.layers
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct SoftPipeline {
    #[allow(dead_code)]
    state: PipelineState,
}

impl Pipeline for SoftPipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct SoftSwapchain {
    format: PixelFormat,
    usage: ImageUsage,
    views: Vec<Arc<dyn ImageView>>,
    acquired: Mutex<Vec<bool>>,
}

impl Swapchain for SoftSwapchain {
    fn views(&self) -> Vec<Arc<dyn ImageView>> {
        self.views.clone()
    }

    fn next(&self) -> Result<usize, Error> {
        let mut acquired = self.acquired.lock();
        match acquired.iter().position(|a| !a) {
            Some(i) => {
                acquired[i] = true;
                Ok(i)
            }
            None => Err(Error::NoBackbuffer),
        }
    }

    fn present(&self, index: usize) -> Result<(), Error> {
        let mut acquired = self.acquired.lock();
        assert!(acquired[index], "presenting a view that was not acquired");
        acquired[index] = false;
        Ok(())
    }

    fn recreate(&self) -> Result<(), Error> {
        self.acquired.lock().fill(false);
        Ok(())
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn usage(&self) -> ImageUsage {
        self.usage
    }
}

fn soft_buffer(buffer: &Arc<dyn Buffer>) -> &SoftBuffer {
    buffer
        .as_any()
        .downcast_ref()
        .expect("buffer was not created by the soft driver")
}

fn soft_image(image: &Arc<dyn Image>) -> &SoftImage {
    image
        .as_any()
        .downcast_ref()
        .expect("image was not created by the soft driver")
}

/// Executes the command streams of a batch.
fn execute(item: &mut WorkItem) -> Result<(), Error> {
    for cb in &item.work {
        for cmd in cb.commands() {
            match cmd {
                Cmd::BeginPass {
                    pass,
                    framebuf,
                    clear,
                } => clear_attachments(pass, framebuf, clear),
                Cmd::CopyBuffer(copy) => {
                    let len = copy.size as usize;
                    let mut bytes = vec![0; len];
                    let from = soft_buffer(&copy.from);
                    let to = soft_buffer(&copy.to);

                    let mem = from.mem.lock();
                    let start = copy.from_offset as usize;
                    bytes.copy_from_slice(&mem[start..start + len]);
                    drop(mem);

                    let mut mem = to.mem.lock();
                    let start = copy.to_offset as usize;
                    mem[start..start + bytes.len()].copy_from_slice(&bytes);
                }
                Cmd::Fill {
                    buffer,
                    offset,
                    value,
                    size,
                } => {
                    let buffer = soft_buffer(buffer);
                    let mut mem = buffer.mem.lock();
                    let start = *offset as usize;
                    mem[start..start + *size as usize].fill(*value);
                }
                Cmd::CopyBufToImg(copy) => copy_buf_img(copy, true),
                Cmd::CopyImgToBuf(copy) => copy_buf_img(copy, false),
                Cmd::CopyImage(copy) => copy_image(copy),
                // Draws and dispatches validate at record time and do
                // not rasterize here.
                _ => (),
            }
        }
    }

    Ok(())
}

/// Applies the clear load ops of a render pass.
///
/// Attachments are cleared to their texel pattern; no rasterization
/// happens beyond this.
fn clear_attachments(pass: &Arc<dyn RenderPass>, framebuf: &Arc<dyn Framebuf>, clear: &[ClearValue]) {
    let framebuf: &SoftFramebuf = framebuf
        .as_any()
        .downcast_ref()
        .expect("framebuf was not created by the soft driver");

    for (i, attachment) in pass.attachments().iter().enumerate() {
        if attachment.load != LoadOp::Clear {
            continue;
        }
        let Some(value) = clear.get(i) else {
            continue;
        };
        let Some(texel) = clear_texel(attachment.format, value) else {
            continue;
        };

        let view = &framebuf.views[i];
        let image = view.image();
        let image = soft_image(&image);

        let mut planes = image.planes.lock();
        for layer in view.first_layer()..view.first_layer() + view.layers() {
            for level in view.first_level()..view.first_level() + view.levels() {
                let index = image.plane_index(layer, level);
                for chunk in planes[index].chunks_exact_mut(texel.len()) {
                    chunk.copy_from_slice(&texel);
                }
            }
        }
    }
}

/// Encodes a clear value as one texel, or `None` for formats the soft
/// driver cannot clear.
fn clear_texel(format: PixelFormat, value: &ClearValue) -> Option<Vec<u8>> {
    fn unorm8(v: f32) -> u8 {
        (v.clamp(0.0, 1.0) * 255.0).round() as u8
    }

    match (format, value) {
        (PixelFormat::R8_UNORM, ClearValue::Color(c)) => Some(vec![unorm8(c[0])]),
        (PixelFormat::RG8_UNORM, ClearValue::Color(c)) => {
            Some(vec![unorm8(c[0]), unorm8(c[1])])
        }
        (PixelFormat::RGBA8_UNORM | PixelFormat::RGBA8_SRGB, ClearValue::Color(c)) => {
            Some(vec![unorm8(c[0]), unorm8(c[1]), unorm8(c[2]), unorm8(c[3])])
        }
        (PixelFormat::BGRA8_UNORM | PixelFormat::BGRA8_SRGB, ClearValue::Color(c)) => {
            Some(vec![unorm8(c[2]), unorm8(c[1]), unorm8(c[0]), unorm8(c[3])])
        }
        (PixelFormat::RGBA32_FLOAT, ClearValue::Color(c)) => {
            Some(c.iter().flat_map(|v| v.to_le_bytes()).collect())
        }
        (PixelFormat::D16_UNORM, ClearValue::DepthStencil { depth, .. }) => {
            let d = (depth.clamp(0.0, 1.0) * 65535.0).round() as u16;
            Some(d.to_le_bytes().to_vec())
        }
        (PixelFormat::D32_FLOAT, ClearValue::DepthStencil { depth, .. }) => {
            Some(depth.to_le_bytes().to_vec())
        }
        (PixelFormat::D24_UNORM_S8_UINT, ClearValue::DepthStencil { depth, stencil }) => {
            let d = (depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
            Some((d | (stencil << 24)).to_le_bytes().to_vec())
        }
        _ => None,
    }
}

fn copy_buf_img(copy: &BufImgCopy, to_image: bool) {
    let buffer = soft_buffer(&copy.buffer);
    let image = soft_image(&copy.image);

    let texel = image.format.size() as usize;
    assert_ne!(texel, 0, "cannot copy internal formats");

    let (w, h, d) = mip_extent(image.size, copy.level);
    let ex = copy.size.x as usize;
    let ey = copy.size.y as usize;
    let ez = (copy.size.z.max(1) as usize).min(d);
    let ox = copy.image_offset.x as usize;
    let oy = copy.image_offset.y as usize;
    let oz = copy.image_offset.z as usize;
    assert!(ox + ex <= w && oy + ey <= h && oz + ez <= d);

    // A zero stride means tightly packed.
    let row_bytes = ex * texel;
    let row_stride = if copy.row_stride == 0 {
        row_bytes
    } else {
        copy.row_stride as usize
    };
    let slice_stride = if copy.slice_stride == 0 {
        row_stride * ey
    } else {
        copy.slice_stride as usize
    };

    let plane_index = image.plane_index(copy.layer, copy.level);
    let mut planes = image.planes.lock();
    let plane = &mut planes[plane_index];
    let mut mem = buffer.mem.lock();

    for z in 0..ez {
        for y in 0..ey {
            let buf_off = copy.buffer_offset as usize + z * slice_stride + y * row_stride;
            let img_off = (((oz + z) * h + oy + y) * w + ox) * texel;

            if to_image {
                plane[img_off..img_off + row_bytes]
                    .copy_from_slice(&mem[buf_off..buf_off + row_bytes]);
            } else {
                mem[buf_off..buf_off + row_bytes]
                    .copy_from_slice(&plane[img_off..img_off + row_bytes]);
            }
        }
    }
}

fn copy_image(copy: &ImageCopy) {
    let from = soft_image(&copy.from);
    let to = soft_image(&copy.to);

    let texel = from.format.size() as usize;
    assert_eq!(texel, to.format.size() as usize, "texel size mismatch");
    assert_ne!(texel, 0, "cannot copy internal formats");

    let (fw, fh, _) = mip_extent(from.size, copy.from_level);
    let (tw, th, _) = mip_extent(to.size, copy.to_level);
    let ex = copy.size.x as usize;
    let ey = copy.size.y as usize;
    let ez = copy.size.z.max(1) as usize;

    for layer in 0..copy.layers {
        let from_plane = from.plane_index(copy.from_layer + layer, copy.from_level);
        let to_plane = to.plane_index(copy.to_layer + layer, copy.to_level);

        let mut row = vec![0; ex * texel];
        for z in 0..ez {
            for y in 0..ey {
                let src = ((copy.from_offset.z as usize + z) * fh
                    + copy.from_offset.y as usize
                    + y)
                    * fw
                    + copy.from_offset.x as usize;
                let dst = ((copy.to_offset.z as usize + z) * th + copy.to_offset.y as usize + y)
                    * tw
                    + copy.to_offset.x as usize;

                {
                    let planes = from.planes.lock();
                    row.copy_from_slice(&planes[from_plane][src * texel..(src + ex) * texel]);
                }
                let mut planes = to.planes.lock();
                planes[to_plane][dst * texel..(dst + ex) * texel].copy_from_slice(&row);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;

    use glam::UVec3;
    use raw_window_handle::{
        DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
    };

    use crate::driver::descriptor::{DescType, Descriptor, Stages};
    use crate::driver::resource::{
        BufferUsage, ImageDescriptor, ImageUsage, ViewDescriptor, ViewKind,
    };
    use crate::driver::sync::{Access, Barrier, Layout, Sync, Transition};
    use crate::driver::{BufImgCopy, BufferCopy, Driver, Error, WorkItem};

    use super::SoftDriver;

    struct Headless;

    impl HasDisplayHandle for Headless {
        fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
            Err(HandleError::NotSupported)
        }
    }

    impl HasWindowHandle for Headless {
        fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
            Err(HandleError::NotSupported)
        }
    }

    #[test]
    fn soft_buffer_copy_and_fill() {
        let gpu = SoftDriver::new().open().unwrap();

        let src = gpu
            .new_buffer(256, true, BufferUsage::COPY_SRC)
            .unwrap();
        let dst = gpu
            .new_buffer(256, true, BufferUsage::COPY_DST)
            .unwrap();

        let data: Vec<u8> = (0..64).collect();
        src.write(64, &data);

        let mut cb = gpu.new_cmd_buffer().unwrap();
        cb.begin().unwrap();
        cb.begin_blit(false);
        cb.fill(&dst, 0, 0xaa, 16);
        cb.copy_buffer(&BufferCopy {
            from: src.clone(),
            from_offset: 64,
            to: dst.clone(),
            to_offset: 128,
            size: 64,
        });
        cb.end_blit();
        cb.end().unwrap();

        let (tx, rx) = mpsc::channel();
        gpu.commit(
            WorkItem {
                work: vec![cb],
                err: None,
            },
            tx,
        )
        .unwrap();

        let item = rx.recv().unwrap();
        assert!(item.err.is_none());

        let mut out = vec![0; 64];
        dst.read(128, &mut out);
        assert_eq!(out, data);

        let mut filled = vec![0; 16];
        dst.read(0, &mut filled);
        assert_eq!(filled, vec![0xaa; 16]);
    }

    #[test]
    fn soft_image_round_trip() {
        let gpu = SoftDriver::new().open().unwrap();

        let image = gpu
            .new_image(&ImageDescriptor {
                format: crate::driver::PixelFormat::RGBA8_UNORM,
                size: UVec3::new(8, 8, 0),
                layers: 2,
                levels: 1,
                samples: 1,
                usage: ImageUsage::COPY_SRC | ImageUsage::COPY_DST,
            })
            .unwrap();

        let n = 8 * 8 * 4;
        let staging = gpu
            .new_buffer(
                2 * n as u64,
                true,
                BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            )
            .unwrap();

        let data: Vec<u8> = (0..n as u32).map(|v| v as u8).collect();
        staging.write(0, &data);

        let mut cb = gpu.new_cmd_buffer().unwrap();
        cb.begin().unwrap();
        cb.transition(&[Transition {
            barrier: Barrier {
                sync_before: Sync::empty(),
                sync_after: Sync::COPY,
                access_before: Access::empty(),
                access_after: Access::COPY_WRITE,
            },
            layout_before: Layout::Undefined,
            layout_after: Layout::CopyDst,
            image: image.clone(),
            layer: 1,
            layers: 1,
            level: 0,
            levels: 1,
        }]);
        cb.begin_blit(false);
        cb.copy_buf_to_img(&BufImgCopy {
            buffer: staging.clone(),
            buffer_offset: 0,
            row_stride: 0,
            slice_stride: 0,
            image: image.clone(),
            image_offset: UVec3::ZERO,
            layer: 1,
            level: 0,
            size: UVec3::new(8, 8, 0),
            depth_copy: false,
        });
        cb.copy_img_to_buf(&BufImgCopy {
            buffer: staging.clone(),
            buffer_offset: n as u64,
            row_stride: 0,
            slice_stride: 0,
            image: image.clone(),
            image_offset: UVec3::ZERO,
            layer: 1,
            level: 0,
            size: UVec3::new(8, 8, 0),
            depth_copy: false,
        });
        cb.end_blit();
        cb.end().unwrap();

        let (tx, rx) = mpsc::channel();
        gpu.commit(
            WorkItem {
                work: vec![cb],
                err: None,
            },
            tx,
        )
        .unwrap();
        assert!(rx.recv().unwrap().err.is_none());

        let mut out = vec![0; n];
        staging.read(n as u64, &mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn soft_batch_order() {
        let gpu = SoftDriver::new().open().unwrap();

        let a = gpu
            .new_buffer(4, true, BufferUsage::COPY_SRC | BufferUsage::COPY_DST)
            .unwrap();
        let b = gpu
            .new_buffer(4, true, BufferUsage::COPY_SRC | BufferUsage::COPY_DST)
            .unwrap();
        a.write(0, &[1, 2, 3, 4]);

        // First buffer copies a -> b, the second fills a; order within
        // the batch must hold.
        let mut cb0 = gpu.new_cmd_buffer().unwrap();
        cb0.begin().unwrap();
        cb0.begin_blit(false);
        cb0.copy_buffer(&BufferCopy {
            from: a.clone(),
            from_offset: 0,
            to: b.clone(),
            to_offset: 0,
            size: 4,
        });
        cb0.end_blit();
        cb0.end().unwrap();

        let mut cb1 = gpu.new_cmd_buffer().unwrap();
        cb1.begin().unwrap();
        cb1.begin_blit(true);
        cb1.fill(&a, 0, 0, 4);
        cb1.end_blit();
        cb1.end().unwrap();

        let (tx, rx) = mpsc::channel();
        gpu.commit(
            WorkItem {
                work: vec![cb0, cb1],
                err: None,
            },
            tx,
        )
        .unwrap();
        assert!(rx.recv().unwrap().err.is_none());

        let mut out = [0; 4];
        b.read(0, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        a.read(0, &mut out);
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn soft_desc_heap_copies() {
        let gpu = SoftDriver::new().open().unwrap();

        let heap = gpu
            .new_desc_heap(&[
                Descriptor {
                    kind: DescType::Constant,
                    stages: Stages::VERTEX | Stages::FRAGMENT,
                    nr: 0,
                    len: 1,
                },
                Descriptor {
                    kind: DescType::Sampler,
                    stages: Stages::FRAGMENT,
                    nr: 1,
                    len: 2,
                },
            ])
            .unwrap();

        assert_eq!(heap.count(), 0);
        heap.resize(3).unwrap();
        assert_eq!(heap.count(), 3);

        let buffer = gpu.new_buffer(512, true, BufferUsage::UNIFORM).unwrap();
        heap.set_buffer(2, 0, 0, &[buffer], &[0], &[256]);

        let sampler = gpu.new_sampler(&Default::default()).unwrap();
        heap.set_sampler(0, 1, 1, &[sampler]);

        // Same count is a no-op, zero frees.
        heap.resize(3).unwrap();
        assert_eq!(heap.count(), 3);
        heap.resize(0).unwrap();
        assert_eq!(heap.count(), 0);
    }

    #[test]
    fn soft_swapchain_backbuffers() {
        let gpu = SoftDriver::new().open().unwrap();
        let presenter = gpu.presenter().expect("soft driver can present");

        let swapchain = presenter.new_swapchain(&Headless, 2).unwrap();
        assert_eq!(swapchain.views().len(), 2);
        assert!(swapchain
            .usage()
            .contains(crate::driver::ImageUsage::RENDER_TARGET));

        let a = swapchain.next().unwrap();
        let b = swapchain.next().unwrap();
        assert_ne!(a, b);
        assert_eq!(swapchain.next(), Err(Error::NoBackbuffer));

        swapchain.present(a).unwrap();
        let c = swapchain.next().unwrap();
        assert_eq!(a, c);

        swapchain.recreate().unwrap();
        swapchain.next().unwrap();
        swapchain.next().unwrap();
    }

    #[test]
    fn soft_dispatch_batch() {
        let gpu = SoftDriver::new().open().unwrap();

        // Storage image written by a dispatch, then read back; the soft
        // driver executes only the copy, so the readback observes zeroes
        // of the right size.
        let image = gpu
            .new_image(&ImageDescriptor {
                format: crate::driver::PixelFormat::RGBA8_UNORM,
                size: UVec3::new(80, 90, 0),
                layers: 1,
                levels: 1,
                samples: 1,
                usage: ImageUsage::STORAGE | ImageUsage::COPY_SRC,
            })
            .unwrap();
        let view = image
            .new_view(&ViewDescriptor {
                kind: ViewKind::D2,
                first_layer: 0,
                layers: 1,
                first_level: 0,
                levels: 1,
            })
            .unwrap();

        let heap = gpu
            .new_desc_heap(&[Descriptor {
                kind: DescType::Image,
                stages: Stages::COMPUTE,
                nr: 0,
                len: 1,
            }])
            .unwrap();
        heap.resize(1).unwrap();
        heap.set_image(0, 0, 0, &[view]);

        let readback = gpu
            .new_buffer(80 * 90 * 4, true, BufferUsage::COPY_DST)
            .unwrap();

        let mut cb0 = gpu.new_cmd_buffer().unwrap();
        cb0.begin().unwrap();
        cb0.transition(&[Transition {
            barrier: Barrier {
                sync_before: Sync::empty(),
                sync_after: Sync::COMPUTE_SHADING,
                access_before: Access::empty(),
                access_after: Access::SHADER_WRITE,
            },
            layout_before: Layout::Undefined,
            layout_after: Layout::ShaderStore,
            image: image.clone(),
            layer: 0,
            layers: 1,
            level: 0,
            levels: 1,
        }]);

        let shader = gpu.new_shader_code(&[0; 16]).unwrap();
        let pipeline = gpu
            .new_pipeline(&crate::driver::PipelineState::Compute(
                crate::driver::CompState {
                    shader: crate::driver::ShaderFn {
                        code: shader,
                        name: "main".to_owned(),
                    },
                    desc: crate::driver::DescTable::new(vec![heap.clone()]),
                },
            ))
            .unwrap();

        cb0.begin_work(false);
        cb0.set_pipeline(&pipeline);
        cb0.set_desc_table_comp(&crate::driver::DescTable::new(vec![heap]), 0, &[0]);
        cb0.dispatch(8, 9, 1);
        cb0.end_work();
        cb0.end().unwrap();

        let mut cb1 = gpu.new_cmd_buffer().unwrap();
        cb1.begin().unwrap();
        cb1.transition(&[Transition {
            barrier: Barrier {
                sync_before: Sync::COMPUTE_SHADING,
                sync_after: Sync::COPY,
                access_before: Access::SHADER_WRITE,
                access_after: Access::COPY_READ,
            },
            layout_before: Layout::ShaderStore,
            layout_after: Layout::CopySrc,
            image: image.clone(),
            layer: 0,
            layers: 1,
            level: 0,
            levels: 1,
        }]);
        cb1.begin_blit(true);
        cb1.copy_img_to_buf(&BufImgCopy {
            buffer: readback.clone(),
            buffer_offset: 0,
            row_stride: 0,
            slice_stride: 0,
            image: image.clone(),
            image_offset: UVec3::ZERO,
            layer: 0,
            level: 0,
            size: UVec3::new(80, 90, 0),
            depth_copy: false,
        });
        cb1.end_blit();
        cb1.end().unwrap();

        let (tx, rx) = mpsc::channel();
        gpu.commit(
            WorkItem {
                work: vec![cb0, cb1],
                err: None,
            },
            tx,
        )
        .unwrap();
        assert!(rx.recv().unwrap().err.is_none());

        let mut out = vec![0xff_u8; 80 * 90 * 4];
        readback.read(0, &mut out);
        assert_eq!(out, vec![0; 80 * 90 * 4]);
    }
}
