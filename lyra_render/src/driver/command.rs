use std::sync::Arc;

use glam::UVec3;

use super::descriptor::DescTable;
use super::format::IndexFormat;
use super::pass::{ClearValue, Framebuf, RenderPass};
use super::pipeline::Pipeline;
use super::resource::{Buffer, BufferUsage, Image, ImageUsage};
use super::sync::{Barrier, Transition};
use super::Error;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub znear: f32,
    pub zfar: f32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Scissor {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A buffer-to-buffer copy region.
#[derive(Clone, Debug)]
pub struct BufferCopy {
    pub from: Arc<dyn Buffer>,
    pub from_offset: u64,
    pub to: Arc<dyn Buffer>,
    pub to_offset: u64,
    pub size: u64,
}

/// An image-to-image copy region.
#[derive(Clone, Debug)]
pub struct ImageCopy {
    pub from: Arc<dyn Image>,
    pub from_offset: UVec3,
    pub from_layer: u32,
    pub from_level: u32,
    pub to: Arc<dyn Image>,
    pub to_offset: UVec3,
    pub to_layer: u32,
    pub to_level: u32,
    pub size: UVec3,
    pub layers: u32,
}

/// A buffer-to-image (or image-to-buffer) copy region.
#[derive(Clone, Debug)]
pub struct BufImgCopy {
    pub buffer: Arc<dyn Buffer>,
    /// Must be a multiple of 512 bytes.
    pub buffer_offset: u64,
    /// Bytes between rows in the buffer; a multiple of 256 bytes.
    pub row_stride: u32,
    /// Bytes between depth slices in the buffer.
    pub slice_stride: u32,
    pub image: Arc<dyn Image>,
    pub image_offset: UVec3,
    pub layer: u32,
    pub level: u32,
    /// Texel extent; `z` is ignored for non-3D images.
    pub size: UVec3,
    /// For combined depth/stencil formats, selects the depth aspect when
    /// set and the stencil aspect when unset.
    pub depth_copy: bool,
}

/// One entry of the backend-neutral command stream.
#[derive(Clone, Debug)]
pub enum Cmd {
    BeginPass {
        pass: Arc<dyn RenderPass>,
        framebuf: Arc<dyn Framebuf>,
        clear: Vec<ClearValue>,
    },
    NextSubpass,
    EndPass,
    BeginWork {
        wait: bool,
    },
    EndWork,
    BeginBlit {
        wait: bool,
    },
    EndBlit,
    SetPipeline(Arc<dyn Pipeline>),
    SetViewport(Vec<Viewport>),
    SetScissor(Vec<Scissor>),
    SetBlendColor([f32; 4]),
    SetStencilRef(u32),
    SetVertexBuf {
        start: u32,
        buffers: Vec<Arc<dyn Buffer>>,
        offsets: Vec<u64>,
    },
    SetIndexBuf {
        format: IndexFormat,
        buffer: Arc<dyn Buffer>,
        offset: u64,
    },
    SetDescTableGraph {
        table: DescTable,
        start: u32,
        copies: Vec<u32>,
    },
    SetDescTableComp {
        table: DescTable,
        start: u32,
        copies: Vec<u32>,
    },
    Draw {
        vert_count: u32,
        inst_count: u32,
        base_vert: u32,
        base_inst: u32,
    },
    DrawIndexed {
        idx_count: u32,
        inst_count: u32,
        base_idx: u32,
        vert_off: i32,
        base_inst: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer(BufferCopy),
    CopyImage(ImageCopy),
    CopyBufToImg(BufImgCopy),
    CopyImgToBuf(BufImgCopy),
    Fill {
        buffer: Arc<dyn Buffer>,
        offset: u64,
        value: u8,
        size: u64,
    },
    Barrier(Vec<Barrier>),
    Transition(Vec<Transition>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Initial,
    Recording,
    InPass,
    InWork,
    InBlit,
    Executable,
    Pending,
}

/// A command buffer.
///
/// Recording is validated by a state machine: [`begin`] starts recording,
/// the `begin_*`/`end_*` pairs delimit the render pass, compute and blit
/// phases, and [`end`] produces an executable buffer that is submitted
/// through [`Gpu::commit`]. Phase mismatches are programming errors and
/// panic.
///
/// The recorded stream is backend-neutral; a driver consumes it through
/// [`commands`] while the buffer is pending.
///
/// [`begin`]: CmdBuffer::begin
/// [`end`]: CmdBuffer::end
/// [`commands`]: CmdBuffer::commands
/// [`Gpu::commit`]: super::Gpu::commit
#[derive(Debug)]
pub struct CmdBuffer {
    state: State,
    cmds: Vec<Cmd>,
    // The remaining fields exist purely for validation.
    has_pipeline: bool,
    has_index_buf: bool,
    subpasses_left: u32,
}

impl CmdBuffer {
    /// Creates a command buffer in the initial state.
    ///
    /// Clients obtain command buffers from [`Gpu::new_cmd_buffer`] instead
    /// of calling this directly.
    ///
    /// [`Gpu::new_cmd_buffer`]: super::Gpu::new_cmd_buffer
    pub fn new() -> Self {
        Self {
            state: State::Initial,
            cmds: Vec::new(),
            has_pipeline: false,
            has_index_buf: false,
            subpasses_left: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Returns `true` if the buffer is in the recording state or any of
    /// its sub-states.
    pub fn is_recording(&self) -> bool {
        matches!(
            self.state,
            State::Recording | State::InPass | State::InWork | State::InBlit
        )
    }

    /// Begins recording.
    pub fn begin(&mut self) -> Result<(), Error> {
        assert_eq!(self.state, State::Initial, "begin: buffer is not initial");
        self.state = State::Recording;
        Ok(())
    }

    /// Ends recording, leaving the buffer executable.
    ///
    /// On failure the buffer is reset to the initial state.
    pub fn end(&mut self) -> Result<(), Error> {
        assert_eq!(
            self.state,
            State::Recording,
            "end: recording phase not terminated",
        );
        self.state = State::Executable;
        Ok(())
    }

    /// Discards all recorded commands and returns to the initial state.
    ///
    /// Panics when called on an executable or pending buffer.
    pub fn reset(&mut self) {
        assert!(
            !matches!(self.state, State::Executable | State::Pending),
            "reset: buffer is {:?}",
            self.state,
        );
        self.clear();
    }

    fn clear(&mut self) {
        self.state = State::Initial;
        self.cmds.clear();
        self.has_pipeline = false;
        self.has_index_buf = false;
        self.subpasses_left = 0;
    }

    /// The recorded command stream.
    pub fn commands(&self) -> &[Cmd] {
        &self.cmds
    }

    /// Marks an executable buffer as accepted for execution.
    ///
    /// Called by drivers when a batch is committed.
    pub fn mark_pending(&mut self) {
        assert_eq!(
            self.state,
            State::Executable,
            "commit: buffer is not executable",
        );
        self.state = State::Pending;
    }

    /// Returns a pending buffer to the initial state.
    ///
    /// Called by drivers when the batch containing the buffer completes.
    pub fn mark_complete(&mut self) {
        assert_eq!(self.state, State::Pending);
        self.clear();
    }

    /// Begins the render pass phase.
    pub fn begin_pass(
        &mut self,
        pass: &Arc<dyn RenderPass>,
        framebuf: &Arc<dyn Framebuf>,
        clear: &[ClearValue],
    ) {
        assert_eq!(self.state, State::Recording, "begin_pass: phase mismatch");
        self.state = State::InPass;
        self.subpasses_left = pass.subpasses().len() as u32 - 1;
        self.cmds.push(Cmd::BeginPass {
            pass: pass.clone(),
            framebuf: framebuf.clone(),
            clear: clear.to_vec(),
        });
    }

    pub fn next_subpass(&mut self) {
        assert_eq!(self.state, State::InPass, "next_subpass: phase mismatch");
        assert!(self.subpasses_left > 0, "next_subpass: no subpasses left");
        self.subpasses_left -= 1;
        self.cmds.push(Cmd::NextSubpass);
    }

    pub fn end_pass(&mut self) {
        assert_eq!(self.state, State::InPass, "end_pass: phase mismatch");
        self.state = State::Recording;
        self.cmds.push(Cmd::EndPass);
    }

    /// Begins the compute phase.
    ///
    /// With `wait` set, execution waits for all previously recorded work
    /// in this buffer and in preceding buffers of the same batch.
    pub fn begin_work(&mut self, wait: bool) {
        assert_eq!(self.state, State::Recording, "begin_work: phase mismatch");
        self.state = State::InWork;
        self.cmds.push(Cmd::BeginWork { wait });
    }

    pub fn end_work(&mut self) {
        assert_eq!(self.state, State::InWork, "end_work: phase mismatch");
        self.state = State::Recording;
        self.cmds.push(Cmd::EndWork);
    }

    /// Begins the blit (transfer) phase.
    pub fn begin_blit(&mut self, wait: bool) {
        assert_eq!(self.state, State::Recording, "begin_blit: phase mismatch");
        self.state = State::InBlit;
        self.cmds.push(Cmd::BeginBlit { wait });
    }

    pub fn end_blit(&mut self) {
        assert_eq!(self.state, State::InBlit, "end_blit: phase mismatch");
        self.state = State::Recording;
        self.cmds.push(Cmd::EndBlit);
    }

    pub fn set_pipeline(&mut self, pipeline: &Arc<dyn Pipeline>) {
        assert!(self.is_recording(), "set_pipeline: not recording");
        self.has_pipeline = true;
        self.cmds.push(Cmd::SetPipeline(pipeline.clone()));
    }

    pub fn set_viewport(&mut self, viewports: &[Viewport]) {
        assert!(
            matches!(self.state, State::Recording | State::InPass),
            "set_viewport: phase mismatch",
        );
        self.cmds.push(Cmd::SetViewport(viewports.to_vec()));
    }

    pub fn set_scissor(&mut self, scissors: &[Scissor]) {
        assert!(
            matches!(self.state, State::Recording | State::InPass),
            "set_scissor: phase mismatch",
        );
        self.cmds.push(Cmd::SetScissor(scissors.to_vec()));
    }

    pub fn set_blend_color(&mut self, color: [f32; 4]) {
        assert!(
            matches!(self.state, State::Recording | State::InPass),
            "set_blend_color: phase mismatch",
        );
        self.cmds.push(Cmd::SetBlendColor(color));
    }

    pub fn set_stencil_ref(&mut self, reference: u32) {
        assert!(
            matches!(self.state, State::Recording | State::InPass),
            "set_stencil_ref: phase mismatch",
        );
        self.cmds.push(Cmd::SetStencilRef(reference));
    }

    /// Binds vertex buffers to consecutive input slots starting at
    /// `start`.
    ///
    /// Each offset must be aligned to the component size of the vertex
    /// input format bound at that slot; backends may check this.
    pub fn set_vertex_buf(&mut self, start: u32, buffers: &[Arc<dyn Buffer>], offsets: &[u64]) {
        assert!(
            matches!(self.state, State::Recording | State::InPass),
            "set_vertex_buf: phase mismatch",
        );
        assert_eq!(buffers.len(), offsets.len());
        for buffer in buffers {
            assert!(
                buffer.usage().contains(BufferUsage::VERTEX),
                "buffer cannot be used as vertex buffer: VERTEX not set",
            );
        }

        self.cmds.push(Cmd::SetVertexBuf {
            start,
            buffers: buffers.to_vec(),
            offsets: offsets.to_vec(),
        });
    }

    pub fn set_index_buf(&mut self, format: IndexFormat, buffer: &Arc<dyn Buffer>, offset: u64) {
        assert!(
            matches!(self.state, State::Recording | State::InPass),
            "set_index_buf: phase mismatch",
        );
        assert!(
            buffer.usage().contains(BufferUsage::INDEX),
            "buffer cannot be used as index buffer: INDEX not set",
        );
        assert_eq!(offset % 4, 0, "index buffer offset must be 4-byte aligned");

        self.has_index_buf = true;
        self.cmds.push(Cmd::SetIndexBuf {
            format,
            buffer: buffer.clone(),
            offset,
        });
    }

    /// Binds a contiguous range of the table's heaps for graphics,
    /// starting at set `start`; `copies[i]` selects which copy of heap
    /// `start + i` to bind.
    pub fn set_desc_table_graph(&mut self, table: &DescTable, start: u32, copies: &[u32]) {
        assert!(
            matches!(self.state, State::Recording | State::InPass),
            "set_desc_table_graph: phase mismatch",
        );
        Self::check_desc_range(table, start, copies);
        self.cmds.push(Cmd::SetDescTableGraph {
            table: table.clone(),
            start,
            copies: copies.to_vec(),
        });
    }

    /// Binds a contiguous range of the table's heaps for compute.
    pub fn set_desc_table_comp(&mut self, table: &DescTable, start: u32, copies: &[u32]) {
        assert!(
            matches!(self.state, State::Recording | State::InWork),
            "set_desc_table_comp: phase mismatch",
        );
        Self::check_desc_range(table, start, copies);
        self.cmds.push(Cmd::SetDescTableComp {
            table: table.clone(),
            start,
            copies: copies.to_vec(),
        });
    }

    fn check_desc_range(table: &DescTable, start: u32, copies: &[u32]) {
        let end = start as usize + copies.len();
        assert!(end <= table.len(), "descriptor set range out of bounds");
        for (i, &copy) in copies.iter().enumerate() {
            let heap = table.heap(start as usize + i);
            assert!(
                (copy as usize) < heap.count(),
                "heap copy {} out of bounds ({} allocated)",
                copy,
                heap.count(),
            );
        }
    }

    pub fn draw(&mut self, vert_count: u32, inst_count: u32, base_vert: u32, base_inst: u32) {
        assert_eq!(self.state, State::InPass, "draw: not in render pass");
        assert!(self.has_pipeline, "draw: pipeline is not set");

        self.cmds.push(Cmd::Draw {
            vert_count,
            inst_count,
            base_vert,
            base_inst,
        });
    }

    pub fn draw_indexed(
        &mut self,
        idx_count: u32,
        inst_count: u32,
        base_idx: u32,
        vert_off: i32,
        base_inst: u32,
    ) {
        assert_eq!(self.state, State::InPass, "draw_indexed: not in render pass");
        assert!(self.has_pipeline, "draw_indexed: pipeline is not set");
        assert!(self.has_index_buf, "draw_indexed: index buffer is not set");

        self.cmds.push(Cmd::DrawIndexed {
            idx_count,
            inst_count,
            base_idx,
            vert_off,
            base_inst,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        assert_eq!(self.state, State::InWork, "dispatch: not in compute phase");
        assert!(self.has_pipeline, "dispatch: pipeline is not set");

        self.cmds.push(Cmd::Dispatch { x, y, z });
    }

    pub fn copy_buffer(&mut self, copy: &BufferCopy) {
        assert_eq!(self.state, State::InBlit, "copy_buffer: not in blit phase");
        assert!(
            copy.from.usage().contains(BufferUsage::COPY_SRC),
            "buffer cannot be read from: COPY_SRC not set",
        );
        assert!(
            copy.to.usage().contains(BufferUsage::COPY_DST),
            "buffer cannot be written to: COPY_DST not set",
        );
        assert!(copy.from_offset + copy.size <= copy.from.size());
        assert!(copy.to_offset + copy.size <= copy.to.size());

        self.cmds.push(Cmd::CopyBuffer(copy.clone()));
    }

    pub fn copy_image(&mut self, copy: &ImageCopy) {
        assert_eq!(self.state, State::InBlit, "copy_image: not in blit phase");
        assert!(
            copy.from.usage().contains(ImageUsage::COPY_SRC),
            "image cannot be read from: COPY_SRC not set",
        );
        assert!(
            copy.to.usage().contains(ImageUsage::COPY_DST),
            "image cannot be written to: COPY_DST not set",
        );
        assert!(copy.from_layer + copy.layers <= copy.from.layers());
        assert!(copy.to_layer + copy.layers <= copy.to.layers());
        assert!(copy.from_level < copy.from.levels());
        assert!(copy.to_level < copy.to.levels());

        self.cmds.push(Cmd::CopyImage(copy.clone()));
    }

    pub fn copy_buf_to_img(&mut self, copy: &BufImgCopy) {
        assert_eq!(
            self.state,
            State::InBlit,
            "copy_buf_to_img: not in blit phase",
        );
        assert!(
            copy.buffer.usage().contains(BufferUsage::COPY_SRC),
            "buffer cannot be read from: COPY_SRC not set",
        );
        assert!(
            copy.image.usage().contains(ImageUsage::COPY_DST),
            "image cannot be written to: COPY_DST not set",
        );
        Self::check_buf_img(copy);

        self.cmds.push(Cmd::CopyBufToImg(copy.clone()));
    }

    pub fn copy_img_to_buf(&mut self, copy: &BufImgCopy) {
        assert_eq!(
            self.state,
            State::InBlit,
            "copy_img_to_buf: not in blit phase",
        );
        assert!(
            copy.image.usage().contains(ImageUsage::COPY_SRC),
            "image cannot be read from: COPY_SRC not set",
        );
        assert!(
            copy.buffer.usage().contains(BufferUsage::COPY_DST),
            "buffer cannot be written to: COPY_DST not set",
        );
        Self::check_buf_img(copy);

        self.cmds.push(Cmd::CopyImgToBuf(copy.clone()));
    }

    fn check_buf_img(copy: &BufImgCopy) {
        assert_eq!(
            copy.buffer_offset % 512,
            0,
            "buffer offset must be 512-byte aligned",
        );
        assert_eq!(
            copy.row_stride % 256,
            0,
            "row stride must be 256-byte aligned",
        );
        assert!(copy.layer < copy.image.layers());
        assert!(copy.level < copy.image.levels());
        assert!(
            !copy.depth_copy || copy.image.format().has_depth(),
            "depth_copy selected on a format without a depth aspect",
        );
    }

    /// Fills a buffer range with a byte value.
    ///
    /// `offset` and `size` must be multiples of 4.
    pub fn fill(&mut self, buffer: &Arc<dyn Buffer>, offset: u64, value: u8, size: u64) {
        assert_eq!(self.state, State::InBlit, "fill: not in blit phase");
        assert!(
            buffer.usage().contains(BufferUsage::COPY_DST),
            "buffer cannot be written to: COPY_DST not set",
        );
        assert_eq!(offset % 4, 0, "fill offset must be a multiple of 4");
        assert_eq!(size % 4, 0, "fill size must be a multiple of 4");
        assert!(offset + size <= buffer.size());

        self.cmds.push(Cmd::Fill {
            buffer: buffer.clone(),
            offset,
            value,
            size,
        });
    }

    /// Inserts global execution/memory dependencies.
    pub fn barrier(&mut self, barriers: &[Barrier]) {
        assert_eq!(self.state, State::Recording, "barrier: phase mismatch");
        self.cmds.push(Cmd::Barrier(barriers.to_vec()));
    }

    /// Inserts per-image layout transitions.
    pub fn transition(&mut self, transitions: &[Transition]) {
        assert_eq!(self.state, State::Recording, "transition: phase mismatch");
        for t in transitions {
            assert!(t.layer + t.layers <= t.image.layers());
            assert!(t.level + t.levels <= t.image.levels());
        }
        self.cmds.push(Cmd::Transition(transitions.to_vec()));
    }
}

impl Default for CmdBuffer {
    fn default() -> Self {
        Self::new()
    }
}
