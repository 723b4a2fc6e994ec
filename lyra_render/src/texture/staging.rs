//! CPU↔GPU staging buffers and the process-wide pool.
//!
//! A staging buffer is a host-visible GPU buffer carved into 128 KiB
//! blocks plus one command buffer accumulating deferred copies. The pool
//! holds one buffer per hardware thread; taking a buffer out of the pool
//! is the exclusive capability to use it.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use lyra_common::collections::Bitmap;
use parking_lot::{Condvar, Mutex};
use tracing::trace_span;

use crate::driver::{Buffer, BufferUsage, CmdBuffer, Error, Gpu, WorkItem};

/// Size of one staging block.
pub(crate) const BLOCK_SIZE: u64 = 131_072;

/// Blocks per bitmap word.
const WORD_BLOCKS: u64 = 32;

/// Bytes per bitmap word worth of blocks.
const WORD_BYTES: u64 = WORD_BLOCKS * BLOCK_SIZE;

#[derive(Debug)]
pub struct StagingBuffer {
    gpu: Arc<dyn Gpu>,
    buffer: Arc<dyn Buffer>,
    map: Bitmap<u32>,
    /// Taken while a commit is in flight.
    cb: Option<CmdBuffer>,
    pending: bool,
    done: Sender<WorkItem>,
    completed: Receiver<WorkItem>,
}

impl StagingBuffer {
    /// Creates a staging buffer of `words` bitmap words (4 MiB each).
    pub fn new(gpu: &Arc<dyn Gpu>, words: usize) -> Result<Self, Error> {
        assert!(words >= 1);

        let buffer = gpu.new_buffer(
            words as u64 * WORD_BYTES,
            true,
            BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        )?;
        let mut map = Bitmap::new();
        map.grow(words);

        let cb = gpu.new_cmd_buffer()?;
        let (done, completed) = mpsc::channel();

        Ok(Self {
            gpu: gpu.clone(),
            buffer,
            map,
            cb: Some(cb),
            pending: false,
            done,
            completed,
        })
    }

    pub fn buffer(&self) -> &Arc<dyn Buffer> {
        &self.buffer
    }

    /// Copies `data` into reserved staging space and returns its byte
    /// offset.
    pub fn stage(&mut self, data: &[u8]) -> Result<u64, Error> {
        let offset = self.reserve(data.len() as u64)?;
        self.buffer.write(offset, data);
        Ok(offset)
    }

    /// Reserves `n` bytes of block-aligned staging space.
    ///
    /// When no contiguous run fits, outstanding copies are committed
    /// first; if that is still not enough the buffer is replaced by a
    /// larger one. A failed replacement leaves the staging buffer empty.
    pub fn reserve(&mut self, n: u64) -> Result<u64, Error> {
        let blocks = (n.div_ceil(BLOCK_SIZE) as usize).max(1);

        if let Some(start) = self.map.search_range(blocks) {
            return Ok(self.mark(start, blocks));
        }

        // Drain outstanding copies; everything staged so far is released.
        self.commit()?;
        if let Some(start) = self.map.search_range(blocks) {
            return Ok(self.mark(start, blocks));
        }

        // Free blocks at the tail extend into the new region.
        let mut tail_free = 0;
        while tail_free < self.map.len() && !self.map.is_set(self.map.len() - 1 - tail_free) {
            tail_free += 1;
        }

        let words = (blocks - tail_free).div_ceil(WORD_BLOCKS as usize);
        let new_size = self.buffer.size() + words as u64 * WORD_BYTES;
        tracing::debug!(new_size, "growing staging buffer");

        match self.gpu.new_buffer(
            new_size,
            true,
            BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        ) {
            Ok(buffer) => {
                self.buffer = buffer;
                self.map.grow(words);
            }
            Err(err) => {
                self.map.clear();
                return Err(err);
            }
        }

        let start = self.map.search_range(blocks).unwrap();
        Ok(self.mark(start, blocks))
    }

    fn mark(&mut self, start: usize, blocks: usize) -> u64 {
        for i in start..start + blocks {
            self.map.set(i);
        }
        start as u64 * BLOCK_SIZE
    }

    /// Copies bytes back out of the buffer and releases the blocks under
    /// them.
    ///
    /// The caller must have committed and waited for the read-back copy.
    pub fn unstage(&mut self, offset: u64, dst: &mut [u8]) {
        self.buffer.read(offset, dst);

        let first = (offset / BLOCK_SIZE) as usize;
        let blocks = (dst.len() as u64).div_ceil(BLOCK_SIZE) as usize;
        for i in first..(first + blocks).min(self.map.len()) {
            self.map.unset(i);
        }
    }

    /// Records deferred work into the staging command buffer.
    pub fn record<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut CmdBuffer),
    {
        let cb = self.cb.as_mut().unwrap();
        if !cb.is_recording() {
            cb.begin()?;
        }
        f(cb);
        self.pending = true;
        Ok(())
    }

    /// Submits the accumulated copies and blocks until they complete.
    ///
    /// A no-op when nothing is outstanding. All blocks are considered
    /// released once the copies executed.
    pub fn commit(&mut self) -> Result<(), Error> {
        if !self.pending {
            return Ok(());
        }
        let _span = trace_span!("StagingBuffer::commit").entered();

        self.map.clear();
        self.pending = false;

        let mut cb = self.cb.take().unwrap();
        if let Err(err) = cb.end() {
            // End failure resets the buffer to initial.
            self.cb = Some(cb);
            return Err(err);
        }

        self.gpu.commit(
            WorkItem {
                work: vec![cb],
                err: None,
            },
            self.done.clone(),
        )?;

        let mut item = self.completed.recv().map_err(|_| Error::Fatal)?;
        self.cb = Some(item.work.pop().unwrap());

        match item.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Pool {
    bufs: Vec<StagingBuffer>,
    total: usize,
}

static POOL: Mutex<Pool> = Mutex::new(Pool {
    bufs: Vec::new(),
    total: 0,
});
static AVAILABLE: Condvar = Condvar::new();

/// Initializes the process-wide staging pool with one buffer per
/// hardware thread, replacing any previous pool.
pub fn init(gpu: &Arc<dyn Gpu>) -> Result<(), Error> {
    let n = thread::available_parallelism().map_or(1, |n| n.get());

    let mut bufs = Vec::with_capacity(n);
    for _ in 0..n {
        bufs.push(StagingBuffer::new(gpu, 1)?);
    }

    let mut pool = POOL.lock();
    pool.total = bufs.len();
    pool.bufs = bufs;
    Ok(())
}

/// Drops the process-wide staging pool.
///
/// Must only be called while no staging buffer is taken.
pub fn reset() {
    let mut pool = POOL.lock();
    pool.bufs.clear();
    pool.total = 0;
}

/// Takes a staging buffer out of the pool, blocking until one is
/// available.
///
/// Panics if the pool was never initialized.
pub(crate) fn take() -> StagingBuffer {
    let mut pool = POOL.lock();
    assert!(pool.total > 0, "staging pool is not initialized");

    loop {
        if let Some(buf) = pool.bufs.pop() {
            return buf;
        }
        AVAILABLE.wait(&mut pool);
    }
}

pub(crate) fn put(buf: StagingBuffer) {
    let mut pool = POOL.lock();
    pool.bufs.push(buf);
    AVAILABLE.notify_one();
}

/// Commits the outstanding copies of every pooled staging buffer.
pub fn flush() -> Result<(), Error> {
    let mut taken = Vec::new();
    {
        let mut pool = POOL.lock();
        taken.append(&mut pool.bufs);
    }

    let mut result = Ok(());
    for mut buf in taken {
        if let Err(err) = buf.commit() {
            result = Err(err);
        }
        put(buf);
    }
    result
}

#[cfg(test)]
mod tests {
    use crate::driver::soft::SoftDriver;
    use crate::driver::{BufferCopy, Driver};

    use super::{StagingBuffer, BLOCK_SIZE, WORD_BYTES};

    #[test]
    fn staging_stage_and_unstage() {
        let gpu = SoftDriver::new().open().unwrap();
        let mut staging = StagingBuffer::new(&gpu, 1).unwrap();

        let data = vec![7_u8; 100];
        let offset = staging.stage(&data).unwrap();
        assert_eq!(offset % BLOCK_SIZE, 0);
        assert_eq!(staging.map.rem(), staging.map.len() - 1);

        let mut out = vec![0; 100];
        staging.unstage(offset, &mut out);
        assert_eq!(out, data);
        assert_eq!(staging.map.rem(), staging.map.len());
    }

    #[test]
    fn staging_reserve_block_granularity() {
        let gpu = SoftDriver::new().open().unwrap();
        let mut staging = StagingBuffer::new(&gpu, 1).unwrap();

        let a = staging.reserve(1).unwrap();
        let b = staging.reserve(BLOCK_SIZE + 1).unwrap();
        let c = staging.reserve(1).unwrap();

        assert_eq!(a, 0);
        assert_eq!(b, BLOCK_SIZE);
        assert_eq!(c, 3 * BLOCK_SIZE);
    }

    #[test]
    fn staging_commit_drains_and_grows() {
        let gpu = SoftDriver::new().open().unwrap();
        let mut staging = StagingBuffer::new(&gpu, 1).unwrap();
        assert_eq!(staging.buffer.size(), WORD_BYTES);

        // Fill the whole buffer, record a copy, then reserve more: the
        // commit drains the outstanding work and frees every block.
        let offset = staging.reserve(WORD_BYTES).unwrap();
        assert_eq!(offset, 0);

        let scratch = gpu
            .new_buffer(64, true, crate::driver::BufferUsage::COPY_DST)
            .unwrap();
        let src = staging.buffer().clone();
        staging
            .record(|cb| {
                cb.begin_blit(false);
                cb.copy_buffer(&BufferCopy {
                    from: src,
                    from_offset: 0,
                    to: scratch.clone(),
                    to_offset: 0,
                    size: 64,
                });
                cb.end_blit();
            })
            .unwrap();

        let offset = staging.reserve(BLOCK_SIZE).unwrap();
        assert_eq!(offset, 0);
        assert!(!staging.pending);
        assert_eq!(staging.buffer.size(), WORD_BYTES);

        // Without outstanding work a too-large reservation grows the
        // buffer instead.
        let offset = staging.reserve(2 * WORD_BYTES).unwrap();
        assert_eq!(staging.buffer.size(), 3 * WORD_BYTES);
        assert_eq!(offset % BLOCK_SIZE, 0);
    }

    #[test]
    fn staging_commit_without_work() {
        let gpu = SoftDriver::new().open().unwrap();
        let mut staging = StagingBuffer::new(&gpu, 1).unwrap();
        staging.commit().unwrap();
        staging.commit().unwrap();
    }
}
