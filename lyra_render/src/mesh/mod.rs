//! Mesh storage.
//!
//! All meshes share one host-visible GPU buffer. The buffer is divided
//! into 512-byte blocks tracked by a bitmap; every primitive's vertex and
//! index data lives in block-aligned spans of that buffer, converted to
//! the canonical engine format of its semantic on ingest.
//!
//! The process-wide storage is set up with [`init`] and replaced with
//! [`set_buffer`]; [`Mesh::new`] ingests [`Data`] into it.

mod convert;

use std::sync::Arc;

use bitflags::bitflags;
use lyra_common::collections::Bitmap;
use parking_lot::RwLock;
use slab::Slab;
use thiserror::Error;
use tracing::trace_span;

use crate::driver::{
    self, Buffer, BufferUsage, CmdBuffer, Gpu, IndexFormat, Topology, VertexFormat, VertexInput,
};

/// Block granularity of the shared buffer.
const BLOCK_SIZE: u64 = 512;

/// Blocks per bitmap word.
const WORD_BLOCKS: u64 = 32;

/// Capacity granularity: one bitmap word worth of blocks.
const GRAIN: u64 = WORD_BLOCKS * BLOCK_SIZE;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("mesh storage is not initialized")]
    Uninitialized,
    #[error("mesh data has no primitives")]
    NoPrimitives,
    #[error("primitive {0} has no position")]
    NoPosition(usize),
    #[error("count {count} does not satisfy topology {topology:?}")]
    InvalidCount { topology: Topology, count: u32 },
    #[error("source reference out of bounds")]
    InvalidSource,
    #[error("unsupported vertex format {format:?} for {semantic:?}")]
    UnsupportedFormat {
        semantic: Semantic,
        format: VertexFormat,
    },
    #[error(transparent)]
    Driver(#[from] driver::Error),
}

/// Vertex attribute channels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Semantic {
    Position = 0,
    Normal,
    Tangent,
    TexCoord0,
    TexCoord1,
    Color0,
    Joints0,
    Weights0,
}

impl Semantic {
    pub const ALL: [Self; 8] = [
        Self::Position,
        Self::Normal,
        Self::Tangent,
        Self::TexCoord0,
        Self::TexCoord1,
        Self::Color0,
        Self::Joints0,
        Self::Weights0,
    ];

    /// The semantic's bit position, used as the vertex input number.
    pub const fn nr(self) -> u32 {
        self as u32
    }

    pub const fn mask(self) -> SemanticMask {
        SemanticMask::from_bits_truncate(1 << self as u32)
    }

    /// The canonical engine format the semantic is stored in.
    pub const fn format(self) -> VertexFormat {
        match self {
            Self::Position | Self::Normal => VertexFormat::Float32x3,
            Self::Tangent => VertexFormat::Float32x4,
            Self::TexCoord0 | Self::TexCoord1 => VertexFormat::Float32x2,
            Self::Color0 => VertexFormat::Float32x4,
            Self::Joints0 => VertexFormat::Uint16x4,
            Self::Weights0 => VertexFormat::Float32x4,
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SemanticMask: u32 {
        const POSITION = 1 << 0;
        const NORMAL = 1 << 1;
        const TANGENT = 1 << 2;
        const TEX_COORD0 = 1 << 3;
        const TEX_COORD1 = 1 << 4;
        const COLOR0 = 1 << 5;
        const JOINTS0 = 1 << 6;
        const WEIGHTS0 = 1 << 7;
    }
}

/// A byte buffer vertex and index data is read from.
#[derive(Clone, Debug, Default)]
pub struct Source {
    pub data: Vec<u8>,
}

impl Source {
    /// Creates a source from a slice of plain values.
    pub fn from_pod<T: bytemuck::NoUninit>(values: &[T]) -> Self {
        Self {
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }
}

/// One vertex attribute of a primitive, referencing a [`Source`].
#[derive(Copy, Clone, Debug)]
pub struct Attribute {
    pub semantic: Semantic,
    pub format: VertexFormat,
    pub source: usize,
    pub offset: u64,
}

/// Index data of a primitive, referencing a [`Source`].
#[derive(Copy, Clone, Debug)]
pub struct IndexData {
    pub format: IndexFormat,
    pub count: u32,
    pub source: usize,
    pub offset: u64,
}

#[derive(Clone, Debug)]
pub struct PrimitiveData {
    pub topology: Topology,
    pub vertex_count: u32,
    pub attributes: Vec<Attribute>,
    pub indices: Option<IndexData>,
}

/// Mesh data to be ingested by [`Mesh::new`].
#[derive(Clone, Debug, Default)]
pub struct Data {
    pub sources: Vec<Source>,
    pub primitives: Vec<PrimitiveData>,
}

/// A block-aligned range [start, end) of the shared buffer, in blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn blocks(&self) -> usize {
        self.end - self.start
    }

    fn byte_offset(&self) -> u64 {
        self.start as u64 * BLOCK_SIZE
    }
}

#[derive(Clone, Debug)]
struct Primitive {
    topology: Topology,
    /// Index count if indexed, vertex count otherwise.
    count: u32,
    vertex_count: u32,
    mask: SemanticMask,
    attributes: [Option<(VertexFormat, Span)>; 8],
    indices: Option<(IndexFormat, Span)>,
    next: Option<usize>,
}

/// The shared mesh buffer allocator.
///
/// The process-wide instance behind [`init`] serves [`Mesh`]; tests and
/// embedders may hold their own.
#[derive(Debug)]
pub struct MeshBuffer {
    gpu: Arc<dyn Gpu>,
    buffer: Arc<dyn Buffer>,
    map: Bitmap<u32>,
    prims: Slab<Primitive>,
}

impl MeshBuffer {
    /// Creates an allocator over a fresh buffer of `capacity` bytes.
    ///
    /// `capacity` must be a positive multiple of 16 384.
    pub fn new(gpu: &Arc<dyn Gpu>, capacity: u64) -> Result<Self, Error> {
        assert_ne!(capacity, 0);
        assert_eq!(capacity % GRAIN, 0, "capacity must be a multiple of 16384");

        let buffer = gpu.new_buffer(capacity, true, Self::usage())?;
        let mut map = Bitmap::new();
        map.grow((capacity / GRAIN) as usize);

        Ok(Self {
            gpu: gpu.clone(),
            buffer,
            map,
            prims: Slab::new(),
        })
    }

    const fn usage() -> BufferUsage {
        BufferUsage::VERTEX
            .union(BufferUsage::INDEX)
            .union(BufferUsage::COPY_SRC)
            .union(BufferUsage::COPY_DST)
    }

    /// Replaces the backing buffer.
    ///
    /// Every previously created [`Mesh`] handle is invalidated; the
    /// caller must not use them afterwards.
    pub fn set_buffer(&mut self, buffer: Arc<dyn Buffer>) {
        assert!(buffer.visible(), "mesh buffer must be host-visible");
        assert!(
            buffer
                .usage()
                .contains(BufferUsage::VERTEX | BufferUsage::INDEX),
            "mesh buffer must allow vertex and index data",
        );
        assert_eq!(buffer.size() % GRAIN, 0, "capacity must be a multiple of 16384");

        self.map = Bitmap::new();
        self.map.grow((buffer.size() / GRAIN) as usize);
        self.buffer = buffer;
        self.prims.clear();
    }

    pub fn buffer(&self) -> &Arc<dyn Buffer> {
        &self.buffer
    }

    /// Allocates a block-aligned span of at least `bytes` bytes, growing
    /// the backing buffer if no contiguous run fits.
    fn alloc_span(&mut self, bytes: u64) -> Result<Span, Error> {
        let blocks = (bytes.div_ceil(BLOCK_SIZE) as usize).max(1);

        let start = match self.map.search_range(blocks) {
            Some(start) => start,
            None => {
                self.grow(blocks)?;
                self.map.search_range(blocks).unwrap()
            }
        };

        for i in start..start + blocks {
            self.map.set(i);
        }

        Ok(Span {
            start,
            end: start + blocks,
        })
    }

    /// Grows the backing buffer so that a run of `blocks` free blocks
    /// exists, by the minimal number of whole bitmap words.
    fn grow(&mut self, blocks: usize) -> Result<(), Error> {
        let _span = trace_span!("MeshBuffer::grow").entered();

        // Free blocks at the tail extend into the new region.
        let mut tail_free = 0;
        while tail_free < self.map.len() && !self.map.is_set(self.map.len() - 1 - tail_free) {
            tail_free += 1;
        }

        let words = (blocks - tail_free).div_ceil(WORD_BLOCKS as usize);
        let old_size = self.buffer.size();
        let new_size = old_size + words as u64 * GRAIN;
        tracing::debug!(old_size, new_size, "growing mesh buffer");

        let buffer = self.gpu.new_buffer(new_size, true, Self::usage())?;

        let mut contents = vec![0; old_size as usize];
        self.buffer.read(0, &mut contents);
        buffer.write(0, &contents);

        self.buffer = buffer;
        self.map.grow(words);
        Ok(())
    }

    fn free_span(&mut self, span: Span) {
        for i in span.start..span.end {
            self.map.unset(i);
        }
    }

    /// Ingests `data` into the shared buffer.
    ///
    /// On any error all spans allocated by this call are released.
    pub fn new_mesh(&mut self, data: &Data) -> Result<Mesh, Error> {
        let _span = trace_span!("MeshBuffer::new_mesh").entered();

        self.validate(data)?;

        let mut spans = Vec::new();
        let mut entries = Vec::new();
        match self.ingest(data, &mut spans, &mut entries) {
            Ok(head) => Ok(Mesh {
                head,
                count: data.primitives.len(),
            }),
            Err(err) => {
                for span in spans {
                    self.free_span(span);
                }
                for key in entries {
                    self.prims.remove(key);
                }
                Err(err)
            }
        }
    }

    fn validate(&self, data: &Data) -> Result<(), Error> {
        if data.primitives.is_empty() {
            return Err(Error::NoPrimitives);
        }

        for (i, prim) in data.primitives.iter().enumerate() {
            if !prim
                .attributes
                .iter()
                .any(|a| a.semantic == Semantic::Position)
            {
                return Err(Error::NoPosition(i));
            }

            let count = prim.indices.map_or(prim.vertex_count, |idx| idx.count);
            if !prim.topology.valid_count(count) {
                return Err(Error::InvalidCount {
                    topology: prim.topology,
                    count,
                });
            }

            for attr in &prim.attributes {
                let size = prim.vertex_count as u64 * attr.format.size() as u64;
                if !source_in_bounds(data, attr.source, attr.offset, size) {
                    return Err(Error::InvalidSource);
                }
            }

            if let Some(idx) = prim.indices {
                let size = idx.count as u64 * idx.format.size() as u64;
                if !source_in_bounds(data, idx.source, idx.offset, size) {
                    return Err(Error::InvalidSource);
                }
            }
        }

        Ok(())
    }

    fn ingest(
        &mut self,
        data: &Data,
        spans: &mut Vec<Span>,
        entries: &mut Vec<usize>,
    ) -> Result<usize, Error> {
        let mut head = None;
        let mut prev: Option<usize> = None;

        for prim in &data.primitives {
            let mut entry = Primitive {
                topology: prim.topology,
                count: prim.indices.map_or(prim.vertex_count, |idx| idx.count),
                vertex_count: prim.vertex_count,
                mask: SemanticMask::empty(),
                attributes: [None; 8],
                indices: None,
                next: None,
            };

            if let Some(idx) = prim.indices {
                let size = idx.count as u64 * idx.format.size() as u64;
                let span = self.alloc_span(size)?;
                spans.push(span);

                let offset = idx.offset as usize;
                let src = &data.sources[idx.source].data[offset..offset + size as usize];
                self.buffer.write(span.byte_offset(), src);
                entry.indices = Some((idx.format, span));
            }

            for attr in &prim.attributes {
                assert!(
                    !entry.mask.contains(attr.semantic.mask()),
                    "duplicate semantic {:?}",
                    attr.semantic,
                );

                let size = prim.vertex_count as usize * attr.format.size() as usize;
                let offset = attr.offset as usize;
                let src = &data.sources[attr.source].data[offset..offset + size];

                let converted =
                    convert::convert(attr.semantic, attr.format, src, prim.vertex_count as usize)?;

                let span = self.alloc_span(converted.len() as u64)?;
                spans.push(span);
                self.buffer.write(span.byte_offset(), &converted);

                entry.attributes[attr.semantic as usize] = Some((attr.semantic.format(), span));
                entry.mask |= attr.semantic.mask();
            }

            let key = self.prims.insert(entry);
            entries.push(key);

            if let Some(prev) = prev {
                self.prims[prev].next = Some(key);
            }
            head.get_or_insert(key);
            prev = Some(key);
        }

        Ok(head.unwrap())
    }

    /// Releases every span of the mesh's primitive chain.
    pub fn free_mesh(&mut self, mesh: &Mesh) {
        let mut next = Some(mesh.head);
        for _ in 0..mesh.count {
            let key = next.unwrap();
            let entry = self.prims.remove(key);

            if let Some((_, span)) = entry.indices {
                self.free_span(span);
            }
            for attr in entry.attributes.into_iter().flatten() {
                self.free_span(attr.1);
            }

            next = entry.next;
        }
    }

    fn entry(&self, mesh: &Mesh, prim: usize) -> &Primitive {
        assert!(prim < mesh.count, "primitive {} out of bounds", prim);

        let mut key = mesh.head;
        for _ in 0..prim {
            key = self.prims[key].next.unwrap();
        }
        &self.prims[key]
    }

    /// The vertex input list of a primitive, ordered by semantic, with
    /// each input's `nr` set to the semantic's bit position.
    pub fn inputs(&self, mesh: &Mesh, prim: usize) -> Vec<VertexInput> {
        let entry = self.entry(mesh, prim);

        Semantic::ALL
            .iter()
            .filter_map(|&sem| {
                entry.attributes[sem as usize].map(|(format, _)| VertexInput {
                    format,
                    stride: format.size(),
                    nr: sem.nr(),
                })
            })
            .collect()
    }

    /// Records the draw of a primitive into `cb`.
    ///
    /// Binds the shared buffer at every per-semantic offset and the index
    /// buffer if present. `instances < 1` is coerced to 1.
    pub fn draw(&self, mesh: &Mesh, prim: usize, cb: &mut CmdBuffer, instances: u32) {
        let entry = self.entry(mesh, prim);
        let instances = instances.max(1);

        for sem in Semantic::ALL {
            if let Some((_, span)) = entry.attributes[sem as usize] {
                cb.set_vertex_buf(sem.nr(), &[self.buffer.clone()], &[span.byte_offset()]);
            }
        }

        match entry.indices {
            Some((format, span)) => {
                cb.set_index_buf(format, &self.buffer, span.byte_offset());
                cb.draw_indexed(entry.count, instances, 0, 0, 0);
            }
            None => cb.draw(entry.vertex_count, instances, 0, 0),
        }
    }
}

fn source_in_bounds(data: &Data, source: usize, offset: u64, size: u64) -> bool {
    data.sources
        .get(source)
        .is_some_and(|s| offset + size <= s.data.len() as u64)
}

static STORAGE: RwLock<Option<MeshBuffer>> = RwLock::new(None);

/// Initializes the process-wide mesh storage with a fresh buffer of
/// `capacity` bytes, replacing any previous storage.
pub fn init(gpu: &Arc<dyn Gpu>, capacity: u64) -> Result<(), Error> {
    let storage = MeshBuffer::new(gpu, capacity)?;
    *STORAGE.write() = Some(storage);
    Ok(())
}

/// Drops the process-wide mesh storage.
pub fn reset() {
    *STORAGE.write() = None;
}

/// Replaces the backing buffer of the process-wide storage.
///
/// Invalidates every previously created [`Mesh`] handle.
pub fn set_buffer(buffer: Arc<dyn Buffer>) -> Result<(), Error> {
    let mut storage = STORAGE.write();
    let storage = storage.as_mut().ok_or(Error::Uninitialized)?;
    storage.set_buffer(buffer);
    Ok(())
}

/// A mesh stored in the process-wide mesh buffer.
///
/// The handle is a chain of primitives; operations address primitives by
/// their position in the chain.
#[derive(Debug, PartialEq, Eq)]
pub struct Mesh {
    /// Arena key of the first primitive.
    head: usize,
    count: usize,
}

impl Mesh {
    /// Ingests `data` into the process-wide mesh buffer.
    pub fn new(data: &Data) -> Result<Self, Error> {
        let mut storage = STORAGE.write();
        let storage = storage.as_mut().ok_or(Error::Uninitialized)?;
        storage.new_mesh(data)
    }

    /// The number of primitives.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn inputs(&self, prim: usize) -> Vec<VertexInput> {
        let storage = STORAGE.read();
        storage
            .as_ref()
            .expect("mesh storage is not initialized")
            .inputs(self, prim)
    }

    pub fn draw(&self, prim: usize, cb: &mut CmdBuffer, instances: u32) {
        let storage = STORAGE.read();
        storage
            .as_ref()
            .expect("mesh storage is not initialized")
            .draw(self, prim, cb, instances)
    }

    /// Releases the mesh's storage.
    pub fn free(self) {
        let mut storage = STORAGE.write();
        storage
            .as_mut()
            .expect("mesh storage is not initialized")
            .free_mesh(&self);
    }
}
