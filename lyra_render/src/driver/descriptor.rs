use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use bitflags::bitflags;

use super::resource::{Buffer, ImageView, Sampler};
use super::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DescType {
    /// Storage buffer.
    Buffer,
    /// Storage image.
    Image,
    /// Constant (uniform) buffer.
    Constant,
    /// Sampled image.
    Texture,
    Sampler,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Stages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// One descriptor slot of a heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub kind: DescType,
    pub stages: Stages,
    /// Binding number within the heap's set.
    pub nr: u32,
    /// Array length of the binding.
    pub len: u32,
}

/// An ordered list of descriptors replicated into independently bindable
/// copies.
///
/// [`resize`] allocates the copies; each copy is written individually and
/// selected at bind time through
/// [`CmdBuffer::set_desc_table_graph`]/[`set_desc_table_comp`].
///
/// The `set_*` methods panic when the copy or descriptor selector is out
/// of bounds, the descriptor kind does not match, or the written range
/// exceeds the descriptor's array length.
///
/// [`resize`]: DescHeap::resize
/// [`CmdBuffer::set_desc_table_graph`]: super::command::CmdBuffer::set_desc_table_graph
/// [`set_desc_table_comp`]: super::command::CmdBuffer::set_desc_table_comp
pub trait DescHeap: Send + Sync + Debug {
    fn descriptors(&self) -> &[Descriptor];

    /// The number of currently allocated copies.
    fn count(&self) -> usize;

    /// Allocates `n` copies of the full descriptor list.
    ///
    /// All handles from a prior call are invalidated, unless `n` equals
    /// the current count in which case this is a no-op. `n == 0` frees
    /// the storage.
    fn resize(&self, n: usize) -> Result<(), Error>;

    /// Writes buffer ranges into an array descriptor of kind
    /// [`DescType::Buffer`] or [`DescType::Constant`], starting at array
    /// element `start`.
    ///
    /// Offsets and sizes must be multiples of 256 bytes.
    fn set_buffer(
        &self,
        copy: usize,
        nr: u32,
        start: usize,
        buffers: &[Arc<dyn Buffer>],
        offsets: &[u64],
        sizes: &[u64],
    );

    /// Writes image views into an array descriptor of kind
    /// [`DescType::Image`] or [`DescType::Texture`].
    fn set_image(&self, copy: usize, nr: u32, start: usize, views: &[Arc<dyn ImageView>]);

    /// Writes samplers into an array descriptor of kind
    /// [`DescType::Sampler`].
    fn set_sampler(&self, copy: usize, nr: u32, start: usize, samplers: &[Arc<dyn Sampler>]);

    fn as_any(&self) -> &dyn Any;
}

/// An ordered list of heaps.
///
/// The position of a heap in the table is its set index and forms a
/// separate binding namespace: binding numbers do not conflict across
/// sets.
#[derive(Clone, Debug, Default)]
pub struct DescTable {
    heaps: Vec<Arc<dyn DescHeap>>,
}

impl DescTable {
    pub fn new(heaps: Vec<Arc<dyn DescHeap>>) -> Self {
        Self { heaps }
    }

    pub fn heaps(&self) -> &[Arc<dyn DescHeap>] {
        &self.heaps
    }

    pub fn heap(&self, set: usize) -> &Arc<dyn DescHeap> {
        &self.heaps[set]
    }

    pub fn len(&self) -> usize {
        self.heaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heaps.is_empty()
    }
}
