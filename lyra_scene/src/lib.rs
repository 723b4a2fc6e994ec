//! Scene graph.
//!
//! An arena-backed tree of nodes carrying user data. World transforms
//! propagate lazily: [`Graph::update`] recomputes only the subtrees whose
//! data reported a change since the last pass.

mod graph;

pub use graph::{Graph, Node, NodeData};
