#![deny(unsafe_op_in_unsafe_fn)]

//! GPU plumbing: a hardware-agnostic driver contract plus the resource
//! managers layered on top of it.
//!
//! The [`driver`] module defines the contract a backend must honor:
//! capability traits for the GPU and its resources, the command-buffer
//! recording state machine, and batch submission with channel-based
//! completion signaling. [`mesh`] and [`texture`] hide suballocation and
//! staging details from application code.

pub mod driver;
pub mod mesh;
pub mod texture;
