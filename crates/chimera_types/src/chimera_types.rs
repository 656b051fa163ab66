//! Chimera Types - Shared data definitions for the cross-runtime bridge
//!
//! This crate contains the pure data structures both sides of a bridge agree
//! on: wire values, method/stream descriptors and the channel message format.
//! It has no threads and no runtime; `chimera-runtime` builds on it.

mod descriptor;
mod value;

pub mod wire;

pub use descriptor::*;
pub use value::*;
pub use wire::{Envelope, EnvelopeKind, MethodCall, MethodResponse, WireError};
