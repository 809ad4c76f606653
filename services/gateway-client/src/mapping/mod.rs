//! Per-mapping accept loops and the protocol adapters they sit on top of.

pub mod adapters;
pub mod handler;

pub use handler::{spawn, MappingHandle};
