//! Common types and abstractions
//!
//! This module defines the core types used along the dispatch path:
//! - Address / Destination: where a connection is headed
//! - Pipe: in-process chunk channel with interrupt support
//! - Link: the (reader, writer) pair handed to outbound handlers
//! - CachedReader: peek-without-consume wrapper used by the sniffer

mod address;
mod cached;
mod link;
pub mod pipe;

pub use address::{Address, Destination, Network};
pub use cached::{CachedReader, SCRATCH_SIZE};
pub use link::{BoxReader, BoxWriter, Link};
pub use pipe::{pipe, PipeReader, PipeWriter};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
