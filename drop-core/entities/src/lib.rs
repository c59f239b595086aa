//! Minimal models for published files with a pluggable, thread-safe byte
//! source abstraction.
//!
//! This crate provides:
//! - `Data`: a trait for thread-safe, random-access, read-only byte sources.
//! - `MemoryData`: a `Data` implementation over an owned buffer.
//! - `File`: a published file, i.e. a unique path, a MIME type and an
//!   `Arc<dyn Data>` holding its contents.
//!
//! Example:
//! ```rust
//! use std::sync::Arc;
//! use peerdrop_entities::{Data, File, MemoryData};
//!
//! let file = File::new(
//!     "/greeting.txt",
//!     "text/plain",
//!     Arc::new(MemoryData::new(b"hello".to_vec())),
//! );
//!
//! assert_eq!(file.size(), 5);
//! assert_eq!(file.data.read_at(1, 3).unwrap(), b"ell".to_vec());
//! ```

mod data;
mod file;

/// Re-export of the core data source trait and its in-memory implementation.
pub use data::{Data, MemoryData};
/// Re-export of the published file abstraction backed by `Data`.
pub use file::File;
