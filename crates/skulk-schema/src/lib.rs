//! Skulk Schema - measurement and tag enumeration for the Skulk TSM engine
//!
//! This crate answers schema queries ("which measurements exist in this bucket
//! between two timestamps?") by merging the immutable TSM files on disk with
//! the in-memory write cache.
//!
//! # Components
//!
//! - [`key`]: Composite key codec (namespace prefix, series key, field)
//! - [`TsmWriter`] / [`TsmReader`]: TSM segment file I/O
//! - [`FileStore`]: Set of open TSM files with snapshot semantics
//! - [`Cache`]: Concurrent write cache
//! - [`Engine`]: Measurement name, tag key and tag value queries
//!
//! # Example
//!
//! ```rust,ignore
//! use skulk_schema::{CancellationToken, Engine, EngineConfig, Namespace, TimeRange};
//!
//! let engine = Engine::open(data_dir, EngineConfig::default())?;
//! engine.cache().write(&key, &[(now_ns, 0.75)]);
//!
//! let names = engine.measurement_names(
//!     &CancellationToken::new(),
//!     Namespace::new(org_id, bucket_id),
//!     TimeRange::new(start_ns, now_ns),
//! )?;
//! for name in names {
//!     println!("{}", name);
//! }
//! ```

#![deny(missing_docs)]

pub mod cancel;
pub mod error;
pub mod key;
pub mod stats;
pub mod tsm;

pub use cancel::CancellationToken;
pub use error::{Result, TsmError};
pub use key::{Namespace, NamespacePrefix};
pub use stats::ScanStats;
pub use tsm::{
    Cache, Engine, EngineConfig, FileStore, ScanMetrics, StringIterator, TimeRange, Timestamp,
    TsmReader, TsmWriter,
};
