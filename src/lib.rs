//! Columnar trace-storage engine: compressed, chained-checksum extent files
//! and a streaming relational operator pipeline.
//!
//! Modules roughly mirror `examples/original_source/include/DataSeries/`:
//! [`types`] is the extent-type registry, [`extent`] is the in-memory record
//! buffer, [`codec`] is the on-disk packed-extent format, [`file`] is the
//! sink/reader pair that streams extents to and from a file, [`operator`] is
//! the pull-based relational pipeline, and [`server`] is the request
//! dispatcher that ties a working directory of named tables to those
//! operators. [`block`]/[`hc`] are the LZ4/LZ4HC block codecs used as two of
//! [`codec::compress`]'s eight compress-mode backends.

pub mod block;
pub mod codec;
pub mod error;
pub mod extent;
pub mod file;
pub mod hc;
pub mod operator;
pub mod server;
pub mod stats;
pub mod types;

pub use error::{Error, Result};
pub use extent::Extent;
pub use types::{ExtentType, Field, FieldType};
