//! Pull-based relational operator pipeline (spec §4.4, §4.5).
//!
//! Every operator implements [`Operator`]: `get_extent()` pulls the next
//! batch or signals end of stream with `Ok(None)`. Operators compose by
//! holding their inputs as `Box<dyn Operator>`, so a tree of them is just a
//! tree of owned trait objects with no shared mutable state between siblings
//! (spec §5: "single-threaded, fully synchronous ... a slow consumer simply
//! does not call `get_extent`"). The tree is built bottom-up and must be a
//! DAG (spec §9): this crate enforces that by construction — there is no API
//! for an operator to reference a sibling, only its own declared inputs.

pub mod expr;
pub mod hash_join;
pub mod loser_tree;
pub mod minmax_scan;
pub mod project;
pub mod rotating_map;
pub mod select;
pub mod sort;
pub mod sorted_update;
pub mod star_join;
pub mod union;

use std::sync::Arc;

use crate::error::Result;
use crate::extent::Extent;
use crate::types::ExtentType;

/// Every relational operator targets this output-extent size before
/// returning a batch (spec §4.5: "All operators size output extents to
/// ≈96 KiB before returning them, to amortize downstream scheduling").
pub const TARGET_EXTENT_BYTES: usize = 96 * 1024;

/// A pull source of typed extents: a raw file reader, or another operator.
pub trait Operator: Send {
    /// The schema of every extent this operator yields.
    fn output_type(&self) -> Arc<ExtentType>;

    /// Pull the next batch, or `Ok(None)` at end of stream. Once `None` is
    /// returned, subsequent calls must also return `None`.
    fn get_extent(&mut self) -> Result<Option<Extent>>;
}

/// Current in-memory size of an extent under construction, used by every
/// operator to decide when to flush an output batch (spec §4.5).
pub fn extent_byte_size(extent: &Extent) -> usize {
    extent.fixed_bytes().len() + extent.variable_bytes().len()
}

/// Adapts a [`crate::file::reader::FileReader`] (or any other plain extent
/// source) into an [`Operator`] bottom of a pipeline. The table's type must
/// be known up front since a file's index may in principle interleave
/// several types; every table this crate's server constructs is single-type.
pub struct ExtentSource<R> {
    reader: R,
    ty: Arc<ExtentType>,
}

impl<R> ExtentSource<R> {
    pub fn new(reader: R, ty: Arc<ExtentType>) -> ExtentSource<R> {
        ExtentSource { reader, ty }
    }
}

/// Narrow trait implemented by [`crate::file::reader::FileReader`] so
/// [`ExtentSource`] doesn't need to depend on its concrete type directly.
pub trait NextExtent {
    fn next_extent(&mut self) -> Result<Option<Extent>>;
}

impl NextExtent for crate::file::reader::FileReader {
    fn next_extent(&mut self) -> Result<Option<Extent>> {
        crate::file::reader::FileReader::next_extent(self)
    }
}

impl<R: NextExtent + Send> Operator for ExtentSource<R> {
    fn output_type(&self) -> Arc<ExtentType> {
        Arc::clone(&self.ty)
    }

    fn get_extent(&mut self) -> Result<Option<Extent>> {
        self.reader.next_extent()
    }
}

/// An in-memory, already-materialized sequence of extents, used by tests and
/// by operators that stage intermediate results (e.g. hash-join's small
/// side) as a plain `Operator` input.
pub struct VecSource {
    ty: Arc<ExtentType>,
    extents: std::collections::VecDeque<Extent>,
}

impl VecSource {
    pub fn new(ty: Arc<ExtentType>, extents: Vec<Extent>) -> VecSource {
        VecSource { ty, extents: extents.into() }
    }
}

impl Operator for VecSource {
    fn output_type(&self) -> Arc<ExtentType> {
        Arc::clone(&self.ty)
    }

    fn get_extent(&mut self) -> Result<Option<Extent>> {
        Ok(self.extents.pop_front())
    }
}
