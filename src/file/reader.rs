//! Sequential and positional extent reading from a file written by
//! [`crate::file::sink::Sink`] (spec §3, §4.2).

use std::fs;
use std::path::Path;

use crate::codec::{self, ReadChecks};
use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::file::tail::{self, Tail, TAIL_SIZE};
use crate::file::{decode_library_block, detect_orientation, index_extent_type, MAGIC};
use crate::types::library::ExtentTypeLibrary;

/// An opened extent file: the whole byte stream kept in memory, the parsed
/// type library, and a cursor over the data-extent region.
pub struct FileReader {
    bytes: Vec<u8>,
    library: ExtentTypeLibrary,
    need_bitflip: bool,
    data_start: usize,
    data_end: usize,
    tail: Tail,
    cursor: usize,
    running_chain: u32,
    checks: ReadChecks,
}

impl FileReader {
    /// Open `path`, detect its byte order, parse its type library, and
    /// position the cursor at the first data extent, verifying every
    /// checksum on read (spec §6 default environment behavior).
    pub fn open(path: impl AsRef<Path>) -> Result<FileReader> {
        Self::open_with_checks(path, ReadChecks::default())
    }

    /// Like [`FileReader::open`], but with the read-side checksum policy the
    /// environment selects (spec §6: "a read-side environment flag selects
    /// which checksums are validated"). Injected here rather than read from
    /// a process-wide flag at call time (spec §9: "prefer injecting it
    /// through the reader constructor").
    pub fn open_with_checks(path: impl AsRef<Path>, checks: ReadChecks) -> Result<FileReader> {
        let bytes = fs::read(path)?;
        let need_bitflip = detect_orientation(&bytes)?;
        let (xml, lib_consumed) = decode_library_block(&bytes[MAGIC.len()..])?;

        let mut library = ExtentTypeLibrary::new();
        library.parse_and_register(&xml)?;
        library.register(index_extent_type())?;

        if bytes.len() < TAIL_SIZE {
            return Err(Error::TruncatedTail);
        }
        let tail = Tail::decode(&bytes[bytes.len() - TAIL_SIZE..])?;

        let data_start = MAGIC.len() + lib_consumed;
        let data_end = tail.index_extent_offset as usize;
        if data_end < data_start || data_end > bytes.len() {
            return Err(Error::TruncatedTail);
        }

        Ok(FileReader {
            bytes,
            library,
            need_bitflip,
            data_start,
            data_end,
            tail,
            cursor: data_start,
            running_chain: 0,
            checks,
        })
    }

    pub fn library(&self) -> &ExtentTypeLibrary {
        &self.library
    }

    /// Pull the next data extent, advancing the running chained checksum.
    /// Returns `Ok(None)` once the cursor reaches the index extent, after
    /// checking the accumulated chain against the tail's stored value.
    pub fn next_extent(&mut self) -> Result<Option<Extent>> {
        if self.cursor >= self.data_end {
            tail::verify_chain(&self.tail, self.running_chain)?;
            return Ok(None);
        }
        let (extent, consumed, chain) = codec::unpack_oriented(
            &self.bytes[self.cursor..self.data_end],
            &self.library,
            self.checks,
            self.need_bitflip,
        )?;
        self.cursor += consumed;
        self.running_chain = chain;
        if self.cursor == self.data_end {
            tail::verify_chain(&self.tail, self.running_chain)?;
        }
        Ok(Some(extent))
    }

    /// Read one extent directly at `offset`, bypassing the sequential cursor
    /// and the chain check. Used for index-guided random access (spec §5
    /// min/max index scan).
    pub fn read_extent_at(&self, offset: usize, expected_type_name: &str) -> Result<Extent> {
        if offset >= self.bytes.len() {
            return Err(Error::TruncatedTail);
        }
        let (extent, _consumed, _chain) = codec::unpack_oriented(
            &self.bytes[offset..],
            &self.library,
            self.checks,
            self.need_bitflip,
        )?;
        if extent.ty.name != expected_type_name {
            return Err(Error::TypeNotInLibrary(expected_type_name.to_string()));
        }
        Ok(extent)
    }

    /// Decode the file's index extent into `(extent_offset, type_name)`
    /// pairs, one per data extent written (spec §3).
    pub fn index_entries(&self) -> Result<Vec<(u64, String)>> {
        let (extent, _consumed, _chain) = codec::unpack_oriented(
            &self.bytes[self.data_end..],
            &self.library,
            ReadChecks::default(),
            self.need_bitflip,
        )?;
        let ty = index_extent_type();
        let offset_field = ty.field("extent_offset").expect("reserved field");
        let name_field = ty.field("type_name").expect("reserved field");
        let mut out = Vec::with_capacity(extent.n_records());
        for r in 0..extent.n_records() {
            let offset = extent.get_i64(r, offset_field)? as u64;
            let name = String::from_utf8_lossy(extent.get_variable32(r, name_field)?).into_owned();
            out.push((offset, name));
        }
        Ok(out)
    }
}
