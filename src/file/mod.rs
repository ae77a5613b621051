//! File-level format: magic/orientation, the type-library block, the
//! reserved per-file index-extent type, and the reader/sink pair built on
//! top of [`crate::codec`] (spec §3, §4.2, §4.3, §6).
//!
//! Byte layout: `[magic][library block][data extents...][index extent][tail]`
//! (spec §3: "ordered byte stream: magic, library-extent, data-extents...,
//! index-extent, tail"). The library is written as a raw descriptor block,
//! not a packed extent — decoding a packed extent requires already knowing
//! its type, so the library can't describe itself that way. The index
//! extent, by contrast, is packed through the ordinary [`crate::codec`]
//! path using a reserved, well-known type that both sink and reader
//! construct locally rather than read out of the library.

pub mod reader;
pub mod sink;
pub mod tail;

use std::sync::Arc;

use crate::codec::checksum;
use crate::error::{Error, Result};
use crate::types::{ExtentType, Field, FieldType, PackHints};

/// Canonical (native/little-endian) magic. A reader that instead finds the
/// byte-reversed form knows the file was written on the other orientation
/// and sets `need_bitflip` (spec §4.1).
pub const MAGIC: [u8; 8] = *b"XSTORE01";

pub fn magic_flipped() -> [u8; 8] {
    let mut m = MAGIC;
    m.reverse();
    m
}

/// Detect orientation from the first 8 bytes of a file.
pub fn detect_orientation(bytes: &[u8]) -> Result<bool> {
    if bytes.len() < 8 {
        return Err(Error::BadMagic);
    }
    let head: [u8; 8] = bytes[0..8].try_into().unwrap();
    if head == MAGIC {
        Ok(false)
    } else if head == magic_flipped() {
        Ok(true)
    } else {
        Err(Error::BadMagic)
    }
}

/// The reserved type recording, for each data extent in a file, its byte
/// offset and on-disk type name (spec §3: "The index-extent records, for
/// each data extent, (byte offset, extent-type-name)"). Never serialized
/// into a file's library block; both sink and reader build it from this
/// same constructor, so it's always in scope.
pub fn index_extent_type() -> Arc<ExtentType> {
    ExtentType::new(
        "dataseries.store",
        "Index",
        (1, 0),
        vec![
            Field {
                name: "extent_offset".into(),
                field_type: FieldType::Int64,
                nullable: false,
                pack: PackHints::default(),
                offset: 0,
                null_bit: None,
            },
            Field {
                name: "type_name".into(),
                field_type: FieldType::Variable32,
                nullable: false,
                pack: PackHints::default(),
                offset: 0,
                null_bit: None,
            },
        ],
    )
    .expect("index extent type is a fixed, valid schema")
}

/// Encode a library descriptor block: `[4B len][len bytes xml][4B checksum]`.
pub fn encode_library_block(descriptor_xml: &str) -> Vec<u8> {
    let bytes = descriptor_xml.as_bytes();
    let mut out = Vec::with_capacity(8 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
    out.extend_from_slice(&checksum::adler32(bytes).to_le_bytes());
    out
}

/// Decode a library descriptor block, returning the XML text and the number
/// of bytes consumed.
pub fn decode_library_block(bytes: &[u8]) -> Result<(String, usize)> {
    if bytes.len() < 4 {
        return Err(Error::TruncatedTail);
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if bytes.len() < 4 + len + 4 {
        return Err(Error::TruncatedTail);
    }
    let xml_bytes = &bytes[4..4 + len];
    let stored_checksum = u32::from_le_bytes(bytes[4 + len..8 + len].try_into().unwrap());
    if checksum::adler32(xml_bytes) != stored_checksum {
        return Err(Error::BadChecksum(crate::error::ChecksumKind::Header));
    }
    let xml = std::str::from_utf8(xml_bytes)
        .map_err(|_| Error::RequestError("library block is not valid utf-8".into()))?
        .to_string();
    Ok((xml, 8 + len))
}
