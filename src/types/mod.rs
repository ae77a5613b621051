//! Extent type registry: schema definitions, field layout, and the library
//! that interns them.
//!
//! Grounded on `examples/original_source/include/DataSeries/Extent.hpp`
//! (field semantic types, pack hints, offset assignment) generalized into
//! idiomatic Rust: an `ExtentType` is immutable once built and shared by
//! `Arc` from every `Extent`/operator that references it, mirroring this
//! crate's block/HC codec convention of cheap, `Copy`-able descriptor types
//! wherever the data allows it.

pub mod library;

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Semantic field type. Determines both the on-disk fixed-record width and
/// the typed accessor used by [`crate::extent::value::GeneralValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Byte,
    Int32,
    Int64,
    Variable32,
}

impl FieldType {
    /// Width of this field's slot in the fixed-record array, in bytes.
    /// `Variable32` stores a 4-byte offset into the extent's string pool,
    /// not the value itself.
    pub fn fixed_width(self) -> usize {
        match self {
            FieldType::Bool | FieldType::Byte => 1,
            FieldType::Int32 | FieldType::Variable32 => 4,
            FieldType::Int64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Byte => "byte",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Variable32 => "variable32",
        }
    }

    pub fn parse(s: &str) -> Option<FieldType> {
        match s {
            "bool" => Some(FieldType::Bool),
            "byte" => Some(FieldType::Byte),
            "int32" => Some(FieldType::Int32),
            "int64" => Some(FieldType::Int64),
            "variable32" => Some(FieldType::Variable32),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pre-compression packing hints attached to a single field. See spec §4.1:
/// relative-delta packing, string-pool dedup, and scaled-double storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackHints {
    /// `pack_relative=<field>`: store `value - reference(field)` instead of
    /// `value`. `Some(name)` names the reference field (may be this field's
    /// own name, meaning "previous record's value of this field").
    pub relative_to: Option<String>,
    /// `pack_unique=yes`: dedup identical string values in the variable pool.
    pub unique: bool,
    /// `pack_scale=<s>`: store `round(value / s)` as an integer.
    pub scale: Option<f64>,
}

/// A single column declaration within an [`ExtentType`].
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub pack: PackHints,
    /// Byte offset of this field within the fixed-record array. Assigned by
    /// [`ExtentType::new`]; not part of the schema as declared.
    pub offset: usize,
    /// Bit index into the leading null bitmap, if `nullable`.
    pub null_bit: Option<usize>,
}

/// A versioned, named schema: an ordered list of fields with assigned byte
/// offsets. Immutable after construction, shared by reference from every
/// `Extent` and operator that uses it.
#[derive(Debug)]
pub struct ExtentType {
    pub namespace: String,
    pub name: String,
    pub major_version: u32,
    pub minor_version: u32,
    fields: Vec<Field>,
    /// Bytes occupied by the leading null bitmap (0 if no nullable fields).
    pub null_bitmap_bytes: usize,
    /// Total size of one fixed record, including the null bitmap prefix.
    pub fixed_record_size: usize,
}

impl ExtentType {
    /// Build a new type from field declarations, assigning null-bitmap bits
    /// and fixed-record offsets in declaration order.
    ///
    /// The null bitmap occupies the leading `null_bitmap_bytes` of every
    /// fixed record (spec §3: "the null bitmap occupies a prefix").
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: (u32, u32),
        mut fields: Vec<Field>,
    ) -> Result<Arc<ExtentType>> {
        let nullable_count = fields.iter().filter(|f| f.nullable).count();
        let null_bitmap_bytes = (nullable_count + 7) / 8;

        let mut next_offset = null_bitmap_bytes;
        let mut next_null_bit = 0usize;
        for field in fields.iter_mut() {
            if field.nullable {
                field.null_bit = Some(next_null_bit);
                next_null_bit += 1;
            }
            field.offset = next_offset;
            next_offset += field.field_type.fixed_width();
        }

        // Validate pack_relative references an existing field.
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        for field in &fields {
            if let Some(ref_name) = &field.pack.relative_to {
                if !names.contains(&ref_name.as_str()) {
                    return Err(Error::FieldNotFound {
                        type_name: name.into(),
                        field: ref_name.clone(),
                    });
                }
            }
        }

        Ok(Arc::new(ExtentType {
            namespace: namespace.into(),
            name: name.into(),
            major_version: version.0,
            minor_version: version.1,
            fields,
            null_bitmap_bytes,
            fixed_record_size: next_offset,
        }))
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// The `(namespace, name, major, minor)` key used for library interning
    /// and for the index-extent's reserved `DSIndex::Extent::MinMax::<type>`
    /// naming scheme.
    pub fn key(&self) -> (String, String, u32, u32) {
        (
            self.namespace.clone(),
            self.name.clone(),
            self.major_version,
            self.minor_version,
        )
    }

    /// Serialize back to the descriptor grammar [`library::parse_descriptors`]
    /// accepts, the inverse operation needed wherever an operator synthesizes
    /// a derived type (project, hash-join, star-join, union output types)
    /// that must be written into a fresh file's library block.
    pub fn to_xml(&self) -> String {
        let mut out = format!(
            "<ExtentType name=\"{}\" namespace=\"{}\" version=\"{}.{}\">\n",
            self.name, self.namespace, self.major_version, self.minor_version
        );
        for field in &self.fields {
            out.push_str("  <field type=\"");
            out.push_str(field.field_type.name());
            out.push_str("\" name=\"");
            out.push_str(&field.name);
            out.push('"');
            if field.nullable {
                out.push_str(" nullable=\"true\"");
            }
            if let Some(rel) = &field.pack.relative_to {
                out.push_str(" pack_relative=\"");
                out.push_str(rel);
                out.push('"');
            }
            if field.pack.unique {
                out.push_str(" pack_unique=\"yes\"");
            }
            if let Some(scale) = field.pack.scale {
                out.push_str(&format!(" pack_scale=\"{scale}\""));
            }
            out.push_str(" />\n");
        }
        out.push_str("</ExtentType>\n");
        out
    }
}

impl PartialEq for ExtentType {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
