//! `GeneralValue` / `GeneralField`: the dynamically-typed value and field
//! handle used anywhere an operator must compare or hash cells from columns
//! whose concrete type isn't known until the operator tree is built (sort
//! keys, join keys, union order columns).
//!
//! Spec §9 calls this out explicitly: "modeled as a tagged variant
//! `GeneralValue` plus a thin trait/interface for `GeneralField` with one
//! implementation per scalar type. Avoids virtual-call cost on hot paths by
//! letting the sort/join comparators cache the comparator vector per
//! column." The comparator-vector caching lives in the operators
//! themselves ([`crate::operator::sort`], [`crate::operator::hash_join`]);
//! this module only supplies the value/field primitives they cache.

use std::sync::Arc;

use crate::error::Result;
use crate::extent::Extent;
use crate::types::{ExtentType, Field, FieldType};

/// An owned, dynamically-typed cell value. `Ord`/`Hash` are derived in
/// declaration order (`Null` sorts lowest, then `Bool`, `Byte`, `Int32`,
/// `Int64`, `Variable32`), which is sufficient for every use in this crate:
/// values are only ever compared against other values read through the same
/// [`GeneralField`], so they always share a variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GeneralValue {
    Null,
    Bool(bool),
    Byte(u8),
    Int32(i32),
    Int64(i64),
    Variable32(Vec<u8>),
}

impl GeneralValue {
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            GeneralValue::Null => None,
            GeneralValue::Bool(_) => Some(FieldType::Bool),
            GeneralValue::Byte(_) => Some(FieldType::Byte),
            GeneralValue::Int32(_) => Some(FieldType::Int32),
            GeneralValue::Int64(_) => Some(FieldType::Int64),
            GeneralValue::Variable32(_) => Some(FieldType::Variable32),
        }
    }
}

/// A handle bound to a single named field of a known [`ExtentType`].
///
/// Reads/writes the typed cell at a caller-supplied `(extent, record)`
/// location, boxing the result as a [`GeneralValue`]. Constructing one
/// resolves the field by name once; every subsequent `get`/`set` call is a
/// direct offset read, no name lookup.
#[derive(Debug, Clone)]
pub struct GeneralField {
    field: Field,
}

impl GeneralField {
    pub fn new(ty: &ExtentType, name: &str) -> Result<GeneralField> {
        let field = ty
            .field(name)
            .ok_or_else(|| crate::error::Error::FieldNotFound {
                type_name: ty.name.clone(),
                field: name.to_string(),
            })?
            .clone();
        Ok(GeneralField { field })
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn name(&self) -> &str {
        &self.field.name
    }

    pub fn get(&self, extent: &Extent, record: usize) -> Result<GeneralValue> {
        if extent.is_null(record, &self.field) {
            return Ok(GeneralValue::Null);
        }
        Ok(match self.field.field_type {
            FieldType::Bool => GeneralValue::Bool(extent.get_bool(record, &self.field)?),
            FieldType::Byte => GeneralValue::Byte(extent.get_byte(record, &self.field)?),
            FieldType::Int32 => GeneralValue::Int32(extent.get_i32(record, &self.field)?),
            FieldType::Int64 => GeneralValue::Int64(extent.get_i64(record, &self.field)?),
            FieldType::Variable32 => {
                GeneralValue::Variable32(extent.get_variable32(record, &self.field)?.to_vec())
            }
        })
    }

    pub fn set(&self, extent: &mut Extent, record: usize, value: &GeneralValue) -> Result<()> {
        match value {
            GeneralValue::Null => {
                extent.set_null(record, &self.field, true);
                Ok(())
            }
            GeneralValue::Bool(v) => extent.set_bool(record, &self.field, *v),
            GeneralValue::Byte(v) => extent.set_byte(record, &self.field, *v),
            GeneralValue::Int32(v) => extent.set_i32(record, &self.field, *v),
            GeneralValue::Int64(v) => extent.set_i64(record, &self.field, *v),
            GeneralValue::Variable32(v) => extent.set_variable32(record, &self.field, v),
        }
    }
}

/// Build a vector of `GeneralValue`s for `columns` at `record`, used
/// wherever a join/union/sort key is a composite of several fields.
pub fn key_vector(
    extent: &Extent,
    record: usize,
    columns: &[GeneralField],
) -> Result<Vec<GeneralValue>> {
    columns.iter().map(|c| c.get(extent, record)).collect()
}

/// A record copier: copies the current row's cells one field at a time
/// between two (possibly differently-typed) extents. Spec §4.4: "dominant
/// cost is column-wise copy loops."
pub struct RecordCopier {
    /// `(source field, destination field)` pairs, resolved once at operator
    /// setup time.
    pairs: Vec<(Field, Field)>,
}

impl RecordCopier {
    /// Build a copier from `dst_type` back to `src_type` using an explicit
    /// name mapping `dst_name -> src_name`. Every destination field must
    /// have a same-type source counterpart.
    pub fn new(
        src_type: &ExtentType,
        dst_type: &ExtentType,
        rename: &[(String, String)],
    ) -> Result<RecordCopier> {
        let mut pairs = Vec::with_capacity(rename.len());
        for (dst_name, src_name) in rename {
            let src = src_type
                .field(src_name)
                .ok_or_else(|| crate::error::Error::FieldNotFound {
                    type_name: src_type.name.clone(),
                    field: src_name.clone(),
                })?
                .clone();
            let dst = dst_type
                .field(dst_name)
                .ok_or_else(|| crate::error::Error::FieldNotFound {
                    type_name: dst_type.name.clone(),
                    field: dst_name.clone(),
                })?
                .clone();
            if src.field_type != dst.field_type {
                return Err(crate::error::Error::TypeMismatch {
                    expected: src.field_type.name().to_string(),
                    found: dst.field_type.name().to_string(),
                });
            }
            pairs.push((src, dst));
        }
        Ok(RecordCopier { pairs })
    }

    /// Straight-through copier: every field of `ty` maps to itself.
    pub fn identity(ty: &Arc<ExtentType>) -> RecordCopier {
        let pairs = ty
            .fields()
            .iter()
            .map(|f| (f.clone(), f.clone()))
            .collect();
        RecordCopier { pairs }
    }

    /// Copy `src_record` of `src` into a freshly appended record of `dst`.
    pub fn copy_row(&self, src: &Extent, src_record: usize, dst: &mut Extent) -> Result<usize> {
        let dst_record = dst.append_record();
        for (src_field, dst_field) in &self.pairs {
            if src.is_null(src_record, src_field) {
                dst.set_null(dst_record, dst_field, true);
                continue;
            }
            match src_field.field_type {
                FieldType::Bool => {
                    dst.set_bool(dst_record, dst_field, src.get_bool(src_record, src_field)?)?
                }
                FieldType::Byte => {
                    dst.set_byte(dst_record, dst_field, src.get_byte(src_record, src_field)?)?
                }
                FieldType::Int32 => {
                    dst.set_i32(dst_record, dst_field, src.get_i32(src_record, src_field)?)?
                }
                FieldType::Int64 => {
                    dst.set_i64(dst_record, dst_field, src.get_i64(src_record, src_field)?)?
                }
                FieldType::Variable32 => dst.set_variable32(
                    dst_record,
                    dst_field,
                    src.get_variable32(src_record, src_field)?,
                )?,
            }
        }
        Ok(dst_record)
    }
}
