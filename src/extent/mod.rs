//! In-memory extent buffer: a fixed-record array paired with a variable-width
//! string pool, plus typed field accessors.
//!
//! Grounded on `examples/original_source/include/DataSeries/Extent.hpp`: an
//! extent owns two byte arenas and knows nothing about compression or disk
//! layout — that is [`crate::codec`]'s job. Records are filled one at a time
//! by a producer, then the whole extent is handed by value to a sink.

pub mod value;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{ExtentType, Field, FieldType};

/// Reserved variable32 offset meaning "empty / null string".
pub const EMPTY_VAR_OFFSET: u32 = 0;

/// A batch of records of a single [`ExtentType`].
///
/// Invariants (spec §3): every variable32 offset in `fixed` points inside
/// `variable` or equals [`EMPTY_VAR_OFFSET`]; `variable[0..4]` is a length
/// sentinel equal to `variable.len()`; `fixed.len() % ty.fixed_record_size
/// == 0`.
#[derive(Debug, Clone)]
pub struct Extent {
    pub ty: Arc<ExtentType>,
    fixed: Vec<u8>,
    variable: Vec<u8>,
}

impl Extent {
    /// An empty extent of the given type, ready to have records appended.
    pub fn new_empty(ty: Arc<ExtentType>) -> Extent {
        let mut variable = Vec::with_capacity(4);
        variable.extend_from_slice(&0u32.to_le_bytes());
        Extent { ty, fixed: Vec::new(), variable }
    }

    /// Build an extent directly from already-packed fixed/variable byte
    /// arenas (used by the codec when unpacking from disk). Does not
    /// re-validate the pool sentinel; callers own that invariant.
    pub fn from_raw_parts(ty: Arc<ExtentType>, fixed: Vec<u8>, variable: Vec<u8>) -> Extent {
        Extent { ty, fixed, variable }
    }

    pub fn n_records(&self) -> usize {
        if self.ty.fixed_record_size == 0 {
            0
        } else {
            self.fixed.len() / self.ty.fixed_record_size
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_records() == 0
    }

    pub fn fixed_bytes(&self) -> &[u8] {
        &self.fixed
    }

    pub fn variable_bytes(&self) -> &[u8] {
        &self.variable
    }

    /// Append one zero-filled record and return its index.
    pub fn append_record(&mut self) -> usize {
        let idx = self.n_records();
        self.fixed
            .resize(self.fixed.len() + self.ty.fixed_record_size, 0);
        idx
    }

    fn record_slice(&self, record: usize) -> &[u8] {
        let size = self.ty.fixed_record_size;
        &self.fixed[record * size..(record + 1) * size]
    }

    fn record_slice_mut(&mut self, record: usize) -> &mut [u8] {
        let size = self.ty.fixed_record_size;
        &mut self.fixed[record * size..(record + 1) * size]
    }

    pub fn is_null(&self, record: usize, field: &Field) -> bool {
        match field.null_bit {
            None => false,
            Some(bit) => {
                let byte = self.record_slice(record)[bit / 8];
                (byte >> (bit % 8)) & 1 == 1
            }
        }
    }

    pub fn set_null(&mut self, record: usize, field: &Field, null: bool) {
        let Some(bit) = field.null_bit else { return };
        let slot = &mut self.record_slice_mut(record)[bit / 8];
        if null {
            *slot |= 1 << (bit % 8);
        } else {
            *slot &= !(1 << (bit % 8));
        }
    }

    fn check_type(&self, field: &Field, expected: FieldType) -> Result<()> {
        if field.field_type != expected {
            return Err(Error::TypeMismatch {
                expected: expected.name().to_string(),
                found: field.field_type.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn get_bool(&self, record: usize, field: &Field) -> Result<bool> {
        self.check_type(field, FieldType::Bool)?;
        Ok(self.record_slice(record)[field.offset] != 0)
    }

    pub fn set_bool(&mut self, record: usize, field: &Field, value: bool) -> Result<()> {
        self.check_type(field, FieldType::Bool)?;
        self.record_slice_mut(record)[field.offset] = value as u8;
        self.set_null(record, field, false);
        Ok(())
    }

    pub fn get_byte(&self, record: usize, field: &Field) -> Result<u8> {
        self.check_type(field, FieldType::Byte)?;
        Ok(self.record_slice(record)[field.offset])
    }

    pub fn set_byte(&mut self, record: usize, field: &Field, value: u8) -> Result<()> {
        self.check_type(field, FieldType::Byte)?;
        self.record_slice_mut(record)[field.offset] = value;
        self.set_null(record, field, false);
        Ok(())
    }

    pub fn get_i32(&self, record: usize, field: &Field) -> Result<i32> {
        self.check_type(field, FieldType::Int32)?;
        let off = field.offset;
        let bytes = &self.record_slice(record)[off..off + 4];
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn set_i32(&mut self, record: usize, field: &Field, value: i32) -> Result<()> {
        self.check_type(field, FieldType::Int32)?;
        let off = field.offset;
        self.record_slice_mut(record)[off..off + 4].copy_from_slice(&value.to_le_bytes());
        self.set_null(record, field, false);
        Ok(())
    }

    pub fn get_i64(&self, record: usize, field: &Field) -> Result<i64> {
        self.check_type(field, FieldType::Int64)?;
        let off = field.offset;
        let bytes = &self.record_slice(record)[off..off + 8];
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn set_i64(&mut self, record: usize, field: &Field, value: i64) -> Result<()> {
        self.check_type(field, FieldType::Int64)?;
        let off = field.offset;
        self.record_slice_mut(record)[off..off + 8].copy_from_slice(&value.to_le_bytes());
        self.set_null(record, field, false);
        Ok(())
    }

    pub fn get_variable32(&self, record: usize, field: &Field) -> Result<&[u8]> {
        self.check_type(field, FieldType::Variable32)?;
        let off = field.offset;
        let bytes = &self.record_slice(record)[off..off + 4];
        let pool_offset = u32::from_le_bytes(bytes.try_into().unwrap());
        if pool_offset == EMPTY_VAR_OFFSET {
            return Ok(&[]);
        }
        let pool_offset = pool_offset as usize;
        let len_bytes = &self.variable[pool_offset..pool_offset + 4];
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        Ok(&self.variable[pool_offset + 4..pool_offset + 4 + len])
    }

    /// Raw pool offset currently stored for `field` at `record` (the decoded
    /// `variable32` slot value, before following it into the pool). Used by
    /// `pack_unique` dedup to learn the offset a fresh `set_variable32` call
    /// just assigned.
    pub fn get_variable32_offset(&self, record: usize, field: &Field) -> Result<u32> {
        self.check_type(field, FieldType::Variable32)?;
        let off = field.offset;
        let bytes = &self.record_slice(record)[off..off + 4];
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Append `value` to the string pool and point `field` at it.
    ///
    /// Every call appends a fresh entry; deduplication for `pack_unique`
    /// fields happens later, in the codec's pre-compression transform, not
    /// here (spec §3: the extent buffer is a dumb arena).
    pub fn set_variable32(&mut self, record: usize, field: &Field, value: &[u8]) -> Result<()> {
        self.check_type(field, FieldType::Variable32)?;
        let pool_offset = if value.is_empty() {
            EMPTY_VAR_OFFSET
        } else {
            let offset = self.variable.len() as u32;
            self.variable.extend_from_slice(&(value.len() as u32).to_le_bytes());
            self.variable.extend_from_slice(value);
            offset
        };
        self.point_variable32_at(record, field, pool_offset);
        Ok(())
    }

    /// Point `field` at an already-existing pool entry instead of appending
    /// a new one. Used by `pack_unique` dedup (spec §4.1), where several
    /// records must share one physical string-pool entry.
    pub fn point_variable32_at(&mut self, record: usize, field: &Field, pool_offset: u32) {
        let off = field.offset;
        self.record_slice_mut(record)[off..off + 4].copy_from_slice(&pool_offset.to_le_bytes());
        self.set_null(record, field, false);
        let len = self.variable.len() as u32;
        self.variable[0..4].copy_from_slice(&len.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PackHints;

    fn make_type() -> Arc<ExtentType> {
        ExtentType::new(
            "test",
            "T",
            (1, 0),
            vec![
                Field {
                    name: "k".into(),
                    field_type: FieldType::Int32,
                    nullable: false,
                    pack: PackHints::default(),
                    offset: 0,
                    null_bit: None,
                },
                Field {
                    name: "s".into(),
                    field_type: FieldType::Variable32,
                    nullable: true,
                    pack: PackHints::default(),
                    offset: 0,
                    null_bit: None,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn append_and_read_back_fixed_and_variable_fields() {
        let ty = make_type();
        let k = ty.field("k").unwrap().clone();
        let s = ty.field("s").unwrap().clone();
        let mut e = Extent::new_empty(Arc::clone(&ty));

        let r0 = e.append_record();
        e.set_i32(r0, &k, 42).unwrap();
        e.set_variable32(r0, &s, b"hello").unwrap();

        let r1 = e.append_record();
        e.set_i32(r1, &k, -7).unwrap();
        // leave s null on r1

        assert_eq!(e.n_records(), 2);
        assert_eq!(e.get_i32(r0, &k).unwrap(), 42);
        assert_eq!(e.get_variable32(r0, &s).unwrap(), b"hello");
        assert_eq!(e.get_i32(r1, &k).unwrap(), -7);
        assert!(e.is_null(r1, &s));
        assert_eq!(e.get_variable32(r1, &s).unwrap(), b"");
    }

    #[test]
    fn empty_string_reserves_offset_zero() {
        let ty = make_type();
        let s = ty.field("s").unwrap().clone();
        let mut e = Extent::new_empty(Arc::clone(&ty));
        let r = e.append_record();
        e.set_variable32(r, &s, b"").unwrap();
        assert_eq!(e.get_variable32(r, &s).unwrap(), b"");
    }
}
