//! `Sorted-update` (spec §4.5): merge a base table (sorted by primary key)
//! with a stream of updates (also sorted by primary key), folding each
//! update row's operation — insert, replace, or delete — into the output as
//! the merge walks both streams in lockstep.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::extent::value::{GeneralField, GeneralValue, RecordCopier};
use crate::extent::Extent;
use crate::operator::{extent_byte_size, Operator, TARGET_EXTENT_BYTES};
use crate::types::ExtentType;

pub const OP_INSERT: i64 = 1;
pub const OP_REPLACE: i64 = 2;
pub const OP_DELETE: i64 = 3;

struct Cursor {
    current: Option<Extent>,
    row: usize,
}

impl Cursor {
    fn ensure(&mut self, input: &mut dyn Operator) -> Result<bool> {
        loop {
            if let Some(e) = &self.current {
                if self.row < e.n_records() {
                    return Ok(true);
                }
            }
            self.current = input.get_extent()?;
            self.row = 0;
            if self.current.is_none() {
                return Ok(false);
            }
        }
    }
}

pub struct SortedUpdateOperator {
    base: Box<dyn Operator>,
    update: Box<dyn Operator>,
    base_key: GeneralField,
    update_key: GeneralField,
    op_field: GeneralField,
    base_copier: RecordCopier,
    update_copier: RecordCopier,
    ty: Arc<ExtentType>,
    base_state: Cursor,
    update_state: Cursor,
}

impl SortedUpdateOperator {
    /// `primary_key` names the shared key column on both `base` and `update`.
    /// `update_column` names `update`'s int field carrying [`OP_INSERT`] /
    /// [`OP_REPLACE`] / [`OP_DELETE`]. Every other same-named field on
    /// `update` is folded into the output in place of `base`'s value.
    pub fn new(
        base: Box<dyn Operator>,
        update: Box<dyn Operator>,
        primary_key: &str,
        update_column: &str,
    ) -> Result<SortedUpdateOperator> {
        let base_ty = base.output_type();
        let update_ty = update.output_type();
        let base_key = GeneralField::new(&base_ty, primary_key)?;
        let update_key = GeneralField::new(&update_ty, primary_key)?;
        let op_field = GeneralField::new(&update_ty, update_column)?;

        let rename: Vec<(String, String)> = base_ty
            .fields()
            .iter()
            .filter(|f| update_ty.field(&f.name).is_some())
            .map(|f| (f.name.clone(), f.name.clone()))
            .collect();
        let update_copier = RecordCopier::new(&update_ty, &base_ty, &rename)?;
        let base_copier = RecordCopier::identity(&base_ty);

        Ok(SortedUpdateOperator {
            base,
            update,
            base_key,
            update_key,
            op_field,
            base_copier,
            update_copier,
            ty: base_ty,
            base_state: Cursor { current: None, row: 0 },
            update_state: Cursor { current: None, row: 0 },
        })
    }

    fn op_value(&self, extent: &Extent, row: usize) -> Result<i64> {
        Ok(match self.op_field.get(extent, row)? {
            GeneralValue::Int32(v) => v as i64,
            GeneralValue::Int64(v) => v,
            GeneralValue::Byte(v) => v as i64,
            other => {
                return Err(Error::RequestError(format!(
                    "sorted-update op column must be an integer, found {other:?}"
                )))
            }
        })
    }
}

impl Operator for SortedUpdateOperator {
    fn output_type(&self) -> Arc<ExtentType> {
        Arc::clone(&self.ty)
    }

    fn get_extent(&mut self) -> Result<Option<Extent>> {
        let mut out = Extent::new_empty(Arc::clone(&self.ty));
        loop {
            let have_base = self.base_state.ensure(self.base.as_mut())?;
            let have_update = self.update_state.ensure(self.update.as_mut())?;

            if !have_base && !have_update {
                return Ok(if out.is_empty() { None } else { Some(out) });
            }

            let base_key = if have_base {
                Some(self.base_key.get(self.base_state.current.as_ref().unwrap(), self.base_state.row)?)
            } else {
                None
            };
            let update_key = if have_update {
                Some(self.update_key.get(self.update_state.current.as_ref().unwrap(), self.update_state.row)?)
            } else {
                None
            };

            let take_base_only = have_base && (!have_update || base_key.as_ref().unwrap() < update_key.as_ref().unwrap());
            let take_update_only = !take_base_only
                && have_update
                && (!have_base || update_key.as_ref().unwrap() < base_key.as_ref().unwrap());

            if take_base_only {
                let extent = self.base_state.current.as_ref().unwrap().clone();
                self.base_copier.copy_row(&extent, self.base_state.row, &mut out)?;
                self.base_state.row += 1;
            } else if take_update_only {
                // Update key strictly ahead of base (or base exhausted): insert and
                // replace both land as a fresh row, delete is already gone.
                let extent = self.update_state.current.as_ref().unwrap().clone();
                let op = self.op_value(&extent, self.update_state.row)?;
                match op {
                    OP_INSERT | OP_REPLACE => {
                        self.update_copier.copy_row(&extent, self.update_state.row, &mut out)?;
                    }
                    OP_DELETE => {
                        // No matching base row: no-op.
                    }
                    other => {
                        return Err(Error::RequestError(format!(
                            "invalid sorted-update op value {other}"
                        )))
                    }
                }
                self.update_state.row += 1;
            } else {
                // Equal keys: base and update both name the same row. Insert emits
                // the update row and advances only the update side, leaving base to
                // be compared again; replace emits and advances both; delete drops
                // the row and advances both.
                let update_extent = self.update_state.current.as_ref().unwrap().clone();
                let op = self.op_value(&update_extent, self.update_state.row)?;
                match op {
                    OP_INSERT => {
                        self.update_copier.copy_row(&update_extent, self.update_state.row, &mut out)?;
                        self.update_state.row += 1;
                    }
                    OP_REPLACE => {
                        self.update_copier.copy_row(&update_extent, self.update_state.row, &mut out)?;
                        self.base_state.row += 1;
                        self.update_state.row += 1;
                    }
                    OP_DELETE => {
                        // Row removed, emit nothing.
                        self.base_state.row += 1;
                        self.update_state.row += 1;
                    }
                    other => {
                        return Err(Error::RequestError(format!(
                            "invalid sorted-update op value {other}"
                        )))
                    }
                }
            }

            if extent_byte_size(&out) >= TARGET_EXTENT_BYTES {
                return Ok(Some(out));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::VecSource;
    use crate::types::{Field, FieldType, PackHints};

    fn base_type() -> Arc<ExtentType> {
        ExtentType::new(
            "t",
            "Base",
            (1, 0),
            vec![
                Field { name: "id".into(), field_type: FieldType::Int32, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
                Field { name: "val".into(), field_type: FieldType::Int32, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
            ],
        )
        .unwrap()
    }

    fn update_type() -> Arc<ExtentType> {
        ExtentType::new(
            "t",
            "Update",
            (1, 0),
            vec![
                Field { name: "id".into(), field_type: FieldType::Int32, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
                Field { name: "val".into(), field_type: FieldType::Int32, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
                Field { name: "op".into(), field_type: FieldType::Int32, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
            ],
        )
        .unwrap()
    }

    #[test]
    fn folds_insert_replace_and_delete() {
        let base_ty = base_type();
        let (id, val) = (base_ty.field("id").unwrap().clone(), base_ty.field("val").unwrap().clone());
        let mut base = Extent::new_empty(Arc::clone(&base_ty));
        for (i, v) in [(1, 10), (2, 20), (3, 30)] {
            let r = base.append_record();
            base.set_i32(r, &id, i).unwrap();
            base.set_i32(r, &val, v).unwrap();
        }

        let update_ty = update_type();
        let (uid, uval, uop) = (
            update_ty.field("id").unwrap().clone(),
            update_ty.field("val").unwrap().clone(),
            update_ty.field("op").unwrap().clone(),
        );
        let mut update = Extent::new_empty(Arc::clone(&update_ty));
        // delete id=2, replace id=3 with 99, insert id=4 with 40.
        for (i, v, op) in [(2, 0, OP_DELETE), (3, 99, OP_REPLACE), (4, 40, OP_INSERT)] {
            let r = update.append_record();
            update.set_i32(r, &uid, i).unwrap();
            update.set_i32(r, &uval, v as i32).unwrap();
            update.set_i32(r, &uop, op as i32).unwrap();
        }

        let base_src = VecSource::new(Arc::clone(&base_ty), vec![base]);
        let update_src = VecSource::new(Arc::clone(&update_ty), vec![update]);
        let mut op = SortedUpdateOperator::new(Box::new(base_src), Box::new(update_src), "id", "op").unwrap();

        let out_id = op.output_type().field("id").unwrap().clone();
        let out_val = op.output_type().field("val").unwrap().clone();
        let mut rows = Vec::new();
        while let Some(e) = op.get_extent().unwrap() {
            for r in 0..e.n_records() {
                rows.push((e.get_i32(r, &out_id).unwrap(), e.get_i32(r, &out_val).unwrap()));
            }
        }
        assert_eq!(rows, vec![(1, 10), (3, 99), (4, 40)]);
    }

    #[test]
    fn replace_with_no_matching_base_row_is_emitted_as_an_insert() {
        let base_ty = base_type();
        let base_src = VecSource::new(Arc::clone(&base_ty), vec![]);

        let update_ty = update_type();
        let (uid, uval, uop) = (
            update_ty.field("id").unwrap().clone(),
            update_ty.field("val").unwrap().clone(),
            update_ty.field("op").unwrap().clone(),
        );
        let mut update = Extent::new_empty(Arc::clone(&update_ty));
        let r = update.append_record();
        update.set_i32(r, &uid, 7).unwrap();
        update.set_i32(r, &uval, 1).unwrap();
        update.set_i32(r, &uop, OP_REPLACE as i32).unwrap();
        let update_src = VecSource::new(Arc::clone(&update_ty), vec![update]);

        let mut op = SortedUpdateOperator::new(Box::new(base_src), Box::new(update_src), "id", "op").unwrap();
        let out_id = op.output_type().field("id").unwrap().clone();
        let out_val = op.output_type().field("val").unwrap().clone();
        let mut rows = Vec::new();
        while let Some(e) = op.get_extent().unwrap() {
            for r in 0..e.n_records() {
                rows.push((e.get_i32(r, &out_id).unwrap(), e.get_i32(r, &out_val).unwrap()));
            }
        }
        assert_eq!(rows, vec![(7, 1)]);
    }

    #[test]
    fn delete_ahead_of_base_is_a_silent_no_op() {
        let base_ty = base_type();
        let base_src = VecSource::new(Arc::clone(&base_ty), vec![]);

        let update_ty = update_type();
        let (uid, uval, uop) = (
            update_ty.field("id").unwrap().clone(),
            update_ty.field("val").unwrap().clone(),
            update_ty.field("op").unwrap().clone(),
        );
        let mut update = Extent::new_empty(Arc::clone(&update_ty));
        let r = update.append_record();
        update.set_i32(r, &uid, 7).unwrap();
        update.set_i32(r, &uval, 0).unwrap();
        update.set_i32(r, &uop, OP_DELETE as i32).unwrap();
        let update_src = VecSource::new(Arc::clone(&update_ty), vec![update]);

        let mut op = SortedUpdateOperator::new(Box::new(base_src), Box::new(update_src), "id", "op").unwrap();
        assert!(op.get_extent().unwrap().is_none());
    }

    #[test]
    fn insert_at_an_equal_key_emits_ahead_of_the_matching_base_row() {
        let base_ty = base_type();
        let (id, val) = (base_ty.field("id").unwrap().clone(), base_ty.field("val").unwrap().clone());
        let mut base = Extent::new_empty(Arc::clone(&base_ty));
        let r = base.append_record();
        base.set_i32(r, &id, 5).unwrap();
        base.set_i32(r, &val, 50).unwrap();
        let base_src = VecSource::new(Arc::clone(&base_ty), vec![base]);

        let update_ty = update_type();
        let (uid, uval, uop) = (
            update_ty.field("id").unwrap().clone(),
            update_ty.field("val").unwrap().clone(),
            update_ty.field("op").unwrap().clone(),
        );
        let mut update = Extent::new_empty(Arc::clone(&update_ty));
        let r = update.append_record();
        update.set_i32(r, &uid, 5).unwrap();
        update.set_i32(r, &uval, 99).unwrap();
        update.set_i32(r, &uop, OP_INSERT as i32).unwrap();
        let update_src = VecSource::new(Arc::clone(&update_ty), vec![update]);

        let mut op = SortedUpdateOperator::new(Box::new(base_src), Box::new(update_src), "id", "op").unwrap();
        let out_id = op.output_type().field("id").unwrap().clone();
        let out_val = op.output_type().field("val").unwrap().clone();
        let mut rows = Vec::new();
        while let Some(e) = op.get_extent().unwrap() {
            for r in 0..e.n_records() {
                rows.push((e.get_i32(r, &out_id).unwrap(), e.get_i32(r, &out_val).unwrap()));
            }
        }
        assert_eq!(rows, vec![(5, 99), (5, 50)]);
    }

    #[test]
    fn invalid_op_value_is_a_request_error() {
        let base_ty = base_type();
        let (id, val) = (base_ty.field("id").unwrap().clone(), base_ty.field("val").unwrap().clone());
        let mut base = Extent::new_empty(Arc::clone(&base_ty));
        let r = base.append_record();
        base.set_i32(r, &id, 5).unwrap();
        base.set_i32(r, &val, 50).unwrap();
        let base_src = VecSource::new(Arc::clone(&base_ty), vec![base]);

        let update_ty = update_type();
        let (uid, uval, uop) = (
            update_ty.field("id").unwrap().clone(),
            update_ty.field("val").unwrap().clone(),
            update_ty.field("op").unwrap().clone(),
        );
        let mut update = Extent::new_empty(Arc::clone(&update_ty));
        let r = update.append_record();
        update.set_i32(r, &uid, 5).unwrap();
        update.set_i32(r, &uval, 0).unwrap();
        update.set_i32(r, &uop, 99).unwrap();
        let update_src = VecSource::new(Arc::clone(&update_ty), vec![update]);

        let mut op = SortedUpdateOperator::new(Box::new(base_src), Box::new(update_src), "id", "op").unwrap();
        assert!(matches!(op.get_extent(), Err(Error::RequestError(_))));
    }
}
