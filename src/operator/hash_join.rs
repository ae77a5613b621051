//! `Hash-join` (spec §4.5): the small `a_input` side is fully materialized
//! into a hash map keyed by the equality columns; the large `b_input` side
//! is streamed, probing the map once per row.
//!
//! Equality columns are never duplicated in the stored map values — a kept
//! `a`-side equality column is read back from `b`'s equivalent field at
//! output time (spec: "eq columns are not duplicated — they are read from
//! the `b` side at output time"), which is why [`Extractor::AEqFromB`]
//! exists alongside the simpler by-position [`Extractor::AValue`] and
//! direct [`Extractor::BColumn`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::extent::value::{GeneralField, GeneralValue};
use crate::extent::Extent;
use crate::operator::{extent_byte_size, Operator, TARGET_EXTENT_BYTES};
use crate::types::{ExtentType, Field};

/// One equality condition: `a.a_field == b.b_field`.
#[derive(Debug, Clone)]
pub struct EqColumn {
    pub a_field: String,
    pub b_field: String,
}

/// Which side (and field) a kept output column is read from.
#[derive(Debug, Clone)]
pub enum KeepSource {
    A(String),
    B(String),
}

/// One output column: a rename plus a source.
#[derive(Debug, Clone)]
pub struct KeepColumn {
    pub output_name: String,
    pub source: KeepSource,
}

enum Extractor {
    /// Read position `.0` of the stored per-key value vector (an `a`-side
    /// column that is not one of the equality columns).
    AValue(usize),
    /// An `a`-side equality column: read the matching `b` field instead of
    /// storing a duplicate copy.
    AEqFromB(GeneralField),
    /// A plain `b`-side column.
    BColumn(GeneralField),
}

pub struct HashJoinOperator {
    b_input: Box<dyn Operator>,
    map: HashMap<Vec<GeneralValue>, Vec<Vec<GeneralValue>>>,
    b_eq_fields: Vec<GeneralField>,
    extractors: Vec<Extractor>,
    out_fields: Vec<GeneralField>,
    ty: Arc<ExtentType>,
    pending_matches: Vec<Vec<GeneralValue>>,
    pending_b_extent: Option<Extent>,
    pending_b_row: usize,
}

impl HashJoinOperator {
    /// Materializes `a_input` into the hash map eagerly; fails with
    /// [`Error::TooManyLeftRows`] if it has more than `max_a_rows` rows
    /// (spec §4.5 guard).
    pub fn new(
        mut a_input: Box<dyn Operator>,
        b_input: Box<dyn Operator>,
        eq_columns: &[EqColumn],
        keep_columns: &[KeepColumn],
        max_a_rows: usize,
    ) -> Result<HashJoinOperator> {
        let a_ty = a_input.output_type();
        let b_ty = b_input.output_type();

        let a_eq_fields: Vec<GeneralField> = eq_columns
            .iter()
            .map(|c| GeneralField::new(&a_ty, &c.a_field))
            .collect::<Result<_>>()?;
        let b_eq_fields: Vec<GeneralField> = eq_columns
            .iter()
            .map(|c| GeneralField::new(&b_ty, &c.b_field))
            .collect::<Result<_>>()?;

        // Resolve which `a`-side (non-equality) columns must be stored, in
        // the order the map's value vectors will hold them.
        let mut a_value_fields: Vec<GeneralField> = Vec::new();
        let mut a_value_index: HashMap<String, usize> = HashMap::new();
        let mut out_fields: Vec<Field> = Vec::with_capacity(keep_columns.len());
        let mut extractors: Vec<Extractor> = Vec::with_capacity(keep_columns.len());

        for keep in keep_columns {
            match &keep.source {
                KeepSource::A(name) => {
                    if let Some(eq_idx) = eq_columns.iter().position(|c| &c.a_field == name) {
                        let b_field = GeneralField::new(&b_ty, &eq_columns[eq_idx].b_field)?;
                        out_fields.push(renamed(b_field.field(), &keep.output_name));
                        extractors.push(Extractor::AEqFromB(b_field));
                    } else {
                        let idx = match a_value_index.get(name) {
                            Some(&idx) => idx,
                            None => {
                                let field = GeneralField::new(&a_ty, name)?;
                                a_value_fields.push(field);
                                let idx = a_value_fields.len() - 1;
                                a_value_index.insert(name.clone(), idx);
                                idx
                            }
                        };
                        let field = a_value_fields[idx].field().clone();
                        out_fields.push(renamed(&field, &keep.output_name));
                        extractors.push(Extractor::AValue(idx));
                    }
                }
                KeepSource::B(name) => {
                    let field = GeneralField::new(&b_ty, name)?;
                    out_fields.push(renamed(field.field(), &keep.output_name));
                    extractors.push(Extractor::BColumn(field));
                }
            }
        }

        let ty = ExtentType::new(
            b_ty.namespace.clone(),
            format!("{}::Join::{}", a_ty.name, b_ty.name),
            (1, 0),
            out_fields,
        )?;
        let out_field_handles: Vec<GeneralField> = ty
            .fields()
            .iter()
            .map(|f| GeneralField::new(&ty, &f.name))
            .collect::<Result<_>>()?;

        let mut map: HashMap<Vec<GeneralValue>, Vec<Vec<GeneralValue>>> = HashMap::new();
        let mut a_rows = 0usize;
        while let Some(extent) = a_input.get_extent()? {
            for row in 0..extent.n_records() {
                a_rows += 1;
                if a_rows > max_a_rows {
                    return Err(Error::TooManyLeftRows { limit: max_a_rows, actual: a_rows });
                }
                let key: Vec<GeneralValue> =
                    a_eq_fields.iter().map(|f| f.get(&extent, row)).collect::<Result<_>>()?;
                let value: Vec<GeneralValue> =
                    a_value_fields.iter().map(|f| f.get(&extent, row)).collect::<Result<_>>()?;
                map.entry(key).or_default().push(value);
            }
        }

        Ok(HashJoinOperator {
            b_input,
            map,
            b_eq_fields,
            extractors,
            out_fields: out_field_handles,
            ty,
            pending_matches: Vec::new(),
            pending_b_extent: None,
            pending_b_row: 0,
        })
    }
}

fn renamed(field: &Field, output_name: &str) -> Field {
    Field {
        name: output_name.to_string(),
        field_type: field.field_type,
        nullable: field.nullable,
        pack: field.pack.clone(),
        offset: 0,
        null_bit: None,
    }
}

impl Operator for HashJoinOperator {
    fn output_type(&self) -> Arc<ExtentType> {
        Arc::clone(&self.ty)
    }

    fn get_extent(&mut self) -> Result<Option<Extent>> {
        let mut out = Extent::new_empty(Arc::clone(&self.ty));
        loop {
            if self.pending_matches.is_empty() {
                if self.pending_b_extent.is_none() {
                    self.pending_b_extent = self.b_input.get_extent()?;
                    self.pending_b_row = 0;
                }
                let Some(b_extent) = self.pending_b_extent.as_ref() else {
                    return Ok(if out.is_empty() { None } else { Some(out) });
                };
                if self.pending_b_row >= b_extent.n_records() {
                    self.pending_b_extent = None;
                    continue;
                }
                let row = self.pending_b_row;
                self.pending_b_row += 1;
                let key: Vec<GeneralValue> =
                    self.b_eq_fields.iter().map(|f| f.get(b_extent, row)).collect::<Result<_>>()?;
                if let Some(matches) = self.map.get(&key) {
                    self.pending_matches = matches.clone();
                }
                continue;
            }

            let b_extent = self.pending_b_extent.as_ref().expect("set above");
            let b_row = self.pending_b_row - 1;
            let a_values = self.pending_matches.pop().expect("checked non-empty");
            let out_row = out.append_record();
            for (col, extractor) in self.extractors.iter().enumerate() {
                let value = match extractor {
                    Extractor::AValue(idx) => a_values[*idx].clone(),
                    Extractor::AEqFromB(field) => field.get(b_extent, b_row)?,
                    Extractor::BColumn(field) => field.get(b_extent, b_row)?,
                };
                self.out_fields[col].set(&mut out, out_row, &value)?;
            }

            if extent_byte_size(&out) >= TARGET_EXTENT_BYTES {
                return Ok(Some(out));
            }
        }
    }
}
