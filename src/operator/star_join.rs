//! `Star-join` (spec §4.5): join one fact stream against several
//! dimension tables at once. Every dimension is small enough to fully
//! materialize (same shape as [`crate::operator::hash_join`]'s small side);
//! the fact table is streamed once.
//!
//! A fact row that misses one of its dimension lookups is handled per
//! [`MissPolicy`]: drop the row, repeat the last successful match for that
//! dimension, or fill the dimension's columns with `Null`.
//!
//! [`FactJoin::extract_values`] names which of a dimension's loaded
//! `value_columns` make it into the output and under what column name,
//! independent of how the dimension loaded them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::extent::value::{key_vector, GeneralField, GeneralValue};
use crate::extent::Extent;
use crate::operator::{extent_byte_size, Operator, TARGET_EXTENT_BYTES};
use crate::types::{ExtentType, Field};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissPolicy {
    SkipRow,
    LeavePrevious,
    Null,
}

/// A dimension table to join against: `key_columns` resolve on this
/// dimension's own type; `value_columns` name the columns loaded into the
/// dimension's lookup map and available for a [`FactJoin`]'s `extract_values`
/// to pull from (spec §4.5 `Dimension(dimension_name, source_table,
/// key_columns[], value_columns[])`).
pub struct Dimension {
    pub name: String,
    pub input: Box<dyn Operator>,
    pub key_columns: Vec<String>,
    pub value_columns: Vec<String>,
}

/// Names, for one dimension, which fact-side columns supply the join key
/// (same arity and order as that [`Dimension`]'s `key_columns`), and which of
/// the dimension's `value_columns` to project into the output and under what
/// name (spec §4.5 `DimensionFactJoin(dimension_name, fact_key_columns[],
/// extract_values: {dim_col -> output_col})`).
pub struct FactJoin {
    pub dimension_name: String,
    pub fact_key_columns: Vec<String>,
    pub extract_values: Vec<(String, String)>,
}

struct ResolvedDimension {
    map: HashMap<Vec<GeneralValue>, Vec<GeneralValue>>,
    fact_key_fields: Vec<GeneralField>,
    /// Index into the dimension's full value vector (ordered by
    /// [`Dimension::value_columns`]) for each `extract_values` entry, in the
    /// caller-chosen output order.
    extract_indices: Vec<usize>,
    out_start: usize,
    last_match: Vec<GeneralValue>,
    have_last_match: bool,
}

pub struct StarJoinOperator {
    fact: Box<dyn Operator>,
    fact_passthrough: Vec<GeneralField>,
    dims: Vec<ResolvedDimension>,
    miss_policy: MissPolicy,
    ty: Arc<ExtentType>,
    out_fields: Vec<GeneralField>,
}

impl StarJoinOperator {
    pub fn new(
        mut fact: Box<dyn Operator>,
        mut dimensions: Vec<Dimension>,
        joins: &[FactJoin],
        miss_policy: MissPolicy,
    ) -> Result<StarJoinOperator> {
        let fact_ty = fact.output_type();

        let mut out_fields: Vec<Field> = fact_ty.fields().to_vec();
        let fact_passthrough: Vec<GeneralField> =
            fact_ty.fields().iter().map(|f| GeneralField::new(&fact_ty, &f.name)).collect::<Result<_>>()?;

        let mut dims = Vec::with_capacity(dimensions.len());
        for dim in dimensions.drain(..) {
            let join = joins
                .iter()
                .find(|j| j.dimension_name == dim.name)
                .ok_or_else(|| Error::RequestError(format!("no fact join declared for dimension '{}'", dim.name)))?;
            if join.fact_key_columns.len() != dim.key_columns.len() {
                return Err(Error::RequestError(format!(
                    "dimension '{}' has {} key columns but its fact join names {}",
                    dim.name,
                    dim.key_columns.len(),
                    join.fact_key_columns.len()
                )));
            }

            let mut dim_input = dim.input;
            let dim_ty = dim_input.output_type();
            let dim_key_fields: Vec<GeneralField> =
                dim.key_columns.iter().map(|c| GeneralField::new(&dim_ty, c)).collect::<Result<_>>()?;
            let dim_value_fields: Vec<GeneralField> =
                dim.value_columns.iter().map(|c| GeneralField::new(&dim_ty, c)).collect::<Result<_>>()?;
            let fact_key_fields: Vec<GeneralField> =
                join.fact_key_columns.iter().map(|c| GeneralField::new(&fact_ty, c)).collect::<Result<_>>()?;

            let extract_indices: Vec<usize> = join
                .extract_values
                .iter()
                .map(|(dim_col, _)| {
                    dim.value_columns.iter().position(|c| c == dim_col).ok_or_else(|| {
                        Error::RequestError(format!(
                            "dimension '{}' has no value column '{}' named by its fact join's extract_values",
                            dim.name, dim_col
                        ))
                    })
                })
                .collect::<Result<_>>()?;

            let out_start = out_fields.len();
            for ((_dim_col, output_col), &idx) in join.extract_values.iter().zip(extract_indices.iter()) {
                out_fields.push(Field {
                    name: output_col.clone(),
                    field_type: dim_value_fields[idx].field().field_type,
                    // Always nullable: a miss under `MissPolicy::Null` must
                    // be representable regardless of the source column.
                    nullable: true,
                    pack: Default::default(),
                    offset: 0,
                    null_bit: None,
                });
            }

            let mut map: HashMap<Vec<GeneralValue>, Vec<GeneralValue>> = HashMap::new();
            while let Some(extent) = dim_input.get_extent()? {
                for row in 0..extent.n_records() {
                    let key = key_vector(&extent, row, &dim_key_fields)?;
                    let value = key_vector(&extent, row, &dim_value_fields)?;
                    map.insert(key, value);
                }
            }

            dims.push(ResolvedDimension {
                map,
                fact_key_fields,
                extract_indices,
                out_start,
                last_match: Vec::new(),
                have_last_match: false,
            });
        }

        let ty = ExtentType::new(
            fact_ty.namespace.clone(),
            format!("{}::StarJoin", fact_ty.name),
            (fact_ty.major_version, fact_ty.minor_version),
            out_fields,
        )?;
        let out_field_handles: Vec<GeneralField> =
            ty.fields().iter().map(|f| GeneralField::new(&ty, &f.name)).collect::<Result<_>>()?;

        Ok(StarJoinOperator { fact, fact_passthrough, dims, miss_policy, ty, out_fields: out_field_handles })
    }
}

impl Operator for StarJoinOperator {
    fn output_type(&self) -> Arc<ExtentType> {
        Arc::clone(&self.ty)
    }

    fn get_extent(&mut self) -> Result<Option<Extent>> {
        let mut out = Extent::new_empty(Arc::clone(&self.ty));
        loop {
            let Some(fact_extent) = self.fact.get_extent()? else {
                return Ok(if out.is_empty() { None } else { Some(out) });
            };

            'rows: for row in 0..fact_extent.n_records() {
                let mut dim_values: Vec<Vec<GeneralValue>> = Vec::with_capacity(self.dims.len());
                for dim in self.dims.iter_mut() {
                    let key = key_vector(&fact_extent, row, &dim.fact_key_fields)?;
                    if let Some(values) = dim.map.get(&key) {
                        let extracted: Vec<GeneralValue> =
                            dim.extract_indices.iter().map(|&i| values[i].clone()).collect();
                        dim.last_match = extracted.clone();
                        dim.have_last_match = true;
                        dim_values.push(extracted);
                        continue;
                    }
                    match self.miss_policy {
                        MissPolicy::SkipRow => continue 'rows,
                        MissPolicy::Null => {
                            dim_values.push(vec![GeneralValue::Null; dim.extract_indices.len()])
                        }
                        MissPolicy::LeavePrevious => {
                            if dim.have_last_match {
                                dim_values.push(dim.last_match.clone());
                            } else {
                                dim_values.push(vec![GeneralValue::Null; dim.extract_indices.len()]);
                            }
                        }
                    }
                }

                let out_row = out.append_record();
                for (field, src_field) in self.out_fields.iter().zip(self.fact_passthrough.iter()) {
                    let value = src_field.get(&fact_extent, row)?;
                    field.set(&mut out, out_row, &value)?;
                }
                for (dim, values) in self.dims.iter().zip(dim_values.iter()) {
                    for (i, value) in values.iter().enumerate() {
                        self.out_fields[dim.out_start + i].set(&mut out, out_row, value)?;
                    }
                }
            }

            if extent_byte_size(&out) >= TARGET_EXTENT_BYTES {
                return Ok(Some(out));
            }
        }
    }
}
