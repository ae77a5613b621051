//! `Union` (spec §4.5): merge several operator trees into one stream, keyed
//! by a shared set of order columns, tie-broken by the source's position in
//! the input list. Each source may name its own columns differently; a
//! per-source `(output_name, source_name)` map resolves that before the
//! merge key is read.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::extent::value::{key_vector, GeneralField, GeneralValue, RecordCopier};
use crate::extent::Extent;
use crate::operator::sort::SortColumn;
use crate::operator::{extent_byte_size, Operator, TARGET_EXTENT_BYTES};
use crate::types::{ExtentType, Field};

/// One input to a union: an operator plus the `(output_name, source_name)`
/// mapping from this source's own field names to the union's output schema.
pub struct UnionSource {
    pub input: Box<dyn Operator>,
    pub columns: Vec<(String, String)>,
}

struct SourceState {
    input: Box<dyn Operator>,
    copier: RecordCopier,
    order_fields: Vec<GeneralField>,
    current: Option<Extent>,
    cursor: usize,
}

#[derive(Clone)]
struct Key {
    values: Vec<GeneralValue>,
    descending: Arc<Vec<bool>>,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in 0..self.values.len() {
            let ord = self.values[i].cmp(&other.values[i]);
            if ord != Ordering::Equal {
                return if self.descending[i] { ord.reverse() } else { ord };
            }
        }
        Ordering::Equal
    }
}

#[derive(Clone, PartialEq, Eq)]
struct HeapEntry {
    key: Key,
    source: usize,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Tie-break by earlier source position (spec: "tie-break by source
        // order"): smaller `source` wins.
        self.key.cmp(&other.key).then_with(|| self.source.cmp(&other.source))
    }
}

pub struct UnionOperator {
    sources: Vec<SourceState>,
    ty: Arc<ExtentType>,
    descending: Arc<Vec<bool>>,
}

impl UnionOperator {
    pub fn new(mut sources: Vec<UnionSource>, order_columns: &[SortColumn]) -> Result<UnionOperator> {
        if sources.is_empty() {
            return Err(Error::RequestError("union requires at least one source".into()));
        }

        let first_ty = sources[0].input.output_type();
        let mut out_fields: Vec<Field> = Vec::with_capacity(sources[0].columns.len());
        for (out_name, src_name) in &sources[0].columns {
            let f = first_ty
                .field(src_name)
                .ok_or_else(|| Error::FieldNotFound { type_name: first_ty.name.clone(), field: src_name.clone() })?;
            out_fields.push(Field {
                name: out_name.clone(),
                field_type: f.field_type,
                nullable: f.nullable,
                pack: f.pack.clone(),
                offset: 0,
                null_bit: None,
            });
        }
        let ty = ExtentType::new(
            first_ty.namespace.clone(),
            format!("{}::Union", first_ty.name),
            (first_ty.major_version, first_ty.minor_version),
            out_fields,
        )?;

        // Every source's mapped columns must agree in type with the output
        // column they feed (spec §9: "rename maps must agree on type per
        // output column").
        for src in &sources {
            let src_ty = src.input.output_type();
            for (out_name, src_name) in &src.columns {
                let out_field = ty
                    .field(out_name)
                    .ok_or_else(|| Error::FieldNotFound { type_name: ty.name.clone(), field: out_name.clone() })?;
                let sf = src_ty
                    .field(src_name)
                    .ok_or_else(|| Error::FieldNotFound { type_name: src_ty.name.clone(), field: src_name.clone() })?;
                if sf.field_type != out_field.field_type {
                    return Err(Error::TypeMismatch {
                        expected: out_field.field_type.name().to_string(),
                        found: sf.field_type.name().to_string(),
                    });
                }
            }
        }

        let descending = Arc::new(order_columns.iter().map(|c| c.descending).collect());

        let mut states = Vec::with_capacity(sources.len());
        for src in sources.drain(..) {
            let src_ty = src.input.output_type();
            let copier = RecordCopier::new(&src_ty, &ty, &src.columns)?;
            let mut order_fields = Vec::with_capacity(order_columns.len());
            for oc in order_columns {
                let src_name = src
                    .columns
                    .iter()
                    .find(|(out_name, _)| out_name == &oc.field)
                    .map(|(_, src_name)| src_name.clone())
                    .ok_or_else(|| Error::FieldNotFound { type_name: src_ty.name.clone(), field: oc.field.clone() })?;
                order_fields.push(GeneralField::new(&src_ty, &src_name)?);
            }
            states.push(SourceState { input: src.input, copier, order_fields, current: None, cursor: 0 });
        }

        Ok(UnionOperator { sources: states, ty, descending })
    }

    fn ensure_current(state: &mut SourceState) -> Result<bool> {
        loop {
            if let Some(e) = &state.current {
                if state.cursor < e.n_records() {
                    return Ok(true);
                }
            }
            state.current = state.input.get_extent()?;
            state.cursor = 0;
            if state.current.is_none() {
                return Ok(false);
            }
        }
    }

    fn current_key(state: &SourceState, descending: &Arc<Vec<bool>>) -> Result<Key> {
        let extent = state.current.as_ref().expect("ensure_current called first");
        let values = key_vector(extent, state.cursor, &state.order_fields)?;
        Ok(Key { values, descending: Arc::clone(descending) })
    }
}

impl Operator for UnionOperator {
    fn output_type(&self) -> Arc<ExtentType> {
        Arc::clone(&self.ty)
    }

    fn get_extent(&mut self) -> Result<Option<Extent>> {
        let mut out = Extent::new_empty(Arc::clone(&self.ty));

        let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();
        for (idx, state) in self.sources.iter_mut().enumerate() {
            if Self::ensure_current(state)? {
                let key = Self::current_key(state, &self.descending)?;
                heap.push(Reverse(HeapEntry { key, source: idx }));
            }
        }

        while let Some(Reverse(HeapEntry { source, .. })) = heap.pop() {
            {
                let state = &mut self.sources[source];
                let row = state.cursor;
                let extent = state.current.as_ref().expect("ensure_current called first").clone();
                state.copier.copy_row(&extent, row, &mut out)?;
                state.cursor += 1;
            }
            let state = &mut self.sources[source];
            if Self::ensure_current(state)? {
                let key = Self::current_key(state, &self.descending)?;
                heap.push(Reverse(HeapEntry { key, source }));
            }
            if extent_byte_size(&out) >= TARGET_EXTENT_BYTES {
                return Ok(Some(out));
            }
        }

        Ok(if out.is_empty() { None } else { Some(out) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::VecSource;
    use crate::types::FieldType;

    fn ty(name: &str) -> Arc<ExtentType> {
        ExtentType::new(
            "t",
            name,
            (1, 0),
            vec![Field {
                name: "k".into(),
                field_type: FieldType::Int32,
                nullable: false,
                pack: crate::types::PackHints::default(),
                offset: 0,
                null_bit: None,
            }],
        )
        .unwrap()
    }

    fn extent_of(t: &Arc<ExtentType>, values: &[i32]) -> Extent {
        let k = t.field("k").unwrap().clone();
        let mut e = Extent::new_empty(Arc::clone(t));
        for &v in values {
            let r = e.append_record();
            e.set_i32(r, &k, v).unwrap();
        }
        e
    }

    #[test]
    fn merges_two_sources_by_key_with_tie_break() {
        let a_ty = ty("A");
        let b_ty = ty("B");
        let a_src = VecSource::new(Arc::clone(&a_ty), vec![extent_of(&a_ty, &[1, 3, 5])]);
        let b_src = VecSource::new(Arc::clone(&b_ty), vec![extent_of(&b_ty, &[1, 2, 4])]);

        let sources = vec![
            UnionSource { input: Box::new(a_src), columns: vec![("k".to_string(), "k".to_string())] },
            UnionSource { input: Box::new(b_src), columns: vec![("k".to_string(), "k".to_string())] },
        ];
        let mut union = UnionOperator::new(sources, &[SortColumn::asc("k")]).unwrap();
        let out_k = union.output_type().field("k").unwrap().clone();

        let mut values = Vec::new();
        while let Some(e) = union.get_extent().unwrap() {
            for r in 0..e.n_records() {
                values.push(e.get_i32(r, &out_k).unwrap());
            }
        }
        assert_eq!(values, vec![1, 1, 2, 3, 4, 5]);
    }
}
