//! `Sort`: per-extent stable sort of row offsets, then a k-way merge of the
//! resulting sorted runs via a [`loser_tree`](crate::operator::loser_tree)
//! (spec §4.5).
//!
//! Phase one happens lazily, the first time [`SortOperator::get_extent`] is
//! called: every input extent is pulled and sorted in place (a stable sort
//! over a vector of row offsets, so ties keep their original relative
//! order — spec: "stable-sort preserves input order within equal keys").
//! Phase two merges those runs in sorted-key order; a stream with only one
//! run skips the loser tree entirely and is a straight pass-through (spec:
//! "the single-run case bypasses the loser tree").

use std::sync::Arc;

use crate::error::Result;
use crate::extent::value::{GeneralField, GeneralValue};
use crate::extent::Extent;
use crate::operator::loser_tree::LoserTree;
use crate::operator::{extent_byte_size, Operator, TARGET_EXTENT_BYTES};
use crate::types::ExtentType;

/// One column of a sort key, with its direction.
#[derive(Debug, Clone)]
pub struct SortColumn {
    pub field: String,
    pub descending: bool,
}

impl SortColumn {
    pub fn asc(field: impl Into<String>) -> SortColumn {
        SortColumn { field: field.into(), descending: false }
    }

    pub fn desc(field: impl Into<String>) -> SortColumn {
        SortColumn { field: field.into(), descending: true }
    }
}

/// A composite sort key: one [`GeneralValue`] per [`SortColumn`], compared
/// lexicographically with each column's direction applied independently.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SortKey {
    values: Vec<GeneralValue>,
    descending: Arc<Vec<bool>>,
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for i in 0..self.values.len() {
            let ord = self.values[i].cmp(&other.values[i]);
            if ord != std::cmp::Ordering::Equal {
                return if self.descending[i] { ord.reverse() } else { ord };
            }
        }
        std::cmp::Ordering::Equal
    }
}

struct Run {
    extent: Extent,
    /// Row indices into `extent`, in sorted order.
    order: Vec<usize>,
    /// Position into `order` of the next row to emit.
    cursor: usize,
}

impl Run {
    fn current_key(&self, columns: &[GeneralField], descending: &Arc<Vec<bool>>) -> Result<Option<SortKey>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let row = self.order[self.cursor];
        let values = columns
            .iter()
            .map(|c| c.get(&self.extent, row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(SortKey { values, descending: Arc::clone(descending) }))
    }
}

pub struct SortOperator {
    input: Option<Box<dyn Operator>>,
    ty: Arc<ExtentType>,
    columns: Vec<GeneralField>,
    descending: Arc<Vec<bool>>,
    runs: Vec<Run>,
    tree: Option<LoserTree<SortKey>>,
    materialized: bool,
}

impl SortOperator {
    pub fn new(input: Box<dyn Operator>, columns: &[SortColumn]) -> Result<SortOperator> {
        let ty = input.output_type();
        let fields = columns
            .iter()
            .map(|c| GeneralField::new(&ty, &c.field))
            .collect::<Result<Vec<_>>>()?;
        let descending = Arc::new(columns.iter().map(|c| c.descending).collect());
        Ok(SortOperator {
            input: Some(input),
            ty,
            columns: fields,
            descending,
            runs: Vec::new(),
            tree: None,
            materialized: false,
        })
    }

    fn materialize(&mut self) -> Result<()> {
        if self.materialized {
            return Ok(());
        }
        self.materialized = true;
        let mut input = self.input.take().expect("materialize called once");
        while let Some(extent) = input.get_extent()? {
            let n = extent.n_records();
            let mut keyed: Vec<(Vec<GeneralValue>, usize)> = Vec::with_capacity(n);
            for row in 0..n {
                let values = self
                    .columns
                    .iter()
                    .map(|c| c.get(&extent, row))
                    .collect::<Result<Vec<_>>>()?;
                keyed.push((values, row));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for i in 0..a.len() {
                    let ord = a[i].cmp(&b[i]);
                    if ord != std::cmp::Ordering::Equal {
                        return if self.descending[i] { ord.reverse() } else { ord };
                    }
                }
                std::cmp::Ordering::Equal
            });
            let order = keyed.into_iter().map(|(_, row)| row).collect();
            self.runs.push(Run { extent, order, cursor: 0 });
        }

        if self.runs.len() > 1 {
            let keys = self
                .runs
                .iter()
                .map(|r| r.current_key(&self.columns, &self.descending))
                .collect::<Result<Vec<_>>>()?;
            self.tree = Some(LoserTree::new(keys));
        }
        Ok(())
    }
}

impl Operator for SortOperator {
    fn output_type(&self) -> Arc<ExtentType> {
        Arc::clone(&self.ty)
    }

    fn get_extent(&mut self) -> Result<Option<Extent>> {
        self.materialize()?;

        if self.runs.is_empty() {
            return Ok(None);
        }

        let mut out = Extent::new_empty(Arc::clone(&self.ty));
        let copier = crate::extent::value::RecordCopier::identity(&self.ty);

        if self.runs.len() == 1 {
            let run = &mut self.runs[0];
            while run.cursor < run.order.len() {
                let row = run.order[run.cursor];
                copier.copy_row(&run.extent, row, &mut out)?;
                run.cursor += 1;
                if extent_byte_size(&out) >= TARGET_EXTENT_BYTES {
                    break;
                }
            }
            return Ok(if out.is_empty() { None } else { Some(out) });
        }

        let tree = self.tree.as_mut().expect("multi-run sort has a tree");
        while let Some(run_idx) = tree.winner() {
            let row = {
                let run = &self.runs[run_idx];
                run.order[run.cursor]
            };
            {
                let run = &self.runs[run_idx];
                copier.copy_row(&run.extent, row, &mut out)?;
            }
            self.runs[run_idx].cursor += 1;
            let next_key = self.runs[run_idx].current_key(&self.columns, &self.descending)?;
            tree.replace_winner(next_key);
            if extent_byte_size(&out) >= TARGET_EXTENT_BYTES {
                break;
            }
        }
        Ok(if out.is_empty() { None } else { Some(out) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::VecSource;
    use crate::types::{ExtentType, Field, FieldType, PackHints};

    fn ty() -> Arc<ExtentType> {
        ExtentType::new(
            "t",
            "T",
            (1, 0),
            vec![Field {
                name: "k".into(),
                field_type: FieldType::Int32,
                nullable: false,
                pack: PackHints::default(),
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

    fn collect(op: &mut SortOperator, t: &Arc<ExtentType>) -> Vec<i32> {
        let k = t.field("k").unwrap().clone();
        let mut out = Vec::new();
        while let Some(e) = op.get_extent().unwrap() {
            for r in 0..e.n_records() {
                out.push(e.get_i32(r, &k).unwrap());
            }
        }
        out
    }

    #[test]
    fn single_extent_descending_is_stable() {
        let t = ty();
        let src = VecSource::new(Arc::clone(&t), vec![extent_of(&t, &[3, 1, 2])]);
        let mut sort = SortOperator::new(Box::new(src), &[SortColumn::desc("k")]).unwrap();
        assert_eq!(collect(&mut sort, &t), vec![3, 2, 1]);
    }

    #[test]
    fn merges_multiple_runs_ascending() {
        let t = ty();
        let src = VecSource::new(
            Arc::clone(&t),
            vec![extent_of(&t, &[5, 1, 9]), extent_of(&t, &[4, 2]), extent_of(&t, &[8, 0])],
        );
        let mut sort = SortOperator::new(Box::new(src), &[SortColumn::asc("k")]).unwrap();
        assert_eq!(collect(&mut sort, &t), vec![0, 1, 2, 4, 5, 8, 9]);
    }

    #[test]
    fn ties_across_extents_preserve_input_order() {
        // Two extents each carry one record with the same sort key; the
        // earlier extent's record must come out first (spec §8: the merge
        // is a stable permutation of the input, not just stable within one
        // extent's own `sort_by`).
        let t = ExtentType::new(
            "t",
            "Tagged",
            (1, 0),
            vec![
                Field { name: "k".into(), field_type: FieldType::Int32, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
                Field { name: "tag".into(), field_type: FieldType::Variable32, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
            ],
        )
        .unwrap();
        let k = t.field("k").unwrap().clone();
        let tag = t.field("tag").unwrap().clone();

        let mut e1 = Extent::new_empty(Arc::clone(&t));
        let r = e1.append_record();
        e1.set_i32(r, &k, 1).unwrap();
        e1.set_variable32(r, &tag, b"A").unwrap();

        let mut e2 = Extent::new_empty(Arc::clone(&t));
        let r = e2.append_record();
        e2.set_i32(r, &k, 1).unwrap();
        e2.set_variable32(r, &tag, b"B").unwrap();

        let src = VecSource::new(Arc::clone(&t), vec![e1, e2]);
        let mut sort = SortOperator::new(Box::new(src), &[SortColumn::asc("k")]).unwrap();

        let mut tags = Vec::new();
        while let Some(e) = sort.get_extent().unwrap() {
            for r in 0..e.n_records() {
                tags.push(String::from_utf8(e.get_variable32(r, &tag).unwrap().to_vec()).unwrap());
            }
        }
        assert_eq!(tags, vec!["A", "B"]);
    }

    #[test]
    fn empty_input_yields_no_extents() {
        let t = ty();
        let src = VecSource::new(Arc::clone(&t), vec![]);
        let mut sort = SortOperator::new(Box::new(src), &[SortColumn::asc("k")]).unwrap();
        assert!(sort.get_extent().unwrap().is_none());
    }
}
