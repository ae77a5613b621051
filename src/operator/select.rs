//! `Select`: materialize rows for which a boolean expression holds (spec
//! §4.5). Output type equals input type; a [`RecordCopier`] identity copy
//! moves every field of a matching row into the output extent.

use std::sync::Arc;

use crate::error::Result;
use crate::extent::value::RecordCopier;
use crate::extent::Extent;
use crate::operator::expr::CompiledExpr;
use crate::operator::{extent_byte_size, Operator, TARGET_EXTENT_BYTES};
use crate::types::ExtentType;

pub struct SelectOperator {
    input: Box<dyn Operator>,
    predicate: CompiledExpr,
    copier: RecordCopier,
    ty: Arc<ExtentType>,
}

impl SelectOperator {
    /// `predicate` must already be compiled against `input.output_type()` —
    /// schema errors surface at query-build time, not mid-stream (spec §7).
    pub fn new(input: Box<dyn Operator>, predicate: CompiledExpr) -> SelectOperator {
        let ty = input.output_type();
        let copier = RecordCopier::identity(&ty);
        SelectOperator { input, predicate, copier, ty }
    }
}

impl Operator for SelectOperator {
    fn output_type(&self) -> Arc<ExtentType> {
        Arc::clone(&self.ty)
    }

    fn get_extent(&mut self) -> Result<Option<Extent>> {
        let mut out = Extent::new_empty(Arc::clone(&self.ty));
        loop {
            let Some(input_extent) = self.input.get_extent()? else {
                return Ok(if out.is_empty() { None } else { Some(out) });
            };
            for r in 0..input_extent.n_records() {
                if self.predicate.eval_bool(&input_extent, r)? {
                    self.copier.copy_row(&input_extent, r, &mut out)?;
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
    use crate::operator::expr;
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

    #[test]
    fn keeps_only_matching_rows() {
        let t = ty();
        let k = t.field("k").unwrap().clone();
        let mut e = Extent::new_empty(Arc::clone(&t));
        for v in [1, 2, 3, 4, 5] {
            let r = e.append_record();
            e.set_i32(r, &k, v).unwrap();
        }
        let src = VecSource::new(Arc::clone(&t), vec![e]);
        let predicate = expr::parse("k > 2").unwrap().compile(&t).unwrap();
        let mut sel = SelectOperator::new(Box::new(src), predicate);

        let out = sel.get_extent().unwrap().unwrap();
        let mut values = Vec::new();
        for r in 0..out.n_records() {
            values.push(out.get_i32(r, &k).unwrap());
        }
        assert_eq!(values, vec![3, 4, 5]);
        assert!(sel.get_extent().unwrap().is_none());
    }

    #[test]
    fn empty_result_yields_no_extents() {
        let t = ty();
        let k = t.field("k").unwrap().clone();
        let mut e = Extent::new_empty(Arc::clone(&t));
        let r = e.append_record();
        e.set_i32(r, &k, 1).unwrap();
        let src = VecSource::new(Arc::clone(&t), vec![e]);
        let predicate = expr::parse("k > 100").unwrap().compile(&t).unwrap();
        let mut sel = SelectOperator::new(Box::new(src), predicate);
        assert!(sel.get_extent().unwrap().is_none());
    }
}
