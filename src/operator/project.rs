//! `Project`: build a derived type containing only the named columns,
//! preserving their original declarations verbatim (spec §4.5). The copier
//! maps name-to-name, so a projected field's pack hints, nullability and
//! type all come straight from the source field.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::extent::value::RecordCopier;
use crate::extent::Extent;
use crate::operator::{extent_byte_size, Operator, TARGET_EXTENT_BYTES};
use crate::types::{ExtentType, PackHints};

pub struct ProjectOperator {
    input: Box<dyn Operator>,
    copier: RecordCopier,
    ty: Arc<ExtentType>,
}

impl ProjectOperator {
    /// `columns` names the fields of `input.output_type()` to keep, in
    /// output order. The derived type's `(namespace, name, version)` is
    /// `(input.namespace, format!("{input.name}::Project"), input.version)`,
    /// distinguishing it from its source without the caller naming it.
    pub fn new(input: Box<dyn Operator>, columns: &[String]) -> Result<ProjectOperator> {
        let src_ty = input.output_type();
        let mut fields = Vec::with_capacity(columns.len());
        for name in columns {
            let field = src_ty
                .field(name)
                .ok_or_else(|| Error::FieldNotFound { type_name: src_ty.name.clone(), field: name.clone() })?;
            fields.push(crate::types::Field {
                name: field.name.clone(),
                field_type: field.field_type,
                nullable: field.nullable,
                pack: field.pack.clone(),
                offset: 0,
                null_bit: None,
            });
        }
        let ty = ExtentType::new(
            src_ty.namespace.clone(),
            format!("{}::Project", src_ty.name),
            (src_ty.major_version, src_ty.minor_version),
            fields,
        )?;
        let rename: Vec<(String, String)> =
            columns.iter().map(|c| (c.clone(), c.clone())).collect();
        let copier = RecordCopier::new(&src_ty, &ty, &rename)?;
        Ok(ProjectOperator { input, copier, ty })
    }
}

impl Operator for ProjectOperator {
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
                self.copier.copy_row(&input_extent, r, &mut out)?;
            }
            if extent_byte_size(&out) >= TARGET_EXTENT_BYTES {
                return Ok(Some(out));
            }
        }
    }
}
