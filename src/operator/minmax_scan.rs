//! Min/max index scan (spec §4.5 final bullet, §6 index-extent schema):
//! loads a separate index file/stream describing, per data extent, the
//! `[min, max]` range of one or more columns, keeps the extents whose
//! ranges intersect a caller-supplied predicate, sorts the kept list by a
//! chosen sort column, then issues [`FileReader::read_extent_at`] for each
//! in that order.
//!
//! Grounded on `examples/original_source/src/module/MinMaxIndexModule.cpp`:
//! the reserved index-extent type carries `filename`, `extent_offset`, and
//! `min:<field>`/`max:<field>` pairs per indexed column (spec §6), and the
//! original's `intervalOverlap` is the same four-way `inrange` check
//! collapsed here to the standard two-comparison form it's equivalent to.
//! Unlike the original (one `IndexSourceModule` bound to a single
//! `DataSeriesSource`), this scan can span several underlying files — the
//! index's `filename` column names which one each kept extent lives in —
//! so readers are opened lazily and cached by path as they're first needed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::extent::value::GeneralField;
use crate::extent::value::GeneralValue;
use crate::extent::Extent;
use crate::file::reader::FileReader;
use crate::operator::Operator;
use crate::types::ExtentType;

/// One `(column, min, max)` predicate to intersect against an indexed
/// column's stored `[min:<column>, max:<column>]` range.
#[derive(Debug, Clone)]
pub struct Selector {
    pub column: String,
    pub min: GeneralValue,
    pub max: GeneralValue,
}

/// Whether a kept extent must overlap every selector or just one (spec
/// §4.5: "`{all-overlap | any-overlap}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapMode {
    AllOverlap,
    AnyOverlap,
}

/// `[a_min, a_max] ∩ [b_min, b_max] ≠ ∅` (spec §4.5). Values must share a
/// variant, as with every other comparison in this crate.
fn interval_overlap(a_min: &GeneralValue, a_max: &GeneralValue, b_min: &GeneralValue, b_max: &GeneralValue) -> bool {
    a_min <= b_max && b_min <= a_max
}

struct KeptExtent {
    filename: String,
    extent_offset: u64,
    sort_key: GeneralValue,
}

/// Resolved field handles for one selector, bound to the index extent's
/// type once at construction.
struct ResolvedSelector {
    min_field: GeneralField,
    max_field: GeneralField,
    min_v: GeneralValue,
    max_v: GeneralValue,
}

/// Pull source over a min/max index: consumes an entire index stream up
/// front (it's small relative to the data it indexes), keeps and sorts the
/// matching entries, then streams the underlying data extents lazily as
/// [`Operator::get_extent`] is called.
pub struct MinMaxIndexScan {
    ty: Arc<ExtentType>,
    extent_type_name: String,
    kept: std::vec::IntoIter<KeptExtent>,
    readers: HashMap<String, FileReader>,
}

impl MinMaxIndexScan {
    /// `index_input` yields extents of the reserved index schema (spec §6:
    /// `filename: variable32`, `extent_offset: int64`, plus `min:<field>` /
    /// `max:<field>` per indexed column). `data_type` is the schema of the
    /// data extents this scan will read back via `read_extent_at`.
    /// `sort_column` must also be a column of the index schema.
    pub fn new(
        mut index_input: Box<dyn Operator>,
        data_type: Arc<ExtentType>,
        selectors: &[Selector],
        mode: OverlapMode,
        sort_column: &str,
    ) -> Result<MinMaxIndexScan> {
        let idx_ty = index_input.output_type();
        let filename_field = GeneralField::new(&idx_ty, "filename")?;
        let offset_field = GeneralField::new(&idx_ty, "extent_offset")?;
        let sort_field = GeneralField::new(&idx_ty, sort_column)?;

        let mut resolved = Vec::with_capacity(selectors.len());
        for sel in selectors {
            resolved.push(ResolvedSelector {
                min_field: GeneralField::new(&idx_ty, &format!("min:{}", sel.column))?,
                max_field: GeneralField::new(&idx_ty, &format!("max:{}", sel.column))?,
                min_v: sel.min.clone(),
                max_v: sel.max.clone(),
            });
        }

        let mut kept = Vec::new();
        while let Some(extent) = index_input.get_extent()? {
            for row in 0..extent.n_records() {
                let mut all_overlap = true;
                let mut any_overlap = false;
                for sel in &resolved {
                    let extent_min = sel.min_field.get(&extent, row)?;
                    let extent_max = sel.max_field.get(&extent, row)?;
                    let overlaps = interval_overlap(&extent_min, &extent_max, &sel.min_v, &sel.max_v);
                    all_overlap &= overlaps;
                    any_overlap |= overlaps;
                }
                let keep = match mode {
                    OverlapMode::AllOverlap => all_overlap,
                    OverlapMode::AnyOverlap => any_overlap,
                };
                if !keep {
                    continue;
                }

                let filename = match filename_field.get(&extent, row)? {
                    GeneralValue::Variable32(bytes) => String::from_utf8(bytes).map_err(|_| {
                        Error::RequestError("index 'filename' column is not valid utf-8".into())
                    })?,
                    other => {
                        return Err(Error::TypeMismatch {
                            expected: "variable32".into(),
                            found: other.field_type().map(|t| t.name()).unwrap_or("null").into(),
                        })
                    }
                };
                let extent_offset = match offset_field.get(&extent, row)? {
                    GeneralValue::Int64(v) => v as u64,
                    other => {
                        return Err(Error::TypeMismatch {
                            expected: "int64".into(),
                            found: other.field_type().map(|t| t.name()).unwrap_or("null").into(),
                        })
                    }
                };
                let sort_key = sort_field.get(&extent, row)?;
                kept.push(KeptExtent { filename, extent_offset, sort_key });
            }
        }

        kept.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));

        Ok(MinMaxIndexScan {
            extent_type_name: data_type.name.clone(),
            ty: data_type,
            kept: kept.into_iter(),
            readers: HashMap::new(),
        })
    }
}

impl Operator for MinMaxIndexScan {
    fn output_type(&self) -> Arc<ExtentType> {
        Arc::clone(&self.ty)
    }

    fn get_extent(&mut self) -> Result<Option<Extent>> {
        let Some(entry) = self.kept.next() else {
            return Ok(None);
        };
        if !self.readers.contains_key(&entry.filename) {
            let reader = FileReader::open(&entry.filename)?;
            self.readers.insert(entry.filename.clone(), reader);
        }
        let reader = self.readers.get(&entry.filename).expect("just inserted");
        let extent = reader.read_extent_at(entry.extent_offset as usize, &self.extent_type_name)?;
        Ok(Some(extent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::compress::CompressModeMask;
    use crate::file::sink::{Sink, SinkConfig};
    use crate::operator::VecSource;
    use crate::types::{Field, FieldType, PackHints};

    fn data_type() -> Arc<ExtentType> {
        ExtentType::new(
            "test",
            "Row",
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

    fn index_type() -> Arc<ExtentType> {
        ExtentType::new(
            "dataseries.store",
            "DSIndex::Extent::MinMax::Row",
            (1, 0),
            vec![
                Field { name: "filename".into(), field_type: FieldType::Variable32, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
                Field { name: "extent_offset".into(), field_type: FieldType::Int64, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
                Field { name: "min:k".into(), field_type: FieldType::Int32, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
                Field { name: "max:k".into(), field_type: FieldType::Int32, nullable: false, pack: PackHints::default(), offset: 0, null_bit: None },
            ],
        )
        .unwrap()
    }

    /// Writes one file with three extents (`k` ranges `[0,1]`, `[5,6]`,
    /// `[10,11]`) and returns its path plus the byte offset of each extent
    /// as recorded by the file's own sequential index.
    fn write_fixture(dir: &std::path::Path) -> (std::path::PathBuf, Vec<u64>) {
        let dt = data_type();
        let k = dt.field("k").unwrap().clone();
        let path = dir.join("data.ds");
        let xml = dt.to_xml();
        let config = SinkConfig { compressor_count: 1, compress_mask: CompressModeMask::NONE_ONLY, ..SinkConfig::default() };
        let sink = Sink::create(&path, &xml, config).unwrap();
        for (lo, hi) in [(0, 1), (5, 6), (10, 11)] {
            let mut e = Extent::new_empty(Arc::clone(&dt));
            for v in [lo, hi] {
                let r = e.append_record();
                e.set_i32(r, &k, v).unwrap();
            }
            sink.write_extent(e).unwrap();
        }
        sink.close().unwrap();

        let reader = FileReader::open(&path).unwrap();
        let offsets = reader.index_entries().unwrap().into_iter().map(|(off, _)| off).collect();
        (path, offsets)
    }

    fn index_row(
        idx_ty: &Arc<ExtentType>,
        idx: &mut Extent,
        filename: &str,
        offset: u64,
        lo: i32,
        hi: i32,
    ) {
        let filename_f = idx_ty.field("filename").unwrap();
        let offset_f = idx_ty.field("extent_offset").unwrap();
        let min_f = idx_ty.field("min:k").unwrap();
        let max_f = idx_ty.field("max:k").unwrap();
        let r = idx.append_record();
        idx.set_variable32(r, filename_f, filename.as_bytes()).unwrap();
        idx.set_i64(r, offset_f, offset as i64).unwrap();
        idx.set_i32(r, min_f, lo).unwrap();
        idx.set_i32(r, max_f, hi).unwrap();
    }

    #[test]
    fn keeps_only_overlapping_extents_in_sort_order() {
        let dir = tempfile::tempdir().unwrap();
        let (path, offsets) = write_fixture(dir.path());
        let idx_ty = index_type();
        let mut idx = Extent::new_empty(Arc::clone(&idx_ty));
        let path_str = path.to_str().unwrap();
        // Deliberately out of sort order, to prove the scan re-sorts.
        index_row(&idx_ty, &mut idx, path_str, offsets[2], 10, 11);
        index_row(&idx_ty, &mut idx, path_str, offsets[0], 0, 1);
        index_row(&idx_ty, &mut idx, path_str, offsets[1], 5, 6);

        let idx_src = VecSource::new(Arc::clone(&idx_ty), vec![idx]);
        let selectors = vec![Selector { column: "k".into(), min: GeneralValue::Int32(4), max: GeneralValue::Int32(9) }];
        let mut scan = MinMaxIndexScan::new(
            Box::new(idx_src),
            data_type(),
            &selectors,
            OverlapMode::AllOverlap,
            "min:k",
        )
        .unwrap();

        let k = scan.output_type().field("k").unwrap().clone();
        let mut kept_ranges = Vec::new();
        while let Some(e) = scan.get_extent().unwrap() {
            kept_ranges.push((e.get_i32(0, &k).unwrap(), e.get_i32(1, &k).unwrap()));
        }
        // Only the [5,6] extent overlaps [4,9]; [0,1] and [10,11] don't.
        assert_eq!(kept_ranges, vec![(5, 6)]);
    }

    #[test]
    fn sorts_kept_extents_by_the_chosen_sort_column() {
        let dir = tempfile::tempdir().unwrap();
        let (path, offsets) = write_fixture(dir.path());
        let idx_ty = index_type();
        let mut idx = Extent::new_empty(Arc::clone(&idx_ty));
        let path_str = path.to_str().unwrap();
        index_row(&idx_ty, &mut idx, path_str, offsets[2], 10, 11);
        index_row(&idx_ty, &mut idx, path_str, offsets[0], 0, 1);
        index_row(&idx_ty, &mut idx, path_str, offsets[1], 5, 6);

        let idx_src = VecSource::new(Arc::clone(&idx_ty), vec![idx]);
        // A selector range wide enough to match every extent.
        let selectors = vec![Selector { column: "k".into(), min: GeneralValue::Int32(-100), max: GeneralValue::Int32(100) }];
        let mut scan = MinMaxIndexScan::new(
            Box::new(idx_src),
            data_type(),
            &selectors,
            OverlapMode::AnyOverlap,
            "min:k",
        )
        .unwrap();

        let k = scan.output_type().field("k").unwrap().clone();
        let mut firsts = Vec::new();
        while let Some(e) = scan.get_extent().unwrap() {
            firsts.push(e.get_i32(0, &k).unwrap());
        }
        assert_eq!(firsts, vec![0, 5, 10]);
    }
}
