//! Server handler: maps named tables to files under a working directory and
//! orchestrates operator trees over them (spec §4 "Server handler", §6
//! "Server surface").
//!
//! Grounded on `examples/original_source/src/server/data-series-server.cpp`
//! (`DataSeriesServerHandler`): a table name is verified (no `/`, `<=200`
//! bytes), mapped to `ds.<name>` under the working directory, and every verb
//! below builds a short-lived operator tree rooted at [`ExtentSource`]s over
//! those files and drains it into a fresh [`Sink`] at the destination table's
//! path. The RPC transport that dispatches these verbs over the wire (the
//! original's Thrift service) is out of scope (spec §1) — this module is the
//! handler a transport would call into, not the transport itself.
//!
//! `table_info` in the original is an in-process `HashMap<table, ExtentType>`
//! populated as tables are created; this crate's [`Server`] keeps the same
//! shape (`tables: HashMap<String, Arc<ExtentType>>`) rather than re-deriving
//! it by scanning the working directory, since a file's own library already
//! reopens cleanly through [`crate::file::reader::FileReader`] if a caller
//! needs to recover it after a restart (see [`Server::reopen_table`]).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::extent::value::{GeneralField, GeneralValue};
use crate::extent::Extent;
use crate::file::reader::FileReader;
use crate::file::sink::{Sink, SinkConfig};
use crate::operator::expr;
use crate::operator::hash_join::{EqColumn, HashJoinOperator, KeepColumn};
use crate::operator::select::SelectOperator;
use crate::operator::sort::{SortColumn, SortOperator};
use crate::operator::sorted_update::SortedUpdateOperator;
use crate::operator::star_join::{Dimension, FactJoin, MissPolicy, StarJoinOperator};
use crate::operator::union::{UnionOperator, UnionSource};
use crate::operator::{ExtentSource, Operator};
use crate::types::library::parse_descriptors;
use crate::types::{ExtentType, FieldType};

const TABLE_NAME_MAX_LEN: usize = 200;
const TABLE_FILE_PREFIX: &str = "ds.";

/// A destination table for [`Server::union_tables`]: which source table to
/// read and how to rename its columns into the union's output schema.
pub struct UnionTableSpec {
    pub table: String,
    /// `(output_name, source_name)` pairs, same convention as [`UnionSource`].
    pub columns: Vec<(String, String)>,
}

/// One returned row of [`Server::get_table_data`], already stringified —
/// matches the original's `GeneralField::valString()` wire representation,
/// since the RPC layer this hands off to is out of scope here.
#[derive(Debug, Clone, PartialEq)]
pub struct TableColumn {
    pub name: String,
    pub field_type: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableData {
    pub columns: Vec<TableColumn>,
    pub rows: Vec<Vec<String>>,
    pub more_rows: bool,
}

/// Maps table names to files under a working directory and runs operator
/// trees over them (spec §4.9 "Server handler").
pub struct Server {
    working_dir: PathBuf,
    tables: HashMap<String, Arc<ExtentType>>,
}

impl Server {
    /// Open (creating if absent) `working_dir` as the server's table store.
    pub fn new(working_dir: impl Into<PathBuf>) -> Result<Server> {
        let working_dir = working_dir.into();
        fs::create_dir_all(&working_dir)?;
        Ok(Server { working_dir, tables: HashMap::new() })
    }

    /// `/tmp/<prefix>.<username>`, the original's default when no
    /// `--working-directory` program option is given (spec §6).
    pub fn default_working_directory(prefix: &str) -> PathBuf {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        PathBuf::from(format!("/tmp/{prefix}.{user}"))
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    // ---- table name / path plumbing --------------------------------------

    fn verify_table_name(name: &str) -> Result<()> {
        if name.len() >= TABLE_NAME_MAX_LEN {
            return Err(Error::InvalidTableName { name: name.to_string(), reason: "name too long" });
        }
        if name.contains('/') {
            return Err(Error::InvalidTableName { name: name.to_string(), reason: "contains /" });
        }
        Ok(())
    }

    fn table_path(&self, name: &str) -> Result<PathBuf> {
        Self::verify_table_name(name)?;
        Ok(self.working_dir.join(format!("{TABLE_FILE_PREFIX}{name}")))
    }

    fn table_type(&self, name: &str) -> Result<Arc<ExtentType>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidTableName { name: name.to_string(), reason: "table missing" })
    }

    fn record_table(&mut self, name: &str, ty: Arc<ExtentType>) {
        self.tables.insert(name.to_string(), ty);
    }

    /// Recover a table's type by reading its file's own library, for a table
    /// this `Server` did not itself create (spec §6: "a reader needs only
    /// the path").
    pub fn reopen_table(&mut self, name: &str) -> Result<()> {
        let path = self.table_path(name)?;
        let reader = FileReader::open(&path)?;
        let ty = reader
            .library()
            .types()
            .next()
            .ok_or_else(|| Error::InvalidTableName { name: name.to_string(), reason: "empty type library" })?;
        self.record_table(name, Arc::clone(ty));
        Ok(())
    }

    /// Open an existing table as an [`Operator`] source.
    fn open_table(&self, name: &str) -> Result<Box<dyn Operator>> {
        let ty = self.table_type(name)?;
        let path = self.table_path(name)?;
        let reader = FileReader::open(&path)?;
        Ok(Box::new(ExtentSource::new(reader, ty)))
    }

    /// Drain `op` into a freshly-created file at `dest_table`'s path,
    /// registering the output type under that name.
    fn drain_into_table(&mut self, mut op: Box<dyn Operator>, dest_table: &str) -> Result<()> {
        let ty = op.output_type();
        let path = self.table_path(dest_table)?;
        let sink = Sink::create(&path, &ty.to_xml(), SinkConfig::default())?;
        while let Some(extent) = op.get_extent()? {
            sink.write_extent(extent)?;
        }
        sink.close()?;
        self.record_table(dest_table, ty);
        Ok(())
    }

    // ---- verbs -------------------------------------------------------------

    pub fn ping(&self) {
        log::info!("ping()");
    }

    /// No process-level shutdown here (spec §1: the RPC transport that would
    /// receive this request is out of scope) — a caller owning the `Server`
    /// simply drops it.
    pub fn shutdown(&self) {
        log::info!("shutdown()");
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Concatenate extents of type `extent_type_name` from `source_paths`
    /// (already-written extent files, outside the working directory) into
    /// `dest_table`, preserving each source's own extent order.
    pub fn import_data_series_files(
        &mut self,
        source_paths: &[PathBuf],
        extent_type_name: &str,
        dest_table: &str,
    ) -> Result<()> {
        if extent_type_name.is_empty() {
            return Err(Error::RequestError("extent type empty".into()));
        }
        Self::verify_table_name(dest_table)?;

        let mut ty: Option<Arc<ExtentType>> = None;
        let mut readers = Vec::with_capacity(source_paths.len());
        for path in source_paths {
            let reader = FileReader::open(path)?;
            if ty.is_none() {
                ty = reader.library().by_name(extent_type_name);
            }
            readers.push(reader);
        }
        let ty = ty.ok_or_else(|| Error::TypeNotInLibrary(extent_type_name.to_string()))?;

        let dest_path = self.table_path(dest_table)?;
        let sink = Sink::create(&dest_path, &ty.to_xml(), SinkConfig::default())?;
        for mut reader in readers {
            while let Some(extent) = reader.next_extent()? {
                if extent.ty.name == extent_type_name {
                    sink.write_extent(extent)?;
                }
            }
        }
        sink.close()?;
        self.record_table(dest_table, ty);
        Ok(())
    }

    /// CSV ingestion shells out to an external `csv2ds`-style conversion
    /// utility in the original; that conversion binary is explicitly out of
    /// scope here (spec §1: "command-line entry points for format-conversion
    /// utilities ... are out of scope"), so this verb is a typed stub rather
    /// than a silent no-op.
    pub fn import_csv_files(
        &mut self,
        _source_paths: &[PathBuf],
        _xml_desc: &str,
        _dest_table: &str,
        _field_separator: &str,
        _comment_prefix: &str,
    ) -> Result<()> {
        Err(Error::RequestError(
            "importCSVFiles requires an external csv-to-extent conversion utility, which is out of scope for this crate".into(),
        ))
    }

    /// Same contract as [`Server::import_csv_files`]: the original shells out
    /// to a `sql2ds`-style utility, out of scope here (spec §1).
    pub fn import_sql_table(&mut self, _dsn: &str, _src_table: &str, _dest_table: &str) -> Result<()> {
        Err(Error::RequestError(
            "importSQLTable requires an external SQL-to-extent conversion utility, which is out of scope for this crate".into(),
        ))
    }

    /// Build `dest_table` from an inline schema plus rows of already-typed
    /// values (spec §6 `importData (inline rows)`). Unlike the original's
    /// wire format (one row of strings per field, reparsed per type), this
    /// signature takes [`GeneralValue`]s directly; a caller that only has
    /// strings should parse them against `type.fields()` before calling.
    pub fn import_data(&mut self, dest_table: &str, xml_desc: &str, rows: &[Vec<GeneralValue>]) -> Result<()> {
        Self::verify_table_name(dest_table)?;
        let types = parse_descriptors(xml_desc)?;
        let ty = types
            .into_iter()
            .next()
            .ok_or_else(|| Error::RequestError("importData: xml_desc declares no ExtentType".into()))?;

        let fields: Vec<GeneralField> =
            ty.fields().iter().map(|f| GeneralField::new(&ty, &f.name)).collect::<Result<_>>()?;

        let path = self.table_path(dest_table)?;
        let sink = Sink::create(&path, &ty.to_xml(), SinkConfig::default())?;
        let mut extent = Extent::new_empty(Arc::clone(&ty));
        for row in rows {
            if row.len() != fields.len() {
                return Err(Error::RequestError("incorrect number of fields".into()));
            }
            let r = extent.append_record();
            for (field, value) in fields.iter().zip(row.iter()) {
                field.set(&mut extent, r, value)?;
            }
        }
        sink.write_extent(extent)?;
        sink.close()?;
        self.record_table(dest_table, ty);
        Ok(())
    }

    /// Concatenate several existing tables of the same extent type into one
    /// (spec §6 `mergeTables`).
    pub fn merge_tables(&mut self, source_tables: &[String], dest_table: &str) -> Result<()> {
        if source_tables.is_empty() {
            return Err(Error::RequestError("missing source tables".into()));
        }
        Self::verify_table_name(dest_table)?;

        let mut extent_type_name = String::new();
        let mut paths = Vec::with_capacity(source_tables.len());
        for table in source_tables {
            if table == dest_table {
                return Err(Error::InvalidTableName {
                    name: table.clone(),
                    reason: "duplicated with destination table",
                });
            }
            let ty = self.table_type(table)?;
            if extent_type_name.is_empty() {
                extent_type_name = ty.name.clone();
            } else if extent_type_name != ty.name {
                return Err(Error::InvalidTableName {
                    name: table.clone(),
                    reason: "extent type does not match earlier table types",
                });
            }
            paths.push(self.table_path(table)?);
        }
        self.import_data_series_files(&paths, &extent_type_name, dest_table)
    }

    /// Read up to `max_rows` rows from `source_table` (optionally filtered
    /// by `where_expr`), stringified for wire transport (spec §6
    /// `getTableData`). Matches the original's behavior exactly: this is a
    /// one-shot truncation, not a resumable cursor — `more_rows` only
    /// signals that rows were left unread, a second call with a narrower
    /// predicate is how a caller would fetch the rest.
    pub fn get_table_data(&self, source_table: &str, max_rows: usize, where_expr: &str) -> Result<TableData> {
        if max_rows == 0 {
            return Err(Error::RequestError("max_rows must be > 0".into()));
        }
        let ty = self.table_type(source_table)?;
        let mut input = self.open_table(source_table)?;
        if !where_expr.is_empty() {
            let predicate = expr::parse(where_expr)?.compile(&ty)?;
            input = Box::new(SelectOperator::new(input, predicate));
        }

        let columns: Vec<TableColumn> = ty
            .fields()
            .iter()
            .map(|f| TableColumn { name: f.name.clone(), field_type: f.field_type.name().to_string() })
            .collect();
        let fields: Vec<GeneralField> =
            ty.fields().iter().map(|f| GeneralField::new(&ty, &f.name)).collect::<Result<_>>()?;

        let mut rows = Vec::new();
        let mut more_rows = false;
        'outer: while let Some(extent) = input.get_extent()? {
            for r in 0..extent.n_records() {
                if rows.len() == max_rows {
                    more_rows = true;
                    break 'outer;
                }
                let mut row = Vec::with_capacity(fields.len());
                for field in &fields {
                    row.push(general_value_to_string(&field.get(&extent, r)?));
                }
                rows.push(row);
            }
        }
        Ok(TableData { columns, rows, more_rows })
    }

    /// spec §6 `hashJoin`; see [`HashJoinOperator`] for the join semantics.
    pub fn hash_join(
        &mut self,
        a_table: &str,
        b_table: &str,
        out_table: &str,
        eq_columns: &[EqColumn],
        keep_columns: &[KeepColumn],
        max_a_rows: usize,
    ) -> Result<()> {
        Self::verify_table_name(out_table)?;
        let a_input = self.open_table(a_table)?;
        let b_input = self.open_table(b_table)?;
        let join = HashJoinOperator::new(a_input, b_input, eq_columns, keep_columns, max_a_rows)?;
        self.drain_into_table(Box::new(join), out_table)
    }

    /// spec §6 `starJoin`; see [`StarJoinOperator`] for the join semantics.
    /// `dimension_tables` names, for each [`Dimension`] already built by the
    /// caller, which table it reads from.
    pub fn star_join(
        &mut self,
        fact_table: &str,
        dimensions: Vec<(String, Vec<String>, Vec<String>)>,
        joins: &[FactJoin],
        miss_policy: MissPolicy,
        out_table: &str,
    ) -> Result<()> {
        Self::verify_table_name(out_table)?;
        let fact = self.open_table(fact_table)?;
        let mut resolved = Vec::with_capacity(dimensions.len());
        for (source_table, key_columns, value_columns) in dimensions {
            let input = self.open_table(&source_table)?;
            resolved.push(Dimension { name: source_table, input, key_columns, value_columns });
        }
        let join = StarJoinOperator::new(fact, resolved, joins, miss_policy)?;
        self.drain_into_table(Box::new(join), out_table)
    }

    /// spec §6 `selectRows`.
    pub fn select_rows(&mut self, in_table: &str, out_table: &str, where_expr: &str) -> Result<()> {
        Self::verify_table_name(out_table)?;
        let ty = self.table_type(in_table)?;
        let input = self.open_table(in_table)?;
        let predicate = expr::parse(where_expr)?.compile(&ty)?;
        let select = SelectOperator::new(input, predicate);
        self.drain_into_table(Box::new(select), out_table)
    }

    /// spec §6 `projectTable`.
    pub fn project_table(&mut self, in_table: &str, out_table: &str, keep_columns: &[String]) -> Result<()> {
        Self::verify_table_name(out_table)?;
        let input = self.open_table(in_table)?;
        let project = crate::operator::project::ProjectOperator::new(input, keep_columns)?;
        self.drain_into_table(Box::new(project), out_table)
    }

    /// spec §6 `sortedUpdateTable`. Unlike the original (which merges into a
    /// `tmp.` file and renames over the base), this writes the merged result
    /// to a caller-named `out_table`, leaving `base_table` untouched — a
    /// caller wanting in-place semantics can pass the same name and accept
    /// the file being fully rewritten, but an explicit rename-over-base
    /// commit outside a running write pipeline is exactly the kind of
    /// in-place mutation spec §1's Non-goals exclude ("random-access
    /// mutation of stored extents").
    pub fn sorted_update_table(
        &mut self,
        base_table: &str,
        update_table: &str,
        primary_key: &str,
        update_column: &str,
        out_table: &str,
    ) -> Result<()> {
        Self::verify_table_name(out_table)?;
        let base = self.open_table(base_table)?;
        let update = self.open_table(update_table)?;
        let merged = SortedUpdateOperator::new(base, update, primary_key, update_column)?;
        self.drain_into_table(Box::new(merged), out_table)
    }

    /// spec §6 `unionTables`.
    pub fn union_tables(&mut self, in_tables: Vec<UnionTableSpec>, order_columns: &[SortColumn], out_table: &str) -> Result<()> {
        Self::verify_table_name(out_table)?;
        let mut sources = Vec::with_capacity(in_tables.len());
        for spec in in_tables {
            let input = self.open_table(&spec.table)?;
            sources.push(UnionSource { input, columns: spec.columns });
        }
        let union = UnionOperator::new(sources, order_columns)?;
        self.drain_into_table(Box::new(union), out_table)
    }

    /// spec §6 `sortTable`.
    pub fn sort_table(&mut self, in_table: &str, out_table: &str, by: &[SortColumn]) -> Result<()> {
        Self::verify_table_name(out_table)?;
        let input = self.open_table(in_table)?;
        let sorted = SortOperator::new(input, by)?;
        self.drain_into_table(Box::new(sorted), out_table)
    }
}

/// Stringify a cell for wire transport the way `GeneralField::valString()`
/// does in the original: `Null` becomes an empty string rather than an
/// error, since a caller printing a table must handle it somehow.
fn general_value_to_string(v: &GeneralValue) -> String {
    match v {
        GeneralValue::Null => String::new(),
        GeneralValue::Bool(b) => b.to_string(),
        GeneralValue::Byte(b) => b.to_string(),
        GeneralValue::Int32(i) => i.to_string(),
        GeneralValue::Int64(i) => i.to_string(),
        GeneralValue::Variable32(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[allow(dead_code)]
fn field_type_name(t: FieldType) -> &'static str {
    t.name()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExtentType, Field, FieldType as FT, PackHints};

    fn row_type(name: &str) -> Arc<ExtentType> {
        ExtentType::new(
            "test",
            name,
            (1, 0),
            vec![
                Field {
                    name: "k".into(),
                    field_type: FT::Int32,
                    nullable: false,
                    pack: PackHints::default(),
                    offset: 0,
                    null_bit: None,
                },
                Field {
                    name: "label".into(),
                    field_type: FT::Variable32,
                    nullable: false,
                    pack: PackHints::default(),
                    offset: 0,
                    null_bit: None,
                },
            ],
        )
        .unwrap()
    }

    fn write_table(server: &mut Server, name: &str, rows: &[(i32, &str)]) {
        let ty = row_type(name);
        let path = server.table_path(name).unwrap();
        let sink = Sink::create(&path, &ty.to_xml(), SinkConfig::default()).unwrap();
        let k = ty.field("k").unwrap().clone();
        let label = ty.field("label").unwrap().clone();
        let mut e = Extent::new_empty(Arc::clone(&ty));
        for (kv, lv) in rows {
            let r = e.append_record();
            e.set_i32(r, &k, *kv).unwrap();
            e.set_variable32(r, &label, lv.as_bytes()).unwrap();
        }
        sink.write_extent(e).unwrap();
        sink.close().unwrap();
        server.record_table(name, ty);
    }

    #[test]
    fn table_name_rejects_slash_and_long_names() {
        assert!(Server::verify_table_name("ok_name").is_ok());
        assert!(Server::verify_table_name("has/slash").is_err());
        assert!(Server::verify_table_name(&"x".repeat(200)).is_err());
    }

    #[test]
    fn has_table_reflects_registration() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(dir.path()).unwrap();
        assert!(!server.has_table("t"));
        write_table(&mut server, "t", &[(1, "a")]);
        assert!(server.has_table("t"));
    }

    #[test]
    fn select_rows_writes_filtered_output_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(dir.path()).unwrap();
        write_table(&mut server, "in", &[(1, "a"), (2, "b"), (3, "c")]);

        server.select_rows("in", "out", "k > 1").unwrap();
        assert!(server.has_table("out"));

        let data = server.get_table_data("out", 100, "").unwrap();
        assert_eq!(data.rows.len(), 2);
        assert!(!data.more_rows);
        assert_eq!(data.rows[0][0], "2");
        assert_eq!(data.rows[1][0], "3");
    }

    #[test]
    fn get_table_data_truncates_and_reports_more_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(dir.path()).unwrap();
        write_table(&mut server, "in", &[(1, "a"), (2, "b"), (3, "c")]);

        let data = server.get_table_data("in", 2, "").unwrap();
        assert_eq!(data.rows.len(), 2);
        assert!(data.more_rows);
    }

    #[test]
    fn unknown_table_is_invalid_table_name() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(dir.path()).unwrap();
        let err = server.get_table_data("missing", 10, "").unwrap_err();
        assert!(matches!(err, Error::InvalidTableName { .. }));
    }

    #[test]
    fn merge_tables_requires_matching_extent_types() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(dir.path()).unwrap();
        write_table(&mut server, "a", &[(1, "a")]);
        write_table(&mut server, "b", &[(2, "b")]);
        // row_type() assigns each table a distinct ExtentType name, so even
        // same-shaped tables count as mismatched types here.
        let err = server.merge_tables(&["a".to_string(), "b".to_string()], "out").unwrap_err();
        assert!(matches!(err, Error::InvalidTableName { .. }));
    }

    #[test]
    fn import_data_builds_a_table_from_inline_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(dir.path()).unwrap();
        let xml = r#"<ExtentType name="Inline" namespace="test" version="1.0">
            <field type="int32" name="k" />
            <field type="variable32" name="label" />
        </ExtentType>"#;
        let rows = vec![
            vec![GeneralValue::Int32(1), GeneralValue::Variable32(b"x".to_vec())],
            vec![GeneralValue::Int32(2), GeneralValue::Variable32(b"y".to_vec())],
        ];
        server.import_data("inline", xml, &rows).unwrap();
        let data = server.get_table_data("inline", 10, "").unwrap();
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[0], vec!["1".to_string(), "x".to_string()]);
    }

    #[test]
    fn import_csv_and_sql_are_explicit_stubs() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(dir.path()).unwrap();
        assert!(server.import_csv_files(&[], "", "out", ",", "#").is_err());
        assert!(server.import_sql_table("", "src", "out").is_err());
    }
}
