use std::collections::HashMap;
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::sync::{Arc, Mutex};

use roaring::RoaringTreemap;
use rusqlite::ffi;
use rusqlite::types::{Null, ValueRef};
use rusqlite::vtab::{
    read_only_module, Context, CreateVTab, Filters, IndexConstraintOp, IndexInfo, VTab,
    VTabConnection, VTabCursor, VTabKind,
};
use rusqlite::Connection;

use crate::collection::DocumentCollection;
use crate::database::CollectionSet;
use crate::error::UserError;
use crate::index::{Constraint, ConstraintOp, Operand};
use crate::schema::{split_column_path, FieldKind, Schema};

pub(crate) fn register(conn: &Connection, collections: CollectionSet) -> rusqlite::Result<()> {
    conn.create_module("carnet", read_only_module::<CollectionTab>(), Some(collections))
}

fn module_error(message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::ModuleError(message.into())
}

/// One SQL column of a virtual table: a flattened scalar leaf of the
/// collection schema, named by its dotted path.
#[derive(Debug, Clone)]
struct SqlColumn {
    name: String,
    tokens: Vec<String>,
    kind: FieldKind,
}

fn flatten_into(schema: &Schema, prefix: &str, out: &mut Vec<SqlColumn>) {
    for field in schema.fields() {
        let name = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{prefix}.{}", field.name)
        };
        match &field.fields {
            Some(sub_schema) => flatten_into(sub_schema, &name, out),
            None => {
                out.push(SqlColumn { tokens: split_column_path(&name), name, kind: field.kind })
            }
        }
    }
}

fn sql_type(kind: FieldKind) -> &'static str {
    match kind {
        k if k.is_integer() => "INTEGER",
        k if k.is_float() => "REAL",
        FieldKind::String => "TEXT",
        _ => "BLOB",
    }
}

fn declaration(columns: &[SqlColumn]) -> String {
    let columns: Vec<String> = columns
        .iter()
        .map(|column| format!("\"{}\" {}", column.name, sql_type(column.kind)))
        .collect();
    format!("CREATE TABLE x({})", columns.join(", "))
}

/// One plan chosen by `best_index`: which constraints become `filter`
/// arguments, in argv order.
#[derive(Debug, Clone)]
struct PlanEntry {
    column: usize,
    op: ConstraintOp,
}

#[derive(Debug, Default)]
struct PlanTable {
    next_id: c_int,
    plans: HashMap<c_int, Vec<PlanEntry>>,
}

#[repr(C)]
pub(crate) struct CollectionTab {
    /// Base class. Must be first.
    base: ffi::sqlite3_vtab,
    collection: Arc<DocumentCollection>,
    columns: Arc<Vec<SqlColumn>>,
    plans: Arc<Mutex<PlanTable>>,
}

unsafe impl<'vtab> VTab<'vtab> for CollectionTab {
    type Aux = CollectionSet;
    type Cursor = CollectionCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, CollectionTab)> {
        let collections = aux.ok_or_else(|| module_error("no collection registry"))?;
        let raw = args
            .get(3)
            .or_else(|| args.get(2))
            .ok_or_else(|| module_error("missing collection name"))?;
        let name = String::from_utf8_lossy(raw);
        let name = name.trim().trim_matches('"').trim_matches('\'');

        let collection = collections
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| module_error(format!("unknown collection `{name}`")))?;

        let mut columns = Vec::new();
        flatten_into(collection.schema(), "", &mut columns);
        let sql = declaration(&columns);

        let vtab = CollectionTab {
            base: ffi::sqlite3_vtab::default(),
            collection,
            columns: Arc::new(columns),
            plans: Arc::new(Mutex::new(PlanTable::default())),
        };
        Ok((sql, vtab))
    }

    /// Offers SQLite a plan: every usable constraint that one of the
    /// collection's indexers supports becomes a `filter` argument and is
    /// omitted from SQLite's own post-filtering.
    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let mut entries: Vec<(usize, PlanEntry)> = Vec::new();
        for (i, constraint) in info.constraints().enumerate() {
            if !constraint.is_usable() {
                continue;
            }
            let Some(op) = translate_op(constraint.operator()) else { continue };
            let column = constraint.column();
            if column < 0 {
                // rowid constraints are left to SQLite.
                continue;
            }
            let Some(sql_column) = self.columns.get(column as usize) else { continue };
            if self.collection.try_get_best_index(&sql_column.name, op).is_none() {
                continue;
            }
            entries.push((i, PlanEntry { column: column as usize, op }));
        }

        for (argv, (i, _)) in entries.iter().enumerate() {
            let mut usage = info.constraint_usage(*i);
            usage.set_argv_index(argv as c_int + 1);
            usage.set_omit(true);
        }
        info.set_estimated_cost(if entries.is_empty() {
            1_000_000.0
        } else {
            1_000.0 / entries.len() as f64
        });

        let plan: Vec<PlanEntry> = entries.into_iter().map(|(_, entry)| entry).collect();
        let mut plans = self.plans.lock().unwrap();
        plans.next_id = plans.next_id.wrapping_add(1);
        let plan_id = plans.next_id;
        plans.plans.insert(plan_id, plan);
        // Plans from finished statements pile up over time; keep a window
        // large enough for any statement still being planned.
        if plans.plans.len() > 1024 {
            plans.plans.retain(|id, _| plan_id - *id < 1024);
        }
        info.set_idx_num(plan_id);
        Ok(())
    }

    fn open(&mut self) -> rusqlite::Result<CollectionCursor<'_>> {
        Ok(CollectionCursor {
            base: ffi::sqlite3_vtab_cursor::default(),
            collection: self.collection.clone(),
            columns: self.columns.clone(),
            plans: self.plans.clone(),
            ids: RoaringTreemap::new().into_iter(),
            current: None,
            phantom: PhantomData,
        })
    }
}

impl CreateVTab<'_> for CollectionTab {
    const KIND: VTabKind = VTabKind::Default;
}

fn translate_op(op: IndexConstraintOp) -> Option<ConstraintOp> {
    match op {
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ => Some(ConstraintOp::Equal),
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GT => Some(ConstraintOp::GreaterThan),
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GE => Some(ConstraintOp::GreaterThanOrEqual),
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LT => Some(ConstraintOp::LessThan),
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LE => Some(ConstraintOp::LessThanOrEqual),
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_MATCH => Some(ConstraintOp::Match),
        _ => None,
    }
}

#[repr(C)]
pub(crate) struct CollectionCursor<'vtab> {
    /// Base class. Must be first.
    base: ffi::sqlite3_vtab_cursor,
    collection: Arc<DocumentCollection>,
    columns: Arc<Vec<SqlColumn>>,
    plans: Arc<Mutex<PlanTable>>,
    ids: roaring::treemap::IntoIter,
    current: Option<u64>,
    phantom: PhantomData<&'vtab CollectionTab>,
}

impl CollectionCursor<'_> {
    fn set_field_result(
        &self,
        ctx: &mut Context,
        id: u64,
        column: &SqlColumn,
    ) -> rusqlite::Result<()> {
        // An absent optional field projects as NULL; everything else is a
        // real error.
        macro_rules! set {
            ($read:expr) => {
                match $read {
                    Ok(value) => ctx.set_result(&value),
                    Err(crate::Error::UserError(UserError::FieldMissing(_))) => {
                        ctx.set_result(&Null)
                    }
                    Err(error) => Err(module_error(error.to_string())),
                }
            };
        }
        match column.kind {
            kind if kind.is_integer() => {
                set!(self.collection.get_field_as_int(id, &column.name, &column.tokens))
            }
            kind if kind.is_float() => {
                set!(self.collection.get_field_as_double(id, &column.name, &column.tokens))
            }
            FieldKind::String => {
                set!(self.collection.get_field_as_string(id, &column.name, &column.tokens))
            }
            _ => set!(self.collection.get_field_as_blob(id, &column.name, &column.tokens)),
        }
    }
}

unsafe impl VTabCursor for CollectionCursor<'_> {
    fn filter(
        &mut self,
        idx_num: c_int,
        _idx_str: Option<&str>,
        args: &Filters<'_>,
    ) -> rusqlite::Result<()> {
        let entries =
            self.plans.lock().unwrap().plans.get(&idx_num).cloned().unwrap_or_default();
        if entries.len() != args.len() {
            return Err(module_error("plan arguments do not match the chosen plan"));
        }

        let mut constraints = Vec::with_capacity(entries.len());
        for (entry, value) in entries.iter().zip(args.iter()) {
            let operand = match value {
                ValueRef::Integer(value) => Operand::Integer(value),
                ValueRef::Real(value) => Operand::Double(value),
                ValueRef::Text(text) => {
                    Operand::String(String::from_utf8_lossy(text).into_owned())
                }
                ValueRef::Blob(bytes) => Operand::Blob(bytes.to_vec()),
                // Comparisons with NULL match nothing.
                ValueRef::Null => {
                    self.ids = RoaringTreemap::new().into_iter();
                    self.current = None;
                    return Ok(());
                }
            };
            let column = &self.columns[entry.column];
            constraints.push(Constraint::new(column.name.clone(), entry.op, operand));
        }

        let bitmap = self
            .collection
            .filter(&constraints)
            .map_err(|error| module_error(error.to_string()))?;
        self.ids = bitmap.into_iter();
        self.current = self.ids.next();
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.current = self.ids.next();
        Ok(())
    }

    fn eof(&self) -> bool {
        self.current.is_none()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        let id = self.current.ok_or_else(|| module_error("cursor is past the end"))?;
        let column = self
            .columns
            .get(i as usize)
            .ok_or_else(|| module_error(format!("column index {i} is out of range")))?;
        self.set_field_result(ctx, id, column)
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.current.unwrap_or(0) as i64)
    }
}
