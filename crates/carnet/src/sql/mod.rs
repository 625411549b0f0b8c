mod vtab;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::Connection;

use crate::database::CollectionSet;
use crate::error::UserError;
use crate::{Options, Result};

/// The SQL boundary: one SQLite connection with every collection registered
/// as a read-only virtual table.
pub(crate) struct QueryProcessor {
    conn: Mutex<Connection>,
}

impl QueryProcessor {
    pub(crate) fn new(options: &Options, collections: CollectionSet) -> Result<QueryProcessor> {
        let conn = Connection::open_in_memory()?;
        let busy = Duration::from_millis(
            options.sqlite_busy_retries as u64 * options.sqlite_busy_backoff_ms,
        );
        conn.busy_timeout(busy)?;
        vtab::register(&conn, collections)?;
        Ok(QueryProcessor { conn: Mutex::new(conn) })
    }

    pub(crate) fn add_collection(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!("CREATE VIRTUAL TABLE \"{name}\" USING carnet({name})"))?;
        Ok(())
    }

    /// Prepares and drains a SELECT. SQLite drives the virtual-table scan
    /// row by row; the rows are collected here so the result set carries no
    /// borrow of the connection.
    pub(crate) fn execute_select(&self, sql: &str) -> Result<ResultSet> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut collected = VecDeque::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(row.get::<_, Value>(i)?);
            }
            collected.push_back(values);
        }

        Ok(ResultSet::new(columns, collected))
    }
}

/// Rows of one executed SELECT. `next` advances to the following row;
/// getters read from the current one with SQLite's usual loose coercions.
#[derive(Debug)]
pub struct ResultSet {
    columns: Vec<String>,
    column_map: HashMap<String, i32>,
    rows: VecDeque<Vec<Value>>,
    current: Option<Vec<Value>>,
}

impl ResultSet {
    fn new(columns: Vec<String>, rows: VecDeque<Vec<Value>>) -> ResultSet {
        let column_map = columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as i32))
            .collect();
        ResultSet { columns, column_map, rows, current: None }
    }

    /// Advances to the next row; `false` once the rows are exhausted.
    pub fn next(&mut self) -> bool {
        self.current = self.rows.pop_front();
        self.current.is_some()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Result<i32> {
        self.column_map.get(name).copied().ok_or_else(|| {
            UserError::InvalidArgument(format!(
                "no column labelled `{name}` in the result set"
            ))
            .into()
        })
    }

    fn value(&self, column: i32) -> Result<&Value> {
        let row = self.current.as_ref().ok_or_else(|| {
            UserError::InvalidArgument("the result set has no current row".into())
        })?;
        row.get(column as usize).ok_or_else(|| {
            UserError::InvalidArgument(format!("column index {column} is out of range")).into()
        })
    }

    pub fn get_int64(&self, column: i32) -> Result<i64> {
        Ok(match self.value(column)? {
            Value::Integer(value) => *value,
            Value::Real(value) => *value as i64,
            Value::Text(value) => value.parse().unwrap_or(0),
            Value::Null | Value::Blob(_) => 0,
        })
    }

    pub fn get_double(&self, column: i32) -> Result<f64> {
        Ok(match self.value(column)? {
            Value::Integer(value) => *value as f64,
            Value::Real(value) => *value,
            Value::Text(value) => value.parse().unwrap_or(0.0),
            Value::Null | Value::Blob(_) => 0.0,
        })
    }

    pub fn get_string(&self, column: i32) -> Result<String> {
        Ok(match self.value(column)? {
            Value::Integer(value) => value.to_string(),
            Value::Real(value) => value.to_string(),
            Value::Text(value) => value.clone(),
            Value::Null => String::new(),
            Value::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        })
    }
}
