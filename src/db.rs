//! Row-level SQL over the descriptor-driven tables.
//!
//! Each table has its index fields as TEXT columns followed by `encrypted`
//! and `body`. Statements are built from [`TableDescriptor`]s; table and
//! column names only ever come from the static descriptor list.

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params_from_iter};
use serde_json::Value;

use crate::envelope::StoredRecord;
use crate::error::{Result, StoreError, is_unique_violation};
use crate::models::Record;
use crate::schema::{Table, TableDescriptor};

fn select_columns(descriptor: &TableDescriptor) -> String {
    let mut columns = descriptor.index_fields();
    columns.push("encrypted");
    columns.push("body");
    columns.join(", ")
}

fn row_to_columns(
    descriptor: &TableDescriptor,
    row: &Row,
) -> rusqlite::Result<(Record, bool, String)> {
    let fields = descriptor.index_fields();
    let mut index = Record::new();
    for (i, field) in fields.iter().enumerate() {
        let value: String = row.get(i)?;
        index.insert(field.to_string(), Value::String(value));
    }
    let encrypted: bool = row.get(fields.len())?;
    let body: String = row.get(fields.len() + 1)?;
    Ok((index, encrypted, body))
}

fn query_stored(
    conn: &Connection,
    table: Table,
    sql: &str,
    params: &[&str],
) -> Result<Vec<StoredRecord>> {
    let descriptor = table.descriptor();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        row_to_columns(descriptor, row)
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (index, encrypted, body) = row?;
        records.push(StoredRecord::from_columns(index, encrypted, &body)?);
    }
    Ok(records)
}

/// Column values in `select_columns` order.
fn column_values(table: Table, stored: &StoredRecord) -> Result<Vec<SqlValue>> {
    let mut values = Vec::new();
    for field in table.descriptor().index_fields() {
        let value = stored
            .index
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StoreError::Validation(format!("{table} record needs a string '{field}'"))
            })?;
        values.push(SqlValue::Text(value.to_string()));
    }
    values.push(SqlValue::Integer(i64::from(stored.is_encrypted())));
    values.push(SqlValue::Text(stored.body_json()?));
    Ok(values)
}

pub fn fetch_by_id(conn: &Connection, table: Table, id: &str) -> Result<Option<StoredRecord>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?1",
        select_columns(table.descriptor()),
        table.name()
    );
    Ok(query_stored(conn, table, &sql, &[id])?.pop())
}

/// Rows whose indexed `field` equals `value`.
pub fn fetch_where(
    conn: &Connection,
    table: Table,
    field: &str,
    value: &str,
) -> Result<Vec<StoredRecord>> {
    debug_assert!(table.descriptor().index_fields().contains(&field));
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        select_columns(table.descriptor()),
        table.name(),
        field
    );
    query_stored(conn, table, &sql, &[value])
}

pub fn fetch_all(conn: &Connection, table: Table) -> Result<Vec<StoredRecord>> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY created_at, id",
        select_columns(table.descriptor()),
        table.name()
    );
    query_stored(conn, table, &sql, &[])
}

pub fn exists(conn: &Connection, table: Table, id: &str) -> rusqlite::Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?1", table.name());
    let found: Option<i64> = conn.query_row(&sql, [id], |row| row.get(0)).optional()?;
    Ok(found.is_some())
}

pub fn ids_where(
    conn: &Connection,
    table: Table,
    field: &str,
    value: &str,
) -> rusqlite::Result<Vec<String>> {
    let sql = format!("SELECT id FROM {} WHERE {} = ?1", table.name(), field);
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt.query_map([value], |row| row.get(0))?;
    ids.collect()
}

pub fn count(conn: &Connection, table: Table) -> rusqlite::Result<usize> {
    let sql = format!("SELECT COUNT(*) FROM {}", table.name());
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Map a failed write to a semantic error. Unique index and primary key
/// violations become `UniqueConstraint`.
fn map_write_error(table: Table, stored: &StoredRecord, err: rusqlite::Error) -> StoreError {
    if is_unique_violation(&err) {
        if let Some(&field) = table.descriptor().unique.first() {
            return StoreError::UniqueConstraint {
                table: table.name(),
                field,
                value: stored
                    .index
                    .get(field)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
        }
    }
    if let rusqlite::Error::SqliteFailure(sqlite_err, _) = &err {
        if sqlite_err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY {
            return StoreError::UniqueConstraint {
                table: table.name(),
                field: "id",
                value: stored.id().to_string(),
            };
        }
    }
    StoreError::from(err)
}

pub fn insert(conn: &Connection, table: Table, stored: &StoredRecord) -> Result<()> {
    let values = column_values(table, stored)?;
    let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name(),
        select_columns(table.descriptor()),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(values))
        .map_err(|e| map_write_error(table, stored, e))?;
    Ok(())
}

/// Insert, or replace the row with the same id. Other unique indices still
/// reject collisions.
pub fn upsert(conn: &Connection, table: Table, stored: &StoredRecord) -> Result<()> {
    let values = column_values(table, stored)?;
    let columns = select_columns(table.descriptor());
    let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
    let assignments: Vec<String> = columns
        .split(", ")
        .skip(1)
        .map(|column| format!("{column} = excluded.{column}"))
        .collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
        table.name(),
        columns,
        placeholders.join(", "),
        assignments.join(", ")
    );
    conn.execute(&sql, params_from_iter(values))
        .map_err(|e| map_write_error(table, stored, e))?;
    Ok(())
}

/// Overwrite every column of an existing row. Returns rows touched.
pub fn update(conn: &Connection, table: Table, stored: &StoredRecord) -> Result<usize> {
    let values = column_values(table, stored)?;
    let columns = select_columns(table.descriptor());
    let assignments: Vec<String> = columns
        .split(", ")
        .enumerate()
        .skip(1)
        .map(|(i, column)| format!("{column} = ?{}", i + 1))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?1",
        table.name(),
        assignments.join(", ")
    );
    conn.execute(&sql, params_from_iter(values))
        .map_err(|e| map_write_error(table, stored, e))
}

pub fn delete_by_id(conn: &Connection, table: Table, id: &str) -> rusqlite::Result<usize> {
    let sql = format!("DELETE FROM {} WHERE id = ?1", table.name());
    conn.execute(&sql, [id])
}

pub fn delete_where(
    conn: &Connection,
    table: Table,
    field: &str,
    value: &str,
) -> rusqlite::Result<usize> {
    let sql = format!("DELETE FROM {} WHERE {} = ?1", table.name(), field);
    conn.execute(&sql, [value])
}

pub fn delete_all(conn: &Connection, table: Table) -> rusqlite::Result<usize> {
    let sql = format!("DELETE FROM {}", table.name());
    conn.execute(&sql, [])
}
