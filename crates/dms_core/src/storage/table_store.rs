//! Tabular backend on SQLite.
//!
//! # Responsibility
//! - Store domain ranges and attribute columns in a migrated SQLite file.
//! - Keep one transaction per write session; commit or roll back at close.
//!
//! # Invariants
//! - Read sessions open the database read-only and never migrate it.
//! - Write sessions run bootstrap (pragmas + migrations) before `BEGIN IMMEDIATE`.

use crate::model::item::{DomainRange, ValueType, Values};
use crate::storage::migrations::{apply_migrations, check_supported, current_user_version};
use crate::storage::{
    file_change_time, file_is_writable, OpenMode, StorageError, StorageFactory, StorageKind,
    StorageManager, StorageResult, TileRange,
};
use log::{error, info};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

pub struct TableStorage {
    location: PathBuf,
    conn: Option<Connection>,
    mode: Option<OpenMode>,
    /// False for an unmigrated file opened read-only; every role is missing.
    schema_ready: bool,
}

impl TableStorage {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            conn: None,
            mode: None,
            schema_ready: false,
        }
    }

    fn conn(&self) -> StorageResult<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| StorageError::NotOpen(self.location.clone()))
    }

    fn write_conn(&self) -> StorageResult<&Connection> {
        match self.mode {
            Some(OpenMode::Write) => self.conn(),
            Some(OpenMode::Read) => Err(StorageError::ReadOnly(self.location.clone())),
            None => Err(StorageError::NotOpen(self.location.clone())),
        }
    }

    fn missing(&self, role: &str) -> StorageError {
        StorageError::MissingRole {
            location: self.location.clone(),
            role: role.to_string(),
        }
    }
}

fn bootstrap_connection(conn: &mut Connection) -> StorageResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    apply_migrations(conn)?;
    Ok(())
}

fn to_sql_values(values: &Values) -> Vec<Value> {
    match values {
        Values::Bool(items) => items
            .iter()
            .map(|item| Value::Integer(i64::from(*item)))
            .collect(),
        Values::UInt32(items) => items
            .iter()
            .map(|item| Value::Integer(i64::from(*item)))
            .collect(),
        Values::Int32(items) => items
            .iter()
            .map(|item| Value::Integer(i64::from(*item)))
            .collect(),
        Values::Int64(items) => items.iter().map(|item| Value::Integer(*item)).collect(),
        Values::Float64(items) => items.iter().map(|item| Value::Real(*item)).collect(),
        Values::Text(items) => items.iter().map(|item| Value::Text(item.clone())).collect(),
    }
}

fn from_sql_values(role: &str, value_type: ValueType, raw: Vec<Value>) -> StorageResult<Values> {
    let invalid = |value: &Value| {
        StorageError::InvalidData(format!(
            "role `{role}` holds {value:?}, not a `{value_type}` element"
        ))
    };
    let integer = |value: &Value| match value {
        Value::Integer(number) => Ok(*number),
        other => Err(invalid(other)),
    };

    let mut out = Values::empty(value_type);
    for value in &raw {
        match &mut out {
            Values::Bool(items) => items.push(integer(value)? != 0),
            Values::UInt32(items) => {
                items.push(u32::try_from(integer(value)?).map_err(|_| invalid(value))?)
            }
            Values::Int32(items) => {
                items.push(i32::try_from(integer(value)?).map_err(|_| invalid(value))?)
            }
            Values::Int64(items) => items.push(integer(value)?),
            Values::Float64(items) => match value {
                Value::Real(number) => items.push(*number),
                Value::Integer(number) => items.push(*number as f64),
                other => return Err(invalid(other)),
            },
            Values::Text(items) => match value {
                Value::Text(text) => items.push(text.clone()),
                other => return Err(invalid(other)),
            },
        }
    }
    Ok(out)
}

impl StorageManager for TableStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Tabular
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn open_for_read(&mut self) -> StorageResult<()> {
        if !self.location.is_file() {
            return Err(StorageError::NotFound(self.location.clone()));
        }
        let conn = Connection::open_with_flags(
            &self.location,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let version = current_user_version(&conn)?;
        check_supported(version)?;
        self.schema_ready = version > 0;
        self.conn = Some(conn);
        self.mode = Some(OpenMode::Read);
        Ok(())
    }

    fn open_for_write(&mut self) -> StorageResult<()> {
        let started_at = Instant::now();
        let mut conn = Connection::open(&self.location)?;
        if let Err(err) = bootstrap_connection(&mut conn) {
            error!(
                "event=table_open module=storage status=error mode=write duration_ms={} error_code=bootstrap_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err);
        }
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        info!(
            "event=table_open module=storage status=ok mode=write duration_ms={}",
            started_at.elapsed().as_millis()
        );
        self.schema_ready = true;
        self.conn = Some(conn);
        self.mode = Some(OpenMode::Write);
        Ok(())
    }

    fn close_storage(&mut self, commit: bool) -> StorageResult<()> {
        let mode = self.mode.take();
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if mode == Some(OpenMode::Write) {
            let statement = if commit { "COMMIT;" } else { "ROLLBACK;" };
            conn.execute_batch(statement)?;
        }
        conn.close().map_err(|(_, err)| StorageError::Sqlite(err))?;
        Ok(())
    }

    fn read_attribute(
        &mut self,
        role: &str,
        tile: TileRange,
        value_type: ValueType,
    ) -> StorageResult<Values> {
        let conn = self.conn()?;
        if !self.schema_ready {
            return Err(self.missing(role));
        }
        let stored: Option<String> = conn
            .query_row(
                "SELECT value_type FROM attribute_columns WHERE role = ?1;",
                params![role],
                |row| row.get(0),
            )
            .optional()?;
        let stored = stored.ok_or_else(|| self.missing(role))?;
        if ValueType::parse(&stored) != Some(value_type) {
            return Err(StorageError::TypeMismatch {
                role: role.to_string(),
                expected: value_type,
                actual: stored,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT value FROM attribute_values
             WHERE role = ?1 AND idx >= ?2 AND idx < ?3
             ORDER BY idx ASC;",
        )?;
        let start = i64::from(tile.start);
        let end = start + i64::from(tile.len);
        let raw = stmt
            .query_map(params![role, start, end], |row| row.get::<_, Value>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        from_sql_values(role, value_type, raw)
    }

    fn write_attribute(&mut self, role: &str, values: &Values) -> StorageResult<()> {
        let conn = self.write_conn()?;
        conn.execute(
            "INSERT INTO attribute_columns (role, value_type, element_count)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(role) DO UPDATE SET
                value_type = excluded.value_type,
                element_count = excluded.element_count;",
            params![role, values.value_type().as_str(), values.len() as i64],
        )?;
        conn.execute("DELETE FROM attribute_values WHERE role = ?1;", params![role])?;
        let mut insert = conn.prepare(
            "INSERT INTO attribute_values (role, idx, value) VALUES (?1, ?2, ?3);",
        )?;
        for (idx, value) in to_sql_values(values).into_iter().enumerate() {
            insert.execute(params![role, idx as i64, value])?;
        }
        Ok(())
    }

    fn read_domain_range(&mut self, role: &str) -> StorageResult<DomainRange> {
        let conn = self.conn()?;
        if !self.schema_ready {
            return Err(self.missing(role));
        }
        let count: Option<i64> = conn
            .query_row(
                "SELECT element_count FROM domain_ranges WHERE role = ?1;",
                params![role],
                |row| row.get(0),
            )
            .optional()?;
        let count = count.ok_or_else(|| self.missing(role))?;
        let count = u32::try_from(count).map_err(|_| {
            StorageError::InvalidData(format!("domain `{role}` has invalid count {count}"))
        })?;
        Ok(DomainRange::new(count))
    }

    fn write_domain_range(&mut self, role: &str, range: DomainRange) -> StorageResult<()> {
        let conn = self.write_conn()?;
        conn.execute(
            "INSERT INTO domain_ranges (role, element_count) VALUES (?1, ?2)
             ON CONFLICT(role) DO UPDATE SET element_count = excluded.element_count;",
            params![role, i64::from(range.count)],
        )?;
        Ok(())
    }

    fn external_change_time(&self) -> StorageResult<Option<SystemTime>> {
        file_change_time(&self.location)
    }
}

/// Factory for `StorageKind::Tabular`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableStorageFactory;

impl StorageFactory for TableStorageFactory {
    fn kind(&self) -> StorageKind {
        StorageKind::Tabular
    }

    fn create(&self, location: &Path) -> StorageResult<Box<dyn StorageManager>> {
        Ok(Box::new(TableStorage::new(location)))
    }

    fn does_exist(&self, location: &Path) -> bool {
        location.is_file()
    }

    fn is_writable(&self, location: &Path) -> bool {
        file_is_writable(location)
    }
}
