// ABOUTME: Statement builders and savepoint-isolated execution for the merge engine
// ABOUTME: Every value is bound as text and cast to the destination column type in SQL

use tokio_postgres::types::ToSql;
use tokio_postgres::{Error as PgError, Transaction};

use super::sanitize::{to_sql_text, Column, TableSchema};
use crate::error::{Result, SyncError};
use crate::remote::Record;
use crate::utils::quote_ident;

const SAVEPOINT: &str = "merge_record";

/// A statement plus its text parameters, `None` meaning NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Option<String>>,
}

impl Statement {
    pub fn param_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect()
    }
}

fn cast_param(index: usize, column: &Column) -> String {
    format!("CAST(${}::text AS {})", index, column.base_type)
}

/// `INSERT` of the record's columns, in table attribute order.
pub fn insert_statement(table: &TableSchema, record: &Record) -> Statement {
    let columns: Vec<&Column> = table
        .columns
        .iter()
        .filter(|c| record.contains_key(&c.name))
        .collect();

    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    let values: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| cast_param(i + 1, c))
        .collect();
    let params = columns
        .iter()
        .map(|c| record.get(&c.name).and_then(to_sql_text))
        .collect();

    Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.qualified_name(),
            names.join(", "),
            values.join(", ")
        ),
        params,
    }
}

/// `UPDATE` of every non-key column present in the record, matched on the key.
///
/// Returns `Ok(None)` when the record carries no non-key columns and
/// `Err(column)` naming the first key column the record lacks.
pub fn update_statement(
    table: &TableSchema,
    key_columns: &[&Column],
    record: &Record,
) -> std::result::Result<Option<Statement>, String> {
    for key in key_columns {
        if record.get(&key.name).map_or(true, |v| v.is_null()) {
            return Err(key.name.clone());
        }
    }

    let set_columns: Vec<&Column> = table
        .columns
        .iter()
        .filter(|c| record.contains_key(&c.name))
        .filter(|c| !key_columns.iter().any(|k| k.name == c.name))
        .collect();

    if set_columns.is_empty() {
        return Ok(None);
    }

    let mut params = Vec::with_capacity(set_columns.len() + key_columns.len());
    let mut assignments = Vec::with_capacity(set_columns.len());
    for column in &set_columns {
        params.push(record.get(&column.name).and_then(to_sql_text));
        assignments.push(format!(
            "{} = {}",
            quote_ident(&column.name),
            cast_param(params.len(), column)
        ));
    }

    let mut predicates = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        params.push(record.get(&column.name).and_then(to_sql_text));
        predicates.push(format!(
            "{} = {}",
            quote_ident(&column.name),
            cast_param(params.len(), column)
        ));
    }

    Ok(Some(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            table.qualified_name(),
            assignments.join(", "),
            predicates.join(" AND ")
        ),
        params,
    }))
}

/// Query returning the positions (`idx`) of the given keys that already exist.
pub fn existing_keys_statement(
    table: &TableSchema,
    key_columns: &[&Column],
    keys: &[(usize, Vec<String>)],
) -> Statement {
    let width = key_columns.len();
    let mut params = Vec::with_capacity(keys.len() * width);
    let mut rows = Vec::with_capacity(keys.len());

    for (idx, key) in keys {
        let mut cells = vec![idx.to_string()];
        for (column, value) in key_columns.iter().zip(key) {
            params.push(Some(value.clone()));
            cells.push(cast_param(params.len(), column));
        }
        rows.push(format!("({})", cells.join(", ")));
    }

    let aliases: Vec<String> = (0..width).map(|i| format!("k{}", i)).collect();
    let join: Vec<String> = key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("t.{} = v.k{}", quote_ident(&c.name), i))
        .collect();

    Statement {
        sql: format!(
            "SELECT v.idx FROM (VALUES {}) AS v(idx, {}) JOIN {} t ON {}",
            rows.join(", "),
            aliases.join(", "),
            table.qualified_name(),
            join.join(" AND ")
        ),
        params,
    }
}

/// Existence check for a single key.
pub fn key_exists_statement(
    table: &TableSchema,
    key_columns: &[&Column],
    key: &[String],
) -> Statement {
    let mut params = Vec::with_capacity(key.len());
    let mut predicates = Vec::with_capacity(key.len());
    for (column, value) in key_columns.iter().zip(key) {
        params.push(Some(value.clone()));
        predicates.push(format!(
            "{} = {}",
            quote_ident(&column.name),
            cast_param(params.len(), column)
        ));
    }

    Statement {
        sql: format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 1",
            table.qualified_name(),
            predicates.join(" AND ")
        ),
        params,
    }
}

/// Execute inside a savepoint.
///
/// The outer error means the transaction itself is unusable; the inner error
/// is the statement's own failure, already rolled back to the savepoint.
pub async fn isolated_execute(
    tx: &mut Transaction<'_>,
    statement: &Statement,
) -> Result<std::result::Result<u64, PgError>> {
    let savepoint = tx
        .savepoint(SAVEPOINT)
        .await
        .map_err(|e| SyncError::storage("create savepoint", e))?;

    let params = statement.param_refs();
    let result = savepoint.execute(&statement.sql, &params).await;
    match result {
        Ok(affected) => {
            savepoint
                .commit()
                .await
                .map_err(|e| SyncError::storage("release savepoint", e))?;
            Ok(Ok(affected))
        }
        Err(e) => {
            savepoint
                .rollback()
                .await
                .map_err(|e| SyncError::storage("rollback to savepoint", e))?;
            Ok(Err(e))
        }
    }
}

/// Run a query inside a savepoint and return the first column of each row as `i32`.
pub async fn isolated_query_ints(
    tx: &mut Transaction<'_>,
    statement: &Statement,
) -> Result<std::result::Result<Vec<i32>, PgError>> {
    let savepoint = tx
        .savepoint(SAVEPOINT)
        .await
        .map_err(|e| SyncError::storage("create savepoint", e))?;

    let params = statement.param_refs();
    let result = savepoint.query(&statement.sql, &params).await;
    match result {
        Ok(rows) => {
            savepoint
                .commit()
                .await
                .map_err(|e| SyncError::storage("release savepoint", e))?;
            Ok(Ok(rows.iter().map(|row| row.get::<_, i32>(0)).collect()))
        }
        Err(e) => {
            savepoint
                .rollback()
                .await
                .map_err(|e| SyncError::storage("rollback to savepoint", e))?;
            Ok(Err(e))
        }
    }
}

/// Database message without the driver's prefix where available.
pub fn pg_message(e: &PgError) -> String {
    match e.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{} ({})", db.message(), detail),
            None => db.message().to_string(),
        },
        None => e.to_string(),
    }
}
