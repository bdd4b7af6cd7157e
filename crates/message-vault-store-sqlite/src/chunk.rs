//! Parameter-bounded batching for bulk statements.
//!
//! SQLite caps bound parameters per statement (999 by default). Every bulk
//! operation routes through these helpers, which split N keys into
//! ceil(N / floor(ceiling / P)) statements whose combined effect is
//! identical to one unbounded statement.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ToSql};

use crate::error::{SqlContext, StoreResult};

/// Hard per-statement parameter ceiling, with margin under SQLite's 999.
pub(crate) const MAX_BOUND_PARAMS: usize = 900;

/// Rows per chunk for a statement binding `params_per_row` values each.
pub(crate) fn chunk_rows(params_per_row: usize) -> usize {
    (MAX_BOUND_PARAMS / params_per_row).max(1)
}

/// A `?,?,...,?` list with `count` placeholders.
pub(crate) fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count.saturating_mul(2));
    for i in 0..count {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

/// Run a parameterized IN-list query over `keys` in chunks. `template` must
/// contain a single `{ids}` marker for the placeholder list; `prefix`
/// parameters are bound before each chunk's keys (e.g. a source filter).
pub(crate) fn query_in_chunks<K, F>(
    conn: &Connection,
    op: &'static str,
    keys: &[K],
    prefix: &[&dyn ToSql],
    template: &str,
    mut on_row: F,
) -> StoreResult<()>
where
    K: ToSql,
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<()>,
{
    let chunk_size = chunk_rows(1).saturating_sub(prefix.len()).max(1);

    for chunk in keys.chunks(chunk_size) {
        let sql = template.replace("{ids}", &placeholders(chunk.len()));
        let mut stmt = conn.prepare(&sql).op(op)?;

        let mut args: Vec<&dyn ToSql> = Vec::with_capacity(prefix.len() + chunk.len());
        args.extend_from_slice(prefix);
        for key in chunk {
            args.push(key);
        }

        let mut rows = stmt.query(args.as_slice()).op(op)?;
        while let Some(row) = rows.next().op(op)? {
            on_row(row).op(op)?;
        }
    }

    Ok(())
}

/// Execute a chunked statement (UPDATE/DELETE with an IN-list) over `keys`,
/// returning the total number of affected rows.
pub(crate) fn exec_in_chunks<K: ToSql>(
    conn: &Connection,
    op: &'static str,
    keys: &[K],
    prefix: &[&dyn ToSql],
    template: &str,
) -> StoreResult<u64> {
    let chunk_size = chunk_rows(1).saturating_sub(prefix.len()).max(1);
    let mut affected = 0_u64;

    for chunk in keys.chunks(chunk_size) {
        let sql = template.replace("{ids}", &placeholders(chunk.len()));

        let mut args: Vec<&dyn ToSql> = Vec::with_capacity(prefix.len() + chunk.len());
        args.extend_from_slice(prefix);
        for key in chunk {
            args.push(key);
        }

        affected += conn.execute(&sql, args.as_slice()).op(op)? as u64;
    }

    Ok(affected)
}

/// Execute a multi-row `INSERT ... VALUES` in chunks. `build_row` returns the
/// bound values for one logical row; each chunk becomes one statement of the
/// form `{query_prefix} (?,..),(?,..),...`.
pub(crate) fn insert_in_chunks<F>(
    conn: &Connection,
    op: &'static str,
    total_rows: usize,
    params_per_row: usize,
    query_prefix: &str,
    mut build_row: F,
) -> StoreResult<u64>
where
    F: FnMut(usize) -> Vec<Value>,
{
    let chunk_size = chunk_rows(params_per_row);
    let row_tuple = format!("({})", placeholders(params_per_row));
    let mut inserted = 0_u64;

    let mut start = 0;
    while start < total_rows {
        let end = (start + chunk_size).min(total_rows);

        let mut sql = String::from(query_prefix);
        let mut args: Vec<Value> = Vec::with_capacity((end - start) * params_per_row);
        for index in start..end {
            if index > start {
                sql.push(',');
            }
            sql.push_str(&row_tuple);
            args.extend(build_row(index));
        }

        inserted += conn.execute(&sql, params_from_iter(args)).op(op)? as u64;
        start = end;
    }

    Ok(inserted)
}
