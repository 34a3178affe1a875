//! Schema introspection and statistics queries.
//!
//! All SQL against information_schema and the pg_catalog/pg_stat views lives
//! here; execution rides the guarded executor like any other call, so
//! introspection inherits the same deadlines and breaker protection.

use serde_json::{json, Value};

use crate::db::executor::{Executor, QueryOptions};
use crate::error::GatewayError;

const LIST_SCHEMAS_SQL: &str = "\
SELECT schema_name
FROM information_schema.schemata
WHERE schema_name NOT IN ('pg_catalog', 'information_schema')
  AND schema_name NOT LIKE 'pg_toast%'
ORDER BY schema_name";

const LIST_TABLES_SQL: &str = "\
SELECT
    n.nspname AS schema,
    c.relname AS table,
    c.reltuples::bigint AS estimated_rows,
    pg_total_relation_size(c.oid) AS total_bytes,
    pg_size_pretty(pg_total_relation_size(c.oid)) AS total_size
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE c.relkind IN ('r', 'p', 'm', 'v')
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
ORDER BY pg_total_relation_size(c.oid) DESC";

const DESCRIBE_COLUMNS_SQL: &str = "\
SELECT
    column_name,
    data_type,
    is_nullable = 'YES' AS nullable,
    column_default,
    character_maximum_length
FROM information_schema.columns
WHERE table_schema = $1 AND table_name = $2
ORDER BY ordinal_position";

const DESCRIBE_INDEXES_SQL: &str = "\
SELECT indexname AS name, indexdef AS definition
FROM pg_indexes
WHERE schemaname = $1 AND tablename = $2
ORDER BY indexname";

const DATABASE_STATS_SQL: &str = "\
SELECT
    d.datname AS database,
    pg_size_pretty(pg_database_size(d.datname)) AS size,
    s.numbackends AS connections,
    s.xact_commit AS commits,
    s.xact_rollback AS rollbacks,
    s.blks_hit,
    s.blks_read,
    CASE WHEN s.blks_hit + s.blks_read = 0 THEN 1.0
         ELSE s.blks_hit::float8 / (s.blks_hit + s.blks_read)
    END AS cache_hit_ratio,
    s.deadlocks
FROM pg_stat_database s
JOIN pg_database d ON d.datname = s.datname
WHERE d.datname = current_database()";

const TABLE_STATS_SQL: &str = "\
SELECT
    schemaname AS schema,
    relname AS table,
    seq_scan,
    idx_scan,
    n_live_tup AS live_rows,
    n_dead_tup AS dead_rows,
    last_vacuum,
    last_autovacuum,
    last_analyze
FROM pg_stat_user_tables
ORDER BY n_live_tup DESC
LIMIT 50";

const ACTIVITY_SQL: &str = "\
SELECT state, count(*) AS connections
FROM pg_stat_activity
WHERE datname = current_database()
GROUP BY state
ORDER BY connections DESC";

/// Split `schema.table` into its parts; the schema defaults to `public`.
fn split_table_name(name: &str) -> (String, String) {
    match name.split_once('.') {
        Some((schema, table)) => (schema.to_string(), table.to_string()),
        None => ("public".to_string(), name.to_string()),
    }
}

/// Non-system schemas in the current database.
pub async fn list_schemas(executor: &Executor) -> Result<Value, GatewayError> {
    let outcome = executor
        .safe_query(LIST_SCHEMAS_SQL, &[], &QueryOptions::default())
        .await?;
    Ok(json!({ "schemas": outcome.rows, "duration_ms": outcome.duration_ms }))
}

/// User tables with row estimates and on-disk sizes.
pub async fn list_tables(executor: &Executor) -> Result<Value, GatewayError> {
    let outcome = executor
        .safe_query(LIST_TABLES_SQL, &[], &QueryOptions::default())
        .await?;
    Ok(json!({ "tables": outcome.rows, "duration_ms": outcome.duration_ms }))
}

/// Columns and indexes of one table.
pub async fn describe_table(executor: &Executor, name: &str) -> Result<Value, GatewayError> {
    let (schema, table) = split_table_name(name);
    let params = [json!(schema), json!(table)];

    let columns = executor
        .safe_query(DESCRIBE_COLUMNS_SQL, &params, &QueryOptions::default())
        .await?;
    let indexes = executor
        .safe_query(DESCRIBE_INDEXES_SQL, &params, &QueryOptions::default())
        .await?;

    Ok(json!({
        "schema": schema,
        "table": table,
        "columns": columns.rows,
        "indexes": indexes.rows,
        "duration_ms": columns.duration_ms + indexes.duration_ms,
    }))
}

/// Database-level statistics plus a per-state connection breakdown.
pub async fn database_stats(executor: &Executor) -> Result<Value, GatewayError> {
    let stats = executor
        .safe_query(DATABASE_STATS_SQL, &[], &QueryOptions::default())
        .await?;
    let activity = executor
        .safe_query(ACTIVITY_SQL, &[], &QueryOptions::default())
        .await?;
    let tables = executor
        .safe_query(TABLE_STATS_SQL, &[], &QueryOptions::default())
        .await?;

    Ok(json!({
        "database": stats.rows.first().cloned().unwrap_or(Value::Null),
        "activity": activity.rows,
        "tables": tables.rows,
        "duration_ms": stats.duration_ms + activity.duration_ms + tables.duration_ms,
    }))
}
