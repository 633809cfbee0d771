//! SQLite-backed tuple storage
//!
//! Same `tuples` layout and batched check selects as the PostgreSQL backend, with `?NNN`
//! placeholders and unbracketed compound selects. Suited to single-node deployments and
//! tests that need a real database without a server.

use crate::{
    compile::InferredRule,
    error::{Result, ZanzibarError},
    storage::{
        sql::{self, Dialect, PreparedQuery},
        Check, Cursor, MarkedTuple, Pagination, Storage,
    },
    tuple::{Tuple, TupleFilter},
};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (and creates if missing) the database at `database_url`,
    /// e.g. `sqlite://zanzibar.db`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| ZanzibarError::StorageError(format!("Failed to open SQLite database: {e}")))?;

        info!(max_connections, "Opened SQLite database {}", database_url);
        Ok(Self::new(pool))
    }

    /// A private in-memory database. The pool holds a single connection that is never
    /// recycled, since the data lives and dies with it.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Applies the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

fn tuple_from_row(row: &SqliteRow) -> Result<Tuple> {
    Ok(Tuple {
        object_type: row.try_get("object_type")?,
        object_id: row.try_get("object_id")?,
        object_relation: row.try_get("object_relation")?,
        subject_type: row.try_get("subject_type")?,
        subject_id: row.try_get("subject_id")?,
        subject_relation: row.try_get("subject_relation")?,
    })
}

fn index_from_row(row: &SqliteRow, column: &str) -> Result<usize> {
    let value: i64 = row.try_get(column)?;
    usize::try_from(value)
        .map_err(|_| ZanzibarError::StorageError(format!("negative {column} {value} in result")))
}

#[async_trait]
impl Storage for SqliteStorage {
    type Plan = PreparedQuery;

    async fn write(&self, tuple: &Tuple) -> Result<()> {
        debug!("Writing tuple to SQLite: {}", tuple);

        sqlx::query(
            r#"
            INSERT INTO tuples (
                uuid,
                object_type, object_id, object_relation,
                subject_type, subject_id, subject_relation
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (
                object_type, object_id, object_relation,
                subject_type, subject_id, subject_relation
            ) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&tuple.object_type)
        .bind(&tuple.object_id)
        .bind(&tuple.object_relation)
        .bind(&tuple.subject_type)
        .bind(&tuple.subject_id)
        .bind(&tuple.subject_relation)
        .execute(&self.pool)
        .await
        .map_err(|e| ZanzibarError::StorageError(format!("Failed to write tuple: {e}")))?;

        Ok(())
    }

    async fn read(&self, tuple: &Tuple) -> Result<Uuid> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT uuid FROM tuples
            WHERE object_type = ?1
              AND object_id = ?2
              AND object_relation = ?3
              AND subject_type = ?4
              AND subject_id = ?5
              AND subject_relation = ?6
            "#,
        )
        .bind(&tuple.object_type)
        .bind(&tuple.object_id)
        .bind(&tuple.object_relation)
        .bind(&tuple.subject_type)
        .bind(&tuple.subject_id)
        .bind(&tuple.subject_relation)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ZanzibarError::StorageError(format!("Failed to read tuple: {e}")))?
        .ok_or(ZanzibarError::NotFound)
    }

    async fn delete(&self, tuple: &Tuple) -> Result<()> {
        debug!("Deleting tuple from SQLite: {}", tuple);

        sqlx::query(
            r#"
            DELETE FROM tuples
            WHERE object_type = ?1
              AND object_id = ?2
              AND object_relation = ?3
              AND subject_type = ?4
              AND subject_id = ?5
              AND subject_relation = ?6
            "#,
        )
        .bind(&tuple.object_type)
        .bind(&tuple.object_id)
        .bind(&tuple.object_relation)
        .bind(&tuple.subject_type)
        .bind(&tuple.subject_id)
        .bind(&tuple.subject_relation)
        .execute(&self.pool)
        .await
        .map_err(|e| ZanzibarError::StorageError(format!("Failed to delete tuple: {e}")))?;

        Ok(())
    }

    async fn list(
        &self,
        filter: &TupleFilter,
        pagination: &Pagination,
    ) -> Result<(Vec<Tuple>, Option<Cursor>)> {
        pagination.validate()?;
        debug!(?filter, ?pagination, "Listing tuples");

        let mut query = String::from("SELECT uuid, object_type, object_id, object_relation, subject_type, subject_id, subject_relation FROM tuples WHERE 1 = 1");
        let mut binds: Vec<&String> = Vec::new();
        for (column, value) in [
            ("object_type", &filter.object_type),
            ("object_id", &filter.object_id),
            ("object_relation", &filter.object_relation),
            ("subject_type", &filter.subject_type),
            ("subject_id", &filter.subject_id),
            ("subject_relation", &filter.subject_relation),
        ] {
            if let Some(value) = value {
                binds.push(value);
                query.push_str(&format!(" AND {column} = ?{}", binds.len()));
            }
        }
        if pagination.cursor.is_some() {
            query.push_str(&format!(" AND uuid < ?{}", binds.len() + 1));
        }
        let limit_param = binds.len() + usize::from(pagination.cursor.is_some()) + 1;
        query.push_str(&format!(" ORDER BY uuid DESC LIMIT ?{limit_param}"));

        let mut sqlx_query = sqlx::query(&query);
        for bind in binds {
            sqlx_query = sqlx_query.bind(bind);
        }
        if let Some(cursor) = pagination.cursor {
            sqlx_query = sqlx_query.bind(cursor);
        }
        let limit = i64::try_from(pagination.limit)
            .map_err(|_| ZanzibarError::ValidationError("page limit too large".to_string()))?;

        let rows = sqlx_query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ZanzibarError::StorageError(format!("Failed to list tuples: {e}")))?;

        let mut tuples = Vec::with_capacity(rows.len());
        let mut last_id = None;
        for row in &rows {
            last_id = Some(row.try_get::<Uuid, _>("uuid")?);
            tuples.push(tuple_from_row(row)?);
        }

        let next_cursor = if tuples.len() == pagination.limit {
            last_id
        } else {
            None
        };
        Ok((tuples, next_cursor))
    }

    async fn prepare_ruleset(
        &self,
        object_type: &str,
        relation: &str,
        ruleset: &[InferredRule],
    ) -> Result<Self::Plan> {
        let query = PreparedQuery::for_ruleset(ruleset, Dialect::Sqlite);
        debug!("Prepared query for {}#{}: {}", object_type, relation, query.render(1));
        Ok(query)
    }

    async fn query_checks<'a>(&self, checks: &[Check<'a, Self::Plan>]) -> Result<Vec<MarkedTuple>> {
        let mut matches: Vec<(i64, MarkedTuple)> = Vec::new();

        for (chunk_index, chunk) in checks
            .chunks(Dialect::Sqlite.max_checks_per_statement())
            .enumerate()
        {
            let offset = chunk_index * Dialect::Sqlite.max_checks_per_statement();
            let statement = sql::batch_query(chunk.iter().map(|check| check.plan));
            let mut query = sqlx::query(&statement);
            for check in chunk {
                query = query
                    .bind(&check.tuple.object_id)
                    .bind(&check.tuple.subject_type)
                    .bind(&check.tuple.subject_id)
                    .bind(&check.tuple.subject_relation);
            }

            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ZanzibarError::StorageError(format!("Failed to query checks: {e}")))?;

            for row in &rows {
                matches.push((
                    row.try_get("rule_kind")?,
                    MarkedTuple {
                        tuple: tuple_from_row(row)?,
                        check_index: offset + index_from_row(row, "check_index")?,
                        rule_index: index_from_row(row, "rule_index")?,
                    },
                ));
            }
        }

        matches.sort_by_key(|(kind, marked)| (*kind, marked.check_index, marked.rule_index));
        debug!(checks = checks.len(), matches = matches.len(), "Queried checks in SQLite");
        Ok(matches.into_iter().map(|(_, marked)| marked).collect())
    }
}
