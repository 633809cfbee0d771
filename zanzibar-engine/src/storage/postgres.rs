//! PostgreSQL-backed tuple storage
//!
//! Tuples live in a single `tuples` table keyed by a UUIDv7. Each relation's instruction
//! list is compiled once, either into a [`PreparedQuery`] (a resolver level is answered by
//! one statement that unions the queries of all its checks) or, with
//! [`PostgresStorage::with_functions`], into a stored plpgsql function that answers a whole
//! check server-side.

use crate::{
    compile::{InferredRule, Kind},
    error::{Result, ZanzibarError},
    storage::{
        sql::{self, Dialect, PreparedQuery, StoredFunction},
        Check, Cursor, MarkedTuple, Pagination, Storage,
    },
    tuple::{Tuple, TupleFilter},
};
use async_trait::async_trait;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    Executor, PgPool, Row,
};
use tracing::{debug, info};
use uuid::Uuid;

/// How checks are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// One batched select per resolver level; the resolver drives the traversal.
    Query,
    /// Stored functions traverse the graph inside the database, at most `max_depth`
    /// levels below the requested check.
    Functions { max_depth: usize },
}

/// Execution plan of one relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostgresPlan {
    Query(PreparedQuery),
    Function(StoredFunction),
}

pub struct PostgresStorage {
    pool: PgPool,
    mode: CheckMode,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            mode: CheckMode::Query,
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| ZanzibarError::StorageError(format!("Failed to connect: {e}")))?;

        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    /// Switches to stored check functions, created when a resolver prepares its rulesets.
    pub fn with_functions(mut self, max_depth: usize) -> Self {
        self.mode = CheckMode::Functions { max_depth };
        self
    }

    pub fn mode(&self) -> CheckMode {
        self.mode
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Runs a relation's stored function for one check.
    async fn call_function(&self, function: &StoredFunction, tuple: &Tuple) -> Result<bool> {
        let max_depth = match self.mode {
            CheckMode::Functions { max_depth } => max_depth,
            CheckMode::Query => 0,
        };
        let depth = i32::try_from(max_depth)
            .map_err(|_| ZanzibarError::ValidationError(format!("max_depth {max_depth} too large")))?;

        sqlx::query_scalar::<_, bool>(&function.call)
            .bind(&tuple.object_id)
            .bind(&tuple.subject_type)
            .bind(&tuple.subject_id)
            .bind(&tuple.subject_relation)
            .bind(depth)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.code().as_deref() == Some(sql::MAX_DEPTH_SQLSTATE) => {
                    ZanzibarError::MaxDepthExceeded(max_depth)
                }
                _ => ZanzibarError::StorageError(format!("Failed to run check function: {e}")),
            })
    }

    /// Runs batched selects, [`Dialect::max_checks_per_statement`] checks at a time.
    async fn query_batched(
        &self,
        checks: &[(usize, &Tuple, &PreparedQuery)],
        matches: &mut Vec<(i32, MarkedTuple)>,
    ) -> Result<()> {
        for chunk in checks.chunks(Dialect::Postgres.max_checks_per_statement()) {
            let statement = sql::batch_query(chunk.iter().map(|(_, _, query)| *query));
            let mut query = sqlx::query(&statement);
            for (_, tuple, _) in chunk {
                query = query
                    .bind(&tuple.object_id)
                    .bind(&tuple.subject_type)
                    .bind(&tuple.subject_id)
                    .bind(&tuple.subject_relation);
            }

            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ZanzibarError::StorageError(format!("Failed to query checks: {e}")))?;

            for row in &rows {
                let local = index_from_row(row, "check_index")?;
                let (check_index, _, _) = chunk.get(local).ok_or_else(|| {
                    ZanzibarError::StorageError(format!("result references unknown check {local}"))
                })?;
                matches.push((
                    row.try_get("rule_kind")?,
                    MarkedTuple {
                        tuple: tuple_from_row(row)?,
                        check_index: *check_index,
                        rule_index: index_from_row(row, "rule_index")?,
                    },
                ));
            }
        }
        Ok(())
    }
}

fn tuple_from_row(row: &PgRow) -> Result<Tuple> {
    Ok(Tuple {
        object_type: row.try_get("object_type")?,
        object_id: row.try_get("object_id")?,
        object_relation: row.try_get("object_relation")?,
        subject_type: row.try_get("subject_type")?,
        subject_id: row.try_get("subject_id")?,
        subject_relation: row.try_get("subject_relation")?,
    })
}

fn index_from_row(row: &PgRow, column: &str) -> Result<usize> {
    let value: i32 = row.try_get(column)?;
    usize::try_from(value)
        .map_err(|_| ZanzibarError::StorageError(format!("negative {column} {value} in result")))
}

#[async_trait]
impl Storage for PostgresStorage {
    type Plan = PostgresPlan;

    async fn write(&self, tuple: &Tuple) -> Result<()> {
        debug!("Writing tuple to PostgreSQL: {}", tuple);

        sqlx::query(
            r#"
            INSERT INTO tuples (
                uuid,
                object_type, object_id, object_relation,
                subject_type, subject_id, subject_relation
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
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
            WHERE object_type = $1
              AND object_id = $2
              AND object_relation = $3
              AND subject_type = $4
              AND subject_id = $5
              AND subject_relation = $6
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
        debug!("Deleting tuple from PostgreSQL: {}", tuple);

        sqlx::query(
            r#"
            DELETE FROM tuples
            WHERE object_type = $1
              AND object_id = $2
              AND object_relation = $3
              AND subject_type = $4
              AND subject_id = $5
              AND subject_relation = $6
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

        let mut query = String::from("SELECT uuid, object_type, object_id, object_relation, subject_type, subject_id, subject_relation FROM tuples WHERE TRUE");
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
                query.push_str(&format!(" AND {column} = ${}", binds.len()));
            }
        }
        if pagination.cursor.is_some() {
            query.push_str(&format!(" AND uuid < ${}", binds.len() + 1));
        }
        let limit_param = binds.len() + usize::from(pagination.cursor.is_some()) + 1;
        query.push_str(&format!(" ORDER BY uuid DESC LIMIT ${limit_param}"));

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
        debug!("Found {} tuples", tuples.len());
        Ok((tuples, next_cursor))
    }

    async fn prepare_ruleset(
        &self,
        object_type: &str,
        relation: &str,
        ruleset: &[InferredRule],
    ) -> Result<Self::Plan> {
        match self.mode {
            CheckMode::Query => {
                let query = PreparedQuery::for_ruleset(ruleset, Dialect::Postgres);
                debug!("Prepared query for {}#{}: {}", object_type, relation, query.render(1));
                Ok(PostgresPlan::Query(query))
            }
            CheckMode::Functions { .. } => {
                let function = sql::function_for(object_type, relation, ruleset);
                self.pool
                    .execute(function.declaration.as_str())
                    .await
                    .map_err(|e| {
                        ZanzibarError::StorageError(format!(
                            "Failed to create check function for {object_type}#{relation}: {e}"
                        ))
                    })?;
                debug!("Created check function for {}#{}", object_type, relation);
                Ok(PostgresPlan::Function(function))
            }
        }
    }

    async fn query_checks<'a>(&self, checks: &[Check<'a, Self::Plan>]) -> Result<Vec<MarkedTuple>> {
        let mut matches: Vec<(i32, MarkedTuple)> = Vec::new();
        let mut queried = Vec::new();

        for (check_index, check) in checks.iter().enumerate() {
            match check.plan {
                PostgresPlan::Query(query) => queried.push((check_index, &check.tuple, query)),
                // A granting function reports the check itself as a direct match.
                PostgresPlan::Function(function) => {
                    if self.call_function(function, &check.tuple).await? {
                        let rule_index = check
                            .ruleset
                            .iter()
                            .position(|rule| rule.kind() == Kind::Direct)
                            .ok_or_else(|| {
                                ZanzibarError::StorageError(format!(
                                    "no direct instruction for {}",
                                    check.tuple
                                ))
                            })?;
                        matches.push((
                            i32::from(Kind::Direct.rank()),
                            MarkedTuple {
                                tuple: check.tuple.clone(),
                                check_index,
                                rule_index,
                            },
                        ));
                    }
                }
            }
        }
        self.query_batched(&queried, &mut matches).await?;

        matches.sort_by_key(|(kind, marked)| (*kind, marked.check_index, marked.rule_index));
        debug!(checks = checks.len(), matches = matches.len(), "Queried checks in PostgreSQL");
        Ok(matches.into_iter().map(|(_, marked)| marked).collect())
    }
}
