use crate::settings::{Backend, Settings};
use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use zanzibar_engine::{
    storage::DEFAULT_PAGE_SIZE, AuthorizationEngine, InMemoryStorage, Model, Pagination,
    PostgresStorage, SqliteStorage, Storage, Tuple, TupleFilter, ZanzibarError,
};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a relationship; prints true or false and exits with 0 or 1, or 2 on error
    Check {
        /// e.g. doc:readme#viewer@user:alice
        tuple: String,
    },
    /// Write one or more tuples
    Write {
        #[arg(required = true)]
        tuples: Vec<String>,
    },
    /// Print the identifier of a stored tuple
    Read { tuple: String },
    /// Delete a tuple
    Delete { tuple: String },
    /// List stored tuples, newest first
    List(ListArgs),
    /// Print the compiled instructions of a relation as JSON
    Ruleset {
        object_type: String,
        relation: String,
    },
    /// Apply the schema migrations of the SQL backend
    Migrate,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    object_type: Option<String>,

    #[arg(long)]
    object_id: Option<String>,

    #[arg(long = "relation")]
    object_relation: Option<String>,

    #[arg(long)]
    subject_type: Option<String>,

    #[arg(long)]
    subject_id: Option<String>,

    #[arg(long)]
    subject_relation: Option<String>,

    /// Page size
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    limit: usize,

    /// Continue after this tuple identifier
    #[arg(long)]
    cursor: Option<Uuid>,
}

impl ListArgs {
    fn filter(&self) -> TupleFilter {
        TupleFilter {
            object_type: self.object_type.clone(),
            object_id: self.object_id.clone(),
            object_relation: self.object_relation.clone(),
            subject_type: self.subject_type.clone(),
            subject_id: self.subject_id.clone(),
            subject_relation: self.subject_relation.clone(),
        }
    }

    fn pagination(&self) -> Pagination {
        Pagination {
            cursor: self.cursor,
            limit: self.limit,
        }
    }
}

/// Loads the model, opens the configured backend and runs `command` against it.
pub async fn run(command: Command, settings: &Settings) -> Result<ExitCode> {
    let model_path = &settings.model.path;
    let model = Model::from_file(model_path)
        .with_context(|| format!("Failed to load model from {}", model_path.display()))?;
    let model = Arc::new(model);
    let max_depth = settings.resolver.max_depth;

    match settings.storage.backend {
        Backend::Memory => {
            let engine =
                AuthorizationEngine::new(model, Arc::new(InMemoryStorage::new()), max_depth).await?;
            if let Some(path) = &settings.storage.tuples {
                let tuples = read_tuple_file(path)?;
                engine
                    .write_all(&tuples)
                    .await
                    .with_context(|| format!("Failed to seed tuples from {}", path.display()))?;
                info!("Seeded {} tuples from {}", tuples.len(), path.display());
            }
            execute(&engine, command, settings).await
        }
        Backend::Postgres => {
            let url = settings
                .storage
                .postgres_url
                .as_deref()
                .context("storage.postgres_url is required for the postgres backend")?;
            let storage = PostgresStorage::connect(url, settings.storage.max_connections).await?;
            if settings.storage.postgres_functions {
                info!("Checking through stored functions");
            }

            if matches!(command, Command::Migrate) || settings.storage.run_migrations {
                storage.run_migrations().await?;
            }
            if matches!(command, Command::Migrate) {
                println!("migrations applied");
                return Ok(ExitCode::SUCCESS);
            }

            let storage = if settings.storage.postgres_functions {
                storage.with_functions(max_depth)
            } else {
                storage
            };
            let engine = AuthorizationEngine::new(model, Arc::new(storage), max_depth).await?;
            execute(&engine, command, settings).await
        }
        Backend::Sqlite => {
            let url = settings
                .storage
                .sqlite_url
                .as_deref()
                .context("storage.sqlite_url is required for the sqlite backend")?;
            let storage = SqliteStorage::connect(url, settings.storage.max_connections).await?;

            if matches!(command, Command::Migrate) || settings.storage.run_migrations {
                storage.run_migrations().await?;
            }
            if matches!(command, Command::Migrate) {
                println!("migrations applied");
                return Ok(ExitCode::SUCCESS);
            }

            let engine = AuthorizationEngine::new(model, Arc::new(storage), max_depth).await?;
            execute(&engine, command, settings).await
        }
    }
}

async fn execute<S: Storage>(
    engine: &AuthorizationEngine<S>,
    command: Command,
    settings: &Settings,
) -> Result<ExitCode> {
    match command {
        Command::Check { tuple } => {
            let tuple = parse_tuple(&tuple)?;
            let allowed = match settings.resolver.timeout() {
                Some(timeout) => engine.check_with_timeout(&tuple, timeout).await?,
                None => engine.check(&tuple).await?,
            };
            println!("{allowed}");
            Ok(if allowed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Write { tuples } => {
            let tuples = tuples
                .iter()
                .map(String::as_str)
                .map(parse_tuple)
                .collect::<Result<Vec<_>>>()?;
            engine.write_all(&tuples).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Read { tuple } => {
            let id = engine.read(&parse_tuple(&tuple)?).await?;
            println!("{id}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Delete { tuple } => {
            engine.delete(&parse_tuple(&tuple)?).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::List(args) => {
            let (tuples, next_cursor) = engine.list(&args.filter(), &args.pagination()).await?;
            for tuple in tuples {
                println!("{tuple}");
            }
            // Commented, so the output stays a valid seed file.
            if let Some(cursor) = next_cursor {
                println!("# next cursor: {cursor}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Ruleset {
            object_type,
            relation,
        } => {
            let ruleset = engine.ruleset_for(&object_type, &relation).ok_or_else(|| {
                ZanzibarError::RelationNotFound {
                    object_type: object_type.clone(),
                    relation: relation.clone(),
                }
            })?;
            println!("{}", serde_json::to_string_pretty(ruleset)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Migrate => bail!("migrate requires the postgres or sqlite backend"),
    }
}

/// Exit status for errors, kept apart from a denied check's [`ExitCode::FAILURE`].
pub const EXIT_ERROR: u8 = 2;

/// Maps a command outcome to the process exit status, reporting errors on stderr.
pub fn exit_status(result: Result<ExitCode>) -> ExitCode {
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn parse_tuple(text: &str) -> Result<Tuple> {
    Ok(text.parse()?)
}

/// Reads a seed file: one tuple per line, blank lines and `#` comments skipped.
pub fn read_tuple_file(path: &Path) -> Result<Vec<Tuple>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tuples from {}", path.display()))?;
    parse_tuple_lines(&contents).with_context(|| format!("Invalid tuple file {}", path.display()))
}

fn parse_tuple_lines(contents: &str) -> Result<Vec<Tuple>> {
    contents
        .lines()
        .enumerate()
        .map(|(number, line)| (number + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| {
            line.parse::<Tuple>()
                .with_context(|| format!("line {number}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_tuple_lines_skips_comments_and_blanks() {
        let contents = "\
# documents
doc:mydoc#parent@folder:myfolder

  group:mygroup#member@user:myuser
# trailing comment
";
        let tuples = parse_tuple_lines(contents).unwrap();
        assert_eq!(
            tuples,
            vec![
                Tuple::new("doc", "mydoc", "parent", "folder", "myfolder"),
                Tuple::new("group", "mygroup", "member", "user", "myuser"),
            ]
        );
    }

    #[test]
    fn test_parse_tuple_lines_reports_line_number() {
        let err = parse_tuple_lines("doc:d#parent@folder:f\nnot a tuple\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"), "{err:#}");
    }

    #[test]
    fn test_read_tuple_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("tuples.txt");
        fs::write(&path, "folder:f#viewer@group:g#member\n").expect("Failed to write tuples");

        let tuples = read_tuple_file(&path).unwrap();
        assert_eq!(
            tuples,
            vec![Tuple::userset("folder", "f", "viewer", "group", "g", "member")]
        );
        assert!(read_tuple_file(&temp_dir.path().join("missing.txt")).is_err());
    }

    #[tokio::test]
    async fn test_check_against_seeded_memory_backend() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let model_path = temp_dir.path().join("model.json");
        let tuples_path = temp_dir.path().join("tuples.txt");
        fs::write(
            &model_path,
            serde_json::to_string(&zanzibar_engine::testing::document_objects()).unwrap(),
        )
        .unwrap();
        let seed: Vec<String> = zanzibar_engine::testing::fixture_tuples()
            .iter()
            .map(ToString::to_string)
            .collect();
        fs::write(&tuples_path, seed.join("\n")).unwrap();

        let mut settings = Settings::default();
        settings.model.path = model_path;
        settings.storage.tuples = Some(tuples_path);

        let allowed = run(
            Command::Check {
                tuple: "doc:mydoc#viewer@user:myuser".to_string(),
            },
            &settings,
        )
        .await
        .unwrap();
        assert_eq!(allowed, ExitCode::SUCCESS);

        let denied = run(
            Command::Check {
                tuple: "doc:mydoc#editor@user:myuser".to_string(),
            },
            &settings,
        )
        .await
        .unwrap();
        assert_eq!(denied, ExitCode::FAILURE);

        let migrate = run(Command::Migrate, &settings).await;
        assert!(migrate.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_backend_keeps_tuples_between_runs() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let model_path = temp_dir.path().join("model.json");
        fs::write(
            &model_path,
            serde_json::to_string(&zanzibar_engine::testing::document_objects()).unwrap(),
        )
        .unwrap();

        let mut settings = Settings::default();
        settings.model.path = model_path;
        settings.storage.backend = Backend::Sqlite;
        settings.storage.sqlite_url = Some(format!(
            "sqlite://{}",
            temp_dir.path().join("tuples.db").display()
        ));

        assert_eq!(run(Command::Migrate, &settings).await.unwrap(), ExitCode::SUCCESS);
        let written = run(
            Command::Write {
                tuples: vec![
                    "doc:mydoc#parent@folder:myfolder".to_string(),
                    "folder:myfolder#viewer@user:myuser".to_string(),
                ],
            },
            &settings,
        )
        .await
        .unwrap();
        assert_eq!(written, ExitCode::SUCCESS);

        let allowed = run(
            Command::Check {
                tuple: "doc:mydoc#viewer@user:myuser".to_string(),
            },
            &settings,
        )
        .await
        .unwrap();
        assert_eq!(allowed, ExitCode::SUCCESS);

        settings.storage.sqlite_url = None;
        let missing_url = run(Command::Migrate, &settings).await;
        assert_eq!(exit_status(missing_url), ExitCode::from(EXIT_ERROR));
    }

    #[tokio::test]
    async fn test_undecided_check_exits_apart_from_denied() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let model_path = temp_dir.path().join("model.json");
        let tuples_path = temp_dir.path().join("tuples.txt");
        fs::write(
            &model_path,
            serde_json::to_string(&zanzibar_engine::testing::document_objects()).unwrap(),
        )
        .unwrap();
        let seed: Vec<String> = zanzibar_engine::testing::fixture_tuples()
            .iter()
            .map(ToString::to_string)
            .collect();
        fs::write(&tuples_path, seed.join("\n")).unwrap();

        let mut settings = Settings::default();
        settings.model.path = model_path;
        settings.storage.tuples = Some(tuples_path);
        // doc -> folder -> group needs three levels.
        settings.resolver.max_depth = 1;

        let result = run(
            Command::Check {
                tuple: "doc:mydoc#viewer@user:myuser".to_string(),
            },
            &settings,
        )
        .await;
        assert!(matches!(
            result.as_ref().unwrap_err().downcast_ref::<ZanzibarError>(),
            Some(ZanzibarError::MaxDepthExceeded(1))
        ));
        assert_eq!(exit_status(result), ExitCode::from(EXIT_ERROR));

        assert_eq!(exit_status(Ok(ExitCode::FAILURE)), ExitCode::FAILURE);
        assert_ne!(ExitCode::from(EXIT_ERROR), ExitCode::FAILURE);
    }
}
