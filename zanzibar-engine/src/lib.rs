//! Zanzibar-style relationship-based authorization engine
//!
//! Authorization is derived from a graph of relationship tuples such as
//! `doc:readme#viewer@group:eng#member`:
//! - a [`Model`] declares, per object type and relation, how a relation can be granted
//!   (directly, through another relation on the same object, or inherited from a linked
//!   object) and compiles that into an ordered list of [`InferredRule`]s
//! - a [`Storage`] backend (in memory, PostgreSQL or SQLite) stores tuples and answers one
//!   batched query per traversal level
//! - a [`Resolver`] walks the graph breadth-first, stopping at the first direct grant
//! - the [`AuthorizationEngine`] validates tuples against the model before they reach
//!   storage or the resolver
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use zanzibar_engine::{testing, AuthorizationEngine, InMemoryStorage};
//!
//! # #[tokio::main]
//! # async fn main() -> zanzibar_engine::Result<()> {
//! let model = Arc::new(testing::document_model()?);
//! let engine = AuthorizationEngine::new(model, Arc::new(InMemoryStorage::new()), 16).await?;
//!
//! engine.write(&"group:eng#member@user:alice".parse()?).await?;
//! engine.write(&"folder:specs#viewer@group:eng#member".parse()?).await?;
//! engine.write(&"doc:design#parent@folder:specs".parse()?).await?;
//!
//! assert!(engine.check(&"doc:design#viewer@user:alice".parse()?).await?);
//! assert!(!engine.check(&"doc:design#editor@user:alice".parse()?).await?);
//! # Ok(())
//! # }
//! ```

pub mod compile;
pub mod engine;
pub mod error;
pub mod model;
pub mod resolver;
pub mod rule;
pub mod storage;
pub mod testing;
pub mod tuple;

pub use compile::{InferredRule, InferredRuleMap, Kind};
pub use engine::AuthorizationEngine;
pub use error::{Result, ZanzibarError};
pub use model::Model;
pub use resolver::{Resolver, DEFAULT_MAX_DEPTH};
pub use rule::{ObjectMap, RelationMap, Rule};
pub use storage::{
    postgres::{PostgresPlan, PostgresStorage},
    sqlite::SqliteStorage,
    Check, Cursor, InMemoryStorage, MarkedTuple, Pagination, Storage,
};
pub use tuple::{Tuple, TupleFilter};
