use crate::{
    compile::{InferredRule, Kind},
    error::{Result, ZanzibarError},
    tuple::{Tuple, TupleFilter},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

pub mod postgres;
pub mod sql;
pub mod sqlite;

/// Opaque list position. Tuple identifiers are UUIDv7, so they sort by insertion time.
pub type Cursor = Uuid;

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// List tuples strictly older than this one; `None` starts at the newest tuple.
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    pub fn first(limit: usize) -> Self {
        Self { cursor: None, limit }
    }

    pub fn after(cursor: Cursor, limit: usize) -> Self {
        Self {
            cursor: Some(cursor),
            limit,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(ZanzibarError::ValidationError(
                "page limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One pending check of a resolver level.
///
/// `tuple` carries the object being asked about and the subject of the original request;
/// `ruleset` and `plan` belong to `(tuple.object_type, tuple.object_relation)`.
#[derive(Debug)]
pub struct Check<'a, P> {
    pub tuple: Tuple,
    pub ruleset: &'a [InferredRule],
    pub plan: &'a P,
}

/// A stored tuple matched by instruction `rule_index` of check `check_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedTuple {
    pub tuple: Tuple,
    pub check_index: usize,
    pub rule_index: usize,
}

/// Storage interface for relationship tuples.
///
/// Implementations must be safe for concurrent use and cancel-safe: dropping any returned
/// future must not leave a partial write behind.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend-specific execution plan for one relation's instruction list.
    type Plan: Send + Sync;

    /// Persists a tuple. Writing a tuple that is already stored is a no-op.
    async fn write(&self, tuple: &Tuple) -> Result<()>;

    /// Returns the identifier of a stored tuple, or [`ZanzibarError::NotFound`].
    async fn read(&self, tuple: &Tuple) -> Result<Uuid>;

    /// Removes a tuple. Removing an absent tuple is not an error.
    async fn delete(&self, tuple: &Tuple) -> Result<()>;

    /// Lists matching tuples, newest first. The returned cursor is `Some` only when the page
    /// is full and there may be more.
    async fn list(
        &self,
        filter: &TupleFilter,
        pagination: &Pagination,
    ) -> Result<(Vec<Tuple>, Option<Cursor>)>;

    /// Called once per relation when a resolver is built.
    async fn prepare_ruleset(
        &self,
        object_type: &str,
        relation: &str,
        ruleset: &[InferredRule],
    ) -> Result<Self::Plan>;

    /// Returns every stored tuple matched by any instruction of any check, ordered by
    /// instruction kind across the whole batch: all `Direct` matches, then all
    /// `DirectUserset` matches, then all `Indirect` matches.
    async fn query_checks<'a>(&self, checks: &[Check<'a, Self::Plan>]) -> Result<Vec<MarkedTuple>>;
}

#[derive(Debug, Default)]
struct Tuples {
    ids: BTreeMap<Tuple, Uuid>,
    by_id: BTreeMap<Uuid, Tuple>,
}

impl Tuples {
    /// All tuples of one `(object_type, object_id, object_relation)`.
    fn scan<'s>(
        &'s self,
        object_type: &'s str,
        object_id: &'s str,
        object_relation: &'s str,
    ) -> impl Iterator<Item = &'s Tuple> + 's {
        self.ids
            .range(Tuple::range_start(object_type, object_id, object_relation)..)
            .map(|(tuple, _)| tuple)
            .take_while(move |tuple| tuple.has_object(object_type, object_id, object_relation))
    }
}

/// In-memory tuple storage for tests, development and the CLI's `memory` backend.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tuples: RwLock<Tuples>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tuples.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    type Plan = ();

    async fn write(&self, tuple: &Tuple) -> Result<()> {
        let mut tuples = self.tuples.write();
        if tuples.ids.contains_key(tuple) {
            return Ok(());
        }
        let id = Uuid::now_v7();
        tuples.ids.insert(tuple.clone(), id);
        tuples.by_id.insert(id, tuple.clone());
        debug!(%id, "Stored tuple {}", tuple);
        Ok(())
    }

    async fn read(&self, tuple: &Tuple) -> Result<Uuid> {
        self.tuples
            .read()
            .ids
            .get(tuple)
            .copied()
            .ok_or(ZanzibarError::NotFound)
    }

    async fn delete(&self, tuple: &Tuple) -> Result<()> {
        let mut tuples = self.tuples.write();
        if let Some(id) = tuples.ids.remove(tuple) {
            tuples.by_id.remove(&id);
            debug!(%id, "Deleted tuple {}", tuple);
        }
        Ok(())
    }

    async fn list(
        &self,
        filter: &TupleFilter,
        pagination: &Pagination,
    ) -> Result<(Vec<Tuple>, Option<Cursor>)> {
        pagination.validate()?;
        let tuples = self.tuples.read();
        let newer_bound = pagination.cursor.unwrap_or(Uuid::max());

        let page: Vec<(Uuid, Tuple)> = tuples
            .by_id
            .range(..newer_bound)
            .rev()
            .filter(|(_, tuple)| filter.matches(tuple))
            .take(pagination.limit)
            .map(|(id, tuple)| (*id, tuple.clone()))
            .collect();

        let next_cursor = if page.len() == pagination.limit {
            page.last().map(|(id, _)| *id)
        } else {
            None
        };
        Ok((page.into_iter().map(|(_, tuple)| tuple).collect(), next_cursor))
    }

    async fn prepare_ruleset(
        &self,
        _object_type: &str,
        _relation: &str,
        _ruleset: &[InferredRule],
    ) -> Result<Self::Plan> {
        Ok(())
    }

    async fn query_checks<'a>(&self, checks: &[Check<'a, Self::Plan>]) -> Result<Vec<MarkedTuple>> {
        let tuples = self.tuples.read();
        let mut matches: Vec<(Kind, MarkedTuple)> = Vec::new();

        for (check_index, check) in checks.iter().enumerate() {
            let object_id = check.tuple.object_id.as_str();
            for (rule_index, rule) in check.ruleset.iter().enumerate() {
                let mut mark = |tuple: &Tuple| {
                    matches.push((
                        rule.kind(),
                        MarkedTuple {
                            tuple: tuple.clone(),
                            check_index,
                            rule_index,
                        },
                    ));
                };

                match rule {
                    InferredRule::Direct { object, relations } => {
                        for relation in relations {
                            let candidate = check.tuple.with_object(object, object_id, relation);
                            if let Some((stored, _)) = tuples.ids.get_key_value(&candidate) {
                                mark(stored);
                            }
                        }
                    }
                    InferredRule::DirectUserset { object, relations } => {
                        for relation in relations {
                            tuples
                                .scan(object, object_id, relation)
                                .filter(|tuple| tuple.is_userset())
                                .for_each(&mut mark);
                        }
                    }
                    InferredRule::Indirect {
                        object,
                        relations,
                        subject,
                        ..
                    } => {
                        for relation in relations {
                            tuples
                                .scan(object, object_id, relation)
                                .filter(|tuple| tuple.subject_type == *subject)
                                .for_each(&mut mark);
                        }
                    }
                }
            }
        }

        // Stable, so matches of one kind stay in check and instruction order.
        matches.sort_by_key(|(kind, _)| *kind);
        debug!(checks = checks.len(), matches = matches.len(), "Queried checks in memory");
        Ok(matches.into_iter().map(|(_, marked)| marked).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn tuple(s: &str) -> Tuple {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let storage = InMemoryStorage::new();
        let t = tuple("doc:mydoc#owner@user:myowner");

        assert!(matches!(storage.read(&t).await, Err(ZanzibarError::NotFound)));

        storage.write(&t).await.unwrap();
        let id = storage.read(&t).await.unwrap();
        assert_eq!(id.get_version_num(), 7);

        // Idempotent, keeps the original identifier.
        storage.write(&t).await.unwrap();
        assert_eq!(storage.read(&t).await.unwrap(), id);
        assert_eq!(storage.len(), 1);

        storage.delete(&t).await.unwrap();
        assert!(matches!(storage.read(&t).await, Err(ZanzibarError::NotFound)));
        assert!(storage.is_empty());

        // Deleting again is fine.
        storage.delete(&t).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_pages_through_everything_once() {
        let storage = InMemoryStorage::new();
        for i in 0..5 {
            storage
                .write(&Tuple::new("doc", &format!("d{i}"), "viewer", "user", "u"))
                .await
                .unwrap();
        }
        storage.write(&tuple("group:g#member@user:u")).await.unwrap();

        let filter = TupleFilter {
            object_type: Some("doc".to_string()),
            ..TupleFilter::default()
        };
        let mut seen = Vec::new();
        let mut pagination = Pagination::first(2);
        loop {
            let (page, next) = storage.list(&filter, &pagination).await.unwrap();
            assert!(page.len() <= 2);
            seen.extend(page);
            match next {
                Some(cursor) => pagination = Pagination::after(cursor, 2),
                None => break,
            }
        }

        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|t| t.object_type == "doc"));
    }

    #[tokio::test]
    async fn test_list_partial_page_has_no_cursor() {
        let storage = InMemoryStorage::new();
        storage.write(&tuple("group:g#member@user:u")).await.unwrap();

        let (page, next) = storage
            .list(&TupleFilter::default(), &Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_list_rejects_zero_limit() {
        let storage = InMemoryStorage::new();
        let result = storage
            .list(&TupleFilter::default(), &Pagination::first(0))
            .await;
        assert!(matches!(result, Err(ZanzibarError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_query_checks_marks_indirect_parent() {
        let model = testing::document_model().unwrap();
        let storage = InMemoryStorage::new();
        testing::load_fixtures(&storage).await.unwrap();

        let ruleset = model.ruleset_for("doc", "viewer").unwrap();
        let plan = storage.prepare_ruleset("doc", "viewer", ruleset).await.unwrap();
        let checks = [Check {
            tuple: tuple("doc:mydoc#viewer@user:myuser"),
            ruleset,
            plan: &plan,
        }];

        let matches = storage.query_checks(&checks).await.unwrap();
        assert_eq!(
            matches,
            vec![MarkedTuple {
                tuple: tuple("doc:mydoc#parent@folder:myfolder"),
                check_index: 0,
                rule_index: 2,
            }]
        );
    }

    #[tokio::test]
    async fn test_query_checks_orders_by_kind_across_checks() {
        let model = testing::document_model().unwrap();
        let storage = InMemoryStorage::new();
        testing::load_fixtures(&storage).await.unwrap();

        let folder_viewer = model.ruleset_for("folder", "viewer").unwrap();
        let doc_owner = model.ruleset_for("doc", "owner").unwrap();
        let checks = [
            // Userset match only.
            Check {
                tuple: tuple("folder:myfolder#viewer@user:myuser"),
                ruleset: folder_viewer,
                plan: &(),
            },
            // Direct match plus an indirect match through the parent folder.
            Check {
                tuple: tuple("doc:mydoc#owner@user:myowner"),
                ruleset: doc_owner,
                plan: &(),
            },
        ];

        let matches = storage.query_checks(&checks).await.unwrap();
        let kinds: Vec<Kind> = matches
            .iter()
            .map(|m| checks[m.check_index].ruleset[m.rule_index].kind())
            .collect();
        assert_eq!(kinds, vec![Kind::Direct, Kind::DirectUserset, Kind::Indirect]);
        assert_eq!(matches[0].check_index, 1);
        assert_eq!(matches[0].tuple, tuple("doc:mydoc#owner@user:myowner"));
        assert_eq!(matches[1].check_index, 0);
        assert_eq!(matches[1].tuple, tuple("folder:myfolder#viewer@group:mygroup#member"));
    }

    #[tokio::test]
    async fn test_indirect_matches_userset_subjects_of_the_linked_type() {
        let model = testing::document_model().unwrap();
        let storage = InMemoryStorage::new();
        storage
            .write(&tuple("doc:d#parent@folder:f#owner"))
            .await
            .unwrap();
        storage.write(&tuple("doc:d#parent@folder:g")).await.unwrap();
        storage.write(&tuple("doc:d#parent@group:x")).await.unwrap();

        let ruleset = model.ruleset_for("doc", "viewer").unwrap();
        let checks = [Check {
            tuple: tuple("doc:d#viewer@user:u"),
            ruleset,
            plan: &(),
        }];
        let matches = storage.query_checks(&checks).await.unwrap();
        let found: Vec<Tuple> = matches.iter().map(|m| m.tuple.clone()).collect();
        assert_eq!(
            found,
            vec![tuple("doc:d#parent@folder:f#owner"), tuple("doc:d#parent@folder:g")]
        );
        assert!(matches
            .iter()
            .all(|m| checks[0].ruleset[m.rule_index].kind() == Kind::Indirect));
    }
}
