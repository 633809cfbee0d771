use crate::{
    compile::InferredRule,
    error::{Result, ZanzibarError},
    model::Model,
    storage::{Check, Storage},
    tuple::Tuple,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Default bound on the number of traversal levels below the requested check.
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// Answers checks with a level-synchronous breadth-first search over the relationship
/// graph, issuing exactly one [`Storage::query_checks`] call per level.
///
/// Read-only after construction; concurrent checks only share the model, the prepared
/// plans and the storage.
pub struct Resolver<S: Storage> {
    model: Arc<Model>,
    storage: Arc<S>,
    plans: BTreeMap<String, BTreeMap<String, S::Plan>>,
    max_depth: usize,
}

impl<S: Storage> Resolver<S> {
    /// Prepares a storage plan for every compiled relation of the model.
    pub async fn new(model: Arc<Model>, storage: Arc<S>, max_depth: usize) -> Result<Self> {
        if max_depth == 0 {
            return Err(ZanzibarError::ValidationError(
                "max_depth must be greater than zero".to_string(),
            ));
        }

        let mut plans = BTreeMap::new();
        for (object_type, relations) in model.inferred_rules() {
            let mut by_relation = BTreeMap::new();
            for (relation, ruleset) in relations {
                let plan = storage.prepare_ruleset(object_type, relation, ruleset).await?;
                by_relation.insert(relation.clone(), plan);
            }
            plans.insert(object_type.clone(), by_relation);
        }

        info!(max_depth, "Resolver ready");
        Ok(Self {
            model,
            storage,
            plans,
            max_depth,
        })
    }

    /// The model the plans were prepared from.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The storage every level's batch is sent to.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Deepest traversal level a check may reach before it fails with
    /// [`ZanzibarError::MaxDepthExceeded`].
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Compiled instructions for `object_type#relation`, as handed to the storage plans.
    pub fn ruleset_for(&self, object_type: &str, relation: &str) -> Option<&[InferredRule]> {
        self.model.ruleset_for(object_type, relation)
    }

    /// Whether `tuple.subject` holds `tuple.object_relation` on `tuple.object`, directly or
    /// through usersets and inherited relations.
    ///
    /// `Err(MaxDepthExceeded)` means the answer is unknown, not that access is denied.
    pub async fn check(&self, tuple: &Tuple) -> Result<bool> {
        let mut checks = vec![self.check_for(tuple.clone())?];
        let mut depth = 0;

        loop {
            if checks.is_empty() {
                debug!(depth, "No path to {}", tuple);
                return Ok(false);
            }
            if depth > self.max_depth {
                return Err(ZanzibarError::MaxDepthExceeded(self.max_depth));
            }

            debug!(depth, checks = checks.len(), "Querying level for {}", tuple);
            let matches = self.storage.query_checks(&checks).await?;

            let mut next = Vec::new();
            let mut pending = HashSet::new();
            for marked in &matches {
                let check = checks.get(marked.check_index).ok_or_else(|| {
                    ZanzibarError::StorageError(format!(
                        "match references check {} of {}",
                        marked.check_index,
                        checks.len()
                    ))
                })?;
                let rule = check.ruleset.get(marked.rule_index).ok_or_else(|| {
                    ZanzibarError::StorageError(format!(
                        "match references instruction {} of {}",
                        marked.rule_index,
                        check.ruleset.len()
                    ))
                })?;
                let found = &marked.tuple;

                match rule {
                    InferredRule::Direct { .. } => {
                        debug!(depth, "Direct match {} for {}", found, tuple);
                        return Ok(true);
                    }
                    InferredRule::DirectUserset { .. } => {
                        if !found.is_userset() {
                            return Err(ZanzibarError::StorageError(format!(
                                "userset instruction matched {found}, which has no subject relation"
                            )));
                        }
                        let member = check.tuple.with_object(
                            &found.subject_type,
                            &found.subject_id,
                            &found.subject_relation,
                        );
                        if pending.insert(member.clone()) {
                            next.push(self.check_for(member)?);
                        }
                    }
                    InferredRule::Indirect {
                        with_relation_to_subject,
                        ..
                    } => {
                        for relation in with_relation_to_subject {
                            let inherited =
                                check
                                    .tuple
                                    .with_object(&found.subject_type, &found.subject_id, relation);
                            if pending.insert(inherited.clone()) {
                                next.push(self.check_for(inherited)?);
                            }
                        }
                    }
                }
            }

            checks = next;
            depth += 1;
        }
    }

    fn check_for(&self, tuple: Tuple) -> Result<Check<'_, S::Plan>> {
        let ruleset = self
            .model
            .ruleset_for(&tuple.object_type, &tuple.object_relation)
            .ok_or_else(|| ZanzibarError::relation_not_found(&tuple.object_type, &tuple.object_relation))?;
        let plan = self
            .plans
            .get(&tuple.object_type)
            .and_then(|relations| relations.get(&tuple.object_relation))
            .ok_or_else(|| ZanzibarError::relation_not_found(&tuple.object_type, &tuple.object_relation))?;

        Ok(Check {
            tuple,
            ruleset,
            plan,
        })
    }
}
