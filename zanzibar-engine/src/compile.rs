//! Rule compiler.
//!
//! Turns the author-facing rule tree into, per `(object type, relation)`, a minimal
//! ordered list of [`InferredRule`]s:
//!
//! 1. unfold `anyOf` combinators and same-object inheritance chains into raw entries,
//! 2. sort and deduplicate them,
//! 3. merge indirect entries that only differ in the relations inherited from the subject,
//! 4. merge direct entries of the same object into one relation set,
//! 5. expand every direct entry into a `Direct` and a `DirectUserset` instruction,
//! 6. order by kind: `Direct`, then `DirectUserset`, then `Indirect`.
//!
//! The kind order is relied upon by the resolver: storage reports matches in that order,
//! so the first direct match ends a check.

use crate::{
    error::{Result, ZanzibarError},
    rule::{ObjectMap, Rule},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Nesting ceiling for `anyOf` combinators plus same-object inheritance hops.
pub const MAX_RULE_DEPTH: usize = 32;

/// Object type -> relation -> compiled instructions.
pub type InferredRuleMap = BTreeMap<String, BTreeMap<String, Vec<InferredRule>>>;

/// Instruction kind. The declaration order is the evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    Direct,
    DirectUserset,
    Indirect,
}

impl Kind {
    /// Position in the evaluation order, used by storage backends to sort matches.
    pub fn rank(self) -> u8 {
        match self {
            Kind::Direct => 0,
            Kind::DirectUserset => 1,
            Kind::Indirect => 2,
        }
    }
}

/// One compiled instruction of a relation's check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InferredRule {
    /// A tuple `object:id#r@subject` with `r` in `relations` and exactly the checked subject.
    #[serde(rename_all = "camelCase")]
    Direct {
        object: String,
        relations: Vec<String>,
    },
    /// A tuple `object:id#r@type:id#relation` with `r` in `relations`; the checked subject
    /// may be a member of that userset.
    #[serde(rename_all = "camelCase")]
    DirectUserset {
        object: String,
        relations: Vec<String>,
    },
    /// A tuple `object:id#r@subject:id` with `r` in `relations` links to an object of type
    /// `subject`, which grants the relation if it grants any of `with_relation_to_subject`.
    #[serde(rename_all = "camelCase")]
    Indirect {
        object: String,
        relations: Vec<String>,
        subject: String,
        with_relation_to_subject: Vec<String>,
    },
}

impl InferredRule {
    pub fn kind(&self) -> Kind {
        match self {
            InferredRule::Direct { .. } => Kind::Direct,
            InferredRule::DirectUserset { .. } => Kind::DirectUserset,
            InferredRule::Indirect { .. } => Kind::Indirect,
        }
    }

    pub fn object(&self) -> &str {
        match self {
            InferredRule::Direct { object, .. }
            | InferredRule::DirectUserset { object, .. }
            | InferredRule::Indirect { object, .. } => object,
        }
    }

    pub fn relations(&self) -> &[String] {
        match self {
            InferredRule::Direct { relations, .. }
            | InferredRule::DirectUserset { relations, .. }
            | InferredRule::Indirect { relations, .. } => relations,
        }
    }
}

/// Unfolded, not yet merged instruction. Field order drives the dedup sort.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RawEntry {
    object: String,
    subject: Option<String>,
    relations: BTreeSet<String>,
    with_relation_to_subject: BTreeSet<String>,
}

impl RawEntry {
    fn direct(object: &str, relation: &str) -> Self {
        Self {
            object: object.to_string(),
            subject: None,
            relations: BTreeSet::from([relation.to_string()]),
            with_relation_to_subject: BTreeSet::new(),
        }
    }

    fn is_indirect(&self) -> bool {
        !self.with_relation_to_subject.is_empty()
    }
}

/// Compiles every relation of every object type. The rule tree is expected to have
/// passed model validation; dangling references are still reported instead of skipped.
pub fn compile(objects: &ObjectMap) -> Result<InferredRuleMap> {
    let mut compiled = InferredRuleMap::new();
    for (object, relations) in objects {
        let mut by_relation = BTreeMap::new();
        for (relation, rule) in relations {
            by_relation.insert(relation.clone(), compile_relation(objects, object, relation, rule)?);
        }
        compiled.insert(object.clone(), by_relation);
    }
    Ok(compiled)
}

/// Compiles a single relation's rule into its ordered instruction list.
pub fn compile_relation(
    objects: &ObjectMap,
    object: &str,
    relation: &str,
    rule: &Rule,
) -> Result<Vec<InferredRule>> {
    let mut unfolder = Unfolder {
        objects,
        object,
        root: relation,
        visited: BTreeSet::from([relation.to_string()]),
        entries: Vec::new(),
    };
    unfolder.unfold(relation, rule, 0)?;

    let mut entries = unfolder.entries;
    entries.sort();
    entries.dedup();

    let entries = merge_direct(merge_indirect(entries));
    Ok(expand(entries))
}

struct Unfolder<'a> {
    objects: &'a ObjectMap,
    object: &'a str,
    root: &'a str,
    visited: BTreeSet<String>,
    entries: Vec<RawEntry>,
}

impl Unfolder<'_> {
    fn unfold(&mut self, relation: &str, rule: &Rule, depth: usize) -> Result<()> {
        if depth > MAX_RULE_DEPTH {
            return Err(ZanzibarError::InvalidModel(format!(
                "rule for {}#{} nests deeper than {} levels",
                self.object, self.root, MAX_RULE_DEPTH
            )));
        }

        if rule.is_any_of() {
            for sub_rule in &rule.rules {
                self.unfold(relation, sub_rule, depth + 1)?;
            }
            return Ok(());
        }

        self.entries.push(RawEntry::direct(self.object, relation));

        let Some(inherit_if) = non_empty(rule.inherit_if.as_ref()) else {
            return Ok(());
        };

        match (non_empty(rule.of_type.as_ref()), non_empty(rule.with_relation.as_ref())) {
            (Some(of_type), Some(with_relation)) => {
                self.entries.push(RawEntry {
                    object: self.object.to_string(),
                    subject: Some(of_type.to_string()),
                    relations: BTreeSet::from([with_relation.to_string()]),
                    with_relation_to_subject: BTreeSet::from([inherit_if.to_string()]),
                });
                Ok(())
            }
            (None, None) => {
                // A relation already on the chain contributes nothing new to the union.
                if !self.visited.insert(inherit_if.to_string()) {
                    return Ok(());
                }
                let inherited = self
                    .objects
                    .get(self.object)
                    .and_then(|relations| relations.get(inherit_if))
                    .ok_or_else(|| {
                        ZanzibarError::InvalidModel(format!(
                            "{}#{} inherits from undefined relation {}#{}",
                            self.object, relation, self.object, inherit_if
                        ))
                    })?;
                self.unfold(inherit_if, inherited, depth + 1)
            }
            _ => Err(ZanzibarError::InvalidModel(format!(
                "{}#{}: ofType and withRelation must be set together",
                self.object, relation
            ))),
        }
    }
}

/// Treats `Some("")` like `None`; JSON models written by other tools carry empty strings.
pub(crate) fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

/// Indirect entries sharing object, subject and link relations become one entry that
/// inherits the union of their subject relations.
fn merge_indirect(entries: Vec<RawEntry>) -> Vec<RawEntry> {
    let mut merged: Vec<RawEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_indirect() {
            if let Some(existing) = merged.iter_mut().find(|e| {
                e.is_indirect()
                    && e.object == entry.object
                    && e.subject == entry.subject
                    && e.relations == entry.relations
            }) {
                existing.with_relation_to_subject.extend(entry.with_relation_to_subject);
                continue;
            }
        }
        merged.push(entry);
    }
    merged
}

/// Direct entries of the same object become one entry over the union of their relations,
/// so a whole inheritance chain is checked with a single lookup.
fn merge_direct(entries: Vec<RawEntry>) -> Vec<RawEntry> {
    let mut merged: Vec<RawEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.subject.is_none() && !entry.is_indirect() {
            if let Some(existing) = merged
                .iter_mut()
                .find(|e| e.subject.is_none() && !e.is_indirect() && e.object == entry.object)
            {
                existing.relations.extend(entry.relations);
                continue;
            }
        }
        merged.push(entry);
    }
    merged
}

fn expand(entries: Vec<RawEntry>) -> Vec<InferredRule> {
    let mut rules = Vec::with_capacity(entries.len() * 2);
    for entry in entries {
        let relations: Vec<String> = entry.relations.into_iter().collect();
        match entry.subject {
            Some(subject) if !entry.with_relation_to_subject.is_empty() => {
                rules.push(InferredRule::Indirect {
                    object: entry.object,
                    relations,
                    subject,
                    with_relation_to_subject: entry.with_relation_to_subject.into_iter().collect(),
                });
            }
            _ => {
                rules.push(InferredRule::Direct {
                    object: entry.object.clone(),
                    relations: relations.clone(),
                });
                rules.push(InferredRule::DirectUserset {
                    object: entry.object,
                    relations,
                });
            }
        }
    }
    // Stable, so instructions of the same kind keep the deterministic entry order.
    rules.sort_by_key(InferredRule::kind);
    rules
}
