use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker stored in [`Rule::inherit_if`] for rules combined with [`Rule::any_of`].
pub const ANY_OF: &str = "anyOf";

/// Object type -> relation -> rule. The author-facing authorization model.
pub type ObjectMap = BTreeMap<String, RelationMap>;

/// Relation name -> rule for one object type.
pub type RelationMap = BTreeMap<String, Rule>;

/// How a relation can be satisfied.
///
/// - `Rule::default()`: only a tuple naming the relation grants it.
/// - `inherit_if` alone: the relation is also granted by another relation on the same object.
/// - `inherit_if` + `of_type` + `with_relation`: the relation is also granted when the
///   object points through `with_relation` to an object of type `of_type` that grants
///   `inherit_if`.
/// - [`Rule::any_of`]: the union of the sub-rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit_if: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub of_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_relation: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
}

impl Rule {
    /// Inherit from another relation on the same object.
    pub fn inherit_if(relation: &str) -> Self {
        Self {
            inherit_if: Some(relation.to_string()),
            ..Self::default()
        }
    }

    /// Inherit `relation` from the object of type `of_type` this object points to
    /// through `with_relation`.
    pub fn inherit_via(relation: &str, of_type: &str, with_relation: &str) -> Self {
        Self {
            inherit_if: Some(relation.to_string()),
            of_type: Some(of_type.to_string()),
            with_relation: Some(with_relation.to_string()),
            rules: Vec::new(),
        }
    }

    pub fn any_of(rules: impl IntoIterator<Item = Rule>) -> Self {
        Self {
            inherit_if: Some(ANY_OF.to_string()),
            of_type: None,
            with_relation: None,
            rules: rules.into_iter().collect(),
        }
    }

    pub fn is_any_of(&self) -> bool {
        self.inherit_if.as_deref() == Some(ANY_OF)
    }
}
