use crate::error::{Result, ZanzibarError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A relationship fact: `object_type:object_id#object_relation@subject_type:subject_id[#subject_relation]`.
///
/// An empty `subject_relation` means the subject is a concrete principal. A non-empty one
/// makes the subject a userset, e.g. "members of group g".
///
/// The derived ordering sorts by object first, which lets ordered storage scan all tuples
/// of one `(object_type, object_id, object_relation)` as a contiguous range.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub object_type: String,
    pub object_id: String,
    pub object_relation: String,
    pub subject_type: String,
    pub subject_id: String,
    #[serde(default)]
    pub subject_relation: String,
}

impl Tuple {
    /// A tuple whose subject is a concrete principal.
    pub fn new(
        object_type: &str,
        object_id: &str,
        object_relation: &str,
        subject_type: &str,
        subject_id: &str,
    ) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            object_relation: object_relation.to_string(),
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            subject_relation: String::new(),
        }
    }

    /// A tuple whose subject is the userset `subject_type:subject_id#subject_relation`.
    pub fn userset(
        object_type: &str,
        object_id: &str,
        object_relation: &str,
        subject_type: &str,
        subject_id: &str,
        subject_relation: &str,
    ) -> Self {
        Self {
            subject_relation: subject_relation.to_string(),
            ..Self::new(object_type, object_id, object_relation, subject_type, subject_id)
        }
    }

    pub fn is_userset(&self) -> bool {
        !self.subject_relation.is_empty()
    }

    /// Same subject, different object and relation. Used when the resolver moves one
    /// level up the graph while keeping the caller's subject.
    pub fn with_object(&self, object_type: &str, object_id: &str, object_relation: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            object_relation: object_relation.to_string(),
            subject_type: self.subject_type.clone(),
            subject_id: self.subject_id.clone(),
            subject_relation: self.subject_relation.clone(),
        }
    }

    /// The smallest tuple of the `(object_type, object_id, object_relation)` range.
    pub(crate) fn range_start(object_type: &str, object_id: &str, object_relation: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            object_relation: object_relation.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn has_object(&self, object_type: &str, object_id: &str, object_relation: &str) -> bool {
        self.object_type == object_type
            && self.object_id == object_id
            && self.object_relation == object_relation
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}:{}",
            self.object_type, self.object_id, self.object_relation, self.subject_type, self.subject_id
        )?;
        if self.is_userset() {
            write!(f, "#{}", self.subject_relation)?;
        }
        Ok(())
    }
}

impl FromStr for Tuple {
    type Err = ZanzibarError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ZanzibarError::InvalidTuple(format!("{reason}: {s:?}"));

        let (object, subject) = s.split_once('@').ok_or_else(|| invalid("missing '@'"))?;
        let (object, object_relation) = object
            .split_once('#')
            .ok_or_else(|| invalid("missing '#' before the object relation"))?;
        let (object_type, object_id) = object
            .split_once(':')
            .ok_or_else(|| invalid("missing ':' in the object"))?;
        let (subject_type, subject) = subject
            .split_once(':')
            .ok_or_else(|| invalid("missing ':' in the subject"))?;
        let (subject_id, subject_relation) = match subject.split_once('#') {
            Some((id, relation)) => {
                if relation.is_empty() {
                    return Err(invalid("empty subject relation"));
                }
                (id, relation)
            }
            None => (subject, ""),
        };

        for (name, value) in [
            ("object type", object_type),
            ("object id", object_id),
            ("object relation", object_relation),
            ("subject type", subject_type),
            ("subject id", subject_id),
        ] {
            if value.is_empty() {
                return Err(invalid(&format!("empty {name}")));
            }
        }
        // Types and relations are identifiers; ids may carry ':' but never a separator
        // that would make the notation ambiguous.
        for value in [object_type, object_relation, subject_type, subject_relation] {
            if value.contains([':', '#', '@']) {
                return Err(invalid("unexpected separator"));
            }
        }
        if subject_id.contains('@') {
            return Err(invalid("unexpected separator"));
        }

        Ok(Self::userset(
            object_type,
            object_id,
            object_relation,
            subject_type,
            subject_id,
            subject_relation,
        ))
    }
}

/// Field-wise filter for listing tuples. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleFilter {
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub object_relation: Option<String>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub subject_relation: Option<String>,
}

impl TupleFilter {
    pub fn matches(&self, tuple: &Tuple) -> bool {
        fn field(filter: Option<&String>, value: &str) -> bool {
            filter.map_or(true, |f| f == value)
        }

        field(self.object_type.as_ref(), &tuple.object_type)
            && field(self.object_id.as_ref(), &tuple.object_id)
            && field(self.object_relation.as_ref(), &tuple.object_relation)
            && field(self.subject_type.as_ref(), &tuple.subject_type)
            && field(self.subject_id.as_ref(), &tuple.subject_id)
            && field(self.subject_relation.as_ref(), &tuple.subject_relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_concrete_subject() {
        let input = "doc:mydoc#viewer@user:myuser";
        let tuple: Tuple = input.parse().unwrap();
        assert_eq!(tuple, Tuple::new("doc", "mydoc", "viewer", "user", "myuser"));
        assert!(!tuple.is_userset());
        assert_eq!(tuple.to_string(), input);
    }

    #[test]
    fn test_parse_userset_subject() {
        let input = "doc:mydoc#editor@group:mygroup#member";
        let tuple: Tuple = input.parse().unwrap();
        assert_eq!(
            tuple,
            Tuple::userset("doc", "mydoc", "editor", "group", "mygroup", "member")
        );
        assert!(tuple.is_userset());
        assert_eq!(tuple.to_string(), input);
    }

    #[test]
    fn test_object_id_may_contain_colon() {
        let tuple: Tuple = "doc:2024:q1#viewer@user:alice".parse().unwrap();
        assert_eq!(tuple.object_id, "2024:q1");
        assert_eq!(tuple.to_string(), "doc:2024:q1#viewer@user:alice");
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        let malformed = [
            "",
            "doc:mydoc#viewer",
            "doc:mydoc@user:myuser",
            "docmydoc#viewer@user:myuser",
            "doc:mydoc#viewer@usermyuser",
            ":mydoc#viewer@user:myuser",
            "doc:#viewer@user:myuser",
            "doc:mydoc#@user:myuser",
            "doc:mydoc#viewer@:myuser",
            "doc:mydoc#viewer@user:",
            "doc:mydoc#viewer@user:myuser#",
            "doc:mydoc#viewer@user:my@user",
            "doc:mydoc#view:er@user:myuser",
        ];
        for input in malformed {
            let result = input.parse::<Tuple>();
            assert!(
                matches!(result, Err(ZanzibarError::InvalidTuple(_))),
                "expected {input:?} to be rejected, got {result:?}"
            );
        }
    }

    #[test]
    fn test_with_object_keeps_subject() {
        let tuple = Tuple::userset("doc", "d", "viewer", "group", "g", "member");
        let moved = tuple.with_object("folder", "f", "editor");
        assert_eq!(
            moved,
            Tuple::userset("folder", "f", "editor", "group", "g", "member")
        );
    }

    #[test]
    fn test_filter_matches() {
        let tuple = Tuple::new("doc", "d", "viewer", "user", "u");
        assert!(TupleFilter::default().matches(&tuple));

        let filter = TupleFilter {
            object_type: Some("doc".to_string()),
            subject_id: Some("u".to_string()),
            ..TupleFilter::default()
        };
        assert!(filter.matches(&tuple));

        let filter = TupleFilter {
            subject_relation: Some("member".to_string()),
            ..TupleFilter::default()
        };
        assert!(!filter.matches(&tuple));
    }
}
