use crate::{
    compile::{self, non_empty, InferredRule, InferredRuleMap},
    error::{Result, ZanzibarError},
    rule::{ObjectMap, Rule, ANY_OF},
    tuple::Tuple,
};
use std::path::Path;
use tracing::{debug, info};

/// A compiled authorization model.
///
/// Built once from an [`ObjectMap`]; construction validates the rule tree and compiles
/// every relation, failing atomically on the first problem. Immutable afterwards, so it
/// can be shared between concurrent checks behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Model {
    objects: ObjectMap,
    inferred_rules: InferredRuleMap,
}

impl Model {
    pub fn new(objects: ObjectMap) -> Result<Self> {
        validate_objects(&objects)?;
        let inferred_rules = compile::compile(&objects)?;

        info!(
            object_types = objects.len(),
            relations = objects.values().map(|r| r.len()).sum::<usize>(),
            "Compiled authorization model"
        );
        Ok(Self {
            objects,
            inferred_rules,
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let objects: ObjectMap = serde_json::from_str(json)
            .map_err(|e| ZanzibarError::InvalidModel(format!("malformed JSON model: {e}")))?;
        Self::new(objects)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let objects: ObjectMap = serde_yaml::from_str(yaml)
            .map_err(|e| ZanzibarError::InvalidModel(format!("malformed YAML model: {e}")))?;
        Self::new(objects)
    }

    /// Loads a model file; `.yaml`/`.yml` files are read as YAML, anything else as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading model from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(&contents),
            _ => Self::from_json(&contents),
        }
    }

    /// The rule tree this model was compiled from.
    pub fn objects(&self) -> &ObjectMap {
        &self.objects
    }

    pub fn inferred_rules(&self) -> &InferredRuleMap {
        &self.inferred_rules
    }

    /// Compiled instructions for `object#relation`, or `None` if the model lacks it.
    pub fn ruleset_for(&self, object_type: &str, relation: &str) -> Option<&[InferredRule]> {
        self.inferred_rules
            .get(object_type)
            .and_then(|relations| relations.get(relation))
            .map(Vec::as_slice)
    }

    pub fn has_relation(&self, object_type: &str, relation: &str) -> bool {
        self.objects
            .get(object_type)
            .is_some_and(|relations| relations.contains_key(relation))
    }

    /// Whether the tuple only references object types and relations this model defines
    /// and its ids are representable in the tuple notation.
    pub fn is_valid(&self, tuple: &Tuple) -> bool {
        self.validate(tuple).is_ok()
    }

    /// Like [`Model::is_valid`], but says what is wrong.
    ///
    /// Ids must be non-empty and free of `#` and `@`, so the tuple's notation parses back
    /// to the same tuple.
    pub fn validate(&self, tuple: &Tuple) -> Result<()> {
        for (name, id) in [("object id", &tuple.object_id), ("subject id", &tuple.subject_id)] {
            if id.is_empty() || id.contains(['#', '@']) {
                return Err(ZanzibarError::InvalidTuple(format!("{tuple}: invalid {name} {id:?}")));
            }
        }
        if !self.has_relation(&tuple.object_type, &tuple.object_relation) {
            return Err(ZanzibarError::InvalidTuple(format!(
                "{tuple}: unknown relation {}#{}",
                tuple.object_type, tuple.object_relation
            )));
        }
        if !self.objects.contains_key(&tuple.subject_type) {
            return Err(ZanzibarError::InvalidTuple(format!(
                "{tuple}: unknown subject type {}",
                tuple.subject_type
            )));
        }
        if tuple.is_userset() && !self.has_relation(&tuple.subject_type, &tuple.subject_relation) {
            return Err(ZanzibarError::InvalidTuple(format!(
                "{tuple}: unknown subject relation {}#{}",
                tuple.subject_type, tuple.subject_relation
            )));
        }
        Ok(())
    }
}

/// Identifiers end up inside the tuple notation and in generated SQL, so they are kept
/// to a conservative alphabet.
fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_objects(objects: &ObjectMap) -> Result<()> {
    for (object, relations) in objects {
        if !is_identifier(object) {
            return Err(ZanzibarError::InvalidModel(format!(
                "invalid object type name {object:?}"
            )));
        }
        for (relation, rule) in relations {
            if !is_identifier(relation) || relation == ANY_OF {
                return Err(ZanzibarError::InvalidModel(format!(
                    "invalid relation name {object}#{relation:?}"
                )));
            }
            validate_rule(objects, object, relation, rule)?;
        }
    }
    Ok(())
}

fn validate_rule(objects: &ObjectMap, object: &str, relation: &str, rule: &Rule) -> Result<()> {
    let invalid = |reason: String| ZanzibarError::InvalidModel(format!("{object}#{relation}: {reason}"));
    let of_type = non_empty(rule.of_type.as_ref());
    let with_relation = non_empty(rule.with_relation.as_ref());

    if rule.is_any_of() {
        if of_type.is_some() || with_relation.is_some() {
            return Err(invalid("anyOf cannot set ofType or withRelation".to_string()));
        }
        if rule.rules.is_empty() {
            return Err(invalid("anyOf needs at least one rule".to_string()));
        }
        return rule
            .rules
            .iter()
            .try_for_each(|sub_rule| validate_rule(objects, object, relation, sub_rule));
    }

    if !rule.rules.is_empty() {
        return Err(invalid("only anyOf rules may have sub-rules".to_string()));
    }

    let inherit_if = non_empty(rule.inherit_if.as_ref());
    match (inherit_if, of_type, with_relation) {
        (_, Some(_), None) | (_, None, Some(_)) => Err(invalid(
            "ofType and withRelation must be set together".to_string(),
        )),
        (None, Some(_), Some(_)) => Err(invalid("ofType requires inheritIf".to_string())),
        (Some(inherit_if), Some(of_type), Some(with_relation)) => {
            let target = objects
                .get(of_type)
                .ok_or_else(|| invalid(format!("ofType references undefined object type {of_type}")))?;
            if !target.contains_key(inherit_if) {
                return Err(invalid(format!(
                    "inheritIf references undefined relation {of_type}#{inherit_if}"
                )));
            }
            if !objects
                .get(object)
                .is_some_and(|relations| relations.contains_key(with_relation))
            {
                return Err(invalid(format!(
                    "withRelation references undefined relation {object}#{with_relation}"
                )));
            }
            Ok(())
        }
        (Some(inherit_if), None, None) => {
            if objects
                .get(object)
                .is_some_and(|relations| relations.contains_key(inherit_if))
            {
                Ok(())
            } else {
                Err(invalid(format!(
                    "inheritIf references undefined relation {object}#{inherit_if}"
                )))
            }
        }
        (None, None, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::Kind;
    use crate::rule::RelationMap;
    use crate::testing;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    fn tuple(s: &str) -> Tuple {
        s.parse().unwrap()
    }

    #[test]
    fn test_is_valid() {
        let model = testing::document_model().unwrap();

        assert!(model.is_valid(&tuple("doc:mydoc#viewer@user:myuser")));
        assert!(model.is_valid(&tuple("doc:mydoc#viewer@group:mygroup#member")));
        assert!(!model.is_valid(&tuple("wrong:mydoc#viewer@group:mygroup#member")));
        assert!(!model.is_valid(&tuple("doc:mydoc#wrong@group:mygroup#member")));
        assert!(!model.is_valid(&tuple("doc:mydoc#viewer@wrong:mygroup#member")));
        assert!(!model.is_valid(&tuple("doc:mydoc#viewer@group:mygroup#wrong")));
    }

    #[test]
    fn test_ids_must_survive_the_notation() {
        let model = testing::document_model().unwrap();

        assert!(model.is_valid(&Tuple::new("doc", "2024:q1", "viewer", "user", "a:b")));
        for invalid in [
            Tuple::new("doc", "a#b", "viewer", "user", "u"),
            Tuple::new("doc", "a@b", "viewer", "user", "u"),
            Tuple::new("doc", "d", "viewer", "user", "u@x"),
            Tuple::new("doc", "d", "viewer", "user", "u#x"),
            Tuple::new("doc", "", "viewer", "user", "u"),
            Tuple::new("doc", "d", "viewer", "user", ""),
        ] {
            let err = model.validate(&invalid).unwrap_err();
            assert!(matches!(err, ZanzibarError::InvalidTuple(_)), "{invalid:?}");
        }
    }

    #[test]
    fn test_ruleset_for_doc_viewer() {
        let model = testing::document_model().unwrap();
        let ruleset = model.ruleset_for("doc", "viewer").unwrap();

        let expected = vec![
            InferredRule::Direct {
                object: "doc".to_string(),
                relations: strings(&["editor", "owner", "viewer"]),
            },
            InferredRule::DirectUserset {
                object: "doc".to_string(),
                relations: strings(&["editor", "owner", "viewer"]),
            },
            InferredRule::Indirect {
                object: "doc".to_string(),
                relations: strings(&["parent"]),
                subject: "folder".to_string(),
                with_relation_to_subject: strings(&["editor", "owner", "viewer"]),
            },
        ];
        assert_eq!(ruleset, expected.as_slice());
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let first = testing::document_model().unwrap();
        let second = testing::document_model().unwrap();
        assert_eq!(first.inferred_rules(), second.inferred_rules());
    }

    #[test]
    fn test_every_ruleset_is_ordered_by_kind() {
        let model = testing::document_model().unwrap();
        for relations in model.inferred_rules().values() {
            for ruleset in relations.values() {
                let kinds: Vec<Kind> = ruleset.iter().map(InferredRule::kind).collect();
                let mut sorted = kinds.clone();
                sorted.sort();
                assert_eq!(kinds, sorted);
                assert_eq!(kinds.first(), Some(&Kind::Direct));
            }
        }
    }

    #[test]
    fn test_unknown_relation_lookup() {
        let model = testing::document_model().unwrap();
        assert!(model.ruleset_for("doc", "nope").is_none());
        assert!(model.ruleset_for("nope", "viewer").is_none());
        assert!(model.ruleset_for("user", "viewer").is_none());
    }

    #[test]
    fn test_invalid_models_are_rejected() {
        let folder = || RelationMap::from([("viewer".to_string(), Rule::default())]);
        let cases: Vec<(&str, RelationMap)> = vec![
            (
                "dangling same-object inheritance",
                RelationMap::from([("viewer".to_string(), Rule::inherit_if("editor"))]),
            ),
            (
                "ofType without withRelation",
                RelationMap::from([(
                    "viewer".to_string(),
                    Rule {
                        inherit_if: Some("viewer".to_string()),
                        of_type: Some("folder".to_string()),
                        ..Rule::default()
                    },
                )]),
            ),
            (
                "unknown ofType",
                RelationMap::from([
                    ("parent".to_string(), Rule::default()),
                    ("viewer".to_string(), Rule::inherit_via("viewer", "nope", "parent")),
                ]),
            ),
            (
                "unknown relation on ofType",
                RelationMap::from([
                    ("parent".to_string(), Rule::default()),
                    ("viewer".to_string(), Rule::inherit_via("owner", "folder", "parent")),
                ]),
            ),
            (
                "unknown withRelation",
                RelationMap::from([("viewer".to_string(), Rule::inherit_via("viewer", "folder", "parent"))]),
            ),
            (
                "anyOf with ofType",
                RelationMap::from([
                    ("parent".to_string(), Rule::default()),
                    (
                        "viewer".to_string(),
                        Rule {
                            of_type: Some("folder".to_string()),
                            with_relation: Some("parent".to_string()),
                            ..Rule::any_of([Rule::default()])
                        },
                    ),
                ]),
            ),
            ("empty anyOf", RelationMap::from([("viewer".to_string(), Rule::any_of([]))])),
            (
                "sub-rules without anyOf",
                RelationMap::from([(
                    "viewer".to_string(),
                    Rule {
                        rules: vec![Rule::default()],
                        ..Rule::default()
                    },
                )]),
            ),
            ("reserved relation name", RelationMap::from([(ANY_OF.to_string(), Rule::default())])),
            ("separator in relation name", RelationMap::from([("view#er".to_string(), Rule::default())])),
        ];

        for (name, doc) in cases {
            let objects = ObjectMap::from([
                ("folder".to_string(), folder()),
                ("doc".to_string(), doc),
            ]);
            let result = Model::new(objects);
            assert!(
                matches!(result, Err(ZanzibarError::InvalidModel(_))),
                "{name}: expected InvalidModel, got {result:?}"
            );
        }
    }

    #[test]
    fn test_from_json_and_yaml_agree() {
        let json = r#"{
            "user": {},
            "folder": { "parent": {}, "viewer": { "inheritIf": "viewer", "ofType": "folder", "withRelation": "parent" } },
            "doc": { "parent": {}, "viewer": { "inheritIf": "anyOf", "rules": [ {}, { "inheritIf": "viewer", "ofType": "folder", "withRelation": "parent" } ] } }
        }"#;
        let yaml = r"
user: {}
folder:
  parent: {}
  viewer: { inheritIf: viewer, ofType: folder, withRelation: parent }
doc:
  parent: {}
  viewer:
    inheritIf: anyOf
    rules:
      - {}
      - { inheritIf: viewer, ofType: folder, withRelation: parent }
";
        let from_json = Model::from_json(json).unwrap();
        let from_yaml = Model::from_yaml(yaml).unwrap();
        assert_eq!(from_json.inferred_rules(), from_yaml.inferred_rules());
        assert_eq!(from_json.ruleset_for("doc", "viewer").map(<[_]>::len), Some(3));
    }

    #[test]
    fn test_go_style_empty_strings_are_unset() {
        let json = r#"{ "user": {}, "doc": { "owner": { "inheritIf": "" }, "viewer": { "inheritIf": "owner", "ofType": "", "withRelation": "" } } }"#;
        let model = Model::from_json(json).unwrap();
        let viewer = model.ruleset_for("doc", "viewer").unwrap();
        assert_eq!(viewer.len(), 2);
        assert_eq!(viewer[0].relations(), strings(&["owner", "viewer"]));
    }

    #[test]
    fn test_malformed_json_is_invalid_model() {
        let result = Model::from_json("{ not json");
        assert!(matches!(result, Err(ZanzibarError::InvalidModel(_))));
    }
}
