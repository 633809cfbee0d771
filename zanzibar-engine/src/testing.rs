//! Shared fixtures: the document-sharing model and its example tuples.
//!
//! Used by unit tests, integration tests and the CLI demo data.

use crate::{
    error::Result,
    model::Model,
    rule::{ObjectMap, RelationMap, Rule},
    storage::Storage,
    tuple::Tuple,
};

/// Users, groups with members, folders with an owner/editor/viewer chain, and documents
/// that inherit each role from their parent folder.
pub fn document_objects() -> ObjectMap {
    ObjectMap::from([
        ("user".to_string(), RelationMap::new()),
        (
            "group".to_string(),
            RelationMap::from([("member".to_string(), Rule::default())]),
        ),
        (
            "folder".to_string(),
            RelationMap::from([
                ("owner".to_string(), Rule::default()),
                ("editor".to_string(), Rule::inherit_if("owner")),
                ("viewer".to_string(), Rule::inherit_if("editor")),
            ]),
        ),
        (
            "doc".to_string(),
            RelationMap::from([
                ("parent".to_string(), Rule::default()),
                ("owner".to_string(), Rule::inherit_via("owner", "folder", "parent")),
                (
                    "editor".to_string(),
                    Rule::any_of([
                        Rule::inherit_if("owner"),
                        Rule::inherit_via("editor", "folder", "parent"),
                    ]),
                ),
                (
                    "viewer".to_string(),
                    Rule::any_of([
                        Rule::inherit_if("editor"),
                        Rule::inherit_via("viewer", "folder", "parent"),
                    ]),
                ),
            ]),
        ),
    ])
}

pub fn document_model() -> Result<Model> {
    Model::new(document_objects())
}

/// `myuser` is a member of `mygroup`, which may view `myfolder`, the parent of `mydoc`.
/// `myowner` owns `mydoc` directly.
pub fn fixture_tuples() -> Vec<Tuple> {
    vec![
        Tuple::new("group", "mygroup", "member", "user", "myuser"),
        Tuple::new("doc", "mydoc", "parent", "folder", "myfolder"),
        Tuple::userset("folder", "myfolder", "viewer", "group", "mygroup", "member"),
        Tuple::new("doc", "mydoc", "owner", "user", "myowner"),
    ]
}

pub async fn load_fixtures<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    for tuple in fixture_tuples() {
        storage.write(&tuple).await?;
    }
    Ok(())
}
