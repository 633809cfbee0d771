//! SQL generation for the relational backends.
//!
//! A relation's instruction list becomes one `UNION ALL` select with a branch per
//! instruction. Object types, relations and subject types come from the validated model
//! and are inlined as literals; the values of a check are bound as four parameters.
//!
//! PostgreSQL can also run a relation's whole check server-side: [`function_for`] compiles
//! the select into a plpgsql function that recurses into the functions of other relations.

use crate::compile::InferredRule;

/// Parameters bound for every check, in binding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    ObjectId,
    SubjectType,
    SubjectId,
    SubjectRelation,
}

impl Param {
    fn offset(self) -> usize {
        match self {
            Param::ObjectId => 0,
            Param::SubjectType => 1,
            Param::SubjectId => 2,
            Param::SubjectRelation => 3,
        }
    }
}

pub const PARAMS_PER_CHECK: usize = 4;

/// SQLSTATE raised by a stored check function that runs out of depth.
pub const MAX_DEPTH_SQLSTATE: &str = "ZB001";

const FUNCTION_PREFIX: &str = "zanzibar_";

const COLUMNS: &str =
    "object_type, object_id, object_relation, subject_type, subject_id, subject_relation";

/// Placeholder syntax and statement limits of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    fn placeholder(self, number: usize) -> String {
        match self {
            Dialect::Postgres => format!("${number}"),
            Dialect::Sqlite => format!("?{number}"),
        }
    }

    /// SQLite rejects parenthesised members of a compound select.
    fn brackets(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Checks that fit in one statement. PostgreSQL caps bind parameters at 65535;
    /// SQLite caps a compound select at 500 terms.
    pub fn max_checks_per_statement(self) -> usize {
        match self {
            Dialect::Postgres => 65535 / PARAMS_PER_CHECK,
            Dialect::Sqlite => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryPart {
    Sql(String),
    Param(Param),
}

/// A relation's check query with unnumbered placeholders, numbered when a batch is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedQuery {
    dialect: Dialect,
    parts: Vec<QueryPart>,
}

impl PreparedQuery {
    pub fn for_ruleset(ruleset: &[InferredRule], dialect: Dialect) -> Self {
        let (open, close) = if dialect.brackets() { ("(", ")") } else { ("", "") };
        let mut query = Self {
            dialect,
            parts: Vec::new(),
        };
        for (index, rule) in ruleset.iter().enumerate() {
            if index > 0 {
                query.push_sql(" UNION ALL ");
            }
            query.push_sql(&format!(
                "{open}SELECT {} AS rule_kind, {index} AS rule_index, {COLUMNS} FROM tuples WHERE object_type = {} AND object_id = ",
                rule.kind().rank(),
                quote_literal(rule.object()),
            ));
            query.push_param(Param::ObjectId);
            query.push_sql(&format!(" AND object_relation IN ({})", literal_list(rule.relations())));

            match rule {
                InferredRule::Direct { .. } => {
                    query.push_sql(" AND subject_type = ");
                    query.push_param(Param::SubjectType);
                    query.push_sql(" AND subject_id = ");
                    query.push_param(Param::SubjectId);
                    query.push_sql(" AND subject_relation = ");
                    query.push_param(Param::SubjectRelation);
                }
                InferredRule::DirectUserset { .. } => {
                    query.push_sql(" AND subject_relation <> ''");
                }
                InferredRule::Indirect { subject, .. } => {
                    query.push_sql(&format!(" AND subject_type = {}", quote_literal(subject)));
                }
            }
            query.push_sql(close);
        }
        query
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// SQL text with placeholders numbered from `first_param`.
    pub fn render(&self, first_param: usize) -> String {
        let mut sql = String::new();
        for part in &self.parts {
            match part {
                QueryPart::Sql(text) => sql.push_str(text),
                QueryPart::Param(param) => {
                    sql.push_str(&self.dialect.placeholder(first_param + param.offset()));
                }
            }
        }
        sql
    }

    fn push_sql(&mut self, text: &str) {
        if let Some(QueryPart::Sql(last)) = self.parts.last_mut() {
            last.push_str(text);
        } else {
            self.parts.push(QueryPart::Sql(text.to_string()));
        }
    }

    fn push_param(&mut self, param: Param) {
        self.parts.push(QueryPart::Param(param));
    }
}

/// Unions the queries of one resolver level into a single statement, ordered by
/// instruction kind first so direct matches of every check come before anything else.
/// Parameters are numbered [`PARAMS_PER_CHECK`] per check, in check order.
pub fn batch_query<'q>(queries: impl IntoIterator<Item = &'q PreparedQuery>) -> String {
    let selects: Vec<String> = queries
        .into_iter()
        .enumerate()
        .map(|(check_index, query)| {
            format!(
                "SELECT {check_index} AS check_index, rule_kind, rule_index, {COLUMNS} FROM ({}) AS c{check_index}",
                query.render(check_index * PARAMS_PER_CHECK + 1)
            )
        })
        .collect();
    format!(
        "{} ORDER BY rule_kind, check_index, rule_index",
        selects.join(" UNION ALL ")
    )
}

/// A relation's check compiled into a plpgsql function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFunction {
    /// `CREATE OR REPLACE FUNCTION` statement.
    pub declaration: String,
    /// Calls the function with `object_id`, `subject_type`, `subject_id`,
    /// `subject_relation` and the remaining depth, in that order.
    pub call: String,
}

/// Compiles `object_type#relation` into a function that answers the check on its own.
///
/// A userset match calls the function of the userset's relation, an indirect match the
/// functions of the inherited relations on the linked object, each with one less level of
/// depth. A call with negative depth raises [`MAX_DEPTH_SQLSTATE`].
pub fn function_for(object_type: &str, relation: &str, ruleset: &[InferredRule]) -> StoredFunction {
    let name = quote_identifier(&function_name(object_type, relation));
    let select = PreparedQuery::for_ruleset(ruleset, Dialect::Postgres).render(1);

    let mut branches = String::new();
    for (index, rule) in ruleset.iter().enumerate() {
        let keyword = if index == 0 { "IF" } else { "ELSIF" };
        branches.push_str(&format!(" {keyword} mt.rule_index = {index} THEN"));
        match rule {
            InferredRule::Direct { .. } => branches.push_str(" RETURN TRUE;"),
            InferredRule::DirectUserset { .. } => branches.push_str(&format!(
                " EXECUTE format('SELECT %I($1, $2, $3, $4, $5)', '{FUNCTION_PREFIX}' || mt.subject_type || '#' || mt.subject_relation) \
                 USING mt.subject_id, $2, $3, $4, $5 - 1 INTO result; IF result THEN RETURN TRUE; END IF;"
            )),
            InferredRule::Indirect {
                subject,
                with_relation_to_subject,
                ..
            } => {
                for inherited in with_relation_to_subject {
                    branches.push_str(&format!(
                        " SELECT {}(mt.subject_id, $2, $3, $4, $5 - 1) INTO result; IF result THEN RETURN TRUE; END IF;",
                        quote_identifier(&function_name(subject, inherited))
                    ));
                }
            }
        }
    }
    if !ruleset.is_empty() {
        branches.push_str(" END IF;");
    }

    let declaration = format!(
        "CREATE OR REPLACE FUNCTION {name}(TEXT, TEXT, TEXT, TEXT, INTEGER) RETURNS BOOLEAN LANGUAGE plpgsql AS $$ \
         DECLARE mt RECORD; result BOOLEAN; \
         BEGIN \
         IF $5 < 0 THEN RAISE EXCEPTION 'maximum traversal depth exceeded' USING ERRCODE = '{MAX_DEPTH_SQLSTATE}'; END IF; \
         FOR mt IN {select} ORDER BY rule_kind, rule_index LOOP{branches} END LOOP; \
         RETURN FALSE; \
         END; $$"
    );
    StoredFunction {
        declaration,
        call: format!("SELECT {name}($1, $2, $3, $4, $5)"),
    }
}

/// Unquoted name of a relation's check function. `#` cannot occur in model identifiers,
/// so names are unique up to PostgreSQL's 63-byte identifier limit.
pub fn function_name(object_type: &str, relation: &str) -> String {
    format!("{FUNCTION_PREFIX}{object_type}#{relation}")
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn literal_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| quote_literal(v))
        .collect::<Vec<_>>()
        .join(", ")
}
