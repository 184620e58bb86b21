use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between an object type and its id (`document:roadmap`).
pub const OBJECT_TYPE_SEPARATOR: char = ':';

/// Separator between a userset object and its relation (`group:eng#member`).
pub const USERSET_SEPARATOR: char = '#';

/// Wildcard id used for type-bound public access (`user:*`).
pub const WILDCARD: &str = "*";

/// Optional condition guarding a relationship tuple.
///
/// The condition is data attached to the tuple, never part of its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipCondition {
    pub name: String,
    /// Evaluation bindings, stored serialized by the physical engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl RelationshipCondition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// A relationship fact: `user` has `relation` on `object`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleKey {
    /// `type:id`
    pub object: String,
    pub relation: String,
    /// `type:id`, `type:id#relation` or `type:*`
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RelationshipCondition>,
}

impl TupleKey {
    pub fn new(object: &str, relation: &str, user: &str) -> Self {
        Self {
            object: object.to_string(),
            relation: relation.to_string(),
            user: user.to_string(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: RelationshipCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// The identity triple; condition fields are excluded.
    pub fn identity(&self) -> TupleIdentity {
        TupleIdentity {
            object: self.object.clone(),
            relation: self.relation.clone(),
            user: self.user.clone(),
        }
    }

    /// Splits the object into `(type, id)`. An object without a separator is
    /// treated as a bare type.
    pub fn object_parts(&self) -> (&str, &str) {
        split_object(&self.object)
    }

    pub fn user_type(&self) -> UserType {
        UserType::of(&self.user)
    }
}

impl fmt::Display for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.object, self.relation, self.user)
    }
}

/// Identity of a tuple: the `(object, relation, user)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleIdentity {
    pub object: String,
    pub relation: String,
    pub user: String,
}

impl fmt::Display for TupleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.object, self.relation, self.user)
    }
}

/// A stored tuple together with the time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub key: TupleKey,
    pub timestamp: DateTime<Utc>,
}

impl Tuple {
    pub fn new(key: TupleKey, timestamp: DateTime<Utc>) -> Self {
        Self { key, timestamp }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// Kind of user referenced by a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    /// A concrete subject such as `user:anne`
    User,
    /// A userset (`group:eng#member`) or a wildcard (`user:*`, `*`)
    Userset,
}

impl UserType {
    pub fn of(user: &str) -> Self {
        if user == WILDCARD
            || user.contains(USERSET_SEPARATOR)
            || user.ends_with(&format!("{OBJECT_TYPE_SEPARATOR}{WILDCARD}"))
        {
            UserType::Userset
        } else {
            UserType::User
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserType::User => "user",
            UserType::Userset => "userset",
        }
    }
}

/// Partial tuple used to select tuples for a read. `None` fields act as
/// wildcards; an object of the form `type:` matches every object of that type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleFilter {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl TupleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(mut self, object: &str) -> Self {
        self.object = Some(object.to_string());
        self
    }

    pub fn relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    /// `(type, id)` of the object filter; the id is empty for a type-only filter.
    pub fn object_parts(&self) -> Option<(&str, &str)> {
        self.object.as_deref().map(split_object)
    }

    /// Whether `key` is selected by this filter.
    pub fn matches(&self, key: &TupleKey) -> bool {
        if let Some((object_type, object_id)) = self.object_parts() {
            let (key_type, key_id) = key.object_parts();
            if key_type != object_type {
                return false;
            }
            if !object_id.is_empty() && key_id != object_id {
                return false;
            }
        }

        if let Some(ref relation) = self.relation {
            if key.relation != *relation {
                return false;
            }
        }

        if let Some(ref user) = self.user {
            if key.user != *user {
                return false;
            }
        }

        true
    }
}

/// Selects userset and wildcard tuples on one object and relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsersetFilter {
    pub object: String,
    pub relation: String,
}

impl UsersetFilter {
    pub fn new(object: &str, relation: &str) -> Self {
        Self {
            object: object.to_string(),
            relation: relation.to_string(),
        }
    }

    pub fn matches(&self, key: &TupleKey) -> bool {
        key.object == self.object
            && key.relation == self.relation
            && key.user_type() == UserType::Userset
    }
}

/// Mutation recorded in the changelog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TupleOperation {
    Write,
    Delete,
}

impl TupleOperation {
    pub fn as_i32(self) -> i32 {
        match self {
            TupleOperation::Write => 0,
            TupleOperation::Delete => 1,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(TupleOperation::Write),
            1 => Some(TupleOperation::Delete),
            _ => None,
        }
    }
}

/// Append-only record of one tuple mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    /// Monotonic position within the store's changelog
    pub sequence: i64,
    pub key: TupleKey,
    pub operation: TupleOperation,
    pub timestamp: DateTime<Utc>,
}

/// Changelog read parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesQuery {
    /// Restrict to objects of this type
    pub object_type: Option<String>,
    /// Entries newer than `now - horizon_offset` are not returned
    pub horizon_offset: chrono::Duration,
    pub page_size: usize,
    /// Continuation: only entries with a greater sequence are returned
    pub after: Option<i64>,
}

impl Default for ChangesQuery {
    fn default() -> Self {
        Self {
            object_type: None,
            horizon_offset: chrono::Duration::zero(),
            page_size: 100,
            after: None,
        }
    }
}

/// One page of changelog entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesPage {
    pub entries: Vec<ChangelogEntry>,
    /// Pass back as `ChangesQuery::after` to continue; `None` when exhausted
    pub continuation: Option<i64>,
}

fn split_object(object: &str) -> (&str, &str) {
    match object.split_once(OBJECT_TYPE_SEPARATOR) {
        Some((object_type, object_id)) => (object_type, object_id),
        None => (object, ""),
    }
}
