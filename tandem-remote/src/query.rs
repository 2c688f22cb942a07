use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_types::{AccountId, Collection, Payload};

/// Equality condition on a top-level payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub equals: Value,
}

/// Conjunction of field conditions; empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<FieldCondition>,
}

impl Filter {
    /// A filter that matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds an equality condition.
    pub fn eq(mut self, field: impl Into<String>, equals: impl Into<Value>) -> Self {
        self.conditions.push(FieldCondition {
            field: field.into(),
            equals: equals.into(),
        });
        self
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        self.conditions
            .iter()
            .all(|c| payload.get(&c.field) == Some(&c.equals))
    }
}

/// A push subscription target: one collection of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub account: AccountId,
    pub collection: Collection,
    #[serde(default)]
    pub filter: Filter,
}

impl Query {
    pub fn new(account: AccountId, collection: Collection) -> Self {
        Self {
            account,
            collection,
            filter: Filter::all(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }
}
