use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of entity categories kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Activity,
    Rule,
    Node,
    Preference,
    Integration,
    Insight,
}

impl Collection {
    /// Every collection, in a stable order.
    pub const ALL: [Collection; 6] = [
        Collection::Activity,
        Collection::Rule,
        Collection::Node,
        Collection::Preference,
        Collection::Integration,
        Collection::Insight,
    ];

    /// Stable storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Collection::Activity => "activity",
            Collection::Rule => "rule",
            Collection::Node => "node",
            Collection::Preference => "preference",
            Collection::Integration => "integration",
            Collection::Insight => "insight",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::UnknownCollection(s.to_string()))
    }
}
