//! CMS content documents. Documents are grouped in collections (`faq`, `footer`,
//! `bmi-content`, ...) and at most one document per collection is active at a time.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const MAX_COLLECTION_LEN: usize = 64;

/// A validated collection slug: 1 to 64 characters of `[a-z0-9-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Collection(String);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid collection name")]
pub struct InvalidCollection(pub String);

impl Collection {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Collection {
    type Err = InvalidCollection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= MAX_COLLECTION_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');

        if valid {
            Ok(Collection(s.to_owned()))
        } else {
            Err(InvalidCollection(s.to_owned()))
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDocument {
    pub id: Uuid,
    pub collection: String,
    pub body: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The body of a request creating a content document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContent {
    pub body: Value,
    #[serde(default)]
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_slugs() {
        assert!("faq".parse::<Collection>().is_ok());
        assert!("bmi-content".parse::<Collection>().is_ok());
        assert!("hero2".parse::<Collection>().is_ok());

        assert!("".parse::<Collection>().is_err());
        assert!("FAQ".parse::<Collection>().is_err());
        assert!("faq/../x".parse::<Collection>().is_err());
        assert!("a".repeat(MAX_COLLECTION_LEN + 1).parse::<Collection>().is_err());
    }

    #[test]
    fn test_new_content_defaults_to_inactive() {
        let content: NewContent =
            serde_json::from_value(serde_json::json!({"body": {"q": "?"}})).unwrap();

        assert!(!content.is_active);
    }
}
