//! Refill and follow-up questionnaires. A patient may submit the same questionnaire many
//! times; every submission after the first gets a numbered `authid` so each one can still be
//! looked up on its own.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// How many sequence numbers an insert tries before giving up on a contended authid family.
pub const MAX_SEQUENCE_ATTEMPTS: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmissionKind {
    Refill,
    FollowUp,
}

impl SubmissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionKind::Refill => "refill",
            SubmissionKind::FollowUp => "follow-up",
        }
    }
}

impl fmt::Display for SubmissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid SubmissionKind")]
pub struct ParseSubmissionKindError(pub String);

impl FromStr for SubmissionKind {
    type Err = ParseSubmissionKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refill" | "refills" => Ok(SubmissionKind::Refill),
            "follow-up" | "follow-ups" => Ok(SubmissionKind::FollowUp),
            invalid => Err(ParseSubmissionKindError(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub kind: SubmissionKind,
    pub authid: String,
    pub base_authid: String,
    pub answers: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// A submission before its authid has been sequenced.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmission {
    pub kind: SubmissionKind,
    pub authid: String,
    pub answers: Map<String, Value>,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("authid is required")]
pub struct MissingAuthid;

impl NewSubmission {
    pub fn new(
        kind: SubmissionKind,
        authid: &str,
        answers: Map<String, Value>,
    ) -> Result<Self, MissingAuthid> {
        let authid = authid.trim();
        if base_authid(authid).is_empty() {
            return Err(MissingAuthid);
        }

        Ok(Self {
            kind,
            authid: authid.to_owned(),
            answers,
        })
    }

    pub fn base_authid(&self) -> &str {
        base_authid(&self.authid)
    }
}

/// The part of an authid before its first hyphen.
pub fn base_authid(authid: &str) -> &str {
    authid.split('-').next().unwrap_or(authid)
}

/// Pattern matching a base authid and any of its numbered suffixes: `^base(-\d+)?$`.
pub fn family_pattern(base: &str) -> String {
    format!(r"^{}(-\d+)?$", regex::escape(base))
}

pub fn family_regex(base: &str) -> Result<Regex, regex::Error> {
    Regex::new(&family_pattern(base))
}

/// The authid to store given how many members of its family already exist.
/// The first submission keeps the authid it was sent with.
pub fn sequenced_authid(authid: &str, base: &str, existing: u64) -> String {
    if existing == 0 {
        authid.to_owned()
    } else {
        format!("{base}-{existing}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_authid_stops_at_first_hyphen() {
        assert_eq!(base_authid("P100"), "P100");
        assert_eq!(base_authid("P100-2"), "P100");
        assert_eq!(base_authid("P100-2-7"), "P100");
        assert_eq!(base_authid("-2"), "");
    }

    #[test]
    fn test_family_regex_matches_base_and_numbered_suffixes() {
        let family = family_regex("P100").unwrap();

        assert!(family.is_match("P100"));
        assert!(family.is_match("P100-1"));
        assert!(family.is_match("P100-12"));
        assert!(!family.is_match("P1000"));
        assert!(!family.is_match("P100-abc"));
        assert!(!family.is_match("XP100"));
    }

    #[test]
    fn test_family_regex_escapes_the_base() {
        let family = family_regex("a.b").unwrap();

        assert!(family.is_match("a.b-1"));
        assert!(!family.is_match("axb"));
    }

    #[test]
    fn test_sequenced_authid() {
        assert_eq!(sequenced_authid("P100", "P100", 0), "P100");
        assert_eq!(sequenced_authid("P100", "P100", 1), "P100-1");
        assert_eq!(sequenced_authid("P100-7", "P100", 2), "P100-2");
    }

    #[test]
    fn test_new_submission_requires_authid() {
        assert_eq!(
            NewSubmission::new(SubmissionKind::Refill, "  ", Map::new()),
            Err(MissingAuthid)
        );
        assert_eq!(
            NewSubmission::new(SubmissionKind::Refill, "-3", Map::new()),
            Err(MissingAuthid)
        );

        let submission = NewSubmission::new(SubmissionKind::FollowUp, " P7-1 ", Map::new()).unwrap();
        assert_eq!(submission.authid, "P7-1");
        assert_eq!(submission.base_authid(), "P7");
    }

    #[test]
    fn test_kind_accepts_plural_paths() {
        assert_eq!("refills".parse::<SubmissionKind>(), Ok(SubmissionKind::Refill));
        assert_eq!("follow-up".parse::<SubmissionKind>(), Ok(SubmissionKind::FollowUp));
        assert!("intake".parse::<SubmissionKind>().is_err());
    }
}
