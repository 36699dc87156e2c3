//! Paper records and month bucket keys.
//!
//! A paper id such as `2507.12345` embeds its year-month (`25` / `07`), which
//! is how every paper is assigned to exactly one [`MonthKey`] bucket.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::LoadError;

/// A `YYYY-MM` month bucket key.
///
/// Ordering is chronological because the representation is zero-padded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey(String);

impl MonthKey {
    /// Parse a `YYYY-MM` key.
    pub fn parse(value: &str) -> Result<Self, LoadError> {
        let invalid = || LoadError::InvalidMonth {
            value: value.to_string(),
        };
        let (year, month) = value.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        if !year.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let m: u32 = month.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&m) {
            return Err(invalid());
        }
        Ok(Self(value.to_string()))
    }

    /// Derive the bucket from an arXiv-style id (`YYMM.NNNNN`, optionally versioned).
    pub fn from_paper_id(id: &str) -> Option<Self> {
        let (prefix, rest) = id.split_once('.')?;
        if prefix.len() != 4 || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if rest.is_empty() || !rest.bytes().next().is_some_and(|b| b.is_ascii_digit()) {
            return None;
        }
        Self::parse(&format!("20{}-{}", &prefix[..2], &prefix[2..])).ok()
    }

    /// Derive the bucket from a `YYYY-MM-DD` date.
    pub fn from_date(date: &str) -> Option<Self> {
        date.get(..7).and_then(|ym| Self::parse(ym).ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `YYMM` prefix carried by ids of papers in this month.
    pub fn id_prefix(&self) -> String {
        format!("{}{}", &self.0[2..4], &self.0[5..7])
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MonthKey {
    type Error = LoadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MonthKey> for String {
    fn from(key: MonthKey) -> Self {
        key.0
    }
}

impl std::str::FromStr for MonthKey {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// One paper with its AI-generated Chinese summary fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    /// Base arXiv id without version suffix.
    pub id: String,
    /// Versioned id as published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_id: Option<String>,
    #[serde(default)]
    pub title: String,
    /// Listing date, `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    /// Comma-joined author list.
    #[serde(default, deserialize_with = "string_or_list")]
    pub authors: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_published: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zh_title: Option<String>,
    /// Chinese translation of the abstract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tldr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motivation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
}

impl Paper {
    /// Minimal paper with only an id and title set.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            full_id: None,
            title: title.into(),
            date: None,
            url: None,
            pdf_url: None,
            authors: String::new(),
            abstract_text: String::new(),
            comment: None,
            categories: Vec::new(),
            updated: None,
            first_published: None,
            zh_title: None,
            translation: None,
            keywords: Vec::new(),
            tldr: None,
            ai_comments: None,
            motivation: None,
            method: None,
            results: None,
            conclusion: None,
        }
    }

    /// The month bucket encoded in the id prefix.
    pub fn month_key(&self) -> Option<MonthKey> {
        MonthKey::from_paper_id(&self.id)
    }

    /// Bucket from the id, falling back to the listing date.
    pub fn month_key_or_date(&self) -> Option<MonthKey> {
        self.month_key()
            .or_else(|| self.date.as_deref().and_then(MonthKey::from_date))
    }

    pub fn has_ai_summary(&self) -> bool {
        self.tldr.is_some() || self.translation.is_some()
    }
}

/// Split `2507.12345v3` into (`2507.12345`, 3). Unversioned ids are version 1.
pub fn split_versioned_id(id: &str) -> Option<(&str, u32)> {
    let bytes = id.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == 0 || i >= bytes.len() || bytes[i] != b'.' {
        return None;
    }
    let dot = i;
    i += 1;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == dot + 1 {
        return None;
    }
    let base = &id[..i];
    if i + 1 < bytes.len() && bytes[i] == b'v' {
        let digits = &id[i + 1..];
        let end = digits
            .bytes()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(digits.len());
        if end > 0 {
            if let Ok(version) = digits[..end].parse() {
                return Some((base, version));
            }
        }
    }
    Some((base, 1))
}

fn string_or_list<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Authors {
        Joined(String),
        List(Vec<String>),
        Missing(()),
    }

    Ok(match Authors::deserialize(deserializer)? {
        Authors::Joined(s) => s,
        Authors::List(list) => list.join(", "),
        Authors::Missing(()) => String::new(),
    })
}
