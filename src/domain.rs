use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::JoinError;

pub const SHARD_SUFFIX: &str = ".jsonl.gz";

/// Content hash (or SciREX id) to shard location.
pub type LocationMap = BTreeMap<String, ShardLocation>;

/// SciREX id to resolved metadata.
pub type MetadataMap = BTreeMap<String, MetadataRecord>;

/// Where a document's full text lives in the bulk corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLocation {
    pub shard_id: u32,
    /// Corpus-assigned paper id; empty when unknown.
    pub doc_id: String,
    pub doc_hash: String,
}

impl ShardLocation {
    pub fn new(shard_id: u32, doc_id: impl Into<String>, doc_hash: impl Into<String>) -> Self {
        Self {
            shard_id,
            doc_id: doc_id.into(),
            doc_hash: doc_hash.into(),
        }
    }
}

/// Best-effort metadata for one SciREX document. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub doc_id: Option<String>,
    pub doc_hash: Option<String>,
    pub title: Option<String>,
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub url: Option<String>,
}

impl MetadataRecord {
    pub fn doc_id_only(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: Some(doc_id.into()),
            ..Self::default()
        }
    }

    /// Comparable identifier for `rule`, skipping empty strings.
    pub fn field(&self, rule: MatchRule) -> Option<&str> {
        let value = match rule {
            MatchRule::ContentHash => self.doc_hash.as_deref(),
            MatchRule::PaperId => self.doc_id.as_deref(),
            MatchRule::Doi => self.doi.as_deref(),
            MatchRule::ArxivId => self.arxiv_id.as_deref(),
            MatchRule::Title => self.title.as_deref(),
        };
        value.filter(|value| !value.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        MatchRule::IDENTIFIER_RULES
            .iter()
            .all(|rule| self.field(*rule).is_none())
    }
}

/// One line of an S2ORC shard. Only the identifier fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct S2orcRecord {
    #[serde(default, deserialize_with = "string_or_number")]
    pub paper_id: Option<String>,
    #[serde(default, rename = "_pdf_hash")]
    pub pdf_hash: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub arxiv_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub s2_url: Option<String>,
}

impl S2orcRecord {
    pub fn field(&self, rule: MatchRule) -> Option<&str> {
        let value = match rule {
            MatchRule::ContentHash => self.pdf_hash.as_deref(),
            MatchRule::PaperId => self.paper_id.as_deref(),
            MatchRule::Doi => self.doi.as_deref(),
            MatchRule::ArxivId => self.arxiv_id.as_deref(),
            MatchRule::Title => self.title.as_deref(),
        };
        value.filter(|value| !value.is_empty())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Integer(u64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(value)) => Some(value),
        Some(Raw::Integer(value)) => Some(value.to_string()),
        None => None,
    })
}

/// Rules ordered strongest first; the derived `Ord` follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    ContentHash,
    PaperId,
    Doi,
    ArxivId,
    Title,
}

impl MatchRule {
    pub const IDENTIFIER_RULES: [MatchRule; 4] = [
        MatchRule::PaperId,
        MatchRule::Doi,
        MatchRule::ArxivId,
        MatchRule::Title,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRule::ContentHash => "content_hash",
            MatchRule::PaperId => "paper_id",
            MatchRule::Doi => "doi",
            MatchRule::ArxivId => "arxiv_id",
            MatchRule::Title => "title",
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardKind {
    PdfParses,
    Metadata,
}

impl ShardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardKind::PdfParses => "pdf_parses",
            ShardKind::Metadata => "metadata",
        }
    }

    pub fn path_prefix(&self, release: &str) -> String {
        format!("{release}/full/{kind}/{kind}_", kind = self.as_str())
    }

    pub fn canonical_path(&self, release: &str, index: u32) -> String {
        format!("{}{index}{SHARD_SUFFIX}", self.path_prefix(release))
    }
}

impl fmt::Display for ShardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses the numeric shard id out of a canonical shard path such as
/// `s2orc_downloads/20200705v1/full/pdf_parses/pdf_parses_17.jsonl.gz`.
pub fn shard_id_from_path(path: &str, kind: ShardKind, release: &str) -> Result<u32, JoinError> {
    let pattern = format!(
        "{}(\\d+){}$",
        regex::escape(&kind.path_prefix(release)),
        regex::escape(SHARD_SUFFIX)
    );
    let re = Regex::new(&pattern).map_err(|err| JoinError::InvalidShardPath(err.to_string()))?;
    re.captures(path)
        .and_then(|caps| caps.get(1))
        .and_then(|digits| digits.as_str().parse::<u32>().ok())
        .ok_or_else(|| JoinError::InvalidShardPath(path.to_string()))
}
