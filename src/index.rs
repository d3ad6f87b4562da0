use std::collections::HashMap;

use serde::Serialize;

use crate::domain::{MatchRule, MetadataMap, S2orcRecord};

/// An identifier value claimed by more than one SciREX document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexCollision {
    pub rule: MatchRule,
    pub value: String,
    pub replaced: String,
    pub kept: String,
}

/// Paper id, DOI, arXiv id and title maps onto SciREX ids.
#[derive(Debug, Default)]
pub struct IdentifierIndexes {
    by_paper_id: HashMap<String, String>,
    by_doi: HashMap<String, String>,
    by_arxiv_id: HashMap<String, String>,
    by_title: HashMap<String, String>,
    collisions: Vec<IndexCollision>,
}

impl IdentifierIndexes {
    /// Later SciREX ids (in key order) win a shared identifier; each
    /// displacement is logged and kept in `collisions`.
    pub fn build(metadatas: &MetadataMap) -> Self {
        let mut indexes = Self::default();
        for (scirex_id, record) in metadatas {
            for rule in MatchRule::IDENTIFIER_RULES {
                if let Some(value) = record.field(rule) {
                    indexes.insert(rule, value, scirex_id);
                }
            }
        }
        tracing::info!(
            paper_ids = indexes.by_paper_id.len(),
            dois = indexes.by_doi.len(),
            arxiv_ids = indexes.by_arxiv_id.len(),
            titles = indexes.by_title.len(),
            collisions = indexes.collisions.len(),
            "built identifier indexes"
        );
        indexes
    }

    fn map(&self, rule: MatchRule) -> Option<&HashMap<String, String>> {
        match rule {
            MatchRule::PaperId => Some(&self.by_paper_id),
            MatchRule::Doi => Some(&self.by_doi),
            MatchRule::ArxivId => Some(&self.by_arxiv_id),
            MatchRule::Title => Some(&self.by_title),
            MatchRule::ContentHash => None,
        }
    }

    fn insert(&mut self, rule: MatchRule, value: &str, scirex_id: &str) {
        let map = match rule {
            MatchRule::PaperId => &mut self.by_paper_id,
            MatchRule::Doi => &mut self.by_doi,
            MatchRule::ArxivId => &mut self.by_arxiv_id,
            MatchRule::Title => &mut self.by_title,
            MatchRule::ContentHash => return,
        };
        if let Some(previous) = map.insert(value.to_string(), scirex_id.to_string()) {
            if previous != scirex_id {
                tracing::warn!(
                    rule = %rule,
                    value,
                    replaced = %previous,
                    kept = scirex_id,
                    "identifier shared by several SciREX documents"
                );
                self.collisions.push(IndexCollision {
                    rule,
                    value: value.to_string(),
                    replaced: previous,
                    kept: scirex_id.to_string(),
                });
            }
        }
    }

    pub fn lookup(&self, rule: MatchRule, value: &str) -> Option<&str> {
        if value.is_empty() {
            return None;
        }
        self.map(rule)?.get(value).map(String::as_str)
    }

    /// SciREX ids the bulk record could belong to, strongest rule first.
    pub fn candidates(&self, record: &S2orcRecord) -> Vec<(MatchRule, &str)> {
        let mut found: Vec<(MatchRule, &str)> = Vec::new();
        for rule in MatchRule::IDENTIFIER_RULES {
            let Some(value) = record.field(rule) else {
                continue;
            };
            if let Some(scirex_id) = self.lookup(rule, value) {
                if !found.iter().any(|(_, seen)| *seen == scirex_id) {
                    found.push((rule, scirex_id));
                }
            }
        }
        found
    }

    pub fn collisions(&self) -> &[IndexCollision] {
        &self.collisions
    }
}
