use crate::domain::{MatchRule, MetadataRecord, S2orcRecord};

/// Decides whether `record` is the bulk-corpus copy of the SciREX document
/// described by `metadata`. Rules are tried strongest first: paper id, DOI,
/// arXiv id, then exact title. Empty or absent metadata never matches.
///
/// URLs are not compared: the bulk corpus links by corpus id while the lookup
/// service links by paper hash, so the two never agree.
pub fn match_record(
    record: &S2orcRecord,
    metadata: &MetadataRecord,
    scirex_id: &str,
) -> Option<MatchRule> {
    for rule in MatchRule::IDENTIFIER_RULES {
        let Some(expected) = metadata.field(rule) else {
            continue;
        };
        if record.field(rule) == Some(expected) {
            tracing::info!(
                scirex_id,
                rule_matched = %rule,
                values_compared = expected,
                "SciREX document matched"
            );
            return Some(rule);
        }
    }
    None
}
