use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::ResolvedConfig;
use crate::domain::{LocationMap, MatchRule, MetadataMap, S2orcRecord, ShardLocation};
use crate::download::ShardDownloader;
use crate::error::JoinError;
use crate::index::{IdentifierIndexes, IndexCollision};
use crate::lookup::MetadataLookup;
use crate::matcher::match_record;
use crate::resolver::{CancelFlag, METADATA_CACHE, MetadataResolver};
use crate::scanner::{HASH_LOCATIONS_CACHE, ScanOutcome, ShardFailure, ShardScanner, scan_hashes};
use crate::store::CacheStore;

pub const JOIN_CACHE: &str = "scirex_to_s2orc";

#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub refresh_locations: bool,
    pub refresh_metadata: bool,
    pub refresh_join: bool,
}

impl JoinOptions {
    /// The join is recomputed whenever one of its inputs is.
    pub fn rebuild_join(&self) -> bool {
        self.refresh_join || self.refresh_metadata || self.refresh_locations
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// One entry of the final mapping, with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedLocation {
    pub location: ShardLocation,
    pub rule: MatchRule,
}

pub type JoinMap = BTreeMap<String, JoinedLocation>;

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub joined: JoinMap,
    pub collisions: Vec<IndexCollision>,
    pub failed_shards: Vec<ShardFailure>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocateResult {
    pub scirex_documents: usize,
    pub located: usize,
    pub from_cache: bool,
    pub failed_shards: Vec<ShardFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinReport {
    pub scirex_documents: usize,
    pub located_by_hash: usize,
    pub metadata_records: usize,
    pub matched: usize,
    pub unmatched: Vec<String>,
    pub by_rule: BTreeMap<MatchRule, usize>,
    pub collisions: Vec<IndexCollision>,
    pub failed_shards: Vec<ShardFailure>,
    pub from_cache: bool,
    pub generated_at: String,
}

pub struct App<L: MetadataLookup, D: ShardDownloader, C: CacheStore> {
    config: ResolvedConfig,
    lookup: L,
    downloader: D,
    cache: C,
    cancel: CancelFlag,
}

impl<L: MetadataLookup, D: ShardDownloader, C: CacheStore> App<L, D, C> {
    pub fn new(config: ResolvedConfig, lookup: L, downloader: D, cache: C) -> Self {
        Self {
            config,
            lookup,
            downloader,
            cache,
            cancel: CancelFlag::default(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn scanner(&self) -> ShardScanner<'_, D> {
        ShardScanner::new(
            &self.downloader,
            self.config.download_root.clone(),
            self.config.release.clone(),
        )
    }

    /// Stage 1: PDF-hash scan of the pdf_parses shards.
    pub fn locate(
        &self,
        scirex_ids: &[String],
        options: &JoinOptions,
        sink: &dyn ProgressSink,
    ) -> Result<(LocationMap, LocateResult), JoinError> {
        if !options.refresh_locations {
            if let Some(cached) = self.cache.load::<LocationMap>(HASH_LOCATIONS_CACHE)? {
                sink.event(ProgressEvent {
                    message: format!("phase=Locate; {} locations from cache", cached.len()),
                    elapsed: None,
                });
                let result = LocateResult {
                    scirex_documents: scirex_ids.len(),
                    located: cached.len(),
                    from_cache: true,
                    failed_shards: Vec::new(),
                };
                return Ok((cached, result));
            }
        }

        sink.event(ProgressEvent {
            message: format!(
                "phase=Locate; scanning {} pdf_parses shards",
                self.config.pdf_parse_shards.len()
            ),
            elapsed: None,
        });
        let start = Instant::now();
        let targets: HashSet<String> = scirex_ids.iter().cloned().collect();
        let outcome = scan_hashes(&self.scanner(), &self.config.pdf_parse_shards, &targets)?;

        let mut locations = LocationMap::new();
        for location in outcome.hits {
            locations.insert(location.doc_hash.clone(), location);
        }
        self.persist_if_complete(HASH_LOCATIONS_CACHE, &locations, &outcome.failures)?;
        sink.event(ProgressEvent {
            message: format!("phase=Locate; {} documents located", locations.len()),
            elapsed: Some(start.elapsed()),
        });

        let result = LocateResult {
            scirex_documents: scirex_ids.len(),
            located: locations.len(),
            from_cache: false,
            failed_shards: outcome.failures,
        };
        Ok((locations, result))
    }

    /// Stage 2: metadata for every SciREX id, short-circuiting located ones.
    pub fn resolve_metadata(
        &self,
        scirex_ids: &[String],
        known: &LocationMap,
        options: &JoinOptions,
        sink: &dyn ProgressSink,
    ) -> Result<MetadataMap, JoinError> {
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} documents", scirex_ids.len()),
            elapsed: None,
        });
        let start = Instant::now();
        let resolver = MetadataResolver::new(&self.lookup, &self.cache, self.config.lookup.retry.clone())
            .with_cancel(self.cancel.clone());
        let metadatas = resolver.resolve(scirex_ids, known, options.refresh_metadata)?;
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} metadata records", metadatas.len()),
            elapsed: Some(start.elapsed()),
        });
        Ok(metadatas)
    }

    /// Stage 3: match metadata shards against the identifier indexes.
    /// Every hash-located SciREX id is carried into the result as-is.
    pub fn join(
        &self,
        scirex_ids: &[String],
        metadatas: &MetadataMap,
        known: &LocationMap,
        options: &JoinOptions,
        sink: &dyn ProgressSink,
    ) -> Result<JoinOutcome, JoinError> {
        let indexes = IdentifierIndexes::build(metadatas);
        let collisions = indexes.collisions().to_vec();

        if !options.rebuild_join() {
            if let Some(cached) = self.cache.load::<JoinMap>(JOIN_CACHE)? {
                sink.event(ProgressEvent {
                    message: format!("phase=Join; {} matches from cache", cached.len()),
                    elapsed: None,
                });
                return Ok(JoinOutcome {
                    joined: cached,
                    collisions,
                    failed_shards: Vec::new(),
                    from_cache: true,
                });
            }
        }

        let mut joined = JoinMap::new();
        for scirex_id in scirex_ids {
            if let Some(location) = known.get(scirex_id) {
                joined.insert(
                    scirex_id.clone(),
                    JoinedLocation {
                        location: location.clone(),
                        rule: MatchRule::ContentHash,
                    },
                );
            }
        }

        sink.event(ProgressEvent {
            message: format!(
                "phase=Join; scanning {} metadata shards",
                self.config.metadata_shards.len()
            ),
            elapsed: None,
        });
        let start = Instant::now();
        let outcome: ScanOutcome<(String, JoinedLocation)> =
            self.scanner()
                .scan(&self.config.metadata_shards, |shard_id, record| {
                    match_against_indexes(&indexes, metadatas, shard_id, record)
                })?;

        for (scirex_id, candidate) in outcome.hits {
            merge_match(&mut joined, scirex_id, candidate);
        }
        self.persist_if_complete(JOIN_CACHE, &joined, &outcome.failures)?;
        sink.event(ProgressEvent {
            message: format!("phase=Join; {} documents matched", joined.len()),
            elapsed: Some(start.elapsed()),
        });
        Ok(JoinOutcome {
            joined,
            collisions,
            failed_shards: outcome.failures,
            from_cache: false,
        })
    }

    pub fn run(
        &self,
        scirex_ids: &[String],
        options: &JoinOptions,
        sink: &dyn ProgressSink,
    ) -> Result<(JoinMap, JoinReport), JoinError> {
        let (locations, located) = self.locate(scirex_ids, options, sink)?;
        let metadata_cached = !options.refresh_metadata && self.cache.exists(METADATA_CACHE);
        let metadatas = self.resolve_metadata(scirex_ids, &locations, options, sink)?;
        let join_options = JoinOptions {
            refresh_join: options.refresh_join || !located.from_cache || !metadata_cached,
            ..options.clone()
        };
        let JoinOutcome {
            joined,
            collisions,
            failed_shards: join_failures,
            from_cache,
        } = self.join(scirex_ids, &metadatas, &locations, &join_options, sink)?;

        let mut by_rule = BTreeMap::new();
        for entry in joined.values() {
            *by_rule.entry(entry.rule).or_insert(0usize) += 1;
        }
        let unmatched = scirex_ids
            .iter()
            .filter(|id| !joined.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        let mut failed_shards = located.failed_shards;
        failed_shards.extend(join_failures);

        let report = JoinReport {
            scirex_documents: scirex_ids.len(),
            located_by_hash: located.located,
            metadata_records: metadatas.len(),
            matched: joined.len(),
            unmatched,
            by_rule,
            collisions,
            failed_shards,
            from_cache,
            generated_at: chrono::Utc::now().to_rfc3339(),
        };
        Ok((joined, report))
    }

    fn persist_if_complete<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        failures: &[ShardFailure],
    ) -> Result<(), JoinError> {
        if failures.is_empty() {
            return self.cache.save(name, value);
        }
        tracing::warn!(
            cache = name,
            failed = failures.len(),
            "not persisting results from an incomplete scan"
        );
        Ok(())
    }
}

fn match_against_indexes(
    indexes: &IdentifierIndexes,
    metadatas: &MetadataMap,
    shard_id: u32,
    record: &S2orcRecord,
) -> Option<(String, JoinedLocation)> {
    for (_, scirex_id) in indexes.candidates(record) {
        let Some(metadata) = metadatas.get(scirex_id) else {
            continue;
        };
        if let Some(rule) = match_record(record, metadata, scirex_id) {
            let location = ShardLocation::new(
                shard_id,
                record.paper_id.clone().unwrap_or_default(),
                record
                    .pdf_hash
                    .clone()
                    .unwrap_or_else(|| scirex_id.to_string()),
            );
            return Some((scirex_id.to_string(), JoinedLocation { location, rule }));
        }
    }
    None
}

/// A stronger rule displaces an earlier match; ties keep the first one seen.
fn merge_match(joined: &mut JoinMap, scirex_id: String, candidate: JoinedLocation) {
    match joined.get(&scirex_id) {
        Some(existing) if existing.rule <= candidate.rule => {
            tracing::debug!(
                scirex_id = %scirex_id,
                kept = %existing.rule,
                ignored = %candidate.rule,
                "duplicate match ignored"
            );
        }
        _ => {
            joined.insert(scirex_id, candidate);
        }
    }
}

/// Flattens the join result into SciREX id to location.
pub fn locations_only(joined: &JoinMap) -> LocationMap {
    joined
        .iter()
        .map(|(id, entry)| (id.clone(), entry.location.clone()))
        .collect()
}
