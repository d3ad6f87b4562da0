use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::RetryPolicy;
use crate::domain::{LocationMap, MetadataMap, MetadataRecord};
use crate::error::JoinError;
use crate::lookup::{LookupOutcome, MetadataLookup, PaperResponse};
use crate::store::CacheStore;

pub const METADATA_CACHE: &str = "s2_metadata";

/// SciREX ids whose own id resolves to the wrong paper, with the id to query instead.
pub const KNOWN_ID_REMAPS: [(&str, &str); 2] = [
    (
        "0c278ecf472f42ec1140ca2f1a0a3dd60cbe5c48",
        "9f67b3edc67a35c884bd532a5e73fa3a7f3660d8",
    ),
    (
        "1a6b67622d04df8e245575bf8fb2066fb6729720",
        "f0ccb215faaeb1e9e86af5827b76c27a8d04e5a7",
    ),
];

const PAUSE_SLICE: Duration = Duration::from_millis(250);

pub fn remote_query_id(scirex_id: &str) -> &str {
    KNOWN_ID_REMAPS
        .iter()
        .find(|(bad, _)| *bad == scirex_id)
        .map(|(_, good)| *good)
        .unwrap_or(scirex_id)
}

/// Shared flag checked between lookups and while waiting out a cooldown.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct MetadataResolver<'a, L: MetadataLookup, C: CacheStore> {
    lookup: &'a L,
    cache: &'a C,
    retry: RetryPolicy,
    cancel: CancelFlag,
}

impl<'a, L: MetadataLookup, C: CacheStore> MetadataResolver<'a, L, C> {
    pub fn new(lookup: &'a L, cache: &'a C, retry: RetryPolicy) -> Self {
        Self {
            lookup,
            cache,
            retry,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Produces a record for every id. A cached collection is returned as-is
    /// unless `refresh` is set; a fresh resolution always overwrites the cache.
    pub fn resolve(
        &self,
        scirex_ids: &[String],
        known: &LocationMap,
        refresh: bool,
    ) -> Result<MetadataMap, JoinError> {
        if !refresh {
            if let Some(cached) = self.cache.load::<MetadataMap>(METADATA_CACHE)? {
                tracing::info!(count = cached.len(), "loaded metadata from cache");
                return Ok(cached);
            }
        }

        let mut metadatas = MetadataMap::new();
        for (index, scirex_id) in scirex_ids.iter().enumerate() {
            if let Some(location) = known.get(scirex_id).filter(|loc| !loc.doc_id.is_empty()) {
                metadatas.insert(
                    scirex_id.clone(),
                    MetadataRecord::doc_id_only(location.doc_id.clone()),
                );
                continue;
            }

            let query_id = remote_query_id(scirex_id);
            if query_id != scirex_id {
                tracing::debug!(scirex_id = %scirex_id, query_id, "querying remapped id");
            }

            let response = self.fetch_with_retry(scirex_id, query_id)?;
            for field in response.missing_fields() {
                tracing::warn!(
                    scirex_id = %scirex_id,
                    document = index,
                    field,
                    "lookup response missing field"
                );
            }
            metadatas.insert(scirex_id.clone(), response.to_record());

            if (index + 1) % 10 == 0 {
                tracing::info!(count = index + 1, "document metadatas downloaded");
            }
            self.pause(self.retry.request_delay)?;
        }

        self.cache.save(METADATA_CACHE, &metadatas)?;
        Ok(metadatas)
    }

    fn fetch_with_retry(&self, scirex_id: &str, query_id: &str) -> Result<PaperResponse, JoinError> {
        let started = Instant::now();
        let mut retries = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(JoinError::Cancelled);
            }
            match self.lookup.fetch_paper(query_id)? {
                LookupOutcome::Found(response) => return Ok(response),
                LookupOutcome::RateLimited { retry_after } => {
                    if retries >= self.retry.max_retries {
                        return Err(JoinError::RateLimitExhausted {
                            id: scirex_id.to_string(),
                            attempts: retries,
                        });
                    }
                    let mut wait = self.retry.backoff(retries);
                    if let Some(after) = retry_after {
                        wait = wait.max(after.min(self.retry.max_cooldown));
                    }
                    if let Some(deadline) = self.retry.deadline {
                        if started.elapsed() + wait >= deadline {
                            return Err(JoinError::LookupTimeout {
                                id: scirex_id.to_string(),
                            });
                        }
                    }
                    tracing::warn!(
                        scirex_id,
                        retry = retries + 1,
                        wait_secs = wait.as_secs_f64(),
                        "rate limited by lookup service"
                    );
                    self.pause(wait)?;
                    retries += 1;
                }
            }
        }
    }

    fn pause(&self, duration: Duration) -> Result<(), JoinError> {
        let until = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return Err(JoinError::Cancelled);
            }
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep((until - now).min(PAUSE_SLICE));
        }
    }
}
