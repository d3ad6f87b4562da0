use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::MultiGzDecoder;
use serde::Serialize;

use crate::config::ShardSource;
use crate::domain::{S2orcRecord, ShardLocation, shard_id_from_path};
use crate::download::ShardDownloader;
use crate::error::JoinError;

pub const HASH_LOCATIONS_CACHE: &str = "s2orc_hash_to_location";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardFailure {
    pub shard_id: u32,
    pub file_name: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ScanOutcome<T> {
    /// Hits from fully processed shards only, in shard order.
    pub hits: Vec<T>,
    pub completed: Vec<u32>,
    pub failures: Vec<ShardFailure>,
}

impl<T> Default for ScanOutcome<T> {
    fn default() -> Self {
        Self {
            hits: Vec::new(),
            completed: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// A downloaded shard file, removed when dropped.
struct DownloadedShard {
    path: Utf8PathBuf,
}

impl Drop for DownloadedShard {
    fn drop(&mut self) {
        if !self.path.as_std_path().exists() {
            return;
        }
        match fs::remove_file(self.path.as_std_path()) {
            Ok(()) => tracing::info!(path = %self.path, "deleted shard download"),
            Err(err) => {
                tracing::warn!(path = %self.path, error = %err, "failed to delete shard download")
            }
        }
    }
}

pub struct ShardScanner<'a, D: ShardDownloader> {
    downloader: &'a D,
    download_root: Utf8PathBuf,
    release: String,
}

impl<'a, D: ShardDownloader> ShardScanner<'a, D> {
    pub fn new(downloader: &'a D, download_root: Utf8PathBuf, release: impl Into<String>) -> Self {
        Self {
            downloader,
            download_root,
            release: release.into(),
        }
    }

    /// Downloads, streams and deletes each shard in turn. `visit` sees every
    /// record with its shard id; a shard that fails partway contributes no hits.
    pub fn scan<T, F>(
        &self,
        shards: &[ShardSource],
        mut visit: F,
    ) -> Result<ScanOutcome<T>, JoinError>
    where
        F: FnMut(u32, &S2orcRecord) -> Option<T>,
    {
        let shard_ids = shards
            .iter()
            .map(|source| shard_id_from_path(&source.file_name, source.kind, &self.release))
            .collect::<Result<Vec<_>, _>>()?;

        let mut outcome = ScanOutcome::default();
        for (source, shard_id) in shards.iter().zip(shard_ids) {
            let started = Instant::now();
            let mut staged = Vec::new();
            let result = self.scan_one(source, shard_id, &mut |record: &S2orcRecord| {
                if let Some(hit) = visit(shard_id, record) {
                    staged.push(hit);
                }
            });
            match result {
                Ok(records) => {
                    tracing::info!(
                        shard_id,
                        records,
                        hits = staged.len(),
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        "processed shard"
                    );
                    outcome.hits.extend(staged);
                    outcome.completed.push(shard_id);
                }
                Err(err) => {
                    tracing::warn!(shard_id, file = %source.file_name, error = %err, "shard failed");
                    outcome.failures.push(ShardFailure {
                        shard_id,
                        file_name: source.file_name.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(outcome)
    }

    fn scan_one(
        &self,
        source: &ShardSource,
        shard_id: u32,
        visit: &mut dyn FnMut(&S2orcRecord),
    ) -> Result<usize, JoinError> {
        let shard = DownloadedShard {
            path: self.download_root.join(&source.file_name),
        };
        let started = Instant::now();
        self.downloader.download(&source.url, shard.path.as_std_path())?;
        tracing::info!(
            shard_id,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "downloaded shard"
        );
        read_shard(&shard.path, shard_id, visit)
    }
}

/// Streams a gzip-compressed JSON-lines shard record by record.
pub fn read_shard(
    path: &Utf8Path,
    shard_id: u32,
    visit: &mut dyn FnMut(&S2orcRecord),
) -> Result<usize, JoinError> {
    let read_error = |message: String| JoinError::ShardRead { shard_id, message };
    let file = File::open(path.as_std_path())
        .map_err(|err| read_error(format!("open {path}: {err}")))?;
    let reader = BufReader::new(MultiGzDecoder::new(file));

    let mut records = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| read_error(format!("line {}: {err}", line_no + 1)))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: S2orcRecord = serde_json::from_str(&line)
            .map_err(|err| read_error(format!("line {}: {err}", line_no + 1)))?;
        visit(&record);
        records += 1;
    }
    Ok(records)
}

/// Finds bulk records whose PDF hash is one of `targets`.
pub fn scan_hashes<D: ShardDownloader>(
    scanner: &ShardScanner<'_, D>,
    shards: &[ShardSource],
    targets: &HashSet<String>,
) -> Result<ScanOutcome<ShardLocation>, JoinError> {
    scanner.scan(shards, |shard_id, record| {
        let hash = record.pdf_hash.as_deref()?;
        if !targets.contains(hash) {
            return None;
        }
        Some(ShardLocation::new(
            shard_id,
            record.paper_id.clone().unwrap_or_default(),
            hash,
        ))
    })
}
