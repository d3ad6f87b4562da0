use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::json;

use scirex_s2orc_join::app::{App, JOIN_CACHE, JoinMap, JoinOptions, ProgressEvent, ProgressSink};
use scirex_s2orc_join::config::{
    Config, ConfigLoader, ExplicitShard, LookupConfig, ResolvedConfig, ShardEntry,
};
use scirex_s2orc_join::domain::{
    LocationMap, MatchRule, MetadataMap, MetadataRecord, ShardKind, ShardLocation,
};
use scirex_s2orc_join::download::ShardDownloader;
use scirex_s2orc_join::error::JoinError;
use scirex_s2orc_join::lookup::{LookupOutcome, MetadataLookup, PaperResponse};
use scirex_s2orc_join::resolver::METADATA_CACHE;
use scirex_s2orc_join::scanner::HASH_LOCATIONS_CACHE;
use scirex_s2orc_join::store::{CacheStore, Store};

const RELEASE: &str = "20200705v1";

struct NoopSink;

impl ProgressSink for NoopSink {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Default)]
struct TableLookup {
    papers: HashMap<String, serde_json::Value>,
    calls: Mutex<Vec<String>>,
}

impl MetadataLookup for TableLookup {
    fn fetch_paper(&self, id: &str) -> Result<LookupOutcome, JoinError> {
        self.calls.lock().unwrap().push(id.to_string());
        Ok(LookupOutcome::Found(match self.papers.get(id) {
            Some(raw) => PaperResponse::new(raw.clone()),
            None => PaperResponse::empty(),
        }))
    }
}

#[derive(Default)]
struct FixtureDownloader {
    files: HashMap<String, Vec<u8>>,
    downloads: Mutex<usize>,
}

impl ShardDownloader for FixtureDownloader {
    fn download(&self, url: &str, destination: &Path) -> Result<(), JoinError> {
        *self.downloads.lock().unwrap() += 1;
        let bytes = self
            .files
            .get(url)
            .ok_or_else(|| JoinError::DownloadHttp(format!("no fixture for {url}")))?;
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(destination, bytes).unwrap();
        Ok(())
    }
}

fn gzip_lines(lines: &[serde_json::Value]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for line in lines {
        writeln!(encoder, "{line}").unwrap();
    }
    encoder.finish().unwrap()
}

fn shard_url(kind: ShardKind, index: u32) -> String {
    format!("https://fixtures/{kind}/{index}")
}

fn explicit(kind: ShardKind, index: u32) -> ShardEntry {
    ShardEntry::Explicit(ExplicitShard {
        file_name: kind.canonical_path(RELEASE, index),
        url: shard_url(kind, index),
    })
}

fn test_config(root: &Utf8PathBuf) -> ResolvedConfig {
    ConfigLoader::resolve_config(Config {
        cache_dir: Some(root.join("cache").to_string()),
        download_dir: Some(root.join("downloads").to_string()),
        release: Some(RELEASE.to_string()),
        scirex: vec![root.join("train.jsonl").to_string()],
        pdf_parses: vec![explicit(ShardKind::PdfParses, 0)],
        metadata: vec![explicit(ShardKind::Metadata, 0), explicit(ShardKind::Metadata, 1)],
        lookup: Some(LookupConfig {
            request_delay_ms: Some(0),
            rate_limit_cooldown_secs: Some(0),
            max_cooldown_secs: Some(0),
            ..LookupConfig::default()
        }),
        ..Config::default()
    })
    .unwrap()
}

fn fixtures() -> (TableLookup, FixtureDownloader) {
    let mut lookup = TableLookup::default();
    lookup.papers.insert(
        "doc-doi".to_string(),
        json!({"corpusId": 200, "paperId": "doc-doi", "title": "Wrong Title",
               "doi": "10.1/x", "arxivId": null, "url": "u"}),
    );
    lookup.papers.insert(
        "doc-title".to_string(),
        json!({"corpusId": null, "paperId": "doc-title", "title": "Exact Title",
               "doi": null, "arxivId": null, "url": "u"}),
    );

    let mut downloader = FixtureDownloader::default();
    downloader.files.insert(
        shard_url(ShardKind::PdfParses, 0),
        gzip_lines(&[
            json!({"paper_id": "100", "_pdf_hash": "doc-hash"}),
            json!({"paper_id": "101", "_pdf_hash": "someone-else"}),
        ]),
    );
    downloader.files.insert(
        shard_url(ShardKind::Metadata, 0),
        gzip_lines(&[
            json!({"paper_id": "100", "title": "Hash Doc", "doi": null}),
            json!({"paper_id": "300", "title": "Exact Title", "doi": null}),
        ]),
    );
    downloader.files.insert(
        shard_url(ShardKind::Metadata, 1),
        gzip_lines(&[
            json!({"paper_id": "200", "title": "Other", "doi": "10.1/x"}),
            json!({"paper_id": "999", "title": "", "doi": "", "arxiv_id": ""}),
        ]),
    );
    (lookup, downloader)
}

fn scirex_ids() -> Vec<String> {
    ["doc-hash", "doc-doi", "doc-title", "doc-missing"]
        .iter()
        .map(|id| id.to_string())
        .collect()
}

#[test]
fn full_run_joins_by_hash_paper_id_doi_and_title() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = test_config(&root);
    let store = Store::new(&config);
    let (lookup, downloader) = fixtures();
    let app = App::new(config, lookup, downloader, store.clone());

    let (joined, report) = app
        .run(&scirex_ids(), &JoinOptions::default(), &NoopSink)
        .unwrap();

    assert_eq!(joined["doc-hash"].rule, MatchRule::ContentHash);
    assert_eq!(
        joined["doc-hash"].location,
        ShardLocation::new(0, "100", "doc-hash")
    );
    // corpus id 200 matches the bulk paper id before the DOI rule is reached.
    assert_eq!(joined["doc-doi"].rule, MatchRule::PaperId);
    assert_eq!(joined["doc-doi"].location.shard_id, 1);
    assert_eq!(joined["doc-title"].rule, MatchRule::Title);
    assert_eq!(
        joined["doc-title"].location,
        ShardLocation::new(0, "300", "doc-title")
    );
    assert!(!joined.contains_key("doc-missing"));

    assert_eq!(report.matched, 3);
    assert_eq!(report.unmatched, vec!["doc-missing".to_string()]);
    assert_eq!(report.located_by_hash, 1);
    assert!(report.failed_shards.is_empty());

    let persisted: JoinMap = store.load(JOIN_CACHE).unwrap().unwrap();
    assert_eq!(persisted, joined);
}

#[test]
fn second_run_is_served_from_caches() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = test_config(&root);
    let store = Store::new(&config);

    let (lookup, downloader) = fixtures();
    let first = App::new(config.clone(), lookup, downloader, store.clone());
    let (first_joined, _) = first
        .run(&scirex_ids(), &JoinOptions::default(), &NoopSink)
        .unwrap();

    let (lookup, downloader) = fixtures();
    let second = App::new(config, lookup, downloader, store);
    let (joined, report) = second
        .run(&scirex_ids(), &JoinOptions::default(), &NoopSink)
        .unwrap();

    assert_eq!(joined, first_joined);
    assert!(report.from_cache);
}

#[test]
fn incomplete_scan_is_not_persisted() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = test_config(&root);
    let store = Store::new(&config);
    let (lookup, mut downloader) = fixtures();
    downloader.files.remove(&shard_url(ShardKind::Metadata, 1));
    let app = App::new(config, lookup, downloader, store.clone());

    let (joined, report) = app
        .run(&scirex_ids(), &JoinOptions::default(), &NoopSink)
        .unwrap();

    assert_eq!(report.failed_shards.len(), 1);
    assert_eq!(report.failed_shards[0].shard_id, 1);
    assert!(!joined.contains_key("doc-doi"));
    assert!(store.exists(HASH_LOCATIONS_CACHE));
    assert!(!store.exists(JOIN_CACHE));
}

#[test]
fn location_cache_round_trips_exactly() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new_with_paths(root.join("cache"), root.join("downloads"));

    let mut locations = LocationMap::new();
    locations.insert("h1".to_string(), ShardLocation::new(0, "", "h1"));
    locations.insert("h2".to_string(), ShardLocation::new(4294967295, "77490025", "h2"));
    store.save(HASH_LOCATIONS_CACHE, &locations).unwrap();

    let loaded: LocationMap = store.load(HASH_LOCATIONS_CACHE).unwrap().unwrap();
    assert_eq!(loaded, locations);
}

#[test]
fn cached_locations_skip_scanning() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = test_config(&root);
    let store = Store::new(&config);
    let mut locations = LocationMap::new();
    locations.insert("doc-hash".to_string(), ShardLocation::new(9, "100", "doc-hash"));
    store.save(HASH_LOCATIONS_CACHE, &locations).unwrap();

    let (lookup, downloader) = fixtures();
    let app = App::new(config, lookup, downloader, store);
    let (loaded, result) = app
        .locate(&scirex_ids(), &JoinOptions::default(), &NoopSink)
        .unwrap();

    assert_eq!(loaded, locations);
    assert!(result.from_cache);
}

fn retitled_lookup(title: &str) -> TableLookup {
    let (mut lookup, _) = fixtures();
    lookup.papers.insert(
        "doc-title".to_string(),
        json!({"corpusId": null, "paperId": "doc-title", "title": title,
               "doi": null, "arxivId": null, "url": "u"}),
    );
    lookup
}

#[test]
fn metadata_refresh_recomputes_cached_join() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = test_config(&root);
    let store = Store::new(&config);

    let (_, downloader) = fixtures();
    let first = App::new(config.clone(), retitled_lookup("Old Title"), downloader, store.clone());
    let (joined, _) = first
        .run(&scirex_ids(), &JoinOptions::default(), &NoopSink)
        .unwrap();
    assert!(!joined.contains_key("doc-title"));

    let (_, downloader) = fixtures();
    let second = App::new(config, retitled_lookup("Exact Title"), downloader, store.clone());
    let options = JoinOptions {
        refresh_metadata: true,
        ..JoinOptions::default()
    };
    let (joined, report) = second.run(&scirex_ids(), &options, &NoopSink).unwrap();

    assert!(!report.from_cache);
    assert_eq!(joined["doc-title"].rule, MatchRule::Title);
    assert_eq!(report.matched, 3);
    let persisted: JoinMap = store.load(JOIN_CACHE).unwrap().unwrap();
    assert_eq!(persisted, joined);
}

#[test]
fn rebuilt_metadata_cache_invalidates_join_cache() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = test_config(&root);
    let store = Store::new(&config);

    let (_, downloader) = fixtures();
    let first = App::new(config.clone(), retitled_lookup("Old Title"), downloader, store.clone());
    first
        .run(&scirex_ids(), &JoinOptions::default(), &NoopSink)
        .unwrap();
    std::fs::remove_file(store.cache_path(METADATA_CACHE)).unwrap();

    let (_, downloader) = fixtures();
    let second = App::new(config, retitled_lookup("Exact Title"), downloader, store);
    let (joined, report) = second
        .run(&scirex_ids(), &JoinOptions::default(), &NoopSink)
        .unwrap();

    assert!(!report.from_cache);
    assert_eq!(joined["doc-title"].rule, MatchRule::Title);
}

#[test]
fn hash_location_survives_metadata_cache_without_the_id() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = test_config(&root);
    let store = Store::new(&config);

    let mut locations = LocationMap::new();
    locations.insert("doc-hash".to_string(), ShardLocation::new(0, "100", "doc-hash"));
    store.save(HASH_LOCATIONS_CACHE, &locations).unwrap();
    let mut metadatas = MetadataMap::new();
    metadatas.insert(
        "doc-title".to_string(),
        MetadataRecord {
            title: Some("Exact Title".to_string()),
            ..MetadataRecord::default()
        },
    );
    store.save(METADATA_CACHE, &metadatas).unwrap();

    let (lookup, downloader) = fixtures();
    let app = App::new(config, lookup, downloader, store);
    let (joined, report) = app
        .run(&scirex_ids(), &JoinOptions::default(), &NoopSink)
        .unwrap();

    assert_eq!(joined["doc-hash"].rule, MatchRule::ContentHash);
    assert_eq!(joined["doc-hash"].location, ShardLocation::new(0, "100", "doc-hash"));
    assert_eq!(joined["doc-title"].rule, MatchRule::Title);
    assert_eq!(report.matched, 2);
}
