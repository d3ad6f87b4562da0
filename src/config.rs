use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{ShardKind, shard_id_from_path};
use crate::error::JoinError;

pub const DEFAULT_CONFIG_FILE: &str = "scirex-join.json";
pub const DEFAULT_RELEASE: &str = "20200705v1";
pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_LOOKUP_URL: &str = "https://api.semanticscholar.org/v1/paper";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub download_dir: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub scirex: Vec<String>,
    #[serde(default)]
    pub pdf_parses: Vec<ShardEntry>,
    #[serde(default)]
    pub metadata: Vec<ShardEntry>,
    #[serde(default)]
    pub lookup: Option<LookupConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ShardEntry {
    Templated(TemplatedShards),
    Explicit(ExplicitShard),
}

/// A contiguous range of shards sharing one download url template.
#[derive(Debug, Deserialize, Serialize)]
pub struct TemplatedShards {
    pub url_template: String,
    pub first: u32,
    pub last: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ExplicitShard {
    pub file_name: String,
    pub url: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LookupConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub request_delay_ms: Option<u64>,
    #[serde(default)]
    pub rate_limit_cooldown_secs: Option<u64>,
    #[serde(default)]
    pub max_cooldown_secs: Option<u64>,
    #[serde(default)]
    pub max_rate_limit_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSource {
    pub kind: ShardKind,
    /// Canonical relative path, also used as the local download path.
    pub file_name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause after every lookup, throttled or not.
    pub request_delay: Duration,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    pub max_retries: u32,
    /// Overall budget for one document, including cooldowns.
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            request_delay: Duration::ZERO,
            cooldown: Duration::ZERO,
            max_cooldown: Duration::ZERO,
            max_retries,
            deadline: None,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.cooldown
            .checked_mul(factor)
            .unwrap_or(self.max_cooldown)
            .min(self.max_cooldown)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_millis(3000),
            cooldown: Duration::from_secs(100),
            max_cooldown: Duration::from_secs(1600),
            max_retries: 64,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LookupSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub cache_root: Utf8PathBuf,
    pub download_root: Utf8PathBuf,
    pub release: String,
    pub scirex_splits: Vec<Utf8PathBuf>,
    pub pdf_parse_shards: Vec<ShardSource>,
    pub metadata_shards: Vec<ShardSource>,
    pub lookup: LookupSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, JoinError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(JoinError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| JoinError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| JoinError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, JoinError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(JoinError::ConfigParse(format!(
                "unsupported schema_version {schema_version}, expected {SCHEMA_VERSION}"
            )));
        }
        let release = config
            .release
            .unwrap_or_else(|| DEFAULT_RELEASE.to_string());

        let cache_root = match config.cache_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_cache_root()?,
        };
        let download_root =
            Utf8PathBuf::from(config.download_dir.as_deref().unwrap_or("s2orc_downloads"));

        let scirex_splits = if config.scirex.is_empty() {
            default_scirex_splits()
        } else {
            config.scirex.into_iter().map(Utf8PathBuf::from).collect()
        };

        let pdf_parse_shards = resolve_shards(config.pdf_parses, ShardKind::PdfParses, &release)?;
        let metadata_shards = resolve_shards(config.metadata, ShardKind::Metadata, &release)?;

        let lookup = config.lookup.unwrap_or_default();
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            request_delay: lookup
                .request_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_delay),
            cooldown: lookup
                .rate_limit_cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
            max_cooldown: lookup
                .max_cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_cooldown),
            max_retries: lookup.max_rate_limit_retries.unwrap_or(defaults.max_retries),
            deadline: lookup.timeout_secs.map(Duration::from_secs),
        };

        Ok(ResolvedConfig {
            cache_root,
            download_root,
            release,
            scirex_splits,
            pdf_parse_shards,
            metadata_shards,
            lookup: LookupSettings {
                base_url: lookup
                    .base_url
                    .unwrap_or_else(|| DEFAULT_LOOKUP_URL.to_string()),
                api_key: lookup.api_key.filter(|key| !key.trim().is_empty()),
                retry,
            },
        })
    }
}

fn resolve_shards(
    entries: Vec<ShardEntry>,
    kind: ShardKind,
    release: &str,
) -> Result<Vec<ShardSource>, JoinError> {
    let mut sources = Vec::new();
    for entry in entries {
        match entry {
            ShardEntry::Templated(range) => {
                if range.first > range.last {
                    return Err(JoinError::ConfigParse(format!(
                        "{kind} shard range {}..={} is empty",
                        range.first, range.last
                    )));
                }
                for index in range.first..=range.last {
                    sources.push(ShardSource {
                        kind,
                        file_name: kind.canonical_path(release, index),
                        url: build_shard_url(&range.url_template, release, kind, index)?,
                    });
                }
            }
            ShardEntry::Explicit(shard) => {
                // Reject misnamed shards before anything is downloaded.
                shard_id_from_path(&shard.file_name, kind, release)?;
                sources.push(ShardSource {
                    kind,
                    file_name: shard.file_name,
                    url: shard.url,
                });
            }
        }
    }
    Ok(sources)
}

/// Expands `{release}`, `{kind}` and `{index}` in a download url template.
/// Any other placeholder is rejected.
pub fn build_shard_url(
    template: &str,
    release: &str,
    kind: ShardKind,
    index: u32,
) -> Result<String, JoinError> {
    let placeholder = Regex::new(r"\{([^{}]*)\}")
        .map_err(|err| JoinError::InvalidTemplate(err.to_string()))?;
    for caps in placeholder.captures_iter(template) {
        let name = &caps[1];
        if !matches!(name, "release" | "kind" | "index") {
            return Err(JoinError::InvalidTemplate(format!(
                "unknown placeholder {{{name}}} in {template}"
            )));
        }
    }
    if !template.contains("{index}") {
        return Err(JoinError::InvalidTemplate(format!(
            "{template} has no {{index}} placeholder"
        )));
    }

    let url = placeholder
        .replace_all(template, |caps: &regex::Captures<'_>| match &caps[1] {
            "release" => release.to_string(),
            "kind" => kind.as_str().to_string(),
            _ => index.to_string(),
        })
        .into_owned();
    if url.contains('{') || url.contains('}') {
        return Err(JoinError::InvalidTemplate(format!(
            "unbalanced braces in {template}"
        )));
    }
    Ok(url)
}

pub fn default_scirex_splits() -> Vec<Utf8PathBuf> {
    vec![
        Utf8PathBuf::from("release_data/train.jsonl"),
        Utf8PathBuf::from("release_data/dev.jsonl"),
        Utf8PathBuf::from("release_data/test.jsonl"),
    ]
}

fn default_cache_root() -> Result<Utf8PathBuf, JoinError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("scirex-s2orc-join"))
                .ok()
        })
        .ok_or_else(|| JoinError::Filesystem("unable to resolve cache directory".to_string()))
}
