// SPDX-License-Identifier: Apache-2.0

//! YAML configuration for the shipper.
//!
//! The file has two sections: `elasticsearch:` describing the cluster and the
//! indexing session, and `tail:` listing the files to follow with their
//! per-file transform pipelines.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub elasticsearch: ElasticsearchConfig,
    #[serde(default)]
    pub tail: Vec<TailFileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElasticsearchConfig {
    /// Cluster servers as `host:port` pairs. Requests pick one at random.
    pub servers: Vec<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Seconds between timed flushes of the bulk queue.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,

    /// Queue length that triggers an immediate flush.
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,

    /// Default index name as a strftime pattern, expanded in local time.
    #[serde(default = "default_index")]
    pub index: String,

    /// Default document type.
    #[serde(rename = "type", default = "default_type")]
    pub doc_type: String,

    /// Directory holding spilled batches awaiting replay.
    #[serde(default = "default_batch_dir")]
    pub batch_dir: PathBuf,

    /// Optional ceiling in bytes on the spill directory; oldest batches are
    /// reclaimed once the total exceeds it.
    #[serde(default)]
    pub batch_disk_space: Option<u64>,

    /// Index templates pushed to the cluster at startup when missing or
    /// different from the configured spec.
    #[serde(default)]
    pub templates: BTreeMap<String, serde_json::Value>,
}

fn default_timeout() -> u64 {
    10
}

fn default_flush_interval() -> u64 {
    30
}

fn default_flush_size() -> usize {
    1_000
}

fn default_index() -> String {
    "logstash-%Y.%m.%d".to_string()
}

fn default_type() -> String {
    "log".to_string()
}

fn default_batch_dir() -> PathBuf {
    PathBuf::from("/var/lib/logship/batches")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TailFileConfig {
    /// Path of the file to follow.
    pub file: PathBuf,

    /// Poll interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub interval: f64,

    /// Index override stamped on every document from this file.
    #[serde(default)]
    pub index: Option<String>,

    /// Type override stamped on every document from this file.
    #[serde(rename = "type", default)]
    pub doc_type: Option<String>,

    /// Ordered decoders applied to each line.
    #[serde(default)]
    pub decode: Vec<DecoderKind>,

    /// Ordered field extractors applied after decoding.
    #[serde(default)]
    pub extract: Vec<ExtractConfig>,

    /// Document mutations applied after extraction.
    #[serde(default)]
    pub mutate: Option<MutateConfig>,
}

fn default_poll_interval() -> f64 {
    1.0
}

impl TailFileConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval.max(0.1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    Json,
    Syslog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractKind {
    Split,
    /// Reserved; accepted and ignored.
    Regex,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractConfig {
    pub by: ExtractKind,

    /// Source field; the raw line when unset.
    #[serde(default)]
    pub from: Option<String>,

    /// Guard regex; the extractor is skipped when the source does not match.
    #[serde(default)]
    pub when: Option<String>,

    /// Split pattern for `by: split`.
    #[serde(default)]
    pub split_on: Option<String>,

    /// Positional names for split parts. `null`/`undef` names skip the part.
    #[serde(default)]
    pub split_parts: Vec<String>,

    /// Destination field; parts land in a nested map under it.
    #[serde(default)]
    pub into: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutateConfig {
    /// Copy `key` to one or more destination fields.
    #[serde(default)]
    pub copy: BTreeMap<String, CopyTargets>,

    /// Move `key` to a new name when present.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,

    /// Delete the listed keys.
    #[serde(default)]
    pub remove: Vec<String>,

    /// Unconditionally set the listed key/value pairs.
    #[serde(default)]
    pub append: BTreeMap<String, serde_json::Value>,

    /// Drop keys whose value is null or the empty string.
    #[serde(default)]
    pub prune: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CopyTargets {
    One(String),
    Many(Vec<String>),
}

impl CopyTargets {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            CopyTargets::One(s) => std::slice::from_ref(s).iter().map(String::as_str),
            CopyTargets::Many(v) => v[..].iter().map(String::as_str),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.elasticsearch.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "elasticsearch.servers must list at least one host:port".to_string(),
            ));
        }
        for server in &self.elasticsearch.servers {
            if !server.contains(':') {
                return Err(ConfigError::Invalid(format!(
                    "server '{server}' is not a host:port pair"
                )));
            }
        }
        if self.elasticsearch.flush_size == 0 {
            return Err(ConfigError::Invalid(
                "elasticsearch.flush_size must be greater than zero".to_string(),
            ));
        }
        if self.tail.is_empty() {
            return Err(ConfigError::Invalid(
                "tail must list at least one file".to_string(),
            ));
        }
        for tail in &self.tail {
            for extract in &tail.extract {
                if extract.by == ExtractKind::Split && extract.split_on.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "tail entry {}: extract by split requires split_on",
                        tail.file.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
elasticsearch:
  servers: [ "localhost:9200", "es2.example.com:9200" ]
  timeout: 5
  flush_interval: 15
  flush_size: 500
  index: "logs-%Y.%m.%d"
  type: syslog
  batch_dir: /tmp/logship-batches
  batch_disk_space: 1048576
tail:
  - file: /var/log/messages
    interval: 2
    decode: [ syslog ]
    mutate:
      rename: { content: message }
      prune: true
  - file: /var/log/app/api.log
    index: "api-%Y.%m"
    decode: [ json ]
    extract:
      - by: split
        from: request
        split_on: "\\s+"
        split_parts: [ verb, uri, null ]
        into: req
"#;

    #[test]
    fn parses_full_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        let es = &config.elasticsearch;
        assert_eq!(es.servers.len(), 2);
        assert_eq!(es.timeout, 5);
        assert_eq!(es.flush_size, 500);
        assert_eq!(es.doc_type, "syslog");
        assert_eq!(es.batch_disk_space, Some(1_048_576));

        assert_eq!(config.tail.len(), 2);
        let syslog = &config.tail[0];
        assert_eq!(syslog.decode, vec![DecoderKind::Syslog]);
        assert!(syslog.mutate.as_ref().unwrap().prune);

        let api = &config.tail[1];
        assert_eq!(api.index.as_deref(), Some("api-%Y.%m"));
        let extract = &api.extract[0];
        assert_eq!(extract.by, ExtractKind::Split);
        assert_eq!(extract.split_parts, vec!["verb", "uri", "null"]);
        assert_eq!(extract.into.as_deref(), Some("req"));
    }

    #[test]
    fn defaults_applied() {
        let minimal = r#"
elasticsearch:
  servers: [ "localhost:9200" ]
tail:
  - file: /var/log/syslog
"#;
        let config: Config = serde_yaml::from_str(minimal).unwrap();
        config.validate().unwrap();
        assert_eq!(config.elasticsearch.timeout, 10);
        assert_eq!(config.elasticsearch.flush_interval, 30);
        assert_eq!(config.elasticsearch.flush_size, 1_000);
        assert_eq!(config.elasticsearch.index, "logstash-%Y.%m.%d");
        assert_eq!(config.elasticsearch.doc_type, "log");
        assert_eq!(config.tail[0].interval, 1.0);
    }

    #[test]
    fn rejects_empty_servers() {
        let bad = r#"
elasticsearch:
  servers: []
tail:
  - file: /var/log/syslog
"#;
        let config: Config = serde_yaml::from_str(bad).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_split_without_pattern() {
        let bad = r#"
elasticsearch:
  servers: [ "localhost:9200" ]
tail:
  - file: /var/log/syslog
    extract:
      - by: split
"#;
        let config: Config = serde_yaml::from_str(bad).unwrap();
        assert!(config.validate().is_err());
    }
}
