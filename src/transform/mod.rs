// SPDX-License-Identifier: Apache-2.0

//! Per-file transform pipeline: decode the raw line, extract fields, apply
//! mutations, stamp metadata, and hand the finished document to the indexer.
//! A line that produces no fields is dropped; the indexer counts it as
//! received but never queued.

pub mod decode;
pub mod extract;
pub mod mutate;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::config::TailFileConfig;
use crate::document::{Document, INDEX_KEY, PATH_KEY, RAW_KEY, TYPE_KEY};
use crate::indexer::session::Message;
use crate::tailer::TailEvent;

use decode::Decoder;
use extract::{Extract, ExtractError};
use mutate::Mutate;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("tail entry {file}: {source}")]
    Extract {
        file: PathBuf,
        source: ExtractError,
    },
}

struct Route {
    decoders: Vec<Decoder>,
    extracts: Vec<Extract>,
    mutate: Mutate,
    index: Option<String>,
    doc_type: Option<String>,
}

/// Compiled per-file pipelines, keyed by source path.
pub struct Pipeline {
    routes: HashMap<PathBuf, Route>,
}

impl Pipeline {
    pub fn new(tails: &[TailFileConfig]) -> Result<Self, TransformError> {
        let mut routes = HashMap::with_capacity(tails.len());
        for tail in tails {
            let extracts = tail
                .extract
                .iter()
                .map(Extract::compile)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| TransformError::Extract {
                    file: tail.file.clone(),
                    source,
                })?;
            routes.insert(
                tail.file.clone(),
                Route {
                    decoders: tail.decode.iter().copied().map(Decoder::from).collect(),
                    extracts,
                    mutate: Mutate::compile(tail.mutate.as_ref()),
                    index: tail.index.clone(),
                    doc_type: tail.doc_type.clone(),
                },
            );
        }
        Ok(Self { routes })
    }

    /// Transform one line from `file` into a document, or None when the line
    /// is dropped.
    pub fn transform(&self, file: &Path, line: &str) -> Option<Document> {
        let Some(route) = self.routes.get(file) else {
            debug!(file = ?file, "no pipeline for file, dropping line");
            return None;
        };

        let mut doc = Document::new();
        for decoder in &route.decoders {
            decoder.apply(line, &mut doc);
        }
        for extract in &route.extracts {
            extract.apply(line, &mut doc);
        }

        // Nothing decoded or extracted: drop the line.
        if doc.is_empty() {
            return None;
        }

        // Stamped ahead of the mutators so remove/prune can act on them.
        doc.insert(RAW_KEY.to_string(), Value::from(line));
        doc.insert(
            PATH_KEY.to_string(),
            Value::from(file.to_string_lossy().into_owned()),
        );

        route.mutate.apply(&mut doc);

        if let Some(index) = &route.index {
            doc.insert(INDEX_KEY.to_string(), Value::from(index.as_str()));
        }
        if let Some(doc_type) = &route.doc_type {
            doc.insert(TYPE_KEY.to_string(), Value::from(doc_type.as_str()));
        }

        Some(doc)
    }

    /// Drive the pipeline: consume tail events until the source closes, then
    /// tell the indexer to shut down.
    pub async fn run(self, mut events: BoundedReceiver<TailEvent>, indexer: BoundedSender<Message>) {
        while let Some(event) = events.next().await {
            match event {
                TailEvent::Line { path, line } => {
                    let docs: Vec<Document> = self.transform(&path, &line).into_iter().collect();
                    if indexer
                        .send(Message::Ingest { lines: 1, docs })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                TailEvent::Error { path, error } => {
                    warn!(file = ?path, %error, "tail failed, dropping file");
                    if indexer.send(Message::TailError).await.is_err() {
                        return;
                    }
                }
            }
        }

        // All tailed files are gone; drain and stop.
        debug!("line source closed, requesting indexer shutdown");
        let _ = indexer.send(Message::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline(yaml: &str) -> (Pipeline, PathBuf) {
        let tails: Vec<TailFileConfig> = serde_yaml::from_str(yaml).unwrap();
        let file = tails[0].file.clone();
        (Pipeline::new(&tails).unwrap(), file)
    }

    #[test]
    fn json_decode_stamps_raw_and_path() {
        let (p, file) = pipeline(
            r#"
- file: /var/log/app.log
  decode: [ json ]
"#,
        );
        let doc = p.transform(&file, r#"prefix {"a":1}"#).unwrap();
        assert_eq!(doc.get("a"), Some(&json!(1)));
        assert_eq!(doc.get(RAW_KEY), Some(&json!(r#"prefix {"a":1}"#)));
        assert_eq!(doc.get(PATH_KEY), Some(&json!("/var/log/app.log")));
    }

    #[test]
    fn split_extract_end_to_end() {
        let (p, file) = pipeline(
            r#"
- file: /var/log/users.log
  extract:
    - by: split
      split_on: ":"
      split_parts: [ user, id, role ]
"#,
        );
        let doc = p.transform(&file, "alice:42:admin").unwrap();
        assert_eq!(doc.get("user"), Some(&json!("alice")));
        assert_eq!(doc.get("id"), Some(&json!("42")));
        assert_eq!(doc.get("role"), Some(&json!("admin")));
        assert_eq!(doc.get(RAW_KEY), Some(&json!("alice:42:admin")));
        assert_eq!(doc.get(PATH_KEY), Some(&json!("/var/log/users.log")));
    }

    #[test]
    fn empty_document_is_dropped() {
        let (p, file) = pipeline(
            r#"
- file: /var/log/app.log
  decode: [ json ]
"#,
        );
        assert!(p.transform(&file, "no json in this line").is_none());
    }

    #[test]
    fn unknown_file_is_dropped() {
        let (p, _) = pipeline(
            r#"
- file: /var/log/app.log
  decode: [ json ]
"#,
        );
        assert!(p
            .transform(Path::new("/other.log"), r#"{"a":1}"#)
            .is_none());
    }

    #[test]
    fn instruction_overrides_stamp_index_and_type() {
        let (p, file) = pipeline(
            r#"
- file: /var/log/app.log
  index: "api-%Y.%m"
  type: api
  decode: [ json ]
"#,
        );
        let doc = p.transform(&file, r#"{"a":1}"#).unwrap();
        assert_eq!(doc.get(INDEX_KEY), Some(&json!("api-%Y.%m")));
        assert_eq!(doc.get(TYPE_KEY), Some(&json!("api")));
    }

    #[test]
    fn mutators_can_prune_raw() {
        let (p, file) = pipeline(
            r#"
- file: /var/log/app.log
  decode: [ json ]
  mutate:
    remove: [ _raw ]
"#,
        );
        let doc = p.transform(&file, r#"{"a":1}"#).unwrap();
        assert!(doc.get(RAW_KEY).is_none());
        assert_eq!(doc.get(PATH_KEY), Some(&json!("/var/log/app.log")));
    }
}
