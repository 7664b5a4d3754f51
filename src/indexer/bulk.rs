// SPDX-License-Identifier: Apache-2.0

//! Bulk record rendering and batch identity.
//!
//! A bulk record is two JSON objects as newline-delimited text: the action
//! envelope, then the document body, each terminated by `\n`. A batch is the
//! concatenation of records, identified by the hex SHA-1 of its exact bytes
//! so a replay read of the same file yields the same id.

use bytes::Bytes;
use chrono::{Local, TimeZone};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::document::{Document, ENVELOPE_KEYS};

/// Render one document into its bulk record. The `ENVELOPE_KEYS` are lifted
/// out of the payload; `_raw`/`_path` stay in the body.
pub fn render_record(mut doc: Document, default_index: &str, default_type: &str) -> Bytes {
    let [index, doc_type, id, epoch] = ENVELOPE_KEYS.map(|key| doc.remove(key));

    let epoch = epoch.and_then(|v| value_to_epoch(&v));
    let index = match index {
        Some(Value::String(s)) => s,
        _ => expand_index(default_index, epoch),
    };
    let doc_type = match doc_type {
        Some(Value::String(s)) => s,
        _ => default_type.to_string(),
    };
    let id = match id {
        // A null id is no id, not the string "null".
        Some(Value::Null) | None => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    };

    let mut meta = Map::new();
    meta.insert("_index".to_string(), Value::from(index));
    meta.insert("_type".to_string(), Value::from(doc_type));
    if let Some(id) = id {
        meta.insert("_id".to_string(), Value::from(id));
    }
    let mut envelope = Map::new();
    envelope.insert("index".to_string(), Value::Object(meta));

    let mut buf = serde_json::to_vec(&Value::Object(envelope)).expect("envelope serializes");
    buf.push(b'\n');
    let body = serde_json::to_vec(&Value::Object(doc)).expect("document serializes");
    buf.extend_from_slice(&body);
    buf.push(b'\n');

    Bytes::from(buf)
}

/// Expand the strftime index pattern in local time, against `_epoch` when
/// the document carried one.
pub fn expand_index(pattern: &str, epoch: Option<f64>) -> String {
    let when = match epoch {
        Some(secs) => {
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9) as u32;
            Local
                .timestamp_opt(whole, nanos)
                .single()
                .unwrap_or_else(Local::now)
        }
        None => Local::now(),
    };
    when.format(pattern).to_string()
}

fn value_to_epoch(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Content-addressed batch id: hex SHA-1 of the batch bytes.
pub fn batch_id(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

/// Number of bulk records in a batch (two newline-terminated lines each).
pub fn record_count(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|b| **b == b'\n').count() as u64 / 2
}
