// SPDX-License-Identifier: Apache-2.0

//! Line decoders. Decoders run in configured order against the raw line and
//! build up the partial document: the JSON decoder merges its fields into
//! whatever is already there, the syslog decoder replaces the document with
//! the parsed field map.

use crate::config::DecoderKind;
use crate::document::Document;
use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub enum Decoder {
    Json,
    Syslog,
}

impl From<DecoderKind> for Decoder {
    fn from(kind: DecoderKind) -> Self {
        match kind {
            DecoderKind::Json => Decoder::Json,
            DecoderKind::Syslog => Decoder::Syslog,
        }
    }
}

impl Decoder {
    /// Apply the decoder to `line`, updating `doc`. A decoder that cannot
    /// parse the line leaves `doc` untouched; the line continues through the
    /// rest of the chain.
    pub fn apply(&self, line: &str, doc: &mut Document) {
        match self {
            Decoder::Json => decode_json(line, doc),
            Decoder::Syslog => decode_syslog(line, doc),
        }
    }
}

/// Decode JSON from the first `{` in the line. Lines frequently carry a
/// plain-text prefix (timestamps, log levels) ahead of the JSON payload.
fn decode_json(line: &str, doc: &mut Document) {
    let Some(start) = line.find('{') else {
        return;
    };
    match serde_json::from_str::<Value>(&line[start..]) {
        Ok(Value::Object(map)) => doc.extend(map),
        Ok(_) | Err(_) => {}
    }
}

fn decode_syslog(line: &str, doc: &mut Document) {
    if let Some(parsed) = syslog::parse(line) {
        *doc = parsed;
    }
}

pub mod syslog {
    //! Minimal RFC 3164-style syslog line parser producing a flat field map.
    //!
    //! Accepts the classic file format with an optional `<PRI>` prefix:
    //! `<13>Jan  2 15:04:05 host program[pid]: message`

    use crate::document::Document;
    use serde_json::Value;

    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    /// Parse a syslog line into a flat key/value map. Returns None when the
    /// line does not look like syslog.
    pub fn parse(line: &str) -> Option<Document> {
        let mut doc = Document::new();
        let mut rest = line;

        if let Some(stripped) = rest.strip_prefix('<') {
            let end = stripped.find('>')?;
            let pri: u16 = stripped[..end].parse().ok()?;
            doc.insert("priority".to_string(), Value::from(pri));
            doc.insert("facility".to_string(), Value::from(pri >> 3));
            doc.insert("severity".to_string(), Value::from(pri & 0x7));
            rest = &stripped[end + 1..];
        }

        // Timestamp: "Mmm [d]d HH:MM:SS"
        let month = rest.get(..3)?;
        if !MONTHS.contains(&month) {
            return None;
        }
        let ts_len = timestamp_len(rest)?;
        let timestamp = &rest[..ts_len];
        doc.insert("timestamp".to_string(), Value::from(timestamp));
        rest = rest[ts_len..].trim_start();

        // Hostname, then "program[pid]:" or "program:"
        let (host, after_host) = rest.split_once(' ')?;
        doc.insert("host".to_string(), Value::from(host));
        rest = after_host.trim_start();

        let message = match rest.split_once(": ") {
            Some((tag, msg)) => {
                let (program, pid) = split_tag(tag);
                doc.insert("program".to_string(), Value::from(program));
                if let Some(pid) = pid {
                    doc.insert("pid".to_string(), Value::from(pid));
                }
                msg
            }
            None => rest,
        };
        doc.insert("message".to_string(), Value::from(message));

        Some(doc)
    }

    /// Length of the leading "Mmm [d]d HH:MM:SS" timestamp, if well-formed.
    fn timestamp_len(s: &str) -> Option<usize> {
        // Day may be space-padded: "Jan  2" vs "Jan 12".
        let bytes = s.as_bytes();
        if bytes.len() < 15 || bytes[3] != b' ' {
            return None;
        }
        let time_start = 7;
        let time = s.get(time_start..time_start + 8)?;
        let mut parts = time.split(':');
        for _ in 0..3 {
            let p = parts.next()?;
            if p.len() != 2 || !p.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
        }
        Some(time_start + 8)
    }

    fn split_tag(tag: &str) -> (&str, Option<&str>) {
        match tag.split_once('[') {
            Some((program, rest)) => (program, rest.strip_suffix(']')),
            None => (tag, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_decodes_from_first_brace() {
        let mut doc = Document::new();
        Decoder::Json.apply(r#"prefix {"a":1}"#, &mut doc);
        assert_eq!(doc.get("a"), Some(&json!(1)));
    }

    #[test]
    fn json_merges_left_to_right() {
        let mut doc = Document::new();
        doc.insert("a".to_string(), json!("old"));
        doc.insert("b".to_string(), json!(true));
        Decoder::Json.apply(r#"{"a":"new"}"#, &mut doc);
        assert_eq!(doc.get("a"), Some(&json!("new")));
        assert_eq!(doc.get("b"), Some(&json!(true)));
    }

    #[test]
    fn json_failure_leaves_doc_untouched() {
        let mut doc = Document::new();
        doc.insert("keep".to_string(), json!(1));
        Decoder::Json.apply("no json here", &mut doc);
        Decoder::Json.apply("broken {not json", &mut doc);
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn json_top_level_array_skipped() {
        let mut doc = Document::new();
        Decoder::Json.apply("[1,2,3]", &mut doc);
        assert!(doc.is_empty());
    }

    #[test]
    fn syslog_parses_classic_line() {
        let mut doc = Document::new();
        Decoder::Syslog.apply(
            "Jan  2 15:04:05 web01 sshd[4242]: Accepted publickey for deploy",
            &mut doc,
        );
        assert_eq!(doc.get("timestamp"), Some(&json!("Jan  2 15:04:05")));
        assert_eq!(doc.get("host"), Some(&json!("web01")));
        assert_eq!(doc.get("program"), Some(&json!("sshd")));
        assert_eq!(doc.get("pid"), Some(&json!("4242")));
        assert_eq!(
            doc.get("message"),
            Some(&json!("Accepted publickey for deploy"))
        );
    }

    #[test]
    fn syslog_parses_pri_prefix() {
        let mut doc = Document::new();
        Decoder::Syslog.apply("<13>Feb 12 01:02:03 db cron: job done", &mut doc);
        assert_eq!(doc.get("priority"), Some(&json!(13)));
        assert_eq!(doc.get("facility"), Some(&json!(1)));
        assert_eq!(doc.get("severity"), Some(&json!(5)));
        assert_eq!(doc.get("program"), Some(&json!("cron")));
    }

    #[test]
    fn syslog_replaces_prior_document() {
        let mut doc = Document::new();
        doc.insert("stale".to_string(), json!("x"));
        Decoder::Syslog.apply("Mar  3 10:00:00 host daemon: up", &mut doc);
        assert!(doc.get("stale").is_none());
        assert_eq!(doc.get("host"), Some(&json!("host")));
    }

    #[test]
    fn syslog_failure_leaves_doc_untouched() {
        let mut doc = Document::new();
        doc.insert("keep".to_string(), json!(1));
        Decoder::Syslog.apply("not a syslog line", &mut doc);
        assert_eq!(doc.len(), 1);
    }
}
