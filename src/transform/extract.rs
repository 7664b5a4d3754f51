// SPDX-License-Identifier: Apache-2.0

//! Field extractors. Each extractor reads either the raw line or a named
//! string field of the partial document and assigns the pieces it produces
//! back into the document.

use crate::config::{ExtractConfig, ExtractKind};
use crate::document::Document;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("invalid regex '{pattern}': {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Debug)]
pub struct Extract {
    kind: ExtractKind,
    from: Option<String>,
    when: Option<Regex>,
    split_on: Option<Regex>,
    /// Positional part names; None marks a `null`/`undef` placeholder whose
    /// part is discarded.
    parts: Vec<Option<String>>,
    into: Option<String>,
}

impl Extract {
    pub fn compile(config: &ExtractConfig) -> Result<Self, ExtractError> {
        let when = config.when.as_deref().map(compile).transpose()?;
        let split_on = config.split_on.as_deref().map(compile).transpose()?;
        let parts = config
            .split_parts
            .iter()
            .map(|name| {
                if name.eq_ignore_ascii_case("null") || name.eq_ignore_ascii_case("undef") {
                    None
                } else {
                    Some(name.clone())
                }
            })
            .collect();

        Ok(Self {
            kind: config.by,
            from: config.from.clone(),
            when,
            split_on,
            parts,
            into: config.into.clone(),
        })
    }

    /// Apply the extractor. Extractors whose source field is missing, whose
    /// guard does not match, or whose kind is reserved are skipped without
    /// error.
    pub fn apply(&self, line: &str, doc: &mut Document) {
        if self.kind != ExtractKind::Split {
            return;
        }

        let source = match &self.from {
            Some(field) => match doc.get(field) {
                Some(Value::String(s)) => s.clone(),
                _ => return,
            },
            None => line.to_string(),
        };

        if let Some(when) = &self.when {
            if !when.is_match(&source) {
                return;
            }
        }

        let Some(split_on) = &self.split_on else {
            return;
        };
        let pieces: Vec<&str> = split_on.split(&source).collect();

        if self.parts.is_empty() {
            self.store_unnamed(doc, &pieces);
        } else {
            self.store_named(doc, &pieces);
        }
    }

    /// With part names, pieces are assigned by position into the document or
    /// into a nested map under `into`. Placeholder names and empty pieces
    /// are skipped.
    fn store_named(&self, doc: &mut Document, pieces: &[&str]) {
        let mut fields = Document::new();
        for (name, piece) in self.parts.iter().zip(pieces) {
            let Some(name) = name else { continue };
            if piece.is_empty() {
                continue;
            }
            fields.insert(name.clone(), Value::from(*piece));
        }

        match &self.into {
            Some(into) => {
                doc.insert(into.clone(), Value::Object(fields));
            }
            None => doc.extend(fields),
        }
    }

    /// Without part names the whole result lands under `into` (falling back
    /// to the source field name): an array when the split produced several
    /// pieces, a scalar when it produced one.
    fn store_unnamed(&self, doc: &mut Document, pieces: &[&str]) {
        let Some(target) = self.into.as_ref().or(self.from.as_ref()) else {
            return;
        };
        let value = if pieces.len() > 1 {
            Value::Array(pieces.iter().map(|p| Value::from(*p)).collect())
        } else {
            Value::from(pieces.first().copied().unwrap_or_default())
        };
        doc.insert(target.clone(), value);
    }
}

fn compile(pattern: &str) -> Result<Regex, ExtractError> {
    Regex::new(pattern).map_err(|source| ExtractError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractConfig;
    use serde_json::json;

    fn split(config: &str) -> Extract {
        let config: ExtractConfig = serde_yaml::from_str(config).unwrap();
        Extract::compile(&config).unwrap()
    }

    #[test]
    fn split_assigns_named_parts() {
        let extract = split(
            r#"
by: split
split_on: ":"
split_parts: [ user, id, role ]
"#,
        );
        let mut doc = Document::new();
        extract.apply("alice:42:admin", &mut doc);
        assert_eq!(doc.get("user"), Some(&json!("alice")));
        assert_eq!(doc.get("id"), Some(&json!("42")));
        assert_eq!(doc.get("role"), Some(&json!("admin")));
    }

    #[test]
    fn split_skips_null_names_and_empty_parts() {
        let extract = split(
            r#"
by: split
split_on: ","
split_parts: [ a, null, c, UNDEF, e ]
"#,
        );
        let mut doc = Document::new();
        extract.apply("1,2,,4,5", &mut doc);
        assert_eq!(doc.get("a"), Some(&json!("1")));
        assert!(doc.get("c").is_none()); // empty part
        assert_eq!(doc.get("e"), Some(&json!("5")));
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn split_into_nested_map() {
        let extract = split(
            r#"
by: split
from: request
split_on: "\\s+"
split_parts: [ verb, uri ]
into: req
"#,
        );
        let mut doc = Document::new();
        doc.insert("request".to_string(), json!("GET /health"));
        extract.apply("ignored raw line", &mut doc);
        assert_eq!(doc.get("req"), Some(&json!({"verb": "GET", "uri": "/health"})));
    }

    #[test]
    fn split_unnamed_stores_array() {
        let extract = split(
            r#"
by: split
split_on: " "
into: words
"#,
        );
        let mut doc = Document::new();
        extract.apply("a b c", &mut doc);
        assert_eq!(doc.get("words"), Some(&json!(["a", "b", "c"])));
    }

    #[test]
    fn split_unnamed_single_piece_is_scalar() {
        let extract = split(
            r#"
by: split
from: token
split_on: ","
"#,
        );
        let mut doc = Document::new();
        doc.insert("token".to_string(), json!("solo"));
        extract.apply("", &mut doc);
        assert_eq!(doc.get("token"), Some(&json!("solo")));
    }

    #[test]
    fn when_guard_skips_non_matching_source() {
        let extract = split(
            r#"
by: split
when: "^ERROR"
split_on: " "
split_parts: [ level, rest ]
"#,
        );
        let mut doc = Document::new();
        extract.apply("INFO everything fine", &mut doc);
        assert!(doc.is_empty());

        extract.apply("ERROR disk on fire", &mut doc);
        assert_eq!(doc.get("level"), Some(&json!("ERROR")));
    }

    #[test]
    fn missing_from_field_skips() {
        let extract = split(
            r#"
by: split
from: absent
split_on: ","
split_parts: [ a ]
"#,
        );
        let mut doc = Document::new();
        extract.apply("1,2", &mut doc);
        assert!(doc.is_empty());
    }

    #[test]
    fn regex_kind_is_accepted_and_ignored() {
        let extract = split(
            r#"
by: regex
"#,
        );
        let mut doc = Document::new();
        extract.apply("anything", &mut doc);
        assert!(doc.is_empty());
    }
}
