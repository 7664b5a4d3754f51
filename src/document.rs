// SPDX-License-Identifier: Apache-2.0

//! Document model shared by the transform pipeline and the indexer.
//!
//! A document is a flat-to-nested JSON object. Reserved underscore keys ride
//! along inside the map during transformation; the bulk renderer lifts the
//! envelope keys (`_index`, `_type`, `_id`, `_epoch`) out of the payload,
//! while `_raw` and `_path` remain ordinary payload fields.

use serde_json::Value;

pub type Document = serde_json::Map<String, Value>;

/// Target index override, expanded into the bulk envelope.
pub const INDEX_KEY: &str = "_index";
/// Document type override, expanded into the bulk envelope.
pub const TYPE_KEY: &str = "_type";
/// Caller-supplied document id, included in the envelope when present.
pub const ID_KEY: &str = "_id";
/// Event time in seconds since the Unix epoch; selects the time used to
/// expand the index pattern.
pub const EPOCH_KEY: &str = "_epoch";
/// The originating raw line.
pub const RAW_KEY: &str = "_raw";
/// The source file path.
pub const PATH_KEY: &str = "_path";

/// Keys lifted out of the payload into the bulk envelope.
pub const ENVELOPE_KEYS: [&str; 4] = [INDEX_KEY, TYPE_KEY, ID_KEY, EPOCH_KEY];

/// Whether a value counts as absent for pruning purposes.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_values() {
        assert!(is_empty_value(&Value::Null));
        assert!(is_empty_value(&json!("")));
        assert!(!is_empty_value(&json!("x")));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
    }
}
