// SPDX-License-Identifier: Apache-2.0

//! Document mutations, applied in fixed order: copy, rename, remove, append,
//! prune.

use crate::config::MutateConfig;
use crate::document::{is_empty_value, Document};
use serde_json::Value;

#[derive(Debug, Default)]
pub struct Mutate {
    copy: Vec<(String, Vec<String>)>,
    rename: Vec<(String, String)>,
    remove: Vec<String>,
    append: Vec<(String, Value)>,
    prune: bool,
}

impl Mutate {
    pub fn compile(config: Option<&MutateConfig>) -> Self {
        let Some(config) = config else {
            return Self::default();
        };
        Self {
            copy: config
                .copy
                .iter()
                .map(|(src, dsts)| (src.clone(), dsts.iter().map(str::to_string).collect()))
                .collect(),
            rename: config
                .rename
                .iter()
                .map(|(from, to)| (from.clone(), to.clone()))
                .collect(),
            remove: config.remove.clone(),
            append: config
                .append
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            prune: config.prune,
        }
    }

    pub fn apply(&self, doc: &mut Document) {
        // Copying a missing source stores null; prune can sweep it later.
        for (src, dsts) in &self.copy {
            let value = doc.get(src).cloned().unwrap_or(Value::Null);
            for dst in dsts {
                doc.insert(dst.clone(), value.clone());
            }
        }

        for (from, to) in &self.rename {
            if let Some(value) = doc.remove(from) {
                doc.insert(to.clone(), value);
            }
        }

        for key in &self.remove {
            doc.remove(key);
        }

        for (key, value) in &self.append {
            doc.insert(key.clone(), value.clone());
        }

        if self.prune {
            doc.retain(|_, value| !is_empty_value(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MutateConfig;
    use serde_json::json;

    fn mutate(yaml: &str) -> Mutate {
        let config: MutateConfig = serde_yaml::from_str(yaml).unwrap();
        Mutate::compile(Some(&config))
    }

    fn doc(pairs: &[(&str, Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn copy_to_one_and_many() {
        let m = mutate(
            r#"
copy:
  host: [ hostname, node ]
  msg: text
"#,
        );
        let mut d = doc(&[("host", json!("web01")), ("msg", json!("hi"))]);
        m.apply(&mut d);
        assert_eq!(d.get("hostname"), Some(&json!("web01")));
        assert_eq!(d.get("node"), Some(&json!("web01")));
        assert_eq!(d.get("text"), Some(&json!("hi")));
        assert_eq!(d.get("host"), Some(&json!("web01")));
    }

    #[test]
    fn copy_missing_source_stores_null() {
        let m = mutate("copy: { absent: ghost }");
        let mut d = Document::new();
        m.apply(&mut d);
        assert_eq!(d.get("ghost"), Some(&Value::Null));
    }

    #[test]
    fn rename_moves_existing_only() {
        let m = mutate("rename: { old: new, missing: other }");
        let mut d = doc(&[("old", json!(1))]);
        m.apply(&mut d);
        assert!(d.get("old").is_none());
        assert_eq!(d.get("new"), Some(&json!(1)));
        assert!(d.get("other").is_none());
    }

    #[test]
    fn remove_and_append() {
        let m = mutate(
            r#"
remove: [ junk ]
append: { shipper: logship, weight: 2 }
"#,
        );
        let mut d = doc(&[("junk", json!("x")), ("keep", json!("y"))]);
        m.apply(&mut d);
        assert!(d.get("junk").is_none());
        assert_eq!(d.get("keep"), Some(&json!("y")));
        assert_eq!(d.get("shipper"), Some(&json!("logship")));
        assert_eq!(d.get("weight"), Some(&json!(2)));
    }

    #[test]
    fn prune_drops_null_and_empty_strings() {
        let m = mutate("prune: true");
        let mut d = doc(&[
            ("empty", json!("")),
            ("none", Value::Null),
            ("zero", json!(0)),
            ("text", json!("t")),
        ]);
        m.apply(&mut d);
        assert_eq!(d.len(), 2);
        assert_eq!(d.get("zero"), Some(&json!(0)));
        assert_eq!(d.get("text"), Some(&json!("t")));
    }

    #[test]
    fn stages_apply_in_order() {
        // copy then rename then remove then append then prune: the copied
        // field is renamed away, the original removed, and the appended
        // empty string pruned.
        let m = mutate(
            r#"
copy: { a: b }
rename: { b: c }
remove: [ a ]
append: { d: "" }
prune: true
"#,
        );
        let mut d = doc(&[("a", json!("v"))]);
        m.apply(&mut d);
        assert_eq!(d.len(), 1);
        assert_eq!(d.get("c"), Some(&json!("v")));
    }
}
