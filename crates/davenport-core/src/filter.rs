//! Change filtering.
//!
//! Davenport never evaluates code from design documents. A design-document
//! filter is a declarative Mango-style selector object; `ChangeFilter`
//! applies it (plus `doc_ids` and `include_docs` shaping) to change events
//! in place.

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use crate::document::{ChangeEvent, ChangesOptions};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Selector matching (Mango subset)
// ---------------------------------------------------------------------------

/// Match a Mango selector against a document.
///
/// Supported: implicit equality, `$eq`, `$ne`, `$gt`, `$gte`, `$lt`,
/// `$lte`, `$exists`, `$in`, `$nin`, `$regex`, `$not`, and the
/// combinators `$and` / `$or`. Dotted keys address nested fields.
pub fn selector_matches(selector: &Value, doc: &Value) -> bool {
    let Value::Object(clauses) = selector else {
        return false;
    };
    clauses.iter().all(|(key, cond)| match key.as_str() {
        "$and" => cond
            .as_array()
            .is_some_and(|subs| subs.iter().all(|s| selector_matches(s, doc))),
        "$or" => cond
            .as_array()
            .is_some_and(|subs| subs.iter().any(|s| selector_matches(s, doc))),
        "$not" => !selector_matches(cond, doc),
        _ => field_matches(lookup(doc, key), cond),
    })
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, part| value.get(part))
}

fn field_matches(field: Option<&Value>, cond: &Value) -> bool {
    match cond {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            ops.iter().all(|(op, arg)| op_matches(field, op, arg))
        }
        _ => field == Some(cond),
    }
}

fn op_matches(field: Option<&Value>, op: &str, arg: &Value) -> bool {
    match op {
        "$exists" => arg.as_bool().is_some_and(|want| field.is_some() == want),
        "$not" => !field_matches(field, arg),
        _ => {
            let Some(field) = field else { return false };
            match op {
                "$eq" => field == arg,
                "$ne" => field != arg,
                "$gt" => compare(field, arg).is_some_and(std::cmp::Ordering::is_gt),
                "$gte" => compare(field, arg).is_some_and(std::cmp::Ordering::is_ge),
                "$lt" => compare(field, arg).is_some_and(std::cmp::Ordering::is_lt),
                "$lte" => compare(field, arg).is_some_and(std::cmp::Ordering::is_le),
                "$in" => arg.as_array().is_some_and(|set| set.contains(field)),
                "$nin" => arg.as_array().is_some_and(|set| !set.contains(field)),
                "$regex" => matches_regex(field, arg),
                _ => false,
            }
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn matches_regex(field: &Value, pattern: &Value) -> bool {
    let (Some(text), Some(pattern)) = (field.as_str(), pattern.as_str()) else {
        return false;
    };
    Regex::new(pattern).is_ok_and(|re| re.is_match(text))
}

/// Pull the named filter out of a design document, enforcing the
/// no-code-evaluation policy: only selector objects are accepted.
pub fn selector_from_design(ddoc: &Value, filter_name: &str) -> Result<Value> {
    let entry = ddoc
        .get("filters")
        .and_then(|filters| filters.get(filter_name))
        .ok_or_else(|| Error::missing(format!("missing json key: filters/{filter_name}")))?;
    match entry {
        Value::Object(_) => Ok(entry.clone()),
        Value::String(_) => Err(Error::Unsupported(
            "javascript filter functions are not evaluated; define the filter as a selector object"
                .into(),
        )),
        _ => Err(Error::BadRequest("filter must be a selector object".into())),
    }
}

// ---------------------------------------------------------------------------
// ChangeFilter
// ---------------------------------------------------------------------------

/// Per-subscription filter applied to each change event before delivery.
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    doc_ids: Option<HashSet<String>>,
    selector: Option<Value>,
    include_docs: bool,
}

impl ChangeFilter {
    pub fn from_options(opts: &ChangesOptions) -> Self {
        Self {
            doc_ids: opts.doc_ids.as_ref().map(|ids| ids.iter().cloned().collect()),
            selector: opts.selector.clone(),
            include_docs: opts.include_docs,
        }
    }

    /// Install a selector resolved from a design document.
    pub fn with_selector(mut self, selector: Value) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn needs_doc(&self) -> bool {
        self.include_docs || self.selector.is_some()
    }

    /// Decide whether `event` passes, and shape it for delivery: events
    /// only carry their doc when the subscriber asked for it.
    pub fn apply(&self, event: &mut ChangeEvent) -> bool {
        if let Some(ids) = &self.doc_ids
            && !ids.contains(&event.id)
        {
            return false;
        }
        if let Some(selector) = &self.selector {
            let matched = event
                .doc
                .as_ref()
                .is_some_and(|doc| selector_matches(selector, doc));
            if !matched {
                return false;
            }
        }
        if !self.include_docs {
            event.doc = None;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ChangeRev;
    use serde_json::json;

    #[test]
    fn implicit_equality_and_dotted_paths() {
        let doc = json!({"kind": "note", "meta": {"stars": 4}});
        assert!(selector_matches(&json!({"kind": "note"}), &doc));
        assert!(selector_matches(&json!({"meta.stars": 4}), &doc));
        assert!(!selector_matches(&json!({"kind": "task"}), &doc));
    }

    #[test]
    fn comparison_operators() {
        let doc = json!({"n": 5, "s": "m"});
        assert!(selector_matches(&json!({"n": {"$gt": 4}}), &doc));
        assert!(selector_matches(&json!({"n": {"$gte": 5, "$lte": 5}}), &doc));
        assert!(!selector_matches(&json!({"n": {"$lt": 5}}), &doc));
        assert!(selector_matches(&json!({"s": {"$gt": "a"}}), &doc));
        assert!(!selector_matches(&json!({"s": {"$gt": 1}}), &doc));
    }

    #[test]
    fn set_and_existence_operators() {
        let doc = json!({"tag": "b"});
        assert!(selector_matches(&json!({"tag": {"$in": ["a", "b"]}}), &doc));
        assert!(selector_matches(&json!({"tag": {"$nin": ["x"]}}), &doc));
        assert!(selector_matches(&json!({"tag": {"$exists": true}}), &doc));
        assert!(selector_matches(&json!({"nope": {"$exists": false}}), &doc));
    }

    #[test]
    fn regex_and_combinators() {
        let doc = json!({"name": "delta-42"});
        assert!(selector_matches(&json!({"name": {"$regex": "^delta-\\d+$"}}), &doc));
        assert!(selector_matches(
            &json!({"$or": [{"name": "x"}, {"name": {"$regex": "delta"}}]}),
            &doc
        ));
        assert!(!selector_matches(
            &json!({"$and": [{"name": {"$regex": "delta"}}, {"name": "x"}]}),
            &doc
        ));
        assert!(selector_matches(&json!({"$not": {"name": "x"}}), &doc));
    }

    #[test]
    fn design_filter_policy() {
        let ddoc = json!({"filters": {
            "sel": {"kind": "note"},
            "js": "function(doc) { return true; }",
        }});
        assert_eq!(selector_from_design(&ddoc, "sel").unwrap(), json!({"kind": "note"}));
        assert!(matches!(
            selector_from_design(&ddoc, "js"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            selector_from_design(&ddoc, "gone"),
            Err(Error::MissingDoc(_))
        ));
    }

    fn event(id: &str, doc: Option<Value>) -> ChangeEvent {
        ChangeEvent {
            seq: 1,
            id: id.into(),
            changes: vec![ChangeRev { rev: "1-a".into() }],
            deleted: false,
            doc,
        }
    }

    #[test]
    fn change_filter_doc_ids() {
        let filter = ChangeFilter::from_options(&ChangesOptions {
            doc_ids: Some(vec!["a".into()]),
            ..Default::default()
        });
        assert!(filter.apply(&mut event("a", None)));
        assert!(!filter.apply(&mut event("b", None)));
    }

    #[test]
    fn change_filter_selector_strips_doc_unless_requested() {
        let filter = ChangeFilter::from_options(&ChangesOptions {
            selector: Some(json!({"kind": "note"})),
            ..Default::default()
        });
        assert!(filter.needs_doc());

        let mut ev = event("a", Some(json!({"kind": "note"})));
        assert!(filter.apply(&mut ev));
        assert!(ev.doc.is_none());

        let mut ev = event("a", Some(json!({"kind": "task"})));
        assert!(!filter.apply(&mut ev));
    }
}
