//! Canonical form, comparison and delta of structured documents.
//!
//! Desired and current resource states are both `serde_json::Value` trees.
//! Before comparing them they are brought to a canonical form:
//!
//! * mapping keys are sorted,
//! * a policy-binding list (every entry a mapping with a string `role` and a
//!   `members` list) is sorted by role, entries sharing role and condition are
//!   merged, member lists are sorted and de-duplicated, empty bindings dropped,
//! * lists stored under a declared *set field* are sorted and de-duplicated,
//! * every other list keeps its source order,
//! * mapping entries holding a default (`null`, `false`, `""`, `[]`, `{}`)
//!   are dropped, since Google APIs leave such fields out of their answers.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub type Document = Value;

/// One leaf-level difference between a current and a desired document.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Added { path: String, value: Value },
    Removed { path: String, value: Value },
    Changed { path: String, from: Value, to: Value },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Added { path, value } => write!(f, "+ {}: {}", path, value),
            Change::Removed { path, value } => write!(f, "- {}: {}", path, value),
            Change::Changed { path, from, to } => write!(f, "~ {}: {} -> {}", path, from, to),
        }
    }
}

/// Canonicalization rules plus the operations built on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Differ<'a> {
    set_fields: &'a [&'a str],
}

impl<'a> Differ<'a> {
    pub const fn new(set_fields: &'a [&'a str]) -> Self {
        Self { set_fields }
    }

    pub fn canonicalize(&self, doc: &Document) -> Document {
        self.canon(doc, None)
    }

    pub fn is_equal(&self, a: &Document, b: &Document) -> bool {
        self.canonicalize(a) == self.canonicalize(b)
    }

    /// True when everything declared in `desired` is already present in
    /// `current`. Extra entries in `current` are tolerated.
    pub fn contains(&self, current: &Document, desired: &Document) -> bool {
        contains_canonical(&self.canonicalize(current), &self.canonicalize(desired))
    }

    /// `current` extended with everything `desired` declares, in canonical form.
    pub fn union(&self, current: &Document, desired: &Document) -> Document {
        let merged = union_canonical(&self.canonicalize(current), &self.canonicalize(desired));
        self.canonicalize(&merged)
    }

    /// Changes that turn `current` into `desired`.
    pub fn diff(&self, current: &Document, desired: &Document) -> Vec<Change> {
        let mut out = Vec::new();
        self.diff_into("", None, &self.canonicalize(current), &self.canonicalize(desired), &mut out);
        out
    }

    fn is_set_field(&self, key: Option<&str>) -> bool {
        key.map_or(false, |k| self.set_fields.contains(&k))
    }

    fn canon(&self, value: &Value, key: Option<&str>) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for k in keys {
                    let v = self.canon(&map[k.as_str()], Some(k.as_str()));
                    if !is_default(&v) {
                        out.insert(k.clone(), v);
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                let items: Vec<Value> = items.iter().map(|v| self.canon(v, None)).collect();
                if is_binding_list(&items) {
                    Value::Array(normalize_bindings(&items))
                } else if self.is_set_field(key) {
                    Value::Array(sorted_set(items))
                } else {
                    Value::Array(items)
                }
            }
            other => other.clone(),
        }
    }

    fn diff_into(&self, path: &str, key: Option<&str>, current: &Value, desired: &Value, out: &mut Vec<Change>) {
        match (current, desired) {
            (Value::Object(a), Value::Object(b)) => {
                let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
                for k in keys {
                    let child = join_path(path, k);
                    match (a.get(k.as_str()), b.get(k.as_str())) {
                        (Some(x), Some(y)) => self.diff_into(&child, Some(k.as_str()), x, y, out),
                        (None, Some(y)) => out.push(Change::Added { path: child, value: y.clone() }),
                        (Some(x), None) => out.push(Change::Removed { path: child, value: x.clone() }),
                        (None, None) => {}
                    }
                }
            }
            (Value::Array(a), Value::Array(b)) if bindings_like(a, b) => {
                diff_bindings(path, a, b, out);
            }
            (Value::Array(a), Value::Array(b)) if self.is_set_field(key) => {
                for item in b.iter().filter(|v| !a.contains(v)) {
                    out.push(Change::Added { path: path.to_string(), value: item.clone() });
                }
                for item in a.iter().filter(|v| !b.contains(v)) {
                    out.push(Change::Removed { path: path.to_string(), value: item.clone() });
                }
            }
            (Value::Array(a), Value::Array(b)) => {
                for i in 0..a.len().max(b.len()) {
                    let child = format!("{}[{}]", path, i);
                    match (a.get(i), b.get(i)) {
                        (Some(x), Some(y)) => self.diff_into(&child, None, x, y, out),
                        (None, Some(y)) => out.push(Change::Added { path: child, value: y.clone() }),
                        (Some(x), None) => out.push(Change::Removed { path: child, value: x.clone() }),
                        (None, None) => {}
                    }
                }
            }
            (a, b) if a != b => out.push(Change::Changed {
                path: path.to_string(),
                from: a.clone(),
                to: b.clone(),
            }),
            _ => {}
        }
    }
}

/// Order-insensitive equality with no set fields declared.
pub fn is_equal(a: &Document, b: &Document) -> bool {
    Differ::default().is_equal(a, b)
}

/// Delta between `current` and `desired` with no set fields declared.
pub fn diff(current: &Document, desired: &Document) -> Vec<Change> {
    Differ::default().diff(current, desired)
}

/// Keeps only the listed top-level fields of a mapping document.
pub fn select_fields(doc: &Document, fields: &[&str]) -> Document {
    match doc {
        Value::Object(map) => {
            let mut out = Map::new();
            for field in fields {
                if let Some(v) = map.get(*field) {
                    out.insert((*field).to_string(), v.clone());
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Reads a dotted path such as `labels.root` out of a document. Numeric
/// segments index arrays.
pub fn lookup_path<'v>(doc: &'v Document, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(doc, |node, segment| match node {
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => node.get(segment),
    })
}

/// Values a JSON API omits from its answers.
fn is_default(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Number(_) => false,
    }
}

fn join_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", base, key)
    }
}

fn is_binding(value: &Value) -> bool {
    value.get("role").map_or(false, Value::is_string) && value.get("members").map_or(false, Value::is_array)
}

fn is_binding_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(is_binding)
}

fn bindings_like(a: &[Value], b: &[Value]) -> bool {
    (is_binding_list(a) || a.is_empty()) && (is_binding_list(b) || b.is_empty()) && !(a.is_empty() && b.is_empty())
}

fn sorted_set(items: Vec<Value>) -> Vec<Value> {
    let mut keyed: BTreeMap<String, Value> = BTreeMap::new();
    for item in items {
        keyed.entry(sort_key(&item)).or_insert(item);
    }
    keyed.into_values().collect()
}

fn sort_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Group key of a binding: its role plus its condition, if any.
fn binding_key(binding: &Value) -> (String, String) {
    let role = binding.get("role").and_then(Value::as_str).unwrap_or_default().to_string();
    let condition = binding.get("condition").map(Value::to_string).unwrap_or_default();
    (role, condition)
}

fn binding_members(binding: &Value) -> BTreeSet<String> {
    binding
        .get("members")
        .and_then(Value::as_array)
        .map(|members| members.iter().map(sort_key).collect())
        .unwrap_or_default()
}

fn group_bindings(items: &[Value]) -> BTreeMap<(String, String), (Value, BTreeSet<String>)> {
    let mut groups: BTreeMap<(String, String), (Value, BTreeSet<String>)> = BTreeMap::new();
    for binding in items {
        let entry = groups
            .entry(binding_key(binding))
            .or_insert_with(|| (binding.clone(), BTreeSet::new()));
        entry.1.extend(binding_members(binding));
    }
    groups
}

fn normalize_bindings(items: &[Value]) -> Vec<Value> {
    group_bindings(items)
        .into_values()
        .filter(|(_, members)| !members.is_empty())
        .map(|(template, members)| binding_with_members(&template, members))
        .collect()
}

fn binding_with_members(template: &Value, members: BTreeSet<String>) -> Value {
    let mut binding = template.as_object().cloned().unwrap_or_default();
    binding.insert(
        "members".to_string(),
        Value::Array(members.into_iter().map(Value::String).collect()),
    );
    // re-sort keys, `members` may have been appended at the end
    let mut keys: Vec<String> = binding.keys().cloned().collect();
    keys.sort();
    let mut out = Map::new();
    for k in keys {
        if let Some(v) = binding.remove(&k) {
            out.insert(k, v);
        }
    }
    Value::Object(out)
}

fn binding_label((role, condition): &(String, String)) -> String {
    if condition.is_empty() {
        role.clone()
    } else {
        format!("{} if {}", role, condition)
    }
}

fn diff_bindings(path: &str, current: &[Value], desired: &[Value], out: &mut Vec<Change>) {
    let a = group_bindings(current);
    let b = group_bindings(desired);
    let keys: BTreeSet<&(String, String)> = a.keys().chain(b.keys()).collect();
    for key in keys {
        let child = format!("{}[{}].members", path, binding_label(key));
        let before = a.get(key).map(|(_, m)| m.clone()).unwrap_or_default();
        let after = b.get(key).map(|(_, m)| m.clone()).unwrap_or_default();
        for member in after.difference(&before) {
            out.push(Change::Added { path: child.clone(), value: Value::String(member.clone()) });
        }
        for member in before.difference(&after) {
            out.push(Change::Removed { path: child.clone(), value: Value::String(member.clone()) });
        }
    }
}

fn contains_canonical(current: &Value, desired: &Value) -> bool {
    match (current, desired) {
        (Value::Object(a), Value::Object(b)) => b
            .iter()
            .all(|(k, v)| a.get(k).map_or(false, |cur| contains_canonical(cur, v))),
        (Value::Array(a), Value::Array(b)) if bindings_like(a, b) => {
            let have = group_bindings(a);
            group_bindings(b).iter().all(|(key, (_, members))| {
                have.get(key).map_or(members.is_empty(), |(_, m)| members.is_subset(m))
            })
        }
        (Value::Array(a), Value::Array(b)) => b.iter().all(|v| a.contains(v)),
        (a, b) => a == b,
    }
}

fn union_canonical(current: &Value, desired: &Value) -> Value {
    match (current, desired) {
        (Value::Object(a), Value::Object(b)) => {
            let mut out = a.clone();
            for (k, v) in b {
                let merged = match a.get(k) {
                    Some(cur) => union_canonical(cur, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(a), Value::Array(b)) if bindings_like(a, b) => {
            let mut all = a.clone();
            all.extend(b.iter().cloned());
            Value::Array(normalize_bindings(&all))
        }
        (Value::Array(a), Value::Array(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().filter(|v| !a.contains(v)).cloned());
            Value::Array(out)
        }
        (_, b) => b.clone(),
    }
}
