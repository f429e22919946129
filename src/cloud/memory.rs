//! In-memory [`CloudApi`] with call recording.
//!
//! Follows the remote semantics the reconciler relies on: server-assigned
//! names, an etag bumped on every write, stale-token rejection and
//! `AlreadyExists` on a duplicate create. Google resources are stored the
//! way the REST APIs answer, without default-valued fields; Terraform Cloud
//! variables marked sensitive are answered without their value.

use super::CloudApi;
use crate::adapter::{ResourceIdentity, ResourceKind};
use crate::document::Document;
use crate::error::{Result, SetupError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Describe,
    Create,
    Update,
}

/// Record of one API call for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: Method,
    pub kind: ResourceKind,
    pub identity: String,
    pub body: Option<Document>,
}

impl Call {
    pub fn is_write(&self) -> bool {
        self.method != Method::Describe
    }
}

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<(ResourceKind, String), Document>,
    /// Namespaced tag names to their server-assigned names.
    aliases: BTreeMap<(ResourceKind, String), String>,
    next_id: u64,
    next_etag: u64,
}

impl State {
    fn etag(&mut self) -> String {
        self.next_etag += 1;
        format!("BwY{:06}", self.next_etag)
    }

    fn assign_name(&mut self, kind: ResourceKind, parent: Option<&str>) -> Option<String> {
        let prefix = match kind {
            ResourceKind::Project => "projects/".to_string(),
            ResourceKind::Folder => "folders/".to_string(),
            ResourceKind::TagKey => "tagKeys/".to_string(),
            ResourceKind::TagValue => "tagValues/".to_string(),
            ResourceKind::TagBinding => "tagBindings/".to_string(),
            ResourceKind::VariableSet => "varsets/varset-".to_string(),
            ResourceKind::Variable => format!("{}/vars/var-", parent?),
            _ => return None,
        };
        self.next_id += 1;
        Some(format!("{}{}", prefix, 1000 + self.next_id))
    }

    fn project_id_taken(&self, id: &str) -> bool {
        self.resources.iter().any(|((kind, _), doc)| {
            *kind == ResourceKind::Project && doc.get("projectId").and_then(Value::as_str) == Some(id)
        })
    }

    fn resolve(&self, kind: ResourceKind, name: &str) -> String {
        self.aliases
            .get(&(kind, name.to_string()))
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn find(&self, kind: ResourceKind, identity: &ResourceIdentity) -> Result<Option<(String, Document)>> {
        match identity {
            ResourceIdentity::Name(name) => {
                let key = (kind, self.resolve(kind, name));
                Ok(self.resources.get(&key).map(|doc| (key.1.clone(), doc.clone())))
            }
            ResourceIdentity::Lookup { .. } => {
                let matches: Vec<(String, Document)> = self
                    .resources
                    .iter()
                    .filter(|((k, _), doc)| *k == kind && identity.matches(doc) && is_active(doc))
                    .map(|((_, name), doc)| (name.clone(), doc.clone()))
                    .collect();
                if matches.len() > 1 {
                    return Err(SetupError::Ambiguous {
                        resource: identity.to_string(),
                        matches: matches.into_iter().map(|(name, _)| name).collect(),
                    });
                }
                Ok(matches.into_iter().next())
            }
        }
    }
}

fn is_active(doc: &Document) -> bool {
    doc.get("state").and_then(Value::as_str).map_or(true, |s| s == "ACTIVE")
}

/// Top-level fields as the remote keeps them. Google APIs omit fields
/// holding their default value; Terraform Cloud only drops nulls.
fn as_stored(kind: ResourceKind, body: &Document) -> Document {
    match body {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .filter(|(_, v)| kind.is_terraform() || !is_default(v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_default(value: &Value) -> bool {
    match value {
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// What a read returns: sensitive variable values never leave the store.
fn answered(kind: ResourceKind, mut doc: Document) -> Document {
    let sensitive = doc.get("sensitive").and_then(Value::as_bool).unwrap_or(false);
    if kind == ResourceKind::Variable && sensitive {
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("value");
        }
    }
    doc
}

type Edit = Box<dyn FnOnce(&mut Document) + Send>;

/// An out-of-band edit waiting for the next describe of its kind.
struct PendingEdit {
    kind: ResourceKind,
    edit: Edit,
}

impl fmt::Debug for PendingEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEdit").field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// In-memory cloud used by the test-suite.
#[derive(Debug, Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<State>>,
    calls: Arc<Mutex<Vec<Call>>>,
    failures: Arc<Mutex<Vec<(Method, ResourceKind, SetupError)>>>,
    races: Arc<Mutex<Vec<ResourceKind>>>,
    edits: Arc<Mutex<Vec<PendingEdit>>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_write).collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("lock").clear();
    }

    /// The next `method` call on `kind` fails with `error`.
    pub fn inject_failure(&self, method: Method, kind: ResourceKind, error: SetupError) {
        self.failures.lock().expect("lock").push((method, kind, error));
    }

    /// The next create of `kind` loses a race: a concurrent creator stores
    /// the same resource first and the call fails with `AlreadyExists`.
    pub fn race_next_create(&self, kind: ResourceKind) {
        self.races.lock().expect("lock").push(kind);
    }

    /// Right after the next describe of `kind` has answered, a concurrent
    /// writer applies `edit` to the same resource and bumps its etag. The
    /// state the caller read is stale from then on.
    pub fn mutate_after_next_describe(&self, kind: ResourceKind, edit: impl FnOnce(&mut Document) + Send + 'static) {
        self.edits.lock().expect("lock").push(PendingEdit { kind, edit: Box::new(edit) });
    }

    /// Stores a resource as-is, with a fresh etag when it has none. A
    /// `namespacedName` field makes the resource reachable by that name too.
    pub fn seed(&self, kind: ResourceKind, name: &str, mut doc: Document) {
        let mut state = self.state.lock().expect("lock");
        if doc.get("etag").is_none() {
            let etag = state.etag();
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("etag".to_string(), Value::String(etag));
            }
        }
        if let Some(alias) = doc.get("namespacedName").and_then(Value::as_str) {
            if alias != name {
                state.aliases.insert((kind, alias.to_string()), name.to_string());
            }
        }
        state.resources.insert((kind, name.to_string()), doc);
    }

    /// Current stored state of a resource, by name or alias. Sensitive
    /// values are included.
    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<Document> {
        let state = self.state.lock().expect("lock");
        let name = state.resolve(kind, name);
        state.resources.get(&(kind, name)).cloned()
    }

    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        let state = self.state.lock().expect("lock");
        state
            .resources
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Applies an out-of-band edit, as an operator would, and bumps the etag.
    /// Returns false when the resource does not exist.
    pub fn mutate(&self, kind: ResourceKind, name: &str, edit: impl FnOnce(&mut Document)) -> bool {
        let mut state = self.state.lock().expect("lock");
        let name = state.resolve(kind, name);
        let etag = state.etag();
        match state.resources.get_mut(&(kind, name)) {
            Some(doc) => {
                edit(doc);
                doc["etag"] = Value::String(etag);
                true
            }
            None => false,
        }
    }

    fn record(&self, method: Method, kind: ResourceKind, identity: &ResourceIdentity, body: Option<&Document>) {
        self.calls.lock().expect("lock").push(Call {
            method,
            kind,
            identity: identity.to_string(),
            body: body.cloned(),
        });
    }

    fn check_failure(&self, method: Method, kind: ResourceKind) -> Result<()> {
        let mut failures = self.failures.lock().expect("lock");
        match failures.iter().position(|(m, k, _)| *m == method && *k == kind) {
            Some(index) => Err(failures.remove(index).2),
            None => Ok(()),
        }
    }

    fn take_race(&self, kind: ResourceKind) -> bool {
        let mut races = self.races.lock().expect("lock");
        match races.iter().position(|k| *k == kind) {
            Some(index) => {
                races.remove(index);
                true
            }
            None => false,
        }
    }

    fn take_edit(&self, kind: ResourceKind) -> Option<Edit> {
        let mut edits = self.edits.lock().expect("lock");
        let index = edits.iter().position(|e| e.kind == kind)?;
        Some(edits.remove(index).edit)
    }

    fn store_new(state: &mut State, kind: ResourceKind, identity: &ResourceIdentity, body: &Document) -> Document {
        let mut doc = as_stored(kind, body);
        let etag = state.etag();
        let (requested, parent) = match identity {
            ResourceIdentity::Name(name) => (Some(name.clone()), None),
            ResourceIdentity::Lookup { parent, .. } => (None, Some(parent.clone())),
        };
        let parent = parent.or_else(|| doc.get("parent").and_then(Value::as_str).map(str::to_string));
        let name = match state.assign_name(kind, parent.as_deref()) {
            Some(assigned) => {
                if let Some(alias) = &requested {
                    state.aliases.insert((kind, alias.clone()), assigned.clone());
                    doc["namespacedName"] = Value::String(alias.clone());
                }
                assigned
            }
            None => requested.unwrap_or_default(),
        };

        if let Some(obj) = doc.as_object_mut() {
            obj.insert("etag".to_string(), Value::String(etag));
            match kind {
                ResourceKind::IamPolicy | ResourceKind::ProjectServices | ResourceKind::BillingInfo => {}
                _ => {
                    obj.insert("name".to_string(), Value::String(name.clone()));
                }
            }
            if let (ResourceKind::Variable | ResourceKind::VariableSet, Some(parent)) = (kind, &parent) {
                obj.entry("parent").or_insert_with(|| Value::String(parent.clone()));
            }
            match kind {
                ResourceKind::Project | ResourceKind::Folder => {
                    obj.insert("state".to_string(), json!("ACTIVE"));
                }
                ResourceKind::WorkloadIdentityPool | ResourceKind::WorkloadIdentityProvider => {
                    obj.insert("state".to_string(), json!("ACTIVE"));
                }
                ResourceKind::ServiceAccount => {
                    let email = name.rsplit('/').next().unwrap_or_default().to_string();
                    obj.insert("email".to_string(), Value::String(email));
                    obj.insert("uniqueId".to_string(), json!(format!("1{:020}", state.next_etag)));
                }
                _ => {}
            }
        }
        state.resources.insert((kind, name), doc.clone());
        doc
    }
}

#[async_trait]
impl CloudApi for MemoryCloud {
    async fn describe(&self, kind: ResourceKind, identity: &ResourceIdentity) -> Result<Option<Document>> {
        self.record(Method::Describe, kind, identity, None);
        self.check_failure(Method::Describe, kind)?;
        let mut state = self.state.lock().expect("lock");
        let found = state.find(kind, identity)?;
        if let Some((name, _)) = &found {
            if let Some(edit) = self.take_edit(kind) {
                let etag = state.etag();
                if let Some(doc) = state.resources.get_mut(&(kind, name.clone())) {
                    edit(doc);
                    doc["etag"] = Value::String(etag);
                }
            }
        }
        Ok(found.map(|(_, doc)| answered(kind, doc)))
    }

    async fn create(&self, kind: ResourceKind, identity: &ResourceIdentity, body: &Document) -> Result<Document> {
        self.record(Method::Create, kind, identity, Some(body));
        self.check_failure(Method::Create, kind)?;
        let mut state = self.state.lock().expect("lock");

        if self.take_race(kind) {
            Self::store_new(&mut state, kind, identity, body);
            return Err(SetupError::AlreadyExists { resource: identity.to_string() });
        }
        if state.find(kind, identity)?.is_some() {
            return Err(SetupError::AlreadyExists { resource: identity.to_string() });
        }
        // Project ids are unique across every state, pending deletion included.
        if let Some(id) = body.get("projectId").and_then(Value::as_str) {
            if kind == ResourceKind::Project && state.project_id_taken(id) {
                return Err(SetupError::AlreadyExists { resource: format!("projects/{}", id) });
            }
        }
        Ok(answered(kind, Self::store_new(&mut state, kind, identity, body)))
    }

    async fn update(
        &self,
        kind: ResourceKind,
        identity: &ResourceIdentity,
        body: &Document,
        token: Option<&str>,
    ) -> Result<Document> {
        self.record(Method::Update, kind, identity, Some(body));
        self.check_failure(Method::Update, kind)?;
        let mut state = self.state.lock().expect("lock");

        let (name, mut current) = state
            .find(kind, identity)?
            .ok_or_else(|| SetupError::api(404, format!("{} not found", identity)))?;

        let offered = token
            .map(str::to_string)
            .or_else(|| body.get("etag").and_then(Value::as_str).map(str::to_string));
        let live = current.get("etag").and_then(Value::as_str).map(str::to_string);
        if offered.is_some() && offered != live {
            return Err(SetupError::ConcurrentModification { resource: identity.to_string() });
        }

        match kind {
            // whole-document replacement
            ResourceKind::IamPolicy | ResourceKind::ProjectServices | ResourceKind::BillingInfo => {
                current = as_stored(kind, body);
            }
            // patch semantics
            _ => {
                if let (Some(target), Some(fields)) = (current.as_object_mut(), body.as_object()) {
                    for (k, v) in fields.iter().filter(|(_, v)| !v.is_null()) {
                        target.insert(k.clone(), v.clone());
                    }
                }
                current = as_stored(kind, &current);
            }
        }
        let etag = state.etag();
        current["etag"] = Value::String(etag);
        state.resources.insert((kind, name), current.clone());
        Ok(answered(kind, current))
    }
}
