//! In-memory destination
//!
//! Holds collections in a single `parking_lot::Mutex`. `applyOps` is atomic:
//! the state is snapshotted and restored if any operation fails.

use crate::destination::{Destination, DestinationError};
use docrestore_core::{Document, Namespace};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

type DestResult<T> = std::result::Result<T, DestinationError>;

#[derive(Debug, Clone, Default)]
struct Collection {
    options: Document,
    indexes: Vec<Document>,
    /// Keyed by the canonical JSON of `_id`
    docs: BTreeMap<String, Document>,
}

#[derive(Debug, Clone, Default)]
struct State {
    collections: BTreeMap<Namespace, Collection>,
}

/// A destination that keeps everything in memory
#[derive(Debug, Default)]
pub struct InMemoryDestination {
    state: Mutex<State>,
    rejected: HashSet<Namespace>,
}

impl InMemoryDestination {
    /// Empty destination
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every insert into `ns`
    pub fn with_rejected(mut self, ns: Namespace) -> Self {
        self.rejected.insert(ns);
        self
    }

    /// Documents in `ns`, ordered by `_id`
    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        self.state
            .lock()
            .collections
            .get(ns)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of documents in `ns`
    pub fn count(&self, ns: &Namespace) -> usize {
        self.state
            .lock()
            .collections
            .get(ns)
            .map_or(0, |c| c.docs.len())
    }

    /// Index specs created on `ns`
    pub fn indexes(&self, ns: &Namespace) -> Vec<Document> {
        self.state
            .lock()
            .collections
            .get(ns)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    /// Creation options of `ns`, if it exists
    pub fn options(&self, ns: &Namespace) -> Option<Document> {
        self.state.lock().collections.get(ns).map(|c| c.options.clone())
    }

    /// Every existing collection
    pub fn collection_names(&self) -> Vec<Namespace> {
        self.state.lock().collections.keys().cloned().collect()
    }
}

impl Destination for InMemoryDestination {
    fn create_collection(&self, ns: &Namespace, options: &Document) -> DestResult<()> {
        self.state.lock().create(ns, options.clone())
    }

    fn insert_batch(&self, ns: &Namespace, docs: Vec<Document>) -> DestResult<u64> {
        if self.rejected.contains(ns) {
            return Err(DestinationError::InvalidOperation(format!(
                "inserts into {ns} are rejected"
            )));
        }
        let mut state = self.state.lock();
        let coll = state.collections.entry(ns.clone()).or_default();
        let mut keyed = Vec::with_capacity(docs.len());
        for doc in docs {
            let key = id_key(&doc).ok_or_else(|| {
                DestinationError::InvalidOperation(format!("document without _id for {ns}"))
            })?;
            if coll.docs.contains_key(&key) || keyed.iter().any(|(k, _)| *k == key) {
                return Err(DestinationError::DuplicateKey {
                    namespace: ns.to_string(),
                    key,
                });
            }
            keyed.push((key, doc));
        }
        let n = keyed.len() as u64;
        coll.docs.extend(keyed);
        Ok(n)
    }

    fn run_command(&self, db: &str, command: &Document) -> DestResult<Document> {
        let mut state = self.state.lock();
        if command_name(command) == Some("applyOps") {
            let ops = command
                .get("applyOps")
                .and_then(Value::as_array)
                .ok_or_else(|| DestinationError::InvalidOperation("applyOps must be an array".into()))?;
            let snapshot = state.clone();
            match state.apply_ops(ops) {
                Ok(applied) => Ok(ok(json!({ "applied": applied }))),
                Err(e) => {
                    *state = snapshot;
                    Err(e)
                }
            }
        } else {
            state.command(db, command)
        }
    }
}

impl State {
    fn create(&mut self, ns: &Namespace, options: Document) -> DestResult<()> {
        if self.collections.contains_key(ns) {
            return Err(DestinationError::NamespaceExists(ns.to_string()));
        }
        debug!(namespace = %ns, "Creating collection");
        self.collections.insert(
            ns.clone(),
            Collection {
                options,
                ..Collection::default()
            },
        );
        Ok(())
    }

    fn command(&mut self, db: &str, command: &Document) -> DestResult<Document> {
        let name = command_name(command)
            .ok_or_else(|| DestinationError::InvalidOperation("empty command".into()))?;
        let target = |key: &str| {
            command
                .get(key)
                .and_then(Value::as_str)
                .map(|coll| Namespace::new(db, coll))
                .ok_or_else(|| DestinationError::InvalidOperation(format!("{key} needs a collection name")))
        };
        match name {
            "create" => {
                let ns = target("create")?;
                let options = command
                    .iter()
                    .filter(|(k, _)| k.as_str() != "create")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.create(&ns, options)?;
            }
            "drop" => {
                let ns = target("drop")?;
                if self.collections.remove(&ns).is_none() {
                    return Err(DestinationError::NamespaceNotFound(ns.to_string()));
                }
            }
            "createIndexes" => {
                let ns = target("createIndexes")?;
                let specs = command
                    .get("indexes")
                    .and_then(Value::as_array)
                    .ok_or_else(|| DestinationError::InvalidOperation("createIndexes needs indexes".into()))?;
                let coll = self.collections.entry(ns).or_default();
                for spec in specs {
                    let Value::Object(spec) = spec else {
                        return Err(DestinationError::InvalidOperation("index spec must be a document".into()));
                    };
                    let exists = coll.indexes.iter().any(|i| i.get("name") == spec.get("name"));
                    if !exists {
                        coll.indexes.push(spec.clone());
                    }
                }
            }
            "dropDatabase" => {
                self.collections.retain(|ns, _| ns.db != db);
            }
            other => return Err(DestinationError::UnsupportedCommand(other.to_string())),
        }
        Ok(ok(json!({})))
    }

    fn apply_ops(&mut self, ops: &[Value]) -> DestResult<usize> {
        let mut applied = 0;
        for op in ops {
            let Value::Object(op) = op else {
                return Err(DestinationError::InvalidOperation("applyOps item must be a document".into()));
            };
            if self.apply_op(op)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn apply_op(&mut self, op: &Document) -> DestResult<bool> {
        let kind = op.get("op").and_then(Value::as_str).unwrap_or_default();
        let ns = Namespace::parse(op.get("ns").and_then(Value::as_str).unwrap_or_default());
        let empty = Document::new();
        let o = op.get("o").and_then(Value::as_object).unwrap_or(&empty);
        match kind {
            "n" => Ok(false),
            "i" => {
                let key = id_key(o).ok_or_else(|| {
                    DestinationError::InvalidOperation(format!("insert without _id for {ns}"))
                })?;
                self.collections
                    .entry(ns)
                    .or_default()
                    .docs
                    .insert(key, o.clone());
                Ok(true)
            }
            "u" => {
                let query = op.get("o2").and_then(Value::as_object).unwrap_or(&empty);
                let key = id_key(query).ok_or_else(|| {
                    DestinationError::InvalidOperation(format!("update without _id for {ns}"))
                })?;
                let coll = self
                    .collections
                    .get_mut(&ns)
                    .ok_or_else(|| DestinationError::NamespaceNotFound(ns.to_string()))?;
                match coll.docs.get_mut(&key) {
                    Some(doc) => {
                        apply_update(doc, o)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            "d" => {
                let key = id_key(o).ok_or_else(|| {
                    DestinationError::InvalidOperation(format!("delete without _id for {ns}"))
                })?;
                Ok(self
                    .collections
                    .get_mut(&ns)
                    .is_some_and(|c| c.docs.remove(&key).is_some()))
            }
            "c" => {
                self.command(&ns.db, o)?;
                Ok(true)
            }
            other => Err(DestinationError::InvalidOperation(format!(
                "unknown op type {other:?}"
            ))),
        }
    }
}

fn command_name(command: &Document) -> Option<&str> {
    command.keys().next().map(String::as_str)
}

fn ok(extra: Value) -> Document {
    let mut reply = Document::new();
    reply.insert("ok".into(), json!(1));
    if let Value::Object(extra) = extra {
        reply.extend(extra);
    }
    reply
}

fn id_key(doc: &Document) -> Option<String> {
    doc.get("_id").map(Value::to_string)
}

fn apply_update(doc: &mut Document, update: &Document) -> DestResult<()> {
    if update.contains_key("diff") {
        let diff = update
            .get("diff")
            .and_then(Value::as_object)
            .ok_or_else(|| DestinationError::InvalidOperation("diff must be a document".into()))?;
        return apply_diff(doc, diff);
    }
    if !update.keys().any(|k| k.starts_with('$')) {
        let id = doc.get("_id").cloned();
        *doc = update.clone();
        if let Some(id) = id {
            doc.insert("_id".into(), id);
        }
        return Ok(());
    }
    for (operator, fields) in update {
        let fields = fields.as_object().ok_or_else(|| {
            DestinationError::InvalidOperation(format!("{operator} needs a document"))
        })?;
        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    unset_path(doc, path);
                }
            }
            "$v" => {}
            other => return Err(DestinationError::UnsupportedCommand(other.to_string())),
        }
    }
    Ok(())
}

/// Applies a `{u, i, d, s<field>}` document diff
fn apply_diff(doc: &mut Document, diff: &Document) -> DestResult<()> {
    for (section, body) in diff {
        let body = body.as_object().ok_or_else(|| {
            DestinationError::InvalidOperation(format!("diff section {section} must be a document"))
        })?;
        match section.as_str() {
            "u" | "i" => {
                for (k, v) in body {
                    doc.insert(k.clone(), v.clone());
                }
            }
            "d" => {
                for k in body.keys() {
                    doc.remove(k);
                }
            }
            s if s.len() > 1 && s.starts_with('s') => {
                let field = &s[1..];
                let entry = doc
                    .entry(field.to_string())
                    .or_insert_with(|| Value::Object(Document::new()));
                match entry {
                    Value::Object(sub) => apply_diff(sub, body)?,
                    _ => {
                        return Err(DestinationError::InvalidOperation(format!(
                            "diff for {field} targets a non-document"
                        )))
                    }
                }
            }
            other => {
                return Err(DestinationError::InvalidOperation(format!(
                    "unknown diff section {other}"
                )))
            }
        }
    }
    Ok(())
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(sub) = entry {
                set_path(sub, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(sub)) = doc.get_mut(head) {
                unset_path(sub, rest);
            }
        }
    }
}
