//! Observed-remove set (OR-Set) with add-wins semantics.
//!
//! Each add carries a unique tag (the operation id); a remove only retires
//! the tags it has observed. An add concurrent with a remove therefore
//! survives, because its tag was not observed by the remover.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::crdt::{CrdtError, OpKind, OpLog, Operation};

/// Deterministic key for any JSON value. serde_json keeps object keys
/// sorted, so equal values always serialize identically.
fn value_key(value: &Value) -> String {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Add-wins set of JSON values.
#[derive(Debug, Clone, Default)]
pub struct OrSet {
    node_id: String,
    elements: HashMap<String, Vec<(Uuid, Value)>>,
    removed: HashSet<Uuid>,
    log: OpLog,
}

impl OrSet {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            elements: HashMap::new(),
            removed: HashSet::new(),
            log: OpLog::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Add an element, returning the operation for transmission.
    pub fn add(&mut self, value: Value) -> Result<Operation, CrdtError> {
        let op = Operation::make(self.node_id.clone(), Vec::new(), OpKind::Add, Some(value))?;
        self.apply(&op)?;
        Ok(op)
    }

    /// Remove an element. Only the tags observed locally are retired, so a
    /// concurrent add elsewhere survives.
    pub fn remove(&mut self, value: &Value) -> Result<Operation, CrdtError> {
        let tags: Vec<String> = self
            .live_tags(value)
            .into_iter()
            .map(|tag| tag.to_string())
            .collect();
        let op = Operation::make(
            self.node_id.clone(),
            Vec::new(),
            OpKind::Remove,
            Some(json!({ "element": value, "tags": tags })),
        )?;
        self.apply(&op)?;
        Ok(op)
    }

    fn live_tags(&self, value: &Value) -> Vec<Uuid> {
        self.elements
            .get(&value_key(value))
            .map(|tagged| {
                tagged
                    .iter()
                    .filter(|(tag, _)| !self.removed.contains(tag))
                    .map(|(tag, _)| *tag)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn apply(&mut self, op: &Operation) -> Result<bool, CrdtError> {
        if self.log.has_seen(&op.id) {
            return Ok(false);
        }
        match op.kind {
            OpKind::Add => self.apply_add(op),
            OpKind::Remove => self.apply_remove(op),
            other => {
                return Err(CrdtError::UnsupportedOp {
                    crdt: "OrSet",
                    kind: other,
                })
            }
        }
        self.log.record(op.clone());
        Ok(true)
    }

    fn apply_add(&mut self, op: &Operation) {
        let value = op.value.clone().unwrap_or(Value::Null);
        let tagged = self.elements.entry(value_key(&value)).or_default();
        if !tagged.iter().any(|(tag, _)| *tag == op.id) {
            tagged.push((op.id, value));
        }
    }

    fn apply_remove(&mut self, op: &Operation) {
        let tags = op
            .value
            .as_ref()
            .and_then(|v| v.get("tags"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for tag in tags {
            if let Some(parsed) = tag.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                self.removed.insert(parsed);
            }
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        !self.live_tags(value).is_empty()
    }

    /// Current contents, one instance per distinct value.
    pub fn to_vec(&self) -> Vec<Value> {
        let mut result = Vec::new();
        for tagged in self.elements.values() {
            if let Some((_, value)) = tagged.iter().find(|(tag, _)| !self.removed.contains(tag)) {
                result.push(value.clone());
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.elements
            .values()
            .filter(|tagged| tagged.iter().any(|(tag, _)| !self.removed.contains(tag)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union elements and retired tags, then record unseen operations.
    pub fn merge(&mut self, other: &OrSet) {
        for (key, tagged) in &other.elements {
            let slot = self.elements.entry(key.clone()).or_default();
            for (tag, value) in tagged {
                if !slot.iter().any(|(existing, _)| existing == tag) {
                    slot.push((*tag, value.clone()));
                }
            }
        }
        self.removed.extend(other.removed.iter().copied());
        for op in other.log.operations() {
            if !self.log.has_seen(&op.id) {
                self.log.record(op.clone());
            }
        }
    }

    pub fn operations(&self) -> &[Operation] {
        self.log.operations()
    }
}
