//! Nested path-addressed last-writer-wins map with tombstones.
//!
//! The primary room data model. Paths address leaves; setting an object at
//! a path flattens it into leaf entries, while arrays and scalars are
//! stored whole. Deletes leave tombstones so a late write with a lower
//! `(timestamp, origin)` cannot resurrect a removed path.
//!
//! ```text
//! set(["u"], {"name": "Alice"})      entries
//!        │ flatten                   ┌──────────────────────────────┐
//!        └────────────────────────►  │ ["u","name"] → ("Alice", t, o)│
//! delete(["u","name"])               └──────────────────────────────┘
//!        │                           tombstones
//!        └────────────────────────►  ["u","name"] → (t, o)
//! ```
//!
//! Materialization rebuilds the nested object from all visible leaves;
//! when a scalar and descendants coexist at a path, the descendants win.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::crdt::{beats, CrdtError, OpKind, OpLog, Operation, VersionVector};
use crate::validate::{self, ValidateError};

#[derive(Debug, Clone, PartialEq)]
struct MapEntry {
    value: Value,
    timestamp: f64,
    origin: String,
}

#[derive(Debug, Clone, PartialEq)]
struct TombstoneEntry {
    timestamp: f64,
    origin: String,
}

/// Wire form of one map entry inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub value: Value,
    pub timestamp: f64,
    pub node_id: String,
}

/// Wire form of one tombstone inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTombstone {
    pub timestamp: f64,
    pub node_id: String,
}

/// Full serialized map state: entries, tombstones, and the operation log.
///
/// Snapshot keys join path segments with "." (a segment containing a
/// literal "." is therefore not reconstructable; known limitation of the
/// wire format). Operation paths inside `operations` stay arrays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapSnapshot {
    #[serde(default)]
    pub entries: BTreeMap<String, SnapshotEntry>,
    #[serde(default)]
    pub tombstones: BTreeMap<String, SnapshotTombstone>,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl MapSnapshot {
    /// Screen every embedded path, key, and value.
    pub fn validate(&self) -> Result<(), ValidateError> {
        for (key, entry) in &self.entries {
            validate::check_path(&split_key(key))?;
            validate::check_value(&entry.value)?;
        }
        for key in self.tombstones.keys() {
            validate::check_path(&split_key(key))?;
        }
        for op in &self.operations {
            op.validate()?;
        }
        Ok(())
    }
}

fn join_key(path: &[String]) -> String {
    path.join(".")
}

fn split_key(key: &str) -> Vec<String> {
    if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').map(str::to_string).collect()
    }
}

/// Insert a leaf into a nested object under `path`, creating intermediate
/// objects. Descendants win: a scalar at an interior position is replaced
/// by an object, and a scalar leaf never overwrites an existing object.
fn insert_nested(root: &mut JsonMap<String, Value>, path: &[String], value: Value) {
    let (last, parents) = match path.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut current = root;
    for key in parents {
        let slot = current
            .entry(key.clone())
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if !slot.is_object() {
            *slot = Value::Object(JsonMap::new());
        }
        current = match slot.as_object_mut() {
            Some(map) => map,
            None => return,
        };
    }
    match current.get(last.as_str()) {
        Some(Value::Object(_)) if !value.is_object() => {}
        _ => {
            current.insert(last.clone(), value);
        }
    }
}

/// Last-writer-wins map keyed by path.
#[derive(Debug, Clone)]
pub struct LwwMap {
    node_id: String,
    entries: HashMap<Vec<String>, MapEntry>,
    tombstones: HashMap<Vec<String>, TombstoneEntry>,
    log: OpLog,
}

impl LwwMap {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            entries: HashMap::new(),
            tombstones: HashMap::new(),
            log: OpLog::new(),
        }
    }

    /// Seed a map from a nested object; leaves carry timestamp 0 so any
    /// real write beats them.
    pub fn with_initial(node_id: impl Into<String>, initial: &Value) -> Result<Self, CrdtError> {
        validate::check_value(initial)?;
        let mut map = Self::new(node_id);
        if initial.is_object() {
            let origin = map.node_id.clone();
            map.apply_set(&[], initial.clone(), 0.0, &origin);
        }
        Ok(map)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Set a value at a path, returning the operation for transmission.
    pub fn set(&mut self, path: Vec<String>, value: Value) -> Result<Operation, CrdtError> {
        let op = Operation::make(self.node_id.clone(), path, OpKind::Set, Some(value))?;
        self.apply(&op)?;
        Ok(op)
    }

    /// Delete the value at a path, returning the operation.
    pub fn delete(&mut self, path: Vec<String>) -> Result<Operation, CrdtError> {
        let op = Operation::make(self.node_id.clone(), path, OpKind::Delete, None)?;
        self.apply(&op)?;
        Ok(op)
    }

    /// Apply an operation. Returns `false` when the op id was already seen.
    pub fn apply(&mut self, op: &Operation) -> Result<bool, CrdtError> {
        if self.log.has_seen(&op.id) {
            return Ok(false);
        }
        op.validate()?;
        match op.kind {
            OpKind::Set => {
                let value = op.value.clone().unwrap_or(Value::Null);
                self.apply_set(&op.path, value, op.timestamp, &op.origin);
            }
            OpKind::Delete => self.apply_delete(&op.path, op.timestamp, &op.origin),
            other => {
                return Err(CrdtError::UnsupportedOp {
                    crdt: "LwwMap",
                    kind: other,
                })
            }
        }
        self.log.record(op.clone());
        Ok(true)
    }

    fn apply_set(&mut self, path: &[String], value: Value, timestamp: f64, origin: &str) {
        match value {
            Value::Object(fields) => {
                // Objects decompose into leaf entries, each with its own
                // ordering test.
                for (key, child) in fields {
                    let mut child_path = path.to_vec();
                    child_path.push(key);
                    self.apply_set(&child_path, child, timestamp, origin);
                }
            }
            leaf => {
                let wins = match self.entries.get(path) {
                    Some(existing) => {
                        beats(timestamp, origin, existing.timestamp, &existing.origin)
                    }
                    None => true,
                };
                if wins {
                    self.entries.insert(
                        path.to_vec(),
                        MapEntry {
                            value: leaf,
                            timestamp,
                            origin: origin.to_string(),
                        },
                    );
                }
            }
        }
    }

    fn apply_delete(&mut self, path: &[String], timestamp: f64, origin: &str) {
        let wins = match self.tombstones.get(path) {
            Some(existing) => beats(timestamp, origin, existing.timestamp, &existing.origin),
            None => true,
        };
        if wins {
            self.tombstones.insert(
                path.to_vec(),
                TombstoneEntry {
                    timestamp,
                    origin: origin.to_string(),
                },
            );
        }
    }

    fn hidden_by_tombstone(&self, path: &[String], entry: &MapEntry) -> bool {
        self.tombstones
            .get(path)
            .map(|tomb| beats(tomb.timestamp, &tomb.origin, entry.timestamp, &entry.origin))
            .unwrap_or(false)
    }

    /// Read the value at a path: a visible leaf entry, or a nested object
    /// reconstructed from descendant entries, or `None`.
    pub fn get(&self, path: &[String]) -> Option<Value> {
        if let Some(tomb) = self.tombstones.get(path) {
            return match self.entries.get(path) {
                Some(entry)
                    if !beats(tomb.timestamp, &tomb.origin, entry.timestamp, &entry.origin) =>
                {
                    Some(entry.value.clone())
                }
                _ => None,
            };
        }
        if let Some(entry) = self.entries.get(path) {
            return Some(entry.value.clone());
        }
        self.get_nested(path)
    }

    fn get_nested(&self, path: &[String]) -> Option<Value> {
        let mut result = JsonMap::new();
        for (entry_path, entry) in &self.entries {
            if entry_path.len() <= path.len() || !entry_path.starts_with(path) {
                continue;
            }
            if self.hidden_by_tombstone(entry_path, entry) {
                continue;
            }
            insert_nested(&mut result, &entry_path[path.len()..], entry.value.clone());
        }
        if result.is_empty() {
            None
        } else {
            Some(Value::Object(result))
        }
    }

    /// Materialize the full nested object.
    ///
    /// Paths containing a blocked key are skipped outright, even if one
    /// slipped into the entry table through an unvalidated channel.
    pub fn value(&self) -> Value {
        let mut root = JsonMap::new();
        for (path, entry) in &self.entries {
            if path.is_empty() {
                continue;
            }
            if !validate::path_is_safe(path) {
                continue;
            }
            if self.hidden_by_tombstone(path, entry) {
                continue;
            }
            insert_nested(&mut root, path, entry.value.clone());
        }
        Value::Object(root)
    }

    /// Replay another map's operations into this one.
    pub fn merge(&mut self, other: &LwwMap) -> Result<(), CrdtError> {
        for op in other.log.operations() {
            self.apply(op)?;
        }
        Ok(())
    }

    /// Serialize entries, tombstones, and the operation log.
    pub fn snapshot(&self) -> MapSnapshot {
        MapSnapshot {
            entries: self
                .entries
                .iter()
                .map(|(path, entry)| {
                    (
                        join_key(path),
                        SnapshotEntry {
                            value: entry.value.clone(),
                            timestamp: entry.timestamp,
                            node_id: entry.origin.clone(),
                        },
                    )
                })
                .collect(),
            tombstones: self
                .tombstones
                .iter()
                .map(|(path, tomb)| {
                    (
                        join_key(path),
                        SnapshotTombstone {
                            timestamp: tomb.timestamp,
                            node_id: tomb.origin.clone(),
                        },
                    )
                })
                .collect(),
            operations: self.log.operations().to_vec(),
        }
    }

    /// Rebuild a map from a snapshot, validating every embedded path and
    /// value first.
    pub fn from_snapshot(
        node_id: impl Into<String>,
        snapshot: MapSnapshot,
    ) -> Result<Self, CrdtError> {
        snapshot.validate()?;
        let mut map = Self::new(node_id);
        for (key, entry) in snapshot.entries {
            map.entries.insert(
                split_key(&key),
                MapEntry {
                    value: entry.value,
                    timestamp: entry.timestamp,
                    origin: entry.node_id,
                },
            );
        }
        for (key, tomb) in snapshot.tombstones {
            map.tombstones.insert(
                split_key(&key),
                TombstoneEntry {
                    timestamp: tomb.timestamp,
                    origin: tomb.node_id,
                },
            );
        }
        for op in snapshot.operations {
            map.log.record(op);
        }
        Ok(map)
    }

    /// Distinct top-level keys with at least one entry, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .filter_map(|path| path.first().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Whether any entry lives under the given top-level key.
    pub fn has(&self, key: &str) -> bool {
        self.entries
            .keys()
            .any(|path| path.first().map(String::as_str) == Some(key))
    }

    pub fn operations(&self) -> &[Operation] {
        self.log.operations()
    }

    /// Operations strictly newer than `timestamp`.
    pub fn operations_since(&self, timestamp: f64) -> Vec<Operation> {
        self.log.since(timestamp)
    }

    pub fn version_vector(&self) -> &VersionVector {
        self.log.vector()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn op_at(origin: &str, timestamp: f64, p: &[&str], kind: OpKind, value: Option<Value>) -> Operation {
        let mut op = Operation::make(origin, path(p), kind, value).unwrap();
        op.timestamp = timestamp;
        op
    }

    #[test]
    fn test_set_and_get_leaf() {
        let mut map = LwwMap::new("node-1");
        map.set(path(&["x"]), json!(1)).unwrap();
        assert_eq!(map.get(&path(&["x"])), Some(json!(1)));
        assert_eq!(map.get(&path(&["missing"])), None);
    }

    #[test]
    fn test_concurrent_scalar_write_tie_break() {
        // S1: equal timestamps, origin "b" > "a" wins on every replica.
        let op_a = op_at("a", 10.0, &["x"], OpKind::Set, Some(json!(1)));
        let op_b = op_at("b", 10.0, &["x"], OpKind::Set, Some(json!(2)));

        let mut first = LwwMap::new("r1");
        first.apply(&op_a).unwrap();
        first.apply(&op_b).unwrap();

        let mut second = LwwMap::new("r2");
        second.apply(&op_b).unwrap();
        second.apply(&op_a).unwrap();

        assert_eq!(first.value(), json!({"x": 2}));
        assert_eq!(second.value(), json!({"x": 2}));
    }

    #[test]
    fn test_nested_object_flattening() {
        // S2: object set flattens; a later write to one leaf leaves the rest.
        let mut map = LwwMap::new("r");
        map.apply(&op_at(
            "a",
            1.0,
            &["u"],
            OpKind::Set,
            Some(json!({"name": "Alice", "age": 30})),
        ))
        .unwrap();
        map.apply(&op_at("b", 2.0, &["u", "name"], OpKind::Set, Some(json!("Bob"))))
            .unwrap();
        assert_eq!(map.value(), json!({"u": {"name": "Bob", "age": 30}}));
        assert_eq!(map.get(&path(&["u", "age"])), Some(json!(30)));
        assert_eq!(map.get(&path(&["u"])), Some(json!({"name": "Bob", "age": 30})));
    }

    #[test]
    fn test_tombstone_beats_lower_timestamped_set() {
        // S3: delete at t=2.0 hides a set inserted later with t=1.5.
        let mut map = LwwMap::new("r");
        map.apply(&op_at("a", 1.0, &["k"], OpKind::Set, Some(json!(1))))
            .unwrap();
        map.apply(&op_at("a", 2.0, &["k"], OpKind::Delete, None)).unwrap();
        map.apply(&op_at("b", 1.5, &["k"], OpKind::Set, Some(json!(2))))
            .unwrap();
        assert_eq!(map.get(&path(&["k"])), None);
        assert_eq!(map.value(), json!({}));
    }

    #[test]
    fn test_set_beating_tombstone_reactivates_path() {
        let mut map = LwwMap::new("r");
        map.apply(&op_at("a", 1.0, &["k"], OpKind::Set, Some(json!(1))))
            .unwrap();
        map.apply(&op_at("a", 2.0, &["k"], OpKind::Delete, None)).unwrap();
        map.apply(&op_at("b", 3.0, &["k"], OpKind::Set, Some(json!(2))))
            .unwrap();
        assert_eq!(map.get(&path(&["k"])), Some(json!(2)));
        assert_eq!(map.value(), json!({"k": 2}));
    }

    #[test]
    fn test_dangerous_path_rejected_and_not_recorded() {
        // S4: prototype-pollution set fails and leaves the map unchanged.
        let mut map = LwwMap::new("r");
        let result = map.set(path(&["__proto__", "polluted"]), json!(true));
        assert!(matches!(result, Err(CrdtError::Validation(_))));
        assert!(map.operations().is_empty());
        assert_eq!(map.value(), json!({}));
    }

    #[test]
    fn test_idempotent_apply() {
        let mut map = LwwMap::new("r");
        let op = op_at("a", 1.0, &["x"], OpKind::Set, Some(json!(1)));
        assert!(map.apply(&op).unwrap());
        assert!(!map.apply(&op).unwrap());
        assert_eq!(map.operations().len(), 1);
        assert_eq!(map.value(), json!({"x": 1}));
    }

    #[test]
    fn test_unsupported_kind_rejected() {
        let mut map = LwwMap::new("r");
        let op = op_at("a", 1.0, &[], OpKind::Increment, Some(json!(1)));
        assert!(matches!(
            map.apply(&op),
            Err(CrdtError::UnsupportedOp { crdt: "LwwMap", .. })
        ));
    }

    #[test]
    fn test_arrays_stored_whole() {
        let mut map = LwwMap::new("r");
        map.set(path(&["tags"]), json!(["a", "b"])).unwrap();
        assert_eq!(map.get(&path(&["tags"])), Some(json!(["a", "b"])));
        assert_eq!(map.value(), json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn test_descendants_win_over_scalar_ancestor() {
        let mut map = LwwMap::new("r");
        map.apply(&op_at("a", 1.0, &["cfg"], OpKind::Set, Some(json!("plain"))))
            .unwrap();
        map.apply(&op_at("b", 1.0, &["cfg", "mode"], OpKind::Set, Some(json!("deep"))))
            .unwrap();
        assert_eq!(map.value(), json!({"cfg": {"mode": "deep"}}));

        // Same two entries applied in the opposite order converge.
        let mut other = LwwMap::new("r2");
        other
            .apply(&op_at("b", 1.0, &["cfg", "mode"], OpKind::Set, Some(json!("deep"))))
            .unwrap();
        other
            .apply(&op_at("a", 1.0, &["cfg"], OpKind::Set, Some(json!("plain"))))
            .unwrap();
        assert_eq!(other.value(), json!({"cfg": {"mode": "deep"}}));
    }

    #[test]
    fn test_merge_converges_any_order() {
        let mut a = LwwMap::new("a");
        let mut b = LwwMap::new("b");
        let ops = vec![
            op_at("a", 1.0, &["x"], OpKind::Set, Some(json!(1))),
            op_at("b", 2.0, &["x"], OpKind::Set, Some(json!(2))),
            op_at("a", 3.0, &["y", "z"], OpKind::Set, Some(json!("deep"))),
            op_at("b", 4.0, &["x"], OpKind::Delete, None),
        ];
        for op in &ops {
            a.apply(op).unwrap();
        }
        for op in ops.iter().rev() {
            b.apply(op).unwrap();
        }
        assert_eq!(a.value(), b.value());
        assert_eq!(a.value(), json!({"y": {"z": "deep"}}));

        let mut c = LwwMap::new("c");
        c.merge(&a).unwrap();
        assert_eq!(c.value(), a.value());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut map = LwwMap::new("r");
        map.apply(&op_at("a", 1.0, &["u", "name"], OpKind::Set, Some(json!("Alice"))))
            .unwrap();
        map.apply(&op_at("a", 2.0, &["u", "age"], OpKind::Set, Some(json!(30))))
            .unwrap();
        map.apply(&op_at("a", 3.0, &["gone"], OpKind::Delete, None)).unwrap();

        let snapshot = map.snapshot();
        assert!(snapshot.entries.contains_key("u.name"));
        assert!(snapshot.tombstones.contains_key("gone"));
        assert_eq!(snapshot.operations.len(), 3);

        let restored = LwwMap::from_snapshot("other", snapshot).unwrap();
        assert_eq!(restored.value(), map.value());

        // Replayed operations stay idempotent after restore.
        let mut restored = restored;
        let replay = map.operations()[0].clone();
        assert!(!restored.apply(&replay).unwrap());
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let mut map = LwwMap::new("r");
        map.set(path(&["a", "b"]), json!([1, 2])).unwrap();
        let raw = serde_json::to_string(&map.snapshot()).unwrap();
        let parsed: MapSnapshot = serde_json::from_str(&raw).unwrap();
        let restored = LwwMap::from_snapshot("r2", parsed).unwrap();
        assert_eq!(restored.value(), map.value());
    }

    #[test]
    fn test_from_snapshot_rejects_dangerous_keys() {
        let mut snapshot = MapSnapshot::default();
        snapshot.entries.insert(
            "__proto__.polluted".to_string(),
            SnapshotEntry {
                value: json!(true),
                timestamp: 1.0,
                node_id: "evil".to_string(),
            },
        );
        assert!(matches!(
            LwwMap::from_snapshot("r", snapshot),
            Err(CrdtError::Validation(_))
        ));
    }

    #[test]
    fn test_value_never_exposes_blocked_keys() {
        // Even an entry smuggled in past validation is skipped.
        let mut map = LwwMap::new("r");
        map.entries.insert(
            path(&["__proto__", "polluted"]),
            MapEntry {
                value: json!(true),
                timestamp: 1.0,
                origin: "evil".to_string(),
            },
        );
        assert_eq!(map.value(), json!({}));
    }

    #[test]
    fn test_keys_and_has() {
        let mut map = LwwMap::new("r");
        map.set(path(&["b", "x"]), json!(1)).unwrap();
        map.set(path(&["a"]), json!(2)).unwrap();
        assert_eq!(map.keys(), vec!["a".to_string(), "b".to_string()]);
        assert!(map.has("a"));
        assert!(map.has("b"));
        assert!(!map.has("c"));
    }

    #[test]
    fn test_with_initial_seeds_at_timestamp_zero() {
        let map = LwwMap::with_initial("r", &json!({"cfg": {"mode": "x"}})).unwrap();
        assert_eq!(map.value(), json!({"cfg": {"mode": "x"}}));
        let mut map = map;
        map.apply(&op_at("a", 1.0, &["cfg", "mode"], OpKind::Set, Some(json!("y"))))
            .unwrap();
        assert_eq!(map.value(), json!({"cfg": {"mode": "y"}}));
    }

    #[test]
    fn test_operations_since() {
        let mut map = LwwMap::new("r");
        map.apply(&op_at("a", 1.0, &["x"], OpKind::Set, Some(json!(1))))
            .unwrap();
        map.apply(&op_at("a", 5.0, &["y"], OpKind::Set, Some(json!(2))))
            .unwrap();
        let newer = map.operations_since(2.0);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].path, path(&["y"]));
    }
}
