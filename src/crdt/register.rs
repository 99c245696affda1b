//! Last-writer-wins register: a single cell resolved by `(timestamp, origin)`.

use serde_json::Value;

use crate::crdt::{beats, CrdtError, OpKind, OpLog, Operation, VersionVector};

/// Single-value CRDT. Concurrent writes keep the one with the greatest
/// `(timestamp, origin)`; the op log makes re-applies idempotent.
#[derive(Debug, Clone, Default)]
pub struct LwwRegister {
    node_id: String,
    value: Option<Value>,
    timestamp: f64,
    origin: String,
    log: OpLog,
}

impl LwwRegister {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            origin: node_id.clone(),
            node_id,
            value: None,
            timestamp: 0.0,
            log: OpLog::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Set a new value, returning the operation for transmission.
    pub fn set(&mut self, value: Value) -> Result<Operation, CrdtError> {
        let op = Operation::make(self.node_id.clone(), Vec::new(), OpKind::Set, Some(value))?;
        self.apply(&op)?;
        Ok(op)
    }

    /// Apply an operation. Returns `false` when the op id was already seen.
    pub fn apply(&mut self, op: &Operation) -> Result<bool, CrdtError> {
        if self.log.has_seen(&op.id) {
            return Ok(false);
        }
        if op.kind != OpKind::Set {
            return Err(CrdtError::UnsupportedOp {
                crdt: "LwwRegister",
                kind: op.kind,
            });
        }
        op.validate()?;
        if beats(op.timestamp, &op.origin, self.timestamp, &self.origin) {
            self.value = op.value.clone();
            self.timestamp = op.timestamp;
            self.origin = op.origin.clone();
        }
        self.log.record(op.clone());
        Ok(true)
    }

    /// Replay another register's operations into this one.
    pub fn merge(&mut self, other: &LwwRegister) -> Result<(), CrdtError> {
        for op in other.log.operations() {
            self.apply(op)?;
        }
        Ok(())
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn operations(&self) -> &[Operation] {
        self.log.operations()
    }

    pub fn version_vector(&self) -> &VersionVector {
        self.log.vector()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op_at(origin: &str, timestamp: f64, value: Value) -> Operation {
        let mut op = Operation::make(origin, Vec::new(), OpKind::Set, Some(value)).unwrap();
        op.timestamp = timestamp;
        op
    }

    #[test]
    fn test_set_and_read() {
        let mut reg = LwwRegister::new("node-1");
        assert!(reg.value().is_none());
        reg.set(json!("hello")).unwrap();
        assert_eq!(reg.value(), Some(&json!("hello")));
    }

    #[test]
    fn test_later_timestamp_wins() {
        let mut reg = LwwRegister::new("node-1");
        reg.apply(&op_at("a", 2.0, json!("late"))).unwrap();
        reg.apply(&op_at("b", 1.0, json!("early"))).unwrap();
        assert_eq!(reg.value(), Some(&json!("late")));
    }

    #[test]
    fn test_tie_breaks_on_origin() {
        let mut reg = LwwRegister::new("node-1");
        reg.apply(&op_at("a", 1.0, json!("from-a"))).unwrap();
        reg.apply(&op_at("b", 1.0, json!("from-b"))).unwrap();
        assert_eq!(reg.value(), Some(&json!("from-b")));

        // Same ops in the opposite order converge to the same value.
        let mut other = LwwRegister::new("node-2");
        other.apply(&op_at("b", 1.0, json!("from-b"))).unwrap();
        other.apply(&op_at("a", 1.0, json!("from-a"))).unwrap();
        assert_eq!(other.value(), Some(&json!("from-b")));
    }

    #[test]
    fn test_idempotent_apply() {
        let mut reg = LwwRegister::new("node-1");
        let op = op_at("a", 1.0, json!(42));
        assert!(reg.apply(&op).unwrap());
        assert!(!reg.apply(&op).unwrap());
        assert_eq!(reg.operations().len(), 1);
    }

    #[test]
    fn test_unsupported_kind_rejected() {
        let mut reg = LwwRegister::new("node-1");
        let op = Operation::make("a", Vec::new(), OpKind::Delete, None).unwrap();
        assert!(matches!(
            reg.apply(&op),
            Err(CrdtError::UnsupportedOp { crdt: "LwwRegister", .. })
        ));
        assert!(reg.operations().is_empty());
    }

    #[test]
    fn test_merge_replays_operations() {
        let mut a = LwwRegister::new("a");
        let mut b = LwwRegister::new("b");
        a.apply(&op_at("a", 1.0, json!(1))).unwrap();
        b.apply(&op_at("b", 2.0, json!(2))).unwrap();
        a.merge(&b).unwrap();
        b.merge(&a).unwrap();
        assert_eq!(a.value(), b.value());
        assert_eq!(a.value(), Some(&json!(2)));
    }

    #[test]
    fn test_version_vector_tracks_origins() {
        let mut reg = LwwRegister::new("node-1");
        reg.apply(&op_at("a", 3.0, json!(1))).unwrap();
        reg.apply(&op_at("b", 5.0, json!(2))).unwrap();
        assert_eq!(reg.version_vector().get("a"), 3.0);
        assert_eq!(reg.version_vector().get("b"), 5.0);
    }
}
