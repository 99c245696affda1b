//! Counter CRDTs: grow-only (G-Counter) and positive-negative (PN-Counter).
//!
//! Each origin keeps its own tally; the resolved value is the sum across
//! origins, so concurrent increments never clobber each other.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::{CrdtError, OpKind, OpLog, Operation, VersionVector};

fn amount_of(op: &Operation) -> Result<i64, CrdtError> {
    let amount = op
        .value
        .as_ref()
        .and_then(Value::as_i64)
        .ok_or_else(|| CrdtError::Malformed("counter amount must be an integer".to_string()))?;
    if amount < 0 {
        return Err(CrdtError::Malformed(
            "counter amounts must be non-negative".to_string(),
        ));
    }
    Ok(amount)
}

fn merge_max(into: &mut HashMap<String, i64>, from: &HashMap<String, i64>) {
    for (origin, count) in from {
        let slot = into.entry(origin.clone()).or_insert(0);
        if *count > *slot {
            *slot = *count;
        }
    }
}

/// Serialized G-Counter state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GCounterSnapshot {
    #[serde(default)]
    pub counts: HashMap<String, i64>,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// Grow-only counter; increment only.
#[derive(Debug, Clone, Default)]
pub struct GCounter {
    node_id: String,
    counts: HashMap<String, i64>,
    log: OpLog,
}

impl GCounter {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            counts: HashMap::new(),
            log: OpLog::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn increment(&mut self, amount: i64) -> Result<Operation, CrdtError> {
        if amount < 0 {
            return Err(CrdtError::Malformed(
                "GCounter only supports non-negative increments".to_string(),
            ));
        }
        let op = Operation::make(
            self.node_id.clone(),
            Vec::new(),
            OpKind::Increment,
            Some(Value::from(amount)),
        )?;
        self.apply(&op)?;
        Ok(op)
    }

    pub fn apply(&mut self, op: &Operation) -> Result<bool, CrdtError> {
        if self.log.has_seen(&op.id) {
            return Ok(false);
        }
        if op.kind != OpKind::Increment {
            return Err(CrdtError::UnsupportedOp {
                crdt: "GCounter",
                kind: op.kind,
            });
        }
        let amount = amount_of(op)?;
        *self.counts.entry(op.origin.clone()).or_insert(0) += amount;
        self.log.record(op.clone());
        Ok(true)
    }

    /// Merge by per-origin maximum, then record the other log's unseen ops.
    pub fn merge(&mut self, other: &GCounter) {
        merge_max(&mut self.counts, &other.counts);
        for op in other.log.operations() {
            if !self.log.has_seen(&op.id) {
                self.log.record(op.clone());
            }
        }
    }

    pub fn value(&self) -> i64 {
        self.counts.values().sum()
    }

    pub fn snapshot(&self) -> GCounterSnapshot {
        GCounterSnapshot {
            counts: self.counts.clone(),
            operations: self.log.operations().to_vec(),
        }
    }

    pub fn from_snapshot(node_id: impl Into<String>, snapshot: GCounterSnapshot) -> Self {
        let mut counter = Self::new(node_id);
        counter.counts = snapshot.counts;
        for op in snapshot.operations {
            counter.log.record(op);
        }
        counter
    }

    pub fn operations(&self) -> &[Operation] {
        self.log.operations()
    }

    pub fn version_vector(&self) -> &VersionVector {
        self.log.vector()
    }
}

/// Serialized PN-Counter state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PnCounterSnapshot {
    #[serde(default)]
    pub positive: HashMap<String, i64>,
    #[serde(default)]
    pub negative: HashMap<String, i64>,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// Positive-negative counter: two grow-only tallies, value is their
/// difference.
#[derive(Debug, Clone, Default)]
pub struct PnCounter {
    node_id: String,
    positive: HashMap<String, i64>,
    negative: HashMap<String, i64>,
    log: OpLog,
}

impl PnCounter {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            positive: HashMap::new(),
            negative: HashMap::new(),
            log: OpLog::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn increment(&mut self, amount: i64) -> Result<Operation, CrdtError> {
        self.emit(OpKind::Increment, amount)
    }

    pub fn decrement(&mut self, amount: i64) -> Result<Operation, CrdtError> {
        self.emit(OpKind::Decrement, amount)
    }

    fn emit(&mut self, kind: OpKind, amount: i64) -> Result<Operation, CrdtError> {
        if amount < 0 {
            return Err(CrdtError::Malformed(
                "PnCounter amounts must be non-negative".to_string(),
            ));
        }
        let op = Operation::make(
            self.node_id.clone(),
            Vec::new(),
            kind,
            Some(Value::from(amount)),
        )?;
        self.apply(&op)?;
        Ok(op)
    }

    pub fn apply(&mut self, op: &Operation) -> Result<bool, CrdtError> {
        if self.log.has_seen(&op.id) {
            return Ok(false);
        }
        let tally = match op.kind {
            OpKind::Increment => &mut self.positive,
            OpKind::Decrement => &mut self.negative,
            other => {
                return Err(CrdtError::UnsupportedOp {
                    crdt: "PnCounter",
                    kind: other,
                })
            }
        };
        let amount = amount_of(op)?;
        *tally.entry(op.origin.clone()).or_insert(0) += amount;
        self.log.record(op.clone());
        Ok(true)
    }

    pub fn merge(&mut self, other: &PnCounter) {
        merge_max(&mut self.positive, &other.positive);
        merge_max(&mut self.negative, &other.negative);
        for op in other.log.operations() {
            if !self.log.has_seen(&op.id) {
                self.log.record(op.clone());
            }
        }
    }

    pub fn value(&self) -> i64 {
        let pos: i64 = self.positive.values().sum();
        let neg: i64 = self.negative.values().sum();
        pos - neg
    }

    pub fn snapshot(&self) -> PnCounterSnapshot {
        PnCounterSnapshot {
            positive: self.positive.clone(),
            negative: self.negative.clone(),
            operations: self.log.operations().to_vec(),
        }
    }

    pub fn from_snapshot(node_id: impl Into<String>, snapshot: PnCounterSnapshot) -> Self {
        let mut counter = Self::new(node_id);
        counter.positive = snapshot.positive;
        counter.negative = snapshot.negative;
        for op in snapshot.operations {
            counter.log.record(op);
        }
        counter
    }

    pub fn operations(&self) -> &[Operation] {
        self.log.operations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_g_counter_increment() {
        let mut counter = GCounter::new("a");
        counter.increment(5).unwrap();
        counter.increment(3).unwrap();
        assert_eq!(counter.value(), 8);
    }

    #[test]
    fn test_g_counter_rejects_negative() {
        let mut counter = GCounter::new("a");
        assert!(counter.increment(-1).is_err());
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_g_counter_rejects_other_kinds() {
        let mut counter = GCounter::new("a");
        let op = Operation::make("a", Vec::new(), OpKind::Set, Some(Value::from(1))).unwrap();
        assert!(matches!(
            counter.apply(&op),
            Err(CrdtError::UnsupportedOp { crdt: "GCounter", .. })
        ));
    }

    #[test]
    fn test_g_counter_idempotent_apply() {
        let mut counter = GCounter::new("a");
        let op = counter.increment(2).unwrap();
        assert!(!counter.apply(&op).unwrap());
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn test_g_counter_merge_converges() {
        let mut a = GCounter::new("a");
        let mut b = GCounter::new("b");
        a.increment(4).unwrap();
        b.increment(6).unwrap();
        a.merge(&b);
        b.merge(&a);
        assert_eq!(a.value(), 10);
        assert_eq!(b.value(), 10);

        // Merging twice changes nothing.
        a.merge(&b);
        assert_eq!(a.value(), 10);
    }

    #[test]
    fn test_g_counter_snapshot_roundtrip() {
        let mut counter = GCounter::new("a");
        counter.increment(7).unwrap();
        let restored = GCounter::from_snapshot("b", counter.snapshot());
        assert_eq!(restored.value(), 7);
    }

    #[test]
    fn test_pn_counter_increment_decrement() {
        let mut counter = PnCounter::new("a");
        counter.increment(10).unwrap();
        counter.decrement(3).unwrap();
        assert_eq!(counter.value(), 7);
    }

    #[test]
    fn test_pn_counter_can_go_negative() {
        let mut counter = PnCounter::new("a");
        counter.decrement(5).unwrap();
        assert_eq!(counter.value(), -5);
    }

    #[test]
    fn test_pn_counter_merge_converges() {
        let mut a = PnCounter::new("a");
        let mut b = PnCounter::new("b");
        a.increment(10).unwrap();
        b.decrement(4).unwrap();
        a.merge(&b);
        b.merge(&a);
        assert_eq!(a.value(), 6);
        assert_eq!(b.value(), 6);
    }

    #[test]
    fn test_pn_counter_rejects_other_kinds() {
        let mut counter = PnCounter::new("a");
        let op = Operation::make("a", Vec::new(), OpKind::Add, Some(Value::from(1))).unwrap();
        assert!(matches!(counter.apply(&op), Err(CrdtError::UnsupportedOp { .. })));
    }

    #[test]
    fn test_pn_counter_snapshot_roundtrip() {
        let mut counter = PnCounter::new("a");
        counter.increment(9).unwrap();
        counter.decrement(2).unwrap();
        let restored = PnCounter::from_snapshot("b", counter.snapshot());
        assert_eq!(restored.value(), 7);
    }
}
