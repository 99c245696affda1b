//! Conflict-free replicated data types for shared room state.
//!
//! Every mutation is an immutable [`Operation`] identified by a UUID and
//! stamped with `(timestamp, origin)`. Replicas apply operations in any
//! order; conflicts resolve through the strict total order of [`beats`],
//! so all replicas that have seen the same operation set converge on the
//! same value.
//!
//! ```text
//! Operation ──► apply ──► entries / tombstones ──► value()
//!     │
//!     └──► OpLog (dedup by id, version vector, replay for sync)
//! ```
//!
//! - [`register`] — single-cell last-writer-wins register
//! - [`map`] — nested path-addressed LWW map, the room data model
//! - [`counter`] — grow-only and positive-negative counters
//! - [`set`] — add-wins observed-remove set

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::validate::{self, ValidateError};

pub mod counter;
pub mod map;
pub mod register;
pub mod set;

/// Wall-clock seconds since the Unix epoch, as the emitter's timestamp.
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Strict total order on `(timestamp, origin)` pairs.
///
/// A later timestamp wins; equal timestamps fall back to the
/// lexicographically greater origin. Origins are unique per participant,
/// so two distinct operations never compare equal.
pub fn beats(ts_a: f64, origin_a: &str, ts_b: f64, origin_b: &str) -> bool {
    if ts_a != ts_b {
        ts_a > ts_b
    } else {
        origin_a > origin_b
    }
}

/// CRDT operation kinds.
///
/// `Set`/`Delete` drive the register and map; `Increment`/`Decrement` the
/// counters; `Add`/`Remove` the OR-set. Each CRDT rejects kinds it does not
/// understand with [`CrdtError::UnsupportedOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Set,
    Delete,
    Increment,
    Decrement,
    Add,
    Remove,
}

/// CRDT errors.
#[derive(Debug, Error)]
pub enum CrdtError {
    #[error(transparent)]
    Validation(#[from] ValidateError),
    #[error("{crdt} does not support '{kind:?}' operations")]
    UnsupportedOp { crdt: &'static str, kind: OpKind },
    #[error("malformed operation: {0}")]
    Malformed(String),
}

/// A single immutable mutation of a CRDT.
///
/// Wire shape: `{id, timestamp, node_id, path, op_type, value?}`.
/// Equality is by `id`: the same operation delivered twice is the same
/// operation, regardless of any server-side timestamp substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub timestamp: f64,
    #[serde(rename = "node_id")]
    pub origin: String,
    pub path: Vec<String>,
    #[serde(rename = "op_type")]
    pub kind: OpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Operation {}

impl Operation {
    /// Build a new operation with a fresh id and the local wall clock.
    ///
    /// The path and value are validated before the operation exists, so a
    /// dangerous key can never enter an operation log.
    pub fn make(
        origin: impl Into<String>,
        path: Vec<String>,
        kind: OpKind,
        value: Option<Value>,
    ) -> Result<Self, CrdtError> {
        let op = Self {
            id: Uuid::new_v4(),
            timestamp: now_seconds(),
            origin: origin.into(),
            path,
            kind,
            value,
        };
        op.validate()?;
        Ok(op)
    }

    /// Re-run structural validation (used on every decode and apply path).
    pub fn validate(&self) -> Result<(), ValidateError> {
        validate::check_path(&self.path)?;
        if let Some(value) = &self.value {
            validate::check_value(value)?;
        }
        Ok(())
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, CrdtError> {
        serde_json::to_string(self).map_err(|e| CrdtError::Malformed(e.to_string()))
    }

    /// Deserialize from the JSON wire form, validating path and value.
    pub fn decode(raw: &str) -> Result<Self, CrdtError> {
        let op: Self = serde_json::from_str(raw).map_err(|e| CrdtError::Malformed(e.to_string()))?;
        op.validate()?;
        Ok(op)
    }

    /// Deserialize from an already-parsed JSON value.
    pub fn from_json(raw: Value) -> Result<Self, CrdtError> {
        let op: Self =
            serde_json::from_value(raw).map_err(|e| CrdtError::Malformed(e.to_string()))?;
        op.validate()?;
        Ok(op)
    }

    /// Copy of this operation with a substituted timestamp
    /// (server-timestamp mode).
    pub fn with_timestamp(&self, timestamp: f64) -> Self {
        let mut op = self.clone();
        op.timestamp = timestamp;
        op
    }
}

/// Per-origin high-water mark of observed timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    clocks: HashMap<String, f64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the clock for `origin` to `timestamp` if it is higher.
    pub fn update(&mut self, origin: &str, timestamp: f64) {
        let clock = self.clocks.entry(origin.to_string()).or_insert(0.0);
        if timestamp > *clock {
            *clock = timestamp;
        }
    }

    /// Highest timestamp seen from `origin`, or 0 when absent.
    pub fn get(&self, origin: &str) -> f64 {
        self.clocks.get(origin).copied().unwrap_or(0.0)
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &VersionVector) {
        for (origin, timestamp) in &other.clocks {
            self.update(origin, *timestamp);
        }
    }

    pub fn to_map(&self) -> HashMap<String, f64> {
        self.clocks.clone()
    }

    pub fn from_map(map: HashMap<String, f64>) -> Self {
        Self { clocks: map }
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

/// Append-only operation log shared by every CRDT.
///
/// Tracks seen operation ids for idempotent apply, retains the full log for
/// snapshots and partial sync, and keeps the version vector current.
#[derive(Debug, Clone, Default)]
pub struct OpLog {
    ops: Vec<Operation>,
    seen: HashSet<Uuid>,
    vector: VersionVector,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_seen(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    pub fn record(&mut self, op: Operation) {
        self.vector.update(&op.origin, op.timestamp);
        self.seen.insert(op.id);
        self.ops.push(op);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    /// Operations strictly newer than `timestamp`.
    pub fn since(&self, timestamp: f64) -> Vec<Operation> {
        self.ops
            .iter()
            .filter(|op| op.timestamp > timestamp)
            .cloned()
            .collect()
    }

    pub fn vector(&self) -> &VersionVector {
        &self.vector
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
