//! Marshaller — converts in-language values to/from opaque byte blobs.
//!
//! See spec §4.2. Primitives, sequences, and mappings marshal directly.
//! User-defined record types are gated by a per-stream allow-list of
//! fully-qualified names; deserialising a disallowed type is fatal for
//! the stream (folded into [`crate::error::CorruptFrameError`] by the
//! caller).
//!
//! Callables cannot be serialised directly. Per Design Notes
//! ("Callable marshalling"), a closure is published through a
//! [`FuncTable`] instead, which hands back a tagged
//! [`RemoteValue::FuncRef`] — `(origin_stream_id, call_site_id)` — to put
//! on the wire in the closure's place. The receiving side reconstitutes
//! that sentinel as a [`crate::context::FuncProxy`], which performs a
//! synchronous call back through the originating stream when invoked.
//! No attempt is made to serialise arbitrary closures; a `FuncTable` is
//! the explicit, opt-in substitute for the source material's automatic
//! pickle-time interception.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Marshalling/unmarshalling failures.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MarshalError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("record type {0:?} is not on this stream's allow-list")]
    DisallowedRecord(String),
}

/// A dynamically-typed value exchanged between contexts.
///
/// Serialised with `rmp-serde` as a tagged enum — the wire representation
/// is intentionally opaque (spec §1: "object marshalling format choice
/// specified behaviorally, not byte-for-byte").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    #[serde(with = "serde_bytes")]
    Bytes(Vec<u8>),
    Seq(Vec<RemoteValue>),
    Map(Vec<(RemoteValue, RemoteValue)>),
    /// A user-defined record. Gated on deserialisation by the stream's
    /// allow-list.
    Record {
        type_name: String,
        fields: Vec<(String, RemoteValue)>,
    },
    /// Persistent-id substitution for a callable — see module docs.
    FuncRef {
        origin_stream_id: u64,
        call_site_id: u64,
    },
}

impl RemoteValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RemoteValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RemoteValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Per-stream allow-list of fully-qualified record type names permitted
/// to be deserialised. Mirrors `LocalStream._permitted_modules` in the
/// source material, generalised from module names to record type names
/// since Rust has no dynamic unpickling step to gate.
#[derive(Debug, Default)]
pub struct AllowList {
    allowed: HashSet<String>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, type_name: impl Into<String>) {
        self.allowed.insert(type_name.into());
    }

    pub fn is_allowed(&self, type_name: &str) -> bool {
        self.allowed.contains(type_name)
    }

    /// Walk a decoded value and reject any `Record` whose type is not
    /// on the allow-list. Fatal for the stream on rejection (spec §4.2).
    pub fn check(&self, value: &RemoteValue) -> Result<(), MarshalError> {
        match value {
            RemoteValue::Record { type_name, fields } => {
                if !self.is_allowed(type_name) {
                    return Err(MarshalError::DisallowedRecord(type_name.clone()));
                }
                for (_, v) in fields {
                    self.check(v)?;
                }
                Ok(())
            }
            RemoteValue::Seq(items) => {
                for v in items {
                    self.check(v)?;
                }
                Ok(())
            }
            RemoteValue::Map(entries) => {
                for (k, v) in entries {
                    self.check(k)?;
                    self.check(v)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// A closure a [`FuncTable`] holds on behalf of the local side, callable
/// with the arguments and keyword-map a remote [`crate::context::FuncProxy`]
/// sends back.
pub type LocalCallable = Box<dyn Fn(Vec<RemoteValue>, RemoteValue) -> RemoteValue + Send + Sync>;

/// Per-stream table of closures published to the remote side as
/// [`RemoteValue::FuncRef`] sentinels. Mirrors the source material's
/// `_func_refs` map, minus the pickler hook — publishing is explicit
/// here rather than intercepted automatically during encoding.
#[derive(Default)]
pub struct FuncTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, LocalCallable>>,
}

impl FuncTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` and return the [`RemoteValue::FuncRef`] sentinel to
    /// send in its place. `origin_stream_id` identifies the stream a
    /// caller must call back through to reach this table.
    pub fn publish(&self, origin_stream_id: u64, f: LocalCallable) -> RemoteValue {
        let call_site_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(call_site_id, f);
        RemoteValue::FuncRef {
            origin_stream_id,
            call_site_id,
        }
    }

    /// Invoke the closure registered under `call_site_id`, if any.
    /// Called from the handler a [`crate::context::Context`] installs
    /// for [`crate::wire::CALL_FUNC_REF`] — runs on the broker thread,
    /// so registered closures must be fast and non-blocking.
    pub fn invoke(&self, call_site_id: u64, args: Vec<RemoteValue>, kwargs: RemoteValue) -> Option<RemoteValue> {
        let entries = self.entries.lock();
        entries.get(&call_site_id).map(|f| f(args, kwargs))
    }
}

/// Serialise a value to an opaque byte blob.
pub fn encode(value: &RemoteValue) -> Result<Vec<u8>, MarshalError> {
    rmp_serde::to_vec_named(value).map_err(|e| MarshalError::Encode(e.to_string()))
}

/// Deserialise a byte blob back into a value, without allow-list checks
/// (callers apply [`AllowList::check`] themselves once the stream's
/// allow-list is in scope).
pub fn decode(bytes: &[u8]) -> Result<RemoteValue, MarshalError> {
    rmp_serde::from_slice(bytes).map_err(|e| MarshalError::Decode(e.to_string()))
}
