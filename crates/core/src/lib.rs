//! Katafygio core types — notifications and canonical object keys

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Kind of change conveyed by a [`Notification`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Upsert,
    Delete,
}

/// A single object change, sent from a watch controller to the recorder.
///
/// `bytes` holds the stripped YAML serialization for [`Action::Upsert`]
/// and is empty for [`Action::Delete`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub action: Action,
    /// Canonical key: `<namespace>/<name>`, or `<name>` when cluster-scoped.
    pub key: String,
    /// Lowercased kind.
    pub kind: String,
    pub bytes: Vec<u8>,
}

impl Notification {
    pub fn upsert(kind: impl Into<String>, key: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { action: Action::Upsert, key: key.into(), kind: kind.into(), bytes }
    }

    pub fn delete(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self { action: Action::Delete, key: key.into(), kind: kind.into(), bytes: Vec::new() }
    }
}

pub type NotifySender = mpsc::Sender<Notification>;
pub type NotifyReceiver = mpsc::Receiver<Notification>;

/// Create the controllers → recorder channel.
///
/// Capacity 1 gives rendezvous semantics: a send completes only once the
/// recorder has drained the slot, so a slow recorder throttles every
/// controller instead of queueing unbounded memory.
pub fn notifier() -> (NotifySender, NotifyReceiver) {
    mpsc::channel(1)
}

/// Build the canonical key for an object.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Name component of a canonical key.
pub fn key_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Namespace component of a canonical key, if any.
pub fn key_namespace(key: &str) -> Option<&str> {
    key.rsplit_once('/').map(|(ns, _)| ns)
}

pub mod prelude {
    pub use super::{notifier, object_key, Action, Notification, NotifyReceiver, NotifySender};
}
