use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use memcct_protocol::{MethodId, SharedStr};
use serde::{Deserialize, Serialize};

use crate::client::ProfilerClient;

/// Class, method and signature of a call frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodNames {
    pub class_name: SharedStr,
    pub method_name: SharedStr,
    pub signature: SharedStr,
}

impl MethodNames {
    pub fn new(
        class_name: impl Into<SharedStr>,
        method_name: impl Into<SharedStr>,
        signature: impl Into<SharedStr>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            signature: signature.into(),
        }
    }

    /// Placeholder for ids the agent could not resolve.
    pub fn unknown(id: MethodId) -> Self {
        Self::new("<unknown>", format!("<method #{}>", id.0), "")
    }

    /// `pkg.Class.method(sig)` as shown in trees and exports.
    pub fn display_name(&self) -> String {
        if self.method_name.is_empty() {
            return self.class_name.to_string();
        }
        format!("{}.{}{}", self.class_name, self.method_name, self.signature)
    }
}

#[derive(Debug, Default)]
struct TableState {
    resolved: HashMap<MethodId, MethodNames>,
    pending: Vec<MethodId>,
    pending_set: HashSet<MethodId>,
    /// Ids of the batch currently out at the client.
    in_flight: HashSet<MethodId>,
    batches: usize,
}

impl TableState {
    fn is_known(&self, id: MethodId) -> bool {
        self.resolved.contains_key(&id) || self.in_flight.contains(&id)
    }
}

/// Method id to name mapping filled lazily from the agent.
///
/// Ids are registered as they appear in stack traces. The first request
/// for any unresolved id resolves every pending id in a single client
/// call; an id is never requested twice, even when the call fails.
///
/// The client call runs without the lock held, so the event thread can keep
/// registering ids. At most one batch is out at a time; other lookups wait
/// for it on `batch_done`.
pub struct MethodIdTable {
    state: Mutex<TableState>,
    batch_done: Condvar,
    client: Option<Arc<dyn ProfilerClient>>,
}

impl MethodIdTable {
    pub fn new(client: Arc<dyn ProfilerClient>) -> Self {
        Self {
            state: Mutex::default(),
            batch_done: Condvar::new(),
            client: Some(client),
        }
    }

    /// Table without a live target, e.g. for a snapshot loaded from disk.
    pub fn offline() -> Self {
        Self {
            state: Mutex::default(),
            batch_done: Condvar::new(),
            client: None,
        }
    }

    pub fn from_resolved(entries: impl IntoIterator<Item = (MethodId, MethodNames)>) -> Self {
        let table = Self::offline();
        table.lock().resolved.extend(entries);
        table
    }

    /// Note an id seen in the event stream without resolving it.
    pub fn check_method_id(&self, id: MethodId) {
        let mut state = self.lock();
        if !state.is_known(id) && state.pending_set.insert(id) {
            state.pending.push(id);
        }
    }

    pub fn insert_resolved(&self, id: MethodId, names: MethodNames) {
        let mut state = self.lock();
        if state.pending_set.remove(&id) {
            state.pending.retain(|&p| p != id);
        }
        state.resolved.insert(id, names);
    }

    pub fn names(&self, id: MethodId) -> MethodNames {
        let mut state = self.lock();
        loop {
            if let Some(names) = state.resolved.get(&id) {
                return names.clone();
            }
            if state.in_flight.is_empty() {
                break;
            }
            state = self.wait_for_batch(state);
        }
        if state.pending_set.insert(id) {
            state.pending.push(id);
        }
        self.resolve_batch(state);
        self.lock()
            .resolved
            .get(&id)
            .cloned()
            .unwrap_or_else(|| MethodNames::unknown(id))
    }

    /// Resolve everything still pending in one batch.
    pub fn resolve_pending(&self) {
        self.resolve_batch(self.lock());
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of batched client calls made so far.
    pub fn batches_requested(&self) -> usize {
        self.lock().batches
    }

    /// All resolved entries, sorted by id.
    pub fn resolved_entries(&self) -> Vec<(MethodId, MethodNames)> {
        let mut entries: Vec<_> = self
            .lock()
            .resolved
            .iter()
            .map(|(id, names)| (*id, names.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    fn resolve_batch(&self, mut state: MutexGuard<'_, TableState>) {
        while !state.in_flight.is_empty() {
            state = self.wait_for_batch(state);
        }
        if state.pending.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut state.pending);
        state.pending_set.clear();

        let Some(client) = self.client.clone() else {
            for &id in &ids {
                state.resolved.entry(id).or_insert_with(|| MethodNames::unknown(id));
            }
            return;
        };
        state.batches += 1;
        state.in_flight.extend(ids.iter().copied());
        drop(state);

        let batch = InFlightBatch { table: self, ids: &ids };
        let resolved = match client.method_names_for_ids(&ids) {
            Ok(names) => names,
            Err(err) => {
                tracing::warn!(count = ids.len(), error = %err, "method name lookup failed");
                Vec::new()
            }
        };
        tracing::debug!(requested = ids.len(), resolved = resolved.len(), "resolved method names");

        let mut state = self.lock();
        for (&id, names) in ids.iter().zip(resolved) {
            state.resolved.entry(id).or_insert(names);
        }
        drop(state);
        drop(batch);
    }

    fn wait_for_batch<'a>(&self, state: MutexGuard<'a, TableState>) -> MutexGuard<'a, TableState> {
        self.batch_done
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Closes a batch even if the client call unwinds: ids the client did not
/// answer get placeholders and waiting lookups are woken.
struct InFlightBatch<'a> {
    table: &'a MethodIdTable,
    ids: &'a [MethodId],
}

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        let mut state = self.table.lock();
        for &id in self.ids {
            state.in_flight.remove(&id);
            state.resolved.entry(id).or_insert_with(|| MethodNames::unknown(id));
        }
        drop(state);
        self.table.batch_done.notify_all();
    }
}

impl std::fmt::Debug for MethodIdTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MethodIdTable")
            .field("resolved", &state.resolved.len())
            .field("pending", &state.pending.len())
            .field("online", &self.client.is_some())
            .finish()
    }
}
