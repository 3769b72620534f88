//! Process-local backend with fault injection.
//!
//! Listings carry metadata only, so every body is loaded through
//! [`RemoteClient::fetch`] the way a real CMS with summary listings behaves.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use syllabus_core::types::{ContentId, ContentPayload, ExternalId, RemoteRecord, Version};

use crate::client::{Cursor, Page, RemoteClient};
use crate::error::RemoteError;
use crate::table::{RemoteTable, StoredRecord};

const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemoteOp {
    List,
    Fetch,
    Create,
    Update,
    Delete,
}

/// When an injected fault fires relative to the operation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTiming {
    /// The call fails without touching the table.
    Before,
    /// The call takes effect but its response is lost.
    After,
}

#[derive(Debug)]
struct Fault {
    op: RemoteOp,
    timing: FaultTiming,
    error: RemoteError,
    remaining: u32,
}

pub type CallHook = Arc<dyn Fn(RemoteOp) + Send + Sync>;

pub struct MemoryRemote {
    table: Mutex<RemoteTable>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<BTreeMap<RemoteOp, u32>>,
    hook: Mutex<Option<CallHook>>,
    page_size: usize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            table: Mutex::new(RemoteTable::default()),
            faults: Mutex::new(Vec::new()),
            calls: Mutex::new(BTreeMap::new()),
            hook: Mutex::new(None),
            page_size: page_size.max(1),
        }
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail(&self, op: RemoteOp, error: RemoteError, times: u32) {
        self.push_fault(op, FaultTiming::Before, error, times);
    }

    /// Let the next `times` calls of `op` take effect, then report `error`.
    pub fn fail_after_apply(&self, op: RemoteOp, error: RemoteError, times: u32) {
        self.push_fault(op, FaultTiming::After, error, times);
    }

    /// Run `hook` at the start of every call, before faults are checked.
    pub fn set_hook(&self, hook: CallHook) {
        *lock(&self.hook) = Some(hook);
    }

    /// Number of calls made to `op` so far, including failed ones.
    pub fn calls(&self, op: RemoteOp) -> u32 {
        lock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Editor access
    // -----------------------------------------------------------------------

    pub fn author(&self, path: &str, body: &str) -> Result<ExternalId, RemoteError> {
        self.author_at(path, body, Utc::now())
    }

    pub fn author_at(
        &self,
        path: &str,
        body: &str,
        at: DateTime<Utc>,
    ) -> Result<ExternalId, RemoteError> {
        lock(&self.table).author(path, body, at)
    }

    pub fn edit(&self, external_id: &ExternalId, body: &str) -> Result<Version, RemoteError> {
        self.edit_at(external_id, body, Utc::now())
    }

    pub fn edit_at(
        &self,
        external_id: &ExternalId,
        body: &str,
        at: DateTime<Utc>,
    ) -> Result<Version, RemoteError> {
        lock(&self.table).edit(external_id, body, at)
    }

    pub fn remove(&self, external_id: &ExternalId) {
        lock(&self.table).delete(external_id);
    }

    pub fn find(&self, id: &ContentId) -> Option<StoredRecord> {
        lock(&self.table).find_by_content_id(id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.table).is_empty()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn push_fault(&self, op: RemoteOp, timing: FaultTiming, error: RemoteError, times: u32) {
        if times == 0 {
            return;
        }
        lock(&self.faults).push(Fault {
            op,
            timing,
            error,
            remaining: times,
        });
    }

    fn take_fault(&self, op: RemoteOp, timing: FaultTiming) -> Option<RemoteError> {
        let mut faults = lock(&self.faults);
        let pos = faults
            .iter()
            .position(|f| f.op == op && f.timing == timing)?;
        faults[pos].remaining -= 1;
        let error = faults[pos].error.clone();
        if faults[pos].remaining == 0 {
            faults.remove(pos);
        }
        Some(error)
    }

    fn call<T>(
        &self,
        op: RemoteOp,
        body: impl FnOnce(&mut RemoteTable) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        *lock(&self.calls).entry(op).or_default() += 1;
        let hook = lock(&self.hook).clone();
        if let Some(hook) = hook {
            hook(op);
        }
        if let Some(err) = self.take_fault(op, FaultTiming::Before) {
            tracing::debug!(?op, error = %err, "injected fault");
            return Err(err);
        }
        let result = body(&mut lock(&self.table));
        if result.is_ok() {
            if let Some(err) = self.take_fault(op, FaultTiming::After) {
                tracing::debug!(?op, error = %err, "injected fault after apply");
                return Err(err);
            }
        }
        result
    }
}

impl RemoteClient for MemoryRemote {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn list_since(&self, cursor: Option<&Cursor>) -> Result<Page, RemoteError> {
        let page_size = self.page_size;
        self.call(RemoteOp::List, |t| Ok(t.list_page(cursor, page_size, false)))
    }

    fn fetch(&self, external_id: &ExternalId) -> Result<RemoteRecord, RemoteError> {
        self.call(RemoteOp::Fetch, |t| t.fetch(external_id))
    }

    fn create(
        &self,
        key: &ContentId,
        payload: &ContentPayload,
    ) -> Result<RemoteRecord, RemoteError> {
        self.call(RemoteOp::Create, |t| t.create(key, payload, Utc::now()))
    }

    fn update(
        &self,
        external_id: &ExternalId,
        payload: &ContentPayload,
        expected: Version,
    ) -> Result<Version, RemoteError> {
        self.call(RemoteOp::Update, |t| {
            t.update(external_id, payload, expected, Utc::now())
        })
    }

    fn delete(&self, external_id: &ExternalId) -> Result<(), RemoteError> {
        self.call(RemoteOp::Delete, |t| {
            t.delete(external_id);
            Ok(())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(path: &str, body: &str) -> ContentPayload {
        ContentPayload {
            path: path.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn injected_fault_fires_the_requested_number_of_times() {
        let remote = MemoryRemote::new();
        remote.fail(RemoteOp::List, RemoteError::Transient("503".into()), 2);

        assert!(remote.list_since(None).is_err());
        assert!(remote.list_since(None).is_err());
        assert!(remote.list_since(None).is_ok());
        assert_eq!(remote.calls(RemoteOp::List), 3);
    }

    #[test]
    fn lost_create_response_is_safe_to_retry() {
        let remote = MemoryRemote::new();
        remote.fail_after_apply(RemoteOp::Create, RemoteError::Transient("timeout".into()), 1);
        let key = ContentId::from("intro");

        assert!(remote.create(&key, &payload("intro.md", "x\n")).is_err());
        assert_eq!(remote.len(), 1);

        let rec = remote.create(&key, &payload("intro.md", "x\n")).expect("retry");
        assert_eq!(remote.len(), 1);
        assert_eq!(rec.version, Version(1));
    }

    #[test]
    fn listing_omits_bodies_but_fetch_fills_them() {
        let remote = MemoryRemote::new();
        let ext = remote.author("a.md", "alpha\n").expect("author");
        let page = remote.list_since(None).expect("list");
        assert_eq!(page.records.len(), 1);
        assert!(page.records[0].body.is_none());
        let full = remote.fetch(&ext).expect("fetch");
        assert_eq!(full.body.as_deref(), Some("alpha\n"));
    }

    #[test]
    fn hook_sees_every_call() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let remote = MemoryRemote::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        remote.set_hook(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let _ = remote.list_since(None);
        let _ = remote.delete(&ExternalId::from("missing"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
