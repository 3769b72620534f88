//! Remote-side gathering: paginated listing and concurrent body prefetch.
//!
//! Reads are order-independent, so bodies are fetched by a bounded pool of
//! scoped worker threads. Nothing here writes to either store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use syllabus_core::types::{ContentId, ExternalId, RemoteRecord};
use syllabus_remote::{Cursor, RemoteClient, RemoteError};

use crate::diff::{remote_side_changed, RemoteView};
use crate::error::SyncError;
use crate::retry::Retrier;
use crate::state_store::SyncState;

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Lazy, retrying iterator over every remote record.
///
/// A page that fails transiently is retried from the cursor that produced
/// it, so records already yielded are never requested again.
pub struct Listing<'a> {
    remote: &'a dyn RemoteClient,
    retrier: &'a Retrier,
    cursor: Option<Cursor>,
    buffer: std::vec::IntoIter<RemoteRecord>,
    done: bool,
    pages: u32,
}

impl<'a> Listing<'a> {
    pub fn new(remote: &'a dyn RemoteClient, retrier: &'a Retrier) -> Self {
        Self {
            remote,
            retrier,
            cursor: None,
            buffer: Vec::new().into_iter(),
            done: false,
            pages: 0,
        }
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    fn next_page(&mut self) -> Result<(), SyncError> {
        let remote = self.remote;
        let cursor = self.cursor.clone();
        let page = self
            .retrier
            .call("list", || remote.list_since(cursor.as_ref()))?;
        self.pages += 1;
        if page.next.is_some() && page.next == cursor {
            return Err(SyncError::Permanent(RemoteError::Permanent(format!(
                "pagination did not advance past cursor {}",
                cursor.map(|c| c.0).unwrap_or_default()
            ))));
        }
        tracing::debug!(page = self.pages, records = page.records.len(), "listed remote page");
        self.done = page.next.is_none();
        self.cursor = page.next;
        self.buffer = page.records.into_iter();
        Ok(())
    }
}

impl Iterator for Listing<'_> {
    type Item = Result<RemoteRecord, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.next() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.next_page() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// Collect the full remote listing keyed by local id.
///
/// Records the state already maps are keyed by that mapping; others by the
/// content id the backend reports.
pub fn list_remote(
    remote: &dyn RemoteClient,
    retrier: &Retrier,
    state: &SyncState,
) -> Result<RemoteView, SyncError> {
    let mut view = RemoteView::new();
    for record in Listing::new(remote, retrier) {
        let record = record?;
        let id = state
            .by_external_id(&record.external_id)
            .map(|e| e.id.clone())
            .unwrap_or_else(|| record.content_id.clone());
        if let Some(existing) = view.get(&id) {
            return Err(SyncError::Permanent(RemoteError::Permanent(format!(
                "remote records {} and {} both claim content id '{id}'",
                existing.external_id, record.external_id
            ))));
        }
        view.insert(id, record);
    }
    Ok(view)
}

// ---------------------------------------------------------------------------
// Prefetch
// ---------------------------------------------------------------------------

/// Fetch bodies for every changed record the listing returned without one.
///
/// Runs up to `workers` fetches at a time. The first failure stops the pool
/// from starting new fetches and is returned once in-flight ones finish.
pub fn prefetch(
    remote: &dyn RemoteClient,
    retrier: &Retrier,
    view: &mut RemoteView,
    state: &SyncState,
    workers: usize,
) -> Result<usize, SyncError> {
    let jobs: VecDeque<(ContentId, ExternalId)> = view
        .iter()
        .filter(|(id, rec)| rec.body.is_none() && remote_side_changed(rec, state.get(id)))
        .map(|(id, rec)| (id.clone(), rec.external_id.clone()))
        .collect();
    if jobs.is_empty() {
        return Ok(0);
    }
    let total = jobs.len();
    let workers = workers.clamp(1, total);

    let queue = Mutex::new(jobs);
    let failed = AtomicBool::new(false);
    let fetched: Mutex<Vec<(ContentId, RemoteRecord)>> = Mutex::new(Vec::with_capacity(total));
    let first_error: Mutex<Option<SyncError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if failed.load(Ordering::SeqCst) {
                    return;
                }
                let job = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                let Some((id, external_id)) = job else {
                    return;
                };
                match retrier.call("fetch", || remote.fetch(&external_id)) {
                    Ok(record) => fetched
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((id, record)),
                    Err(e) => {
                        failed.store(true, Ordering::SeqCst);
                        first_error
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(e);
                        return;
                    }
                }
            });
        }
    });

    if let Some(err) = first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
        return Err(err);
    }
    let fetched = fetched.into_inner().unwrap_or_else(PoisonError::into_inner);
    for (id, record) in fetched {
        view.insert(id, record);
    }
    tracing::debug!(fetched = total, workers, "prefetched remote bodies");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use syllabus_core::config::RetrySettings;
    use syllabus_remote::{MemoryRemote, RemoteOp};

    use crate::retry::CancelFlag;

    fn remote_with(n: usize, page_size: usize) -> MemoryRemote {
        let remote = MemoryRemote::with_page_size(page_size);
        for i in 0..n {
            remote
                .author(&format!("item{i:02}.md"), &format!("body {i}\n"))
                .expect("author");
        }
        remote
    }

    #[test]
    fn listing_walks_every_page() {
        let remote = remote_with(7, 3);
        let retrier = Retrier::new(&RetrySettings::immediate(3), CancelFlag::new());
        let mut listing = Listing::new(&remote, &retrier);
        let records: Vec<_> = listing.by_ref().collect::<Result<_, _>>().expect("list");
        assert_eq!(records.len(), 7);
        assert_eq!(listing.pages(), 3);
    }

    #[test]
    fn failed_page_resumes_from_its_cursor() {
        let remote = remote_with(6, 2);
        let retrier = Retrier::new(&RetrySettings::immediate(3), CancelFlag::new());
        let mut listing = Listing::new(&remote, &retrier);
        let first = listing.next().expect("item").expect("ok");
        remote.fail(RemoteOp::List, RemoteError::Transient("502".into()), 1);

        let rest: Vec<_> = listing.collect::<Result<_, _>>().expect("rest");
        assert_eq!(rest.len(), 5);
        assert!(rest.iter().all(|r| r.external_id != first.external_id));
        // 3 pages plus one failed attempt.
        assert_eq!(remote.calls(RemoteOp::List), 4);
    }

    #[test]
    fn prefetch_fills_changed_bodies_only() {
        let remote = remote_with(5, 10);
        let retrier = Retrier::new(&RetrySettings::immediate(3), CancelFlag::new());
        let state = SyncState::default();
        let mut view = list_remote(&remote, &retrier, &state).expect("list");
        assert!(view.values().all(|r| r.body.is_none()));

        let n = prefetch(&remote, &retrier, &mut view, &state, 3).expect("prefetch");
        assert_eq!(n, 5);
        assert!(view.values().all(|r| r.body.is_some()));
        assert_eq!(remote.calls(RemoteOp::Fetch), 5);
    }

    #[test]
    fn prefetch_surfaces_permanent_failure() {
        let remote = remote_with(4, 10);
        let retrier = Retrier::new(&RetrySettings::immediate(3), CancelFlag::new());
        let state = SyncState::default();
        let mut view = list_remote(&remote, &retrier, &state).expect("list");
        remote.fail(RemoteOp::Fetch, RemoteError::Permanent("403".into()), 1);

        let err = prefetch(&remote, &retrier, &mut view, &state, 2).unwrap_err();
        assert!(matches!(err, SyncError::Permanent(_)));
    }
}
