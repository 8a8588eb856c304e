//! # Request Gateway
//!
//! The engine is single-writer and single-execution-context: one dedicated
//! worker thread owns the [`Store`] and everything under it, and callers talk
//! to it exclusively through message passing. Requests are processed strictly
//! in FIFO order, one at a time; a request begins only after the previous
//! request's reply has been produced, which makes every operation atomic with
//! respect to the others and their effects visible in submission order.
//!
//! ```text
//! caller A ──┐
//! caller B ──┼── mpsc ──> worker thread ──> Store ──> BufferPool ──> file
//! caller C ──┘            (owns everything, no locks)
//! ```
//!
//! Every request carries a correlation id and a private reply channel. An
//! optional timeout bounds how long the caller waits for the reply; firing it
//! rejects the caller's wait but does not cancel the in-flight operation —
//! the worker completes it and the next request observes the completed state.
//!
//! `close` flushes, releases the store and stops the worker; requests after
//! that answer `Closed`. Dropping the handle without closing lets the worker
//! flush and shut down on its own. `exists` and `destroy` are static and
//! never touch the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::btree::RangeQuery;
use crate::error::{Result, StoreError};
use crate::store::{BulkLoadOptions, Store, StoreConfig, StoreStats};

pub enum Request<K, V> {
    Insert {
        key: K,
        value: V,
    },
    Search {
        key: K,
    },
    Delete {
        key: K,
    },
    Range {
        query: RangeQuery<K>,
    },
    Entries,
    Clear,
    Stats,
    BulkLoad {
        entries: Vec<(K, V)>,
        options: BulkLoadOptions,
        progress: Option<Box<dyn FnMut(usize, usize) + Send>>,
    },
    Verify,
    Flush,
    Close,
}

impl<K, V> Request<K, V> {
    fn op_name(&self) -> &'static str {
        match self {
            Request::Insert { .. } => "insert",
            Request::Search { .. } => "search",
            Request::Delete { .. } => "delete",
            Request::Range { .. } => "range",
            Request::Entries => "entries",
            Request::Clear => "clear",
            Request::Stats => "stats",
            Request::BulkLoad { .. } => "bulk_load",
            Request::Verify => "verify",
            Request::Flush => "flush",
            Request::Close => "close",
        }
    }
}

#[derive(Debug)]
pub enum Reply<K, V> {
    Done,
    Value(Option<V>),
    Removed(bool),
    Entries(Vec<(K, V)>),
    Stats(StoreStats),
    Verified(bool),
}

struct Envelope<K, V> {
    id: u64,
    request: Request<K, V>,
    reply: Sender<(u64, Result<Reply<K, V>>)>,
}

struct HandleShared {
    worker: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

/// Client side of the gateway. Clones share the worker and draw correlation
/// ids from the same sequence; every method is `&self` and internally
/// serialized by the worker.
pub struct StoreHandle<K, V> {
    requests: Sender<Envelope<K, V>>,
    shared: Arc<HandleShared>,
    timeout: Option<Duration>,
}

impl<K, V> std::fmt::Debug for StoreHandle<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

impl<K, V> Clone for StoreHandle<K, V> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            shared: Arc::clone(&self.shared),
            timeout: self.timeout,
        }
    }
}

impl<K, V> StoreHandle<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Starts the worker thread and initializes the store on it: create when
    /// `open_existing` is false, open when true. Fails eagerly if the store
    /// cannot be initialized.
    pub fn spawn(
        name: &str,
        config: StoreConfig<K, V>,
        open_existing: bool,
    ) -> Result<Self> {
        let (req_tx, req_rx) = mpsc::channel::<Envelope<K, V>>();
        let (init_tx, init_rx) = mpsc::channel::<Result<()>>();
        let name = name.to_string();

        let worker = std::thread::Builder::new()
            .name(format!("birchdb-{}", name))
            .spawn(move || {
                let mut store = match Store::initialize(&name, config, open_existing) {
                    Ok(store) => {
                        let _ = init_tx.send(Ok(()));
                        store
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(envelope) = req_rx.recv() {
                    let Envelope { id, request, reply } = envelope;
                    let op = request.op_name();
                    trace!(id, op, "request dispatched");

                    let closing = matches!(request, Request::Close);
                    let result = execute(&mut store, request);
                    // A caller that timed out has dropped its receiver; the
                    // completed state stands either way.
                    let _ = reply.send((id, result));

                    if closing {
                        return;
                    }
                }

                // All handles dropped: flush and release.
                let _ = store.close();
                debug!(name = %name, "gateway worker stopped");
            })
            .map_err(StoreError::Io)?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                requests: req_tx,
                shared: Arc::new(HandleShared {
                    worker: Mutex::new(Some(worker)),
                    next_id: AtomicU64::new(1),
                }),
                timeout: None,
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(StoreError::Closed)
            }
        }
    }

    /// Bounds how long each caller waits for its reply. The worker keeps
    /// executing a timed-out request to completion.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn insert(&self, key: K, value: V) -> Result<()> {
        match self.submit(Request::Insert { key, value })? {
            Reply::Done => Ok(()),
            reply => Err(unexpected_reply("insert", &reply)),
        }
    }

    pub fn search(&self, key: K) -> Result<Option<V>> {
        match self.submit(Request::Search { key })? {
            Reply::Value(value) => Ok(value),
            reply => Err(unexpected_reply("search", &reply)),
        }
    }

    pub fn delete(&self, key: K) -> Result<bool> {
        match self.submit(Request::Delete { key })? {
            Reply::Removed(removed) => Ok(removed),
            reply => Err(unexpected_reply("delete", &reply)),
        }
    }

    pub fn range(&self, query: RangeQuery<K>) -> Result<Vec<(K, V)>> {
        match self.submit(Request::Range { query })? {
            Reply::Entries(entries) => Ok(entries),
            reply => Err(unexpected_reply("range", &reply)),
        }
    }

    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        match self.submit(Request::Entries)? {
            Reply::Entries(entries) => Ok(entries),
            reply => Err(unexpected_reply("entries", &reply)),
        }
    }

    pub fn clear(&self) -> Result<()> {
        match self.submit(Request::Clear)? {
            Reply::Done => Ok(()),
            reply => Err(unexpected_reply("clear", &reply)),
        }
    }

    pub fn stats(&self) -> Result<StoreStats> {
        match self.submit(Request::Stats)? {
            Reply::Stats(stats) => Ok(stats),
            reply => Err(unexpected_reply("stats", &reply)),
        }
    }

    pub fn bulk_load(
        &self,
        entries: Vec<(K, V)>,
        options: BulkLoadOptions,
        progress: Option<Box<dyn FnMut(usize, usize) + Send>>,
    ) -> Result<()> {
        match self.submit(Request::BulkLoad {
            entries,
            options,
            progress,
        })? {
            Reply::Done => Ok(()),
            reply => Err(unexpected_reply("bulk_load", &reply)),
        }
    }

    pub fn verify(&self) -> Result<bool> {
        match self.submit(Request::Verify)? {
            Reply::Verified(ok) => Ok(ok),
            reply => Err(unexpected_reply("verify", &reply)),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match self.submit(Request::Flush)? {
            Reply::Done => Ok(()),
            reply => Err(unexpected_reply("flush", &reply)),
        }
    }

    /// Flushes, releases the store and stops the worker thread.
    pub fn close(&self) -> Result<()> {
        let result = match self.submit(Request::Close) {
            Ok(Reply::Done) => Ok(()),
            Ok(reply) => Err(unexpected_reply("close", &reply)),
            // The worker is already gone.
            Err(StoreError::Closed) => Ok(()),
            Err(e) => Err(e),
        };

        if let Some(worker) = self.shared.worker.lock().take() {
            let _ = worker.join();
        }
        result
    }

    /// Whether a store file exists at `name`. Static: no worker involved.
    pub fn exists(name: &str) -> bool {
        Store::<K, V>::exists(name)
    }

    /// Removes the store file at `name`. Static: no worker involved.
    pub fn destroy(name: &str) -> Result<()> {
        Store::<K, V>::destroy(name)
    }

    fn submit(&self, request: Request<K, V>) -> Result<Reply<K, V>> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let op = request.op_name();
        let (reply_tx, reply_rx) = mpsc::channel();

        self.requests
            .send(Envelope {
                id,
                request,
                reply: reply_tx,
            })
            .map_err(|_| StoreError::Closed)?;

        let (reply_id, result) = match self.timeout {
            Some(timeout) => reply_rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => StoreError::Timeout(op),
                RecvTimeoutError::Disconnected => StoreError::Closed,
            })?,
            None => reply_rx.recv().map_err(|_| StoreError::Closed)?,
        };

        debug_assert_eq!(reply_id, id, "reply correlation id mismatch");
        result
    }
}

fn execute<K, V>(store: &mut Store<K, V>, request: Request<K, V>) -> Result<Reply<K, V>>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    match request {
        Request::Insert { key, value } => store.insert(key, value).map(|()| Reply::Done),
        Request::Search { key } => store.search(&key).map(Reply::Value),
        Request::Delete { key } => store.delete(&key).map(Reply::Removed),
        Request::Range { query } => store.range(query).map(Reply::Entries),
        Request::Entries => store.entries().map(Reply::Entries),
        Request::Clear => store.clear().map(|()| Reply::Done),
        Request::Stats => store.stats().map(Reply::Stats),
        Request::BulkLoad {
            entries,
            options,
            mut progress,
        } => {
            let callback = progress.as_mut().map(|cb| cb as &mut dyn FnMut(usize, usize));
            store.bulk_load(entries, options, callback).map(|()| Reply::Done)
        }
        Request::Verify => store.verify().map(Reply::Verified),
        Request::Flush => store.flush().map(|()| Reply::Done),
        Request::Close => store.close().map(|()| Reply::Done),
    }
}

fn unexpected_reply<K, V>(op: &str, reply: &Reply<K, V>) -> StoreError {
    StoreError::invalid(format!(
        "gateway returned a mismatched reply for '{}': {}",
        op,
        match reply {
            Reply::Done => "done",
            Reply::Value(_) => "value",
            Reply::Removed(_) => "removed",
            Reply::Entries(_) => "entries",
            Reply::Stats(_) => "stats",
            Reply::Verified(_) => "verified",
        }
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{I32Codec, StringCodec};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn config() -> StoreConfig<i32, String> {
        StoreConfig::new(Box::new(I32Codec), Box::new(StringCodec))
            .with_order(4)
            .with_cache_capacity(32)
            .with_page_size(512)
    }

    fn spawn_store(name: &str) -> (TempDir, String, StoreHandle<i32, String>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name).display().to_string();
        let handle = StoreHandle::spawn(&path, config(), false).unwrap();
        (dir, path, handle)
    }

    #[test]
    fn operations_flow_through_the_worker() {
        let (_dir, _path, handle) = spawn_store("g.bt");

        for i in 0..20 {
            handle.insert(i, format!("v{}", i)).unwrap();
        }
        assert_eq!(handle.search(3).unwrap(), Some("v3".into()));
        assert_eq!(handle.search(99).unwrap(), None);
        assert!(handle.delete(3).unwrap());
        assert!(!handle.delete(3).unwrap());
        assert_eq!(handle.entries().unwrap().len(), 19);
        assert!(handle.verify().unwrap());
        handle.close().unwrap();
    }

    #[test]
    fn effects_are_visible_in_submission_order() {
        let (_dir, _path, handle) = spawn_store("g.bt");

        let writer = handle.clone();
        let join = std::thread::spawn(move || {
            for i in 0..100 {
                writer.insert(i, format!("v{}", i)).unwrap();
            }
        });
        join.join().unwrap();

        // Every acknowledged insert is observable afterwards.
        assert_eq!(handle.stats().unwrap().key_count, 100);
        handle.close().unwrap();
    }

    #[test]
    fn spawn_fails_eagerly_on_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.bt").display().to_string();

        let err = StoreHandle::<i32, String>::spawn(&path, config(), true).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn requests_after_close_answer_closed() {
        let (_dir, _path, handle) = spawn_store("g.bt");
        handle.insert(1, "one".into()).unwrap();
        handle.close().unwrap();

        assert!(matches!(handle.insert(2, "two".into()), Err(StoreError::Closed)));
        assert!(matches!(handle.search(1), Err(StoreError::Closed)));
        // close is idempotent
        handle.close().unwrap();
    }

    #[test]
    fn reopen_through_gateway_recovers_state() {
        let (_dir, path, handle) = spawn_store("g.bt");
        for i in 0..10 {
            handle.insert(i, format!("v{}", i)).unwrap();
        }
        handle.close().unwrap();

        let reopened = StoreHandle::<i32, String>::spawn(&path, config(), true).unwrap();
        assert_eq!(reopened.stats().unwrap().key_count, 10);
        assert_eq!(reopened.search(7).unwrap(), Some("v7".into()));
        reopened.close().unwrap();
    }

    #[test]
    fn bulk_load_with_progress_callback() {
        let (_dir, _path, handle) = spawn_store("g.bt");

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let progress: Box<dyn FnMut(usize, usize) + Send> = Box::new(move |done, total| {
            assert!(done <= total);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let entries: Vec<(i32, String)> = (0..50).map(|i| (i, format!("v{}", i))).collect();
        handle
            .bulk_load(
                entries,
                BulkLoadOptions {
                    sorted: true,
                    batch_size: 10,
                },
                Some(progress),
            )
            .unwrap();

        assert!(calls.load(Ordering::SeqCst) > 0);
        assert_eq!(handle.stats().unwrap().key_count, 50);
        assert!(handle.verify().unwrap());
        handle.close().unwrap();
    }

    #[test]
    fn static_exists_and_destroy() {
        let (_dir, path, handle) = spawn_store("g.bt");
        handle.close().unwrap();

        assert!(StoreHandle::<i32, String>::exists(&path));
        StoreHandle::<i32, String>::destroy(&path).unwrap();
        assert!(!StoreHandle::<i32, String>::exists(&path));
    }

    #[test]
    fn dropping_the_handle_flushes_and_stops_the_worker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("g.bt").display().to_string();

        {
            let handle = StoreHandle::spawn(&path, config(), false).unwrap();
            for i in 0..10 {
                handle.insert(i, format!("v{}", i)).unwrap();
            }
            // No close: the worker notices the dropped channel.
        }

        // The worker flushes asynchronously after the channel drops; poll
        // until the re-opened store sees everything.
        let mut recovered = 0;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(40));
            if let Ok(reopened) = StoreHandle::<i32, String>::spawn(&path, config(), true) {
                recovered = reopened.stats().unwrap().key_count;
                reopened.close().unwrap();
                if recovered == 10 {
                    break;
                }
            }
        }
        assert_eq!(recovered, 10);
    }
}
