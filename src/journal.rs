//! Ordered event journal for mutating image ops.
//!
//! Mutating requests append an event describing the op before anything is
//! sent to the object layer. The built-but-unsent object requests ride along
//! with the event and are released only once the backing log reports the
//! entry durable, so a crash can always be recovered to a prefix of the
//! journaled history. A failed append bubbles up as the request's failure and
//! its object requests are never sent.
//!
//! Lifecycle:
//!
//! ```text
//! Uninitialized -> Initializing -> Replaying -> Ready -> Closing -> Closed
//!                       |               |          ^
//!                       |               v          |
//!                       \------ RestartingReplay --/   (append error retry)
//!
//! Replaying/Initializing + close() -> Stopping -> Closing -> Closed
//! ```
//!
//! `Ready` and `Closed` are the steady states; `wait_for_steady_state`
//! callbacks fire on entry to either.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustix::io::Errno;
use tokio::runtime::Handle;

use crate::completion::AioCompletion;
use crate::object_request::ObjectRequest;

pub type JournalTid = u64;

/// One journaled mutating event. Write events log the full payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEntry {
    AioWrite { off: u64, len: u64, data: Bytes },
    AioDiscard { off: u64, len: u64 },
    AioFlush,
}

/// Backing log consumed by interface. Entries are handed over as structs;
/// wire encoding and durable storage are the log's concern.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Recover previously recorded entries, oldest first.
    async fn open(&self) -> Result<Vec<(JournalTid, EventEntry)>, Errno>;

    /// Persist one entry; resolves once it is durable.
    async fn append(&self, tid: JournalTid, entry: EventEntry) -> Result<(), Errno>;

    async fn close(&self) -> Result<(), Errno>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Initializing,
    Replaying,
    RestartingReplay,
    Ready,
    Stopping,
    Closing,
    Closed,
}

impl State {
    fn is_steady(self) -> bool {
        matches!(self, State::Ready | State::Closed)
    }
}

type OnSafe = Box<dyn FnOnce(Result<(), Errno>) + Send>;
type OnState = Box<dyn FnOnce() + Send>;

struct Event {
    comp: Arc<AioCompletion>,
    requests: Vec<ObjectRequest>,
    on_safe: Vec<OnSafe>,
}

struct Inner {
    state: State,
    restarted: bool,
    close_pending: bool,
    next_tid: JournalTid,
    events: HashMap<JournalTid, Event>,
    replay_entries: Vec<(JournalTid, EventEntry)>,
    state_waiters: Vec<OnState>,
    on_open: Option<OnSafe>,
    on_close: Option<OnSafe>,
}

pub struct Journal {
    log: Arc<dyn EventLog>,
    runtime: Handle,
    inner: Mutex<Inner>,
}

impl Journal {
    pub fn new(log: Arc<dyn EventLog>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            log,
            runtime,
            inner: Mutex::new(Inner {
                state: State::Uninitialized,
                restarted: false,
                close_pending: false,
                next_tid: 1,
                events: HashMap::new(),
                replay_entries: Vec::new(),
                state_waiters: Vec::new(),
                on_open: None,
                on_close: None,
            }),
        })
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == State::Ready
    }

    /// Entries recovered by the last open, for the embedder to replay.
    pub fn replay_entries(&self) -> Vec<(JournalTid, EventEntry)> {
        self.inner.lock().replay_entries.clone()
    }

    /// Fire `on_state` once the journal reaches a steady state (`Ready` or
    /// `Closed`); immediately if it already is in one.
    pub fn wait_for_steady_state(&self, on_state: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        if inner.state.is_steady() {
            drop(inner);
            on_state();
        } else {
            inner.state_waiters.push(Box::new(on_state));
        }
    }

    /// Open the backing log and recover its entries. `on_open` fires once
    /// the journal is `Ready` (or has given up).
    pub fn open(self: &Arc<Self>, on_open: impl FnOnce(Result<(), Errno>) + Send + 'static) {
        {
            let mut inner = self.inner.lock();
            assert_eq!(inner.state, State::Uninitialized, "journal already opened");
            inner.state = State::Initializing;
            inner.on_open = Some(Box::new(on_open));
        }
        self.spawn_open();
    }

    fn spawn_open(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = this.log.open().await;
            this.handle_initialized(result);
        });
    }

    fn handle_initialized(self: &Arc<Self>, result: Result<Vec<(JournalTid, EventEntry)>, Errno>) {
        match result {
            Ok(entries) => {
                {
                    let mut inner = self.inner.lock();
                    self.transition(&mut inner, State::Replaying);
                    inner.next_tid = entries.iter().map(|(tid, _)| tid + 1).max().unwrap_or(1);
                    inner.replay_entries = entries;
                }
                self.handle_replay_complete();
            }
            Err(err) => {
                let mut inner = self.inner.lock();
                if !inner.restarted {
                    // One restart attempt before giving up.
                    log::error!("journal open failed, restarting replay: {err:?}");
                    inner.restarted = true;
                    self.transition(&mut inner, State::RestartingReplay);
                    drop(inner);
                    self.spawn_open();
                } else {
                    log::error!("journal open failed: {err:?}");
                    let on_open = inner.on_open.take();
                    self.transition(&mut inner, State::Closed);
                    drop(inner);
                    if let Some(on_open) = on_open {
                        on_open(Err(err));
                    }
                }
            }
        }
    }

    fn handle_replay_complete(self: &Arc<Self>) {
        let (on_open, close_now) = {
            let mut inner = self.inner.lock();
            if inner.close_pending {
                self.transition(&mut inner, State::Stopping);
                (inner.on_open.take(), true)
            } else {
                self.transition(&mut inner, State::Ready);
                (inner.on_open.take(), false)
            }
        };
        if let Some(on_open) = on_open {
            on_open(if close_now { Err(Errno::CANCELED) } else { Ok(()) });
        }
        if close_now {
            self.spawn_close();
        }
    }

    /// Close the backing log. Waits out a replay in progress.
    pub fn close(self: &Arc<Self>, on_close: impl FnOnce(Result<(), Errno>) + Send + 'static) {
        let close_now = {
            let mut inner = self.inner.lock();
            inner.on_close = Some(Box::new(on_close));
            match inner.state {
                State::Initializing | State::Replaying | State::RestartingReplay => {
                    inner.close_pending = true;
                    false
                }
                State::Ready => {
                    self.transition(&mut inner, State::Closing);
                    true
                }
                State::Uninitialized => {
                    let on_close = inner.on_close.take();
                    self.transition(&mut inner, State::Closed);
                    drop(inner);
                    if let Some(on_close) = on_close {
                        on_close(Ok(()));
                    }
                    return;
                }
                state => panic!("journal close in state {state:?}"),
            }
        };
        if close_now {
            self.spawn_close();
        }
    }

    fn spawn_close(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = this.log.close().await;
            let on_close = {
                let mut inner = this.inner.lock();
                if inner.state != State::Closing {
                    this.transition(&mut inner, State::Closing);
                }
                let on_close = inner.on_close.take();
                this.transition(&mut inner, State::Closed);
                on_close
            };
            if let Some(on_close) = on_close {
                on_close(result);
            }
        });
    }

    /// Register one mutating event and start persisting it. `requests` are
    /// held back and sent when the entry is durable. In-flight ops are
    /// flushed before the journal closes, so the journal must be `Ready`.
    ///
    /// `_synchronous` is accepted for interface parity; every append already
    /// resolves at durability.
    pub(crate) fn append_event(
        self: &Arc<Self>,
        comp: &Arc<AioCompletion>,
        entry: EventEntry,
        requests: Vec<ObjectRequest>,
        _synchronous: bool,
    ) -> JournalTid {
        let tid = {
            let mut inner = self.inner.lock();
            assert_eq!(inner.state, State::Ready, "journal not ready");
            let tid = inner.next_tid;
            inner.next_tid += 1;
            inner.events.insert(
                tid,
                Event {
                    comp: Arc::clone(comp),
                    requests,
                    on_safe: Vec::new(),
                },
            );
            tid
        };

        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = this.log.append(tid, entry).await;
            this.handle_event_safe(tid, result);
        });
        tid
    }

    /// Fire `on_safe` with the commit result of `tid`; immediately when the
    /// event is already retired.
    pub fn wait_event(&self, tid: JournalTid, on_safe: impl FnOnce(Result<(), Errno>) + Send + 'static) {
        let mut inner = self.inner.lock();
        match inner.events.get_mut(&tid) {
            Some(event) => event.on_safe.push(Box::new(on_safe)),
            None => {
                drop(inner);
                on_safe(Ok(()));
            }
        }
    }

    fn handle_event_safe(&self, tid: JournalTid, result: Result<(), Errno>) {
        log::trace!("journal event safe: tid={tid} result={result:?}");
        let Some(event) = self.inner.lock().events.remove(&tid) else {
            return;
        };
        let Event {
            comp,
            requests,
            on_safe,
        } = event;

        match result {
            Ok(()) => {
                // The entry is durable; release the held-back object requests
                // in journal order.
                for request in requests {
                    request.send();
                }
            }
            Err(err) => {
                // Never send object requests for an unjournaled event; bubble
                // the error up and abandon the children.
                comp.fail(err);
                drop(requests);
            }
        }
        for on_safe in on_safe {
            on_safe(result);
        }
    }

    fn transition(&self, inner: &mut Inner, state: State) {
        log::debug!("journal state: {:?} -> {state:?}", inner.state);
        inner.state = state;
        if state.is_steady() {
            let waiters = std::mem::take(&mut inner.state_waiters);
            if !waiters.is_empty() {
                // Steady-state waiters may re-enter the journal; run them on
                // the runtime rather than under the lock scope.
                self.runtime.spawn(async move {
                    for waiter in waiters {
                        waiter();
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Journal")
            .field("state", &inner.state)
            .field("events", &inner.events.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::completion::AioCompletion;

    struct InlineLog {
        fail_next_open: AtomicBool,
        recovered: Vec<(JournalTid, EventEntry)>,
    }

    impl InlineLog {
        fn new(recovered: Vec<(JournalTid, EventEntry)>) -> Arc<Self> {
            Arc::new(Self {
                fail_next_open: AtomicBool::new(false),
                recovered,
            })
        }
    }

    #[async_trait]
    impl EventLog for InlineLog {
        async fn open(&self) -> Result<Vec<(JournalTid, EventEntry)>, Errno> {
            if self.fail_next_open.swap(false, Ordering::SeqCst) {
                return Err(Errno::IO);
            }
            Ok(self.recovered.clone())
        }

        async fn append(&self, _tid: JournalTid, _entry: EventEntry) -> Result<(), Errno> {
            Ok(())
        }

        async fn close(&self) -> Result<(), Errno> {
            Ok(())
        }
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap()
    }

    fn open(journal: &Arc<Journal>) -> Result<(), Errno> {
        let (tx, rx) = mpsc::channel();
        journal.open(move |result| tx.send(result).unwrap());
        rx.recv_timeout(Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn open_recovers_entries_and_reaches_ready() {
        let rt = rt();
        let log = InlineLog::new(vec![(7, EventEntry::AioFlush)]);
        let journal = Journal::new(log as _, rt.handle().clone());

        open(&journal).unwrap();
        assert_eq!(journal.state(), State::Ready);
        assert_eq!(journal.replay_entries(), vec![(7, EventEntry::AioFlush)]);

        // Tids continue after the recovered history.
        let comp = AioCompletion::new(|_| {});
        let tid = journal.append_event(&comp, EventEntry::AioFlush, Vec::new(), true);
        assert_eq!(tid, 8);

        let (tx, rx) = mpsc::channel();
        journal.wait_event(tid, move |result| tx.send(result).unwrap());
        rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
    }

    #[test]
    fn open_restarts_replay_once_on_error() {
        let rt = rt();
        let log = InlineLog::new(Vec::new());
        log.fail_next_open.store(true, Ordering::SeqCst);
        let journal = Journal::new(Arc::clone(&log) as _, rt.handle().clone());

        open(&journal).unwrap();
        assert_eq!(journal.state(), State::Ready);
    }

    #[test]
    fn steady_state_waiters_fire() {
        let rt = rt();
        let log = InlineLog::new(Vec::new());
        let journal = Journal::new(log as _, rt.handle().clone());

        let (tx, rx) = mpsc::channel();
        journal.wait_for_steady_state(move || tx.send(()).unwrap());
        open(&journal).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // Already steady: fires immediately.
        let (tx, rx) = mpsc::channel();
        journal.wait_for_steady_state(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn close_transitions_to_closed() {
        let rt = rt();
        let log = InlineLog::new(Vec::new());
        let journal = Journal::new(log as _, rt.handle().clone());
        open(&journal).unwrap();

        let (tx, rx) = mpsc::channel();
        journal.close(move |result| tx.send(result).unwrap());
        rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(journal.state(), State::Closed);
    }

    #[test]
    fn close_before_open_is_immediate() {
        let rt = rt();
        let log = InlineLog::new(Vec::new());
        let journal = Journal::new(log as _, rt.handle().clone());
        drop(rt);

        let (tx, rx) = mpsc::channel();
        journal.close(move |result| tx.send(result).unwrap());
        rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(journal.state(), State::Closed);
    }
}
