//! Per-image shared context and the public image handle.
//!
//! `ImageCtx` is the sole owner of the per-image subsystems; everything else
//! (requests, the queue, child ops) holds an `Arc` whose lifetime is bounded
//! by [`Image`], which tears the queue and its workers down before releasing
//! the context.
//!
//! Lock hierarchy, outermost first: owner lock, md lock, snap lock, cache
//! lock, queue mutex. The owner lock is held shared across every request
//! dispatch so closing the image cannot race it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{ensure, Context as _, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustix::io::Errno;
use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use tokio::runtime::Handle;

use crate::cache::ObjectCache;
use crate::completion::{AioCompletion, AioResult};
use crate::image_request::OpFlags;
use crate::journal::Journal;
use crate::object_store::{ObjectStore, SnapContext, SnapId};
use crate::request_queue::{self, ImageRequestWq};
use crate::striper::{ImageExtent, Layout};
use crate::watcher::ImageWatcher;

/// Tunables for one image handle.
#[serde_inline_default]
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageOptions {
    /// Defer all AIO to the worker pool instead of dispatching inline on the
    /// caller's thread.
    #[serde_inline_default(false)]
    pub non_blocking_aio: bool,
    /// Drop discard ranges that cover neither a whole object nor an object
    /// tail, instead of issuing object zero ops for them.
    #[serde_inline_default(false)]
    pub skip_partial_discard: bool,
    /// Readahead budget for the cache's prefetch hint; 0 disables it.
    #[serde_inline_default(0)]
    pub readahead_max_bytes: u64,
    /// Worker threads draining the request queue.
    #[serde_inline_default(1)]
    pub op_threads: usize,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            non_blocking_aio: false,
            skip_partial_discard: false,
            readahead_max_bytes: 0,
            op_threads: 1,
        }
    }
}

/// Snapshot-scoped image state, guarded by the snap lock. The clip path reads
/// it under one guard so the size cannot move between clipping and recording
/// the pending op.
#[derive(Debug, Clone)]
pub struct SnapshotState {
    /// Image size in bytes at the current snapshot.
    pub size: u64,
    /// `None` means HEAD (the live image).
    pub snap_id: Option<SnapId>,
    pub read_only: bool,
    /// Snapshot context applied to mutating ops.
    pub snapc: SnapContext,
}

impl SnapshotState {
    /// Clip `len` against the image size. Offsets at or past EOF clip to an
    /// empty range; a range overflowing the address space is rejected.
    pub(crate) fn clip_request(&self, off: u64, len: &mut u64) -> Result<(), Errno> {
        if off.checked_add(*len).is_none() {
            return Err(Errno::INVAL);
        }
        if off >= self.size {
            *len = 0;
        } else {
            *len = Ord::min(*len, self.size - off);
        }
        Ok(())
    }
}

/// Per-image operation counters.
#[derive(Debug, Default)]
pub struct Stats {
    pub rd: AtomicU64,
    pub rd_bytes: AtomicU64,
    pub wr: AtomicU64,
    pub wr_bytes: AtomicU64,
    pub discard: AtomicU64,
    pub discard_bytes: AtomicU64,
    pub flush: AtomicU64,
}

impl Stats {
    pub(crate) fn inc(&self, counter: &AtomicU64, bytes: &AtomicU64, len: u64) {
        counter.fetch_add(1, Ordering::Relaxed);
        bytes.fetch_add(len, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct InFlightOps {
    count: u64,
    waiters: Vec<Box<dyn FnOnce() + Send>>,
}

/// Shared per-image state. Owned by [`Image`]; requests and child ops hold
/// references for their own (shorter) lifetimes.
pub struct ImageCtx {
    pub name: String,
    pub layout: Layout,
    pub(crate) snap: RwLock<SnapshotState>,
    pub(crate) owner_lock: RwLock<()>,
    pub(crate) md_lock: RwLock<()>,
    pub(crate) cache_lock: Mutex<()>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) cache: Option<Arc<dyn ObjectCache>>,
    pub(crate) journal: Option<Arc<Journal>>,
    pub(crate) watcher: Option<Arc<dyn ImageWatcher>>,
    pub(crate) options: ImageOptions,
    pub(crate) runtime: Handle,
    open: AtomicBool,
    in_flight: Mutex<InFlightOps>,
    pub(crate) stats: Stats,
}

impl ImageCtx {
    /// Reject dispatch against a closed image.
    pub(crate) fn check(&self) -> Result<(), Errno> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Errno::NODEV)
        }
    }

    pub fn size(&self) -> u64 {
        self.snap.read().size
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Register an in-flight image-level op; the returned guard keeps flush
    /// drains waiting until it is dropped.
    pub(crate) fn start_op(self: &Arc<Self>) -> OpGuard {
        self.in_flight.lock().count += 1;
        OpGuard {
            ictx: Arc::clone(self),
        }
    }

    /// Invoke `on_drain` once every in-flight op registered before this call
    /// has completed. Fires immediately when none is outstanding.
    pub(crate) fn flush_async_operations(&self, on_drain: Box<dyn FnOnce() + Send>) {
        let on_drain = {
            let mut in_flight = self.in_flight.lock();
            if in_flight.count == 0 {
                Some(on_drain)
            } else {
                in_flight.waiters.push(on_drain);
                None
            }
        };
        if let Some(on_drain) = on_drain {
            on_drain();
        }
    }

    fn finish_op(&self) {
        let waiters = {
            let mut in_flight = self.in_flight.lock();
            in_flight.count -= 1;
            if in_flight.count == 0 {
                std::mem::take(&mut in_flight.waiters)
            } else {
                Vec::new()
            }
        };
        for waiter in waiters {
            waiter();
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ImageCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCtx")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

/// Keeps one image-level op registered; dropped at terminal completion.
pub(crate) struct OpGuard {
    ictx: Arc<ImageCtx>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.ictx.finish_op();
    }
}

pub struct ImageBuilder {
    name: String,
    layout: Layout,
    size: u64,
    store: Arc<dyn ObjectStore>,
    cache: Option<Arc<dyn ObjectCache>>,
    journal: Option<Arc<Journal>>,
    watcher: Option<Arc<dyn ImageWatcher>>,
    snap_id: Option<SnapId>,
    read_only: bool,
    snapc: SnapContext,
    options: ImageOptions,
    runtime: Option<Handle>,
}

impl ImageBuilder {
    pub fn new(
        name: impl Into<String>,
        layout: Layout,
        size: u64,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            name: name.into(),
            layout,
            size,
            store,
            cache: None,
            journal: None,
            watcher: None,
            snap_id: None,
            read_only: false,
            snapc: SnapContext::default(),
            options: ImageOptions::default(),
            runtime: None,
        }
    }

    pub fn cache(mut self, cache: Arc<dyn ObjectCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn watcher(mut self, watcher: Arc<dyn ImageWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Open at a snapshot instead of HEAD. Snapshot handles are read-only.
    pub fn snapshot(mut self, snap_id: SnapId) -> Self {
        self.snap_id = Some(snap_id);
        self.read_only = true;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn snap_context(mut self, snapc: SnapContext) -> Self {
        self.snapc = snapc;
        self
    }

    pub fn options(mut self, options: ImageOptions) -> Self {
        self.options = options;
        self
    }

    /// Runtime the pipeline spawns collaborator I/O on. Defaults to the
    /// ambient tokio runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn open(self) -> Result<Image> {
        self.layout.validate().context("invalid image layout")?;
        ensure!(self.options.op_threads >= 1, "op_threads must be >= 1");
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().context("no tokio runtime available")?,
        };

        let ictx = Arc::new(ImageCtx {
            name: self.name,
            layout: self.layout,
            snap: RwLock::new(SnapshotState {
                size: self.size,
                snap_id: self.snap_id,
                read_only: self.read_only,
                snapc: self.snapc,
            }),
            owner_lock: RwLock::new(()),
            md_lock: RwLock::new(()),
            cache_lock: Mutex::new(()),
            store: self.store,
            cache: self.cache,
            journal: self.journal,
            watcher: self.watcher,
            options: self.options,
            runtime,
            open: AtomicBool::new(true),
            in_flight: Mutex::default(),
            stats: Stats::default(),
        });

        let queue = Arc::new(ImageRequestWq::new(Arc::clone(&ictx)));
        let workers = request_queue::spawn_workers(&queue, ictx.options.op_threads);
        Ok(Image {
            ictx,
            queue,
            workers,
        })
    }
}

/// Public handle for one open image. Dropping (or [`Image::close`]) drains
/// the request queue and joins the workers before the context goes away;
/// requests still queued at that point complete with `Errno::NODEV`.
pub struct Image {
    ictx: Arc<ImageCtx>,
    queue: Arc<ImageRequestWq>,
    workers: Vec<JoinHandle<()>>,
}

impl Image {
    pub fn aio_read(&self, comp: &Arc<AioCompletion>, off: u64, len: u64, flags: OpFlags) {
        self.queue.aio_read(comp, vec![(off, len)], flags, false);
    }

    /// Multi-extent read assembling into an ordered list of buffers.
    pub fn aio_readv(&self, comp: &Arc<AioCompletion>, extents: Vec<ImageExtent>, flags: OpFlags) {
        self.queue.aio_read(comp, extents, flags, true);
    }

    pub fn aio_write(&self, comp: &Arc<AioCompletion>, off: u64, data: Bytes, flags: OpFlags) {
        self.queue.aio_write(comp, off, data, flags);
    }

    pub fn aio_discard(&self, comp: &Arc<AioCompletion>, off: u64, len: u64) {
        self.queue.aio_discard(comp, off, len);
    }

    pub fn aio_flush(&self, comp: &Arc<AioCompletion>) {
        self.queue.aio_flush(comp);
    }

    pub fn read(&self, off: u64, len: u64, flags: OpFlags) -> Result<Bytes, Errno> {
        self.queue.read(off, len, flags)
    }

    pub fn write(&self, off: u64, data: Bytes, flags: OpFlags) -> Result<usize, Errno> {
        self.queue.write(off, data, flags)
    }

    pub fn discard(&self, off: u64, len: u64) -> Result<usize, Errno> {
        self.queue.discard(off, len)
    }

    /// Block new writes from dispatching and wait until every in-progress
    /// write has finished processing. Reads and flushes stay admissible.
    pub fn suspend_writes(&self) {
        self.queue.suspend_writes();
    }

    pub fn resume_writes(&self) {
        self.queue.resume_writes();
    }

    /// Wake the worker pool to re-examine deferred work, e.g. after the
    /// watcher acquires the exclusive lock.
    pub fn signal(&self) {
        self.queue.signal();
    }

    pub fn ctx(&self) -> &Arc<ImageCtx> {
        &self.ictx
    }

    #[cfg(test)]
    pub(crate) fn request_queue(&self) -> &Arc<ImageRequestWq> {
        &self.queue
    }

    pub fn stats(&self) -> &Stats {
        &self.ictx.stats
    }

    /// Flush and wait synchronously. Must not be called from a runtime
    /// worker thread.
    pub fn flush(&self) -> AioResult {
        let comp = AioCompletion::new(|_| {});
        self.aio_flush(&comp);
        comp.wait()
    }

    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        {
            let _owner = self.ictx.owner_lock.write();
            self.ictx.mark_closed();
        }
        self.queue.shut_down();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.close_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap_state(size: u64) -> SnapshotState {
        SnapshotState {
            size,
            snap_id: None,
            read_only: false,
            snapc: SnapContext::default(),
        }
    }

    #[test]
    fn clip_truncates_at_eof() {
        let snap = snap_state(1 << 20);
        let mut len = 1 << 20;
        snap.clip_request(1 << 19, &mut len).unwrap();
        assert_eq!(len, 1 << 19);
    }

    #[test]
    fn clip_past_eof_is_empty() {
        let snap = snap_state(4096);
        let mut len = 512;
        snap.clip_request(4096, &mut len).unwrap();
        assert_eq!(len, 0);
        let mut len = 512;
        snap.clip_request(1 << 30, &mut len).unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn clip_rejects_overflow() {
        let snap = snap_state(4096);
        let mut len = u64::MAX;
        assert_eq!(snap.clip_request(2, &mut len), Err(Errno::INVAL));
    }

    #[test]
    fn flush_async_operations_waits_for_ops() {
        use std::sync::atomic::AtomicBool;

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let ictx = Arc::new(ImageCtx {
            name: "img".into(),
            layout: Layout {
                object_size: 1 << 22,
                stripe_unit: 1 << 22,
                stripe_count: 1,
                object_prefix: "img".into(),
            },
            snap: RwLock::new(snap_state(1 << 22)),
            owner_lock: RwLock::new(()),
            md_lock: RwLock::new(()),
            cache_lock: Mutex::new(()),
            store: Arc::new(crate::object_store::MemoryStore::new()),
            cache: None,
            journal: None,
            watcher: None,
            options: ImageOptions::default(),
            runtime: rt.handle().clone(),
            open: AtomicBool::new(true),
            in_flight: Mutex::default(),
            stats: Stats::default(),
        });

        let fired = Arc::new(AtomicBool::new(false));
        let guard = ictx.start_op();
        let fired2 = Arc::clone(&fired);
        ictx.flush_async_operations(Box::new(move || {
            fired2.store(true, Ordering::SeqCst);
        }));
        assert!(!fired.load(Ordering::SeqCst));
        drop(guard);
        assert!(fired.load(Ordering::SeqCst));

        // Nothing outstanding: fires inline.
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        ictx.flush_async_operations(Box::new(move || {
            fired2.store(true, Ordering::SeqCst);
        }));
        assert!(fired.load(Ordering::SeqCst));
    }
}
