//! Per-image request admission and deferred dispatch.
//!
//! The queue decides whether a request runs inline on the caller's thread or
//! is deferred to the worker pool: reads defer only in non-blocking mode,
//! mutating ops also defer while the advisory exclusive lock still has to be
//! acquired, and flushes defer while queued writes could otherwise be
//! overtaken. The queue itself is passive; worker threads spawned by the
//! image drive it.
//!
//! Write accounting invariants: `in_progress_writes <= queued_writes`; while
//! writes are suspended no write moves from queued to in-progress; the
//! watcher hears about the first queued write and about the queue running
//! dry again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use rustix::io::Errno;

use crate::completion::{AioCompletion, ReadData};
use crate::image::ImageCtx;
use crate::image_request::{ImageRequest, OpFlags};
use crate::striper::ImageExtent;

struct QueuedRequest {
    request: ImageRequest,
    /// The exclusive lock was not held when this was queued; dispatch waits
    /// until the watcher reports ownership.
    lock_required: bool,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<QueuedRequest>,
    queued_writes: u32,
    in_progress_writes: u32,
    writes_suspended: bool,
    shutdown: bool,
}

pub(crate) struct ImageRequestWq {
    ictx: Arc<ImageCtx>,
    inner: Mutex<Inner>,
    /// Wakes workers for new or previously deferred work.
    work_cond: Condvar,
    /// Wakes `suspend_writes` once in-progress writes reach zero.
    quiesce_cond: Condvar,
}

impl ImageRequestWq {
    pub(crate) fn new(ictx: Arc<ImageCtx>) -> Self {
        Self {
            ictx,
            inner: Mutex::default(),
            work_cond: Condvar::new(),
            quiesce_cond: Condvar::new(),
        }
    }

    pub(crate) fn aio_read(
        &self,
        comp: &Arc<AioCompletion>,
        extents: Vec<ImageExtent>,
        flags: OpFlags,
        vectored: bool,
    ) {
        let _owner = self.ictx.owner_lock.read();
        log::debug!("aio_read: image={} extents={extents:?}", self.ictx.name);
        let request = ImageRequest::read(
            Arc::clone(&self.ictx),
            Arc::clone(comp),
            extents,
            flags,
            vectored,
        );
        if self.ictx.options.non_blocking_aio {
            self.queue_request(request, false);
        } else {
            request.send();
        }
    }

    pub(crate) fn aio_write(&self, comp: &Arc<AioCompletion>, off: u64, data: Bytes, flags: OpFlags) {
        let _owner = self.ictx.owner_lock.read();
        log::debug!(
            "aio_write: image={} off={off} len={}",
            self.ictx.name,
            data.len(),
        );
        let lock_required = self.is_lock_required();
        let request = ImageRequest::write(Arc::clone(&self.ictx), Arc::clone(comp), off, data, flags);
        if self.ictx.options.non_blocking_aio || lock_required {
            self.queue_request(request, lock_required);
        } else {
            request.send();
        }
    }

    pub(crate) fn aio_discard(&self, comp: &Arc<AioCompletion>, off: u64, len: u64) {
        let _owner = self.ictx.owner_lock.read();
        log::debug!("aio_discard: image={} off={off} len={len}", self.ictx.name);
        let lock_required = self.is_lock_required();
        let request = ImageRequest::discard(Arc::clone(&self.ictx), Arc::clone(comp), off, len);
        if self.ictx.options.non_blocking_aio || lock_required {
            self.queue_request(request, lock_required);
        } else {
            request.send();
        }
    }

    pub(crate) fn aio_flush(&self, comp: &Arc<AioCompletion>) {
        let _owner = self.ictx.owner_lock.read();
        log::debug!("aio_flush: image={}", self.ictx.name);
        let request = ImageRequest::flush(Arc::clone(&self.ictx), Arc::clone(comp));
        // A flush must not overtake a still-queued write.
        if self.ictx.options.non_blocking_aio || !self.writes_empty() {
            self.queue_request(request, false);
        } else {
            request.send();
        }
    }

    pub(crate) fn read(&self, off: u64, len: u64, flags: OpFlags) -> Result<Bytes, Errno> {
        let comp = AioCompletion::new(|_| {});
        self.aio_read(&comp, vec![(off, len)], flags, false);
        comp.wait()?;
        Ok(comp
            .take_read_data()
            .map(ReadData::into_bytes)
            .unwrap_or_default())
    }

    pub(crate) fn write(&self, off: u64, data: Bytes, flags: OpFlags) -> Result<usize, Errno> {
        // Clip up front so the returned count reflects EOF truncation.
        let clip_len = {
            let snap = self.ictx.snap.read();
            let mut len = data.len() as u64;
            snap.clip_request(off, &mut len)?;
            len
        };
        let comp = AioCompletion::new(|_| {});
        self.aio_write(&comp, off, data, flags);
        comp.wait()?;
        Ok(clip_len as usize)
    }

    pub(crate) fn discard(&self, off: u64, len: u64) -> Result<usize, Errno> {
        let clip_len = {
            let snap = self.ictx.snap.read();
            let mut len = len;
            snap.clip_request(off, &mut len)?;
            len
        };
        let comp = AioCompletion::new(|_| {});
        self.aio_discard(&comp, off, len);
        comp.wait()?;
        Ok(clip_len as usize)
    }

    /// True when no write is queued (in-progress writes count as queued
    /// until their processing finishes).
    pub(crate) fn writes_empty(&self) -> bool {
        self.inner.lock().queued_writes == 0
    }

    #[cfg(test)]
    pub(crate) fn write_counters(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.queued_writes, inner.in_progress_writes)
    }

    /// Stop dispatching queued writes and wait until every in-progress write
    /// has finished processing.
    pub(crate) fn suspend_writes(&self) {
        let mut inner = self.inner.lock();
        inner.writes_suspended = true;
        while inner.in_progress_writes > 0 {
            self.quiesce_cond.wait(&mut inner);
        }
    }

    pub(crate) fn resume_writes(&self) {
        self.inner.lock().writes_suspended = false;
        self.work_cond.notify_all();
    }

    /// Re-examine deferred work, e.g. after the watcher acquired the lock.
    pub(crate) fn signal(&self) {
        self.work_cond.notify_all();
    }

    pub(crate) fn shut_down(&self) {
        self.inner.lock().shutdown = true;
        self.work_cond.notify_all();
    }

    fn is_lock_required(&self) -> bool {
        match &self.ictx.watcher {
            Some(watcher) => watcher.lock_supported() && !watcher.lock_owner(),
            None => false,
        }
    }

    fn queue_request(&self, request: ImageRequest, lock_required: bool) {
        let first_write = {
            let mut inner = self.inner.lock();
            let first_write = request.is_write_op() && {
                inner.queued_writes += 1;
                inner.queued_writes == 1
            };
            inner.queue.push_back(QueuedRequest {
                request,
                lock_required,
            });
            first_write
        };
        self.work_cond.notify_one();
        if first_write {
            if let Some(watcher) = &self.ictx.watcher {
                watcher.flag_aio_ops_pending();
                if lock_required {
                    watcher.request_lock();
                }
            }
        }
    }

    /// Worker loop: peek the head, defer suspended or lock-gated writes, and
    /// process everything else in FIFO order.
    fn run_worker(&self) {
        loop {
            let item = {
                let mut inner = self.inner.lock();
                loop {
                    let admissible = match inner.queue.front() {
                        // On shutdown the queue drains unconditionally;
                        // dispatch fails against the closed image.
                        Some(head) => {
                            inner.shutdown
                                || !head.request.is_write_op()
                                || (!inner.writes_suspended
                                    && !(head.lock_required && self.is_lock_required()))
                        }
                        None if inner.shutdown => return,
                        None => false,
                    };
                    if admissible {
                        let item = inner.queue.pop_front().unwrap();
                        if item.request.is_write_op() {
                            inner.in_progress_writes += 1;
                        }
                        break item;
                    }
                    // Lock acquisition has no wakeup of its own; poll while
                    // deferred.
                    let _ = self
                        .work_cond
                        .wait_for(&mut inner, Duration::from_millis(20));
                }
            };
            self.process(item);
        }
    }

    fn process(&self, item: QueuedRequest) {
        let request = item.request;
        let is_write = request.is_write_op();
        // Counter bookkeeping must run even if dispatch panics, or
        // `suspend_writes` would wedge.
        let _accounting = is_write.then(|| {
            scopeguard::guard(self, |wq| {
                let clear_pending = {
                    let mut inner = wq.inner.lock();
                    inner.queued_writes -= 1;
                    inner.in_progress_writes -= 1;
                    if inner.in_progress_writes == 0 {
                        wq.quiesce_cond.notify_all();
                    }
                    inner.queued_writes == 0
                };
                if clear_pending {
                    if let Some(watcher) = &wq.ictx.watcher {
                        watcher.clear_aio_ops_pending();
                    }
                }
            })
        });

        let _owner = self.ictx.owner_lock.read();
        request.send();
    }
}

pub(crate) fn spawn_workers(queue: &Arc<ImageRequestWq>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|i| {
            let queue = Arc::clone(queue);
            std::thread::Builder::new()
                .name(format!("osbd-wq-{i}"))
                .spawn(move || queue.run_worker())
                .expect("failed to spawn queue worker")
        })
        .collect()
}
