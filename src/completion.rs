//! Completion aggregation for image requests.
//!
//! One `AioCompletion` tracks every child operation a single image request
//! fans out into. Children register through [`AioCompletion::add_request`] and
//! report through [`AioCompletion::complete_request`]; the user callback fires
//! exactly once, after the dispatching request has closed the adding phase
//! *and* the pending count has drained to zero. Closing the adding phase last
//! is what keeps a request from completing early when all of its children
//! finish synchronously during fan-out.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustix::io::Errno;

use crate::image::OpGuard;

/// Terminal result of an image request: assembled byte count for reads,
/// 0 for writes, discards and flushes, or the first child errno.
pub type AioResult = Result<usize, Errno>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Discard,
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Children may still be added.
    Pending,
    /// Fan-out finished; completes when pending reaches zero.
    AddingDone,
    Complete,
}

type Callback = Box<dyn FnOnce(&AioCompletion) + Send>;

/// Destination for assembled read data, fixed before any child is added.
pub(crate) enum ReadSink {
    /// One contiguous pre-zeroed buffer; children scatter into it through
    /// their buffer back-mapping slices.
    Flat(Box<[u8]>),
    /// Ordered pieces keyed by caller-buffer offset.
    Vectored(BTreeMap<u64, Bytes>),
}

/// Assembled read payload handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadData {
    Flat(Bytes),
    Vectored(Vec<Bytes>),
}

impl ReadData {
    /// Flatten into one contiguous buffer.
    pub fn into_bytes(self) -> Bytes {
        match self {
            ReadData::Flat(data) => data,
            ReadData::Vectored(pieces) => {
                let mut buf = BytesMut::with_capacity(pieces.iter().map(Bytes::len).sum());
                for piece in &pieces {
                    buf.extend_from_slice(piece);
                }
                buf.freeze()
            }
        }
    }
}

struct Inner {
    phase: Phase,
    pending: u32,
    /// Accumulated success payload size. Stays 0 for mutating ops.
    bytes: usize,
    /// First child errno wins; later ones are logged and dropped.
    error: Option<Errno>,
    kind: Option<OpKind>,
    callback: Option<Callback>,
    /// Keeps the image-level in-flight op registered until terminal
    /// completion; dropping it wakes flush drains.
    op_guard: Option<OpGuard>,
}

pub struct AioCompletion {
    inner: Mutex<Inner>,
    cond: Condvar,
    read_sink: Mutex<Option<ReadSink>>,
}

impl AioCompletion {
    pub fn new(callback: impl FnOnce(&AioCompletion) + Send + 'static) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            inner: Mutex::new(Inner {
                phase: Phase::Pending,
                pending: 0,
                bytes: 0,
                error: None,
                kind: None,
                callback: Some(Box::new(callback)),
                op_guard: None,
            }),
            cond: Condvar::new(),
            read_sink: Mutex::new(None),
        })
    }

    /// Operation kind, recorded when the request starts dispatching.
    pub fn kind(&self) -> Option<OpKind> {
        self.inner.lock().kind
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().phase == Phase::Complete
    }

    /// Terminal result, or `None` while the request is still in flight.
    pub fn result(&self) -> Option<AioResult> {
        let inner = self.inner.lock();
        (inner.phase == Phase::Complete).then(|| match inner.error {
            Some(err) => Err(err),
            None => Ok(inner.bytes),
        })
    }

    /// Block until the terminal callback has been triggered.
    pub fn wait(&self) -> AioResult {
        let mut inner = self.inner.lock();
        while inner.phase != Phase::Complete {
            self.cond.wait(&mut inner);
        }
        match inner.error {
            Some(err) => Err(err),
            None => Ok(inner.bytes),
        }
    }

    /// Consume the assembled read payload. `None` for non-read ops or when
    /// called twice.
    pub fn take_read_data(&self) -> Option<ReadData> {
        match self.read_sink.lock().take()? {
            ReadSink::Flat(buf) => Some(ReadData::Flat(Bytes::from(buf.into_vec()))),
            ReadSink::Vectored(pieces) => {
                Some(ReadData::Vectored(pieces.into_values().collect()))
            }
        }
    }

    pub(crate) fn start_op(&self, kind: OpKind, op_guard: Option<OpGuard>) {
        let mut inner = self.inner.lock();
        inner.kind = Some(kind);
        if inner.phase != Phase::Complete {
            inner.op_guard = op_guard;
        }
        // Already force-failed: the guard drops here instead of lingering
        // past the terminal callback.
    }

    pub(crate) fn set_read_sink(&self, sink: ReadSink) {
        *self.read_sink.lock() = Some(sink);
    }

    /// Scatter one child read's object bytes into the sink. `data` may be
    /// shorter than the mapped length (sparse tail); the shortfall stays
    /// zero-filled.
    pub(crate) fn write_read_slices(&self, buffer_extents: &[(u64, u64)], data: &Bytes) {
        let mut sink = self.read_sink.lock();
        let Some(sink) = sink.as_mut() else { return };
        let mut data_ofs = 0usize;
        for &(buf_ofs, len) in buffer_extents {
            let avail = Ord::min(len as usize, data.len().saturating_sub(data_ofs));
            match sink {
                ReadSink::Flat(buf) => {
                    let dst = &mut buf[buf_ofs as usize..buf_ofs as usize + avail];
                    dst.copy_from_slice(&data[data_ofs..data_ofs + avail]);
                }
                ReadSink::Vectored(pieces) => {
                    let piece = if avail == len as usize {
                        data.slice(data_ofs..data_ofs + avail)
                    } else {
                        // Zero-pad a short piece to its mapped length.
                        let mut piece = BytesMut::zeroed(len as usize);
                        piece[..avail].copy_from_slice(&data[data_ofs..data_ofs + avail]);
                        piece.freeze()
                    };
                    pieces.insert(buf_ofs, piece);
                }
            }
            data_ofs += len as usize;
        }
    }

    pub(crate) fn add_request(&self) {
        let mut inner = self.inner.lock();
        assert_ne!(
            inner.phase,
            Phase::AddingDone,
            "children added after fan-out closed",
        );
        // A force-failed completion accepts (and ignores) stragglers: a fast
        // journal failure can retire the request while fan-out is still
        // building children.
        if inner.phase == Phase::Pending {
            inner.pending += 1;
        }
    }

    pub(crate) fn complete_request(&self, result: AioResult) {
        let inner = self.inner.lock();
        if inner.phase == Phase::Complete {
            // A straggler behind a forced failure; its result is already
            // reported.
            return;
        }
        let mut inner = inner;
        match result {
            Ok(bytes) => inner.bytes += bytes,
            Err(err) => {
                if let Some(first) = inner.error {
                    log::debug!("dropping child error {err:?} after {first:?}");
                } else {
                    inner.error = Some(err);
                }
            }
        }
        assert!(inner.pending > 0);
        inner.pending -= 1;
        if inner.pending == 0 && inner.phase == Phase::AddingDone {
            self.finish(inner);
        }
    }

    /// Close the adding phase. May itself trigger completion when every child
    /// already reported (or none was ever added).
    pub(crate) fn finish_adding_requests(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == Phase::Complete {
            return;
        }
        inner.phase = Phase::AddingDone;
        if inner.pending == 0 {
            self.finish(inner);
        }
    }

    /// Force the completion into a failed terminal state. Used for requests
    /// rejected before fan-out and for journal append failures, where built
    /// but unsent children are abandoned; any of their late results are
    /// ignored.
    pub(crate) fn fail(&self, err: Errno) {
        let mut inner = self.inner.lock();
        if inner.phase == Phase::Complete {
            return;
        }
        if inner.error.is_none() {
            inner.error = Some(err);
        }
        self.finish(inner);
    }

    fn finish(&self, mut inner: MutexGuard<'_, Inner>) {
        inner.phase = Phase::Complete;
        let callback = inner.callback.take();
        let op_guard = inner.op_guard.take();
        drop(inner);
        // Unregister from the in-flight op registry before notifying the
        // caller, so a flush drain never observes a completed op as pending.
        drop(op_guard);
        if let Some(callback) = callback {
            callback(self);
        }
        self.cond.notify_all();
    }
}

impl std::fmt::Debug for AioCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AioCompletion")
            .field("kind", &inner.kind)
            .field("phase", &inner.phase)
            .field("pending", &inner.pending)
            .field("bytes", &inner.bytes)
            .field("error", &inner.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn counting() -> (Arc<AioCompletion>, Arc<AtomicU32>) {
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        let comp = AioCompletion::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        (comp, fired)
    }

    #[test]
    fn completes_once_after_adding_done() {
        let (comp, fired) = counting();
        comp.add_request();
        comp.add_request();
        comp.complete_request(Ok(10));
        // Pending hit zero below, but the adding phase is still open.
        comp.complete_request(Ok(20));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        comp.finish_adding_requests();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(comp.result(), Some(Ok(30)));
    }

    #[test]
    fn completes_when_last_child_reports() {
        let (comp, fired) = counting();
        comp.add_request();
        comp.finish_adding_requests();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        comp.complete_request(Ok(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_children_completes_at_finish() {
        let (comp, fired) = counting();
        comp.finish_adding_requests();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(comp.result(), Some(Ok(0)));
    }

    #[test]
    fn first_error_wins() {
        let (comp, _) = counting();
        comp.add_request();
        comp.add_request();
        comp.add_request();
        comp.complete_request(Ok(4096));
        comp.complete_request(Err(Errno::IO));
        comp.complete_request(Err(Errno::NOENT));
        comp.finish_adding_requests();
        assert_eq!(comp.result(), Some(Err(Errno::IO)));
    }

    #[test]
    fn fail_is_terminal_and_ignores_stragglers() {
        let (comp, fired) = counting();
        comp.add_request();
        comp.fail(Errno::ROFS);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(comp.result(), Some(Err(Errno::ROFS)));
        // The abandoned child reporting late changes nothing.
        comp.complete_request(Ok(4096));
        assert_eq!(comp.result(), Some(Err(Errno::ROFS)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flat_sink_scatters_and_zero_fills() {
        let (comp, _) = counting();
        comp.set_read_sink(ReadSink::Flat(vec![0u8; 8].into_boxed_slice()));
        comp.write_read_slices(&[(0, 2), (4, 2)], &Bytes::from_static(&[1, 1, 2, 2]));
        // Short data: only the first byte of the mapped slice arrives.
        comp.write_read_slices(&[(6, 2)], &Bytes::from_static(&[3]));
        let Some(ReadData::Flat(data)) = comp.take_read_data() else {
            panic!("expected flat data");
        };
        assert_eq!(&data[..], &[1, 1, 0, 0, 2, 2, 3, 0]);
    }

    #[test]
    fn vectored_sink_orders_pieces() {
        let (comp, _) = counting();
        comp.set_read_sink(ReadSink::Vectored(BTreeMap::new()));
        comp.write_read_slices(&[(4, 2)], &Bytes::from_static(&[2, 2]));
        comp.write_read_slices(&[(0, 4)], &Bytes::from_static(&[1, 1, 1, 1]));
        let Some(ReadData::Vectored(pieces)) = comp.take_read_data() else {
            panic!("expected vectored data");
        };
        assert_eq!(pieces.len(), 2);
        assert_eq!(&pieces[0][..], &[1, 1, 1, 1]);
        assert_eq!(&pieces[1][..], &[2, 2]);
    }

    #[test]
    fn wait_returns_result() {
        let (comp, _) = counting();
        let comp2 = Arc::clone(&comp);
        let handle = std::thread::spawn(move || comp2.wait());
        comp.add_request();
        comp.finish_adding_requests();
        comp.complete_request(Ok(512));
        assert_eq!(handle.join().unwrap(), Ok(512));
    }
}
