//! Per-request dispatch: slicing image ranges into object extents and
//! fanning out to the store, the cache and the journal.
//!
//! `send` must run with the image owner lock held shared (the queue and the
//! inline paths both guarantee this), so a concurrent close cannot race
//! dispatch. Every variant closes the completion's adding phase last: a
//! request whose children all finish synchronously must still not complete
//! before fan-out is done.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use rustix::io::Errno;

use crate::completion::{AioCompletion, OpKind, ReadSink};
use crate::image::ImageCtx;
use crate::journal::EventEntry;
use crate::object_request::{ChildCompletion, ObjectOp, ObjectRequest};
use crate::object_store::{SnapContext, SnapId};
use crate::striper::{self, ImageExtent, ObjectExtent};

bitflags! {
    /// Per-op advice flags, passed through to the object layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        /// Random access pattern; skip readahead.
        const RANDOM = 1 << 0;
        /// Sequential access pattern.
        const SEQUENTIAL = 1 << 1;
    }
}

pub(crate) enum ImageRequest {
    Read(ImageRead),
    Write(ImageWrite),
    Discard(ImageDiscard),
    Flush(ImageFlush),
}

impl ImageRequest {
    pub(crate) fn read(
        ictx: Arc<ImageCtx>,
        comp: Arc<AioCompletion>,
        extents: Vec<ImageExtent>,
        flags: OpFlags,
        vectored: bool,
    ) -> Self {
        Self::Read(ImageRead {
            ictx,
            comp,
            extents,
            flags,
            vectored,
        })
    }

    pub(crate) fn write(
        ictx: Arc<ImageCtx>,
        comp: Arc<AioCompletion>,
        off: u64,
        data: Bytes,
        flags: OpFlags,
    ) -> Self {
        Self::Write(ImageWrite {
            ictx,
            comp,
            off,
            data,
            flags,
        })
    }

    pub(crate) fn discard(
        ictx: Arc<ImageCtx>,
        comp: Arc<AioCompletion>,
        off: u64,
        len: u64,
    ) -> Self {
        Self::Discard(ImageDiscard {
            ictx,
            comp,
            off,
            len,
        })
    }

    pub(crate) fn flush(ictx: Arc<ImageCtx>, comp: Arc<AioCompletion>) -> Self {
        Self::Flush(ImageFlush { ictx, comp })
    }

    pub(crate) fn is_write_op(&self) -> bool {
        matches!(self, Self::Write(_) | Self::Discard(_))
    }

    fn request_type(&self) -> &'static str {
        match self {
            Self::Read(_) => "aio_read",
            Self::Write(_) => "aio_write",
            Self::Discard(_) => "aio_discard",
            Self::Flush(_) => "aio_flush",
        }
    }

    fn ictx(&self) -> &Arc<ImageCtx> {
        match self {
            Self::Read(r) => &r.ictx,
            Self::Write(r) => &r.ictx,
            Self::Discard(r) => &r.ictx,
            Self::Flush(r) => &r.ictx,
        }
    }

    fn comp(&self) -> &Arc<AioCompletion> {
        match self {
            Self::Read(r) => &r.comp,
            Self::Write(r) => &r.comp,
            Self::Discard(r) => &r.comp,
            Self::Flush(r) => &r.comp,
        }
    }

    /// Dispatch. The image owner lock must be held shared by the caller.
    pub(crate) fn send(&self) {
        let ictx = self.ictx();
        log::debug!("{}: image={}", self.request_type(), ictx.name);

        if let Err(err) = ictx.check() {
            self.comp().fail(err);
            return;
        }
        match self {
            Self::Read(r) => r.send_request(),
            Self::Write(r) => send_write_request(r),
            Self::Discard(r) => send_write_request(r),
            Self::Flush(r) => r.send_request(),
        }
    }
}

pub(crate) struct ImageRead {
    ictx: Arc<ImageCtx>,
    comp: Arc<AioCompletion>,
    extents: Vec<ImageExtent>,
    flags: OpFlags,
    vectored: bool,
}

impl ImageRead {
    fn send_request(&self) {
        let ictx = &self.ictx;
        let comp = &self.comp;

        if let Some(cache) = &ictx.cache {
            if ictx.options.readahead_max_bytes > 0 && !self.flags.contains(OpFlags::RANDOM) {
                cache.readahead(&self.extents);
            }
        }

        let snap_id;
        let mut object_extents = BTreeMap::new();
        let mut buffer_ofs = 0u64;
        {
            // The snap lock pins the image size between clipping and
            // recording the pending op.
            let snap = ictx.snap.read();
            snap_id = snap.snap_id;
            for &(off, len) in &self.extents {
                let mut len = len;
                if let Err(err) = snap.clip_request(off, &mut len) {
                    log::error!("invalid read extent: off={off} len={len}");
                    comp.fail(err);
                    return;
                }
                if len == 0 {
                    continue;
                }
                striper::file_to_extents(&ictx.layout, off, len, buffer_ofs, &mut object_extents);
                buffer_ofs += len;
            }
            comp.start_op(OpKind::Read, Some(ictx.start_op()));
        }

        comp.set_read_sink(if self.vectored {
            ReadSink::Vectored(BTreeMap::new())
        } else {
            ReadSink::Flat(vec![0u8; buffer_ofs as usize].into_boxed_slice())
        });

        for extent in object_extents.into_values().flatten() {
            log::trace!(
                " oid {} {}~{} from {:?}",
                extent.oid,
                extent.offset,
                extent.length,
                extent.buffer_extents,
            );
            let child = ChildCompletion::new(comp);
            send_object_read(Arc::clone(ictx), extent, snap_id, self.flags, child);
        }

        comp.finish_adding_requests();
        ictx.stats.inc(&ictx.stats.rd, &ictx.stats.rd_bytes, buffer_ofs);
    }
}

fn send_object_read(
    ictx: Arc<ImageCtx>,
    extent: ObjectExtent,
    snap_id: Option<SnapId>,
    flags: OpFlags,
    child: ChildCompletion,
) {
    let runtime = ictx.runtime.clone();
    runtime.spawn(async move {
        let mapped_len: u64 = extent.buffer_extents.iter().map(|&(_, len)| len).sum();
        match read_object(&ictx, &extent, snap_id, flags).await {
            Ok(data) => {
                child.completion().write_read_slices(&extent.buffer_extents, &data);
                child.complete(Ok(mapped_len as usize));
            }
            Err(Errno::NOENT) => {
                // Unallocated object: reads as zeroes.
                child
                    .completion()
                    .write_read_slices(&extent.buffer_extents, &Bytes::new());
                child.complete(Ok(mapped_len as usize));
            }
            Err(err) => {
                log::error!("object read failed: oid={} err={err:?}", extent.oid);
                child.complete(Err(err));
            }
        }
    });
}

/// Cache lookup with store fall-through on miss.
async fn read_object(
    ictx: &ImageCtx,
    extent: &ObjectExtent,
    snap_id: Option<SnapId>,
    flags: OpFlags,
) -> Result<Bytes, Errno> {
    if let Some(cache) = &ictx.cache {
        if let Some(data) = cache
            .read(&extent.oid, extent.object_no, extent.offset, extent.length)
            .await?
        {
            return Ok(data);
        }
    }
    ictx.store
        .read(
            &extent.oid,
            extent.object_no,
            extent.offset,
            extent.length,
            snap_id,
            flags,
        )
        .await
}

/// Shared shape of the mutating variants: the write path below drives these
/// hooks in a fixed order (clip, journal, cache-or-store, stats).
trait AbstractWrite {
    fn ictx(&self) -> &Arc<ImageCtx>;
    fn comp(&self) -> &Arc<AioCompletion>;
    fn range(&self) -> (u64, u64);
    fn kind(&self) -> OpKind;
    fn journal_entry(&self) -> EventEntry;
    /// Build the object-level request for one extent, or `None` when the
    /// extent produces no child op.
    fn object_request(&self, extent: &ObjectExtent, snapc: &SnapContext) -> Option<ObjectRequest>;
    fn send_cache_requests(&self, extents: &[ObjectExtent], snapc: &SnapContext);
    fn update_stats(&self, clip_len: u64);
}

fn send_write_request(req: &impl AbstractWrite) {
    let ictx = req.ictx();
    let comp = req.comp();
    let _md = ictx.md_lock.read();

    let (off, len) = req.range();
    let mut clip_len = len;
    let snapc;
    let journaling;
    let mut object_extents = BTreeMap::new();
    {
        // The snap lock pins the image size between clipping and recording
        // the pending op.
        let snap = ictx.snap.read();
        if snap.snap_id.is_some() || snap.read_only {
            comp.fail(Errno::ROFS);
            return;
        }
        if let Err(err) = snap.clip_request(off, &mut clip_len) {
            log::error!("invalid write extent: off={off} len={len}");
            comp.fail(err);
            return;
        }
        snapc = snap.snapc.clone();
        comp.start_op(req.kind(), Some(ictx.start_op()));
        if clip_len > 0 {
            striper::file_to_extents(&ictx.layout, off, clip_len, 0, &mut object_extents);
        }
        journaling = ictx.journal.is_some();
    }
    let extents: Vec<ObjectExtent> = object_extents.into_values().flatten().collect();

    // If journaling, stash built requests; the journal sends each one when
    // its entry is durable.
    let mut stashed = Vec::new();
    for extent in &extents {
        log::trace!(
            " oid {} {}~{} from {:?}",
            extent.oid,
            extent.offset,
            extent.length,
            extent.buffer_extents,
        );
        if let Some(request) = req.object_request(extent, &snapc) {
            if journaling {
                stashed.push(request);
            } else {
                request.send();
            }
        }
    }

    if journaling {
        let journal = ictx.journal.as_ref().unwrap();
        journal.append_event(comp, req.journal_entry(), stashed, false);
    }

    if ictx.cache.is_some() {
        req.send_cache_requests(&extents, &snapc);
    }

    req.update_stats(clip_len);
    comp.finish_adding_requests();
}

pub(crate) struct ImageWrite {
    ictx: Arc<ImageCtx>,
    comp: Arc<AioCompletion>,
    off: u64,
    data: Bytes,
    flags: OpFlags,
}

impl ImageWrite {
    /// Concatenate the caller-buffer slices backing one object extent into
    /// its wire payload. The common single-slice case is zero-copy.
    fn assemble_extent(&self, extent: &ObjectExtent) -> Bytes {
        if let [(ofs, len)] = extent.buffer_extents[..] {
            return self.data.slice(ofs as usize..(ofs + len) as usize);
        }
        let mut payload = BytesMut::with_capacity(extent.length as usize);
        for &(ofs, len) in &extent.buffer_extents {
            payload.extend_from_slice(&self.data[ofs as usize..(ofs + len) as usize]);
        }
        payload.freeze()
    }
}

impl AbstractWrite for ImageWrite {
    fn ictx(&self) -> &Arc<ImageCtx> {
        &self.ictx
    }

    fn comp(&self) -> &Arc<AioCompletion> {
        &self.comp
    }

    fn range(&self) -> (u64, u64) {
        (self.off, self.data.len() as u64)
    }

    fn kind(&self) -> OpKind {
        OpKind::Write
    }

    fn journal_entry(&self) -> EventEntry {
        EventEntry::AioWrite {
            off: self.off,
            len: self.data.len() as u64,
            data: self.data.clone(),
        }
    }

    fn object_request(&self, extent: &ObjectExtent, snapc: &SnapContext) -> Option<ObjectRequest> {
        if self.ictx.cache.is_some() {
            // The cache owns the data path.
            return None;
        }
        Some(ObjectRequest::new(
            Arc::clone(&self.ictx),
            extent.oid.clone(),
            extent.object_no,
            ObjectOp::Write {
                offset: extent.offset,
                data: self.assemble_extent(extent),
                flags: self.flags,
            },
            snapc.clone(),
            ChildCompletion::new(&self.comp),
        ))
    }

    fn send_cache_requests(&self, extents: &[ObjectExtent], _snapc: &SnapContext) {
        let Some(cache) = &self.ictx.cache else { return };
        for extent in extents {
            let payload = self.assemble_extent(extent);
            let child = ChildCompletion::new(&self.comp);
            let cache = Arc::clone(cache);
            let oid = extent.oid.clone();
            let (object_no, offset) = (extent.object_no, extent.offset);
            self.ictx.runtime.spawn(async move {
                let result = cache.write(&oid, object_no, offset, payload).await;
                if let Err(err) = result {
                    log::error!("cache write failed: oid={oid} err={err:?}");
                }
                child.complete(result.map(|()| 0));
            });
        }
    }

    fn update_stats(&self, clip_len: u64) {
        let stats = &self.ictx.stats;
        stats.inc(&stats.wr, &stats.wr_bytes, clip_len);
    }
}

pub(crate) struct ImageDiscard {
    ictx: Arc<ImageCtx>,
    comp: Arc<AioCompletion>,
    off: u64,
    len: u64,
}

impl AbstractWrite for ImageDiscard {
    fn ictx(&self) -> &Arc<ImageCtx> {
        &self.ictx
    }

    fn comp(&self) -> &Arc<AioCompletion> {
        &self.comp
    }

    fn range(&self) -> (u64, u64) {
        (self.off, self.len)
    }

    fn kind(&self) -> OpKind {
        OpKind::Discard
    }

    fn journal_entry(&self) -> EventEntry {
        EventEntry::AioDiscard {
            off: self.off,
            len: self.len,
        }
    }

    fn object_request(&self, extent: &ObjectExtent, snapc: &SnapContext) -> Option<ObjectRequest> {
        let object_size = self.ictx.layout.object_size;
        // Whole object: remove. Tail: truncate. Anything else costs real I/O
        // to zero and may be skipped when the user accepts stale data under
        // the discard.
        let op = if extent.length == object_size {
            ObjectOp::Remove
        } else if extent.offset + extent.length == object_size {
            ObjectOp::Truncate {
                offset: extent.offset,
            }
        } else if self.ictx.options.skip_partial_discard {
            return None;
        } else {
            ObjectOp::Zero {
                offset: extent.offset,
                length: extent.length,
            }
        };
        Some(ObjectRequest::new(
            Arc::clone(&self.ictx),
            extent.oid.clone(),
            extent.object_no,
            op,
            snapc.clone(),
            ChildCompletion::new(&self.comp),
        ))
    }

    fn send_cache_requests(&self, extents: &[ObjectExtent], _snapc: &SnapContext) {
        let Some(cache) = &self.ictx.cache else { return };
        let _cache_lock = self.ictx.cache_lock.lock();
        cache.discard(extents);
    }

    fn update_stats(&self, clip_len: u64) {
        let stats = &self.ictx.stats;
        stats.inc(&stats.discard, &stats.discard_bytes, clip_len);
    }
}

pub(crate) struct ImageFlush {
    ictx: Arc<ImageCtx>,
    comp: Arc<AioCompletion>,
}

impl ImageFlush {
    fn send_request(&self) {
        let ictx = &self.ictx;
        let comp = &self.comp;

        {
            let _snap = ictx.snap.read();
            if let Some(journal) = &ictx.journal {
                journal.append_event(comp, EventEntry::AioFlush, Vec::new(), true);
            }
        }

        // Flush ops are not themselves registered in the in-flight registry,
        // or they would wait on their own drain.
        comp.start_op(OpKind::Flush, None);

        // Two phases: drain every in-flight image op, then issue the
        // downstream flush primitive. Writes submitted before this flush are
        // visible to the cache or store before it flushes.
        let child = ChildCompletion::new(comp);
        let ictx2 = Arc::clone(ictx);
        ictx.flush_async_operations(Box::new(move || {
            let runtime = ictx2.runtime.clone();
            runtime.spawn(async move {
                let result = match &ictx2.cache {
                    Some(cache) => cache.flush().await,
                    None => ictx2.store.flush().await,
                };
                if let Err(err) = result {
                    log::error!("flush failed: {err:?}");
                }
                child.complete(result.map(|()| 0));
            });
        }));

        comp.finish_adding_requests();
        ictx.stats.flush.fetch_add(1, Ordering::Relaxed);
    }
}
