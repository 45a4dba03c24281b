//! Child object operations and their completion plumbing.
//!
//! Mutating image requests build one `ObjectRequest` per object extent.
//! Without journaling they are sent immediately; with journaling the journal
//! holds them and sends each one once its event entry is durable.

use std::sync::Arc;

use bytes::Bytes;
use rustix::io::Errno;

use crate::completion::{AioCompletion, AioResult};
use crate::image::ImageCtx;
use crate::image_request::OpFlags;
use crate::object_store::SnapContext;

/// One-shot handle folding a child result into the parent completion.
/// Constructing it registers the child; dropping it unfired reports an I/O
/// error so an abandoned child can never wedge the parent.
pub(crate) struct ChildCompletion {
    comp: Arc<AioCompletion>,
    fired: bool,
}

impl ChildCompletion {
    pub(crate) fn new(comp: &Arc<AioCompletion>) -> Self {
        comp.add_request();
        Self {
            comp: Arc::clone(comp),
            fired: false,
        }
    }

    pub(crate) fn completion(&self) -> &Arc<AioCompletion> {
        &self.comp
    }

    pub(crate) fn complete(mut self, result: AioResult) {
        self.fired = true;
        self.comp.complete_request(result);
    }
}

impl Drop for ChildCompletion {
    fn drop(&mut self) {
        if !self.fired {
            self.comp.complete_request(Err(Errno::IO));
        }
    }
}

#[derive(Debug)]
pub(crate) enum ObjectOp {
    Write {
        offset: u64,
        data: Bytes,
        flags: OpFlags,
    },
    Remove,
    Truncate {
        offset: u64,
    },
    Zero {
        offset: u64,
        length: u64,
    },
}

pub(crate) struct ObjectRequest {
    ictx: Arc<ImageCtx>,
    oid: String,
    object_no: u64,
    op: ObjectOp,
    snapc: SnapContext,
    child: ChildCompletion,
}

impl ObjectRequest {
    pub(crate) fn new(
        ictx: Arc<ImageCtx>,
        oid: String,
        object_no: u64,
        op: ObjectOp,
        snapc: SnapContext,
        child: ChildCompletion,
    ) -> Self {
        Self {
            ictx,
            oid,
            object_no,
            op,
            snapc,
            child,
        }
    }

    /// Submit against the object store. The child completes on the runtime
    /// when the store resolves.
    pub(crate) fn send(self) {
        let Self {
            ictx,
            oid,
            object_no,
            op,
            snapc,
            child,
        } = self;
        log::trace!("object op: oid={oid} op={op:?}");
        ictx.runtime.clone().spawn(async move {
            let store = &ictx.store;
            let result = match op {
                ObjectOp::Write {
                    offset,
                    data,
                    flags,
                } => store.write(&oid, object_no, offset, data, &snapc, flags).await,
                ObjectOp::Remove => store.remove(&oid, object_no, &snapc).await,
                ObjectOp::Truncate { offset } => {
                    store.truncate(&oid, object_no, offset, &snapc).await
                }
                ObjectOp::Zero { offset, length } => {
                    store.zero(&oid, object_no, offset, length, &snapc).await
                }
            };
            if let Err(err) = result {
                log::error!("object op failed: oid={oid} err={err:?}");
            }
            child.complete(result.map(|()| 0));
        });
    }
}

impl std::fmt::Debug for ObjectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRequest")
            .field("oid", &self.oid)
            .field("op", &self.op)
            .finish_non_exhaustive()
    }
}
