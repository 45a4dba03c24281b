//! Object-level RPC interface consumed by the request pipeline, plus an
//! in-memory implementation for tests and embedding without a real cluster.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use rustix::io::Errno;

use crate::image_request::OpFlags;

/// Snapshot identifier. Requests against the live image carry `None`
/// ("HEAD") at the image layer and resolve here to a concrete id.
pub type SnapId = u64;

/// The set of snapshots a mutating op must be recorded against for
/// copy-on-write, newest first, with the sequence number of the most recent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapContext {
    pub seq: u64,
    pub snaps: Vec<SnapId>,
}

/// One object-level operation client. Every call submits a single op against
/// a single object and resolves with its result; the pipeline fans image
/// requests out into these and aggregates.
///
/// Reading a missing object reports `Errno::NOENT`; the pipeline maps that to
/// zero-filled data, so sparse images read as zeroes. A short read (object
/// smaller than the requested range) returns the available bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn read(
        &self,
        oid: &str,
        object_no: u64,
        off: u64,
        len: u64,
        snap_id: Option<SnapId>,
        flags: OpFlags,
    ) -> Result<Bytes, Errno>;

    async fn write(
        &self,
        oid: &str,
        object_no: u64,
        off: u64,
        data: Bytes,
        snapc: &SnapContext,
        flags: OpFlags,
    ) -> Result<(), Errno>;

    /// Remove the whole object. Removing a missing object succeeds.
    async fn remove(&self, oid: &str, object_no: u64, snapc: &SnapContext) -> Result<(), Errno>;

    /// Drop object bytes at and beyond `off`.
    async fn truncate(
        &self,
        oid: &str,
        object_no: u64,
        off: u64,
        snapc: &SnapContext,
    ) -> Result<(), Errno>;

    /// Zero `[off, off + len)` without changing the object's size beyond it.
    async fn zero(
        &self,
        oid: &str,
        object_no: u64,
        off: u64,
        len: u64,
        snapc: &SnapContext,
    ) -> Result<(), Errno>;

    /// Make previously acknowledged writes durable.
    async fn flush(&self) -> Result<(), Errno>;
}

/// Objects held in process memory, keyed by object number.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<u64, BytesMut>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_len(&self, object_no: u64) -> Option<usize> {
        self.objects.read().get(&object_no).map(BytesMut::len)
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read(
        &self,
        _oid: &str,
        object_no: u64,
        off: u64,
        len: u64,
        _snap_id: Option<SnapId>,
        _flags: OpFlags,
    ) -> Result<Bytes, Errno> {
        let objects = self.objects.read();
        let data = objects.get(&object_no).ok_or(Errno::NOENT)?;
        let start = Ord::min(off as usize, data.len());
        let end = Ord::min(start + len as usize, data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write(
        &self,
        _oid: &str,
        object_no: u64,
        off: u64,
        data: Bytes,
        _snapc: &SnapContext,
        _flags: OpFlags,
    ) -> Result<(), Errno> {
        let mut objects = self.objects.write();
        let object = objects.entry(object_no).or_default();
        let end = off as usize + data.len();
        if object.len() < end {
            object.resize(end, 0);
        }
        object[off as usize..end].copy_from_slice(&data);
        Ok(())
    }

    async fn remove(
        &self,
        _oid: &str,
        object_no: u64,
        _snapc: &SnapContext,
    ) -> Result<(), Errno> {
        self.objects.write().remove(&object_no);
        Ok(())
    }

    async fn truncate(
        &self,
        _oid: &str,
        object_no: u64,
        off: u64,
        _snapc: &SnapContext,
    ) -> Result<(), Errno> {
        let mut objects = self.objects.write();
        if let Some(object) = objects.get_mut(&object_no) {
            object.truncate(off as usize);
        }
        Ok(())
    }

    async fn zero(
        &self,
        _oid: &str,
        object_no: u64,
        off: u64,
        len: u64,
        _snapc: &SnapContext,
    ) -> Result<(), Errno> {
        let mut objects = self.objects.write();
        if let Some(object) = objects.get_mut(&object_no) {
            let start = Ord::min(off as usize, object.len());
            let end = Ord::min(off as usize + len as usize, object.len());
            object[start..end].fill(0);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), Errno> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: OpFlags = OpFlags::empty();

    #[tokio::test]
    async fn missing_object_reports_noent() {
        let store = MemoryStore::new();
        let err = store.read("o", 0, 0, 16, None, NONE).await.unwrap_err();
        assert_eq!(err, Errno::NOENT);
    }

    #[tokio::test]
    async fn write_extends_and_read_clips() {
        let store = MemoryStore::new();
        let snapc = SnapContext::default();
        store
            .write("o", 3, 8, Bytes::from_static(&[7u8; 8]), &snapc, NONE)
            .await
            .unwrap();
        assert_eq!(store.object_len(3), Some(16));

        let data = store.read("o", 3, 0, 64, None, NONE).await.unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(&data[..8], &[0u8; 8]);
        assert_eq!(&data[8..], &[7u8; 8]);
    }

    #[tokio::test]
    async fn truncate_and_zero() {
        let store = MemoryStore::new();
        let snapc = SnapContext::default();
        store
            .write("o", 0, 0, Bytes::from_static(&[9u8; 16]), &snapc, NONE)
            .await
            .unwrap();
        store.zero("o", 0, 4, 4, &snapc).await.unwrap();
        store.truncate("o", 0, 12, &snapc).await.unwrap();

        let data = store.read("o", 0, 0, 16, None, NONE).await.unwrap();
        assert_eq!(&data[..], &[9, 9, 9, 9, 0, 0, 0, 0, 9, 9, 9, 9]);
    }
}
