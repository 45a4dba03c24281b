//! Write-back object cache interface.
//!
//! The cache is a black box: the pipeline submits reads and writes to it when
//! attached and otherwise talks to the object store directly. It serializes
//! internally; only [`ObjectCache::discard`] is called under the image's
//! cache lock, because discards must not interleave with cache flushes.

use async_trait::async_trait;
use bytes::Bytes;
use rustix::io::Errno;

use crate::striper::{ImageExtent, ObjectExtent};

#[async_trait]
pub trait ObjectCache: Send + Sync + 'static {
    /// Look up object bytes. `Ok(None)` is a miss; the caller falls through
    /// to the object store.
    async fn read(
        &self,
        oid: &str,
        object_no: u64,
        off: u64,
        len: u64,
    ) -> Result<Option<Bytes>, Errno>;

    /// Buffer an object write. The cache owns writing it back; the image
    /// request completes once the cache has accepted the data.
    async fn write(&self, oid: &str, object_no: u64, off: u64, data: Bytes)
        -> Result<(), Errno>;

    /// Drop cached data covering the given object extents. Called with the
    /// image's cache lock held.
    fn discard(&self, extents: &[ObjectExtent]);

    /// Write back everything buffered.
    async fn flush(&self) -> Result<(), Errno>;

    /// Advisory prefetch hint for an upcoming sequential read. Best effort;
    /// errors are the cache's own problem.
    fn readahead(&self, _extents: &[ImageExtent]) {}
}
