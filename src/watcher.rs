//! Advisory exclusive-lock observation.
//!
//! The watcher coordinates a soft image-level lock between clients. The
//! request queue consults it before dispatching mutating ops and keeps it
//! informed about outstanding mutating work so it does not release the lock
//! mid-write. Acquisition is asynchronous: `request_lock` starts it, and the
//! queue re-examines `lock_owner` when it wakes.

pub trait ImageWatcher: Send + Sync + 'static {
    /// Whether the advisory-lock feature is enabled for this image.
    fn lock_supported(&self) -> bool;

    /// Whether this client currently holds the lock.
    fn lock_owner(&self) -> bool;

    /// Begin asynchronous lock acquisition. Completion is observed through
    /// later `lock_owner` transitions.
    fn request_lock(&self);

    /// Mutating work is queued; hold on to the lock.
    fn flag_aio_ops_pending(&self);

    /// No mutating work remains queued.
    fn clear_aio_ops_pending(&self);
}
