//! Batch progress events emitted by a population run.

use std::sync::Arc;

use plot_finder_parcel_models::KeyRange;

/// Receives batch events from [`crate::populate_get_good_parcels`].
pub trait ProgressCallback: Send + Sync {
    /// The key span has been cut into `total` batches.
    fn batches_planned(&self, total: u64);

    /// A batch committed `inserted` rows.
    fn batch_done(&self, range: KeyRange, inserted: u64);

    /// Every batch committed and the index is built.
    fn finished(&self, inserted: u64);

    /// The run failed or was cancelled.
    fn abandoned(&self);
}

/// Discards every event. Used by the HTTP admin endpoint.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn batches_planned(&self, _total: u64) {}
    fn batch_done(&self, _range: KeyRange, _inserted: u64) {}
    fn finished(&self, _inserted: u64) {}
    fn abandoned(&self) {}
}

#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
