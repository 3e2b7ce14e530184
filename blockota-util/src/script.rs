use crate::artifacts::PartitionArtifacts;
use blockota_image::RangeSet;

/// Hooks for emitting the device-side update script.
///
/// The builder calls [`verify_source`](Self::verify_source) for every built
/// partition first, then [`block_update`](Self::block_update) for every built
/// partition, so a script can check all sources before writing anything.
pub trait ScriptHooks {
    /// Source blocks `touched` must digest to `hash` before `partition` is
    /// updated.
    fn verify_source(&self, _partition: &str, _touched: &RangeSet, _hash: &str) {}

    /// `partition` is to be updated from `artifacts`.
    fn block_update(&self, _partition: &str, _artifacts: &PartitionArtifacts) {}
}

/// Hooks that emit nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScript;

impl ScriptHooks for NoScript {}

impl<H: ScriptHooks + ?Sized> ScriptHooks for &H {
    fn verify_source(&self, partition: &str, touched: &RangeSet, hash: &str) {
        (**self).verify_source(partition, touched, hash);
    }

    fn block_update(&self, partition: &str, artifacts: &PartitionArtifacts) {
        (**self).block_update(partition, artifacts);
    }
}
