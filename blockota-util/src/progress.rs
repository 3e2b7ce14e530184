use crate::artifacts::PartitionArtifacts;

/// Trait for receiving build progress updates.
///
/// All methods take `&self` so a reporter can be shared with code running on
/// other threads.
pub trait UpdateProgress: Send + Sync {
    /// Called when a partition starts generating.
    fn partition_start(&self, _name: &str, _current: usize, _total: usize) {}

    /// Called when a partition cannot be built incrementally and is left out.
    fn partition_skipped(&self, _name: &str, _reason: &str) {}

    /// Called when a partition's artifacts have been written.
    fn partition_completed(&self, _name: &str, _artifacts: &PartitionArtifacts) {}

    /// Called once every configured partition was either built or skipped.
    fn build_completed(&self, _built: usize, _skipped: usize) {}
}

/// A no-op progress implementation that discards all updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentProgress;

impl UpdateProgress for SilentProgress {}

impl<P: UpdateProgress + ?Sized> UpdateProgress for &P {
    fn partition_start(&self, name: &str, current: usize, total: usize) {
        (**self).partition_start(name, current, total);
    }

    fn partition_skipped(&self, name: &str, reason: &str) {
        (**self).partition_skipped(name, reason);
    }

    fn partition_completed(&self, name: &str, artifacts: &PartitionArtifacts) {
        (**self).partition_completed(name, artifacts);
    }

    fn build_completed(&self, built: usize, skipped: usize) {
        (**self).build_completed(built, skipped);
    }
}

/// Console progress reporter using an indicatif progress bar.
///
/// Skipped partitions are printed above the bar so they stay visible after
/// it is cleared.
#[cfg(feature = "console")]
pub struct ConsoleProgress {
    bar: indicatif::ProgressBar,
}

#[cfg(feature = "console")]
impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            bar: indicatif::ProgressBar::hidden(),
        }
    }
}

#[cfg(feature = "console")]
impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "console")]
impl UpdateProgress for ConsoleProgress {
    fn partition_start(&self, name: &str, current: usize, total: usize) {
        if current == 0 {
            self.bar
                .set_draw_target(indicatif::ProgressDrawTarget::stderr());
            self.bar.set_length(total as u64);
            self.bar.set_position(0);

            if let Ok(style) = indicatif::ProgressStyle::default_bar()
                .template("{bar:40.cyan/blue} {pos}/{len} partitions {msg} [{elapsed_precise}]")
            {
                self.bar.set_style(style.progress_chars("━╸─"));
            }

            self.bar.reset();
        }

        self.bar.set_message(name.to_owned());
    }

    fn partition_skipped(&self, name: &str, reason: &str) {
        self.bar.println(format!("Skipping {name}: {reason}"));
        self.bar.inc(1);
    }

    fn partition_completed(&self, name: &str, artifacts: &PartitionArtifacts) {
        let list = &artifacts.update.transfer_list;

        self.bar.println(format!(
            "{name}: {} blocks, {} bytes new data, {} bytes patches, {} commands",
            list.total_blocks,
            artifacts.update.new_data_len,
            artifacts.update.patch_data_len,
            list.commands.len(),
        ));
        self.bar.inc(1);
    }

    fn build_completed(&self, built: usize, skipped: usize) {
        self.bar.finish_and_clear();
        println!("Incremental build complete ({built} built, {skipped} skipped).");
    }
}
