mod error;

pub use self::error::BuildError;

use crate::artifacts::{PartitionArtifacts, write_artifacts};
use crate::progress::UpdateProgress;
use crate::script::ScriptHooks;
use crate::{ImagePaths, open_image};
use blockota_diff::{Differ, UpdateConfig};
use blockota_image::ImageOptions;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Where an incremental build reads images from and writes updates to.
#[derive(Debug, Clone)]
#[must_use]
pub struct BuildOptions {
    source_dir: PathBuf,
    target_dir: PathBuf,
    output_dir: PathBuf,
    partitions: Vec<String>,
    image: ImageOptions,
    update: UpdateConfig,
}

impl BuildOptions {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            target_dir: target_dir.into(),
            output_dir: output_dir.into(),
            partitions: Vec::new(),
            image: ImageOptions::default(),
            update: UpdateConfig::default(),
        }
    }

    /// Partitions to build, in order. Each one is looked up as
    /// `<name>.img` and `<name>.map` in both image directories.
    pub fn with_partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partitions = partitions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_image_options(mut self, options: ImageOptions) -> Self {
        self.image = options;
        self
    }

    pub fn with_update_config(mut self, config: UpdateConfig) -> Self {
        self.update = config;
        self
    }

    #[must_use]
    pub fn partitions(&self) -> &[String] {
        &self.partitions
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// Outcome of an incremental build.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub built: Vec<PartitionArtifacts>,
    /// Partitions left out, with the reason.
    pub skipped: Vec<(String, String)>,
}

/// Builds block updates for a set of partitions.
pub struct IncrementalBuilder<'a, D: Differ, P: UpdateProgress, H: ScriptHooks> {
    options: &'a BuildOptions,
    differ: D,
    progress: P,
    hooks: H,
}

impl<'a, D: Differ, P: UpdateProgress, H: ScriptHooks> IncrementalBuilder<'a, D, P, H> {
    pub fn new(options: &'a BuildOptions, differ: D, progress: P, hooks: H) -> Self {
        Self {
            options,
            differ,
            progress,
            hooks,
        }
    }

    /// Builds every configured partition.
    ///
    /// A partition whose image or map is missing on either side is reported
    /// to the progress reporter and skipped. Script hooks run only after all
    /// partitions were written: first every source check, then every block
    /// update.
    ///
    /// # Safety
    ///
    /// Images are memory mapped. They must not be modified or truncated
    /// while the build runs.
    pub unsafe fn build(&self) -> Result<BuildReport, BuildError> {
        let options = self.options;
        let output = &options.output_dir;

        create_dir_all(output).map_err(|e| BuildError::CreateDirectoryFailed {
            path: output.clone(),
            source: e,
        })?;

        let total = options.partitions.len();
        let mut report = BuildReport::default();

        for (current, name) in options.partitions.iter().enumerate() {
            self.progress.partition_start(name, current, total);

            let source = ImagePaths::new(&options.source_dir, name);
            let target = ImagePaths::new(&options.target_dir, name);

            if let Some(missing) = source.missing().or_else(|| target.missing()) {
                let reason = format!("{} is missing", missing.display());

                warn!(partition = %name, %reason, "skipping partition");
                self.progress.partition_skipped(name, &reason);
                report.skipped.push((name.clone(), reason));
                continue;
            }

            let artifacts = unsafe { self.build_partition(name, &source, &target)? };

            self.progress.partition_completed(name, &artifacts);
            report.built.push(artifacts);
        }

        for artifacts in &report.built {
            let update = &artifacts.update;
            self.hooks.verify_source(
                &artifacts.partition,
                &update.touched_source,
                &update.touched_source_hash,
            );
        }

        for artifacts in &report.built {
            self.hooks.block_update(&artifacts.partition, artifacts);
        }

        info!(
            built = report.built.len(),
            skipped = report.skipped.len(),
            "incremental build finished"
        );
        self.progress
            .build_completed(report.built.len(), report.skipped.len());

        Ok(report)
    }

    unsafe fn build_partition(
        &self,
        name: &str,
        source: &ImagePaths,
        target: &ImagePaths,
    ) -> Result<PartitionArtifacts, BuildError> {
        let options = self.options;

        let source = unsafe { open_image(source, &options.image) }.map_err(|e| {
            BuildError::OpenSourceFailed {
                partition: name.to_owned(),
                source: e,
            }
        })?;
        let target = unsafe { open_image(target, &options.image) }.map_err(|e| {
            BuildError::OpenTargetFailed {
                partition: name.to_owned(),
                source: e,
            }
        })?;

        if source.as_bytes() == target.as_bytes() {
            return Err(BuildError::IdenticalImages {
                partition: name.to_owned(),
            });
        }

        info!(
            partition = name,
            source_blocks = source.total_blocks(),
            target_blocks = target.total_blocks(),
            "building partition update"
        );

        write_artifacts(
            &options.output_dir,
            name,
            &source,
            &target,
            &self.differ,
            &options.update,
        )
        .map_err(|e| BuildError::WriteArtifactsFailed {
            partition: name.to_owned(),
            source: e,
        })
    }
}
