//! Writing the per-partition update files.

use blockota_diff::generate::PartitionUpdate;
use blockota_diff::{Differ, UpdateConfig, generate_update};
use blockota_image::SparseImage;
use snafu::{ResultExt, Snafu};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

use write_artifacts_error::*;

/// Files written for one partition, and the update they describe.
#[derive(Debug, Clone)]
pub struct PartitionArtifacts {
    pub partition: String,
    pub new_data: PathBuf,
    pub patch_data: PathBuf,
    pub transfer_list: PathBuf,
    pub update: PartitionUpdate,
}

impl PartitionArtifacts {
    /// Returns the three paths `<partition>.new.dat`, `<partition>.patch.dat`
    /// and `<partition>.transfer.list` under `dir`.
    #[must_use]
    pub fn paths(dir: &Path, partition: &str) -> [PathBuf; 3] {
        [
            dir.join(format!("{partition}.new.dat")),
            dir.join(format!("{partition}.patch.dat")),
            dir.join(format!("{partition}.transfer.list")),
        ]
    }
}

/// Generates the update for `partition` and writes its files into `dir`.
///
/// The files are staged next to their final paths and only moved into place
/// once all three are complete, so a failed generation leaves `dir` as it
/// was. Existing files are replaced.
pub fn write_artifacts<S, T, D>(
    dir: &Path,
    partition: &str,
    source: &SparseImage<S>,
    target: &SparseImage<T>,
    differ: &D,
    config: &UpdateConfig,
) -> Result<PartitionArtifacts, WriteArtifactsError>
where
    S: AsRef<[u8]> + Sync,
    T: AsRef<[u8]> + Sync,
    D: Differ,
{
    let [new_path, patch_path, list_path] = PartitionArtifacts::paths(dir, partition);

    let mut new_data = stage(dir, &new_path)?;
    let mut patch_data = stage(dir, &patch_path)?;

    let update = generate_update(
        source,
        target,
        differ,
        config,
        &mut new_data,
        &mut patch_data,
    )
    .context(GenerateSnafu { partition })?;

    let mut list = stage(dir, &list_path)?;
    write!(list, "{}", update.transfer_list).context(WriteFailedSnafu { path: &list_path })?;

    let staged = [
        finish(new_data, &new_path)?,
        finish(patch_data, &patch_path)?,
        finish(list, &list_path)?,
    ];

    for (file, path) in staged.into_iter().zip([&new_path, &patch_path, &list_path]) {
        file.persist(path).context(PersistFailedSnafu { path })?;
    }

    info!(
        partition,
        dir = %dir.display(),
        new_bytes = update.new_data_len,
        patch_bytes = update.patch_data_len,
        "wrote update files"
    );

    Ok(PartitionArtifacts {
        partition: partition.to_owned(),
        new_data: new_path,
        patch_data: patch_path,
        transfer_list: list_path,
        update,
    })
}

/// Creates a temporary file in `dir` that will become `path`.
fn stage(dir: &Path, path: &Path) -> Result<BufWriter<NamedTempFile>, WriteArtifactsError> {
    tempfile::Builder::new()
        .prefix(".blockota-")
        .tempfile_in(dir)
        .map(BufWriter::new)
        .context(CreateFileFailedSnafu { path })
}

fn finish(
    writer: BufWriter<NamedTempFile>,
    path: &Path,
) -> Result<NamedTempFile, WriteArtifactsError> {
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context(WriteFailedSnafu { path })?;

    file.as_file().sync_all().context(WriteFailedSnafu { path })?;

    Ok(file)
}

/// Errors that can occur when writing update files.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum WriteArtifactsError {
    #[snafu(display("cannot create file {}", path.display()))]
    CreateFileFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot write to {}", path.display()))]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot move finished file to {}", path.display()))]
    PersistFailed {
        path: PathBuf,
        source: tempfile::PersistError,
    },

    #[snafu(display("cannot generate update for {partition}"))]
    Generate {
        partition: String,
        source: blockota_diff::Error,
    },
}
