use crate::OpenImageError;
use crate::artifacts::WriteArtifactsError;
use snafu::Snafu;
use std::path::PathBuf;

/// Errors that abort an incremental build.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum BuildError {
    #[snafu(display("cannot create directory {}: {source}", path.display()))]
    CreateDirectoryFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot open source image of {partition}: {source}"))]
    OpenSourceFailed {
        partition: String,
        source: OpenImageError,
    },

    #[snafu(display("cannot open target image of {partition}: {source}"))]
    OpenTargetFailed {
        partition: String,
        source: OpenImageError,
    },

    #[snafu(display("source and target images of {partition} are identical"))]
    IdenticalImages { partition: String },

    #[snafu(display("cannot build update for {partition}: {source}"))]
    WriteArtifactsFailed {
        partition: String,
        source: WriteArtifactsError,
    },
}
