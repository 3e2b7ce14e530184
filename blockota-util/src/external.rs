//! Running bsdiff/imgdiff style executables.

use blockota_diff::differ::{DiffError, DiffMode, Differ};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// A [`Differ`] backed by an external diff executable.
///
/// The tool is invoked as `<program> [args] [-b 1] -s <source> -d <target>
/// -p <patch>`, where `-b 1` asks for a plain byte-level patch and its
/// absence for an image-aware one. Inputs and output are staged in a fresh
/// temporary directory per call, so one differ can serve many threads.
#[derive(Debug, Clone)]
pub struct ExternalDiffer {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExternalDiffer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Adds an argument passed before the diff options, e.g. a script for an
    /// interpreter.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    #[must_use]
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl Differ for ExternalDiffer {
    fn diff(&self, source: &[u8], target: &[u8], mode: DiffMode) -> Result<Vec<u8>, DiffError> {
        let dir = tempfile::Builder::new()
            .prefix("blockota-diff-")
            .tempdir()
            .map_err(|e| DiffError::Io { source: e })?;

        let source_path = dir.path().join("source");
        let target_path = dir.path().join("target");
        let patch_path = dir.path().join("patch");

        std::fs::write(&source_path, source).map_err(|e| DiffError::Io { source: e })?;
        std::fs::write(&target_path, target).map_err(|e| DiffError::Io { source: e })?;

        let mut command = Command::new(&self.program);
        command.args(&self.args);

        if mode == DiffMode::Bsdiff {
            command.args(["-b", "1"]);
        }

        command
            .arg("-s")
            .arg(&source_path)
            .arg("-d")
            .arg(&target_path)
            .arg("-p")
            .arg(&patch_path);

        let program = self.program.display().to_string();
        let output = command.output().map_err(|e| DiffError::Spawn {
            program: program.clone(),
            source: e,
        })?;

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));

            return Err(DiffError::ToolFailed {
                program,
                status: output.status.to_string(),
                output: text.trim().to_owned(),
            });
        }

        let patch = std::fs::read(&patch_path).map_err(|e| DiffError::Io { source: e })?;

        debug!(
            %program,
            %mode,
            source_bytes = source.len(),
            target_bytes = target.len(),
            patch_bytes = patch.len(),
            "external diff finished"
        );

        Ok(patch)
    }
}
