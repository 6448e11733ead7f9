use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::core::error::MergeError;

/// Joins ordered media fragments into one output file.
#[async_trait]
pub trait MergeTool: Send + Sync {
    fn name(&self) -> String;

    /// Confirms the tool can run at all, before any playlist is fetched.
    fn preflight(&self) -> Result<PathBuf, MergeError>;

    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError>;
}

pub struct FfmpegMerger {
    bin: PathBuf,
}

impl FfmpegMerger {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

/// ffmpeg concat-demuxer list; single quotes in paths are escaped.
pub fn concat_list(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|p| {
            let s = p.to_string_lossy().replace('\\', "/").replace('\'', r"'\''");
            format!("file '{s}'\n")
        })
        .collect()
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(8)..].join("\n")
}

#[async_trait]
impl MergeTool for FfmpegMerger {
    fn name(&self) -> String {
        self.bin.display().to_string()
    }

    fn preflight(&self) -> Result<PathBuf, MergeError> {
        which::which(&self.bin).map_err(|_| MergeError::ToolMissing(self.name()))
    }

    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        let dir = output.parent().unwrap_or_else(|| Path::new("."));
        let list = dir.join("filelist.txt");
        tokio::fs::write(&list, concat_list(inputs)).await?;

        tracing::debug!(tool = %self.bin.display(), inputs = inputs.len(), output = %output.display(), "merging");
        let result = Command::new(&self.bin)
            .args(["-hide_banner", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list)
            .args(["-c", "copy", "-y"])
            .arg(output)
            .kill_on_drop(true)
            .output()
            .await;

        let _ = tokio::fs::remove_file(&list).await;
        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(MergeError::ToolMissing(self.name())),
            Err(e) => return Err(MergeError::Io(e)),
        };
        if !out.status.success() {
            return Err(MergeError::Failed { code: out.status.code(), stderr: stderr_tail(&out.stderr) });
        }
        Ok(())
    }
}
