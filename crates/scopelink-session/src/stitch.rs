//! Scan tile stitching through an external tool.
//!
//! The tool is given the scratch directory as its last argument and is
//! expected to leave `<scratch>/<scratch-name>_stitched.jpg` behind.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

/// External stitching program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchTool {
    /// Program to run
    pub program: PathBuf,
    /// Arguments placed before the scratch directory
    #[serde(default)]
    pub args: Vec<String>,
}

impl StitchTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for StitchTool {
    fn default() -> Self {
        Self::new("openflexure-stitch")
    }
}

/// Where the tool leaves its result for `scratch`.
pub fn stitched_output(scratch: &Path) -> Result<PathBuf> {
    let name = scratch
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            SessionError::ExternalTool(format!(
                "scratch directory {} has no usable name",
                scratch.display()
            ))
        })?;
    Ok(scratch.join(format!("{}_stitched.jpg", name)))
}

/// Write `tiles` into `scratch`, stitch them and move the result to `output`.
///
/// **Destructive:** an existing `scratch` directory is removed with all of
/// its contents before the tiles are written.
pub async fn stitch_tiles(
    tool: &StitchTool,
    tiles: &[Vec<u8>],
    scratch: &Path,
    output: &Path,
) -> Result<PathBuf> {
    let expected = stitched_output(scratch)?;

    prepare_scratch(scratch).await?;
    for (i, tile) in tiles.iter().enumerate() {
        tokio::fs::write(scratch.join(format!("{}.jpeg", i)), tile).await?;
    }
    debug!("Wrote {} tile(s) to {}", tiles.len(), scratch.display());

    info!(
        "Running stitching tool {} on {}",
        tool.program.display(),
        scratch.display()
    );
    let status = Command::new(&tool.program)
        .args(&tool.args)
        .arg(scratch)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| {
            SessionError::ExternalTool(format!(
                "cannot run {}: {}",
                tool.program.display(),
                e
            ))
        })?;

    if !status.success() {
        return Err(SessionError::ExternalTool(format!(
            "{} exited with {}",
            tool.program.display(),
            status
        )));
    }

    if !tokio::fs::try_exists(&expected).await.unwrap_or(false) {
        return Err(SessionError::ExternalTool(format!(
            "expected output {} was not produced",
            expected.display()
        )));
    }

    move_file(&expected, output).await?;
    info!("Stitched image written to {}", output.display());
    Ok(output.to_path_buf())
}

async fn prepare_scratch(scratch: &Path) -> Result<()> {
    if tokio::fs::try_exists(scratch).await? {
        warn!("Removing existing scratch directory {}", scratch.display());
        tokio::fs::remove_dir_all(scratch).await?;
    }
    tokio::fs::create_dir_all(scratch).await?;
    Ok(())
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Cross-device moves.
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stitched_output_name() {
        let out = stitched_output(Path::new("/tmp/scan_042")).unwrap();
        assert_eq!(out, PathBuf::from("/tmp/scan_042/scan_042_stitched.jpg"));
        assert!(stitched_output(Path::new("/")).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stitch_moves_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("tiles");
        let output = dir.path().join("out").join("stitched.jpeg");

        // A leftover from a previous run must be gone afterwards.
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("stale.jpeg"), b"old").unwrap();

        let tool = StitchTool::new("sh").with_args([
            "-c",
            r#"cat "$0"/0.jpeg "$0"/1.jpeg > "$0/$(basename "$0")_stitched.jpg""#,
        ]);
        let tiles = vec![b"left".to_vec(), b"right".to_vec()];

        let written = stitch_tiles(&tool, &tiles, &scratch, &output).await.unwrap();
        assert_eq!(written, output);
        assert_eq!(std::fs::read(&output).unwrap(), b"leftright");
        assert!(!scratch.join("stale.jpeg").exists());
        assert!(!scratch.join("tiles_stitched.jpg").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_failures() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("tiles");
        let output = dir.path().join("stitched.jpeg");
        let tiles = vec![b"tile".to_vec()];

        let failing = StitchTool::new("sh").with_args(["-c", "exit 3"]);
        let err = stitch_tiles(&failing, &tiles, &scratch, &output).await.unwrap_err();
        assert!(matches!(err, SessionError::ExternalTool(_)));

        let silent = StitchTool::new("true");
        let err = stitch_tiles(&silent, &tiles, &scratch, &output).await.unwrap_err();
        assert!(err.to_string().contains("was not produced"));

        let missing = StitchTool::new("/nonexistent/stitcher");
        let err = stitch_tiles(&missing, &tiles, &scratch, &output).await.unwrap_err();
        assert!(err.to_string().contains("cannot run"));
    }
}
