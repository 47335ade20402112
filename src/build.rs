//! Boundary to the external build service.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context};

/// Produces a runnable artifact for a debug session.
pub trait BuildService: Send {
    /// Plain build of `program` into `output`.
    fn build(&self, output: &Path, program: &Path, flags: &str) -> anyhow::Result<()>;

    /// Test-harness build of `program` into `output`.
    fn test_build(&self, output: &Path, program: &Path, flags: &str) -> anyhow::Result<()>;

    /// Best-effort removal of a previously built artifact.
    fn remove(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!(target: "dap", "remove build artifact {}: {e}", path.display());
        }
    }
}

/// Builds debuggee binaries with the `go` tool, optimizations and inlining
/// disabled.
pub struct GoBuild {
    tool: PathBuf,
}

impl GoBuild {
    pub fn new() -> anyhow::Result<Self> {
        let tool = which::which("go").context("locate the go tool")?;
        Ok(GoBuild { tool })
    }

    fn run(&self, args: &[&str], flags: &str, program: &Path) -> anyhow::Result<()> {
        let mut cmd = Command::new(&self.tool);
        cmd.args(args);
        cmd.args(flags.split_whitespace());
        cmd.arg(program);
        log::debug!(target: "dap", "build: {cmd:?}");
        let out = cmd
            .output()
            .with_context(|| format!("spawn {}", self.tool.display()))?;
        if !out.status.success() {
            return Err(anyhow!(
                "{}",
                String::from_utf8_lossy(&out.stderr).trim().to_string()
            ));
        }
        Ok(())
    }
}

impl BuildService for GoBuild {
    fn build(&self, output: &Path, program: &Path, flags: &str) -> anyhow::Result<()> {
        let output = output.to_string_lossy();
        self.run(
            &["build", "-o", output.as_ref(), "-gcflags", "all=-N -l"],
            flags,
            program,
        )
    }

    fn test_build(&self, output: &Path, program: &Path, flags: &str) -> anyhow::Result<()> {
        let output = output.to_string_lossy();
        self.run(
            &["test", "-c", "-o", output.as_ref(), "-gcflags", "all=-N -l"],
            flags,
            program,
        )
    }
}
