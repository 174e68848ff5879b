//! Explicit suite context passed to the loader, asset cache and orchestrator.

use std::path::{Path, PathBuf};
use std::process::Command;

use lcevc_functest_error::{FunctestError, Result};

use crate::config::SuiteConfig;

/// Everything a suite run needs to know about its environment.
///
/// Contexts are plain values: several may coexist in one process.
#[derive(Debug, Clone)]
pub struct SuiteContext {
    pub config: SuiteConfig,
    /// Short hash of the source tree under test, or `"Unknown"`.
    pub git_hash: String,
}

impl SuiteContext {
    /// Build a context, resolving the git hash from the config or the
    /// enclosing repository.
    #[must_use]
    pub fn init(config: SuiteConfig) -> Self {
        let git_hash = config
            .git_hash
            .clone()
            .unwrap_or_else(|| discover_git_hash(Path::new(".")));
        Self { config, git_hash }
    }

    /// Context with a fixed git hash; no repository lookup.
    #[must_use]
    pub fn with_git_hash(config: SuiteConfig, git_hash: impl Into<String>) -> Self {
        Self {
            config,
            git_hash: git_hash.into(),
        }
    }

    /// Working directory of the test with the given id.
    #[must_use]
    pub fn test_dir(&self, test_id: usize) -> PathBuf {
        self.config.workdir.join(format!("test_{test_id}"))
    }

    /// Absolute path of an executable in the binary directory.
    pub fn executable(&self, name: &str) -> Result<PathBuf> {
        let file_name = if cfg!(windows) {
            format!("{name}.exe")
        } else {
            name.to_owned()
        };
        let path = self.config.bin_dir.join(file_name);
        if !self.config.is_adb_platform() && !path.exists() {
            return Err(FunctestError::assertion(format!(
                "executable '{}' does not exist",
                path.display()
            )));
        }
        Ok(absolute(&path))
    }

    /// Expand `{BASE}` references in a definition value to the bases cache.
    #[must_use]
    pub fn format_path(&self, value: &str) -> PathBuf {
        value.strip_prefix("{BASE}/").map_or_else(
            || absolute(Path::new(value)),
            |name| absolute(&self.config.bases_dir().join(name)),
        )
    }
}

/// Best-effort absolute path without touching the filesystem.
#[must_use]
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn discover_git_hash(dir: &Path) -> String {
    Command::new("git")
        .args(["rev-parse", "--short=8", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_owned())
        .filter(|hash| !hash.is_empty())
        .unwrap_or_else(|| "Unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;

    #[test]
    fn independent_contexts_do_not_share_state() {
        let a = SuiteContext::with_git_hash(
            ConfigBuilder::new().set("WORKDIR", "/tmp/a").build().unwrap(),
            "aaaa",
        );
        let b = SuiteContext::with_git_hash(
            ConfigBuilder::new().set("WORKDIR", "/tmp/b").build().unwrap(),
            "bbbb",
        );
        assert_eq!(a.test_dir(3), PathBuf::from("/tmp/a/test_3"));
        assert_eq!(b.test_dir(3), PathBuf::from("/tmp/b/test_3"));
        assert_ne!(a.git_hash, b.git_hash);
    }

    #[test]
    fn base_placeholder_resolves_into_cache() {
        let ctx = SuiteContext::with_git_hash(
            ConfigBuilder::new()
                .set("CACHE_PATH", "/cache")
                .build()
                .unwrap(),
            "x",
        );
        assert_eq!(
            ctx.format_path("{BASE}/foo_1920x1080.yuv"),
            PathBuf::from("/cache/bases/foo_1920x1080.yuv")
        );
        assert_eq!(ctx.format_path("/abs/file.yuv"), PathBuf::from("/abs/file.yuv"));
    }
}
