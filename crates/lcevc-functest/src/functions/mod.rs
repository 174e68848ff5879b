//! Test bodies selected by the `Test Function` column.
//!
//! A body receives the record, the shared [`TestEnv`] and a [`TestRun`] to
//! record command lines and regenerated hashes into. Returning an error
//! fails the test, except [`FunctestError::Ignored`] which marks it ignored.

mod asset_hash;
mod compliance_hash;
mod tolerance;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lcevc_functest_error::{FunctestError, Result};
use tracing::debug;

use crate::adb::{AdbBridge, RemoteRunner};
use crate::assets::AssetCache;
use crate::cancel::CancellationToken;
use crate::config::HashSource;
use crate::context::SuiteContext;
use crate::hashes::{HashEntry, RegressionHashStore, TestIdentity};
use crate::ltm::Ltm;
use crate::record::{TestFunctionKind, TestRecord};
use crate::runner::{LocalRunner, ProcessRunner};

/// File the decoders write their output hashes to.
pub const HASH_FILE: &str = "hashes.json";

/// Shared, read-mostly state every test body can reach.
pub struct TestEnv {
    pub ctx: SuiteContext,
    pub assets: AssetCache,
    /// Present when expected hashes come from the JSON ledger.
    pub hashes: Option<RegressionHashStore>,
    /// Present on regeneration runs.
    pub ltm: Option<Ltm>,
    /// Present on device platforms.
    pub adb: Option<Arc<AdbBridge>>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for TestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnv")
            .field("platform", &self.ctx.config.platform)
            .field("assets", &self.assets)
            .field("ltm", &self.ltm)
            .finish_non_exhaustive()
    }
}

impl TestEnv {
    #[must_use]
    pub fn regen(&self) -> bool {
        self.ctx.config.full_regen()
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.adb.is_some()
    }

    /// Runner for `executable` in `test_dir`, on the device when there is
    /// one.
    pub fn runner(&self, executable: &Path, test_dir: &Path) -> Result<Box<dyn ProcessRunner>> {
        match &self.adb {
            Some(bridge) => Ok(Box::new(RemoteRunner::new(
                Arc::clone(bridge),
                executable,
                test_dir,
                &self.ctx.config,
            )?)),
            None => Ok(Box::new(LocalRunner::new(
                executable,
                test_dir,
                &self.ctx.config,
            ))),
        }
    }

    /// The model decoder; only available on regeneration runs.
    pub fn ltm(&self) -> Result<&Ltm> {
        self.ltm
            .as_ref()
            .ok_or_else(|| FunctestError::Ltm("the model decoder was not initialised".to_owned()))
    }

    /// Hashes `test` is expected to produce, keyed by surface.
    ///
    /// On a regeneration run the expectations are not needed and an empty
    /// map may come back.
    pub fn expected_hashes(&self, test: &TestRecord) -> Result<HashEntry> {
        let regen = self.regen();
        match (self.ctx.config.hash_source, &self.hashes) {
            (HashSource::Ledger, Some(store)) => store.get(
                &TestIdentity::of_record(test),
                regen,
                &self.ctx.config.hash_key_exclude,
            ),
            (HashSource::Ledger, None) => Err(FunctestError::config(
                "HASH_SOURCE is ledger but no hash data directory is configured",
            )),
            (HashSource::Csv, _) => {
                let expected = test.params.expected_hashes();
                if expected.is_empty() && !regen {
                    return Err(FunctestError::MissingHashes(test.origin()));
                }
                Ok(expected)
            }
        }
    }
}

/// What one execution of a test body produced besides pass or fail.
#[derive(Debug, Clone, Default)]
pub struct TestRun {
    pub test_dir: PathBuf,
    pub command_lines: BTreeMap<String, Vec<String>>,
    pub regenerated_hashes: BTreeMap<String, String>,
}

impl TestRun {
    #[must_use]
    pub fn new(test_dir: impl Into<PathBuf>) -> Self {
        Self {
            test_dir: test_dir.into(),
            ..Self::default()
        }
    }

    pub fn record_cmd(&mut self, name: &str, command_line: Vec<String>) {
        debug!(name, command = %command_line.join(" "), "running");
        self.command_lines.insert(name.to_owned(), command_line);
    }

    pub fn record_regenerated_hash(&mut self, surface: &str, hash: impl Into<String>) {
        self.regenerated_hashes.insert(surface.to_owned(), hash.into());
    }
}

/// Execute the body registered for `test.function`.
pub fn run_test_function(test: &TestRecord, env: &TestEnv, run: &mut TestRun) -> Result<()> {
    match test.function {
        TestFunctionKind::AssetHash => asset_hash::run(test, env, run),
        TestFunctionKind::ComplianceHash => compliance_hash::run(test, env, run),
        TestFunctionKind::Tolerance => tolerance::run(test, env, run),
    }
}

// ─── Shared helpers ────────────────────────────────────────────────────

/// Read a `{surface: hash}` document written by a decoder.
pub(crate) fn read_hash_file(path: &Path) -> Result<HashEntry> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        FunctestError::assertion(format!(
            "no hash file at '{}': {err}",
            path.display()
        ))
    })?;
    let document: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)?;
    Ok(document
        .into_iter()
        .map(|(surface, value)| {
            let hash = match value {
                serde_json::Value::String(hash) => hash,
                other => other.to_string(),
            };
            (surface, hash)
        })
        .collect())
}

/// Every expected surface hash must equal the generated one.
pub(crate) fn compare_hashes(expected: &HashEntry, generated: &HashEntry) -> Result<()> {
    for (surface, hash) in expected {
        let actual = generated.get(surface).map_or("<missing>", String::as_str);
        if actual != hash {
            return Err(FunctestError::HashMismatch {
                surface: surface.clone(),
                expected: hash.clone(),
                actual: actual.to_owned(),
            });
        }
    }
    Ok(())
}

/// An asset the server has never published (404) marks the test ignored
/// rather than failed. Every other error passes through.
pub(crate) fn ignore_unpublished(err: FunctestError) -> FunctestError {
    match err {
        FunctestError::Origin { url, status: 404, .. } => {
            FunctestError::Ignored(format!("asset not published on the server: {url}"))
        }
        other => other,
    }
}

/// A required parameter parsed as a number.
pub(crate) fn meta_number<T: std::str::FromStr>(test: &TestRecord, param: &str) -> Result<T> {
    let value = test
        .params
        .meta
        .get(param)
        .ok_or_else(|| FunctestError::assertion(format!("missing meta:{param}")))?;
    value.trim().parse().map_err(|_| {
        FunctestError::assertion(format!("meta:{param} must be a number, not '{value}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pairs: &[(&str, &str)]) -> HashEntry {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn hash_comparison_reports_the_surface() {
        let expected = entry(&[("base", "aa"), ("high", "bb")]);
        compare_hashes(&expected, &entry(&[("base", "aa"), ("high", "bb"), ("extra", "cc")])).unwrap();

        let err = compare_hashes(&expected, &entry(&[("base", "aa"), ("high", "xx")])).unwrap_err();
        assert_eq!(err.to_string(), "high hash xx does not match bb");

        let err = compare_hashes(&expected, &entry(&[("base", "aa")])).unwrap_err();
        assert!(err.to_string().contains("<missing>"));
    }

    #[test]
    fn hash_files_accept_non_string_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HASH_FILE);
        std::fs::write(&path, r#"{"high": "0af3", "frames": 12}"#).unwrap();
        let hashes = read_hash_file(&path).unwrap();
        assert_eq!(hashes["high"], "0af3");
        assert_eq!(hashes["frames"], "12");
        assert!(read_hash_file(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn only_unpublished_assets_become_ignored() {
        let missing = FunctestError::Origin {
            url: "http://herp/asset".to_owned(),
            status: 404,
            body: String::new(),
        };
        assert!(ignore_unpublished(missing).is_ignore());

        let broken = FunctestError::Origin {
            url: "http://herp/asset".to_owned(),
            status: 500,
            body: "boom".to_owned(),
        };
        assert!(matches!(ignore_unpublished(broken), FunctestError::Origin { status: 500, .. }));
        let offline = FunctestError::OriginUnreachable {
            url: "http://herp/asset".to_owned(),
            detail: "refused".to_owned(),
        };
        assert!(ignore_unpublished(offline).is_infrastructure());
    }
}
