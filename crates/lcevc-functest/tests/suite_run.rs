#![cfg(unix)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lcevc_functest::{
    AdbTransport, AssetOrigin, CancellationToken, ConfigBuilder, Orchestrator, ProcessOutput,
    ResultCounts, SuiteContext, TestStatus,
};
use lcevc_functest_error::{FunctestError, Result};
use tempfile::TempDir;

const HEADER: &str =
    "Test Function,Group,Enabled-Linux,Name,meta:executable,meta:filepath_hash,meta:asset_path,meta:hash_hash\n";

/// Serves every asset as a few bytes.
#[derive(Default)]
struct StaticOrigin {
    calls: AtomicUsize,
    unreachable: bool,
    /// Asset path the server answers 404 for.
    unpublished: Option<&'static str>,
}

impl AssetOrigin for StaticOrigin {
    fn base_url(&self) -> &str {
        "http://herp.test"
    }

    fn fetch(&self, endpoint: &str, query: &[(&str, &str)], sink: &mut dyn Write) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(FunctestError::OriginUnreachable {
                url: format!("http://herp.test{endpoint}"),
                detail: "connection refused".to_owned(),
            });
        }
        if let Some(missing) = self.unpublished {
            if query.iter().any(|(_, value)| *value == missing) {
                return Err(FunctestError::Origin {
                    url: format!("http://herp.test{endpoint}"),
                    status: 404,
                    body: "not found".to_owned(),
                });
            }
        }
        sink.write_all(b"stream")?;
        Ok(6)
    }

    fn is_accessible(&self) -> bool {
        true
    }
}

/// Workspace with a bin directory of shell-script decoders.
struct Suite {
    root: TempDir,
}

impl Suite {
    fn new(definitions: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let suite = Self { root };
        std::fs::create_dir_all(suite.path("definitions")).unwrap();
        std::fs::write(suite.path("definitions/core.csv"), definitions).unwrap();
        std::fs::create_dir_all(suite.path("bin")).unwrap();
        suite.script("decoder", "printf '{\"high\": \"cafe\"}' > hashes.json");
        suite.script("crasher", "echo 'segfault' >&2\nexit 3");
        suite
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    fn script(&self, name: &str, body: &str) {
        let path = self.path("bin").join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn builder(&self) -> ConfigBuilder {
        let path = |relative: &str| self.path(relative).display().to_string();
        ConfigBuilder::new()
            .set("PLATFORM", "Linux")
            .set("TEST_DEFINITIONS_DIR", path("definitions"))
            .set("CACHE_PATH", path("cache"))
            .set("WORKDIR", path("work"))
            .set("BIN_DIR", path("bin"))
            .set("RESULTS_PATH", path("results.json"))
            .set("THREADS", "2")
    }

    fn orchestrator(&self, builder: ConfigBuilder, origin: Arc<StaticOrigin>) -> Orchestrator {
        let ctx = SuiteContext::with_git_hash(builder.build().unwrap(), "abcdef12");
        Orchestrator::new(ctx).with_origin(origin)
    }

    fn definitions(&self) -> String {
        std::fs::read_to_string(self.path("definitions/core.csv")).unwrap()
    }
}

fn row(name: &str, executable: &str, hash: &str) -> String {
    format!("asset_hash,core,MR,{name},{executable},--output-hash,streams/{name}.bin,{hash}\n")
}

fn results_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn passing_and_failing_tests_are_reported_and_counted() {
    let definitions = format!(
        "{HEADER}{}{}{}",
        row("matching", "decoder", "cafe"),
        row("mismatching", "decoder", "beef"),
        row("crashing", "crasher", "cafe"),
    );
    let suite = Suite::new(&definitions);
    let origin = Arc::new(StaticOrigin::default());
    let report = suite
        .orchestrator(suite.builder(), origin.clone())
        .run_suite()
        .unwrap();

    let statuses: Vec<_> = report.results.iter().map(|r| (r.name.as_str(), r.status())).collect();
    assert_eq!(
        statuses,
        [
            ("matching", TestStatus::Passed),
            ("mismatching", TestStatus::Failed),
            ("crashing", TestStatus::Failed),
        ]
    );
    assert_eq!(report.tally.counted, 3);
    assert_eq!(report.tally.passed, 1);
    assert!(!report.overall_pass());
    assert_eq!(origin.calls.load(Ordering::SeqCst), 3);

    let mismatch = report.results[1].results.as_ref().unwrap();
    assert!(mismatch.exception.as_deref().unwrap().contains("beef"));
    let crash = report.results[2].results.as_ref().unwrap();
    assert!(crash.exception.as_deref().unwrap().contains("segfault"));

    // ON_PASS keeps only the failing test directories.
    assert!(!suite.path("work/test_0").exists());
    assert!(suite.path("work/test_1").exists());

    let document = results_json(report.results_path.as_deref().unwrap());
    assert_eq!(document["summary"]["git_hash"], "abcdef12");
    assert_eq!(document["tests"].as_array().unwrap().len(), 3);
    assert_eq!(document["tests"][0]["command_lines"]["decoder"][1], "--input");
}

#[test]
fn regenerated_hashes_are_written_back_only_after_a_clean_run() {
    let failing = format!(
        "{HEADER}{}{}",
        row("good", "decoder", "0000"),
        row("bad", "crasher", "0000"),
    );
    let suite = Suite::new(&failing);
    std::fs::create_dir_all(suite.path("ltm")).unwrap();
    let regen = || {
        suite
            .builder()
            .set("REGEN", "true")
            .set("LTM_PATH", suite.path("ltm").display().to_string())
    };

    let report = suite
        .orchestrator(regen(), Arc::new(StaticOrigin::default()))
        .run_suite()
        .unwrap();
    assert!(!report.overall_pass());
    assert_eq!(report.hashes_saved, 0);
    assert_eq!(suite.definitions(), failing);

    let passing = format!("{HEADER}{}", row("good", "decoder", "0000"));
    std::fs::write(suite.path("definitions/core.csv"), &passing).unwrap();
    let report = suite
        .orchestrator(regen(), Arc::new(StaticOrigin::default()))
        .run_suite()
        .unwrap();
    assert!(report.overall_pass());
    assert_eq!(report.hashes_saved, 1);
    let rewritten = suite.definitions();
    assert!(rewritten.contains(",cafe"), "{rewritten}");
    assert!(!rewritten.contains("0000"), "{rewritten}");
}

#[test]
fn nothing_enabled_is_a_successful_empty_run() {
    let definitions = format!("{HEADER}{}", row("parked", "decoder", "cafe")).replace(",MR,", ",SKIP,");
    let suite = Suite::new(&definitions);
    let origin = Arc::new(StaticOrigin::default());
    let report = suite
        .orchestrator(suite.builder(), origin.clone())
        .run_suite()
        .unwrap();
    assert!(report.overall_pass());
    assert!(report.results.is_empty());
    assert!(report.results_path.is_none());
    assert_eq!(origin.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn unpublished_asset_is_ignored_without_failing_the_run() {
    let definitions = format!(
        "{HEADER}{}{}",
        row("matching", "decoder", "cafe"),
        row("retired", "decoder", "cafe"),
    );
    let suite = Suite::new(&definitions);
    let origin = Arc::new(StaticOrigin {
        unpublished: Some("streams/retired.bin"),
        ..StaticOrigin::default()
    });
    let report = suite
        .orchestrator(suite.builder(), origin)
        .run_suite()
        .unwrap();

    let statuses: Vec<_> = report.results.iter().map(|r| (r.name.as_str(), r.status())).collect();
    assert_eq!(
        statuses,
        [("matching", TestStatus::Passed), ("retired", TestStatus::Ignored)]
    );
    assert_eq!(report.tally.counted, 2);
    assert_eq!(report.tally.passed, 1);
    assert_eq!(report.tally.disabled, 1);
    assert_eq!(report.tally.skipped, 1);
    assert!(report.overall_pass());
    assert_eq!(ResultCounts::of(&report.results, None).skipped, 1);

    let document = results_json(report.results_path.as_deref().unwrap());
    assert_eq!(document["tests"][1]["results"]["ignored"], true);
}

#[test]
fn unreachable_origin_mid_run_aborts_the_suite() {
    let definitions = format!("{HEADER}{}", row("matching", "decoder", "cafe"));
    let suite = Suite::new(&definitions);
    let origin = Arc::new(StaticOrigin {
        unreachable: true,
        ..StaticOrigin::default()
    });
    let err = suite
        .orchestrator(suite.builder(), origin)
        .run_suite()
        .unwrap_err();
    assert!(err.is_infrastructure(), "{err}");
    assert!(!suite.path("results.json").exists());
}

#[test]
fn interrupted_run_keeps_what_finished() {
    let definitions = format!("{HEADER}{}", row("matching", "decoder", "cafe"));
    let suite = Suite::new(&definitions);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = suite
        .orchestrator(suite.builder(), Arc::new(StaticOrigin::default()))
        .with_cancellation(cancel)
        .run_suite()
        .unwrap();
    assert!(report.cancelled);
    assert!(!report.overall_pass());
    assert!(report.results.is_empty());
    assert!(report.results_path.is_some());
}

/// Device bridge whose device list never contains the configured serial.
struct NoDevices;

impl AdbTransport for NoDevices {
    fn adb(&self, _args: &[String], _targeted: bool, _timeout: Duration) -> Result<ProcessOutput> {
        Ok(ProcessOutput {
            code: Some(0),
            stdout: "List of devices attached\n\n".to_owned(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        })
    }
}

#[test]
fn missing_device_fails_before_any_test_runs() {
    let definitions = format!("{HEADER}{}", row("matching", "decoder", "cafe"))
        .replace("Enabled-Linux", "Enabled-VIM4");
    let suite = Suite::new(&definitions);
    let origin = Arc::new(StaticOrigin::default());
    let builder = suite
        .builder()
        .set("PLATFORM", "VIM4")
        .set("ADB_SERIAL", "0123456789");
    let err = suite
        .orchestrator(builder, origin.clone())
        .with_adb_transport(Arc::new(NoDevices))
        .run_suite()
        .unwrap_err();
    assert!(matches!(err, FunctestError::AdbDevice(_)), "{err}");
    assert_eq!(origin.calls.load(Ordering::SeqCst), 0);
}
