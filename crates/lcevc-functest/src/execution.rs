//! Per-test wrapper: runs one record's body and turns the outcome into a
//! [`TestResult`].

use std::collections::BTreeMap;
use std::time::Instant;

use lcevc_functest_error::{FunctestError, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::DeletePolicy;
use crate::functions::{TestEnv, TestRun, run_test_function};
use crate::pool::JobPanic;
use crate::record::{EnabledType, TestParams, TestRecord};

/// Terminal state of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Ignored,
    /// Disabled at load time; the body never ran.
    NotRun,
}

/// Outcome flags as they appear in the results document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignored: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// Everything reported for one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: usize,
    pub enabled: bool,
    pub enabled_type: EnabledType,
    pub group: String,
    pub name: String,
    /// Seconds, three decimals; only for tests that ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<f64>,
    pub params: TestParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_lines: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regenerated_hashes: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_csv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_row: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_group: Option<String>,
}

impl TestResult {
    /// Result of a test whose body has not run.
    #[must_use]
    pub fn not_run(record: &TestRecord) -> Self {
        Self {
            id: record.id,
            enabled: record.enabled,
            enabled_type: record.enabled_type,
            group: record.group.clone(),
            name: record.name.clone(),
            runtime: None,
            params: record.params.clone(),
            results: None,
            command_lines: None,
            broken_reason: (record.enabled_type == EnabledType::Broken)
                .then(|| record.notes.clone().unwrap_or_default()),
            regenerated_hashes: None,
            definition_csv: None,
            csv_row: None,
            performance_group: record.performance_group.clone(),
        }
    }

    /// Result of a test whose body unwound; it counts as a failure.
    #[must_use]
    pub fn panicked(record: &TestRecord, panic: &JobPanic) -> Self {
        let mut result = Self::not_run(record);
        result.results = Some(Outcome {
            pass: Some(false),
            ignored: None,
            exception: Some(panic.to_string()),
        });
        result
    }

    #[must_use]
    pub fn status(&self) -> TestStatus {
        match &self.results {
            None => TestStatus::NotRun,
            Some(outcome) if outcome.ignored == Some(true) => TestStatus::Ignored,
            Some(outcome) if outcome.pass == Some(true) => TestStatus::Passed,
            Some(_) => TestStatus::Failed,
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.enabled && self.status() == TestStatus::Passed
    }

    #[must_use]
    pub fn ignored(&self) -> bool {
        self.status() == TestStatus::Ignored
    }
}

/// Run `record` and report it.
///
/// Test failures, including ignored ones, become part of the result. Only
/// infrastructure errors and cancellation are returned as `Err`; the test
/// directory is still cleaned up per the delete policy in that case.
pub fn execute_test(record: &TestRecord, env: &TestEnv) -> Result<TestResult> {
    let mut result = TestResult::not_run(record);
    if !record.enabled {
        return Ok(result);
    }

    let started = Instant::now();
    let policy = env.ctx.config.delete_temp_dir;
    let test_dir = env.ctx.test_dir(record.id);
    info!(test_id = record.id, name = %record.name, "running test");

    let mut run = TestRun::new(&test_dir);
    let body = std::fs::create_dir_all(&test_dir)
        .map_err(FunctestError::from)
        .and_then(|()| run_test_function(record, env, &mut run));

    let mut outcome = Outcome::default();
    let passed = match body {
        Ok(()) => {
            outcome.pass = Some(true);
            true
        }
        Err(err) if err.is_ignore() => {
            warn!(test_id = record.id, name = %record.name, error = %err, "ignoring failure");
            outcome.ignored = Some(true);
            false
        }
        Err(err) if err.is_infrastructure() || matches!(err, FunctestError::Cancelled) => {
            remove_test_dir(&test_dir, policy, false);
            return Err(err);
        }
        Err(err) => {
            error!(test_id = record.id, name = %record.name, error = %err, "test failed");
            outcome.pass = Some(false);
            outcome.exception = Some(err.to_string());
            false
        }
    };
    remove_test_dir(&test_dir, policy, passed);

    result.runtime = Some((started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0);
    result.results = Some(outcome);
    result.command_lines = Some(run.command_lines);
    if !run.regenerated_hashes.is_empty() {
        result.regenerated_hashes = Some(run.regenerated_hashes);
        result.definition_csv = Some(record.definition_csv.clone());
        result.csv_row = Some(record.csv_row);
    }
    Ok(result)
}

fn remove_test_dir(test_dir: &std::path::Path, policy: DeletePolicy, passed: bool) {
    let remove = match policy {
        DeletePolicy::Always => true,
        DeletePolicy::OnPass => passed,
        DeletePolicy::Never => false,
    };
    if remove && test_dir.exists() {
        if let Err(err) = std::fs::remove_dir_all(test_dir) {
            warn!(path = %test_dir.display(), error = %err, "could not remove test directory");
        }
    }
}
