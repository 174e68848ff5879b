//! Suite driver: prepares the shared environment, runs every enabled test
//! through the worker pool, then aggregates and persists the results.
//!
//! The orchestrator is the only writer of regenerated hashes. Workers hand
//! them back inside their [`TestResult`]s and they are written once, after
//! the run, and only when every counted test passed.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use lcevc_functest_error::{FunctestError, Result};
use tracing::{error, info, warn};

use crate::adb::{AdbBridge, AdbCli, AdbTransport, initialise_adb_device};
use crate::assets::{AssetCache, AssetOrigin, HttpOrigin};
use crate::cancel::CancellationToken;
use crate::config::HashSource;
use crate::context::SuiteContext;
use crate::execution::{TestResult, execute_test};
use crate::external::download_assets_externally;
use crate::functions::TestEnv;
use crate::hashes::{RegressionHashStore, TestIdentity};
use crate::loader::load_tests;
use crate::ltm::initialise_ltm;
use crate::pool::{JobPanic, WorkerPool};
use crate::record::TestRecord;
use crate::results::{
    RunTally, dump_results, filter_results, save_regenerated_hashes, write_csv_report,
};

/// What a suite run produced.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// One result per loaded test, sorted by id.
    pub results: Vec<TestResult>,
    /// Counts over the results selected by the group/name filters.
    pub tally: RunTally,
    /// The run was interrupted; `results` only holds finished tests.
    pub cancelled: bool,
    pub results_path: Option<PathBuf>,
    /// Definition rows or ledger documents rewritten with regenerated hashes.
    pub hashes_saved: usize,
}

impl RunReport {
    #[must_use]
    pub fn overall_pass(&self) -> bool {
        !self.cancelled && self.tally.overall_pass()
    }
}

pub struct Orchestrator {
    ctx: SuiteContext,
    origin: Arc<dyn AssetOrigin>,
    adb_transport: Option<Arc<dyn AdbTransport>>,
    cancel: CancellationToken,
    repo_dir: PathBuf,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("platform", &self.ctx.config.platform)
            .field("origin", &self.origin.base_url())
            .field("repo_dir", &self.repo_dir)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Orchestrator fetching from the configured HTTP asset server.
    #[must_use]
    pub fn new(ctx: SuiteContext) -> Self {
        let origin = Arc::new(HttpOrigin::new(&ctx.config.herp_url));
        Self {
            ctx,
            origin,
            adb_transport: None,
            cancel: CancellationToken::new(),
            repo_dir: PathBuf::from("."),
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: Arc<dyn AssetOrigin>) -> Self {
        self.origin = origin;
        self
    }

    /// Reach the device through `transport` instead of the `adb` client.
    #[must_use]
    pub fn with_adb_transport(mut self, transport: Arc<dyn AdbTransport>) -> Self {
        self.adb_transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Repository whose version tags select the external asset bundle.
    #[must_use]
    pub fn with_repo_dir(mut self, repo_dir: impl Into<PathBuf>) -> Self {
        self.repo_dir = repo_dir.into();
        self
    }

    #[must_use]
    pub fn context(&self) -> &SuiteContext {
        &self.ctx
    }

    /// Token that stops the run when cancelled.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load the configured definitions and run them.
    pub fn run_suite(&self) -> Result<RunReport> {
        let tests = load_tests(&self.ctx)?;
        self.run(tests)
    }

    /// Run `tests`, aggregate and persist.
    ///
    /// # Errors
    ///
    /// Infrastructure failures: unreachable asset server without a usable
    /// fallback, an unusable device, a missing model decoder on
    /// regeneration, invalid settings. Test failures are reported in the
    /// [`RunReport`] instead.
    pub fn run(&self, tests: Vec<TestRecord>) -> Result<RunReport> {
        let config = &self.ctx.config;
        let enabled = tests.iter().filter(|test| test.enabled).count();
        if enabled == 0 {
            info!(loaded = tests.len(), "no enabled tests, nothing to run");
            return Ok(RunReport::default());
        }
        info!(
            enabled,
            loaded = tests.len(),
            platform = %config.platform,
            level = %config.level,
            regen = config.full_regen(),
            "starting suite"
        );

        let env = self.prepare(&tests)?;
        let threads = self.thread_count();

        let (mut results, cancelled) = self.execute(&tests, Arc::clone(&env), threads)?;
        results.sort_by_key(|result| result.id);

        let filtered = filter_results(
            &results,
            config.filter_group.as_deref(),
            config.filter_name.as_deref(),
        );
        let tally = RunTally::of(&filtered);
        info!(
            counted = tally.counted,
            passed = tally.passed,
            disabled = tally.disabled,
            skipped = tally.skipped,
            broken = tally.broken,
            "suite finished"
        );

        let mut report = RunReport {
            results,
            tally,
            cancelled,
            results_path: None,
            hashes_saved: 0,
        };
        if config.full_regen() {
            report.hashes_saved = self.save_regenerated(&report, &tests, &env)?;
        }
        report.results_path = Some(dump_results(&report.results, &self.ctx)?);
        if let Some(csv_output) = &config.csv_output {
            write_csv_report(csv_output, &report.results, &self.ctx)?;
        }
        Ok(report)
    }

    // ─── Setup ─────────────────────────────────────────────────────────

    fn prepare(&self, tests: &[TestRecord]) -> Result<Arc<TestEnv>> {
        let config = &self.ctx.config;
        let ltm = if config.full_regen() {
            Some(initialise_ltm(config)?)
        } else {
            None
        };

        std::fs::create_dir_all(&config.workdir)?;
        if !config.bin_dir.is_dir() {
            return Err(FunctestError::config(format!(
                "binary directory '{}' does not exist",
                config.bin_dir.display()
            )));
        }
        if config.enable_valgrind && (config.is_adb_platform() || !cfg!(target_os = "linux")) {
            return Err(FunctestError::config(
                "valgrind is only supported for local runs on Linux",
            ));
        }

        let assets = AssetCache::from_config(config, Arc::clone(&self.origin))
            .with_cancellation(self.cancel.clone());
        if assets.origin_accessible() {
            let fetched = assets.get_bases(tests)?;
            info!(fetched, "base YUVs ready");
        } else {
            download_assets_externally(config, &self.repo_dir)?;
        }

        let adb = if config.is_adb_platform() {
            let transport = self.adb_transport.clone().unwrap_or_else(|| {
                Arc::new(AdbCli::new(&config.adb, self.cancel.clone())) as Arc<dyn AdbTransport>
            });
            let bridge = AdbBridge::new(transport, config.adb.clone());
            initialise_adb_device(&bridge, &config.platform, &config.bin_dir)?;
            Some(Arc::new(bridge))
        } else {
            None
        };

        let hashes = match config.hash_source {
            HashSource::Csv => None,
            HashSource::Ledger => {
                let Some(data_dir) = &config.data_dir else {
                    return Err(FunctestError::config(
                        "HASH_SOURCE is ledger but LCEVC_TEST_DATA_DIR is not set",
                    ));
                };
                Some(RegressionHashStore::new(data_dir))
            }
        };

        Ok(Arc::new(TestEnv {
            ctx: self.ctx.clone(),
            assets,
            hashes,
            ltm,
            adb,
            cancel: self.cancel.clone(),
        }))
    }

    fn thread_count(&self) -> usize {
        let config = &self.ctx.config;
        let cpus = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let threads = config.threads.min(cpus).max(1);
        if config.is_adb_platform() && threads > 1 {
            warn!(threads, "device platforms run one test at a time, using 1 thread");
            return 1;
        }
        threads
    }

    // ─── Execution ─────────────────────────────────────────────────────

    /// Results of every test that finished, and whether the run was
    /// interrupted.
    fn execute(
        &self,
        tests: &[TestRecord],
        env: Arc<TestEnv>,
        threads: usize,
    ) -> Result<(Vec<TestResult>, bool)> {
        let mut results = Vec::with_capacity(tests.len());
        let mut pool = WorkerPool::new(threads, self.cancel.clone());
        info!(threads = pool.size(), "dispatching tests");
        for test in tests {
            if !test.enabled {
                results.push(TestResult::not_run(test));
                continue;
            }
            let test = test.clone();
            let env = Arc::clone(&env);
            pool.submit(test.id, move || execute_test(&test, &env));
        }

        let records: BTreeMap<usize, &TestRecord> =
            tests.iter().map(|test| (test.id, test)).collect();
        let panicked = |test_id: usize, panic: &JobPanic| {
            records
                .get(&test_id)
                .map(|record| TestResult::panicked(record, panic))
        };

        let mut fatal = None;
        while !self.cancel.is_cancelled() {
            match pool.next_completed()? {
                None => break,
                Some((_, Ok(Ok(result)))) => results.push(result),
                Some((test_id, Err(panic))) => results.extend(panicked(test_id, &panic)),
                Some((_, Ok(Err(FunctestError::Cancelled)))) => break,
                Some((test_id, Ok(Err(err)))) => {
                    error!(test_id, error = %err, "infrastructure failure, stopping the run");
                    fatal = Some(err);
                    break;
                }
            }
        }

        let cancelled = fatal.is_none() && self.cancel.is_cancelled();
        if pool.outstanding() > 0 {
            let dropped = pool.cancel_all_pending();
            let drained = pool.drain_completed();
            warn!(dropped, finished = drained.len(), "run interrupted, collecting finished tests");
            for (test_id, output) in drained {
                match output {
                    Ok(Ok(result)) => results.push(result),
                    Ok(Err(_)) => {}
                    Err(panic) => results.extend(panicked(test_id, &panic)),
                }
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }
        Ok((results, cancelled))
    }

    // ─── Regeneration ──────────────────────────────────────────────────

    fn save_regenerated(
        &self,
        report: &RunReport,
        tests: &[TestRecord],
        env: &TestEnv,
    ) -> Result<usize> {
        if !report.overall_pass() {
            warn!(
                passed = report.tally.passed,
                counted = report.tally.counted,
                "run did not fully pass, regenerated hashes are not saved"
            );
            return Ok(0);
        }
        let config = &self.ctx.config;
        match (config.hash_source, &env.hashes) {
            (HashSource::Csv, _) => {
                save_regenerated_hashes(&report.results, &config.definitions_dir)
            }
            (HashSource::Ledger, Some(store)) => {
                let records: BTreeMap<usize, &TestRecord> =
                    tests.iter().map(|test| (test.id, test)).collect();
                for result in &report.results {
                    let (Some(hashes), Some(record)) =
                        (&result.regenerated_hashes, records.get(&result.id))
                    else {
                        continue;
                    };
                    store.record(
                        &TestIdentity::of_record(record),
                        &config.hash_key_exclude,
                        hashes.clone(),
                    )?;
                }
                store.save()
            }
            (HashSource::Ledger, None) => Ok(0),
        }
    }
}
