//! LCEVC decoder functional-test harness.
//!
//! Test definitions are loaded from CSV files ([`loader`]), run against the
//! decoder executables on this host or on a device behind the Android debug
//! bridge ([`runner`], [`adb`]) and checked against regression hashes kept in
//! the definitions or in a JSON ledger ([`hashes`]). The [`orchestrator`]
//! ties a run together.

pub mod adb;
pub mod assets;
pub mod cancel;
pub mod checksum;
pub mod config;
pub mod context;
pub mod execution;
pub mod external;
pub mod functions;
pub mod hashes;
pub mod histogram;
pub mod loader;
pub mod log;
pub mod ltm;
pub mod orchestrator;
pub mod pool;
pub mod record;
pub mod results;
pub mod runner;

pub use adb::{AdbBridge, AdbCli, AdbTransport, RemoteRunner, initialise_adb_device};
pub use assets::{AssetCache, AssetOrigin, HttpOrigin, LocalEncoder};
pub use cancel::CancellationToken;
pub use config::{ConfigBuilder, DeletePolicy, HashSource, RunLevel, Suite, SuiteConfig};
pub use context::SuiteContext;
pub use execution::{Outcome, TestResult, TestStatus, execute_test};
pub use functions::{TestEnv, TestRun};
pub use hashes::{HashEntry, RegressionHashStore, TestIdentity};
pub use loader::{LoadOptions, load_dir, load_tests};
pub use orchestrator::{Orchestrator, RunReport};
pub use pool::{JobOutput, JobPanic, WorkerPool};
pub use record::{EnabledType, ParamGroup, ParamMap, TestFunctionKind, TestParams, TestRecord};
pub use results::{ResultCounts, RunTally};
pub use runner::{LocalRunner, ProcessOutput, ProcessRunner, RunnerConfig};
