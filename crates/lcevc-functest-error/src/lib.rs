//! Error type shared by every crate of the functional-test harness.
//!
//! Variants fall into four families:
//! - load-time errors abort the suite before any test executes,
//! - per-test errors become that test's failure result,
//! - [`FunctestError::Ignored`] is the soft "ignore this failure" signal,
//! - infrastructure errors terminate the whole run.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FunctestError>;

#[derive(Debug, thiserror::Error)]
pub enum FunctestError {
    // ─── Load-time ────────────────────────────────────────────────────
    #[error("{csv}:{row}: missing required column '{column}'")]
    MissingColumn {
        csv: String,
        row: usize,
        column: String,
    },

    #[error(
        "{csv}:{row}: column '{column}' must be one of MR, Nightly, BROKEN, SKIP or PGO, not '{value}'"
    )]
    InvalidEnabledType {
        csv: String,
        row: usize,
        column: String,
        value: String,
    },

    #[error("run level must be one of mr, nightly, manual or pgo, not '{0}'")]
    InvalidLevel(String),

    #[error("{csv}:{row}: unknown test function '{function}'")]
    UnknownTestFunction {
        csv: String,
        row: usize,
        function: String,
    },

    #[error("{csv}:{row}: unknown parameter group '{group}' in column '{column}'")]
    UnknownParamGroup {
        csv: String,
        row: usize,
        group: String,
        column: String,
    },

    #[error("{csv}:{row}: test function '{function}' requires parameter '{param}'")]
    MissingTestParam {
        csv: String,
        row: usize,
        function: String,
        param: String,
    },

    #[error("test {first} ({first_origin}) has the same name as test {second} ({second_origin})")]
    DuplicateName {
        first: usize,
        first_origin: String,
        second: usize,
        second_origin: String,
    },

    #[error(
        "test {first} '{first_name}' ({first_origin}) has the same parameters as test {second} '{second_name}' ({second_origin})"
    )]
    DuplicateParams {
        first: usize,
        first_name: String,
        first_origin: String,
        second: usize,
        second_name: String,
        second_origin: String,
    },

    #[error("test definitions directory not found: {0}")]
    DefinitionsDir(PathBuf),

    // ─── Per-test ─────────────────────────────────────────────────────
    #[error("{executable} returned {code:?}\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}")]
    ProcessFailed {
        executable: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("command '{command}' did not exit within {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("{surface} hash {actual} does not match {expected}")]
    HashMismatch {
        surface: String,
        expected: String,
        actual: String,
    },

    #[error("no hashes for {0}")]
    MissingHashes(String),

    #[error("origin returned {status} for {url}: {body}")]
    Origin {
        url: String,
        status: u16,
        body: String,
    },

    #[error("assertion failed: {0}")]
    Assertion(String),

    /// Raised by a test body to mark the result as ignored rather than failed.
    #[error("ignored: {0}")]
    Ignored(String),

    #[error("cancelled")]
    Cancelled,

    // ─── Infrastructure ───────────────────────────────────────────────
    #[error("asset origin unreachable at {url}: {detail}")]
    OriginUnreachable { url: String, detail: String },

    #[error("adb device error: {0}")]
    AdbDevice(String),

    #[error("adb command '{command}' returned {code:?}\nSTDERR:\n{stderr}\nSTDOUT:\n{stdout}")]
    AdbCommand {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("LTM unavailable: {0}")]
    Ltm(String),

    #[error("external asset download failed: {0}")]
    External(String),

    #[error("configuration error: {0}")]
    Config(String),

    // ─── Plumbing ─────────────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl FunctestError {
    /// Errors that must abort the entire run instead of failing one test.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::OriginUnreachable { .. }
                | Self::AdbDevice(_)
                | Self::Ltm(_)
                | Self::External(_)
                | Self::Config(_)
        )
    }

    /// Errors raised while loading definitions, before anything runs.
    #[must_use]
    pub fn is_load_time(&self) -> bool {
        matches!(
            self,
            Self::MissingColumn { .. }
                | Self::InvalidEnabledType { .. }
                | Self::InvalidLevel(_)
                | Self::UnknownTestFunction { .. }
                | Self::UnknownParamGroup { .. }
                | Self::MissingTestParam { .. }
                | Self::DuplicateName { .. }
                | Self::DuplicateParams { .. }
                | Self::DefinitionsDir(_)
        )
    }

    #[must_use]
    pub fn is_ignore(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
