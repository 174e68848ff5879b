//! Layered suite configuration.
//!
//! Options are plain `NAME = value` pairs resolved from, lowest to highest
//! precedence: built-in defaults, the `[options]` table of a TOML config file,
//! environment variables named after the upper-cased option, and finally
//! explicit overrides (the CLI flags). [`SuiteConfig::from_options`] turns the
//! merged map into typed settings.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use lcevc_functest_error::{FunctestError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "TEST_CONFIG";

/// Platforms whose tests execute on a device behind the Android debug bridge.
pub const ADB_PLATFORMS: [&str; 6] = [
    "Qualcomm_devkit",
    "VIM4",
    "VIM4_1",
    "VIM3L_0",
    "PIXEL5_0",
    "PIXEL5_1",
];

/// Every recognised option. Each one can be overridden by the environment
/// variable of the same name.
pub const OPTION_NAMES: [&str; 45] = [
    "PLATFORM",
    "LEVEL",
    "SUITE",
    "TEST_DEFINITIONS_DIR",
    "CACHE_PATH",
    "WORKDIR",
    "BIN_DIR",
    "RESOURCE_DIR",
    "LCEVC_TEST_DATA_DIR",
    "HERP_URL",
    "EXTERNAL_ASSET_URL",
    "ENCODER_VERSION",
    "THREADS",
    "DELETE_TEMP_DIR",
    "FILTER_GROUP",
    "FILTER_NAME",
    "REGEN",
    "REGEN_ENCODES",
    "ERP_PATH",
    "ENABLE_VALGRIND",
    "ADB_PATH",
    "ADB_SERVER_HOST",
    "ADB_SERIAL",
    "DEVICE_BASE_DIR",
    "DEVICE_BUILD_DIR",
    "DEVICE_ENCODE_CACHE_SIZE",
    "RESULTS_PATH",
    "LOG_LEVEL",
    "TIMEOUT",
    "HASH_SOURCE",
    "HASH_KEY_EXCLUDE",
    "LTM_PATH",
    "LTM_URL",
    "NEXUS_USER",
    "NEXUS_PASSWORD",
    "ARCH",
    "CSV_OUTPUT",
    "GIT_HASH",
    "BENCHMARK_RUNS",
    "WARMUP_DURATION",
    "BENCHMARK_DURATION",
    "CONAN_PROFILE",
    "CONAN_OPTIONS",
    "CONAN_SETTINGS",
    "CONAN_UPDATE",
];

// ─── Enumerated options ────────────────────────────────────────────────

/// Run level the suite is executed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLevel {
    Mr,
    Nightly,
    Manual,
    Pgo,
}

impl FromStr for RunLevel {
    type Err = FunctestError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mr" => Ok(Self::Mr),
            "nightly" => Ok(Self::Nightly),
            "manual" => Ok(Self::Manual),
            "pgo" => Ok(Self::Pgo),
            _ => Err(FunctestError::InvalidLevel(value.to_owned())),
        }
    }
}

impl fmt::Display for RunLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mr => f.write_str("mr"),
            Self::Nightly => f.write_str("nightly"),
            Self::Manual => f.write_str("manual"),
            Self::Pgo => f.write_str("pgo"),
        }
    }
}

/// Named suites accepted by `--suite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suite {
    Full,
    MergeRequest,
}

impl Suite {
    #[must_use]
    pub fn run_level(self) -> RunLevel {
        match self {
            Self::Full => RunLevel::Nightly,
            Self::MergeRequest => RunLevel::Mr,
        }
    }
}

impl FromStr for Suite {
    type Err = FunctestError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "full" => Ok(Self::Full),
            "merge_request" => Ok(Self::MergeRequest),
            other => Err(FunctestError::config(format!(
                "suite must be 'full' or 'merge_request', not '{other}'"
            ))),
        }
    }
}

/// When a test's working directory is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletePolicy {
    Always,
    OnPass,
    Never,
}

impl FromStr for DeletePolicy {
    type Err = FunctestError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "ALWAYS" => Ok(Self::Always),
            "ON_PASS" => Ok(Self::OnPass),
            "NEVER" => Ok(Self::Never),
            other => Err(FunctestError::config(format!(
                "DELETE_TEMP_DIR must be one of 'ALWAYS', 'ON_PASS' or 'NEVER', not '{other}'"
            ))),
        }
    }
}

/// Where expected regression hashes are read from and regenerated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashSource {
    /// `meta:hash_*` columns of the definition CSVs.
    Csv,
    /// Per-module JSON documents under the data directory.
    Ledger,
}

impl FromStr for HashSource {
    type Err = FunctestError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "ledger" => Ok(Self::Ledger),
            other => Err(FunctestError::config(format!(
                "HASH_SOURCE must be 'csv' or 'ledger', not '{other}'"
            ))),
        }
    }
}

// ─── Grouped settings ──────────────────────────────────────────────────

/// Remote-device settings, only consulted on ADB platforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdbSettings {
    pub adb_path: PathBuf,
    pub server_host: String,
    pub serial: Option<String>,
    pub device_base_dir: String,
    pub device_build_dir: String,
    /// Maximum number of encodes kept in the on-device cache.
    pub encode_cache_size: usize,
}

impl AdbSettings {
    #[must_use]
    pub fn work_dir(&self) -> String {
        format!("{}/test_workdir", self.device_base_dir.trim_end_matches('/'))
    }

    #[must_use]
    pub fn assets_dir(&self) -> String {
        format!(
            "{}/test_asset_cache",
            self.device_base_dir.trim_end_matches('/')
        )
    }

    #[must_use]
    pub fn build_dir(&self) -> String {
        format!("{}/test_build", self.device_build_dir.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkSettings {
    pub runs: u32,
    pub warmup_secs: u64,
    pub duration_secs: u64,
}

/// Package-manager options forwarded into the results summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConanSettings {
    pub profile: String,
    pub options: Vec<String>,
    pub settings: Vec<String>,
    pub update: bool,
}

// ─── Layered option map ────────────────────────────────────────────────

/// Accumulates option layers before typing them.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    options: BTreeMap<String, String>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the `[options]` table of a TOML file.
    pub fn with_file(mut self, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            FunctestError::config(format!(
                "couldn't read config at '{}': {err}",
                path.display()
            ))
        })?;
        let document: toml::Table = toml::from_str(&text)?;
        let Some(options) = document.get("options").and_then(toml::Value::as_table) else {
            return Err(FunctestError::config(format!(
                "config '{}' has no [options] table",
                path.display()
            )));
        };
        for (key, value) in options {
            self.options
                .insert(key.to_ascii_uppercase(), toml_value_to_string(value));
        }
        Ok(self)
    }

    /// Overlay environment variables for every known option.
    #[must_use]
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for name in OPTION_NAMES {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                if self.options.get(name) != Some(&value) {
                    info!(option = name, "overriding config value from environment");
                }
                self.options.insert(name.to_owned(), value);
            }
        }
        self
    }

    #[must_use]
    pub fn set(mut self, name: &str, value: impl Into<String>) -> Self {
        self.options.insert(name.to_ascii_uppercase(), value.into());
        self
    }

    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn build(&self) -> Result<SuiteConfig> {
        SuiteConfig::from_options(&self.options)
    }
}

fn toml_value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(text) => text.clone(),
        toml::Value::Array(items) => items
            .iter()
            .map(toml_value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

// ─── Typed configuration ───────────────────────────────────────────────

/// Fully resolved settings for one suite run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub platform: String,
    pub level: RunLevel,
    pub suite: Option<Suite>,
    pub definitions_dir: PathBuf,
    pub cache_path: PathBuf,
    pub workdir: PathBuf,
    pub bin_dir: PathBuf,
    pub resource_dir: Option<PathBuf>,
    /// Root of the per-module regression hash documents.
    pub data_dir: Option<PathBuf>,
    pub herp_url: String,
    pub external_asset_url: Option<String>,
    pub encoder_version: Option<String>,
    pub threads: usize,
    pub delete_temp_dir: DeletePolicy,
    pub filter_group: Option<String>,
    pub filter_name: Option<String>,
    pub regen: bool,
    pub regen_encodes: bool,
    pub erp_path: Option<PathBuf>,
    pub enable_valgrind: bool,
    pub adb: AdbSettings,
    pub results_path: PathBuf,
    pub log_level: String,
    pub timeout_secs: u64,
    pub hash_source: HashSource,
    pub hash_key_exclude: Vec<String>,
    pub ltm_path: Option<PathBuf>,
    pub ltm_url: Option<String>,
    pub nexus_user: Option<String>,
    pub nexus_password: Option<String>,
    pub arch: String,
    pub csv_output: Option<PathBuf>,
    pub git_hash: Option<String>,
    pub benchmark: BenchmarkSettings,
    pub conan: ConanSettings,
}

impl SuiteConfig {
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self> {
        let get = |name: &str| options.get(name).map(String::as_str).filter(|v| !v.is_empty());
        let path = |name: &str| get(name).map(PathBuf::from);
        let flag = |name: &str| get(name).map_or(Ok(false), |v| parse_bool(name, v));

        let suite = get("SUITE").map(Suite::from_str).transpose()?;
        let level = match (get("LEVEL"), suite) {
            (Some(level), _) => level.parse()?,
            (None, Some(suite)) => suite.run_level(),
            (None, None) => RunLevel::Mr,
        };
        let device_base_dir = get("DEVICE_BASE_DIR")
            .unwrap_or("/data/local/tmp")
            .to_owned();
        let device_build_dir = get("DEVICE_BUILD_DIR")
            .map_or_else(|| device_base_dir.clone(), str::to_owned);

        Ok(Self {
            platform: get("PLATFORM").map_or_else(host_platform, str::to_owned),
            level,
            suite,
            definitions_dir: path("TEST_DEFINITIONS_DIR")
                .unwrap_or_else(|| PathBuf::from("test_definitions")),
            cache_path: path("CACHE_PATH").unwrap_or_else(|| PathBuf::from("test_asset_cache")),
            workdir: path("WORKDIR")
                .unwrap_or_else(|| std::env::temp_dir().join("lcevc_functest")),
            bin_dir: path("BIN_DIR").unwrap_or_else(|| PathBuf::from("bin")),
            resource_dir: path("RESOURCE_DIR"),
            data_dir: path("LCEVC_TEST_DATA_DIR"),
            herp_url: get("HERP_URL")
                .unwrap_or("http://herp")
                .trim_end_matches('/')
                .to_owned(),
            external_asset_url: get("EXTERNAL_ASSET_URL").map(str::to_owned),
            encoder_version: get("ENCODER_VERSION").map(str::to_owned),
            threads: parse_number(get("THREADS"), "THREADS", 1)?.max(1),
            delete_temp_dir: get("DELETE_TEMP_DIR").unwrap_or("ON_PASS").parse()?,
            filter_group: get("FILTER_GROUP").map(str::to_owned),
            filter_name: get("FILTER_NAME").map(str::to_owned),
            regen: flag("REGEN")?,
            regen_encodes: flag("REGEN_ENCODES")?,
            erp_path: path("ERP_PATH"),
            enable_valgrind: flag("ENABLE_VALGRIND")?,
            adb: AdbSettings {
                adb_path: path("ADB_PATH").unwrap_or_else(|| PathBuf::from("adb")),
                server_host: get("ADB_SERVER_HOST").unwrap_or("localhost").to_owned(),
                serial: get("ADB_SERIAL").map(str::to_owned),
                device_base_dir,
                device_build_dir,
                encode_cache_size: parse_number(
                    get("DEVICE_ENCODE_CACHE_SIZE"),
                    "DEVICE_ENCODE_CACHE_SIZE",
                    1000,
                )?,
            },
            results_path: path("RESULTS_PATH")
                .unwrap_or_else(|| PathBuf::from("dec_test_results.json")),
            log_level: get("LOG_LEVEL").unwrap_or("INFO").to_ascii_uppercase(),
            timeout_secs: parse_number(get("TIMEOUT"), "TIMEOUT", 1800)?,
            hash_source: get("HASH_SOURCE").unwrap_or("csv").parse()?,
            hash_key_exclude: get("HASH_KEY_EXCLUDE")
                .unwrap_or("base,disable_simd")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
            ltm_path: path("LTM_PATH"),
            ltm_url: get("LTM_URL").map(str::to_owned),
            nexus_user: get("NEXUS_USER").map(str::to_owned),
            nexus_password: get("NEXUS_PASSWORD").map(str::to_owned),
            arch: get("ARCH").unwrap_or(std::env::consts::ARCH).to_owned(),
            csv_output: path("CSV_OUTPUT"),
            git_hash: get("GIT_HASH").map(|hash| hash.chars().take(8).collect()),
            benchmark: BenchmarkSettings {
                runs: parse_number(get("BENCHMARK_RUNS"), "BENCHMARK_RUNS", 3)?,
                warmup_secs: parse_number(get("WARMUP_DURATION"), "WARMUP_DURATION", 2)?,
                duration_secs: parse_number(get("BENCHMARK_DURATION"), "BENCHMARK_DURATION", 5)?,
            },
            conan: ConanSettings {
                profile: get("CONAN_PROFILE").unwrap_or("default").to_owned(),
                options: split_list(get("CONAN_OPTIONS")),
                settings: split_list(get("CONAN_SETTINGS")),
                update: flag("CONAN_UPDATE")?,
            },
        })
    }

    #[must_use]
    pub fn is_adb_platform(&self) -> bool {
        ADB_PLATFORMS.contains(&self.platform.as_str())
    }

    /// Expected hashes are recomputed from scratch rather than checked.
    #[must_use]
    pub fn full_regen(&self) -> bool {
        self.regen
    }

    #[must_use]
    pub fn bases_dir(&self) -> PathBuf {
        self.cache_path.join("bases")
    }

    #[must_use]
    pub fn assets_dir(&self) -> PathBuf {
        self.cache_path.join("assets")
    }

    #[must_use]
    pub fn encodes_dir(&self) -> PathBuf {
        self.cache_path.join("encodes")
    }

    #[must_use]
    pub fn ltm_dir(&self) -> PathBuf {
        self.ltm_path
            .clone()
            .unwrap_or_else(|| self.cache_path.join("ltm"))
    }
}

/// Name of the host OS in the spelling used by the `Enabled-*` columns.
#[must_use]
pub fn host_platform() -> String {
    match std::env::consts::OS {
        "linux" => "Linux".to_owned(),
        "macos" => "Darwin".to_owned(),
        "windows" => "Windows".to_owned(),
        other => other.to_owned(),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(FunctestError::config(format!(
            "{name} must be a boolean, not '{value}'"
        ))),
    }
}

fn parse_number<T: FromStr>(value: Option<&str>, name: &str, default: T) -> Result<T> {
    value.map_or(Ok(default), |v| {
        v.trim()
            .parse()
            .map_err(|_| FunctestError::config(format!("{name} must be a number, not '{v}'")))
    })
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_without_any_layer() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.level, RunLevel::Mr);
        assert_eq!(config.threads, 1);
        assert_eq!(config.delete_temp_dir, DeletePolicy::OnPass);
        assert_eq!(config.hash_source, HashSource::Csv);
        assert_eq!(config.hash_key_exclude, vec!["base", "disable_simd"]);
        assert_eq!(config.adb.encode_cache_size, 1000);
        assert_eq!(config.herp_url, "http://herp");
    }

    #[test]
    fn env_beats_file_and_overrides_beat_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[options]\nlevel = \"nightly\"\nthreads = 4\nfilter_group = \"from_file\"\n",
        )
        .unwrap();

        let config = ConfigBuilder::new()
            .with_file(&path)
            .unwrap()
            .with_env(env_from(&[("FILTER_GROUP", "from_env"), ("THREADS", "8")]))
            .set("THREADS", "2")
            .build()
            .unwrap();

        assert_eq!(config.level, RunLevel::Nightly);
        assert_eq!(config.filter_group.as_deref(), Some("from_env"));
        assert_eq!(config.threads, 2);
    }

    #[test]
    fn suite_selects_level_unless_level_is_explicit() {
        let config = ConfigBuilder::new()
            .set("SUITE", "full")
            .build()
            .unwrap();
        assert_eq!(config.level, RunLevel::Nightly);

        let config = ConfigBuilder::new()
            .set("SUITE", "full")
            .set("LEVEL", "PGO")
            .build()
            .unwrap();
        assert_eq!(config.level, RunLevel::Pgo);
    }

    #[test]
    fn invalid_enums_are_config_errors() {
        let err = ConfigBuilder::new()
            .set("DELETE_TEMP_DIR", "SOMETIMES")
            .build()
            .unwrap_err();
        assert!(err.is_infrastructure());

        let err = ConfigBuilder::new()
            .set("LEVEL", "weekly")
            .build()
            .unwrap_err();
        assert!(matches!(err, FunctestError::InvalidLevel(_)));
    }

    #[test]
    fn adb_layout_derives_from_base_dirs() {
        let config = ConfigBuilder::new()
            .set("PLATFORM", "VIM4")
            .set("DEVICE_BASE_DIR", "/sdcard/lcevc/")
            .build()
            .unwrap();
        assert!(config.is_adb_platform());
        assert_eq!(config.adb.work_dir(), "/sdcard/lcevc/test_workdir");
        assert_eq!(config.adb.assets_dir(), "/sdcard/lcevc/test_asset_cache");
        assert_eq!(config.adb.build_dir(), "/sdcard/lcevc/test_build");
    }

    #[test]
    fn git_hash_is_truncated() {
        let config = ConfigBuilder::new()
            .set("GIT_HASH", "0123456789abcdef")
            .build()
            .unwrap();
        assert_eq!(config.git_hash.as_deref(), Some("01234567"));
    }
}
