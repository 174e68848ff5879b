//! Test records produced by the definition loader.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RunLevel;

/// Parameters of one group, keyed by parameter name.
pub type ParamMap = BTreeMap<String, String>;

/// Value of an `Enabled-{platform}` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnabledType {
    Mr,
    Nightly,
    Broken,
    Skip,
    Pgo,
}

impl EnabledType {
    /// Whether a test of this type runs at the given level.
    #[must_use]
    pub fn runs_at(self, level: RunLevel) -> bool {
        match level {
            RunLevel::Nightly => matches!(self, Self::Nightly | Self::Mr),
            RunLevel::Mr | RunLevel::Manual => self == Self::Mr,
            RunLevel::Pgo => self == Self::Pgo,
        }
    }
}

impl FromStr for EnabledType {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, ()> {
        match value {
            "MR" => Ok(Self::Mr),
            "Nightly" => Ok(Self::Nightly),
            "BROKEN" => Ok(Self::Broken),
            "SKIP" => Ok(Self::Skip),
            "PGO" => Ok(Self::Pgo),
            _ => Err(()),
        }
    }
}

impl fmt::Display for EnabledType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mr => f.write_str("mr"),
            Self::Nightly => f.write_str("nightly"),
            Self::Broken => f.write_str("broken"),
            Self::Skip => f.write_str("skip"),
            Self::Pgo => f.write_str("pgo"),
        }
    }
}

/// Parameter groups addressable as `{group}:{param}` CSV columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    /// Command-line arguments of the executable under test.
    Cli,
    /// Entries of the JSON `--configuration` argument.
    Json,
    /// Harness-side metadata: expected hashes, tolerances, asset paths.
    Meta,
    /// Encoder parameters used to request an encode.
    Erp,
    /// Compliance stream selection.
    Compliance,
}

impl ParamGroup {
    pub const ALL: [Self; 5] = [Self::Cli, Self::Json, Self::Meta, Self::Erp, Self::Compliance];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Json => "json",
            Self::Meta => "meta",
            Self::Erp => "erp",
            Self::Compliance => "compliance",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|group| group.as_str() == name)
    }
}

/// Typed parameter groups of one test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestParams {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cli: ParamMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub json: ParamMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: ParamMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub erp: ParamMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub compliance: ParamMap,
}

impl TestParams {
    #[must_use]
    pub fn group(&self, group: ParamGroup) -> &ParamMap {
        match group {
            ParamGroup::Cli => &self.cli,
            ParamGroup::Json => &self.json,
            ParamGroup::Meta => &self.meta,
            ParamGroup::Erp => &self.erp,
            ParamGroup::Compliance => &self.compliance,
        }
    }

    pub fn group_mut(&mut self, group: ParamGroup) -> &mut ParamMap {
        match group {
            ParamGroup::Cli => &mut self.cli,
            ParamGroup::Json => &mut self.json,
            ParamGroup::Meta => &mut self.meta,
            ParamGroup::Erp => &mut self.erp,
            ParamGroup::Compliance => &mut self.compliance,
        }
    }

    #[must_use]
    pub fn get(&self, group: ParamGroup, param: &str) -> Option<&str> {
        self.group(group).get(param).map(String::as_str)
    }

    /// Expected hashes from `meta:hash_{surface}` columns, keyed by surface.
    #[must_use]
    pub fn expected_hashes(&self) -> BTreeMap<String, String> {
        self.meta
            .iter()
            .filter_map(|(key, value)| {
                let surface = key.strip_prefix("hash_")?;
                (!value.is_empty()).then(|| (surface.to_owned(), value.clone()))
            })
            .collect()
    }

    /// The `json` group coerced into typed JSON values.
    #[must_use]
    pub fn json_config(&self) -> serde_json::Map<String, Value> {
        coerce_json_params(&self.json)
    }
}

/// Coerce CSV string values into JSON: `TRUE`/`FALSE` become booleans,
/// `0x..` hex and decimal integers become numbers, anything containing a dot
/// is tried as a float, and everything else stays a string. Empty values are
/// dropped.
#[must_use]
pub fn coerce_json_params(params: &ParamMap) -> serde_json::Map<String, Value> {
    let mut config = serde_json::Map::new();
    for (param, raw) in params {
        let value = match raw.as_str() {
            "" => continue,
            "TRUE" => Value::Bool(true),
            "FALSE" => Value::Bool(false),
            text if text.contains('.') => text
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or_else(|| Value::String(text.to_owned()), Value::Number),
            text if text.starts_with("0x") => i64::from_str_radix(&text[2..], 16)
                .map_or_else(|_| Value::String(text.to_owned()), Value::from),
            text => text
                .parse::<i64>()
                .map_or_else(|_| Value::String(text.to_owned()), Value::from),
        };
        config.insert(param.clone(), value);
    }
    config
}

/// Registered test functions and their parameter schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFunctionKind {
    /// Decode a stored asset and compare the produced hash.
    AssetHash,
    /// Decode a compliance bitstream with the test harness and compare hashes.
    ComplianceHash,
    /// Decode a requested encode; regeneration is validated by pixel tolerance.
    Tolerance,
}

impl TestFunctionKind {
    pub const ALL: [Self; 3] = [Self::AssetHash, Self::ComplianceHash, Self::Tolerance];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AssetHash => "asset_hash",
            Self::ComplianceHash => "compliance_hash",
            Self::Tolerance => "tolerance",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// `(group, param)` pairs that must be present and non-empty.
    #[must_use]
    pub fn required_params(self) -> &'static [(ParamGroup, &'static str)] {
        match self {
            Self::AssetHash => &[
                (ParamGroup::Meta, "executable"),
                (ParamGroup::Meta, "filepath_hash"),
                (ParamGroup::Meta, "asset_path"),
            ],
            Self::ComplianceHash => &[
                (ParamGroup::Compliance, "id"),
                (ParamGroup::Compliance, "content"),
                (ParamGroup::Compliance, "version"),
                (ParamGroup::Cli, "--base"),
            ],
            Self::Tolerance => &[
                (ParamGroup::Meta, "width"),
                (ParamGroup::Meta, "height"),
                (ParamGroup::Meta, "bitdepth"),
                (ParamGroup::Meta, "tolerance"),
                (ParamGroup::Meta, "threshold"),
            ],
        }
    }
}

impl fmt::Display for TestFunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One loaded test definition. Immutable once the loader returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    /// Position in load order.
    pub id: usize,
    pub function: TestFunctionKind,
    pub group: String,
    pub name: String,
    pub enabled: bool,
    pub enabled_type: EnabledType,
    pub notes: Option<String>,
    pub performance_group: Option<String>,
    pub params: TestParams,
    /// `group:param` columns in CSV order; drives hash-key ordering.
    pub param_order: Vec<(ParamGroup, String)>,
    pub definition_csv: String,
    pub csv_row: usize,
}

impl TestRecord {
    /// `file.csv:row` for diagnostics.
    #[must_use]
    pub fn origin(&self) -> String {
        format!("{}:{}", self.definition_csv, self.csv_row)
    }

    /// Content equality ignoring id, name and provenance.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.function == other.function
            && self.group == other.group
            && self.enabled == other.enabled
            && self.enabled_type == other.enabled_type
            && self.notes == other.notes
            && self.performance_group == other.performance_group
            && self.params == other.params
    }

    /// `(param, value)` pairs that identify this test's outputs, in column
    /// order. Metadata is excluded since it holds the expectations
    /// themselves.
    #[must_use]
    pub fn identity_params(&self) -> Vec<(String, String)> {
        self.param_order
            .iter()
            .filter(|(group, _)| *group != ParamGroup::Meta)
            .filter_map(|(group, param)| {
                self.params
                    .get(*group, param)
                    .map(|value| (param.trim_start_matches('-').to_owned(), value.to_owned()))
            })
            .collect()
    }
}
