//! Aggregation and persistence of test results: the JSON results document,
//! the CSV report and the write-back of regenerated hashes into the
//! definition CSVs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lcevc_functest_error::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::context::SuiteContext;
use crate::execution::{TestResult, TestStatus};
use crate::record::EnabledType;

/// Libraries whose sizes are reported, by short name.
const LIBRARIES: [(&str, &str); 2] = [("api", "lcevc_dec_api"), ("core", "lcevc_dec_core")];
const LIBRARY_SEARCH_DEPTH: usize = 6;

// ─── Counting ──────────────────────────────────────────────────────────

/// Pass/skip/broken/fail counts of a set of results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultCounts {
    pub passed: usize,
    pub skipped: usize,
    pub broken: usize,
    pub failed: usize,
}

impl ResultCounts {
    /// Counts over `results`, optionally restricted to one group.
    #[must_use]
    pub fn of<'a>(results: impl IntoIterator<Item = &'a TestResult>, group: Option<&str>) -> Self {
        let mut counts = Self::default();
        for result in results {
            if group.is_some_and(|group| result.group != group) {
                continue;
            }
            let broken = result.enabled_type == EnabledType::Broken;
            if (!result.enabled && !broken) || result.ignored() {
                counts.skipped += 1;
            } else if broken {
                counts.broken += 1;
            } else if result.status() == TestStatus::Passed {
                counts.passed += 1;
            } else {
                counts.failed += 1;
            }
        }
        counts
    }
}

/// Headline numbers of a run, computed over the post-hoc filtered results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTally {
    pub counted: usize,
    pub passed: usize,
    /// Disabled or ignored.
    pub disabled: usize,
    pub skipped: usize,
    pub broken: usize,
}

impl RunTally {
    #[must_use]
    pub fn of(results: &[&TestResult]) -> Self {
        let mut tally = Self {
            counted: results.len(),
            ..Self::default()
        };
        for result in results {
            if result.passed() {
                tally.passed += 1;
            }
            if !result.enabled || result.ignored() {
                tally.disabled += 1;
            }
            if result.enabled_type == EnabledType::Skip || result.ignored() {
                tally.skipped += 1;
            }
            if result.enabled_type == EnabledType::Broken {
                tally.broken += 1;
            }
        }
        tally
    }

    /// Every test that was expected to run passed.
    #[must_use]
    pub fn overall_pass(&self) -> bool {
        self.passed == self.counted - self.disabled
    }
}

/// Results restricted to an exact group and a name substring.
#[must_use]
pub fn filter_results<'a>(
    results: &'a [TestResult],
    group: Option<&str>,
    name: Option<&str>,
) -> Vec<&'a TestResult> {
    results
        .iter()
        .filter(|result| group.is_none_or(|group| result.group == group))
        .filter(|result| name.is_none_or(|name| result.name.contains(name)))
        .collect()
}

// ─── Results document ──────────────────────────────────────────────────

/// Build the `{summary, tests}` document.
///
/// The summary counts every result; the test list leaves out `skip` tests
/// and applies the configured group and name filters.
#[must_use]
pub fn results_document(results: &[TestResult], ctx: &SuiteContext) -> Value {
    let config = &ctx.config;
    let mut summary = Map::new();
    if let Ok(build) = std::env::var("BUILD_NUMBER") {
        summary.insert("ci_build_number".to_owned(), Value::from(build));
    }
    if let Ok(target) = std::env::var("TARGET") {
        summary.insert("ci_target".to_owned(), Value::from(target));
    }
    summary.insert("git_hash".to_owned(), Value::from(ctx.git_hash.clone()));
    summary.insert("platform".to_owned(), Value::from(config.platform.clone()));
    summary.insert(
        "encoder_version".to_owned(),
        config
            .encoder_version
            .clone()
            .map_or(Value::Null, Value::from),
    );
    summary.insert(
        "lib_sizes".to_owned(),
        serde_json::to_value(library_sizes(&config.bin_dir)).unwrap_or_default(),
    );
    summary.insert(
        "benchmark".to_owned(),
        serde_json::to_value(&config.benchmark).unwrap_or_default(),
    );
    summary.insert(
        "conan".to_owned(),
        serde_json::to_value(&config.conan).unwrap_or_default(),
    );
    let groups: BTreeSet<&str> = results.iter().map(|result| result.group.as_str()).collect();
    for group in groups {
        summary.insert(
            group.to_owned(),
            serde_json::to_value(ResultCounts::of(results, Some(group))).unwrap_or_default(),
        );
    }
    if let Value::Object(overall) =
        serde_json::to_value(ResultCounts::of(results, None)).unwrap_or_default()
    {
        summary.extend(overall);
    }

    let tests: Vec<Value> = filter_results(
        results,
        config.filter_group.as_deref(),
        config.filter_name.as_deref(),
    )
    .into_iter()
    .filter(|result| result.enabled_type != EnabledType::Skip)
    .filter_map(|result| serde_json::to_value(result).ok())
    .collect();

    let mut document = Map::new();
    document.insert("summary".to_owned(), Value::Object(summary));
    document.insert("tests".to_owned(), Value::Array(tests));
    Value::Object(document)
}

/// Write the results document as 4-space indented JSON.
pub fn dump_results(results: &[TestResult], ctx: &SuiteContext) -> Result<PathBuf> {
    let path = ctx.config.results_path.clone();
    info!(path = %path.display(), "dumping results");
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(
        &mut out,
        serde_json::ser::PrettyFormatter::with_indent(b"    "),
    );
    results_document(results, ctx).serialize(&mut serializer)?;
    std::fs::write(&path, out)?;
    Ok(path)
}

/// Sizes in bytes of the decoder libraries found next to the binaries.
#[must_use]
pub fn library_sizes(bin_dir: &Path) -> BTreeMap<String, u64> {
    let root = bin_dir.join("..");
    let mut sizes = BTreeMap::new();
    for (short, library) in LIBRARIES {
        if let Some(size) = find_library(&root, library, LIBRARY_SEARCH_DEPTH) {
            sizes.insert(short.to_owned(), size);
        }
    }
    sizes
}

fn is_library_file(file_name: &str, library: &str) -> bool {
    if cfg!(windows) {
        file_name == format!("{library}.dll")
    } else if cfg!(target_os = "macos") {
        file_name == library
    } else {
        file_name
            .strip_prefix("lib")
            .and_then(|rest| rest.strip_prefix(library))
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

fn find_library(dir: &Path, library: &str, depth: usize) -> Option<u64> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    for path in &entries {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned())?;
        if path.is_file() && is_library_file(&name, library) {
            return std::fs::metadata(path).ok().map(|meta| meta.len());
        }
    }
    if depth == 0 {
        return None;
    }
    entries
        .iter()
        .filter(|path| path.is_dir())
        .find_map(|path| find_library(path, library, depth - 1))
}

// ─── Regenerated hash write-back ───────────────────────────────────────

/// Rewrite the definition CSVs with regenerated hashes.
///
/// For every result that carries regenerated hashes, the row it came from
/// loses its `meta:hash*` values and gains one `meta:hash_{surface}` column
/// per regenerated surface. Columns not in a file's header are appended in
/// sorted order. Returns the number of rows rewritten.
pub fn save_regenerated_hashes(results: &[TestResult], definitions_dir: &Path) -> Result<usize> {
    info!(dir = %definitions_dir.display(), "saving regenerated hashes into definitions");
    let mut by_file: BTreeMap<&str, Vec<&TestResult>> = BTreeMap::new();
    for result in results {
        if let (Some(_), Some(csv)) = (&result.regenerated_hashes, &result.definition_csv) {
            by_file.entry(csv.as_str()).or_default().push(result);
        }
    }

    let mut rewritten = 0;
    for (file, regenerated) in by_file {
        let path = definitions_dir.join(file);
        let mut reader = csv::Reader::from_path(&path)?;
        let mut header: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();
        let mut rows: Vec<HashMap<String, String>> = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                header
                    .iter()
                    .cloned()
                    .zip(record.iter().map(str::to_owned))
                    .collect(),
            );
        }

        let mut added = BTreeSet::new();
        for result in regenerated {
            let (Some(row_index), Some(hashes)) = (result.csv_row, &result.regenerated_hashes)
            else {
                continue;
            };
            let Some(row) = rows.get_mut(row_index) else {
                warn!(csv = file, row = row_index, "regenerated test row no longer exists");
                continue;
            };
            row.retain(|column, _| !column.starts_with("meta:hash"));
            for (surface, hash) in hashes {
                let column = format!("meta:hash_{surface}");
                if !header.contains(&column) {
                    added.insert(column.clone());
                }
                row.insert(column, hash.clone());
            }
            rewritten += 1;
        }
        header.extend(added);

        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(&header)?;
        for row in &rows {
            writer.write_record(
                header
                    .iter()
                    .map(|column| row.get(column).map_or("", String::as_str)),
            )?;
        }
        writer.flush()?;
    }
    Ok(rewritten)
}

// ─── CSV report ────────────────────────────────────────────────────────

/// `YYYY-MM-DD HH:MM:SS` in UTC.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Write a CSV report: run metadata rows, a blank row, then one row per test
/// that ran.
pub fn write_csv_report(path: &Path, results: &[TestResult], ctx: &SuiteContext) -> Result<()> {
    let benchmark = &ctx.config.benchmark;
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)?;
    writer.write_record(["Run date", format_timestamp(Utc::now()).as_str()])?;
    writer.write_record(["Git version", ctx.git_hash.as_str()])?;
    writer.write_record(["Benchmark duration", benchmark.duration_secs.to_string().as_str()])?;
    writer.write_record(["Warmup duration", benchmark.warmup_secs.to_string().as_str()])?;
    writer.write_record(["Benchmark runs", benchmark.runs.to_string().as_str()])?;
    writer.write_record([""])?;
    writer.write_record(["ID", "Group", "Name", "Result", "Runtime (s)", "Performance Group"])?;
    for result in results.iter().filter(|result| result.results.is_some()) {
        let status = match result.status() {
            TestStatus::Passed => "pass",
            TestStatus::Failed => "fail",
            TestStatus::Ignored => "ignored",
            TestStatus::NotRun => "not run",
        };
        writer.write_record([
            result.id.to_string().as_str(),
            result.group.as_str(),
            result.name.as_str(),
            status,
            result
                .runtime
                .map_or_else(String::new, |r| format!("{r:.3}"))
                .as_str(),
            result.performance_group.as_deref().unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    info!(path = %path.display(), "wrote CSV report");
    Ok(())
}
