//! Test definition loader.
//!
//! Reads every `*.csv` file of the definitions directory (in file-name order)
//! and turns each row into a [`TestRecord`]. Rows are validated against the
//! schema of their test function, names are generated for rows that carry
//! none, and the whole set is checked for duplicate names and duplicate
//! parameters before it is returned.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;

use lcevc_functest_error::{FunctestError, Result};
use tracing::{debug, info};

use crate::config::RunLevel;
use crate::context::SuiteContext;
use crate::record::{EnabledType, ParamGroup, TestFunctionKind, TestParams, TestRecord};

const FUNCTION_COLUMN: &str = "Test Function";
const GROUP_COLUMN: &str = "Group";
const NAME_COLUMN: &str = "Name";
const NOTES_COLUMN: &str = "Notes";
const PERFORMANCE_GROUP_COLUMN: &str = "Performance Group";

/// Parameters that are content references rather than test axes.
const NAME_EXCLUDED_SUBSTRINGS: [&str; 2] = ["base", "lcevc"];

/// Selection settings applied while loading.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub platform: String,
    pub level: RunLevel,
    pub filter_group: Option<String>,
    pub filter_name: Option<String>,
    pub arch: String,
}

impl LoadOptions {
    #[must_use]
    pub fn from_context(ctx: &SuiteContext) -> Self {
        Self {
            platform: ctx.config.platform.clone(),
            level: ctx.config.level,
            filter_group: ctx.config.filter_group.clone(),
            filter_name: ctx.config.filter_name.clone(),
            arch: ctx.config.arch.clone(),
        }
    }

    fn enabled_column(&self) -> String {
        format!("Enabled-{}", self.platform)
    }
}

/// Load every definition of the configured directory.
pub fn load_tests(ctx: &SuiteContext) -> Result<Vec<TestRecord>> {
    load_dir(&ctx.config.definitions_dir, &LoadOptions::from_context(ctx))
}

/// Load, name and validate the definitions in `dir`.
pub fn load_dir(dir: &Path, options: &LoadOptions) -> Result<Vec<TestRecord>> {
    if !dir.is_dir() {
        return Err(FunctestError::DefinitionsDir(dir.to_path_buf()));
    }
    info!(platform = %options.platform, dir = %dir.display(), "loading test definitions");
    if let Some(group) = &options.filter_group {
        info!(group = %group, "filtering tests to group");
    }

    let mut csv_paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    csv_paths.sort();

    let mut tests = Vec::new();
    for path in &csv_paths {
        let csv_name = path
            .file_name()
            .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
        let file = std::fs::File::open(path)?;
        let parsed = parse_definitions(file, &csv_name, options, tests.len())?;
        debug!(csv = %csv_name, rows = parsed.len(), "parsed definitions");
        tests.extend(parsed);
    }

    finish(&mut tests, options)?;
    let enabled = tests.iter().filter(|test| test.enabled).count();
    info!(
        total = tests.len(),
        enabled,
        platform = %options.platform,
        level = %options.level,
        "loaded tests"
    );
    Ok(tests)
}

/// Name, validate and name-filter an already parsed set.
pub fn finish(tests: &mut [TestRecord], options: &LoadOptions) -> Result<()> {
    auto_gen_names(tests);
    check_duplicates(tests)?;
    if let Some(filter) = &options.filter_name {
        info!(filter = %filter, "filtering tests by name substring");
        for test in tests.iter_mut().filter(|test| test.enabled) {
            if !test.name.contains(filter.as_str()) {
                test.enabled = false;
            }
        }
    }
    Ok(())
}

/// Parse one CSV document. Ids continue from `first_id`.
pub fn parse_definitions<R: Read>(
    reader: R,
    csv_name: &str,
    options: &LoadOptions,
    first_id: usize,
) -> Result<Vec<TestRecord>> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();
    let mut records = Vec::new();
    for (csv_row, row) in reader.records().enumerate() {
        let row = row?;
        let cells: Vec<(&str, &str)> = headers
            .iter()
            .map(String::as_str)
            .zip(row.iter())
            .collect();
        let record = parse_row(&cells, csv_name, csv_row, first_id + records.len(), options)?;
        records.push(record);
    }
    Ok(records)
}

fn parse_row(
    cells: &[(&str, &str)],
    csv: &str,
    row: usize,
    id: usize,
    options: &LoadOptions,
) -> Result<TestRecord> {
    let lookup = |column: &str| {
        cells
            .iter()
            .find(|(header, _)| *header == column)
            .map(|(_, value)| *value)
    };
    let required = |column: &str| {
        lookup(column).ok_or_else(|| FunctestError::MissingColumn {
            csv: csv.to_owned(),
            row,
            column: column.to_owned(),
        })
    };

    let function_name = required(FUNCTION_COLUMN)?;
    let group = required(GROUP_COLUMN)?.to_owned();
    let enabled_column = options.enabled_column();
    let enabled_value = required(&enabled_column)?;
    let enabled_type: EnabledType =
        enabled_value
            .parse()
            .map_err(|()| FunctestError::InvalidEnabledType {
                csv: csv.to_owned(),
                row,
                column: enabled_column.clone(),
                value: enabled_value.to_owned(),
            })?;
    let function =
        TestFunctionKind::parse(function_name).ok_or_else(|| FunctestError::UnknownTestFunction {
            csv: csv.to_owned(),
            row,
            function: function_name.to_owned(),
        })?;

    let mut params = TestParams::default();
    let mut param_order = Vec::new();
    for (header, value) in cells {
        let Some((group_name, param)) = header.split_once(':') else {
            continue;
        };
        let param_group =
            ParamGroup::parse(group_name).ok_or_else(|| FunctestError::UnknownParamGroup {
                csv: csv.to_owned(),
                row,
                group: group_name.to_owned(),
                column: (*header).to_owned(),
            })?;
        param_order.push((param_group, param.to_owned()));
        if !value.is_empty() {
            params
                .group_mut(param_group)
                .insert(param.to_owned(), (*value).to_owned());
        }
    }

    for (param_group, param) in function.required_params() {
        if params.get(*param_group, param).is_none() {
            return Err(FunctestError::MissingTestParam {
                csv: csv.to_owned(),
                row,
                function: function.to_string(),
                param: format!("{}:{param}", param_group.as_str()),
            });
        }
    }

    let mut enabled = enabled_type.runs_at(options.level)
        && options
            .filter_group
            .as_deref()
            .is_none_or(|filter| filter == group);
    if let Some(arches) = params.get(ParamGroup::Meta, "arch") {
        enabled &= arches
            .split(',')
            .map(str::trim)
            .any(|arch| arch == options.arch);
    }

    let optional = |column: &str| lookup(column).filter(|v| !v.is_empty()).map(str::to_owned);
    Ok(TestRecord {
        id,
        function,
        group,
        name: optional(NAME_COLUMN).unwrap_or_default(),
        enabled,
        enabled_type,
        notes: optional(NOTES_COLUMN),
        performance_group: optional(PERFORMANCE_GROUP_COLUMN),
        params,
        param_order,
        definition_csv: csv.to_owned(),
        csv_row: row,
    })
}

/// Give every unnamed test a name built from the parameters that vary
/// within its group.
pub fn auto_gen_names(tests: &mut [TestRecord]) {
    let groups: BTreeSet<String> = tests.iter().map(|test| test.group.clone()).collect();
    for group in groups {
        let mut values: BTreeMap<(ParamGroup, String), BTreeSet<String>> = BTreeMap::new();
        for test in tests.iter().filter(|test| test.group == group) {
            for param_group in ParamGroup::ALL {
                if param_group == ParamGroup::Meta {
                    continue;
                }
                for (param, value) in test.params.group(param_group) {
                    values
                        .entry((param_group, param.clone()))
                        .or_default()
                        .insert(value.clone());
                }
            }
        }

        let mut varying: Vec<(String, ParamGroup, String)> = values
            .into_iter()
            .filter(|((_, param), distinct)| {
                distinct.len() > 1
                    && !NAME_EXCLUDED_SUBSTRINGS
                        .iter()
                        .any(|excluded| param.contains(excluded))
            })
            .map(|((param_group, param), _)| {
                (format!("{}:{param}", param_group.as_str()), param_group, param)
            })
            .collect();
        varying.sort();

        for test in tests
            .iter_mut()
            .filter(|test| test.group == group && test.name.is_empty())
        {
            let parts: Vec<String> = varying
                .iter()
                .filter_map(|(_, param_group, param)| {
                    let value = test.params.get(*param_group, param)?;
                    let value = value.rsplit(['/', '\\']).next().unwrap_or(value);
                    (!value.is_empty()).then(|| format!("{}:{value}", param.replace('-', "")))
                })
                .collect();
            test.name = parts.join("-");
        }
    }
}

/// Reject sets with a repeated name or with two tests of identical content.
pub fn check_duplicates(tests: &[TestRecord]) -> Result<()> {
    for (index, first) in tests.iter().enumerate() {
        for second in &tests[index + 1..] {
            if first.name == second.name {
                return Err(FunctestError::DuplicateName {
                    first: first.id,
                    first_origin: first.origin(),
                    second: second.id,
                    second_origin: second.origin(),
                });
            }
        }
    }
    for (index, first) in tests.iter().enumerate() {
        for second in &tests[index + 1..] {
            if first.same_content(second) {
                return Err(FunctestError::DuplicateParams {
                    first: first.id,
                    first_name: first.name.clone(),
                    first_origin: first.origin(),
                    second: second.id,
                    second_name: second.name.clone(),
                    second_origin: second.origin(),
                });
            }
        }
    }
    Ok(())
}
