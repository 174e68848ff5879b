use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use lcevc_functest::config::CONFIG_PATH_ENV;
use lcevc_functest::log::init_logging;
use lcevc_functest::{ConfigBuilder, Orchestrator, RunReport, SuiteContext};
use tracing::{error, info, warn};

/// Flags taking a value, and the option each one sets.
const VALUE_FLAGS: [(&str, &str); 19] = [
    ("--platform", "PLATFORM"),
    ("--bin-dir", "BIN_DIR"),
    ("--resource-dir", "RESOURCE_DIR"),
    ("--data-dir", "LCEVC_TEST_DATA_DIR"),
    ("--definitions-dir", "TEST_DEFINITIONS_DIR"),
    ("--arch", "ARCH"),
    ("--erp-path", "ERP_PATH"),
    ("--adb-path", "ADB_PATH"),
    ("--conan-profile", "CONAN_PROFILE"),
    ("--conan-options", "CONAN_OPTIONS"),
    ("--conan-settings", "CONAN_SETTINGS"),
    ("--benchmark-runs", "BENCHMARK_RUNS"),
    ("--warmup-duration", "WARMUP_DURATION"),
    ("--benchmark-duration", "BENCHMARK_DURATION"),
    ("--csv-output", "CSV_OUTPUT"),
    ("--suite", "SUITE"),
    ("--threads", "THREADS"),
    ("--filter-group", "FILTER_GROUP"),
    ("--filter-name", "FILTER_NAME"),
];

/// Switches, and the option each one turns on.
const SWITCH_FLAGS: [(&str, &str); 3] = [
    ("--regen-encodes", "REGEN_ENCODES"),
    ("--regen-hashes", "REGEN"),
    ("--conan-update", "CONAN_UPDATE"),
];

#[derive(Debug, Default)]
struct CliArgs {
    config_path: Option<PathBuf>,
    overrides: Vec<(&'static str, String)>,
    log_json: bool,
}

fn print_help() {
    let help = "\
lcevc-functest: LCEVC decoder functional tests

USAGE:
    lcevc-functest [OPTIONS]

OPTIONS:
    --config <PATH>                 TOML config file (default: $TEST_CONFIG)
    --platform <NAME>               Platform column to read enablement from
    --bin-dir <PATH>                Directory holding the decoder executables
    --resource-dir <PATH>           Extra resources for the executables
    --data-dir <PATH>               Regression hash ledger directory
    --definitions-dir <PATH>        Directory of test definition CSVs
    --arch <ARCH>                   Target architecture for meta:arch filtering
    --regen-encodes                 Produce encodes with the local ERP
    --regen-hashes                  Regenerate expected hashes
    --erp-path <PATH>               ERP executable for --regen-encodes
    --adb-path <PATH>               adb client executable
    --conan-profile <NAME>          Recorded in the results summary
    --conan-options <LIST>          Recorded in the results summary
    --conan-settings <LIST>         Recorded in the results summary
    --conan-update                  Recorded in the results summary
    --benchmark-runs <N>            Recorded in the results summary
    --warmup-duration <SECS>        Recorded in the results summary
    --benchmark-duration <SECS>     Recorded in the results summary
    --csv-output <PATH>             Also write a CSV report
    --suite <full|merge_request>    Run level shortcut
    --threads <N>                   Worker threads
    --filter-group <GROUP>          Only count this group
    --filter-name <TEXT>            Only run and count names containing TEXT
    --log-json                      Log as JSON lines
    -h, --help                      Show this help

Every option can also be set in the config file or through the environment
variable of the same upper-case name.
";
    println!("{help}");
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut index = 0;
    while index < args.len() {
        let arg = args[index].as_str();
        match arg {
            "--config" => {
                index += 1;
                if index >= args.len() {
                    return Err("--config requires a value".to_owned());
                }
                cli.config_path = Some(PathBuf::from(&args[index]));
            }
            "--log-json" => cli.log_json = true,
            "-h" | "--help" => {
                print_help();
                return Err(String::new());
            }
            flag => {
                if let Some((_, option)) = SWITCH_FLAGS.iter().find(|(name, _)| *name == flag) {
                    cli.overrides.push((*option, "true".to_owned()));
                } else if let Some((_, option)) =
                    VALUE_FLAGS.iter().find(|(name, _)| *name == flag)
                {
                    index += 1;
                    if index >= args.len() {
                        return Err(format!("{flag} requires a value"));
                    }
                    cli.overrides.push((*option, args[index].clone()));
                } else {
                    return Err(format!("unknown option: {flag}"));
                }
            }
        }
        index += 1;
    }
    Ok(cli)
}

fn build_context(cli: &CliArgs) -> Result<SuiteContext, String> {
    let mut builder = ConfigBuilder::new();
    let config_path = cli
        .config_path
        .clone()
        .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
    if let Some(path) = &config_path {
        builder = builder.with_file(path).map_err(|err| err.to_string())?;
    }
    builder = builder.with_env(|name| env::var(name).ok());
    for (option, value) in &cli.overrides {
        builder = builder.set(option, value.clone());
    }
    let config = builder.build().map_err(|err| err.to_string())?;
    Ok(SuiteContext::init(config))
}

fn summarise(report: &RunReport) {
    let tally = &report.tally;
    info!(
        passed = tally.passed,
        counted = tally.counted,
        disabled = tally.disabled,
        skipped = tally.skipped,
        broken = tally.broken,
        "results"
    );
    if let Some(path) = &report.results_path {
        info!(path = %path.display(), "results written");
    }
    if report.cancelled {
        warn!("run was interrupted");
    }
}

fn run(args: &[String]) -> Result<bool, String> {
    let cli = parse_args(args)?;
    let ctx = build_context(&cli)?;
    init_logging(&ctx.config.log_level, cli.log_json).map_err(|err| err.to_string())?;

    let orchestrator = Orchestrator::new(ctx);
    let cancel = orchestrator.cancellation();
    if let Err(err) = ctrlc::set_handler(move || cancel.cancel()) {
        warn!(error = %err, "could not install the interrupt handler");
    }

    match orchestrator.run_suite() {
        Ok(report) => {
            summarise(&report);
            Ok(report.overall_pass())
        }
        Err(err) => {
            error!(error = %err, "suite aborted");
            Err(err.to_string())
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(error) if error.is_empty() => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("ERROR lcevc-functest failed: {error}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| (*arg).to_owned()).collect()
    }

    #[test]
    fn flags_become_option_overrides() {
        let cli = parse_args(&args(&[
            "--bin-dir",
            "out/bin",
            "--regen-hashes",
            "--suite",
            "full",
            "--log-json",
        ]))
        .unwrap();
        assert!(cli.log_json);
        assert_eq!(
            cli.overrides,
            vec![
                ("BIN_DIR", "out/bin".to_owned()),
                ("REGEN", "true".to_owned()),
                ("SUITE", "full".to_owned()),
            ]
        );
    }

    #[test]
    fn missing_values_and_unknown_flags_are_rejected() {
        assert_eq!(
            parse_args(&args(&["--data-dir"])).unwrap_err(),
            "--data-dir requires a value"
        );
        assert!(parse_args(&args(&["--bogus"])).unwrap_err().contains("--bogus"));
    }

    #[test]
    fn every_flag_maps_to_a_known_option() {
        for (_, option) in VALUE_FLAGS.iter().chain(SWITCH_FLAGS.iter()) {
            assert!(
                lcevc_functest::config::OPTION_NAMES.contains(option),
                "{option} is not a recognised option"
            );
        }
    }
}
