//! Decode a compliance bitstream with the test harness and compare the
//! per-surface hashes. Regenerated hashes are only accepted when the harness
//! output is identical to the model decoder's.

use lcevc_functest_error::{FunctestError, Result};

use super::{HASH_FILE, TestEnv, TestRun, compare_hashes, ignore_unpublished, read_hash_file};
use crate::hashes::HashEntry;
use crate::ltm::matches_harness_output;
use crate::record::{ParamGroup, TestRecord};
use crate::runner::ProcessRunner;

const HARNESS: &str = "lcevc_dec_test_harness";
const OUTPUT_PREFIX: &str = "harness";

pub(super) fn run(test: &TestRecord, env: &TestEnv, run: &mut TestRun) -> Result<()> {
    let compliance = |name: &str| {
        test.params
            .get(ParamGroup::Compliance, name)
            .ok_or_else(|| FunctestError::assertion(format!("missing compliance:{name}")))
    };
    let id = compliance("id")?;
    let content = compliance("content")?;
    let Some(base) = test.params.get(ParamGroup::Cli, "--base") else {
        return Err(FunctestError::assertion("missing cli:--base"));
    };

    let expected = if env.regen() {
        HashEntry::new()
    } else {
        env.expected_hashes(test)?
    };
    let stream = env
        .assets
        .get_asset(&format!("compliance_bin/{id}/{content}.bin"))
        .map_err(ignore_unpublished)?;
    env.cancel.check()?;

    let mut runner = env.runner(&env.ctx.executable(HARNESS)?, &run.test_dir)?;
    runner.set_path_param("--lcevc", &stream)?;
    runner.set_path_param("--base", &env.ctx.format_path(base))?;
    runner.set_json_param("--configuration", &test.params.json_config())?;
    runner.set_param("--output-hash", HASH_FILE);
    if env.regen() {
        runner.set_param("--output", OUTPUT_PREFIX);
    }
    run.record_cmd("harness", runner.get_command_line());
    runner.run_checked(&env.cancel)?;

    let generated = read_hash_file(&run.test_dir.join(HASH_FILE))?;
    if env.regen() {
        validate_regen(test, env, run)?;
        run.regenerated_hashes = generated;
        return Ok(());
    }
    compare_hashes(&expected, &generated)
}

fn validate_regen(test: &TestRecord, env: &TestEnv, run: &mut TestRun) -> Result<()> {
    if env.is_remote() {
        return Err(FunctestError::assertion(
            "compliance hashes cannot be regenerated on a device",
        ));
    }
    env.cancel.check()?;
    let compliance = |name: &str| {
        test.params
            .get(ParamGroup::Compliance, name)
            .unwrap_or_default()
    };
    let (es_path, config_path) = env.assets.get_compliance(
        compliance("version"),
        compliance("id"),
        compliance("content"),
    )?;
    let stream_config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;

    let mut ltm = env
        .ltm()?
        .compliance_runner(&run.test_dir, &env.ctx.config, &es_path, &stream_config)?;
    run.record_cmd("ltm", ltm.get_command_line());
    ltm.run_checked(&env.cancel)?;

    if matches_harness_output(&run.test_dir)? {
        Ok(())
    } else {
        Err(FunctestError::assertion(
            "harness output does not match the model decoder, cannot regenerate hashes",
        ))
    }
}
