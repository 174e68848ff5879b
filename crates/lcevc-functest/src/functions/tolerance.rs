//! Decode a requested encode with the test harness. Regeneration is accepted
//! when the harness output stays within a pixel tolerance of the model
//! decoder's.

use lcevc_functest_error::{FunctestError, Result};
use tracing::debug;

use super::{
    HASH_FILE, TestEnv, TestRun, compare_hashes, ignore_unpublished, meta_number, read_hash_file,
};
use crate::hashes::HashEntry;
use crate::histogram::{FrameGeometry, Subsampling, check_tolerance, pixel_deviation_histogram};
use crate::ltm::harness_outputs;
use crate::record::TestRecord;
use crate::runner::ProcessRunner;

const HARNESS: &str = "lcevc_dec_test_harness";
const OUTPUT_PREFIX: &str = "harness";

pub(super) fn run(test: &TestRecord, env: &TestEnv, run: &mut TestRun) -> Result<()> {
    let expected = if env.regen() {
        HashEntry::new()
    } else {
        env.expected_hashes(test)?
    };
    let encode = env
        .assets
        .get_encode(&test.params.erp)
        .map_err(ignore_unpublished)?;
    debug!(
        encode = %encode.display(),
        params = ?test.params.erp,
        "using ERP encode"
    );
    env.cancel.check()?;

    let mut runner = env.runner(&env.ctx.executable(HARNESS)?, &run.test_dir)?;
    let json = test.params.json_config();
    if !json.is_empty() {
        runner.set_json_param("--configuration", &json)?;
    }
    runner.set_path_param("--input", &encode)?;
    if env.regen() {
        runner.set_param("--output", OUTPUT_PREFIX);
    }
    runner.set_param("--output-hash", HASH_FILE);
    run.record_cmd("dec_test_harness", runner.get_command_line());
    runner.run_checked(&env.cancel)?;

    let generated = read_hash_file(&run.test_dir.join(HASH_FILE))?;
    if env.regen() {
        let outputs = harness_outputs(&run.test_dir)?;
        let [harness_dump] = outputs.as_slice() else {
            return Err(FunctestError::assertion(format!(
                "expected one harness output in the test folder, found {}",
                outputs.len()
            )));
        };
        validate_regen(test, env, run, &encode, harness_dump)?;
        run.regenerated_hashes = generated;
        return Ok(());
    }
    compare_hashes(&expected, &generated)
}

fn validate_regen(
    test: &TestRecord,
    env: &TestEnv,
    run: &mut TestRun,
    encode: &std::path::Path,
    harness_dump: &std::path::Path,
) -> Result<()> {
    env.cancel.check()?;
    let subsampling = test
        .params
        .meta
        .get("subsampling")
        .map_or("420", String::as_str);
    let geometry = FrameGeometry {
        width: meta_number(test, "width")?,
        height: meta_number(test, "height")?,
        bit_depth: meta_number(test, "bitdepth")?,
        subsampling: Subsampling::parse(subsampling)?,
    };

    let mut ltm = env
        .ltm()?
        .reference_runner(&run.test_dir, &env.ctx.config, encode, subsampling)?;
    run.record_cmd("ltm", ltm.get_command_line());
    ltm.run_checked(&env.cancel)?;

    let reference = ltm.output_dir().join(crate::ltm::LTM_REFERENCE_OUTPUT);
    let histograms = pixel_deviation_histogram(&reference, harness_dump, &geometry)?;
    check_tolerance(
        &histograms,
        meta_number(test, "tolerance")?,
        meta_number(test, "threshold")?,
    )
}
