//! Decode a stored asset with one of the decoder executables and compare the
//! hash it reports.

use lcevc_functest_error::{FunctestError, Result};

use super::{HASH_FILE, TestEnv, TestRun, compare_hashes, ignore_unpublished, read_hash_file};
use crate::checksum::md5_file_hex;
use crate::hashes::HashEntry;
use crate::record::TestRecord;

const SAMPLE_CONFIG: &str = "config.json";
const SAMPLE_DUMP: &str = "dump.yuv";
const MD5_SAMPLE: &str = "lcevc_dec_sample";
const DEFAULT_HASH_KEY: &str = "high";

pub(super) fn run(test: &TestRecord, env: &TestEnv, run: &mut TestRun) -> Result<()> {
    let meta = &test.params.meta;
    let param = |name: &str| {
        meta.get(name)
            .map(String::as_str)
            .ok_or_else(|| FunctestError::assertion(format!("missing meta:{name}")))
    };
    let executable = param("executable")?;
    let hash_flag = param("filepath_hash")?;
    let hash_key = meta
        .get("json_hash_key")
        .map_or(DEFAULT_HASH_KEY, String::as_str);

    let expected = if env.regen() {
        HashEntry::new()
    } else {
        env.expected_hashes(test)?
    };
    let stream = env
        .assets
        .get_asset(param("asset_path")?)
        .map_err(ignore_unpublished)?;
    env.cancel.check()?;

    let mut runner = env.runner(&env.ctx.executable(executable)?, &run.test_dir)?;
    if executable.contains("sample") {
        let mut config = serde_json::Map::new();
        config.insert(hash_flag.to_owned(), HASH_FILE.into());
        std::fs::write(
            run.test_dir.join(SAMPLE_CONFIG),
            serde_json::to_vec(&config)?,
        )?;
        runner.set_positional_path(0, &stream)?;
        runner.set_positional_arg(1, SAMPLE_DUMP);
        runner.set_positional_arg(2, SAMPLE_CONFIG);
    } else {
        runner.set_path_param("--input", &stream)?;
        runner.set_param(hash_flag, HASH_FILE);
    }
    run.record_cmd(executable, runner.get_command_line());
    runner.run_checked(&env.cancel)?;
    if env.is_remote() {
        runner.discard_output(SAMPLE_DUMP)?;
    }

    let generated = if executable == MD5_SAMPLE {
        let mut hashes = HashEntry::new();
        hashes.insert(
            DEFAULT_HASH_KEY.to_owned(),
            md5_file_hex(&run.test_dir.join(SAMPLE_DUMP))?,
        );
        hashes
    } else {
        read_hash_file(&run.test_dir.join(HASH_FILE))?
    };
    let Some(output_hash) = generated.get(if executable == MD5_SAMPLE {
        DEFAULT_HASH_KEY
    } else {
        hash_key
    }) else {
        return Err(FunctestError::assertion(format!(
            "no '{hash_key}' hash in the output of {executable}"
        )));
    };

    if env.regen() {
        run.record_regenerated_hash("hash", output_hash.clone());
        return Ok(());
    }
    let mut actual = HashEntry::new();
    actual.insert("hash".to_owned(), output_hash.clone());
    compare_hashes(&expected, &actual)
}
