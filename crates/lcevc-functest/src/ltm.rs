//! Reference model decoder used to validate regenerated hashes.
//!
//! The model ships as a zip with one top-level folder holding one prebuilt
//! directory per host OS. The directory for this host is unpacked into the
//! LTM location and stamped with a `version.txt` naming the bundle, so a
//! changed `LTM_URL` triggers a fresh download.

use std::fs::File;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use lcevc_functest_error::{FunctestError, Result};
use tracing::{info, warn};

use crate::checksum::md5_file_hex;
use crate::config::SuiteConfig;
use crate::external::unzip;
use crate::runner::{LocalRunner, ProcessRunner};

pub const LTM_EXECUTABLE: &str = "ModelDecoder";
pub const LTM_OUTPUT: &str = "ltm.yuv";
pub const LTM_REFERENCE_OUTPUT: &str = "ltm_ref.yuv";

const VERSION_FILE: &str = "version.txt";
/// Build targets the prebuilt model does not cover.
const UNSUPPORTED_TARGETS: [&str; 2] = ["aarch64", "linux"];

/// A located model install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ltm {
    dir: PathBuf,
    version: String,
}

impl Ltm {
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn executable(&self) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{LTM_EXECUTABLE}.exe")
        } else {
            LTM_EXECUTABLE.to_owned()
        };
        crate::context::absolute(&self.dir.join(name))
    }

    /// Always a local runner, even when tests target a device.
    #[must_use]
    pub fn runner(&self, test_dir: &Path, suite: &SuiteConfig) -> LocalRunner {
        LocalRunner::new(&self.executable(), test_dir, suite)
    }

    /// Decode an elementary compliance stream to [`LTM_OUTPUT`].
    ///
    /// `stream_config` is the stream's conformance config; its `format`
    /// decides whether the base is decoded externally and `base_encoder`
    /// names the base codec.
    pub fn compliance_runner(
        &self,
        test_dir: &Path,
        suite: &SuiteConfig,
        es_path: &Path,
        stream_config: &serde_json::Value,
    ) -> Result<LocalRunner> {
        let format = stream_config
            .get("format")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let Some(base_encoder) = stream_config
            .get("base_encoder")
            .and_then(serde_json::Value::as_str)
        else {
            return Err(FunctestError::assertion(
                "stream config has no 'base_encoder'",
            ));
        };
        let mut runner = self.runner(test_dir, suite);
        runner.set_path_param("--input_file", es_path)?;
        if !format.starts_with("yuv") || format.ends_with("12") || format.ends_with("14") {
            runner.set_param("--base_external", "true");
        }
        runner.set_param("--base", base_encoder);
        runner.set_param("--encapsulation", "nal");
        runner.set_param("--output_file", LTM_OUTPUT);
        Ok(runner)
    }

    /// Decode an ERP encode to [`LTM_REFERENCE_OUTPUT`].
    pub fn reference_runner(
        &self,
        test_dir: &Path,
        suite: &SuiteConfig,
        encode_path: &Path,
        subsampling: &str,
    ) -> Result<LocalRunner> {
        let mut runner = self.runner(test_dir, suite);
        runner.set_path_param("--input_file", encode_path)?;
        runner.set_param("--base", "hevc");
        runner.set_param("--encapsulation", "sei_reg");
        runner.set_param("--format", &format!("yuv{subsampling}p"));
        runner.set_param("--output_file", LTM_REFERENCE_OUTPUT);
        Ok(runner)
    }
}

/// Whether the first `harness*` output in `test_dir` is byte-identical to
/// the model's [`LTM_OUTPUT`].
pub fn matches_harness_output(test_dir: &Path) -> Result<bool> {
    let harness = harness_outputs(test_dir)?;
    let Some(first) = harness.first() else {
        return Err(FunctestError::assertion(format!(
            "no harness output in {}",
            test_dir.display()
        )));
    };
    Ok(md5_file_hex(first)? == md5_file_hex(&test_dir.join(LTM_OUTPUT))?)
}

/// Files in `dir` whose names start with `harness`, sorted.
pub fn harness_outputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut outputs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("harness") {
            outputs.push(entry.path());
        }
    }
    outputs.sort();
    Ok(outputs)
}

// ─── Installation ──────────────────────────────────────────────────────

/// Directory name the bundle uses for this host OS.
fn host_bundle_dir() -> &'static str {
    match std::env::consts::OS {
        "windows" => "win32",
        "macos" => "darwin",
        other => other,
    }
}

fn is_platform_supported(config: &SuiteConfig) -> bool {
    if config.is_adb_platform() || cfg!(target_os = "macos") {
        return false;
    }
    std::env::var("TARGET").map_or(true, |target| {
        !UNSUPPORTED_TARGETS
            .iter()
            .any(|invalid| target.contains(invalid))
    })
}

/// Bundle name requested by `url`: its last path segment without extension.
#[must_use]
pub fn requested_version(url: &str) -> &str {
    let name = url.rsplit('/').next().unwrap_or(url);
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

/// Locate the model, downloading it when it is absent or stale.
///
/// # Errors
///
/// [`FunctestError::Ltm`] when the model is missing and cannot be fetched.
pub fn initialise_ltm(config: &SuiteConfig) -> Result<Ltm> {
    let dir = config.ltm_dir();
    if !is_platform_supported(config) && !dir.exists() {
        return Err(FunctestError::Ltm(format!(
            "platform {} is not supported by the prebuilt model",
            config.platform
        )));
    }

    if dir.exists() {
        let existing = std::fs::read_to_string(dir.join(VERSION_FILE))
            .map(|text| text.trim().to_owned())
            .unwrap_or_default();
        match config.ltm_url.as_deref().map(requested_version) {
            Some(requested) if requested != existing => {
                info!(
                    existing = %existing,
                    requested,
                    "cached LTM version does not match, re-downloading"
                );
                std::fs::remove_dir_all(&dir)?;
            }
            _ => {
                info!(version = %existing, "using cached LTM");
                return Ok(Ltm {
                    dir,
                    version: existing,
                });
            }
        }
    }

    let Some(url) = config.ltm_url.as_deref() else {
        return Err(FunctestError::Ltm(format!(
            "no model at {} and LTM_URL is not configured",
            dir.display()
        )));
    };
    download_ltm(config, url, &dir)
}

fn download_ltm(config: &SuiteConfig, url: &str, dir: &Path) -> Result<Ltm> {
    let (Some(user), Some(password)) = (&config.nexus_user, &config.nexus_password) else {
        return Err(FunctestError::Ltm(
            "NEXUS_USER and NEXUS_PASSWORD are required to download the model".to_owned(),
        ));
    };
    std::fs::create_dir_all(&config.cache_path)?;
    let staging = tempfile::Builder::new()
        .prefix("ltm_temp_")
        .tempdir_in(&config.cache_path)?;

    let credentials = STANDARD.encode(format!("{user}:{password}"));
    info!(url, "downloading LTM");
    let response = match ureq::get(url)
        .set("Authorization", &format!("Basic {credentials}"))
        .call()
    {
        Ok(response) => response,
        Err(ureq::Error::Status(401, _)) => {
            return Err(FunctestError::Ltm(
                "failed to authenticate with the model repository (401)".to_owned(),
            ));
        }
        Err(ureq::Error::Status(status, response)) => {
            let body = response.into_string().unwrap_or_default();
            return Err(FunctestError::Ltm(format!(
                "failed to download the model ({status}): {body}"
            )));
        }
        Err(err) => return Err(FunctestError::Ltm(format!("failed to reach {url}: {err}"))),
    };
    let bundle = staging.path().join("ltm.zip");
    let mut file = File::create(&bundle)?;
    std::io::copy(&mut response.into_reader(), &mut file)?;
    drop(file);
    unzip(&bundle, staging.path())?;
    std::fs::remove_file(&bundle)?;

    install_bundle(staging.path(), dir)
}

/// Move the host directory of an unpacked bundle into `dir`.
fn install_bundle(unpacked: &Path, dir: &Path) -> Result<Ltm> {
    let mut folders: Vec<PathBuf> = std::fs::read_dir(unpacked)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .collect();
    if folders.len() != 1 {
        return Err(FunctestError::Ltm(format!(
            "expected one folder in the model bundle, found {}",
            folders.len()
        )));
    }
    let root = folders.remove(0);
    let version = root
        .file_name()
        .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
    let host = root.join(host_bundle_dir());
    if !host.is_dir() {
        return Err(FunctestError::Ltm(format!(
            "model bundle {version} has no build for {}",
            host_bundle_dir()
        )));
    }
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(&host, dir)?;
    make_executable(dir)?;
    std::fs::write(dir.join(VERSION_FILE), &version)?;
    info!(version = %version, "using downloaded LTM");
    Ok(Ltm {
        dir: dir.to_path_buf(),
        version,
    })
}

#[cfg(unix)]
fn make_executable(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let codecs = dir.join("external_codecs");
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    if codecs.is_dir() {
        for codec in std::fs::read_dir(&codecs)? {
            let codec = codec?.path();
            if codec.is_dir() {
                for entry in std::fs::read_dir(&codec)? {
                    files.push(entry?.path());
                }
            }
        }
    }
    for file in files.iter().filter(|path| path.is_file()) {
        if let Err(err) = std::fs::set_permissions(file, std::fs::Permissions::from_mode(0o755)) {
            warn!(path = %file.display(), error = %err, "could not mark model file executable");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_dir: &Path) -> Result<()> {
    Ok(())
}
