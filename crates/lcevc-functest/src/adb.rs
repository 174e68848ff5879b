//! Remote execution on a device behind the Android debug bridge.
//!
//! The device side is laid out as:
//!
//! ```text
//! {base}/test_workdir/{test}/       per-test scratch, wiped before each test
//! {base}/test_asset_cache/bases/    base YUVs, pushed once and kept
//! {base}/test_asset_cache/*.{ext}   encodes, named {stem}_{push time}.{ext}
//! {base}/test_asset_cache/manifest.json
//! {build}/test_build/{bin,lib}/     the build under test
//! ```
//!
//! Which encodes are on the device, and when they were pushed, is tracked in
//! `manifest.json`; once the cache holds more than the configured number of
//! encodes the oldest are deleted. Base presence is checked by listing the
//! device directory.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lcevc_functest_error::{FunctestError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{AdbSettings, SuiteConfig};
use crate::context::absolute;
use crate::runner::{ProcessOutput, ProcessRunner, RunnerConfig, run_command};

const MANIFEST_NAME: &str = "manifest.json";
const SETUP_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BUILD_PUSH_TIMEOUT: Duration = Duration::from_secs(600);
const BASE_PUSH_TIMEOUT: Duration = Duration::from_secs(3600);
const ENCODE_PUSH_TIMEOUT: Duration = Duration::from_secs(60);

// ─── Transport ─────────────────────────────────────────────────────────

/// Executes `adb` invocations.
pub trait AdbTransport: Send + Sync {
    /// Run `adb -H {host} [-s {serial}] {args}`; the serial is passed when
    /// `targeted` is set.
    fn adb(&self, args: &[String], targeted: bool, timeout: Duration) -> Result<ProcessOutput>;
}

/// Transport that shells out to the `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbCli {
    adb_path: PathBuf,
    server_host: String,
    serial: Option<String>,
    cancel: CancellationToken,
}

impl AdbCli {
    #[must_use]
    pub fn new(settings: &AdbSettings, cancel: CancellationToken) -> Self {
        Self {
            adb_path: settings.adb_path.clone(),
            server_host: settings.server_host.clone(),
            serial: settings.serial.clone(),
            cancel,
        }
    }
}

impl AdbTransport for AdbCli {
    fn adb(&self, args: &[String], targeted: bool, timeout: Duration) -> Result<ProcessOutput> {
        let mut command = Command::new(&self.adb_path);
        command.args(["-H", &self.server_host]);
        if targeted {
            if let Some(serial) = &self.serial {
                command.args(["-s", serial]);
            }
        }
        command.args(args);
        let description = format!("adb {}", args.join(" "));
        run_command(&mut command, &description, timeout, &self.cancel)
    }
}

// ─── Bridge ────────────────────────────────────────────────────────────

/// One entry of the on-device encode cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Host-side file stem the encode was pushed from.
    pub stem: String,
    pub extension: String,
    /// Seconds since the Unix epoch.
    pub pushed_at: u64,
    /// File name on the device.
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

/// Device operations shared by every remote runner of a suite.
pub struct AdbBridge {
    transport: Arc<dyn AdbTransport>,
    settings: AdbSettings,
    cache_lock: Mutex<()>,
}

impl std::fmt::Debug for AdbBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbBridge")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AdbBridge {
    pub fn new(transport: Arc<dyn AdbTransport>, settings: AdbSettings) -> Self {
        Self {
            transport,
            settings,
            cache_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &AdbSettings {
        &self.settings
    }

    fn adb(&self, args: &[&str], timeout: Duration) -> Result<ProcessOutput> {
        let args: Vec<String> = args.iter().map(|arg| (*arg).to_owned()).collect();
        self.transport.adb(&args, true, timeout)
    }

    fn adb_checked(&self, args: &[&str], timeout: Duration) -> Result<ProcessOutput> {
        let output = self.adb(args, timeout)?;
        if output.success() {
            Ok(output)
        } else {
            Err(FunctestError::AdbCommand {
                command: args.join(" "),
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }

    pub fn shell(&self, command: &str, timeout: Duration) -> Result<ProcessOutput> {
        self.adb(&["shell", command], timeout)
    }

    pub fn shell_checked(&self, command: &str) -> Result<ProcessOutput> {
        self.adb_checked(&["shell", command], SETUP_TIMEOUT)
    }

    pub fn push(&self, local: &Path, remote: &str, timeout: Duration) -> Result<()> {
        let local = local.display().to_string();
        self.adb_checked(&["push", &local, remote], timeout)?;
        Ok(())
    }

    pub fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        let local = local.display().to_string();
        self.adb_checked(&["pull", remote, &local], SETUP_TIMEOUT)?;
        Ok(())
    }

    /// Names in a device directory.
    pub fn list_dir(&self, remote: &str) -> Result<Vec<String>> {
        let output = self.shell_checked(&format!("ls {remote}"))?;
        Ok(output
            .stdout
            .lines()
            .map(|line| line.trim().replace(' ', ""))
            .filter(|line| !line.is_empty())
            .collect())
    }

    fn manifest_path(&self) -> String {
        format!("{}/{MANIFEST_NAME}", self.settings.assets_dir())
    }

    /// The on-device manifest, empty when the device has none yet.
    pub fn read_manifest(&self) -> Result<Manifest> {
        let output = self.shell(&format!("cat {}", self.manifest_path()), SETUP_TIMEOUT)?;
        if !output.success() || output.stdout.trim().is_empty() {
            return Ok(Manifest::default());
        }
        Ok(serde_json::from_str(&output.stdout)?)
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let mut local = tempfile::NamedTempFile::new()?;
        serde_json::to_writer(local.as_file_mut(), manifest)?;
        self.push(local.path(), &self.manifest_path(), SETUP_TIMEOUT)
    }

    /// Device path of a base YUV, pushing it if the device lacks it.
    pub fn ensure_base(&self, host_path: &Path, file_name: &str) -> Result<String> {
        let _guard = self.cache_lock.lock();
        let bases = format!("{}/bases", self.settings.assets_dir());
        self.shell_checked(&format!("mkdir -p {bases}"))?;
        let remote = format!("{bases}/{file_name}");
        if !self.list_dir(&bases)?.iter().any(|name| name == file_name) {
            info!(base = file_name, "pushing base to device");
            self.push(host_path, &remote, BASE_PUSH_TIMEOUT)?;
        }
        Ok(remote)
    }

    /// Device path of an encode, pushing it and evicting the oldest cached
    /// encodes if it is not on the device yet.
    pub fn ensure_encode(&self, host_path: &Path, file_name: &str) -> Result<String> {
        let _guard = self.cache_lock.lock();
        let assets = self.settings.assets_dir();
        let (stem, extension) = file_name.rsplit_once('.').unwrap_or((file_name, ""));
        let mut manifest = self.read_manifest()?;
        if let Some(entry) = manifest
            .entries
            .iter()
            .find(|entry| entry.stem == stem && entry.extension == extension)
        {
            return Ok(format!("{assets}/{}", entry.name));
        }

        let pushed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        let name = if extension.is_empty() {
            format!("{stem}_{pushed_at}")
        } else {
            format!("{stem}_{pushed_at}.{extension}")
        };
        info!(encode = %name, "pushing encode to device");
        self.push(host_path, &format!("{assets}/{name}"), ENCODE_PUSH_TIMEOUT)?;
        manifest.entries.push(ManifestEntry {
            stem: stem.to_owned(),
            extension: extension.to_owned(),
            pushed_at,
            name: name.clone(),
        });

        manifest.entries.sort_by_key(|entry| entry.pushed_at);
        let excess = manifest
            .entries
            .len()
            .saturating_sub(self.settings.encode_cache_size.max(1));
        for evicted in manifest.entries.drain(..excess).collect::<Vec<_>>() {
            debug!(encode = %evicted.name, "evicting encode from device cache");
            self.shell_checked(&format!("rm -f {assets}/{}", evicted.name))?;
        }
        self.write_manifest(&manifest)?;
        Ok(format!("{assets}/{name}"))
    }
}

// ─── Device initialisation ─────────────────────────────────────────────

fn is_network_serial(serial: &str) -> bool {
    let Some((host, port)) = serial.rsplit_once(':') else {
        return false;
    };
    let octets: Vec<&str> = host.split('.').collect();
    octets.len() == 4
        && octets
            .iter()
            .all(|o| (1..=3).contains(&o.len()) && o.bytes().all(|b| b.is_ascii_digit()))
        && (3..=4).contains(&port.len())
        && port.bytes().all(|b| b.is_ascii_digit())
}

fn device_state<'a>(devices: &'a str, serial: &str) -> Option<&'a str> {
    devices.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        (fields.next() == Some(serial)).then(|| fields.next().unwrap_or(""))
    })
}

/// Verify the device is reachable and install the build on it.
///
/// Run once before any test; every failure here aborts the suite.
pub fn initialise_adb_device(bridge: &AdbBridge, platform: &str, bin_dir: &Path) -> Result<()> {
    init_device(bridge, platform, bin_dir).map_err(|err| match err {
        FunctestError::AdbDevice(_) => err,
        other => FunctestError::AdbDevice(other.to_string()),
    })
}

fn init_device(bridge: &AdbBridge, platform: &str, bin_dir: &Path) -> Result<()> {
    let settings = bridge.settings();
    info!(platform, "initialising adb device");
    let Some(serial) = settings.serial.as_deref() else {
        return Err(FunctestError::AdbDevice(format!(
            "platform '{platform}' runs over adb, configure ADB_SERIAL for the device"
        )));
    };

    let list_devices = || -> Result<String> {
        let output = bridge
            .transport
            .adb(&["devices".to_owned()], false, SETUP_TIMEOUT)?;
        if !output.success() {
            return Err(FunctestError::AdbDevice(format!(
                "cannot reach the adb server at {}: {}",
                settings.server_host,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    };

    let mut devices = list_devices()?;
    let state = device_state(&devices, serial);
    if is_network_serial(serial) && state != Some("device") {
        debug!(serial, "networked device not connected, connecting");
        let output = bridge.transport.adb(
            &["connect".to_owned(), serial.to_owned()],
            false,
            CONNECT_TIMEOUT,
        )?;
        if !output.success() || !output.stdout.contains("connected") {
            return Err(FunctestError::AdbDevice(format!(
                "could not connect to networked device {serial}: {}",
                output.stderr.trim()
            )));
        }
        devices = list_devices()?;
    }
    match device_state(&devices, serial) {
        Some("device") => {}
        Some(state) => {
            return Err(FunctestError::AdbDevice(format!(
                "device '{serial}' is {state}"
            )));
        }
        None => {
            return Err(FunctestError::AdbDevice(format!(
                "device '{serial}' is not connected to the adb server at {}",
                settings.server_host
            )));
        }
    }

    bridge.adb_checked(&["root"], SETUP_TIMEOUT)?;
    let governor = bridge.shell(
        "su && echo performance | tee /sys/devices/system/cpu/cpu*/cpufreq/scaling_governor",
        SETUP_TIMEOUT,
    )?;
    if !governor.success() {
        warn!(platform, "failed to force device into performance mode");
    }

    let work_dir = settings.work_dir();
    let build_dir = settings.build_dir();
    info!("cleaning device workdir");
    bridge.shell_checked(&format!("rm -rf {work_dir} && mkdir -p {work_dir}"))?;
    bridge.shell_checked(&format!("rm -rf {build_dir} && mkdir -p {build_dir}"))?;
    bridge.shell_checked(&format!("mkdir -p {}", settings.assets_dir()))?;

    let host_bin = absolute(bin_dir);
    let host_lib = absolute(&bin_dir.join("..").join("lib"));
    info!(bin = %host_bin.display(), dest = %build_dir, "pushing build to device");
    bridge.push(&host_bin, &format!("{build_dir}/bin"), BUILD_PUSH_TIMEOUT)?;
    if host_lib.exists() {
        bridge.push(&host_lib, &format!("{build_dir}/lib"), BUILD_PUSH_TIMEOUT)?;
    }
    bridge.shell(&format!("chmod +x {build_dir}/bin/*"), SETUP_TIMEOUT)?;
    Ok(())
}

// ─── Remote runner ─────────────────────────────────────────────────────

/// Runs a pushed executable on the device in a fresh remote directory and
/// copies the results back into the local test directory.
pub struct RemoteRunner {
    bridge: Arc<AdbBridge>,
    executable: String,
    local_workdir: PathBuf,
    remote_workdir: String,
    assets_dir: PathBuf,
    config: RunnerConfig,
    timeout: Duration,
}

impl RemoteRunner {
    /// Wipes and recreates the remote directory for `local_workdir`.
    pub fn new(
        bridge: Arc<AdbBridge>,
        executable: &Path,
        local_workdir: &Path,
        suite: &SuiteConfig,
    ) -> Result<Self> {
        let settings = bridge.settings().clone();
        let file_name = executable
            .file_name()
            .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
        let stem = local_workdir
            .file_stem()
            .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
        let remote_workdir = format!("{}/{stem}", settings.work_dir());
        bridge.shell_checked(&format!("rm -rf {remote_workdir} && mkdir {remote_workdir}"))?;
        bridge.shell(
            &format!("chmod +x {}/bin/*", settings.build_dir()),
            SETUP_TIMEOUT,
        )?;
        Ok(Self {
            bridge,
            executable: format!("{}/bin/{file_name}", settings.build_dir()),
            local_workdir: local_workdir.to_path_buf(),
            remote_workdir,
            assets_dir: absolute(&suite.assets_dir()),
            config: RunnerConfig::new(),
            timeout: Duration::from_secs(suite.timeout_secs),
        })
    }

    #[must_use]
    pub fn remote_workdir(&self) -> &str {
        &self.remote_workdir
    }

    fn copy_back_results(&self) -> Result<()> {
        let parent = self
            .local_workdir
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        std::fs::create_dir_all(&self.local_workdir)?;
        self.bridge.pull(&self.remote_workdir, &parent)?;

        // adb nests the pulled directory when the destination already exists.
        if let Some(stem) = self.local_workdir.file_name() {
            let nested = self.local_workdir.join(stem);
            if nested.is_dir() {
                for entry in std::fs::read_dir(&nested)? {
                    let entry = entry?;
                    std::fs::rename(entry.path(), self.local_workdir.join(entry.file_name()))?;
                }
                std::fs::remove_dir(&nested)?;
            }
        }
        Ok(())
    }
}

impl ProcessRunner for RemoteRunner {
    fn executable(&self) -> &str {
        &self.executable
    }

    fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut RunnerConfig {
        &mut self.config
    }

    fn translate_path(&mut self, path: &Path) -> Result<String> {
        let host = absolute(path);
        let file_name = match host.strip_prefix(&self.assets_dir) {
            Ok(relative) => relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("-"),
            Err(_) => host
                .file_name()
                .map_or_else(String::new, |name| name.to_string_lossy().into_owned()),
        };
        if host
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|dir| dir == "bases")
        {
            self.bridge.ensure_base(&host, &file_name)
        } else {
            self.bridge.ensure_encode(&host, &file_name)
        }
    }

    fn output_dir(&self) -> &Path {
        &self.local_workdir
    }

    fn quote_json(&self, json: String) -> String {
        format!("'{json}'")
    }

    /// Results are pulled back even when the command fails or times out,
    /// so partial output stays available for inspection.
    fn run(&mut self, cancel: &CancellationToken) -> Result<ProcessOutput> {
        cancel.check()?;
        let build = self.bridge.settings().build_dir();
        let command = format!(
            "cd {} && export LD_LIBRARY_PATH={build}/lib/:{build}/bin/:{build}/ && {}",
            self.remote_workdir,
            self.get_command_line().join(" ")
        );
        debug!(command = %command, "running on device");
        let output = self.bridge.shell(&command, self.timeout);
        cancel.check()?;
        let copied = self.copy_back_results();
        match output {
            Ok(output) => copied.map(|()| output),
            Err(err) => {
                if let Err(copy_err) = copied {
                    warn!(error = %copy_err, "could not pull results of a failed run");
                }
                Err(err)
            }
        }
    }

    fn discard_output(&mut self, name: &str) -> Result<()> {
        self.bridge
            .shell_checked(&format!("rm -f {}/{name}", self.remote_workdir))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;

    #[test]
    fn network_serials_are_recognised() {
        assert!(is_network_serial("192.168.0.12:5555"));
        assert!(!is_network_serial("R58M123ABC"));
        assert!(!is_network_serial("192.168.0:5555"));
        assert!(!is_network_serial("10.0.0.1:55"));
    }

    #[test]
    fn device_state_is_read_from_the_listing() {
        let listing = "List of devices attached\nR58M\tdevice\n10.0.0.1:5555\toffline\n\n";
        assert_eq!(device_state(listing, "R58M"), Some("device"));
        assert_eq!(device_state(listing, "10.0.0.1:5555"), Some("offline"));
        assert_eq!(device_state(listing, "missing"), None);
    }

    #[derive(Default)]
    struct FakeDevice {
        calls: Mutex<Vec<Vec<String>>>,
        manifest: Mutex<Option<String>>,
        devices: String,
        /// Shell commands containing this time out.
        hangs_on: Option<&'static str>,
    }

    impl FakeDevice {
        fn with_devices(devices: &str) -> Arc<Self> {
            Arc::new(Self {
                devices: devices.to_owned(),
                ..Self::default()
            })
        }

        fn calls_starting_with(&self, verb: &str) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .iter()
                .filter(|call| call.first().is_some_and(|first| first == verb))
                .cloned()
                .collect()
        }
    }

    fn ok(stdout: &str) -> ProcessOutput {
        ProcessOutput {
            code: Some(0),
            stdout: stdout.to_owned(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        }
    }

    impl AdbTransport for FakeDevice {
        fn adb(
            &self,
            args: &[String],
            _targeted: bool,
            _timeout: Duration,
        ) -> Result<ProcessOutput> {
            self.calls.lock().push(args.to_vec());
            let verb = args.first().map_or("", String::as_str);
            let last = args.last().map_or("", String::as_str);
            match verb {
                "shell" if self.hangs_on.is_some_and(|hang| last.contains(hang)) => {
                    Err(FunctestError::Timeout {
                        command: last.to_owned(),
                        seconds: 1,
                    })
                }
                "devices" => Ok(ok(&self.devices)),
                "push" if last.ends_with(MANIFEST_NAME) => {
                    *self.manifest.lock() = Some(std::fs::read_to_string(&args[1])?);
                    Ok(ok(""))
                }
                "shell" if last.starts_with("cat ") => Ok(self
                    .manifest
                    .lock()
                    .clone()
                    .map_or_else(|| ProcessOutput { code: Some(1), ..ok("") }, |m| ok(&m))),
                _ => Ok(ok("")),
            }
        }
    }

    fn suite(cache: &Path, cache_size: &str) -> SuiteConfig {
        ConfigBuilder::new()
            .set("PLATFORM", "PIXEL5_0")
            .set("ADB_SERIAL", "R58M")
            .set("CACHE_PATH", cache.display().to_string())
            .set("DEVICE_ENCODE_CACHE_SIZE", cache_size)
            .build()
            .unwrap()
    }

    #[test]
    fn encodes_are_pushed_once_and_evicted_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let config = suite(dir.path(), "1");
        let device = FakeDevice::with_devices("");
        let bridge = AdbBridge::new(device.clone(), config.adb.clone());

        let first = bridge
            .ensure_encode(Path::new("/cache/encodes/aaa.ts"), "aaa.ts")
            .unwrap();
        assert!(first.starts_with("/data/local/tmp/test_asset_cache/aaa_"));
        assert!(first.ends_with(".ts"));
        let again = bridge
            .ensure_encode(Path::new("/cache/encodes/aaa.ts"), "aaa.ts")
            .unwrap();
        assert_eq!(first, again);

        bridge
            .ensure_encode(Path::new("/cache/encodes/bbb.ts"), "bbb.ts")
            .unwrap();
        let encode_pushes = device
            .calls_starting_with("push")
            .into_iter()
            .filter(|call| call[1].ends_with(".ts"))
            .count();
        assert_eq!(encode_pushes, 2);
        let evictions: Vec<_> = device
            .calls_starting_with("shell")
            .into_iter()
            .filter(|call| call[1].starts_with("rm -f"))
            .collect();
        assert_eq!(evictions.len(), 1);
        assert!(evictions[0][1].contains("aaa_"));

        let manifest = bridge.read_manifest().unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].stem, "bbb");
    }

    #[test]
    fn remote_runner_pushes_missing_bases_and_quotes_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = suite(dir.path(), "1000");
        let device = FakeDevice::with_devices("");
        let bridge = Arc::new(AdbBridge::new(device.clone(), config.adb.clone()));
        let workdir = dir.path().join("work").join("test_7");
        let mut runner = RemoteRunner::new(
            bridge,
            Path::new("/build/bin/lcevc_dec_test_harness"),
            &workdir,
            &config,
        )
        .unwrap();
        assert_eq!(runner.remote_workdir(), "/data/local/tmp/test_workdir/test_7");

        let base = config.bases_dir().join("park_1080p.yuv");
        runner.set_path_param("--base", &base).unwrap();
        let mut json = serde_json::Map::new();
        json.insert("dither".to_owned(), serde_json::Value::from(0));
        runner.set_json_param("configuration", &json).unwrap();

        assert_eq!(
            runner.get_command_line(),
            [
                "/data/local/tmp/test_build/bin/lcevc_dec_test_harness",
                "--base",
                "/data/local/tmp/test_asset_cache/bases/park_1080p.yuv",
                "--configuration",
                "'{\"dither\":0}'",
            ]
        );
        let pushes = device.calls_starting_with("push");
        assert_eq!(pushes.len(), 1);
        assert!(pushes[0][2].ends_with("bases/park_1080p.yuv"));
    }

    #[test]
    fn offline_device_fails_initialisation() {
        let dir = tempfile::tempdir().unwrap();
        let config = suite(dir.path(), "1000");
        let device = FakeDevice::with_devices("List of devices attached\nR58M\toffline\n");
        let bridge = AdbBridge::new(device, config.adb.clone());
        let err = initialise_adb_device(&bridge, &config.platform, dir.path()).unwrap_err();
        assert!(err.is_infrastructure());
        assert!(err.to_string().contains("offline"));
    }

    #[test]
    fn connected_device_receives_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let config = suite(dir.path(), "1000");
        let bin = dir.path().join("build").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let device = FakeDevice::with_devices("List of devices attached\nR58M\tdevice\n");
        let bridge = AdbBridge::new(device.clone(), config.adb.clone());
        initialise_adb_device(&bridge, &config.platform, &bin).unwrap();

        assert_eq!(device.calls_starting_with("root").len(), 1);
        let pushes = device.calls_starting_with("push");
        assert_eq!(pushes.len(), 1, "no lib directory next to bin");
        assert_eq!(pushes[0][2], "/data/local/tmp/test_build/bin");
    }

    #[test]
    fn zero_cache_size_keeps_the_encode_just_pushed() {
        let dir = tempfile::tempdir().unwrap();
        let config = suite(dir.path(), "0");
        let device = FakeDevice::with_devices("");
        let bridge = AdbBridge::new(device.clone(), config.adb.clone());

        let pushed = bridge
            .ensure_encode(Path::new("/cache/encodes/aaa.ts"), "aaa.ts")
            .unwrap();
        let manifest = bridge.read_manifest().unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert!(pushed.ends_with(&manifest.entries[0].name));
        let removed = device
            .calls_starting_with("shell")
            .into_iter()
            .filter(|call| call[1].starts_with("rm -f"))
            .count();
        assert_eq!(removed, 0);
    }

    fn harness_runner(device: Arc<FakeDevice>, dir: &Path) -> RemoteRunner {
        let config = suite(dir, "1000");
        let bridge = Arc::new(AdbBridge::new(device, config.adb.clone()));
        RemoteRunner::new(
            bridge,
            Path::new("/build/bin/lcevc_dec_test_harness"),
            &dir.join("work").join("test_3"),
            &config,
        )
        .unwrap()
    }

    #[test]
    fn timed_out_run_still_pulls_results_back() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FakeDevice {
            hangs_on: Some("lcevc_dec_test_harness"),
            ..FakeDevice::default()
        });
        let mut runner = harness_runner(device.clone(), dir.path());
        let err = runner.run(&CancellationToken::new()).unwrap_err();
        assert!(matches!(err, FunctestError::Timeout { .. }), "{err}");
        let pulls = device.calls_starting_with("pull");
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0][1], "/data/local/tmp/test_workdir/test_3");
    }

    #[test]
    fn cancelled_run_never_reaches_the_device() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::with_devices("");
        let mut runner = harness_runner(device.clone(), dir.path());
        let before = device.calls.lock().len();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(runner.run(&cancel), Err(FunctestError::Cancelled)));
        assert_eq!(device.calls.lock().len(), before);
    }
}
