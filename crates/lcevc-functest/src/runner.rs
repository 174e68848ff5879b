//! Command-line construction and process execution.
//!
//! [`ProcessRunner`] is the one interface tests use to drive an executable,
//! whether it runs on this host ([`LocalRunner`]) or on a device behind the
//! debug bridge ([`crate::adb::RemoteRunner`]).

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use lcevc_functest_error::{FunctestError, Result};
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::SuiteConfig;
use crate::context::absolute;

/// Parameter value emitted as a bare switch with no argument.
pub const FLAG: &str = "FLAG";

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long output readers may lag behind the process they read from.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const VALGRIND_PREFIX: [&str; 5] = [
    "valgrind",
    "--error-exitcode=1",
    "--trace-children=yes",
    "--leak-check=full",
    "--leak-resolution=med",
];

// ─── Command-line model ────────────────────────────────────────────────

/// Named parameters in insertion order plus positional arguments by index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerConfig {
    params: Vec<(String, String)>,
    positional: BTreeMap<usize, String>,
}

impl RunnerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` (leading dashes are ignored). Re-setting keeps the
    /// parameter's original position.
    pub fn set_param(&mut self, name: &str, value: impl Into<String>) {
        let name = name.trim_start_matches('-');
        let value = value.into();
        if let Some(slot) = self.params.iter_mut().find(|(key, _)| key == name) {
            slot.1 = value;
        } else {
            self.params.push((name.to_owned(), value));
        }
    }

    #[must_use]
    pub fn get_param(&self, name: &str) -> Option<&str> {
        let name = name.trim_start_matches('-');
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn unset_param(&mut self, name: &str) {
        let name = name.trim_start_matches('-');
        self.params.retain(|(key, _)| key != name);
    }

    pub fn set_positional_arg(&mut self, index: usize, value: impl Into<String>) {
        self.positional.insert(index, value.into());
    }

    /// Positional arguments by index, then `-p value` / `--param value`.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.positional.values().cloned().collect();
        for (name, value) in &self.params {
            let prefix = if name.chars().count() == 1 { "-" } else { "--" };
            args.push(format!("{prefix}{name}"));
            if value != FLAG {
                args.push(value.clone());
            }
        }
        args
    }
}

/// Exit status and captured output of one invocation.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

// ─── Runner interface ──────────────────────────────────────────────────

/// Drives one executable under test.
pub trait ProcessRunner: Send {
    /// Executable as it appears on the command line.
    fn executable(&self) -> &str;

    fn config(&self) -> &RunnerConfig;

    fn config_mut(&mut self) -> &mut RunnerConfig;

    /// Map a host path to the path the executable should see.
    fn translate_path(&mut self, path: &Path) -> Result<String>;

    /// Local directory the executable's outputs are available in after `run`.
    fn output_dir(&self) -> &Path;

    /// Arguments placed before the executable.
    fn command_prefix(&self) -> Vec<String> {
        Vec::new()
    }

    /// Wrap a compact JSON document for the command line.
    fn quote_json(&self, json: String) -> String {
        json
    }

    /// Execute the command line. Never fails on a non-zero exit code.
    fn run(&mut self, cancel: &CancellationToken) -> Result<ProcessOutput>;

    /// Drop a large output file from wherever the executable wrote it once
    /// its content has been copied or consumed.
    fn discard_output(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn set_param(&mut self, name: &str, value: &str) {
        self.config_mut().set_param(name, value);
    }

    fn set_path_param(&mut self, name: &str, path: &Path) -> Result<()> {
        let value = self.translate_path(path)?;
        self.config_mut().set_param(name, value);
        Ok(())
    }

    fn set_positional_arg(&mut self, index: usize, value: &str) {
        self.config_mut().set_positional_arg(index, value);
    }

    fn set_positional_path(&mut self, index: usize, path: &Path) -> Result<()> {
        let value = self.translate_path(path)?;
        self.config_mut().set_positional_arg(index, value);
        Ok(())
    }

    fn set_json_param(
        &mut self,
        name: &str,
        value: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let quoted = self.quote_json(json);
        self.config_mut().set_param(name, quoted);
        Ok(())
    }

    fn get_command_line(&self) -> Vec<String> {
        let mut line = self.command_prefix();
        line.push(self.executable().to_owned());
        line.extend(self.config().to_args());
        line
    }

    /// [`ProcessRunner::run`], failing on a non-zero exit code.
    fn run_checked(&mut self, cancel: &CancellationToken) -> Result<ProcessOutput> {
        let output = self.run(cancel)?;
        if output.success() {
            Ok(output)
        } else {
            Err(FunctestError::ProcessFailed {
                executable: self.executable().to_owned(),
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

// ─── Local execution ───────────────────────────────────────────────────

/// Runs an executable on this host inside a test working directory.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    executable: String,
    workdir: PathBuf,
    config: RunnerConfig,
    env: Vec<(String, String)>,
    timeout: Duration,
    valgrind: bool,
}

impl LocalRunner {
    #[must_use]
    pub fn new(executable: &Path, workdir: &Path, suite: &SuiteConfig) -> Self {
        let mut env = Vec::new();
        if !cfg!(windows) && std::env::var_os("LD_LIBRARY_PATH").is_none() {
            let lib_dir = absolute(&suite.bin_dir.join("..").join("lib"));
            env.push(("LD_LIBRARY_PATH".to_owned(), lib_dir.display().to_string()));
        }
        let valgrind = suite.enable_valgrind && cfg!(target_os = "linux");
        if suite.enable_valgrind && !valgrind {
            warn!("valgrind is only supported on Linux, running without it");
        }
        Self {
            executable: executable.display().to_string(),
            workdir: workdir.to_path_buf(),
            config: RunnerConfig::new(),
            env,
            timeout: Duration::from_secs(suite.timeout_secs),
            valgrind,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.env.retain(|(key, _)| key != name);
        self.env.push((name.to_owned(), value.to_owned()));
        self
    }
}

impl ProcessRunner for LocalRunner {
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
        Ok(absolute(path).display().to_string())
    }

    fn output_dir(&self) -> &Path {
        &self.workdir
    }

    fn command_prefix(&self) -> Vec<String> {
        if self.valgrind {
            VALGRIND_PREFIX.iter().map(|arg| (*arg).to_owned()).collect()
        } else {
            Vec::new()
        }
    }

    fn run(&mut self, cancel: &CancellationToken) -> Result<ProcessOutput> {
        let line = self.get_command_line();
        let Some((program, args)) = line.split_first() else {
            return Err(FunctestError::assertion("empty command line"));
        };
        std::fs::create_dir_all(&self.workdir)?;
        let mut command = Command::new(program);
        command.args(args).current_dir(&self.workdir);
        for (name, value) in &self.env {
            command.env(name, value);
        }
        debug!(command = %line.join(" "), cwd = %self.workdir.display(), "running");
        run_command(&mut command, &line.join(" "), self.timeout, cancel)
    }
}

// ─── Process plumbing ──────────────────────────────────────────────────

/// Spawn `command`, capture its output and wait for it, killing it on
/// timeout or cancellation.
///
/// The child is placed in its own process group so an interactive interrupt
/// only reaches the harness. On timeout or cancellation the whole group is
/// killed, so helpers the command spawned cannot hold its output open.
pub fn run_command(
    command: &mut Command,
    description: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    cancel.check()?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let started = Instant::now();
    let mut child = command.spawn().map_err(|err| {
        FunctestError::assertion(format!("failed to start '{description}': {err}"))
    })?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = wait_for_child(&mut child, description, timeout, cancel);
    let stdout = collect(stdout, description);
    let stderr = collect(stderr, description);
    let code = status?;
    Ok(ProcessOutput {
        code,
        stdout,
        stderr,
        elapsed: started.elapsed(),
    })
}

fn wait_for_child(
    child: &mut Child,
    description: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<i32>> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.code());
        }
        if cancel.is_cancelled() {
            kill_group(child);
            return Err(FunctestError::Cancelled);
        }
        if started.elapsed() >= timeout {
            kill_group(child);
            return Err(FunctestError::Timeout {
                command: description.to_owned(),
                seconds: timeout.as_secs(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Kill `child` and everything else in its process group, then reap it.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            debug!(pid = child.id(), error = %err, "killpg failed, killing the child only");
            let _ = child.kill();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<Vec<u8>>> {
    pipe.map(|mut pipe| {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            let _ = sender.send(buffer);
        });
        receiver
    })
}

/// Output read so far. A reader still blocked after [`DRAIN_GRACE`] is
/// abandoned; some process outside our reach holds the pipe open.
fn collect(receiver: Option<Receiver<Vec<u8>>>, description: &str) -> String {
    let Some(receiver) = receiver else {
        return String::new();
    };
    match receiver.recv_timeout(DRAIN_GRACE) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            warn!(command = description, "output still open after exit, discarding it");
            String::new()
        }
    }
}
