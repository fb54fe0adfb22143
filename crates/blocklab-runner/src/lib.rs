use anyhow::{anyhow, Result};
use blocklab_core::{
    parse_worker_stdout, CommandBatch, ProtocolError, RawWorkerOutput, Verdict, WorkerOutcome,
};
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

mod sink;
pub use sink::{run_record, JsonlRunSink, RunRecord, RunSink};

pub const MC_HOST_ENV: &str = "MC_HOST";
pub const MC_PORT_ENV: &str = "MC_PORT";
pub const MC_USERNAME_ENV: &str = "MC_USERNAME";
pub const MC_VERSION_ENV: &str = "MC_VERSION";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 25565;
pub const DEFAULT_USERNAME: &str = "executor_bot";
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_STEP_DELAY_MS: u64 = 600;

pub const DEFAULT_RUNNER_PROGRAM: &str = "node";
pub const DEFAULT_WORKER_SCRIPT: &str = "worker/bot_executor.cjs";

/// Process exit code for a runner executable that cannot be started at all,
/// kept distinct from any worker-reported failure.
pub const RUNNER_UNAVAILABLE_EXIT_CODE: i32 = 127;

const MISSING_MINEFLAYER_MARKER: &str = "Cannot find module 'mineflayer'";
const WORKER_NPM_PACKAGES: &str = "mineflayer vec3";

/// Immutable configuration for one harness run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSpec {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// None requests protocol auto-detection in the worker.
    pub version: Option<String>,
    pub timeout_ms: u64,
    pub step_delay_ms: u64,
}

impl InvocationSpec {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("--host must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("--port must be in 1-65535"));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow!("--timeout-ms must be > 0"));
        }
        if self.username.trim().is_empty() {
            return Err(anyhow!("--username must not be empty"));
        }
        Ok(())
    }
}

/// Flag-level values before the flag > env > default precedence chain runs.
#[derive(Debug, Clone, Default)]
pub struct SpecOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub version: Option<String>,
    pub timeout_ms: Option<u64>,
    pub step_delay_ms: Option<u64>,
}

pub fn resolve_spec(overrides: SpecOverrides) -> Result<InvocationSpec> {
    let spec = InvocationSpec {
        host: resolve_string(overrides.host, MC_HOST_ENV, DEFAULT_HOST),
        port: resolve_port(overrides.port, MC_PORT_ENV, DEFAULT_PORT)?,
        username: resolve_string(overrides.username, MC_USERNAME_ENV, DEFAULT_USERNAME),
        version: resolve_version(overrides.version, MC_VERSION_ENV),
        timeout_ms: overrides.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        step_delay_ms: overrides.step_delay_ms.unwrap_or(DEFAULT_STEP_DELAY_MS),
    };
    spec.validate()?;
    Ok(spec)
}

pub fn resolve_string(flag: Option<String>, env_name: &str, fallback: &str) -> String {
    flag.filter(|value| !value.trim().is_empty())
        .or_else(|| env_value(env_name))
        .unwrap_or_else(|| fallback.to_string())
}

pub fn resolve_port(flag: Option<u16>, env_name: &str, fallback: u16) -> Result<u16> {
    if let Some(port) = flag {
        return Ok(port);
    }
    match env_value(env_name) {
        Some(raw) => raw
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                anyhow!(
                    "{} must be a port number in 1-65535 when set (got: {})",
                    env_name,
                    raw
                )
            }),
        None => Ok(fallback),
    }
}

/// Empty or whitespace version values mean auto-detect, same as unset.
pub fn resolve_version(flag: Option<String>, env_name: &str) -> Option<String> {
    flag.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| env_value(env_name))
}

fn env_value(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

/// Locates the external bot runner: the executable plus its entrypoint script.
#[derive(Debug, Clone)]
pub struct WorkerLocator {
    pub program: String,
    pub script: PathBuf,
}

impl Default for WorkerLocator {
    fn default() -> Self {
        Self {
            program: DEFAULT_RUNNER_PROGRAM.to_string(),
            script: PathBuf::from(DEFAULT_WORKER_SCRIPT),
        }
    }
}

impl WorkerLocator {
    /// Directory the npm install hint points at: the worker project root,
    /// one level above the script's own directory.
    pub fn install_dir(&self) -> PathBuf {
        self.script
            .parent()
            .and_then(Path::parent)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Builds the worker argument vector. `--version` is passed only when a
/// version was resolved; a supplied batch appends one `--command` per entry,
/// in order. The worker runs its own fixed command list when no batch is
/// given.
pub fn worker_args(spec: &InvocationSpec, batch: Option<&CommandBatch>) -> Vec<String> {
    let mut args = vec![
        "--host".to_string(),
        spec.host.clone(),
        "--port".to_string(),
        spec.port.to_string(),
        "--username".to_string(),
        spec.username.clone(),
        "--timeout-ms".to_string(),
        spec.timeout_ms.to_string(),
        "--step-delay-ms".to_string(),
        spec.step_delay_ms.to_string(),
    ];
    if let Some(version) = &spec.version {
        args.push("--version".to_string());
        args.push(version.clone());
    }
    if let Some(batch) = batch {
        for command in batch.commands() {
            args.push("--command".to_string());
            args.push(command.clone());
        }
    }
    args
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("worker runner unavailable: {program} not found")]
    Unavailable { program: String },
    #[error("failed to run worker")]
    Io(#[from] std::io::Error),
}

/// Spawns the worker and blocks until it exits, capturing both streams in
/// full. No supervisory timeout is enforced here: the worker owns
/// `timeout_ms` and is trusted to terminate.
pub fn invoke_worker(
    locator: &WorkerLocator,
    spec: &InvocationSpec,
    batch: Option<&CommandBatch>,
) -> Result<RawWorkerOutput, LaunchError> {
    let mut cmd = Command::new(&locator.program);
    cmd.arg(&locator.script);
    cmd.args(worker_args(spec, batch));
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            LaunchError::Unavailable {
                program: locator.program.clone(),
            }
        } else {
            LaunchError::Io(err)
        }
    })?;
    let output = child.wait_with_output()?;

    Ok(RawWorkerOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct RunEvaluation {
    pub verdict: Verdict,
    /// None when the worker output never decoded into a report.
    pub outcome: Option<WorkerOutcome>,
}

/// Turns the untrusted capture triple into a verdict, writing every
/// diagnostic to `diag`. Worker stderr is surfaced first, verbatim and
/// unconditionally; it is advisory, never authoritative.
pub fn evaluate_run(
    raw: &RawWorkerOutput,
    install_dir: &Path,
    diag: &mut impl Write,
) -> Result<RunEvaluation> {
    if !raw.stderr.trim().is_empty() {
        write!(diag, "{}", raw.stderr)?;
        if !raw.stderr.ends_with('\n') {
            writeln!(diag)?;
        }
    }

    let evaluation = match parse_worker_stdout(&raw.stdout) {
        Ok(report) => {
            let outcome = WorkerOutcome::new(report, raw);
            let verdict = Verdict::from_outcome(&outcome);
            if !verdict.success {
                writeln!(diag, "FAILED: worker returned ok=false")?;
                for error in &outcome.errors {
                    writeln!(diag, "- {}", error)?;
                }
                writeln!(diag, "raw_result: {}", outcome.payload)?;
            }
            RunEvaluation {
                verdict,
                outcome: Some(outcome),
            }
        }
        Err(ProtocolError::EmptyOutput) => {
            writeln!(diag, "ERROR: no output from worker")?;
            RunEvaluation {
                verdict: Verdict::protocol_failure(raw.exit_code),
                outcome: None,
            }
        }
        Err(err @ ProtocolError::Malformed(_)) => {
            writeln!(diag, "ERROR: {}", err)?;
            write!(diag, "{}", raw.stdout)?;
            if !raw.stdout.ends_with('\n') {
                writeln!(diag)?;
            }
            RunEvaluation {
                verdict: Verdict::protocol_failure(raw.exit_code),
                outcome: None,
            }
        }
    };

    if !evaluation.verdict.success {
        if let Some(hint) = missing_dependency_hint(&raw.stderr, install_dir) {
            writeln!(diag, "{}", hint)?;
        }
    }

    Ok(evaluation)
}

/// Best-effort enrichment: matches the runner ecosystem's module-not-found
/// text, so it can rot if that text changes. Not part of the result contract.
pub fn missing_dependency_hint(stderr: &str, install_dir: &Path) -> Option<String> {
    if stderr.contains(MISSING_MINEFLAYER_MARKER) {
        Some(format!(
            "hint: install deps: cd {} && npm i {}",
            install_dir.display(),
            WORKER_NPM_PACKAGES
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                chrono::Utc::now().timestamp_micros()
            ));
            fs::create_dir_all(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn spec() -> InvocationSpec {
        InvocationSpec {
            host: "127.0.0.1".to_string(),
            port: 25565,
            username: "executor_bot".to_string(),
            version: None,
            timeout_ms: 60_000,
            step_delay_ms: 600,
        }
    }

    fn shell_worker(guard: &TempDirGuard, body: &str) -> WorkerLocator {
        let script = guard.path.join("fake_worker.sh");
        fs::write(&script, body).expect("worker script");
        WorkerLocator {
            program: "sh".to_string(),
            script,
        }
    }

    fn raw(exit_code: i32, stdout: &str, stderr: &str) -> RawWorkerOutput {
        RawWorkerOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    // Env mutation is process-global; env-sensitive tests take this lock.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_env<T>(pairs: &[(&str, Option<&str>)], body: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous: Vec<(String, Option<String>)> = pairs
            .iter()
            .map(|(name, _)| (name.to_string(), env::var(name).ok()))
            .collect();
        for (name, value) in pairs {
            match value {
                Some(value) => env::set_var(name, value),
                None => env::remove_var(name),
            }
        }
        let result = body();
        for (name, value) in previous {
            match value {
                Some(value) => env::set_var(&name, value),
                None => env::remove_var(&name),
            }
        }
        result
    }

    #[test]
    fn worker_args_follow_the_fixed_grammar() {
        let args = worker_args(&spec(), None);
        assert_eq!(
            args,
            vec![
                "--host",
                "127.0.0.1",
                "--port",
                "25565",
                "--username",
                "executor_bot",
                "--timeout-ms",
                "60000",
                "--step-delay-ms",
                "600",
            ]
        );
    }

    #[test]
    fn worker_args_include_version_only_when_resolved() {
        let mut versioned = spec();
        versioned.version = Some("1.20.4".to_string());
        let args = worker_args(&versioned, None);
        assert_eq!(args[args.len() - 2], "--version");
        assert_eq!(args[args.len() - 1], "1.20.4");
        assert!(!worker_args(&spec(), None).contains(&"--version".to_string()));
    }

    #[test]
    fn worker_args_append_supplied_commands_in_order() {
        let batch = CommandBatch::from_text("/fill 0 64 0 1 64 1 stone\n/setblock 0 65 0 torch");
        let args = worker_args(&spec(), Some(&batch));
        let first = args.iter().position(|a| a == "--command").expect("command flag");
        assert_eq!(args[first + 1], "/fill 0 64 0 1 64 1 stone");
        assert_eq!(args[first + 2], "--command");
        assert_eq!(args[first + 3], "/setblock 0 65 0 torch");
    }

    #[test]
    fn resolution_prefers_flag_over_env_over_default() {
        with_env(
            &[
                (MC_HOST_ENV, Some("env-host")),
                (MC_PORT_ENV, Some("1234")),
                (MC_USERNAME_ENV, None),
                (MC_VERSION_ENV, Some("1.20.1")),
            ],
            || {
                let resolved = resolve_spec(SpecOverrides {
                    host: Some("flag-host".to_string()),
                    ..SpecOverrides::default()
                })
                .expect("spec should resolve");
                assert_eq!(resolved.host, "flag-host");
                assert_eq!(resolved.port, 1234);
                assert_eq!(resolved.username, DEFAULT_USERNAME);
                assert_eq!(resolved.version.as_deref(), Some("1.20.1"));
                assert_eq!(resolved.timeout_ms, DEFAULT_TIMEOUT_MS);
                assert_eq!(resolved.step_delay_ms, DEFAULT_STEP_DELAY_MS);
            },
        );
    }

    #[test]
    fn empty_env_values_are_treated_as_unset() {
        with_env(
            &[
                (MC_HOST_ENV, Some("  ")),
                (MC_PORT_ENV, Some("")),
                (MC_USERNAME_ENV, None),
                (MC_VERSION_ENV, Some("")),
            ],
            || {
                let resolved =
                    resolve_spec(SpecOverrides::default()).expect("spec should resolve");
                assert_eq!(resolved.host, DEFAULT_HOST);
                assert_eq!(resolved.port, DEFAULT_PORT);
                assert!(resolved.version.is_none());
            },
        );
    }

    #[test]
    fn malformed_port_env_is_a_configuration_error() {
        with_env(&[(MC_PORT_ENV, Some("not-a-port"))], || {
            let err = resolve_port(None, MC_PORT_ENV, DEFAULT_PORT)
                .expect_err("malformed env should fail");
            assert!(
                err.to_string().contains(MC_PORT_ENV),
                "unexpected error: {}",
                err
            );
        });
        with_env(&[(MC_PORT_ENV, Some("0"))], || {
            assert!(resolve_port(None, MC_PORT_ENV, DEFAULT_PORT).is_err());
        });
    }

    #[test]
    fn validate_rejects_port_zero_and_zero_timeout() {
        let mut bad = spec();
        bad.port = 0;
        assert!(bad.validate().is_err());
        let mut bad = spec();
        bad.timeout_ms = 0;
        assert!(bad.validate().is_err());
        assert!(spec().validate().is_ok());
    }

    #[test]
    fn missing_runner_program_is_reported_unavailable() {
        let locator = WorkerLocator {
            program: "blocklab_no_such_runner".to_string(),
            script: PathBuf::from("worker.cjs"),
        };
        match invoke_worker(&locator, &spec(), None) {
            Err(LaunchError::Unavailable { program }) => {
                assert_eq!(program, "blocklab_no_such_runner");
            }
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[test]
    fn invoke_worker_captures_the_full_triple() {
        let guard = TempDirGuard::new("blocklab_invoke");
        let locator = shell_worker(
            &guard,
            "echo 'log: connecting' >&2\nprintf '%s' '{\"ok\":true,\"origin\":\"0,64,0\"}'\n",
        );
        let raw = invoke_worker(&locator, &spec(), None).expect("worker should run");
        assert_eq!(raw.exit_code, 0);
        assert!(raw.stdout.contains("\"origin\":\"0,64,0\""));
        assert!(raw.stderr.contains("log: connecting"));
    }

    #[test]
    fn end_to_end_success_against_a_fake_worker() {
        let guard = TempDirGuard::new("blocklab_e2e");
        let locator = shell_worker(
            &guard,
            "printf '%s\\n' 'noise before the record'\nprintf '%s' '{\"ok\":true,\"origin\":\"8,64,8\"}'\n",
        );
        let raw = invoke_worker(&locator, &spec(), None).expect("worker should run");
        let mut diag = Vec::new();
        let evaluation =
            evaluate_run(&raw, &locator.install_dir(), &mut diag).expect("evaluation");
        assert!(evaluation.verdict.success);
        assert_eq!(evaluation.verdict.exit_code, 0);
        let outcome = evaluation.outcome.expect("outcome");
        assert_eq!(outcome.origin.as_deref(), Some("8,64,8"));
    }

    #[test]
    fn reported_failure_surfaces_every_error_once_in_order() {
        let stdout = "{\"ok\":false,\"errors\":[\"block at 0,64,0 is air\",\"block at 1,64,0 is air\"]}";
        let mut diag = Vec::new();
        let evaluation = evaluate_run(&raw(0, stdout, ""), Path::new("."), &mut diag)
            .expect("evaluation");
        assert!(!evaluation.verdict.success);
        assert_eq!(evaluation.verdict.exit_code, 1);

        let text = String::from_utf8(diag).expect("diag is utf-8");
        let first = text.find("- block at 0,64,0 is air").expect("first error");
        let second = text.find("- block at 1,64,0 is air").expect("second error");
        assert!(first < second, "errors must keep report order");
        assert_eq!(text.matches("block at 0,64,0 is air").count(), 2); // listed + raw_result
        assert!(text.contains("raw_result: {"));
    }

    #[test]
    fn empty_stdout_with_clean_exit_fails_with_code_one() {
        let mut diag = Vec::new();
        let evaluation =
            evaluate_run(&raw(0, "", ""), Path::new("."), &mut diag).expect("evaluation");
        assert!(!evaluation.verdict.success);
        assert_eq!(evaluation.verdict.exit_code, 1);
        assert!(String::from_utf8(diag)
            .expect("diag is utf-8")
            .contains("no output from worker"));
    }

    #[test]
    fn malformed_stdout_echoes_the_raw_output() {
        let mut diag = Vec::new();
        let evaluation = evaluate_run(&raw(2, "garbage output", ""), Path::new("."), &mut diag)
            .expect("evaluation");
        assert!(!evaluation.verdict.success);
        assert_eq!(evaluation.verdict.exit_code, 2);
        let text = String::from_utf8(diag).expect("diag is utf-8");
        assert!(text.contains("could not parse worker output as structured data"));
        assert!(text.contains("garbage output"));
    }

    #[test]
    fn worker_stderr_is_always_surfaced_even_on_success() {
        let mut diag = Vec::new();
        let evaluation = evaluate_run(
            &raw(0, "{\"ok\":true}", "chunk load warning\n"),
            Path::new("."),
            &mut diag,
        )
        .expect("evaluation");
        assert!(evaluation.verdict.success);
        assert!(String::from_utf8(diag)
            .expect("diag is utf-8")
            .contains("chunk load warning"));
    }

    #[test]
    fn mineflayer_hint_names_packages_and_install_dir() {
        let stderr = "Error: Cannot find module 'mineflayer'\n";
        let hint = missing_dependency_hint(stderr, Path::new("/srv/bot"))
            .expect("hint should trigger");
        assert!(hint.contains("cd /srv/bot"));
        assert!(hint.contains("npm i mineflayer vec3"));
        assert!(missing_dependency_hint("some other failure", Path::new(".")).is_none());

        let mut diag = Vec::new();
        let evaluation =
            evaluate_run(&raw(1, "", stderr), Path::new("/srv/bot"), &mut diag).expect("evaluation");
        assert_eq!(evaluation.verdict.exit_code, 1);
        assert!(String::from_utf8(diag)
            .expect("diag is utf-8")
            .contains("npm i mineflayer vec3"));
    }

    #[test]
    fn install_dir_is_one_level_above_the_script_dir() {
        let locator = WorkerLocator {
            program: "node".to_string(),
            script: PathBuf::from("/srv/bot/worker/bot_executor.cjs"),
        };
        assert_eq!(locator.install_dir(), PathBuf::from("/srv/bot"));

        let bare = WorkerLocator {
            program: "node".to_string(),
            script: PathBuf::from("bot_executor.cjs"),
        };
        assert_eq!(bare.install_dir(), PathBuf::from("."));
    }
}
