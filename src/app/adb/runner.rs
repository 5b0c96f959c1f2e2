use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::error::AppError;
use crate::app::models::CommandResult;
use crate::app::output::OutputSink;

/// One shell invocation. Tokens are joined with spaces, so they may carry pipes,
/// quoting and redirections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub line: String,
    pub input: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ShellCommand {
    pub fn new<S: AsRef<str>>(tokens: &[S]) -> Self {
        let line = tokens
            .iter()
            .map(|token| token.as_ref())
            .filter(|token| !token.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            line,
            input: None,
            cwd: None,
            timeout: None,
        }
    }

    /// Lines fed to the process's stdin, newline-joined with a trailing newline.
    pub fn with_input<S: AsRef<str>>(mut self, lines: &[S]) -> Self {
        self.input = Some(lines.iter().map(|line| line.as_ref().to_string()).collect());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn needs_sudo(&self) -> bool {
        self.line.contains("sudo")
    }

    fn stdin_payload(&self) -> Option<String> {
        self.input.as_ref().map(|lines| {
            let mut payload = lines.join("\n");
            payload.push('\n');
            payload
        })
    }
}

/// Executes shell invocations. Implemented by [`ShellSession`] for real processes.
pub trait CommandRunner {
    fn run(&mut self, command: &ShellCommand) -> Result<CommandResult, AppError>;

    /// Tags subsequent invocations with the operation's trace id.
    fn set_trace_id(&mut self, _trace_id: &str) {}
}

/// Long-lived runner that reports every invocation through the output sink and primes
/// sudo at most once.
pub struct ShellSession {
    sink: OutputSink,
    sudo_password: Option<String>,
    primed: bool,
    default_timeout: Duration,
    env: Vec<(String, String)>,
    trace_id: String,
}

impl ShellSession {
    pub fn new(sink: OutputSink, default_timeout: Duration, sudo_password: Option<String>) -> Self {
        Self {
            sink,
            sudo_password,
            primed: false,
            default_timeout,
            env: Vec::new(),
            trace_id: String::new(),
        }
    }

    /// Sets an environment variable for every process this session spawns.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    fn prime_sudo(&mut self) {
        self.primed = true;
        let Some(password) = self.sudo_password.clone() else {
            warn!(trace_id = %self.trace_id, "no sudo password configured; sudo needs cached credentials or NOPASSWD");
            return;
        };
        let priming = ShellCommand::new(&["sudo", "-S", "echo", "'setting up sudo'"])
            .with_input(&[password]);
        match self.execute(&priming) {
            Ok(result) if result.success() => debug!(trace_id = %self.trace_id, "sudo primed"),
            Ok(result) => warn!(
                trace_id = %self.trace_id,
                exit_code = ?result.exit_code,
                "sudo priming failed"
            ),
            Err(err) => warn!(trace_id = %self.trace_id, error = %err, "sudo priming failed"),
        }
    }

    fn execute(&self, command: &ShellCommand) -> Result<CommandResult, AppError> {
        let (program, flag) = shell_program();
        let args = [flag.to_string(), command.line.clone()];
        let payload = command.stdin_payload();
        run_process(
            program,
            &args,
            payload.as_deref(),
            command.cwd.as_deref(),
            &self.env,
            command.timeout.unwrap_or(self.default_timeout),
            &self.trace_id,
        )
    }
}

impl CommandRunner for ShellSession {
    fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
    }

    fn run(&mut self, command: &ShellCommand) -> Result<CommandResult, AppError> {
        if !self.primed && command.needs_sudo() {
            self.prime_sudo();
        }
        (self.sink)(&format!("running command: {}", command.line));
        let result = match self.execute(command) {
            Ok(result) => result,
            Err(err) => {
                (self.sink)(&format!("error: {}", err.error));
                return Err(err);
            }
        };
        if !result.stdout.is_empty() {
            (self.sink)("stdout: ");
            (self.sink)(&result.stdout);
        }
        if !result.stderr.is_empty() {
            (self.sink)("stderr: ");
            (self.sink)(&result.stderr);
        }
        Ok(result)
    }
}

fn shell_program() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd.exe", "/C")
    } else {
        ("sh", "-c")
    }
}

pub fn run_process(
    program: &str,
    args: &[String],
    input: Option<&str>,
    cwd: Option<&Path>,
    envs: &[(String, String)],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandResult, AppError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(envs.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    // Own process group, so a timeout can take down the shell's children too.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command.spawn().map_err(|err| {
        AppError::system(format!("Failed to spawn command: {err}"), trace_id)
    })?;

    // Drain stdout/stderr in parallel; otherwise, a chatty child process can block once the pipe
    // buffer fills, and we will incorrectly hit the timeout.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = drain(stdout);
    let stderr_handle = drain(stderr);

    let stdin_handle = match (input, child.stdin.take()) {
        (Some(payload), Some(mut stdin)) => {
            let payload = payload.as_bytes().to_vec();
            // Dropping stdin at the end of the thread closes the pipe.
            Some(std::thread::spawn(move || {
                let _ = stdin.write_all(&payload);
            }))
        }
        _ => None,
    };

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    kill_process_tree(&mut child);
                    // Drain threads are left detached: a grandchild that escaped the
                    // group may still hold the pipes open.
                    drop((stdout_handle, stderr_handle, stdin_handle));
                    return Err(AppError::timeout(
                        format!(
                            "Device unresponsive: command timed out after {}s",
                            timeout.as_secs()
                        ),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }
    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: killpg only sends a signal. The group id is our child's pid, which
            // leads the group created by `process_group(0)`.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::app::output::discard_sink;
    use crate::app::test_support::collecting_sink;
    use tempfile::TempDir;

    #[test]
    fn run_process_does_not_deadlock_on_large_stdout() {
        // Regression test: if stdout/stderr are piped but not drained, the child blocks once
        // the pipe buffer fills and an otherwise-fast command "hangs" until the timeout.
        let args = vec![
            "-c".to_string(),
            "i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done".to_string(),
        ];
        let output = run_process("sh", &args, None, None, &[], Duration::from_secs(10), "trace-large")
            .expect("expected large-output command to complete without timing out");

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[test]
    fn keeps_stdout_and_stderr_apart() {
        let mut session = ShellSession::new(discard_sink(), Duration::from_secs(5), None);
        let result = session
            .run(&ShellCommand::new(&["echo", "payload;", "echo", "noise", "1>&2"]))
            .expect("run");
        assert_eq!(result.stdout, "payload\n");
        assert_eq!(result.stderr, "noise\n");
    }

    #[test]
    fn feeds_scripted_input_with_trailing_newline() {
        let mut session = ShellSession::new(discard_sink(), Duration::from_secs(5), None);
        let command = ShellCommand::new(&["cat"]).with_input(&["password", "password", "y"]);
        let result = session.run(&command).expect("run");
        assert_eq!(result.stdout, "password\npassword\ny\n");
    }

    #[test]
    fn runs_in_requested_directory_without_touching_process_cwd() {
        let tmp = TempDir::new().expect("tmp");
        let before = std::env::current_dir().expect("cwd");
        let mut session = ShellSession::new(discard_sink(), Duration::from_secs(5), None);
        let result = session
            .run(&ShellCommand::new(&["pwd"]).in_dir(tmp.path()))
            .expect("run");
        let reported = PathBuf::from(result.stdout.trim());
        assert_eq!(
            reported.canonicalize().expect("canon"),
            tmp.path().canonicalize().expect("canon")
        );
        assert_eq!(std::env::current_dir().expect("cwd"), before);
    }

    #[test]
    fn missing_directory_is_a_spawn_failure() {
        let mut session = ShellSession::new(discard_sink(), Duration::from_secs(5), None);
        let err = session
            .run(&ShellCommand::new(&["true"]).in_dir("/this/path/should/not/exist"))
            .unwrap_err();
        assert_eq!(err.code, "ERR_SYSTEM");
    }

    #[test]
    fn hung_command_times_out_as_unresponsive() {
        let mut session = ShellSession::new(discard_sink(), Duration::from_secs(5), None);
        let command = ShellCommand::new(&["exec", "sleep", "5"]).with_timeout(Duration::from_millis(200));
        let err = session.run(&command).unwrap_err();
        assert_eq!(err.code, "ERR_TIMEOUT");
        assert!(err.error.to_lowercase().contains("unresponsive"));
    }

    fn assert_times_out_promptly(tokens: &[&str]) {
        let mut session = ShellSession::new(discard_sink(), Duration::from_secs(5), None);
        let command = ShellCommand::new(tokens).with_timeout(Duration::from_millis(200));
        let start = Instant::now();
        let err = session.run(&command).unwrap_err();
        assert_eq!(err.code, "ERR_TIMEOUT");
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "timeout took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn pipeline_that_hangs_is_cut_off_at_the_timeout() {
        assert_times_out_promptly(&["sleep", "5", "|", "cat"]);
    }

    #[test]
    fn compound_line_that_hangs_is_cut_off_at_the_timeout() {
        assert_times_out_promptly(&["sleep", "5;", "true"]);
    }

    #[test]
    fn timeout_kills_the_whole_process_group() {
        let tmp = TempDir::new().expect("tmp");
        let marker = tmp.path().join("late.txt");
        let mut session = ShellSession::new(discard_sink(), Duration::from_secs(5), None);
        let line = format!("sleep 1; touch '{}'", marker.display());
        let command = ShellCommand::new(&[line.as_str()]).with_timeout(Duration::from_millis(200));
        let err = session.run(&command).unwrap_err();
        assert_eq!(err.code, "ERR_TIMEOUT");
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "shell kept running after the timeout");
    }

    #[test]
    fn reports_echo_and_non_empty_streams_only() {
        let (sink, lines) = collecting_sink();
        let mut session = ShellSession::new(sink, Duration::from_secs(5), None);
        session.run(&ShellCommand::new(&["echo", "hi"])).expect("run");
        let lines = lines.lock().expect("lines").clone();
        assert_eq!(lines, vec!["running command: echo hi", "stdout: ", "hi\n"]);
    }

    #[test]
    fn sudo_priming_happens_at_most_once() {
        let mut session = ShellSession::new(discard_sink(), Duration::from_secs(5), None);
        assert!(!session.is_primed());
        session.run(&ShellCommand::new(&["echo", "plain"])).expect("run");
        assert!(!session.is_primed());
        // The token only has to mention sudo; echo keeps the test independent of the host.
        session.run(&ShellCommand::new(&["echo", "sudo"])).expect("run");
        assert!(session.is_primed());
    }

    #[test]
    fn primes_sudo_once_with_the_password_on_stdin() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tmp");
        let fake_sudo = tmp.path().join("sudo");
        std::fs::write(
            &fake_sudo,
            "#!/bin/sh\n\
             dir=\"$(dirname \"$0\")\"\n\
             if [ \"$1\" = \"-S\" ]; then shift; cat > \"$dir/stdin.bin\"; fi\n\
             printf 'call:%s\\n' \"$*\" >> \"$dir/calls.log\"\n\
             exec \"$@\"\n",
        )
        .expect("write");
        std::fs::set_permissions(&fake_sudo, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");
        let path = format!(
            "{}:{}",
            tmp.path().display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let mut session = ShellSession::new(
            discard_sink(),
            Duration::from_secs(5),
            Some("password".to_string()),
        )
        .with_env("PATH", path);

        let first = session
            .run(&ShellCommand::new(&["sudo", "echo", "first"]))
            .expect("first");
        session
            .run(&ShellCommand::new(&["sudo", "echo", "second"]))
            .expect("second");

        assert_eq!(first.stdout, "first\n");
        let calls = std::fs::read_to_string(tmp.path().join("calls.log")).expect("calls");
        assert_eq!(
            calls,
            "call:echo setting up sudo\ncall:echo first\ncall:echo second\n"
        );
        let stdin = std::fs::read_to_string(tmp.path().join("stdin.bin")).expect("stdin");
        assert_eq!(stdin, "password\n");
    }

    #[test]
    fn joins_tokens_and_skips_empty_ones() {
        let command = ShellCommand::new(&["adb", "", "-d", "shell", "'ip addr show'"]);
        assert_eq!(command.line, "adb -d shell 'ip addr show'");
    }
}
