//! Command executor - runs resolved instructions as deadline-bound subprocesses
//!
//! A failing command is a result, not an error: non-zero exits and expired
//! deadlines come back as an [`ExecutionResult`] with `success == false`.
//! Only malformed or deny-listed instructions and spawn failures are errors.
//!
//! The deny-list is a best-effort safety net against obviously destructive
//! instructions. It is not a sandbox and does not sanitize shell input.

use super::catalog::{Instruction, Step};
use crate::error::AgentError;
use deskctl_shared::now_ms;
use serde::{Serialize, Serializer};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Substrings that are never executed, compared on lower-cased,
/// whitespace-collapsed instruction text
const DENY_LIST: &[&str] = &[
    "mkfs",
    "> /dev/sd",
    ":(){",
    "format c:",
    "del /f /s /q c:\\",
    "rd /s /q c:\\",
    "diskpart",
];

/// Device nodes `dd` may still write to
const DD_SAFE_TARGETS: &[&str] = &["of=/dev/null", "of=/dev/stdout", "of=/dev/stderr"];

/// How long output is still collected once the child has exited. Anything
/// the child left running in the background may keep the pipes open.
const OUTPUT_GRACE: Duration = Duration::from_millis(200);

/// Why an execution did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NonZeroExit,
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::Timeout => "timeout",
        }
    }
}

fn serialize_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Outcome of one execution
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    /// stdout followed by stderr, lossily decoded and trimmed at the end.
    /// Step sequences join the output of each step with a newline.
    pub output: String,
    /// Empty on success
    pub error: String,
    /// `-1` when the process was killed or never produced a status
    pub exit_code: i32,
    #[serde(rename = "durationMs", serialize_with = "serialize_ms")]
    pub duration: Duration,
    /// Unix epoch milliseconds at which execution started
    pub executed_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Number of steps that ran (1 for single instructions)
    pub steps_run: usize,
}

impl ExecutionResult {
    pub fn timed_out(&self) -> bool {
        self.failure == Some(FailureKind::Timeout)
    }
}

/// Outcome of one subprocess
struct ProcessOutcome {
    output: String,
    exit_code: i32,
    timed_out: bool,
}

/// Runs instructions through the platform shell host
pub struct CommandExecutor {
    deny_list: Vec<String>,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    /// Create an executor with the built-in deny-list
    pub fn new() -> Self {
        Self {
            deny_list: DENY_LIST.iter().map(|p| normalize(p)).collect(),
        }
    }

    /// Reject empty or deny-listed instruction text
    pub fn check_text(&self, text: &str) -> Result<(), AgentError> {
        if text.trim().is_empty() {
            return Err(AgentError::InvalidInstruction("empty instruction".into()));
        }
        let normalized = normalize(text);
        if let Some(pattern) = self.deny_list.iter().find(|p| normalized.contains(p.as_str())) {
            return Err(AgentError::InstructionRejected(pattern.clone()));
        }
        for segment in text.split(|c| matches!(c, ';' | '&' | '|' | '\n')) {
            let words: Vec<String> = segment
                .split_whitespace()
                .map(|w| w.trim_matches(|c| c == '\'' || c == '"').to_lowercase())
                .collect();
            if let Some(rule) = destructive_invocation(&words) {
                return Err(AgentError::InstructionRejected(rule.to_string()));
            }
        }
        Ok(())
    }

    /// Validate every executable part of an instruction before anything runs
    pub fn check_instruction(&self, instruction: &Instruction) -> Result<(), AgentError> {
        match instruction {
            Instruction::Shell(text) => self.check_text(text),
            Instruction::Steps(steps) => {
                if steps.is_empty() {
                    return Err(AgentError::InvalidInstruction("empty step sequence".into()));
                }
                steps.iter().try_for_each(|step| match step {
                    Step::Shell(text) | Step::Script(text) => self.check_text(text),
                    Step::Delay(_) => Ok(()),
                })
            }
        }
    }

    /// Execute an instruction bound by `deadline`
    pub async fn execute(
        &self,
        instruction: &Instruction,
        deadline: Duration,
    ) -> Result<ExecutionResult, AgentError> {
        self.check_instruction(instruction)?;

        let executed_at = now_ms();
        let start = Instant::now();
        let deadline_at = start + deadline;

        let (outcome, steps_run) = match instruction {
            Instruction::Shell(text) => (run_process(shell_command(text), deadline_at).await?, 1),
            Instruction::Steps(steps) => run_steps(steps, deadline_at).await?,
        };

        let duration = start.elapsed();
        let (success, failure, error) = if outcome.timed_out {
            (
                false,
                Some(FailureKind::Timeout),
                AgentError::ExecutionTimeout(deadline).to_string(),
            )
        } else if outcome.exit_code != 0 {
            (
                false,
                Some(FailureKind::NonZeroExit),
                AgentError::ExecutionFailed(outcome.exit_code).to_string(),
            )
        } else {
            (true, None, String::new())
        };

        Ok(ExecutionResult {
            success,
            output: outcome.output,
            error,
            exit_code: outcome.exit_code,
            duration,
            executed_at,
            failure,
            steps_run,
        })
    }
}

/// Run steps strictly in order, stopping at the first failure
async fn run_steps(
    steps: &[Step],
    deadline_at: Instant,
) -> Result<(ProcessOutcome, usize), AgentError> {
    let mut outputs = Vec::new();
    let mut steps_run = 0;
    let mut last_exit = 0;

    for step in steps {
        steps_run += 1;
        let outcome = match step {
            Step::Delay(delay) => {
                let wake = Instant::now() + *delay;
                if wake > deadline_at {
                    tokio::time::sleep_until(deadline_at).await;
                    ProcessOutcome {
                        output: String::new(),
                        exit_code: -1,
                        timed_out: true,
                    }
                } else {
                    tokio::time::sleep_until(wake).await;
                    continue;
                }
            }
            Step::Shell(text) => run_process(shell_command(text), deadline_at).await?,
            Step::Script(text) => run_process(script_command(text), deadline_at).await?,
        };

        if !outcome.output.is_empty() {
            outputs.push(outcome.output);
        }
        last_exit = outcome.exit_code;

        if outcome.timed_out || outcome.exit_code != 0 {
            debug!(step = steps_run, total = steps.len(), "step failed, aborting sequence");
            return Ok((
                ProcessOutcome {
                    output: outputs.join("\n"),
                    exit_code: outcome.exit_code,
                    timed_out: outcome.timed_out,
                },
                steps_run,
            ));
        }
    }

    Ok((
        ProcessOutcome {
            output: outputs.join("\n"),
            exit_code: last_exit,
            timed_out: false,
        },
        steps_run,
    ))
}

/// Rule name when `words` (one shell command, lower-cased) wipes the root
/// filesystem or writes to a raw device with `dd`
fn destructive_invocation(words: &[String]) -> Option<&'static str> {
    let is = |word: &str, program: &str| word == program || word.ends_with(&format!("/{program}"));

    for (i, word) in words.iter().enumerate() {
        let rest = &words[i + 1..];
        if is(word.as_str(), "rm") {
            let recursive = rest.iter().any(|w| {
                w == "--recursive" || (w.starts_with('-') && !w.starts_with("--") && w.contains('r'))
            });
            let targets_root = rest
                .iter()
                .filter(|w| !w.starts_with('-'))
                .any(|w| w == "/" || w == "/*");
            if recursive && targets_root {
                return Some("rm -rf /");
            }
        }
        if is(word.as_str(), "dd")
            && rest
                .iter()
                .any(|w| w.starts_with("of=/dev/") && !DD_SAFE_TARGETS.contains(&w.as_str()))
        {
            return Some("dd of=/dev/");
        }
    }
    None
}

/// Spawn `cmd` and wait for it until `deadline_at`, killing it on expiry
///
/// Completion follows the child's exit, not the end of its output.
async fn run_process(mut cmd: Command, deadline_at: Instant) -> Result<ProcessOutcome, AgentError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    isolate(&mut cmd);

    let mut child = cmd
        .spawn()
        .map_err(|e| AgentError::SpawnFailed(e.to_string()))?;

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let waited = {
        let readers = async {
            tokio::join!(
                read_into(stdout_handle, &mut stdout),
                read_into(stderr_handle, &mut stderr),
            );
        };
        tokio::pin!(readers);
        let mut readers_done = false;

        let waited = loop {
            tokio::select! {
                status = child.wait() => break Some(status),
                () = &mut readers, if !readers_done => readers_done = true,
                () = tokio::time::sleep_until(deadline_at) => break None,
            }
        };

        if waited.is_some()
            && !readers_done
            && tokio::time::timeout(OUTPUT_GRACE, &mut readers).await.is_err()
        {
            debug!("process exited with its output still open, keeping what was read");
        }
        waited
    };

    match waited {
        Some(Ok(status)) => Ok(ProcessOutcome {
            output: combine_output(&stdout, &stderr),
            exit_code: status.code().unwrap_or(-1),
            timed_out: false,
        }),
        Some(Err(e)) => Err(AgentError::SpawnFailed(format!("waiting for process: {e}"))),
        None => {
            terminate(&mut child).await;
            Ok(ProcessOutcome {
                output: combine_output(&stdout, &stderr),
                exit_code: -1,
                timed_out: true,
            })
        }
    }
}

/// Append everything `handle` yields to `buf` until EOF or a read error
async fn read_into<R: AsyncRead + Unpin>(handle: Option<R>, buf: &mut Vec<u8>) {
    let Some(mut handle) = handle else {
        return;
    };
    let mut chunk = [0u8; 4096];
    loop {
        match handle.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Give the child its own process group so a timeout can kill its descendants
#[cfg(unix)]
fn isolate(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_group(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain syscall on the process group created for this child.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

/// Kill the child and everything it started, then reap it
async fn terminate(child: &mut Child) {
    kill_group(child);
    if let Err(e) = child.kill().await {
        warn!("failed to kill timed out process: {}", e);
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    combined.trim_end().to_string()
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Build the shell host invocation for an opaque instruction string
fn shell_command(instruction: &str) -> Command {
    if cfg!(windows) {
        match unwrap_powershell(instruction) {
            Some(script) => powershell(&script),
            None => {
                let mut cmd = Command::new("cmd");
                cmd.args(["/C", instruction]);
                cmd
            }
        }
    } else {
        posix_shell(instruction)
    }
}

/// Build the script host invocation for a `script` step
fn script_command(script: &str) -> Command {
    if cfg!(windows) {
        powershell(script)
    } else {
        posix_shell(script)
    }
}

fn posix_shell(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", script]);
    cmd
}

fn powershell(script: &str) -> Command {
    let mut cmd = Command::new("powershell");
    cmd.args(["-NoProfile", "-NonInteractive", "-Command", script]);
    cmd
}

/// Extract the script from a PowerShell-prefixed instruction.
///
/// Recognises `powershell`/`pwsh` (with or without `.exe`), skips switches,
/// and takes everything after `-Command`/`-c` (or after the last switch) as
/// the script, stripping one pair of enclosing quotes. This is a heuristic:
/// nested or escaped quoting is not parsed. Returns `None` when the
/// instruction is not PowerShell-prefixed or carries no script.
pub fn unwrap_powershell(instruction: &str) -> Option<String> {
    let trimmed = instruction.trim();
    let (host, mut rest) = match trimmed.split_once(char::is_whitespace) {
        Some((host, rest)) => (host, rest.trim_start()),
        None => (trimmed, ""),
    };
    let host = host.trim_matches('"').to_ascii_lowercase();
    let host = host.rsplit(['\\', '/']).next().unwrap_or(&host);
    if !matches!(host, "powershell" | "powershell.exe" | "pwsh" | "pwsh.exe") {
        return None;
    }

    while rest.starts_with('-') {
        let (flag, after) = match rest.split_once(char::is_whitespace) {
            Some((flag, after)) => (flag, after.trim_start()),
            None => (rest, ""),
        };
        let flag = flag.to_ascii_lowercase();
        match flag.as_str() {
            "-command" | "-c" => {
                rest = after;
                break;
            }
            // Switches that take a value
            "-executionpolicy" | "-ep" | "-windowstyle" | "-w" => {
                rest = after
                    .split_once(char::is_whitespace)
                    .map(|(_, r)| r.trim_start())
                    .unwrap_or("");
            }
            _ => rest = after,
        }
    }

    let script = strip_quotes(rest.trim());
    if script.is_empty() {
        None
    } else {
        Some(script.to_string())
    }
}

fn strip_quotes(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_powershell() {
        assert_eq!(
            unwrap_powershell("powershell -Command \"Get-Date\"").as_deref(),
            Some("Get-Date")
        );
        assert_eq!(
            unwrap_powershell("PowerShell.exe -NoProfile -ExecutionPolicy Bypass -c 'Stop-Process -Name x'")
                .as_deref(),
            Some("Stop-Process -Name x")
        );
        assert_eq!(
            unwrap_powershell("pwsh (New-Object -ComObject WScript.Shell).SendKeys([char]173)").as_deref(),
            Some("(New-Object -ComObject WScript.Shell).SendKeys([char]173)")
        );
        assert_eq!(
            unwrap_powershell(r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe -c Get-Date")
                .as_deref(),
            Some("Get-Date")
        );
        assert_eq!(unwrap_powershell("powershell -NoProfile"), None);
        assert_eq!(unwrap_powershell("shutdown /s /t 0"), None);
        assert_eq!(unwrap_powershell("powershellish -c x"), None);
    }

    #[test]
    fn test_deny_list() {
        let executor = CommandExecutor::new();
        assert!(matches!(
            executor.check_text("sudo  RM  -rf   /"),
            Err(AgentError::InstructionRejected(_))
        ));
        assert!(executor.check_text("mkfs.ext4 /dev/sdb1").is_err());
        assert!(executor.check_text("FORMAT C: /q").is_err());
        assert!(matches!(
            executor.check_text("   "),
            Err(AgentError::InvalidInstruction(_))
        ));
        assert!(executor.check_text("rm -rf ./build").is_ok());
        assert!(executor.check_text("loginctl lock-session").is_ok());
    }

    #[test]
    fn test_root_delete_is_anchored_to_root() {
        let executor = CommandExecutor::new();
        for text in [
            "rm -rf /",
            "rm -rf /*",
            "rm -fr /",
            "/bin/rm -r -f /",
            "rm -rf --no-preserve-root /",
            "echo bye; rm -rf '/'",
        ] {
            assert!(
                matches!(executor.check_text(text), Err(AgentError::InstructionRejected(_))),
                "{text} was allowed"
            );
        }

        assert!(executor.check_text("rm -rf /tmp/cache").is_ok());
        assert!(executor.check_text("rm -f /tmp/lock").is_ok());
        assert!(executor.check_text("rm -rf /tmp/cache; ls /").is_ok());
    }

    #[test]
    fn test_dd_to_a_device_is_rejected() {
        let executor = CommandExecutor::new();
        for text in [
            "dd if=/dev/urandom of=/dev/sda",
            "dd if=image.iso of=/dev/sdb bs=4M",
            "sudo dd if=/dev/zero of=/dev/nvme0n1",
        ] {
            assert!(
                matches!(executor.check_text(text), Err(AgentError::InstructionRejected(_))),
                "{text} was allowed"
            );
        }

        assert!(executor.check_text("dd if=/dev/zero of=/dev/null count=1").is_ok());
        assert!(executor.check_text("dd if=/dev/urandom of=./noise.bin count=1").is_ok());
    }

    #[tokio::test]
    async fn test_rejected_step_prevents_whole_sequence() {
        let executor = CommandExecutor::new();
        let instruction = Instruction::Steps(vec![
            Step::Shell("echo safe".into()),
            Step::Shell("rm -rf /".into()),
        ]);
        let result = executor.execute(&instruction, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(AgentError::InstructionRejected(_))));
    }

    #[test]
    fn test_combine_output() {
        assert_eq!(combine_output(b"out\n", b"err\n"), "out\nerr");
        assert_eq!(combine_output(b"out", b""), "out");
        assert_eq!(combine_output(b"", b"err"), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_command() {
        let executor = CommandExecutor::new();
        let result = executor
            .execute(&Instruction::Shell("echo hello".into()), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "hello");
        assert!(result.error.is_empty());
        assert!(result.executed_at > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_a_result() {
        let executor = CommandExecutor::new();
        let result = executor
            .execute(
                &Instruction::Shell("echo oops >&2; exit 3".into()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.failure, Some(FailureKind::NonZeroExit));
        assert_eq!(result.output, "oops");
        assert_eq!(result.error, "command exited with status 3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let instruction = Instruction::Shell(format!(
            "echo $$ > {}; sleep 5",
            pid_file.display()
        ));

        let executor = CommandExecutor::new();
        let started = std::time::Instant::now();
        let result = executor
            .execute(&instruction, Duration::from_millis(300))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!result.success);
        assert!(result.timed_out());
        assert_eq!(result.exit_code, -1);
        assert!(result.error.contains("timed out"));

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // Signal 0 only checks for existence
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "timed out process {pid} still running");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_backgrounded_child_does_not_hold_result() {
        let executor = CommandExecutor::new();
        let started = std::time::Instant::now();
        let result = executor
            .execute(
                &Instruction::Shell("sleep 3 & echo launched".into()),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "launched");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let executor = CommandExecutor::new();
        let result = executor
            .execute(
                &Instruction::Shell("echo started; sleep 5".into()),
                Duration::from_millis(300),
            )
            .await
            .unwrap();

        assert!(result.timed_out());
        assert_eq!(result.output, "started");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sequence_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("third-step-ran");
        let instruction = Instruction::Steps(vec![
            Step::Shell("echo first".into()),
            Step::Shell("exit 2".into()),
            Step::Shell(format!("touch {}", marker.display())),
        ]);

        let executor = CommandExecutor::new();
        let result = executor
            .execute(&instruction, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.steps_run, 2);
        assert_eq!(result.output, "first");
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sequence_runs_in_order_with_delay() {
        let instruction = Instruction::Steps(vec![
            Step::Shell("echo one".into()),
            Step::Delay(Duration::from_millis(50)),
            Step::Script("echo two".into()),
        ]);

        let executor = CommandExecutor::new();
        let result = executor
            .execute(&instruction, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.steps_run, 3);
        assert_eq!(result.output, "one\ntwo");
        assert!(result.duration >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_delay_beyond_deadline_times_out() {
        let instruction = Instruction::Steps(vec![Step::Delay(Duration::from_secs(10))]);
        let executor = CommandExecutor::new();
        let result = executor
            .execute(&instruction, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(result.timed_out());
        assert_eq!(result.steps_run, 1);
    }
}
