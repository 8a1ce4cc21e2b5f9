//! Sandboxed command execution: allow-listed binaries, scrubbed environment,
//! bounded timeout, no shell interpolation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::path_validator::PathValidator;

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const MAX_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_OUTPUT_CAP_BYTES: usize = 10 * 1024 * 1024;
/// How long a child gets to exit after SIGTERM before it is SIGKILLed.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_ALLOWED_COMMANDS: &[&str] =
    &["git", "bundle", "npm", "yarn", "pnpm", "bin/rails", "rails"];

/// Environment variable name prefixes never forwarded to a spawned child, even
/// when present in the caller-supplied overlay.
const SCRUBBED_PREFIXES: &[&str] = &["LD_", "DYLD_"];

/// Environment variable keys a rule's `env` overlay may never override, because
/// doing so would change which binary `PATH` resolution actually runs.
const PROTECTED_ENV_KEYS: &[&str] = &["PATH"];

/// A shareable flag that lets a caller request early termination of a running
/// command. Cloning shares the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone)]
enum StopReason {
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub working_directory: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub output_cap_bytes: usize,
    pub cancel: Option<CancelToken>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            working_directory: None,
            env: HashMap::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
            cancel: None,
        }
    }
}

/// The Executor returns a record, not a tuple, so additional fields can be added
/// without breaking callers.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub success: bool,
    pub truncated: bool,
}

pub struct CommandExecutor {
    allowed: Vec<String>,
    session_root: PathBuf,
    path_validator: PathValidator,
}

impl CommandExecutor {
    #[must_use]
    pub fn new(session_root: PathBuf, extra_allowed: Vec<String>) -> Self {
        let mut allowed: Vec<String> =
            DEFAULT_ALLOWED_COMMANDS.iter().map(|s| (*s).to_string()).collect();
        allowed.extend(extra_allowed);
        Self {
            allowed,
            session_root,
            path_validator: PathValidator::default(),
        }
    }

    fn is_allowed(&self, program: &str) -> bool {
        let basename = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string());
        self.allowed.iter().any(|a| a == program || a == &basename)
    }

    fn scrub_env() -> HashMap<String, String> {
        std::env::vars()
            .filter(|(k, _)| !SCRUBBED_PREFIXES.iter().any(|p| k.starts_with(p)))
            .collect()
    }

    /// Merge a rule's `env` overlay on top of the scrubbed parent environment,
    /// dropping any key that would change binary resolution (`PATH`).
    fn merge_env(overlay: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env = Self::scrub_env();
        for (key, value) in overlay {
            if PROTECTED_ENV_KEYS.iter().any(|p| p.eq_ignore_ascii_case(key)) {
                continue;
            }
            env.insert(key.clone(), value.clone());
        }
        env
    }

    fn send_signal(pid: Option<u32>, sig: Signal) {
        if let Some(pid) = pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), sig);
        }
    }

    fn finish(
        result: Result<(Vec<u8>, Vec<u8>, std::process::ExitStatus)>,
        start: Instant,
        cap: usize,
    ) -> Result<ExecResult> {
        let (mut stdout, mut stderr, status) = result?;
        let truncated = stdout.len() > cap || stderr.len() > cap;
        stdout.truncate(cap);
        stderr.truncate(cap);
        Ok(ExecResult {
            stdout,
            stderr,
            exit_code: status.code(),
            duration: start.elapsed(),
            success: status.success(),
            truncated,
        })
    }

    /// Spawn `argv[0]` with `argv[1..]`, enforcing the allow-list, timeout, and
    /// working-directory confinement. Never raises on nonzero exit — the caller
    /// inspects `ExecResult::success`. On timeout, or if `opts.cancel` fires
    /// first, the child is sent `SIGTERM`, given a grace window to exit, and
    /// `SIGKILL`ed if it hasn't.
    pub async fn execute(&self, argv: &[String], opts: ExecOptions) -> Result<ExecResult> {
        let program = argv.first().ok_or_else(|| Error::Validation {
            message: "argv must be non-empty".into(),
        })?;

        if !self.is_allowed(program) {
            return Err(Error::CommandNotAllowed {
                program: program.clone(),
            });
        }

        let timeout_duration = if opts.timeout > Duration::from_secs(MAX_TIMEOUT_SECS) {
            Duration::from_secs(MAX_TIMEOUT_SECS)
        } else {
            opts.timeout
        };

        let work_dir = match &opts.working_directory {
            Some(rel) => self.path_validator.validate(&self.session_root, rel)?,
            None => self.session_root.clone(),
        };

        let env = Self::merge_env(&opts.env);

        let mut command = TokioCommand::new(program);
        command
            .args(&argv[1..])
            .current_dir(&work_dir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(?argv, dir = %work_dir.display(), "spawning command");

        let start = Instant::now();
        let mut child = command.spawn().map_err(Error::Io)?;
        let pid = child.id();

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let cap = opts.output_cap_bytes;

        let run = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut pipe) = stdout_pipe.take() {
                let _ = pipe.read_to_end(&mut stdout).await;
            }
            if let Some(mut pipe) = stderr_pipe.take() {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            let status = child.wait().await.map_err(Error::Io)?;
            Ok::<_, Error>((stdout, stderr, status))
        };
        tokio::pin!(run);

        let cancel_wait = async {
            match &opts.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(cancel_wait);

        let stop_reason = tokio::select! {
            result = &mut run => return Self::finish(result, start, cap),
            () = tokio::time::sleep(timeout_duration) => StopReason::Timeout,
            () = &mut cancel_wait => StopReason::Cancelled,
        };

        warn!(?argv, ?stop_reason, "terminating command");
        Self::send_signal(pid, Signal::SIGTERM);
        if timeout(TERMINATION_GRACE, &mut run).await.is_err() {
            Self::send_signal(pid, Signal::SIGKILL);
            let _ = timeout(Duration::from_secs(1), run).await;
        }

        match stop_reason {
            StopReason::Timeout => Err(Error::Timeout {
                argv: argv.to_vec(),
                timeout_secs: timeout_duration.as_secs(),
            }),
            StopReason::Cancelled => Err(Error::Cancelled { argv: argv.to_vec() }),
        }
    }
}

/// Write bytes to a child's stdin, used by rules that pipe input (e.g. templated
/// setup scripts). Kept separate from `execute` since most commands need no stdin.
pub async fn write_stdin(stdin: &mut tokio::process::ChildStdin, data: &[u8]) -> Result<()> {
    stdin.write_all(data).await.map_err(Error::Io)
}
