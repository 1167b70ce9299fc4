//! Bounded subprocess execution.
//!
//! The command runner is the only place in the core that spawns processes.
//! Commands are shell strings executed in a caller-specified directory with
//! a hard timeout; stdout/stderr stream straight to log files and are never
//! buffered in memory. On timeout the whole process group receives SIGTERM
//! and the child is reaped (SIGKILL after a short grace period).
//!
//! Container mode wraps the same command in `docker run`, bind-mounting the
//! working directory at a fixed in-container path; docker's exit code is
//! propagated unchanged.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;

/// Exit code recorded when a command is killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Mount point for the working directory in container mode.
const CONTAINER_WORKDIR: &str = "/repo";

/// How long to wait after SIGTERM before escalating to SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// A single command to execute.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Shell command string. The runner does not parse or quote it.
    pub cmd: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandRequest {
    pub fn new(
        cmd: impl Into<String>,
        cwd: impl Into<PathBuf>,
        timeout: Duration,
        stdout_path: impl Into<PathBuf>,
        stderr_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: cwd.into(),
            timeout,
            stdout_path: stdout_path.into(),
            stderr_path: stderr_path.into(),
            env: Vec::new(),
        }
    }
}

/// Result of one command execution.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Container image selection for isolated execution.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
}

/// Executes shell commands, optionally inside a container.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    container: Option<ContainerSpec>,
}

impl CommandRunner {
    /// Runner that executes directly on the host.
    pub fn host() -> Self {
        Self { container: None }
    }

    /// Runner that wraps every command in `docker run <image>`.
    pub fn container(image: impl Into<String>) -> Self {
        Self {
            container: Some(ContainerSpec {
                image: image.into(),
            }),
        }
    }

    pub fn is_container(&self) -> bool {
        self.container.is_some()
    }

    /// Execute a command to completion or timeout.
    ///
    /// Never fails on a non-zero exit; the caller inspects the outcome. An
    /// `Err` means the process could not be spawned or its logs could not be
    /// opened.
    pub async fn run(&self, req: &CommandRequest) -> Result<CommandOutcome> {
        for log in [&req.stdout_path, &req.stderr_path] {
            if let Some(parent) = log.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
        }
        let stdout_file = std::fs::File::create(&req.stdout_path)
            .with_context(|| format!("create stdout log {}", req.stdout_path.display()))?;
        let stderr_file = std::fs::File::create(&req.stderr_path)
            .with_context(|| format!("create stderr log {}", req.stderr_path.display()))?;

        let mut cmd = self.build_command(req);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);

        // Put the child in its own process group so a timeout can signal the
        // whole tree, not just the immediate shell.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn command: {}", req.cmd))?;
        let pid = child.id();

        let (exit_code, timed_out) = match tokio::time::timeout(req.timeout, child.wait()).await {
            Ok(status) => {
                let status = status.context("wait for command")?;
                (status.code().unwrap_or(-1), false)
            }
            Err(_elapsed) => {
                tracing::warn!(cmd = %req.cmd, timeout_s = req.timeout.as_secs(), "command timed out, terminating");
                terminate_group(pid);
                // Reap: give the tree a grace period, then force-kill.
                match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                    }
                }
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        Ok(CommandOutcome {
            exit_code,
            elapsed_ms,
            stdout_bytes: file_len(&req.stdout_path),
            stderr_bytes: file_len(&req.stderr_path),
            stdout_path: req.stdout_path.clone(),
            stderr_path: req.stderr_path.clone(),
            timed_out,
        })
    }

    fn build_command(&self, req: &CommandRequest) -> Command {
        match &self.container {
            None => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(&req.cmd).current_dir(&req.cwd);
                for (k, v) in &req.env {
                    cmd.env(k, v);
                }
                cmd
            }
            Some(spec) => {
                let mount = format!("{}:{}", req.cwd.display(), CONTAINER_WORKDIR);
                let mut cmd = Command::new("docker");
                cmd.args(["run", "--rm", "-v", &mount, "-w", CONTAINER_WORKDIR]);
                for (k, v) in &req.env {
                    cmd.arg("-e").arg(format!("{k}={v}"));
                }
                cmd.arg(&spec.image).args(["/bin/sh", "-c", &req.cmd]);
                cmd
            }
        }
    }
}

#[cfg(unix)]
fn terminate_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // Negative pid targets the process group created at spawn.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: Option<u32>) {}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
