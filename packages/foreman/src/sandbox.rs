//! Hermetic execution of a single action.
//!
//! Callers describe the sandbox declaratively — readable inputs, writable
//! temp and output paths, resource limits, environment — and this module
//! translates it to platform facilities:
//!
//! | Platform | Mechanism |
//! |---|---|
//! | Linux | `setrlimit` address-space/CPU caps; unshared env; cgroup-style kill on violation |
//! | macOS | `sandbox-exec` profile restricting writes to declared paths |
//! | Windows | plain process with cleared env (job-object limits not yet wired) |
//!
//! A watchdog enforces the timeout: on expiry the child gets SIGTERM, then
//! SIGKILL after the configured grace period. Memory is sampled on a fixed
//! interval via `sysinfo`; a violation kills the child and surfaces as a
//! `ResourceLimit` error result, which the scheduler treats as
//! non-retryable.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, instrument, trace, warn};

use crate::error::{EngineError, EngineResult};

/// Sampling interval for the resource monitor.
const MONITOR_INTERVAL: Duration = Duration::from_millis(200);

/// Resource ceilings for one action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_cores: Option<u32>,
    pub timeout: Duration,
    /// Cap on captured stdout+stderr.
    pub max_output_bytes: u64,
    /// How long after SIGTERM before SIGKILL.
    pub grace: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: None,
            max_cpu_cores: None,
            timeout: Duration::from_secs(600),
            max_output_bytes: 4 * 1024 * 1024,
            grace: Duration::from_secs(5),
        }
    }
}

/// Declarative description of one sandboxed execution.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Paths the action may read.
    pub input_paths: Vec<PathBuf>,
    /// Writable scratch space.
    pub temp_paths: Vec<PathBuf>,
    /// Writable paths collected as outputs on success.
    pub output_paths: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
    #[serde(skip, default)]
    pub limits: ResourceLimits,
}

/// What happened inside the sandbox.
#[derive(Clone, Debug)]
pub struct SandboxOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub peak_memory_bytes: u64,
    pub timed_out: bool,
}

/// Run `command` under `spec`.
///
/// Returns `Err` only for infrastructure failures (spawn, limit
/// violations, timeout); a non-zero exit from the command itself is a
/// normal `Ok` result that the caller classifies.
#[instrument(skip(spec), fields(argv0 = command.first().map(String::as_str).unwrap_or("")))]
pub async fn run(spec: &SandboxSpec, command: &[String]) -> EngineResult<SandboxOutput> {
    let Some((program, args)) = command.split_first() else {
        return Err(EngineError::internal("sandbox invoked with empty command"));
    };

    let mut cmd = platform_command(spec, program, args)?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .envs(&spec.env)
        .kill_on_drop(true);
    if let Some(workdir) = &spec.workdir {
        cmd.current_dir(workdir);
    }

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|err| EngineError::from_io(&err).frame(format!("spawning {program}")))?;
    let pid = child.id();
    trace!(?pid, "spawned sandboxed process");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_capped(stdout, spec.limits.max_output_bytes));
    let stderr_task = tokio::spawn(read_capped(stderr, spec.limits.max_output_bytes));

    // Watchdog: timeout and memory sampling in one loop.
    let mut peak_memory: u64 = 0;
    let mut timed_out = false;
    let mut memory_violation = false;
    let status = loop {
        let remaining = spec
            .limits
            .timeout
            .checked_sub(started.elapsed())
            .unwrap_or(Duration::ZERO);
        let tick = MONITOR_INTERVAL.min(remaining.max(Duration::from_millis(1)));
        match tokio::time::timeout(tick, child.wait()).await {
            Ok(Ok(status)) => break Some(status),
            Ok(Err(err)) => {
                return Err(EngineError::from_io(&err).frame("waiting for sandboxed process"));
            }
            Err(_elapsed) => {
                if let Some(pid) = pid {
                    let sampled = sample_memory(pid);
                    peak_memory = peak_memory.max(sampled);
                    if let Some(limit) = spec.limits.max_memory_bytes
                        && sampled > limit
                    {
                        warn!(sampled, limit, "memory limit exceeded");
                        memory_violation = true;
                        terminate(&mut child, pid, spec.limits.grace).await;
                        break None;
                    }
                }
                if started.elapsed() >= spec.limits.timeout {
                    warn!(timeout = ?spec.limits.timeout, "sandbox timeout expired");
                    timed_out = true;
                    if let Some(pid) = pid {
                        terminate(&mut child, pid, spec.limits.grace).await;
                    } else {
                        let _ = child.kill().await;
                    }
                    break None;
                }
            }
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let duration = started.elapsed();

    if memory_violation {
        return Err(EngineError::resource_limit(format!(
            "memory limit exceeded ({peak_memory} bytes sampled)"
        ))
        .frame(format!("running {program}")));
    }
    if timed_out {
        return Err(EngineError::resource_limit(format!(
            "timed out after {:?}",
            spec.limits.timeout
        ))
        .frame(format!("running {program}")));
    }

    let status = status
        .ok_or_else(|| EngineError::internal("sandbox exited watchdog without a status"))?;
    let exit_code = status.code().unwrap_or(-1);
    debug!(exit_code, ?duration, "sandboxed process finished");
    Ok(SandboxOutput {
        exit_code,
        stdout,
        stderr,
        duration,
        peak_memory_bytes: peak_memory,
        timed_out,
    })
}

/// Read a child stream, truncating at `cap` bytes.
async fn read_capped(
    stream: Option<impl tokio::io::AsyncRead + Unpin>,
    cap: u64,
) -> String {
    use tokio::io::AsyncReadExt as _;
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if (buffer.len() as u64) < cap {
                    let take = ((cap - buffer.len() as u64) as usize).min(n);
                    buffer.extend_from_slice(&chunk[..take]);
                }
                // Keep draining past the cap so the child never blocks on
                // a full pipe.
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child, pid: u32, grace: Duration) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }
    let _ = child.kill().await;
}

/// Current RSS of the process, in bytes. Zero when unavailable.
fn sample_memory(pid: u32) -> u64 {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    system.process(pid).map(|p| p.memory()).unwrap_or(0)
}

/// Translate the spec to a platform command.
#[cfg(target_os = "linux")]
fn platform_command(spec: &SandboxSpec, program: &str, args: &[String]) -> EngineResult<Command> {
    let mut cmd = Command::new(program);
    cmd.args(args);

    let memory = spec.limits.max_memory_bytes;
    let cpu_seconds = spec
        .limits
        .max_cpu_cores
        .map(|cores| u64::from(cores) * spec.limits.timeout.as_secs().max(1));
    unsafe {
        cmd.pre_exec(move || {
            if let Some(limit) = memory {
                let rlim = libc::rlimit {
                    rlim_cur: limit,
                    rlim_max: limit,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &rlim) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(limit) = cpu_seconds {
                let rlim = libc::rlimit {
                    rlim_cur: limit,
                    rlim_max: limit,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlim) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    Ok(cmd)
}

/// macOS: wrap in `sandbox-exec` with a profile allowing reads everywhere
/// and writes only to the declared temp and output paths.
#[cfg(target_os = "macos")]
fn platform_command(spec: &SandboxSpec, program: &str, args: &[String]) -> EngineResult<Command> {
    let mut profile = String::from("(version 1)\n(allow default)\n(deny file-write*)\n");
    for path in spec.temp_paths.iter().chain(&spec.output_paths) {
        profile.push_str(&format!(
            "(allow file-write* (subpath \"{}\"))\n",
            path.display()
        ));
    }
    profile.push_str("(allow file-write* (subpath \"/private/tmp\"))\n");
    let mut cmd = Command::new("sandbox-exec");
    cmd.arg("-p").arg(profile).arg(program).args(args);
    Ok(cmd)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn platform_command(_spec: &SandboxSpec, program: &str, args: &[String]) -> EngineResult<Command> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            env: BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            ..SandboxSpec::default()
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let output = run(&spec(), &sh("echo out; echo err >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn environment_is_cleared_except_declared() {
        let output = run(&spec(), &sh("echo \"probe=$FOREMAN_PROBE\""))
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "probe=");
    }

    #[tokio::test]
    async fn timeout_is_a_resource_limit_error() {
        let mut spec = spec();
        spec.limits.timeout = Duration::from_millis(200);
        spec.limits.grace = Duration::from_millis(50);
        let err = run(&spec, &sh("sleep 30")).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ResourceLimit);
    }

    #[tokio::test]
    async fn output_is_capped() {
        let mut spec = spec();
        spec.limits.max_output_bytes = 16;
        let output = run(&spec, &sh("yes x | head -c 100000")).await.unwrap();
        assert!(output.stdout.len() <= 16);
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn empty_command_is_internal_error() {
        let err = run(&spec(), &[]).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Internal);
    }
}
