use std::io::{self, Write};
use std::mem;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sched::{CloneFlags, unshare};
use nix::sys::prctl;
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::{Pid, getpid, setsid};
use tokio_util::sync::CancellationToken;

use crate::error::{self, JudgeError};

use super::process_tree::{self, ProcessTree, RUN_MARKER};
use super::runner::read_capped;
use super::{ExecStatus, Execution, Limits, RunSpec, SandboxRunner, Usage};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// How long the output readers may lag behind the reaped program
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
const STDERR_LIMIT: usize = 64 << 10;
const OPEN_FILES: u64 = 64;
/// Address space is capped loosely; the resident-set watchdog enforces the
/// actual memory ceiling.
const ADDRESS_SPACE_HEADROOM_KB: u64 = 256 << 10;
/// Slack for tasks other workers start between counting and `exec`
const TASK_HEADROOM: u64 = 32;
const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A runner that confines programs with rlimits and process tracking
///
/// Every program runs in its own session with a cleared environment, capped
/// CPU time, address space, file size, descriptor and task count. The judge
/// becomes a child subreaper, so processes that leave the session are still
/// handed back to it, and every process of the run is killed when the run
/// ends. Memory is watched through `/proc` and `wait4`. It cannot hide the
/// host filesystem, and the network is only unshared when the judge runs
/// with enough privileges, so [`super::IsolateRunner`] should be preferred
/// wherever `isolate` exists.
pub struct ProcessRunner {
    id: u8,
}

impl ProcessRunner {
    pub fn build(id: u8) -> Self {
        if let Err(e) = prctl::set_child_subreaper(true) {
            log::warn!("ProcessRunner {id} could not become a child subreaper: {e}");
        }
        log::info!("ProcessRunner {id} initialized successfully");
        log::warn!(
            "ProcessRunner {id} provides no filesystem isolation - use only in trusted environments"
        );
        Self { id }
    }
}

impl SandboxRunner for ProcessRunner {
    fn name(&self) -> &'static str {
        "process"
    }

    fn execute(&self, spec: &RunSpec<'_>, cancel: &CancellationToken) -> error::Result<Execution> {
        let program = resolve_program(spec)?;
        let rlimits = RlimitPlan::new(spec.limits, process_tree::tasks_in_use());
        let marker = format!(
            "{}-{}",
            getpid(),
            RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        let mut cmd = Command::new(&program);
        cmd.args(&spec.argv[1..])
            .current_dir(spec.work_dir)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env(RUN_MARKER, &marker)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // SAFETY: the hook only issues async-signal-safe syscalls
        unsafe {
            cmd.pre_exec(move || rlimits.apply());
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            JudgeError::infra(format!("failed to spawn {}: {e}", program.display()))
        })?;
        let pid = Pid::from_raw(child.id() as libc::pid_t);
        log::debug!("ProcessRunner {} spawned pid {pid}", self.id);

        let io = ChildIo::attach(&mut child, spec.stdin.to_vec(), spec.limits.output_bytes);
        let mut tree = ProcessTree::new(pid, format!("{RUN_MARKER}={marker}"));
        let watched = watch(
            &mut tree,
            started + spec.limits.wall_time,
            spec.limits.memory_kb,
            cancel,
        );

        // Take down anything the program left behind before reaping it
        tree.kill_all();
        let (status, rusage) = reap(pid).map_err(JudgeError::infra)?;
        tree.reap_orphans();
        let elapsed = started.elapsed();
        let (stdout, stdout_truncated, stderr) = io.join(Instant::now() + DRAIN_TIMEOUT);

        let usage = Usage {
            time_ms: elapsed.as_millis() as u64,
            memory_kb: rusage.ru_maxrss.max(0) as u64,
        };

        let status = match watched.map_err(JudgeError::infra)? {
            Watch::Cancelled => return Ok(Execution::cancelled(usage)),
            Watch::TimedOut => ExecStatus::TimedOut,
            Watch::MemoryExceeded => ExecStatus::MemoryExceeded,
            Watch::Exited if usage.memory_kb > spec.limits.memory_kb => ExecStatus::MemoryExceeded,
            Watch::Exited => exit_status(status),
        };

        Ok(Execution {
            status,
            usage,
            stdout,
            stderr,
            stdout_truncated,
        })
    }
}

fn resolve_program(spec: &RunSpec<'_>) -> error::Result<PathBuf> {
    let first = spec
        .argv
        .first()
        .ok_or_else(|| JudgeError::infra("empty command"))?;

    let program = PathBuf::from(first);
    if program.is_relative() && first.contains('/') {
        Ok(spec.work_dir.join(program))
    } else {
        Ok(program)
    }
}

fn exit_status(status: libc::c_int) -> ExecStatus {
    if libc::WIFSIGNALED(status) {
        match libc::WTERMSIG(status) {
            libc::SIGXCPU => ExecStatus::TimedOut,
            signal => ExecStatus::Crashed {
                signal: Some(signal),
                exit_code: None,
            },
        }
    } else {
        match libc::WEXITSTATUS(status) {
            0 => ExecStatus::RanToCompletion { exit_code: 0 },
            code => ExecStatus::Crashed {
                signal: None,
                exit_code: Some(code),
            },
        }
    }
}

/// Limits applied in the child between `fork` and `exec`
#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    cpu_secs: u64,
    address_space_bytes: u64,
    file_size_bytes: u64,
    /// `RLIMIT_NPROC` counts every task of the user, not just the run's
    tasks: u64,
}

impl RlimitPlan {
    fn new(limits: &Limits, tasks_in_use: u64) -> Self {
        Self {
            cpu_secs: limits.wall_time.as_secs() + 1,
            address_space_bytes: (limits.memory_kb * 2 + ADDRESS_SPACE_HEADROOM_KB) * 1024,
            file_size_bytes: limits.file_size_kb * 1024,
            tasks: tasks_in_use + limits.processes as u64 + TASK_HEADROOM,
        }
    }

    fn apply(&self) -> io::Result<()> {
        setsid()?;
        // Only succeeds with CAP_SYS_ADMIN; otherwise the network stays shared
        let _ = unshare(CloneFlags::CLONE_NEWNET);

        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        setrlimit(
            Resource::RLIMIT_AS,
            self.address_space_bytes,
            self.address_space_bytes,
        )?;
        setrlimit(
            Resource::RLIMIT_FSIZE,
            self.file_size_bytes,
            self.file_size_bytes,
        )?;
        setrlimit(Resource::RLIMIT_NOFILE, OPEN_FILES, OPEN_FILES)?;
        setrlimit(Resource::RLIMIT_NPROC, self.tasks, self.tasks)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }
}

type Captured = io::Result<(Vec<u8>, bool)>;

/// Threads pumping the child's standard streams
struct ChildIo {
    stdin: Option<JoinHandle<()>>,
    stdout: Option<JoinHandle<Captured>>,
    stderr: Option<JoinHandle<Captured>>,
}

impl ChildIo {
    fn attach(child: &mut Child, input: Vec<u8>, output_limit: usize) -> Self {
        let stdin = child.stdin.take().map(|mut pipe| {
            thread::spawn(move || {
                // The program may exit without reading its input
                let _ = pipe.write_all(&input);
            })
        });
        let stdout = child
            .stdout
            .take()
            .map(|pipe| thread::spawn(move || read_capped(pipe, output_limit)));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| thread::spawn(move || read_capped(pipe, STDERR_LIMIT)));

        Self {
            stdin,
            stdout,
            stderr,
        }
    }

    /// Collects the output read so far. A reader still blocked at the
    /// deadline means some process outside the run holds the pipe, and it
    /// is abandoned with whatever it would have returned.
    fn join(self, deadline: Instant) -> (Vec<u8>, bool, Vec<u8>) {
        if let Some(handle) = self.stdin {
            let _ = join_until(handle, deadline, "stdin");
        }

        let collect = |handle: Option<JoinHandle<Captured>>, stream: &str| {
            handle
                .and_then(|h| join_until(h, deadline, stream))
                .and_then(|r| {
                    r.map_err(|e| log::warn!("Failed to read program {stream}: {e}"))
                        .ok()
                })
                .unwrap_or_default()
        };

        let (stdout, truncated) = collect(self.stdout, "stdout");
        let (stderr, _) = collect(self.stderr, "stderr");
        (stdout, truncated, stderr)
    }
}

fn join_until<T>(handle: JoinHandle<T>, deadline: Instant, stream: &str) -> Option<T> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("Abandoning {stream} pump, its pipe is still held open");
            return None;
        }
        thread::sleep(Duration::from_millis(1));
    }
    handle.join().ok()
}

enum Watch {
    Exited,
    TimedOut,
    MemoryExceeded,
    Cancelled,
}

/// Polls the run until its leader exits or a ceiling is hit, without
/// reaping the leader
fn watch(
    tree: &mut ProcessTree,
    deadline: Instant,
    memory_kb: u64,
    cancel: &CancellationToken,
) -> io::Result<Watch> {
    let leader = tree.leader();
    loop {
        if has_exited(leader)? {
            return Ok(Watch::Exited);
        }
        if cancel.is_cancelled() {
            return Ok(Watch::Cancelled);
        }
        if Instant::now() >= deadline {
            return Ok(Watch::TimedOut);
        }
        tree.refresh();
        if tree.resident_kb() > memory_kb {
            return Ok(Watch::MemoryExceeded);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn has_exited(pid: Pid) -> io::Result<bool> {
    let status = waitid(
        Id::Pid(pid),
        WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT,
    )?;
    Ok(!matches!(status, WaitStatus::StillAlive))
}

/// Reaps the leader with `wait4`, the only wait call that reports rusage
fn reap(pid: Pid) -> io::Result<(libc::c_int, libc::rusage)> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data; wait4 fills it in
    let mut usage: libc::rusage = unsafe { mem::zeroed() };

    loop {
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if rc == pid.as_raw() {
            return Ok((status, usage));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(wall_ms: u64) -> Limits {
        Limits {
            wall_time: Duration::from_millis(wall_ms),
            memory_kb: 256 << 10,
            output_bytes: 1 << 20,
            processes: 4,
            file_size_kb: 1024,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn run(script: &str, stdin: &[u8], limits: &Limits) -> Execution {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh(script);
        let spec = RunSpec {
            argv: &argv,
            work_dir: dir.path(),
            stdin,
            limits,
        };
        ProcessRunner::build(0)
            .execute(&spec, &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn test_echo_stdin() {
        let execution = run("cat", b"1 2 3\n", &limits(2000));
        assert_eq!(execution.status, ExecStatus::RanToCompletion { exit_code: 0 });
        assert_eq!(execution.stdout, b"1 2 3\n");
        assert!(!execution.stdout_truncated);
    }

    #[test]
    fn test_nonzero_exit_is_crash() {
        let execution = run("echo oops >&2; exit 3", b"", &limits(2000));
        assert_eq!(
            execution.status,
            ExecStatus::Crashed {
                signal: None,
                exit_code: Some(3)
            }
        );
        assert_eq!(execution.stderr, b"oops\n");
    }

    #[test]
    fn test_signal_is_crash() {
        let execution = run("kill -SEGV $$", b"", &limits(2000));
        assert_eq!(
            execution.status,
            ExecStatus::Crashed {
                signal: Some(libc::SIGSEGV),
                exit_code: None
            }
        );
    }

    #[test]
    fn test_sleep_times_out_within_ceiling() {
        let started = Instant::now();
        let execution = run("sleep 5", b"", &limits(500));
        assert_eq!(execution.status, ExecStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_output_is_truncated() {
        let mut limits = limits(5000);
        limits.output_bytes = 1000;
        let execution = run("head -c 100000 /dev/zero", b"", &limits);
        assert_eq!(execution.status, ExecStatus::RanToCompletion { exit_code: 0 });
        assert_eq!(execution.stdout.len(), 1000);
        assert!(execution.stdout_truncated);
    }

    #[test]
    fn test_background_processes_do_not_outlive_run() {
        let started = Instant::now();
        let execution = run("sleep 30 & echo done", b"", &limits(5000));
        assert_eq!(execution.status, ExecStatus::RanToCompletion { exit_code: 0 });
        assert_eq!(execution.stdout, b"done\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_detached_session_does_not_outlive_run() {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("setsid sh -c 'echo $$ > escaped.pid; exec sleep 30' & sleep 0.2; echo done");
        let limits = limits(1000);
        let spec = RunSpec {
            argv: &argv,
            work_dir: dir.path(),
            stdin: b"",
            limits: &limits,
        };

        let started = Instant::now();
        let execution = ProcessRunner::build(0)
            .execute(&spec, &CancellationToken::new())
            .unwrap();
        assert_eq!(execution.status, ExecStatus::RanToCompletion { exit_code: 0 });
        assert_eq!(execution.stdout, b"done\n");
        assert!(started.elapsed() < Duration::from_secs(3));

        let escaped = std::fs::read_to_string(dir.path().join("escaped.pid")).unwrap();
        let escaped = escaped.trim();
        assert!(!std::path::Path::new(&format!("/proc/{escaped}")).exists());
    }

    #[test]
    fn test_detached_writer_cannot_stall_run() {
        let started = Instant::now();
        let execution = run("setsid sleep 30 & echo done", b"", &limits(1000));
        assert_eq!(execution.status, ExecStatus::RanToCompletion { exit_code: 0 });
        assert_eq!(execution.stdout, b"done\n");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_task_limit_leaves_room_for_the_run() {
        let plan = RlimitPlan::new(&limits(1000), 100);
        assert_eq!(plan.tasks, 100 + 4 + TASK_HEADROOM);
        assert_eq!(plan.cpu_secs, 2);
    }

    #[test]
    fn test_environment_is_cleared() {
        // SAFETY: single assignment before the child is spawned
        unsafe { std::env::set_var("ARBITER_SECRET", "leak") };
        let execution = run("echo \"[$ARBITER_SECRET]\"", b"", &limits(2000));
        assert_eq!(execution.stdout, b"[]\n");

        let execution = run("env | grep -c ARBITER_RUN", b"", &limits(2000));
        assert_eq!(execution.stdout, b"1\n");
    }

    #[test]
    fn test_cancellation_kills_program() {
        let dir = tempfile::tempdir().unwrap();
        let argv = sh("sleep 30");
        let limits = limits(60_000);
        let spec = RunSpec {
            argv: &argv,
            work_dir: dir.path(),
            stdin: b"",
            limits: &limits,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let started = Instant::now();
        let execution = ProcessRunner::build(0).execute(&spec, &cancel).unwrap();
        assert_eq!(execution.status, ExecStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_program_is_infrastructure_fault() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["./does-not-exist".to_string()];
        let limits = limits(1000);
        let spec = RunSpec {
            argv: &argv,
            work_dir: dir.path(),
            stdin: b"",
            limits: &limits,
        };
        let result = ProcessRunner::build(0).execute(&spec, &CancellationToken::new());
        assert!(matches!(result, Err(JudgeError::Infrastructure(_))));
    }
}
