use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use tokio_util::sync::CancellationToken;

use crate::error::{self, JudgeError};

use super::runner::read_capped;
use super::{ExecStatus, Execution, RunSpec, SandboxRunner, Usage};

const OPEN_FILES: u32 = 64;
const STDERR_LIMIT: usize = 64 << 10;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

// Sandbox cache directory permissions
const CACHE_DIR_PERMISSIONS: u32 = 0o700;

/// Mount point of the scratch directory inside the box
const BOX_SCRATCH: &str = "/scratch";
const STDIN_FILE: &str = ".isolate.in";
const STDOUT_FILE: &str = ".isolate.out";
const STDERR_FILE: &str = ".isolate.err";

/// A sandbox for executing untrusted programs using isolate
///
/// Each runner owns one isolate box, selected by its id, and must not be
/// shared between concurrent executions. The submission's scratch directory
/// is bound read-write into the box, so compiler output stays visible to the
/// test runs that follow.
pub struct IsolateRunner {
    /// Box id passed to isolate
    id: u8,
    /// Holds the meta files isolate writes on the host side
    cache_dir: PathBuf,
}

impl IsolateRunner {
    pub fn build(id: u8) -> anyhow::Result<Self> {
        let cache_dir = Self::setup_cache_directory(id)?;
        let runner = Self { id, cache_dir };
        runner.reinit()?;

        log::info!("IsolateRunner {id} initialized successfully");
        Ok(runner)
    }

    /// Sets up the cache directory for the sandbox
    fn setup_cache_directory(id: u8) -> anyhow::Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "arbiter")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        let cache_base_dir = proj_dirs.cache_dir().join("isolate");
        fs::create_dir_all(&cache_base_dir)?;
        fs::set_permissions(
            &cache_base_dir,
            fs::Permissions::from_mode(CACHE_DIR_PERMISSIONS),
        )?;

        let cache_dir = cache_base_dir.join(id.to_string());
        fs::create_dir_all(&cache_dir)?;

        Ok(cache_dir)
    }

    /// Cleans the box and sets it up again, killing anything left inside
    fn reinit(&self) -> anyhow::Result<()> {
        let _ = Command::new("isolate")
            .args(["-b", &self.id.to_string(), "--cg", "--cleanup"])
            .output();

        let output = Command::new("isolate")
            .args(["-b", &self.id.to_string(), "--cg", "--init"])
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate --init: {}", e))?;

        if !output.status.success() {
            bail!(
                "isolate --init exited with non-zero status; stderr={}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        log::debug!("IsolateRunner {} reinitialized", self.id);
        Ok(())
    }

    fn run_args(&self, spec: &RunSpec<'_>, meta_path: &Path) -> Vec<String> {
        let limits = spec.limits;
        let wall_secs = limits.wall_time.as_secs_f64();

        let mut args = vec![
            "-b".to_string(),
            self.id.to_string(),
            "--cg".to_string(),
            "--run".to_string(),
            format!("--time={wall_secs:.3}"),
            format!("--wall-time={wall_secs:.3}"),
            "--extra-time=0".to_string(),
            format!("--cg-mem={}", limits.memory_kb),
            format!("--processes={}", limits.processes),
            format!("--open-files={OPEN_FILES}"),
            format!("--fsize={}", limits.file_size_kb),
            format!("--dir={BOX_SCRATCH}={}:rw", spec.work_dir.display()),
            format!("--chdir={BOX_SCRATCH}"),
        ];
        if Path::new("/etc/alternatives").exists() {
            args.push("--dir=/etc/alternatives".to_string());
        }
        args.extend([
            "-E".to_string(),
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "-M".to_string(),
            meta_path.to_string_lossy().into_owned(),
            "-i".to_string(),
            STDIN_FILE.to_string(),
            "-o".to_string(),
            STDOUT_FILE.to_string(),
            "-r".to_string(),
            STDERR_FILE.to_string(),
            "--silent".to_string(),
            "--".to_string(),
        ]);
        args.extend(spec.argv.iter().cloned());
        args
    }

    /// Runs isolate, returning `false` when cancelled before it finished
    fn run_box(&self, args: &[String], cancel: &CancellationToken) -> error::Result<bool> {
        let mut child = Command::new("isolate")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| JudgeError::infra(format!("failed to spawn isolate: {e}")))?;

        loop {
            if child.try_wait()?.is_some() {
                return Ok(true);
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                // isolate's keeper is gone; the cgroup still has to be emptied
                self.reinit().map_err(JudgeError::infra)?;
                return Ok(false);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl SandboxRunner for IsolateRunner {
    fn name(&self) -> &'static str {
        "isolate"
    }

    fn prepare_scratch(&self, dir: &Path) -> error::Result<()> {
        // The box runs as an unprivileged uid
        fs::set_permissions(dir, fs::Permissions::from_mode(0o777))?;
        Ok(())
    }

    fn execute(&self, spec: &RunSpec<'_>, cancel: &CancellationToken) -> error::Result<Execution> {
        fs::write(spec.work_dir.join(STDIN_FILE), spec.stdin)?;
        let meta_path = self.cache_dir.join("run.meta");
        let _ = fs::remove_file(&meta_path);

        let started = Instant::now();
        let finished = self.run_box(&self.run_args(spec, &meta_path), cancel)?;
        if !finished {
            let usage = Usage {
                time_ms: started.elapsed().as_millis() as u64,
                memory_kb: 0,
            };
            return Ok(Execution::cancelled(usage));
        }

        let meta = fs::read_to_string(&meta_path)
            .map_err(|e| JudgeError::infra(format!("failed to read isolate meta file: {e}")))?;
        let meta = Meta::parse(&meta);
        let status = meta.status(spec.limits.memory_kb)?;

        let (stdout, stdout_truncated) =
            read_output(&spec.work_dir.join(STDOUT_FILE), spec.limits.output_bytes)?;
        let (stderr, _) = read_output(&spec.work_dir.join(STDERR_FILE), STDERR_LIMIT)?;

        Ok(Execution {
            status,
            usage: meta.usage(),
            stdout,
            stderr,
            stdout_truncated,
        })
    }
}

impl Drop for IsolateRunner {
    fn drop(&mut self) {
        let out = Command::new("isolate")
            .arg("-b")
            .arg(self.id.to_string())
            .arg("--cg")
            .arg("--cleanup")
            .output();

        if out.is_ok_and(|c| c.status.success()) {
            log::info!("IsolateRunner {} cleaned up", self.id);
        } else {
            log::error!("IsolateRunner {} failed to clean up", self.id);
        }
    }
}

fn read_output(path: &Path, cap: usize) -> error::Result<(Vec<u8>, bool)> {
    match fs::File::open(path) {
        Ok(file) => Ok(read_capped(file, cap)?),
        // Nothing is written when the program never started
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((Vec::new(), false)),
        Err(e) => Err(e.into()),
    }
}

/// Fields of an isolate meta file
#[derive(Debug, Default, PartialEq)]
struct Meta {
    status: Option<String>,
    message: Option<String>,
    exitcode: Option<i32>,
    exitsig: Option<i32>,
    cg_oom_killed: bool,
    cg_mem_kb: u64,
    max_rss_kb: u64,
    time_wall_secs: f64,
}

impl Meta {
    fn parse(meta_content: &str) -> Self {
        let mut meta = Self::default();

        for line in meta_content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key {
                    "status" => meta.status = Some(value.to_string()),
                    "message" => meta.message = Some(value.to_string()),
                    "exitcode" => meta.exitcode = value.parse().ok(),
                    "exitsig" => meta.exitsig = value.parse().ok(),
                    "cg-oom-killed" => meta.cg_oom_killed = true,
                    "cg-mem" => meta.cg_mem_kb = value.parse().unwrap_or_default(),
                    "max-rss" => meta.max_rss_kb = value.parse().unwrap_or_default(),
                    "time-wall" => meta.time_wall_secs = value.parse().unwrap_or_default(),
                    _ => {}
                }
            }
        }

        meta
    }

    fn usage(&self) -> Usage {
        Usage {
            time_ms: (self.time_wall_secs * 1000.0).round() as u64,
            memory_kb: self.cg_mem_kb.max(self.max_rss_kb),
        }
    }

    fn status(&self, memory_limit_kb: u64) -> error::Result<ExecStatus> {
        if self.status.as_deref() == Some("XX") {
            return Err(JudgeError::infra(format!(
                "isolate internal error: {}",
                self.message.as_deref().unwrap_or("unknown")
            )));
        }

        if self.cg_oom_killed || self.usage().memory_kb > memory_limit_kb {
            return Ok(ExecStatus::MemoryExceeded);
        }
        if self.status.as_deref() == Some("TO") {
            return Ok(ExecStatus::TimedOut);
        }
        if let Some(signal) = self.exitsig {
            return Ok(ExecStatus::Crashed {
                signal: Some(signal),
                exit_code: None,
            });
        }

        Ok(match self.exitcode.unwrap_or(0) {
            0 => ExecStatus::RanToCompletion { exit_code: 0 },
            code => ExecStatus::Crashed {
                signal: None,
                exit_code: Some(code),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta() {
        let meta = Meta::parse("time:0.120\ntime-wall:0.151\nmax-rss:3400\ncg-mem:3072\nexitcode:0\n");
        assert_eq!(
            meta.usage(),
            Usage {
                time_ms: 151,
                memory_kb: 3400
            }
        );
        assert_eq!(
            meta.status(65536).unwrap(),
            ExecStatus::RanToCompletion { exit_code: 0 }
        );
    }

    #[test]
    fn test_meta_timeout() {
        let meta = Meta::parse("status:TO\nmessage:Time limit exceeded (wall clock)\nkilled:1\n");
        assert_eq!(meta.status(65536).unwrap(), ExecStatus::TimedOut);
    }

    #[test]
    fn test_meta_oom_wins_over_signal() {
        let meta = Meta::parse("status:SG\nexitsig:9\ncg-oom-killed:1\ncg-mem:65536\n");
        assert_eq!(meta.status(65536).unwrap(), ExecStatus::MemoryExceeded);
    }

    #[test]
    fn test_meta_runtime_error() {
        let meta = Meta::parse("status:RE\nexitcode:1\n");
        assert_eq!(
            meta.status(65536).unwrap(),
            ExecStatus::Crashed {
                signal: None,
                exit_code: Some(1)
            }
        );

        let meta = Meta::parse("status:SG\nexitsig:11\n");
        assert_eq!(
            meta.status(65536).unwrap(),
            ExecStatus::Crashed {
                signal: Some(11),
                exit_code: None
            }
        );
    }

    #[test]
    fn test_meta_internal_error() {
        let meta = Meta::parse("status:XX\nmessage:cannot set up cgroup\n");
        assert!(matches!(
            meta.status(65536),
            Err(JudgeError::Infrastructure(_))
        ));
    }
}
