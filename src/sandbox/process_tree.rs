use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::{Pid, getpid, getuid};

/// Environment variable tagging every process of one run
pub(super) const RUN_MARKER: &str = "ARBITER_RUN";

const KILL_ROUNDS: usize = 200;
const KILL_ROUND_PAUSE: Duration = Duration::from_millis(1);

/// Every process started by one run, discovered through `/proc`.
///
/// A process belongs to the run if its parent does, or if it was handed to
/// the judge as an orphan and still carries the run's marker. The judge is
/// a child subreaper, so escaped processes (`setsid`, double forks) are
/// re-parented to it instead of init and stay visible here.
pub(super) struct ProcessTree {
    leader: Pid,
    marker: String,
    members: HashSet<Pid>,
}

struct ProcStat {
    state: char,
    ppid: Pid,
}

fn proc_stat(pid: Pid) -> Option<ProcStat> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parentheses
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some(ProcStat {
        state,
        ppid: Pid::from_raw(ppid),
    })
}

fn is_running(pid: Pid) -> bool {
    proc_stat(pid).is_some_and(|s| s.state != 'Z' && s.state != 'X')
}

fn all_pids() -> Vec<Pid> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse().ok())
        .map(Pid::from_raw)
        .collect()
}

fn carries_marker(pid: Pid, marker: &str) -> bool {
    fs::read(format!("/proc/{pid}/environ"))
        .is_ok_and(|environ| environ.split(|b| *b == 0).any(|var| var == marker.as_bytes()))
}

/// Tasks (threads included) owned by the judge's user, which is what
/// `RLIMIT_NPROC` counts against
pub(super) fn tasks_in_use() -> u64 {
    let uid = getuid().as_raw();
    all_pids()
        .into_iter()
        .filter(|pid| {
            fs::metadata(format!("/proc/{pid}")).is_ok_and(|m| m.uid() == uid)
        })
        .map(|pid| {
            fs::read_dir(format!("/proc/{pid}/task")).map_or(1, |tasks| tasks.count() as u64)
        })
        .sum()
}

fn resident_kb(pid: Pid) -> u64 {
    fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("VmRSS:"))
                .and_then(|value| value.trim().trim_end_matches("kB").trim().parse().ok())
        })
        .unwrap_or(0)
}

impl ProcessTree {
    pub fn new(leader: Pid, marker: String) -> Self {
        Self {
            leader,
            marker,
            members: HashSet::from([leader]),
        }
    }

    pub fn leader(&self) -> Pid {
        self.leader
    }

    /// Picks up processes started since the last refresh and forgets the
    /// ones that are gone
    pub fn refresh(&mut self) {
        let judge = getpid();
        let stats: Vec<(Pid, ProcStat)> = all_pids()
            .into_iter()
            .filter_map(|pid| proc_stat(pid).map(|s| (pid, s)))
            .collect();

        // A child can be listed before its parent
        loop {
            let before = self.members.len();
            for (pid, stat) in &stats {
                if self.members.contains(pid) {
                    continue;
                }
                if self.members.contains(&stat.ppid)
                    || (stat.ppid == judge && carries_marker(*pid, &self.marker))
                {
                    self.members.insert(*pid);
                }
            }
            if self.members.len() == before {
                break;
            }
        }

        let leader = self.leader;
        self.members
            .retain(|pid| *pid == leader || stats.iter().any(|(p, _)| p == pid));
    }

    /// Resident memory of the whole run
    pub fn resident_kb(&self) -> u64 {
        self.members.iter().map(|pid| resident_kb(*pid)).sum()
    }

    /// Kills every process of the run, repeating until none is left running
    pub fn kill_all(&mut self) {
        let _ = killpg(self.leader, Signal::SIGKILL);

        for _ in 0..KILL_ROUNDS {
            self.refresh();
            let alive: Vec<Pid> = self
                .members
                .iter()
                .copied()
                .filter(|pid| is_running(*pid))
                .collect();
            if alive.is_empty() {
                return;
            }
            for pid in alive {
                let _ = kill(pid, Signal::SIGKILL);
            }
            thread::sleep(KILL_ROUND_PAUSE);
        }

        log::warn!(
            "Processes of run {} survived {KILL_ROUNDS} kill rounds",
            self.marker
        );
    }

    /// Reaps the run's processes that were re-parented to the judge.
    /// The leader is left for the caller, which needs its rusage.
    pub fn reap_orphans(&self) {
        for pid in &self.members {
            if *pid != self.leader {
                // ECHILD for processes that were never handed to the judge
                let _ = waitpid(*pid, Some(WaitPidFlag::WNOHANG));
            }
        }
    }
}
