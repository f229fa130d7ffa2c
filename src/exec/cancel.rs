use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Terminates a running tool's whole process tree.
///
/// Termination is graceful first, then forced after the grace period; it runs on a
/// blocking worker so the caller returns immediately, and it never fails: problems
/// are logged and absorbed.
#[derive(Debug, Clone, Copy)]
pub struct CancellationController {
    grace_period: Duration,
}

impl CancellationController {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Start terminating the tree rooted at `pid` in the background
    pub fn cancel(&self, pid: u32) -> JoinHandle<()> {
        let grace = self.grace_period;
        tokio::task::spawn_blocking(move || terminate_tree(pid, grace))
    }
}

/// Blocking tree termination; a no-op when `root` has already exited
pub fn terminate_tree(root: u32, grace: Duration) {
    let root_pid = Pid::from_u32(root);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    if !is_alive(&system, root_pid) {
        debug!("Process {} already exited, nothing to cancel", root);
        return;
    }

    let descendants = descendants_of(&system, root_pid);
    info!("Terminating process {} and {} descendant(s)", root, descendants.len());

    // leaves first so parents do not respawn or reparent children mid-way
    for pid in descendants.iter().rev() {
        if let Some(process) = system.process(*pid) {
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
        }
    }
    let survivors = wait_for_exit(&mut system, &descendants, grace);
    for pid in survivors {
        warn!("Process {} ignored termination, killing it", pid);
        if let Some(process) = system.process(pid) {
            process.kill();
        }
    }

    terminate_root(&mut system, root_pid, grace);
}

fn terminate_root(system: &mut System, root: Pid, grace: Duration) {
    if !signal_group(root, false) {
        if let Some(process) = system.process(root) {
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
        }
    }

    if wait_for_exit(system, &[root], grace).is_empty() {
        debug!("Process {} terminated gracefully", root);
        return;
    }

    warn!("Process {} did not exit within {:?}, killing it", root, grace);
    if !signal_group(root, true) {
        if let Some(process) = system.process(root) {
            process.kill();
        }
    }
}

/// Signal the process group led by `root`; false when groups are unavailable
#[cfg(unix)]
fn signal_group(root: Pid, forced: bool) -> bool {
    use nix::sys::signal::{killpg, Signal as UnixSignal};
    use nix::unistd::Pid as UnixPid;

    let signal = if forced { UnixSignal::SIGKILL } else { UnixSignal::SIGTERM };
    match killpg(UnixPid::from_raw(root.as_u32() as i32), signal) {
        Ok(()) => true,
        Err(e) => {
            debug!("Process group {} not signalled ({}), falling back to the process", root, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_root: Pid, _forced: bool) -> bool {
    false
}

fn is_alive(system: &System, pid: Pid) -> bool {
    system
        .process(pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// All transitive children of `root`, in breadth-first order
fn descendants_of(system: &System, root: Pid) -> Vec<Pid> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);

    while let Some(parent) = queue.pop_front() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && *pid != root && !found.contains(pid) {
                found.push(*pid);
                queue.push_back(*pid);
            }
        }
    }
    found
}

/// Wait until every pid has exited or the timeout passes; returns the survivors
fn wait_for_exit(system: &mut System, pids: &[Pid], timeout: Duration) -> Vec<Pid> {
    let deadline = Instant::now() + timeout;
    loop {
        system.refresh_processes(ProcessesToUpdate::Some(pids), true);
        let survivors: Vec<Pid> = pids.iter().copied().filter(|p| is_alive(system, *p)).collect();
        if survivors.is_empty() || Instant::now() >= deadline {
            return survivors;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}
