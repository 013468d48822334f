//! Runs build commands, potentially in parallel.
//! Unaware of the build graph, plan, or pools; just command execution.

use crate::graph::EdgeId;
use anyhow::{anyhow, bail};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

#[cfg(unix)]
use std::collections::HashMap;
#[cfg(unix)]
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// The result of executing one command.
pub struct CommandResult {
    pub edge: EdgeId,
    pub termination: Termination,
    /// Combined stdout and stderr.
    pub output: Vec<u8>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.termination == Termination::Success
    }
}

/// Launches commands and reaps their results.
pub trait CommandRunner {
    fn can_run_more(&self) -> bool;

    fn start_command(&mut self, id: EdgeId, cmdline: String) -> anyhow::Result<()>;

    /// Block until some started command finishes. May block for a long time.
    fn wait_for_command(&mut self) -> anyhow::Result<CommandResult>;

    /// Edges started but not yet returned by wait_for_command.
    fn active_edges(&self) -> Vec<EdgeId>;

    /// Kill everything in flight.
    fn abort(&mut self);
}

/// Runner that doesn't run anything: commands "finish" in FIFO order, and
/// always succeed.
#[derive(Default)]
pub struct DryRunner {
    finished: VecDeque<EdgeId>,
}

impl CommandRunner for DryRunner {
    fn can_run_more(&self) -> bool {
        true
    }

    fn start_command(&mut self, id: EdgeId, _cmdline: String) -> anyhow::Result<()> {
        self.finished.push_back(id);
        Ok(())
    }

    fn wait_for_command(&mut self) -> anyhow::Result<CommandResult> {
        match self.finished.pop_front() {
            Some(edge) => Ok(CommandResult {
                edge,
                termination: Termination::Success,
                output: Vec::new(),
            }),
            None => bail!("no commands in flight"),
        }
    }

    fn active_edges(&self) -> Vec<EdgeId> {
        self.finished.iter().copied().collect()
    }

    fn abort(&mut self) {
        self.finished.clear();
    }
}

/// One-minute load average, or a negative value when unavailable (which
/// disables the admission gate).
#[cfg(unix)]
pub fn load_average() -> f64 {
    let mut avgs = [0f64; 3];
    // Safety: getloadavg fills at most the three slots we hand it.
    let rc = unsafe { libc::getloadavg(avgs.as_mut_ptr(), 3) };
    if rc < 1 {
        -0.0
    } else {
        avgs[0]
    }
}

#[cfg(not(unix))]
pub fn load_average() -> f64 {
    -0.0
}

/// Set once the user interrupts the build. The first SIGINT also reaches the
/// children (they share our process group), so a running command reports
/// itself as Termination::Interrupted on its own; this latch covers
/// interrupts that land while no child is being reaped.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn notice_interrupt(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
    // SA_RESETHAND restores the default disposition, so a second interrupt
    // kills the process outright.
}

/// Start observing SIGINT. Installed when a real runner is constructed; dry
/// runs have nothing to interrupt.
#[cfg(unix)]
fn watch_for_interrupt() {
    // Safety: installing a signal handler is libc unsafe code.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = notice_interrupt as libc::sighandler_t;
        action.sa_flags = libc::SA_RESETHAND;
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn watch_for_interrupt() {}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Children we may need to signal on abort, keyed by start token.
#[derive(Default)]
struct KillSet {
    #[cfg(unix)]
    pids: Mutex<HashMap<u64, libc::pid_t>>,
}

impl KillSet {
    #[cfg(unix)]
    fn insert(&self, token: u64, pid: libc::pid_t) {
        self.pids.lock().unwrap().insert(token, pid);
    }

    #[cfg(unix)]
    fn remove(&self, token: u64) {
        self.pids.lock().unwrap().remove(&token);
    }

    fn kill_all(&self) {
        #[cfg(unix)]
        for (_, &pid) in self.pids.lock().unwrap().iter() {
            // Safety: signaling a child we spawned; a stale pid is harmless
            // because we never reuse reaped entries within the lock.
            unsafe {
                libc::kill(pid, libc::SIGINT);
            }
        }
    }
}

#[cfg(unix)]
fn check_ret(func: &str, ret: libc::c_int) -> anyhow::Result<libc::c_int> {
    if ret < 0 {
        bail!("{}: {}", func, std::io::Error::last_os_error());
    }
    Ok(ret)
}

/// posix_spawn-family calls return the error number instead of setting errno.
#[cfg(unix)]
fn check_spawn(func: &str, err: libc::c_int) -> anyhow::Result<()> {
    if err != 0 {
        bail!("{}: {}", func, std::io::Error::from_raw_os_error(err));
    }
    Ok(())
}

#[cfg(unix)]
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

#[cfg(unix)]
impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        // Safety: zeroed actions are initialized before any use.
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_spawn(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_spawn(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_spawn(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

#[cfg(unix)]
impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Spawn `/bin/sh -c cmdline` with stdout and stderr fed into one pipe.
/// We don't use std::process because we want both streams interleaved in a
/// single stream the way a terminal would show them.
#[cfg(unix)]
fn spawn_shell(cmdline: &str) -> anyhow::Result<(libc::pid_t, std::fs::File)> {
    use std::os::fd::FromRawFd;

    // Safety: raw fd and spawn plumbing; the child only sees fds we dup here.
    unsafe {
        let mut pipe: [libc::c_int; 2] = [0; 2];
        check_ret("pipe", libc::pipe(pipe.as_mut_ptr()))?;

        let mut actions = PosixSpawnFileActions::new()?;
        actions.adddup2(pipe[1], 1)?;
        actions.adddup2(pipe[1], 2)?;
        actions.addclose(pipe[0])?;
        actions.addclose(pipe[1])?;

        let shell = b"/bin/sh\0".as_ptr() as *const libc::c_char;
        let dash_c = b"-c\0".as_ptr() as *const libc::c_char;
        let cmdline_nul = std::ffi::CString::new(cmdline)?;
        let argv: [*const libc::c_char; 4] = [shell, dash_c, cmdline_nul.as_ptr(), std::ptr::null()];

        let mut pid: libc::pid_t = 0;
        check_spawn(
            "posix_spawn",
            libc::posix_spawn(
                &mut pid,
                shell,
                actions.as_ptr(),
                std::ptr::null(),
                argv.as_ptr() as *const *mut libc::c_char,
                std::ptr::null(),
            ),
        )?;

        check_ret("close", libc::close(pipe[1]))?;

        Ok((pid, std::fs::File::from_raw_fd(pipe[0])))
    }
}

#[cfg(unix)]
fn run_command(cmdline: &str, token: u64, kills: &KillSet) -> anyhow::Result<(Termination, Vec<u8>)> {
    use std::io::{Read, Write};
    use std::os::unix::process::ExitStatusExt;

    let (pid, mut pipe) = spawn_shell(cmdline)?;
    kills.insert(token, pid);

    let mut output = Vec::new();
    pipe.read_to_end(&mut output)?;

    let status = unsafe {
        let mut status: libc::c_int = 0;
        check_ret("waitpid", libc::waitpid(pid, &mut status, 0))?;
        std::process::ExitStatus::from_raw(status)
    };
    kills.remove(token);

    let mut termination = Termination::Success;
    if !status.success() {
        termination = Termination::Failure;
        if let Some(sig) = status.signal() {
            match sig {
                libc::SIGINT => {
                    write!(output, "interrupted").unwrap();
                    termination = Termination::Interrupted;
                }
                _ => write!(output, "signal {}", sig).unwrap(),
            }
        }
    }

    Ok((termination, output))
}

#[cfg(windows)]
fn run_command(
    cmdline: &str,
    _token: u64,
    _kills: &KillSet,
) -> anyhow::Result<(Termination, Vec<u8>)> {
    // Don't run `cmd /c`, which caps the command line at 8192 bytes;
    // hand the string to CreateProcess unchanged.
    use winapi::um::{errhandlingapi, handleapi, processthreadsapi, synchapi, winbase};

    let mut startup_info: processthreadsapi::STARTUPINFOA = unsafe { std::mem::zeroed() };
    startup_info.cb = std::mem::size_of::<processthreadsapi::STARTUPINFOA>() as u32;
    startup_info.dwFlags = winbase::STARTF_USESTDHANDLES;
    startup_info.hStdInput = handleapi::INVALID_HANDLE_VALUE;
    startup_info.hStdOutput = handleapi::INVALID_HANDLE_VALUE;
    startup_info.hStdError = handleapi::INVALID_HANDLE_VALUE;

    let mut process_info: processthreadsapi::PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let mut mut_cmdline = cmdline.to_string() + "\0";

    let created = unsafe {
        processthreadsapi::CreateProcessA(
            std::ptr::null_mut(),
            mut_cmdline.as_mut_ptr() as *mut i8,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            /*inherit handles=*/ winapi::shared::ntdef::TRUE.into(),
            winbase::CREATE_NEW_PROCESS_GROUP,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut startup_info,
            &mut process_info,
        )
    };
    if created == 0 {
        let error = unsafe { errhandlingapi::GetLastError() };
        bail!("CreateProcessA failed: {}", error);
    }

    let mut exit_code: u32 = 0;
    unsafe {
        handleapi::CloseHandle(process_info.hThread);
        synchapi::WaitForSingleObject(process_info.hProcess, winbase::INFINITE);
        processthreadsapi::GetExitCodeProcess(process_info.hProcess, &mut exit_code);
        handleapi::CloseHandle(process_info.hProcess);
    }

    // TODO: pipe the child's output back so it can be displayed.
    let termination = match exit_code {
        0 => Termination::Success,
        0xC000013A => Termination::Interrupted,
        _ => Termination::Failure,
    };
    Ok((termination, Vec::new()))
}

#[cfg(not(any(unix, windows)))]
fn run_command(
    _cmdline: &str,
    _token: u64,
    _kills: &KillSet,
) -> anyhow::Result<(Termination, Vec<u8>)> {
    bail!("this platform cannot run commands");
}

/// Real command runner: spawns subprocesses through a pool of blocking
/// threads and reaps them over a channel.
pub struct Runner {
    finished_send: mpsc::Sender<CommandResult>,
    finished_recv: mpsc::Receiver<CommandResult>,
    /// Commands started and not yet reaped.
    running: usize,
    active: Vec<EdgeId>,
    kills: Arc<KillSet>,
    next_token: u64,
    parallelism: usize,
    max_load_average: f64,
}

impl Runner {
    pub fn new(parallelism: usize, max_load_average: f64) -> Self {
        watch_for_interrupt();
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            active: Vec::new(),
            kills: Arc::new(KillSet::default()),
            next_token: 0,
            parallelism,
            max_load_average,
        }
    }
}

impl CommandRunner for Runner {
    fn can_run_more(&self) -> bool {
        self.running < self.parallelism
            && (self.running == 0
                || self.max_load_average <= 0.0
                || load_average() < self.max_load_average)
    }

    fn start_command(&mut self, id: EdgeId, cmdline: String) -> anyhow::Result<()> {
        let token = self.next_token;
        self.next_token += 1;
        let tx = self.finished_send.clone();
        let kills = self.kills.clone();
        std::thread::spawn(move || {
            let (termination, output) = run_command(&cmdline, token, &kills)
                .unwrap_or_else(|err| (Termination::Failure, err.to_string().into_bytes()));
            // The send only fails if the receiver is gone, e.g. at shutdown.
            let _ = tx.send(CommandResult {
                edge: id,
                termination,
                output,
            });
        });
        self.running += 1;
        self.active.push(id);
        Ok(())
    }

    fn wait_for_command(&mut self) -> anyhow::Result<CommandResult> {
        let mut result = self
            .finished_recv
            .recv()
            .map_err(|_| anyhow!("command runner workers disappeared"))?;
        self.running -= 1;
        if let Some(pos) = self.active.iter().position(|&e| e == result.edge) {
            self.active.remove(pos);
        }
        // A user interrupt surfaces here even when the reaped child itself
        // exited some other way.
        if interrupted() {
            result.termination = Termination::Interrupted;
        }
        Ok(result)
    }

    fn active_edges(&self) -> Vec<EdgeId> {
        self.active.clone()
    }

    fn abort(&mut self) {
        self.kills.kill_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(n: usize) -> EdgeId {
        EdgeId::from(n)
    }

    #[test]
    fn dry_runner_fifo() {
        let mut runner = DryRunner::default();
        assert!(runner.can_run_more());
        runner.start_command(edge(1), "whatever".into()).unwrap();
        runner.start_command(edge(2), "whatever".into()).unwrap();
        assert_eq!(runner.active_edges(), vec![edge(1), edge(2)]);
        assert_eq!(runner.wait_for_command().unwrap().edge, edge(1));
        assert_eq!(runner.wait_for_command().unwrap().edge, edge(2));
        assert!(runner.wait_for_command().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn captures_combined_output() {
        let mut runner = Runner::new(2, 0.0);
        runner
            .start_command(edge(0), "echo out && echo err >&2".into())
            .unwrap();
        let result = runner.wait_for_command().unwrap();
        assert_eq!(result.termination, Termination::Success);
        let text = String::from_utf8_lossy(&result.output).to_string();
        assert!(text.contains("out"), "missing stdout: {text:?}");
        assert!(text.contains("err"), "missing stderr: {text:?}");
        assert!(runner.active_edges().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_failure() {
        let mut runner = Runner::new(1, 0.0);
        runner.start_command(edge(0), "exit 3".into()).unwrap();
        let result = runner.wait_for_command().unwrap();
        assert_eq!(result.termination, Termination::Failure);
    }

    #[cfg(unix)]
    #[test]
    fn parallelism_gate() {
        let mut runner = Runner::new(1, 0.0);
        assert!(runner.can_run_more());
        runner.start_command(edge(0), "true".into()).unwrap();
        assert!(!runner.can_run_more());
        runner.wait_for_command().unwrap();
        assert!(runner.can_run_more());
    }

    #[test]
    fn load_average_is_a_number() {
        assert!(!load_average().is_nan());
    }
}
