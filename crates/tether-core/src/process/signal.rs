//! Interrupting agent process trees.
//!
//! Agents spawn their own children (shells, build tools, language servers).
//! Signalling only the agent would orphan that work, so on Unix every agent
//! is placed in its own process group and interrupts target the group.
//! Where groups are unavailable the agent process itself is signalled, with
//! no guarantee about its descendants.

use std::io;
use std::process::Command;

/// Platform strategy for preparing and interrupting agent processes.
pub trait Interrupter: Send + Sync {
    /// Adjust a command before spawning (e.g. new process group).
    fn prepare(&self, cmd: &mut Command);

    /// Interrupt the process (tree) rooted at `pid`.
    ///
    /// A process that is already gone is not an error.
    fn interrupt(&self, pid: u32) -> io::Result<()>;
}

/// Signals the whole process group of the agent.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupInterrupter;

#[cfg(unix)]
impl Interrupter for ProcessGroupInterrupter {
    fn prepare(&self, cmd: &mut Command) {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    fn interrupt(&self, pid: u32) -> io::Result<()> {
        let pid = pid as libc::pid_t;
        let pgid = unsafe { libc::getpgid(pid) };
        let own = unsafe { libc::getpgrp() };

        // Never signal our own group: that would interrupt the bridge too.
        if pgid <= 0 || pgid == own {
            if pgid < 0 && is_gone(&io::Error::last_os_error()) {
                return Ok(());
            }
            log::debug!("process group for pid {} unavailable, signalling directly", pid);
            return kill_direct(pid);
        }

        let result = unsafe { libc::killpg(pgid, libc::SIGINT) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if is_gone(&err) {
            return Ok(());
        }
        log::debug!("killpg({}) failed: {}, signalling directly", pgid, err);
        kill_direct(pid)
    }
}

/// Signals only the agent process.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectInterrupter;

impl Interrupter for DirectInterrupter {
    fn prepare(&self, _cmd: &mut Command) {}

    #[cfg(unix)]
    fn interrupt(&self, pid: u32) -> io::Result<()> {
        kill_direct(pid as libc::pid_t)
    }

    #[cfg(windows)]
    fn interrupt(&self, pid: u32) -> io::Result<()> {
        let output = Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()?;
        if !output.status.success() {
            log::warn!(
                "taskkill for pid {} failed: {}",
                pid,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn interrupt(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interrupt not supported on this platform",
        ))
    }
}

/// The interrupter for the current platform.
pub fn platform_interrupter() -> Box<dyn Interrupter> {
    #[cfg(unix)]
    {
        Box::new(ProcessGroupInterrupter)
    }
    #[cfg(not(unix))]
    {
        Box::new(DirectInterrupter)
    }
}

#[cfg(unix)]
fn kill_direct(pid: libc::pid_t) -> io::Result<()> {
    let result = unsafe { libc::kill(pid, libc::SIGINT) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if is_gone(&err) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn is_gone(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}
