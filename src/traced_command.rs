//! Launching the traced command.
//!
//! The command runs under `/bin/sh -c`. The shell is forked first and held on
//! a pipe before it execs, so its pid can be added to the membership set and
//! the kernel pre-filters before it does anything worth tracing.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::coordinator::Launcher;
use crate::error::TraceError;

pub const DEFAULT_SHELL: &str = "/bin/sh";

/// A forked child blocked before `execv`.
///
/// Writing to the ready pipe releases it. The exec pipe has `O_CLOEXEC` on
/// its write end: EOF means exec succeeded, four bytes of errno mean it did
/// not. A child that was never reaped is killed and reaped on drop.
pub struct TracedChild {
    pub pid: u32,
    ready_write_fd: Option<i32>,
    exec_read_fd: Option<i32>,
    waited: bool,
}

impl Drop for TracedChild {
    fn drop(&mut self) {
        if let Some(fd) = self.ready_write_fd.take() {
            unsafe { libc::close(fd) };
        }
        if let Some(fd) = self.exec_read_fd.take() {
            unsafe { libc::close(fd) };
        }
        if !self.waited {
            let pid = Pid::from_raw(self.pid as i32);
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            self.waited = true;
        }
    }
}

impl TracedChild {
    /// Let the child exec and wait until it has. Fails if exec failed.
    pub fn release(&mut self) -> Result<()> {
        if let Some(fd) = self.ready_write_fd.take() {
            let buf: [u8; 1] = [1];
            let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 1) };
            // Capture errno before close() can clobber it
            let write_err = (ret < 0).then(std::io::Error::last_os_error);
            unsafe { libc::close(fd) };
            if let Some(err) = write_err {
                bail!("Failed to signal child to exec: {}", err);
            }
        }

        let Some(fd) = self.exec_read_fd.take() else {
            return Ok(());
        };
        let mut buf = [0u8; 4];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 4) };
        let read_err = (n < 0).then(std::io::Error::last_os_error);
        unsafe { libc::close(fd) };
        if let Some(err) = read_err {
            bail!("Failed to read exec status pipe: {}", err);
        }
        if n > 0 {
            let errno = if n >= 4 {
                i32::from_ne_bytes(buf)
            } else {
                buf[0] as i32
            };
            let _ = waitpid(Pid::from_raw(self.pid as i32), None);
            self.waited = true;
            return Err(TraceError::Launch(std::io::Error::from_raw_os_error(errno).to_string()).into());
        }
        Ok(())
    }

    /// Block until the child exits. A child killed by a signal reports
    /// `128 + signal`, the way shells do.
    pub fn wait(&mut self) -> Result<i32> {
        let pid = Pid::from_raw(self.pid as i32);
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.waited = true;
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.waited = true;
                    return Ok(128 + signal as i32);
                }
                Ok(status) => debug!("child {} changed state: {:?}", self.pid, status),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.waited = true;
                    return Err(e).with_context(|| format!("waitpid({}) failed", self.pid));
                }
            }
        }
    }
}

fn check_executable(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Cannot stat '{}'", path.display()))?;
    if !metadata.is_file() {
        bail!("'{}' is not a regular file", path.display());
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        bail!("'{}' is not executable", path.display());
    }
    Ok(())
}

/// Fork a child that execs `argv[0]` with `argv` once released.
///
/// The child blocks on a pipe until [`TracedChild::release`], so its pid can
/// be registered with the sources before the command starts.
///
/// # Safety
///
/// This calls `libc::fork()` while the handler threads are already polling.
/// Only the calling thread exists in the child, and any lock another thread
/// held at fork time stays locked there forever. So the child must not
/// allocate, log or touch a mutex: every `CString` and the argv array are
/// built before the fork, and the child path uses only async-signal-safe libc
/// calls and never returns. It always ends in `execv()` or `_exit()`.
pub fn spawn_traced_child(argv: &[String]) -> Result<TracedChild> {
    let Some(program) = argv.first() else {
        bail!("No command specified to run");
    };
    check_executable(Path::new(program))?;

    // No allocations are allowed in the child after fork.
    let path_cstr =
        CString::new(program.as_bytes()).with_context(|| "Command path contains null byte")?;
    let arg_cstrings: Vec<CString> = argv
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .with_context(|| format!("Argument contains null byte: {}", arg))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut argv_ptrs: Vec<*const libc::c_char> =
        arg_cstrings.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    // Parent writes one byte here to let the child exec.
    let mut ready_fds = [0i32; 2];
    if unsafe { libc::pipe(ready_fds.as_mut_ptr()) } != 0 {
        bail!(
            "Failed to create ready pipe: {}",
            std::io::Error::last_os_error()
        );
    }
    let [ready_read, ready_write] = ready_fds;

    // O_CLOEXEC: EOF on exec success, errno bytes on failure.
    let mut exec_fds = [0i32; 2];
    if unsafe { libc::pipe2(exec_fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        unsafe {
            libc::close(ready_read);
            libc::close(ready_write);
        }
        bail!(
            "Failed to create exec pipe: {}",
            std::io::Error::last_os_error()
        );
    }
    let [exec_read, exec_write] = exec_fds;

    // For the PR_SET_PDEATHSIG race check in the child.
    let parent_pid = unsafe { libc::getpid() };
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => {
            unsafe {
                libc::close(ready_read);
                libc::close(ready_write);
                libc::close(exec_read);
                libc::close(exec_write);
            }
            bail!("fork() failed: {}", std::io::Error::last_os_error());
        }
        0 => unsafe {
            // Child: async-signal-safe calls only, never return.
            libc::close(ready_write);
            libc::close(exec_read);

            // SIGTERM if the tracer dies before releasing us.
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            // Reparented between fork() and prctl(): the tracer is gone.
            if libc::getppid() != parent_pid {
                libc::_exit(1);
            }

            let mut buf = [0u8; 1];
            let n = libc::read(ready_read, buf.as_mut_ptr() as *mut libc::c_void, 1);
            libc::close(ready_read);
            // EOF: the tracer dropped us without releasing.
            if n <= 0 {
                libc::_exit(1);
            }

            // exec_write is closed by O_CLOEXEC on success.
            libc::execv(path_cstr.as_ptr(), argv_ptrs.as_ptr());

            let errno = *libc::__errno_location();
            let errno_bytes = errno.to_ne_bytes();
            libc::write(exec_write, errno_bytes.as_ptr() as *const libc::c_void, 4);
            libc::close(exec_write);
            libc::_exit(127);
        },
        child_pid => {
            unsafe {
                libc::close(ready_read);
                libc::close(exec_write);
            }
            Ok(TracedChild {
                pid: child_pid as u32,
                ready_write_fd: Some(ready_write),
                exec_read_fd: Some(exec_read),
                waited: false,
            })
        }
    }
}

/// Pid that Ctrl-C is forwarded to, 0 when no child is running.
static FOREGROUND_CHILD: AtomicI32 = AtomicI32::new(0);
static SIGINT_HANDLER: Once = Once::new();

/// ctrlc allows a single handler per process, so it is installed once and
/// reads the current child from [`FOREGROUND_CHILD`].
fn forward_sigint_to(pid: u32) {
    FOREGROUND_CHILD.store(pid as i32, Ordering::Release);
    SIGINT_HANDLER.call_once(|| {
        if let Err(e) = ctrlc::set_handler(|| {
            let pid = FOREGROUND_CHILD.load(Ordering::Acquire);
            if pid > 0 {
                let _ = kill(Pid::from_raw(pid), Signal::SIGINT);
            }
        }) {
            debug!("SIGINT forwarding not installed: {e}");
        }
    });
}

/// Runs a command string under a shell.
pub struct ShellLauncher {
    shell: PathBuf,
    child: Option<TracedChild>,
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

impl ShellLauncher {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        ShellLauncher {
            shell: shell.into(),
            child: None,
        }
    }
}

impl Launcher for ShellLauncher {
    fn spawn(&mut self, command: &str) -> Result<u32> {
        if self.child.is_some() {
            bail!("a command was already spawned");
        }
        let argv = vec![
            self.shell.to_string_lossy().into_owned(),
            "-c".to_string(),
            command.to_string(),
        ];
        let child = spawn_traced_child(&argv)
            .with_context(|| format!("Failed to start {}", self.shell.display()))?;
        let pid = child.pid;
        self.child = Some(child);
        Ok(pid)
    }

    fn run_to_exit(&mut self) -> Result<i32> {
        let Some(child) = self.child.as_mut() else {
            bail!("no command was spawned");
        };

        forward_sigint_to(child.pid);

        child.release()?;
        info!("Started child process with PID {}", child.pid);
        let status = child.wait();
        FOREGROUND_CHILD.store(0, Ordering::Release);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_available() -> bool {
        Path::new(DEFAULT_SHELL).exists()
    }

    #[test]
    fn test_exit_code_propagates() {
        if !shell_available() {
            return;
        }
        let mut launcher = ShellLauncher::default();
        let pid = launcher.spawn("exit 7").unwrap();
        assert!(pid > 0);
        assert_eq!(launcher.run_to_exit().unwrap(), 7);
    }

    #[test]
    fn test_signal_maps_to_128_plus() {
        if !shell_available() {
            return;
        }
        let mut launcher = ShellLauncher::default();
        launcher.spawn("kill -TERM $$").unwrap();
        assert_eq!(launcher.run_to_exit().unwrap(), 128 + libc::SIGTERM);
    }

    #[test]
    fn test_missing_shell() {
        let mut launcher = ShellLauncher::new("/nonexistent/shell");
        assert!(launcher.spawn("true").is_err());
    }

    #[test]
    fn test_run_without_spawn() {
        let mut launcher = ShellLauncher::default();
        assert!(launcher.run_to_exit().is_err());
    }

    #[test]
    fn test_spawn_while_another_thread_holds_locks() {
        if !shell_available() {
            return;
        }
        use std::sync::{mpsc, Arc, Mutex};

        // A busy thread keeps a mutex and the allocator warm across the fork.
        let lock = Arc::new(Mutex::new(Vec::<u8>::new()));
        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let held = lock.clone();
        let busy = std::thread::spawn(move || {
            let mut guard = held.lock().unwrap();
            locked_tx.send(()).unwrap();
            while done_rx.try_recv().is_err() {
                guard.push(0);
                guard.clear();
            }
        });
        locked_rx.recv().unwrap();

        let mut launcher = ShellLauncher::default();
        launcher.spawn("exit 5").unwrap();
        assert_eq!(launcher.run_to_exit().unwrap(), 5);

        done_tx.send(()).unwrap();
        busy.join().unwrap();
    }

    #[test]
    fn test_unreleased_child_is_reaped_on_drop() {
        if !shell_available() {
            return;
        }
        let child = spawn_traced_child(&[DEFAULT_SHELL.to_string(), "-c".into(), "true".into()])
            .unwrap();
        let pid = Pid::from_raw(child.pid as i32);
        drop(child);
        // Already reaped: no such child.
        assert_eq!(waitpid(pid, None).unwrap_err(), Errno::ECHILD);
    }
}
