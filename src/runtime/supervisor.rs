// ABOUTME: Kernel process supervision: spawn, status polling, signals, graceful termination
//
// Owns one child process at a time. Termination sends SIGTERM, waits for the
// configured grace period, then falls back to SIGKILL. kill_on_drop guarantees
// a dropped supervisor never leaks its child.

#![allow(clippy::option_if_let_else)]

use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use crate::config::KernelSpec;
use crate::error::KernelError;

/// Current state of a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,

    /// Process is running with the given PID
    Running {
        /// Process ID
        pid: u32,
    },

    /// Process exited normally with exit code
    Exited {
        /// Exit code from the process
        code: i32,
    },

    /// Process was terminated by a signal
    Signaled {
        /// Signal number that terminated the process
        signal: i32,
    },

    /// Process failed to start or run
    Failed {
        /// Description of the failure
        reason: String,
    },
}

impl ProcessState {
    /// Returns true if the process is currently running
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// Process supervisor managing the lifecycle of a single kernel process
pub struct ProcessSupervisor {
    /// The child process (if running)
    child: Option<Child>,

    /// Child's stdin for execute requests
    stdin: Option<ChildStdin>,

    /// Child's stdout carrying kernel events
    stdout: Option<ChildStdout>,

    /// Current process state
    state: ProcessState,

    /// How long SIGTERM gets before SIGKILL
    grace: Duration,
}

impl ProcessSupervisor {
    #[must_use]
    pub const fn new(grace: Duration) -> Self {
        Self {
            child: None,
            stdin: None,
            stdout: None,
            state: ProcessState::NotStarted,
            grace,
        }
    }

    /// Spawn the kernel process described by `spec`
    ///
    /// # Errors
    /// Returns error if the command is empty or spawn fails. A process that is
    /// already running is left untouched.
    pub fn spawn(&mut self, spec: &KernelSpec) -> Result<u32, KernelError> {
        if let ProcessState::Running { pid } = self.state {
            warn!(pid = pid, "Kernel process already running, not spawning again");
            return Ok(pid);
        }

        if spec.command.is_empty() {
            return Err(KernelError::InvalidCommand(
                "Command cannot be empty".to_string(),
            ));
        }

        debug!(command = %spec.command, args = spec.args.len(), "Spawning kernel process");

        let mut process_cmd = Command::new(&spec.command);
        process_cmd
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);

        if let Some(dir) = &spec.cwd {
            process_cmd.current_dir(dir);
        }

        let mut child = process_cmd.spawn().map_err(KernelError::SpawnFailed)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let pid = child.id().unwrap_or(0);

        info!(pid = pid, command = %spec.command, "Kernel process spawned");

        self.child = Some(child);
        self.stdin = stdin;
        self.stdout = stdout;
        self.state = ProcessState::Running { pid };

        Ok(pid)
    }

    /// Poll the child without blocking and update the state if it has exited
    pub fn check_status(&mut self) -> ProcessState {
        if let Some(ref mut child) = self.child {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let new_state = if let Some(code) = status.code() {
                        debug!(code = code, "Kernel process exited with code");
                        ProcessState::Exited { code }
                    } else {
                        #[cfg(unix)]
                        {
                            use std::os::unix::process::ExitStatusExt;
                            if let Some(signal) = status.signal() {
                                debug!(signal = signal, "Kernel process terminated by signal");
                                ProcessState::Signaled { signal }
                            } else {
                                ProcessState::Failed {
                                    reason: "Unknown termination".to_string(),
                                }
                            }
                        }
                        #[cfg(not(unix))]
                        {
                            ProcessState::Failed {
                                reason: "Unknown termination".to_string(),
                            }
                        }
                    };

                    self.state = new_state;
                    self.child = None;
                    self.stdin = None;
                    self.stdout = None;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Failed to check kernel process status");
                    self.state = ProcessState::Failed {
                        reason: format!("Status check failed: {e}"),
                    };
                }
            }
        }

        self.state.clone()
    }

    /// Send SIGINT to the running process
    ///
    /// # Errors
    /// Returns `NotRunning` without a live child, `Signal` if delivery fails
    pub fn interrupt(&mut self) -> Result<(), KernelError> {
        let ProcessState::Running { pid } = self.check_status() else {
            return Err(KernelError::NotRunning);
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            #[allow(clippy::cast_possible_wrap)]
            kill(Pid::from_raw(pid as i32), Signal::SIGINT)
                .map_err(|e| KernelError::Signal(e.to_string()))?;
            debug!(pid = pid, "Sent SIGINT to kernel process");
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            Err(KernelError::Signal(
                "interrupt is only supported on unix".to_string(),
            ))
        }
    }

    /// Gracefully terminate the process
    ///
    /// First sends SIGTERM, waits for the grace period, then sends SIGKILL if
    /// the process hasn't exited.
    ///
    /// # Errors
    /// Returns error if the forced kill fails
    pub async fn terminate(&mut self) -> Result<(), KernelError> {
        let Some(ref mut child) = self.child else {
            return Ok(());
        };

        let pid = child.id().unwrap_or(0);
        info!(pid = pid, "Terminating kernel process");

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if pid > 0 {
                #[allow(clippy::cast_possible_wrap)]
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.kill().await;
        }

        // Closing stdin lets well-behaved kernels leave their read loop
        self.stdin = None;

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(_status)) => {
                debug!(pid = pid, "Kernel process terminated gracefully");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for kernel process");
            }
            Err(_) => {
                warn!(
                    pid = pid,
                    "Kernel process did not terminate gracefully, sending SIGKILL"
                );

                if let Err(e) = child.kill().await {
                    error!(error = %e, "Failed to kill kernel process");
                    return Err(KernelError::TerminateFailed(e));
                }

                let _ = child.wait().await;
            }
        }

        self.state = ProcessState::Exited { code: 0 };
        self.child = None;
        self.stdout = None;

        Ok(())
    }

    /// Take ownership of the child's stdin handle
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take ownership of the child's stdout handle
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.state.is_running()
    }

    #[must_use]
    pub const fn state(&self) -> &ProcessState {
        &self.state
    }
}
