use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// What `waitpid` (or the scheduler itself, when resuming a job) reported
/// about a job's shell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Exited { code: i32 },
    Killed { signal: Signal },
    Stopped { signal: Signal },
    Continued,
}

impl JobStatus {
    /// Splits a raw wait status into the pid it belongs to and the event.
    /// Returns `None` for statuses the scheduler never asks for.
    pub fn from_wait(status: WaitStatus) -> Option<(Pid, JobStatus)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, JobStatus::Exited { code })),
            WaitStatus::Signaled(pid, signal, _) => Some((pid, JobStatus::Killed { signal })),
            WaitStatus::Stopped(pid, signal) => Some((pid, JobStatus::Stopped { signal })),
            WaitStatus::Continued(pid) => Some((pid, JobStatus::Continued)),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, JobStatus::Exited { code: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wait_statuses() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            JobStatus::from_wait(WaitStatus::Exited(pid, 3)),
            Some((pid, JobStatus::Exited { code: 3 }))
        );
        assert_eq!(
            JobStatus::from_wait(WaitStatus::Signaled(pid, Signal::SIGINT, false)),
            Some((pid, JobStatus::Killed { signal: Signal::SIGINT }))
        );
        assert_eq!(JobStatus::from_wait(WaitStatus::StillAlive), None);
        assert!(JobStatus::Exited { code: 0 }.success());
        assert!(!JobStatus::Continued.success());
    }
}
