//! Job tokens shared between cooperating build processes.
//!
//! The pool is a named FIFO holding one byte per spare job slot. Every
//! process owns one implicit slot of its own and reads a byte for each slot
//! beyond that, writing it back as soon as a job finishes. The process that
//! creates the FIFO (the leader) seeds it with a byte for every requested
//! slot but gives up its implicit one, so the pool plus all the slots held
//! above baseline always adds up to the requested concurrency less one.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::JOBS_FIFO_VAR;

const TOKEN: &[u8] = b"+";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Purely local limit.
    None,
    /// Created and seeded the FIFO.
    Leader,
    /// Joined a FIFO inherited through the environment.
    Follower,
}

#[derive(Debug)]
pub struct TokenCoordinator {
    role: Role,
    fifo: Option<File>,
    path: Option<PathBuf>,
    max_jobs: usize,
    full: bool,
}

impl TokenCoordinator {
    /// Picks a role from the environment: follow an inherited FIFO, lead a
    /// new one when asked for more than one job, or run unshared.
    pub fn init(requested: usize) -> Result<Self> {
        match env::var_os(JOBS_FIFO_VAR) {
            Some(path) => Ok(Self::follower(Path::new(&path)).unwrap_or_else(|e| {
                debug!("not joining job fifo: {}", e);
                Self::local(requested)
            })),
            None if requested > 1 => {
                let name = format!("make_fifo_{}", Uuid::new_v4().to_simple());
                let path = env::temp_dir().join(name);
                match Self::leader(&path, requested) {
                    Ok(leader) => {
                        env::set_var(JOBS_FIFO_VAR, &path);
                        Ok(leader)
                    }
                    Err(e) => {
                        debug!("running without a job fifo: {}", e);
                        Ok(Self::local(requested))
                    }
                }
            }
            None => Ok(Self::local(requested)),
        }
    }

    /// Creates the FIFO at `path` and seeds it with `requested` tokens.
    pub fn leader(path: &Path, requested: usize) -> Result<Self> {
        let fifo_err = |source: io::Error| Error::Fifo {
            path: path.to_path_buf(),
            source,
        };
        unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| fifo_err(e.into()))?;
        let mut fifo = open_fifo(path).map_err(fifo_err)?;
        fifo.write_all(&TOKEN.repeat(requested)).map_err(fifo_err)?;
        debug!(path = %path.display(), tokens = requested, "leading job fifo");
        Ok(Self {
            role: Role::Leader,
            fifo: Some(fifo),
            path: Some(path.to_path_buf()),
            max_jobs: 0,
            full: true,
        })
    }

    /// Joins an existing FIFO with one implicit slot.
    pub fn follower(path: &Path) -> Result<Self> {
        let fifo = open_fifo(path).map_err(|source| Error::Fifo {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "following job fifo");
        Ok(Self {
            role: Role::Follower,
            fifo: Some(fifo),
            path: Some(path.to_path_buf()),
            max_jobs: 1,
            full: false,
        })
    }

    pub fn local(requested: usize) -> Self {
        Self {
            role: Role::None,
            fifo: None,
            path: None,
            max_jobs: requested,
            full: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Slots this process currently holds.
    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn shared(&self) -> bool {
        self.fifo.is_some()
    }

    /// The last computed full flag, without trying for a token.
    pub fn marked_full(&self) -> bool {
        self.full
    }

    /// FIFO descriptor to watch while waiting for a token.
    pub fn wait_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fifo.as_ref().filter(|_| self.full).map(|f| f.as_fd())
    }

    /// Reports whether no further job may start. A full table backed by a
    /// FIFO first tries to take one token from the pool.
    pub fn acquire(&mut self, aborting: bool) -> bool {
        if aborting {
            return true;
        }
        if self.full {
            if let Some(fifo) = self.fifo.as_mut() {
                let mut byte = [0u8; 1];
                match fifo.read(&mut byte) {
                    Ok(1) => {
                        self.max_jobs += 1;
                        self.full = false;
                        debug!(max_jobs = self.max_jobs, "took a job token");
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => warn!("reading job fifo: {}", e),
                }
            }
        }
        self.full
    }

    /// A job started (or resumed); `running` counts it.
    pub fn admitted(&mut self, running: usize) {
        if running >= self.max_jobs {
            self.full = true;
            debug!("job table is full");
        }
    }

    /// A job left the table; `running` no longer counts it. Any slot held
    /// above the baseline goes straight back to the pool.
    pub fn release(&mut self, running: usize) {
        if self.max_jobs > 1 {
            if let Some(fifo) = self.fifo.as_mut() {
                match fifo.write(TOKEN) {
                    Ok(_) => self.max_jobs -= 1,
                    Err(e) => warn!("returning job token: {}", e),
                }
            }
        }
        self.full = running >= self.max_jobs;
    }

    /// Marks the table full without touching the pool; used when a queued
    /// job cannot be restarted yet.
    pub fn hold(&mut self) {
        self.full = true;
    }

    /// Forgets the full flag when nothing at all is running.
    pub fn clear_full(&mut self) {
        self.full = false;
    }

    /// Closes the FIFO; the leader also removes it.
    pub fn teardown(&mut self) -> Result<()> {
        if self.fifo.take().is_none() {
            return Ok(());
        }
        if self.role == Role::Leader {
            if let Some(path) = &self.path {
                fs::remove_file(path).map_err(|source| Error::Fifo {
                    path: path.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

impl Drop for TokenCoordinator {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("{}", e);
        }
    }
}

fn open_fifo(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    /// Counts the tokens sitting in the pool without disturbing it.
    fn pool_size(fifo: &mut File) -> usize {
        let mut buf = [0u8; 256];
        let mut count = 0;
        loop {
            match fifo.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => count += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("{}", e),
            }
        }
        fifo.write_all(&TOKEN.repeat(count)).unwrap();
        count
    }

    fn held(procs: &[TokenCoordinator]) -> isize {
        procs.iter().map(|p| p.max_jobs() as isize - 1).sum()
    }

    #[test]
    fn leader_starts_empty_handed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        let mut leader = TokenCoordinator::leader(&path, 3).unwrap();
        assert_eq!(leader.role(), Role::Leader);
        assert_eq!(leader.max_jobs(), 0);
        assert!(leader.marked_full());

        assert!(!leader.acquire(false));
        assert_eq!(leader.max_jobs(), 1);
        assert!(leader.acquire(true));

        leader.teardown().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn follower_gets_one_slot_for_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        let mut leader = TokenCoordinator::leader(&path, 1).unwrap();
        let mut follower = TokenCoordinator::follower(&path).unwrap();
        assert_eq!(follower.max_jobs(), 1);
        assert!(!follower.acquire(false));

        follower.admitted(1);
        assert!(follower.marked_full());
        // One token in the pool: the follower can grow to two.
        assert!(!follower.acquire(false));
        assert_eq!(follower.max_jobs(), 2);
        follower.admitted(2);
        assert!(follower.acquire(false));

        follower.release(1);
        assert_eq!(follower.max_jobs(), 1);
        assert!(follower.marked_full());
        assert!(!leader.acquire(false));

        follower.teardown().unwrap();
        assert!(path.exists());
        leader.teardown().unwrap();
    }

    #[test]
    fn local_limit_never_touches_a_fifo() {
        let mut local = TokenCoordinator::local(2);
        assert!(!local.shared());
        local.admitted(1);
        assert!(!local.acquire(false));
        local.admitted(2);
        assert!(local.acquire(false));
        local.release(1);
        assert!(!local.marked_full());
        assert_eq!(local.max_jobs(), 2);
    }

    #[test]
    fn tokens_are_conserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        let requested = 4;
        let mut rng = rand::thread_rng();

        let mut procs = vec![TokenCoordinator::leader(&path, requested).unwrap()];
        for _ in 0..3 {
            procs.push(TokenCoordinator::follower(&path).unwrap());
        }
        let mut running = vec![0usize; procs.len()];
        let mut reader = open_fifo(&path).unwrap();

        for _ in 0..500 {
            let i = rng.gen_range(0..procs.len());
            if rng.gen_bool(0.5) {
                if !procs[i].acquire(false) {
                    running[i] += 1;
                    procs[i].admitted(running[i]);
                }
            } else if running[i] > 0 {
                running[i] -= 1;
                procs[i].release(running[i]);
            }

            assert!(running[i] <= procs[i].max_jobs());
            assert_eq!(
                pool_size(&mut reader) as isize + held(&procs),
                requested as isize - 1
            );
        }
    }
}
