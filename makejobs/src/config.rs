/// Run-wide switches the scheduler consults. These mirror the command-line
/// options of a `make` front end; parsing them is the caller's business.
#[derive(Clone, Debug)]
pub struct Config {
    /// Requested concurrency (`-j`).
    pub max_jobs: usize,
    /// Keep building unrelated targets after a fatal job error (`-k`).
    pub keep_going: bool,
    /// Print recipes instead of running them (`-n`).
    pub no_execute: bool,
    /// Touch targets instead of running recipes (`-t`).
    pub touch: bool,
    /// Collect output through pipes; temp files are used otherwise (`!-P`).
    pub use_pipes: bool,
    /// Print `--- target ---` banners when jobs may interleave (`-v`).
    pub verbose: bool,
    /// Report every job completion, not just failures (`-d j`).
    pub debug_jobs: bool,
    /// Echo commands even when prefixed with `@` (`-d l`).
    pub loud: bool,
    /// Treat every target as if it ignored errors (`-i`).
    pub ignore_errors: bool,
    /// Treat every target as silent (`-s`).
    pub silent: bool,
    /// Run one shell per command, synchronously (`-B`).
    pub compat: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_jobs: 1,
            keep_going: false,
            no_execute: false,
            touch: false,
            use_pipes: true,
            verbose: false,
            debug_jobs: false,
            loud: false,
            ignore_errors: false,
            silent: false,
            compat: false,
        }
    }
}
