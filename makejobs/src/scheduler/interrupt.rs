use std::fs;

use nix::sys::signal::{killpg, Signal};
use tracing::debug;

use super::{Abort, Scheduler};
use crate::error::Result;
use crate::graph::{Graph, Special, TargetAttrs};
use crate::job::JobFlags;
use crate::signals;

impl<G: Graph> Scheduler<G> {
    /// Acts on every signal that arrived since the last call.
    pub fn handle_signals(&mut self) -> Result<()> {
        for sig in signals::take_pending() {
            self.pass_sig(sig)?;
        }
        Ok(())
    }

    /// Forwards `sig` to every running job, with a `SIGCONT` in case the job
    /// was stopped. Job-control signals stop there. Anything else ends the
    /// build: running targets that are not precious are removed,
    /// `.INTERRUPT` runs for `SIGINT`, and the process dies by the signal
    /// (`SIGQUIT` becomes `SIGINT`). Signals arriving while that cleanup
    /// runs are dropped, so `.INTERRUPT` runs at most once.
    pub fn pass_sig(&mut self, sig: Signal) -> Result<()> {
        if self.aborting == Some(Abort::Interrupt) {
            debug!("{} during interrupt cleanup, ignored", sig);
            return Ok(());
        }
        debug!("passing {} to jobs", sig);
        for job in self.table.running() {
            if let Some(pid) = job.pid {
                let _ = killpg(pid, sig);
                let _ = killpg(pid, Signal::SIGCONT);
            }
        }
        if signals::JOB_CONTROL.contains(&sig) {
            return Ok(());
        }

        self.aborting = Some(Abort::Interrupt);
        self.remove_running_targets()?;

        if sig == Signal::SIGINT && !self.config.touch {
            if let Some(interrupt) = self.graph.special(Special::Interrupt) {
                self.config.ignore_errors = false;
                self.start(interrupt, JobFlags::SPECIAL | JobFlags::IGNDOTS)?;
                self.drain_table()?;
            }
        }

        let sig = if sig == Signal::SIGQUIT { Signal::SIGINT } else { sig };
        self.console.flush()?;
        self.table.tokens_mut().teardown()?;
        signals::die_by(sig)
    }

    fn remove_running_targets(&mut self) -> Result<()> {
        if self.config.no_execute {
            return Ok(());
        }
        let targets: Vec<_> = self.table.running().iter().map(|j| j.target).collect();
        for target in targets {
            if self
                .graph
                .attrs(target)
                .intersects(TargetAttrs::PRECIOUS | TargetAttrs::VIRTUAL)
            {
                continue;
            }
            let path = self.graph.path(target);
            if fs::remove_file(&path).is_ok() {
                self.console.line(format_args!("*** {} removed", path.display()))?;
            }
        }
        Ok(())
    }
}
