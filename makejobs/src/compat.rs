//! Compatibility mode: every command line gets its own shell, run to
//! completion before the next one starts.

use std::fs;
use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::JobStatus;
use crate::graph::{Expander, Graph, Special, TargetAttrs, Verbatim};
use crate::output::Console;
use crate::script::split_prefixes;
use crate::shell::Shell;
use crate::signals;
use crate::target;
use crate::types::{Recipe, TargetId};

/// Starts one command line: directly when it needs nothing from the
/// shell, through `sh -c` (`-ec` when checking errors) otherwise.
fn spawn_line(shell: &Shell, line: &str, err_check: bool) -> Result<Option<Pid>> {
    let child = if shell.is_simple(line) {
        let words: Vec<&str> = line.split_whitespace().collect();
        match Command::new(words[0]).args(&words[1..]).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("{}: {}", words[0], e);
                return Ok(None);
            }
        }
    } else {
        Command::new(&shell.path)
            .arg(if err_check { "-ec" } else { "-c" })
            .arg(line)
            .spawn()
            .map_err(|source| Error::Spawn {
                shell: shell.path.clone(),
                source,
            })?
    };
    Ok(Some(Pid::from_raw(child.id() as i32)))
}

/// Waits for `pid`, giving `interrupted` a chance to act on signals each
/// time the wait is cut short.
fn wait_line<F>(pid: Pid, mut interrupted: F) -> Result<JobStatus>
where
    F: FnMut() -> Result<()>,
{
    loop {
        match waitpid(pid, None) {
            Ok(status) => match JobStatus::from_wait(status) {
                Some((_, status)) => return Ok(status),
                None => continue,
            },
            Err(Errno::EINTR) => interrupted()?,
            Err(e) => return Err(Error::Wait(e)),
        }
    }
}

/// Prints the failure of a line and says whether the target may go on.
fn report_failure(
    console: &mut Console,
    status: JobStatus,
    err_check: bool,
    keep_going: bool,
) -> Result<bool> {
    let what = match status {
        JobStatus::Exited { code } => format!("*** Error code {}", code),
        JobStatus::Killed { signal } | JobStatus::Stopped { signal } => {
            format!("*** Signal {}", signal as i32)
        }
        JobStatus::Continued => return Ok(true),
    };
    if !err_check {
        console.line(format_args!("{} (ignored)", what))?;
        Ok(true)
    } else if keep_going {
        console.line(format_args!("{} (continuing)", what))?;
        Ok(false)
    } else {
        console.line(format_args!("{}", what))?;
        Ok(false)
    }
}

/// Runs a `+` line on behalf of the job scheduler while it is only
/// printing commands. Returns false if the line failed.
pub(crate) fn run_forced(
    shell: &Shell,
    config: &Config,
    console: &mut Console,
    expanded: &str,
    silent: bool,
    ignore: bool,
) -> Result<bool> {
    let (prefixes, line) = split_prefixes(expanded);
    let err_check = !(ignore || prefixes.ignore);
    if !(silent || (prefixes.silent && !config.loud)) {
        console.line(format_args!("{}", line))?;
    }
    let status = match spawn_line(shell, line, err_check)? {
        Some(pid) => wait_line(pid, || Ok(()))?,
        None => JobStatus::Exited { code: 1 },
    };
    if status.success() {
        return Ok(true);
    }
    report_failure(console, status, err_check, config.keep_going)
}

/// Builds targets one at a time, one shell per command.
pub struct CompatRunner<G: Graph> {
    graph: G,
    expander: Box<dyn Expander>,
    shell: Shell,
    config: Config,
    console: Console,
    current: Option<TargetId>,
    deferred: Recipe,
    errors: usize,
}

impl<G: Graph> CompatRunner<G> {
    pub fn new(graph: G, config: Config) -> Self {
        Self {
            graph,
            expander: Box::new(Verbatim),
            shell: Shell::default(),
            config,
            console: Console::stdout(),
            current: None,
            deferred: Vec::new(),
            errors: 0,
        }
    }

    pub fn with_shell(mut self, shell: Shell) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_expander(mut self, expander: impl Expander + 'static) -> Self {
        self.expander = Box::new(expander);
        self
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    /// Commands put aside by `...` so far.
    pub fn deferred(&self) -> &[String] {
        &self.deferred
    }

    /// Builds every ready target, then the deferred commands and `.END`.
    /// Returns the number of targets that could not be made.
    pub fn run(&mut self) -> Result<usize> {
        if let Some(begin) = self.graph.special(Special::Begin) {
            if !self.run_commands(begin, true)? {
                self.console.line(format_args!("\n\nStop."))?;
                return Ok(1);
            }
        }

        while let Some(target) = self.graph.next_ready() {
            if !self.make(target)? {
                self.errors += 1;
                let name = self.graph.name(target).to_string();
                if !self.config.keep_going {
                    self.console.line(format_args!("\n\nStop in {}.", name))?;
                    return Ok(self.errors);
                }
                self.console.line(format_args!("`{}' not remade because of errors.", name))?;
            }
        }

        if self.errors == 0 {
            let deferred = std::mem::take(&mut self.deferred);
            if !self.run_lines(None, &deferred, false)? {
                self.console.line(format_args!("\n\nStop."))?;
                return Ok(1);
            }
            if let Some(end) = self.graph.special(Special::End) {
                if !self.run_commands(end, false)? {
                    self.console.line(format_args!("\n\nStop."))?;
                    return Ok(1);
                }
            }
        }
        Ok(self.errors)
    }

    /// Makes one target. Returns false when it failed.
    pub fn make(&mut self, target: TargetId) -> Result<bool> {
        let mut ok =
            target::check_commands(&mut self.graph, &mut self.console, &self.config, target)?;
        if ok {
            if self.config.touch {
                let silent = self.silent(target);
                target::touch(&self.graph, &mut self.console, &self.config, target, silent)?;
            } else {
                self.current = Some(target);
                let ran = self.run_commands(target, true);
                self.current = None;
                ok = ran?;
            }
        }
        if ok {
            self.graph.job_complete(target);
        } else {
            self.graph.job_failed(target);
        }
        Ok(ok)
    }

    fn silent(&self, target: TargetId) -> bool {
        self.config.silent || self.graph.attrs(target).contains(TargetAttrs::SILENT)
    }

    fn run_commands(&mut self, target: TargetId, save: bool) -> Result<bool> {
        let commands = self.graph.commands(target).to_vec();
        self.run_lines(Some(target), &commands, save)
    }

    /// Runs lines in order until one fails. After a `...` line the rest are
    /// put aside when `save` is set and dropped otherwise.
    fn run_lines(
        &mut self,
        target: Option<TargetId>,
        commands: &[String],
        save: bool,
    ) -> Result<bool> {
        let name = target.map(|t| self.graph.name(t).to_string()).unwrap_or_default();
        let attrs = target.map(|t| self.graph.attrs(t)).unwrap_or_default();
        let silent = self.config.silent || attrs.contains(TargetAttrs::SILENT);
        let ignore = self.config.ignore_errors || attrs.contains(TargetAttrs::IGNORE);
        let mut saving = false;

        for raw in commands {
            let expanded = self.expander.expand(raw, &name);
            if expanded.is_empty() {
                warn!("{} expands to empty string", raw);
                continue;
            }
            if saving {
                if save {
                    self.deferred.push(expanded);
                }
                continue;
            }
            if expanded == "..." {
                saving = true;
                continue;
            }
            if !self.run_line(&expanded, silent, ignore)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn run_line(&mut self, expanded: &str, silent: bool, ignore: bool) -> Result<bool> {
        let (prefixes, line) = split_prefixes(expanded);
        let silent = silent || (prefixes.silent && !self.config.loud);
        let err_check = !(ignore || prefixes.ignore);

        if self.config.no_execute && !prefixes.always {
            self.console.line(format_args!("{}", line))?;
            return Ok(true);
        }
        if !silent {
            self.console.line(format_args!("{}", line))?;
        }

        let status = match spawn_line(&self.shell, line, err_check)? {
            Some(pid) => wait_line(pid, || self.interrupted())?,
            None => JobStatus::Exited { code: 1 },
        };
        if status.success() {
            return Ok(true);
        }
        report_failure(&mut self.console, status, err_check, self.config.keep_going)
    }

    /// Acts on a terminating signal that cut a wait short: removes the
    /// target being built, runs `.INTERRUPT` for `SIGINT` and then dies by
    /// the signal. `SIGQUIT` turns into [`Error::Quit`] instead.
    fn interrupted(&mut self) -> Result<()> {
        let sig = match signals::TERMINATING.iter().copied().find(|&s| signals::take(s)) {
            Some(sig) => sig,
            None => return Ok(()),
        };
        debug!("compat interrupt: {}", sig);

        if let Some(current) = self.current.take() {
            if !self.graph.attrs(current).contains(TargetAttrs::PRECIOUS)
                && !self.config.no_execute
            {
                let path = self.graph.path(current);
                if fs::remove_file(&path).is_ok() {
                    self.console.line(format_args!("*** {} removed", path.display()))?;
                }
            }
        }

        if sig == Signal::SIGINT {
            if let Some(interrupt) = self.graph.special(Special::Interrupt) {
                self.run_commands(interrupt, false)?;
            }
        }
        if sig == Signal::SIGQUIT {
            return Err(Error::Quit);
        }
        signals::die_by(sig)
    }
}
