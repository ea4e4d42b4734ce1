use std::collections::HashMap;
use std::env;
use std::error;

use makejobs::{
    proc, signals, CompatRunner, Config, Error, Expander, MemoryGraph, Scheduler, Shell,
    TargetAttrs, JOBS_FIFO_VAR,
};
use tracing::debug;

use crate::arg_parser::{ArgParser, Define};

/// Exit status for a build that stopped on `SIGQUIT` in compat mode.
const QUIT_STATUS: i32 = 2;

/// Substitutes `$(NAME)`, `${NAME}`, `$@` and `$$` in command lines.
/// Unknown variables expand to nothing.
#[derive(Debug, Default)]
pub struct Vars {
    vars: HashMap<String, String>,
}

impl Vars {
    pub fn set(&mut self, name: &str, value: String) {
        self.vars.insert(name.to_string(), value);
    }
}

impl Expander for Vars {
    fn expand(&self, command: &str, target: &str) -> String {
        let mut out = String::with_capacity(command.len());
        let mut rest = command;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            rest = &rest[pos + 1..];
            let close = match rest.chars().next() {
                Some('@') => {
                    out.push_str(target);
                    rest = &rest[1..];
                    continue;
                }
                Some('$') => {
                    out.push('$');
                    rest = &rest[1..];
                    continue;
                }
                Some('(') => ')',
                Some('{') => '}',
                _ => {
                    out.push('$');
                    continue;
                }
            };
            match rest.find(close) {
                Some(end) => {
                    if let Some(value) = self.vars.get(&rest[1..end]) {
                        out.push_str(value);
                    }
                    rest = &rest[end + 1..];
                }
                None => {
                    out.push('$');
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// One invocation of the tool: the parsed arguments turned into a graph,
/// a configuration and a shell, then built.
pub struct Session {
    args: ArgParser,
    shell: Shell,
}

impl Session {
    pub fn new(args: ArgParser) -> Result<Self, Box<dyn error::Error>> {
        let shell = Shell::by_name(&args.shell)
            .ok_or_else(|| format!("{}: unknown shell", args.shell))?;
        Ok(Self { args, shell })
    }

    /// Without `-j` and outside a parallel parent build, targets are made
    /// the old way.
    fn compat(&self) -> bool {
        self.args.compat || (self.args.jobs.is_none() && env::var_os(JOBS_FIFO_VAR).is_none())
    }

    fn config(&self) -> Config {
        Config {
            max_jobs: self.args.jobs.unwrap_or(1).max(1),
            keep_going: self.args.keep_going,
            no_execute: self.args.no_execute,
            touch: self.args.touch,
            use_pipes: !self.args.no_pipes,
            verbose: self.args.verbose,
            debug_jobs: self.args.debug_flag('j'),
            loud: self.args.debug_flag('l'),
            ignore_errors: self.args.ignore_errors,
            silent: self.args.silent,
            compat: self.compat(),
        }
    }

    fn graph(&self) -> MemoryGraph {
        let mut g = MemoryGraph::new();
        let hooks = [
            (".BEGIN", &self.args.begin),
            (".END", &self.args.end),
            (".INTERRUPT", &self.args.interrupt),
            (".DEFAULT", &self.args.default),
        ];
        for (name, commands) in hooks {
            if !commands.is_empty() {
                g.rule(name, commands.iter().cloned());
            }
        }
        for (target, command) in &self.args.recipes {
            g.rule(target, [command.clone()]);
        }
        for name in &self.args.precious {
            let t = g.target(name);
            g.set_attrs(t, TargetAttrs::PRECIOUS);
        }
        g
    }

    fn vars(&self) -> makejobs::Result<Vars> {
        let mut vars = Vars::default();
        for define in &self.args.defines {
            match define {
                Define::Value(name, value) => vars.set(name, value.clone()),
                Define::Shell(name, command) => {
                    let command = vars.expand(command, "");
                    let value = proc::cmd_exec(&self.shell, &command)?;
                    vars.set(name, value);
                }
            }
        }
        Ok(vars)
    }

    /// Builds everything and returns the process exit status.
    pub fn run(self) -> Result<i32, Box<dyn error::Error>> {
        proc::init()?;
        let config = self.config();
        signals::install(config.compat)?;
        let vars = self.vars()?;
        let graph = self.graph();
        debug!(?config, shell = %self.shell.name, "starting build");

        let errors = if config.compat {
            let mut runner = CompatRunner::new(graph, config)
                .with_shell(self.shell)
                .with_expander(vars);
            match runner.run() {
                Ok(errors) => errors,
                Err(Error::Quit) => return Ok(QUIT_STATUS),
                Err(e) => return Err(e.into()),
            }
        } else {
            let mut scheduler = Scheduler::new(graph, config)?
                .with_shell(self.shell)
                .with_expander(vars);
            if let Err(e) = scheduler.begin().and_then(|_| scheduler.run()) {
                scheduler.abort_all();
                return Err(e.into());
            }
            scheduler.finish()?
        };
        Ok(if errors > 0 { 1 } else { 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Vars {
        let mut vars = Vars::default();
        vars.set("CC", "cc".to_string());
        vars
    }

    #[test]
    fn expands_variables() {
        let v = vars();
        assert_eq!(v.expand("$(CC) -o $@ ${CC}.c", "prog"), "cc -o prog cc.c");
        assert_eq!(v.expand("echo $$HOME $(NOPE)x", "t"), "echo $HOME x");
        assert_eq!(v.expand("cost $5 $(open", "t"), "cost $5 $(open");
    }

    #[test]
    fn builds_the_graph() {
        let args = <ArgParser as clap::Parser>::try_parse_from([
            "mkjobs",
            "--end",
            "echo bye",
            "--precious",
            "all",
            "all=echo one",
            "all=echo two",
        ])
        .unwrap();
        let session = Session::new(args).unwrap();
        let g = session.graph();
        let all = g.lookup("all").unwrap();
        let end = g.lookup(".END").unwrap();
        use makejobs::Graph;
        assert_eq!(g.commands(all), ["echo one", "echo two"]);
        assert_eq!(g.commands(end), ["echo bye"]);
        assert!(g.attrs(all).contains(TargetAttrs::PRECIOUS));
    }

    #[test]
    fn unknown_shell() {
        let args =
            <ArgParser as clap::Parser>::try_parse_from(["mkjobs", "--shell", "fish"]).unwrap();
        assert!(Session::new(args).is_err());
    }
}
