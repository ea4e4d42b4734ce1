//! Turns a target's recipe into the script its shell reads on stdin.

use crate::graph::Expander;
use crate::job::JobFlags;
use crate::shell::{fill_template, Shell};
use crate::types::Recipe;

/// The result of scanning a recipe.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Script {
    /// Shell input, control directives included.
    pub text: String,
    /// Number of recipe lines that made it into `text`. Zero means there is
    /// nothing to run.
    pub commands: usize,
    /// Raw commands found after a `...` line.
    pub deferred: Recipe,
    /// Expanded `+` lines pulled out while not executing; the caller runs
    /// them one by one.
    pub forced: Vec<String>,
}

/// Per-line prefixes: `@` silences, `-` ignores errors, `+` runs even under
/// `-n`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Prefixes {
    pub silent: bool,
    pub ignore: bool,
    pub always: bool,
}

/// Splits the `@-+` prefixes (and following whitespace) off a command line.
pub fn split_prefixes(line: &str) -> (Prefixes, &str) {
    let mut prefixes = Prefixes::default();
    let rest = line.trim_start_matches(|c| match c {
        '@' => {
            prefixes.silent = true;
            true
        }
        '-' => {
            prefixes.ignore = true;
            true
        }
        '+' => {
            prefixes.always = true;
            true
        }
        _ => false,
    });
    (prefixes, rest.trim_start())
}

pub struct ScriptBuilder<'a, E: ?Sized> {
    shell: &'a Shell,
    expander: &'a E,
    flags: JobFlags,
    /// Building for display under `-n`: no control directives, `+` lines
    /// are split out.
    dry_run: bool,
    loud: bool,
}

impl<'a, E: Expander + ?Sized> ScriptBuilder<'a, E> {
    pub fn new(shell: &'a Shell, expander: &'a E, flags: JobFlags) -> Self {
        Self {
            shell,
            expander,
            flags,
            dry_run: false,
            loud: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn loud(mut self, loud: bool) -> Self {
        self.loud = loud;
        self
    }

    pub fn build(&self, target: &str, recipe: &[String]) -> Script {
        let mut script = Script::default();
        for (i, raw) in recipe.iter().enumerate() {
            if raw == "..." {
                if !self.flags.contains(JobFlags::IGNDOTS) {
                    script.deferred = recipe[i + 1..].to_vec();
                    break;
                }
                continue;
            }
            script.commands += 1;
            let expanded = self.expander.expand(raw, target);
            let (prefixes, cmd) = split_prefixes(&expanded);
            if prefixes.always && self.dry_run {
                script.forced.push(expanded.clone());
                continue;
            }
            self.emit(&mut script.text, prefixes, cmd);
        }
        script
    }

    fn emit(&self, out: &mut String, prefixes: Prefixes, cmd: &str) {
        let shell = self.shell;
        let job_silent = self.flags.contains(JobFlags::SILENT);
        let specials = !self.dry_run;
        let mut line = |s: &str| {
            out.push_str(s);
            if !s.ends_with('\n') {
                out.push('\n');
            }
        };

        let mut shut_up = prefixes.silent && !self.loud;
        if shut_up {
            if !job_silent && specials && shell.has_echo_ctl {
                line(&shell.echo_off);
            } else {
                shut_up = false;
            }
        }

        let mut template: Option<&str> = None;
        let mut err_off = prefixes.ignore && !self.flags.contains(JobFlags::IGNERR) && specials;
        if err_off {
            if shell.has_err_ctl {
                if !job_silent && !shut_up && shell.has_echo_ctl {
                    line(&shell.echo_off);
                    line(&shell.ign_err);
                    line(&shell.echo_on);
                } else {
                    line(&shell.ign_err);
                }
            } else if !shell.ign_err.is_empty() {
                // No native error control: echo through the check template
                // and run the command inside the ignore template.
                if !job_silent && !shut_up && shell.has_echo_ctl {
                    line(&shell.echo_off);
                    line(&fill_template(&shell.err_check, cmd));
                    shut_up = true;
                }
                template = Some(shell.ign_err.as_str());
                err_off = false;
            } else {
                err_off = false;
            }
        }

        match template {
            Some(t) => line(&fill_template(t, cmd)),
            None => line(cmd),
        }

        if err_off {
            if !shut_up && !job_silent && shell.has_echo_ctl {
                line(&shell.echo_off);
                shut_up = true;
            }
            line(&shell.err_check);
        }
        if shut_up {
            line(&shell.echo_on);
        }
    }
}
