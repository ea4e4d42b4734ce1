use std::path::PathBuf;

use crate::job::JobFlags;

/// Description of the shell recipes are fed to.
///
/// `err_check` and `ign_err` are either plain commands (when the shell has
/// native error control) or `%s` templates wrapped around each command line
/// (when it does not).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shell {
    pub name: String,
    pub path: PathBuf,
    pub has_echo_ctl: bool,
    pub echo_off: String,
    pub echo_on: String,
    /// Output the shell produces for `echo_off` that must never reach the user.
    pub no_print: String,
    pub has_err_ctl: bool,
    pub err_check: String,
    pub ign_err: String,
    /// Flag that makes the shell echo commands as it reads them.
    pub echo: Option<String>,
    /// Flag that makes the shell exit on the first failing command.
    pub exit: Option<String>,
    /// Characters that force a command through the shell in compat mode.
    pub meta: Option<String>,
    pub builtins: Vec<String>,
}

const SH_META: &str = "#=|^(){};&<>*?[]:$`\\\n";

impl Shell {
    pub fn sh() -> Self {
        Self {
            name: "sh".into(),
            path: "/bin/sh".into(),
            has_echo_ctl: true,
            echo_off: "set -".into(),
            echo_on: "set -v".into(),
            no_print: "set -".into(),
            has_err_ctl: true,
            err_check: "set -e".into(),
            ign_err: "set +e".into(),
            echo: Some("v".into()),
            exit: Some("e".into()),
            meta: Some(SH_META.into()),
            builtins: [
                "alias", "cd", "eval", "exec", "exit", "read", "set", "ulimit", "unalias",
                "umask", "unset", "wait",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    pub fn ksh() -> Self {
        Self {
            name: "ksh".into(),
            path: "/bin/ksh".into(),
            builtins: [
                "alias", "cd", "eval", "exec", "exit", "read", "set", "typeset", "ulimit",
                "unalias", "umask", "unset", "wait",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ..Self::sh()
        }
    }

    /// csh has no way to toggle error checking, so `-` lines are wrapped in a
    /// sub-shell by the `ign_err` template.
    pub fn csh() -> Self {
        Self {
            name: "csh".into(),
            path: "/bin/csh".into(),
            has_echo_ctl: true,
            echo_off: "unset verbose".into(),
            echo_on: "set verbose".into(),
            no_print: "unset verbose".into(),
            has_err_ctl: false,
            err_check: "echo \"%s\"\n".into(),
            ign_err: "csh -c \"%s || exit 0\"\n".into(),
            echo: Some("v".into()),
            exit: Some("e".into()),
            meta: Some(SH_META.into()),
            builtins: Vec::new(),
        }
    }

    /// Looks a preset up by name or by the basename of a path.
    pub fn by_name(name: &str) -> Option<Self> {
        let base = name.rsplit('/').next().unwrap_or(name);
        let mut shell = match base {
            "sh" => Self::sh(),
            "ksh" => Self::ksh(),
            "csh" => Self::csh(),
            _ => return None,
        };
        if name.contains('/') {
            shell.path = name.into();
        }
        Some(shell)
    }

    /// Builds the argument vector used to run a job's command script.
    ///
    /// Bourne shells treat a second argument as a script to source, so when
    /// either flag lacks a leading `-` both are merged into a single word.
    pub fn argv(&self, flags: JobFlags) -> Vec<String> {
        let exit = self
            .exit
            .as_deref()
            .filter(|_| !flags.contains(JobFlags::IGNERR));
        let echo = self
            .echo
            .as_deref()
            .filter(|_| !flags.contains(JobFlags::SILENT));

        let mut argv = vec![self.name.clone()];
        let bare = |flag: Option<&str>| flag.map_or(false, |f| !f.starts_with('-'));
        if bare(self.exit.as_deref()) || bare(self.echo.as_deref()) {
            let merged = format!("-{}{}", exit.unwrap_or(""), echo.unwrap_or(""));
            if merged.len() > 1 {
                argv.push(merged);
            }
        } else {
            argv.extend(exit.map(str::to_string));
            argv.extend(echo.map(str::to_string));
        }
        argv
    }

    /// True when `line` can be executed directly, without a shell.
    pub fn is_simple(&self, line: &str) -> bool {
        if line.contains(['"', '\'']) {
            return false;
        }
        if let Some(meta) = &self.meta {
            if line.chars().any(|c| meta.contains(c)) {
                return false;
            }
        }
        match line.split_whitespace().next() {
            Some(word) => !self.builtins.iter().any(|b| b == word),
            None => false,
        }
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::sh()
    }
}

/// Substitutes `cmd` for the first `%s` of a shell template.
pub(crate) fn fill_template(template: &str, cmd: &str) -> String {
    let mut line = template.replacen("%s", cmd, 1);
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_bare_flags() {
        let sh = Shell::sh();
        assert_eq!(sh.argv(JobFlags::empty()), vec!["sh", "-ev"]);
        assert_eq!(sh.argv(JobFlags::IGNERR), vec!["sh", "-v"]);
        assert_eq!(sh.argv(JobFlags::SILENT), vec!["sh", "-e"]);
        assert_eq!(sh.argv(JobFlags::IGNERR | JobFlags::SILENT), vec!["sh"]);
    }

    #[test]
    fn keeps_dashed_flags_separate() {
        let shell = Shell {
            echo: Some("-v".into()),
            exit: Some("-e".into()),
            ..Shell::sh()
        };
        assert_eq!(shell.argv(JobFlags::empty()), vec!["sh", "-e", "-v"]);
        assert_eq!(shell.argv(JobFlags::IGNERR), vec!["sh", "-v"]);
    }

    #[test]
    fn simple_commands_skip_the_shell() {
        let sh = Shell::sh();
        assert!(sh.is_simple("cc -c foo.c"));
        assert!(!sh.is_simple("echo $HOME"));
        assert!(!sh.is_simple("cd /tmp"));
        assert!(!sh.is_simple("a && b"));
        assert!(!sh.is_simple("   "));
        assert!(!sh.is_simple("echo 'a b'"));
    }

    #[test]
    fn presets_by_name() {
        assert_eq!(Shell::by_name("csh").map(|s| s.has_err_ctl), Some(false));
        assert_eq!(
            Shell::by_name("/usr/local/bin/ksh").map(|s| s.path),
            Some(PathBuf::from("/usr/local/bin/ksh"))
        );
        assert!(Shell::by_name("fish").is_none());
        assert_eq!(fill_template("echo \"%s\"", "ls"), "echo \"ls\"\n");
    }
}
