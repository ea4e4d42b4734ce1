//! Process-wide setup and one-shot commands.

use std::env;
use std::process::{Command, Stdio};

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tracing::debug;

use crate::error::{Error, Result};
use crate::shell::Shell;

/// Environment variable counting nested builds.
pub const MAKE_LEVEL_VAR: &str = "__MKLVL__";

/// Deepest nesting allowed before giving up on a runaway recursion.
pub const MAX_MAKE_LEVEL: u32 = 500;

/// Level to export for builds started by this one, given the inherited
/// value.
pub fn next_make_level(inherited: Option<&str>) -> Result<u32> {
    let level = match inherited {
        None => 0,
        Some(value) => value
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::BadRecursionLevel(value.to_string()))?,
    };
    if level > MAX_MAKE_LEVEL {
        return Err(Error::RecursionLimit(MAX_MAKE_LEVEL));
    }
    Ok(level + 1)
}

/// Bumps the recursion level in our environment, refusing to go deeper
/// than [`MAX_MAKE_LEVEL`].
pub fn check_make_level() -> Result<u32> {
    let inherited = env::var(MAKE_LEVEL_VAR).ok();
    let next = next_make_level(inherited.as_deref())?;
    env::set_var(MAKE_LEVEL_VAR, next.to_string());
    Ok(next)
}

/// Raises the soft open-file limit to the hard limit; every running job
/// costs a few descriptors.
pub fn raise_nofile_limit() -> Result<()> {
    let (_soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    setrlimit(Resource::RLIMIT_NOFILE, hard, hard)?;
    debug!(limit = hard, "raised open file limit");
    Ok(())
}

/// Everything a build process does before it starts any job.
pub fn init() -> Result<()> {
    check_make_level()?;
    raise_nofile_limit()
}

/// Runs `cmd` through the shell and returns what it printed on stdout,
/// newlines folded into spaces and the final one dropped. Stderr passes
/// straight through.
pub fn cmd_exec(shell: &Shell, cmd: &str) -> Result<String> {
    let output = Command::new(&shell.path)
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::inherit())
        .stderr(Stdio::inherit())
        .output()
        .map_err(|source| Error::Spawn {
            shell: shell.path.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(Error::CommandStatus(cmd.to_string()));
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(text.replace('\n', " "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_level_counts_up() {
        assert_eq!(next_make_level(None).unwrap(), 1);
        assert_eq!(next_make_level(Some("7")).unwrap(), 8);
        assert!(matches!(
            next_make_level(Some("-1")),
            Err(Error::BadRecursionLevel(_))
        ));
        assert!(matches!(
            next_make_level(Some("501")),
            Err(Error::RecursionLimit(500))
        ));
    }

    #[test]
    fn cmd_exec_folds_lines() {
        let _lock = crate::test_lock();
        let sh = Shell::sh();
        assert_eq!(cmd_exec(&sh, "echo a; echo b").unwrap(), "a b");
        assert!(matches!(cmd_exec(&sh, "exit 3"), Err(Error::CommandStatus(_))));
    }
}
