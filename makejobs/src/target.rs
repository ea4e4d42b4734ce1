//! Per-target steps that never start a shell.

use std::fs::OpenOptions;
use std::time::SystemTime;

use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::{Graph, TargetAttrs};
use crate::output::Console;
use crate::types::TargetId;

/// Makes sure a target has some way of being built.
///
/// A target declared without an operator and without commands borrows the
/// `.DEFAULT` recipe; failing that it must already exist. Returns false when
/// the target cannot be built but the run may go on.
pub fn check_commands<G: Graph + ?Sized>(
    graph: &mut G,
    console: &mut Console,
    config: &Config,
    target: TargetId,
) -> Result<bool> {
    let attrs = graph.attrs(target);
    if attrs.contains(TargetAttrs::OPERATOR) || !graph.commands(target).is_empty() {
        return Ok(true);
    }
    if graph.use_default(target) || graph.exists(target) {
        return Ok(true);
    }

    let name = graph.name(target).to_string();
    if attrs.contains(TargetAttrs::OPTIONAL) {
        console.line(format_args!("don't know how to make {} (ignored)", name))?;
        Ok(true)
    } else if config.keep_going {
        console.line(format_args!("don't know how to make {} (continuing)", name))?;
        Ok(false)
    } else if name == "love" {
        Err(Error::NotWar)
    } else {
        Err(Error::NoRecipe(name))
    }
}

/// Brings a target's modification time up to now, creating the file if
/// needed. Virtual targets have no file and are left alone.
pub fn touch<G: Graph + ?Sized>(
    graph: &G,
    console: &mut Console,
    config: &Config,
    target: TargetId,
    silent: bool,
) -> Result<()> {
    if graph
        .attrs(target)
        .intersects(TargetAttrs::VIRTUAL | TargetAttrs::OPTIONAL)
    {
        return Ok(());
    }
    if !silent {
        console.line(format_args!("touch {}", graph.name(target)))?;
    }
    if config.no_execute {
        return Ok(());
    }

    let path = graph.path(target);
    let touched = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(e) = touched {
        console.line(format_args!("*** couldn't touch {}: {}", path.display(), e))?;
    } else {
        debug!(path = %path.display(), "touched");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::output::SharedBuffer;

    fn console() -> (Console, SharedBuffer) {
        let buf = SharedBuffer::default();
        (Console::new(Box::new(buf.clone())), buf)
    }

    #[test]
    fn unknown_targets() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = MemoryGraph::new();
        let missing = g.target("missing");
        g.set_path(missing, dir.path().join("missing"));
        let (mut con, buf) = console();

        let err = check_commands(&mut g, &mut con, &Config::default(), missing).unwrap_err();
        assert!(matches!(err, Error::NoRecipe(ref n) if n == "missing"));

        let keep_going = Config {
            keep_going: true,
            ..Config::default()
        };
        assert!(!check_commands(&mut g, &mut con, &keep_going, missing).unwrap());
        assert_eq!(buf.contents(), "don't know how to make missing (continuing)\n");

        let love = g.target("love");
        g.set_path(love, dir.path().join("love"));
        assert!(matches!(
            check_commands(&mut g, &mut con, &Config::default(), love),
            Err(Error::NotWar)
        ));
    }

    #[test]
    fn existing_sources_and_defaults_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = MemoryGraph::new();
        let src = g.target("main.c");
        let path = dir.path().join("main.c");
        std::fs::write(&path, "").unwrap();
        g.set_path(src, &path);
        let (mut con, _) = console();
        assert!(check_commands(&mut g, &mut con, &Config::default(), src).unwrap());

        g.rule(".DEFAULT", ["echo fallback"]);
        let other = g.target("other");
        g.set_path(other, dir.path().join("other"));
        assert!(check_commands(&mut g, &mut con, &Config::default(), other).unwrap());
        assert_eq!(g.commands(other), ["echo fallback".to_string()]);
    }

    #[test]
    fn touch_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = MemoryGraph::new();
        let t = g.rule("stamp", ["false"]);
        g.set_path(t, dir.path().join("stamp"));
        let (mut con, buf) = console();

        touch(&g, &mut con, &Config::default(), t, false).unwrap();
        assert!(dir.path().join("stamp").exists());
        assert_eq!(buf.contents(), "touch stamp\n");

        let v = g.rule("phony", Vec::<String>::new());
        g.set_attrs(v, TargetAttrs::VIRTUAL);
        touch(&g, &mut con, &Config::default(), v, false).unwrap();
        assert_eq!(buf.contents(), "touch stamp\n");
    }
}
