use std::{io, path::PathBuf, result};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot fork {shell}: {source}")]
    Spawn {
        shell: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot create pipe: {0}")]
    Pipe(#[source] nix::Error),
    #[error("cannot create temp file: {0}")]
    TempFile(#[source] io::Error),
    #[error("error in wait: {0}")]
    Wait(#[source] nix::Error),
    #[error("job fifo {path}: {source}")]
    Fifo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("don't know how to make {0}. Stop")]
    NoRecipe(String),
    #[error("Not war.")]
    NotWar,
    #[error("invalid value for recursion level ({0})")]
    BadRecursionLevel(String),
    #[error("max recursion level ({0}) exceeded")]
    RecursionLimit(u32),
    #[error("quit")]
    Quit,
    #[error("\"{0}\" returned non-zero status")]
    CommandStatus(String),
    #[error(transparent)]
    Sys(#[from] nix::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = result::Result<T, Error>;
