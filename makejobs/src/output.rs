//! Collection of job output.
//!
//! A job's stdout and stderr are merged into one descriptor that is either a
//! pipe, drained line by line while the job runs, or a temporary file that is
//! replayed in one piece once the job has exited. Either way the shell's
//! echo-off noise is filtered out and a banner names the target whenever the
//! output switches from one target to another.

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::process::Stdio;
use std::rc::Rc;

use bytes::{BufMut, BytesMut};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::TargetId;

/// Size of the per-job line buffer. A line longer than this is flushed in
/// pieces rather than stalling the job.
pub const JOB_BUFSIZE: usize = 1024;

/// Where build output goes, plus the bookkeeping needed to label it.
pub struct Console {
    out: Box<dyn Write>,
    last: Option<TargetId>,
    banners: bool,
}

impl Console {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out,
            last: None,
            banners: true,
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn set_banners(&mut self, banners: bool) {
        self.banners = banners;
    }

    /// Prints `--- name ---` unless `target` was the last one heard from.
    pub fn banner(&mut self, target: TargetId, name: &str) -> io::Result<()> {
        if self.last != Some(target) {
            if self.banners {
                writeln!(self.out, "--- {} ---", name)?;
            }
            self.last = Some(target);
        }
        Ok(())
    }

    pub fn line(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.out.write_fmt(args)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)?;
        self.out.flush()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// An in-memory console sink that can be inspected after the fact.
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Labels passed down to a drain so it can print banners.
#[derive(Clone, Copy)]
pub struct Source<'a> {
    pub target: TargetId,
    pub name: &'a str,
    /// The active shell's `no_print` string.
    pub noise: &'a str,
}

pub enum OutputChannel {
    Pipe(PipeChannel),
    TempFile(TempFileChannel),
}

pub struct PipeChannel {
    reader: Option<File>,
    writer: Option<OwnedFd>,
    buf: BytesMut,
    eof: bool,
}

pub struct TempFileChannel {
    file: Option<NamedTempFile>,
}

impl OutputChannel {
    pub fn pipe() -> Result<Self> {
        let (reader, writer) = unistd::pipe().map_err(Error::Pipe)?;
        for fd in [&reader, &writer] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(Error::Pipe)?;
        }
        Ok(OutputChannel::Pipe(PipeChannel {
            reader: Some(File::from(reader)),
            writer: Some(writer),
            buf: BytesMut::with_capacity(JOB_BUFSIZE),
            eof: false,
        }))
    }

    pub fn temp_file() -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("make")
            .tempfile()
            .map_err(Error::TempFile)?;
        Ok(OutputChannel::TempFile(TempFileChannel { file: Some(file) }))
    }

    /// Stdout and stderr for the job's shell; both point at the same place.
    pub(crate) fn child_stdio(&self) -> io::Result<(Stdio, Stdio)> {
        match self {
            OutputChannel::Pipe(pipe) => {
                let writer = pipe
                    .writer
                    .as_ref()
                    .ok_or_else(|| io::Error::new(ErrorKind::BrokenPipe, "output pipe closed"))?;
                Ok((writer.try_clone()?.into(), writer.try_clone()?.into()))
            }
            OutputChannel::TempFile(tmp) => {
                let file = tmp
                    .file
                    .as_ref()
                    .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "output file gone"))?;
                Ok((file.as_file().try_clone()?.into(), file.as_file().try_clone()?.into()))
            }
        }
    }

    /// Drops our copy of the pipe's write end once the shell holds its own,
    /// so that the shell's exit shows up as end-of-file.
    pub(crate) fn spawned(&mut self) {
        if let OutputChannel::Pipe(pipe) = self {
            pipe.writer.take();
        }
    }

    /// Descriptor to watch for readiness; only open pipes are watched.
    pub fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            OutputChannel::Pipe(pipe) if !pipe.eof => pipe.reader.as_ref().map(|r| r.as_fd()),
            _ => None,
        }
    }

    /// True once every writer has gone away.
    pub fn at_eof(&self) -> bool {
        matches!(self, OutputChannel::Pipe(pipe) if pipe.eof)
    }

    /// Forwards whatever output is available. With `finish` the channel is
    /// read to its end: a pipe until EOF, a temp file in full.
    pub fn drain(
        &mut self,
        console: &mut Console,
        src: Source<'_>,
        finish: bool,
    ) -> io::Result<()> {
        match self {
            OutputChannel::Pipe(pipe) => pipe.drain(console, src, finish),
            OutputChannel::TempFile(tmp) if finish => tmp.replay(console, src),
            OutputChannel::TempFile(_) => Ok(()),
        }
    }

    /// Closes our copy of the write side and flushes everything that is left.
    pub fn close(&mut self, console: &mut Console, src: Source<'_>) -> io::Result<()> {
        match self {
            OutputChannel::Pipe(pipe) => {
                pipe.writer.take();
                pipe.drain(console, src, true)?;
                pipe.reader.take();
                Ok(())
            }
            OutputChannel::TempFile(tmp) => tmp.replay(console, src),
        }
    }
}

impl PipeChannel {
    fn drain(
        &mut self,
        console: &mut Console,
        src: Source<'_>,
        mut finish: bool,
    ) -> io::Result<()> {
        loop {
            let reader = match self.reader.as_mut() {
                Some(reader) if !self.eof => reader,
                _ => return Ok(()),
            };
            if !finish && !readable(reader.as_fd()) {
                return Ok(());
            }

            let mut chunk = [0u8; JOB_BUFSIZE];
            let room = JOB_BUFSIZE - self.buf.len();
            let nr = match reader.read(&mut chunk[..room]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("output pipe read: {}", e);
                    0
                }
            };

            // The job is gone: pretend we saw a newline so the tail gets out.
            if nr == 0 {
                self.eof = true;
                finish = false;
                if !self.buf.is_empty() {
                    self.buf.put_u8(b'\n');
                }
            }
            let fresh = self.buf.len();
            for b in chunk[..nr].iter_mut() {
                if *b == 0 {
                    *b = b' ';
                }
            }
            self.buf.extend_from_slice(&chunk[..nr]);

            let cut = match self.buf[fresh.saturating_sub(1)..].iter().rposition(|&b| b == b'\n') {
                Some(i) => Some(fresh.saturating_sub(1) + i + 1),
                None if self.buf.len() >= JOB_BUFSIZE => Some(self.buf.len()),
                None => None,
            };
            if let Some(cut) = cut {
                let lines = self.buf.split_to(cut);
                let (text, newline) = match lines.strip_suffix(b"\n") {
                    Some(text) => (text, true),
                    None => (&lines[..], false),
                };
                emit(console, src, text, newline)?;
            }

            if !finish {
                return Ok(());
            }
        }
    }
}

impl TempFileChannel {
    fn replay(&mut self, console: &mut Console, src: Source<'_>) -> io::Result<()> {
        let tmp = match self.file.take() {
            Some(tmp) => tmp,
            None => return Ok(()),
        };
        let mut reader = BufReader::new(File::open(tmp.path())?);
        console.line(format_args!("Results of making {}:", src.name))?;

        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            let (text, newline) = match line.strip_suffix(b"\n") {
                Some(text) => (text, true),
                None => (&line[..], false),
            };
            let mut kept = strip_noise(text, src.noise.as_bytes());
            if kept.is_empty() && !text.is_empty() {
                continue;
            }
            if newline {
                kept.push(b'\n');
            }
            console.write_bytes(&kept)?;
        }
        tmp.close()
    }
}

fn emit(console: &mut Console, src: Source<'_>, text: &[u8], newline: bool) -> io::Result<()> {
    let mut kept = strip_noise(text, src.noise.as_bytes());
    if kept.is_empty() {
        return Ok(());
    }
    if newline {
        kept.push(b'\n');
    }
    console.banner(src.target, src.name)?;
    console.write_bytes(&kept)
}

fn readable(fd: BorrowedFd<'_>) -> bool {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(n) if n > 0 => fds[0]
            .revents()
            .map_or(false, |r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)),
        _ => false,
    }
}

/// Removes every occurrence of `noise` from `text`, along with the character
/// that follows it and any whitespace after that.
pub fn strip_noise(text: &[u8], noise: &[u8]) -> Vec<u8> {
    if noise.is_empty() {
        return text.to_vec();
    }
    let mut out = Vec::with_capacity(text.len());
    let mut cp = 0;
    while let Some(pos) = find(&text[cp..], noise) {
        out.extend_from_slice(&text[cp..cp + pos]);
        cp += pos + noise.len();
        if cp >= text.len() {
            return out;
        }
        cp += 1;
        while cp < text.len() && matches!(text[cp], b' ' | b'\t' | b'\n') {
            cp += 1;
        }
    }
    out.extend_from_slice(&text[cp..]);
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
