use clap::Parser;

/// Build targets given on the command line, several at a time
#[derive(Debug, Parser)]
#[clap(name = "mkjobs", version)]
pub struct ArgParser {
    /// Number of jobs to run at once
    #[clap(short = 'j', long = "jobs", env = "MAKE_JOBS")]
    pub jobs: Option<usize>,

    /// Keep building unrelated targets after an error
    #[clap(short = 'k', long = "keep-going")]
    pub keep_going: bool,

    /// Print commands instead of running them
    #[clap(short = 'n', long = "just-print")]
    pub no_execute: bool,

    /// Touch targets instead of building them
    #[clap(short = 't', long)]
    pub touch: bool,

    /// Ignore errors from every command
    #[clap(short = 'i', long = "ignore-errors")]
    pub ignore_errors: bool,

    /// Don't echo commands
    #[clap(short = 's', long)]
    pub silent: bool,

    /// Label output with the target that produced it
    #[clap(short = 'v', long)]
    pub verbose: bool,

    /// Run one shell per command, one target at a time
    #[clap(short = 'B', long)]
    pub compat: bool,

    /// Collect job output in temp files instead of pipes
    #[clap(short = 'P', long = "no-pipes")]
    pub no_pipes: bool,

    /// Debug flags: j = job completions and tracing, l = echo every command
    #[clap(short = 'd', long = "debug")]
    pub debug: Option<String>,

    /// Shell to run recipes with (sh, ksh, csh or a path ending in one)
    #[clap(long, default_value = "sh")]
    pub shell: String,

    /// Command for .BEGIN
    #[clap(long)]
    pub begin: Vec<String>,

    /// Command for .END
    #[clap(long)]
    pub end: Vec<String>,

    /// Command for .INTERRUPT
    #[clap(long)]
    pub interrupt: Vec<String>,

    /// Command for .DEFAULT
    #[clap(long = "default")]
    pub default: Vec<String>,

    /// Target that is never removed on interrupt
    #[clap(long)]
    pub precious: Vec<String>,

    /// Variable definition: NAME=VALUE, or NAME!=COMMAND to take the
    /// command's output
    #[clap(short = 'D', long = "define", parse(try_from_str = var_def))]
    pub defines: Vec<Define>,

    /// Recipe lines as TARGET=COMMAND; repeating a target appends a line
    #[clap(parse(try_from_str = target_eq_cmd))]
    pub recipes: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Define {
    Value(String, String),
    Shell(String, String),
}

impl ArgParser {
    pub fn debug_flag(&self, flag: char) -> bool {
        self.debug.as_deref().map_or(false, |d| d.contains(flag))
    }
}

/// try_from_str parse function for variable definitions
fn var_def(s: &str) -> Result<Define, String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| "Required format is NAME=VALUE or NAME!=COMMAND".to_string())?;
    let (name, run) = match name.strip_suffix('!') {
        Some(name) => (name, true),
        None => (name, false),
    };
    if name.is_empty() {
        return Err("Variable name is empty".to_string());
    }
    Ok(if run {
        Define::Shell(name.to_string(), value.to_string())
    } else {
        Define::Value(name.to_string(), value.to_string())
    })
}

/// try_from_str parse function for recipe lines
fn target_eq_cmd(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((target, cmd)) if !target.is_empty() => Ok((target.to_string(), cmd.to_string())),
        _ => Err("Required format is TARGET=COMMAND".to_string()),
    }
}
