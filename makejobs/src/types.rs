use std::fmt;

/// Handle to a target owned by the external dependency graph.
///
/// The scheduler never owns targets; it only refers to them by id and asks the
/// [`Graph`](crate::graph::Graph) for their name, recipe and attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub usize);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type Command = String;
pub type Recipe = Vec<Command>;

/// Environment variable carrying the path of the shared job-token FIFO.
pub const JOBS_FIFO_VAR: &str = "MAKE_JOBS_FIFO";
