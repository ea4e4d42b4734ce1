//! The scheduler's view of the dependency graph.
//!
//! Parsing, staleness checks and dependency ordering live elsewhere; the
//! scheduler only needs a target's name, recipe and attributes, a way to say
//! "this target is done", and a supply of targets that are ready to build.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::types::{Command, Recipe, TargetId};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TargetAttrs: u16 {
        /// `.IGNORE`: errors in the recipe are not fatal.
        const IGNORE = 0x001;
        /// `.SILENT`: commands are not echoed.
        const SILENT = 0x002;
        /// `.PRECIOUS`: never removed on interrupt.
        const PRECIOUS = 0x004;
        /// `.MAKE`: a recursive build, run even under `-n` and `-t`.
        const MAKE = 0x008;
        /// `.OPTIONAL`: missing and recipe-less is fine.
        const OPTIONAL = 0x010;
        /// `.JOIN`, `.USE` and friends: nothing on disk to touch or remove.
        const VIRTUAL = 0x020;
        /// Declared with a dependency operator (`:` `::` `!`).
        const OPERATOR = 0x040;
    }
}

/// Targets with a fixed role in every build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Special {
    Begin,
    End,
    Interrupt,
    Default,
}

impl Special {
    pub fn name(self) -> &'static str {
        match self {
            Special::Begin => ".BEGIN",
            Special::End => ".END",
            Special::Interrupt => ".INTERRUPT",
            Special::Default => ".DEFAULT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            ".BEGIN" => Some(Special::Begin),
            ".END" => Some(Special::End),
            ".INTERRUPT" => Some(Special::Interrupt),
            ".DEFAULT" => Some(Special::Default),
            _ => None,
        }
    }
}

/// Variable substitution applied to each command line before it runs.
pub trait Expander {
    fn expand(&self, command: &str, target: &str) -> String;
}

/// Leaves commands untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct Verbatim;

impl Expander for Verbatim {
    fn expand(&self, command: &str, _target: &str) -> String {
        command.to_string()
    }
}

pub trait Graph {
    fn name(&self, target: TargetId) -> &str;

    /// File the target stands for.
    fn path(&self, target: TargetId) -> PathBuf {
        PathBuf::from(self.name(target))
    }

    fn commands(&self, target: TargetId) -> &[Command];

    fn attrs(&self, target: TargetId) -> TargetAttrs;

    fn special(&self, kind: Special) -> Option<TargetId>;

    /// Returns the special target, creating an empty one if needed.
    fn special_or_create(&mut self, kind: Special) -> TargetId;

    fn push_command(&mut self, target: TargetId, command: Command);

    /// Gives a recipe-less target the `.DEFAULT` recipe. Returns false when
    /// there is no default recipe.
    fn use_default(&mut self, target: TargetId) -> bool {
        let default = match self.special(Special::Default) {
            Some(default) => default,
            None => return false,
        };
        let commands: Recipe = self.commands(default).to_vec();
        if commands.is_empty() {
            return false;
        }
        for command in commands {
            self.push_command(target, command);
        }
        true
    }

    fn exists(&self, target: TargetId) -> bool {
        self.path(target).exists()
    }

    /// The target was built; let whatever waits on it proceed.
    fn job_complete(&mut self, target: TargetId);

    /// The target could not be built.
    fn job_failed(&mut self, _target: TargetId) {}

    /// Next target whose prerequisites are all made.
    fn next_ready(&mut self) -> Option<TargetId>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Waiting,
    Ready,
    Started,
    Made,
    Failed,
}

#[derive(Debug)]
struct Node {
    name: String,
    path: Option<PathBuf>,
    commands: Recipe,
    attrs: TargetAttrs,
    state: NodeState,
    parents: Vec<TargetId>,
    unmade: usize,
}

/// A small graph held in memory: enough for a front end that is handed
/// its targets on the command line, and for tests.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    nodes: Vec<Node>,
    by_name: HashMap<String, TargetId>,
    specials: HashMap<Special, TargetId>,
    ready: VecDeque<TargetId>,
    completed: Vec<TargetId>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks a target up by name, adding it if it is new. New ordinary
    /// targets are ready until something makes them depend on another.
    pub fn target(&mut self, name: &str) -> TargetId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = TargetId(self.nodes.len());
        let special = Special::from_name(name);
        self.nodes.push(Node {
            name: name.to_string(),
            path: None,
            commands: Vec::new(),
            attrs: TargetAttrs::empty(),
            state: if special.is_some() {
                NodeState::Waiting
            } else {
                NodeState::Ready
            },
            parents: Vec::new(),
            unmade: 0,
        });
        self.by_name.insert(name.to_string(), id);
        match special {
            Some(kind) => {
                self.specials.insert(kind, id);
            }
            None => self.ready.push_back(id),
        }
        id
    }

    /// Adds a target with a recipe, declared with an operator.
    pub fn rule<I, S>(&mut self, name: &str, commands: I) -> TargetId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.target(name);
        self.nodes[id.0].attrs |= TargetAttrs::OPERATOR;
        for command in commands {
            self.push_command(id, command.into());
        }
        id
    }

    pub fn lookup(&self, name: &str) -> Option<TargetId> {
        self.by_name.get(name).copied()
    }

    pub fn set_attrs(&mut self, target: TargetId, attrs: TargetAttrs) {
        self.nodes[target.0].attrs |= attrs;
    }

    pub fn set_path(&mut self, target: TargetId, path: impl Into<PathBuf>) {
        self.nodes[target.0].path = Some(path.into());
    }

    /// Makes `parent` wait for `child`.
    pub fn depend(&mut self, parent: TargetId, child: TargetId) {
        self.nodes[child.0].parents.push(parent);
        if !matches!(self.nodes[child.0].state, NodeState::Made) {
            let node = &mut self.nodes[parent.0];
            node.unmade += 1;
            if node.state == NodeState::Ready {
                node.state = NodeState::Waiting;
                self.ready.retain(|&t| t != parent);
            }
        }
    }

    pub fn state(&self, target: TargetId) -> NodeState {
        self.nodes[target.0].state
    }

    /// Targets in the order they were reported complete.
    pub fn completed(&self) -> &[TargetId] {
        &self.completed
    }

    pub fn targets(&self) -> impl Iterator<Item = TargetId> + '_ {
        (0..self.nodes.len()).map(TargetId)
    }
}

impl Graph for MemoryGraph {
    fn name(&self, target: TargetId) -> &str {
        &self.nodes[target.0].name
    }

    fn path(&self, target: TargetId) -> PathBuf {
        let node = &self.nodes[target.0];
        node.path
            .clone()
            .unwrap_or_else(|| Path::new(&node.name).to_path_buf())
    }

    fn commands(&self, target: TargetId) -> &[Command] {
        &self.nodes[target.0].commands
    }

    fn attrs(&self, target: TargetId) -> TargetAttrs {
        self.nodes[target.0].attrs
    }

    fn special(&self, kind: Special) -> Option<TargetId> {
        self.specials.get(&kind).copied()
    }

    fn special_or_create(&mut self, kind: Special) -> TargetId {
        self.target(kind.name())
    }

    fn push_command(&mut self, target: TargetId, command: Command) {
        self.nodes[target.0].commands.push(command);
    }

    fn job_complete(&mut self, target: TargetId) {
        self.nodes[target.0].state = NodeState::Made;
        self.completed.push(target);
        let parents = self.nodes[target.0].parents.clone();
        for parent in parents {
            let node = &mut self.nodes[parent.0];
            node.unmade = node.unmade.saturating_sub(1);
            if node.unmade == 0 && node.state == NodeState::Waiting {
                node.state = NodeState::Ready;
                self.ready.push_back(parent);
            }
        }
    }

    fn job_failed(&mut self, target: TargetId) {
        self.nodes[target.0].state = NodeState::Failed;
    }

    fn next_ready(&mut self) -> Option<TargetId> {
        let target = self.ready.pop_front()?;
        self.nodes[target.0].state = NodeState::Started;
        Some(target)
    }
}
