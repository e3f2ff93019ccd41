//! Seam between the detectors and the symbolic execution engine.
//!
//! Detectors only see what is defined here: hook phases, state views, frames,
//! the explored state space and the constraint oracle. [`explorer::Explorer`]
//! is the engine shipped with the crate.

pub mod disasm;
pub mod explorer;
pub mod memory;
pub mod opcode;
pub mod oracle;
pub mod storage;
pub mod value;

pub use disasm::{Disassembly, Instruction};
pub use explorer::Explorer;
pub use memory::Memory;
pub use opcode::Opcode;
pub use oracle::{ConstraintOracle, OracleError, Query, Satisfiability, StructuralOracle};
pub use storage::{StaticStorage, StorageReader};
pub use value::{Constraint, StackValue, Term, Word};

use anyhow::Result;
use std::rc::Rc;

use crate::config::Target;
use crate::error::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPhase {
    /// Before the hooked instruction executes.
    Pre,
    /// After the hooked instruction executed, on the successor state.
    Post,
}

/// An executed instruction and the stack it executed on.
#[derive(Debug, Clone)]
pub struct Frame {
    pub instruction: Instruction,
    pub stack: Vec<Rc<StackValue>>,
}

impl Frame {
    /// Stack item `depth` positions below the top.
    pub fn peek(&self, depth: usize) -> Result<&Rc<StackValue>, AnalysisError> {
        peek(&self.stack, depth, &self.instruction)
    }
}

/// Read-only view of one explored state. Annotations of its stack values can
/// still be changed.
#[derive(Debug, Clone, Copy)]
pub struct StateView<'a> {
    pub instruction: &'a Instruction,
    pub stack: &'a [Rc<StackValue>],
    pub memory: &'a Memory,
    pub function_name: &'a str,
    pub constraints: &'a [Constraint],
}

impl<'a> StateView<'a> {
    pub fn opcode(&self) -> Opcode {
        self.instruction.opcode
    }

    /// Stack item `depth` positions below the top.
    pub fn peek(&self, depth: usize) -> Result<&'a Rc<StackValue>, AnalysisError> {
        peek(self.stack, depth, self.instruction)
    }
}

fn peek<'s>(
    stack: &'s [Rc<StackValue>],
    depth: usize,
    instruction: &Instruction,
) -> Result<&'s Rc<StackValue>, AnalysisError> {
    stack
        .len()
        .checked_sub(depth + 1)
        .map(|i| &stack[i])
        .ok_or_else(|| AnalysisError::StackUnderflow {
            opcode: instruction.opcode.name(),
            address: instruction.address,
            required: depth + 1,
            actual: stack.len(),
        })
}

/// What a hook callback receives.
#[derive(Debug, Clone, Copy)]
pub struct HookEvent<'a> {
    pub phase: HookPhase,
    pub state: StateView<'a>,
    /// Pre hooks: the previous instruction of the same block, if any.
    /// Post hooks: the hooked instruction itself.
    pub previous: Option<&'a Frame>,
}

/// Receives hook invocations for registered subscribers.
pub trait HookDispatcher {
    fn dispatch(&mut self, subscriber: usize, event: &HookEvent<'_>) -> Result<()>;
}

/// Symbolic execution engine as consumed by the orchestrator.
pub trait SymbolicEngine {
    /// Registers `subscriber` for `opcode` in `phase`. Several subscribers may
    /// share an opcode.
    fn register_hook(&mut self, phase: HookPhase, opcode: Opcode, subscriber: usize);

    fn clear_hooks(&mut self);

    /// Explores every feasible path of `target`, calling hooks in visit order.
    fn explore(&mut self, target: &Target, dispatcher: &mut dyn HookDispatcher) -> Result<StateSpace>;
}

/// A basic block as visited along one path.
#[derive(Debug, Clone)]
pub struct Node {
    pub uid: usize,
    pub function_name: String,
    pub start_address: usize,
    pub frames: Vec<Frame>,
    /// Path constraints at block entry.
    pub constraints: Vec<Constraint>,
}

impl Node {
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.frames.iter().map(|f| &f.instruction)
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.instructions().any(|i| i.opcode == opcode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Jump,
    Conditional(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub kind: EdgeKind,
}

/// Nodes and edges produced by one exploration. `complete` is false when a
/// limit cut exploration short.
#[derive(Debug, Clone, Default)]
pub struct StateSpace {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub complete: bool,
}

impl StateSpace {
    pub fn add_node(&mut self, function_name: &str, start_address: usize, constraints: &[Constraint]) -> usize {
        let uid = self.nodes.len();
        self.nodes.push(Node {
            uid,
            function_name: function_name.to_string(),
            start_address,
            frames: Vec::new(),
            constraints: constraints.to_vec(),
        });
        uid
    }

    pub fn add_edge(&mut self, from: usize, to: usize, kind: EdgeKind) {
        self.edges.push(Edge { from, to, kind });
    }

    /// Nodes reachable from `uid` through one edge.
    pub fn successors(&self, uid: usize) -> impl Iterator<Item = &Node> {
        self.edges
            .iter()
            .filter(move |e| e.from == uid)
            .filter_map(move |e| self.nodes.get(e.to))
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.iter().map(|n| n.function_name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}
