//! Depth-first symbolic explorer for EVM bytecode.
//!
//! Each path carries its own stack, memory, storage and constraints. A `JUMPI`
//! on a symbolic condition forks the path; concrete conditions follow a single
//! branch. Paths are bounded by the exploration timeout, a block depth limit and
//! a per-edge loop bound. Results of arithmetic, comparison and hashing carry the
//! union of their inputs' annotations; fresh reads (environment, calldata,
//! storage) start clean.

use alloy_primitives::{keccak256, U256};
use anyhow::Result;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::disasm::{Disassembly, Instruction};
use super::memory::{Memory, MEMORY_LIMIT};
use super::opcode::Opcode;
use super::value::{to_usize, Constraint, StackValue, Term, Word};
use super::{EdgeKind, Frame, HookDispatcher, HookEvent, HookPhase, StateSpace, StateView, SymbolicEngine};
use crate::analyzers::annotation::AnnotationSet;
use crate::config::{AnalysisConfig, Target};

/// Function name of paths through creation code.
pub const CONSTRUCTOR: &str = "constructor";
/// Function name of message-call paths before any selector matched.
pub const FALLBACK: &str = "fallback";

const STACK_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
pub struct Limits {
    pub timeout: Duration,
    pub max_depth: usize,
    pub loop_bound: usize,
}

impl From<&AnalysisConfig> for Limits {
    fn from(config: &AnalysisConfig) -> Self {
        Limits {
            timeout: config.timeout(),
            max_depth: config.max_depth,
            loop_bound: config.loop_bound,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits::from(&AnalysisConfig::default())
    }
}

pub struct Explorer {
    limits: Limits,
    hooks: HashMap<(HookPhase, Opcode), Vec<usize>>,
    opaque_ids: usize,
}

#[derive(Debug, Clone)]
struct Path {
    pc: usize,
    stack: Vec<Rc<StackValue>>,
    memory: Memory,
    storage: HashMap<Word, Rc<StackValue>>,
    constraints: Vec<Constraint>,
    function_name: String,
    depth: usize,
    edge_visits: HashMap<(usize, usize), usize>,
    node: usize,
    last_frame: Option<Frame>,
}

enum Flow {
    Next,
    Jump(Rc<StackValue>),
    Branch {
        destination: Rc<StackValue>,
        condition: Rc<StackValue>,
    },
    /// Carries the returned bytes when they are concrete.
    Halt(Option<Vec<u8>>),
}

enum Step {
    Continue,
    Halted(Option<Vec<u8>>),
    Dropped,
}

impl Path {
    fn new(function_name: &str, node: usize) -> Self {
        Path {
            pc: 0,
            stack: Vec::new(),
            memory: Memory::new(),
            storage: HashMap::new(),
            constraints: Vec::new(),
            function_name: function_name.to_string(),
            depth: 0,
            edge_visits: HashMap::new(),
            node,
            last_frame: None,
        }
    }

    fn view<'a>(&'a self, instruction: &'a Instruction) -> StateView<'a> {
        StateView {
            instruction,
            stack: &self.stack,
            memory: &self.memory,
            function_name: &self.function_name,
            constraints: &self.constraints,
        }
    }

    /// Copy of the path whose values carry their own annotation sets. Values
    /// shared inside the path stay shared inside the copy.
    fn fork(&self) -> Path {
        let mut copies: HashMap<*const StackValue, Rc<StackValue>> = HashMap::new();
        let mut detach = |value: &Rc<StackValue>| {
            copies
                .entry(Rc::as_ptr(value))
                .or_insert_with(|| Rc::new(value.detached()))
                .clone()
        };

        let stack = self.stack.iter().map(&mut detach).collect();
        let mut memory = self.memory.clone();
        memory.remap(&mut detach);
        let storage = self
            .storage
            .iter()
            .map(|(slot, value)| (slot.clone(), detach(value)))
            .collect();

        Path {
            pc: self.pc,
            stack,
            memory,
            storage,
            constraints: self.constraints.clone(),
            function_name: self.function_name.clone(),
            depth: self.depth,
            edge_visits: self.edge_visits.clone(),
            node: self.node,
            last_frame: None,
        }
    }
}

impl Explorer {
    pub fn new(limits: Limits) -> Self {
        Explorer {
            limits,
            hooks: HashMap::new(),
            opaque_ids: 0,
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(Limits::from(config))
    }

    fn transaction(
        &mut self,
        code: &Disassembly,
        entry: &str,
        creation: bool,
        started: Instant,
        space: &mut StateSpace,
        dispatcher: &mut dyn HookDispatcher,
    ) -> Result<Option<Vec<u8>>> {
        let root = space.add_node(entry, 0, &[]);
        let mut worklist = vec![Path::new(entry, root)];
        let mut returned = None;

        while let Some(mut path) = worklist.pop() {
            loop {
                if started.elapsed() >= self.limits.timeout {
                    warn!(
                        "Exploration timed out after {:?}; findings cover explored paths only",
                        self.limits.timeout
                    );
                    space.complete = false;
                    return Ok(returned);
                }
                match self.step(code, &mut path, space, dispatcher, &mut worklist)? {
                    Step::Continue => {}
                    Step::Halted(data) => {
                        if creation && returned.is_none() {
                            returned = data;
                        }
                        break;
                    }
                    Step::Dropped => break,
                }
            }
        }

        Ok(returned)
    }

    fn step(
        &mut self,
        code: &Disassembly,
        path: &mut Path,
        space: &mut StateSpace,
        dispatcher: &mut dyn HookDispatcher,
        worklist: &mut Vec<Path>,
    ) -> Result<Step> {
        // Running past the end of the code is an implicit STOP.
        let Some(instruction) = code.instruction_at(path.pc).cloned() else {
            return Ok(Step::Halted(None));
        };
        let opcode = instruction.opcode;
        let (pops, pushes) = opcode.stack_io();
        if path.stack.len() < pops || path.stack.len() - pops + pushes > STACK_LIMIT {
            debug!("Stack bounds violated by {}, path halts exceptionally", instruction);
            return Ok(Step::Dropped);
        }

        self.fire(HookPhase::Pre, opcode, &instruction, path, path.last_frame.as_ref(), dispatcher)?;

        let frame = Frame {
            instruction: instruction.clone(),
            stack: path.stack.clone(),
        };
        space.nodes[path.node].frames.push(frame.clone());

        match self.execute(code, &instruction, path) {
            Flow::Next => {
                path.pc = instruction.next_address();
                self.after(code, path, &frame, dispatcher)?;
                path.last_frame = Some(frame);
                Ok(Step::Continue)
            }
            Flow::Halt(data) => Ok(Step::Halted(data)),
            Flow::Jump(destination) => {
                let Some(target) = jump_target(code, &destination) else {
                    debug!("Invalid jump destination at {}", instruction);
                    return Ok(Step::Dropped);
                };
                if !self.enter(path, instruction.address, target, EdgeKind::Jump, space) {
                    return Ok(Step::Dropped);
                }
                self.after(code, path, &frame, dispatcher)?;
                Ok(Step::Continue)
            }
            Flow::Branch { destination, condition } => {
                let fallthrough = instruction.next_address();

                if let Some(value) = condition.value() {
                    let (target, taken) = if value.is_zero() {
                        (Some(fallthrough), false)
                    } else {
                        (jump_target(code, &destination), true)
                    };
                    let Some(target) = target else {
                        return Ok(Step::Dropped);
                    };
                    if !self.enter(path, instruction.address, target, EdgeKind::Conditional(taken), space) {
                        return Ok(Step::Dropped);
                    }
                    self.after(code, path, &frame, dispatcher)?;
                    return Ok(Step::Continue);
                }

                let mut other = path.fork();
                other.constraints.push(Constraint::new(condition.word().clone(), false));
                if self.enter(&mut other, instruction.address, fallthrough, EdgeKind::Conditional(false), space) {
                    self.after(code, &other, &frame, dispatcher)?;
                    worklist.push(other);
                }

                let Some(target) = jump_target(code, &destination) else {
                    return Ok(Step::Dropped);
                };
                path.constraints.push(Constraint::new(condition.word().clone(), true));
                if let Some(name) = selector_function(condition.word()) {
                    debug!("Entering {}", name);
                    path.function_name = name;
                }
                if !self.enter(path, instruction.address, target, EdgeKind::Conditional(true), space) {
                    return Ok(Step::Dropped);
                }
                self.after(code, path, &frame, dispatcher)?;
                Ok(Step::Continue)
            }
        }
    }

    /// Moves `path` into a new block at `target`. Returns false when a limit
    /// prunes the path.
    fn enter(&self, path: &mut Path, from: usize, target: usize, kind: EdgeKind, space: &mut StateSpace) -> bool {
        let visits = path.edge_visits.entry((from, target)).or_insert(0);
        *visits += 1;
        if *visits > self.limits.loop_bound {
            warn!("Loop bound reached on edge {} -> {}, path pruned", from, target);
            space.complete = false;
            return false;
        }
        path.depth += 1;
        if path.depth > self.limits.max_depth {
            warn!("Max depth reached at {}, path pruned", target);
            space.complete = false;
            return false;
        }

        let node = space.add_node(&path.function_name, target, &path.constraints);
        space.add_edge(path.node, node, kind);
        path.node = node;
        path.pc = target;
        path.last_frame = None;
        true
    }

    fn after(&self, code: &Disassembly, path: &Path, frame: &Frame, dispatcher: &mut dyn HookDispatcher) -> Result<()> {
        let next = code
            .instruction_at(path.pc)
            .cloned()
            .unwrap_or_else(|| Instruction::new(path.pc, Opcode::STOP, None));
        self.fire(HookPhase::Post, frame.instruction.opcode, &next, path, Some(frame), dispatcher)
    }

    fn fire(
        &self,
        phase: HookPhase,
        hooked: Opcode,
        instruction: &Instruction,
        path: &Path,
        previous: Option<&Frame>,
        dispatcher: &mut dyn HookDispatcher,
    ) -> Result<()> {
        let Some(subscribers) = self.hooks.get(&(phase, hooked)) else {
            return Ok(());
        };
        let event = HookEvent {
            phase,
            state: path.view(instruction),
            previous,
        };
        for &subscriber in subscribers {
            dispatcher.dispatch(subscriber, &event)?;
        }
        Ok(())
    }

    fn execute(&mut self, code: &Disassembly, instruction: &Instruction, path: &mut Path) -> Flow {
        let opcode = instruction.opcode;
        let depth = path.stack.len();

        match opcode.0 {
            0x5f..=0x7f => {
                let value = instruction.argument.unwrap_or_default();
                path.stack.push(Rc::new(StackValue::constant(value)));
                return Flow::Next;
            }
            0x80..=0x8f => {
                let n = (opcode.0 - 0x7f) as usize;
                let value = path.stack[depth - n].clone();
                path.stack.push(value);
                return Flow::Next;
            }
            0x90..=0x9f => {
                let n = (opcode.0 - 0x8f) as usize;
                path.stack.swap(depth - 1, depth - 1 - n);
                return Flow::Next;
            }
            _ => {}
        }

        let (pops, pushes) = opcode.stack_io();
        let mut args = path.stack.split_off(depth - pops);
        args.reverse();

        let result = match opcode {
            Opcode::RETURN => return Flow::Halt(returned_bytes(&path.memory, &args[0], &args[1])),
            // Undefined opcodes halt exceptionally, like INVALID.
            o if o.is_halting() => return Flow::Halt(None),
            Opcode::JUMP => return Flow::Jump(args[0].clone()),
            Opcode::JUMPI => {
                return Flow::Branch {
                    destination: args[0].clone(),
                    condition: args[1].clone(),
                }
            }
            Opcode::ISZERO | Opcode::NOT => Some(derived(Term::unary(opcode, args[0].word()), &args)),
            o if is_binary(o) => Some(derived(Term::binary(opcode, args[0].word(), args[1].word()), &args)),
            Opcode(0x08) | Opcode(0x09) => Some(derived(self.opaque_word(opcode), &args)),
            Opcode::SHA3 => Some(self.sha3(&path.memory, &args[0], &args[1])),
            Opcode::CALLDATALOAD => Some(fresh(Rc::new(Term::CallData(args[0].word().clone())))),
            Opcode::CALLDATACOPY => {
                calldata_copy(&mut path.memory, &args);
                None
            }
            Opcode::CODECOPY => {
                code_copy(&mut path.memory, &code.bytecode, &args);
                None
            }
            Opcode(0x38) => Some(constant(code.bytecode.len())),
            Opcode::MLOAD => Some(match memory_offset(&args[0], 32) {
                Some(offset) => path.memory.load_word(offset),
                None => self.opaque(opcode),
            }),
            Opcode::MSTORE => {
                if let Some(offset) = memory_offset(&args[0], 32) {
                    path.memory.store_word(offset, &args[1]);
                }
                None
            }
            Opcode::MSTORE8 => {
                if let Some(offset) = memory_offset(&args[0], 1) {
                    path.memory.store_byte(offset, &args[1]);
                }
                None
            }
            Opcode::SLOAD => Some(match path.storage.get(args[0].word()) {
                Some(value) => value.clone(),
                None => fresh(Rc::new(Term::Storage(args[0].word().clone()))),
            }),
            Opcode::SSTORE => {
                path.storage.insert(args[0].word().clone(), args[1].clone());
                None
            }
            Opcode(0x58) => Some(constant(instruction.address)),
            Opcode(0x59) => Some(constant(path.memory.size())),
            o if is_environment(o) => Some(fresh(Rc::new(Term::Env(o)))),
            _ if pops == 1 && pushes == 1 => Some(fresh(Rc::new(Term::Unary(opcode, args[0].word().clone())))),
            _ if pushes == 1 => Some(self.opaque(opcode)),
            _ => None,
        };

        if let Some(value) = result {
            path.stack.push(value);
        }
        Flow::Next
    }

    fn sha3(&mut self, memory: &Memory, offset: &StackValue, length: &StackValue) -> Rc<StackValue> {
        let (Some(length), Some(offset)) = (length.value().and_then(to_usize), offset.value()) else {
            return self.opaque(Opcode::SHA3);
        };
        let Some(offset) = to_usize(offset).filter(|o| o.saturating_add(length) <= MEMORY_LIMIT) else {
            return self.opaque(Opcode::SHA3);
        };

        let region = memory.read_region(offset, length);
        let word = match region.bytes {
            Some(bytes) => Term::constant(U256::from_be_bytes(keccak256(&bytes).0)),
            None => Rc::new(Term::Keccak(region.words)),
        };
        Rc::new(StackValue::with_annotations(word, region.annotations))
    }

    fn opaque_word(&mut self, origin: Opcode) -> Word {
        self.opaque_ids += 1;
        Rc::new(Term::Opaque {
            origin,
            id: self.opaque_ids,
        })
    }

    fn opaque(&mut self, origin: Opcode) -> Rc<StackValue> {
        fresh(self.opaque_word(origin))
    }
}

impl Default for Explorer {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl SymbolicEngine for Explorer {
    fn register_hook(&mut self, phase: HookPhase, opcode: Opcode, subscriber: usize) {
        let subscribers = self.hooks.entry((phase, opcode)).or_default();
        if !subscribers.contains(&subscriber) {
            subscribers.push(subscriber);
        }
    }

    fn clear_hooks(&mut self) {
        self.hooks.clear();
    }

    fn explore(&mut self, target: &Target, dispatcher: &mut dyn HookDispatcher) -> Result<StateSpace> {
        let started = Instant::now();
        let mut space = StateSpace {
            complete: true,
            ..StateSpace::default()
        };

        match target {
            Target::Creation { code } => {
                let constructor = Disassembly::new(code.clone());
                let runtime = self.transaction(&constructor, CONSTRUCTOR, true, started, &mut space, dispatcher)?;
                match runtime {
                    Some(runtime) if !runtime.is_empty() => {
                        let runtime = Disassembly::new(runtime);
                        self.transaction(&runtime, FALLBACK, false, started, &mut space, dispatcher)?;
                    }
                    _ => warn!("Constructor returned no concrete runtime code, message calls not explored"),
                }
            }
            Target::Deployed { code, .. } => {
                let runtime = Disassembly::new(code.clone());
                self.transaction(&runtime, FALLBACK, false, started, &mut space, dispatcher)?;
            }
        }

        debug!(
            "Explored {} nodes and {} edges in {:.2?}",
            space.nodes.len(),
            space.edges.len(),
            started.elapsed()
        );
        Ok(space)
    }
}

fn is_binary(opcode: Opcode) -> bool {
    matches!(opcode.0, 0x01..=0x07 | 0x0a | 0x0b | 0x10..=0x14 | 0x16..=0x18 | 0x1a..=0x1d)
}

fn is_environment(opcode: Opcode) -> bool {
    matches!(opcode.0, 0x30 | 0x32..=0x34 | 0x36 | 0x3a | 0x3d | 0x41..=0x48 | 0x4a | 0x5a)
}

fn fresh(word: Word) -> Rc<StackValue> {
    Rc::new(StackValue::new(word))
}

fn constant(value: usize) -> Rc<StackValue> {
    Rc::new(StackValue::constant(U256::from(value)))
}

/// New value carrying the union of the annotations of `inputs`.
fn derived(word: Word, inputs: &[Rc<StackValue>]) -> Rc<StackValue> {
    let mut annotations = AnnotationSet::new();
    for input in inputs {
        annotations.extend(input.annotations().iter().cloned());
    }
    Rc::new(StackValue::with_annotations(word, annotations))
}

fn memory_offset(value: &StackValue, length: usize) -> Option<usize> {
    value
        .value()
        .and_then(to_usize)
        .filter(|offset| offset.saturating_add(length) <= MEMORY_LIMIT)
}

fn jump_target(code: &Disassembly, destination: &StackValue) -> Option<usize> {
    destination
        .value()
        .and_then(to_usize)
        .filter(|&target| code.is_jump_destination(target))
}

fn returned_bytes(memory: &Memory, offset: &StackValue, length: &StackValue) -> Option<Vec<u8>> {
    let length = length.value().and_then(to_usize)?;
    let offset = memory_offset(offset, length)?;
    memory.read_region(offset, length).bytes
}

fn calldata_copy(memory: &mut Memory, args: &[Rc<StackValue>]) {
    let Some(length) = args[2].value().and_then(to_usize) else {
        return;
    };
    let Some(destination) = memory_offset(&args[0], length) else {
        return;
    };
    let source = args[1].word().clone();
    memory.store_symbolic(destination, length, |chunk| {
        let offset = Term::binary(Opcode::ADD, &source, &Term::constant(U256::from(chunk)));
        Rc::new(Term::CallData(offset))
    });
}

fn code_copy(memory: &mut Memory, bytecode: &[u8], args: &[Rc<StackValue>]) {
    let (Some(length), Some(source)) = (
        args[2].value().and_then(to_usize),
        args[1].value().and_then(to_usize),
    ) else {
        return;
    };
    let Some(destination) = memory_offset(&args[0], length) else {
        return;
    };
    let bytes: Vec<u8> = (0..length)
        .map(|i| bytecode.get(source.saturating_add(i)).copied().unwrap_or(0))
        .collect();
    memory.store_bytes(destination, &bytes);
}

/// `_function_0x<selector>` when `condition` compares the calldata selector
/// against a constant.
fn selector_function(condition: &Word) -> Option<String> {
    let Term::Binary(Opcode::EQ, a, b) = &**condition else {
        return None;
    };
    let (selector, other) = match (a.as_const(), b.as_const()) {
        (Some(c), None) => (c, b),
        (None, Some(c)) => (c, a),
        _ => return None,
    };
    if !other.reads_selector() || selector > U256::from(u32::MAX) {
        return None;
    }
    to_usize(selector).map(|s| format!("_function_0x{:08x}", s))
}
