//! The bytecode machine.
//!
//! One value stack of words holds every frame; a frame is just a base index
//! (`fp`) into it. Heap blocks live in a separate [`Heap`] arena and are
//! addressed with [`HEAP_BIT`] set, so a single `u32` can point into either.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bytecode::ir::{Program, decode_string, encode_string};
use crate::bytecode::op::{Instruction, OpCode};
use crate::bytecode::verify::verify;
use crate::runtime::heap::{HEAP_BIT, Heap};
use crate::runtime::runtime_error::{FaultKind, MachineError};

/// Capacity a list gets when it is created or first pushed to.
const LIST_INITIAL_CAPACITY: u32 = 4;
/// `[length, capacity]` ahead of the elements.
const LIST_HEADER_WORDS: u32 = 2;

type Fault<T> = Result<T, FaultKind>;

/// A host callable. It reads its arguments off the stack and pushes its
/// result, if any, with the `pop_*`/`push_*` helpers.
pub type ExternalFunction = Arc<dyn Fn(&mut Machine) -> Result<(), MachineError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub initial_stack_words: usize,
    pub initial_heap_words: usize,
    pub max_heap_words: usize,
    pub max_call_depth: usize,
    /// Free blocks inspected per allocation before the arena grows.
    pub free_list_scan_limit: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            initial_stack_words: 1024,
            initial_heap_words: 1024,
            max_heap_words: 16 * 1024 * 1024,
            max_call_depth: 1000,
            free_list_scan_limit: 16,
        }
    }
}

/// Host clock passed to every [`Machine::run`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnvironmentState {
    pub time: f64,
    pub delta_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Running,
    /// Suspended by `yield` until the host clock reaches the resume time.
    Yield,
    Halt,
}

/// A caller waiting for a `Return`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    chunk: usize,
    ip: usize,
    fp: usize,
}

/// Host callables by name; bound to a program's external table by index.
#[derive(Clone, Default)]
pub struct ExternalTable {
    functions: HashMap<String, ExternalFunction>,
}

impl ExternalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&mut Machine) -> Result<(), MachineError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    /// Orders the callables the way `program` numbers its externals. Every
    /// missing name is reported at once.
    pub fn bind(&self, program: &Program) -> Result<Vec<ExternalFunction>, MachineError> {
        let missing: Vec<String> = program
            .externals
            .iter()
            .filter(|name| !self.functions.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(FaultKind::MissingExternals(missing).into());
        }
        Ok(program
            .externals
            .iter()
            .filter_map(|name| self.functions.get(name).cloned())
            .collect())
    }
}

impl fmt::Debug for ExternalTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("ExternalTable").field("functions", &names).finish()
    }
}

pub struct Machine {
    program: Option<Arc<Program>>,
    state: ExecutionState,
    stack: Vec<u32>,
    heap: Heap,
    frames: Vec<Frame>,
    chunk: usize,
    ip: usize,
    fp: usize,
    externals: Vec<ExternalFunction>,
    resume_at: f64,
    /// Heap copies of string constants, by (chunk, constant index).
    heap_constants: HashMap<(usize, u16), u32>,
    config: MachineConfig,
}

impl Machine {
    /// A machine whose value stack starts with room for `stack_words`.
    pub fn new(stack_words: usize) -> Self {
        Self::with_config(MachineConfig {
            initial_stack_words: stack_words,
            ..MachineConfig::default()
        })
    }

    pub fn with_config(config: MachineConfig) -> Self {
        Machine {
            program: None,
            state: ExecutionState::Halt,
            stack: Vec::with_capacity(config.initial_stack_words),
            heap: Self::empty_heap(&config),
            frames: Vec::new(),
            chunk: 0,
            ip: 0,
            fp: 0,
            externals: Vec::new(),
            resume_at: 0.0,
            heap_constants: HashMap::new(),
            config,
        }
    }

    fn empty_heap(config: &MachineConfig) -> Heap {
        Heap::new(
            config.initial_heap_words,
            config.max_heap_words,
            config.free_list_scan_limit,
        )
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn stack(&self) -> &[u32] {
        &self.stack
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn program(&self) -> Option<&Arc<Program>> {
        self.program.as_ref()
    }

    /// Native callables, indexed like the program's `externals`.
    pub fn set_externals(&mut self, externals: Vec<ExternalFunction>) {
        self.externals = externals;
    }

    /// Binds `table` against the booted program.
    pub fn bind_externals(&mut self, table: &ExternalTable) -> Result<(), MachineError> {
        let program = self
            .program
            .clone()
            .ok_or(MachineError::new(FaultKind::NotBooted))?;
        self.externals = table.bind(&program)?;
        Ok(())
    }

    /// Verifies `program` and resets the machine to the start of its entry
    /// chunk. Bound externals are kept.
    pub fn boot(&mut self, program: impl Into<Arc<Program>>) -> Result<(), MachineError> {
        let program = program.into();
        verify(&program)?;

        self.stack.clear();
        self.heap = Self::empty_heap(&self.config);
        self.frames.clear();
        self.heap_constants.clear();
        self.chunk = program.entry_point;
        self.ip = 0;
        self.fp = 0;
        self.resume_at = 0.0;
        self.state = ExecutionState::Running;
        debug!(
            chunks = program.chunks.len(),
            externals = program.externals.len(),
            "machine booted"
        );
        self.program = Some(program);
        Ok(())
    }

    /// Runs until the program halts or yields. Returns `true` once it has
    /// halted; a suspended machine returns `false` without executing until
    /// `env.time` reaches the resume time.
    pub fn run(&mut self, env: EnvironmentState) -> Result<bool, MachineError> {
        let program = self
            .program
            .clone()
            .ok_or(MachineError::new(FaultKind::NotBooted))?;

        match self.state {
            ExecutionState::Halt => return Ok(true),
            ExecutionState::Yield if env.time < self.resume_at => return Ok(false),
            ExecutionState::Yield => {
                trace!(time = env.time, "resumed");
                self.state = ExecutionState::Running;
            }
            ExecutionState::Running => {}
        }

        match self.execute(&program, env) {
            Ok(()) => Ok(self.state == ExecutionState::Halt),
            Err(kind) => {
                let error = self.error_with_context(&program, kind);
                self.state = ExecutionState::Halt;
                Err(error)
            }
        }
    }

    /// Releases the stack and heap buffers. The machine must be booted again
    /// before it can run.
    pub fn dispose(&mut self) {
        self.program = None;
        self.state = ExecutionState::Halt;
        self.stack = Vec::new();
        self.heap.clear();
        self.frames = Vec::new();
        self.heap_constants.clear();
        debug!("machine disposed");
    }

    fn error_with_context(&self, program: &Program, kind: FaultKind) -> MachineError {
        let name = |chunk: usize| {
            program
                .chunks
                .get(chunk)
                .map_or("<unknown>", |c| c.name.as_str())
        };
        let mut error = MachineError::new(kind);
        for frame in &self.frames {
            // a caller's ip already points past its Call
            error = error.with_context(format!(
                "{} @ {}",
                name(frame.chunk),
                frame.ip.saturating_sub(1)
            ));
        }
        error.with_context(format!("{} @ {}", name(self.chunk), self.ip.saturating_sub(1)))
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn execute(&mut self, program: &Program, env: EnvironmentState) -> Fault<()> {
        loop {
            let code = program
                .chunks
                .get(self.chunk)
                .ok_or(FaultKind::InvalidChunk(self.chunk))?;
            let Some(&instruction) = code.instructions.get(self.ip) else {
                return Err(FaultKind::InvalidProgram(format!(
                    "ran past the end of '{}'",
                    code.name
                )));
            };
            self.ip += 1;
            let op = instruction
                .opcode()
                .ok_or(FaultKind::InvalidOpcode(instruction.opcode_byte()))?;

            match op {
                // control flow
                OpCode::Halt => {
                    self.state = ExecutionState::Halt;
                    debug!(stack = self.stack.len(), heap = self.heap.len(), "machine halted");
                    return Ok(());
                }
                OpCode::Yield => {
                    let duration = self.pop_f32()?;
                    self.resume_at = env.time + duration as f64;
                    self.state = ExecutionState::Yield;
                    trace!(time = env.time, resume_at = self.resume_at, "yielded");
                    return Ok(());
                }
                OpCode::Jump => self.jump(instruction, code.instructions.len())?,
                OpCode::JumpIfFalse => {
                    if self.pop_raw()? == 0 {
                        self.jump(instruction, code.instructions.len())?;
                    }
                }
                OpCode::Call => self.call(program, instruction)?,
                OpCode::Return => {
                    if self.return_from(instruction)? {
                        self.state = ExecutionState::Halt;
                        debug!(stack = self.stack.len(), "machine halted by return");
                        return Ok(());
                    }
                }
                OpCode::CallExternal => self.call_external(program, instruction)?,

                // stack
                OpCode::PushImmediate => self.stack.push(instruction.immediate_value() as u32),
                OpCode::LoadConstant => {
                    let index = instruction.short() as usize;
                    let word = *code.constants.get(index).ok_or_else(|| {
                        FaultKind::InvalidProgram(format!("constant {} out of range", index))
                    })?;
                    self.stack.push(word);
                }
                OpCode::LoadHeapConstant => {
                    let address = self.heap_constant(program, instruction.short())?;
                    self.stack.push(address);
                }
                OpCode::PushZero => {
                    let end = self.stack.len() + instruction.short() as usize;
                    self.stack.resize(end, 0);
                }
                OpCode::Pop => {
                    let at = self.top(instruction.short() as usize)?;
                    self.stack.truncate(at);
                }
                OpCode::Duplicate => {
                    let at = self.top(instruction.a() as usize)?;
                    self.stack.extend_from_within(at..);
                }
                OpCode::LoadVariable => {
                    let base = self.fp + instruction.short() as usize;
                    self.push_from_stack(base, instruction.a() as usize)?;
                }
                OpCode::StoreVariable => {
                    let base = self.fp + instruction.short() as usize;
                    self.pop_into_stack(base, instruction.a() as usize)?;
                }
                OpCode::LoadGlobal => {
                    self.push_from_stack(instruction.short() as usize, instruction.a() as usize)?;
                }
                OpCode::StoreGlobal => {
                    self.pop_into_stack(instruction.short() as usize, instruction.a() as usize)?;
                }
                OpCode::Select => {
                    let (total, offset, words) = (
                        instruction.a() as usize,
                        instruction.b() as usize,
                        instruction.c() as usize,
                    );
                    if offset + words > total {
                        return Err(FaultKind::InvalidProgram("select past the value".into()));
                    }
                    let at = self.top(total)?;
                    self.stack.copy_within(at + offset..at + offset + words, at);
                    self.stack.truncate(at + words);
                }
                OpCode::StoreTop => {
                    let words = instruction.a() as usize;
                    let at = self.top(words)?;
                    let depth = instruction.short() as usize;
                    let base = at.checked_sub(depth).ok_or(FaultKind::StackUnderflow)?;
                    if base + words > at {
                        return Err(FaultKind::InvalidProgram("store overlaps its value".into()));
                    }
                    self.pop_into_stack(base, words)?;
                }

                // addressing
                OpCode::AddressOf => {
                    let offset = instruction.short() as usize;
                    let address = if instruction.a() == 0 {
                        self.fp + offset
                    } else {
                        offset
                    };
                    self.stack.push(address as u32);
                }
                OpCode::LoadIndirect => {
                    let address = self.pop_raw()?;
                    let address = offset_address(address, instruction.short() as u32)?;
                    for i in 0..instruction.a() as u32 {
                        let word = self.load(offset_address(address, i)?)?;
                        self.stack.push(word);
                    }
                }
                OpCode::StoreIndirect => {
                    let words = instruction.a() as usize;
                    let at = self.top(words)?;
                    let slot = at.checked_sub(1).ok_or(FaultKind::StackUnderflow)?;
                    let address = offset_address(self.stack[slot], instruction.short() as u32)?;
                    for i in 0..words {
                        let word = self.stack[at + i];
                        self.store(offset_address(address, i as u32)?, word)?;
                    }
                    self.stack.truncate(slot);
                }
                OpCode::OffsetAddress => {
                    let address = self.pop_raw()?;
                    self.stack
                        .push(offset_address(address, instruction.short() as u32)?);
                }
                OpCode::IndexAddress => {
                    let index = self.pop_raw()? as i32;
                    let address = self.pop_raw()?;
                    let length = instruction.short() as u32;
                    check_index(index, length)?;
                    let offset = index as u32 * instruction.a() as u32;
                    self.stack.push(offset_address(address, offset)?);
                }

                // integer arithmetic
                OpCode::AddInt => self.binary_int(|a, b| Ok(a.wrapping_add(b)))?,
                OpCode::SubtractInt => self.binary_int(|a, b| Ok(a.wrapping_sub(b)))?,
                OpCode::MultiplyInt => self.binary_int(|a, b| Ok(a.wrapping_mul(b)))?,
                OpCode::DivideInt => self.binary_int(|a, b| {
                    if b == 0 {
                        return Err(FaultKind::DivisionByZero);
                    }
                    Ok(a.wrapping_div(b))
                })?,
                OpCode::ModuloInt => self.binary_int(|a, b| {
                    if b == 0 {
                        return Err(FaultKind::DivisionByZero);
                    }
                    Ok(a.wrapping_rem(b))
                })?,
                OpCode::NegateInt => {
                    let value = self.pop_i32()?;
                    self.stack.push(value.wrapping_neg() as u32);
                }

                // float arithmetic
                OpCode::AddFloat => self.binary_float(|a, b| a + b)?,
                OpCode::SubtractFloat => self.binary_float(|a, b| a - b)?,
                OpCode::MultiplyFloat => self.binary_float(|a, b| a * b)?,
                OpCode::DivideFloat => self.binary_float(|a, b| a / b)?,
                OpCode::NegateFloat => {
                    let value = self.pop_f32()?;
                    self.stack.push((-value).to_bits());
                }

                // comparison
                OpCode::LessInt => self.compare_int(|a, b| a < b)?,
                OpCode::LessEqualInt => self.compare_int(|a, b| a <= b)?,
                OpCode::GreaterInt => self.compare_int(|a, b| a > b)?,
                OpCode::GreaterEqualInt => self.compare_int(|a, b| a >= b)?,
                OpCode::LessFloat => self.compare_float(|a, b| a < b)?,
                OpCode::LessEqualFloat => self.compare_float(|a, b| a <= b)?,
                OpCode::GreaterFloat => self.compare_float(|a, b| a > b)?,
                OpCode::GreaterEqualFloat => self.compare_float(|a, b| a >= b)?,
                OpCode::Equal | OpCode::NotEqual => {
                    let words = instruction.a() as usize;
                    let right = self.top(words)?;
                    let left = right.checked_sub(words).ok_or(FaultKind::StackUnderflow)?;
                    let equal = self.stack[left..right] == self.stack[right..];
                    self.stack.truncate(left);
                    self.stack.push((equal == (op == OpCode::Equal)) as u32);
                }

                // logic and conversion
                OpCode::And => {
                    let b = self.pop_raw()?;
                    let a = self.pop_raw()?;
                    self.stack.push((a != 0 && b != 0) as u32);
                }
                OpCode::Or => {
                    let b = self.pop_raw()?;
                    let a = self.pop_raw()?;
                    self.stack.push((a != 0 || b != 0) as u32);
                }
                OpCode::Not => {
                    let a = self.pop_raw()?;
                    self.stack.push((a == 0) as u32);
                }
                OpCode::IntToFloat => {
                    let value = self.pop_i32()?;
                    self.stack.push((value as f32).to_bits());
                }
                OpCode::FloatToInt => {
                    let value = self.pop_f32()?;
                    self.stack.push(value as i32 as u32);
                }

                // heap
                OpCode::New => {
                    let words = instruction.short() as u32;
                    let at = self.top(words as usize)?;
                    let index = self.heap.allocate(words)?;
                    if words > 0 {
                        self.heap
                            .slice_mut(index, words)?
                            .copy_from_slice(&self.stack[at..]);
                    }
                    self.stack.truncate(at);
                    self.stack.push(HEAP_BIT | index);
                }
                OpCode::FreeHeap => {
                    let slot = self.pop_raw()?;
                    let pointer = self.load(slot)?;
                    if pointer != 0 {
                        self.heap
                            .deallocate(heap_index(pointer)?, instruction.short() as u32)?;
                        self.store(slot, 0)?;
                    }
                }
                OpCode::ListNew => {
                    let list = self.new_list(instruction.a() as u32, instruction.short() as u32)?;
                    self.stack.push(list);
                }
                OpCode::ListPush => self.list_push(instruction.a() as u32)?,
                OpCode::ListLength => {
                    let list = self.pop_raw()?;
                    let length = if list == 0 { 0 } else { self.load(list)? };
                    self.stack.push(length);
                }
                OpCode::ListIndex => {
                    let index = self.pop_raw()? as i32;
                    let list = self.pop_raw()?;
                    let length = if list == 0 { 0 } else { self.load(list)? };
                    check_index(index, length)?;
                    let offset = LIST_HEADER_WORDS + index as u32 * instruction.a() as u32;
                    self.stack.push(offset_address(list, offset)?);
                }
                OpCode::ListFree => {
                    let slot = self.pop_raw()?;
                    let list = self.load(slot)?;
                    if list != 0 {
                        let capacity = self.load(offset_address(list, 1)?)?;
                        let words = list_block_words(capacity, instruction.a() as u32)?;
                        self.heap.deallocate(heap_index(list)?, words)?;
                        self.store(slot, 0)?;
                    }
                }
            }
        }
    }

    fn jump(&mut self, instruction: Instruction, length: usize) -> Fault<()> {
        let target = self.ip as i64 + instruction.signed_short() as i64;
        if target < 0 || target > length as i64 {
            return Err(FaultKind::InvalidProgram(format!(
                "jump target {} outside the chunk",
                target
            )));
        }
        self.ip = target as usize;
        Ok(())
    }

    fn call(&mut self, program: &Program, instruction: Instruction) -> Fault<()> {
        let chunk = instruction.short() as usize;
        if chunk >= program.chunks.len() {
            return Err(FaultKind::InvalidChunk(chunk));
        }
        if self.frames.len() >= self.config.max_call_depth {
            return Err(FaultKind::CallDepthExceeded(self.config.max_call_depth));
        }
        let fp = self.top(instruction.a() as usize)?;
        self.frames.push(Frame {
            chunk: self.chunk,
            ip: self.ip,
            fp: self.fp,
        });
        trace!(callee = %program.chunks[chunk].name, depth = self.frames.len(), "call");
        self.chunk = chunk;
        self.ip = 0;
        self.fp = fp;
        Ok(())
    }

    /// Moves the result down to the frame base and resumes the caller.
    /// Returns `true` when there is no caller left.
    fn return_from(&mut self, instruction: Instruction) -> Fault<bool> {
        let words = instruction.a() as usize;
        let at = self.top(words)?;
        if at < self.fp {
            return Err(FaultKind::StackUnderflow);
        }
        self.stack.copy_within(at.., self.fp);
        self.stack.truncate(self.fp + words);

        let Some(frame) = self.frames.pop() else {
            return Ok(true);
        };
        self.chunk = frame.chunk;
        self.ip = frame.ip;
        self.fp = frame.fp;
        Ok(false)
    }

    fn call_external(&mut self, program: &Program, instruction: Instruction) -> Fault<()> {
        let index = instruction.short();
        let Some(function) = self.externals.get(index as usize).cloned() else {
            return Err(FaultKind::UnboundExternal {
                index,
                name: program
                    .externals
                    .get(index as usize)
                    .cloned()
                    .unwrap_or_default(),
            });
        };
        trace!(index, params = instruction.a(), "external call");
        function(self).map_err(|error| error.kind)
    }

    fn heap_constant(&mut self, program: &Program, index: u16) -> Fault<u32> {
        if let Some(&address) = self.heap_constants.get(&(self.chunk, index)) {
            return Ok(address);
        }
        let constants = &program.chunks[self.chunk].constants;
        let start = index as usize;
        let block = constants
            .get(start)
            .and_then(|&payload| constants.get(start..start + 1 + payload as usize))
            .ok_or_else(|| {
                FaultKind::InvalidProgram(format!("heap constant {} out of range", index))
            })?;

        let heap_index = self.heap.allocate(block.len() as u32)?;
        self.heap
            .slice_mut(heap_index, block.len() as u32)?
            .copy_from_slice(block);
        let address = HEAP_BIT | heap_index;
        self.heap_constants.insert((self.chunk, index), address);
        Ok(address)
    }

    fn new_list(&mut self, element_words: u32, capacity: u32) -> Fault<u32> {
        let words = list_block_words(capacity, element_words)?;
        let index = self.heap.allocate(words)?;
        self.heap.write(index + 1, capacity)?;
        Ok(HEAP_BIT | index)
    }

    /// Stack: `[slot address, value...]`. Allocates or grows the list as
    /// needed and writes the new block back to the slot.
    fn list_push(&mut self, element_words: u32) -> Fault<()> {
        let at = self.top(element_words as usize)?;
        let slot_at = at.checked_sub(1).ok_or(FaultKind::StackUnderflow)?;
        let slot = self.stack[slot_at];

        let mut list = self.load(slot)?;
        if list == 0 {
            list = self.new_list(element_words, LIST_INITIAL_CAPACITY)?;
            self.store(slot, list)?;
        }
        let index = heap_index(list)?;
        let length = self.heap.read(index)?;
        let capacity = self.heap.read(index + 1)?;

        let index = if length >= capacity {
            let grown = self.grow_list(index, length, capacity, element_words)?;
            self.store(slot, HEAP_BIT | grown)?;
            grown
        } else {
            index
        };

        let element = index + LIST_HEADER_WORDS + length * element_words;
        self.heap
            .slice_mut(element, element_words)?
            .copy_from_slice(&self.stack[at..]);
        self.heap.write(index, length + 1)?;
        self.stack.truncate(slot_at);
        Ok(())
    }

    fn grow_list(&mut self, index: u32, length: u32, capacity: u32, element_words: u32) -> Fault<u32> {
        let new_capacity = capacity
            .checked_mul(2)
            .ok_or(FaultKind::InvalidProgram("list capacity overflow".into()))?
            .max(LIST_INITIAL_CAPACITY);
        let grown = self
            .heap
            .allocate(list_block_words(new_capacity, element_words)?)?;
        self.heap
            .copy_within(index, grown, LIST_HEADER_WORDS + length * element_words)?;
        self.heap.write(grown + 1, new_capacity)?;
        self.heap
            .deallocate(index, list_block_words(capacity, element_words)?)?;
        trace!(from = capacity, to = new_capacity, "list grew");
        Ok(grown)
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Index of the first of the top `words` words.
    fn top(&self, words: usize) -> Fault<usize> {
        self.stack
            .len()
            .checked_sub(words)
            .ok_or(FaultKind::StackUnderflow)
    }

    fn push_from_stack(&mut self, base: usize, words: usize) -> Fault<()> {
        if base + words > self.stack.len() {
            return Err(FaultKind::AddressOutOfBounds(base as u32));
        }
        self.stack.extend_from_within(base..base + words);
        Ok(())
    }

    /// Pops the top `words` words into `base..base + words`.
    fn pop_into_stack(&mut self, base: usize, words: usize) -> Fault<()> {
        let at = self.top(words)?;
        if base + words > at {
            return Err(FaultKind::AddressOutOfBounds(base as u32));
        }
        self.stack.copy_within(at.., base);
        self.stack.truncate(at);
        Ok(())
    }

    fn load(&self, address: u32) -> Fault<u32> {
        if address & HEAP_BIT != 0 {
            Ok(self.heap.read(address & !HEAP_BIT)?)
        } else {
            self.stack
                .get(address as usize)
                .copied()
                .ok_or(FaultKind::AddressOutOfBounds(address))
        }
    }

    fn store(&mut self, address: u32, value: u32) -> Fault<()> {
        if address & HEAP_BIT != 0 {
            Ok(self.heap.write(address & !HEAP_BIT, value)?)
        } else {
            match self.stack.get_mut(address as usize) {
                Some(word) => {
                    *word = value;
                    Ok(())
                }
                None => Err(FaultKind::AddressOutOfBounds(address)),
            }
        }
    }

    fn pop_raw(&mut self) -> Fault<u32> {
        self.stack.pop().ok_or(FaultKind::StackUnderflow)
    }

    fn pop_i32(&mut self) -> Fault<i32> {
        Ok(self.pop_raw()? as i32)
    }

    fn pop_f32(&mut self) -> Fault<f32> {
        Ok(f32::from_bits(self.pop_raw()?))
    }

    fn binary_int(&mut self, f: impl Fn(i32, i32) -> Fault<i32>) -> Fault<()> {
        let b = self.pop_i32()?;
        let a = self.pop_i32()?;
        self.stack.push(f(a, b)? as u32);
        Ok(())
    }

    fn binary_float(&mut self, f: impl Fn(f32, f32) -> f32) -> Fault<()> {
        let b = self.pop_f32()?;
        let a = self.pop_f32()?;
        self.stack.push(f(a, b).to_bits());
        Ok(())
    }

    fn compare_int(&mut self, f: impl Fn(i32, i32) -> bool) -> Fault<()> {
        let b = self.pop_i32()?;
        let a = self.pop_i32()?;
        self.stack.push(f(a, b) as u32);
        Ok(())
    }

    fn compare_float(&mut self, f: impl Fn(f32, f32) -> bool) -> Fault<()> {
        let b = self.pop_f32()?;
        let a = self.pop_f32()?;
        self.stack.push(f(a, b) as u32);
        Ok(())
    }

    // =========================================================================
    // Host helpers
    // =========================================================================

    pub fn push_word(&mut self, word: u32) {
        self.stack.push(word);
    }

    pub fn push_int(&mut self, value: i32) {
        self.stack.push(value as u32);
    }

    pub fn push_float(&mut self, value: f32) {
        self.stack.push(value.to_bits());
    }

    pub fn push_bool(&mut self, value: bool) {
        self.stack.push(value as u32);
    }

    pub fn pop_word(&mut self) -> Result<u32, MachineError> {
        Ok(self.pop_raw()?)
    }

    pub fn pop_int(&mut self) -> Result<i32, MachineError> {
        Ok(self.pop_i32()?)
    }

    pub fn pop_float(&mut self) -> Result<f32, MachineError> {
        Ok(self.pop_f32()?)
    }

    pub fn pop_bool(&mut self) -> Result<bool, MachineError> {
        Ok(self.pop_raw()? != 0)
    }

    /// Reads a word at a stack or heap address.
    pub fn read_word(&self, address: u32) -> Result<u32, MachineError> {
        Ok(self.load(address)?)
    }

    pub fn write_word(&mut self, address: u32, value: u32) -> Result<(), MachineError> {
        Ok(self.store(address, value)?)
    }

    /// Decodes the string block at a heap address.
    pub fn read_string(&self, address: u32) -> Result<String, MachineError> {
        let index = heap_index(address)?;
        let payload = self.heap.read(index)?;
        Ok(decode_string(self.heap.slice(index + 1, payload)?))
    }

    /// Copies `text` into a new heap block and returns its address.
    pub fn alloc_string(&mut self, text: &str) -> Result<u32, MachineError> {
        let block = encode_string(text);
        let index = self.heap.allocate(block.len() as u32)?;
        self.heap
            .slice_mut(index, block.len() as u32)?
            .copy_from_slice(&block);
        Ok(HEAP_BIT | index)
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("state", &self.state)
            .field("chunk", &self.chunk)
            .field("ip", &self.ip)
            .field("fp", &self.fp)
            .field("stack", &self.stack.len())
            .field("heap", &self.heap.len())
            .field("frames", &self.frames.len())
            .finish()
    }
}

fn heap_index(address: u32) -> Fault<u32> {
    if address & HEAP_BIT == 0 {
        return Err(FaultKind::AddressOutOfBounds(address));
    }
    Ok(address & !HEAP_BIT)
}

/// Offsets stay within the address space they started in.
fn offset_address(address: u32, offset: u32) -> Fault<u32> {
    let result = address
        .checked_add(offset)
        .ok_or(FaultKind::AddressOutOfBounds(address))?;
    if (result ^ address) & HEAP_BIT != 0 {
        return Err(FaultKind::AddressOutOfBounds(result));
    }
    Ok(result)
}

fn check_index(index: i32, length: u32) -> Fault<()> {
    if index < 0 || index as u32 >= length {
        return Err(FaultKind::IndexOutOfBounds { index, length });
    }
    Ok(())
}

fn list_block_words(capacity: u32, element_words: u32) -> Fault<u32> {
    capacity
        .checked_mul(element_words)
        .and_then(|w| w.checked_add(LIST_HEADER_WORDS))
        .ok_or(FaultKind::InvalidProgram("list block too large".into()))
}
