use anyhow::Result;
use stackil_emit::{FinalizedStream, HandlerKind, ResolvedHandler, TargetBackend};
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::error::ExecError;
use crate::execute::StepResult;
use crate::heap::Heap;
use crate::host::Host;
use crate::value::{Place, Value};

/// A finalized stream checked for self-consistency and ready to run
#[derive(Debug, Clone)]
pub struct Executable {
    stream: FinalizedStream,
}

impl Executable {
    pub fn load(stream: FinalizedStream) -> Result<Self, ExecError> {
        let len = stream.len();
        for (index, instruction) in stream.instructions.iter().enumerate() {
            for target in instruction.targets() {
                if target.index >= len {
                    return Err(ExecError::TargetOutOfRange {
                        index,
                        target: target.index,
                    });
                }
            }
        }
        for handler in &stream.handlers {
            if handler.handler_start >= len {
                return Err(ExecError::TargetOutOfRange {
                    index: handler.try_start,
                    target: handler.handler_start,
                });
            }
        }
        debug!(instructions = len, handlers = stream.handlers.len(), "loaded executable");
        Ok(Self { stream })
    }

    pub fn stream(&self) -> &FinalizedStream {
        &self.stream
    }
}

/// Backend that turns a finalized stream into an [`Executable`]
#[derive(Debug, Default, Clone, Copy)]
pub struct Loader;

impl TargetBackend for Loader {
    type Output = Executable;
    type Error = ExecError;

    fn emit(&mut self, stream: &FinalizedStream) -> Result<Executable, ExecError> {
        Executable::load(stream.clone())
    }
}

/// Why a finally handler was entered and where to pick up afterwards
#[derive(Debug, Clone)]
enum Resume {
    Leave { from: usize, target: usize },
    Throw { exception: Value, from: usize },
}

#[derive(Debug, Clone)]
struct FinallyFrame {
    handler: usize,
    resume: Resume,
}

/// Activation of the method being interpreted
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) pc: usize,
    pub(crate) stack: Vec<Value>,
    pub(crate) locals: Vec<Value>,
    pub(crate) args: Vec<Value>,
    /// Exceptions held by the catch handlers currently running
    pub(crate) caught: Vec<(usize, Value)>,
    finally: Vec<FinallyFrame>,
}

impl Frame {
    pub(crate) fn place(&self, place: Place) -> Option<&Value> {
        match place {
            Place::Local(slot) => self.locals.get(usize::from(slot)),
            Place::Argument(index) => self.args.get(usize::from(index)),
        }
    }

    pub(crate) fn place_mut(&mut self, place: Place) -> Option<&mut Value> {
        match place {
            Place::Local(slot) => self.locals.get_mut(usize::from(slot)),
            Place::Argument(index) => self.args.get_mut(usize::from(index)),
        }
    }
}

fn covers_try(handler: &ResolvedHandler, index: usize) -> bool {
    handler.try_start <= index && index < handler.try_end
}

fn covers_handler(handler: &ResolvedHandler, index: usize) -> bool {
    handler.handler_start <= index && index < handler.handler_end
}

pub struct VM<H: Host> {
    pub(crate) host: H,
    pub(crate) heap: Heap,
    pub(crate) statics: HashMap<(String, String), Value>,
    fuel: Option<usize>,
    steps: usize,
}

impl<H: Host> VM<H> {
    pub fn new(host: H) -> Self {
        VM {
            host,
            heap: Heap::new(),
            statics: HashMap::new(),
            fuel: None,
            steps: 0,
        }
    }

    /// Abort any run that executes more than `steps` instructions
    pub fn with_fuel(mut self, steps: usize) -> Self {
        self.fuel = Some(steps);
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn static_field(&self, declaring: &str, name: &str) -> Option<&Value> {
        self.statics.get(&(declaring.to_string(), name.to_string()))
    }

    /// Instructions executed by the last run
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Run `executable` with `args`; returns the method's return value
    pub fn execute(&mut self, executable: &Executable, args: Vec<Value>) -> Result<Option<Value>> {
        let stream = executable.stream();
        let expected = stream.signature.argument_types().len();
        if args.len() != expected {
            return Err(ExecError::ArgumentCount {
                expected,
                found: args.len(),
            }
            .into());
        }

        let mut frame = Frame {
            pc: 0,
            stack: Vec::with_capacity(stream.max_stack),
            locals: stream.locals.iter().map(Value::default_for).collect(),
            args,
            caught: Vec::new(),
            finally: Vec::new(),
        };
        self.steps = 0;

        loop {
            if let Some(fuel) = self.fuel {
                if self.steps >= fuel {
                    return Err(ExecError::OutOfFuel(fuel).into());
                }
            }
            self.steps += 1;

            let Some(instruction) = stream.instructions.get(frame.pc) else {
                return Err(ExecError::FellOffEnd.into());
            };
            trace!(
                pc = frame.pc,
                opcode = instruction.opcode.mnemonic(),
                depth = frame.stack.len(),
                "step"
            );
            match self.step(&mut frame, stream, instruction)? {
                StepResult::Next => frame.pc += 1,
                StepResult::Jump(target) => frame.pc = target,
                StepResult::Return(value) => {
                    debug!(steps = self.steps, "returned");
                    return Ok(value);
                }
                StepResult::Throw(exception) => {
                    let from = frame.pc;
                    frame.finally.retain(|f| !covers_handler(&stream.handlers[f.handler], from));
                    frame.caught.retain(|(h, _)| !covers_handler(&stream.handlers[*h], from));
                    self.unwind(&mut frame, &stream.handlers, exception, from, 0)?;
                }
                StepResult::Leave(target) => {
                    let from = frame.pc;
                    frame.stack.clear();
                    frame.caught.retain(|(h, _)| !covers_handler(&stream.handlers[*h], from));
                    Self::leave(&mut frame, &stream.handlers, from, target, 0);
                }
                StepResult::EndFinally => {
                    let Some(pending) = frame.finally.pop() else {
                        return Err(ExecError::OpcodeParamError {
                            opcode: "endfinally",
                            message: "no finally handler is running".to_string(),
                        }
                        .into());
                    };
                    frame.stack.clear();
                    let next = pending.handler + 1;
                    match pending.resume {
                        Resume::Leave { from, target } => {
                            Self::leave(&mut frame, &stream.handlers, from, target, next)
                        }
                        Resume::Throw { exception, from } => {
                            self.unwind(&mut frame, &stream.handlers, exception, from, next)?
                        }
                    }
                }
            }
        }
    }

    /// Run the finally handlers a `leave` from `from` to `target` exits,
    /// innermost first, then continue at `target`
    fn leave(
        frame: &mut Frame,
        handlers: &[ResolvedHandler],
        from: usize,
        target: usize,
        start: usize,
    ) {
        for (index, handler) in handlers.iter().enumerate().skip(start) {
            if handler.kind == HandlerKind::Finally
                && covers_try(handler, from)
                && !covers_try(handler, target)
            {
                frame.finally.push(FinallyFrame {
                    handler: index,
                    resume: Resume::Leave { from, target },
                });
                frame.pc = handler.handler_start;
                return;
            }
        }
        frame.pc = target;
    }

    /// Find the handler for an exception raised at `from`, searching the
    /// table from `start`
    fn unwind(
        &mut self,
        frame: &mut Frame,
        handlers: &[ResolvedHandler],
        exception: Value,
        from: usize,
        start: usize,
    ) -> Result<()> {
        let class = self.heap.class_of(&exception);
        for (index, handler) in handlers.iter().enumerate().skip(start) {
            if !covers_try(handler, from) {
                continue;
            }
            frame.stack.clear();
            match &handler.kind {
                HandlerKind::Catch(filter) => {
                    let matches = class
                        .as_ref()
                        .is_some_and(|class| self.host.types().is_subtype(class, filter));
                    if matches {
                        debug!(handler = index, "exception caught");
                        frame.stack.push(exception.clone());
                        frame.caught.push((index, exception));
                        frame.pc = handler.handler_start;
                        return Ok(());
                    }
                }
                HandlerKind::Finally => {
                    frame.finally.push(FinallyFrame {
                        handler: index,
                        resume: Resume::Throw { exception, from },
                    });
                    frame.pc = handler.handler_start;
                    return Ok(());
                }
            }
        }
        let class = class.map(|c| c.name().to_string()).unwrap_or_else(|| "null".to_string());
        Err(ExecError::Unhandled { class }.into())
    }
}
