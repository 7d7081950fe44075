use thiserror::Error;

/// Runtime faults of the reference interpreter. Only `throw`/`rethrow`
/// raise catchable exceptions; these abort execution.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{opcode} parameter error: {message}")]
    OpcodeParamError {
        opcode: &'static str,
        message: String,
    },

    #[error("{opcode} expects a value on the stack")]
    StackEmpty { opcode: &'static str },

    #[error("{opcode}: {found} is not a valid operand")]
    BadValue { opcode: &'static str, found: String },

    #[error("{opcode}: division by zero")]
    DivideByZero { opcode: &'static str },

    #[error("{opcode}: null reference")]
    NullReference { opcode: &'static str },

    #[error("cannot cast {from} to {to}")]
    InvalidCast { from: String, to: String },

    #[error("{opcode}: index {index} is outside an array of length {len}")]
    IndexOutOfRange {
        opcode: &'static str,
        index: i64,
        len: usize,
    },

    #[error("unhandled exception of type {class}")]
    Unhandled { class: String },

    #[error("rethrow outside an active catch handler")]
    NoActiveException,

    #[error("instruction {index} targets instruction {target}, past the end of the stream")]
    TargetOutOfRange { index: usize, target: usize },

    #[error("control ran past the last instruction")]
    FellOffEnd,

    #[error("step limit of {0} instructions exhausted")]
    OutOfFuel(usize),

    #[error("{method} returned no value")]
    MissingReturn { method: String },

    #[error("method expects {expected} arguments, got {found}")]
    ArgumentCount { expected: usize, found: usize },
}
