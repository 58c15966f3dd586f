use std::fmt;

use crate::{Opcode, Position};

/// The overall outcome of interpreting a piece of source code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// One or more compilation errors were reported.
    #[error("Compilation error(s) occurred.")]
    Compile,
    /// A runtime error aborted execution.
    #[error("Runtime error(s) occurred.")]
    Runtime,
}

/// An error raised while the virtual machine is executing.
///
/// The display text matches clox's diagnostics byte for byte; the variants
/// keep the failure shapes distinguishable for callers and tests.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// A byte in the instruction stream does not decode to an opcode.
    #[error(transparent)]
    InvalidOpcode(#[from] num_enum::TryFromPrimitiveError<Opcode>),
    /// A unary numeric opcode was given a non-number.
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    /// A binary numeric opcode was given a non-number.
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    /// `+` was given operands it can neither add nor concatenate.
    #[error("Operands must be two numbers or two strings.")]
    InvalidAddOperands,
    /// A global was read or assigned before being defined.
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    /// A property was read off an instance that has no such field or method.
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    /// The called value is not a closure, native, class, or bound method.
    #[error("Can only call functions and classes.")]
    NotCallable,
    /// A property was read from a value that is not an instance.
    #[error("Only instances have properties.")]
    NoProperties,
    /// A field was written to a value that is not an instance.
    #[error("Only instances have fields.")]
    NoFields,
    /// A method was invoked on a value that is not an instance.
    #[error("Only instances have methods.")]
    NoMethods,
    /// A class was declared to inherit from a non-class value.
    #[error("Superclass must be a class.")]
    SuperclassNotClass,
    /// A call supplied the wrong number of arguments.
    #[error("Expected {expected} arguments but got {got}.")]
    WrongArity {
        /// The callee's declared parameter count.
        expected: u8,
        /// The number of arguments at the call site.
        got: u8,
    },
    /// The call-frame limit was exceeded.
    #[error("Stack overflow.")]
    StackOverflow,
}

/// An error reported while parsing and compiling source code.
#[derive(Debug, Clone)]
pub enum ParseError {
    /// The current token cannot continue the production being parsed. A
    /// `None` lexeme means the parser ran out of input.
    UnexpectedToken {
        /// Where the offending token starts.
        pos: Position,
        /// The offending token's text, or `None` at end of input.
        lexeme: Option<String>,
        /// What the parser needed instead.
        message: String,
    },
}

impl ParseError {
    pub(crate) fn at(pos: Position, lexeme: &str, message: &str) -> Self {
        Self::UnexpectedToken {
            pos,
            lexeme: Some(lexeme.to_string()),
            message: message.to_string(),
        }
    }

    pub(crate) fn at_end(pos: Position, message: &str) -> Self {
        Self::UnexpectedToken {
            pos,
            lexeme: None,
            message: message.to_string(),
        }
    }
}

impl std::error::Error for ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedToken { pos, lexeme, message } => match lexeme {
                Some(lexeme) => write!(f, "{} Error at '{}': {}", pos, lexeme, message),
                None => write!(f, "{} Error at end: {}", pos, message),
            },
        }
    }
}
