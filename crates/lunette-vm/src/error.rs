//! Status codes and the error type carried by every fallible operation.
//!
//! Raising an error is returning `Err`; `?` unwinds to the nearest protected
//! region, which is an ordinary function boundary (`raw_run_protected`).

use lunette_core::value::TValue;

/// Completion status of a protected region.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    ErrErr = 5,
}

impl Status {
    /// True for the error categories (not `Ok`, not `Yield`).
    #[inline]
    pub fn is_error(self) -> bool {
        self as u8 > Status::Yield as u8
    }
}

/// Why control is unwinding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LuaError {
    /// Coroutine suspension; values stay on the yielding thread's stack.
    #[error("coroutine yield")]
    Yield,
    #[error("runtime error: {0:?}")]
    Runtime(TValue),
    #[error("syntax error: {0:?}")]
    Syntax(TValue),
    #[error("not enough memory")]
    Memory,
    #[error("error in error handling")]
    ErrorInHandler,
}

impl LuaError {
    pub fn status(&self) -> Status {
        match self {
            LuaError::Yield => Status::Yield,
            LuaError::Runtime(_) => Status::ErrRun,
            LuaError::Syntax(_) => Status::ErrSyntax,
            LuaError::Memory => Status::ErrMem,
            LuaError::ErrorInHandler => Status::ErrErr,
        }
    }

    /// Rebuild an error from a status and the error object found on a stack.
    pub fn from_status(status: Status, value: TValue) -> Option<LuaError> {
        match status {
            Status::Ok => None,
            Status::Yield => Some(LuaError::Yield),
            Status::ErrRun => Some(LuaError::Runtime(value)),
            Status::ErrSyntax => Some(LuaError::Syntax(value)),
            Status::ErrMem => Some(LuaError::Memory),
            Status::ErrErr => Some(LuaError::ErrorInHandler),
        }
    }
}

pub type LuaResult<T> = Result<T, LuaError>;
