//! The seam between the execution core and an instruction interpreter.
//!
//! The core never decodes instructions. Interpreted frames are handed to
//! the installed [`Dispatcher`], which runs them and calls back into the
//! core for calls (`precall`, `pretailcall`, `poscall`), upvalues, closing
//! and hooks.

use crate::error::LuaResult;
use crate::state::Vm;
use std::rc::Rc;

pub trait Dispatcher {
    /// Run interpreted frame `ci` from its saved pc. Calls to other
    /// interpreted functions stay inside the same invocation; it returns
    /// once a frame marked `FRESH` returns (or once `ci` returns, if `ci`
    /// is being resumed and is not fresh).
    fn execute(&self, vm: &mut Vm, ci: usize) -> LuaResult<()>;

    /// Complete the instruction of frame `ci` that was interrupted by a
    /// yield, using the values the callee left on the stack.
    fn finish_op(&self, vm: &mut Vm, ci: usize) -> LuaResult<()>;
}

impl Vm {
    /// Install the interpreter for interpreted frames.
    pub fn set_dispatcher(&mut self, d: Rc<dyn Dispatcher>) {
        self.dispatcher = Some(d);
    }

    pub(crate) fn execute(&mut self, ci: usize) -> LuaResult<()> {
        match self.dispatcher.clone() {
            Some(d) => d.execute(self, ci),
            None => Err(self.run_error("no interpreter installed")),
        }
    }

    pub(crate) fn finish_op(&mut self, ci: usize) -> LuaResult<()> {
        match self.dispatcher.clone() {
            Some(d) => d.finish_op(self, ci),
            None => Err(self.run_error("no interpreter installed")),
        }
    }
}
