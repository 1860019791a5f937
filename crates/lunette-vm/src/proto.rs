//! Function prototypes as the execution core sees them.
//!
//! Only the shape matters here: instruction encoding and semantics belong to
//! the installed dispatcher.

use lunette_core::object::GcRef;
use lunette_core::value::TValue;
use std::mem::size_of;

/// How a closure obtains an upvalue when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalDesc {
    pub name: Option<GcRef>,
    /// Captures a local of the enclosing function (otherwise one of its upvalues).
    pub in_stack: bool,
    pub index: u8,
}

/// Debug information for a local variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocVar {
    pub name: Option<GcRef>,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// A function prototype.
#[derive(Debug, Clone, Default)]
pub struct Proto {
    pub num_params: u8,
    pub is_vararg: bool,
    /// Registers needed by the function.
    pub max_stack_size: u8,
    pub code: Vec<u32>,
    pub constants: Vec<TValue>,
    /// Nested prototypes.
    pub protos: Vec<GcRef>,
    pub upvalues: Vec<UpvalDesc>,
    pub locvars: Vec<LocVar>,
    /// Source line of each instruction; empty when stripped.
    pub line_info: Vec<u32>,
    pub source: Option<GcRef>,
    pub line_defined: u32,
    pub last_line_defined: u32,
}

impl Proto {
    pub fn new(num_params: u8, is_vararg: bool, max_stack_size: u8) -> Self {
        Proto {
            num_params,
            is_vararg,
            max_stack_size: max_stack_size.max(2),
            ..Default::default()
        }
    }

    /// Line of instruction `pc`, or -1 without debug information.
    pub fn line_at(&self, pc: usize) -> i32 {
        self.line_info.get(pc).map_or(-1, |&l| l as i32)
    }

    /// Name of the `n`-th (1-based) local variable active at `pc`.
    pub fn local_name(&self, n: usize, pc: usize) -> Option<GcRef> {
        self.locvars
            .iter()
            .take_while(|lv| lv.start_pc as usize <= pc)
            .filter(|lv| pc < lv.end_pc as usize)
            .nth(n.checked_sub(1)?)
            .and_then(|lv| lv.name)
    }

    pub fn byte_size(&self) -> usize {
        size_of::<Proto>()
            + self.code.len() * size_of::<u32>()
            + self.constants.len() * size_of::<TValue>()
            + self.protos.len() * size_of::<GcRef>()
            + self.upvalues.len() * size_of::<UpvalDesc>()
            + self.locvars.len() * size_of::<LocVar>()
            + self.line_info.len() * size_of::<u32>()
    }
}
