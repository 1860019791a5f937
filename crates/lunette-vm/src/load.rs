//! Loading chunks.
//!
//! Turning source text or a precompiled image into a prototype is the job
//! of an external [`ChunkLoader`]. The core decides which of its entry
//! points applies, runs it in protected mode with yields disabled, and
//! wraps the result in a closure whose first upvalue is the globals table.

use crate::error::{LuaError, LuaResult, Status};
use crate::heap::GcObject;
use crate::proto::Proto;
use crate::state::Vm;
use lunette_core::object::GcRef;
use lunette_core::value::TValue;
use tracing::debug;

/// First byte of a precompiled chunk.
pub const LUA_SIGNATURE: u8 = 0x1b;

/// Which chunk formats `load` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    Binary,
    Text,
    #[default]
    Both,
}

impl LoadMode {
    /// Mode string as shown in messages ("b", "t" or "bt").
    pub fn as_str(self) -> &'static str {
        match self {
            LoadMode::Binary => "b",
            LoadMode::Text => "t",
            LoadMode::Both => "bt",
        }
    }

    pub fn from_mode(mode: &str) -> LoadMode {
        match (mode.contains('b'), mode.contains('t')) {
            (true, false) => LoadMode::Binary,
            (false, true) => LoadMode::Text,
            _ => LoadMode::Both,
        }
    }

    fn allows_binary(self) -> bool {
        self != LoadMode::Text
    }

    fn allows_text(self) -> bool {
        self != LoadMode::Binary
    }
}

/// Builds prototypes from chunks.
///
/// Both entry points fill `proto`, a fresh prototype that is already
/// reachable from the stack, so objects attached to it with
/// [`Vm::add_constant`] or [`Vm::new_child_proto`] are safe from the
/// collector. Errors should be `LuaError::Syntax`.
pub trait ChunkLoader {
    /// Precompiled chunk (starts with [`LUA_SIGNATURE`]).
    fn undump(&self, vm: &mut Vm, proto: GcRef, chunk: &[u8], name: &str) -> LuaResult<()>;
    /// Source text.
    fn parse(&self, vm: &mut Vm, proto: GcRef, chunk: &[u8], name: &str) -> LuaResult<()>;
}

impl Vm {
    pub fn proto(&self, p: GcRef) -> &Proto {
        self.heap.get_proto(p)
    }

    /// Mutable access for loaders. Collectable values must go through
    /// [`Vm::add_constant`] and [`Vm::new_child_proto`] instead.
    pub fn proto_mut(&mut self, p: GcRef) -> &mut Proto {
        self.heap.get_proto_mut(p)
    }

    /// Append constant `v` to `p`; returns its index.
    pub fn add_constant(&mut self, p: GcRef, v: TValue) -> usize {
        let k = &mut self.heap.get_proto_mut(p).constants;
        k.push(v);
        let idx = k.len() - 1;
        self.barrier(p, v);
        self.heap.recharge(p);
        idx
    }

    /// Intern `s` and append it as a constant of `p`.
    pub fn add_string_constant(&mut self, p: GcRef, s: &[u8]) -> LuaResult<usize> {
        let r = self.intern(s)?;
        Ok(self.add_constant(p, TValue::Str(r)))
    }

    /// Create an empty prototype nested in `parent`.
    pub fn new_child_proto(&mut self, parent: GcRef) -> LuaResult<GcRef> {
        let child = self.alloc(GcObject::Proto(Box::default()))?;
        let source = self.heap.get_proto(parent).source;
        let pp = self.heap.get_proto_mut(parent);
        pp.protos.push(child);
        self.obj_barrier(parent, child);
        self.heap.get_proto_mut(child).source = source;
        self.heap.recharge(parent);
        Ok(child)
    }

    /// Name of an upvalue or local of `p`, interned.
    pub fn intern_name(&mut self, p: GcRef, name: &[u8]) -> LuaResult<GcRef> {
        let r = self.intern(name)?;
        self.obj_barrier(p, r);
        Ok(r)
    }

    fn recharge_proto_tree(&mut self, p: GcRef) {
        let mut pending = vec![p];
        while let Some(p) = pending.pop() {
            self.heap.recharge(p);
            pending.extend(self.heap.get_proto(p).protos.iter().copied());
        }
    }

    fn check_mode(&mut self, mode: LoadMode, binary: bool) -> LuaResult<()> {
        let ok = if binary { mode.allows_binary() } else { mode.allows_text() };
        if ok {
            return Ok(());
        }
        let what = if binary { "binary" } else { "text" };
        let msg = format!("attempt to load a {what} chunk (mode is '{}')", mode.as_str());
        let s = self.intern(msg.as_bytes())?;
        Err(LuaError::Syntax(TValue::Str(s)))
    }

    fn parse_chunk(
        &mut self,
        loader: &dyn ChunkLoader,
        chunk: &[u8],
        name: &str,
        mode: LoadMode,
    ) -> LuaResult<()> {
        let binary = chunk.first() == Some(&LUA_SIGNATURE);
        self.check_mode(mode, binary)?;
        let p = self.alloc(GcObject::Proto(Box::default()))?;
        let cl = self.new_lua_closure(p, 0)?;
        self.push(TValue::LuaFn(cl))?;
        let source = self.intern(name.as_bytes())?;
        self.heap.get_proto_mut(p).source = Some(source);
        self.obj_barrier(p, source);
        if binary {
            loader.undump(self, p, chunk, name)?;
        } else {
            loader.parse(self, p, chunk, name)?;
        }
        self.recharge_proto_tree(p);
        let nup = self.heap.get_proto(p).upvalues.len();
        self.heap.get_closure_mut(cl).upvals = vec![None; nup];
        self.heap.recharge(cl);
        self.init_upvals(cl)
    }

    /// Load a chunk and push the resulting function, or push the error
    /// object. The first upvalue of the function, if any, is set to the
    /// globals table.
    pub fn load(
        &mut self,
        loader: &dyn ChunkLoader,
        chunk: &[u8],
        chunkname: Option<&str>,
        mode: LoadMode,
    ) -> Status {
        let name = chunkname.unwrap_or("?");
        let old_top = self.th().top;
        let ef = self.th().errfunc;
        // cannot yield while parsing
        self.th_mut().nny += 1;
        let result =
            self.protected_call(|vm| vm.parse_chunk(loader, chunk, name, mode), old_top, ef);
        self.th_mut().nny -= 1;
        match result {
            Ok(()) => {
                let top = self.th().top;
                if let TValue::LuaFn(cl) = self.th().stack[top - 1] {
                    if let Some(Some(uv)) = self.heap.get_closure(cl).upvals.first().copied() {
                        let gt = self.globals();
                        *self.heap.get_upval_mut(uv) = crate::heap::UpVal::Closed(gt);
                        self.barrier(uv, gt);
                    }
                }
                debug!(target: "lunette::load", chunk = name, mode = mode.as_str(), "chunk loaded");
                Status::Ok
            }
            Err(e) => {
                debug!(target: "lunette::load", chunk = name, status = ?e.status(), "load failed");
                e.status()
            }
        }
    }
}
