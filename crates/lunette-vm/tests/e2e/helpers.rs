//! A tiny register machine and chunk builder used to drive the core from
//! the outside, the way a real interpreter would.

use lunette_core::object::GcRef;
use lunette_core::value::TValue;
use lunette_vm::dispatch::Dispatcher;
use lunette_vm::func::CloseStatus;
use lunette_vm::proto::{LocVar, UpvalDesc};
use lunette_vm::{ChunkLoader, HookMask, LoadMode, LuaResult, Status, Vm, VmConfig, MULTRET};
use std::rc::Rc;

// ---- Instruction set ----
//
// op in bits 0..8, A in 8..16, B in 16..24, C in 24..32; sBx is the signed
// 16-bit field over B and C.

pub mod op {
    /// R[A] = R[B]
    pub const MOVE: u8 = 0;
    /// R[A] = K[Bx]
    pub const LOADK: u8 = 1;
    /// R[A] = sBx
    pub const LOADI: u8 = 2;
    /// R[A] = nil
    pub const LOADNIL: u8 = 3;
    /// R[A] = Up[B]
    pub const GETUPVAL: u8 = 4;
    /// Up[B] = R[A]
    pub const SETUPVAL: u8 = 5;
    /// R[A] = R[B] + sC
    pub const ADDI: u8 = 6;
    /// pc += sBx if R[A] == 0
    pub const JMPZ: u8 = 7;
    /// pc += sBx
    pub const JMP: u8 = 8;
    /// R[A] = {}
    pub const NEWTABLE: u8 = 9;
    /// R[A][B] = R[C]
    pub const SETI: u8 = 10;
    /// R[A] = R[B][C]
    pub const GETI: u8 = 11;
    /// R[A](R[A+1], ..., R[A+B-1]) with C-1 results; B == 0 passes up to
    /// top, C == 0 keeps every result.
    pub const CALL: u8 = 12;
    /// return R[A](...) with B as in CALL.
    pub const TAILCALL: u8 = 13;
    /// return R[A], ..., R[A+B-2]; B == 0 returns up to top. C != 0 closes
    /// pending variables first.
    pub const RETURN: u8 = 14;
    /// R[A] = closure(protos[Bx])
    pub const CLOSURE: u8 = 15;
    /// mark R[A] to be closed
    pub const TBC: u8 = 16;
    /// close upvalues and variables from R[A] up
    pub const CLOSE: u8 = 17;
    /// adjust varargs for A fixed parameters
    pub const VARARGPREP: u8 = 18;
    /// R[A], ..., R[A+C-2] = vararg; C == 0 copies all of them
    pub const VARARG: u8 = 19;
}

pub fn abc(op: u8, a: u8, b: u8, c: u8) -> u32 {
    op as u32 | (a as u32) << 8 | (b as u32) << 16 | (c as u32) << 24
}

pub fn asbx(op: u8, a: u8, sbx: i16) -> u32 {
    op as u32 | (a as u32) << 8 | (sbx as u16 as u32) << 16
}

fn decode(i: u32) -> (u8, usize, usize, usize, i64) {
    let op = (i & 0xff) as u8;
    let a = ((i >> 8) & 0xff) as usize;
    let b = ((i >> 16) & 0xff) as usize;
    let c = (i >> 24) as usize;
    let sbx = (i >> 16) as u16 as i16 as i64;
    (op, a, b, c, sbx)
}

/// Executes the instruction set above.
pub struct TestMachine;

impl TestMachine {
    /// Registers start out nil and `top` covers the whole frame.
    fn enter_frame(vm: &mut Vm, ci: usize) -> LuaResult<()> {
        let frame_top = vm.frame(ci).top;
        for slot in vm.top()..frame_top {
            vm.set_stack_value(slot, TValue::Nil);
        }
        vm.set_top_raw(frame_top);
        if !vm.hook_mask().is_empty() {
            vm.hook_call(ci)?;
        }
        Ok(())
    }

    fn reg_table(vm: &mut Vm, slot: usize) -> LuaResult<GcRef> {
        match vm.stack_value(slot).as_table_ref() {
            Some(t) => Ok(t),
            None => Err(vm.run_error("attempt to index a non-table value")),
        }
    }
}

impl Dispatcher for TestMachine {
    fn execute(&self, vm: &mut Vm, ci: usize) -> LuaResult<()> {
        'start: loop {
            let TValue::LuaFn(cl) = vm.stack_value(vm.frame(ci).func) else {
                return Err(vm.run_error("frame without a closure"));
            };
            let p = vm.heap.get_closure(cl).proto;
            let (code, consts) = (vm.proto(p).code.clone(), vm.proto(p).constants.clone());
            let (nparams, is_vararg) = (vm.proto(p).num_params as usize, vm.proto(p).is_vararg);
            if vm.frame(ci).savedpc == 0 && !is_vararg {
                Self::enter_frame(vm, ci)?;
            }
            loop {
                let pc = vm.frame(ci).savedpc;
                let Some(&inst) = code.get(pc) else {
                    return Err(vm.run_error("fell off the end of the code"));
                };
                let (op, a, b, c, sbx) = decode(inst);
                if vm.hook_mask().intersects(HookMask::LINE | HookMask::COUNT) {
                    let uses_top = matches!(op, op::CALL | op::TAILCALL | op::RETURN) && b == 0;
                    vm.trace_exec(pc, uses_top)?;
                }
                vm.frame_mut(ci).savedpc = pc + 1;
                let base = vm.frame(ci).func + 1;
                let ra = base + a;
                match op {
                    op::MOVE => vm.set_stack_value(ra, vm.stack_value(base + b)),
                    op::LOADK => vm.set_stack_value(ra, consts[(sbx as u16) as usize]),
                    op::LOADI => vm.set_stack_value(ra, TValue::Int(sbx)),
                    op::LOADNIL => vm.set_stack_value(ra, TValue::Nil),
                    op::GETUPVAL => vm.set_stack_value(ra, vm.upval_get(cl, b)),
                    op::SETUPVAL => {
                        let v = vm.stack_value(ra);
                        vm.upval_set(cl, b, v);
                    }
                    op::ADDI => {
                        let Some(n) = vm.stack_value(base + b).as_integer() else {
                            return Err(vm.run_error("attempt to perform arithmetic on a non-integer"));
                        };
                        vm.set_stack_value(ra, TValue::Int(n + (c as u8 as i8) as i64));
                    }
                    op::JMPZ => {
                        if vm.stack_value(ra) == TValue::Int(0) {
                            vm.frame_mut(ci).savedpc = (pc as i64 + 1 + sbx) as usize;
                        }
                    }
                    op::JMP => vm.frame_mut(ci).savedpc = (pc as i64 + 1 + sbx) as usize,
                    op::NEWTABLE => {
                        let t = vm.new_table(0, 0)?;
                        vm.pop(1);
                        vm.set_stack_value(ra, TValue::Table(t));
                    }
                    op::SETI => {
                        let t = Self::reg_table(vm, ra)?;
                        let v = vm.stack_value(base + c);
                        vm.table_seti(t, b as i64, v);
                    }
                    op::GETI => {
                        let t = Self::reg_table(vm, base + b)?;
                        let v = vm.heap.get_table(t).raw_geti(c as i64);
                        vm.set_stack_value(ra, v);
                    }
                    op::CALL => {
                        if b != 0 {
                            vm.set_top_raw(ra + b);
                        }
                        let nresults = c as i32 - 1;
                        if let Some(newci) = vm.precall(ra, nresults)? {
                            self.execute(vm, newci)?;
                        }
                        if nresults != MULTRET {
                            vm.set_top_raw(vm.frame(ci).top);
                        }
                    }
                    op::TAILCALL => {
                        if b != 0 {
                            vm.set_top_raw(ra + b);
                        }
                        let narg1 = vm.top() - ra;
                        vm.close_upvals(base);
                        let delta = if is_vararg { vm.frame(ci).nextraargs + nparams + 1 } else { 0 };
                        match vm.pretailcall(ci, ra, narg1, delta)? {
                            None => continue 'start,
                            Some(n) => {
                                vm.frame_mut(ci).func -= delta;
                                vm.poscall(ci, n)?;
                                return Ok(());
                            }
                        }
                    }
                    op::RETURN => {
                        let n = if b == 0 { vm.top() - ra } else { b - 1 };
                        if c != 0 {
                            vm.frame_mut(ci).nres = n;
                            if vm.top() < vm.frame(ci).top {
                                vm.set_top_raw(vm.frame(ci).top);
                            }
                            vm.close(base, CloseStatus::KeepTop, true)?;
                        }
                        if is_vararg {
                            let delta = vm.frame(ci).nextraargs + nparams + 1;
                            vm.frame_mut(ci).func -= delta;
                        }
                        vm.set_top_raw(ra + n);
                        vm.poscall(ci, n)?;
                        return Ok(());
                    }
                    op::CLOSURE => {
                        let child = vm.proto(p).protos[(sbx as u16) as usize];
                        let descs = vm.proto(child).upvalues.clone();
                        let ncl = vm.new_lua_closure(child, descs.len())?;
                        vm.set_stack_value(ra, TValue::LuaFn(ncl));
                        for (i, d) in descs.iter().enumerate() {
                            let uv = if d.in_stack {
                                vm.find_upval(base + d.index as usize)?
                            } else {
                                match vm.heap.get_closure(cl).upvals[d.index as usize] {
                                    Some(uv) => uv,
                                    None => return Err(vm.run_error("missing enclosing upvalue")),
                                }
                            };
                            vm.heap.get_closure_mut(ncl).upvals[i] = Some(uv);
                            vm.obj_barrier(ncl, uv);
                        }
                        vm.check_gc();
                    }
                    op::TBC => vm.new_tbc_upval(ra)?,
                    op::CLOSE => {
                        vm.close(ra, CloseStatus::Normal, true)?;
                        vm.set_top_raw(vm.frame(ci).top);
                    }
                    op::VARARGPREP => {
                        vm.adjust_varargs(ci, a)?;
                        Self::enter_frame(vm, ci)?;
                    }
                    op::VARARG => vm.get_varargs(ci, ra, c as i32 - 1)?,
                    _ => return Err(vm.run_error(&format!("bad opcode {op}"))),
                }
            }
        }
    }

    fn finish_op(&self, vm: &mut Vm, ci: usize) -> LuaResult<()> {
        let TValue::LuaFn(cl) = vm.stack_value(vm.frame(ci).func) else {
            return Err(vm.run_error("frame without a closure"));
        };
        let p = vm.heap.get_closure(cl).proto;
        let pc = vm.frame(ci).savedpc - 1;
        let (op, a, _, c, _) = decode(vm.proto(p).code[pc]);
        match op {
            op::CALL if c != 0 => vm.set_top_raw(vm.frame(ci).top),
            op::RETURN => {
                // closing yielded; redo the return
                let ra = vm.frame(ci).func + 1 + a;
                let nres = vm.frame(ci).nres;
                vm.set_top_raw(ra + nres);
                vm.frame_mut(ci).savedpc -= 1;
            }
            op::CLOSE => {
                vm.set_top_raw(vm.frame(ci).top);
                vm.frame_mut(ci).savedpc -= 1;
            }
            _ => {}
        }
        Ok(())
    }
}

// ---- Chunks ----

#[derive(Debug, Clone, Copy)]
pub enum Const {
    Int(i64),
    Str(&'static str),
}

/// Blueprint of a prototype; also the loader that builds it.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack: u8,
    pub code: Vec<u32>,
    pub constants: Vec<Const>,
    /// (in_stack, index)
    pub upvalues: Vec<(bool, u8)>,
    pub children: Vec<Chunk>,
    pub lines: Vec<u32>,
    /// (name, start_pc, end_pc)
    pub locals: Vec<(&'static str, u32, u32)>,
}

impl Chunk {
    /// A main chunk: `_ENV` as its only upvalue.
    pub fn main(max_stack: u8, code: Vec<u32>) -> Chunk {
        Chunk { max_stack, code, upvalues: vec![(true, 0)], ..Default::default() }
    }

    pub fn func(num_params: u8, max_stack: u8, code: Vec<u32>) -> Chunk {
        Chunk { num_params, max_stack, code, ..Default::default() }
    }

    pub fn with_children(mut self, children: Vec<Chunk>) -> Chunk {
        self.children = children;
        self
    }

    pub fn with_upvalues(mut self, upvalues: Vec<(bool, u8)>) -> Chunk {
        self.upvalues = upvalues;
        self
    }

    fn build(&self, vm: &mut Vm, p: GcRef) -> LuaResult<()> {
        {
            let proto = vm.proto_mut(p);
            proto.num_params = self.num_params;
            proto.is_vararg = self.is_vararg;
            proto.max_stack_size = self.max_stack.max(2);
            proto.code = self.code.clone();
            proto.line_info = self.lines.clone();
        }
        for k in &self.constants {
            match *k {
                Const::Int(i) => {
                    vm.add_constant(p, TValue::Int(i));
                }
                Const::Str(s) => {
                    vm.add_string_constant(p, s.as_bytes())?;
                }
            }
        }
        for &(in_stack, index) in &self.upvalues {
            vm.proto_mut(p).upvalues.push(UpvalDesc { name: None, in_stack, index });
        }
        for &(name, start_pc, end_pc) in &self.locals {
            let name = vm.intern_name(p, name.as_bytes())?;
            vm.proto_mut(p).locvars.push(LocVar { name: Some(name), start_pc, end_pc });
        }
        for child in &self.children {
            let cp = vm.new_child_proto(p)?;
            child.build(vm, cp)?;
        }
        Ok(())
    }
}

impl ChunkLoader for Chunk {
    fn undump(&self, vm: &mut Vm, proto: GcRef, _chunk: &[u8], _name: &str) -> LuaResult<()> {
        self.build(vm, proto)
    }

    fn parse(&self, vm: &mut Vm, proto: GcRef, _chunk: &[u8], _name: &str) -> LuaResult<()> {
        self.build(vm, proto)
    }
}

// ---- Running ----

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn new_vm_with(config: VmConfig) -> Vm {
    init_tracing();
    let mut vm = Vm::new(config);
    vm.set_dispatcher(Rc::new(TestMachine));
    vm
}

pub fn new_vm() -> Vm {
    new_vm_with(VmConfig::default())
}

/// Load `chunk` and leave its closure on top.
pub fn load(vm: &mut Vm, chunk: &Chunk) {
    let st = vm.load(chunk, b"-- test chunk", Some("=test"), LoadMode::Text);
    assert_eq!(st, Status::Ok, "load failed: {:?}", error_string(vm, -1));
}

/// Load and call `chunk` in protected mode, returning every result.
pub fn run(vm: &mut Vm, chunk: &Chunk, args: &[TValue]) -> Vec<TValue> {
    let base = vm.get_top();
    load(vm, chunk);
    for &a in args {
        vm.push(a).unwrap();
    }
    let st = vm.pcall(args.len(), MULTRET, 0);
    assert_eq!(st, Status::Ok, "runtime error: {:?}", error_string(vm, -1));
    let results = (base + 1..=vm.get_top()).map(|i| vm.value(i as i32)).collect();
    vm.set_top(base as i32).unwrap();
    results
}

/// Load and call `chunk`, expecting an error; returns its message.
pub fn run_err(vm: &mut Vm, chunk: &Chunk) -> String {
    let base = vm.get_top();
    load(vm, chunk);
    let st = vm.pcall(0, MULTRET, 0);
    assert!(st.is_error(), "expected error, got {st:?}");
    let msg = error_string(vm, -1).unwrap_or_default();
    vm.set_top(base as i32).unwrap();
    msg
}

pub fn error_string(vm: &Vm, idx: i32) -> Option<String> {
    vm.to_string_lossy(vm.value(idx))
}

/// Check that results[idx] is an integer with the expected value.
pub fn assert_int(results: &[TValue], idx: usize, expected: i64) {
    let val = results[idx];
    let got = val
        .as_integer()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected integer {expected}", val));
    assert_eq!(got, expected, "result[{idx}] = {got}, expected {expected}");
}

/// Check that results[idx] is nil.
pub fn assert_nil(results: &[TValue], idx: usize) {
    let val = results[idx];
    assert!(val.is_nil(), "result[{idx}] = {:?}, expected nil", val);
}

/// Check that results[idx] is a string with the expected value.
pub fn assert_str(vm: &Vm, results: &[TValue], idx: usize, expected: &str) {
    let val = results[idx];
    let got = vm
        .to_string_lossy(val)
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected string \"{expected}\"", val));
    assert_eq!(got, expected, "result[{idx}] = \"{got}\", expected \"{expected}\"");
}

/// Check the results are exactly these integers.
pub fn assert_ints(results: &[TValue], expected: &[i64]) {
    assert_eq!(
        results.len(),
        expected.len(),
        "expected {} results, got {}: {:?}",
        expected.len(),
        results.len(),
        results
    );
    for (i, &e) in expected.iter().enumerate() {
        assert_int(results, i, e);
    }
}

// ---- Natives ----

/// Returns its arguments.
pub fn native_id(vm: &mut Vm) -> LuaResult<usize> {
    Ok(vm.get_top())
}

/// Yields its arguments.
pub fn native_yield(vm: &mut Vm) -> LuaResult<usize> {
    let n = vm.get_top();
    vm.yield_values(n)
}

/// Raises its first argument as the error object.
pub fn native_error(vm: &mut Vm) -> LuaResult<usize> {
    vm.set_top(1)?;
    Err(vm.error())
}

/// Current call depth of the running thread.
pub fn native_depth(vm: &mut Vm) -> LuaResult<usize> {
    let depth = vm.thread(vm.current_thread()).call_depth();
    vm.push(TValue::Int(depth as i64))?;
    Ok(1)
}

/// Create a coroutine running the function on top of the stack (popped).
/// The thread is left on the stack in its place.
pub fn new_coroutine(vm: &mut Vm) -> GcRef {
    let co = vm.new_thread().unwrap();
    vm.push_value(-2).unwrap();
    let cur = vm.current_thread();
    vm.xmove(cur, co, 1).unwrap();
    // drop the function, keep the thread
    vm.copy(-1, -2);
    vm.pop(1);
    co
}

/// Resume `co` with `args`; returns the status and the values it passed back.
pub fn resume(vm: &mut Vm, co: GcRef, args: &[TValue]) -> (Status, Vec<TValue>) {
    let cur = vm.current_thread();
    for &a in args {
        vm.push(a).unwrap();
    }
    vm.xmove(cur, co, args.len()).unwrap();
    let (st, n) = vm.resume(co, args.len());
    let t = vm.thread(co);
    let vals = (t.top() - n..t.top()).map(|i| t.value_at(i)).collect();
    if n > 0 {
        vm.xmove(co, cur, n).unwrap();
        vm.pop(n);
    }
    (st, vals)
}

// ---- Objects ----

/// `t[name] = v` for the table at `idx`.
pub fn set_field(vm: &mut Vm, idx: i32, name: &str, v: TValue) {
    let idx = vm.abs_index(idx);
    vm.push_string(name).unwrap();
    vm.push(v).unwrap();
    vm.raw_set(idx).unwrap();
}

/// Push a table whose metatable maps `event` to `f`.
pub fn new_object_with(vm: &mut Vm, event: &'static str, f: lunette_vm::NativeFn) -> GcRef {
    let obj = vm.new_table(0, 0).unwrap();
    vm.new_table(0, 1).unwrap();
    let fv = vm.register_native(event, f);
    set_field(vm, -1, event, fv);
    vm.set_metatable(-2);
    obj
}

/// Append `v` to the array part of the globals table.
pub fn record(vm: &mut Vm, v: TValue) {
    let g = vm.globals().as_table_ref().unwrap();
    let n = vm.heap.get_table(g).length();
    vm.table_seti(g, n + 1, v);
}

/// Everything passed to [`record`] so far.
pub fn recorded(vm: &Vm) -> Vec<TValue> {
    let g = vm.globals().as_table_ref().unwrap();
    let t = vm.heap.get_table(g);
    (1..=t.length()).map(|i| t.raw_geti(i)).collect()
}

/// `__close` method recording its error argument, or `true` without one.
pub fn native_record_close(vm: &mut Vm) -> LuaResult<usize> {
    let err = vm.value(2);
    record(vm, if err.is_nil() { TValue::Bool(true) } else { err });
    Ok(0)
}
