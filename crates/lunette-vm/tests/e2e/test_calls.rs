use super::helpers::op::*;
use super::helpers::*;
use lunette_core::value::TValue;
use lunette_vm::{LoadMode, LuaResult, Status, Vm, VmConfig};

fn three_values() -> Chunk {
    Chunk::func(
        0,
        3,
        vec![
            asbx(LOADI, 0, 1),
            asbx(LOADI, 1, 2),
            asbx(LOADI, 2, 3),
            abc(RETURN, 0, 4, 0),
        ],
    )
}

// ---- Results ----

#[test]
fn test_native_call_multret() {
    let mut vm = new_vm();
    let id = vm.register_native("id", native_id);
    let chunk = Chunk::func(
        1,
        4,
        vec![
            abc(MOVE, 1, 0, 0),
            asbx(LOADI, 2, 10),
            asbx(LOADI, 3, 20),
            abc(CALL, 1, 3, 0),
            abc(RETURN, 1, 0, 0),
        ],
    );
    let r = run(&mut vm, &chunk, &[id]);
    assert_ints(&r, &[10, 20]);
}

#[test]
fn test_results_truncated() {
    let mut vm = new_vm();
    let chunk = Chunk::func(
        0,
        5,
        vec![asbx(CLOSURE, 0, 0), abc(CALL, 0, 1, 3), abc(RETURN, 0, 3, 0)],
    )
    .with_children(vec![three_values()]);
    let r = run(&mut vm, &chunk, &[]);
    assert_ints(&r, &[1, 2]);
}

#[test]
fn test_results_padded_with_nil() {
    let mut vm = new_vm();
    let chunk = Chunk::func(
        0,
        5,
        vec![asbx(CLOSURE, 0, 0), abc(CALL, 0, 1, 5), abc(RETURN, 0, 5, 0)],
    )
    .with_children(vec![three_values()]);
    let r = run(&mut vm, &chunk, &[]);
    assert_eq!(r.len(), 4);
    assert_ints(&r[..3], &[1, 2, 3]);
    assert_nil(&r, 3);
}

#[test]
fn test_multret_passes_everything() {
    let mut vm = new_vm();
    let chunk = Chunk::func(
        0,
        5,
        vec![asbx(CLOSURE, 0, 0), abc(CALL, 0, 1, 0), abc(RETURN, 0, 0, 0)],
    )
    .with_children(vec![three_values()]);
    let r = run(&mut vm, &chunk, &[]);
    assert_ints(&r, &[1, 2, 3]);
}

#[test]
fn test_zero_results_discards() {
    let mut vm = new_vm();
    let chunk = Chunk::func(
        0,
        5,
        vec![
            asbx(LOADI, 0, 9),
            asbx(CLOSURE, 1, 0),
            abc(CALL, 1, 1, 1),
            abc(RETURN, 0, 2, 0),
        ],
    )
    .with_children(vec![three_values()]);
    let r = run(&mut vm, &chunk, &[]);
    assert_ints(&r, &[9]);
}

// ---- Tail calls ----

/// f(depth, n): a function that tail-calls itself n times, then tail-calls
/// `depth`.
fn countdown(n: i16) -> Chunk {
    let child = Chunk::func(
        1,
        3,
        vec![
            asbx(JMPZ, 0, 4),
            abc(GETUPVAL, 1, 1, 0),
            abc(ADDI, 2, 0, (-1i8) as u8),
            abc(TAILCALL, 1, 2, 0),
            abc(RETURN, 1, 0, 0),
            abc(GETUPVAL, 1, 0, 0),
            abc(TAILCALL, 1, 1, 0),
            abc(RETURN, 1, 0, 0),
        ],
    )
    .with_upvalues(vec![(true, 0), (true, 1)]);
    Chunk::func(
        1,
        4,
        vec![
            asbx(CLOSURE, 1, 0),
            abc(MOVE, 2, 1, 0),
            asbx(LOADI, 3, n),
            abc(CALL, 2, 2, 2),
            abc(RETURN, 2, 2, 0),
        ],
    )
    .with_children(vec![child])
}

#[test]
fn test_tail_calls_reuse_the_frame() {
    let mut vm = new_vm();
    let depth = vm.register_native("depth", native_depth);
    let shallow = run(&mut vm, &countdown(1), &[depth]);
    let deep = run(&mut vm, &countdown(5000), &[depth]);
    assert_eq!(shallow, deep);
    let main = vm.main_thread();
    assert!(vm.thread(main).frames_allocated() < 16);
}

// ---- Varargs ----

fn vararg_chunk(nparams: u8, code: Vec<u32>) -> Chunk {
    Chunk { is_vararg: true, ..Chunk::func(nparams, 4, code) }
}

#[test]
fn test_vararg_all() {
    let mut vm = new_vm();
    let chunk = vararg_chunk(
        1,
        vec![abc(VARARGPREP, 1, 0, 0), abc(VARARG, 0, 0, 0), abc(RETURN, 0, 0, 0)],
    );
    let args = [TValue::Int(1), TValue::Int(2), TValue::Int(3), TValue::Int(4)];
    let r = run(&mut vm, &chunk, &args);
    assert_ints(&r, &[2, 3, 4]);
    let r = run(&mut vm, &chunk, &args[..1]);
    assert!(r.is_empty());
}

#[test]
fn test_vararg_wanted_count() {
    let mut vm = new_vm();
    let chunk = vararg_chunk(
        1,
        vec![abc(VARARGPREP, 1, 0, 0), abc(VARARG, 0, 0, 3), abc(RETURN, 0, 3, 0)],
    );
    let r = run(&mut vm, &chunk, &[TValue::Int(1), TValue::Int(5)]);
    assert_eq!(r.len(), 2);
    assert_int(&r, 0, 5);
    assert_nil(&r, 1);
}

#[test]
fn test_vararg_fixed_params_survive() {
    let mut vm = new_vm();
    let chunk = vararg_chunk(
        2,
        vec![abc(VARARGPREP, 2, 0, 0), abc(RETURN, 0, 3, 0)],
    );
    let r = run(&mut vm, &chunk, &[TValue::Int(7), TValue::Int(8), TValue::Int(9)]);
    assert_ints(&r, &[7, 8]);
}

// ---- Callables ----

#[test]
fn test_call_non_function() {
    let mut vm = new_vm();
    let chunk = Chunk::func(
        0,
        2,
        vec![asbx(LOADI, 0, 5), abc(CALL, 0, 1, 1), abc(RETURN, 0, 1, 0)],
    );
    let msg = run_err(&mut vm, &chunk);
    assert!(msg.contains("attempt to call a number value"), "{msg}");
}

#[test]
fn test_call_metamethod() {
    let mut vm = new_vm();
    let t = new_object_with(&mut vm, "__call", native_id);
    let chunk = Chunk::func(
        1,
        4,
        vec![
            abc(MOVE, 1, 0, 0),
            asbx(LOADI, 2, 7),
            abc(CALL, 1, 2, 0),
            abc(RETURN, 1, 0, 0),
        ],
    );
    let r = run(&mut vm, &chunk, &[TValue::Table(t)]);
    assert_eq!(r.len(), 2);
    assert_eq!(r[0], TValue::Table(t));
    assert_int(&r, 1, 7);
}

fn recurse(vm: &mut Vm) -> LuaResult<usize> {
    vm.push_value(1)?;
    vm.push_value(1)?;
    vm.call(1, 0)?;
    Ok(0)
}

#[test]
fn test_native_recursion_overflows() {
    let mut vm = new_vm_with(VmConfig { max_ccalls: 50, ..VmConfig::default() });
    let f = vm.register_native("recurse", recurse);
    let base = vm.get_top();
    vm.push(f).unwrap();
    vm.push(f).unwrap();
    assert_eq!(vm.pcall(1, 0, 0), Status::ErrRun);
    let msg = error_string(&vm, -1).unwrap();
    assert!(msg.contains("stack overflow"), "{msg}");
    assert_eq!(vm.get_top(), base + 1);
    // usable afterwards
    let r = run(&mut vm, &Chunk::func(0, 2, vec![asbx(LOADI, 0, 3), abc(RETURN, 0, 2, 0)]), &[]);
    assert_ints(&r, &[3]);
}

// ---- Loading ----

#[test]
fn test_main_chunk_gets_globals() {
    let mut vm = new_vm();
    let chunk = Chunk::main(2, vec![abc(GETUPVAL, 0, 0, 0), abc(RETURN, 0, 2, 0)]);
    let r = run(&mut vm, &chunk, &[]);
    assert_eq!(r, vec![vm.globals()]);
}

#[test]
fn test_binary_chunk_in_text_mode() {
    let mut vm = new_vm();
    let chunk = Chunk::main(2, vec![abc(RETURN, 0, 1, 0)]);
    let st = vm.load(&chunk, b"\x1bLuaT", Some("=bin"), LoadMode::Text);
    assert_eq!(st, Status::ErrSyntax);
    let msg = error_string(&vm, -1).unwrap();
    assert!(msg.contains("binary chunk"), "{msg}");
    let st = vm.load(&chunk, b"\x1bLuaT", Some("=bin"), LoadMode::Binary);
    assert_eq!(st, Status::Ok);
}
