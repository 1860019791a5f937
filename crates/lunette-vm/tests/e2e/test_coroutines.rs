use super::helpers::op::*;
use super::helpers::*;
use lunette_core::value::TValue;
use lunette_vm::{CoroutineStatus, KContext, LuaResult, Status, Vm};

/// f(yield): y = yield(1); z = yield(y + 10); return z
fn two_yields() -> Chunk {
    Chunk::func(
        1,
        5,
        vec![
            abc(MOVE, 1, 0, 0),
            asbx(LOADI, 2, 1),
            abc(CALL, 1, 2, 2),
            abc(MOVE, 2, 0, 0),
            abc(ADDI, 3, 1, 10),
            abc(CALL, 2, 2, 2),
            abc(RETURN, 2, 2, 0),
        ],
    )
}

#[test]
fn test_yield_and_resume() {
    let mut vm = new_vm();
    let y = vm.register_native("yield", native_yield);
    load(&mut vm, &two_yields());
    let co = new_coroutine(&mut vm);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Suspended);

    let (st, vals) = resume(&mut vm, co, &[y]);
    assert_eq!(st, Status::Yield);
    assert_ints(&vals, &[1]);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Suspended);

    let (st, vals) = resume(&mut vm, co, &[TValue::Int(5)]);
    assert_eq!(st, Status::Yield);
    assert_ints(&vals, &[15]);

    let (st, vals) = resume(&mut vm, co, &[TValue::Int(100)]);
    assert_eq!(st, Status::Ok);
    assert_ints(&vals, &[100]);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);
}

#[test]
fn test_resume_dead_coroutine() {
    let mut vm = new_vm();
    load(&mut vm, &Chunk::func(0, 2, vec![abc(RETURN, 0, 1, 0)]));
    let co = new_coroutine(&mut vm);
    assert_eq!(resume(&mut vm, co, &[]).0, Status::Ok);
    let (st, vals) = resume(&mut vm, co, &[]);
    assert_eq!(st, Status::ErrRun);
    assert_str(&vm, &vals, vals.len() - 1, "cannot resume dead coroutine");
}

#[test]
fn test_yield_outside_coroutine() {
    let mut vm = new_vm();
    let y = vm.register_native("yield", native_yield);
    vm.push(y).unwrap();
    assert_eq!(vm.pcall(0, 0, 0), Status::ErrRun);
    assert_eq!(
        error_string(&vm, -1).as_deref(),
        Some("attempt to yield from outside a coroutine")
    );
}

#[test]
fn test_yield_across_native_call() {
    fn body(vm: &mut Vm) -> LuaResult<usize> {
        // no continuation: the callee cannot yield
        vm.push_value(1)?;
        vm.call(0, 0)?;
        Ok(0)
    }
    let mut vm = new_vm();
    let y = vm.register_native("yield", native_yield);
    let f = vm.register_native("body", body);
    vm.push(f).unwrap();
    let co = new_coroutine(&mut vm);
    let (st, vals) = resume(&mut vm, co, &[y]);
    assert_eq!(st, Status::ErrRun);
    assert_str(&vm, &vals, vals.len() - 1, "attempt to yield across a C-call boundary");
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);
}

// ---- Continuations ----

fn pcall_body(vm: &mut Vm) -> LuaResult<usize> {
    vm.push_value(1)?;
    vm.push(TValue::Int(3))?;
    let st = vm.pcall_k(1, 1, 0, 7, Some(pcall_body_k))?;
    pcall_body_k(vm, st, 7)
}

fn pcall_body_k(vm: &mut Vm, st: Status, ctx: KContext) -> LuaResult<usize> {
    vm.push(TValue::Int(ctx as i64))?;
    vm.push(TValue::Bool(st == Status::Yield))?;
    Ok(3)
}

#[test]
fn test_continuation_after_yield_in_pcall() {
    let mut vm = new_vm();
    let y = vm.register_native("yield", native_yield);
    let f = vm.register_native("body", pcall_body);
    vm.push(f).unwrap();
    let co = new_coroutine(&mut vm);
    let (st, vals) = resume(&mut vm, co, &[y]);
    assert_eq!(st, Status::Yield);
    assert_ints(&vals, &[3]);
    let (st, vals) = resume(&mut vm, co, &[TValue::Int(9)]);
    assert_eq!(st, Status::Ok);
    assert_eq!(vals, vec![TValue::Int(9), TValue::Int(7), TValue::Bool(true)]);
}

#[test]
fn test_continuation_without_yield() {
    let mut vm = new_vm();
    let id = vm.register_native("id", native_id);
    let f = vm.register_native("body", pcall_body);
    vm.push(f).unwrap();
    let co = new_coroutine(&mut vm);
    let (st, vals) = resume(&mut vm, co, &[id]);
    assert_eq!(st, Status::Ok);
    assert_eq!(vals, vec![TValue::Int(3), TValue::Int(7), TValue::Bool(false)]);
}

fn recovering_body(vm: &mut Vm) -> LuaResult<usize> {
    // chunk, yield, error
    vm.push_value(1)?;
    vm.push_value(2)?;
    vm.push_value(3)?;
    let st = vm.pcall_k(2, 1, 0, 0, Some(recovering_k))?;
    recovering_k(vm, st, 0)
}

fn recovering_k(vm: &mut Vm, st: Status, _ctx: KContext) -> LuaResult<usize> {
    vm.push(TValue::Bool(st == Status::ErrRun))?;
    Ok(2)
}

#[test]
fn test_error_after_yield_recovered_by_pcall() {
    let mut vm = new_vm();
    let y = vm.register_native("yield", native_yield);
    let errfn = vm.register_native("error", native_error);
    let f = vm.register_native("body", recovering_body);
    // f(yield, error): yield(); error(13)
    let chunk = Chunk::func(
        2,
        5,
        vec![
            abc(MOVE, 2, 0, 0),
            abc(CALL, 2, 1, 1),
            abc(MOVE, 2, 1, 0),
            asbx(LOADI, 3, 13),
            abc(CALL, 2, 2, 1),
            abc(RETURN, 0, 1, 0),
        ],
    );
    load(&mut vm, &chunk);
    let chunk = vm.value(-1);
    vm.push(f).unwrap();
    let co = new_coroutine(&mut vm);
    let (st, vals) = resume(&mut vm, co, &[chunk, y, errfn]);
    assert_eq!(st, Status::Yield);
    assert!(vals.is_empty());
    let (st, vals) = resume(&mut vm, co, &[]);
    assert_eq!(st, Status::Ok);
    assert_eq!(vals, vec![TValue::Int(13), TValue::Bool(true)]);
}

// ---- Closing ----

#[test]
fn test_close_suspended_runs_closers() {
    let mut vm = new_vm();
    let y = vm.register_native("yield", native_yield);
    let obj = new_object_with(&mut vm, "__close", native_record_close);
    let chunk = Chunk::func(
        2,
        4,
        vec![
            abc(TBC, 0, 0, 0),
            abc(MOVE, 2, 1, 0),
            abc(CALL, 2, 1, 1),
            abc(RETURN, 0, 1, 1),
        ],
    );
    load(&mut vm, &chunk);
    let co = new_coroutine(&mut vm);
    assert_eq!(resume(&mut vm, co, &[TValue::Table(obj), y]).0, Status::Yield);
    assert!(recorded(&vm).is_empty());
    assert_eq!(vm.close_thread(co).unwrap(), Status::Ok);
    assert_eq!(recorded(&vm), vec![TValue::Bool(true)]);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);
}

#[test]
fn test_closing_method_yields_on_return() {
    fn yielding_close(vm: &mut Vm) -> LuaResult<usize> {
        record(vm, TValue::Bool(true));
        vm.yield_values(0)
    }
    let mut vm = new_vm();
    let obj = new_object_with(&mut vm, "__close", yielding_close);
    let chunk = Chunk::func(
        1,
        3,
        vec![abc(TBC, 0, 0, 0), asbx(LOADI, 1, 5), abc(RETURN, 1, 2, 1)],
    );
    load(&mut vm, &chunk);
    let co = new_coroutine(&mut vm);
    let (st, _) = resume(&mut vm, co, &[TValue::Table(obj)]);
    assert_eq!(st, Status::Yield);
    assert_eq!(recorded(&vm).len(), 1);
    let (st, vals) = resume(&mut vm, co, &[]);
    assert_eq!(st, Status::Ok);
    assert_ints(&vals, &[5]);
    // closed exactly once
    assert_eq!(recorded(&vm).len(), 1);
}

#[test]
fn test_close_running_coroutine_fails() {
    fn close_self(vm: &mut Vm) -> LuaResult<usize> {
        let me = vm.current_thread();
        vm.close_thread(me)?;
        Ok(0)
    }
    let mut vm = new_vm();
    let f = vm.register_native("close_self", close_self);
    vm.push(f).unwrap();
    let co = new_coroutine(&mut vm);
    let (st, vals) = resume(&mut vm, co, &[]);
    assert_eq!(st, Status::ErrRun);
    assert_str(&vm, &vals, vals.len() - 1, "cannot close a running coroutine");
}

#[test]
fn test_error_kills_coroutine() {
    let mut vm = new_vm();
    let errfn = vm.register_native("error", native_error);
    vm.push(errfn).unwrap();
    let co = new_coroutine(&mut vm);
    let (st, vals) = resume(&mut vm, co, &[TValue::Int(8)]);
    assert_eq!(st, Status::ErrRun);
    assert_eq!(vals.last(), Some(&TValue::Int(8)));
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);
    // closing a dead coroutine reports its error
    assert_eq!(vm.close_thread(co).unwrap(), Status::ErrRun);
}
