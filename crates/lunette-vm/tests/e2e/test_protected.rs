use super::helpers::op::*;
use super::helpers::*;
use lunette_core::value::TValue;
use lunette_vm::{GcCommand, LuaResult, Status, Vm, VmConfig};

/// f(errfn, v): calls errfn(v).
fn raise_chunk() -> Chunk {
    Chunk::func(
        2,
        4,
        vec![
            abc(MOVE, 2, 0, 0),
            abc(MOVE, 3, 1, 0),
            abc(CALL, 2, 2, 1),
            abc(RETURN, 0, 1, 0),
        ],
    )
}

#[test]
fn test_error_object_reaches_pcall() {
    let mut vm = new_vm();
    let errfn = vm.register_native("error", native_error);
    let base = vm.get_top();
    load(&mut vm, &raise_chunk());
    vm.push(errfn).unwrap();
    vm.push(TValue::Int(42)).unwrap();
    assert_eq!(vm.pcall(2, 0, 0), Status::ErrRun);
    assert_eq!(vm.get_top(), base + 1);
    assert_eq!(vm.value(-1), TValue::Int(42));
    // the failed frames are gone
    assert_eq!(vm.current_ci(), 0);
}

#[test]
fn test_handler_runs_before_unwinding() {
    let mut vm = new_vm();
    let errfn = vm.register_native("error", native_error);
    let depth = vm.register_native("depth", native_depth);
    vm.push(depth).unwrap();
    let handler = vm.get_top() as i32;
    load(&mut vm, &raise_chunk());
    vm.push(errfn).unwrap();
    vm.push(TValue::Int(1)).unwrap();
    assert_eq!(vm.pcall(2, 0, handler), Status::ErrRun);
    // base frame, the chunk, `error` and the handler itself
    assert_eq!(vm.value(-1), TValue::Int(4));
}

#[test]
fn test_error_in_handler() {
    let mut vm = new_vm_with(VmConfig { max_ccalls: 50, ..VmConfig::default() });
    let errfn = vm.register_native("error", native_error);
    vm.push(errfn).unwrap();
    let handler = vm.get_top() as i32;
    load(&mut vm, &raise_chunk());
    vm.push(errfn).unwrap();
    vm.push(TValue::Int(1)).unwrap();
    assert_eq!(vm.pcall(2, 0, handler), Status::ErrErr);
    assert_eq!(error_string(&vm, -1).as_deref(), Some("error in error handling"));
}

#[test]
fn test_nested_pcall_inner_error_only() {
    fn inner(vm: &mut Vm) -> LuaResult<usize> {
        vm.push_value(1)?;
        vm.push(TValue::Int(5))?;
        let st = vm.pcall(1, 0, 0);
        vm.push(TValue::Bool(st == Status::ErrRun))?;
        Ok(2)
    }
    let mut vm = new_vm();
    let errfn = vm.register_native("error", native_error);
    let f = vm.register_native("inner", inner);
    let base = vm.get_top();
    vm.push(f).unwrap();
    vm.push(errfn).unwrap();
    assert_eq!(vm.pcall(1, 2, 0), Status::Ok);
    assert_eq!(vm.value(-2), TValue::Int(5));
    assert_eq!(vm.value(-1), TValue::Bool(true));
    assert_eq!(vm.get_top(), base + 2);
}

// ---- To-be-closed variables ----

#[test]
fn test_closed_on_return() {
    let mut vm = new_vm();
    let obj = new_object_with(&mut vm, "__close", native_record_close);
    let chunk = Chunk::func(
        1,
        3,
        vec![abc(TBC, 0, 0, 0), asbx(LOADI, 1, 5), abc(RETURN, 1, 2, 1)],
    );
    let r = run(&mut vm, &chunk, &[TValue::Table(obj)]);
    assert_ints(&r, &[5]);
    assert_eq!(recorded(&vm), vec![TValue::Bool(true)]);
}

#[test]
fn test_closed_with_error_object() {
    let mut vm = new_vm();
    let errfn = vm.register_native("error", native_error);
    let obj = new_object_with(&mut vm, "__close", native_record_close);
    let chunk = Chunk::func(
        2,
        5,
        vec![
            abc(TBC, 0, 0, 0),
            abc(MOVE, 2, 1, 0),
            asbx(LOADI, 3, 99),
            abc(CALL, 2, 2, 1),
            abc(RETURN, 0, 1, 0),
        ],
    );
    load(&mut vm, &chunk);
    vm.push(TValue::Table(obj)).unwrap();
    vm.push(errfn).unwrap();
    assert_eq!(vm.pcall(2, 0, 0), Status::ErrRun);
    assert_eq!(vm.value(-1), TValue::Int(99));
    assert_eq!(recorded(&vm), vec![TValue::Int(99)]);
}

#[test]
fn test_close_error_replaces_original() {
    fn failing_close(vm: &mut Vm) -> LuaResult<usize> {
        vm.push(TValue::Int(7))?;
        Err(vm.error())
    }
    let mut vm = new_vm();
    let errfn = vm.register_native("error", native_error);
    let obj = new_object_with(&mut vm, "__close", failing_close);
    let chunk = Chunk::func(
        2,
        5,
        vec![
            abc(TBC, 0, 0, 0),
            abc(MOVE, 2, 1, 0),
            asbx(LOADI, 3, 99),
            abc(CALL, 2, 2, 1),
            abc(RETURN, 0, 1, 0),
        ],
    );
    load(&mut vm, &chunk);
    vm.push(TValue::Table(obj)).unwrap();
    vm.push(errfn).unwrap();
    assert_eq!(vm.pcall(2, 0, 0), Status::ErrRun);
    assert_eq!(vm.value(-1), TValue::Int(7));
}

#[test]
fn test_closed_newest_first() {
    fn tag_close(vm: &mut Vm) -> LuaResult<usize> {
        // record the object's first array slot
        let obj = vm.value(1).as_table_ref().unwrap();
        let v = vm.heap.get_table(obj).raw_geti(1);
        record(vm, v);
        Ok(0)
    }
    let mut vm = new_vm();
    let a = new_object_with(&mut vm, "__close", tag_close);
    vm.table_seti(a, 1, TValue::Int(1));
    let b = new_object_with(&mut vm, "__close", tag_close);
    vm.table_seti(b, 1, TValue::Int(2));
    let chunk = Chunk::func(
        2,
        3,
        vec![abc(TBC, 0, 0, 0), abc(TBC, 1, 0, 0), abc(CLOSE, 0, 0, 0), abc(RETURN, 0, 1, 0)],
    );
    run(&mut vm, &chunk, &[TValue::Table(a), TValue::Table(b)]);
    assert_eq!(recorded(&vm), vec![TValue::Int(2), TValue::Int(1)]);
}

#[test]
fn test_non_closable_value() {
    let mut vm = new_vm();
    let mut chunk = Chunk::func(1, 2, vec![abc(TBC, 0, 0, 0), abc(RETURN, 0, 1, 0)]);
    chunk.locals = vec![("x", 0, 2)];
    load(&mut vm, &chunk);
    vm.push(TValue::Int(3)).unwrap();
    assert_eq!(vm.pcall(1, 0, 0), Status::ErrRun);
    let msg = error_string(&vm, -1).unwrap();
    assert!(msg.contains("variable 'x' got a non-closable value"), "{msg}");
}

#[test]
fn test_false_is_not_closed() {
    let mut vm = new_vm();
    let chunk = Chunk::func(1, 2, vec![abc(TBC, 0, 0, 0), abc(RETURN, 0, 1, 1)]);
    run(&mut vm, &chunk, &[TValue::Bool(false)]);
    assert!(recorded(&vm).is_empty());
}

// ---- Memory ----

fn hog(vm: &mut Vm) -> LuaResult<usize> {
    vm.new_table(0, 0)?;
    let mut i = 1;
    loop {
        vm.new_table(64, 0)?;
        vm.raw_seti(1, i)?;
        i += 1;
    }
}

#[test]
fn test_out_of_memory_is_recoverable() {
    let mut vm = new_vm_with(VmConfig { memory_limit: Some(1 << 20), ..VmConfig::default() });
    let f = vm.register_native("hog", hog);
    let base = vm.get_top();
    vm.push(f).unwrap();
    assert_eq!(vm.pcall(0, 0, 0), Status::ErrMem);
    assert_eq!(error_string(&vm, -1).as_deref(), Some("not enough memory"));
    vm.set_top(base as i32).unwrap();
    vm.gc(GcCommand::Collect);
    assert!(vm.new_table(0, 0).is_ok());
}
