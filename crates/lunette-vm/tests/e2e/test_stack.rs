use super::helpers::op::*;
use super::helpers::*;
use lunette_core::value::TValue;
use lunette_vm::{GcCommand, LuaResult, Status, Vm, VmConfig};

fn stack_size(vm: &mut Vm) -> LuaResult<usize> {
    let size = vm.thread(vm.current_thread()).stack_size();
    vm.push(TValue::Int(size as i64))?;
    Ok(1)
}

/// f(probe, n): recurses n levels (no tail calls), then returns probe().
fn deep_call(max_stack: u8) -> Chunk {
    let child = Chunk::func(
        1,
        max_stack,
        vec![
            asbx(JMPZ, 0, 4),
            abc(GETUPVAL, 1, 0, 0),
            abc(ADDI, 2, 0, (-1i8) as u8),
            abc(CALL, 1, 2, 2),
            abc(RETURN, 1, 2, 0),
            abc(GETUPVAL, 1, 1, 0),
            abc(CALL, 1, 1, 2),
            abc(RETURN, 1, 2, 0),
        ],
    )
    .with_upvalues(vec![(true, 2), (true, 0)]);
    Chunk::func(
        2,
        5,
        vec![
            asbx(CLOSURE, 2, 0),
            abc(MOVE, 3, 2, 0),
            abc(MOVE, 4, 1, 0),
            abc(CALL, 3, 2, 2),
            abc(RETURN, 3, 2, 1),
        ],
    )
    .with_children(vec![child])
}

#[test]
fn test_stack_grows_and_shrinks() {
    let mut vm = new_vm();
    let probe = vm.register_native("stack_size", stack_size);
    let main = vm.main_thread();
    let initial = vm.thread(main).stack_size();
    let r = run(&mut vm, &deep_call(3), &[probe, TValue::Int(150)]);
    let peak = r[0].as_integer().unwrap() as usize;
    assert!(peak > initial, "{peak} <= {initial}");
    vm.gc(GcCommand::Collect);
    assert!(vm.thread(main).stack_size() < peak);
}

#[test]
fn test_stack_overflow() {
    let mut vm = new_vm_with(VmConfig { max_stack: 600, ..VmConfig::default() });
    let probe = vm.register_native("stack_size", stack_size);
    let base = vm.get_top();
    load(&mut vm, &deep_call(3));
    vm.push(probe).unwrap();
    vm.push(TValue::Int(10_000)).unwrap();
    assert_eq!(vm.pcall(2, 1, 0), Status::ErrRun);
    let msg = error_string(&vm, -1).unwrap();
    assert!(msg.contains("stack overflow"), "{msg}");
    assert_eq!(vm.get_top(), base + 1);
    // the stack is usable again once the error is handled
    vm.set_top(base as i32).unwrap();
    let r = run(&mut vm, &deep_call(3), &[probe, TValue::Int(5)]);
    assert!(r[0].as_integer().unwrap() <= 600);
}

#[test]
fn test_ensure_stack() {
    let mut vm = new_vm_with(VmConfig { max_stack: 200, ..VmConfig::default() });
    assert!(vm.ensure_stack(100));
    for i in 0..100 {
        vm.push(TValue::Int(i)).unwrap();
    }
    assert_eq!(vm.get_top(), 100);
    assert!(!vm.ensure_stack(150));
    assert_eq!(vm.to_integer(-1), Some(99));
}

#[test]
fn test_xmove_between_threads() {
    let mut vm = new_vm();
    let co = vm.new_thread().unwrap();
    let main = vm.main_thread();
    for i in 1..=3 {
        vm.push(TValue::Int(i)).unwrap();
    }
    vm.xmove(main, co, 2).unwrap();
    assert_eq!(vm.to_integer(-1), Some(1));
    let t = vm.thread(co);
    assert_eq!(t.value_at(t.top() - 2), TValue::Int(2));
    assert_eq!(t.value_at(t.top() - 1), TValue::Int(3));
}

// ---- Upvalues ----

/// Returns a counter closure over a local that is closed on return.
fn counter() -> Chunk {
    let inc = Chunk::func(
        0,
        2,
        vec![
            abc(GETUPVAL, 0, 0, 0),
            abc(ADDI, 0, 0, 1),
            abc(SETUPVAL, 0, 0, 0),
            abc(RETURN, 0, 2, 0),
        ],
    )
    .with_upvalues(vec![(true, 0)]);
    Chunk::func(
        0,
        3,
        vec![asbx(LOADI, 0, 0), asbx(CLOSURE, 1, 0), abc(RETURN, 1, 2, 1)],
    )
    .with_children(vec![inc])
}

#[test]
fn test_upvalue_outlives_frame() {
    let mut vm = new_vm();
    load(&mut vm, &counter());
    vm.call(0, 1).unwrap();
    let main = vm.main_thread();
    assert_eq!(vm.thread(main).open_upval_count(), 0);
    for expected in 1..=3 {
        vm.push_value(-1).unwrap();
        vm.call(0, 1).unwrap();
        assert_eq!(vm.to_integer(-1), Some(expected));
        vm.pop(1);
    }
}

#[test]
fn test_closures_share_upvalue() {
    let mut vm = new_vm();
    // two closures over the same local; returns both
    let inc = Chunk::func(
        0,
        2,
        vec![
            abc(GETUPVAL, 0, 0, 0),
            abc(ADDI, 0, 0, 1),
            abc(SETUPVAL, 0, 0, 0),
            abc(RETURN, 0, 2, 0),
        ],
    )
    .with_upvalues(vec![(true, 0)]);
    let get = Chunk::func(0, 2, vec![abc(GETUPVAL, 0, 0, 0), abc(RETURN, 0, 2, 0)])
        .with_upvalues(vec![(true, 0)]);
    let chunk = Chunk::func(
        0,
        4,
        vec![
            asbx(LOADI, 0, 10),
            asbx(CLOSURE, 1, 0),
            asbx(CLOSURE, 2, 1),
            abc(RETURN, 1, 3, 1),
        ],
    )
    .with_children(vec![inc, get]);
    load(&mut vm, &chunk);
    vm.call(0, 2).unwrap();
    vm.push_value(-2).unwrap();
    vm.call(0, 0).unwrap();
    vm.push_value(-1).unwrap();
    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(11));
}
