#![no_main]

use libfuzzer_sys::fuzz_target;
use lunette_core::value::TValue;
use lunette_vm::{GcCommand, Vm, VmConfig};

const MAX_LIVE: i32 = 64;

fuzz_target!(|data: &[u8]| {
    // Arbitrary mutations interleaved with single collector steps must never
    // leave a black object pointing at a white one.
    let mut vm = Vm::new(VmConfig::default());
    for chunk in data.chunks(2) {
        let (op, arg) = (chunk[0], chunk.get(1).copied().unwrap_or(0));
        let top = vm.get_top();
        match op % 5 {
            0 if top < MAX_LIVE as usize => {
                let _ = vm.new_table(0, 0);
            }
            1 if top >= 2 => {
                // store one live table into another
                let src = -1 - (arg as i32 % top as i32);
                let dst = -1 - ((arg >> 4) as i32 % top as i32);
                let v = vm.value(src);
                if let TValue::Table(t) = vm.value(dst) {
                    vm.table_seti(t, (arg & 7) as i64 + 1, v);
                }
            }
            2 if top > 0 => vm.pop(1),
            3 if top < MAX_LIVE as usize => {
                let _ = vm.push_string(&format!("k{arg}"));
            }
            _ => {
                vm.gc(GcCommand::Step(0));
            }
        }
        if let Err(v) = vm.check_color_invariant() {
            panic!("color invariant broken: {v:?}");
        }
    }
});
