//! Garbage collector behavior through the public surface.

use karasu::{CollectStringPrint, NoPrint, Vm, VmFlags};

fn quiet_vm() -> Vm {
    Vm::with_output(VmFlags::default(), Box::new(NoPrint))
}

#[test]
fn test_collection_reclaims_dead_cycles() {
    let mut vm = quiet_vm();
    let source = concat!(
        "class Node:\n",
        "    def __init__(s): s.peer = None\n",
        "def churn():\n",
        "    for i in range(200):\n",
        "        let a = Node()\n",
        "        let b = Node()\n",
        "        a.peer = b\n",
        "        b.peer = a\n",
        "churn()\n",
    );
    vm.interpret(source, "<gc>").expect("program failed");
    let before = vm.gc_stats();
    // Two cycles: the first demotes unreachable pairs to second chance,
    // the second frees them.
    vm.run_gc();
    vm.run_gc();
    let after = vm.gc_stats();
    assert_eq!(after.collections, before.collections + 2);
    assert!(after.last_freed > 0 || after.bytes_allocated < before.bytes_allocated.max(1));
}

#[test]
fn test_reachable_objects_survive_collections() {
    let mut vm = quiet_vm();
    let source = concat!(
        "let keep = []\n",
        "for i in range(50):\n",
        "    keep.append(f\"value-{i}\")\n",
    );
    vm.interpret(source, "<gc>").expect("program failed");
    for _ in 0..4 {
        vm.run_gc();
    }
    // The module global still holds everything; prove it by reading back.
    let collector = CollectStringPrint::new();
    let mut vm2 = Vm::with_output(VmFlags::default(), Box::new(collector.clone()));
    vm2.interpret(source, "<gc>").expect("program failed");
    vm2.run_gc();
    vm2.run_gc();
    vm2.interpret("print(len(keep), keep[0], keep[49])\n", "<gc>")
        .expect("read-back failed");
    assert_eq!(collector.output(), "50 value-0 value-49\n");
}

#[test]
fn test_interned_strings_stay_identical_across_gc() {
    let collector = CollectStringPrint::new();
    let mut vm = Vm::with_output(VmFlags::default(), Box::new(collector.clone()));
    vm.interpret("let a = \"shared-text\"\n", "<gc>").expect("program failed");
    vm.run_gc();
    vm.run_gc();
    vm.interpret("let b = \"shared\" + \"-text\"\nprint(a is b)\n", "<gc>")
        .expect("program failed");
    assert_eq!(collector.output(), "True\n");
}

#[test]
fn test_stress_mode_collects_continuously() {
    let flags = VmFlags {
        stress_gc: true,
        ..VmFlags::default()
    };
    let mut vm = Vm::with_output(flags, Box::new(NoPrint));
    let source = concat!(
        "let acc = []\n",
        "for i in range(30):\n",
        "    acc.append([i, f\"s{i}\", (i, i)])\n",
    );
    vm.interpret(source, "<gc>").expect("program failed");
    assert!(vm.gc_stats().collections > 10, "stress mode should collect constantly");
}

#[test]
fn test_open_upvalues_protect_stack_captures() {
    let collector = CollectStringPrint::new();
    let flags = VmFlags {
        stress_gc: true,
        ..VmFlags::default()
    };
    let mut vm = Vm::with_output(flags, Box::new(collector.clone()));
    let source = concat!(
        "def outer():\n",
        "    let payload = [1, 2, 3]\n",
        "    def reader():\n",
        "        return payload\n",
        "    let first = reader()\n",
        "    payload.append(4)\n",
        "    return reader()\n",
        "print(outer())\n",
    );
    vm.interpret(source, "<gc>").expect("program failed");
    assert_eq!(collector.output(), "[1, 2, 3, 4]\n");
}
