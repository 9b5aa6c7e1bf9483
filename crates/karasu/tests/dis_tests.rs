//! Disassembler output through the public surface.

use karasu::{NoPrint, Vm, VmFlags};

fn listing(source: &str) -> String {
    let mut vm = Vm::with_output(VmFlags::default(), Box::new(NoPrint));
    vm.disassemble(source, "<dis>").expect("disassembly failed")
}

#[test]
fn test_module_listing_shape() {
    let out = listing("let x = 1\nprint(x + 2)\n");
    assert!(out.starts_with("== <module> ==\n"), "{out}");
    for needle in [
        "CONSTANT",
        "(1)",
        "DEFINE_GLOBAL",
        "(\"x\")",
        "GET_GLOBAL",
        "(\"print\")",
        "ADD",
        "CALL",
        "RETURN",
    ] {
        assert!(out.contains(needle), "missing {needle} in:\n{out}");
    }
}

#[test]
fn test_nested_functions_are_listed() {
    let out = listing("def f(a):\n    return a + 1\n");
    assert!(out.contains("== <module> =="), "{out}");
    assert!(out.contains("== f =="), "{out}");
    assert!(out.contains("GET_LOCAL"), "{out}");
    assert!(out.contains("(a)"), "{out}");
}

#[test]
fn test_jump_targets_are_absolute() {
    let out = listing("if 1:\n    pass\n");
    let jump_line = out
        .lines()
        .find(|line| line.contains("JUMP_IF_FALSE"))
        .expect("jump missing");
    assert!(jump_line.contains("-> "), "{jump_line}");
}

#[test]
fn test_line_numbers_repeat_as_bars() {
    let out = listing("print(1 + 2)\n");
    assert!(out.contains("     1 "), "first instruction carries its line:\n{out}");
    assert!(out.contains("      | "), "same-line instructions show a bar:\n{out}");
}

#[test]
fn test_syntax_errors_render_as_exceptions() {
    let mut vm = Vm::with_output(VmFlags::default(), Box::new(NoPrint));
    let err = vm.disassemble("def broken(:\n", "<dis>").unwrap_err();
    let rendered = vm.format_traceback(&err);
    assert!(rendered.contains("SyntaxError"), "{rendered}");
}
