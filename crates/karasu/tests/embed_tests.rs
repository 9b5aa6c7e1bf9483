//! The host-facing embedding surface.

use karasu::{
    Arguments, CollectStringPrint, ExcKind, NoPrint, StepAction, TraceFrame, Value, Vm, VmFlags, VmResult, VmTracer,
};

fn capture_vm() -> (Vm, CollectStringPrint) {
    let collector = CollectStringPrint::new();
    let vm = Vm::with_output(VmFlags::default(), Box::new(collector.clone()));
    (vm, collector)
}

#[test]
fn test_attach_named_value_visible_to_scripts() {
    let (mut vm, collector) = capture_vm();
    let module = vm.main_module();
    vm.attach_named_value(module, "limit", Value::Int(99)).unwrap();
    let greeting = vm.string_value("salut");
    vm.attach_named_value(module, "greeting", greeting).unwrap();
    vm.interpret("print(limit, greeting)\n", "<embed>").unwrap();
    assert_eq!(collector.output(), "99 salut\n");
}

fn double_native(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let slots = vm.parse_args("double", "i", &["value"], &[], args)?;
    let Some(value) = slots[0].and_then(|v| v.as_int()) else {
        return Err(vm.runtime_error(ExcKind::SystemError, "parse_args broke its contract"));
    };
    Ok(Value::Int(value * 2))
}

fn shout_native(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let slots = vm.parse_args("shout", "s|s", &["word", "suffix"], &[], args)?;
    let word = slots[0].expect("required argument");
    let mut text = vm.value_str(word)?.to_uppercase();
    if let Some(suffix) = slots[1] {
        text.push_str(&vm.value_str(suffix)?);
    }
    Ok(vm.string_value(&text))
}

#[test]
fn test_define_native_and_call_from_script() {
    let (mut vm, collector) = capture_vm();
    let module = vm.main_module();
    vm.define_native(module, "double", double_native).unwrap();
    vm.define_native(module, "shout", shout_native).unwrap();
    vm.interpret(
        "print(double(21))\nprint(shout(\"hey\"))\nprint(shout(\"hey\", suffix=\"!\"))\n",
        "<embed>",
    )
    .unwrap();
    assert_eq!(collector.output(), "42\nHEY\nHEY!\n");
}

#[test]
fn test_native_errors_surface_as_exceptions() {
    let (mut vm, collector) = capture_vm();
    let module = vm.main_module();
    vm.define_native(module, "double", double_native).unwrap();
    vm.interpret(
        "try:\n    double(\"nope\")\nexcept TypeError as e:\n    print(\"caught:\", e)\n",
        "<embed>",
    )
    .unwrap();
    let output = collector.output();
    assert!(output.starts_with("caught:"), "{output}");
    assert!(output.contains("must be an integer"), "{output}");
}

#[test]
fn test_call_stack_invokes_script_function() {
    let mut vm = Vm::with_output(VmFlags::default(), Box::new(NoPrint));
    vm.interpret("def add(a, b):\n    return a + b\n", "<embed>").unwrap();
    let module = vm.main_module();
    let add = vm.get_attribute(module, "add").unwrap();
    vm.stack_push(add);
    vm.stack_push(Value::Int(2));
    vm.stack_push(Value::Int(40));
    let result = vm.call_stack(2).unwrap();
    assert!(matches!(result, Value::Int(42)));
}

#[test]
fn test_stack_primitives() {
    let mut vm = Vm::with_output(VmFlags::default(), Box::new(NoPrint));
    vm.stack_push(Value::Int(1));
    vm.stack_push(Value::Int(2));
    assert!(matches!(vm.stack_peek(0), Value::Int(2)));
    assert!(matches!(vm.stack_peek(1), Value::Int(1)));
    vm.stack_swap(1);
    assert!(matches!(vm.stack_pop(), Value::Int(1)));
    assert!(matches!(vm.stack_pop(), Value::Int(2)));
}

#[test]
fn test_interrupt_flag_raises_keyboard_interrupt() {
    let mut vm = Vm::with_output(VmFlags::default(), Box::new(NoPrint));
    let handle = vm.interrupt_handle();
    handle.store(true, std::sync::atomic::Ordering::Relaxed);
    let err = vm
        .interpret("let i = 0\nwhile True:\n    i += 1\n", "<embed>")
        .unwrap_err();
    let rendered = vm.format_traceback(&err);
    assert!(rendered.contains("KeyboardInterrupt"), "{rendered}");
}

/// Tracer that stops the program after a fixed number of stepped
/// instructions, exercising the debugger protocol.
struct StepBudget {
    remaining: usize,
    observed_lines: Vec<u32>,
}

impl VmTracer for StepBudget {
    fn on_single_step(&mut self, frame: TraceFrame<'_>) -> StepAction {
        self.observed_lines.push(frame.line);
        if self.remaining == 0 {
            return StepAction::Quit;
        }
        self.remaining -= 1;
        StepAction::Step
    }
}

#[test]
fn test_single_step_debugger_quit() {
    let flags = VmFlags {
        single_step: true,
        ..VmFlags::default()
    };
    let mut vm = Vm::with_output(flags, Box::new(NoPrint));
    vm.set_tracer(Box::new(StepBudget {
        remaining: 10,
        observed_lines: Vec::new(),
    }));
    let err = vm
        .interpret("let i = 0\nwhile True:\n    i += 1\n", "<embed>")
        .unwrap_err();
    let rendered = vm.format_traceback(&err);
    assert!(rendered.contains("SystemError"), "{rendered}");
    assert!(rendered.contains("debugger"), "{rendered}");
}

#[test]
fn test_runtime_error_classification() {
    let mut vm = Vm::with_output(VmFlags::default(), Box::new(NoPrint));
    let err = vm.runtime_error(ExcKind::ValueError, "bad input");
    let rendered = vm.format_traceback(&err);
    assert_eq!(rendered, "ValueError: bad input\n");
}

#[test]
fn test_gc_stats_are_exposed() {
    let mut vm = Vm::with_output(VmFlags::default(), Box::new(NoPrint));
    vm.interpret("let l = [1, 2, 3]\n", "<embed>").unwrap();
    vm.run_gc();
    let stats = vm.gc_stats();
    assert_eq!(stats.collections, 1);
    assert!(stats.bytes_allocated > 0);
    assert!(stats.next_gc >= stats.bytes_allocated);
}
