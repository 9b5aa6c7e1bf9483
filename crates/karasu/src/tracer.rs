//! VM execution tracing and the single-step debugger hook.
//!
//! A [`VmTracer`] receives hook calls at key execution events. All methods
//! have no-op defaults, so [`NoopTracer`] costs nothing to implement and
//! next to nothing to call. When the VM's single-step flag is set, the
//! tracer's [`VmTracer::on_single_step`] runs after every instruction and
//! its answer drives the debugger protocol: keep stepping, resume full
//! speed, or abandon execution. This is the extension point external
//! debugging tools build on.

use crate::opcode::Opcode;

/// Answer from a single-step debugger callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Keep the single-step flag set and continue.
    Step,
    /// Clear the single-step flag and resume normally.
    Continue,
    /// Abandon execution; the VM raises `SystemError`.
    Quit,
}

/// A frame snapshot handed to tracer hooks.
#[derive(Debug, Clone, Copy)]
pub struct TraceFrame<'a> {
    /// Qualified name of the running function.
    pub function: &'a str,
    /// Source file the function was compiled from.
    pub filename: &'a str,
    /// Byte offset of the current instruction.
    pub ip: usize,
    /// Source line of the current instruction.
    pub line: u32,
    /// Call stack depth.
    pub depth: usize,
}

/// Trait for VM execution tracing.
///
/// Implementations override only the hooks they care about.
pub trait VmTracer {
    /// Called before each opcode dispatch. The hottest hook; keep it light.
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize) {}

    /// Called when a call pushes a new frame.
    fn on_call(&mut self, _function: &str, _depth: usize) {}

    /// Called when a frame returns.
    fn on_return(&mut self, _depth: usize) {}

    /// Called after each instruction while the single-step flag is set.
    fn on_single_step(&mut self, _frame: TraceFrame<'_>) -> StepAction {
        StepAction::Continue
    }
}

/// Zero-cost default tracer.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Tracer that prints a line per instruction to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize) {
        eprintln!("{ip:06} {:<20} stack={stack_depth}", opcode.name());
    }

    fn on_call(&mut self, function: &str, depth: usize) {
        eprintln!("{:indent$}-> {function}", "", indent = depth * 2);
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("{:indent$}<-", "", indent = depth * 2);
    }
}

/// Tracer that counts opcode frequencies.
#[derive(Debug, Default)]
pub struct CountingTracer {
    counts: ahash::AHashMap<&'static str, u64>,
}

impl CountingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opcode frequencies observed so far, sorted by descending count.
    #[must_use]
    pub fn report(&self) -> Vec<(&'static str, u64)> {
        let mut entries: Vec<_> = self.counts.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        entries
    }
}

impl VmTracer for CountingTracer {
    fn on_instruction(&mut self, _ip: usize, opcode: Opcode, _stack_depth: usize) {
        *self.counts.entry(opcode.name()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_tracer_reports_sorted() {
        let mut tracer = CountingTracer::new();
        tracer.on_instruction(0, Opcode::Pop, 0);
        tracer.on_instruction(1, Opcode::Pop, 0);
        tracer.on_instruction(2, Opcode::Add, 0);
        assert_eq!(tracer.report(), vec![("POP", 2), ("ADD", 1)]);
    }

    #[test]
    fn test_default_single_step_resumes() {
        let mut tracer = NoopTracer;
        let frame = TraceFrame {
            function: "f",
            filename: "<test>",
            ip: 0,
            line: 1,
            depth: 1,
        };
        assert_eq!(tracer.on_single_step(frame), StepAction::Continue);
    }
}
