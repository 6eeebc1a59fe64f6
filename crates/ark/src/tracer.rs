//! Execution tracing hooks.
//!
//! The VM calls into a [`VmTracer`] at dispatch, call and return
//! boundaries. The default [`NoopTracer`] compiles away to nothing;
//! [`StderrTracer`] prints one line per event for debugging, and
//! [`RecordingTracer`] collects events for tests.

use crate::bytecode::Opcode;

/// Observer for VM execution events.
pub trait VmTracer {
    /// Called before every instruction is executed.
    fn on_instruction(&mut self, _pp: usize, _ip: usize, _opcode: Opcode, _arg: u16) {}

    /// Called when a frame is pushed for a closure or page call.
    fn on_call(&mut self, _page: u16, _argc: u16) {}

    /// Called after a frame returns, with the new frame count.
    fn on_return(&mut self, _fc: usize) {}
}

/// Does nothing; the default tracer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Prints every event to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, pp: usize, ip: usize, opcode: Opcode, arg: u16) {
        eprintln!("[vm] {pp}:{:>4} {opcode} {arg}", ip / 4);
    }

    fn on_call(&mut self, page: u16, argc: u16) {
        eprintln!("[vm] call page {page} with {argc} argument(s)");
    }

    fn on_return(&mut self, fc: usize) {
        eprintln!("[vm] return, frame count {fc}");
    }
}

/// One recorded trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Instruction { pp: usize, ip: usize, opcode: Opcode, arg: u16 },
    Call { page: u16, argc: u16 },
    Return { fc: usize },
}

/// Collects events into a shared buffer, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: std::rc::Rc<std::cell::RefCell<Vec<TraceEvent>>>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A second handle onto the same event buffer.
    #[must_use]
    pub fn handle(&self) -> std::rc::Rc<std::cell::RefCell<Vec<TraceEvent>>> {
        std::rc::Rc::clone(&self.events)
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, pp: usize, ip: usize, opcode: Opcode, arg: u16) {
        self.events
            .borrow_mut()
            .push(TraceEvent::Instruction { pp, ip, opcode, arg });
    }

    fn on_call(&mut self, page: u16, argc: u16) {
        self.events.borrow_mut().push(TraceEvent::Call { page, argc });
    }

    fn on_return(&mut self, fc: usize) {
        self.events.borrow_mut().push(TraceEvent::Return { fc });
    }
}
