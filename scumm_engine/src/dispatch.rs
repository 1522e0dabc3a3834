use crate::error::Result;
use crate::vm::Vm;

/// What the active slot does after one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Fetch the next opcode.
    Continue,
    /// Break here: resume at the current pc on the next tick.
    Yield,
    /// Pause for the given number of delay units, then yield.
    Delay(i32),
    /// Natural end of the script; the slot dies.
    Terminate,
}

/// Executes one opcode for the active slot.
///
/// Handlers fetch their own operands through the `Vm` cursor helpers and may
/// call any VM operation, including nested starts, which is why the
/// dispatcher is handed back to those operations as `&mut dyn
/// OpcodeDispatcher`.
pub trait OpcodeDispatcher {
    fn dispatch(&mut self, vm: &mut Vm, opcode: u8) -> Result<Step>;
}
