use thiserror::Error;

use crate::program::ProgramKey;
use crate::slots::SlotId;

/// Fatal conditions that abort the current tick.
///
/// Consistency problems that can occur transiently during scene transitions
/// are normally recorded as [`crate::Violation`]s instead; they only surface
/// here under the strict cutscene-stop policy.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("too many scripts running, {capacity} max")]
    SlotTableFull { capacity: usize },
    #[error("too many nested scripts, {depth} max")]
    NestingOverflow { depth: usize },
    #[error("nested call stack left at depth {found} after running slot {slot} (expected {expected})")]
    NestingImbalance {
        slot: SlotId,
        expected: usize,
        found: usize,
    },
    #[error("sentence queue full, {capacity} max")]
    SentenceOverflow { capacity: usize },
    #[error("cutscene stack overflow, {depth} max")]
    CutsceneOverflow { depth: usize },
    #[error("{class} variable {index} out of range (limit {limit})")]
    VariableOutOfRange {
        class: &'static str,
        index: usize,
        limit: usize,
    },
    #[error("illegal variable address {0:#06x}")]
    IllegalVariable(u16),
    #[error("no script is active")]
    NoActiveScript,
    #[error("program {0} could not be resolved")]
    ProgramMissing(ProgramKey),
    #[error("program counter {pc} past the end of {key} ({len} bytes)")]
    ProgramCounterOutOfBounds {
        key: ProgramKey,
        pc: usize,
        len: usize,
    },
    #[error("unknown opcode {opcode:#04x} in {key} at {pc}")]
    UnknownOpcode {
        opcode: u8,
        key: ProgramKey,
        pc: usize,
    },
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),
    #[error("opcode handler failed: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, VmError>;
