//! Cooperative script VM for adventure-game interpreters.
//!
//! One [`Vm`] owns the variable store, the slot table, the nested call
//! stack, the cutscene stack and the sentence queue. The host calls
//! [`Vm::run_tick`] once per frame with an [`OpcodeDispatcher`]; handlers get
//! the VM back by `&mut` and may start, stop, freeze or nest scripts.

pub mod bundle;
pub mod cli;
pub mod config;
pub mod cursor;
pub mod cutscene;
pub mod dispatch;
pub mod error;
pub mod nest;
pub mod opcodes;
pub mod program;
pub mod runtime;
mod save;
pub mod scheduler;
mod scripts;
pub mod sentence;
pub mod slots;
pub mod vars;
pub mod vm;

pub use config::{CutsceneStopPolicy, SentencePolicy, VmConfig, WellKnownVars};
pub use cutscene::CutsceneFrame;
pub use dispatch::{OpcodeDispatcher, Step};
pub use error::{Result, VmError};
pub use program::{ProgramArena, ProgramImage, ProgramKey, ProgramResolver};
pub use scheduler::TickOutcome;
pub use sentence::Sentence;
pub use slots::{Origin, ScriptLaunch, ScriptSlot, SlotId, SlotStatus};
pub use vars::{IndexSource, VariableRef, VariableStore};
pub use vm::{Violation, Vm};
