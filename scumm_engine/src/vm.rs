use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::config::{CutsceneStopPolicy, VmConfig};
use crate::cursor::Cursor;
use crate::cutscene::CutsceneStack;
use crate::error::{Result, VmError};
use crate::nest::NestedCallStack;
use crate::program::{ProgramImage, ProgramKey, ProgramResolver};
use crate::sentence::SentenceQueue;
use crate::slots::{Origin, ScriptSlot, SlotId, SlotTable};
use crate::vars::{VariableRef, VariableStore};

/// A consistency problem that was logged and degraded instead of aborting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// `stop`/`stop_object` hit a slot holding a cutscene override.
    StoppedWithOverride {
        number: u16,
        origin: Origin,
        slot: SlotId,
    },
    /// A script reached its natural end with an override still open.
    EndedWithOverride {
        number: u16,
        origin: Origin,
        slot: SlotId,
    },
    /// Room teardown killed a slot holding an override.
    TornDownWithOverride {
        number: u16,
        origin: Origin,
        slot: SlotId,
    },
    /// A nested call returned into a slot that now runs something else.
    StaleReturn {
        slot: SlotId,
        expected: u16,
        found: u16,
    },
    /// A skip pointed at a slot that no longer runs the checkpoint's script.
    StaleCheckpoint {
        slot: SlotId,
        expected: u16,
        found: u16,
    },
    OverrideOutsideCutscene { number: u16 },
    CutsceneUnderflow { number: u16 },
}

impl Violation {
    /// Violations the strict policy turns into hard errors.
    fn is_stop(&self) -> bool {
        matches!(
            self,
            Violation::StoppedWithOverride { .. } | Violation::EndedWithOverride { .. }
        )
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::StoppedWithOverride {
                number,
                origin,
                slot,
            } => write!(
                f,
                "{} {number} stopped with active cutscene/override (slot {slot})",
                origin.as_str()
            ),
            Violation::EndedWithOverride {
                number,
                origin,
                slot,
            } => write!(
                f,
                "{} {number} ending with active cutscene/override (slot {slot})",
                origin.as_str()
            ),
            Violation::TornDownWithOverride {
                number,
                origin,
                slot,
            } => write!(
                f,
                "{} {number} stopped with active cutscene/override in exit (slot {slot})",
                origin.as_str()
            ),
            Violation::StaleReturn {
                slot,
                expected,
                found,
            } => write!(
                f,
                "nested return into slot {slot} expected script {expected} but found {found}"
            ),
            Violation::StaleCheckpoint {
                slot,
                expected,
                found,
            } => write!(
                f,
                "override checkpoint for script {expected} points at slot {slot} now running {found}"
            ),
            Violation::OverrideOutsideCutscene { number } => {
                write!(f, "script {number} began an override outside any cutscene")
            }
            Violation::CutsceneUnderflow { number } => {
                write!(f, "script {number} ended a cutscene that was never begun")
            }
        }
    }
}

/// Shared resolvers let the host keep paging programs while the VM runs.
impl<R: ProgramResolver> ProgramResolver for Rc<RefCell<R>> {
    fn resolve(&mut self, key: ProgramKey) -> Option<ProgramImage> {
        self.borrow_mut().resolve(key)
    }

    fn generation(&self, key: ProgramKey) -> Option<u64> {
        self.borrow().generation(key)
    }

    fn entry_point(&self, key: ProgramKey) -> Option<usize> {
        self.borrow().entry_point(key)
    }

    fn object_origin(&self, object: u16) -> Option<Origin> {
        self.borrow().object_origin(object)
    }

    fn verb_entry_point(&self, object: u16, verb: u16) -> Option<usize> {
        self.borrow().verb_entry_point(object, verb)
    }
}

/// The whole interpreter state: every table the scheduler and the opcode
/// handlers share. Nothing lives in statics, so independent VMs can coexist.
pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) vars: VariableStore,
    pub(crate) slots: SlotTable,
    pub(crate) nest: NestedCallStack,
    pub(crate) cutscenes: CutsceneStack,
    pub(crate) sentences: SentenceQueue,
    pub(crate) cursor: Cursor,
    pub(crate) resolver: Box<dyn ProgramResolver>,
    /// Slot whose fetch-execute loop is running.
    pub(crate) active: Option<SlotId>,
    /// Slot inside `begin_cutscene`; exempt from freezes.
    pub(crate) cutscene_owner: Option<SlotId>,
    pub(crate) override_flag: bool,
    pub(crate) pending_scene: Option<u16>,
    pub(crate) room: u16,
    pub(crate) entry_script: u16,
    events: Vec<String>,
    violations: Vec<Violation>,
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("active", &self.active)
            .field("live_slots", &self.slots.live_count())
            .field("nest_depth", &self.nest.depth())
            .field("cutscene_depth", &self.cutscenes.depth())
            .field("sentences", &self.sentences.len())
            .field("room", &self.room)
            .finish()
    }
}

impl Vm {
    pub fn new(config: VmConfig, resolver: Box<dyn ProgramResolver>) -> Self {
        Vm {
            vars: VariableStore::new(config.num_variables, config.num_bit_variables),
            slots: SlotTable::new(config.slot_count, config.num_locals),
            nest: NestedCallStack::new(config.max_nesting),
            cutscenes: CutsceneStack::new(config.cutscene_depth),
            sentences: SentenceQueue::new(config.sentence_capacity, config.sentence_policy),
            cursor: Cursor::default(),
            resolver,
            active: None,
            cutscene_owner: None,
            override_flag: false,
            pending_scene: None,
            room: 0,
            entry_script: 0,
            events: Vec::new(),
            violations: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn vars(&self) -> &VariableStore {
        &self.vars
    }

    pub fn vars_mut(&mut self) -> &mut VariableStore {
        &mut self.vars
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn slot(&self, id: SlotId) -> Option<&ScriptSlot> {
        self.slots.get(id)
    }

    pub fn active_slot(&self) -> Option<SlotId> {
        self.active
    }

    pub fn nest_depth(&self) -> usize {
        self.nest.depth()
    }

    pub fn cutscene_depth(&self) -> usize {
        self.cutscenes.depth()
    }

    pub fn sentences(&self) -> &SentenceQueue {
        &self.sentences
    }

    pub fn room(&self) -> u16 {
        self.room
    }

    pub fn entry_script(&self) -> u16 {
        self.entry_script
    }

    pub fn resolver_mut(&mut self) -> &mut dyn ProgramResolver {
        self.resolver.as_mut()
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<String> {
        std::mem::take(&mut self.events)
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub(crate) fn log_event(&mut self, event: impl Into<String>) {
        let event = event.into();
        log::debug!("{event}");
        self.events.push(event);
    }

    /// Logs `violation`. Under the strict policy, stop-related violations are
    /// returned as errors; callers check before mutating anything.
    pub(crate) fn record_violation(&mut self, violation: Violation) -> Result<()> {
        let strict =
            self.config.cutscene_stop_policy == CutsceneStopPolicy::Strict && violation.is_stop();
        let message = violation.to_string();
        self.note_violation(violation);
        if strict {
            return Err(VmError::ConsistencyViolation(message));
        }
        Ok(())
    }

    /// Logs `violation` and always degrades.
    pub(crate) fn note_violation(&mut self, violation: Violation) {
        log::warn!("{violation}");
        self.events.push(format!("violation {violation}"));
        self.violations.push(violation);
    }

    pub fn read_var(&self, var: &VariableRef) -> Result<i16> {
        let locals = self
            .active
            .and_then(|id| self.slots.get(id))
            .map(|slot| slot.locals.as_slice());
        self.vars.read(var, locals)
    }

    pub fn write_var(&mut self, var: &VariableRef, value: i16) -> Result<()> {
        let locals = match self.active {
            Some(id) => self.slots.get_mut(id).map(|slot| slot.locals.as_mut_slice()),
            None => None,
        };
        self.vars.write(var, value, locals)
    }

    /// Reads a well-known global, treating an unconfigured one as 0.
    pub(crate) fn well_known(&self, index: Option<u16>) -> Result<i16> {
        match index {
            Some(index) => self.vars.global(index),
            None => Ok(0),
        }
    }

    pub(crate) fn set_well_known(&mut self, index: Option<u16>, value: i16) -> Result<()> {
        match index {
            Some(index) => self.vars.set_global(index, value),
            None => Ok(()),
        }
    }

    pub fn fetch_byte(&mut self) -> Result<u8> {
        self.cursor.fetch_byte(self.resolver.as_mut())
    }

    pub fn fetch_word(&mut self) -> Result<u16> {
        self.cursor.fetch_word(self.resolver.as_mut())
    }

    pub fn fetch_signed_word(&mut self) -> Result<i16> {
        self.cursor.fetch_signed_word(self.resolver.as_mut())
    }

    pub fn fetch_var_ref(&mut self) -> Result<VariableRef> {
        self.cursor.fetch_var_ref(self.resolver.as_mut())
    }

    /// Program the cursor is reading, if any.
    pub fn current_program(&self) -> Option<ProgramKey> {
        self.cursor.key()
    }

    /// Position of the active slot's cursor.
    pub fn pc(&self) -> usize {
        self.cursor.pc()
    }

    pub fn jump(&mut self, delta: i16) -> Result<()> {
        self.cursor.jump(delta)
    }

    pub fn seek(&mut self, pc: usize) {
        self.cursor.seek(pc);
    }
}
