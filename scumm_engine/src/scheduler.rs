use serde::Serialize;

use crate::dispatch::{OpcodeDispatcher, Step};
use crate::error::{Result, VmError};
use crate::nest::NestRecord;
use crate::slots::{SlotId, SlotStatus};
use crate::vm::{Violation, Vm};

/// How a call to [`Vm::run_tick`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Every slot index was visited; `executed` slots ran.
    Completed { executed: usize },
    /// A script asked for a scene change and the sweep stopped after it.
    SceneChange { room: u16, executed: usize },
}

impl TickOutcome {
    pub fn executed(&self) -> usize {
        match *self {
            TickOutcome::Completed { executed } | TickOutcome::SceneChange { executed, .. } => {
                executed
            }
        }
    }
}

impl Vm {
    /// Runs one scheduler pass: every runnable slot, in ascending index
    /// order, until it yields or terminates.
    ///
    /// Handlers must not call this; nested work goes through [`Vm::start`].
    pub fn run_tick(&mut self, dispatcher: &mut dyn OpcodeDispatcher) -> Result<TickOutcome> {
        let skip_signalled = self.override_flag;
        self.slots.clear_executed();
        self.active = None;
        self.cursor.detach();

        let result = self.sweep(dispatcher);
        if result.is_err() {
            self.active = None;
            self.cursor.detach();
        }
        if skip_signalled {
            self.override_flag = false;
        }
        result
    }

    fn sweep(&mut self, dispatcher: &mut dyn OpcodeDispatcher) -> Result<TickOutcome> {
        // Requested between ticks (host start, room entry, sentence): no
        // slot in this sweep asked for it, so none of them runs.
        if let Some(room) = self.pending_scene.take() {
            self.log_event(format!("scene.change {room}"));
            return Ok(TickOutcome::SceneChange { room, executed: 0 });
        }
        let mut executed = 0;
        for id in 0..self.slots.len() {
            let runnable = self
                .slots
                .get(id)
                .is_some_and(|slot| slot.is_runnable() && !slot.did_execute);
            if !runnable {
                continue;
            }
            executed += 1;
            let depth = self.nest.depth();
            self.activate(id)?;
            self.execute(dispatcher)?;
            if self.nest.depth() != depth {
                return Err(VmError::NestingImbalance {
                    slot: id,
                    expected: depth,
                    found: self.nest.depth(),
                });
            }
            if let Some(room) = self.pending_scene.take() {
                self.log_event(format!("scene.change {room} (slot {id})"));
                return Ok(TickOutcome::SceneChange { room, executed });
            }
        }
        Ok(TickOutcome::Completed { executed })
    }

    /// Points the cursor at `id`'s stored pc and makes it the active slot.
    pub(crate) fn activate(&mut self, id: SlotId) -> Result<()> {
        let slot = self.slots.get(id).ok_or_else(|| {
            VmError::ConsistencyViolation(format!("slot {id} is outside the slot table"))
        })?;
        let (key, pc) = (slot.key(), slot.pc);
        self.cursor.attach(key, pc, self.resolver.as_mut())?;
        self.active = Some(id);
        if let Some(slot) = self.slots.get_mut(id) {
            slot.did_execute = true;
        }
        self.sync_origin();
        Ok(())
    }

    /// Carries an object move the cursor followed over to the active slot.
    fn sync_origin(&mut self) {
        let (Some(id), Some(key)) = (self.active, self.cursor.key()) else {
            return;
        };
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        if slot.number != key.number || slot.origin == key.origin {
            return;
        }
        let previous = std::mem::replace(&mut slot.origin, key.origin);
        self.log_event(format!(
            "object.move {} {} -> {} (slot {id})",
            key.number,
            previous.as_str(),
            key.origin.as_str()
        ));
    }

    /// Fetch-execute loop for whatever slot is active, until none is.
    pub(crate) fn execute(&mut self, dispatcher: &mut dyn OpcodeDispatcher) -> Result<()> {
        while let Some(id) = self.active {
            let pc = self.cursor.pc();
            let opcode = self.fetch_byte()?;
            log::trace!("slot {id} pc {pc}: opcode {opcode:#04x}");
            let step = dispatcher.dispatch(self, opcode)?;
            self.apply_step(step)?;
        }
        Ok(())
    }

    fn apply_step(&mut self, step: Step) -> Result<()> {
        let Some(id) = self.active else {
            return Ok(());
        };
        match step {
            Step::Continue => {}
            Step::Yield => self.break_here(),
            Step::Delay(ticks) => {
                if let Some(slot) = self.slots.get_mut(id) {
                    slot.delay = ticks;
                    slot.status = SlotStatus::Paused;
                }
                self.break_here();
            }
            Step::Terminate => self.terminate_active()?,
        }
        Ok(())
    }

    /// Suspends the active slot at the current pc until the next tick.
    pub(crate) fn break_here(&mut self) {
        self.sync_origin();
        if let Some(id) = self.active.take() {
            let pc = self.cursor.pc();
            if let Some(slot) = self.slots.get_mut(id) {
                slot.pc = pc;
            }
        }
        self.cursor.detach();
    }

    fn terminate_active(&mut self) -> Result<()> {
        self.sync_origin();
        let Some(id) = self.active else {
            return Ok(());
        };
        let Some(slot) = self.slots.get(id) else {
            return Ok(());
        };
        let (number, origin) = (slot.number, slot.origin);
        if slot.cutscene_override > 0 {
            self.record_violation(Violation::EndedWithOverride {
                number,
                origin,
                slot: id,
            })?;
        }
        if let Some(slot) = self.slots.get_mut(id) {
            slot.kill();
        }
        if self.cutscene_owner == Some(id) {
            self.cutscene_owner = None;
        }
        self.active = None;
        self.cursor.detach();
        self.log_event(format!("script.end {number} {} (slot {id})", origin.as_str()));
        Ok(())
    }

    /// Runs `id` to its first yield as a nested invocation of whatever slot
    /// is active, then resumes the caller if it is still the same script.
    pub(crate) fn run_nested(
        &mut self,
        id: SlotId,
        dispatcher: &mut dyn OpcodeDispatcher,
    ) -> Result<()> {
        self.sync_origin();
        let record = match self.active {
            Some(caller) => {
                let pc = self.cursor.pc();
                match self.slots.get_mut(caller) {
                    Some(slot) => {
                        slot.pc = pc;
                        NestRecord::caller(caller, slot.number, slot.origin)
                    }
                    None => NestRecord::top_level(),
                }
            }
            None => NestRecord::top_level(),
        };
        self.nest.push(record)?;

        let result = match self.activate(id) {
            Ok(()) => self.execute(dispatcher),
            Err(err) => Err(err),
        };
        let record = self.nest.pop().unwrap_or_else(NestRecord::top_level);
        if let Err(err) = result {
            self.active = None;
            self.cursor.detach();
            return Err(err);
        }
        self.resume_caller(record)
    }

    fn resume_caller(&mut self, record: NestRecord) -> Result<()> {
        self.active = None;
        self.cursor.detach();
        if !record.is_valid() {
            return Ok(());
        }
        let (Some(caller), Some(origin)) = (record.slot, record.origin) else {
            return Ok(());
        };
        let Some(slot) = self.slots.get(caller) else {
            return Ok(());
        };
        if slot.number != record.number || slot.origin != origin {
            // A dead caller is an ordinary stop; a live one means the slot
            // was reused for another script while we were nested.
            if slot.is_live() {
                let found = slot.number;
                self.note_violation(Violation::StaleReturn {
                    slot: caller,
                    expected: record.number,
                    found,
                });
            }
            return Ok(());
        }
        if !slot.is_live() || slot.is_frozen() {
            return Ok(());
        }
        self.activate(caller)
    }

    /// Asks the sweep to stop after the current slot so the host can switch
    /// rooms.
    pub fn request_scene_change(&mut self, room: u16) {
        self.log_event(format!("scene.request {room}"));
        self.pending_scene = Some(room);
    }

    pub fn pending_scene(&self) -> Option<u16> {
        self.pending_scene
    }
}
