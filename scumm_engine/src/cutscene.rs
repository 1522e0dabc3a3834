use serde::Serialize;

use crate::dispatch::OpcodeDispatcher;
use crate::error::{Result, VmError};
use crate::slots::{SlotId, SlotStatus};
use crate::vm::{Violation, Vm};

/// One cutscene nesting level and its skip checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CutsceneFrame {
    /// Opaque tag handed to the end script.
    pub data: i16,
    pub slot: Option<SlotId>,
    /// Script the checkpoint belongs to, checked again on skip.
    pub number: u16,
    /// 0 means no checkpoint.
    pub resume_pc: usize,
}

impl CutsceneFrame {
    pub fn has_checkpoint(&self) -> bool {
        self.resume_pc != 0
    }

    fn clear_checkpoint(&mut self) {
        self.slot = None;
        self.number = 0;
        self.resume_pc = 0;
    }
}

/// Bounded stack of cutscene frames. Frame 0 is a permanent base so that an
/// override begun outside any cutscene still has somewhere to live.
#[derive(Debug, Clone)]
pub struct CutsceneStack {
    frames: Vec<CutsceneFrame>,
    capacity: usize,
}

impl CutsceneStack {
    pub fn new(capacity: usize) -> Self {
        let mut frames = Vec::with_capacity(capacity + 1);
        frames.push(CutsceneFrame::default());
        CutsceneStack { frames, capacity }
    }

    /// Number of open cutscenes.
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn push(&mut self, data: i16) -> Result<()> {
        if self.depth() >= self.capacity {
            return Err(VmError::CutsceneOverflow {
                depth: self.capacity,
            });
        }
        self.frames.push(CutsceneFrame {
            data,
            ..CutsceneFrame::default()
        });
        Ok(())
    }

    /// Pops the innermost cutscene; `None` when only the base frame is left.
    pub fn pop(&mut self) -> Option<CutsceneFrame> {
        if self.depth() == 0 {
            return None;
        }
        self.frames.pop()
    }

    pub fn top(&self) -> &CutsceneFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn top_mut(&mut self) -> &mut CutsceneFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    pub fn iter(&self) -> impl Iterator<Item = &CutsceneFrame> {
        self.frames.iter()
    }

    pub fn clear(&mut self) {
        self.frames.truncate(1);
        self.frames[0] = CutsceneFrame::default();
    }
}

impl Vm {
    /// Opens a cutscene for the active slot and runs the configured start
    /// script with `args` as its locals.
    pub fn begin_cutscene(
        &mut self,
        dispatcher: &mut dyn OpcodeDispatcher,
        args: &[i16],
    ) -> Result<()> {
        let data = args.first().copied().unwrap_or(0);
        self.cutscenes.push(data)?;
        let owner = self.active;
        if let Some(slot) = owner.and_then(|id| self.slots.get_mut(id)) {
            slot.cutscene_override += 1;
        }
        self.cutscene_owner = owner;
        self.log_event(format!(
            "cutscene.begin {data} (depth {})",
            self.cutscenes.depth()
        ));

        let result = match self.well_known(self.config.well_known.cutscene_start_script) {
            Ok(script) if script > 0 => self
                .run_script(dispatcher, script as u16, false, false, args)
                .map(|_| ()),
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };
        self.cutscene_owner = None;
        result
    }

    pub fn end_cutscene(&mut self, dispatcher: &mut dyn OpcodeDispatcher) -> Result<()> {
        let mut number = 0;
        if let Some(slot) = self.active.and_then(|id| self.slots.get_mut(id)) {
            slot.cutscene_override = slot.cutscene_override.saturating_sub(1);
            number = slot.number;
        }
        self.set_well_known(self.config.well_known.override_var, 0)?;

        let Some(frame) = self.cutscenes.pop() else {
            self.note_violation(Violation::CutsceneUnderflow { number });
            return Ok(());
        };
        self.log_event(format!(
            "cutscene.end {} (depth {})",
            frame.data,
            self.cutscenes.depth()
        ));

        let script = self.well_known(self.config.well_known.cutscene_end_script)?;
        if script > 0 {
            self.run_script(dispatcher, script as u16, false, false, &[frame.data])?;
        }
        Ok(())
    }

    /// Records a skip checkpoint at the jump that follows the override
    /// directive, then steps over that jump.
    pub fn begin_override(&mut self) -> Result<()> {
        let id = self.active.ok_or(VmError::NoActiveScript)?;
        let number = self.slots.get(id).map_or(0, |slot| slot.number);
        let pc = self.cursor.pc();
        if self.cutscenes.depth() == 0 {
            self.note_violation(Violation::OverrideOutsideCutscene { number });
        }
        {
            let frame = self.cutscenes.top_mut();
            frame.slot = Some(id);
            frame.number = number;
            frame.resume_pc = pc;
        }
        self.fetch_byte()?;
        self.fetch_word()?;
        self.set_well_known(self.config.well_known.override_var, 0)?;
        self.log_event(format!("cutscene.override.begin {number} @{pc}"));
        Ok(())
    }

    pub fn end_override(&mut self) -> Result<()> {
        self.cutscenes.top_mut().clear_checkpoint();
        self.set_well_known(self.config.well_known.override_var, 0)?;
        self.log_event("cutscene.override.end");
        Ok(())
    }

    /// The user skip. Sends the checkpoint's slot back to the recorded
    /// jump, which carries it past the skippable segment. Returns whether a
    /// skip happened.
    pub fn abort_override(&mut self) -> Result<bool> {
        let frame = *self.cutscenes.top();
        let Some(id) = frame.slot.filter(|_| frame.has_checkpoint()) else {
            return Ok(false);
        };
        self.cutscenes.top_mut().clear_checkpoint();

        let found = self
            .slots
            .get(id)
            .filter(|slot| slot.is_live())
            .map_or(0, |slot| slot.number);
        if found != frame.number {
            self.note_violation(Violation::StaleCheckpoint {
                slot: id,
                expected: frame.number,
                found,
            });
            return Ok(false);
        }

        if let Some(slot) = self.slots.get_mut(id) {
            slot.pc = frame.resume_pc;
            slot.status = SlotStatus::Running;
            slot.delay = 0;
            slot.freeze_count = 0;
            slot.cutscene_override = slot.cutscene_override.saturating_sub(1);
        }
        if self.active == Some(id) {
            self.cursor.seek(frame.resume_pc);
        }
        self.set_well_known(self.config.well_known.override_var, 1)?;
        self.override_flag = true;
        self.log_event(format!(
            "cutscene.override.skip {} @{}",
            frame.number, frame.resume_pc
        ));
        Ok(true)
    }

    /// Reports and clears the one-tick "override active" signal.
    pub fn take_override_flag(&mut self) -> bool {
        std::mem::take(&mut self.override_flag)
    }

    pub fn override_active(&self) -> bool {
        self.override_flag
    }

    pub fn cutscene_frames(&self) -> impl Iterator<Item = &CutsceneFrame> {
        self.cutscenes.iter()
    }
}
