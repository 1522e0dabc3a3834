use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};
use crate::program::ProgramKey;

pub type SlotId = usize;

/// Where a running program lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Global,
    /// Room-local script.
    Local,
    /// Object placed in the current room.
    Room,
    Inventory,
    FloatingObject,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Global => "global",
            Origin::Local => "local",
            Origin::Room => "room",
            Origin::Inventory => "inventory",
            Origin::FloatingObject => "floating",
        }
    }

    /// Global and room-local scripts, addressed by script number.
    pub fn is_script(self) -> bool {
        matches!(self, Origin::Global | Origin::Local)
    }

    /// Object-owned code, addressed by object number.
    pub fn is_object(self) -> bool {
        !self.is_script()
    }

    pub fn same_family(self, other: Origin) -> bool {
        self.is_script() == other.is_script()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Dead,
    Paused,
    Running,
}

/// One process table entry.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptSlot {
    pub number: u16,
    pub origin: Origin,
    pub pc: usize,
    pub status: SlotStatus,
    pub delay: i32,
    pub freeze_count: u32,
    pub freeze_resistant: bool,
    pub recursive: bool,
    pub cutscene_override: u32,
    pub did_execute: bool,
    pub locals: Vec<i16>,
}

impl ScriptSlot {
    fn dead(num_locals: usize) -> Self {
        ScriptSlot {
            number: 0,
            origin: Origin::Global,
            pc: 0,
            status: SlotStatus::Dead,
            delay: 0,
            freeze_count: 0,
            freeze_resistant: false,
            recursive: false,
            cutscene_override: 0,
            did_execute: false,
            locals: vec![0; num_locals],
        }
    }

    pub fn is_live(&self) -> bool {
        self.status != SlotStatus::Dead
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze_count > 0
    }

    pub fn is_runnable(&self) -> bool {
        self.status == SlotStatus::Running && !self.is_frozen()
    }

    pub fn key(&self) -> ProgramKey {
        ProgramKey::new(self.number, self.origin)
    }

    /// Returns the slot to the free pool.
    pub(crate) fn kill(&mut self) {
        let num_locals = self.locals.len();
        *self = ScriptSlot::dead(num_locals);
    }

    pub(crate) fn launch(&mut self, launch: &ScriptLaunch) {
        self.number = launch.number;
        self.origin = launch.origin;
        self.pc = launch.pc;
        self.status = SlotStatus::Running;
        self.delay = 0;
        self.freeze_count = 0;
        self.freeze_resistant = launch.freeze_resistant;
        self.recursive = launch.recursive;
        self.cutscene_override = 0;
        self.did_execute = false;
        self.locals.fill(0);
        let count = launch.locals.len().min(self.locals.len());
        self.locals[..count].copy_from_slice(&launch.locals[..count]);
    }
}

/// Everything `start` needs to initialize a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLaunch {
    pub number: u16,
    pub origin: Origin,
    pub pc: usize,
    pub freeze_resistant: bool,
    pub recursive: bool,
    pub locals: Vec<i16>,
}

impl ScriptLaunch {
    pub fn new(number: u16, origin: Origin) -> Self {
        ScriptLaunch {
            number,
            origin,
            pc: 0,
            freeze_resistant: false,
            recursive: false,
            locals: Vec::new(),
        }
    }

    pub fn at(mut self, pc: usize) -> Self {
        self.pc = pc;
        self
    }

    pub fn freeze_resistant(mut self, value: bool) -> Self {
        self.freeze_resistant = value;
        self
    }

    pub fn recursive(mut self, value: bool) -> Self {
        self.recursive = value;
        self
    }

    pub fn with_locals(mut self, locals: &[i16]) -> Self {
        self.locals = locals.to_vec();
        self
    }
}

/// Fixed-size process table; never grows.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<ScriptSlot>,
}

impl SlotTable {
    pub fn new(count: usize, num_locals: usize) -> Self {
        SlotTable {
            slots: (0..count).map(|_| ScriptSlot::dead(num_locals)).collect(),
        }
    }

    /// First dead slot in index order.
    pub fn allocate(&self) -> Result<SlotId> {
        self.slots
            .iter()
            .position(|slot| !slot.is_live())
            .ok_or(VmError::SlotTableFull {
                capacity: self.slots.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: SlotId) -> Option<&ScriptSlot> {
        self.slots.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: SlotId) -> Option<&mut ScriptSlot> {
        self.slots.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &ScriptSlot)> {
        self.slots.iter().enumerate()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (SlotId, &mut ScriptSlot)> {
        self.slots.iter_mut().enumerate()
    }

    /// Live slots running `number` whose origin satisfies `family`.
    pub fn find_live<F>(&self, number: u16, family: F) -> Vec<SlotId>
    where
        F: Fn(Origin) -> bool,
    {
        self.iter()
            .filter(|(_, slot)| slot.is_live() && slot.number == number && family(slot.origin))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_live()).count()
    }

    pub(crate) fn clear_executed(&mut self) {
        for slot in &mut self.slots {
            slot.did_execute = false;
        }
    }

    pub(crate) fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.kill();
        }
    }
}
