use crate::dispatch::OpcodeDispatcher;
use crate::error::{Result, VmError};
use crate::program::ProgramKey;
use crate::slots::{Origin, ScriptLaunch, SlotId, SlotStatus};
use crate::vm::{Violation, Vm};

impl Vm {
    /// Initializes a slot for `launch` and runs it to its first yield as a
    /// nested call of the active slot. A non-recursive start first stops
    /// every live instance of the same number in the same origin family.
    ///
    /// Returns the slot the script ran in; number 0 starts nothing.
    pub fn start(
        &mut self,
        dispatcher: &mut dyn OpcodeDispatcher,
        launch: ScriptLaunch,
    ) -> Result<Option<SlotId>> {
        if launch.number == 0 {
            return Ok(None);
        }
        if !launch.recursive {
            let origin = launch.origin;
            let label = if origin.is_script() { "script.stop" } else { "object.stop" };
            self.stop_family(launch.number, |other| origin.same_family(other), label)?;
        }

        let id = self.slots.allocate()?;
        if let Some(slot) = self.slots.get_mut(id) {
            slot.launch(&launch);
        }
        self.log_event(format!(
            "script.start {} {} (slot {id})",
            launch.number,
            launch.origin.as_str()
        ));
        self.run_nested(id, dispatcher)?;
        Ok(Some(id))
    }

    /// Starts a script by number. Numbers below `num_global_scripts` are
    /// global, the rest belong to the current room.
    pub fn run_script(
        &mut self,
        dispatcher: &mut dyn OpcodeDispatcher,
        number: u16,
        freeze_resistant: bool,
        recursive: bool,
        locals: &[i16],
    ) -> Result<Option<SlotId>> {
        if number == 0 {
            return Ok(None);
        }
        let origin = if number < self.config.num_global_scripts {
            Origin::Global
        } else {
            Origin::Local
        };
        let key = ProgramKey::new(number, origin);
        let pc = self
            .resolver
            .entry_point(key)
            .ok_or(VmError::ProgramMissing(key))?;
        let launch = ScriptLaunch::new(number, origin)
            .at(pc)
            .freeze_resistant(freeze_resistant)
            .recursive(recursive)
            .with_locals(locals);
        self.start(dispatcher, launch)
    }

    /// Runs `object`'s handler for `verb`. Objects that are not here, or
    /// have no handler, are silently ignored.
    pub fn run_object_script(
        &mut self,
        dispatcher: &mut dyn OpcodeDispatcher,
        object: u16,
        verb: u16,
        freeze_resistant: bool,
        recursive: bool,
        locals: &[i16],
    ) -> Result<Option<SlotId>> {
        let Some(origin) = self.resolver.object_origin(object) else {
            log::debug!("object {object} not present, verb {verb} ignored");
            return Ok(None);
        };
        let Some(pc) = self.resolver.verb_entry_point(object, verb) else {
            log::debug!("object {object} has no entry for verb {verb}");
            return Ok(None);
        };
        let launch = ScriptLaunch::new(object, origin)
            .at(pc)
            .freeze_resistant(freeze_resistant)
            .recursive(recursive)
            .with_locals(locals);
        self.start(dispatcher, launch)
    }

    /// Stops every live global or room-local script numbered `number`.
    pub fn stop_script(&mut self, number: u16) -> Result<()> {
        self.stop_family(number, Origin::is_script, "script.stop")
    }

    /// Stops every live instance of object `number`'s code.
    pub fn stop_object_script(&mut self, number: u16) -> Result<()> {
        self.stop_family(number, Origin::is_object, "object.stop")
    }

    fn stop_family<F>(&mut self, number: u16, family: F, label: &str) -> Result<()>
    where
        F: Fn(Origin) -> bool,
    {
        if number == 0 {
            return Ok(());
        }
        let targets = self.slots.find_live(number, &family);

        // Report every override holder before touching anything so the
        // strict policy leaves the tables as they were.
        for &id in &targets {
            let holder = self
                .slots
                .get(id)
                .filter(|slot| slot.cutscene_override > 0)
                .map(|slot| slot.origin);
            if let Some(origin) = holder {
                self.record_violation(Violation::StoppedWithOverride {
                    number,
                    origin,
                    slot: id,
                })?;
            }
        }

        for &id in &targets {
            self.kill_slot(id);
        }
        let purged = self.nest.purge(number, &family);
        if !targets.is_empty() || purged > 0 {
            self.log_event(format!("{label} {number}"));
        }
        Ok(())
    }

    fn kill_slot(&mut self, id: SlotId) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.kill();
        }
        if self.active == Some(id) {
            self.active = None;
            self.cursor.detach();
        }
        if self.cutscene_owner == Some(id) {
            self.cutscene_owner = None;
        }
    }

    /// Room teardown: kills every room-local script and every object
    /// script bound to the room. Override holders are reset and reported,
    /// never rejected, because this runs mid scene change.
    pub fn stop_room_scripts(&mut self) {
        // Objects moved since their slot last ran count where they are now.
        for (_, slot) in self.slots.iter_mut() {
            if slot.is_live() && slot.origin.is_object() {
                if let Some(origin) = self.resolver.object_origin(slot.number) {
                    slot.origin = origin;
                }
            }
        }
        let targets: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.is_live()
                    && matches!(
                        slot.origin,
                        Origin::Local | Origin::Room | Origin::FloatingObject
                    )
            })
            .map(|(id, slot)| (id, slot.number, slot.origin, slot.cutscene_override))
            .collect();

        for (id, number, origin, overrides) in targets {
            if overrides > 0 {
                self.note_violation(Violation::TornDownWithOverride {
                    number,
                    origin,
                    slot: id,
                });
            }
            self.kill_slot(id);
            self.nest.purge_slot(id);
        }
        self.log_event(format!("room.teardown {}", self.room));
    }

    /// Freezes every live slot except the active one. Resistant slots are
    /// skipped unless `override_resistance` is set; slots inside a
    /// cutscene are thawed instead.
    pub fn freeze_all(&mut self, override_resistance: bool) {
        let active = self.active;
        let owner = self.cutscene_owner;
        let mut frozen = 0;
        for (id, slot) in self.slots.iter_mut() {
            if !slot.is_live() || Some(id) == active {
                continue;
            }
            if Some(id) == owner || slot.cutscene_override > 0 {
                slot.freeze_count = 0;
                continue;
            }
            if slot.freeze_resistant && !override_resistance {
                continue;
            }
            slot.freeze_count += 1;
            frozen += 1;
        }
        self.sentences.freeze_all();
        self.log_event(format!("freeze.all {frozen}"));
    }

    pub fn unfreeze_all(&mut self) {
        let mut thawed = 0;
        for (_, slot) in self.slots.iter_mut() {
            if slot.is_live() && slot.freeze_count > 0 {
                slot.freeze_count -= 1;
                if slot.freeze_count == 0 {
                    thawed += 1;
                }
            }
        }
        self.sentences.unfreeze_all();
        self.log_event(format!("unfreeze.all {thawed}"));
    }

    /// Counts paused, unfrozen slots down by `amount`. A slot wakes once its
    /// delay drops below zero.
    pub fn decrease_delays(&mut self, amount: i32) {
        for (_, slot) in self.slots.iter_mut() {
            if slot.status != SlotStatus::Paused || slot.is_frozen() {
                continue;
            }
            slot.delay -= amount;
            if slot.delay < 0 {
                slot.status = SlotStatus::Running;
                slot.delay = 0;
            }
        }
    }

    /// Whether a global or room-local script `number` is live.
    pub fn is_running(&self, number: u16) -> bool {
        !self.slots.find_live(number, Origin::is_script).is_empty()
    }

    /// Whether anything at all runs under `number`.
    pub fn is_script_in_use(&self, number: u16) -> bool {
        !self.slots.find_live(number, |_| true).is_empty()
    }

    pub fn is_room_script_running(&self, number: u16) -> bool {
        !self
            .slots
            .find_live(number, |origin| origin == Origin::Room)
            .is_empty()
    }

    /// Tears down the current room and enters `room`, running its entry
    /// script as a top-level invocation.
    pub fn enter_room(
        &mut self,
        dispatcher: &mut dyn OpcodeDispatcher,
        room: u16,
        entry_script: Option<u16>,
    ) -> Result<()> {
        self.stop_room_scripts();
        self.room = room;
        self.entry_script = entry_script.unwrap_or(0);
        self.log_event(format!("room.enter {room}"));
        self.active = None;
        self.cursor.detach();
        if let Some(number) = entry_script {
            self.run_script(dispatcher, number, false, false, &[])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CutsceneStopPolicy, VmConfig};
    use crate::dispatch::Step;
    use crate::program::ProgramArena;

    /// Every opcode yields.
    struct AlwaysYield;

    impl OpcodeDispatcher for AlwaysYield {
        fn dispatch(&mut self, _vm: &mut Vm, _opcode: u8) -> Result<Step> {
            Ok(Step::Yield)
        }
    }

    fn vm(config: VmConfig) -> Vm {
        let mut arena = ProgramArena::new();
        for number in 1..=9 {
            arena.insert(ProgramKey::new(number, Origin::Global), vec![1; 8]);
        }
        arena.insert(ProgramKey::new(300, Origin::Local), vec![1; 8]);
        arena.insert_object(40, Origin::Room, vec![1; 8], [(2, 0)]);
        Vm::new(config, Box::new(arena))
    }

    fn start(vm: &mut Vm, number: u16) -> SlotId {
        vm.run_script(&mut AlwaysYield, number, false, false, &[])
            .unwrap()
            .unwrap()
    }

    #[test]
    fn non_recursive_start_replaces_live_instance() {
        let mut vm = vm(VmConfig::default());
        start(&mut vm, 3);
        start(&mut vm, 3);
        assert_eq!(vm.slots().live_count(), 1);

        vm.run_script(&mut AlwaysYield, 3, false, true, &[])
            .unwrap();
        assert_eq!(vm.slots().live_count(), 2);
    }

    #[test]
    fn non_recursive_object_start_leaves_same_numbered_script() {
        let mut arena = ProgramArena::new();
        arena.insert(ProgramKey::new(40, Origin::Global), vec![1; 8]);
        arena.insert_object(40, Origin::Room, vec![1; 8], [(2, 0)]);
        let mut vm = Vm::new(VmConfig::default(), Box::new(arena));

        let script = start(&mut vm, 40);
        for _ in 0..2 {
            vm.run_object_script(&mut AlwaysYield, 40, 2, false, false, &[])
                .unwrap();
        }

        assert!(vm.slot(script).unwrap().is_live());
        assert_eq!(vm.slots().find_live(40, Origin::is_object).len(), 1);
        assert_eq!(vm.slots().live_count(), 2);
        assert!(vm.events().iter().any(|event| event == "object.stop 40"));
        assert!(!vm.events().iter().any(|event| event == "script.stop 40"));
    }

    #[test]
    fn numbers_past_the_global_range_are_room_local() {
        let mut vm = vm(VmConfig::default());
        let id = start(&mut vm, 300);
        assert_eq!(vm.slot(id).unwrap().origin, Origin::Local);
        assert!(vm.is_running(300));
        assert!(matches!(
            vm.run_script(&mut AlwaysYield, 301, false, false, &[]),
            Err(VmError::ProgramMissing(_))
        ));
    }

    #[test]
    fn object_scripts_resolve_through_the_verb_table() {
        let mut vm = vm(VmConfig::default());
        let id = vm
            .run_object_script(&mut AlwaysYield, 40, 2, false, false, &[7])
            .unwrap()
            .unwrap();
        assert_eq!(vm.slot(id).unwrap().origin, Origin::Room);
        assert_eq!(vm.slot(id).unwrap().locals[0], 7);
        assert!(vm.is_room_script_running(40));
        assert!(!vm.is_running(40));

        // No default entry for verb 5, and object 41 does not exist.
        assert_eq!(
            vm.run_object_script(&mut AlwaysYield, 40, 5, false, false, &[])
                .unwrap(),
            None
        );
        assert_eq!(
            vm.run_object_script(&mut AlwaysYield, 41, 2, false, false, &[])
                .unwrap(),
            None
        );
    }

    #[test]
    fn stop_leaves_the_other_family_alone() {
        let mut vm = vm(VmConfig {
            num_global_scripts: 50,
            ..VmConfig::default()
        });
        start(&mut vm, 4);
        let mut arena = ProgramArena::new();
        arena.insert_object(4, Origin::Inventory, vec![1; 4], [(1, 0)]);
        let mut vm2 = Vm::new(VmConfig::default(), Box::new(arena));
        vm2.run_object_script(&mut AlwaysYield, 4, 1, false, false, &[])
            .unwrap();

        vm.stop_object_script(4).unwrap();
        assert!(vm.is_running(4));
        vm2.stop_script(4).unwrap();
        assert!(vm2.is_script_in_use(4));
        vm2.stop_object_script(4).unwrap();
        assert!(!vm2.is_script_in_use(4));
    }

    #[test]
    fn stopping_an_override_holder_degrades_by_default() {
        let mut vm = vm(VmConfig::default());
        let id = start(&mut vm, 5);
        vm.slots.get_mut(id).unwrap().cutscene_override = 1;

        vm.stop_script(5).unwrap();
        assert!(!vm.is_running(5));
        assert!(matches!(
            vm.violations(),
            [Violation::StoppedWithOverride { number: 5, .. }]
        ));
    }

    #[test]
    fn strict_policy_rejects_the_stop_untouched() {
        let mut vm = vm(VmConfig {
            cutscene_stop_policy: CutsceneStopPolicy::Strict,
            ..VmConfig::default()
        });
        let id = start(&mut vm, 5);
        vm.slots.get_mut(id).unwrap().cutscene_override = 1;

        assert!(matches!(
            vm.stop_script(5),
            Err(VmError::ConsistencyViolation(_))
        ));
        assert!(vm.is_running(5));
    }

    #[test]
    fn room_teardown_keeps_globals_and_inventory() {
        let mut vm = vm(VmConfig {
            cutscene_stop_policy: CutsceneStopPolicy::Strict,
            ..VmConfig::default()
        });
        let global = start(&mut vm, 2);
        let local = start(&mut vm, 300);
        vm.run_object_script(&mut AlwaysYield, 40, 2, false, false, &[])
            .unwrap();
        vm.slots.get_mut(local).unwrap().cutscene_override = 2;

        vm.stop_room_scripts();
        assert_eq!(vm.slots().live_count(), 1);
        assert!(vm.slot(global).unwrap().is_live());
        assert_eq!(vm.violations().len(), 1);
    }

    #[test]
    fn freeze_is_counted_and_respects_resistance() {
        let mut vm = vm(VmConfig::default());
        let plain = start(&mut vm, 1);
        let resistant = vm
            .run_script(&mut AlwaysYield, 2, true, false, &[])
            .unwrap()
            .unwrap();

        vm.freeze_all(false);
        vm.freeze_all(false);
        assert_eq!(vm.slot(plain).unwrap().freeze_count, 2);
        assert_eq!(vm.slot(resistant).unwrap().freeze_count, 0);

        vm.freeze_all(true);
        assert_eq!(vm.slot(resistant).unwrap().freeze_count, 1);

        vm.unfreeze_all();
        vm.unfreeze_all();
        assert!(vm.slot(plain).unwrap().is_frozen());
        vm.unfreeze_all();
        assert!(!vm.slot(plain).unwrap().is_frozen());
        assert!(!vm.slot(resistant).unwrap().is_frozen());
        vm.unfreeze_all();
        assert_eq!(vm.slot(plain).unwrap().freeze_count, 0);
    }

    #[test]
    fn frozen_paused_slots_keep_their_delay() {
        let mut vm = vm(VmConfig::default());
        let id = start(&mut vm, 1);
        {
            let slot = vm.slots.get_mut(id).unwrap();
            slot.status = SlotStatus::Paused;
            slot.delay = 1;
        }
        vm.freeze_all(false);
        vm.decrease_delays(5);
        assert_eq!(vm.slot(id).unwrap().delay, 1);
        vm.unfreeze_all();
        vm.decrease_delays(1);
        assert_eq!(vm.slot(id).unwrap().status, SlotStatus::Paused);
        vm.decrease_delays(1);
        assert_eq!(vm.slot(id).unwrap().status, SlotStatus::Running);
    }

    #[test]
    fn entering_a_room_runs_its_entry_script() {
        let mut vm = vm(VmConfig::default());
        start(&mut vm, 300);
        vm.enter_room(&mut AlwaysYield, 3, Some(6)).unwrap();
        assert!(!vm.is_running(300));
        assert!(vm.is_running(6));
        assert_eq!((vm.room(), vm.entry_script()), (3, 6));
    }
}
