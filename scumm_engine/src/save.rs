use scumm_save::{ResumePoint, SaveGame, VariableDump};

use crate::error::Result;
use crate::vm::Vm;

impl Vm {
    /// Captures what a save persists: the variable store and where to
    /// re-enter. Running scripts are not part of it.
    pub fn snapshot(&self) -> SaveGame {
        SaveGame {
            vars: VariableDump {
                globals: self.vars.globals().to_vec(),
                bits: self.vars.bit_words().to_vec(),
            },
            resume: ResumePoint {
                room: self.room,
                entry_script: self.entry_script,
            },
        }
    }

    /// Loads `save` and drops every in-flight script. The host re-enters
    /// the game through [`Vm::enter_room`].
    pub fn restore(&mut self, save: &SaveGame) -> Result<()> {
        self.vars.restore(&save.vars.globals, &save.vars.bits)?;
        self.slots.reset();
        self.nest.clear();
        self.cutscenes.clear();
        self.sentences.clear();
        self.cursor.detach();
        self.active = None;
        self.cutscene_owner = None;
        self.override_flag = false;
        self.pending_scene = None;
        self.room = save.resume.room;
        self.entry_script = save.resume.entry_script;
        self.log_event(format!(
            "save.restore room {} entry {}",
            self.room, self.entry_script
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::program::ProgramArena;
    use crate::vars::VariableRef;

    #[test]
    fn restore_resets_everything_but_variables() {
        let mut vm = Vm::new(VmConfig::default(), Box::new(ProgramArena::new()));
        vm.write_var(&VariableRef::Global(10), 42).unwrap();
        vm.vars_mut().set_bit(3, true).unwrap();
        vm.room = 7;
        vm.entry_script = 12;
        let save = vm.snapshot();

        let bytes = scumm_save::encode_save(&save).unwrap();
        let decoded = scumm_save::decode_save(&bytes).unwrap();

        let mut fresh = Vm::new(VmConfig::default(), Box::new(ProgramArena::new()));
        fresh.enqueue_sentence(1, 2, 3).unwrap();
        fresh.restore(&decoded).unwrap();
        assert_eq!(fresh.vars().global(10).unwrap(), 42);
        assert!(fresh.vars().bit(3).unwrap());
        assert_eq!((fresh.room(), fresh.entry_script()), (7, 12));
        assert!(fresh.sentences().is_empty());
        assert_eq!(fresh.slots().live_count(), 0);
    }

    #[test]
    fn oversized_dump_is_rejected() {
        let config = VmConfig {
            num_variables: 4,
            ..VmConfig::default()
        };
        let mut vm = Vm::new(config, Box::new(ProgramArena::new()));
        let mut save = vm.snapshot();
        save.vars.globals = vec![0; 5];
        assert!(vm.restore(&save).is_err());
    }
}
