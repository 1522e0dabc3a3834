use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::bundle::ScriptBundle;
use crate::cli::RunArgs;
use crate::config::VmConfig;
use crate::opcodes::CoreOpcodes;
use crate::scheduler::TickOutcome;
use crate::slots::{ScriptSlot, SlotId};
use crate::vm::Vm;

pub fn execute(args: RunArgs) -> Result<()> {
    let RunArgs {
        bundle,
        config,
        ticks,
        start,
        skip_at,
        event_log_json,
        save,
        verbose: _,
    } = args;

    let config = match config.as_ref() {
        Some(path) => VmConfig::from_json_file(path)?,
        None => VmConfig::default(),
    };
    let bundle = ScriptBundle::load(&bundle)?;
    if let Some(path) = event_log_json.as_ref() {
        eprintln!(
            "[scumm_engine] info: capturing event log to {}",
            path.display()
        );
    }

    let mut session = Session::new(&bundle, config)?;
    for script in start {
        session
            .start(script)
            .with_context(|| format!("starting script {script}"))?;
    }
    for tick in 0..ticks {
        let skip = skip_at.contains(&tick);
        let outcome = session
            .tick(skip)
            .with_context(|| format!("running tick {tick}"))?;
        if let TickOutcome::SceneChange { room, .. } = outcome {
            println!("tick {tick}: entered room {room}");
        }
    }

    let log = session.event_log();
    if !log.violations.is_empty() {
        eprintln!(
            "[scumm_engine] warning: {} consistency violation(s) recorded",
            log.violations.len()
        );
    }
    if let Some(path) = event_log_json.as_ref() {
        let json = serde_json::to_string_pretty(&log).context("serializing event log to JSON")?;
        fs::write(path, &json)
            .with_context(|| format!("writing event log to {}", path.display()))?;
        println!("Saved event log to {}", path.display());
    }
    if let Some(path) = save.as_ref() {
        let bytes = scumm_save::encode_save(&session.vm().snapshot())
            .context("encoding save state")?;
        fs::write(path, bytes).with_context(|| format!("writing save to {}", path.display()))?;
        println!("Saved game state to {}", path.display());
    }

    println!(
        "Ran {} ticks; room {}; {} live script(s)",
        log.ticks,
        log.room,
        log.live_slots.len()
    );
    Ok(())
}

pub fn inspect_save(path: &Path) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("reading save {}", path.display()))?;
    let save = scumm_save::decode_save(&bytes)
        .with_context(|| format!("decoding save {}", path.display()))?;
    let json = serde_json::to_string_pretty(&save).context("serializing save to JSON")?;
    println!("{json}");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct EventLogEntry {
    pub sequence: u32,
    pub tick: u32,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveSlot {
    pub slot: SlotId,
    #[serde(flatten)]
    pub state: ScriptSlot,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventLog {
    pub ticks: u32,
    pub room: u16,
    pub events: Vec<EventLogEntry>,
    pub violations: Vec<String>,
    pub live_slots: Vec<LiveSlot>,
}

/// One host session: a VM running a bundle with the core opcode set.
///
/// Each tick sends the skip signal if asked, counts delays down, runs the
/// sentence script, sweeps the slot table, then performs any scene change
/// the sweep asked for.
pub struct Session {
    vm: Vm,
    dispatcher: CoreOpcodes,
    rooms: BTreeMap<u16, u16>,
    tick: u32,
    events: Vec<EventLogEntry>,
}

impl Session {
    pub fn new(bundle: &ScriptBundle, config: VmConfig) -> Result<Self> {
        config.validate().context("invalid vm config")?;
        let arena = bundle.to_arena()?;
        let mut vm = Vm::new(config, Box::new(arena));
        for (&index, &value) in &bundle.variables {
            vm.vars_mut()
                .set_global(index, value)
                .with_context(|| format!("seeding variable {index}"))?;
        }

        let mut session = Session {
            vm,
            dispatcher: CoreOpcodes,
            rooms: bundle.rooms.clone(),
            tick: 0,
            events: Vec::new(),
        };
        let entry = bundle.entry_script(bundle.room);
        session
            .vm
            .enter_room(&mut session.dispatcher, bundle.room, entry)
            .with_context(|| format!("entering room {}", bundle.room))?;
        session.drain_events();
        Ok(session)
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    pub fn start(&mut self, script: u16) -> Result<()> {
        self.vm
            .run_script(&mut self.dispatcher, script, false, false, &[])?;
        self.drain_events();
        Ok(())
    }

    pub fn tick(&mut self, skip: bool) -> Result<TickOutcome> {
        if skip && self.vm.abort_override()? {
            log::info!("cutscene skipped at tick {}", self.tick);
        }
        self.vm.decrease_delays(1);
        self.vm.tick_sentences(&mut self.dispatcher)?;
        let outcome = self.vm.run_tick(&mut self.dispatcher)?;
        if let TickOutcome::SceneChange { room, .. } = outcome {
            let entry = self.rooms.get(&room).copied();
            self.vm.enter_room(&mut self.dispatcher, room, entry)?;
        }
        self.drain_events();
        self.tick += 1;
        Ok(outcome)
    }

    fn drain_events(&mut self) {
        for label in self.vm.take_events() {
            self.events.push(EventLogEntry {
                sequence: self.events.len() as u32,
                tick: self.tick,
                label,
            });
        }
    }

    pub fn event_log(&self) -> EventLog {
        EventLog {
            ticks: self.tick,
            room: self.vm.room(),
            events: self.events.clone(),
            violations: self
                .vm
                .violations()
                .iter()
                .map(ToString::to_string)
                .collect(),
            live_slots: self
                .vm
                .slots()
                .iter()
                .filter(|(_, slot)| slot.is_live())
                .map(|(slot, state)| LiveSlot {
                    slot,
                    state: state.clone(),
                })
                .collect(),
        }
    }
}
