use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::tempdir;

#[derive(Debug, Deserialize)]
struct EventLog {
    ticks: u32,
    room: u16,
    events: Vec<EventLogEntry>,
    violations: Vec<String>,
    live_slots: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct EventLogEntry {
    sequence: u32,
    tick: u32,
    label: String,
}

fn run_binary(args: &[&str]) -> Result<String> {
    let output = Command::new(env!("CARGO_BIN_EXE_scumm_engine"))
        .args(args)
        .output()
        .context("running scumm_engine")?;
    ensure!(
        output.status.success(),
        "scumm_engine {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(String::from_utf8(output.stdout)?)
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("temp paths are utf-8")
}

#[test]
fn two_room_session_writes_log_and_save() -> Result<()> {
    let dir = tempdir()?;
    let bundle_path = dir.path().join("bundle.json");
    let log_path = dir.path().join("events.json");
    let save_path = dir.path().join("game.sav");

    // Room 1's entry sets var 10, yields, then loads room 2. Room 2's entry
    // copies var 10 into var 11 and idles. Script 5 runs a skippable
    // cutscene that would otherwise set var 12.
    let bundle = json!({
        "room": 1,
        "rooms": { "1": 300, "2": 301 },
        "global_scripts": [
            { "number": 5, "code": "0a00 0c 060800 01 01 030c00 0100 0d 0b 00" }
        ],
        "local_scripts": [
            { "number": 300, "code": "03 0a00 2a00 01 10 02 00" },
            { "number": 301, "code": "04 0b00 0a00 01 06 fcff" }
        ],
        "variables": { "20": 3 }
    });
    fs::write(&bundle_path, serde_json::to_string_pretty(&bundle)?)?;

    let stdout = run_binary(&[
        "run",
        "--bundle",
        path_arg(&bundle_path),
        "--ticks",
        "4",
        "--start",
        "5",
        "--skip-at",
        "0",
        "--event-log-json",
        path_arg(&log_path),
        "--save",
        path_arg(&save_path),
    ])?;
    assert!(stdout.contains("tick 0: entered room 2"), "stdout: {stdout}");

    let log: EventLog = serde_json::from_str(&fs::read_to_string(&log_path)?)?;
    assert_eq!(log.ticks, 4);
    assert_eq!(log.room, 2);
    assert!(log.violations.is_empty(), "{:?}", log.violations);
    for (index, entry) in log.events.iter().enumerate() {
        assert_eq!(entry.sequence as usize, index);
    }
    let labels: Vec<&str> = log.events.iter().map(|entry| entry.label.as_str()).collect();
    assert!(labels.contains(&"room.enter 1"));
    assert!(labels.contains(&"cutscene.override.skip 5 @3"));
    let entered = log
        .events
        .iter()
        .find(|entry| entry.label == "room.enter 2")
        .context("room 2 was never entered")?;
    assert_eq!(entered.tick, 0);
    assert_eq!(log.live_slots.len(), 1);
    assert_eq!(log.live_slots[0]["number"], 301);

    let stdout = run_binary(&["inspect-save", path_arg(&save_path)])?;
    let save: Value = serde_json::from_str(&stdout)?;
    assert_eq!(save["resume"]["room"], 2);
    assert_eq!(save["resume"]["entry_script"], 301);
    let globals = save["vars"]["globals"]
        .as_array()
        .context("globals should be an array")?;
    assert_eq!(globals[10], 42);
    assert_eq!(globals[11], 42);
    assert_eq!(globals[12], 0);
    assert_eq!(globals[20], 3);
    Ok(())
}

#[test]
fn missing_bundle_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let output = Command::new(env!("CARGO_BIN_EXE_scumm_engine"))
        .args(["run", "--bundle"])
        .arg(dir.path().join("absent.json"))
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to read script bundle"), "stderr: {stderr}");
    Ok(())
}
