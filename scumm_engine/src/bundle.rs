use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::program::{ProgramArena, ProgramKey};
use crate::slots::Origin;

/// A script bundle: every program the host binary needs to run a session,
/// with bytecode written as hex.
///
/// ```json
/// {
///   "room": 1,
///   "rooms": { "1": 300, "2": 301 },
///   "global_scripts": [{ "number": 5, "code": "03 0a00 2a00 01 00" }],
///   "local_scripts": [{ "number": 300, "code": "01 00" }],
///   "objects": [{ "number": 40, "origin": "room", "code": "00", "verbs": { "255": 0 } }],
///   "variables": { "10": 1 }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptBundle {
    /// Room entered at startup.
    pub room: u16,
    /// Entry script per room.
    pub rooms: BTreeMap<u16, u16>,
    pub global_scripts: Vec<ScriptEntry>,
    pub local_scripts: Vec<ScriptEntry>,
    pub objects: Vec<ObjectEntry>,
    /// Initial values of global variables.
    pub variables: BTreeMap<u16, i16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub number: u16,
    pub code: String,
    #[serde(default)]
    pub entry: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub number: u16,
    pub origin: Origin,
    pub code: String,
    #[serde(default)]
    pub verbs: BTreeMap<u16, usize>,
}

impl ScriptBundle {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read script bundle: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse script bundle json: {}", path.display()))
    }

    pub fn entry_script(&self, room: u16) -> Option<u16> {
        self.rooms.get(&room).copied()
    }

    /// Decodes every program into a fresh arena.
    pub fn to_arena(&self) -> Result<ProgramArena> {
        let mut arena = ProgramArena::new();
        for (origin, scripts) in [
            (Origin::Global, &self.global_scripts),
            (Origin::Local, &self.local_scripts),
        ] {
            for script in scripts {
                let code = decode_hex(&script.code).with_context(|| {
                    format!("decoding {} script {}", origin.as_str(), script.number)
                })?;
                ensure!(
                    script.entry < code.len(),
                    "{} script {} entry {} is past its {} bytes",
                    origin.as_str(),
                    script.number,
                    script.entry,
                    code.len()
                );
                arena.insert_at(ProgramKey::new(script.number, origin), code, script.entry);
            }
        }
        for object in &self.objects {
            ensure!(
                object.origin.is_object(),
                "object {} cannot live in {} origin",
                object.number,
                object.origin.as_str()
            );
            let code = decode_hex(&object.code)
                .with_context(|| format!("decoding object {}", object.number))?;
            arena.insert_object(
                object.number,
                object.origin,
                code,
                object.verbs.iter().map(|(&verb, &entry)| (verb, entry)),
            );
        }
        Ok(arena)
    }
}

/// Hex digits with optional whitespace between bytes.
pub fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits ({})", digits.len());
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair: String = pair.iter().collect();
            u8::from_str_radix(&pair, 16).with_context(|| format!("invalid hex byte {pair:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgramResolver;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn hex_tolerates_spacing_and_rejects_garbage() {
        assert_eq!(decode_hex("03 0a00\n2A00").unwrap(), vec![3, 10, 0, 42, 0]);
        assert!(decode_hex("0").is_err());
        assert!(decode_hex("zz").is_err());
    }

    #[test]
    fn bundle_populates_arena() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "room": 2,
                "rooms": {{"2": 300}},
                "global_scripts": [{{"number": 5, "code": "0100"}}],
                "local_scripts": [{{"number": 300, "code": "01 01 00", "entry": 1}}],
                "objects": [{{"number": 40, "origin": "inventory", "code": "00", "verbs": {{"3": 0}}}}],
                "variables": {{"10": -4}}
            }}"#
        )
        .unwrap();

        let bundle = ScriptBundle::load(file.path()).unwrap();
        assert_eq!(bundle.entry_script(2), Some(300));
        assert_eq!(bundle.variables.get(&10), Some(&-4));

        let mut arena = bundle.to_arena().unwrap();
        let local = ProgramKey::new(300, Origin::Local);
        assert_eq!(arena.entry_point(local), Some(1));
        assert_eq!(&*arena.resolve(local).unwrap().bytes, &[1, 1, 0]);
        assert_eq!(arena.object_origin(40), Some(Origin::Inventory));
        assert_eq!(arena.verb_entry_point(40, 3), Some(0));
    }

    #[test]
    fn object_in_script_origin_is_rejected() {
        let bundle = ScriptBundle {
            objects: vec![ObjectEntry {
                number: 1,
                origin: Origin::Global,
                code: "00".into(),
                verbs: BTreeMap::new(),
            }],
            ..ScriptBundle::default()
        };
        assert!(bundle.to_arena().is_err());
    }
}
