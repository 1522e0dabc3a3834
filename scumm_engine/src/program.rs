use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::slots::Origin;

/// Identifies one owning program: a script number or object number together
/// with where it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramKey {
    pub number: u16,
    pub origin: Origin,
}

impl ProgramKey {
    pub fn new(number: u16, origin: Origin) -> Self {
        ProgramKey { number, origin }
    }
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.origin.as_str(), self.number)
    }
}

/// A loaded program buffer. `generation` changes every time the owner pages
/// the buffer back in, so a holder can tell its copy is stale.
#[derive(Debug, Clone)]
pub struct ProgramImage {
    pub bytes: Rc<[u8]>,
    pub generation: u64,
}

/// Boundary to the resource manager that owns compiled scripts.
pub trait ProgramResolver {
    /// Returns the current image for `key`, paging it in if needed.
    fn resolve(&mut self, key: ProgramKey) -> Option<ProgramImage>;

    /// Generation of the resident image, `None` when paged out or unknown.
    fn generation(&self, key: ProgramKey) -> Option<u64>;

    /// Offset at which a script starts executing.
    fn entry_point(&self, key: ProgramKey) -> Option<usize> {
        let _ = key;
        Some(0)
    }

    /// Where an object currently lives, `None` when it does not exist here.
    fn object_origin(&self, object: u16) -> Option<Origin>;

    /// Offset of the handler `object` declares for `verb`.
    fn verb_entry_point(&self, object: u16, verb: u16) -> Option<usize>;
}

/// Verb entry matched when an object has no handler for the requested verb.
pub const DEFAULT_VERB: u16 = 0xFF;

#[derive(Debug)]
struct ArenaEntry {
    bytes: Rc<[u8]>,
    generation: u64,
    resident: bool,
    entry: usize,
}

#[derive(Debug)]
struct ObjectEntry {
    origin: Origin,
    verbs: BTreeMap<u16, usize>,
}

/// In-memory resolver holding every program in one arena.
#[derive(Debug, Default)]
pub struct ProgramArena {
    programs: BTreeMap<ProgramKey, ArenaEntry>,
    objects: BTreeMap<u16, ObjectEntry>,
    next_generation: u64,
}

impl ProgramArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Registers (or replaces) a script program that starts at offset 0.
    pub fn insert(&mut self, key: ProgramKey, bytes: impl Into<Vec<u8>>) {
        self.insert_at(key, bytes, 0);
    }

    pub fn insert_at(&mut self, key: ProgramKey, bytes: impl Into<Vec<u8>>, entry: usize) {
        let generation = self.bump();
        let bytes: Vec<u8> = bytes.into();
        self.programs.insert(
            key,
            ArenaEntry {
                bytes: Rc::from(bytes),
                generation,
                resident: true,
                entry,
            },
        );
    }

    /// Registers an object's code together with its verb table.
    pub fn insert_object<V>(&mut self, object: u16, origin: Origin, code: impl Into<Vec<u8>>, verbs: V)
    where
        V: IntoIterator<Item = (u16, usize)>,
    {
        if let Some(previous) = self.objects.remove(&object) {
            self.programs.remove(&ProgramKey::new(object, previous.origin));
        }
        self.insert(ProgramKey::new(object, origin), code);
        self.objects.insert(
            object,
            ObjectEntry {
                origin,
                verbs: verbs.into_iter().collect(),
            },
        );
    }

    /// Moves an object, e.g. from the room into the inventory. Returns false
    /// when the object is unknown.
    pub fn move_object(&mut self, object: u16, origin: Origin) -> bool {
        let Some(entry) = self.objects.get_mut(&object) else {
            return false;
        };
        let previous = std::mem::replace(&mut entry.origin, origin);
        if let Some(program) = self.programs.remove(&ProgramKey::new(object, previous)) {
            self.programs.insert(ProgramKey::new(object, origin), program);
        }
        true
    }

    /// Evicts a program. The bytes stay known so a later `resolve` pages them
    /// back in under a new generation.
    pub fn page_out(&mut self, key: ProgramKey) -> bool {
        match self.programs.get_mut(&key) {
            Some(entry) => {
                entry.resident = false;
                true
            }
            None => false,
        }
    }

    pub fn is_resident(&self, key: ProgramKey) -> bool {
        self.programs.get(&key).is_some_and(|entry| entry.resident)
    }

    pub fn remove(&mut self, key: ProgramKey) -> bool {
        if key.origin.is_object() {
            self.objects.remove(&key.number);
        }
        self.programs.remove(&key).is_some()
    }
}

impl ProgramResolver for ProgramArena {
    fn resolve(&mut self, key: ProgramKey) -> Option<ProgramImage> {
        let needs_load = !self.programs.get(&key)?.resident;
        if needs_load {
            let generation = self.bump();
            let entry = self.programs.get_mut(&key)?;
            // Copy into a fresh buffer so the relocation is observable.
            entry.bytes = Rc::from(entry.bytes.to_vec());
            entry.generation = generation;
            entry.resident = true;
        }
        let entry = self.programs.get(&key)?;
        Some(ProgramImage {
            bytes: Rc::clone(&entry.bytes),
            generation: entry.generation,
        })
    }

    fn generation(&self, key: ProgramKey) -> Option<u64> {
        self.programs
            .get(&key)
            .filter(|entry| entry.resident)
            .map(|entry| entry.generation)
    }

    fn entry_point(&self, key: ProgramKey) -> Option<usize> {
        self.programs.get(&key).map(|entry| entry.entry)
    }

    fn object_origin(&self, object: u16) -> Option<Origin> {
        self.objects.get(&object).map(|entry| entry.origin)
    }

    fn verb_entry_point(&self, object: u16, verb: u16) -> Option<usize> {
        let entry = self.objects.get(&object)?;
        entry
            .verbs
            .get(&verb)
            .or_else(|| entry.verbs.get(&DEFAULT_VERB))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_in_bumps_generation() {
        let mut arena = ProgramArena::new();
        let key = ProgramKey::new(5, Origin::Global);
        arena.insert(key, vec![1, 2, 3]);
        let first = arena.resolve(key).unwrap();
        assert_eq!(arena.generation(key), Some(first.generation));

        assert!(arena.page_out(key));
        assert_eq!(arena.generation(key), None);
        let second = arena.resolve(key).unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(&*second.bytes, &[1, 2, 3]);
        assert!(!Rc::ptr_eq(&first.bytes, &second.bytes));
    }

    #[test]
    fn verb_lookup_falls_back_to_default_entry() {
        let mut arena = ProgramArena::new();
        arena.insert_object(40, Origin::Room, vec![0; 16], [(3, 4), (DEFAULT_VERB, 10)]);
        assert_eq!(arena.object_origin(40), Some(Origin::Room));
        assert_eq!(arena.verb_entry_point(40, 3), Some(4));
        assert_eq!(arena.verb_entry_point(40, 9), Some(10));
        assert_eq!(arena.verb_entry_point(41, 3), None);
    }

    #[test]
    fn moving_an_object_rekeys_its_code() {
        let mut arena = ProgramArena::new();
        arena.insert_object(40, Origin::Room, vec![7], [(1, 0)]);
        assert!(arena.move_object(40, Origin::Inventory));
        assert!(arena.resolve(ProgramKey::new(40, Origin::Room)).is_none());
        let image = arena.resolve(ProgramKey::new(40, Origin::Inventory)).unwrap();
        assert_eq!(&*image.bytes, &[7]);
        assert!(!arena.move_object(41, Origin::Inventory));
    }
}
