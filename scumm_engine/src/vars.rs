use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, VmError};

const BIT_TAG: u16 = 0x8000;
const LOCAL_TAG: u16 = 0x4000;
const INDIRECT_TAG: u16 = 0x2000;
const CLASS_MASK: u16 = 0xF000;

/// One operand address, decoded once at fetch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableRef {
    Global(u16),
    Bit(u16),
    Local(u16),
    /// `base` shifted by `offset` before the final lookup.
    Indirect {
        base: Box<VariableRef>,
        offset: IndexSource,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSource {
    Constant(u16),
    Variable(Box<VariableRef>),
}

impl VariableRef {
    /// True when `address` carries the indirect tag, meaning one more word
    /// follows it in the byte stream.
    pub fn needs_index_word(address: u16) -> bool {
        address & INDIRECT_TAG != 0
    }

    /// Decodes a raw operand address. `index_word` must be supplied exactly
    /// when [`VariableRef::needs_index_word`] is true.
    pub fn decode(address: u16, index_word: Option<u16>) -> Result<Self> {
        if !Self::needs_index_word(address) {
            return Self::decode_direct(address);
        }
        let word = index_word.ok_or(VmError::IllegalVariable(address))?;
        let offset = if word & INDIRECT_TAG != 0 {
            IndexSource::Variable(Box::new(Self::decode_direct(word & !INDIRECT_TAG)?))
        } else {
            IndexSource::Constant(word & 0x0FFF)
        };
        Ok(VariableRef::Indirect {
            base: Box::new(Self::decode_direct(address & !INDIRECT_TAG)?),
            offset,
        })
    }

    fn decode_direct(address: u16) -> Result<Self> {
        if address & BIT_TAG != 0 {
            Ok(VariableRef::Bit(address & 0x7FFF))
        } else if address & LOCAL_TAG != 0 {
            Ok(VariableRef::Local(address & 0x0FFF))
        } else if address & CLASS_MASK == 0 {
            Ok(VariableRef::Global(address))
        } else {
            Err(VmError::IllegalVariable(address))
        }
    }

    /// Raw address for a direct reference, the inverse of `decode`.
    pub fn address(&self) -> Option<u16> {
        match *self {
            VariableRef::Global(index) => Some(index),
            VariableRef::Bit(index) => Some(index | BIT_TAG),
            VariableRef::Local(index) => Some(index | LOCAL_TAG),
            VariableRef::Indirect { .. } => None,
        }
    }

    fn with_index(&self, index: u16) -> Self {
        match self {
            VariableRef::Global(_) => VariableRef::Global(index),
            VariableRef::Bit(_) => VariableRef::Bit(index),
            VariableRef::Local(_) => VariableRef::Local(index),
            VariableRef::Indirect { .. } => self.clone(),
        }
    }

    fn index(&self) -> u16 {
        match *self {
            VariableRef::Global(index) | VariableRef::Bit(index) | VariableRef::Local(index) => {
                index
            }
            VariableRef::Indirect { .. } => 0,
        }
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableRef::Global(index) => write!(f, "var{index}"),
            VariableRef::Bit(index) => write!(f, "bit{index}"),
            VariableRef::Local(index) => write!(f, "local{index}"),
            VariableRef::Indirect { base, offset } => match offset {
                IndexSource::Constant(value) => write!(f, "{base}[{value}]"),
                IndexSource::Variable(var) => write!(f, "{base}[{var}]"),
            },
        }
    }
}

/// Called after a global write lands; may rewrite derived globals.
pub type WriteHook = Box<dyn FnMut(u16, i16, &mut [i16])>;

/// Global words, packed bit flags, and the global write hooks.
///
/// Locals live in their owning slot and are passed in by the caller.
pub struct VariableStore {
    globals: Vec<i16>,
    bits: Vec<u16>,
    num_bits: usize,
    hooks: BTreeMap<u16, WriteHook>,
}

impl fmt::Debug for VariableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableStore")
            .field("globals", &self.globals.len())
            .field("bits", &self.num_bits)
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl VariableStore {
    pub fn new(num_globals: usize, num_bits: usize) -> Self {
        VariableStore {
            globals: vec![0; num_globals],
            bits: vec![0; num_bits.div_ceil(16)],
            num_bits,
            hooks: BTreeMap::new(),
        }
    }

    /// Registers `hook` for writes to global `index`, replacing any previous one.
    pub fn watch(&mut self, index: u16, hook: WriteHook) {
        self.hooks.insert(index, hook);
    }

    pub fn unwatch(&mut self, index: u16) {
        self.hooks.remove(&index);
    }

    /// Collapses an indirect reference into the direct one it designates.
    pub fn resolve(&self, var: &VariableRef, locals: Option<&[i16]>) -> Result<VariableRef> {
        let VariableRef::Indirect { base, offset } = var else {
            return Ok(var.clone());
        };
        if matches!(**base, VariableRef::Indirect { .. }) {
            return Err(VmError::IllegalVariable(INDIRECT_TAG));
        }
        let delta = match offset {
            IndexSource::Constant(value) => i32::from(*value),
            IndexSource::Variable(inner) => {
                if matches!(**inner, VariableRef::Indirect { .. }) {
                    return Err(VmError::IllegalVariable(INDIRECT_TAG));
                }
                i32::from(self.read(inner, locals)?)
            }
        };
        let index = i32::from(base.index()) + delta;
        let index = u16::try_from(index).map_err(|_| VmError::VariableOutOfRange {
            class: class_name(base),
            index: index.max(0) as usize,
            limit: self.limit_for(base, locals),
        })?;
        Ok(base.with_index(index))
    }

    pub fn read(&self, var: &VariableRef, locals: Option<&[i16]>) -> Result<i16> {
        match self.resolve(var, locals)? {
            VariableRef::Global(index) => self.global(index),
            VariableRef::Bit(index) => self.bit(index).map(i16::from),
            VariableRef::Local(index) => {
                let locals = locals.ok_or(VmError::NoActiveScript)?;
                locals
                    .get(index as usize)
                    .copied()
                    .ok_or(VmError::VariableOutOfRange {
                        class: "local",
                        index: index as usize,
                        limit: locals.len(),
                    })
            }
            VariableRef::Indirect { .. } => Err(VmError::IllegalVariable(INDIRECT_TAG)),
        }
    }

    pub fn write(
        &mut self,
        var: &VariableRef,
        value: i16,
        locals: Option<&mut [i16]>,
    ) -> Result<()> {
        let resolved = self.resolve(var, locals.as_deref())?;
        match resolved {
            VariableRef::Global(index) => self.set_global(index, value),
            VariableRef::Bit(index) => self.set_bit(index, value != 0),
            VariableRef::Local(index) => {
                let locals = locals.ok_or(VmError::NoActiveScript)?;
                let limit = locals.len();
                let slot = locals
                    .get_mut(index as usize)
                    .ok_or(VmError::VariableOutOfRange {
                        class: "local",
                        index: index as usize,
                        limit,
                    })?;
                *slot = value;
                Ok(())
            }
            VariableRef::Indirect { .. } => Err(VmError::IllegalVariable(INDIRECT_TAG)),
        }
    }

    pub fn global(&self, index: u16) -> Result<i16> {
        self.globals
            .get(index as usize)
            .copied()
            .ok_or(VmError::VariableOutOfRange {
                class: "global",
                index: index as usize,
                limit: self.globals.len(),
            })
    }

    pub fn set_global(&mut self, index: u16, value: i16) -> Result<()> {
        let limit = self.globals.len();
        let slot = self
            .globals
            .get_mut(index as usize)
            .ok_or(VmError::VariableOutOfRange {
                class: "global",
                index: index as usize,
                limit,
            })?;
        *slot = value;
        if let Some(hook) = self.hooks.get_mut(&index) {
            hook(index, value, &mut self.globals);
        }
        Ok(())
    }

    pub fn bit(&self, index: u16) -> Result<bool> {
        self.check_bit(index)?;
        let word = self.bits[(index >> 4) as usize];
        Ok(word & (1 << (index & 15)) != 0)
    }

    pub fn set_bit(&mut self, index: u16, value: bool) -> Result<()> {
        self.check_bit(index)?;
        let word = &mut self.bits[(index >> 4) as usize];
        let mask = 1 << (index & 15);
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
        Ok(())
    }

    fn check_bit(&self, index: u16) -> Result<()> {
        if (index as usize) < self.num_bits {
            Ok(())
        } else {
            Err(VmError::VariableOutOfRange {
                class: "bit",
                index: index as usize,
                limit: self.num_bits,
            })
        }
    }

    fn limit_for(&self, var: &VariableRef, locals: Option<&[i16]>) -> usize {
        match var {
            VariableRef::Global(_) => self.globals.len(),
            VariableRef::Bit(_) => self.num_bits,
            VariableRef::Local(_) => locals.map_or(0, <[i16]>::len),
            VariableRef::Indirect { .. } => 0,
        }
    }

    pub fn globals(&self) -> &[i16] {
        &self.globals
    }

    pub fn bit_words(&self) -> &[u16] {
        &self.bits
    }

    /// Replaces the stored words wholesale. Shorter dumps are zero-filled;
    /// dumps larger than the configured tables are rejected.
    pub fn restore(&mut self, globals: &[i16], bits: &[u16]) -> Result<()> {
        if globals.len() > self.globals.len() {
            return Err(VmError::VariableOutOfRange {
                class: "global",
                index: globals.len() - 1,
                limit: self.globals.len(),
            });
        }
        if bits.len() > self.bits.len() {
            return Err(VmError::VariableOutOfRange {
                class: "bit",
                index: bits.len() * 16 - 1,
                limit: self.num_bits,
            });
        }
        self.globals.fill(0);
        self.globals[..globals.len()].copy_from_slice(globals);
        self.bits.fill(0);
        self.bits[..bits.len()].copy_from_slice(bits);
        Ok(())
    }
}

fn class_name(var: &VariableRef) -> &'static str {
    match var {
        VariableRef::Global(_) => "global",
        VariableRef::Bit(_) => "bit",
        VariableRef::Local(_) => "local",
        VariableRef::Indirect { .. } => "indirect",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_each_class() {
        assert_eq!(VariableRef::decode(10, None).unwrap(), VariableRef::Global(10));
        assert_eq!(
            VariableRef::decode(0x8000 | 35, None).unwrap(),
            VariableRef::Bit(35)
        );
        assert_eq!(
            VariableRef::decode(0x4000 | 3, None).unwrap(),
            VariableRef::Local(3)
        );
        assert_eq!(
            VariableRef::decode(0x2000 | 100, Some(4)).unwrap(),
            VariableRef::Indirect {
                base: Box::new(VariableRef::Global(100)),
                offset: IndexSource::Constant(4),
            }
        );
        assert_eq!(
            VariableRef::decode(0x2000 | 100, Some(0x2000 | 7)).unwrap(),
            VariableRef::Indirect {
                base: Box::new(VariableRef::Global(100)),
                offset: IndexSource::Variable(Box::new(VariableRef::Global(7))),
            }
        );
        assert!(matches!(
            VariableRef::decode(0x1000, None),
            Err(VmError::IllegalVariable(0x1000))
        ));
    }

    #[test]
    fn indirect_resolves_one_level() {
        let mut store = VariableStore::new(64, 32);
        store.set_global(7, 5).unwrap();
        store.set_global(25, 99).unwrap();
        let var = VariableRef::decode(0x2000 | 20, Some(0x2000 | 7)).unwrap();
        assert_eq!(store.resolve(&var, None).unwrap(), VariableRef::Global(25));
        assert_eq!(store.read(&var, None).unwrap(), 99);

        let constant = VariableRef::decode(0x2000 | 20, Some(2)).unwrap();
        store.write(&constant, -3, None).unwrap();
        assert_eq!(store.global(22).unwrap(), -3);
    }

    #[test]
    fn bits_pack_sixteen_per_word() {
        let mut store = VariableStore::new(4, 40);
        assert_eq!(store.bit_words().len(), 3);
        store.set_bit(0, true).unwrap();
        store.set_bit(17, true).unwrap();
        store
            .write(&VariableRef::Bit(39), 12, None)
            .unwrap();
        assert_eq!(store.bit_words(), &[0x0001, 0x0002, 0x0080]);
        assert_eq!(store.read(&VariableRef::Bit(39), None).unwrap(), 1);
        store.set_bit(17, false).unwrap();
        assert!(!store.bit(17).unwrap());
    }

    #[test]
    fn out_of_range_is_fatal_not_clamped() {
        let mut store = VariableStore::new(8, 8);
        assert!(matches!(
            store.read(&VariableRef::Global(8), None),
            Err(VmError::VariableOutOfRange { class: "global", index: 8, limit: 8 })
        ));
        assert!(store.set_bit(8, true).is_err());
        let mut locals = [0i16; 2];
        assert!(store
            .write(&VariableRef::Local(2), 1, Some(&mut locals))
            .is_err());
        let var = VariableRef::decode(0x2000 | 6, Some(5)).unwrap();
        assert!(store.read(&var, None).is_err());
    }

    #[test]
    fn locals_need_an_active_block() {
        let store = VariableStore::new(8, 8);
        assert!(matches!(
            store.read(&VariableRef::Local(0), None),
            Err(VmError::NoActiveScript)
        ));
        let locals = [4i16, 9];
        assert_eq!(store.read(&VariableRef::Local(1), Some(&locals)).unwrap(), 9);
    }

    #[test]
    fn write_hook_derives_dependent_global() {
        let mut store = VariableStore::new(16, 0);
        store.watch(
            3,
            Box::new(|_, value, globals: &mut [i16]| {
                globals[4] = value * 2;
            }),
        );
        store.set_global(3, 21).unwrap();
        assert_eq!(store.global(4).unwrap(), 42);
        store.unwatch(3);
        store.set_global(3, 1).unwrap();
        assert_eq!(store.global(4).unwrap(), 42);
    }

    #[test]
    fn restore_zero_fills_short_dumps() {
        let mut store = VariableStore::new(4, 32);
        store.set_global(3, 8).unwrap();
        store.restore(&[1, 2], &[0xFFFF]).unwrap();
        assert_eq!(store.globals(), &[1, 2, 0, 0]);
        assert_eq!(store.bit_words(), &[0xFFFF, 0]);
        assert!(store.restore(&[0; 5], &[]).is_err());
    }
}
