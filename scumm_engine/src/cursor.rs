use crate::error::{Result, VmError};
use crate::program::{ProgramImage, ProgramKey, ProgramResolver};
use crate::vars::VariableRef;

/// Read position inside the active slot's program.
///
/// The cursor keeps its own handle on the program image and checks the
/// resolver's generation before every fetch; when the program was paged out
/// and back in, the image is re-resolved and the offset carried over. Object
/// code is re-keyed the same way when its object changes origin.
#[derive(Debug, Default)]
pub struct Cursor {
    key: Option<ProgramKey>,
    image: Option<ProgramImage>,
    pc: usize,
}

impl Cursor {
    pub fn attach(
        &mut self,
        key: ProgramKey,
        pc: usize,
        resolver: &mut dyn ProgramResolver,
    ) -> Result<()> {
        let key = relocated(key, resolver);
        let image = resolver.resolve(key).ok_or(VmError::ProgramMissing(key))?;
        self.key = Some(key);
        self.image = Some(image);
        self.pc = pc;
        Ok(())
    }

    pub fn detach(&mut self) {
        self.key = None;
        self.image = None;
        self.pc = 0;
    }

    pub fn key(&self) -> Option<ProgramKey> {
        self.key
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn seek(&mut self, pc: usize) {
        self.pc = pc;
    }

    /// Moves relative to the current position, as jump operands do.
    pub fn jump(&mut self, delta: i16) -> Result<()> {
        let key = self.key.ok_or(VmError::NoActiveScript)?;
        let target = self.pc as i64 + i64::from(delta);
        if target < 0 {
            return Err(VmError::ProgramCounterOutOfBounds {
                key,
                pc: 0,
                len: self.image.as_ref().map_or(0, |image| image.bytes.len()),
            });
        }
        self.pc = target as usize;
        Ok(())
    }

    fn refresh(&mut self, resolver: &mut dyn ProgramResolver) -> Result<(ProgramKey, &[u8])> {
        let previous = self.key.ok_or(VmError::NoActiveScript)?;
        let key = relocated(previous, resolver);
        let current = resolver.generation(key);
        let stale = match (&self.image, current) {
            (Some(image), Some(generation)) => key != previous || image.generation != generation,
            _ => true,
        };
        if stale {
            let image = resolver.resolve(key).ok_or(VmError::ProgramMissing(key))?;
            log::trace!("program {key} re-resolved at generation {}", image.generation);
            self.key = Some(key);
            self.image = Some(image);
        }
        let image = self.image.as_ref().ok_or(VmError::ProgramMissing(key))?;
        Ok((key, &image.bytes[..]))
    }

    pub fn fetch_byte(&mut self, resolver: &mut dyn ProgramResolver) -> Result<u8> {
        let pc = self.pc;
        let (key, bytes) = self.refresh(resolver)?;
        let byte = *bytes
            .get(pc)
            .ok_or(VmError::ProgramCounterOutOfBounds {
                key,
                pc,
                len: bytes.len(),
            })?;
        self.pc += 1;
        Ok(byte)
    }

    /// Little-endian 16-bit fetch.
    pub fn fetch_word(&mut self, resolver: &mut dyn ProgramResolver) -> Result<u16> {
        let low = self.fetch_byte(resolver)?;
        let high = self.fetch_byte(resolver)?;
        Ok(u16::from_le_bytes([low, high]))
    }

    pub fn fetch_signed_word(&mut self, resolver: &mut dyn ProgramResolver) -> Result<i16> {
        Ok(self.fetch_word(resolver)? as i16)
    }

    /// Fetches an operand address, plus its index word when indirect.
    pub fn fetch_var_ref(&mut self, resolver: &mut dyn ProgramResolver) -> Result<VariableRef> {
        let address = self.fetch_word(resolver)?;
        let index_word = if VariableRef::needs_index_word(address) {
            Some(self.fetch_word(resolver)?)
        } else {
            None
        };
        VariableRef::decode(address, index_word)
    }
}

/// Object code lives wherever its object is now.
fn relocated(key: ProgramKey, resolver: &dyn ProgramResolver) -> ProgramKey {
    if key.origin.is_script() {
        return key;
    }
    match resolver.object_origin(key.number) {
        Some(origin) => ProgramKey::new(key.number, origin),
        None => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgramArena;
    use crate::slots::Origin;
    use crate::vars::IndexSource;

    fn arena_with(bytes: Vec<u8>) -> (ProgramArena, ProgramKey) {
        let mut arena = ProgramArena::new();
        let key = ProgramKey::new(1, Origin::Global);
        arena.insert(key, bytes);
        (arena, key)
    }

    #[test]
    fn words_are_little_endian_and_signed_on_request() {
        let (mut arena, key) = arena_with(vec![0x34, 0x12, 0xFE, 0xFF, 0x07]);
        let mut cursor = Cursor::default();
        cursor.attach(key, 0, &mut arena).unwrap();
        assert_eq!(cursor.fetch_word(&mut arena).unwrap(), 0x1234);
        assert_eq!(cursor.fetch_signed_word(&mut arena).unwrap(), -2);
        assert_eq!(cursor.fetch_byte(&mut arena).unwrap(), 7);
        assert!(matches!(
            cursor.fetch_byte(&mut arena),
            Err(VmError::ProgramCounterOutOfBounds { pc: 5, len: 5, .. })
        ));
    }

    #[test]
    fn paged_out_program_is_reresolved_transparently() {
        let (mut arena, key) = arena_with(vec![10, 11, 12, 13]);
        let mut cursor = Cursor::default();
        cursor.attach(key, 1, &mut arena).unwrap();
        assert_eq!(cursor.fetch_byte(&mut arena).unwrap(), 11);

        arena.page_out(key);
        assert_eq!(cursor.fetch_byte(&mut arena).unwrap(), 12);
        assert!(arena.is_resident(key));
        assert_eq!(cursor.pc(), 3);
    }

    #[test]
    fn var_ref_fetches_index_word_only_when_indirect() {
        let (mut arena, key) = arena_with(vec![0x05, 0x00, 0x0A, 0x20, 0x03, 0x00]);
        let mut cursor = Cursor::default();
        cursor.attach(key, 0, &mut arena).unwrap();
        assert_eq!(
            cursor.fetch_var_ref(&mut arena).unwrap(),
            VariableRef::Global(5)
        );
        assert_eq!(
            cursor.fetch_var_ref(&mut arena).unwrap(),
            VariableRef::Indirect {
                base: Box::new(VariableRef::Global(10)),
                offset: IndexSource::Constant(3),
            }
        );
        assert_eq!(cursor.pc(), 6);
    }

    #[test]
    fn moved_object_code_is_rekeyed_mid_run() {
        let mut arena = ProgramArena::new();
        arena.insert_object(40, Origin::Room, vec![1, 2, 3], [(0, 0)]);
        let mut cursor = Cursor::default();
        cursor
            .attach(ProgramKey::new(40, Origin::Room), 0, &mut arena)
            .unwrap();
        assert_eq!(cursor.fetch_byte(&mut arena).unwrap(), 1);

        assert!(arena.move_object(40, Origin::Inventory));
        assert_eq!(cursor.fetch_byte(&mut arena).unwrap(), 2);
        assert_eq!(
            cursor.key(),
            Some(ProgramKey::new(40, Origin::Inventory))
        );

        // Attaching under the stale origin lands on the new one too.
        cursor
            .attach(ProgramKey::new(40, Origin::Room), 2, &mut arena)
            .unwrap();
        assert_eq!(cursor.key().map(|key| key.origin), Some(Origin::Inventory));
        assert_eq!(cursor.fetch_byte(&mut arena).unwrap(), 3);
    }

    #[test]
    fn detached_cursor_has_nothing_to_fetch() {
        let (mut arena, _) = arena_with(vec![0]);
        let mut cursor = Cursor::default();
        assert!(matches!(
            cursor.fetch_byte(&mut arena),
            Err(VmError::NoActiveScript)
        ));
    }
}
