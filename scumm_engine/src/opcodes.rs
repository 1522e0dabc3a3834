//! A minimal opcode set covering the scheduler's own directives, enough to
//! drive the VM from hand-assembled programs and script bundles.
//!
//! Operand layout: bytes and words are little-endian, variable operands are
//! one address word (two when indirect).

use crate::dispatch::{OpcodeDispatcher, Step};
use crate::error::{Result, VmError};
use crate::vars::{IndexSource, VariableRef};
use crate::vm::Vm;

pub mod op {
    pub const STOP_OBJECT_CODE: u8 = 0x00;
    pub const BREAK_HERE: u8 = 0x01;
    pub const DELAY: u8 = 0x02;
    pub const SET_VAR: u8 = 0x03;
    pub const COPY_VAR: u8 = 0x04;
    pub const ADD_VAR: u8 = 0x05;
    pub const JUMP: u8 = 0x06;
    pub const JUMP_IF_ZERO: u8 = 0x07;
    pub const START_SCRIPT: u8 = 0x08;
    pub const STOP_SCRIPT: u8 = 0x09;
    pub const CUTSCENE: u8 = 0x0A;
    pub const END_CUTSCENE: u8 = 0x0B;
    pub const BEGIN_OVERRIDE: u8 = 0x0C;
    pub const END_OVERRIDE: u8 = 0x0D;
    pub const FREEZE_SCRIPTS: u8 = 0x0E;
    pub const DO_SENTENCE: u8 = 0x0F;
    pub const LOAD_ROOM: u8 = 0x10;
    pub const START_OBJECT: u8 = 0x11;
    pub const WAIT_FOR_VAR: u8 = 0x12;
}

/// `start_script` flag bits.
pub const FLAG_FREEZE_RESISTANT: u8 = 0x01;
pub const FLAG_RECURSIVE: u8 = 0x02;

/// `freeze_scripts` operands at or above this also freeze resistant slots.
pub const FREEZE_OVERRIDE_RESISTANCE: u8 = 0x80;

const INDIRECT_TAG: u16 = 0x2000;

/// Dispatcher for the core opcode set.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreOpcodes;

impl CoreOpcodes {
    fn fetch_args(vm: &mut Vm) -> Result<Vec<i16>> {
        let count = vm.fetch_byte()?;
        let mut args = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let var = vm.fetch_var_ref()?;
            args.push(vm.read_var(&var)?);
        }
        Ok(args)
    }

    fn stop_self(vm: &mut Vm) -> Result<()> {
        let Some(slot) = vm.active_slot().and_then(|id| vm.slot(id)) else {
            return Err(VmError::NoActiveScript);
        };
        let (number, origin) = (slot.number, slot.origin);
        if origin.is_script() {
            vm.stop_script(number)
        } else {
            vm.stop_object_script(number)
        }
    }
}

impl OpcodeDispatcher for CoreOpcodes {
    fn dispatch(&mut self, vm: &mut Vm, opcode: u8) -> Result<Step> {
        match opcode {
            op::STOP_OBJECT_CODE => return Ok(Step::Terminate),
            op::BREAK_HERE => return Ok(Step::Yield),
            op::DELAY => {
                let ticks = vm.fetch_word()?;
                return Ok(Step::Delay(i32::from(ticks)));
            }
            op::SET_VAR => {
                let var = vm.fetch_var_ref()?;
                let value = vm.fetch_signed_word()?;
                vm.write_var(&var, value)?;
            }
            op::COPY_VAR => {
                let dst = vm.fetch_var_ref()?;
                let src = vm.fetch_var_ref()?;
                let value = vm.read_var(&src)?;
                vm.write_var(&dst, value)?;
            }
            op::ADD_VAR => {
                let var = vm.fetch_var_ref()?;
                let delta = vm.fetch_signed_word()?;
                let value = vm.read_var(&var)?;
                vm.write_var(&var, value.wrapping_add(delta))?;
            }
            op::JUMP => {
                let delta = vm.fetch_signed_word()?;
                vm.jump(delta)?;
            }
            op::JUMP_IF_ZERO => {
                let var = vm.fetch_var_ref()?;
                let delta = vm.fetch_signed_word()?;
                if vm.read_var(&var)? == 0 {
                    vm.jump(delta)?;
                }
            }
            op::START_SCRIPT => {
                let script = vm.fetch_byte()?;
                let flags = vm.fetch_byte()?;
                let locals = Self::fetch_args(vm)?;
                vm.run_script(
                    self,
                    u16::from(script),
                    flags & FLAG_FREEZE_RESISTANT != 0,
                    flags & FLAG_RECURSIVE != 0,
                    &locals,
                )?;
            }
            op::STOP_SCRIPT => match vm.fetch_byte()? {
                0 => Self::stop_self(vm)?,
                script => vm.stop_script(u16::from(script))?,
            },
            op::CUTSCENE => {
                let args = Self::fetch_args(vm)?;
                vm.begin_cutscene(self, &args)?;
            }
            op::END_CUTSCENE => vm.end_cutscene(self)?,
            op::BEGIN_OVERRIDE => vm.begin_override()?,
            op::END_OVERRIDE => vm.end_override()?,
            op::FREEZE_SCRIPTS => match vm.fetch_byte()? {
                0 => vm.unfreeze_all(),
                flag => vm.freeze_all(flag >= FREEZE_OVERRIDE_RESISTANCE),
            },
            op::DO_SENTENCE => {
                let verb = vm.fetch_byte()?;
                let a = vm.fetch_var_ref()?;
                let b = vm.fetch_var_ref()?;
                let (a, b) = (vm.read_var(&a)?, vm.read_var(&b)?);
                vm.enqueue_sentence(u16::from(verb), a as u16, b as u16)?;
            }
            op::LOAD_ROOM => {
                let room = vm.fetch_byte()?;
                vm.request_scene_change(u16::from(room));
                return Ok(Step::Yield);
            }
            op::START_OBJECT => {
                let object = vm.fetch_var_ref()?;
                let object = vm.read_var(&object)?;
                let verb = vm.fetch_byte()?;
                let locals = Self::fetch_args(vm)?;
                vm.run_object_script(self, object as u16, u16::from(verb), false, false, &locals)?;
            }
            op::WAIT_FOR_VAR => {
                let start = vm.pc().saturating_sub(1);
                let var = vm.fetch_var_ref()?;
                let expected = vm.fetch_signed_word()?;
                if vm.read_var(&var)? != expected {
                    vm.seek(start);
                    return Ok(Step::Yield);
                }
            }
            other => {
                let key = vm.current_program().ok_or(VmError::NoActiveScript)?;
                return Err(VmError::UnknownOpcode {
                    opcode: other,
                    key,
                    pc: vm.pc().saturating_sub(1),
                });
            }
        }
        Ok(Step::Continue)
    }
}

/// Forward jump whose offset is filled in by [`Assembler::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    operand: usize,
}

/// Builds core-opcode programs.
///
/// ```
/// use scumm_engine::opcodes::Assembler;
/// use scumm_engine::VariableRef;
///
/// let bytes = Assembler::new()
///     .set_var(&VariableRef::Global(10), 42)
///     .break_here()
///     .stop()
///     .to_bytes();
/// assert_eq!(bytes, vec![0x03, 10, 0, 42, 0, 0x01, 0x00]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct Assembler {
    bytes: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pc(&self) -> usize {
        self.bytes.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn byte(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    pub fn word(&mut self, value: u16) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Encodes an operand address. Only one level of indirection is
    /// representable; a nested base is written as global 0.
    pub fn var(&mut self, var: &VariableRef) -> &mut Self {
        match var {
            VariableRef::Indirect { base, offset } => {
                let base = base.address().unwrap_or_default() | INDIRECT_TAG;
                let index = match offset {
                    IndexSource::Constant(value) => value & 0x0FFF,
                    IndexSource::Variable(var) => var.address().unwrap_or_default() | INDIRECT_TAG,
                };
                self.word(base).word(index)
            }
            direct => self.word(direct.address().unwrap_or_default()),
        }
    }

    fn args(&mut self, args: &[VariableRef]) -> &mut Self {
        self.byte(args.len() as u8);
        for arg in args {
            self.var(arg);
        }
        self
    }

    pub fn stop(&mut self) -> &mut Self {
        self.byte(op::STOP_OBJECT_CODE)
    }

    pub fn break_here(&mut self) -> &mut Self {
        self.byte(op::BREAK_HERE)
    }

    pub fn delay(&mut self, ticks: u16) -> &mut Self {
        self.byte(op::DELAY).word(ticks)
    }

    pub fn set_var(&mut self, var: &VariableRef, value: i16) -> &mut Self {
        self.byte(op::SET_VAR).var(var).word(value as u16)
    }

    pub fn copy_var(&mut self, dst: &VariableRef, src: &VariableRef) -> &mut Self {
        self.byte(op::COPY_VAR).var(dst).var(src)
    }

    pub fn add_var(&mut self, var: &VariableRef, delta: i16) -> &mut Self {
        self.byte(op::ADD_VAR).var(var).word(delta as u16)
    }

    /// Relative jump, measured from the end of the instruction.
    pub fn jump(&mut self, delta: i16) -> &mut Self {
        self.byte(op::JUMP).word(delta as u16)
    }

    pub fn jump_if_zero(&mut self, var: &VariableRef, delta: i16) -> &mut Self {
        self.byte(op::JUMP_IF_ZERO).var(var).word(delta as u16)
    }

    /// Jump to the position later passed to [`Assembler::bind`].
    pub fn jump_forward(&mut self) -> Label {
        self.byte(op::JUMP);
        self.placeholder()
    }

    pub fn jump_if_zero_forward(&mut self, var: &VariableRef) -> Label {
        self.byte(op::JUMP_IF_ZERO).var(var);
        self.placeholder()
    }

    fn placeholder(&mut self) -> Label {
        let operand = self.pc();
        self.word(0);
        Label { operand }
    }

    /// Points `label`'s jump at the current position.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        let delta = (self.pc() as i64 - (label.operand as i64 + 2)) as i16;
        self.bytes[label.operand..label.operand + 2].copy_from_slice(&delta.to_le_bytes());
        self
    }

    pub fn start_script(&mut self, script: u8, flags: u8, locals: &[VariableRef]) -> &mut Self {
        self.byte(op::START_SCRIPT).byte(script).byte(flags).args(locals)
    }

    /// `script` 0 stops the running script itself.
    pub fn stop_script(&mut self, script: u8) -> &mut Self {
        self.byte(op::STOP_SCRIPT).byte(script)
    }

    pub fn cutscene(&mut self, args: &[VariableRef]) -> &mut Self {
        self.byte(op::CUTSCENE).args(args)
    }

    pub fn end_cutscene(&mut self) -> &mut Self {
        self.byte(op::END_CUTSCENE)
    }

    /// Emits the override directive followed by the skip jump to bind.
    pub fn begin_override(&mut self) -> Label {
        self.byte(op::BEGIN_OVERRIDE);
        self.jump_forward()
    }

    pub fn end_override(&mut self) -> &mut Self {
        self.byte(op::END_OVERRIDE)
    }

    /// 0 unfreezes; other values freeze, overriding resistance from
    /// [`FREEZE_OVERRIDE_RESISTANCE`] up.
    pub fn freeze_scripts(&mut self, flag: u8) -> &mut Self {
        self.byte(op::FREEZE_SCRIPTS).byte(flag)
    }

    pub fn do_sentence(&mut self, verb: u8, a: &VariableRef, b: &VariableRef) -> &mut Self {
        self.byte(op::DO_SENTENCE).byte(verb).var(a).var(b)
    }

    pub fn load_room(&mut self, room: u8) -> &mut Self {
        self.byte(op::LOAD_ROOM).byte(room)
    }

    pub fn start_object(&mut self, object: &VariableRef, verb: u8, locals: &[VariableRef]) -> &mut Self {
        self.byte(op::START_OBJECT).var(object).byte(verb).args(locals)
    }

    pub fn wait_for_var(&mut self, var: &VariableRef, value: i16) -> &mut Self {
        self.byte(op::WAIT_FOR_VAR).var(var).word(value as u16)
    }
}
