use iced_x86::Register;

use crate::buffer::ByteBuffer;
use crate::error::Result;

/// Size of one assembled p-code word.
pub const WORD_SIZE: usize = 4;

/// `Ldi` is the only opcode trailed by a payload: 8 bytes, little-endian.
pub const LDI_PAYLOAD_SIZE: usize = 8;
pub const LDI_SIZE: usize = WORD_SIZE + LDI_PAYLOAD_SIZE;

/// Commands the translator is allowed to emit. The numeric values are part
/// of the contract with the embedded interpreter blob and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    /// Push the virtual register at the slot in the parameter field.
    Ldr = 0,
    /// Push the 64-bit immediate following the word.
    Ldi,
    /// Pop an address, push the value stored there.
    Ldm,
    /// Pop into the virtual register at the slot in the parameter field.
    Svr,
    /// Pop an address, pop a value, store the value at the address.
    Svm,
    Add,
    Sub,
    Mul,
    /// Leave the VM; the stream continues with raw native bytes.
    VmSwitch,
    /// Terminate the VM and resume after the patched call site.
    VmExit,
    /// Terminate the VM from the hybrid state entered through `VmSwitch`.
    VmExit2,
}

impl TryFrom<u16> for Opcode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        Ok(match value {
            0 => Self::Ldr,
            1 => Self::Ldi,
            2 => Self::Ldm,
            3 => Self::Svr,
            4 => Self::Svm,
            5 => Self::Add,
            6 => Self::Sub,
            7 => Self::Mul,
            8 => Self::VmSwitch,
            9 => Self::VmExit,
            10 => Self::VmExit2,
            other => return Err(other),
        })
    }
}

/// The 16-bit half of a p-code word next to the opcode: either a named
/// constant, a register slot, or a raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    None,
    Slot(u16),
    Raw(u16),
}

impl Parameter {
    pub fn assemble(self) -> u16 {
        match self {
            Parameter::None => 0,
            Parameter::Slot(slot) => slot,
            Parameter::Raw(value) => value,
        }
    }
}

/// One virtual instruction, assembled as `(parameter << 16) | opcode`.
#[derive(Debug, Clone, Copy)]
pub struct VInstruction {
    pub opcode: Opcode,
    pub parameter: Parameter,
}

impl VInstruction {
    pub fn new(opcode: Opcode, parameter: Parameter) -> Self {
        Self { opcode, parameter }
    }

    pub fn assemble(self) -> u32 {
        (u32::from(self.parameter.assemble()) << 16) | u32::from(self.opcode as u16)
    }
}

/// Byte offsets of the 16 general-purpose registers inside the interpreter's
/// register area, indexed by `register - RAX`. The layout mirrors the
/// interpreter blob bit-for-bit; changing one without the other bricks every
/// protected binary.
pub const REGISTER_SLOTS: [u16; 16] = [
    128, 16, 24, 8, 136, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112,
];

/// Resolves a decoded register to its slot. Registers narrower than 64 bits
/// share the slot of their full-width parent; anything outside the
/// general-purpose file has no slot.
pub fn register_slot(register: Register) -> Option<u16> {
    let full = register.full_register();
    let base = Register::RAX as u32;
    let index = (full as u32).checked_sub(base)?;

    REGISTER_SLOTS.get(index as usize).copied()
}

pub fn emit(opcode: Opcode, parameter: Parameter, out: &mut ByteBuffer) -> Result<()> {
    out.write(VInstruction::new(opcode, parameter).assemble())
}

pub fn emit_ldi(value: u64, out: &mut ByteBuffer) -> Result<()> {
    emit(Opcode::Ldi, Parameter::None, out)?;
    out.write(value)
}
