use crate::buffer::ByteBuffer;
use crate::error::Result;
use crate::vcode::{self, Opcode, Parameter, LDI_SIZE, WORD_SIZE};

/// KUSER_SHARED_DATA.SystemTime low dword, mapped at the same address in
/// every Windows process.
const SYSTEM_TIME_ADDRESS: u64 = 0x7FFE_0008;

pub const TIMING_TRAP_SIZE: usize = 2 * (LDI_SIZE + WORD_SIZE) + WORD_SIZE;

/// Samples the shared-page system time twice and leaves the difference on
/// the VM stack for the interpreter's trap check.
pub fn emit_timing_trap(out: &mut ByteBuffer) -> Result<()> {
    vcode::emit_ldi(SYSTEM_TIME_ADDRESS, out)?;
    vcode::emit(Opcode::Ldm, Parameter::None, out)?;

    vcode::emit_ldi(SYSTEM_TIME_ADDRESS, out)?;
    vcode::emit(Opcode::Ldm, Parameter::None, out)?;

    vcode::emit(Opcode::Sub, Parameter::None, out)
}
