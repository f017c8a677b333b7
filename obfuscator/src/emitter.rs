use crate::buffer::ByteBuffer;
use crate::error::Result;

/// Length of the near call/jmp encodings; relative offsets passed to the
/// emitter are taken from the start of the emitted instruction, so the
/// encoder rebases them by this amount.
const NEAR_BRANCH_LEN: i32 = 5;

/// The small native instruction set the obfuscator has to produce itself:
/// the patched region trampoline and the VM re-entry sequence.
///
/// Kept behind a trait so another architecture can slot in; x86/x86-64 is
/// the only variant today.
pub trait NativeEmitter {
    fn push_imm32(&self, value: u32, out: &mut ByteBuffer) -> Result<()>;

    fn push_imm64(&self, value: u64, out: &mut ByteBuffer) -> Result<()>;

    fn near_call(&self, offset: i32, out: &mut ByteBuffer) -> Result<()>;

    fn near_jmp(&self, offset: i32, out: &mut ByteBuffer) -> Result<()>;
}

pub struct X64Emitter;

impl NativeEmitter for X64Emitter {
    fn push_imm32(&self, value: u32, out: &mut ByteBuffer) -> Result<()> {
        out.write(0x68u8)?;
        out.write(value)
    }

    fn push_imm64(&self, value: u64, out: &mut ByteBuffer) -> Result<()> {
        out.write(0x68u8)?;
        out.write(value)
    }

    fn near_call(&self, offset: i32, out: &mut ByteBuffer) -> Result<()> {
        out.write(0xE8u8)?;
        out.write(offset.wrapping_sub(NEAR_BRANCH_LEN))
    }

    fn near_jmp(&self, offset: i32, out: &mut ByteBuffer) -> Result<()> {
        out.write(0xE9u8)?;
        out.write(offset.wrapping_sub(NEAR_BRANCH_LEN))
    }
}
