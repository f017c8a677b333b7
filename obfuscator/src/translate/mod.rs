use iced_x86::{Decoder, DecoderOptions, Instruction};

use crate::buffer::ByteBuffer;
use crate::emitter::NativeEmitter;
use crate::error::Result;
use crate::gadgets;
use crate::keys;
use crate::vcode::{self, Opcode, Parameter, LDI_SIZE, WORD_SIZE};

pub mod instruction;

use instruction::{Mode, Status};

/// Addresses a block translation works against. Immutable for the duration
/// of one region.
#[derive(Debug, Clone)]
pub struct Context {
    /// Where the native bytes live in the target image.
    pub original_block_rva: u64,
    pub original_block_size: u64,
    /// Where the interpreter blob lives.
    pub vm_block_rva: u64,
    pub vm_block_size: u64,
    /// Where this region's p-code will be written.
    pub vcode_block_rva: u64,
    pub vcode_block_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TranslateOptions {
    pub timing_trap: bool,
}

/// Native length of the VM re-entry sequence: push imm32, push imm32,
/// jmp rel32.
pub const TRAMPOLINE_SIZE: usize = 15;

/// Native length of the patched region prologue: push imm32, call rel32.
pub const PATCH_SIZE: u32 = 10;

/// Worst case for one unrolled memory operand: four pushes, all taking the
/// `Ldi` form, plus the three combining ops.
const MEMORY_UNROLL_MAX: usize = 4 * LDI_SIZE + 3 * WORD_SIZE;

/// A memory access adds the `Ldm`/`Svm` word on top of the unroll.
const MEMORY_ACCESS_MAX: usize = MEMORY_UNROLL_MAX + WORD_SIZE;

/// Upper bound on the p-code emitted for one decoded instruction. The worst
/// supported case is arithmetic with a memory destination: two operand
/// loads, the arithmetic word, and the store. Hybrid fallback costs at most
/// the instruction's own bytes plus a `VmSwitch` word and one re-entry
/// trampoline, which is far below this. Every instruction is at least one
/// byte long, so sizing the output at this bound per input byte can never
/// overflow.
pub const MAX_PCODE_PER_INSTRUCTION: usize = 3 * MEMORY_ACCESS_MAX + WORD_SIZE;

/// Drives the single-instruction translator across a native block, stitching
/// hybrid stretches of raw instructions between `VmSwitch` and the re-entry
/// trampoline, with a one-instruction probe deciding where each stretch
/// ends.
pub fn translate_block(
    native: &ByteBuffer,
    emitter: &dyn NativeEmitter,
    context: &Context,
    options: &TranslateOptions,
) -> Result<ByteBuffer> {
    let capacity =
        native.size() * MAX_PCODE_PER_INSTRUCTION + gadgets::TIMING_TRAP_SIZE + WORD_SIZE;
    let mut out = ByteBuffer::allocate(capacity)?;

    if options.timing_trap {
        gadgets::emit_timing_trap(&mut out)?;
    }

    let data = native.as_slice();
    let mut decoder = Decoder::with_ip(64, data, context.original_block_rva, DecoderOptions::NONE);

    let mut inst = Instruction::default();
    let mut is_probing = false;
    let mut vm_switched = false;

    while decoder.can_decode() {
        let start = decoder.position();
        decoder.decode_out(&mut inst);
        let end = decoder.position();

        let mode = if is_probing { Mode::Probe } else { Mode::Emit };

        match instruction::translate(&inst, &mut out, mode)? {
            Status::Unsupported => {
                if !is_probing {
                    vcode::emit(Opcode::VmSwitch, Parameter::None, &mut out)?;
                    vm_switched = true;
                    is_probing = true;
                }

                // The raw instruction travels in the stream for the switched
                // VM to execute natively.
                out.write_bytes(&data[start..end])?;
            }
            Status::Emitted if is_probing => {
                is_probing = false;
                emit_reentry_trampoline(emitter, context, &mut out)?;

                // The probe was a no-op; emit the instruction for real.
                instruction::translate(&inst, &mut out, Mode::Emit)?;
            }
            Status::Emitted => {}
        }
    }

    let exit = if vm_switched {
        Opcode::VmExit2
    } else {
        Opcode::VmExit
    };
    vcode::emit(exit, Parameter::None, &mut out)?;

    Ok(out)
}

/// Re-enters the VM from a hybrid-native stretch: pushes a freshly keyed vip
/// naming the byte after this trampoline, pushes the resume address for
/// `VmExit2`, and jumps to the interpreter.
fn emit_reentry_trampoline(
    emitter: &dyn NativeEmitter,
    context: &Context,
    out: &mut ByteBuffer,
) -> Result<()> {
    let vip = context.vcode_block_rva.wrapping_sub(context.vm_block_rva) as u32
        + out.cursor_pos() as u32
        + TRAMPOLINE_SIZE as u32;

    let key = keys::generate_key();
    emitter.push_imm32(keys::encode_vip_entry(vip, key), out)?;

    let resume = (context.vm_block_rva as u32)
        .wrapping_sub(context.original_block_rva as u32 + PATCH_SIZE);
    emitter.push_imm32(resume, out)?;

    let jmp_offset =
        context.vm_block_rva as i64 - (context.vcode_block_rva as i64 + out.cursor_pos() as i64);
    emitter.near_jmp(jmp_offset as i32, out)
}
