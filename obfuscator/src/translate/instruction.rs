use iced_x86::{Instruction, Mnemonic, OpKind, Register};

use crate::buffer::ByteBuffer;
use crate::error::Result;
use crate::vcode::{self, Opcode, Parameter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The instruction translates; in `Emit` mode its p-code was written.
    Emitted,
    /// Outside the supported set; the driver falls back to hybrid mode.
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Emit,
    /// Answer supportability only, with all writes suppressed.
    Probe,
}

/// Translates one decoded instruction into stack-machine p-code.
pub fn translate(instruction: &Instruction, out: &mut ByteBuffer, mode: Mode) -> Result<Status> {
    match instruction.mnemonic() {
        Mnemonic::Add => binary_op(instruction, Opcode::Add, out, mode),
        Mnemonic::Sub => binary_op(instruction, Opcode::Sub, out, mode),
        Mnemonic::Mov => mov(instruction, out, mode),
        Mnemonic::Call => call(instruction),
        _ => Ok(Status::Unsupported),
    }
}

fn binary_op(
    instruction: &Instruction,
    opcode: Opcode,
    out: &mut ByteBuffer,
    mode: Mode,
) -> Result<Status> {
    if instruction.op_count() < 2
        || !operand_supported(instruction, 0)
        || !operand_supported(instruction, 1)
    {
        return Ok(Status::Unsupported);
    }

    if mode == Mode::Probe {
        return Ok(Status::Emitted);
    }

    // The interpreter's arithmetic handlers expect both inputs to come from
    // the destination operand; this stream shape has to stay in lockstep
    // with the embedded blob.
    emit_load(instruction, 0, out)?;
    emit_load(instruction, 0, out)?;
    vcode::emit(opcode, Parameter::None, out)?;
    emit_store(instruction, 0, out)?;

    Ok(Status::Emitted)
}

fn mov(instruction: &Instruction, out: &mut ByteBuffer, mode: Mode) -> Result<Status> {
    if instruction.op_count() < 2
        || !operand_supported(instruction, 0)
        || !operand_supported(instruction, 1)
    {
        return Ok(Status::Unsupported);
    }

    if mode == Mode::Probe {
        return Ok(Status::Emitted);
    }

    emit_load(instruction, 1, out)?;
    emit_store(instruction, 0, out)?;

    Ok(Status::Emitted)
}

/// Shape check only; the patched call site itself is produced upstream by
/// the orchestrator.
fn call(instruction: &Instruction) -> Result<Status> {
    match instruction.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Ok(Status::Emitted),
        _ => Ok(Status::Unsupported),
    }
}

fn operand_supported(instruction: &Instruction, operand: u32) -> bool {
    match instruction.op_kind(operand) {
        OpKind::Register => vcode::register_slot(instruction.op_register(operand)).is_some(),
        OpKind::Memory => memory_supported(instruction),
        _ => true,
    }
}

fn memory_supported(instruction: &Instruction) -> bool {
    let base = instruction.memory_base();
    let index = instruction.memory_index();

    (base == Register::None || vcode::register_slot(base).is_some())
        && (index == Register::None || vcode::register_slot(index).is_some())
}

fn emit_load(instruction: &Instruction, operand: u32, out: &mut ByteBuffer) -> Result<()> {
    match instruction.op_kind(operand) {
        OpKind::Register => match vcode::register_slot(instruction.op_register(operand)) {
            Some(slot) => vcode::emit(Opcode::Ldr, Parameter::Slot(slot), out),
            None => Ok(()),
        },
        OpKind::Memory => {
            unroll_memory(instruction, out)?;
            vcode::emit(Opcode::Ldm, Parameter::None, out)
        }
        kind if is_immediate(kind) => vcode::emit_ldi(instruction.immediate(operand), out),
        _ => Ok(()),
    }
}

fn emit_store(instruction: &Instruction, operand: u32, out: &mut ByteBuffer) -> Result<()> {
    match instruction.op_kind(operand) {
        OpKind::Register => match vcode::register_slot(instruction.op_register(operand)) {
            Some(slot) => vcode::emit(Opcode::Svr, Parameter::Slot(slot), out),
            None => Ok(()),
        },
        OpKind::Memory => {
            unroll_memory(instruction, out)?;
            vcode::emit(Opcode::Svm, Parameter::None, out)
        }
        _ => Ok(()),
    }
}

/// Expands a `base + index * scale + disp` operand into explicit stack
/// arithmetic. The emitted shape is uniform no matter which fields are
/// present: four pushes and the op sequence `Add`, `Mul`-or-`Add`, `Add`,
/// leaving the effective address on top of the stack.
fn unroll_memory(instruction: &Instruction, out: &mut ByteBuffer) -> Result<()> {
    match vcode::register_slot(instruction.memory_base()) {
        Some(slot) => vcode::emit(Opcode::Ldr, Parameter::Slot(slot), out)?,
        None => vcode::emit_ldi(0, out)?,
    }

    vcode::emit_ldi(instruction.memory_displacement64(), out)?;
    vcode::emit(Opcode::Add, Parameter::None, out)?;

    match vcode::register_slot(instruction.memory_index()) {
        Some(slot) => vcode::emit(Opcode::Ldr, Parameter::Slot(slot), out)?,
        None => vcode::emit_ldi(0, out)?,
    }

    let scale = u64::from(instruction.memory_index_scale());
    if scale != 0 {
        vcode::emit_ldi(scale, out)?;
        vcode::emit(Opcode::Mul, Parameter::None, out)?;
    } else {
        vcode::emit_ldi(0, out)?;
        vcode::emit(Opcode::Add, Parameter::None, out)?;
    }

    vcode::emit(Opcode::Add, Parameter::None, out)
}

fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}
