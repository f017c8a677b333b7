use logger::{debug, info};

use crate::buffer::ByteBuffer;
use crate::emitter::{NativeEmitter, X64Emitter};
use crate::error::{Error, Result};
use crate::gadgets;
use crate::keys;
use crate::pe::{align_up, PeFile, Section};
use crate::translate::{translate_block, Context, TranslateOptions, MAX_PCODE_PER_INSTRUCTION};
use crate::vcode::WORD_SIZE;

/// Section holding the interpreter blob.
pub const VM_SECTION_NAME: &str = ".Ign1";
/// Section holding the concatenated p-code of all regions.
pub const VCODE_SECTION_NAME: &str = ".Ign2";

/// One code region to virtualize.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub rva: u32,
    pub size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub timing_trap: bool,
}

/// Runs the whole pass over one target: appends the interpreter and p-code
/// sections, then translates and patches each region in the order supplied.
pub struct Engine {
    pe: PeFile,
    vm_section: Section,
    vcode_section: Section,
    regions: Vec<Region>,
    options: Options,
}

impl Engine {
    pub fn new(
        mut pe: PeFile,
        vm_image: &[u8],
        regions: Vec<Region>,
        options: Options,
    ) -> Result<Self> {
        if regions.is_empty() {
            return Err(Error::RegionPairs);
        }

        info!(
            "Loaded {}-bit binary ({} sections, {} bytes)",
            pe.arch().bitness(),
            pe.sections().len(),
            pe.file_size(),
        );

        let alignment = pe.section_alignment();
        let file_alignment = pe.file_alignment();

        let vm_size = align_up((vm_image.len() as u32).max(alignment), file_alignment);
        let vm_section = pe.add_section(VM_SECTION_NAME, vm_size)?;

        let mut blob = ByteBuffer::allocate(vm_image.len())?;
        blob.write_bytes(vm_image)?;
        pe.write_region(vm_section.header.virtual_address, &blob)?;

        info!(
            "Interpreter: {} bytes at rva {:#x}",
            vm_image.len(),
            vm_section.header.virtual_address
        );

        // Size the p-code section from the per-instruction worst case so a
        // well-formed run cannot hit the section end.
        let worst: usize = regions
            .iter()
            .map(|region| {
                region.size * MAX_PCODE_PER_INSTRUCTION + gadgets::TIMING_TRAP_SIZE + WORD_SIZE
            })
            .sum();
        let vcode_size = align_up((worst as u32).max(alignment), file_alignment);
        let vcode_section = pe.add_section(VCODE_SECTION_NAME, vcode_size)?;

        debug!(
            "p-code section sized {:#x} for {} region(s)",
            vcode_size,
            regions.len()
        );

        Ok(Self {
            pe,
            vm_section,
            vcode_section,
            regions,
            options,
        })
    }

    pub fn execute(&mut self) -> Result<()> {
        let emitter = X64Emitter;
        let translate_options = TranslateOptions {
            timing_trap: self.options.timing_trap,
        };

        let vm_rva = u64::from(self.vm_section.header.virtual_address);
        let vcode_rva = u64::from(self.vcode_section.header.virtual_address);
        let mut vcode_offset: u64 = 0;

        for index in 0..self.regions.len() {
            let region = self.regions[index];

            let native = self.pe.load_region(region.rva, region.size)?;

            let context = Context {
                original_block_rva: u64::from(region.rva),
                original_block_size: region.size as u64,
                vm_block_rva: vm_rva,
                vm_block_size: u64::from(self.vm_section.header.size_of_raw_data),
                vcode_block_rva: vcode_rva + vcode_offset,
                vcode_block_size: u64::from(self.vcode_section.header.size_of_raw_data)
                    - vcode_offset,
            };

            let pcode = translate_block(&native, &emitter, &context, &translate_options)?;
            self.pe
                .write_region_pos(context.vcode_block_rva as u32, &pcode)?;

            // The entry vip names the start of this region's own p-code, so
            // it is derived before the write offset moves past it.
            let entry_offset = context.vcode_block_rva - vm_rva;
            if entry_offset > u64::from(u16::MAX) {
                return Err(Error::VipOutOfRange(entry_offset));
            }

            vcode_offset += pcode.cursor_pos() as u64;

            let key = keys::generate_key();
            let encoded = keys::encode_vip_entry(entry_offset as u32, key);

            let mut patched = native;
            emitter.push_imm32(encoded, &mut patched)?;

            let call_offset = vm_rva as i64 - (i64::from(region.rva) + patched.cursor_pos() as i64);
            emitter.near_call(call_offset as i32, &mut patched)?;
            patched.pad(0x90);

            self.pe.write_region(region.rva, &patched)?;

            info!(
                "Region {:#x}: {} native bytes -> {} bytes of p-code (vip {:#x})",
                region.rva,
                region.size,
                pcode.cursor_pos(),
                entry_offset,
            );
        }

        info!(
            "Virtualized {} region(s), {} p-code bytes total",
            self.regions.len(),
            vcode_offset
        );

        Ok(())
    }
}
