#[cfg(test)]
mod tests {
    use std::ffi::CString;
    use std::io::Write;

    use obfuscator::engine::{Engine, Options, Region};
    use obfuscator::pe::headers::{self, PE_SIGNATURE};
    use obfuscator::pe::{LoadMode, PeFile};
    use obfuscator::vcode::{Opcode, LDI_PAYLOAD_SIZE, REGISTER_SLOTS, WORD_SIZE};
    use obfuscator::{obfuscate, ObfuscateQuery, ObfuscateStatus};

    const SLOT_RAX: u16 = REGISTER_SLOTS[0];
    const SLOT_RCX: u16 = REGISTER_SLOTS[1];
    const SLOT_RBX: u16 = REGISTER_SLOTS[3];

    const TEXT_RAW: usize = 0x400;
    const TEXT_RVA: u32 = 0x1000;

    /// Raw offsets and RVAs of the sections the pass appends: `.Ign1` lands
    /// after `.text`, `.Ign2` after `.Ign1`'s 0x1000 raw bytes.
    const VM_RAW: usize = 0x600;
    const VCODE_RAW: usize = 0x1600;
    const VM_RVA: u32 = 0x2000;
    const VCODE_RVA: u32 = 0x3000;

    /// `mov rax, rax`; translatable filler to grow a region past the
    /// 10-byte patch prologue without leaving the VM.
    const FILLER: [u8; 3] = [0x48, 0x89, 0xC0];

    fn put16(image: &mut [u8], offset: usize, value: u16) {
        image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put32(image: &mut [u8], offset: usize, value: u32) {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put64(image: &mut [u8], offset: usize, value: u64) {
        image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn section_header(
        image: &mut [u8],
        slot: usize,
        name: &[u8],
        virtual_size: u32,
        virtual_address: u32,
        raw_size: u32,
        raw_offset: u32,
    ) {
        image[slot..slot + name.len()].copy_from_slice(name);
        put32(image, slot + 8, virtual_size);
        put32(image, slot + 12, virtual_address);
        put32(image, slot + 16, raw_size);
        put32(image, slot + 20, raw_offset);
        put32(image, slot + 36, 0x6000_0020);
    }

    /// Minimal 64-bit image: headers up to 0x400, `.text` at RVA 0x1000
    /// backed by 0x200 raw bytes, SectionAlignment 0x1000, FileAlignment
    /// 0x200. With `imports`, a second `.idata` section carries a one-DLL
    /// import table.
    fn build_image(text: &[u8], imports: bool) -> Vec<u8> {
        assert!(text.len() <= 0x200);

        let sections: u16 = if imports { 2 } else { 1 };
        let mut image = vec![0u8; if imports { 0x800 } else { 0x600 }];

        image[0] = b'M';
        image[1] = b'Z';
        put32(&mut image, 0x3C, 0x100);

        let nt = 0x100;
        put32(&mut image, nt, PE_SIGNATURE);
        put16(&mut image, nt + 4, headers::MACHINE_AMD64);
        put16(&mut image, nt + 6, sections);
        put16(&mut image, nt + 4 + 16, 240);

        let opt = nt + 24;
        put16(&mut image, opt, headers::PE32PLUS_MAGIC);
        put32(&mut image, opt + 16, TEXT_RVA); // entry point
        put64(&mut image, opt + 24, 0x1_4000_0000); // image base
        put32(&mut image, opt + 32, 0x1000); // section alignment
        put32(&mut image, opt + 36, 0x200); // file alignment
        put32(&mut image, opt + 56, 0x3000); // size of image
        put32(&mut image, opt + 60, 0x400); // size of headers
        put32(&mut image, opt + 108, 16); // rva-and-sizes count

        let table = opt + 240;
        section_header(&mut image, table, b".text", 0x800, TEXT_RVA, 0x200, 0x400);

        if imports {
            section_header(&mut image, table + 40, b".idata", 0x200, 0x2000, 0x200, 0x600);
            // import directory
            put32(&mut image, opt + 112 + 8, 0x2000);
            put32(&mut image, opt + 112 + 12, 0x28);

            let idata = 0x600;
            // descriptor: OriginalFirstThunk, Name, FirstThunk; the second,
            // all-zero descriptor terminates the array
            put32(&mut image, idata, 0x2028);
            put32(&mut image, idata + 12, 0x2040);
            put32(&mut image, idata + 16, 0x2050);

            put64(&mut image, idata + 0x28, 0x2060); // OriginalFirstThunk entry
            put64(&mut image, idata + 0x50, 0x2060); // FirstThunk entry

            image[idata + 0x40..idata + 0x4C].copy_from_slice(b"KERNEL32.dll");
            // hint word, then the name
            image[idata + 0x62..idata + 0x6D].copy_from_slice(b"ExitProcess");
        }

        image[TEXT_RAW..TEXT_RAW + text.len()].copy_from_slice(text);
        image
    }

    fn write_image(image: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(image).unwrap();
        file.flush().unwrap();
        file
    }

    /// Runs the whole pass over `text` and returns the rewritten file.
    fn protect(text: &[u8], regions: &[(u32, usize)], options: Options) -> Vec<u8> {
        let file = write_image(&build_image(text, false));

        let pe = PeFile::load(file.path(), LoadMode::Lazy).unwrap();
        let vm_image = vec![0xCCu8; 0x40];
        let regions = regions
            .iter()
            .map(|&(rva, size)| Region { rva, size })
            .collect();

        let mut engine = Engine::new(pe, &vm_image, regions, options).unwrap();
        engine.execute().unwrap();

        std::fs::read(file.path()).unwrap()
    }

    /// Appends `count` copies of the filler instruction to `code`.
    fn with_filler(code: &[u8], count: usize) -> Vec<u8> {
        let mut bytes = code.to_vec();
        for _ in 0..count {
            bytes.extend_from_slice(&FILLER);
        }
        bytes
    }

    /// Words the filler instruction contributes to the stream.
    fn filler_words(count: usize) -> Vec<(Opcode, u16, Option<u64>)> {
        let mut words = Vec::new();
        for _ in 0..count {
            words.push((Opcode::Ldr, SLOT_RAX, None));
            words.push((Opcode::Svr, SLOT_RAX, None));
        }
        words
    }

    /// Parses p-code words up to and including the exit opcode.
    fn words_at(stream: &[u8]) -> Vec<(Opcode, u16, Option<u64>)> {
        let mut words = Vec::new();
        let mut offset = 0;

        loop {
            let raw = u32::from_le_bytes(stream[offset..offset + 4].try_into().unwrap());
            let opcode = Opcode::try_from(raw as u16).unwrap();
            let parameter = (raw >> 16) as u16;
            offset += WORD_SIZE;

            let payload = if opcode == Opcode::Ldi {
                let value = u64::from_le_bytes(stream[offset..offset + 8].try_into().unwrap());
                offset += LDI_PAYLOAD_SIZE;
                Some(value)
            } else {
                None
            };

            let done = matches!(opcode, Opcode::VmExit | Opcode::VmExit2);
            words.push((opcode, parameter, payload));
            if done {
                return words;
            }
        }
    }

    fn decode_vip(encoded: u32) -> u16 {
        let key = encoded as u16;
        let vip = (encoded >> 16) ^ (u32::from(key as u8) << 8) ^ u32::from((key >> 8) as u8);
        vip as u16
    }

    #[test]
    fn add_region_end_to_end() {
        // add rax, rbx, grown past the patch prologue with filler movs
        let text = with_filler(&[0x48, 0x01, 0xD8], 3);
        let data = protect(&text, &[(TEXT_RVA, text.len())], Options::default());

        // interpreter blob copied verbatim into .Ign1
        assert!(data[VM_RAW..VM_RAW + 0x40].iter().all(|&b| b == 0xCC));

        let mut expected = vec![
            (Opcode::Ldr, SLOT_RAX, None),
            (Opcode::Ldr, SLOT_RAX, None),
            (Opcode::Add, 0, None),
            (Opcode::Svr, SLOT_RAX, None),
        ];
        expected.extend(filler_words(3));
        expected.push((Opcode::VmExit, 0, None));

        assert_eq!(words_at(&data[VCODE_RAW..]), expected);
    }

    #[test]
    fn patched_region_shape() {
        let data = protect(&[0x90; 16], &[(TEXT_RVA, 16)], Options::default());

        let region = &data[TEXT_RAW..TEXT_RAW + 16];
        assert_eq!(region[0], 0x68);
        assert_eq!(region[5], 0xE8);

        // call rel32 from the byte after the call to the interpreter base
        let rel = i32::from_le_bytes(region[6..10].try_into().unwrap());
        let call_end = i64::from(TEXT_RVA) + 10;
        assert_eq!(call_end + i64::from(rel), i64::from(VM_RVA));

        // the vip names the start of the p-code section relative to the vm
        let encoded = u32::from_le_bytes(region[1..5].try_into().unwrap());
        assert_eq!(decode_vip(encoded), (VCODE_RVA - VM_RVA) as u16);

        // nop fill up to the original region size
        assert!(region[10..].iter().all(|&b| b == 0x90));
    }

    #[test]
    fn mov_region_end_to_end() {
        // mov rax, rbx
        let text = with_filler(&[0x48, 0x89, 0xD8], 3);
        let data = protect(&text, &[(TEXT_RVA, text.len())], Options::default());

        let mut expected = vec![
            (Opcode::Ldr, SLOT_RBX, None),
            (Opcode::Svr, SLOT_RAX, None),
        ];
        expected.extend(filler_words(3));
        expected.push((Opcode::VmExit, 0, None));

        assert_eq!(words_at(&data[VCODE_RAW..]), expected);
    }

    #[test]
    fn unsupported_region_goes_hybrid() {
        // hlt, then pure nop filler; nothing here translates
        let mut text = vec![0xF4u8];
        text.extend_from_slice(&[0x90; 15]);
        let data = protect(&text, &[(TEXT_RVA, 16)], Options::default());

        let stream = &data[VCODE_RAW..];
        let switch = u32::from_le_bytes(stream[..4].try_into().unwrap());
        assert_eq!(switch as u16, Opcode::VmSwitch as u16);

        // the raw instruction bytes travel verbatim
        assert_eq!(&stream[4..20], text.as_slice());

        let exit = u32::from_le_bytes(stream[20..24].try_into().unwrap());
        assert_eq!(exit as u16, Opcode::VmExit2 as u16);
    }

    #[test]
    fn hybrid_region_reenters_the_vm() {
        // add rax, rbx; hlt; add rax, rbx; one filler mov
        let mut text = vec![0x48, 0x01, 0xD8, 0xF4, 0x48, 0x01, 0xD8];
        text.extend_from_slice(&FILLER);
        let data = protect(&text, &[(TEXT_RVA, text.len())], Options::default());

        let stream = &data[VCODE_RAW..];
        let add_len = 4 * WORD_SIZE;

        let switch = u32::from_le_bytes(stream[add_len..add_len + 4].try_into().unwrap());
        assert_eq!(switch as u16, Opcode::VmSwitch as u16);
        assert_eq!(stream[add_len + 4], 0xF4);

        // push/push/jmp re-entry trampoline
        let tramp = add_len + 4 + 1;
        assert_eq!(stream[tramp], 0x68);
        assert_eq!(stream[tramp + 5], 0x68);
        assert_eq!(stream[tramp + 10], 0xE9);

        // the second push carries vm_rva - (block_rva + 10)
        let resume = u32::from_le_bytes(stream[tramp + 6..tramp + 10].try_into().unwrap());
        assert_eq!(resume, VM_RVA - (TEXT_RVA + 10));

        // after the trampoline: the second add, the filler, the hybrid exit
        let mut expected = vec![
            (Opcode::Ldr, SLOT_RAX, None),
            (Opcode::Ldr, SLOT_RAX, None),
            (Opcode::Add, 0, None),
            (Opcode::Svr, SLOT_RAX, None),
        ];
        expected.extend(filler_words(1));
        expected.push((Opcode::VmExit2, 0, None));

        assert_eq!(words_at(&stream[tramp + 15..]), expected);
    }

    #[test]
    fn memory_operand_region_end_to_end() {
        // mov rax, [rcx*1 + 0x1000]
        let text = with_filler(&[0x48, 0x8B, 0x04, 0x0D, 0x00, 0x10, 0x00, 0x00], 1);
        let data = protect(&text, &[(TEXT_RVA, text.len())], Options::default());

        let mut expected = vec![
            (Opcode::Ldi, 0, Some(0)),
            (Opcode::Ldi, 0, Some(0x1000)),
            (Opcode::Add, 0, None),
            (Opcode::Ldr, SLOT_RCX, None),
            (Opcode::Ldi, 0, Some(1)),
            (Opcode::Mul, 0, None),
            (Opcode::Add, 0, None),
            (Opcode::Ldm, 0, None),
            (Opcode::Svr, SLOT_RAX, None),
        ];
        expected.extend(filler_words(1));
        expected.push((Opcode::VmExit, 0, None));

        assert_eq!(words_at(&data[VCODE_RAW..]), expected);
    }

    #[test]
    fn two_regions_pack_back_to_back() {
        // two identical 12-byte regions inside .text
        let block = with_filler(&[0x48, 0x01, 0xD8], 3);
        let mut text = vec![0u8; 0x40 + block.len()];
        text[..block.len()].copy_from_slice(&block);
        text[0x40..].copy_from_slice(&block);

        let data = protect(
            &text,
            &[(TEXT_RVA, block.len()), (TEXT_RVA + 0x40, block.len())],
            Options::default(),
        );

        // first blob: add + filler + exit = 4 + 6 + 1 words, 44 bytes
        let first = words_at(&data[VCODE_RAW..]);
        assert_eq!(first.len(), 11);
        assert_eq!(first[0], (Opcode::Ldr, SLOT_RAX, None));
        assert_eq!(first.last().unwrap().0, Opcode::VmExit);
        let first_len = first.len() * WORD_SIZE;

        // second blob starts right where the first one ended
        let second = words_at(&data[VCODE_RAW + first_len..]);
        assert_eq!(second, first);

        // each patched site carries the vip of its own blob
        let first_vip = decode_vip(u32::from_le_bytes(
            data[TEXT_RAW + 1..TEXT_RAW + 5].try_into().unwrap(),
        ));
        let second_vip = decode_vip(u32::from_le_bytes(
            data[TEXT_RAW + 0x41..TEXT_RAW + 0x45].try_into().unwrap(),
        ));
        assert_eq!(first_vip, (VCODE_RVA - VM_RVA) as u16);
        assert_eq!(second_vip, (VCODE_RVA - VM_RVA) as u16 + first_len as u16);
    }

    #[test]
    fn timing_trap_prefixes_the_stream() {
        let text = with_filler(&[0x48, 0x01, 0xD8], 3);
        let data = protect(
            &text,
            &[(TEXT_RVA, text.len())],
            Options { timing_trap: true },
        );

        let words = words_at(&data[VCODE_RAW..]);
        assert_eq!(words[0], (Opcode::Ldi, 0, Some(0x7FFE_0008)));
        assert_eq!(words[1].0, Opcode::Ldm);
        assert_eq!(words[2], (Opcode::Ldi, 0, Some(0x7FFE_0008)));
        assert_eq!(words[3].0, Opcode::Ldm);
        assert_eq!(words[4].0, Opcode::Sub);
        // the region's own p-code follows
        assert_eq!(words[5], (Opcode::Ldr, SLOT_RAX, None));
    }

    #[test]
    fn appended_sections_are_well_formed() {
        let data = protect(&[0x90; 16], &[(TEXT_RVA, 16)], Options::default());

        assert_eq!(headers::read_u16(&data, 0x100 + 6), 3);

        let file = write_image(&data);
        let pe = PeFile::load(file.path(), LoadMode::Lazy).unwrap();
        assert_eq!(pe.sections().len(), 3);
        assert_eq!(pe.sections()[1].name, ".Ign1");
        assert_eq!(pe.sections()[2].name, ".Ign2");
        assert_eq!(pe.sections()[1].header.virtual_address, VM_RVA);
        assert_eq!(pe.sections()[2].header.virtual_address, VCODE_RVA);
        assert_eq!(pe.sections()[1].header.characteristics, 0x6000_0020);
    }

    #[test]
    fn full_load_walks_the_import_table() {
        let file = write_image(&build_image(&[], true));

        let pe = PeFile::load(file.path(), LoadMode::Full).unwrap();
        let functions = &pe.imports()["KERNEL32.dll"];
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].name, "ExitProcess");
        assert_eq!(functions[0].rva, 0);
    }

    #[test]
    fn lazy_load_skips_the_import_table() {
        let file = write_image(&build_image(&[], true));

        let pe = PeFile::load(file.path(), LoadMode::Lazy).unwrap();
        assert_eq!(pe.load_mode(), LoadMode::Lazy);
        assert!(pe.imports().is_empty());
        assert_eq!(pe.sections().len(), 2);
    }

    #[test]
    fn library_entry_rewrites_a_region() {
        let file = write_image(&build_image(&[0x90; 16], false));

        let mut vm_file = tempfile::NamedTempFile::new().unwrap();
        vm_file.write_all(&[0xCC; 0x40]).unwrap();
        vm_file.flush().unwrap();

        let file_path = CString::new(file.path().to_str().unwrap()).unwrap();
        let vm_path = CString::new(vm_file.path().to_str().unwrap()).unwrap();

        let query = ObfuscateQuery {
            file_path: file_path.as_ptr(),
            vm_path: vm_path.as_ptr(),
            region: TEXT_RVA as usize,
            region_size: 16,
        };

        let status = unsafe { obfuscate(&query) };
        assert_eq!(status, ObfuscateStatus::Success);

        let data = std::fs::read(file.path()).unwrap();
        assert_eq!(data[TEXT_RAW], 0x68);
        assert_eq!(data[TEXT_RAW + 5], 0xE8);
    }

    #[test]
    fn library_entry_rejects_bad_inputs() {
        let file = write_image(&build_image(&[0x90; 16], false));
        let file_path = CString::new(file.path().to_str().unwrap()).unwrap();
        let missing = CString::new("/nonexistent/vm.bin").unwrap();

        assert_eq!(
            unsafe { obfuscate(std::ptr::null()) },
            ObfuscateStatus::InvalidPath
        );

        let query = ObfuscateQuery {
            file_path: missing.as_ptr(),
            vm_path: missing.as_ptr(),
            region: 0x1000,
            region_size: 16,
        };
        assert_eq!(unsafe { obfuscate(&query) }, ObfuscateStatus::InvalidPath);

        let query = ObfuscateQuery {
            file_path: file_path.as_ptr(),
            vm_path: missing.as_ptr(),
            region: 0x1000,
            region_size: 16,
        };
        assert_eq!(unsafe { obfuscate(&query) }, ObfuscateStatus::VmNotFound);
    }

    #[test]
    fn region_smaller_than_the_patch_fails() {
        let file = write_image(&build_image(&[0x48, 0x01, 0xD8], false));

        let pe = PeFile::load(file.path(), LoadMode::Lazy).unwrap();
        let mut engine = Engine::new(
            pe,
            &[0xCC; 0x40],
            vec![Region {
                rva: TEXT_RVA,
                size: 3,
            }],
            Options::default(),
        )
        .unwrap();

        // three bytes cannot hold the push + call prologue
        assert!(engine.execute().is_err());
    }
}
