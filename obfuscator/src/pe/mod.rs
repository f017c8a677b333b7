use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::buffer::ByteBuffer;
use crate::error::{Error, Result};

pub mod headers;

use headers::{
    Arch, DosHeader, FileHeader, OptionalHeader, SectionHeader, DOS_HEADER_SIZE, DOS_STUB_SIZE,
    FILE_HEADER_SIZE, IMPORT_DESCRIPTOR_SIZE, NT_HEADERS32_SIZE, NUMBER_OF_SECTIONS_OFFSET,
    OPTIONAL_HEADER32_SIZE, OPTIONAL_HEADER64_SIZE, PE_SIGNATURE, SECTION_CODE_EXECUTE_READ,
    SECTION_HEADER_SIZE, SECTION_NAME_SIZE, SIZE_OF_IMAGE_OFFSET,
};

/// Names longer than this abort import parsing.
const MAX_IMPORT_NAME: usize = 0x1000;

/// Fixed virtual size stamped on appended section descriptors.
const NEW_SECTION_VIRTUAL_SIZE: u32 = 0x200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Skip the import directory.
    Lazy,
    /// Also walk the import directory into the imported-functions table.
    Full,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub header: SectionHeader,
}

#[derive(Debug, Clone)]
pub struct ImportedFunction {
    pub name: String,
    pub rva: u32,
}

/// In-place editor over a PE file opened read-write.
///
/// The editor owns the file handle for its whole lifetime; every operation
/// that moves the stream restores the position it found on entry.
pub struct PeFile {
    file: std::fs::File,
    file_size: u64,
    load_mode: LoadMode,
    dos: DosHeader,
    arch: Arch,
    file_header: FileHeader,
    optional: OptionalHeader,
    sections: Vec<Section>,
    imports: HashMap<String, Vec<ImportedFunction>>,
}

pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

impl PeFile {
    pub fn load(path: &Path, load_mode: LoadMode) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < (DOS_HEADER_SIZE + NT_HEADERS32_SIZE) as u64 {
            return Err(Error::FileTooSmall);
        }

        let mut dos_bytes = [0u8; DOS_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut dos_bytes)?;
        let dos = DosHeader::parse(&dos_bytes);

        if dos.e_magic != headers::DOS_MAGIC {
            return Err(Error::BadDosMagic);
        }

        let reserved = (DOS_HEADER_SIZE + DOS_STUB_SIZE) as u64;
        let nt_offset = u64::from(dos.e_lfanew);
        if nt_offset <= reserved || nt_offset >= file_size.saturating_sub(reserved) {
            return Err(Error::BadNtOffset);
        }

        file.seek(SeekFrom::Start(nt_offset))?;

        let mut signature = [0u8; 4];
        file.read_exact(&mut signature)?;
        if u32::from_le_bytes(signature) != PE_SIGNATURE {
            return Err(Error::BadPeSignature);
        }

        let mut file_header_bytes = [0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut file_header_bytes)?;
        let file_header = FileHeader::parse(&file_header_bytes);

        let arch = Arch::from_machine(file_header.machine)
            .ok_or(Error::UnsupportedMachine(file_header.machine))?;

        let optional_size = match arch {
            Arch::X86 => OPTIONAL_HEADER32_SIZE,
            Arch::X64 => OPTIONAL_HEADER64_SIZE,
        };

        let mut optional_bytes = vec![0u8; optional_size];
        file.read_exact(&mut optional_bytes)?;
        let optional = OptionalHeader::parse(&optional_bytes, arch);

        let mut pe = Self {
            file,
            file_size,
            load_mode,
            dos,
            arch,
            file_header,
            optional,
            sections: Vec::new(),
            imports: HashMap::new(),
        };

        pe.load_sections()?;

        if load_mode == LoadMode::Full {
            pe.load_imports()?;
        }

        Ok(pe)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn load_mode(&self) -> LoadMode {
        self.load_mode
    }

    pub fn entry_point(&self) -> u32 {
        self.optional.address_of_entry_point
    }

    pub fn image_base(&self) -> u64 {
        self.optional.image_base
    }

    pub fn section_alignment(&self) -> u32 {
        self.optional.section_alignment
    }

    pub fn file_alignment(&self) -> u32 {
        self.optional.file_alignment
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == name)
    }

    pub fn imports(&self) -> &HashMap<String, Vec<ImportedFunction>> {
        &self.imports
    }

    /// Resolves an RVA to its physical file offset through the first section
    /// whose virtual range contains it. `None` for headers-only or otherwise
    /// unmapped addresses.
    pub fn rva_to_raw(&self, rva: u32) -> Option<u32> {
        self.section_containing(rva).map(|section| {
            section.header.pointer_to_raw_data + (rva - section.header.virtual_address)
        })
    }

    fn section_containing(&self, rva: u32) -> Option<&Section> {
        self.sections.iter().find(|section| {
            let header = &section.header;
            rva >= header.virtual_address
                && rva <= header.virtual_address + header.virtual_size
        })
    }

    /// Reads `size` bytes at `rva` into a fresh buffer with its cursor at 0.
    pub fn load_region(&mut self, rva: u32, size: usize) -> Result<ByteBuffer> {
        let raw = self.rva_to_raw(rva).ok_or(Error::UnmappedRva(rva))?;

        let saved = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(u64::from(raw)))?;

        let mut buffer = ByteBuffer::allocate(size)?;
        let outcome = self.file.read_exact(buffer.as_mut_slice());

        self.file.seek(SeekFrom::Start(saved))?;
        outcome?;

        Ok(buffer)
    }

    /// Writes the buffer's full capacity at `rva`.
    pub fn write_region(&mut self, rva: u32, buffer: &ByteBuffer) -> Result<()> {
        self.write_region_bytes(rva, buffer.as_slice())
    }

    /// Writes only the bytes up to the buffer's cursor at `rva`.
    pub fn write_region_pos(&mut self, rva: u32, buffer: &ByteBuffer) -> Result<()> {
        self.write_region_bytes(rva, buffer.written())
    }

    fn write_region_bytes(&mut self, rva: u32, bytes: &[u8]) -> Result<()> {
        let header = self
            .section_containing(rva)
            .ok_or(Error::UnmappedRva(rva))?
            .header;

        let raw = header.pointer_to_raw_data + (rva - header.virtual_address);
        let section_end = u64::from(header.pointer_to_raw_data) + u64::from(header.size_of_raw_data);

        if u64::from(raw) + bytes.len() as u64 > section_end {
            return Err(Error::WriteOutOfRange {
                rva,
                len: bytes.len(),
            });
        }

        let saved = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(u64::from(raw)))?;

        let outcome = self.file.write_all(bytes);

        self.file.seek(SeekFrom::Start(saved))?;
        outcome?;

        Ok(())
    }

    /// Appends a code section: descriptor placed after the existing table
    /// entries, raw data zero-filled at end-of-file, headers updated and
    /// flushed. The in-memory section map picks the section up immediately.
    pub fn add_section(&mut self, name: &str, size: u32) -> Result<Section> {
        let alignment = self.optional.section_alignment;
        if size < alignment {
            return Err(Error::SectionTooSmall { size, alignment });
        }

        if name.is_empty() || name.len() > SECTION_NAME_SIZE {
            return Err(Error::SectionName(name.to_string()));
        }

        let previous = match self.sections.last() {
            Some(section) => section.header,
            None => return Err(Error::SectionTableFull),
        };

        let table_offset = self.section_table_offset();
        let slot = table_offset + u64::from(self.file_header.number_of_sections) * SECTION_HEADER_SIZE as u64;

        // The descriptor has to fit in the header area in front of the first
        // section's raw data.
        if slot + SECTION_HEADER_SIZE as u64 > u64::from(self.optional.size_of_headers) {
            return Err(Error::SectionTableFull);
        }

        let mut name_bytes = [0u8; SECTION_NAME_SIZE];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());

        let header = SectionHeader {
            name: name_bytes,
            virtual_size: NEW_SECTION_VIRTUAL_SIZE,
            virtual_address: previous.virtual_address + alignment,
            size_of_raw_data: size,
            pointer_to_raw_data: previous.pointer_to_raw_data + previous.size_of_raw_data,
            characteristics: SECTION_CODE_EXECUTE_READ,
        };

        let saved = self.file.stream_position()?;

        self.file.seek(SeekFrom::Start(slot))?;
        self.file.write_all(&header.to_bytes())?;

        self.file_header.number_of_sections += 1;
        self.optional.size_of_image =
            align_up(header.virtual_address + header.virtual_size, alignment);

        let nt_offset = u64::from(self.dos.e_lfanew);
        self.file.seek(SeekFrom::Start(nt_offset + NUMBER_OF_SECTIONS_OFFSET))?;
        self.file
            .write_all(&self.file_header.number_of_sections.to_le_bytes())?;
        self.file.seek(SeekFrom::Start(nt_offset + SIZE_OF_IMAGE_OFFSET))?;
        self.file
            .write_all(&self.optional.size_of_image.to_le_bytes())?;

        self.file.seek(SeekFrom::End(0))?;
        let zeros = [0u8; 0x1000];
        let mut remaining = size as usize;
        while remaining > 0 {
            let chunk = remaining.min(zeros.len());
            self.file.write_all(&zeros[..chunk])?;
            remaining -= chunk;
        }
        self.file_size += u64::from(size);

        self.file.seek(SeekFrom::Start(saved))?;

        let unique = self.dedup_name(name.to_string());
        let section = Section {
            name: unique,
            header,
        };
        self.sections.push(section.clone());

        Ok(section)
    }

    fn section_table_offset(&self) -> u64 {
        u64::from(self.dos.e_lfanew)
            + 4
            + FILE_HEADER_SIZE as u64
            + u64::from(self.file_header.size_of_optional_header)
    }

    fn dedup_name(&self, name: String) -> String {
        if !self.sections.iter().any(|section| section.name == name) {
            return name;
        }

        let mut index = 2usize;
        loop {
            let candidate = format!("{name}#{index}");
            if !self.sections.iter().any(|section| section.name == candidate) {
                return candidate;
            }
            index += 1;
        }
    }

    fn load_sections(&mut self) -> Result<()> {
        let saved = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(self.section_table_offset()))?;

        let mut loaded = Vec::new();

        for _ in 0..self.file_header.number_of_sections {
            let mut bytes = [0u8; SECTION_HEADER_SIZE];
            self.file.read_exact(&mut bytes)?;
            let header = SectionHeader::parse(&bytes);

            // Uninitialized-data sections have no raw backing and cannot
            // take part in file-offset resolution.
            if header.pointer_to_raw_data == 0 {
                continue;
            }

            loaded.push(header);
        }

        self.file.seek(SeekFrom::Start(saved))?;

        for header in loaded {
            let name = self.dedup_name(header.name_str());
            self.sections.push(Section { name, header });
        }

        Ok(())
    }

    fn load_imports(&mut self) -> Result<()> {
        let directory = self.optional.import_directory();
        if directory.virtual_address == 0 {
            return Ok(());
        }

        let descriptors_raw = self
            .rva_to_raw(directory.virtual_address)
            .ok_or(Error::UnmappedRva(directory.virtual_address))?;

        let saved = self.file.stream_position()?;

        for index in 0u64.. {
            self.file.seek(SeekFrom::Start(
                u64::from(descriptors_raw) + index * IMPORT_DESCRIPTOR_SIZE as u64,
            ))?;

            let mut descriptor = [0u8; IMPORT_DESCRIPTOR_SIZE];
            self.file.read_exact(&mut descriptor)?;

            let original_first_thunk = headers::read_u32(&descriptor, 0);
            let name_rva = headers::read_u32(&descriptor, 12);

            if name_rva == 0 {
                break;
            }

            let dll_name = match self.rva_to_raw(name_rva) {
                Some(raw) => self.read_cstring(raw)?,
                None => break,
            };

            let functions = self.read_thunks(original_first_thunk)?;
            self.imports.insert(dll_name, functions);
        }

        self.file.seek(SeekFrom::Start(saved))?;

        Ok(())
    }

    fn read_thunks(&mut self, thunk_rva: u32) -> Result<Vec<ImportedFunction>> {
        let mut functions = Vec::new();

        let raw = match self.rva_to_raw(thunk_rva) {
            Some(raw) if thunk_rva != 0 => raw,
            _ => return Ok(functions),
        };

        let (entry_size, ordinal_flag) = match self.arch {
            Arch::X86 => (4u64, 1u64 << 31),
            Arch::X64 => (8u64, 1u64 << 63),
        };

        for index in 0u64.. {
            self.file
                .seek(SeekFrom::Start(u64::from(raw) + index * entry_size))?;

            let entry = match self.arch {
                Arch::X86 => {
                    let mut bytes = [0u8; 4];
                    self.file.read_exact(&mut bytes)?;
                    u64::from(u32::from_le_bytes(bytes))
                }
                Arch::X64 => {
                    let mut bytes = [0u8; 8];
                    self.file.read_exact(&mut bytes)?;
                    u64::from_le_bytes(bytes)
                }
            };

            if entry == 0 {
                break;
            }

            // Ordinal imports carry no name; nothing to record.
            if entry & ordinal_flag != 0 {
                continue;
            }

            let hint_name_rva = (entry & 0x7FFF_FFFF) as u32;
            let Some(name_raw) = self.rva_to_raw(hint_name_rva) else {
                break;
            };

            // Skip the two hint bytes in front of the name.
            let name = self.read_cstring(name_raw + 2)?;
            functions.push(ImportedFunction { name, rva: 0 });
        }

        Ok(functions)
    }

    fn read_cstring(&mut self, raw: u32) -> Result<String> {
        self.file.seek(SeekFrom::Start(u64::from(raw)))?;

        let mut bytes = Vec::new();
        let mut chunk = [0u8; 64];

        'outer: loop {
            let count = self.file.read(&mut chunk)?;
            if count == 0 {
                break;
            }

            for &byte in &chunk[..count] {
                if byte == 0 {
                    break 'outer;
                }
                bytes.push(byte);
                if bytes.len() > MAX_IMPORT_NAME {
                    return Err(Error::ImportNameTooLong(MAX_IMPORT_NAME));
                }
            }
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
