use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("allocation of {0} bytes failed")]
    Allocation(usize),

    #[error("buffer capacity exceeded")]
    BufferFull,

    #[error("file too small to hold PE headers")]
    FileTooSmall,

    #[error("invalid DOS signature")]
    BadDosMagic,

    #[error("e_lfanew does not point inside the file")]
    BadNtOffset,

    #[error("invalid PE signature")]
    BadPeSignature,

    #[error("unsupported machine type {0:#06x}")]
    UnsupportedMachine(u16),

    #[error("no section maps rva {0:#x}")]
    UnmappedRva(u32),

    #[error("write of {len} bytes at rva {rva:#x} crosses the section end")]
    WriteOutOfRange { rva: u32, len: usize },

    #[error("section size {size:#x} is below the section alignment {alignment:#x}")]
    SectionTooSmall { size: u32, alignment: u32 },

    #[error("section name '{0}' does not fit in 8 bytes")]
    SectionName(String),

    #[error("no room left in the header area for another section descriptor")]
    SectionTableFull,

    #[error("import name exceeds {0} bytes")]
    ImportNameTooLong(usize),

    #[error("p-code entry offset {0:#x} exceeds the 16-bit vip field")]
    VipOutOfRange(u64),

    #[error("code regions must be supplied as address/size pairs")]
    RegionPairs,
}
