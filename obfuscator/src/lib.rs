pub mod buffer;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod gadgets;
pub mod keys;
pub mod pe;
pub mod translate;
pub mod vcode;

use std::ffi::{c_char, CStr};
use std::path::Path;

use crate::engine::{Engine, Options, Region};
use crate::error::Error;
use crate::pe::{LoadMode, PeFile};

/// Request record for the shared-library entry point.
#[repr(C, packed)]
pub struct ObfuscateQuery {
    /// Path of the PE to rewrite in place.
    pub file_path: *const c_char,
    /// Path of the raw interpreter image.
    pub vm_path: *const c_char,
    /// RVA of the code region to virtualize.
    pub region: usize,
    /// Size of the region in bytes.
    pub region_size: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfuscateStatus {
    Success = 0,
    InvalidPath,
    InvalidFile,
    VmNotFound,
    BufferTooSmall,
    InvalidFunctionAddress,
}

/// C ABI entry point mirroring the command-line tool for a single region.
///
/// # Safety
///
/// `query` must point to a valid [`ObfuscateQuery`] whose string fields are
/// NUL-terminated and live for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn obfuscate(query: *const ObfuscateQuery) -> ObfuscateStatus {
    let Some(query) = (unsafe { query.as_ref() }) else {
        return ObfuscateStatus::InvalidPath;
    };

    // copy the pointers out of the packed record before use
    let file_ptr = query.file_path;
    let vm_ptr = query.vm_path;
    if file_ptr.is_null() || vm_ptr.is_null() {
        return ObfuscateStatus::InvalidPath;
    }

    let Ok(file_path) = (unsafe { CStr::from_ptr(file_ptr) }).to_str() else {
        return ObfuscateStatus::InvalidPath;
    };
    let Ok(vm_path) = (unsafe { CStr::from_ptr(vm_ptr) }).to_str() else {
        return ObfuscateStatus::VmNotFound;
    };

    let region = Region {
        rva: query.region as u32,
        size: query.region_size,
    };

    run(Path::new(file_path), Path::new(vm_path), region)
}

fn run(file_path: &Path, vm_path: &Path, region: Region) -> ObfuscateStatus {
    if !file_path.is_file() {
        return ObfuscateStatus::InvalidPath;
    }

    let Ok(vm_image) = std::fs::read(vm_path) else {
        return ObfuscateStatus::VmNotFound;
    };

    let pe = match PeFile::load(file_path, LoadMode::Full) {
        Ok(pe) => pe,
        Err(_) => return ObfuscateStatus::InvalidFile,
    };

    let outcome = Engine::new(pe, &vm_image, vec![region], Options::default())
        .and_then(|mut engine| engine.execute());

    match outcome {
        Ok(()) => ObfuscateStatus::Success,
        Err(Error::UnmappedRva(_)) => ObfuscateStatus::InvalidFunctionAddress,
        Err(
            Error::BufferFull
            | Error::Allocation(_)
            | Error::WriteOutOfRange { .. }
            | Error::SectionTooSmall { .. }
            | Error::VipOutOfRange(_),
        ) => ObfuscateStatus::BufferTooSmall,
        Err(_) => ObfuscateStatus::InvalidFile,
    }
}
