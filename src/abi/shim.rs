//! C-compatible function surface over the parser adapter
//!
//! The minimum stable entry points per the ABI contract: `init`, `free`,
//! `parse`, `version`. All results cross the boundary by value; no pointers
//! outlive a call. Null-pointer inputs to `free` are no-ops; `parse` with a
//! null handle returns status `null-pointer`.

use crate::abi::{ContentKind, OutputFormat, ParseResult, ParseStatus};
use crate::parser::ParserAdapter;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::Path;

/// Create a parser adapter handle. Asserts the ABI record layout first.
///
/// Returns null if adapter construction fails; the caller treats that as a
/// catastrophic startup error.
#[no_mangle]
pub extern "C" fn docex_init() -> *mut ParserAdapter {
    crate::abi::assert_abi_layout();
    match ParserAdapter::new() {
        Ok(adapter) => Box::into_raw(Box::new(adapter)),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Free an adapter handle. Null is a no-op.
///
/// # Safety
///
/// `handle` must be null or a pointer previously returned by [`docex_init`]
/// that has not been freed.
#[no_mangle]
pub unsafe extern "C" fn docex_free(handle: *mut ParserAdapter) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Parse one document, returning the fixed-layout result by value.
///
/// # Safety
///
/// `input_path` and `output_path` must be valid NUL-terminated strings;
/// `handle` must be null or a live adapter pointer.
#[no_mangle]
pub unsafe extern "C" fn docex_parse(
    handle: *mut ParserAdapter,
    input_path: *const c_char,
    output_path: *const c_char,
    output_format: i32,
    stage_mask: u64,
) -> ParseResult {
    if handle.is_null() {
        return ParseResult::failure(ParseStatus::NullPointer, ContentKind::Unknown, "null handle");
    }
    if input_path.is_null() || output_path.is_null() {
        return ParseResult::failure(ParseStatus::NullPointer, ContentKind::Unknown, "null path");
    }
    let format = match OutputFormat::from_i32(output_format) {
        Some(f) => f,
        None => {
            return ParseResult::failure(
                ParseStatus::Error,
                ContentKind::Unknown,
                "invalid output format",
            )
        }
    };
    let input = match CStr::from_ptr(input_path).to_str() {
        Ok(s) => s,
        Err(_) => {
            return ParseResult::failure(
                ParseStatus::Error,
                ContentKind::Unknown,
                "input path is not UTF-8",
            )
        }
    };
    let output = match CStr::from_ptr(output_path).to_str() {
        Ok(s) => s,
        Err(_) => {
            return ParseResult::failure(
                ParseStatus::Error,
                ContentKind::Unknown,
                "output path is not UTF-8",
            )
        }
    };
    let adapter = &mut *handle;
    adapter.parse_detected(Path::new(input), Path::new(output), format, crate::abi::StageMask(stage_mask))
}

/// Version string of the adapter layer. Static storage, never freed.
#[no_mangle]
pub extern "C" fn docex_version() -> *const c_char {
    static VERSION: &[u8] = concat!("docex ", env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_null_is_noop() {
        unsafe { docex_free(std::ptr::null_mut()) };
    }

    #[test]
    fn parse_null_handle_returns_null_pointer_status() {
        let r = unsafe {
            docex_parse(
                std::ptr::null_mut(),
                b"in\0".as_ptr() as *const c_char,
                b"out\0".as_ptr() as *const c_char,
                1,
                0,
            )
        };
        assert_eq!(r.status(), Some(ParseStatus::NullPointer));
    }

    #[test]
    fn version_is_static_nul_terminated() {
        let v = docex_version();
        let s = unsafe { CStr::from_ptr(v) }.to_str().unwrap();
        assert!(s.starts_with("docex "));
    }

    #[test]
    fn init_parse_free_round_trip() {
        let handle = docex_init();
        assert!(!handle.is_null());
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("missing.pdf");
        let output = dir.path().join("out.json");
        let input_c = std::ffi::CString::new(input.to_str().unwrap()).unwrap();
        let output_c = std::ffi::CString::new(output.to_str().unwrap()).unwrap();
        let r = unsafe { docex_parse(handle, input_c.as_ptr(), output_c.as_ptr(), 1, 0) };
        assert_eq!(r.status(), Some(ParseStatus::FileNotFound));
        unsafe { docex_free(handle) };
    }
}
