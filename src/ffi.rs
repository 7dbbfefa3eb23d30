use libc::size_t;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::slice;

use crate::{File, FileSystem, FsError};

#[repr(C)]
#[allow(non_camel_case_types)]
pub enum DharaErrorCode {
    DHARA_SUCCESS = 0,
    DHARA_NETWORK = 1,
    DHARA_PROTOCOL = 2,
    DHARA_IO = 3,
    DHARA_FILE_CLOSED = 4,
    DHARA_NOT_FOUND = 5,
    DHARA_READ_ONLY = 6,
    DHARA_UNSUPPORTED_PROTOCOL = 7,
    DHARA_INVALID_ARGUMENT = 8,
    DHARA_UNKNOWN = 99,
}

impl From<&FsError> for DharaErrorCode {
    fn from(err: &FsError) -> Self {
        match err {
            FsError::Network(_) => DharaErrorCode::DHARA_NETWORK,
            FsError::Protocol(_) => DharaErrorCode::DHARA_PROTOCOL,
            FsError::Io(_) => DharaErrorCode::DHARA_IO,
            FsError::FileClosed => DharaErrorCode::DHARA_FILE_CLOSED,
            FsError::NotFound(_) => DharaErrorCode::DHARA_NOT_FOUND,
            FsError::ReadOnly => DharaErrorCode::DHARA_READ_ONLY,
            FsError::UnsupportedProtocol(_) => DharaErrorCode::DHARA_UNSUPPORTED_PROTOCOL,
        }
    }
}

thread_local! {
    static LAST_ERROR: std::cell::RefCell<Option<CString>> = const { std::cell::RefCell::new(None) };
}

fn set_last_error(err: &FsError) {
    let error_msg = CString::new(err.to_string())
        .unwrap_or_else(|_| CString::new("Failed to format error message").unwrap());
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some(error_msg);
    });
}

fn invalid_argument(what: &str) -> FsError {
    FsError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, what))
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_arg<'a>(ptr: *const c_char, what: &str) -> Option<&'a str> {
    if ptr.is_null() {
        set_last_error(&invalid_argument(what));
        return None;
    }
    match unsafe { CStr::from_ptr(ptr) }.to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            set_last_error(&invalid_argument(what));
            None
        }
    }
}

/// Opaque streaming file handle
pub struct DharaFile {
    inner: Box<dyn File>,
}

/// Get the last error message for this thread
/// Returns NULL if no error
/// The returned string is valid until the next dhara call on this thread
#[unsafe(no_mangle)]
pub extern "C" fn dhara_last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(ptr::null())
    })
}

/// Open a streaming handle on a URL (with or without the
/// /vsicurl_streaming/ prefix)
/// Returns NULL on error, including when the resource does not exist
///
/// # Safety
/// >> url and mode must be valid null-terminated C strings
/// >> Caller must free the returned pointer with dhara_file_close()
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dhara_open_url(
    url: *const c_char,
    mode: *const c_char,
) -> *mut DharaFile {
    clear_last_error();

    let Some(url) = (unsafe { cstr_arg(url, "URL is null or not UTF-8") }) else {
        return ptr::null_mut();
    };
    let Some(mode) = (unsafe { cstr_arg(mode, "Mode is null or not UTF-8") }) else {
        return ptr::null_mut();
    };

    match crate::open(url, mode) {
        Ok(file) => Box::into_raw(Box::new(DharaFile { inner: file })),
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

/// Read up to size bytes from file into buffer
/// Returns number of bytes read (0 at end of stream), or -1 on error
///
/// # Safety
/// >> file must be a valid file handle
/// >> buffer must be valid for writes of at least size bytes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dhara_read(
    file: *mut DharaFile,
    buffer: *mut c_void,
    size: size_t,
) -> isize {
    clear_last_error();

    if file.is_null() || buffer.is_null() {
        set_last_error(&invalid_argument("Null pointer argument"));
        return -1;
    }

    let file_ref = unsafe { &mut *file };
    let buf = unsafe { slice::from_raw_parts_mut(buffer as *mut u8, size) };

    match file_ref.inner.read(buf) {
        Ok(n) => n as isize,
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Seek to absolute position in the stream
/// Returns 0 on success, error code on failure
///
/// # Safety
/// >> file must be a valid file handle
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dhara_seek(file: *mut DharaFile, pos: u64) -> c_int {
    clear_last_error();

    if file.is_null() {
        set_last_error(&invalid_argument("Null file pointer"));
        return DharaErrorCode::DHARA_INVALID_ARGUMENT as c_int;
    }

    let file_ref = unsafe { &mut *file };

    match file_ref.inner.seek(pos) {
        Ok(_) => DharaErrorCode::DHARA_SUCCESS as c_int,
        Err(e) => {
            let code = DharaErrorCode::from(&e);
            set_last_error(&e);
            code as c_int
        }
    }
}

/// Get current position in the stream
/// Returns current position, or 0 if file is invalid
///
/// # Safety
/// >> file must be a valid file handle
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dhara_tell(file: *const DharaFile) -> u64 {
    clear_last_error();

    if file.is_null() {
        set_last_error(&invalid_argument("Null file pointer"));
        return 0;
    }

    let file_ref = unsafe { &*file };
    file_ref.inner.tell()
}

/// Get the resource size, probing the server if necessary
/// Returns size, or 0 if not available
/// Sets has_size to 1 if a size is known, 0 otherwise
///
/// # Safety
/// >> file must be a valid file handle
/// >> has_size must be valid for writes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dhara_size(file: *const DharaFile, has_size: *mut c_int) -> u64 {
    clear_last_error();

    if file.is_null() || has_size.is_null() {
        if !has_size.is_null() {
            unsafe { *has_size = 0 };
        }
        set_last_error(&invalid_argument("Null pointer argument"));
        return 0;
    }

    let file_ref = unsafe { &*file };

    match file_ref.inner.size() {
        Some(size) => {
            unsafe { *has_size = 1 };
            size
        }
        None => {
            unsafe { *has_size = 0 };
            0
        }
    }
}

/// Check if at end of the stream
/// Returns 1 if EOF, 0 otherwise
///
/// # Safety
/// >> file must be a valid file handle
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dhara_eof(file: *const DharaFile) -> c_int {
    clear_last_error();

    if file.is_null() {
        return 0;
    }

    let file_ref = unsafe { &*file };
    if file_ref.inner.eof() { 1 } else { 0 }
}

/// Check whether a URL exists without keeping a handle open
/// Returns 1 if the resource exists, 0 otherwise
///
/// # Safety
/// >> url must be a valid null-terminated C string
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dhara_exists(url: *const c_char) -> c_int {
    clear_last_error();

    let Some(url) = (unsafe { cstr_arg(url, "URL is null or not UTF-8") }) else {
        return 0;
    };

    match crate::create(url).and_then(|fs| fs.stat(url, false)) {
        Ok(_) => 1,
        Err(FsError::NotFound(_)) => 0,
        Err(e) => {
            set_last_error(&e);
            0
        }
    }
}

/// Stat a URL: size (when size_out is non-NULL, probing the server) and
/// directory-ness (when is_directory_out is non-NULL)
/// Returns 0 on success, -1 when the resource is absent or on error
///
/// # Safety
/// >> url must be a valid null-terminated C string
/// >> size_out and is_directory_out may each be NULL or valid for writes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dhara_stat(
    url: *const c_char,
    size_out: *mut u64,
    is_directory_out: *mut c_int,
) -> c_int {
    clear_last_error();

    let Some(url) = (unsafe { cstr_arg(url, "URL is null or not UTF-8") }) else {
        return -1;
    };

    match crate::create(url).and_then(|fs| fs.stat(url, !size_out.is_null())) {
        Ok(stat) => {
            if !size_out.is_null() {
                unsafe { *size_out = stat.size };
            }
            if !is_directory_out.is_null() {
                unsafe { *is_directory_out = stat.is_directory as c_int };
            }
            0
        }
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Close a file and free its resources, stopping any transfer in flight
///
/// # Safety
/// >> file must be a valid file handle or NULL
/// >> file must not be used after this call
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dhara_file_close(file: *mut DharaFile) {
    if !file.is_null() {
        let mut file_box = unsafe { Box::from_raw(file) };
        file_box.inner.close();
    }
}

/// Get library version string
/// Returns pointer to static version string
#[unsafe(no_mangle)]
pub extern "C" fn dhara_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
