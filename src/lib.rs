//! # Dhara
//!
//! Dhara (धारा - "stream" in Sanskrit) reads remote HTTP(S) and FTP resources
//! like regular files on disk, without ever asking the server for byte
//! ranges. One plain GET streams the body; a ring buffer couples the network
//! to your reads, and the first megabyte is kept around so header sniffing
//! and small rewinds cost nothing.
//!
//! Use it for resources served by dumb or dynamic endpoints: no
//! `Accept-Ranges` needed, no `Content-Length` needed. If your server does
//! support range requests and you need efficient random access over large
//! files, a range-based reader is the better tool; this crate is for the
//! streaming case.
//!
//! ## Basic usage
//!
//! ```no_run
//! use dhara::{open, File};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut file = open("/vsicurl_streaming/https://example.com/data.bin", "r")?;
//!
//! let mut buffer = vec![0u8; 1024];
//! let bytes_read = file.read(&mut buffer)?;
//!
//! file.seek(1000)?;
//!
//! if let Some(size) = file.size() {
//!     println!("File size: {} bytes", size);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The `/vsicurl_streaming/` prefix is optional; bare `http://`, `https://`
//! and `ftp://` URLs work too.
//!
//! ## What it does
//!
//! When you read from a remote file, it:
//! - Starts a single streaming transfer on a worker thread and hands you
//!   bytes as they arrive, through a bounded in-memory ring buffer
//! - Remembers the first chunk of the file (1MB by default), so seeking back
//!   to the start never reopens the connection
//! - Handles forward seeks by skipping through the stream, and backward
//!   seeks by restarting it
//! - Learns the file size from `Content-Length` when it can be trusted, or
//!   from the stream's actual length once it ends, and shares what it
//!   learned with every other handle on the same URL
//! - Follows redirects and negotiates gzip when the transport supports it
//!
//! ## Stat and existence
//!
//! ```no_run
//! use dhara::{FileSystem, StreamFileSystem};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fs = StreamFileSystem::new();
//! let stat = fs.stat("/vsicurl_streaming/https://example.com/data.bin", true)?;
//! println!("{} bytes, directory: {}", stat.size, stat.is_directory);
//! # Ok(())
//! # }
//! ```
//!
//! Existence and size answers are cached per URL for the life of the
//! process, so repeated stats of the same resource don't re-probe it.
//!
//! ## Tuning the behavior
//!
//! ```no_run
//! use dhara::{FileSystem, StreamFileSystem};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fs = StreamFileSystem::builder()
//!     .ring_capacity(4 * 1024 * 1024)   // buffer up to 4MB of stream
//!     .cache_limit(2 * 1024 * 1024)     // remember the first 2MB
//!     .enable_gzip(false)               // never negotiate gzip
//!     .allowed_extensions([".tif"])     // everything else doesn't exist
//!     .build();
//!
//! let mut file = fs.open("https://example.com/large-file.tif", "r")?;
//! # Ok(())
//! # }
//! ```
//!
//! The environment keys the original GDAL handler understood are honored by
//! `StreamFileSystemBuilder::from_env()`: `CPL_VSIL_CURL_ALLOWED_EXTENSIONS`,
//! `CPL_VSIL_CURL_SLOW_GET_SIZE`, `CPL_CURL_GZIP`, `VSI_CACHE`,
//! `VSI_CACHE_SIZE`, `GDAL_HTTP_PROXY`, `GDAL_HTTP_PROXYUSERPWD` and
//! `GDAL_PROXY_AUTH`.
//!
//! ## Using with standard I/O libraries
//!
//! `open()` returns `Box<dyn File>`; wrap it in [`FileAdapter`] when a
//! library wants `std::io::Read` and `Seek`.
//!
//! ## Some things to know
//!
//! Reads are strictly in stream order under the hood. Seeking forward skips
//! (and discards) the intervening bytes; seeking backward past the cached
//! prefix restarts the whole transfer. If your access pattern is mostly
//! random, this is the wrong crate.
//!
//! The handle is read-only. Opening with any write mode fails, and `write`
//! on a handle always refuses.
//!
//! A `Content-Length` on a gzip-encoded response counts compressed bytes, so
//! it is never taken as the file size; the size is learned from the decoded
//! stream instead.
//!
//! ## Thread safety
//!
//! The FileSystem can be shared between threads safely. Individual File
//! handles can be sent to other threads but shouldn't be used from multiple
//! threads at once.
//!
//! ## Feature flags
//!
//! - `curl` (default): use libcurl for HTTP and FTP
//! - `reqwest`: use reqwest instead of curl (don't enable both; no FTP)
//! - `capi`: build the C API

pub mod core;
pub mod http;
pub mod plug;

pub use core::*;
pub use http::*;
pub use plug::*;

#[cfg(feature = "capi")]
pub mod ffi;

use std::io::{self, Read, Seek, SeekFrom};

/// Bridges a boxed [`File`] to `std::io::{Read, Seek}`.
pub struct FileAdapter {
    inner: Box<dyn File>,
}

impl FileAdapter {
    pub fn new(file: Box<dyn File>) -> Self {
        Self { inner: file }
    }

    pub fn into_inner(self) -> Box<dyn File> {
        self.inner
    }
}

impl From<Box<dyn File>> for FileAdapter {
    fn from(file: Box<dyn File>) -> Self {
        Self::new(file)
    }
}

impl Read for FileAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(io::Error::other)
    }
}

impl Seek for FileAdapter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(offset) => {
                let current = self.inner.tell();
                if offset >= 0 {
                    current.saturating_add(offset as u64)
                } else {
                    current.saturating_sub(offset.unsigned_abs())
                }
            }
            SeekFrom::End(offset) => {
                let size = self.inner.size().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::Unsupported,
                        "Cannot seek from end without known file size",
                    )
                })?;

                if offset >= 0 {
                    size.saturating_add(offset as u64)
                } else {
                    size.saturating_sub(offset.unsigned_abs())
                }
            }
        };

        self.inner.seek(new_pos).map_err(io::Error::other)?;
        Ok(new_pos)
    }
}
