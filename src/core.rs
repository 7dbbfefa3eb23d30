use std::io;

use thiserror::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Path prefix recognised by [`create`] in front of the remote URL.
pub const STREAMING_PREFIX: &str = "/vsicurl_streaming/";

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File is closed")]
    FileClosed,

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Only read access is supported")]
    ReadOnly,

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// What `FileSystem::stat` reports about a remote path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub is_directory: bool,
}

/// Abstract file interface
pub trait File: Send {
    /// Read up to buf.len() bytes into buf.
    /// Returns number of bytes read (0 = EOF).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Seek to absolute position.
    fn seek(&mut self, pos: u64) -> Result<()>;

    /// Get current position.
    fn tell(&self) -> u64;

    /// Check if at end of file.
    fn eof(&self) -> bool;

    /// Get file size if available.
    /// Returns None for streams whose length has not been learned yet.
    fn size(&self) -> Option<u64> {
        None
    }

    /// Remote handles are read-only; every backend refuses this.
    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(FsError::ReadOnly)
    }

    /// Nothing is ever buffered for writing, so this is a no-op.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the file (optional, called automatically on drop).
    fn close(&mut self) {}
}

pub trait FileSystem: Send + Sync {
    fn open(&self, path: &str, mode: &str) -> Result<Box<dyn File>>;

    /// Stat a remote path without keeping a handle. `want_size` asks for a
    /// size probe; without it only existence and directory-ness are reported.
    fn stat(&self, path: &str, want_size: bool) -> Result<FileStat>;
}

/// Strip the `/vsicurl_streaming/` prefix, leaving the bare URL.
pub(crate) fn strip_streaming_prefix(path: &str) -> &str {
    path.strip_prefix(STREAMING_PREFIX).unwrap_or(path)
}

fn is_supported_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://") || url.starts_with("ftp://")
}

/// Create a filesystem for the given path. Accepts `/vsicurl_streaming/<url>`
/// as well as a bare `http://`, `https://` or `ftp://` URL.
pub fn create(path: &str) -> Result<Box<dyn FileSystem>> {
    if is_supported_url(strip_streaming_prefix(path)) {
        Ok(Box::new(crate::http::StreamFileSystem::new()))
    } else {
        Err(FsError::UnsupportedProtocol(path.to_string()))
    }
}

/// Open a file directly.
pub fn open(path: &str, mode: &str) -> Result<Box<dyn File>> {
    let fs = create(path)?;
    fs.open(path, mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_stripped_once() {
        assert_eq!(
            strip_streaming_prefix("/vsicurl_streaming/http://host/a.tif"),
            "http://host/a.tif"
        );
        assert_eq!(strip_streaming_prefix("ftp://host/b"), "ftp://host/b");
    }

    #[test]
    fn create_rejects_unknown_schemes() {
        assert!(create("/vsicurl_streaming/http://host/x").is_ok());
        assert!(create("https://host/x").is_ok());
        assert!(matches!(
            create("file:///etc/passwd"),
            Err(FsError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            create("/vsicurl_streaming/gopher://host"),
            Err(FsError::UnsupportedProtocol(_))
        ));
    }
}
