#![allow(dead_code)]
use crate::core::{FsError, Result};
use crate::http::StreamConfig;
use std::sync::Arc;

/// Receives one transfer's response as it arrives. Implemented by the
/// streaming engine; driven by a transport (or by a test double).
pub trait TransferSink {
    /// One response header line, terminator included. Return false to abort.
    fn on_header(&mut self, line: &[u8]) -> bool;

    /// One chunk of (already content-decoded) body bytes. Returns the number
    /// of bytes consumed; anything short of `chunk.len()` aborts the transfer.
    fn on_body(&mut self, chunk: &[u8]) -> usize;
}

/// How a streaming transfer ended, when the transport itself did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The body was delivered to its natural end.
    Completed,
    /// The sink refused further bytes and the transfer was cut short.
    Aborted,
}

/// What a metadata probe learned about a URL.
#[derive(Clone, Debug, Default)]
pub struct ProbeReply {
    pub status: u16,
    /// Advertised content length, when the transport could report one.
    pub content_length: Option<u64>,
    /// Final URL after any redirects were followed.
    pub effective_url: Option<String>,
    /// The response carried `Content-Encoding: gzip`, so `content_length`
    /// counts compressed bytes and must not be taken as the file size.
    pub gzip_encoded: bool,
    /// Raw header text as collected. FTP-style responses surface the size
    /// here as a leading `Content-Length: <n>` line.
    pub header_text: Vec<u8>,
}

/// Blocking transport able to perform one unbounded body transfer and one
/// header-only metadata probe.
pub trait StreamingTransport: Send + Sync {
    /// Single GET for the whole resource; drives `sink` until the body ends,
    /// the sink aborts, or the transport fails. `gzip` asks for on-the-fly
    /// gzip negotiation when the transport supports it.
    fn stream(&self, url: &str, gzip: bool, sink: &mut dyn TransferSink)
    -> Result<TransferOutcome>;

    /// Header-only probe. `head` selects a HEAD request; otherwise a GET is
    /// issued and interrupted as soon as the final response's headers end
    /// (redirect responses are followed through).
    fn probe(&self, url: &str, head: bool) -> Result<ProbeReply>;
}

#[cfg(all(not(feature = "reqwest"), not(feature = "curl")))]
compile_error!("Enable either `curl` (default) or `reqwest` feature.");

pub(crate) fn build_default_transport(config: &StreamConfig) -> Arc<dyn StreamingTransport> {
    #[cfg(feature = "reqwest")]
    {
        Arc::new(ReqwestStreamingTransport::new(config))
    }
    #[cfg(all(not(feature = "reqwest"), feature = "curl"))]
    {
        Arc::new(CurlStreamingTransport::new(config))
    }
}

/// `HTTP/1.0 <code>` / `HTTP/1.1 <code>` status line → code.
pub(crate) fn parse_status_line(line: &[u8]) -> Option<u16> {
    let rest = line
        .strip_prefix(b"HTTP/1.0 ")
        .or_else(|| line.strip_prefix(b"HTTP/1.1 "))?;
    parse_u64_prefix(rest).map(|v| v.min(u16::MAX as u64) as u16)
}

/// `Name: value` line → trimmed value, name matched case-insensitively.
pub(crate) fn header_value<'a>(line: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let colon = line.iter().position(|&b| b == b':')?;
    if !line[..colon].eq_ignore_ascii_case(name.as_bytes()) {
        return None;
    }
    let mut value = &line[colon + 1..];
    while value.first().is_some_and(|b| b.is_ascii_whitespace()) {
        value = &value[1..];
    }
    while value.last().is_some_and(|b| b.is_ascii_whitespace()) {
        value = &value[..value.len() - 1];
    }
    Some(value)
}

pub(crate) fn parse_u64_prefix(bytes: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut digits = 0usize;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
        digits += 1;
    }
    (digits > 0).then_some(value)
}

/// FTP probes report the size as a literal `Content-Length: <n>` line at the
/// very start of the collected header text.
pub(crate) fn parse_ftp_content_length(header_text: &[u8]) -> Option<u64> {
    header_text
        .strip_prefix(b"Content-Length: ")
        .and_then(parse_u64_prefix)
}

pub(crate) fn header_text_mentions_gzip(header_text: &[u8]) -> bool {
    header_text
        .split(|&b| b == b'\n')
        .any(|line| matches!(header_value(line, "Content-Encoding"), Some(v) if v.starts_with(b"gzip")))
}

#[cfg(all(not(feature = "reqwest"), feature = "curl"))]
mod curl_transport {
    use super::*;
    use std::cell::RefCell;
    use std::sync::OnceLock;
    use std::time::Duration;

    pub(crate) struct CurlStreamingTransport {
        connect_timeout: Duration,
        proxy: Option<String>,
        proxy_userpwd: Option<String>,
        proxy_auth: Option<String>,
    }

    fn curl_has_zlib() -> bool {
        static HAS_ZLIB: OnceLock<bool> = OnceLock::new();
        *HAS_ZLIB.get_or_init(|| curl::Version::get().feature_libz())
    }

    fn net_err(e: curl::Error) -> FsError {
        FsError::Network(e.to_string())
    }

    impl CurlStreamingTransport {
        pub(crate) fn new(config: &StreamConfig) -> Self {
            Self {
                connect_timeout: config.connect_timeout,
                proxy: config.proxy.clone(),
                proxy_userpwd: config.proxy_userpwd.clone(),
                proxy_auth: config.proxy_auth.clone(),
            }
        }

        fn configure(&self, easy: &mut curl::easy::Easy, url: &str) -> Result<()> {
            easy.url(url).map_err(net_err)?;
            easy.follow_location(true).map_err(net_err)?;
            easy.signal(false).map_err(net_err)?;
            easy.connect_timeout(self.connect_timeout).map_err(net_err)?;
            if let Some(proxy) = &self.proxy {
                easy.proxy(proxy).map_err(net_err)?;
            }
            if let Some(userpwd) = &self.proxy_userpwd
                && let Some((user, pwd)) = userpwd.split_once(':')
            {
                easy.proxy_username(user).map_err(net_err)?;
                easy.proxy_password(pwd).map_err(net_err)?;
            }
            if let Some(auth) = &self.proxy_auth {
                let mut flags = curl::easy::Auth::new();
                match auth.to_ascii_uppercase().as_str() {
                    "BASIC" => flags.basic(true),
                    "NTLM" => flags.ntlm(true),
                    "DIGEST" => flags.digest(true),
                    _ => flags.basic(true).digest(true).ntlm(true),
                };
                easy.proxy_auth(&flags).map_err(net_err)?;
            }
            Ok(())
        }
    }

    impl StreamingTransport for CurlStreamingTransport {
        fn stream(
            &self,
            url: &str,
            gzip: bool,
            sink: &mut dyn TransferSink,
        ) -> Result<TransferOutcome> {
            let mut easy = curl::easy::Easy::new();
            self.configure(&mut easy, url)?;
            if gzip && curl_has_zlib() {
                easy.accept_encoding("gzip").map_err(net_err)?;
            }

            let result = {
                let sink = RefCell::new(sink);
                let mut transfer = easy.transfer();
                transfer
                    .header_function(|line| sink.borrow_mut().on_header(line))
                    .map_err(net_err)?;
                transfer
                    .write_function(|chunk| Ok(sink.borrow_mut().on_body(chunk)))
                    .map_err(net_err)?;
                transfer.perform()
            };

            match result {
                Ok(()) => Ok(TransferOutcome::Completed),
                Err(e) if e.is_write_error() => Ok(TransferOutcome::Aborted),
                Err(e) => Err(net_err(e)),
            }
        }

        fn probe(&self, url: &str, head: bool) -> Result<ProbeReply> {
            let mut easy = curl::easy::Easy::new();
            self.configure(&mut easy, url)?;

            let header_text = RefCell::new(Vec::<u8>::new());
            let result = if head {
                // Headers (and the FTP pseudo-header) arrive through the
                // write callback when the body is suppressed.
                easy.nobody(true).map_err(net_err)?;
                easy.show_header(true).map_err(net_err)?;
                let mut transfer = easy.transfer();
                transfer
                    .write_function(|chunk| {
                        header_text.borrow_mut().extend_from_slice(chunk);
                        Ok(chunk.len())
                    })
                    .map_err(net_err)?;
                transfer.perform()
            } else {
                // GET for servers that reject HEAD: cut the transfer at the
                // end of the final response's headers.
                let code = RefCell::new(0u16);
                let mut transfer = easy.transfer();
                transfer
                    .header_function(|line| {
                        if let Some(parsed) = parse_status_line(line) {
                            *code.borrow_mut() = parsed;
                        }
                        header_text.borrow_mut().extend_from_slice(line);
                        let end_of_header = line.first().is_none_or(|&b| b == b'\r' || b == b'\n');
                        !(end_of_header && !matches!(*code.borrow(), 301 | 302))
                    })
                    .map_err(net_err)?;
                transfer.write_function(|_| Ok(0)).map_err(net_err)?;
                transfer.perform()
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_write_error() => {}
                Err(e) => return Err(net_err(e)),
            }

            let header_text = header_text.into_inner();
            let gzip_encoded = header_text_mentions_gzip(&header_text);
            let status = easy.response_code().map_err(net_err)? as u16;
            let content_length = easy
                .content_length_download()
                .ok()
                .filter(|v| *v >= 0.0)
                .map(|v| v as u64);
            let effective_url = easy
                .effective_url()
                .ok()
                .flatten()
                .map(|u| u.to_string());

            Ok(ProbeReply {
                status,
                content_length,
                effective_url,
                gzip_encoded,
                header_text,
            })
        }
    }
}

#[cfg(all(not(feature = "reqwest"), feature = "curl"))]
pub(crate) use curl_transport::CurlStreamingTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use super::*;
    use std::io::Read;
    use std::time::Duration;

    pub(crate) struct ReqwestStreamingTransport {
        connect_timeout: Duration,
        proxy: Option<String>,
        proxy_userpwd: Option<String>,
    }

    fn net_err(e: reqwest::Error) -> FsError {
        FsError::Network(e.to_string())
    }

    impl ReqwestStreamingTransport {
        pub(crate) fn new(config: &StreamConfig) -> Self {
            Self {
                connect_timeout: config.connect_timeout,
                proxy: config.proxy.clone(),
                proxy_userpwd: config.proxy_userpwd.clone(),
            }
        }

        fn client(&self, gzip: bool) -> Result<reqwest::blocking::Client> {
            let mut builder = reqwest::blocking::Client::builder()
                .connect_timeout(self.connect_timeout)
                .timeout(None::<Duration>)
                .gzip(gzip);
            if let Some(url) = &self.proxy {
                let mut proxy = reqwest::Proxy::all(url).map_err(net_err)?;
                if let Some(userpwd) = &self.proxy_userpwd
                    && let Some((user, pwd)) = userpwd.split_once(':')
                {
                    proxy = proxy.basic_auth(user, pwd);
                }
                builder = builder.proxy(proxy);
            }
            builder.build().map_err(net_err)
        }

        /// The engine consumes raw header lines; rebuild them from the final
        /// response (reqwest has already followed any redirects).
        fn replay_headers(
            resp: &reqwest::blocking::Response,
            sink: &mut dyn TransferSink,
        ) -> bool {
            let status = resp.status();
            let status_line = format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            );
            if !sink.on_header(status_line.as_bytes()) {
                return false;
            }
            for (name, value) in resp.headers() {
                let mut line = Vec::with_capacity(name.as_str().len() + value.len() + 4);
                line.extend_from_slice(name.as_str().as_bytes());
                line.extend_from_slice(b": ");
                line.extend_from_slice(value.as_bytes());
                line.extend_from_slice(b"\r\n");
                if !sink.on_header(&line) {
                    return false;
                }
            }
            sink.on_header(b"\r\n")
        }
    }

    impl StreamingTransport for ReqwestStreamingTransport {
        fn stream(
            &self,
            url: &str,
            gzip: bool,
            sink: &mut dyn TransferSink,
        ) -> Result<TransferOutcome> {
            let mut resp = self.client(gzip)?.get(url).send().map_err(net_err)?;
            if !Self::replay_headers(&resp, sink) {
                return Ok(TransferOutcome::Aborted);
            }
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = resp
                    .read(&mut buf)
                    .map_err(|e| FsError::Network(e.to_string()))?;
                if n == 0 {
                    return Ok(TransferOutcome::Completed);
                }
                if sink.on_body(&buf[..n]) != n {
                    return Ok(TransferOutcome::Aborted);
                }
            }
        }

        fn probe(&self, url: &str, head: bool) -> Result<ProbeReply> {
            let client = self.client(false)?;
            let request = if head { client.head(url) } else { client.get(url) };
            let resp = request.send().map_err(net_err)?;

            let mut header_text = Vec::new();
            for (name, value) in resp.headers() {
                header_text.extend_from_slice(name.as_str().as_bytes());
                header_text.extend_from_slice(b": ");
                header_text.extend_from_slice(value.as_bytes());
                header_text.extend_from_slice(b"\r\n");
            }

            Ok(ProbeReply {
                status: resp.status().as_u16(),
                content_length: resp
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok()),
                effective_url: Some(resp.url().as_str().to_string()),
                gzip_encoded: header_text_mentions_gzip(&header_text),
                header_text,
            })
        }
    }
}

#[cfg(feature = "reqwest")]
pub(crate) use reqwest_transport::ReqwestStreamingTransport;
