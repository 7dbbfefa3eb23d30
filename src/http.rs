use std::env;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHashMap;
use log::{debug, trace};

use crate::core::{File, FileStat, FileSystem, FsError, Result, strip_streaming_prefix};
use crate::plug::{
    StreamingTransport, TransferOutcome, TransferSink, build_default_transport, header_value,
    parse_ftp_content_length, parse_status_line, parse_u64_prefix,
};

/// Wraps a freshly opened handle in a caller-provided read-ahead cache.
/// The second argument is the configured cache size in bytes.
pub type CacheFactory = Arc<dyn Fn(Box<dyn File>, usize) -> Box<dyn File> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Capacity of the ring buffer between the transfer and the reader.
    pub ring_capacity: usize,
    /// Upper bound of the cached prefix kept per handle.
    pub cache_limit: usize,
    /// Cap on accumulated response headers kept for diagnostics.
    pub header_limit: usize,
    /// Scratch buffer used when discarding bytes during a forward seek.
    pub skip_buffer_size: usize,
    /// Negotiate gzip transfer encoding when the transport supports it.
    pub enable_gzip: bool,
    /// Allow `stat` to probe sizes with an extra request.
    pub slow_get_size: bool,
    /// URLs not ending in one of these suffixes are reported absent without
    /// any network traffic. The suffix compare covers the query string too.
    pub allowed_extensions: Option<Vec<String>>,
    /// Servers matched by substring that reject HEAD; sizes are probed with
    /// an interrupted GET instead.
    pub no_head_servers: Vec<String>,
    /// Route opened handles through the registered read-ahead cache factory.
    pub use_cache: bool,
    pub cache_size: usize,
    pub connect_timeout: Duration,
    pub proxy: Option<String>,
    pub proxy_userpwd: Option<String>,
    pub proxy_auth: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1024 * 1024,
            cache_limit: 1024 * 1024,
            header_limit: 32 * 1024,
            skip_buffer_size: 32 * 1024,
            enable_gzip: true,
            slow_get_size: true,
            allowed_extensions: None,
            no_head_servers: vec![".tiles.mapbox.com/".to_string()],
            use_cache: false,
            cache_size: 25 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            proxy: None,
            proxy_userpwd: None,
            proxy_auth: None,
        }
    }
}

impl StreamConfig {
    /// Load the environment-style configuration keys understood by the
    /// original GDAL handler; unset keys keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = env::var("CPL_VSIL_CURL_ALLOWED_EXTENSIONS") {
            config.allowed_extensions = Some(split_extension_list(&v));
        }
        if let Ok(v) = env::var("CPL_VSIL_CURL_SLOW_GET_SIZE") {
            config.slow_get_size = parse_config_bool(&v);
        }
        if let Ok(v) = env::var("CPL_CURL_GZIP") {
            config.enable_gzip = parse_config_bool(&v);
        }
        if let Ok(v) = env::var("VSI_CACHE") {
            config.use_cache = parse_config_bool(&v);
        }
        if let Ok(v) = env::var("VSI_CACHE_SIZE")
            && let Ok(n) = v.trim().parse()
        {
            config.cache_size = n;
        }
        config.proxy = env::var("GDAL_HTTP_PROXY").ok();
        config.proxy_userpwd = env::var("GDAL_HTTP_PROXYUSERPWD").ok();
        config.proxy_auth = env::var("GDAL_PROXY_AUTH").ok();
        config
    }
}

fn parse_config_bool(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_uppercase().as_str(),
        "NO" | "FALSE" | "OFF" | "0"
    )
}

fn split_extension_list(value: &str) -> Vec<String> {
    value
        .split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn url_matches_extension(url: &str, extensions: &[String]) -> bool {
    let url = url.as_bytes();
    extensions.iter().any(|ext| {
        let ext = ext.as_bytes();
        url.len() > ext.len() && url[url.len() - ext.len()..].eq_ignore_ascii_case(ext)
    })
}

/// Fixed-capacity circular byte buffer. Single producer, single consumer,
/// both serialised by the handle lock; no synchronisation of its own.
struct RingBuffer {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl RingBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn free(&self) -> usize {
        self.capacity() - self.len
    }

    fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    fn write(&mut self, data: &[u8]) {
        debug_assert!(self.len + data.len() <= self.capacity());

        let end = (self.start + self.len) % self.capacity();
        let first = data.len().min(self.capacity() - end);
        self.buf[end..end + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }
        self.len += data.len();
    }

    fn read(&mut self, out: &mut [u8]) {
        debug_assert!(out.len() <= self.len);

        let first = out.len().min(self.capacity() - self.start);
        out[..first].copy_from_slice(&self.buf[self.start..self.start + first]);
        if first < out.len() {
            let rest = out.len() - first;
            out[first..].copy_from_slice(&self.buf[..rest]);
        }
        self.start = (self.start + out.len()) % self.capacity();
        self.len -= out.len();
    }
}

/// Tri-state membership of a URL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Existence {
    #[default]
    Unknown,
    No,
    Yes,
}

/// What has been learned about a URL, shared by every handle opened on it.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetadataRecord {
    pub existence: Existence,
    pub size_known: bool,
    pub size: u64,
    pub is_directory: bool,
}

/// Process-wide URL → [`MetadataRecord`] map. Records are created on first
/// query and never evicted.
#[derive(Default)]
pub struct MetadataCache {
    records: Mutex<AHashMap<String, MetadataRecord>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The instance every filesystem uses unless the builder supplied one.
    pub fn shared() -> Arc<MetadataCache> {
        static SHARED: OnceLock<Arc<MetadataCache>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(MetadataCache::new())).clone()
    }

    /// Returns a copy of the record for `url`, inserting an Unknown one if
    /// the URL was never seen.
    pub fn get(&self, url: &str) -> MetadataRecord {
        let mut records = self.lock();
        *records.entry(url.to_string()).or_default()
    }

    pub(crate) fn update(&self, url: &str, apply: impl FnOnce(&mut MetadataRecord)) {
        let mut records = self.lock();
        apply(records.entry(url.to_string()).or_default());
    }

    fn lock(&self) -> MutexGuard<'_, AHashMap<String, MetadataRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-handle state shared between the reader and the transfer worker.
struct StreamState {
    ring: RingBuffer,
    in_progress: bool,
    stopped: bool,
    stop_requested: bool,
    existence: Existence,
    size_known: bool,
    size: u64,
    is_directory: bool,
    candidate_size: Option<u64>,
    candidate_trustable: bool,
}

impl StreamState {
    fn fresh(record: MetadataRecord, ring_capacity: usize) -> Self {
        Self {
            ring: RingBuffer::with_capacity(ring_capacity),
            in_progress: false,
            stopped: false,
            stop_requested: false,
            existence: record.existence,
            size_known: record.size_known,
            size: record.size,
            is_directory: record.is_directory,
            candidate_size: None,
            candidate_trustable: true,
        }
    }
}

struct StreamShared {
    state: Mutex<StreamState>,
    /// Bytes appeared in the ring buffer, or the transfer ended.
    producer: Condvar,
    /// Space appeared in the ring buffer, or a stop was requested.
    consumer: Condvar,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_producer<'a>(&self, guard: MutexGuard<'a, StreamState>) -> MutexGuard<'a, StreamState> {
        self.producer
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_consumer<'a>(&self, guard: MutexGuard<'a, StreamState>) -> MutexGuard<'a, StreamState> {
        self.consumer
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Routes one transfer's response into the shared state: parses headers into
/// status/size knowledge and pushes body bytes through the ring buffer.
struct TransferEngine {
    shared: Arc<StreamShared>,
    metadata: Arc<MetadataCache>,
    url: Arc<str>,
    header_limit: usize,
    headers: Vec<u8>,
    http_code: u16,
    bytes_received: u64,
}

impl TransferEngine {
    fn new(
        shared: Arc<StreamShared>,
        metadata: Arc<MetadataCache>,
        url: Arc<str>,
        header_limit: usize,
    ) -> Self {
        Self {
            shared,
            metadata,
            url,
            header_limit,
            headers: Vec::new(),
            http_code: 0,
            bytes_received: 0,
        }
    }
}

impl TransferSink for TransferEngine {
    fn on_header(&mut self, line: &[u8]) -> bool {
        if let Some(code) = parse_status_line(line) {
            if matches!(self.http_code, 301 | 302) {
                // A redirect is being followed; capture the next response
                // from scratch.
                self.headers.clear();
                self.http_code = 0;
            }
            if self.http_code == 0 {
                self.http_code = code;
                debug!("HTTP code = {code} for {}", self.url);
                if !matches!(code, 301 | 302) {
                    let mut st = self.shared.lock();
                    if st.existence == Existence::Unknown {
                        let existence = if code == 200 {
                            Existence::Yes
                        } else {
                            Existence::No
                        };
                        st.existence = existence;
                        self.metadata.update(&self.url, |rec| rec.existence = existence);
                    }
                }
            }
        }

        if self.headers.len() < self.header_limit {
            let take = line.len().min(self.header_limit - self.headers.len());
            self.headers.extend_from_slice(&line[..take]);
        }

        if !matches!(self.http_code, 301 | 302) {
            let mut st = self.shared.lock();
            if !st.size_known {
                if let Some(v) = header_value(line, "Content-Length").and_then(parse_u64_prefix) {
                    debug!("Candidate file size {v} for {}", self.url);
                    st.candidate_size = Some(v);
                }
                if let Some(v) = header_value(line, "Content-Encoding")
                    && v.starts_with(b"gzip")
                {
                    // The advertised length counts compressed bytes.
                    debug!("Gzip encoded response, candidate file size unusable");
                    st.candidate_trustable = false;
                }
            }
        }

        true
    }

    fn on_body(&mut self, chunk: &[u8]) -> usize {
        self.bytes_received += chunk.len() as u64;
        trace!("Receiving {} bytes for {}", chunk.len(), self.url);

        let mut st = self.shared.lock();

        if !st.size_known
            && st.candidate_trustable
            && let Some(candidate) = st.candidate_size
        {
            st.size = candidate;
            st.size_known = true;
            debug!("File size = {candidate} for {}", self.url);
            self.metadata.update(&self.url, |rec| {
                rec.size = candidate;
                rec.size_known = true;
            });
        }

        match st.existence {
            Existence::Unknown => {
                st.existence = Existence::Yes;
                self.metadata
                    .update(&self.url, |rec| rec.existence = Existence::Yes);
            }
            Existence::No => return 0,
            Existence::Yes => {}
        }

        let mut rest = chunk;
        loop {
            let free = st.ring.free();
            if rest.len() <= free {
                st.ring.write(rest);
                self.shared.producer.notify_one();
                if st.stop_requested {
                    debug!("Transfer interruption requested for {}", self.url);
                    return 0;
                }
                break;
            }

            let (now, later) = rest.split_at(free);
            st.ring.write(now);
            rest = later;
            self.shared.producer.notify_one();

            trace!("Waiting for the reader to drain the ring buffer");
            while st.ring.free() == 0 && !st.stop_requested {
                st = self.shared.wait_consumer(st);
            }
            if st.stop_requested {
                debug!("Transfer interruption requested for {}", self.url);
                return 0;
            }
        }

        chunk.len()
    }
}

struct TransferContext {
    url: Arc<str>,
    shared: Arc<StreamShared>,
    metadata: Arc<MetadataCache>,
    transport: Arc<dyn StreamingTransport>,
    gzip: bool,
    header_limit: usize,
}

fn run_transfer(ctx: TransferContext) {
    debug!("Transfer starting for {}", ctx.url);
    let mut engine = TransferEngine::new(
        ctx.shared.clone(),
        ctx.metadata.clone(),
        ctx.url.clone(),
        ctx.header_limit,
    );
    let outcome = ctx.transport.stream(&ctx.url, ctx.gzip, &mut engine);

    let mut st = ctx.shared.lock();
    match outcome {
        Ok(TransferOutcome::Completed) => {
            if !st.stop_requested && !st.size_known {
                // The stream ran to its natural end: its length is the size.
                st.size = engine.bytes_received;
                st.size_known = true;
                debug!("File size = {} for {}", st.size, ctx.url);
                ctx.metadata.update(&ctx.url, |rec| {
                    rec.size = engine.bytes_received;
                    rec.size_known = true;
                });
            }
        }
        Ok(TransferOutcome::Aborted) => {}
        Err(e) => {
            debug!("Transfer failed for {}: {e}", ctx.url);
            if st.existence == Existence::Unknown {
                st.existence = Existence::No;
                ctx.metadata
                    .update(&ctx.url, |rec| rec.existence = Existence::No);
            }
        }
    }
    st.in_progress = false;
    st.stopped = true;
    ctx.shared.producer.notify_one();
}

/// Streaming read handle over one remote URL.
///
/// Bytes are fetched by a single unbounded transfer running on a worker
/// thread and buffered in a ring buffer; the first `cache_limit` bytes are
/// additionally retained so that rewinds over the resource's head do not
/// restart the transfer.
pub struct StreamFile {
    url: Arc<str>,
    transport: Arc<dyn StreamingTransport>,
    config: StreamConfig,
    metadata: Arc<MetadataCache>,
    shared: Arc<StreamShared>,
    worker: Option<JoinHandle<()>>,
    /// Current logical read position.
    offset: u64,
    /// File offset of the byte at the ring buffer's read head.
    ring_offset: u64,
    /// Contiguous prefix of the resource, at most `cache_limit` bytes.
    cached: Vec<u8>,
    eof: bool,
    closed: bool,
}

impl StreamFile {
    pub(crate) fn new(
        url: Arc<str>,
        transport: Arc<dyn StreamingTransport>,
        config: StreamConfig,
        metadata: Arc<MetadataCache>,
    ) -> Self {
        let record = metadata.get(&url);
        let shared = Arc::new(StreamShared {
            state: Mutex::new(StreamState::fresh(record, config.ring_capacity)),
            producer: Condvar::new(),
            consumer: Condvar::new(),
        });
        Self {
            url,
            transport,
            config,
            metadata,
            shared,
            worker: None,
            offset: 0,
            ring_offset: 0,
            cached: Vec::new(),
            eof: false,
            closed: false,
        }
    }

    fn start_transfer(&mut self) {
        {
            let mut st = self.shared.lock();
            if st.in_progress || st.stopped {
                return;
            }
            debug!("Starting transfer for {}", self.url);
            st.ring.reset();
            st.in_progress = true;
        }
        self.ring_offset = 0;

        let ctx = TransferContext {
            url: self.url.clone(),
            shared: self.shared.clone(),
            metadata: self.metadata.clone(),
            transport: self.transport.clone(),
            gzip: self.config.enable_gzip,
            header_limit: self.config.header_limit,
        };
        self.worker = Some(thread::spawn(move || run_transfer(ctx)));
    }

    fn stop_transfer(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!("Stopping transfer for {}", self.url);
            {
                let mut st = self.shared.lock();
                st.stop_requested = true;
                self.shared.consumer.notify_one();
                while st.in_progress {
                    st = self.shared.wait_producer(st);
                }
                st.stop_requested = false;
            }
            let _ = worker.join();
        }

        let mut st = self.shared.lock();
        st.ring.reset();
        st.stopped = false;
    }

    /// Extend the cached prefix with a span of bytes just drained from the
    /// ring buffer. Spans beyond the window, or that would leave a hole, are
    /// dropped; the cache is always a contiguous prefix of the resource.
    fn remember_region(&mut self, start: u64, data: &[u8]) {
        let limit = self.config.cache_limit as u64;
        if start >= limit {
            return;
        }
        let have = self.cached.len() as u64;
        if start <= have && start + data.len() as u64 > have {
            let end = (start + data.len() as u64).min(limit);
            if self.cached.capacity() == 0 {
                self.cached.reserve_exact(self.config.cache_limit);
            }
            trace!("Caching [{have}, {end}) for {}", self.url);
            self.cached
                .extend_from_slice(&data[(have - start) as usize..(end - start) as usize]);
        }
    }

    /// Move whatever the ring buffer still holds into the cached prefix
    /// before a restart discards it.
    fn spill_ring_into_cache(&mut self) {
        if self.ring_offset >= self.config.cache_limit as u64 {
            return;
        }
        let spill = {
            let mut st = self.shared.lock();
            let room = (self.config.cache_limit as u64 - self.ring_offset) as usize;
            let n = st.ring.len().min(room);
            if n == 0 {
                return;
            }
            let mut spill = vec![0u8; n];
            st.ring.read(&mut spill);
            self.shared.consumer.notify_one();
            spill
        };
        self.remember_region(self.ring_offset, &spill);
        self.ring_offset += spill.len() as u64;
    }

    /// Resolve existence, probing the resource when nothing is known yet.
    pub fn exists(&mut self) -> bool {
        {
            let st = self.shared.lock();
            if st.existence != Existence::Unknown {
                return st.existence == Existence::Yes;
            }
        }

        if let Some(extensions) = &self.config.allowed_extensions
            && !url_matches_extension(&self.url, extensions)
        {
            // The server is trusted to only hold listed suffixes; publish a
            // negative without touching the network.
            let mut st = self.shared.lock();
            st.existence = Existence::No;
            st.size_known = true;
            st.size = 0;
            self.metadata.update(&self.url, |rec| {
                rec.existence = Existence::No;
                rec.size_known = true;
                rec.size = 0;
            });
            return false;
        }

        // Reading one byte resolves existence through the response callbacks.
        let mut first = [0u8; 1];
        let found = matches!(File::read(self, &mut first), Ok(1));
        {
            let mut st = self.shared.lock();
            let existence = if found { Existence::Yes } else { Existence::No };
            st.existence = existence;
            self.metadata.update(&self.url, |rec| rec.existence = existence);
        }
        let _ = File::seek(self, 0);
        found
    }

    pub fn is_directory(&self) -> bool {
        self.shared.lock().is_directory
    }

    fn size_is_known(&self) -> bool {
        self.shared.lock().size_known
    }

    /// Learn the file size, issuing a metadata probe when it is unknown.
    /// Returns None when the probe could not pin a size down; a full
    /// sequential read will then establish it.
    fn file_size(&self) -> Option<u64> {
        {
            let st = self.shared.lock();
            if st.size_known {
                return Some(st.size);
            }
        }

        let head = !self
            .config
            .no_head_servers
            .iter()
            .any(|s| self.url.contains(s.as_str()));
        let reply = self.transport.probe(&self.url, head);

        let mut st = self.shared.lock();
        if st.size_known {
            return Some(st.size);
        }

        let mut existence = Existence::Unknown;
        let mut size_known = true;
        let mut size = 0u64;
        let mut is_directory = st.is_directory;

        match reply {
            Ok(reply) => {
                if self.url.starts_with("ftp")
                    && let Some(n) = parse_ftp_content_length(&reply.header_text)
                {
                    existence = Existence::Yes;
                    size = n;
                }

                if existence != Existence::Yes {
                    if reply.status != 200 {
                        existence = Existence::No;
                    } else if reply.gzip_encoded || reply.content_length.is_none() {
                        // No usable length; leave the size to be ratified by
                        // an actual read of the stream.
                        existence = Existence::Yes;
                        size_known = false;
                    } else {
                        existence = Existence::Yes;
                        size = reply.content_length.unwrap_or(0);
                    }

                    // Servers answer a directory URL by redirecting to the
                    // same URL with a slash appended.
                    if let Some(effective) = &reply.effective_url
                        && effective.strip_prefix(self.url.as_ref()) == Some("/")
                    {
                        existence = Existence::Yes;
                        is_directory = true;
                        size = 0;
                        size_known = true;
                    }
                }
            }
            Err(e) => {
                debug!("Size probe failed for {}: {e}", self.url);
                existence = Existence::No;
            }
        }

        st.existence = existence;
        st.size_known = size_known;
        st.size = size;
        st.is_directory = is_directory;
        self.metadata.update(&self.url, |rec| {
            rec.existence = existence;
            rec.is_directory = is_directory;
            if size_known {
                rec.size_known = true;
                rec.size = size;
            }
        });

        debug!("Size of {} = {:?}", self.url, size_known.then_some(size));
        size_known.then_some(size)
    }
}

impl File for StreamFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(FsError::FileClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let (size_known, size) = {
            let st = self.shared.lock();
            (st.size_known, st.size)
        };

        if size_known && self.offset >= size {
            debug!("Read attempt beyond end of file for {}", self.url);
            self.eof = true;
        }
        if self.eof {
            return Ok(0);
        }

        // Behind the ring buffer after a backward seek: preserve what the
        // ring still holds before the transfer is restarted.
        if self.offset < self.ring_offset {
            self.spill_ring_into_cache();
        }

        let mut served = 0usize;

        // Serve the prefix covered by the cached head of the resource.
        if self.offset < self.cached.len() as u64 {
            let n = buf
                .len()
                .min((self.cached.len() as u64 - self.offset) as usize);
            let at = self.offset as usize;
            buf[..n].copy_from_slice(&self.cached[at..at + n]);
            served += n;
            self.offset += n as u64;
        }

        // Entirely cached file with the request running past its end.
        if size_known
            && served < buf.len()
            && self.offset <= self.cached.len() as u64
            && self.offset + (buf.len() - served) as u64 > size
            && size == self.cached.len() as u64
        {
            let n = (self.cached.len() as u64 - self.offset) as usize;
            let at = self.offset as usize;
            buf[served..served + n].copy_from_slice(&self.cached[at..at + n]);
            served += n;
            self.offset += n as u64;
            self.eof = true;
        }

        // A seek has moved the position away from the ring buffer's origin.
        if !self.eof && served < buf.len() && self.offset != self.ring_offset {
            if self.offset < self.ring_offset {
                // The stream cannot rewind; restart it from the beginning.
                self.stop_transfer();
            }
            self.start_transfer();

            let mut skip = vec![0u8; self.config.skip_buffer_size];
            let mut to_skip = self.offset - self.ring_offset;
            while to_skip > 0 {
                let n = {
                    let mut st = self.shared.lock();
                    let n = (st.ring.len() as u64).min(to_skip).min(skip.len() as u64) as usize;
                    st.ring.read(&mut skip[..n]);
                    self.shared.consumer.notify_one();
                    n
                };
                if n > 0 {
                    let origin = self.ring_offset;
                    self.remember_region(origin, &skip[..n]);
                }
                to_skip -= n as u64;
                self.ring_offset += n as u64;

                if n == 0 && to_skip > 0 {
                    trace!("Waiting for the transfer to reach the seek target");
                    let mut st = self.shared.lock();
                    while st.ring.is_empty() && st.in_progress {
                        st = self.shared.wait_producer(st);
                    }
                    if st.ring.is_empty() && !st.in_progress {
                        break;
                    }
                }
            }

            if to_skip > 0 {
                // The stream ended before the seek target.
                self.eof = true;
                return Ok(served);
            }
        }

        if !self.eof && served < buf.len() {
            self.start_transfer();
            debug_assert_eq!(self.offset, self.ring_offset);
        }

        // Drain the ring buffer into the caller's buffer.
        while !self.eof && served < buf.len() {
            let n = {
                let mut st = self.shared.lock();
                let n = st.ring.len().min(buf.len() - served);
                st.ring.read(&mut buf[served..served + n]);
                self.shared.consumer.notify_one();
                n
            };
            if n > 0 {
                let origin = self.offset;
                self.remember_region(origin, &buf[served..served + n]);
            }
            served += n;
            self.offset += n as u64;
            self.ring_offset += n as u64;

            if n == 0 {
                trace!("Waiting for the transfer to produce bytes");
                let mut st = self.shared.lock();
                while st.ring.is_empty() && st.in_progress {
                    st = self.shared.wait_producer(st);
                }
                if st.ring.is_empty() && !st.in_progress {
                    break;
                }
            }
        }

        if served < buf.len() {
            self.eof = true;
        }
        Ok(served)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if self.closed {
            return Err(FsError::FileClosed);
        }

        if self.offset > self.config.cache_limit as u64 {
            // Random access beyond the cached window: drop the stale prefix
            // and unlearn the size so a fresh transfer can rediscover it.
            debug!("Invalidating cached prefix and size after far seek");
            self.cached = Vec::new();
            let mut st = self.shared.lock();
            st.size_known = false;
            st.size = 0;
        }

        self.offset = pos;
        self.eof = false;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn size(&self) -> Option<u64> {
        if self.closed {
            return None;
        }
        self.file_size()
    }

    fn close(&mut self) {
        if !self.closed {
            self.stop_transfer();
            self.cached = Vec::new();
            self.closed = true;
        }
    }
}

impl Read for StreamFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        File::read(self, buf).map_err(io::Error::other)
    }
}

impl Seek for StreamFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(offset) => {
                if offset >= 0 {
                    self.offset.saturating_add(offset as u64)
                } else {
                    self.offset.saturating_sub(offset.unsigned_abs())
                }
            }
            SeekFrom::End(offset) => {
                let size = self.size().ok_or_else(|| {
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

        File::seek(self, new_pos).map_err(io::Error::other)?;
        Ok(new_pos)
    }
}

impl Drop for StreamFile {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct StreamFileSystem {
    transport: Arc<dyn StreamingTransport>,
    config: StreamConfig,
    metadata: Arc<MetadataCache>,
    cache_factory: Option<CacheFactory>,
}

pub struct StreamFileSystemBuilder {
    config: StreamConfig,
    transport: Option<Arc<dyn StreamingTransport>>,
    metadata: Option<Arc<MetadataCache>>,
    cache_factory: Option<CacheFactory>,
}

impl Default for StreamFileSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFileSystemBuilder {
    pub fn new() -> Self {
        Self {
            config: StreamConfig::default(),
            transport: None,
            metadata: None,
            cache_factory: None,
        }
    }

    /// Start from the environment-style configuration keys.
    pub fn from_env() -> Self {
        Self {
            config: StreamConfig::from_env(),
            transport: None,
            metadata: None,
            cache_factory: None,
        }
    }

    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn StreamingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a private metadata cache instead of the process-wide one.
    pub fn metadata_cache(mut self, metadata: Arc<MetadataCache>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn cache_factory(mut self, factory: CacheFactory) -> Self {
        self.cache_factory = Some(factory);
        self
    }

    pub fn ring_capacity(mut self, bytes: usize) -> Self {
        self.config.ring_capacity = bytes.max(1);
        self
    }

    pub fn cache_limit(mut self, bytes: usize) -> Self {
        self.config.cache_limit = bytes;
        self
    }

    pub fn enable_gzip(mut self, enabled: bool) -> Self {
        self.config.enable_gzip = enabled;
        self
    }

    pub fn slow_get_size(mut self, enabled: bool) -> Self {
        self.config.slow_get_size = enabled;
        self
    }

    pub fn allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_extensions =
            Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.config.use_cache = enabled;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    pub fn build(self) -> StreamFileSystem {
        let transport = self
            .transport
            .unwrap_or_else(|| build_default_transport(&self.config));

        StreamFileSystem {
            transport,
            config: self.config,
            metadata: self.metadata.unwrap_or_else(MetadataCache::shared),
            cache_factory: self.cache_factory,
        }
    }
}

impl StreamFileSystem {
    pub fn new() -> Self {
        StreamFileSystemBuilder::new().build()
    }

    pub fn builder() -> StreamFileSystemBuilder {
        StreamFileSystemBuilder::new()
    }

    fn handle(&self, path: &str) -> StreamFile {
        StreamFile::new(
            Arc::from(strip_streaming_prefix(path)),
            self.transport.clone(),
            self.config.clone(),
            self.metadata.clone(),
        )
    }
}

impl Default for StreamFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for StreamFileSystem {
    fn open(&self, path: &str, mode: &str) -> Result<Box<dyn File>> {
        if mode != "r" && mode != "rb" {
            return Err(FsError::ReadOnly);
        }

        let mut file = self.handle(path);
        if !file.exists() {
            return Err(FsError::NotFound(path.to_string()));
        }

        let file: Box<dyn File> = Box::new(file);
        if self.config.use_cache
            && let Some(factory) = &self.cache_factory
        {
            return Ok(factory(file, self.config.cache_size));
        }
        Ok(file)
    }

    fn stat(&self, path: &str, want_size: bool) -> Result<FileStat> {
        let mut file = self.handle(path);
        let mut stat = FileStat::default();

        if file.size_is_known()
            || (want_size && !file.is_directory() && self.config.slow_get_size)
        {
            stat.size = file.file_size().unwrap_or(0);
        }
        let exists = file.exists();
        stat.is_directory = file.is_directory();

        if exists {
            Ok(stat)
        } else {
            Err(FsError::NotFound(path.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plug::ProbeReply;

    struct NullTransport;

    impl StreamingTransport for NullTransport {
        fn stream(
            &self,
            _url: &str,
            _gzip: bool,
            _sink: &mut dyn TransferSink,
        ) -> Result<TransferOutcome> {
            Ok(TransferOutcome::Completed)
        }

        fn probe(&self, _url: &str, _head: bool) -> Result<ProbeReply> {
            Err(FsError::Network("no transport".into()))
        }
    }

    fn test_file(cache_limit: usize) -> StreamFile {
        let config = StreamConfig {
            cache_limit,
            ..StreamConfig::default()
        };
        StreamFile::new(
            Arc::from("http://example.test/data.bin"),
            Arc::new(NullTransport),
            config,
            Arc::new(MetadataCache::new()),
        )
    }

    fn test_engine(url: &str) -> (TransferEngine, Arc<StreamShared>, Arc<MetadataCache>) {
        let shared = Arc::new(StreamShared {
            state: Mutex::new(StreamState::fresh(MetadataRecord::default(), 64)),
            producer: Condvar::new(),
            consumer: Condvar::new(),
        });
        let metadata = Arc::new(MetadataCache::new());
        let engine = TransferEngine::new(shared.clone(), metadata.clone(), Arc::from(url), 128);
        (engine, shared, metadata)
    }

    #[test]
    fn ring_buffer_wraps_around() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.write(b"abcdef");
        let mut out = [0u8; 4];
        ring.read(&mut out);
        assert_eq!(&out, b"abcd");

        // Write past the physical end of the buffer.
        ring.write(b"ghijkl");
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.free(), 0);
        let mut out = [0u8; 8];
        ring.read(&mut out);
        assert_eq!(&out, b"efghijkl");
        assert!(ring.is_empty());
    }

    #[test]
    fn ring_buffer_reset_forgets_everything() {
        let mut ring = RingBuffer::with_capacity(4);
        ring.write(b"abc");
        ring.reset();
        assert!(ring.is_empty());
        ring.write(b"wxyz");
        let mut out = [0u8; 4];
        ring.read(&mut out);
        assert_eq!(&out, b"wxyz");
    }

    #[test]
    fn front_cache_stays_a_prefix() {
        let mut file = test_file(16);
        file.remember_region(0, b"0123");
        assert_eq!(file.cached, b"0123");

        // Overlapping region extends it.
        file.remember_region(2, b"23456");
        assert_eq!(file.cached, b"0123456");

        // A hole is dropped.
        file.remember_region(9, b"x");
        assert_eq!(file.cached, b"0123456");

        // Already covered data changes nothing.
        file.remember_region(0, b"01");
        assert_eq!(file.cached, b"0123456");
    }

    #[test]
    fn front_cache_clips_at_the_window() {
        let mut file = test_file(8);
        file.remember_region(0, b"abcdefghij");
        assert_eq!(file.cached, b"abcdefgh");

        // Regions at or past the window are ignored outright.
        file.remember_region(8, b"zz");
        assert_eq!(file.cached.len(), 8);
    }

    #[test]
    fn allow_list_compares_full_url_suffix() {
        let exts = vec![".tif".to_string(), ".ovr".to_string()];
        assert!(url_matches_extension("http://h/a.tif", &exts));
        assert!(url_matches_extension("http://h/a.TIF", &exts));
        assert!(!url_matches_extension("http://h/a.png", &exts));
        // The query string is part of the compared suffix.
        assert!(!url_matches_extension("http://h/a.tif?sig=abc", &exts));
        assert!(url_matches_extension("http://h/get?f=a.tif", &exts));
    }

    #[test]
    fn engine_ratifies_candidate_size_on_first_body_byte() {
        let (mut engine, shared, metadata) = test_engine("http://h/a");
        assert!(engine.on_header(b"HTTP/1.1 200 OK\r\n"));
        assert!(engine.on_header(b"Content-Length: 5\r\n"));
        assert!(engine.on_header(b"\r\n"));
        assert_eq!(engine.on_body(b"hello"), 5);

        let st = shared.lock();
        assert_eq!(st.existence, Existence::Yes);
        assert!(st.size_known);
        assert_eq!(st.size, 5);
        assert_eq!(st.ring.len(), 5);
        drop(st);

        let rec = metadata.get("http://h/a");
        assert_eq!(rec.existence, Existence::Yes);
        assert!(rec.size_known);
        assert_eq!(rec.size, 5);
    }

    #[test]
    fn engine_rejects_body_for_absent_resource() {
        let (mut engine, shared, metadata) = test_engine("http://h/missing");
        assert!(engine.on_header(b"HTTP/1.1 404 Not Found\r\n"));
        assert!(engine.on_header(b"\r\n"));
        assert_eq!(engine.on_body(b"<html>not found</html>"), 0);

        assert_eq!(shared.lock().existence, Existence::No);
        assert_eq!(metadata.get("http://h/missing").existence, Existence::No);
    }

    #[test]
    fn engine_restarts_header_capture_after_redirect() {
        let (mut engine, shared, _) = test_engine("http://h/moved");
        assert!(engine.on_header(b"HTTP/1.1 302 Found\r\n"));
        assert!(engine.on_header(b"Location: http://h/real\r\n"));
        // A Content-Length on the redirect response must not become a
        // candidate size.
        assert!(engine.on_header(b"Content-Length: 154\r\n"));
        assert!(engine.on_header(b"\r\n"));
        assert_eq!(shared.lock().candidate_size, None);
        assert_eq!(shared.lock().existence, Existence::Unknown);

        assert!(engine.on_header(b"HTTP/1.1 200 OK\r\n"));
        assert!(engine.on_header(b"Content-Length: 6\r\n"));
        assert!(engine.on_header(b"\r\n"));

        assert_eq!(engine.http_code, 200);
        assert!(engine.headers.starts_with(b"HTTP/1.1 200 OK"));
        let st = shared.lock();
        assert_eq!(st.existence, Existence::Yes);
        assert_eq!(st.candidate_size, Some(6));
    }

    #[test]
    fn gzip_poisons_the_candidate_size_in_either_header_order() {
        for lines in [
            [&b"Content-Length: 8\r\n"[..], &b"Content-Encoding: gzip\r\n"[..]],
            [&b"Content-Encoding: gzip\r\n"[..], &b"Content-Length: 8\r\n"[..]],
        ] {
            let (mut engine, shared, _) = test_engine("http://h/z.gz");
            assert!(engine.on_header(b"HTTP/1.1 200 OK\r\n"));
            for line in lines {
                assert!(engine.on_header(line));
            }
            assert!(engine.on_header(b"\r\n"));
            assert_eq!(engine.on_body(b"decoded bytes"), 13);

            let st = shared.lock();
            assert!(!st.candidate_trustable);
            assert!(!st.size_known);
        }
    }

    #[test]
    fn header_accumulator_is_bounded() {
        let (mut engine, _, _) = test_engine("http://h/a");
        engine.header_limit = 32;
        assert!(engine.on_header(b"HTTP/1.1 200 OK\r\n"));
        let long = vec![b'x'; 100];
        assert!(engine.on_header(&long));
        assert!(engine.on_header(&long));
        assert_eq!(engine.headers.len(), 32);
    }

    #[test]
    fn config_bool_parsing_matches_the_original() {
        for v in ["NO", "no", "FALSE", "off", "0"] {
            assert!(!parse_config_bool(v));
        }
        for v in ["YES", "TRUE", "on", "1", "anything"] {
            assert!(parse_config_bool(v));
        }
    }

    #[test]
    fn extension_lists_split_on_commas_and_spaces() {
        assert_eq!(
            split_extension_list(".tif, .ovr .vrt"),
            vec![".tif".to_string(), ".ovr".to_string(), ".vrt".to_string()]
        );
    }
}
