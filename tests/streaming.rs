//! End-to-end behavior of the streaming handles, driven through a scripted
//! transport plugged into the filesystem builder.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dhara::{
    Existence, File, FileSystem, FsError, MetadataCache, ProbeReply, Result, StreamFileSystem,
    StreamingTransport, TransferOutcome, TransferSink,
};

/// Replays one canned HTTP exchange per `stream` call and one canned reply
/// per `probe` call, counting both.
#[derive(Default)]
struct FakeTransport {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    /// Deliver the body in pieces of this size (0 = all at once).
    chunk: usize,
    /// Replay a 302 hop to this location before the final response.
    redirect: Option<String>,
    /// Both `stream` and `probe` fail with a network error.
    unreachable: bool,
    probe_status: u16,
    probe_content_length: Option<u64>,
    probe_gzip: bool,
    probe_effective_url: Option<String>,
    streams: AtomicUsize,
    probes: AtomicUsize,
}

impl FakeTransport {
    fn ok(body: &[u8], content_length: Option<u64>) -> Self {
        let mut headers = Vec::new();
        if let Some(n) = content_length {
            headers.push(("Content-Length".to_string(), n.to_string()));
        }
        Self {
            status: 200,
            headers,
            body: body.to_vec(),
            probe_status: 200,
            probe_content_length: content_length,
            ..Self::default()
        }
    }

    fn streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl StreamingTransport for FakeTransport {
    fn stream(
        &self,
        _url: &str,
        _gzip: bool,
        sink: &mut dyn TransferSink,
    ) -> Result<TransferOutcome> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(FsError::Network("could not resolve host".into()));
        }

        if let Some(location) = &self.redirect {
            for line in [
                "HTTP/1.1 302 Found\r\n".to_string(),
                format!("Location: {location}\r\n"),
                "\r\n".to_string(),
            ] {
                if !sink.on_header(line.as_bytes()) {
                    return Ok(TransferOutcome::Aborted);
                }
            }
        }

        let status_line = format!("HTTP/1.1 {} \r\n", self.status);
        if !sink.on_header(status_line.as_bytes()) {
            return Ok(TransferOutcome::Aborted);
        }
        for (name, value) in &self.headers {
            let line = format!("{name}: {value}\r\n");
            if !sink.on_header(line.as_bytes()) {
                return Ok(TransferOutcome::Aborted);
            }
        }
        if !sink.on_header(b"\r\n") {
            return Ok(TransferOutcome::Aborted);
        }

        let chunk = if self.chunk == 0 {
            self.body.len().max(1)
        } else {
            self.chunk
        };
        for piece in self.body.chunks(chunk) {
            if sink.on_body(piece) != piece.len() {
                return Ok(TransferOutcome::Aborted);
            }
        }
        Ok(TransferOutcome::Completed)
    }

    fn probe(&self, url: &str, _head: bool) -> Result<ProbeReply> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(FsError::Network("could not resolve host".into()));
        }
        Ok(ProbeReply {
            status: self.probe_status,
            content_length: self.probe_content_length,
            effective_url: Some(
                self.probe_effective_url
                    .clone()
                    .unwrap_or_else(|| url.to_string()),
            ),
            gzip_encoded: self.probe_gzip,
            header_text: Vec::new(),
        })
    }
}

const URL: &str = "http://example.test/data.bin";

fn fs_with(transport: &Arc<FakeTransport>) -> (StreamFileSystem, Arc<MetadataCache>) {
    let metadata = Arc::new(MetadataCache::new());
    let fs = StreamFileSystem::builder()
        .transport(transport.clone() as Arc<dyn StreamingTransport>)
        .metadata_cache(metadata.clone())
        .build();
    (fs, metadata)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect()
}

fn read_fully(file: &mut Box<dyn File>, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let before = file.tell();
        let n = file.read(&mut buf).expect("read failed");
        assert_eq!(file.tell(), before + n as u64);
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn content_length_resource_reads_and_reports_its_size() {
    let transport = Arc::new(FakeTransport::ok(b"hello", Some(5)));
    let (fs, _) = fs_with(&transport);

    let mut file = fs.open(URL, "r").expect("open failed");
    let mut buf = [0u8; 10];
    assert_eq!(file.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert!(file.eof());
    assert_eq!(file.size(), Some(5));

    // Existence and the whole read were covered by one transfer, and the
    // size came from Content-Length, not from a probe.
    assert_eq!(transport.streams(), 1);
    assert_eq!(transport.probes(), 0);
}

#[test]
fn size_of_an_unsized_stream_is_learned_by_reading_it() {
    let transport = Arc::new(FakeTransport::ok(b"abcdef", None));
    let (fs, _) = fs_with(&transport);

    // A stat before any read has only the probe to go by, and the probe has
    // no usable length to offer.
    let stat = fs.stat(URL, true).expect("stat failed");
    assert_eq!(stat.size, 0);
    assert_eq!(transport.probes(), 1);

    let mut file = fs.open(URL, "r").expect("open failed");
    let mut buf = [0u8; 10];
    assert_eq!(file.read(&mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"abcdef");

    // The completed stream ratified its own length.
    assert_eq!(file.size(), Some(6));
    assert_eq!(transport.probes(), 1);
}

#[test]
fn gzip_content_length_is_never_taken_as_the_size() {
    let transport = Arc::new(FakeTransport {
        status: 200,
        headers: vec![
            ("Content-Length".to_string(), "8".to_string()),
            ("Content-Encoding".to_string(), "gzip".to_string()),
        ],
        body: b"decompressed!".to_vec(),
        probe_status: 200,
        probe_content_length: Some(8),
        probe_gzip: true,
        ..FakeTransport::default()
    });
    let (fs, _) = fs_with(&transport);

    let stat = fs.stat(URL, true).expect("stat failed");
    assert_ne!(stat.size, 8);

    let mut file = fs.open(URL, "r").expect("open failed");
    let mut buf = [0u8; 64];
    assert_eq!(file.read(&mut buf).unwrap(), 13);
    assert_eq!(file.size(), Some(13));
}

#[test]
fn absent_resource_fails_open_and_is_remembered() {
    let transport = Arc::new(FakeTransport {
        status: 404,
        body: b"<html>not found</html>".to_vec(),
        probe_status: 404,
        ..FakeTransport::default()
    });
    let (fs, metadata) = fs_with(&transport);

    assert!(matches!(fs.open(URL, "r"), Err(FsError::NotFound(_))));
    assert_eq!(metadata.get(URL).existence, Existence::No);

    // The negative is cached: a second open asks the network nothing.
    let streams = transport.streams();
    assert!(matches!(fs.open(URL, "r"), Err(FsError::NotFound(_))));
    assert_eq!(transport.streams(), streams);
}

#[test]
fn redirects_are_followed_into_the_final_body() {
    let transport = Arc::new(FakeTransport {
        status: 200,
        headers: vec![("Content-Length".to_string(), "7".to_string())],
        body: b"follow!".to_vec(),
        redirect: Some("http://example.test/real".to_string()),
        ..FakeTransport::default()
    });
    let (fs, metadata) = fs_with(&transport);

    let mut file = fs.open(URL, "r").expect("open failed");
    assert_eq!(metadata.get(URL).existence, Existence::Yes);
    let mut buf = [0u8; 16];
    assert_eq!(file.read(&mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"follow!");
    assert_eq!(file.size(), Some(7));
}

#[test]
fn rewind_within_the_cached_window_does_not_restart_the_transfer() {
    const WINDOW: usize = 64 * 1024;
    let body = pattern(3 * WINDOW);
    let transport = Arc::new(FakeTransport {
        chunk: 8 * 1024,
        ..FakeTransport::ok(&body, Some(body.len() as u64))
    });
    let metadata = Arc::new(MetadataCache::new());
    let fs = StreamFileSystem::builder()
        .transport(transport.clone() as Arc<dyn StreamingTransport>)
        .metadata_cache(metadata)
        .ring_capacity(WINDOW)
        .cache_limit(WINDOW)
        .build();

    let mut file = fs.open(URL, "r").expect("open failed");
    let mut first = vec![0u8; WINDOW];
    assert_eq!(file.read(&mut first).unwrap(), WINDOW);
    assert_eq!(&first, &body[..WINDOW]);

    file.seek(0).unwrap();
    let mut again = vec![0u8; WINDOW];
    assert_eq!(file.read(&mut again).unwrap(), WINDOW);
    assert_eq!(&again, &body[..WINDOW]);

    // The second read was served from the cached prefix alone.
    assert_eq!(transport.streams(), 1);
}

#[test]
fn any_chunking_reassembles_the_same_bytes() {
    const N: usize = 10_000;
    let body = pattern(N);

    for chunk in [1usize, 7, 4096, N, N + 1] {
        let transport = Arc::new(FakeTransport {
            chunk: 512,
            ..FakeTransport::ok(&body, None)
        });
        let (fs, _) = fs_with(&transport);
        let mut file = fs.open(URL, "r").expect("open failed");
        let out = read_fully(&mut file, chunk);
        assert_eq!(out, body, "chunk size {chunk}");
        assert!(file.eof());
    }
}

#[test]
fn backward_seek_rereads_exactly_what_a_fresh_handle_sees() {
    let body = pattern(64 * 1024);
    let transport = Arc::new(FakeTransport {
        chunk: 1024,
        ..FakeTransport::ok(&body, Some(body.len() as u64))
    });
    let metadata = Arc::new(MetadataCache::new());
    let fs = StreamFileSystem::builder()
        .transport(transport.clone() as Arc<dyn StreamingTransport>)
        .metadata_cache(metadata)
        .ring_capacity(8 * 1024)
        .cache_limit(4 * 1024)
        .build();

    let mut file = fs.open(URL, "r").expect("open failed");
    let mut head = vec![0u8; 20_000];
    assert_eq!(file.read(&mut head).unwrap(), head.len());
    assert_eq!(&head, &body[..20_000]);

    // Rewind to an offset the cache no longer covers; the stream restarts
    // and skips forward.
    file.seek(1000).unwrap();
    assert!(!file.eof());
    let rest = read_fully(&mut file, 4096);
    assert_eq!(rest, &body[1000..]);
}

#[test]
fn forward_seek_skips_over_the_stream() {
    let body = pattern(32 * 1024);
    let transport = Arc::new(FakeTransport {
        chunk: 1024,
        ..FakeTransport::ok(&body, Some(body.len() as u64))
    });
    let (fs, _) = fs_with(&transport);

    let mut file = fs.open(URL, "r").expect("open failed");
    file.seek(30_000).unwrap();
    let mut tail = vec![0u8; 4096];
    let n = file.read(&mut tail).unwrap();
    assert_eq!(n, body.len() - 30_000);
    assert_eq!(&tail[..n], &body[30_000..]);
    assert!(file.eof());
    assert_eq!(transport.streams(), 1);
}

#[test]
fn seeking_past_the_end_reads_nothing() {
    let transport = Arc::new(FakeTransport::ok(b"hello", Some(5)));
    let (fs, _) = fs_with(&transport);

    let mut file = fs.open(URL, "r").expect("open failed");
    file.seek(10).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(file.read(&mut buf).unwrap(), 0);
    assert!(file.eof());

    // Seeking clears eof again.
    file.seek(0).unwrap();
    assert!(!file.eof());
}

#[test]
fn metadata_is_shared_between_handles_of_one_url() {
    let transport = Arc::new(FakeTransport::ok(b"hello", Some(5)));
    let (fs, metadata) = fs_with(&transport);

    {
        let mut file = fs.open(URL, "r").expect("open failed");
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 5);
    }

    let record = metadata.get(URL);
    assert_eq!(record.existence, Existence::Yes);
    assert!(record.size_known);
    assert_eq!(record.size, 5);

    // The second handle inherits everything without a probe.
    let file = fs.open(URL, "r").expect("open failed");
    assert_eq!(file.size(), Some(5));
    assert_eq!(transport.probes(), 0);
}

#[test]
fn concurrent_existence_checks_agree() {
    let transport = Arc::new(FakeTransport::ok(b"shared", Some(6)));
    let (fs, metadata) = fs_with(&transport);
    let fs = Arc::new(fs);

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let fs = fs.clone();
                scope.spawn(move || fs.stat(URL, false).is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    });

    assert_eq!(metadata.get(URL).existence, Existence::Yes);
}

#[test]
fn closing_an_inflight_transfer_does_not_hang() {
    // Far more body than the ring can hold, so the worker is parked waiting
    // for the reader when the handle goes away.
    let body = pattern(4 * 1024 * 1024);
    let transport = Arc::new(FakeTransport {
        chunk: 64 * 1024,
        ..FakeTransport::ok(&body, Some(body.len() as u64))
    });
    let metadata = Arc::new(MetadataCache::new());
    let fs = StreamFileSystem::builder()
        .transport(transport.clone() as Arc<dyn StreamingTransport>)
        .metadata_cache(metadata)
        .ring_capacity(64 * 1024)
        .build();

    let start = Instant::now();
    {
        let mut file = fs.open(URL, "r").expect("open failed");
        let mut buf = [0u8; 100];
        assert_eq!(file.read(&mut buf).unwrap(), 100);
        // Dropped here with the transfer still running.
    }
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn transport_failure_reads_as_absent() {
    let transport = Arc::new(FakeTransport {
        unreachable: true,
        ..FakeTransport::default()
    });
    let (fs, metadata) = fs_with(&transport);

    assert!(matches!(fs.open(URL, "r"), Err(FsError::NotFound(_))));
    assert_eq!(metadata.get(URL).existence, Existence::No);
}

#[test]
fn allow_list_miss_is_a_free_negative() {
    let transport = Arc::new(FakeTransport::ok(b"tile", Some(4)));
    let metadata = Arc::new(MetadataCache::new());
    let fs = StreamFileSystem::builder()
        .transport(transport.clone() as Arc<dyn StreamingTransport>)
        .metadata_cache(metadata.clone())
        .allowed_extensions([".tif"])
        .build();

    assert!(matches!(
        fs.open("http://example.test/photo.png", "r"),
        Err(FsError::NotFound(_))
    ));
    assert_eq!(transport.streams(), 0);
    assert_eq!(transport.probes(), 0);
    assert_eq!(
        metadata.get("http://example.test/photo.png").existence,
        Existence::No
    );

    // A listed suffix still goes to the network.
    assert!(fs.open("http://example.test/image.tif", "r").is_ok());
    assert_eq!(transport.streams(), 1);
}

#[test]
fn directories_are_recognised_from_the_redirected_url() {
    let url = "http://example.test/folder";
    let transport = Arc::new(FakeTransport {
        status: 200,
        probe_status: 200,
        probe_effective_url: Some(format!("{url}/")),
        ..FakeTransport::default()
    });
    let (fs, _) = fs_with(&transport);

    let stat = fs.stat(url, true).expect("stat failed");
    assert!(stat.is_directory);
    assert_eq!(stat.size, 0);
}

#[test]
fn write_access_is_refused() {
    let transport = Arc::new(FakeTransport::ok(b"hello", Some(5)));
    let (fs, _) = fs_with(&transport);

    assert!(matches!(fs.open(URL, "w"), Err(FsError::ReadOnly)));
    assert!(matches!(fs.open(URL, "r+"), Err(FsError::ReadOnly)));
    assert!(matches!(fs.open(URL, "a"), Err(FsError::ReadOnly)));

    let mut file = fs.open(URL, "rb").expect("open failed");
    assert!(matches!(file.write(b"nope"), Err(FsError::ReadOnly)));
    assert!(file.flush().is_ok());
}

#[test]
fn prefixed_paths_reach_the_same_resource() {
    let transport = Arc::new(FakeTransport::ok(b"hello", Some(5)));
    let (fs, metadata) = fs_with(&transport);

    let path = format!("/vsicurl_streaming/{URL}");
    let mut file = fs.open(&path, "r").expect("open failed");
    let mut buf = [0u8; 8];
    assert_eq!(file.read(&mut buf).unwrap(), 5);

    // Records are keyed by the bare URL, prefix stripped.
    assert_eq!(metadata.get(URL).existence, Existence::Yes);
}

#[cfg(feature = "curl")]
mod live {
    use super::*;
    use httptest::{Expectation, Server, matchers::*, responders::*};

    fn isolated_fs() -> StreamFileSystem {
        StreamFileSystem::builder()
            .metadata_cache(Arc::new(MetadataCache::new()))
            .build()
    }

    #[test]
    fn reads_a_real_http_resource() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/data.bin"))
                .times(..)
                .respond_with(status_code(200).body("0123456789AB")),
        );

        let fs = isolated_fs();
        let path = format!("/vsicurl_streaming/{}", server.url("/data.bin"));
        let mut file = fs.open(&path, "r").expect("open failed");
        let mut buf = [0u8; 32];
        assert_eq!(file.read(&mut buf).unwrap(), 12);
        assert_eq!(&buf[..12], b"0123456789AB");
        assert!(file.eof());
        assert_eq!(file.size(), Some(12));
    }

    #[test]
    fn missing_resource_fails_open() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/missing"))
                .times(..)
                .respond_with(status_code(404)),
        );

        let fs = isolated_fs();
        let path = format!("/vsicurl_streaming/{}", server.url("/missing"));
        assert!(matches!(fs.open(&path, "r"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn redirect_is_followed() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/old"))
                .times(..)
                .respond_with(
                    status_code(302).insert_header("Location", server.url("/new").to_string()),
                ),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/new"))
                .times(..)
                .respond_with(status_code(200).body("moved here")),
        );

        let fs = isolated_fs();
        let path = format!("/vsicurl_streaming/{}", server.url("/old"));
        let mut file = fs.open(&path, "r").expect("open failed");
        let mut buf = [0u8; 32];
        assert_eq!(file.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"moved here");
    }
}
