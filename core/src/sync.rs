//! Streaming dataset synchronizer.
//!
//! Pulls the remote version marker, and when it is newer than the local one,
//! streams the gzip-compressed NDJSON export through a decompressor and a line
//! assembler into fixed-size store batches. Nothing about the new generation
//! becomes visible until the final swap.
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use flate2::read::MultiGzDecoder;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classifier, PHRASE_TABLE_VERSION};
use crate::db::{Generation, ImportSession, ProductStore};
use crate::error::{RecordDecodeError, SyncError};
use crate::models::{Product, ProductRecord, SyncOutcome, SyncReport};

pub const DEFAULT_SYNC_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_SKIP_RATIO: f64 = 0.01;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncOptions {
    pub batch_size: usize,
    /// Share of non-blank lines allowed to fail decoding before the dataset
    /// is rejected as corrupt.
    pub max_skip_ratio: f64,
    /// Import even when the local version marker is current.
    pub force: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SYNC_BATCH_SIZE,
            max_skip_ratio: DEFAULT_MAX_SKIP_RATIO,
            force: false,
        }
    }
}

/// Cooperative cancellation, checked at batch boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    CheckingVersion,
    Downloading,
    Parsing,
    Committing,
    Done,
    Failed,
}

impl SyncPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckingVersion => "checking_version",
            Self::Downloading => "downloading",
            Self::Parsing => "parsing",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    /// Records committed to the staging generation so far. Never decreases
    /// within one run.
    pub committed: u64,
    pub skipped: u64,
}

/// Compressed export delivered as a sequence of byte chunks of arbitrary
/// size. An `Err` item ends the download.
pub type ChunkStream<'a> = Box<dyn Iterator<Item = io::Result<Vec<u8>>> + Send + 'a>;

/// Where the bulk dataset comes from. Implemented over HTTP by the binary and
/// over in-memory buffers by tests.
pub trait DatasetSource: Send + Sync {
    /// Current remote version marker (epoch ms).
    fn remote_version(&self) -> Result<i64, SyncError>;

    /// Start downloading the compressed export.
    fn open_export(&self) -> Result<ChunkStream<'_>, SyncError>;
}

/// Joins decompressed chunks into complete lines. A line split across a
/// chunk boundary is carried over until its newline arrives.
#[derive(Debug, Default)]
pub struct LineAssembler {
    carry: Vec<u8>,
}

impl LineAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete lines contained in `chunk` plus any carried prefix, without
    /// their newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let mut line = std::mem::take(&mut self.carry);
            line.extend_from_slice(&rest[..pos]);
            lines.push(line);
            rest = &rest[pos + 1..];
        }
        self.carry.extend_from_slice(rest);
        lines
    }

    /// Final line when the stream does not end with a newline.
    #[must_use]
    pub fn finish(self) -> Option<Vec<u8>> {
        if self.carry.is_empty() {
            None
        } else {
            Some(self.carry)
        }
    }
}

/// Decode one dataset line. `Ok(None)` for lines that carry no record: blank
/// lines and the brackets of a JSON-array rendering.
pub fn decode_line(line: &[u8], line_no: u64) -> Result<Option<Product>, RecordDecodeError> {
    let text = std::str::from_utf8(line).map_err(|e| RecordDecodeError {
        line: line_no,
        message: format!("invalid UTF-8: {e}"),
    })?;
    let text = text.trim();
    let text = text.strip_suffix(',').unwrap_or(text).trim_end();
    if text.is_empty() || text == "[" || text == "]" {
        return Ok(None);
    }
    let record: ProductRecord = serde_json::from_str(text).map_err(|e| RecordDecodeError {
        line: line_no,
        message: e.to_string(),
    })?;
    Ok(Some(record.into()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Non-blank lines seen.
    pub total: u64,
    pub decoded: u64,
    pub skipped: u64,
    pub last_error: Option<RecordDecodeError>,
}

impl DecodeStats {
    fn record_error(&mut self, err: RecordDecodeError) {
        debug!("skipping undecodable line: {err}");
        self.total += 1;
        self.skipped += 1;
        self.last_error = Some(err);
    }

    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn exceeds(&self, max_skip_ratio: f64) -> bool {
        self.skipped as f64 > self.total as f64 * max_skip_ratio
    }
}

/// Adapts a chunk stream to `Read` so the gzip decoder can pull from it.
struct ChunkReader<'a> {
    chunks: ChunkStream<'a>,
    current: Vec<u8>,
    pos: usize,
    received: u64,
}

impl<'a> ChunkReader<'a> {
    fn new(chunks: ChunkStream<'a>) -> Self {
        Self {
            chunks,
            current: Vec::new(),
            pos: 0,
            received: 0,
        }
    }
}

impl Read for ChunkReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.chunks.next() {
                Some(chunk) => {
                    self.current = chunk?;
                    self.pos = 0;
                    self.received += self.current.len() as u64;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Runs sync passes. At most one pass is active per synchronizer; a second
/// request while one is running is rejected with `AlreadyRunning`.
#[derive(Debug)]
pub struct Synchronizer {
    options: SyncOptions,
    running: AtomicBool,
    phase: Mutex<SyncPhase>,
}

struct RunGuard<'a> {
    sync: &'a Synchronizer,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.sync.set_phase(SyncPhase::Idle);
        self.sync.running.store(false, Ordering::Release);
    }
}

/// State of one pass, threaded through the batch loop.
struct Pass<'s, 'p> {
    session: ImportSession<'s>,
    batch: Vec<Product>,
    stats: DecodeStats,
    tagged: u64,
    on_progress: &'p mut dyn FnMut(SyncProgress),
}

impl Synchronizer {
    #[must_use]
    pub fn new(options: SyncOptions) -> Self {
        Self {
            options: SyncOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            running: AtomicBool::new(false),
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    #[must_use]
    pub fn options(&self) -> SyncOptions {
        self.options
    }

    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn acquire(&self) -> Result<RunGuard<'_>, SyncError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::AlreadyRunning)?;
        Ok(RunGuard { sync: self })
    }

    /// One full pass: version check, then (if needed) stream, tag, and
    /// install the remote dataset. On any failure the store keeps its
    /// previous generation and version marker.
    pub fn run(
        &self,
        store: &ProductStore,
        source: &dyn DatasetSource,
        classifier: &Classifier,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(SyncProgress),
    ) -> Result<SyncOutcome, SyncError> {
        let _guard = self.acquire()?;
        let result = self.run_pass(store, source, classifier, cancel, on_progress);
        match &result {
            Ok(_) => self.set_phase(SyncPhase::Done),
            Err(e) => {
                self.set_phase(SyncPhase::Failed);
                match e {
                    SyncError::VersionCheckFailed(_) => warn!("sync skipped: {e}"),
                    SyncError::Cancelled { .. } => info!("{e}"),
                    _ => error!("sync failed: {e}"),
                }
            }
        }
        result
    }

    fn enter(&self, phase: SyncPhase, progress: &mut dyn FnMut(SyncProgress), committed: u64, skipped: u64) {
        self.set_phase(phase);
        debug!(phase = phase.as_str(), "sync phase");
        progress(SyncProgress {
            phase,
            committed,
            skipped,
        });
    }

    fn run_pass(
        &self,
        store: &ProductStore,
        source: &dyn DatasetSource,
        classifier: &Classifier,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(SyncProgress),
    ) -> Result<SyncOutcome, SyncError> {
        self.enter(SyncPhase::CheckingVersion, on_progress, 0, 0);
        let remote = source.remote_version()?;
        let local = store
            .version_marker()
            .map_err(|source| SyncError::StoreTransactionFailed {
                committed: 0,
                source,
            })?;

        if let Some(local) = local {
            if local >= remote && !self.options.force {
                info!(local, remote, "catalog already up to date");
                return Ok(SyncOutcome::UpToDate { version: local });
            }
        }
        info!(?local, remote, "new dataset available");

        self.enter(SyncPhase::Downloading, on_progress, 0, 0);
        let chunks = source.open_export()?;
        let session = store
            .begin_import()
            .map_err(|source| SyncError::StoreTransactionFailed {
                committed: 0,
                source,
            })?;

        self.enter(SyncPhase::Parsing, on_progress, 0, 0);
        let mut pass = Pass {
            session,
            batch: Vec::with_capacity(self.options.batch_size),
            stats: DecodeStats::default(),
            tagged: 0,
            on_progress,
        };
        let mut reader = ChunkReader::new(chunks);
        let received = self.stream_records(&mut reader, classifier, cancel, &mut pass)?;

        if !pass.batch.is_empty() {
            self.flush(&mut pass, cancel)?;
        }

        let stats = &pass.stats;
        if stats.skipped > 0 {
            warn!(
                skipped = stats.skipped,
                total = stats.total,
                last_error = ?stats.last_error,
                "dataset lines skipped"
            );
        }
        if stats.decoded == 0 || stats.exceeds(self.options.max_skip_ratio) {
            return Err(SyncError::CorruptDataset {
                skipped: stats.skipped,
                total: stats.total,
            });
        }

        let Pass {
            session,
            stats,
            tagged,
            ..
        } = pass;
        let imported = session
            .finish(Some(Generation {
                version_marker: remote,
                phrase_table_version: PHRASE_TABLE_VERSION,
            }))
            .map_err(|source| SyncError::StoreTransactionFailed {
                committed: stats.decoded,
                source,
            })?;

        info!(
            imported,
            skipped = stats.skipped,
            tagged,
            bytes = received,
            version = remote,
            "sync complete"
        );
        Ok(SyncOutcome::Updated(SyncReport {
            version: remote,
            previous_version: local,
            imported,
            skipped: stats.skipped,
            tagged,
        }))
    }

    /// Decompress and decode the whole export, flushing full batches along
    /// the way. Returns the compressed byte count.
    fn stream_records(
        &self,
        reader: &mut ChunkReader<'_>,
        classifier: &Classifier,
        cancel: &CancelToken,
        pass: &mut Pass<'_, '_>,
    ) -> Result<u64, SyncError> {
        let mut decoder = MultiGzDecoder::new(&mut *reader);
        let mut assembler = LineAssembler::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut line_no = 0u64;

        loop {
            let n = decoder
                .read(&mut buf)
                .map_err(|e| SyncError::DownloadFailed(format!("export stream interrupted: {e}")))?;
            if n == 0 {
                break;
            }
            for line in assembler.push(&buf[..n]) {
                line_no += 1;
                self.accept_line(&line, line_no, classifier, cancel, pass)?;
            }
        }
        if let Some(line) = assembler.finish() {
            line_no += 1;
            self.accept_line(&line, line_no, classifier, cancel, pass)?;
        }
        drop(decoder);
        Ok(reader.received)
    }

    fn accept_line(
        &self,
        line: &[u8],
        line_no: u64,
        classifier: &Classifier,
        cancel: &CancelToken,
        pass: &mut Pass<'_, '_>,
    ) -> Result<(), SyncError> {
        match decode_line(line, line_no) {
            Ok(None) => {}
            Ok(Some(mut product)) => {
                pass.stats.total += 1;
                pass.stats.decoded += 1;
                if product.apply_detected_tag(classifier) {
                    pass.tagged += 1;
                }
                pass.batch.push(product);
                if pass.batch.len() >= self.options.batch_size {
                    self.flush(pass, cancel)?;
                }
            }
            Err(e) => pass.stats.record_error(e),
        }
        Ok(())
    }

    fn flush(&self, pass: &mut Pass<'_, '_>, cancel: &CancelToken) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled {
                committed: pass.session.committed(),
            });
        }
        self.set_phase(SyncPhase::Committing);
        let committed = pass.session.commit_batch(&pass.batch).map_err(|source| {
            SyncError::StoreTransactionFailed {
                committed: pass.session.committed(),
                source,
            }
        })?;
        pass.batch.clear();
        info!(committed, "batch committed");
        self.enter(SyncPhase::Parsing, pass.on_progress, committed, pass.stats.skipped);
        // Let point lookups and other threads in between batches.
        std::thread::yield_now();

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled { committed });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::StoreError;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    pub(crate) struct MemorySource {
        pub version: Result<i64, String>,
        pub payload: Vec<u8>,
        pub chunk_size: usize,
        /// Fail the download after this many chunks.
        pub fail_after: Option<usize>,
    }

    impl MemorySource {
        pub(crate) fn new(version: i64, payload: Vec<u8>) -> Self {
            Self {
                version: Ok(version),
                payload,
                chunk_size: 7,
                fail_after: None,
            }
        }
    }

    impl DatasetSource for MemorySource {
        fn remote_version(&self) -> Result<i64, SyncError> {
            self.version.clone().map_err(SyncError::VersionCheckFailed)
        }

        fn open_export(&self) -> Result<ChunkStream<'_>, SyncError> {
            let fail_after = self.fail_after;
            Ok(Box::new(
                self.payload
                    .chunks(self.chunk_size)
                    .enumerate()
                    .map(move |(i, c)| match fail_after {
                        Some(limit) if i >= limit => Err(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "connection reset",
                        )),
                        _ => Ok(c.to_vec()),
                    }),
            ))
        }
    }

    pub(crate) fn record_line(i: usize, ingredients: &str) -> String {
        format!(
            r#"{{"c":"{:013}","n":"Item {i}","i":"{ingredients}","ns":"c","ng":3,"l":{}}}"#,
            i,
            1_700_000_000_000_i64 + i as i64
        )
    }

    pub(crate) fn gzip(lines: &[String]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        for line in lines {
            enc.write_all(line.as_bytes()).unwrap();
            enc.write_all(b"\n").unwrap();
        }
        enc.finish().unwrap()
    }

    pub(crate) fn dataset(n: usize) -> Vec<u8> {
        let lines: Vec<String> = (0..n).map(|i| record_line(i, "Sugar, cocoa")).collect();
        gzip(&lines)
    }

    fn run(
        sync: &Synchronizer,
        store: &ProductStore,
        source: &MemorySource,
    ) -> Result<SyncOutcome, SyncError> {
        sync.run(store, source, &Classifier::new(), &CancelToken::new(), &mut |_| {})
    }

    fn seeded_store(n: usize, version: i64) -> ProductStore {
        let store = ProductStore::open_in_memory().unwrap();
        let sync = Synchronizer::new(SyncOptions::default());
        run(&sync, &store, &MemorySource::new(version, dataset(n))).unwrap();
        store
    }

    #[test]
    fn test_line_assembler_carries_fragments() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"{\"c\":").is_empty());
        let lines = asm.push(b"\"1\"}\n{\"c\":\"2\"}\n{\"c\"");
        assert_eq!(lines, vec![b"{\"c\":\"1\"}".to_vec(), b"{\"c\":\"2\"}".to_vec()]);
        assert!(asm.push(b":\"3\"}").is_empty());
        assert_eq!(asm.finish(), Some(b"{\"c\":\"3\"}".to_vec()));
    }

    #[test]
    fn test_line_assembler_byte_at_a_time() {
        let input = b"alpha\nbeta\n\ngamma\n";
        let mut asm = LineAssembler::new();
        let mut lines = Vec::new();
        for b in input {
            lines.extend(asm.push(std::slice::from_ref(b)));
        }
        assert_eq!(
            lines,
            vec![b"alpha".to_vec(), b"beta".to_vec(), Vec::new(), b"gamma".to_vec()]
        );
        assert_eq!(asm.finish(), None);
    }

    #[test]
    fn test_decode_line_variants() {
        assert!(decode_line(b"", 1).unwrap().is_none());
        assert!(decode_line(b"  \r", 1).unwrap().is_none());
        assert!(decode_line(b"[", 1).unwrap().is_none());
        assert!(decode_line(b"]", 1).unwrap().is_none());

        let p = decode_line(b"{\"c\":\"42\",\"n\":\"Oats\"},\r", 3).unwrap().unwrap();
        assert_eq!(p.code, "42");
        assert_eq!(p.name.as_deref(), Some("Oats"));

        let err = decode_line(b"{\"c\":", 7).unwrap_err();
        assert_eq!(err.line, 7);
        assert!(decode_line(&[0xff, 0xfe], 8).is_err());
    }

    #[test]
    fn test_decode_stats_threshold() {
        let stats = DecodeStats {
            total: 200,
            decoded: 198,
            skipped: 2,
            last_error: None,
        };
        assert!(!stats.exceeds(0.01));
        let stats = DecodeStats {
            skipped: 3,
            ..stats
        };
        assert!(stats.exceeds(0.01));
    }

    #[test]
    fn test_import_streams_in_odd_chunks() {
        let store = ProductStore::open_in_memory().unwrap();
        let sync = Synchronizer::new(SyncOptions::default());
        let source = MemorySource::new(1_768_900_000_000, dataset(1203));

        let mut progress = Vec::new();
        let outcome = sync
            .run(&store, &source, &Classifier::new(), &CancelToken::new(), &mut |p| {
                if p.phase == SyncPhase::Parsing && p.committed > 0 {
                    progress.push(p.committed);
                }
            })
            .unwrap();

        assert_eq!(progress, vec![500, 1000, 1203]);
        match outcome {
            SyncOutcome::Updated(report) => {
                assert_eq!(report.imported, 1203);
                assert_eq!(report.skipped, 0);
                assert_eq!(report.version, 1_768_900_000_000);
                assert_eq!(report.previous_version, None);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.count().unwrap(), 1203);
        assert_eq!(store.version_marker().unwrap(), Some(1_768_900_000_000));
        assert_eq!(
            store.stats().unwrap().phrase_table_version,
            Some(PHRASE_TABLE_VERSION)
        );
        assert_eq!(sync.phase(), SyncPhase::Idle);
        assert!(!sync.is_running());
    }

    #[test]
    fn test_import_tags_detected_records() {
        let store = ProductStore::open_in_memory().unwrap();
        let sync = Synchronizer::new(SyncOptions::default());
        let lines = vec![
            record_line(1, "Vegetable Oil (Palm), Salt"),
            record_line(2, "Coconut, Palm Sugar"),
            r#"{"c":"3","i":"Palm oil","pt":"[\"en:palm-oil\"]"}"#.to_string(),
        ];
        let outcome = run(&sync, &store, &MemorySource::new(5, gzip(&lines))).unwrap();
        let SyncOutcome::Updated(report) = outcome else {
            panic!("expected update");
        };
        assert_eq!(report.tagged, 1);

        let tagged = store.get("0000000000001").unwrap().unwrap();
        assert!(tagged.palm_oil_tags.contains(crate::classifier::DETECTED_TAG));
        let clean = store.get("0000000000002").unwrap().unwrap();
        assert!(clean.palm_oil_tags.is_empty());
        let confirmed = store.get("3").unwrap().unwrap();
        assert_eq!(confirmed.palm_oil_tags.len(), 1);
    }

    #[test]
    fn test_array_rendering_accepted() {
        let store = ProductStore::open_in_memory().unwrap();
        let sync = Synchronizer::new(SyncOptions::default());
        let lines = vec![
            "[".to_string(),
            format!("{},", record_line(1, "Water")),
            format!("{},", record_line(2, "Salt")),
            record_line(3, "Sugar"),
            "]".to_string(),
        ];
        run(&sync, &store, &MemorySource::new(9, gzip(&lines))).unwrap();
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_up_to_date_skips_download() {
        let store = seeded_store(10, 100);
        let sync = Synchronizer::new(SyncOptions::default());
        // payload would fail if it were read
        let source = MemorySource::new(100, b"not gzip".to_vec());
        let outcome = run(&sync, &store, &source).unwrap();
        assert_eq!(outcome, SyncOutcome::UpToDate { version: 100 });
        assert_eq!(store.count().unwrap(), 10);

        let older = MemorySource::new(50, b"not gzip".to_vec());
        assert_eq!(
            run(&sync, &store, &older).unwrap(),
            SyncOutcome::UpToDate { version: 100 }
        );
    }

    #[test]
    fn test_force_reimports_same_version() {
        let store = seeded_store(10, 100);
        let sync = Synchronizer::new(SyncOptions {
            force: true,
            ..SyncOptions::default()
        });
        let outcome = run(&sync, &store, &MemorySource::new(100, dataset(4))).unwrap();
        assert!(matches!(outcome, SyncOutcome::Updated(_)));
        assert_eq!(store.count().unwrap(), 4);
    }

    #[test]
    fn test_truncated_payload_keeps_previous_generation() {
        let store = seeded_store(10, 100);
        let sync = Synchronizer::new(SyncOptions {
            batch_size: 50,
            ..SyncOptions::default()
        });
        let mut payload = dataset(2000);
        payload.truncate(payload.len() / 2);

        let err = run(&sync, &store, &MemorySource::new(200, payload)).unwrap_err();
        assert!(matches!(err, SyncError::DownloadFailed(_)), "{err}");
        assert!(err.is_retryable());
        assert_eq!(store.count().unwrap(), 10);
        assert_eq!(store.version_marker().unwrap(), Some(100));
        assert_eq!(sync.phase(), SyncPhase::Idle);
    }

    #[test]
    fn test_connection_drop_keeps_previous_generation() {
        let store = seeded_store(10, 100);
        let sync = Synchronizer::new(SyncOptions::default());
        let mut source = MemorySource::new(200, dataset(3000));
        source.chunk_size = 1024;
        source.fail_after = Some(8);

        let err = run(&sync, &store, &source).unwrap_err();
        assert!(matches!(err, SyncError::DownloadFailed(_)));
        assert_eq!(store.count().unwrap(), 10);
        assert_eq!(store.version_marker().unwrap(), Some(100));

        // a retry with a healthy stream installs everything
        source.fail_after = None;
        run(&sync, &store, &source).unwrap();
        assert_eq!(store.count().unwrap(), 3000);
        assert_eq!(store.version_marker().unwrap(), Some(200));
    }

    #[test]
    fn test_decode_failures_under_threshold_are_skipped() {
        let store = ProductStore::open_in_memory().unwrap();
        let sync = Synchronizer::new(SyncOptions::default());
        let mut lines: Vec<String> = (0..198).map(|i| record_line(i, "Flour")).collect();
        lines.insert(50, "{\"c\": broken".to_string());
        lines.insert(120, "{\"n\":\"no code\"}".to_string());

        let outcome = run(&sync, &store, &MemorySource::new(3, gzip(&lines))).unwrap();
        let SyncOutcome::Updated(report) = outcome else {
            panic!("expected update");
        };
        assert_eq!(report.imported, 198);
        assert_eq!(report.skipped, 2);
    }

    #[test]
    fn test_decode_failures_over_threshold_abort() {
        let store = seeded_store(10, 100);
        let sync = Synchronizer::new(SyncOptions::default());
        let mut lines: Vec<String> = (0..197).map(|i| record_line(i, "Flour")).collect();
        for at in [10, 20, 30] {
            lines.insert(at, "garbage".to_string());
        }

        let err = run(&sync, &store, &MemorySource::new(200, gzip(&lines))).unwrap_err();
        match err {
            SyncError::CorruptDataset { skipped, total } => {
                assert_eq!(skipped, 3);
                assert_eq!(total, 200);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.count().unwrap(), 10);
        assert_eq!(store.version_marker().unwrap(), Some(100));
    }

    #[test]
    fn test_empty_dataset_is_corrupt() {
        let store = seeded_store(10, 100);
        let sync = Synchronizer::new(SyncOptions::default());
        let err = run(&sync, &store, &MemorySource::new(200, gzip(&[]))).unwrap_err();
        assert!(matches!(err, SyncError::CorruptDataset { .. }));
        assert_eq!(store.count().unwrap(), 10);
    }

    #[test]
    fn test_invalid_record_aborts_with_progress() {
        let store = seeded_store(10, 100);
        let sync = Synchronizer::new(SyncOptions::default());
        let mut lines: Vec<String> = (0..1000).map(|i| record_line(i, "Flour")).collect();
        lines[700] = r#"{"c":"123","ng":9}"#.to_string();

        let err = run(&sync, &store, &MemorySource::new(200, gzip(&lines))).unwrap_err();
        match err {
            SyncError::StoreTransactionFailed { committed, source } => {
                assert_eq!(committed, 500);
                assert!(matches!(source, StoreError::InvalidRecord { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.count().unwrap(), 10);
        assert_eq!(store.version_marker().unwrap(), Some(100));
    }

    #[test]
    fn test_cancel_at_batch_boundary() {
        let store = seeded_store(10, 100);
        let sync = Synchronizer::new(SyncOptions::default());
        let cancel = CancelToken::new();
        let source = MemorySource::new(200, dataset(1500));

        let err = sync
            .run(&store, &source, &Classifier::new(), &cancel, &mut |p| {
                if p.committed >= 500 {
                    cancel.cancel();
                }
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled { committed: 500 }));
        assert_eq!(store.count().unwrap(), 10);
        assert_eq!(store.version_marker().unwrap(), Some(100));
    }

    #[test]
    fn test_version_check_failure() {
        let store = seeded_store(10, 100);
        let sync = Synchronizer::new(SyncOptions::default());
        let source = MemorySource {
            version: Err("unexpected content type text/html".to_string()),
            ..MemorySource::new(0, Vec::new())
        };
        let err = run(&sync, &store, &source).unwrap_err();
        assert!(matches!(err, SyncError::VersionCheckFailed(_)));
        assert_eq!(sync.phase(), SyncPhase::Idle);
        assert_eq!(store.count().unwrap(), 10);
    }

    #[test]
    fn test_second_pass_rejected_while_running() {
        let store = ProductStore::open_in_memory().unwrap();
        let sync = Synchronizer::new(SyncOptions::default());
        let guard = sync.acquire().unwrap();
        assert!(sync.is_running());

        let err = run(&sync, &store, &MemorySource::new(1, dataset(3))).unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning));
        drop(guard);

        run(&sync, &store, &MemorySource::new(1, dataset(3))).unwrap();
        assert_eq!(store.count().unwrap(), 3);
    }
}
