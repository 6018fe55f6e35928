use core::time::Duration;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use vecdata_channel::{
    AdaptiveScheduler, AggressiveScheduler, ChannelConfig, ChannelError, ChannelOptions,
    ChunkError, ChunkScheduler, ConservativeScheduler, MerkleChannel,
};
use vecdata_merkle::build_reference;
use vecdata_transport::{FileTransport, RangeResponse, Transport, TransportError, TransportResult};

const CHUNK: u64 = 256 << 10;

/// Counts fetches so tests can assert dedup and idempotency.
#[derive(Debug)]
struct CountingTransport {
    inner: FileTransport,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn fetch(&self, offset: u64, length: u64) -> TransportResult<RangeResponse> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.fetch(offset, length).await
    }

    fn locator(&self) -> String {
        self.inner.locator()
    }
}

/// Fails the first `failures` fetches, then delegates.
#[derive(Debug)]
struct FlakyTransport {
    inner: FileTransport,
    failures: AtomicUsize,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn fetch(&self, offset: u64, length: u64) -> TransportResult<RangeResponse> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n > 0).then(|| n - 1)
        })
        .is_ok()
        {
            return Err(TransportError::Status {
                url: self.inner.locator(),
                status: 503,
            });
        }
        self.inner.fetch(offset, length).await
    }

    fn locator(&self) -> String {
        self.inner.locator()
    }
}

struct Fixture {
    _dir: TempDir,
    origin: PathBuf,
    mref: PathBuf,
    cache: PathBuf,
    data: Vec<u8>,
}

fn fixture_with(data: Vec<u8>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let origin = dir.path().join("base.fvec");
    let mref = dir.path().join("base.fvec.mref");
    let cache = dir.path().join("cache").join("base.fvec");
    fs::create_dir_all(cache.parent().unwrap()).unwrap();

    fs::write(&origin, &data).unwrap();
    let _ = build_reference(&origin, &mref, Some(CHUNK), |_, _| {}).unwrap();

    Fixture {
        _dir: dir,
        origin,
        mref,
        cache,
        data,
    }
}

fn repeating_fixture(len: usize, byte: u8) -> Fixture {
    fixture_with(vec![byte; len])
}

fn random_fixture(len: usize, seed: u64) -> Fixture {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0_u8; len];
    rng.fill(&mut data[..]);
    fixture_with(data)
}

fn test_config() -> ChannelConfig {
    ChannelConfig {
        retry_attempts: 2,
        retry_base_delay: Duration::from_millis(10),
        transport_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(5),
        ..ChannelConfig::default()
    }
}

fn counting_transport(origin: &Path) -> (Arc<CountingTransport>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = Arc::new(CountingTransport {
        inner: FileTransport::new(origin),
        calls: Arc::clone(&calls),
        delay: None,
    });
    (transport, calls)
}

async fn open_channel(
    fixture: &Fixture,
    scheduler: Option<Arc<dyn ChunkScheduler>>,
) -> (MerkleChannel, Arc<AtomicUsize>) {
    let (transport, calls) = counting_transport(&fixture.origin);

    let mut options = ChannelOptions::new(&fixture.mref, &fixture.cache);
    options.config = test_config();
    options.scheduler = scheduler;

    let channel = MerkleChannel::open(transport, options).await.unwrap();
    (channel, calls)
}

#[tokio::test]
async fn fresh_full_read_verifies_every_chunk() {
    // 1 MiB of 0xA5 in four 256 KiB chunks, read in one request.
    let fixture = repeating_fixture(1 << 20, 0xA5);
    let (channel, calls) = open_channel(&fixture, None).await;

    let mut buf = vec![0_u8; 1 << 20];
    let n = channel.read_at(&mut buf, 0).await.unwrap();

    assert_eq!(n, 1 << 20);
    assert!(buf.iter().all(|&b| b == 0xA5));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    for chunk in 0..4 {
        assert!(channel.state().is_valid(chunk));
    }
    assert_eq!(channel.in_flight_count(), 0);
}

#[tokio::test]
async fn aggressive_policy_fetches_contiguous_run_in_one_call() {
    let fixture = repeating_fixture(1 << 20, 0xA5);
    let (channel, calls) =
        open_channel(&fixture, Some(Arc::new(AggressiveScheduler::default()))).await;

    let mut buf = vec![0_u8; 1 << 20];
    let n = channel.read_at(&mut buf, 0).await.unwrap();

    assert_eq!(n, 1 << 20);
    assert!(buf.iter().all(|&b| b == 0xA5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(channel.state().is_complete());
}

#[tokio::test]
async fn warm_cache_serves_without_transport() {
    let fixture = repeating_fixture(1 << 20, 0xA5);

    {
        let (channel, _) = open_channel(&fixture, None).await;
        let mut buf = vec![0_u8; 1 << 20];
        let _ = channel.read_at(&mut buf, 0).await.unwrap();
        channel.close().await.unwrap();
    }

    // Reopen against the populated cache and state.
    let (channel, calls) = open_channel(&fixture, None).await;
    let mut buf = vec![0_u8; 262_144];
    let n = channel.read_at(&mut buf, 262_144).await.unwrap();

    assert_eq!(n, 262_144);
    assert!(buf.iter().all(|&b| b == 0xA5));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(channel.state().count_valid(), 4);
}

#[tokio::test]
async fn partial_read_only_validates_touched_chunks() {
    let fixture = random_fixture((1 << 20) + 100, 42);
    let (channel, _) = open_channel(&fixture, None).await;

    // A window straddling chunks 1 and 2.
    let mut buf = vec![0_u8; 300_000];
    let n = channel.read_at(&mut buf, 300_000).await.unwrap();

    assert_eq!(n, 300_000);
    assert_eq!(buf, fixture.data[300_000..600_000]);
    assert!(!channel.state().is_valid(0));
    assert!(channel.state().is_valid(1));
    assert!(channel.state().is_valid(2));
    assert!(!channel.state().is_valid(3));
    assert!(!channel.state().is_valid(4));
}

#[tokio::test]
async fn every_byte_matches_source_across_strided_reads() {
    let fixture = random_fixture((2 << 20) + 317, 7);
    let (channel, _) = open_channel(&fixture, None).await;

    let mut assembled = Vec::with_capacity(fixture.data.len());
    let mut position = 0_u64;
    // Odd-sized windows so reads land on every kind of chunk boundary.
    let mut buf = vec![0_u8; 70_001];

    loop {
        let n = channel.read_at(&mut buf, position).await.unwrap();
        if n == 0 {
            break;
        }
        assembled.extend_from_slice(&buf[..n]);
        position += n as u64;
    }

    assert_eq!(assembled, fixture.data);
    assert!(channel.state().is_complete());
}

#[tokio::test]
async fn overlapping_reads_share_one_fetch() {
    // Four concurrent reads of the same 1 MiB window of a 4 MiB file.
    let fixture = random_fixture(4 << 20, 13);
    let (channel, calls) = open_channel(&fixture, None).await;

    let window = 1_u64 << 20;
    let offset = 2 * window;

    let read = |_: usize| {
        let channel = &channel;
        async move {
            let mut buf = vec![0_u8; window as usize];
            let n = channel.read_at(&mut buf, offset).await.unwrap();
            (n, buf)
        }
    };

    let (a, b, c, d) = tokio::join!(read(0), read(1), read(2), read(3));

    for (n, buf) in [a, b, c, d] {
        assert_eq!(n, window as usize);
        assert_eq!(buf, fixture.data[offset as usize..(offset + window) as usize]);
    }

    // The window covers four chunks; each was fetched exactly once.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn tampered_origin_fails_every_chunk_and_marks_nothing() {
    let fixture = random_fixture(1 << 20, 99);

    // Replace the origin with same-size different content after the
    // reference was built.
    let mut other = fixture.data.clone();
    for byte in &mut other {
        *byte ^= 0x5A;
    }
    fs::write(&fixture.origin, &other).unwrap();

    let (channel, _) = open_channel(&fixture, None).await;
    let mut buf = vec![0_u8; 1 << 20];

    match channel.read_at(&mut buf, 0).await {
        Err(ChannelError::ChunksFailed { failures }) => {
            let mut chunks: Vec<u64> = failures.iter().map(ChunkError::chunk).collect();
            chunks.sort_unstable();
            chunks.dedup();
            assert_eq!(chunks, vec![0, 1, 2, 3]);
            assert!(failures
                .iter()
                .all(|f| matches!(f, ChunkError::HashMismatch { .. })));
        }
        other => panic!("expected hash mismatches, got {other:?}"),
    }

    assert_eq!(channel.state().count_valid(), 0);
}

#[tokio::test]
async fn tampered_cache_is_served_until_reverify_clears_it() {
    let fixture = repeating_fixture(1 << 20, 0xA5);

    {
        let (channel, _) = open_channel(&fixture, None).await;
        let mut buf = vec![0_u8; 1 << 20];
        let _ = channel.read_at(&mut buf, 0).await.unwrap();
        channel.close().await.unwrap();
    }

    // Flip one cached byte inside chunk 1 while its state bit stays set.
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(&fixture.cache)
        .unwrap();
    file.seek(SeekFrom::Start(500_000)).unwrap();
    file.write_all(&[0x00]).unwrap();
    drop(file);

    let (channel, calls) = open_channel(&fixture, None).await;

    // The read path trusts the state bit: the tampered byte is served and
    // no fetch happens.
    let mut buf = vec![0_u8; 262_144];
    let _ = channel.read_at(&mut buf, 262_144).await.unwrap();
    assert_eq!(buf[500_000 - 262_144], 0x00);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Explicit re-validation detects exactly the tampered chunk.
    let cleared = channel.reverify().await.unwrap();
    assert_eq!(cleared, vec![1]);
    assert!(!channel.state().is_valid(1));

    // The next read re-fetches it and serves verified bytes again.
    let n = channel.read_at(&mut buf, 262_144).await.unwrap();
    assert_eq!(n, 262_144);
    assert!(buf.iter().all(|&b| b == 0xA5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resume_refetches_only_the_unfinished_chunk() {
    let fixture = random_fixture(1 << 20, 5);

    // First run verifies chunks 0..=2, then the process "dies" without a
    // clean close.
    {
        let (channel, calls) = open_channel(&fixture, None).await;
        let mut buf = vec![0_u8; (3 * CHUNK) as usize];
        let n = channel.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        drop(channel);
    }

    // Chunk 3's cache region holds a partial, unrecorded write.
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(&fixture.cache)
        .unwrap();
    file.seek(SeekFrom::Start(3 * CHUNK)).unwrap();
    file.write_all(&[0xEE; 1000]).unwrap();
    drop(file);

    let (channel, calls) = open_channel(&fixture, None).await;
    assert_eq!(channel.state().count_valid(), 3);

    let mut buf = vec![0_u8; 1 << 20];
    let n = channel.read_at(&mut buf, 0).await.unwrap();

    assert_eq!(n, 1 << 20);
    assert_eq!(buf, fixture.data);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(channel.state().is_complete());
}

#[tokio::test]
async fn scheduler_swap_mid_run_converges_to_the_same_bytes() {
    let fixture = random_fixture(4 << 20, 23);
    let (channel, _) = open_channel(&fixture, None).await;

    let mut first_half = vec![0_u8; 2 << 20];
    let n = channel.read_at(&mut first_half, 0).await.unwrap();
    assert_eq!(n, 2 << 20);

    channel.set_scheduler(Arc::new(AggressiveScheduler::default()));

    let mut second_half = vec![0_u8; 2 << 20];
    let n = channel.read_at(&mut second_half, 2 << 20).await.unwrap();
    assert_eq!(n, 2 << 20);

    let mut assembled = first_half;
    assembled.extend_from_slice(&second_half);
    assert_eq!(assembled, fixture.data);
    assert!(channel.state().is_complete());
}

#[tokio::test]
async fn conservative_policy_completes_in_bounded_rounds() {
    let fixture = random_fixture(2 << 20, 31);
    let (channel, calls) = open_channel(
        &fixture,
        Some(Arc::new(ConservativeScheduler { max_new_tasks: 2 })),
    )
    .await;

    let mut buf = vec![0_u8; 2 << 20];
    let n = channel.read_at(&mut buf, 0).await.unwrap();

    assert_eq!(n, 2 << 20);
    assert_eq!(buf, fixture.data);
    assert!(channel.state().is_complete());
    // One leaf fetch per chunk, spread over multiple scheduling rounds.
    assert_eq!(calls.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn adaptive_policy_reads_correctly_from_cold_start() {
    let fixture = random_fixture(2 << 20, 37);
    let (channel, _) =
        open_channel(&fixture, Some(Arc::new(AdaptiveScheduler::default()))).await;

    let mut buf = vec![0_u8; 2 << 20];
    let n = channel.read_at(&mut buf, 0).await.unwrap();

    assert_eq!(n, 2 << 20);
    assert_eq!(buf, fixture.data);
    assert!(channel.state().is_complete());
}

#[tokio::test]
async fn prebuffer_reports_progress_and_shares_work_with_reads() {
    let fixture = random_fixture(2 << 20, 57);
    let (channel, calls) = open_channel(&fixture, None).await;

    let progress = channel.prebuffer(0, 2 << 20);
    progress.wait().await;

    assert!(progress.is_complete());
    assert!(progress.failures().is_empty());
    assert!((progress.fraction_complete() - 1.0).abs() < f64::EPSILON);
    assert!((progress.total_work() - 8.0).abs() < f64::EPSILON);
    assert!((progress.bytes_per_unit() - CHUNK as f64).abs() < f64::EPSILON);

    let after_prebuffer = calls.load(Ordering::SeqCst);
    assert_eq!(after_prebuffer, 8);

    // Reads of prebuffered ranges never touch the transport again.
    let mut buf = vec![0_u8; 2 << 20];
    let n = channel.read_at(&mut buf, 0).await.unwrap();
    assert_eq!(n, 2 << 20);
    assert_eq!(buf, fixture.data);
    assert_eq!(calls.load(Ordering::SeqCst), after_prebuffer);
}

#[tokio::test]
async fn await_prebuffer_surfaces_chunk_failures() {
    let fixture = random_fixture(1 << 20, 61);

    let mut other = fixture.data.clone();
    other[0] ^= 0xFF;
    fs::write(&fixture.origin, &other).unwrap();

    let (channel, _) = open_channel(&fixture, None).await;

    match channel.await_prebuffer(0, CHUNK).await {
        Err(ChannelError::ChunksFailed { failures }) => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0], ChunkError::HashMismatch { chunk: 0, .. }));
        }
        other => panic!("expected chunk failure, got {other:?}"),
    }
}

#[tokio::test]
async fn transient_transport_errors_are_retried() {
    let fixture = random_fixture(CHUNK as usize, 71);

    let calls = Arc::new(AtomicUsize::new(0));
    let transport = Arc::new(FlakyTransport {
        inner: FileTransport::new(&fixture.origin),
        failures: AtomicUsize::new(1),
        calls: Arc::clone(&calls),
    });

    let mut options = ChannelOptions::new(&fixture.mref, &fixture.cache);
    options.config = test_config();
    let channel = MerkleChannel::open(transport, options).await.unwrap();

    let mut buf = vec![0_u8; CHUNK as usize];
    let n = channel.read_at(&mut buf, 0).await.unwrap();

    assert_eq!(n, CHUNK as usize);
    assert_eq!(buf, fixture.data);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_retries_fail_the_read_but_not_the_channel() {
    let fixture = random_fixture((2 * CHUNK) as usize, 73);

    let calls = Arc::new(AtomicUsize::new(0));
    let transport = Arc::new(FlakyTransport {
        inner: FileTransport::new(&fixture.origin),
        failures: AtomicUsize::new(usize::MAX),
        calls: Arc::clone(&calls),
    });

    let mut options = ChannelOptions::new(&fixture.mref, &fixture.cache);
    options.config = test_config();
    let channel = MerkleChannel::open(transport, options).await.unwrap();

    let mut buf = vec![0_u8; CHUNK as usize];
    match channel.read_at(&mut buf, 0).await {
        Err(ChannelError::ChunksFailed { failures }) => {
            assert!(matches!(
                failures[0],
                ChunkError::TransportFailure { chunk: 0, attempts: 2, .. }
            ));
        }
        other => panic!("expected transport failure, got {other:?}"),
    }

    assert!(!channel.state().is_valid(0));
    assert_eq!(channel.in_flight_count(), 0);
}

#[tokio::test]
async fn dropped_read_future_does_not_abort_background_work() {
    let fixture = random_fixture(CHUNK as usize, 79);

    let calls = Arc::new(AtomicUsize::new(0));
    let transport = Arc::new(CountingTransport {
        inner: FileTransport::new(&fixture.origin),
        calls: Arc::clone(&calls),
        delay: Some(Duration::from_millis(100)),
    });

    let mut options = ChannelOptions::new(&fixture.mref, &fixture.cache);
    options.config = test_config();
    let channel = MerkleChannel::open(transport, options).await.unwrap();

    {
        let mut buf = vec![0_u8; CHUNK as usize];
        let read = channel.read_at(&mut buf, 0);
        // Give the fetch time to start, then abandon the waiter.
        let _ = tokio::time::timeout(Duration::from_millis(20), read).await;
    }

    // The detached fetch completes and populates the cache anyway.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(channel.state().is_valid(0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut buf = vec![0_u8; CHUNK as usize];
    let n = channel.read_at(&mut buf, 0).await.unwrap();
    assert_eq!(n, CHUNK as usize);
    assert_eq!(buf, fixture.data);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reads_past_eof_are_empty_and_tail_reads_are_short() {
    let fixture = random_fixture((CHUNK + 100) as usize, 83);
    let (channel, _) = open_channel(&fixture, None).await;

    let mut buf = vec![0_u8; 1000];
    assert_eq!(channel.read_at(&mut buf, CHUNK + 100).await.unwrap(), 0);

    let n = channel.read_at(&mut buf, CHUNK + 50).await.unwrap();
    assert_eq!(n, 50);
    assert_eq!(buf[..50], fixture.data[(CHUNK + 50) as usize..]);
}

#[tokio::test]
async fn closed_channel_rejects_reads() {
    let fixture = random_fixture(CHUNK as usize, 89);
    let (channel, _) = open_channel(&fixture, None).await;

    channel.close().await.unwrap();
    // Close is idempotent.
    channel.close().await.unwrap();

    let mut buf = vec![0_u8; 16];
    assert!(matches!(
        channel.read_at(&mut buf, 0).await,
        Err(ChannelError::Closed)
    ));
}
