use anyhow::Result;
use common::restart::{RestartInfo, RestartOperation, RestartPolicy, RestartSegment};
use common::TransferConfig;
use remote::{ErrorKind, PortalServer, TransferEngine, TransferRequest};

const SIZE: u64 = 100_003;
const OBJ_PATH: &str = "/tempZone/home/rods/payload.bin";

fn config() -> TransferConfig {
    TransferConfig {
        trans_buf_size: 4096,
        chunk_size: 10_000,
        min_restart_size: 1024,
        restart_flush_threshold: 8192,
        connect_timeout: std::time::Duration::from_secs(10),
        io_timeout: std::time::Duration::from_secs(10),
        ..Default::default()
    }
}

fn localhost() -> std::net::IpAddr {
    std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

fn random_bytes(len: u64) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

fn key(byte: u8) -> Option<remote::EncryptionContext> {
    Some(remote::EncryptionContext::new(&[byte; 32]).unwrap())
}

struct Fixture {
    _tmp_dir: tempfile::TempDir,
    data: Vec<u8>,
    client_file: std::path::PathBuf,
    server_file: std::path::PathBuf,
    restart_file: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Result<Self> {
        let tmp_dir = tempfile::tempdir()?;
        Ok(Self {
            data: random_bytes(SIZE),
            client_file: tmp_dir.path().join("client.bin"),
            server_file: tmp_dir.path().join("server.bin"),
            restart_file: tmp_dir.path().join("client.bin.restart"),
            _tmp_dir: tmp_dir,
        })
    }

    fn request(&self, portal: remote::PortalAddr, thread_count: usize) -> TransferRequest {
        TransferRequest {
            portal,
            local_path: self.client_file.clone(),
            obj_path: OBJ_PATH.to_string(),
            size: SIZE,
            thread_count,
            restart_file: Some(self.restart_file.clone()),
        }
    }

    /// Checkpoint of an interrupted transfer plus a target file holding exactly the covered bytes.
    async fn interrupted(
        &self,
        operation: RestartOperation,
        segments: &[RestartSegment],
        target: &std::path::Path,
    ) -> Result<RestartInfo> {
        let mut info = RestartInfo::begin(
            operation,
            &self.client_file,
            OBJ_PATH,
            SIZE,
            segments.len(),
            &RestartPolicy::from(&config()),
        );
        info.segments = segments.to_vec();
        info.save(&self.restart_file).await?;
        let mut partial = vec![0u8; SIZE as usize];
        for seg in segments {
            let range = seg.offset as usize..seg.end() as usize;
            partial[range.clone()].copy_from_slice(&self.data[range]);
        }
        tokio::fs::write(target, &partial).await?;
        Ok(info)
    }
}

async fn put_round_trip(thread_count: usize, encrypted: bool) -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.client_file, &fixture.data).await?;
    let crypt = |byte| if encrypted { key(byte) } else { None };
    let server = PortalServer::new(config(), crypt(7))?;
    let engine = TransferEngine::new(config(), crypt(7))?;
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, thread_count);
    let (sent, received) = tokio::join!(
        engine.put(&request),
        server.serve_put(&listener, &fixture.server_file, SIZE, thread_count),
    );
    let sent = sent?;
    let received = received?;
    assert_eq!(sent.bytes_transferred, SIZE);
    assert_eq!(received.bytes_transferred, SIZE);
    assert_eq!(sent.workers, thread_count);
    assert_eq!(tokio::fs::read(&fixture.server_file).await?, fixture.data);
    assert!(!fixture.restart_file.exists());
    Ok(())
}

async fn get_round_trip(thread_count: usize, encrypted: bool) -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.server_file, &fixture.data).await?;
    let crypt = |byte| if encrypted { key(byte) } else { None };
    let server = PortalServer::new(config(), crypt(9))?;
    let engine = TransferEngine::new(config(), crypt(9))?;
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, thread_count);
    let (received, sent) = tokio::join!(
        engine.get(&request),
        server.serve_get(&listener, &fixture.server_file, SIZE, thread_count),
    );
    assert_eq!(received?.bytes_transferred, SIZE);
    assert_eq!(sent?.bytes_transferred, SIZE);
    assert_eq!(tokio::fs::read(&fixture.client_file).await?, fixture.data);
    assert!(!fixture.restart_file.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_single_thread() -> Result<()> {
    put_round_trip(1, false).await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_many_threads() -> Result<()> {
    put_round_trip(5, false).await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_many_threads_encrypted() -> Result<()> {
    put_round_trip(4, true).await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_single_thread_encrypted() -> Result<()> {
    get_round_trip(1, true).await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_many_threads() -> Result<()> {
    get_round_trip(16, false).await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_too_many_threads_is_rejected_after_draining() -> Result<()> {
    let fixture = Fixture::new()?;
    let server = PortalServer::new(config(), None)?;
    let engine = TransferEngine::new(config(), None)?;
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, 17);
    let (err, accepted) = tokio::join!(engine.put(&request), listener.accept(17));
    let err = err.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooManyThreads);
    // every requested connection was opened, so the listening side is not left waiting
    assert_eq!(accepted?.len(), 17);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_short_get_is_length_mismatch() -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.server_file, &fixture.data).await?;
    let server = PortalServer::new(config(), None)?;
    let engine = TransferEngine::new(config(), None)?;
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, 3);
    let (received, sent) = tokio::join!(
        engine.get(&request),
        server.serve_get(&listener, &fixture.server_file, SIZE - 10, 3),
    );
    assert_eq!(sent?.bytes_transferred, SIZE - 10);
    let err = received.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransferLengthMismatch);
    assert_eq!(err.summary.bytes_transferred, SIZE - 10);
    // the progress made is kept for a resume
    let saved = RestartInfo::load(&fixture.restart_file).await?;
    assert_eq!(saved.bytes_done(), SIZE - 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_of_resized_file_is_length_mismatch() -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.client_file, &fixture.data[..1000]).await?;
    let server = PortalServer::new(config(), None)?;
    let engine = TransferEngine::new(config(), None)?;
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, 2);
    let (sent, received) = tokio::join!(
        engine.put(&request),
        server.serve_put(&listener, &fixture.server_file, SIZE, 2),
    );
    assert_eq!(sent.unwrap_err().kind(), ErrorKind::TransferLengthMismatch);
    assert!(received.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_key_fails_authentication() -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.server_file, &fixture.data).await?;
    let server = PortalServer::new(config(), key(1))?;
    let engine = TransferEngine::new(config(), key(2))?;
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, 2);
    let (received, _sent) = tokio::join!(
        engine.get(&request),
        server.serve_get(&listener, &fixture.server_file, SIZE, 2),
    );
    assert_eq!(received.unwrap_err().kind(), ErrorKind::Crypto);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupt_checkpoint_restarts_from_zero() -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.server_file, &fixture.data).await?;
    tokio::fs::write(&fixture.restart_file, b"definitely not a checkpoint").await?;
    let server = PortalServer::new(config(), None)?;
    let engine = TransferEngine::new(config(), None)?;
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, 3);
    assert_eq!(
        engine.plan_resume(RestartOperation::Get, &request).await,
        remote::ResumePlan::Restart
    );
    let (received, sent) = tokio::join!(
        engine.resume_get(&request),
        server.serve_get(&listener, &fixture.server_file, SIZE, 3),
    );
    assert_eq!(received?.bytes_transferred, SIZE);
    sent?;
    assert_eq!(tokio::fs::read(&fixture.client_file).await?, fixture.data);
    assert!(!fixture.restart_file.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_get_moves_only_gaps() -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.server_file, &fixture.data).await?;
    let third = SIZE / 3;
    let segments = [
        RestartSegment {
            offset: 0,
            len: 5000,
        },
        RestartSegment {
            offset: third,
            len: third,
        },
        RestartSegment {
            offset: 2 * third + 100,
            len: 7000,
        },
    ];
    let info = fixture
        .interrupted(RestartOperation::Get, &segments, &fixture.client_file)
        .await?;
    let gaps: Vec<(u64, u64)> = info.resume().iter().map(|gap| (gap.offset, gap.len)).collect();
    assert_eq!(
        gaps.iter().map(|(_, len)| len).sum::<u64>(),
        SIZE - info.bytes_done()
    );
    let server = PortalServer::new(config(), None)?;
    let engine = TransferEngine::new(config(), None)?;
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, 3);
    let (received, sent) = tokio::join!(
        engine.resume_get(&request),
        server.serve_get_ranges(&listener, &fixture.server_file, SIZE, &gaps),
    );
    assert_eq!(received?.bytes_transferred, SIZE - info.bytes_done());
    sent?;
    assert_eq!(tokio::fs::read(&fixture.client_file).await?, fixture.data);
    assert!(!fixture.restart_file.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_put_moves_only_gaps() -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.client_file, &fixture.data).await?;
    let half = SIZE / 2;
    let segments = [
        RestartSegment {
            offset: 1000,
            len: 20_000,
        },
        RestartSegment {
            offset: half,
            len: 30_000,
        },
    ];
    let info = fixture
        .interrupted(RestartOperation::Put, &segments, &fixture.server_file)
        .await?;
    let gaps: Vec<(u64, u64)> = info.resume().iter().map(|gap| (gap.offset, gap.len)).collect();
    let server = PortalServer::new(config(), key(3))?;
    let engine = TransferEngine::new(config(), key(3))?;
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, 2);
    let (sent, received) = tokio::join!(
        engine.resume_put(&request),
        server.serve_put_ranges(&listener, &fixture.server_file, SIZE, &gaps),
    );
    assert_eq!(sent?.bytes_transferred, SIZE - 50_000);
    received?;
    assert_eq!(tokio::fs::read(&fixture.server_file).await?, fixture.data);
    assert!(!fixture.restart_file.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupted_get_resumes_to_identical_file() -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.server_file, &fixture.data).await?;
    let server = PortalServer::new(config(), None)?;
    let engine = TransferEngine::new(config(), None)?;
    // first attempt: the server goes away after sending the first 40000 bytes
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, 1);
    let (received, _) = tokio::join!(
        engine.get(&request),
        server.serve_get_ranges(&listener, &fixture.server_file, SIZE, &[(0, 40_000)]),
    );
    assert_eq!(received.unwrap_err().kind(), ErrorKind::TransferLengthMismatch);
    let info = RestartInfo::load(&fixture.restart_file).await?;
    assert_eq!(info.bytes_done(), 40_000);
    let gaps: Vec<(u64, u64)> = info.resume().iter().map(|gap| (gap.offset, gap.len)).collect();
    assert_eq!(gaps, vec![(40_000, SIZE - 40_000)]);
    // second attempt moves the rest
    let listener = server.listen(localhost()).await?;
    let request = fixture.request(listener.portal_addr()?, 1);
    let (received, sent) = tokio::join!(
        engine.resume_get(&request),
        server.serve_get_ranges(&listener, &fixture.server_file, SIZE, &gaps),
    );
    assert_eq!(received?.bytes_transferred, SIZE - 40_000);
    sent?;
    assert_eq!(tokio::fs::read(&fixture.client_file).await?, fixture.data);
    assert!(!fixture.restart_file.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_portal_aborts_transfer() -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.client_file, &fixture.data).await?;
    let closed = tokio::net::TcpListener::bind((localhost(), 0)).await?;
    let portal = remote::PortalAddr {
        addr: closed.local_addr()?,
        cookie: 42,
    };
    drop(closed);
    let engine = TransferEngine::new(config(), None)?;
    let err = engine.put(&fixture.request(portal, 3)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
    assert_eq!(err.summary.bytes_transferred, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_data_past_declared_size_is_framing_error() -> Result<()> {
    let fixture = Fixture::new()?;
    tokio::fs::write(&fixture.server_file, &fixture.data).await?;
    let server = PortalServer::new(config(), None)?;
    let engine = TransferEngine::new(config(), None)?;
    let listener = server.listen(localhost()).await?;
    let request = TransferRequest {
        size: 10_000,
        ..fixture.request(listener.portal_addr()?, 1)
    };
    let (received, _sent) = tokio::join!(
        engine.get(&request),
        server.serve_get(&listener, &fixture.server_file, 20_000, 1),
    );
    let err = received.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FramingError);
    assert!(format!("{err:#}").contains("exceeds object size"), "{err:#}");
    // nothing past the declared size reached the local file
    assert_eq!(tokio::fs::metadata(&fixture.client_file).await?.len(), 10_000);
    Ok(())
}
