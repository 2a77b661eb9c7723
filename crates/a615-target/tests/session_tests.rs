//! TFTP sessions against a running maintenance stack.

mod common;

use a615_codec::{
    AccumulationBuffer, ArincStatusCode, LoadUploadRequest, MAX_LUR_SIZE, RecordKind, parse_lui,
    parse_lus,
};
use a615_target::event::{EventReceiver, event_channel};
use a615_target::stack::{MaintenanceStack, StackSettings};
use a615_target::tftp::packet::{OCTET_MODE, Packet, ack_packet, data_packet};
use a615_target::{EventKind, TargetConfig};
use common::{
    FakeGse, LOAD_PART_NUMBER, Loader, PART_NUMBER, TestResult, WAIT, sample_lur, temp_dir,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    stack: MaintenanceStack,
    events: EventReceiver,
    root_dir: PathBuf,
    gse: FakeGse,
}

impl Harness {
    async fn start(files: HashMap<String, Vec<u8>>) -> TestResult<Self> {
        let gse = FakeGse::start(files).await?;
        let root_dir = temp_dir("session")?;
        let mut settings = StackSettings::from(&TargetConfig::default());
        settings.bind_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        settings.root_dir = root_dir.clone();
        settings.gse_get_addr = gse.get_addr;
        settings.gse_put_addr = gse.put_addr;
        settings.session_recv = Duration::from_secs(1);
        settings.client_recv = Duration::from_millis(300);

        let (sender, events) = event_channel(16, None)?;
        let stack = MaintenanceStack::start(
            &settings,
            Arc::new(AccumulationBuffer::for_lur()),
            sender,
            &CancellationToken::new(),
        )
        .await?;
        Ok(Self {
            stack,
            events,
            root_dir,
            gse,
        })
    }

    async fn next_event(&mut self) -> TestResult<a615_target::Event> {
        tokio::time::timeout(WAIT, self.events.recv())
            .await?
            .ok_or_else(|| "event queue closed".into())
    }

    async fn loader(&self) -> TestResult<Loader> {
        Loader::new(self.stack.local_addr()).await
    }
}

fn rrq(filename: &str) -> Packet {
    Packet::Rrq {
        filename: filename.to_string(),
        mode: OCTET_MODE.to_string(),
    }
}

fn wrq(filename: &str) -> Packet {
    Packet::Wrq {
        filename: filename.to_string(),
        mode: OCTET_MODE.to_string(),
    }
}

async fn read_lui(harness: &Harness, filename: &str) -> TestResult<(ArincStatusCode, String)> {
    let mut loader = harness.loader().await?;
    loader.send_request(rrq(filename)).await?;
    let payload = match loader.recv().await? {
        Packet::Data { block: 1, payload } => payload,
        other => return Err(format!("expected DATA 1, got {other:?}").into()),
    };
    assert!(payload.len() < 512, "LUI fits in a single block");
    loader.send_session(&ack_packet(1)).await?;
    let lui = parse_lui(&payload)?;
    Ok((lui.status, lui.description))
}

#[tokio::test]
async fn rrq_without_part_number_is_not_accepted() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let (status, description) = read_lui(&harness, "OTHER-DEVICE.LUI").await?;
    assert_eq!(status, ArincStatusCode::NotAccepted);
    assert_eq!(description, "invalid file name");
    Ok(())
}

#[tokio::test]
async fn rrq_for_device_lui_is_accepted() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let (status, _) = read_lui(&harness, &RecordKind::Lui.file_name(PART_NUMBER)).await?;
    assert_eq!(status, ArincStatusCode::Accepted);
    Ok(())
}

#[tokio::test]
async fn rrq_for_unknown_suffix_is_not_supported() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let (status, description) = read_lui(&harness, &format!("{PART_NUMBER}.BIN")).await?;
    assert_eq!(status, ArincStatusCode::NotSupported);
    assert_eq!(description, "unsupported file type");
    Ok(())
}

#[tokio::test]
async fn netascii_request_is_refused() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let mut loader = harness.loader().await?;
    loader
        .send_request(Packet::Rrq {
            filename: RecordKind::Lui.file_name(PART_NUMBER),
            mode: "netascii".to_string(),
        })
        .await?;
    assert!(matches!(loader.recv().await?, Packet::Error { code: 4, .. }));
    Ok(())
}

/// WRQ of the load request, download of the listed part number, and the
/// status reports around it.
#[tokio::test]
async fn lur_upload_fetches_listed_load() -> TestResult {
    let image = b"load image bytes".to_vec();
    let mut harness =
        Harness::start(HashMap::from([(LOAD_PART_NUMBER.to_string(), image.clone())])).await?;
    let mut loader = harness.loader().await?;

    loader
        .send_request(wrq(&RecordKind::Lur.file_name(PART_NUMBER)))
        .await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 0 });
    loader.send_session(&data_packet(1, &sample_lur()?)).await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 1 });

    assert_eq!(harness.next_event().await?.kind, EventKind::LoadRequest);
    assert_eq!(harness.gse.next_request().await?, LOAD_PART_NUMBER);

    let complete = harness.next_event().await?;
    assert_eq!(complete.kind, EventKind::TransferComplete);
    let stored = harness.root_dir.join(LOAD_PART_NUMBER);
    assert_eq!(complete.image.as_deref(), Some(stored.as_path()));
    assert_eq!(std::fs::read(&stored)?, image);

    let mut statuses = Vec::new();
    for _ in 0..2 {
        let upload = harness.gse.next_upload().await?;
        assert_eq!(upload.filename, RecordKind::Lus.file_name(PART_NUMBER));
        statuses.push(parse_lus(&upload.data)?.status);
    }
    statuses.sort_by_key(|status| status.code());
    assert_eq!(
        statuses,
        vec![
            ArincStatusCode::InProgress,
            ArincStatusCode::CompletedWithoutError
        ]
    );
    Ok(())
}

#[tokio::test]
async fn failed_download_reports_timeout() -> TestResult {
    let mut harness = Harness::start(HashMap::new()).await?;
    let mut loader = harness.loader().await?;

    loader
        .send_request(wrq(&RecordKind::Lur.file_name(PART_NUMBER)))
        .await?;
    loader.recv().await?;
    loader.send_session(&data_packet(1, &sample_lur()?)).await?;
    loader.recv().await?;

    assert_eq!(harness.next_event().await?.kind, EventKind::LoadRequest);
    assert_eq!(harness.next_event().await?.kind, EventKind::CommTimeout);
    assert!(!harness.root_dir.join(LOAD_PART_NUMBER).exists());
    Ok(())
}

#[tokio::test]
async fn second_write_is_refused_while_one_is_active() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let mut first = harness.loader().await?;
    first
        .send_request(wrq(&RecordKind::Lur.file_name(PART_NUMBER)))
        .await?;
    assert_eq!(first.recv().await?, Packet::Ack { block: 0 });

    let mut second = harness.loader().await?;
    second
        .send_request(wrq(&RecordKind::Lur.file_name(PART_NUMBER)))
        .await?;
    match second.recv().await? {
        Packet::Error { message, .. } => assert_eq!(message, "write session already in progress"),
        other => return Err(format!("expected ERROR, got {other:?}").into()),
    }
    Ok(())
}

#[tokio::test]
async fn out_of_sequence_data_is_ignored_and_duplicates_reacked() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let mut loader = harness.loader().await?;
    loader
        .send_request(wrq(&RecordKind::Lur.file_name(PART_NUMBER)))
        .await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 0 });

    let full = [0u8; 512];
    loader.send_session(&data_packet(1, &full)).await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 1 });

    // Block 3 skips ahead: no ACK for it. The duplicate of block 1 is
    // acknowledged again.
    loader.send_session(&data_packet(3, &full)).await?;
    loader.send_session(&data_packet(1, &full)).await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 1 });

    loader.send_session(&data_packet(2, b"end")).await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 2 });
    Ok(())
}

#[tokio::test]
async fn data_on_well_known_port_is_dropped() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let loader = harness.loader().await?;
    loader
        .socket
        .send_to(&data_packet(1, b"stray"), harness.stack.local_addr())
        .await?;
    loader.socket.send_to(&[0x00], harness.stack.local_addr()).await?;

    let mut buf = [0u8; 16];
    let reply = tokio::time::timeout(
        Duration::from_millis(300),
        loader.socket.recv_from(&mut buf),
    )
    .await;
    assert!(reply.is_err(), "stray packets must not be answered");
    assert!(harness.stack.is_healthy());
    Ok(())
}

#[tokio::test]
async fn older_block_is_reacked() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let mut loader = harness.loader().await?;
    loader
        .send_request(wrq(&RecordKind::Lur.file_name(PART_NUMBER)))
        .await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 0 });

    let full = [0u8; 512];
    loader.send_session(&data_packet(1, &full)).await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 1 });
    loader.send_session(&data_packet(2, &full)).await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 2 });

    loader.send_session(&data_packet(1, &full)).await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 1 });

    loader.send_session(&data_packet(3, b"end")).await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 3 });
    Ok(())
}

#[tokio::test]
async fn oversized_upload_gets_disk_full_error() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let mut loader = harness.loader().await?;
    loader
        .send_request(wrq(&RecordKind::Lur.file_name(PART_NUMBER)))
        .await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 0 });

    let full = [0u8; 512];
    let fitting = (MAX_LUR_SIZE / full.len()) as u16;
    for block in 1..=fitting {
        loader.send_session(&data_packet(block, &full)).await?;
        assert_eq!(loader.recv().await?, Packet::Ack { block });
    }
    loader
        .send_session(&data_packet(fitting + 1, &full))
        .await?;
    match loader.recv().await? {
        Packet::Error { code, message } => {
            assert_eq!(code, 3);
            assert_eq!(message, "buffer full");
        }
        other => return Err(format!("expected ERROR, got {other:?}").into()),
    }

    // The aborted session releases the buffer as it exits.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut next = harness.loader().await?;
    next.send_request(wrq(&RecordKind::Lur.file_name(PART_NUMBER)))
        .await?;
    assert_eq!(next.recv().await?, Packet::Ack { block: 0 });
    Ok(())
}

/// An unacknowledged LUI block is sent exactly once more before the session
/// gives up.
#[tokio::test]
async fn unacknowledged_lui_is_retransmitted_once() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let mut loader = harness.loader().await?;
    loader
        .send_request(rrq(&RecordKind::Lui.file_name(PART_NUMBER)))
        .await?;

    let first = loader.recv().await?;
    assert!(matches!(first, Packet::Data { block: 1, .. }));
    assert_eq!(loader.recv().await?, first);

    let mut buf = [0u8; 600];
    let extra = tokio::time::timeout(
        Duration::from_millis(1500),
        loader.socket.recv_from(&mut buf),
    )
    .await;
    assert!(extra.is_err(), "session sent more than one retransmission");
    Ok(())
}

/// A DATA packet on an LUI session ends it with "invalid package" instead of
/// triggering a retransmission.
#[tokio::test]
async fn unexpected_opcode_aborts_lui_send() -> TestResult {
    let harness = Harness::start(HashMap::new()).await?;
    let mut loader = harness.loader().await?;
    loader
        .send_request(rrq(&RecordKind::Lui.file_name(PART_NUMBER)))
        .await?;
    assert!(matches!(loader.recv().await?, Packet::Data { block: 1, .. }));

    loader.send_session(&data_packet(1, b"wrong way")).await?;
    match loader.recv().await? {
        Packet::Error { code, message } => {
            assert_eq!(code, 4);
            assert_eq!(message, "invalid package");
        }
        other => return Err(format!("expected ERROR, got {other:?}").into()),
    }

    let mut buf = [0u8; 600];
    let extra = tokio::time::timeout(
        Duration::from_millis(1500),
        loader.socket.recv_from(&mut buf),
    )
    .await;
    assert!(extra.is_err(), "session kept sending after the abort");
    Ok(())
}

async fn upload_lur_bytes(harness: &Harness, lur: &[u8]) -> TestResult {
    let mut loader = harness.loader().await?;
    loader
        .send_request(wrq(&RecordKind::Lur.file_name(PART_NUMBER)))
        .await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 0 });
    loader.send_session(&data_packet(1, lur)).await?;
    assert_eq!(loader.recv().await?, Packet::Ack { block: 1 });
    Ok(())
}

#[tokio::test]
async fn empty_load_list_returns_to_waiting() -> TestResult {
    let mut harness = Harness::start(HashMap::new()).await?;
    let lur = LoadUploadRequest::new(Vec::new()).encode()?;
    upload_lur_bytes(&harness, &lur).await?;

    assert_eq!(harness.next_event().await?.kind, EventKind::LoadRequest);
    assert_eq!(harness.next_event().await?.kind, EventKind::CommTimeout);
    Ok(())
}

#[tokio::test]
async fn invalid_load_request_returns_to_waiting() -> TestResult {
    let mut harness = Harness::start(HashMap::new()).await?;
    upload_lur_bytes(&harness, b"\x00\x00\x01\x00garbage").await?;

    assert_eq!(harness.next_event().await?.kind, EventKind::LoadRequest);
    assert_eq!(harness.next_event().await?.kind, EventKind::CommTimeout);
    let upload = harness.gse.next_upload().await?;
    assert_eq!(
        parse_lus(&upload.data)?.status,
        ArincStatusCode::AbortedByTarget
    );
    Ok(())
}
