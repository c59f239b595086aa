use peerdrop_common::{
    ChannelEvent, Chunk, Connection, FileDescriptor, Info, MAX_CHUNK_SIZE,
    Message, PeerMetadata, TransferError, memory, send_message,
};
use tokio::sync::oneshot;
use peerdrop_receiver::{
    DownloadOutput, IncomingFile, ReceiveFilesBubble,
    ReceiveFilesFinishedEvent, ReceiveFilesListingEvent,
    ReceiveFilesReceivingEvent, ReceiveFilesRequest, ReceiveFilesSubscriber,
    ReceiverConfig, ReceiverStatus, package, receive_files,
};
use peerdrop_sender::{
    File, MemoryData, SendFilesBubble, SendFilesRequest, SenderConfig,
    SenderConnectionStatus, send_files,
};
use std::{
    collections::HashMap,
    io::Read,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(30);

fn create_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i.wrapping_mul(31) % 253) as u8).collect()
}

fn publish(files: &[(&str, Vec<u8>)], chunk_size: u64) -> SendFilesBubble {
    let files = files
        .iter()
        .map(|(path, bytes)| {
            File::new(
                *path,
                "application/octet-stream",
                Arc::new(MemoryData::new(bytes.clone())),
            )
        })
        .collect();
    send_files(SendFilesRequest {
        files,
        password: "secret".into(),
        config: SenderConfig {
            chunk_size,
            ..SenderConfig::default()
        },
    })
    .unwrap()
}

fn request(connection: Connection, password: &str) -> ReceiveFilesRequest {
    ReceiveFilesRequest {
        connection,
        password: password.into(),
        metadata: PeerMetadata {
            os_name: Some("Linux".into()),
            ..Default::default()
        },
        config: ReceiverConfig::default(),
    }
}

/// Connects a receiver to a real sender session.
fn connect(sender: &SendFilesBubble, password: &str) -> (ReceiveFilesBubble, String) {
    let (sender_end, receiver_end) = memory::pair();
    let id = sender_end.id().to_string();
    sender.accept(sender_end);
    (receive_files(request(receiver_end, password)), id)
}

async fn read_all(file: IncomingFile) -> Result<Vec<u8>, TransferError> {
    let mut sink = Vec::new();
    timeout(WAIT, file.write_to(&mut sink))
        .await
        .expect("timed out reading stream")?;
    Ok(sink)
}

async fn finished(bubble: &ReceiveFilesBubble) -> peerdrop_receiver::ReceiverTransferState {
    timeout(WAIT, bubble.wait_until_finished())
        .await
        .expect("session never finished")
}

async fn wait_for_sender_status(
    sender: &SendFilesBubble,
    id: &str,
    status: SenderConnectionStatus,
) {
    timeout(WAIT, async {
        while sender.connection(id).map(|s| s.status) != Some(status) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sender connection never reached the expected status");
}

#[tokio::test]
async fn round_trips_boundary_sizes() {
    let max = MAX_CHUNK_SIZE as usize;
    for size in [0, 1, max, max + 1] {
        let data = create_test_data(size);
        let sender = publish(&[("/file.bin", data.clone())], MAX_CHUNK_SIZE);
        let (receiver, id) = connect(&sender, "secret");

        let listing = receiver.wait_for_listing().await.unwrap();
        assert_eq!(listing[0].size, size as u64);

        let mut streams = receiver.start().await.unwrap();
        assert_eq!(streams.len(), 1);
        let received = read_all(streams.remove(0)).await.unwrap();
        assert!(received == data, "size {size} did not round-trip");

        let state = finished(&receiver).await;
        assert_eq!(state.status, ReceiverStatus::Done);
        assert_eq!(state.bytes_received_total, size as u64);
        wait_for_sender_status(&sender, &id, SenderConnectionStatus::Done).await;
    }
}

#[tokio::test]
async fn wrong_password_fails_without_listing() {
    let sender = publish(&[("/a", vec![1, 2, 3])], 4);
    let (receiver, id) = connect(&sender, "guess");

    let err = receiver.wait_for_listing().await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid password");

    let state = finished(&receiver).await;
    assert_eq!(state.status, ReceiverStatus::Failed);
    assert_eq!(state.files_info, None);
    assert!(receiver.start().await.is_err());
    wait_for_sender_status(&sender, &id, SenderConnectionStatus::InvalidPassword)
        .await;
}

#[tokio::test]
async fn several_files_become_one_archive() {
    let files = [
        ("/docs/readme.md", create_test_data(1500)),
        ("/empty.txt", Vec::new()),
        ("/photos/cat.jpg", create_test_data(70_000)),
    ];
    let sender = publish(&files, 4096);
    let (receiver, _) = connect(&sender, "secret");

    receiver.wait_for_listing().await.unwrap();
    let output = package(receiver.start().await.unwrap()).unwrap();
    assert!(matches!(output, DownloadOutput::Archive(_)));
    assert!(output.name().starts_with("peerdrop-download-"));

    let mut archive = Vec::new();
    timeout(WAIT, output.write_to(&mut archive))
        .await
        .unwrap()
        .unwrap();

    let mut reader = tar::Archive::new(archive.as_slice());
    let mut entries = Vec::new();
    for entry in reader.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        entries.push((path, contents));
    }
    let expected: Vec<_> = files
        .iter()
        .map(|(path, bytes)| (path.trim_start_matches('/').to_string(), bytes.clone()))
        .collect();
    assert_eq!(entries, expected);
    assert_eq!(finished(&receiver).await.status, ReceiverStatus::Done);
}

#[tokio::test]
async fn resumes_from_offsets() {
    let data = create_test_data(100);
    let other = create_test_data(10);
    let sender = publish(&[("/a", data.clone()), ("/b", other.clone())], 16);
    let (receiver, _) = connect(&sender, "secret");

    receiver.wait_for_listing().await.unwrap();
    let offsets = HashMap::from([("/a".to_string(), 40), ("/b".to_string(), 10)]);
    let mut streams = receiver.start_from(offsets).await.unwrap();
    let second = streams.pop().unwrap();
    let first = streams.pop().unwrap();
    assert_eq!(first.expected_len(), 60);
    assert_eq!(second.expected_len(), 0);

    assert_eq!(read_all(first).await.unwrap(), data[40..].to_vec());
    assert_eq!(read_all(second).await.unwrap(), Vec::<u8>::new());
    let state = finished(&receiver).await;
    assert_eq!(state.status, ReceiverStatus::Done);
    assert_eq!(state.bytes_received_total, 60);
}

#[tokio::test]
async fn start_from_rejects_bad_offsets() {
    let sender = publish(&[("/a", create_test_data(5))], 16);
    let (receiver, _) = connect(&sender, "secret");
    receiver.wait_for_listing().await.unwrap();

    let err = receiver
        .start_from(HashMap::from([("/a".to_string(), 6)]))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TransferError>(),
        Some(TransferError::InvalidOffset { offset: 6, .. })
    ));
    // The session is still usable.
    let mut streams = receiver.start().await.unwrap();
    assert_eq!(read_all(streams.remove(0)).await.unwrap().len(), 5);
}

#[tokio::test]
async fn pause_and_resume_keep_the_bytes_intact() {
    let data = create_test_data(20_000);
    let sender = publish(&[("/slow.bin", data.clone())], 1);
    let (sender_end, receiver_end) = memory::pair();
    let id = sender_end.id().to_string();
    sender.accept(sender_end);
    // Room for every chunk, so the session never waits on this test to
    // read while a pause is pending.
    let receiver = receive_files(ReceiveFilesRequest {
        config: ReceiverConfig {
            stream_buffer: data.len(),
        },
        ..request(receiver_end, "secret")
    });

    receiver.wait_for_listing().await.unwrap();
    let mut stream = receiver.start().await.unwrap().remove(0);
    let mut received = Vec::new();
    while received.len() < 10 {
        received.extend(stream.next_chunk().await.unwrap().unwrap());
    }

    receiver.pause();
    wait_for_sender_status(&sender, &id, SenderConnectionStatus::Paused).await;
    assert_eq!(receiver.state().status, ReceiverStatus::Paused);

    receiver.resume();
    while let Some(bytes) = timeout(WAIT, stream.next_chunk()).await.unwrap().unwrap() {
        received.extend(bytes);
    }
    assert!(received == data, "paused download was corrupted");
    assert_eq!(finished(&receiver).await.status, ReceiverStatus::Done);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RelayPhase {
    /// Chunks of `/a` past the first are held back.
    HoldTail,
    /// The resume request is held until the receiver asks for `/b`.
    HoldResume,
    Forward,
}

/// Sits between a sender and a receiver and reorders traffic so that a
/// resume request for `/a@10` reaches the sender after the receiver has
/// already finished `/a` from the chunks that were in flight.
async fn reordering_relay(
    sender_side: Connection,
    receiver_side: Connection,
    tail_held: oneshot::Sender<()>,
) {
    let Connection {
        channel: to_sender,
        events: mut from_sender,
    } = sender_side;
    let Connection {
        channel: to_receiver,
        events: mut from_receiver,
    } = receiver_side;
    let mut tail_held = Some(tail_held);
    let mut phase = RelayPhase::HoldTail;
    let mut held_chunks = Vec::new();
    let mut held_requests = Vec::new();

    loop {
        tokio::select! {
            Some(event) = from_sender.recv() => match event {
                ChannelEvent::Data(payload) => {
                    let tail = match Message::decode(&payload) {
                        Ok(Message::Chunk(chunk)) => {
                            (chunk.full_path == "/a" && chunk.offset >= 10)
                                .then_some(chunk.is_final)
                        }
                        _ => None,
                    };
                    match tail {
                        Some(is_final) if phase == RelayPhase::HoldTail => {
                            held_chunks.push(payload);
                            if is_final {
                                if let Some(tx) = tail_held.take() {
                                    let _ = tx.send(());
                                }
                            }
                        }
                        _ => to_receiver.send(payload),
                    }
                }
                ChannelEvent::Close => {
                    to_receiver.close();
                    break;
                }
                _ => {}
            },
            Some(event) = from_receiver.recv() => match event {
                ChannelEvent::Data(payload) => {
                    let start = match Message::decode(&payload) {
                        Ok(Message::Start(start)) => Some(start),
                        _ => None,
                    };
                    match phase {
                        RelayPhase::HoldTail
                            if start
                                .as_ref()
                                .is_some_and(|s| s.full_path == "/a" && s.offset == 10) =>
                        {
                            held_requests.push(payload);
                            for chunk in held_chunks.drain(..) {
                                to_receiver.send(chunk);
                            }
                            phase = RelayPhase::HoldResume;
                        }
                        RelayPhase::HoldResume => {
                            held_requests.push(payload);
                            if start.is_some_and(|s| s.full_path == "/b") {
                                for request in held_requests.drain(..) {
                                    to_sender.send(request);
                                }
                                phase = RelayPhase::Forward;
                            }
                        }
                        _ => to_sender.send(payload),
                    }
                }
                ChannelEvent::Close => {
                    to_sender.close();
                    break;
                }
                _ => {}
            },
            else => break,
        }
    }
}

#[tokio::test]
async fn resume_racing_in_flight_chunks_still_finishes() {
    let a = create_test_data(40);
    let b = create_test_data(5);
    let sender = publish(&[("/a", a.clone()), ("/b", b.clone())], 10);

    let (sender_end, relay_sender_side) = memory::pair();
    let (relay_receiver_side, receiver_end) = memory::pair();
    let id = sender_end.id().to_string();
    sender.accept(sender_end);
    let (tail_tx, tail_rx) = oneshot::channel();
    tokio::spawn(reordering_relay(
        relay_sender_side,
        relay_receiver_side,
        tail_tx,
    ));

    let receiver = receive_files(ReceiveFilesRequest {
        config: ReceiverConfig { stream_buffer: 64 },
        ..request(receiver_end, "secret")
    });
    receiver.wait_for_listing().await.unwrap();
    let streams = receiver.start().await.unwrap();

    // The sender has sent all of /a; the receiver has only seen a@0.
    timeout(WAIT, tail_rx)
        .await
        .expect("sender never sent the tail of /a")
        .unwrap();
    wait_for_sender_status(&sender, &id, SenderConnectionStatus::Paused).await;
    timeout(WAIT, async {
        while receiver.state().bytes_received_total < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("receiver never saw a@0");
    receiver.pause();
    receiver.resume();

    let state = finished(&receiver).await;
    assert_eq!(state.status, ReceiverStatus::Done);
    assert_eq!(state.bytes_received_total, 45);
    wait_for_sender_status(&sender, &id, SenderConnectionStatus::Done).await;

    let mut received = Vec::new();
    for stream in streams {
        received.push(read_all(stream).await.unwrap());
    }
    assert_eq!(received, vec![a, b]);
}

#[tokio::test]
async fn cancel_interrupts_streams() {
    let sender = publish(&[("/big", create_test_data(50_000))], 8);
    let (receiver, id) = connect(&sender, "secret");

    receiver.wait_for_listing().await.unwrap();
    let mut stream = receiver.start().await.unwrap().remove(0);
    stream.next_chunk().await.unwrap();
    receiver.cancel();

    let err = loop {
        match timeout(WAIT, stream.next_chunk()).await.unwrap() {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("cancelled stream completed"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, TransferError::Interrupted(path) if path == "/big"));
    assert_eq!(finished(&receiver).await.status, ReceiverStatus::Interrupted);
    wait_for_sender_status(&sender, &id, SenderConnectionStatus::Closed).await;
}

#[derive(Default)]
struct RecordingSubscriber {
    listings: Mutex<Vec<usize>>,
    progress: Mutex<Vec<(String, u64)>>,
    finished: Mutex<Vec<ReceiverStatus>>,
}

impl ReceiveFilesSubscriber for RecordingSubscriber {
    fn get_id(&self) -> String {
        "recorder".into()
    }

    fn log(&self, _message: String) {}

    fn notify_listing(&self, event: ReceiveFilesListingEvent) {
        self.listings.lock().unwrap().push(event.files.len());
    }

    fn notify_receiving(&self, event: ReceiveFilesReceivingEvent) {
        self.progress
            .lock()
            .unwrap()
            .push((event.full_path, event.received));
    }

    fn notify_finished(&self, event: ReceiveFilesFinishedEvent) {
        self.finished.lock().unwrap().push(event.status);
    }
}

#[tokio::test]
async fn subscribers_observe_the_session() {
    let sender = publish(&[("/a", create_test_data(10)), ("/b", create_test_data(3))], 4);
    let (receiver, _) = connect(&sender, "secret");
    let recorder = Arc::new(RecordingSubscriber::default());
    receiver.subscribe(recorder.clone());

    receiver.wait_for_listing().await.unwrap();
    for stream in receiver.start().await.unwrap() {
        read_all(stream).await.unwrap();
    }
    finished(&receiver).await;

    assert_eq!(*recorder.listings.lock().unwrap(), vec![2]);
    assert_eq!(
        *recorder.progress.lock().unwrap(),
        vec![
            ("/a".to_string(), 4),
            ("/a".to_string(), 8),
            ("/a".to_string(), 10),
            ("/b".to_string(), 3),
        ]
    );
    assert_eq!(*recorder.finished.lock().unwrap(), vec![ReceiverStatus::Done]);
}

/// Next decoded message the receiver sent, or `None` once closed.
async fn next_message(conn: &mut Connection) -> Option<Message> {
    loop {
        let event = timeout(WAIT, conn.events.recv())
            .await
            .expect("timed out waiting for the receiver");
        match event? {
            ChannelEvent::Data(payload) => {
                return Some(Message::decode(&payload).unwrap());
            }
            ChannelEvent::Close => return None,
            _ => continue,
        }
    }
}

fn send(conn: &Connection, message: Message) {
    assert!(send_message(conn.channel.as_ref(), &message));
}

fn chunk(full_path: &str, offset: u64, bytes: &[u8], is_final: bool) -> Message {
    Message::Chunk(Chunk {
        full_path: full_path.into(),
        offset,
        bytes: bytes.to_vec(),
        is_final,
    })
}

fn descriptor(full_path: &str, size: u64) -> FileDescriptor {
    FileDescriptor {
        full_path: full_path.into(),
        size,
        mime_type: "text/plain".into(),
    }
}

/// A receiver session wired to a hand-driven sender end.
async fn scripted(files: Vec<FileDescriptor>) -> (ReceiveFilesBubble, Connection) {
    let (mut sender, receiver_end) = memory::pair();
    let receiver = receive_files(request(receiver_end, "pw"));

    match next_message(&mut sender).await {
        Some(Message::RequestInfo(request)) => {
            assert_eq!(request.password, "pw");
            assert_eq!(request.metadata.os_name.as_deref(), Some("Linux"));
        }
        other => panic!("expected RequestInfo, got {other:?}"),
    }
    send(&sender, Message::Info(Info { files }));
    receiver.wait_for_listing().await.unwrap();
    (receiver, sender)
}

fn expect_start(message: Option<Message>, full_path: &str, offset: u64) {
    match message {
        Some(Message::Start(start)) => {
            assert_eq!(start.full_path, full_path);
            assert_eq!(start.offset, offset);
        }
        other => panic!("expected Start for {full_path}, got {other:?}"),
    }
}

#[tokio::test]
async fn next_file_is_requested_only_after_final_chunk() {
    let (receiver, mut sender) =
        scripted(vec![descriptor("/a", 4), descriptor("/b", 2)]).await;
    let mut streams = receiver.start().await.unwrap();

    expect_start(next_message(&mut sender).await, "/a", 0);
    send(&sender, chunk("/a", 0, b"ab", false));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sender.events.try_recv().is_err(), "requested /b too early");

    send(&sender, chunk("/a", 2, b"cd", true));
    expect_start(next_message(&mut sender).await, "/b", 0);
    send(&sender, chunk("/b", 0, b"ef", true));
    assert_eq!(next_message(&mut sender).await, Some(Message::Done));
    sender.channel.close();

    let second = streams.pop().unwrap();
    let first = streams.pop().unwrap();
    assert_eq!(read_all(first).await.unwrap(), b"abcd");
    assert_eq!(read_all(second).await.unwrap(), b"ef");
    assert_eq!(finished(&receiver).await.status, ReceiverStatus::Done);
}

#[tokio::test]
async fn stray_chunks_are_dropped() {
    let (receiver, mut sender) = scripted(vec![descriptor("/a", 6)]).await;
    let mut streams = receiver.start().await.unwrap();
    expect_start(next_message(&mut sender).await, "/a", 0);

    send(&sender, chunk("/a", 0, b"ab", false));
    send(&sender, chunk("/a", 0, b"ab", false));
    send(&sender, chunk("/a", 4, b"ef", false));
    send(&sender, chunk("/other", 2, b"cd", false));
    sender.channel.send(b"{\"type\":\"Chunk\"}".to_vec());
    send(&sender, chunk("/a", 2, b"cdef", true));

    assert_eq!(next_message(&mut sender).await, Some(Message::Done));
    assert_eq!(read_all(streams.remove(0)).await.unwrap(), b"abcdef");
    assert_eq!(receiver.state().bytes_received_total, 6);
}

#[tokio::test]
async fn close_mid_file_interrupts_the_stream() {
    let (receiver, mut sender) = scripted(vec![descriptor("/a", 10)]).await;
    let mut stream = receiver.start().await.unwrap().remove(0);
    expect_start(next_message(&mut sender).await, "/a", 0);

    send(&sender, chunk("/a", 0, b"abcd", false));
    sender.channel.close();

    assert_eq!(stream.next_chunk().await.unwrap(), Some(b"abcd".to_vec()));
    assert!(matches!(
        stream.next_chunk().await,
        Err(TransferError::Interrupted(_))
    ));
    let state = finished(&receiver).await;
    assert_eq!(state.status, ReceiverStatus::Interrupted);
    assert_eq!(state.error, None);
}

#[tokio::test]
async fn short_final_chunk_is_a_protocol_violation() {
    let (receiver, mut sender) = scripted(vec![descriptor("/a", 10)]).await;
    let mut stream = receiver.start().await.unwrap().remove(0);
    expect_start(next_message(&mut sender).await, "/a", 0);

    send(&sender, chunk("/a", 0, b"abcd", true));

    assert_eq!(next_message(&mut sender).await, None);
    assert!(stream.next_chunk().await.is_err());
    let state = finished(&receiver).await;
    assert_eq!(state.status, ReceiverStatus::Failed);
    assert_eq!(
        state.error.as_deref(),
        Some("/a ended at 4 bytes, expected 10")
    );
}

#[tokio::test]
async fn remote_error_ends_the_session() {
    let (receiver, mut sender) = scripted(vec![descriptor("/a", 10)]).await;
    let mut stream = receiver.start().await.unwrap().remove(0);
    expect_start(next_message(&mut sender).await, "/a", 0);

    send(&sender, Message::error("Failed to read /a: disk on fire"));

    assert_eq!(next_message(&mut sender).await, None);
    assert!(stream.next_chunk().await.is_err());
    let state = finished(&receiver).await;
    assert_eq!(state.status, ReceiverStatus::Failed);
    assert_eq!(state.error.as_deref(), Some("Failed to read /a: disk on fire"));
}

#[tokio::test]
async fn empty_listing_cannot_start() {
    let (receiver, _sender) = scripted(Vec::new()).await;
    let err = receiver.start().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TransferError>(),
        Some(TransferError::NoFiles)
    ));
}

#[tokio::test]
async fn single_file_is_saved_to_disk() {
    let data = create_test_data(50_000);
    let sender = publish(&[("/notes/today.txt", data.clone())], 4096);
    let (receiver, _) = connect(&sender, "secret");
    receiver.wait_for_listing().await.unwrap();

    let output = package(receiver.start().await.unwrap()).unwrap();
    assert_eq!(output.name(), "notes/today.txt");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("today.txt");
    let mut file = tokio::fs::File::create(&path).await.unwrap();
    let written = timeout(WAIT, output.write_to(&mut file))
        .await
        .expect("timed out writing file")
        .unwrap();
    drop(file);

    assert_eq!(written, data.len() as u64);
    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert_eq!(finished(&receiver).await.status, ReceiverStatus::Done);
}
