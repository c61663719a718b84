//! Link runtime: one writer task (the only thing that writes to the stream), one
//! reader task, and a supervisor that tears both down when either fails.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::demux::{Demultiplexer, InboundAction};
use crate::error::LinkError;
use crate::frame::{self, encode_frame, Frame, FrameEncodeError, MAX_FRAME_LEN};
use crate::scheduler::{OutboundItem, Scheduler};
use crate::transfer::{self, ChunkPick, TransferId};

/// What the link reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Text from the peer.
    Text(String),
    /// Our file went out completely.
    TransferSent {
        id: TransferId,
        name: String,
        size: u64,
    },
    /// Our file could not be read; the peer was told via `FileEnd`.
    TransferFailed {
        id: TransferId,
        name: String,
        reason: String,
    },
    FileIncoming {
        id: TransferId,
        name: String,
        size: u64,
    },
    FileReceived {
        id: TransferId,
        path: PathBuf,
        size: u64,
    },
    FileFailed {
        id: TransferId,
        name: String,
        reason: String,
    },
}

struct Shared {
    outbound: Mutex<Scheduler>,
    /// Signalled after every enqueue; a stored permit covers a writer not yet waiting.
    wake: Notify,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl Shared {
    fn outbound(&self) -> MutexGuard<'_, Scheduler> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the outbound state, then wake the writer.
    fn enqueue<T>(&self, f: impl FnOnce(&mut Scheduler) -> T) -> T {
        let out = {
            let mut guard = self.outbound();
            f(&mut *guard)
        };
        self.wake.notify_one();
        out
    }

    fn shut_down(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(());
        }
        self.wake.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Application-side handle. Cheap to clone.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<Shared>,
}

impl LinkHandle {
    /// Queue a text message. It goes out ahead of any pending file chunk.
    pub fn enqueue_text(&self, message: &str) -> Result<(), LinkError> {
        if self.shared.is_closed() {
            return Err(LinkError::ConnectionClosed);
        }
        if message.len() > MAX_FRAME_LEN as usize {
            return Err(FrameEncodeError::TooLarge(message.len()).into());
        }
        self.shared.enqueue(|s| s.enqueue_text(message));
        debug!(len = message.len(), "text queued");
        Ok(())
    }

    /// Admit a file for sending. Fails with `SourceNotFound` if it is not a readable file now.
    pub async fn admit_file(
        &self,
        path: impl AsRef<Path>,
        priority: i32,
    ) -> Result<TransferId, LinkError> {
        let path = path.as_ref();
        let source = transfer::inspect_source(path).await?;
        if self.shared.is_closed() {
            return Err(LinkError::ConnectionClosed);
        }
        let id = self.shared.enqueue(|s| {
            s.admit(path.to_path_buf(), source.name.clone(), source.size, priority)
        });
        info!(transfer_id = %id, name = %source.name, size = source.size, priority, "transfer admitted");
        Ok(id)
    }

    /// Stop both loops. Anything still queued is dropped.
    pub fn close(&self) {
        self.shared.shut_down();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// A running link.
pub struct Link {
    pub handle: LinkHandle,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    /// Resolves once both loops have stopped: `Ok` after a local `close()`,
    /// `ConnectionClosed` when the peer hung up, otherwise the fatal error.
    pub task: JoinHandle<Result<(), LinkError>>,
}

/// Start a link over an already-established duplex stream.
pub fn spawn_link<R, W>(reader: R, writer: W, config: LinkConfig) -> Result<Link, LinkError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    config.validate()?;
    let (shutdown, reader_shutdown) = broadcast::channel(1);
    let shared = Arc::new(Shared {
        outbound: Mutex::new(Scheduler::new(config.chunk)),
        wake: Notify::new(),
        closed: AtomicBool::new(false),
        shutdown,
    });
    let (events_tx, events) = mpsc::unbounded_channel();

    let writer_task = tokio::spawn(run_writer(writer, shared.clone(), events_tx.clone()));
    let inbound = Inbound {
        demux: Demultiplexer::new(),
        files: HashMap::new(),
        shared: shared.clone(),
        events: events_tx,
        download_dir: config.download_dir,
    };
    let supervisor = shared.clone();
    let task = tokio::spawn(async move {
        let read_result = inbound.run(reader, reader_shutdown).await;
        supervisor.shut_down();
        let write_result = match writer_task.await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "writer task ended abnormally");
                Ok(())
            }
        };
        let result = read_result.and(write_result);
        match &result {
            Ok(()) => info!("link closed"),
            Err(e) => info!(error = %e, "link ended"),
        }
        result
    });

    Ok(Link {
        handle: LinkHandle { shared },
        events,
        task,
    })
}

async fn run_writer<W>(
    mut writer: W,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin,
{
    // Source files, opened when a transfer gets its first chunk.
    let mut sources: HashMap<TransferId, File> = HashMap::new();
    let result = loop {
        if shared.is_closed() {
            break Ok(());
        }
        let next = shared.outbound().next_item();
        let Some(item) = next else {
            shared.wake.notified().await;
            continue;
        };

        let mut written_chunk = None;
        let bytes = match item {
            OutboundItem::Frame(frame) => match encode_frame(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(kind = ?frame.kind, error = %e, "frame dropped");
                    continue;
                }
            },
            OutboundItem::Retransmit(bytes) => {
                debug!(len = bytes.len(), "retransmitting last frame");
                bytes
            }
            OutboundItem::Chunk(pick) => match read_chunk(&mut sources, &pick).await {
                Ok(data) => {
                    let frame = Frame::file_chunk(pick.id, pick.span.sequence, &data);
                    let bytes = match encode_frame(&frame) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            fail_transfer(&shared, &events, &mut sources, pick.id, e.to_string());
                            continue;
                        }
                    };
                    debug!(
                        transfer_id = %pick.id,
                        sequence = pick.span.sequence,
                        len = pick.span.len,
                        "chunk"
                    );
                    written_chunk = Some(pick);
                    bytes
                }
                Err(e) => {
                    fail_transfer(&shared, &events, &mut sources, pick.id, e.to_string());
                    continue;
                }
            },
        };

        if let Err(e) = write_all_flush(&mut writer, &bytes).await {
            warn!(error = %e, "write failed");
            break Err(LinkError::Send(e));
        }

        let done = {
            let mut out = shared.outbound();
            let done = written_chunk.as_ref().and_then(|pick| out.chunk_written(pick));
            out.record_sent(bytes);
            done
        };
        if let Some(done) = done {
            sources.remove(&done.id);
            info!(transfer_id = %done.id, name = %done.name, size = done.total_size, "transfer sent");
            let _ = events.send(LinkEvent::TransferSent {
                id: done.id,
                name: done.name,
                size: done.total_size,
            });
        }
    };
    let _ = writer.shutdown().await;
    shared.shut_down();
    result
}

async fn write_all_flush<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_chunk(
    sources: &mut HashMap<TransferId, File>,
    pick: &ChunkPick,
) -> std::io::Result<Vec<u8>> {
    let file = match sources.entry(pick.id) {
        Entry::Occupied(e) => e.into_mut(),
        Entry::Vacant(e) => {
            debug!(transfer_id = %pick.id, path = %pick.path.display(), "opening source");
            e.insert(File::open(&pick.path).await?)
        }
    };
    file.seek(SeekFrom::Start(pick.span.offset)).await?;
    let mut buf = vec![0u8; pick.span.len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

fn fail_transfer(
    shared: &Shared,
    events: &mpsc::UnboundedSender<LinkEvent>,
    sources: &mut HashMap<TransferId, File>,
    id: TransferId,
    reason: String,
) {
    sources.remove(&id);
    let failed = shared.outbound().abort_transfer(id);
    if let Some(failed) = failed {
        warn!(transfer_id = %id, name = %failed.name, %reason, "transfer failed");
        let _ = events.send(LinkEvent::TransferFailed {
            id,
            name: failed.name,
            reason,
        });
    }
}

struct IncomingFile {
    file: File,
    path: PathBuf,
}

/// Reader side: owns the demultiplexer and the destination files.
struct Inbound {
    demux: Demultiplexer,
    files: HashMap<TransferId, IncomingFile>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<LinkEvent>,
    download_dir: PathBuf,
}

impl Inbound {
    async fn run<R>(mut self, reader: R, shutdown: broadcast::Receiver<()>) -> Result<(), LinkError>
    where
        R: AsyncRead + Unpin,
    {
        if let Err(e) = tokio::fs::create_dir_all(&self.download_dir).await {
            warn!(dir = %self.download_dir.display(), error = %e, "cannot create download dir");
        }
        let result = self.read_loop(reader, shutdown).await;
        // Incomplete destinations are not the sender's files.
        let open: Vec<TransferId> = self.files.keys().copied().collect();
        for id in open {
            self.discard(id).await;
        }
        info!(
            integrity_failures = self.demux.integrity_failures(),
            abandoned = self.demux.open_transfers(),
            "reader stopped"
        );
        result
    }

    async fn read_loop<R>(
        &mut self,
        mut reader: R,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), LinkError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                frame = frame::read_frame(&mut reader) => frame?,
            };
            let Some(frame) = frame else {
                info!("peer closed the connection");
                return Err(LinkError::ConnectionClosed);
            };
            debug!(kind = ?frame.kind, len = frame.payload.len(), "frame received");
            for action in self.demux.on_frame(frame) {
                self.apply(action).await;
            }
        }
    }

    async fn apply(&mut self, action: InboundAction) {
        match action {
            InboundAction::DeliverText(text) => {
                let _ = self.events.send(LinkEvent::Text(text));
            }
            InboundAction::RequestResend => self.shared.enqueue(Scheduler::request_resend),
            InboundAction::Retransmit => {
                if !self.shared.enqueue(Scheduler::retransmit_last) {
                    warn!("peer asked for a resend before anything was sent");
                }
            }
            InboundAction::CreateFile { id, name, size } => {
                let local = local_name(id, &name);
                match create_unique(&self.download_dir, &local).await {
                    Ok((file, path)) => {
                        debug!(transfer_id = %id, path = %path.display(), "destination created");
                        self.files.insert(id, IncomingFile { file, path });
                        let _ = self.events.send(LinkEvent::FileIncoming { id, name, size });
                    }
                    Err(e) => {
                        let path = self.download_dir.join(local);
                        self.write_failed(id, path, e).await
                    }
                }
            }
            InboundAction::AppendChunk { id, data } => {
                let Some(incoming) = self.files.get_mut(&id) else {
                    return;
                };
                if let Err(e) = incoming.file.write_all(&data).await {
                    let path = incoming.path.clone();
                    self.write_failed(id, path, e).await;
                }
            }
            InboundAction::FinishFile { id, name, size } => {
                let Some(mut incoming) = self.files.remove(&id) else {
                    return;
                };
                match incoming.file.flush().await {
                    Ok(()) => {
                        let _ = self.events.send(LinkEvent::FileReceived {
                            id,
                            path: incoming.path,
                            size,
                        });
                    }
                    Err(source) => {
                        let err = LinkError::DestinationWrite {
                            path: incoming.path,
                            source,
                        };
                        warn!(transfer_id = %id, error = %err, "file failed");
                        let _ = self.events.send(LinkEvent::FileFailed {
                            id,
                            name,
                            reason: err.to_string(),
                        });
                    }
                }
            }
            InboundAction::AbortFile { id, name, reason } => {
                self.discard(id).await;
                let _ = self.events.send(LinkEvent::FileFailed {
                    id,
                    name,
                    reason: reason.to_string(),
                });
            }
        }
    }

    async fn write_failed(&mut self, id: TransferId, path: PathBuf, source: std::io::Error) {
        let abort = self.demux.on_write_failed(id, &source);
        let err = LinkError::DestinationWrite { path, source };
        warn!(transfer_id = %id, error = %err, "destination write failed");
        if let Some(InboundAction::AbortFile { id, name, .. }) = abort {
            self.discard(id).await;
            let _ = self.events.send(LinkEvent::FileFailed {
                id,
                name,
                reason: err.to_string(),
            });
        }
    }

    async fn discard(&mut self, id: TransferId) {
        if let Some(incoming) = self.files.remove(&id) {
            drop(incoming.file);
            let _ = tokio::fs::remove_file(&incoming.path).await;
        }
    }
}

/// Tries before giving up on finding a free destination name.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Create a destination no other file occupies. Existing files are never truncated;
/// a taken name gets a numbered variant, `x (1).bin`, `x (2).bin`, ...
async fn create_unique(dir: &Path, name: &Path) -> std::io::Result<(File, PathBuf)> {
    for n in 0..MAX_NAME_ATTEMPTS {
        let path = if n == 0 {
            dir.join(name)
        } else {
            dir.join(numbered(name, n))
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", name.display(), dir.display()),
    ))
}

fn numbered(name: &Path, n: u32) -> PathBuf {
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.extension() {
        Some(ext) => PathBuf::from(format!("{stem} ({n}).{}", ext.to_string_lossy())),
        None => PathBuf::from(format!("{stem} ({n})")),
    }
}

/// Keep only the final path component of a peer-supplied name.
fn local_name(id: TransferId, name: &str) -> PathBuf {
    Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("transfer-{}", id.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPolicy;
    use crate::frame::{FrameKind, FramingError, Payload};
    use rand::RngCore;
    use std::time::Duration;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("tandem_test")
            .join("link")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config(download_dir: PathBuf, threshold: u64, block_size: u64) -> LinkConfig {
        LinkConfig {
            chunk: ChunkPolicy {
                threshold,
                block_size,
            },
            download_dir,
        }
    }

    fn write_random(path: &Path, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        std::fs::write(path, &data).unwrap();
        data
    }

    /// Two links joined by an in-memory duplex stream.
    fn pair(capacity: usize, a: LinkConfig, b: LinkConfig) -> (Link, Link) {
        let (a_io, b_io) = tokio::io::duplex(capacity);
        let (ar, aw) = tokio::io::split(a_io);
        let (br, bw) = tokio::io::split(b_io);
        (
            spawn_link(ar, aw, a).unwrap(),
            spawn_link(br, bw, b).unwrap(),
        )
    }

    /// A link and the raw other end of its stream.
    fn with_raw_peer(capacity: usize, config: LinkConfig) -> (Link, tokio::io::DuplexStream) {
        let (link_io, peer) = tokio::io::duplex(capacity);
        let (r, w) = tokio::io::split(link_io);
        (spawn_link(r, w, config).unwrap(), peer)
    }

    async fn next_event(link: &mut Link) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(20), link.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn read_payload(peer: &mut tokio::io::DuplexStream) -> Payload {
        let raw = frame::read_frame(peer).await.unwrap().unwrap();
        Demultiplexer::accept(raw).unwrap()
    }

    #[tokio::test]
    async fn text_both_directions() {
        let dir = test_dir("text");
        let (mut a, mut b) = pair(
            1024,
            config(dir.clone(), 10, 4),
            config(dir.clone(), 10, 4),
        );
        a.handle.enqueue_text("ping").unwrap();
        assert_eq!(next_event(&mut b).await, LinkEvent::Text("ping".into()));
        b.handle.enqueue_text("pong").unwrap();
        assert_eq!(next_event(&mut a).await, LinkEvent::Text("pong".into()));
    }

    #[tokio::test]
    async fn file_transfer_end_to_end() {
        let src_dir = test_dir("e2e_src");
        let dst_dir = test_dir("e2e_dst");
        let source = src_dir.join("payload.bin");
        let data = write_random(&source, 5_000);
        let (mut a, mut b) = pair(
            4096,
            config(src_dir.clone(), 1_000, 256),
            config(dst_dir.clone(), 1_000, 256),
        );

        let id = a.handle.admit_file(&source, 0).await.unwrap();
        assert_eq!(
            next_event(&mut b).await,
            LinkEvent::FileIncoming {
                id,
                name: "payload.bin".into(),
                size: 5_000
            }
        );
        match next_event(&mut b).await {
            LinkEvent::FileReceived { id: got, path, size } => {
                assert_eq!(got, id);
                assert_eq!(size, 5_000);
                assert_eq!(path, dst_dir.join("payload.bin"));
                assert_eq!(std::fs::read(path).unwrap(), data);
            }
            other => panic!("expected FileReceived, got {other:?}"),
        }
        assert!(matches!(
            next_event(&mut a).await,
            LinkEvent::TransferSent { size: 5_000, .. }
        ));
    }

    #[tokio::test]
    async fn text_overtakes_large_transfer() {
        let src_dir = test_dir("overtake_src");
        let dst_dir = test_dir("overtake_dst");
        let source = src_dir.join("big.bin");
        write_random(&source, 3_500_000);
        let (a, mut b) = pair(
            64 * 1024,
            config(src_dir.clone(), 2_000_000, 200_000),
            config(dst_dir.clone(), 2_000_000, 200_000),
        );

        a.handle.admit_file(&source, 5).await.unwrap();
        a.handle.enqueue_text("hello").unwrap();

        let mut seen = Vec::new();
        loop {
            let event = next_event(&mut b).await;
            let done = matches!(event, LinkEvent::FileReceived { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        let hello = seen
            .iter()
            .position(|e| *e == LinkEvent::Text("hello".into()))
            .expect("hello delivered");
        assert!(hello < seen.len() - 1);
    }

    #[tokio::test]
    async fn equal_priority_chunks_interleave_on_the_wire() {
        let dir = test_dir("interleave");
        let file_a = dir.join("a.bin");
        let file_b = dir.join("b.bin");
        write_random(&file_a, 20);
        write_random(&file_b, 20);
        // Too small to hold a whole frame: the writer stalls on the first FileStart
        // until both transfers are admitted.
        let (link, mut peer) = with_raw_peer(16, config(dir.clone(), 10, 4));
        let a = link.handle.admit_file(&file_a, 1).await.unwrap();
        let b = link.handle.admit_file(&file_b, 1).await.unwrap();

        let mut chunks = Vec::new();
        let mut ends = 0;
        while ends < 2 {
            match read_payload(&mut peer).await {
                Payload::FileChunk { id, sequence, .. } => chunks.push((id, sequence)),
                Payload::FileEnd { .. } => ends += 1,
                _ => {}
            }
        }
        let expected: Vec<(TransferId, u32)> =
            (0..5).flat_map(|seq| [(a, seq), (b, seq)]).collect();
        assert_eq!(chunks, expected);
    }

    #[tokio::test]
    async fn missing_source_is_rejected() {
        let dir = test_dir("missing");
        let (link, _peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));
        let err = link
            .handle
            .admit_file(dir.join("does-not-exist.bin"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn corrupt_frame_gets_resend_request() {
        let dir = test_dir("corrupt");
        let (mut link, mut peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));

        let mut bytes = encode_frame(&Frame::text("garbled")).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x20;
        peer.write_all(&bytes).await.unwrap();

        let mut reply = [0u8; 3];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [b'T', b'D', FrameKind::ResendRequest as u8]);

        peer.write_all(&encode_frame(&Frame::text("clean")).unwrap())
            .await
            .unwrap();
        // The corrupted copy was never delivered.
        assert_eq!(next_event(&mut link).await, LinkEvent::Text("clean".into()));
    }

    #[tokio::test]
    async fn resend_is_byte_exact() {
        let dir = test_dir("resend");
        let (link, mut peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));
        link.handle.enqueue_text("only once").unwrap();

        let expected = encode_frame(&Frame::text("only once")).unwrap();
        let mut first = vec![0u8; expected.len()];
        peer.read_exact(&mut first).await.unwrap();
        assert_eq!(first, expected);

        peer.write_all(&encode_frame(&Frame::resend_request()).unwrap())
            .await
            .unwrap();
        let mut again = vec![0u8; expected.len()];
        peer.read_exact(&mut again).await.unwrap();
        assert_eq!(again, expected);
    }

    #[tokio::test]
    async fn peer_hangup_ends_link() {
        let dir = test_dir("hangup");
        let (link, peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));
        drop(peer);
        let result = link.task.await.unwrap();
        assert!(matches!(result, Err(LinkError::ConnectionClosed)));
        assert!(link.handle.is_closed());
        assert!(matches!(
            link.handle.enqueue_text("too late"),
            Err(LinkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_fatal() {
        let dir = test_dir("truncated");
        let (link, mut peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));
        let bytes = encode_frame(&Frame::text("cut off here")).unwrap();
        peer.write_all(&bytes[..bytes.len() - 4]).await.unwrap();
        drop(peer);
        let result = link.task.await.unwrap();
        assert!(matches!(
            result,
            Err(LinkError::Framing(FramingError::Truncated))
        ));
    }

    #[tokio::test]
    async fn local_close_shuts_stream() {
        let dir = test_dir("close");
        let (link, mut peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));
        link.handle.close();
        assert!(link.task.await.unwrap().is_ok());
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn truncated_transfer_discards_partial_file() {
        let dir = test_dir("partial");
        let (mut link, mut peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));
        let id = TransferId(1);
        for frame in [
            Frame::file_start(id, "half.bin", 8),
            Frame::file_chunk(id, 0, b"abcd"),
            Frame::file_end(id),
        ] {
            peer.write_all(&encode_frame(&frame).unwrap()).await.unwrap();
        }
        assert!(matches!(
            next_event(&mut link).await,
            LinkEvent::FileIncoming { .. }
        ));
        match next_event(&mut link).await {
            LinkEvent::FileFailed { id: got, reason, .. } => {
                assert_eq!(got, id);
                assert!(reason.contains("4 of 8"), "{reason}");
            }
            other => panic!("expected FileFailed, got {other:?}"),
        }
        assert!(!dir.join("half.bin").exists());
    }

    #[tokio::test]
    async fn peer_path_components_are_stripped() {
        let dir = test_dir("strip");
        let (mut link, mut peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));
        let id = TransferId(7);
        for frame in [
            Frame::file_start(id, "../../escape.txt", 2),
            Frame::file_chunk(id, 0, b"ok"),
            Frame::file_end(id),
        ] {
            peer.write_all(&encode_frame(&frame).unwrap()).await.unwrap();
        }
        next_event(&mut link).await;
        match next_event(&mut link).await {
            LinkEvent::FileReceived { path, .. } => assert_eq!(path, dir.join("escape.txt")),
            other => panic!("expected FileReceived, got {other:?}"),
        }
    }

    async fn collect_received(link: &mut Link, count: usize) -> HashMap<TransferId, PathBuf> {
        let mut received = HashMap::new();
        while received.len() < count {
            match next_event(link).await {
                LinkEvent::FileReceived { id, path, .. } => {
                    received.insert(id, path);
                }
                LinkEvent::FileFailed { reason, .. } => panic!("transfer failed: {reason}"),
                _ => {}
            }
        }
        received
    }

    #[tokio::test]
    async fn same_name_transfers_get_separate_files() {
        let src_a = test_dir("same_name_src_a");
        let src_b = test_dir("same_name_src_b");
        let dst = test_dir("same_name_dst");
        let data_a = write_random(&src_a.join("x.bin"), 40);
        let data_b = write_random(&src_b.join("x.bin"), 40);
        let (a, mut b) = pair(
            4096,
            config(src_a.clone(), 10, 4),
            config(dst.clone(), 10, 4),
        );

        let id_a = a.handle.admit_file(src_a.join("x.bin"), 0).await.unwrap();
        let id_b = a.handle.admit_file(src_b.join("x.bin"), 0).await.unwrap();
        let received = collect_received(&mut b, 2).await;

        assert_ne!(received[&id_a], received[&id_b]);
        assert_eq!(std::fs::read(&received[&id_a]).unwrap(), data_a);
        assert_eq!(std::fs::read(&received[&id_b]).unwrap(), data_b);
        let mut names: Vec<PathBuf> = received.values().cloned().collect();
        names.sort();
        assert_eq!(names, vec![dst.join("x (1).bin"), dst.join("x.bin")]);
    }

    #[tokio::test]
    async fn existing_file_is_not_overwritten() {
        let dir = test_dir("no_clobber");
        std::fs::write(dir.join("notes.txt"), b"keep").unwrap();
        let (mut link, mut peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));
        let id = TransferId(1);
        for frame in [
            Frame::file_start(id, "notes.txt", 3),
            Frame::file_chunk(id, 0, b"new"),
            Frame::file_end(id),
        ] {
            peer.write_all(&encode_frame(&frame).unwrap()).await.unwrap();
        }
        let received = collect_received(&mut link, 1).await;
        assert_eq!(received[&id], dir.join("notes (1).txt"));
        assert_eq!(std::fs::read(dir.join("notes.txt")).unwrap(), b"keep");
        assert_eq!(std::fs::read(&received[&id]).unwrap(), b"new");
    }

    #[test]
    fn numbered_names_keep_extension() {
        assert_eq!(numbered(Path::new("x.bin"), 1), PathBuf::from("x (1).bin"));
        assert_eq!(
            numbered(Path::new("archive.tar.gz"), 2),
            PathBuf::from("archive.tar (2).gz")
        );
        assert_eq!(numbered(Path::new("README"), 3), PathBuf::from("README (3)"));
    }

    #[tokio::test]
    async fn resend_request_answers_with_last_data_frame() {
        let dir = test_dir("resend_after_request");
        let (link, mut peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));
        link.handle.enqueue_text("before").unwrap();
        let expected = encode_frame(&Frame::text("before")).unwrap();
        let mut first = vec![0u8; expected.len()];
        peer.read_exact(&mut first).await.unwrap();

        // Our corrupted frame makes the link send its own ResendRequest.
        let mut bad = encode_frame(&Frame::text("garbled")).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        peer.write_all(&bad).await.unwrap();
        let mut request = [0u8; 3];
        peer.read_exact(&mut request).await.unwrap();
        assert_eq!(request, [b'T', b'D', FrameKind::ResendRequest as u8]);

        // Asking for a resend now must repeat the text, not the request.
        peer.write_all(&encode_frame(&Frame::resend_request()).unwrap())
            .await
            .unwrap();
        let mut again = vec![0u8; expected.len()];
        peer.read_exact(&mut again).await.unwrap();
        assert_ne!(again[..3], [b'T', b'D', FrameKind::ResendRequest as u8]);
        assert_eq!(again, expected);
    }

    #[tokio::test]
    async fn resend_request_alone_is_never_echoed() {
        let dir = test_dir("resend_no_echo");
        let (_link, mut peer) = with_raw_peer(1024, config(dir.clone(), 10, 4));
        let mut bad = encode_frame(&Frame::text("garbled")).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        peer.write_all(&bad).await.unwrap();
        let mut request = [0u8; 3];
        peer.read_exact(&mut request).await.unwrap();

        for _ in 0..3 {
            peer.write_all(&encode_frame(&Frame::resend_request()).unwrap())
                .await
                .unwrap();
        }
        let mut buf = [0u8; 1];
        let reply = tokio::time::timeout(Duration::from_millis(200), peer.read(&mut buf)).await;
        assert!(reply.is_err(), "link answered a resend request with {buf:?}");
    }

    #[tokio::test]
    async fn destination_failure_keeps_link_alive() {
        let dir = test_dir("dest_fail");
        // A regular file where the download directory should be.
        let blocker = dir.join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let (mut link, mut peer) = with_raw_peer(1024, config(blocker.clone(), 10, 4));
        let id = TransferId(1);
        for frame in [
            Frame::file_start(id, "doc.txt", 4),
            Frame::file_chunk(id, 0, b"data"),
            Frame::file_end(id),
            Frame::text("still here"),
        ] {
            peer.write_all(&encode_frame(&frame).unwrap()).await.unwrap();
        }

        match next_event(&mut link).await {
            LinkEvent::FileFailed { id: got, name, reason } => {
                assert_eq!(got, id);
                assert_eq!(name, "doc.txt");
                assert!(reason.contains("failed to write"), "{reason}");
            }
            other => panic!("expected FileFailed, got {other:?}"),
        }
        assert_eq!(next_event(&mut link).await, LinkEvent::Text("still here".into()));
        assert!(!link.handle.is_closed());
        assert!(blocker.is_file());
    }

    #[tokio::test]
    async fn invalid_policy_is_rejected() {
        let (io, _peer) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(io);
        let bad = config(std::env::temp_dir(), 10, 0);
        assert!(matches!(spawn_link(r, w, bad), Err(LinkError::Policy(_))));
    }
}
