//! Fan-out from one up-track to many down-tracks with a congestion
//! policy (§4.4).
//!
//! The bounded-channel/`try_send`/drop-on-full discipline is grounded
//! on `synctv-sfu::track::MediaTrack::start_reading`; this module
//! generalises it into a pool of cooperative writer tasks, each owning
//! a slice of the attached down-tracks, with per-writer video-frame
//! drop state instead of a single global drop flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One cached RTP packet handed from the up-track to the pool.
#[derive(Clone)]
pub struct PoolPacket {
    pub seqno: u16,
    pub payload: Arc<Vec<u8>>,
    pub delay: Duration,
    pub is_video: bool,
    pub marker: bool,
}

/// A subscriber's sink: receives packets and can be asked to request
/// a keyframe upstream when it falls behind. `DownTrack` implements
/// this.
pub trait PacketSink: Send + Sync + 'static {
    fn id(&self) -> &str;
    /// Takes `Arc<Self>` rather than `&self` because delivering a
    /// packet hands off to an async task (the peer connection write
    /// is async) that must outlive this call.
    fn write_rtp(self: Arc<Self>, packet: &PoolPacket);
    fn request_keyframe(&self);
}

const QUEUE_CAPACITY: usize = 256;
/// Maximum packets discarded after a full video queue before the
/// drop state clears regardless of marker bit (§4.4).
const MAX_VIDEO_DROP_RUN: u8 = 7;

/// Shared, lock-protected table of sinks a writer is responsible for;
/// membership changes (attach/detach/rebalance) mutate this in place
/// so the writer's running task always sees the current assignment.
type SinkTable = Arc<Mutex<HashMap<String, Arc<dyn PacketSink>>>>;

struct Writer {
    tx: mpsc::Sender<PoolPacket>,
    cancel: CancellationToken,
    dropping: Arc<AtomicBool>,
    drop_run: Arc<AtomicU8>,
    members: SinkTable,
}

/// Dynamically sized fan-out pool attached to one up-track.
pub struct WriterPool {
    writers: Mutex<Vec<Arc<Writer>>>,
    sinks: Mutex<HashMap<String, Arc<dyn PacketSink>>>,
}

impl WriterPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            writers: Mutex::new(Vec::new()),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of writer tasks for `n` attached down-tracks: `max(4, ceil(sqrt(n)))`.
    #[must_use]
    pub fn writer_count_for(n: usize) -> usize {
        let sqrt = (n as f64).sqrt().ceil() as usize;
        sqrt.max(4)
    }

    /// Attach a new subscriber, rebalancing writer count if needed.
    pub fn attach(&self, sink: Arc<dyn PacketSink>) {
        let id = sink.id().to_string();
        self.sinks.lock().insert(id.clone(), sink.clone());
        self.rebalance();
        let writers = self.writers.lock();
        if let Some(writer) = writers.iter().min_by_key(|w| w.members.lock().len()) {
            writer.members.lock().insert(id, sink);
        }
    }

    /// Detach a subscriber (§4.3 `delLocal`).
    pub fn detach(&self, id: &str) {
        self.sinks.lock().remove(id);
        for writer in self.writers.lock().iter() {
            writer.members.lock().remove(id);
        }
        self.rebalance();
    }

    fn rebalance(&self) {
        let target = Self::writer_count_for(self.sinks.lock().len());
        let mut writers = self.writers.lock();
        while writers.len() < target {
            writers.push(Self::spawn_writer());
        }
        while writers.len() > target {
            if let Some(w) = writers.pop() {
                // Hand its members back so a future rebalance can
                // redistribute them onto the surviving writers.
                w.cancel.cancel();
                let orphaned: Vec<_> = w.members.lock().drain().collect();
                if let Some(survivor) = writers.iter().min_by_key(|s| s.members.lock().len()) {
                    survivor.members.lock().extend(orphaned);
                }
            }
        }
    }

    fn spawn_writer() -> Arc<Writer> {
        let (tx, mut rx) = mpsc::channel::<PoolPacket>(QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let members: SinkTable = Arc::new(Mutex::new(HashMap::new()));
        let writer = Arc::new(Writer {
            tx,
            cancel: cancel.clone(),
            dropping: Arc::new(AtomicBool::new(false)),
            drop_run: Arc::new(AtomicU8::new(0)),
            members: members.clone(),
        });
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    packet = rx.recv() => {
                        let Some(packet) = packet else { break };
                        let sinks: Vec<_> = members.lock().values().cloned().collect();
                        for sink in sinks {
                            sink.write_rtp(&packet);
                        }
                    }
                }
            }
        });
        writer
    }

    /// Offer one packet to every writer (§4.4 write path).
    pub fn write(&self, seqno: u16, payload: Vec<u8>, delay: Duration, is_video: bool, marker: bool) {
        let packet = PoolPacket {
            seqno,
            payload: Arc::new(payload),
            delay,
            is_video,
            marker,
        };
        let writers: Vec<_> = self.writers.lock().clone();
        let writer_count = writers.len().max(1);
        for writer in &writers {
            if is_video && writer.dropping.load(Ordering::Relaxed) {
                // Clears on the next frame boundary: a marker bit, or
                // `MAX_VIDEO_DROP_RUN` discarded packets, whichever
                // comes first (§4.4), so a stuck writer that never
                // sees a marker doesn't starve its subscriber.
                let run = writer.drop_run.fetch_add(1, Ordering::Relaxed) + 1;
                if marker || run >= MAX_VIDEO_DROP_RUN {
                    writer.dropping.store(false, Ordering::Relaxed);
                    writer.drop_run.store(0, Ordering::Relaxed);
                }
                continue;
            }
            match writer.tx.try_send(packet.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(pkt)) => {
                    if is_video {
                        writer.dropping.store(true, Ordering::Relaxed);
                        writer.drop_run.store(0, Ordering::Relaxed);
                    } else {
                        Self::audio_retry(writer, pkt, delay, writer_count);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("writer channel closed, will be reaped on next rebalance");
                }
            }
        }
    }

    fn audio_retry(writer: &Arc<Writer>, packet: PoolPacket, delay: Duration, writer_count: usize) {
        let tx = writer.tx.clone();
        let wait = delay / (2 * writer_count as u32).max(1);
        tokio::spawn(async move {
            let _ = timeout(wait, tx.send(packet)).await;
        });
    }
}

impl Default for WriterPool {
    fn default() -> Self {
        Self::new()
    }
}
