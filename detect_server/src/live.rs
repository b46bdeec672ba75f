//! Live detection on a continuous frame source.
//!
//! The source is read on a blocking thread and handed to the detection task through a
//! single-slot channel. When the slot is still occupied, the newest frame is dropped, so the
//! latency stays bounded by one inference however slow the model is.
use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use bytes::Bytes;
use image::RgbImage;
use serde::Serialize;
use thingbuf::mpsc::{self, errors::TrySendError};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    as_jpeg_stream_item,
    draw::encode_jpeg,
    meter::METER,
    orchestrator::DetectionOrchestrator,
    session::SessionState,
    sources::{Capture, FrameSource},
};

const STREAM_JPEG_QUALITY: u8 = 85;

/// Raw RGB frame waiting in the handoff slot.
#[derive(Clone, Default)]
struct FrameSlot {
    index: u64,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LiveStats {
    pub captured: u64,
    pub dropped: u64,
    pub processed: u64,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> LiveStats {
        LiveStats {
            captured: self.captured.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
        }
    }
}

/// Running live stream of one session.
pub struct LiveStream {
    cancel: CancellationToken,
    producer: JoinHandle<()>,
    consumer: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl LiveStream {
    /// Start streaming `source` into `session`. Must be called inside a tokio runtime.
    ///
    /// Rendered frames are published as MJPEG parts on `rendered_tx` while it has subscribers.
    pub fn start(
        orchestrator: Arc<DetectionOrchestrator>,
        session: Arc<Mutex<SessionState>>,
        source: Box<dyn FrameSource>,
        confidence_threshold: f32,
        rendered_tx: broadcast::Sender<Bytes>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let (frame_tx, frame_rx) = mpsc::channel(1);

        let producer = {
            let cancel = cancel.clone();
            let counters = counters.clone();
            tokio::task::spawn_blocking(move || produce(source, frame_tx, cancel, counters))
        };

        let consumer = tokio::spawn(consume(
            Consumer {
                orchestrator,
                session,
                confidence_threshold,
                rendered_tx,
                cancel: cancel.clone(),
                counters: counters.clone(),
            },
            frame_rx,
        ));

        log::info!("Live stream started at threshold {confidence_threshold:.2}");

        Self {
            cancel,
            producer,
            consumer,
            counters,
        }
    }

    pub fn stats(&self) -> LiveStats {
        self.counters.snapshot()
    }

    /// Whether the stream ended on its own, e.g. because the source ran out.
    pub fn is_finished(&self) -> bool {
        self.producer.is_finished() && self.consumer.is_finished()
    }

    /// Cancel and wait until the source is released and the last frame is handled.
    ///
    /// No session update happens after this returns.
    pub async fn stop(self) -> LiveStats {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the stream to end without cancelling it.
    pub async fn join(self) -> LiveStats {
        if let Err(e) = self.producer.await {
            log::error!("Frame producer failed: {e}");
        }
        if let Err(e) = self.consumer.await {
            log::error!("Frame consumer failed: {e}");
        }

        let stats = self.counters.snapshot();
        log::info!(
            "Live stream ended: {} captured, {} dropped, {} processed",
            stats.captured,
            stats.dropped,
            stats.processed
        );
        stats
    }
}

fn produce(
    mut source: Box<dyn FrameSource>,
    frame_tx: mpsc::Sender<FrameSlot>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    let mut index = 0;

    while !cancel.is_cancelled() {
        let frame = match source.next_frame() {
            Ok(Capture::Frame(frame)) => frame,
            Ok(Capture::Idle) => continue,
            Ok(Capture::Exhausted) => {
                log::info!("Frame source exhausted");
                break;
            }
            Err(e) => {
                log::error!("Frame source failed: {e}");
                break;
            }
        };

        index += 1;
        counters.captured.fetch_add(1, Ordering::SeqCst);
        METER.tick_raw();

        match frame_tx.try_send_ref() {
            Ok(mut slot) => {
                slot.index = index;
                slot.width = frame.width();
                slot.height = frame.height();
                slot.pixels.clear();
                slot.pixels.extend_from_slice(frame.as_raw());
            }
            Err(TrySendError::Full(_)) => {
                log::trace!("Dropping frame {index}, previous frame still in flight");
                counters.dropped.fetch_add(1, Ordering::SeqCst);
                METER.tick_dropped();
            }
            Err(_) => break,
        }
    }

    source.release();
}

struct Consumer {
    orchestrator: Arc<DetectionOrchestrator>,
    session: Arc<Mutex<SessionState>>,
    confidence_threshold: f32,
    rendered_tx: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

async fn consume(ctx: Consumer, frame_rx: mpsc::Receiver<FrameSlot>) {
    loop {
        let (index, frame) = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            slot = frame_rx.recv_ref() => match slot {
                // Producer is gone and the slot is drained
                None => break,
                Some(mut slot) => {
                    let pixels = mem::take(&mut slot.pixels);
                    (slot.index, RgbImage::from_raw(slot.width, slot.height, pixels))
                }
            },
        };

        let Some(frame) = frame else {
            log::warn!("Frame {index} has an inconsistent size, skipping");
            continue;
        };

        let orchestrator = ctx.orchestrator.clone();
        let threshold = ctx.confidence_threshold;
        let pending = match tokio::task::spawn_blocking(move || {
            orchestrator.execute(Some(&frame), threshold)
        })
        .await
        {
            Ok(pending) => pending,
            Err(e) => {
                log::error!("Inference task for frame {index} failed: {e}");
                break;
            }
        };

        let report = {
            let mut session = ctx.session.lock().unwrap_or_else(PoisonError::into_inner);
            if ctx.cancel.is_cancelled() {
                log::debug!("Discarding frame {index}, stream was stopped");
                break;
            }
            pending.commit(&mut session)
        };

        ctx.counters.processed.fetch_add(1, Ordering::SeqCst);
        METER.tick_inferred();

        match report.outcome {
            Ok(summary) if ctx.rendered_tx.receiver_count() > 0 => {
                match encode_jpeg(&summary.rendered_image, STREAM_JPEG_QUALITY) {
                    Ok(jpeg) => {
                        ctx.rendered_tx.send(as_jpeg_stream_item(&jpeg)).ok();
                    }
                    Err(e) => log::warn!("Failed to encode frame {index}: {e}"),
                }
            }
            Ok(_) => {}
            Err(e) if !e.is_recoverable() => {
                log::error!("Ending live stream at frame {index}: {e}");
                break;
            }
            Err(e) => log::warn!("Frame {index} rejected: {e}"),
        }
    }
}
