//! Frame sources feeding live streams.
//!
//! A source is pulled from a blocking thread. `next_frame` may block for a while but should
//! return [`Capture::Idle`] regularly when nothing arrives, so the stream can notice a stop.
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::broadcast::error::RecvError,
    time::timeout,
};

use crate::{detector::SUPPORTED_FORMATS, pubsub::BytesReceiver};

/// How long a socket source waits for a frame before reporting [`Capture::Idle`].
const SOCKET_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("frame source I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Image(#[from] image::ImageError),

    #[error("camera error: {0}")]
    Device(String),

    #[error("no images found in {}", .0.display())]
    Empty(PathBuf),

    #[error("unknown frame source {0:?}, expected socket:<channel>, dir:<path> or camera:<device>")]
    UnknownSpec(String),
}

pub enum Capture {
    Frame(RgbImage),
    /// Nothing available right now, ask again.
    Idle,
    /// The source will never produce another frame.
    Exhausted,
}

pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Capture, SourceError>;

    /// Give the underlying device back. Called once when the stream ends.
    fn release(&mut self);
}

/// Parsed `--source` / `?source=` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// Frames pushed to the data socket under a channel name.
    Socket(String),
    /// Replay of the images in a directory.
    Directory(PathBuf),
    /// Local V4L2 device such as `/dev/video0`.
    Camera(String),
}

impl FromStr for SourceSpec {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("socket", name)) if !name.is_empty() => Ok(SourceSpec::Socket(name.to_owned())),
            Some(("dir", path)) if !path.is_empty() => Ok(SourceSpec::Directory(path.into())),
            Some(("camera", device)) if !device.is_empty() => {
                Ok(SourceSpec::Camera(device.to_owned()))
            }
            _ => Err(SourceError::UnknownSpec(s.to_owned())),
        }
    }
}

/// Fixed list of frames, optionally played in a loop.
pub struct ImageSequence {
    frames: Vec<RgbImage>,
    position: usize,
    looping: bool,
    interval: Option<Duration>,
    released: Arc<AtomicBool>,
}

impl ImageSequence {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        Self {
            frames,
            position: 0,
            looping: false,
            interval: None,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load all supported images in `dir`, sorted by file name.
    pub fn from_dir(dir: &Path) -> Result<Self, SourceError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                ImageFormat::from_path(path)
                    .map(|format| SUPPORTED_FORMATS.contains(&format))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(SourceError::Empty(dir.to_owned()));
        }
        log::info!("Replaying {} images from {}", paths.len(), dir.display());

        let frames = paths
            .iter()
            .map(|path| Ok(image::open(path)?.to_rgb8()))
            .collect::<Result<Vec<_>, SourceError>>()?;

        Ok(Self::new(frames))
    }

    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    /// Wait `interval` before handing out each frame, like a camera would.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Flag that flips once the sequence has been released.
    pub fn release_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Capture, SourceError> {
        if self.position >= self.frames.len() {
            if !self.looping || self.frames.is_empty() {
                return Ok(Capture::Exhausted);
            }
            self.position = 0;
        }

        if let Some(interval) = self.interval {
            std::thread::sleep(interval);
        }

        let frame = self.frames[self.position].clone();
        self.position += 1;

        Ok(Capture::Frame(frame))
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// JPEG frames published on a pub/sub channel by the data socket.
pub struct SocketSource {
    channel: String,
    rx: Option<BytesReceiver>,
    runtime: Handle,
}

impl SocketSource {
    /// Must be created inside the tokio runtime that drives the data socket.
    pub fn new(channel: &str, rx: BytesReceiver) -> Self {
        Self {
            channel: channel.to_owned(),
            rx: Some(rx),
            runtime: Handle::current(),
        }
    }
}

impl FrameSource for SocketSource {
    fn next_frame(&mut self) -> Result<Capture, SourceError> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(Capture::Exhausted);
        };

        let data = match self.runtime.block_on(timeout(SOCKET_POLL, rx.recv())) {
            Err(_elapsed) => return Ok(Capture::Idle),
            Ok(Err(RecvError::Lagged(skipped))) => {
                log::debug!("Channel {} skipped {} frames", self.channel, skipped);
                return Ok(Capture::Idle);
            }
            Ok(Err(RecvError::Closed)) => return Ok(Capture::Exhausted),
            Ok(Ok(data)) => data,
        };

        match image::load_from_memory_with_format(&data, ImageFormat::Jpeg) {
            Ok(frame) => Ok(Capture::Frame(frame.to_rgb8())),
            Err(e) => {
                log::warn!("Skipping undecodable frame on {}: {}", self.channel, e);
                Ok(Capture::Idle)
            }
        }
    }

    fn release(&mut self) {
        // Unsubscribing lets the pub/sub prune the channel
        self.rx = None;
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use tokio::sync::broadcast;

    use super::*;
    use crate::draw::encode_jpeg;

    #[test]
    fn test_parse_source_specs() -> Result<(), SourceError> {
        assert_eq!(
            "socket:line-1".parse::<SourceSpec>()?,
            SourceSpec::Socket("line-1".into())
        );
        assert_eq!(
            "dir:/tmp/frames".parse::<SourceSpec>()?,
            SourceSpec::Directory("/tmp/frames".into())
        );
        assert_eq!(
            "camera:/dev/video0".parse::<SourceSpec>()?,
            SourceSpec::Camera("/dev/video0".into())
        );
        assert!("socket:".parse::<SourceSpec>().is_err());
        assert!("webcam".parse::<SourceSpec>().is_err());
        Ok(())
    }

    #[test]
    fn test_sequence_runs_out() -> Result<(), SourceError> {
        let mut source = ImageSequence::new(vec![RgbImage::new(2, 2), RgbImage::new(3, 3)]);

        assert!(matches!(source.next_frame()?, Capture::Frame(f) if f.width() == 2));
        assert!(matches!(source.next_frame()?, Capture::Frame(f) if f.width() == 3));
        assert!(matches!(source.next_frame()?, Capture::Exhausted));
        Ok(())
    }

    #[test]
    fn test_looping_sequence_wraps_around() -> Result<(), SourceError> {
        let mut source = ImageSequence::new(vec![RgbImage::new(2, 2)]).looping();
        let released = source.release_flag();

        for _ in 0..3 {
            assert!(matches!(source.next_frame()?, Capture::Frame(_)));
        }
        source.release();

        assert!(released.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_empty_dir_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = std::env::temp_dir().join(format!("no-frames-{}", std::process::id()));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("notes.txt"), "not a frame")?;

        let result = ImageSequence::from_dir(&dir);
        fs::remove_dir_all(&dir)?;

        assert!(matches!(result, Err(SourceError::Empty(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_socket_source_decodes_published_jpeg() -> Result<(), Box<dyn std::error::Error>>
    {
        let (tx, _rx) = broadcast::channel(4);
        let mut source = SocketSource::new("line-1", tx.subscribe());
        let jpeg = encode_jpeg(&RgbImage::new(6, 4), 90)?;
        tx.send(Bytes::from(jpeg))?;

        let capture = tokio::task::spawn_blocking(move || {
            let capture = source.next_frame();
            source.release();
            capture
        })
        .await??;

        assert!(matches!(capture, Capture::Frame(f) if f.dimensions() == (6, 4)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_socket_source_idles_without_frames() -> Result<(), Box<dyn std::error::Error>> {
        let (tx, _rx) = broadcast::channel::<Bytes>(4);
        let mut source = SocketSource::new("line-1", tx.subscribe());

        let capture = tokio::task::spawn_blocking(move || source.next_frame()).await??;

        assert!(matches!(capture, Capture::Idle));
        Ok(())
    }
}
