//! Named sessions.
//!
//! Each session exclusively owns its [`SessionState`]. Only the model is shared between them.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::{
    live::{LiveStats, LiveStream},
    orchestrator::DetectionOrchestrator,
    session::SessionState,
    sources::FrameSource,
};

pub const DEFAULT_SESSION: &str = "default";

/// Rendered live frames a slow viewer may fall behind.
const RENDERED_CAPACITY: usize = 8;

pub struct Session {
    name: String,
    state: Arc<Mutex<SessionState>>,
    live: AsyncMutex<Option<LiveStream>>,
    rendered_tx: broadcast::Sender<Bytes>,
}

impl Session {
    fn new(name: &str) -> Self {
        let (rendered_tx, _) = broadcast::channel(RENDERED_CAPACITY);
        Self {
            name: name.to_owned(),
            state: Arc::new(Mutex::new(SessionState::new())),
            live: AsyncMutex::new(None),
            rendered_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// MJPEG parts of the frames rendered by the live stream.
    pub fn subscribe_rendered(&self) -> broadcast::Receiver<Bytes> {
        self.rendered_tx.subscribe()
    }

    /// Start a live stream unless one is already running. Returns whether it was started.
    pub async fn start_live(
        &self,
        orchestrator: Arc<DetectionOrchestrator>,
        source: Box<dyn FrameSource>,
        confidence_threshold: f32,
    ) -> bool {
        let mut live = self.live.lock().await;

        match live.take() {
            Some(running) if !running.is_finished() => {
                *live = Some(running);
                return false;
            }
            Some(finished) => {
                finished.join().await;
            }
            None => {}
        }

        log::info!("Starting live stream for session {}", self.name);
        *live = Some(LiveStream::start(
            orchestrator,
            self.state.clone(),
            source,
            confidence_threshold,
            self.rendered_tx.clone(),
        ));
        true
    }

    /// Stop the live stream, if any, and wait for it to wind down.
    pub async fn stop_live(&self) -> Option<LiveStats> {
        let stream = self.live.lock().await.take()?;
        log::info!("Stopping live stream for session {}", self.name);
        Some(stream.stop().await)
    }

    pub async fn is_live(&self) -> bool {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|stream| !stream.is_finished())
            .unwrap_or(false)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_or_create(&self, name: &str) -> Arc<Session> {
        self.lock()
            .entry(name.to_owned())
            .or_insert_with(|| {
                log::debug!("New session {name}");
                Arc::new(Session::new(name))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the live streams of all sessions.
    pub async fn stop_all(&self) {
        let sessions: Vec<_> = self.lock().values().cloned().collect();
        for session in sessions {
            session.stop_live().await;
        }
    }
}
