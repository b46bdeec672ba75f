//! Named broadcast channels carrying encoded camera frames.
use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::interval,
};

pub type BytesSender = broadcast::Sender<Bytes>;
pub type BytesReceiver = broadcast::Receiver<Bytes>;

/// Frames a slow subscriber may fall behind before it starts skipping.
const CHANNEL_CAPACITY: usize = 20;

#[derive(Default)]
pub struct NamedPubSub {
    map: Mutex<HashMap<String, BytesSender>>,
}

impl NamedPubSub {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_broadcast_sender(&self, name: &str) -> BytesSender {
        let mut map = self.map.lock().await;
        map.entry(name.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub async fn get_broadcast_receiver(&self, name: &str) -> BytesReceiver {
        let mut map = self.map.lock().await;
        match map.get(name) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
                map.insert(name.to_owned(), tx);
                rx
            }
        }
    }

    /// Drop channels nobody listens to anymore.
    pub async fn prune(&self) {
        let mut map = self.map.lock().await;
        let before = map.len();
        map.retain(|_name, tx| tx.receiver_count() > 0);
        if map.len() < before {
            log::debug!("Pruned {} idle channels", before - map.len());
        }
    }

    pub async fn len(&self) -> usize {
        self.map.lock().await.len()
    }
}

/// Prune `pubsub` every `period` until the task is aborted.
pub fn spawn_pubsub_pruner(pubsub: Arc<NamedPubSub>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut prune_interval = interval(period);
        loop {
            prune_interval.tick().await;
            pubsub.prune().await;
        }
    })
}
