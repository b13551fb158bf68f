//! RFMP production node.
//!
//! Wraps the Sans-IO engine from `rfmp-core` with real I/O: a Tokio runtime
//! driving three cooperative loops (receive, transmit, housekeeping), a
//! KISS-over-TCP TNC client with reconnect, redb-backed durable storage, and
//! a broadcast event stream for API consumers.
//!
//! # Components
//!
//! - [`Node`]: the runtime handle — submit, subscribe, query, shutdown.
//! - [`RedbStore`]: durable storage (see [`storage`]).
//! - [`SystemEnv`]: production clock and RNG.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod storage;
mod system_env;
mod tnc;

use std::sync::Arc;
use std::time::Duration;

pub use error::NodeError;
pub use storage::RedbStore;
pub use system_env::SystemEnv;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinSet;

use rfmp_core::engine::Engine;
use rfmp_core::{
    ChannelInfo, Config, Message, MessageFilter, NodeEvent, NodeInfo, Status, Store, Submission,
};

/// Events kept per subscriber before the oldest are dropped.
const EVENT_BUFFER: usize = 256;

/// Housekeeping cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Graceful drain budget on shutdown; hard abort at twice this.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State shared between the runtime loops and the API surface.
pub(crate) struct NodeShared<S: Store> {
    pub(crate) engine: Mutex<Engine<SystemEnv, S>>,
    events: broadcast::Sender<NodeEvent>,
}

impl<S: Store> NodeShared<S> {
    pub(crate) fn publish(&self, events: Vec<NodeEvent>) {
        for event in events {
            // A send error only means nobody is subscribed right now.
            let _ = self.events.send(event);
        }
    }

    pub(crate) async fn set_connected(&self, connected: bool) {
        let event = {
            let mut engine = self.engine.lock().await;
            engine.set_connected(connected)
        };
        if let Ok(Some(event)) = event {
            self.publish(vec![event]);
        }
    }
}

/// A running (or runnable) RFMP node.
///
/// Cheap to clone; all clones share the same engine and event stream.
pub struct Node<S: Store> {
    shared: Arc<NodeShared<S>>,
    config: Config,
    shutdown: watch::Sender<bool>,
}

impl<S: Store> Clone for Node<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl Node<RedbStore> {
    /// Open the configured database and build a node around it.
    pub fn open(config: Config) -> Result<Self, NodeError> {
        let store = RedbStore::open(&config.storage.database_path)?;
        Self::with_store(config, store)
    }
}

impl<S: Store> Node<S> {
    /// Build a node on an explicit store (tests use the in-memory one).
    pub fn with_store(config: Config, store: S) -> Result<Self, NodeError> {
        config.validate()?;
        let env = SystemEnv::new();
        let engine = Engine::new(&config, env, store)?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(NodeShared { engine: Mutex::new(engine), events }),
            config,
            shutdown,
        })
    }

    /// Run the node loops until [`Node::shutdown`] is called.
    ///
    /// Spawns the TNC link (or the offline drain), plus housekeeping, and
    /// supervises them. On shutdown the loops drain within a grace period;
    /// stragglers are aborted at twice that.
    pub async fn run(&self) -> Result<(), NodeError> {
        let mut tasks = JoinSet::new();

        let shutdown_rx = self.shutdown.subscribe();
        if self.config.network.offline_mode {
            tracing::info!("offline mode: wire I/O disabled");
            tasks.spawn(tnc::run_offline_drain(Arc::clone(&self.shared), shutdown_rx));
        } else {
            tasks.spawn(tnc::run_link(
                Arc::clone(&self.shared),
                self.config.network.tnc_host.clone(),
                self.config.network.tnc_port,
                shutdown_rx,
            ));
        }
        tasks.spawn(housekeeping(Arc::clone(&self.shared), self.shutdown.subscribe()));

        // Park until shutdown is signalled.
        let mut waiter = self.shutdown.subscribe();
        while !*waiter.borrow() {
            if waiter.changed().await.is_err() {
                break;
            }
        }

        // Drain: give the loops a grace period, then abort stragglers.
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("shutdown grace period expired, aborting tasks");
            tasks.abort_all();
            let abort = async {
                while tasks.join_next().await.is_some() {}
            };
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, abort).await;
        }

        // Flush durable state (Bloom windows) last.
        let mut engine = self.shared.engine.lock().await;
        engine.shutdown()?;
        Ok(())
    }

    /// Signal every loop to stop; [`Node::run`] completes the flush.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Submit a message; returns the stored row synchronously.
    pub async fn submit_message(&self, submission: Submission) -> Result<Message, NodeError> {
        if *self.shutdown.borrow() {
            return Err(NodeError::ShuttingDown);
        }
        let (message, events) = {
            let mut engine = self.shared.engine.lock().await;
            engine.submit(submission)?
        };
        self.shared.publish(events);
        Ok(message)
    }

    /// Independent, cancellable stream of node events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.events.subscribe()
    }

    /// Query stored messages.
    pub async fn query_messages(&self, filter: MessageFilter) -> Result<Vec<Message>, NodeError> {
        let engine = self.shared.engine.lock().await;
        Ok(engine.query_messages(&filter)?)
    }

    /// Fetch one message by full id or unique ≥8-char prefix.
    pub async fn query_message(&self, id_or_prefix: &str) -> Result<Option<Message>, NodeError> {
        let engine = self.shared.engine.lock().await;
        Ok(engine.query_message(id_or_prefix)?)
    }

    /// All known channels.
    pub async fn query_channels(&self) -> Result<Vec<ChannelInfo>, NodeError> {
        let engine = self.shared.engine.lock().await;
        Ok(engine.query_channels()?)
    }

    /// Known stations, optionally only those active within a window.
    pub async fn query_nodes(
        &self,
        active_within_secs: Option<u32>,
    ) -> Result<Vec<NodeInfo>, NodeError> {
        let engine = self.shared.engine.lock().await;
        Ok(engine.query_nodes(active_within_secs)?)
    }

    /// Current status snapshot.
    pub async fn status(&self) -> Result<Status, NodeError> {
        let engine = self.shared.engine.lock().await;
        Ok(engine.status()?)
    }
}

/// Housekeeping loop: ticks the engine for bloom rotation, buffer sweeps,
/// SYNC emission, and REQ draining.
async fn housekeeping<S: Store>(shared: Arc<NodeShared<S>>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(TICK_INTERVAL) => {},
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }
        let result = {
            let mut engine = shared.engine.lock().await;
            engine.tick()
        };
        match result {
            Ok(events) => shared.publish(events),
            Err(err) => tracing::error!(%err, "housekeeping tick failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rfmp_core::MemoryStore;

    use super::*;

    fn config(offline: bool) -> Config {
        let mut config = Config::default();
        config.node.callsign = "N0CALL".to_string();
        config.node.ssid = 1;
        config.network.offline_mode = offline;
        config
    }

    fn submission(body: &str) -> Submission {
        Submission {
            channel: "general".to_string(),
            body: body.to_string(),
            priority: 1,
            reply_to: None,
            author: Some("op".to_string()),
        }
    }

    #[tokio::test]
    async fn submit_publishes_and_stores() {
        let node = Node::with_store(config(true), MemoryStore::new()).unwrap();
        let mut events = node.subscribe();

        let message = node.submit_message(submission("hello world")).await.unwrap();
        assert_eq!(message.channel, "general");
        assert_eq!(message.author, "op");

        match events.try_recv().unwrap() {
            NodeEvent::NewMessage(published) => assert_eq!(published.id, message.id),
            other => panic!("expected NewMessage, got {other:?}"),
        }

        let listed = node.query_messages(MessageFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        let by_prefix = node.query_message(&message.id.to_hex()[..8]).await.unwrap();
        assert_eq!(by_prefix.unwrap().id, message.id);
    }

    #[tokio::test]
    async fn offline_run_drains_queue_and_shuts_down() {
        let node = Node::with_store(config(true), MemoryStore::new()).unwrap();
        let runner = {
            let node = node.clone();
            tokio::spawn(async move { node.run().await })
        };

        let message = node.submit_message(submission("on the air")).await.unwrap();

        // The offline drain acks the frame; transmitted_at gets stamped.
        let mut stamped = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let found = node.query_message(&message.id.to_hex()).await.unwrap();
            if found.and_then(|m| m.transmitted_at).is_some() {
                stamped = true;
                break;
            }
        }
        assert!(stamped, "offline drain never cleared the queue");

        node.shutdown();
        runner.await.unwrap().unwrap();
        assert_eq!(node.status().await.unwrap().queue_depth, 0);
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let node = Node::with_store(config(true), MemoryStore::new()).unwrap();
        let mut first = node.subscribe();
        let mut second = node.subscribe();
        node.submit_message(submission("fan out")).await.unwrap();
        assert!(matches!(first.try_recv(), Ok(NodeEvent::NewMessage(_))));
        assert!(matches!(second.try_recv(), Ok(NodeEvent::NewMessage(_))));
    }

    #[tokio::test]
    async fn backpressure_surfaces_to_caller() {
        let mut cfg = config(true);
        cfg.protocol.queue_high_water = 1;
        let node = Node::with_store(cfg, MemoryStore::new()).unwrap();
        node.submit_message(submission("first")).await.unwrap();
        let err = node.submit_message(submission("second")).await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::Engine(rfmp_core::EngineError::Backpressure { .. })
        ));
    }
}
