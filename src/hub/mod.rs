//! Event Hub
//!
//! Websocket fan-out over connected viewers. The accept loop (semaphore-
//! bounded connection count, per-connection bounded queue, exponential
//! accept-error backoff) is the same shape as `event::socket::listen`,
//! generalized from a Unix-socket hook listener to a TCP websocket server;
//! the connection registry (`Arc<RwLock<HashMap<...>>>` keyed by connection
//! id) is the same shape as `sprite::forwarder::HookEventForwarder`.

pub mod wire;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use wire::{InboundMessage, OutboundMessage};

const MAX_CONNECTIONS: usize = 256;
const VIEWER_QUEUE_CAPACITY: usize = 512;
const BATCH_WINDOW: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_millis(5000);

#[derive(Clone)]
enum Filter {
    All,
    Sessions(HashSet<String>),
}

struct Viewer {
    filter: Filter,
    tx: mpsc::Sender<OutboundMessage>,
    attached: HashSet<String>,
}

/// Callbacks the hub invokes when it routes an inbound viewer command or
/// when a session gains/loses its last attached viewer. Unset callbacks
/// are no-ops, matching the teacher's pattern of optional status channels
/// in `sprite::forwarder::HookEventForwarder`.
pub struct HubCallbacks {
    pub on_input: Option<Box<dyn Fn(&str, &str) + Send + Sync>>,
    pub on_resize: Option<Box<dyn Fn(&str, u16, u16) + Send + Sync>>,
    pub on_attach: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_detach: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_new_session: Option<Box<dyn Fn(Option<String>) -> String + Send + Sync>>,
}

impl Default for HubCallbacks {
    fn default() -> Self {
        Self {
            on_input: None,
            on_resize: None,
            on_attach: None,
            on_detach: None,
            on_new_session: None,
        }
    }
}

pub struct EventHub {
    viewers: Arc<RwLock<HashMap<u64, Viewer>>>,
    callbacks: Arc<HubCallbacks>,
    next_viewer_id: std::sync::atomic::AtomicU64,
}

impl EventHub {
    pub fn new(callbacks: HubCallbacks) -> Self {
        Self {
            viewers: Arc::new(RwLock::new(HashMap::new())),
            callbacks: Arc::new(callbacks),
            next_viewer_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Broadcast a message to every viewer whose filter matches its session id.
    pub async fn broadcast(&self, session_id: Option<&str>, message: OutboundMessage) {
        let viewers = self.viewers.read().await;
        for viewer in viewers.values() {
            let matches = match (&viewer.filter, session_id) {
                (Filter::All, _) => true,
                (Filter::Sessions(set), Some(id)) => set.contains(id),
                (Filter::Sessions(_), None) => true,
            };
            if matches {
                // Bounded queue: drop for this viewer only if full, never block the hub.
                let _ = viewer.tx.try_send(message.clone());
            }
        }
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "event hub listening");

        let semaphore = Arc::new(Semaphore::new(MAX_CONNECTIONS));
        let mut backoff = Duration::ZERO;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("event hub shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            backoff = Duration::ZERO;
                            let permit = match semaphore.clone().try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    tracing::warn!("viewer connection limit reached, dropping {peer}");
                                    continue;
                                }
                            };
                            let hub = self.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) = hub.handle_connection(stream, peer, cancel).await {
                                    tracing::warn!(%peer, error = %e, "viewer connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "accept error");
                            backoff = if backoff.is_zero() { Duration::from_millis(100) } else { (backoff * 2).min(MAX_BACKOFF) };
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        let viewer_id = self.next_viewer_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel(VIEWER_QUEUE_CAPACITY);
        self.viewers.write().await.insert(
            viewer_id,
            Viewer {
                filter: Filter::All,
                tx,
                attached: HashSet::new(),
            },
        );

        let send_task = tokio::spawn(async move {
            let mut pending: HashMap<(String, String), Vec<OutboundMessage>> = HashMap::new();
            let mut batch_timer = tokio::time::interval(BATCH_WINDOW);
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        match msg {
                            Some(OutboundMessage::Output { ref session_id, ref window, .. }) => {
                                pending.entry((session_id.clone(), window.clone())).or_default().push(msg.unwrap());
                            }
                            Some(other) => {
                                if write.send(Message::text(serde_json::to_string(&other).unwrap_or_default())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = batch_timer.tick() => {
                        for ((_, _), batch) in pending.drain() {
                            if let Some(coalesced) = coalesce_output_batch(batch) {
                                if write.send(Message::text(serde_json::to_string(&coalesced).unwrap_or_default())).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = read.next() => {
                    match next {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_inbound(viewer_id, &text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(%peer, error = %e, "viewer read error");
                            break;
                        }
                    }
                }
            }
        }

        send_task.abort();
        self.drop_viewer(viewer_id).await;
        Ok(())
    }

    async fn handle_inbound(&self, viewer_id: u64, text: &str) {
        let parsed: Result<InboundMessage, _> = serde_json::from_str(text);
        let msg = match parsed {
            Ok(m) => m,
            Err(e) => {
                if let Some(viewer) = self.viewers.read().await.get(&viewer_id) {
                    let _ = viewer
                        .tx
                        .try_send(OutboundMessage::Error { message: format!("bad message: {e}") });
                }
                return;
            }
        };

        match msg {
            InboundMessage::Input { session_id, keys, .. }
            | InboundMessage::TerminalInput { session_id, keys, .. } => {
                if let Some(cb) = &self.callbacks.on_input {
                    cb(&session_id, &keys);
                }
            }
            InboundMessage::TerminalResize { session_id, cols, rows, .. } => {
                if let Some(cb) = &self.callbacks.on_resize {
                    cb(&session_id, cols, rows);
                }
            }
            InboundMessage::Subscribe { session_id } => {
                self.subscribe(viewer_id, session_id).await;
            }
            InboundMessage::NewSession { name } => {
                if let Some(cb) = &self.callbacks.on_new_session {
                    let _ = cb(name);
                }
            }
            InboundMessage::NewWindow { .. } | InboundMessage::KillWindow { .. } => {
                // Window-level operations are dispatched by the lifecycle
                // manager once it resolves the (session, window) mapping;
                // the hub only routes input/resize/subscribe itself.
            }
        }
    }

    async fn subscribe(&self, viewer_id: u64, session_id: Option<String>) {
        let mut viewers = self.viewers.write().await;
        let Some(viewer) = viewers.get_mut(&viewer_id) else { return };

        match session_id {
            None => {
                let previously_attached: Vec<String> = viewer.attached.drain().collect();
                viewer.filter = Filter::All;
                drop(viewers);
                for id in previously_attached {
                    self.maybe_fire_detach(&id).await;
                }
            }
            Some(id) => {
                match &mut viewer.filter {
                    Filter::All => {
                        let mut set = HashSet::new();
                        set.insert(id.clone());
                        viewer.filter = Filter::Sessions(set);
                    }
                    Filter::Sessions(set) => {
                        set.insert(id.clone());
                    }
                }
                let newly_attached = viewer.attached.insert(id.clone());
                drop(viewers);
                if newly_attached {
                    if let Some(cb) = &self.callbacks.on_attach {
                        cb(&id);
                    }
                }
            }
        }
    }

    async fn drop_viewer(&self, viewer_id: u64) {
        let attached = {
            let mut viewers = self.viewers.write().await;
            viewers.remove(&viewer_id).map(|v| v.attached).unwrap_or_default()
        };
        for id in attached {
            self.maybe_fire_detach(&id).await;
        }
    }

    async fn maybe_fire_detach(&self, session_id: &str) {
        let still_attached = {
            let viewers = self.viewers.read().await;
            viewers.values().any(|v| v.attached.contains(session_id))
        };
        if !still_attached {
            if let Some(cb) = &self.callbacks.on_detach {
                cb(session_id);
            }
        }
    }
}

fn coalesce_output_batch(batch: Vec<OutboundMessage>) -> Option<OutboundMessage> {
    let mut ids = Vec::new();
    let mut text = String::new();
    let mut session_id = String::new();
    let mut window = String::new();
    let mut class = crate::parser::MessageClass::Normal;
    let mut quick_actions = Vec::new();
    let mut timestamp = 0;

    for msg in batch {
        if let OutboundMessage::Output {
            id,
            session_id: sid,
            window: win,
            text: t,
            class: c,
            quick_actions: qa,
            timestamp: ts,
        } = msg
        {
            ids.push(id);
            text.push_str(&t);
            session_id = sid;
            window = win;
            class = c;
            quick_actions = qa;
            timestamp = ts;
        }
    }

    if ids.is_empty() {
        return None;
    }
    Some(OutboundMessage::Output {
        id: ids.join(","),
        session_id,
        window,
        text,
        class,
        quick_actions,
        timestamp,
    })
}
