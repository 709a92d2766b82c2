//! The routing layer runtime: tables, workers and dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use canmesh_config::{ConfigStore, RoutingConfig};

use crate::error::{RoutingError, RoutingResult};
use crate::events::{MeshEvent, ReceivedMessage, RoutingEvent, SendMode, SendRequest};
use crate::tables::{NeighborTable, RouteEntry, RoutingTable};

/// Maximum mesh message payload in bytes.
pub const MAX_MESSAGE_BYTES: usize = 256;

/// Depth of the mesh-event queue.
const EVENT_QUEUE_DEPTH: usize = 10;

/// Depth of the send and receive queues.
const MESSAGE_QUEUE_DEPTH: usize = 16;

/// Handle returned by [`RoutingLayer::register_callback`].
pub type SubscriberId = u64;

type Subscriber = Arc<dyn Fn(&RoutingEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct Tables {
    routing: RoutingTable,
    neighbors: NeighborTable,
}

/// Mesh-event-driven routing and neighbour table owner.
pub struct RoutingLayer {
    tables: Mutex<Tables>,
    config: Mutex<RoutingConfig>,
    store: Arc<ConfigStore>,
    subscribers: RwLock<Vec<(SubscriberId, Subscriber)>>,
    next_subscriber: AtomicU64,
    event_tx: mpsc::Sender<MeshEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<MeshEvent>>>,
    send_tx: mpsc::Sender<SendRequest>,
    send_rx: Mutex<Option<mpsc::Receiver<SendRequest>>>,
    recv_tx: mpsc::Sender<ReceivedMessage>,
    recv_rx: Mutex<Option<mpsc::Receiver<ReceivedMessage>>>,
    started_at: Instant,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RoutingLayer {
    /// Create the layer, loading the routing knobs from the config store.
    ///
    /// A missing or unreadable config file falls back to defaults; routing
    /// can always come up.
    pub async fn init(store: Arc<ConfigStore>) -> Arc<Self> {
        let routing = match store.load().await {
            Ok(config) => config.routing,
            Err(err) => {
                warn!(%err, "routing config unavailable, using defaults");
                RoutingConfig::default()
            }
        };
        info!(
            default_cost = routing.default_cost,
            retry_count = routing.retry_count,
            retry_delay_ms = routing.retry_delay_ms,
            "routing layer initialized"
        );

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (send_tx, send_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        let (recv_tx, recv_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);

        Arc::new(Self {
            tables: Mutex::new(Tables::default()),
            config: Mutex::new(routing),
            store,
            subscribers: RwLock::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            recv_tx,
            recv_rx: Mutex::new(Some(recv_rx)),
            started_at: Instant::now(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the event, send and receive workers.
    pub fn start(self: &Arc<Self>) {
        self.start_event_task();
        self.start_send_task();
        self.start_receive_task();
        info!("routing workers started");
    }

    /// Stop all workers.
    pub fn stop(&self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }

    fn start_event_task(self: &Arc<Self>) {
        let Some(mut rx) = self.event_rx.lock().take() else {
            warn!("routing event task already started");
            return;
        };
        let layer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = layer.process_mesh_event(event) {
                    warn!(%err, "mesh event not processed");
                }
            }
        });
        self.workers.lock().push(handle);
    }

    fn start_send_task(self: &Arc<Self>) {
        let Some(mut rx) = self.send_rx.lock().take() else {
            warn!("routing send task already started");
            return;
        };
        let layer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                layer.dispatch(request).await;
            }
        });
        self.workers.lock().push(handle);
    }

    fn start_receive_task(self: &Arc<Self>) {
        let Some(mut rx) = self.recv_rx.lock().take() else {
            warn!("routing receive task already started");
            return;
        };
        let layer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                info!(
                    src = %message.src,
                    bytes = message.data.len(),
                    "mesh message received"
                );
                layer.notify(&RoutingEvent::MessageReceived(Arc::new(message)));
            }
        });
        self.workers.lock().push(handle);
    }

    /// Replace the neighbour table and recompute routes.
    pub fn update_topology(&self, neighbors: &NeighborTable) {
        {
            let mut tables = self.tables.lock();
            tables.neighbors = neighbors.clone();
            info!(count = neighbors.len(), "neighbour table updated");
        }
        self.notify(&RoutingEvent::NeighborTableUpdated(neighbors.clone()));
        self.recalculate_routes();
    }

    /// Rebuild the routing table from the current neighbour set.
    ///
    /// Each neighbour becomes its own next hop at the configured default
    /// cost.
    pub fn recalculate_routes(&self) {
        let default_cost = self.config.lock().default_cost;
        let now_ms = self.millis_since_start();
        let snapshot = {
            let mut tables = self.tables.lock();
            let neighbors = tables.neighbors.clone();
            tables.routing.clear();
            for neighbor in neighbors.entries() {
                tables.routing.push_unchecked(RouteEntry {
                    dest: neighbor.id.clone(),
                    next_hop: neighbor.id.clone(),
                    cost: default_cost,
                    updated_at_ms: now_ms,
                });
            }
            tables.routing.truncate_to_capacity();
            info!(entries = tables.routing.len(), "routes recalculated");
            tables.routing.clone()
        };
        self.notify(&RoutingEvent::TableUpdated(snapshot));
    }

    /// Insert a route.
    pub fn insert_route(&self, entry: RouteEntry) -> RoutingResult<()> {
        let snapshot = {
            let mut tables = self.tables.lock();
            tables.routing.insert(entry)?;
            tables.routing.clone()
        };
        self.notify(&RoutingEvent::TableUpdated(snapshot));
        Ok(())
    }

    /// Update an existing route.
    pub fn update_route(&self, entry: RouteEntry) -> RoutingResult<()> {
        let snapshot = {
            let mut tables = self.tables.lock();
            tables.routing.update(entry)?;
            tables.routing.clone()
        };
        self.notify(&RoutingEvent::TableUpdated(snapshot));
        Ok(())
    }

    /// Remove the route for a destination.
    ///
    /// A miss is reported to subscribers as a route failure.
    pub fn remove_route(&self, dest: &str) -> RoutingResult<()> {
        let removed = {
            let mut tables = self.tables.lock();
            tables.routing.remove(dest).map(|_| tables.routing.clone())
        };
        match removed {
            Ok(snapshot) => {
                self.notify(&RoutingEvent::TableUpdated(snapshot));
                Ok(())
            }
            Err(err) => {
                warn!(dest, "route removal miss");
                self.notify(&RoutingEvent::RouteFailure(dest.to_string()));
                Err(err)
            }
        }
    }

    /// Snapshot of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.tables.lock().routing.clone()
    }

    /// Snapshot of the neighbour table.
    pub fn neighbor_table(&self) -> NeighborTable {
        self.tables.lock().neighbors.clone()
    }

    /// Queue a message for the send task.
    ///
    /// # Errors
    ///
    /// Empty payloads are rejected and reported to subscribers as a route
    /// failure.
    pub async fn send_message(
        &self,
        dest: &str,
        data: &[u8],
        mode: SendMode,
    ) -> RoutingResult<()> {
        if data.is_empty() {
            self.notify(&RoutingEvent::RouteFailure(dest.to_string()));
            return Err(RoutingError::EmptyMessage);
        }
        self.send_tx
            .send(SendRequest {
                dest: dest.to_string(),
                data: data.to_vec(),
                mode,
            })
            .await
            .map_err(|_| RoutingError::QueueClosed)
    }

    /// Accept a message from the mesh and queue it for subscribers.
    pub async fn receive_message(&self, src: &str, data: &[u8]) -> RoutingResult<()> {
        if src.is_empty() || data.is_empty() {
            return Err(RoutingError::EmptyMessage);
        }
        if data.len() > MAX_MESSAGE_BYTES {
            return Err(RoutingError::MessageTooLarge(data.len()));
        }
        self.recv_tx
            .send(ReceivedMessage {
                src: src.to_string(),
                data: data.to_vec(),
            })
            .await
            .map_err(|_| RoutingError::QueueClosed)
    }

    /// Queue a mesh event for the event task.
    pub async fn queue_mesh_event(&self, event: MeshEvent) -> RoutingResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| RoutingError::QueueClosed)
    }

    /// Process one mesh event immediately.
    ///
    /// # Errors
    ///
    /// Unknown events are ignored with a warning and reported back.
    pub fn process_mesh_event(&self, event: MeshEvent) -> RoutingResult<()> {
        match event {
            MeshEvent::NeighborChange(neighbors) => {
                info!("processing neighbour change");
                self.update_topology(&neighbors);
                Ok(())
            }
            MeshEvent::ParentConnected => {
                info!("parent connected, recomputing routes");
                self.recalculate_routes();
                Ok(())
            }
            MeshEvent::RootSwitched => {
                info!("mesh root switched, recomputing routes");
                self.recalculate_routes();
                Ok(())
            }
            MeshEvent::Unknown(id) => {
                warn!(event = id, "unhandled mesh event");
                Err(RoutingError::UnhandledEvent(id))
            }
        }
    }

    /// Update the routing knobs and persist them.
    ///
    /// The in-memory knobs stay updated even when persistence fails.
    pub async fn set_config(&self, config: RoutingConfig) -> RoutingResult<()> {
        {
            *self.config.lock() = config;
            info!(
                default_cost = config.default_cost,
                retry_count = config.retry_count,
                retry_delay_ms = config.retry_delay_ms,
                "routing configuration updated"
            );
        }
        if let Err(err) = self.store.update_routing(config).await {
            error!(%err, "failed to persist routing configuration");
            return Err(err.into());
        }
        Ok(())
    }

    /// Current routing knobs.
    pub fn config(&self) -> RoutingConfig {
        *self.config.lock()
    }

    /// Subscribe to routing events.
    pub fn register_callback<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&RoutingEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    /// Drop a subscription. Returns whether it existed.
    pub fn unregister_callback(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        before != subscribers.len()
    }

    async fn dispatch(&self, request: SendRequest) {
        match request.mode {
            SendMode::Unicast => self.dispatch_unicast(&request).await,
            SendMode::Multicast => self.dispatch_multicast(&request),
            SendMode::Broadcast => self.dispatch_broadcast(&request),
        }
    }

    async fn dispatch_unicast(&self, request: &SendRequest) {
        let (retry_count, retry_delay) = {
            let config = self.config.lock();
            (
                config.retry_count,
                Duration::from_millis(u64::from(config.retry_delay_ms)),
            )
        };

        let mut next_hop = self.lookup_next_hop(&request.dest);
        let mut attempts = 0u8;
        while next_hop.is_none() && attempts < retry_count {
            warn!(
                dest = %request.dest,
                attempt = attempts + 1,
                retry_count,
                "route miss, recomputing and retrying"
            );
            tokio::time::sleep(retry_delay).await;
            self.recalculate_routes();
            next_hop = self.lookup_next_hop(&request.dest);
            attempts += 1;
        }

        match next_hop {
            Some(next_hop) => {
                info!(
                    dest = %request.dest,
                    next_hop = %next_hop,
                    bytes = request.data.len(),
                    "unicast message dispatched"
                );
            }
            None => {
                error!(
                    dest = %request.dest,
                    attempts = retry_count,
                    "no route after fallback retries, dropping message"
                );
                self.notify(&RoutingEvent::RouteFailure(request.dest.clone()));
            }
        }
    }

    fn dispatch_multicast(&self, request: &SendRequest) {
        let members = self.tables.lock().routing.group_members(&request.dest);
        if members == 0 {
            warn!(group = %request.dest, "no multicast members");
            self.notify(&RoutingEvent::RouteFailure(request.dest.clone()));
            return;
        }
        info!(
            group = %request.dest,
            members,
            bytes = request.data.len(),
            "multicast message dispatched"
        );
    }

    fn dispatch_broadcast(&self, request: &SendRequest) {
        let neighbors = self.tables.lock().neighbors.len();
        if neighbors == 0 {
            warn!("broadcast with no neighbours");
            self.notify(&RoutingEvent::RouteFailure(request.dest.clone()));
            return;
        }
        info!(
            neighbors,
            bytes = request.data.len(),
            "broadcast message dispatched"
        );
    }

    fn lookup_next_hop(&self, dest: &str) -> Option<String> {
        self.tables
            .lock()
            .routing
            .find(dest)
            .map(|entry| entry.next_hop.clone())
    }

    fn notify(&self, event: &RoutingEvent) {
        let subscribers = self.subscribers.read().clone();
        for (_, subscriber) in &subscribers {
            subscriber(event);
        }
    }

    fn millis_since_start(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

impl std::fmt::Debug for RoutingLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("RoutingLayer")
            .field("routes", &tables.routing.len())
            .field("neighbors", &tables.neighbors.len())
            .field("config", &*self.config.lock())
            .finish()
    }
}
