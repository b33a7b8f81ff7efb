//! The hub: single owner of the client registry.
//!
//! Sessions never touch the registry. They submit events through a
//! [`HubHandle`] and one task running [`Hub::run`] applies them in the order
//! they arrive, which gives every broadcast a total order. Fan-out offers each
//! message to every registered client's bounded outbound queue without
//! waiting, so a slow reader only ever affects itself.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HubOptions, OverflowPolicy};

pub type ClientId = u64;

/// One outbound line. Shared between recipients so fan-out does not copy text.
pub type Line = Arc<str>;

pub const HEADCOUNT_HEADER: &str = "Performing headcount..";

/// A connected client as seen by the hub.
///
/// The hub holds the only outbound sender once the client is registered, so
/// dropping the record is what closes the client's queue.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    name: String,
    outbound: mpsc::Sender<Line>,
    closer: CancellationToken,
}

impl Client {
    pub fn new(
        id: ClientId,
        name: impl Into<String>,
        outbound: mpsc::Sender<Line>,
        closer: CancellationToken,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            outbound,
            closer,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

enum HubEvent {
    Message {
        text: Line,
        sender: Option<ClientId>,
    },
    Join(Client),
    Leave(ClientId),
    Roster {
        respond_to: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

/// Cloneable submission side of the hub.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Allocates a correlation key for a new client.
    pub fn next_client_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues `text` for broadcast to every registered client.
    pub async fn submit_message(&self, text: impl Into<Line>) -> Result<()> {
        self.submit(HubEvent::Message {
            text: text.into(),
            sender: None,
        })
        .await
    }

    /// Queues `text` for broadcast to every registered client except `sender`.
    pub async fn submit_message_from(&self, sender: ClientId, text: impl Into<Line>) -> Result<()> {
        self.submit(HubEvent::Message {
            text: text.into(),
            sender: Some(sender),
        })
        .await
    }

    pub async fn submit_join(&self, client: Client) -> Result<()> {
        self.submit(HubEvent::Join(client)).await
    }

    pub async fn submit_leave(&self, id: ClientId) -> Result<()> {
        self.submit(HubEvent::Leave(id)).await
    }

    /// Names of the registered clients, in join order.
    ///
    /// The answer reflects every event submitted through this handle before
    /// the call.
    pub async fn roster(&self) -> Result<Vec<String>> {
        let (respond_to, response) = oneshot::channel();
        self.submit(HubEvent::Roster { respond_to }).await?;
        response.await.context("hub dropped roster request")
    }

    /// Closes every registered connection and stops the hub loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.submit(HubEvent::Shutdown).await
    }

    async fn submit(&self, event: HubEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("hub is not running"))
    }
}

pub struct Hub {
    events: mpsc::Receiver<HubEvent>,
    clients: BTreeMap<ClientId, Client>,
    options: HubOptions,
}

impl Hub {
    pub fn new(options: HubOptions) -> (Self, HubHandle) {
        let (events_tx, events) = mpsc::channel(options.event_capacity.max(1));
        let hub = Self {
            events,
            clients: BTreeMap::new(),
            options,
        };
        let handle = HubHandle {
            events: events_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// Builds a hub and runs it on its own task.
    pub fn spawn(options: HubOptions) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(options);
        (handle, tokio::spawn(hub.run()))
    }

    /// Processes events until [`HubHandle::shutdown`] is called or every
    /// handle has been dropped.
    pub async fn run(mut self) {
        debug!(headcount = self.options.headcount, overflow = ?self.options.overflow, "hub started");

        while let Some(event) = self.events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }

        self.disconnect_all();
        info!("hub stopped");
    }

    fn handle_event(&mut self, event: HubEvent) -> bool {
        match event {
            HubEvent::Message { text, sender } => self.fan_out(&text, sender),
            HubEvent::Join(client) => self.join(client),
            HubEvent::Leave(id) => self.leave(id),
            HubEvent::Roster { respond_to } => {
                let _ = respond_to.send(self.names().collect());
            }
            HubEvent::Shutdown => return false,
        }
        true
    }

    fn join(&mut self, client: Client) {
        if self.clients.contains_key(&client.id) {
            warn!(client_id = client.id, name = %client.name, "ignoring duplicate join");
            return;
        }

        info!(client_id = client.id, name = %client.name, clients = self.clients.len() + 1, "client registered");
        self.clients.insert(client.id, client);
        self.report_headcount();
    }

    fn leave(&mut self, id: ClientId) {
        // Dropping the record drops the last sender and closes the queue.
        match self.clients.remove(&id) {
            Some(client) => {
                info!(client_id = id, name = %client.name, clients = self.clients.len(), "client unregistered");
            }
            None => {
                debug!(client_id = id, "ignoring leave for unregistered client");
                return;
            }
        }
        self.report_headcount();
    }

    fn fan_out(&self, text: &Line, sender: Option<ClientId>) {
        let recipients = self
            .clients
            .values()
            .filter(|client| Some(client.id) != sender);

        for client in recipients {
            match client.outbound.try_send(Arc::clone(text)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => handle_overflow(client, self.options.overflow),
                Err(TrySendError::Closed(_)) => {
                    debug!(client_id = client.id, "outbound queue closed, skipping");
                }
            }
        }
    }

    fn report_headcount(&self) {
        if !self.options.headcount {
            return;
        }
        let roster = compose_headcount(self.names());
        self.fan_out(&Line::from(roster), None);
    }

    fn names(&self) -> impl Iterator<Item = String> + '_ {
        self.clients.values().map(|client| client.name.clone())
    }

    fn disconnect_all(&mut self) {
        for client in self.clients.values() {
            client.closer.cancel();
        }
        self.clients.clear();
    }
}

fn handle_overflow(client: &Client, policy: OverflowPolicy) {
    match policy {
        OverflowPolicy::Drop => {
            debug!(client_id = client.id, name = %client.name, "outbound queue full, dropping message");
        }
        OverflowPolicy::Disconnect => {
            if !client.closer.is_cancelled() {
                warn!(client_id = client.id, name = %client.name, "outbound queue full, disconnecting client");
                client.closer.cancel();
            }
        }
    }
}

/// Roster block: header line followed by one line per name.
pub fn compose_headcount<I>(names: I) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut roster = String::from(HEADCOUNT_HEADER);
    for name in names {
        roster.push('\n');
        roster.push_str(&name);
    }
    roster
}
