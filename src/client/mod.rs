use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::clock::VectorClock;
use crate::error::{Error, Result};
use crate::interceptor::{intercept, Intercepted, Interceptor};
use crate::protocol::{
    find_action, ActionSpec, ChatMsg, ContentKind, Envelope, MsgContent, ACTION_CHAT_MESSAGE,
    ACTION_CLIENT_IDENTITY,
};
use crate::types::ProcessId;
use crate::wire::{spawn_worker, Connection, NetEvent};

/// Shared state of one chat client: its identity (assigned by the server on
/// connection), the message counters, the vector clock, and the bag of
/// messages whose causal predecessors have not all been delivered yet. All
/// mutations happen under the single `Mutex` wrapping the instance.
pub struct Client {
    identity: Option<ProcessId>,
    nb_sent: u64,
    nb_received: u64,
    clock: VectorClock,
    bag: Vec<ChatMsg>,
    delivered: Vec<ChatMsg>,
    conn: Option<Connection>,
    interceptors: Vec<Arc<Interceptor<Client>>>,
    interception_enabled: bool,
    changed: Arc<Notify>,
}

impl Client {
    fn new() -> Client {
        Client {
            identity: None,
            nb_sent: 0,
            nb_received: 0,
            clock: VectorClock::new(),
            bag: Vec::new(),
            delivered: Vec::new(),
            conn: None,
            interceptors: Vec::new(),
            interception_enabled: false,
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn identity(&self) -> Option<ProcessId> {
        self.identity
    }

    pub fn nb_sent(&self) -> u64 {
        self.nb_sent
    }

    pub fn nb_received(&self) -> u64 {
        self.nb_received
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Messages delivered so far, in delivery order.
    pub fn delivered(&self) -> &[ChatMsg] {
        &self.delivered
    }

    /// Whether a message of the given sender is parked in the bag.
    pub fn has_pending_from(&self, sender: ProcessId) -> bool {
        self.bag.iter().any(|msg| msg.sender == sender)
    }

    pub fn register_interceptor(&mut self, interceptor: Interceptor<Client>) {
        self.interceptors.push(Arc::new(interceptor));
    }

    pub fn set_interception_enabled(&mut self, enabled: bool) {
        self.interception_enabled = enabled;
    }

    /// Sends one console line as a chat message: the message carries this
    /// client's identity, its send count as sequence number and a snapshot of
    /// the vector clock, which is incremented afterwards.
    pub fn send_chat(&mut self, text: &str) -> Result<()> {
        let identity = self
            .identity
            .ok_or_else(|| Error::Protocol("no identity assigned yet".to_string()))?;
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| Error::Channel("not connected to a server".to_string()))?;
        let msg = ChatMsg {
            sender: identity,
            seq: self.nb_sent,
            text: text.to_string(),
            clock: self.clock.clone(),
        };
        info!("client {}: sending chat message: {}", identity, msg.text);
        println!("{}", display_chat(&msg));
        conn.send(Envelope::new(
            ACTION_CHAT_MESSAGE,
            identity,
            msg.seq,
            MsgContent::Chat(msg),
        ))?;
        self.nb_sent += 1;
        self.clock.increment_entry(identity);
        Ok(())
    }

    /* C-delivery: a received message joins the bag unless it was already
       delivered (the local entry for its sender is past the carried
       snapshot, which absorbs duplicate network deliveries). The bag is then
       drained: any message whose snapshot is dominated by the local clock is
       delivered and only the delivered entries are removed, until a full
       scan delivers nothing. Messages from this client itself bypass the
       bag. */
    fn receive_chat(&mut self, msg: ChatMsg) {
        let Some(identity) = self.identity else {
            warn!("client without identity received a chat message, dropping");
            return;
        };
        debug!("client {}: received: {}", identity, msg.text);
        self.nb_received += 1;
        if msg.sender == identity {
            return;
        }
        if self.clock.entry(msg.sender) > msg.clock.entry(msg.sender) {
            debug!(
                "client {}: duplicate of an already delivered message, dropping",
                identity
            );
            return;
        }
        if self.bag.contains(&msg) {
            debug!("client {}: message already in the bag, dropping", identity);
            return;
        }
        self.bag.push(msg);
        debug!("client {}: bag size = {}", identity, self.bag.len());
        self.drain_bag();
    }

    fn drain_bag(&mut self) {
        loop {
            let mut delivered_some = false;
            let mut index = 0;
            while index < self.bag.len() {
                if self.clock.dominates(&self.bag[index].clock) {
                    let msg = self.bag.remove(index);
                    println!("{}", display_chat(&msg));
                    self.clock.increment_entry(msg.sender);
                    self.delivered.push(msg);
                    delivered_some = true;
                } else {
                    index += 1;
                }
            }
            if !delivered_some {
                break;
            }
        }
    }

    /// Dispatches a client-algorithm payload through the action tables, the
    /// entry point for interceptor treatments replaying a delayed message.
    pub fn execute(&mut self, content: MsgContent) {
        let action = crate::protocol::action_of(&content);
        if let Some(spec) = find_action(CLIENT_ACTION_TABLES, action, content.kind()) {
            (spec.handler)(self, content);
        }
    }

    fn receive_identity(&mut self, msg: crate::protocol::IdentityMsg) {
        info!("assigned identity {} by server {}", msg.identity, msg.sender);
        self.identity = Some(msg.identity);
    }
}

fn display_chat(msg: &ChatMsg) -> String {
    format!(
        "sender = {}, sequence number = {}, content = {}",
        msg.sender, msg.seq, msg.text
    )
}

impl Intercepted for Client {
    fn interceptors(&self) -> &[Arc<Interceptor<Client>>] {
        &self.interceptors
    }

    fn interception_enabled(&self) -> bool {
        self.interception_enabled
    }

    fn changed(&self) -> &Arc<Notify> {
        &self.changed
    }
}

fn chat_action(client: &mut Client, content: MsgContent) {
    if let MsgContent::Chat(msg) = content {
        client.receive_chat(msg);
    }
}

fn identity_action(client: &mut Client, content: MsgContent) {
    if let MsgContent::Identity(msg) = content {
        client.receive_identity(msg);
    }
}

/// The action table of the chat algorithm.
const CHAT_ACTIONS: &[ActionSpec<Client>] = &[
    ActionSpec {
        id: ACTION_CHAT_MESSAGE,
        kind: ContentKind::Chat,
        handler: chat_action,
    },
    ActionSpec {
        id: ACTION_CLIENT_IDENTITY,
        kind: ContentKind::Identity,
        handler: identity_action,
    },
];

const CLIENT_ACTION_TABLES: &[&[ActionSpec<Client>]] = &[CHAT_ACTIONS];

/// A running client process: the shared state plus the handles driving it.
pub struct ClientHandle {
    client: Arc<Mutex<Client>>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Feeds one console line to the client: `quit` shuts it down, anything
    /// else is sent as a chat message.
    pub async fn console(&self, line: &str) -> Result<()> {
        if line.trim() == "quit" {
            self.shutdown().await;
            return Ok(());
        }
        let mut client = self.client.lock().await;
        client.send_chat(line)?;
        client.changed.notify_waiters();
        Ok(())
    }

    pub async fn identity(&self) -> Option<ProcessId> {
        self.client.lock().await.identity()
    }

    pub async fn clock_entry(&self, id: ProcessId) -> u64 {
        self.client.lock().await.clock().entry(id)
    }

    pub async fn nb_received(&self) -> u64 {
        self.client.lock().await.nb_received()
    }

    pub async fn delivered_texts(&self) -> Vec<String> {
        self.client
            .lock()
            .await
            .delivered()
            .iter()
            .map(|msg| msg.text.clone())
            .collect()
    }

    pub async fn register_interceptor(&self, interceptor: Interceptor<Client>) {
        self.client.lock().await.register_interceptor(interceptor);
    }

    pub async fn set_interception_enabled(&self, enabled: bool) {
        self.client
            .lock()
            .await
            .set_interception_enabled(enabled);
    }

    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let mut client = self.client.lock().await;
        client.conn = None;
        client.changed.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Connects to a chat server and spawns the loop reading messages from it.
/// Returns once the server has assigned this client its identity.
pub async fn start(host: &str, port: u16) -> Result<ClientHandle> {
    let stream = TcpStream::connect((host, port)).await.map_err(|e| {
        Error::Config(format!("cannot open a connection to the server: {}", e))
    })?;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let conn = spawn_worker(stream, 0, event_tx);
    let client = Arc::new(Mutex::new(Client::new()));
    client.lock().await.conn = Some(conn);

    let shutdown = Arc::new(Notify::new());
    let task = tokio::spawn(event_loop(client.clone(), event_rx, shutdown.clone()));

    //wait for the identity assigned by the server before handing control back
    let notify = { client.lock().await.changed.clone() };
    loop {
        let notified = notify.notified();
        if client.lock().await.identity.is_some() {
            break;
        }
        notified.await;
    }

    Ok(ClientHandle {
        client,
        shutdown,
        task,
    })
}

async fn event_loop(
    client: Arc<Mutex<Client>>,
    mut event_rx: mpsc::UnboundedReceiver<NetEvent>,
    shutdown: Arc<Notify>,
) {
    debug!("client thread for receiving messages from the network started");
    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(NetEvent::Message(_, envelope)) => {
                    treat_message(&client, envelope).await;
                }
                Some(NetEvent::Closed(_)) => {
                    error!("connection to the server closed");
                    break;
                }
                None => break,
            },
            _ = shutdown.notified() => {
                debug!("client event loop interrupted");
                break;
            }
        }
    }
    debug!("end of the client event loop");
}

async fn treat_message(client_arc: &Arc<Mutex<Client>>, envelope: Envelope) {
    let mut client = client_arc.lock().await;
    let Some(spec) = find_action(CLIENT_ACTION_TABLES, envelope.action, envelope.content.kind())
    else {
        debug!("no client action for message type {}, ignoring", envelope.action);
        return;
    };
    if let Some(content) = intercept(client_arc, &client, envelope.content) {
        (spec.handler)(&mut client, content);
    }
    client.changed.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_identity(id: u32) -> Client {
        let mut client = Client::new();
        client.identity = Some(ProcessId(id));
        client
    }

    fn msg(sender: u32, seq: u64, clock_entries: &[(u32, u64)]) -> ChatMsg {
        let mut clock = VectorClock::new();
        for (key, value) in clock_entries {
            clock.set_entry(ProcessId(*key), *value);
        }
        ChatMsg {
            sender: ProcessId(sender),
            seq,
            text: format!("message {} from {}", seq, sender),
            clock,
        }
    }

    #[test]
    fn messages_from_same_sender_deliver_in_order() {
        let mut client = client_with_identity(301);
        // second message of 101 arrives first: its snapshot requires the
        // first one to have been observed
        client.receive_chat(msg(101, 1, &[(101, 1)]));
        assert_eq!(client.delivered().len(), 0);
        assert!(client.has_pending_from(ProcessId(101)));

        client.receive_chat(msg(101, 0, &[]));
        assert_eq!(client.delivered().len(), 2);
        assert_eq!(client.delivered()[0].seq, 0);
        assert_eq!(client.delivered()[1].seq, 1);
        assert_eq!(client.clock().entry(ProcessId(101)), 2);
    }

    #[test]
    fn causal_chain_across_senders_is_respected() {
        let mut client = client_with_identity(301);
        // 201 sent its message after delivering 101's first message
        client.receive_chat(msg(201, 0, &[(101, 1)]));
        assert_eq!(client.delivered().len(), 0, "predecessor still missing");

        client.receive_chat(msg(101, 0, &[]));
        assert_eq!(client.delivered().len(), 2);
        assert_eq!(client.delivered()[0].sender, ProcessId(101));
        assert_eq!(client.delivered()[1].sender, ProcessId(201));
        assert_eq!(client.clock().entry(ProcessId(101)), 1);
        assert_eq!(client.clock().entry(ProcessId(201)), 1);
    }

    #[test]
    fn duplicate_delivery_does_not_advance_the_clock_twice() {
        let mut client = client_with_identity(301);
        client.receive_chat(msg(101, 0, &[]));
        assert_eq!(client.clock().entry(ProcessId(101)), 1);
        assert_eq!(client.delivered().len(), 1);

        // the network delivers the same message again
        client.receive_chat(msg(101, 0, &[]));
        assert_eq!(client.clock().entry(ProcessId(101)), 1);
        assert_eq!(client.delivered().len(), 1);
        assert!(!client.has_pending_from(ProcessId(101)));
    }

    #[test]
    fn duplicate_in_bag_is_kept_once() {
        let mut client = client_with_identity(301);
        let pending = msg(101, 1, &[(101, 1)]);
        client.receive_chat(pending.clone());
        client.receive_chat(pending);
        client.receive_chat(msg(101, 0, &[]));
        assert_eq!(client.delivered().len(), 2);
        assert_eq!(client.clock().entry(ProcessId(101)), 2);
    }

    #[test]
    fn own_messages_bypass_the_bag() {
        let mut client = client_with_identity(301);
        client.receive_chat(msg(301, 0, &[]));
        assert_eq!(client.nb_received(), 1);
        assert_eq!(client.delivered().len(), 0);
        assert!(!client.has_pending_from(ProcessId(301)));
    }

    #[test]
    fn undeliverable_message_stays_in_the_bag() {
        let mut client = client_with_identity(301);
        client.receive_chat(msg(101, 2, &[(101, 2), (201, 1)]));
        assert!(client.has_pending_from(ProcessId(101)));
        // an unrelated deliverable message must not flush the bag
        client.receive_chat(msg(201, 0, &[]));
        assert_eq!(client.delivered().len(), 1);
        assert!(client.has_pending_from(ProcessId(101)), "bag must keep undelivered entries");
    }

    #[test]
    fn sending_without_identity_is_a_protocol_error() {
        let mut client = Client::new();
        assert!(client.send_chat("hello").is_err());
    }
}
