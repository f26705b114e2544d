pub mod election;
pub mod mutex;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::clock::RequestVector;
use crate::error::{Error, Result};
use crate::interceptor::{intercept, Intercepted, Interceptor};
use crate::protocol::{
    action_of, find_action, ActionSpec, ContentKind, Envelope, IdentityMsg, MsgContent,
};
use crate::types::{client_identity, client_port, server_port, validate_config, ProcessId,
    ServerConfig};
use crate::wire::{spawn_worker, ConnId, Connection, NetEvent};

/// Election state of a server.
///
/// `Sleeping` is the initial state; `Leader` and `Nonleader` are terminal for
/// an election round; a new election reopens the machine. `Initiator` marks a
/// server that started a candidacy itself, `Candidate` a server relaying an
/// election it did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Sleeping,
    Candidate,
    Initiator,
    Leader,
    Nonleader,
}

/// Shared state of one chat server. Every mutation happens under the single
/// `Mutex` wrapping the instance: the event loop, the console entry points
/// and the interceptor workers all serialise through that lock.
pub struct Server {
    id: ProcessId,
    state: State,
    //identity announced by the last election round, used to forward a leader
    //announcement exactly once; cleared when a new round's token passes by
    leader: Option<ProcessId>,
    seq_number: u64,
    //connection tables
    server_workers: BTreeMap<ConnId, Connection>,
    client_workers: BTreeMap<ConnId, Connection>,
    //originating connection of the last message received per server identity,
    //used to route replies (mutex token hand-off)
    server_routes: BTreeMap<ProcessId, ConnId>,
    //highest sequence number already forwarded per client identity; the sole
    //defense against re-circulation on a cyclic overlay
    client_seq_numbers: HashMap<ProcessId, u64>,
    next_client_number: u32,
    //connection the message currently being treated arrived on
    current_conn: Option<ConnId>,
    //mutual exclusion
    ns: u64,
    pending_requests: RequestVector,
    token: Option<RequestVector>,
    critical: bool,
    waiting: bool,
    //interception
    interceptors: Vec<Arc<Interceptor<Server>>>,
    interception_enabled: bool,
    changed: Arc<Notify>,
}

impl Server {
    fn new(id: ProcessId) -> Server {
        Server {
            id,
            state: State::Sleeping,
            leader: None,
            seq_number: 0,
            server_workers: BTreeMap::new(),
            client_workers: BTreeMap::new(),
            server_routes: BTreeMap::new(),
            client_seq_numbers: HashMap::new(),
            next_client_number: 0,
            current_conn: None,
            ns: 0,
            pending_requests: RequestVector::new(),
            token: None,
            critical: false,
            waiting: false,
            interceptors: Vec::new(),
            interception_enabled: false,
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn identity(&self) -> ProcessId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The leader announced by the last completed election round, if any.
    pub fn leader(&self) -> Option<ProcessId> {
        self.leader
    }

    /// Whether this server is currently inside the critical section.
    pub fn critical(&self) -> bool {
        self.critical
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn register_interceptor(&mut self, interceptor: Interceptor<Server>) {
        self.interceptors.push(Arc::new(interceptor));
    }

    pub fn set_interception_enabled(&mut self, enabled: bool) {
        self.interception_enabled = enabled;
    }

    //The next envelope sequence number of this server's own control messages.
    fn next_seq(&mut self) -> u64 {
        self.seq_number += 1;
        self.seq_number
    }

    pub(crate) fn envelope(&mut self, content: MsgContent) -> Envelope {
        let action = action_of(&content);
        let seq = self.next_seq();
        Envelope::new(action, self.id, seq, content)
    }

    /// Dispatches a server-algorithm payload through the action tables, the
    /// entry point for interceptor treatments replaying a delayed message.
    /// Unknown payloads are ignored, as on the normal path.
    pub fn execute(&mut self, content: MsgContent) {
        let action = action_of(&content);
        if let Some(spec) = find_action(SERVER_ACTION_TABLES, action, content.kind()) {
            (spec.handler)(self, content);
        }
    }

    fn send_on(&self, conn: ConnId, envelope: Envelope) {
        let worker = self
            .server_workers
            .get(&conn)
            .or_else(|| self.client_workers.get(&conn));
        match worker {
            Some(worker) => {
                if let Err(e) = worker.send(envelope) {
                    warn!("{}: send on connection {} failed: {}", self.id, conn, e);
                }
            }
            None => warn!("{}: no connection {} to send on", self.id, conn),
        }
    }

    pub(crate) fn send_to_all_servers(&self, except: Option<ConnId>, envelope: &Envelope) {
        for (conn, worker) in &self.server_workers {
            if Some(*conn) == except {
                continue;
            }
            if let Err(e) = worker.send(envelope.clone()) {
                warn!("{}: send on connection {} failed: {}", self.id, conn, e);
            }
        }
    }

    /// The next hop of the logical ring: the first server connection, in
    /// creation order, other than the one to exclude. On a two-server ring
    /// the excluded connection is the only link and the token goes back on
    /// it.
    pub(crate) fn next_server_conn(&self, exclude: Option<ConnId>) -> Option<ConnId> {
        self.server_workers
            .keys()
            .copied()
            .find(|conn| Some(*conn) != exclude)
            .or_else(|| exclude.filter(|conn| self.server_workers.contains_key(conn)))
    }

    /// Floods a client chat message to every neighbouring server and every
    /// local client except the connection it arrived on.
    fn forward(&mut self, arrival: ConnId, envelope: &Envelope) {
        debug!(
            "{}: forwarding message of client {} with sequence number {}",
            self.id, envelope.sender, envelope.seq
        );
        for (conn, worker) in self.server_workers.iter().chain(self.client_workers.iter()) {
            if *conn == arrival {
                continue;
            }
            if let Err(e) = worker.send(envelope.clone()) {
                warn!("{}: send on connection {} failed: {}", self.id, conn, e);
            }
        }
    }

    fn remove_worker(&mut self, conn: ConnId) {
        self.server_workers.remove(&conn);
        self.client_workers.remove(&conn);
        self.server_routes.retain(|_, route| *route != conn);
        info!("{}: closing a channel", self.id);
    }

    /// Treats an operator command. Returns `true` when the command asks the
    /// server to quit.
    pub fn treat_console_input(&mut self, line: &str) -> bool {
        debug!("{}: new command line on console: {}", self.id, line);
        match line.trim() {
            "quit" => return true,
            "election" => election::start_election(self),
            "mutex" => mutex::request_critical_section(self),
            "" => {}
            other => warn!("{}: unknown console command: {}", self.id, other),
        }
        false
    }
}

impl Intercepted for Server {
    fn interceptors(&self) -> &[Arc<Interceptor<Server>>] {
        &self.interceptors
    }

    fn interception_enabled(&self) -> bool {
        self.interception_enabled
    }

    fn changed(&self) -> &Arc<Notify> {
        &self.changed
    }
}

//The two server-side algorithms, searched in order by the dispatcher.
const SERVER_ACTION_TABLES: &[&[ActionSpec<Server>]] = &[election::ACTIONS, mutex::ACTIONS];

/// Dispatches a server-algorithm message: looks the action up in the tables
/// of the algorithms, lets the interceptors have a go at it, and invokes the
/// matching handler. An unknown action is a silent no-op.
fn dispatch(server_arc: &Arc<Mutex<Server>>, guard: &mut Server, envelope: Envelope) {
    let kind = envelope.content.kind();
    let Some(spec) = find_action(SERVER_ACTION_TABLES, envelope.action, kind) else {
        debug!(
            "{}: no action for message type {}, ignoring",
            guard.id, envelope.action
        );
        return;
    };
    if let Some(content) = intercept(server_arc, guard, envelope.content) {
        (spec.handler)(guard, content);
    }
}

/// A running server process: the shared state plus the handles driving it.
pub struct ServerHandle {
    server: Arc<Mutex<Server>>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Feeds one console line to the server, exactly as the operator would.
    pub async fn console(&self, line: &str) -> Result<()> {
        let quit = {
            let mut server = self.server.lock().await;
            let quit = server.treat_console_input(line);
            server.changed.notify_waiters();
            quit
        };
        if quit {
            self.shutdown().await;
        }
        Ok(())
    }

    pub async fn state(&self) -> State {
        self.server.lock().await.state()
    }

    pub async fn critical(&self) -> bool {
        self.server.lock().await.critical()
    }

    pub async fn has_token(&self) -> bool {
        self.server.lock().await.has_token()
    }

    pub async fn leader(&self) -> Option<ProcessId> {
        self.server.lock().await.leader()
    }

    pub async fn identity(&self) -> ProcessId {
        self.server.lock().await.identity()
    }

    pub async fn register_interceptor(&self, interceptor: Interceptor<Server>) {
        self.server.lock().await.register_interceptor(interceptor);
    }

    pub async fn set_interception_enabled(&self, enabled: bool) {
        self.server
            .lock()
            .await
            .set_interception_enabled(enabled);
    }

    /// Interrupts the event loop and drops every connection.
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let mut server = self.server.lock().await;
        server.server_workers.clear();
        server.client_workers.clear();
        server.changed.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Starts a server process: binds the two accepting sockets, connects to the
/// configured neighbours, and spawns the event loop.
pub async fn start(config: ServerConfig) -> Result<ServerHandle> {
    validate_config(&config)?;
    let server_listener = TcpListener::bind(("127.0.0.1", server_port(config.id))).await?;
    let client_listener = TcpListener::bind(("127.0.0.1", client_port(config.id))).await?;
    info!(
        "{}: accepting servers on port {} and clients on port {}",
        config.id,
        server_port(config.id),
        client_port(config.id)
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let server = Arc::new(Mutex::new(Server::new(config.id)));
    let mut conn_counter: ConnId = 0;

    for neighbor in &config.neighbors {
        let stream = TcpStream::connect((neighbor.host.as_str(), server_port(neighbor.id)))
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "cannot connect to neighbour {} at {}: {}",
                    neighbor.id, neighbor.host, e
                ))
            })?;
        conn_counter += 1;
        let conn = spawn_worker(stream, conn_counter, event_tx.clone());
        debug!("{}: connected to neighbour server {}", config.id, neighbor.id);
        server
            .lock()
            .await
            .server_workers
            .insert(conn.id(), conn);
    }

    let shutdown = Arc::new(Notify::new());
    let task = tokio::spawn(event_loop(
        server.clone(),
        server_listener,
        client_listener,
        event_tx,
        event_rx,
        shutdown.clone(),
        conn_counter,
    ));

    Ok(ServerHandle {
        server,
        shutdown,
        task,
    })
}

/// The readiness loop of a server process: waits for a connection to accept,
/// a framed message or a closed connection, or the shutdown signal. Accept
/// failures are fatal (no further progress is possible); everything at the
/// level of a single connection is recovered locally.
async fn event_loop(
    server: Arc<Mutex<Server>>,
    server_listener: TcpListener,
    client_listener: TcpListener,
    event_tx: mpsc::UnboundedSender<NetEvent>,
    mut event_rx: mpsc::UnboundedReceiver<NetEvent>,
    shutdown: Arc<Notify>,
    mut conn_counter: ConnId,
) {
    let id = server.lock().await.id;
    debug!("{}: thread for receiving messages from the network started", id);
    loop {
        tokio::select! {
            accepted = server_listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    conn_counter += 1;
                    let conn = spawn_worker(stream, conn_counter, event_tx.clone());
                    debug!("{}: accepted server connection from {}", id, addr);
                    server.lock().await.server_workers.insert(conn.id(), conn);
                }
                Err(e) => {
                    error!("{}: fatal failure while accepting a server: {}", id, e);
                    break;
                }
            },
            accepted = client_listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    conn_counter += 1;
                    let conn = spawn_worker(stream, conn_counter, event_tx.clone());
                    debug!("{}: accepted client connection from {}", id, addr);
                    let mut guard = server.lock().await;
                    guard.next_client_number += 1;
                    let identity = client_identity(guard.id, guard.next_client_number);
                    let sender = guard.id;
                    let envelope = guard.envelope(MsgContent::Identity(IdentityMsg {
                        sender,
                        identity,
                    }));
                    if let Err(e) = conn.send(envelope) {
                        warn!("{}: cannot send identity to new client: {}", id, e);
                    }
                    info!("{}: assigned identity {} to a new client", id, identity);
                    guard.client_workers.insert(conn.id(), conn);
                }
                Err(e) => {
                    error!("{}: fatal failure while accepting a client: {}", id, e);
                    break;
                }
            },
            event = event_rx.recv() => match event {
                Some(NetEvent::Message(conn, envelope)) => {
                    if let Err(e) = treat_message(&server, conn, envelope).await {
                        error!("{}: {}", id, e);
                        break;
                    }
                }
                Some(NetEvent::Closed(conn)) => {
                    server.lock().await.remove_worker(conn);
                }
                None => break,
            },
            _ = shutdown.notified() => {
                debug!("{}: event loop interrupted", id);
                break;
            }
        }
    }
    debug!("{}: end of the network event loop", id);
}

/// Routes one framed message: a server-algorithm action is dispatched to the
/// election/mutex layer (recording the reply route of its sender), anything
/// else is client chat traffic to forward under the watermark dedup rule.
async fn treat_message(
    server_arc: &Arc<Mutex<Server>>,
    conn: ConnId,
    envelope: Envelope,
) -> Result<()> {
    let mut server = server_arc.lock().await;
    debug!(
        "{}: message received of type {}, seq. number {}, from connection {}",
        server.id, envelope.action, envelope.seq, conn
    );
    server.current_conn = Some(conn);
    let outcome = route_message(server_arc, &mut server, conn, envelope);
    server.current_conn = None;
    server.changed.notify_waiters();
    outcome
}

fn route_message(
    server_arc: &Arc<Mutex<Server>>,
    server: &mut Server,
    conn: ConnId,
    envelope: Envelope,
) -> Result<()> {
    let from_client = server.client_workers.contains_key(&conn);
    if envelope.is_for_server() {
        if from_client {
            return Err(Error::Protocol(
                "server-algorithm message received from a local client".to_string(),
            ));
        }
        server.server_routes.insert(envelope.content.sender(), conn);
        dispatch(server_arc, server, envelope);
        return Ok(());
    }
    // client chat traffic to forward
    if from_client {
        if envelope.content.kind() != ContentKind::Chat {
            return Err(Error::Protocol(
                "only chat content can be received from a local client".to_string(),
            ));
        }
        server.client_seq_numbers.insert(envelope.sender, envelope.seq);
        server.forward(conn, &envelope);
    } else {
        let recorded = server.client_seq_numbers.get(&envelope.sender).copied();
        match recorded {
            Some(watermark) if envelope.seq <= watermark => {
                debug!(
                    "{}: already forwarded message {} of client {}, dropping",
                    server.id, envelope.seq, envelope.sender
                );
            }
            _ => {
                server.client_seq_numbers.insert(envelope.sender, envelope.seq);
                server.forward(conn, &envelope);
            }
        }
    }
    Ok(())
}
