//! Client endpoint: four background tasks (rel-rx, rel-tx, udp-rx, ack-tx)
//! plus the frame-facing API the render loop drives. The main thread never
//! blocks on the network; it drains the staging queue once per frame.

pub mod apply;
pub mod exchange;
pub mod geometry;
pub mod udp;

use crate::client::apply::{apply_staged, ApplyStats, RenderSink};
use crate::client::geometry::GeometryStaging;
use crate::config::Config;
use crate::logging;
use crate::net::datagram::{self, DatagramChannel};
use crate::net::reliable::{await_event, Msg, ProtocolEvents, ReliableChannel};
use crate::net::support::{NetError, NetResult};
use crate::scene::Scene;
use crate::state::{ConnectionState, StateCell};
use crate::store::ResourceStore;
use crate::sync::{CancelToken, SignalQueue, StagingQueue};
use crate::wire::tcp::MsgType;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

enum ClientCommand {
    SendExchangeAck,
    SendReady,
    RequestModel(u16),
    Disconnect,
}

pub struct Client {
    pub store: Arc<RwLock<ResourceStore>>,
    pub scene: Arc<RwLock<Scene>>,
    geometry: Arc<Mutex<GeometryStaging>>,
    staging: Arc<StagingQueue>,
    ack_outbox: Arc<SignalQueue<u32>>,
    commands: Arc<SignalQueue<ClientCommand>>,
    state: Arc<StateCell>,
    cancel: CancelToken,
    rel_shutdown: ReliableChannel,
    threads: Vec<thread::JoinHandle<()>>,
    scratch: Mutex<Vec<u8>>,
    log: logging::Logger,
}

impl Client {
    /// Connects to the server and spawns the endpoint tasks. Returns once
    /// the sockets are up; use `wait_streaming` to block until the handshake
    /// and initial resource exchange complete.
    pub fn connect<'a, L: Into<Option<&'a logging::Logger>>>(
        server_ip: IpAddr,
        config: &Config,
        log: L,
    ) -> NetResult<Client> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "client")),
            None => logging::discard(),
        };

        let reliable_addr = SocketAddr::new(server_ip, config.reliable_port);
        let stream = TcpStream::connect_timeout(&reliable_addr, Duration::from_secs(10))?;
        logging::info!(log, "connected"; "server" => %reliable_addr);

        let rel_tx = ReliableChannel::new(stream, config.read_timeout(), &log)?;
        let rel_rx = rel_tx.try_clone()?;
        let rel_shutdown = rel_tx.try_clone()?;

        let udp_down = DatagramChannel::bind(
            ("0.0.0.0", config.downstream_port),
            datagram::POLL_TIMEOUT,
            &log,
        )?;
        let udp_up = DatagramChannel::bind(("0.0.0.0", 0), datagram::POLL_TIMEOUT, &log)?;
        udp_up.connect((server_ip, config.upstream_port))?;

        let mut store = ResourceStore::new(config.arena_bytes, &log);
        store.install_default_textures();

        let store = Arc::new(RwLock::new(store));
        let scene = Arc::new(RwLock::new(Scene::new(&log)));
        let geometry = Arc::new(Mutex::new(GeometryStaging::new(
            config.vertex_staging_bytes,
            config.index_staging_bytes,
            &log,
        )));
        let staging = Arc::new(StagingQueue::new(config.staging_bytes, &log));
        let ack_outbox: Arc<SignalQueue<u32>> = Arc::new(SignalQueue::new());
        let commands: Arc<SignalQueue<ClientCommand>> = Arc::new(SignalQueue::new());
        let events: Arc<ProtocolEvents> = Arc::new(SignalQueue::new());
        let state = Arc::new(StateCell::new(&log));
        let cancel = CancelToken::new();

        state.transition(ConnectionState::Handshaking);

        let mut threads = Vec::new();

        {
            let store = Arc::clone(&store);
            let geometry = Arc::clone(&geometry);
            let state = Arc::clone(&state);
            let commands = Arc::clone(&commands);
            let events = Arc::clone(&events);
            let cancel = cancel.clone();
            let log = log.clone();
            threads.push(thread::spawn(move || {
                let result = rel_rx_task(
                    rel_rx, &store, &geometry, &state, &commands, &events, &cancel, &log,
                );
                if let Err(err) = result {
                    logging::warn!(log, "rel-rx task failed"; "error" => ?err);
                }
                state.transition(ConnectionState::Draining);
            }));
        }

        {
            let state = Arc::clone(&state);
            let commands = Arc::clone(&commands);
            let events = Arc::clone(&events);
            let cancel = cancel.clone();
            let keepalive = config.keepalive();
            let log = log.clone();
            threads.push(thread::spawn(move || {
                let result =
                    rel_tx_task(rel_tx, &state, &events, &commands, keepalive, &cancel, &log);
                if let Err(err) = result {
                    logging::warn!(log, "rel-tx task failed"; "error" => ?err);
                    state.transition(ConnectionState::Draining);
                }
            }));
        }

        {
            let staging = Arc::clone(&staging);
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            let log = log.clone();
            threads.push(thread::spawn(move || {
                if let Err(err) = udp::udp_rx_loop(&udp_down, &staging, &cancel, &log) {
                    logging::warn!(log, "udp-rx task failed"; "error" => ?err);
                    state.transition(ConnectionState::Draining);
                }
            }));
        }

        {
            let ack_outbox = Arc::clone(&ack_outbox);
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            let log = log.clone();
            threads.push(thread::spawn(move || {
                if let Err(err) = udp::ack_tx_loop(&udp_up, &ack_outbox, &cancel, &log) {
                    logging::warn!(log, "ack-tx task failed"; "error" => ?err);
                    state.transition(ConnectionState::Draining);
                }
            }));
        }

        Ok(Client {
            store,
            scene,
            geometry,
            staging,
            ack_outbox,
            commands,
            state,
            cancel,
            rel_shutdown,
            threads,
            scratch: Mutex::new(Vec::new()),
            log,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// True until the connection starts draining.
    pub fn is_connected(&self) -> bool {
        !self.state.is_draining()
    }

    /// Blocks until streaming starts (handshake + initial exchange done).
    pub fn wait_streaming(&self, timeout: Duration) -> bool {
        self.state.wait_for(ConnectionState::Streaming, timeout)
    }

    /// One main-thread pump: drain the staging queue and apply everything,
    /// notifying the sink and queueing ACKs. Never blocks on the network.
    pub fn frame(&self, sink: &dyn RenderSink) -> ApplyStats {
        if self.staging.is_empty() {
            return ApplyStats::default();
        }

        let mut scratch = self.scratch.lock().expect("scratch poisoned");
        self.staging.drain_into(&mut scratch);

        let mut geometry = self.geometry.lock().expect("geometry staging poisoned");
        apply_staged(
            &scratch,
            &mut geometry,
            &self.store,
            &self.scene,
            sink,
            &self.ack_outbox,
            &self.log,
        )
    }

    /// Current bytes of a model's vertex staging region.
    pub fn model_vertex_bytes(&self, model_id: crate::hashing::StringId) -> Option<Vec<u8>> {
        let geometry = self.geometry.lock().expect("geometry staging poisoned");
        geometry.model_vertex_bytes(model_id).map(<[u8]>::to_vec)
    }

    pub fn model_index_bytes(&self, model_id: crate::hashing::StringId) -> Option<Vec<u8>> {
        let geometry = self.geometry.lock().expect("geometry staging poisoned");
        geometry.model_index_bytes(model_id).map(<[u8]>::to_vec)
    }

    /// Asks the server to (re-)deliver a model by catalogue index.
    pub fn request_model(&self, index: u16) {
        self.commands.push(ClientCommand::RequestModel(index));
    }

    /// Clean shutdown: notify the server, cancel the tasks, join them.
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        logging::info!(self.log, "shutting down client");

        self.commands.push(ClientCommand::Disconnect);
        thread::sleep(Duration::from_millis(100));

        self.state.transition(ConnectionState::Draining);
        self.cancel.cancel();
        self.commands.notify_all();
        self.ack_outbox.notify_all();
        self.rel_shutdown.shutdown();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        self.state.transition(ConnectionState::Closed);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

/// The reliable receive task. Owns the read half of the stream: resource
/// payloads are drained here, everything response-like is forwarded as a
/// command to the send task.
fn rel_rx_task(
    mut channel: ReliableChannel,
    store: &RwLock<ResourceStore>,
    geometry: &Mutex<GeometryStaging>,
    state: &StateCell,
    commands: &SignalQueue<ClientCommand>,
    events: &ProtocolEvents,
    cancel: &CancelToken,
    log: &logging::Logger,
) -> NetResult<()> {
    // The first exchange ends with the READY handshake; later re-exchanges
    // return straight to streaming.
    let mut first_exchange_done = false;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match channel.recv() {
            Ok(Msg::HeloAck) => events.push(Msg::HeloAck),
            Ok(Msg::StartRsrcExchange) => {
                state.transition(ConnectionState::ResourceExchange);
                commands.push(ClientCommand::SendExchangeAck);
            }
            Ok(Msg::Resource(kind)) => {
                exchange::receive_resource(&mut channel, kind, store, geometry, log)?;
                commands.push(ClientCommand::SendExchangeAck);
            }
            Ok(Msg::EndRsrcExchange) => {
                if first_exchange_done {
                    state.transition(ConnectionState::Streaming);
                } else {
                    commands.push(ClientCommand::SendReady);
                    first_exchange_done = true;
                }
            }
            Ok(Msg::Ready) => {
                state.transition(ConnectionState::Streaming);
                logging::info!(log, "streaming started");
            }
            Ok(Msg::StartStreaming) => {
                logging::debug!(log, "server started datagram stream");
            }
            Ok(Msg::EndStreaming) => {
                logging::info!(log, "server stopped datagram stream");
            }
            Ok(Msg::Disconnect) => {
                logging::info!(log, "server disconnected");
                state.transition(ConnectionState::Draining);
                return Ok(());
            }
            Ok(other) => {
                logging::warn!(log, "ignoring unexpected message"; "message" => ?other);
            }
            Err(NetError::Wait) => continue,
            Err(err) => {
                state.transition(ConnectionState::Draining);
                return Err(err);
            }
        }
    }
}

/// The reliable send task: opens with HELO, then drains commands and keeps
/// the connection alive while streaming.
fn rel_tx_task(
    mut channel: ReliableChannel,
    state: &StateCell,
    events: &ProtocolEvents,
    commands: &SignalQueue<ClientCommand>,
    keepalive: Duration,
    cancel: &CancelToken,
    log: &logging::Logger,
) -> NetResult<()> {
    channel.send(MsgType::Helo)?;
    await_event(events, Msg::HeloAck, cancel, Duration::from_secs(10), log)?;
    logging::debug!(log, "handshake acknowledged");

    let mut last_keepalive = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        commands.wait(Duration::from_millis(200));
        for command in commands.drain() {
            match command {
                ClientCommand::SendExchangeAck => channel.send(MsgType::RsrcExchangeAck)?,
                ClientCommand::SendReady => channel.send(MsgType::Ready)?,
                ClientCommand::RequestModel(index) => {
                    channel.send_with(MsgType::ReqModel, &index.to_le_bytes())?
                }
                ClientCommand::Disconnect => {
                    let _ = channel.send(MsgType::Disconnect);
                    return Ok(());
                }
            }
        }

        if state.get() == ConnectionState::Streaming && last_keepalive.elapsed() >= keepalive {
            channel.send(MsgType::Keepalive)?;
            last_keepalive = Instant::now();
            logging::trace!(log, "keepalive sent");
        }
    }
}
