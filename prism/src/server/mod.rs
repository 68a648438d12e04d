//! Server endpoint: the world the application stage mutates, the
//! per-connection task supervisor, and the accept loop.
//!
//! Each accepted connection runs four tasks (rel-rx, rel-tx, udp-tx, udp-rx)
//! plus the application stage, all honouring one cancel token. The reliable
//! stream has a single reader (rel-rx) and a single writer (rel-tx);
//! request/response steps are sequenced through a protocol-event queue.

pub mod exchange;
pub mod packer;
pub mod pipeline;

use crate::config::Config;
use crate::hashing::StringId;
use crate::logging;
use crate::net::datagram::{self, DatagramChannel};
use crate::net::limiter::TokenBucket;
use crate::net::reliable::{await_event, Msg, ProtocolEvents, ReliableChannel};
use crate::net::support::{ErrorUtils, NetError, NetResult};
use crate::scene::{NodeType, Scene};
use crate::state::{ConnectionState, StateCell};
use crate::store::{Material, ResourceStore};
use crate::sync::{CancelToken, SignalQueue};
use crate::transform::Transform;
use crate::updates::{QueuedUpdate, UpdateQueues};
use crate::wire::tcp::{MeshInfo, MsgType, PointLightInfo, ShaderStage, TextureFormat};
use self::exchange::{run_exchange, ExchangeBatch, ExchangeCtx};
use indexmap::IndexSet;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// The authoritative scene and resources, plus the queues connecting the
/// application stage to the streaming tasks.
pub struct World {
    pub store: RwLock<ResourceStore>,
    pub scene: RwLock<Scene>,
    pub updates: UpdateQueues,
    /// Models in registration order; `REQ_MODEL` indexes into this.
    catalogue: Mutex<Vec<StringId>>,
    /// Models registered since the last exchange, awaiting delivery to the
    /// connected client.
    pending: Mutex<Vec<StringId>>,
    log: logging::Logger,
}

impl World {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(arena_capacity: usize, log: L) -> World {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "world")),
            None => logging::discard(),
        };

        World {
            store: RwLock::new(ResourceStore::new(arena_capacity, &log)),
            scene: RwLock::new(Scene::new(&log)),
            updates: UpdateQueues::new(),
            catalogue: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            log,
        }
    }

    pub fn register_texture(&self, id: StringId, format: TextureFormat, data: &[u8]) -> bool {
        self.store
            .write()
            .expect("store lock poisoned")
            .insert_texture(id, format, data)
    }

    pub fn register_material(&self, id: StringId, material: Material) -> bool {
        self.store
            .write()
            .expect("store lock poisoned")
            .insert_material(id, material)
    }

    pub fn register_shader(
        &self,
        id: StringId,
        stage: ShaderStage,
        pass_number: u8,
        code: &[u8],
    ) -> bool {
        self.store
            .write()
            .expect("store lock poisoned")
            .insert_shader(id, stage, pass_number, code)
    }

    pub fn register_point_light(&self, light: PointLightInfo) -> bool {
        self.store
            .write()
            .expect("store lock poisoned")
            .insert_point_light(light)
    }

    /// Registers a model and its geometry, entering it into the catalogue.
    pub fn register_model(
        &self,
        id: StringId,
        materials: Vec<StringId>,
        meshes: Vec<MeshInfo>,
        vertex_bytes: &[u8],
        index_bytes: &[u8],
    ) -> bool {
        let inserted = self
            .store
            .write()
            .expect("store lock poisoned")
            .insert_model(id, materials, meshes, vertex_bytes, index_bytes);

        if inserted {
            self.catalogue
                .lock()
                .expect("catalogue lock poisoned")
                .push(id);
            // A model acquired mid-session is delivered by the next
            // exchange; before any connection exists, the initial exchange
            // covers the whole catalogue and this entry is discarded.
            self.pending.lock().expect("pending lock poisoned").push(id);
        }

        inserted
    }

    /// Drains the models awaiting mid-session delivery.
    pub fn take_pending_models(&self) -> Vec<StringId> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .drain(..)
            .collect()
    }

    pub fn catalogue(&self) -> Vec<StringId> {
        self.catalogue
            .lock()
            .expect("catalogue lock poisoned")
            .clone()
    }

    pub fn model_by_index(&self, index: u16) -> Option<StringId> {
        self.catalogue
            .lock()
            .expect("catalogue lock poisoned")
            .get(index as usize)
            .copied()
    }

    /// Puts a model into the scene and seeds its full geometry into the
    /// persistent queue. Re-admitting an existing model re-seeds it, which
    /// is how `REQ_MODEL` forces a re-stream.
    pub fn admit_model(&self, id: StringId, flags: u8) {
        let (n_vertices, n_indices) = {
            let store = self.store.read().expect("store lock poisoned");
            match store.model(id) {
                Some(model) => (model.n_vertices, model.n_indices),
                None => {
                    logging::warn!(self.log, "cannot admit unknown model"; "id" => id);
                    return;
                }
            }
        };

        let emit_transform = {
            let mut scene = self.scene.write().expect("scene lock poisoned");
            let root = scene.root_id();
            scene.add_node_with_parent(id, NodeType::Model, Transform::default(), root, flags);
            !scene.get(id).map(|node| node.is_static()).unwrap_or(true)
        };

        for update in exchange::seed_geometry(id, n_vertices, n_indices) {
            self.updates.push_persistent(update);
        }
        if emit_transform {
            self.updates.push_transitory(QueuedUpdate::Transform(id));
        }

        logging::info!(self.log, "model admitted";
                       "id" => id, "vertices" => n_vertices, "indices" => n_indices);
    }

    /// Moves a node, queueing a transform update unless the node is static.
    pub fn set_transform(&self, id: StringId, transform: Transform) {
        let emit = {
            let mut scene = self.scene.write().expect("scene lock poisoned");
            scene.set_transform(id, transform)
        };

        if emit {
            self.updates.push_transitory(QueuedUpdate::Transform(id));
        }
    }

    /// Changes a light's colour and intensity, queueing its update.
    pub fn set_light(&self, id: StringId, color: [f32; 3], intensity: f32) {
        let found = {
            let mut store = self.store.write().expect("store lock poisoned");
            match store.light_mut(id) {
                Some(light) => {
                    light.color = color;
                    light.intensity = intensity;
                    true
                }
                None => false,
            }
        };

        if found {
            self.updates.push_transitory(QueuedUpdate::PointLight(id));
        } else {
            logging::warn!(self.log, "cannot update unknown light"; "id" => id);
        }
    }
}

/// Per-connection application hook producing updates.
pub trait Stage: Send {
    fn tick(&mut self, world: &World);

    fn interval(&self) -> Duration {
        Duration::from_millis(33)
    }
}

enum Command {
    Exchange(ExchangeBatch),
    Shutdown,
}

/// Accept loop. Connections are served one at a time; after a connection
/// drains the listener immediately accepts the next client.
pub fn serve(
    world: &World,
    config: &Config,
    make_stage: &mut dyn FnMut() -> Box<dyn Stage>,
    cancel: &CancelToken,
    log: &logging::Logger,
) -> NetResult<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.reliable_port))?;
    listener.set_nonblocking(true)?;

    logging::info!(log, "listening for clients"; "port" => config.reliable_port);

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                // The listener is non-blocking for cancellation; accepted
                // streams must not inherit that.
                if let Err(err) = stream.set_nonblocking(false) {
                    logging::error!(log, "failed to configure accepted stream"; "error" => %err);
                    continue;
                }
                logging::info!(log, "accepted connection"; "peer" => %peer);
                let mut stage = make_stage();
                run_connection(stream, peer, world, config, stage.as_mut(), cancel, log);
                logging::info!(log, "connection closed"; "peer" => %peer);
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                cancel.wait(Duration::from_millis(100));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Runs one connection to completion: spawns the four endpoint tasks and the
/// application stage, waits for Draining, then cancels and joins everything.
fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    world: &World,
    config: &Config,
    stage: &mut dyn Stage,
    outer_cancel: &CancelToken,
    log: &logging::Logger,
) {
    let log = log.new(logging::o!("peer" => peer.to_string()));

    // Queues may hold leftovers from a previous connection's session, and
    // everything registered so far goes out with the initial exchange.
    world.updates.clear();
    let _ = world.take_pending_models();

    let state = StateCell::new(&log);
    let cancel = CancelToken::new();
    let events = ProtocolEvents::new();
    let commands: SignalQueue<Command> = SignalQueue::new();
    let ack_inbox: SignalQueue<u32> = SignalQueue::new();
    let last_seen = Mutex::new(Instant::now());
    let limiter = TokenBucket::new(&config.limiter, &log);

    let rel_tx = match ReliableChannel::new(stream, config.read_timeout(), &log) {
        Ok(channel) => channel,
        Err(err) => {
            logging::error!(log, "failed to set up reliable channel"; "error" => ?err);
            return;
        }
    };
    let rel_rx = match rel_tx.try_clone() {
        Ok(channel) => channel,
        Err(err) => {
            logging::error!(log, "failed to clone reliable stream"; "error" => ?err);
            return;
        }
    };
    let rel_shutdown = match rel_tx.try_clone() {
        Ok(channel) => channel,
        Err(err) => {
            logging::error!(log, "failed to clone reliable stream"; "error" => ?err);
            return;
        }
    };

    let udp_down = match DatagramChannel::bind(("0.0.0.0", 0), datagram::POLL_TIMEOUT, &log)
        .and_then(|channel| {
            channel.connect((peer.ip(), config.downstream_port))?;
            Ok(channel)
        }) {
        Ok(channel) => channel,
        Err(err) => {
            logging::error!(log, "failed to open downstream datagram socket"; "error" => ?err);
            return;
        }
    };
    let udp_up = match DatagramChannel::bind(
        ("0.0.0.0", config.upstream_port),
        datagram::POLL_TIMEOUT,
        &log,
    ) {
        Ok(channel) => channel,
        Err(err) => {
            logging::error!(log, "failed to open upstream datagram socket"; "error" => ?err);
            return;
        }
    };

    state.transition(ConnectionState::Handshaking);

    thread::scope(|scope| {
        scope.spawn(|| {
            let result = rel_rx_task(
                rel_rx, world, &state, &events, &commands, &last_seen, config, &cancel, &log,
            );
            if result.has_failed() {
                logging::warn!(log, "rel-rx task failed"; "error" => ?result);
            }
            state.transition(ConnectionState::Draining);
        });

        scope.spawn(|| {
            let result = rel_tx_task(
                rel_tx, world, &state, &events, &commands, config, &cancel, &log,
            );
            if result.has_failed() {
                logging::warn!(log, "rel-tx task failed"; "error" => ?result);
                state.transition(ConnectionState::Draining);
            }
        });

        scope.spawn(|| {
            let result = pipeline::udp_tx_loop(
                world, &udp_down, &limiter, &ack_inbox, &state, &cancel, &log,
            );
            if result.has_failed() {
                logging::warn!(log, "udp-tx task failed"; "error" => ?result);
                state.transition(ConnectionState::Draining);
            }
        });

        scope.spawn(|| {
            let result = pipeline::udp_rx_loop(&udp_up, &ack_inbox, &cancel, &log);
            if result.has_failed() {
                logging::warn!(log, "udp-rx task failed"; "error" => ?result);
                state.transition(ConnectionState::Draining);
            }
        });

        scope.spawn(|| {
            while !cancel.wait(stage.interval()) {
                if state.get() == ConnectionState::Streaming {
                    stage.tick(world);
                }
            }
        });

        // Supervisor: wait for Draining, then cancel and unblock everyone.
        loop {
            if outer_cancel.is_cancelled() {
                commands.push(Command::Shutdown);
                // Give rel-tx a moment to send the disconnect notice.
                cancel.wait(Duration::from_millis(200));
                state.transition(ConnectionState::Draining);
            }

            if state.is_draining() {
                break;
            }

            cancel.wait(Duration::from_millis(50));
        }

        // Grace period for rel-tx to flush any disconnect notice.
        thread::sleep(Duration::from_millis(100));

        cancel.cancel();
        world.updates.notify_all();
        events.notify_all();
        commands.notify_all();
        rel_shutdown.shutdown();
    });

    state.transition(ConnectionState::Closed);
}

/// The reliable receive task. Forwards protocol events to the sender task,
/// tracks client liveness and watches the keepalive deadline.
fn rel_rx_task(
    mut channel: ReliableChannel,
    world: &World,
    state: &StateCell,
    events: &ProtocolEvents,
    commands: &SignalQueue<Command>,
    last_seen: &Mutex<Instant>,
    config: &Config,
    cancel: &CancelToken,
    log: &logging::Logger,
) -> NetResult<()> {
    let deadline = config.keepalive_deadline();

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        if state.get() == ConnectionState::Streaming {
            let elapsed = last_seen.lock().expect("liveness lock poisoned").elapsed();
            if elapsed > deadline {
                logging::warn!(log, "keepalive timeout, draining connection";
                               "elapsed_secs" => elapsed.as_secs());
                state.transition(ConnectionState::Draining);
                return Ok(());
            }
        }

        match channel.recv() {
            Ok(msg) => {
                *last_seen.lock().expect("liveness lock poisoned") = Instant::now();

                match msg {
                    Msg::Keepalive => {
                        logging::trace!(log, "keepalive received");
                    }
                    Msg::Disconnect => {
                        logging::info!(log, "client disconnected");
                        state.transition(ConnectionState::Draining);
                        return Ok(());
                    }
                    Msg::ReqModel(index) => match world.model_by_index(index) {
                        Some(id) => {
                            logging::info!(log, "model requested"; "index" => index, "id" => id);
                            commands.push(Command::Exchange(ExchangeBatch {
                                models: vec![id],
                                include_lights: false,
                                include_shaders: false,
                            }));
                        }
                        None => {
                            logging::warn!(log, "requested model index out of range";
                                           "index" => index);
                        }
                    },
                    other => events.push(other),
                }
            }
            Err(NetError::Wait) => continue,
            Err(err) => {
                // Let the send task issue a disconnect notice while the
                // stream may still carry it.
                commands.push(Command::Shutdown);
                state.transition(ConnectionState::Draining);
                return Err(err);
            }
        }
    }
}

/// The reliable send task: drives the handshake, the initial resource
/// exchange, and any mid-session exchange commands.
fn rel_tx_task(
    mut channel: ReliableChannel,
    world: &World,
    state: &StateCell,
    events: &ProtocolEvents,
    commands: &SignalQueue<Command>,
    config: &Config,
    cancel: &CancelToken,
    log: &logging::Logger,
) -> NetResult<()> {
    let handshake_timeout = Duration::from_secs(10);
    let ack_timeout = config.read_timeout() * 4;
    let mut sent: IndexSet<StringId> = IndexSet::new();

    await_event(events, Msg::Helo, cancel, handshake_timeout, log)?;
    channel.send(MsgType::HeloAck)?;
    state.transition(ConnectionState::ResourceExchange);

    let initial = ExchangeBatch {
        models: world.catalogue(),
        include_lights: true,
        include_shaders: true,
    };
    {
        let mut ctx = ExchangeCtx {
            events,
            cancel,
            ack_timeout,
            sent: &mut sent,
            log,
        };
        run_exchange(&mut channel, &world.store, &initial, &mut ctx)?;
    }
    for &model_id in &initial.models {
        world.admit_model(model_id, 0);
    }

    await_event(events, Msg::Ready, cancel, handshake_timeout, log)?;
    channel.send(MsgType::Ready)?;
    channel.send(MsgType::StartStreaming)?;
    state.transition(ConnectionState::Streaming);
    logging::info!(log, "streaming started");

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        commands.wait(Duration::from_millis(200));
        for command in commands.drain() {
            match command {
                Command::Exchange(batch) => {
                    mid_session_exchange(
                        &mut channel, world, state, events, &batch, ack_timeout, cancel, log,
                        &mut sent,
                    )?;
                }
                Command::Shutdown => {
                    let _ = channel.send(MsgType::EndStreaming);
                    let _ = channel.send(MsgType::Disconnect);
                    return Ok(());
                }
            }
        }

        // Models the application stage registered since the last pass are
        // delivered without waiting for a client request.
        let pending = world.take_pending_models();
        if !pending.is_empty() {
            let batch = ExchangeBatch {
                models: pending,
                include_lights: true,
                include_shaders: true,
            };
            mid_session_exchange(
                &mut channel, world, state, events, &batch, ack_timeout, cancel, log,
                &mut sent,
            )?;
        }
    }
}

/// Re-enters the exchange sub-protocol from Streaming for one batch, then
/// resumes streaming and seeds the delivered models.
fn mid_session_exchange(
    channel: &mut ReliableChannel,
    world: &World,
    state: &StateCell,
    events: &ProtocolEvents,
    batch: &ExchangeBatch,
    ack_timeout: Duration,
    cancel: &CancelToken,
    log: &logging::Logger,
    sent: &mut IndexSet<StringId>,
) -> NetResult<()> {
    state.transition(ConnectionState::ResourceExchange);

    let mut ctx = ExchangeCtx {
        events,
        cancel,
        ack_timeout,
        sent,
        log,
    };
    run_exchange(channel, &world.store, batch, &mut ctx)?;

    for &model_id in &batch.models {
        world.admit_model(model_id, 0);
    }
    state.transition(ConnectionState::Streaming);

    Ok(())
}
