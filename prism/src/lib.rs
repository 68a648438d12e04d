//! Prism streams a 3D scene from an authoritative server to a rendering
//! client: bulk resources and control travel on a reliable stream channel,
//! high-frequency incremental updates on a fixed-size datagram channel.

/// Size of every datagram on the unordered channel, padding included.
pub const PACKET_SIZE_BYTES: usize = 512;

pub const DEFAULT_RELIABLE_PORT: u16 = 1236;
/// Server -> client datagrams.
pub const DEFAULT_DOWNSTREAM_PORT: u16 = 1234;
/// Client -> server datagrams (ACKs).
pub const DEFAULT_UPSTREAM_PORT: u16 = 1235;

pub mod arena;
pub mod client;
pub mod config;
pub mod hashing;
pub mod logging;
pub mod net;
pub mod scene;
pub mod server;
pub mod state;
pub mod store;
pub mod sync;
pub mod transform;
pub mod updates;
pub mod wire;
