//! Fixed-size datagram channel. Packets are at most `PACKET_SIZE_BYTES`
//! long; anything malformed is dropped by the receiver, never propagated as
//! a connection error.

use crate::logging;
use crate::net::support::{ErrorType, NetError, NetResult};
use crate::wire::udp::{self, UdpHeader};
use crate::PACKET_SIZE_BYTES;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Receive poll interval for datagram sockets. Shorter than the reliable
/// channel's read timeout so a drained connection releases its tasks (and
/// the listener can accept a new client) well within a second.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct DatagramChannel {
    socket: UdpSocket,
    log: logging::Logger,
}

impl DatagramChannel {
    /// Binds the local end. The read timeout bounds cancellation latency for
    /// the receive task.
    pub fn bind<'a, A: ToSocketAddrs, L: Into<Option<&'a logging::Logger>>>(
        local: A,
        read_timeout: Duration,
        log: L,
    ) -> NetResult<DatagramChannel> {
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(read_timeout))?;

        let log = match log.into() {
            Some(log) => log.new(logging::o!("channel" => "datagram")),
            None => logging::discard(),
        };

        Ok(DatagramChannel { socket, log })
    }

    /// Fixes the remote end; `send` goes there and datagrams from other
    /// sources are filtered by the OS.
    pub fn connect<A: ToSocketAddrs>(&self, remote: A) -> NetResult<()> {
        self.socket.connect(remote)?;
        Ok(())
    }

    /// Sends one datagram. Lengths above the packet size are a programming
    /// error.
    pub fn send(&self, packet: &[u8]) -> NetResult<()> {
        assert!(packet.len() <= PACKET_SIZE_BYTES);

        match self.socket.send(packet) {
            Ok(_) => Ok(()),
            Err(err) => {
                let folded = NetError::from(err);
                if folded == NetError::Wait {
                    logging::trace!(self.log, "datagram send would block");
                }
                Err(folded)
            }
        }
    }

    /// Receives one datagram into `buf`, returning its length. Idle timeouts
    /// surface as `Wait` so the task can poll its cancel token. Works on
    /// unconnected sockets too; the sender address is not part of the
    /// protocol.
    pub fn recv(&self, buf: &mut [u8]) -> NetResult<usize> {
        debug_assert!(buf.len() >= PACKET_SIZE_BYTES);
        let (count, _) = self.socket.recv_from(buf)?;
        Ok(count)
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// Validates one received datagram: header decode, declared size within the
/// budget and within what actually arrived, generation at or above the
/// high-water mark, and a chunk walk terminating exactly at the declared
/// size. Returns the generation and the `size`-bounded payload.
pub fn validate_datagram(
    packet: &[u8],
    last_seen_gen: Option<u64>,
) -> NetResult<(u64, &[u8])> {
    let mut cursor = packet;
    let header = UdpHeader::decode(&mut cursor).map_err(|err| match err {
        NetError::Wait => NetError::Truncated,
        other => other,
    })?;

    let size = header.size as usize;
    if size > udp::MAX_CHUNK_BYTES {
        return Err(NetError::Fatal(ErrorType::SizeOverflow));
    }
    if packet.len() < UdpHeader::SIZE + size {
        return Err(NetError::Truncated);
    }

    if let Some(last_seen) = last_seen_gen {
        if header.packet_gen < last_seen {
            return Err(NetError::Stale);
        }
    }

    let payload = &packet[UdpHeader::SIZE..UdpHeader::SIZE + size];
    udp::validate_chunks(payload)?;

    Ok((header.packet_gen, payload))
}
