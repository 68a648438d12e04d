//! Framed reliable channel. Every message is `[1-byte type][payload]`; the
//! payload length is implied by the type, and resource messages stream a
//! variable trailer that must be fully drained before the next type byte.

use crate::logging;
use crate::net::support::{ErrorType, NetError, NetResult};
use crate::sync::{CancelToken, SignalQueue};
use crate::wire::tcp::MsgType;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

/// A reliable message with its fixed payload decoded. Resource messages hand
/// back only the type; the exchange layer drains the info struct and bulk
/// bytes through `read_payload`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Msg {
    Helo,
    HeloAck,
    Ready,
    Keepalive,
    Disconnect,
    StartRsrcExchange,
    RsrcExchangeAck,
    EndRsrcExchange,
    StartStreaming,
    EndStreaming,
    ReqModel(u16),
    Resource(MsgType),
}

/// Events a receive task forwards to whichever task drives a protocol
/// sequence (handshake steps, per-resource ACKs).
pub type ProtocolEvents = SignalQueue<Msg>;

/// Waits for a specific protocol event from the receive task. Unexpected
/// events are logged and discarded; the deadline and cancel token bound the
/// wait.
pub fn await_event(
    events: &ProtocolEvents,
    target: Msg,
    cancel: &CancelToken,
    timeout: Duration,
    log: &logging::Logger,
) -> NetResult<()> {
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(NetError::Fatal(ErrorType::Disconnected));
        }

        for event in events.drain() {
            if event == target {
                return Ok(());
            }
            logging::warn!(log, "discarding unexpected protocol event";
                           "expected" => ?target, "received" => ?event);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(NetError::Fatal(ErrorType::Timeout));
        }

        events.wait((deadline - now).min(Duration::from_millis(100)));
    }
}

pub struct ReliableChannel {
    stream: TcpStream,
    log: logging::Logger,
}

impl ReliableChannel {
    /// Wraps a connected stream. The read timeout bounds how long any task
    /// blocks in `recv`, which is what keeps cancellation responsive.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        stream: TcpStream,
        read_timeout: Duration,
        log: L,
    ) -> NetResult<ReliableChannel> {
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;

        let log = match log.into() {
            Some(log) => log.new(logging::o!("channel" => "reliable")),
            None => logging::discard(),
        };

        Ok(ReliableChannel { stream, log })
    }

    /// Clones the underlying stream so one task can receive while another
    /// sends.
    pub fn try_clone(&self) -> NetResult<ReliableChannel> {
        Ok(ReliableChannel {
            stream: self.stream.try_clone()?,
            log: self.log.clone(),
        })
    }

    /// Sends a header-only message.
    pub fn send(&mut self, msg: MsgType) -> NetResult<()> {
        logging::trace!(self.log, "sending message"; "type" => ?msg);
        self.stream.write_all(&[msg as u8])?;
        Ok(())
    }

    /// Sends a message followed by its payload in one write.
    pub fn send_with(&mut self, msg: MsgType, payload: &[u8]) -> NetResult<()> {
        logging::trace!(self.log, "sending message"; "type" => ?msg, "payload_len" => payload.len());

        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(msg as u8);
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Sends raw trailer bytes continuing a resource transfer.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> NetResult<()> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Receives the next message. Returns `Wait` if the channel stays idle
    /// through one read timeout, `Disconnected` on EOF, and
    /// `UnknownMessage` for a type byte of zero or outside the known range.
    pub fn recv(&mut self) -> NetResult<Msg> {
        let mut type_byte = [0u8; 1];
        let count = self.stream.read(&mut type_byte)?;
        if count == 0 {
            return Err(NetError::Fatal(ErrorType::Disconnected));
        }

        let msg_type = MsgType::from_byte(type_byte[0])
            .ok_or(NetError::Fatal(ErrorType::UnknownMessage))?;

        logging::trace!(self.log, "received message"; "type" => ?msg_type);

        match msg_type {
            MsgType::Helo => Ok(Msg::Helo),
            MsgType::HeloAck => Ok(Msg::HeloAck),
            MsgType::Ready => Ok(Msg::Ready),
            MsgType::Keepalive => Ok(Msg::Keepalive),
            MsgType::Disconnect => Ok(Msg::Disconnect),
            MsgType::StartRsrcExchange => Ok(Msg::StartRsrcExchange),
            MsgType::RsrcExchangeAck => Ok(Msg::RsrcExchangeAck),
            MsgType::EndRsrcExchange => Ok(Msg::EndRsrcExchange),
            MsgType::StartStreaming => Ok(Msg::StartStreaming),
            MsgType::EndStreaming => Ok(Msg::EndStreaming),
            MsgType::ReqModel => {
                let mut payload = [0u8; 2];
                self.read_payload(&mut payload)?;
                Ok(Msg::ReqModel((&payload[..]).read_u16::<LittleEndian>()?))
            }
            resource => Ok(Msg::Resource(resource)),
        }
    }

    /// Receives, requiring a specific message; anything else is fatal.
    pub fn expect(&mut self, expected: Msg) -> NetResult<()> {
        loop {
            match self.recv() {
                Ok(msg) if msg == expected => return Ok(()),
                Ok(Msg::Disconnect) => return Err(NetError::Fatal(ErrorType::Disconnected)),
                Ok(msg) => {
                    logging::warn!(self.log, "unexpected message";
                                   "expected" => ?expected,
                                   "received" => ?msg);
                    return Err(NetError::Fatal(ErrorType::UnexpectedMessage));
                }
                // Idle timeout: keep waiting, the caller bounds the handshake.
                Err(NetError::Wait) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Reads exactly `buf.len()` payload bytes. Once a message has started,
    /// stalling through the read timeout is a protocol failure, not idleness.
    pub fn read_payload(&mut self, buf: &mut [u8]) -> NetResult<()> {
        self.stream.read_exact(buf).map_err(|err| {
            match NetError::from(err) {
                NetError::Wait => NetError::Fatal(ErrorType::Timeout),
                other => other,
            }
        })
    }

    /// Shuts both directions down; any blocked peer read observes EOF.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }
}
