//! The server's datagram tasks: udp-tx packs and sends queued updates under
//! the rate limiter; udp-rx drains client ACK packets into the shared inbox.

use crate::logging;
use crate::net::datagram::DatagramChannel;
use crate::net::limiter::TokenBucket;
use crate::net::support::{NetError, NetResult};
use crate::server::packer::DatagramPacker;
use crate::server::World;
use crate::state::{ConnectionState, StateCell};
use crate::sync::{CancelToken, SignalQueue};
use crate::updates::QueuedUpdate;
use crate::wire::udp::AckPacket;
use crate::PACKET_SIZE_BYTES;
use std::time::{Duration, Instant};

/// One pack cycle: snapshot the transitory queue, retire ACKed persistent
/// entries, then serialize everything into as few datagrams as possible,
/// flushing through `send` whenever the current one fills up. Returns the
/// number of datagrams flushed.
pub fn run_cycle(
    world: &World,
    ack_inbox: &SignalQueue<u32>,
    packet_gen: u64,
    send: &mut dyn FnMut(&[u8; PACKET_SIZE_BYTES]) -> NetResult<()>,
    log: &logging::Logger,
) -> NetResult<usize> {
    let transitory = world.updates.take_transitory();

    let acks = ack_inbox.drain();
    if !acks.is_empty() {
        let retired = world.updates.retire(&acks);
        logging::debug!(log, "retired acked updates";
                        "acks" => acks.len(), "retired" => retired);
    }

    let persistent = world.updates.persistent_snapshot();

    let mut packer = DatagramPacker::new(packet_gen);
    let mut flushed = 0;

    let all_updates = transitory
        .into_iter()
        .chain(persistent.into_iter().map(QueuedUpdate::Geom));

    for update in all_updates {
        loop {
            // The store/scene read locks are held per chunk, so the
            // application stage can interleave edits mid-cycle.
            let packed = {
                let store = world.store.read().expect("store lock poisoned");
                let scene = world.scene.read().expect("scene lock poisoned");
                packer.add_update(&update, &store, &scene)
            };

            match packed {
                Ok(true) => break,
                Ok(false) => {
                    send(packer.finish())?;
                    flushed += 1;
                    packer.reset(packet_gen);
                    // Retry the same update in the fresh datagram.
                }
                Err(NetError::ResourceMissing(id)) => {
                    logging::warn!(log, "dropping update for unknown resource"; "id" => id);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
    }

    if packer.has_chunks() {
        send(packer.finish())?;
        flushed += 1;
    }

    Ok(flushed)
}

/// The udp-tx task. Waits for pending updates, packs them, pays the token
/// bucket per datagram and bumps the packet generation after every cycle.
/// Pacing between pack cycles; unacknowledged persistent updates are resent
/// once per cycle, not at socket speed.
const CYCLE_INTERVAL: Duration = Duration::from_millis(10);

pub fn udp_tx_loop(
    world: &World,
    channel: &DatagramChannel,
    limiter: &TokenBucket,
    ack_inbox: &SignalQueue<u32>,
    state: &StateCell,
    cancel: &CancelToken,
    log: &logging::Logger,
) -> NetResult<()> {
    let mut packet_gen: u64 = 0;
    let mut bytes_sent = 0usize;
    let mut report_mark = Instant::now();

    while !cancel.is_cancelled() {
        // Streaming is paused for the duration of a resource exchange.
        if state.get() != ConnectionState::Streaming {
            if cancel.wait(Duration::from_millis(50)) {
                break;
            }
            continue;
        }

        if world.updates.is_empty() {
            world.updates.wait_pending(Duration::from_millis(500));
            continue;
        }

        let mut cycle_bytes = 0usize;
        let mut send = |packet: &[u8; PACKET_SIZE_BYTES]| -> NetResult<()> {
            // A denied request means waiting for the next refill tick; the
            // datagram is left untouched so ordering is preserved.
            while !limiter.request(PACKET_SIZE_BYTES) {
                limiter.wait_tick();
                if cancel.is_cancelled() {
                    return Err(NetError::Wait);
                }
            }

            channel.send(&packet[..])?;
            cycle_bytes += PACKET_SIZE_BYTES;
            Ok(())
        };

        match run_cycle(world, ack_inbox, packet_gen, &mut send, log) {
            Ok(_) => {}
            // Cancelled mid-cycle while rate limited; the loop condition
            // exits.
            Err(NetError::Wait) => continue,
            Err(err) => return Err(err),
        }

        bytes_sent += cycle_bytes;
        packet_gen += 1;

        let now = Instant::now();
        if now.duration_since(report_mark) >= Duration::from_secs(1) {
            logging::debug!(log, "datagram throughput"; "bytes_per_second" => bytes_sent);
            bytes_sent = 0;
            report_mark = now;
        }

        if cancel.wait(CYCLE_INTERVAL) {
            break;
        }
    }

    logging::debug!(log, "udp-tx task exiting"; "last_packet_gen" => packet_gen);
    Ok(())
}

/// The udp-rx task: receives ACK packets and feeds the inbox. Bogus packets
/// are dropped with a warning; only socket failures are fatal.
pub fn udp_rx_loop(
    channel: &DatagramChannel,
    ack_inbox: &SignalQueue<u32>,
    cancel: &CancelToken,
    log: &logging::Logger,
) -> NetResult<()> {
    let mut buf = [0u8; PACKET_SIZE_BYTES];

    while !cancel.is_cancelled() {
        let count = match channel.recv(&mut buf) {
            Ok(count) => count,
            Err(NetError::Wait) => continue,
            Err(err) => return Err(err),
        };

        let mut cursor = &buf[..count];
        match AckPacket::decode(&mut cursor) {
            Ok(packet) => {
                logging::trace!(log, "received acks"; "count" => packet.acks.len());
                ack_inbox.extend(packet.acks);
            }
            Err(err) => {
                logging::warn!(log, "dropping bogus ack packet";
                               "bytes" => count, "error" => ?err);
            }
        }
    }

    logging::debug!(log, "udp-rx task exiting");
    Ok(())
}
