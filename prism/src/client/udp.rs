//! The client's datagram tasks: udp-rx validates incoming datagrams and
//! hands their payloads to the staging queue; udp-tx batches pending ACK
//! serials into ACK packets.

use crate::logging;
use crate::net::datagram::{validate_datagram, DatagramChannel};
use crate::net::support::{NetError, NetResult};
use crate::sync::{CancelToken, SignalQueue, StagingQueue};
use crate::wire::udp::AckPacket;
use crate::PACKET_SIZE_BYTES;
use std::time::Duration;

/// The udp-rx task. Anything malformed, truncated or stale is dropped here;
/// only socket failures are fatal. The generation high-water mark never
/// decreases.
pub fn udp_rx_loop(
    channel: &DatagramChannel,
    staging: &StagingQueue,
    cancel: &CancelToken,
    log: &logging::Logger,
) -> NetResult<()> {
    let mut buf = [0u8; PACKET_SIZE_BYTES];
    let mut last_seen_gen: Option<u64> = None;
    let mut dropped = 0usize;

    while !cancel.is_cancelled() {
        let count = match channel.recv(&mut buf) {
            Ok(count) => count,
            Err(NetError::Wait) => continue,
            Err(err) => return Err(err),
        };

        match validate_datagram(&buf[..count], last_seen_gen) {
            Ok((packet_gen, payload)) => {
                last_seen_gen = Some(packet_gen);
                if !staging.append(packet_gen, payload) {
                    dropped += 1;
                }
            }
            Err(NetError::Stale) => {
                // Late arrival from an older generation; silently dropped.
                dropped += 1;
            }
            Err(err) => {
                logging::debug!(log, "dropping invalid datagram";
                                "bytes" => count, "error" => ?err);
                dropped += 1;
            }
        }
    }

    logging::debug!(log, "udp-rx task exiting"; "dropped" => dropped);
    Ok(())
}

/// The udp-tx task: drains the ACK outbox into as few ACK packets as
/// possible, each fitting one datagram.
pub fn ack_tx_loop(
    channel: &DatagramChannel,
    ack_outbox: &SignalQueue<u32>,
    cancel: &CancelToken,
    log: &logging::Logger,
) -> NetResult<()> {
    while !cancel.is_cancelled() {
        if !ack_outbox.wait(Duration::from_millis(200)) {
            continue;
        }

        let acks = ack_outbox.drain();
        for batch in acks.chunks(AckPacket::MAX_ACKS) {
            let packet = AckPacket {
                acks: batch.to_vec(),
            };

            let mut bytes = Vec::with_capacity(packet.encoded_size());
            packet.encode(&mut bytes)?;

            match channel.send(&bytes) {
                Ok(()) => {
                    logging::trace!(log, "sent acks"; "count" => batch.len());
                }
                Err(NetError::Wait) => {
                    // Requeue and retry after a beat; ACK loss is tolerable
                    // but cheap to avoid.
                    ack_outbox.extend(batch.to_vec());
                    cancel.wait(Duration::from_millis(20));
                }
                Err(err) => return Err(err),
            }
        }
    }

    logging::debug!(log, "ack-tx task exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::staging_records;
    use crate::wire::udp::{ChunkType, PointLightUpdateHeader, UdpHeader};
    use std::sync::Arc;
    use std::thread;

    fn datagram(gen: u64, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();
        UdpHeader {
            packet_gen: gen,
            size: payload.len() as u32,
        }
        .encode(&mut packet)
        .unwrap();
        packet.extend_from_slice(payload);
        packet.resize(PACKET_SIZE_BYTES, 0);
        packet
    }

    fn light_chunk() -> Vec<u8> {
        let mut chunk = vec![ChunkType::PointLightUpdate as u8];
        PointLightUpdateHeader {
            light_id: 1,
            color: [0.0; 3],
            intensity: 1.0,
        }
        .encode(&mut chunk)
        .unwrap();
        chunk
    }

    #[test]
    fn test_out_of_order_generations() {
        // Scenario: generations sent 5, 6, 7 but received 6, 5, 7. The
        // stale 5 is dropped; 6 and 7 land in receive order.
        let (a, b) = pair();
        let staging = StagingQueue::new(1 << 16, None);
        let cancel = CancelToken::new();
        let log = logging::discard();

        for &gen in &[6u64, 5, 7] {
            a.send(&datagram(gen, &light_chunk())).unwrap();
        }

        let receiver = thread::spawn({
            let cancel = cancel.clone();
            move || {
                thread::sleep(Duration::from_millis(150));
                cancel.cancel();
            }
        });
        udp_rx_loop(&b, &staging, &cancel, &log).unwrap();
        receiver.join().unwrap();

        let mut drained = Vec::new();
        staging.drain_into(&mut drained);
        let gens: Vec<u64> = staging_records(&drained)
            .map(|record| record.packet_gen)
            .collect();

        assert_eq!(gens, vec![6, 7]);
    }

    #[test]
    fn test_ack_batching_roundtrip() {
        let (a, b) = pair();
        let outbox = Arc::new(SignalQueue::new());
        let cancel = CancelToken::new();
        let log = logging::discard();

        // More serials than one packet can carry forces a second packet.
        let total = AckPacket::MAX_ACKS + 3;
        outbox.extend(0..total as u32);

        let sender = thread::spawn({
            let cancel = cancel.clone();
            move || {
                thread::sleep(Duration::from_millis(150));
                cancel.cancel();
            }
        });
        ack_tx_loop(&a, &outbox, &cancel, &log).unwrap();
        sender.join().unwrap();

        let mut buf = [0u8; PACKET_SIZE_BYTES];
        let mut received = Vec::new();
        for _ in 0..2 {
            let count = b.recv(&mut buf).unwrap();
            let mut cursor = &buf[..count];
            received.extend(AckPacket::decode(&mut cursor).unwrap().acks);
        }

        assert_eq!(received, (0..total as u32).collect::<Vec<_>>());
    }

    fn pair() -> (DatagramChannel, DatagramChannel) {
        let a = DatagramChannel::bind("127.0.0.1:0", Duration::from_millis(100), None).unwrap();
        let b = DatagramChannel::bind("127.0.0.1:0", Duration::from_millis(100), None).unwrap();
        a.connect(b.local_addr().unwrap()).unwrap();
        b.connect(a.local_addr().unwrap()).unwrap();
        (a, b)
    }
}
