//! PR-SCTP: 수명이 지난 메시지 폐기와 FORWARD-TSN
//!
//! 송신 측은 폐기된 메시지의 TSN 구간만큼 advanced peer ack point를 올리고
//! FORWARD-TSN으로 수신 측 cumulative TSN을 건너뛰게 한다.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, trace};

use crate::association::{Association, PacketCtx};
use crate::chunk::{Chunk, ErrorCause, ForwardTsnChunk};
use crate::message::{ChunkState, MessageKey};
use crate::seq::{ssn_gt, tsn_gt, tsn_le, tsn_lt};
use crate::timer::TimerKey;
use crate::Notification;

impl Association {
    /// 수명이 지난 메시지 처리
    ///
    /// 한 번도 전송하지 않은 메시지는 바로 제거한다 (FORWARD-TSN 없음).
    /// 일부만 전송된 메시지는 PR-SCTP가 합의된 경우에만 폐기 표시한다.
    /// 전송분이 이미 모두 cumulative ack된 메시지도 수신 측에 남은 조각과
    /// SSN을 정리시키기 위해 FORWARD-TSN을 보낸다.
    pub(crate) fn abandon_expired(&mut self, now: Instant) {
        let mut abandoned_any = false;
        let mut acked_prefix = false;
        for key in self.outbound.keys() {
            let Some(msg) = self.outbound.get(key) else {
                continue;
            };
            if msg.abandoned || !msg.is_expired(now) {
                continue;
            }
            if !msg.any_sent() {
                if let Some(msg) = self.outbound.remove(key) {
                    debug!(
                        "미전송 메시지 수명 만료: stream={} {} bytes",
                        msg.stream,
                        msg.total_bytes()
                    );
                    self.stats.abandoned_messages += 1;
                    self.io.events.notify(Notification::SendFailed {
                        stream: msg.stream,
                        ppid: msg.ppid,
                        data: msg.data(),
                        sent: false,
                    });
                }
                continue;
            }
            if !self.prsctp || msg.all_acked() {
                continue;
            }
            if msg
                .last_sent_tsn()
                .map_or(false, |tsn| tsn_le(tsn, self.last_ack_rxd))
            {
                acked_prefix = true;
            }
            self.abandon(key);
            abandoned_any = true;
        }

        if abandoned_any {
            self.check_adv_ack_pt(now);
            if tsn_gt(self.adv_ack_point, self.last_ack_rxd) || acked_prefix {
                self.send_forward_tsn(now);
            }
        }
    }

    /// 메시지 폐기 표시, 미전송 청크는 Abandoned로
    fn abandon(&mut self, key: MessageKey) {
        self.outbound.seal(key);
        let unsent: Vec<usize> = match self.outbound.get_mut(key) {
            Some(msg) => {
                msg.abandoned = true;
                debug!(
                    "메시지 폐기: stream={} ssn={:?} ({}개 청크 중 {}개 전송)",
                    msg.stream,
                    msg.ssn,
                    msg.chunks.len(),
                    msg.chunks.iter().filter(|c| c.tsn.is_some()).count()
                );
                msg.chunks
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.state == ChunkState::Unsent)
                    .map(|(idx, _)| idx)
                    .collect()
            }
            None => return,
        };
        for idx in unsent {
            self.outbound.set_chunk_state(key, idx, ChunkState::Abandoned);
        }
        self.stats.abandoned_messages += 1;
    }

    /// advanced peer ack point 갱신
    ///
    /// last_ack 다음 TSN부터 폐기되었거나 폐기 대상인 메시지의 청크가
    /// 연속되는 동안 앞으로 민다.
    pub(crate) fn check_adv_ack_pt(&mut self, now: Instant) {
        if !self.prsctp {
            return;
        }
        if tsn_lt(self.adv_ack_point, self.last_ack_rxd) {
            self.adv_ack_point = self.last_ack_rxd;
        }
        for (tsn, key, _) in self.sent_chunks() {
            if tsn_le(tsn, self.adv_ack_point) {
                continue;
            }
            if tsn != self.adv_ack_point.wrapping_add(1) {
                break;
            }
            let Some(msg) = self.outbound.get(key) else {
                break;
            };
            if !msg.abandoned {
                if !msg.is_expired(now) {
                    break;
                }
                self.abandon(key);
            }
            self.adv_ack_point = tsn;
        }
        trace!(
            "advanced peer ack point {} (last ack {})",
            self.adv_ack_point,
            self.last_ack_rxd
        );
    }

    /// FORWARD-TSN 전송 (new cumulative TSN = advanced peer ack point)
    ///
    /// 스트림마다 ack point 이하에서 폐기된 가장 높은 ordered SSN 하나를 싣는다.
    pub(crate) fn send_forward_tsn(&mut self, now: Instant) {
        let new_cum = self.adv_ack_point;
        let mut highest: BTreeMap<u16, u16> = BTreeMap::new();
        for (_, msg) in self.outbound.iter() {
            if !msg.abandoned || msg.unordered {
                continue;
            }
            let Some(ssn) = msg.ssn else {
                continue;
            };
            let covered = msg
                .chunks
                .iter()
                .filter_map(|c| c.tsn)
                .any(|tsn| tsn_le(tsn, new_cum));
            if !covered {
                continue;
            }
            highest
                .entry(msg.stream)
                .and_modify(|s| {
                    if ssn_gt(ssn, *s) {
                        *s = ssn;
                    }
                })
                .or_insert(ssn);
        }

        let streams: Vec<(u16, u16)> = highest.into_iter().collect();
        debug!("FORWARD-TSN 전송: new_cum={} streams={:?}", new_cum, streams);
        let Some(id) = self.peers.current() else {
            return;
        };
        self.send_chunks(
            Some(id),
            vec![Chunk::ForwardTsn(ForwardTsnChunk {
                new_cum_tsn: new_cum,
                streams,
            })],
        );
        self.stats.forward_tsns_sent += 1;
        let rto = self
            .peers
            .get(id)
            .map(|p| p.rto.rto())
            .unwrap_or(self.config.rto_initial);
        self.timers
            .start_if_idle(TimerKey::Retransmit(id), now + rto);
    }

    /// FORWARD-TSN 수신
    pub(crate) fn process_forward_tsn(
        &mut self,
        now: Instant,
        ftsn: ForwardTsnChunk,
        ctx: &mut PacketCtx,
    ) {
        ctx.got_data = true;
        self.stats.forward_tsns_received += 1;
        let new_cum = ftsn.new_cum_tsn;
        let advance = tsn_gt(new_cum, self.recv.cum_tsn);
        debug!(
            "FORWARD-TSN 수신: cum {} → {} ({}개 스트림)",
            self.recv.cum_tsn,
            new_cum,
            ftsn.streams.len()
        );

        let outcome = self.recv.reassembly.skip(new_cum, &ftsn.streams);
        for (stream, ssn) in outcome.pd_aborted {
            self.io
                .events
                .notify(Notification::PartialDeliveryAborted { stream, ssn });
        }
        for sid in outcome.invalid_streams {
            ctx.replies.push(Chunk::Error {
                causes: vec![ErrorCause::invalid_stream(sid)],
            });
        }

        // cum 이하면 조각과 SSN 정리만
        let recv = &mut self.recv;
        if advance {
            recv.cum_tsn = new_cum;
            recv.gaps.remove_through(new_cum);
            if let Some(end) = recv.gaps.absorb(new_cum) {
                recv.cum_tsn = end;
            }
        }
        recv.ack_needed = true;
        recv.force_sack = true;

        if let Some(id) = ctx.peer {
            self.peers.set_last_data_from(id);
        }
        self.last_activity = now;
        self.deliver(outcome.deliveries);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::association::testing::*;
    use crate::chunk::data_flags::BEGIN;
    use crate::chunk::{cause, CommonHeader, DataChunk, Packet};
    use crate::{AssocState, Config, SendOptions};

    fn forward_tsns(chunks: &[(Chunk, std::net::SocketAddr)]) -> Vec<ForwardTsnChunk> {
        chunks
            .iter()
            .filter_map(|(c, _)| match c {
                Chunk::ForwardTsn(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    fn to_server(pair: &Pair, chunk: Chunk) -> Packet {
        let mut packet = Packet::new(CommonHeader {
            src_port: 5000,
            dst_port: 6000,
            verification_tag: pair.server.local_tag(),
        });
        packet.chunks.push(chunk);
        packet
    }

    fn fwd(new_cum_tsn: u32, streams: Vec<(u16, u16)>) -> Chunk {
        Chunk::ForwardTsn(ForwardTsnChunk {
            new_cum_tsn,
            streams,
        })
    }

    #[test]
    fn test_expired_unsent_message_dropped_without_forward_tsn() {
        let mut pair = Pair::connected(test_config());
        for i in 0..4u8 {
            pair.client
                .send(pair.now, Bytes::from(vec![i; 1200]), SendOptions::default())
                .unwrap();
        }
        assert_eq!(pair.take_from_client().len(), 4);

        // cwnd가 차 있어 전송 기회 없음
        pair.client
            .send(
                pair.now,
                Bytes::from_static(b"short-lived"),
                SendOptions::stream(1).with_ttl(Duration::from_millis(2)),
            )
            .unwrap();
        assert!(pair.take_from_client().is_empty());

        pair.now += Duration::from_millis(5);
        pair.client.output(pair.now);

        let events = pair.client_io.take_events();
        assert_eq!(
            events,
            vec![Notification::SendFailed {
                stream: 1,
                ppid: 0,
                data: Bytes::from_static(b"short-lived"),
                sent: false,
            }]
        );
        assert!(forward_tsns(&pair.client_io.take_chunks()).is_empty());
        assert_eq!(pair.client.outbound().len(), 4);
        assert_eq!(pair.client.outbound().unsent_bytes(), 0);
    }

    #[test]
    fn test_partially_sent_message_abandoned_with_forward_tsn() {
        let mut pair = Pair::connected(test_config());
        let id = pair.client.peers().current().unwrap();
        pair.client.peers.get_mut(id).unwrap().cwnd.cwnd = 2 * 1452;

        let n = pair.client.next_tsn();
        pair.client
            .send(
                pair.now,
                Bytes::from(vec![5u8; 5 * 1452]),
                SendOptions::default().with_ttl(Duration::from_millis(50)),
            )
            .unwrap();
        let packets = pair.take_from_client();
        assert_eq!(packets.len(), 2);
        assert_eq!(pair.client.outbound().unsent_bytes(), 3 * 1452);

        // 첫 조각만 도착
        pair.server_recv(&packets[0].0);
        pair.take_from_server();

        pair.now += Duration::from_millis(100);
        pair.client.output(pair.now);
        assert_eq!(pair.client.outbound().unsent_bytes(), 0);
        assert_eq!(pair.client.advanced_peer_ack_point(), n.wrapping_add(1));
        assert_eq!(pair.client.stats().abandoned_messages, 1);

        let packets = pair.take_from_client();
        let chunks: Vec<_> = packets.iter().flat_map(|(p, _)| p.chunks.clone()).collect();
        assert_eq!(chunks.len(), 1);
        let Chunk::ForwardTsn(ftsn) = &chunks[0] else {
            panic!("FORWARD-TSN 기대, {:?}", chunks[0]);
        };
        assert_eq!(ftsn.new_cum_tsn, n.wrapping_add(1));
        assert_eq!(ftsn.streams, vec![(0, 0)]);

        // 수신 측은 조각을 버리고 건너뛴 뒤 SACK
        pair.server_recv(&packets[0].0);
        assert_eq!(pair.server.cumulative_tsn(), n.wrapping_add(1));
        assert!(pair.server_io.take_deliveries().is_empty());
        pair.to_client();

        let events = pair.client_io.take_events();
        assert!(matches!(
            events.as_slice(),
            [Notification::SendFailed { sent: true, .. }]
        ));
        assert!(pair.client.outbound().is_empty());

        // 스트림 0은 SSN 1부터 정상 진행
        pair.client
            .send(pair.now, Bytes::from_static(b"after"), SendOptions::default())
            .unwrap();
        pair.to_server();
        let delivered = pair.server_io.take_deliveries();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].ssn, 1);
    }

    #[test]
    fn test_expired_message_with_acked_prefix_abandoned() {
        let mut pair = Pair::connected(test_config());
        let id = pair.client.peers().current().unwrap();
        pair.client.peers.get_mut(id).unwrap().cwnd.cwnd = 2 * 1452;

        let n = pair.client.next_tsn();
        pair.client
            .send(
                pair.now,
                Bytes::from(vec![9u8; 5 * 1452]),
                SendOptions::default().with_ttl(Duration::from_millis(50)),
            )
            .unwrap();
        let packets = pair.take_from_client();
        assert_eq!(packets.len(), 2);
        for (packet, _) in &packets {
            pair.server_recv(packet);
        }
        pair.take_from_server();

        // 전송분 모두 ack, 윈도우는 닫힘
        let mut sack = Packet::new(CommonHeader {
            src_port: 6000,
            dst_port: 5000,
            verification_tag: pair.client.local_tag(),
        });
        sack.chunks.push(Chunk::Sack(crate::chunk::SackChunk {
            cum_tsn: n.wrapping_add(1),
            a_rwnd: 0,
            gaps: Vec::new(),
            dups: Vec::new(),
        }));
        pair.client_recv(&sack);
        assert!(pair.take_from_client().is_empty());
        assert_eq!(pair.client.outbound().unsent_bytes(), 3 * 1452);

        pair.now += Duration::from_millis(100);
        pair.client.output(pair.now);
        pair.client.poll_timers(pair.now);
        assert_eq!(pair.client.outbound().unsent_bytes(), 0);
        assert_eq!(pair.client.stats().abandoned_messages, 1);
        assert_eq!(pair.client.advanced_peer_ack_point(), n.wrapping_add(1));

        let packets = pair.take_from_client();
        let chunks: Vec<_> = packets.iter().flat_map(|(p, _)| p.chunks.clone()).collect();
        assert!(chunks.iter().all(|c| !matches!(c, Chunk::Data(_))));
        let ftsns: Vec<_> = chunks
            .iter()
            .filter_map(|c| match c {
                Chunk::ForwardTsn(f) => Some(f.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ftsns.len(), 1);
        assert_eq!(ftsns[0].new_cum_tsn, n.wrapping_add(1));
        assert_eq!(ftsns[0].streams, vec![(0, 0)]);

        // 수신 측은 cum 그대로 두고 남은 조각과 SSN 0을 정리
        for (packet, _) in &packets {
            pair.server_recv(packet);
        }
        assert_eq!(pair.server.cumulative_tsn(), n.wrapping_add(1));
        assert_eq!(pair.server.recv.reassembly.queued_bytes(), 0);
        assert!(pair.server_io.take_deliveries().is_empty());
        assert!(pair.to_client() >= 1);

        let events = pair.client_io.take_events();
        assert!(matches!(
            events.as_slice(),
            [Notification::SendFailed { sent: true, .. }]
        ));
        assert!(pair.client.outbound().is_empty());

        // 이후 T3가 돌아도 폐기된 데이터는 나가지 않음
        pair.advance(Duration::from_secs(3));
        assert!(pair
            .client_io
            .take_chunks()
            .iter()
            .all(|(c, _)| !matches!(c, Chunk::Data(_))));

        pair.client
            .send(pair.now, Bytes::from_static(b"after"), SendOptions::default())
            .unwrap();
        pair.to_server();
        let delivered = pair.server_io.take_deliveries();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].ssn, 1);
    }

    #[test]
    fn test_t3_resends_forward_tsn_instead_of_data() {
        let mut pair = Pair::connected(test_config());
        let id = pair.client.peers().current().unwrap();
        pair.client.peers.get_mut(id).unwrap().cwnd.cwnd = 2 * 1452;
        let n = pair.client.next_tsn();
        pair.client
            .send(
                pair.now,
                Bytes::from(vec![1u8; 5 * 1452]),
                SendOptions::default().with_ttl(Duration::from_millis(50)),
            )
            .unwrap();
        pair.take_from_client();
        pair.now += Duration::from_millis(100);
        pair.client.output(pair.now);
        assert_eq!(forward_tsns(&pair.client_io.take_chunks()).len(), 1);

        pair.advance(Duration::from_secs(3));
        let chunks = pair.client_io.take_chunks();
        assert!(chunks.iter().all(|(c, _)| !matches!(c, Chunk::Data(_))));
        let resent = forward_tsns(&chunks);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].new_cum_tsn, n.wrapping_add(1));
        assert_eq!(pair.client.stats().forward_tsns_sent, 2);
    }

    #[test]
    fn test_expired_without_partial_reliability_keeps_sending() {
        let config = Config {
            partial_reliability: false,
            ..test_config()
        };
        let mut pair = Pair::connected(config);
        assert!(!pair.client.partial_reliability());
        let id = pair.client.peers().current().unwrap();
        pair.client.peers.get_mut(id).unwrap().cwnd.cwnd = 1452;
        pair.client
            .send(
                pair.now,
                Bytes::from(vec![3u8; 3 * 1452]),
                SendOptions::default().with_ttl(Duration::from_millis(10)),
            )
            .unwrap();
        assert_eq!(pair.take_from_client().len(), 1);
        pair.now += Duration::from_millis(20);
        pair.client.output(pair.now);
        assert!(forward_tsns(&pair.client_io.take_chunks()).is_empty());
        assert_eq!(pair.client.outbound().unsent_bytes(), 2 * 1452);
        assert_eq!(pair.client.stats().abandoned_messages, 0);
    }

    #[test]
    fn test_forward_tsn_moves_cum_only_to_new_cum() {
        let mut pair = Pair::connected(test_config());
        let cum = pair.server.cumulative_tsn();
        // 멀리 떨어진 TSN 하나 수신 (gap)
        let far = Chunk::Data(DataChunk {
            flags: BEGIN | crate::chunk::data_flags::END,
            tsn: cum.wrapping_add(8),
            stream: 0,
            ssn: 7,
            ppid: 0,
            payload: Bytes::from_static(b"far"),
        });
        pair.server_recv(&to_server(&pair, far));
        pair.take_from_server();

        pair.server_recv(&to_server(&pair, fwd(cum.wrapping_add(5), vec![(0, 4)])));
        assert_eq!(pair.server.cumulative_tsn(), cum.wrapping_add(5));
        assert_eq!(
            pair.server.received_gaps().first(),
            Some((cum.wrapping_add(8), cum.wrapping_add(8)))
        );
        assert!(pair.server.received_gaps().is_consistent(cum.wrapping_add(5)));
        assert_eq!(pair.server.stats().forward_tsns_received, 1);

        // 바로 SACK
        let packets = pair.take_from_server();
        let sack = packets
            .iter()
            .flat_map(|(p, _)| p.chunks.iter())
            .find_map(|c| match c {
                Chunk::Sack(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(sack.cum_tsn, cum.wrapping_add(5));
        assert_eq!(sack.gaps, vec![(3, 3)]);

        // 중복 FORWARD-TSN은 SACK만
        pair.server_recv(&to_server(&pair, fwd(cum.wrapping_add(2), Vec::new())));
        assert_eq!(pair.server.cumulative_tsn(), cum.wrapping_add(5));
        assert_eq!(pair.take_from_server().len(), 1);
    }

    #[test]
    fn test_forward_tsn_invalid_stream_and_partial_abort() {
        let config = Config {
            partial_delivery_point: Some(100),
            ..test_config()
        };
        let mut pair = Pair::connected(config);
        let cum = pair.server.cumulative_tsn();
        let head = Chunk::Data(DataChunk {
            flags: BEGIN,
            tsn: cum.wrapping_add(1),
            stream: 2,
            ssn: 0,
            ppid: 0,
            payload: Bytes::from(vec![0u8; 200]),
        });
        pair.server_recv(&to_server(&pair, head));
        let partial = pair.server_io.take_deliveries();
        assert_eq!(partial.len(), 1);
        assert!(partial[0].flags.partial);
        pair.take_from_server();

        pair.server_recv(&to_server(
            &pair,
            fwd(cum.wrapping_add(3), vec![(2, 0), (500, 1)]),
        ));
        assert_eq!(
            pair.server_io.take_events(),
            vec![Notification::PartialDeliveryAborted { stream: 2, ssn: 0 }]
        );
        let chunks = pair.server_io.take_chunks();
        assert!(chunks.iter().any(|(c, _)| matches!(
            c,
            Chunk::Error { causes } if causes[0].code == cause::INVALID_STREAM
        )));
        assert_eq!(pair.server.cumulative_tsn(), cum.wrapping_add(3));
        assert_eq!(pair.server.state(), AssocState::Established);
    }
}
