//! SACK 처리와 재전송
//!
//! - cumulative ack / gap block 반영, reneging 복원
//! - missing report 기반 fast retransmit과 fast recovery
//! - RTT 샘플 (Karn), 목적지별 T3 관리
//! - T3 만료: failover, 첫 패킷 재전송 후 slow-start 재전송
//! - zero window probe
//!
//! 청크가 `Sent` 상태인 동안에만 `chunk.dest` 목적지의 in-flight에 포함된다.
//! gap ack, 재전송 표시, cumulative ack 시 차감하고 재전송 시 새 목적지에 더한다.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::association::{AssocState, Association, PacketCtx};
use crate::chunk::{cause, Chunk, SackChunk};
use crate::message::{ChunkState, MessageKey};
use crate::multipath::PeerId;
use crate::seq::{tsn_ge, tsn_gt, tsn_le, tsn_lt};
use crate::timer::TimerKey;
use crate::Notification;

/// 진행 중인 RTT 측정 (한 번에 하나)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RttSample {
    pub tsn: u32,
    pub sent_at: Instant,
    pub peer: PeerId,
}

/// (TSN, 메시지 키, 청크 인덱스)
type SentRef = (u32, MessageKey, usize);

fn add_bytes(list: &mut Vec<(PeerId, u32)>, id: Option<PeerId>, bytes: u32) {
    let Some(id) = id else {
        return;
    };
    match list.iter_mut().find(|(p, _)| *p == id) {
        Some((_, total)) => *total += bytes,
        None => list.push((id, bytes)),
    }
}

impl Association {
    /// last_ack 이후 TSN이 할당된 청크 (TSN 순)
    pub(crate) fn sent_chunks(&self) -> Vec<SentRef> {
        let base = self.last_ack_rxd;
        let mut out: Vec<SentRef> = self
            .outbound
            .iter()
            .flat_map(|(key, msg)| {
                msg.chunks
                    .iter()
                    .enumerate()
                    .filter_map(move |(idx, c)| c.tsn.map(|tsn| (tsn, key, idx)))
            })
            .filter(|(tsn, _, _)| tsn_gt(*tsn, base))
            .collect();
        out.sort_by_key(|(tsn, _, _)| tsn.wrapping_sub(base));
        out
    }

    fn chunk_state(&self, key: MessageKey, idx: usize) -> Option<ChunkState> {
        self.outbound.get(key)?.chunks.get(idx).map(|c| c.state)
    }

    /// 목적지로 나가 있는 미확인 청크
    fn outstanding_on(&self, id: PeerId) -> Vec<SentRef> {
        self.sent_chunks()
            .into_iter()
            .filter(|&(_, key, idx)| {
                self.outbound
                    .get(key)
                    .and_then(|m| m.chunks.get(idx))
                    .map_or(false, |c| c.is_outstanding() && c.dest == Some(id))
            })
            .collect()
    }

    /// 폐기된 메시지의 청크는 재전송하지 않는다
    fn resendable(&self, list: Vec<SentRef>) -> Vec<SentRef> {
        list.into_iter()
            .filter(|&(_, key, _)| self.outbound.get(key).map_or(false, |m| !m.abandoned))
            .collect()
    }

    fn uncharge(&mut self, id: Option<PeerId>, len: u32) {
        if let Some(peer) = id.and_then(|id| self.peers.get_mut(id)) {
            peer.flight = peer.flight.saturating_sub(len);
        }
    }

    fn charge(&mut self, id: Option<PeerId>, len: u32) {
        if let Some(peer) = id.and_then(|id| self.peers.get_mut(id)) {
            peer.flight += len;
        }
    }

    fn release_rxt(&mut self, id: Option<PeerId>, len: u32) {
        if let Some(peer) = id.and_then(|id| self.peers.get_mut(id)) {
            peer.rxt_unacked = peer.rxt_unacked.saturating_sub(len);
        }
    }

    /// SACK 수신
    pub(crate) fn process_sack(&mut self, now: Instant, sack: &SackChunk, ctx: &mut PacketCtx) {
        self.stats.sacks_received += 1;
        let cum = sack.cum_tsn;
        if tsn_lt(cum, self.last_ack_rxd) {
            trace!("오래된 SACK 무시: cum={} < {}", cum, self.last_ack_rxd);
            return;
        }
        if tsn_gt(cum, self.next_tsn.wrapping_sub(1)) {
            self.abort_violation(
                cause::PROTOCOL_VIOLATION,
                Bytes::from_static(b"SACK for unsent TSN"),
                "전송하지 않은 TSN에 대한 SACK",
            );
            ctx.stop = true;
            return;
        }
        trace!(
            "SACK cum={} a_rwnd={} gaps={} dups={}",
            cum,
            sack.a_rwnd,
            sack.gaps.len(),
            sack.dups.len()
        );

        if let Some(id) = ctx.peer {
            self.faddr_alive(now, id);
        }
        self.apply_ack(now, cum, Some(&sack.gaps));
        self.peer_rwnd = sack.a_rwnd;

        if self.zero_win_probe {
            let mss = self
                .peers
                .current()
                .and_then(|id| self.peers.get(id))
                .map_or(u32::MAX, |p| p.pmss);
            if sack.a_rwnd >= mss {
                debug!("피어 윈도우 열림: a_rwnd={}", sack.a_rwnd);
                self.zero_win_probe = false;
                if let Some(peer) = self.peers.current().and_then(|id| self.peers.get_mut(id)) {
                    peer.rto.recompute();
                }
            }
        }

        if self.rexmit_range.is_some() {
            self.ss_rexmit(now);
        }
        if self.prsctp {
            self.check_adv_ack_pt(now);
            if tsn_gt(self.adv_ack_point, self.last_ack_rxd) {
                self.send_forward_tsn(now);
            }
        }
        ctx.trysend = true;
    }

    /// SHUTDOWN의 cumulative TSN 반영 (gap 정보 없음)
    ///
    /// 전송하지 않은 TSN이면 ABORT 후 false.
    pub(crate) fn cumulative_ack_from_shutdown(&mut self, now: Instant, cum: u32) -> bool {
        if tsn_le(cum, self.last_ack_rxd) {
            return true;
        }
        if tsn_gt(cum, self.next_tsn.wrapping_sub(1)) {
            self.abort_violation(
                cause::PROTOCOL_VIOLATION,
                Bytes::from_static(b"SHUTDOWN acks unsent TSN"),
                "전송하지 않은 TSN에 대한 SHUTDOWN",
            );
            return false;
        }
        self.apply_ack(now, cum, None);
        true
    }

    /// cumulative ack과 gap block 적용
    ///
    /// `gaps`가 None이면 (SHUTDOWN) gap 처리와 reneging 판단을 건너뛴다.
    fn apply_ack(&mut self, now: Instant, cum: u32, gaps: Option<&[(u16, u16)]>) {
        let cum_advanced = tsn_gt(cum, self.last_ack_rxd);
        let flight_before: Vec<(PeerId, u32)> =
            self.peers.iter().map(|p| (p.id, p.flight)).collect();
        let threshold = self.config.fast_retransmit_threshold;
        let highest_sent = self.next_tsn.wrapping_sub(1);
        let highest_gap = gaps
            .and_then(|g| g.iter().map(|&(_, end)| end).max())
            .map(|end| cum.wrapping_add(end as u32));
        let mut acked: Vec<(PeerId, u32)> = Vec::new();
        let mut sample_acked = false;

        for (tsn, key, idx) in self.sent_chunks() {
            let Some(chunk) = self.outbound.get(key).and_then(|m| m.chunks.get(idx)) else {
                continue;
            };
            let (state, len, dest, xmits) =
                (chunk.state, chunk.len() as u32, chunk.dest, chunk.xmit_count);
            let is_sample = self.rtt_sample.map_or(false, |s| s.tsn == tsn);

            if tsn_le(tsn, cum) {
                if matches!(state, ChunkState::Sent | ChunkState::MarkedRetransmit) {
                    if state == ChunkState::Sent {
                        self.uncharge(dest, len);
                    }
                    add_bytes(&mut acked, dest, len);
                    if xmits > 1 {
                        self.release_rxt(dest, len);
                    }
                }
                self.outbound.set_chunk_state(key, idx, ChunkState::Acked);
                self.outbound.release_acked(len as usize);
                sample_acked |= is_sample;
                continue;
            }

            let Some(gaps) = gaps else {
                break;
            };
            let covered = gaps.iter().any(|&(start, end)| {
                tsn_ge(tsn, cum.wrapping_add(start as u32)) && tsn_le(tsn, cum.wrapping_add(end as u32))
            });
            match (state, covered) {
                (ChunkState::Sent | ChunkState::MarkedRetransmit, true) => {
                    if state == ChunkState::Sent {
                        self.uncharge(dest, len);
                    }
                    add_bytes(&mut acked, dest, len);
                    if xmits > 1 {
                        self.release_rxt(dest, len);
                    }
                    self.outbound.set_chunk_state(key, idx, ChunkState::Acked);
                    sample_acked |= is_sample;
                }
                (ChunkState::Acked, false) => {
                    debug!("reneging: TSN {} gap ack 철회", tsn);
                    self.outbound.set_chunk_state(key, idx, ChunkState::Sent);
                    self.charge(dest, len);
                }
                (ChunkState::Sent, false)
                    if highest_gap.map_or(false, |h| tsn_lt(tsn, h)) =>
                {
                    let missing = match self.outbound.get_mut(key).and_then(|m| m.chunks.get_mut(idx)) {
                        Some(chunk) => {
                            chunk.missing = chunk.missing.saturating_add(1);
                            chunk.missing
                        }
                        None => continue,
                    };
                    if missing >= threshold {
                        self.mark_fast_retransmit(key, idx, tsn, dest, len, highest_sent);
                    }
                }
                _ => {}
            }
        }

        if cum_advanced {
            self.last_ack_rxd = cum;
            if tsn_lt(self.adv_ack_point, cum) {
                self.adv_ack_point = cum;
            }
        }
        self.sweep_acked();

        if sample_acked {
            if let Some(sample) = self.rtt_sample.take() {
                let rtt = now.saturating_duration_since(sample.sent_at);
                if let Some(peer) = self.peers.get_mut(sample.peer) {
                    peer.rto.sample(rtt);
                    peer.cc.on_rtt_sample(&mut peer.cwnd, rtt, now);
                    peer.stats.record_rtt(rtt);
                    trace!("RTT {:?} → rto {:?}", rtt, peer.rto.rto());
                }
            }
        }

        for (id, bytes) in acked.iter().copied() {
            let before = flight_before
                .iter()
                .find(|(p, _)| *p == id)
                .map_or(0, |(_, f)| *f);
            let Some(peer) = self.peers.get_mut(id) else {
                continue;
            };
            let full = bytes + before >= peer.cwnd.cwnd.saturating_sub(peer.cwnd.mss);
            if cum_advanced && peer.recovery_tsn.is_none() && full {
                peer.cc.on_ack(&mut peer.cwnd, bytes, now);
            }
        }
        for peer in self.peers.iter_mut() {
            if let Some(recover) = peer.recovery_tsn {
                if tsn_ge(cum, recover) {
                    peer.recovery_tsn = None;
                    debug!("{} fast recovery 종료 (cwnd={})", peer.addr, peer.cwnd.cwnd);
                }
            }
        }

        // 목적지별 T3: 전부 ack되면 정지, 진전이 있으면 재시작
        for id in self.peers.ids() {
            let key = TimerKey::Retransmit(id);
            let outstanding = self.sent_chunks().iter().any(|&(_, k, i)| {
                self.outbound
                    .get(k)
                    .and_then(|m| m.chunks.get(i))
                    .map_or(false, |c| c.is_outstanding() && c.dest == Some(id))
            });
            let rto = self.peers.get(id).map(|p| p.rto.rto()).unwrap_or(self.config.rto_initial);
            if !outstanding {
                self.timers.stop(key);
            } else if cum_advanced && acked.iter().any(|(p, _)| *p == id) {
                self.timers.start(key, now + rto);
            } else {
                self.timers.start_if_idle(key, now + rto);
            }
        }
    }

    /// missing report 한도 도달: 즉시 재전송 대상으로
    fn mark_fast_retransmit(
        &mut self,
        key: MessageKey,
        idx: usize,
        tsn: u32,
        dest: Option<PeerId>,
        len: u32,
        highest_sent: u32,
    ) {
        self.outbound
            .set_chunk_state(key, idx, ChunkState::MarkedRetransmit);
        self.uncharge(dest, len);
        self.stats.fast_retransmits += 1;
        let Some(peer) = dest.and_then(|id| self.peers.get_mut(id)) else {
            return;
        };
        if peer.recovery_tsn.is_none() {
            peer.cc.on_loss(&mut peer.cwnd);
            peer.recovery_tsn = Some(highest_sent);
            debug!(
                "fast retransmit: TSN {} → fast recovery (cwnd={}, ssthresh={})",
                tsn, peer.cwnd.cwnd, peer.cwnd.ssthresh
            );
        } else {
            debug!("fast retransmit: TSN {}", tsn);
        }
    }

    /// cumulative ack이 지난 메시지 정리
    ///
    /// 완료된 메시지는 제거하고, 폐기된 메시지는 send-failed로 보고한다.
    fn sweep_acked(&mut self) {
        let cum = self.last_ack_rxd;
        for key in self.outbound.keys() {
            let Some(msg) = self.outbound.get(key) else {
                continue;
            };
            let passed = msg.last_sent_tsn().map_or(true, |last| tsn_le(last, cum));
            if msg.abandoned && passed {
                if let Some(msg) = self.outbound.remove(key) {
                    debug!("폐기 메시지 정리: stream={} ssn={:?}", msg.stream, msg.ssn);
                    self.io.events.notify(Notification::SendFailed {
                        stream: msg.stream,
                        ppid: msg.ppid,
                        data: msg.data(),
                        sent: true,
                    });
                }
            } else if msg.is_done() && passed {
                self.outbound.remove(key);
            }
        }
    }

    /// 청크 묶음을 한 패킷으로 재전송, (청크 수, payload 바이트)
    ///
    /// 첫 청크는 항상 포함하고 이후는 MSS와 `budget` 안에서 번들링한다.
    fn retransmit_packet(
        &mut self,
        now: Instant,
        id: PeerId,
        list: &[SentRef],
        budget: Option<u32>,
    ) -> (usize, u32) {
        let Some(pmss) = self.peers.get(id).map(|p| p.pmss as usize) else {
            return (0, 0);
        };
        let mut chunks = Vec::new();
        let mut used = 0usize;
        let mut bytes = 0u32;
        for &(tsn, key, idx) in list {
            let Some(chunk) = self.outbound.get(key).and_then(|m| m.chunks.get(idx)) else {
                break;
            };
            let (state, padded, len, old) =
                (chunk.state, chunk.padded_len(), chunk.len() as u32, chunk.dest);
            if !chunk.is_outstanding() {
                break;
            }
            if !chunks.is_empty()
                && (used + padded > pmss || budget.map_or(false, |b| bytes + len > b))
            {
                break;
            }
            if state == ChunkState::Sent {
                self.uncharge(old, len);
            }
            if self.rtt_sample.map_or(false, |s| s.tsn == tsn) {
                self.rtt_sample = None;
            }
            let Some(data) = self.mark_sent(now, key, idx, id) else {
                break;
            };
            if let Some(peer) = self.peers.get_mut(id) {
                peer.rxt_unacked += len;
            }
            used += padded;
            bytes += len;
            chunks.push(Chunk::Data(data));
        }

        let count = chunks.len();
        if count == 0 {
            return (0, 0);
        }
        let Some(mut dest) = self.destination(id) else {
            return (0, 0);
        };
        dest.dont_fragment = used <= pmss;
        debug!("DATA {}개 재전송 → {}", count, dest.addr);
        if let Err(e) = self.transmit(dest, self.peer_port, self.peer_tag, chunks) {
            self.output_error(id, &e);
        }
        self.data_sent(now, id, None, used);
        (count, bytes)
    }

    /// 재전송 표시된 청크 즉시 전송
    pub(crate) fn retransmit_marked(&mut self, now: Instant) {
        for _ in 0..self.config.max_burst {
            let marked: Vec<SentRef> = self
                .sent_chunks()
                .into_iter()
                .filter(|&(_, k, i)| self.chunk_state(k, i) == Some(ChunkState::MarkedRetransmit))
                .collect();
            let marked = self.resendable(marked);
            let Some(&(_, key, idx)) = marked.first() else {
                return;
            };
            let prev = self
                .outbound
                .get(key)
                .and_then(|m| m.chunks.get(idx))
                .and_then(|c| c.dest);
            let alive = prev.filter(|id| self.peers.get(*id).map_or(false, |p| p.is_alive()));
            let Some(id) = alive.or(self.peers.current()) else {
                return;
            };
            if self.retransmit_packet(now, id, &marked, None).0 == 0 {
                return;
            }
        }
    }

    /// T3 이후 남은 구간의 slow-start 재전송
    ///
    /// 허용량은 cwnd - rxt_unacked (최소 1 MSS).
    pub(crate) fn ss_rexmit(&mut self, now: Instant) {
        let Some((next, max)) = self.rexmit_range else {
            return;
        };
        let Some(id) = self.peers.current() else {
            return;
        };
        let remaining: Vec<SentRef> = self
            .sent_chunks()
            .into_iter()
            .filter(|&(tsn, k, i)| {
                tsn_ge(tsn, next)
                    && tsn_le(tsn, max)
                    && self.chunk_state(k, i) == Some(ChunkState::Sent)
            })
            .collect();
        let remaining = self.resendable(remaining);
        let Some(peer) = self.peers.get(id) else {
            return;
        };
        let mut allowance = peer
            .cwnd
            .cwnd
            .saturating_sub(peer.rxt_unacked)
            .max(peer.cwnd.mss);

        let mut pos = 0;
        while pos < remaining.len() && allowance > 0 {
            let (count, bytes) = self.retransmit_packet(now, id, &remaining[pos..], Some(allowance));
            if count == 0 {
                break;
            }
            pos += count;
            allowance = allowance.saturating_sub(bytes);
        }
        self.rexmit_range = remaining.get(pos).map(|&(tsn, _, _)| (tsn, max));
        if self.rexmit_range.is_none() {
            trace!("slow-start 재전송 완료");
        }
    }

    /// T3 만료
    pub(crate) fn t3_expired(&mut self, now: Instant, id: PeerId) {
        if !self.state.can_transmit() {
            return;
        }
        self.abandon_expired(now);
        if self.state == AssocState::Closed {
            return;
        }
        let outstanding = self.outstanding_on(id);
        if outstanding.is_empty() {
            if self.outbound.has_unsent() {
                self.send_window_probe(now, id);
            }
            return;
        }

        if let Some(peer) = self.peers.get_mut(id) {
            peer.stats.timeouts += 1;
            peer.rto.backoff();
            peer.rxt_unacked = 0;
            debug!(
                "T3 만료: {} (미확인 {}개, rto={:?})",
                peer.addr,
                outstanding.len(),
                peer.rto.rto()
            );
        }
        if !self.strike(id) {
            return;
        }

        if self.zero_win_probe {
            // strike로 경로가 죽었으면 다른 살아 있는 주소로 probe
            let alive = self.peers.get(id).map_or(false, |p| p.is_alive());
            let to = if alive {
                id
            } else {
                self.peers.select_alternate(id)
            };
            if to != id {
                debug!("zero window probe 목적지 전환: {:?} → {:?}", id, to);
                self.peers.set_current(to);
            }
            self.stats.window_probes += 1;
            self.retransmit_packet(now, to, &outstanding[..1], None);
            return;
        }

        if let Some(peer) = self.peers.get_mut(id) {
            peer.cc.on_timeout(&mut peer.cwnd);
            peer.recovery_tsn = None;
        }

        if self.prsctp {
            self.check_adv_ack_pt(now);
            if tsn_gt(self.adv_ack_point, self.last_ack_rxd)
                && tsn_le(outstanding[0].0, self.adv_ack_point)
            {
                self.send_forward_tsn(now);
                let rto = self.peers.get(id).map(|p| p.rto.rto()).unwrap_or(self.config.rto_initial);
                self.timers.start(TimerKey::Retransmit(id), now + rto);
                return;
            }
        }

        let to = self.peers.rotate(
            self.config.failover_policy,
            id,
            self.config.failback_confirmations(),
        );
        if to != id {
            debug!("T3 failover: {:?} → {:?}", id, to);
        }
        self.peers.set_current(to);
        if self.rtt_sample.map_or(false, |s| s.peer == id) {
            self.rtt_sample = None;
        }

        let resend = self.resendable(outstanding);
        let (sent, _) = self.retransmit_packet(now, to, &resend, None);
        if sent < resend.len() {
            let last = resend[resend.len() - 1].0;
            self.rexmit_range = Some((resend[sent].0, last));
            if to != id {
                let rto = self.peers.get(id).map(|p| p.rto.rto()).unwrap_or(self.config.rto_initial);
                self.timers.start(TimerKey::Retransmit(id), now + rto);
            }
        }
    }

    /// zero window 상태에서 미전송 청크 하나를 probe로 전송
    fn send_window_probe(&mut self, now: Instant, id: PeerId) {
        let Some(&(key, idx, ..)) = self.unsent_candidates(0).first() else {
            return;
        };
        let Some(data) = self.mark_sent(now, key, idx, id) else {
            return;
        };
        let tsn = data.tsn;
        let chunk = Chunk::Data(data);
        let len = chunk.padded_len();
        self.stats.window_probes += 1;
        debug!("zero window probe: TSN {} → {:?}", tsn, id);
        if let Some(dest) = self.destination(id) {
            if let Err(e) = self.transmit(dest, self.peer_port, self.peer_tag, vec![chunk]) {
                self.output_error(id, &e);
            }
        }
        self.data_sent(now, id, Some(tsn), len);
    }
}
