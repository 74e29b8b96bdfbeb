//! 수신 엔진
//!
//! - DATA 수신: 중복 / 범위 / 윈도우 / 스트림 검사 후 ack 기록
//! - cumulative TSN과 gap block 유지
//! - 재조립 결과를 DataSink로 전달
//! - SACK 생성 (즉시 / 지연)

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::association::{AssocState, Association, PacketCtx};
use crate::chunk::{cause, Chunk, DataChunk, ErrorCause, SackChunk, MAX_DUP_TSNS, MAX_GAP_BLOCKS};
use crate::gapset::SackGapSet;
use crate::io::Delivery;
use crate::reassembly::Reassembly;
use crate::seq::tsn_le;
use crate::timer::TimerKey;
use crate::{CloseReason, Config};

/// association 수신 측 상태
#[derive(Debug)]
pub(crate) struct RecvState {
    /// 순서대로 받은 마지막 TSN
    pub cum_tsn: u32,
    pub gaps: SackGapSet,
    /// 다음 SACK에 보고할 중복 TSN
    pub dups: Vec<u32>,
    /// 마지막 SACK 이후 받은 데이터 패킷 수
    pub packets_unacked: u32,
    /// ack할 데이터가 있음
    pub ack_needed: bool,
    pub force_sack: bool,
    /// 수신 윈도우 (재조립 큐 포함 전체)
    pub rwnd: u32,
    pub reassembly: Reassembly,
}

impl RecvState {
    pub fn new(config: &Config) -> Self {
        Self {
            cum_tsn: 0,
            gaps: SackGapSet::new(),
            dups: Vec::new(),
            packets_unacked: 0,
            ack_needed: false,
            force_sack: false,
            rwnd: config.receive_window,
            reassembly: Reassembly::new(
                config.inbound_streams,
                config.partial_delivery_point,
                config.fragment_interleave,
            ),
        }
    }

    /// 피어 초기 TSN 기준으로 초기화
    pub fn reset(&mut self, cum: u32) {
        self.cum_tsn = cum;
        self.gaps = SackGapSet::new();
        self.dups.clear();
        self.packets_unacked = 0;
        self.ack_needed = false;
        self.force_sack = false;
    }

    pub fn sack_pending(&self) -> bool {
        self.ack_needed || self.force_sack || !self.dups.is_empty()
    }

    /// 광고할 수신 윈도우
    pub fn available(&self) -> u32 {
        self.rwnd
            .saturating_sub(self.reassembly.queued_bytes() as u32)
    }

    fn record_dup(&mut self, tsn: u32) {
        if self.dups.len() < MAX_DUP_TSNS {
            self.dups.push(tsn);
        }
        self.force_sack = true;
    }

    /// 다음 TSN이면 cumulative point 이동 후 인접 gap 흡수, 아니면 gap에 추가
    ///
    /// gap이 채워졌거나 새로 생겼으면 true (즉시 SACK 대상).
    pub fn record_tsn(&mut self, tsn: u32) -> bool {
        self.ack_needed = true;
        if tsn == self.cum_tsn.wrapping_add(1) {
            self.cum_tsn = tsn;
            match self.gaps.absorb(tsn) {
                Some(end) => {
                    self.cum_tsn = end;
                    true
                }
                None => false,
            }
        } else {
            self.gaps.insert(tsn);
            true
        }
    }
}

impl Association {
    /// DATA 청크 하나 수신
    pub(crate) fn process_data(&mut self, now: Instant, data: DataChunk, ctx: &mut PacketCtx) {
        ctx.got_data = true;
        self.stats.data_chunks_received += 1;
        let tsn = data.tsn;

        if data.payload.is_empty() {
            let mut info = BytesMut::with_capacity(4);
            info.put_u32(tsn);
            self.abort_violation(cause::NO_USER_DATA, info.freeze(), "payload 없는 DATA");
            ctx.stop = true;
            return;
        }

        let cum = self.recv.cum_tsn;
        if tsn_le(tsn, cum) || self.recv.gaps.contains(tsn) {
            trace!("중복 TSN {}", tsn);
            self.stats.duplicate_tsns += 1;
            self.recv.record_dup(tsn);
            return;
        }
        if tsn.wrapping_sub(cum) > u16::MAX as u32 {
            debug!("gap 오프셋 범위 밖 TSN {} (cum={}) 폐기", tsn, cum);
            return;
        }

        let len = data.payload.len() as u32;
        let available = self.recv.available();
        let next = tsn == cum.wrapping_add(1);
        if len > available && !(next && available > 0) {
            debug!(
                "수신 윈도우 부족: TSN {} 폐기 (len={}, 여유={})",
                tsn, len, available
            );
            self.recv.force_sack = true;
            return;
        }

        if let Some(id) = ctx.peer {
            self.peers.set_last_data_from(id);
        }
        self.last_activity = now;
        if self.recv.record_tsn(tsn) {
            self.recv.force_sack = true;
        }

        if data.stream >= self.recv.reassembly.stream_count() {
            debug!("잘못된 스트림 {} (TSN {}): ERROR 응답", data.stream, tsn);
            ctx.replies.push(Chunk::Error {
                causes: vec![ErrorCause::invalid_stream(data.stream)],
            });
        } else {
            trace!(
                "DATA TSN {} stream={} ssn={} len={} flags={:#04x}",
                tsn,
                data.stream,
                data.ssn,
                len,
                data.flags
            );
            match self.recv.reassembly.insert(data) {
                Ok(deliveries) => self.deliver(deliveries),
                Err(e) => {
                    self.abort_violation(
                        cause::PROTOCOL_VIOLATION,
                        Bytes::from(e.to_string()),
                        "재조립 실패",
                    );
                    ctx.stop = true;
                    return;
                }
            }
        }

        if self.state == AssocState::ShutdownSent {
            if self.shutdown_wait_exceeded(now) {
                debug!("SHUTDOWN-ACK 대기 한도 초과: ABORT");
                self.send_abort(Vec::new());
                self.fail(CloseReason::TimedOut);
                ctx.stop = true;
                return;
            }
            self.restart_shutdown_timer(now);
        }
    }

    /// 재조립 결과 전달
    ///
    /// 부분 전달이 끝나면 대기하던 다른 스트림을 다시 확인한다.
    pub(crate) fn deliver(&mut self, deliveries: Vec<Delivery>) {
        let mut finished_partial = false;
        for d in deliveries {
            finished_partial |= d.flags.partial && d.flags.eor;
            self.stats.bytes_delivered += d.data.len() as u64;
            self.io.data.deliver(d);
        }
        if finished_partial {
            match self.recv.reassembly.retry_all() {
                Ok(more) => self.deliver(more),
                Err(e) => debug!("대기 스트림 전달 실패: {}", e),
            }
        }
    }

    /// 데이터 패킷 처리 후 SACK 시점 결정
    pub(crate) fn ack_received_data(&mut self, now: Instant) {
        if !self.recv.sack_pending() {
            return;
        }
        self.recv.packets_unacked += 1;
        let immediate = self.recv.force_sack
            || self.state != AssocState::Established
            || self.recv.packets_unacked >= self.config.sack_frequency;
        if immediate {
            self.send_sack(now);
        } else {
            self.timers
                .start_if_idle(TimerKey::DelayedSack, now + self.config.sack_delay);
        }
    }

    /// SACK 단독 전송 (SHUTDOWN_SENT면 SHUTDOWN으로 대체)
    pub(crate) fn send_sack(&mut self, now: Instant) {
        if self.state == AssocState::ShutdownSent {
            self.send_shutdown(now);
            return;
        }
        let sack = self.build_sack();
        let dest = self.peers.last_data_from();
        self.send_chunks(dest, vec![sack]);
        self.sack_sent();
    }

    pub(crate) fn build_sack(&self) -> Chunk {
        let cum = self.recv.cum_tsn;
        let mut dups = self.recv.dups.clone();
        dups.truncate(MAX_DUP_TSNS);
        Chunk::Sack(SackChunk {
            cum_tsn: cum,
            a_rwnd: self.recv.available(),
            gaps: self.recv.gaps.to_offsets(cum, MAX_GAP_BLOCKS),
            dups,
        })
    }

    /// SACK (또는 SHUTDOWN) 전송 후 상태 정리
    pub(crate) fn sack_sent(&mut self) {
        self.recv.packets_unacked = 0;
        self.recv.ack_needed = false;
        self.recv.force_sack = false;
        self.recv.dups.clear();
        self.timers.stop(TimerKey::DelayedSack);
        self.stats.sacks_sent += 1;
    }
}
