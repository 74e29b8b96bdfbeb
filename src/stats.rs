//! association / 경로 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// RTT 샘플 윈도우 크기
const RTT_WINDOW: usize = 16;

/// 경로(피어 주소)별 통계
#[derive(Debug, Clone, Default)]
pub struct PathStats {
    /// 송신 패킷 수
    pub packets_sent: u64,

    /// 송신 바이트
    pub bytes_sent: u64,

    /// 이 경로로 재전송한 청크 수
    pub retransmitted_chunks: u64,

    /// T3 만료 횟수
    pub timeouts: u64,

    /// 전송한 heartbeat 수
    pub heartbeats_sent: u64,

    /// 받은 heartbeat-ack 수
    pub heartbeat_acks: u64,

    /// RTT 샘플 (마이크로초)
    rtt_samples: VecDeque<u64>,
}

impl PathStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 패킷 송신 기록
    pub fn record_send(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// RTT 샘플 기록
    pub fn record_rtt(&mut self, rtt: Duration) {
        if self.rtt_samples.len() >= RTT_WINDOW {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt.as_micros() as u64);
    }

    /// 평균 RTT 계산 (마이크로초)
    pub fn average_rtt_us(&self) -> Option<u64> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        Some(self.rtt_samples.iter().sum::<u64>() / self.rtt_samples.len() as u64)
    }

    /// 최근 윈도우의 최소 RTT (마이크로초)
    pub fn min_rtt_us(&self) -> Option<u64> {
        self.rtt_samples.iter().copied().min()
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.retransmitted_chunks as f64 / self.packets_sent as f64
    }
}

/// association 전체 통계
#[derive(Debug, Clone)]
pub struct AssocStats {
    /// 생성 시간
    pub start_time: Instant,

    pub packets_sent: u64,
    pub packets_received: u64,

    /// 검증 실패로 버린 패킷
    pub packets_dropped: u64,

    pub data_chunks_sent: u64,
    pub data_chunks_received: u64,

    /// 사용자 데이터 바이트 (재전송 제외)
    pub bytes_sent: u64,
    pub bytes_delivered: u64,

    /// T3 재전송 청크 수
    pub retransmitted_chunks: u64,

    /// fast retransmit 청크 수
    pub fast_retransmits: u64,

    /// 중복 수신 DATA
    pub duplicate_tsns: u64,

    pub sacks_sent: u64,
    pub sacks_received: u64,

    /// PR-SCTP로 포기한 메시지
    pub abandoned_messages: u64,

    pub forward_tsns_sent: u64,
    pub forward_tsns_received: u64,

    /// zero window probe 횟수
    pub window_probes: u64,
}

impl AssocStats {
    pub fn new(now: Instant) -> Self {
        Self {
            start_time: now,
            packets_sent: 0,
            packets_received: 0,
            packets_dropped: 0,
            data_chunks_sent: 0,
            data_chunks_received: 0,
            bytes_sent: 0,
            bytes_delivered: 0,
            retransmitted_chunks: 0,
            fast_retransmits: 0,
            duplicate_tsns: 0,
            sacks_sent: 0,
            sacks_received: 0,
            abandoned_messages: 0,
            forward_tsns_sent: 0,
            forward_tsns_received: 0,
            window_probes: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_time)
    }

    /// 재전송률 (전체 DATA 송신 대비)
    pub fn retransmit_rate(&self) -> f64 {
        if self.data_chunks_sent == 0 {
            return 0.0;
        }
        (self.retransmitted_chunks + self.fast_retransmits) as f64 / self.data_chunks_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self, now: Instant) -> String {
        format!(
            "Elapsed: {:.2}s | Packets: {}/{} | Data: {}/{} | Bytes: {}/{} | Rexmit: {:.2}% | Dups: {} | Abandoned: {}",
            self.elapsed(now).as_secs_f64(),
            self.packets_sent,
            self.packets_received,
            self.data_chunks_sent,
            self.data_chunks_received,
            self.bytes_sent,
            self.bytes_delivered,
            self.retransmit_rate() * 100.0,
            self.duplicate_tsns,
            self.abandoned_messages,
        )
    }
}

impl Default for AssocStats {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}
