//! 혼잡 제어
//!
//! 목적지별 cwnd 상태와 교체 가능한 알고리즘 trait.
//! 성장 조건(cumulative ack 전진, fast recovery 아님, 윈도우 가득 사용)은
//! 호출 측에서 판단하고, 알고리즘은 주어진 이벤트에 대해 cwnd만 조정한다.

use std::fmt;
use std::time::{Duration, Instant};

use crate::bbr::BbrLite;

/// RFC 초기 윈도우 상한에 쓰이는 값
const INITIAL_WINDOW_CAP: u32 = 4380;

/// 목적지별 혼잡 윈도우 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CwndState {
    pub cwnd: u32,
    pub ssthresh: u32,
    /// congestion avoidance 중 누적된 ack 바이트
    pub partial_bytes_acked: u32,
    pub mss: u32,
    /// 초기 cwnd (MSS 개수)
    pub initial_segments: u32,
    /// idle 이후 cwnd (MSS 개수)
    pub idle_segments: u32,
    pub max_cwnd: u32,
}

impl CwndState {
    pub fn new(mss: u32, initial_segments: u32, idle_segments: u32, max_cwnd: u32) -> Self {
        let mut state = Self {
            cwnd: 0,
            ssthresh: u32::MAX,
            partial_bytes_acked: 0,
            mss,
            initial_segments,
            idle_segments,
            max_cwnd,
        };
        state.cwnd = state.initial_window(initial_segments);
        state
    }

    /// min(n·mss, max(2·mss, 4380))
    pub fn initial_window(&self, segments: u32) -> u32 {
        let cap = (2 * self.mss).max(INITIAL_WINDOW_CAP);
        segments.saturating_mul(self.mss).min(cap).max(self.mss)
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd <= self.ssthresh
    }

    /// 손실 시 ssthresh 계산
    pub fn halve(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(2 * self.mss);
    }

    /// cwnd를 [mss, max_cwnd] 안으로
    pub fn clamp(&mut self) {
        let ceiling = self.max_cwnd.max(self.mss);
        self.cwnd = self.cwnd.clamp(self.mss, ceiling);
    }

    /// PMTU 변경 반영
    pub fn set_mss(&mut self, mss: u32) {
        self.mss = mss;
        self.clamp();
    }
}

/// 교체 가능한 혼잡 제어 알고리즘
pub trait CongestionControl: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    /// association 생성 또는 목적지 추가 시
    fn init(&mut self, cw: &mut CwndState);

    /// cwnd 성장 기회 (새로 cumulative ack된 바이트)
    fn on_ack(&mut self, cw: &mut CwndState, acked: u32, now: Instant);

    /// fast retransmit 손실 (recovery 구간당 1회)
    fn on_loss(&mut self, cw: &mut CwndState);

    /// T3 만료
    fn on_timeout(&mut self, cw: &mut CwndState);

    /// 출력 계층 back-pressure
    fn on_congestion(&mut self, cw: &mut CwndState) {
        self.on_loss(cw);
    }

    /// RTO 이상 idle 후 새 데이터 송신 직전
    fn after_idle(&mut self, cw: &mut CwndState);

    fn on_rtt_sample(&mut self, _cw: &mut CwndState, _rtt: Duration, _now: Instant) {}
}

/// 기본 알고리즘 (slow start + congestion avoidance)
#[derive(Debug, Default, Clone)]
pub struct NewReno;

impl CongestionControl for NewReno {
    fn name(&self) -> &'static str {
        "newreno"
    }

    fn init(&mut self, cw: &mut CwndState) {
        cw.cwnd = cw.initial_window(cw.initial_segments);
        cw.partial_bytes_acked = 0;
    }

    fn on_ack(&mut self, cw: &mut CwndState, acked: u32, _now: Instant) {
        if cw.in_slow_start() {
            cw.cwnd = cw.cwnd.saturating_add(acked.min(cw.mss));
        } else {
            cw.partial_bytes_acked = cw.partial_bytes_acked.saturating_add(acked);
            if cw.partial_bytes_acked >= cw.cwnd {
                cw.partial_bytes_acked -= cw.cwnd;
                cw.cwnd = cw.cwnd.saturating_add(cw.mss);
            }
        }
        cw.clamp();
    }

    fn on_loss(&mut self, cw: &mut CwndState) {
        cw.halve();
        cw.cwnd = cw.ssthresh;
        cw.partial_bytes_acked = 0;
        cw.clamp();
    }

    fn on_timeout(&mut self, cw: &mut CwndState) {
        cw.halve();
        cw.cwnd = cw.mss;
        cw.partial_bytes_acked = 0;
    }

    fn after_idle(&mut self, cw: &mut CwndState) {
        cw.cwnd = cw.initial_window(cw.idle_segments);
        cw.partial_bytes_acked = 0;
    }
}

/// 설정에서 선택하는 알고리즘
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionAlgorithm {
    #[default]
    NewReno,
    BbrLite,
}

impl CongestionAlgorithm {
    pub fn build(self) -> Box<dyn CongestionControl> {
        match self {
            CongestionAlgorithm::NewReno => Box::new(NewReno),
            CongestionAlgorithm::BbrLite => Box::new(BbrLite::new()),
        }
    }
}
