//! BBR-lite 혼잡 제어
//!
//! 병목 대역폭과 최소 RTT를 추정해 cwnd = gain × BDP 로 맞춘다.
//! 추정치가 생기기 전에는 slow start처럼 동작한다.

use std::time::{Duration, Instant};

use crate::congestion::{CongestionControl, CwndState};

#[derive(Debug)]
pub struct BbrLite {
    pub btl_bw: f64,        // bytes/sec
    pub min_rtt: Option<Duration>,
    pub last_rtt: Option<Duration>,
    pub delivered_bytes: u64,
    pub delivered_prev: u64,
    pub last_ts: Option<Instant>,

    // parameters
    pub gain: f64,
    pub probe_interval: Duration,
}

impl Default for BbrLite {
    fn default() -> Self {
        Self::new()
    }
}

impl BbrLite {
    pub fn new() -> Self {
        Self {
            btl_bw: 0.0,
            min_rtt: None,
            last_rtt: None,
            delivered_bytes: 0,
            delivered_prev: 0,
            last_ts: None,

            gain: 2.0,
            probe_interval: Duration::from_millis(200),
        }
    }

    /// 대역폭 추정 갱신 (probe_interval마다)
    fn update_rate(&mut self, now: Instant) -> bool {
        let Some(last) = self.last_ts else {
            self.last_ts = Some(now);
            return false;
        };
        let dt = now.saturating_duration_since(last);
        if dt < self.probe_interval {
            return false; // 아직 갱신할 때 아님
        }

        let delivered = self.delivered_bytes - self.delivered_prev;
        let delivery_rate = delivered as f64 / dt.as_secs_f64();
        self.delivered_prev = self.delivered_bytes;
        self.last_ts = Some(now);

        // 큐가 쌓이면 (last_rtt > min_rtt) gain을 줄인다
        if let (Some(min), Some(last)) = (self.min_rtt, self.last_rtt) {
            let queue_ratio = last.as_secs_f64() / min.as_secs_f64().max(0.000_001);
            self.gain = (2.0 * (-(queue_ratio - 1.0)).exp()).clamp(1.0, 2.0);
        }

        // 최대값 필터, 오래된 추정은 서서히 감쇠
        self.btl_bw = delivery_rate.max(self.btl_bw * 0.9);
        true
    }

    /// bandwidth-delay product (바이트)
    pub fn bdp(&self) -> Option<u32> {
        let min_rtt = self.min_rtt?;
        if self.btl_bw <= 0.0 {
            return None;
        }
        Some((self.btl_bw * min_rtt.as_secs_f64()) as u32)
    }

    fn target_cwnd(&self, cw: &CwndState) -> Option<u32> {
        self.bdp()
            .map(|bdp| ((bdp as f64 * self.gain) as u32).max(4 * cw.mss))
    }
}

impl CongestionControl for BbrLite {
    fn name(&self) -> &'static str {
        "bbr-lite"
    }

    fn init(&mut self, cw: &mut CwndState) {
        cw.cwnd = cw.initial_window(cw.initial_segments);
        cw.partial_bytes_acked = 0;
    }

    fn on_ack(&mut self, cw: &mut CwndState, acked: u32, now: Instant) {
        self.delivered_bytes += acked as u64;
        self.update_rate(now);

        match self.target_cwnd(cw) {
            Some(target) => cw.cwnd = target,
            None => cw.cwnd = cw.cwnd.saturating_add(acked.min(cw.mss)),
        }
        cw.clamp();
    }

    fn on_loss(&mut self, cw: &mut CwndState) {
        cw.halve();
        cw.cwnd = match self.target_cwnd(cw) {
            Some(target) => target.min(cw.cwnd),
            None => cw.ssthresh,
        };
        cw.clamp();
    }

    fn on_timeout(&mut self, cw: &mut CwndState) {
        cw.halve();
        cw.cwnd = cw.mss;
        self.btl_bw *= 0.5;
    }

    fn after_idle(&mut self, cw: &mut CwndState) {
        cw.cwnd = match self.target_cwnd(cw) {
            Some(target) => target,
            None => cw.initial_window(cw.idle_segments),
        };
        cw.clamp();
    }

    fn on_rtt_sample(&mut self, _cw: &mut CwndState, rtt: Duration, _now: Instant) {
        self.last_rtt = Some(rtt);
        if self.min_rtt.map_or(true, |min| rtt < min) {
            self.min_rtt = Some(rtt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1452;

    #[test]
    fn test_slow_start_without_estimate() {
        let mut bbr = BbrLite::new();
        let mut cw = CwndState::new(MSS, 4, 4, 16 * 1024 * 1024);
        let before = cw.cwnd;
        bbr.on_ack(&mut cw, MSS, Instant::now());
        assert_eq!(cw.cwnd, before + MSS);
    }

    #[test]
    fn test_cwnd_follows_bdp() {
        let mut bbr = BbrLite::new();
        let mut cw = CwndState::new(MSS, 4, 4, 64 * 1024 * 1024);
        let start = Instant::now();
        bbr.on_rtt_sample(&mut cw, Duration::from_millis(50), start);
        bbr.on_ack(&mut cw, MSS, start);

        // 200ms 동안 1MB 전달 → 5MB/s, BDP = 250KB
        bbr.on_ack(&mut cw, 1_000_000, start + Duration::from_millis(200));
        let bdp = bbr.bdp().unwrap();
        assert!((240_000..=260_000).contains(&bdp), "bdp {bdp}");
        assert!(cw.cwnd >= bdp);
        assert!(cw.cwnd >= 4 * MSS);
    }

    #[test]
    fn test_queue_growth_reduces_gain() {
        let mut bbr = BbrLite::new();
        let mut cw = CwndState::new(MSS, 4, 4, 64 * 1024 * 1024);
        let start = Instant::now();
        bbr.on_rtt_sample(&mut cw, Duration::from_millis(20), start);
        bbr.on_ack(&mut cw, MSS, start);
        bbr.on_rtt_sample(&mut cw, Duration::from_millis(60), start);
        bbr.on_ack(&mut cw, 100_000, start + Duration::from_millis(250));
        assert!(bbr.gain < 2.0);
        assert!(bbr.gain >= 1.0);
    }

    #[test]
    fn test_timeout_collapses_window() {
        let mut bbr = BbrLite::new();
        let mut cw = CwndState::new(MSS, 4, 4, 16 * 1024 * 1024);
        cw.cwnd = 50 * MSS;
        bbr.on_timeout(&mut cw);
        assert_eq!(cw.cwnd, MSS);
        assert_eq!(cw.ssthresh, 25 * MSS);
    }
}
