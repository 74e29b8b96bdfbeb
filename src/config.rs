//! association 설정

use std::time::Duration;

use crate::congestion::CongestionAlgorithm;
use crate::multipath::FailoverPolicy;
use crate::{Error, Result, DEFAULT_MTU};

/// association 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 경로 MTU를 알 수 없을 때 사용하는 초기값 (IP 헤더 포함)
    pub initial_mtu: u32,

    /// 초기 RTO
    pub rto_initial: Duration,

    /// RTO 하한
    pub rto_min: Duration,

    /// RTO 상한 (backoff 포함)
    pub rto_max: Duration,

    /// INIT / COOKIE-ECHO 최대 재전송 횟수
    pub max_init_retransmits: u32,

    /// association 전체 연속 실패 한도
    pub assoc_max_retransmits: u32,

    /// 피어 주소별 연속 실패 한도
    /// 초과 시 해당 주소는 DOWN
    pub path_max_retransmits: u32,

    /// heartbeat 기본 간격 (None이면 비활성)
    /// 실제 간격 = interval + RTO ± 50% jitter
    pub heartbeat_interval: Option<Duration>,

    /// state cookie 유효 시간
    pub cookie_lifetime: Duration,

    /// 지연 SACK 타이머
    pub sack_delay: Duration,

    /// N개 데이터 패킷마다 즉시 SACK
    pub sack_frequency: u32,

    /// 송신 기회당 최대 패킷 수
    pub max_burst: u32,

    /// 초기 cwnd (MSS 개수)
    pub slow_start_initial: u32,

    /// idle 이후 재시작 cwnd (MSS 개수)
    pub slow_start_after_idle: u32,

    /// cwnd 상한 (바이트)
    pub max_cwnd: u32,

    /// fast retransmit 임계값 (missing report 수)
    pub fast_retransmit_threshold: u8,

    /// Nagle 기준 크기 (바이트)
    pub nagle_limit: u32,

    /// Nagle 비활성화
    pub no_delay: bool,

    /// 수신 윈도우 (바이트)
    pub receive_window: u32,

    /// 송신 버퍼 (바이트)
    pub send_buffer: usize,

    /// 요청 송신 스트림 수
    pub outbound_streams: u16,

    /// 허용 수신 스트림 수
    pub inbound_streams: u16,

    /// 타임아웃 시 대체 주소 선택 정책
    pub failover_policy: FailoverPolicy,

    /// STICKY_PRIMARY 복귀에 필요한 연속 heartbeat-ack 수
    pub sticky_primary_confirmations: u32,

    /// PREFER_PRIMARY 복귀에 필요한 연속 heartbeat-ack 수
    pub prefer_primary_confirmations: u32,

    /// PR-SCTP 지원 광고
    pub partial_reliability: bool,

    /// 부분 전달 시작 크기 (None이면 부분 전달 안 함)
    pub partial_delivery_point: Option<usize>,

    /// 여러 스트림의 부분 전달 동시 진행 허용
    pub fragment_interleave: bool,

    /// SHUTDOWN 전송 후 SHUTDOWN-ACK 대기 한도
    pub shutdown_ack_wait_bound: Option<Duration>,

    /// 데이터 송수신이 없으면 자동 종료
    pub autoclose: Option<Duration>,

    /// 혼잡 제어 알고리즘
    pub congestion: CongestionAlgorithm,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_mtu: DEFAULT_MTU,
            rto_initial: Duration::from_secs(3),
            rto_min: Duration::from_secs(1),
            rto_max: Duration::from_secs(60),
            max_init_retransmits: 8,
            assoc_max_retransmits: 10,
            path_max_retransmits: 5,
            heartbeat_interval: Some(Duration::from_secs(30)),
            cookie_lifetime: Duration::from_secs(60),
            sack_delay: Duration::from_millis(100),
            sack_frequency: 2,
            max_burst: 4,
            slow_start_initial: 4,
            slow_start_after_idle: 4,
            max_cwnd: 16 * 1024 * 1024,    // 16MB
            fast_retransmit_threshold: 3,
            nagle_limit: 4096,
            no_delay: false,
            receive_window: 128 * 1024,    // 128KB
            send_buffer: 1024 * 1024,      // 1MB
            outbound_streams: 32,
            inbound_streams: 32,
            failover_policy: FailoverPolicy::Rotate,
            sticky_primary_confirmations: 1,
            prefer_primary_confirmations: 3,
            partial_reliability: true,
            partial_delivery_point: None,
            fragment_interleave: false,
            shutdown_ack_wait_bound: Some(Duration::from_secs(60)),
            autoclose: None,
            congestion: CongestionAlgorithm::NewReno,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.rto_min > self.rto_max {
            return Err(Error::InvalidConfig("rto_min > rto_max".into()));
        }
        if self.rto_initial < self.rto_min || self.rto_initial > self.rto_max {
            return Err(Error::InvalidConfig("rto_initial이 [rto_min, rto_max] 밖".into()));
        }
        if self.initial_mtu < crate::MIN_MTU {
            return Err(Error::InvalidConfig(format!(
                "initial_mtu {} < {}",
                self.initial_mtu,
                crate::MIN_MTU
            )));
        }
        if self.outbound_streams == 0 || self.inbound_streams == 0 {
            return Err(Error::InvalidConfig("스트림 수는 1 이상".into()));
        }
        if self.fast_retransmit_threshold == 0 {
            return Err(Error::InvalidConfig("fast_retransmit_threshold는 1 이상".into()));
        }
        if self.sack_frequency == 0 || self.max_burst == 0 {
            return Err(Error::InvalidConfig("sack_frequency/max_burst는 1 이상".into()));
        }
        Ok(())
    }

    /// 현재 정책의 primary 복귀 확인 횟수
    pub fn failback_confirmations(&self) -> u32 {
        match self.failover_policy {
            FailoverPolicy::Rotate => 0,
            FailoverPolicy::StickyPrimary => self.sticky_primary_confirmations,
            FailoverPolicy::PreferPrimary => self.prefer_primary_confirmations,
        }
    }

    /// 저지연 환경용 설정 (데이터센터, LAN)
    pub fn low_latency() -> Self {
        Self {
            rto_initial: Duration::from_millis(300),
            rto_min: Duration::from_millis(100),
            rto_max: Duration::from_secs(5),
            heartbeat_interval: Some(Duration::from_secs(5)),
            sack_delay: Duration::from_millis(20),
            sack_frequency: 1,
            no_delay: true,
            ..Self::default()
        }
    }

    /// 고성능 전송용 설정
    pub fn high_performance() -> Self {
        Self {
            slow_start_initial: 10,
            slow_start_after_idle: 10,
            max_burst: 16,
            receive_window: 4 * 1024 * 1024,    // 4MB
            send_buffer: 8 * 1024 * 1024,       // 8MB
            max_cwnd: 64 * 1024 * 1024,
            partial_delivery_point: Some(64 * 1024),
            congestion: CongestionAlgorithm::BbrLite,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            rto_initial: Duration::from_secs(3),
            rto_min: Duration::from_secs(1),
            rto_max: Duration::from_secs(120),
            max_init_retransmits: 12,
            assoc_max_retransmits: 20,
            path_max_retransmits: 8,
            heartbeat_interval: Some(Duration::from_secs(10)),
            failover_policy: FailoverPolicy::PreferPrimary,
            prefer_primary_confirmations: 5,
            initial_mtu: 1280,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::low_latency().validate().is_ok());
        assert!(Config::high_performance().validate().is_ok());
        assert!(Config::unstable_network().validate().is_ok());
    }

    #[test]
    fn test_invalid_rto_range() {
        let config = Config {
            rto_min: Duration::from_secs(10),
            rto_max: Duration::from_secs(1),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_failback_confirmations() {
        let mut config = Config::default();
        assert_eq!(config.failback_confirmations(), 0);
        config.failover_policy = FailoverPolicy::PreferPrimary;
        assert_eq!(config.failback_confirmations(), 3);
    }
}
