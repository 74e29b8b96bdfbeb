//! 멀티호밍 피어 주소 관리
//!
//! 피어 주소별 liveness 상태, RTT/RTO 추정, PMTU, 혼잡 상태와
//! 타임아웃 시 대체 목적지 선택(failover 정책)을 담당한다.
//! liveness 전환에 따른 이벤트/타이머 처리는 association 쪽에서 한다.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use rand::Rng;
use slab::Slab;

use crate::chunk::COMMON_HEADER_LEN;
use crate::congestion::{CongestionControl, CwndState};
use crate::stats::PathStats;
use crate::Config;

const IPV4_HEADER_LEN: u32 = 20;
const IPV6_HEADER_LEN: u32 = 40;

/// 피어 주소 핸들 (association 내부에서만 유효)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub(crate) usize);

/// 피어 주소 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// 아직 heartbeat-ack / 핸드쉐이크로 확인되지 않음
    Unconfirmed,
    Alive,
    /// strike 한도 초과
    Down,
    /// 경로 해석 실패
    Unreachable,
}

/// 타임아웃 시 대체 목적지 선택 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailoverPolicy {
    /// 항상 다음 주소로
    #[default]
    Rotate,
    /// primary가 살아 있는 동안 유지
    StickyPrimary,
    /// 전환하되 primary 복귀를 준비
    PreferPrimary,
}

/// RTT/RTO 추정기 (마이크로초 정수 연산)
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt_us: Option<u64>,
    rttvar_us: u64,
    rto_us: u64,
    initial_us: u64,
    min_us: u64,
    max_us: u64,
}

impl RtoEstimator {
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        let initial_us = initial.as_micros() as u64;
        Self {
            srtt_us: None,
            rttvar_us: 0,
            rto_us: initial_us,
            initial_us,
            min_us: min.as_micros() as u64,
            max_us: max.as_micros() as u64,
        }
    }

    pub fn rto(&self) -> Duration {
        Duration::from_micros(self.rto_us)
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt_us.map(Duration::from_micros)
    }

    pub fn rttvar(&self) -> Duration {
        Duration::from_micros(self.rttvar_us)
    }

    /// RTT 샘플 반영
    pub fn sample(&mut self, rtt: Duration) {
        let r = rtt.as_micros() as u64;
        match self.srtt_us {
            None => {
                self.srtt_us = Some(r);
                self.rttvar_us = r / 2;
            }
            Some(srtt) => {
                self.rttvar_us = (3 * self.rttvar_us + srtt.abs_diff(r)) / 4;
                self.srtt_us = Some((7 * srtt + r) / 8);
            }
        }
        self.recompute();
    }

    /// backoff 해제 (srtt 기반 재계산)
    pub fn recompute(&mut self) {
        self.rto_us = match self.srtt_us {
            Some(srtt) => (srtt + 4 * self.rttvar_us).clamp(self.min_us, self.max_us),
            None => self.initial_us,
        };
    }

    /// 지수 backoff (상한 rto_max)
    pub fn backoff(&mut self) {
        self.rto_us = (self.rto_us * 2).min(self.max_us);
    }

    /// 초기값으로 (srtt 미확정)
    pub fn reset(&mut self) {
        self.srtt_us = None;
        self.rttvar_us = 0;
        self.rto_us = self.initial_us;
    }
}

/// 경로 해석 결과에서 MSS 계산
pub fn mss_for(addr: &SocketAddr, pmtu: u32) -> u32 {
    let ip = if addr.is_ipv4() {
        IPV4_HEADER_LEN
    } else {
        IPV6_HEADER_LEN
    };
    pmtu.saturating_sub(ip + COMMON_HEADER_LEN as u32)
}

/// 피어 주소
#[derive(Debug)]
pub struct PeerAddress {
    pub id: PeerId,

    /// 목적지 주소
    pub addr: SocketAddr,

    pub state: PeerState,

    pub rto: RtoEstimator,

    pub cwnd: CwndState,

    /// 혼잡 제어 알고리즘 (목적지별 교체 가능)
    pub cc: Box<dyn CongestionControl>,

    pub pmtu: u32,

    /// pmtu - IP 헤더 - 공통 헤더
    pub pmss: u32,

    /// 연속 실패 횟수
    pub strikes: u32,

    /// 응답 대기 중인 heartbeat
    pub hb_pending: bool,
    pub hb_nonce: u64,
    pub hb_sent_at: Option<Instant>,

    /// 해석된 로컬 소스 주소
    pub source: Option<IpAddr>,

    /// primary 복귀까지 남은 heartbeat-ack 수 (0이면 비활성)
    pub chk_cnt: u32,

    /// 마지막으로 ack/heartbeat-ack를 받았거나 데이터를 보낸 시간
    pub lastactive: Instant,

    /// 이 목적지로 전송되어 ack되지 않은 바이트
    pub flight: u32,

    /// T3 이후 재전송했지만 ack되지 않은 바이트 추정
    pub rxt_unacked: u32,

    /// fast recovery 종료 TSN
    pub recovery_tsn: Option<u32>,

    /// 마지막 데이터 패킷 크기 (Nagle)
    pub last_sent_len: u32,

    pub stats: PathStats,
}

impl PeerAddress {
    fn new(id: PeerId, addr: SocketAddr, config: &Config, now: Instant) -> Self {
        let pmtu = config.initial_mtu;
        let pmss = mss_for(&addr, pmtu);
        let mut cwnd = CwndState::new(
            pmss,
            config.slow_start_initial,
            config.slow_start_after_idle,
            config.max_cwnd,
        );
        let mut cc = config.congestion.build();
        cc.init(&mut cwnd);
        Self {
            id,
            addr,
            state: PeerState::Unconfirmed,
            rto: RtoEstimator::new(config.rto_initial, config.rto_min, config.rto_max),
            cwnd,
            cc,
            pmtu,
            pmss,
            strikes: 0,
            hb_pending: false,
            hb_nonce: 0,
            hb_sent_at: None,
            source: None,
            chk_cnt: 0,
            lastactive: now,
            flight: 0,
            rxt_unacked: 0,
            recovery_tsn: None,
            last_sent_len: 0,
            stats: PathStats::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == PeerState::Alive
    }

    /// PMTU 변경 반영
    pub fn set_pmtu(&mut self, pmtu: u32) {
        self.pmtu = pmtu;
        self.pmss = mss_for(&self.addr, pmtu);
        self.cwnd.set_mss(self.pmss);
    }

    /// 혼잡 제어 알고리즘 교체
    pub fn set_congestion_control(&mut self, mut cc: Box<dyn CongestionControl>) {
        cc.init(&mut self.cwnd);
        self.cc = cc;
    }

    /// 다음 heartbeat까지 대기 시간: interval + RTO ± RTO/2
    pub fn heartbeat_delay(&self, interval: Duration) -> Duration {
        let rto_us = self.rto.rto().as_micros() as u64;
        let jitter = rand::thread_rng().gen_range(0..=rto_us);
        interval + Duration::from_micros(rto_us / 2 + jitter)
    }
}

/// association의 피어 주소 집합
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: Slab<PeerAddress>,
    primary: Option<PeerId>,
    current: Option<PeerId>,
    last_data_from: Option<PeerId>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 주소 추가 (이미 있으면 기존 ID)
    ///
    /// 첫 주소는 primary이자 current가 된다.
    pub fn add(&mut self, addr: SocketAddr, config: &Config, now: Instant) -> PeerId {
        if let Some(id) = self.find(&addr) {
            return id;
        }
        let entry = self.peers.vacant_entry();
        let id = PeerId(entry.key());
        entry.insert(PeerAddress::new(id, addr, config, now));
        if self.primary.is_none() {
            self.primary = Some(id);
            self.current = Some(id);
        }
        id
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerAddress> {
        self.peers.get(id.0)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerAddress> {
        self.peers.get_mut(id.0)
    }

    pub fn find(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(_, p)| p.addr == *addr)
            .map(|(key, _)| PeerId(key))
    }

    /// 등록 순서대로
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|(key, _)| PeerId(key)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerAddress> {
        self.peers.iter().map(|(_, p)| p)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerAddress> {
        self.peers.iter_mut().map(|(_, p)| p)
    }

    pub fn primary(&self) -> Option<PeerId> {
        self.primary
    }

    pub fn set_primary(&mut self, id: PeerId) {
        if self.peers.contains(id.0) {
            self.primary = Some(id);
        }
    }

    /// 현재 데이터 목적지
    pub fn current(&self) -> Option<PeerId> {
        self.current
    }

    pub fn set_current(&mut self, id: PeerId) {
        if self.peers.contains(id.0) {
            self.current = Some(id);
        }
    }

    /// 마지막으로 DATA를 보내온 주소 (SACK 목적지)
    pub fn last_data_from(&self) -> Option<PeerId> {
        self.last_data_from.or(self.current)
    }

    pub fn set_last_data_from(&mut self, id: PeerId) {
        self.last_data_from = Some(id);
    }

    pub fn alive_count(&self) -> usize {
        self.iter().filter(|p| p.is_alive()).count()
    }

    /// 가장 작은 경로 MSS
    pub fn min_mss(&self) -> Option<u32> {
        self.iter().map(|p| p.pmss).min()
    }

    /// `from` 다음 순서의 대체 주소
    ///
    /// strike 0인 살아 있는 주소 우선, 없으면 strike가 가장 적은 살아 있는 주소,
    /// 그것도 없으면 `from` 그대로.
    pub fn select_alternate(&self, from: PeerId) -> PeerId {
        let ids = self.ids();
        let start = ids.iter().position(|&id| id == from).unwrap_or(0);
        let candidates = ids
            .iter()
            .cycle()
            .skip(start + 1)
            .take(ids.len().saturating_sub(1))
            .filter_map(|&id| self.get(id))
            .filter(|p| p.id != from && p.is_alive());

        let mut fewest: Option<&PeerAddress> = None;
        for peer in candidates {
            if peer.strikes == 0 {
                return peer.id;
            }
            if fewest.map_or(true, |f| peer.strikes < f.strikes) {
                fewest = Some(peer);
            }
        }
        fewest.map_or(from, |p| p.id)
    }

    /// T3 만료 시 다음 목적지 결정
    ///
    /// 복귀 확인이 필요한 정책이면 primary의 chk_cnt를 설정한다.
    pub fn rotate(&mut self, policy: FailoverPolicy, from: PeerId, confirmations: u32) -> PeerId {
        let primary = self.primary;
        match policy {
            FailoverPolicy::Rotate => self.select_alternate(from),
            FailoverPolicy::StickyPrimary => {
                if let Some(p) = primary.and_then(|id| self.get(id)) {
                    if p.is_alive() {
                        return p.id;
                    }
                }
                self.arm_failback(confirmations);
                self.select_alternate(from)
            }
            FailoverPolicy::PreferPrimary => {
                self.arm_failback(confirmations);
                self.select_alternate(from)
            }
        }
    }

    /// primary 복귀 확인 카운터 설정
    pub fn arm_failback(&mut self, confirmations: u32) {
        if let Some(p) = self.primary.and_then(|id| self.peers.get_mut(id.0)) {
            p.chk_cnt = confirmations;
        }
    }

    /// primary에서 heartbeat-ack 수신 시 복귀 카운트 진행
    ///
    /// 카운터가 0에 도달해 current가 primary로 돌아오면 true.
    pub fn confirm_primary(&mut self, id: PeerId) -> bool {
        if self.primary != Some(id) {
            return false;
        }
        let Some(peer) = self.peers.get_mut(id.0) else {
            return false;
        };
        if peer.chk_cnt == 0 {
            return false;
        }
        peer.chk_cnt -= 1;
        if peer.chk_cnt == 0 && peer.is_alive() {
            self.current = Some(id);
            return true;
        }
        false
    }
}
