//! association 상태 머신
//!
//! 패킷 하나를 받으면 포트와 verification tag를 검사한 뒤 청크를 순서대로
//! 현재 상태의 규칙에 따라 분배한다. 핸드쉐이크(state cookie), 종료 시퀀스,
//! 주소 liveness, 타이머 만료 처리가 여기 있다.
//! 송신/수신/재전송/PR-SCTP 처리는 같은 구조체에 대한 impl 블록으로
//! `sender`, `receiver`, `retransmit`, `prsctp` 모듈에 나뉘어 있다.
//!
//! 모든 동작은 호출자가 넘겨주는 `now`를 기준으로 하므로 시간 의존 없이
//! 결정적으로 구동할 수 있다. 실제 타이머 sleep은 `runtime`이 담당한다.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::chunk::{cause, param, Chunk, ErrorCause, InitChunk, Packet, UnknownAction};
use crate::gapset::SackGapSet;
use crate::io::{AddressChange, Collaborators, Destination, Notification};
use crate::message::OutboundQueue;
use crate::multipath::{PeerId, PeerSet, PeerState};
use crate::receiver::RecvState;
use crate::retransmit::RttSample;
use crate::stats::AssocStats;
use crate::timer::{TimerKey, TimerToken, TimerUpdate, Timers};
use crate::{CloseReason, Config, Error, Result, MIN_MTU};

/// association 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssocState {
    Idle,
    Bound,
    Listen,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
    Closed,
}

impl AssocState {
    pub fn name(self) -> &'static str {
        match self {
            AssocState::Idle => "IDLE",
            AssocState::Bound => "BOUND",
            AssocState::Listen => "LISTEN",
            AssocState::CookieWait => "COOKIE_WAIT",
            AssocState::CookieEchoed => "COOKIE_ECHOED",
            AssocState::Established => "ESTABLISHED",
            AssocState::ShutdownPending => "SHUTDOWN_PENDING",
            AssocState::ShutdownSent => "SHUTDOWN_SENT",
            AssocState::ShutdownReceived => "SHUTDOWN_RECEIVED",
            AssocState::ShutdownAckSent => "SHUTDOWN_ACK_SENT",
            AssocState::Closed => "CLOSED",
        }
    }

    /// DATA 수신 가능
    pub fn accepts_data(self) -> bool {
        matches!(
            self,
            AssocState::Established | AssocState::ShutdownPending | AssocState::ShutdownSent
        )
    }

    /// 데이터 송신(신규/재전송) 가능
    pub fn can_transmit(self) -> bool {
        matches!(
            self,
            AssocState::Established | AssocState::ShutdownPending | AssocState::ShutdownReceived
        )
    }

    /// 핸드쉐이크 완료 후 종료 완료 전
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            AssocState::Established
                | AssocState::ShutdownPending
                | AssocState::ShutdownSent
                | AssocState::ShutdownReceived
        )
    }

    pub fn is_handshaking(self) -> bool {
        matches!(self, AssocState::CookieWait | AssocState::CookieEchoed)
    }
}

impl fmt::Display for AssocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 수신 패킷 하나를 처리하는 동안의 누적 상태
#[derive(Debug)]
pub(crate) struct PacketCtx {
    pub from: SocketAddr,
    pub src_port: u16,
    pub vtag: u32,
    pub peer: Option<PeerId>,

    /// DATA / FORWARD-TSN 수신 (SACK 판단 필요)
    pub got_data: bool,

    /// 윈도우나 cumulative ack 변화로 송신 기회 발생
    pub trysend: bool,

    /// HEARTBEAT는 패킷당 한 번만 응답
    pub hb_answered: bool,

    /// 같은 패킷으로 돌려보낼 응답 청크
    pub replies: Vec<Chunk>,

    /// 남은 청크 처리 중단
    pub stop: bool,
}

impl PacketCtx {
    fn new(from: SocketAddr, src_port: u16, vtag: u32, peer: Option<PeerId>) -> Self {
        Self {
            from,
            src_port,
            vtag,
            peer,
            got_data: false,
            trysend: false,
            hb_answered: false,
            replies: Vec::new(),
            stop: false,
        }
    }
}

/// state cookie 고정부 길이
const COOKIE_FIXED_LEN: usize = 36;
const COOKIE_DIGEST_LEN: usize = 4;

/// state cookie에 담는 협상 결과
///
/// 리스너는 INIT에 대한 상태를 저장하지 않고 이 값을 INIT-ACK에 실어 보낸다.
/// 위변조 검사는 키가 섞인 CRC32 digest로 한다 (암호학적 MAC 아님).
#[derive(Debug, Clone, PartialEq, Eq)]
struct StateCookie {
    peer_tag: u32,
    local_tag: u32,
    peer_initial_tsn: u32,
    local_initial_tsn: u32,
    peer_rwnd: u32,
    peer_outbound: u16,
    peer_inbound: u16,
    forward_tsn: bool,
    /// association epoch 기준 생성 시각 (마이크로초)
    created_us: u64,
    addresses: Vec<IpAddr>,
}

fn cookie_digest(key: u64, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key.to_be_bytes());
    hasher.update(body);
    hasher.update(&key.rotate_left(32).to_be_bytes());
    hasher.finalize()
}

impl StateCookie {
    fn seal(&self, key: u64) -> Bytes {
        let addrs = self.addresses.len().min(u8::MAX as usize);
        let mut buf = BytesMut::with_capacity(COOKIE_FIXED_LEN + addrs * 17 + COOKIE_DIGEST_LEN);
        buf.put_u32(self.peer_tag);
        buf.put_u32(self.local_tag);
        buf.put_u32(self.peer_initial_tsn);
        buf.put_u32(self.local_initial_tsn);
        buf.put_u32(self.peer_rwnd);
        buf.put_u16(self.peer_outbound);
        buf.put_u16(self.peer_inbound);
        buf.put_u8(self.forward_tsn as u8);
        buf.put_u8(addrs as u8);
        buf.put_u16(0);
        buf.put_u64(self.created_us);
        for addr in self.addresses.iter().take(addrs) {
            match addr {
                IpAddr::V4(v4) => {
                    buf.put_u8(4);
                    buf.put_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    buf.put_u8(6);
                    buf.put_slice(&v6.octets());
                }
            }
        }
        let digest = cookie_digest(key, &buf);
        buf.put_u32(digest);
        buf.freeze()
    }

    /// digest 검사 후 복원 (실패 시 None)
    fn open(raw: &[u8], key: u64) -> Option<Self> {
        if raw.len() < COOKIE_FIXED_LEN + COOKIE_DIGEST_LEN {
            return None;
        }
        let (body, tail) = raw.split_at(raw.len() - COOKIE_DIGEST_LEN);
        let digest = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
        if cookie_digest(key, body) != digest {
            return None;
        }

        let mut buf = body;
        let peer_tag = buf.get_u32();
        let local_tag = buf.get_u32();
        let peer_initial_tsn = buf.get_u32();
        let local_initial_tsn = buf.get_u32();
        let peer_rwnd = buf.get_u32();
        let peer_outbound = buf.get_u16();
        let peer_inbound = buf.get_u16();
        let forward_tsn = buf.get_u8() != 0;
        let count = buf.get_u8();
        buf.advance(2);
        let created_us = buf.get_u64();

        let mut addresses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if !buf.has_remaining() {
                return None;
            }
            match buf.get_u8() {
                4 if buf.remaining() >= 4 => {
                    let mut octets = [0u8; 4];
                    buf.copy_to_slice(&mut octets);
                    addresses.push(IpAddr::from(octets));
                }
                6 if buf.remaining() >= 16 => {
                    let mut octets = [0u8; 16];
                    buf.copy_to_slice(&mut octets);
                    addresses.push(IpAddr::from(octets));
                }
                _ => return None,
            }
        }

        Some(Self {
            peer_tag,
            local_tag,
            peer_initial_tsn,
            local_initial_tsn,
            peer_rwnd,
            peer_outbound,
            peer_inbound,
            forward_tsn,
            created_us,
            addresses,
        })
    }
}

/// 피어가 INIT / INIT-ACK (또는 cookie)로 알려준 값
struct PeerParams {
    tag: u32,
    initial_tsn: u32,
    rwnd: u32,
    outbound: u16,
    inbound: u16,
    forward_tsn: bool,
}

impl From<&InitChunk> for PeerParams {
    fn from(init: &InitChunk) -> Self {
        Self {
            tag: init.initiate_tag,
            initial_tsn: init.initial_tsn,
            rwnd: init.a_rwnd,
            outbound: init.outbound_streams,
            inbound: init.inbound_streams,
            forward_tsn: init.forward_tsn_supported,
        }
    }
}

impl From<&StateCookie> for PeerParams {
    fn from(cookie: &StateCookie) -> Self {
        Self {
            tag: cookie.peer_tag,
            initial_tsn: cookie.peer_initial_tsn,
            rwnd: cookie.peer_rwnd,
            outbound: cookie.peer_outbound,
            inbound: cookie.peer_inbound,
            forward_tsn: cookie.forward_tsn,
        }
    }
}

/// heartbeat info: nonce(8) + 송신 시각(8) + 목적지 주소
fn encode_hb_info(nonce: u64, sent_us: u64, addr: SocketAddr) -> Bytes {
    let mut buf = BytesMut::with_capacity(35);
    buf.put_u64(nonce);
    buf.put_u64(sent_us);
    buf.put_u16(addr.port());
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.octets());
        }
    }
    buf.freeze()
}

fn decode_hb_info(mut info: &[u8]) -> Option<(u64, SocketAddr)> {
    if info.remaining() < 19 {
        return None;
    }
    let nonce = info.get_u64();
    let _sent_us = info.get_u64();
    let port = info.get_u16();
    let ip = match info.get_u8() {
        4 if info.remaining() >= 4 => {
            let mut octets = [0u8; 4];
            info.copy_to_slice(&mut octets);
            IpAddr::from(octets)
        }
        6 if info.remaining() >= 16 => {
            let mut octets = [0u8; 16];
            info.copy_to_slice(&mut octets);
            IpAddr::from(octets)
        }
        _ => return None,
    };
    Some((nonce, SocketAddr::new(ip, port)))
}

fn random_tag() -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let tag: u32 = rng.gen();
        if tag != 0 {
            return tag;
        }
    }
}

/// association 하나의 프로토콜 엔진
pub struct Association {
    pub(crate) config: Config,
    pub(crate) io: Collaborators,
    pub(crate) state: AssocState,

    /// cookie / heartbeat 시각 기준
    pub(crate) epoch: Instant,

    pub(crate) local_port: u16,
    pub(crate) peer_port: u16,
    pub(crate) local_addrs: Vec<IpAddr>,

    pub(crate) local_tag: u32,
    pub(crate) peer_tag: u32,
    cookie_key: u64,

    pub(crate) peers: PeerSet,
    pub(crate) timers: Timers,

    // 송신 측
    pub(crate) outbound: OutboundQueue,
    pub(crate) out_streams: u16,
    pub(crate) out_ssn: Vec<u16>,
    pub(crate) next_tsn: u32,
    /// 피어가 보낸 마지막 cumulative ack
    pub(crate) last_ack_rxd: u32,
    pub(crate) adv_ack_point: u32,
    pub(crate) peer_rwnd: u32,
    /// association 전체 연속 실패 횟수
    pub(crate) strikes: u32,
    pub(crate) rtt_sample: Option<RttSample>,
    pub(crate) zero_win_probe: bool,
    /// T3 이후 slow-start 재전송 구간 (next, max)
    pub(crate) rexmit_range: Option<(u32, u32)>,
    /// PR-SCTP 협상 결과
    pub(crate) prsctp: bool,

    // 수신 측
    pub(crate) recv: RecvState,

    // 핸드쉐이크 / 종료
    handshake: Option<Vec<Chunk>>,
    init_retransmits: u32,
    shutdown_started: Option<Instant>,

    /// 마지막 데이터 송수신 (autoclose)
    pub(crate) last_activity: Instant,
    pub(crate) stats: AssocStats,
    close_reason: Option<CloseReason>,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("state", &self.state)
            .field("local_port", &self.local_port)
            .field("peer_port", &self.peer_port)
            .field("local_tag", &format_args!("{:08X}", self.local_tag))
            .field("peer_tag", &format_args!("{:08X}", self.peer_tag))
            .field("peers", &self.peers.len())
            .field("queued", &self.outbound.len())
            .finish()
    }
}

impl Association {
    /// 새 association 생성 (IDLE)
    pub fn new(config: Config, io: Collaborators, local_port: u16, now: Instant) -> Result<Self> {
        config.validate()?;
        let mut rng = rand::thread_rng();
        let next_tsn: u32 = rng.gen();
        let recv = RecvState::new(&config);
        let out_streams = config.outbound_streams;
        Ok(Self {
            io,
            state: AssocState::Idle,
            epoch: now,
            local_port,
            peer_port: 0,
            local_addrs: Vec::new(),
            local_tag: random_tag(),
            peer_tag: 0,
            cookie_key: rng.gen(),
            peers: PeerSet::new(),
            timers: Timers::new(),
            outbound: OutboundQueue::new(),
            out_streams,
            out_ssn: vec![0; out_streams as usize],
            next_tsn,
            last_ack_rxd: next_tsn.wrapping_sub(1),
            adv_ack_point: next_tsn.wrapping_sub(1),
            peer_rwnd: 0,
            strikes: 0,
            rtt_sample: None,
            zero_win_probe: false,
            rexmit_range: None,
            prsctp: false,
            recv,
            handshake: None,
            init_retransmits: 0,
            shutdown_started: None,
            last_activity: now,
            stats: AssocStats::new(now),
            close_reason: None,
            config,
        })
    }

    pub fn state(&self) -> AssocState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &AssocStats {
        &self.stats
    }

    pub fn local_tag(&self) -> u32 {
        self.local_tag
    }

    pub fn peer_tag(&self) -> u32 {
        self.peer_tag
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// 순서대로 받은 마지막 TSN
    pub fn cumulative_tsn(&self) -> u32 {
        self.recv.cum_tsn
    }

    pub fn received_gaps(&self) -> &SackGapSet {
        &self.recv.gaps
    }

    pub fn last_ack_received(&self) -> u32 {
        self.last_ack_rxd
    }

    pub fn advanced_peer_ack_point(&self) -> u32 {
        self.adv_ack_point
    }

    pub fn next_tsn(&self) -> u32 {
        self.next_tsn
    }

    pub fn peer_rwnd(&self) -> u32 {
        self.peer_rwnd
    }

    pub fn outbound_streams(&self) -> u16 {
        self.out_streams
    }

    pub fn inbound_streams(&self) -> u16 {
        self.recv.reassembly.stream_count()
    }

    pub fn partial_reliability(&self) -> bool {
        self.prsctp
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// 런타임이 반영할 타이머 예약 변경
    pub fn take_timer_updates(&mut self) -> Vec<TimerUpdate> {
        self.timers.take_updates()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn now_us(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    pub(crate) fn closed_error(&self) -> Error {
        Error::ConnectionClosed(self.close_reason.unwrap_or(CloseReason::Aborted))
    }

    // ------------------------------------------------------------------
    // 애플리케이션 요청
    // ------------------------------------------------------------------

    /// 로컬 주소 지정 (INIT / INIT-ACK에 광고)
    pub fn bind(&mut self, addrs: Vec<IpAddr>) -> Result<()> {
        match self.state {
            AssocState::Idle | AssocState::Bound => {
                self.local_addrs = addrs;
                self.state = AssocState::Bound;
                Ok(())
            }
            s => Err(Error::InvalidState {
                state: s.name(),
                op: "bind",
            }),
        }
    }

    /// 수동 open
    pub fn listen(&mut self) -> Result<()> {
        match self.state {
            AssocState::Idle | AssocState::Bound => {
                self.state = AssocState::Listen;
                info!("포트 {} LISTEN", self.local_port);
                Ok(())
            }
            s => Err(Error::InvalidState {
                state: s.name(),
                op: "listen",
            }),
        }
    }

    /// 능동 open: 첫 주소가 primary
    pub fn connect(&mut self, now: Instant, addrs: &[SocketAddr]) -> Result<()> {
        if !matches!(self.state, AssocState::Idle | AssocState::Bound) {
            return Err(Error::InvalidState {
                state: self.state.name(),
                op: "connect",
            });
        }
        let first = addrs.first().ok_or(Error::NoPeerAddress)?;
        self.peer_port = first.port();
        for addr in addrs {
            self.add_peer(*addr, now);
        }

        let reachable = self
            .peers
            .iter()
            .find(|p| p.state != PeerState::Unreachable)
            .map(|p| p.id)
            .ok_or(Error::NoPeerAddress)?;
        if self
            .peers
            .current()
            .and_then(|id| self.peers.get(id))
            .map_or(true, |p| p.state == PeerState::Unreachable)
        {
            self.peers.set_current(reachable);
        }

        let init = InitChunk {
            initiate_tag: self.local_tag,
            a_rwnd: self.config.receive_window,
            outbound_streams: self.config.outbound_streams,
            inbound_streams: self.config.inbound_streams,
            initial_tsn: self.next_tsn,
            addresses: self.local_addrs.clone(),
            forward_tsn_supported: self.config.partial_reliability,
            cookie: None,
            unrecognized: Vec::new(),
        };
        self.handshake = Some(vec![Chunk::Init(init)]);
        self.init_retransmits = 0;
        self.state = AssocState::CookieWait;
        info!("{} 연결 시작 → COOKIE_WAIT (tag={:08X})", first, self.local_tag);
        self.send_handshake(now);
        Ok(())
    }

    /// 종료 요청: 남은 데이터가 모두 ack되면 SHUTDOWN
    pub fn shutdown(&mut self, now: Instant) -> Result<()> {
        match self.state {
            AssocState::Established => {
                info!("종료 요청 → SHUTDOWN_PENDING");
                self.state = AssocState::ShutdownPending;
                self.timers.stop(TimerKey::AutoClose);
                self.try_send_shutdown(now);
                Ok(())
            }
            AssocState::ShutdownPending
            | AssocState::ShutdownSent
            | AssocState::ShutdownReceived
            | AssocState::ShutdownAckSent => Ok(()),
            AssocState::Idle | AssocState::Bound | AssocState::Listen => {
                self.close_quietly(CloseReason::Graceful);
                Ok(())
            }
            AssocState::Closed => Err(self.closed_error()),
            s => Err(Error::InvalidState {
                state: s.name(),
                op: "shutdown",
            }),
        }
    }

    /// 즉시 종료 (ABORT 전송)
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            AssocState::Closed => Err(self.closed_error()),
            AssocState::Idle | AssocState::Bound | AssocState::Listen => {
                self.close_quietly(CloseReason::Aborted);
                Ok(())
            }
            _ => {
                info!("로컬 ABORT ({})", self.state);
                self.send_abort(Vec::new());
                self.fail(CloseReason::Aborted);
                Ok(())
            }
        }
    }

    /// primary 주소 변경
    pub fn set_primary(&mut self, addr: SocketAddr) -> Result<()> {
        let id = self.peers.find(&addr).ok_or(Error::UnknownPeer(addr))?;
        self.peers.set_primary(id);
        let alive = self.peers.get(id).map_or(false, |p| p.is_alive());
        if alive && self.config.failover_policy == crate::FailoverPolicy::Rotate {
            self.peers.set_current(id);
        }
        info!("primary 주소 변경: {}", addr);
        self.io.events.notify(Notification::AddressChange {
            addr,
            change: AddressChange::MadePrimary,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // 패킷 입력
    // ------------------------------------------------------------------

    /// 수신 패킷 처리
    pub fn handle_packet(&mut self, now: Instant, from: SocketAddr, raw: &[u8]) {
        self.stats.packets_received += 1;
        let packet = match Packet::from_bytes(raw) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("{}에서 받은 패킷 폐기: {}", from, e);
                self.stats.packets_dropped += 1;
                return;
            }
        };

        let header = packet.header;
        if header.dst_port != self.local_port
            || matches!(
                self.state,
                AssocState::Idle | AssocState::Bound | AssocState::Closed
            )
        {
            trace!("패킷 무시: port={} state={}", header.dst_port, self.state);
            self.stats.packets_dropped += 1;
            return;
        }

        let peer = self.peers.find(&from);
        if self.state != AssocState::Listen {
            if peer.is_none() {
                debug!("알 수 없는 주소 {}의 패킷 폐기", from);
                self.stats.packets_dropped += 1;
                return;
            }
            if header.src_port != self.peer_port {
                trace!("피어 포트 불일치: {} != {}", header.src_port, self.peer_port);
                self.stats.packets_dropped += 1;
                return;
            }
        }

        let mut ctx = PacketCtx::new(from, header.src_port, header.verification_tag, peer);
        if !self.check_vtag(&packet, &mut ctx) {
            self.stats.packets_dropped += 1;
            return;
        }

        trace!(
            "{}에서 청크 {}개 수신 (state={})",
            from,
            packet.chunks.len(),
            self.state
        );
        for chunk in packet.chunks {
            if ctx.stop || self.state == AssocState::Closed {
                break;
            }
            self.dispatch(now, chunk, &mut ctx);
        }
        self.finish_packet(now, ctx);
    }

    /// 첫 청크 종류에 따른 verification tag 검사
    fn check_vtag(&mut self, packet: &Packet, ctx: &mut PacketCtx) -> bool {
        let tag = packet.header.verification_tag;
        let Some(first) = packet.chunks.first() else {
            return false;
        };

        let ok = match first {
            Chunk::Init(_) => tag == 0,
            Chunk::Abort { t_bit, .. } | Chunk::ShutdownComplete { t_bit } => {
                self.state == AssocState::Listen
                    || tag == self.local_tag
                    || (*t_bit && self.peer_tag != 0 && tag == self.peer_tag)
            }
            Chunk::ShutdownAck if self.state.is_handshaking() => {
                // out of the blue: T 비트로 SHUTDOWN-COMPLETE
                let reply = vec![Chunk::ShutdownComplete { t_bit: true }];
                self.send_raw(ctx.from, ctx.src_port, tag, None, reply);
                return false;
            }
            _ if self.state == AssocState::Listen => true,
            _ => tag == self.local_tag,
        };
        if !ok {
            trace!(
                "verification tag 불일치: expected {:08X}, got {:08X}",
                self.local_tag,
                tag
            );
        }
        ok
    }

    fn dispatch(&mut self, now: Instant, chunk: Chunk, ctx: &mut PacketCtx) {
        use AssocState::*;
        let state = self.state;
        match chunk {
            Chunk::Data(data) if state.accepts_data() => self.process_data(now, data, ctx),
            Chunk::Sack(sack) if state.is_connected() => self.process_sack(now, &sack, ctx),
            Chunk::Heartbeat(info) if !matches!(state, Listen | CookieWait) => {
                if !ctx.hb_answered {
                    ctx.hb_answered = true;
                    ctx.replies.push(Chunk::HeartbeatAck(info));
                }
            }
            Chunk::HeartbeatAck(info) if state != Listen => self.process_heartbeat_ack(now, &info),
            Chunk::Init(init) => self.answer_init(now, &init, ctx),
            Chunk::InitAck(ack) if state == CookieWait => self.process_init_ack(now, ack, ctx),
            Chunk::CookieEcho(cookie) => self.process_cookie_echo(now, &cookie, ctx),
            Chunk::CookieAck if state == CookieEchoed => self.establish(now),
            Chunk::Abort { causes, .. } => {
                if state != Listen {
                    self.process_abort(&causes);
                    ctx.stop = true;
                }
            }
            Chunk::Shutdown { cum_tsn } if state.is_connected() => {
                self.process_shutdown(now, cum_tsn, ctx)
            }
            Chunk::ShutdownAck if matches!(state, ShutdownSent | ShutdownAckSent) => {
                self.send_chunks(ctx.peer, vec![Chunk::ShutdownComplete { t_bit: false }]);
                info!("SHUTDOWN-ACK 수신: 종료 완료");
                self.teardown(Notification::ShutdownComplete, CloseReason::Graceful);
                ctx.stop = true;
            }
            Chunk::ShutdownComplete { .. } if state == ShutdownAckSent => {
                info!("SHUTDOWN-COMPLETE 수신: 종료 완료");
                self.teardown(Notification::ShutdownComplete, CloseReason::Graceful);
                ctx.stop = true;
            }
            Chunk::Error { causes } if state != Listen => self.process_error(causes, ctx),
            Chunk::ForwardTsn(ftsn) if state.accepts_data() && self.prsctp => {
                self.process_forward_tsn(now, ftsn, ctx)
            }
            Chunk::Error { .. } | Chunk::CookieAck | Chunk::ShutdownComplete { .. }
                if state == Listen => {}
            _ if state == Listen => {
                debug!("LISTEN 상태에서 예상치 못한 청크: ABORT(T) 응답");
                let abort = Chunk::Abort {
                    t_bit: true,
                    causes: Vec::new(),
                };
                self.send_raw(ctx.from, ctx.src_port, ctx.vtag, None, vec![abort]);
                ctx.stop = true;
            }
            other => self.unrecognized(&other, ctx),
        }
    }

    /// 알 수 없거나 현재 상태에서 허용되지 않는 청크: 타입 상위 2비트 규칙
    fn unrecognized(&mut self, chunk: &Chunk, ctx: &mut PacketCtx) {
        let action = UnknownAction::from_type(chunk.type_byte());
        trace!(
            "처리할 수 없는 청크 type={} (state={}, {:?})",
            chunk.type_byte(),
            self.state,
            action
        );
        if action.report() {
            let mut raw = BytesMut::with_capacity(chunk.padded_len());
            chunk.encode(&mut raw);
            raw.truncate(chunk.wire_len());
            ctx.replies.push(Chunk::Error {
                causes: vec![ErrorCause::new(cause::UNRECOGNIZED_CHUNK, raw.freeze())],
            });
        }
        if !action.skip() {
            ctx.stop = true;
        }
    }

    fn finish_packet(&mut self, now: Instant, ctx: PacketCtx) {
        if self.state == AssocState::Closed {
            return;
        }
        if !ctx.replies.is_empty() {
            self.send_chunks(ctx.peer, ctx.replies);
        }
        if ctx.trysend || ctx.got_data {
            self.output(now);
        }
        if ctx.got_data {
            self.ack_received_data(now);
        }
        match self.state {
            AssocState::ShutdownPending => self.try_send_shutdown(now),
            AssocState::ShutdownReceived if self.outbound.is_empty() => {
                self.send_shutdown_ack(now)
            }
            _ => {}
        }
    }

    fn process_abort(&mut self, causes: &[ErrorCause]) {
        for c in causes {
            debug!("ABORT cause={} ({} bytes)", c.code, c.info.len());
        }
        let reason = if self.state.is_handshaking() {
            CloseReason::Refused
        } else {
            CloseReason::Reset
        };
        info!("피어 ABORT 수신 ({})", self.state);
        self.fail(reason);
    }

    fn process_error(&mut self, causes: Vec<ErrorCause>, ctx: &mut PacketCtx) {
        for c in causes {
            if c.code == cause::STALE_COOKIE && self.state == AssocState::CookieEchoed {
                warn!("state cookie 만료 보고: 연결 실패");
                self.fail(CloseReason::Refused);
                ctx.stop = true;
                return;
            }
            debug!("피어 ERROR cause={}", c.code);
            self.io.events.notify(Notification::PeerError {
                cause: c.code,
                info: c.info,
            });
        }
    }

    // ------------------------------------------------------------------
    // 핸드쉐이크
    // ------------------------------------------------------------------

    /// INIT 또는 COOKIE-ECHO (재)전송 후 init 타이머 시작
    fn send_handshake(&mut self, now: Instant) {
        let Some(chunks) = self.handshake.clone() else {
            return;
        };
        let Some(peer) = self.peers.current().and_then(|id| self.peers.get(id)) else {
            return;
        };
        let vtag = if self.state == AssocState::CookieWait {
            0
        } else {
            self.peer_tag
        };
        let dest = Destination {
            addr: peer.addr,
            source: peer.source,
            dont_fragment: true,
        };
        let deadline = now + peer.rto.rto();
        if let Err(e) = self.transmit(dest, self.peer_port, vtag, chunks) {
            debug!("핸드쉐이크 청크 전송 실패: {}", e);
        }
        self.timers.start(TimerKey::Init, deadline);
    }

    fn init_timer(&mut self, now: Instant) {
        if !self.state.is_handshaking() {
            return;
        }
        self.init_retransmits += 1;
        if self.init_retransmits > self.config.max_init_retransmits {
            warn!(
                "{} 재전송 한도 초과 ({}회)",
                self.state, self.config.max_init_retransmits
            );
            self.fail(CloseReason::TimedOut);
            return;
        }
        if let Some(peer) = self.peers.current().and_then(|id| self.peers.get_mut(id)) {
            peer.rto.backoff();
        }
        debug!("{} 재전송 #{}", self.state, self.init_retransmits);
        self.send_handshake(now);
    }

    /// INIT에 대해 state cookie를 담은 INIT-ACK 응답
    ///
    /// LISTEN에서는 새 태그로, 그 외(충돌/재시작)에는 현재 태그로 응답한다.
    fn answer_init(&mut self, now: Instant, init: &InitChunk, ctx: &mut PacketCtx) {
        ctx.stop = true;
        if init.initiate_tag == 0 {
            warn!("initiate tag 0인 INIT 폐기");
            return;
        }
        let (local_tag, local_tsn) = if self.state == AssocState::Listen {
            (random_tag(), rand::thread_rng().gen())
        } else {
            (self.local_tag, self.next_tsn)
        };

        let cookie = StateCookie {
            peer_tag: init.initiate_tag,
            local_tag,
            peer_initial_tsn: init.initial_tsn,
            local_initial_tsn: local_tsn,
            peer_rwnd: init.a_rwnd,
            peer_outbound: init.outbound_streams,
            peer_inbound: init.inbound_streams,
            forward_tsn: init.forward_tsn_supported,
            created_us: self.now_us(now),
            addresses: init.addresses.clone(),
        };
        let ack = InitChunk {
            initiate_tag: local_tag,
            a_rwnd: self.config.receive_window,
            outbound_streams: self.config.outbound_streams,
            inbound_streams: self.config.inbound_streams,
            initial_tsn: local_tsn,
            addresses: self.local_addrs.clone(),
            forward_tsn_supported: self.config.partial_reliability,
            cookie: Some(cookie.seal(self.cookie_key)),
            unrecognized: init.unrecognized.clone(),
        };

        debug!(
            "{}에서 INIT 수신 ({}): INIT-ACK 응답 (tag={:08X})",
            ctx.from, self.state, local_tag
        );
        let source = ctx.peer.and_then(|id| self.peers.get(id)).and_then(|p| p.source);
        self.send_raw(
            ctx.from,
            ctx.src_port,
            init.initiate_tag,
            source,
            vec![Chunk::InitAck(ack)],
        );
    }

    fn process_init_ack(&mut self, now: Instant, ack: InitChunk, ctx: &mut PacketCtx) {
        ctx.stop = true;
        if ack.initiate_tag == 0 {
            warn!("initiate tag 0인 INIT-ACK 폐기");
            return;
        }
        let Some(cookie) = ack.cookie.clone() else {
            warn!("state cookie 없는 INIT-ACK: ABORT");
            let mut missing = BytesMut::with_capacity(8);
            missing.put_u32(1);
            missing.put_u16(param::STATE_COOKIE);
            missing.put_u16(0);
            let abort = Chunk::Abort {
                t_bit: false,
                causes: vec![ErrorCause::new(cause::MISSING_PARAM, missing.freeze())],
            };
            self.send_raw(ctx.from, ctx.src_port, ack.initiate_tag, None, vec![abort]);
            self.fail(CloseReason::Refused);
            return;
        };
        if !ack.unrecognized.is_empty() {
            debug!("피어가 인식하지 못한 INIT 파라미터 {}개", ack.unrecognized.len());
        }

        self.timers.stop(TimerKey::Init);
        for ip in &ack.addresses {
            self.add_peer(SocketAddr::new(*ip, self.peer_port), now);
        }
        self.adopt_peer(&PeerParams::from(&ack));
        if let Some(id) = ctx.peer {
            self.faddr_alive(now, id);
            self.peers.set_current(id);
        }

        self.handshake = Some(vec![Chunk::CookieEcho(cookie)]);
        self.init_retransmits = 0;
        self.state = AssocState::CookieEchoed;
        info!("INIT-ACK 수신 → COOKIE_ECHOED (peer tag={:08X})", self.peer_tag);
        self.send_handshake(now);
    }

    fn process_cookie_echo(&mut self, now: Instant, raw: &Bytes, ctx: &mut PacketCtx) {
        let Some(cookie) = StateCookie::open(raw, self.cookie_key) else {
            debug!("{}: state cookie 검증 실패", ctx.from);
            ctx.stop = true;
            return;
        };
        if ctx.vtag != cookie.local_tag {
            trace!("COOKIE-ECHO tag 불일치");
            ctx.stop = true;
            return;
        }

        let age = self.now_us(now).saturating_sub(cookie.created_us);
        let lifetime = self.config.cookie_lifetime.as_micros() as u64;
        if age > lifetime {
            let staleness = (age - lifetime).min(u32::MAX as u64) as u32;
            debug!("만료된 state cookie ({}us 초과)", staleness);
            let error = Chunk::Error {
                causes: vec![ErrorCause::stale_cookie(staleness)],
            };
            self.send_raw(ctx.from, ctx.src_port, cookie.peer_tag, None, vec![error]);
            ctx.stop = true;
            return;
        }

        match self.state {
            AssocState::Listen | AssocState::CookieWait | AssocState::CookieEchoed => {
                if self.state == AssocState::Listen {
                    self.local_tag = cookie.local_tag;
                    self.next_tsn = cookie.local_initial_tsn;
                    self.last_ack_rxd = self.next_tsn.wrapping_sub(1);
                    self.adv_ack_point = self.last_ack_rxd;
                    self.peer_port = ctx.src_port;
                }
                let id = self.add_peer(ctx.from, now);
                for ip in &cookie.addresses {
                    self.add_peer(SocketAddr::new(*ip, self.peer_port), now);
                }
                ctx.peer = Some(id);
                self.adopt_peer(&PeerParams::from(&cookie));
                self.faddr_alive(now, id);
                self.peers.set_current(id);
                // DATA보다 먼저 나가야 한다
                self.send_chunks(Some(id), vec![Chunk::CookieAck]);
                self.establish(now);
            }
            AssocState::ShutdownAckSent => {
                self.send_chunks(ctx.peer, vec![Chunk::ShutdownAck]);
            }
            _ if cookie.peer_tag == self.peer_tag => {
                trace!("중복 COOKIE-ECHO: COOKIE-ACK 재전송");
                self.send_chunks(ctx.peer, vec![Chunk::CookieAck]);
            }
            _ => debug!("피어 재시작 COOKIE-ECHO 무시"),
        }
    }

    /// 피어 파라미터 적용 (스트림 수 협상, 수신 TSN 기준점)
    fn adopt_peer(&mut self, params: &PeerParams) {
        self.peer_tag = params.tag;
        self.peer_rwnd = params.rwnd;
        self.recv.reset(params.initial_tsn.wrapping_sub(1));

        self.out_streams = self.config.outbound_streams.min(params.inbound).max(1);
        self.out_ssn = vec![0; self.out_streams as usize];
        // 핸드쉐이크 중 큐잉된 메시지 중 합의 범위를 벗어난 스트림
        for key in self.outbound.keys() {
            let invalid = self
                .outbound
                .get(key)
                .map_or(false, |m| m.stream >= self.out_streams);
            if !invalid {
                continue;
            }
            if let Some(msg) = self.outbound.remove(key) {
                debug!("stream {}은 합의된 범위 밖: send-failed", msg.stream);
                self.io.events.notify(Notification::SendFailed {
                    stream: msg.stream,
                    ppid: msg.ppid,
                    data: msg.data(),
                    sent: false,
                });
            }
        }
        let inbound = self.config.inbound_streams.min(params.outbound).max(1);
        self.recv.reassembly.set_stream_count(inbound);

        self.prsctp = self.config.partial_reliability && params.forward_tsn;
        for peer in self.peers.iter_mut() {
            peer.cwnd.ssthresh = params.rwnd.max(peer.cwnd.mss * 2);
        }
    }

    fn establish(&mut self, now: Instant) {
        self.timers.stop(TimerKey::Init);
        self.handshake = None;
        self.init_retransmits = 0;
        self.state = AssocState::Established;
        self.last_activity = now;

        let peer = self
            .peers
            .current()
            .and_then(|id| self.peers.get(id))
            .map(|p| p.addr);
        info!(
            "association 수립: {:?} (out={}, in={}, pr-sctp={})",
            peer,
            self.out_streams,
            self.recv.reassembly.stream_count(),
            self.prsctp
        );
        self.io.events.notify(Notification::CommUp {
            outbound_streams: self.out_streams,
            inbound_streams: self.recv.reassembly.stream_count(),
        });

        for id in self.peers.ids() {
            self.schedule_heartbeat(now, id);
        }
        if let Some(limit) = self.config.autoclose {
            self.timers.start(TimerKey::AutoClose, now + limit);
        }
        self.output(now);
    }

    // ------------------------------------------------------------------
    // 주소 liveness
    // ------------------------------------------------------------------

    /// 주소 추가, 새 주소면 경로 해석
    pub(crate) fn add_peer(&mut self, addr: SocketAddr, now: Instant) -> PeerId {
        let known = self.peers.find(&addr);
        let id = self.peers.add(addr, &self.config, now);
        if known.is_none() {
            self.resolve_peer(id);
        }
        id
    }

    /// 소스 주소 / PMTU 갱신, 해석 실패면 Unreachable
    pub(crate) fn resolve_peer(&mut self, id: PeerId) -> bool {
        let Some(addr) = self.peers.get(id).map(|p| p.addr) else {
            return false;
        };
        let route = self.io.routes.resolve(addr);
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        match route {
            Some(route) => {
                peer.source = Some(route.source);
                if route.path_mtu >= MIN_MTU && route.path_mtu != peer.pmtu {
                    debug!("{} PMTU {} → {}", addr, peer.pmtu, route.path_mtu);
                    peer.set_pmtu(route.path_mtu);
                }
                if let (Some(hint), None) = (route.rtt_hint, peer.rto.srtt()) {
                    peer.rto.sample(hint);
                }
                if peer.state == PeerState::Unreachable {
                    peer.state = PeerState::Unconfirmed;
                }
                true
            }
            None => {
                if peer.state != PeerState::Unreachable {
                    peer.state = PeerState::Unreachable;
                    debug!("{} 경로 해석 실패: UNREACHABLE", addr);
                    self.io.events.notify(Notification::AddressChange {
                        addr,
                        change: AddressChange::Unreachable,
                    });
                }
                false
            }
        }
    }

    /// 주소가 응답함: strike 초기화, 필요 시 Alive 전환
    pub(crate) fn faddr_alive(&mut self, now: Instant, id: PeerId) {
        self.strikes = 0;
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        peer.strikes = 0;
        peer.lastactive = now;
        peer.hb_pending = false;

        if peer.state != PeerState::Alive {
            peer.state = PeerState::Alive;
            let addr = peer.addr;
            debug!("피어 주소 {} ALIVE", addr);
            if let Some(route) = self.io.routes.resolve(addr) {
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.source = Some(route.source);
                }
            }
            self.io.events.notify(Notification::AddressChange {
                addr,
                change: AddressChange::Available,
            });
            let current_alive = self
                .peers
                .current()
                .and_then(|c| self.peers.get(c))
                .map_or(false, |p| p.is_alive());
            if !current_alive {
                self.peers.set_current(id);
            }
        }
        self.schedule_heartbeat(now, id);
    }

    /// strike 한도 초과: DOWN 전환
    ///
    /// 살아 있는 주소가 하나도 남지 않으면 association을 종료하고 false.
    pub(crate) fn faddr_dead(&mut self, id: PeerId) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            return true;
        };
        if peer.state == PeerState::Down {
            return true;
        }
        peer.state = PeerState::Down;
        peer.hb_pending = false;
        peer.rto.reset();
        let addr = peer.addr;
        warn!("피어 주소 {} DOWN", addr);
        self.io.events.notify(Notification::AddressChange {
            addr,
            change: AddressChange::Unreachable,
        });

        if self.peers.primary() == Some(id) {
            self.peers.arm_failback(self.config.failback_confirmations());
        }
        if self.peers.current() == Some(id) {
            let alt = self.peers.select_alternate(id);
            if alt != id {
                debug!("current 목적지 전환: {:?} → {:?}", id, alt);
                self.peers.set_current(alt);
            }
        }
        if self.peers.alive_count() == 0 {
            warn!("살아 있는 피어 주소 없음");
            self.fail(CloseReason::TimedOut);
            return false;
        }
        true
    }

    /// path와 association strike 증가, 한도 초과 처리
    ///
    /// association이 종료되면 false.
    pub(crate) fn strike(&mut self, id: PeerId) -> bool {
        self.strikes += 1;
        let path_strikes = match self.peers.get_mut(id) {
            Some(peer) => {
                peer.strikes += 1;
                peer.strikes
            }
            None => 0,
        };
        if self.strikes > self.config.assoc_max_retransmits {
            warn!(
                "association 재전송 한도 초과 ({}회)",
                self.config.assoc_max_retransmits
            );
            self.send_abort(Vec::new());
            self.fail(CloseReason::TimedOut);
            return false;
        }
        if path_strikes > self.config.path_max_retransmits {
            return self.faddr_dead(id);
        }
        true
    }

    fn schedule_heartbeat(&mut self, now: Instant, id: PeerId) {
        let Some(interval) = self.config.heartbeat_interval else {
            return;
        };
        if !self.state.is_connected() {
            return;
        }
        let Some(peer) = self.peers.get(id) else {
            return;
        };
        let delay = match peer.state {
            PeerState::Unconfirmed => peer.rto.rto(),
            _ => peer.heartbeat_delay(interval),
        };
        self.timers.start(TimerKey::Heartbeat(id), now + delay);
    }

    fn heartbeat_timer(&mut self, now: Instant, id: PeerId) {
        if !self.state.is_connected() {
            return;
        }
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        if peer.state == PeerState::Unreachable {
            if self.resolve_peer(id) {
                debug!("경로 재해석 성공: {:?}", id);
            }
            self.schedule_heartbeat(now, id);
            return;
        }
        if peer.hb_pending {
            peer.rto.backoff();
            debug!("heartbeat 응답 없음: {} (strikes={})", peer.addr, peer.strikes + 1);
            if !self.strike(id) {
                return;
            }
        }
        self.send_heartbeat(now, id);
        self.schedule_heartbeat(now, id);
    }

    fn send_heartbeat(&mut self, now: Instant, id: PeerId) {
        let nonce: u64 = rand::thread_rng().gen();
        let sent_us = self.now_us(now);
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        let info = encode_hb_info(nonce, sent_us, peer.addr);
        peer.hb_pending = true;
        peer.hb_nonce = nonce;
        peer.hb_sent_at = Some(now);
        peer.stats.heartbeats_sent += 1;
        trace!("HEARTBEAT → {}", peer.addr);
        self.send_chunks(Some(id), vec![Chunk::Heartbeat(info)]);
    }

    fn process_heartbeat_ack(&mut self, now: Instant, info: &[u8]) {
        let Some((nonce, addr)) = decode_hb_info(info) else {
            debug!("잘못된 heartbeat info");
            return;
        };
        let Some(id) = self.peers.find(&addr) else {
            return;
        };
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        if !peer.hb_pending || peer.hb_nonce != nonce {
            trace!("오래된 HEARTBEAT-ACK 무시: {}", addr);
            return;
        }
        if let Some(sent) = peer.hb_sent_at {
            let rtt = now.saturating_duration_since(sent);
            peer.rto.sample(rtt);
            peer.cc.on_rtt_sample(&mut peer.cwnd, rtt, now);
            peer.stats.record_rtt(rtt);
        }
        peer.stats.heartbeat_acks += 1;
        self.faddr_alive(now, id);

        if self.peers.confirm_primary(id) {
            info!("primary {} 복귀", addr);
            self.io.events.notify(Notification::AddressChange {
                addr,
                change: AddressChange::MadePrimary,
            });
        }
    }

    // ------------------------------------------------------------------
    // 종료
    // ------------------------------------------------------------------

    /// SHUTDOWN_PENDING에서 송신 큐가 비면 SHUTDOWN 전송
    pub(crate) fn try_send_shutdown(&mut self, now: Instant) {
        if self.state != AssocState::ShutdownPending || !self.outbound.is_empty() {
            return;
        }
        self.state = AssocState::ShutdownSent;
        self.shutdown_started = Some(now);
        info!("송신 완료 → SHUTDOWN_SENT");
        self.send_shutdown(now);
    }

    /// SHUTDOWN 전송 (SACK 역할 포함)
    pub(crate) fn send_shutdown(&mut self, now: Instant) {
        let current = self.peers.current();
        let cum_tsn = self.recv.cum_tsn;
        self.send_chunks(current, vec![Chunk::Shutdown { cum_tsn }]);
        self.sack_sent();
        let rto = current
            .and_then(|id| self.peers.get(id))
            .map(|p| p.rto.rto())
            .unwrap_or(self.config.rto_initial);
        self.timers.start(TimerKey::Shutdown, now + rto);
    }

    pub(crate) fn restart_shutdown_timer(&mut self, now: Instant) {
        let rto = self
            .peers
            .current()
            .and_then(|id| self.peers.get(id))
            .map(|p| p.rto.rto())
            .unwrap_or(self.config.rto_initial);
        self.timers.start(TimerKey::Shutdown, now + rto);
    }

    /// SHUTDOWN_SENT 상태에서 SHUTDOWN-ACK 대기 한도 초과 여부
    pub(crate) fn shutdown_wait_exceeded(&self, now: Instant) -> bool {
        match (self.config.shutdown_ack_wait_bound, self.shutdown_started) {
            (Some(bound), Some(started)) => now.saturating_duration_since(started) > bound,
            _ => false,
        }
    }

    fn process_shutdown(&mut self, now: Instant, cum_tsn: u32, ctx: &mut PacketCtx) {
        if !self.cumulative_ack_from_shutdown(now, cum_tsn) {
            ctx.stop = true;
            return;
        }
        match self.state {
            AssocState::Established | AssocState::ShutdownPending => {
                info!("SHUTDOWN 수신 → SHUTDOWN_RECEIVED");
                self.state = AssocState::ShutdownReceived;
                self.timers.stop(TimerKey::AutoClose);
                self.io.events.notify(Notification::PeerShutdown);
            }
            AssocState::ShutdownSent => {
                // 동시 종료
                self.send_shutdown_ack(now);
            }
            _ => {}
        }
        ctx.trysend = true;
    }

    fn send_shutdown_ack(&mut self, now: Instant) {
        self.state = AssocState::ShutdownAckSent;
        self.timers.stop(TimerKey::DelayedSack);
        info!("SHUTDOWN-ACK 전송 → SHUTDOWN_ACK_SENT");
        self.send_chunks(self.peers.current(), vec![Chunk::ShutdownAck]);
        self.restart_shutdown_timer(now);
    }

    fn shutdown_timer(&mut self, now: Instant) {
        if !matches!(
            self.state,
            AssocState::ShutdownSent | AssocState::ShutdownAckSent
        ) {
            return;
        }
        let Some(id) = self.peers.current() else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(id) {
            peer.rto.backoff();
        }
        if !self.strike(id) {
            return;
        }
        let alt = self.peers.select_alternate(id);
        self.peers.set_current(alt);
        debug!("{} 재전송 (strikes={})", self.state, self.strikes);
        if self.state == AssocState::ShutdownSent {
            self.send_shutdown(now);
        } else {
            self.send_chunks(Some(alt), vec![Chunk::ShutdownAck]);
            self.restart_shutdown_timer(now);
        }
    }

    fn autoclose_timer(&mut self, now: Instant) {
        let Some(limit) = self.config.autoclose else {
            return;
        };
        if self.state != AssocState::Established {
            return;
        }
        let idle = now.saturating_duration_since(self.last_activity);
        if idle >= limit {
            info!("{:.1}s 동안 데이터 없음: 자동 종료", idle.as_secs_f64());
            if let Err(e) = self.shutdown(now) {
                debug!("자동 종료 실패: {}", e);
            }
        } else {
            self.timers.start(TimerKey::AutoClose, self.last_activity + limit);
        }
    }

    // ------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------

    pub(crate) fn send_abort(&mut self, causes: Vec<ErrorCause>) {
        if self.peer_tag == 0 {
            return;
        }
        let current = self.peers.current();
        self.send_chunks(
            current,
            vec![Chunk::Abort {
                t_bit: false,
                causes,
            }],
        );
    }

    /// 프로토콜 위반: ABORT 후 종료
    pub(crate) fn abort_violation(&mut self, code: u16, info: Bytes, what: &str) {
        warn!("프로토콜 위반: {} → ABORT", what);
        self.send_abort(vec![ErrorCause::new(code, info)]);
        self.fail(CloseReason::Aborted);
    }

    /// 비정상 종료: 핸드쉐이크 중이면 cannot-start, 아니면 comm-lost
    pub(crate) fn fail(&mut self, reason: CloseReason) {
        let event = if self.state.is_handshaking() {
            Notification::CannotStart { reason }
        } else {
            Notification::CommLost { reason }
        };
        self.teardown(event, reason);
    }

    /// 모든 타이머 해제, 남은 메시지 send-failed 보고, 종료 이벤트 한 번
    pub(crate) fn teardown(&mut self, event: Notification, reason: CloseReason) {
        if self.state == AssocState::Closed {
            return;
        }
        let from = self.state;
        self.state = AssocState::Closed;
        self.close_reason = Some(reason);
        self.timers.free_all();

        let failed = self.outbound.drain();
        if !failed.is_empty() {
            debug!("미전달 메시지 {}개 send-failed 보고", failed.len());
        }
        for msg in failed {
            self.io.events.notify(Notification::SendFailed {
                stream: msg.stream,
                ppid: msg.ppid,
                data: msg.data(),
                sent: msg.any_sent(),
            });
        }
        info!("{} → CLOSED ({})", from, reason);
        self.io.events.notify(event);
    }

    fn close_quietly(&mut self, reason: CloseReason) {
        self.state = AssocState::Closed;
        self.close_reason = Some(reason);
        self.timers.free_all();
    }

    // ------------------------------------------------------------------
    // 타이머
    // ------------------------------------------------------------------

    /// 타이머 만료 통지 (stale 토큰은 무시)
    pub fn handle_timeout(&mut self, now: Instant, token: TimerToken) {
        if self.state == AssocState::Closed || !self.timers.fire(token, now) {
            trace!("무효 타이머 토큰 무시: {:?}", token.key);
            return;
        }
        match token.key {
            TimerKey::Init => self.init_timer(now),
            TimerKey::Shutdown => self.shutdown_timer(now),
            TimerKey::Retransmit(id) => self.t3_expired(now, id),
            TimerKey::Heartbeat(id) => self.heartbeat_timer(now, id),
            TimerKey::DelayedSack => {
                if self.recv.sack_pending() {
                    self.send_sack(now);
                }
            }
            TimerKey::AutoClose => self.autoclose_timer(now),
        }
    }

    /// `now`까지 만료된 타이머를 모두 처리
    pub fn poll_timers(&mut self, now: Instant) {
        // 핸들러가 이미 만료된 타이머를 다시 걸 수 있으므로 몇 번 반복
        for _ in 0..8 {
            let due = self.timers.expired(now);
            if due.is_empty() {
                break;
            }
            for token in due {
                self.handle_timeout(now, token);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::*;
    use super::*;
    use crate::chunk::{CommonHeader, SackChunk};
    use crate::io::testing::Recorder;
    use crate::message::SendOptions;

    #[test]
    fn test_handshake_establishes_both_sides() {
        let mut pair = Pair::new(test_config(), test_config());
        pair.client.connect(pair.now, &[server_addr()]).unwrap();
        assert_eq!(pair.client.state(), AssocState::CookieWait);

        // INIT → INIT-ACK
        assert_eq!(pair.to_server(), 1);
        assert_eq!(pair.server.state(), AssocState::Listen);
        assert_eq!(pair.to_client(), 1);
        assert_eq!(pair.client.state(), AssocState::CookieEchoed);

        // COOKIE-ECHO → COOKIE-ACK
        assert_eq!(pair.to_server(), 1);
        assert_eq!(pair.server.state(), AssocState::Established);
        assert_eq!(pair.to_client(), 1);
        assert_eq!(pair.client.state(), AssocState::Established);

        assert_eq!(pair.client.peer_tag(), pair.server.local_tag());
        assert_eq!(pair.server.peer_tag(), pair.client.local_tag());
        assert!(pair.client.partial_reliability());

        let events = pair.client_io.take_events();
        assert!(events.contains(&Notification::CommUp {
            outbound_streams: 32,
            inbound_streams: 32,
        }));
        assert!(!pair.client.timers().is_running(TimerKey::Init));
    }

    #[test]
    fn test_stream_negotiation_takes_minimum() {
        let client_cfg = Config {
            outbound_streams: 10,
            inbound_streams: 4,
            ..test_config()
        };
        let mut pair = Pair::new(client_cfg, test_config());
        pair.client.connect(pair.now, &[server_addr()]).unwrap();
        pair.pump();
        assert_eq!(pair.client.outbound_streams(), 10);
        assert_eq!(pair.client.inbound_streams(), 4);
        assert_eq!(pair.server.outbound_streams(), 4);
        assert_eq!(pair.server.inbound_streams(), 10);
    }

    #[test]
    fn test_forward_tsn_requires_both_sides() {
        let server_cfg = Config {
            partial_reliability: false,
            ..test_config()
        };
        let mut pair = Pair::new(test_config(), server_cfg);
        pair.client.connect(pair.now, &[server_addr()]).unwrap();
        pair.pump();
        assert!(!pair.client.partial_reliability());
        assert!(!pair.server.partial_reliability());
    }

    #[test]
    fn test_init_retransmit_then_cannot_start() {
        let config = Config {
            max_init_retransmits: 2,
            ..test_config()
        };
        let mut pair = Pair::new(config, test_config());
        pair.client.connect(pair.now, &[server_addr()]).unwrap();
        assert_eq!(pair.take_from_client().len(), 1);

        // 3s, 6s backoff 후 재전송
        pair.advance(Duration::from_secs(3));
        assert_eq!(pair.take_from_client().len(), 1);
        pair.advance(Duration::from_secs(6));
        assert_eq!(pair.take_from_client().len(), 1);
        assert_eq!(pair.client.state(), AssocState::CookieWait);

        pair.advance(Duration::from_secs(12));
        assert_eq!(pair.client.state(), AssocState::Closed);
        let events = pair.client_io.take_events();
        assert_eq!(
            events.last(),
            Some(&Notification::CannotStart {
                reason: CloseReason::TimedOut
            })
        );
        assert!(pair.client.timers().is_freed());
    }

    #[test]
    fn test_cookie_tamper_dropped() {
        let mut pair = Pair::new(test_config(), test_config());
        pair.client.connect(pair.now, &[server_addr()]).unwrap();
        pair.to_server();
        pair.to_client();

        let mut packets = pair.take_from_client();
        let (packet, _) = &mut packets[0];
        if let Chunk::CookieEcho(cookie) = &mut packet.chunks[0] {
            let mut raw = cookie.to_vec();
            raw[0] ^= 0xFF;
            *cookie = Bytes::from(raw);
        } else {
            panic!("COOKIE-ECHO 기대");
        }
        pair.server_recv(packet);
        assert_eq!(pair.server.state(), AssocState::Listen);
        assert!(pair.take_from_server().is_empty());
    }

    #[test]
    fn test_stale_cookie_reported_and_fatal() {
        let server_cfg = Config {
            cookie_lifetime: Duration::from_secs(1),
            ..test_config()
        };
        let mut pair = Pair::new(test_config(), server_cfg);
        pair.client.connect(pair.now, &[server_addr()]).unwrap();
        pair.to_server();
        pair.to_client();

        pair.now += Duration::from_secs(2);
        pair.to_server();
        assert_eq!(pair.server.state(), AssocState::Listen);
        let replies = pair.take_from_server();
        assert_eq!(replies.len(), 1);
        match &replies[0].0.chunks[0] {
            Chunk::Error { causes } => assert_eq!(causes[0].code, cause::STALE_COOKIE),
            other => panic!("ERROR 기대: {:?}", other),
        }
        assert_eq!(replies[0].0.header.verification_tag, pair.client.local_tag());

        pair.client_recv(&replies[0].0);
        assert_eq!(pair.client.state(), AssocState::Closed);
        assert_eq!(
            pair.client_io.take_events().last(),
            Some(&Notification::CannotStart {
                reason: CloseReason::Refused
            })
        );
    }

    #[test]
    fn test_bad_vtag_dropped() {
        let mut pair = Pair::connected(test_config());
        let mut packet = Packet::new(CommonHeader {
            src_port: 5000,
            dst_port: 6000,
            verification_tag: pair.server.local_tag().wrapping_add(1),
        });
        packet.chunks.push(Chunk::Heartbeat(Bytes::from_static(&[0; 20])));
        let dropped = pair.server.stats().packets_dropped;
        pair.server_recv(&packet);
        assert_eq!(pair.server.stats().packets_dropped, dropped + 1);
        assert!(pair.take_from_server().is_empty());
    }

    #[test]
    fn test_heartbeat_answered_once_per_packet() {
        let mut pair = Pair::connected(test_config());
        let mut packet = Packet::new(CommonHeader {
            src_port: 5000,
            dst_port: 6000,
            verification_tag: pair.server.local_tag(),
        });
        packet.chunks.push(Chunk::Heartbeat(Bytes::from_static(b"one!")));
        packet.chunks.push(Chunk::Heartbeat(Bytes::from_static(b"two!")));
        pair.server_recv(&packet);

        let replies = pair.server_io.take_chunks();
        let acks: Vec<_> = replies
            .iter()
            .filter(|(c, _)| matches!(c, Chunk::HeartbeatAck(_)))
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].0, Chunk::HeartbeatAck(Bytes::from_static(b"one!")));
    }

    #[test]
    fn test_unknown_chunk_actions() {
        let mut pair = Pair::connected(test_config());
        let tag = pair.server.local_tag();
        let make = |chunk_type: u8| {
            let mut packet = Packet::new(CommonHeader {
                src_port: 5000,
                dst_port: 6000,
                verification_tag: tag,
            });
            packet.chunks.push(Chunk::Unknown {
                chunk_type,
                flags: 0,
                value: Bytes::from_static(&[1, 2, 3, 4]),
            });
            packet.chunks.push(Chunk::Heartbeat(Bytes::from_static(b"ping")));
            packet
        };

        // 00: 조용히 중단
        pair.server_recv(&make(0x30));
        assert!(pair.server_io.take_chunks().is_empty());

        // 01: 보고 후 중단
        pair.server_recv(&make(0x70));
        let chunks = pair.server_io.take_chunks();
        assert_eq!(chunks.len(), 1);
        match &chunks[0].0 {
            Chunk::Error { causes } => {
                assert_eq!(causes[0].code, cause::UNRECOGNIZED_CHUNK);
                assert_eq!(causes[0].info[0], 0x70);
            }
            other => panic!("ERROR 기대: {:?}", other),
        }

        // 10: 건너뜀
        pair.server_recv(&make(0xB0));
        let chunks = pair.server_io.take_chunks();
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0].0, Chunk::HeartbeatAck(_)));

        // 11: 보고 후 건너뜀
        pair.server_recv(&make(0xF0));
        let chunks = pair.server_io.take_chunks();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_graceful_shutdown() {
        let mut pair = Pair::connected(test_config());
        pair.client
            .send(pair.now, Bytes::from_static(b"bye"), SendOptions::default())
            .unwrap();
        pair.client.shutdown(pair.now).unwrap();
        assert_eq!(pair.client.state(), AssocState::ShutdownPending);

        pair.pump();
        assert_eq!(pair.client.state(), AssocState::Closed);
        assert_eq!(pair.server.state(), AssocState::Closed);
        assert_eq!(pair.server_io.take_deliveries().len(), 1);

        let client_events = pair.client_io.take_events();
        assert_eq!(client_events.last(), Some(&Notification::ShutdownComplete));
        assert_eq!(
            client_events.iter().filter(|e| e.is_terminal()).count(),
            1
        );
        let server_events = pair.server_io.take_events();
        assert!(server_events.contains(&Notification::PeerShutdown));
        assert_eq!(server_events.last(), Some(&Notification::ShutdownComplete));
        assert_eq!(pair.client.close_reason(), Some(CloseReason::Graceful));
    }

    #[test]
    fn test_abort_reports_send_failed_then_terminal() {
        let config = Config {
            receive_window: 0,
            ..test_config()
        };
        let mut pair = Pair::new(test_config(), config);
        pair.client.connect(pair.now, &[server_addr()]).unwrap();
        pair.pump();
        pair.client_io.take_events();

        // 윈도우 0이라 전송되지 않고 큐에 남는다
        pair.client
            .send(pair.now, Bytes::from_static(b"stuck"), SendOptions::stream(3))
            .unwrap();
        pair.client.abort().unwrap();
        assert_eq!(pair.client.state(), AssocState::Closed);

        let events = pair.client_io.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            Notification::SendFailed {
                stream: 3,
                ppid: 0,
                data: Bytes::from_static(b"stuck"),
                sent: false,
            }
        );
        assert_eq!(
            events[1],
            Notification::CommLost {
                reason: CloseReason::Aborted
            }
        );

        pair.to_server();
        assert_eq!(pair.server.state(), AssocState::Closed);
        assert_eq!(
            pair.server_io.take_events().last(),
            Some(&Notification::CommLost {
                reason: CloseReason::Reset
            })
        );
        assert!(matches!(
            pair.client.abort(),
            Err(Error::ConnectionClosed(CloseReason::Aborted))
        ));
    }

    #[test]
    fn test_abort_during_handshake_is_refused() {
        let mut pair = Pair::new(test_config(), test_config());
        pair.client.connect(pair.now, &[server_addr()]).unwrap();
        pair.to_server();
        pair.to_client();
        assert_eq!(pair.client.state(), AssocState::CookieEchoed);

        let mut packet = Packet::new(CommonHeader {
            src_port: 6000,
            dst_port: 5000,
            verification_tag: pair.client.local_tag(),
        });
        packet.chunks.push(Chunk::Abort {
            t_bit: false,
            causes: Vec::new(),
        });
        pair.client_recv(&packet);
        assert_eq!(
            pair.client_io.take_events().last(),
            Some(&Notification::CannotStart {
                reason: CloseReason::Refused
            })
        );
    }

    #[test]
    fn test_ootb_shutdown_ack_answered_with_t_bit() {
        let mut pair = Pair::new(test_config(), test_config());
        pair.client.connect(pair.now, &[server_addr()]).unwrap();
        pair.take_from_client();

        let mut packet = Packet::new(CommonHeader {
            src_port: 6000,
            dst_port: 5000,
            verification_tag: 0x1234,
        });
        packet.chunks.push(Chunk::ShutdownAck);
        pair.client_recv(&packet);
        let out = pair.take_from_client();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.header.verification_tag, 0x1234);
        assert_eq!(out[0].0.chunks[0], Chunk::ShutdownComplete { t_bit: true });
        assert_eq!(pair.client.state(), AssocState::CookieWait);
    }

    #[test]
    fn test_listen_aborts_unexpected_chunk() {
        let mut pair = Pair::new(test_config(), test_config());
        let mut packet = Packet::new(CommonHeader {
            src_port: 5000,
            dst_port: 6000,
            verification_tag: 0xABCD,
        });
        packet.chunks.push(Chunk::Sack(SackChunk {
            cum_tsn: 1,
            a_rwnd: 1000,
            gaps: Vec::new(),
            dups: Vec::new(),
        }));
        pair.server_recv(&packet);
        let out = pair.take_from_server();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.header.verification_tag, 0xABCD);
        assert!(matches!(out[0].0.chunks[0], Chunk::Abort { t_bit: true, .. }));
        assert_eq!(pair.server.state(), AssocState::Listen);
    }

    #[test]
    fn test_heartbeat_failover_to_alternate() {
        let config = Config {
            heartbeat_interval: Some(Duration::from_secs(1)),
            path_max_retransmits: 2,
            ..test_config()
        };
        let mut pair = Pair::new(config.clone(), config);
        pair.client
            .connect(pair.now, &[server_addr(), server_alt_addr()])
            .unwrap();
        pair.pump();
        let a = pair.client.peers().find(&server_addr()).unwrap();
        let b = pair.client.peers().find(&server_alt_addr()).unwrap();
        assert_eq!(pair.client.peers().get(a).unwrap().state, PeerState::Alive);
        assert_eq!(pair.client.peers().get(b).unwrap().state, PeerState::Unconfirmed);

        // B 확인 (RTO 후 probe)
        pair.advance(Duration::from_secs(3));
        pair.pump();
        assert_eq!(pair.client.peers().get(b).unwrap().state, PeerState::Alive);
        pair.client_io.take_events();

        // 이후 A로 가는 패킷은 모두 유실
        pair.server_from = server_alt_addr();
        for _ in 0..60 {
            pair.advance(Duration::from_secs(1));
            let packets = pair.take_from_client();
            for (packet, dest) in &packets {
                if dest.addr == server_alt_addr() {
                    pair.server_recv(packet);
                }
            }
            pair.to_client();
            if pair.client.peers().get(a).unwrap().state == PeerState::Down {
                break;
            }
        }

        assert_eq!(pair.client.peers().get(a).unwrap().state, PeerState::Down);
        assert_eq!(pair.client.peers().current(), Some(b));
        assert_eq!(pair.client.state(), AssocState::Established);
        let events = pair.client_io.take_events();
        assert!(events.contains(&Notification::AddressChange {
            addr: server_addr(),
            change: AddressChange::Unreachable,
        }));
        assert!(!events.iter().any(Notification::is_terminal));
    }

    #[test]
    fn test_unreachable_address_at_connect() {
        let now = Instant::now();
        let io = Recorder::new();
        io.set_route(server_addr(), None);
        let mut assoc = Association::new(test_config(), io.collaborators(), 5000, now).unwrap();
        assoc
            .connect(now, &[server_addr(), server_alt_addr()])
            .unwrap();
        let a = assoc.peers().find(&server_addr()).unwrap();
        let b = assoc.peers().find(&server_alt_addr()).unwrap();
        assert_eq!(assoc.peers().get(a).unwrap().state, PeerState::Unreachable);
        assert_eq!(assoc.peers().current(), Some(b));
        let packets = io.take_packets();
        assert_eq!(packets[0].1.addr, server_alt_addr());
        assert!(io.take_events().contains(&Notification::AddressChange {
            addr: server_addr(),
            change: AddressChange::Unreachable,
        }));

        let io = Recorder::new();
        io.set_route(server_addr(), None);
        let mut assoc = Association::new(test_config(), io.collaborators(), 5000, now).unwrap();
        assert!(matches!(
            assoc.connect(now, &[server_addr()]),
            Err(Error::NoPeerAddress)
        ));
    }

    #[test]
    fn test_set_primary() {
        let mut pair = Pair::new(test_config(), test_config());
        pair.client
            .connect(pair.now, &[server_addr(), server_alt_addr()])
            .unwrap();
        pair.pump();
        assert!(matches!(
            pair.client.set_primary(SocketAddr::from(([1, 1, 1, 1], 1))),
            Err(Error::UnknownPeer(_))
        ));
        pair.client.set_primary(server_alt_addr()).unwrap();
        let b = pair.client.peers().find(&server_alt_addr()).unwrap();
        assert_eq!(pair.client.peers().primary(), Some(b));
        // 아직 확인되지 않은 주소는 current가 되지 않는다
        assert_ne!(pair.client.peers().current(), Some(b));
    }

    #[test]
    fn test_autoclose_starts_shutdown() {
        let config = Config {
            autoclose: Some(Duration::from_secs(5)),
            ..test_config()
        };
        let mut pair = Pair::connected(config);
        pair.advance(Duration::from_secs(5));
        assert_eq!(pair.client.state(), AssocState::ShutdownSent);
        pair.pump();
        assert_eq!(pair.client.state(), AssocState::Closed);
        assert_eq!(pair.server.state(), AssocState::Closed);
    }

    #[test]
    fn test_cookie_roundtrip() {
        let cookie = StateCookie {
            peer_tag: 1,
            local_tag: 2,
            peer_initial_tsn: 3,
            local_initial_tsn: 4,
            peer_rwnd: 5,
            peer_outbound: 6,
            peer_inbound: 7,
            forward_tsn: true,
            created_us: 8,
            addresses: vec![IpAddr::from([10, 0, 0, 1]), "2001:db8::1".parse().unwrap()],
        };
        let sealed = cookie.seal(42);
        assert_eq!(StateCookie::open(&sealed, 42), Some(cookie));
        assert_eq!(StateCookie::open(&sealed, 43), None);
        assert_eq!(StateCookie::open(&sealed[..10], 42), None);
    }
}
