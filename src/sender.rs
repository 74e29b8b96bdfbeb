//! 송신 엔진
//!
//! - 메시지 분할과 송신 버퍼 검사
//! - 목적지 선택, cwnd / 피어 윈도우 기반 번들링
//! - Nagle, SACK piggyback, burst 제한
//! - TSN / SSN 할당과 목적지별 in-flight 계산

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::association::{AssocState, Association};
use crate::chunk::{Chunk, CommonHeader, DataChunk, Packet, DATA_HEADER_LEN};
use crate::io::Destination;
use crate::message::{ChunkState, MessageKey, SendOptions};
use crate::multipath::PeerId;
use crate::retransmit::RttSample;
use crate::timer::TimerKey;
use crate::{Error, Result};

/// 번들링 후보 (메시지 키, 청크 인덱스, 패딩 포함 크기, payload 크기, 지정 목적지)
type Candidate = (MessageKey, usize, usize, u32, Option<PeerId>);

impl Association {
    /// 메시지 송신 요청
    ///
    /// 큐에 넣은 뒤 ESTABLISHED면 바로 송신 기회를 돌린다.
    /// 핸드쉐이크 중에는 큐에만 쌓였다가 수립 후 전송된다.
    pub fn send(&mut self, now: Instant, data: Bytes, opts: SendOptions) -> Result<()> {
        match self.state {
            AssocState::CookieWait | AssocState::CookieEchoed | AssocState::Established => {}
            AssocState::Closed => return Err(self.closed_error()),
            s => {
                return Err(Error::InvalidState {
                    state: s.name(),
                    op: "send",
                })
            }
        }
        if data.is_empty() {
            return Err(Error::ProtocolViolation("빈 메시지는 보낼 수 없음"));
        }
        if opts.stream >= self.out_streams {
            return Err(Error::InvalidStream {
                stream: opts.stream,
                max: self.out_streams,
            });
        }
        if self.outbound.buffered() + data.len() > self.config.send_buffer {
            return Err(Error::BufferOverflow {
                max_size: self.config.send_buffer,
            });
        }
        let dest = match opts.dest {
            Some(addr) => Some(self.peers.find(&addr).ok_or(Error::UnknownPeer(addr))?),
            None => None,
        };

        let deadline = opts.ttl.map(|ttl| now + ttl);
        let len = data.len();
        let key = self
            .outbound
            .push(data, &opts, dest, deadline, self.max_fragment());
        trace!(
            "메시지 큐잉: key={} stream={} len={} eor={}",
            key,
            opts.stream,
            len,
            opts.eor
        );

        self.last_activity = now;
        if self.state == AssocState::Established {
            self.output(now);
        }
        Ok(())
    }

    /// 조각 최대 크기: 가장 작은 경로 MSS - DATA 헤더
    fn max_fragment(&self) -> usize {
        let mss = self
            .peers
            .min_mss()
            .unwrap_or_else(|| self.config.initial_mtu.saturating_sub(32));
        (mss as usize).saturating_sub(DATA_HEADER_LEN).max(1)
    }

    /// 패킷 조립 후 출력
    pub(crate) fn transmit(
        &mut self,
        dest: Destination,
        dst_port: u16,
        vtag: u32,
        chunks: Vec<Chunk>,
    ) -> io::Result<usize> {
        let mut packet = Packet::new(CommonHeader {
            src_port: self.local_port,
            dst_port,
            verification_tag: vtag,
        });
        packet.chunks = chunks;
        let raw = packet.to_bytes();
        let len = raw.len();
        trace!(
            "→ {} {} bytes, 청크 {}개 (df={})",
            dest.addr,
            len,
            packet.chunks.len(),
            dest.dont_fragment
        );
        self.io.output.send(raw, &dest)?;
        self.stats.packets_sent += 1;
        Ok(len)
    }

    /// association 밖 주소로 응답 (OOTB, LISTEN)
    pub(crate) fn send_raw(
        &mut self,
        addr: SocketAddr,
        dst_port: u16,
        vtag: u32,
        source: Option<IpAddr>,
        chunks: Vec<Chunk>,
    ) {
        let dest = Destination {
            addr,
            source,
            dont_fragment: true,
        };
        if let Err(e) = self.transmit(dest, dst_port, vtag, chunks) {
            debug!("{} 응답 전송 실패: {}", addr, e);
        }
    }

    /// 제어 청크 전송 (None이면 current 목적지)
    pub(crate) fn send_chunks(&mut self, id: Option<PeerId>, chunks: Vec<Chunk>) {
        let Some(id) = id.or(self.peers.current()) else {
            return;
        };
        let Some(dest) = self.destination(id) else {
            return;
        };
        match self.transmit(dest, self.peer_port, self.peer_tag, chunks) {
            Ok(len) => {
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.stats.record_send(len);
                }
            }
            Err(e) => self.output_error(id, &e),
        }
    }

    pub(crate) fn destination(&self, id: PeerId) -> Option<Destination> {
        self.peers.get(id).map(|peer| Destination {
            addr: peer.addr,
            source: peer.source,
            dont_fragment: true,
        })
    }

    /// 출력 실패: back-pressure는 혼잡 신호
    pub(crate) fn output_error(&mut self, id: PeerId, e: &io::Error) {
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        if e.kind() == io::ErrorKind::WouldBlock {
            peer.cc.on_congestion(&mut peer.cwnd);
            debug!("출력 혼잡: {} cwnd={}", peer.addr, peer.cwnd.cwnd);
        } else {
            debug!("{} 패킷 출력 실패: {}", peer.addr, e);
        }
    }

    /// 청크 전송 기록과 DATA 청크 생성
    ///
    /// 첫 전송이면 TSN을, 메시지 첫 청크면 SSN(ordered)을 할당한다.
    /// 목적지 in-flight에 payload 크기를 더한다.
    pub(crate) fn mark_sent(
        &mut self,
        now: Instant,
        key: MessageKey,
        idx: usize,
        id: PeerId,
    ) -> Option<DataChunk> {
        let msg = self.outbound.get_mut(key)?;
        if msg.ssn.is_none() && !msg.unordered {
            let slot = self.out_ssn.get_mut(msg.stream as usize)?;
            msg.ssn = Some(*slot);
            *slot = slot.wrapping_add(1);
        }

        let chunk = msg.chunks.get_mut(idx)?;
        let tsn = match chunk.tsn {
            Some(tsn) => tsn,
            None => {
                let tsn = self.next_tsn;
                self.next_tsn = tsn.wrapping_add(1);
                chunk.tsn = Some(tsn);
                tsn
            }
        };
        chunk.dest = Some(id);
        chunk.xmit_count += 1;
        chunk.sent_at = Some(now);
        chunk.missing = 0;
        let retransmit = chunk.xmit_count > 1;
        let len = chunk.len() as u32;
        let data = DataChunk {
            flags: chunk.flags,
            tsn,
            stream: msg.stream,
            ssn: msg.ssn.unwrap_or(0),
            ppid: msg.ppid,
            payload: chunk.payload.clone(),
        };

        self.outbound.set_chunk_state(key, idx, ChunkState::Sent);
        self.stats.data_chunks_sent += 1;
        self.stats.bytes_sent += len as u64;
        if retransmit {
            self.stats.retransmitted_chunks += 1;
        }
        if let Some(peer) = self.peers.get_mut(id) {
            peer.flight += len;
            if retransmit {
                peer.stats.retransmitted_chunks += 1;
            }
        }
        Some(data)
    }

    /// 데이터 패킷 송신 후처리: RTT 샘플, T3, Nagle 기록
    pub(crate) fn data_sent(&mut self, now: Instant, id: PeerId, highest_tsn: Option<u32>, len: usize) {
        if let (None, Some(tsn)) = (self.rtt_sample, highest_tsn) {
            self.rtt_sample = Some(RttSample {
                tsn,
                sent_at: now,
                peer: id,
            });
        }
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        peer.lastactive = now;
        peer.last_sent_len = len as u32;
        peer.stats.record_send(len);
        let deadline = now + peer.rto.rto();
        self.timers.start_if_idle(TimerKey::Retransmit(id), deadline);
        self.last_activity = now;
    }

    /// 송신 기회
    ///
    /// 재전송 표시된 청크 → 만료 메시지 폐기 → 새 데이터 순서로 처리한다.
    pub(crate) fn output(&mut self, now: Instant) {
        if !self.state.can_transmit() {
            return;
        }
        self.retransmit_marked(now);
        self.abandon_expired(now);
        for _ in 0..self.config.max_burst {
            if self.state == AssocState::Closed || !self.output_packet(now) {
                break;
            }
        }
    }

    /// 미전송 청크 목록 (송신 순서)
    pub(crate) fn unsent_candidates(&self, limit: usize) -> Vec<Candidate> {
        let mut out = Vec::new();
        let mut bytes = 0usize;
        for (key, msg) in self.outbound.iter() {
            if msg.abandoned {
                continue;
            }
            for (idx, chunk) in msg.chunks.iter().enumerate() {
                if chunk.state != ChunkState::Unsent {
                    continue;
                }
                out.push((key, idx, chunk.padded_len(), chunk.len() as u32, msg.dest));
                bytes += chunk.padded_len();
                if bytes > limit {
                    return out;
                }
            }
        }
        out
    }

    /// 새 데이터 패킷 하나 전송 시도 (보냈으면 true)
    fn output_packet(&mut self, now: Instant) -> bool {
        let Some(current) = self.peers.current() else {
            return false;
        };
        let first = match self.unsent_candidates(0).first() {
            Some(first) => *first,
            None => return false,
        };
        let id = first.4.filter(|id| self.peers.get(*id).is_some()).unwrap_or(current);

        let unacked = self.outbound.unacked_bytes() as u32;
        let unsent = self.outbound.unsent_bytes() as u32;
        let frwnd = self.peer_rwnd.saturating_sub(unacked);
        let nodelay = self.config.no_delay;
        let nagle_limit = self.config.nagle_limit;

        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        let pmss = peer.pmss as usize;

        if frwnd == 0 {
            if unacked == 0 {
                // zero window: T3를 probe 타이머로 사용
                if !self.zero_win_probe {
                    debug!("피어 윈도우 0: 전송 중단, probe 대기");
                }
                self.zero_win_probe = true;
                let deadline = now + peer.rto.rto();
                self.timers.start_if_idle(TimerKey::Retransmit(id), deadline);
            }
            return false;
        }

        if peer.flight == 0 && now.saturating_duration_since(peer.lastactive) > peer.rto.rto() {
            peer.cc.after_idle(&mut peer.cwnd);
            trace!("{} idle 후 재시작 cwnd={}", peer.addr, peer.cwnd.cwnd);
        }
        if peer.flight >= peer.cwnd.cwnd {
            return false;
        }
        let cansend = frwnd.min(peer.cwnd.cwnd - peer.flight);

        let naglim = (peer.pmss.saturating_sub(DATA_HEADER_LEN as u32)).min(nagle_limit);
        if cansend.min(unsent) < naglim
            && unacked != 0
            && peer.last_sent_len < naglim
            && !nodelay
        {
            trace!("Nagle: 송신 보류 ({} bytes)", unsent);
            return false;
        }

        let mut chunks = Vec::new();
        let mut used = 0usize;
        let mut piggyback = false;
        if self.recv.sack_pending() && self.peers.last_data_from() == Some(id) {
            let sack = self.build_sack();
            if sack.padded_len() + first.2 <= pmss {
                used += sack.padded_len();
                chunks.push(sack);
                piggyback = true;
            }
        }

        let mut data_bytes = 0u32;
        let mut highest = None;
        let mut count = 0usize;
        for (key, idx, padded, len, dest) in self.unsent_candidates(pmss) {
            if dest.unwrap_or(current) != id {
                break;
            }
            if count > 0 && (used + padded > pmss || data_bytes + len > cansend) {
                break;
            }
            let Some(data) = self.mark_sent(now, key, idx, id) else {
                break;
            };
            highest = Some(data.tsn);
            used += padded;
            data_bytes += len;
            count += 1;
            chunks.push(Chunk::Data(data));
        }
        if count == 0 {
            return false;
        }

        let Some(mut dest) = self.destination(id) else {
            return false;
        };
        dest.dont_fragment = used <= pmss;
        trace!(
            "DATA {}개 ({} bytes) → {:?}, cwnd 여유 {}",
            count,
            data_bytes,
            id,
            cansend
        );
        if let Err(e) = self.transmit(dest, self.peer_port, self.peer_tag, chunks) {
            self.output_error(id, &e);
        }
        if piggyback {
            self.sack_sent();
        }
        self.data_sent(now, id, highest, used);
        true
    }
}
