//! 송신 메시지와 청크
//!
//! 애플리케이션 메시지는 slab에 보관되고, 송신 순서는 키 목록(VecDeque)으로 유지한다.
//! 메시지는 `complete && 모든 청크 ack` 이거나 abandon된 경우에만 목록에서 빠진다.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use slab::Slab;

use crate::chunk::{data_flags, DATA_HEADER_LEN};
use crate::multipath::PeerId;

/// 송신 목록 내 메시지 핸들
pub type MessageKey = usize;

/// 송신 옵션
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// 스트림 ID
    pub stream: u16,

    /// payload protocol identifier (프로토콜은 해석하지 않음)
    pub ppid: u32,

    /// 비순서 전달
    pub unordered: bool,

    /// PR-SCTP 수명 (None이면 완전 신뢰)
    pub ttl: Option<Duration>,

    /// 명시적 목적지
    pub dest: Option<SocketAddr>,

    /// 레코드 끝 (false면 다음 send가 같은 메시지에 이어 붙음)
    pub eor: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            stream: 0,
            ppid: 0,
            unordered: false,
            ttl: None,
            dest: None,
            eor: true,
        }
    }
}

impl SendOptions {
    pub fn stream(stream: u16) -> Self {
        Self {
            stream,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn unordered(mut self) -> Self {
        self.unordered = true;
        self
    }
}

/// 송신 청크 상태
///
/// 하나의 enum이라 "ack되었으면서 재전송 대상" 같은 조합은 존재할 수 없다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Unsent,
    Sent,
    Acked,
    MarkedRetransmit,
    Abandoned,
}

/// 송신 DATA 청크
#[derive(Debug, Clone)]
pub struct OutChunk {
    pub payload: Bytes,

    /// B/E/U 플래그
    pub flags: u8,

    /// 첫 전송 시 할당
    pub tsn: Option<u32>,

    pub state: ChunkState,

    /// 마지막 전송 목적지
    pub dest: Option<PeerId>,

    /// 전송 횟수
    pub xmit_count: u32,

    /// 이 청크 위로 gap이 보고된 횟수
    pub missing: u8,

    pub sent_at: Option<Instant>,
}

impl OutChunk {
    fn new(payload: Bytes, flags: u8) -> Self {
        Self {
            payload,
            flags,
            tsn: None,
            state: ChunkState::Unsent,
            dest: None,
            xmit_count: 0,
            missing: 0,
            sent_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// 패딩 포함 DATA 청크 크기
    pub fn padded_len(&self) -> usize {
        (DATA_HEADER_LEN + self.payload.len() + 3) & !3
    }

    /// 전송되었고 아직 cumulative ack되지 않은 상태
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self.state,
            ChunkState::Sent | ChunkState::MarkedRetransmit
        )
    }
}

/// 송신 메시지
#[derive(Debug, Clone)]
pub struct Message {
    pub stream: u16,
    pub ppid: u32,

    /// 첫 청크 첫 전송 시 할당 (ordered만)
    pub ssn: Option<u16>,

    pub unordered: bool,

    /// abandon 시각
    pub deadline: Option<Instant>,

    /// 레코드 끝까지 수신됨
    pub complete: bool,

    pub dest: Option<PeerId>,

    pub abandoned: bool,

    pub chunks: Vec<OutChunk>,
}

impl Message {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |d| now >= d)
    }

    /// 한 청크라도 전송됨
    pub fn any_sent(&self) -> bool {
        self.chunks.iter().any(|c| c.tsn.is_some())
    }

    pub fn all_sent(&self) -> bool {
        self.chunks.iter().all(|c| c.tsn.is_some())
    }

    pub fn all_acked(&self) -> bool {
        self.chunks.iter().all(|c| c.state == ChunkState::Acked)
    }

    /// 제거 가능 여부
    pub fn is_done(&self) -> bool {
        self.complete && self.all_acked()
    }

    /// 마지막으로 TSN이 할당된 청크의 TSN
    pub fn last_sent_tsn(&self) -> Option<u32> {
        self.chunks.iter().rev().find_map(|c| c.tsn)
    }

    pub fn unsent_bytes(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.state == ChunkState::Unsent)
            .map(OutChunk::len)
            .sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(OutChunk::len).sum()
    }

    /// 전체 payload (send-failed 보고용)
    pub fn data(&self) -> Bytes {
        if let [only] = self.chunks.as_slice() {
            return only.payload.clone();
        }
        let mut buf = BytesMut::with_capacity(self.total_bytes());
        for chunk in &self.chunks {
            buf.extend_from_slice(&chunk.payload);
        }
        buf.freeze()
    }
}

/// payload를 최대 `max` 바이트 조각으로 분할 (복사 없음)
pub fn fragment(mut payload: Bytes, max: usize) -> Vec<Bytes> {
    let max = max.max(1);
    if payload.is_empty() {
        return vec![payload];
    }
    let mut pieces = Vec::with_capacity((payload.len() + max - 1) / max);
    while payload.len() > max {
        pieces.push(payload.split_to(max));
    }
    pieces.push(payload);
    pieces
}

/// 송신 목록
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: Slab<Message>,
    order: VecDeque<MessageKey>,

    /// 미전송 payload 바이트
    unsent_bytes: usize,

    /// 전송 후 cumulative ack되지 않은 payload 바이트
    unacked_bytes: usize,

    /// 스트림별 아직 레코드 끝이 오지 않은 메시지
    open: HashMap<u16, MessageKey>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn unsent_bytes(&self) -> usize {
        self.unsent_bytes
    }

    pub fn unacked_bytes(&self) -> usize {
        self.unacked_bytes
    }

    /// 송신 버퍼 점유량
    pub fn buffered(&self) -> usize {
        self.unsent_bytes + self.unacked_bytes
    }

    /// 미전송 청크가 하나라도 있는지
    pub fn has_unsent(&self) -> bool {
        self.unsent_bytes > 0
            || self.iter().any(|(_, m)| m.chunks.iter().any(|c| c.state == ChunkState::Unsent))
    }

    /// 전송됐지만 ack되지 않은 청크가 있는지
    pub fn has_outstanding(&self) -> bool {
        self.iter()
            .any(|(_, m)| m.chunks.iter().any(OutChunk::is_outstanding))
    }

    /// 메시지 추가 또는 열린 메시지에 이어 붙임
    pub fn push(
        &mut self,
        data: Bytes,
        opts: &SendOptions,
        dest: Option<PeerId>,
        deadline: Option<Instant>,
        max_fragment: usize,
    ) -> MessageKey {
        let len = data.len();
        let open = self.open.get(&opts.stream).copied();

        let key = match open.filter(|k| self.messages.contains(*k)) {
            Some(key) => key,
            None => {
                let key = self.messages.insert(Message {
                    stream: opts.stream,
                    ppid: opts.ppid,
                    ssn: None,
                    unordered: opts.unordered,
                    deadline,
                    complete: false,
                    dest,
                    abandoned: false,
                    chunks: Vec::new(),
                });
                self.order.push_back(key);
                key
            }
        };

        if let Some(msg) = self.messages.get_mut(key) {
            let base = if msg.unordered { data_flags::UNORDERED } else { 0 };
            let first = msg.chunks.is_empty();
            let pieces = fragment(data, max_fragment);
            let count = pieces.len();
            for (i, piece) in pieces.into_iter().enumerate() {
                let mut flags = base;
                if first && i == 0 {
                    flags |= data_flags::BEGIN;
                }
                if opts.eor && i + 1 == count {
                    flags |= data_flags::END;
                }
                msg.chunks.push(OutChunk::new(piece, flags));
            }
            msg.complete = opts.eor;
        }

        if opts.eor {
            self.open.remove(&opts.stream);
        } else {
            self.open.insert(opts.stream, key);
        }
        self.unsent_bytes += len;
        key
    }

    pub fn get(&self, key: MessageKey) -> Option<&Message> {
        self.messages.get(key)
    }

    pub fn get_mut(&mut self, key: MessageKey) -> Option<&mut Message> {
        self.messages.get_mut(key)
    }

    /// 송신 순서대로 키 목록
    pub fn keys(&self) -> Vec<MessageKey> {
        self.order.iter().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MessageKey, &Message)> {
        self.order
            .iter()
            .filter_map(|&k| self.messages.get(k).map(|m| (k, m)))
    }

    /// 더 이상 이어 붙이지 않도록 메시지를 닫음 (abandon)
    pub fn seal(&mut self, key: MessageKey) {
        if let Some(msg) = self.messages.get_mut(key) {
            if self.open.get(&msg.stream) == Some(&key) {
                self.open.remove(&msg.stream);
            }
            msg.complete = true;
        }
    }

    /// 청크 상태 전환과 바이트 카운터를 함께 갱신
    ///
    /// 반환값은 이전 상태.
    pub fn set_chunk_state(
        &mut self,
        key: MessageKey,
        idx: usize,
        state: ChunkState,
    ) -> Option<ChunkState> {
        let chunk = self.messages.get_mut(key)?.chunks.get_mut(idx)?;
        let prev = chunk.state;
        let len = chunk.len();
        chunk.state = state;

        use ChunkState::*;
        match (prev, state) {
            (Unsent, Sent) | (Unsent, MarkedRetransmit) => {
                self.unsent_bytes = self.unsent_bytes.saturating_sub(len);
                self.unacked_bytes += len;
            }
            (Unsent, Abandoned) | (Unsent, Acked) => {
                self.unsent_bytes = self.unsent_bytes.saturating_sub(len);
            }
            _ => {}
        }
        Some(prev)
    }

    /// cumulative ack로 청크가 확정되면 unacked에서 차감
    pub fn release_acked(&mut self, bytes: usize) {
        self.unacked_bytes = self.unacked_bytes.saturating_sub(bytes);
    }

    /// 메시지 제거 (남은 바이트 카운터 정리)
    pub fn remove(&mut self, key: MessageKey) -> Option<Message> {
        let msg = self.messages.try_remove(key)?;
        self.order.retain(|&k| k != key);
        if self.open.get(&msg.stream) == Some(&key) {
            self.open.remove(&msg.stream);
        }
        self.unsent_bytes = self.unsent_bytes.saturating_sub(msg.unsent_bytes());
        Some(msg)
    }

    /// 전체 비우기 (teardown)
    pub fn drain(&mut self) -> Vec<Message> {
        let keys: Vec<_> = self.order.drain(..).collect();
        let out = keys
            .into_iter()
            .filter_map(|k| self.messages.try_remove(k))
            .collect();
        self.messages.clear();
        self.open.clear();
        self.unsent_bytes = 0;
        self.unacked_bytes = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragmentation_flags() {
        let mut queue = OutboundQueue::new();
        let data = Bytes::from(vec![7u8; 2500]);
        let key = queue.push(data, &SendOptions::stream(1), None, None, 1000);

        let msg = queue.get(key).unwrap();
        assert!(msg.complete);
        assert_eq!(msg.chunks.len(), 3);
        assert_eq!(msg.chunks[0].flags, data_flags::BEGIN);
        assert_eq!(msg.chunks[1].flags, 0);
        assert_eq!(msg.chunks[2].flags, data_flags::END);
        assert_eq!(msg.chunks[2].len(), 500);
        assert_eq!(queue.unsent_bytes(), 2500);
    }

    #[test]
    fn test_single_unordered_chunk() {
        let mut queue = OutboundQueue::new();
        let key = queue.push(
            Bytes::from_static(b"hi"),
            &SendOptions::stream(0).unordered(),
            None,
            None,
            1000,
        );
        let flags = queue.get(key).unwrap().chunks[0].flags;
        assert_eq!(
            flags,
            data_flags::UNORDERED | data_flags::BEGIN | data_flags::END
        );
    }

    #[test]
    fn test_append_until_eor() {
        let mut queue = OutboundQueue::new();
        let partial = SendOptions {
            eor: false,
            ..SendOptions::stream(2)
        };
        let k1 = queue.push(Bytes::from_static(b"abc"), &partial, None, None, 1000);
        assert!(!queue.get(k1).unwrap().complete);

        let k2 = queue.push(Bytes::from_static(b"def"), &SendOptions::stream(2), None, None, 1000);
        assert_eq!(k1, k2);
        assert_eq!(queue.len(), 1);

        let msg = queue.get(k1).unwrap();
        assert!(msg.complete);
        assert_eq!(msg.chunks[0].flags, data_flags::BEGIN);
        assert_eq!(msg.chunks[1].flags, data_flags::END);

        // 다음 send는 새 메시지
        let k3 = queue.push(Bytes::from_static(b"g"), &SendOptions::stream(2), None, None, 1000);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_state_accounting() {
        let mut queue = OutboundQueue::new();
        let key = queue.push(Bytes::from(vec![0u8; 300]), &SendOptions::stream(0), None, None, 100);
        queue.set_chunk_state(key, 0, ChunkState::Sent);
        queue.set_chunk_state(key, 1, ChunkState::Sent);
        assert_eq!(queue.unsent_bytes(), 100);
        assert_eq!(queue.unacked_bytes(), 200);

        queue.set_chunk_state(key, 2, ChunkState::Abandoned);
        assert_eq!(queue.unsent_bytes(), 0);

        queue.release_acked(200);
        assert_eq!(queue.buffered(), 0);
        assert!(queue.remove(key).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_payload_single_fragment() {
        assert_eq!(fragment(Bytes::new(), 100).len(), 1);
        assert_eq!(fragment(Bytes::from_static(&[1; 200]), 100).len(), 2);
    }
}
