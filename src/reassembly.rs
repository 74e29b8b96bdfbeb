//! 수신 메시지 재조립
//!
//! - ordered: 스트림별 SSN 큐, next_ssn 메시지가 완성될 때만 전달
//! - unordered: TSN 순서로 연결, 완성되면 즉시 전달
//! - 부분 전달: partial_delivery_point 이상 연속 조각이 모이면 먼저 올려 보냄

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::chunk::DataChunk;
use crate::io::{Delivery, DeliveryFlags};
use crate::seq::{ssn_ge, ssn_le, ssn_lt, tsn_le, tsn_lt};
use crate::{Error, Result};

/// TSN 순 정렬 삽입, 중복이면 false
fn insert_sorted(frags: &mut Vec<DataChunk>, chunk: DataChunk) -> bool {
    let pos = frags
        .iter()
        .position(|f| !tsn_lt(f.tsn, chunk.tsn))
        .unwrap_or(frags.len());
    if frags.get(pos).map_or(false, |f| f.tsn == chunk.tsn) {
        return false;
    }
    frags.insert(pos, chunk);
    true
}

/// `frags[start..]`에서 TSN이 연속되는 개수
fn contiguous_run(frags: &[DataChunk], start: usize) -> usize {
    let mut count = 0;
    let mut expect = None;
    for f in &frags[start..] {
        if expect.map_or(false, |e| e != f.tsn) {
            break;
        }
        expect = Some(f.tsn.wrapping_add(1));
        count += 1;
    }
    count
}

fn concat(frags: &[DataChunk]) -> Bytes {
    if let [only] = frags {
        return only.payload.clone();
    }
    let total = frags.iter().map(|f| f.payload.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for f in frags {
        buf.extend_from_slice(&f.payload);
    }
    buf.freeze()
}

fn bytes_of(frags: &[DataChunk]) -> usize {
    frags.iter().map(|f| f.payload.len()).sum()
}

/// 조립 중인 ordered 메시지 하나
#[derive(Debug, Default)]
struct PendingMessage {
    frags: Vec<DataChunk>,

    /// 부분 전달 진행 중이면 다음에 올려 보낼 TSN
    pd_next_tsn: Option<u32>,
}

impl PendingMessage {
    /// 맨 앞부터 연속된 조각 수 (부분 전달 중이면 pd_next_tsn부터)
    fn deliverable_prefix(&self) -> usize {
        match (self.frags.first(), self.pd_next_tsn) {
            (Some(first), Some(next)) if first.tsn == next => contiguous_run(&self.frags, 0),
            (Some(first), None) if first.is_begin() => contiguous_run(&self.frags, 0),
            _ => 0,
        }
    }

    /// 연속 구간이 E 조각으로 끝나는지
    fn is_complete(&self) -> bool {
        let n = self.deliverable_prefix();
        n > 0 && self.frags[n - 1].is_end()
    }
}

/// 스트림별 수신 상태
#[derive(Debug, Default)]
pub struct InboundStream {
    /// 다음에 전달할 SSN
    pub next_ssn: u16,
    pending: HashMap<u16, PendingMessage>,
}

impl InboundStream {
    fn partial_in_progress(&self) -> bool {
        self.pending.values().any(|m| m.pd_next_tsn.is_some())
    }
}

/// FORWARD-TSN 적용 결과
#[derive(Debug, Default)]
pub struct SkipOutcome {
    pub deliveries: Vec<Delivery>,
    /// (stream, ssn) 부분 전달 중 폐기된 메시지
    pub pd_aborted: Vec<(u16, u16)>,
    pub invalid_streams: Vec<u16>,
}

/// association 수신 재조립 상태
#[derive(Debug)]
pub struct Reassembly {
    streams: Vec<InboundStream>,
    unordered: Vec<DataChunk>,
    pd_point: Option<usize>,
    interleave: bool,
    /// 재조립 큐에 보관 중인 바이트 (rwnd 계산용)
    queued: usize,
}

impl Reassembly {
    pub fn new(streams: u16, pd_point: Option<usize>, interleave: bool) -> Self {
        Self {
            streams: (0..streams).map(|_| InboundStream::default()).collect(),
            unordered: Vec::new(),
            pd_point,
            interleave,
            queued: 0,
        }
    }

    pub fn stream_count(&self) -> u16 {
        self.streams.len() as u16
    }

    /// 핸드쉐이크로 합의된 수신 스트림 수 적용
    pub fn set_stream_count(&mut self, count: u16) {
        self.streams.resize_with(count as usize, InboundStream::default);
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    pub fn stream(&self, sid: u16) -> Option<&InboundStream> {
        self.streams.get(sid as usize)
    }

    fn pd_active(&self) -> bool {
        self.streams.iter().any(InboundStream::partial_in_progress)
    }

    /// 조각 하나 수신 (스트림 ID는 호출 측에서 검증)
    pub fn insert(&mut self, chunk: DataChunk) -> Result<Vec<Delivery>> {
        if chunk.is_unordered() {
            return Ok(self.insert_unordered(chunk));
        }

        let sid = chunk.stream;
        let ssn = chunk.ssn;
        let Some(stream) = self.streams.get_mut(sid as usize) else {
            return Err(Error::InvalidStream {
                stream: sid,
                max: self.streams.len() as u16,
            });
        };
        if ssn_lt(ssn, stream.next_ssn) {
            trace!("이미 전달된 SSN 무시: stream={} ssn={}", sid, ssn);
            return Ok(Vec::new());
        }

        let len = chunk.payload.len();
        let msg = stream.pending.entry(ssn).or_default();
        if let Some(next) = msg.pd_next_tsn {
            if tsn_lt(chunk.tsn, next) {
                return Ok(Vec::new());
            }
        }
        if insert_sorted(&mut msg.frags, chunk) {
            self.queued += len;
        }

        self.drain_stream(sid)
    }

    fn insert_unordered(&mut self, chunk: DataChunk) -> Vec<Delivery> {
        if chunk.is_begin() && chunk.is_end() {
            return vec![Self::deliver_unordered(std::slice::from_ref(&chunk))];
        }

        let len = chunk.payload.len();
        let tsn = chunk.tsn;
        if !insert_sorted(&mut self.unordered, chunk) {
            return Vec::new();
        }
        self.queued += len;

        // 새 조각이 속한 연속 구간을 찾는다
        let Some(pos) = self.unordered.iter().position(|f| f.tsn == tsn) else {
            return Vec::new();
        };
        let mut start = pos;
        while !self.unordered[start].is_begin() {
            if start == 0 || self.unordered[start - 1].tsn.wrapping_add(1) != self.unordered[start].tsn {
                return Vec::new();
            }
            start -= 1;
        }
        let mut end = pos;
        while !self.unordered[end].is_end() {
            if end + 1 >= self.unordered.len()
                || self.unordered[end].tsn.wrapping_add(1) != self.unordered[end + 1].tsn
            {
                return Vec::new();
            }
            end += 1;
        }

        let frags: Vec<DataChunk> = self.unordered.drain(start..=end).collect();
        self.queued = self.queued.saturating_sub(bytes_of(&frags));
        vec![Self::deliver_unordered(&frags)]
    }

    fn deliver_unordered(frags: &[DataChunk]) -> Delivery {
        let first = &frags[0];
        Delivery {
            stream: first.stream,
            ssn: first.ssn,
            ppid: first.ppid,
            tsn: first.tsn,
            data: concat(frags),
            flags: DeliveryFlags {
                unordered: true,
                eor: true,
                partial: false,
            },
        }
    }

    /// next_ssn부터 전달 가능한 메시지를 모두 꺼낸다
    fn drain_stream(&mut self, sid: u16) -> Result<Vec<Delivery>> {
        let pd_busy_elsewhere = {
            let others = self
                .streams
                .iter()
                .enumerate()
                .any(|(i, s)| i != sid as usize && s.partial_in_progress());
            others && !self.interleave
        };
        let pd_point = self.pd_point;

        let Some(stream) = self.streams.get_mut(sid as usize) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut released = 0;

        loop {
            let ssn = stream.next_ssn;
            let Some(msg) = stream.pending.get_mut(&ssn) else {
                break;
            };

            if msg.is_complete() {
                let n = msg.deliverable_prefix();
                let frags: Vec<DataChunk> = msg.frags.drain(..n).collect();
                let partial = msg.pd_next_tsn.is_some();
                released += bytes_of(&frags);
                out.push(ordered_delivery(&frags, true, partial));
                stream.pending.remove(&ssn);
                stream.next_ssn = ssn.wrapping_add(1);
                continue;
            }

            // 부분 전달
            let Some(point) = pd_point else {
                break;
            };
            if msg.pd_next_tsn.is_none() {
                let has_begin = msg.frags.iter().any(DataChunk::is_begin);
                if !has_begin || pd_busy_elsewhere {
                    break;
                }
                if !msg.frags[0].is_begin() {
                    return Err(Error::ProtocolViolation("부분 전달 첫 조각에 B 비트 없음"));
                }
                let n = msg.deliverable_prefix();
                if bytes_of(&msg.frags[..n]) < point {
                    break;
                }
            }

            let n = msg.deliverable_prefix();
            if n == 0 {
                break;
            }
            let frags: Vec<DataChunk> = msg.frags.drain(..n).collect();
            msg.pd_next_tsn = frags.last().map(|f| f.tsn.wrapping_add(1));
            released += bytes_of(&frags);
            debug!("부분 전달: stream={} ssn={} {} bytes", sid, ssn, bytes_of(&frags));
            out.push(ordered_delivery(&frags, false, true));
            break;
        }

        self.queued = self.queued.saturating_sub(released);
        Ok(out)
    }

    /// FORWARD-TSN 적용
    pub fn skip(&mut self, new_cum: u32, pairs: &[(u16, u16)]) -> SkipOutcome {
        let mut outcome = SkipOutcome::default();

        let before = self.unordered.len();
        let mut dropped = 0;
        self.unordered.retain(|f| {
            let keep = !tsn_le(f.tsn, new_cum);
            if !keep {
                dropped += f.payload.len();
            }
            keep
        });
        if before != self.unordered.len() {
            trace!("FORWARD-TSN: unordered 조각 {}개 폐기", before - self.unordered.len());
        }
        self.queued = self.queued.saturating_sub(dropped);

        for &(sid, ssn) in pairs {
            let Some(stream) = self.streams.get_mut(sid as usize) else {
                outcome.invalid_streams.push(sid);
                continue;
            };

            let stale: Vec<u16> = stream
                .pending
                .keys()
                .copied()
                .filter(|&k| ssn_le(k, ssn))
                .collect();
            let mut freed = 0;
            for k in stale {
                if let Some(msg) = stream.pending.remove(&k) {
                    if msg.pd_next_tsn.is_some() {
                        outcome.pd_aborted.push((sid, k));
                    }
                    freed += bytes_of(&msg.frags);
                }
            }
            if ssn_ge(ssn, stream.next_ssn) {
                stream.next_ssn = ssn.wrapping_add(1);
            }
            self.queued = self.queued.saturating_sub(freed);

            // 다른 스트림 부분 전달 제약 때문에 실패하지 않는다 (B 검사만 가능)
            match self.drain_stream(sid) {
                Ok(mut d) => outcome.deliveries.append(&mut d),
                Err(e) => debug!("FORWARD-TSN 이후 전달 실패: {}", e),
            }
        }

        // 진행 중이던 부분 전달이 사라졌으면 대기하던 다른 스트림을 깨움
        if !outcome.pd_aborted.is_empty() {
            match self.retry_all() {
                Ok(mut d) => outcome.deliveries.append(&mut d),
                Err(e) => debug!("FORWARD-TSN 이후 재시도 실패: {}", e),
            }
        }

        outcome
    }

    /// 다른 스트림의 부분 전달이 끝난 뒤 대기 중인 스트림 재시도
    pub fn retry_all(&mut self) -> Result<Vec<Delivery>> {
        let mut out = Vec::new();
        if self.pd_active() && !self.interleave {
            return Ok(out);
        }
        for sid in 0..self.streams.len() as u16 {
            out.extend(self.drain_stream(sid)?);
        }
        Ok(out)
    }
}

fn ordered_delivery(frags: &[DataChunk], eor: bool, partial: bool) -> Delivery {
    let first = &frags[0];
    Delivery {
        stream: first.stream,
        ssn: first.ssn,
        ppid: first.ppid,
        tsn: first.tsn,
        data: concat(frags),
        flags: DeliveryFlags {
            unordered: false,
            eor,
            partial,
        },
    }
}
