//! 와이어 포맷: 공통 헤더, 청크, 파라미터
//!
//! - 모든 청크는 4바이트 헤더(type, flags, length) + 본문, 4바이트 패딩
//! - 패킷 체크섬은 CRC32c (little-endian, 체크섬 필드 0으로 계산)
//! - 디코딩 단계에서 구조 검증까지 수행, 실패하면 패킷 전체 폐기

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// 공통 헤더 길이
pub const COMMON_HEADER_LEN: usize = 12;

/// 청크 헤더 길이
pub const CHUNK_HEADER_LEN: usize = 4;

/// DATA 청크 헤더 길이 (청크 헤더 포함)
pub const DATA_HEADER_LEN: usize = 16;

/// SACK 하나에 담는 최대 gap block 수
pub const MAX_GAP_BLOCKS: usize = 64;

/// SACK 하나에 담는 최대 duplicate TSN 수
pub const MAX_DUP_TSNS: usize = 32;

/// DATA 청크 플래그
pub mod data_flags {
    pub const END: u8 = 0x01;
    pub const BEGIN: u8 = 0x02;
    pub const UNORDERED: u8 = 0x04;
}

/// ABORT / SHUTDOWN-COMPLETE의 T 비트
pub const T_BIT: u8 = 0x01;

/// 에러 원인 코드
pub mod cause {
    pub const INVALID_STREAM: u16 = 1;
    pub const MISSING_PARAM: u16 = 2;
    pub const STALE_COOKIE: u16 = 3;
    pub const NO_RESOURCES: u16 = 4;
    pub const UNRESOLVABLE_ADDR: u16 = 5;
    pub const UNRECOGNIZED_CHUNK: u16 = 6;
    pub const INVALID_PARAM: u16 = 7;
    pub const UNRECOGNIZED_PARAMS: u16 = 8;
    pub const NO_USER_DATA: u16 = 9;
    pub const COOKIE_IN_SHUTDOWN: u16 = 10;
    pub const PROTOCOL_VIOLATION: u16 = 13;
}

/// INIT / INIT-ACK / HEARTBEAT 파라미터 타입
pub mod param {
    pub const HEARTBEAT_INFO: u16 = 1;
    pub const IPV4_ADDR: u16 = 5;
    pub const IPV6_ADDR: u16 = 6;
    pub const STATE_COOKIE: u16 = 7;
    pub const UNRECOGNIZED: u16 = 8;
    pub const COOKIE_PRESERVATIVE: u16 = 9;
    pub const FORWARD_TSN_SUPPORTED: u16 = 0xC000;
}

/// 청크 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkType {
    Data = 0,
    Init = 1,
    InitAck = 2,
    Sack = 3,
    Heartbeat = 4,
    HeartbeatAck = 5,
    Abort = 6,
    Shutdown = 7,
    ShutdownAck = 8,
    Error = 9,
    CookieEcho = 10,
    CookieAck = 11,
    ShutdownComplete = 14,
    ForwardTsn = 192,
}

impl ChunkType {
    pub fn from_u8(v: u8) -> Option<Self> {
        let t = match v {
            0 => ChunkType::Data,
            1 => ChunkType::Init,
            2 => ChunkType::InitAck,
            3 => ChunkType::Sack,
            4 => ChunkType::Heartbeat,
            5 => ChunkType::HeartbeatAck,
            6 => ChunkType::Abort,
            7 => ChunkType::Shutdown,
            8 => ChunkType::ShutdownAck,
            9 => ChunkType::Error,
            10 => ChunkType::CookieEcho,
            11 => ChunkType::CookieAck,
            14 => ChunkType::ShutdownComplete,
            192 => ChunkType::ForwardTsn,
            _ => return None,
        };
        Some(t)
    }

    /// 본문 최소 길이 (청크 헤더 제외)
    fn min_value_len(self) -> usize {
        match self {
            ChunkType::Data => DATA_HEADER_LEN - CHUNK_HEADER_LEN,
            ChunkType::Init | ChunkType::InitAck => 16,
            ChunkType::Sack => 12,
            ChunkType::Shutdown => 4,
            ChunkType::ForwardTsn => 4,
            ChunkType::Heartbeat | ChunkType::HeartbeatAck => 4,
            _ => 0,
        }
    }
}

/// 인식하지 못한 청크(또는 현재 상태에서 허용되지 않는 청크) 처리 방식
///
/// 타입 바이트 상위 2비트로 결정된다.
/// 00 = 조용히 중단, 01 = 에러 보고 후 중단, 10 = 조용히 건너뜀, 11 = 에러 보고 후 건너뜀
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownAction {
    Stop,
    StopAndReport,
    Skip,
    SkipAndReport,
}

impl UnknownAction {
    pub fn from_type(chunk_type: u8) -> Self {
        match chunk_type >> 6 {
            0 => UnknownAction::Stop,
            1 => UnknownAction::StopAndReport,
            2 => UnknownAction::Skip,
            _ => UnknownAction::SkipAndReport,
        }
    }

    pub fn report(self) -> bool {
        matches!(self, UnknownAction::StopAndReport | UnknownAction::SkipAndReport)
    }

    pub fn skip(self) -> bool {
        matches!(self, UnknownAction::Skip | UnknownAction::SkipAndReport)
    }
}

/// 공통 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub verification_tag: u32,
}

/// DATA 청크
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub flags: u8,
    pub tsn: u32,
    pub stream: u16,
    pub ssn: u16,
    pub ppid: u32,
    pub payload: Bytes,
}

impl DataChunk {
    pub fn is_begin(&self) -> bool {
        self.flags & data_flags::BEGIN != 0
    }

    pub fn is_end(&self) -> bool {
        self.flags & data_flags::END != 0
    }

    pub fn is_unordered(&self) -> bool {
        self.flags & data_flags::UNORDERED != 0
    }

    /// 패딩 제외 인코딩 길이
    pub fn wire_len(&self) -> usize {
        DATA_HEADER_LEN + self.payload.len()
    }
}

/// INIT / INIT-ACK 본문
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitChunk {
    pub initiate_tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
    pub addresses: Vec<IpAddr>,
    pub forward_tsn_supported: bool,
    /// INIT-ACK에만 존재
    pub cookie: Option<Bytes>,
    /// 보고가 필요한 인식 불가 파라미터 (TLV 원문)
    pub unrecognized: Vec<Bytes>,
}

/// SACK 본문
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SackChunk {
    pub cum_tsn: u32,
    pub a_rwnd: u32,
    /// cum_tsn 기준 (start, end) 오프셋
    pub gaps: Vec<(u16, u16)>,
    pub dups: Vec<u32>,
}

/// FORWARD-TSN 본문
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardTsnChunk {
    pub new_cum_tsn: u32,
    /// (stream id, stream sequence number)
    pub streams: Vec<(u16, u16)>,
}

/// ERROR / ABORT 원인
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    pub code: u16,
    pub info: Bytes,
}

impl ErrorCause {
    pub fn new(code: u16, info: impl Into<Bytes>) -> Self {
        Self {
            code,
            info: info.into(),
        }
    }

    /// 스트림 ID 오류: stream id + 예약 2바이트
    pub fn invalid_stream(stream: u16) -> Self {
        let mut b = BytesMut::with_capacity(4);
        b.put_u16(stream);
        b.put_u16(0);
        Self::new(cause::INVALID_STREAM, b.freeze())
    }

    /// cookie 만료: 초과 시간(마이크로초)
    pub fn stale_cookie(staleness_us: u32) -> Self {
        Self::new(cause::STALE_COOKIE, Bytes::copy_from_slice(&staleness_us.to_be_bytes()))
    }

    fn wire_len(&self) -> usize {
        4 + self.info.len()
    }
}

/// 청크
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(DataChunk),
    Init(InitChunk),
    InitAck(InitChunk),
    Sack(SackChunk),
    /// heartbeat info 파라미터 값
    Heartbeat(Bytes),
    HeartbeatAck(Bytes),
    Abort { t_bit: bool, causes: Vec<ErrorCause> },
    Shutdown { cum_tsn: u32 },
    ShutdownAck,
    Error { causes: Vec<ErrorCause> },
    CookieEcho(Bytes),
    CookieAck,
    ShutdownComplete { t_bit: bool },
    ForwardTsn(ForwardTsnChunk),
    /// 인식하지 못한 타입 (원문 보관)
    Unknown { chunk_type: u8, flags: u8, value: Bytes },
}

#[inline]
fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

fn put_padding(buf: &mut BytesMut, len: usize) {
    for _ in len..pad4(len) {
        buf.put_u8(0);
    }
}

impl Chunk {
    /// 타입 바이트
    pub fn type_byte(&self) -> u8 {
        match self {
            Chunk::Data(_) => ChunkType::Data as u8,
            Chunk::Init(_) => ChunkType::Init as u8,
            Chunk::InitAck(_) => ChunkType::InitAck as u8,
            Chunk::Sack(_) => ChunkType::Sack as u8,
            Chunk::Heartbeat(_) => ChunkType::Heartbeat as u8,
            Chunk::HeartbeatAck(_) => ChunkType::HeartbeatAck as u8,
            Chunk::Abort { .. } => ChunkType::Abort as u8,
            Chunk::Shutdown { .. } => ChunkType::Shutdown as u8,
            Chunk::ShutdownAck => ChunkType::ShutdownAck as u8,
            Chunk::Error { .. } => ChunkType::Error as u8,
            Chunk::CookieEcho(_) => ChunkType::CookieEcho as u8,
            Chunk::CookieAck => ChunkType::CookieAck as u8,
            Chunk::ShutdownComplete { .. } => ChunkType::ShutdownComplete as u8,
            Chunk::ForwardTsn(_) => ChunkType::ForwardTsn as u8,
            Chunk::Unknown { chunk_type, .. } => *chunk_type,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Chunk::Data(d) => d.flags,
            Chunk::Abort { t_bit: true, .. } | Chunk::ShutdownComplete { t_bit: true } => T_BIT,
            Chunk::Unknown { flags, .. } => *flags,
            _ => 0,
        }
    }

    /// 청크 길이 필드 값 (패딩 제외)
    pub fn wire_len(&self) -> usize {
        CHUNK_HEADER_LEN
            + match self {
                Chunk::Data(d) => d.wire_len() - CHUNK_HEADER_LEN,
                Chunk::Init(i) | Chunk::InitAck(i) => init_value_len(i),
                Chunk::Sack(s) => 12 + s.gaps.len() * 4 + s.dups.len() * 4,
                Chunk::Heartbeat(info) | Chunk::HeartbeatAck(info) => 4 + info.len(),
                Chunk::Abort { causes, .. } | Chunk::Error { causes } => {
                    causes.iter().map(|c| pad4(c.wire_len())).sum()
                }
                Chunk::Shutdown { .. } => 4,
                Chunk::ShutdownAck | Chunk::CookieAck | Chunk::ShutdownComplete { .. } => 0,
                Chunk::CookieEcho(cookie) => cookie.len(),
                Chunk::ForwardTsn(f) => 4 + f.streams.len() * 4,
                Chunk::Unknown { value, .. } => value.len(),
            }
    }

    /// 패딩 포함 인코딩 길이
    pub fn padded_len(&self) -> usize {
        pad4(self.wire_len())
    }

    /// 버퍼에 인코딩 (패딩 포함)
    pub fn encode(&self, buf: &mut BytesMut) {
        let len = self.wire_len();
        buf.reserve(pad4(len));
        buf.put_u8(self.type_byte());
        buf.put_u8(self.flags());
        buf.put_u16(len as u16);

        match self {
            Chunk::Data(d) => {
                buf.put_u32(d.tsn);
                buf.put_u16(d.stream);
                buf.put_u16(d.ssn);
                buf.put_u32(d.ppid);
                buf.put_slice(&d.payload);
            }
            Chunk::Init(i) | Chunk::InitAck(i) => encode_init(i, buf),
            Chunk::Sack(s) => {
                buf.put_u32(s.cum_tsn);
                buf.put_u32(s.a_rwnd);
                buf.put_u16(s.gaps.len() as u16);
                buf.put_u16(s.dups.len() as u16);
                for &(start, end) in &s.gaps {
                    buf.put_u16(start);
                    buf.put_u16(end);
                }
                for &dup in &s.dups {
                    buf.put_u32(dup);
                }
            }
            Chunk::Heartbeat(info) | Chunk::HeartbeatAck(info) => {
                buf.put_u16(param::HEARTBEAT_INFO);
                buf.put_u16((4 + info.len()) as u16);
                buf.put_slice(info);
            }
            Chunk::Abort { causes, .. } | Chunk::Error { causes } => {
                for c in causes {
                    buf.put_u16(c.code);
                    buf.put_u16(c.wire_len() as u16);
                    buf.put_slice(&c.info);
                    put_padding(buf, c.wire_len());
                }
            }
            Chunk::Shutdown { cum_tsn } => buf.put_u32(*cum_tsn),
            Chunk::ShutdownAck | Chunk::CookieAck | Chunk::ShutdownComplete { .. } => {}
            Chunk::CookieEcho(cookie) => buf.put_slice(cookie),
            Chunk::ForwardTsn(f) => {
                buf.put_u32(f.new_cum_tsn);
                for &(sid, ssn) in &f.streams {
                    buf.put_u16(sid);
                    buf.put_u16(ssn);
                }
            }
            Chunk::Unknown { value, .. } => buf.put_slice(value),
        }

        put_padding(buf, len);
    }

    /// 청크 하나 디코딩 (value = 헤더 이후, 패딩 제외)
    fn decode(chunk_type: u8, flags: u8, mut value: Bytes) -> Result<Chunk> {
        let Some(kind) = ChunkType::from_u8(chunk_type) else {
            return Ok(Chunk::Unknown {
                chunk_type,
                flags,
                value,
            });
        };

        if value.len() < kind.min_value_len() {
            return Err(Error::InvalidChunkLength {
                chunk_type,
                length: value.len() + CHUNK_HEADER_LEN,
            });
        }

        let chunk = match kind {
            ChunkType::Data => {
                let tsn = value.get_u32();
                let stream = value.get_u16();
                let ssn = value.get_u16();
                let ppid = value.get_u32();
                Chunk::Data(DataChunk {
                    flags,
                    tsn,
                    stream,
                    ssn,
                    ppid,
                    payload: value,
                })
            }
            ChunkType::Init => Chunk::Init(decode_init(value)?),
            ChunkType::InitAck => Chunk::InitAck(decode_init(value)?),
            ChunkType::Sack => {
                let cum_tsn = value.get_u32();
                let a_rwnd = value.get_u32();
                let num_gaps = value.get_u16() as usize;
                let num_dups = value.get_u16() as usize;
                let needed = num_gaps * 4 + num_dups * 4;
                if value.len() < needed {
                    return Err(Error::InvalidChunkLength {
                        chunk_type,
                        length: value.len() + 16,
                    });
                }
                let gaps = (0..num_gaps)
                    .map(|_| (value.get_u16(), value.get_u16()))
                    .collect();
                let dups = (0..num_dups).map(|_| value.get_u32()).collect();
                Chunk::Sack(SackChunk {
                    cum_tsn,
                    a_rwnd,
                    gaps,
                    dups,
                })
            }
            ChunkType::Heartbeat | ChunkType::HeartbeatAck => {
                let ptype = value.get_u16();
                let plen = value.get_u16() as usize;
                if ptype != param::HEARTBEAT_INFO || plen < 4 || plen - 4 > value.len() {
                    return Err(Error::InvalidParameter {
                        param_type: ptype,
                        length: plen,
                    });
                }
                let info = value.split_to(plen - 4);
                if kind == ChunkType::Heartbeat {
                    Chunk::Heartbeat(info)
                } else {
                    Chunk::HeartbeatAck(info)
                }
            }
            ChunkType::Abort => Chunk::Abort {
                t_bit: flags & T_BIT != 0,
                causes: decode_causes(value)?,
            },
            ChunkType::Error => Chunk::Error {
                causes: decode_causes(value)?,
            },
            ChunkType::Shutdown => Chunk::Shutdown {
                cum_tsn: value.get_u32(),
            },
            ChunkType::ShutdownAck => Chunk::ShutdownAck,
            ChunkType::CookieEcho => Chunk::CookieEcho(value),
            ChunkType::CookieAck => Chunk::CookieAck,
            ChunkType::ShutdownComplete => Chunk::ShutdownComplete {
                t_bit: flags & T_BIT != 0,
            },
            ChunkType::ForwardTsn => {
                let new_cum_tsn = value.get_u32();
                if value.len() % 4 != 0 {
                    return Err(Error::InvalidChunkLength {
                        chunk_type,
                        length: value.len() + 8,
                    });
                }
                let mut streams = Vec::with_capacity(value.len() / 4);
                while value.remaining() >= 4 {
                    streams.push((value.get_u16(), value.get_u16()));
                }
                Chunk::ForwardTsn(ForwardTsnChunk {
                    new_cum_tsn,
                    streams,
                })
            }
        };
        Ok(chunk)
    }
}

fn init_value_len(init: &InitChunk) -> usize {
    let mut len = 16;
    for addr in &init.addresses {
        len += match addr {
            IpAddr::V4(_) => 8,
            IpAddr::V6(_) => 20,
        };
    }
    if init.forward_tsn_supported {
        len += 4;
    }
    for p in &init.unrecognized {
        len += pad4(4 + p.len());
    }
    if let Some(cookie) = &init.cookie {
        len += 4 + cookie.len();
    }
    len
}

fn encode_init(init: &InitChunk, buf: &mut BytesMut) {
    buf.put_u32(init.initiate_tag);
    buf.put_u32(init.a_rwnd);
    buf.put_u16(init.outbound_streams);
    buf.put_u16(init.inbound_streams);
    buf.put_u32(init.initial_tsn);

    for addr in &init.addresses {
        match addr {
            IpAddr::V4(v4) => {
                buf.put_u16(param::IPV4_ADDR);
                buf.put_u16(8);
                buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.put_u16(param::IPV6_ADDR);
                buf.put_u16(20);
                buf.put_slice(&v6.octets());
            }
        }
    }
    if init.forward_tsn_supported {
        buf.put_u16(param::FORWARD_TSN_SUPPORTED);
        buf.put_u16(4);
    }
    for p in &init.unrecognized {
        buf.put_u16(param::UNRECOGNIZED);
        buf.put_u16((4 + p.len()) as u16);
        buf.put_slice(p);
        put_padding(buf, 4 + p.len());
    }
    // cookie는 항상 마지막, 청크 패딩이 뒤따른다
    if let Some(cookie) = &init.cookie {
        buf.put_u16(param::STATE_COOKIE);
        buf.put_u16((4 + cookie.len()) as u16);
        buf.put_slice(cookie);
    }
}

fn decode_init(mut value: Bytes) -> Result<InitChunk> {
    let mut init = InitChunk {
        initiate_tag: value.get_u32(),
        a_rwnd: value.get_u32(),
        outbound_streams: value.get_u16(),
        inbound_streams: value.get_u16(),
        initial_tsn: value.get_u32(),
        ..InitChunk::default()
    };

    while value.remaining() >= 4 {
        let ptype = u16::from_be_bytes([value[0], value[1]]);
        let plen = u16::from_be_bytes([value[2], value[3]]) as usize;
        if plen < 4 || plen > value.len() {
            return Err(Error::InvalidParameter {
                param_type: ptype,
                length: plen,
            });
        }
        let raw = value.slice(..plen);
        let body = raw.slice(4..);
        value.advance(pad4(plen).min(value.len()));

        match ptype {
            param::IPV4_ADDR if body.len() == 4 => {
                init.addresses
                    .push(IpAddr::V4(Ipv4Addr::new(body[0], body[1], body[2], body[3])));
            }
            param::IPV6_ADDR if body.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body);
                init.addresses.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            param::IPV4_ADDR | param::IPV6_ADDR => {
                return Err(Error::InvalidParameter {
                    param_type: ptype,
                    length: plen,
                });
            }
            param::STATE_COOKIE => init.cookie = Some(body),
            param::FORWARD_TSN_SUPPORTED => init.forward_tsn_supported = true,
            param::COOKIE_PRESERVATIVE | param::UNRECOGNIZED => {}
            _ => {
                // 파라미터도 상위 2비트 규칙을 따른다
                let action = UnknownAction::from_type((ptype >> 8) as u8);
                if action.report() {
                    init.unrecognized.push(raw);
                }
                if !action.skip() {
                    break;
                }
            }
        }
    }

    Ok(init)
}

fn decode_causes(mut value: Bytes) -> Result<Vec<ErrorCause>> {
    let mut causes = Vec::new();
    while value.remaining() >= 4 {
        let code = value.get_u16();
        let len = value.get_u16() as usize;
        if len < 4 || len - 4 > value.len() {
            return Err(Error::InvalidParameter {
                param_type: code,
                length: len,
            });
        }
        let info = value.split_to(len - 4);
        let pad = (pad4(len) - len).min(value.len());
        value.advance(pad);
        causes.push(ErrorCause { code, info });
    }
    Ok(causes)
}

/// 패킷 (공통 헤더 + 청크 목록)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: CommonHeader,
    pub chunks: Vec<Chunk>,
}

impl Packet {
    pub fn new(header: CommonHeader) -> Self {
        Self {
            header,
            chunks: Vec::new(),
        }
    }

    /// 인코딩 후 길이
    pub fn wire_len(&self) -> usize {
        COMMON_HEADER_LEN + self.chunks.iter().map(Chunk::padded_len).sum::<usize>()
    }

    /// 바이트로 직렬화 (체크섬 포함)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u16(self.header.src_port);
        buf.put_u16(self.header.dst_port);
        buf.put_u32(self.header.verification_tag);
        buf.put_u32(0);
        for chunk in &self.chunks {
            chunk.encode(&mut buf);
        }
        let crc = crc32c::crc32c(&buf);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        buf.freeze()
    }

    /// 바이트에서 역직렬화
    ///
    /// 체크섬, 청크 길이, 번들링 규칙을 모두 통과해야 한다.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < COMMON_HEADER_LEN + CHUNK_HEADER_LEN {
            return Err(Error::Truncated {
                needed: COMMON_HEADER_LEN + CHUNK_HEADER_LEN,
                got: raw.len(),
            });
        }

        let expected = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let got = {
            let crc = crc32c::crc32c(&raw[..8]);
            let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
            crc32c::crc32c_append(crc, &raw[COMMON_HEADER_LEN..])
        };
        if expected != got {
            return Err(Error::ChecksumMismatch { expected, got });
        }

        let mut buf = Bytes::copy_from_slice(raw);
        let header = CommonHeader {
            src_port: buf.get_u16(),
            dst_port: buf.get_u16(),
            verification_tag: buf.get_u32(),
        };
        buf.advance(4);

        let mut chunks = Vec::new();
        let mut first = true;
        while buf.remaining() >= CHUNK_HEADER_LEN {
            let chunk_type = buf[0];
            let flags = buf[1];
            let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if length < CHUNK_HEADER_LEN || length > buf.len() {
                return Err(Error::InvalidChunkLength { chunk_type, length });
            }

            let alone = pad4(length) >= buf.len();
            check_bundling(chunk_type, first, alone)?;

            let value = buf.slice(CHUNK_HEADER_LEN..length);
            buf.advance(pad4(length).min(buf.len()));
            chunks.push(Chunk::decode(chunk_type, flags, value)?);
            first = false;
        }

        if chunks.is_empty() {
            return Err(Error::Truncated {
                needed: COMMON_HEADER_LEN + CHUNK_HEADER_LEN,
                got: raw.len(),
            });
        }

        Ok(Self { header, chunks })
    }
}

/// 번들링 규칙
///
/// INIT, INIT-ACK, SHUTDOWN-COMPLETE는 첫 번째이자 유일한 청크.
/// COOKIE-ECHO, COOKIE-ACK, SHUTDOWN-ACK는 첫 번째 청크.
fn check_bundling(chunk_type: u8, first: bool, alone: bool) -> Result<()> {
    let Some(kind) = ChunkType::from_u8(chunk_type) else {
        return Ok(());
    };
    let ok = match kind {
        ChunkType::Init | ChunkType::InitAck | ChunkType::ShutdownComplete => first && alone,
        ChunkType::CookieEcho | ChunkType::CookieAck | ChunkType::ShutdownAck => first,
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::IllegalBundling { chunk_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> CommonHeader {
        CommonHeader {
            src_port: 5000,
            dst_port: 5001,
            verification_tag: 0xdead_beef,
        }
    }

    fn data(tsn: u32, payload: &'static [u8]) -> Chunk {
        Chunk::Data(DataChunk {
            flags: data_flags::BEGIN | data_flags::END,
            tsn,
            stream: 1,
            ssn: 7,
            ppid: 51,
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn test_packet_serialization() {
        let mut packet = Packet::new(header());
        packet.chunks.push(Chunk::Sack(SackChunk {
            cum_tsn: 100,
            a_rwnd: 65536,
            gaps: vec![(2, 4), (7, 7)],
            dups: vec![99],
        }));
        packet.chunks.push(data(101, b"hello"));
        packet.chunks.push(Chunk::ForwardTsn(ForwardTsnChunk {
            new_cum_tsn: 105,
            streams: vec![(1, 3)],
        }));

        let bytes = packet.to_bytes();
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(bytes.len(), packet.wire_len());

        let restored = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(restored, packet);
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let mut packet = Packet::new(header());
        packet.chunks.push(data(1, b"x"));
        let mut bytes = packet.to_bytes().to_vec();
        let last = bytes.len() - 4;
        bytes[last] ^= 0xff;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_init_must_be_alone() {
        let mut packet = Packet::new(header());
        packet.chunks.push(Chunk::Init(InitChunk {
            initiate_tag: 1,
            a_rwnd: 1000,
            outbound_streams: 1,
            inbound_streams: 1,
            initial_tsn: 1,
            ..InitChunk::default()
        }));
        packet.chunks.push(data(1, b"x"));
        let bytes = packet.to_bytes();
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(Error::IllegalBundling { chunk_type: 1 })
        ));
    }

    #[test]
    fn test_cookie_ack_must_be_first() {
        let mut packet = Packet::new(header());
        packet.chunks.push(data(1, b"x"));
        packet.chunks.push(Chunk::CookieAck);
        assert!(matches!(
            Packet::from_bytes(&packet.to_bytes()),
            Err(Error::IllegalBundling { chunk_type: 11 })
        ));
    }

    #[test]
    fn test_short_sack_rejected() {
        let mut packet = Packet::new(header());
        packet.chunks.push(Chunk::Unknown {
            chunk_type: ChunkType::Sack as u8,
            flags: 0,
            value: Bytes::from_static(&[0, 0, 0, 1]),
        });
        assert!(matches!(
            Packet::from_bytes(&packet.to_bytes()),
            Err(Error::InvalidChunkLength { chunk_type: 3, .. })
        ));
    }

    #[test]
    fn test_init_parameters() {
        let init = InitChunk {
            initiate_tag: 0x1234,
            a_rwnd: 131072,
            outbound_streams: 10,
            inbound_streams: 12,
            initial_tsn: 77,
            addresses: vec![
                "10.0.0.1".parse().unwrap(),
                "2001:db8::1".parse().unwrap(),
            ],
            forward_tsn_supported: true,
            cookie: Some(Bytes::from_static(b"cookie!")),
            unrecognized: Vec::new(),
        };
        let mut packet = Packet::new(header());
        packet.chunks.push(Chunk::InitAck(init.clone()));
        let restored = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(restored.chunks[0], Chunk::InitAck(init));
    }

    #[test]
    fn test_unknown_action_bits() {
        assert_eq!(UnknownAction::from_type(0x0f), UnknownAction::Stop);
        assert_eq!(UnknownAction::from_type(0x4f), UnknownAction::StopAndReport);
        assert_eq!(UnknownAction::from_type(0x8f), UnknownAction::Skip);
        assert_eq!(UnknownAction::from_type(0xcf), UnknownAction::SkipAndReport);
        assert!(UnknownAction::SkipAndReport.report());
        assert!(!UnknownAction::StopAndReport.skip());
    }

    #[test]
    fn test_unknown_chunk_preserved() {
        let mut packet = Packet::new(header());
        packet.chunks.push(Chunk::Unknown {
            chunk_type: 0xc5,
            flags: 3,
            value: Bytes::from_static(b"abcde"),
        });
        let restored = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(restored.chunks, packet.chunks);
    }

    #[test]
    fn test_abort_causes() {
        let mut packet = Packet::new(header());
        packet.chunks.push(Chunk::Abort {
            t_bit: true,
            causes: vec![ErrorCause::new(cause::NO_USER_DATA, Bytes::from_static(&[0, 0, 0, 9]))],
        });
        let restored = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(restored.chunks, packet.chunks);
    }
}
