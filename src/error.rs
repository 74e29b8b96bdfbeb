//! 에러 타입 정의

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// association 종료 사유 (애플리케이션에 전달되는 최종 결과)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// SHUTDOWN 시퀀스 정상 완료
    Graceful,
    /// 재전송 한도 초과 (connection timed out)
    TimedOut,
    /// 로컬 또는 프로토콜 위반으로 ABORT (connection aborted)
    Aborted,
    /// 피어가 보낸 ABORT (connection reset)
    Reset,
    /// 핸드쉐이크 중 피어가 거부 (connection refused)
    Refused,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Graceful => "graceful",
            CloseReason::TimedOut => "timed out",
            CloseReason::Aborted => "aborted",
            CloseReason::Reset => "reset by peer",
            CloseReason::Refused => "refused",
        };
        f.write_str(s)
    }
}

/// 프로토콜 엔진 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("패킷이 잘림: 최소 {needed} bytes 필요, {got} bytes 수신")]
    Truncated { needed: usize, got: usize },

    #[error("유효하지 않은 청크 길이: type={chunk_type}, length={length}")]
    InvalidChunkLength { chunk_type: u8, length: usize },

    #[error("체크섬 불일치: expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("허용되지 않는 청크 번들링: type={chunk_type}")]
    IllegalBundling { chunk_type: u8 },

    #[error("유효하지 않은 파라미터: type={param_type}, length={length}")]
    InvalidParameter { param_type: u16, length: usize },

    #[error("verification tag 불일치: expected {expected:08X}, got {got:08X}")]
    VerificationTag { expected: u32, got: u32 },

    #[error("현재 상태({state})에서 허용되지 않는 동작: {op}")]
    InvalidState { state: &'static str, op: &'static str },

    #[error("프로토콜 위반: {0}")]
    ProtocolViolation(&'static str),

    #[error("유효하지 않은 스트림 ID: {stream} (최대 {max})")]
    InvalidStream { stream: u16, max: u16 },

    #[error("버퍼 오버플로우: 최대 크기 {max_size} 초과")]
    BufferOverflow { max_size: usize },

    #[error("사용 가능한 피어 주소 없음")]
    NoPeerAddress,

    #[error("알 수 없는 피어 주소: {0}")]
    UnknownPeer(SocketAddr),

    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료: {0}")]
    ConnectionClosed(CloseReason),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
