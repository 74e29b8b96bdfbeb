//! # sctp-engine
//!
//! 멀티호밍 SCTP 계열 association 엔진
//!
//! ## 핵심 특징
//! - **스트림 다중화**: ordered / unordered 스트림, 부분 전달
//! - **선택적 확인 응답**: cumulative ack + gap block, 중복 TSN 보고
//! - **혼잡 제어**: slow start / congestion avoidance / fast retransmit, 교체 가능한 알고리즘
//! - **멀티호밍**: 주소별 liveness, heartbeat, failover 정책
//! - **PR-SCTP**: 수명 기반 메시지 폐기와 FORWARD-TSN
//! - **actor 런타임**: association 하나를 tokio 태스크 하나가 소유
//!
//! 소켓은 다루지 않는다. IP 출력, 경로 해석, 이벤트/데이터 전달은 [`io`]의
//! trait으로 주입한다.

pub mod association;
pub mod bbr;
pub mod chunk;
pub mod config;
pub mod congestion;
pub mod error;
pub mod gapset;
pub mod io;
pub mod message;
pub mod multipath;
pub mod prsctp;
pub mod reassembly;
pub mod receiver;
pub mod retransmit;
pub mod runtime;
pub mod sender;
pub mod seq;
pub mod stats;
pub mod timer;

pub use association::{AssocState, Association};
pub use bbr::BbrLite;
pub use chunk::{Chunk, Packet};
pub use config::Config;
pub use congestion::{CongestionAlgorithm, CongestionControl, CwndState, NewReno};
pub use error::{CloseReason, Error, Result};
pub use io::{
    AddressChange, Collaborators, DataSink, Delivery, DeliveryFlags, Destination, EventSink,
    FixedRoute, Notification, PacketOutput, Route, RouteOracle,
};
pub use message::SendOptions;
pub use multipath::{FailoverPolicy, PeerId, PeerState};
pub use runtime::{AssociationHandle, Command, Snapshot};
pub use stats::{AssocStats, PathStats};
pub use timer::{TimerKey, TimerToken, TimerUpdate};

/// 기본 경로 MTU (IP 헤더 포함)
pub const DEFAULT_MTU: u32 = 1500;

/// 허용하는 최소 경로 MTU
pub const MIN_MTU: u32 = 576;
