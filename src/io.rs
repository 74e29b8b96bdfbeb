//! 외부 협력자 인터페이스
//!
//! 엔진은 소켓을 직접 다루지 않는다. IP 출력, 경로 해석, 애플리케이션 이벤트,
//! 데이터 전달은 모두 아래 trait을 통해 호출한다.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::CloseReason;

/// 패킷 목적지 속성
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub addr: SocketAddr,

    /// 해석된 소스 주소
    pub source: Option<IpAddr>,

    /// DF 비트 (MSS를 넘는 패킷은 false)
    pub dont_fragment: bool,
}

/// IP 출력
pub trait PacketOutput: Send + Sync {
    /// `WouldBlock`은 혼잡 신호로 처리된다
    fn send(&self, packet: Bytes, dest: &Destination) -> io::Result<()>;
}

/// 경로 해석 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub source: IpAddr,
    pub path_mtu: u32,
    pub rtt_hint: Option<Duration>,
}

/// 소스 주소 / 경로 해석
pub trait RouteOracle: Send + Sync {
    fn resolve(&self, dest: SocketAddr) -> Option<Route>;
}

/// 주소 상태 변화 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressChange {
    Available,
    Unreachable,
    MadePrimary,
}

/// 애플리케이션 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    CommUp {
        outbound_streams: u16,
        inbound_streams: u16,
    },
    CommLost {
        reason: CloseReason,
    },
    CannotStart {
        reason: CloseReason,
    },
    ShutdownComplete,
    PeerShutdown,
    /// 전달하지 못한 메시지 (`sent`: 한 번이라도 전송되었는지)
    SendFailed {
        stream: u16,
        ppid: u32,
        data: Bytes,
        sent: bool,
    },
    AddressChange {
        addr: SocketAddr,
        change: AddressChange,
    },
    PartialDeliveryAborted {
        stream: u16,
        ssn: u16,
    },
    PeerError {
        cause: u16,
        info: Bytes,
    },
}

impl Notification {
    /// association 수명을 끝내는 이벤트인지
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Notification::CommLost { .. }
                | Notification::CannotStart { .. }
                | Notification::ShutdownComplete
        )
    }
}

pub trait EventSink: Send + Sync {
    fn notify(&self, event: Notification);
}

/// 전달 플래그
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryFlags {
    pub unordered: bool,
    /// 레코드 끝
    pub eor: bool,
    /// 부분 전달 조각
    pub partial: bool,
}

/// 애플리케이션으로 전달되는 데이터
#[derive(Clone, PartialEq, Eq)]
pub struct Delivery {
    pub stream: u16,
    pub ssn: u16,
    pub ppid: u32,
    /// 첫 조각의 TSN
    pub tsn: u32,
    pub data: Bytes,
    pub flags: DeliveryFlags,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("stream", &self.stream)
            .field("ssn", &self.ssn)
            .field("ppid", &self.ppid)
            .field("tsn", &self.tsn)
            .field("len", &self.data.len())
            .field("flags", &self.flags)
            .finish()
    }
}

pub trait DataSink: Send + Sync {
    fn deliver(&self, delivery: Delivery);
}

/// 고정 MTU로 모든 목적지를 해석하는 기본 oracle
#[derive(Debug, Clone, Copy)]
pub struct FixedRoute {
    pub source: IpAddr,
    pub path_mtu: u32,
}

impl RouteOracle for FixedRoute {
    fn resolve(&self, _dest: SocketAddr) -> Option<Route> {
        Some(Route {
            source: self.source,
            path_mtu: self.path_mtu,
            rtt_hint: None,
        })
    }
}

/// association이 사용하는 협력자 묶음
#[derive(Clone)]
pub struct Collaborators {
    pub output: Arc<dyn PacketOutput>,
    pub routes: Arc<dyn RouteOracle>,
    pub events: Arc<dyn EventSink>,
    pub data: Arc<dyn DataSink>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Collaborators")
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! 테스트용 기록 협력자

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::chunk::{Chunk, Packet};

    /// 모든 호출을 기록하는 협력자
    #[derive(Default)]
    pub struct Recorder {
        pub sent: Mutex<Vec<(Bytes, Destination)>>,
        pub events: Mutex<Vec<Notification>>,
        pub deliveries: Mutex<Vec<Delivery>>,
        pub routes: Mutex<HashMap<SocketAddr, Option<Route>>>,
        pub would_block: AtomicBool,
    }

    impl Recorder {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn collaborators(self: &Arc<Self>) -> Collaborators {
            Collaborators {
                output: self.clone(),
                routes: self.clone(),
                events: self.clone(),
                data: self.clone(),
            }
        }

        /// 기록된 송신 패킷을 디코딩해서 꺼냄
        pub fn take_packets(&self) -> Vec<(Packet, Destination)> {
            self.sent
                .lock()
                .drain(..)
                .map(|(raw, dest)| (Packet::from_bytes(&raw).expect("valid packet"), dest))
                .collect()
        }

        /// 송신 청크만 평탄화
        pub fn take_chunks(&self) -> Vec<(Chunk, SocketAddr)> {
            self.take_packets()
                .into_iter()
                .flat_map(|(p, d)| p.chunks.into_iter().map(move |c| (c, d.addr)))
                .collect()
        }

        pub fn take_events(&self) -> Vec<Notification> {
            std::mem::take(&mut *self.events.lock())
        }

        pub fn take_deliveries(&self) -> Vec<Delivery> {
            std::mem::take(&mut *self.deliveries.lock())
        }

        pub fn set_route(&self, addr: SocketAddr, route: Option<Route>) {
            self.routes.lock().insert(addr, route);
        }

        pub fn set_would_block(&self, on: bool) {
            self.would_block.store(on, Ordering::SeqCst);
        }
    }

    impl PacketOutput for Recorder {
        fn send(&self, packet: Bytes, dest: &Destination) -> io::Result<()> {
            if self.would_block.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.sent.lock().push((packet, dest.clone()));
            Ok(())
        }
    }

    impl RouteOracle for Recorder {
        fn resolve(&self, dest: SocketAddr) -> Option<Route> {
            match self.routes.lock().get(&dest) {
                Some(route) => *route,
                None => Some(Route {
                    source: IpAddr::from([127, 0, 0, 1]),
                    path_mtu: crate::DEFAULT_MTU,
                    rtt_hint: None,
                }),
            }
        }
    }

    impl EventSink for Recorder {
        fn notify(&self, event: Notification) {
            self.events.lock().push(event);
        }
    }

    impl DataSink for Recorder {
        fn deliver(&self, delivery: Delivery) {
            self.deliveries.lock().push(delivery);
        }
    }
}
