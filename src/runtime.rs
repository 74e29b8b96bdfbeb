//! association actor 런타임
//!
//! association 하나를 tokio 태스크 하나가 소유한다. 패킷, 애플리케이션 요청,
//! 타이머 만료는 모두 [`Command`]로 같은 채널에 들어와 순서대로 처리된다.
//! 외부에서는 [`AssociationHandle`]로 요청을 보내고 상태 스냅샷을 읽는다.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace};

use crate::association::{AssocState, Association};
use crate::error::{CloseReason, Error, Result};
use crate::message::SendOptions;
use crate::stats::AssocStats;
use crate::timer::{TimerKey, TimerToken, TimerUpdate};

/// 명령 채널 크기
const COMMAND_QUEUE: usize = 1024;

/// actor로 전달되는 명령
#[derive(Debug)]
pub enum Command {
    /// 수신 패킷
    Packet { from: SocketAddr, data: Bytes },
    Connect {
        addrs: Vec<SocketAddr>,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        data: Bytes,
        opts: SendOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown { reply: oneshot::Sender<Result<()>> },
    Abort { reply: oneshot::Sender<Result<()>> },
    SetPrimary {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    /// 타이머 태스크의 만료 통지
    Timer(TimerToken),
    Stop,
}

/// 핸들에서 읽는 association 상태
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: AssocState,
    pub stats: AssocStats,
    pub close_reason: Option<CloseReason>,
}

impl Snapshot {
    fn capture(assoc: &Association) -> Self {
        Self {
            state: assoc.state(),
            stats: assoc.stats().clone(),
            close_reason: assoc.close_reason(),
        }
    }
}

/// 예약된 sleep 태스크
struct ArmedTimer {
    token: TimerToken,
    deadline: Instant,
    task: AbortHandle,
}

/// association 소유 태스크
struct Actor {
    assoc: Association,
    /// 타이머 태스크에 넘기는 약한 송신자 (actor 수명을 늘리지 않음)
    weak_tx: mpsc::WeakSender<Command>,
    armed: HashMap<TimerKey, ArmedTimer>,
    snapshot: Arc<RwLock<Snapshot>>,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        // spawn 전에 걸린 타이머 (listen/connect 직후 등)
        self.sync_timers();

        while let Some(cmd) = cmd_rx.recv().await {
            if matches!(cmd, Command::Stop) {
                debug!("actor 정지 요청");
                break;
            }
            self.handle(cmd);
            self.sync_timers();
            self.publish();
        }

        self.cancel_all();
        self.publish();
        info!("association actor 종료 ({})", self.assoc.state());
    }

    fn handle(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Packet { from, data } => {
                self.assoc.handle_packet(now, from, &data);
            }
            Command::Connect { addrs, reply } => {
                let _ = reply.send(self.assoc.connect(now, &addrs));
            }
            Command::Send { data, opts, reply } => {
                let _ = reply.send(self.assoc.send(now, data, opts));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.assoc.shutdown(now));
            }
            Command::Abort { reply } => {
                let _ = reply.send(self.assoc.abort());
            }
            Command::SetPrimary { addr, reply } => {
                let _ = reply.send(self.assoc.set_primary(addr));
            }
            Command::Timer(token) => {
                let now = match self.armed.get(&token.key) {
                    Some(armed) if armed.token == token => {
                        let deadline = armed.deadline;
                        self.armed.remove(&token.key);
                        // tokio 타이머 해상도 때문에 deadline 직전에 깨어날 수 있음
                        now.max(deadline)
                    }
                    _ => {
                        trace!("지난 타이머 통지 무시: {:?}", token);
                        return;
                    }
                };
                self.assoc.handle_timeout(now, token);
            }
            Command::Stop => {}
        }
    }

    /// association의 타이머 예약 변경을 sleep 태스크에 반영
    fn sync_timers(&mut self) {
        for update in self.assoc.take_timer_updates() {
            match update {
                TimerUpdate::Armed { token, deadline } => {
                    if let Some(old) = self.armed.remove(&token.key) {
                        old.task.abort();
                    }
                    let task = self.spawn_timer(token, deadline);
                    self.armed.insert(
                        token.key,
                        ArmedTimer {
                            token,
                            deadline,
                            task,
                        },
                    );
                }
                TimerUpdate::Disarmed(key) => {
                    if let Some(old) = self.armed.remove(&key) {
                        old.task.abort();
                    }
                }
            }
        }

        if self.assoc.state() == AssocState::Closed {
            self.cancel_all();
        }
    }

    fn spawn_timer(&self, token: TimerToken, deadline: Instant) -> AbortHandle {
        let weak_tx = self.weak_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline.into()).await;
            if let Some(tx) = weak_tx.upgrade() {
                let _ = tx.send(Command::Timer(token)).await;
            }
        });
        handle.abort_handle()
    }

    fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }

    fn publish(&self) {
        *self.snapshot.write() = Snapshot::capture(&self.assoc);
    }
}

/// association actor 핸들 (복제 가능)
#[derive(Clone)]
pub struct AssociationHandle {
    cmd_tx: mpsc::Sender<Command>,
    snapshot: Arc<RwLock<Snapshot>>,
}

impl AssociationHandle {
    /// association을 넘겨받아 actor 태스크 시작
    ///
    /// tokio 런타임 안에서 호출해야 한다. listen/bind는 넘기기 전에 끝내둔다.
    pub fn spawn(assoc: Association) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(COMMAND_QUEUE);
        let snapshot = Arc::new(RwLock::new(Snapshot::capture(&assoc)));

        let actor = Actor {
            assoc,
            weak_tx: cmd_tx.downgrade(),
            armed: HashMap::new(),
            snapshot: snapshot.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self { cmd_tx, snapshot }
    }

    async fn request<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| Error::ChannelError)?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    /// 능동 open
    pub async fn connect(&self, addrs: Vec<SocketAddr>) -> Result<()> {
        self.request(|reply| Command::Connect { addrs, reply }).await
    }

    /// 메시지 송신
    pub async fn send(&self, data: Bytes, opts: SendOptions) -> Result<()> {
        self.request(|reply| Command::Send { data, opts, reply })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub async fn abort(&self) -> Result<()> {
        self.request(|reply| Command::Abort { reply }).await
    }

    pub async fn set_primary(&self, addr: SocketAddr) -> Result<()> {
        self.request(|reply| Command::SetPrimary { addr, reply })
            .await
    }

    /// 네트워크에서 받은 패킷 전달
    pub async fn deliver_packet(&self, from: SocketAddr, data: Bytes) -> Result<()> {
        self.cmd_tx
            .send(Command::Packet { from, data })
            .await
            .map_err(|_| Error::ChannelError)
    }

    /// actor 정지 (association 상태는 그대로 남음)
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }

    pub fn state(&self) -> AssocState {
        self.snapshot.read().state
    }

    pub fn stats(&self) -> AssocStats {
        self.snapshot.read().stats.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    /// actor가 아직 명령을 받는지
    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}
