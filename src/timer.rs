//! association 타이머
//!
//! 각 논리 타이머는 generation 번호로 보호되는 one-shot 타이머다.
//! 실제 sleep은 런타임이 담당하고, 여기서는 상태와 유효성 검사만 관리한다.
//! 만료 통지가 stop/재시작과 경합해도 `fire`가 generation을 확인하므로
//! 취소된 타이머는 아무 동작도 일으키지 않는다.

use std::collections::HashMap;
use std::time::Instant;

use crate::multipath::PeerId;

/// 논리 타이머 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// INIT / COOKIE-ECHO 재전송
    Init,
    /// SHUTDOWN / SHUTDOWN-ACK 재전송
    Shutdown,
    /// 목적지별 T3 (데이터 재전송, zero window probe)
    Retransmit(PeerId),
    /// 목적지별 heartbeat
    Heartbeat(PeerId),
    DelayedSack,
    AutoClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Running,
    /// 실행 중 재시작됨 (새 generation)
    Rescheduled,
    Cancelled,
    /// 해제됨, 다시 시작할 수 없음
    PendingFree,
}

/// 만료 통지에 실려 오는 토큰
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub key: TimerKey,
    pub generation: u64,
}

/// 런타임에 전달할 예약 변경
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerUpdate {
    Armed { token: TimerToken, deadline: Instant },
    Disarmed(TimerKey),
}

#[derive(Debug, Clone)]
pub struct Timer {
    state: TimerState,
    generation: u64,
    deadline: Option<Instant>,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            state: TimerState::Idle,
            generation: 0,
            deadline: None,
        }
    }
}

impl Timer {
    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        if self.is_running() {
            self.deadline
        } else {
            None
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, TimerState::Running | TimerState::Rescheduled)
    }

    fn start(&mut self, generation: u64, deadline: Instant) -> bool {
        self.state = match self.state {
            TimerState::PendingFree => return false,
            TimerState::Running | TimerState::Rescheduled => TimerState::Rescheduled,
            _ => TimerState::Running,
        };
        self.generation = generation;
        self.deadline = Some(deadline);
        true
    }

    fn stop(&mut self) -> bool {
        if self.is_running() {
            self.state = TimerState::Cancelled;
            self.deadline = None;
            true
        } else {
            false
        }
    }

    fn free(&mut self) {
        self.state = TimerState::PendingFree;
        self.deadline = None;
    }

    /// 만료 유효성 검사, 유효하면 Idle로 전환
    fn fire(&mut self, generation: u64, now: Instant) -> bool {
        if !self.is_running() || self.generation != generation {
            return false;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.state = TimerState::Idle;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// association 소유 타이머 집합
#[derive(Debug, Default)]
pub struct Timers {
    timers: HashMap<TimerKey, Timer>,
    next_generation: u64,
    updates: Vec<TimerUpdate>,
    freed: bool,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 시작 또는 재시작
    pub fn start(&mut self, key: TimerKey, deadline: Instant) {
        if self.freed {
            return;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let timer = self.timers.entry(key).or_default();
        if timer.start(generation, deadline) {
            self.updates.push(TimerUpdate::Armed {
                token: TimerToken { key, generation },
                deadline,
            });
        }
    }

    /// 실행 중이 아닐 때만 시작
    pub fn start_if_idle(&mut self, key: TimerKey, deadline: Instant) {
        if !self.is_running(key) {
            self.start(key, deadline);
        }
    }

    pub fn stop(&mut self, key: TimerKey) {
        if let Some(timer) = self.timers.get_mut(&key) {
            if timer.stop() {
                self.updates.push(TimerUpdate::Disarmed(key));
            }
        }
    }

    pub fn is_running(&self, key: TimerKey) -> bool {
        self.timers.get(&key).map_or(false, Timer::is_running)
    }

    pub fn state(&self, key: TimerKey) -> TimerState {
        self.timers.get(&key).map_or(TimerState::Idle, Timer::state)
    }

    pub fn deadline(&self, key: TimerKey) -> Option<Instant> {
        self.timers.get(&key).and_then(Timer::deadline)
    }

    /// 만료 통지 적용 여부
    pub fn fire(&mut self, token: TimerToken, now: Instant) -> bool {
        self.timers
            .get_mut(&token.key)
            .map_or(false, |timer| timer.fire(token.generation, now))
    }

    /// `now` 시점에 만료된 타이머 토큰 (deadline 순)
    pub fn expired(&self, now: Instant) -> Vec<TimerToken> {
        let mut due: Vec<(Instant, TimerToken)> = self
            .timers
            .iter()
            .filter_map(|(&key, timer)| match timer.deadline() {
                Some(deadline) if deadline <= now => Some((
                    deadline,
                    TimerToken {
                        key,
                        generation: timer.generation,
                    },
                )),
                _ => None,
            })
            .collect();
        due.sort_by_key(|(deadline, token)| (*deadline, token.generation));
        due.into_iter().map(|(_, token)| token).collect()
    }

    /// 가장 이른 deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().filter_map(Timer::deadline).min()
    }

    /// 누적된 예약 변경을 꺼냄
    pub fn take_updates(&mut self) -> Vec<TimerUpdate> {
        std::mem::take(&mut self.updates)
    }

    /// teardown: 모든 타이머 해제
    pub fn free_all(&mut self) {
        for (&key, timer) in self.timers.iter_mut() {
            if timer.is_running() {
                self.updates.push(TimerUpdate::Disarmed(key));
            }
            timer.free();
        }
        self.freed = true;
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fire_after_deadline() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.start(TimerKey::DelayedSack, now + Duration::from_millis(100));
        let updates = timers.take_updates();
        let token = match updates.as_slice() {
            [TimerUpdate::Armed { token, .. }] => *token,
            other => panic!("unexpected updates: {other:?}"),
        };

        assert!(!timers.fire(token, now));
        assert!(timers.fire(token, now + Duration::from_millis(100)));
        assert_eq!(timers.state(TimerKey::DelayedSack), TimerState::Idle);
        // 한 번만 적용
        assert!(!timers.fire(token, now + Duration::from_millis(200)));
    }

    #[test]
    fn test_stale_generation_rejected() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.start(TimerKey::Init, now + Duration::from_secs(1));
        let old = timers.expired(now + Duration::from_secs(1))[0];

        timers.start(TimerKey::Init, now + Duration::from_secs(3));
        assert_eq!(timers.state(TimerKey::Init), TimerState::Rescheduled);
        assert!(!timers.fire(old, now + Duration::from_secs(2)));
        assert!(!timers.fire(old, now + Duration::from_secs(3)));

        let new = timers.expired(now + Duration::from_secs(3))[0];
        assert!(timers.fire(new, now + Duration::from_secs(3)));
    }

    #[test]
    fn test_stop_cancels_pending_fire() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.start(TimerKey::AutoClose, now);
        let token = timers.expired(now)[0];
        timers.stop(TimerKey::AutoClose);
        assert_eq!(timers.state(TimerKey::AutoClose), TimerState::Cancelled);
        assert!(!timers.fire(token, now));
        assert!(timers.take_updates().contains(&TimerUpdate::Disarmed(TimerKey::AutoClose)));
    }

    #[test]
    fn test_free_all_is_permanent() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.start(TimerKey::Shutdown, now);
        timers.free_all();
        timers.start(TimerKey::Shutdown, now);
        assert_eq!(timers.state(TimerKey::Shutdown), TimerState::PendingFree);
        assert!(timers.expired(now).is_empty());
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn test_expired_ordering() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.start(TimerKey::AutoClose, now + Duration::from_millis(30));
        timers.start(TimerKey::DelayedSack, now + Duration::from_millis(10));
        timers.start(TimerKey::Init, now + Duration::from_millis(50));
        let keys: Vec<_> = timers
            .expired(now + Duration::from_millis(40))
            .into_iter()
            .map(|t| t.key)
            .collect();
        assert_eq!(keys, vec![TimerKey::DelayedSack, TimerKey::AutoClose]);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
    }
}
