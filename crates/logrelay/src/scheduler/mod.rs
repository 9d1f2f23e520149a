// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cancelable periodic triggers.
//!
//! A [`Trigger`] owns one timer task. The task never blocks on delivery: ticks
//! go through a channel of capacity one, so ticks produced while the consumer
//! is still busy with the previous one are coalesced.
//!
//! ```text
//!   timer task ──try_send──> [ Tick ] ──recv──> dispatcher
//!        ^                                          │
//!        └──────────── cancel / join ───────────────┘
//! ```

mod schedule;

pub use schedule::{next_daily_fire, DailyAt, Schedule};

use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One firing of a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub fired_at: DateTime<Local>,
    /// The daily slot this tick belongs to, `None` for periodic schedules.
    pub slot: Option<DateTime<Local>>,
}

impl Tick {
    /// The time a daily tick is evaluated at. The wall clock can read slightly
    /// before the slot when it was stepped while the timer slept.
    #[must_use]
    pub fn due_at(&self) -> DateTime<Local> {
        self.slot.map_or(self.fired_at, |slot| slot.max(self.fired_at))
    }
}

/// Longest period a timer is armed with.
pub const MAX_PERIOD: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Clamps a timer period into `1ms..=MAX_PERIOD` so deadline arithmetic
/// cannot overflow and intervals never spin.
#[must_use]
pub fn bounded_period(period: Duration) -> Duration {
    period.clamp(Duration::from_millis(1), MAX_PERIOD)
}

/// A background timer feeding [`Tick`]s into a channel of capacity one, so
/// ticks that fire while the previous one is unhandled collapse into it.
#[derive(Debug)]
pub struct Trigger {
    name: &'static str,
    schedule: Schedule,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    rx: mpsc::Receiver<Tick>,
}

impl Trigger {
    /// Spawns the timer task for `schedule`.
    #[must_use]
    pub fn start(name: &'static str, schedule: Schedule) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(name, schedule, cancel.clone(), tx));
        debug!("Trigger {name} started, {schedule}");
        Self {
            name,
            schedule,
            cancel,
            handle,
            rx,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Waits for the next tick. Returns `None` once the timer task is gone.
    pub async fn tick(&mut self) -> Option<Tick> {
        self.rx.recv().await
    }

    /// Returns a pending tick without waiting.
    pub fn try_tick(&mut self) -> Option<Tick> {
        self.rx.try_recv().ok()
    }

    /// Cancels the timer task and waits until it has exited.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Trigger {} task ended abnormally: {e}", self.name);
        }
        debug!("Trigger {} stopped", self.name);
    }

    /// Stops this trigger and starts a fresh one with `schedule`.
    pub async fn update(self, schedule: Schedule) -> Self {
        let name = self.name;
        self.stop().await;
        Self::start(name, schedule)
    }
}

async fn run(
    name: &'static str,
    schedule: Schedule,
    cancel: CancellationToken,
    tx: mpsc::Sender<Tick>,
) {
    match schedule {
        Schedule::Every(period) => {
            let period = bounded_period(period);
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let tick = Tick { fired_at: Local::now(), slot: None };
                        if !deliver(name, &tx, tick) {
                            break;
                        }
                    }
                }
            }
        }
        Schedule::DailyAt(at) => {
            let mut last_slot: Option<DateTime<Local>> = None;
            loop {
                let now = Local::now();
                // never fire the same slot twice, even if the sleep wakes early
                let from = match last_slot {
                    Some(slot) if slot > now => slot,
                    _ => now,
                };
                let next = next_daily_fire(&from, at);
                let delay = (next - now).to_std().unwrap_or_default();
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = sleep(delay) => {
                        last_slot = Some(next);
                        let tick = Tick { fired_at: Local::now(), slot: Some(next) };
                        if !deliver(name, &tx, tick) {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Returns false once the receiving side is gone.
fn deliver(name: &'static str, tx: &mpsc::Sender<Tick>, tick: Tick) -> bool {
    match tx.try_send(tick) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!("Trigger {name}: previous tick still pending, coalescing");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_daily_tick_is_never_due_before_its_slot() {
        let slot = Local::now();
        let early = Tick {
            fired_at: slot - chrono::Duration::seconds(2),
            slot: Some(slot),
        };
        assert_eq!(early.due_at(), slot);

        let late = Tick {
            fired_at: slot + chrono::Duration::seconds(2),
            slot: Some(slot),
        };
        assert_eq!(late.due_at(), late.fired_at);

        let periodic = Tick {
            fired_at: slot,
            slot: None,
        };
        assert_eq!(periodic.due_at(), slot);
    }

    #[test]
    fn test_bounded_period() {
        assert_eq!(bounded_period(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(bounded_period(Duration::from_secs(60)), Duration::from_secs(60));
        assert_eq!(bounded_period(Duration::from_secs(u64::MAX)), MAX_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_period_does_not_overflow() {
        let trigger = Trigger::start("test", Schedule::Every(Duration::from_secs(u64::MAX)));
        tokio::task::yield_now().await;
        trigger.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_first_tick_after_one_period() {
        let mut trigger = Trigger::start("test", Schedule::Every(Duration::from_secs(10)));
        let started = Instant::now();
        let tick = trigger.tick().await.expect("tick");
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(tick.slot, None);
        trigger.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_coalesce_while_consumer_is_busy() {
        let mut trigger = Trigger::start("test", Schedule::Every(Duration::from_secs(1)));
        sleep(Duration::from_millis(5500)).await;
        assert!(trigger.try_tick().is_some());
        assert!(trigger.try_tick().is_none());
        trigger.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_replaces_schedule() {
        let trigger = Trigger::start("test", Schedule::Every(Duration::from_secs(1)));
        let mut trigger = trigger.update(Schedule::Every(Duration::from_secs(100))).await;
        assert_eq!(trigger.schedule(), Schedule::Every(Duration::from_secs(100)));
        assert_eq!(trigger.name(), "test");
        let waited = tokio::time::timeout(Duration::from_secs(50), trigger.tick()).await;
        assert!(waited.is_err(), "no tick expected before the new period");
        assert!(trigger.tick().await.is_some());
        trigger.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_trigger_delivers_nothing() {
        let trigger = Trigger::start("test", Schedule::Every(Duration::from_secs(1)));
        let cancel = trigger.cancel.clone();
        trigger.stop().await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_tick_carries_slot() {
        let at = DailyAt::parse("0:00").expect("valid");
        let mut trigger = Trigger::start("daily", Schedule::DailyAt(at));
        let tick = trigger.tick().await.expect("tick");
        let slot = tick.slot.expect("daily ticks carry their slot");
        assert_eq!((slot.hour(), slot.minute()), (0, 0));
        trigger.stop().await;
    }
}
