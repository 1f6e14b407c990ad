//! Tick bus.
//!
//! One scheduler task per tick name, each sleeping until the next UTC
//! boundary of its period and broadcasting a `Tick` to subscribers.
//! Sequences are strictly increasing per tick name; a scheduler that wakes
//! more than one period late skips the missed boundaries instead of
//! replaying them.
//!
//! `tick_1w` aligns to Monday 00:00 UTC. `tick_1mo` aligns to calendar
//! month starts (00:00:00 UTC on the 1st).

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Periodic event delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Tick {
    pub name: String,
    pub unix_ts: i64,
    pub sequence: u64,
}

/// Period of one tick channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPeriod {
    Seconds(i64),
    Week,
    Month,
}

/// All supported tick channels.
pub const SUPPORTED_TICKS: &[(&str, TickPeriod)] = &[
    ("tick_1s", TickPeriod::Seconds(1)),
    ("tick_5s", TickPeriod::Seconds(5)),
    ("tick_15s", TickPeriod::Seconds(15)),
    ("tick_1m", TickPeriod::Seconds(60)),
    ("tick_5m", TickPeriod::Seconds(300)),
    ("tick_15m", TickPeriod::Seconds(900)),
    ("tick_1h", TickPeriod::Seconds(3600)),
    ("tick_1d", TickPeriod::Seconds(86_400)),
    ("tick_1w", TickPeriod::Week),
    ("tick_1mo", TickPeriod::Month),
];

pub fn tick_period(name: &str) -> Option<TickPeriod> {
    SUPPORTED_TICKS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, p)| *p)
}

/// Next boundary strictly after `now` for the given period.
pub fn next_boundary(period: TickPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    match period {
        TickPeriod::Seconds(secs) => {
            let ts = now.timestamp();
            let next = (ts.div_euclid(secs) + 1) * secs;
            Utc.timestamp_opt(next, 0).unwrap()
        }
        TickPeriod::Week => {
            let today = now.date_naive();
            let monday =
                today - ChronoDuration::days(today.weekday().num_days_from_monday() as i64);
            let mut next = monday
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_utc();
            while next <= now {
                next += ChronoDuration::days(7);
            }
            next
        }
        TickPeriod::Month => {
            let (mut year, mut month) = (now.year(), now.month());
            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
            NaiveDate::from_ymd_opt(year, month, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_utc()
        }
    }
}

/// Start of the window that ends at `end` for the given period.
pub fn window_start(period: TickPeriod, end: DateTime<Utc>) -> DateTime<Utc> {
    match period {
        TickPeriod::Seconds(secs) => end - ChronoDuration::seconds(secs),
        TickPeriod::Week => end - ChronoDuration::days(7),
        TickPeriod::Month => {
            let (year, month) = if end.month() == 1 {
                (end.year() - 1, 12)
            } else {
                (end.year(), end.month() - 1)
            };
            NaiveDate::from_ymd_opt(year, month, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_utc()
        }
    }
}

struct TickChannel {
    sender: broadcast::Sender<Tick>,
    sequence: AtomicU64,
    period: TickPeriod,
}

/// Owns every tick channel and its scheduler task.
pub struct TickBus {
    channels: RwLock<HashMap<String, Arc<TickChannel>>>,
}

impl Default for TickBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TickBus {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        for (name, period) in SUPPORTED_TICKS {
            let (sender, _) = broadcast::channel(64);
            channels.insert(
                name.to_string(),
                Arc::new(TickChannel {
                    sender,
                    sequence: AtomicU64::new(0),
                    period: *period,
                }),
            );
        }
        Self {
            channels: RwLock::new(channels),
        }
    }

    /// Subscribe to a tick channel. Receivers that fall behind observe a
    /// lag error and can detect gaps through `sequence`.
    pub fn subscribe(&self, name: &str) -> Option<broadcast::Receiver<Tick>> {
        self.channels.read().get(name).map(|c| c.sender.subscribe())
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.channels.read().contains_key(name)
    }

    /// Fire one tick immediately, outside the schedule. Used by shutdown
    /// (final flush pass) and by tests.
    pub fn trigger(&self, name: &str) -> Option<Tick> {
        let channel = self.channels.read().get(name).cloned()?;
        Some(Self::fire(name, &channel, Utc::now()))
    }

    fn fire(name: &str, channel: &TickChannel, at: DateTime<Utc>) -> Tick {
        let sequence = channel.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let tick = Tick {
            name: name.to_string(),
            unix_ts: at.timestamp(),
            sequence,
        };
        // Send fails only when there are no subscribers, which is fine.
        let _ = channel.sender.send(tick.clone());
        tick
    }

    /// Spawn one scheduler task per tick channel.
    pub fn start(self: &Arc<Self>) {
        let channels: Vec<(String, Arc<TickChannel>)> = self
            .channels
            .read()
            .iter()
            .map(|(n, c)| (n.clone(), c.clone()))
            .collect();

        for (name, channel) in channels {
            tokio::spawn(async move {
                loop {
                    let now = Utc::now();
                    let target = next_boundary(channel.period, now);
                    let wait = (target - now)
                        .to_std()
                        .unwrap_or_else(|_| std::time::Duration::from_millis(0));
                    tokio::time::sleep(wait).await;

                    let woke = Utc::now();
                    let late = woke - target;
                    if let TickPeriod::Seconds(secs) = channel.period {
                        if late > ChronoDuration::seconds(secs) {
                            // Drifted past at least one boundary; skip the
                            // missed ticks and realign on the next loop.
                            warn!(
                                tick = %name,
                                late_secs = late.num_seconds(),
                                "tick drift exceeds one period, skipping missed ticks"
                            );
                            continue;
                        }
                    }

                    let tick = Self::fire(&name, &channel, target);
                    debug!(tick = %name, seq = tick.sequence, ts = tick.unix_ts, "tick");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_second_boundaries_align() {
        let now = utc(2026, 3, 5, 14, 37, 41);

        let next = next_boundary(TickPeriod::Seconds(1), now);
        assert_eq!(next, utc(2026, 3, 5, 14, 37, 42));

        let next = next_boundary(TickPeriod::Seconds(60), now);
        assert_eq!(next, utc(2026, 3, 5, 14, 38, 0));

        let next = next_boundary(TickPeriod::Seconds(3600), now);
        assert_eq!(next, utc(2026, 3, 5, 15, 0, 0));

        let next = next_boundary(TickPeriod::Seconds(86_400), now);
        assert_eq!(next, utc(2026, 3, 6, 0, 0, 0));
    }

    #[test]
    fn test_boundary_is_strictly_after_now() {
        // Exactly on a boundary: the next one is a full period away.
        let now = utc(2026, 3, 5, 15, 0, 0);
        let next = next_boundary(TickPeriod::Seconds(3600), now);
        assert_eq!(next, utc(2026, 3, 5, 16, 0, 0));
    }

    #[test]
    fn test_week_boundary_is_monday() {
        // 2026-03-05 is a Thursday; next Monday is 2026-03-09.
        let now = utc(2026, 3, 5, 10, 0, 0);
        let next = next_boundary(TickPeriod::Week, now);
        assert_eq!(next, utc(2026, 3, 9, 0, 0, 0));

        // On Monday midnight the next boundary is the following Monday.
        let next = next_boundary(TickPeriod::Week, utc(2026, 3, 9, 0, 0, 0));
        assert_eq!(next, utc(2026, 3, 16, 0, 0, 0));
    }

    #[test]
    fn test_month_boundary_is_calendar_first() {
        let next = next_boundary(TickPeriod::Month, utc(2026, 3, 5, 10, 0, 0));
        assert_eq!(next, utc(2026, 4, 1, 0, 0, 0));

        // December rolls into January.
        let next = next_boundary(TickPeriod::Month, utc(2026, 12, 31, 23, 59, 59));
        assert_eq!(next, utc(2027, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_window_start_inverts_boundaries() {
        let end = utc(2026, 3, 5, 15, 0, 0);
        assert_eq!(
            window_start(TickPeriod::Seconds(3600), end),
            utc(2026, 3, 5, 14, 0, 0)
        );
        assert_eq!(
            window_start(TickPeriod::Week, utc(2026, 3, 9, 0, 0, 0)),
            utc(2026, 3, 2, 0, 0, 0)
        );
        assert_eq!(
            window_start(TickPeriod::Month, utc(2026, 1, 1, 0, 0, 0)),
            utc(2025, 12, 1, 0, 0, 0)
        );
    }

    #[test]
    fn test_supported_ticks_lookup() {
        assert_eq!(tick_period("tick_5m"), Some(TickPeriod::Seconds(300)));
        assert_eq!(tick_period("tick_1mo"), Some(TickPeriod::Month));
        assert_eq!(tick_period("tick_2h"), None);
    }

    #[tokio::test]
    async fn test_trigger_delivers_with_increasing_sequence() {
        let bus = TickBus::new();
        let mut rx = bus.subscribe("tick_1m").unwrap();

        let t1 = bus.trigger("tick_1m").unwrap();
        let t2 = bus.trigger("tick_1m").unwrap();
        assert_eq!(t1.sequence + 1, t2.sequence);

        let got1 = rx.recv().await.unwrap();
        let got2 = rx.recv().await.unwrap();
        assert_eq!(got1.sequence, t1.sequence);
        assert_eq!(got2.sequence, t2.sequence);
        assert_eq!(got1.name, "tick_1m");
    }

    #[tokio::test]
    async fn test_unknown_tick_not_subscribable() {
        let bus = TickBus::new();
        assert!(bus.subscribe("tick_2h").is_none());
        assert!(bus.trigger("tick_2h").is_none());
        assert!(bus.is_supported("tick_1d"));
    }
}
