//! Usage statistics
//!
//! [`Statistics`] keeps the number of devices online and the broadcast and
//! unicast delivery requests per [`STATS_INTERVAL`]. Every interval the
//! current values are rolled into a week of history and logged.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::info;

pub const STATS_INTERVAL: Duration = Duration::from_secs(5 * 60);

const SLOTS_PER_HOUR: usize = 12;
const SLOTS_PER_DAY: usize = 288;
const SLOTS_PER_WEEK: usize = 2016;

#[derive(Debug, Default)]
struct StatsValue {
    current: i64,
    // most recent interval first
    history: VecDeque<i64>,
}

impl StatsValue {
    fn accumulate(&mut self) {
        self.history.push_front(self.current);
        self.history.truncate(SLOTS_PER_WEEK);
    }

    /// Current value plus the last `slots - 1` rolled ones, and how many
    /// values went in.
    fn window(&self, slots: usize) -> (i64, i64) {
        let taken = self.history.iter().take(slots - 1);
        let count = taken.len() as i64 + 1;
        (self.current + taken.sum::<i64>(), count)
    }

    fn totals(&self) -> Tally {
        Tally {
            last_5min: self.current,
            last_60min: self.window(SLOTS_PER_HOUR).0,
            last_day: self.window(SLOTS_PER_DAY).0,
            last_7days: self.window(SLOTS_PER_WEEK).0,
        }
    }

    fn averages(&self) -> Tally {
        let avg = |(sum, count): (i64, i64)| sum / count;
        Tally {
            last_5min: self.current,
            last_60min: avg(self.window(SLOTS_PER_HOUR)),
            last_day: avg(self.window(SLOTS_PER_DAY)),
            last_7days: avg(self.window(SLOTS_PER_WEEK)),
        }
    }
}

/// Values over the last 5 minutes, hour, day and week.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub last_5min: i64,
    pub last_60min: i64,
    pub last_day: i64,
    pub last_7days: i64,
}

/// Devices online are averaged over each window, deliveries summed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    pub devices_online: Tally,
    pub unicasts: Tally,
    pub broadcasts: Tally,
}

#[derive(Debug, Default)]
struct Counters {
    devices_online: StatsValue,
    unicasts: StatsValue,
    broadcasts: StatsValue,
}

#[derive(Debug, Default)]
pub struct Statistics {
    counters: Mutex<Counters>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_devices_online(&self, devices: usize) {
        self.counters().devices_online.current = devices as i64;
    }

    pub fn increase_unicasts(&self) {
        self.counters().unicasts.current += 1;
    }

    pub fn increase_broadcasts(&self) {
        self.counters().broadcasts.current += 1;
    }

    pub fn report(&self) -> StatsReport {
        let counters = self.counters();
        StatsReport {
            devices_online: counters.devices_online.averages(),
            unicasts: counters.unicasts.totals(),
            broadcasts: counters.broadcasts.totals(),
        }
    }

    /// Closes the current interval: returns its report, then moves the
    /// values into the history and restarts the delivery counts.
    pub fn roll(&self) -> StatsReport {
        let report = self.report();
        let mut counters = self.counters();
        counters.devices_online.accumulate();
        counters.unicasts.accumulate();
        counters.broadcasts.accumulate();
        counters.unicasts.current = 0;
        counters.broadcasts.current = 0;
        report
    }

    /// Rolls and logs the statistics every `every`.
    pub fn spawn_reporter(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + every, every);
            loop {
                ticks.tick().await;
                log_report(&stats.roll());
            }
        })
    }
}

fn log_report(report: &StatsReport) {
    let rows: [(&str, fn(&Tally) -> i64); 4] = [
        ("5 mins ", |t: &Tally| t.last_5min),
        ("60 mins", |t: &Tally| t.last_60min),
        ("1 day  ", |t: &Tally| t.last_day),
        ("7 days ", |t: &Tally| t.last_7days),
    ];
    info!("current usage statistics:");
    info!("        |  Devices   |  Unicasts  | Broadcasts |");
    for (label, pick) in rows {
        info!(
            "{label} | {:>10} | {:>10} | {:>10} |",
            pick(&report.devices_online),
            pick(&report.unicasts),
            pick(&report.broadcasts)
        );
    }
}
