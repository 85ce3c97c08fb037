use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

/// Wall-clock source. Abstracted so counter and cooldown math can be
/// driven by a fixed clock in tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Accounting window. Daily and monthly windows start at host-local
/// midnight; the minute window starts at :00 of the current minute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Minute,
    Day,
    Month,
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Minute, Window::Day, Window::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Day => "day",
            Window::Month => "month",
        }
    }
}

/// Latest legal window boundary <= `now`.
pub fn boundary(window: Window, now: DateTime<Local>) -> DateTime<Local> {
    match window {
        Window::Minute => {
            let secs = now.timestamp();
            let floored = secs - secs.rem_euclid(60);
            Local.timestamp_opt(floored, 0).single().unwrap_or(now)
        }
        Window::Day => day_start(now.date_naive(), now),
        Window::Month => {
            let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                .unwrap_or_else(|| now.date_naive());
            day_start(first, now)
        }
    }
}

fn day_start(date: NaiveDate, fallback: DateTime<Local>) -> DateTime<Local> {
    // `earliest` resolves DST gaps where local midnight does not exist.
    date.and_hms_opt(0, 0, 0)
        .and_then(|ndt| Local.from_local_datetime(&ndt).earliest())
        .unwrap_or(fallback)
}

#[cfg(test)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Local>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Local>) {
        *self.now.lock() = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock()
    }
}
