use std::time::{SystemTime, UNIX_EPOCH};

/// Absolute time plus the delta since the previous tick, both in seconds.
///
/// The host owns the clock: it fills one of these per tick and hands it to
/// [`crate::client::Client::update`]. Nothing in the crate reads the wall
/// clock on its own.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct TimeBase {
    pub time: f64,
    pub delta_time: f64,
}

impl TimeBase {
    pub fn new(time: f64, delta_time: f64) -> Self {
        Self { time, delta_time }
    }

    /// Step to the next tick, keeping the same delta.
    pub fn tick(&mut self) {
        self.time += self.delta_time;
    }
}

/// Seconds since the unix epoch, for hosts that drive ticks off wall time.
pub fn time_now_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should not go backwards")
        .as_secs_f64()
}
