use std::time::Instant;

use chrono::{DateTime, Utc};

use super::Clock;

/// Wall clock + monotonic source backed by the host.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}
