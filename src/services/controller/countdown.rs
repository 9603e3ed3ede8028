//! Per-phase timers expressed as streams, so cancelling one is just dropping it.

use std::{pin::Pin, time::Duration};

use async_stream::stream;
use futures::Stream;
use tokio::time::{MissedTickBehavior, interval};

/// Item produced by a [`countdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Whole seconds left, emitted once per second starting with the full duration.
    Remaining(u64),
    /// The duration has fully elapsed.
    Elapsed,
}

/// Sync as well as Send: the controller holds `&self` across awaits.
pub type Countdown = Pin<Box<dyn Stream<Item = Tick> + Send + Sync>>;

/// Stream yielding `Remaining(n)`, ..., `Remaining(1)` one second apart, then `Elapsed`
/// one second after the last one. Sub-second remainders round up.
pub fn countdown(duration: Duration) -> Countdown {
    let seconds = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    Box::pin(stream! {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        for remaining in (1..=seconds).rev() {
            ticker.tick().await;
            yield Tick::Remaining(remaining);
        }
        ticker.tick().await;
        yield Tick::Elapsed;
    })
}
