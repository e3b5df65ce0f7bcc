//! Randomized wait durations used between interaction steps.

use rand::Rng;
use std::time::Duration;

/// An inclusive millisecond range to draw pauses from.
pub type DelayRange = (u64, u64);

/// Uniformly distributed duration with `min_ms <= result <= max_ms`.
pub fn jitter(min_ms: u64, max_ms: u64) -> Duration {
    let (lo, hi) = if min_ms <= max_ms {
        (min_ms, max_ms)
    } else {
        (max_ms, min_ms)
    };
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

/// Sleep for a duration drawn from `range`.
pub async fn pause(range: DelayRange) {
    tokio::time::sleep(jitter(range.0, range.1)).await;
}

/// Delay ranges for every pacing decision the pipeline makes.
///
/// Defaults match the production cadence; tests use [`Pacing::zero`] to run
/// the same code paths without wall-clock cost.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// After scrolling an element into view.
    pub post_scroll: DelayRange,
    /// After hovering, before the click lands.
    pub post_hover: DelayRange,
    /// After the click-to-focus that precedes typing.
    pub post_focus: DelayRange,
    /// Between individual typed characters.
    pub keystroke: DelayRange,
    /// After each executed pipeline step (click/type/submit).
    pub inter_step: DelayRange,
    /// Between records.
    pub inter_record: DelayRange,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            post_scroll: (100, 300),
            post_hover: (200, 500),
            post_focus: (100, 300),
            keystroke: (80, 200),
            inter_step: (500, 2000),
            inter_record: (1000, 3000),
        }
    }
}

impl Pacing {
    /// All-zero pacing, for tests.
    pub fn zero() -> Self {
        Self {
            post_scroll: (0, 0),
            post_hover: (0, 0),
            post_focus: (0, 0),
            keystroke: (0, 0),
            inter_step: (0, 0),
            inter_record: (0, 0),
        }
    }
}
