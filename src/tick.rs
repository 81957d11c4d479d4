use crate::engine::EngineHandle;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{trace, warn};

/// The fixed-period tick loop: invokes the registered tick handlers, then flushes the
///  next-tick send queue, so everything a handler queues goes out at the end of the same
///  tick.
///
/// The sleep is error-corrected: the overshoot of each cycle (handler time plus scheduling
///  jitter) is subtracted from the next sleep, so the average period converges on the
///  configured interval instead of accumulating the error.
pub async fn tick_loop(
    engine: EngineHandle,
    interval: Duration,
    mut cancelled: watch::Receiver<bool>,
) {
    let mut previous = Instant::now();
    let mut drift = Duration::ZERO;

    loop {
        tokio::select! {
            _ = cancelled.changed() => break,
            _ = tokio::time::sleep(interval.saturating_sub(drift)) => {}
        }

        let now = Instant::now();
        let elapsed = now.duration_since(previous);
        previous = now;
        // clamped: after a severe overrun the next cycle starts immediately rather than
        //  trying to catch up with a burst of back-to-back ticks
        drift = elapsed.saturating_sub(interval).min(interval);
        if elapsed > interval * 2 {
            warn!("tick overran its interval: {:?} elapsed for a period of {:?}", elapsed, interval);
        }

        for handler in engine.shared.registry.tick_handlers() {
            handler.on_tick(elapsed, &engine).await;
        }
        engine.drain_next_tick().await;
    }
    trace!("tick loop shutting down");
}
