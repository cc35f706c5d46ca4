//! Timed events.

use crate::component::Component;
use crate::context::Context;
use crate::event::Event;
use crate::handler::HandlerSet;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::debug;

/// Fires an event once after a delay, or repeatedly at an interval.
///
/// A one-shot timer unregisters itself after firing. The event is fired
/// with the timer's channel as default target, so address it explicitly
/// (`Event::target`) unless every listener should see it.
///
/// ```ignore
/// let timer = engine.add(Timer::new(Duration::from_secs(5), Event::new("Poll")).persist(true));
/// engine.register(timer, app)?;
/// ```
pub struct Timer {
    interval: Duration,
    event: Event,
    persist: bool,
    expiry: Option<Instant>,
}

impl Timer {
    pub fn new(interval: Duration, event: Event) -> Self {
        Self {
            interval,
            event,
            persist: false,
            expiry: Some(Instant::now() + interval),
        }
    }

    /// Fire once at a wall-clock time. Times in the past fire on the next tick.
    pub fn at(when: DateTime<Utc>, event: Event) -> Self {
        let interval = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Self::new(interval, event)
    }

    /// Keep firing every interval until unregistered.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Restart the countdown from now.
    pub fn reset(&mut self) {
        self.expiry = Some(Instant::now() + self.interval);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the timer next fires, `None` once a one-shot timer has fired.
    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    fn poll(&mut self, ctx: &Context) -> anyhow::Result<()> {
        let Some(expiry) = self.expiry else {
            return Ok(());
        };

        if Instant::now() < expiry {
            ctx.wake_at(expiry);
            return Ok(());
        }

        let mut event = self.event.duplicate();
        if event.target_name().is_none() {
            event = event.target(ctx.channel());
        }
        debug!(component = %ctx.component(), event = %event, "timer fired");
        // Queued events move with the subtree that fired them, so a one-shot
        // timer fires on behalf of its parent before detaching.
        let engine = ctx.engine();
        let origin = engine.parent_of(ctx.component()).unwrap_or(ctx.component());
        engine.fire(origin, event)?;

        if self.persist {
            self.reset();
            if let Some(next) = self.expiry {
                ctx.wake_at(next);
            }
        } else {
            self.expiry = None;
            ctx.unregister()?;
        }
        Ok(())
    }
}

impl Component for Timer {
    fn handlers(set: &mut HandlerSet<Self>) {
        set.on_tick(Timer::poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_wall_clock_times_fire_immediately() {
        let timer = Timer::at(Utc::now() - chrono::Duration::seconds(10), Event::new("Late"));
        assert_eq!(timer.interval(), Duration::ZERO);
        assert!(timer.expiry().is_some_and(|e| e <= Instant::now()));
    }

    #[test]
    fn reset_pushes_expiry_forward() {
        let mut timer = Timer::new(Duration::from_secs(60), Event::new("Tick"));
        let first = timer.expiry().expect("armed");
        std::thread::sleep(Duration::from_millis(2));
        timer.reset();
        assert!(timer.expiry().expect("armed") > first);
    }
}
