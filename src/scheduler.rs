//! Frame scheduler.
//!
//! Coalesces per-PTY "output arrived" signals into renders paced by a soft
//! frame budget. A burst of pokes inside one budget window collapses into a
//! single render; an idle PTY that produces one byte pays one render and no
//! periodic polling ever happens.

use std::time::{Duration, Instant};

/// Default soft frame budget, ~60 Hz.
pub const DEFAULT_FRAME_BUDGET: Duration = Duration::from_millis(16);

/// What the owner should do about fresh activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderDecision {
    /// Render immediately; the budget has already elapsed.
    Now,
    /// Arm a one-shot timer this far in the future.
    Schedule(Duration),
    /// A previously armed timer already covers this activity.
    Covered,
}

/// Per-PTY pacing state. Pure over caller-supplied instants so the
/// coalescing bound is testable without a clock.
#[derive(Debug)]
pub struct FramePacer {
    budget: Duration,
    last_render: Option<Instant>,
    timer_pending: bool,
}

impl FramePacer {
    pub fn new(budget: Duration) -> Self {
        FramePacer {
            budget,
            last_render: None,
            timer_pending: false,
        }
    }

    /// Called when the notify pipe wakes the main thread for this PTY.
    pub fn on_activity(&mut self, now: Instant) -> RenderDecision {
        if let Some(last) = self.last_render {
            let dt = now.saturating_duration_since(last);
            if dt < self.budget {
                if self.timer_pending {
                    return RenderDecision::Covered;
                }
                self.timer_pending = true;
                return RenderDecision::Schedule(self.budget - dt);
            }
        }
        self.last_render = Some(now);
        self.timer_pending = false;
        RenderDecision::Now
    }

    /// Called when the armed timer fires; the owner renders right after.
    pub fn on_timer_fired(&mut self, now: Instant) {
        self.last_render = Some(now);
        self.timer_pending = false;
    }

    /// Drop any armed timer, e.g. when the PTY closes. Returns whether a
    /// timer was pending so the owner can cancel it in the event loop.
    pub fn reset_timer(&mut self) -> bool {
        std::mem::take(&mut self.timer_pending)
    }

    pub fn timer_pending(&self) -> bool {
        self.timer_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn first_activity_renders_immediately() {
        let mut pacer = FramePacer::new(ms(16));
        let t0 = Instant::now();
        assert_eq!(pacer.on_activity(t0), RenderDecision::Now);
    }

    #[test]
    fn burst_within_budget_coalesces_to_one_timer() {
        let mut pacer = FramePacer::new(ms(16));
        let t0 = Instant::now();
        assert_eq!(pacer.on_activity(t0), RenderDecision::Now);
        // Ten pokes inside the window: one schedule, the rest covered.
        assert_eq!(pacer.on_activity(t0 + ms(1)), RenderDecision::Schedule(ms(15)));
        for i in 2..11 {
            assert_eq!(pacer.on_activity(t0 + ms(i)), RenderDecision::Covered);
        }
        pacer.on_timer_fired(t0 + ms(16));
        assert!(!pacer.timer_pending());
    }

    #[test]
    fn activity_after_budget_renders_now() {
        let mut pacer = FramePacer::new(ms(16));
        let t0 = Instant::now();
        pacer.on_activity(t0);
        assert_eq!(pacer.on_activity(t0 + ms(20)), RenderDecision::Now);
    }

    #[test]
    fn timer_fire_restarts_the_cycle() {
        let mut pacer = FramePacer::new(ms(16));
        let t0 = Instant::now();
        pacer.on_activity(t0);
        assert_eq!(pacer.on_activity(t0 + ms(4)), RenderDecision::Schedule(ms(12)));
        pacer.on_timer_fired(t0 + ms(16));
        // Fresh poke right after the timer render schedules again.
        assert_eq!(pacer.on_activity(t0 + ms(17)), RenderDecision::Schedule(ms(15)));
    }

    #[test]
    fn render_count_is_bounded_by_elapsed_over_budget() {
        // K pokes spread over `elapsed` must cause at most
        // ceil(elapsed/budget) + 1 renders.
        let budget = ms(16);
        let mut pacer = FramePacer::new(budget);
        let t0 = Instant::now();
        let mut renders = 0u32;
        let mut pending_deadline: Option<Instant> = None;
        let pokes = 100u64;
        let spacing = ms(5);
        for i in 0..pokes {
            let now = t0 + spacing * i as u32;
            // Fire any due timer first, as the event loop would.
            if let Some(deadline) = pending_deadline {
                if deadline <= now {
                    pacer.on_timer_fired(deadline);
                    renders += 1;
                    pending_deadline = None;
                }
            }
            match pacer.on_activity(now) {
                RenderDecision::Now => renders += 1,
                RenderDecision::Schedule(delay) => pending_deadline = Some(now + delay),
                RenderDecision::Covered => {}
            }
        }
        let elapsed = spacing * (pokes - 1) as u32;
        let bound = (elapsed.as_millis() / budget.as_millis()) as u32 + 2;
        assert!(renders <= bound, "renders {renders} exceeded bound {bound}");
    }

    #[test]
    fn reset_reports_pending_timer() {
        let mut pacer = FramePacer::new(ms(16));
        let t0 = Instant::now();
        pacer.on_activity(t0);
        pacer.on_activity(t0 + ms(1));
        assert!(pacer.reset_timer());
        assert!(!pacer.reset_timer());
    }
}
