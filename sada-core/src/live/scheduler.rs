//! Gapless scheduling of inbound audio chunks.
//!
//! ```text
//! start_i  = max(cursor, now)
//! cursor  ← start_i + duration_i
//! ```
//!
//! Chunks arriving faster than real time queue back to back. A chunk arriving
//! after the cursor has passed plays at `now`, leaving a gap (an underrun).

/// Placement chosen for one chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    /// Context time the chunk starts at.
    pub start: f64,
    /// Context time it ends at; also the new cursor.
    pub end: f64,
    /// Silence between the previous chunk's end and this start. Zero for the
    /// first chunk of a run.
    pub gap: f64,
}

/// Running "next available start time" on an output clock.
#[derive(Debug, Clone)]
pub struct StreamCursor {
    next_start: f64,
    /// No chunk queued since the last reset or turn end.
    idle: bool,
}

impl StreamCursor {
    pub fn new() -> Self {
        Self {
            next_start: 0.0,
            idle: true,
        }
    }

    /// Place a chunk of `duration` seconds given the clock reading `now`.
    pub fn schedule(&mut self, now: f64, duration: f64) -> Slot {
        let start = self.next_start.max(now);
        let gap = if self.idle {
            0.0
        } else {
            (now - self.next_start).max(0.0)
        };
        self.next_start = start + duration.max(0.0);
        self.idle = false;
        Slot {
            start,
            end: self.next_start,
            gap,
        }
    }

    /// Schedule the next chunk immediately.
    pub fn reset(&mut self) {
        self.next_start = 0.0;
        self.idle = true;
    }

    /// Keep the cursor but do not count the pause before the next chunk as
    /// an underrun.
    pub fn mark_idle(&mut self) {
        self.idle = true;
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

impl Default for StreamCursor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn instant_arrivals_queue_back_to_back() {
        let mut cursor = StreamCursor::new();
        let starts: Vec<f64> = [0.5, 0.25, 1.0]
            .iter()
            .map(|d| cursor.schedule(2.0, *d).start)
            .collect();
        assert_eq!(starts, [2.0, 2.5, 2.75]);
        assert_abs_diff_eq!(cursor.next_start(), 3.75);
    }

    #[test]
    fn late_chunk_starts_now_and_reports_gap() {
        let mut cursor = StreamCursor::new();
        cursor.schedule(0.0, 1.0);
        let slot = cursor.schedule(1.4, 0.5);
        assert_abs_diff_eq!(slot.start, 1.4);
        assert_abs_diff_eq!(slot.gap, 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(slot.end, 1.9);
    }

    #[test]
    fn never_schedules_in_the_past() {
        let mut cursor = StreamCursor::new();
        let slot = cursor.schedule(10.0, 0.1);
        assert!(slot.start >= 10.0);
        assert_eq!(slot.gap, 0.0);
    }

    #[test]
    fn reset_schedules_immediately() {
        let mut cursor = StreamCursor::new();
        cursor.schedule(0.0, 5.0);
        cursor.reset();
        assert_eq!(cursor.next_start(), 0.0);
        let slot = cursor.schedule(1.0, 0.5);
        assert_abs_diff_eq!(slot.start, 1.0);
        assert_eq!(slot.gap, 0.0);
    }

    #[test]
    fn idle_pause_is_not_an_underrun() {
        let mut cursor = StreamCursor::new();
        cursor.schedule(0.0, 1.0);
        cursor.mark_idle();
        let slot = cursor.schedule(8.0, 1.0);
        assert_abs_diff_eq!(slot.start, 8.0);
        assert_eq!(slot.gap, 0.0);
    }
}
