//! Accumulates streamed tokens and decides when a snapshot is due.

use std::time::Duration;

use tokio::time::Instant;

/// Per-request stream state: the full text seen so far plus the emission
/// gate that keeps progressive edits under the platform's rate ceiling.
///
/// Owned by the single task driving one request; the pending flag is set
/// before a network write starts and cleared only after it finishes, so
/// deltas arriving while a write is in flight coalesce into the next due
/// snapshot instead of racing it.
pub struct Assembler {
    text: String,
    throttle: Duration,
    last_emitted_at: Instant,
    emitted_len: usize,
    in_flight_len: usize,
    pending: bool,
    finalized: bool,
}

impl Assembler {
    pub fn new(throttle: Duration) -> Self {
        Self {
            text: String::new(),
            throttle,
            last_emitted_at: Instant::now(),
            emitted_len: 0,
            in_flight_len: 0,
            pending: false,
            finalized: false,
        }
    }

    /// Appends a token delta. The accumulated text only ever grows.
    pub fn push_delta(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// Returns a snapshot when one is due: the throttle interval has
    /// elapsed, no write is in flight, and there is content that has not
    /// been emitted yet. Marks the emission pending; the caller must call
    /// [`Self::emission_done`] once the write finishes, success or not.
    pub fn take_due(&mut self) -> Option<String> {
        if self.finalized || self.pending {
            return None;
        }
        if self.last_emitted_at.elapsed() < self.throttle {
            return None;
        }
        if self.text.len() <= self.emitted_len {
            return None;
        }
        self.pending = true;
        self.in_flight_len = self.text.len();
        Some(self.text.clone())
    }

    /// Final snapshot, due unconditionally. After this no further
    /// non-final emissions are produced.
    pub fn finish(&mut self) -> String {
        self.finalized = true;
        self.pending = true;
        self.in_flight_len = self.text.len();
        self.text.clone()
    }

    /// Clears the pending flag and stamps the emission time.
    pub fn emission_done(&mut self) {
        self.pending = false;
        self.emitted_len = self.in_flight_len;
        self.last_emitted_at = Instant::now();
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const THROTTLE: Duration = Duration::from_millis(1500);

    #[tokio::test(start_paused = true)]
    async fn test_accumulation_preserves_arrival_order() {
        let mut asm = Assembler::new(THROTTLE);
        for delta in ["サ", "マー", "さん", "です"] {
            asm.push_delta(delta);
        }
        assert_eq!(asm.text(), "サマーさんです");
        assert_eq!(asm.finish(), "サマーさんです");
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_scenario() {
        // deltas at t=0, 400, 1600, 3000 with a 1500ms throttle: the only
        // non-final emission happens at ~1600, then the final at completion.
        let mut asm = Assembler::new(THROTTLE);

        asm.push_delta("a");
        assert!(asm.take_due().is_none());

        advance(Duration::from_millis(400)).await;
        asm.push_delta("b");
        assert!(asm.take_due().is_none());

        advance(Duration::from_millis(1200)).await;
        asm.push_delta("c");
        let snapshot = asm.take_due().expect("first emission due at 1600ms");
        assert_eq!(snapshot, "abc");
        asm.emission_done();

        advance(Duration::from_millis(1400)).await;
        asm.push_delta("d");
        assert!(asm.take_due().is_none(), "3000ms is within the throttle window");

        assert_eq!(asm.finish(), "abcd");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_emission_while_pending() {
        let mut asm = Assembler::new(THROTTLE);
        asm.push_delta("first");
        advance(Duration::from_millis(1600)).await;
        assert!(asm.take_due().is_some());

        // a delta arriving while the write is in flight coalesces
        asm.push_delta(" second");
        advance(Duration::from_millis(1600)).await;
        assert!(asm.take_due().is_none());

        asm.emission_done();
        advance(Duration::from_millis(1600)).await;
        assert_eq!(asm.take_due().as_deref(), Some("first second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_emission_without_new_content() {
        let mut asm = Assembler::new(THROTTLE);
        asm.push_delta("all of it");
        advance(Duration::from_millis(1600)).await;
        assert!(asm.take_due().is_some());
        asm.emission_done();

        advance(Duration::from_millis(1600)).await;
        assert!(asm.take_due().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_emission_ignores_throttle() {
        let mut asm = Assembler::new(THROTTLE);
        asm.push_delta("short");
        advance(Duration::from_millis(1600)).await;
        assert!(asm.take_due().is_some());
        asm.emission_done();

        // completion right after an emission still yields the final text
        asm.push_delta(" answer");
        assert_eq!(asm.finish(), "short answer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_emission_done_after_failed_write_unblocks() {
        let mut asm = Assembler::new(THROTTLE);
        asm.push_delta("x");
        advance(Duration::from_millis(1600)).await;
        assert!(asm.take_due().is_some());
        // the write failed; pending must still clear
        asm.emission_done();
        asm.push_delta("y");
        advance(Duration::from_millis(1600)).await;
        assert_eq!(asm.take_due().as_deref(), Some("xy"));
    }
}
