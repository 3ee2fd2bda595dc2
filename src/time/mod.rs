use embassy_time::{Duration, Instant};

/// One-shot re-armable deadline. Callers pass `now` in so the control logic
/// can be driven by a simulated clock.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Deadline {
    ready_at: Option<Instant>,
}

impl Deadline {
    pub const fn idle() -> Self {
        Self { ready_at: None }
    }

    pub fn arm(&mut self, now: Instant, duration: Duration) {
        self.ready_at = Some(now + duration);
    }

    /// Arms only if not already pending, keeps the earlier deadline.
    pub fn arm_if_idle(&mut self, now: Instant, duration: Duration) {
        if self.ready_at.is_none() {
            self.arm(now, duration);
        }
    }

    pub fn cancel(&mut self) {
        self.ready_at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.ready_at.is_some()
    }

    pub fn ready_at(&self) -> Option<Instant> {
        self.ready_at
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.ready_at.map(|at| at.checked_duration_since(now).unwrap_or(Duration::from_ticks(0)))
    }

    /// True once per arming, when `now` has reached the deadline.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.ready_at {
            Some(at) if now >= at => {
                self.ready_at = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::idle()
    }
}

/// Earliest of a set of optional instants.
pub fn earliest(deadlines: &[Option<Instant>]) -> Option<Instant> {
    deadlines.iter().flatten().copied().min()
}

/////////////
//  TESTS  //
/////////////

#[test]
fn deadline_fires_once() {
    let t0 = Instant::from_secs(10);
    let mut d = Deadline::idle();
    assert!(!d.fire(t0));

    d.arm(t0, Duration::from_millis(500));
    assert!(!d.fire(t0 + Duration::from_millis(499)));
    assert_eq!(Some(Duration::from_millis(100)), d.remaining(t0 + Duration::from_millis(400)));
    assert!(d.fire(t0 + Duration::from_millis(500)));
    assert!(!d.fire(t0 + Duration::from_secs(5)));
}

#[test]
fn arm_if_idle_keeps_earlier() {
    let t0 = Instant::from_secs(1);
    let mut d = Deadline::idle();
    d.arm_if_idle(t0, Duration::from_secs(1));
    d.arm_if_idle(t0, Duration::from_secs(9));
    assert_eq!(Some(t0 + Duration::from_secs(1)), d.ready_at());
    assert_eq!(
        Some(t0),
        earliest(&[None, Some(t0 + Duration::from_secs(3)), Some(t0)])
    );
}
