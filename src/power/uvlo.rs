use embassy_time::Duration;

use crate::config::{UVLO_CALIBRATION_UV, UVLO_POLL_INTERVAL, UVLO_TRIGGER_COUNT};

use super::ShutdownMode;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UvloAction {
    /// voltage is healthy, the fast poll can stop
    Idle,
    /// still close to the threshold, poll again after the interval
    Rearm(Duration),
    /// persist 0% and power off the way the board asks for
    Shutdown(ShutdownMode),
}

/// Debounced under-voltage lockout. Runs on its own fast cadence, the monitor
/// loop only kicks it off when vbat drops under UVLO_CALIBRATION_UV.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UvloGuard {
    shutdown_uv: i32,
    mode: ShutdownMode,
    count: u32,
    tripped: bool,
}

impl UvloGuard {
    pub const fn new(shutdown_uv: i32, mode: ShutdownMode) -> Self {
        Self {
            shutdown_uv,
            mode,
            count: 0,
            tripped: false,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn tripped(&self) -> bool {
        self.tripped
    }

    pub fn mode(&self) -> ShutdownMode {
        self.mode
    }

    pub fn sample(&mut self, vbat_uv: i32) -> UvloAction {
        if self.tripped {
            return UvloAction::Idle;
        }

        if vbat_uv < self.shutdown_uv {
            self.count += 1;
            warn!("vbat {} under uvlo {}, count {}", vbat_uv, self.shutdown_uv, self.count);
        } else {
            self.count = 0;
        }

        if self.count >= UVLO_TRIGGER_COUNT {
            error!("uvlo confirmed, shutting down ({})", self.mode);
            self.tripped = true;
            return UvloAction::Shutdown(self.mode);
        }

        if vbat_uv < UVLO_CALIBRATION_UV {
            UvloAction::Rearm(UVLO_POLL_INTERVAL)
        } else {
            UvloAction::Idle
        }
    }

    /// Battery swapped or charger attached, start over.
    pub fn reset(&mut self) {
        self.count = 0;
        self.tripped = false;
    }
}

/////////////
//  TESTS  //
/////////////

#[test]
fn shuts_down_on_nth_sample() {
    let mut uvlo = UvloGuard::new(3_100_000, ShutdownMode::Kernel);

    for _ in 0..UVLO_TRIGGER_COUNT - 1 {
        assert_eq!(UvloAction::Rearm(UVLO_POLL_INTERVAL), uvlo.sample(3_000_000));
    }
    assert!(!uvlo.tripped());

    assert_eq!(UvloAction::Shutdown(ShutdownMode::Kernel), uvlo.sample(3_000_000));
    assert!(uvlo.tripped());

    // reported once
    assert_eq!(UvloAction::Idle, uvlo.sample(3_000_000));
}

#[test]
fn recovery_resets_the_count() {
    let mut uvlo = UvloGuard::new(3_100_000, ShutdownMode::Orderly);

    for _ in 0..UVLO_TRIGGER_COUNT - 1 {
        uvlo.sample(3_000_000);
    }

    // above shutdown but still near it, keep polling
    assert_eq!(UvloAction::Rearm(UVLO_POLL_INTERVAL), uvlo.sample(3_200_000));
    assert_eq!(0, uvlo.count());
    assert_eq!(UvloAction::Rearm(UVLO_POLL_INTERVAL), uvlo.sample(3_000_000));
    assert_eq!(UvloAction::Idle, uvlo.sample(3_800_000));
}
