pub trait Filter<T>: Default {
    fn add_sample(&mut self, sample: T);

    fn update(&mut self);

    fn filtered_value(&self) -> Option<T>;

    fn reset(&mut self);
}

/// Ring buffer average that drops the lowest and highest sample, so one
/// load transient doesn't drag the mean. Only reports once the window has
/// been filled.
pub struct TrimmedMeanFilter<const WINDOW_SIZE: usize> {
    window: [i32; WINDOW_SIZE],
    update_ind: usize,
    filtered_value: i32,
    initialized: bool,
}

impl<const WINDOW_SIZE: usize> TrimmedMeanFilter<WINDOW_SIZE> {
    pub const fn new() -> Self {
        Self {
            window: [0; WINDOW_SIZE],
            update_ind: 0,
            filtered_value: 0,
            initialized: false,
        }
    }
}

impl<const WINDOW_SIZE: usize> Default for TrimmedMeanFilter<WINDOW_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WINDOW_SIZE: usize> Filter<i32> for TrimmedMeanFilter<WINDOW_SIZE> {
    fn add_sample(&mut self, sample: i32) {
        self.window[self.update_ind] = sample;

        self.update_ind += 1;
        if self.update_ind >= WINDOW_SIZE {
            self.update_ind = 0;

            if !self.initialized {
                self.initialized = true;
            }
        }
    }

    fn update(&mut self) {
        if WINDOW_SIZE <= 2 {
            warn!("trimmed mean needs more than two samples");
            self.filtered_value = 0;
            return;
        }

        // i64 so a window of amp-scale uA samples can't overflow
        let mut sum: i64 = 0;
        let mut min = i32::MAX;
        let mut max = i32::MIN;
        for val in self.window {
            sum += val as i64;
            min = min.min(val);
            max = max.max(val);
        }

        sum -= min as i64 + max as i64;
        let count = (WINDOW_SIZE - 2) as i64;

        // round to nearest like the gauge does
        let rounded = if sum >= 0 { (sum + count / 2) / count } else { (sum - count / 2) / count };
        self.filtered_value = rounded as i32;
    }

    fn filtered_value(&self) -> Option<i32> {
        if !self.initialized {
            return None;
        }

        Some(self.filtered_value)
    }

    fn reset(&mut self) {
        for i in 0..WINDOW_SIZE {
            self.window[i] = 0;
        }

        self.update_ind = 0;
        self.filtered_value = 0;
        self.initialized = false;
    }
}

/////////////
//  TESTS  //
/////////////

#[test]
fn trimmed_mean_waits_for_full_window() {
    let mut f = TrimmedMeanFilter::<4>::new();
    f.add_sample(10);
    f.add_sample(20);
    f.update();
    assert_eq!(None, f.filtered_value());

    f.add_sample(30);
    f.add_sample(1000);
    f.update();
    // 10 and 1000 dropped
    assert_eq!(Some(25), f.filtered_value());
}

#[test]
fn trimmed_mean_reset() {
    let mut f = TrimmedMeanFilter::<3>::new();
    for s in [1, 2, 3] {
        f.add_sample(s);
    }
    f.update();
    assert_eq!(Some(2), f.filtered_value());

    f.reset();
    assert_eq!(None, f.filtered_value());
}
