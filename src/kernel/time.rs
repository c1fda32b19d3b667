//! Guest timekeeping.
use crate::kernel::Vdso;
use crate::net::Clock;
use std::time::Instant;

/// Host clocks read directly: wall time from the system clock, monotonic
/// time from an origin captured at construction.
#[derive(Debug, Clone)]
pub struct CalibratedClocks {
    origin: Instant,
}

impl CalibratedClocks {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for CalibratedClocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for CalibratedClocks {
    fn now_nanoseconds(&self) -> i64 {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    fn now_monotonic(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Guest view of time. Publishes through the vDSO parameter page once
/// clocks are installed.
#[derive(Debug)]
pub struct Timekeeper {
    params: Vdso,
    clocks: Option<CalibratedClocks>,
}

impl Timekeeper {
    pub fn new(params: Vdso) -> Self {
        Self {
            params,
            clocks: None,
        }
    }

    pub fn set_clocks(&mut self, clocks: CalibratedClocks) {
        self.clocks = Some(clocks);
    }

    pub fn has_clocks(&self) -> bool {
        self.clocks.is_some()
    }

    pub fn params(&self) -> &Vdso {
        &self.params
    }
}

/// Reads as zero until clocks are installed.
impl Clock for Timekeeper {
    fn now_nanoseconds(&self) -> i64 {
        self.clocks.as_ref().map_or(0, |c| c.now_nanoseconds())
    }

    fn now_monotonic(&self) -> i64 {
        self.clocks.as_ref().map_or(0, |c| c.now_monotonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vdso() -> Vdso {
        Vdso {
            param_page_offset: 0,
            param_page_len: 4096,
        }
    }

    #[test]
    fn test_monotonic_never_goes_back() {
        let clocks = CalibratedClocks::new();
        let a = clocks.now_monotonic();
        let b = clocks.now_monotonic();
        assert!(b >= a);
        assert!(clocks.now_nanoseconds() > 0);
    }

    #[test]
    fn test_timekeeper_needs_clocks() {
        let mut tk = Timekeeper::new(vdso());
        assert!(!tk.has_clocks());
        assert_eq!(tk.now_nanoseconds(), 0);

        tk.set_clocks(CalibratedClocks::new());
        assert!(tk.has_clocks());
        assert!(tk.now_nanoseconds() > 0);
        assert_eq!(tk.params().param_page_len, 4096);
    }
}
