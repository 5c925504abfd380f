//! Host inactivity deadline.
//!
//! A millisecond-resolution monotonic deadline used by the boot
//! controller: armed when the DFU loop starts, re-armed on every sign
//! of host activity, and checked each loop iteration. The caller
//! supplies the clock reading (the system time source belongs to the
//! board), so the arithmetic is plain wrapping subtraction.

/// Inactivity deadline with enable/reset/expiry checks.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct InactivityTimeout {
    period_ms: u32,
    start_ms: u32,
    enabled: bool,
}

impl InactivityTimeout {
    /// Create a disabled deadline with the given period.
    pub const fn new(period_ms: u32) -> Self {
        Self {
            period_ms,
            start_ms: 0,
            enabled: false,
        }
    }

    /// Arm the deadline starting at `now_ms`.
    pub fn init(&mut self, now_ms: u32) {
        self.start_ms = now_ms;
        self.enabled = true;
    }

    /// Restart the measurement window at `now_ms`.
    pub fn reset(&mut self, now_ms: u32) {
        self.start_ms = now_ms;
    }

    /// Whether the period has elapsed. Always false while disabled.
    pub fn expired(&self, now_ms: u32) -> bool {
        self.enabled && now_ms.wrapping_sub(self.start_ms) >= self.period_ms
    }

    /// Stop expiry checks until re-enabled.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Re-arm the deadline starting at `now_ms`.
    pub fn enable(&mut self, now_ms: u32) {
        self.init(now_ms);
    }
}
