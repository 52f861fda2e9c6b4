// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

/// Boolean rate limiter with normal (non-atomic, thread unsafe) semantics.
///
/// Used to gate periodic work -- e.g. the 10 second session table sweep -- off a
/// monotonic millisecond clock supplied by the caller rather than a wall clock read
/// internally, so the whole core stays deterministic and testable.
#[repr(transparent)]
pub struct IntervalGate<const FREQ_MS: i64>(i64);

impl<const FREQ_MS: i64> Default for IntervalGate<FREQ_MS> {
    #[inline(always)]
    fn default() -> Self {
        Self(0)
    }
}

impl<const FREQ_MS: i64> IntervalGate<FREQ_MS> {
    #[inline(always)]
    pub fn new(initial_ts: i64) -> Self {
        Self(initial_ts)
    }

    /// Returns true (and latches `time`) if at least FREQ_MS has elapsed since the last gate.
    #[inline(always)]
    pub fn gate(&mut self, time: i64) -> bool {
        if (time - self.0) >= FREQ_MS {
            self.0 = time;
            true
        } else {
            false
        }
    }
}

unsafe impl<const FREQ_MS: i64> Send for IntervalGate<FREQ_MS> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gates_on_interval() {
        let mut g: IntervalGate<1000> = IntervalGate::new(0);
        assert!(!g.gate(500));
        assert!(g.gate(1000));
        assert!(!g.gate(1500));
        assert!(g.gate(2000));
    }
}
