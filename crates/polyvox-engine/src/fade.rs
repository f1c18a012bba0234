//! Volume fade bookkeeping.
//!
//! Buffered voices get a native linear ramp scheduled on their gain node;
//! this state exists so the engine can step streaming volumes manually,
//! mirror group volume during group-wide fades, and know where to land when
//! a fade is interrupted.

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FadeState {
    pub from: f64,
    pub to: f64,
    pub start_at: f64,
    pub end_at: f64,
    /// Fade was issued against the whole group, so stepped values also
    /// update the group volume.
    pub group_wide: bool,
}

impl FadeState {
    /// Linearly interpolated volume at `now`, clamped to the fade span.
    pub fn value_at(&self, now: f64) -> f64 {
        if self.end_at <= self.start_at || now >= self.end_at {
            return self.to;
        }
        if now <= self.start_at {
            return self.from;
        }
        let progress = (now - self.start_at) / (self.end_at - self.start_at);
        self.from + (self.to - self.from) * progress
    }

    pub fn finished(&self, now: f64) -> bool {
        now >= self.end_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fade() -> FadeState {
        FadeState {
            from: 1.0,
            to: 0.0,
            start_at: 2.0,
            end_at: 4.0,
            group_wide: false,
        }
    }

    #[test]
    fn interpolates_linearly_between_endpoints() {
        let f = fade();
        assert!((f.value_at(2.0) - 1.0).abs() < f64::EPSILON);
        assert!((f.value_at(3.0) - 0.5).abs() < 1e-12);
        assert!((f.value_at(4.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn clamps_outside_the_span() {
        let f = fade();
        assert!((f.value_at(0.0) - 1.0).abs() < f64::EPSILON);
        assert!((f.value_at(100.0)).abs() < f64::EPSILON);
        assert!(f.finished(4.0));
        assert!(!f.finished(3.999));
    }

    #[test]
    fn zero_length_fade_lands_on_target() {
        let f = FadeState {
            from: 0.2,
            to: 0.9,
            start_at: 1.0,
            end_at: 1.0,
            group_wide: true,
        };
        assert!((f.value_at(1.0) - 0.9).abs() < f64::EPSILON);
    }
}
