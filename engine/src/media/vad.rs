//! Voice Activity Detection
//!
//! Threshold decision over the analyser's short-term average magnitude
//! (0-255 scale), evaluated once per tick. Hysteresis is implicit in the
//! tick cadence: state changes at most once per 100 ms.

use std::time::Duration;

/// Cadence of VAD decisions and speaking broadcasts.
pub const VAD_TICK: Duration = Duration::from_millis(100);

/// Default speaking threshold on the 0-255 magnitude scale.
pub const DEFAULT_VAD_THRESHOLD: u8 = 20;

/// Per-source speaking detector.
#[derive(Debug)]
pub struct VadDetector {
    threshold: u8,
    speaking: bool,
}

impl VadDetector {
    /// Detector with the given threshold, initially not speaking.
    #[must_use]
    pub const fn new(threshold: u8) -> Self {
        Self {
            threshold,
            speaking: false,
        }
    }

    /// Evaluate one tick. Returns `Some(new_state)` on a transition.
    ///
    /// A muted source is never speaking, regardless of signal level.
    pub fn update(&mut self, level: u8, muted: bool) -> Option<bool> {
        let speaking = !muted && level >= self.threshold;
        if speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }

    /// Current speaking state.
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }
}

impl Default for VadDetector {
    fn default() -> Self {
        Self::new(DEFAULT_VAD_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_stays_quiet() {
        let mut vad = VadDetector::default();
        assert_eq!(vad.update(0, false), None);
        assert_eq!(vad.update(19, false), None);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut vad = VadDetector::default();
        assert_eq!(vad.update(DEFAULT_VAD_THRESHOLD, false), Some(true));
        assert!(vad.is_speaking());
    }

    #[test]
    fn transitions_fire_once() {
        let mut vad = VadDetector::default();
        assert_eq!(vad.update(200, false), Some(true));
        assert_eq!(vad.update(220, false), None);
        assert_eq!(vad.update(5, false), Some(false));
        assert_eq!(vad.update(3, false), None);
    }

    #[test]
    fn muted_source_is_never_speaking() {
        let mut vad = VadDetector::default();
        // Loud signal while muted never reports speaking.
        assert_eq!(vad.update(255, true), None);
        assert!(!vad.is_speaking());

        // Speaking, then muted mid-tone: drops on the next tick.
        assert_eq!(vad.update(255, false), Some(true));
        assert_eq!(vad.update(255, true), Some(false));
        assert_eq!(vad.update(255, true), None);
        assert!(!vad.is_speaking());
    }
}
