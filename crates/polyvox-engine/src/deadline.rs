//! Per-voice end deadlines against the backend clock.
//!
//! A deadline fires when the clock passes it; it is the polled replacement
//! for a cancellable one-shot timer. At most one deadline exists per voice,
//! re-arming overwrites.

use std::collections::HashMap;

use polyvox_core::VoiceId;

#[derive(Debug, Default)]
pub struct DeadlineSet {
    entries: HashMap<VoiceId, f64>,
}

impl DeadlineSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, voice: VoiceId, at: f64) {
        self.entries.insert(voice, at);
    }

    pub fn cancel(&mut self, voice: VoiceId) {
        self.entries.remove(&voice);
    }

    pub fn is_armed(&self, voice: VoiceId) -> bool {
        self.entries.contains_key(&voice)
    }

    pub fn deadline(&self, voice: VoiceId) -> Option<f64> {
        self.entries.get(&voice).copied()
    }

    /// Remove and return every voice whose deadline has passed, earliest
    /// first so end handling stays deterministic.
    pub fn take_due(&mut self, now: f64) -> Vec<VoiceId> {
        let mut due: Vec<(VoiceId, f64)> = self
            .entries
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(&voice, &at)| (voice, at))
            .collect();
        due.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        for (voice, _) in &due {
            self.entries.remove(voice);
        }
        due.into_iter().map(|(voice, _)| voice).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
