//! Listener registry for group notifications.

use polyvox_core::{EventKind, Notification, VoiceId};

pub type EventCallback = Box<dyn FnMut(&Notification) + Send>;

struct Listener {
    kind: EventKind,
    voice: Option<VoiceId>,
    once: bool,
    callback: EventCallback,
}

/// Callbacks registered against one group. A listener with a voice filter
/// only sees notifications carrying that voice id.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, kind: EventKind, voice: Option<VoiceId>, once: bool, callback: EventCallback) {
        self.listeners.push(Listener {
            kind,
            voice,
            once,
            callback,
        });
    }

    /// Remove every listener for `kind`.
    pub fn off(&mut self, kind: EventKind) {
        self.listeners.retain(|l| l.kind != kind);
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn notify(&mut self, notification: &Notification) {
        let mut i = 0;
        while i < self.listeners.len() {
            let listener = &mut self.listeners[i];
            let matches = listener.kind == notification.kind
                && (listener.voice.is_none() || listener.voice == notification.voice);
            if matches {
                (listener.callback)(notification);
                if listener.once {
                    self.listeners.remove(i);
                    continue;
                }
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicU32>, EventCallback) {
        let hits = Arc::new(AtomicU32::new(0));
        let probe = hits.clone();
        (
            hits,
            Box::new(move |_| {
                probe.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn once_listeners_fire_a_single_time() {
        let mut set = ListenerSet::new();
        let (hits, callback) = counter();
        set.on(EventKind::End, None, true, callback);
        let end = Notification::new(EventKind::End, Some(VoiceId(1000)));
        set.notify(&end);
        set.notify(&end);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn voice_filter_is_respected() {
        let mut set = ListenerSet::new();
        let (hits, callback) = counter();
        set.on(EventKind::Play, Some(VoiceId(1001)), false, callback);
        set.notify(&Notification::new(EventKind::Play, Some(VoiceId(1000))));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        set.notify(&Notification::new(EventKind::Play, Some(VoiceId(1001))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_by_kind_only() {
        let mut set = ListenerSet::new();
        let (play_hits, play_cb) = counter();
        let (stop_hits, stop_cb) = counter();
        set.on(EventKind::Play, None, false, play_cb);
        set.on(EventKind::Stop, None, false, stop_cb);
        set.off(EventKind::Play);
        set.notify(&Notification::new(EventKind::Play, None));
        set.notify(&Notification::new(EventKind::Stop, None));
        assert_eq!(play_hits.load(Ordering::SeqCst), 0);
        assert_eq!(stop_hits.load(Ordering::SeqCst), 1);
    }
}
