//! Streaming event scheduler (spec component C10).
//!
//! Consumes a compiled track's events and drains a lookahead window into a
//! [`crate::backend::Backend`] on every tick, while supporting live splices
//! of a track's tail at a quantized boundary without disturbing whatever is
//! already inside the lookahead window.
//!
//! The compiler pipeline resolves an event's `startSeconds` against the
//! *compile-time* tempo map, but the scheduler's own transport can run at a
//! different, live-adjustable bpm (`set_tempo`). So every event the
//! scheduler tracks is paired with the beat position it was compiled at
//! ([`ScheduledEvent`]), and the scheduler converts beat to this transport's
//! audio time itself rather than trusting the event's baked-in seconds.

use crate::backend::{Backend, BackendResult};
use crate::events::Event;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// An event paired with the beat position it fires at, the scheduler's
/// native currency (spec §4.8: heap keyed by `(beat, inputOrder)`).
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledEvent {
    pub beat: f64,
    pub event: Event,
}

/// `off`: splice takes effect immediately. `beat`/`bar`: rounds up to the
/// next integer beat / bar boundary, pushed out one more boundary if that
/// would land inside the lookahead window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuantizeBoundary {
    Off,
    Beat,
    Bar,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SchedulerConfig {
    pub schedule_interval_ms: u64,
    pub lookahead_ms: u64,
    pub quantize: QuantizeBoundary,
    pub beats_per_measure: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_interval_ms: 25,
            lookahead_ms: 100,
            quantize: QuantizeBoundary::Bar,
            beats_per_measure: 4.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct HeapKey {
    beat: f64,
    input_order: u64,
}

impl Eq for HeapKey {}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest (beat, order) pops first.
        other
            .beat
            .partial_cmp(&self.beat)
            .unwrap_or(Ordering::Equal)
            .then(other.input_order.cmp(&self.input_order))
    }
}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug)]
struct HeapEntry {
    key: HeapKey,
    track_id: Option<String>,
    scheduled: ScheduledEvent,
}
impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// A deferred splice, applied once `current_beat` reaches `target_beat`.
#[derive(Clone, Debug)]
pub struct PendingUpdate {
    pub target_beat: f64,
    pub track_id: Option<String>,
    pub events: Vec<ScheduledEvent>,
}

struct ScheduledCallback {
    beat: f64,
    fired: bool,
    handler: Box<dyn FnMut() + Send>,
}

/// What the scheduler reports on each integer beat/bar crossing, or on an
/// error from its own tick or a user callback.
#[derive(Debug)]
pub enum SchedulerEvent {
    Beat(i64),
    Bar(i64),
    Error(String),
}

impl Clone for SchedulerEvent {
    fn clone(&self) -> Self {
        match self {
            SchedulerEvent::Beat(i) => SchedulerEvent::Beat(*i),
            SchedulerEvent::Bar(i) => SchedulerEvent::Bar(*i),
            SchedulerEvent::Error(e) => SchedulerEvent::Error(e.clone()),
        }
    }
}

/// Drives one [`Backend`] from a set of per-track event lists.
///
/// Single-threaded cooperative model (spec §5): the caller drives `tick`
/// from a host timer; nothing here spawns its own thread.
pub struct Scheduler<B: Backend> {
    backend: B,
    config: SchedulerConfig,
    heap: BinaryHeap<HeapEntry>,
    tracks: std::collections::HashMap<String, Vec<ScheduledEvent>>,
    untracked: Vec<ScheduledEvent>,
    pending_updates: Vec<PendingUpdate>,
    scheduled_callbacks: Vec<ScheduledCallback>,
    playback_start_time: f64,
    playback_start_beat: f64,
    bpm: f64,
    running: bool,
    last_notified_beat: i64,
    last_notified_bar: i64,
    subscribers: Vec<Box<dyn FnMut(SchedulerEvent) + Send>>,
}

impl<B: Backend> Scheduler<B> {
    pub fn new(backend: B, bpm: f64, config: SchedulerConfig) -> Self {
        Self {
            backend,
            config,
            heap: BinaryHeap::new(),
            tracks: std::collections::HashMap::new(),
            untracked: Vec::new(),
            pending_updates: Vec::new(),
            scheduled_callbacks: Vec::new(),
            playback_start_time: 0.0,
            playback_start_beat: 0.0,
            bpm,
            running: false,
            last_notified_beat: -1,
            last_notified_bar: -1,
            subscribers: Vec::new(),
        }
    }

    pub fn on_event(&mut self, handler: impl FnMut(SchedulerEvent) + Send + 'static) {
        self.subscribers.push(Box::new(handler));
    }

    fn notify(&mut self, event: SchedulerEvent) {
        for sub in &mut self.subscribers {
            sub(event.clone());
        }
    }

    fn run_ticking_guarded(&mut self, f: impl FnOnce(&mut Self) -> BackendResult<()>) {
        if let Err(e) = f(self) {
            self.notify(SchedulerEvent::Error(e.to_string()));
        }
    }

    /// Load a sorted track's events, replacing whatever was there.
    pub fn consume(&mut self, events: Vec<ScheduledEvent>, track_id: Option<&str>) {
        self.push_events(&events, track_id);
        match track_id {
            Some(id) => {
                self.tracks.insert(id.to_string(), events);
            }
            None => self.untracked = events,
        }
    }

    fn push_events(&mut self, events: &[ScheduledEvent], track_id: Option<&str>) {
        for se in events {
            self.heap.push(HeapEntry {
                key: HeapKey { beat: se.beat, input_order: se.event.input_order },
                track_id: track_id.map(str::to_string),
                scheduled: se.clone(),
            });
        }
    }

    fn beats_per_second(&self) -> f64 {
        self.bpm / 60.0
    }

    /// `currentBeat` derived from the backend's clock (spec §4.8 time base).
    pub fn current_beat(&self) -> f64 {
        if !self.running {
            return self.playback_start_beat;
        }
        let audio_time = self.backend.current_time();
        self.playback_start_beat + (audio_time - self.playback_start_time) * self.beats_per_second()
    }

    pub fn current_bar(&self) -> f64 {
        (self.current_beat() / self.config.beats_per_measure).floor()
    }

    fn lookahead_beats(&self) -> f64 {
        (self.config.lookahead_ms as f64 / 1000.0) * self.beats_per_second()
    }

    /// Change tempo without disturbing whatever beat we're currently at:
    /// record the pre-change beat, re-anchor the time base, then adopt the
    /// new bpm so later conversions use it.
    pub fn set_tempo(&mut self, bpm: f64) -> BackendResult<()> {
        let beat = self.current_beat();
        let audio_time = self.backend.current_time();
        self.playback_start_beat = beat;
        self.playback_start_time = audio_time;
        self.bpm = bpm;
        self.backend.set_tempo(bpm)
    }

    pub fn set_beats_per_measure(&mut self, beats: f64) {
        self.config.beats_per_measure = beats;
    }

    pub fn start(&mut self, start_beat: f64) -> BackendResult<()> {
        self.backend.init()?;
        self.playback_start_time = self.backend.current_time();
        self.playback_start_beat = start_beat;
        self.running = true;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.playback_start_beat = self.current_beat();
        self.running = false;
    }

    pub fn resume(&mut self) {
        self.playback_start_time = self.backend.current_time();
        self.running = true;
    }

    pub fn stop(&mut self) -> BackendResult<()> {
        self.backend.cancel_all()?;
        self.heap.clear();
        self.running = false;
        Ok(())
    }

    pub fn reset(&mut self) -> BackendResult<()> {
        self.stop()?;
        self.tracks.clear();
        self.untracked.clear();
        self.pending_updates.clear();
        self.scheduled_callbacks.clear();
        self.playback_start_beat = 0.0;
        self.playback_start_time = self.backend.current_time();
        Ok(())
    }

    /// Next beat a deferred update would take effect at, per the configured
    /// quantize mode; `None` if nothing is pending.
    pub fn get_next_update_beat(&self) -> Option<f64> {
        self.pending_updates
            .iter()
            .map(|u| u.target_beat)
            .fold(None, |acc, b| Some(acc.map_or(b, |a: f64| a.min(b))))
    }

    fn quantize_target(&self, requested: f64, current_beat: f64) -> f64 {
        let raw = match self.config.quantize {
            QuantizeBoundary::Off => requested.max(current_beat),
            QuantizeBoundary::Beat => current_beat.ceil().max(requested),
            QuantizeBoundary::Bar => {
                let bpm_ = self.config.beats_per_measure;
                (current_beat / bpm_).ceil() * bpm_
            }
        };
        let lookahead = self.lookahead_beats();
        if self.config.quantize != QuantizeBoundary::Off && raw >= current_beat && raw < current_beat + lookahead {
            match self.config.quantize {
                QuantizeBoundary::Beat => raw + 1.0,
                QuantizeBoundary::Bar => raw + self.config.beats_per_measure,
                QuantizeBoundary::Off => raw,
            }
        } else {
            raw
        }
    }

    /// Defer a splice until the next quantize boundary (or immediately,
    /// under `QuantizeBoundary::Off`).
    pub fn queue_update(&mut self, events: Vec<ScheduledEvent>, track_id: Option<&str>) {
        let current_beat = self.current_beat();
        let target_beat = self.quantize_target(current_beat, current_beat);
        self.pending_updates.push(PendingUpdate {
            target_beat,
            track_id: track_id.map(str::to_string),
            events,
        });
    }

    /// Replace `track_id`'s tail from `start_beat` onward immediately,
    /// leaving anything already inside the lookahead window untouched.
    pub fn splice(&mut self, events: Vec<ScheduledEvent>, start_beat: f64, track_id: Option<&str>) -> BackendResult<()> {
        let current_beat = self.current_beat();
        let effective_beat = start_beat.max(current_beat + self.lookahead_beats());

        self.backend.cancel_after(effective_beat, track_id)?;

        let kept: Vec<HeapEntry> = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .filter(|e| !(e.scheduled.beat >= effective_beat && e.track_id.as_deref() == track_id))
            .collect();
        self.heap = kept.into_iter().collect();

        let filtered: Vec<ScheduledEvent> = events.into_iter().filter(|e| e.beat >= effective_beat).collect();
        self.push_events(&filtered, track_id);

        match track_id {
            Some(id) => {
                let track = self.tracks.entry(id.to_string()).or_default();
                track.retain(|e| e.beat < effective_beat);
                track.extend(filtered);
            }
            None => {
                self.untracked.retain(|e| e.beat < effective_beat);
                self.untracked.extend(filtered);
            }
        }
        Ok(())
    }

    /// Remove and un-schedule everything at or after `beat` for `track_id`
    /// (or every track, if `None`). Idempotent.
    pub fn cancel_after(&mut self, beat: f64, track_id: Option<&str>) -> BackendResult<()> {
        let floor = self.current_beat() + self.lookahead_beats();
        let beat = beat.max(floor);
        self.backend.cancel_after(beat, track_id)?;
        let kept: Vec<HeapEntry> = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .filter(|e| !(e.scheduled.beat >= beat && (track_id.is_none() || e.track_id.as_deref() == track_id)))
            .collect();
        self.heap = kept.into_iter().collect();
        Ok(())
    }

    pub fn schedule_callback(&mut self, beat: f64, handler: impl FnMut() + Send + 'static) {
        self.scheduled_callbacks.push(ScheduledCallback { beat, fired: false, handler: Box::new(handler) });
    }

    /// Run one scheduling tick: apply due pending updates, fire due
    /// callbacks, then drain the heap within the lookahead window. Errors
    /// from the backend or a user callback are swallowed into an `error`
    /// notification (spec §5: the scheduler keeps running after a tick
    /// failure).
    pub fn tick(&mut self) {
        self.run_ticking_guarded(Self::tick_inner);
    }

    fn tick_inner(&mut self) -> BackendResult<()> {
        let current_beat = self.current_beat();

        let mut due = Vec::new();
        self.pending_updates.retain(|u| {
            if u.target_beat <= current_beat {
                due.push(u.clone());
                false
            } else {
                true
            }
        });
        for update in due {
            self.splice(update.events, update.target_beat, update.track_id.as_deref())?;
        }

        for cb in &mut self.scheduled_callbacks {
            if !cb.fired && cb.beat <= current_beat {
                cb.fired = true;
                (cb.handler)();
            }
        }
        self.scheduled_callbacks.retain(|cb| !cb.fired);

        let window_end = current_beat + self.lookahead_beats();
        while let Some(top) = self.heap.peek() {
            if top.scheduled.beat > window_end {
                break;
            }
            let entry = self.heap.pop().unwrap();
            let audio_time = self.beat_to_audio_time(entry.scheduled.beat);
            // "more than 50ms in the past" floor (spec §4.8 step 3).
            if audio_time < self.backend.current_time() - 0.05 {
                continue;
            }
            self.backend.schedule(&entry.scheduled.event, audio_time)?;
        }

        self.poll_beat_bar(current_beat);
        Ok(())
    }

    fn beat_to_audio_time(&self, beat: f64) -> f64 {
        self.playback_start_time + (beat - self.playback_start_beat) / self.beats_per_second()
    }

    fn poll_beat_bar(&mut self, current_beat: f64) {
        let beat_i = current_beat.floor() as i64;
        if beat_i > self.last_notified_beat {
            self.last_notified_beat = beat_i;
            self.notify(SchedulerEvent::Beat(beat_i));
        }
        let bar_i = (current_beat / self.config.beats_per_measure).floor() as i64;
        if bar_i > self.last_notified_bar {
            self.last_notified_bar = bar_i;
            self.notify(SchedulerEvent::Bar(bar_i));
        }
    }

    pub fn pending_update_count(&self) -> usize {
        self.pending_updates.len()
    }

    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::events::EventPayload;

    fn ev(input_order: u64) -> Event {
        Event {
            start_seconds: 0.0,
            duration_seconds: None,
            channel: None,
            input_order,
            payload: EventPayload::Control { controller: 1, value: 0.5 },
        }
    }

    fn se(beat: f64, input_order: u64) -> ScheduledEvent {
        ScheduledEvent { beat, event: ev(input_order) }
    }

    #[test]
    fn tick_drains_lookahead_window() {
        let backend = RecordingBackend::new();
        let mut sched = Scheduler::new(backend, 120.0, SchedulerConfig::default());
        sched.start(0.0).unwrap();
        sched.consume(vec![se(0.0, 0)], None);
        sched.tick();
        assert_eq!(sched.backend().scheduled.len(), 1);
    }

    #[test]
    fn tick_leaves_future_events_in_the_heap() {
        let backend = RecordingBackend::new();
        let mut sched = Scheduler::new(backend, 120.0, SchedulerConfig::default());
        sched.start(0.0).unwrap();
        sched.consume(vec![se(100.0, 0)], None);
        sched.tick();
        assert_eq!(sched.backend().scheduled.len(), 0);
        assert_eq!(sched.heap_len(), 1);
    }

    #[test]
    fn quantize_bar_rounds_up_to_next_measure() {
        let backend = RecordingBackend::new();
        let sched = Scheduler::new(backend, 120.0, SchedulerConfig::default());
        let target = sched.quantize_target(2.7, 2.7);
        assert_eq!(target, 4.0);
    }

    #[test]
    fn quantize_skips_a_boundary_when_inside_lookahead() {
        let backend = RecordingBackend::new();
        let sched = Scheduler::new(
            backend,
            120.0,
            SchedulerConfig { quantize: QuantizeBoundary::Bar, lookahead_ms: 100, beats_per_measure: 4.0, ..SchedulerConfig::default() },
        );
        // At 120bpm lookahead is 0.2 beats; currentBeat=3.95 puts the next
        // bar boundary (4.0) inside [3.95, 4.15), so it should skip to 8.0.
        let target = sched.quantize_target(3.95, 3.95);
        assert_eq!(target, 8.0);
    }

    #[test]
    fn cancel_after_is_idempotent() {
        let backend = RecordingBackend::new();
        let mut sched = Scheduler::new(backend, 120.0, SchedulerConfig::default());
        sched.start(0.0).unwrap();
        sched.cancel_after(4.0, None).unwrap();
        sched.cancel_after(4.0, None).unwrap();
        assert_eq!(sched.backend().cancellations.len(), 2);
    }

    #[test]
    fn stop_clears_heap_and_cancels_all() {
        let backend = RecordingBackend::new();
        let mut sched = Scheduler::new(backend, 120.0, SchedulerConfig::default());
        sched.start(0.0).unwrap();
        sched.consume(vec![se(10.0, 0)], None);
        sched.stop().unwrap();
        assert_eq!(sched.heap_len(), 0);
        assert_eq!(sched.backend().cancel_all_count, 1);
    }

    #[test]
    fn splice_preserves_events_already_inside_lookahead() {
        let backend = RecordingBackend::new();
        let mut sched = Scheduler::new(backend, 120.0, SchedulerConfig { quantize: QuantizeBoundary::Off, ..SchedulerConfig::default() });
        sched.start(0.0).unwrap();
        sched.consume(vec![se(0.05, 0), se(10.0, 1)], Some("lead"));
        // Lookahead at 120bpm/100ms = 0.2 beats, so effective splice point
        // is max(requested, 0 + 0.2) = 0.2; the 0.05-beat event survives.
        sched.splice(vec![se(20.0, 2)], 0.0, Some("lead")).unwrap();
        assert!(sched.tracks.get("lead").unwrap().iter().any(|e| e.beat == 0.05));
        assert!(!sched.tracks.get("lead").unwrap().iter().any(|e| e.beat == 10.0));
    }

    #[test]
    fn beat_and_bar_notifications_fire_on_crossing() {
        let backend = RecordingBackend::new();
        let mut sched = Scheduler::new(backend, 120.0, SchedulerConfig::default());
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        sched.on_event(move |e| {
            let label = match e {
                SchedulerEvent::Beat(i) => format!("beat{i}"),
                SchedulerEvent::Bar(i) => format!("bar{i}"),
                SchedulerEvent::Error(_) => "err".to_string(),
            };
            seen2.lock().unwrap().push(label);
        });
        sched.start(0.0).unwrap();
        sched.backend_mut().advance_to(2.0); // 2 seconds at 120bpm = 4 beats = 1 bar
        sched.tick();
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&"beat4".to_string()));
        assert!(seen.contains(&"bar1".to_string()));
    }
}
