// Event detection types
// Drum classes, timed drum events, and the per-class event map

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// General MIDI percussion channel (channel 10, zero-indexed)
pub const GM_DRUM_CHANNEL: u8 = 9;

/// Drum pitch class produced by detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrumClass {
    Kick,
    Snare,
    HiHatClosed,
    HiHatOpen,
    Crash,
    Ride,
    TomLow,
    TomMid,
    TomHigh,
}

impl DrumClass {
    /// All classes in key order
    pub const ALL: [DrumClass; 9] = [
        DrumClass::Kick,
        DrumClass::Snare,
        DrumClass::HiHatClosed,
        DrumClass::HiHatOpen,
        DrumClass::Crash,
        DrumClass::Ride,
        DrumClass::TomLow,
        DrumClass::TomMid,
        DrumClass::TomHigh,
    ];

    /// General MIDI drum note number
    pub fn gm_note(&self) -> u8 {
        match self {
            DrumClass::Kick => 36,
            DrumClass::Snare => 38,
            DrumClass::HiHatClosed => 42,
            DrumClass::HiHatOpen => 46,
            DrumClass::Crash => 49,
            DrumClass::Ride => 51,
            DrumClass::TomLow => 45,
            DrumClass::TomMid => 47,
            DrumClass::TomHigh => 50,
        }
    }

    /// Inverse of [`DrumClass::gm_note`]
    pub fn from_gm_note(note: u8) -> Option<Self> {
        DrumClass::ALL.into_iter().find(|class| class.gm_note() == note)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DrumClass::Kick => "kick",
            DrumClass::Snare => "snare",
            DrumClass::HiHatClosed => "hi_hat_closed",
            DrumClass::HiHatOpen => "hi_hat_open",
            DrumClass::Crash => "crash",
            DrumClass::Ride => "ride",
            DrumClass::TomLow => "tom_low",
            DrumClass::TomMid => "tom_mid",
            DrumClass::TomHigh => "tom_high",
        }
    }
}

impl fmt::Display for DrumClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single detected drum hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrumEvent {
    pub class: DrumClass,

    /// Onset time in seconds from the start of the recording
    pub time_secs: f64,

    /// MIDI velocity, 1..=127
    pub velocity: u8,
}

/// Time and velocity of one hit within a class lane
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub time_secs: f64,
    pub velocity: u8,
}

/// Detected hits grouped by drum class.
///
/// Every class has a lane, possibly empty, so both detectors return the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMap {
    lanes: BTreeMap<DrumClass, Vec<Hit>>,
}

impl Default for EventMap {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMap {
    pub fn new() -> Self {
        EventMap {
            lanes: DrumClass::ALL.into_iter().map(|c| (c, Vec::new())).collect(),
        }
    }

    pub fn push(&mut self, class: DrumClass, time_secs: f64, velocity: u8) {
        self.lanes
            .entry(class)
            .or_default()
            .push(Hit {
                time_secs,
                velocity,
            });
    }

    /// Hits of one class in insertion order
    pub fn hits(&self, class: DrumClass) -> &[Hit] {
        self.lanes.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn lanes(&self) -> impl Iterator<Item = (DrumClass, &[Hit])> {
        self.lanes.iter().map(|(class, hits)| (*class, hits.as_slice()))
    }

    pub fn total(&self) -> usize {
        self.lanes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Count of hits per class, for logging and reports
    pub fn counts(&self) -> BTreeMap<DrumClass, usize> {
        self.lanes.iter().map(|(c, hits)| (*c, hits.len())).collect()
    }

    /// All hits as one sequence ordered by time, ties broken by class
    pub fn to_sorted_events(&self) -> Vec<DrumEvent> {
        let mut events: Vec<DrumEvent> = self
            .lanes
            .iter()
            .flat_map(|(class, hits)| {
                hits.iter().map(move |hit| DrumEvent {
                    class: *class,
                    time_secs: hit.time_secs,
                    velocity: hit.velocity,
                })
            })
            .collect();
        events.sort_by(|a, b| {
            a.time_secs
                .total_cmp(&b.time_secs)
                .then(a.class.cmp(&b.class))
        });
        events
    }
}

impl FromIterator<DrumEvent> for EventMap {
    fn from_iter<I: IntoIterator<Item = DrumEvent>>(iter: I) -> Self {
        let mut map = EventMap::new();
        for event in iter {
            map.push(event.class, event.time_secs, event.velocity);
        }
        map
    }
}
