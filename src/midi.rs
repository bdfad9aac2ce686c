// MIDI encoding - Convert drum event maps to Standard MIDI Files using midly
// One tempo/meta track plus one percussion track on the GM drum channel

use midly::num::u28;
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::types::{EventMap, GM_DRUM_CHANNEL};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid encoder options: {0}")]
    InvalidOptions(String),

    #[error("Failed to write MIDI: {0}")]
    Write(String),
}

/// MIDI encoding options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeOptions {
    /// Pulses per quarter note (PPQ)
    pub ticks_per_quarter: u16,

    /// Tempo written to the meta track; sets the tick-to-seconds scale
    pub tempo_bpm: f64,

    /// Length of every note in seconds
    pub note_duration_secs: f64,

    /// Name of the percussion track
    pub track_name: String,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions {
            ticks_per_quarter: 480,
            tempo_bpm: 120.0,
            note_duration_secs: 0.1,
            track_name: "Drums".to_string(),
        }
    }
}

impl EncodeOptions {
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.ticks_per_quarter == 0 || self.ticks_per_quarter > 0x7FFF {
            return Err(EncodeError::InvalidOptions(format!(
                "ticks_per_quarter {} must be in 1..=32767",
                self.ticks_per_quarter
            )));
        }
        // 24-bit tempo field: at most 16.7 s per quarter note
        if !(self.tempo_bpm.is_finite() && self.tempo_bpm >= 4.0) {
            return Err(EncodeError::InvalidOptions(format!(
                "tempo {} BPM is out of range",
                self.tempo_bpm
            )));
        }
        if !(self.note_duration_secs.is_finite() && self.note_duration_secs > 0.0) {
            return Err(EncodeError::InvalidOptions(format!(
                "note duration {} s must be positive",
                self.note_duration_secs
            )));
        }
        Ok(())
    }

    /// MIDI ticks per second of audio
    pub fn ticks_per_second(&self) -> f64 {
        f64::from(self.ticks_per_quarter) * self.tempo_bpm / 60.0
    }
}

/// Serializes drum event maps into Standard MIDI File bytes
#[derive(Debug, Clone, Default)]
pub struct EventEncoder {
    options: EncodeOptions,
}

impl EventEncoder {
    pub fn new(options: EncodeOptions) -> Result<Self, EncodeError> {
        options.validate()?;
        Ok(EventEncoder { options })
    }

    pub fn options(&self) -> &EncodeOptions {
        &self.options
    }

    /// Encode `events` as a format-1 SMF.
    ///
    /// Track 0 carries the name, tempo and time signature; track 1 carries one
    /// note-on/note-off pair per event on the GM drum channel.
    pub fn encode(&self, events: &EventMap) -> Result<Vec<u8>, EncodeError> {
        let header = Header {
            format: Format::Parallel,
            timing: Timing::Metrical(self.options.ticks_per_quarter.into()),
        };

        let mut meta_track = Track::new();
        add_track_name(&mut meta_track, 0, b"drumscribe");
        add_tempo(&mut meta_track, 0, self.options.tempo_bpm);
        add_time_signature(&mut meta_track, 0);
        add_end_of_track(&mut meta_track, 0);

        let drum_track = self.drum_track(events)?;

        let smf = Smf {
            header,
            tracks: vec![meta_track, drum_track],
        };

        let mut bytes = Vec::new();
        smf.write(&mut bytes)
            .map_err(|e| EncodeError::Write(e.to_string()))?;

        log::debug!(
            "Encoded {} events into {} bytes of MIDI",
            events.total(),
            bytes.len()
        );

        Ok(bytes)
    }

    fn drum_track(&self, events: &EventMap) -> Result<Track<'_>, EncodeError> {
        let ticks_per_second = self.options.ticks_per_second();
        let duration_ticks = (self.options.note_duration_secs * ticks_per_second).round().max(1.0);

        // (tick, is_note_on, kind); note-offs sort ahead of note-ons at the same tick
        let mut timed: Vec<(u32, bool, TrackEventKind<'_>)> = Vec::new();

        for event in events.to_sorted_events() {
            if !(event.time_secs.is_finite() && event.time_secs >= 0.0) {
                return Err(EncodeError::InvalidEvent(format!(
                    "{} at {} s has an invalid time",
                    event.class, event.time_secs
                )));
            }
            if !(1..=127).contains(&event.velocity) {
                return Err(EncodeError::InvalidEvent(format!(
                    "{} at {:.3} s has velocity {} outside 1..=127",
                    event.class, event.time_secs, event.velocity
                )));
            }

            let tick_on = (event.time_secs * ticks_per_second).round();
            let tick_off = tick_on + duration_ticks;
            if tick_off > f64::from(u32::MAX) {
                return Err(EncodeError::InvalidEvent(format!(
                    "{} at {} s is beyond the encodable range",
                    event.class, event.time_secs
                )));
            }

            let key = event.class.gm_note();
            timed.push((
                tick_on as u32,
                true,
                TrackEventKind::Midi {
                    channel: GM_DRUM_CHANNEL.into(),
                    message: MidiMessage::NoteOn {
                        key: key.into(),
                        vel: event.velocity.into(),
                    },
                },
            ));
            timed.push((
                tick_off as u32,
                false,
                TrackEventKind::Midi {
                    channel: GM_DRUM_CHANNEL.into(),
                    message: MidiMessage::NoteOff {
                        key: key.into(),
                        vel: 0.into(),
                    },
                },
            ));
        }

        timed.sort_by_key(|(tick, is_on, _)| (*tick, *is_on));

        let mut track = Track::new();
        add_track_name(&mut track, 0, self.options.track_name.as_bytes());

        // Absolute ticks to deltas; a delta must fit a 28-bit variable-length quantity
        let mut last_tick = 0;
        for (tick, _, kind) in timed {
            let delta = tick - last_tick;
            if delta > u28::max_value().as_int() {
                return Err(EncodeError::InvalidEvent(format!(
                    "gap of {} ticks before tick {} exceeds the MIDI delta range",
                    delta, tick
                )));
            }
            track.push(TrackEvent {
                delta: delta.into(),
                kind,
            });
            last_tick = tick;
        }

        add_end_of_track(&mut track, 0);
        Ok(track)
    }
}

/// Add track name to track
fn add_track_name<'a>(track: &mut Track<'a>, delta: u32, name: &'a [u8]) {
    track.push(TrackEvent {
        delta: delta.into(),
        kind: TrackEventKind::Meta(MetaMessage::TrackName(name)),
    });
}

/// Add tempo meta message
fn add_tempo(track: &mut Track<'_>, delta: u32, bpm: f64) {
    let us_per_quarter = (60_000_000.0 / bpm).round() as u32;
    track.push(TrackEvent {
        delta: delta.into(),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(us_per_quarter.into())),
    });
}

/// Add a 4/4 time signature
fn add_time_signature(track: &mut Track<'_>, delta: u32) {
    track.push(TrackEvent {
        delta: delta.into(),
        kind: TrackEventKind::Meta(MetaMessage::TimeSignature(4, 2, 24, 8)),
    });
}

/// Add end of track message
fn add_end_of_track(track: &mut Track<'_>, delta: u32) {
    track.push(TrackEvent {
        delta: delta.into(),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{DrumClass, DrumEvent};

    /// Read note-ons back from the drum track as (class, seconds, velocity)
    fn read_back(bytes: &[u8]) -> Vec<(DrumClass, f64, u8)> {
        let smf = Smf::parse(bytes).unwrap();
        let ppq = match smf.header.timing {
            Timing::Metrical(ppq) => f64::from(u16::from(ppq)),
            _ => panic!("expected metrical timing"),
        };
        let ticks_per_second = ppq * 2.0; // 120 BPM

        let mut tick = 0u32;
        let mut notes = Vec::new();
        for event in &smf.tracks[1] {
            tick += u32::from(event.delta);
            if let TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOn { key, vel },
            } = event.kind
            {
                assert_eq!(u8::from(channel), GM_DRUM_CHANNEL);
                let class = DrumClass::from_gm_note(u8::from(key)).unwrap();
                notes.push((class, f64::from(tick) / ticks_per_second, u8::from(vel)));
            }
        }
        notes
    }

    fn sample_map() -> EventMap {
        vec![
            DrumEvent {
                class: DrumClass::Kick,
                time_secs: 0.0,
                velocity: 90,
            },
            DrumEvent {
                class: DrumClass::HiHatClosed,
                time_secs: 0.25,
                velocity: 64,
            },
            DrumEvent {
                class: DrumClass::Snare,
                time_secs: 0.5,
                velocity: 127,
            },
            DrumEvent {
                class: DrumClass::Kick,
                time_secs: 0.5,
                velocity: 1,
            },
            DrumEvent {
                class: DrumClass::Crash,
                time_secs: 1.2345,
                velocity: 70,
            },
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_ticks_per_second() {
        // 480 PPQ at 120 BPM
        assert!((EncodeOptions::default().ticks_per_second() - 960.0).abs() < 1e-12);
    }

    #[test]
    fn test_header_and_layout() {
        let bytes = EventEncoder::default().encode(&sample_map()).unwrap();
        assert_eq!(&bytes[0..4], b"MThd");

        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.header.format, Format::Parallel);
        assert_eq!(smf.tracks.len(), 2);

        let tempo = smf.tracks[0].iter().find_map(|e| match e.kind {
            TrackEventKind::Meta(MetaMessage::Tempo(t)) => Some(u32::from(t)),
            _ => None,
        });
        assert_eq!(tempo, Some(500_000));
    }

    #[test]
    fn test_round_trip() {
        let map = sample_map();
        let bytes = EventEncoder::default().encode(&map).unwrap();
        let notes = read_back(&bytes);

        let expected = map.to_sorted_events();
        assert_eq!(notes.len(), expected.len());
        for event in expected {
            let found = notes.iter().any(|(class, time, vel)| {
                *class == event.class
                    && (time - event.time_secs).abs() <= 1.0 / 960.0
                    && *vel == event.velocity
            });
            assert!(found, "missing {:?}", event);
        }
    }

    #[test]
    fn test_note_off_before_note_on_at_same_tick() {
        // Second hit starts exactly when the first one ends
        let map: EventMap = vec![
            DrumEvent {
                class: DrumClass::Ride,
                time_secs: 0.0,
                velocity: 80,
            },
            DrumEvent {
                class: DrumClass::Ride,
                time_secs: 0.1,
                velocity: 80,
            },
        ]
        .into_iter()
        .collect();

        let bytes = EventEncoder::default().encode(&map).unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        let messages: Vec<&str> = smf.tracks[1]
            .iter()
            .filter_map(|e| match e.kind {
                TrackEventKind::Midi {
                    message: MidiMessage::NoteOn { .. },
                    ..
                } => Some("on"),
                TrackEventKind::Midi {
                    message: MidiMessage::NoteOff { .. },
                    ..
                } => Some("off"),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["on", "off", "on", "off"]);
    }

    #[test]
    fn test_empty_map_is_valid_file() {
        let bytes = EventEncoder::default().encode(&EventMap::new()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.tracks.len(), 2);
        assert!(read_back(&bytes).is_empty());
    }

    #[test]
    fn test_rejects_invalid_velocity() {
        let mut map = EventMap::new();
        map.push(DrumClass::Snare, 0.5, 0);
        assert!(matches!(
            EventEncoder::default().encode(&map),
            Err(EncodeError::InvalidEvent(_))
        ));

        let mut map = EventMap::new();
        map.push(DrumClass::Snare, 0.5, 128);
        assert!(EventEncoder::default().encode(&map).is_err());
    }

    #[test]
    fn test_rejects_invalid_time() {
        let mut map = EventMap::new();
        map.push(DrumClass::Kick, -0.1, 90);
        assert!(EventEncoder::default().encode(&map).is_err());

        let mut map = EventMap::new();
        map.push(DrumClass::Kick, f64::NAN, 90);
        assert!(EventEncoder::default().encode(&map).is_err());
    }

    #[test]
    fn test_rejects_gap_beyond_delta_range() {
        // 300000 s is 288e6 ticks: fits u32 but not a 28-bit delta
        let mut map = EventMap::new();
        map.push(DrumClass::Kick, 300_000.0, 90);
        assert!(matches!(
            EventEncoder::default().encode(&map),
            Err(EncodeError::InvalidEvent(_))
        ));

        // The same gap between two hits
        let mut map = EventMap::new();
        map.push(DrumClass::Kick, 0.0, 90);
        map.push(DrumClass::Snare, 280_000.0, 80);
        assert!(EventEncoder::default().encode(&map).is_err());

        // Just inside the range still encodes
        let mut map = EventMap::new();
        map.push(DrumClass::Kick, 279_000.0, 90);
        assert!(EventEncoder::default().encode(&map).is_ok());
    }

    #[test]
    fn test_rejects_invalid_options() {
        let options = EncodeOptions {
            ticks_per_quarter: 0,
            ..Default::default()
        };
        assert!(EventEncoder::new(options).is_err());

        let options = EncodeOptions {
            note_duration_secs: 0.0,
            ..Default::default()
        };
        assert!(EventEncoder::new(options).is_err());
    }
}
