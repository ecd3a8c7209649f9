//! Synthesizes the music heard in the original DOS release of Doom: GENMIDI
//! instrument bank + MUS score in, stereo 16-bit PCM out, by driving an
//! emulated Yamaha OPL2/OPL3 FM chip the same way Doom's DMX sound driver
//! did. See `SPEC_FULL.md` for the full component breakdown.

/// Parses and holds the 128 melodic + 47 percussion GENMIDI instrument
/// definitions.
pub mod instrument;
/// Parses the MUS score header and iterates its event stream.
pub mod score;
/// The two Doom frequency/volume lookup tables and the math that combines
/// them.
pub mod tables;
/// The 16-channel MIDI-like channel state.
pub mod channel;
/// The 18-voice pool: allocation, the deterministic steal policy, release.
pub mod voice;
/// The OPL register programmer: the only module that emits register writes.
pub mod opl;
/// The sample-accurate 140 Hz event clock.
pub mod scheduler;
/// The public facade tying every component together.
pub mod player;
/// The public error surface.
pub mod error;

pub use error::{Error, Result};
pub use opl::OplChip;
pub use player::{DoomVersion, OplType, Player, PlayerConfig};

/// The sample type this crate exchanges with its [`OplChip`] collaborator
/// and its callers: one channel of 16-bit signed PCM.
pub type SampleType = i16;
