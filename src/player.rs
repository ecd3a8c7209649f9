//! The public facade: wires C1-C7 together and implements §6's public
//! surface. `Player` borrows the score bytes for as long as they're loaded
//! (the lifetime parameter) but owns a fully-parsed, independent copy of
//! the instrument bank, channel state, and voice pool.

use crate::channel::{Channel, NUM_CHANNELS};
use crate::error::{Error, Result};
use crate::instrument::{Instrument, InstrumentBank};
use crate::opl::OplChip;
use crate::opl::OplProgrammer;
use crate::score::{Dispatched, Event, ScoreReader};
use crate::scheduler::Scheduler;
use crate::voice::VoicePool;

/// A placeholder duration returned by `position`-adjacent queries that
/// would otherwise require pre-scanning the whole score; see §9's Design
/// Notes and `DESIGN.md`'s Open Question resolution.
const STUB_LENGTH_MS: u64 = 180_000;

/// Caps how many zero-delay events a single output sample may process, so a
/// pathological or looping-but-empty score can't spin forever inside one
/// `generate_samples` call.
const MAX_EVENTS_PER_SAMPLE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OplType {
    OplII,
    Opl3,
}

impl Default for OplType {
    fn default() -> Self {
        OplType::Opl3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoomVersion {
    V1_1_666,
    V2_1_666,
    V1_9,
}

impl Default for DoomVersion {
    fn default() -> Self {
        DoomVersion::V1_9
    }
}

/// Construction-time configuration (§6/§13). `doom_version` is carried for
/// API fidelity; only 1.9's arithmetic is currently implemented (see
/// `DESIGN.md`).
#[derive(Debug, Clone, Copy)]
pub struct PlayerConfig {
    pub sample_rate: u32,
    pub opl_type: OplType,
    pub doom_version: DoomVersion,
    pub initial_volume: u8,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            opl_type: OplType::Opl3,
            doom_version: DoomVersion::V1_9,
            initial_volume: 100,
        }
    }
}

/// Internal percussion channel, after the MUS 15/9 remap (§4.2/§9).
const PERCUSSION_CHANNEL: u8 = 9;

/// Ties the instrument bank, score reader, channel state, voice pool, OPL
/// programmer, and scheduler together into the one object an embedder
/// drives. The underlying [`OplChip`] is never owned here — every method
/// that needs to touch the chip takes it as a parameter, matching the
/// single-threaded, caller-owns-the-chip concurrency model of §5.
pub struct Player<'score> {
    config: PlayerConfig,
    programmer: OplProgrammer,
    voices: VoicePool,
    channels: [Channel; NUM_CHANNELS],
    scheduler: Scheduler,

    instruments: Option<InstrumentBank>,
    score: Option<ScoreReader<'score>>,

    chip_initialized: bool,
    playing: bool,
    paused: bool,
    looping: bool,
    volume: u8,
}

impl<'score> Player<'score> {
    /// Constructs a player from `config`. Rejects `sample_rate == 0` with
    /// [`Error::InvalidParam`] (§7: constructors reject out-of-range
    /// arguments before touching state) — a zero sample rate would make
    /// every sample-to-tick conversion in [`Scheduler`] and
    /// [`Self::position_ms`] divide by zero.
    pub fn new(config: PlayerConfig) -> Result<Self> {
        if config.sample_rate == 0 {
            return Err(Error::InvalidParam("sample_rate must be non-zero".into()));
        }
        let volume = config.initial_volume.min(127);
        Ok(Self {
            config,
            programmer: OplProgrammer::new(),
            voices: VoicePool::new(),
            channels: [Channel::default(); NUM_CHANNELS],
            scheduler: Scheduler::new(config.sample_rate),
            instruments: None,
            score: None,
            chip_initialized: false,
            playing: false,
            paused: false,
            looping: false,
            volume,
        })
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Whether an instrument bank is currently loaded (§4.1).
    pub fn instruments_loaded(&self) -> bool {
        self.instruments.is_some()
    }

    pub fn score_loaded(&self) -> bool {
        self.score.is_some()
    }

    /// Parses and installs a GENMIDI bank. A failed parse leaves whatever
    /// bank was previously loaded (or none) untouched (§7).
    pub fn load_genmidi(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::InvalidParam("GENMIDI bytes are empty".into()));
        }
        let bank = InstrumentBank::load(bytes)?;
        self.instruments = Some(bank);
        Ok(())
    }

    /// Validates and installs a MUS score, borrowed for as long as it's
    /// loaded. A failed parse leaves the previous score (or none) intact.
    pub fn load_mus(&mut self, bytes: &'score [u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::InvalidParam("MUS bytes are empty".into()));
        }
        let reader = ScoreReader::new(bytes)?;
        self.score = Some(reader);
        Ok(())
    }

    /// Drops the loaded score and resets playback state; the instrument
    /// bank is left alone (mirrors `load_genmidi`'s independent lifetime).
    pub fn unload(&mut self) {
        self.score = None;
        self.playing = false;
        self.paused = false;
        self.voices = VoicePool::new();
        self.channels = [Channel::default(); NUM_CHANNELS];
    }

    /// Begins playback from the start of the loaded score. Requires a
    /// score to already be loaded; does not require an instrument bank
    /// (notes simply produce no sound if none is loaded, per the borrowed
    /// shared-resource model — there's nothing invalid about that).
    pub fn start(&mut self, chip: &mut dyn OplChip, looping: bool) -> Result<()> {
        if self.score.is_none() {
            return Err(Error::NotInitialized);
        }
        if !self.chip_initialized {
            self.programmer.init(chip, self.config.sample_rate);
            self.chip_initialized = true;
        }

        self.channels = [Channel::default(); NUM_CHANNELS];
        self.voices = VoicePool::new();
        self.scheduler.reset();
        if let Some(score) = &mut self.score {
            score.rewind();
        }

        self.looping = looping;
        self.playing = true;
        self.paused = false;
        Ok(())
    }

    /// Idempotent: playback reports not-playing and `generate_samples`
    /// produces silence without advancing the clock (§5).
    pub fn stop(&mut self) {
        self.playing = false;
        self.paused = false;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing && !self.paused
    }

    /// Clamps to `[0, 127]` (§8 property 5).
    pub fn set_volume(&mut self, value: u8) {
        self.volume = value.min(127);
    }

    pub fn get_volume(&self) -> u8 {
        self.volume
    }

    /// Approximate only (§1 Non-goals): position is the elapsed sample
    /// count at the configured sample rate, which drifts from wall-clock
    /// MUS-tick time by less than one sample.
    pub fn position_ms(&self) -> u64 {
        self.scheduler.current_sample() * 1000 / self.config.sample_rate as u64
    }

    /// Implemented as a restart, per §9's Design Notes: seeking is
    /// approximate, and restart-to-start is one of the two explicitly
    /// acceptable choices.
    pub fn seek_ms(&mut self, _approximate_ms: u64) {
        self.scheduler.reset();
        if let Some(score) = &mut self.score {
            score.rewind();
        }
    }

    /// A stub, not a contract — see §9's Design Notes and `DESIGN.md`.
    pub fn get_length_ms(&self) -> u64 {
        STUB_LENGTH_MS
    }

    /// Fills `out` (interleaved stereo `i16`, so `out.len()` must be even
    /// and non-zero) with `out.len() / 2` frames, draining due score events
    /// into OPL register writes along the way. Rejects an empty or
    /// odd-length buffer with [`Error::InvalidParam`] before touching any
    /// state (§7), rather than silently returning zero frames written.
    pub fn generate_samples(&mut self, chip: &mut dyn OplChip, out: &mut [i16]) -> Result<usize> {
        if out.is_empty() {
            return Err(Error::InvalidParam("output buffer is empty".into()));
        }
        if out.len() % 2 != 0 {
            return Err(Error::InvalidParam("output buffer length must be even (interleaved stereo)".into()));
        }

        let frames = out.len() / 2;
        for frame in out.chunks_exact_mut(2).take(frames) {
            if self.playing && !self.paused {
                self.drain_due_events(chip);
            }

            if self.playing && !self.paused {
                let (left, right) = chip.generate_resampled_stereo();
                frame[0] = left;
                frame[1] = right;
                self.scheduler.tick_sample();
            } else {
                frame[0] = 0;
                frame[1] = 0;
            }
        }
        Ok(frames)
    }

    fn next_score_event(&mut self) -> Option<Dispatched> {
        self.score.as_mut()?.next_event()
    }

    fn drain_due_events(&mut self, chip: &mut dyn OplChip) {
        let mut processed = 0;
        while self.scheduler.event_due() {
            processed += 1;
            if processed > MAX_EVENTS_PER_SAMPLE {
                log::warn!("exceeded per-sample event budget; stopping to avoid a stuck loop");
                self.playing = false;
                break;
            }

            let Some(dispatched) = self.next_score_event() else {
                log::warn!("score ended without an explicit End-Of-Score marker");
                self.handle_end_of_score();
                if !self.looping {
                    break;
                }
                continue;
            };

            let is_end = matches!(dispatched.event, Event::EndOfScore);
            self.process_event(chip, dispatched.event);

            if is_end {
                self.handle_end_of_score();
                if !self.looping {
                    break;
                }
                continue;
            }

            if dispatched.delay_ticks > 0 {
                self.scheduler.advance_for_delay(dispatched.delay_ticks);
            }

            if !self.playing {
                break;
            }
        }
    }

    fn handle_end_of_score(&mut self) {
        if self.looping {
            if let Some(score) = &mut self.score {
                score.rewind();
            }
            self.scheduler.reset();
        } else {
            self.playing = false;
        }
    }

    fn lookup_instrument(&self, channel: u8, note: u8) -> Option<Instrument> {
        let bank = self.instruments.as_ref()?;
        if channel == PERCUSSION_CHANNEL {
            bank.percussion(note).copied()
        } else {
            let program = self.channels[channel as usize].program;
            bank.melodic(program).copied()
        }
    }

    fn process_event(&mut self, chip: &mut dyn OplChip, event: Event) {
        match event {
            Event::ReleaseNote { channel, note } => {
                self.programmer.key_off(chip, &mut self.voices, channel, note);
            }
            Event::PlayNote { channel, note, velocity } => {
                let velocity = match velocity {
                    Some(v) => {
                        self.channels[channel as usize].last_velocity = v;
                        v
                    }
                    None => self.channels[channel as usize].last_velocity,
                };
                if let Some(instrument) = self.lookup_instrument(channel, note) {
                    let ch = self.channels[channel as usize];
                    self.programmer
                        .key_on(chip, &mut self.voices, channel, &ch, &instrument, note, velocity);
                }
            }
            Event::PitchBend { channel, value } => {
                let bend = (value as i32 - 128) / 2;
                self.channels[channel as usize].bend = bend;
                self.programmer.refresh_channel_pitch_bend(chip, &mut self.voices, channel, bend);
            }
            Event::SystemEvent { channel, code } => match code {
                10 | 11 => self.programmer.release_all_for(chip, &mut self.voices, channel),
                14 => self.channels[channel as usize].reset_controllers(),
                _ => {}
            },
            Event::Controller { channel, controller, value } => match controller {
                0 => self.channels[channel as usize].program = value,
                3 => {
                    self.channels[channel as usize].set_volume(value);
                    let v = self.channels[channel as usize].volume;
                    self.programmer.refresh_channel_volume(chip, &mut self.voices, channel, v);
                }
                4 => {
                    self.channels[channel as usize].set_pan(value);
                    let p = self.channels[channel as usize].pan_reg;
                    self.programmer.refresh_channel_pan(chip, &mut self.voices, channel, p);
                }
                10 | 11 => self.programmer.release_all_for(chip, &mut self.voices, channel),
                14 => self.channels[channel as usize].reset_controllers(),
                _ => {}
            },
            Event::EndOfScore => {
                // Handled by the caller (`drain_due_events`), which needs
                // to know this happened to stop processing further events
                // at this sample.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opl::test_support::RecordingChip;

    fn mus_header_and_event() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"MUS\x1a");
        data.extend_from_slice(&4u16.to_le_bytes()); // score_len
        data.extend_from_slice(&16u16.to_le_bytes()); // score_start
        data.extend_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.push(0b1001_0000); // last_in_group | Play Note | channel 0
        data.push(60); // note, no velocity bit
        data.push(0x00); // delay = 0
        data.push(0b0110_0000); // End Of Score
        data
    }

    fn empty_score() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"MUS\x1a");
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data
    }

    #[test]
    fn start_without_score_is_not_initialized() {
        let mut chip = RecordingChip::default();
        let mut player = Player::new(PlayerConfig::default()).unwrap();
        assert_eq!(player.start(&mut chip, false), Err(Error::NotInitialized));
    }

    #[test]
    fn new_rejects_zero_sample_rate() {
        let config = PlayerConfig { sample_rate: 0, ..PlayerConfig::default() };
        assert!(matches!(Player::new(config), Err(Error::InvalidParam(_))));
    }

    #[test]
    fn empty_score_ends_immediately_without_extra_writes() {
        let mut chip = RecordingChip::default();
        let mut player = Player::new(PlayerConfig::default()).unwrap();
        let data = empty_score();
        player.load_mus(&data).unwrap();
        player.start(&mut chip, false).unwrap();

        let mut buf = vec![0i16; 1024 * 2];
        let frames = player.generate_samples(&mut chip, &mut buf).unwrap();
        assert_eq!(frames, 1024);
        assert!(!player.is_playing());
    }

    #[test]
    fn generate_samples_rejects_empty_buffer() {
        let mut chip = RecordingChip::default();
        let mut player = Player::new(PlayerConfig::default()).unwrap();
        let mut buf: [i16; 0] = [];
        assert!(matches!(
            player.generate_samples(&mut chip, &mut buf),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn generate_samples_rejects_odd_length_buffer() {
        let mut chip = RecordingChip::default();
        let mut player = Player::new(PlayerConfig::default()).unwrap();
        let mut buf = [0i16; 3];
        assert!(matches!(
            player.generate_samples(&mut chip, &mut buf),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn volume_clamp_law() {
        let mut player = Player::new(PlayerConfig::default()).unwrap();
        player.set_volume(200);
        assert_eq!(player.get_volume(), 127);
        player.set_volume(50);
        assert_eq!(player.get_volume(), 50);
    }

    #[test]
    fn stop_is_idempotent_and_silences_output() {
        let mut chip = RecordingChip::default();
        let mut player = Player::new(PlayerConfig::default()).unwrap();
        let data = mus_header_and_event();
        player.load_mus(&data).unwrap();
        player.start(&mut chip, false).unwrap();
        player.stop();
        player.stop();
        assert!(!player.is_playing());
        let mut buf = [1i16, 1];
        player.generate_samples(&mut chip, &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn pause_resume_round_trip() {
        let mut chip = RecordingChip::default();
        let mut player = Player::new(PlayerConfig::default()).unwrap();
        let data = mus_header_and_event();
        player.load_mus(&data).unwrap();
        player.start(&mut chip, false).unwrap();
        player.pause();
        assert!(!player.is_playing());
        player.resume();
        assert!(player.is_playing());
    }
}
