//! C6: the OPL programmer — the only module that emits register writes.
//!
//! Register addressing follows the Yamaha OPL2/OPL3 map: a register base
//! (`TREMOLO`, `LEVEL`, ...) plus either an operator offset (`op1`/`op2`,
//! drawn from [`crate::voice`]'s 9-entry table) or a per-voice index
//! (`index_in_array`), OR'd with [`crate::voice::ARRAY_OFFSET`] for voices
//! 9-17. Every write passes through [`RegisterShadow`], which suppresses
//! redundant writes — modeled the same way `vgmck-rs`'s `Opl2::write_opl`
//! keeps a shadow `memory` array and skips a write if the value is already
//! there, except for `FREQ_HI`, which carries the key-on bit as transient
//! state rather than a steady value and so is never suppressed.

use crate::channel::Channel;
use crate::instrument::{FmVoicePatch, Instrument, OperatorPatch};
use crate::tables::{combine_volume, frequency_for_note};
use crate::voice::{Voice, VoicePool, ARRAY_OFFSET};

pub const TREMOLO: u16 = 0x20;
pub const LEVEL: u16 = 0x40;
pub const ATTACK: u16 = 0x60;
pub const SUSTAIN: u16 = 0x80;
pub const FEEDBACK: u16 = 0xc0;
pub const WAVEFORM: u16 = 0xe0;
pub const FREQ_LO: u16 = 0xa0;
pub const FREQ_HI: u16 = 0xb0;

/// The three operations the core requires of an OPL2/OPL3 chip emulator
/// (§6). Implementations are free to be cycle-accurate or a faster
/// approximation; the core does not care which.
pub trait OplChip {
    fn reset(&mut self, sample_rate: u32);
    /// `addr` is in `0x000..=0x1FF`; the high bit selects array 1.
    fn write_reg(&mut self, addr: u16, value: u8);
    fn generate_resampled_stereo(&mut self) -> (i16, i16);
}

/// A write-through cache over the chip's 9-bit register space, keyed by
/// the full `0x000..=0x1FF` address (array bit included).
#[derive(Debug, Clone)]
pub struct RegisterShadow {
    values: [i16; 0x200],
}

impl Default for RegisterShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterShadow {
    pub fn new() -> Self {
        Self { values: [-1; 0x200] }
    }

    /// Writes `value` to `addr` through the shadow. `force` bypasses
    /// suppression for registers (namely `FREQ_HI`) that carry state
    /// beyond their bit pattern.
    fn write(&mut self, chip: &mut dyn OplChip, addr: u16, value: u8, force: bool) {
        let slot = &mut self.values[addr as usize];
        if !force && *slot == value as i16 {
            log::trace!("suppressed redundant OPL write {addr:#05x}={value:#04x}");
            return;
        }
        *slot = value as i16;
        chip.write_reg(addr, value);
    }
}

/// Computes the combined F-number/block register value for one voice,
/// folding in the per-instrument note clamp, the base-note transpose (only
/// for non-fixed instruments), and the second-voice fine-tuning shift
/// described in §4.3.
fn compute_voice_frequency(
    channel_bend: i32,
    note: u8,
    patch: &FmVoicePatch,
    fixed: bool,
    voice_idx: u8,
    fine_tuning: u8,
) -> u16 {
    let mut n = note as i32;
    if !fixed {
        n += patch.base_note_offset as i32;
    }
    while n < 0 {
        n += 12;
    }
    while n > 95 {
        n -= 12;
    }

    let mut bend = channel_bend;
    if voice_idx == 1 {
        bend += (fine_tuning as i32 / 2) - 64;
    }

    frequency_for_note(n, bend)
}

/// Owns the register-write shadow and every register-level operation
/// described in §4.5. Takes the voice pool, channel state, and instrument
/// data it needs as arguments rather than owning them, so the facade in
/// `player.rs` stays the only place that wires components together.
#[derive(Debug, Clone, Default)]
pub struct OplProgrammer {
    shadow: RegisterShadow,
}

impl OplProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&mut self, chip: &mut dyn OplChip, addr: u16, value: u8, force: bool) {
        self.shadow.write(chip, addr, value, force);
    }

    /// Resets the chip and clears both arrays' operator registers to
    /// silence, then enables the waveform-select extension and, for OPL3,
    /// the second array.
    pub fn init(&mut self, chip: &mut dyn OplChip, sample_rate: u32) {
        chip.reset(sample_rate);

        self.clear_array(chip, 0);
        self.write(chip, 0x04, 0x60, false);
        self.write(chip, 0x04, 0x80, false);
        self.write(chip, 0x01, 0x20, false);
        self.write(chip, 0x105, 0x01, false);
        self.clear_array(chip, ARRAY_OFFSET);
    }

    fn clear_array(&mut self, chip: &mut dyn OplChip, array: u16) {
        for op in 0..=0x15u16 {
            self.write(chip, array | (LEVEL + op), 0x3f, false);
            self.write(chip, array | (TREMOLO + op), 0, false);
            self.write(chip, array | (ATTACK + op), 0, false);
            self.write(chip, array | (SUSTAIN + op), 0, false);
            self.write(chip, array | (WAVEFORM + op), 0, false);
        }
    }

    /// Loads one operator's six parameters. Returns the level register
    /// value actually written, so the caller can keep the level shadow on
    /// `Voice` in sync.
    fn load_operator(&mut self, chip: &mut dyn OplChip, op_addr: u16, op: &OperatorPatch, silent: bool) -> u8 {
        let level_reg = op.scale | if silent { 0x3f } else { op.level };
        self.write(chip, LEVEL + op_addr, level_reg, false);
        self.write(chip, TREMOLO + op_addr, op.tremolo_vibrato_ksr_multi, false);
        self.write(chip, ATTACK + op_addr, op.attack_decay, false);
        self.write(chip, SUSTAIN + op_addr, op.sustain_release, false);
        self.write(chip, WAVEFORM + op_addr, op.waveform, false);
        level_reg
    }

    /// Programs a voice's operators for `patch` unless it's already loaded
    /// with the same `(patch, voice_idx)` pair.
    pub fn set_voice_instrument(&mut self, chip: &mut dyn OplChip, voice: &mut Voice, patch: &FmVoicePatch, voice_idx: u8) {
        if voice.instr.as_ref() == Some(patch) && voice.instr_voice_idx == voice_idx {
            return;
        }

        let array = voice.array_offset;
        voice.car_level = self.load_operator(chip, array | voice.op2 as u16, &patch.carrier, true);

        let modulating = !patch.is_additive();
        voice.mod_level = self.load_operator(chip, array | voice.op1 as u16, &patch.modulator, !modulating);

        self.write(chip, FEEDBACK + array + voice.index_in_array as u16, patch.feedback | voice.reg_pan, false);

        voice.instr = Some(*patch);
        voice.instr_voice_idx = voice_idx;
    }

    /// Recomputes and, if changed, writes the carrier's (and for additive
    /// algorithms, the modulator's) attenuation from a note velocity and
    /// the owning channel's volume.
    pub fn set_voice_volume(&mut self, chip: &mut dyn OplChip, voice: &mut Voice, note_velocity: u8, channel_volume: u8) {
        voice.note_volume = note_velocity;
        let Some(patch) = voice.instr else { return };

        let car_level_new = combine_volume(note_velocity, channel_volume);
        let array = voice.array_offset;

        if car_level_new != voice.car_level & 0x3f {
            let ksl_bits = voice.car_level & 0xc0;
            let reg = ksl_bits | car_level_new;
            self.write(chip, LEVEL + array + voice.op2 as u16, reg, false);
            voice.car_level = reg;
        }

        if patch.is_additive() && patch.modulator.level != 0x3f {
            let mod_new = patch.modulator.level.max(car_level_new);
            let ksl_bits = patch.modulator.scale & 0xc0;
            let reg = ksl_bits | mod_new;
            if reg != voice.mod_level {
                self.write(chip, LEVEL + array + voice.op1 as u16, reg, false);
                voice.mod_level = reg;
            }
        }
    }

    /// Rewrites the feedback register with new pan bits if they changed.
    pub fn set_voice_pan(&mut self, chip: &mut dyn OplChip, voice: &mut Voice, new_pan: u8) {
        if voice.reg_pan == new_pan {
            return;
        }
        voice.reg_pan = new_pan;
        let Some(patch) = voice.instr else { return };
        let array = voice.array_offset;
        self.write(chip, FEEDBACK + array + voice.index_in_array as u16, patch.feedback | new_pan, false);
    }

    /// Writes the 13-bit combined F-number/block value, suppressing the
    /// whole pair only when it's unchanged. `FREQ_HI` always carries the
    /// key-on bit (`0x20`) and is never suppressed by the shadow.
    pub fn update_voice_frequency(&mut self, chip: &mut dyn OplChip, voice: &mut Voice, freq: u16) {
        if voice.freq_reg == freq {
            return;
        }
        let array = voice.array_offset;
        let idx = voice.index_in_array as u16;
        self.write(chip, FREQ_LO + array + idx, (freq & 0xff) as u8, false);
        self.write(chip, FREQ_HI + array + idx, ((freq >> 8) as u8) | 0x20, true);
        voice.freq_reg = freq;
    }

    /// Strips the key-on bit from a voice's `FREQ_HI` shadow value and
    /// writes it — the explicit key-off — without releasing the slot.
    fn write_key_off(&mut self, chip: &mut dyn OplChip, voice: &Voice) {
        let array = voice.array_offset;
        let idx = voice.index_in_array as u16;
        self.write(chip, FREQ_HI + array + idx, (voice.freq_reg >> 8) as u8, true);
    }

    /// Allocates a voice, stealing (and key-off'ing the victim) if the pool
    /// is full. `protect` names a voice that must never be the steal
    /// victim — the sibling sub-voice a double-voice note-on just allocated
    /// for `voice_idx` 0. The steal policy gets exactly one candidate
    /// (§4.4: "rather than stealing twice"); if that candidate is the
    /// protected voice, allocation fails instead of destroying it, so the
    /// caller can fall back to single-voice playback.
    fn allocate_or_steal(&mut self, chip: &mut dyn OplChip, voices: &mut VoicePool, protect: Option<usize>) -> Option<usize> {
        if let Some(idx) = voices.allocate() {
            return Some(idx);
        }
        let victim = voices
            .choose_victim()
            .expect("steal is only attempted when allocate() has already failed, so at least one voice is in use");
        if Some(victim) == protect {
            log::debug!("refusing to steal sibling voice {victim}; downgrading to single-voice playback");
            return None;
        }
        log::debug!("stealing voice {victim}");
        self.write_key_off(chip, voices.voice(victim));
        voices.release(victim);
        Some(voices.allocate().expect("a voice was just released"))
    }

    /// Key-on for one instrument sub-voice (`voice_idx` 0 or 1). Used
    /// directly for single-voice instruments and twice (with a fallback to
    /// single-voice on failure) for double-voice ones; see
    /// [`Self::key_on`]. Returns the allocated voice's index, or `None` if
    /// no voice could be had without stealing `protect`.
    #[allow(clippy::too_many_arguments)]
    fn key_on_one(
        &mut self,
        chip: &mut dyn OplChip,
        voices: &mut VoicePool,
        channel_idx: u8,
        channel: &Channel,
        instrument: &Instrument,
        key: u8,
        note: u8,
        velocity: u8,
        voice_idx: u8,
        protect: Option<usize>,
    ) -> Option<usize> {
        let idx = self.allocate_or_steal(chip, voices, protect)?;
        let voice = voices.voice_mut(idx);

        voice.channel = Some(channel_idx);
        voice.key = key;
        voice.reg_pan = channel.pan_reg;
        voice.note = note;
        voice.fixed = instrument.is_fixed();
        voice.fine_tuning = instrument.fine_tuning;

        let patch = instrument.voices[voice_idx as usize];
        self.set_voice_instrument(chip, voice, &patch, voice_idx);
        self.set_voice_volume(chip, voice, velocity, channel.volume);

        voice.freq_reg = 0;
        let freq = compute_voice_frequency(channel.bend, note, &patch, instrument.is_fixed(), voice_idx, instrument.fine_tuning);
        self.update_voice_frequency(chip, voice, freq);
        Some(idx)
    }

    /// Full key-on sequence (§4.5): allocates (stealing if needed), loads
    /// the instrument, sets volume, and issues the key-on frequency write;
    /// repeats for the second voice of a double-voice instrument, falling
    /// back to single-voice playback if a second voice can't be had without
    /// stealing the first voice it just allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn key_on(
        &mut self,
        chip: &mut dyn OplChip,
        voices: &mut VoicePool,
        channel_idx: u8,
        channel: &Channel,
        instrument: &Instrument,
        key: u8,
        velocity: u8,
    ) {
        let note = if instrument.is_fixed() { instrument.fixed_note } else { key };

        let Some(first_idx) = self.key_on_one(chip, voices, channel_idx, channel, instrument, key, note, velocity, 0, None) else {
            return;
        };

        if instrument.is_double_voice() {
            self.key_on_one(chip, voices, channel_idx, channel, instrument, key, note, velocity, 1, Some(first_idx));
        }
    }

    /// Key-off for every in-use voice matching `(channel, key)` — more
    /// than one when a double-voice instrument is sounding.
    pub fn key_off(&mut self, chip: &mut dyn OplChip, voices: &mut VoicePool, channel: u8, key: u8) {
        for idx in voices.voices_for_key(channel, key) {
            self.write_key_off(chip, voices.voice(idx));
            voices.release(idx);
        }
    }

    /// Key-off for every in-use voice owned by `channel`, regardless of
    /// key — used for "all sounds/notes off".
    pub fn release_all_for(&mut self, chip: &mut dyn OplChip, voices: &mut VoicePool, channel: u8) {
        for idx in voices.voices_for_channel(channel) {
            self.write_key_off(chip, voices.voice(idx));
            voices.release(idx);
        }
    }

    /// Refreshes volume on every voice owned by `channel` after its
    /// channel volume changed.
    pub fn refresh_channel_volume(&mut self, chip: &mut dyn OplChip, voices: &mut VoicePool, channel: u8, channel_volume: u8) {
        for idx in voices.voices_for_channel(channel) {
            let voice = voices.voice_mut(idx);
            let velocity = voice.note_volume;
            self.set_voice_volume(chip, voice, velocity, channel_volume);
        }
    }

    /// Refreshes pan on every voice owned by `channel` after its channel
    /// pan changed.
    pub fn refresh_channel_pan(&mut self, chip: &mut dyn OplChip, voices: &mut VoicePool, channel: u8, pan_reg: u8) {
        for idx in voices.voices_for_channel(channel) {
            self.set_voice_pan(chip, voices.voice_mut(idx), pan_reg);
        }
    }

    /// Invalidates the frequency shadow of every voice owned by `channel`
    /// and rewrites it from the channel's current bend — the effect of a
    /// Pitch Bend event (§4.5).
    pub fn refresh_channel_pitch_bend(&mut self, chip: &mut dyn OplChip, voices: &mut VoicePool, channel_idx: u8, channel_bend: i32) {
        for idx in voices.voices_for_channel(channel_idx) {
            let voice = voices.voice_mut(idx);
            let Some(patch) = voice.instr else { continue };
            let freq = compute_voice_frequency(channel_bend, voice.note, &patch, voice.fixed, voice.instr_voice_idx, voice.fine_tuning);
            voice.freq_reg = 0;
            self.update_voice_frequency(chip, voice, freq);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::OplChip;

    /// A fake chip that records every `(addr, value)` write and produces
    /// silence, so tests can assert directly on the register-write stream
    /// (§8's invariants) without a real FM synthesis engine.
    #[derive(Debug, Default)]
    pub struct RecordingChip {
        pub writes: Vec<(u16, u8)>,
        pub reset_sample_rate: Option<u32>,
    }

    impl OplChip for RecordingChip {
        fn reset(&mut self, sample_rate: u32) {
            self.reset_sample_rate = Some(sample_rate);
        }

        fn write_reg(&mut self, addr: u16, value: u8) {
            self.writes.push((addr, value));
        }

        fn generate_resampled_stereo(&mut self) -> (i16, i16) {
            (0, 0)
        }
    }
}
