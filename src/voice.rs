//! C4: the 18-voice pool shared across 16 channels.
//!
//! Voices hold no pointer back to their owning channel beyond a plain index
//! (`DESIGN.md`'s back-pointer removal note) and no pointer into the
//! instrument bank — the instrument patch they're playing is cloned onto
//! the voice at key-on time, so a bank reload mid-playback can't dangle a
//! sounding voice (§4.1).

use crate::instrument::FmVoicePatch;

pub const NUM_VOICES: usize = 18;
pub const VOICES_PER_ARRAY: usize = 9;
/// Register bit offset separating OPL3 array 0 from array 1.
pub const ARRAY_OFFSET: u16 = 0x100;

/// The fixed 9-entry modulator operator offset table (one entry per voice
/// slot within an array); the matching carrier operator is always 3
/// registers higher.
const OPERATOR_BASE: [u8; VOICES_PER_ARRAY] = [0x00, 0x01, 0x02, 0x08, 0x09, 0x0a, 0x10, 0x11, 0x12];
const CARRIER_OFFSET: u8 = 0x03;

/// One of the 18 hardware-style FM voice slots.
#[derive(Debug, Clone)]
pub struct Voice {
    pub index_in_array: u8,
    pub op1: u8,
    pub op2: u8,
    pub array_offset: u16,

    pub in_use: bool,
    pub channel: Option<u8>,
    pub instr: Option<FmVoicePatch>,
    pub instr_voice_idx: u8,
    /// Cached from the owning instrument's fixed-note flag at key-on time,
    /// so a later pitch-bend refresh knows whether `base_note_offset`
    /// applies without needing a back-reference to the instrument bank.
    pub fixed: bool,
    /// Cached from the owning instrument's `fine_tuning` at key-on time,
    /// for the same reason.
    pub fine_tuning: u8,

    pub key: u8,
    pub note: u8,
    pub freq_reg: u16,
    pub car_level: u8,
    pub mod_level: u8,
    pub reg_pan: u8,
    pub note_volume: u8,
}

impl Voice {
    fn new(global_index: usize) -> Self {
        let index_in_array = (global_index % VOICES_PER_ARRAY) as u8;
        let array_offset = if global_index < VOICES_PER_ARRAY { 0 } else { ARRAY_OFFSET };
        let op1 = OPERATOR_BASE[index_in_array as usize];
        let op2 = op1 + CARRIER_OFFSET;
        Self {
            index_in_array,
            op1,
            op2,
            array_offset,
            in_use: false,
            channel: None,
            instr: None,
            instr_voice_idx: 0,
            fixed: false,
            fine_tuning: 128,
            key: 0,
            note: 0,
            freq_reg: 0,
            car_level: 0,
            mod_level: 0,
            reg_pan: 0,
            note_volume: 0,
        }
    }

    /// Clears everything that identifies what the voice was playing, but
    /// keeps the register shadows (`freq_reg`, `car_level`, `mod_level`,
    /// `reg_pan`) so a future note-on can skip redundant writes — except
    /// `instr`, which must be cleared so `set_voice_instrument` always
    /// reprograms the operators on reuse (§3 Lifecycles).
    fn clear_occupancy(&mut self) {
        self.in_use = false;
        self.channel = None;
        self.instr = None;
        self.instr_voice_idx = 0;
        self.fixed = false;
    }
}

/// Owns the 18 voices and implements allocation, the deterministic steal
/// policy, and release.
#[derive(Debug, Clone)]
pub struct VoicePool {
    voices: [Voice; NUM_VOICES],
}

impl Default for VoicePool {
    fn default() -> Self {
        Self::new()
    }
}

impl VoicePool {
    pub fn new() -> Self {
        let voices: Vec<Voice> = (0..NUM_VOICES).map(Voice::new).collect();
        let voices: [Voice; NUM_VOICES] = voices
            .try_into()
            .unwrap_or_else(|_| unreachable!("NUM_VOICES is fixed"));
        Self { voices }
    }

    pub fn voices(&self) -> &[Voice; NUM_VOICES] {
        &self.voices
    }

    pub fn voice(&self, idx: usize) -> &Voice {
        &self.voices[idx]
    }

    pub fn voice_mut(&mut self, idx: usize) -> &mut Voice {
        &mut self.voices[idx]
    }

    /// Returns the index of the first free voice and marks it in-use, or
    /// `None` if all 18 are occupied.
    pub fn allocate(&mut self) -> Option<usize> {
        let idx = self.voices.iter().position(|v| !v.in_use)?;
        self.voices[idx].in_use = true;
        Some(idx)
    }

    /// Picks a victim per §4.4's deterministic policy, releases it (without
    /// touching the OPL — the caller does the key-off write first, since
    /// that requires the chip handle this module doesn't have), and returns
    /// its freshly-allocated index.
    ///
    /// Returns `None` only if no voice is in use, which cannot happen while
    /// any of the 18 slots are occupied — `steal` is only ever called when
    /// `allocate` has already failed.
    pub fn choose_victim(&self) -> Option<usize> {
        let in_use: Vec<usize> = (0..NUM_VOICES).filter(|&i| self.voices[i].in_use).collect();
        if in_use.is_empty() {
            return None;
        }

        if let Some(&secondary) = in_use.iter().find(|&&i| self.voices[i].instr_voice_idx != 0) {
            return Some(secondary);
        }

        // Prefer higher channel indices (lower priority in DMX's
        // convention); ties within a sweep resolve to the later voice, so a
        // non-strict `>=` comparison naturally keeps advancing the
        // candidate as we scan forward.
        let mut best = in_use[0];
        for &i in &in_use[1..] {
            let best_ch = self.voices[best].channel.unwrap_or(0);
            let cur_ch = self.voices[i].channel.unwrap_or(0);
            if cur_ch >= best_ch {
                best = i;
            }
        }
        Some(best)
    }

    pub fn release(&mut self, idx: usize) {
        self.voices[idx].clear_occupancy();
    }

    /// Returns the indices of every in-use voice owned by `channel`.
    pub fn voices_for_channel(&self, channel: u8) -> Vec<usize> {
        (0..NUM_VOICES)
            .filter(|&i| self.voices[i].in_use && self.voices[i].channel == Some(channel))
            .collect()
    }

    /// Returns the indices of every in-use voice whose `(channel, key)`
    /// matches, supporting the double-voice case where two voices share a
    /// key.
    pub fn voices_for_key(&self, channel: u8, key: u8) -> Vec<usize> {
        (0..NUM_VOICES)
            .filter(|&i| self.voices[i].in_use && self.voices[i].channel == Some(channel) && self.voices[i].key == key)
            .collect()
    }

    pub fn count_in_use(&self) -> usize {
        self.voices.iter().filter(|v| v.in_use).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::assert_le;

    #[test]
    fn array_split_is_0_to_8_and_9_to_17() {
        let pool = VoicePool::new();
        for i in 0..VOICES_PER_ARRAY {
            assert_eq!(pool.voice(i).array_offset, 0);
        }
        for i in VOICES_PER_ARRAY..NUM_VOICES {
            assert_eq!(pool.voice(i).array_offset, ARRAY_OFFSET);
        }
    }

    #[test]
    fn allocate_fills_in_index_order() {
        let mut pool = VoicePool::new();
        for expected in 0..NUM_VOICES {
            let got = pool.allocate().unwrap();
            assert_eq!(got, expected);
        }
        assert!(pool.allocate().is_none());
        assert_eq!(pool.count_in_use(), NUM_VOICES);
    }

    #[test]
    fn release_frees_slot_but_keeps_shadow_fields() {
        let mut pool = VoicePool::new();
        let idx = pool.allocate().unwrap();
        pool.voice_mut(idx).channel = Some(2);
        pool.voice_mut(idx).freq_reg = 0x1234;
        pool.release(idx);
        assert!(!pool.voice(idx).in_use);
        assert!(pool.voice(idx).channel.is_none());
        assert!(pool.voice(idx).instr.is_none());
        assert_eq!(pool.voice(idx).freq_reg, 0x1234);
    }

    #[test]
    fn steal_prefers_double_voice_secondary() {
        let mut pool = VoicePool::new();
        for _ in 0..NUM_VOICES {
            pool.allocate().unwrap();
        }
        pool.voice_mut(5).instr_voice_idx = 1;
        let victim = pool.choose_victim().unwrap();
        assert_eq!(victim, 5);
    }

    #[test]
    fn steal_prefers_higher_channel_with_later_tiebreak() {
        let mut pool = VoicePool::new();
        for i in 0..NUM_VOICES {
            let idx = pool.allocate().unwrap();
            assert_eq!(idx, i);
            pool.voice_mut(idx).channel = Some(0);
        }
        // All on channel 0: tie-break picks the last voice in scan order.
        let victim = pool.choose_victim().unwrap();
        assert_eq!(victim, NUM_VOICES - 1);

        pool.voice_mut(3).channel = Some(5);
        let victim = pool.choose_victim().unwrap();
        assert_eq!(victim, 3);
    }

    #[test]
    fn voices_for_key_supports_double_voice() {
        let mut pool = VoicePool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.voice_mut(a).channel = Some(1);
        pool.voice_mut(a).key = 60;
        pool.voice_mut(b).channel = Some(1);
        pool.voice_mut(b).key = 60;
        let matches = pool.voices_for_key(1, 60);
        assert_eq!(matches.len(), 2);
        assert_le!(matches[0], matches[1]);
    }
}
