//! C1: the GENMIDI instrument bank.
//!
//! A bank is 128 melodic instruments followed by 47 percussion instruments,
//! each a fixed 36-byte record. Once loaded a bank is immutable; voices that
//! already reference an instrument from a superseded bank keep playing with
//! the patch they were given (see `Instrument`'s `Clone`/value semantics —
//! nothing here is reference-counted, so the caller just holds onto the old
//! `Instrument` value for as long as a voice needs it).

use crate::error::{Error, Result};

/// Bit 0 of `Instrument::flags`: ignore the incoming MIDI note and always
/// play `fixed_note` — used for percussion.
pub const FLAG_FIXED_NOTE: u16 = 0x0001;
/// Bit 2 of `Instrument::flags`: allocate a second voice for a richer tone.
pub const FLAG_DOUBLE_VOICE: u16 = 0x0004;

pub const NUM_MELODIC: usize = 128;
pub const NUM_PERCUSSION: usize = 47;
/// GENMIDI percussion instruments are indexed from MIDI note 35 (bass drum).
pub const PERCUSSION_BASE_NOTE: u8 = 35;

const MAGIC: &[u8; 8] = b"#OPL_II#";
const RECORD_LEN: usize = 36;
const VOICE_LEN: usize = 16;

/// One OPL operator's six programmable parameters, in GENMIDI byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperatorPatch {
    pub tremolo_vibrato_ksr_multi: u8,
    pub attack_decay: u8,
    pub sustain_release: u8,
    pub waveform: u8,
    pub scale: u8,
    pub level: u8,
}

/// A modulator/carrier operator pair plus the feedback/algorithm byte and
/// transpose that together describe how one voice sounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FmVoicePatch {
    pub modulator: OperatorPatch,
    pub carrier: OperatorPatch,
    pub feedback: u8,
    pub base_note_offset: i16,
}

impl FmVoicePatch {
    /// Bit 0 of `feedback`: 0 = modulated FM (algorithm 0), 1 = additive
    /// (algorithm 1).
    pub fn is_additive(&self) -> bool {
        self.feedback & 0x01 != 0
    }
}

/// One GENMIDI entry. `voices[1]` is only meaningful when
/// [`FLAG_DOUBLE_VOICE`] is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct Instrument {
    pub flags: u16,
    pub fine_tuning: u8,
    pub fixed_note: u8,
    pub voices: [FmVoicePatch; 2],
}

impl Instrument {
    pub fn is_fixed(&self) -> bool {
        self.flags & FLAG_FIXED_NOTE != 0
    }

    pub fn is_double_voice(&self) -> bool {
        self.flags & FLAG_DOUBLE_VOICE != 0
    }
}

/// 128 melodic + 47 percussion instrument definitions parsed from a GENMIDI
/// lump. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct InstrumentBank {
    melodic: Vec<Instrument>,
    percussion: Vec<Instrument>,
}

impl InstrumentBank {
    /// Parses a GENMIDI blob. Fails with [`Error::InvalidData`] on a bad
    /// magic or a blob shorter than its own fixed layout requires.
    pub fn load(data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
            return Err(Error::InvalidData("GENMIDI magic mismatch".into()));
        }

        let total = NUM_MELODIC + NUM_PERCUSSION;
        let needed = MAGIC.len() + total * RECORD_LEN;
        if data.len() < needed {
            return Err(Error::InvalidData(format!(
                "GENMIDI blob truncated: need {needed} bytes, got {}",
                data.len()
            )));
        }

        let mut instruments = Vec::with_capacity(total);
        let mut cursor = MAGIC.len();
        for _ in 0..total {
            instruments.push(parse_record(&data[cursor..cursor + RECORD_LEN]));
            cursor += RECORD_LEN;
        }
        let percussion = instruments.split_off(NUM_MELODIC);

        Ok(Self {
            melodic: instruments,
            percussion,
        })
    }

    /// Looks up a melodic instrument by MIDI program number (0-127).
    pub fn melodic(&self, program: u8) -> Option<&Instrument> {
        self.melodic.get(program as usize)
    }

    /// Looks up a percussion instrument by the MIDI key that triggers it.
    /// GENMIDI's percussion bank starts at [`PERCUSSION_BASE_NOTE`].
    pub fn percussion(&self, key: u8) -> Option<&Instrument> {
        let idx = key.checked_sub(PERCUSSION_BASE_NOTE)?;
        self.percussion.get(idx as usize)
    }
}

fn parse_record(bytes: &[u8]) -> Instrument {
    let flags = u16::from_le_bytes([bytes[0], bytes[1]]);
    let fine_tuning = bytes[2];
    let fixed_note = bytes[3];
    let voice0 = parse_voice(&bytes[4..4 + VOICE_LEN]);
    let voice1 = parse_voice(&bytes[4 + VOICE_LEN..4 + 2 * VOICE_LEN]);
    Instrument {
        flags,
        fine_tuning,
        fixed_note,
        voices: [voice0, voice1],
    }
}

/// GENMIDI's per-voice layout places `feedback` between the operator blocks
/// and a trailing unused byte before the transpose, not after both
/// operators as a naive reading of a flattened field list would suggest.
fn parse_voice(bytes: &[u8]) -> FmVoicePatch {
    let modulator = OperatorPatch {
        tremolo_vibrato_ksr_multi: bytes[0],
        attack_decay: bytes[1],
        sustain_release: bytes[2],
        waveform: bytes[3],
        scale: bytes[4],
        level: bytes[5],
    };
    let feedback = bytes[6];
    let carrier = OperatorPatch {
        tremolo_vibrato_ksr_multi: bytes[7],
        attack_decay: bytes[8],
        sustain_release: bytes[9],
        waveform: bytes[10],
        scale: bytes[11],
        level: bytes[12],
    };
    // bytes[13] is unused padding.
    let base_note_offset = i16::from_le_bytes([bytes[14], bytes[15]]);
    FmVoicePatch {
        modulator,
        carrier,
        feedback,
        base_note_offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(flags: u16, fixed_note: u8) -> [u8; RECORD_LEN] {
        let mut r = [0u8; RECORD_LEN];
        r[0..2].copy_from_slice(&flags.to_le_bytes());
        r[2] = 128; // fine_tuning
        r[3] = fixed_note;
        r
    }

    fn blob() -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(MAGIC);
        for i in 0..(NUM_MELODIC + NUM_PERCUSSION) {
            let flags = if i == 3 { FLAG_DOUBLE_VOICE } else { 0 };
            v.extend_from_slice(&record(flags, 60));
        }
        v
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = blob();
        data[0] = b'X';
        assert!(matches!(InstrumentBank::load(&data), Err(Error::InvalidData(_))));
    }

    #[test]
    fn rejects_truncated_blob() {
        let data = blob();
        let short = &data[..data.len() - 1];
        assert!(matches!(InstrumentBank::load(short), Err(Error::InvalidData(_))));
    }

    #[test]
    fn loads_melodic_and_percussion() {
        let data = blob();
        let bank = InstrumentBank::load(&data).unwrap();
        assert!(bank.melodic(0).is_some());
        assert!(bank.melodic(127).is_some());
        assert!(bank.melodic(128).is_none());
        assert!(bank.percussion(PERCUSSION_BASE_NOTE).is_some());
        assert!(bank.percussion(PERCUSSION_BASE_NOTE - 1).is_none());
        assert!(bank.melodic(3).unwrap().is_double_voice());
        assert!(!bank.melodic(0).unwrap().is_double_voice());
    }
}
