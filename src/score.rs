//! C2: the MUS score reader.
//!
//! A `ScoreReader` holds a cursor into a borrowed byte slice and yields
//! [`Event`]s in score order, decoding the variable-length inter-event delay
//! as it goes. It does not own the score bytes — the caller (the `Player`)
//! keeps them alive for as long as the reader is in use, per the borrowed
//! shared-resource model described for this crate.

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"MUS\x1a";
const HEADER_LEN: usize = 16;

/// MUS channel 15 (percussion in id's convention) and channel 9 swap places
/// with internal channel numbering; see `DESIGN.md`'s Open Question
/// resolution for why this is a renumbering, not a reservation.
pub fn remap_channel(mus_channel: u8) -> u8 {
    match mus_channel {
        15 => 9,
        9 => 15,
        other => other,
    }
}

/// Parsed MUS header (§4.2/§6). Little-endian throughout.
#[derive(Debug, Clone, Copy)]
pub struct MusHeader {
    pub score_len: u16,
    pub score_start: u16,
    pub channels: u16,
    pub sec_channels: u16,
    pub instr_count: u16,
}

impl MusHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::InvalidData("MUS header truncated".into()));
        }
        if &data[0..4] != MAGIC {
            return Err(Error::InvalidData("MUS magic mismatch".into()));
        }
        let u16_at = |off: usize| u16::from_le_bytes([data[off], data[off + 1]]);
        Ok(Self {
            score_len: u16_at(4),
            score_start: u16_at(6),
            channels: u16_at(8),
            sec_channels: u16_at(10),
            instr_count: u16_at(12),
        })
    }
}

/// One decoded MUS event, with its channel already remapped and its
/// following delay (in 140 Hz ticks) resolved, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ReleaseNote { channel: u8, note: u8 },
    PlayNote { channel: u8, note: u8, velocity: Option<u8> },
    PitchBend { channel: u8, value: u8 },
    SystemEvent { channel: u8, code: u8 },
    Controller { channel: u8, controller: u8, value: u8 },
    EndOfScore,
}

/// A dispatched event paired with the tick delay that follows it (0 if the
/// event did not carry one — i.e. it is grouped with the next event at the
/// same sample).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub event: Event,
    pub delay_ticks: u32,
}

/// Iterates the event stream of a single MUS score, held as a borrowed byte
/// slice for the reader's lifetime.
pub struct ScoreReader<'a> {
    data: &'a [u8],
    header: MusHeader,
    cursor: usize,
    end: usize,
}

impl<'a> ScoreReader<'a> {
    /// Validates the header and positions the cursor at `score_start`.
    /// Fails with [`Error::InvalidData`] on a bad magic, a truncated
    /// header, or a `score_start`/`score_len` that run past the blob.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let header = MusHeader::parse(data)?;
        let start = header.score_start as usize;
        let end = start.saturating_add(header.score_len as usize);
        if end > data.len() || start > data.len() {
            return Err(Error::InvalidData(
                "MUS score_start/score_len run past end of blob".into(),
            ));
        }
        Ok(Self {
            data,
            header,
            cursor: start,
            end,
        })
    }

    pub fn header(&self) -> &MusHeader {
        &self.header
    }

    /// Rewinds the cursor to `score_start`, for looping.
    pub fn rewind(&mut self) {
        self.cursor = self.header.score_start as usize;
    }

    /// Reads and decodes the next event plus its trailing delay, if any.
    ///
    /// Returns `Ok(None)` only when the cursor has run past `score_len`
    /// without having seen an explicit End-Of-Score marker — the caller
    /// treats this exactly like an End-Of-Score (§4.2: "fails silently" is
    /// not allowed, so this is a recoverable condition, not an `Err`).
    pub fn next_event(&mut self) -> Option<Dispatched> {
        if self.cursor >= self.end {
            return None;
        }

        let status = *self.data.get(self.cursor)?;
        self.cursor += 1;
        let last_in_group = status & 0x80 != 0;
        let kind = (status >> 4) & 0x07;
        let mus_channel = status & 0x0f;
        let channel = remap_channel(mus_channel);

        let event = match kind {
            0x0 => {
                let note = self.read_u8()?;
                Event::ReleaseNote { channel, note }
            }
            0x1 => {
                let nv = self.read_u8()?;
                let note = nv & 0x7f;
                let velocity = if nv & 0x80 != 0 {
                    Some(self.read_u8()?)
                } else {
                    None
                };
                Event::PlayNote { channel, note, velocity }
            }
            0x2 => {
                let value = self.read_u8()?;
                Event::PitchBend { channel, value }
            }
            0x3 => {
                let code = self.read_u8()?;
                Event::SystemEvent { channel, code }
            }
            0x4 => {
                let controller = self.read_u8()?;
                let value = self.read_u8()?;
                Event::Controller { channel, controller, value }
            }
            0x6 => Event::EndOfScore,
            _ => {
                log::warn!("malformed MUS event: unknown type {kind} at byte {}", self.cursor - 1);
                return None;
            }
        };

        let is_end = matches!(event, Event::EndOfScore);
        let delay_ticks = if last_in_group && !is_end {
            self.read_var_delay()?
        } else {
            0
        };

        Some(Dispatched { event, delay_ticks })
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.cursor)?;
        self.cursor += 1;
        Some(b)
    }

    /// Decodes a variable-length delay: 7 data bits per byte, MSB is the
    /// continuation flag.
    fn read_var_delay(&mut self) -> Option<u32> {
        let mut delay: u32 = 0;
        loop {
            let b = self.read_u8()?;
            delay = (delay << 7) | (b & 0x7f) as u32;
            if b & 0x80 == 0 {
                break;
            }
        }
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(score_len: u16) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(MAGIC);
        h.extend_from_slice(&score_len.to_le_bytes());
        h.extend_from_slice(&(HEADER_LEN as u16).to_le_bytes()); // score_start
        h.extend_from_slice(&16u16.to_le_bytes()); // channels
        h.extend_from_slice(&2u16.to_le_bytes()); // sec_channels
        h.extend_from_slice(&1u16.to_le_bytes()); // instr_count
        h
    }

    #[test]
    fn remaps_percussion_channel() {
        assert_eq!(remap_channel(15), 9);
        assert_eq!(remap_channel(9), 15);
        assert_eq!(remap_channel(3), 3);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = header(1);
        data.push(0x60);
        data[0] = b'X';
        assert!(ScoreReader::new(&data).is_err());
    }

    #[test]
    fn empty_score_yields_no_events() {
        let data = header(0);
        let mut reader = ScoreReader::new(&data).unwrap();
        assert!(reader.next_event().is_none());
    }

    #[test]
    fn decodes_play_note_with_delay_and_end_of_score() {
        let mut data = header(4);
        // last_in_group | type=Play Note(0x1) | channel 0, note 60, no velocity bit, delay=0
        data.push(0b1001_0000);
        data.push(60);
        data.push(0x00); // delay = 0
        data.push(0b0110_0000); // End Of Score, channel irrelevant
        let mut reader = ScoreReader::new(&data).unwrap();

        let first = reader.next_event().unwrap();
        assert_eq!(
            first.event,
            Event::PlayNote { channel: 0, note: 60, velocity: None }
        );
        assert_eq!(first.delay_ticks, 0);

        let second = reader.next_event().unwrap();
        assert_eq!(second.event, Event::EndOfScore);
        assert_eq!(second.delay_ticks, 0);

        assert!(reader.next_event().is_none());
    }

    #[test]
    fn decodes_variable_length_delay() {
        let mut data = header(4);
        // Release Note, channel 0, note 64, last_in_group set, delay = 200 (>127, needs 2 bytes)
        data.push(0b1000_0000);
        data.push(64);
        // 200 = 0b1_1001000 -> high byte 0b0000001 with continuation, low byte 0b1001000
        let hi = (200u32 >> 7) as u8 | 0x80;
        let lo = (200u32 & 0x7f) as u8;
        data.push(hi);
        data.push(lo);
        let mut reader = ScoreReader::new(&data).unwrap();
        let ev = reader.next_event().unwrap();
        assert_eq!(ev.event, Event::ReleaseNote { channel: 0, note: 64 });
        assert_eq!(ev.delay_ticks, 200);
    }

    #[test]
    fn rewind_resets_cursor() {
        let mut data = header(4);
        data.push(0b1001_0000);
        data.push(60);
        data.push(0x00);
        data.push(0b0110_0000);
        let mut reader = ScoreReader::new(&data).unwrap();
        reader.next_event();
        reader.next_event();
        reader.rewind();
        let ev = reader.next_event().unwrap();
        assert_eq!(ev.event, Event::PlayNote { channel: 0, note: 60, velocity: None });
    }
}
