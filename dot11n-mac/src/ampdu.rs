#![forbid(unsafe_code)]

//! A-MPDU framing and sub-frame error model.
//!
//! Each MPDU is preceded by a 4-byte delimiter and padded to a 4-byte boundary:
//! ```text
//! | rsvd (4 bits) | MPDU length (12 bits) | CRC-8 | signature 0x4E |
//! ```
//! A receiver that meets a damaged delimiter steps forward one word and keeps scanning.

use bytes::{BufMut, Bytes, BytesMut};
use dot11n_core::{MacAddr, Tid};
use nom::{
    bytes::complete::tag,
    combinator::verify,
    number::complete::{le_u16, u8 as parse_u8},
    IResult,
};
use rand::Rng;

pub const MPDU_DELIMITER_LEN: usize = 4;
pub const DELIMITER_SIGNATURE: u8 = 0x4E;
/// Largest MPDU a 12-bit delimiter length field can describe.
pub const MAX_MPDU_IN_AMPDU: usize = 0x0FFF;
const ALIGNMENT: usize = 4;

/// Aggregate of MPDUs sent in one PHY transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmpduFrame {
    pub ra: MacAddr,
    pub ta: MacAddr,
    pub tid: Tid,
    /// MCS the aggregate was sized for.
    pub mcs: u8,
    pub num_subframes: usize,
    pub payload: Bytes,
}

impl AmpduFrame {
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

fn padding(len: usize) -> usize {
    (ALIGNMENT - len % ALIGNMENT) % ALIGNMENT
}

/// Delimiter plus MPDU plus padding.
#[must_use]
pub fn subframe_len(mpdu_len: usize) -> usize {
    MPDU_DELIMITER_LEN + mpdu_len + padding(mpdu_len)
}

/// CRC-8 (x^8 + x^2 + x + 1) over the first two delimiter octets.
fn delimiter_crc(bytes: [u8; 2]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in bytes {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
        }
    }
    !crc
}

fn put_delimiter(out: &mut BytesMut, mpdu_len: usize) {
    let word = ((mpdu_len as u16) & 0x0FFF) << 4;
    let raw = word.to_le_bytes();
    out.put_slice(&raw);
    out.put_u8(delimiter_crc(raw));
    out.put_u8(DELIMITER_SIGNATURE);
}

/// Concatenate encoded MPDUs into an A-MPDU payload. The last sub-frame is not padded.
pub fn build_ampdu(mpdus: &[Bytes]) -> Bytes {
    let mut out = BytesMut::with_capacity(mpdus.iter().map(|m| subframe_len(m.len())).sum());
    for (i, mpdu) in mpdus.iter().enumerate() {
        debug_assert!(mpdu.len() <= MAX_MPDU_IN_AMPDU, "MPDU too long for delimiter");
        put_delimiter(&mut out, mpdu.len());
        out.put_slice(mpdu);
        if i + 1 != mpdus.len() {
            out.put_bytes(0, padding(mpdu.len()));
        }
    }
    out.freeze()
}

fn parse_delimiter(input: &[u8]) -> IResult<&[u8], usize> {
    let (rest, word) = le_u16(input)?;
    let (rest, _) = verify(parse_u8, |crc: &u8| *crc == delimiter_crc(word.to_le_bytes()))(rest)?;
    let (rest, _) = tag(&[DELIMITER_SIGNATURE][..])(rest)?;
    Ok((rest, usize::from(word >> 4)))
}

/// Split an A-MPDU payload into MPDUs sharing the payload's allocation. Damaged delimiters
/// and truncated tails are skipped.
#[must_use]
pub fn parse_ampdu(payload: &Bytes) -> Vec<Bytes> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + MPDU_DELIMITER_LEN <= payload.len() {
        match parse_delimiter(&payload[offset..]) {
            Ok((_, len)) if len > 0 && offset + MPDU_DELIMITER_LEN + len <= payload.len() => {
                let start = offset + MPDU_DELIMITER_LEN;
                out.push(payload.slice(start..start + len));
                offset = start + len + padding(len);
            }
            _ => offset += MPDU_DELIMITER_LEN,
        }
    }
    out
}

/// Decides which sub-frames of a received A-MPDU were damaged on air.
pub trait SubframeErrorModel {
    /// Called once per sub-frame, in order, with the sub-frame length in bits and the
    /// channel's bit error rate.
    fn is_corrupted(&mut self, snr_db: f64, bits: usize, ber: f64) -> bool;
}

/// Independent bit errors: a sub-frame survives with probability `(1 - ber)^bits`.
#[derive(Debug)]
pub struct BerErrorModel<'a, R: Rng + ?Sized> {
    rng: &'a mut R,
}

impl<'a, R: Rng + ?Sized> BerErrorModel<'a, R> {
    pub fn new(rng: &'a mut R) -> Self {
        Self { rng }
    }
}

impl<R: Rng + ?Sized> SubframeErrorModel for BerErrorModel<'_, R> {
    fn is_corrupted(&mut self, _snr_db: f64, bits: usize, ber: f64) -> bool {
        let p_ok = (1.0 - ber.clamp(0.0, 1.0)).powf(bits as f64);
        self.rng.gen::<f64>() >= p_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn mpdus() -> Vec<Bytes> {
        vec![Bytes::from(vec![1u8; 30]), Bytes::from(vec![2u8; 7]), Bytes::from(vec![3u8; 1])]
    }

    #[test]
    fn subframes_are_word_aligned() {
        assert_eq!(subframe_len(30), 36);
        assert_eq!(subframe_len(32), 36);
        let payload = build_ampdu(&mpdus());
        assert_eq!(payload.len(), 36 + 12 + 5);
        assert_eq!(payload[3], DELIMITER_SIGNATURE);
        assert_eq!(payload[39], DELIMITER_SIGNATURE);
    }

    #[test]
    fn parse_returns_each_mpdu() {
        let payload = build_ampdu(&mpdus());
        assert_eq!(parse_ampdu(&payload), mpdus());
    }

    #[test]
    fn damaged_delimiter_skips_one_subframe() {
        let mut raw = build_ampdu(&mpdus()).to_vec();
        raw[2] ^= 0xFF;
        let parsed = parse_ampdu(&Bytes::from(raw));
        assert_eq!(parsed, mpdus()[1..].to_vec());
    }

    #[test]
    fn error_free_channel_never_corrupts() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut model = BerErrorModel::new(&mut rng);
        assert!((0..50).all(|_| !model.is_corrupted(30.0, 12_000, 0.0)));
        assert!(model.is_corrupted(0.0, 12_000, 0.5));
    }
}
