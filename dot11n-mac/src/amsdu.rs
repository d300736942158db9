#![forbid(unsafe_code)]

//! A-MSDU sub-frame codec.
//!
//! ```text
//! | DA (6) | SA (6) | length (2, big-endian) | MSDU | pad to 4 |
//! ```
//! Every sub-frame except the last is padded so the next one starts on a 4-byte boundary.

use bytes::{BufMut, Bytes, BytesMut};
use dot11n_core::MacAddr;
use nom::{bytes::complete::take, number::complete::be_u16, IResult};

pub const AMSDU_SUBFRAME_HEADER_LEN: usize = 14;
const AMSDU_ALIGNMENT: usize = 4;

/// One MSDU inside an A-MSDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmsduSubframe {
    pub da: MacAddr,
    pub sa: MacAddr,
    pub msdu: Bytes,
}

fn padding(len: usize) -> usize {
    (AMSDU_ALIGNMENT - len % AMSDU_ALIGNMENT) % AMSDU_ALIGNMENT
}

/// Bytes a sub-frame carrying `msdu_len` occupies; the last sub-frame carries no padding.
#[must_use]
pub fn subframe_len(msdu_len: usize, last: bool) -> usize {
    let raw = AMSDU_SUBFRAME_HEADER_LEN + msdu_len;
    if last { raw } else { raw + padding(raw) }
}

pub fn build_amsdu(subframes: &[AmsduSubframe]) -> Bytes {
    let total: usize = subframes
        .iter()
        .enumerate()
        .map(|(i, s)| subframe_len(s.msdu.len(), i + 1 == subframes.len()))
        .sum();
    let mut out = BytesMut::with_capacity(total);
    for (i, sub) in subframes.iter().enumerate() {
        out.put_slice(&sub.da.0);
        out.put_slice(&sub.sa.0);
        out.put_u16(sub.msdu.len() as u16);
        out.put_slice(&sub.msdu);
        if i + 1 != subframes.len() {
            out.put_bytes(0, padding(AMSDU_SUBFRAME_HEADER_LEN + sub.msdu.len()));
        }
    }
    out.freeze()
}

fn parse_subframe(input: &[u8]) -> IResult<&[u8], (MacAddr, MacAddr, &[u8])> {
    let (input, da) = take(6usize)(input)?;
    let (input, sa) = take(6usize)(input)?;
    let (input, len) = be_u16(input)?;
    let (input, msdu) = take(len)(input)?;
    let mut d = [0u8; 6];
    let mut s = [0u8; 6];
    d.copy_from_slice(da);
    s.copy_from_slice(sa);
    Ok((input, (MacAddr(d), MacAddr(s), msdu)))
}

/// Split an A-MSDU body into its sub-frames. MSDUs share the body's allocation.
pub fn parse_amsdu(body: &Bytes) -> Result<Vec<AmsduSubframe>, nom::Err<nom::error::Error<&[u8]>>> {
    let mut rest: &[u8] = body;
    let mut out = Vec::new();
    while !rest.is_empty() {
        let (after, (da, sa, msdu)) = parse_subframe(rest)?;
        out.push(AmsduSubframe { da, sa, msdu: body.slice_ref(msdu) });
        let pad = padding(AMSDU_SUBFRAME_HEADER_LEN + msdu.len()).min(after.len());
        rest = &after[pad..];
    }
    Ok(out)
}
