#![forbid(unsafe_code)]

//! Block Ack Request and compressed Block Ack bodies.
//!
//! Layout (little-endian):
//! ```text
//! BAR:  | BAR control (2) | starting seq control (2) |
//! BA:   | BA control (2)  | starting seq control (2) | bitmap (8) |
//! ```
//! Control field: bit 0 = no-ack (immediate), bit 2 = compressed bitmap, bits 12-15 = TID.
//! Bitmap bit `i` acknowledges sequence number `ssn + i`.

use bytes::{BufMut, Bytes, BytesMut};
use dot11n_core::Tid;
use nom::{
    bytes::complete::take,
    number::complete::le_u16,
    IResult,
};

use crate::sequencer::SeqNum;

/// Compressed bitmap length in bytes.
pub const BLOCK_ACK_BITMAP_SIZE: usize = 8;
/// Sequence slots covered by one bitmap.
pub const BLOCK_ACK_WINDOW: u16 = (BLOCK_ACK_BITMAP_SIZE * 8) as u16;

const CTRL_NO_ACK: u16 = 0x0001;
const CTRL_COMPRESSED: u16 = 0x0004;

fn control_bits(tid: Tid, no_ack: bool) -> u16 {
    (u16::from(tid.value()) << 12) | CTRL_COMPRESSED | if no_ack { CTRL_NO_ACK } else { 0 }
}

/// Block Ack Request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAckRequest {
    pub tid: Tid,
    pub ssn: SeqNum,
    /// Set for immediate agreements: the recipient answers with a BA instead of an ACK.
    pub no_ack: bool,
}

/// Block Ack body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAck {
    pub tid: Tid,
    pub ssn: SeqNum,
    pub bitmap: u64,
    pub no_ack: bool,
}

impl BlockAck {
    /// Whether position `pos` (sequence `ssn + pos`) is acknowledged.
    #[must_use]
    pub fn is_acked(&self, pos: u16) -> bool {
        pos < BLOCK_ACK_WINDOW && self.bitmap & (1u64 << pos) != 0
    }

    #[must_use]
    pub fn acked_count(&self) -> u32 {
        self.bitmap.count_ones()
    }
}

pub fn build_bar(bar: &BlockAckRequest) -> Bytes {
    let mut out = BytesMut::with_capacity(4);
    out.put_u16_le(control_bits(bar.tid, bar.no_ack));
    out.put_u16_le(bar.ssn.value() << 4);
    out.freeze()
}

pub fn parse_bar(input: &[u8]) -> IResult<&[u8], BlockAckRequest> {
    let (input, ctrl) = le_u16(input)?;
    let (input, ssc) = le_u16(input)?;
    Ok((
        input,
        BlockAckRequest {
            tid: Tid::from_priority((ctrl >> 12) as u8),
            ssn: SeqNum::new(ssc >> 4),
            no_ack: ctrl & CTRL_NO_ACK != 0,
        },
    ))
}

pub fn build_block_ack(ba: &BlockAck) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + BLOCK_ACK_BITMAP_SIZE);
    out.put_u16_le(control_bits(ba.tid, ba.no_ack));
    out.put_u16_le(ba.ssn.value() << 4);
    out.put_u64_le(ba.bitmap);
    out.freeze()
}

pub fn parse_block_ack(input: &[u8]) -> IResult<&[u8], BlockAck> {
    let (input, ctrl) = le_u16(input)?;
    let (input, ssc) = le_u16(input)?;
    let (input, raw) = take(BLOCK_ACK_BITMAP_SIZE)(input)?;
    let mut bitmap = [0u8; BLOCK_ACK_BITMAP_SIZE];
    bitmap.copy_from_slice(raw);
    Ok((
        input,
        BlockAck {
            tid: Tid::from_priority((ctrl >> 12) as u8),
            ssn: SeqNum::new(ssc >> 4),
            bitmap: u64::from_le_bytes(bitmap),
            no_ack: ctrl & CTRL_NO_ACK != 0,
        },
    ))
}
