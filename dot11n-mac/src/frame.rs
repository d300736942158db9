#![forbid(unsafe_code)]

//! MAC frame model and MPDU header parsing.
//!
//! Header layout (little-endian multi-byte fields):
//! ```text
//! +-------+----------+-----+-----+-------+---------+-----+
//! | FC(2) | Dur(2)   | A1  | A2  | A3    | SeqCtl  | QoS |
//! +-------+----------+-----+-----+-------+---------+-----+
//! ```
//! ACK and CTS carry only A1; RTS, BAR and BA carry A1 and A2; management and data frames
//! carry all three addresses and the sequence control field; QoS data adds the QoS control.

use bitflags::bitflags;
use bytes::Bytes;
use dot11n_core::{MacAddr, SimTime, Tid};
use nom::{
    bytes::complete::take,
    combinator::map,
    number::complete::{le_u16, u8 as parse_u8},
    IResult,
};

use crate::sequencer::SeqNum;

/// Bytes of frame check sequence appended on air.
pub const FCS_LEN: usize = 4;
/// Frame control + duration.
const FC_DURATION_LEN: usize = 4;
const ADDR_LEN: usize = 6;

bitflags! {
    /// Flags octet of the frame control field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const TO_DS = 0x01;
        const FROM_DS = 0x02;
        const MORE_FRAGMENTS = 0x04;
        const RETRY = 0x08;
        const POWER_MGMT = 0x10;
        const MORE_DATA = 0x20;
        const PROTECTED = 0x40;
        const ORDER = 0x80;
    }
}

/// Frame kinds handled by the MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    QosData,
    ProbeRequest,
    ProbeResponse,
    Action,
    BlockAckRequest,
    BlockAck,
    Rts,
    Cts,
    Ack,
}

impl FrameKind {
    /// (type, subtype) of the frame control field.
    #[must_use]
    pub fn type_subtype(self) -> (u8, u8) {
        match self {
            FrameKind::ProbeRequest => (0, 4),
            FrameKind::ProbeResponse => (0, 5),
            FrameKind::Action => (0, 13),
            FrameKind::BlockAckRequest => (1, 8),
            FrameKind::BlockAck => (1, 9),
            FrameKind::Rts => (1, 11),
            FrameKind::Cts => (1, 12),
            FrameKind::Ack => (1, 13),
            FrameKind::Data => (2, 0),
            FrameKind::QosData => (2, 8),
        }
    }

    #[must_use]
    pub fn from_type_subtype(ty: u8, subtype: u8) -> Option<Self> {
        Some(match (ty, subtype) {
            (0, 4) => FrameKind::ProbeRequest,
            (0, 5) => FrameKind::ProbeResponse,
            (0, 13) => FrameKind::Action,
            (1, 8) => FrameKind::BlockAckRequest,
            (1, 9) => FrameKind::BlockAck,
            (1, 11) => FrameKind::Rts,
            (1, 12) => FrameKind::Cts,
            (1, 13) => FrameKind::Ack,
            (2, 0) => FrameKind::Data,
            (2, 8) => FrameKind::QosData,
            _ => return None,
        })
    }

    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(self, FrameKind::Data | FrameKind::QosData)
    }

    #[must_use]
    pub fn is_management(self) -> bool {
        self.type_subtype().0 == 0
    }

    #[must_use]
    pub fn is_control(self) -> bool {
        self.type_subtype().0 == 1
    }

    /// MAC header length for this kind.
    #[must_use]
    pub fn header_len(self) -> usize {
        match self {
            FrameKind::Ack | FrameKind::Cts => FC_DURATION_LEN + ADDR_LEN,
            FrameKind::Rts | FrameKind::BlockAckRequest | FrameKind::BlockAck => FC_DURATION_LEN + 2 * ADDR_LEN,
            FrameKind::QosData => FC_DURATION_LEN + 3 * ADDR_LEN + 2 + 2,
            _ => FC_DURATION_LEN + 3 * ADDR_LEN + 2,
        }
    }

    fn has_ta(self) -> bool {
        !matches!(self, FrameKind::Ack | FrameKind::Cts)
    }

    fn has_seq(self) -> bool {
        self.is_data() || self.is_management()
    }
}

/// Lifecycle of a queued frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Fresh,
    AwaitingAck,
    Acked,
}

/// QoS ack policy field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    Normal = 0,
    NoAck = 1,
    NoExplicit = 2,
    BlockAck = 3,
}

impl AckPolicy {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => AckPolicy::Normal,
            1 => AckPolicy::NoAck,
            2 => AckPolicy::NoExplicit,
            _ => AckPolicy::BlockAck,
        }
    }
}

/// QoS control field: TID:4, EOSP:1, AckPolicy:2, A-MSDU present:1, TXOP:8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosControl {
    pub tid: Tid,
    pub eosp: bool,
    pub ack_policy: AckPolicy,
    pub amsdu_present: bool,
    pub txop: u8,
}

impl QosControl {
    #[must_use]
    pub fn to_bits(&self) -> u16 {
        u16::from(self.tid.value())
            | (u16::from(self.eosp) << 4)
            | ((self.ack_policy as u16) << 5)
            | (u16::from(self.amsdu_present) << 7)
            | (u16::from(self.txop) << 8)
    }

    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self {
            tid: Tid::from_priority((bits & 0x0F) as u8),
            eosp: bits & 0x10 != 0,
            ack_policy: AckPolicy::from_bits((bits >> 5) as u8),
            amsdu_present: bits & 0x80 != 0,
            txop: (bits >> 8) as u8,
        }
    }
}

/// Parsed MPDU header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpduHeader {
    pub kind: FrameKind,
    pub flags: FrameFlags,
    pub duration_us: u16,
    pub ra: MacAddr,
    pub ta: Option<MacAddr>,
    pub addr3: Option<MacAddr>,
    pub seq: Option<SeqNum>,
    pub qos: Option<QosControl>,
}

/// A frame owned by exactly one MAC container at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacFrame {
    pub kind: FrameKind,
    pub flags: FrameFlags,
    /// Receiver (next hop).
    pub ra: MacAddr,
    /// Transmitter (this hop).
    pub ta: MacAddr,
    /// Third address: final destination of data frames, BSSID of management frames.
    pub addr3: MacAddr,
    pub tid: Option<Tid>,
    pub seq: Option<SeqNum>,
    pub ack_policy: AckPolicy,
    pub state: FrameState,
    pub is_amsdu: bool,
    pub is_ampdu: bool,
    pub ba_active: bool,
    pub inserted_at: SimTime,
    pub body: Bytes,
}

impl MacFrame {
    /// QoS data frame carrying one MSDU.
    #[must_use]
    pub fn qos_data(ra: MacAddr, ta: MacAddr, tid: Tid, body: Bytes, now: SimTime) -> Self {
        Self {
            kind: FrameKind::QosData,
            flags: FrameFlags::empty(),
            ra,
            ta,
            addr3: ra,
            tid: Some(tid),
            seq: None,
            ack_policy: if ra.is_group() { AckPolicy::NoAck } else { AckPolicy::Normal },
            state: FrameState::Fresh,
            is_amsdu: false,
            is_ampdu: false,
            ba_active: false,
            inserted_at: now,
            body,
        }
    }

    /// Management or control frame with an already encoded body.
    #[must_use]
    pub fn new(kind: FrameKind, ra: MacAddr, ta: MacAddr, body: Bytes, now: SimTime) -> Self {
        Self {
            kind,
            flags: FrameFlags::empty(),
            ra,
            ta,
            addr3: ta,
            tid: None,
            seq: None,
            ack_policy: if ra.is_group() { AckPolicy::NoAck } else { AckPolicy::Normal },
            state: FrameState::Fresh,
            is_amsdu: false,
            is_ampdu: false,
            ba_active: false,
            inserted_at: now,
            body,
        }
    }

    /// Rebuild a frame from its parsed header and body.
    #[must_use]
    pub fn from_header(hdr: MpduHeader, body: Bytes, now: SimTime) -> Self {
        let qos = hdr.qos;
        Self {
            kind: hdr.kind,
            flags: hdr.flags,
            ra: hdr.ra,
            ta: hdr.ta.unwrap_or(MacAddr::ZERO),
            addr3: hdr.addr3.unwrap_or(hdr.ra),
            tid: qos.map(|q| q.tid),
            seq: hdr.seq,
            ack_policy: qos.map_or(AckPolicy::Normal, |q| q.ack_policy),
            state: FrameState::Fresh,
            is_amsdu: qos.is_some_and(|q| q.amsdu_present),
            is_ampdu: false,
            ba_active: qos.is_some_and(|q| q.ack_policy == AckPolicy::BlockAck),
            inserted_at: now,
            body,
        }
    }

    /// Payload bytes counted by the aggregation buffers.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.body.len()
    }

    /// Length on air including header and FCS.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kind.header_len() + self.body.len() + FCS_LEN
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        self.ra.is_group()
    }

    #[must_use]
    pub fn qos_control(&self) -> Option<QosControl> {
        let tid = self.tid?;
        (self.kind == FrameKind::QosData).then_some(QosControl {
            tid,
            eosp: false,
            ack_policy: self.ack_policy,
            amsdu_present: self.is_amsdu,
            txop: 0,
        })
    }

    #[must_use]
    pub fn header(&self) -> MpduHeader {
        MpduHeader {
            kind: self.kind,
            flags: self.flags,
            duration_us: 0,
            ra: self.ra,
            ta: self.kind.has_ta().then_some(self.ta),
            addr3: self.kind.has_seq().then_some(self.addr3),
            seq: if self.kind.has_seq() { Some(self.seq.unwrap_or(SeqNum::ZERO)) } else { None },
            qos: self.qos_control(),
        }
    }
}

fn parse_addr(input: &[u8]) -> IResult<&[u8], MacAddr> {
    map(take(ADDR_LEN), |b: &[u8]| {
        let mut out = [0u8; ADDR_LEN];
        out.copy_from_slice(b);
        MacAddr(out)
    })(input)
}

/// Parse an MPDU header; the remaining input is the frame body.
pub fn parse_mpdu_header(input: &[u8]) -> IResult<&[u8], MpduHeader> {
    let (input, fc0) = parse_u8(input)?;
    let (input, fc1) = parse_u8(input)?;
    let ty = (fc0 >> 2) & 0x03;
    let subtype = fc0 >> 4;
    let kind = FrameKind::from_type_subtype(ty, subtype)
        .ok_or_else(|| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Switch)))?;
    let flags = FrameFlags::from_bits_truncate(fc1);
    let (input, duration_us) = le_u16(input)?;
    let (input, ra) = parse_addr(input)?;
    let (input, ta) = if kind.has_ta() {
        let (i, a) = parse_addr(input)?;
        (i, Some(a))
    } else {
        (input, None)
    };
    let (input, addr3, seq) = if kind.has_seq() {
        let (i, a3) = parse_addr(input)?;
        let (i, seq_ctl) = le_u16(i)?;
        (i, Some(a3), Some(SeqNum::new(seq_ctl >> 4)))
    } else {
        (input, None, None)
    };
    let (input, qos) = if kind == FrameKind::QosData {
        let (i, bits) = le_u16(input)?;
        (i, Some(QosControl::from_bits(bits)))
    } else {
        (input, None)
    };
    Ok((input, MpduHeader { kind, flags, duration_us, ra, ta, addr3, seq, qos }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::encode_mpdu;

    #[test]
    fn qos_control_bits() {
        let qc = QosControl {
            tid: Tid::from_priority(5),
            eosp: false,
            ack_policy: AckPolicy::BlockAck,
            amsdu_present: true,
            txop: 0x12,
        };
        assert_eq!(qc.to_bits(), 0x12E5);
        assert_eq!(QosControl::from_bits(0x12E5), qc);
    }

    #[test]
    fn parses_encoded_qos_data() {
        let mut frame = MacFrame::qos_data(
            MacAddr::from_node(2),
            MacAddr::from_node(1),
            Tid::from_priority(6),
            Bytes::from_static(b"payload"),
            SimTime::ZERO,
        );
        frame.seq = Some(SeqNum::new(4095));
        let wire = encode_mpdu(&frame);
        assert_eq!(wire.len(), FrameKind::QosData.header_len() + 7);
        let (body, hdr) = parse_mpdu_header(&wire).expect("parse");
        assert_eq!(body, b"payload");
        assert_eq!(hdr.kind, FrameKind::QosData);
        assert_eq!(hdr.seq, Some(SeqNum::new(4095)));
        assert_eq!(hdr.ta, Some(MacAddr::from_node(1)));
        assert_eq!(hdr.qos.map(|q| q.tid.value()), Some(6));
    }

    #[test]
    fn ack_header_has_only_receiver() {
        let ack = MacFrame::new(FrameKind::Ack, MacAddr::from_node(9), MacAddr::from_node(1), Bytes::new(), SimTime::ZERO);
        assert_eq!(ack.len(), 14);
        let wire = encode_mpdu(&ack);
        let (rest, hdr) = parse_mpdu_header(&wire).expect("parse");
        assert!(rest.is_empty());
        assert_eq!(hdr.ta, None);
        assert_eq!(hdr.ra, MacAddr::from_node(9));
    }

    #[test]
    fn qos_overhead_matches_header_and_fcs() {
        assert_eq!(FrameKind::QosData.header_len() + FCS_LEN, dot11n_core::config::QOS_MPDU_OVERHEAD);
    }

    #[test]
    fn rejects_unknown_subtype() {
        // type 3 is reserved
        assert!(parse_mpdu_header(&[0x0C, 0x00, 0, 0, 1, 2, 3, 4, 5, 6]).is_err());
    }
}
