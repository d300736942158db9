#![forbid(unsafe_code)]

//! Block Ack action frames (ADDBA request/response, DELBA) and the HT capability element
//! carried by probe frames.

use bytes::{BufMut, Bytes, BytesMut};
use dot11n_core::Tid;
use nom::{
    error::{Error, ErrorKind},
    number::complete::{le_u16, u8 as parse_u8},
    IResult,
};

use crate::block_ack::BaType;
use crate::capability::HtCapabilities;
use crate::sequencer::SeqNum;

/// Action category of block-ack management.
pub const CATEGORY_BLOCK_ACK: u8 = 3;
const ACTION_ADDBA_REQUEST: u8 = 0;
const ACTION_ADDBA_RESPONSE: u8 = 1;
const ACTION_DELBA: u8 = 2;

/// HT capability element identifier.
pub const ELEMENT_HT_CAPABILITIES: u8 = 45;

/// ADDBA status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddbaStatus {
    Success,
    Failure,
}

impl AddbaStatus {
    fn code(self) -> u16 {
        match self {
            AddbaStatus::Success => 0,
            AddbaStatus::Failure => 37,
        }
    }
}

/// DELBA reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelbaReason {
    StaLeaving,
    EndBa,
    UnknownBa,
    Timeout,
}

impl DelbaReason {
    fn code(self) -> u16 {
        match self {
            DelbaReason::StaLeaving => 36,
            DelbaReason::EndBa => 37,
            DelbaReason::UnknownBa => 38,
            DelbaReason::Timeout => 39,
        }
    }

    fn from_code(code: u16) -> Self {
        match code {
            36 => DelbaReason::StaLeaving,
            38 => DelbaReason::UnknownBa,
            39 => DelbaReason::Timeout,
            _ => DelbaReason::EndBa,
        }
    }
}

/// BA parameter set: A-MSDU supported:1, policy:1, TID:4, buffer size:10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaParameters {
    pub amsdu_supported: bool,
    pub ba_type: BaType,
    pub tid: Tid,
    pub buffer_size: u16,
}

impl BaParameters {
    fn to_bits(self) -> u16 {
        u16::from(self.amsdu_supported)
            | (u16::from(self.ba_type == BaType::Immediate) << 1)
            | (u16::from(self.tid.value()) << 2)
            | ((self.buffer_size & 0x03FF) << 6)
    }

    fn from_bits(bits: u16) -> Self {
        Self {
            amsdu_supported: bits & 0x01 != 0,
            ba_type: if bits & 0x02 != 0 { BaType::Immediate } else { BaType::Delayed },
            tid: Tid::from_priority(((bits >> 2) & 0x0F) as u8),
            buffer_size: bits >> 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddbaRequest {
    pub dialog_token: u8,
    pub params: BaParameters,
    /// Agreement timeout in time units (1024 µs).
    pub timeout_tu: u16,
    pub ssn: SeqNum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddbaResponse {
    pub dialog_token: u8,
    pub status: AddbaStatus,
    pub params: BaParameters,
    pub timeout_tu: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delba {
    pub tid: Tid,
    /// Set when the originator of the agreement tears it down.
    pub initiator: bool,
    pub reason: DelbaReason,
}

/// Block-ack category action frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAckAction {
    AddbaRequest(AddbaRequest),
    AddbaResponse(AddbaResponse),
    Delba(Delba),
}

impl BlockAckAction {
    #[must_use]
    pub fn tid(&self) -> Tid {
        match self {
            BlockAckAction::AddbaRequest(r) => r.params.tid,
            BlockAckAction::AddbaResponse(r) => r.params.tid,
            BlockAckAction::Delba(d) => d.tid,
        }
    }
}

pub fn build_action(action: &BlockAckAction) -> Bytes {
    let mut out = BytesMut::with_capacity(11);
    out.put_u8(CATEGORY_BLOCK_ACK);
    match action {
        BlockAckAction::AddbaRequest(req) => {
            out.put_u8(ACTION_ADDBA_REQUEST);
            out.put_u8(req.dialog_token);
            out.put_u16_le(req.params.to_bits());
            out.put_u16_le(req.timeout_tu);
            out.put_u16_le(req.ssn.value() << 4);
        }
        BlockAckAction::AddbaResponse(resp) => {
            out.put_u8(ACTION_ADDBA_RESPONSE);
            out.put_u8(resp.dialog_token);
            out.put_u16_le(resp.status.code());
            out.put_u16_le(resp.params.to_bits());
            out.put_u16_le(resp.timeout_tu);
        }
        BlockAckAction::Delba(delba) => {
            out.put_u8(ACTION_DELBA);
            let params = (u16::from(delba.initiator) << 11) | (u16::from(delba.tid.value()) << 12);
            out.put_u16_le(params);
            out.put_u16_le(delba.reason.code());
        }
    }
    out.freeze()
}

pub fn parse_action(input: &[u8]) -> IResult<&[u8], BlockAckAction> {
    let (input, category) = parse_u8(input)?;
    if category != CATEGORY_BLOCK_ACK {
        return Err(nom::Err::Error(Error::new(input, ErrorKind::Tag)));
    }
    let (input, action) = parse_u8(input)?;
    match action {
        ACTION_ADDBA_REQUEST => {
            let (input, dialog_token) = parse_u8(input)?;
            let (input, params) = le_u16(input)?;
            let (input, timeout_tu) = le_u16(input)?;
            let (input, ssc) = le_u16(input)?;
            Ok((
                input,
                BlockAckAction::AddbaRequest(AddbaRequest {
                    dialog_token,
                    params: BaParameters::from_bits(params),
                    timeout_tu,
                    ssn: SeqNum::new(ssc >> 4),
                }),
            ))
        }
        ACTION_ADDBA_RESPONSE => {
            let (input, dialog_token) = parse_u8(input)?;
            let (input, status) = le_u16(input)?;
            let (input, params) = le_u16(input)?;
            let (input, timeout_tu) = le_u16(input)?;
            Ok((
                input,
                BlockAckAction::AddbaResponse(AddbaResponse {
                    dialog_token,
                    status: if status == 0 { AddbaStatus::Success } else { AddbaStatus::Failure },
                    params: BaParameters::from_bits(params),
                    timeout_tu,
                }),
            ))
        }
        ACTION_DELBA => {
            let (input, params) = le_u16(input)?;
            let (input, reason) = le_u16(input)?;
            Ok((
                input,
                BlockAckAction::Delba(Delba {
                    tid: Tid::from_priority((params >> 12) as u8),
                    initiator: params & 0x0800 != 0,
                    reason: DelbaReason::from_code(reason),
                }),
            ))
        }
        _ => Err(nom::Err::Error(Error::new(input, ErrorKind::Switch))),
    }
}

const HT_FLAG_BIG_AMSDU: u8 = 0x01;
const HT_FLAG_IMMEDIATE_BA: u8 = 0x02;
const HT_FLAG_DELAYED_BA: u8 = 0x04;
const HT_FLAG_RIFS: u8 = 0x08;

/// HT capability element: | id | len=3 | max MCS | flags | A-MPDU length exponent |
pub fn build_ht_capabilities(caps: &HtCapabilities) -> Bytes {
    let mut flags = 0u8;
    if caps.big_amsdu {
        flags |= HT_FLAG_BIG_AMSDU;
    }
    if caps.immediate_ba {
        flags |= HT_FLAG_IMMEDIATE_BA;
    }
    if caps.delayed_ba {
        flags |= HT_FLAG_DELAYED_BA;
    }
    if caps.rifs {
        flags |= HT_FLAG_RIFS;
    }
    Bytes::from(vec![ELEMENT_HT_CAPABILITIES, 3, caps.max_mcs_index, flags, caps.ampdu_length_exponent])
}

/// Scan a probe body for the HT capability element; `None` when the peer is not HT-capable.
pub fn parse_ht_capabilities(mut input: &[u8]) -> IResult<&[u8], Option<HtCapabilities>> {
    while !input.is_empty() {
        let (rest, id) = parse_u8(input)?;
        let (rest, len) = parse_u8(rest)?;
        let (rest, body) = nom::bytes::complete::take(len)(rest)?;
        if id == ELEMENT_HT_CAPABILITIES && body.len() >= 3 {
            let flags = body[1];
            return Ok((
                rest,
                Some(HtCapabilities {
                    max_mcs_index: body[0],
                    big_amsdu: flags & HT_FLAG_BIG_AMSDU != 0,
                    immediate_ba: flags & HT_FLAG_IMMEDIATE_BA != 0,
                    delayed_ba: flags & HT_FLAG_DELAYED_BA != 0,
                    rifs: flags & HT_FLAG_RIFS != 0,
                    ampdu_length_exponent: body[2].min(3),
                }),
            ));
        }
        input = rest;
    }
    Ok((input, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BaParameters {
        BaParameters { amsdu_supported: true, ba_type: BaType::Immediate, tid: Tid::from_priority(5), buffer_size: 64 }
    }

    #[test]
    fn addba_request_layout() {
        let req = BlockAckAction::AddbaRequest(AddbaRequest {
            dialog_token: 7,
            params: params(),
            timeout_tu: 488,
            ssn: SeqNum::new(100),
        });
        let bytes = build_action(&req);
        assert_eq!(bytes.len(), 9);
        assert_eq!(&bytes[..3], &[CATEGORY_BLOCK_ACK, 0, 7]);
        // amsdu=1, immediate=1, tid=5, buffer=64
        assert_eq!(u16::from_le_bytes([bytes[3], bytes[4]]), 0x1017);
        let (rest, parsed) = parse_action(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, req);
    }

    #[test]
    fn delba_carries_initiator_and_reason() {
        let delba = BlockAckAction::Delba(Delba { tid: Tid::from_priority(2), initiator: true, reason: DelbaReason::Timeout });
        let (_, parsed) = parse_action(&build_action(&delba)).unwrap();
        assert_eq!(parsed, delba);
        assert_eq!(parsed.tid().value(), 2);
    }

    #[test]
    fn rejects_other_categories() {
        assert!(parse_action(&[4, 0, 0]).is_err());
        assert!(parse_action(&[CATEGORY_BLOCK_ACK, 9]).is_err());
    }

    #[test]
    fn ht_capability_element_is_found_among_others() {
        let caps = HtCapabilities {
            max_mcs_index: 15,
            big_amsdu: true,
            immediate_ba: true,
            delayed_ba: false,
            rifs: true,
            ampdu_length_exponent: 2,
        };
        let mut body = vec![0u8, 2, b'n', b'x'];
        body.extend_from_slice(&build_ht_capabilities(&caps));
        let (_, parsed) = parse_ht_capabilities(&body).unwrap();
        assert_eq!(parsed, Some(caps));
        assert_eq!(parse_ht_capabilities(&[0, 1, 9]).unwrap().1, None);
    }
}
