#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{MacFrame, MpduHeader};

/// Serialize an MPDU header.
pub fn build_mpdu_header(hdr: &MpduHeader, out: &mut BytesMut) {
    let (ty, subtype) = hdr.kind.type_subtype();
    out.put_u8((ty << 2) | (subtype << 4));
    out.put_u8(hdr.flags.bits());
    out.put_u16_le(hdr.duration_us);
    out.put_slice(&hdr.ra.0);
    if let Some(ta) = hdr.ta {
        out.put_slice(&ta.0);
    }
    if let Some(addr3) = hdr.addr3 {
        out.put_slice(&addr3.0);
    }
    if let Some(seq) = hdr.seq {
        out.put_u16_le(seq.value() << 4);
    }
    if let Some(qos) = hdr.qos {
        out.put_u16_le(qos.to_bits());
    }
}

/// Header followed by body; the FCS is not materialised.
pub fn encode_mpdu(frame: &MacFrame) -> Bytes {
    let hdr = frame.header();
    let mut out = BytesMut::with_capacity(frame.kind.header_len() + frame.body.len());
    build_mpdu_header(&hdr, &mut out);
    out.put_slice(&frame.body);
    out.freeze()
}
