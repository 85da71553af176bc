//! ARQ wire types, constants, and sequence/time arithmetic

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol constants
pub mod consts {
    pub const RTO_NDL: u32 = 30; // no delay min rto
    pub const RTO_MIN: u32 = 100; // normal min rto
    pub const RTO_DEF: u32 = 200; // default rto
    pub const RTO_MAX: u32 = 60000; // max rto
    pub const CMD_PUSH: u8 = 81; // cmd: push data
    pub const CMD_ACK: u8 = 82; // cmd: ack
    pub const CMD_WASK: u8 = 83; // cmd: window probe (ask)
    pub const CMD_WINS: u8 = 84; // cmd: window size (tell)
    pub const ASK_SEND: u32 = 1; // need to send CMD_WASK
    pub const ASK_TELL: u32 = 2; // need to send CMD_WINS
    pub const WND_SND: u32 = 32; // default send window
    pub const WND_RCV: u32 = 32; // default receive window
    pub const MTU_DEF: u32 = 1400; // default mtu
    pub const MTU_MIN: u32 = 50; // minimum mtu
    pub const INTERVAL: u32 = 100; // default update interval
    pub const OVERHEAD: u32 = 24; // segment header overhead
    pub const DEADLINK: u32 = 20; // max retransmits before dead link
    pub const THRESH_INIT: u32 = 2; // initial slow start threshold
    pub const THRESH_MIN: u32 = 2; // min slow start threshold
    pub const PROBE_INIT: u32 = 7000; // 7 secs to probe window size
    pub const PROBE_LIMIT: u32 = 120000; // up to 120 secs to probe window
    pub const FRG_LIMIT: usize = 255; // max fragments per message
}

/// Conversation ID distinguishing sessions sharing a socket
pub type ConvId = u32;

/// Sequence number type
pub type SeqNum = u32;

/// Millisecond timestamp type
pub type Timestamp = u32;

/// Segment header, 24 bytes little-endian on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentHeader {
    pub conv: ConvId,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: Timestamp,
    pub sn: SeqNum,
    pub una: SeqNum,
    pub len: u32,
}

impl SegmentHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 24;

    pub fn new(conv: ConvId, cmd: u8) -> Self {
        Self {
            conv,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            len: 0,
        }
    }

    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    /// Decode header from buffer, advancing it past the header bytes
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            conv: buf.get_u32_le(),
            cmd: buf.get_u8(),
            frg: buf.get_u8(),
            wnd: buf.get_u16_le(),
            ts: buf.get_u32_le(),
            sn: buf.get_u32_le(),
            una: buf.get_u32_le(),
            len: buf.get_u32_le(),
        })
    }

    pub fn cmd_str(&self) -> &'static str {
        match self.cmd {
            consts::CMD_PUSH => "PUSH",
            consts::CMD_ACK => "ACK",
            consts::CMD_WASK => "WASK",
            consts::CMD_WINS => "WINS",
            _ => "UNKNOWN",
        }
    }
}

/// One ARQ segment: header, payload, retransmission bookkeeping
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: SegmentHeader,
    pub data: Bytes,

    // retransmission state, never serialized
    pub resendts: Timestamp,
    pub rto: u32,
    pub fastack: u32,
    pub xmit: u32,
}

impl Segment {
    pub fn new(conv: ConvId, cmd: u8, data: Bytes) -> Self {
        let mut header = SegmentHeader::new(conv, cmd);
        header.len = data.len() as u32;

        Self {
            header,
            data,
            resendts: 0,
            rto: consts::RTO_DEF,
            fastack: 0,
            xmit: 0,
        }
    }

    pub fn push(conv: ConvId, sn: SeqNum, data: Bytes) -> Self {
        let mut seg = Self::new(conv, consts::CMD_PUSH, data);
        seg.header.sn = sn;
        seg
    }

    pub fn ack(conv: ConvId, sn: SeqNum, ts: Timestamp) -> Self {
        let mut seg = Self::new(conv, consts::CMD_ACK, Bytes::new());
        seg.header.sn = sn;
        seg.header.ts = ts;
        seg
    }

    /// Encode header and payload into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        buf.extend_from_slice(&self.data);
    }

    /// Total size on the wire
    pub fn size(&self) -> usize {
        SegmentHeader::SIZE + self.data.len()
    }
}

/// Wrapping-safe time difference in milliseconds
#[inline]
pub fn time_diff(later: Timestamp, earlier: Timestamp) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// `seq1 < seq2` under sequence-number wrapping
#[inline]
pub fn seq_before(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// `seq1 > seq2` under sequence-number wrapping
#[inline]
pub fn seq_after(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = SegmentHeader {
            conv: 0xDEAD_BEEF,
            cmd: consts::CMD_PUSH,
            frg: 3,
            wnd: 17,
            ts: 123456,
            sn: 42,
            una: 40,
            len: 5,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), SegmentHeader::SIZE);

        let mut bytes = buf.freeze();
        let decoded = SegmentHeader::decode(&mut bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(bytes.is_empty());
    }

    #[test]
    fn header_too_short() {
        let mut bytes = Bytes::from_static(&[0u8; 23]);
        assert!(SegmentHeader::decode(&mut bytes).is_none());
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let mut header = SegmentHeader::new(1, consts::CMD_ACK);
        header.wnd = 0x0201;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(&buf[0..4], &[1, 0, 0, 0]);
        assert_eq!(buf[4], consts::CMD_ACK);
        assert_eq!(&buf[6..8], &[0x01, 0x02]);
    }

    #[test]
    fn seq_comparison_wraps() {
        assert!(seq_before(u32::MAX, 0));
        assert!(seq_after(0, u32::MAX));
        assert!(!seq_before(5, 5));
        assert!(!seq_after(5, 5));
    }
}
