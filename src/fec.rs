//! Forward error correction bridge
//!
//! The session pipes every datagram through a codec on both paths: outbound
//! datagrams may gain parity packets, inbound datagrams may yield extra
//! payloads recovered from parity. The default codec passes datagrams
//! through untouched.

use bytes::Bytes;

/// Per-session FEC codec. Stateful, owned by the session task, never shared.
pub trait FecCodec: Send {
    /// Wrap one outbound datagram, possibly appending parity datagrams.
    fn encode(&mut self, datagram: Bytes) -> Vec<Bytes>;

    /// Unwrap one inbound datagram into engine payloads. The flag marks
    /// payloads that arrived on the wire directly; recovered payloads are
    /// excluded from RTT and remote-window updates.
    fn decode(&mut self, datagram: Bytes) -> Vec<(Bytes, bool)>;
}

/// No-op codec: every datagram is its own payload
#[derive(Debug, Default, Clone)]
pub struct PassthroughFec;

impl FecCodec for PassthroughFec {
    fn encode(&mut self, datagram: Bytes) -> Vec<Bytes> {
        vec![datagram]
    }

    fn decode(&mut self, datagram: Bytes) -> Vec<(Bytes, bool)> {
        vec![(datagram, true)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_is_identity() {
        let mut fec = PassthroughFec;
        let data = Bytes::from_static(b"datagram");

        let out = fec.encode(data.clone());
        assert_eq!(out, vec![data.clone()]);

        let decoded = fec.decode(data.clone());
        assert_eq!(decoded, vec![(data, true)]);
    }
}
