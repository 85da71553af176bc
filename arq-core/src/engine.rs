//! ARQ protocol engine core
//!
//! Pure state machine: no sockets, no clocks, no tasks. Callers feed raw
//! datagrams through [`ArqEngine::input`], push application messages through
//! [`ArqEngine::send`], drive timing with [`ArqEngine::update`] (explicit
//! millisecond timestamps), and pull outbound datagrams from
//! [`ArqEngine::drain_output`].

use crate::config::ArqConfig;
use crate::error::{ArqError, ArqResult};
use crate::protocol::*;

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// RTT estimator state (RFC 6298 style)
#[derive(Debug, Default)]
struct RttState {
    srtt: i32,    // smoothed RTT
    rttvar: i32,  // RTT variance
    rto: u32,     // current retransmission timeout
    min_rto: u32, // floor for the RTO
}

/// Window control state
#[derive(Debug)]
struct WindowState {
    snd: u32,      // configured send window
    rcv: u32,      // configured receive window
    rmt: u32,      // remote's advertised free window
    cwnd: u32,     // congestion window
    ssthresh: u32, // slow start threshold
    incr: u32,     // byte-granular cwnd increment accumulator
}

/// Zero-window probe state
#[derive(Debug, Default)]
struct ProbeState {
    flags: u32,
    wait: u32,
    ts: Timestamp,
}

/// Counters exposed for observability
#[derive(Debug, Default, Clone)]
pub struct ArqStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub retransmissions: u64,
    pub fast_retransmissions: u64,
    pub srtt: u32,
    pub rto: u32,
    pub cwnd: u32,
}

/// ARQ control block for one conversation.
///
/// Mutated only by the single task that owns the session; the engine itself
/// is not synchronized.
pub struct ArqEngine {
    conv: ConvId,
    config: ArqConfig,
    mtu: u32,
    mss: u32,

    // window bounds
    snd_una: SeqNum,
    snd_nxt: SeqNum,
    rcv_nxt: SeqNum,

    rtt: RttState,
    wnd: WindowState,
    probe: ProbeState,

    // segment containers
    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    acklist: Vec<(SeqNum, Timestamp)>,

    // flush scheduling
    current: Timestamp,
    ts_flush: Timestamp,
    updated: bool,

    // outbound datagrams, staged at mtu granularity
    buffer: BytesMut,
    output: VecDeque<Bytes>,

    dead: bool,
    stats: ArqStats,
}

impl ArqEngine {
    /// Create a control block. `conv` must match on both endpoints.
    pub fn new(conv: ConvId, config: ArqConfig) -> ArqResult<Self> {
        config.validate()?;

        let min_rto = if config.nodelay.nodelay {
            consts::RTO_NDL
        } else {
            consts::RTO_MIN
        };
        let mtu = config.mtu;
        let interval = config.effective_interval();

        Ok(Self {
            conv,
            mtu,
            mss: mtu - consts::OVERHEAD,

            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,

            rtt: RttState {
                srtt: 0,
                rttvar: 0,
                rto: consts::RTO_DEF,
                min_rto,
            },
            wnd: WindowState {
                snd: config.snd_wnd,
                rcv: config.rcv_wnd,
                rmt: consts::WND_RCV,
                cwnd: 1,
                ssthresh: consts::THRESH_INIT,
                incr: 0,
            },
            probe: ProbeState::default(),

            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),

            current: 0,
            ts_flush: interval,
            updated: false,

            buffer: BytesMut::with_capacity((mtu + consts::OVERHEAD) as usize),
            output: VecDeque::new(),

            dead: false,
            stats: ArqStats::default(),

            config,
        })
    }

    pub fn conv(&self) -> ConvId {
        self.conv
    }

    /// Maximum segment size (mtu - overhead)
    pub fn mss(&self) -> u32 {
        self.mss
    }

    /// True once a segment exceeded the dead-link retransmit threshold.
    /// Terminal; the owning session must close.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn stats(&self) -> &ArqStats {
        &self.stats
    }

    /// Segments waiting to be sent or acked
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// Take all staged outbound datagrams
    pub fn drain_output(&mut self) -> std::collections::vec_deque::Drain<'_, Bytes> {
        self.output.drain(..)
    }

    // ------------------------------------------------------------------
    // send / recv
    // ------------------------------------------------------------------

    /// Queue one application message for transmission, fragmenting by mss.
    pub fn send(&mut self, mut data: Bytes) -> ArqResult<()> {
        if data.is_empty() {
            return Err(ArqError::buffer("empty send"));
        }

        let mss = self.mss as usize;

        // stream mode: top up the trailing unsent segment first
        if self.config.stream {
            if let Some(last) = self.snd_queue.back_mut() {
                if last.data.len() < mss {
                    let room = mss - last.data.len();
                    let extend = room.min(data.len());
                    let mut merged = BytesMut::with_capacity(last.data.len() + extend);
                    merged.extend_from_slice(&last.data);
                    merged.extend_from_slice(&data.split_to(extend));
                    last.data = merged.freeze();
                    last.header.len = last.data.len() as u32;
                }
            }
            if data.is_empty() {
                return Ok(());
            }
        }

        let count = if data.len() <= mss {
            1
        } else {
            data.len().div_ceil(mss)
        };

        // a message wider than the receive window can never be reassembled:
        // promotion stops at rcv_wnd queued segments, so the receiver would
        // advertise a zero window and stall permanently
        if count >= self.config.rcv_wnd as usize {
            return Err(ArqError::buffer(format!(
                "message needs {count} fragments, receive window holds {}",
                self.config.rcv_wnd
            )));
        }

        if count > consts::FRG_LIMIT {
            return Err(ArqError::buffer(format!(
                "message needs {count} fragments, limit is {}",
                consts::FRG_LIMIT
            )));
        }

        self.stats.bytes_sent += data.len() as u64;

        for i in 0..count {
            let size = mss.min(data.len());
            let mut seg = Segment::push(self.conv, 0, data.split_to(size));
            // descending fragment index, 0 marks the final fragment
            seg.header.frg = if self.config.stream {
                0
            } else {
                (count - i - 1) as u8
            };
            self.snd_queue.push_back(seg);
        }

        Ok(())
    }

    /// Size of the next complete message in the receive queue, or None if
    /// no message is fully reassembled yet.
    pub fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.header.frg == 0 {
            return Some(first.data.len());
        }

        if self.rcv_queue.len() < (first.header.frg + 1) as usize {
            return None;
        }

        let mut length = 0;
        for seg in &self.rcv_queue {
            length += seg.data.len();
            if seg.header.frg == 0 {
                break;
            }
        }
        Some(length)
    }

    /// Pop one fully reassembled message, if available.
    pub fn recv(&mut self) -> Option<Bytes> {
        let size = self.peek_size()?;

        let fast_recover = self.rcv_queue.len() >= self.wnd.rcv as usize;

        // merge fragments
        let mut data = BytesMut::with_capacity(size);
        while let Some(seg) = self.rcv_queue.pop_front() {
            data.extend_from_slice(&seg.data);
            if seg.header.frg == 0 {
                break;
            }
        }
        debug_assert_eq!(data.len(), size);

        self.stats.bytes_received += data.len() as u64;

        self.promote_rcv_buf();

        // receive window reopened after being full: tell the remote
        if fast_recover && self.rcv_queue.len() < self.wnd.rcv as usize {
            self.probe.flags |= consts::ASK_TELL;
        }

        Some(data.freeze())
    }

    // ------------------------------------------------------------------
    // input
    // ------------------------------------------------------------------

    /// Feed one received datagram (possibly several back-to-back segments).
    ///
    /// `regular` marks packets from the normal path (not recovered by FEC);
    /// only those update the remote window and the RTT estimator.
    /// `ack_nodelay` forces an immediate ack-only flush.
    pub fn input(&mut self, data: Bytes, regular: bool, ack_nodelay: bool) -> ArqResult<()> {
        if data.len() < SegmentHeader::SIZE {
            return Err(ArqError::protocol("datagram shorter than segment header"));
        }

        let prev_una = self.snd_una;
        let mut buf = data;
        let mut max_ack: SeqNum = 0;
        let mut last_ack_ts: Timestamp = 0;
        let mut saw_ack = false;

        while buf.len() >= SegmentHeader::SIZE {
            let header = match SegmentHeader::decode(&mut buf) {
                Some(h) => h,
                None => break,
            };

            if header.conv != self.conv {
                return Err(ArqError::protocol(format!(
                    "conv mismatch: got {}, expected {}",
                    header.conv, self.conv
                )));
            }
            if buf.len() < header.len as usize {
                return Err(ArqError::protocol("segment length exceeds datagram"));
            }

            // only trust window updates from regular packets
            if regular {
                self.wnd.rmt = header.wnd as u32;
            }
            self.parse_una(header.una);
            self.shrink_buf();

            match header.cmd {
                consts::CMD_ACK => {
                    self.parse_ack(header.sn);
                    self.shrink_buf();
                    if !saw_ack || seq_after(header.sn, max_ack) {
                        saw_ack = true;
                        max_ack = header.sn;
                        last_ack_ts = header.ts;
                    }
                }
                consts::CMD_PUSH => {
                    if seq_before(header.sn, self.rcv_nxt.wrapping_add(self.wnd.rcv)) {
                        self.acklist.push((header.sn, header.ts));
                        if !seq_before(header.sn, self.rcv_nxt) {
                            let payload = buf.slice(..header.len as usize);
                            let mut seg = Segment::new(header.conv, header.cmd, payload);
                            seg.header = header.clone();
                            self.parse_data(seg);
                        }
                    }
                }
                consts::CMD_WASK => {
                    // answer with a window-tell on the next flush
                    self.probe.flags |= consts::ASK_TELL;
                }
                consts::CMD_WINS => {
                    // window announcement, nothing further to do
                }
                _ => {
                    return Err(ArqError::protocol(format!(
                        "unknown command {}",
                        header.cmd
                    )));
                }
            }

            buf.advance(header.len as usize);
        }

        if saw_ack && regular {
            self.parse_fastack(max_ack);
            if time_diff(self.current, last_ack_ts) >= 0 {
                self.update_ack(time_diff(self.current, last_ack_ts));
            }
        }

        // ack floor advanced: grow the congestion window
        if time_diff(self.snd_una, prev_una) > 0 && self.wnd.cwnd < self.wnd.rmt {
            let mss = self.mss;
            if self.wnd.cwnd < self.wnd.ssthresh {
                // slow start
                self.wnd.cwnd += 1;
                self.wnd.incr += mss;
            } else {
                // congestion avoidance, additive increase
                if self.wnd.incr < mss {
                    self.wnd.incr = mss;
                }
                self.wnd.incr += (mss * mss) / self.wnd.incr + (mss / 16);
                if (self.wnd.cwnd + 1) * mss <= self.wnd.incr {
                    self.wnd.cwnd += 1;
                }
            }
            if self.wnd.cwnd > self.wnd.rmt {
                self.wnd.cwnd = self.wnd.rmt;
                self.wnd.incr = self.wnd.rmt * mss;
            }
        }

        self.stats.packets_received += 1;
        self.stats.cwnd = self.wnd.cwnd;

        if ack_nodelay && !self.acklist.is_empty() {
            self.flush(true);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // flush / update / check
    // ------------------------------------------------------------------

    /// The protocol's only producer of outbound bytes. Coalesces segments
    /// into mtu-sized datagrams staged on the output queue.
    pub fn flush(&mut self, ack_only: bool) {
        let current = self.current;
        let wnd_unused = self.wnd_unused();
        let una = self.rcv_nxt;

        let mut proto = SegmentHeader::new(self.conv, consts::CMD_ACK);
        proto.wnd = wnd_unused;
        proto.una = una;

        // pending acks, filtering bufferbloat jitter: acks below rcv_nxt
        // are stale except the freshest one
        let acklist = std::mem::take(&mut self.acklist);
        let last = acklist.len().saturating_sub(1);
        for (i, (sn, ts)) in acklist.into_iter().enumerate() {
            self.make_room(SegmentHeader::SIZE);
            if !seq_before(sn, self.rcv_nxt) || i == last {
                proto.sn = sn;
                proto.ts = ts;
                proto.encode(&mut self.buffer);
            }
        }

        if ack_only {
            self.emit();
            return;
        }

        // probe the window when the remote advertises zero, with
        // exponential backoff capped at PROBE_LIMIT
        if self.wnd.rmt == 0 {
            if self.probe.wait == 0 {
                self.probe.wait = consts::PROBE_INIT;
                self.probe.ts = current.wrapping_add(self.probe.wait);
            } else if time_diff(current, self.probe.ts) >= 0 {
                if self.probe.wait < consts::PROBE_INIT {
                    self.probe.wait = consts::PROBE_INIT;
                }
                self.probe.wait += self.probe.wait / 2;
                if self.probe.wait > consts::PROBE_LIMIT {
                    self.probe.wait = consts::PROBE_LIMIT;
                }
                self.probe.ts = current.wrapping_add(self.probe.wait);
                self.probe.flags |= consts::ASK_SEND;
            }
        } else {
            self.probe.ts = 0;
            self.probe.wait = 0;
        }

        if (self.probe.flags & consts::ASK_SEND) != 0 {
            proto.cmd = consts::CMD_WASK;
            self.make_room(SegmentHeader::SIZE);
            proto.encode(&mut self.buffer);
        }
        if (self.probe.flags & consts::ASK_TELL) != 0 {
            proto.cmd = consts::CMD_WINS;
            self.make_room(SegmentHeader::SIZE);
            proto.encode(&mut self.buffer);
        }
        self.probe.flags = 0;

        // effective window
        let mut cwnd = self.wnd.snd.min(self.wnd.rmt);
        if !self.config.nodelay.no_congestion {
            cwnd = cwnd.min(self.wnd.cwnd);
        }

        // promote unsent segments into the in-flight buffer
        let mut new_segs = 0usize;
        while time_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.header.conv = self.conv;
            seg.header.cmd = consts::CMD_PUSH;
            seg.header.sn = self.snd_nxt;
            self.snd_buf.push_back(seg);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            new_segs += 1;
        }

        let resent = if self.config.nodelay.resend > 0 {
            self.config.nodelay.resend
        } else {
            u32::MAX
        };

        // transmit and retransmit in-flight segments
        let mut lost = false;
        let mut change = false;
        let nodelay = self.config.nodelay.nodelay;
        let rx_rto = self.rtt.rto;
        let dead_link = self.config.dead_link;

        for k in 0..self.snd_buf.len() {
            let seg = &mut self.snd_buf[k];
            let mut needsend = false;

            if seg.xmit == 0 {
                // initial transmit
                needsend = true;
                seg.rto = rx_rto;
                seg.resendts = current.wrapping_add(seg.rto);
            } else if time_diff(current, seg.resendts) >= 0 {
                // RTO expiry
                needsend = true;
                seg.rto += if nodelay { rx_rto / 2 } else { rx_rto };
                seg.resendts = current.wrapping_add(seg.rto);
                lost = true;
                self.stats.retransmissions += 1;
            } else if seg.fastack >= resent {
                // fast retransmit: enough duplicate acks skipped past us
                needsend = true;
                seg.fastack = 0;
                seg.rto = rx_rto;
                seg.resendts = current.wrapping_add(seg.rto);
                change = true;
                self.stats.fast_retransmissions += 1;
            } else if seg.fastack > 0 && new_segs == 0 {
                // early retransmit: skips observed and nothing new to send
                needsend = true;
                seg.fastack = 0;
                seg.rto = rx_rto;
                seg.resendts = current.wrapping_add(seg.rto);
                change = true;
                self.stats.fast_retransmissions += 1;
            }

            if needsend {
                seg.xmit += 1;
                seg.header.ts = current;
                seg.header.wnd = wnd_unused;
                seg.header.una = una;

                let need = SegmentHeader::SIZE + seg.data.len();
                let dead = seg.xmit >= dead_link;
                let encoded = self.snd_buf[k].clone();
                self.make_room(need);
                encoded.encode(&mut self.buffer);

                if dead {
                    self.dead = true;
                }
            }
        }

        self.emit();

        // rate halving after fast/early retransmit (RFC 6937 flavor)
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.wnd.ssthresh = (inflight / 2).max(consts::THRESH_MIN);
            self.wnd.cwnd = self.wnd.ssthresh + resent.min(inflight);
            self.wnd.incr = self.wnd.cwnd * self.mss;
        }

        // RTO loss collapses the window to one segment (RFC 5681)
        if lost {
            self.wnd.ssthresh = (cwnd / 2).max(consts::THRESH_MIN);
            self.wnd.cwnd = 1;
            self.wnd.incr = self.mss;
        }

        if self.wnd.cwnd < 1 {
            self.wnd.cwnd = 1;
            self.wnd.incr = self.mss;
        }
        self.stats.cwnd = self.wnd.cwnd;
    }

    /// Drive flush scheduling. Call at a bounded interval with the current
    /// millisecond timestamp. A clock jump beyond ±10s resets the schedule
    /// instead of triggering a retransmission storm.
    pub fn update(&mut self, current: Timestamp) {
        self.current = current;

        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = time_diff(current, self.ts_flush);

        if !(-10000..10000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            let interval = self.config.effective_interval();
            self.ts_flush = self.ts_flush.wrapping_add(interval);
            if time_diff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(interval);
            }
            self.flush(false);
        }
    }

    /// Earliest timestamp at which [`ArqEngine::update`] would do useful
    /// work: the minimum of the next scheduled flush and the earliest
    /// pending retransmit deadline.
    pub fn check(&self, current: Timestamp) -> Timestamp {
        if !self.updated {
            return current;
        }

        let mut ts_flush = self.ts_flush;
        if !(-10000..10000).contains(&time_diff(current, ts_flush)) {
            ts_flush = current;
        }
        if time_diff(current, ts_flush) >= 0 {
            return current;
        }

        let tm_flush = time_diff(ts_flush, current);
        let mut tm_packet = i32::MAX;
        for seg in &self.snd_buf {
            let diff = time_diff(seg.resendts, current);
            if diff <= 0 {
                return current;
            }
            tm_packet = tm_packet.min(diff);
        }

        let interval = self.config.effective_interval();
        let minimal = (tm_packet.min(tm_flush) as u32).min(interval);
        current.wrapping_add(minimal)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Free slots in the receive window, as advertised to the remote
    fn wnd_unused(&self) -> u16 {
        let used = self.rcv_queue.len() as u32;
        if used < self.wnd.rcv {
            (self.wnd.rcv - used) as u16
        } else {
            0
        }
    }

    /// Stage the working buffer as one datagram
    fn emit(&mut self) {
        if !self.buffer.is_empty() {
            self.output.push_back(self.buffer.split().freeze());
            self.stats.packets_sent += 1;
        }
    }

    /// Emit the working buffer first if `need` more bytes would overflow mtu
    fn make_room(&mut self, need: usize) {
        if self.buffer.len() + need > self.mtu as usize {
            self.emit();
        }
    }

    /// Drop in-flight segments cumulatively acknowledged by `una`
    fn parse_una(&mut self, una: SeqNum) {
        while let Some(seg) = self.snd_buf.front() {
            if seq_before(seg.header.sn, una) {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop the single in-flight segment matching an individual ack
    fn parse_ack(&mut self, sn: SeqNum) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }

        for k in 0..self.snd_buf.len() {
            let seg_sn = self.snd_buf[k].header.sn;
            if sn == seg_sn {
                self.snd_buf.remove(k);
                break;
            }
            if seq_before(sn, seg_sn) {
                break;
            }
        }
    }

    /// Bump skip counters on in-flight segments older than the acked sn
    fn parse_fastack(&mut self, sn: SeqNum) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }

        for seg in &mut self.snd_buf {
            if seq_before(sn, seg.header.sn) {
                break;
            } else if sn != seg.header.sn {
                seg.fastack += 1;
            }
        }
    }

    /// Re-derive the send-window floor from the in-flight buffer
    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.header.sn,
            None => self.snd_nxt,
        };
    }

    /// Insert a push segment into the out-of-order buffer (sorted by sn,
    /// duplicates dropped) and promote any contiguous run
    fn parse_data(&mut self, newseg: Segment) {
        let sn = newseg.header.sn;
        if !seq_before(sn, self.rcv_nxt.wrapping_add(self.wnd.rcv))
            || seq_before(sn, self.rcv_nxt)
        {
            return;
        }

        let mut insert_idx = 0;
        let mut repeat = false;
        for i in (0..self.rcv_buf.len()).rev() {
            let seg_sn = self.rcv_buf[i].header.sn;
            if seg_sn == sn {
                repeat = true;
                break;
            }
            if seq_after(sn, seg_sn) {
                insert_idx = i + 1;
                break;
            }
        }

        if !repeat {
            self.rcv_buf.insert(insert_idx, newseg);
        }

        self.promote_rcv_buf();
    }

    /// Move the contiguous run starting at rcv_nxt into the ordered queue
    fn promote_rcv_buf(&mut self) {
        loop {
            let ready = self
                .rcv_buf
                .front()
                .is_some_and(|seg| seg.header.sn == self.rcv_nxt)
                && self.rcv_queue.len() < self.wnd.rcv as usize;
            if !ready {
                break;
            }
            if let Some(seg) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    /// RFC 6298 RTT smoothing
    fn update_ack(&mut self, rtt: i32) {
        if self.rtt.srtt == 0 {
            self.rtt.srtt = rtt;
            self.rtt.rttvar = rtt >> 1;
        } else {
            let delta = (rtt - self.rtt.srtt).abs();
            self.rtt.srtt += (rtt - self.rtt.srtt) >> 3;
            if rtt < self.rtt.srtt - self.rtt.rttvar {
                // sample far below the expected range gets reduced weight
                self.rtt.rttvar += (delta - self.rtt.rttvar) >> 5;
            } else {
                self.rtt.rttvar += (delta - self.rtt.rttvar) >> 2;
            }
            if self.rtt.srtt < 1 {
                self.rtt.srtt = 1;
            }
        }

        let interval = self.config.effective_interval();
        let rto = self.rtt.srtt as u32 + interval.max((self.rtt.rttvar as u32) << 2);
        self.rtt.rto = rto.clamp(self.rtt.min_rto, consts::RTO_MAX);

        self.stats.srtt = self.rtt.srtt as u32;
        self.stats.rto = self.rtt.rto;
    }
}
