//! The reliability primitive underneath a UDP channel: ordered, retransmitted delivery of
//!  messages over unreliable datagrams.
//!
//! Messages are split into segments of at most `mss` bytes. Segments are numbered, kept in a send
//!  buffer until they are acknowledged, and retransmitted when their retransmission timeout
//!  expires or when enough acknowledgements for later segments arrived ('fast resend'). The
//!  receiver acknowledges every data segment, keeps out-of-order segments in a receive buffer and
//!  moves them to the receive queue once they are contiguous. Every segment header carries the
//!  sender's cumulative acknowledgement (`una`) and its free receive window.
//!
//! The session has no notion of sockets or addresses: datagrams go out through an output
//!  callback, with the first [MSG_PREFIX_LEN] bytes left free for the channel's MSG prefix.

pub mod segment;

use std::collections::VecDeque;
use anyhow::bail;
use bytes::{Buf, BufMut};
use tracing::{debug, trace};
use crate::buffers::object_pool::ObjectPool;
use crate::config::ArqConfig;
use crate::udp::arq::segment::{Segment, SegmentCommand, SegmentHeader};
use crate::udp::control_frame::MSG_PREFIX_LEN;
use crate::util::clock::time_diff;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// The contract between a channel and its reliability primitive.
pub trait ReliableSession: Send {
    /// Queue a message for sending; it is transmitted on the next [ReliableSession::update]
    fn send(&mut self, message: &mut dyn Buf, pool: &mut ObjectPool) -> anyhow::Result<()>;

    /// Feed a received datagram (without the MSG prefix)
    fn input(&mut self, data: &[u8], pool: &mut ObjectPool) -> anyhow::Result<()>;

    /// size of the next complete message, if there is one
    fn peek_size(&self) -> Option<usize>;

    /// Move the next complete message to `dst`, returning its size
    fn recv(&mut self, dst: &mut dyn BufMut, pool: &mut ObjectPool) -> Option<usize>;

    /// Advance the protocol clock: send acknowledgements, new segments and due retransmissions
    fn update(&mut self, now: u32, output: &mut dyn FnMut(&mut [u8]));

    /// the time at which [ReliableSession::update] should be called next
    fn check(&self, now: u32) -> u32;

    /// number of segments that were queued but are not acknowledged yet
    fn wait_snd(&self) -> usize;

    /// `true` if a segment could not be delivered despite repeated retransmission
    fn is_dead(&self) -> bool;
}

/// timestamps further apart than this are considered a clock jump rather than a delay
const MAX_CLOCK_SLAP: i32 = 10_000;

pub struct Arq {
    /// conversation id of outgoing segments, i.e. the peer's connection number
    conv_out: u32,
    /// expected conversation id of incoming segments, i.e. our own connection number
    conv_in: u32,

    mtu: usize,
    mss: usize,
    interval: u32,
    min_rto: u32,
    max_rto: u32,
    fast_resend: u32,
    dead_link: u32,

    snd_wnd: u16,
    rcv_wnd: u16,
    rmt_wnd: u16,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    srtt: i32,
    rttvar: i32,
    rx_rto: u32,

    current: u32,
    ts_flush: u32,
    updated: bool,
    dead: bool,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    /// (sn, ts) of received segments to acknowledge on the next flush
    acklist: Vec<(u32, u32)>,

    scratch: Vec<u8>,
}

impl Arq {
    pub fn new(local_conn: u32, remote_conn: u32, config: &ArqConfig) -> Arq {
        let min_rto: u32 = config.min_rto.as_millis().prechecked_cast();

        Arq {
            conv_out: remote_conn,
            conv_in: local_conn,
            mtu: config.mtu,
            mss: config.mtu - MSG_PREFIX_LEN - SegmentHeader::SERIALIZED_LEN,
            interval: config.interval.as_millis().prechecked_cast(),
            min_rto,
            max_rto: config.max_rto.as_millis().prechecked_cast(),
            fast_resend: config.fast_resend,
            dead_link: config.dead_link,
            snd_wnd: config.send_window,
            rcv_wnd: config.receive_window,
            rmt_wnd: config.receive_window,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            srtt: 0,
            rttvar: 0,
            rx_rto: min_rto.max(200).min(config.max_rto.as_millis().prechecked_cast()),
            current: 0,
            ts_flush: 0,
            updated: false,
            dead: false,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),
            scratch: Vec::with_capacity(config.mtu),
        }
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    fn wnd_unused(&self) -> u16 {
        self.rcv_wnd.saturating_sub(self.rcv_queue.len().min(u16::MAX as usize).prechecked_cast())
    }

    fn update_rtt(&mut self, rtt: i32) {
        // the sample is derived from a peer supplied timestamp
        let max_rto = i32::try_from(self.max_rto).unwrap_or(i32::MAX);
        let rtt = rtt.clamp(0, max_rto);

        if self.srtt == 0 {
            self.srtt = rtt.max(1);
            self.rttvar = rtt / 2;
        }
        else {
            let delta = rtt.saturating_sub(self.srtt).saturating_abs();
            self.rttvar = self.rttvar.saturating_mul(3).saturating_add(delta) / 4;
            self.srtt = (self.srtt.saturating_mul(7).saturating_add(rtt) / 8).max(1);
        }
        let interval = i32::try_from(self.interval).unwrap_or(i32::MAX);
        let rto = self.srtt.saturating_add(self.rttvar.saturating_mul(4).max(interval));
        self.rx_rto = u32::try_from(rto).unwrap_or(self.max_rto)
            .clamp(self.min_rto, self.max_rto);
    }

    fn shrink_buf(&mut self) {
        self.snd_una = self.snd_buf.front()
            .map(|s| s.sn)
            .unwrap_or(self.snd_nxt);
    }

    fn parse_una(&mut self, una: u32, pool: &mut ObjectPool) {
        while let Some(front) = self.snd_buf.front() {
            if time_diff(una, front.sn) <= 0 {
                break;
            }
            if let Some(segment) = self.snd_buf.pop_front() {
                pool.recycle(segment);
            }
        }
    }

    fn parse_ack(&mut self, sn: u32, pool: &mut ObjectPool) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        if let Some(idx) = self.snd_buf.iter().position(|s| s.sn == sn) {
            if let Some(segment) = self.snd_buf.remove(idx) {
                pool.recycle(segment);
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32) {
        for segment in self.snd_buf.iter_mut() {
            if time_diff(sn, segment.sn) < 0 {
                break;
            }
            if sn != segment.sn {
                segment.fast_ack += 1;
            }
        }
    }

    fn parse_data(&mut self, segment: Segment, pool: &mut ObjectPool) {
        let sn = segment.sn;
        if time_diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd.into())) >= 0 || time_diff(sn, self.rcv_nxt) < 0 {
            pool.recycle(segment);
            return;
        }

        let mut insert_at = self.rcv_buf.len();
        let mut duplicate = false;
        for (i, s) in self.rcv_buf.iter().enumerate().rev() {
            if s.sn == sn {
                duplicate = true;
                break;
            }
            if time_diff(sn, s.sn) > 0 {
                break;
            }
            insert_at = i;
        }

        if duplicate {
            trace!("dropping duplicate segment {}", sn);
            pool.recycle(segment);
        }
        else {
            self.rcv_buf.insert(insert_at, segment);
        }

        self.move_to_rcv_queue();
    }

    fn move_to_rcv_queue(&mut self) {
        while let Some(front) = self.rcv_buf.front() {
            if front.sn != self.rcv_nxt || self.rcv_queue.len() >= self.rcv_wnd.safe_cast() {
                break;
            }
            if let Some(segment) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(segment);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    fn flush(&mut self, output: &mut dyn FnMut(&mut [u8])) {
        let wnd = self.wnd_unused();
        let current = self.current;

        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.resize(MSG_PREFIX_LEN, 0);

        for (sn, ts) in self.acklist.drain(..) {
            if scratch.len() + SegmentHeader::SERIALIZED_LEN > self.mtu {
                emit(&mut scratch, output);
            }
            SegmentHeader {
                conv: self.conv_out,
                cmd: SegmentCommand::Ack,
                frg: 0,
                wnd,
                ts,
                sn,
                una: self.rcv_nxt,
                len: 0,
            }.ser(&mut scratch);
        }

        // a window of at least one segment doubles as a probe while the peer's window is full
        let cwnd: u32 = self.snd_wnd.min(self.rmt_wnd.max(1)).into();
        while time_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut segment) = self.snd_queue.pop_front() else {
                break;
            };
            segment.ts = current;
            segment.sn = self.snd_nxt;
            segment.resend_ts = current;
            segment.rto = self.rx_rto;
            segment.fast_ack = 0;
            segment.xmit = 0;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(segment);
        }

        for segment in self.snd_buf.iter_mut() {
            let need_send = if segment.xmit == 0 {
                segment.rto = self.rx_rto;
                true
            }
            else if time_diff(current, segment.resend_ts) >= 0 {
                segment.rto = (segment.rto + segment.rto / 2).min(self.max_rto);
                trace!("retransmitting segment {} after timeout", segment.sn);
                true
            }
            else if self.fast_resend > 0 && segment.fast_ack >= self.fast_resend {
                segment.fast_ack = 0;
                trace!("fast retransmission of segment {}", segment.sn);
                true
            }
            else {
                false
            };

            if need_send {
                segment.xmit += 1;
                segment.ts = current;
                segment.resend_ts = current.wrapping_add(segment.rto);

                if scratch.len() + segment.serialized_len() > self.mtu {
                    emit(&mut scratch, output);
                }
                segment.header(self.conv_out, wnd, self.rcv_nxt).ser(&mut scratch);
                scratch.extend_from_slice(&segment.data);

                if segment.xmit >= self.dead_link && !self.dead {
                    debug!("segment {} was transmitted {} times without acknowledgement - session is dead", segment.sn, segment.xmit);
                    self.dead = true;
                }
            }
        }

        emit(&mut scratch, output);
        self.scratch = scratch;
    }
}

fn emit(scratch: &mut Vec<u8>, output: &mut dyn FnMut(&mut [u8])) {
    if scratch.len() > MSG_PREFIX_LEN {
        output(scratch.as_mut_slice());
        scratch.truncate(MSG_PREFIX_LEN);
    }
}

impl ReliableSession for Arq {
    fn send(&mut self, message: &mut dyn Buf, pool: &mut ObjectPool) -> anyhow::Result<()> {
        let len = message.remaining();
        let count = len.div_ceil(self.mss).max(1);
        if count > u8::MAX as usize || count >= self.rcv_wnd.safe_cast() {
            bail!("message of {} bytes needs {} segments which exceeds the window", len, count);
        }

        for i in 0..count {
            let mut segment = pool.fetch::<Segment>();
            let size = message.remaining().min(self.mss);
            while segment.data.len() < size {
                let chunk = message.chunk();
                let n = chunk.len().min(size - segment.data.len());
                segment.data.extend_from_slice(&chunk[..n]);
                message.advance(n);
            }
            segment.frg = (count - i - 1).prechecked_cast();
            self.snd_queue.push_back(segment);
        }
        Ok(())
    }

    fn input(&mut self, data: &[u8], pool: &mut ObjectPool) -> anyhow::Result<()> {
        if data.len() < SegmentHeader::SERIALIZED_LEN {
            bail!("datagram of {} bytes is too short for a segment", data.len());
        }

        let mut max_ack: Option<u32> = None;
        let mut buf = data;
        while buf.len() >= SegmentHeader::SERIALIZED_LEN {
            let header = SegmentHeader::deser(&mut buf)?;
            if header.conv != self.conv_in {
                bail!("conversation id {} does not match {}", header.conv, self.conv_in);
            }
            let len: usize = header.len.safe_cast();
            if buf.len() < len {
                bail!("segment declares {} bytes of data, but only {} are left", len, buf.len());
            }

            self.rmt_wnd = header.wnd;
            self.parse_una(header.una, pool);
            self.shrink_buf();

            match header.cmd {
                SegmentCommand::Ack => {
                    let rtt = time_diff(self.current, header.ts);
                    if rtt >= 0 {
                        self.update_rtt(rtt);
                    }
                    self.parse_ack(header.sn, pool);
                    self.shrink_buf();
                    max_ack = match max_ack {
                        Some(sn) if time_diff(header.sn, sn) <= 0 => Some(sn),
                        _ => Some(header.sn),
                    };
                }
                SegmentCommand::Push => {
                    if time_diff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd.into())) < 0 {
                        self.acklist.push((header.sn, header.ts));
                        if time_diff(header.sn, self.rcv_nxt) >= 0 {
                            let mut segment = pool.fetch::<Segment>();
                            segment.fill_from(&header, buf);
                            self.parse_data(segment, pool);
                        }
                    }
                }
            }
            buf.advance(len);
        }

        if let Some(sn) = max_ack {
            self.parse_fastack(sn);
        }
        Ok(())
    }

    fn peek_size(&self) -> Option<usize> {
        let front = self.rcv_queue.front()?;
        if front.frg == 0 {
            return Some(front.len());
        }
        if self.rcv_queue.len() <= front.frg as usize {
            return None;
        }

        let mut size = 0;
        for segment in &self.rcv_queue {
            size += segment.len();
            if segment.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    fn recv(&mut self, dst: &mut dyn BufMut, pool: &mut ObjectPool) -> Option<usize> {
        let size = self.peek_size()?;

        while let Some(segment) = self.rcv_queue.pop_front() {
            dst.put_slice(&segment.data);
            let is_last = segment.frg == 0;
            pool.recycle(segment);
            if is_last {
                break;
            }
        }

        self.move_to_rcv_queue();
        Some(size)
    }

    fn update(&mut self, now: u32, output: &mut dyn FnMut(&mut [u8])) {
        self.current = now;
        if !self.updated {
            self.updated = true;
            self.ts_flush = now;
        }

        let mut slap = time_diff(now, self.ts_flush);
        if !(-MAX_CLOCK_SLAP..MAX_CLOCK_SLAP).contains(&slap) {
            self.ts_flush = now;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if time_diff(now, self.ts_flush) >= 0 {
                self.ts_flush = now.wrapping_add(self.interval);
            }
            self.flush(output);
        }
    }

    fn check(&self, now: u32) -> u32 {
        if !self.updated {
            return now;
        }

        let mut ts_flush = self.ts_flush;
        if !(-MAX_CLOCK_SLAP..MAX_CLOCK_SLAP).contains(&time_diff(now, ts_flush)) {
            ts_flush = now;
        }
        if time_diff(now, ts_flush) >= 0 {
            return now;
        }

        let tm_flush = time_diff(ts_flush, now);
        let mut tm_packet = i32::MAX;
        for segment in &self.snd_buf {
            let diff = time_diff(segment.resend_ts, now);
            if diff <= 0 {
                return now;
            }
            tm_packet = tm_packet.min(diff);
        }

        let minimal = tm_packet.min(tm_flush).min(self.interval as i32).max(0);
        now.wrapping_add(minimal as u32)
    }

    fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    fn is_dead(&self) -> bool {
        self.dead
    }
}
