use core::fmt;

use bytes::Bytes;

use crate::storage::Charge;
use crate::time::Instant;
use crate::wire::{Flags, Options, SeqNumber};

/// Where a segment is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentState {
    /// In the write queue, never handed to the transport.
    Queued,
    /// Handed to the transport once and not yet acknowledged.
    Sent,
    /// Selectively acknowledged by the peer.
    SackedAcked,
    /// Handed to the transport again.
    Retransmitted,
    /// Presumed lost, waiting for retransmission.
    Lost,
}

/// Refers to a queued segment by its first sequence number.
///
/// Sequence ranges of queued segments never overlap so the start identifies a segment for as long
/// as it is queued. A handle is invalidated when the segment is acknowledged or merged into its
/// predecessor. Fragmenting keeps the handle valid for the leading part.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentHandle(pub(crate) SeqNumber);

impl SegmentHandle {
    /// The first sequence number of the segment.
    pub fn seq(self) -> SeqNumber {
        self.0
    }
}

/// Contiguous user bytes and the metadata to send them.
#[derive(Clone, Debug)]
pub struct Segment {
    pub(crate) seq: SeqNumber,
    pub(crate) end_seq: SeqNumber,
    pub(crate) flags: Flags,
    pub(crate) payload: Bytes,
    pub(crate) state: SegmentState,
    /// Marked lost, survives a retransmission until acknowledged or selectively acknowledged.
    pub(crate) lost: bool,
    pub(crate) retransmits: u16,
    pub(crate) ever_retransmitted: bool,
    pub(crate) first_sent: Option<Instant>,
    pub(crate) last_sent: Option<Instant>,
    pub(crate) tso_segs: u32,
    pub(crate) tso_mss: u32,
    /// A copy handed to the transport may still be held there.
    pub(crate) shared: bool,
    /// Options of a SYN, kept for retransmissions.
    pub(crate) syn_options: Option<Options>,
    pub(crate) charge: Charge,
}

impl Segment {
    pub(crate) fn new(seq: SeqNumber, payload: Bytes, flags: Flags) -> Self {
        let end_seq = seq + payload.len() as u32 + flags.sequence_len();
        let charge = Charge::segment(payload.len());
        Segment {
            seq,
            end_seq,
            flags,
            payload,
            state: SegmentState::Queued,
            lost: false,
            retransmits: 0,
            ever_retransmitted: false,
            first_sent: None,
            last_sent: None,
            tso_segs: 1,
            tso_mss: 0,
            shared: false,
            syn_options: None,
            charge,
        }
    }

    /// The handle referring to this segment.
    pub fn handle(&self) -> SegmentHandle {
        SegmentHandle(self.seq)
    }

    /// The first sequence number.
    pub fn seq(&self) -> SeqNumber {
        self.seq
    }

    /// The sequence number following the segment.
    pub fn end_seq(&self) -> SeqNumber {
        self.end_seq
    }

    /// The control flags.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The number of payload bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the segment carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The length in sequence space.
    pub fn sequence_len(&self) -> u32 {
        self.end_seq - self.seq
    }

    /// The current state.
    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// How often this segment was retransmitted.
    pub fn retransmits(&self) -> u16 {
        self.retransmits
    }

    /// When the segment was first handed to the transport.
    pub fn first_sent(&self) -> Option<Instant> {
        self.first_sent
    }

    /// When the segment was last handed to the transport.
    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    /// The number of MSS sized wire segments this segment stands for.
    pub fn tso_segs(&self) -> u32 {
        self.tso_segs
    }

    /// Whether a copy may still be queued in the transport.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Options kept for the retransmission of a SYN.
    pub fn syn_options(&self) -> Option<&Options> {
        self.syn_options.as_ref()
    }

    /// Recompute the TSO segment count for `mss`, returning the previous count.
    pub(crate) fn set_tso_segs(&mut self, mss: u32) -> u32 {
        let old = self.tso_segs;
        let len = self.len() as u32;
        if mss == 0 || len <= mss {
            self.tso_segs = 1;
        } else {
            self.tso_segs = (len + mss - 1) / mss;
        }
        self.tso_mss = mss;
        old
    }

    /// The segment size to ask the transport to cut this segment into, if any.
    pub(crate) fn gso_size(&self) -> Option<u16> {
        if self.tso_segs > 1 {
            Some(self.tso_mss.min(u32::from(u16::max_value())) as u16)
        } else {
            None
        }
    }

    /// Cut off everything from payload offset `offset`, returning it as a new segment.
    ///
    /// PSH and FIN move to the tail, SYN stays with the head. Both keep the state and history.
    pub(crate) fn split_off(&mut self, offset: usize) -> Segment {
        debug_assert!(offset > 0 && offset < self.len());
        let tail_payload = self.payload.slice(offset..);
        self.payload = self.payload.slice(..offset);

        let mut tail = self.clone();
        tail.payload = tail_payload;
        tail.flags = self.flags & !Flags::SYN;
        self.flags.remove(Flags::FIN | Flags::PSH);

        self.end_seq = self.seq + u32::from(self.flags.syn()) + offset as u32;
        tail.seq = self.end_seq;
        self.charge = Charge::segment(self.len());
        tail.charge = Charge::segment(tail.len());
        tail.syn_options = None;

        let mss = self.tso_mss;
        self.set_tso_segs(mss);
        tail.set_tso_segs(mss);
        tail
    }

    /// Drop `delta` units of sequence space from the front, which must all be acknowledged.
    pub(crate) fn trim_head(&mut self, mut delta: u32) {
        if self.flags.syn() && delta > 0 {
            self.flags.remove(Flags::SYN);
            self.seq += 1;
            delta -= 1;
        }
        let delta = (delta as usize).min(self.len());
        self.payload = self.payload.slice(delta..);
        self.seq += delta as u32;
        self.charge = Charge::segment(self.len());
        let mss = self.tso_mss;
        self.set_tso_segs(mss);
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}..{}) len={} [{}] {:?}", self.seq, self.end_seq, self.len(), self.flags, self.state)?;
        if self.tso_segs > 1 {
            write!(f, " tso={}x{}", self.tso_segs, self.tso_mss)?;
        }
        Ok(())
    }
}
