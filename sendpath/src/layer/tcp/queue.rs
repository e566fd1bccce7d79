use alloc::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::layer::{Error, Result};
use crate::storage::{Charge, MemoryBudget};
use crate::time::Instant;
use crate::wire::{Flags, SeqNumber};

use super::segment::{Segment, SegmentHandle, SegmentState};

/// The send buffer of one connection.
///
/// Holds two queues under one owner. The write queue holds segments never handed to the
/// transport, the retransmission queue holds everything sent but not yet cumulatively
/// acknowledged. A segment moves from the first to the second exactly once. Together they cover a
/// contiguous range of sequence space, without gaps or overlap, from the oldest unacknowledged
/// byte to `write_seq`.
///
/// Aggregate counters (`packets_out`, `sacked_out`, `lost_out`, `retrans_out`) are kept in TSO
/// segment units and are maintained on every state change.
#[derive(Debug)]
pub struct SegmentQueue {
    write: VecDeque<Segment>,
    rtx: VecDeque<Segment>,
    budget: MemoryBudget,
    write_seq: SeqNumber,
    packets_out: u32,
    sacked_out: u32,
    lost_out: u32,
    retrans_out: u32,
}

/// What a cumulative acknowledgement removed from the queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Acked {
    /// Sequence space acknowledged.
    pub bytes: u32,
    /// TSO segments fully acknowledged.
    pub segments: u32,
    /// Send time of the newest fully acknowledged segment that was never retransmitted.
    pub rtt_sample_from: Option<Instant>,
    /// Whether any acknowledged segment had been retransmitted.
    pub had_retransmits: bool,
    /// Whether our SYN is now acknowledged.
    pub syn_acked: bool,
    /// Whether our FIN is now acknowledged.
    pub fin_acked: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Which {
    Write,
    Rtx,
}

#[derive(Default)]
struct Contribution {
    sacked: u32,
    lost: u32,
    retrans: u32,
}

impl Contribution {
    fn of(seg: &Segment) -> Self {
        let pcount = seg.tso_segs;
        Contribution {
            sacked: if seg.state == SegmentState::SackedAcked { pcount } else { 0 },
            lost: if seg.lost { pcount } else { 0 },
            retrans: if seg.state == SegmentState::Retransmitted { pcount } else { 0 },
        }
    }
}

impl SegmentQueue {
    /// An empty queue whose first segment starts at `seq`.
    pub fn new(budget: MemoryBudget, seq: SeqNumber) -> Self {
        SegmentQueue {
            write: VecDeque::new(),
            rtx: VecDeque::new(),
            budget,
            write_seq: seq,
            packets_out: 0,
            sacked_out: 0,
            lost_out: 0,
            retrans_out: 0,
        }
    }

    /// The sequence number the next queued byte will get.
    pub fn write_seq(&self) -> SeqNumber {
        self.write_seq
    }

    /// The memory budget segments are charged to.
    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    /// Queue a new segment at the tail.
    ///
    /// Fails with `Illegal` for a segment without payload, SYN or FIN and for anything queued
    /// after a FIN. Fails with `OutOfMemory` when the budget is exhausted.
    pub fn enqueue(&mut self, payload: Bytes, flags: Flags) -> Result<SegmentHandle> {
        self.enqueue_inner(payload, flags, false)
    }

    /// Queue a FIN-only segment, charged even when the budget is exhausted.
    pub(crate) fn enqueue_fin(&mut self) -> Result<SegmentHandle> {
        self.enqueue_inner(Bytes::new(), Flags::FIN | Flags::ACK, true)
    }

    fn enqueue_inner(&mut self, payload: Bytes, flags: Flags, forced: bool) -> Result<SegmentHandle> {
        if payload.is_empty() && !flags.intersects(Flags::SYN | Flags::FIN) {
            return Err(Error::Illegal);
        }
        if self.fin_queued() {
            return Err(Error::Illegal);
        }
        let seg = Segment::new(self.write_seq, payload, flags);
        if forced {
            self.budget.force_charge(seg.charge);
        } else {
            self.budget.try_charge(seg.charge)?;
        }
        self.write_seq = seg.end_seq;
        let handle = seg.handle();
        self.write.push_back(seg);
        Ok(handle)
    }

    /// Append bytes to the unsent tail segment, as long as it stays below `size_goal`.
    ///
    /// Returns the number of bytes taken, possibly zero. The tail is never extended past a PSH,
    /// SYN or FIN. The merged payload is a fresh buffer, existing bytes are never written to.
    pub fn append(&mut self, payload: &[u8], size_goal: usize) -> Result<usize> {
        let tail = match self.write.back_mut() {
            Some(tail) => tail,
            None => return Ok(0),
        };
        if tail.flags.intersects(Flags::PSH | Flags::SYN | Flags::FIN) || tail.len() >= size_goal {
            return Ok(0);
        }
        let take = (size_goal - tail.len()).min(payload.len());
        if take == 0 {
            return Ok(0);
        }
        self.budget.try_charge(Charge { bytes: take, segments: 0 })?;
        let mut merged = BytesMut::with_capacity(tail.len() + take);
        merged.extend_from_slice(&tail.payload);
        merged.extend_from_slice(&payload[..take]);
        tail.payload = merged.freeze();
        tail.end_seq += take as u32;
        tail.charge.bytes += take;
        self.write_seq = tail.end_seq;
        Ok(take)
    }

    /// Set flags on the unsent tail segment.
    ///
    /// Setting FIN claims one more sequence number.
    pub(crate) fn mark_tail(&mut self, flags: Flags) -> Option<SegmentHandle> {
        let tail = self.write.back_mut()?;
        if flags.fin() && !tail.flags.fin() {
            tail.end_seq += 1;
            self.write_seq = tail.end_seq;
        }
        tail.flags.insert(flags);
        Some(tail.handle())
    }

    /// The head of the write queue, which is not removed.
    pub fn pop_next_sendable(&self) -> Option<SegmentHandle> {
        self.write.front().map(Segment::handle)
    }

    /// Look at a queued segment.
    pub fn get(&self, handle: SegmentHandle) -> Option<&Segment> {
        let (which, idx) = self.locate(handle)?;
        Some(&self.queue(which)[idx])
    }

    /// Mutable access to an unsent segment.
    ///
    /// Outstanding segments are only changed through methods that keep the counters in sync.
    pub(crate) fn unsent_mut(&mut self, handle: SegmentHandle) -> Option<&mut Segment> {
        match self.locate(handle)? {
            (Which::Write, idx) => self.write.get_mut(idx),
            (Which::Rtx, _) => None,
        }
    }

    /// Move the head of the write queue to the retransmission queue.
    pub fn mark_sent(&mut self, handle: SegmentHandle, now: Instant) -> Result<()> {
        invariant!(self.pop_next_sendable() == Some(handle), "only the write queue head can be sent");
        let mut seg = match self.write.pop_front() {
            Some(seg) => seg,
            None => return Err(Error::UnknownSegment),
        };
        if let Some(last) = self.rtx.back() {
            debug_assert_eq!(last.end_seq, seg.seq, "retransmission queue must stay contiguous");
        }
        seg.state = SegmentState::Sent;
        seg.first_sent.get_or_insert(now);
        seg.last_sent = Some(now);
        seg.shared = true;
        self.packets_out += seg.tso_segs;
        self.rtx.push_back(seg);
        Ok(())
    }

    /// Split a segment at a payload offset.
    ///
    /// The leading part keeps the handle. PSH and FIN end up only on the trailing part.
    pub fn fragment(&mut self, handle: SegmentHandle, offset: usize)
        -> Result<(SegmentHandle, SegmentHandle)>
    {
        let (which, idx) = self.locate(handle).ok_or(Error::UnknownSegment)?;
        let len = self.queue(which)[idx].len();
        if offset == 0 || offset >= len {
            return Err(Error::InvalidOffset);
        }
        self.budget.try_charge(Charge { bytes: Charge::SEGMENT_OVERHEAD, segments: 1 })?;

        let before = Contribution::of(&self.queue(which)[idx]);
        let old_pcount = self.queue(which)[idx].tso_segs;
        let tail = self.queue_mut(which)[idx].split_off(offset);
        let head_pcount = self.queue(which)[idx].tso_segs;
        let tail_handle = tail.handle();
        if which == Which::Rtx {
            self.uncount(before, 0);
            self.count(Contribution::of(&self.rtx[idx]));
            self.count(Contribution::of(&tail));
            self.packets_out = self.packets_out - old_pcount + head_pcount + tail.tso_segs;
        }
        self.queue_mut(which).insert(idx + 1, tail);
        net_trace!("tcp: fragment {} at {}", handle.seq(), offset);
        Ok((handle, tail_handle))
    }

    /// Whether a segment may be merged with a neighbour.
    pub fn is_collapsible(&self, handle: SegmentHandle) -> bool {
        match self.get(handle) {
            Some(seg) => Self::collapsible(seg),
            None => false,
        }
    }

    fn collapsible(seg: &Segment) -> bool {
        seg.tso_segs <= 1
            && !seg.shared
            && !seg.flags.syn()
            && match seg.state {
                SegmentState::SackedAcked | SegmentState::Retransmitted => false,
                _ => true,
            }
    }

    /// Merge two adjacent segments of the same queue into the first.
    pub fn collapse(&mut self, first: SegmentHandle, second: SegmentHandle) -> Result<SegmentHandle> {
        let (which, idx) = self.locate(first).ok_or(Error::UnknownSegment)?;
        let (which_next, idx_next) = self.locate(second).ok_or(Error::UnknownSegment)?;
        if which != which_next || idx + 1 != idx_next {
            return Err(Error::NotCollapsible);
        }
        {
            let queue = self.queue(which);
            let (a, b) = (&queue[idx], &queue[idx_next]);
            if a.end_seq != b.seq || a.flags.fin() || !Self::collapsible(a) || !Self::collapsible(b) {
                return Err(Error::NotCollapsible);
            }
        }

        let next = match self.queue_mut(which).remove(idx_next) {
            Some(next) => next,
            None => return Err(Error::UnknownSegment),
        };
        let before = Contribution::of(&self.queue(which)[idx]);
        let old_pcount = self.queue(which)[idx].tso_segs;
        {
            let seg = &mut self.queue_mut(which)[idx];
            let mut merged = BytesMut::with_capacity(seg.len() + next.len());
            merged.extend_from_slice(&seg.payload);
            merged.extend_from_slice(&next.payload);
            seg.payload = merged.freeze();
            seg.end_seq = next.end_seq;
            seg.flags.insert(next.flags);
            seg.lost |= next.lost;
            seg.ever_retransmitted |= next.ever_retransmitted;
            seg.charge = Charge::segment(seg.len());
            if next.state == SegmentState::Lost {
                seg.state = SegmentState::Lost;
            }
            let mss = seg.tso_mss.max(next.tso_mss);
            seg.set_tso_segs(mss);
        }
        if which == Which::Rtx {
            self.uncount(before, 0);
            self.uncount(Contribution::of(&next), 0);
            self.count(Contribution::of(&self.rtx[idx]));
            self.packets_out = self.packets_out - old_pcount - next.tso_segs + self.rtx[idx].tso_segs;
        }
        self.budget.release(Charge { bytes: Charge::SEGMENT_OVERHEAD, segments: 1 });
        Ok(first)
    }

    /// Remove everything cumulatively acknowledged by `ack`.
    ///
    /// A segment straddling `ack` has its acknowledged front trimmed.
    pub fn acknowledge_up_to(&mut self, ack: SeqNumber) -> Acked {
        let mut acked = Acked::default();
        while let Some(front) = self.rtx.front() {
            if front.end_seq.after(ack) {
                break;
            }
            let seg = match self.rtx.pop_front() {
                Some(seg) => seg,
                None => break,
            };
            self.uncount(Contribution::of(&seg), seg.tso_segs);
            self.budget.release(seg.charge);
            acked.bytes += seg.sequence_len();
            acked.segments += seg.tso_segs;
            acked.syn_acked |= seg.flags.syn();
            acked.fin_acked |= seg.flags.fin();
            acked.had_retransmits |= seg.ever_retransmitted;
            if !seg.ever_retransmitted {
                acked.rtt_sample_from = seg.last_sent;
            }
        }

        let before = match self.rtx.front() {
            Some(front) if front.seq.before(ack) => Contribution::of(front),
            _ => return acked,
        };
        let old_charge;
        let old_pcount;
        let delta;
        {
            let front = &mut self.rtx[0];
            old_charge = front.charge;
            old_pcount = front.tso_segs;
            delta = ack - front.seq;
            acked.syn_acked |= front.flags.syn();
            front.trim_head(delta);
        }
        acked.bytes += delta;
        self.uncount(before, 0);
        self.count(Contribution::of(&self.rtx[0]));
        self.packets_out = self.packets_out - old_pcount + self.rtx[0].tso_segs;
        self.budget.release(Charge {
            bytes: old_charge.bytes - self.rtx[0].charge.bytes,
            segments: 0,
        });
        acked
    }

    /// Mark segments fully inside `[start, end)` as selectively acknowledged.
    ///
    /// Returns the number of TSO segments newly marked.
    pub fn mark_sacked(&mut self, start: SeqNumber, end: SeqNumber) -> u32 {
        let mut newly = 0;
        let first = self.rtx.partition_point(|seg| seg.seq.before(start));
        for idx in first..self.rtx.len() {
            let seg = &self.rtx[idx];
            if seg.end_seq.after(end) {
                break;
            }
            if seg.state == SegmentState::SackedAcked {
                continue;
            }
            newly += seg.tso_segs;
            self.update(idx, |seg| {
                seg.state = SegmentState::SackedAcked;
                seg.lost = false;
            });
        }
        newly
    }

    /// Mark every outstanding segment that was not selectively acknowledged as lost.
    pub fn mark_all_lost(&mut self) -> u32 {
        let mut marked = 0;
        for idx in 0..self.rtx.len() {
            if self.rtx[idx].state == SegmentState::SackedAcked {
                continue;
            }
            marked += self.rtx[idx].tso_segs;
            self.update(idx, |seg| {
                seg.state = SegmentState::Lost;
                seg.lost = true;
                // The copy in the transport is long gone or hopelessly late.
                seg.shared = false;
            });
        }
        marked
    }

    /// Mark one outstanding segment as lost.
    pub fn mark_lost(&mut self, handle: SegmentHandle) -> Result<()> {
        match self.locate(handle) {
            Some((Which::Rtx, idx)) => {
                if self.rtx[idx].state != SegmentState::SackedAcked {
                    self.update(idx, |seg| {
                        seg.state = SegmentState::Lost;
                        seg.lost = true;
                    });
                }
                Ok(())
            }
            _ => Err(Error::UnknownSegment),
        }
    }

    /// Record that an outstanding segment was handed to the transport again.
    pub(crate) fn mark_retransmitted(&mut self, handle: SegmentHandle, now: Instant) -> Result<()> {
        match self.locate(handle) {
            Some((Which::Rtx, idx)) => {
                self.update(idx, |seg| {
                    seg.state = SegmentState::Retransmitted;
                    seg.retransmits = seg.retransmits.saturating_add(1);
                    seg.ever_retransmitted = true;
                    seg.last_sent = Some(now);
                    seg.shared = true;
                });
                Ok(())
            }
            _ => Err(Error::UnknownSegment),
        }
    }

    /// Record that an outstanding segment was sent again as a loss probe.
    ///
    /// Unlike a retransmission the segment keeps its state, the probe is not counted in flight.
    pub(crate) fn mark_probed(&mut self, handle: SegmentHandle, now: Instant) -> Result<()> {
        match self.locate(handle) {
            Some((Which::Rtx, idx)) => {
                self.update(idx, |seg| {
                    seg.retransmits = seg.retransmits.saturating_add(1);
                    seg.ever_retransmitted = true;
                    seg.last_sent = Some(now);
                    seg.shared = true;
                });
                Ok(())
            }
            _ => Err(Error::UnknownSegment),
        }
    }

    /// Recompute the TSO segment count of a queued segment.
    pub(crate) fn set_tso_segs(&mut self, handle: SegmentHandle, mss: u32) -> Result<u32> {
        match self.locate(handle) {
            Some((Which::Write, idx)) => {
                self.write[idx].set_tso_segs(mss);
                Ok(self.write[idx].tso_segs)
            }
            Some((Which::Rtx, idx)) => {
                let old = self.rtx[idx].tso_segs;
                self.update(idx, |seg| { seg.set_tso_segs(mss); });
                let new = self.rtx[idx].tso_segs;
                self.packets_out = self.packets_out - old + new;
                Ok(new)
            }
            None => Err(Error::UnknownSegment),
        }
    }

    /// Forget the transport's copies of everything ending at or before `end`.
    pub(crate) fn release_shared(&mut self, end: SeqNumber) {
        for seg in self.rtx.iter_mut() {
            if seg.end_seq.after(end) {
                break;
            }
            seg.shared = false;
        }
    }

    /// Forget the transport's copy of one outstanding segment.
    pub(crate) fn forget_shared(&mut self, handle: SegmentHandle) {
        if let Some((Which::Rtx, idx)) = self.locate(handle) {
            self.rtx[idx].shared = false;
        }
    }

    /// Build one segment of exactly `size` payload bytes from the head of the write queue.
    ///
    /// Fully consumed segments are removed and contribute all their flags. A partially consumed
    /// segment is trimmed and contributes neither PSH nor FIN. Fails with `Illegal` when not
    /// enough data is queued or when a segment marked PSH would be swallowed whole before the end.
    pub(crate) fn coalesce_head(&mut self, size: usize) -> Result<SegmentHandle> {
        let seq = match self.write.front() {
            Some(head) => head.seq,
            None => return Err(Error::Illegal),
        };
        let mut remaining = size;
        for seg in self.write.iter() {
            if remaining <= seg.len() {
                remaining = 0;
                break;
            }
            if seg.flags.intersects(Flags::PSH | Flags::SYN | Flags::FIN) {
                return Err(Error::Illegal);
            }
            remaining -= seg.len();
        }
        if remaining > 0 {
            return Err(Error::Illegal);
        }
        let charge = Charge::segment(size);
        self.budget.try_charge(charge)?;

        let mut payload = BytesMut::with_capacity(size);
        let mut flags = Flags::NONE;
        let mut remaining = size;
        while remaining > 0 {
            let head = match self.write.front_mut() {
                Some(head) => head,
                None => break,
            };
            if head.len() <= remaining {
                remaining -= head.len();
                payload.extend_from_slice(&head.payload);
                flags.insert(head.flags);
                let charge = head.charge;
                self.write.pop_front();
                self.budget.release(charge);
            } else {
                payload.extend_from_slice(&head.payload[..remaining]);
                flags.insert(head.flags & !(Flags::FIN | Flags::PSH));
                let old_charge = head.charge;
                head.trim_head(remaining as u32);
                self.budget.release(Charge {
                    bytes: old_charge.bytes - head.charge.bytes,
                    segments: 0,
                });
                remaining = 0;
            }
        }

        let mut probe = Segment::new(seq, payload.freeze(), flags);
        probe.charge = charge;
        probe.set_tso_segs(size as u32);
        let handle = probe.handle();
        self.write.push_front(probe);
        Ok(handle)
    }

    /// Drop every queued segment and release its memory.
    pub fn purge(&mut self) {
        for seg in self.write.drain(..).chain(self.rtx.drain(..)) {
            self.budget.release(seg.charge);
        }
        self.packets_out = 0;
        self.sacked_out = 0;
        self.lost_out = 0;
        self.retrans_out = 0;
    }

    /// The oldest outstanding segment.
    pub fn rtx_head(&self) -> Option<&Segment> {
        self.rtx.front()
    }

    /// The newest outstanding segment.
    pub fn rtx_tail(&self) -> Option<&Segment> {
        self.rtx.back()
    }

    /// The next unsent segment.
    pub fn write_head(&self) -> Option<&Segment> {
        self.write.front()
    }

    /// The last unsent segment.
    pub fn write_tail(&self) -> Option<&Segment> {
        self.write.back()
    }

    /// Outstanding segments in sequence order.
    pub fn outstanding(&self) -> impl Iterator<Item=&Segment> + '_ {
        self.rtx.iter()
    }

    /// Unsent segments in sequence order.
    pub fn unsent(&self) -> impl Iterator<Item=&Segment> + '_ {
        self.write.iter()
    }

    /// Handles of outstanding segments marked lost and not yet retransmitted.
    pub(crate) fn lost_handles(&self) -> impl Iterator<Item=SegmentHandle> + '_ {
        self.rtx.iter()
            .filter(|seg| seg.state == SegmentState::Lost)
            .map(Segment::handle)
    }

    /// The handle following `handle` in the same queue.
    pub(crate) fn next_of(&self, handle: SegmentHandle) -> Option<SegmentHandle> {
        let (which, idx) = self.locate(handle)?;
        self.queue(which).get(idx + 1).map(Segment::handle)
    }

    /// Whether the write queue is empty.
    pub fn write_is_empty(&self) -> bool {
        self.write.is_empty()
    }

    /// Whether nothing is outstanding.
    pub fn rtx_is_empty(&self) -> bool {
        self.rtx.is_empty()
    }

    /// Payload bytes not yet handed to the transport.
    pub fn unsent_bytes(&self) -> usize {
        self.write.iter().map(Segment::len).sum()
    }

    /// Whether `handle` is the last unsent segment.
    pub(crate) fn is_last_unsent(&self, handle: SegmentHandle) -> bool {
        self.write.back().map(Segment::handle) == Some(handle)
    }

    /// Whether a FIN has been queued.
    pub fn fin_queued(&self) -> bool {
        self.write.back().or_else(|| self.rtx.back())
            .map_or(false, |seg| seg.flags.fin())
    }

    /// Outstanding TSO segments.
    pub fn packets_out(&self) -> u32 {
        self.packets_out
    }

    /// Outstanding TSO segments selectively acknowledged.
    pub fn sacked_out(&self) -> u32 {
        self.sacked_out
    }

    /// Outstanding TSO segments marked lost.
    pub fn lost_out(&self) -> u32 {
        self.lost_out
    }

    /// Outstanding TSO segments retransmitted and not yet acknowledged.
    pub fn retrans_out(&self) -> u32 {
        self.retrans_out
    }

    /// The estimate of segments actually in the network.
    ///
    /// Everything sent, minus what left the network (selectively acknowledged or lost), plus
    /// retransmissions.
    pub fn in_flight(&self) -> u32 {
        let left = self.sacked_out + self.lost_out;
        self.packets_out.saturating_sub(left) + self.retrans_out
    }

    fn queue(&self, which: Which) -> &VecDeque<Segment> {
        match which {
            Which::Write => &self.write,
            Which::Rtx => &self.rtx,
        }
    }

    fn queue_mut(&mut self, which: Which) -> &mut VecDeque<Segment> {
        match which {
            Which::Write => &mut self.write,
            Which::Rtx => &mut self.rtx,
        }
    }

    fn locate(&self, handle: SegmentHandle) -> Option<(Which, usize)> {
        for &which in [Which::Rtx, Which::Write].iter() {
            let queue = self.queue(which);
            let idx = queue.partition_point(|seg| seg.seq.before(handle.0));
            if queue.get(idx).map_or(false, |seg| seg.seq == handle.0) {
                return Some((which, idx));
            }
        }
        None
    }

    /// Mutate an outstanding segment, keeping the aggregate counters in sync.
    fn update(&mut self, idx: usize, f: impl FnOnce(&mut Segment)) {
        let before = Contribution::of(&self.rtx[idx]);
        f(&mut self.rtx[idx]);
        let after = Contribution::of(&self.rtx[idx]);
        self.uncount(before, 0);
        self.count(after);
    }

    fn count(&mut self, c: Contribution) {
        self.sacked_out += c.sacked;
        self.lost_out += c.lost;
        self.retrans_out += c.retrans;
    }

    fn uncount(&mut self, c: Contribution, packets: u32) {
        self.sacked_out -= c.sacked;
        self.lost_out -= c.lost;
        self.retrans_out -= c.retrans;
        self.packets_out -= packets;
    }
}

impl Drop for SegmentQueue {
    fn drop(&mut self) {
        self.purge();
    }
}
