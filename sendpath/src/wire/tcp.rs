use core::{cmp, fmt, ops};
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>.
/// Sequence numbers do not have a discontiguity when compared pairwise across an overflow, the
/// comparison is only meaningful for numbers less than 2<sup>31</sup> apart.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    /// Whether `self` comes strictly before `other` in sequence space.
    pub fn before(self, other: SeqNumber) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Whether `self` comes strictly after `other` in sequence space.
    pub fn after(self, other: SeqNumber) -> bool {
        other.before(self)
    }

    /// The later of two sequence numbers.
    pub fn max(self, other: SeqNumber) -> SeqNumber {
        if self.before(other) { other } else { self }
    }

    /// The earlier of two sequence numbers.
    pub fn min(self, other: SeqNumber) -> SeqNumber {
        if self.after(other) { other } else { self }
    }

    /// Whether `self` lies in the half open range `[start, end)`.
    pub fn in_range(self, start: SeqNumber, end: SeqNumber) -> bool {
        !self.before(start) && self.before(end)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ops::Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        debug_assert!(rhs <= i32::max_value() as u32,
            "attempt to add to sequence number with unsigned overflow");
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl ops::Sub<u32> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u32) -> SeqNumber {
        debug_assert!(rhs <= i32::max_value() as u32,
            "attempt to subtract from sequence number with unsigned overflow");
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

impl ops::AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

/// The distance between two sequence numbers.
///
/// The right hand side must not come after the left hand side. Release builds saturate at zero
/// instead of producing a huge distance.
impl ops::Sub for SeqNumber {
    type Output = u32;

    fn sub(self, rhs: SeqNumber) -> u32 {
        let result = self.0.wrapping_sub(rhs.0) as i32;
        debug_assert!(result >= 0, "attempt to subtract sequence numbers with underflow");
        cmp::max(result, 0) as u32
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        (self.0.wrapping_sub(other.0) as i32).partial_cmp(&0)
    }
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::Field;

    pub(crate) const SRC_PORT: Field = 0..2;
    pub(crate) const DST_PORT: Field = 2..4;
    pub(crate) const SEQ_NUM:  Field = 4..8;
    pub(crate) const ACK_NUM:  Field = 8..12;
    pub(crate) const FLAGS:    Field = 12..14;
    pub(crate) const WIN_SIZE: Field = 14..16;
    pub(crate) const CHECKSUM: Field = 16..18;
    pub(crate) const URGENT:   Field = 18..20;

    pub(crate) fn OPTIONS(length: usize) -> Field {
        URGENT.end..length
    }

    pub(crate) const FLG_FIN: u16 = 0x001;
    pub(crate) const FLG_SYN: u16 = 0x002;
    pub(crate) const FLG_RST: u16 = 0x004;
    pub(crate) const FLG_PSH: u16 = 0x008;
    pub(crate) const FLG_ACK: u16 = 0x010;
    pub(crate) const FLG_URG: u16 = 0x020;
    pub(crate) const FLG_ECE: u16 = 0x040;
    pub(crate) const FLG_CWR: u16 = 0x080;

    pub(crate) const OPT_END: u8 = 0x00;
    pub(crate) const OPT_NOP: u8 = 0x01;
    pub(crate) const OPT_MSS: u8 = 0x02;
    pub(crate) const OPT_WS:  u8 = 0x03;
    pub(crate) const OPT_SACKPERM: u8 = 0x04;
    pub(crate) const OPT_SACKRNG:  u8 = 0x05;
    pub(crate) const OPT_TSTAMP:   u8 = 0x08;
    pub(crate) const OPT_FASTOPEN: u8 = 0x22;
}

/// A set of tcp flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(pub u16);

impl Flags {
    /// No flags at all.
    pub const NONE: Flags = Flags(0);
    /// No more data from sender.
    pub const FIN: Flags = Flags(field::FLG_FIN);
    /// Synchronize sequence numbers.
    pub const SYN: Flags = Flags(field::FLG_SYN);
    /// Reset the connection.
    pub const RST: Flags = Flags(field::FLG_RST);
    /// Push function.
    pub const PSH: Flags = Flags(field::FLG_PSH);
    /// Acknowledgment field significant.
    pub const ACK: Flags = Flags(field::FLG_ACK);
    /// Urgent pointer field significant.
    pub const URG: Flags = Flags(field::FLG_URG);
    /// ECN echo.
    pub const ECE: Flags = Flags(field::FLG_ECE);
    /// Congestion window reduced.
    pub const CWR: Flags = Flags(field::FLG_CWR);

    /// Whether all flags of `other` are set.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag of `other` is set.
    pub fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    /// Set all flags of `other`.
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    /// Clear all flags of `other`.
    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    /// Return the FIN flag.
    #[inline]
    pub fn fin(self) -> bool {
        self.intersects(Flags::FIN)
    }

    /// Return the SYN flag.
    #[inline]
    pub fn syn(self) -> bool {
        self.intersects(Flags::SYN)
    }

    /// Return the RST flag.
    #[inline]
    pub fn rst(self) -> bool {
        self.intersects(Flags::RST)
    }

    /// Return the PSH flag.
    #[inline]
    pub fn psh(self) -> bool {
        self.intersects(Flags::PSH)
    }

    /// Return the ACK flag.
    #[inline]
    pub fn ack(self) -> bool {
        self.intersects(Flags::ACK)
    }

    /// Return the URG flag.
    #[inline]
    pub fn urg(self) -> bool {
        self.intersects(Flags::URG)
    }

    /// Return the length of the control flags, in terms of sequence space.
    ///
    /// SYN and FIN each occupy one sequence number.
    pub fn sequence_len(self) -> u32 {
        u32::from(self.syn()) + u32::from(self.fin())
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl ops::Not for Flags {
    type Output = Flags;

    fn not(self) -> Flags {
        Flags(!self.0 & 0x1ff)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (Flags::SYN, "syn"), (Flags::FIN, "fin"), (Flags::RST, "rst"),
            (Flags::PSH, "psh"), (Flags::ACK, "ack"), (Flags::URG, "urg"),
            (Flags::ECE, "ece"), (Flags::CWR, "cwr"),
        ];
        let mut first = true;
        for &(flag, name) in names.iter() {
            if self.contains(flag) {
                if !first { write!(f, ",")? }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// The pair of values carried by the timestamps option (RFC 7323).
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct Timestamps {
    /// Our clock at the time of sending.
    pub value: u32,
    /// The most recent value received from the peer.
    pub echo: u32,
}

/// A fast open cookie (RFC 7413).
///
/// An empty cookie is a cookie request. Otherwise the cookie is between 4 and 16 bytes long and
/// of even length.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct FastOpenCookie {
    len: u8,
    bytes: [u8; 16],
}

impl FastOpenCookie {
    /// The longest cookie that can be carried.
    pub const MAX_LEN: usize = 16;

    /// An empty cookie, asking the server to generate one.
    pub fn request() -> Self {
        FastOpenCookie { len: 0, bytes: [0; 16] }
    }

    /// Wrap cookie bytes received from or to be sent to the peer.
    pub fn new(cookie: &[u8]) -> Result<Self> {
        let len = cookie.len();
        if len != 0 && (len < 4 || len > Self::MAX_LEN || len % 2 != 0) {
            return Err(Error::Unsupported);
        }
        let mut bytes = [0; 16];
        bytes[..len].copy_from_slice(cookie);
        Ok(FastOpenCookie { len: len as u8, bytes })
    }

    /// Whether this is a cookie request without content.
    pub fn is_request(&self) -> bool {
        self.len == 0
    }

    /// The cookie bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }
}

/// A representation of a single TCP option.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
    /// End of the option list.
    EndOfList,
    /// Padding.
    NoOperation,
    /// The maximum segment size the sender is willing to receive.
    MaxSegmentSize(u16),
    /// The window scale shift count.
    WindowScale(u8),
    /// Selective acknowledgements may be sent.
    SackPermitted,
    /// Up to three selectively acknowledged ranges.
    SackRange([Option<(u32, u32)>; 3]),
    /// Timestamp value and echo reply.
    Timestamps(Timestamps),
    /// A fast open cookie or cookie request.
    FastOpen(&'a [u8]),
    /// Any other option, carried opaquely.
    Unknown {
        /// The option kind.
        kind: u8,
        /// The option data after the length byte.
        data: &'a [u8],
    },
}

impl<'a> TcpOption<'a> {
    /// Parse the first option in the buffer, returning the remainder.
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.get(0).ok_or(Error::Truncated)? {
            field::OPT_END => {
                length = 1;
                option = TcpOption::EndOfList;
            }
            field::OPT_NOP => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                length = *buffer.get(1).ok_or(Error::Truncated)? as usize;
                if length < 2 {
                    return Err(Error::Malformed);
                }
                let data = buffer.get(2..length).ok_or(Error::Truncated)?;
                option = match (kind, length) {
                    (field::OPT_MSS, 4) =>
                        TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data)),
                    (field::OPT_MSS, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_WS, 3) =>
                        TcpOption::WindowScale(data[0]),
                    (field::OPT_WS, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_SACKPERM, 2) =>
                        TcpOption::SackPermitted,
                    (field::OPT_SACKPERM, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_TSTAMP, 10) =>
                        TcpOption::Timestamps(Timestamps {
                            value: NetworkEndian::read_u32(&data[0..4]),
                            echo: NetworkEndian::read_u32(&data[4..8]),
                        }),
                    (field::OPT_TSTAMP, _) =>
                        return Err(Error::Malformed),
                    (field::OPT_FASTOPEN, _) =>
                        TcpOption::FastOpen(data),
                    (field::OPT_SACKRNG, n) => {
                        if n < 10 || (n-2) % 8 != 0 {
                            return Err(Error::Malformed)
                        }
                        if n > 26 {
                            // RFC 2018: with timestamps at most 3 blocks fit. A fourth block is
                            // possible without them but extremely rare, drop it.
                            net_debug!("sACK with >3 blocks, truncating to 3");
                        }
                        let mut sack_ranges: [Option<(u32, u32)>; 3] = [None; 3];
                        sack_ranges.iter_mut().enumerate().for_each(|(i, nmut)| {
                            let left = i * 8;
                            *nmut = if left < data.len() {
                                let mid = left + 4;
                                let right = mid + 4;
                                Some((NetworkEndian::read_u32(&data[left..mid]),
                                      NetworkEndian::read_u32(&data[mid..right])))
                            } else {
                                None
                            };
                        });
                        TcpOption::SackRange(sack_ranges)
                    },
                    (_, _) =>
                        TcpOption::Unknown { kind, data },
                };
            }
        }
        Ok((&buffer[length..], option))
    }

    /// The number of bytes this option occupies, without alignment padding.
    pub fn buffer_len(&self) -> usize {
        match self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::SackRange(s) => s.iter().filter(|s| s.is_some()).count() * 8 + 2,
            TcpOption::Timestamps(_) => 10,
            TcpOption::FastOpen(cookie) => 2 + cookie.len(),
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    /// Write the option to the start of the buffer, returning the remainder.
    ///
    /// The buffer must be at least `buffer_len` long.
    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length;
        match *self {
            TcpOption::EndOfList => {
                length = buffer.len();
                // There may be padding space which also should be initialized.
                for p in buffer.iter_mut() {
                    *p = field::OPT_END;
                }
            }
            TcpOption::NoOperation => {
                length = 1;
                buffer[0] = field::OPT_NOP;
            }
            TcpOption::MaxSegmentSize(value) => {
                length = 4;
                buffer[0] = field::OPT_MSS;
                NetworkEndian::write_u16(&mut buffer[2..4], value)
            }
            TcpOption::WindowScale(value) => {
                length = 3;
                buffer[0] = field::OPT_WS;
                buffer[2] = value;
            }
            TcpOption::SackPermitted => {
                length = 2;
                buffer[0] = field::OPT_SACKPERM;
            }
            TcpOption::SackRange(slice) => {
                length = self.buffer_len();
                buffer[0] = field::OPT_SACKRNG;
                slice.iter().filter_map(|s| *s).enumerate().for_each(|(i, (first, second))| {
                    let pos = i * 8 + 2;
                    NetworkEndian::write_u32(&mut buffer[pos..pos+4], first);
                    NetworkEndian::write_u32(&mut buffer[pos+4..pos+8], second);
                });
            }
            TcpOption::Timestamps(ts) => {
                length = 10;
                buffer[0] = field::OPT_TSTAMP;
                NetworkEndian::write_u32(&mut buffer[2..6], ts.value);
                NetworkEndian::write_u32(&mut buffer[6..10], ts.echo);
            }
            TcpOption::FastOpen(cookie) => {
                length = self.buffer_len();
                buffer[0] = field::OPT_FASTOPEN;
                buffer[2..length].copy_from_slice(cookie);
            }
            TcpOption::Unknown { kind, data } => {
                length = self.buffer_len();
                buffer[0] = kind;
                buffer[2..length].copy_from_slice(data);
            }
        }
        if length >= 2 && !matches!(self, TcpOption::EndOfList) {
            buffer[1] = length as u8;
        }
        &mut buffer[length..]
    }
}

/// The options of one segment, as a tagged structure.
///
/// This is the only place that decides on the order, alignment and padding of options on the
/// wire. Each option is aligned to four bytes with leading no-ops in the way most stacks emit
/// them, so the aligned length of each option is fixed and the total is a multiple of four.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Options {
    /// Maximum segment size, only on SYN segments.
    pub mss: Option<u16>,
    /// Window scale shift, only on SYN segments.
    pub window_scale: Option<u8>,
    /// Timestamp value and echo.
    pub timestamps: Option<Timestamps>,
    /// Selective acknowledgement permitted, only on SYN segments.
    pub sack_permitted: bool,
    /// Selectively acknowledged ranges.
    pub sack_ranges: [Option<(u32, u32)>; 3],
    /// Fast open cookie or cookie request.
    pub fast_open: Option<FastOpenCookie>,
}

impl Options {
    /// The space available for options in a TCP header.
    pub const MAX_LEN: usize = 40;

    /// Aligned length of the timestamps option.
    pub const TIMESTAMPS_LEN: usize = 12;

    /// Parse an option block.
    ///
    /// Unknown options are skipped. A window scale above 14 is clamped to 14.
    pub fn parse(mut buffer: &[u8]) -> Result<Options> {
        let mut options = Options::default();
        while !buffer.is_empty() {
            let (next, option) = TcpOption::parse(buffer)?;
            match option {
                TcpOption::EndOfList => break,
                TcpOption::NoOperation => (),
                TcpOption::MaxSegmentSize(value) =>
                    options.mss = Some(value),
                TcpOption::WindowScale(value) => {
                    // RFC 7323: use 14 if a larger shift count is received.
                    if value > 14 {
                        net_debug!("parsed window scaling factor {} >14, setting to 14", value);
                    }
                    options.window_scale = Some(value.min(14));
                },
                TcpOption::SackPermitted =>
                    options.sack_permitted = true,
                TcpOption::SackRange(slice) =>
                    options.sack_ranges = slice,
                TcpOption::Timestamps(ts) =>
                    options.timestamps = Some(ts),
                TcpOption::FastOpen(cookie) =>
                    options.fast_open = Some(FastOpenCookie::new(cookie).map_err(|_| Error::Malformed)?),
                TcpOption::Unknown { .. } => (),
            }
            buffer = next;
        }
        Ok(options)
    }

    fn sack_count(&self) -> usize {
        self.sack_ranges.iter().filter(|s| s.is_some()).count()
    }

    /// The aligned length of the emitted option block.
    pub fn buffer_len(&self) -> usize {
        let mut length = 0;
        if self.mss.is_some() {
            length += 4;
        }
        if self.timestamps.is_some() {
            // Sack permitted shares the alignment padding of the timestamps.
            length += Self::TIMESTAMPS_LEN;
        } else if self.sack_permitted {
            length += 4;
        }
        if self.window_scale.is_some() {
            length += 4;
        }
        let sacks = self.sack_count();
        if sacks > 0 {
            length += 4 + 8 * sacks;
        }
        if let Some(cookie) = &self.fast_open {
            length += (2 + cookie.as_bytes().len() + 3) & !3;
        }
        length
    }

    /// Emit the option block into the start of `buffer`, returning the number of bytes written.
    pub fn emit(&self, buffer: &mut [u8]) -> Result<usize> {
        let length = self.buffer_len();
        if length > Self::MAX_LEN {
            return Err(Error::Unsupported);
        }
        let buffer = buffer.get_mut(..length).ok_or(Error::Truncated)?;
        let mut rest = buffer;

        if let Some(mss) = self.mss {
            rest = TcpOption::MaxSegmentSize(mss).emit(rest);
        }
        if let Some(ts) = self.timestamps {
            if self.sack_permitted {
                rest = TcpOption::SackPermitted.emit(rest);
            } else {
                rest = TcpOption::NoOperation.emit(rest);
                rest = TcpOption::NoOperation.emit(rest);
            }
            rest = TcpOption::Timestamps(ts).emit(rest);
        } else if self.sack_permitted {
            rest = TcpOption::NoOperation.emit(rest);
            rest = TcpOption::NoOperation.emit(rest);
            rest = TcpOption::SackPermitted.emit(rest);
        }
        if let Some(shift) = self.window_scale {
            rest = TcpOption::NoOperation.emit(rest);
            rest = TcpOption::WindowScale(shift).emit(rest);
        }
        if self.sack_count() > 0 {
            rest = TcpOption::NoOperation.emit(rest);
            rest = TcpOption::NoOperation.emit(rest);
            rest = TcpOption::SackRange(self.sack_ranges).emit(rest);
        }
        if let Some(cookie) = &self.fast_open {
            rest = TcpOption::FastOpen(cookie.as_bytes()).emit(rest);
            while !rest.is_empty() {
                rest = TcpOption::NoOperation.emit(rest);
            }
        }
        debug_assert!(rest.is_empty());
        Ok(length)
    }
}

/// A high-level representation of a TCP header.
///
/// The checksum covers a pseudo header of the network layer and is left for that layer (or the
/// hardware) to fill in.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    /// The source port.
    pub src_port: u16,
    /// The destination port.
    pub dst_port: u16,
    /// Control flags. ACK is derived from `ack_number` on emission.
    pub flags: Flags,
    /// The sequence number of the first byte (or of the SYN).
    pub seq_number: SeqNumber,
    /// The acknowledgment number, if the ACK flag is set.
    pub ack_number: Option<SeqNumber>,
    /// The unscaled window field.
    pub window_len: u16,
    /// The urgent pointer.
    pub urgent_at: u16,
    /// The header options.
    pub options: Options,
}

impl Repr {
    /// The length of a header without options.
    pub const MIN_LEN: usize = field::URGENT.end;

    /// Parse a header, returning the representation and the offset of the payload.
    pub fn parse(buffer: &[u8]) -> Result<(Repr, usize)> {
        if buffer.len() < field::URGENT.end {
            return Err(Error::Truncated);
        }
        let raw = NetworkEndian::read_u16(&buffer[field::FLAGS]);
        let header_len = usize::from(raw >> 12) * 4;
        if header_len < field::URGENT.end {
            return Err(Error::Malformed);
        }
        if buffer.len() < header_len {
            return Err(Error::Truncated);
        }
        let src_port = NetworkEndian::read_u16(&buffer[field::SRC_PORT]);
        let dst_port = NetworkEndian::read_u16(&buffer[field::DST_PORT]);
        // Source and destination ports must be present.
        if src_port == 0 || dst_port == 0 {
            return Err(Error::Malformed);
        }
        let flags = Flags(raw & 0x1ff);
        let ack_number = if flags.ack() {
            Some(SeqNumber(NetworkEndian::read_u32(&buffer[field::ACK_NUM])))
        } else {
            None
        };
        let options = Options::parse(&buffer[field::OPTIONS(header_len)])?;

        Ok((Repr {
            src_port,
            dst_port,
            flags,
            seq_number: SeqNumber(NetworkEndian::read_u32(&buffer[field::SEQ_NUM])),
            ack_number,
            window_len: NetworkEndian::read_u16(&buffer[field::WIN_SIZE]),
            urgent_at: NetworkEndian::read_u16(&buffer[field::URGENT]),
            options,
        }, header_len))
    }

    /// Return the length of the header that will be emitted from this representation.
    ///
    /// The TCP header length is a multiple of 4.
    pub fn header_len(&self) -> usize {
        field::URGENT.end + self.options.buffer_len()
    }

    /// Emit the header into the start of `buffer`, returning the header length.
    pub fn emit(&self, buffer: &mut [u8]) -> Result<usize> {
        let header_len = self.header_len();
        if self.options.buffer_len() > Options::MAX_LEN {
            return Err(Error::Unsupported);
        }
        let buffer = buffer.get_mut(..header_len).ok_or(Error::Truncated)?;
        NetworkEndian::write_u16(&mut buffer[field::SRC_PORT], self.src_port);
        NetworkEndian::write_u16(&mut buffer[field::DST_PORT], self.dst_port);
        NetworkEndian::write_u32(&mut buffer[field::SEQ_NUM], self.seq_number.0);
        NetworkEndian::write_u32(&mut buffer[field::ACK_NUM],
            self.ack_number.unwrap_or_default().0);
        let mut flags = self.flags;
        if self.ack_number.is_some() {
            flags.insert(Flags::ACK);
        } else {
            flags.remove(Flags::ACK);
        }
        let raw = ((header_len as u16 / 4) << 12) | (flags.0 & 0x1ff);
        NetworkEndian::write_u16(&mut buffer[field::FLAGS], raw);
        NetworkEndian::write_u16(&mut buffer[field::WIN_SIZE], self.window_len);
        NetworkEndian::write_u16(&mut buffer[field::CHECKSUM], 0);
        NetworkEndian::write_u16(&mut buffer[field::URGENT], self.urgent_at);
        self.options.emit(&mut buffer[field::OPTIONS(header_len)])?;
        Ok(header_len)
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TCP src={} dst={} [{}] seq={}",
               self.src_port, self.dst_port, self.flags, self.seq_number)?;
        if let Some(ack_number) = self.ack_number {
            write!(f, " ack={}", ack_number)?;
        }
        write!(f, " win={}", self.window_len)?;
        if let Some(mss) = self.options.mss {
            write!(f, " mss={}", mss)?;
        }
        if let Some(ws) = self.options.window_scale {
            write!(f, " ws={}", ws)?;
        }
        if self.options.sack_permitted {
            write!(f, " sACK")?;
        }
        if let Some(ts) = self.options.timestamps {
            write!(f, " ts={}/{}", ts.value, ts.echo)?;
        }
        Ok(())
    }
}
