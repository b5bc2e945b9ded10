use core::{cmp, fmt, ops};

use byteorder::{ByteOrder, LittleEndian};

use super::{Error, Result};

enum_with_unknown! {
    /// Segment command.
    pub enum Command(u8) {
        /// Data push.
        Push = 81,
        /// Acknowledgement of a single push.
        Ack = 82,
        /// Window probe: ask the peer to advertise its receive window.
        WindowAsk = 83,
        /// Window advertisement, sent in reply to a probe or on recovery.
        WindowTell = 84,
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Push => write!(f, "PSH"),
            Command::Ack => write!(f, "ACK"),
            Command::WindowAsk => write!(f, "WASK"),
            Command::WindowTell => write!(f, "WINS"),
            Command::Unknown(cmd) => write!(f, "CMD({cmd})"),
        }
    }
}

/// A segment sequence number.
///
/// A sequence number is a monotonically advancing integer modulo
/// 2<sup>32</sup>. Sequence numbers do not have a discontiguity when
/// compared pairwise across a signed overflow.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SeqNumber(pub u32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as u32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    fn sub(self, rhs: SeqNumber) -> usize {
        let result = self.0.wrapping_sub(rhs.0) as i32;
        if result < 0 {
            panic!("attempt to subtract sequence numbers with underflow")
        }
        result as usize
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        (self.0.wrapping_sub(other.0) as i32).partial_cmp(&0)
    }
}

/// Length of the fixed segment header.
pub const HEADER_LEN: usize = field::LEN.end;

/// A read/write wrapper around a segment buffer.
#[derive(Debug, PartialEq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::*;

    pub const CONV: Field = 0..4;
    pub const CMD: usize = 4;
    pub const FRG: usize = 5;
    pub const WND: Field = 6..8;
    pub const TS: Field = 8..12;
    pub const SN: Field = 12..16;
    pub const UNA: Field = 16..20;
    pub const LEN: Field = 20..24;

    pub fn PAYLOAD(length: u32) -> Field {
        LEN.end..(LEN.end + length as usize)
    }
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with segment structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is shorter than the
    /// fixed header, or shorter than the total length the header declares.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN || len < self.total_len() {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the conversation number field.
    #[inline]
    pub fn conv(&self) -> u32 {
        let data = self.buffer.as_ref();
        LittleEndian::read_u32(&data[field::CONV])
    }

    /// Return the command field.
    #[inline]
    pub fn command(&self) -> Command {
        let data = self.buffer.as_ref();
        Command::from(data[field::CMD])
    }

    /// Return the fragment field: the number of fragments that follow this
    /// one in the same message.
    #[inline]
    pub fn frg(&self) -> u8 {
        let data = self.buffer.as_ref();
        data[field::FRG]
    }

    /// Return the window field: the sender's free receive slots.
    #[inline]
    pub fn wnd(&self) -> u16 {
        let data = self.buffer.as_ref();
        LittleEndian::read_u16(&data[field::WND])
    }

    /// Return the timestamp field, in the sender's millisecond clock.
    #[inline]
    pub fn ts(&self) -> u32 {
        let data = self.buffer.as_ref();
        LittleEndian::read_u32(&data[field::TS])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn sn(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(LittleEndian::read_u32(&data[field::SN]))
    }

    /// Return the unacknowledged field: the sender's oldest in-flight
    /// sequence number.
    #[inline]
    pub fn una(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(LittleEndian::read_u32(&data[field::UNA]))
    }

    /// Return the payload length field.
    #[inline]
    pub fn len(&self) -> u32 {
        let data = self.buffer.as_ref();
        LittleEndian::read_u32(&data[field::LEN])
    }

    /// Return the length of the whole segment: header plus declared payload.
    #[inline]
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.len() as usize
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let length = self.len();
        let data = self.buffer.as_ref();
        &data[field::PAYLOAD(length)]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the conversation number field.
    #[inline]
    pub fn set_conv(&mut self, value: u32) {
        let data = self.buffer.as_mut();
        LittleEndian::write_u32(&mut data[field::CONV], value)
    }

    /// Set the command field.
    #[inline]
    pub fn set_command(&mut self, value: Command) {
        let data = self.buffer.as_mut();
        data[field::CMD] = value.into()
    }

    /// Set the fragment field.
    #[inline]
    pub fn set_frg(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        data[field::FRG] = value
    }

    /// Set the window field.
    #[inline]
    pub fn set_wnd(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        LittleEndian::write_u16(&mut data[field::WND], value)
    }

    /// Set the timestamp field.
    #[inline]
    pub fn set_ts(&mut self, value: u32) {
        let data = self.buffer.as_mut();
        LittleEndian::write_u32(&mut data[field::TS], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_sn(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        LittleEndian::write_u32(&mut data[field::SN], value.0)
    }

    /// Set the unacknowledged field.
    #[inline]
    pub fn set_una(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        LittleEndian::write_u32(&mut data[field::UNA], value.0)
    }

    /// Set the payload length field.
    #[inline]
    pub fn set_len(&mut self, value: u32) {
        let data = self.buffer.as_mut();
        LittleEndian::write_u32(&mut data[field::LEN], value)
    }
}

impl<'a, T: AsRef<[u8]> + AsMut<[u8]> + ?Sized> Packet<&'a mut T> {
    /// Return a mutable pointer to the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let length = self.len();
        let data = self.buffer.as_mut();
        &mut data[field::PAYLOAD(length)]
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> fmt::Display for Packet<&'a T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} conv={} sn={} frg={} wnd={} una={} len={}",
            self.command(),
            self.conv(),
            self.sn(),
            self.frg(),
            self.wnd(),
            self.una(),
            self.len()
        )
    }
}

/// Read the conversation number from the prefix of a datagram.
///
/// This does not interpret the rest of the datagram; hosts multiplexing
/// several conversations over one socket use it to route a datagram to the
/// right session before any further parsing.
pub fn peek_conv(datagram: &[u8]) -> Result<u32> {
    if datagram.len() < field::CONV.end {
        return Err(Error::Truncated);
    }
    Ok(LittleEndian::read_u32(&datagram[field::CONV]))
}

/// A high-level representation of a segment.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Repr<'a> {
    pub conv: u32,
    pub command: Command,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: SeqNumber,
    pub una: SeqNumber,
    pub payload: &'a [u8],
}

impl<'a> Repr<'a> {
    /// Parse a segment and return a high-level representation.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(packet: &Packet<&'a T>) -> Result<Repr<'a>> {
        packet.check_len()?;
        if let Command::Unknown(_) = packet.command() {
            return Err(Error::Malformed);
        }

        Ok(Repr {
            conv: packet.conv(),
            command: packet.command(),
            frg: packet.frg(),
            wnd: packet.wnd(),
            ts: packet.ts(),
            sn: packet.sn(),
            una: packet.una(),
            payload: packet.payload(),
        })
    }

    /// Return the length of the segment that will be emitted from this
    /// high-level representation.
    pub fn buffer_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Emit a high-level representation into a segment.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]> + ?Sized>(&self, packet: &mut Packet<&mut T>) {
        packet.set_conv(self.conv);
        packet.set_command(self.command);
        packet.set_frg(self.frg);
        packet.set_wnd(self.wnd);
        packet.set_ts(self.ts);
        packet.set_sn(self.sn);
        packet.set_una(self.una);
        packet.set_len(self.payload.len() as u32);
        packet.payload_mut().copy_from_slice(self.payload);
    }
}

impl<'a> fmt::Display for Repr<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} conv={} sn={} frg={} wnd={} una={} len={}",
            self.command,
            self.conv,
            self.sn,
            self.frg,
            self.wnd,
            self.una,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static PACKET_BYTES: [u8; 28] = [
        0x44, 0x33, 0x22, 0x11, 0x51, 0x02, 0x7d, 0x00, 0xd2, 0x04, 0x00, 0x00, 0x2a, 0x00, 0x00,
        0x00, 0x28, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0xaa, 0xbb, 0xcc, 0xdd,
    ];

    static PAYLOAD_BYTES: [u8; 4] = [0xaa, 0xbb, 0xcc, 0xdd];

    #[test]
    fn test_deconstruct() {
        let packet = Packet::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.conv(), 0x1122_3344);
        assert_eq!(packet.command(), Command::Push);
        assert_eq!(packet.frg(), 2);
        assert_eq!(packet.wnd(), 125);
        assert_eq!(packet.ts(), 1234);
        assert_eq!(packet.sn(), SeqNumber(42));
        assert_eq!(packet.una(), SeqNumber(40));
        assert_eq!(packet.len(), 4);
        assert_eq!(packet.total_len(), 28);
        assert_eq!(packet.payload(), &PAYLOAD_BYTES[..]);
    }

    #[test]
    fn test_construct() {
        let mut bytes = vec![0u8; 28];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        packet.set_conv(0x1122_3344);
        packet.set_command(Command::Push);
        packet.set_frg(2);
        packet.set_wnd(125);
        packet.set_ts(1234);
        packet.set_sn(SeqNumber(42));
        packet.set_una(SeqNumber(40));
        packet.set_len(4);
        packet.payload_mut().copy_from_slice(&PAYLOAD_BYTES[..]);
        assert_eq!(&*packet.into_inner(), &PACKET_BYTES[..]);
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(
            Packet::new_checked(&PACKET_BYTES[..23]).err(),
            Some(Error::Truncated)
        );
    }

    #[test]
    fn test_truncated_payload() {
        // the header declares four payload octets, only two are present
        assert_eq!(
            Packet::new_checked(&PACKET_BYTES[..26]).err(),
            Some(Error::Truncated)
        );
    }

    fn packet_repr() -> Repr<'static> {
        Repr {
            conv: 0x1122_3344,
            command: Command::Push,
            frg: 2,
            wnd: 125,
            ts: 1234,
            sn: SeqNumber(42),
            una: SeqNumber(40),
            payload: &PAYLOAD_BYTES,
        }
    }

    #[test]
    fn test_parse() {
        let packet = Packet::new_unchecked(&PACKET_BYTES[..]);
        let repr = Repr::parse(&packet).unwrap();
        assert_eq!(repr, packet_repr());
    }

    #[test]
    fn test_parse_unknown_command() {
        let mut bytes = PACKET_BYTES;
        bytes[4] = 99;
        let packet = Packet::new_unchecked(&bytes[..]);
        assert_eq!(Repr::parse(&packet).err(), Some(Error::Malformed));
    }

    #[test]
    fn test_emit() {
        let repr = packet_repr();
        let mut bytes = vec![0u8; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        assert_eq!(&*packet.into_inner(), &PACKET_BYTES[..]);
    }

    #[test]
    fn test_peek_conv() {
        assert_eq!(peek_conv(&PACKET_BYTES[..]), Ok(0x1122_3344));
        assert_eq!(peek_conv(&PACKET_BYTES[..3]), Err(Error::Truncated));
    }

    #[test]
    fn test_seq_number_ordering() {
        assert!(SeqNumber(1) < SeqNumber(2));
        assert!(SeqNumber(2) > SeqNumber(1));
        assert_eq!(SeqNumber(5), SeqNumber(5));

        // ordering holds across the 32-bit wrap
        assert!(SeqNumber(0xffff_fff0) < SeqNumber(5));
        assert!(SeqNumber(5) > SeqNumber(0xffff_fff0));
    }

    #[test]
    fn test_seq_number_arithmetic() {
        assert_eq!(SeqNumber(7) - SeqNumber(3), 4);
        assert_eq!(SeqNumber(0xffff_ffff) + 2, SeqNumber(1));
        assert_eq!(SeqNumber(3) - SeqNumber(0xffff_ffff), 4);

        let mut sn = SeqNumber(41);
        sn += 1;
        assert_eq!(sn, SeqNumber(42));
    }

    #[test]
    #[should_panic(expected = "attempt to subtract sequence numbers with underflow")]
    fn test_seq_number_underflow() {
        let _ = SeqNumber(3) - SeqNumber(7);
    }
}
