use bytes::{Buf, BufMut, BytesMut};
use nom::bytes::complete::take;
use nom::combinator::map;
use nom::number::complete::u8 as any_byte;
use nom::IResult;
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::*;
use crate::error::Error;
use crate::types::{Address, AllLinkComplete, AllLinkMode, AllLinkRecord, AllLinkRecordFlags, Category, Group, IMInfo};

/// A single frame exchanged with the PLM: a command code, its payload and,
/// for host commands, the trailing ACK or NAK byte the PLM appends to the
/// echo of the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command_code: CommandCode,
    pub payload: Vec<u8>,
    pub ack: Option<u8>,
}

impl Packet {
    /// A host command with an empty payload.
    pub fn new(command_code: CommandCode) -> Packet {
        Packet {
            command_code,
            payload: Vec::new(),
            ack: None,
        }
    }

    pub fn with_payload(command_code: CommandCode, payload: Vec<u8>) -> Packet {
        Packet {
            command_code,
            payload,
            ack: None,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.ack == Some(ACK)
    }

    pub fn is_nak(&self) -> bool {
        self.ack == Some(NAK)
    }

    /// Splits a whole frame, as returned by the framer, into payload and
    /// trailing ACK byte. Host-command echoes carry the ACK byte;
    /// unsolicited frames do not.
    fn from_frame(command_code: CommandCode, frame: &[u8]) -> Packet {
        let mut payload = &frame[2..];
        let mut ack = None;

        if command_code.is_outgoing() {
            let (rest, last) = payload.split_at(payload.len() - 1);
            payload = rest;
            ack = Some(last[0]);
        }

        Packet {
            command_code,
            payload: payload.to_vec(),
            ack,
        }
    }
}

/// The byte-level framer and serializer for [Packet]s.
///
/// Decoding scans for the `0x02` frame start, discarding garbage in
/// between, and sizes the frame with the receive-side table of
/// [CommandCode::receive_payload_size]. On unknown command codes only the
/// start byte is dropped, so a frame start hiding in the discarded byte is
/// picked up on the next scan.
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Error> {
        loop {
            // Resynchronize on the next frame start.
            match src.iter().position(|&b| b == START) {
                Some(n) => src.advance(n),
                None => {
                    src.clear();
                    return Ok(None);
                }
            }

            if src.len() < 2 {
                return Ok(None);
            }

            let command_code = match CommandCode::from_byte(src[1]) {
                Some(command_code) => command_code,
                None => {
                    src.advance(1);
                    continue;
                }
            };

            let size = match command_code {
                CommandCode::SendStandardOrExtendedMessage => {
                    // The echo is 14 bytes longer when the extended flag is
                    // set in the echoed flags byte (after the 3-byte
                    // target).
                    if src.len() < 6 {
                        return Ok(None);
                    }

                    if src[5] & 0x10 != 0 {
                        21
                    } else {
                        7
                    }
                }
                _ => command_code.receive_payload_size(),
            };

            if src.len() < 2 + size {
                src.reserve(2 + size - src.len());
                return Ok(None);
            }

            let frame = src.split_to(2 + size);

            return Ok(Some(Packet::from_frame(command_code, &frame)));
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(2 + item.payload.len());
        dst.put_u8(START);
        dst.put_u8(item.command_code as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

/// Decodes a typed value out of a packet payload.
pub(crate) trait Decode: Sized {
    fn decode(payload: &[u8]) -> Result<Self, Error>;
}

/// Used by operations that check the ACK byte but do not decode a reply.
impl Decode for () {
    fn decode(_: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

/// Runs a parser that must consume the whole payload.
pub(crate) fn complete<T>(result: IResult<&[u8], T>) -> Result<T, Error> {
    match result {
        Ok((rest, value)) if rest.is_empty() => Ok(value),
        Ok((rest, _)) => Err(Error::Format(format!(
            "{} trailing byte(s) after payload",
            rest.len()
        ))),
        Err(_) => Err(Error::Format("malformed payload".into())),
    }
}

pub(crate) fn address(input: &[u8]) -> IResult<&[u8], Address> {
    map(take(3usize), |b: &[u8]| {
        Address::from([b[0], b[1], b[2]])
    })(input)
}

fn category(input: &[u8]) -> IResult<&[u8], Category> {
    let (input, main) = any_byte(input)?;
    let (input, sub) = any_byte(input)?;

    Ok((input, Category::new(main, sub)))
}

impl Decode for IMInfo {
    fn decode(payload: &[u8]) -> Result<Self, Error> {
        complete(parse_im_info(payload))
    }
}

fn parse_im_info(input: &[u8]) -> IResult<&[u8], IMInfo> {
    let (input, id) = address(input)?;
    let (input, category) = category(input)?;
    let (input, firmware_version) = any_byte(input)?;

    Ok((
        input,
        IMInfo {
            id,
            category,
            firmware_version,
        },
    ))
}

impl Decode for AllLinkRecord {
    fn decode(payload: &[u8]) -> Result<Self, Error> {
        complete(parse_all_link_record(payload))
    }
}

fn parse_all_link_record(input: &[u8]) -> IResult<&[u8], AllLinkRecord> {
    let (input, flags) = any_byte(input)?;
    let (input, group) = any_byte(input)?;
    let (input, id) = address(input)?;
    let (input, link_data) = take(3usize)(input)?;

    Ok((
        input,
        AllLinkRecord {
            flags: AllLinkRecordFlags::from_bits_truncate(flags),
            group: Group(group),
            id,
            link_data: [link_data[0], link_data[1], link_data[2]],
        },
    ))
}

impl Decode for AllLinkComplete {
    fn decode(payload: &[u8]) -> Result<Self, Error> {
        let (mode_byte, report) = complete(parse_all_link_complete(payload))?;

        let mode = match mode_byte {
            0x00 => AllLinkMode::Responder,
            0x01 => AllLinkMode::Controller,
            0x03 => AllLinkMode::Auto,
            0xff => AllLinkMode::Delete,
            b => return Err(Error::Format(format!("unknown all-link mode {:#04x}", b))),
        };

        Ok(AllLinkComplete { mode, ..report })
    }
}

fn parse_all_link_complete(input: &[u8]) -> IResult<&[u8], (u8, AllLinkComplete)> {
    let (input, mode_byte) = any_byte(input)?;
    let (input, group) = any_byte(input)?;
    let (input, id) = address(input)?;
    let (input, category) = category(input)?;
    let (input, firmware_version) = any_byte(input)?;

    Ok((
        input,
        (
            mode_byte,
            AllLinkComplete {
                // Patched by the caller once the byte is validated.
                mode: AllLinkMode::Auto,
                group: Group(group),
                id,
                category,
                firmware_version,
            },
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut PacketCodec, bytes: &[u8]) -> Vec<Packet> {
        let mut src = BytesMut::from(bytes);
        let mut packets = Vec::new();

        while let Some(packet) = codec.decode(&mut src).unwrap() {
            packets.push(packet);
        }

        packets
    }

    #[test]
    fn resync_on_garbage() {
        let packets = decode_all(
            &mut PacketCodec,
            &[
                0xff, 0xff, 0x02, 0x50, 0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01, 0xcb, 0x11, 0xff,
            ],
        );

        assert_eq!(1, packets.len());
        assert_eq!(CommandCode::StandardMessageReceived, packets[0].command_code);
        assert_eq!(
            vec![0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01, 0xcb, 0x11, 0xff],
            packets[0].payload
        );
        assert_eq!(None, packets[0].ack);
    }

    #[test]
    fn unknown_command_code_is_skipped() {
        // 0x5f is not a known command code: the framer must drop the start
        // byte and recover the GetIMInfo echo that follows.
        let packets = decode_all(
            &mut PacketCodec,
            &[
                0x02, 0x5f, 0x02, 0x60, 0x1a, 0x2b, 0x3c, 0x03, 0x05, 0x04, 0x06,
            ],
        );

        assert_eq!(1, packets.len());
        assert_eq!(CommandCode::GetIMInfo, packets[0].command_code);
    }

    #[test]
    fn start_byte_hiding_behind_unknown_code() {
        // The byte after a lone 0x02 is itself 0x02 and starts a real
        // frame: resynchronization must not eat it.
        let packets = decode_all(&mut PacketCodec, &[0x02, 0x02, 0x69, 0x15]);

        assert_eq!(1, packets.len());
        assert_eq!(CommandCode::GetFirstAllLinkRecord, packets[0].command_code);
        assert!(packets[0].is_nak());
    }

    #[test]
    fn outgoing_echo_carries_ack() {
        let packets = decode_all(
            &mut PacketCodec,
            &[0x02, 0x62, 0x11, 0x22, 0x33, 0x0f, 0x11, 0xff, 0x06],
        );

        assert_eq!(1, packets.len());
        assert_eq!(
            vec![0x11, 0x22, 0x33, 0x0f, 0x11, 0xff],
            packets[0].payload
        );
        assert!(packets[0].is_ack());
    }

    #[test]
    fn extended_echo_is_sized_by_flags() {
        let mut frame = vec![0x02, 0x62, 0x11, 0x22, 0x33, 0x1f, 0x2e, 0x00];
        frame.extend_from_slice(&[0u8; 14]);
        frame.push(0x06);

        let packets = decode_all(&mut PacketCodec, &frame);

        assert_eq!(1, packets.len());
        assert_eq!(20, packets[0].payload.len());
        assert!(packets[0].is_ack());
    }

    #[test]
    fn incomplete_frame_waits_for_more() {
        let mut codec = PacketCodec;
        let mut src = BytesMut::from(&[0x02, 0x50, 0xaa, 0xbb][..]);

        assert_eq!(None, codec.decode(&mut src).unwrap());

        src.extend_from_slice(&[0xcc, 0x00, 0x00, 0x01, 0xcb, 0x11, 0xff]);
        let packet = codec.decode(&mut src).unwrap().unwrap();

        assert_eq!(CommandCode::StandardMessageReceived, packet.command_code);
        assert!(src.is_empty());
    }

    #[test]
    fn empty_payload_frame() {
        let packets = decode_all(&mut PacketCodec, &[0x02, 0x55]);

        assert_eq!(1, packets.len());
        assert_eq!(CommandCode::UserResetDetected, packets[0].command_code);
        assert!(packets[0].payload.is_empty());
    }

    #[test]
    fn consecutive_frames() {
        let packets = decode_all(
            &mut PacketCodec,
            &[0x02, 0x69, 0x06, 0x02, 0x57, 0x00, 0x01, 0x44, 0x55, 0x66, 0x00, 0x00, 0x00],
        );

        assert_eq!(2, packets.len());
        assert_eq!(CommandCode::GetFirstAllLinkRecord, packets[0].command_code);
        assert_eq!(CommandCode::AllLinkRecordMessage, packets[1].command_code);
    }

    #[test]
    fn encode_prefixes_start() {
        let mut codec = PacketCodec;
        let mut dst = BytesMut::new();

        codec
            .encode(
                Packet::with_payload(CommandCode::StartAllLinking, vec![0x01, 0x2a]),
                &mut dst,
            )
            .unwrap();

        assert_eq!(&[0x02, 0x64, 0x01, 0x2a][..], &dst[..]);
    }

    #[test]
    fn decode_im_info() {
        let info = IMInfo::decode(&[0x1a, 0x2b, 0x3c, 0x03, 0x05, 0x04]).unwrap();

        assert_eq!("1a2b3c".parse::<Address>().unwrap(), info.id);
        assert_eq!(Category::new(0x03, 0x05), info.category);
        assert_eq!(0x04, info.firmware_version);

        assert!(IMInfo::decode(&[0x1a, 0x2b, 0x3c]).is_err());
    }

    #[test]
    fn decode_all_link_record() {
        let record = AllLinkRecord::decode(&[0x00, 0x01, 0x44, 0x55, 0x66, 0x00, 0x00, 0x00]).unwrap();

        assert_eq!(AllLinkMode::Controller, record.mode());
        assert_eq!(Group(1), record.group);
        assert_eq!("445566".parse::<Address>().unwrap(), record.id);
        assert_eq!([0, 0, 0], record.link_data);
    }

    #[test]
    fn decode_all_link_complete() {
        let complete =
            AllLinkComplete::decode(&[0x01, 0x2a, 0x44, 0x55, 0x66, 0x01, 0x20, 0x41]).unwrap();

        assert_eq!(AllLinkMode::Controller, complete.mode);
        assert_eq!(Group(0x2a), complete.group);
        assert_eq!("445566".parse::<Address>().unwrap(), complete.id);
        assert_eq!(Category::new(0x01, 0x20), complete.category);
        assert_eq!(0x41, complete.firmware_version);

        assert!(matches!(
            AllLinkComplete::decode(&[0x42, 0x2a, 0x44, 0x55, 0x66, 0x01, 0x20, 0x41]),
            Err(Error::Format(_))
        ));
    }
}
