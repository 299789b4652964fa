use bitflags::bitflags;
use nom::bytes::complete::take;
use nom::number::complete::u8 as any_byte;
use nom::IResult;

use crate::error::Error;
use crate::frame::{address, complete, Decode};
use crate::types::Address;

bitflags! {
    /// The flag nibble of a [Message] flags byte.
    pub struct MessageFlags: u8 {
        /// The message carries 14 bytes of user data.
        const EXTENDED = 0x10;
        /// The message acknowledges a previous one.
        const ACK = 0x20;
        /// The message relates to an all-link group.
        const ALL_LINK = 0x40;
        /// The message is broadcast rather than addressed to a single
        /// device. Device state changes are announced this way.
        const BROADCAST = 0x80;
    }
}

impl Default for MessageFlags {
    fn default() -> Self {
        MessageFlags::empty()
    }
}

/// An INSTEON application-layer message, as relayed by the PLM.
///
/// A single type covers both directions: messages received from the
/// network carry the [source](Message::source) address of the emitting
/// device, while messages written to the PLM omit it (the PLM stamps its
/// own address on transmission). The two encodings differ only in that
/// prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    /// The emitting device, absent on messages the host sends.
    pub source: Option<Address>,
    pub target: Address,
    pub flags: MessageFlags,
    pub hops_left: u8,
    pub max_hops: u8,
    pub command: [u8; 2],
    /// The 14 bytes of user data carried by extended messages. The final
    /// byte transports a checksum on the wire and always reads as zero
    /// here.
    pub user_data: Option<[u8; 14]>,
}

impl Message {
    /// A standard message for a device.
    pub fn new(target: Address, command: [u8; 2]) -> Message {
        Message {
            source: None,
            target,
            flags: MessageFlags::empty(),
            hops_left: 3,
            max_hops: 3,
            command,
            user_data: None,
        }
    }

    /// An extended message for a device.
    ///
    /// The last user-data byte is reserved for the checksum and is
    /// overwritten on encoding.
    pub fn extended(target: Address, command: [u8; 2], user_data: [u8; 14]) -> Message {
        Message {
            source: None,
            target,
            flags: MessageFlags::EXTENDED,
            hops_left: 3,
            max_hops: 3,
            command,
            user_data: Some(user_data),
        }
    }

    pub fn is_extended(&self) -> bool {
        self.user_data.is_some() || self.flags.contains(MessageFlags::EXTENDED)
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags.contains(MessageFlags::BROADCAST)
    }

    fn flags_byte(&self) -> u8 {
        let mut b = self.flags.bits() | ((self.hops_left & 0x03) << 2) | (self.max_hops & 0x03);

        if self.user_data.is_some() {
            b |= MessageFlags::EXTENDED.bits();
        }

        b
    }

    /// Serializes the message in the host-to-PLM layout: target, flags
    /// byte, command bytes and, for extended messages, the user data with
    /// the checksum placed in its final byte.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(if self.user_data.is_some() { 20 } else { 6 });

        data.extend_from_slice(&<[u8; 3]>::from(self.target));
        data.push(self.flags_byte());
        data.extend_from_slice(&self.command);

        if let Some(user_data) = self.user_data {
            let mut user_data = user_data;
            user_data[13] = checksum(&self.command, &user_data);
            data.extend_from_slice(&user_data);
        }

        data
    }
}

impl Decode for Message {
    /// Decodes either layout, sized by the payload length: 9 or 23 bytes
    /// for received messages, 6 or 20 for the echo of a sent one.
    ///
    /// Extended messages must carry a valid checksum in their final
    /// user-data byte; the byte is not data and reads back as zero.
    fn decode(payload: &[u8]) -> Result<Self, Error> {
        let (with_source, extended) = match payload.len() {
            9 => (true, false),
            23 => (true, true),
            6 => (false, false),
            20 => (false, true),
            n => {
                return Err(Error::Format(format!(
                    "unexpected message length: {} byte(s)",
                    n
                )))
            }
        };

        let mut message = complete(parse_message(payload, with_source, extended))?;

        if let Some(user_data) = &mut message.user_data {
            if checksum(&message.command, user_data) != user_data[13] {
                return Err(Error::Format("bad extended-message checksum".into()));
            }

            user_data[13] = 0;
        }

        Ok(message)
    }
}

fn parse_message(input: &[u8], with_source: bool, extended: bool) -> IResult<&[u8], Message> {
    let (input, source) = if with_source {
        let (input, source) = address(input)?;
        (input, Some(source))
    } else {
        (input, None)
    };

    let (input, target) = address(input)?;
    let (input, flags_byte) = any_byte(input)?;
    let (input, command) = take(2usize)(input)?;

    let (input, user_data) = if extended {
        let (input, data) = take(14usize)(input)?;
        let mut user_data = [0u8; 14];
        user_data.copy_from_slice(data);
        (input, Some(user_data))
    } else {
        (input, None)
    };

    Ok((
        input,
        Message {
            source,
            target,
            flags: MessageFlags::from_bits_truncate(flags_byte),
            hops_left: (flags_byte >> 2) & 0x03,
            max_hops: flags_byte & 0x03,
            command: [command[0], command[1]],
            user_data,
        },
    ))
}

/// The checksum placed in the final user-data byte of extended messages:
/// the two's complement of the sum of the command bytes and the first 13
/// user-data bytes.
pub(crate) fn checksum(command: &[u8; 2], user_data: &[u8; 14]) -> u8 {
    let sum = command
        .iter()
        .chain(&user_data[..13])
        .fold(0u8, |sum, b| sum.wrapping_add(*b));

    (0xff ^ sum).wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Address {
        "112233".parse().unwrap()
    }

    #[test]
    fn encode_standard() {
        let message = Message::new(target(), [0x11, 0xff]);

        assert_eq!(vec![0x11, 0x22, 0x33, 0x0f, 0x11, 0xff], message.encode());
    }

    #[test]
    fn encode_extended_places_checksum() {
        let mut user_data = [0u8; 14];
        user_data[1] = 0x05;
        user_data[2] = 0x1c;

        let message = Message::extended(target(), [0x2e, 0x00], user_data);
        let encoded = message.encode();

        assert_eq!(20, encoded.len());
        assert_eq!(0x1f, encoded[3]);

        // The checksum closes the sum of the command and user-data bytes
        // over one byte.
        let sum = encoded[4..].iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
        assert_eq!(0, sum);
    }

    #[test]
    fn round_trip_standard() {
        let message = Message::new(target(), [0x19, 0x00]);

        assert_eq!(message, Message::decode(&message.encode()).unwrap());
    }

    #[test]
    fn round_trip_extended() {
        let mut user_data = [0u8; 14];
        user_data[1] = 0x07;
        user_data[2] = 0x40;

        let message = Message::extended(target(), [0x2e, 0x00], user_data);

        assert_eq!(message, Message::decode(&message.encode()).unwrap());
    }

    #[test]
    fn decode_received_standard() {
        let message =
            Message::decode(&[0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01, 0xcb, 0x11, 0xff]).unwrap();

        assert_eq!(Some("aabbcc".parse().unwrap()), message.source);
        assert_eq!("000001".parse::<Address>().unwrap(), message.target);
        assert!(message.is_broadcast());
        assert!(message.flags.contains(MessageFlags::ALL_LINK));
        assert_eq!(2, message.hops_left);
        assert_eq!(3, message.max_hops);
        assert_eq!([0x11, 0xff], message.command);
        assert_eq!(None, message.user_data);
    }

    #[test]
    fn decode_received_extended() {
        let command = [0x2e, 0x00];
        let mut user_data = [0u8; 14];
        user_data[6] = 0x1c;
        user_data[7] = 0x7f;
        user_data[13] = checksum(&command, &user_data);

        let mut payload = vec![0xaa, 0xbb, 0xcc, 0x11, 0x22, 0x33, 0x1b];
        payload.extend_from_slice(&command);
        payload.extend_from_slice(&user_data);

        let message = Message::decode(&payload).unwrap();

        assert!(message.is_extended());
        let decoded = message.user_data.unwrap();
        assert_eq!(0x1c, decoded[6]);
        // The checksum byte is discarded after validation.
        assert_eq!(0, decoded[13]);
    }

    #[test]
    fn decode_rejects_corrupt_extended() {
        let command = [0x2e, 0x00];
        let mut user_data = [0u8; 14];
        user_data[6] = 0x1c;
        user_data[13] = checksum(&command, &user_data);

        let mut payload = vec![0xaa, 0xbb, 0xcc, 0x11, 0x22, 0x33, 0x1b];
        payload.extend_from_slice(&command);
        payload.extend_from_slice(&user_data);

        // Flipping any checksummed byte must be caught.
        for i in 7..payload.len() - 1 {
            let mut corrupt = payload.clone();
            corrupt[i] ^= 0x01;

            assert!(
                matches!(Message::decode(&corrupt), Err(Error::Format(_))),
                "corruption at byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn decode_rejects_bad_lengths() {
        for len in [0, 1, 5, 7, 8, 10, 21, 22, 24] {
            assert!(matches!(
                Message::decode(&vec![0u8; len]),
                Err(Error::Format(_))
            ));
        }
    }

    #[test]
    fn checksum_closes_sum() {
        let command = [0x2e, 0x00];
        let mut user_data = [0x10u8; 14];
        user_data[13] = checksum(&command, &user_data);

        let sum = command
            .iter()
            .chain(&user_data)
            .fold(0u8, |sum, b| sum.wrapping_add(*b));

        assert_eq!(0, sum);
    }
}
