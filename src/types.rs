use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::Error;
use crate::light::{byte_to_on_level, clamp_level, LightOnOff, LightStateChange};

/// An [Address] identifies an INSTEON device (or the modem itself) on the
/// network. These are 3 opaque bytes, commonly printed as 6 hex characters,
/// e.g. `2ba111`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 3]);

impl Address {
    /// Returns the address as a [Group].
    ///
    /// The result is only meaningful when the address is the target of a
    /// broadcast message, where the last byte carries the group number.
    pub fn as_group(self) -> Group {
        Group(self.0[2])
    }
}

impl From<[u8; 3]> for Address {
    fn from(b: [u8; 3]) -> Self {
        Address(b)
    }
}

impl From<Address> for [u8; 3] {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parses an address from 6 hex characters, with optional `.`
    /// separators (`2ba111` and `2b.a1.11` are equivalent).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<u32> = s
            .chars()
            .filter(|c| *c != '.')
            .map(|c| c.to_digit(16).ok_or(Error::InvalidAddress))
            .collect::<Result<_, _>>()?;

        if digits.len() != 6 {
            return Err(Error::InvalidAddress);
        }

        let mut buf = [0u8; 3];

        for (i, pair) in digits.chunks(2).enumerate() {
            buf[i] = (pair[0] * 16 + pair[1]) as u8;
        }

        Ok(Address(buf))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// An all-link group number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Group(pub u8);

impl From<u8> for Group {
    fn from(b: u8) -> Self {
        Group(b)
    }
}

impl From<Group> for u8 {
    fn from(group: Group) -> Self {
        group.0
    }
}

impl FromStr for Group {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Group(s.parse()?))
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A device category, as reported by the device itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Category {
    main: u8,
    sub: u8,
}

impl Category {
    pub fn new(main: u8, sub: u8) -> Self {
        Category { main, sub }
    }

    pub fn main(self) -> u8 {
        self.main
    }

    pub fn sub(self) -> u8 {
        self.sub
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self.main {
            0x00 => "Generalized Controllers",
            0x01 => "Dimmable Lighting Control",
            0x02 => "Switched Lighting Control",
            0x03 => match self.sub {
                0x01 => "PowerLinc Serial [2414S]",
                0x02 => "PowerLinc USB [2414U]",
                0x03 => "Icon PowerLinc Serial [2814S]",
                0x04 => "Icon PowerLinc USB [2814U]",
                0x05 => "Smartlabs Power Line Modem Serial [2412S]",
                0x11 => "PowerLinc Dual Band Serial [2413S]",
                0x15 => "PowerLinc Dual Band USB [2413U]",
                _ => "Network Bridges",
            },
            0x04 => "Irrigation Control",
            0x05 => "Climate Control",
            0x06 => "Pool and Spa Control",
            0x07 => "Sensors and Actuators",
            0x08 => "Home Entertainment",
            0x09 => "Energy Management",
            0x0a => "Built-In Appliance Control",
            0x0b => "Plumbing",
            0x0c => "Communication",
            0x0d => "Computer Control",
            0x0e => "Window Coverings",
            0x0f => "Access Control",
            0x10 => "Security Health Safety",
            0x11 => "Surveillance",
            0x12 => "Automotive",
            0x13 => "Pet Care",
            0x14 => "Toys",
            0x15 => "Timekeeping",
            0x16 => "Holiday",
            0xff => "Unassigned",
            _ => "Unknown category",
        };

        f.write_str(name)
    }
}

/// Information about the attached modem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IMInfo {
    /// The network address of the modem.
    pub id: Address,
    /// The device category of the modem.
    pub category: Category,
    /// The firmware version present in the modem.
    pub firmware_version: u8,
}

bitflags! {
    /// The flags stored with an [AllLinkRecord].
    pub struct AllLinkRecordFlags: u8 {
        const IN_USE = 1 << 7;
        /// When present, the modem is linked as a responder to the record's
        /// device. If absent, the modem is a controller of it.
        const RESPONDER = 1 << 6;
        const HAS_BEEN_USED = 1 << 1;
    }
}

/// Represents the roles available when linking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AllLinkMode {
    /// The modem responds to events sent by the linked device.
    Responder = 0x00,
    /// The modem controls the linked device.
    Controller = 0x01,
    /// The effective mode depends on the order in which the modem and the
    /// device entered linking mode.
    Auto = 0x03,
    /// Causes the link to be deleted.
    Delete = 0xff,
}

impl From<AllLinkMode> for u8 {
    fn from(mode: AllLinkMode) -> Self {
        mode as u8
    }
}

impl fmt::Display for AllLinkMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AllLinkMode::Responder => "responder",
            AllLinkMode::Controller => "controller",
            AllLinkMode::Auto => "auto",
            AllLinkMode::Delete => "delete",
        };

        f.write_str(name)
    }
}

/// A single record in the modem's all-link database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllLinkRecord {
    pub flags: AllLinkRecordFlags,
    pub group: Group,
    pub id: Address,
    pub link_data: [u8; 3],
}

impl AllLinkRecord {
    /// The role the modem holds in this record.
    pub fn mode(&self) -> AllLinkMode {
        if self.flags.contains(AllLinkRecordFlags::RESPONDER) {
            AllLinkMode::Responder
        } else {
            AllLinkMode::Controller
        }
    }

    /// The display order for record listings: address bytes first, then
    /// group, then mode.
    pub(crate) fn sort_key(&self) -> (Address, Group, u8) {
        (self.id, self.group, self.mode() as u8)
    }
}

/// The result of a completed linking session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllLinkComplete {
    pub mode: AllLinkMode,
    pub group: Group,
    pub id: Address,
    pub category: Category,
    pub firmware_version: u8,
}

/// The per-device configuration exposed by dimmers.
///
/// Every field is optional: absent fields are skipped by
/// [Modem::set_device_info](super::Modem::set_device_info), leaving the
/// device value unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    pub x10_address: Option<[u8; 2]>,
    pub ramp_rate: Option<Duration>,
    pub on_level: Option<f64>,
    pub led_brightness: Option<f64>,
}

impl DeviceInfo {
    pub(crate) fn from_user_data(user_data: &[u8; 14]) -> DeviceInfo {
        DeviceInfo {
            x10_address: Some([user_data[4], user_data[5]]),
            ramp_rate: Some(byte_to_ramp_rate(user_data[6])),
            on_level: Some(byte_to_on_level(user_data[7])),
            led_brightness: Some(byte_to_led_brightness(user_data[8])),
        }
    }
}

/// A state change observed on the network by
/// [Modem::monitor](super::Modem::monitor).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceEvent {
    /// The device that announced the change.
    pub id: Address,
    pub onoff: LightOnOff,
    pub change: LightStateChange,
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} ({})", self.id, self.onoff, self.change)
    }
}

// Dimmer ramp rates are quantized to this table, ordered by increasing
// duration (and, equivalently, decreasing byte value).
const RAMP_RATES: [(Duration, u8); 31] = [
    (Duration::from_millis(100), 0x1f),
    (Duration::from_millis(200), 0x1e),
    (Duration::from_millis(300), 0x1d),
    (Duration::from_millis(500), 0x1c),
    (Duration::from_secs(2), 0x1b),
    (Duration::from_millis(4500), 0x1a),
    (Duration::from_millis(6500), 0x19),
    (Duration::from_millis(8500), 0x18),
    (Duration::from_secs(19), 0x17),
    (Duration::from_millis(21500), 0x16),
    (Duration::from_millis(23500), 0x15),
    (Duration::from_secs(26), 0x14),
    (Duration::from_secs(28), 0x13),
    (Duration::from_secs(30), 0x12),
    (Duration::from_secs(32), 0x11),
    (Duration::from_secs(34), 0x10),
    (Duration::from_millis(38500), 0x0f),
    (Duration::from_secs(43), 0x0e),
    (Duration::from_secs(47), 0x0d),
    (Duration::from_secs(60), 0x0c),
    (Duration::from_secs(90), 0x0b),
    (Duration::from_secs(120), 0x0a),
    (Duration::from_secs(150), 0x09),
    (Duration::from_secs(180), 0x08),
    (Duration::from_secs(210), 0x07),
    (Duration::from_secs(240), 0x06),
    (Duration::from_secs(270), 0x05),
    (Duration::from_secs(300), 0x04),
    (Duration::from_secs(360), 0x03),
    (Duration::from_secs(420), 0x02),
    (Duration::from_secs(480), 0x01),
];

/// Returns the tabled duration for a ramp-rate byte, falling back to the
/// smallest listed duration for bytes outside the table.
pub(crate) fn byte_to_ramp_rate(b: u8) -> Duration {
    RAMP_RATES
        .iter()
        .find(|(_, rb)| *rb == b)
        .map(|(duration, _)| *duration)
        .unwrap_or(RAMP_RATES[0].0)
}

/// Returns the largest tabled byte whose duration does not exceed the
/// requested duration.
pub(crate) fn ramp_rate_to_byte(duration: Duration) -> u8 {
    let mut value = RAMP_RATES[0].1;

    for (tabled, b) in &RAMP_RATES {
        if duration < *tabled {
            break;
        }

        value = *b;
    }

    value
}

pub(crate) fn byte_to_led_brightness(b: u8) -> f64 {
    f64::from(b & 0x7f) / 127.0
}

pub(crate) fn led_brightness_to_byte(level: f64) -> u8 {
    (clamp_level(level) * 127.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse() {
        let address = Address([0x2b, 0xa1, 0x11]);
        assert_eq!(address, "2ba111".parse().unwrap());
        assert_eq!(address, "2b.a1.11".parse().unwrap());
        assert_eq!(address, "2BA111".parse().unwrap());
    }

    #[test]
    fn address_parse_invalid() {
        assert_eq!(Err(Error::InvalidAddress), "2ba1".parse::<Address>());
        assert_eq!(Err(Error::InvalidAddress), "2ba111aa".parse::<Address>());
        assert_eq!(Err(Error::InvalidAddress), "2ba1zz".parse::<Address>());
    }

    #[test]
    fn address_display() {
        assert_eq!("2ba111", Address([0x2b, 0xa1, 0x11]).to_string());
    }

    #[test]
    fn address_as_group() {
        assert_eq!(Group(0x11), Address([0x2b, 0xa1, 0x11]).as_group());
    }

    #[test]
    fn category_names() {
        assert_eq!(
            "Smartlabs Power Line Modem Serial [2412S]",
            Category::new(0x03, 0x05).to_string()
        );
        assert_eq!(
            "Dimmable Lighting Control",
            Category::new(0x01, 0x20).to_string()
        );
        assert_eq!("Network Bridges", Category::new(0x03, 0x42).to_string());
        assert_eq!("Unknown category", Category::new(0x42, 0x00).to_string());
    }

    #[test]
    fn record_mode() {
        let mut record = AllLinkRecord {
            flags: AllLinkRecordFlags::IN_USE,
            group: Group(1),
            id: Address([0x44, 0x55, 0x66]),
            link_data: [0, 0, 0],
        };
        assert_eq!(AllLinkMode::Controller, record.mode());

        record.flags |= AllLinkRecordFlags::RESPONDER;
        assert_eq!(AllLinkMode::Responder, record.mode());
    }

    #[test]
    fn record_ordering() {
        let record = |id: [u8; 3], group: u8, responder: bool, data: u8| AllLinkRecord {
            flags: if responder {
                AllLinkRecordFlags::RESPONDER
            } else {
                AllLinkRecordFlags::empty()
            },
            group: Group(group),
            id: Address(id),
            link_data: [data, 0, 0],
        };

        let mut records = vec![
            record([0x44, 0x55, 0x66], 2, false, 0),
            record([0x44, 0x55, 0x66], 1, true, 0),
            record([0x11, 0x22, 0x33], 9, false, 1),
            record([0x44, 0x55, 0x66], 1, false, 2),
            // Same key as the record above: stability must preserve their
            // relative order.
            record([0x44, 0x55, 0x66], 1, false, 3),
        ];

        records.sort_by_key(AllLinkRecord::sort_key);

        assert_eq!(records[0].id, Address([0x11, 0x22, 0x33]));
        assert_eq!(records[1].mode(), AllLinkMode::Controller);
        assert_eq!(records[1].link_data[0], 2);
        assert_eq!(records[2].link_data[0], 3);
        assert_eq!(records[3].mode(), AllLinkMode::Responder);
        assert_eq!(records[4].group, Group(2));
    }

    #[test]
    fn ramp_rate_table_is_monotone() {
        for window in RAMP_RATES.windows(2) {
            assert!(window[0].0 < window[1].0);
            assert!(window[0].1 > window[1].1);
        }
    }

    #[test]
    fn ramp_rate_round_trip() {
        for (duration, b) in &RAMP_RATES {
            assert_eq!(*b, ramp_rate_to_byte(*duration));
            assert_eq!(*duration, byte_to_ramp_rate(*b));
        }
    }

    #[test]
    fn ramp_rate_quantization() {
        // Encoding never rounds up.
        for millis in (100..500_000).step_by(997) {
            let duration = Duration::from_millis(millis as u64);
            assert!(byte_to_ramp_rate(ramp_rate_to_byte(duration)) <= duration);
        }

        // Sub-minimum durations clamp to the fastest rate.
        assert_eq!(0x1f, ramp_rate_to_byte(Duration::from_millis(10)));

        // Out-of-table bytes decode to the fastest rate.
        assert_eq!(Duration::from_millis(100), byte_to_ramp_rate(0x20));
        assert_eq!(Duration::from_millis(100), byte_to_ramp_rate(0xff));
    }

    #[test]
    fn led_brightness_codec() {
        assert_eq!(0, led_brightness_to_byte(0.0));
        assert_eq!(127, led_brightness_to_byte(1.0));
        assert_eq!(127, led_brightness_to_byte(2.5));

        for b in 0..=0x7f {
            assert_eq!(b, led_brightness_to_byte(byte_to_led_brightness(b)));
        }

        // The high bit is ignored on decode.
        assert_eq!(1.0, byte_to_led_brightness(0xff));
    }
}
