use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use crate::constants::CommandCode;
use crate::error::Error;
use crate::frame::{Decode, Packet};
use crate::light::{byte_to_on_level, LightOnOff, LightState, LightStateChange};
use crate::message::Message;
use crate::session::{Operation, Session};
use crate::types::{
    led_brightness_to_byte, ramp_rate_to_byte, Address, AllLinkComplete, AllLinkMode,
    AllLinkRecord, DeviceEvent, DeviceInfo, Group, IMInfo,
};

/// The pacing applied between writes unless an operation knows better.
const DEFAULT_WRITE_DELAY: Duration = Duration::from_millis(500);

/// All-link database listings only read the modem's own EEPROM, so they
/// can be paced much tighter than commands that touch the powerline.
const ALL_LINK_DB_WRITE_DELAY: Duration = Duration::from_millis(100);

const COMMAND_BYTES_STATUS_REQUEST: [u8; 2] = [0x19, 0x00];
const COMMAND_BYTES_BEEP: [u8; 2] = [0x30, 0x00];
const COMMAND_BYTES_GET_DEVICE_INFO: [u8; 2] = [0x2e, 0x00];
const COMMAND_BYTES_SET_DEVICE_INFO: [u8; 2] = [0x2e, 0x00];

const COMMAND_ENTER_LINKING_MODE: u8 = 0x09;
const COMMAND_EXIT_LINKING_MODE: u8 = 0x08;

// Sub-commands of COMMAND_BYTES_SET_DEVICE_INFO, placed in user_data[1].
const SET_X10_ADDRESS: u8 = 0x04;
const SET_RAMP_RATE: u8 = 0x05;
const SET_ON_LEVEL: u8 = 0x06;
const SET_LED_BRIGHTNESS: u8 = 0x07;

/// A [Modem] is a connection to an INSTEON PowerLine Modem. It exposes the
/// modem's own services (its info, its all-link database, linking mode)
/// and the devices reachable through it (dimmer state, per-device
/// configuration, beeping).
///
/// A `Modem` is cheap to clone and safe to use from concurrent tasks:
/// requests are serialized on a single-writer slot in first-come order,
/// and replies are routed back to the operation that is waiting for them.
#[derive(Clone)]
pub struct Modem {
    session: Arc<Session>,
}

impl Modem {
    /// Constructs a `Modem` over an arbitrary duplex stream.
    ///
    /// Must be called from within a tokio runtime, as the session spawns
    /// its reader task immediately.
    pub fn new(stream: impl AsyncRead + AsyncWrite + Send + 'static) -> Modem {
        Modem {
            session: Arc::new(Session::new(stream)),
        }
    }

    /// Opens a modem from a device specification: either a
    /// `tcp://host:port` URL for a TCP-tunnelled serial line, or a path to
    /// a local serial port.
    pub async fn open(device: &str) -> Result<Modem, Error> {
        debug!("opening modem at {}", device);

        if let Some(host) = device.strip_prefix("tcp://") {
            let stream = TcpStream::connect(host).await?;

            Ok(Self::new(stream))
        } else {
            let port = tokio_serial::new(device, 19200)
                .data_bits(DataBits::Eight)
                .stop_bits(StopBits::One)
                .parity(Parity::None)
                .flow_control(FlowControl::None)
                .open_native_async()
                .map_err(io::Error::from)?;

            Ok(Self::new(port))
        }
    }

    /// Closes the session. In-flight and future operations fail.
    pub fn close(&self) {
        self.session.close();
    }

    /// Retrieves information about the modem itself.
    pub async fn get_im_info(&self) -> Result<IMInfo, Error> {
        let mut op = self.session.operation(DEFAULT_WRITE_DELAY).await?;

        op.roundtrip(&Packet::new(CommandCode::GetIMInfo)).await
    }

    /// Reads the modem's all-link database, sorted by address, group and
    /// mode.
    pub async fn get_all_link_db(&self) -> Result<Vec<AllLinkRecord>, Error> {
        let mut op = self.session.operation(ALL_LINK_DB_WRITE_DELAY).await?;
        let mut records = Vec::new();

        let reply = op
            .raw_roundtrip(&Packet::new(CommandCode::GetFirstAllLinkRecord))
            .await?;

        // A NAK to the first request means the database is empty.
        if !reply.is_nak() {
            loop {
                let record = op.read_packet(CommandCode::AllLinkRecordMessage).await?;
                records.push(AllLinkRecord::decode(&record.payload)?);

                let reply = op
                    .raw_roundtrip(&Packet::new(CommandCode::GetNextAllLinkRecord))
                    .await?;

                // A NAK here means the listing is over.
                if reply.is_nak() {
                    break;
                }
            }
        }

        records.sort_by_key(AllLinkRecord::sort_key);

        Ok(records)
    }

    /// Queries the current state of a lighting device.
    pub async fn get_device_state(&self, id: Address) -> Result<LightState, Error> {
        let mut op = self.session.operation(DEFAULT_WRITE_DELAY).await?;

        message_roundtrip(&mut op, &Message::new(id, COMMAND_BYTES_STATUS_REQUEST)).await?;

        let reply = op.read_packet(CommandCode::StandardMessageReceived).await?;
        let message = Message::decode(&reply.payload)?;
        let level = byte_to_on_level(message.command[1]);

        Ok(LightState {
            onoff: if level > 0.0 {
                LightOnOff::On
            } else {
                LightOnOff::Off
            },
            change: LightStateChange::Normal,
            level,
        })
    }

    /// Sets the state of a lighting device.
    pub async fn set_device_state(&self, id: Address, state: LightState) -> Result<(), Error> {
        let mut op = self.session.operation(DEFAULT_WRITE_DELAY).await?;

        message_roundtrip(&mut op, &Message::new(id, state.to_command_bytes())).await?;

        Ok(())
    }

    /// Causes a device to beep once.
    pub async fn beep(&self, id: Address) -> Result<(), Error> {
        let mut op = self.session.operation(DEFAULT_WRITE_DELAY).await?;

        message_roundtrip(&mut op, &Message::new(id, COMMAND_BYTES_BEEP)).await?;

        Ok(())
    }

    /// Queries the configuration of a device. All the [DeviceInfo] fields
    /// are present in the result.
    pub async fn get_device_info(&self, id: Address) -> Result<DeviceInfo, Error> {
        let mut op = self.session.operation(DEFAULT_WRITE_DELAY).await?;

        message_roundtrip(
            &mut op,
            &Message::extended(id, COMMAND_BYTES_GET_DEVICE_INFO, [0u8; 14]),
        )
        .await?;

        // The data comes in a separate extended message, after the ACK of
        // the request.
        let reply = op.read_packet(CommandCode::ExtendedMessageReceived).await?;
        let message = Message::decode(&reply.payload)?;
        let user_data = message.user_data.ok_or(Error::UnexpectedResponse)?;

        Ok(DeviceInfo::from_user_data(&user_data))
    }

    /// Writes the configuration of a device. Absent fields are left
    /// untouched on the device.
    pub async fn set_device_info(&self, id: Address, info: DeviceInfo) -> Result<(), Error> {
        if let Some(x10_address) = info.x10_address {
            self.set_device_x10_address(id, x10_address).await?;
        }

        if let Some(ramp_rate) = info.ramp_rate {
            self.set_device_ramp_rate(id, ramp_rate).await?;
        }

        if let Some(on_level) = info.on_level {
            self.set_device_on_level(id, on_level).await?;
        }

        if let Some(led_brightness) = info.led_brightness {
            self.set_device_led_brightness(id, led_brightness).await?;
        }

        Ok(())
    }

    /// Sets the X10 address of a device.
    pub async fn set_device_x10_address(
        &self,
        id: Address,
        x10_address: [u8; 2],
    ) -> Result<(), Error> {
        let mut user_data = [0u8; 14];
        user_data[1] = SET_X10_ADDRESS;
        user_data[2] = x10_address[0];
        user_data[3] = x10_address[1];

        self.set_device_field(id, user_data).await
    }

    /// Sets the ramp rate of a dimmer. The duration is quantized down to
    /// the nearest supported rate.
    pub async fn set_device_ramp_rate(&self, id: Address, ramp_rate: Duration) -> Result<(), Error> {
        let mut user_data = [0u8; 14];
        user_data[1] = SET_RAMP_RATE;
        user_data[2] = ramp_rate_to_byte(ramp_rate);

        self.set_device_field(id, user_data).await
    }

    /// Sets the on level of a dimmer, in the `[0, 1]` range.
    pub async fn set_device_on_level(&self, id: Address, level: f64) -> Result<(), Error> {
        let mut user_data = [0u8; 14];
        user_data[1] = SET_ON_LEVEL;
        user_data[2] = crate::light::on_level_to_byte(level);

        self.set_device_field(id, user_data).await
    }

    /// Sets the LED brightness of a device, in the `[0, 1]` range.
    pub async fn set_device_led_brightness(&self, id: Address, level: f64) -> Result<(), Error> {
        let mut user_data = [0u8; 14];
        user_data[1] = SET_LED_BRIGHTNESS;
        user_data[2] = led_brightness_to_byte(level);

        self.set_device_field(id, user_data).await
    }

    async fn set_device_field(&self, id: Address, user_data: [u8; 14]) -> Result<(), Error> {
        let mut op = self.session.operation(DEFAULT_WRITE_DELAY).await?;

        message_roundtrip(
            &mut op,
            &Message::extended(id, COMMAND_BYTES_SET_DEVICE_INFO, user_data),
        )
        .await?;

        Ok(())
    }

    /// Watches the network for device state changes, pushing a
    /// [DeviceEvent] into `events` for every state-change broadcast.
    ///
    /// Runs until the future is dropped, the events receiver is closed, or
    /// the session closes. A monitor only listens: it does not occupy the
    /// write slot, so operations keep flowing while it runs.
    pub async fn monitor(&self, events: mpsc::Sender<DeviceEvent>) -> Result<(), Error> {
        let mut inbox = self.session.open_inbox();

        loop {
            let packet = tokio::select! {
                packet = inbox.recv() => packet.ok_or(Error::Disconnected)?,
                _ = self.session.close_token().cancelled() => return Err(Error::Cancelled),
            };

            if packet.command_code != CommandCode::StandardMessageReceived {
                continue;
            }

            let message = Message::decode(&packet.payload)?;

            if !message.is_broadcast() {
                continue;
            }

            let state = match LightState::from_command_bytes(message.command) {
                Some(state) => state,
                None => continue,
            };

            let source = match message.source {
                Some(source) => source,
                None => continue,
            };

            let event = DeviceEvent {
                id: source,
                onoff: state.onoff,
                change: state.change,
            };

            debug!("observed device event: {}", event);

            if events.send(event).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Puts the modem into linking mode and waits for a link to complete.
    ///
    /// The wait ends when a device is linked (usually after its set button
    /// is held down) or when the future is dropped.
    pub async fn start_all_linking(
        &self,
        mode: AllLinkMode,
        group: Group,
    ) -> Result<AllLinkComplete, Error> {
        let mut op = self.session.operation(DEFAULT_WRITE_DELAY).await?;

        op.roundtrip::<()>(&Packet::with_payload(
            CommandCode::StartAllLinking,
            vec![mode.into(), group.into()],
        ))
        .await?;

        let reply = op.read_packet(CommandCode::AllLinkingCompleted).await?;

        AllLinkComplete::decode(&reply.payload)
    }

    /// Takes the modem out of linking mode. A NAK (nothing to cancel) is
    /// treated as success.
    pub async fn cancel_all_linking(&self) -> Result<(), Error> {
        let mut op = self.session.operation(DEFAULT_WRITE_DELAY).await?;

        op.raw_roundtrip(&Packet::new(CommandCode::CancelAllLinking))
            .await?;

        Ok(())
    }

    /// Links a device to the modem.
    ///
    /// When `device` is given, the device is asked to enter linking mode
    /// remotely, so nobody has to walk over and hold its set button; it is
    /// asked to leave linking mode again once the link completes.
    pub async fn link_device(
        &self,
        device: Option<Address>,
        mode: AllLinkMode,
        group: Group,
    ) -> Result<AllLinkComplete, Error> {
        // A prior linking session would swallow the completion report.
        self.cancel_all_linking().await?;

        if let Some(device) = device {
            self.send_linking_mode_command(device, COMMAND_ENTER_LINKING_MODE, group)
                .await?;
        }

        let result = self.start_all_linking(mode, group).await;

        if let Some(device) = device {
            // Best effort: the link itself already succeeded or failed.
            let _ = self
                .send_linking_mode_command(device, COMMAND_EXIT_LINKING_MODE, group)
                .await;
        }

        let _ = self.cancel_all_linking().await;

        result
    }

    async fn send_linking_mode_command(
        &self,
        device: Address,
        command: u8,
        group: Group,
    ) -> Result<(), Error> {
        let mut op = self.session.operation(DEFAULT_WRITE_DELAY).await?;

        message_roundtrip(
            &mut op,
            &Message::extended(device, [command, group.into()], [0u8; 14]),
        )
        .await?;

        Ok(())
    }
}

/// Encodes a message, sends it as a `SendStandardOrExtendedMessage`
/// command and returns the decoded echo.
///
/// For the duration of the step the write pacing is derived from the
/// message itself: each hop costs 12 time slots of 1/60 s for a standard
/// message and 26 for an extended one.
async fn message_roundtrip(op: &mut Operation<'_>, message: &Message) -> Result<Message, Error> {
    let slots = if message.is_extended() { 26.0 } else { 12.0 };
    let delay = Duration::from_secs_f64(f64::from(message.hops_left) * slots / 60.0);

    let saved = op.set_write_delay(delay);
    let result = op
        .roundtrip(&Packet::with_payload(
            CommandCode::SendStandardOrExtendedMessage,
            message.encode(),
        ))
        .await;
    op.set_write_delay(saved);

    result
}
