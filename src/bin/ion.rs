use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use prettytable::{cell, format::FormatBuilder, row, table, Table};
use structopt::StructOpt;
use tokio::sync::mpsc;

use insteon::*;

#[derive(StructOpt, Debug)]
#[structopt(name = "ion", about = "Control INSTEON devices through a PowerLine Modem")]
struct App {
    /// The PLM to use: a serial port path (e.g. /dev/ttyUSB0) or a
    /// tcp://host:port URL.
    #[structopt(short, long, env = "INSTEON_POWERLINE_MODEM_DEVICE")]
    device: String,

    #[structopt(subcommand)]
    command: AppCommand,
}

#[derive(StructOpt, Debug)]
enum AppCommand {
    Modem(ModemCommand),
    Device(DeviceCommand),
    /// Watch the network for device state changes
    Monitor,
}

#[derive(StructOpt, Debug)]
#[structopt(about = "Modem commands")]
enum ModemCommand {
    /// Show information about the modem
    Info,
    /// List the modem's all-link database
    Links,
    /// Link a device to the modem
    Link {
        /// The address of the device to link. When given, the device is
        /// put into linking mode remotely.
        address: Option<Address>,

        /// Link the modem as a controller of the device
        #[structopt(short, long, conflicts_with = "responder", conflicts_with = "delete")]
        controller: bool,

        /// Link the modem as a responder to the device
        #[structopt(short, long, conflicts_with = "controller", conflicts_with = "delete")]
        responder: bool,

        /// Delete the link instead of creating one
        #[structopt(
            short,
            long,
            conflicts_with = "controller",
            conflicts_with = "responder"
        )]
        delete: bool,

        /// The group number to link
        #[structopt(short, long, default_value = "1")]
        group: Group,
    },
}

#[derive(StructOpt, Debug)]
#[structopt(about = "Device commands")]
enum DeviceCommand {
    /// Turn a device on
    On {
        #[structopt(flatten)]
        common: DeviceFlags,

        /// The level to set for dimmable devices, in percent.
        #[structopt(short, long, default_value = "100")]
        level: u8,

        /// Change instantly, without ramping.
        #[structopt(short, long)]
        instant: bool,
    },
    /// Turn a device off
    Off {
        #[structopt(flatten)]
        common: DeviceFlags,

        /// Change instantly, without ramping.
        #[structopt(short, long)]
        instant: bool,
    },
    /// Cause a device to beep
    Beep {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Retrieve the current device state
    Status {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Retrieve the device configuration
    Info {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Set the ramp rate of a dimmer
    SetRampRate {
        #[structopt(flatten)]
        common: DeviceFlags,

        /// The ramp duration, in seconds.
        seconds: f64,
    },
    /// Set the on level of a dimmer
    SetOnLevel {
        #[structopt(flatten)]
        common: DeviceFlags,

        /// The on level, in percent.
        level: u8,
    },
    /// Set the LED brightness of a device
    SetLedBrightness {
        #[structopt(flatten)]
        common: DeviceFlags,

        /// The LED brightness, in percent.
        level: u8,
    },
}

#[derive(StructOpt, Debug)]
struct DeviceFlags {
    /// Address of the device, as 6 hex characters.
    address: Address,
}

macro_rules! ptable {
	($($e:tt), +) => {
		let mut table = table!($($e),+);
		let format = FormatBuilder::new()
			.column_separator(' ')
			.padding(0, 1)
			.build();

		table.set_format(format);
		table.printstd();
    };
}

fn create_table() -> Table {
    let mut table = Table::new();
    let format = FormatBuilder::new()
        .column_separator(' ')
        .padding(0, 1)
        .build();

    table.set_format(format);
    table
}

fn percent_to_level(level: u8) -> f64 {
    f64::from(level.min(100)) / 100.0
}

async fn modem_info(modem: &Modem) -> Result<()> {
    let info = modem.get_im_info().await?;

    ptable!(
        ["Address", info.id],
        ["Category", info.category],
        ["Firmware Version", info.firmware_version]
    );

    Ok(())
}

async fn modem_links(modem: &Modem) -> Result<()> {
    let records = modem.get_all_link_db().await?;

    let mut table = create_table();
    table.set_titles(row![b->"Address", b->"Mode", b->"Group"]);

    for record in records {
        table.add_row(row![record.id, record.mode(), record.group]);
    }

    table.printstd();

    Ok(())
}

async fn modem_link(
    modem: &Modem,
    address: Option<Address>,
    mode: AllLinkMode,
    group: Group,
) -> Result<()> {
    let response = modem.link_device(address, mode, group).await?;

    ptable!(
        ["Address", response.id],
        ["Mode", response.mode],
        ["Group", response.group],
        ["Category", response.category],
        ["Firmware Version", response.firmware_version]
    );

    Ok(())
}

async fn monitor(modem: &Modem) -> Result<()> {
    let (sender, mut receiver) = mpsc::channel(10);

    let printer = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            println!("{}", event);
        }
    });

    modem.monitor(sender).await?;
    printer.await?;

    Ok(())
}

async fn handle_device_command(modem: &Modem, command: DeviceCommand) -> Result<()> {
    match command {
        DeviceCommand::On {
            common,
            level,
            instant,
        } => {
            modem
                .set_device_state(
                    common.address,
                    LightState {
                        onoff: LightOnOff::On,
                        change: if instant {
                            LightStateChange::Instant
                        } else {
                            LightStateChange::Normal
                        },
                        level: percent_to_level(level),
                    },
                )
                .await?;
        }
        DeviceCommand::Off { common, instant } => {
            modem
                .set_device_state(
                    common.address,
                    LightState {
                        onoff: LightOnOff::Off,
                        change: if instant {
                            LightStateChange::Instant
                        } else {
                            LightStateChange::Normal
                        },
                        level: 0.0,
                    },
                )
                .await?;
        }
        DeviceCommand::Beep { common } => {
            modem.beep(common.address).await?;
        }
        DeviceCommand::Status { common } => {
            let state = modem.get_device_state(common.address).await?;

            ptable!(
                ["State", state.onoff],
                ["Level", format!("{:.0}%", state.level * 100.0)]
            );
        }
        DeviceCommand::Info { common } => {
            let info = modem.get_device_info(common.address).await?;

            let x10_address = info
                .x10_address
                .map(|b| format!("{:02x}{:02x}", b[0], b[1]))
                .unwrap_or_default();
            let ramp_rate = info
                .ramp_rate
                .map(|d| format!("{:?}", d))
                .unwrap_or_default();
            let on_level = info
                .on_level
                .map(|l| format!("{:.0}%", l * 100.0))
                .unwrap_or_default();
            let led_brightness = info
                .led_brightness
                .map(|l| format!("{:.0}%", l * 100.0))
                .unwrap_or_default();

            ptable!(
                ["X10 Address", x10_address],
                ["Ramp Rate", ramp_rate],
                ["On Level", on_level],
                ["LED Brightness", led_brightness]
            );
        }
        DeviceCommand::SetRampRate { common, seconds } => {
            modem
                .set_device_ramp_rate(common.address, Duration::from_secs_f64(seconds))
                .await?;
        }
        DeviceCommand::SetOnLevel { common, level } => {
            modem
                .set_device_on_level(common.address, percent_to_level(level))
                .await?;
        }
        DeviceCommand::SetLedBrightness { common, level } => {
            modem
                .set_device_led_brightness(common.address, percent_to_level(level))
                .await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let app = App::from_args();

    debug!("{:#?}", app);

    let modem = Modem::open(&app.device)
        .await
        .with_context(|| format!("failed to open modem at {}", app.device))?;

    match app.command {
        AppCommand::Modem(ModemCommand::Info) => modem_info(&modem).await?,
        AppCommand::Modem(ModemCommand::Links) => modem_links(&modem).await?,
        AppCommand::Modem(ModemCommand::Link {
            address,
            controller,
            responder,
            delete,
            group,
        }) => {
            let mode = if controller {
                AllLinkMode::Controller
            } else if responder {
                AllLinkMode::Responder
            } else if delete {
                AllLinkMode::Delete
            } else {
                AllLinkMode::Auto
            };

            modem_link(&modem, address, mode, group).await?
        }
        AppCommand::Device(command) => handle_device_command(&modem, command).await?,
        AppCommand::Monitor => monitor(&modem).await?,
    }

    Ok(())
}
