//! A crate for interacting with INSTEON™ home automation devices via an
//! attached PowerLine Modem.
//!
//! # Example
//! ```no_run
//! # use insteon::{LightOnOff, LightState, LightStateChange, Modem};
//! # use insteon::Error;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error> {
//! // Use the modem attached to /dev/ttyUSB0 to turn on the dimmer
//! // with address 112233.
//! let modem = Modem::open("/dev/ttyUSB0").await?;
//! modem
//!     .set_device_state(
//!         "112233".parse()?,
//!         LightState {
//!             onoff: LightOnOff::On,
//!             change: LightStateChange::Normal,
//!             level: 1.0,
//!         },
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod constants;
mod error;
mod frame;
mod light;
mod message;
mod modem;
mod session;
mod types;

pub use constants::{CommandCode, ACK, NAK, START};
pub use error::*;
pub use frame::Packet;
pub use light::*;
pub use message::{Message, MessageFlags};
pub use modem::*;
pub use types::*;
