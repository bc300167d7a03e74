//!
//! This library is the control core for bench multimeters and other SCPI
//! instruments that talk ASCII lines over a serial link.
//!
//! <br>
//!
//! # Details
//!
//! - Commands and responses are single text lines terminated by `\n`.
//!   Their content is not interpreted.
//!
//! - The link speed is negotiated by probing candidate bit rates with `*IDN?`.
//!
//! - Basic setup and connection
//!
//!   ```no_run
//!   use scpictrl::{negotiate::starts_with, NegotiationConfig, Session, SessionConfig};
//!   #[tokio::main]
//!   async fn main() -> scpictrl::Result<()> {
//!       let negotiation = NegotiationConfig {
//!           validator: starts_with("FLUKE, 8808A"),
//!           ..NegotiationConfig::default()
//!       };
//!       let session = Session::open("/dev/ttyUSB0", &negotiation, SessionConfig::default()).await?;
//!       eprintln!("Connected to: {}\n", session.identification().unwrap_or_default());
//!       println!("{}", session.send_command("VAL1?").await?);
//!       session.close().await;
//!       Ok(())
//!   }
//!   ```
//!
//! # Tested devices
//!
//!  * Fluke 8808A
//!

pub mod channel;
pub mod correlator;
pub mod listener;
pub mod negotiate;
pub mod proto;
pub mod session;

pub use channel::{Channel, Connector, SerialConnector};
pub use correlator::Mode;
pub use negotiate::{negotiate, NegotiationConfig, NegotiationResult};
pub use proto::command::IDN_QUERY;
pub use proto::{ProtoError, Result};
pub use session::{Session, SessionConfig};

#[cfg(unix)]
pub const DEFAULT_TTY: &str = "/dev/ttyUSB0";
#[cfg(windows)]
pub const DEFAULT_TTY: &str = "COM1";

/// Default Baudrate for Fluke 8808A.
pub const DEFAULT_BAUDRATE: u32 = 9600;

/// Bit rates tried when negotiating, in order.
pub const DEFAULT_CANDIDATE_BAUDRATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];
