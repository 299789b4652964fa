/// Errors returned from various operations.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("I/O error: {0:?}")]
    Io(::std::io::ErrorKind),

    /// A well-framed packet or [Message](super::Message) failed to decode
    /// (bad length, unknown value, bad extended-message checksum).
    #[error("format error: {0}")]
    Format(String),

    /// A host command was not acknowledged by the modem.
    ///
    /// The request engine retries most commands on this; the all-link
    /// listing recipes reinterpret it as an end-of-list signal.
    #[error("command was not acknowledged")]
    NotAcknowledged,

    /// An invalid [Address](super::Address) string was passed.
    #[error("invalid address, expected 6 hex digits")]
    InvalidAddress,

    /// A reply did not have the shape the operation expected.
    #[error("unexpected response received")]
    UnexpectedResponse,

    /// The session was closed while the operation was in flight.
    #[error("operation was cancelled")]
    Cancelled,

    /// The modem transport was closed or failed.
    #[error("modem was disconnected")]
    Disconnected,
}

impl From<::std::io::Error> for Error {
    fn from(e: ::std::io::Error) -> Error {
        Error::Io(e.kind())
    }
}
