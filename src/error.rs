use crate::handle::Handle;

/// Runtime-level errors. Application-level failures travel as
/// [`MessageKind::Error`](crate::message::MessageKind::Error) messages
/// instead; nothing propagates across threads as an exception.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown service module `{0}`")]
    UnknownModule(String),

    #[error("launching `{0}` failed")]
    LaunchFailed(String),

    #[error("service init failed: {0}")]
    InitFailed(String),

    #[error("message of {0} bytes exceeds the message size limit")]
    MessageTooLarge(usize),

    #[error("no service at {0:#010x}")]
    DestinationNotFound(Handle),

    #[error("cannot resolve service address `{0}`")]
    InvalidAddress(String),

    #[error("service handle table is full")]
    HandleTableFull,

    #[error("socket table is full")]
    SocketTableFull,

    #[error("socket host name too long: `{0}`")]
    HostTooLong(String),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
