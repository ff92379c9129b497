/// Error taxonomy of the miniserver core. Parser and socket failures bubble
/// up to the per-connection handler, which maps them onto HTTP status
/// responses before the connection is closed.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("invalid url: {0}")]
    InvalidUrl(&'static str),
    #[error("bad HTTP message")]
    BadHttpMsg,
    #[error("bad HTTP response")]
    BadResponse,
    #[error("socket error: {0}")]
    SocketError(#[from] std::io::Error),
    #[error("error binding socket")]
    SocketBind,
    #[error("error connecting socket")]
    SocketConnect,
    #[error("error writing to socket")]
    SocketWrite,
    #[error("error reading from socket")]
    SocketRead,
    #[error("error listening on socket")]
    Listen,
    #[error("no usable socket")]
    OutOfSocket,
    #[error("out of memory")]
    OutOfMemory,
    #[error("entity larger than the configured maximum content length")]
    OutOfBounds,
    #[error("error reading file")]
    FileReadError,
    #[error("file not found")]
    FileNotFound,
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("internal error")]
    InternalError,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts_to_socket_error() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Error::SocketError(_))));
    }
}
