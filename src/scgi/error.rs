use std::io;
use thiserror::Error;

/// Errors raised while decoding a request or writing a response.
///
/// None of these are fatal to the server; the connection that produced
/// the error is abandoned.
#[derive(Debug, Error)]
pub enum Error
{
    /// Malformed framing, or a required header missing or invalid
    #[error("Invalid header")]
    InvalidHeader,
    /// Declared content size is invalid or too large, or the content
    /// type lacks a required parameter
    #[error("Invalid content size")]
    InvalidContent,
    /// Stream ended before the header block or body was complete
    #[error("Unexpected end of stream")]
    UnexpectedEnd,
    /// Bad percent escape in the query string or urlencoded form
    #[error("Invalid query encoding")]
    InvalidQuery,
    #[error("Invalid request URI: {0}")]
    InvalidUri(String),
    #[error("Invalid media type: {0}")]
    MediaType(#[from] mime::FromStrError),
    #[error("Invalid multipart body: {0}")]
    Multipart(&'static str),
    #[error("Invalid multipart part header: {0}")]
    PartHeader(#[from] httparse::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error
{
    pub fn timeout(what: &str) -> Error
    {
        Error::Io(io::Error::new(io::ErrorKind::TimedOut,
                                 format!("{} timed out", what)))
    }

    pub fn is_timeout(&self) -> bool
    {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false
        }
    }
}

impl From<url::ParseError> for Error
{
    fn from(error: url::ParseError) -> Error
    {
        Error::InvalidUri(error.to_string())
    }
}

#[test]
fn test_error_display()
{
    assert_eq!(Error::InvalidHeader.to_string(), "Invalid header");
    assert_eq!(Error::UnexpectedEnd.to_string(), "Unexpected end of stream");
    let e = Error::timeout("Read");
    assert!(e.is_timeout());
    assert_eq!(e.to_string(), "Read timed out");
    assert!(!Error::InvalidContent.is_timeout());
}
