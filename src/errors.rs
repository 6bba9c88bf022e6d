//! engine error
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `proxy_vibes::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// TLS error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// IO error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Certificate generation or loading error
  #[error("certificate error: {0}")]
  Certificate(String),
  /// Proxy engine error
  #[error("proxy error: {0}")]
  Proxy(String),
  /// Malformed or oversized request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// Upstream connection error
  #[error("connection error: {0}")]
  Connection(String),
  /// Pipeline hook error
  #[error("hook error: {0}")]
  Hook(String),
  /// Configuration error
  #[error("configuration error: {0}")]
  Config(String),
  /// SQLite error
  #[error(transparent)]
  Database(#[from] rusqlite::Error),
  /// Unknown error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it.
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a proxy error and log it.
  pub fn proxy(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it.
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a connection error and log it.
  pub fn connection(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a hook error.
  pub fn hook(msg: impl Into<String>) -> Self {
    Error::Hook(msg.into())
  }

  /// Create a configuration error.
  pub fn config(msg: impl Into<String>) -> Self {
    Error::Config(msg.into())
  }

  /// Create an unknown error.
  pub fn other(msg: impl Into<String>) -> Self {
    Error::Other(msg.into())
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::method::InvalidMethod> for Error {
  fn from(value: http::method::InvalidMethod) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::status::InvalidStatusCode> for Error {
  fn from(value: http::status::InvalidStatusCode) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}
