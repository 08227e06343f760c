//! Errors produced while establishing a transport connection.
use crate::transport::{tls::TlsError, UnsupportedScheme};
use std::{fmt, io, time::Duration};

/// The step of a connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
	Handshake,
	StreamOpen,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Handshake => f.write_str("handshake"),
			Self::StreamOpen => f.write_str("stream open"),
		}
	}
}

/// Failure of a single connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
	#[error("transport handshake failed: {0}")]
	Handshake(#[from] HandshakeError),
	#[error("open stream error: {0}")]
	StreamOpen(#[from] StreamOpenError),
	#[error("connection attempt cancelled during {0}")]
	Cancelled(Phase),
	#[error(transparent)]
	UnsupportedScheme(#[from] UnsupportedScheme),
}

impl ConnectError {
	#[inline]
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled(_))
	}
}

/// The secure session could not be established.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
	#[error("failed to resolve {host}: {source}")]
	Resolve {
		host: String,
		#[source]
		source: io::Error,
	},
	#[error("no address found for {0}")]
	NoAddress(String),
	#[error("failed to bind local endpoint: {0}")]
	Bind(#[source] io::Error),
	#[error(transparent)]
	Tls(#[from] TlsError),
	#[error(transparent)]
	Config(#[from] quinn::ConnectError),
	#[error(transparent)]
	Connection(#[from] quinn::ConnectionError),
	#[error("timed out after {0:?}")]
	TimedOut(Duration),
	#[error(transparent)]
	Io(#[from] io::Error),
}

/// The session was established but no stream could be opened on it.
#[derive(Debug, thiserror::Error)]
pub enum StreamOpenError {
	#[error(transparent)]
	Connection(#[from] quinn::ConnectionError),
	#[error("timed out after {0:?}")]
	TimedOut(Duration),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn distinguishes_setup_failures() {
		let handshake = ConnectError::from(HandshakeError::TimedOut(Duration::from_secs(1)));
		assert_eq!(handshake.to_string(), "transport handshake failed: timed out after 1s");

		let stream = ConnectError::from(StreamOpenError::Connection(
			quinn::ConnectionError::LocallyClosed,
		));
		assert!(stream.to_string().starts_with("open stream error: "));

		assert!(ConnectError::Cancelled(Phase::Handshake).is_cancelled());
		assert!(!stream.is_cancelled());
	}
}
