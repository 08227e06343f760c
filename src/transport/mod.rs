//! Transports the client can run over.
//!
//! The client never opens sockets itself. Every connection attempt goes
//! through a [`Connector`], which returns a boxed [`Connection`]: any async
//! byte stream that also reports its endpoint addresses and honours read and
//! write deadlines.
use crate::error::ConnectError;
use async_trait::async_trait;
use std::{fmt, io, net::SocketAddr};
use tokio::{
	io::{AsyncRead, AsyncWrite},
	time::Instant,
};
use tokio_util::sync::CancellationToken;

mod deadline;
pub mod quic;
pub mod tcp;
mod timed;
pub mod tls;

pub(crate) use self::deadline::Deadline;
pub use self::timed::Timed;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_QUIC_PORT: u16 = 14567;
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

/// A bidirectional byte stream with deadlines and endpoint addresses.
///
/// Once a deadline has passed, pending and subsequent operations in that
/// direction fail with [`io::ErrorKind::TimedOut`] until the deadline is moved
/// or cleared. Closing is [`close`](Connection::close) followed by drop.
#[async_trait]
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {
	fn local_addr(&self) -> io::Result<SocketAddr>;

	fn remote_addr(&self) -> io::Result<SocketAddr>;

	fn set_read_deadline(&mut self, deadline: Option<Instant>);

	fn set_write_deadline(&mut self, deadline: Option<Instant>);

	/// Sets both the read and the write deadline.
	fn set_deadline(&mut self, deadline: Option<Instant>) {
		self.set_read_deadline(deadline);
		self.set_write_deadline(deadline);
	}

	/// Closes the write side once everything written so far has been handed
	/// to the transport.
	///
	/// The default is [`shutdown`]. Transports which discard unsent data when
	/// dropped wait here until the peer has it.
	///
	/// [`shutdown`]: tokio::io::AsyncWriteExt::shutdown
	async fn close(&mut self) -> io::Result<()> {
		tokio::io::AsyncWriteExt::shutdown(self).await
	}
}

/// Produces a fresh [`Connection`] for every connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
	/// Establishes a connection to `broker`.
	///
	/// The attempt is abandoned with [`ConnectError::Cancelled`] as soon as
	/// `cancel` fires.
	async fn connect(
		&self,
		broker: &Broker,
		cancel: &CancellationToken,
	) -> Result<Box<dyn Connection>, ConnectError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
	/// MQTT over a single QUIC stream.
	Quic,
	/// MQTT over plain TCP.
	Tcp,
	/// MQTT over TLS over TCP.
	Tls,
}

impl Scheme {
	pub fn default_port(&self) -> u16 {
		match self {
			Self::Quic => DEFAULT_QUIC_PORT,
			Self::Tcp => DEFAULT_MQTT_PORT,
			Self::Tls => DEFAULT_MQTTS_PORT,
		}
	}

	/// Human readable name of the transport underneath MQTT.
	pub fn transport_name(&self) -> &'static str {
		match self {
			Self::Quic => "QUIC",
			Self::Tcp => "TCP",
			Self::Tls => "TLS",
		}
	}
}

impl fmt::Display for Scheme {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Quic => f.write_str("quic"),
			Self::Tcp => f.write_str("mqtt"),
			Self::Tls => f.write_str("mqtts"),
		}
	}
}

/// The Server to connect to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broker {
	pub scheme: Scheme,
	/// Hostname or IP address of the Server.
	pub host: String,
	pub port: u16,
}

impl Broker {
	pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
		Self {
			scheme,
			host: host.into(),
			port,
		}
	}

	#[inline]
	pub fn quic(host: impl Into<String>, port: u16) -> Self {
		Self::new(Scheme::Quic, host, port)
	}
}

impl Default for Broker {
	fn default() -> Self {
		Self::quic(DEFAULT_HOST, DEFAULT_QUIC_PORT)
	}
}

impl fmt::Display for Broker {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let Self { scheme, host, port } = self;
		if host.contains(':') {
			write!(f, "{scheme}://[{host}]:{port}")
		} else {
			write!(f, "{scheme}://{host}:{port}")
		}
	}
}

#[derive(thiserror::Error, Debug)]
#[error("the specified url scheme is not supported")]
pub struct UnsupportedScheme;

impl TryFrom<&url::Url> for Broker {
	type Error = UnsupportedScheme;
	fn try_from(value: &url::Url) -> Result<Self, Self::Error> {
		let scheme = match value.scheme() {
			"quic" => Scheme::Quic,
			"mqtt" | "tcp" => Scheme::Tcp,
			"mqtts" | "ssl" | "tls" => Scheme::Tls,
			_ => return Err(UnsupportedScheme),
		};

		// Strip the brackets url keeps around IPv6 literals.
		let host = match value.host() {
			Some(url::Host::Ipv6(addr)) => addr.to_string(),
			Some(host) => host.to_string(),
			None => DEFAULT_HOST.into(),
		};

		Ok(Self {
			scheme,
			host,
			port: value.port().unwrap_or(scheme.default_port()),
		})
	}
}

impl TryFrom<&str> for Broker {
	type Error = UnsupportedScheme;
	fn try_from(value: &str) -> Result<Self, Self::Error> {
		let url: url::Url = value.try_into().map_err(|_| UnsupportedScheme)?;
		Self::try_from(&url)
	}
}

/// Dispatches on [`Broker::scheme`] to the QUIC or the TCP connector.
#[derive(Debug)]
pub struct AnyConnector {
	quic: quic::QuicConnector,
	tcp: tcp::TcpConnector,
}

impl AnyConnector {
	pub fn new(options: quic::QuicOptions) -> Self {
		let mut tcp = tcp::TcpConnector::new(options.tls.clone());
		tcp.connect_timeout = options.handshake_timeout;
		Self {
			quic: quic::QuicConnector::new(options),
			tcp,
		}
	}
}

#[async_trait]
impl Connector for AnyConnector {
	async fn connect(
		&self,
		broker: &Broker,
		cancel: &CancellationToken,
	) -> Result<Box<dyn Connection>, ConnectError> {
		match broker.scheme {
			Scheme::Quic => self.quic.connect(broker, cancel).await,
			Scheme::Tcp | Scheme::Tls => self.tcp.connect(broker, cancel).await,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_broker_urls() {
		let broker = Broker::try_from("quic://localhost").unwrap();
		assert_eq!(broker, Broker::quic("localhost", 14567));

		let broker = Broker::try_from("mqtt://10.0.0.1").unwrap();
		assert_eq!(broker, Broker::new(Scheme::Tcp, "10.0.0.1", 1883));

		let broker = Broker::try_from("ssl://example.com:9999").unwrap();
		assert_eq!(broker, Broker::new(Scheme::Tls, "example.com", 9999));

		let broker = Broker::try_from("quic://[::1]:4433").unwrap();
		assert_eq!(broker.host, "::1");
		assert_eq!(broker.to_string(), "quic://[::1]:4433");

		assert!(Broker::try_from("http://localhost").is_err());
		assert!(Broker::try_from("not a url").is_err());
	}
}
