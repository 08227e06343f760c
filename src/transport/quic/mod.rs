//! MQTT over a single bidirectional QUIC stream.
//!
//! A connection attempt runs in two steps. [`QuicConnector::handshake`]
//! establishes a [`QuicSession`] on a fresh client endpoint, then
//! [`QuicSession::open_stream`] opens exactly one stream on it and wraps it
//! in a [`QuicStream`]. Either step can fail independently, time out or be
//! cancelled.
use super::{
	tls::{TlsError, TlsOptions},
	Broker, Connection, Connector,
};
use crate::error::{ConnectError, HandshakeError, Phase, StreamOpenError};
use async_trait::async_trait;
use quinn::{crypto::rustls::QuicClientConfig, Endpoint, IdleTimeout, VarInt};
use std::{
	io,
	net::{Ipv4Addr, Ipv6Addr, SocketAddr},
	sync::Arc,
	time::Duration,
};
use tokio_util::sync::CancellationToken;

mod stream;

pub use self::stream::{QuicReadHalf, QuicStream, QuicWriteHalf};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for [`QuicConnector`].
#[derive(Clone, Debug)]
pub struct QuicOptions {
	pub tls: TlsOptions,
	/// Local address for the client endpoint. When `None`, the endpoint binds
	/// an ephemeral port on the unspecified address matching the Server's
	/// address family.
	pub bind: Option<SocketAddr>,
	/// Name to validate the Server's certificate against, if it differs from
	/// the broker host.
	pub server_name: Option<String>,
	pub handshake_timeout: Duration,
	pub stream_open_timeout: Duration,
	/// Interval of QUIC-level keep-alive frames.
	pub keep_alive_interval: Option<Duration>,
	pub idle_timeout: Option<Duration>,
}

impl Default for QuicOptions {
	fn default() -> Self {
		Self {
			tls: TlsOptions::default(),
			bind: None,
			server_name: None,
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
			stream_open_timeout: DEFAULT_STREAM_OPEN_TIMEOUT,
			keep_alive_interval: Some(DEFAULT_KEEP_ALIVE_INTERVAL),
			idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
		}
	}
}

/// Connects to a broker over QUIC.
#[derive(Debug)]
pub struct QuicConnector {
	options: QuicOptions,
}

impl QuicConnector {
	pub fn new(options: QuicOptions) -> Self {
		Self { options }
	}

	#[inline]
	pub fn options(&self) -> &QuicOptions {
		&self.options
	}

	fn client_config(&self) -> Result<quinn::ClientConfig, TlsError> {
		let crypto = QuicClientConfig::try_from(self.options.tls.quic_client_config()?)?;
		let mut config = quinn::ClientConfig::new(Arc::new(crypto));

		let mut transport = quinn::TransportConfig::default();
		transport
			.keep_alive_interval(self.options.keep_alive_interval)
			.max_idle_timeout(
				self.options
					.idle_timeout
					.and_then(|timeout| IdleTimeout::try_from(timeout).ok()),
			);
		config.transport_config(Arc::new(transport));

		Ok(config)
	}

	/// Resolves the broker and performs the QUIC/TLS handshake on a new
	/// client endpoint.
	///
	/// On failure or cancellation the endpoint is closed before returning.
	#[tracing::instrument(skip_all, fields(%broker), err)]
	pub async fn handshake(
		&self,
		broker: &Broker,
		cancel: &CancellationToken,
	) -> Result<QuicSession, ConnectError> {
		let server = tokio::select! {
			biased;
			_ = cancel.cancelled() => return Err(ConnectError::Cancelled(Phase::Handshake)),
			result = resolve(broker, self.options.bind) => result?,
		};

		let bind = self.options.bind.unwrap_or_else(|| unspecified(&server));
		let endpoint = Endpoint::client(bind).map_err(HandshakeError::Bind)?;

		let connecting = match self.client_config() {
			Ok(config) => {
				let server_name = self.options.server_name.as_deref().unwrap_or(&broker.host);
				endpoint
					.connect_with(config, server, server_name)
					.map_err(HandshakeError::from)
			}
			Err(error) => Err(HandshakeError::from(error)),
		};

		let connecting = match connecting {
			Ok(connecting) => connecting,
			Err(error) => {
				endpoint.close(VarInt::from_u32(0), b"");
				return Err(error.into());
			}
		};

		let timeout = self.options.handshake_timeout;
		let result = tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(ConnectError::Cancelled(Phase::Handshake)),
			result = tokio::time::timeout(timeout, connecting) => match result {
				Ok(Ok(connection)) => Ok(connection),
				Ok(Err(error)) => Err(HandshakeError::Connection(error).into()),
				Err(_) => Err(HandshakeError::TimedOut(timeout).into()),
			},
		};

		match result {
			Ok(connection) => {
				tracing::info!(remote = %connection.remote_address(), "QUIC session established");
				Ok(QuicSession {
					endpoint,
					connection,
					open_timeout: self.options.stream_open_timeout,
				})
			}
			Err(error) => {
				endpoint.close(VarInt::from_u32(0), b"");
				Err(error)
			}
		}
	}
}

#[async_trait]
impl Connector for QuicConnector {
	async fn connect(
		&self,
		broker: &Broker,
		cancel: &CancellationToken,
	) -> Result<Box<dyn Connection>, ConnectError> {
		let session = self.handshake(broker, cancel).await?;
		let stream = session.open_stream(cancel).await?;
		Ok(Box::new(stream))
	}
}

async fn resolve(broker: &Broker, bind: Option<SocketAddr>) -> Result<SocketAddr, HandshakeError> {
	let mut addrs = tokio::net::lookup_host((broker.host.as_str(), broker.port))
		.await
		.map_err(|source| HandshakeError::Resolve {
			host: broker.host.clone(),
			source,
		})?;

	// An explicitly bound endpoint can only reach its own address family.
	addrs
		.find(|addr| bind.map_or(true, |bind| bind.is_ipv4() == addr.is_ipv4()))
		.ok_or_else(|| HandshakeError::NoAddress(broker.host.clone()))
}

fn unspecified(server: &SocketAddr) -> SocketAddr {
	match server {
		SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
		SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
	}
}

/// An established QUIC session and the client endpoint driving it.
#[derive(Clone, Debug)]
pub struct QuicSession {
	endpoint: Endpoint,
	connection: quinn::Connection,
	open_timeout: Duration,
}

impl QuicSession {
	#[inline]
	pub fn connection(&self) -> &quinn::Connection {
		&self.connection
	}

	/// The endpoint's bound address, refined with the local IP the session
	/// actually uses when the platform reports it.
	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		let mut addr = self.endpoint.local_addr()?;
		if let Some(ip) = self.connection.local_ip() {
			addr.set_ip(ip);
		}
		Ok(addr)
	}

	#[inline]
	pub fn remote_addr(&self) -> SocketAddr {
		self.connection.remote_address()
	}

	/// Opens the single bidirectional stream the client will run over.
	///
	/// The session is closed if the stream cannot be opened.
	#[tracing::instrument(skip_all, fields(remote = %self.remote_addr()), err)]
	pub async fn open_stream(self, cancel: &CancellationToken) -> Result<QuicStream, ConnectError> {
		let timeout = self.open_timeout;
		let result = tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(ConnectError::Cancelled(Phase::StreamOpen)),
			result = tokio::time::timeout(timeout, self.connection.open_bi()) => match result {
				Ok(Ok(halves)) => Ok(halves),
				Ok(Err(error)) => Err(StreamOpenError::Connection(error).into()),
				Err(_) => Err(StreamOpenError::TimedOut(timeout).into()),
			},
		};

		match result {
			Ok((send, recv)) => {
				tracing::debug!(id = %send.id(), "opened stream");
				Ok(QuicStream::new(send, recv, self))
			}
			Err(error) => {
				self.close();
				Err(error)
			}
		}
	}

	/// Closes the session and its endpoint immediately.
	pub fn close(&self) {
		self.connection.close(VarInt::from_u32(0), b"");
		self.endpoint.close(VarInt::from_u32(0), b"");
	}
}
