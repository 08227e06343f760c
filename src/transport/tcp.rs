use super::{
	tls::{self, TlsOptions},
	Broker, Connection, Connector, Scheme, Timed,
};
use crate::error::{ConnectError, HandshakeError, Phase};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects over plain TCP, or TLS over TCP.
#[derive(Debug)]
pub struct TcpConnector {
	tls: TlsOptions,
	pub connect_timeout: Duration,
}

impl TcpConnector {
	pub fn new(tls: TlsOptions) -> Self {
		Self {
			tls,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
		}
	}

	async fn establish(&self, broker: &Broker) -> Result<Box<dyn Connection>, HandshakeError> {
		let stream = TcpStream::connect((broker.host.as_str(), broker.port)).await?;
		stream.set_nodelay(true)?;
		let local = stream.local_addr()?;
		let remote = stream.peer_addr()?;

		match broker.scheme {
			Scheme::Tls => {
				let config = self.tls.tcp_client_config()?;
				let domain = tls::server_name(&broker.host)?;
				let stream = TlsConnector::from(Arc::new(config))
					.connect(domain, stream)
					.await?;
				tracing::debug!(%remote, "TLS session established");
				Ok(Box::new(Timed::new(stream, Some(local), Some(remote))))
			}
			_ => Ok(Box::new(Timed::new(stream, Some(local), Some(remote)))),
		}
	}
}

impl Default for TcpConnector {
	fn default() -> Self {
		Self::new(TlsOptions::default())
	}
}

#[async_trait]
impl Connector for TcpConnector {
	#[tracing::instrument(skip_all, fields(%broker), err)]
	async fn connect(
		&self,
		broker: &Broker,
		cancel: &CancellationToken,
	) -> Result<Box<dyn Connection>, ConnectError> {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(ConnectError::Cancelled(Phase::Handshake)),
			result = tokio::time::timeout(self.connect_timeout, self.establish(broker)) => match result {
				Ok(connection) => Ok(connection?),
				Err(_) => Err(HandshakeError::TimedOut(self.connect_timeout).into()),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	#[tokio::test]
	async fn connects_over_plain_tcp() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let server = tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			stream.write_all(b"pong").await.unwrap();
		});

		let broker = Broker::new(Scheme::Tcp, "127.0.0.1", addr.port());
		let mut connection = TcpConnector::default()
			.connect(&broker, &CancellationToken::new())
			.await
			.unwrap();
		assert_eq!(connection.remote_addr().unwrap(), addr);

		let mut buf = [0; 4];
		connection.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"pong");
		server.await.unwrap();
	}

	#[tokio::test]
	async fn honours_cancellation() {
		let cancel = CancellationToken::new();
		cancel.cancel();

		// 192.0.2.0/24 is reserved for documentation and never routed.
		let broker = Broker::new(Scheme::Tcp, "192.0.2.1", 1883);
		let result = TcpConnector::default().connect(&broker, &cancel).await;
		assert!(matches!(
			result,
			Err(ConnectError::Cancelled(Phase::Handshake))
		));
	}
}
