//! # MQTT over QUIC
//!
//! An MQTT 3.1.1 client whose transport is pluggable. The client invokes a
//! [`Connector`] every time it (re)connects; [`QuicConnector`] performs a
//! QUIC handshake, opens a single bidirectional stream, and hands the client
//! a [`QuicStream`] which it treats like any other byte stream.
//!
//! ```no_run
//! # tokio_test::block_on(async {
//! use mqtt_quic::{create_client, ClientOptions, QoS, QuicConnector, QuicOptions};
//!
//! let options = ClientOptions::try_from("quic://localhost:14567?client_id=example").unwrap();
//! let (client, handle) = create_client(options, QuicConnector::new(QuicOptions::default()));
//!
//! let mut subscription = client.subscribe(("test/topic", QoS::AtLeastOnce), 8).await.unwrap();
//! while let Some(message) = subscription.recv().await {
//! 	println!("{}: {:?}", message.topic, message.payload);
//! }
//! # })
//! ```
pub mod client;
pub mod error;
pub mod events;
pub mod filter;
pub mod misc;
pub mod packets;
mod qos;
mod serde;
pub mod subscriber;
mod topic;
pub mod transport;

pub use self::{
	client::{
		create_client, Client, ClientConfiguration, ClientError, ClientOptions, Message,
		Subscription,
	},
	error::{ConnectError, HandshakeError, Phase, StreamOpenError},
	events::{EventSink, WriterSink},
	filter::{Filter, FilterBuf, FilterError},
	packets::{Packet, PacketType},
	qos::{InvalidQoS, QoS},
	subscriber::Subscriber,
	topic::{InvalidTopic, Topic, TopicBuf},
	transport::{
		quic::{QuicConnector, QuicOptions, QuicSession, QuicStream},
		tcp::TcpConnector,
		tls::{TlsOptions, Verification},
		AnyConnector, Broker, Connection, Connector, Scheme, Timed,
	},
};

pub type PacketId = core::num::NonZeroU16;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
