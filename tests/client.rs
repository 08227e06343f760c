use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mqtt_quic::{
	create_client,
	packets::{self, ConnAck, Frame, ParseError, Publish, SerializePacket, SubAck},
	Broker, ClientConfiguration, ClientOptions, ConnectError, Connection, Connector, EventSink,
	Message, Packet, PacketId, QoS, Subscriber, Timed, TopicBuf,
};
use std::{
	io::Cursor,
	net::SocketAddr,
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
	sync::{mpsc, oneshot},
	time::timeout,
};
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_secs(5);

/// Hands the Server side of an in-memory pipe to the test for every
/// connection attempt.
struct DuplexConnector {
	tx: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl Connector for DuplexConnector {
	async fn connect(
		&self,
		_: &Broker,
		_: &CancellationToken,
	) -> Result<Box<dyn Connection>, ConnectError> {
		let (client, server) = tokio::io::duplex(16 * 1024);
		let _ = self.tx.send(server);
		let addr: SocketAddr = ([127, 0, 0, 1], 1883).into();
		Ok(Box::new(Timed::new(client, Some(addr), Some(addr))))
	}
}

/// The Server end of one connection.
struct Peer {
	stream: DuplexStream,
	buffer: BytesMut,
}

impl Peer {
	async fn next(connections: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Self {
		let stream = timeout(STEP, connections.recv())
			.await
			.expect("no connection attempt")
			.unwrap();
		Self {
			stream,
			buffer: BytesMut::new(),
		}
	}

	async fn read(&mut self) -> Packet {
		timeout(STEP, async {
			loop {
				let mut cursor = Cursor::new(&self.buffer[..]);
				match Frame::check(&mut cursor) {
					Ok(len) => {
						let frame = Frame::parse(self.buffer.split_to(len).freeze()).unwrap();
						return Packet::parse(&frame).unwrap();
					}
					Err(ParseError::Incomplete) => {}
					Err(error) => panic!("invalid frame: {error}"),
				}
				let n = self.stream.read_buf(&mut self.buffer).await.unwrap();
				assert_ne!(n, 0, "client closed the connection");
			}
		})
		.await
		.expect("client sent nothing")
	}

	async fn send(&mut self, packet: impl Into<Packet>) {
		let mut buffer = BytesMut::new();
		packet.into().serialize_to_bytes(&mut buffer).unwrap();
		self.stream.write_all(&buffer).await.unwrap();
	}

	/// Reads the Connect packet and accepts it.
	async fn accept(&mut self, session_present: bool) -> packets::Connect {
		let Packet::Connect(connect) = self.read().await else {
			panic!("expected Connect");
		};
		self.send(ConnAck {
			session_present,
			code: 0,
		})
		.await;
		*connect
	}

	/// Reads a Subscribe packet and grants every filter.
	async fn grant(&mut self) -> Vec<String> {
		let Packet::Subscribe(subscribe) = self.read().await else {
			panic!("expected Subscribe");
		};
		let filters = subscribe
			.filters
			.iter()
			.map(|(filter, _)| filter.as_str().to_owned())
			.collect();
		self.send(SubAck {
			id: subscribe.id,
			result: subscribe.filters.iter().map(|(_, qos)| Ok(*qos)).collect(),
		})
		.await;
		filters
	}
}

#[derive(Debug, PartialEq, Eq)]
enum Event {
	Connected(bool),
	Message(String, Bytes),
	Lost,
	Subscribed(String),
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<Event>>);

impl RecordingSink {
	fn events(&self) -> Vec<Event> {
		std::mem::take(&mut *self.0.lock().unwrap())
	}
}

impl EventSink for RecordingSink {
	fn on_connect(&self, _: &Broker, session_present: bool) {
		self.0.lock().unwrap().push(Event::Connected(session_present));
	}

	fn on_message(&self, message: &Message) {
		self.0.lock().unwrap().push(Event::Message(
			message.topic.to_string(),
			message.payload.clone(),
		));
	}

	fn on_connection_lost(&self, _: &str) {
		self.0.lock().unwrap().push(Event::Lost);
	}

	fn on_subscribed(&self, filter: &mqtt_quic::FilterBuf) {
		self.0
			.lock()
			.unwrap()
			.push(Event::Subscribed(filter.to_string()));
	}
}

fn start(
	configuration: ClientConfiguration,
) -> (
	mqtt_quic::Client,
	tokio::task::JoinHandle<mqtt_quic::Result<()>>,
	mpsc::UnboundedReceiver<DuplexStream>,
	Arc<RecordingSink>,
) {
	let (tx, connections) = mpsc::unbounded_channel();
	let sink = Arc::new(RecordingSink::default());
	let options = ClientOptions::new(Broker::default(), configuration).with_events(sink.clone());
	let (client, handle) = create_client(options, DuplexConnector { tx });
	(client, handle, connections, sink)
}

fn id(value: u16) -> PacketId {
	PacketId::new(value).unwrap()
}

#[tokio::test]
async fn subscribes_and_acknowledges_messages() {
	let (client, handle, mut connections, sink) = start(ClientConfiguration {
		client_id: "test-client".into(),
		..Default::default()
	});

	let mut peer = Peer::next(&mut connections).await;
	let connect = peer.accept(false).await;
	assert_eq!(connect.client_id, "test-client");
	assert_eq!(connect.keep_alive, 60);

	let subscribe = tokio::spawn({
		let client = client.clone();
		async move { client.subscribe(("a/+", QoS::AtLeastOnce), 4).await }
	});
	assert_eq!(peer.grant().await, ["a/+"]);
	let mut subscription = subscribe.await.unwrap().unwrap();

	peer.send(Publish::AtLeastOnce {
		id: id(7),
		retain: false,
		duplicate: false,
		topic: TopicBuf::new("a/b").unwrap(),
		payload: Bytes::from_static(b"hello"),
	})
	.await;

	let message = timeout(STEP, subscription.recv()).await.unwrap().unwrap();
	assert_eq!(message.topic, "a/b");
	assert_eq!(&message.payload[..], b"hello");
	assert_eq!(peer.read().await, Packet::PubAck(packets::PubAck { id: id(7) }));

	assert_eq!(
		sink.events(),
		[
			Event::Connected(false),
			Event::Message("a/b".into(), Bytes::from_static(b"hello")),
		]
	);

	client.disconnect().unwrap();
	assert_eq!(peer.read().await, Packet::Disconnect);
	timeout(STEP, handle).await.unwrap().unwrap().unwrap();
	drop(subscription);
}

#[tokio::test]
async fn holds_exactly_once_messages_until_released() {
	let (client, handle, mut connections, _sink) = start(Default::default());

	let mut peer = Peer::next(&mut connections).await;
	peer.accept(false).await;

	let subscribe = tokio::spawn({
		let client = client.clone();
		async move { client.subscribe(("q/#", QoS::ExactlyOnce), 4).await }
	});
	peer.grant().await;
	let mut subscription = subscribe.await.unwrap().unwrap();

	peer.send(Publish::ExactlyOnce {
		id: id(3),
		retain: false,
		duplicate: false,
		topic: TopicBuf::new("q/1").unwrap(),
		payload: Bytes::from_static(b"once"),
	})
	.await;
	assert_eq!(peer.read().await, Packet::PubRec(packets::PubRec { id: id(3) }));

	// Not delivered before the PubRel.
	assert!(timeout(Duration::from_millis(50), subscription.recv()).await.is_err());

	peer.send(packets::PubRel { id: id(3) }).await;
	let message = timeout(STEP, subscription.recv()).await.unwrap().unwrap();
	assert_eq!(&message.payload[..], b"once");
	assert_eq!(message.qos, QoS::ExactlyOnce);
	assert_eq!(peer.read().await, Packet::PubComp(packets::PubComp { id: id(3) }));

	client.disconnect().unwrap();
	assert_eq!(peer.read().await, Packet::Disconnect);
	timeout(STEP, handle).await.unwrap().unwrap().unwrap();
	drop(subscription);
}

#[tokio::test]
async fn publish_waits_for_acknowledgement() {
	let (client, handle, mut connections, _sink) = start(Default::default());

	let mut peer = Peer::next(&mut connections).await;
	peer.accept(false).await;

	let (done_tx, mut done_rx) = oneshot::channel();
	tokio::spawn({
		let client = client.clone();
		async move {
			let result = client.publish("x/y", "data", QoS::AtLeastOnce, false).await;
			let _ = done_tx.send(result);
		}
	});

	let Packet::Publish(publish) = peer.read().await else {
		panic!("expected Publish");
	};
	assert_eq!(publish.topic().as_str(), "x/y");
	assert_eq!(&publish.payload()[..], b"data");
	let publish_id = publish.id().unwrap();

	// Unacknowledged, the publish is still pending.
	tokio::task::yield_now().await;
	assert!(done_rx.try_recv().is_err());

	peer.send(packets::PubAck { id: publish_id }).await;
	timeout(STEP, done_rx).await.unwrap().unwrap().unwrap();

	client.disconnect().unwrap();
	timeout(STEP, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn reconnects_and_resubscribes_without_session() {
	let (client, handle, mut connections, sink) = start(Default::default());

	let mut peer = Peer::next(&mut connections).await;
	peer.accept(false).await;

	let subscribe = tokio::spawn({
		let client = client.clone();
		async move { client.subscribe("sensors/#", 4).await }
	});
	peer.grant().await;
	let subscription = subscribe.await.unwrap().unwrap();

	// The Server goes away.
	drop(peer);

	let mut peer = Peer::next(&mut connections).await;
	peer.accept(false).await;
	assert_eq!(peer.grant().await, ["sensors/#"]);

	assert_eq!(
		sink.events(),
		[Event::Connected(false), Event::Lost, Event::Connected(false)]
	);

	client.disconnect().unwrap();
	assert_eq!(peer.read().await, Packet::Disconnect);
	timeout(STEP, handle).await.unwrap().unwrap().unwrap();
	drop(subscription);
}

#[tokio::test]
async fn refused_connection_stops_without_reconnect() {
	let (_client, handle, mut connections, sink) = start(ClientConfiguration {
		reconnect: false,
		..Default::default()
	});

	let mut peer = Peer::next(&mut connections).await;
	let Packet::Connect(_) = peer.read().await else {
		panic!("expected Connect");
	};
	peer.send(ConnAck {
		session_present: false,
		code: 5,
	})
	.await;

	let result = timeout(STEP, handle).await.unwrap().unwrap();
	assert!(result.is_err());
	assert!(sink.events().is_empty());
}

#[tokio::test]
async fn subscriber_reports_filters_and_disconnects_on_shutdown() {
	let (client, handle, mut connections, sink) = start(Default::default());

	let mut peer = Peer::next(&mut connections).await;
	peer.accept(false).await;

	let subscriber = Subscriber::new(vec![
		("test/topic".try_into().unwrap(), QoS::AtLeastOnce),
		("other/#".try_into().unwrap(), QoS::AtMostOnce),
	]);

	let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
	let run = tokio::spawn({
		let client = client.clone();
		let sink = sink.clone();
		async move {
			subscriber
				.run(&client, sink.as_ref(), async {
					let _ = shutdown_rx.await;
				})
				.await
		}
	});

	assert_eq!(peer.grant().await, ["test/topic", "other/#"]);

	peer.send(Publish::AtMostOnce {
		retain: false,
		topic: TopicBuf::new("other/x").unwrap(),
		payload: Bytes::from_static(b"42"),
	})
	.await;

	// Wait for the message to pass through the client task.
	timeout(STEP, async {
		while !sink
			.0
			.lock()
			.unwrap()
			.iter()
			.any(|event| matches!(event, Event::Message(..)))
		{
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.unwrap();

	shutdown_tx.send(()).unwrap();
	timeout(STEP, run).await.unwrap().unwrap().unwrap();
	assert_eq!(peer.read().await, Packet::Disconnect);
	timeout(STEP, handle).await.unwrap().unwrap().unwrap();

	assert_eq!(
		sink.events(),
		[
			Event::Connected(false),
			Event::Subscribed("test/topic".into()),
			Event::Subscribed("other/#".into()),
			Event::Message("other/x".into(), Bytes::from_static(b"42")),
		]
	);
}
