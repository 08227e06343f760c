//! Callbacks for connection and message events.
use crate::{Broker, FilterBuf, Message};
use std::{
	io::{self, Write},
	sync::Mutex,
};

/// Receives notifications from the client task.
///
/// Implementations are called from inside the client task, so they should
/// return quickly.
pub trait EventSink: Send + Sync {
	/// Called every time a ConnAck accepting the connection to `broker` is
	/// received.
	fn on_connect(&self, broker: &Broker, session_present: bool);

	/// Called for every message received from the Server, before it is routed
	/// to a [`Subscription`](crate::Subscription).
	fn on_message(&self, message: &Message);

	fn on_connection_lost(&self, reason: &str) {
		let _ = reason;
	}

	/// Called by [`Subscriber`](crate::Subscriber) for every filter the
	/// Server accepted.
	fn on_subscribed(&self, filter: &FilterBuf) {
		let _ = filter;
	}
}

/// An [`EventSink`] which writes a line of text for every event.
#[derive(Debug)]
pub struct WriterSink<W> {
	writer: Mutex<W>,
}

impl WriterSink<io::Stdout> {
	pub fn stdout() -> Self {
		Self::new(io::stdout())
	}
}

impl<W: Write + Send> WriterSink<W> {
	pub fn new(writer: W) -> Self {
		Self {
			writer: Mutex::new(writer),
		}
	}

	pub fn into_inner(self) -> W {
		match self.writer.into_inner() {
			Ok(writer) => writer,
			Err(poisoned) => poisoned.into_inner(),
		}
	}

	fn line(&self, args: std::fmt::Arguments<'_>) {
		let mut writer = match self.writer.lock() {
			Ok(writer) => writer,
			Err(poisoned) => poisoned.into_inner(),
		};
		let result = match writer.write_fmt(args) {
			Ok(()) => writer.flush(),
			Err(error) => Err(error),
		};
		if let Err(error) = result {
			tracing::warn!(%error, "failed to write event");
		}
	}
}

impl<W: Write + Send> EventSink for WriterSink<W> {
	fn on_connect(&self, broker: &Broker, _: bool) {
		self.line(format_args!(
			"Connected to MQTT broker over {}\n",
			broker.scheme.transport_name()
		));
	}

	fn on_message(&self, message: &Message) {
		self.line(format_args!(
			"Received message: [{}] {}\n",
			message.topic,
			String::from_utf8_lossy(&message.payload)
		));
	}

	fn on_connection_lost(&self, reason: &str) {
		self.line(format_args!("Connection lost: {reason}\n"));
	}

	fn on_subscribed(&self, filter: &FilterBuf) {
		self.line(format_args!("Subscribed to topic: {filter}\n"));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{QoS, Scheme, TopicBuf};
	use bytes::Bytes;

	#[test]
	fn writes_one_line_per_event() {
		let sink = WriterSink::new(Vec::new());

		sink.on_connect(&Broker::quic("localhost", 14567), false);
		sink.on_subscribed(&FilterBuf::new("test/#").unwrap());
		sink.on_message(&Message {
			topic: TopicBuf::new("test/topic").unwrap(),
			retain: false,
			qos: QoS::AtLeastOnce,
			payload: Bytes::from_static(b"hello"),
		});
		sink.on_connection_lost("keep alive timeout");

		let output = String::from_utf8(sink.into_inner()).unwrap();
		assert_eq!(
			output,
			"Connected to MQTT broker over QUIC\n\
			 Subscribed to topic: test/#\n\
			 Received message: [test/topic] hello\n\
			 Connection lost: keep alive timeout\n"
		);
	}

	#[test]
	fn names_the_transport_on_connect() {
		let sink = WriterSink::new(Vec::new());

		sink.on_connect(&Broker::new(Scheme::Tcp, "localhost", 1883), true);
		sink.on_connect(&Broker::new(Scheme::Tls, "localhost", 8883), false);

		let output = String::from_utf8(sink.into_inner()).unwrap();
		assert_eq!(
			output,
			"Connected to MQTT broker over TCP\n\
			 Connected to MQTT broker over TLS\n"
		);
	}
}
