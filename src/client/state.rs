use super::{
	command::{PublishTx, ResponseTx},
	Message,
};
use crate::{
	misc::WrappingNonZeroU16,
	packets::{self, Publish, SerializePacket, SubAck, Subscribe, UnsubAck, Unsubscribe},
	serde::WriteError,
	FilterBuf, PacketId, PacketType, QoS, Topic, TopicBuf,
};
use bytes::{Bytes, BytesMut};
use std::{collections::HashMap, fmt, time::Duration};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
	/// An acknowledgement for a request that is not in flight.
	#[error("unsolicited {0:?} packet")]
	Unsolicited(PacketType),
	/// The Client received a packet that the Server should not send.
	#[error("the Server sent an invalid {0:?} packet")]
	InvalidPacket(PacketType),
	#[error("protocol error: {0}")]
	ProtocolError(&'static str),
	#[error("connection refused: {0}")]
	ConnectionRefused(&'static str),
	#[error("connection closed before ConnAck")]
	ClosedBeforeConnAck,
	#[error(transparent)]
	Serialize(#[from] WriteError),
}

/// The Client's side of the MQTT session.
///
/// Survives reconnections so in-flight requests and active subscriptions can
/// be resumed.
#[derive(Debug)]
pub struct ClientState {
	/// Granted filters that incoming Publish packets are routed by.
	active_subscriptions: Vec<Subscription>,

	outgoing: BytesMut,

	/// Incoming QoS 2 Publish packets awaiting a PubRel.
	incoming: HashMap<PacketId, Message>,

	publish_state: HashMap<PacketId, PublishState>,
	subscribe_state: HashMap<PacketId, SubscribeState>,
	unsubscribe_state: HashMap<PacketId, UnsubscribeState>,

	// Shared by every kind of request, so an id is never in flight twice.
	packet_id: WrappingNonZeroU16,

	// Connect packet, serialized once and replayed on every connection.
	connect: Bytes,

	pub keep_alive: Duration,

	// When the unanswered PingReq was sent.
	pub pingreq_state: Option<Instant>,
}

#[derive(Debug)]
struct Subscription {
	filter: FilterBuf,
	qos: QoS,
	channel: PublishTx,
}

#[derive(Debug)]
enum PublishState {
	Ack {
		publish: Publish,
		response: ResponseTx<()>,
	},
	Rec {
		publish: Publish,
		response: ResponseTx<()>,
	},
	Comp {
		response: ResponseTx<()>,
	},
}

#[derive(Debug)]
struct SubscribeState {
	filters: Vec<Subscription>,
	response: ResponseTx<Vec<(FilterBuf, QoS)>>,
	sent: Instant,
}

#[derive(Debug)]
struct UnsubscribeState {
	filters: Vec<FilterBuf>,
	response: ResponseTx<()>,
	sent: Instant,
}

impl ClientState {
	pub fn new(connect: &packets::Connect) -> Result<Self, StateError> {
		let mut buffer = BytesMut::new();
		connect.serialize_to_bytes(&mut buffer)?;

		Ok(Self {
			active_subscriptions: Vec::new(),
			outgoing: BytesMut::new(),
			incoming: HashMap::new(),
			publish_state: HashMap::new(),
			subscribe_state: HashMap::new(),
			unsubscribe_state: HashMap::new(),
			packet_id: WrappingNonZeroU16::MAX,
			connect: buffer.freeze(),
			keep_alive: Duration::from_secs(u64::from(connect.keep_alive)),
			pingreq_state: None,
		})
	}

	/// Appends `packet` to the outgoing buffer.
	pub fn queue_packet(
		&mut self,
		packet: &(impl SerializePacket + fmt::Debug),
	) -> Result<(), StateError> {
		tracing::trace!(?packet, "queueing packet");
		packet.serialize_to_bytes(&mut self.outgoing)?;
		Ok(())
	}

	#[inline]
	pub fn has_outgoing(&self) -> bool {
		!self.outgoing.is_empty()
	}

	/// Takes everything queued so far, or `None` if nothing is queued.
	pub fn take_buffer(&mut self) -> Option<Bytes> {
		self.has_outgoing().then(|| self.outgoing.split().freeze())
	}

	/// Starts a new connection: drops anything queued for the previous
	/// connection and queues the Connect packet.
	pub fn connect(&mut self) {
		self.outgoing.clear();
		self.pingreq_state = None;
		self.outgoing.extend_from_slice(&self.connect[..]);
	}

	/// Resumes the session after the Server accepted a connection.
	///
	/// Every in-flight request is queued again. Without a session on the
	/// Server, the active subscriptions are re-subscribed as well.
	pub fn resume(&mut self, session_present: bool) -> Result<(), StateError> {
		if !session_present {
			self.incoming.clear();
		}

		let mut resend = Vec::new();
		for (id, state) in self.publish_state.iter_mut() {
			match state {
				PublishState::Ack { publish, .. } | PublishState::Rec { publish, .. } => {
					publish.set_duplicate();
					resend.push(packets::Packet::Publish(publish.clone()));
				}
				PublishState::Comp { .. } => {
					resend.push(packets::PubRel { id: *id }.into());
				}
			}
		}

		let now = Instant::now();
		for (id, state) in self.subscribe_state.iter_mut() {
			state.sent = now;
			resend.push(
				Subscribe {
					id: *id,
					filters: state
						.filters
						.iter()
						.map(|Subscription { filter, qos, .. }| (filter.clone(), *qos))
						.collect(),
				}
				.into(),
			);
		}

		for (id, state) in self.unsubscribe_state.iter_mut() {
			state.sent = now;
			resend.push(
				Unsubscribe {
					id: *id,
					filters: state.filters.clone(),
				}
				.into(),
			);
		}

		if !resend.is_empty() {
			tracing::info!(count = resend.len(), "re-sending in-flight requests");
		}

		for packet in &resend {
			self.queue_packet(packet)?;
		}

		if !session_present && self.has_active_subscriptions() {
			tracing::info!("re-subscribing active filters");
			let (response, _) = tokio::sync::oneshot::channel();
			self.generate_resubscribe(response)?;
		}

		Ok(())
	}

	pub fn subscribe(
		&mut self,
		filters: Vec<(FilterBuf, QoS)>,
		channel: PublishTx,
		response: ResponseTx<Vec<(FilterBuf, QoS)>>,
	) -> Result<(), StateError> {
		let id = self.generate_packet_id();
		self.queue_packet(&Subscribe {
			id,
			filters: filters.clone(),
		})?;

		self.subscribe_state.insert(
			id,
			SubscribeState {
				filters: filters
					.into_iter()
					.map(|(filter, qos)| Subscription {
						filter,
						qos,
						channel: channel.clone(),
					})
					.collect(),
				response,
				sent: Instant::now(),
			},
		);
		Ok(())
	}

	/// Completes the Subscribe request acknowledged by `ack`.
	pub fn suback(
		&mut self,
		ack: SubAck,
	) -> Result<(ResponseTx<Vec<(FilterBuf, QoS)>>, Vec<(FilterBuf, QoS)>), StateError> {
		let SubAck { id, result } = ack;

		let subscribe_state = self
			.subscribe_state
			.remove(&id)
			.ok_or(StateError::Unsolicited(PacketType::SubAck))?;

		let SubscribeState {
			filters, response, ..
		} = subscribe_state;

		if result.len() != filters.len() {
			return Err(StateError::ProtocolError(
				"SubAck payload length does not correspond to Subscribe payload length",
			));
		}

		let successful_filters: Vec<_> = result
			.into_iter()
			.zip(filters)
			.filter_map(|(result, subscription)| {
				let granted = match result {
					Ok(granted) => granted,
					Err(_) => {
						tracing::warn!(filter = %subscription.filter, "subscription rejected");
						return None;
					}
				};
				Some(Subscription {
					qos: granted,
					..subscription
				})
			})
			.collect();

		let granted = successful_filters
			.iter()
			.map(|Subscription { filter, qos, .. }| (filter.clone(), *qos))
			.collect();

		'outer: for subscription in successful_filters {
			// Re-subscribing a filter replaces its channel and QoS.
			for sub in self.active_subscriptions.iter_mut() {
				if sub.filter == subscription.filter {
					tracing::warn!(filter = %sub.filter, "replacing existing filter subscription");
					*sub = subscription;
					continue 'outer;
				}
			}

			self.active_subscriptions.push(subscription);
		}

		Ok((response, granted))
	}

	/// Queues an Unsubscribe packet for `filters`.
	pub fn unsubscribe(
		&mut self,
		filters: Vec<FilterBuf>,
		response: ResponseTx<()>,
	) -> Result<(), StateError> {
		let id = self.generate_packet_id();
		self.queue_packet(&Unsubscribe {
			id,
			filters: filters.clone(),
		})?;

		self.unsubscribe_state.insert(
			id,
			UnsubscribeState {
				filters,
				response,
				sent: Instant::now(),
			},
		);
		Ok(())
	}

	/// Completes the Unsubscribe request acknowledged by `unsuback`.
	pub fn unsuback(&mut self, unsuback: UnsubAck) -> Result<ResponseTx<()>, StateError> {
		let UnsubAck { id } = unsuback;

		let Some(unsubscribe_state) = self.unsubscribe_state.remove(&id) else {
			return Err(StateError::Unsolicited(PacketType::UnsubAck));
		};

		let UnsubscribeState {
			filters, response, ..
		} = unsubscribe_state;

		self.active_subscriptions
			.retain(|sub| !filters.contains(&sub.filter));

		Ok(response)
	}

	/// Queues a Publish packet.
	///
	/// For [`AtMostOnce`] there is nothing to wait for, so the response is
	/// handed back immediately.
	///
	/// [`AtMostOnce`]: QoS#variant.AtMostOnce
	pub fn publish(
		&mut self,
		topic: TopicBuf,
		payload: Bytes,
		qos: QoS,
		retain: bool,
		response: ResponseTx<()>,
	) -> Result<Option<ResponseTx<()>>, StateError> {
		match qos {
			QoS::AtMostOnce => {
				self.queue_packet(&Publish::AtMostOnce {
					retain,
					topic,
					payload,
				})?;

				Ok(Some(response))
			}
			QoS::AtLeastOnce => {
				let id = self.generate_packet_id();
				let publish = Publish::AtLeastOnce {
					id,
					retain,
					duplicate: false,
					topic,
					payload,
				};

				self.queue_packet(&publish)?;
				self.publish_state
					.insert(id, PublishState::Ack { publish, response });

				Ok(None)
			}
			QoS::ExactlyOnce => {
				let id = self.generate_packet_id();
				let publish = Publish::ExactlyOnce {
					id,
					retain,
					duplicate: false,
					topic,
					payload,
				};

				self.queue_packet(&publish)?;
				self.publish_state
					.insert(id, PublishState::Rec { publish, response });

				Ok(None)
			}
		}
	}

	/// Completes the QoS 1 publish with `id`.
	pub fn puback(&mut self, id: PacketId) -> Result<ResponseTx<()>, StateError> {
		match self.publish_state.remove(&id) {
			Some(PublishState::Ack { response, .. }) => Ok(response),
			Some(other) => {
				self.publish_state.insert(id, other);
				Err(StateError::Unsolicited(PacketType::PubAck))
			}
			None => Err(StateError::Unsolicited(PacketType::PubAck)),
		}
	}

	/// Moves the QoS 2 publish with `id` to its release step and queues a PubRel.
	pub fn pubrec(&mut self, id: PacketId) -> Result<(), StateError> {
		let response = match self.publish_state.remove(&id) {
			Some(PublishState::Rec { response, .. }) => response,
			// A re-sent PubRec for a message we already released.
			Some(PublishState::Comp { response }) => response,
			Some(other) => {
				self.publish_state.insert(id, other);
				return Err(StateError::Unsolicited(PacketType::PubRec));
			}
			None => return Err(StateError::Unsolicited(PacketType::PubRec)),
		};

		self.publish_state
			.insert(id, PublishState::Comp { response });

		self.queue_packet(&packets::PubRel { id })
	}

	/// Completes the QoS 2 publish with `id`.
	pub fn pubcomp(&mut self, id: PacketId) -> Result<ResponseTx<()>, StateError> {
		match self.publish_state.remove(&id) {
			Some(PublishState::Comp { response }) => Ok(response),
			Some(other) => {
				self.publish_state.insert(id, other);
				Err(StateError::Unsolicited(PacketType::PubComp))
			}
			None => Err(StateError::Unsolicited(PacketType::PubComp)),
		}
	}

	/// Stores an incoming QoS 2 message until the Server releases it.
	///
	/// Returns `false` if a message with the same id is already stored.
	pub fn store_incoming(&mut self, id: PacketId, message: Message) -> bool {
		if self.incoming.contains_key(&id) {
			return false;
		}
		self.incoming.insert(id, message);
		true
	}

	/// Releases the stored QoS 2 message with `id`.
	///
	/// Returns `None` if the message was already delivered. The PubComp must
	/// still be sent in that case.
	pub fn pubrel(&mut self, id: PacketId) -> Option<Message> {
		self.incoming.remove(&id)
	}

	/// Finds the channel of the subscription whose filter matches `topic`
	/// most specifically.
	pub fn find_publish_channel(&self, topic: &Topic) -> Option<&PublishTx> {
		self.active_subscriptions
			.iter()
			.filter_map(|sub| Some((sub.filter.matches_topic(topic.as_str())?, sub)))
			.max_by_key(|(matches, _)| *matches)
			.map(|(matches, Subscription { filter, channel, .. })| {
				tracing::debug!(%topic, %filter, ?matches, "found channel");
				channel
			})
	}

	#[inline]
	pub fn has_active_subscriptions(&self) -> bool {
		!self.active_subscriptions.is_empty()
	}

	/// Moves every active subscription back into a single pending Subscribe
	/// request. Returns `false` if there was nothing to re-subscribe.
	pub fn generate_resubscribe(
		&mut self,
		response: ResponseTx<Vec<(FilterBuf, QoS)>>,
	) -> Result<bool, StateError> {
		if self.active_subscriptions.is_empty() {
			return Ok(false);
		}

		let filters: Vec<_> = self.active_subscriptions.drain(..).collect();
		let id = self.generate_packet_id();
		self.queue_packet(&Subscribe {
			id,
			filters: filters
				.iter()
				.map(|Subscription { filter, qos, .. }| (filter.clone(), *qos))
				.collect(),
		})?;

		self.subscribe_state.insert(
			id,
			SubscribeState {
				filters,
				response,
				sent: Instant::now(),
			},
		);

		Ok(true)
	}

	/// Returns `true` if the Server has failed to answer a PingReq, Subscribe
	/// or Unsubscribe within the keep alive period.
	pub fn expired(&self) -> bool {
		if self.keep_alive.is_zero() {
			return false;
		}

		let now = Instant::now();
		let overdue = |sent: &Instant| now.duration_since(*sent) >= self.keep_alive;

		self.pingreq_state.as_ref().is_some_and(overdue)
			|| self
				.subscribe_state
				.values()
				.any(|SubscribeState { sent, .. }| overdue(sent))
			|| self
				.unsubscribe_state
				.values()
				.any(|UnsubscribeState { sent, .. }| overdue(sent))
	}

	/// Advances the packet id to the next one with no request in flight.
	///
	/// Spins forever if all 65,535 ids are in flight.
	fn generate_packet_id(&mut self) -> PacketId {
		loop {
			self.packet_id += 1;
			let id = self.packet_id.get();
			if !self.publish_state.contains_key(&id)
				&& !self.subscribe_state.contains_key(&id)
				&& !self.unsubscribe_state.contains_key(&id)
			{
				return id;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packets::{Frame, Packet};
	use tokio::sync::{mpsc, oneshot};

	fn state() -> ClientState {
		ClientState::new(&packets::Connect {
			client_id: String::from("test"),
			keep_alive: 5,
			..Default::default()
		})
		.unwrap()
	}

	fn id(n: u16) -> PacketId {
		PacketId::new(n).unwrap()
	}

	fn queued(state: &mut ClientState) -> Vec<Packet> {
		let mut buffer = state.take_buffer().unwrap_or_default();
		let mut packets = Vec::new();
		while !buffer.is_empty() {
			let mut cursor = std::io::Cursor::new(&buffer[..]);
			let len = Frame::check(&mut cursor).unwrap();
			let frame = Frame::parse(buffer.split_to(len)).unwrap();
			packets.push(Packet::parse(&frame).unwrap());
		}
		packets
	}

	#[test]
	fn subscribes_and_routes_to_most_specific_filter() {
		let mut state = state();
		let (wide_tx, _wide_rx) = mpsc::channel(1);
		let (narrow_tx, _narrow_rx) = mpsc::channel(1);

		let (response, _) = oneshot::channel();
		state
			.subscribe(vec![(FilterBuf::new("a/#").unwrap(), QoS::AtLeastOnce)], wide_tx.clone(), response)
			.unwrap();
		let (response, _) = oneshot::channel();
		state
			.subscribe(vec![(FilterBuf::new("a/b").unwrap(), QoS::AtMostOnce)], narrow_tx.clone(), response)
			.unwrap();

		let packets = queued(&mut state);
		assert_eq!(packets.len(), 2);

		let (_, granted) = state
			.suback(SubAck {
				id: id(1),
				result: vec![Ok(QoS::AtLeastOnce)],
			})
			.unwrap();
		assert_eq!(granted, vec![(FilterBuf::new("a/#").unwrap(), QoS::AtLeastOnce)]);
		state
			.suback(SubAck {
				id: id(2),
				result: vec![Ok(QoS::AtMostOnce)],
			})
			.unwrap();

		let topic = TopicBuf::new("a/b").unwrap();
		let channel = state.find_publish_channel(&topic).unwrap();
		assert!(channel.same_channel(&narrow_tx));

		let topic = TopicBuf::new("a/c").unwrap();
		let channel = state.find_publish_channel(&topic).unwrap();
		assert!(channel.same_channel(&wide_tx));

		let topic = TopicBuf::new("b").unwrap();
		assert!(state.find_publish_channel(&topic).is_none());
	}

	#[test]
	fn packet_ids_are_unique_across_request_kinds() {
		let mut state = state();
		let (channel, _rx) = mpsc::channel(1);
		let (response, _) = oneshot::channel();
		state
			.subscribe(vec![(FilterBuf::new("s").unwrap(), QoS::AtMostOnce)], channel, response)
			.unwrap();

		// Wrap around so the next id is the one the Subscribe still holds.
		state.packet_id = WrappingNonZeroU16::MAX;
		let (response, _) = oneshot::channel();
		state
			.publish(
				TopicBuf::new("a").unwrap(),
				Bytes::from_static(b"x"),
				QoS::AtLeastOnce,
				false,
				response,
			)
			.unwrap();
		let (response, _) = oneshot::channel();
		state.unsubscribe(vec![FilterBuf::new("s").unwrap()], response).unwrap();

		let ids: Vec<_> = queued(&mut state)
			.into_iter()
			.map(|packet| match packet {
				Packet::Subscribe(subscribe) => subscribe.id,
				Packet::Publish(publish) => publish.id().unwrap(),
				Packet::Unsubscribe(unsubscribe) => unsubscribe.id,
				packet => panic!("unexpected {packet:?}"),
			})
			.collect();
		assert_eq!(ids, vec![id(1), id(2), id(3)]);
	}

	#[test]
	fn rejects_unsolicited_acks() {
		let mut state = state();
		assert!(matches!(
			state.puback(id(1)),
			Err(StateError::Unsolicited(PacketType::PubAck))
		));
		assert!(state
			.suback(SubAck {
				id: id(1),
				result: vec![]
			})
			.is_err());
	}

	#[test]
	fn exactly_once_publish_flow() {
		let mut state = state();
		let (response, mut response_rx) = oneshot::channel();
		let immediate = state
			.publish(
				TopicBuf::new("a").unwrap(),
				Bytes::from_static(b"x"),
				QoS::ExactlyOnce,
				false,
				response,
			)
			.unwrap();
		assert!(immediate.is_none());
		assert!(matches!(&queued(&mut state)[..], [Packet::Publish(_)]));

		// PubComp before PubRec is out of order.
		assert!(state.pubcomp(id(1)).is_err());

		state.pubrec(id(1)).unwrap();
		assert!(matches!(&queued(&mut state)[..], [Packet::PubRel(_)]));

		let response = state.pubcomp(id(1)).unwrap();
		response.send(()).unwrap();
		assert!(response_rx.try_recv().is_ok());
	}

	#[test]
	fn resumes_in_flight_requests() {
		let mut state = state();
		let (response, _) = oneshot::channel();
		state
			.publish(
				TopicBuf::new("a").unwrap(),
				Bytes::from_static(b"x"),
				QoS::AtLeastOnce,
				false,
				response,
			)
			.unwrap();

		let (channel, _rx) = mpsc::channel(1);
		let (response, _) = oneshot::channel();
		state
			.subscribe(vec![(FilterBuf::new("s").unwrap(), QoS::AtMostOnce)], channel, response)
			.unwrap();
		state.take_buffer();

		// Reconnect.
		state.connect();
		state.resume(true).unwrap();

		let packets = queued(&mut state);
		assert!(matches!(packets[0], Packet::Connect(_)));
		let Some(Packet::Publish(publish)) = packets.get(1) else {
			panic!("expected re-sent Publish");
		};
		assert!(publish.duplicate());
		assert!(matches!(packets[2], Packet::Subscribe(_)));
	}

	#[test]
	fn resubscribes_without_session() {
		let mut state = state();
		let (channel, _rx) = mpsc::channel(1);
		let (response, _) = oneshot::channel();
		state
			.subscribe(vec![(FilterBuf::new("s/+").unwrap(), QoS::AtLeastOnce)], channel, response)
			.unwrap();
		state
			.suback(SubAck {
				id: id(1),
				result: vec![Ok(QoS::AtLeastOnce)],
			})
			.unwrap();
		state.take_buffer();

		state.connect();
		state.resume(false).unwrap();

		let packets = queued(&mut state);
		let [Packet::Connect(_), Packet::Subscribe(subscribe)] = &packets[..] else {
			panic!("expected Connect and Subscribe");
		};
		assert_eq!(subscribe.filters, vec![(FilterBuf::new("s/+").unwrap(), QoS::AtLeastOnce)]);
		assert!(!state.has_active_subscriptions());
	}

	#[tokio::test(start_paused = true)]
	async fn expires_unanswered_pings() {
		let mut state = state();
		state.pingreq_state = Some(Instant::now());
		assert!(!state.expired());

		tokio::time::advance(Duration::from_secs(5)).await;
		assert!(state.expired());
	}
}
