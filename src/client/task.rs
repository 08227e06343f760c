use super::{
	command::{Command, CommandRx, PublishCommand, SubscribeCommand, UnsubscribeCommand},
	holdoff::HoldOff,
	packet_stream::PacketStream,
	state::{ClientState, StateError},
	ClientConfiguration, Message,
};
use crate::{
	events::EventSink,
	packets::{self, ConnAck, Packet},
	Broker, Connector, PacketType, QoS,
};
use std::{
	ops::{ControlFlow, ControlFlow::Break, ControlFlow::Continue},
	sync::Arc,
	time::Duration,
};
use tokio::time::{self, Instant, Interval};
use tokio_util::sync::CancellationToken;

const MIN_HOLDOFF: Duration = Duration::from_millis(75);
const BUFFER_LEN: usize = 8 * 1024;

/// Everything the client task needs besides its command channel.
pub(crate) struct Task<C> {
	pub connector: C,
	pub broker: Broker,
	pub configuration: ClientConfiguration,
	pub events: Option<Arc<dyn EventSink>>,
	pub cancel: CancellationToken,
}

impl<C: Connector> Task<C> {
	/// Connects, runs the session, and reconnects until the Client shuts down.
	pub async fn run(self, mut commands: CommandRx) -> crate::Result<()> {
		let Self {
			connector,
			broker,
			configuration,
			events,
			cancel,
		} = self;

		let connect = configuration.connect_packet();
		tracing::debug!(?connect);
		let mut state = ClientState::new(&connect)?;
		let mut reconnect_delay = HoldOff::new(MIN_HOLDOFF..state.keep_alive);

		loop {
			if let Some(delay) = reconnect_delay.current() {
				tracing::debug!(?delay, "waiting before reconnecting");
			}

			tokio::select! {
				biased;
				_ = cancel.cancelled() => {
					tracing::info!("client shutdown");
					return Ok(());
				}
				_ = reconnect_delay.wait_and_increase_with(|delay| delay * 2) => {}
			}

			// Open the connection to the broker.
			let connection = match connector.connect(&broker, &cancel).await {
				Ok(connection) => connection,
				Err(error) if error.is_cancelled() => {
					tracing::info!("client shutdown while connecting");
					return Ok(());
				}
				Err(error) => {
					tracing::error!(%broker, %error, "error connecting to broker");
					if !configuration.reconnect {
						return Err(error.into());
					}
					continue;
				}
			};

			if let (Ok(local), Ok(remote)) = (connection.local_addr(), connection.remote_addr()) {
				tracing::info!(%local, %remote, "connected to broker");
			}

			let mut connection =
				PacketStream::new(connection, BUFFER_LEN, configuration.connect_timeout);
			let connack =
				match wait_for_connack(&mut state, &mut connection, configuration.connect_timeout)
					.await
				{
					Ok(connack) => connack,
					Err(error) => {
						tracing::warn!(%error, "failed to establish MQTT session, restarting connection ...");
						if !configuration.reconnect {
							return Err(error);
						}
						continue;
					}
				};

			// We have successfully connected, reset the hold-off delay.
			reconnect_delay.reset();
			if let Some(events) = &events {
				events.on_connect(&broker, connack.session_present);
			}

			let reason = match connected_task(
				&mut state,
				&mut commands,
				&mut connection,
				events.as_deref(),
				connack.session_present,
			)
			.await
			{
				Ok(Break(())) => {
					tracing::info!("client shutdown");
					if let Err(error) = connection.shutdown().await {
						tracing::debug!(%error, "failed to close connection");
					}
					return Ok(());
				}
				Ok(Continue(reason)) => reason,
				Err(error) => error.to_string(),
			};

			tracing::warn!(%reason, "connection lost");
			if let Some(events) = &events {
				events.on_connection_lost(&reason);
			}

			if !configuration.reconnect {
				return Err(reason.into());
			}
		}
	}
}

/// Sends the Connect packet and waits for the Server's ConnAck.
///
/// The ConnAck must arrive within `timeout`.
pub async fn wait_for_connack(
	state: &mut ClientState,
	connection: &mut PacketStream,
	timeout: Duration,
) -> crate::Result<ConnAck> {
	// Send a Connect packet to the Server.
	state.connect();
	if let Some(buffer) = state.take_buffer() {
		connection.write(buffer).await?;
	}

	connection
		.get_mut()
		.set_read_deadline(Some(Instant::now() + timeout));
	let frame = connection.read_frame().await;
	connection.get_mut().set_read_deadline(None);

	let Some(frame) = frame? else {
		return Err(StateError::ClosedBeforeConnAck.into());
	};

	let connack = match Packet::parse(&frame)? {
		Packet::ConnAck(connack) => connack,
		packet => return Err(StateError::Unsolicited(packet.packet_type()).into()),
	};

	if let Some(reason) = connack.refused_reason() {
		return Err(StateError::ConnectionRefused(reason).into());
	}

	tracing::debug!(session_present = connack.session_present, "received ConnAck");
	Ok(connack)
}

/// Runs the session over an established connection.
///
/// Returns `Break` when the Client asked to shut down, or `Continue` with the
/// reason the connection was lost.
pub async fn connected_task(
	state: &mut ClientState,
	command_channel: &mut CommandRx,
	connection: &mut PacketStream,
	events: Option<&dyn EventSink>,
	session_present: bool,
) -> crate::Result<ControlFlow<(), String>> {
	//
	// We've just connected to the Server and received a ConnAck packet.
	//
	// Re-send whatever was in flight when the last connection dropped.
	//
	state.resume(session_present)?;
	continue_write(state, connection).await?;

	let mut keep_alive = keep_alive_interval(state.keep_alive);
	let mut should_shutdown = false;

	while !should_shutdown {
		#[rustfmt::skip]
		tokio::select! {
			command = command_channel.recv() => match command {
				Some(command) => match process_command(state, *command) {
					Ok(shutdown) => should_shutdown = shutdown,
					Err(error) => {
						tracing::error!(%error, "failed to process command");
						return Ok(Continue(error.to_string()));
					}
				},
				None => {
					tracing::info!("all client handles dropped");
					state.queue_packet(&packets::Disconnect)?;
					should_shutdown = true;
				}
			},
			frame = connection.read_frame() => {
				let Some(frame) = frame? else {
					return Ok(Continue(String::from("connection closed by peer")));
				};

				let packet = Packet::parse(&frame)?;
				tracing::debug!(?packet, "read from stream");
				if let Err(error) = process_packet(state, events, packet).await {
					tracing::error!(%error, "failed to process packet");
					return Ok(Continue(error.to_string()));
				}
			}
			_ = tick(&mut keep_alive) => {
				if state.expired() {
					tracing::error!("pending requests have exceeded keep_alive");
					return Ok(Continue(String::from("keep alive timeout")));
				}

				// If we are about to send a packet to the Server, we don't need to send a PingReq.
				if !state.has_outgoing() && state.pingreq_state.is_none() {
					state.pingreq_state = Some(Instant::now());
					state.queue_packet(&packets::PingReq)?;
				}
			}
		}

		// Write any buffered outgoing packets to the stream.
		if continue_write(state, connection).await? {
			// We've just sent a packet, update the keep alive.
			if let Some(keep_alive) = &mut keep_alive {
				keep_alive.reset();
			}
		}
	}

	Ok(Break(()))
}

async fn continue_write(
	state: &mut ClientState,
	connection: &mut PacketStream,
) -> crate::Result<bool> {
	match state.take_buffer() {
		Some(buffer) => {
			connection.write(buffer).await?;
			Ok(true)
		}
		None => Ok(false),
	}
}

fn keep_alive_interval(period: Duration) -> Option<Interval> {
	// A keep alive of zero turns the mechanism off.
	(!period.is_zero()).then(|| {
		let mut interval = time::interval_at(Instant::now() + period, period);
		interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
		interval
	})
}

async fn tick(interval: &mut Option<Interval>) {
	match interval {
		Some(interval) => {
			interval.tick().await;
		}
		None => std::future::pending().await,
	}
}

async fn deliver(state: &ClientState, events: Option<&dyn EventSink>, message: Message) {
	if let Some(events) = events {
		events.on_message(&message);
	}

	let Some(channel) = state.find_publish_channel(&message.topic) else {
		tracing::warn!(topic = %message.topic, "no subscription matches topic");
		return;
	};

	if channel.send(message).await.is_err() {
		tracing::debug!("subscription dropped before delivery");
	}
}

async fn process_packet(
	state: &mut ClientState,
	events: Option<&dyn EventSink>,
	packet: Packet,
) -> Result<(), StateError> {
	match packet {
		Packet::Publish(publish) => {
			let id = publish.id();
			let message = Message::from(publish);
			match (message.qos, id) {
				(QoS::AtLeastOnce, Some(id)) => {
					deliver(state, events, message).await;
					state.queue_packet(&packets::PubAck { id })?;
				}
				(QoS::ExactlyOnce, Some(id)) => {
					// Hold the message until the Server releases it, unless this is a
					// re-delivery of one we already hold.
					if !state.store_incoming(id, message) {
						tracing::debug!(%id, "ignoring re-delivered Publish");
					}
					state.queue_packet(&packets::PubRec { id })?;
				}
				_ => deliver(state, events, message).await,
			}
			Ok(())
		}
		Packet::PubAck(packets::PubAck { id }) => {
			let response = state.puback(id)?;
			let _ = response.send(());
			Ok(())
		}
		Packet::PubRec(packets::PubRec { id }) => state.pubrec(id),
		Packet::PubRel(packets::PubRel { id }) => {
			if let Some(message) = state.pubrel(id) {
				deliver(state, events, message).await;
			}

			// We've passed on the Publish message. Queue up a PubComp packet.
			state.queue_packet(&packets::PubComp { id })
		}
		Packet::PubComp(packets::PubComp { id }) => {
			let response = state.pubcomp(id)?;
			let _ = response.send(());
			Ok(())
		}
		Packet::SubAck(ack) => {
			let (sender, payload) = state.suback(ack)?;
			let _ = sender.send(payload);
			Ok(())
		}
		Packet::UnsubAck(ack) => {
			let response = state.unsuback(ack)?;
			let _ = response.send(());
			Ok(())
		}
		Packet::PingResp => {
			let Some(req) = state.pingreq_state.take() else {
				tracing::error!("unsolicited PingResp");
				return Err(StateError::Unsolicited(PacketType::PingResp));
			};
			tracing::debug!(elapsed = ?req.elapsed(), "PingResp received");
			Ok(())
		}
		packet @ (Packet::Connect(_)
		| Packet::ConnAck(_)
		| Packet::Subscribe(_)
		| Packet::Unsubscribe(_)
		| Packet::PingReq
		| Packet::Disconnect) => Err(StateError::InvalidPacket(packet.packet_type())),
	}
}

fn process_command(state: &mut ClientState, command: Command) -> Result<bool, StateError> {
	match command {
		Command::Shutdown => {
			state.queue_packet(&packets::Disconnect)?;
			return Ok(true);
		}
		Command::Publish(PublishCommand {
			topic,
			payload,
			qos,
			retain,
			response,
		}) => {
			if let Some(response) = state.publish(topic, payload, qos, retain, response)? {
				let _ = response.send(());
			};
		}
		Command::Subscribe(SubscribeCommand {
			filters,
			channel,
			response,
		}) => {
			state.subscribe(filters, channel, response)?;
		}
		Command::Unsubscribe(UnsubscribeCommand { filters, response }) => {
			state.unsubscribe(filters, response)?;
		}
	}
	Ok(false)
}
