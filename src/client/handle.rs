use super::{
	command::{Command, CommandTx, PublishCommand, SubscribeCommand, UnsubscribeCommand},
	Filters, FiltersWithQoS, Subscription,
};
use crate::{FilterError, InvalidTopic, QoS, TopicBuf};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A cloneable handle for sending requests to the client task.
///
/// Requests made while the client is reconnecting are held until a session
/// is established again.
#[derive(Clone, Debug)]
pub struct Client {
	tx: CommandTx,
	cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// The client task has stopped and can no longer answer requests.
	#[error("client task closed")]
	ClientTaskClosed,
	#[error(transparent)]
	InvalidFilter(#[from] FilterError),
	#[error(transparent)]
	InvalidTopic(#[from] InvalidTopic),
}

impl Client {
	pub(crate) fn new(tx: CommandTx, cancel: CancellationToken) -> Self {
		Self { tx, cancel }
	}

	/// Sends `command` and waits for the client task to answer on `response`.
	async fn request<T>(
		&self,
		command: impl Into<Box<Command>>,
		response: oneshot::Receiver<T>,
	) -> Result<T, ClientError> {
		self.tx.send(command.into())?;
		Ok(response.await?)
	}

	/// Subscribes to `filters`.
	///
	/// Returns once the Server has acknowledged the request. The returned
	/// [`Subscription`] holds up to `buffer` undelivered messages; while it is
	/// full the client task waits.
	///
	/// ```no_run
	/// # tokio_test::block_on(async {
	/// use mqtt_quic::{create_client, ClientOptions, QoS, QuicConnector, QuicOptions};
	/// let options = ClientOptions::try_from("quic://localhost:14567").unwrap();
	/// let (client, _) = create_client(options, QuicConnector::new(QuicOptions::default()));
	///
	/// let mut subscription = client.subscribe(("sensors/+/temperature", QoS::AtLeastOnce), 16).await.unwrap();
	/// while let Some(message) = subscription.recv().await {
	/// 	println!("{}: {}", message.topic, String::from_utf8_lossy(&message.payload));
	/// }
	/// # })
	/// ```
	pub async fn subscribe<F, E>(&self, filters: F, buffer: usize) -> Result<Subscription, ClientError>
	where
		F: TryInto<FiltersWithQoS, Error = E>,
		ClientError: From<E>,
	{
		let FiltersWithQoS(filters) = filters.try_into()?;

		let (channel, messages) = mpsc::channel(buffer.max(1));
		let (response, response_rx) = oneshot::channel();
		let command = SubscribeCommand {
			filters,
			channel,
			response,
		};

		let granted = self.request(command, response_rx).await?;
		Ok(Subscription::new(granted, messages, self.tx.clone()))
	}

	/// Publishes `payload` to `topic`.
	///
	/// How long this waits depends on `qos`:
	/// * [`QoS::AtMostOnce`]: until the packet is queued.
	/// * [`QoS::AtLeastOnce`]: until the Server's PubAck.
	/// * [`QoS::ExactlyOnce`]: until the Server's PubComp.
	pub async fn publish<T, E>(
		&self,
		topic: T,
		payload: impl Into<Bytes>,
		qos: QoS,
		retain: bool,
	) -> Result<(), ClientError>
	where
		T: TryInto<TopicBuf, Error = E>,
		ClientError: From<E>,
	{
		let (response, response_rx) = oneshot::channel();
		let command = PublishCommand {
			topic: topic.try_into()?,
			payload: payload.into(),
			qos,
			retain,
			response,
		};
		self.request(command, response_rx).await
	}

	/// Unsubscribes from `filters` and waits for the Server's UnsubAck.
	pub async fn unsubscribe<F, E>(&self, filters: F) -> Result<(), ClientError>
	where
		F: TryInto<Filters, Error = E>,
		ClientError: From<E>,
	{
		let Filters(filters) = filters.try_into()?;
		let (response, response_rx) = oneshot::channel();
		self.request(UnsubscribeCommand { filters, response }, response_rx)
			.await
	}

	/// Asks the client task to send a Disconnect packet and stop.
	///
	/// A connection attempt in progress is abandoned. Await the task's
	/// `JoinHandle` to know when it has finished.
	pub fn disconnect(&self) -> Result<(), ClientError> {
		let sent = self.tx.send(Box::new(Command::Shutdown));
		self.cancel.cancel();
		sent.map_err(ClientError::from)
	}
}

impl<T> From<mpsc::error::SendError<T>> for ClientError {
	fn from(_: mpsc::error::SendError<T>) -> Self {
		Self::ClientTaskClosed
	}
}

impl From<oneshot::error::RecvError> for ClientError {
	fn from(_: oneshot::error::RecvError) -> Self {
		Self::ClientTaskClosed
	}
}

impl From<core::convert::Infallible> for ClientError {
	fn from(value: core::convert::Infallible) -> Self {
		match value {}
	}
}
