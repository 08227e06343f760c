use super::{
	command::{CommandTx, PublishRx, UnsubscribeCommand},
	ClientError, Message,
};
use crate::{FilterBuf, QoS};
use tokio::sync::oneshot;

/// Messages matching the filters granted by one Subscribe request.
///
/// Dropping a `Subscription` unsubscribes its filters without waiting for the
/// Server.
#[derive(Debug)]
pub struct Subscription {
	tx: CommandTx,
	rx: PublishRx,
	filters: Vec<(FilterBuf, QoS)>,
}

impl Subscription {
	pub(crate) fn new(filters: Vec<(FilterBuf, QoS)>, rx: PublishRx, tx: CommandTx) -> Self {
		Self { tx, rx, filters }
	}

	/// Waits for the next message.
	///
	/// Returns `None` once the client task has stopped or the filters were
	/// unsubscribed through [`Client::unsubscribe`](super::Client::unsubscribe).
	///
	/// ```no_run
	/// # tokio_test::block_on(async {
	/// # use mqtt_quic::{create_client, ClientOptions, QuicConnector, QuicOptions};
	/// # let options = ClientOptions::try_from("quic://localhost").unwrap();
	/// # let (client, _) = create_client(options, QuicConnector::new(QuicOptions::default()));
	/// let mut subscription = client.subscribe("a/b", 2).await.unwrap();
	/// while let Some(message) = subscription.recv().await {
	/// 	println!("{}: {} bytes", message.topic, message.payload.len());
	/// }
	/// # });
	/// ```
	pub async fn recv(&mut self) -> Option<Message> {
		let message = self.rx.recv().await;
		if message.is_none() {
			// Nothing left to unsubscribe from on drop.
			self.filters.clear();
		}
		message
	}

	/// Unsubscribes every filter and waits for the Server's UnsubAck.
	#[tracing::instrument(skip(self), ret, err)]
	pub async fn unsubscribe(mut self) -> Result<(), ClientError> {
		let (response, response_rx) = oneshot::channel();
		let filters = self.take_filters();
		self.tx
			.send(UnsubscribeCommand { filters, response }.into())?;
		Ok(response_rx.await?)
	}

	/// The filters granted by the Server, with the granted QoS.
	#[inline]
	pub fn filters(&self) -> &[(FilterBuf, QoS)] {
		&self.filters
	}

	fn take_filters(&mut self) -> Vec<FilterBuf> {
		self.filters.drain(..).map(|(filter, _)| filter).collect()
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if self.filters.is_empty() {
			return;
		}
		let (response, _) = oneshot::channel();
		let filters = self.take_filters();
		let _ = self
			.tx
			.send(UnsubscribeCommand { filters, response }.into());
	}
}
