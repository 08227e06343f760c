//! Subscribes to a fixed set of topics and drains messages until told to stop.
use crate::{events::EventSink, Client, ClientError, FilterBuf, QoS};
use std::future::Future;

const SUBSCRIPTION_BUFFER: usize = 32;

/// A subscriber for an explicit list of topic filters.
///
/// Messages are reported through [`EventSink::on_message`] by the client
/// task; the subscriber only keeps the subscription alive and drains it.
///
/// # Example
/// ```no_run
/// # tokio_test::block_on(async {
/// use mqtt_quic::{create_client, ClientOptions, QoS, QuicConnector, QuicOptions, Subscriber, WriterSink};
/// use std::sync::Arc;
///
/// let sink = Arc::new(WriterSink::stdout());
/// let options = ClientOptions::try_from("quic://localhost:14567").unwrap().with_events(sink.clone());
/// let (client, handle) = create_client(options, QuicConnector::new(QuicOptions::default()));
///
/// let subscriber = Subscriber::new(vec![("test/topic".try_into().unwrap(), QoS::AtLeastOnce)]);
/// subscriber.run(&client, sink.as_ref(), tokio::signal::ctrl_c()).await.unwrap();
/// handle.await.unwrap().unwrap();
/// # })
/// ```
#[derive(Clone, Debug)]
pub struct Subscriber {
	topics: Vec<(FilterBuf, QoS)>,
}

impl Subscriber {
	pub fn new(topics: Vec<(FilterBuf, QoS)>) -> Self {
		Self { topics }
	}

	pub fn topics(&self) -> &[(FilterBuf, QoS)] {
		&self.topics
	}

	/// Subscribes to every topic, then drains messages until `shutdown`
	/// completes or the client task stops.
	///
	/// On `shutdown` the client is told to disconnect before the subscription
	/// is dropped, so no Unsubscribe is sent.
	#[tracing::instrument(skip_all, fields(topics = self.topics.len()), err)]
	pub async fn run<F: Future>(
		&self,
		client: &Client,
		events: &dyn EventSink,
		shutdown: F,
	) -> Result<(), ClientError> {
		if self.topics.is_empty() {
			tracing::warn!("no topics to subscribe to");
		}

		tokio::pin!(shutdown);

		// The Server may be unreachable for a while; keep listening for shutdown.
		let mut subscription = tokio::select! {
			_ = &mut shutdown => {
				tracing::info!("shutdown requested before subscribing");
				client.disconnect()?;
				return Ok(());
			}
			subscription = client.subscribe(self.topics.clone(), SUBSCRIPTION_BUFFER) => subscription?,
		};

		for (filter, qos) in subscription.filters() {
			tracing::info!(%filter, ?qos, "subscribed");
			events.on_subscribed(filter);
		}

		loop {
			tokio::select! {
				_ = &mut shutdown => {
					tracing::info!("shutdown requested");
					client.disconnect()?;
					return Ok(());
				}
				message = subscription.recv() => match message {
					Some(message) => tracing::debug!(topic = %message.topic, len = message.payload.len(), "drained message"),
					None => return Err(ClientError::ClientTaskClosed),
				}
			}
		}
	}
}
