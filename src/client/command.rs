use super::Message;
use crate::{FilterBuf, QoS, TopicBuf};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Command responses are sent back to the caller via oneshot::Sender.
pub type ResponseTx<T> = oneshot::Sender<T>;
pub type CommandTx = mpsc::UnboundedSender<Box<Command>>;
pub type CommandRx = mpsc::UnboundedReceiver<Box<Command>>;
pub type PublishTx = mpsc::Sender<Message>;
pub type PublishRx = mpsc::Receiver<Message>;

#[derive(Debug)]
pub enum Command {
	Publish(PublishCommand),
	Subscribe(SubscribeCommand),
	Unsubscribe(UnsubscribeCommand),
	Shutdown,
}

#[derive(Debug)]
pub struct PublishCommand {
	pub topic: TopicBuf,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
	pub response: ResponseTx<()>,
}

#[derive(Debug)]
pub struct SubscribeCommand {
	pub filters: Vec<(FilterBuf, QoS)>,
	pub channel: PublishTx,
	pub response: ResponseTx<Vec<(FilterBuf, QoS)>>,
}

#[derive(Debug)]
pub struct UnsubscribeCommand {
	pub filters: Vec<FilterBuf>,
	pub response: ResponseTx<()>,
}

impl From<PublishCommand> for Box<Command> {
	#[inline]
	fn from(value: PublishCommand) -> Self {
		Box::new(Command::Publish(value))
	}
}

impl From<SubscribeCommand> for Box<Command> {
	#[inline]
	fn from(value: SubscribeCommand) -> Self {
		Box::new(Command::Subscribe(value))
	}
}

impl From<UnsubscribeCommand> for Box<Command> {
	#[inline]
	fn from(value: UnsubscribeCommand) -> Self {
		Box::new(Command::Unsubscribe(value))
	}
}
