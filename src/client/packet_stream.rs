use crate::{
	packets::{Frame, ParseError},
	Connection,
};
use bytes::{Buf, BytesMut};
use std::{io::Cursor, time::Duration};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	time::Instant,
};

/// Frames MQTT packets on top of a [`Connection`].
pub struct PacketStream {
	stream: Box<dyn Connection>,
	buffer: BytesMut,
	write_timeout: Duration,
}

impl PacketStream {
	/// Create a new `PacketStream` with the given stream and buffer length.
	///
	/// Every write must complete within `write_timeout`.
	pub fn new(stream: Box<dyn Connection>, len: usize, write_timeout: Duration) -> Self {
		Self {
			stream,
			buffer: BytesMut::with_capacity(len),
			write_timeout,
		}
	}

	#[inline]
	pub fn get_mut(&mut self) -> &mut dyn Connection {
		self.stream.as_mut()
	}

	pub fn parse_frame(&mut self) -> Result<Option<Frame>, ParseError> {
		use ParseError::Incomplete;

		let mut buf = Cursor::new(&self.buffer[..]);
		match Frame::check(&mut buf) {
			Ok(extent) => {
				let bytes = self.buffer.split_to(extent).freeze();
				Ok(Some(Frame::parse(bytes)?))
			}
			Err(Incomplete) => Ok(None),
			Err(error) => Err(error),
		}
	}

	/// Reads the next frame.
	///
	/// Returns `None` if the peer closed the connection cleanly.
	///
	/// This is cancel safe: partially read frames stay buffered.
	pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
		loop {
			// Attempt to parse a packet from the buffered data.
			if let Some(packet) = self.parse_frame()? {
				return Ok(Some(packet));
			}

			// There is not enough buffered data to read a packet. Attempt
			// to read more.
			if 0 == self.stream.read_buf(&mut self.buffer).await? {
				// If the buffer is empty the connection was shutdown cleanly,
				// otherwise the peer closed the socket while sending a packet.
				if self.buffer.is_empty() {
					return Ok(None);
				} else {
					return Err("connection reset by peer".into());
				}
			}
		}
	}

	pub async fn write(&mut self, mut buffer: impl Buf) -> crate::Result<()> {
		tracing::trace!("writing {} bytes to stream", buffer.remaining());
		self.stream
			.set_write_deadline(Some(Instant::now() + self.write_timeout));
		let result = async {
			self.stream.write_all_buf(&mut buffer).await?;
			self.stream.flush().await
		}
		.await;
		self.stream.set_write_deadline(None);
		Ok(result?)
	}

	/// Closes the connection once the peer has everything written so far.
	pub async fn shutdown(&mut self) -> crate::Result<()> {
		self.stream.close().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::Timed;

	#[tokio::test]
	async fn reads_frames_split_across_writes() {
		let (client, mut server) = tokio::io::duplex(64);
		let mut stream = PacketStream::new(
			Box::new(Timed::new(client, None, None)),
			64,
			Duration::from_secs(1),
		);

		server.write_all(&[0x20, 0x02]).await.unwrap();
		let read = tokio::spawn(async move {
			let frame = stream.read_frame().await.unwrap().unwrap();
			(frame, stream)
		});
		server.write_all(&[0x00, 0x00, 0xd0]).await.unwrap();

		let (frame, mut stream) = read.await.unwrap();
		assert_eq!(frame.header, 0x20);
		assert_eq!(&frame.payload[..], &[0x00, 0x00]);

		// A partial frame followed by EOF is an error.
		drop(server);
		assert!(stream.read_frame().await.is_err());
	}

	#[tokio::test]
	async fn clean_eof_yields_none() {
		let (client, server) = tokio::io::duplex(64);
		let mut stream = PacketStream::new(
			Box::new(Timed::new(client, None, None)),
			64,
			Duration::from_secs(1),
		);
		drop(server);
		assert!(stream.read_frame().await.unwrap().is_none());
	}
}
