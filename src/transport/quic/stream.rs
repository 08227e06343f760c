use super::QuicSession;
use crate::transport::{Connection, Deadline};
use async_trait::async_trait;
use quinn::{RecvStream, SendStream, StreamId};
use std::{
	io,
	net::SocketAddr,
	pin::Pin,
	task::{Context, Poll},
	time::Duration,
};
use tokio::{
	io::{AsyncRead, AsyncWrite, ReadBuf},
	time::Instant,
};

/// How long closing waits for the peer to read the stream to completion
/// before the session is closed.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// A single bidirectional QUIC stream presented as a [`Connection`].
///
/// Reads and writes go straight to the stream. Address queries go to the
/// owning [`QuicSession`], which the stream keeps alive for as long as it
/// exists. Dropping the stream releases its session handle. Once no handle
/// remains the session closes.
#[derive(Debug)]
pub struct QuicStream {
	send: SendStream,
	recv: RecvStream,
	session: QuicSession,
	read_deadline: Deadline,
	write_deadline: Deadline,
}

impl QuicStream {
	pub(super) fn new(send: SendStream, recv: RecvStream, session: QuicSession) -> Self {
		Self {
			send,
			recv,
			session,
			read_deadline: Deadline::default(),
			write_deadline: Deadline::default(),
		}
	}

	#[inline]
	pub fn id(&self) -> StreamId {
		self.send.id()
	}

	#[inline]
	pub fn session(&self) -> &QuicSession {
		&self.session
	}

	/// Splits the stream into halves which can be driven from separate tasks.
	///
	/// Each half holds its own session handle and its own deadline.
	pub fn into_split(self) -> (QuicReadHalf, QuicWriteHalf) {
		let Self {
			send,
			recv,
			session,
			read_deadline,
			write_deadline,
		} = self;

		let read = QuicReadHalf {
			recv,
			session: session.clone(),
			deadline: read_deadline,
		};
		let write = QuicWriteHalf {
			send,
			session,
			deadline: write_deadline,
		};
		(read, write)
	}
}

#[async_trait]
impl Connection for QuicStream {
	fn local_addr(&self) -> io::Result<SocketAddr> {
		self.session.local_addr()
	}

	fn remote_addr(&self) -> io::Result<SocketAddr> {
		Ok(self.session.remote_addr())
	}

	fn set_read_deadline(&mut self, deadline: Option<Instant>) {
		self.read_deadline.set(deadline);
	}

	fn set_write_deadline(&mut self, deadline: Option<Instant>) {
		self.write_deadline.set(deadline);
	}

	/// Finishes the stream and waits for the peer to acknowledge it, then
	/// closes the session.
	///
	/// Closing a QUIC connection discards stream data still in flight, so the
	/// session is only closed after the peer has read everything or a second
	/// has passed.
	async fn close(&mut self) -> io::Result<()> {
		let finished = finish(&mut self.send).await;
		self.session.close();
		finished
	}
}

impl AsyncRead for QuicStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		poll_read(&mut this.recv, &mut this.read_deadline, cx, buf)
	}
}

impl AsyncWrite for QuicStream {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		poll_write(&mut this.send, &mut this.write_deadline, cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		poll_flush(&mut this.send, &mut this.write_deadline, cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
	}
}

/// The receiving half of a [`QuicStream`].
#[derive(Debug)]
pub struct QuicReadHalf {
	recv: RecvStream,
	session: QuicSession,
	deadline: Deadline,
}

impl QuicReadHalf {
	#[inline]
	pub fn session(&self) -> &QuicSession {
		&self.session
	}

	pub fn set_deadline(&mut self, deadline: Option<Instant>) {
		self.deadline.set(deadline);
	}
}

impl AsyncRead for QuicReadHalf {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		poll_read(&mut this.recv, &mut this.deadline, cx, buf)
	}
}

/// The sending half of a [`QuicStream`].
#[derive(Debug)]
pub struct QuicWriteHalf {
	send: SendStream,
	session: QuicSession,
	deadline: Deadline,
}

impl QuicWriteHalf {
	#[inline]
	pub fn session(&self) -> &QuicSession {
		&self.session
	}

	pub fn set_deadline(&mut self, deadline: Option<Instant>) {
		self.deadline.set(deadline);
	}

	/// Finishes the stream and waits for the peer to acknowledge it.
	///
	/// The session stays open while the read half holds it.
	pub async fn close(&mut self) -> io::Result<()> {
		finish(&mut self.send).await
	}
}

impl AsyncWrite for QuicWriteHalf {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		poll_write(&mut this.send, &mut this.deadline, cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		poll_flush(&mut this.send, &mut this.deadline, cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
	}
}

async fn finish(send: &mut SendStream) -> io::Result<()> {
	send.finish()
		.map_err(|error| io::Error::new(io::ErrorKind::NotConnected, error))?;

	match tokio::time::timeout(CLOSE_LINGER, send.stopped()).await {
		Ok(Ok(None)) => Ok(()),
		Ok(Ok(Some(code))) => {
			tracing::debug!(%code, "peer stopped the stream before reading it");
			Ok(())
		}
		Ok(Err(error)) => Err(io::Error::new(io::ErrorKind::ConnectionAborted, error)),
		Err(_) => {
			tracing::debug!(linger = ?CLOSE_LINGER, "peer did not acknowledge the stream in time");
			Ok(())
		}
	}
}

fn poll_read(
	recv: &mut RecvStream,
	deadline: &mut Deadline,
	cx: &mut Context<'_>,
	buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<()>> {
	deadline.poll_io(cx, |cx| AsyncRead::poll_read(Pin::new(recv), cx, buf))
}

fn poll_write(
	send: &mut SendStream,
	deadline: &mut Deadline,
	cx: &mut Context<'_>,
	buf: &[u8],
) -> Poll<io::Result<usize>> {
	deadline.poll_io(cx, |cx| AsyncWrite::poll_write(Pin::new(send), cx, buf))
}

fn poll_flush(
	send: &mut SendStream,
	deadline: &mut Deadline,
	cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
	deadline.poll_io(cx, |cx| AsyncWrite::poll_flush(Pin::new(send), cx))
}
