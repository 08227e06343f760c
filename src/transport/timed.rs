use super::{Connection, Deadline};
use std::{
	io,
	net::SocketAddr,
	pin::Pin,
	task::{Context, Poll},
};
use tokio::{
	io::{AsyncRead, AsyncWrite, ReadBuf},
	net::TcpStream,
	time::Instant,
};

/// Adds deadlines and endpoint addresses to any async byte stream.
#[derive(Debug)]
pub struct Timed<T> {
	inner: T,
	local: Option<SocketAddr>,
	remote: Option<SocketAddr>,
	read_deadline: Deadline,
	write_deadline: Deadline,
}

impl<T> Timed<T> {
	/// Wraps `inner`. Address queries fail with [`io::ErrorKind::NotConnected`]
	/// for addresses passed as `None`.
	pub fn new(inner: T, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
		Self {
			inner,
			local,
			remote,
			read_deadline: Deadline::default(),
			write_deadline: Deadline::default(),
		}
	}

	#[inline]
	pub fn get_ref(&self) -> &T {
		&self.inner
	}

	#[inline]
	pub fn into_inner(self) -> T {
		self.inner
	}
}

impl Timed<TcpStream> {
	pub fn tcp(stream: TcpStream) -> io::Result<Self> {
		let local = stream.local_addr()?;
		let remote = stream.peer_addr()?;
		Ok(Self::new(stream, Some(local), Some(remote)))
	}
}

fn address(addr: Option<SocketAddr>) -> io::Result<SocketAddr> {
	addr.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no address for stream"))
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for Timed<T> {
	fn local_addr(&self) -> io::Result<SocketAddr> {
		address(self.local)
	}

	fn remote_addr(&self) -> io::Result<SocketAddr> {
		address(self.remote)
	}

	fn set_read_deadline(&mut self, deadline: Option<Instant>) {
		self.read_deadline.set(deadline);
	}

	fn set_write_deadline(&mut self, deadline: Option<Instant>) {
		self.write_deadline.set(deadline);
	}
}

impl<T: AsyncRead + Unpin> AsyncRead for Timed<T> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		let inner = &mut this.inner;
		this.read_deadline
			.poll_io(cx, |cx| Pin::new(inner).poll_read(cx, buf))
	}
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Timed<T> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		let inner = &mut this.inner;
		this.write_deadline
			.poll_io(cx, |cx| Pin::new(inner).poll_write(cx, buf))
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		let inner = &mut this.inner;
		this.write_deadline
			.poll_io(cx, |cx| Pin::new(inner).poll_flush(cx))
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	#[tokio::test]
	async fn passes_bytes_through() {
		let (a, b) = tokio::io::duplex(64);
		let mut a = Timed::new(a, None, None);
		let mut b = Timed::new(b, None, None);

		a.write_all(b"hello").await.unwrap();
		let mut buf = [0; 5];
		b.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");

		assert_eq!(
			a.local_addr().unwrap_err().kind(),
			io::ErrorKind::NotConnected
		);
	}

	#[tokio::test(start_paused = true)]
	async fn read_deadline_interrupts_pending_read() {
		let (a, _b) = tokio::io::duplex(64);
		let mut a = Timed::new(a, None, None);
		a.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

		let mut buf = [0; 1];
		let error = a.read(&mut buf).await.unwrap_err();
		assert_eq!(error.kind(), io::ErrorKind::TimedOut);

		// Clearing the deadline makes the stream usable again.
		a.set_deadline(None);
		a.write_all(b"x").await.unwrap();
	}

	#[tokio::test]
	async fn reports_tcp_addresses() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let server = listener.local_addr().unwrap();

		let (client, accepted) = tokio::join!(TcpStream::connect(server), listener.accept());
		let client = Timed::tcp(client.unwrap()).unwrap();
		let (_, peer) = accepted.unwrap();

		assert_eq!(client.remote_addr().unwrap(), server);
		assert_eq!(client.local_addr().unwrap(), peer);
	}
}
