use crate::{QoS, TopicBuf};
use bytes::Bytes;
use std::{num::NonZeroU16, ops};

/// Username and optional password sent in the Connect packet.
///
/// MQTT 3.1.1 does not allow a password without a username.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
	pub username: String,
	pub password: Option<String>,
}

impl From<&str> for Credentials {
	#[inline]
	fn from(username: &str) -> Self {
		Self {
			username: username.to_owned(),
			password: None,
		}
	}
}

impl From<(&str, &str)> for Credentials {
	#[inline]
	fn from((username, password): (&str, &str)) -> Self {
		Self {
			username: username.to_owned(),
			password: Some(password.to_owned()),
		}
	}
}

/// A message the Server publishes on the Client's behalf if the connection
/// ends without a Disconnect packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Will {
	pub topic: TopicBuf,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
}

/// A non-zero u16 which wraps from `u16::MAX` to 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WrappingNonZeroU16(NonZeroU16);

impl WrappingNonZeroU16 {
	pub const MAX: Self = Self(NonZeroU16::MAX);

	#[inline]
	pub fn get(&self) -> NonZeroU16 {
		let Self(inner) = self;
		*inner
	}
}

impl Default for WrappingNonZeroU16 {
	#[inline]
	fn default() -> Self {
		Self(NonZeroU16::MIN)
	}
}

impl ops::AddAssign<u16> for WrappingNonZeroU16 {
	#[inline]
	fn add_assign(&mut self, rhs: u16) {
		let Self(inner) = self;
		*inner = inner.checked_add(rhs).unwrap_or(NonZeroU16::MIN);
	}
}
