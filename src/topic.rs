use std::{borrow, fmt, ops};

/// A borrowed, validated topic name.
///
/// Valid topics hold between 1 and 65,535 bytes and contain neither
/// wildcard characters nor NUL.
#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Topic(str);

/// An owned [`Topic`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopicBuf(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidTopic {
	#[error("topic must not be empty")]
	Empty,
	#[error("topic is longer than 65535 bytes")]
	TooLong,
	/// A wildcard or NUL at the given byte offset.
	#[error("topic contains {1:?} at byte {0}")]
	InvalidCharacter(usize, char),
}

impl Topic {
	/// Validates `topic`.
	pub fn new<S: AsRef<str> + ?Sized>(topic: &S) -> Result<&Topic, InvalidTopic> {
		let topic = topic.as_ref();
		match topic.len() {
			0 => return Err(InvalidTopic::Empty),
			len if len > usize::from(u16::MAX) => return Err(InvalidTopic::TooLong),
			_ => {}
		}

		match topic.char_indices().find(|&(_, c)| matches!(c, '+' | '#' | '\0')) {
			Some((offset, c)) => Err(InvalidTopic::InvalidCharacter(offset, c)),
			None => Ok(Self::from_str_unchecked(topic)),
		}
	}

	#[inline]
	pub fn as_str(&self) -> &str {
		let Self(inner) = self;
		inner
	}

	/// Length in bytes.
	#[inline]
	pub fn len(&self) -> usize {
		self.as_str().len()
	}

	/// Always `false` for a validated topic.
	#[inline]
	pub fn is_empty(&self) -> bool {
		self.as_str().is_empty()
	}

	/// The `/` separated levels of the topic. Empty levels are kept.
	#[inline]
	pub fn levels(&self) -> impl Iterator<Item = &str> {
		self.as_str().split('/')
	}

	#[inline]
	fn from_str_unchecked(topic: &str) -> &Topic {
		// SAFETY: Topic is a transparent wrapper around str.
		unsafe { &*(topic as *const str as *const Topic) }
	}
}

impl TopicBuf {
	pub fn new(topic: impl Into<String>) -> Result<Self, InvalidTopic> {
		let topic = topic.into();
		Topic::new(&topic)?;
		Ok(Self(topic))
	}
}

impl fmt::Display for Topic {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl fmt::Display for TopicBuf {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl AsRef<str> for Topic {
	#[inline]
	fn as_ref(&self) -> &str {
		self.as_str()
	}
}

impl ToOwned for Topic {
	type Owned = TopicBuf;
	fn to_owned(&self) -> TopicBuf {
		TopicBuf(self.as_str().to_owned())
	}
}

impl ops::Deref for TopicBuf {
	type Target = Topic;
	#[inline]
	fn deref(&self) -> &Topic {
		let Self(inner) = self;
		Topic::from_str_unchecked(inner)
	}
}

impl borrow::Borrow<Topic> for TopicBuf {
	#[inline]
	fn borrow(&self) -> &Topic {
		self
	}
}

impl From<&Topic> for TopicBuf {
	#[inline]
	fn from(value: &Topic) -> Self {
		value.to_owned()
	}
}

impl TryFrom<&str> for TopicBuf {
	type Error = InvalidTopic;
	#[inline]
	fn try_from(value: &str) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl TryFrom<String> for TopicBuf {
	type Error = InvalidTopic;
	#[inline]
	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl PartialEq<str> for TopicBuf {
	#[inline]
	fn eq(&self, other: &str) -> bool {
		self.as_str() == other
	}
}

impl PartialEq<&str> for TopicBuf {
	#[inline]
	fn eq(&self, other: &&str) -> bool {
		self.as_str() == *other
	}
}

#[cfg(test)]
mod tests {
	use super::{InvalidTopic, Topic, TopicBuf};

	#[test]
	fn validates_topics() {
		for topic in ["a", "/", "a/b", "test/topic", "a//b", " "] {
			Topic::new(topic).unwrap();
		}

		assert_eq!(Topic::new(""), Err(InvalidTopic::Empty));
		assert_eq!(
			Topic::new("a/+/c"),
			Err(InvalidTopic::InvalidCharacter(2, '+'))
		);
		assert_eq!(Topic::new("a/#"), Err(InvalidTopic::InvalidCharacter(2, '#')));
		assert_eq!(
			TopicBuf::new("x".repeat(u16::MAX as usize + 1)),
			Err(InvalidTopic::TooLong)
		);
	}

	#[test]
	fn splits_levels() {
		let topic = TopicBuf::new("sensors/kitchen/temperature").unwrap();
		assert_eq!(
			topic.levels().collect::<Vec<_>>(),
			["sensors", "kitchen", "temperature"]
		);
		assert_eq!(topic, "sensors/kitchen/temperature");
	}
}
