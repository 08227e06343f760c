//! Topic filters and topic matching.
use std::{borrow, fmt, ops};

const SEPARATOR: char = '/';
const ANY_LEVEL: &str = "+";
const ANY_SUFFIX: &str = "#";

/// Why a string is not a valid topic filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
	#[error("filter is empty")]
	Empty,
	#[error("filter is {0} bytes long, the maximum is 65535")]
	TooLong(usize),
	/// A wildcard shares a level with other characters.
	#[error("wildcard in level {0} must occupy the whole level")]
	PartialWildcard(usize),
	#[error("'#' must be the last level")]
	MultiWildcardNotLast,
}

/// How closely a topic was matched by a [`Filter`].
///
/// Ordered by exact levels, then levels matched by `+`, then levels swallowed
/// by a trailing `#`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Matches {
	pub exact: usize,
	pub wildcard: usize,
	pub multi_wildcard: usize,
}

/// A borrowed, validated MQTT topic filter.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Filter(str);

/// An owned [`Filter`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterBuf(String);

impl Filter {
	/// Validates `filter`.
	pub fn new<S: AsRef<str> + ?Sized>(filter: &S) -> Result<&Filter, FilterError> {
		let filter = filter.as_ref();
		match filter.len() {
			0 => return Err(FilterError::Empty),
			len if len > usize::from(u16::MAX) => return Err(FilterError::TooLong(len)),
			_ => {}
		}

		let mut levels = filter.split(SEPARATOR).enumerate().peekable();
		while let Some((n, level)) = levels.next() {
			let wildcard = level.contains(['+', '#']);
			if wildcard && level.len() != 1 {
				return Err(FilterError::PartialWildcard(n));
			}
			if level == ANY_SUFFIX && levels.peek().is_some() {
				return Err(FilterError::MultiWildcardNotLast);
			}
		}

		Ok(Self::from_str_unchecked(filter))
	}

	/// Creates a `Filter` from a static string without validation.
	#[inline]
	pub const fn from_static(filter: &'static str) -> &'static Filter {
		// SAFETY: Filter is a transparent wrapper around str.
		unsafe { &*(filter as *const str as *const Filter) }
	}

	#[inline]
	fn from_str_unchecked(filter: &str) -> &Filter {
		// SAFETY: Filter is a transparent wrapper around str.
		unsafe { &*(filter as *const str as *const Filter) }
	}

	/// Matches `topic` against the filter, level by level.
	///
	/// Topics beginning with `$` are not matched by a leading wildcard.
	pub fn matches_topic(&self, topic: &str) -> Option<Matches> {
		let Self(filter) = self;
		if topic.starts_with('$') && (filter.starts_with(ANY_LEVEL) || filter.starts_with(ANY_SUFFIX)) {
			return None;
		}

		let mut matches = Matches::default();
		let mut topic = topic.split(SEPARATOR);
		for level in filter.split(SEPARATOR) {
			if level == ANY_SUFFIX {
				// Zero or more levels, so "a/#" also matches "a".
				matches.multi_wildcard = topic.count();
				return Some(matches);
			}

			let candidate = topic.next()?;
			if level == ANY_LEVEL {
				matches.wildcard += 1;
			} else if level == candidate {
				matches.exact += 1;
			} else {
				return None;
			}
		}

		topic.next().is_none().then_some(matches)
	}

	#[inline]
	pub fn as_str(&self) -> &str {
		let Self(inner) = self;
		inner
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.as_str().len()
	}

	/// Always `false` for a validated filter.
	#[inline]
	pub fn is_empty(&self) -> bool {
		self.as_str().is_empty()
	}
}

impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl AsRef<str> for Filter {
	#[inline]
	fn as_ref(&self) -> &str {
		self.as_str()
	}
}

impl ToOwned for Filter {
	type Owned = FilterBuf;
	fn to_owned(&self) -> FilterBuf {
		FilterBuf(self.as_str().to_owned())
	}
}

impl FilterBuf {
	pub fn new(filter: impl Into<String>) -> Result<Self, FilterError> {
		let filter = filter.into();
		Filter::new(&filter)?;
		Ok(Self(filter))
	}
}

impl fmt::Display for FilterBuf {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl ops::Deref for FilterBuf {
	type Target = Filter;
	#[inline]
	fn deref(&self) -> &Filter {
		let Self(inner) = self;
		Filter::from_str_unchecked(inner)
	}
}

impl borrow::Borrow<Filter> for FilterBuf {
	#[inline]
	fn borrow(&self) -> &Filter {
		self
	}
}

impl From<&Filter> for FilterBuf {
	#[inline]
	fn from(value: &Filter) -> Self {
		value.to_owned()
	}
}

impl TryFrom<&str> for FilterBuf {
	type Error = FilterError;
	#[inline]
	fn try_from(value: &str) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl TryFrom<String> for FilterBuf {
	type Error = FilterError;
	#[inline]
	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

#[cfg(test)]
mod tests {
	use super::{Filter, FilterError, Matches};

	#[test]
	fn validates_filters() {
		for filter in ["a", "+", "#", "/", "a/", "/b", "+/+", "+/#", "/#", "a/b/c/#", "$SYS/#"] {
			assert!(Filter::new(filter).is_ok(), "{filter}");
		}

		assert_eq!(Filter::new(""), Err(FilterError::Empty));
		assert_eq!(Filter::new("a/b+"), Err(FilterError::PartialWildcard(1)));
		assert_eq!(Filter::new("#a"), Err(FilterError::PartialWildcard(0)));
		assert_eq!(Filter::new("a/#/c"), Err(FilterError::MultiWildcardNotLast));
		assert_eq!(Filter::new("#/"), Err(FilterError::MultiWildcardNotLast));

		let long = "a".repeat(70_000);
		assert_eq!(Filter::new(&long), Err(FilterError::TooLong(70_000)));
	}

	#[test]
	fn counts_matched_levels() {
		let filter = Filter::from_static("a/b/#");
		assert_eq!(filter.matches_topic("/b"), None);
		assert_eq!(
			filter.matches_topic("a/b"),
			Some(Matches {
				exact: 2,
				..Default::default()
			})
		);
		assert_eq!(
			filter.matches_topic("a/b/c/d"),
			Some(Matches {
				exact: 2,
				multi_wildcard: 2,
				..Default::default()
			})
		);

		let filter = Filter::from_static("+/+/c/#");
		assert_eq!(filter.matches_topic("a/b/cd/e"), None);
		assert_eq!(
			filter.matches_topic("//c//"),
			Some(Matches {
				exact: 1,
				wildcard: 2,
				multi_wildcard: 2,
			})
		);
	}

	#[test]
	fn requires_every_topic_level() {
		let filter = Filter::from_static("test/topic");
		assert!(filter.matches_topic("test/topic").is_some());
		assert_eq!(filter.matches_topic("test/topic/extra"), None);
		assert_eq!(filter.matches_topic("test"), None);
	}

	#[test]
	fn wildcards_skip_system_topics() {
		assert_eq!(Filter::from_static("#").matches_topic("$SYS/uptime"), None);
		assert_eq!(Filter::from_static("+/uptime").matches_topic("$SYS/uptime"), None);
		assert!(Filter::from_static("$SYS/#").matches_topic("$SYS/uptime").is_some());
	}

	#[test]
	fn prefers_specific_filters() {
		let topic = "a/b/c";
		let exact = Filter::from_static("a/b/c").matches_topic(topic).unwrap();
		let single = Filter::from_static("a/+/c").matches_topic(topic).unwrap();
		let multi = Filter::from_static("a/#").matches_topic(topic).unwrap();
		assert!(exact > single);
		assert!(single > multi);
	}
}
