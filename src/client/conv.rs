//! Argument conversions for [`Client`](super::Client) methods.
use crate::{FilterBuf, FilterError, QoS};

/// Filters to unsubscribe from.
#[derive(Debug)]
pub struct Filters(pub(crate) Vec<FilterBuf>);

/// Filters to subscribe to, each with its requested QoS.
///
/// Filters given without a QoS are requested at [`QoS::AtMostOnce`].
#[derive(Debug)]
pub struct FiltersWithQoS(pub(crate) Vec<(FilterBuf, QoS)>);

fn validate<S: Into<String>>(filters: impl IntoIterator<Item = S>) -> Result<Vec<FilterBuf>, FilterError> {
	filters.into_iter().map(FilterBuf::new).collect()
}

impl TryFrom<&str> for Filters {
	type Error = FilterError;
	fn try_from(value: &str) -> Result<Self, Self::Error> {
		validate([value]).map(Self)
	}
}

impl TryFrom<&[&str]> for Filters {
	type Error = FilterError;
	fn try_from(value: &[&str]) -> Result<Self, Self::Error> {
		validate(value.iter().copied()).map(Self)
	}
}

impl TryFrom<Vec<String>> for Filters {
	type Error = FilterError;
	fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
		validate(value).map(Self)
	}
}

impl From<Vec<FilterBuf>> for Filters {
	#[inline]
	fn from(value: Vec<FilterBuf>) -> Self {
		Self(value)
	}
}

impl TryFrom<&str> for FiltersWithQoS {
	type Error = FilterError;
	fn try_from(value: &str) -> Result<Self, Self::Error> {
		Self::try_from((value, QoS::default()))
	}
}

impl TryFrom<String> for FiltersWithQoS {
	type Error = FilterError;
	fn try_from(value: String) -> Result<Self, Self::Error> {
		Ok(Self(vec![(FilterBuf::new(value)?, QoS::default())]))
	}
}

impl TryFrom<(&str, QoS)> for FiltersWithQoS {
	type Error = FilterError;
	fn try_from(value: (&str, QoS)) -> Result<Self, Self::Error> {
		Self::try_from(&[value][..])
	}
}

impl TryFrom<&[(&str, QoS)]> for FiltersWithQoS {
	type Error = FilterError;
	fn try_from(value: &[(&str, QoS)]) -> Result<Self, Self::Error> {
		value
			.iter()
			.map(|&(filter, qos)| Ok((FilterBuf::new(filter)?, qos)))
			.collect::<Result<_, _>>()
			.map(Self)
	}
}

impl From<Vec<(FilterBuf, QoS)>> for FiltersWithQoS {
	#[inline]
	fn from(value: Vec<(FilterBuf, QoS)>) -> Self {
		Self(value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn converts_filters() {
		let FiltersWithQoS(filters) = ("a/+", QoS::AtLeastOnce).try_into().unwrap();
		assert_eq!(filters, vec![(FilterBuf::new("a/+").unwrap(), QoS::AtLeastOnce)]);

		let FiltersWithQoS(filters) = "a/b".try_into().unwrap();
		assert_eq!(filters[0].1, QoS::AtMostOnce);

		let Filters(filters) = (&["a", "b/#"][..]).try_into().unwrap();
		assert_eq!(filters.len(), 2);

		assert!(FiltersWithQoS::try_from("a/#/b").is_err());
		assert!(Filters::try_from(vec![String::from("a+")]).is_err());
	}
}
