//! MQTT 3.1.1 control packets.
//!
//! Packets are framed by [`Frame`], decoded with [`Packet::parse`], and
//! encoded through [`SerializePacket`].
use crate::{
	filter::FilterError, misc, serde, serde::WriteError, FilterBuf, InvalidQoS, InvalidTopic,
	PacketId, QoS, Topic, TopicBuf,
};
use bytes::{Buf, BufMut, Bytes};
use std::{borrow::Cow, fmt, io, str::Utf8Error};

const DEFAULT_PROTOCOL_NAME: &str = "MQTT";
const DEFAULT_PROTOCOL_LEVEL: u8 = 4;

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PUBACK: u8 = 0x40;
const PUBREC: u8 = 0x50;
const PUBREL: u8 = 0x60;
const PUBCOMP: u8 = 0x70;
const SUBSCRIBE: u8 = 0x80;
const SUBACK: u8 = 0x90;
const UNSUBSCRIBE: u8 = 0xa0;
const UNSUBACK: u8 = 0xb0;
const PINGREQ: u8 = 0xc0;
const PINGRESP: u8 = 0xd0;
const DISCONNECT: u8 = 0xe0;

const PUBLISH_HEADER_RETAIN_FLAG: u8 = 0x01;
const PUBLISH_HEADER_DUPLICATE_FLAG: u8 = 0x08;
const PUBLISH_HEADER_QOS_MASK: u8 = 0x06;

macro_rules! id_packet {
	($name:ident, $header:literal) => {
		#[derive(Clone, Copy, Debug, PartialEq, Eq)]
		pub struct $name {
			pub id: PacketId,
		}

		impl $name {
			pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
				if payload.len() != 2 {
					return Err(ParseError::MalformedPacket("packet must have length 2"));
				}

				let mut buf = io::Cursor::new(payload);
				let id = serde::get_id(&mut buf)?;
				Ok(Self { id })
			}
		}

		impl SerializePacket for $name {
			fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), WriteError> {
				let Self { id } = self;
				dst.put_u8($header);
				serde::put_var(dst, 2)?;
				dst.put_u16(id.get());
				Ok(())
			}
		}

	};
}

macro_rules! nul_packet {
	($name:ident, $header:literal) => {
		#[derive(Clone, Copy, Debug, PartialEq, Eq)]
		pub struct $name;

		impl $name {
			pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
				if !payload.is_empty() {
					return Err(ParseError::MalformedPacket("packet must have length 0"));
				}
				Ok(Self)
			}
		}

		impl SerializePacket for $name {
			fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), WriteError> {
				dst.put_u8($header);
				serde::put_var(dst, 0)?;
				Ok(())
			}
		}

	};
}

/// Declares [`Packet`], [`PacketType`] and the per-variant dispatch between
/// them.
macro_rules! packets {
	(
		with_payload { $($data:ident($inner:ty)),* $(,)? }
		empty { $($unit:ident),* $(,)? }
	) => {
		/// The kind of a control packet.
		#[derive(Clone, Copy, Debug, PartialEq, Eq)]
		pub enum PacketType {
			$($data,)*
			$($unit,)*
		}

		/// A decoded MQTT control packet.
		#[derive(Debug, PartialEq, Eq)]
		pub enum Packet {
			$($data($inner),)*
			$($unit,)*
		}

		impl Packet {
			#[inline]
			pub fn packet_type(&self) -> PacketType {
				match self {
					$(Self::$data(_) => PacketType::$data,)*
					$(Self::$unit => PacketType::$unit,)*
				}
			}
		}

		impl SerializePacket for Packet {
			fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), WriteError> {
				match self {
					$(Self::$data(packet) => packet.serialize_to_bytes(dst),)*
					$(Self::$unit => $unit.serialize_to_bytes(dst),)*
				}
			}
		}

		$(impl From<$data> for Packet {
			#[inline]
			fn from(value: $data) -> Self {
				Self::$data(value.into())
			}
		})*

		$(impl From<$unit> for Packet {
			#[inline]
			fn from(_: $unit) -> Self {
				Self::$unit
			}
		})*
	};
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
	#[error("incomplete packet")]
	Incomplete,
	#[error("invalid quality of service")]
	InvalidQoS,
	#[error(transparent)]
	InvalidFilter(#[from] FilterError),
	#[error(transparent)]
	InvalidTopic(#[from] InvalidTopic),
	#[error("invalid packet header")]
	InvalidHeader,
	#[error("packet identifier must be non-zero")]
	ZeroPacketId,
	#[error("malformed remaining length")]
	MalformedLength,
	#[error("malformed packet: {0}")]
	MalformedPacket(&'static str),
	#[error(transparent)]
	Utf8Error(#[from] Utf8Error),
}

impl From<InvalidQoS> for ParseError {
	#[inline]
	fn from(_: InvalidQoS) -> Self {
		Self::InvalidQoS
	}
}

/// Types which can be written to the wire as a complete MQTT packet.
pub trait SerializePacket {
	fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), WriteError>;
}

/// A single framed packet: the fixed header byte and the remaining bytes.
#[derive(Debug)]
pub struct Frame {
	pub header: u8,
	pub payload: Bytes,
}

impl Frame {
	/// Checks if a complete frame can be decoded from `src`. If so, returns
	/// the length of the frame in bytes.
	pub fn check(src: &mut io::Cursor<&[u8]>) -> Result<usize, ParseError> {
		let header = serde::get_u8(src)?;
		if header & 0xf0 == 0 || header & 0xf0 == 0xf0 {
			return Err(ParseError::InvalidHeader);
		}

		let length = serde::get_var(src)?;
		serde::require(src, length)?;
		Ok(src.position() as usize + length)
	}

	/// Splits a complete frame into its header and payload.
	pub fn parse(mut frame: Bytes) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(&frame[..]);
		let header = serde::get_u8(&mut cursor)?;
		let length = serde::get_var(&mut cursor)?;
		let offset = cursor.position() as usize;

		if frame.len() != offset + length {
			return Err(ParseError::MalformedLength);
		}

		frame.advance(offset);
		Ok(Self {
			header,
			payload: frame,
		})
	}
}

packets! {
	with_payload {
		Connect(Box<Connect>),
		ConnAck(ConnAck),
		Publish(Publish),
		PubAck(PubAck),
		PubRec(PubRec),
		PubRel(PubRel),
		PubComp(PubComp),
		Subscribe(Subscribe),
		SubAck(SubAck),
		Unsubscribe(Unsubscribe),
		UnsubAck(UnsubAck),
	}
	empty { PingReq, PingResp, Disconnect }
}

impl Packet {
	/// Parses a [`Packet`] from a [`Frame`].
	pub fn parse(frame: &Frame) -> Result<Self, ParseError> {
		let payload = &frame.payload;

		match (frame.header & 0xf0, frame.header & 0x0f) {
			(CONNECT, 0x00) => Ok(Connect::parse(payload)?.into()),
			(CONNACK, 0x00) => Ok(ConnAck::parse(payload)?.into()),
			(PUBLISH, flags) => Ok(Publish::parse(payload, flags)?.into()),
			(PUBACK, 0x00) => Ok(PubAck::parse(payload)?.into()),
			(PUBREC, 0x00) => Ok(PubRec::parse(payload)?.into()),
			(PUBREL, 0x02) => Ok(PubRel::parse(payload)?.into()),
			(PUBCOMP, 0x00) => Ok(PubComp::parse(payload)?.into()),
			(SUBSCRIBE, 0x02) => Ok(Subscribe::parse(payload)?.into()),
			(SUBACK, 0x00) => Ok(SubAck::parse(payload)?.into()),
			(UNSUBSCRIBE, 0x02) => Ok(Unsubscribe::parse(payload)?.into()),
			(UNSUBACK, 0x00) => Ok(UnsubAck::parse(payload)?.into()),
			(PINGREQ, 0x00) => Ok(PingReq::parse(payload)?.into()),
			(PINGRESP, 0x00) => Ok(PingResp::parse(payload)?.into()),
			(DISCONNECT, 0x00) => Ok(Disconnect::parse(payload)?.into()),
			_ => Err(ParseError::InvalidHeader),
		}
	}
}

//
// Packet Types
//

#[derive(Debug, PartialEq, Eq)]
pub struct Connect {
	pub protocol_name: Cow<'static, str>,
	pub protocol_level: u8,
	pub client_id: String,
	pub keep_alive: u16,
	pub clean_session: bool,
	pub will: Option<misc::Will>,
	pub credentials: Option<misc::Credentials>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ConnAck {
	pub session_present: bool,
	pub code: u8,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Publish {
	AtMostOnce {
		retain: bool,
		topic: TopicBuf,
		payload: Bytes,
	},
	AtLeastOnce {
		id: PacketId,
		retain: bool,
		duplicate: bool,
		topic: TopicBuf,
		payload: Bytes,
	},
	ExactlyOnce {
		id: PacketId,
		retain: bool,
		duplicate: bool,
		topic: TopicBuf,
		payload: Bytes,
	},
}

id_packet!(PubAck, 0x40);
id_packet!(PubRec, 0x50);
id_packet!(PubRel, 0x62);
id_packet!(PubComp, 0x70);
id_packet!(UnsubAck, 0xb0);

#[derive(Debug, PartialEq, Eq)]
pub struct Subscribe {
	pub id: PacketId,
	pub filters: Vec<(FilterBuf, QoS)>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("the server rejected the subscription")]
pub struct SubscribeFailed;

#[derive(Debug, PartialEq, Eq)]
pub struct SubAck {
	pub id: PacketId,
	pub result: Vec<Result<QoS, SubscribeFailed>>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Unsubscribe {
	pub id: PacketId,
	pub filters: Vec<FilterBuf>,
}

nul_packet!(PingReq, 0xc0);
nul_packet!(PingResp, 0xd0);
nul_packet!(Disconnect, 0xe0);

impl Default for Connect {
	fn default() -> Self {
		Self {
			protocol_name: Cow::Borrowed(DEFAULT_PROTOCOL_NAME),
			protocol_level: DEFAULT_PROTOCOL_LEVEL,
			client_id: String::new(),
			keep_alive: 0,
			clean_session: true,
			will: None,
			credentials: None,
		}
	}
}

impl Connect {
	pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		let protocol_name = match serde::get_str(&mut cursor)? {
			DEFAULT_PROTOCOL_NAME => Cow::Borrowed(DEFAULT_PROTOCOL_NAME),
			_ => {
				return Err(ParseError::MalformedPacket("invalid protocol name"));
			}
		};

		let protocol_level = serde::get_u8(&mut cursor)?;
		let flags = serde::get_u8(&mut cursor)?;
		let keep_alive = serde::get_u16(&mut cursor)?;
		let client_id = serde::get_str(&mut cursor)?;

		if flags & 0x01 != 0 {
			return Err(ParseError::MalformedPacket(
				"reserved flag in Connect must be zero",
			));
		}

		let clean_session = flags & 0x02 == 0x02;
		let will = if flags & 0x04 == 0x04 {
			let topic = serde::get_str(&mut cursor)?;
			let len = serde::get_u16(&mut cursor)?;
			let payload = serde::get_slice(&mut cursor, len as usize)?;

			Some(misc::Will {
				topic: TopicBuf::new(topic)?,
				payload: Bytes::copy_from_slice(payload),
				qos: ((flags & 0x18) >> 3).try_into()?,
				retain: flags & 0x20 == 0x20,
			})
		} else {
			None
		};

		let credentials = if flags & 0x80 == 0x80 {
			let username = serde::get_str(&mut cursor)?;
			let password = if flags & 0x40 == 0x40 {
				Some(serde::get_str(&mut cursor)?.to_string())
			} else {
				None
			};
			Some(misc::Credentials {
				username: String::from(username),
				password,
			})
		} else {
			None
		};

		Ok(Self {
			protocol_name,
			protocol_level,
			client_id: String::from(client_id),
			keep_alive,
			clean_session,
			will,
			credentials,
		})
	}

	fn payload_len(&self) -> usize {
		let mut len = 2 + self.protocol_name.len()
			+ 4 // protocol level, flags, and keep alive
			+ (2 + self.client_id.len());

		if let Some(will) = &self.will {
			len += 2 + will.topic.len() + 2 + will.payload.len();
		}

		if let Some(credentials) = &self.credentials {
			len += 2 + credentials.username.len();
			if let Some(password) = &credentials.password {
				len += 2 + password.len();
			}
		}

		len
	}

	fn flags(&self) -> u8 {
		let mut flags = 0;

		if self.clean_session {
			flags |= 0x02;
		}

		if let Some(will) = &self.will {
			flags |= 0x04;
			flags |= (will.qos as u8) << 3;
			if will.retain {
				flags |= 0x20;
			}
		}

		if let Some(credentials) = &self.credentials {
			flags |= 0x80;
			if credentials.password.is_some() {
				flags |= 0x40;
			}
		}

		flags
	}
}

impl SerializePacket for Connect {
	fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), WriteError> {
		dst.put_u8(CONNECT);
		serde::put_var(dst, self.payload_len())?;

		serde::put_str(dst, &self.protocol_name)?;
		dst.put_u8(self.protocol_level);
		dst.put_u8(self.flags());
		dst.put_u16(self.keep_alive);
		serde::put_str(dst, &self.client_id)?;

		if let Some(will) = &self.will {
			serde::put_str(dst, will.topic.as_str())?;
			serde::put_bytes(dst, &will.payload)?;
		}

		if let Some(credentials) = &self.credentials {
			serde::put_str(dst, &credentials.username)?;
			if let Some(password) = &credentials.password {
				serde::put_str(dst, password)?;
			}
		}

		Ok(())
	}
}

impl ConnAck {
	/// Parses the payload of a ConnAck packet.
	pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
		if payload.len() != 2 {
			return Err(ParseError::MalformedPacket(
				"ConnAck packet must have length 2",
			));
		}

		let mut cursor = io::Cursor::new(payload);
		let flags = serde::get_u8(&mut cursor)?;
		let code = serde::get_u8(&mut cursor)?;

		if flags & 0xfe != 0 {
			return Err(ParseError::MalformedPacket(
				"upper 7 bits in ConnAck flags must be zero",
			));
		}

		Ok(Self {
			session_present: flags & 0x01 == 0x01,
			code,
		})
	}

	/// Describes why the Server refused the connection, or `None` if it was
	/// accepted.
	pub fn refused_reason(&self) -> Option<&'static str> {
		match self.code {
			0x00 => None,
			0x01 => Some("unacceptable protocol version"),
			0x02 => Some("identifier rejected"),
			0x03 => Some("server unavailable"),
			0x04 => Some("bad user name or password"),
			0x05 => Some("not authorized"),
			_ => Some("unknown return code"),
		}
	}
}

impl SerializePacket for ConnAck {
	fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), WriteError> {
		dst.put_u8(CONNACK);
		serde::put_var(dst, 2)?;
		dst.put_u8(u8::from(self.session_present));
		dst.put_u8(self.code);
		Ok(())
	}
}

impl Publish {
	pub fn parse(payload: &Bytes, flags: u8) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(&payload[..]);

		// Extract properties from the header flags.
		let retain = flags & PUBLISH_HEADER_RETAIN_FLAG == PUBLISH_HEADER_RETAIN_FLAG;
		let duplicate = flags & PUBLISH_HEADER_DUPLICATE_FLAG == PUBLISH_HEADER_DUPLICATE_FLAG;
		let qos: QoS = ((flags & PUBLISH_HEADER_QOS_MASK) >> 1).try_into()?;

		let topic = TopicBuf::new(serde::get_str(&mut cursor)?)?;

		// The interpretation of the remaining bytes depends on the QoS.
		match qos {
			QoS::AtMostOnce => {
				if duplicate {
					return Err(ParseError::MalformedPacket(
						"duplicate flag must be 0 for Publish packets with QoS of AtMostOnce",
					));
				}

				Ok(Self::AtMostOnce {
					retain,
					topic,
					payload: payload.slice(cursor.position() as usize..),
				})
			}
			QoS::AtLeastOnce => {
				let id = serde::get_id(&mut cursor)?;
				Ok(Self::AtLeastOnce {
					id,
					retain,
					duplicate,
					topic,
					payload: payload.slice(cursor.position() as usize..),
				})
			}
			QoS::ExactlyOnce => {
				let id = serde::get_id(&mut cursor)?;
				Ok(Self::ExactlyOnce {
					id,
					retain,
					duplicate,
					topic,
					payload: payload.slice(cursor.position() as usize..),
				})
			}
		}
	}

	pub fn topic(&self) -> &Topic {
		let (Self::AtMostOnce { topic, .. }
		| Self::AtLeastOnce { topic, .. }
		| Self::ExactlyOnce { topic, .. }) = self;
		topic
	}

	pub fn payload(&self) -> &Bytes {
		let (Self::AtMostOnce { payload, .. }
		| Self::AtLeastOnce { payload, .. }
		| Self::ExactlyOnce { payload, .. }) = self;
		payload
	}

	pub fn retain(&self) -> bool {
		let (Self::AtMostOnce { retain, .. }
		| Self::AtLeastOnce { retain, .. }
		| Self::ExactlyOnce { retain, .. }) = self;
		*retain
	}

	pub fn qos(&self) -> QoS {
		match self {
			Self::AtMostOnce { .. } => QoS::AtMostOnce,
			Self::AtLeastOnce { .. } => QoS::AtLeastOnce,
			Self::ExactlyOnce { .. } => QoS::ExactlyOnce,
		}
	}

	/// The packet identifier, absent at QoS 0.
	pub fn id(&self) -> Option<PacketId> {
		match self {
			Self::AtMostOnce { .. } => None,
			Self::AtLeastOnce { id, .. } | Self::ExactlyOnce { id, .. } => Some(*id),
		}
	}

	pub fn duplicate(&self) -> bool {
		match self {
			Self::AtMostOnce { .. } => false,
			Self::AtLeastOnce { duplicate, .. } | Self::ExactlyOnce { duplicate, .. } => *duplicate,
		}
	}

	/// Marks the packet as a re-delivery. QoS 0 packets are never re-delivered.
	pub fn set_duplicate(&mut self) {
		if let Self::AtLeastOnce { duplicate, .. } | Self::ExactlyOnce { duplicate, .. } = self {
			*duplicate = true;
		}
	}
}

impl SerializePacket for Publish {
	fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), WriteError> {
		let mut flags = (self.qos() as u8) << 1;
		if self.retain() {
			flags |= PUBLISH_HEADER_RETAIN_FLAG;
		}
		if self.duplicate() {
			flags |= PUBLISH_HEADER_DUPLICATE_FLAG;
		}

		let topic = self.topic();
		let payload = self.payload();
		let id_len = if self.id().is_some() { 2 } else { 0 };

		dst.put_u8(PUBLISH | flags);
		serde::put_var(dst, 2 + topic.len() + id_len + payload.len())?;
		serde::put_str(dst, topic.as_str())?;
		if let Some(id) = self.id() {
			dst.put_u16(id.get());
		}
		dst.put_slice(payload);

		Ok(())
	}
}

impl fmt::Debug for Publish {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// Payloads can be large and binary; only show their size.
		f.debug_struct("Publish")
			.field("topic", &self.topic().as_str())
			.field("qos", &self.qos())
			.field("id", &self.id())
			.field("retain", &self.retain())
			.field("duplicate", &self.duplicate())
			.field("payload", &format_args!("{} bytes", self.payload().len()))
			.finish()
	}
}

impl Subscribe {
	/// Parses the payload of a [`Subscribe`] packet.
	pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		let id = serde::get_id(&mut cursor)?;

		let mut filters = Vec::new();
		while cursor.has_remaining() {
			let filter = serde::get_str(&mut cursor)?;
			let qos: QoS = serde::get_u8(&mut cursor)?.try_into()?;
			filters.push((FilterBuf::new(filter)?, qos));
		}

		if filters.is_empty() {
			return Err(ParseError::MalformedPacket(
				"Subscribe packet must contain at least one filter",
			));
		}

		Ok(Self { id, filters })
	}
}

impl SerializePacket for Subscribe {
	fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), WriteError> {
		let Self { id, filters } = self;

		let len = 2 + filters
			.iter()
			.fold(0usize, |acc, (filter, _)| acc + 3 + filter.len());

		dst.put_u8(SUBSCRIBE | 0x02);
		serde::put_var(dst, len)?;
		dst.put_u16(id.get());
		for (filter, qos) in filters {
			serde::put_str(dst, filter.as_str())?;
			dst.put_u8(*qos as u8);
		}

		Ok(())
	}
}

impl SubAck {
	pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		let id = serde::get_id(&mut cursor)?;

		let mut result = Vec::new();
		while cursor.has_remaining() {
			let return_code = serde::get_u8(&mut cursor)?;
			let qos = match QoS::try_from(return_code) {
				Ok(qos) => Ok(qos),
				Err(_) if return_code == 0x80 => Err(SubscribeFailed),
				Err(_) => {
					return Err(ParseError::MalformedPacket("invalid return code in SubAck"));
				}
			};

			result.push(qos);
		}

		Ok(Self { id, result })
	}
}

impl SerializePacket for SubAck {
	fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), WriteError> {
		let Self { id, result } = self;

		dst.put_u8(SUBACK);
		serde::put_var(dst, 2 + result.len())?;
		dst.put_u16(id.get());
		for qos in result {
			dst.put_u8(qos.as_ref().map(|qos| *qos as u8).unwrap_or(0x80));
		}

		Ok(())
	}
}

impl Unsubscribe {
	/// Parses the payload of an [`Unsubscribe`] packet.
	pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
		let mut cursor = io::Cursor::new(payload);
		let id = serde::get_id(&mut cursor)?;

		let mut filters = Vec::new();
		while cursor.has_remaining() {
			let filter = serde::get_str(&mut cursor)?;
			filters.push(FilterBuf::new(filter)?);
		}

		Ok(Self { id, filters })
	}
}

impl SerializePacket for Unsubscribe {
	fn serialize_to_bytes(&self, dst: &mut impl BufMut) -> Result<(), WriteError> {
		let Self { id, filters } = self;

		let len = 2 + filters
			.iter()
			.fold(0usize, |acc, filter| acc + 2 + filter.len());

		dst.put_u8(UNSUBSCRIBE | 0x02);
		serde::put_var(dst, len)?;
		dst.put_u16(id.get());
		for filter in filters {
			serde::put_str(dst, filter.as_str())?;
		}

		Ok(())
	}
}
