use crate::{packets::ParseError, PacketId};
use bytes::{Buf, BufMut};
use std::{io, mem, str::from_utf8};

/// The largest value representable by the variable length encoding.
pub const MAX_VAR: usize = 268_435_455;

#[derive(Debug, thiserror::Error)]
#[error("value cannot be encoded")]
pub struct WriteError;

pub fn require(src: &io::Cursor<&[u8]>, len: usize) -> Result<(), ParseError> {
	(src.remaining() >= len).then_some(()).ok_or(ParseError::Incomplete)
}

pub fn get_u8(src: &mut io::Cursor<&[u8]>) -> Result<u8, ParseError> {
	require(src, mem::size_of::<u8>())?;
	Ok(src.get_u8())
}

pub fn get_u16(src: &mut io::Cursor<&[u8]>) -> Result<u16, ParseError> {
	require(src, mem::size_of::<u16>())?;
	Ok(src.get_u16())
}

pub fn get_id(src: &mut io::Cursor<&[u8]>) -> Result<PacketId, ParseError> {
	let id = get_u16(src)?;
	PacketId::new(id).ok_or(ParseError::ZeroPacketId)
}

pub fn get_slice<'s>(src: &mut io::Cursor<&'s [u8]>, len: usize) -> Result<&'s [u8], ParseError> {
	require(src, len)?;
	let position = src.position() as usize;
	src.advance(len);
	Ok(&src.get_ref()[position..position + len])
}

pub fn get_str<'s>(src: &mut io::Cursor<&'s [u8]>) -> Result<&'s str, ParseError> {
	let len = get_u16(src)? as usize;
	let slice = get_slice(src, len)?;
	Ok(from_utf8(slice)?)
}

pub fn put_str(dst: &mut impl BufMut, s: &str) -> Result<(), WriteError> {
	put_bytes(dst, s.as_bytes())
}

/// Writes a length-prefixed byte string.
pub fn put_bytes(dst: &mut impl BufMut, b: &[u8]) -> Result<(), WriteError> {
	let len = u16::try_from(b.len()).map_err(|_| WriteError)?;
	dst.put_u16(len);
	dst.put_slice(b);
	Ok(())
}

/// Reads the Remaining Length field: up to four bytes, seven bits each,
/// least significant first.
pub fn get_var(src: &mut io::Cursor<&[u8]>) -> Result<usize, ParseError> {
	let mut value = 0;
	for shift in [0, 7, 14, 21] {
		let byte = get_u8(src)?;
		value |= usize::from(byte & 0x7f) << shift;
		if byte & 0x80 == 0 {
			return Ok(value);
		}
	}
	Err(ParseError::MalformedLength)
}

pub fn put_var(dst: &mut impl BufMut, mut value: usize) -> Result<(), WriteError> {
	if value > MAX_VAR {
		return Err(WriteError);
	}

	loop {
		let byte = (value & 0x7f) as u8;
		value >>= 7;
		if value == 0 {
			dst.put_u8(byte);
			return Ok(());
		}
		dst.put_u8(byte | 0x80);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packets::ParseError;

	#[test]
	fn encodes_variable_lengths() {
		for (value, expected) in [
			(0, &[0x00][..]),
			(127, &[0x7f][..]),
			(128, &[0x80, 0x01][..]),
			(16_383, &[0xff, 0x7f][..]),
			(16_384, &[0x80, 0x80, 0x01][..]),
			(MAX_VAR, &[0xff, 0xff, 0xff, 0x7f][..]),
		] {
			let mut buf = Vec::new();
			put_var(&mut buf, value).unwrap();
			assert_eq!(buf, expected, "encoding {value}");
			assert_eq!(get_var(&mut io::Cursor::new(expected)).unwrap(), value);
		}

		assert!(put_var(&mut Vec::new(), MAX_VAR + 1).is_err());
	}

	#[test]
	fn rejects_overlong_variable_lengths() {
		let mut cursor = io::Cursor::new(&[0xff, 0xff, 0xff, 0xff, 0x01][..]);
		assert!(matches!(
			get_var(&mut cursor),
			Err(ParseError::MalformedLength)
		));

		let mut cursor = io::Cursor::new(&[0x80, 0x80][..]);
		assert!(matches!(get_var(&mut cursor), Err(ParseError::Incomplete)));
	}
}
