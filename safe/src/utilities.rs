use std::io::{Cursor, Read};
use std::mem::size_of;

/// Fixed-layout values decodable from a little-endian byte stream.
pub trait FromByteStream where Self: Sized {
	type Deps;
	fn read(stream: &mut Cursor<&[u8]>, deps: &Self::Deps) -> std::io::Result<Self>;
}

macro_rules! impl_from_le_byte_stream {
	($($ty: ty),*) => {$(
		impl crate::utilities::FromByteStream for $ty {
			type Deps = ();
			#[inline]
			fn read(stream: &mut std::io::Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
				let bytes = <[u8; size_of::<Self>()]>::read(stream, &())?;
				Ok(Self::from_le_bytes(bytes))
			}
		}
	)*};
}

impl FromByteStream for u8 {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		let mut byte = 0u8;
		stream.read_exact(std::slice::from_mut(&mut byte))?;
		Ok(byte)
	}
}

impl_from_le_byte_stream!(u16, u32, u64, i32, i64);

impl<const SIZE: usize> FromByteStream for [u8; SIZE] {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		let mut bytes = [0u8; SIZE];
		stream.read_exact(&mut bytes)?;
		Ok(bytes)
	}
}

/// Reads the NUL-terminated string starting at `offset` in `bytes`.
pub(crate) fn read_cstr(bytes: &[u8], offset: usize) -> Option<&str> {
	let tail = bytes.get(offset..)?;
	let end = tail.iter().position(|b| *b == b'\0')?;
	std::str::from_utf8(&tail[..end]).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn primitives_decode_little_endian() {
		let data = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
		let mut stream = Cursor::new(data.as_slice());
		assert_eq!(u16::read(&mut stream, &()).unwrap(), 0x0201);
		assert_eq!(u32::read(&mut stream, &()).unwrap(), 0x0605_0403);
		assert!(u32::read(&mut stream, &()).is_err());
	}

	#[test]
	fn cstr_stops_at_nul() {
		let bytes = b"\0.text\0junk";
		assert_eq!(read_cstr(bytes, 1), Some(".text"));
		assert_eq!(read_cstr(bytes, 0), Some(""));
		assert_eq!(read_cstr(bytes, 64), None);
	}
}
