use std::io::{Cursor, Error, ErrorKind};

use crate::utilities::FromByteStream;

/// Encoding byte meaning "no value"; reads nothing and yields zero.
pub const DW_EH_PE_OMIT: u8 = 0xFF;

pub const FORM_MASK: u8 = 0x0F;
pub const APPLICATION_MASK: u8 = 0x70;
pub const INDIRECT_FLAG: u8 = 0x80;

pub const DW_EH_PE_ABSPTR: u8 = 0x00;
pub const DW_EH_PE_ULEB128: u8 = 0x01;
pub const DW_EH_PE_UDATA2: u8 = 0x02;
pub const DW_EH_PE_UDATA4: u8 = 0x03;
pub const DW_EH_PE_UDATA8: u8 = 0x04;
pub const DW_EH_PE_SLEB128: u8 = 0x09;
pub const DW_EH_PE_SDATA4: u8 = 0x0B;
pub const DW_EH_PE_SDATA8: u8 = 0x0C;

pub const DW_EH_PE_PCREL: u8 = 0x10;

pub fn read_uleb128(stream: &mut Cursor<&[u8]>) -> std::io::Result<u64> {
	let mut result = 0u64;
	let mut shift = 0u32;
	loop {
		let byte = u8::read(stream, &())?;
		result |= u64::from(byte & 0x7F) << shift;
		if byte & 0x80 == 0 {
			return Ok(result);
		}
		shift += 7;
		if shift >= 64 {
			return Err(Error::new(ErrorKind::InvalidData, "uleb128 overflow"));
		}
	}
}

pub fn read_sleb128(stream: &mut Cursor<&[u8]>) -> std::io::Result<i64> {
	let mut result = 0i64;
	let mut shift = 0u32;
	loop {
		let byte = u8::read(stream, &())?;
		result |= i64::from(byte & 0x7F) << shift;
		shift += 7;
		if byte & 0x80 == 0 {
			if shift < 64 && byte & 0x40 != 0 {
				result |= -1i64 << shift;
			}
			return Ok(result);
		}
		if shift >= 64 {
			return Err(Error::new(ErrorKind::InvalidData, "sleb128 overflow"));
		}
	}
}

/// Reads one `DW_EH_PE_*`-encoded value.
///
/// The pc-relative application base is the cursor position at which the value
/// starts. The indirect flag is not meaningful when decoding a raw section
/// image and is rejected.
pub fn read_encoded(stream: &mut Cursor<&[u8]>, encoding: u8) -> std::io::Result<u64> {
	if encoding == DW_EH_PE_OMIT {
		return Ok(0);
	}
	if encoding & INDIRECT_FLAG != 0 {
		return Err(Error::new(ErrorKind::InvalidData, "indirect encoding in raw section"));
	}

	let base = stream.position();
	let value = match encoding & FORM_MASK {
		DW_EH_PE_ABSPTR | DW_EH_PE_UDATA8 => u64::read(stream, &())?,
		DW_EH_PE_ULEB128 => read_uleb128(stream)?,
		DW_EH_PE_UDATA2 => u64::from(u16::read(stream, &())?),
		DW_EH_PE_UDATA4 => u64::from(u32::read(stream, &())?),
		DW_EH_PE_SLEB128 => read_sleb128(stream)? as u64,
		DW_EH_PE_SDATA4 => i64::from(i32::read(stream, &())?) as u64,
		DW_EH_PE_SDATA8 => i64::read(stream, &())? as u64,
		form => {
			return Err(Error::new(
				ErrorKind::InvalidData,
				format!("unsupported DW_EH_PE form {form:#04X}"),
			))
		}
	};

	Ok(match encoding & APPLICATION_MASK {
		DW_EH_PE_PCREL => value.wrapping_add(base),
		_ => value,
	})
}
