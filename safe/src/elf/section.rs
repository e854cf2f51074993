use std::fmt::{Debug, Formatter};
use std::io::Cursor;
use std::ops::Range;
use std::sync::Arc;

use bitflags::bitflags;

use crate::utilities::FromByteStream;

pub const SHT_SYMTAB: u32 = 2;
pub const SHT_NOBITS: u32 = 8;

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct SectionFlags: u64 {
		const WRITE = 0x1;
		const ALLOC = 0x2;
		const EXECINSTR = 0x4;
		const MERGE = 0x10;
		const STRINGS = 0x20;
		const INFO_LINK = 0x40;
		const TLS = 0x400;
	}
}

/// One `Elf64_Shdr` record.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SectionHeader {
	pub name_offset: u32,
	pub section_type: u32,
	pub flags: SectionFlags,
	pub virtual_address: u64,
	pub file_offset: u64,
	pub size: u64,
	pub link: u32,
	pub info: u32,
	pub alignment: u64,
	pub entry_size: u64,
}

impl FromByteStream for SectionHeader {
	type Deps = ();
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		Ok(Self {
			name_offset: u32::read(stream, &())?,
			section_type: u32::read(stream, &())?,
			flags: SectionFlags::from_bits_retain(u64::read(stream, &())?),
			virtual_address: u64::read(stream, &())?,
			file_offset: u64::read(stream, &())?,
			size: u64::read(stream, &())?,
			link: u32::read(stream, &())?,
			info: u32::read(stream, &())?,
			alignment: u64::read(stream, &())?,
			entry_size: u64::read(stream, &())?,
		})
	}
}

/// A named section together with its bytes. `SHT_NOBITS` sections carry no bytes.
#[derive(Clone, Eq, PartialEq)]
pub struct Section {
	pub name: Arc<str>,
	pub header: SectionHeader,
	pub data: Arc<[u8]>,
}

impl Section {
	pub fn virtual_range(&self) -> Range<u64> {
		self.header.virtual_address..self.header.virtual_address + self.header.size
	}

	pub fn contains_address(&self, address: u64) -> bool {
		self.virtual_range().contains(&address)
	}
}

impl Debug for Section {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("Section");
		dbg.field("name", &self.name);
		dbg.field("header", &self.header);
		dbg.field("data", &format_args!("[u8; {:#X}]", self.data.len()));
		dbg.finish()
	}
}
