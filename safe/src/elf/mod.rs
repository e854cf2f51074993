use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use fxhash::FxHashMap;
use memmap2::Mmap;
use tracing::{debug, warn};

use crate::utilities::{read_cstr, FromByteStream};

pub mod header;
pub mod section;
pub mod symbol;

pub use header::{ElfHeader, ElfIdent, ProgramHeader};
pub use section::{Section, SectionHeader};
pub use symbol::Symbol;

use header::{CLASS_64, DATA_LITTLE_ENDIAN, ELF_MAGIC};
use section::SHT_NOBITS;
use symbol::SymbolRecord;

#[derive(Debug)]
pub enum ElfError {
	Io(std::io::Error),
	NotElf,
	UnsupportedClass(u8),
	UnsupportedEncoding(u8),
	UnloadedHeader,
	NoSections,
	SectionNotFound(String),
	EmptyProgramHeaders,
	EmptySymbolTable,
}

impl From<std::io::Error> for ElfError {
	fn from(value: std::io::Error) -> Self {
		Self::Io(value)
	}
}

/// An eagerly indexed view of one ELF object.
///
/// All headers, section bytes and symbols are decoded up front; accessors only
/// hand out references. Section bytes are copied into per-section shared
/// buffers, so sections and symbols stay valid independently of the mapping
/// that backed the parse.
pub struct ElfFile {
	header: Option<ElfHeader>,
	program_headers: Vec<ProgramHeader>,
	sections: FxHashMap<Arc<str>, Section>,
	symbols: Vec<Symbol>,
}

impl ElfFile {
	pub fn open(path: impl AsRef<Path>) -> Result<Self, ElfError> {
		let file = File::open(path.as_ref())?;
		let map = unsafe { Mmap::map(&file)? };
		Self::parse(&map)
	}

	pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
		let mut stream = Cursor::new(data);
		let ident = ElfIdent::read(&mut stream, &()).map_err(|_| ElfError::NotElf)?;
		if ident.magic != ELF_MAGIC {
			return Err(ElfError::NotElf);
		}
		if ident.data != DATA_LITTLE_ENDIAN {
			return Err(ElfError::UnsupportedEncoding(ident.data));
		}
		if ident.class != CLASS_64 {
			return Err(ElfError::UnsupportedClass(ident.class));
		}

		let header = match ElfHeader::read(&mut stream, &ident) {
			Ok(header) => Some(header),
			Err(error) => {
				warn!("failed to decode ELF header: {error}");
				None
			}
		};

		let mut elf = Self {
			header,
			program_headers: Vec::new(),
			sections: FxHashMap::default(),
			symbols: Vec::new(),
		};

		if let Some(header) = elf.header {
			elf.load_program_headers(data, &header);
			elf.load_sections(data, &header);
			elf.load_symbol_table();
		}

		Ok(elf)
	}

	pub fn header(&self) -> Result<&ElfHeader, ElfError> {
		self.header.as_ref().ok_or(ElfError::UnloadedHeader)
	}

	pub fn section(&self, name: &str) -> Result<&Section, ElfError> {
		if self.sections.is_empty() {
			return Err(ElfError::NoSections);
		}
		self.sections
			.get(name)
			.ok_or_else(|| ElfError::SectionNotFound(name.to_string()))
	}

	pub fn program_headers(&self) -> Result<&[ProgramHeader], ElfError> {
		match self.program_headers.is_empty() {
			true => Err(ElfError::EmptyProgramHeaders),
			false => Ok(&self.program_headers),
		}
	}

	pub fn symbol_table(&self) -> Result<&[Symbol], ElfError> {
		match self.symbols.is_empty() {
			true => Err(ElfError::EmptySymbolTable),
			false => Ok(&self.symbols),
		}
	}

	pub fn sections(&self) -> impl Iterator<Item = &Section> {
		self.sections.values()
	}

	fn load_program_headers(&mut self, data: &[u8], header: &ElfHeader) {
		let entry_size = header.program_header_entry_size as u64;
		for i in 0..header.program_header_count as u64 {
			let offset = header.program_header_offset + i * entry_size;
			let mut stream = Cursor::new(data);
			stream.set_position(offset);
			match ProgramHeader::read(&mut stream, &()) {
				Ok(program_header) => self.program_headers.push(program_header),
				Err(error) => warn!("skipping program header {i}: {error}"),
			}
		}
	}

	fn load_sections(&mut self, data: &[u8], header: &ElfHeader) {
		let entry_size = header.section_header_entry_size as u64;
		let count = header.section_header_count as u64;

		let mut headers = Vec::with_capacity(count as usize);
		for i in 0..count {
			let offset = header.section_header_offset + i * entry_size;
			let mut stream = Cursor::new(data);
			stream.set_position(offset);
			match SectionHeader::read(&mut stream, &()) {
				Ok(section_header) => headers.push(Some(section_header)),
				Err(error) => {
					warn!("skipping section header {i}: {error}");
					headers.push(None);
				}
			}
		}

		let name_table = headers
			.get(header.section_name_index as usize)
			.copied()
			.flatten()
			.and_then(|h| section_bytes(data, &h));
		let Some(name_table) = name_table else {
			warn!("section name string table is missing; no sections loaded");
			return;
		};

		// Index 0 is the null section.
		for section_header in headers.into_iter().skip(1).flatten() {
			let Some(name) = read_cstr(name_table, section_header.name_offset as usize) else {
				warn!("section with unresolvable name offset {:#X} skipped", section_header.name_offset);
				continue;
			};
			let bytes = match section_header.section_type {
				SHT_NOBITS => Some(&[][..]),
				_ => section_bytes(data, &section_header),
			};
			let Some(bytes) = bytes else {
				warn!("section {name} data range is out of bounds, skipped");
				continue;
			};
			let section = Section {
				name: Arc::from(name),
				header: section_header,
				data: Arc::from(bytes),
			};
			// First one wins when a name repeats.
			self.sections.entry(section.name.clone()).or_insert(section);
		}
	}

	fn load_symbol_table(&mut self) {
		let (Ok(symtab), Ok(strtab)) = (self.section(".symtab"), self.section(".strtab")) else {
			return;
		};

		let entry_size = symtab.header.entry_size;
		if entry_size == 0 {
			warn!(".symtab declares a zero entry size");
			return;
		}
		let count = symtab.header.size / entry_size;
		let strtab_data = strtab.data.clone();
		let symtab_data = symtab.data.clone();

		let mut symbols = Vec::with_capacity(count as usize);
		for i in 0..count {
			let mut stream = Cursor::new(&*symtab_data);
			stream.set_position(i * entry_size);
			let record = match SymbolRecord::read(&mut stream, &()) {
				Ok(record) => record,
				Err(error) => {
					warn!("skipping symbol {i}: {error}");
					continue;
				}
			};
			let name = match record.name_offset {
				0 => Arc::from(""),
				offset => match read_cstr(&strtab_data, offset as usize) {
					Some(name) => Arc::from(name),
					None => {
						warn!("symbol {i} has an unresolvable name offset {offset:#X}");
						Arc::from("")
					}
				},
			};
			symbols.push(Symbol::new(record, name));
		}

		debug!("loaded {} symbols", symbols.len());
		self.symbols = symbols;
	}
}

fn section_bytes<'l>(data: &'l [u8], header: &SectionHeader) -> Option<&'l [u8]> {
	let start = usize::try_from(header.file_offset).ok()?;
	let end = start.checked_add(usize::try_from(header.size).ok()?)?;
	data.get(start..end)
}

impl Debug for ElfFile {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("ElfFile");
		dbg.field("header", &self.header);
		dbg.field("program_headers", &self.program_headers.len());
		dbg.field("sections", &self.sections.len());
		dbg.field("symbols", &self.symbols.len());
		dbg.finish()
	}
}
