use std::io::Write;

use cpp_demangle::DemangleOptions;
use fxhash::FxHashMap;
use tracing::{debug, warn};

use crate::elf::{Section, Symbol};

/// Demangles an Itanium-mangled name, including special names such as
/// `typeinfo for T`. Returns none for names that do not demangle.
pub fn demangle(mangled: &str) -> Option<String> {
	let symbol = cpp_demangle::Symbol::new(mangled.as_bytes()).ok()?;
	symbol.demangle(&DemangleOptions::default()).ok()
}

#[derive(Debug)]
pub enum ScanError {
	UnknownFunction(String),
	FunctionOutsideText { value: u64, text_base: u64 },
}

/// Addresses of every `typeinfo for T` object in the binary.
///
/// When two symbols share an address the first one seen stays in the index.
#[derive(Debug, Default, Clone)]
pub struct RttiIndex {
	map: FxHashMap<u64, Symbol>,
}

impl RttiIndex {
	pub fn build(symbols: &[Symbol]) -> Self {
		let mut map = FxHashMap::default();
		for symbol in symbols {
			let Some(demangled) = demangle(&symbol.name) else { continue };
			if demangled.starts_with("typeinfo") {
				map.entry(symbol.value).or_insert_with(|| symbol.clone());
			}
		}
		debug!("RTTI index holds {} typeinfo objects", map.len());
		Self { map }
	}

	pub fn get(&self, address: u64) -> Option<&Symbol> {
		self.map.get(&address)
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&u64, &Symbol)> {
		self.map.iter()
	}

	/// Writes the index as an address/name/demangled table, sorted by address.
	pub fn write_table(&self, out: &mut impl Write) -> std::io::Result<()> {
		let mut entries: Vec<(&u64, &Symbol)> = self.map.iter().collect();
		entries.sort_by_key(|(address, _)| **address);
		writeln!(out, "{:<18} {:<40} demangled", "address", "symbol")?;
		for (address, symbol) in entries {
			let demangled = demangle(&symbol.name).unwrap_or_default();
			writeln!(out, "{:#018X} {:<40} {}", address, symbol.name, demangled)?;
		}
		Ok(())
	}
}

/// Scans function bodies for pc-relative references into the RTTI index.
///
/// `throw T` lowers to code materializing the address of `typeinfo for T`
/// through a rip-relative lea; sliding a four-byte window over the body and
/// resolving each candidate displacement against the index recovers the
/// thrown types. The result over-approximates: a displacement can land on a
/// typeinfo address by accident, and throws materialized indirectly are missed.
pub struct ThrowScanner<'l> {
	symbols: &'l [Symbol],
	text: Section,
	rtti: RttiIndex,
}

impl<'l> ThrowScanner<'l> {
	pub fn new(symbols: &'l [Symbol], text: Section) -> Self {
		let rtti = RttiIndex::build(symbols);
		if rtti.is_empty() {
			warn!("binary exposes no typeinfo symbols; throw scans will come up empty");
		}
		Self { symbols, text, rtti }
	}

	pub fn rtti(&self) -> &RttiIndex {
		&self.rtti
	}

	pub fn symbol(&self, name: &str) -> Option<&Symbol> {
		self.symbols.iter().find(|symbol| &*symbol.name == name)
	}

	/// The set of typeinfo symbols `function` may throw, in scan order.
	pub fn throws(&self, function: &str) -> Result<Vec<Symbol>, ScanError> {
		let symbol = self
			.symbol(function)
			.ok_or_else(|| ScanError::UnknownFunction(function.to_string()))?;

		let text_base = self.text.header.virtual_address;
		let offset = symbol
			.value
			.checked_sub(text_base)
			.and_then(|offset| usize::try_from(offset).ok())
			.filter(|offset| *offset <= self.text.data.len())
			.ok_or(ScanError::FunctionOutsideText { value: symbol.value, text_base })?;

		// A declared size running past the section is clipped, not rejected.
		let declared = usize::try_from(symbol.size).unwrap_or(usize::MAX);
		let end = offset.saturating_add(declared).min(self.text.data.len());
		let window = &self.text.data[offset..end];

		let mut thrown: Vec<Symbol> = Vec::new();
		if window.len() >= 4 {
			for i in 0..=window.len() - 4 {
				let displacement = i32::from_le_bytes(window[i..i + 4].try_into().unwrap());
				let anchor = symbol.value.wrapping_add(i as u64).wrapping_add(4);
				let target = anchor.wrapping_add(displacement as i64 as u64);
				if let Some(rtti_symbol) = self.rtti.get(target) {
					if !thrown.iter().any(|t| t.value == rtti_symbol.value) {
						debug!(
							function,
							offset = i,
							target,
							symbol = %rtti_symbol.name,
							"throw-site candidate"
						);
						thrown.push(rtti_symbol.clone());
					}
				}
			}
		}
		Ok(thrown)
	}

	/// Per-function scan trace for the debug log.
	pub fn write_scan_trace(&self, function: &str, out: &mut impl Write) -> std::io::Result<()> {
		writeln!(out, "[{function}]")?;
		match self.throws(function) {
			Err(error) => writeln!(out, "  scan failed: {error:?}"),
			Ok(thrown) if thrown.is_empty() => writeln!(out, "  no typeinfo references"),
			Ok(thrown) => {
				for symbol in thrown {
					let demangled = demangle(&symbol.name).unwrap_or_default();
					writeln!(out, "  {:#X} {} {}", symbol.value, symbol.name, demangled)?;
				}
				Ok(())
			}
		}
	}
}
