use tracing::debug;

use crate::elf::Symbol;
use crate::lsda::{HandlerKind, Lsda};
use crate::rtti::ThrowScanner;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CorrelateError {
	/// The scanner knows nothing about this function.
	NoTypeinfoForFunction,
	/// The function exists but no thrown types were recovered.
	NoThrownTypes,
	/// No catch record matched any thrown type (or there were none at all).
	NoCatchRecords,
	/// A catch record's type index did not resolve through the type table.
	TypeResolveFailed,
	/// Correlation was requested before an LSDA was loaded.
	LsdaNotLoaded,
}

/// One handler flattened out of a scope, in scope order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CatchRecord {
	pub scope_id: usize,
	pub kind: HandlerKind,
	pub range_begin: u64,
	pub range_end: u64,
	pub landing_pad: u64,
	pub type_index: i64,
}

/// The handlers able to receive one thrown RTTI object.
#[derive(Debug, Clone)]
pub struct ThrowCatchMatch {
	pub thrown: Symbol,
	pub handlers: Vec<CatchRecord>,
}

/// Matches the types a function throws against the catch handlers the LSDA
/// declares.
///
/// Matching is by exact typeinfo address; a handler for a base class does not
/// match a thrown derived class here.
pub struct Correlator<'l> {
	scanner: &'l ThrowScanner<'l>,
	lsda: Option<&'l Lsda>,
	records: Vec<CatchRecord>,
}

impl<'l> Correlator<'l> {
	pub fn new(scanner: &'l ThrowScanner<'l>) -> Self {
		Self { scanner, lsda: None, records: Vec::new() }
	}

	pub fn load_lsda(&mut self, lsda: &'l Lsda) {
		self.records = flatten_scopes(lsda);
		self.lsda = Some(lsda);
		debug!("flattened {} catch records", self.records.len());
	}

	pub fn records(&self) -> &[CatchRecord] {
		&self.records
	}

	pub fn correlate(&self, function: &str) -> Result<Vec<ThrowCatchMatch>, CorrelateError> {
		let lsda = self.lsda.ok_or(CorrelateError::LsdaNotLoaded)?;

		let thrown = self
			.scanner
			.throws(function)
			.map_err(|_| CorrelateError::NoTypeinfoForFunction)?;
		if thrown.is_empty() {
			return Err(CorrelateError::NoThrownTypes);
		}
		if self.records.is_empty() {
			return Err(CorrelateError::NoCatchRecords);
		}

		let mut matches = Vec::with_capacity(thrown.len());
		for symbol in thrown {
			let mut handlers = Vec::new();
			for record in &self.records {
				match record.kind {
					// Cleanups run for any in-flight exception.
					HandlerKind::Cleanup => handlers.push(*record),
					// Filters (exception specifications) are not modeled.
					HandlerKind::Filter => {}
					HandlerKind::Catch => {
						let resolved = lsda
							.resolve_type(record.type_index)
							.ok_or(CorrelateError::TypeResolveFailed)?;
						if resolved == symbol.value {
							handlers.push(*record);
						}
					}
				}
			}
			matches.push(ThrowCatchMatch { thrown: symbol, handlers });
		}

		if matches.iter().all(|m| m.handlers.is_empty()) {
			return Err(CorrelateError::NoCatchRecords);
		}
		Ok(matches)
	}
}

fn flatten_scopes(lsda: &Lsda) -> Vec<CatchRecord> {
	let mut records = Vec::new();
	for (scope_id, scope) in lsda.scopes.iter().enumerate() {
		for handler in &scope.handlers {
			records.push(CatchRecord {
				scope_id,
				kind: handler.kind,
				range_begin: scope.start,
				range_end: scope.end,
				landing_pad: handler.landing_pad,
				type_index: handler.type_index,
			});
		}
	}
	records
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::elf::section::{SectionFlags, SectionHeader};
	use crate::elf::symbol::{STT_FUNC, STT_OBJECT};
	use crate::elf::{Section, Symbol};
	use crate::lsda::{Action, CallSite, Scope, ScopeHandler};
	use std::sync::Arc;

	const TEXT_BASE: u64 = 0x1000;
	const TYPEINFO_INT: u64 = 0x2000;
	const TYPEINFO_DOUBLE: u64 = 0x2010;

	fn symbol(name: &str, info: u8, value: u64, size: u64) -> Symbol {
		Symbol { name: Arc::from(name), value, size, info, other: 0, section_index: 1 }
	}

	fn text_section(data: Vec<u8>) -> Section {
		Section {
			name: Arc::from(".text"),
			header: SectionHeader {
				name_offset: 1,
				section_type: 1,
				flags: SectionFlags::ALLOC | SectionFlags::EXECINSTR,
				virtual_address: TEXT_BASE,
				file_offset: 0x40,
				size: data.len() as u64,
				link: 0,
				info: 0,
				alignment: 16,
				entry_size: 0,
			},
			data: Arc::from(data),
		}
	}

	fn patch_reference(body: &mut [u8], at: usize, target: u64) {
		let disp = target.wrapping_sub(TEXT_BASE + at as u64 + 4) as i64 as i32;
		body[at..at + 4].copy_from_slice(&disp.to_le_bytes());
	}

	fn fixture_symbols() -> Vec<Symbol> {
		vec![
			symbol("_Z5throwv", STT_FUNC, TEXT_BASE, 32),
			symbol("_Z5quietv", STT_FUNC, TEXT_BASE + 32, 16),
			symbol("_ZTIi", STT_OBJECT, TYPEINFO_INT, 16),
			symbol("_ZTId", STT_OBJECT, TYPEINFO_DOUBLE, 16),
		]
	}

	fn fixture_text() -> Vec<u8> {
		let mut body = vec![0x90u8; 48];
		patch_reference(&mut body, 4, TYPEINFO_INT);
		body
	}

	fn lsda_with_handlers(handlers: Vec<ScopeHandler>, type_table: Vec<u64>) -> Lsda {
		Lsda {
			call_sites: vec![CallSite { start: 0, length: 0x20, landing_pad: 0x80, action_offset: 1 }],
			actions: vec![Action { entry_offset: 1, type_filter: 1, next_offset: 0, next_index: -1 }],
			type_table,
			scopes: vec![Scope { start: 0, end: 0x20, handlers }],
		}
	}

	fn catch_handler(type_index: i64) -> ScopeHandler {
		ScopeHandler { kind: HandlerKind::Catch, type_index, landing_pad: 0x80 }
	}

	#[test]
	fn exact_address_match_finds_the_handler() {
		let symbols = fixture_symbols();
		let scanner = ThrowScanner::new(&symbols, text_section(fixture_text()));
		// Index 1 resolves to the last type table entry.
		let lsda = lsda_with_handlers(vec![catch_handler(1)], vec![TYPEINFO_INT]);
		let mut correlator = Correlator::new(&scanner);
		correlator.load_lsda(&lsda);

		let matches = correlator.correlate("_Z5throwv").unwrap();
		assert_eq!(matches.len(), 1);
		assert_eq!(matches[0].thrown.value, TYPEINFO_INT);
		assert_eq!(matches[0].handlers.len(), 1);
		assert_eq!(matches[0].handlers[0].kind, HandlerKind::Catch);
	}

	#[test]
	fn mismatched_catch_types_do_not_match() {
		let symbols = fixture_symbols();
		let scanner = ThrowScanner::new(&symbols, text_section(fixture_text()));
		let lsda = lsda_with_handlers(vec![catch_handler(1)], vec![TYPEINFO_DOUBLE]);
		let mut correlator = Correlator::new(&scanner);
		correlator.load_lsda(&lsda);

		assert_eq!(
			correlator.correlate("_Z5throwv").unwrap_err(),
			CorrelateError::NoCatchRecords
		);
	}

	#[test]
	fn cleanups_match_any_thrown_type() {
		let symbols = fixture_symbols();
		let scanner = ThrowScanner::new(&symbols, text_section(fixture_text()));
		let cleanup = ScopeHandler { kind: HandlerKind::Cleanup, type_index: 0, landing_pad: 0x80 };
		let lsda = lsda_with_handlers(vec![cleanup], vec![]);
		let mut correlator = Correlator::new(&scanner);
		correlator.load_lsda(&lsda);

		let matches = correlator.correlate("_Z5throwv").unwrap();
		assert_eq!(matches[0].handlers.len(), 1);
		assert_eq!(matches[0].handlers[0].kind, HandlerKind::Cleanup);
	}

	#[test]
	fn filters_are_skipped() {
		let symbols = fixture_symbols();
		let scanner = ThrowScanner::new(&symbols, text_section(fixture_text()));
		let filter = ScopeHandler { kind: HandlerKind::Filter, type_index: -1, landing_pad: 0x80 };
		let lsda = lsda_with_handlers(vec![filter, catch_handler(1)], vec![TYPEINFO_INT]);
		let mut correlator = Correlator::new(&scanner);
		correlator.load_lsda(&lsda);

		let matches = correlator.correlate("_Z5throwv").unwrap();
		assert_eq!(matches[0].handlers.len(), 1);
		assert_eq!(matches[0].handlers[0].kind, HandlerKind::Catch);
	}

	#[test]
	fn unresolvable_catch_index_is_an_error() {
		let symbols = fixture_symbols();
		let scanner = ThrowScanner::new(&symbols, text_section(fixture_text()));
		let lsda = lsda_with_handlers(vec![catch_handler(5)], vec![TYPEINFO_INT]);
		let mut correlator = Correlator::new(&scanner);
		correlator.load_lsda(&lsda);

		assert_eq!(
			correlator.correlate("_Z5throwv").unwrap_err(),
			CorrelateError::TypeResolveFailed
		);
	}

	#[test]
	fn typed_outcomes_for_missing_inputs() {
		let symbols = fixture_symbols();
		let scanner = ThrowScanner::new(&symbols, text_section(fixture_text()));
		let correlator = Correlator::new(&scanner);
		assert_eq!(
			correlator.correlate("_Z5throwv").unwrap_err(),
			CorrelateError::LsdaNotLoaded
		);

		let lsda = lsda_with_handlers(vec![catch_handler(1)], vec![TYPEINFO_INT]);
		let mut correlator = Correlator::new(&scanner);
		correlator.load_lsda(&lsda);
		assert_eq!(
			correlator.correlate("_Z7unknownv").unwrap_err(),
			CorrelateError::NoTypeinfoForFunction
		);
		assert_eq!(
			correlator.correlate("_Z5quietv").unwrap_err(),
			CorrelateError::NoThrownTypes
		);
	}

	#[test]
	fn flattening_preserves_scope_order() {
		let lsda = Lsda {
			call_sites: vec![],
			actions: vec![],
			type_table: vec![TYPEINFO_INT],
			scopes: vec![
				Scope {
					start: 0,
					end: 0x10,
					handlers: vec![catch_handler(1)],
				},
				Scope {
					start: 0x10,
					end: 0x20,
					handlers: vec![
						ScopeHandler { kind: HandlerKind::Cleanup, type_index: 0, landing_pad: 0x90 },
						catch_handler(1),
					],
				},
			],
		};
		let records = flatten_scopes(&lsda);
		assert_eq!(records.len(), 3);
		assert_eq!(records[0].scope_id, 0);
		assert_eq!(records[1].scope_id, 1);
		assert_eq!(records[1].kind, HandlerKind::Cleanup);
		assert_eq!((records[2].range_begin, records[2].range_end), (0x10, 0x20));
	}
}
