use std::fmt::{Display, Formatter};
use std::io::Cursor;

use tracing::{debug, warn};

use crate::utilities::FromByteStream;

pub mod encoding;

use encoding::{read_encoded, read_sleb128, read_uleb128, DW_EH_PE_OMIT};

#[derive(Debug)]
pub enum LsdaError {
	Decode(std::io::Error),
	CallSiteTableOverrun,
	CallSiteTableMisaligned,
	ActionsStartPastTypeTable,
	ActionTableOverrun,
	OddActionTable,
	MissingAction(i64),
}

impl From<std::io::Error> for LsdaError {
	fn from(value: std::io::Error) -> Self {
		Self::Decode(value)
	}
}

/// One protected PC range. A zero `action_offset` means the landing pad only
/// propagates (no handler chain).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CallSite {
	pub start: u64,
	pub length: u64,
	pub landing_pad: u64,
	pub action_offset: i64,
}

/// One record of the action table. `entry_offset` is the byte offset of the
/// record from the start of the action table and serves as its identity.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Action {
	pub entry_offset: i64,
	pub type_filter: i64,
	pub next_offset: i64,
	/// Index of the successor in the action vector, `-1` when the chain ends
	/// here or the successor lies outside the table.
	pub next_index: i64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandlerKind {
	Catch,
	Cleanup,
	Filter,
}

impl HandlerKind {
	fn classify(type_filter: i64) -> Self {
		match type_filter {
			0 => Self::Cleanup,
			f if f > 0 => Self::Catch,
			_ => Self::Filter,
		}
	}
}

impl Display for HandlerKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Catch => write!(f, "Catch"),
			Self::Cleanup => write!(f, "Cleanup"),
			Self::Filter => write!(f, "Filter"),
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ScopeHandler {
	pub kind: HandlerKind,
	pub type_index: i64,
	pub landing_pad: u64,
}

/// A call site with a landing pad, together with the handlers reached by
/// walking its action chain.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Scope {
	pub start: u64,
	pub end: u64,
	pub handlers: Vec<ScopeHandler>,
}

/// A decoded Language-Specific Data Area.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Lsda {
	pub call_sites: Vec<CallSite>,
	pub actions: Vec<Action>,
	pub type_table: Vec<u64>,
	pub scopes: Vec<Scope>,
}

impl Lsda {
	pub fn parse(data: &[u8]) -> Result<Self, LsdaError> {
		let mut stream = Cursor::new(data);
		let len = data.len() as u64;

		// Header: an optional landing-pad base we do not use, then the type
		// table offset relative to the position right after it.
		let start_encoding = u8::read(&mut stream, &())?;
		if start_encoding != DW_EH_PE_OMIT {
			let _ = read_encoded(&mut stream, start_encoding)?;
		}
		let type_table_encoding = u8::read(&mut stream, &())?;
		let type_table_start = match type_table_encoding {
			DW_EH_PE_OMIT => len,
			_ => {
				let offset = read_uleb128(&mut stream)?;
				stream.position() + offset
			}
		};

		let call_sites = Self::parse_call_sites(&mut stream, len)?;
		let (actions, action_table_start) =
			Self::parse_actions(&mut stream, type_table_start.min(len))?;
		let actions = Self::resolve_action_links(actions);

		let mut type_table = Vec::new();
		if type_table_encoding != DW_EH_PE_OMIT && type_table_start <= len {
			stream.set_position(type_table_start);
			while stream.position() < len {
				type_table.push(read_encoded(&mut stream, type_table_encoding)?);
			}
		}

		let scopes = Self::build_scopes(&call_sites, &actions)?;
		debug!(
			call_sites = call_sites.len(),
			actions = actions.len(),
			types = type_table.len(),
			scopes = scopes.len(),
			table_start = action_table_start,
			"decoded LSDA"
		);

		Ok(Self { call_sites, actions, type_table, scopes })
	}

	fn parse_call_sites(stream: &mut Cursor<&[u8]>, len: u64) -> Result<Vec<CallSite>, LsdaError> {
		let call_site_encoding = u8::read(stream, &())?;
		let table_length = read_uleb128(stream)?;
		let end = stream.position() + table_length;
		if end > len {
			return Err(LsdaError::CallSiteTableOverrun);
		}

		let mut call_sites = Vec::new();
		while stream.position() < end {
			call_sites.push(CallSite {
				start: read_encoded(stream, call_site_encoding)?,
				length: read_encoded(stream, call_site_encoding)?,
				landing_pad: read_encoded(stream, call_site_encoding)?,
				action_offset: read_sleb128(stream)?,
			});
		}
		if stream.position() != end {
			return Err(LsdaError::CallSiteTableMisaligned);
		}
		Ok(call_sites)
	}

	/// Reads `(type_filter, next_offset)` pairs up to `limit`. Returns the
	/// actions and the byte position the table started at.
	fn parse_actions(
		stream: &mut Cursor<&[u8]>,
		limit: u64,
	) -> Result<(Vec<Action>, u64), LsdaError> {
		let table_start = stream.position();
		if table_start > limit {
			return Err(LsdaError::ActionsStartPastTypeTable);
		}

		let mut actions = Vec::new();
		while stream.position() < limit {
			let entry_offset = (stream.position() - table_start) as i64;
			let type_filter = read_sleb128(stream)?;
			if stream.position() > limit {
				return Err(LsdaError::ActionTableOverrun);
			}
			if stream.position() == limit {
				return Err(LsdaError::OddActionTable);
			}
			let next_offset = read_sleb128(stream)?;
			if stream.position() > limit {
				return Err(LsdaError::ActionTableOverrun);
			}
			actions.push(Action { entry_offset, type_filter, next_offset, next_index: -1 });
		}
		Ok((actions, table_start))
	}

	/// Turns the relative `next_offset` links into vector indices. A link that
	/// leaves the table is truncated, not rejected; stripped and shared tails
	/// produce these.
	fn resolve_action_links(mut actions: Vec<Action>) -> Vec<Action> {
		let offsets: Vec<i64> = actions.iter().map(|a| a.entry_offset).collect();
		for action in &mut actions {
			if action.next_offset == 0 {
				action.next_index = -1;
				continue;
			}
			let target = action.entry_offset + action.next_offset;
			match offsets.iter().position(|offset| *offset == target) {
				Some(index) => action.next_index = index as i64,
				None => {
					warn!(
						entry_offset = action.entry_offset,
						target, "action chain leaves the table; truncating"
					);
					action.next_index = -1;
				}
			}
		}
		actions
	}

	fn build_scopes(call_sites: &[CallSite], actions: &[Action]) -> Result<Vec<Scope>, LsdaError> {
		let mut scopes = Vec::new();
		for call_site in call_sites {
			if call_site.landing_pad == 0 || call_site.action_offset == 0 {
				continue;
			}
			let Some(first) = actions
				.iter()
				.position(|a| a.entry_offset == call_site.action_offset)
			else {
				return Err(LsdaError::MissingAction(call_site.action_offset));
			};

			let mut handlers = Vec::new();
			let mut current = first;
			// The walk is bounded by the table size; a malformed cycle would
			// otherwise never terminate.
			for _ in 0..actions.len() {
				let action = &actions[current];
				handlers.push(ScopeHandler {
					kind: HandlerKind::classify(action.type_filter),
					type_index: action.type_filter,
					landing_pad: call_site.landing_pad,
				});
				if action.next_index < 0 {
					break;
				}
				current = action.next_index as usize;
			}

			scopes.push(Scope {
				start: call_site.start,
				end: call_site.start + call_site.length,
				handlers,
			});
		}
		Ok(scopes)
	}

	/// Resolves a one-based handler type index against the type table.
	///
	/// Indices count from the end of the table: index 1 names the last entry
	/// in file order. Non-positive and out-of-range indices resolve to none.
	pub fn resolve_type(&self, type_index: i64) -> Option<u64> {
		if type_index <= 0 {
			return None;
		}
		let count = self.type_table.len() as i64;
		if type_index > count {
			return None;
		}
		Some(self.type_table[(count - type_index) as usize])
	}
}
