use std::collections::VecDeque;
use std::path::Path;

use fxhash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

#[derive(Debug)]
pub enum CallGraphError {
	Io(std::io::Error),
}

impl From<std::io::Error> for CallGraphError {
	fn from(value: std::io::Error) -> Self {
		Self::Io(value)
	}
}

/// A directed edge endpoint: the referenced node id plus the parenthesized
/// attribute tags the dump attached to it (for example `inlined`).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Edge {
	pub node: u64,
	pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Node {
	pub id: u64,
	pub fn_name: String,
	pub demangled_name: String,
	pub visibility: String,
	pub availability: String,
	pub flags: String,
	pub callers: Vec<Edge>,
	pub callees: Vec<Edge>,
}

/// The function graph recovered from a whole-program-analysis dump.
///
/// Node identity is the numeric id the compiler assigned; two nodes may share
/// a name and stay distinct.
#[derive(Debug, Default)]
pub struct CallGraph {
	nodes: FxHashMap<u64, Node>,
	throw_callers: Vec<u64>,
}

impl CallGraph {
	pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CallGraphError> {
		let text = std::fs::read_to_string(path.as_ref())?;
		Ok(Self::parse(&text))
	}

	pub fn parse(text: &str) -> Self {
		let entries = parse_symbol_table(text);
		Self::build(entries)
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub fn node(&self, id: u64) -> Option<&Node> {
		self.nodes.get(&id)
	}

	/// Linear scan; ids are the primary key.
	pub fn node_by_name(&self, name: &str) -> Option<&Node> {
		self.nodes.values().find(|node| node.fn_name == name)
	}

	pub fn nodes(&self) -> impl Iterator<Item = &Node> {
		self.nodes.values()
	}

	/// Ids of the functions observed calling `__cxa_throw`.
	pub fn throw_callers(&self) -> &[u64] {
		&self.throw_callers
	}

	/// Depth-first walk over callees. Cycles are cut with a visited set.
	pub fn dfs(&self, start: u64) -> Vec<&Node> {
		let mut stack = vec![start];
		let mut visited = FxHashSet::default();
		let mut order = Vec::new();

		while let Some(id) = stack.pop() {
			if !visited.insert(id) {
				continue;
			}
			let Some(node) = self.nodes.get(&id) else { continue };
			order.push(node);
			for edge in &node.callees {
				stack.push(edge.node);
			}
		}
		order
	}

	/// Breadth-first walk over callees with per-node visit bound
	/// `max_visits`, so cyclic graphs terminate.
	pub fn bfs(&self, start: u64, max_visits: usize) -> Vec<(&Node, usize)> {
		let mut queue = VecDeque::from([(start, 0usize)]);
		let mut visit_count: FxHashMap<u64, usize> = FxHashMap::default();
		let mut order = Vec::new();

		while let Some((id, depth)) = queue.pop_front() {
			let count = visit_count.entry(id).or_insert(0);
			if *count >= max_visits {
				continue;
			}
			*count += 1;

			let Some(node) = self.nodes.get(&id) else { continue };
			order.push((node, depth));
			for edge in &node.callees {
				queue.push_back((edge.node, depth + 1));
			}
		}
		order
	}

	fn build(entries: Vec<RawEntry>) -> Self {
		let mut graph = Self::default();

		for entry in &entries {
			let Some(id) = entry.id else {
				warn!(name = %entry.fn_name, "entry without a numeric id dropped");
				continue;
			};
			let node = Node {
				id,
				fn_name: entry.fn_name.clone(),
				demangled_name: entry.demangled_name.clone(),
				visibility: entry.property("visibility"),
				availability: entry.property("availability"),
				flags: entry.property("function_flags"),
				callers: Vec::new(),
				callees: Vec::new(),
			};
			graph.nodes.entry(id).or_insert(node);
		}

		let throw_id = graph
			.node_by_name("__cxa_throw")
			.map(|node| node.id);

		for entry in &entries {
			let Some(id) = entry.id else { continue };
			let callers = parse_fn_list(&entry.property("called_by"));
			let callees = parse_fn_list(&entry.property("calls"));

			for (target, attributes) in callers {
				if !graph.nodes.contains_key(&target) {
					warn!(caller = target, of = id, "caller refers to an unknown node; dropped");
					continue;
				}
				if let Some(node) = graph.nodes.get_mut(&id) {
					node.callers.push(Edge { node: target, attributes });
				}
			}

			for (target, attributes) in callees {
				if !graph.nodes.contains_key(&target) {
					warn!(callee = target, of = id, "callee refers to an unknown node; dropped");
					continue;
				}
				if Some(target) == throw_id && !graph.throw_callers.contains(&id) {
					graph.throw_callers.push(id);
				}
				if let Some(node) = graph.nodes.get_mut(&id) {
					node.callees.push(Edge { node: target, attributes });
				}
			}
		}

		debug!(
			nodes = graph.nodes.len(),
			throw_callers = graph.throw_callers.len(),
			"call graph built"
		);
		graph
	}
}

#[derive(Debug, Default)]
struct RawEntry {
	fn_name: String,
	id: Option<u64>,
	demangled_name: String,
	properties: FxHashMap<String, String>,
}

impl RawEntry {
	fn property(&self, key: &str) -> String {
		self.properties.get(key).cloned().unwrap_or_default()
	}
}

/// Splits the dump into entries: a header line at column zero followed by
/// indented `key : value` lines. Entries whose `Type` value is not a function
/// and personality routines are dropped.
fn parse_symbol_table(text: &str) -> Vec<RawEntry> {
	// Everything before the marker is preamble.
	let mut lines = text.lines().skip_while(|line| line.trim_end() != "Symbol table:");
	if lines.next().is_none() {
		warn!("dump has no `Symbol table:` marker");
		return Vec::new();
	}

	let mut entries = Vec::new();
	let mut current: Option<RawEntry> = None;
	let mut is_function = true;

	let mut flush = |entry: Option<RawEntry>, is_function: bool| {
		if let Some(entry) = entry {
			if is_function && !entry.fn_name.starts_with("__gxx_personality") {
				entries.push(entry);
			}
		}
	};

	for line in lines {
		if line.trim().is_empty() {
			continue;
		}

		let starts_entry = !line.starts_with(char::is_whitespace);
		if starts_entry {
			flush(current.take(), is_function);
			is_function = true;
			current = Some(parse_header_line(line.trim()));
			continue;
		}

		let Some(entry) = current.as_mut() else { continue };
		let trimmed = line.trim();
		if let Some((key, value)) = trimmed.split_once(':') {
			let key = key.trim().to_lowercase().replace(' ', "_");
			let value = value.trim().to_string();
			if key == "type" && !value.split_whitespace().any(|word| word == "function") {
				is_function = false;
			}
			entry.properties.insert(key, value);
		}
	}
	flush(current.take(), is_function);

	entries
}

/// Header lines look like `<name>/<id> (<demangled>) @address ...`.
fn parse_header_line(line: &str) -> RawEntry {
	let token = line.split_whitespace().next().unwrap_or("");
	let (fn_name, id) = match token.rsplit_once('/') {
		Some((name, id)) => (name.to_string(), id.parse().ok()),
		None => (token.to_string(), None),
	};

	let demangled_name = match (line.find('('), line.rfind(')')) {
		(Some(open), Some(close)) if open < close => line[open + 1..close].to_string(),
		_ => String::new(),
	};

	RawEntry { fn_name, id, demangled_name, properties: FxHashMap::default() }
}

/// Tokenizes a `called_by`/`calls` value. Plain tokens are `<name>/<id>`
/// references; a parenthesized group attaches to the token before it.
fn parse_fn_list(value: &str) -> Vec<(u64, Vec<String>)> {
	let mut tokens: Vec<String> = Vec::new();
	let mut buf = String::new();
	let mut in_attribute = false;

	for c in value.chars() {
		match c {
			'(' if !in_attribute && buf.is_empty() => {
				in_attribute = true;
				buf.push(c);
			}
			')' if in_attribute => {
				buf.push(c);
				tokens.push(std::mem::take(&mut buf));
				in_attribute = false;
			}
			c if c.is_whitespace() && !in_attribute => {
				if !buf.is_empty() {
					tokens.push(std::mem::take(&mut buf));
				}
			}
			_ => buf.push(c),
		}
	}
	if !buf.is_empty() {
		tokens.push(buf);
	}

	let mut list: Vec<(u64, Vec<String>)> = Vec::new();
	for token in tokens {
		if token.starts_with('(') && token.ends_with(')') {
			match list.last_mut() {
				Some((_, attributes)) => {
					attributes.push(token[1..token.len() - 1].to_string());
				}
				None => warn!(token = %token, "attribute group without a preceding reference"),
			}
			continue;
		}

		let Some((_, id)) = token.rsplit_once('/') else {
			warn!(token = %token, "reference without an id; dropped");
			continue;
		};
		match id.trim().parse() {
			Ok(id) => list.push((id, Vec::new())),
			Err(_) => warn!(token = %token, "reference with a non-numeric id; dropped"),
		}
	}
	list
}
