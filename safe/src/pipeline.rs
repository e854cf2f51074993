use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::callgraph::{CallGraph, CallGraphError};
use crate::correlate::{CatchRecord, CorrelateError, Correlator, ThrowCatchMatch};
use crate::elf::{ElfError, ElfFile, Symbol};
use crate::lsda::{Lsda, LsdaError};
use crate::rtti::{demangle, ThrowScanner};

/// Suffix of the companion whole-program dump next to the binary.
const CALL_GRAPH_SUFFIX: &str = "whole-program";

#[derive(Debug)]
pub enum SafeError {
	InvalidArgAmount,
	InvalidFlag(String),
	FileNotFound(PathBuf),
	Elf(ElfError),
	Lsda(LsdaError),
	CallGraph(CallGraphError),
	Io(std::io::Error),
}

impl SafeError {
	/// Usage mistakes exit with 2; everything else with 1.
	pub fn exit_code(&self) -> u8 {
		match self {
			Self::InvalidArgAmount | Self::InvalidFlag(_) => 2,
			_ => 1,
		}
	}
}

impl Display for SafeError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::InvalidArgAmount => write!(f, "invalid argument amount (usage: safe [-v] <binary>)"),
			Self::InvalidFlag(flag) => write!(f, "invalid flag: {flag}"),
			Self::FileNotFound(path) => write!(f, "file not found: {}", path.display()),
			Self::Elf(error) => write!(f, "object reader failed: {error:?}"),
			Self::Lsda(error) => write!(f, "LSDA decoding failed: {error:?}"),
			Self::CallGraph(error) => write!(f, "call-graph parsing failed: {error:?}"),
			Self::Io(error) => write!(f, "i/o failure: {error}"),
		}
	}
}

impl From<ElfError> for SafeError {
	fn from(value: ElfError) -> Self {
		Self::Elf(value)
	}
}

impl From<LsdaError> for SafeError {
	fn from(value: LsdaError) -> Self {
		Self::Lsda(value)
	}
}

impl From<CallGraphError> for SafeError {
	fn from(value: CallGraphError) -> Self {
		Self::CallGraph(value)
	}
}

impl From<std::io::Error> for SafeError {
	fn from(value: std::io::Error) -> Self {
		Self::Io(value)
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Options {
	pub binary: PathBuf,
	pub verbose: bool,
}

/// Validates `argv`: `safe [-v] <binary>`.
pub fn parse_args(args: &[String]) -> Result<Options, SafeError> {
	let (flag, path) = match args {
		[_, path] => (None, path),
		[_, flag, path] => (Some(flag.as_str()), path),
		_ => return Err(SafeError::InvalidArgAmount),
	};

	if let Some(flag) = flag {
		if flag != "-v" {
			return Err(SafeError::InvalidFlag(flag.to_string()));
		}
	}

	let binary = PathBuf::from(path);
	if !binary.exists() {
		return Err(SafeError::FileNotFound(binary));
	}

	Ok(Options { binary, verbose: flag.is_some() })
}

/// Runs the whole analysis and writes the report to stdout.
pub fn run(options: &Options) -> Result<(), SafeError> {
	let stdout = std::io::stdout();
	let mut out = stdout.lock();
	run_with_output(options, &mut out)
}

pub fn run_with_output(options: &Options, out: &mut impl Write) -> Result<(), SafeError> {
	info!(binary = %options.binary.display(), "loading object");
	let elf = ElfFile::open(&options.binary)?;

	let except_table = elf.section(".gcc_except_table")?.clone();
	let text = elf.section(".text")?.clone();
	let symbols = elf.symbol_table()?;

	let lsda = Lsda::parse(&except_table.data)?;
	let graph = load_call_graph(&options.binary)?;

	let scanner = ThrowScanner::new(symbols, text);
	check_rtti_addresses(&elf, &scanner);

	let mut correlator = Correlator::new(&scanner);
	correlator.load_lsda(&lsda);

	let focus = focus_functions(graph.as_ref(), symbols);
	info!(functions = focus.len(), "correlating");

	for function in &focus {
		let result = correlator.correlate(function);
		write_report(out, function, &result)?;
		if options.verbose {
			if let Some(graph) = graph.as_ref() {
				write_call_graph_context(out, graph, function)?;
			}
		}
	}

	if options.verbose {
		write_lsda_tables(out, &lsda)?;
		write_catch_records(out, correlator.records())?;
		write_debug_logs(&scanner, &focus, &options.binary);
	}

	Ok(())
}

/// Every index entry should point into a loaded section; an address outside
/// all of them is a scan false positive waiting to happen.
fn check_rtti_addresses(elf: &ElfFile, scanner: &ThrowScanner) {
	for (address, symbol) in scanner.rtti().iter() {
		if !elf.sections().any(|section| section.contains_address(*address)) {
			warn!(
				address = *address,
				symbol = %symbol.name,
				"typeinfo address lies outside every loaded section"
			);
		}
	}
}

/// The companion dump lives next to the binary with a `.whole-program`
/// suffix. Its absence only costs focus selection, so it is not fatal.
fn load_call_graph(binary: &Path) -> Result<Option<CallGraph>, SafeError> {
	let path = binary.with_extension(CALL_GRAPH_SUFFIX);
	if !path.exists() {
		warn!(path = %path.display(), "no whole-program dump next to the binary");
		return Ok(None);
	}
	let graph = CallGraph::from_path(&path)?;
	Ok(Some(graph))
}

/// Focus on functions the dump saw reaching `__cxa_throw`; without a dump,
/// fall back to every defined function symbol.
fn focus_functions(graph: Option<&CallGraph>, symbols: &[Symbol]) -> Vec<String> {
	let mut focus = Vec::new();
	match graph {
		Some(graph) if !graph.is_empty() => {
			for id in graph.throw_callers() {
				if let Some(node) = graph.node(*id) {
					if !focus.contains(&node.fn_name) {
						focus.push(node.fn_name.clone());
					}
				}
			}
		}
		_ => {
			for symbol in symbols {
				if symbol.is_function() && symbol.size > 0 && !symbol.name.is_empty() {
					let name = symbol.name.to_string();
					if !focus.contains(&name) {
						focus.push(name);
					}
				}
			}
		}
	}
	focus
}

fn write_report(
	out: &mut impl Write,
	function: &str,
	result: &Result<Vec<ThrowCatchMatch>, CorrelateError>,
) -> std::io::Result<()> {
	writeln!(out, "[SAFE] throw/catch correlation for function {function}:")?;

	let matches = match result {
		Ok(matches) => matches,
		Err(error) => {
			let text = match error {
				CorrelateError::NoTypeinfoForFunction => "no typeinfo found for this function",
				CorrelateError::NoThrownTypes => "function has no recorded throw types",
				CorrelateError::NoCatchRecords => "no LSDA catch records matched any thrown type",
				CorrelateError::TypeResolveFailed => "failed to resolve at least one LSDA type index",
				CorrelateError::LsdaNotLoaded => "no LSDA loaded",
			};
			return writeln!(out, "  ({text})");
		}
	};

	for matched in matches {
		let demangled = demangle(&matched.thrown.name).unwrap_or_default();
		writeln!(
			out,
			"  Thrown RTTI symbol: {} @ {:#X} ({demangled})",
			matched.thrown.name, matched.thrown.value
		)?;
		if matched.handlers.is_empty() {
			writeln!(out, "    no matching catch handlers in LSDA")?;
			continue;
		}
		writeln!(out, "    handled by {} catch handler(s):", matched.handlers.len())?;
		for record in &matched.handlers {
			writeln!(
				out,
				"      - scope[{}] ({}) range {:#X}-{:#X}, landing_pad {:#X}, type_index {}",
				record.scope_id,
				record.kind,
				record.range_begin,
				record.range_end,
				record.landing_pad,
				record.type_index
			)?;
		}
	}
	Ok(())
}

/// The dump's view of one focus function: who calls it and what it calls,
/// with the edge attributes the compiler recorded.
fn write_call_graph_context(
	out: &mut impl Write,
	graph: &CallGraph,
	function: &str,
) -> std::io::Result<()> {
	let Some(node) = graph.node_by_name(function) else {
		return Ok(());
	};

	let describe = |edges: &[crate::callgraph::Edge]| -> Vec<String> {
		edges
			.iter()
			.map(|edge| {
				let name = graph
					.node(edge.node)
					.map(|n| n.fn_name.clone())
					.unwrap_or_else(|| format!("<{}>", edge.node));
				match edge.attributes.is_empty() {
					true => name,
					false => format!("{name} ({})", edge.attributes.join(", ")),
				}
			})
			.collect()
	};

	writeln!(out, "  call graph: node {} [{}]", node.id, node.availability)?;
	writeln!(out, "    called by: {}", describe(&node.callers).join(", "))?;
	writeln!(out, "    calls:     {}", describe(&node.callees).join(", "))?;
	Ok(())
}

fn write_lsda_tables(out: &mut impl Write, lsda: &Lsda) -> std::io::Result<()> {
	writeln!(out, "\n[Call Site Table]")?;
	for call_site in &lsda.call_sites {
		writeln!(
			out,
			"Start: {:#X}, Length: {:#X}, LandingPad: {:#X}, Action: {}",
			call_site.start, call_site.length, call_site.landing_pad, call_site.action_offset
		)?;
	}
	writeln!(out, "\n[Action Table]")?;
	for action in &lsda.actions {
		writeln!(
			out,
			"Offset: {}, Type: {}, Next: {}, NextIndex: {}",
			action.entry_offset, action.type_filter, action.next_offset, action.next_index
		)?;
	}
	Ok(())
}

fn write_catch_records(out: &mut impl Write, records: &[CatchRecord]) -> std::io::Result<()> {
	writeln!(out, "\n[Catch Handler Table]")?;
	for (index, record) in records.iter().enumerate() {
		writeln!(
			out,
			"  [{index}] Scope: scope[{}], Kind: {}, Range: {:#X} - {:#X}, LandingPad: {:#X}, TypeIndex: {}",
			record.scope_id,
			record.kind,
			record.range_begin,
			record.range_end,
			record.landing_pad,
			record.type_index
		)?;
	}
	Ok(())
}

/// Best-effort debug dumps under `logs/` next to the binary; failures only warn.
fn write_debug_logs(scanner: &ThrowScanner, focus: &[String], binary: &Path) {
	let logs = binary.parent().unwrap_or(Path::new(".")).join("logs");
	if let Err(error) = try_write_debug_logs(scanner, focus, &logs) {
		warn!(dir = %logs.display(), "could not write debug logs: {error}");
	}
}

fn try_write_debug_logs(scanner: &ThrowScanner, focus: &[String], logs: &Path) -> std::io::Result<()> {
	std::fs::create_dir_all(logs)?;

	let mut rtti_log = File::create(logs.join("RTTI_typeinfo.txt"))?;
	scanner.rtti().write_table(&mut rtti_log)?;

	let mut scan_log = File::create(logs.join("function_binary.txt"))?;
	for function in focus {
		scanner.write_scan_trace(function, &mut scan_log)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn args(values: &[&str]) -> Vec<String> {
		values.iter().map(|v| v.to_string()).collect()
	}

	#[test]
	fn seven_arguments_are_an_invalid_amount() {
		let argv = args(&["./safe", "-t", "./binary", "random", "more", "rawr", "67"]);
		assert!(matches!(parse_args(&argv), Err(SafeError::InvalidArgAmount)));
		assert!(matches!(parse_args(&args(&["./safe"])), Err(SafeError::InvalidArgAmount)));
	}

	#[test]
	fn unknown_flags_are_rejected() {
		let argv = args(&["./safe", "-t", "./binary"]);
		match parse_args(&argv) {
			Err(SafeError::InvalidFlag(flag)) => assert_eq!(flag, "-t"),
			other => panic!("expected InvalidFlag, got {other:?}"),
		}
	}

	#[test]
	fn missing_files_are_rejected() {
		let argv = args(&["./safe", "-v", "./no_such_file.elf"]);
		assert!(matches!(parse_args(&argv), Err(SafeError::FileNotFound(_))));
		let argv = args(&["./safe", "./no_such_file.elf"]);
		assert!(matches!(parse_args(&argv), Err(SafeError::FileNotFound(_))));
	}

	#[test]
	fn accepts_existing_paths_with_and_without_flag() {
		let path = std::env::temp_dir().join("safe_parse_args_fixture");
		std::fs::write(&path, b"stub").unwrap();
		let path_str = path.to_string_lossy().into_owned();

		let options = parse_args(&args(&["./safe", &path_str])).unwrap();
		assert!(!options.verbose);

		let options = parse_args(&args(&["./safe", "-v", &path_str])).unwrap();
		assert!(options.verbose);
		assert_eq!(options.binary, path);

		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn usage_errors_exit_with_two() {
		assert_eq!(SafeError::InvalidArgAmount.exit_code(), 2);
		assert_eq!(SafeError::InvalidFlag("-t".into()).exit_code(), 2);
		assert_eq!(SafeError::FileNotFound(PathBuf::from("x")).exit_code(), 1);
	}

	#[test]
	fn report_text_for_typed_outcomes() {
		let mut out = Vec::new();
		write_report(&mut out, "_Z3fooi", &Err(CorrelateError::NoThrownTypes)).unwrap();
		let text = String::from_utf8(out).unwrap();
		assert!(text.contains("_Z3fooi"));
		assert!(text.contains("no recorded throw types"));
	}
}
