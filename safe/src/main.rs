use std::process::ExitCode;

use tracing::Level;

use safe::pipeline::{self, Options};

fn setup_subscriber(options: &Options) {
	let level = match options.verbose {
		true => Level::DEBUG,
		false => Level::WARN,
	};
	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_writer(std::io::stderr)
		.without_time()
		.init();
}

fn main() -> ExitCode {
	let args: Vec<String> = std::env::args().collect();
	let options = match pipeline::parse_args(&args) {
		Ok(options) => options,
		Err(error) => {
			eprintln!("Error: {error}");
			return ExitCode::from(error.exit_code());
		}
	};

	setup_subscriber(&options);

	match pipeline::run(&options) {
		Ok(()) => ExitCode::SUCCESS,
		Err(error) => {
			eprintln!("Error: {error}");
			ExitCode::from(error.exit_code())
		}
	}
}
