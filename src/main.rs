use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, level_filters::LevelFilter, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use wad_forward::config::AppConfig;
use wad_forward::dimse::storescu::StoreServiceClassUser;
use wad_forward::intake::Intake;

/// Forwards QA report files to a DICOM archive node.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
	/// Read configuration from FILE
	#[arg(short, long, value_name = "FILE")]
	config: Option<PathBuf>,
	/// Read QA files from DIR
	#[arg(long, value_name = "DIR")]
	source: Option<PathBuf>,
	/// Store the processed-files record in DIR
	#[arg(short, long, value_name = "DIR")]
	processed: Option<PathBuf>,
	/// Use station name NAME
	#[arg(short = 's', long, value_name = "NAME")]
	station_name: Option<String>,
	/// Use file extension EXT
	#[arg(short, long, value_name = "EXT")]
	extension: Option<String>,
	/// Use patient ID
	#[arg(short = 'i', long, value_name = "ID")]
	patient_id: Option<String>,
	/// Use patient name NAME
	#[arg(short = 'n', long, value_name = "NAME")]
	patient_name: Option<String>,
	/// Only report errors
	#[arg(short, long)]
	quiet: bool,
}

impl Cli {
	fn overrides(&self) -> Vec<(&'static str, Option<String>)> {
		let display = |path: &PathBuf| path.display().to_string();
		vec![
			("files.source_dir", self.source.as_ref().map(display)),
			("files.processed_dir", self.processed.as_ref().map(display)),
			("files.extension", self.extension.clone()),
			("dicom.station_name", self.station_name.clone()),
			("dicom.patient_id", self.patient_id.clone()),
			("dicom.patient_name", self.patient_name.clone()),
		]
	}
}

fn init_logger(level: Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.init();
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	let config = match AppConfig::with_overrides(cli.config.as_deref(), cli.overrides()) {
		Ok(config) => config,
		Err(error) => {
			eprintln!("Invalid configuration: {error}");
			return ExitCode::FAILURE;
		}
	};

	let level = if cli.quiet {
		Level::ERROR
	} else {
		config.logging.level.parse().unwrap_or(Level::INFO)
	};
	init_logger(level);

	match run(cli.config.as_deref(), config) {
		Ok(()) => ExitCode::SUCCESS,
		Err(error) => {
			error!("Run aborted: {error:#}");
			ExitCode::FAILURE
		}
	}
}

fn run(config_file: Option<&Path>, config: AppConfig) -> anyhow::Result<()> {
	if let Some(path) = config_file {
		info!("Reading configuration from {}", path.display());
	}
	info!("Reading QA files from {}", config.files.source_dir.display());
	info!(
		"Sending to DICOM node {}@{}",
		config.server.called_aet,
		config.server.address()
	);

	let private_tag = config.dicom.private_tag()?;
	let storescu = StoreServiceClassUser::new(config.server);
	let intake = Intake::new(config.files, config.dicom, private_tag);

	let summary = intake.run(&storescu)?;
	info!(
		sent = summary.sent,
		failed = summary.failed,
		skipped = summary.skipped,
		"Run complete"
	);
	Ok(())
}
