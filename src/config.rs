use crate::types::AE;
use dicom::core::Tag;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub logging: LoggingConfig,
	pub files: FileConfig,
	pub dicom: DicomConfig,
	pub server: ServerConfig,
}

impl AppConfig {
	/// Loads the configuration from the embedded defaults, an optional TOML
	/// file and the environment. Environment variables use a `WAD_FORWARD_`
	/// prefix and a double underscore between key segments, e.g.
	/// `WAD_FORWARD_FILES__SOURCE_DIR`.
	///
	/// # Errors
	/// Returns a [`config::ConfigError`] if a source cannot be read or a
	/// required key is missing or malformed.
	pub fn new(config_file: Option<&Path>) -> Result<Self, config::ConfigError> {
		Self::with_overrides(config_file, std::iter::empty())
	}

	/// Like [`AppConfig::new`], but applies the given key/value overrides on
	/// top of all other sources. Overrides with a `None` value are ignored,
	/// so optional command line flags can be passed through directly.
	pub fn with_overrides<'a>(
		config_file: Option<&Path>,
		overrides: impl IntoIterator<Item = (&'a str, Option<String>)>,
	) -> Result<Self, config::ConfigError> {
		use config::Config;
		let mut builder = Config::builder().add_source(config::File::from_str(
			include_str!("defaults.toml"),
			config::FileFormat::Toml,
		));
		builder = match config_file {
			Some(path) => builder.add_source(config::File::from(path.to_path_buf())),
			None => builder.add_source(config::File::with_name("config.toml").required(false)),
		};
		// A single underscore cannot separate segments here: keys like
		// `source_dir` contain one themselves.
		builder = builder.add_source(
			config::Environment::with_prefix("WAD_FORWARD")
				.prefix_separator("_")
				.separator("__"),
		);
		for (key, value) in overrides {
			builder = builder.set_override_option(key, value)?;
		}

		builder.build()?.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
	// Configurable logging level. Also configurable via env vars RUST_LOG and WAD_FORWARD_LOGGING__LEVEL
	pub level: String,
}

/// File discovery rules for the intake loop.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
	/// The directory that is scanned for QA report files.
	pub source_dir: PathBuf,
	/// Only file names ending with this extension are considered.
	pub extension: String,
	/// A file name must contain at least one of these substrings.
	/// An empty list matches nothing.
	pub contains: Vec<String>,
	/// A file name must contain none of these substrings.
	pub not_contains: Vec<String>,
	/// The directory holding the processed-files record.
	pub processed_dir: PathBuf,
}

/// Descriptive attributes written into every generated DICOM object.
#[derive(Debug, Clone, Deserialize)]
pub struct DicomConfig {
	pub station_name: String,
	pub patient_id: String,
	pub patient_name: String,
	pub study_description: String,
	pub series_description: String,
	/// The private tag that carries the report payload, as "gggg,eeee" in hex.
	pub private_tag: String,
}

impl DicomConfig {
	/// # Errors
	/// Returns a [`config::ConfigError`] if the configured private tag is not
	/// a valid "gggg,eeee" hex pair.
	pub fn private_tag(&self) -> Result<Tag, config::ConfigError> {
		parse_tag(&self.private_tag).ok_or_else(|| {
			config::ConfigError::Message(format!(
				"invalid private tag '{}', expected \"gggg,eeee\" in hex",
				self.private_tag
			))
		})
	}
}

/// Connection parameters for the remote DICOM node.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub calling_aet: AE,
	pub called_aet: AE,
	pub host: String,
	pub port: u16,
}

impl ServerConfig {
	pub fn address(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

fn parse_tag(value: &str) -> Option<Tag> {
	let (group, element) = value.split_once(',')?;
	let group = u16::from_str_radix(group.trim().trim_start_matches("0x"), 16).ok()?;
	let element = u16::from_str_radix(element.trim().trim_start_matches("0x"), 16).ok()?;
	Some(Tag(group, element))
}
