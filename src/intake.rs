//! Discovers eligible QA report files, enforces idempotence through the
//! processed-set and drives one store exchange per file.
//!
//! The loop assumes single-instance execution: the processed-set is an
//! append-only file without locking, so two concurrent invocations over the
//! same store could transmit the same file twice.

use crate::config::{DicomConfig, FileConfig};
use crate::dimse::storescu::StoreService;
use crate::encode::{self, EncodedObject, InstanceIdentity, ObjectMetadata};
use dicom::core::value::{DicomDate, DicomTime};
use dicom::core::Tag;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Append-only record of absolute paths that were transmitted successfully.
///
/// One path per line, newline terminated. The file is never pruned or
/// rewritten: a present path means "transmission reported success", an
/// absent path means "try again", even after partial failures.
#[derive(Debug)]
pub struct ProcessedSet {
	path: PathBuf,
	entries: HashSet<PathBuf>,
}

impl ProcessedSet {
	pub const FILE_NAME: &'static str = "processed_files.txt";

	/// Loads the processed-set, creating an empty backing file if missing.
	///
	/// # Errors
	/// Returns an I/O error if the backing file cannot be created or read.
	pub fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
		let path = path.into();
		// Create the backing file on the first run.
		drop(OpenOptions::new().append(true).create(true).open(&path)?);

		let entries = fs::read_to_string(&path)?
			.lines()
			.map(str::trim)
			.filter(|line| !line.is_empty())
			.map(PathBuf::from)
			.collect();

		Ok(Self { path, entries })
	}

	pub fn contains(&self, path: &Path) -> bool {
		self.entries.contains(path)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Durably records one successful transmission. The backing file is
	/// opened, appended and closed per item, not batched, so that partial
	/// progress survives abrupt termination.
	///
	/// # Errors
	/// Returns an I/O error if the path cannot be appended to the backing file.
	pub fn commit(&mut self, path: &Path) -> std::io::Result<()> {
		let mut file = OpenOptions::new()
			.append(true)
			.create(true)
			.open(&self.path)?;
		writeln!(file, "{}", path.display())?;
		file.sync_all()?;

		self.entries.insert(path.to_path_buf());
		Ok(())
	}
}

/// The study timestamp embedded in a QA report path.
///
/// The second-to-last digit run in the path is the date in DDMMYYYY form,
/// the last is the time in HHMMSS form.
#[derive(Debug, Error)]
pub enum TimestampError {
	#[error("expected at least two digit runs in '{0}'")]
	MissingDigitRuns(String),
	#[error("'{0}' is not a valid DDMMYYYY date")]
	InvalidDate(String),
	#[error("'{0}' is not a valid HHMMSS time")]
	InvalidTime(String),
}

fn digit_runs(value: &str) -> Vec<&str> {
	let mut runs = Vec::new();
	let mut start = None;
	for (index, byte) in value.bytes().enumerate() {
		if byte.is_ascii_digit() {
			if start.is_none() {
				start = Some(index);
			}
		} else if let Some(run_start) = start.take() {
			runs.push(&value[run_start..index]);
		}
	}
	if let Some(run_start) = start {
		runs.push(&value[run_start..]);
	}
	runs
}

/// Extracts the study date and time from a path, returning them in DICOM
/// DA (YYYYMMDD) and TM (HHMMSS) form.
///
/// # Errors
/// Returns a [`TimestampError`] if the path holds fewer than two digit runs
/// or the runs do not parse as a valid date and time. A malformed name never
/// silently produces wrong timestamps.
pub fn extract_timestamps(path: &str) -> Result<(String, String), TimestampError> {
	let runs = digit_runs(path);
	let [.., date, time] = runs.as_slice() else {
		return Err(TimestampError::MissingDigitRuns(path.to_owned()));
	};

	Ok((parse_date(date)?, parse_time(time)?))
}

fn parse_date(value: &str) -> Result<String, TimestampError> {
	let invalid = || TimestampError::InvalidDate(value.to_owned());
	if value.len() != 8 {
		return Err(invalid());
	}
	let (day, month, year) = (&value[..2], &value[2..4], &value[4..]);
	DicomDate::from_ymd(
		year.parse().map_err(|_| invalid())?,
		month.parse().map_err(|_| invalid())?,
		day.parse().map_err(|_| invalid())?,
	)
	.map_err(|_| invalid())?;

	Ok(format!("{year}{month}{day}"))
}

fn parse_time(value: &str) -> Result<String, TimestampError> {
	let invalid = || TimestampError::InvalidTime(value.to_owned());
	if value.len() != 6 {
		return Err(invalid());
	}
	DicomTime::from_hms(
		value[..2].parse().map_err(|_| invalid())?,
		value[2..4].parse().map_err(|_| invalid())?,
		value[4..].parse().map_err(|_| invalid())?,
	)
	.map_err(|_| invalid())?;

	Ok(value.to_owned())
}

/// Keeps a file name if it ends with the configured extension, contains at
/// least one include substring and contains no exclude substring. An empty
/// include list matches nothing.
fn is_eligible(name: &str, files: &FileConfig) -> bool {
	if !name.ends_with(&files.extension) {
		return false;
	}
	if !files.contains.iter().any(|substr| name.contains(substr)) {
		return false;
	}
	!files
		.not_contains
		.iter()
		.any(|substr| name.contains(substr))
}

#[derive(Debug, Error)]
pub enum IntakeError {
	#[error(transparent)]
	Timestamp(#[from] TimestampError),
	#[error("I/O error for {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
	/// Files transmitted and recorded in the processed-set.
	pub sent: usize,
	/// Files whose store exchange failed; retried on the next run.
	pub failed: usize,
	/// Eligible files skipped because they were already processed.
	pub skipped: usize,
}

pub struct Intake {
	files: FileConfig,
	dicom: DicomConfig,
	private_tag: Tag,
}

impl Intake {
	pub const fn new(files: FileConfig, dicom: DicomConfig, private_tag: Tag) -> Self {
		Self {
			files,
			dicom,
			private_tag,
		}
	}

	/// Runs one intake pass over the source directory.
	///
	/// Per-file store failures are logged and the pass continues with the
	/// next file; the failed file stays out of the processed-set and is
	/// retried on the next run.
	///
	/// # Errors
	/// Returns an [`IntakeError`] for run-level failures: an unreadable
	/// source directory or file, an unwritable processed-set, or a file name
	/// without a parseable timestamp.
	pub fn run(&self, sender: &impl StoreService) -> Result<RunSummary, IntakeError> {
		let store_path = self.files.processed_dir.join(ProcessedSet::FILE_NAME);
		let mut processed = ProcessedSet::load(&store_path).map_err(|source| IntakeError::Io {
			path: store_path.clone(),
			source,
		})?;
		info!(
			entries = processed.len(),
			"Loaded processed-set from {}",
			store_path.display()
		);

		let mut summary = RunSummary::default();
		for path in self.discover(&mut summary, &processed)? {
			info!("Preparing QA DICOM object for {}", path.display());
			let object = self.prepare(&path)?;

			let outcome = sender.store(object);
			if outcome.is_delivered() {
				processed
					.commit(&path)
					.map_err(|source| IntakeError::Io {
						path: store_path.clone(),
						source,
					})?;
				info!("Recorded {} as processed", path.display());
				summary.sent += 1;
			} else {
				warn!(
					?outcome,
					"Failed to transmit {}; the file will be retried on the next run",
					path.display()
				);
				summary.failed += 1;
			}
		}

		Ok(summary)
	}

	/// Enumerates eligible, not yet processed files in discovery order.
	fn discover(
		&self,
		summary: &mut RunSummary,
		processed: &ProcessedSet,
	) -> Result<Vec<PathBuf>, IntakeError> {
		let source_dir = &self.files.source_dir;
		let io_error = |source| IntakeError::Io {
			path: source_dir.clone(),
			source,
		};

		let mut pending = Vec::new();
		for entry in fs::read_dir(source_dir).map_err(io_error)? {
			let entry = entry.map_err(io_error)?;
			let name = entry.file_name().to_string_lossy().into_owned();
			if !is_eligible(&name, &self.files) {
				debug!("{name} filtered out");
				continue;
			}

			let path = fs::canonicalize(entry.path()).map_err(|source| IntakeError::Io {
				path: entry.path(),
				source,
			})?;
			if processed.contains(&path) {
				debug!("{} already processed", path.display());
				summary.skipped += 1;
				continue;
			}
			pending.push(path);
		}

		info!(count = pending.len(), "Found eligible QA files");
		Ok(pending)
	}

	/// Reads one source file and wraps it into a transmission-ready object.
	fn prepare(&self, path: &Path) -> Result<EncodedObject, IntakeError> {
		let payload = fs::read(path).map_err(|source| IntakeError::Io {
			path: path.to_path_buf(),
			source,
		})?;

		let (study_date, study_time) = extract_timestamps(&path.to_string_lossy())?;
		let file_stem = path
			.file_stem()
			.map(|stem| stem.to_string_lossy().into_owned())
			.unwrap_or_default();
		let identity = InstanceIdentity::derive(&file_stem, &study_date, &study_time);

		let metadata = ObjectMetadata {
			patient_id: self.dicom.patient_id.clone(),
			patient_name: self.dicom.patient_name.clone(),
			study_description: self.dicom.study_description.clone(),
			// The series carries the report it was generated from.
			series_description: file_stem,
			station_name: self.dicom.station_name.clone(),
			study_date,
			study_time,
			identity,
		};

		Ok(encode::encode(self.private_tag, payload, &metadata))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn file_config(contains: &[&str], not_contains: &[&str]) -> FileConfig {
		FileConfig {
			source_dir: PathBuf::from("."),
			extension: String::from("xml"),
			contains: contains.iter().map(ToString::to_string).collect(),
			not_contains: not_contains.iter().map(ToString::to_string).collect(),
			processed_dir: PathBuf::from("."),
		}
	}

	#[test]
	fn include_substring_is_required() {
		let files = file_config(&["QA"], &["TEST"]);
		assert!(is_eligible("patient_QA_20230101.xml", &files));
		assert!(!is_eligible("patient_20230101.xml", &files));
	}

	#[test]
	fn exclude_substring_wins_over_include() {
		let files = file_config(&["QA", "TEST"], &["TEST"]);
		assert!(!is_eligible("patient_TEST_20230101.xml", &files));
	}

	#[test]
	fn empty_include_list_matches_nothing() {
		let files = file_config(&[], &[]);
		assert!(!is_eligible("patient_QA_20230101.xml", &files));
	}

	#[test]
	fn extension_must_match() {
		let files = file_config(&["QA"], &[]);
		assert!(!is_eligible("patient_QA_20230101.txt", &files));
	}

	#[test]
	fn timestamps_use_the_last_two_digit_runs() {
		let (date, time) = extract_timestamps("/data/qa2/scan_15062023_143000.xml")
			.expect("timestamp should parse");
		assert_eq!(date, "20230615");
		assert_eq!(time, "143000");
	}

	#[test]
	fn one_digit_run_is_not_enough() {
		assert!(matches!(
			extract_timestamps("scan_15062023.xml"),
			Err(TimestampError::MissingDigitRuns(_))
		));
	}

	#[test]
	fn day_out_of_range_is_rejected() {
		assert!(matches!(
			extract_timestamps("scan_32132023_143000.xml"),
			Err(TimestampError::InvalidDate(_))
		));
	}

	#[test]
	fn time_out_of_range_is_rejected() {
		assert!(matches!(
			extract_timestamps("scan_15062023_256161.xml"),
			Err(TimestampError::InvalidTime(_))
		));
	}

	#[test]
	fn short_date_run_is_rejected() {
		assert!(matches!(
			extract_timestamps("scan_1562023_143000.xml"),
			Err(TimestampError::InvalidDate(_))
		));
	}

	#[test]
	fn processed_set_round_trip() {
		let dir = tempfile::tempdir().expect("tempdir");
		let store_path = dir.path().join(ProcessedSet::FILE_NAME);

		let mut set = ProcessedSet::load(&store_path).expect("load should create the file");
		assert!(set.is_empty());

		let entry = dir.path().join("scan_15062023_143000.xml");
		set.commit(&entry).expect("commit");
		assert!(set.contains(&entry));

		let reloaded = ProcessedSet::load(&store_path).expect("reload");
		assert_eq!(reloaded.len(), 1);
		assert!(reloaded.contains(&entry));
	}
}
