use dicom::core::Tag;
use dicom::dictionary_std::tags;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use wad_forward::config::{DicomConfig, FileConfig};
use wad_forward::dimse::storescu::{StoreOutcome, StoreService};
use wad_forward::encode::EncodedObject;
use wad_forward::intake::{Intake, ProcessedSet};

const PRIVATE_TAG: Tag = Tag(0x0071, 0x0010);

/// Records every stored object and answers with a scripted outcome.
struct RecordingSender {
	outcome: Box<dyn Fn(&EncodedObject) -> StoreOutcome>,
	stored: RefCell<Vec<EncodedObject>>,
}

impl RecordingSender {
	fn accepting() -> Self {
		Self::with_outcome(|_| StoreOutcome::Success)
	}

	fn with_outcome(outcome: impl Fn(&EncodedObject) -> StoreOutcome + 'static) -> Self {
		Self {
			outcome: Box::new(outcome),
			stored: RefCell::new(Vec::new()),
		}
	}

	fn stored_count(&self) -> usize {
		self.stored.borrow().len()
	}
}

impl StoreService for RecordingSender {
	fn store(&self, object: EncodedObject) -> StoreOutcome {
		let outcome = (self.outcome)(&object);
		self.stored.borrow_mut().push(object);
		outcome
	}
}

fn intake_for(dir: &Path) -> Intake {
	let files = FileConfig {
		source_dir: dir.to_path_buf(),
		extension: String::from("xml"),
		contains: vec![String::from("scan")],
		not_contains: vec![String::from("TEST")],
		processed_dir: dir.to_path_buf(),
	};
	let dicom = DicomConfig {
		station_name: String::from("PET01"),
		patient_id: String::from("QA"),
		patient_name: String::from("QA^Reports"),
		study_description: String::from("QA report"),
		series_description: String::from("QA report"),
		private_tag: String::from("0071,0010"),
	};
	Intake::new(files, dicom, PRIVATE_TAG)
}

fn processed_lines(dir: &Path) -> Vec<String> {
	fs::read_to_string(dir.join(ProcessedSet::FILE_NAME))
		.expect("processed-set file should exist")
		.lines()
		.map(ToOwned::to_owned)
		.collect()
}

fn series_description(object: &EncodedObject) -> String {
	object
		.element(tags::SERIES_DESCRIPTION)
		.expect("series description should exist")
		.to_str()
		.expect("series description should be a string")
		.into_owned()
}

#[test]
fn successful_run_pads_payload_and_commits_the_path() {
	let dir = tempfile::tempdir().expect("tempdir");
	let source = dir.path().join("scan_15062023_143000.xml");
	fs::write(&source, "<qa>ok</qa>").expect("write source file");
	let absolute = fs::canonicalize(&source).expect("canonicalize");

	let sender = RecordingSender::accepting();
	let summary = intake_for(dir.path())
		.run(&sender)
		.expect("run should succeed");

	assert_eq!(summary.sent, 1);
	assert_eq!(summary.failed, 0);
	assert_eq!(summary.skipped, 0);
	assert_eq!(processed_lines(dir.path()), vec![absolute.display().to_string()]);

	let stored = sender.stored.borrow();
	let object = stored.first().expect("one object should be stored");

	// 11 payload bytes are padded to 12 with a trailing space.
	let payload = object
		.element(PRIVATE_TAG)
		.expect("payload element")
		.value()
		.primitive()
		.expect("primitive payload")
		.to_bytes()
		.into_owned();
	assert_eq!(payload, b"<qa>ok</qa> ");

	let study_date = object
		.element(tags::STUDY_DATE)
		.expect("study date")
		.to_str()
		.expect("study date string")
		.into_owned();
	assert_eq!(study_date, "20230615");

	let study_time = object
		.element(tags::STUDY_TIME)
		.expect("study time")
		.to_str()
		.expect("study time string")
		.into_owned();
	assert_eq!(study_time, "143000");
}

#[test]
fn second_run_skips_processed_files() {
	let dir = tempfile::tempdir().expect("tempdir");
	fs::write(dir.path().join("scan_15062023_143000.xml"), "<qa>ok</qa>").expect("write");

	let first = RecordingSender::accepting();
	intake_for(dir.path()).run(&first).expect("first run");
	assert_eq!(first.stored_count(), 1);

	let second = RecordingSender::accepting();
	let summary = intake_for(dir.path()).run(&second).expect("second run");
	assert_eq!(second.stored_count(), 0);
	assert_eq!(summary.sent, 0);
	assert_eq!(summary.skipped, 1);
	assert_eq!(processed_lines(dir.path()).len(), 1);
}

#[test]
fn identical_input_derives_identical_identifiers() {
	let dir = tempfile::tempdir().expect("tempdir");
	fs::write(dir.path().join("scan_15062023_143000.xml"), "<qa>ok</qa>").expect("write");

	let uids_of = |sender: &RecordingSender| {
		let stored = sender.stored.borrow();
		let object = stored.first().expect("stored object");
		[
			tags::STUDY_INSTANCE_UID,
			tags::SERIES_INSTANCE_UID,
			tags::SOP_INSTANCE_UID,
		]
		.map(|tag| {
			object
				.element(tag)
				.expect("uid element")
				.to_str()
				.expect("uid string")
				.into_owned()
		})
	};

	let first = RecordingSender::accepting();
	intake_for(dir.path()).run(&first).expect("first run");

	// Retry the same file by keeping it out of the processed-set.
	fs::remove_file(dir.path().join(ProcessedSet::FILE_NAME)).expect("reset processed-set");
	let second = RecordingSender::accepting();
	intake_for(dir.path()).run(&second).expect("second run");

	assert_eq!(uids_of(&first), uids_of(&second));
}

#[test]
fn failed_transfer_is_not_committed_and_the_run_continues() {
	let dir = tempfile::tempdir().expect("tempdir");
	fs::write(dir.path().join("scan_bad_15062023_143000.xml"), "<qa>nok</qa>").expect("write");
	fs::write(dir.path().join("scan_good_16062023_143000.xml"), "<qa>ok</qa>").expect("write");

	let sender = RecordingSender::with_outcome(|object| {
		if series_description(object).contains("bad") {
			StoreOutcome::TransferFailed
		} else {
			StoreOutcome::Success
		}
	});
	let summary = intake_for(dir.path())
		.run(&sender)
		.expect("run should succeed");

	assert_eq!(summary.sent, 1);
	assert_eq!(summary.failed, 1);
	assert_eq!(sender.stored_count(), 2, "the run must continue past a failure");

	let lines = processed_lines(dir.path());
	assert_eq!(lines.len(), 1);
	assert!(lines[0].contains("scan_good_16062023_143000.xml"));
}

#[test]
fn association_rejection_commits_nothing() {
	let dir = tempfile::tempdir().expect("tempdir");
	fs::write(dir.path().join("scan_15062023_143000.xml"), "<qa>ok</qa>").expect("write");

	let sender = RecordingSender::with_outcome(|_| StoreOutcome::AssociationRejected);
	let summary = intake_for(dir.path())
		.run(&sender)
		.expect("run should succeed");

	assert_eq!(summary.sent, 0);
	assert_eq!(summary.failed, 1);
	assert!(processed_lines(dir.path()).is_empty());
}

#[test]
fn liveness_warning_still_counts_as_delivered() {
	let dir = tempfile::tempdir().expect("tempdir");
	fs::write(dir.path().join("scan_15062023_143000.xml"), "<qa>ok</qa>").expect("write");

	let sender = RecordingSender::with_outcome(|_| StoreOutcome::LivenessWarning);
	let summary = intake_for(dir.path())
		.run(&sender)
		.expect("run should succeed");

	assert_eq!(summary.sent, 1);
	assert_eq!(processed_lines(dir.path()).len(), 1);
}

#[test]
fn excluded_and_non_matching_files_are_never_offered() {
	let dir = tempfile::tempdir().expect("tempdir");
	fs::write(dir.path().join("scan_TEST_15062023_143000.xml"), "x").expect("write");
	fs::write(dir.path().join("other_15062023_143000.xml"), "x").expect("write");
	fs::write(dir.path().join("scan_15062023_143000.txt"), "x").expect("write");

	let sender = RecordingSender::accepting();
	let summary = intake_for(dir.path())
		.run(&sender)
		.expect("run should succeed");

	assert_eq!(sender.stored_count(), 0);
	assert_eq!(summary.sent, 0);
	assert!(processed_lines(dir.path()).is_empty());
}

#[test]
fn malformed_timestamp_aborts_the_run() {
	let dir = tempfile::tempdir().expect("tempdir");
	// The last two digit runs never form a valid date and time.
	fs::write(dir.path().join("scan_99999999_999999.xml"), "x").expect("write");

	let sender = RecordingSender::accepting();
	let result = intake_for(dir.path()).run(&sender);

	assert!(result.is_err());
	assert!(processed_lines(dir.path()).is_empty());
}

// Guards against path handling regressions when the source is addressed
// through a relative directory.
#[test]
fn processed_set_records_absolute_paths() {
	let dir = tempfile::tempdir().expect("tempdir");
	fs::write(dir.path().join("scan_15062023_143000.xml"), "<qa>ok</qa>").expect("write");

	let sender = RecordingSender::accepting();
	intake_for(dir.path()).run(&sender).expect("run");

	let lines = processed_lines(dir.path());
	assert!(PathBuf::from(&lines[0]).is_absolute());
}
