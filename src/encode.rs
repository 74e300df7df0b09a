//! Builds the DICOM Secondary Capture object that carries one QA report.
//!
//! The report content is not imaging data; it is stored verbatim in a
//! private tag and the surrounding object exists so that a standard archive
//! node will accept and index it.

use crate::types::UI;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use uuid::Uuid;

/// The implementation class UID for wad-forward.
/// The UID is a randomly generated UUID represented as a single integer value under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.313223873753244181032470442529689556823";

pub type EncodedObject = FileDicomObject<InMemDicomObject>;

/// Derives a DICOM UID under the 2.25 root from the given name parts.
/// The same parts always produce the same UID.
pub fn derive_uid(parts: &[&str]) -> UI {
	let name = parts.join("/");
	let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
	format!("2.25.{}", uuid.as_u128())
}

/// The study/series/instance identity of one generated object, derived
/// deterministically so that re-runs over the same file yield the same UIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
	pub study_uid: UI,
	pub series_uid: UI,
	pub instance_uid: UI,
}

impl InstanceIdentity {
	pub fn derive(file_stem: &str, study_date: &str, study_time: &str) -> Self {
		Self {
			study_uid: derive_uid(&[file_stem, study_date, study_time, "study"]),
			series_uid: derive_uid(&[file_stem, study_date, study_time, "series"]),
			instance_uid: derive_uid(&[file_stem, study_date, study_time, "instance"]),
		}
	}
}

/// Descriptive attributes for one generated object.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
	pub patient_id: String,
	pub patient_name: String,
	pub study_description: String,
	pub series_description: String,
	pub station_name: String,
	/// Study date in DICOM DA form (YYYYMMDD).
	pub study_date: String,
	/// Study time in DICOM TM form (HHMMSS).
	pub study_time: String,
	pub identity: InstanceIdentity,
}

/// Creates a minimal Secondary Capture object with the required descriptive
/// attributes and the payload stored under the given private tag.
///
/// OB values must have even length, so an odd payload is padded with a
/// single trailing space.
pub fn encode(private_tag: Tag, mut payload: Vec<u8>, metadata: &ObjectMetadata) -> EncodedObject {
	if payload.len() % 2 != 0 {
		payload.push(b' ');
	}

	#[rustfmt::skip]
	let object = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, metadata.identity.instance_uid.clone())),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, metadata.identity.study_uid.clone())),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, metadata.identity.series_uid.clone())),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, metadata.patient_id.clone())),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, metadata.patient_name.clone())),
        DataElement::new(tags::STUDY_DESCRIPTION, VR::LO, dicom_value!(Str, metadata.study_description.clone())),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, dicom_value!(Str, metadata.series_description.clone())),
        DataElement::new(tags::STATION_NAME, VR::SH, dicom_value!(Str, metadata.station_name.clone())),
        DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "OT")),
        DataElement::new(tags::STUDY_DATE, VR::DA, dicom_value!(Str, metadata.study_date.clone())),
        DataElement::new(tags::SERIES_DATE, VR::DA, dicom_value!(Str, metadata.study_date.clone())),
        DataElement::new(tags::CONTENT_DATE, VR::DA, dicom_value!(Str, metadata.study_date.clone())),
        DataElement::new(tags::STUDY_TIME, VR::TM, dicom_value!(Str, metadata.study_time.clone())),
        DataElement::new(tags::SERIES_TIME, VR::TM, dicom_value!(Str, metadata.study_time.clone())),
        DataElement::new(tags::CONTENT_TIME, VR::TM, dicom_value!(Str, metadata.study_time.clone())),
        DataElement::new(private_tag, VR::OB, PrimitiveValue::U8(payload.into())),
    ]);

	object.with_exact_meta(
		FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
			.media_storage_sop_instance_uid(metadata.identity.instance_uid.clone())
			.transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
			.implementation_class_uid(IMPLEMENTATION_CLASS_UID)
			.build()
			.expect("FileMetaTableBuilder should contain required data"),
	)
}
