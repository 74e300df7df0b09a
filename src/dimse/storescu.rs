use crate::config::ServerConfig;
use crate::dimse::cecho::{CompositeEchoRequest, CompositeEchoResponse};
use crate::dimse::cstore::{CompositeStoreRequest, CompositeStoreResponse};
use crate::dimse::{
	next_message_id, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError,
};
use crate::encode::EncodedObject;
use crate::types::{Priority, US};
use dicom::dictionary_std::uids;
use dicom::ul::association::Error as ClientError;
use dicom::ul::{ClientAssociation, ClientAssociationOptions};
use std::net::TcpStream;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Presentation context ids are assigned odd, in proposal order.
pub const VERIFICATION_CONTEXT_ID: u8 = 1;
pub const STORAGE_CONTEXT_ID: u8 = 3;

/// Transfer syntaxes offered for the storage context, in order of preference.
/// Explicit VR Big Endian is retired but still offered last for old peers.
#[allow(deprecated)]
const TRANSFER_SYNTAXES: [&str; 3] = [
	uids::EXPLICIT_VR_LITTLE_ENDIAN,
	uids::IMPLICIT_VR_LITTLE_ENDIAN,
	uids::EXPLICIT_VR_BIG_ENDIAN,
];

/// The outcome of one store exchange.
///
/// [`StoreOutcome::LivenessWarning`] means the object was stored, but the
/// C-ECHO liveness probe reported a non-success status beforehand. The probe
/// is advisory; it exists so operators can diagnose dead peers, not to gate
/// transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
	Success,
	LivenessWarning,
	AssociationRejected,
	TransferFailed,
}

impl StoreOutcome {
	/// Whether the peer confirmed reception of the object.
	pub const fn is_delivered(self) -> bool {
		matches!(self, Self::Success | Self::LivenessWarning)
	}
}

/// The seam between the intake loop and the network.
pub trait StoreService {
	fn store(&self, object: EncodedObject) -> StoreOutcome;
}

/// Service class user for the Storage service class.
///
/// Performs exactly one store exchange per invocation: associate, probe the
/// peer with a C-ECHO, transfer the object with a C-STORE and release. No
/// association is reused across objects.
pub struct StoreServiceClassUser {
	config: ServerConfig,
}

impl StoreServiceClassUser {
	pub const fn new(config: ServerConfig) -> Self {
		Self { config }
	}

	fn associate(&self) -> Result<ClientAssociation<TcpStream>, ClientError> {
		debug!(
			"Requesting association with peer {}@{}",
			self.config.called_aet,
			self.config.address()
		);
		let options = ClientAssociationOptions::new()
			.calling_ae_title(self.config.calling_aet.clone())
			.called_ae_title(self.config.called_aet.clone())
			.with_presentation_context(
				String::from(uids::VERIFICATION),
				TRANSFER_SYNTAXES.map(String::from).to_vec(),
			)
			.with_presentation_context(
				String::from(uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
				TRANSFER_SYNTAXES.map(String::from).to_vec(),
			);

		options.establish_with(&self.config.address())
	}

	/// Initiates the C-ECHO protocol.
	fn echo(association: &mut ClientAssociation<TcpStream>) -> Result<StatusType, EchoError> {
		trace!("Initiated C-ECHO protocol");
		let request = CompositeEchoRequest {
			message_id: next_message_id(),
		};
		association.write_message(request, Some(VERIFICATION_CONTEXT_ID))?;

		let response = association.read_message()?;
		let response = CompositeEchoResponse::try_from(response)?;

		let status_type = StatusType::try_from(response.status).unwrap_or(StatusType::Failure);
		debug!(
			status = response.status,
			"Received C-ECHO-RSP ({status_type:?})"
		);
		Ok(status_type)
	}

	/// Initiates the C-STORE protocol for one encoded object.
	fn transmit(
		association: &mut ClientAssociation<TcpStream>,
		object: EncodedObject,
	) -> Result<StatusType, StoreError> {
		trace!("Initiated C-STORE protocol");
		let request = CompositeStoreRequest {
			affected_sop_class_uid: object.meta().media_storage_sop_class_uid.clone(),
			affected_sop_instance_uid: object.meta().media_storage_sop_instance_uid.clone(),
			priority: Priority::Medium as US,
			message_id: next_message_id(),
			data_set: object.into_inner(),
		};
		association.write_message(request, Some(STORAGE_CONTEXT_ID))?;

		let response = association.read_message()?;
		let response = CompositeStoreResponse::try_from(response)?;

		let status_type = StatusType::try_from(response.status).unwrap_or(StatusType::Failure);
		debug!(
			status = response.status,
			"Received C-STORE-RSP ({status_type:?})"
		);
		Ok(status_type)
	}
}

impl StoreService for StoreServiceClassUser {
	fn store(&self, object: EncodedObject) -> StoreOutcome {
		let mut association = match self.associate() {
			Ok(association) => association,
			Err(err) => {
				warn!(
					"Could not establish association with {}@{}: {err}",
					self.config.called_aet,
					self.config.address()
				);
				return StoreOutcome::AssociationRejected;
			}
		};
		info!("Association accepted by peer");

		if !association
			.presentation_contexts()
			.iter()
			.any(|pctx| pctx.id == STORAGE_CONTEXT_ID)
		{
			warn!("Peer did not accept the storage presentation context");
			return StoreOutcome::AssociationRejected;
		}

		// Advisory liveness probe. A dead or unhealthy peer is logged for the
		// operator, but the transfer is attempted regardless.
		let liveness = match Self::echo(&mut association) {
			Ok(StatusType::Success) => true,
			Ok(status) => {
				warn!("Liveness probe returned non-success status ({status:?})");
				false
			}
			Err(err) => {
				warn!("Liveness probe failed: {err}");
				false
			}
		};

		match Self::transmit(&mut association, object) {
			Ok(StatusType::Success) => {}
			Ok(status) => {
				// The transfer is aborted without a release; dropping the
				// association closes the transport.
				warn!("Peer rejected the object ({status:?})");
				return StoreOutcome::TransferFailed;
			}
			Err(err) => {
				warn!("C-STORE failed: {err}");
				return StoreOutcome::TransferFailed;
			}
		}

		if let Err(err) = association.release() {
			debug!("Failed to release association: {err}");
		}

		if liveness {
			StoreOutcome::Success
		} else {
			StoreOutcome::LivenessWarning
		}
	}
}

/// Errors that can occur for the echoscu part of the exchange.
#[derive(Debug, Error)]
pub enum EchoError {
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Read(#[from] ReadError),
}

/// Errors that can occur for the storescu part of the exchange.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Read(#[from] ReadError),
}
