//! DIMSE message layer for the store exchange.
//!
//! The transmission side is implemented as a store service class user
//! (C-STORE service) that verifies peer liveness with a C-ECHO before
//! transferring the object. One association is established per object;
//! there is no pooling and no provider (listening) role.

pub mod cecho;
pub mod cstore;
pub mod storescu;

use crate::types::{UI, US};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::Error as ClientError;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::{ClientAssociation, Pdu};
use std::fmt::{Debug, Formatter};
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU16, Ordering};
use thiserror::Error;
use tracing::trace;

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
/// For reading DICOM messages, prefer checking (command_data_set_type != DATA_SET_MISSING) as
/// AEs are free to choose another value for a truthy state.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<InMemDicomObject>,
	/// The presentation context id
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF => Ok(Self::Failure),
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

pub trait DicomMessageReader {
	fn read_message(&mut self) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	fn write_message(
		&mut self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
	) -> Result<(), WriteError>;
}

impl DicomMessageWriter for ClientAssociation<TcpStream> {
	fn write_message(
		&mut self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
	) -> Result<(), WriteError> {
		let message: DicomMessage = Into::into(message);

		let (context_id, context_transfer_syntax) = {
			let presentation_context = match presentation_context_id {
				None => self.presentation_contexts().first(),
				Some(presentation_context_id) => self
					.presentation_contexts()
					.iter()
					.find(|pctx| pctx.id == presentation_context_id),
			}
			.ok_or(NegotiationError::NoPresentationContext)?;
			(
				presentation_context.id,
				presentation_context.transfer_syntax.clone(),
			)
		};

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		let command_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: context_id,
				is_last: true,
				data: command_buf,
			}],
		};
		self.send(&command_pdu)?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&context_transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(&context_transfer_syntax))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;

			// Data sets larger than the acceptor's maximum PDU length must be
			// fragmented across multiple P-DATA PDUs.
			if data_buf.len() > self.acceptor_max_pdu_length() as usize {
				let mut writer = self.send_pdata(context_id);
				writer.write_all(&data_buf)?;
			} else {
				let data_pdu = Pdu::PData {
					data: vec![PDataValue {
						value_type: PDataValueType::Data,
						presentation_context_id: context_id,
						is_last: true,
						data: data_buf,
					}],
				};
				self.send(&data_pdu)?;
			}
		}

		Ok(())
	}
}

impl DicomMessageReader for ClientAssociation<TcpStream> {
	fn read_message(&mut self) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self.receive()?;
			if let Pdu::PData { data } = pdu {
				for mut pdv in data {
					match pdv.value_type {
						PDataValueType::Command => {
							trace!("Received command fragment (last={})", pdv.is_last);
							if message_command.is_some() {
								// Already received the full command set.
								// Receiving another command fragment is not expected.
								return Err(ReadError::OutOfOrder);
							}
							command_fragments.append(&mut pdv.data);
							if pdv.is_last {
								let command = InMemDicomObject::read_dataset_with_ts(
									command_fragments.as_slice(),
									&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
								)?;
								let has_data_set = command
									.get(tags::COMMAND_DATA_SET_TYPE)
									.map(InMemElement::to_int::<US>)
									.and_then(Result::ok)
									.is_some_and(|value| value != DATA_SET_MISSING);

								if has_data_set {
									message_command = Some(command);
								} else {
									return Ok(DicomMessage {
										command,
										data: None,
										presentation_context_id: Some(pdv.presentation_context_id),
									});
								}
							}
						}
						PDataValueType::Data => {
							trace!("Received data fragment (last={})", pdv.is_last);
							data_fragments.append(&mut pdv.data);
							if pdv.is_last {
								let presentation_context = self
									.presentation_contexts()
									.iter()
									.find(|pctx| pctx.id == pdv.presentation_context_id)
									.ok_or(NegotiationError::NoPresentationContext)?;
								let transfer_syntax = TransferSyntaxRegistry
									.get(&presentation_context.transfer_syntax)
									.ok_or_else(|| {
										NegotiationError::UnknownTransferSyntax(UI::from(
											&presentation_context.transfer_syntax,
										))
									})?;
								let data = InMemDicomObject::read_dataset_with_ts(
									data_fragments.as_slice(),
									transfer_syntax,
								)?;

								return if let Some(command) = message_command {
									Ok(DicomMessage {
										command,
										data: Some(data),
										presentation_context_id: Some(pdv.presentation_context_id),
									})
								} else {
									// Cannot handle data fragments before the entire command set is received.
									Err(ReadError::OutOfOrder)
								};
							}
						}
					}
				}
			} else {
				return Err(ReadError::UnexpectedPdu(pdu));
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Client(#[from] ClientError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Client(#[from] ClientError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

/// Returns a new message id by incrementing a global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(0);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
	use super::{DicomMessageReader, DicomMessageWriter, StatusType};
	use dicom::ul::ClientAssociation;
	use std::net::TcpStream;

	#[test]
	fn message_traits_cover_tcp_associations() {
		fn assert_impl<T: DicomMessageReader + DicomMessageWriter>() {}
		assert_impl::<ClientAssociation<TcpStream>>();
	}

	#[test]
	fn status_ranges_map_to_status_types() {
		assert_eq!(StatusType::try_from(0x0000), Ok(StatusType::Success));
		assert_eq!(StatusType::try_from(0xB007), Ok(StatusType::Warning));
		assert_eq!(StatusType::try_from(0xA700), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0x0122), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xFE00), Ok(StatusType::Cancel));
		assert_eq!(StatusType::try_from(0xFF00), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xC001), Err(0xC001));
	}
}
