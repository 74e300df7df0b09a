//! Forwards QA report files to a DICOM archive node.
//!
//! Each eligible file in the source directory is wrapped into a Secondary
//! Capture object carrying the raw report in a private tag and transmitted
//! over a DIMSE C-STORE exchange. Successfully transmitted files are
//! recorded in an append-only processed-set so they are never re-sent.

pub mod config;
pub mod dimse;
pub mod encode;
pub mod intake;
pub mod types;
