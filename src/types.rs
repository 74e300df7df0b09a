/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone)]
pub enum Priority {
	Low = 0x0002,
	Medium = 0x0000,
	High = 0x0001,
}

impl Default for Priority {
	fn default() -> Self {
		Self::Medium
	}
}
