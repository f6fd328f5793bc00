use thiserror::Error;

use crate::common::types::SlotId;

#[derive(Error, Debug)]
pub enum PageError {
    #[error("Not enough free space on page")]
    InsufficientSpace,
    #[error("Invalid slot: {0}")]
    InvalidSlot(SlotId),
    #[error("Record not found")]
    RecordNotFound,
    #[error("Slot already occupied")]
    DuplicateRecord,
    #[error("Record of {0} bytes exceeds page capacity")]
    RecordTooLarge(usize),
}
