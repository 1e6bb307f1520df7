use crate::{
    consts::{BLOCK_SIZE, BLOCK_SIZE_U32},
    response::Ocr,
};

/// How the card interprets the address argument of block commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum AddressingMode {
    /// Standard capacity card, addressed by byte offset.
    ByteAddressed,
    /// High or extended capacity card, addressed by block index.
    BlockAddressed,
}

impl From<Ocr> for AddressingMode {
    fn from(ocr: Ocr) -> Self {
        if ocr.card_capacity_status() {
            AddressingMode::BlockAddressed
        } else {
            AddressingMode::ByteAddressed
        }
    }
}

/// Negotiated card state.
///
/// Produced once by initialization and passed to every block transfer of
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct CardState {
    addressing_mode: AddressingMode,
}

impl CardState {
    pub(crate) fn new(addressing_mode: AddressingMode) -> Self {
        CardState { addressing_mode }
    }

    /// Addressing mode.
    pub fn addressing_mode(&self) -> AddressingMode {
        self.addressing_mode
    }

    /// Address argument for a block command starting at `sector`.
    ///
    /// `None` if a byte address doesn't fit 32 bits.
    pub fn wire_address(&self, sector: u32) -> Option<u32> {
        match self.addressing_mode {
            AddressingMode::ByteAddressed => sector.checked_mul(BLOCK_SIZE_U32),
            AddressingMode::BlockAddressed => Some(sector),
        }
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Direction {
    Read,
    Write,
}

/// Multiple block transfer of [`BLOCK_SIZE`] blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct BlockTransferRequest {
    pub direction: Direction,
    pub start_sector: u32,
    pub block_count: usize,
}

impl BlockTransferRequest {
    pub fn new(direction: Direction, start_sector: u32, block_count: usize) -> Self {
        BlockTransferRequest {
            direction,
            start_sector,
            block_count,
        }
    }

    /// Buffer length the transfer needs, `None` on overflow.
    pub fn buffer_len(&self) -> Option<usize> {
        self.block_count.checked_mul(BLOCK_SIZE)
    }

    /// Transfer is non-empty and `buf_len` holds exactly its blocks.
    pub fn fits(&self, buf_len: usize) -> bool {
        self.block_count != 0 && self.buffer_len() == Some(buf_len)
    }
}
