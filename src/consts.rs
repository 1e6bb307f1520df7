/// Data block size, fixed for every card in SPI mode.
pub const BLOCK_SIZE: usize = 512;
/// Data block size as a wire address multiplier.
pub const BLOCK_SIZE_U32: u32 = BLOCK_SIZE as u32;
/// Size of a command frame on the wire.
pub const FRAME_SIZE: usize = 6;

pub mod commands {
    /// Start bit and transmission bit of the first frame byte.
    pub const CMD_BASE: u8 = 0x40;
    /// Mask of the opcode bits.
    pub const CMD_MASK: u8 = 0x3F;
    /// ACMD flag.
    pub const ACMD_FLAG: u8 = 0x80;
    /// GO_IDLE_STATE - reset the card, enters SPI mode if CS is asserted.
    pub const CMD0: u8 = 0;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = 8;
    /// STOP_TRANSMISSION - end multiple block read sequence.
    pub const CMD12: u8 = 12;
    /// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card.
    pub const CMD18: u8 = 18;
    /// WRITE_MULTIPLE_BLOCK - write blocks of data until a stop token.
    pub const CMD25: u8 = 25;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = 58;
    /// SD_SEND_OP_COND - sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = ACMD_FLAG | 41;
}

pub mod checksums {
    /// Valid CRC byte of a CMD0 frame with a zero argument.
    pub const CMD0: u8 = 0x95;
    /// Valid CRC byte of a CMD8 frame with the `0x1AA` argument.
    pub const CMD8: u8 = 0x87;
    /// CRC byte for every other command, not checked in SPI mode.
    pub const FILLER: u8 = 0xFF;
}

pub mod args {
    /// SEND_IF_COND voltage supplied: 2.7-3.6V.
    pub const IF_COND_VOLTAGE: u32 = 1 << 8;
    /// SEND_IF_COND check pattern.
    pub const IF_COND_CHECK_PATTERN: u32 = 0xAA;
    /// Full SEND_IF_COND argument.
    pub const IF_COND: u32 = IF_COND_VOLTAGE | IF_COND_CHECK_PATTERN;
    /// Host capacity support, the host handles SDSC and SDHC cards.
    pub const ACMD41_HCS: u32 = 1 << 30;
}

pub mod tokens {
    /// Byte clocked out while the host only receives.
    pub const FILLER: u8 = 0xFF;
    /// Start data token for read blocks.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Stop token for write multiple blocks.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Start data token for write multiple blocks.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Mask for data response tokens after a write block operation.
    pub const DATA_RES_MASK: u8 = 0x1F;
    /// Write data accepted token.
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
    /// Line level while the card holds the bus busy.
    pub const BUSY: u8 = 0x00;
}
