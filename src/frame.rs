use crate::consts::{checksums, commands, FRAME_SIZE};

/// Command frame.
///
/// On the wire it is always [`FRAME_SIZE`] bytes: `0x40 | opcode`, the
/// argument MSB first and the checksum byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct CommandFrame {
    opcode: u8,
    argument: u32,
}

impl CommandFrame {
    /// Creates a frame, `opcode` is masked to its 6 bits.
    pub const fn new(opcode: u8, argument: u32) -> Self {
        CommandFrame {
            opcode: opcode & commands::CMD_MASK,
            argument,
        }
    }

    /// Command index.
    pub const fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Command argument.
    pub const fn argument(&self) -> u32 {
        self.argument
    }

    /// Checksum byte.
    ///
    /// Only CMD0 and CMD8 are checked by a card in SPI mode before CRC is
    /// turned on, so those get their fixed valid values.
    pub const fn checksum(&self) -> u8 {
        match self.opcode {
            commands::CMD0 => checksums::CMD0,
            commands::CMD8 => checksums::CMD8,
            _ => checksums::FILLER,
        }
    }

    /// Serializes the frame.
    pub const fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        let arg = self.argument.to_be_bytes();

        [
            commands::CMD_BASE | self.opcode,
            arg[0],
            arg[1],
            arg[2],
            arg[3],
            self.checksum(),
        ]
    }
}
