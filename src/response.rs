use crate::consts::args;

use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    start_bit, _: 7;
}

impl R1Response {
    /// Card left the idle state, no errors.
    pub const READY_STATE: R1Response = R1Response(0x00);
    /// Card is in the idle state, no errors.
    pub const IN_IDLE_STATE: R1Response = R1Response(0x01);
    /// Card is idle and does not know the command.
    pub const IN_IDLE_AND_ILLEGAL: R1Response = R1Response(0x05);

    /// Mask of the error bits, everything but idle and the start bit.
    const ERROR_MASK: u8 = 0x7E;

    /// A response byte always starts with a cleared bit 7, anything else
    /// is the bus idling.
    pub fn is_valid(&self) -> bool {
        !self.start_bit()
    }

    /// Any of the error bits is set.
    pub fn has_error(&self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }

    /// Raw response byte.
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// R3/R7 payload, MSB first.
pub type RegisterEcho = [u8; 4];

bitfield! {
    /// Operating Conditions Register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct Ocr(u32);
    impl Debug;
    /// 2.7-3.6V support, one bit per 100mV sub-band starting at 2.7V.
    pub u16, voltage_window, _: 23, 15;
    pub switching_to_1v8, _: 24;
    /// Valid only once `power_up_status` is set.
    pub card_capacity_status, _: 30;
    pub power_up_status, _: 31;
}

impl Ocr {
    /// Every 2.7-3.6V sub-band.
    pub const FULL_VOLTAGE_WINDOW: u16 = 0x1FF;

    /// Raw register value.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Card works across the whole 2.7-3.6V window.
    pub fn supports_full_window(&self) -> bool {
        self.voltage_window() == Self::FULL_VOLTAGE_WINDOW
    }
}

impl From<u8> for R1Response {
    fn from(byte: u8) -> Self {
        R1Response(byte)
    }
}

impl From<RegisterEcho> for Ocr {
    fn from(echo: RegisterEcho) -> Self {
        Ocr(u32::from_be_bytes(echo))
    }
}

/// Checks that a SEND_IF_COND echo returns the supplied voltage and check
/// pattern, bytes 2 and 3 of the payload.
pub fn if_cond_accepted(echo: &RegisterEcho) -> bool {
    let expected = args::IF_COND.to_be_bytes();

    echo[2..] == expected[2..]
}
