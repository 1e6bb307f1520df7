//! SD card driver for the SPI-mode command protocol, written in Embedded Rust.
//!
//! This crate brings a card from power-up to a negotiated [`CardState`] and
//! then reads and writes 512-byte blocks with multiple block transfers.
//!
//! Logging goes through the `log` facade by default, or through `defmt` with
//! the `defmt-log` feature (default features disabled).

#![cfg_attr(not(test), no_std)]

#[cfg(all(feature = "log", feature = "defmt-log"))]
compile_error!("features `log` and `defmt-log` are mutually exclusive");
#[cfg(not(any(feature = "log", feature = "defmt-log")))]
compile_error!("enable either the `log` or the `defmt-log` feature");

mod card;
mod config;
mod consts;
mod frame;
mod init;
mod response;
mod transfer;

pub use crate::card::{AddressingMode, BlockTransferRequest, CardState, Direction};
pub use crate::config::{DefaultSdMmcSpiConfig, SdMmcSpiConfig};
pub use crate::consts::BLOCK_SIZE;
pub use crate::frame::CommandFrame;
pub use crate::response::{Ocr, R1Response, RegisterEcho};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use crate::consts::{commands, tokens};

use core::{cell::RefCell, marker::PhantomData};
#[cfg(feature = "defmt-log")]
use defmt::{error, info, trace, warn};
use embedded_hal::blocking::{delay::DelayMs, spi::Transfer};
#[cfg(feature = "log")]
use log::{error, info, trace, warn};
use switch_hal::OutputSwitch;

/// [`SdMmcSpi`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// No response when executing this command.
    CommandTimedOut(u8),
    /// Command answered with error bits set (command, R1).
    CommandRejected(u8, u8),
    /// Interface condition echo doesn't match the supplied voltage and pattern.
    VoltageRangeUnsupported,
    /// Reading the OCR failed (R1).
    CapacityQueryFailed(u8),
    /// Card didn't leave the idle state within the negotiation budget.
    NegotiationTimedOut,
    /// No start block token when reading data from the card.
    TokenWaitTimedOut,
    /// Card sent a data error token instead of a start block token.
    DataErrorToken(u8),
    /// Card didn't accept a data block (data response token).
    DataRejected(u8),
    /// Card didn't release busy.
    BusyReleaseTimedOut,
    /// Card stayed busy for every attempt to start a multiple block write.
    WriteCommandRejected,
    /// Buffer length doesn't match the block count.
    InvalidBufferLength(usize),
    /// Sector address doesn't fit the command argument.
    AddressOutOfRange(u32),
}

/// Error type alias.
type ErrorFor<T> = <T as DiskioDevice>::HardwareError;

/// SD Card SPI driver.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch.
/// `Delay` - Millisecond delay.
/// `Config` - Config implementation of driver config trait.
pub struct SdMmcSpi<Spi, Cs, Delay, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
{
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    delay: RefCell<Delay>,
    status: Status,
    card_state: Option<CardState>,
    config: PhantomData<Config>,
}

impl<Spi, Cs, Delay, Config> SdMmcSpi<Spi, Cs, Delay, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Creates a new [`SdMmcSpi<Spi, Cs, Delay, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    /// `delay` - delay provider.
    pub fn new(spi: Spi, cs: Cs, delay: Delay) -> Self {
        SdMmcSpi {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            delay: RefCell::new(delay),
            status: StatusFlag::NotInitialized.into(),
            card_state: None,
            config: PhantomData::<Config>,
        }
    }

    /// State negotiated by [`DiskioDevice::initialize`].
    pub fn card_state(&self) -> Option<CardState> {
        self.card_state
    }

    /// Activate chip select.
    fn select(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().on().map_err(Error::SelectError)
    }

    /// Deactivate chip select.
    fn unselect(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().off().map_err(Error::SelectError)
    }

    /// CS scope.
    ///
    /// Chip select is released on every path out of `f`, an error from `f`
    /// wins over an error releasing it.
    fn cs_scope<R, F>(&self, f: F) -> Result<R, ErrorFor<Self>>
    where
        F: FnOnce(&Self) -> Result<R, ErrorFor<Self>>,
    {
        self.select()?;
        let result = f(self);
        let released = self.unselect();

        let value = result?;
        released?;

        Ok(value)
    }

    /// Wait `ms` milliseconds.
    fn delay_ms(&self, ms: u32) {
        self.delay.borrow_mut().delay_ms(ms);
    }

    /// Send one byte and receive one byte.
    fn transfer(&self, data: u8) -> Result<u8, ErrorFor<Self>> {
        self.spi
            .borrow_mut()
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in a filler byte.
    fn receive(&self) -> Result<u8, ErrorFor<Self>> {
        self.transfer(tokens::FILLER)
    }

    /// Send a byte to the SD card.
    fn send(&self, data: u8) -> Result<(), ErrorFor<Self>> {
        self.transfer(data).map(|_| ())
    }

    /// Receive a slice from the SD card.
    fn receive_slice(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        for byte in data.iter_mut() {
            *byte = self.receive()?;
        }

        Ok(())
    }

    /// Send a slice to the SD card.
    fn send_slice(&self, data: &[u8]) -> Result<(), ErrorFor<Self>> {
        for byte in data.iter() {
            self.send(*byte)?;
        }

        Ok(())
    }

    /// Skip byte.
    fn skip_byte(&self) -> Result<(), ErrorFor<Self>> {
        self.receive().map(|_| ())
    }

    /// Clock filler bytes until `token_validator` accepts one, at most
    /// `attempts` bytes.
    fn wait_for_token<F: Fn(u8) -> bool>(
        &self,
        token_validator: F,
        attempts: usize,
        error: ErrorFor<Self>,
    ) -> Result<u8, ErrorFor<Self>> {
        for _ in 0..attempts {
            let token = self.receive()?;

            if token_validator(token) {
                return Ok(token);
            }
        }

        Err(error)
    }

    /// Wait until the card stops holding the bus low.
    fn wait_busy_release(&self) -> Result<(), ErrorFor<Self>> {
        self.wait_for_token(
            |token| token != tokens::BUSY,
            Config::BUSY_RELEASE_ATTEMPTS,
            Error::BusyReleaseTimedOut,
        )
        .map(|_| ())
    }

    /// Send command implementation.
    fn send_command_impl(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Self>> {
        let frame = CommandFrame::new(cmd, arg);

        self.send_slice(&frame.to_bytes())?;

        if frame.opcode() == commands::CMD12 {
            self.skip_byte()?;
        }

        for _ in 0..Config::READ_R1_ATTEMPTS {
            let r1 = R1Response::from(self.receive()?);

            if r1.is_valid() {
                trace!("CMD{} response: 0x{:02X}", frame.opcode(), r1.bits());
                return Ok(r1);
            }
        }

        Err(Error::CommandTimedOut(frame.opcode()))
    }

    /// Send command, application specific ones are prefixed with APP_CMD.
    fn send_command(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Self>> {
        if (cmd & commands::ACMD_FLAG) != 0 {
            self.send_command_impl(commands::CMD55, 0x0000_0000)?;
        }

        self.send_command_impl(cmd & !commands::ACMD_FLAG, arg)
    }

    /// Read the R3/R7 payload following a response.
    fn read_register_echo(&self) -> Result<RegisterEcho, ErrorFor<Self>> {
        let mut echo = RegisterEcho::default();

        self.receive_slice(&mut echo)?;

        Ok(echo)
    }

    /// Request errors are invalid arguments for a block device, the rest is hardware.
    fn to_diskio_error(err: ErrorFor<Self>) -> DiskioError<ErrorFor<Self>> {
        match err {
            Error::InvalidBufferLength(_) | Error::AddressOutOfRange(_) => {
                DiskioError::InvalidArgument
            }
            err => DiskioError::Hardware(err),
        }
    }

    /// Negotiated state, if initialized.
    fn initialized_state(&self) -> Result<CardState, DiskioError<ErrorFor<Self>>> {
        match self.card_state {
            Some(state) if !self.status.contains(StatusFlag::NotInitialized) => Ok(state),
            _ => Err(DiskioError::NotInitialized),
        }
    }

    /// Convert lba.
    fn convert_lba(lba: Lba) -> Result<u32, DiskioError<ErrorFor<Self>>> {
        u32::try_from(lba).map_err(|_| DiskioError::InvalidArgument)
    }
}

impl<Spi, Cs, Delay, Config> DiskioDevice for SdMmcSpi<Spi, Cs, Delay, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = Error<Spi::Error, Cs::Error>;

    fn status(&self) -> Status {
        self.status
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.status = StatusFlag::NotInitialized.into();
        self.card_state = None;
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if !self.status.contains(StatusFlag::NotInitialized) {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        match self.try_init() {
            Ok(state) => {
                self.card_state = Some(state);
                self.status = Status::default();
                Ok(())
            }
            Err(err) => {
                #[cfg(feature = "log")]
                error!("Failed to initialize SD: {:?}", err);
                #[cfg(feature = "defmt-log")]
                error!("Failed to initialize SD: {}", defmt::Debug2Format(&err));

                self.card_state = None;
                self.status = StatusFlag::ErrorOccured | StatusFlag::NotInitialized;
                Err(DiskioError::Hardware(err))
            }
        }
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let state = self.initialized_state()?;
        let sector = Self::convert_lba(lba)?;
        let count = buf.len() / BLOCK_SIZE;

        self.read_blocks(buf, sector, count, state)
            .map_err(Self::to_diskio_error)
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let state = self.initialized_state()?;
        let sector = Self::convert_lba(lba)?;
        let count = buf.len() / BLOCK_SIZE;

        self.write_blocks(buf, sector, count, state)
            .map_err(Self::to_diskio_error)
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => {
                self.initialized_state()?;
                self.cs_scope(|s| s.wait_busy_release())
                    .map_err(DiskioError::Hardware)
            }
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}
