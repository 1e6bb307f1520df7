//! Multiple block read and write.

use crate::{
    card::{BlockTransferRequest, CardState, Direction},
    config::SdMmcSpiConfig,
    consts::{commands, tokens, BLOCK_SIZE},
    response::R1Response,
    Error, ErrorFor, SdMmcSpi,
};

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, trace, warn};
use embedded_hal::blocking::{delay::DelayMs, spi::Transfer};
#[cfg(feature = "log")]
use log::{debug, error, trace, warn};
use switch_hal::OutputSwitch;

impl<Spi, Cs, Delay, Config> SdMmcSpi<Spi, Cs, Delay, Config>
where
    Spi: Transfer<u8>,
    Cs: OutputSwitch,
    Delay: DelayMs<u32>,
    Config: SdMmcSpiConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Read `count` blocks starting at `start_sector` into `buf`.
    ///
    /// `buf` must hold exactly `count` blocks.
    pub fn read_blocks(
        &self,
        buf: &mut [u8],
        start_sector: u32,
        count: usize,
        state: CardState,
    ) -> Result<(), ErrorFor<Self>> {
        let request = BlockTransferRequest::new(Direction::Read, start_sector, count);
        let address = Self::transfer_address(&request, buf.len(), state)?;

        self.cs_scope(|s| {
            let r1 = s.send_command(commands::CMD18, address)?;
            if r1 != R1Response::READY_STATE {
                error!("Wrong response from CMD18: 0x{:02X}", r1.bits());
                return Err(Error::CommandRejected(commands::CMD18, r1.bits()));
            }

            let result = buf
                .chunks_mut(BLOCK_SIZE)
                .try_for_each(|block| s.read_data(block));
            if result.is_err() {
                warn!("Aborting multiple block read");
            }

            // The card stays in the data state until CMD12, even after a failed block.
            let stopped = s.stop_transmission();

            result.and(stopped)
        })
    }

    /// Write `count` blocks from `buf` starting at `start_sector`.
    ///
    /// `buf` must hold exactly `count` blocks. The start address follows the
    /// negotiated addressing mode, same as [`read_blocks`](Self::read_blocks).
    pub fn write_blocks(
        &self,
        buf: &[u8],
        start_sector: u32,
        count: usize,
        state: CardState,
    ) -> Result<(), ErrorFor<Self>> {
        let request = BlockTransferRequest::new(Direction::Write, start_sector, count);
        let address = Self::transfer_address(&request, buf.len(), state)?;

        self.cs_scope(|s| {
            s.start_write(address)?;
            s.send(tokens::FILLER)?;

            let result = buf.chunks(BLOCK_SIZE).try_for_each(|block| {
                s.write_data(tokens::WRITE_MULTIPLE, block)?;
                s.wait_busy_release()
            });
            if result.is_err() {
                warn!("Aborting multiple block write");
                // Best effort, the stop token is only seen once busy is released.
                let _ = s.wait_busy_release();
            }

            let stopped = s.stop_write();

            result.and(stopped)
        })
    }

    /// Check the buffer against the request and translate its start sector.
    fn transfer_address(
        request: &BlockTransferRequest,
        buf_len: usize,
        state: CardState,
    ) -> Result<u32, ErrorFor<Self>> {
        if !request.fits(buf_len) {
            error!(
                "SD invalid buffer, length: {}, blocks: {}",
                buf_len, request.block_count
            );
            return Err(Error::InvalidBufferLength(buf_len));
        }

        let address = state
            .wire_address(request.start_sector)
            .ok_or(Error::AddressOutOfRange(request.start_sector))?;

        debug!(
            "{:?} of {} blocks, sector: {}, address: 0x{:08X}",
            request.direction, request.block_count, request.start_sector, address
        );

        Ok(address)
    }

    /// Read one data block, the trailing CRC is not checked.
    fn read_data(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        let token = self.wait_for_token(
            |token| token != tokens::FILLER,
            Config::TOKEN_WAIT_ATTEMPTS,
            Error::TokenWaitTimedOut,
        )?;

        if token != tokens::DATA_START_BLOCK {
            error!("Data error token: 0x{:02X}", token);
            return Err(Error::DataErrorToken(token));
        }

        self.receive_slice(data)?;

        // CRC
        self.skip_byte()?;
        self.skip_byte()
    }

    /// End a multiple block read.
    fn stop_transmission(&self) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(commands::CMD12, 0x0000_0000)?;
        if r1.has_error() {
            warn!("Wrong response from CMD12: 0x{:02X}", r1.bits());
        }

        self.wait_busy_release()
    }

    /// End a multiple block write.
    fn stop_write(&self) -> Result<(), ErrorFor<Self>> {
        self.send(tokens::STOP_TRAN)?;
        self.skip_byte()?;
        self.wait_busy_release()
    }

    /// Start a multiple block write, retrying while the card is busy.
    fn start_write(&self, address: u32) -> Result<(), ErrorFor<Self>> {
        for attempt in 1..=Config::WRITE_COMMAND_ATTEMPTS {
            match self.send_command(commands::CMD25, address) {
                Ok(R1Response::READY_STATE) => return Ok(()),
                Ok(r1) if r1.has_error() => {
                    error!("Wrong response from CMD25: 0x{:02X}", r1.bits());
                    return Err(Error::CommandRejected(commands::CMD25, r1.bits()));
                }
                Ok(r1) => trace!("CMD25 response: 0x{:02X}, attempt: {}", r1.bits(), attempt),
                Err(Error::CommandTimedOut(_)) => {
                    trace!("No response from CMD25, attempt: {}", attempt)
                }
                Err(err) => return Err(err),
            }

            self.delay_ms(Config::WRITE_COMMAND_DELAY_MS);
        }

        error!("Card stayed busy for CMD25");

        Err(Error::WriteCommandRejected)
    }

    /// Write one data block with filler CRC and check the data response.
    fn write_data(&self, token: u8, data: &[u8]) -> Result<(), ErrorFor<Self>> {
        self.send(token)?;
        self.send_slice(data)?;
        self.send(tokens::FILLER)?;
        self.send(tokens::FILLER)?;

        let response = self.receive()?;
        if (response & tokens::DATA_RES_MASK) != tokens::DATA_RES_ACCEPTED {
            error!("Data response: 0x{:02X}", response);
            Err(Error::DataRejected(response))
        } else {
            Ok(())
        }
    }
}
