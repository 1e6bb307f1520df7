//! Power-up negotiation.

use crate::{
    card::{AddressingMode, CardState},
    config::SdMmcSpiConfig,
    consts::{args, commands, tokens},
    response::{if_cond_accepted, Ocr, R1Response},
    Error, ErrorFor, SdMmcSpi,
};

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info, trace, warn};
use embedded_hal::blocking::{delay::DelayMs, spi::Transfer};
#[cfg(feature = "log")]
use log::{debug, error, info, trace, warn};
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
    /// Initialize the card and negotiate its addressing mode.
    ///
    /// # Panics
    ///
    /// Halts if the card never leaves the idle state within the negotiation
    /// budget: no card is present or it doesn't work. Use
    /// [`try_init`](Self::try_init) to get that as an error instead.
    pub fn init(&self) -> Result<CardState, ErrorFor<Self>> {
        match self.try_init() {
            Err(Error::NegotiationTimedOut) => {
                error!("SD card is not functional, halting");
                panic!("SD card never left the idle state");
            }
            result => result,
        }
    }

    /// Initialize the card and negotiate its addressing mode.
    ///
    /// Reset, interface condition and the first OCR read only log their
    /// failures, some cards don't implement them properly. Everything from
    /// the negotiation on fails the initialization.
    pub fn try_init(&self) -> Result<CardState, ErrorFor<Self>> {
        info!("SD initialize started");

        self.unselect()?;

        for _ in 0..Config::SYNC_CLOCK_BYTES {
            self.send(tokens::FILLER)?;
        }

        let state = self.cs_scope(|s| {
            Self::advisory(s.go_idle())?;
            Self::advisory(s.send_if_cond())?;
            Self::advisory(s.probe_ocr())?;
            s.send_op_cond()?;
            s.read_addressing_mode()
        })?;

        info!(
            "SD successfully initialized, addressing mode: {:?}",
            state.addressing_mode()
        );

        Ok(state)
    }

    /// Keep bus failures, drop protocol failures of an advisory stage.
    fn advisory(result: Result<(), ErrorFor<Self>>) -> Result<(), ErrorFor<Self>> {
        match result {
            Err(err @ (Error::Transport(_) | Error::SelectError(_))) => Err(err),
            _ => Ok(()),
        }
    }

    /// Reset the card into the idle state.
    fn go_idle(&self) -> Result<(), ErrorFor<Self>> {
        info!("Resetting SD card");

        match self.send_command(commands::CMD0, 0x0000_0000) {
            Ok(R1Response::IN_IDLE_STATE) => Ok(()),
            Ok(r1) => {
                warn!("Wrong response from CMD0: 0x{:02X}", r1.bits());
                Err(Error::CommandRejected(commands::CMD0, r1.bits()))
            }
            Err(err) => {
                if let Error::CommandTimedOut(_) = err {
                    warn!("No response from CMD0");
                }
                Err(err)
            }
        }
    }

    /// Verify SD Memory Card interface operating condition.
    fn send_if_cond(&self) -> Result<(), ErrorFor<Self>> {
        info!("Verifying SD Memory Card interface operating condition");

        let r1 = match self.send_command(commands::CMD8, args::IF_COND) {
            Err(Error::CommandTimedOut(cmd)) => {
                warn!("No response from CMD8");
                return Err(Error::CommandTimedOut(cmd));
            }
            result => result?,
        };
        let echo = self.read_register_echo()?;

        if r1 != R1Response::IN_IDLE_STATE {
            warn!("Wrong response from CMD8: 0x{:02X}", r1.bits());
        }

        if !if_cond_accepted(&echo) {
            warn!(
                "Interface condition echo mismatch: {:02X} {:02X} {:02X} {:02X}",
                echo[0], echo[1], echo[2], echo[3]
            );
            return Err(Error::VoltageRangeUnsupported);
        }

        Ok(())
    }

    /// Read the OCR before negotiation, for diagnostics.
    fn probe_ocr(&self) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(commands::CMD58, 0x0000_0000)?;
        let ocr = Ocr::from(self.read_register_echo()?);

        debug!("OCR value: 0x{:08X}", ocr.bits());

        if r1.has_error() {
            warn!("Wrong response from CMD58: 0x{:02X}", r1.bits());
            return Err(Error::CapacityQueryFailed(r1.bits()));
        }

        if !ocr.supports_full_window() {
            warn!("Card voltage window: 0x{:03X}", ocr.voltage_window());
        }

        Ok(())
    }

    /// Sends host capacity support information until the card leaves the
    /// idle state.
    ///
    /// Every attempt is followed by the negotiation delay, the card
    /// initializes asynchronously and answers busy when polled faster.
    fn send_op_cond(&self) -> Result<(), ErrorFor<Self>> {
        info!("Sending host capacity support information and activates");

        for attempt in 1..=Config::NEGOTIATION_ATTEMPTS {
            let response = self.send_command(commands::ACMD41, args::ACMD41_HCS);

            self.delay_ms(Config::NEGOTIATION_DELAY_MS);

            match response {
                Ok(R1Response::READY_STATE) => {
                    debug!("Card left idle state, attempt: {}", attempt);
                    return Ok(());
                }
                Ok(r1) => trace!("ACMD41 response: 0x{:02X}, attempt: {}", r1.bits(), attempt),
                Err(Error::CommandTimedOut(cmd)) => {
                    trace!("No response from CMD{}, attempt: {}", cmd, attempt)
                }
                Err(err) => return Err(err),
            }
        }

        error!(
            "Failed to initialize SD card after {} attempts",
            Config::NEGOTIATION_ATTEMPTS
        );

        Err(Error::NegotiationTimedOut)
    }

    /// Read the card capacity status and decide the addressing mode.
    fn read_addressing_mode(&self) -> Result<CardState, ErrorFor<Self>> {
        let r1 = self.send_command(commands::CMD58, 0x0000_0000)?;
        let ocr = Ocr::from(self.read_register_echo()?);

        debug!("OCR value: 0x{:08X}", ocr.bits());

        if r1 != R1Response::READY_STATE {
            error!("Wrong response from CMD58: 0x{:02X}", r1.bits());
            return Err(Error::CapacityQueryFailed(r1.bits()));
        }

        if !ocr.power_up_status() {
            warn!("Card capacity status read before power up finished");
        }

        Ok(CardState::new(AddressingMode::from(ocr)))
    }
}
