/// Represents config for [`SdMmcSpi`](crate::SdMmcSpi).
pub trait SdMmcSpiConfig {
    /// Filler bytes clocked with chip select deasserted before reset.
    const SYNC_CLOCK_BYTES: usize;
    /// Max bytes polled for an R1 response.
    const READ_R1_ATTEMPTS: usize;
    /// Max attempts of the operating condition negotiation.
    const NEGOTIATION_ATTEMPTS: usize;
    /// Delay after every negotiation attempt, in milliseconds.
    const NEGOTIATION_DELAY_MS: u32;
    /// Max attempts to start a multiple block write.
    const WRITE_COMMAND_ATTEMPTS: usize;
    /// Delay between attempts to start a multiple block write, in milliseconds.
    const WRITE_COMMAND_DELAY_MS: u32;
    /// Max bytes polled for a start block token.
    const TOKEN_WAIT_ATTEMPTS: usize;
    /// Max bytes polled for the card to release busy.
    const BUSY_RELEASE_ATTEMPTS: usize;
}

/// Default implementation of [`SdMmcSpiConfig`](crate::SdMmcSpiConfig).
pub struct DefaultSdMmcSpiConfig;

impl SdMmcSpiConfig for DefaultSdMmcSpiConfig {
    const SYNC_CLOCK_BYTES: usize = 10;
    const READ_R1_ATTEMPTS: usize = 8;
    const NEGOTIATION_ATTEMPTS: usize = 10;
    const NEGOTIATION_DELAY_MS: u32 = 20;
    const WRITE_COMMAND_ATTEMPTS: usize = 32;
    const WRITE_COMMAND_DELAY_MS: u32 = 5;
    const TOKEN_WAIT_ATTEMPTS: usize = 65_536;
    const BUSY_RELEASE_ATTEMPTS: usize = 262_144;
}
