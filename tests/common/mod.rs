#![allow(dead_code)]

//! Simulated SD card on the far side of the SPI bus.

use std::{
    cell::{Cell, Ref, RefCell, RefMut},
    collections::{HashMap, VecDeque},
    convert::Infallible,
    rc::Rc,
};

use embedded_hal::blocking::{delay::DelayMs, spi::Transfer};
use sdcard_spi::{CardState, DefaultSdMmcSpiConfig, SdMmcSpi, SdMmcSpiConfig, BLOCK_SIZE};
use switch_hal::OutputSwitch;

pub const OCR_POWERED_UP: u32 = 0x8000_0000;
pub const OCR_CCS: u32 = 0x4000_0000;
pub const OCR_WINDOW: u32 = 0x00FF_8000;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A received command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub arg: u32,
    pub crc: u8,
    pub app: bool,
}

#[derive(Debug)]
pub(crate) enum Mode {
    Command,
    Reading { next: u32 },
    Writing { next: u32, data: Option<Vec<u8>> },
}

/// Card behaviour and recorded traffic.
#[derive(Debug)]
pub struct CardModel {
    /// High capacity card, block addressed.
    pub high_capacity: bool,
    /// CMD8 is an illegal command.
    pub legacy: bool,
    /// CMD0 answer.
    pub reset_response: u8,
    /// CMD0 gets no answer at all.
    pub silent_reset: bool,
    /// ACMD41 answers busy this many times before the card is ready.
    pub busy_attempts: usize,
    /// CMD58 answer once the card is ready.
    pub ready_ocr_response: u8,
    /// CMD18 answer.
    pub read_response: u8,
    /// Filler bytes before every start block token.
    pub token_delay: usize,
    /// Sent instead of a start block token.
    pub data_error_token: Option<u8>,
    /// CRC bytes sent after every read block.
    pub read_crc: [u8; 2],
    /// CMD25 answers busy this many times before it is accepted.
    pub write_busy_answers: usize,
    /// CMD25 answer once it isn't busy.
    pub write_response: u8,
    /// Data response token after every written block.
    pub data_response: u8,
    /// Busy bytes after a written block or a stop.
    pub busy_cycles: usize,
    /// Never release busy after a stop.
    pub hold_busy: bool,

    pub blocks: HashMap<u32, [u8; BLOCK_SIZE]>,
    pub commands: Vec<Command>,
    pub write_crcs: Vec<[u8; 2]>,
    pub unselected_bytes: usize,

    pub(crate) selected: Rc<Cell<bool>>,
    pub(crate) ready: bool,
    pub(crate) app_cmd: bool,
    pub(crate) stuck_busy: bool,
    pub(crate) frame: Vec<u8>,
    pub(crate) out: VecDeque<u8>,
    pub(crate) mode: Mode,
}

impl CardModel {
    pub fn sdhc() -> Self {
        CardModel {
            high_capacity: true,
            legacy: false,
            reset_response: 0x01,
            silent_reset: false,
            busy_attempts: 2,
            ready_ocr_response: 0x00,
            read_response: 0x00,
            token_delay: 3,
            data_error_token: None,
            read_crc: [0x12, 0x34],
            write_busy_answers: 0,
            write_response: 0x00,
            data_response: 0xE5,
            busy_cycles: 4,
            hold_busy: false,
            blocks: HashMap::new(),
            commands: Vec::new(),
            write_crcs: Vec::new(),
            unselected_bytes: 0,
            selected: Rc::new(Cell::new(false)),
            ready: false,
            app_cmd: false,
            stuck_busy: false,
            frame: Vec::new(),
            out: VecDeque::new(),
            mode: Mode::Command,
        }
    }

    pub fn sdsc() -> Self {
        CardModel {
            high_capacity: false,
            ..Self::sdhc()
        }
    }

    /// Opcodes in the order they were received.
    pub fn opcodes(&self) -> Vec<u8> {
        self.commands.iter().map(|c| c.opcode).collect()
    }

    /// Received commands with `opcode`.
    pub fn commands_of(&self, opcode: u8) -> Vec<Command> {
        self.commands
            .iter()
            .copied()
            .filter(|c| c.opcode == opcode)
            .collect()
    }

    pub fn fill_block(&mut self, index: u32, seed: u8) {
        self.blocks.insert(index, pattern(seed));
    }

    fn ocr(&self) -> u32 {
        match (self.ready, self.high_capacity) {
            (false, _) => OCR_WINDOW,
            (true, false) => OCR_POWERED_UP | OCR_WINDOW,
            (true, true) => OCR_POWERED_UP | OCR_CCS | OCR_WINDOW,
        }
    }

    fn idle_response(&self) -> u8 {
        if self.ready {
            0x00
        } else {
            0x01
        }
    }

    fn block_index(&self, address: u32) -> u32 {
        if self.high_capacity {
            address
        } else {
            assert_eq!(address % 512, 0, "unaligned byte address {}", address);
            address / 512
        }
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected.get() {
            self.unselected_bytes += 1;
            return 0xFF;
        }

        let miso = self.next_out();
        self.consume(mosi);
        miso
    }

    fn next_out(&mut self) -> u8 {
        if let Some(byte) = self.out.pop_front() {
            return byte;
        }

        if let Mode::Reading { next } = self.mode {
            self.queue_block(next);
            self.mode = Mode::Reading { next: next + 1 };
            return self.out.pop_front().unwrap_or(0xFF);
        }

        if self.stuck_busy {
            0x00
        } else {
            0xFF
        }
    }

    fn queue_block(&mut self, index: u32) {
        self.out.extend(std::iter::repeat(0xFF).take(self.token_delay));

        if let Some(token) = self.data_error_token {
            self.out.push_back(token);
            return;
        }

        let block = self.blocks.get(&index).copied().unwrap_or([0; BLOCK_SIZE]);
        self.out.push_back(0xFE);
        self.out.extend(block.iter().copied());
        self.out.extend(self.read_crc.iter().copied());
    }

    fn consume(&mut self, mosi: u8) {
        if let Mode::Writing { .. } = self.mode {
            self.consume_write(mosi);
            return;
        }

        if self.frame.is_empty() && mosi & 0xC0 != 0x40 {
            return;
        }

        self.frame.push(mosi);
        if self.frame.len() == 6 {
            let frame = std::mem::take(&mut self.frame);
            self.execute(&frame);
        }
    }

    fn consume_write(&mut self, mosi: u8) {
        let Mode::Writing { next, data } = &mut self.mode else {
            return;
        };

        match data {
            None => match mosi {
                0xFC => *data = Some(Vec::with_capacity(BLOCK_SIZE + 2)),
                0xFD => {
                    self.mode = Mode::Command;
                    self.queue_release(true);
                }
                _ => {}
            },
            Some(buf) => {
                buf.push(mosi);
                if buf.len() == BLOCK_SIZE + 2 {
                    let mut block = [0; BLOCK_SIZE];
                    block.copy_from_slice(&buf[..BLOCK_SIZE]);
                    let crc = [buf[BLOCK_SIZE], buf[BLOCK_SIZE + 1]];
                    let index = *next;

                    *next += 1;
                    *data = None;

                    self.blocks.insert(index, block);
                    self.write_crcs.push(crc);
                    self.out.push_back(self.data_response);
                    self.queue_release(false);
                }
            }
        }
    }

    /// Busy bytes, then the bus is released unless the card hangs.
    fn queue_release(&mut self, after_stop: bool) {
        if after_stop {
            self.out.push_back(0xFF);
        }
        self.out.extend(std::iter::repeat(0x00).take(self.busy_cycles));
        if after_stop && self.hold_busy {
            self.stuck_busy = true;
        }
    }

    fn execute(&mut self, frame: &[u8]) {
        let command = Command {
            opcode: frame[0] & 0x3F,
            arg: u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]),
            crc: frame[5],
            app: std::mem::take(&mut self.app_cmd),
        };
        self.commands.push(command);

        let arg = command.arg.to_be_bytes();
        let response: Vec<u8> = match (command.opcode, command.app) {
            (0, _) => {
                self.ready = false;
                if self.silent_reset {
                    vec![]
                } else {
                    vec![self.reset_response]
                }
            }
            (8, _) if self.legacy => vec![0x05],
            (8, _) => vec![0x01, 0x00, 0x00, arg[2], arg[3]],
            (55, _) => {
                self.app_cmd = true;
                vec![self.idle_response()]
            }
            (41, true) => {
                if self.busy_attempts > 0 {
                    self.busy_attempts -= 1;
                } else {
                    self.ready = true;
                }
                vec![self.idle_response()]
            }
            (58, _) => {
                let r1 = if self.ready {
                    self.ready_ocr_response
                } else {
                    0x01
                };
                let mut response = vec![r1];
                response.extend_from_slice(&self.ocr().to_be_bytes());
                response
            }
            (18, _) => {
                if self.read_response == 0x00 {
                    self.mode = Mode::Reading {
                        next: self.block_index(command.arg),
                    };
                }
                vec![self.read_response]
            }
            (12, _) => {
                self.mode = Mode::Command;
                self.out.clear();
                // Stuff byte, then R1.
                self.out.push_back(0xFF);
                self.out.push_back(0x00);
                self.out.extend(std::iter::repeat(0x00).take(self.busy_cycles));
                if self.hold_busy {
                    self.stuck_busy = true;
                }
                return;
            }
            (25, _) => {
                if self.write_busy_answers > 0 {
                    self.write_busy_answers -= 1;
                    vec![0x01]
                } else {
                    if self.write_response == 0x00 {
                        self.mode = Mode::Writing {
                            next: self.block_index(command.arg),
                            data: None,
                        };
                    }
                    vec![self.write_response]
                }
            }
            _ => vec![0x04],
        };

        // One byte of response latency.
        self.out.push_back(0xFF);
        self.out.extend(response);
    }
}

/// Card handle given to the driver as its SPI bus.
#[derive(Clone)]
pub struct SimCard(Rc<RefCell<CardModel>>);

impl SimCard {
    pub fn model(&self) -> Ref<'_, CardModel> {
        self.0.borrow()
    }

    pub fn model_mut(&self) -> RefMut<'_, CardModel> {
        self.0.borrow_mut()
    }
}

impl Transfer<u8> for SimCard {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut card = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }
        Ok(words)
    }
}

/// Chip select recording every level it is driven to.
#[derive(Clone)]
pub struct SimSelect {
    selected: Rc<Cell<bool>>,
    pub events: Rc<RefCell<Vec<bool>>>,
}

impl SimSelect {
    pub fn is_selected(&self) -> bool {
        self.selected.get()
    }
}

impl OutputSwitch for SimSelect {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        self.selected.set(true);
        self.events.borrow_mut().push(true);
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        self.selected.set(false);
        self.events.borrow_mut().push(false);
        Ok(())
    }
}

/// Delay recording every requested duration.
#[derive(Clone, Default)]
pub struct RecordingDelay(pub Rc<RefCell<Vec<u32>>>);

impl DelayMs<u32> for RecordingDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.0.borrow_mut().push(ms);
    }
}

/// Timeouts small enough to exhaust in a test.
pub struct FastTimeouts;

impl SdMmcSpiConfig for FastTimeouts {
    const SYNC_CLOCK_BYTES: usize = 10;
    const READ_R1_ATTEMPTS: usize = 8;
    const NEGOTIATION_ATTEMPTS: usize = 10;
    const NEGOTIATION_DELAY_MS: u32 = 20;
    const WRITE_COMMAND_ATTEMPTS: usize = 4;
    const WRITE_COMMAND_DELAY_MS: u32 = 5;
    const TOKEN_WAIT_ATTEMPTS: usize = 64;
    const BUSY_RELEASE_ATTEMPTS: usize = 64;
}

pub type SimSd<C = DefaultSdMmcSpiConfig> = SdMmcSpi<SimCard, SimSelect, RecordingDelay, C>;

/// Driver wired to a simulated card, with handles to inspect both sides.
pub struct Bench {
    pub card: SimCard,
    pub select: SimSelect,
    pub delay: RecordingDelay,
}

impl Bench {
    pub fn new(mut model: CardModel) -> Self {
        init_logger();

        let selected = Rc::new(Cell::new(false));
        model.selected = selected.clone();

        Bench {
            card: SimCard(Rc::new(RefCell::new(model))),
            select: SimSelect {
                selected,
                events: Rc::default(),
            },
            delay: RecordingDelay::default(),
        }
    }

    pub fn driver<C: SdMmcSpiConfig>(&self) -> SimSd<C> {
        SdMmcSpi::new(self.card.clone(), self.select.clone(), self.delay.clone())
    }

    /// Driver with a completed initialization.
    pub fn initialized<C: SdMmcSpiConfig>(&self) -> (SimSd<C>, CardState) {
        let sd = self.driver::<C>();
        let state = sd.try_init().expect("card initializes");
        self.delay.0.borrow_mut().clear();
        self.card.model_mut().commands.clear();
        (sd, state)
    }

    pub fn delays(&self) -> Vec<u32> {
        self.delay.0.borrow().clone()
    }
}

/// Block content derived from `seed`.
pub fn pattern(seed: u8) -> [u8; BLOCK_SIZE] {
    let mut block = [0; BLOCK_SIZE];
    for (i, byte) in block.iter_mut().enumerate() {
        *byte = seed.wrapping_mul(31).wrapping_add(i as u8) ^ (i >> 8) as u8;
    }
    block
}

/// `count` consecutive pattern blocks.
pub fn pattern_blocks(first_seed: u8, count: usize) -> Vec<u8> {
    (0..count)
        .flat_map(|n| pattern(first_seed.wrapping_add(n as u8)))
        .collect()
}
