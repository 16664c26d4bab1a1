//! Raw evdev input reader.
//!
//! A blocking thread parses the 16-byte event records (32-bit time fields on
//! this platform) and folds them into touch samples and power-button edges,
//! delivered over bounded channels. All channels close when the device hits
//! EOF or a hard read error; a final error is written first when there is
//! one.

use std::{
    fs,
    io::{self, Read},
    path::Path,
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {tokio::sync::mpsc, tracing::warn};

pub const EV_SYN: u16 = 0;
pub const EV_KEY: u16 = 1;
pub const EV_ABS: u16 = 3;

pub const ABS_X: u16 = 0;
pub const ABS_Y: u16 = 1;

pub const BTN_TOOL_FINGER: u16 = 325;
pub const BTN_TOUCH: u16 = 330;
pub const KEY_POWER: u16 = 116;

pub const INPUT_EVENT_SIZE: usize = 16;

const TOUCH_CHANNEL_CAP: usize = 16;
const POWER_CHANNEL_CAP: usize = 4;
const ERROR_CHANNEL_CAP: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub sec: i32,
    pub usec: i32,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub fn parse(buf: &[u8; INPUT_EVENT_SIZE]) -> Self {
        Self {
            sec: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            usec: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            kind: u16::from_le_bytes([buf[8], buf[9]]),
            code: u16::from_le_bytes([buf[10], buf[11]]),
            value: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }

    pub fn timestamp(&self) -> SystemTime {
        let secs = self.sec.max(0) as u64;
        let micros = self.usec.max(0) as u64;
        UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(micros)
    }
}

/// One flushed touch sample (position plus contact state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchEvent {
    pub x: i32,
    pub y: i32,
    pub down: bool,
    pub at: SystemTime,
}

/// Power-button edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerEvent {
    pub pressed: bool,
    pub at: SystemTime,
}

pub struct InputStreams {
    pub touch: mpsc::Receiver<TouchEvent>,
    pub power: mpsc::Receiver<PowerEvent>,
    pub errors: mpsc::Receiver<io::Error>,
}

pub struct InputDevice {
    file: fs::File,
}

impl InputDevice {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            file: fs::File::open(path)?,
        })
    }

    /// Spawn the blocking reader thread and hand back the event channels.
    pub fn read_events(self) -> InputStreams {
        let (touch_tx, touch_rx) = mpsc::channel(TOUCH_CHANNEL_CAP);
        let (power_tx, power_rx) = mpsc::channel(POWER_CHANNEL_CAP);
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAP);
        thread::spawn(move || run_reader(self.file, touch_tx, power_tx, error_tx));
        InputStreams {
            touch: touch_rx,
            power: power_rx,
            errors: error_rx,
        }
    }
}

fn run_reader<R: Read>(
    mut reader: R,
    touch_tx: mpsc::Sender<TouchEvent>,
    power_tx: mpsc::Sender<PowerEvent>,
    error_tx: mpsc::Sender<io::Error>,
) {
    let mut current_x = 0;
    let mut current_y = 0;
    let mut touching = false;
    let mut dirty = false;
    let mut buf = [0u8; INPUT_EVENT_SIZE];
    loop {
        match read_record(&mut reader, &mut buf) {
            Ok(false) => return,
            Ok(true) => {},
            Err(err) => {
                warn!(error = %err, "input device read failed");
                let _ = error_tx.blocking_send(err);
                return;
            },
        }
        let event = InputEvent::parse(&buf);
        match event.kind {
            EV_ABS => match event.code {
                ABS_X => {
                    current_x = event.value;
                    dirty = true;
                },
                ABS_Y => {
                    current_y = event.value;
                    dirty = true;
                },
                _ => {},
            },
            EV_KEY => match event.code {
                BTN_TOUCH | BTN_TOOL_FINGER => {
                    touching = event.value != 0;
                    dirty = true;
                },
                KEY_POWER => {
                    let power = PowerEvent {
                        pressed: event.value != 0,
                        at: event.timestamp(),
                    };
                    if power_tx.blocking_send(power).is_err() {
                        return;
                    }
                },
                _ => {},
            },
            EV_SYN => {
                if dirty {
                    let touch = TouchEvent {
                        x: current_x,
                        y: current_y,
                        down: touching,
                        at: event.timestamp(),
                    };
                    if touch_tx.blocking_send(touch).is_err() {
                        return;
                    }
                    dirty = false;
                }
            },
            _ => {},
        }
    }
}

/// Fill one 16-byte record. `Ok(false)` is a clean end-of-stream; EOF in the
/// middle of a record is an error.
fn read_record<R: Read>(
    reader: &mut R,
    buf: &mut [u8; INPUT_EVENT_SIZE],
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < INPUT_EVENT_SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated input event",
                ))
            },
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}
