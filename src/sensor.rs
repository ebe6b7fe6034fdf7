//! Distance sensor input.
//!
//! TF-Luna UART frames are 9 bytes:
//!
//! ```text
//!   0x59 0x59 dist_lo dist_hi amp_lo amp_hi temp_lo temp_hi checksum
//! ```
//!
//! with `checksum` the low byte of the sum of the first eight. The parser
//! resynchronises on the double header, so it can join a stream mid-frame.

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::time::Duration;

const HEADER: u8 = 0x59;
const FRAME_LEN: usize = 9;
const READ_CHUNK: usize = 64;
const SYNTHETIC_PERIOD: Duration = Duration::from_millis(20);

/// One decoded sensor reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TfLunaFrame {
    pub distance_cm: u32,
    pub strength: u16,
    pub temperature_c: f32,
}

/// Source of distance samples. `Ok(None)` means no sample arrived within the
/// read timeout.
pub trait DistanceSensor: Send {
    fn read_distance(&mut self) -> Result<Option<u32>>;
}

#[derive(Debug, Default)]
pub struct TfLunaParser {
    frame: Vec<u8>,
    bad_checksums: u64,
}

impl TfLunaParser {
    pub fn new() -> Self {
        Self {
            frame: Vec::with_capacity(FRAME_LEN),
            bad_checksums: 0,
        }
    }

    pub fn bad_checksums(&self) -> u64 {
        self.bad_checksums
    }

    pub fn feed(&mut self, byte: u8) -> Option<TfLunaFrame> {
        match self.frame.len() {
            0 | 1 if byte != HEADER => {
                self.frame.clear();
                return None;
            }
            _ => self.frame.push(byte),
        }
        if self.frame.len() < FRAME_LEN {
            return None;
        }

        let frame = std::mem::take(&mut self.frame);
        let sum = frame[..FRAME_LEN - 1]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != frame[FRAME_LEN - 1] {
            self.bad_checksums += 1;
            log::debug!("tf-luna: checksum mismatch, resyncing");
            // The real frame might start at a later header byte. The replay is
            // shorter than a frame, so it can only rebuild a partial one.
            for &b in &frame[2..] {
                let _ = self.feed(b);
            }
            return None;
        }
        let raw_temp = u16::from_le_bytes([frame[6], frame[7]]);
        Some(TfLunaFrame {
            distance_cm: u16::from_le_bytes([frame[2], frame[3]]) as u32,
            strength: u16::from_le_bytes([frame[4], frame[5]]),
            temperature_c: raw_temp as f32 / 8.0 - 256.0,
        })
    }
}

/// TF-Luna over any byte stream (serial port, pipe, test buffer).
pub struct TfLuna<R> {
    reader: R,
    parser: TfLunaParser,
    pending: VecDeque<TfLunaFrame>,
}

impl<R: Read> TfLuna<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: TfLunaParser::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<TfLunaFrame>> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        let mut buf = [0u8; READ_CHUNK];
        let n = match self.reader.read(&mut buf) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                ) =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e).context("tf-luna read failed"),
        };
        for &byte in &buf[..n] {
            if let Some(frame) = self.parser.feed(byte) {
                self.pending.push_back(frame);
            }
        }
        Ok(self.pending.pop_front())
    }
}

impl<R: Read + Send> DistanceSensor for TfLuna<R> {
    fn read_distance(&mut self) -> Result<Option<u32>> {
        Ok(self.next_frame()?.map(|frame| frame.distance_cm))
    }
}

/// Replays a fixed distance pattern (`stub://80,80,40,...`), one sample per 20 ms.
pub struct SyntheticSensor {
    pattern: Vec<u32>,
    index: usize,
}

impl SyntheticSensor {
    pub fn parse(uri: &str) -> Result<Self> {
        let body = uri.trim_start_matches("stub://");
        let pattern = body
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| anyhow!("invalid synthetic distance '{}'", part))
            })
            .collect::<Result<Vec<_>>>()?;
        if pattern.is_empty() {
            return Err(anyhow!("synthetic sensor needs at least one distance"));
        }
        Ok(Self { pattern, index: 0 })
    }
}

impl DistanceSensor for SyntheticSensor {
    fn read_distance(&mut self) -> Result<Option<u32>> {
        std::thread::sleep(SYNTHETIC_PERIOD);
        let value = self.pattern[self.index % self.pattern.len()];
        self.index += 1;
        Ok(Some(value))
    }
}

/// Open the configured sensor: `stub://` patterns or a TF-Luna serial device.
pub fn open_sensor(device: &Path, baud: u32) -> Result<Box<dyn DistanceSensor>> {
    let name = device.to_string_lossy();
    if name.starts_with("stub://") {
        return Ok(Box::new(SyntheticSensor::parse(&name)?));
    }
    let port = open_serial(device, baud)?;
    log::info!("tf-luna: opened {} at {} baud", device.display(), baud);
    Ok(Box::new(TfLuna::new(port)))
}

/// Open a serial device in raw 8N1 mode with a 100 ms read timeout.
#[cfg(target_os = "linux")]
pub fn open_serial(path: &Path, baud: u32) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    let speed = baud_constant(baud)?;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
        .with_context(|| format!("failed to open serial device {}", path.display()))?;
    let fd = file.as_raw_fd();

    // SAFETY: `fd` is a valid descriptor owned by `file` for the duration of
    // these calls, and `tio` is fully initialised by tcgetattr before use.
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("{} is not a terminal device", path.display()));
        }
        libc::cfmakeraw(&mut tio);
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = 1;
        if libc::cfsetispeed(&mut tio, speed) != 0 || libc::cfsetospeed(&mut tio, speed) != 0 {
            return Err(std::io::Error::last_os_error()).context("failed to set serial speed");
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(std::io::Error::last_os_error())
                .context("failed to configure serial device");
        }
        libc::tcflush(fd, libc::TCIFLUSH);
    }
    Ok(file)
}

#[cfg(not(target_os = "linux"))]
pub fn open_serial(path: &Path, baud: u32) -> Result<File> {
    log::warn!(
        "serial configuration unsupported on this platform; opening {} as-is ({} baud ignored)",
        path.display(),
        baud
    );
    File::open(path).with_context(|| format!("failed to open serial device {}", path.display()))
}

#[cfg(target_os = "linux")]
fn baud_constant(baud: u32) -> Result<libc::speed_t> {
    Ok(match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        921_600 => libc::B921600,
        other => return Err(anyhow!("unsupported baud rate {}", other)),
    })
}
