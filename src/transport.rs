//! Byte-stream link to the board and the command/response framing on top of it.
//!
//! Every command is three bytes: a two-byte little-endian data word followed by
//! a one-byte head (the opcode). Commands are either written without feedback,
//! or written and followed by a blocking read of a fixed number of response
//! bytes. There is no retry and no pipelining: one exchange at a time.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use serialport::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits,
};

use crate::config::AUTO_LINK;
use crate::errors::{ConfigError, ProtocolError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Serial baud rate of the board's USB CDC interface.
pub const BAUD_RATE: u32 = 115_200;

/// Read timeout of the link; bounds every blocking read.
pub const LINK_TIMEOUT: Duration = Duration::from_secs(1);

/// USB identifiers of the board's microcontroller.
pub const USB_VID: u16 = 0x2E8A;
pub const USB_PID: u16 = 0x0009;

pub const HEAD_BYTES: usize = 1;
pub const DATA_BYTES: usize = 2;
/// Total length of one command transmission.
pub const COMMAND_LEN: usize = HEAD_BYTES + DATA_BYTES;

// ============================================================================
// Link abstraction
// ============================================================================

/// A point-to-point byte stream. Reads block for at most the link timeout.
///
/// The acquisition reader needs its own handle while the controller keeps
/// issuing commands, so links must be clonable into independent handles on
/// the same underlying stream.
pub trait Link: Read + Write + Send {
    fn try_clone_link(&self) -> io::Result<Box<dyn Link>>;

    /// Discard bytes received but not yet read, on every handle of the stream.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Serial port link (8N1, no flow control).
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open a serial port by path, or look the board up when `link` is `"AUTOCOM"`.
    pub fn open(link: &str) -> Result<Self> {
        let path = if link == AUTO_LINK {
            find_device_port()?
        } else {
            link.to_string()
        };

        let port = serialport::new(&path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(LINK_TIMEOUT)
            .open()?;

        // The board resets its CDC stack when the port opens.
        thread::sleep(2 * LINK_TIMEOUT);
        info!("serial link open: port={}, baud={}", path, BAUD_RATE);
        Ok(Self { port })
    }

    pub fn name(&self) -> Option<String> {
        self.port.name()
    }
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Link for SerialLink {
    fn try_clone_link(&self) -> io::Result<Box<dyn Link>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SerialLink { port }))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Find the serial port of the board by its USB VID/PID.
pub fn find_device_port() -> Result<String> {
    let ports = serialport::available_ports()?;
    let found = ports.iter().find_map(|p| match &p.port_type {
        SerialPortType::UsbPort(usb) if usb.vid == USB_VID && usb.pid == USB_PID => {
            Some(p.port_name.clone())
        }
        _ => None,
    });

    match found {
        Some(name) => {
            debug!("auto-detected board on {}", name);
            Ok(name)
        }
        None => {
            let available = ports
                .iter()
                .map(|p| match &p.port_type {
                    SerialPortType::UsbPort(usb) => {
                        format!("{} ({:04X}:{:04X})", p.port_name, usb.vid, usb.pid)
                    }
                    _ => p.port_name.clone(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            Err(ConfigError::DeviceNotFound {
                vid: USB_VID,
                pid: USB_PID,
                available,
            }
            .into())
        }
    }
}

/// Read up to `n` bytes, stopping early when the link times out or closes.
///
/// A short result is not an error here; callers decide what a short read means.
pub fn read_up_to(link: &mut dyn Read, n: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        match link.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(k) => filled += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                break
            }
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

// ============================================================================
// Command transport
// ============================================================================

/// Build the on-wire bytes of a command: `data (LE) ++ head`.
pub fn encode_command(head: u8, data: u32) -> std::result::Result<[u8; COMMAND_LEN], ProtocolError> {
    let data = u16::try_from(data).map_err(|_| ProtocolError::PayloadOverflow {
        value: data,
        width: DATA_BYTES,
    })?;
    let [lo, hi] = data.to_le_bytes();
    Ok([lo, hi, head])
}

/// Single-exchange command channel over a [`Link`]. Callers serialize access.
pub struct CommandTransport {
    link: Box<dyn Link>,
}

impl CommandTransport {
    pub fn new(link: Box<dyn Link>) -> Self {
        Self { link }
    }

    /// Transmit a command without waiting for any response.
    pub fn write_without_feedback(&mut self, head: u8, data: u32) -> Result<()> {
        let command = encode_command(head, data)?;
        self.link.write_all(&command)?;
        self.link.flush()?;
        debug!("tx head={} data={} (no feedback)", head, data);
        Ok(())
    }

    /// Transmit a command and read back `response_len` bytes (the command
    /// length when `None`). A short response is a protocol error.
    pub fn write_with_feedback(
        &mut self,
        head: u8,
        data: u32,
        response_len: Option<usize>,
    ) -> Result<Vec<u8>> {
        let command = encode_command(head, data)?;
        self.link.write_all(&command)?;
        self.link.flush()?;
        let expected = response_len.unwrap_or(command.len());
        let response = self.read(expected)?;
        debug!("tx head={} data={} -> rx {:02X?}", head, data, response);
        Ok(response)
    }

    /// Read exactly `n` bytes following an earlier command.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let response = read_up_to(&mut self.link, n)?;
        if response.len() != n {
            return Err(ProtocolError::ShortResponse {
                expected: n,
                actual: response.len(),
            }
            .into());
        }
        Ok(response)
    }

    /// Independent handle on the same link, for the streaming reader.
    pub fn try_clone_link(&self) -> io::Result<Box<dyn Link>> {
        self.link.try_clone_link()
    }
}

// ============================================================================
// Test link
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};

    use super::Link;

    #[derive(Default)]
    struct Wire {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    /// In-memory link: bytes queued with `push_rx` are read back, writes are
    /// recorded. An empty receive queue behaves like a link timeout.
    #[derive(Clone, Default)]
    pub struct ScriptedLink {
        wire: Arc<Mutex<Wire>>,
    }

    impl ScriptedLink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_rx(&self, bytes: &[u8]) {
            self.wire.lock().unwrap().rx.extend(bytes.iter().copied());
        }

        pub fn written(&self) -> Vec<u8> {
            self.wire.lock().unwrap().tx.clone()
        }

        /// Written bytes grouped into 3-byte commands as `(head, data)`.
        pub fn commands(&self) -> Vec<(u8, u16)> {
            self.written()
                .chunks(super::COMMAND_LEN)
                .map(|c| (c[2], u16::from_le_bytes([c[0], c[1]])))
                .collect()
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut wire = self.wire.lock().unwrap();
            if wire.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "scripted timeout"));
            }
            let n = buf.len().min(wire.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = wire.rx.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.wire.lock().unwrap().tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Link for ScriptedLink {
        fn try_clone_link(&self) -> io::Result<Box<dyn Link>> {
            Ok(Box::new(self.clone()))
        }

        // Scripts queue their bytes before a session starts.
        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
