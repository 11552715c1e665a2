//! # M-Bus Serial Communication
//!
//! This module provides the [`BusTransport`] implementation for a wired M-Bus
//! level converter attached to a serial port: connecting to the port, sending
//! frames, classifying whatever comes back and purging the line.
//!
//! The transport is generic over [`SerialPort`] so the same receive logic runs
//! against a real `tokio_serial::SerialStream` and against
//! [`MockSerialPort`](crate::mbus::serial_mock::MockSerialPort) in tests.

use crate::constants::{MBUS_FRAME_ACK_START, MBUS_FRAME_LONG_START, MBUS_FRAME_SHORT_START};
use crate::error::MBusError;
use crate::mbus::frame::{pack_frame, parse_frame, verify_frame, MBusFrame};
use crate::mbus::transport::{BusTransport, RecvResult};
use crate::util::logging::log_frame_hex;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

pub use tokio_serial::Parity;

/// Lowest baud rate accepted by the transport.
pub const MIN_BAUDRATE: u32 = 300;

/// Rates commonly used by wired M-Bus slaves.
pub const STANDARD_BAUDRATES: [u32; 3] = [300, 2400, 9600];

/// Upper bound on reads per purge so a babbling line cannot stall the master.
const MAX_PURGE_READS: usize = 64;

/// Configuration for serial connection.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baudrate: u32,
    pub parity: Parity,
    /// Port level I/O timeout handed to the OS driver.
    pub timeout: Duration,
    /// Overrides the baud derived response timeout.
    pub recv_timeout: Option<Duration>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            baudrate: 2400,
            parity: Parity::Even,
            timeout: Duration::from_secs(5),
            recv_timeout: None,
        }
    }
}

/// How long to wait for a slave to start answering at `baudrate`.
pub fn response_timeout_for(baudrate: u32) -> Duration {
    match baudrate {
        300 => Duration::from_millis(1300),
        600 => Duration::from_millis(800),
        1200 => Duration::from_millis(500),
        2400 | 4800 => Duration::from_millis(300),
        b if b >= 9600 => Duration::from_millis(200),
        _ => Duration::from_millis(500),
    }
}

/// Byte stream with adjustable line settings.
pub trait SerialPort: AsyncRead + AsyncWrite + Unpin + Send {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;
    fn set_parity(&mut self, parity: Parity) -> io::Result<()>;
}

impl SerialPort for SerialStream {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        tokio_serial::SerialPort::set_baud_rate(self, baud_rate).map_err(io::Error::from)
    }

    fn set_parity(&mut self, parity: Parity) -> io::Result<()> {
        tokio_serial::SerialPort::set_parity(self, parity).map_err(io::Error::from)
    }
}

/// Serial line handle implementing the bus primitives.
pub struct SerialTransport<P: SerialPort = SerialStream> {
    port: P,
    config: SerialConfig,
}

impl SerialTransport<SerialStream> {
    /// Opens `port_name` with the default settings (2400 baud, 8E1).
    pub async fn connect(port_name: &str) -> Result<Self, MBusError> {
        Self::connect_with_config(port_name, SerialConfig::default()).await
    }

    /// Opens `port_name` with 8 data bits, 1 stop bit and the configured
    /// rate and parity.
    pub async fn connect_with_config(
        port_name: &str,
        config: SerialConfig,
    ) -> Result<Self, MBusError> {
        if config.baudrate < MIN_BAUDRATE {
            return Err(MBusError::InvalidArgument(format!(
                "baud rate {} below {MIN_BAUDRATE}",
                config.baudrate
            )));
        }

        let port = tokio_serial::new(port_name, config.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(config.parity)
            .timeout(config.timeout)
            .open_native_async()
            .map_err(|e| MBusError::SerialPortError(format!("{port_name}: {e}")))?;

        info!(
            "opened {port_name} at {} baud, parity {:?}",
            config.baudrate, config.parity
        );
        Ok(SerialTransport { port, config })
    }
}

impl<P: SerialPort> SerialTransport<P> {
    /// Wraps an already opened port.
    pub fn new(port: P, config: SerialConfig) -> Self {
        SerialTransport { port, config }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn response_timeout(&self) -> Duration {
        self.config
            .recv_timeout
            .unwrap_or_else(|| response_timeout_for(self.config.baudrate))
    }

    /// Changes the line speed. Rates below 300 baud are rejected; rates
    /// outside the common M-Bus set are accepted with a warning.
    pub fn set_baudrate(&mut self, baudrate: u32) -> Result<(), MBusError> {
        if baudrate < MIN_BAUDRATE {
            return Err(MBusError::InvalidArgument(format!(
                "baud rate {baudrate} below {MIN_BAUDRATE}"
            )));
        }
        if !STANDARD_BAUDRATES.contains(&baudrate) {
            warn!("baud rate {baudrate} is not a standard M-Bus rate (300, 2400, 9600)");
        }

        self.port.set_baud_rate(baudrate)?;
        self.config.baudrate = baudrate;
        info!("baud rate set to {baudrate}");
        Ok(())
    }

    pub fn set_parity(&mut self, parity: Parity) -> Result<(), MBusError> {
        self.port.set_parity(parity)?;
        self.config.parity = parity;
        info!("parity set to {parity:?}");
        Ok(())
    }

    /// Flips between even parity (the M-Bus default) and no parity.
    pub fn toggle_parity(&mut self) -> Result<Parity, MBusError> {
        let next = match self.config.parity {
            Parity::Even => Parity::None,
            _ => Parity::Even,
        };
        self.set_parity(next)?;
        Ok(next)
    }

    /// Reads the rest of a frame that has already started. The response
    /// timeout applies to the gap between chunks, not to the whole frame, so
    /// a long reply trickling in at low baud is read completely. A gap longer
    /// than that is a garbled frame, not silence.
    async fn read_rest(&mut self, buf: &mut [u8], gap: Duration) -> Result<(), RecvResult> {
        let mut filled = 0;
        while filled < buf.len() {
            match timeout(gap, self.port.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => return Err(RecvResult::Invalid),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(RecvResult::Error(e.into())),
                Err(_) => {
                    debug!("frame truncated after {} of {} bytes", filled, buf.len());
                    return Err(RecvResult::Invalid);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<P: SerialPort> BusTransport for SerialTransport<P> {
    async fn send_frame(&mut self, frame: &MBusFrame) -> Result<(), MBusError> {
        let data = pack_frame(frame);
        log_frame_hex("SEND", &data);
        self.port.write_all(&data).await?;
        self.port.flush().await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> RecvResult {
        let to = self.response_timeout();

        let mut start = [0u8; 1];
        match timeout(to, self.port.read(&mut start)).await {
            Err(_) | Ok(Ok(0)) => return RecvResult::Timeout,
            Ok(Err(e)) => return RecvResult::Error(e.into()),
            Ok(Ok(_)) => {}
        }

        let mut buf = vec![start[0]];
        let remaining = match start[0] {
            MBUS_FRAME_ACK_START => 0,
            MBUS_FRAME_SHORT_START => 4,
            MBUS_FRAME_LONG_START => {
                let mut header = [0u8; 3];
                if let Err(result) = self.read_rest(&mut header, to).await {
                    return result;
                }
                buf.extend_from_slice(&header);
                if header[0] != header[1] || header[2] != MBUS_FRAME_LONG_START {
                    log_frame_hex("RECV", &buf);
                    debug!("invalid long frame header");
                    return RecvResult::Invalid;
                }
                // C, A, CI and data are covered by L, then checksum and stop
                usize::from(header[0]) + 2
            }
            other => {
                debug!("invalid frame start byte 0x{other:02X}");
                return RecvResult::Invalid;
            }
        };

        if remaining > 0 {
            let mut rest = vec![0u8; remaining];
            if let Err(result) = self.read_rest(&mut rest, to).await {
                return result;
            }
            buf.extend_from_slice(&rest);
        }
        log_frame_hex("RECV", &buf);

        let frame = match parse_frame(&buf) {
            Ok((_, frame)) => frame,
            Err(e) => {
                debug!("failed parsing received frame: {e:?}");
                return RecvResult::Invalid;
            }
        };
        if let Err(e) = verify_frame(&frame) {
            debug!("discarding received frame: {e}");
            return RecvResult::Invalid;
        }

        RecvResult::Frame(frame)
    }

    async fn purge_pending(&mut self) -> bool {
        let to = self.response_timeout();
        let mut scratch = [0u8; 256];
        let mut purged = false;

        for _ in 0..MAX_PURGE_READS {
            match timeout(to, self.port.read(&mut scratch)).await {
                Ok(Ok(n)) if n > 0 => {
                    log_frame_hex("PURGE", &scratch[..n]);
                    purged = true;
                }
                _ => break,
            }
        }

        purged
    }
}
