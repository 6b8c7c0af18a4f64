use crate::{ByteChannel, PortInfo, Result, TransportError};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::debug;

/// A USB/TTL serial adapter driving the servo line (e.g. FE-URT-1, Waveshare bus servo board).
pub struct SerialChannel {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialChannel {
    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl ByteChannel for SerialChannel {
    fn open(path: &str, baud_rate: u32) -> Result<Self> {
        // Short per-read timeout; the protocol layer owns the packet deadline.
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(2))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::InterfaceNotFound(path.to_string()),
                _ => TransportError::Io(e.to_string()),
            })?;
        debug!(path, baud_rate, "serial port opened");
        Ok(Self {
            path: path.to_string(),
            baud_rate,
            port: Some(port),
        })
    }

    fn list() -> Result<Vec<PortInfo>> {
        let mut out = Vec::new();
        for p in serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))? {
            let driver = match p.port_type {
                SerialPortType::UsbPort(_) => "usb-serial",
                _ => "serial",
            };
            out.push(PortInfo {
                name: p.port_name,
                driver: driver.to_string(),
            });
        }
        Ok(out)
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.port()?
            .set_baud_rate(baud_rate)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port()?
            .set_timeout(timeout)
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let port = self.port()?;
        port.write_all(bytes)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        port.flush().map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(bytes.len())
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        if max_len == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; max_len];
        match self.port()?.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(Vec::new())
            }
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.port()?
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(path = %self.path, "serial port closed");
        }
        Ok(())
    }
}
