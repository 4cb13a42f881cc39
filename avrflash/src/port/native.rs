//! Native serial port implementation using the `serialport` crate.
//!
//! Besides plain I/O this implements the "1200 baud touch": opening a USB
//! CDC device at 1200 baud and dropping DTR makes Caterina-style firmware
//! reboot into its AVR109 bootloader.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortEnumerator, PortInfo, SerialConfig},
    },
    log::{debug, trace, warn},
    serialport::{DataBits, FlowControl, Parity, StopBits},
    std::{
        io::{Read, Write},
        thread,
        time::Duration,
    },
};

/// Maximum number of attempts to reopen the port after a reset touch.
const MAX_OPEN_ATTEMPTS: usize = 10;

/// Delay between reopen attempts while the device re-enumerates.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(250);

/// How long DTR is held high before the falling edge of the touch.
const TOUCH_DTR_HOLD: Duration = Duration::from_millis(50);

/// Time for the application to drop off the bus after the touch.
const TOUCH_RELEASE_DELAY: Duration = Duration::from_millis(500);

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    config: SerialConfig,
    timeout: Duration,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = open_raw(config, config.timeout)?;

        Ok(Self {
            port: Some(port),
            config: config.clone(),
            timeout: config.timeout,
        })
    }

    /// Open at the reset baud rate and drop DTR, then close again.
    fn touch(&self, reset_baud: u32) -> Result<()> {
        debug!("Touching {} at {reset_baud} baud", self.config.port_name);

        let mut port = serialport::new(&self.config.port_name, reset_baud)
            .timeout(Duration::from_millis(100))
            .open()?;

        port.write_data_terminal_ready(true)?;
        thread::sleep(TOUCH_DTR_HOLD);
        port.write_data_terminal_ready(false)?;
        drop(port);

        thread::sleep(TOUCH_RELEASE_DELAY);
        Ok(())
    }

    /// Reopen at the operating baud rate, retrying while the device re-enumerates.
    fn reopen_with_retry(&mut self) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=MAX_OPEN_ATTEMPTS {
            match open_raw(&self.config, self.timeout) {
                Ok(port) => {
                    if attempt > 1 {
                        debug!("Port reopened on attempt {attempt}");
                    }
                    self.port = Some(port);
                    return Ok(());
                },
                Err(e) => {
                    trace!(
                        "Reopen of {} failed (attempt {attempt}/{MAX_OPEN_ATTEMPTS}): {e}",
                        self.config.port_name
                    );
                    last_error = Some(e);
                    if attempt < MAX_OPEN_ATTEMPTS {
                        thread::sleep(OPEN_RETRY_DELAY);
                    }
                },
            }
        }

        warn!(
            "Could not reopen {} after {MAX_OPEN_ATTEMPTS} attempts",
            self.config.port_name
        );
        Err(last_error.unwrap_or(Error::DeviceNotFound))
    }

    fn inner(&mut self) -> std::io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
    }
}

fn open_raw(
    config: &SerialConfig,
    timeout: Duration,
) -> Result<Box<dyn serialport::SerialPort>> {
    let port = serialport::new(&config.port_name, config.baud_rate)
        .timeout(timeout)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open()?;
    Ok(port)
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }

    fn reset_to_bootloader(&mut self) -> Result<()> {
        self.port.take();

        if let Some(reset_baud) = self.config.reset_baud {
            // A device already sitting in the bootloader may not expose the
            // application port any more; the reopen below still applies.
            if let Err(e) = self.touch(reset_baud) {
                debug!("Reset touch failed (continuing): {e}");
            }
        }

        self.reopen_with_retry()
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner().and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner().and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner().and_then(|p| p.flush())
    }
}

/// Native port enumerator.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, manufacturer, product, serial_number) = match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer,
                        info.product,
                        info.serial_number,
                    ),
                    _ => (None, None, None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    manufacturer,
                    product,
                    serial_number,
                }
            })
            .collect())
    }
}
