//! libusb transport
//!
//! Production [`Transport`] over `rusb`. Devices are identified by their
//! bus number and port chain, which survives re-enumeration as long as the
//! device stays plugged into the same port.

use super::error::{Result, SessionError};
use super::transport::{DeviceHandle, PhysicalDevice, Transport};
use rusb::{Context, Device, Direction, TransferType, UsbContext};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Vendor-specific interface class
const VENDOR_CLASS: u8 = 0xff;

/// Read slice; reads wake up this often to check their deadline
const READ_SLICE: Duration = Duration::from_millis(100);

/// Write timeout for one report
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// rusb-backed device source
pub struct RusbTransport {
    context: Context,
    /// VID:PID patterns; empty allows everything
    filters: Vec<String>,
    read_timeout: Duration,
}

impl RusbTransport {
    pub fn new(filters: Vec<String>, read_timeout: Duration) -> Result<Self> {
        let context = Context::new()?;
        Ok(Self {
            context,
            filters,
            read_timeout,
        })
    }

    /// Check if a VID/PID pair is allowed by the filters
    ///
    /// Filters look like `"0x534c:0x0001"`; either side may be `*`.
    pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        if filters.is_empty() {
            return true;
        }

        let matches = |pattern: &str, value: u16| {
            pattern == "*"
                || u16::from_str_radix(pattern.trim_start_matches("0x"), 16)
                    .map(|v| v == value)
                    .unwrap_or(false)
        };

        filters.iter().any(|filter| match filter.split_once(':') {
            Some((vid_pattern, pid_pattern)) => {
                matches(vid_pattern, vid) && matches(pid_pattern, pid)
            }
            None => false,
        })
    }

    fn describe(&self, device: &Device<Context>) -> Option<PhysicalDevice> {
        let desc = device.device_descriptor().ok()?;

        // Root hubs: VID 0x1d6b (Linux Foundation) with device class 9 (Hub)
        if desc.vendor_id() == 0x1d6b && desc.class_code() == 9 {
            return None;
        }

        if !Self::check_filter(desc.vendor_id(), desc.product_id(), &self.filters) {
            debug!(
                "Device ignored by filter: bus={}, addr={}, vid={:#x}, pid={:#x}",
                device.bus_number(),
                device.address(),
                desc.vendor_id(),
                desc.product_id()
            );
            return None;
        }

        let debug = device
            .active_config_descriptor()
            .map(|config| {
                config
                    .interfaces()
                    .filter(|interface| {
                        interface
                            .descriptors()
                            .any(|d| d.class_code() == VENDOR_CLASS)
                    })
                    .count()
                    > 1
            })
            .unwrap_or(false);

        Some(PhysicalDevice {
            path: device_path(device),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            debug,
        })
    }

    fn find(&self, path: &str) -> Result<Device<Context>> {
        let devices = self.context.devices()?;
        devices
            .iter()
            .find(|device| device_path(device) == path)
            .ok_or(SessionError::Disconnected)
    }
}

/// `"<bus>-<port>.<port>..."`, falling back to the device address
fn device_path<T: UsbContext>(device: &Device<T>) -> String {
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => {
            let chain: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
            format!("{}-{}", device.bus_number(), chain.join("."))
        }
        _ => format!("{}-a{}", device.bus_number(), device.address()),
    }
}

impl Transport for RusbTransport {
    fn enumerate(&self) -> Result<Vec<PhysicalDevice>> {
        let devices = self.context.devices()?;
        let found: Vec<PhysicalDevice> =
            devices.iter().filter_map(|d| self.describe(&d)).collect();
        debug!("Enumerated {} devices", found.len());
        Ok(found)
    }

    fn connect(&self, path: &str, debug: bool, reset: bool) -> Result<Box<dyn DeviceHandle>> {
        let device = self.find(path)?;
        let handle = device.open()?;

        if reset {
            debug!("Resetting device at {}", path);
            handle.reset()?;
        }

        let interface_number: u8 = if debug { 1 } else { 0 };
        let config = device.active_config_descriptor()?;
        let interface = config
            .interfaces()
            .find(|i| i.number() == interface_number)
            .ok_or_else(|| {
                SessionError::Transport(format!(
                    "{} has no interface {}",
                    path, interface_number
                ))
            })?;

        let mut endpoint_in = None;
        let mut endpoint_out = None;
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Interrupt {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => endpoint_in = endpoint_in.or(Some(endpoint.address())),
                    Direction::Out => endpoint_out = endpoint_out.or(Some(endpoint.address())),
                }
            }
        }
        let (Some(endpoint_in), Some(endpoint_out)) = (endpoint_in, endpoint_out) else {
            return Err(SessionError::Transport(format!(
                "{} interface {} has no interrupt endpoints",
                path, interface_number
            )));
        };

        match handle.kernel_driver_active(interface_number) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {}",
                    interface_number, path
                );
                if let Err(e) = handle.detach_kernel_driver(interface_number) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface_number, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface_number, e
                );
            }
        }

        handle.claim_interface(interface_number)?;
        debug!("Claimed interface {} on {}", interface_number, path);

        Ok(Box::new(RusbHandle {
            handle,
            interface: interface_number,
            endpoint_in,
            endpoint_out,
            read_timeout: self.read_timeout,
        }))
    }
}

struct RusbHandle {
    handle: rusb::DeviceHandle<Context>,
    interface: u8,
    endpoint_in: u8,
    endpoint_out: u8,
    read_timeout: Duration,
}

impl DeviceHandle for RusbHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            match self.handle.read_interrupt(self.endpoint_in, buf, READ_SLICE) {
                Ok(n) => return Ok(n),
                Err(rusb::Error::Timeout) if Instant::now() < deadline => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self
            .handle
            .write_interrupt(self.endpoint_out, data, WRITE_TIMEOUT)?)
    }

    fn close(&mut self, disconnected: bool) -> Result<()> {
        if disconnected {
            return Ok(());
        }

        self.handle.release_interface(self.interface)?;
        if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
            debug!(
                "Could not reattach kernel driver to interface {} (may not have been detached): {}",
                self.interface, e
            );
        }
        Ok(())
    }
}
