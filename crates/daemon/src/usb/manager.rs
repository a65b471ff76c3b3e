//! USB device manager
//!
//! Enumerates devices at startup and follows hot-plug afterwards. Devices
//! with a function the device table matches are opened, wrapped in a
//! [`RusbTransport`] and handed to the driver worker; unplugged devices are
//! detached. This runs on the USB thread; libusb invokes the hot-plug
//! callback from inside `handle_events`, so the callback only queues events
//! and the manager acts on them after the call returns.

use async_channel::{Receiver, Sender, unbounded};
use common::{DeviceKey, Error, Result};
use driver::{AttachRequest, CommandSender, DeviceTable, DriverCommand, Framing};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::usb::device::{
    UsbDevice, find_function, is_root_hub, read_alt_settings, read_strings,
};
use crate::usb::transport::{RusbTransport, TransportConfig};

/// libusb event wait per loop iteration; bounds how quickly a stop is seen
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// What a scan found on one device
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub key: DeviceKey,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// Matched function: framing and control interface number
    pub function: Option<(Framing, u8)>,
    /// Excluded by the configured filters
    pub filtered: bool,
}

enum HotplugEvent {
    Arrived(Device<Context>),
    Left(DeviceKey),
}

pub struct DeviceManager {
    context: Context,
    table: DeviceTable,
    filters: Vec<String>,
    transport: TransportConfig,
    driver: CommandSender,
    /// Devices currently handed to the driver
    bound: HashMap<DeviceKey, UsbDevice>,
    hotplug_tx: Sender<HotplugEvent>,
    hotplug_rx: Receiver<HotplugEvent>,
    _hotplug_registration: Option<Registration<Context>>,
}

impl DeviceManager {
    pub fn new(
        table: DeviceTable,
        filters: Vec<String>,
        transport: TransportConfig,
        driver: CommandSender,
    ) -> Result<Self> {
        let context = Context::new().map_err(usb_error)?;
        let (hotplug_tx, hotplug_rx) = unbounded();

        Ok(Self {
            context,
            table,
            filters,
            transport,
            driver,
            bound: HashMap::new(),
            hotplug_tx,
            hotplug_rx,
            _hotplug_registration: None,
        })
    }

    /// Bind matching devices already present and start following hot-plug
    pub fn initialize(&mut self) -> Result<()> {
        let devices = self.context.devices().map_err(usb_error)?;
        for device in devices.iter() {
            self.handle_device_arrived(device);
        }

        if rusb::has_hotplug() {
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(
                    &self.context,
                    Box::new(HotplugCallback {
                        events: self.hotplug_tx.clone(),
                    }),
                )
                .map_err(usb_error)?;
            self._hotplug_registration = Some(registration);
            debug!("Hot-plug callbacks registered");
        } else {
            warn!("libusb has no hot-plug support; only devices present at startup are bound");
        }

        info!("Device manager initialized with {} bound devices", self.bound.len());
        Ok(())
    }

    /// Describe every device on the bus without binding anything
    pub fn scan(&self) -> Result<Vec<DeviceSummary>> {
        let devices = self.context.devices().map_err(usb_error)?;
        let mut summaries = Vec::new();

        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if is_root_hub(&descriptor) {
                continue;
            }

            let function = device
                .active_config_descriptor()
                .ok()
                .and_then(|config| find_function(&read_alt_settings(&config), &self.table))
                .map(|function| (function.framing, function.interface.number));
            let (manufacturer, product) = read_strings(&device, &descriptor);

            summaries.push(DeviceSummary {
                key: DeviceKey::new(device.bus_number(), device.address()),
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                manufacturer,
                product,
                function,
                filtered: !check_filter(
                    descriptor.vendor_id(),
                    descriptor.product_id(),
                    &self.filters,
                ),
            });
        }

        summaries.sort_by_key(|summary| summary.key);
        Ok(summaries)
    }

    pub fn handle_device_arrived(&mut self, device: Device<Context>) {
        let key = DeviceKey::new(device.bus_number(), device.address());
        if self.bound.contains_key(&key) {
            return;
        }

        match self.bind(device) {
            Ok(Some(usb_device)) => {
                self.bound.insert(key, usb_device);
            }
            Ok(None) => {}
            Err(e) => warn!("{}: not bound: {}", key, e),
        }
    }

    pub fn handle_device_left(&mut self, key: DeviceKey) {
        let Some(usb_device) = self.bound.remove(&key) else {
            return;
        };

        info!("{}: unplugged", key);
        if let Err(e) = self.driver.send(DriverCommand::Detach {
            device: key,
            response: None,
        }) {
            error!("{}: failed to send detach: {}", key, e);
        }
        // The transport still shares the handle until the session drains
        drop(usb_device);
    }

    /// Open a matching device and attach it; `None` if it is not ours
    fn bind(&self, device: Device<Context>) -> Result<Option<UsbDevice>> {
        let key = DeviceKey::new(device.bus_number(), device.address());
        let descriptor = device.device_descriptor().map_err(usb_error)?;

        if is_root_hub(&descriptor) {
            return Ok(None);
        }
        if !check_filter(descriptor.vendor_id(), descriptor.product_id(), &self.filters) {
            debug!(
                "{}: ignored by filter (vid={:#06x}, pid={:#06x})",
                key,
                descriptor.vendor_id(),
                descriptor.product_id()
            );
            return Ok(None);
        }

        let config = device.active_config_descriptor().map_err(usb_error)?;
        let Some(function) = find_function(&read_alt_settings(&config), &self.table) else {
            return Ok(None);
        };

        info!(
            "{}: {:04x}:{:04x} has a {} function on interface {}",
            key,
            descriptor.vendor_id(),
            descriptor.product_id(),
            function.framing,
            function.interface.number
        );

        let mut usb_device = UsbDevice::new(device);
        let handle = usb_device.open(function.data_interface).map_err(usb_error)?;
        let transport = RusbTransport::new(key, handle, self.transport, self.driver.clone())?;
        let request = AttachRequest::new(key, function.interface, function.framing, transport);

        let (tx, rx) = oneshot::channel();
        self.driver
            .send(DriverCommand::Attach {
                request,
                response: Some(tx),
            })
            .map_err(|e| Error::Channel(e.to_string()))?;

        match rx.blocking_recv() {
            Ok(Ok(session)) => {
                info!("{}: attached as {}", key, session);
                Ok(Some(usb_device))
            }
            Ok(Err(e)) => Err(Error::Usb(format!("attach rejected: {}", e))),
            Err(_) => Err(Error::Channel("driver worker stopped".to_string())),
        }
    }

    /// Apply queued hot-plug events
    fn process_hotplug_events(&mut self) {
        while let Ok(event) = self.hotplug_rx.try_recv() {
            match event {
                HotplugEvent::Arrived(device) => self.handle_device_arrived(device),
                HotplugEvent::Left(key) => self.handle_device_left(key),
            }
        }
    }

    /// Pump libusb events until `stop` is set
    pub fn run(&mut self, stop: &AtomicBool) {
        info!("USB thread started");

        while !stop.load(Ordering::Acquire) {
            match self.context.handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }
            self.process_hotplug_events();
        }

        self._hotplug_registration = None;
        info!("USB thread stopped");
    }

    /// Close every bound device, returning interfaces to the kernel
    ///
    /// Call after the driver has drained so no transport holds a handle.
    pub fn shutdown(&mut self) {
        for (key, mut usb_device) in self.bound.drain() {
            debug!("{}: closing", key);
            usb_device.close();
        }
    }
}

/// Start the USB thread; it hands the manager back when stopped
pub fn spawn_usb_manager(
    mut manager: DeviceManager,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<DeviceManager>> {
    std::thread::Builder::new()
        .name("usb-manager".to_string())
        .spawn(move || {
            if let Err(e) = manager.initialize() {
                error!("USB initialization failed: {}", e);
            }
            manager.run(&stop);
            manager
        })
}

/// Check if a VID/PID pair is allowed by the filters
///
/// Filters are "0xVID:0xPID" with `*` for either half; no filters allows all.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| match filter.split_once(':') {
        Some((vid_pattern, pid_pattern)) => {
            id_matches(vid_pattern, vid) && id_matches(pid_pattern, pid)
        }
        None => false,
    })
}

fn id_matches(pattern: &str, value: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(hex, 16).is_ok_and(|v| v == value)
}

fn usb_error(e: rusb::Error) -> Error {
    Error::Usb(e.to_string())
}

/// Queues hot-plug notifications for the manager
struct HotplugCallback {
    events: Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.events.try_send(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        let key = DeviceKey::new(device.bus_number(), device.address());
        debug!("Hot-plug: device left ({})", key);
        let _ = self.events.try_send(HotplugEvent::Left(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec![
            "0x1234:0x5678".to_string(), // Exact match
            "0xABCD:*".to_string(),      // Wildcard PID
        ];

        assert!(check_filter(0x1234, 0x5678, &filters));
        assert!(check_filter(0xABCD, 0x1111, &filters));
        assert!(check_filter(0xABCD, 0x9999, &filters));

        assert!(!check_filter(0x1234, 0x9999, &filters)); // Wrong PID
        assert!(!check_filter(0x9999, 0x5678, &filters)); // Wrong VID
        assert!(!check_filter(0x0000, 0x0000, &filters));

        // Empty filters = allow all
        assert!(check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_filter_wildcard_vendor() {
        let filters = vec!["*:0x0001".to_string(), "garbage".to_string()];
        assert!(check_filter(0x18d1, 0x0001, &filters));
        assert!(!check_filter(0x18d1, 0x0002, &filters));
    }
}
