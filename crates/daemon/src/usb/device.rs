//! USB device probing and ownership
//!
//! [`find_function`] walks a configuration's interfaces looking for a
//! control interface the device table knows, then gathers the endpoints of
//! its CDC-Data interface. [`UsbDevice`] opens the device, takes the claimed
//! interfaces away from the kernel and gives them back on close.

use common::{DeviceKey, EndpointDescriptor, EndpointTransferType, InterfaceDescriptor};
use driver::device_table::CDC_DATA_CLASS;
use driver::{DeviceTable, Framing};
use rusb::{ConfigDescriptor, Context, Device, DeviceDescriptor, DeviceHandle, TransferType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Root hubs belong to the Linux Foundation vendor id and the hub class
const LINUX_FOUNDATION_VID: u16 = 0x1d6b;
const HUB_CLASS: u8 = 0x09;

const STRING_TIMEOUT: Duration = Duration::from_millis(200);

/// One alternate setting of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSetting {
    pub setting: u8,
    pub descriptor: InterfaceDescriptor,
}

/// A bindable network function found on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdcFunction {
    /// Control interface, with the data interface's endpoints appended
    pub interface: InterfaceDescriptor,
    pub framing: Framing,
    /// Data interface number and the alternate setting carrying its endpoints
    pub data_interface: Option<(u8, u8)>,
}

/// Flatten a configuration descriptor into its alternate settings
pub fn read_alt_settings(config: &ConfigDescriptor) -> Vec<AltSetting> {
    let mut settings = Vec::new();
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            let endpoints = desc
                .endpoint_descriptors()
                .map(|ep| {
                    EndpointDescriptor::new(
                        ep.address(),
                        map_transfer_type(ep.transfer_type()),
                        ep.max_packet_size(),
                    )
                })
                .collect();
            settings.push(AltSetting {
                setting: desc.setting_number(),
                descriptor: InterfaceDescriptor {
                    number: desc.interface_number(),
                    class: desc.class_code(),
                    subclass: desc.sub_class_code(),
                    protocol: desc.protocol_code(),
                    endpoints,
                },
            });
        }
    }
    settings
}

fn map_transfer_type(transfer_type: TransferType) -> EndpointTransferType {
    match transfer_type {
        TransferType::Control => EndpointTransferType::Control,
        TransferType::Isochronous => EndpointTransferType::Isochronous,
        TransferType::Bulk => EndpointTransferType::Bulk,
        TransferType::Interrupt => EndpointTransferType::Interrupt,
    }
}

/// First control interface the table matches, merged with its data interface
///
/// The data interface is the CDC-Data interface numbered right after the
/// control interface, or failing that the first CDC-Data interface at all.
/// Its first alternate setting with endpoints wins (CDC-ECM keeps setting 0
/// empty so the function is idle until the host selects setting 1).
pub fn find_function(settings: &[AltSetting], table: &DeviceTable) -> Option<CdcFunction> {
    let (control, framing) = settings.iter().find_map(|alt| {
        table
            .lookup(&alt.descriptor)
            .map(|entry| (&alt.descriptor, entry.framing))
    })?;

    let is_data = |alt: &&AltSetting| {
        alt.descriptor.class == CDC_DATA_CLASS && !alt.descriptor.endpoints.is_empty()
    };
    let data = settings
        .iter()
        .filter(is_data)
        .find(|alt| alt.descriptor.number == control.number.wrapping_add(1))
        .or_else(|| settings.iter().find(is_data));

    let mut interface = control.clone();
    let data_interface = data.map(|alt| {
        interface
            .endpoints
            .extend_from_slice(&alt.descriptor.endpoints);
        (alt.descriptor.number, alt.setting)
    });

    Some(CdcFunction {
        interface,
        framing,
        data_interface,
    })
}

/// Whether this is a host controller's root hub
pub fn is_root_hub(descriptor: &DeviceDescriptor) -> bool {
    descriptor.vendor_id() == LINUX_FOUNDATION_VID && descriptor.class_code() == HUB_CLASS
}

/// Manufacturer and product strings, when the device can be opened
pub fn read_strings(
    device: &Device<Context>,
    descriptor: &DeviceDescriptor,
) -> (Option<String>, Option<String>) {
    let Ok(handle) = device.open() else {
        return (None, None);
    };
    let Ok(languages) = handle.read_languages(STRING_TIMEOUT) else {
        return (None, None);
    };
    let Some(language) = languages.first().copied() else {
        return (None, None);
    };

    (
        handle
            .read_manufacturer_string(language, descriptor, STRING_TIMEOUT)
            .ok(),
        handle
            .read_product_string(language, descriptor, STRING_TIMEOUT)
            .ok(),
    )
}

/// An opened device whose interfaces we hold
pub struct UsbDevice {
    device: Device<Context>,
    key: DeviceKey,
    handle: Option<Arc<DeviceHandle<Context>>>,
    claimed_interfaces: Vec<u8>,
}

impl UsbDevice {
    pub fn new(device: Device<Context>) -> Self {
        let key = DeviceKey::new(device.bus_number(), device.address());
        Self {
            device,
            key,
            handle: None,
            claimed_interfaces: Vec::new(),
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    /// Open the device and claim every interface of its active configuration
    ///
    /// Kernel drivers are detached first. When `data_interface` is given, its
    /// alternate setting is selected after claiming. The returned handle is
    /// shared with the transport lanes.
    pub fn open(
        &mut self,
        data_interface: Option<(u8, u8)>,
    ) -> rusb::Result<Arc<DeviceHandle<Context>>> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }

        let mut handle = self.device.open().inspect_err(|e| {
            warn!("{}: failed to open device: {}", self.key, e);
        })?;
        let config = self.device.active_config_descriptor()?;

        for interface in config.interfaces() {
            let number = interface.number();

            match handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("{}: detaching kernel driver from interface {}", self.key, number);
                    if let Err(e) = handle.detach_kernel_driver(number) {
                        warn!(
                            "{}: failed to detach kernel driver from interface {}: {}",
                            self.key, number, e
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(
                        "{}: could not check kernel driver on interface {}: {}",
                        self.key, number, e
                    );
                }
            }

            if let Err(e) = handle.claim_interface(number) {
                warn!("{}: failed to claim interface {}: {}", self.key, number, e);
                self.release(&mut handle);
                return Err(e);
            }
            self.claimed_interfaces.push(number);
        }

        if let Some((number, setting)) = data_interface
            && setting != 0
            && let Err(e) = handle.set_alternate_setting(number, setting)
        {
            warn!(
                "{}: failed to select setting {} on interface {}: {}",
                self.key, setting, number, e
            );
            self.release(&mut handle);
            return Err(e);
        }

        debug!(
            "{}: opened, claimed interfaces {:?}",
            self.key, self.claimed_interfaces
        );
        let handle = Arc::new(handle);
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Release claimed interfaces and give them back to the kernel
    ///
    /// Only possible once nothing else holds the handle; otherwise the
    /// interfaces are released when the last holder drops it.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        match Arc::try_unwrap(handle) {
            Ok(mut handle) => {
                self.release(&mut handle);
                debug!("{}: closed", self.key);
            }
            Err(_) => {
                debug!("{}: handle still in use, leaving interfaces claimed", self.key);
                self.claimed_interfaces.clear();
            }
        }
    }

    fn release(&mut self, handle: &mut DeviceHandle<Context>) {
        for interface in self.claimed_interfaces.drain(..) {
            if let Err(e) = handle.release_interface(interface) {
                debug!("{}: failed to release interface {}: {}", self.key, interface, e);
            }
            if let Err(e) = handle.attach_kernel_driver(interface) {
                debug!(
                    "{}: no kernel driver reattached to interface {}: {}",
                    self.key, interface, e
                );
            }
        }
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver::DeviceMatch;
    use driver::test_utils::{bulk_in, bulk_out, interrupt_in};

    fn alt(
        number: u8,
        setting: u8,
        class: u8,
        subclass: u8,
        endpoints: Vec<EndpointDescriptor>,
    ) -> AltSetting {
        AltSetting {
            setting,
            descriptor: InterfaceDescriptor {
                number,
                class,
                subclass,
                protocol: 0,
                endpoints,
            },
        }
    }

    #[test]
    fn test_ecm_function_uses_active_data_setting() {
        let settings = vec![
            alt(0, 0, 0x02, 0x06, vec![interrupt_in(0x83)]),
            alt(1, 0, CDC_DATA_CLASS, 0, vec![]),
            alt(1, 1, CDC_DATA_CLASS, 0, vec![bulk_in(0x81), bulk_out(0x02)]),
        ];

        let function = find_function(&settings, &DeviceTable::builtin()).unwrap();
        assert_eq!(function.framing, Framing::Ecm);
        assert_eq!(function.data_interface, Some((1, 1)));
        assert_eq!(function.interface.number, 0);
        let addresses: Vec<u8> = function
            .interface
            .endpoints
            .iter()
            .map(|e| e.address)
            .collect();
        assert_eq!(addresses, vec![0x83, 0x81, 0x02]);
    }

    #[test]
    fn test_data_interface_follows_its_control_interface() {
        // Composite device: an unrelated CDC-Data interface comes first
        let settings = vec![
            alt(0, 0, CDC_DATA_CLASS, 0, vec![bulk_in(0x85), bulk_out(0x06)]),
            alt(2, 0, 0x02, 0x02, vec![interrupt_in(0x83)]),
            alt(3, 0, CDC_DATA_CLASS, 0, vec![bulk_in(0x81), bulk_out(0x02)]),
        ];

        let function = find_function(&settings, &DeviceTable::builtin()).unwrap();
        assert_eq!(function.framing, Framing::Rndis);
        assert_eq!(function.data_interface, Some((3, 0)));
        assert_eq!(function.interface.endpoints[1].address, 0x81);
    }

    #[test]
    fn test_no_matching_function() {
        let settings = vec![
            alt(0, 0, 0x08, 0x06, vec![bulk_in(0x81), bulk_out(0x02)]),
            alt(1, 0, 0x03, 0x01, vec![interrupt_in(0x82)]),
        ];
        assert!(find_function(&settings, &DeviceTable::builtin()).is_none());
    }

    #[test]
    fn test_extra_table_entry_without_data_interface() {
        let table = DeviceTable::with_extra(&[DeviceMatch {
            class: 0xff,
            subclass: 0x42,
            protocol: 0,
            framing: Framing::Ecm,
        }]);
        let settings = vec![alt(0, 0, 0xff, 0x42, vec![bulk_in(0x81), bulk_out(0x01)])];

        let function = find_function(&settings, &table).unwrap();
        assert_eq!(function.data_interface, None);
        assert_eq!(function.interface.endpoints.len(), 2);
    }
}
