//! Per-device session state

use common::{DeviceKey, MacAddress};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::classifier::EndpointSelection;
use crate::framing::Framing;
use crate::transport::{NetInterface, TransferId, Transport};

/// Identifies a session for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lifecycle of a device binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Unattached,
    Attaching,
    Active,
    Detaching,
    Released,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unattached => "unattached",
            LifecycleState::Attaching => "attaching",
            LifecycleState::Active => "active",
            LifecycleState::Detaching => "detaching",
            LifecycleState::Released => "released",
        };
        f.write_str(name)
    }
}

/// Traffic counters, named after the usual netdev statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
}

/// Snapshot of a session for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub device: DeviceKey,
    pub interface: String,
    pub mac: MacAddress,
    pub state: LifecycleState,
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub framing: Framing,
    pub outstanding_transfers: usize,
    pub stats: SessionStats,
}

/// Live binding between one device and one network interface
///
/// Owns the interface handle, the transport, and the ids of every transfer
/// it has in flight. Only the lifecycle manager changes `state` or
/// `interface`; the engines read the selection and replace their own
/// transfer ids.
pub struct Session<I> {
    pub(crate) id: SessionId,
    pub(crate) device: DeviceKey,
    pub(crate) state: LifecycleState,
    pub(crate) interface: Option<I>,
    pub(crate) selection: EndpointSelection,
    pub(crate) framing: Framing,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) rx_transfer: Option<TransferId>,
    pub(crate) tx_transfers: BTreeSet<TransferId>,
    pub(crate) stats: SessionStats,
}

impl<I: NetInterface> Session<I> {
    pub(crate) fn new(
        id: SessionId,
        device: DeviceKey,
        selection: EndpointSelection,
        framing: Framing,
        transport: Box<dyn Transport>,
        interface: I,
    ) -> Self {
        Self {
            id,
            device,
            state: LifecycleState::Attaching,
            interface: Some(interface),
            selection,
            framing,
            transport,
            rx_transfer: None,
            tx_transfers: BTreeSet::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> DeviceKey {
        self.device
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn selection(&self) -> &EndpointSelection {
        &self.selection
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Every transfer id still owed a completion, receive first
    pub fn outstanding(&self) -> Vec<TransferId> {
        self.rx_transfer
            .iter()
            .chain(self.tx_transfers.iter())
            .copied()
            .collect()
    }

    pub fn outstanding_count(&self) -> usize {
        usize::from(self.rx_transfer.is_some()) + self.tx_transfers.len()
    }

    pub fn info(&self) -> SessionInfo {
        let (interface, mac) = match &self.interface {
            Some(iface) => (iface.name().to_string(), iface.mac()),
            None => (String::new(), MacAddress([0; 6])),
        };

        SessionInfo {
            id: self.id,
            device: self.device,
            interface,
            mac,
            state: self.state,
            bulk_in: self.selection.bulk_in.address,
            bulk_out: self.selection.bulk_out.address,
            framing: self.framing,
            outstanding_transfers: self.outstanding_count(),
            stats: self.stats,
        }
    }
}
