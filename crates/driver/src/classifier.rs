//! Endpoint classification
//!
//! Picks the bulk endpoints a session moves frames over. Control, interrupt
//! and isochronous endpoints (the CDC notification endpoint among them) are
//! ignored.

use common::{Direction, EndpointDescriptor, EndpointTransferType};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{DriverError, Result};

/// Role an endpoint can play for this driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    BulkIn,
    BulkOut,
    Other,
}

/// The bulk endpoints chosen for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EndpointSelection {
    pub bulk_in: EndpointDescriptor,
    pub bulk_out: EndpointDescriptor,
}

/// Classify a single endpoint descriptor
pub fn classify(endpoint: &EndpointDescriptor) -> EndpointClass {
    match (endpoint.transfer_type, endpoint.direction()) {
        (EndpointTransferType::Bulk, Direction::In) => EndpointClass::BulkIn,
        (EndpointTransferType::Bulk, Direction::Out) => EndpointClass::BulkOut,
        _ => EndpointClass::Other,
    }
}

/// Select the first bulk-in and first bulk-out endpoint, in descriptor order
///
/// Every descriptor is visited exactly once. Fails with
/// [`DriverError::MissingEndpoint`] if either direction has no bulk endpoint.
pub fn classify_endpoints(endpoints: &[EndpointDescriptor]) -> Result<EndpointSelection> {
    let mut bulk_in = None;
    let mut bulk_out = None;

    for endpoint in endpoints {
        match classify(endpoint) {
            EndpointClass::BulkIn if bulk_in.is_none() => {
                debug!("Found bulk IN endpoint {:#04x}", endpoint.address);
                bulk_in = Some(*endpoint);
            }
            EndpointClass::BulkOut if bulk_out.is_none() => {
                debug!("Found bulk OUT endpoint {:#04x}", endpoint.address);
                bulk_out = Some(*endpoint);
            }
            class => {
                trace!(
                    "Ignoring endpoint {:#04x} ({:?}, {:?})",
                    endpoint.address, endpoint.transfer_type, class
                );
            }
        }
    }

    match (bulk_in, bulk_out) {
        (Some(bulk_in), Some(bulk_out)) => Ok(EndpointSelection { bulk_in, bulk_out }),
        (None, _) => {
            warn!("No bulk IN endpoint among {} descriptors", endpoints.len());
            Err(DriverError::MissingEndpoint {
                direction: Direction::In,
            })
        }
        (_, None) => {
            warn!("No bulk OUT endpoint among {} descriptors", endpoints.len());
            Err(DriverError::MissingEndpoint {
                direction: Direction::Out,
            })
        }
    }
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// Any endpoint: random address and attributes
    fn endpoint_strategy() -> impl Strategy<Value = EndpointDescriptor> {
        (any::<u8>(), 0u8..4, prop::sample::select(vec![8u16, 64, 512, 1024]))
            .prop_map(|(address, attributes, mps)| {
                EndpointDescriptor::from_raw(address, attributes, mps)
            })
    }

    proptest! {
        /// Property: the selection is the first bulk endpoint of each direction
        #[test]
        fn prop_selection_is_first_of_each_direction(
            endpoints in proptest::collection::vec(endpoint_strategy(), 0..16),
        ) {
            let first_in = endpoints.iter().find(|e| classify(e) == EndpointClass::BulkIn);
            let first_out = endpoints.iter().find(|e| classify(e) == EndpointClass::BulkOut);

            match (classify_endpoints(&endpoints), first_in, first_out) {
                (Ok(selection), Some(bulk_in), Some(bulk_out)) => {
                    prop_assert_eq!(selection.bulk_in, *bulk_in);
                    prop_assert_eq!(selection.bulk_out, *bulk_out);
                }
                (Err(DriverError::MissingEndpoint { direction: Direction::In }), None, _) => {}
                (Err(DriverError::MissingEndpoint { direction: Direction::Out }), Some(_), None) => {}
                (result, first_in, first_out) => {
                    prop_assert!(
                        false,
                        "unexpected {:?} for first_in={:?} first_out={:?}",
                        result,
                        first_in,
                        first_out
                    );
                }
            }
        }

        /// Property: non-bulk endpoints never influence the selection
        #[test]
        fn prop_non_bulk_endpoints_are_ignored(
            endpoints in proptest::collection::vec(endpoint_strategy(), 0..16),
        ) {
            let bulk_only: Vec<_> = endpoints
                .iter()
                .copied()
                .filter(|e| classify(e) != EndpointClass::Other)
                .collect();

            let all = classify_endpoints(&endpoints).ok();
            let filtered = classify_endpoints(&bulk_only).ok();
            prop_assert_eq!(all, filtered);
        }
    }
}
