//! Endpoint table
//!
//! Maps endpoint addresses to the claimed interface (and alternate setting)
//! that currently owns them. The I/O thread is the only writer; every change
//! builds a new [`Snapshot`] and swaps it in under a short lock, so readers on
//! any thread see either the old table or the new one, never a mix.

use protocol::{ConfigurationDescriptor, Direction, InterfaceDescriptor, TransferType};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// Source of parsed descriptors for an open device
pub trait DescriptorProvider: Send + Sync {
    /// bConfigurationValue of the configuration active at open, if configured
    fn active_configuration(&self) -> Option<u8>;

    /// One alternate setting of one interface in a configuration
    fn interface(&self, configuration: u8, number: u8, alternate: u8)
    -> Option<InterfaceDescriptor>;
}

/// Descriptors known up front, e.g. read once during enumeration
#[derive(Debug, Clone)]
pub struct StaticDescriptors {
    configurations: Vec<ConfigurationDescriptor>,
    active: Option<u8>,
}

impl StaticDescriptors {
    /// The first configuration is taken as active
    pub fn new(configurations: Vec<ConfigurationDescriptor>) -> Self {
        let active = configurations.first().map(|c| c.value);
        Self {
            configurations,
            active,
        }
    }

    pub fn with_active_configuration(mut self, value: Option<u8>) -> Self {
        self.active = value;
        self
    }
}

impl DescriptorProvider for StaticDescriptors {
    fn active_configuration(&self) -> Option<u8> {
        self.active
    }

    fn interface(
        &self,
        configuration: u8,
        number: u8,
        alternate: u8,
    ) -> Option<InterfaceDescriptor> {
        self.configurations
            .iter()
            .find(|c| c.value == configuration)?
            .interface(number, alternate)
            .cloned()
    }
}

/// An endpoint of a claimed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub interface_number: u8,
    pub max_packet_size: u16,
}

/// Immutable view of claims and endpoints
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    configuration: Option<u8>,
    /// Claimed interface -> current alternate setting
    claims: BTreeMap<u8, u8>,
    /// Claimed interfaces, oldest first
    claim_order: Vec<u8>,
    interfaces: BTreeMap<u8, Arc<InterfaceDescriptor>>,
    endpoints: HashMap<u8, Endpoint>,
}

impl Snapshot {
    pub fn configuration(&self) -> Option<u8> {
        self.configuration
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.claims.keys().copied().collect()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Republish every claimed interface's endpoints, oldest claim first
    ///
    /// An endpoint address wanted by two interfaces goes to the one claimed
    /// earlier; once that claim ends the other interface picks it up.
    fn rebuild(&mut self, provider: &dyn DescriptorProvider) {
        self.endpoints.clear();
        self.interfaces.clear();
        let Some(configuration) = self.configuration else {
            return;
        };

        for number in self.claim_order.clone() {
            let Some(&alternate) = self.claims.get(&number) else {
                continue;
            };
            let Some(descriptor) = provider.interface(configuration, number, alternate) else {
                warn!(
                    "No descriptor for interface {} alternate {} in configuration {}",
                    number, alternate, configuration
                );
                continue;
            };

            for ep in &descriptor.endpoints {
                if let Some(owner) = self.endpoints.get(&ep.address) {
                    warn!(
                        "Endpoint {:#04x} of interface {} already owned by interface {}",
                        ep.address, number, owner.interface_number
                    );
                    continue;
                }
                self.endpoints.insert(
                    ep.address,
                    Endpoint {
                        address: ep.address,
                        direction: ep.direction(),
                        transfer_type: ep.transfer_type,
                        interface_number: number,
                        max_packet_size: ep.max_packet_size,
                    },
                );
            }
            self.interfaces.insert(number, Arc::new(descriptor));
        }
    }
}

pub struct EndpointTable {
    provider: Arc<dyn DescriptorProvider>,
    current: Mutex<Arc<Snapshot>>,
}

impl EndpointTable {
    pub fn new(provider: Arc<dyn DescriptorProvider>) -> Self {
        let snapshot = Snapshot {
            configuration: provider.active_configuration(),
            ..Snapshot::default()
        };
        Self {
            provider,
            current: Mutex::new(Arc::new(snapshot)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arc<Snapshot>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.lock().clone()
    }

    /// Copy the current snapshot, change the copy, publish it
    ///
    /// The lock is held only for the swap; descriptor lookups happen on the
    /// copy. Writers are confined to the I/O thread, so no update is lost.
    fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut Snapshot, &dyn DescriptorProvider),
    {
        let mut next = (*self.snapshot()).clone();
        change(&mut next, self.provider.as_ref());
        *self.lock() = Arc::new(next);
    }

    pub fn lookup(&self, address: u8) -> Option<Endpoint> {
        self.snapshot().endpoints.get(&address).copied()
    }

    pub fn is_claimed(&self, number: u8) -> bool {
        self.snapshot().claims.contains_key(&number)
    }

    pub fn alternate_setting(&self, number: u8) -> Option<u8> {
        self.snapshot().claims.get(&number).copied()
    }

    pub fn configuration(&self) -> Option<u8> {
        self.snapshot().configuration
    }

    /// Descriptor of the claimed interface currently owning `address`
    pub fn find_interface(&self, address: u8) -> Option<InterfaceDescriptor> {
        let snapshot = self.snapshot();
        let endpoint = snapshot.endpoints.get(&address)?;
        snapshot
            .interfaces
            .get(&endpoint.interface_number)
            .map(|descriptor| descriptor.as_ref().clone())
    }

    /// Re-read descriptors after interface `number` changed
    ///
    /// Ownership is recomputed for every claim, so an unclaimed interface
    /// just loses its endpoints.
    pub fn refresh(&self, number: u8) {
        trace!("Refreshing endpoints for interface {}", number);
        self.update(|snapshot, provider| snapshot.rebuild(provider));
    }

    /// Record a successful claim (alternate setting 0)
    pub fn claim(&self, number: u8) {
        debug!("Interface {} claimed", number);
        self.update(|snapshot, provider| {
            if snapshot.claims.insert(number, 0).is_none() {
                snapshot.claim_order.push(number);
            }
            snapshot.rebuild(provider);
        });
    }

    pub fn release(&self, number: u8) {
        debug!("Interface {} released", number);
        self.update(|snapshot, provider| {
            snapshot.claims.remove(&number);
            snapshot.claim_order.retain(|&n| n != number);
            snapshot.rebuild(provider);
        });
    }

    pub fn set_alternate(&self, number: u8, alternate: u8) {
        debug!("Interface {} now at alternate setting {}", number, alternate);
        self.update(|snapshot, provider| {
            if let Some(current) = snapshot.claims.get_mut(&number) {
                *current = alternate;
            }
            snapshot.rebuild(provider);
        });
    }

    /// Switch configuration; claimed interfaces fall back to alternate 0
    pub fn set_configuration(&self, value: u8) {
        debug!("Configuration {} active", value);
        self.update(|snapshot, provider| {
            snapshot.configuration = Some(value);
            for alternate in snapshot.claims.values_mut() {
                *alternate = 0;
            }
            snapshot.rebuild(provider);
        });
    }

    /// Drop every claim and endpoint
    pub fn clear(&self) {
        self.update(|snapshot, _| {
            snapshot.claims.clear();
            snapshot.claim_order.clear();
            snapshot.interfaces.clear();
            snapshot.endpoints.clear();
        });
    }
}

impl std::fmt::Debug for EndpointTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointTable")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
