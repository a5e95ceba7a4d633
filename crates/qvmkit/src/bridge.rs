//! Virtual bus bridges and their slot allocator.
//!
//! Every hot-pluggable device occupies exactly one slot on one bridge.
//! The table here is the authoritative host-side view of that mapping;
//! it must only be mutated by a hotplug flow that also issues the
//! matching QMP command, otherwise the guest and the table diverge.

use std::collections::BTreeMap;

use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

/// Bus flavor a bridge attaches its devices to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    #[default]
    Pci,
    Pcie,
    Ccw,
}

impl BusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusType::Pci => "pci",
            BusType::Pcie => "pcie",
            BusType::Ccw => "ccw",
        }
    }
}

impl std::fmt::Display for BusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// A PCI bridge exposes 32 slots; slot 0 is taken by the bridge itself and
// the last is kept free for the shpc. CCW has a flat 16-bit device number
// space.
const PCI_BRIDGE_CAPACITY: u32 = 30;
const CCW_BRIDGE_CAPACITY: u32 = 65535;

/// One virtual bridge and the devices currently plugged into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    #[serde(rename = "type")]
    pub bus: BusType,
    pub id: String,
    /// Slot the bridge itself occupies on the root bus. Assigned when the
    /// launch command line is rendered.
    #[serde(default)]
    pub addr: u32,
    /// Occupied slots, keyed by slot index.
    #[serde(default)]
    pub slots: BTreeMap<u32, String>,
}

impl Bridge {
    pub fn new(bus: BusType, id: impl Into<String>) -> Self {
        Self {
            bus,
            id: id.into(),
            addr: 0,
            slots: BTreeMap::new(),
        }
    }

    fn capacity(&self) -> u32 {
        match self.bus {
            BusType::Pci | BusType::Pcie => PCI_BRIDGE_CAPACITY,
            BusType::Ccw => CCW_BRIDGE_CAPACITY,
        }
    }

    fn first_slot(&self) -> u32 {
        match self.bus {
            // Slot 0 belongs to the bridge.
            BusType::Pci | BusType::Pcie => 1,
            BusType::Ccw => 0,
        }
    }

    fn reserve(&mut self, device_id: &str) -> Option<u32> {
        let first = self.first_slot();
        (first..first + self.capacity()).find(|slot| !self.slots.contains_key(slot)).map(
            |slot| {
                self.slots.insert(slot, device_id.to_string());
                slot
            },
        )
    }
}

/// Where a device landed: which bridge, which slot. Devices keep only this
/// record and look the bridge up again when they need it, so the table
/// stays the single owner of the bridges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRef {
    pub bus: BusType,
    pub bridge_id: String,
    pub bridge_addr: u32,
    pub slot: u32,
}

impl SlotRef {
    /// Slot rendered the way the QMP `addr`/`devno` argument wants it:
    /// two hex digits on PCI/PCIe, four on CCW.
    pub fn slot_string(&self) -> String {
        match self.bus {
            BusType::Pci | BusType::Pcie => format!("{:02x}", self.slot),
            BusType::Ccw => format!("{:04x}", self.slot),
        }
    }

    /// Full guest PCI address, `<bridgeAddr>/<slot>` in hex.
    pub fn pci_addr(&self) -> String {
        format!("{:02x}/{}", self.bridge_addr, self.slot_string())
    }

    /// CCW device id used for hotplug, e.g. `fe.0.0001`.
    pub fn ccw_addr(&self) -> String {
        format!("fe.{:x}.{}", self.bridge_addr, self.slot_string())
    }

    /// CCW device id in the form the virtio server reports, e.g.
    /// `0.0.0001`.
    pub fn ccw_virt_server_addr(&self) -> String {
        format!("0.0.{}", self.slot_string())
    }
}

/// Ordered collection of bridges, created once at controller init.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BridgeTable {
    bridges: Vec<Bridge>,
}

impl BridgeTable {
    /// Create `count` bridges of one bus type, named `<bus>-bridge-<n>`.
    pub fn create(bus: BusType, count: u32) -> Self {
        let bridges = (0..count)
            .map(|i| Bridge::new(bus, format!("{bus}-bridge-{i}")))
            .collect();
        Self { bridges }
    }

    /// Rebuild the table from persisted bridges.
    pub fn from_bridges(bridges: Vec<Bridge>) -> Self {
        Self { bridges }
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    pub fn bridges(&self) -> &[Bridge] {
        &self.bridges
    }

    /// Assign contiguous root-bus addresses to the PCI/PCIe bridges,
    /// starting at the arch-specific first free slot.
    pub fn assign_addresses(&mut self, start: u32) {
        for (idx, bridge) in self.bridges.iter_mut().enumerate() {
            if bridge.bus != BusType::Ccw {
                bridge.addr = start + idx as u32;
            }
        }
    }

    /// Reserve the first free slot on the first bridge of `bus` that has
    /// one. Fails when every matching bridge is full.
    pub fn allocate(&mut self, device_id: &str, bus: BusType) -> Result<SlotRef> {
        if self.bridges.is_empty() {
            bail!("no bridges configured, cannot allocate a slot for {device_id}");
        }
        for bridge in &mut self.bridges {
            if bridge.bus != bus {
                continue;
            }
            if let Some(slot) = bridge.reserve(device_id) {
                return Ok(SlotRef {
                    bus,
                    bridge_id: bridge.id.clone(),
                    bridge_addr: bridge.addr,
                    slot,
                });
            }
        }
        Err(eyre!("no free {bus} bridge slot for device {device_id}"))
    }

    /// Release the slot held by `device_id`. Releasing an id that holds no
    /// slot is a caller bug and fails hard.
    pub fn release(&mut self, device_id: &str) -> Result<()> {
        for bridge in &mut self.bridges {
            let found = bridge
                .slots
                .iter()
                .find(|(_, id)| id.as_str() == device_id)
                .map(|(slot, _)| *slot);
            if let Some(slot) = found {
                bridge.slots.remove(&slot);
                return Ok(());
            }
        }
        Err(eyre!("device {device_id} is not plugged into any bridge"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_slot_zero_reserved() {
        let mut table = BridgeTable::create(BusType::Pci, 1);
        let slot = table.allocate("drive-0", BusType::Pci).unwrap();
        assert_eq!(slot.slot, 1);
        assert_eq!(slot.slot_string(), "01");
    }

    #[test]
    fn test_ccw_starts_at_zero() {
        let mut table = BridgeTable::create(BusType::Ccw, 1);
        let slot = table.allocate("drive-0", BusType::Ccw).unwrap();
        assert_eq!(slot.slot, 0);
        assert_eq!(slot.slot_string(), "0000");
        assert_eq!(slot.ccw_addr(), "fe.0.0000");
        assert_eq!(slot.ccw_virt_server_addr(), "0.0.0000");
    }

    #[test]
    fn test_allocate_scans_bridges_in_order() {
        let mut table = BridgeTable::create(BusType::Pci, 2);
        table.assign_addresses(2);
        for i in 0..30 {
            let slot = table.allocate(&format!("d{i}"), BusType::Pci).unwrap();
            assert_eq!(slot.bridge_id, "pci-bridge-0");
        }
        let overflow = table.allocate("d30", BusType::Pci).unwrap();
        assert_eq!(overflow.bridge_id, "pci-bridge-1");
        assert_eq!(overflow.bridge_addr, 3);
    }

    #[test]
    fn test_release_frees_slot_for_reuse() {
        let mut table = BridgeTable::create(BusType::Pci, 1);
        let first = table.allocate("a", BusType::Pci).unwrap();
        table.allocate("b", BusType::Pci).unwrap();
        table.release("a").unwrap();
        let reused = table.allocate("c", BusType::Pci).unwrap();
        assert_eq!(reused.slot, first.slot);
    }

    #[test]
    fn test_release_unknown_is_error() {
        let mut table = BridgeTable::create(BusType::Pci, 1);
        assert!(table.release("ghost").is_err());
    }

    #[test]
    fn test_wrong_bus_type_has_no_slots() {
        let mut table = BridgeTable::create(BusType::Pci, 1);
        assert!(table.allocate("a", BusType::Ccw).is_err());
    }

    #[test]
    fn test_pci_addr_format() {
        let slot = SlotRef {
            bus: BusType::Pci,
            bridge_id: "pci-bridge-1".into(),
            bridge_addr: 3,
            slot: 2,
        };
        assert_eq!(slot.pci_addr(), "03/02");
    }
}
