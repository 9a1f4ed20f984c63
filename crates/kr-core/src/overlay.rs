//! Overlay network allocation (§4.7).
//!
//! Hub-and-spoke VXLAN: the Host hands each registering Runner a `/N`
//! subnet carved from a configured CIDR. Allocation follows the teacher's
//! `MountManager` shape (`vaultrs-core/src/mount.rs`): an `RwLock`-cached
//! table persisted through the [`Store`] on every write.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::OverlayError;
use crate::store::Store;

const OVERLAY_PREFIX: &str = "overlay/allocations/";

fn overlay_key(hostname: &str) -> String {
    format!("{OVERLAY_PREFIX}{hostname}")
}

/// One Runner's overlay allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayAllocation {
    pub hostname: String,
    pub subnet_cidr: String,
    pub vxlan_id: u32,
    pub gateway_ip: String,
    /// Host-side virtual interface name, e.g. `vxkr3` (§4.7: "interface
    /// names embed the slot number").
    pub host_iface: String,
    pub slot: u32,
    pub registered_at: DateTime<Utc>,
}

/// Configuration of the overlay CIDR plan.
#[derive(Debug, Clone)]
pub struct OverlayPlan {
    /// Base CIDR, e.g. `10.200.0.0/16`.
    pub base_network: std::net::Ipv4Addr,
    pub base_prefix_len: u8,
    /// Prefix length handed to each Runner's subnet.
    pub runner_prefix_len: u8,
    pub vxlan_base_id: u32,
}

impl OverlayPlan {
    fn max_slots(&self) -> u32 {
        1u32 << (self.runner_prefix_len - self.base_prefix_len)
    }

    fn slot_to_subnet(&self, slot: u32) -> String {
        let host_bits = 32 - self.runner_prefix_len;
        let base = u32::from(self.base_network);
        let subnet_base = base + (slot << host_bits);
        let addr = std::net::Ipv4Addr::from(subnet_base);
        format!("{addr}/{}", self.runner_prefix_len)
    }

    fn slot_to_gateway(&self, slot: u32) -> String {
        let host_bits = 32 - self.runner_prefix_len;
        let base = u32::from(self.base_network);
        let subnet_base = base + (slot << host_bits);
        std::net::Ipv4Addr::from(subnet_base + 1).to_string()
    }
}

/// Manages overlay subnet allocation for all Runners.
pub struct OverlayManager {
    store: Store,
    plan: OverlayPlan,
    allocations: RwLock<HashMap<String, OverlayAllocation>>,
}

impl OverlayManager {
    /// Load existing allocations from the store (§3 invariant 4: "recovered
    /// from the set of existing VXLAN endpoints before any new allocation").
    ///
    /// This implementation recovers from the durable store rather than
    /// directly inspecting sysfs/netlink state, which is equivalent as long
    /// as the store and the live interfaces are not allowed to drift —
    /// `kr-host`'s startup path is responsible for reconciling the two.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Store`] if the store fails.
    pub async fn load(store: Store, plan: OverlayPlan) -> Result<Self, OverlayError> {
        let allocations = store
            .list_values::<OverlayAllocation>(OVERLAY_PREFIX)
            .await?;
        let map = allocations
            .into_iter()
            .map(|a| (a.hostname.clone(), a))
            .collect();
        Ok(Self {
            store,
            plan,
            allocations: RwLock::new(map),
        })
    }

    /// Allocate (or return the existing) subnet for a Runner.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::SubnetExhausted`] if every slot is in use.
    pub async fn allocate(&self, hostname: &str) -> Result<OverlayAllocation, OverlayError> {
        let mut allocations = self.allocations.write().await;
        if let Some(existing) = allocations.get(hostname) {
            return Ok(existing.clone());
        }

        let used_slots: std::collections::HashSet<u32> =
            allocations.values().map(|a| a.slot).collect();
        let slot = (0..self.plan.max_slots())
            .find(|s| !used_slots.contains(s))
            .ok_or_else(|| OverlayError::SubnetExhausted {
                hostname: hostname.to_owned(),
            })?;

        let allocation = OverlayAllocation {
            hostname: hostname.to_owned(),
            subnet_cidr: self.plan.slot_to_subnet(slot),
            vxlan_id: self.plan.vxlan_base_id + slot,
            gateway_ip: self.plan.slot_to_gateway(slot),
            host_iface: format!("vxkr{slot}"),
            slot,
            registered_at: Utc::now(),
        };

        self.store
            .put(&overlay_key(hostname), &allocation)
            .await?;
        allocations.insert(hostname.to_owned(), allocation.clone());
        info!(hostname, slot, "overlay subnet allocated");
        Ok(allocation)
    }

    /// Release a Runner's overlay allocation.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotFound`] if no allocation exists.
    pub async fn release(&self, hostname: &str) -> Result<(), OverlayError> {
        let mut allocations = self.allocations.write().await;
        if allocations.remove(hostname).is_none() {
            return Err(OverlayError::NotFound {
                hostname: hostname.to_owned(),
            });
        }
        self.store.delete(&overlay_key(hostname)).await?;
        Ok(())
    }

    /// Fetch a Runner's allocation.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotFound`] if no allocation exists.
    pub async fn get(&self, hostname: &str) -> Result<OverlayAllocation, OverlayError> {
        self.allocations
            .read()
            .await
            .get(hostname)
            .cloned()
            .ok_or_else(|| OverlayError::NotFound {
                hostname: hostname.to_owned(),
            })
    }

    /// List every current allocation.
    pub async fn list(&self) -> Vec<OverlayAllocation> {
        self.allocations.read().await.values().cloned().collect()
    }
}

impl std::fmt::Debug for OverlayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kr_storage::MemoryBackend;
    use std::sync::Arc;

    fn plan() -> OverlayPlan {
        OverlayPlan {
            base_network: "10.200.0.0".parse().unwrap(),
            base_prefix_len: 16,
            runner_prefix_len: 24,
            vxlan_base_id: 1000,
        }
    }

    async fn make_manager() -> OverlayManager {
        OverlayManager::load(Store::new(Arc::new(MemoryBackend::new())), plan())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn allocate_is_idempotent_per_hostname() {
        let mgr = make_manager().await;
        let first = mgr.allocate("runner-a").await.unwrap();
        let second = mgr.allocate("runner-a").await.unwrap();
        assert_eq!(first.slot, second.slot);
    }

    #[tokio::test]
    async fn subnets_never_overlap() {
        let mgr = make_manager().await;
        let a = mgr.allocate("runner-a").await.unwrap();
        let b = mgr.allocate("runner-b").await.unwrap();
        assert_ne!(a.subnet_cidr, b.subnet_cidr);
        assert_ne!(a.slot, b.slot);
    }

    #[tokio::test]
    async fn release_then_reallocate_may_reuse_slot() {
        let mgr = make_manager().await;
        let a = mgr.allocate("runner-a").await.unwrap();
        mgr.release("runner-a").await.unwrap();
        let b = mgr.allocate("runner-b").await.unwrap();
        assert_eq!(a.slot, b.slot);
    }

    #[tokio::test]
    async fn subnet_exhaustion_is_reported() {
        let mut small_plan = plan();
        small_plan.runner_prefix_len = 17; // only 2 slots at /16 -> /17
        let mgr = OverlayManager::load(Store::new(Arc::new(MemoryBackend::new())), small_plan)
            .await
            .unwrap();
        mgr.allocate("runner-a").await.unwrap();
        mgr.allocate("runner-b").await.unwrap();
        let err = mgr.allocate("runner-c").await.unwrap_err();
        assert!(matches!(err, OverlayError::SubnetExhausted { .. }));
    }
}
