//! Pool-backed resource provider.
//!
//! [`PoolProvider`] serves checkouts from the instance list declared in its
//! ruleset. Exclusive pools (IUTs, execution spaces) lease each instance to
//! at most one owner and make later checkouts wait for returns; shared
//! pools (log areas) hand out any number of leases, rotating over the
//! configured instances.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::{ProviderError, ProviderResult, Resource, ResourceKind, ResourceProvider};
use crate::config::{Dataset, Ruleset};

/// A resource provider backed by a fixed pool of instances.
pub struct PoolProvider {
    id: String,
    kind: ResourceKind,
    shared: bool,
    wait_timeout: Duration,
    state: Mutex<PoolState>,
    returned: Notify,
}

struct PoolState {
    available: Vec<Instance>,
    leased: HashMap<String, Instance>,
    /// Rotation cursor for shared pools.
    cursor: usize,
}

#[derive(Clone)]
struct Instance {
    identifier: String,
    attributes: serde_json::Map<String, serde_json::Value>,
}

impl PoolProvider {
    /// Build a provider from its ruleset.
    ///
    /// Instances are identified by their `id` attribute when present,
    /// otherwise by `<provider_id>-<index>`.
    pub fn from_ruleset(kind: ResourceKind, ruleset: &Ruleset) -> Self {
        let instances: Vec<Instance> = ruleset
            .instances
            .iter()
            .enumerate()
            .map(|(index, attributes)| Instance {
                identifier: attributes
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| format!("{}-{}", ruleset.id, index)),
                attributes: attributes.clone(),
            })
            .collect();

        Self {
            id: ruleset.id.clone(),
            kind,
            shared: ruleset.shared,
            wait_timeout: Duration::from_secs(ruleset.wait_timeout_secs),
            state: Mutex::new(PoolState {
                available: instances,
                leased: HashMap::new(),
                cursor: 0,
            }),
            returned: Notify::new(),
        }
    }

    fn resource(&self, instance: &Instance) -> Resource {
        Resource {
            kind: self.kind,
            provider_id: self.id.clone(),
            identifier: instance.identifier.clone(),
            attributes: instance.attributes.clone(),
        }
    }

    fn checkout_shared(&self, dataset: &Dataset, count: usize) -> ProviderResult<Vec<Resource>> {
        let mut state = self.state.lock().unwrap();
        if state.available.is_empty() {
            return Err(ProviderError::ProvisioningFailed(format!(
                "{} provider {:?} has no instances configured",
                self.kind, self.id
            )));
        }
        // Rotate over the first `window` instances; the dataset amount
        // bounds how many distinct instances leases are spread across.
        let window = dataset
            .amount_for(self.kind)
            .unwrap_or(state.available.len())
            .clamp(1, state.available.len());

        let mut leases = Vec::with_capacity(count);
        for _ in 0..count {
            let instance = state.available[state.cursor % window].clone();
            state.cursor += 1;
            leases.push(self.resource(&instance));
        }
        Ok(leases)
    }
}

#[async_trait]
impl ResourceProvider for PoolProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn checkout(
        &self,
        dataset: &Dataset,
        minimum: usize,
        maximum: usize,
    ) -> ProviderResult<Vec<Resource>> {
        let minimum = minimum.max(1);
        // The dataset amount caps the maximum but never undercuts the
        // minimum the caller needs to make progress.
        let maximum = dataset
            .amount_for(self.kind)
            .map_or(maximum, |amount| maximum.min(amount))
            .max(minimum);

        if self.shared {
            return self.checkout_shared(dataset, maximum);
        }

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.available.len() >= minimum {
                    let take = state.available.len().min(maximum);
                    let mut leases = Vec::with_capacity(take);
                    for _ in 0..take {
                        let instance = state.available.pop().expect("available not empty");
                        state
                            .leased
                            .insert(instance.identifier.clone(), instance.clone());
                        leases.push(self.resource(&instance));
                    }
                    debug!(
                        "Checked out {} {}(s) from provider {:?}",
                        leases.len(),
                        self.kind,
                        self.id
                    );
                    return Ok(leases);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ProviderError::ProvisioningFailed(format!(
                    "{} provider {:?} could not supply {} instance(s) within {:?}",
                    self.kind, self.id, minimum, self.wait_timeout
                )));
            }
            // Wait for a checkin to return capacity, up to the deadline.
            let _ = timeout_at(deadline, self.returned.notified()).await;
        }
    }

    async fn checkin(&self, resource: Resource) -> ProviderResult<()> {
        if resource.provider_id != self.id || resource.kind != self.kind {
            return Err(ProviderError::UnknownResource(format!(
                "{} {:?} does not belong to {} provider {:?}",
                resource.kind, resource.identifier, self.kind, self.id
            )));
        }

        if self.shared {
            let state = self.state.lock().unwrap();
            if state
                .available
                .iter()
                .any(|i| i.identifier == resource.identifier)
            {
                return Ok(());
            }
            return Err(ProviderError::UnknownResource(format!(
                "{} {:?} is not configured in provider {:?}",
                self.kind, resource.identifier, self.id
            )));
        }

        let mut state = self.state.lock().unwrap();
        match state.leased.remove(&resource.identifier) {
            Some(instance) => {
                state.available.push(instance);
                drop(state);
                self.returned.notify_waiters();
                debug!(
                    "Checked in {} {:?} to provider {:?}",
                    self.kind, resource.identifier, self.id
                );
                Ok(())
            }
            // Not leased: either already checked in or never ours.
            None => Err(ProviderError::UnknownResource(format!(
                "{} {:?} is not checked out from provider {:?}",
                self.kind, resource.identifier, self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn ruleset(id: &str, shared: bool, timeout_secs: u64, count: usize) -> Ruleset {
        Ruleset {
            id: id.to_string(),
            shared,
            wait_timeout_secs: timeout_secs,
            instances: (0..count)
                .map(|i| {
                    let mut attrs = serde_json::Map::new();
                    attrs.insert(
                        "identity".to_string(),
                        serde_json::Value::String(format!("instance-{i}")),
                    );
                    attrs
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_checkout_and_checkin_round_trip() {
        let provider = PoolProvider::from_ruleset(ResourceKind::Iut, &ruleset("p", false, 1, 2));
        let dataset = Dataset::default();

        let leases = provider.checkout(&dataset, 1, 2).await.unwrap();
        assert_eq!(leases.len(), 2);

        provider.checkin(leases[0].clone()).await.unwrap();
        let again = provider.checkout(&dataset, 1, 1).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_double_checkin_is_an_error() {
        let provider = PoolProvider::from_ruleset(ResourceKind::Iut, &ruleset("p", false, 1, 1));
        let dataset = Dataset::default();

        let lease = provider
            .checkout(&dataset, 1, 1)
            .await
            .unwrap()
            .pop()
            .unwrap();
        provider.checkin(lease.clone()).await.unwrap();

        assert!(matches!(
            provider.checkin(lease).await,
            Err(ProviderError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn test_checkout_fails_when_minimum_unmet() {
        let provider = PoolProvider::from_ruleset(ResourceKind::Iut, &ruleset("p", false, 0, 1));
        let dataset = Dataset::default();

        let result = provider.checkout(&dataset, 2, 2).await;
        assert!(matches!(
            result,
            Err(ProviderError::ProvisioningFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkout_waits_for_checkin() {
        let provider = Arc::new(PoolProvider::from_ruleset(
            ResourceKind::ExecutionSpace,
            &ruleset("p", false, 30, 1),
        ));
        let dataset = Dataset::default();

        let lease = provider
            .checkout(&dataset, 1, 1)
            .await
            .unwrap()
            .pop()
            .unwrap();

        let returner = provider.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            returner.checkin(lease).await.unwrap();
        });

        let leases = provider.checkout(&dataset, 1, 1).await.unwrap();
        assert_eq!(leases.len(), 1);
    }

    #[tokio::test]
    async fn test_shared_pool_rotates_within_dataset_window() {
        let provider = PoolProvider::from_ruleset(ResourceKind::LogArea, &ruleset("p", true, 1, 2));
        let dataset = Dataset {
            log_area_amount: Some(1),
            ..Dataset::default()
        };

        let first = provider.checkout(&dataset, 1, 1).await.unwrap();
        let second = provider.checkout(&dataset, 1, 1).await.unwrap();
        let third = provider.checkout(&dataset, 1, 1).await.unwrap();

        // All leases land on the single area allowed by the dataset.
        assert_eq!(first[0].identifier, second[0].identifier);
        assert_eq!(second[0].identifier, third[0].identifier);

        provider.checkin(first[0].clone()).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_pool_checkin_of_unknown_area_fails() {
        let provider = PoolProvider::from_ruleset(ResourceKind::LogArea, &ruleset("p", true, 1, 1));
        let mut lease = provider
            .checkout(&Dataset::default(), 1, 1)
            .await
            .unwrap()
            .pop()
            .unwrap();
        lease.identifier = "bogus".to_string();

        assert!(matches!(
            provider.checkin(lease).await,
            Err(ProviderError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn test_dataset_amount_never_undercuts_minimum() {
        let provider =
            PoolProvider::from_ruleset(ResourceKind::ExecutionSpace, &ruleset("p", false, 1, 3));
        let dataset = Dataset {
            execution_space_amount: Some(1),
            ..Dataset::default()
        };

        // Three spaces are needed to make progress; the amount only caps
        // surplus, it does not starve the checkout.
        let leases = provider.checkout(&dataset, 3, 3).await.unwrap();
        assert_eq!(leases.len(), 3);
    }
}
