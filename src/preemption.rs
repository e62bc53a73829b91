//! The preemption victim filter: a pure function selecting a
//! minimal set of on-host victims whose resources, plus host slack,
//! satisfy a pending task under the feasibility filter and the
//! preemption-eligibility policy.

use crate::metrics::PreemptionMetrics;
use crate::resources::{self, ResourceBag, ResourceKind};
use crate::store::{
    AttributeAggregate, AttributeStore, ResourceRequest, SchedulingFilter, TierManager,
    UnusedResource,
};
use crate::task::{HostOffer, PreemptionVictim, TaskConfig};

/// Whether `victim` may be preempted to admit `pending`, per the
/// eligibility rule.
pub fn is_eligible(
    pending: &TaskConfig,
    pending_preemptible: bool,
    victim: &TaskConfig,
    victim_preemptible: bool,
) -> bool {
    if !pending_preemptible && victim_preemptible {
        return true;
    }
    if pending_preemptible == victim_preemptible && pending.role() == victim.role() {
        return pending.priority > victim.priority;
    }
    false
}

/// The freeable resource bag a victim would contribute if evicted: its own
/// bag with revocable components stripped when the victim's tier is
/// revocable, plus the fixed per-task executor overhead.
fn freeable_bag(victim_resources: &ResourceBag, victim_revocable: bool, executor_overhead: &ResourceBag) -> ResourceBag {
    let stripped = if victim_revocable {
        victim_resources.strip_revocable()
    } else {
        victim_resources.clone()
    };
    stripped.add(executor_overhead)
}

/// Compute the offer's non-revocable resources, or an empty bag if no
/// offer is present.
fn slack_of(offer: Option<&HostOffer>) -> ResourceBag {
    match offer {
        Some(offer) => offer
            .offered_resources
            .filter(|kind| !kind.is_revocable()),
        None => ResourceBag::new(),
    }
}

/// Find the single host all victims (and the offer, if present) are
/// located on. More than one distinct hostname among them is a malformed
/// input -- a precondition error, not a runtime "no solution".
fn single_hostname<'a>(
    victims: impl Iterator<Item = &'a PreemptionVictim>,
    offer: Option<&'a HostOffer>,
) -> Option<String> {
    let mut hosts: Vec<&str> = victims.map(|v| v.slave_host.as_str()).collect();
    if let Some(offer) = offer {
        hosts.push(offer.hostname.as_str());
    }
    hosts.sort_unstable();
    hosts.dedup();
    match hosts.as_slice() {
        [] => None,
        [single] => Some((*single).to_string()),
        _ => panic!("preemption candidates and offer span more than one host: {hosts:?}"),
    }
}

/// Select a minimal set of victims sufficient to admit `pending`, or
/// `None` for "no solution". Never returns an `Err`: missing host
/// attributes and the absence of any eligible victim both collapse to
/// "no solution", distinguished only by `metrics`.
#[allow(clippy::too_many_arguments)]
pub fn find_victims<'a>(
    pending: &TaskConfig,
    victims: impl IntoIterator<Item = &'a PreemptionVictim>,
    aggregate: &AttributeAggregate,
    offer: Option<&HostOffer>,
    executor_overhead: &ResourceBag,
    tiers: &dyn TierManager,
    attribute_store: &dyn AttributeStore,
    filter: &dyn SchedulingFilter,
    metrics: &PreemptionMetrics,
) -> Option<Vec<PreemptionVictim>> {
    let victims: Vec<&PreemptionVictim> = victims.into_iter().collect();

    let host = single_hostname(victims.iter().copied(), offer)?;

    let slack = slack_of(offer);

    let pending_tier = tiers.get_tier(pending);

    let mut survivors: Vec<(&PreemptionVictim, ResourceBag)> = victims
        .into_iter()
        .filter(|victim| {
            let victim_tier = tiers.get_tier(&victim.config);
            is_eligible(
                pending,
                pending_tier.is_preemptible,
                &victim.config,
                victim_tier.is_preemptible,
            )
        })
        .map(|victim| {
            let victim_tier = tiers.get_tier(&victim.config);
            let freeable = freeable_bag(&victim.resources, victim_tier.is_revocable, executor_overhead);
            (victim, freeable)
        })
        .collect();

    if survivors.is_empty() {
        return None;
    }

    // Descending by freeable-resource dominance; ties (including
    // incomparable mixed-sign deltas) preserve input order, since
    // `sort_by` is stable.
    survivors.sort_by(|(_, a), (_, b)| resources::compare(b, a));

    let host_attributes = match attribute_store.get_host_attributes(&host) {
        Ok(Some(attrs)) => attrs,
        Ok(None) | Err(_) => {
            metrics.record_missing_host_attributes();
            return None;
        }
    };

    let required = pending.resources.add(executor_overhead);
    let request = ResourceRequest {
        config: pending.clone(),
        required,
        aggregate: aggregate.clone(),
    };

    let mut accumulated = slack;
    let mut chosen = Vec::new();

    for (victim, freeable) in survivors {
        accumulated = accumulated.add(&freeable);
        chosen.push(victim.clone());

        let unused = UnusedResource {
            bag: accumulated.clone(),
            attributes: host_attributes.clone(),
        };

        if filter.filter(&unused, &request).is_empty() {
            return Some(chosen);
        }
    }

    None
}
