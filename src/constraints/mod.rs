/*
* Constraint resolution
* ---------------------
* Turns the loose placement hints found on guests into the explicit Constraint
* list the planner works with. Hints come from three sources, in precedence order:
*
*   tags   plb_affinity_<key>, plb_anti_affinity_<key>, plb_ignore_*, plb_pin_<node>
*   pools  balancing.pools.<pool> = { type, pin, strict }
*   HA     resource-affinity (positive / negative) and node-affinity rules
*
* A guest keeps at most one affinity group, one anti-affinity group and one pin.
* Every hint that loses is reported as a ConstraintConflict and logged.
*/

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::config::balancing::{BalancingConfig, PoolGroupKind};
use crate::core::guest::{Constraint, GroupId, Guest, GuestId};
use crate::core::snapshot::{ClusterSnapshot, HaAffinity, HaRule, HaRuleKind};
use crate::errors::ConstraintConflict;

const TAG_AFFINITY: &str = "plb_affinity_";
const TAG_ANTI_AFFINITY: &str = "plb_anti_affinity_";
const TAG_IGNORE: &str = "plb_ignore";
const TAG_PIN: &str = "plb_pin_";

/// Groups and conflicts produced by one resolution.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub affinity_groups: BTreeMap<GroupId, BTreeSet<GuestId>>,
    pub anti_affinity_groups: BTreeMap<GroupId, BTreeSet<GuestId>>,
    pub ignored: BTreeSet<GuestId>,
    pub conflicts: Vec<ConstraintConflict>,
}

#[derive(Debug, Default)]
struct Hints {
    affinity: Vec<Vec<GroupId>>,
    anti_affinity: Vec<Vec<GroupId>>,
    pins: Vec<(String, BTreeSet<String>, bool)>,
    ignored: bool,
}

pub struct ConstraintResolver<'a> {
    config: &'a BalancingConfig,
}

impl<'a> ConstraintResolver<'a> {
    pub fn new(config: &'a BalancingConfig) -> Self {
        Self { config }
    }

    /// Rewrites `constraints` on every guest of the snapshot.
    pub fn resolve(&self, snapshot: &mut ClusterSnapshot) -> Resolution {
        let known_nodes: BTreeSet<String> = snapshot.nodes.keys().cloned().collect();
        let rules: BTreeMap<&str, &HaRule> = snapshot
            .ha_rules
            .iter()
            .filter(|r| !r.disabled)
            .map(|r| (r.id.as_str(), r))
            .collect();

        let mut resolution = Resolution::default();
        let mut resolved = BTreeMap::new();
        for guest in snapshot.guests.values() {
            let hints = self.collect_hints(guest, &rules);
            let constraints = self.resolve_guest(guest, hints, &known_nodes, &mut resolution.conflicts);
            resolved.insert(guest.id, constraints);
        }
        for (id, constraints) in resolved {
            if let Some(guest) = snapshot.guests.get_mut(&id) {
                guest.constraints = constraints;
            }
        }

        self.break_unsatisfiable_affinity(snapshot, &mut resolution.conflicts);

        for guest in snapshot.guests.values() {
            if guest.is_ignored() {
                resolution.ignored.insert(guest.id);
                continue;
            }
            if !guest.is_running() {
                continue;
            }
            if let Some(group) = guest.affinity_group() {
                resolution
                    .affinity_groups
                    .entry(group.clone())
                    .or_default()
                    .insert(guest.id);
            }
            if let Some(group) = guest.anti_affinity_group() {
                resolution
                    .anti_affinity_groups
                    .entry(group.clone())
                    .or_default()
                    .insert(guest.id);
            }
        }

        debug!(
            affinity_groups = resolution.affinity_groups.len(),
            anti_affinity_groups = resolution.anti_affinity_groups.len(),
            ignored = resolution.ignored.len(),
            conflicts = resolution.conflicts.len(),
            "Resolved placement constraints"
        );
        resolution
    }

    fn collect_hints(&self, guest: &Guest, rules: &BTreeMap<&str, &HaRule>) -> Hints {
        let mut hints = Hints::default();
        let mut tag_affinity = Vec::new();
        let mut tag_anti = Vec::new();
        let mut tag_pins = BTreeSet::new();
        for tag in &guest.tags {
            if let Some(key) = tag.strip_prefix(TAG_ANTI_AFFINITY) {
                tag_anti.push(GroupId::new("tag", key));
            } else if let Some(key) = tag.strip_prefix(TAG_AFFINITY) {
                tag_affinity.push(GroupId::new("tag", key));
            } else if let Some(node) = tag.strip_prefix(TAG_PIN) {
                tag_pins.insert(node.to_string());
            } else if tag.starts_with(TAG_IGNORE) {
                hints.ignored = true;
            }
        }
        if !tag_pins.is_empty() {
            hints
                .pins
                .push(("tags".to_string(), tag_pins, self.config.enforce_pinning));
        }

        let mut pool_affinity = Vec::new();
        let mut pool_anti = Vec::new();
        for pool in &guest.pools {
            let Some(policy) = self.config.pools.get(pool) else {
                continue;
            };
            match policy.kind {
                Some(PoolGroupKind::Affinity) => pool_affinity.push(GroupId::new("pool", pool)),
                Some(PoolGroupKind::AntiAffinity) => pool_anti.push(GroupId::new("pool", pool)),
                None => {}
            }
            if !policy.pin.is_empty() {
                hints.pins.push((
                    format!("pool {}", pool),
                    policy.pin.iter().cloned().collect(),
                    policy.strict.unwrap_or(self.config.enforce_pinning),
                ));
            }
        }

        let mut ha_affinity = Vec::new();
        let mut ha_anti = Vec::new();
        for rule_id in &guest.ha_rules {
            let Some(rule) = rules.get(rule_id.as_str()) else {
                continue;
            };
            match &rule.kind {
                HaRuleKind::ResourceAffinity { affinity: HaAffinity::Positive } => {
                    ha_affinity.push(GroupId::new("ha", &rule.id))
                }
                HaRuleKind::ResourceAffinity { affinity: HaAffinity::Negative } => {
                    ha_anti.push(GroupId::new("ha", &rule.id))
                }
                HaRuleKind::NodeAffinity { nodes, strict } => hints.pins.push((
                    format!("ha rule {}", rule.id),
                    nodes.iter().cloned().collect(),
                    *strict,
                )),
            }
        }

        hints.affinity = vec![tag_affinity, pool_affinity, ha_affinity];
        hints.anti_affinity = vec![tag_anti, pool_anti, ha_anti];
        hints
    }

    fn resolve_guest(
        &self,
        guest: &Guest,
        hints: Hints,
        known_nodes: &BTreeSet<String>,
        conflicts: &mut Vec<ConstraintConflict>,
    ) -> Vec<Constraint> {
        if hints.ignored {
            return vec![Constraint::Ignored];
        }

        let mut report = |message: String, excluded: bool| {
            warn!(guest = %guest.name, excluded, "{}", message);
            conflicts.push(ConstraintConflict {
                guest: guest.name.clone(),
                message,
                excluded,
            });
        };

        let mut affinity = pick_group(hints.affinity, "affinity", &mut report);
        let anti_affinity = pick_group(hints.anti_affinity, "anti-affinity", &mut report);

        if let (Some(a), Some(anti)) = (&affinity, &anti_affinity) {
            if a.key() == anti.key() {
                report(
                    format!("{} is both affinity and anti-affinity, keeping anti-affinity", a.key()),
                    false,
                );
                affinity = None;
            }
        }

        let mut pins = hints.pins.into_iter();
        let pin = pins.next();
        for (source, _, _) in pins {
            report(format!("node pin from {} ignored, an earlier pin wins", source), false);
        }

        let mut constraints = Vec::new();
        if let Some((source, nodes, strict)) = pin {
            let (known, unknown): (BTreeSet<String>, BTreeSet<String>) =
                nodes.into_iter().partition(|n| known_nodes.contains(n));
            if known.is_empty() {
                report(
                    format!(
                        "pin from {} names only unknown nodes {:?}, guest excluded from placement",
                        source, unknown
                    ),
                    true,
                );
                return vec![Constraint::Ignored];
            }
            if !unknown.is_empty() {
                debug!(guest = %guest.name, ?unknown, "Dropping unknown pinned nodes");
            }
            constraints.push(Constraint::NodePinned { nodes: known, strict });
        }
        if let Some(group) = affinity {
            constraints.push(Constraint::Affinity { group });
        }
        if let Some(group) = anti_affinity {
            constraints.push(Constraint::AntiAffinity { group });
        }
        constraints
    }

    /// A strict pin beats affinity: groups whose members cannot share any allowed node lose their affinity.
    fn break_unsatisfiable_affinity(
        &self,
        snapshot: &mut ClusterSnapshot,
        conflicts: &mut Vec<ConstraintConflict>,
    ) {
        let mut members: BTreeMap<GroupId, Vec<GuestId>> = BTreeMap::new();
        for guest in snapshot.guests.values() {
            if let Some(group) = guest.affinity_group() {
                members.entry(group.clone()).or_default().push(guest.id);
            }
        }

        for (group, ids) in members {
            let mut allowed: Option<BTreeSet<String>> = None;
            for id in &ids {
                if let Some((nodes, true)) = snapshot.guests.get(id).and_then(|g| g.node_pin()) {
                    allowed = Some(match allowed {
                        None => nodes.clone(),
                        Some(current) => current.intersection(nodes).cloned().collect(),
                    });
                }
            }
            if !matches!(allowed, Some(ref nodes) if nodes.is_empty()) {
                continue;
            }

            for id in &ids {
                if let Some(guest) = snapshot.guests.get_mut(id) {
                    guest
                        .constraints
                        .retain(|c| !matches!(c, Constraint::Affinity { .. }));
                    let message = format!(
                        "strict pins of affinity group {} share no node, affinity dropped",
                        group
                    );
                    warn!(guest = %guest.name, group = %group, "{}", message);
                    conflicts.push(ConstraintConflict {
                        guest: guest.name.clone(),
                        message,
                        excluded: false,
                    });
                }
            }
        }
    }
}

/// First non-empty source wins; inside it, the smallest key.
fn pick_group(
    sources: Vec<Vec<GroupId>>,
    kind: &str,
    report: &mut impl FnMut(String, bool),
) -> Option<GroupId> {
    let mut chosen: Option<GroupId> = None;
    for mut candidates in sources {
        candidates.sort();
        candidates.dedup();
        for candidate in candidates {
            match &chosen {
                None => chosen = Some(candidate),
                Some(winner) => report(
                    format!("{} group {} ignored in favour of {}", kind, candidate, winner),
                    false,
                ),
            }
        }
    }
    chosen
}
