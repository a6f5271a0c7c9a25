mod common;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};

use common::{memory_config, plan, ClusterBuilder};
use vm_balancer::config::balancing::{Method, Mode};
use vm_balancer::config::BalancingConfig;
use vm_balancer::core::guest::{GuestId, GuestKind, GuestState};
use vm_balancer::core::resources::{Resource, Resources, GIB};
use vm_balancer::scheduler::{MoveReason, Planner};

fn three_nodes() -> ClusterBuilder {
    ClusterBuilder::new()
        .node("pve1", 100.0, 60.0)
        .node("pve2", 100.0, 40.0)
        .node("pve3", 100.0, 45.0)
        .guest(100, "g1", "pve1", 20.0, &[])
}

#[test]
fn test_overloaded_node_sheds_guest_to_least_loaded() {
    let config = BalancingConfig::default();
    let mut snapshot = three_nodes().snapshot(&config);
    let (plan, _) = plan(&config, &mut snapshot);

    assert!(!plan.balance.balanced);
    assert_eq!(plan.moves.len(), 1);
    let m = &plan.moves[0];
    assert_eq!(m.guest, GuestId(100));
    assert_eq!((m.source.as_str(), m.target.as_str()), ("pve1", "pve2"));
    assert_eq!(m.reason, MoveReason::Rebalance);
    assert!((m.metrics.source_load_after - 60.0).abs() < 1e-9);
    assert!((m.metrics.target_load_after - 60.0).abs() < 1e-9);

    let g1 = snapshot.guest(GuestId(100)).unwrap();
    assert_eq!(g1.node_target, "pve2");
    assert!(g1.processed);
    assert!(plan.projected.spread < plan.balance.spread);
}

#[test]
fn test_second_pass_after_applying_plan_is_empty() {
    let config = memory_config(5.0);
    let mut snapshot = three_nodes().snapshot(&config);
    let (first, _) = plan(&config, &mut snapshot);
    assert!(!first.moves.is_empty());

    for m in &first.moves {
        snapshot.apply_completed(m.guest, &m.target);
    }
    let (second, _) = plan(&config, &mut snapshot);
    assert!(second.moves.is_empty(), "unexpected moves: {:?}", second.moves);
}

#[test]
fn test_planning_unchanged_snapshot_twice_gives_same_moves() {
    let config = memory_config(5.0);
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 100.0, 50.0)
        .node("pve2", 100.0, 20.0)
        .node("pve3", 100.0, 30.0)
        .guest(100, "g1", "pve1", 10.0, &[])
        .guest(101, "g2", "pve1", 6.0, &["plb_anti_affinity_db"])
        .guest(102, "g3", "pve2", 4.0, &["plb_anti_affinity_db"])
        .snapshot(&config);
    let (first, _) = plan(&config, &mut snapshot);
    let (second, _) = plan(&config, &mut snapshot);

    assert!(!first.moves.is_empty());
    assert_eq!(first.moves, second.moves);
    assert_eq!(first.unplaceable, second.unplaceable);
}

#[test]
fn test_move_blocked_by_target_disk() {
    let config = memory_config(5.0);
    let cluster = |target_disk_used: f64| {
        ClusterBuilder::new()
            .node("pve1", 100.0, 60.0)
            .node("pve2", 100.0, 40.0)
            .disk("pve2", 100.0, target_disk_used)
            .guest(100, "bulky", "pve1", 20.0, &[])
            .resize(100, 1.0, 20.0, 500.0)
    };

    let mut snapshot = cluster(90.0).snapshot(&config);
    let (blocked, _) = plan(&config, &mut snapshot);
    assert!(blocked.moves.is_empty(), "unexpected moves: {:?}", blocked.moves);
    assert_eq!(snapshot.guest(GuestId(100)).unwrap().node_target, "pve1");

    let roomy = ClusterBuilder::new()
        .node("pve1", 100.0, 60.0)
        .node("pve2", 100.0, 40.0)
        .disk("pve2", 1000.0, 90.0)
        .guest(100, "bulky", "pve1", 20.0, &[])
        .resize(100, 1.0, 20.0, 500.0);
    let mut snapshot = roomy.snapshot(&config);
    let (open, _) = plan(&config, &mut snapshot);
    assert_eq!(open.moves.len(), 1);
    assert_eq!(open.moves[0].target, "pve2");
}

#[test]
fn test_split_affinity_group_is_colocated() {
    let config = BalancingConfig::default();
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 100.0, 10.0)
        .node("pve2", 100.0, 10.0)
        .guest(100, "web1", "pve1", 4.0, &["plb_affinity_web"])
        .guest(101, "web2", "pve2", 4.0, &["plb_affinity_web"])
        .snapshot(&config);
    let (plan, resolution) = plan(&config, &mut snapshot);

    assert_eq!(resolution.affinity_groups.len(), 1);
    assert_eq!(plan.moves.len(), 1);
    assert_eq!(plan.moves[0].reason, MoveReason::Constraint);
    let web1 = snapshot.guest(GuestId(100)).unwrap();
    let web2 = snapshot.guest(GuestId(101)).unwrap();
    assert_eq!(web1.node_target, web2.node_target);
}

#[test]
fn test_affinity_group_without_room_stays_put() {
    let config = BalancingConfig::default();
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 32.0, 26.0)
        .node("pve2", 32.0, 26.0)
        .guest(100, "web1", "pve1", 4.0, &["plb_affinity_web"])
        .guest(101, "web2", "pve2", 4.0, &["plb_affinity_web"])
        .snapshot(&config);
    let (plan, _) = plan(&config, &mut snapshot);

    assert!(plan.moves.is_empty());
    let stuck: BTreeSet<GuestId> = plan.unplaceable.iter().map(|u| u.guest).collect();
    assert_eq!(stuck, BTreeSet::from([GuestId(100), GuestId(101)]));
    assert!(matches!(
        plan.unplaceable[0].to_error(),
        vm_balancer::BalancerError::PlacementInfeasible { .. }
    ));
}

#[test]
fn test_anti_affinity_members_are_separated() {
    let config = BalancingConfig::default();
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 100.0, 10.0)
        .node("pve2", 100.0, 10.0)
        .guest(100, "db1", "pve1", 4.0, &["plb_anti_affinity_db"])
        .guest(101, "db2", "pve1", 4.0, &["plb_anti_affinity_db"])
        .snapshot(&config);
    let (plan, _) = plan(&config, &mut snapshot);

    assert_eq!(plan.moves.len(), 1);
    let m = &plan.moves[0];
    assert_eq!(m.guest, GuestId(101));
    assert_eq!(m.target, "pve2");
    assert_eq!(m.reason, MoveReason::Constraint);
}

#[test]
fn test_strict_pin_moves_guest_to_allowed_node() {
    let config = BalancingConfig {
        enforce_pinning: true,
        ..BalancingConfig::default()
    };
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 100.0, 10.0)
        .node("pve2", 100.0, 5.0)
        .node("pve3", 100.0, 30.0)
        .guest(100, "pinned", "pve1", 4.0, &["plb_pin_pve3"])
        .snapshot(&config);
    let (plan, _) = plan(&config, &mut snapshot);

    assert_eq!(plan.moves.len(), 1);
    assert_eq!(plan.moves[0].target, "pve3");
    assert_eq!(plan.moves[0].reason, MoveReason::Constraint);
}

#[test]
fn test_maintenance_node_is_emptied_even_when_balanced() {
    let config = BalancingConfig {
        balanciness: 100.0,
        maintenance_nodes: ["pve1".to_string()].into_iter().collect(),
        ..BalancingConfig::default()
    };
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 100.0, 10.0)
        .node("pve2", 100.0, 50.0)
        .node("pve3", 100.0, 20.0)
        .guest(100, "g1", "pve1", 8.0, &[])
        .guest(101, "g2", "pve1", 4.0, &[])
        .guest_with_state(102, "g3", "pve1", 4.0, &[], GuestState::Stopped)
        .guest(103, "g4", "pve3", 4.0, &[])
        .snapshot(&config);
    let (plan, _) = plan(&config, &mut snapshot);

    assert!(plan.balance.balanced);
    let evacuated: BTreeSet<GuestId> = plan
        .moves
        .iter()
        .filter(|m| m.reason == MoveReason::Maintenance)
        .map(|m| m.guest)
        .collect();
    assert_eq!(evacuated, BTreeSet::from([GuestId(100), GuestId(101)]));
    assert!(plan.moves.iter().all(|m| m.target != "pve1"));
    assert_eq!(plan.count(MoveReason::Rebalance), 0);
    // stopped guests are not migrated
    assert_eq!(snapshot.guest(GuestId(102)).unwrap().node_target, "pve1");
}

#[test]
fn test_maintenance_evacuates_kinds_excluded_from_balancing() {
    let config = BalancingConfig {
        maintenance_nodes: ["pve1".to_string()].into_iter().collect(),
        balance_types: [GuestKind::Vm].into_iter().collect(),
        ..BalancingConfig::default()
    };
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 100.0, 10.0)
        .node("pve2", 100.0, 10.0)
        .guest(100, "vm1", "pve1", 4.0, &[])
        .guest(101, "ct1", "pve1", 2.0, &[])
        .kind(101, GuestKind::Container)
        .snapshot(&config);
    let (plan, _) = plan(&config, &mut snapshot);

    let evacuated: BTreeSet<GuestId> = plan.moves.iter().map(|m| m.guest).collect();
    assert_eq!(evacuated, BTreeSet::from([GuestId(100), GuestId(101)]));
    assert!(plan.moves.iter().all(|m| m.reason == MoveReason::Maintenance));
    assert!(plan.unplaceable.is_empty());
}

#[test]
fn test_ignored_node_is_evacuated_and_never_a_target() {
    let config = BalancingConfig {
        ignore_nodes: ["pve1".to_string()].into_iter().collect(),
        memory_threshold: None,
        ..BalancingConfig::default()
    };
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 100.0, 5.0)
        .node("pve2", 100.0, 70.0)
        .node("pve3", 100.0, 20.0)
        .guest(100, "g1", "pve1", 4.0, &[])
        .guest(101, "g2", "pve2", 10.0, &[])
        .snapshot(&config);
    let (plan, _) = plan(&config, &mut snapshot);

    let from_ignored: Vec<_> = plan.moves.iter().filter(|m| m.source == "pve1").collect();
    assert_eq!(from_ignored.len(), 1);
    assert_eq!(from_ignored[0].reason, MoveReason::Maintenance);
    assert!(plan.moves.iter().all(|m| m.target != "pve1"));
}

#[test]
fn test_larger_guests_move_first_when_configured() {
    let cluster = ClusterBuilder::new()
        .node("pve1", 100.0, 10.0)
        .node("pve2", 100.0, 10.0)
        .node("pve3", 100.0, 10.0)
        .guest(100, "small", "pve1", 2.0, &[])
        .guest(101, "large", "pve1", 8.0, &[])
        .guest(102, "medium", "pve1", 4.0, &[]);
    let order = |larger_first: bool| {
        let config = BalancingConfig {
            maintenance_nodes: ["pve1".to_string()].into_iter().collect(),
            balance_larger_guests_first: larger_first,
            ..BalancingConfig::default()
        };
        let mut snapshot = cluster.snapshot(&config);
        let (plan, _) = common::plan(&config, &mut snapshot);
        plan.moves.iter().map(|m| m.guest.0).collect::<Vec<_>>()
    };

    assert_eq!(order(true), vec![101, 102, 100]);
    assert_eq!(order(false), vec![100, 101, 102]);
}

#[test]
fn test_pressure_mode_skips_hot_targets() {
    let cluster = ClusterBuilder::new()
        .node("pve1", 100.0, 40.0)
        .node("pve2", 100.0, 20.0)
        .node("pve3", 100.0, 30.0)
        .node_pressure("pve1", &[50.0; 12])
        // quiet on average, but the latest sample spikes
        .node_pressure("pve2", &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 35.0])
        .node_pressure("pve3", &[8.0; 12])
        .guest(100, "g1", "pve1", 20.0, &[])
        .guest_pressure(100, &[30.0; 12]);

    let config = BalancingConfig {
        mode: Mode::Pressure,
        ..memory_config(5.0)
    };
    let mut snapshot = cluster.snapshot(&config);
    assert!(snapshot.node("pve2").unwrap().hot());
    assert!(!snapshot.node("pve3").unwrap().hot());
    let (pressured, _) = plan(&config, &mut snapshot);
    assert_eq!(pressured.moves.len(), 1);
    assert_eq!(pressured.moves[0].target, "pve3");
    assert!((pressured.moves[0].metrics.source_load_after - 20.0).abs() < 1e-9);

    let config = memory_config(5.0);
    let mut snapshot = cluster.snapshot(&config);
    let (used, _) = common::plan(&config, &mut snapshot);
    assert_eq!(used.moves.len(), 1);
    assert_eq!(used.moves[0].target, "pve2");
}

#[test]
fn test_assigned_mode_balances_configured_sizes() {
    let cluster = ClusterBuilder::new()
        .node("pve1", 100.0, 10.0)
        .node("pve2", 100.0, 80.0)
        .guest(100, "g1", "pve1", 30.0, &[])
        .guest(101, "g2", "pve1", 10.0, &[]);

    let config = BalancingConfig {
        mode: Mode::Assigned,
        ..memory_config(5.0)
    };
    let mut snapshot = cluster.snapshot(&config);
    let (assigned, _) = plan(&config, &mut snapshot);
    assert_eq!(assigned.moves.len(), 1);
    assert_eq!(
        (assigned.moves[0].source.as_str(), assigned.moves[0].target.as_str()),
        ("pve1", "pve2")
    );

    let config = memory_config(5.0);
    let mut snapshot = cluster.snapshot(&config);
    let (used, _) = common::plan(&config, &mut snapshot);
    assert!(used.moves.is_empty());
}

#[test]
fn test_cpu_method_balances_cores() {
    let cluster = ClusterBuilder::new()
        .node("pve1", 100.0, 10.0)
        .node("pve2", 100.0, 10.0)
        .guest(100, "g1", "pve1", 1.0, &[])
        .guest(101, "g2", "pve1", 1.0, &[])
        .resize(100, 8.0, 1.0, 0.0)
        .resize(101, 8.0, 1.0, 0.0);

    let config = BalancingConfig {
        method: Method::Cpu,
        ..memory_config(5.0)
    };
    let mut snapshot = cluster.snapshot(&config);
    let (by_cpu, _) = plan(&config, &mut snapshot);
    assert_eq!(by_cpu.moves.len(), 1);
    assert_eq!(by_cpu.moves[0].target, "pve2");
    assert!(by_cpu.projected.spread < 1e-9);

    let config = memory_config(5.0);
    let mut snapshot = cluster.snapshot(&config);
    let (by_memory, _) = common::plan(&config, &mut snapshot);
    assert!(by_memory.balance.balanced);
    assert!(by_memory.moves.is_empty());
}

#[test]
fn test_maintenance_moves_come_first() {
    let config = BalancingConfig {
        maintenance_nodes: ["pve3".to_string()].into_iter().collect(),
        memory_threshold: None,
        ..BalancingConfig::default()
    };
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 100.0, 60.0)
        .node("pve2", 100.0, 10.0)
        .node("pve3", 100.0, 10.0)
        .guest(100, "busy", "pve1", 20.0, &[])
        .guest(101, "leaving", "pve3", 2.0, &[])
        .snapshot(&config);
    let (plan, _) = plan(&config, &mut snapshot);

    assert!(plan.moves.len() >= 2);
    assert_eq!(plan.moves[0].guest, GuestId(101));
    assert_eq!(plan.moves[0].reason, MoveReason::Maintenance);
    assert!(plan.moves[1..].iter().all(|m| m.reason != MoveReason::Maintenance));
}

#[test]
fn test_guests_on_offline_maintenance_node_are_unplaceable() {
    let config = BalancingConfig {
        maintenance_nodes: ["pve1".to_string()].into_iter().collect(),
        ..BalancingConfig::default()
    };
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 100.0, 10.0)
        .node("pve2", 100.0, 10.0)
        .guest(100, "g1", "pve1", 4.0, &[])
        .offline("pve1")
        .snapshot(&config);
    let (plan, _) = plan(&config, &mut snapshot);

    assert!(plan.moves.is_empty());
    assert_eq!(plan.unplaceable.len(), 1);
    assert!(plan.unplaceable[0].reason.contains("offline"));
}

#[test]
fn test_spread_within_balanciness_skips_rebalance() {
    let config = memory_config(5.0);
    let mut snapshot = ClusterBuilder::new()
        .node("pve1", 100.0, 46.0)
        .node("pve2", 100.0, 47.0)
        .guest(100, "g1", "pve1", 4.0, &[])
        .snapshot(&config);
    let (plan, _) = plan(&config, &mut snapshot);

    assert!(plan.balance.balanced);
    assert!(plan.balance.spread <= 5.0);
    assert!(plan.moves.is_empty());
}

#[test]
fn test_memory_threshold_gates_rebalance() {
    let cluster = ClusterBuilder::new()
        .node("pve1", 100.0, 60.0)
        .node("pve2", 100.0, 10.0)
        .guest(100, "g1", "pve1", 10.0, &[]);

    let gated = BalancingConfig::default();
    let mut snapshot = cluster.snapshot(&gated);
    let (plan, _) = plan(&gated, &mut snapshot);
    assert!(plan.balance.balanced, "{}", plan.balance.reason);
    assert!(plan.moves.is_empty());

    let open = memory_config(5.0);
    let mut snapshot = cluster.snapshot(&open);
    let (plan, _) = common::plan(&open, &mut snapshot);
    assert_eq!(plan.moves.len(), 1);
    assert_eq!(plan.moves[0].target, "pve2");
}

#[test]
fn test_best_node_prefers_most_headroom() {
    let config = BalancingConfig::default();
    let snapshot = three_nodes().snapshot(&config);
    let planner = Planner::new(&config);

    let small = Resources::new(1.0, 10.0 * GIB, 0.0);
    assert_eq!(planner.best_node(&snapshot, small).as_deref(), Some("pve2"));

    let huge = Resources::new(1.0, 90.0 * GIB, 0.0);
    assert_eq!(planner.best_node(&snapshot, huge), None);
}

/// Random clusters with a handful of affinity and anti-affinity groups.
fn random_cluster(rng: &mut StdRng) -> ClusterBuilder {
    let node_count = rng.gen_range(3..=6);
    let mut cluster = ClusterBuilder::new();
    let nodes: Vec<String> = (1..=node_count).map(|i| format!("pve{}", i)).collect();
    for name in &nodes {
        cluster = cluster.node(name, 64.0, rng.gen_range(2.0..20.0));
    }
    let tags = ["plb_affinity_a", "plb_affinity_b", "plb_anti_affinity_x", "plb_anti_affinity_y"];
    for id in 0..rng.gen_range(4..=16) {
        let node = &nodes[rng.gen_range(0..nodes.len())];
        let tag: Vec<&str> = if rng.gen_bool(0.5) {
            vec![tags[rng.gen_range(0..tags.len())]]
        } else {
            Vec::new()
        };
        let memory = rng.gen_range(1.0..8.0);
        let disk = rng.gen_range(0.0..200.0);
        cluster = cluster
            .guest(100 + id, &format!("g{}", id), node, memory, &tag)
            .resize(100 + id, 1.0, memory, disk);
    }
    cluster
}

#[test]
fn test_random_plans_keep_placement_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for round in 0..200 {
        let config = memory_config(rng.gen_range(2.0..10.0));
        let mut snapshot = random_cluster(&mut rng).snapshot(&config);
        let (plan, resolution) = plan(&config, &mut snapshot);

        let target = |id: &GuestId| snapshot.guest(*id).unwrap().node_target.clone();

        // affinity groups never end up on more nodes than they started on
        for ids in resolution.affinity_groups.values() {
            let initial: BTreeSet<String> =
                ids.iter().map(|id| snapshot.guest(*id).unwrap().node_current.clone()).collect();
            let projected: BTreeSet<String> = ids.iter().map(target).collect();
            assert!(projected.len() <= initial.len(), "round {}: affinity split", round);
        }

        // a guest never moves next to one of its anti-affinity peers
        for ids in resolution.anti_affinity_groups.values() {
            for m in plan.moves.iter().filter(|m| ids.contains(&m.guest)) {
                let neighbours = ids
                    .iter()
                    .filter(|id| **id != m.guest)
                    .filter(|id| target(id) == m.target)
                    .count();
                assert_eq!(neighbours, 0, "round {}: anti-affinity peer on {}", round, m.target);
            }
        }

        // receiving nodes stay under capacity minus reserve in every dimension
        let mut usage: BTreeMap<String, Resources> = snapshot
            .nodes
            .values()
            .map(|n| (n.name.clone(), n.used))
            .collect();
        for m in &plan.moves {
            let source = usage.get_mut(&m.source).unwrap();
            *source = *source - m.metrics.guest_demand;
            *usage.get_mut(&m.target).unwrap() += m.metrics.guest_demand;
        }
        let receiving: BTreeSet<&str> = plan.moves.iter().map(|m| m.target.as_str()).collect();
        for node in receiving {
            let limit = snapshot.node(node).unwrap().limit();
            for resource in Resource::ALL {
                assert!(
                    usage[node].get(resource) <= limit.get(resource) + 1e-3,
                    "round {}: {} over its {:?} limit",
                    round,
                    node,
                    resource
                );
            }
        }

        // every move is recorded on the snapshot and no guest moves twice
        let moved: BTreeSet<GuestId> = plan.moves.iter().map(|m| m.guest).collect();
        assert_eq!(moved.len(), plan.moves.len(), "round {}: guest moved twice", round);
        for m in &plan.moves {
            assert_ne!(m.source, m.target);
            assert_eq!(target(&m.guest), m.target);
        }
    }
}
