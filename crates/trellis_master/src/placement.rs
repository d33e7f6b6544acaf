//! Replica placement and replacement policy.
//!
//! Selection uses power-of-two-choices over the live fleet: sample two
//! distinct candidates, keep the one with the lower creation load. The
//! replacement policy decides, from the leader-reported health of a
//! committed config, whether a replica should be evicted or a new one
//! added.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;

use crate::fleet::TsDescriptor;
use crate::metadata::{MemberKind, PeerHealth, RaftConfig, TsId};

/// Whether replacement decisions may proceed without a healthy majority of
/// voters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorityHealthPolicy {
    Honor,
    Ignore,
}

/// Pick one replica target among `candidates`, excluding `already_selected`.
///
/// Power-of-two-choices: sample two distinct eligible servers uniformly,
/// prefer the lower [`TsDescriptor::replica_load`], break ties randomly.
pub fn select_replica<R: Rng>(
    candidates: &[Arc<TsDescriptor>],
    already_selected: &HashSet<TsId>,
    rng: &mut R,
) -> Option<Arc<TsDescriptor>> {
    let eligible: Vec<&Arc<TsDescriptor>> = candidates
        .iter()
        .filter(|d| !already_selected.contains(d.uuid()))
        .collect();
    match eligible.len() {
        0 => None,
        1 => Some(eligible[0].clone()),
        len => {
            let first = rng.gen_range(0..len);
            let mut second = rng.gen_range(0..len - 1);
            if second >= first {
                second += 1;
            }
            let (a, b) = (eligible[first], eligible[second]);
            let (load_a, load_b) = (a.replica_load(), b.replica_load());
            let pick = if load_a < load_b {
                a
            } else if load_b < load_a {
                b
            } else if rng.gen_bool(0.5) {
                a
            } else {
                b
            };
            Some(pick.clone())
        }
    }
}

/// Select `num_replicas` distinct servers for one tablet, bumping each
/// chosen server's recent-creations counter.
///
/// Callers check `candidates.len() >= num_replicas` first; this never places
/// two replicas of the same tablet on one server.
pub fn select_replicas<R: Rng>(
    candidates: &[Arc<TsDescriptor>],
    num_replicas: usize,
    rng: &mut R,
) -> Vec<Arc<TsDescriptor>> {
    let mut selected = Vec::with_capacity(num_replicas);
    let mut selected_ids = HashSet::new();
    for _ in 0..num_replicas {
        let Some(pick) = select_replica(candidates, &selected_ids, rng) else {
            break;
        };
        pick.increment_recent_replica_creations();
        selected_ids.insert(pick.uuid().to_string());
        selected.push(pick);
    }
    selected
}

fn peer_failed(health: Option<PeerHealth>) -> bool {
    matches!(health, Some(PeerHealth::Failed))
}

fn healthy_voters(config: &RaftConfig) -> usize {
    config
        .peers
        .iter()
        .filter(|p| p.member_type == MemberKind::Voter && !peer_failed(p.health))
        .count()
}

fn majority_size(num_voters: usize) -> usize {
    num_voters / 2 + 1
}

/// Whether the config needs another replica to reach `replication_factor`.
///
/// Failed voters and voters marked for replacement do not count toward the
/// target; non-voters already slated for promotion do. Under
/// [`MajorityHealthPolicy::Honor`], adding is pointless unless a majority of
/// voters is healthy enough to commit the change.
pub fn should_add_replica(
    config: &RaftConfig,
    replication_factor: u32,
    policy: MajorityHealthPolicy,
) -> bool {
    let viable_voters = config
        .peers
        .iter()
        .filter(|p| {
            p.member_type == MemberKind::Voter && !peer_failed(p.health) && !p.replace
        })
        .count();
    let promoting = config
        .peers
        .iter()
        .filter(|p| {
            p.member_type == MemberKind::NonVoter && p.promote && !peer_failed(p.health)
        })
        .count();
    if viable_voters + promoting >= replication_factor as usize {
        return false;
    }
    if policy == MajorityHealthPolicy::Honor {
        let voters = config.count_voters();
        if healthy_voters(config) < majority_size(voters) {
            return false;
        }
    }
    true
}

/// Pick a replica to evict from the config, if any should go.
///
/// Precedence: a failed or surplus non-voter, then a failed voter once
/// enough healthy voters remain, then a surplus healthy voter (never the
/// leader). Under [`MajorityHealthPolicy::Honor`], evicting a voter must
/// leave a healthy majority behind.
pub fn should_evict_replica(
    config: &RaftConfig,
    leader_uuid: &str,
    replication_factor: u32,
    policy: MajorityHealthPolicy,
) -> Option<TsId> {
    let rf = replication_factor as usize;
    let voters = config.count_voters();
    let healthy = healthy_voters(config);

    // Non-voters first: eviction does not affect the voter quorum.
    if let Some(peer) = config.peers.iter().find(|p| {
        p.member_type == MemberKind::NonVoter && (peer_failed(p.health) || !p.promote)
    }) {
        return Some(peer.uuid.clone());
    }

    let may_touch_voters = match policy {
        MajorityHealthPolicy::Ignore => true,
        MajorityHealthPolicy::Honor => healthy >= majority_size(voters),
    };
    if !may_touch_voters {
        return None;
    }

    // A failed voter goes once a full complement of healthy voters exists.
    if healthy >= rf {
        if let Some(peer) = config.peers.iter().find(|p| {
            p.member_type == MemberKind::Voter && peer_failed(p.health) && p.uuid != leader_uuid
        }) {
            return Some(peer.uuid.clone());
        }
    }

    // Surplus healthy voters: prefer one marked for replacement.
    if healthy > rf {
        let surplus = config
            .peers
            .iter()
            .filter(|p| {
                p.member_type == MemberKind::Voter
                    && !peer_failed(p.health)
                    && p.uuid != leader_uuid
            })
            .max_by_key(|p| (p.replace, p.uuid.clone()));
        if let Some(peer) = surplus {
            return Some(peer.uuid.clone());
        }
    }

    None
}
