//! XOR-distance storage node selection
//!
//! Messages are placed on, and fetched from, the storage nodes whose public
//! keys are closest to the target pseudonym in XOR space. Keys are folded
//! down to 64 bits before comparison: a cheap stand-in for full DHT routing
//! that still spreads pseudonyms evenly across nodes.

use std::collections::HashMap;

use crate::protocol::PeerId;
use crate::transport::TransportAddress;

/// Fold a 32-byte key into a big-endian u64 by XOR-ing its 8-byte chunks
pub fn xor_fold(key: &[u8; 32]) -> u64 {
    let mut folded = [0u8; 8];
    for (i, byte) in key.iter().enumerate() {
        folded[i % 8] ^= byte;
    }
    u64::from_be_bytes(folded)
}

/// XOR distance between two folded keys
pub fn distance(a: u64, b: u64) -> u64 {
    a ^ b
}

/// The `k` storage nodes closest to `target`, sorted ascending by folded
/// XOR distance. Ties break on the node key so selection is deterministic.
pub fn closest_nodes(
    nodes: &HashMap<PeerId, TransportAddress>,
    target: &[u8; 32],
    k: usize,
) -> Vec<(PeerId, TransportAddress)> {
    let target_folded = xor_fold(target);
    let mut candidates: Vec<(PeerId, TransportAddress)> = nodes
        .iter()
        .map(|(pk, addr)| (*pk, addr.clone()))
        .collect();
    candidates.sort_by_key(|(pk, _)| (distance(xor_fold(pk), target_folded), *pk));
    candidates.truncate(k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_key(seed: u8) -> PeerId {
        let mut key = [0u8; 32];
        key[7] = seed;
        key
    }

    fn addr(name: &str) -> TransportAddress {
        TransportAddress::Local(name.into())
    }

    #[test]
    fn test_xor_fold_varies_with_every_chunk() {
        let mut key = [0u8; 32];
        let base = xor_fold(&key);
        for i in 0..32 {
            key[i] = 1;
            assert_ne!(xor_fold(&key), base, "byte {} ignored by fold", i);
            key[i] = 0;
        }
    }

    #[test]
    fn test_closest_nodes_sorted_by_distance() {
        let mut nodes = HashMap::new();
        // Keys fold to 1, 2, ..., 8 in the last byte
        for seed in 1..=8u8 {
            nodes.insert(node_key(seed), addr(&format!("node-{}", seed)));
        }
        // Target folds to 3: closest keys are 3 (d=0), 2 (d=1), 1 (d=2)
        let target = node_key(3);
        let selected = closest_nodes(&nodes, &target, 3);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected[0].0, node_key(3));
        assert_eq!(selected[1].0, node_key(2));
        assert_eq!(selected[2].0, node_key(1));
    }

    #[test]
    fn test_closest_nodes_truncates_to_available() {
        let mut nodes = HashMap::new();
        nodes.insert(node_key(1), addr("only"));
        let selected = closest_nodes(&nodes, &node_key(9), 5);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_empty_node_set_yields_empty() {
        let nodes = HashMap::new();
        assert!(closest_nodes(&nodes, &[0u8; 32], 3).is_empty());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let mut nodes = HashMap::new();
        for seed in 0..20u8 {
            nodes.insert(node_key(seed), addr(&format!("n{}", seed)));
        }
        let target = [0x5Au8; 32];
        assert_eq!(
            closest_nodes(&nodes, &target, 5),
            closest_nodes(&nodes, &target, 5)
        );
    }
}
