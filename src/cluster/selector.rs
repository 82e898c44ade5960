use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

/// Picks one worker instance of a role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerSelector {
    /// Always the first instance. For worker types that must not be sharded.
    ForeverFirst,
    /// Hash of the routing key modulo the instance count.
    #[default]
    HashCode,
}

impl WorkerSelector {
    /// Index of the instance owning `key` among `count` instances.
    ///
    /// Deterministic for a fixed `count` and key, in every process. Without a
    /// key the first instance is used. `None` when there are no instances.
    pub fn select_index(self, count: usize, key: Option<&str>) -> Option<usize> {
        if count == 0 {
            return None;
        }
        match (self, key) {
            (WorkerSelector::ForeverFirst, _) | (WorkerSelector::HashCode, None) => Some(0),
            (WorkerSelector::HashCode, Some(key)) => {
                #[allow(clippy::cast_possible_truncation)]
                let index = (stable_hash(key) % count as u64) as usize;
                Some(index)
            },
        }
    }
}

/// Seedless hash, identical across processes and restarts.
fn stable_hash(key: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forever_first() {
        let selector = WorkerSelector::ForeverFirst;
        assert_eq!(selector.select_index(5, Some("a")), Some(0));
        assert_eq!(selector.select_index(5, None), Some(0));
        assert_eq!(selector.select_index(0, Some("a")), None);
    }

    #[test]
    fn test_hash_code_is_deterministic() {
        let selector = WorkerSelector::HashCode;
        for key in ["202401010930_svc-a", "202401010930_svc-b", "2024010109_svc-a"] {
            let first = selector.select_index(7, Some(key)).unwrap();
            assert!(first < 7);
            for _ in 0..10 {
                assert_eq!(selector.select_index(7, Some(key)), Some(first));
            }
        }
        assert_eq!(selector.select_index(7, None), Some(0));
    }

    #[test]
    fn test_hash_code_spreads_keys() {
        let selector = WorkerSelector::HashCode;
        let mut hits = [0usize; 4];
        for i in 0..400 {
            let key = format!("202401010930_service-{}", i);
            hits[selector.select_index(4, Some(&key)).unwrap()] += 1;
        }
        assert!(hits.iter().all(|&h| h > 0));
    }
}
