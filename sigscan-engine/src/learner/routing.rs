//! Stable rollout buckets

use crate::types::Identifier;
use sha2::{Digest, Sha256};

/// Bucket in 0..100 derived from the identifier alone
pub fn rollout_bucket(identifier: &Identifier) -> u8 {
    let digest = Sha256::digest(identifier.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

/// True when the identifier falls inside the rollout percentage
pub fn in_rollout(identifier: &Identifier, percent: u8) -> bool {
    rollout_bucket(identifier) < percent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_is_stable() {
        let id = Identifier::new("ACME");
        assert_eq!(rollout_bucket(&id), rollout_bucket(&id.clone()));
        assert!(rollout_bucket(&id) < 100);
    }

    #[test]
    fn test_percent_bounds() {
        let ids: Vec<Identifier> = (0..500).map(|i| Identifier::new(format!("ID{}", i))).collect();
        assert!(ids.iter().all(|id| !in_rollout(id, 0)));
        assert!(ids.iter().all(|id| in_rollout(id, 100)));

        let quarter = ids.iter().filter(|id| in_rollout(id, 25)).count();
        assert!(quarter > 75 && quarter < 175, "got {}", quarter);

        // Buckets nest: anyone in at 10% stays in at 50%
        assert!(ids.iter().filter(|id| in_rollout(id, 10)).all(|id| in_rollout(id, 50)));
    }
}
