use crate::rfe::Rfe;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Previous-hash sentinel for the first record of a chain.
pub const GENESIS: &str = "GENESIS";

pub fn compute_sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let bytes = hasher.finalize();
    hex::encode(bytes)
}

/// Compact JSON in struct declaration order.
pub fn canonical_json(rfe: &Rfe) -> serde_json::Result<String> {
    serde_json::to_string(rfe)
}

/// `SHA-256(canonical_json(rfe) + prev_hash)`, hex encoded.
pub fn chain_hash(rfe: &Rfe, prev_hash: &str) -> serde_json::Result<String> {
    let mut payload = canonical_json(rfe)?;
    payload.push_str(prev_hash);
    Ok(compute_sha256_hex(&payload))
}

/// First position at which a stored chain stops reproducing itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainBreak {
    pub position: usize,
    pub reason: String,
}

/// Walk `(rfe, prev_hash, hash)` links in chain order and check that each
/// link points at its predecessor and that its hash recomputes.
pub fn verify_links<'a, I>(links: I) -> Result<usize, ChainBreak>
where
    I: IntoIterator<Item = (&'a Rfe, &'a str, &'a str)>,
{
    let mut expected_prev = GENESIS.to_string();
    let mut count = 0;
    for (position, (rfe, prev_hash, hash)) in links.into_iter().enumerate() {
        if prev_hash != expected_prev {
            return Err(ChainBreak {
                position,
                reason: format!("prevHash {prev_hash} does not match predecessor {expected_prev}"),
            });
        }
        let recomputed = chain_hash(rfe, prev_hash).map_err(|e| ChainBreak {
            position,
            reason: format!("record not serializable: {e}"),
        })?;
        if recomputed != hash {
            return Err(ChainBreak {
                position,
                reason: format!("stored hash {hash} != recomputed {recomputed}"),
            });
        }
        expected_prev = hash.to_string();
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;
    use crate::rfe::{convert_to_rfe, tests::sample_form};

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            compute_sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hash_depends_on_prev_hash() {
        let rfe = convert_to_rfe(&sample_form("INV-001", 2.0, 50.0, 21.0), RecordKind::Alta, "INV-001");
        let a = chain_hash(&rfe, GENESIS).unwrap();
        let b = chain_hash(&rfe, "deadbeef").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, chain_hash(&rfe, GENESIS).unwrap());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn verify_detects_tampering() {
        let first = convert_to_rfe(&sample_form("INV-001", 2.0, 50.0, 21.0), RecordKind::Alta, "INV-001");
        let second = convert_to_rfe(&sample_form("INV-002", 4.0, 50.0, 21.0), RecordKind::Alta, "INV-002");
        let h1 = chain_hash(&first, GENESIS).unwrap();
        let h2 = chain_hash(&second, &h1).unwrap();

        let ok = vec![(&first, GENESIS, h1.as_str()), (&second, h1.as_str(), h2.as_str())];
        assert_eq!(verify_links(ok), Ok(2));

        let mut edited = second.clone();
        edited.totals.total = 1.0;
        let bad = vec![(&first, GENESIS, h1.as_str()), (&edited, h1.as_str(), h2.as_str())];
        assert_eq!(verify_links(bad).unwrap_err().position, 1);

        let forked = vec![(&first, GENESIS, h1.as_str()), (&second, GENESIS, h2.as_str())];
        assert_eq!(verify_links(forked).unwrap_err().position, 1);
    }
}
