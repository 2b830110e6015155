use {
    crate::error::{CaecodError, Result},
    boomphf::Mphf,
    hashbrown::HashSet,
    serde::{Deserialize, Serialize},
    std::hash::{Hash, Hasher},
};

/// space/time knob for the BBHash construction
const GAMMA: f64 = 1.7;

/// owned key wrapper; boomphf hashes the stored type, so a lookup rebuilds
/// one around the queried bytes
#[derive(Clone, Debug, Serialize, Deserialize)]
struct NameKey(Vec<u8>);

impl Hash for NameKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0[..].hash(state);
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Repr {
    /// zero-record dataset; there is nothing to hash
    Empty,
    Built(Mphf<NameKey>),
}

/// minimum perfect hash over the canonical name set
///
/// `lookup` maps every build-set key onto a distinct slot in `[0, n)`. for a
/// key outside the set it may return any value at all, so the caller has to
/// confirm a hit against the canonical name stored for that slot.
#[derive(Debug)]
pub struct PathIndex {
    repr: Repr,
}

impl PathIndex {
    /// build over the full key set, rejecting duplicates up front
    pub fn build(keys: Vec<Vec<u8>>) -> Result<Self> {
        if keys.is_empty() {
            return Ok(Self { repr: Repr::Empty });
        }

        {
            let mut seen: HashSet<&[u8]> = HashSet::with_capacity(keys.len());
            for key in &keys {
                if !seen.insert(key.as_slice()) {
                    return Err(CaecodError::DuplicateKey(
                        String::from_utf8_lossy(key).into_owned(),
                    ));
                }
            }
        }

        let keys: Vec<NameKey> = keys.into_iter().map(NameKey).collect();
        let mphf = Mphf::new(GAMMA, &keys);
        Ok(Self {
            repr: Repr::Built(mphf),
        })
    }

    /// unverified slot for `key`; garbage for keys outside the build set
    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        match &self.repr {
            Repr::Empty => None,
            Repr::Built(mphf) => mphf.try_hash(&NameKey(key.to_vec())),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.repr).map_err(|_| CaecodError::MphfBuild)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let repr = bincode::deserialize(bytes).map_err(|e| CaecodError::MphfLoad(e.to_string()))?;
        Ok(Self { repr })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert2::check as assert};

    fn sample_keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("/tile/{i}.mvt").into_bytes()).collect()
    }

    #[test]
    fn test_build_is_minimal_and_perfect() {
        let keys = sample_keys(500);
        let index = PathIndex::build(keys.clone()).unwrap();

        let mut slots = vec![false; keys.len()];
        for key in &keys {
            let slot = index.lookup(key).unwrap() as usize;
            assert!(slot < keys.len());
            assert!(!slots[slot]);
            slots[slot] = true;
        }
        assert!(slots.iter().all(|&hit| hit));
    }

    #[test]
    fn test_serialize_round_trip() {
        let keys = sample_keys(100);
        let index = PathIndex::build(keys.clone()).unwrap();
        let bytes = index.to_bytes().unwrap();

        let back = PathIndex::from_bytes(&bytes).unwrap();
        for key in &keys {
            assert!(back.lookup(key) == index.lookup(key));
        }
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let mut keys = sample_keys(10);
        keys.push(keys[3].clone());

        let result = PathIndex::build(keys);
        assert!(matches!(result.unwrap_err(), CaecodError::DuplicateKey(_)));
    }

    #[test]
    fn test_empty_set() {
        let index = PathIndex::build(Vec::new()).unwrap();
        assert!(index.lookup(b"/anything").is_none());

        let back = PathIndex::from_bytes(&index.to_bytes().unwrap()).unwrap();
        assert!(back.lookup(b"").is_none());
    }

    #[test]
    fn test_garbage_load_fails() {
        assert!(matches!(
            PathIndex::from_bytes(&[0xFF; 16]).unwrap_err(),
            CaecodError::MphfLoad(_)
        ));
    }
}
