#![forbid(unsafe_code)]

use crate::{HostPatternSet, PolicyError};
use std::collections::HashMap;

pub const PLACEHOLDER_PREFIX: &str = "GONDOLIN_SECRET_";

/// Bytes of entropy behind each placeholder token.
const PLACEHOLDER_RANDOM_BYTES: usize = 24;

/// Caller-supplied description of one secret: its environment name, the
/// real value, and the host globs the value may be sent to.
#[derive(Debug, Clone)]
pub struct SecretSpec {
    pub name: String,
    pub value: String,
    pub hosts: Vec<String>,
}

impl SecretSpec {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        hosts: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }
}

/// A minted secret. The guest only ever sees `placeholder`; `value` exists
/// host-side and is substituted at egress, gated by `host_patterns`.
#[derive(Debug, Clone)]
pub struct SecretEntry {
    pub name: String,
    pub placeholder: String,
    pub value: String,
    pub host_patterns: HostPatternSet,
}

impl SecretEntry {
    pub fn allows_host(&self, host: &str) -> bool {
        // An empty pattern list means the secret may go anywhere the
        // overall policy allows.
        self.host_patterns.allows(host)
    }
}

#[derive(Debug, Default)]
pub struct SecretStore {
    entries: Vec<SecretEntry>,
}

impl SecretStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn mint(specs: Vec<SecretSpec>, rng: &mut dyn rand::RngCore) -> Result<Self, PolicyError> {
        let mut seen = HashMap::new();
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.value.is_empty() {
                return Err(PolicyError::EmptySecretValue(spec.name));
            }
            if seen.insert(spec.name.clone(), ()).is_some() {
                return Err(PolicyError::DuplicateSecret(spec.name));
            }
            let host_patterns = HostPatternSet::compile(&spec.hosts)?;
            entries.push(SecretEntry {
                name: spec.name,
                placeholder: mint_placeholder(rng),
                value: spec.value,
                host_patterns,
            });
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[SecretEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The environment exported to the guest: `$NAME` resolves to the
    /// placeholder, never the value.
    pub fn guest_env(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.placeholder.clone()))
            .collect()
    }
}

fn mint_placeholder(rng: &mut dyn rand::RngCore) -> String {
    let mut bytes = [0u8; PLACEHOLDER_RANDOM_BYTES];
    rng.fill_bytes(&mut bytes);
    let mut out = String::with_capacity(PLACEHOLDER_PREFIX.len() + bytes.len() * 2);
    out.push_str(PLACEHOLDER_PREFIX);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn placeholders_are_prefixed_hex_and_distinct() {
        let mut rng = rand::rngs::OsRng;
        let store = SecretStore::mint(
            vec![
                SecretSpec::new("TOKEN", "s3cr3t", ["api.example.com"]),
                SecretSpec::new("OTHER", "v", Vec::<String>::new()),
            ],
            &mut rng,
        )
        .unwrap();

        let [a, b] = store.entries() else {
            panic!("expected two entries")
        };
        assert!(a.placeholder.starts_with(PLACEHOLDER_PREFIX));
        assert_eq!(
            a.placeholder.len(),
            PLACEHOLDER_PREFIX.len() + PLACEHOLDER_RANDOM_BYTES * 2
        );
        assert!(a.placeholder[PLACEHOLDER_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.placeholder, b.placeholder);
    }

    #[test]
    fn minting_is_deterministic_with_injected_rng() {
        let mint = || {
            let mut rng = StepRng::new(7, 11);
            SecretStore::mint(
                vec![SecretSpec::new("TOKEN", "v", ["api.example.com"])],
                &mut rng,
            )
            .unwrap()
        };
        assert_eq!(
            mint().entries()[0].placeholder,
            mint().entries()[0].placeholder
        );
    }

    #[test]
    fn guest_env_maps_names_to_placeholders_only() {
        let mut rng = rand::rngs::OsRng;
        let store =
            SecretStore::mint(vec![SecretSpec::new("TOKEN", "s3cr3t", ["a.test"])], &mut rng)
                .unwrap();
        let env = store.guest_env();
        let placeholder = env.get("TOKEN").unwrap();
        assert!(placeholder.starts_with(PLACEHOLDER_PREFIX));
        assert!(!placeholder.contains("s3cr3t"));
    }

    #[test]
    fn host_gate_matches_patterns() {
        let mut rng = rand::rngs::OsRng;
        let store = SecretStore::mint(
            vec![SecretSpec::new("TOKEN", "v", ["api.example.com", "*.internal.example.com"])],
            &mut rng,
        )
        .unwrap();
        let entry = &store.entries()[0];
        assert!(entry.allows_host("api.example.com"));
        assert!(entry.allows_host("build.internal.example.com"));
        assert!(!entry.allows_host("evil.test"));
    }

    #[test]
    fn duplicate_names_and_empty_values_are_rejected() {
        let mut rng = rand::rngs::OsRng;
        assert!(SecretStore::mint(
            vec![
                SecretSpec::new("A", "x", Vec::<String>::new()),
                SecretSpec::new("A", "y", Vec::<String>::new()),
            ],
            &mut rng,
        )
        .is_err());
        assert!(
            SecretStore::mint(vec![SecretSpec::new("A", "", Vec::<String>::new())], &mut rng)
                .is_err()
        );
    }
}
