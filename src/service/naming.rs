use serde::{Deserialize, Serialize};

/// How sandboxes for a service are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityPolicy {
    /// Every sandbox is named after the service. Only one instance can exist at a time.
    #[default]
    Fixed,
    /// Every sandbox gets a fresh `<name>-<8 hex>` identifier, so isolated
    /// instances of the same image can coexist in one test run.
    Unique,
}

impl IdentityPolicy {
    /// Sandbox identifier for a new sandbox of `service_name`.
    pub fn sandbox_id(&self, service_name: &str) -> String {
        let base = sanitize_name_component(service_name);
        match self {
            IdentityPolicy::Fixed => base,
            IdentityPolicy::Unique => format!("{}-{:08x}", base, rand::random::<u32>()),
        }
    }
}

/// Sanitize a string for use in sandbox names.
///
/// Runtime object names must match `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
/// This function:
/// - Replaces invalid characters with underscores
/// - Truncates to 48 characters (leaves room for a unique suffix)
/// - Ensures the result starts with an alphanumeric character
pub(crate) fn sanitize_name_component(input: &str) -> String {
    const MAX_COMPONENT_LEN: usize = 48;

    if input.is_empty() {
        return "unnamed".to_string();
    }

    // After this map every char is ASCII, so byte-indexing below is safe.
    let sanitized: String = input
        .chars()
        .take(MAX_COMPONENT_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.starts_with(|c: char| !c.is_ascii_alphanumeric()) {
        format!("x{}", &sanitized[1..])
    } else {
        sanitized
    }
}

/// FNV-1a 64-bit hash, deterministic across Rust versions and platforms.
pub(crate) fn fnv1a_64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
