//! Image reference canonicalization.
//!
//! Mirrors the Docker CLI's normalization so that `redis`, `redis:latest`
//! and `docker.io/library/redis:latest` all pull (and cache) the same image.

const DEFAULT_DOMAIN: &str = "docker.io";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const DEFAULT_TAG: &str = "latest";

/// Canonical form of an image reference, or `None` if it doesn't parse.
///
/// - no registry domain → `docker.io/`
/// - single-component Docker Hub name → `library/` prefix
/// - neither tag nor digest → `:latest`
///
/// ```
/// use service_fixtures::service::canonicalize_image_ref;
///
/// assert_eq!(
///     canonicalize_image_ref("redis").as_deref(),
///     Some("docker.io/library/redis:latest")
/// );
/// assert_eq!(
///     canonicalize_image_ref("ghcr.io/acme/api:1.2").as_deref(),
///     Some("ghcr.io/acme/api:1.2")
/// );
/// assert_eq!(canonicalize_image_ref("Not Valid"), None);
/// ```
pub fn canonicalize_image_ref(reference: &str) -> Option<String> {
    if reference.is_empty() || reference.chars().any(char::is_whitespace) {
        return None;
    }

    let (name_and_tag, digest) = match reference.split_once('@') {
        Some((name, digest)) => {
            if !is_valid_digest(digest) {
                return None;
            }
            (name, Some(digest))
        }
        None => (reference, None),
    };

    // The tag separator is the last ':' after the last '/', so registry ports survive.
    let last_slash = name_and_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
        Some(i) => {
            let split = last_slash + i;
            (&name_and_tag[..split], Some(&name_and_tag[split + 1..]))
        }
        None => (name_and_tag, None),
    };

    if let Some(tag) = tag {
        if !is_valid_tag(tag) {
            return None;
        }
    }

    let (domain, path) = split_domain(name);
    if !is_valid_path(&path) {
        return None;
    }

    let mut canonical = format!("{}/{}", domain, path);
    match (tag, digest) {
        (Some(tag), _) => {
            canonical.push(':');
            canonical.push_str(tag);
        }
        (None, None) => {
            canonical.push(':');
            canonical.push_str(DEFAULT_TAG);
        }
        (None, Some(_)) => {}
    }
    if let Some(digest) = digest {
        canonical.push('@');
        canonical.push_str(digest);
    }
    Some(canonical)
}

/// Canonicalize, passing unparsable references through unchanged.
pub(crate) fn resolve_image_ref(reference: &str) -> String {
    match canonicalize_image_ref(reference) {
        Some(canonical) => canonical,
        None => {
            tracing::debug!(
                "Image reference '{}' is not in canonical form, using as-is",
                reference
            );
            reference.to_string()
        }
    }
}

fn split_domain(name: &str) -> (String, String) {
    let (domain, path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };

    let domain = if domain == LEGACY_DEFAULT_DOMAIN {
        DEFAULT_DOMAIN.to_string()
    } else {
        domain
    };

    let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
        format!("{}{}", OFFICIAL_REPO_PREFIX, path)
    } else {
        path
    };

    (domain, path)
}

/// Path components: lowercase alphanumerics joined by single `.`, `_`, `__` or `-` runs.
fn is_valid_path(path: &str) -> bool {
    !path.is_empty() && path.split('/').all(is_valid_component)
}

fn is_valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last))
            if first.is_ascii_lowercase() || first.is_ascii_digit() =>
        {
            if !(last.is_ascii_lowercase() || last.is_ascii_digit()) {
                return false;
            }
        }
        _ => return false,
    }
    bytes.iter().all(|b| {
        b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
    })
}

fn is_valid_tag(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 128
        && (bytes[0].is_ascii_alphanumeric() || bytes[0] == b'_')
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

fn is_valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && algorithm
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'+' || b == b'.')
                && hex.len() >= 32
                && hex.bytes().all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}
