//! Supported broker versions and their default images

/// Broker versions this operator knows how to deploy, oldest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2.27.0", "2.27.1", "2.28.0", "2.29.0", "2.30.0"];

/// Repository of the default broker image
pub const BROKER_IMAGE_REPOSITORY: &str = "quay.io/broker-operator/broker-kubernetes";

/// Repository of the default init image
pub const INIT_IMAGE_REPOSITORY: &str = "quay.io/broker-operator/broker-kubernetes-init";

/// Image value that means "not pinned"
pub const PLACEHOLDER_IMAGE: &str = "placeholder";

/// Latest supported version
pub fn latest() -> &'static str {
    SUPPORTED_VERSIONS[SUPPORTED_VERSIONS.len() - 1]
}

/// Resolve a declared version to a supported one
///
/// An exact match wins. Otherwise `major` or `major.minor` resolve to the
/// newest supported version sharing that prefix, so `2.27` yields `2.27.1`.
pub fn resolve(declared: &str) -> Option<&'static str> {
    let declared = declared.trim();
    if declared.is_empty() {
        return None;
    }
    if let Some(exact) = SUPPORTED_VERSIONS.iter().find(|v| **v == declared) {
        return Some(exact);
    }
    let prefix = format!("{}.", declared);
    SUPPORTED_VERSIONS
        .iter()
        .rev()
        .find(|v| v.starts_with(&prefix))
        .copied()
}

/// Whether a declared image counts as pinned
pub fn is_pinned(image: Option<&str>) -> bool {
    image.is_some_and(|i| !i.is_empty() && i != PLACEHOLDER_IMAGE)
}

/// Default broker image for a supported version
pub fn default_image(version: &str) -> String {
    format!("{}:{}", BROKER_IMAGE_REPOSITORY, version)
}

/// Default init image for a supported version
pub fn default_init_image(version: &str) -> String {
    format!("{}:{}", INIT_IMAGE_REPOSITORY, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_exact() {
        assert_eq!(resolve("2.28.0"), Some("2.28.0"));
    }

    #[test]
    fn test_resolve_prefix() {
        assert_eq!(resolve("2.27"), Some("2.27.1"));
        assert_eq!(resolve("2"), Some(latest()));
    }

    #[test]
    fn test_resolve_unknown() {
        assert_eq!(resolve("1.0.0"), None);
        assert_eq!(resolve("2.2"), None);
        assert_eq!(resolve(""), None);
        assert_eq!(resolve("not-a-version"), None);
    }

    #[test]
    fn test_is_pinned() {
        assert!(!is_pinned(None));
        assert!(!is_pinned(Some("")));
        assert!(!is_pinned(Some(PLACEHOLDER_IMAGE)));
        assert!(is_pinned(Some("registry/broker:1")));
    }

    #[test]
    fn test_default_images() {
        assert!(default_image("2.30.0").ends_with(":2.30.0"));
        assert!(default_init_image("2.30.0").contains("-init:"));
    }
}
