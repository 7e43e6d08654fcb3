//! Root name to filesystem key mapping.

/// Filesystem key for a root name under the database's `index/` directory.
///
/// Any stable digest with negligible collision probability works here; the
/// hex form keeps arbitrary names out of the filesystem namespace.
pub(crate) fn root_key(name: &str) -> String {
    hex::encode(blake3::hash(name.as_bytes()).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable() {
        assert_eq!(root_key("index"), root_key("index"));
    }

    #[test]
    fn distinct_names_get_distinct_keys() {
        assert_ne!(root_key("a"), root_key("b"));
    }

    #[test]
    fn key_is_filesystem_safe_hex() {
        let key = root_key("some / weird \\ name");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
