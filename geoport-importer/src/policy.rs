//! Layer eligibility.
#![forbid(unsafe_code)]

use geoport_core::{SchemaStore, SchemaStoreError};

/// Whether `layer` should be imported for `user`.
///
/// Only returns `false` when `skip_existing` is set and `user` already owns
/// a schema called `layer`. The catalog is not consulted otherwise.
///
/// # Errors
///
/// Returns any [`SchemaStoreError`] raised while checking ownership.
pub fn should_be_imported(
    store: &dyn SchemaStore,
    layer: &str,
    user: &str,
    skip_existing: bool,
) -> Result<bool, SchemaStoreError> {
    if !skip_existing {
        return Ok(true);
    }
    Ok(!store.exists_for_owner(layer, user)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoport_core::SqliteSchemaStore;
    use rstest::rstest;

    #[rstest]
    #[case("alice", true, false)]
    #[case("alice", false, true)]
    #[case("bob", true, true)]
    fn skip_only_excludes_layers_owned_by_user(
        #[case] user: &str,
        #[case] skip: bool,
        #[case] expected: bool,
    ) {
        let store = SqliteSchemaStore::open_in_memory().expect("open store");
        store.get_or_create("roads", "alice").expect("seed schema");

        let eligible = should_be_imported(&store, "roads", user, skip).expect("check");

        assert_eq!(eligible, expected);
    }
}
