//! Registration-ordered handler lookup.
#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use crate::error::ImportError;
use crate::handler::{GeoPackageHandler, Handler};
use crate::payload::{GenericPayloadValidator, ImportPayload, PayloadValidator};

/// Ordered collection of handlers.
///
/// Lookups never score handlers: the first registered handler that accepts
/// a payload wins.
///
/// # Examples
///
/// ```
/// use geoport_importer::{GPKG_IDENTITY, HandlerRegistry, ImportPayload};
///
/// let registry = HandlerRegistry::default();
/// let handler = registry
///     .resolve(&ImportPayload::with_base_file("/tmp/roads.GPKG"))
///     .expect("geopackage handler");
/// assert_eq!(handler.identity(), GPKG_IDENTITY);
/// assert!(registry.resolve(&ImportPayload::with_base_file("/tmp/roads.shp")).is_none());
/// ```
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
    generic: GenericPayloadValidator,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::empty().with(Arc::new(GeoPackageHandler))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|handler| handler.identity()))
            .finish()
    }
}

impl HandlerRegistry {
    /// Registry without handlers.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            handlers: Vec::new(),
            generic: GenericPayloadValidator,
        }
    }

    /// Append `handler` after the already registered ones.
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// First handler accepting `payload`.
    #[must_use]
    pub fn resolve(&self, payload: &ImportPayload) -> Option<Arc<dyn Handler>> {
        self.handlers
            .iter()
            .find(|handler| handler.accepts(payload))
            .map(Arc::clone)
    }

    /// Handler registered as `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::UnknownHandler`] when nothing matches.
    pub fn load(&self, identity: &str) -> Result<Arc<dyn Handler>, ImportError> {
        self.handlers
            .iter()
            .find(|handler| handler.identity() == identity)
            .map(Arc::clone)
            .ok_or_else(|| ImportError::UnknownHandler {
                identity: identity.to_owned(),
            })
    }

    /// Validator for `payload`: the resolved handler's own, or the generic
    /// one.
    #[must_use]
    pub fn get_serializer(&self, payload: &ImportPayload) -> &dyn PayloadValidator {
        self.handlers
            .iter()
            .find(|handler| handler.accepts(payload))
            .and_then(|handler| handler.validator())
            .unwrap_or(&self.generic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use geoport_core::Action;
    use rstest::rstest;
    use serde_json::{Map, Value};

    use crate::error::TaskError;
    use crate::handler::{HandlerParams, StageContext, StageOutcome};

    struct AnyFile(&'static str);

    #[async_trait]
    impl Handler for AnyFile {
        fn identity(&self) -> &str {
            self.0
        }

        fn accepts(&self, _payload: &ImportPayload) -> bool {
            true
        }

        fn is_valid(&self, _files: &BTreeMap<String, Utf8PathBuf>) -> bool {
            true
        }

        fn task_list(&self, _action: Action) -> &'static [&'static str] {
            &[]
        }

        fn extract_params_from_data(
            &self,
            params: Map<String, Value>,
            _action: Action,
        ) -> Result<(HandlerParams, Map<String, Value>), ImportError> {
            Ok((HandlerParams::default(), params))
        }

        async fn run_stage(
            &self,
            _stage: &str,
            _ctx: StageContext,
        ) -> Result<StageOutcome, TaskError> {
            Ok(StageOutcome::Advance)
        }
    }

    #[rstest]
    fn first_registered_match_wins() {
        let registry = HandlerRegistry::empty()
            .with(Arc::new(AnyFile("first")))
            .with(Arc::new(AnyFile("second")));

        let handler = registry
            .resolve(&ImportPayload::with_base_file("a.csv"))
            .expect("a handler");

        assert_eq!(handler.identity(), "first");
    }

    #[rstest]
    fn unknown_identity_is_reported() {
        let err = HandlerRegistry::default()
            .load("geoport.handlers.shapefile")
            .err()
            .expect("unknown handler");
        assert!(matches!(err, ImportError::UnknownHandler { identity } if identity.ends_with("shapefile")));
    }

    #[rstest]
    fn generic_validator_used_without_handler() {
        let registry = HandlerRegistry::default();
        let err = registry
            .get_serializer(&ImportPayload::default())
            .validate(&ImportPayload::default())
            .expect_err("generic validator requires base file");
        assert!(matches!(err, ImportError::Validation { .. }));
    }
}
