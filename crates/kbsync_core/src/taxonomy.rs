use anyhow::Result;
use tracing::info;

use crate::diagnostics::DiagnosticsLog;
use crate::settings::SyncMode;
use crate::store::{TermId, TermStore};

pub const CONTENT_TYPE_VOCABULARY: &str = "content_type_kb";
pub const BRAND_DIVISION_VOCABULARY: &str = "brand_division_kb";
pub const PRODUCTS_VOCABULARY: &str = "products_kb";
pub const SERVER_TYPES_VOCABULARY: &str = "server_types_kb";
pub const PRODUCT_TYPES_VOCABULARY: &str = "product_types_kb";

/// Maps free-text category values onto taxonomy terms. Missing terms are
/// created only in development mode; production resolves to nothing so the
/// publish-state rules can react.
pub struct TaxonomyResolver {
    mode: SyncMode,
}

impl TaxonomyResolver {
    pub fn new(mode: SyncMode) -> Self {
        Self { mode }
    }

    /// Exact-match lookup within one vocabulary. Empty values resolve to
    /// no term without any diagnostic.
    pub fn resolve(
        &self,
        terms: &mut dyn TermStore,
        value: &str,
        vocabulary: &str,
    ) -> Result<Option<TermId>> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(None);
        }
        if let Some(id) = terms.find_term(vocabulary, value)? {
            return Ok(Some(id));
        }
        if self.mode.creates_missing_terms() {
            let id = terms.create_term(vocabulary, value)?;
            info!(vocabulary, term = value, id, "created taxonomy term");
            return Ok(Some(id));
        }
        Ok(None)
    }

    /// Resolve a list of values, skipping misses. Records one aggregated
    /// diagnostic naming every value that stayed unresolved.
    pub fn resolve_many(
        &self,
        terms: &mut dyn TermStore,
        values: &[String],
        vocabulary: &str,
        external_id: &str,
        step: &str,
        diagnostics: &mut DiagnosticsLog,
    ) -> Vec<TermId> {
        let mut ids = Vec::new();
        let mut missed = Vec::new();
        for value in values {
            match self.resolve(terms, value, vocabulary) {
                Ok(Some(id)) => ids.push(id),
                Ok(None) => {
                    if !value.trim().is_empty() {
                        info!(
                            vocabulary,
                            term = value.as_str(),
                            external_id,
                            "taxonomy term not found"
                        );
                        missed.push(value.clone());
                    }
                }
                Err(error) => missed.push(format!("{value} ({error:#})")),
            }
        }

        if missed.is_empty() {
            diagnostics.record_success(external_id, step);
        } else {
            diagnostics.record_failure(
                external_id,
                step,
                format!("term not found for: {}", missed.join(", ")),
            );
        }
        ids
    }

    /// Brand divisions pass through a fixed allow-list and are never
    /// auto-created, regardless of mode.
    pub fn resolve_brand_division(
        &self,
        terms: &mut dyn TermStore,
        value: &str,
        external_id: &str,
        step: &str,
        diagnostics: &mut DiagnosticsLog,
    ) -> Option<TermId> {
        let Some(term_name) = brand_division_term_name(value) else {
            diagnostics.record_failure(
                external_id,
                step,
                format!("brand division value {value:?} is not mapped"),
            );
            return None;
        };

        match terms.find_term(BRAND_DIVISION_VOCABULARY, term_name) {
            Ok(Some(id)) => {
                diagnostics.record_success(external_id, step);
                Some(id)
            }
            Ok(None) => {
                diagnostics.record_failure(
                    external_id,
                    step,
                    format!("brand division term {term_name:?} not found"),
                );
                None
            }
            Err(error) => {
                diagnostics.record_failure(
                    external_id,
                    step,
                    format!("brand division lookup failed: {error:#}"),
                );
                None
            }
        }
    }
}

fn brand_division_term_name(value: &str) -> Option<&'static str> {
    match value {
        "Datacard" => Some("Datacard"),
        "ECS" => Some("ECS"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::steps;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MemoryTermStore {
        terms: BTreeMap<(String, String), TermId>,
        next_id: TermId,
    }

    impl MemoryTermStore {
        fn with_term(mut self, vocabulary: &str, name: &str) -> Self {
            self.next_id += 1;
            self.terms
                .insert((vocabulary.to_string(), name.to_string()), self.next_id);
            self
        }
    }

    impl TermStore for MemoryTermStore {
        fn find_term(&mut self, vocabulary: &str, name: &str) -> Result<Option<TermId>> {
            Ok(self
                .terms
                .get(&(vocabulary.to_string(), name.to_string()))
                .copied())
        }

        fn create_term(&mut self, vocabulary: &str, name: &str) -> Result<TermId> {
            self.next_id += 1;
            self.terms
                .insert((vocabulary.to_string(), name.to_string()), self.next_id);
            Ok(self.next_id)
        }
    }

    #[test]
    fn development_mode_creates_missing_terms() {
        let mut store = MemoryTermStore::default();
        let resolver = TaxonomyResolver::new(SyncMode::Development);

        let id = resolver
            .resolve(&mut store, "Apache", SERVER_TYPES_VOCABULARY)
            .expect("resolve");
        assert!(id.is_some());
        // The created term is immediately visible to later lookups.
        assert_eq!(
            resolver
                .resolve(&mut store, "Apache", SERVER_TYPES_VOCABULARY)
                .expect("resolve again"),
            id
        );
    }

    #[test]
    fn production_mode_does_not_create_terms() {
        let mut store = MemoryTermStore::default();
        let resolver = TaxonomyResolver::new(SyncMode::Production);

        let id = resolver
            .resolve(&mut store, "Apache", SERVER_TYPES_VOCABULARY)
            .expect("resolve");
        assert!(id.is_none());
        assert!(store.terms.is_empty());
    }

    #[test]
    fn empty_value_resolves_to_nothing() {
        let mut store = MemoryTermStore::default();
        let resolver = TaxonomyResolver::new(SyncMode::Development);
        assert!(
            resolver
                .resolve(&mut store, "  ", SERVER_TYPES_VOCABULARY)
                .expect("resolve")
                .is_none()
        );
        assert!(store.terms.is_empty());
    }

    #[test]
    fn resolve_many_records_misses_in_production() {
        let mut store = MemoryTermStore::default().with_term(PRODUCTS_VOCABULARY, "Known");
        let resolver = TaxonomyResolver::new(SyncMode::Production);
        let mut diagnostics = DiagnosticsLog::new();

        let ids = resolver.resolve_many(
            &mut store,
            &["Known".to_string(), "Unknown".to_string()],
            PRODUCTS_VOCABULARY,
            "ka0",
            steps::PRODUCT_TERMS,
            &mut diagnostics,
        );
        assert_eq!(ids.len(), 1);
        assert!(
            diagnostics
                .get("ka0", steps::PRODUCT_TERMS)
                .expect("diagnostic")
                .contains("Unknown")
        );
    }

    #[test]
    fn resolve_many_clears_diagnostic_when_all_resolve() {
        let mut store = MemoryTermStore::default().with_term(PRODUCTS_VOCABULARY, "Known");
        let resolver = TaxonomyResolver::new(SyncMode::Production);
        let mut diagnostics = DiagnosticsLog::new();
        diagnostics.record_failure("ka0", steps::PRODUCT_TERMS, "stale");

        resolver.resolve_many(
            &mut store,
            &["Known".to_string()],
            PRODUCTS_VOCABULARY,
            "ka0",
            steps::PRODUCT_TERMS,
            &mut diagnostics,
        );
        assert!(diagnostics.get("ka0", steps::PRODUCT_TERMS).is_none());
    }

    #[test]
    fn brand_division_uses_allow_list() {
        let mut store = MemoryTermStore::default()
            .with_term(BRAND_DIVISION_VOCABULARY, "Datacard")
            .with_term(BRAND_DIVISION_VOCABULARY, "ECS");
        // Even development mode never creates brand divisions.
        let resolver = TaxonomyResolver::new(SyncMode::Development);
        let mut diagnostics = DiagnosticsLog::new();

        assert!(
            resolver
                .resolve_brand_division(
                    &mut store,
                    "Datacard",
                    "ka0",
                    steps::BRAND_DIVISION_TERM,
                    &mut diagnostics
                )
                .is_some()
        );
        assert!(diagnostics.is_empty());

        assert!(
            resolver
                .resolve_brand_division(
                    &mut store,
                    "Hardware",
                    "ka0",
                    steps::BRAND_DIVISION_TERM,
                    &mut diagnostics
                )
                .is_none()
        );
        assert!(
            diagnostics
                .get("ka0", steps::BRAND_DIVISION_TERM)
                .expect("diagnostic")
                .contains("not mapped")
        );
        assert_eq!(store.terms.len(), 2);
    }

    #[test]
    fn mapped_brand_division_missing_term_is_not_created() {
        let mut store = MemoryTermStore::default();
        let resolver = TaxonomyResolver::new(SyncMode::Development);
        let mut diagnostics = DiagnosticsLog::new();

        assert!(
            resolver
                .resolve_brand_division(
                    &mut store,
                    "ECS",
                    "ka0",
                    steps::BRAND_DIVISION_TERM,
                    &mut diagnostics
                )
                .is_none()
        );
        assert!(store.terms.is_empty());
        assert!(
            diagnostics
                .get("ka0", steps::BRAND_DIVISION_TERM)
                .expect("diagnostic")
                .contains("not found")
        );
    }
}
