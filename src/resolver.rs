// 🧭 Translation Resolver - (code, source, target) -> ranked matches
//
// Pure read path. One `translate` call runs against one consistent view of
// the store: source check, direct mappings, and (only when there is no
// direct mapping) one level of transitive resolution through the remaining
// system. Ranking is equivalence strength first, confidence second, so a
// high-confidence inference never outranks a stronger relationship.

use crate::cache::{self, ShadowCache};
use crate::db::StorageContext;
use crate::deadline::Deadline;
use crate::entities::{CodeSystem, ConceptMapping, Equivalence};
use crate::error::{BridgeError, Result};
use crate::mappings::{self, latest_per_target_system, latest_version};
use crate::registry;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ============================================================================
// RESPONSE TYPES
// ============================================================================

/// Intermediate code of a two-hop match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationHop {
    pub system: CodeSystem,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationMatch {
    pub equivalence: Equivalence,
    pub code: String,
    /// Target display, or the raw code when the target is not registered
    pub display: String,
    pub system: CodeSystem,
    pub confidence: f64,
    /// False when the target code is a forward reference
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<TranslationHop>,
}

impl TranslationMatch {
    pub fn is_transitive(&self) -> bool {
        self.via.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationResponse {
    pub result: bool,
    pub matches: Vec<TranslationMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TranslationResponse {
    fn negative(message: String) -> Self {
        TranslationResponse {
            result: false,
            matches: Vec::new(),
            message: Some(message),
        }
    }
}

// ============================================================================
// RANKING
// ============================================================================

/// Equivalence strength desc, confidence desc, direct before transitive,
/// then code and system ascending. Total order, so the result is repeatable.
pub fn rank_matches(matches: &mut [TranslationMatch]) {
    matches.sort_by(|a, b| {
        b.equivalence
            .strength()
            .cmp(&a.equivalence.strength())
            .then_with(|| b.confidence.total_cmp(&a.confidence))
            .then_with(|| a.is_transitive().cmp(&b.is_transitive()))
            .then_with(|| a.code.cmp(&b.code))
            .then_with(|| a.system.cmp(&b.system))
            .then_with(|| a.equivalence.as_str().cmp(b.equivalence.as_str()))
    });
}

/// Keep only the best-ranked match per (system, code). Expects ranked input.
fn dedupe_ranked(matches: Vec<TranslationMatch>) -> Vec<TranslationMatch> {
    let mut seen = HashSet::new();
    matches
        .into_iter()
        .filter(|m| seen.insert((m.system, m.code.clone())))
        .collect()
}

// ============================================================================
// RESOLVER
// ============================================================================

/// Candidate before display resolution
struct Candidate {
    target_code: String,
    equivalence: Equivalence,
    confidence: f64,
    via: Option<TranslationHop>,
}

impl Candidate {
    fn direct(mapping: &ConceptMapping) -> Self {
        Candidate {
            target_code: mapping.target_code.clone(),
            equivalence: mapping.equivalence,
            confidence: mapping.confidence,
            via: None,
        }
    }

    /// Compose two hops: weaker equivalence, multiplied confidence
    fn composed(first: &ConceptMapping, second: &ConceptMapping) -> Self {
        Candidate {
            target_code: second.target_code.clone(),
            equivalence: first.equivalence.compose(second.equivalence),
            confidence: first.confidence * second.confidence,
            via: Some(TranslationHop {
                system: first.target,
                code: first.target_code.clone(),
            }),
        }
    }
}

pub struct TranslationResolver<'a> {
    store: &'a StorageContext,
    cache: Option<&'a dyn ShadowCache>,
}

impl<'a> TranslationResolver<'a> {
    pub fn new(store: &'a StorageContext) -> Self {
        TranslationResolver { store, cache: None }
    }

    pub fn with_cache(mut self, cache: &'a dyn ShadowCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// An unregistered source code is a negative result, not an error.
    /// Storage failures and cancellation are always surfaced.
    pub fn translate(
        &self,
        code: &str,
        source: CodeSystem,
        target: CodeSystem,
        deadline: &Deadline,
    ) -> Result<TranslationResponse> {
        let key = format!("translate|{}|{}|{}", source.alias(), code, target.alias());
        cache::cached(self.cache, self.store, &key, deadline, || {
            self.store
                .read(deadline, |conn| translate_in(conn, code, source, target, deadline))
        })
    }

    /// Each code translated independently, results in input order.
    /// One deadline covers the whole batch.
    pub fn translate_batch(
        &self,
        codes: &[String],
        source: CodeSystem,
        target: CodeSystem,
        deadline: &Deadline,
    ) -> Result<Vec<TranslationResponse>> {
        let mut responses = Vec::with_capacity(codes.len());
        for code in codes {
            responses.push(self.translate(code, source, target, deadline)?);
        }

        tracing::debug!(
            count = codes.len(),
            matched = responses.iter().filter(|r| r.result).count(),
            "batch translation finished"
        );
        Ok(responses)
    }
}

fn translate_in(
    conn: &Connection,
    code: &str,
    source: CodeSystem,
    target: CodeSystem,
    deadline: &Deadline,
) -> Result<TranslationResponse> {
    if registry::find_in(conn, source, code)?.is_none() {
        return Ok(TranslationResponse::negative(format!(
            "Code {} not found in {}",
            code,
            source.alias()
        )));
    }

    deadline.check()?;
    let direct = mappings::direct_in(conn, source, code, target)?;
    let candidates = match latest_version(&direct) {
        Some(mapping) => vec![Candidate::direct(mapping)],
        None => transitive_candidates(conn, code, source, target, deadline)?,
    };

    let mut matches = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        deadline.check()?;
        matches.push(resolve_display(conn, target, candidate)?);
    }

    rank_matches(&mut matches);
    let matches = dedupe_ranked(matches);

    if matches.is_empty() {
        return Ok(TranslationResponse::negative(format!(
            "No mapping from {} {} to {}",
            source.alias(),
            code,
            target.alias()
        )));
    }

    tracing::debug!(code, source = source.alias(), target = target.alias(), matches = matches.len(), "translated");
    Ok(TranslationResponse {
        result: true,
        matches,
        message: None,
    })
}

/// sourceCode -> intermediate -> target, depth 2 only
fn transitive_candidates(
    conn: &Connection,
    code: &str,
    source: CodeSystem,
    target: CodeSystem,
    deadline: &Deadline,
) -> Result<Vec<Candidate>> {
    let outgoing = mappings::all_from_in(conn, source, code)?;
    let mut candidates = Vec::new();

    for first in latest_per_target_system(&outgoing) {
        if first.target == source || first.target == target {
            continue;
        }
        deadline.check()?;

        let second_hops = mappings::direct_in(conn, first.target, &first.target_code, target)?;
        if let Some(second) = latest_version(&second_hops) {
            // Paths back to the starting code are not translations
            if second.target == source && second.target_code == code {
                continue;
            }
            candidates.push(Candidate::composed(first, second));
        }
    }

    Ok(candidates)
}

fn resolve_display(conn: &Connection, target: CodeSystem, candidate: Candidate) -> Result<TranslationMatch> {
    let (display, resolved) = match registry::find_in(conn, target, &candidate.target_code)? {
        Some(entry) => (entry.display, true),
        None => {
            let unresolved = BridgeError::UnresolvedReference {
                system: target,
                code: candidate.target_code.clone(),
            };
            tracing::debug!(%unresolved, "falling back to raw code for display");
            (candidate.target_code.clone(), false)
        }
    };

    Ok(TranslationMatch {
        equivalence: candidate.equivalence,
        code: candidate.target_code,
        display,
        system: target,
        confidence: candidate.confidence,
        resolved,
        via: candidate.via,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::UpsertMode;
    use crate::entities::{CodeEntry, Icd11Module};
    use crate::mappings::MappingStore;
    use crate::registry::CodeRegistry;
    use proptest::prelude::*;

    fn seeded_store(mappings: &[ConceptMapping]) -> StorageContext {
        let store = StorageContext::open_in_memory().unwrap();
        let deadline = Deadline::none();
        let registry = CodeRegistry::new(&store);

        for entry in [
            CodeEntry::new(CodeSystem::Namaste, "N1", "Vatavyadhi"),
            CodeEntry::new(CodeSystem::Namaste, "N2", "Pittaja jwara"),
            CodeEntry::icd11(Icd11Module::Tm2, "I1", "Vata disorder pattern"),
            CodeEntry::new(CodeSystem::WhoAyurveda, "W1", "Vata disease"),
        ] {
            registry.upsert(&entry, UpsertMode::Insert, &deadline).unwrap();
        }

        let store_mappings = MappingStore::new(&store);
        for mapping in mappings {
            store_mappings.upsert(mapping, UpsertMode::Insert, &deadline).unwrap();
        }
        store
    }

    fn edge(
        source: CodeSystem,
        source_code: &str,
        target: CodeSystem,
        target_code: &str,
        equivalence: Equivalence,
        confidence: f64,
    ) -> ConceptMapping {
        ConceptMapping::new(source, source_code, target, target_code, equivalence, confidence)
    }

    fn candidate(code: &str, equivalence: Equivalence, confidence: f64) -> TranslationMatch {
        TranslationMatch {
            equivalence,
            code: code.to_string(),
            display: code.to_string(),
            system: CodeSystem::Icd11,
            confidence,
            resolved: true,
            via: None,
        }
    }

    #[test]
    fn test_direct_match_with_registered_display() {
        let store = seeded_store(&[edge(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "I1", Equivalence::Equivalent, 0.9)]);

        let response = TranslationResolver::new(&store)
            .translate("N1", CodeSystem::Namaste, CodeSystem::Icd11, &Deadline::none())
            .unwrap();

        assert!(response.result);
        assert_eq!(response.matches.len(), 1);
        assert_eq!(response.matches[0].display, "Vata disorder pattern");
        assert!(response.matches[0].resolved);
        assert!(response.message.is_none());
    }

    #[test]
    fn test_unknown_source_is_negative_result() {
        let store = seeded_store(&[]);

        let response = TranslationResolver::new(&store)
            .translate("UNKNOWN", CodeSystem::Namaste, CodeSystem::Icd11, &Deadline::none())
            .unwrap();

        assert!(!response.result);
        assert!(response.matches.is_empty());
        assert!(response.message.unwrap().contains("UNKNOWN"));
    }

    #[test]
    fn test_registered_source_without_mappings() {
        let store = seeded_store(&[]);
        let response = TranslationResolver::new(&store)
            .translate("N2", CodeSystem::Namaste, CodeSystem::Icd11, &Deadline::none())
            .unwrap();

        assert!(!response.result);
        assert!(response.message.unwrap().starts_with("No mapping"));
    }

    #[test]
    fn test_forward_reference_keeps_raw_code() {
        let store = seeded_store(&[edge(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "SM99", Equivalence::Wider, 0.6)]);

        let response = TranslationResolver::new(&store)
            .translate("N1", CodeSystem::Namaste, CodeSystem::Icd11, &Deadline::none())
            .unwrap();

        assert!(response.result);
        assert_eq!(response.matches[0].display, "SM99");
        assert!(!response.matches[0].resolved);
    }

    #[test]
    fn test_two_hop_composes_equivalence_and_confidence() {
        let store = seeded_store(&[
            edge(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "I1", Equivalence::Equivalent, 0.9),
            edge(CodeSystem::Icd11, "I1", CodeSystem::WhoAyurveda, "W1", Equivalence::Narrower, 0.8),
        ]);

        let response = TranslationResolver::new(&store)
            .translate("N1", CodeSystem::Namaste, CodeSystem::WhoAyurveda, &Deadline::none())
            .unwrap();

        assert!(response.result);
        assert_eq!(response.matches.len(), 1);
        let m = &response.matches[0];
        assert_eq!(m.code, "W1");
        assert_eq!(m.equivalence, Equivalence::Narrower);
        approx::assert_relative_eq!(m.confidence, 0.72, epsilon = 1e-12);
        assert_eq!(
            m.via,
            Some(TranslationHop {
                system: CodeSystem::Icd11,
                code: "I1".to_string()
            })
        );
    }

    #[test]
    fn test_direct_mapping_suppresses_transitive_path() {
        let store = seeded_store(&[
            edge(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "I1", Equivalence::Equivalent, 0.9),
            edge(CodeSystem::Icd11, "I1", CodeSystem::WhoAyurveda, "W1", Equivalence::Equivalent, 0.99),
            edge(CodeSystem::Namaste, "N1", CodeSystem::WhoAyurveda, "W2", Equivalence::Inexact, 0.3),
        ]);

        let response = TranslationResolver::new(&store)
            .translate("N1", CodeSystem::Namaste, CodeSystem::WhoAyurveda, &Deadline::none())
            .unwrap();

        assert_eq!(response.matches.len(), 1);
        assert_eq!(response.matches[0].code, "W2");
        assert!(!response.matches[0].is_transitive());
    }

    #[test]
    fn test_latest_mapping_version_wins() {
        let store = seeded_store(&[
            edge(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "I1", Equivalence::Equivalent, 0.9),
            edge(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "SM99", Equivalence::Wider, 0.5).with_version("1.1.0"),
        ]);

        let response = TranslationResolver::new(&store)
            .translate("N1", CodeSystem::Namaste, CodeSystem::Icd11, &Deadline::none())
            .unwrap();

        assert_eq!(response.matches.len(), 1);
        assert_eq!(response.matches[0].code, "SM99");
    }

    #[test]
    fn test_equivalent_outranks_higher_confidence_inexact() {
        let mut matches = vec![
            candidate("B", Equivalence::Inexact, 0.95),
            candidate("A", Equivalence::Equivalent, 0.6),
        ];
        rank_matches(&mut matches);
        assert_eq!(matches[0].code, "A");
    }

    #[test]
    fn test_dedupe_keeps_best_ranked() {
        let mut matches = vec![
            candidate("A", Equivalence::Wider, 0.5),
            candidate("A", Equivalence::Equivalent, 0.4),
        ];
        rank_matches(&mut matches);
        let deduped = dedupe_ranked(matches);

        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].equivalence, Equivalence::Equivalent);
    }

    #[test]
    fn test_batch_preserves_input_order() {
        let store = seeded_store(&[edge(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "I1", Equivalence::Equivalent, 0.9)]);
        let codes = vec!["UNKNOWN".to_string(), "N1".to_string(), "N2".to_string()];

        let responses = TranslationResolver::new(&store)
            .translate_batch(&codes, CodeSystem::Namaste, CodeSystem::Icd11, &Deadline::none())
            .unwrap();

        let results: Vec<bool> = responses.iter().map(|r| r.result).collect();
        assert_eq!(results, vec![false, true, false]);
    }

    #[test]
    fn test_cancelled_deadline_surfaces_error() {
        let store = seeded_store(&[]);
        let deadline = Deadline::none();
        deadline.cancel();

        let err = TranslationResolver::new(&store)
            .translate("N1", CodeSystem::Namaste, CodeSystem::Icd11, &deadline)
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_cached_translation_tracks_new_mappings() {
        let store = seeded_store(&[]);
        let cache = crate::cache::MemoryCache::default();
        let resolver = TranslationResolver::new(&store).with_cache(&cache);
        let deadline = Deadline::none();

        assert!(!resolver.translate("N1", CodeSystem::Namaste, CodeSystem::Icd11, &deadline).unwrap().result);

        MappingStore::new(&store)
            .upsert(
                &edge(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "I1", Equivalence::Equivalent, 0.9),
                UpsertMode::Insert,
                &deadline,
            )
            .unwrap();

        assert!(resolver.translate("N1", CodeSystem::Namaste, CodeSystem::Icd11, &deadline).unwrap().result);
    }

    fn arb_match() -> impl Strategy<Value = TranslationMatch> {
        (
            prop::sample::select(Equivalence::ALL.to_vec()),
            "[A-C][0-9]",
            0.0f64..=1.0,
            any::<bool>(),
        )
            .prop_map(|(equivalence, code, confidence, transitive)| TranslationMatch {
                via: transitive.then(|| TranslationHop {
                    system: CodeSystem::Icd11,
                    code: "I1".to_string(),
                }),
                ..candidate(&code, equivalence, confidence)
            })
    }

    proptest! {
        #[test]
        fn prop_ranking_is_order_independent(matches in prop::collection::vec(arb_match(), 0..12)) {
            let mut forward = matches.clone();
            let mut backward: Vec<_> = matches.into_iter().rev().collect();
            rank_matches(&mut forward);
            rank_matches(&mut backward);

            let forward: Vec<_> = forward.iter().map(|m| (m.code.clone(), m.equivalence, m.confidence.to_bits(), m.is_transitive())).collect();
            let backward: Vec<_> = backward.iter().map(|m| (m.code.clone(), m.equivalence, m.confidence.to_bits(), m.is_transitive())).collect();
            prop_assert_eq!(forward, backward);
        }

        #[test]
        fn prop_stronger_equivalence_always_first(matches in prop::collection::vec(arb_match(), 1..12)) {
            let mut ranked = matches;
            rank_matches(&mut ranked);
            for pair in ranked.windows(2) {
                prop_assert!(pair[0].equivalence.strength() >= pair[1].equivalence.strength());
            }
        }
    }
}
