//! Correlation rules: merging evidence gathered from multiple providers.
//!
//! The parallel strategy collects one evidence item per provider and applies
//! the first applicable rule. Rules are pure over their inputs.

use std::collections::HashMap;

use crate::config::ProviderType;

use super::Evidence;

/// A rule that can merge multi-provider evidence into one item.
pub trait CorrelationRule: Send + Sync + 'static {
    /// Rule name, for logs and provenance metadata.
    fn name(&self) -> &str;

    /// Whether this rule applies to the gathered types.
    fn applicable(&self, types: &[ProviderType]) -> bool;

    /// Merge evidence of the rule's type(s) into a single item. Returns
    /// `None` when there is nothing to merge (fewer than two relevant items).
    fn merge(&self, evidence: &[Evidence]) -> Option<Evidence>;
}

/// Reconciles conflicting `full_name` fields across citizen sources.
///
/// The highest-confidence source wins the name; agreement between sources
/// scales the merged confidence (full agreement keeps the best source's
/// confidence, disagreement discounts it proportionally).
#[derive(Debug, Default)]
pub struct CitizenNameRule;

impl CorrelationRule for CitizenNameRule {
    fn name(&self) -> &str {
        "citizen_name"
    }

    fn applicable(&self, types: &[ProviderType]) -> bool {
        types.iter().filter(|t| **t == ProviderType::Citizen).count() >= 2
    }

    fn merge(&self, evidence: &[Evidence]) -> Option<Evidence> {
        let citizens: Vec<&Evidence> = evidence
            .iter()
            .filter(|e| e.provider_type == ProviderType::Citizen)
            .collect();
        if citizens.len() < 2 {
            return None;
        }

        let best = citizens.iter().max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;

        let winning_name = best
            .citizen_record()
            .map(|r| r.full_name)
            .unwrap_or_default();
        let normalized = |name: &str| name.trim().to_lowercase();
        let agreeing = citizens
            .iter()
            .filter(|e| {
                e.citizen_record()
                    .is_some_and(|r| normalized(&r.full_name) == normalized(&winning_name))
            })
            .count();

        let agreement = agreeing as f64 / citizens.len() as f64;
        let sources: Vec<&str> = citizens.iter().map(|e| e.provider_id.as_str()).collect();

        let mut merged = (**best).clone();
        merged.confidence = (best.confidence * agreement).clamp(0.0, 1.0);
        merged = merged
            .with_metadata("correlation_rule", "citizen_name")
            .with_metadata("sources", &sources.join(","))
            .with_metadata("name_agreement", &format!("{agreeing}/{}", citizens.len()));
        Some(merged)
    }
}

/// Combines confidences across providers using per-type weights.
#[derive(Debug)]
pub struct WeightedAverageRule {
    weights: HashMap<ProviderType, f64>,
}

impl WeightedAverageRule {
    /// Create a rule with explicit per-type weights. Types without a weight
    /// default to 1.0.
    #[must_use]
    pub fn new(weights: HashMap<ProviderType, f64>) -> Self {
        Self { weights }
    }

    fn weight(&self, provider_type: ProviderType) -> f64 {
        self.weights.get(&provider_type).copied().unwrap_or(1.0)
    }
}

impl Default for WeightedAverageRule {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl CorrelationRule for WeightedAverageRule {
    fn name(&self) -> &str {
        "weighted_average"
    }

    fn applicable(&self, types: &[ProviderType]) -> bool {
        types.len() >= 2
    }

    fn merge(&self, evidence: &[Evidence]) -> Option<Evidence> {
        if evidence.len() < 2 {
            return None;
        }

        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for item in evidence {
            let w = self.weight(item.provider_type);
            weighted_sum += item.confidence * w;
            weight_total += w;
        }
        if weight_total == 0.0 {
            return None;
        }

        let best = evidence.iter().max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;

        let mut merged = best.clone();
        merged.confidence = (weighted_sum / weight_total).clamp(0.0, 1.0);
        merged = merged.with_metadata("correlation_rule", "weighted_average");
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CitizenRecord;
    use chrono::Utc;

    fn citizen_evidence(provider: &str, name: &str, confidence: f64) -> Evidence {
        let record = CitizenRecord {
            national_id: "S123".into(),
            full_name: name.into(),
            date_of_birth: None,
            address: String::new(),
            valid: true,
            source: provider.into(),
            checked_at: Utc::now(),
        };
        Evidence::from_citizen(&record, provider, confidence)
    }

    #[test]
    fn citizen_name_requires_two_citizen_sources() {
        let rule = CitizenNameRule;
        assert!(!rule.applicable(&[ProviderType::Citizen]));
        assert!(!rule.applicable(&[ProviderType::Citizen, ProviderType::Sanctions]));
        assert!(rule.applicable(&[ProviderType::Citizen, ProviderType::Citizen]));
    }

    #[test]
    fn agreeing_names_keep_best_confidence() {
        let rule = CitizenNameRule;
        let merged = rule
            .merge(&[
                citizen_evidence("a", "Ada Lovelace", 0.8),
                citizen_evidence("b", " ada lovelace ", 0.6),
            ])
            .unwrap();

        assert_eq!(merged.citizen_record().unwrap().full_name, "Ada Lovelace");
        assert!((merged.confidence - 0.8).abs() < 1e-9);
        assert_eq!(merged.metadata["name_agreement"], "2/2");
    }

    #[test]
    fn conflicting_names_pick_higher_confidence_and_discount() {
        // GIVEN: two sources disagreeing on the name
        let rule = CitizenNameRule;
        let merged = rule
            .merge(&[
                citizen_evidence("a", "Ada Lovelace", 0.9),
                citizen_evidence("b", "Ada King", 0.7),
            ])
            .unwrap();

        // THEN: the stronger source's name wins, confidence is discounted
        assert_eq!(merged.citizen_record().unwrap().full_name, "Ada Lovelace");
        assert!((merged.confidence - 0.45).abs() < 1e-9);
        assert_eq!(merged.metadata["name_agreement"], "1/2");
    }

    #[test]
    fn weighted_average_combines_confidences() {
        let mut weights = HashMap::new();
        weights.insert(ProviderType::Citizen, 2.0);
        weights.insert(ProviderType::Sanctions, 1.0);
        let rule = WeightedAverageRule::new(weights);

        let sanctions = Evidence::from_sanctions(
            &crate::model::SanctionsRecord {
                national_id: "S123".into(),
                listed: false,
                source: "s".into(),
                checked_at: Utc::now(),
                list_type: None,
                reason: None,
            },
            "s",
            0.6,
        );
        let merged = rule
            .merge(&[citizen_evidence("a", "Ada", 0.9), sanctions])
            .unwrap();

        // (0.9*2 + 0.6*1) / 3 = 0.8
        assert!((merged.confidence - 0.8).abs() < 1e-9);
        assert_eq!(merged.metadata["correlation_rule"], "weighted_average");
    }

    #[test]
    fn single_item_merges_to_none() {
        assert!(CitizenNameRule.merge(&[citizen_evidence("a", "Ada", 0.9)]).is_none());
        assert!(WeightedAverageRule::default()
            .merge(&[citizen_evidence("a", "Ada", 0.9)])
            .is_none());
    }
}
