//! Pure rule evaluation for the verity identity gateway.
//!
//! This crate is deliberately free of I/O and async: `evaluate` is a pure
//! function from gathered evidence to a decision. The caller supplies the
//! evaluation instant, so the same input always produces the same output.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Seconds in a Julian year.
const JULIAN_YEAR_SECS: f64 = 365.25 * 86_400.0;

/// The decision being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Is the subject a valid citizen aged 18 or over?
    AgeVerification,
    /// Is the subject free of sanctions listings?
    SanctionsScreening,
}

impl DecisionKind {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgeVerification => "age_verification",
            Self::SanctionsScreening => "sanctions_screening",
        }
    }

    /// Parse the wire label.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "age_verification" => Some(Self::AgeVerification),
            "sanctions_screening" => Some(Self::SanctionsScreening),
            _ => None,
        }
    }
}

/// Identity evidence distilled from a citizen registry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityEvidence {
    /// Registry validity verdict.
    pub valid: bool,
    /// Date of birth, when the registry disclosed it.
    pub date_of_birth: Option<NaiveDate>,
}

/// Sanctions evidence distilled from a screening record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanctionsEvidence {
    /// Whether the subject appears on a sanctions list.
    pub listed: bool,
}

/// A credential already held by the subject (e.g. a previously issued age
/// credential).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialEvidence {
    /// Credential type label.
    pub credential_type: String,
}

/// Everything the decision engine may consult.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionInput {
    /// Citizen registry evidence, when gathered.
    pub identity: Option<IdentityEvidence>,
    /// Sanctions evidence, when gathered.
    pub sanctions: Option<SanctionsEvidence>,
    /// Held credential, when presented.
    pub credential: Option<CredentialEvidence>,
}

/// Decision outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    /// All checks passed.
    Pass,
    /// A check failed.
    Fail,
    /// Checks passed but conditions must be met.
    PassWithConditions,
}

impl DecisionStatus {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::PassWithConditions => "pass_with_conditions",
        }
    }
}

/// What the engine looked at, with `None` marking checks that were never
/// evaluated (as opposed to checks that evaluated to `false`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSummary {
    /// Citizen validity, when evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citizen_valid: Option<bool>,
    /// Sanctions listing. Always evaluated.
    pub sanctions_listed: bool,
    /// Credential presence, when evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_credential: Option<bool>,
    /// Age check, when evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_over_18: Option<bool>,
}

/// The result of evaluating one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    /// Outcome.
    pub status: DecisionStatus,
    /// Machine-readable reason.
    pub reason: String,
    /// Conditions attached to a conditional pass.
    pub conditions: Vec<String>,
    /// What was evaluated.
    pub evidence: EvidenceSummary,
    /// The instant supplied by the caller.
    pub evaluated_at: DateTime<Utc>,
}

/// Age in Julian years at `now`.
#[must_use]
pub fn age_in_julian_years(date_of_birth: NaiveDate, now: DateTime<Utc>) -> f64 {
    let born = date_of_birth
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc();
    (now - born).num_seconds() as f64 / JULIAN_YEAR_SECS
}

/// Evaluate `kind` over `input` at `now`.
///
/// Pure: no I/O, no clock access, no randomness. Same input, same output.
#[must_use]
pub fn evaluate(kind: DecisionKind, input: &DecisionInput, now: DateTime<Utc>) -> DecisionResult {
    match kind {
        DecisionKind::AgeVerification => evaluate_age_verification(input, now),
        DecisionKind::SanctionsScreening => evaluate_sanctions_screening(input, now),
    }
}

/// Age verification rule chain, fail-fast:
/// sanctioned -> invalid citizen -> underage -> credential.
fn evaluate_age_verification(input: &DecisionInput, now: DateTime<Utc>) -> DecisionResult {
    let sanctions_listed = input.sanctions.as_ref().is_some_and(|s| s.listed);
    if sanctions_listed {
        return build_result(
            DecisionStatus::Fail,
            "sanctioned",
            vec![],
            EvidenceSummary {
                sanctions_listed: true,
                ..EvidenceSummary::default()
            },
            now,
        );
    }

    let citizen_valid = input.identity.as_ref().map(|i| i.valid);
    if citizen_valid != Some(true) {
        return build_result(
            DecisionStatus::Fail,
            "invalid_citizen",
            vec![],
            EvidenceSummary {
                citizen_valid,
                sanctions_listed,
                ..EvidenceSummary::default()
            },
            now,
        );
    }

    let is_over_18 = input
        .identity
        .as_ref()
        .and_then(|i| i.date_of_birth)
        .map(|dob| age_in_julian_years(dob, now) >= 18.0);
    if is_over_18 != Some(true) {
        return build_result(
            DecisionStatus::Fail,
            "underage",
            vec![],
            EvidenceSummary {
                citizen_valid,
                sanctions_listed,
                is_over_18,
                ..EvidenceSummary::default()
            },
            now,
        );
    }

    let has_credential = Some(input.credential.is_some());
    let summary = EvidenceSummary {
        citizen_valid,
        sanctions_listed,
        has_credential,
        is_over_18,
    };

    if input.credential.is_some() {
        build_result(DecisionStatus::Pass, "all_checks_passed", vec![], summary, now)
    } else {
        build_result(
            DecisionStatus::PassWithConditions,
            "missing_credential",
            vec!["obtain_age_credential".to_string()],
            summary,
            now,
        )
    }
}

fn evaluate_sanctions_screening(input: &DecisionInput, now: DateTime<Utc>) -> DecisionResult {
    let listed = input.sanctions.as_ref().is_some_and(|s| s.listed);
    let summary = EvidenceSummary {
        sanctions_listed: listed,
        ..EvidenceSummary::default()
    };
    if listed {
        build_result(DecisionStatus::Fail, "sanctioned", vec![], summary, now)
    } else {
        build_result(DecisionStatus::Pass, "not_sanctioned", vec![], summary, now)
    }
}

fn build_result(
    status: DecisionStatus,
    reason: &str,
    conditions: Vec<String>,
    evidence: EvidenceSummary,
    evaluated_at: DateTime<Utc>,
) -> DecisionResult {
    DecisionResult {
        status,
        reason: reason.to_string(),
        conditions,
        evidence,
        evaluated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn adult_dob() -> NaiveDate {
        NaiveDate::from_ymd_opt(1990, 1, 1).unwrap()
    }

    fn full_input(listed: bool, valid: bool, dob: Option<NaiveDate>, credential: bool) -> DecisionInput {
        DecisionInput {
            identity: Some(IdentityEvidence {
                valid,
                date_of_birth: dob,
            }),
            sanctions: Some(SanctionsEvidence { listed }),
            credential: credential.then(|| CredentialEvidence {
                credential_type: "age_over_18".to_string(),
            }),
        }
    }

    #[test]
    fn sanctioned_subject_fails_first() {
        // GIVEN: a sanctioned but otherwise perfect subject
        let input = full_input(true, true, Some(adult_dob()), true);

        // WHEN: age verification runs
        let result = evaluate(DecisionKind::AgeVerification, &input, now());

        // THEN: fail-fast on the sanctions rule; later checks not evaluated
        assert_eq!(result.status, DecisionStatus::Fail);
        assert_eq!(result.reason, "sanctioned");
        assert!(result.evidence.sanctions_listed);
        assert_eq!(result.evidence.citizen_valid, None);
        assert_eq!(result.evidence.is_over_18, None);
        assert_eq!(result.evidence.has_credential, None);
    }

    #[test]
    fn invalid_citizen_fails_second() {
        let input = full_input(false, false, Some(adult_dob()), true);
        let result = evaluate(DecisionKind::AgeVerification, &input, now());
        assert_eq!(result.status, DecisionStatus::Fail);
        assert_eq!(result.reason, "invalid_citizen");
        assert_eq!(result.evidence.citizen_valid, Some(false));
    }

    #[test]
    fn missing_identity_evidence_is_invalid_citizen_not_evaluated() {
        // GIVEN: no identity evidence was gathered at all
        let input = DecisionInput {
            sanctions: Some(SanctionsEvidence { listed: false }),
            ..DecisionInput::default()
        };

        let result = evaluate(DecisionKind::AgeVerification, &input, now());

        // THEN: fails, and the summary distinguishes "not evaluated" from "false"
        assert_eq!(result.reason, "invalid_citizen");
        assert_eq!(result.evidence.citizen_valid, None);
    }

    #[test]
    fn underage_fails_third() {
        let dob = NaiveDate::from_ymd_opt(2010, 6, 1).unwrap();
        let input = full_input(false, true, Some(dob), true);
        let result = evaluate(DecisionKind::AgeVerification, &input, now());
        assert_eq!(result.status, DecisionStatus::Fail);
        assert_eq!(result.reason, "underage");
        assert_eq!(result.evidence.is_over_18, Some(false));
        assert_eq!(result.evidence.citizen_valid, Some(true));
    }

    #[test]
    fn unknown_dob_fails_with_age_not_evaluated() {
        let input = full_input(false, true, None, true);
        let result = evaluate(DecisionKind::AgeVerification, &input, now());
        assert_eq!(result.reason, "underage");
        assert_eq!(result.evidence.is_over_18, None);
    }

    #[test]
    fn credential_holder_passes_clean() {
        let input = full_input(false, true, Some(adult_dob()), true);
        let result = evaluate(DecisionKind::AgeVerification, &input, now());
        assert_eq!(result.status, DecisionStatus::Pass);
        assert_eq!(result.reason, "all_checks_passed");
        assert!(result.conditions.is_empty());
        assert_eq!(result.evidence.has_credential, Some(true));
    }

    #[test]
    fn missing_credential_passes_with_conditions() {
        let input = full_input(false, true, Some(adult_dob()), false);
        let result = evaluate(DecisionKind::AgeVerification, &input, now());
        assert_eq!(result.status, DecisionStatus::PassWithConditions);
        assert_eq!(result.reason, "missing_credential");
        assert_eq!(result.conditions, vec!["obtain_age_credential".to_string()]);
        assert_eq!(result.evidence.has_credential, Some(false));
    }

    #[test]
    fn age_boundary_is_18_julian_years() {
        // 18 Julian years = 6574.5 days.
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let just_under = NaiveDate::from_ymd_opt(2008, 2, 1).unwrap();
        assert!(age_in_julian_years(just_under, at) < 18.0);

        let just_over = NaiveDate::from_ymd_opt(2007, 12, 1).unwrap();
        assert!(age_in_julian_years(just_over, at) >= 18.0);

        let input = full_input(false, true, Some(just_under), false);
        assert_eq!(
            evaluate(DecisionKind::AgeVerification, &input, at).reason,
            "underage"
        );
        let input = full_input(false, true, Some(just_over), false);
        assert_eq!(
            evaluate(DecisionKind::AgeVerification, &input, at).reason,
            "missing_credential"
        );
    }

    #[test]
    fn sanctions_screening_listed_fails() {
        let input = DecisionInput {
            sanctions: Some(SanctionsEvidence { listed: true }),
            ..DecisionInput::default()
        };
        let result = evaluate(DecisionKind::SanctionsScreening, &input, now());
        assert_eq!(result.status, DecisionStatus::Fail);
        assert_eq!(result.reason, "sanctioned");
    }

    #[test]
    fn sanctions_screening_clear_passes() {
        let input = DecisionInput {
            sanctions: Some(SanctionsEvidence { listed: false }),
            ..DecisionInput::default()
        };
        let result = evaluate(DecisionKind::SanctionsScreening, &input, now());
        assert_eq!(result.status, DecisionStatus::Pass);
        assert_eq!(result.reason, "not_sanctioned");
    }

    #[test]
    fn evaluation_is_pure() {
        // GIVEN: the same input evaluated twice at the same instant
        let input = full_input(false, true, Some(adult_dob()), false);
        let at = now();

        // WHEN/THEN: identical results
        let a = evaluate(DecisionKind::AgeVerification, &input, at);
        let b = evaluate(DecisionKind::AgeVerification, &input, at);
        assert_eq!(a, b);
    }

    #[test]
    fn kind_labels_round_trip() {
        assert_eq!(
            DecisionKind::parse(DecisionKind::AgeVerification.as_str()),
            Some(DecisionKind::AgeVerification)
        );
        assert_eq!(
            DecisionKind::parse(DecisionKind::SanctionsScreening.as_str()),
            Some(DecisionKind::SanctionsScreening)
        );
        assert_eq!(DecisionKind::parse("credit_score"), None);
    }
}
