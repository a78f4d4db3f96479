use serde::{Deserialize, Serialize};

/// Admission decision produced by a judge. Composes by worst-wins:
/// Reject absorbs everything, Quarantine is sticky over Accept, Accept is
/// the neutral element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject {
        reason: String,
    },
    Quarantine {
        reason: String,
        #[serde(default)]
        evidence: Vec<String>,
    },
}

impl Verdict {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    pub fn quarantine(reason: impl Into<String>, evidence: Vec<String>) -> Self {
        Self::Quarantine {
            reason: reason.into(),
            evidence,
        }
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject { .. })
    }

    /// Fold two verdicts, worst wins. Two quarantines merge their evidence
    /// bundles and keep the first reason.
    pub fn combine(self, other: Verdict) -> Verdict {
        match (self, other) {
            (reject @ Verdict::Reject { .. }, _) => reject,
            (_, reject @ Verdict::Reject { .. }) => reject,
            (
                Verdict::Quarantine {
                    reason,
                    mut evidence,
                },
                Verdict::Quarantine {
                    evidence: more, ..
                },
            ) => {
                evidence.extend(more);
                Verdict::Quarantine { reason, evidence }
            }
            (quarantine @ Verdict::Quarantine { .. }, Verdict::Accept) => quarantine,
            (Verdict::Accept, other) => other,
        }
    }
}

impl Default for Verdict {
    fn default() -> Self {
        Self::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_absorbs() {
        let rejected = Verdict::reject("over ceiling");
        assert_eq!(
            rejected.clone().combine(Verdict::Accept),
            Verdict::reject("over ceiling")
        );
        assert_eq!(
            Verdict::quarantine("risky", vec![]).combine(rejected.clone()),
            rejected
        );
    }

    #[test]
    fn quarantine_is_sticky_over_accept() {
        let verdict = Verdict::quarantine("cpu spike", vec!["cpu>3000".into()])
            .combine(Verdict::Accept);
        assert!(matches!(verdict, Verdict::Quarantine { .. }));
    }

    #[test]
    fn quarantines_merge_evidence() {
        let verdict = Verdict::quarantine("a", vec!["e1".into()])
            .combine(Verdict::quarantine("b", vec!["e2".into()]));
        match verdict {
            Verdict::Quarantine { reason, evidence } => {
                assert_eq!(reason, "a");
                assert_eq!(evidence, vec!["e1".to_string(), "e2".to_string()]);
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn accept_is_neutral() {
        assert_eq!(Verdict::Accept.combine(Verdict::Accept), Verdict::Accept);
    }
}
