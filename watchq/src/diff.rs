use anyhow::Result;
use log::warn;
use std::collections::HashMap;

use watchq_common::ManagedFile;

/// Outcome of applying one rule in a dry run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleOutcome {
    pub changes: Option<ChangeSet>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub diff: Option<String>,
}

/// Computes what would change on a managed file without applying it.
/// External collaborator; invoked once per qualifying event.
pub trait PendingChangeProvider: Send + Sync {
    fn dry_run(
        &self,
        id: &str,
        rule_set: &str,
        environment: &str,
    ) -> Result<HashMap<String, RuleOutcome>>;
}

/// Provider that reports a single empty outcome, for callers without a
/// rule engine attached.
pub struct NoPendingChanges;

impl PendingChangeProvider for NoPendingChanges {
    fn dry_run(
        &self,
        _id: &str,
        _rule_set: &str,
        _environment: &str,
    ) -> Result<HashMap<String, RuleOutcome>> {
        Ok(HashMap::from([("local".to_string(), RuleOutcome::default())]))
    }
}

/// Dry-run the file's rule set and extract the diff. Anything other than
/// exactly one outcome carrying a diff degrades to an empty string; the
/// event is produced either way.
pub fn pending_diff(provider: &dyn PendingChangeProvider, file: &ManagedFile) -> String {
    let outcomes = match provider.dry_run(&file.id, &file.rule_set, &file.environment) {
        Ok(outcomes) => outcomes,
        Err(err) => {
            warn!("dry run failed for {}: {err:#}", file.id);
            return String::new();
        }
    };
    if outcomes.len() != 1 {
        warn!(
            "expected one rule outcome for {}, got {}",
            file.id,
            outcomes.len()
        );
        return String::new();
    }
    outcomes
        .into_values()
        .next()
        .and_then(|outcome| outcome.changes)
        .and_then(|changes| changes.diff)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct FixedOutcomes(Vec<(String, RuleOutcome)>);

    impl PendingChangeProvider for FixedOutcomes {
        fn dry_run(
            &self,
            _id: &str,
            _rule_set: &str,
            _environment: &str,
        ) -> Result<HashMap<String, RuleOutcome>> {
            Ok(self.0.iter().cloned().collect())
        }
    }

    struct FailingProvider;

    impl PendingChangeProvider for FailingProvider {
        fn dry_run(
            &self,
            _id: &str,
            _rule_set: &str,
            _environment: &str,
        ) -> Result<HashMap<String, RuleOutcome>> {
            bail!("rule engine unreachable")
        }
    }

    fn managed() -> ManagedFile {
        ManagedFile::new("/etc/app.conf", "base", "site")
    }

    fn outcome(diff: Option<&str>) -> RuleOutcome {
        RuleOutcome {
            changes: Some(ChangeSet {
                diff: diff.map(str::to_string),
            }),
        }
    }

    #[test]
    fn single_outcome_yields_its_diff() {
        let provider = FixedOutcomes(vec![("r1".to_string(), outcome(Some("-old\n+new")))]);
        assert_eq!(pending_diff(&provider, &managed()), "-old\n+new");
    }

    #[test]
    fn ambiguous_outcomes_degrade_to_empty_diff() {
        let provider = FixedOutcomes(vec![
            ("r1".to_string(), outcome(Some("-a\n+b"))),
            ("r2".to_string(), outcome(Some("-c\n+d"))),
        ]);
        assert_eq!(pending_diff(&provider, &managed()), "");
    }

    #[test]
    fn outcome_without_changes_degrades_to_empty_diff() {
        let provider = FixedOutcomes(vec![("r1".to_string(), RuleOutcome::default())]);
        assert_eq!(pending_diff(&provider, &managed()), "");
    }

    #[test]
    fn provider_failure_degrades_to_empty_diff() {
        assert_eq!(pending_diff(&FailingProvider, &managed()), "");
    }

    #[test]
    fn no_pending_changes_is_unambiguous() {
        assert_eq!(pending_diff(&NoPendingChanges, &managed()), "");
    }
}
