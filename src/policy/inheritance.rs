use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::{Policy, PolicyError};

pub const MAX_INHERITANCE_DEPTH: usize = 50;

/// The chain for `name`, child first and root last.
pub fn resolve_chain<'a>(
    policies: &'a BTreeMap<String, Policy>,
    name: &str,
) -> Result<Vec<&'a Policy>, PolicyError> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(name);
    while let Some(policy_name) = current {
        if !seen.insert(policy_name) {
            let mut path: Vec<&str> = chain.iter().map(|policy: &&Policy| policy.name.as_str()).collect();
            path.push(policy_name);
            return Err(PolicyError::CycleDetected(path.join(" -> ")));
        }
        if chain.len() >= MAX_INHERITANCE_DEPTH {
            return Err(PolicyError::DepthExceeded {
                policy: name.to_string(),
                max: MAX_INHERITANCE_DEPTH,
            });
        }
        let policy = policies
            .get(policy_name)
            .ok_or_else(|| PolicyError::UnknownPolicy(policy_name.to_string()))?;
        chain.push(policy);
        current = policy.inherit.as_deref();
    }
    Ok(chain)
}

/// Effective guardrails of a child-first chain: walking root to child, each level
/// adds its `add` set and then drops its `remove` set.
pub fn merge_chain(chain: &[&Policy]) -> BTreeSet<String> {
    let mut guardrails = BTreeSet::new();
    for policy in chain.iter().rev() {
        guardrails.extend(policy.guardrails.add.iter().cloned());
        for removed in &policy.guardrails.remove {
            guardrails.remove(removed);
        }
    }
    guardrails
}

pub fn effective_guardrails(
    policies: &BTreeMap<String, Policy>,
    name: &str,
) -> Result<BTreeSet<String>, PolicyError> {
    Ok(merge_chain(&resolve_chain(policies, name)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(name: &str, inherit: Option<&str>, add: &[&str], remove: &[&str]) -> (String, Policy) {
        let mut policy = Policy::new(name);
        policy.inherit = inherit.map(str::to_string);
        policy.guardrails.add = add.iter().map(|s| s.to_string()).collect();
        policy.guardrails.remove = remove.iter().map(|s| s.to_string()).collect();
        (name.to_string(), policy)
    }

    #[test]
    fn removals_apply_after_additions_at_each_level() {
        let policies: BTreeMap<_, _> = [
            policy("root", None, &["g1", "g2"], &[]),
            policy("child", Some("root"), &["g3", "g4"], &["g1"]),
            policy("grandchild", Some("child"), &["g5"], &["g2"]),
        ]
        .into_iter()
        .collect();
        let chain = resolve_chain(&policies, "grandchild").unwrap();
        let names: Vec<&str> = chain.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["grandchild", "child", "root"]);
        let effective: Vec<String> = merge_chain(&chain).into_iter().collect();
        assert_eq!(effective, vec!["g3", "g4", "g5"]);
    }

    #[test]
    fn repeated_names_are_cycles() {
        let policies: BTreeMap<_, _> = [
            policy("a", Some("b"), &[], &[]),
            policy("b", Some("a"), &[], &[]),
            policy("self", Some("self"), &[], &[]),
        ]
        .into_iter()
        .collect();
        let err = resolve_chain(&policies, "a").unwrap_err();
        assert!(err.to_string().contains("cycle detected"));
        assert!(matches!(
            resolve_chain(&policies, "self"),
            Err(PolicyError::CycleDetected(_))
        ));
    }

    #[test]
    fn chains_deeper_than_the_limit_are_rejected() {
        let mut policies = BTreeMap::new();
        for idx in 0..=MAX_INHERITANCE_DEPTH {
            let parent = (idx > 0).then(|| format!("p{}", idx - 1));
            let (name, policy) = policy(&format!("p{idx}"), parent.as_deref(), &[], &[]);
            policies.insert(name, policy);
        }
        assert!(resolve_chain(&policies, &format!("p{}", MAX_INHERITANCE_DEPTH - 1)).is_ok());
        assert!(matches!(
            resolve_chain(&policies, &format!("p{MAX_INHERITANCE_DEPTH}")),
            Err(PolicyError::DepthExceeded { .. })
        ));
    }

    #[test]
    fn unknown_parents_are_reported() {
        let policies: BTreeMap<_, _> = [policy("a", Some("ghost"), &[], &[])].into_iter().collect();
        assert!(matches!(
            resolve_chain(&policies, "a"),
            Err(PolicyError::UnknownPolicy(name)) if name == "ghost"
        ));
    }
}
