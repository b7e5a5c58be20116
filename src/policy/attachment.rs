use serde::{Deserialize, Serialize};

use super::guardrail::pattern_matches;

/// Caller and request facts attachments are matched against.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyContext {
    pub team_id: Option<String>,
    pub key_id: Option<String>,
    pub model: String,
    pub tags: Vec<String>,
}

impl PolicyContext {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn with_key(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Binds a policy to the requests it applies to. Dimensions are ANDed; values
/// within a dimension are ORed; an empty dimension matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAttachment {
    pub policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn dimension_matches<'a>(patterns: &[String], mut values: impl Iterator<Item = &'a str>) -> bool {
    patterns.is_empty() || values.any(|value| patterns.iter().any(|pattern| pattern_matches(pattern, value)))
}

impl PolicyAttachment {
    pub fn global(policy: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            scope: Some("*".to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, ctx: &PolicyContext) -> bool {
        if self.scope.as_deref().map(str::trim) == Some("*") {
            return true;
        }
        dimension_matches(&self.teams, ctx.team_id.as_deref().into_iter())
            && dimension_matches(&self.keys, ctx.key_id.as_deref().into_iter())
            && dimension_matches(&self.models, std::iter::once(ctx.model.as_str()))
            && dimension_matches(&self.tags, ctx.tags.iter().map(String::as_str))
    }
}

/// Attachments matching `ctx`, in declaration order.
pub fn matching_attachments<'a>(
    attachments: &'a [PolicyAttachment],
    ctx: &PolicyContext,
) -> Vec<&'a PolicyAttachment> {
    attachments.iter().filter(|attachment| attachment.matches(ctx)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(json: serde_json::Value) -> PolicyAttachment {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn star_scope_matches_everything() {
        assert!(PolicyAttachment::global("p").matches(&PolicyContext::default()));
    }

    #[test]
    fn empty_dimensions_are_wildcards_and_dimensions_are_anded() {
        let a = attachment(serde_json::json!({
            "policy": "p",
            "teams": ["t1", "t2"],
            "models": ["openai/*"]
        }));
        let ctx = PolicyContext::new("openai/gpt-4o").with_team("t2");
        assert!(a.matches(&ctx));
        assert!(!a.matches(&PolicyContext::new("anthropic/claude").with_team("t2")));
        assert!(!a.matches(&PolicyContext::new("openai/gpt-4o")));
        assert!(!a.matches(&PolicyContext::new("openai/gpt-4o").with_team("t3")));
    }

    #[test]
    fn any_request_tag_satisfies_the_tag_dimension() {
        let a = attachment(serde_json::json!({"policy": "p", "tags": ["production"]}));
        let tagged = PolicyContext::new("m").with_tags(vec!["beta".into(), "production".into()]);
        assert!(a.matches(&tagged));
        assert!(!a.matches(&PolicyContext::new("m").with_tags(vec!["beta".into()])));
    }

    #[test]
    fn returns_all_matches() {
        let attachments = vec![
            PolicyAttachment::global("base"),
            attachment(serde_json::json!({"policy": "keyed", "keys": ["k1"]})),
            attachment(serde_json::json!({"policy": "other", "keys": ["k2"]})),
        ];
        let ctx = PolicyContext::new("m").with_key("k1");
        let names: Vec<&str> = matching_attachments(&attachments, &ctx)
            .into_iter()
            .map(|a| a.policy.as_str())
            .collect();
        assert_eq!(names, vec!["base", "keyed"]);
    }
}
