//! Environment lookups and `os.environ/NAME` reference resolution for config values.

pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn env_bool(name: &str) -> bool {
    env_var(name)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Name of the variable referenced by `os.environ/NAME` or `os.environ["NAME"]`.
pub fn env_ref_name(value: &str) -> Option<&str> {
    let value = value.trim();
    if let Some(name) = value.strip_prefix("os.environ/") {
        let name = name.trim();
        return (!name.is_empty()).then_some(name);
    }
    if let Some(rest) = value.strip_prefix("os.environ[") {
        let inner = rest.trim_end_matches(']').trim();
        let inner = inner.trim_matches('\'').trim_matches('"').trim();
        return (!inner.is_empty()).then_some(inner);
    }
    None
}

/// Resolves an env reference with `lookup`; plain values pass through trimmed.
pub fn resolve_env_ref_with<F>(value: &str, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    match env_ref_name(value) {
        Some(name) => lookup(name),
        None => {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        }
    }
}

pub fn resolve_env_ref(value: &str) -> Option<String> {
    resolve_env_ref_with(value, env_var)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_both_reference_forms() {
        assert_eq!(env_ref_name("os.environ/OPENAI_API_KEY"), Some("OPENAI_API_KEY"));
        assert_eq!(env_ref_name("os.environ['AZURE_KEY']"), Some("AZURE_KEY"));
        assert_eq!(env_ref_name("sk-plain"), None);
    }

    #[test]
    fn resolves_through_lookup() {
        let lookup = |name: &str| (name == "K").then(|| "secret".to_string());
        assert_eq!(
            resolve_env_ref_with("os.environ/K", lookup).as_deref(),
            Some("secret")
        );
        assert_eq!(resolve_env_ref_with("os.environ/MISSING", lookup), None);
        assert_eq!(
            resolve_env_ref_with("  literal ", lookup).as_deref(),
            Some("literal")
        );
    }
}
