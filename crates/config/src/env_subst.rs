use std::{borrow::Cow, sync::OnceLock};

use regex::{Captures, Regex};

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
}

/// Replace `${ENV_VAR}` placeholders with values from the process environment.
///
/// Unresolvable variables are left as-is.
pub fn substitute_env(input: &str) -> Cow<'_, str> {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Same as [`substitute_env`] with an injectable lookup.
pub fn substitute_env_with<'a>(
    input: &'a str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Cow<'a, str> {
    let Some(re) = placeholder() else {
        return Cow::Borrowed(input);
    };
    re.replace_all(input, |caps: &Captures<'_>| {
        lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
}
