use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?P<escaped>\$\$)",
        r"|\$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)",
        r"|\$\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)(?::-(?P<fallback>[^}]*))?\}",
    ))
    .expect("placeholder regex is valid")
});

/// Expands environment placeholders in a configuration file.
///
/// Understands `$NAME`, `${NAME}` and `${NAME:-fallback}`; `$$` stands for
/// a literal `$`. A variable that is neither set nor given a fallback expands
/// to nothing and is reported in the returned warnings.
pub fn interpolate(input: &str, vars: &HashMap<String, String>) -> (String, Vec<String>) {
    let mut warnings = Vec::new();
    let output = PLACEHOLDER.replace_all(input, |caps: &Captures<'_>| {
        if caps.name("escaped").is_some() {
            return "$".to_owned();
        }

        let name = match caps.name("bare").or_else(|| caps.name("braced")) {
            Some(name) => name.as_str(),
            None => return String::new(),
        };
        match (vars.get(name), caps.name("fallback")) {
            (Some(value), _) => value.clone(),
            (None, Some(fallback)) => fallback.as_str().to_owned(),
            (None, None) => {
                warnings.push(format!(
                    "Environment variable {} is not set, substituting an empty value",
                    name
                ));
                String::new()
            }
        }
    });
    (output.into_owned(), warnings)
}
