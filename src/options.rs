use std::collections::HashSet;

/// Ordered `key=value` pairs from a hosting request. Keys are lowercased.
pub type OptionList = Vec<(String, String)>;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum OptionsError {
    #[error("failed to parse options: {0}")]
    Tokenize(String),
    #[error("expected key=value, got `{0}`")]
    MissingValue(String),
    #[error("empty option name in `{0}`")]
    EmptyKey(String),
    #[error("duplicate option `{0}`")]
    DuplicateKey(String),
}

/// Split a raw option string with shell quoting rules into ordered pairs.
///
/// `hostname="My Server" iwad=doom2` yields two pairs. A key that appears
/// twice rejects the whole request.
pub fn parse_options(raw: &str) -> Result<OptionList, OptionsError> {
    let words = shell_words::split(raw).map_err(|e| OptionsError::Tokenize(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut pairs = Vec::with_capacity(words.len());

    for word in words {
        let Some((key, value)) = word.split_once('=') else {
            return Err(OptionsError::MissingValue(word));
        };
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return Err(OptionsError::EmptyKey(word));
        }
        if !seen.insert(key.clone()) {
            return Err(OptionsError::DuplicateKey(key));
        }
        pairs.push((key, value.trim().to_string()));
    }

    Ok(pairs)
}

/// Boolean aliases accepted by on/off style options. Anything else is false.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "on" | "true" | "yes" | "enable" | "1"
    )
}

/// Split a comma-separated list, trimming and dropping empty entries.
pub fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_pairs() {
        let pairs = parse_options("iwad=doom2 hostname=Test wad=x.wad").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("iwad".to_string(), "doom2".to_string()),
                ("hostname".to_string(), "Test".to_string()),
                ("wad".to_string(), "x.wad".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_quoted_value() {
        let pairs = parse_options(r#"hostname="My Cool Server" skill=4"#).unwrap();
        assert_eq!(pairs[0], ("hostname".to_string(), "My Cool Server".to_string()));
        assert_eq!(pairs[1], ("skill".to_string(), "4".to_string()));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let pairs = parse_options("hostname=a=b").unwrap();
        assert_eq!(pairs[0].1, "a=b");
    }

    #[test]
    fn test_keys_are_lowercased() {
        let pairs = parse_options("IWAD=doom2").unwrap();
        assert_eq!(pairs[0].0, "iwad");
    }

    #[test]
    fn test_duplicate_key_rejected() {
        assert_eq!(
            parse_options("wad=a.wad WAD=b.wad").unwrap_err(),
            OptionsError::DuplicateKey("wad".to_string())
        );
    }

    #[test]
    fn test_missing_value_rejected() {
        assert_eq!(
            parse_options("iwad=doom2 bogus").unwrap_err(),
            OptionsError::MissingValue("bogus".to_string())
        );
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            parse_options("=doom2").unwrap_err(),
            OptionsError::EmptyKey(_)
        ));
    }

    #[test]
    fn test_unterminated_quote_rejected() {
        assert!(matches!(
            parse_options(r#"hostname="oops"#).unwrap_err(),
            OptionsError::Tokenize(_)
        ));
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_options("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_bool_aliases() {
        for v in ["on", "true", "YES", "enable", "1"] {
            assert!(parse_bool(v), "{v} should be true");
        }
        for v in ["off", "false", "no", "0", "maybe", ""] {
            assert!(!parse_bool(v), "{v} should be false");
        }
    }

    #[test]
    fn test_split_list() {
        let items: Vec<_> = split_list(" a.wad, ,b.wad ,").collect();
        assert_eq!(items, vec!["a.wad", "b.wad"]);
    }
}
