// Chat address normalisation. Free-form phone input becomes a canonical
// `{digits}@c.us` JID; anything already addressed passes through.
use anyhow::{anyhow, Result};

/// Normalise a recipient into a JID the chat network accepts.
///
/// Group ids (`@g.us`), user ids (`@c.us`) and anything else containing
/// `@` are returned unchanged. Bare numbers are rewritten to the
/// Indonesian international form.
pub fn normalize_jid(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Empty JID"));
    }
    if trimmed.contains('@') {
        return Ok(trimmed.to_string());
    }

    let digits: String = trimmed
        .strip_prefix('+')
        .unwrap_or(trimmed)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return Err(anyhow!("Unsupported phone number format"));
    }

    let canonical = if digits.starts_with("62") {
        digits
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("62{rest}")
    } else if digits.starts_with('8') {
        format!("62{digits}")
    } else {
        return Err(anyhow!("Unsupported phone number format"));
    };

    Ok(format!("{canonical}@c.us"))
}

/// The digits of a JID, used for fuzzy mention matching in groups.
pub fn jid_digits(jid: &str) -> String {
    jid.split('@')
        .next()
        .unwrap_or(jid)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_addressed_inputs_through() {
        assert_eq!(normalize_jid("123-456@g.us").unwrap(), "123-456@g.us");
        assert_eq!(normalize_jid("628123@c.us").unwrap(), "628123@c.us");
        assert_eq!(normalize_jid("weird@custom.host").unwrap(), "weird@custom.host");
    }

    #[test]
    fn rewrites_local_numbers() {
        assert_eq!(normalize_jid("08123").unwrap(), "628123@c.us");
        assert_eq!(normalize_jid("+628123").unwrap(), "628123@c.us");
        assert_eq!(normalize_jid("8123").unwrap(), "628123@c.us");
        assert_eq!(normalize_jid("62812 345").unwrap(), "62812345@c.us");
    }

    #[test]
    fn rejects_unknown_prefixes() {
        assert!(normalize_jid("7123").is_err());
        assert!(normalize_jid("12345").is_err());
    }

    #[test]
    fn rejects_empty_input() {
        let err = normalize_jid("  ").unwrap_err();
        assert_eq!(err.to_string(), "Empty JID");
    }

    #[test]
    fn normalisation_is_idempotent() {
        for input in ["08123", "+628123", "8123", "628123@c.us", "g1@g.us"] {
            let once = normalize_jid(input).unwrap();
            let twice = normalize_jid(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn digits_extraction() {
        assert_eq!(jid_digits("628111@c.us"), "628111");
        assert_eq!(jid_digits("123-456@g.us"), "123456");
    }
}
