use crate::error::Error;

/// Single-token wildcard.
pub const WILDCARD: &str = "*";

/// Trailing wildcard matching one or more tokens.
pub const FULL_WILDCARD: &str = ">";

/// Validates a concrete subject that can be published to or routed on.
///
/// # Errors
///
/// Returns `Error::InvalidSubject` for empty subjects, empty tokens, whitespace or wildcards.
pub fn validate(subject: &str) -> Result<(), Error> {
    if !is_well_formed(subject)
        || subject
            .split('.')
            .any(|token| token == WILDCARD || token == FULL_WILDCARD)
    {
        return Err(Error::InvalidSubject(subject.to_string()));
    }

    Ok(())
}

/// Validates a subject filter, which may contain wildcards.
///
/// # Errors
///
/// Returns `Error::InvalidSubject` for malformed filters or a `>` that isn't the last token.
pub fn validate_filter(filter: &str) -> Result<(), Error> {
    if !is_well_formed(filter) {
        return Err(Error::InvalidSubject(filter.to_string()));
    }

    let tokens: Vec<&str> = filter.split('.').collect();
    let misplaced_full_wildcard = tokens
        .iter()
        .take(tokens.len() - 1)
        .any(|token| *token == FULL_WILDCARD);
    let partial_wildcard = tokens.iter().any(|token| {
        token.len() > 1 && (token.contains('*') || token.contains('>'))
    });

    if misplaced_full_wildcard || partial_wildcard {
        return Err(Error::InvalidSubject(filter.to_string()));
    }

    Ok(())
}

/// Whether `subject` is matched by `filter`.
#[must_use]
pub fn matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(FULL_WILDCARD), Some(_)) => return true,
            (Some(f), Some(s)) if f == WILDCARD || f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn is_well_formed(subject: &str) -> bool {
    !subject.is_empty()
        && !subject.chars().any(char::is_whitespace)
        && subject.split('.').all(|token| !token.is_empty())
}
