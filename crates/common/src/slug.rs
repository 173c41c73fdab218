// Slug validation for caller-chosen tab and step identifiers.
//
// Slugs: ASCII alphanumerics plus `-` and `_`, 1..=100 chars.

use thiserror::Error;

/// Maximum allowed slug length in characters.
pub const MAX_SLUG_CHARS: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlugError {
    #[error("slug is empty")]
    Empty,

    #[error("slug exceeds maximum length of {MAX_SLUG_CHARS} characters")]
    TooLong,

    #[error("slug contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Validate a caller-chosen slug, returning it unchanged on success.
pub fn validate_slug(input: &str) -> Result<&str, SlugError> {
    if input.is_empty() {
        return Err(SlugError::Empty);
    }

    if input.chars().count() > MAX_SLUG_CHARS {
        return Err(SlugError::TooLong);
    }

    if let Some(bad) = input.chars().find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_'))
    {
        return Err(SlugError::InvalidChar(bad));
    }

    Ok(input)
}

/// Return the first slug that appears more than once, if any.
pub fn first_duplicate<'a, I>(slugs: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = std::collections::HashSet::new();
    slugs.into_iter().find(|slug| !seen.insert(*slug))
}
