use thiserror::Error;

/// User-visible failure text never reaches this many characters.
pub const MAX_USER_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum DossierError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Could not resolve company: {0}")]
    CompanyResolution(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Flattens an error chain into one line and bounds it for display.
///
/// Only the `Display` text of each cause is kept; backtraces stay in logs.
pub fn user_message(err: &anyhow::Error) -> String {
    let mut text = err
        .chain()
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": ");
    truncate_chars(&mut text, MAX_USER_MESSAGE_CHARS - 1);
    text
}

/// Truncates on a char boundary, marking the cut with an ellipsis.
pub fn truncate_chars(text: &mut String, max_chars: usize) {
    if text.chars().count() <= max_chars {
        return;
    }
    let keep = max_chars.saturating_sub(1);
    let cut = text
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    text.truncate(cut);
    text.push('…');
}
