// Local crates
use crate::watcher::models::LogFile;

/// Pick the most recently modified file.
///
/// Only a strictly newer modification time replaces the current pick, so on
/// exact ties the first file in iteration order wins. Callers that need a
/// reproducible result must aggregate their candidates in a fixed order.
pub fn select_latest<I>(files: I) -> Option<LogFile>
where
    I: IntoIterator<Item = LogFile>,
{
    files.into_iter().fold(None, |latest, candidate| match latest {
        Some(current) if !candidate.is_newer_than(&current) => Some(current),
        _ => Some(candidate),
    })
}
