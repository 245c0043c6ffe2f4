//! Log file location, ANSI stripping and timestamps.
use std::fs;
use std::path::PathBuf;

/// Strip ANSI escape sequences from a string.
///
/// Handles SGR sequences (ending in `m`) and other CSI sequences (ending
/// in any letter in the `@`..`~` range), so cursor movement, erase, etc.
/// are also stripped without consuming unrelated text.
pub(super) fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if let Some(next) = chars.next()
                && next == '['
            {
                for inner in chars.by_ref() {
                    if ('@'..='~').contains(&inner) {
                        break;
                    }
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Return the `$XDG_CACHE_HOME/statekeep/` directory, creating it if needed.
pub(super) fn statekeep_cache_dir() -> Option<PathBuf> {
    let cache_dir = std::env::var("XDG_CACHE_HOME").map_or_else(
        |_| {
            std::env::var("HOME")
                .or_else(|_| std::env::var("USERPROFILE"))
                .map_or_else(|_| PathBuf::from("."), PathBuf::from)
                .join(".cache")
        },
        PathBuf::from,
    );
    let dir = cache_dir.join("statekeep");
    fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

/// Return the log file path for `run` under `$XDG_CACHE_HOME/statekeep/logs/`
/// (or `~/.cache/statekeep/logs/`).
pub(super) fn log_file_path(run: &str) -> Option<PathBuf> {
    let dir = statekeep_cache_dir()?.join("logs");
    fs::create_dir_all(&dir).ok()?;
    Some(dir.join(format!("{run}.log")))
}

/// Name of the log for one run: `<operation>-<snapshot id>`, or just the
/// command when there is no snapshot. Characters that do not belong in a
/// file name become `_`.
#[must_use]
pub fn run_log_name(command: &str, snapshot_id: Option<&str>) -> String {
    let raw = snapshot_id.map_or_else(|| command.to_string(), |id| format!("{command}-{id}"));
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Format the current UTC time as `YYYY-MM-DD HH:MM:SS`.
pub(super) fn format_utc_datetime() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Format the current UTC time as `HH:MM:SS`.
pub(super) fn format_utc_time() -> String {
    chrono::Utc::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_summary_colors() {
        assert_eq!(
            strip_ansi("\x1b[32m✓ files/Settings\x1b[0m"),
            "✓ files/Settings"
        );
        assert_eq!(
            strip_ansi("\x1b[1;34m==>\x1b[0m \x1b[1mBackup\x1b[0m"),
            "==> Backup"
        );
        assert_eq!(strip_ansi("plain"), "plain");
        assert_eq!(strip_ansi(""), "");
    }

    #[test]
    fn strip_ansi_handles_non_sgr_sequences() {
        assert_eq!(strip_ansi("\x1b[2Jcleared"), "cleared");
        assert_eq!(strip_ansi("\x1b[Kline"), "line");
        assert_eq!(strip_ansi("\x1b7saved"), "saved");
    }

    #[test]
    fn run_log_name_joins_operation_and_snapshot() {
        assert_eq!(
            run_log_name("backup", Some("20260314-120509")),
            "backup-20260314-120509"
        );
        assert_eq!(run_log_name("version", None), "version");
    }

    #[test]
    fn run_log_name_replaces_path_characters() {
        assert_eq!(run_log_name("restore", Some("my snap/1")), "restore-my_snap_1");
    }

    #[test]
    fn timestamps_have_expected_shape() {
        let time = format_utc_time();
        assert_eq!(time.len(), 8);
        assert_eq!(&time[2..3], ":");
        let datetime = format_utc_datetime();
        assert_eq!(datetime.len(), 19);
        assert_eq!(&datetime[10..11], " ");
    }
}
