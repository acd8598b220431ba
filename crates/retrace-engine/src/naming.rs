//! Suggested clip filenames.

use chrono::{DateTime, TimeZone};
use retrace_core::AttemptMarker;
use std::fmt::Display;
use std::path::{Path, PathBuf};

/// Make `label` safe for use in a filename.
///
/// Anything other than ASCII letters, digits, `-` and `_` becomes `_`;
/// runs of `_` collapse and leading or trailing ones are removed. An empty
/// result becomes `clip`.
pub fn sanitize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' };
        if c == '_' && (out.is_empty() || out.ends_with('_')) {
            continue;
        }
        out.push(c);
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("clip");
    }
    out
}

/// `<dir>/<label>_attempts_<first>-<last>_<YYYYmmdd_HHMMSS>.mp4`, or
/// `<dir>/clip_<YYYYmmdd_HHMMSS>.mp4` without attempts.
pub fn suggested_filename<Tz>(dir: &Path, bounds: Option<(&AttemptMarker, &AttemptMarker)>, now: DateTime<Tz>) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let stamp = now.format("%Y%m%d_%H%M%S");
    let name = match bounds {
        Some((newest, oldest)) => format!(
            "{}_attempts_{}-{}_{}.mp4",
            sanitize_label(&newest.label),
            oldest.sequence,
            newest.sequence,
            stamp
        ),
        None => format!("clip_{}.mp4", stamp),
    };
    dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("Bloodbath"), "Bloodbath");
        assert_eq!(sanitize_label("Sonic Wave: Rebirth"), "Sonic_Wave_Rebirth");
        assert_eq!(sanitize_label("../../etc"), "etc");
        assert_eq!(sanitize_label("  "), "clip");
        assert_eq!(sanitize_label("level-7"), "level-7");
    }

    #[test]
    fn test_suggested_filename() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let oldest = AttemptMarker::new(30, "Deadlocked", 12);
        let newest = AttemptMarker::new(300, "Deadlocked", 16);

        let path = suggested_filename(Path::new("clips"), Some((&newest, &oldest)), now);
        assert_eq!(path, Path::new("clips").join("Deadlocked_attempts_12-16_20260304_050607.mp4"));

        let empty = suggested_filename(Path::new("clips"), None, now);
        assert_eq!(empty, Path::new("clips").join("clip_20260304_050607.mp4"));
    }
}
