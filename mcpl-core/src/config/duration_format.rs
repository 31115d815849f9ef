//! Duration parsing for configuration values like `"30m"`.

use std::time::Duration;

/// Parse a humantime-style duration (`"30m"`, `"1h 30m"`, `"90s"`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s.trim())
        .map_err(|e| format!("expected a duration like \"30m\": {e}"))
}
