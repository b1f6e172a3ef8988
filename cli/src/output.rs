//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// First 12 hex characters of an ID, without any `sha256:` prefix.
pub fn short_id(id: &str) -> String {
    let hex = id.strip_prefix("sha256:").unwrap_or(id);
    hex.chars().take(12).collect()
}

/// Format a chrono timestamp as a relative "ago" string.
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let now = chrono::Utc::now();
    let duration = now.signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }

    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }

    let months = days / 30;
    if months < 12 {
        return format!("{months} months ago");
    }

    let years = days / 365;
    format!("{years} years ago")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("sha256:0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_format_ago() {
        let now = Utc::now();
        assert_eq!(format_ago(&(now + Duration::seconds(30))), "just now");
        assert!(format_ago(&(now - Duration::minutes(5))).ends_with("minutes ago"));
        assert!(format_ago(&(now - Duration::days(3))).ends_with("days ago"));
        assert!(format_ago(&(now - Duration::days(800))).ends_with("years ago"));
    }

    #[test]
    fn test_new_table_has_headers() {
        let table = new_table(&["A", "B"]);
        let rendered = table.to_string();
        assert!(rendered.contains('A'));
        assert!(rendered.contains('B'));
    }
}
