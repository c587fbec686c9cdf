use chrono::TimeZone as _;

pub fn build_host() -> &'static str {
    option_env!("APPLAUNCHER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("APPLAUNCHER_BUILD_TIME").unwrap_or("unknown")
}

pub fn build_time_pretty() -> String {
    format_build_time_pretty(build_time_raw())
}

pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:") {
        if let Ok(secs) = epoch.trim().parse::<i64>() {
            // Render in UTC, stable across environments.
            if let Some(dt) = chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0) {
                return dt.format("%Y-%m-%d %H:%M:%S").to_string();
            }
            return chrono::Utc
                .timestamp_opt(0, 0)
                .unwrap()
                .format("%Y-%m-%d %H:%M:%S")
                .to_string();
        }
    }

    // Common case: RFC3339 "YYYY-MM-DDTHH:MM:SSZ" -> "YYYY-MM-DD HH:MM:SS" (UTC)
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt
            .with_timezone(&chrono::Utc)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
    }

    // Best-effort fallback.
    raw.replace('T', " ").trim_end_matches('Z').to_string()
}

pub fn banner() -> String {
    format!(
        "Application launcher version {} (built on {} at {}).",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        build_time_pretty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch_timestamps() {
        assert_eq!(format_build_time_pretty("epoch:0"), "1970-01-01 00:00:00");
    }

    #[test]
    fn formats_rfc3339_timestamps() {
        assert_eq!(
            format_build_time_pretty("2026-08-06T12:30:00Z"),
            "2026-08-06 12:30:00"
        );
    }

    #[test]
    fn passes_through_unknown_formats() {
        assert_eq!(format_build_time_pretty("unknown"), "unknown");
    }
}
