use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing_subscriber::{EnvFilter, fmt};

pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Cuts `input` to at most `max_chars` Unicode scalar values, without any marker.
pub fn clip_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn format_cost(cost_usd: f64) -> String {
    if !cost_usd.is_finite() || cost_usd <= 0.0 {
        return "$0.00".to_string();
    }
    if cost_usd < 0.01 {
        format!("${cost_usd:.4}")
    } else if cost_usd < 1.0 {
        format!("${cost_usd:.3}")
    } else {
        format!("${cost_usd:.2}")
    }
}

pub fn format_age(ts: Option<DateTime<Utc>>) -> String {
    let Some(ts) = ts else {
        return "n/a".to_string();
    };
    let now = Utc::now();
    if ts >= now {
        return "now".to_string();
    }
    let delta = (now - ts).to_std().unwrap_or_default();
    format!("{} ago", human_duration(delta))
}

pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn truncate(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        return input.to_string();
    }
    if max_len <= 3 {
        return clip_chars(input, max_len);
    }
    format!("{}...", clip_chars(input, max_len - 3))
}

pub fn single_line(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_formatting() {
        assert_eq!(format_tokens(999), "999");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(1_500_000), "1.5M");
    }

    #[test]
    fn cost_formatting() {
        assert_eq!(format_cost(0.0), "$0.00");
        assert_eq!(format_cost(0.0009), "$0.0009");
        assert_eq!(format_cost(0.1284), "$0.128");
        assert_eq!(format_cost(12.3456), "$12.35");
    }

    #[test]
    fn clip_never_splits_a_code_point() {
        let input = "日本語のテキスト".repeat(2_000);
        let clipped = clip_chars(&input, 1_000);
        assert_eq!(clipped.chars().count(), 1_000);
        assert!(input.starts_with(&clipped));
        assert_eq!(clip_chars("short", 10), "short");
    }

    #[test]
    fn truncate_adds_ellipsis_on_char_boundary() {
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
        assert_eq!(truncate("abc", 3), "abc");
        assert_eq!(truncate("abcdef", 2), "ab");
    }

    #[test]
    fn durations_are_humanized() {
        assert_eq!(human_duration(Duration::from_secs(42)), "42s");
        assert_eq!(human_duration(Duration::from_secs(3_700)), "1h 1m");
        assert_eq!(human_duration(Duration::from_secs(90_000)), "1d 1h");
    }

    #[test]
    fn single_line_collapses_whitespace() {
        assert_eq!(single_line("a\n  b\tc "), "a b c");
    }
}
