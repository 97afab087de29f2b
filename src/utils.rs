use std::time::Duration;

/// Format a wait like "05h 07m 09s", or "07m 09s" when under an hour
pub fn format_countdown(remaining: Duration) -> String {
    let total = remaining.as_secs();
    if total == 0 {
        return "now".to_string();
    }
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{:02}h {:02}m {:02}s", hours, minutes, secs)
    } else {
        format!("{:02}m {:02}s", minutes, secs)
    }
}

/// Shorten an identifier for log output, keeping the first 10 characters
pub fn abbreviate(id: &str) -> String {
    if id.chars().count() <= 10 {
        id.to_string()
    } else {
        let head: String = id.chars().take(10).collect();
        format!("{}...", head)
    }
}
