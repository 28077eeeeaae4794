use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// Split a list into comma separated lines of at most `per_line` entries
pub fn paginate(items: &[String], per_line: usize) -> Vec<String> {
    items
        .chunks(per_line.max(1))
        .map(|chunk| chunk.join(", "))
        .collect()
}

// Render an uptime as `1d 02h 03m 04s`
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let (days, rest) = (total / 86_400, total % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let (minutes, seconds) = (rest / 60, rest % 60);

    if days > 0 {
        format!("{}d {:02}h {:02}m {:02}s", days, hours, minutes, seconds)
    } else {
        format!("{:02}h {:02}m {:02}s", hours, minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginate_five_per_line() {
        let maps: Vec<String> = (1..=7).map(|i| format!("mb2_map{}", i)).collect();
        let lines = paginate(&maps, 5);

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "mb2_map1, mb2_map2, mb2_map3, mb2_map4, mb2_map5");
        assert_eq!(lines[1], "mb2_map6, mb2_map7");
        assert!(paginate(&[], 5).is_empty());
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(59)), "00h 00m 59s");
        assert_eq!(format_uptime(Duration::from_secs(93_784)), "1d 02h 03m 04s");
    }

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01 in millis
        assert!(get_timestamp() > 1_577_836_800_000);
    }
}
