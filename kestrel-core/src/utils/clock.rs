use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock unix seconds
pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_after_2024() {
        assert!(now_ts() > 1_704_067_200);
    }
}
