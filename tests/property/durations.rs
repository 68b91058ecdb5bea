// tests/property/durations.rs

use std::time::Duration;

use proptest::prelude::*;

use formicary::types::parse_duration;

proptest! {
    #[test]
    fn compound_durations_add_up(h in 0u64..48, m in 0u64..600, s in 0u64..600, ms in 0u64..5000) {
        let text = format!("{h}h{m}m{s}s{ms}ms");
        let expected = Duration::from_secs(h * 3600 + m * 60 + s) + Duration::from_millis(ms);
        prop_assert_eq!(parse_duration(&text), Ok(expected));
    }

    #[test]
    fn bare_numbers_are_seconds(secs in 0u64..1_000_000) {
        prop_assert_eq!(parse_duration(&secs.to_string()), Ok(Duration::from_secs(secs)));
    }

    #[test]
    fn unknown_units_are_rejected(n in 1u64..1000, unit in "[dwy]") {
        let input = format!("{n}{unit}");
        prop_assert!(parse_duration(&input).is_err());
    }
}
