/// Property-based tests using proptest
/// Invariants of the metric derivations and helpers that must hold for all inputs
use bigdecimal::BigDecimal;
use mcc_console::cache_validator::snapshot_checksum;
use mcc_console::google_ads_models::normalize_customer_id;
use mcc_console::metrics_math::{avg_cpc, ctr, micros_to_currency, percent, zero};
use mcc_console::metrics_sync::SyncPacing;
use mcc_console::provisioning::AccountNamer;
use proptest::prelude::*;
use std::collections::HashSet;

fn scale(value: &BigDecimal) -> i64 {
    value.as_bigint_and_exponent().1
}

// Property: currency values always carry two decimals and round to the nearest cent
proptest! {
    #[test]
    fn currency_has_scale_two(micros in -1_000_000_000_000i64..1_000_000_000_000i64) {
        prop_assert_eq!(scale(&micros_to_currency(micros)), 2);
    }

    #[test]
    fn currency_rounds_to_nearest_cent(micros in 0i64..1_000_000_000_000i64) {
        let value = micros_to_currency(micros);
        let exact = BigDecimal::from(micros) / BigDecimal::from(1_000_000);
        let diff = (value - exact).abs();
        prop_assert!(diff <= BigDecimal::new(5.into(), 3));
    }

    #[test]
    fn ratios_with_zero_denominator_are_zero(n in 0i64..1_000_000_000) {
        prop_assert_eq!(ctr(n, 0), zero());
        prop_assert_eq!(avg_cpc(n, 0), zero());
        prop_assert_eq!(percent(n, 0), 0);
    }

    #[test]
    fn ctr_is_a_percentage(impressions in 1i64..10_000_000, ratio in 0.0f64..=1.0) {
        let clicks = (impressions as f64 * ratio) as i64;
        let value = ctr(clicks, impressions);
        prop_assert_eq!(scale(&value), 2);
        prop_assert!(value >= zero());
        prop_assert!(value <= BigDecimal::from(100));
    }

    #[test]
    fn percent_within_bounds(whole in 1i64..1_000_000_000, ratio in 0.0f64..=1.0) {
        let part = (whole as f64 * ratio) as i64;
        let p = percent(part, whole);
        prop_assert!((0..=100).contains(&p));
    }
}

// Property: pacing never waits before the first account
proptest! {
    #[test]
    fn pacing_batch_pause_on_multiples(index in 0usize..1_000) {
        let pacing = SyncPacing::default();
        let waits = pacing.waits_before(index);
        if index == 0 {
            prop_assert!(waits.is_empty());
        } else {
            prop_assert_eq!(waits[0], pacing.account_delay);
            prop_assert_eq!(waits.contains(&pacing.batch_pause), index % pacing.batch_every == 0);
        }
        prop_assert!(SyncPacing::none().waits_before(index).is_empty());
    }
}

// Property: helpers are deterministic and idempotent
proptest! {
    #[test]
    fn normalize_is_idempotent(raw in "[0-9 -]{0,20}") {
        let once = normalize_customer_id(&raw);
        prop_assert!(!once.contains('-'));
        prop_assert_eq!(normalize_customer_id(&once), once.clone());
    }

    #[test]
    fn checksum_is_stable_hex(names in prop::collection::vec("[a-z]{1,8}", 0..10)) {
        let folders = serde_json::json!(names);
        let accounts = serde_json::json!({ "count": names.len() });
        let a = snapshot_checksum(&folders, &accounts);
        let b = snapshot_checksum(&folders, &accounts);
        prop_assert_eq!(a.len(), 64);
        prop_assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(a, b);
    }

    #[test]
    fn account_names_unique_within_batch(locals in prop::collection::vec("[a-z]{1,4}", 1..20)) {
        let mut namer = AccountNamer::default();
        let names: HashSet<String> = locals
            .iter()
            .map(|l| namer.next_name(&format!("{}@example.com", l)))
            .collect();
        prop_assert_eq!(names.len(), locals.len());
    }
}
