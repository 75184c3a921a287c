//! Property-based test generators using proptest.
//!
//! Strategies produce domain values that satisfy the store's
//! validation rules, so generated inputs exercise behavior rather than
//! input rejection.

use outpost_store::Identity;
use proptest::prelude::*;

/// Strategy for valid email addresses.
pub fn email_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{3,10}@[a-z]{3,8}\\.(com|org|dev)").expect("valid regex")
}

/// Strategy for identities that pass [`Identity::validate`].
pub fn identity_strategy() -> impl Strategy<Value = Identity> {
    (
        prop::string::string_regex("ext-[a-z0-9]{4,12}").expect("valid regex"),
        email_strategy(),
        prop::string::string_regex("[A-Z][a-z]{2,8}").expect("valid regex"),
        prop::string::string_regex("[A-Z][a-z]{2,8}").expect("valid regex"),
        prop::option::of(prop::string::string_regex("[a-z]{3,12}").expect("valid regex")),
        prop::sample::select(vec!["google", "github", "test"]),
    )
        .prop_map(
            |(external_id, email, first_name, last_name, username, provider)| Identity {
                external_id,
                name: format!("{first_name} {last_name}"),
                email,
                first_name,
                last_name,
                username,
                avatar_url: None,
                provider: provider.to_string(),
            },
        )
}

/// Strategy for feature/action pairs as the activity logger records
/// them.
pub fn feature_action_strategy() -> impl Strategy<Value = (String, String)> {
    (
        prop::sample::select(vec!["screenshot", "clipboard", "settings", "export"]),
        prop::sample::select(vec!["captured", "processed", "opened", "requested"]),
    )
        .prop_map(|(feature, action)| (feature.to_string(), action.to_string()))
}

/// Strategy for optional structured event details.
pub fn details_strategy() -> impl Strategy<Value = Option<serde_json::Value>> {
    prop::option::of(
        prop::collection::btree_map(
            prop::string::string_regex("[a-z]{1,8}").expect("valid regex"),
            any::<i32>(),
            0..4,
        )
        .prop_map(|map| serde_json::json!(map)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::test_sync_config;
    use outpost_store::RecordStore;
    use outpost_sync::{MockPortal, SyncEngine};
    use std::sync::Arc;

    proptest! {
        #[test]
        fn generated_identities_are_valid(identity in identity_strategy()) {
            prop_assert!(identity.validate().is_ok());
        }

        /// Regardless of event count and batch size, repeated sync
        /// cycles deliver every unit exactly once, in enqueue order.
        #[test]
        fn delivery_preserves_enqueue_order(
            events in prop::collection::vec(
                (feature_action_strategy(), details_strategy()),
                1..20,
            ),
            batch_size in 1usize..8,
        ) {
            let store = Arc::new(RecordStore::new());
            let user = store
                .upsert_user(&crate::fixtures::test_identity("p@example.com"))
                .unwrap();
            for ((feature, action), details) in events {
                store
                    .log_usage_event(user.id, &feature, &action, details)
                    .unwrap();
            }
            let expected: Vec<String> = store
                .peek_batch(usize::MAX, chrono::Utc::now())
                .unwrap()
                .iter()
                .map(|unit| unit.transfer_id.clone())
                .collect();

            let portal = Arc::new(MockPortal::new());
            let engine = SyncEngine::new(
                test_sync_config().with_batch_size(batch_size),
                Arc::clone(&store),
                Arc::clone(&portal),
            )
            .unwrap();
            while store.outbox_depth().unwrap() > 0 {
                let outcome = engine.sync_once().unwrap();
                prop_assert!(outcome.delivered > 0);
            }
            prop_assert_eq!(portal.applied(), expected);
        }
    }
}
