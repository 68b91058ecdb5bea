// tests/property/capacity.rs

use std::time::Duration;

use proptest::prelude::*;
use uuid::Uuid;

use formicary::errors::FormicaryError;
use formicary::resource::ResourceManager;
use formicary::types::TaskMethod;

use crate::common::AntRegistrationBuilder;

proptest! {
    #[test]
    fn reservations_never_exceed_pool_capacity(
        capacities in proptest::collection::vec(1u32..4, 1..5),
        requests in 0usize..20,
    ) {
        let manager = ResourceManager::new(Duration::from_secs(30), Duration::from_secs(60));
        for (i, capacity) in capacities.iter().enumerate() {
            manager
                .register(AntRegistrationBuilder::new(&format!("ant-{i}")).capacity(*capacity).build())
                .unwrap();
        }
        let pool: u32 = capacities.iter().sum();

        let mut granted = Vec::new();
        for i in 0..requests {
            match manager.reserve(Uuid::new_v4(), &format!("task-{i}"), TaskMethod::Shell, &[]) {
                Ok(reservation) => {
                    prop_assert_eq!(reservation.total_reservations as usize, granted.len() + 1);
                    granted.push(reservation);
                }
                Err(err) => {
                    prop_assert!(matches!(err, FormicaryError::AntsUnavailable(_)));
                    prop_assert!(err.is_retryable());
                }
            }
        }

        prop_assert_eq!(granted.len(), requests.min(pool as usize));
        prop_assert_eq!(manager.total_bindings(), granted.len());
        for (i, capacity) in capacities.iter().enumerate() {
            let ant_id = format!("ant-{i}");
            prop_assert!(manager.load_of(&ant_id) <= *capacity);
        }

        for reservation in &granted {
            prop_assert!(manager.release(reservation));
        }
        prop_assert_eq!(manager.total_bindings(), 0);
    }
}
