//! Property tests for the stock ledger invariant.
//!
//! For any sequence of reserve/release/deduct/adjust/expire operations, at
//! every observable step `total == available + reserved`, both quantities
//! are non-negative (by type) and the sum of active reservation quantities
//! equals `reserved`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code

use chrono::{Duration, Utc};
use merx_core::event::ReleaseReason;
use merx_core::types::{OrderId, ProductId, Quantity};
use merx_inventory::product::Product;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Reserve { quantity: u32, ttl_secs: i64 },
    Release { index: usize },
    Deduct { index: usize },
    Adjust { new_total: u32 },
    ExpireDue { advance_secs: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..20, 1i64..120).prop_map(|(quantity, ttl_secs)| Op::Reserve { quantity, ttl_secs }),
        (0usize..32).prop_map(|index| Op::Release { index }),
        (0usize..32).prop_map(|index| Op::Deduct { index }),
        (0u32..200).prop_map(|new_total| Op::Adjust { new_total }),
        (0i64..180).prop_map(|advance_secs| Op::ExpireDue { advance_secs }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn ledger_invariant_holds_under_any_operation_sequence(
        initial in 0u32..150,
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let mut product = Product::new(
            ProductId::new(),
            "Widget".to_string(),
            Quantity::new(initial),
            Quantity::new(5),
        );
        let mut now = Utc::now();
        let mut issued = Vec::new();

        for op in ops {
            match op {
                Op::Reserve { quantity, ttl_secs } => {
                    let expires_at = now + Duration::seconds(ttl_secs);
                    if let Ok(id) =
                        product.reserve(OrderId::new(), Quantity::new(quantity), expires_at, now)
                    {
                        issued.push(id);
                    }
                }
                Op::Release { index } => {
                    if let Some(id) = issued.get(index % issued.len().max(1)) {
                        let _ = product.release(*id, ReleaseReason::Cancelled, now);
                    }
                }
                Op::Deduct { index } => {
                    if let Some(id) = issued.get(index % issued.len().max(1)) {
                        let _ = product.deduct(*id, now);
                    }
                }
                Op::Adjust { new_total } => {
                    let _ = product.adjust(Quantity::new(new_total), "property", now);
                }
                Op::ExpireDue { advance_secs } => {
                    now += Duration::seconds(advance_secs);
                    product.expire_due(now);
                }
            }

            // The ledger invariant must hold after every single operation.
            prop_assert!(product.invariant_holds());
            prop_assert_eq!(
                product.stock.total().get(),
                product.stock.available.get() + product.stock.reserved.get()
            );
        }
    }
}
