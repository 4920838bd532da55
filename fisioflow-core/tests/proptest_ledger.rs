//! Property tests: random sequences of redemptions, cancellations, refunds,
//! settlement passes, withdrawals and split changes never break the ledger.
//!
//! After every operation, successful or refused:
//!   - every voucher keeps `0 <= sessions_used <= sessions_total`;
//!   - no voucher has more settled sessions than it sold;
//!   - partner balances stay non-negative;
//!   - the ledger fold equals the cached partner aggregates;
//!   - every completed session's snapshot sums exactly to its price;
//!   - the settled sessions of a voucher never book more than its final
//!     price, and book exactly that once every session is used;
//!   - the partner's split sums to 100.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use fisioflow_core::{
    CommissionSplit, CoreConfig, Destination, IssueVoucher, PatientId, SessionId, SessionMetadata, VoucherEngine,
    VoucherId, VoucherType,
};
use fisioflow_store::{Database, ManualClock, PersistenceConfig};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Debug, Clone)]
enum Op {
    Redeem(usize),
    Settle,
    Cancel(usize),
    Withdraw(u32),
    Refund(usize),
    Resplit(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => (0..3usize).prop_map(Op::Redeem),
        2 => Just(Op::Settle),
        1 => (0..16usize).prop_map(Op::Cancel),
        2 => (5_000u32..40_000).prop_map(Op::Withdraw),
        1 => (0..3usize).prop_map(Op::Refund),
        1 => (0u8..40).prop_map(Op::Resplit),
    ]
}

struct World {
    engine: VoucherEngine,
    partner: fisioflow_core::PartnerId,
    patient: PatientId,
    vouchers: Vec<(VoucherId, String)>,
    sessions: Vec<SessionId>,
    refs: u32,
}

fn world() -> World {
    let start = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).single().expect("valid");
    let clock = Arc::new(ManualClock::new(start));
    let db = Database::open_in_memory(&PersistenceConfig::default()).expect("db");
    let engine = VoucherEngine::new(Arc::new(db), clock, CoreConfig::default()).expect("engine");

    let split = CommissionSplit::new(dec!(12.5), dec!(3.25), dec!(2), dec!(82.25));
    let partner = engine.create_partner("Studio Ana", split, None).expect("partner").id;
    engine.activate_partner(partner).expect("activate");
    let patient = PatientId::new();
    engine.register_patient(patient, "Bruno").expect("patient");

    let vouchers = [(5, dec!(333.33)), (3, dec!(100.00)), (10, dec!(999.99))]
        .into_iter()
        .enumerate()
        .map(|(i, (sessions, price))| {
            let v = engine
                .issue_voucher(&IssueVoucher {
                    partner_id: partner,
                    patient_id: patient,
                    voucher_type: VoucherType::Package,
                    sessions_total: sessions,
                    price,
                    discount: None,
                    valid_from: None,
                    valid_until: start + Duration::days(90),
                })
                .expect("issue");
            engine.confirm_payment(v.id, &format!("pay-{i}"), "pix").expect("pay");
            (v.id, v.code)
        })
        .collect();

    World {
        engine,
        partner,
        patient,
        vouchers,
        sessions: Vec::new(),
        refs: 0,
    }
}

fn apply(w: &mut World, op: &Op) {
    let meta = SessionMetadata::default();
    match *op {
        Op::Redeem(i) => {
            if let Ok(r) = w.engine.redeem_session(&w.vouchers[i].1, w.patient, &meta) {
                w.sessions.push(r.session.id);
            }
        }
        Op::Settle => {
            let _ = w.engine.run_settlement();
        }
        Op::Cancel(i) => {
            if !w.sessions.is_empty() {
                let id = w.sessions[i % w.sessions.len()];
                let _ = w.engine.cancel_session(id, Some("prop"), false);
            }
        }
        Op::Withdraw(cents) => {
            let amount = Decimal::new(i64::from(cents), 2);
            let dest = Destination::Pix { key: "ana@example.com".into() };
            if let Ok(wd) = w.engine.request_withdrawal(w.partner, amount, dest) {
                w.refs += 1;
                if w.engine.dispatch_withdrawal(wd.id, &format!("job-{}", w.refs)).is_ok() {
                    match cents % 3 {
                        0 => {
                            let _ = w.engine.fail_withdrawal(wd.id, "rejected");
                        }
                        1 => {
                            let _ = w.engine.complete_withdrawal(wd.id, &format!("tx-{}", w.refs));
                        }
                        _ => {}
                    }
                }
            }
        }
        Op::Refund(i) => {
            let _ = w.engine.refund_voucher(w.vouchers[i].0);
        }
        Op::Resplit(k) => {
            let platform = Decimal::new(i64::from(k) * 25, 2);
            let split = CommissionSplit::new(platform, dec!(3.5), dec!(2), dec!(94.5) - platform);
            let _ = w.engine.update_commission_split(w.partner, split);
        }
    }
}

fn check(w: &World) -> Result<(), TestCaseError> {
    for (id, _) in &w.vouchers {
        let v = w.engine.get_voucher(*id).expect("voucher");
        prop_assert!(v.sessions_used <= v.sessions_total);
        prop_assert_eq!(v.sessions_used + v.sessions_remaining(), v.sessions_total);
    }

    let p = w.engine.get_partner(w.partner).expect("partner");
    prop_assert!(p.available_balance >= Decimal::ZERO);
    prop_assert!(p.pending_balance >= Decimal::ZERO);
    prop_assert_eq!(p.split.total(), Decimal::ONE_HUNDRED);
    prop_assert!(w.engine.audit_partner(w.partner).is_ok(), "ledger disagrees with aggregates");

    let sessions = w.engine.partner_sessions(w.partner).expect("sessions");
    for s in &sessions {
        if let Some(snapshot) = s.snapshot {
            prop_assert_eq!(snapshot.total(), s.price);
        }
    }
    for (id, _) in &w.vouchers {
        let v = w.engine.get_voucher(*id).expect("voucher");
        let settled: Vec<_> = sessions
            .iter()
            .filter(|s| s.voucher_id == Some(*id) && s.is_settled())
            .collect();
        prop_assert!(settled.len() <= v.sessions_total as usize);
        let booked: Decimal = settled.iter().map(|s| s.price).sum();
        prop_assert!(booked <= v.final_price);
        if settled.len() == v.sessions_total as usize {
            prop_assert_eq!(booked, v.final_price);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn ledger_invariants_hold_under_random_operations(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut w = world();
        for op in &ops {
            apply(&mut w, op);
            check(&w)?;
        }
    }

    #[test]
    fn snapshot_always_sums_to_price(cents in 1i64..1_000_000, k in 0u8..40) {
        let platform = Decimal::new(i64::from(k) * 25, 2);
        let split = CommissionSplit::new(platform, dec!(3.5), dec!(2), dec!(94.5) - platform);
        prop_assert!(split.validate().is_ok());
        let gross = Decimal::new(cents, 2);
        let snap = fisioflow_core::CommissionSnapshot::compute(gross, split);
        prop_assert_eq!(snap.platform_fee + snap.gateway_fee + snap.tax_fee + snap.partner_net, gross);
    }
}
