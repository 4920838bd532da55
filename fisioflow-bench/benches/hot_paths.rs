//! FisioFlow benchmarks.
//!
//!   redeem_session_in_memory ...... one full redemption transaction
//!   commission_compute ............ split of one session price
//!   provider_rank_premium_8 ....... premium ranking over 8 providers
//!   knowledge_rank_500 ............ KB match and rank over 500 items

use std::hint::black_box;

use chrono::{Duration, Utc};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use fisioflow_core::{
    CommissionSnapshot, CommissionSplit, CoreConfig, IssueVoucher, PatientId, SessionMetadata, VoucherEngine, VoucherType,
};
use fisioflow_llm::selector::{self, Candidate};
use fisioflow_llm::{KnowledgeItem, TaskType, UserTier, knowledge};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn bench_redemption(c: &mut Criterion) {
    let engine = VoucherEngine::in_memory(CoreConfig::default()).expect("engine");
    let split = CommissionSplit::new(dec!(10), dec!(3), dec!(2), dec!(85));
    let partner = engine.create_partner("Bench Studio", split, None).expect("partner").id;
    engine.activate_partner(partner).expect("activate");
    let patient = PatientId::new();
    engine.register_patient(patient, "Bench Patient").expect("patient");

    let issue = IssueVoucher {
        partner_id: partner,
        patient_id: patient,
        voucher_type: VoucherType::Single,
        sessions_total: 1,
        price: dec!(120.00),
        discount: None,
        valid_from: None,
        valid_until: Utc::now() + Duration::days(30),
    };
    let meta = SessionMetadata::default();

    c.bench_function("redeem_session_in_memory", |b| {
        b.iter_batched(
            || {
                let v = engine.issue_voucher(&issue).expect("issue");
                engine.confirm_payment(v.id, &v.id.to_string(), "pix").expect("pay");
                v.code
            },
            |code| black_box(engine.redeem_session(&code, patient, &meta).expect("redeem")),
            BatchSize::SmallInput,
        );
    });
}

fn bench_commission(c: &mut Criterion) {
    let split = CommissionSplit::new(dec!(12.5), dec!(3), dec!(1.99), dec!(82.51));
    c.bench_function("commission_compute", |b| {
        b.iter(|| black_box(CommissionSnapshot::compute(black_box(dec!(137.77)), split)));
    });
}

fn bench_provider_rank(c: &mut Criterion) {
    let specialties = [TaskType::Medical, TaskType::Exercise];
    let none: [TaskType; 0] = [];
    let names: Vec<String> = (0..8).map(|i| format!("provider-{i}")).collect();
    c.bench_function("provider_rank_premium_8", |b| {
        b.iter(|| {
            let candidates = names
                .iter()
                .enumerate()
                .map(|(i, name)| Candidate {
                    name,
                    specialties: if i % 2 == 0 { &specialties[..] } else { &none[..] },
                    current_usage: u32::try_from(i * 7).unwrap_or(0),
                    rate_limit: 60,
                    cost_per_token: Decimal::new(i64::try_from(i + 1).unwrap_or(1), 6),
                    priority: u32::try_from(i % 3).unwrap_or(0),
                    index: i,
                })
                .collect();
            black_box(selector::rank(candidates, TaskType::Medical, UserTier::Premium, 0.8))
        });
    });
}

fn bench_knowledge_rank(c: &mut Criterion) {
    let now = Utc::now();
    let items: Vec<KnowledgeItem> = (0..500u32)
        .map(|i| KnowledgeItem {
            id: Uuid::new_v4(),
            title: format!("Protocol {i}: {}", if i % 5 == 0 { "lumbar stabilisation" } else { "shoulder mobility" }),
            content: "Progress load weekly and reassess pain scores.".into(),
            category: "protocols".into(),
            tags: vec!["rehab".into(), format!("week-{}", i % 12)],
            relevance_score: u8::try_from(i % 101).unwrap_or(100),
            created_at: now,
            updated_at: now,
        })
        .collect();

    c.bench_function("knowledge_rank_500", |b| {
        b.iter_batched(
            || items.clone(),
            |items| black_box(knowledge::rank(items, black_box("lumbar"), 5)),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_redemption,
    bench_commission,
    bench_provider_rank,
    bench_knowledge_rank,
);
criterion_main!(benches);
