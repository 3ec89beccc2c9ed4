use criterion::{criterion_group, criterion_main, Criterion};
use survey_reconcile_core::{
    build_profiles, plan_links, rank_candidates, resolve_bundles, scan_timeline, AnomalyConfig,
    AttributionConfig, BundleKey, CollectorId, DeviceFingerprint, ProjectId, Question,
    QuestionBankContext, Respondent, RespondentId, Response, ResponseId, WeightedAggregator,
};
use time::{Duration, OffsetDateTime};

const COMMODITIES: [&str; 4] = ["cocoa", "coffee", "cashew", "maize"];

fn offset(seconds: usize) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX))
}

fn bench_key(index: usize) -> BundleKey {
    BundleKey::new("farmer", COMMODITIES[index % COMMODITIES.len()], "Ghana")
}

fn mk_question(project_id: ProjectId, index: usize) -> Question {
    let key = bench_key(index);
    Question {
        question_id: survey_reconcile_core::QuestionId::new(),
        project_id,
        text: format!("question {index}"),
        category: Some(key.category),
        commodity: Some(key.commodity),
        country: Some(key.country),
        created_at: offset(index),
        question_bank_id: None,
        conditional: None,
    }
}

fn mk_response(
    project_id: ProjectId,
    respondent_id: RespondentId,
    index: usize,
    collector_id: Option<CollectorId>,
) -> Response {
    let gap = if index % 97 == 0 { 7_200 } else { 12 };
    Response {
        response_id: ResponseId::new(),
        project_id,
        respondent_id,
        sequence: i64::try_from(index).unwrap_or(i64::MAX),
        value: format!("answer-{}", index % 7),
        collected_at: offset(index * gap),
        question_id: None,
        context: QuestionBankContext::default(),
        collector_id,
        device: Some(DeviceFingerprint {
            attributes: [("model".to_string(), format!("device-{}", index % 5))].into(),
        }),
    }
}

fn mk_respondent(project_id: ProjectId, index: usize) -> Respondent {
    let key = bench_key(index);
    Respondent {
        respondent_id: RespondentId::new(),
        project_id,
        external_id: format!("bench-{index}"),
        category: Some(key.category),
        commodity: Some(key.commodity),
        country: Some(key.country),
        collector_id: None,
        created_by: None,
    }
}

fn bench_bundles_and_linking(c: &mut Criterion) {
    let project_id = ProjectId::new();
    let questions = (0..1_000).map(|index| mk_question(project_id, index)).collect::<Vec<_>>();
    let respondent_id = RespondentId::new();
    let orphans = (0..200)
        .map(|index| mk_response(project_id, respondent_id, index, None))
        .collect::<Vec<_>>();

    c.bench_function("resolve_bundles_1000_questions", |b| {
        b.iter(|| resolve_bundles(&questions));
    });

    let resolution = resolve_bundles(&questions);
    let bundle = match resolution.bundle(&bench_key(0)) {
        Ok(bundle) => bundle.clone(),
        Err(err) => panic!("benchmark bundle should resolve: {err}"),
    };
    c.bench_function("plan_links_200_orphans", |b| {
        b.iter(|| {
            if let Err(err) = plan_links(respondent_id, &bundle, &orphans) {
                panic!("benchmark link plan failed: {err}");
            }
        });
    });
}

fn bench_anomaly_scan(c: &mut Criterion) {
    let project_id = ProjectId::new();
    let respondent_id = RespondentId::new();
    let timeline = (0..1_000)
        .map(|index| mk_response(project_id, respondent_id, index, None))
        .collect::<Vec<_>>();
    let config = AnomalyConfig::default();

    c.bench_function("scan_timeline_1000_responses", |b| {
        b.iter(|| scan_timeline(respondent_id, &timeline, &config));
    });
}

fn bench_attribution(c: &mut Criterion) {
    let project_id = ProjectId::new();
    let respondents = (0..200).map(|index| mk_respondent(project_id, index)).collect::<Vec<_>>();
    let collectors = (0..50).map(|_| CollectorId::new()).collect::<Vec<_>>();
    let responses = respondents
        .iter()
        .enumerate()
        .flat_map(|(index, respondent)| {
            let collector_id = (index % 4 != 0).then(|| collectors[index % collectors.len()]);
            (0..20).map(move |step| {
                mk_response(project_id, respondent.respondent_id, index * 20 + step, collector_id)
            })
        })
        .collect::<Vec<_>>();
    let config = AttributionConfig::default();
    let aggregator = match WeightedAggregator::from_config(&config) {
        Ok(aggregator) => aggregator,
        Err(err) => panic!("benchmark weights should be valid: {err}"),
    };

    c.bench_function("rank_candidates_50_historical_50_collectors", |b| {
        b.iter(|| {
            let pool = build_profiles(&respondents, &responses);
            for profile in &pool.historical {
                let _ = rank_candidates(profile, &pool.collectors, &aggregator, &config);
            }
        });
    });
}

criterion_group!(reconcile_benches, bench_bundles_and_linking, bench_anomaly_scan, bench_attribution);
criterion_main!(reconcile_benches);
