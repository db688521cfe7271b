// L2-переранжирование после merge, но до offset/limit.

mod helpers;

use helpers::*;

use shardzilla_engine::model::Document;
use shardzilla_engine::query::ast::{Reordering, SearchQuery};
use shardzilla_engine::wire::BrokerRequest;
use shardzilla_engine::Value;

fn store_doc(pk: &str, global_doc: u64, score: f32, store: &str) -> Document {
    let mut d = scored_doc(pk, global_doc, score);
    d.fields = vec![("store_id".into(), Value::Str(store.into()))];
    d
}

#[tokio::test]
async fn boost_field_reorders_the_page() {
    let cat = catalog(2);
    let broker = broker_of(
        &cat,
        vec![
            ScriptedClient::ok(
                0,
                payload_of(vec![
                    store_doc("X", 0, 5.0, "s2"),
                    store_doc("Y", 1, 4.0, "s1"),
                ]),
            ),
            ScriptedClient::ok(1, payload_of(vec![store_doc("Z", 0, 3.0, "s2")])),
        ],
    );

    let mut q = SearchQuery::all("item", 10);
    q.return_fields = vec!["store_id".into()];
    q.reorderings = vec![Reordering::BoostField {
        field: "store_id".into(),
        value: Value::Str("s1".into()),
        factor: 10.0,
    }];
    let resp = broker
        .handle(BrokerRequest {
            namespace: "item".into(),
            query: q,
            route: None,
            include_metrics: false,
            format: Default::default(),
            deadline_ms: None,
        })
        .await
        .unwrap();

    let pks: Vec<&str> = resp.documents.iter().map(|d| d.primary_key.as_str()).collect();
    assert_eq!(pks, vec!["Y", "X", "Z"], "бустнутый Y обгоняет X");
    assert!((resp.documents[0].score - 40.0).abs() < 1e-6);
}

#[tokio::test]
async fn group_collapse_spans_shards_after_merge() {
    // Шардовый collapse не видит соседей — брокер повторяет его после merge.
    let cat = catalog(2);
    let broker = broker_of(
        &cat,
        vec![
            ScriptedClient::ok(0, payload_of(vec![store_doc("X", 0, 5.0, "s1")])),
            ScriptedClient::ok(1, payload_of(vec![store_doc("Y", 0, 4.0, "s1")])),
        ],
    );

    let mut q = SearchQuery::all("item", 10);
    q.group_by = Some(shardzilla_engine::query::ast::GroupBy {
        field: "store_id".into(),
        group_limit: 1,
    });
    let resp = broker
        .handle(BrokerRequest {
            namespace: "item".into(),
            query: q,
            route: None,
            include_metrics: false,
            format: Default::default(),
            deadline_ms: None,
        })
        .await
        .unwrap();
    let pks: Vec<&str> = resp.documents.iter().map(|d| d.primary_key.as_str()).collect();
    assert_eq!(pks, vec!["X"], "обе копии группы s1 схлопнулись в одну");
}

#[tokio::test]
async fn weight_feature_uses_request_context() {
    let cat = catalog(2);
    let broker = broker_of(
        &cat,
        vec![
            ScriptedClient::ok(0, payload_of(vec![store_doc("X", 0, 5.0, "s2")])),
            ScriptedClient::ok(1, payload_of(vec![])),
        ],
    );

    let mut q = SearchQuery::all("item", 10);
    q.context_features = [("session_boost".to_string(), 2.0)].into_iter().collect();
    q.reorderings = vec![Reordering::WeightFeature {
        feature: "session_boost".into(),
        weight: 3.0,
    }];
    let resp = broker
        .handle(BrokerRequest {
            namespace: "item".into(),
            query: q,
            route: None,
            include_metrics: false,
            format: Default::default(),
            deadline_ms: None,
        })
        .await
        .unwrap();
    assert!((resp.documents[0].score - 11.0).abs() < 1e-6, "5 + 3*2");
}

#[tokio::test]
async fn rules_compose_in_declaration_order() {
    let cat = catalog(1);
    let broker = broker_of(
        &cat,
        vec![ScriptedClient::ok(0, payload_of(vec![store_doc("X", 0, 2.0, "s1")]))],
    );

    let mut q = SearchQuery::all("item", 10);
    q.return_fields = vec!["store_id".into()];
    q.context_features = [("bias".to_string(), 1.0)].into_iter().collect();
    q.reorderings = vec![
        Reordering::WeightFeature { feature: "bias".into(), weight: 2.0 },
        Reordering::BoostField {
            field: "store_id".into(),
            value: Value::Str("s1".into()),
            factor: 10.0,
        },
    ];
    let resp = broker
        .handle(BrokerRequest {
            namespace: "item".into(),
            query: q,
            route: None,
            include_metrics: false,
            format: Default::default(),
            deadline_ms: None,
        })
        .await
        .unwrap();
    // (2 + 2) * 10, а не 2*10 + 2
    assert!((resp.documents[0].score - 40.0).abs() < 1e-6);
}
