mod common;

use std::collections::BTreeMap;

use common::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use shardzilla_engine::collect::facet::{FacetKind, FacetSpec};
use shardzilla_engine::collect::sort::{Direction, SortKeyRef, SortSpec};
use shardzilla_engine::query::ast::{
    Filter, GroupBy, Join, KeywordGroup, Keywords, Occur, SearchQuery, VectorQuery,
};
use shardzilla_engine::schema::{
    Catalog, Container, FieldKind, ForeignKeySpec, NamespaceSchema,
};
use shardzilla_engine::{EngineError, EngineLimits, Value};

fn sort_by_id() -> Vec<SortSpec> {
    vec![SortSpec {
        key: SortKeyRef::Field("id".into()),
        direction: Direction::Asc,
    }]
}

fn pks(hits: &shardzilla_engine::ShardHits) -> Vec<&str> {
    hits.docs.iter().map(|d| d.primary_key.as_str()).collect()
}

fn store_rating_at_least(min: i64) -> SearchQuery {
    let mut q = SearchQuery::all("store", 10);
    q.filter = Some(Filter::PointRange {
        field: "rating".into(),
        lo: Some(Value::I64(min)),
        hi: None,
    });
    q.return_fields = vec!["id".into(), "rating".into(), "menu_id".into()];
    q.sort_by = sort_by_id();
    q
}

#[tokio::test]
async fn two_runs_return_identical_results() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 10);
    q.keywords = Some(Keywords {
        groups: vec![KeywordGroup {
            fields: vec!["desc".into()],
            terms: vec!["latte".into(), "espresso".into()],
            occur: Occur::Should,
            min_should_match: 0,
        }],
        ..Default::default()
    });

    let a = engine.search(&q, CancellationToken::new()).await.unwrap();
    let b = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&a), pks(&b), "одинаковый снапшот — одинаковый порядок");
    assert_eq!(a.docs.len(), 2);
}

#[tokio::test]
async fn must_and_filter_agree_on_membership() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    let term = Filter::Term {
        field: "store_id".into(),
        value: s("s1"),
    };
    let mut must = SearchQuery::all("item", 10);
    must.filter = Some(Filter::Boolean {
        clauses: vec![(Occur::Must, term.clone())],
        min_should_match: 0,
    });
    let mut filt = SearchQuery::all("item", 10);
    filt.filter = Some(Filter::Boolean {
        clauses: vec![(Occur::Filter, term)],
        min_should_match: 0,
    });

    let rm = engine.search(&must, CancellationToken::new()).await.unwrap();
    let rf = engine.search(&filt, CancellationToken::new()).await.unwrap();

    let mut m: Vec<_> = pks(&rm);
    let mut f: Vec<_> = pks(&rf);
    m.sort();
    f.sort();
    assert_eq!(m, f, "FILTER vs MUST не меняет состав");
    assert!(rf.docs.iter().all(|d| d.score == 0.0), "чистый фильтр не скорит");
    // score-константа → тай-брейк по docid asc
    let gids: Vec<u64> = rf.docs.iter().map(|d| d.global_doc).collect();
    let mut sorted = gids.clone();
    sorted.sort_unstable();
    assert_eq!(gids, sorted);
}

#[tokio::test]
async fn sorts_by_field_with_missing_last() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    write_segment(
        tmp.path(),
        &cat,
        "item",
        "seg-000",
        &[
            doc(&[("id", s("a")), ("price", i(9))]),
            doc(&[("id", s("b")), ("price", i(2))]),
            doc(&[("id", s("c"))]), // price отсутствует
        ],
    );
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 10);
    q.sort_by = vec![SortSpec {
        key: SortKeyRef::Field("price".into()),
        direction: Direction::Desc,
    }];
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&hits), vec!["a", "b", "c"], "missing уходит в хвост при desc");

    let mut q = SearchQuery::all("item", 10);
    q.sort_by = vec![SortSpec {
        key: SortKeyRef::Field("price".into()),
        direction: Direction::Asc,
    }];
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&hits), vec!["b", "a", "c"], "missing в хвосте и при asc");
}

#[tokio::test]
async fn collector_caps_at_limit_plus_offset() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 1);
    q.offset = 1;
    q.sort_by = sort_by_id();
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    // searcher отдаёт limit+offset, страницу режет брокер
    assert_eq!(pks(&hits), vec!["i1", "i2"]);
    assert_eq!(hits.total_matched, 3);
}

#[tokio::test]
async fn join_attaches_matching_children() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 10);
    q.sort_by = sort_by_id();
    q.return_fields = vec!["id".into()];
    q.join = Some(Join {
        inner_search_queries: vec![store_rating_at_least(4)],
    });

    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&hits), vec!["i1", "i3"], "i2 смотрит на s2 с рейтингом 3");

    let children: Vec<&str> = hits
        .docs
        .iter()
        .flat_map(|d| d.children.iter())
        .flat_map(|b| b.docs.iter())
        .map(|c| c.primary_key.as_str())
        .collect();
    assert_eq!(children, vec!["s1", "s3"]);
    assert!(hits.docs[0].children[0].namespace == "store");
    // у ребёнка приезжают гидратированные поля inner-запроса
    assert!(hits.docs[0].children[0].docs[0].field("rating").is_some());
    assert_eq!(hits.per_namespace.get("item"), Some(&2));
    assert_eq!(hits.per_namespace.get("store"), Some(&2));
}

#[tokio::test]
async fn reference_field_materializes_as_term_set() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    // inner вернёт menu_id ∈ {7, 12}; наружу — TermInSet(menu_id, {7,12})
    let mut q = SearchQuery::all("item", 10);
    q.sort_by = sort_by_id();
    q.join = Some(Join {
        inner_search_queries: vec![store_rating_at_least(4)],
    });
    q.filter = Some(Filter::ReferenceFieldInSet {
        field: "menu_id".into(),
        ref_namespace: "store".into(),
        ref_field: "menu_id".into(),
    });

    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&hits), vec!["i1", "i3"]);
}

#[tokio::test]
async fn join_inner_cap_fails_query() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine_with_limits(
        tmp.path(),
        &cat,
        EngineLimits {
            max_join_inner: 1,
            ..EngineLimits::default()
        },
    );

    let mut q = SearchQuery::all("item", 10);
    q.join = Some(Join {
        inner_search_queries: vec![store_rating_at_least(1)],
    });
    match engine.search(&q, CancellationToken::new()).await {
        Err(EngineError::JoinTooLarge { got, cap }) => {
            assert!(got > cap);
        }
        other => panic!("expected JoinTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn inner_limit_is_a_hard_truncation() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    // inner limit=1 и сортировка по id: останется только s1 → выживет только i1
    let mut inner = store_rating_at_least(1);
    inner.limit = 1;
    let mut q = SearchQuery::all("item", 10);
    q.sort_by = sort_by_id();
    q.join = Some(Join {
        inner_search_queries: vec![inner],
    });
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&hits), vec!["i1"]);
}

#[tokio::test]
async fn inner_offset_does_not_widen_join_cap() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    // Кап inner-результата — ровно limit; offset в него не входит,
    // иначе в FK-фильтр и в детей утекут лишние нижние строки.
    let mut inner = store_rating_at_least(1);
    inner.limit = 1;
    inner.offset = 2;
    let mut q = SearchQuery::all("item", 10);
    q.sort_by = sort_by_id();
    q.join = Some(Join {
        inner_search_queries: vec![inner],
    });
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&hits), vec!["i1"], "в проекцию попал только top-1 стор");
    let children: Vec<&str> = hits
        .docs
        .iter()
        .flat_map(|d| d.children.iter())
        .flat_map(|b| b.docs.iter())
        .map(|c| c.primary_key.as_str())
        .collect();
    assert_eq!(children, vec!["s1"]);
}

#[tokio::test]
async fn facet_counts_cover_all_matches_not_top_k() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("store", 1); // top-1, но фасеты по всем трём
    q.facets = vec![FacetSpec {
        field: "city".into(),
        kind: FacetKind::TermCount,
    }];
    q.sort_by = sort_by_id();
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(hits.docs.len(), 1);
    assert!(!hits.facets_approximate);
    let city = &hits.facets[0];
    assert_eq!(city.entries[0].key, "riga");
    assert_eq!(city.entries[0].count, 2);
    assert_eq!(city.entries[1].key, "tartu");
    assert_eq!(city.entries[1].count, 1);
}

#[tokio::test]
async fn facet_threshold_marks_counts_approximate() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("store", 10);
    q.facets = vec![FacetSpec {
        field: "city".into(),
        kind: FacetKind::TermCount,
    }];
    let hits = engine
        .search_with_threshold(&q, CancellationToken::new(), 1)
        .await
        .unwrap();
    assert!(hits.facets_approximate, "после порога счётчики — нижняя оценка");
    assert_eq!(hits.total_matched, 3, "total остаётся точным");
}

#[tokio::test]
async fn histogram_buckets_are_half_open() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 10);
    q.facets = vec![FacetSpec {
        field: "price".into(),
        kind: FacetKind::Histogram {
            bounds: vec![0.0, 4.0, 10.0],
        },
    }];
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    let hist = &hits.facets[0];
    // price 3 → [0,4); price 4 и 5 → [4,10)
    let get = |k: &str| hist.entries.iter().find(|e| e.key == k).map(|e| e.count);
    assert_eq!(get("0..4"), Some(1));
    assert_eq!(get("4..10"), Some(2));
}

#[tokio::test]
async fn vector_query_ranks_by_similarity() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    write_segment(
        tmp.path(),
        &cat,
        "item",
        "seg-000",
        &[
            doc(&[("id", s("a")), ("embedding", Value::Vector(vec![1.0, 0.0]))]),
            doc(&[("id", s("b")), ("embedding", Value::Vector(vec![0.0, 1.0]))]),
            doc(&[("id", s("c")), ("embedding", Value::Vector(vec![0.7, 0.7]))]),
        ],
    );
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 10);
    q.keywords = Some(Keywords {
        vector_queries: vec![VectorQuery {
            field: "embedding".into(),
            target: vec![1.0, 0.0],
            k: 2,
            weight: 1.0,
        }],
        ..Default::default()
    });
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&hits), vec!["a", "c"], "top-k по косинусу, b за бортом");
}

#[tokio::test]
async fn geo_distance_filters_by_radius() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    write_segment(
        tmp.path(),
        &cat,
        "item",
        "seg-000",
        &[
            doc(&[("id", s("near")), ("location", Value::Geo { lat: 56.95, lon: 24.1 })]),
            doc(&[("id", s("far")), ("location", Value::Geo { lat: 59.43, lon: 24.75 })]),
        ],
    );
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 10);
    q.filter = Some(Filter::GeoDistance {
        field: "location".into(),
        lat: 56.946,
        lon: 24.105,
        meters: 5_000.0,
    });
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&hits), vec!["near"]);
}

#[tokio::test]
async fn fuzzy_expands_within_edit_distance() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 10);
    q.keywords = Some(Keywords {
        fuzzy: vec![shardzilla_engine::query::ast::FuzzyQuery {
            field: "desc".into(),
            term: "latta".into(), // 1 правка до "latte"
            max_edits: 1,
        }],
        ..Default::default()
    });
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&hits), vec!["i1"]);
}

#[tokio::test]
async fn group_by_collapses_per_group() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    write_segment(
        tmp.path(),
        &cat,
        "item",
        "seg-000",
        &[
            doc(&[("id", s("a1")), ("store_id", s("s1")), ("price", i(1))]),
            doc(&[("id", s("a2")), ("store_id", s("s1")), ("price", i(2))]),
            doc(&[("id", s("b1")), ("store_id", s("s2")), ("price", i(3))]),
        ],
    );
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 10);
    q.sort_by = vec![SortSpec {
        key: SortKeyRef::Field("price".into()),
        direction: Direction::Asc,
    }];
    q.group_by = Some(GroupBy {
        field: "store_id".into(),
        group_limit: 1,
    });
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    assert_eq!(pks(&hits), vec!["a1", "b1"], "по одному на магазин");
}

#[tokio::test]
async fn child_attachment_follows_column_order() {
    // Отдельный каталог: заказ со списочным FK на позиции.
    let mut namespaces = BTreeMap::new();
    namespaces.insert(
        "line".into(),
        NamespaceSchema {
            name: "line".into(),
            primary_key: "id".into(),
            fields: vec![field("id", FieldKind::Str, true)],
            foreign_keys: vec![],
        },
    );
    namespaces.insert(
        "order".into(),
        NamespaceSchema {
            name: "order".into(),
            primary_key: "id".into(),
            fields: vec![
                field("id", FieldKind::Str, true),
                shardzilla_engine::schema::FieldSpec {
                    name: "line_ids".into(),
                    kind: FieldKind::Str,
                    container: Container::List,
                    doc_values: true,
                    stored: true,
                },
            ],
            foreign_keys: vec![ForeignKeySpec {
                field: "line_ids".into(),
                container: Container::List,
                children: vec!["line".into()],
                required: true,
            }],
        },
    );
    let cat = Catalog {
        namespaces,
        sharding: catalog().sharding,
    };

    let tmp = TempDir::new().unwrap();
    write_segment(
        tmp.path(),
        &cat,
        "line",
        "seg-000",
        &[
            doc(&[("id", s("l1"))]),
            doc(&[("id", s("l2"))]),
            doc(&[("id", s("l3"))]),
        ],
    );
    write_segment(
        tmp.path(),
        &cat,
        "order",
        "seg-000",
        &[doc(&[
            ("id", s("o1")),
            ("line_ids", Value::List(vec![s("l3"), s("l1")])),
        ])],
    );
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("order", 10);
    q.join = Some(Join {
        inner_search_queries: vec![SearchQuery::all("line", 10)],
    });
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    let attached: Vec<&str> = hits.docs[0].children[0]
        .docs
        .iter()
        .map(|d| d.primary_key.as_str())
        .collect();
    // sorted-set колонка хранит ординалы по значению — порядок детерминирован
    assert_eq!(attached, vec!["l1", "l3"]);
}

#[tokio::test]
async fn hydration_skips_missing_fields() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 10);
    q.sort_by = sort_by_id();
    q.return_fields = vec!["name".into(), "tags".into(), "price".into()];
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    let first = &hits.docs[0];
    assert_eq!(first.field("name"), Some(&s("latte")));
    assert_eq!(first.field("price"), Some(&i(4)));
    assert!(first.field("tags").is_none(), "отсутствие — не ошибка");
}

#[tokio::test]
async fn cancelled_token_aborts_search() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    seed_joined_shard(tmp.path(), &cat);
    let engine = engine(tmp.path(), &cat);

    let ct = CancellationToken::new();
    ct.cancel();
    match engine.search(&SearchQuery::all("item", 10), ct).await {
        Err(EngineError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_namespace_is_index_unavailable_at_execution() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    // каталог знает item, но на диске namespace не выкладывали
    write_segment(tmp.path(), &cat, "store", "seg-000", &[doc(&[("id", s("s1")), ("rating", i(5))])]);
    let engine = engine(tmp.path(), &cat);

    match engine
        .search(&SearchQuery::all("item", 5), CancellationToken::new())
        .await
    {
        Err(EngineError::IndexUnavailable(_)) => {}
        other => panic!("expected IndexUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn multi_segment_order_is_deterministic() {
    let tmp = TempDir::new().unwrap();
    let cat = catalog();
    write_segment(
        tmp.path(),
        &cat,
        "item",
        "seg-000",
        &[doc(&[("id", s("a")), ("price", i(5))]), doc(&[("id", s("b")), ("price", i(5))])],
    );
    write_segment(
        tmp.path(),
        &cat,
        "item",
        "seg-001",
        &[doc(&[("id", s("c")), ("price", i(5))])],
    );
    let engine = engine(tmp.path(), &cat);

    let mut q = SearchQuery::all("item", 10);
    q.sort_by = vec![SortSpec {
        key: SortKeyRef::Field("price".into()),
        direction: Direction::Desc,
    }];
    let hits = engine.search(&q, CancellationToken::new()).await.unwrap();
    // равный ключ → globalDocId по возрастанию (ординалы сегментов стабильны)
    assert_eq!(pks(&hits), vec!["a", "b", "c"]);
    let gids: Vec<u64> = hits.docs.iter().map(|d| d.global_doc).collect();
    assert_eq!(gids, vec![0, 1, 2]);
}
