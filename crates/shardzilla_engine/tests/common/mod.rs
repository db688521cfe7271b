// Общие фикстуры: каталог item/store и сборка JSON-сегментов во временных
// каталогах. Размещение документов по шардам делают сами тесты.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use shardzilla_engine::index::{segjson, Snapshot};
use shardzilla_engine::schema::{
    Catalog, Container, FieldKind, FieldSpec, ForeignKeySpec, NamespaceSchema, ShardingSpec,
};
use shardzilla_engine::{EngineLimits, QueryEngine, Value};

pub fn catalog() -> Catalog {
    let store = NamespaceSchema {
        name: "store".into(),
        primary_key: "id".into(),
        fields: vec![
            field("id", FieldKind::Str, true),
            field("rating", FieldKind::I64, true),
            field("menu_id", FieldKind::I64, true),
            field("city", FieldKind::Str, true),
        ],
        foreign_keys: vec![],
    };
    let item = NamespaceSchema {
        name: "item".into(),
        primary_key: "id".into(),
        fields: vec![
            field("id", FieldKind::Str, true),
            field("name", FieldKind::Str, false),
            field("desc", FieldKind::Str, false),
            field("popularity", FieldKind::F64, true),
            field("price", FieldKind::I64, true),
            field("store_id", FieldKind::Str, true),
            field("menu_id", FieldKind::I64, true),
            FieldSpec {
                name: "tags".into(),
                kind: FieldKind::Str,
                container: Container::List,
                doc_values: true,
                stored: true,
            },
            field("location", FieldKind::Geo, true),
            field("embedding", FieldKind::Vector { dim: 2 }, true),
        ],
        foreign_keys: vec![ForeignKeySpec {
            field: "store_id".into(),
            container: Container::Scalar,
            children: vec!["store".into()],
            required: false,
        }],
    };
    let mut namespaces = BTreeMap::new();
    namespaces.insert("store".into(), store);
    namespaces.insert("item".into(), item);
    Catalog {
        namespaces,
        sharding: ShardingSpec {
            shards: 2,
            micro_shards: 8,
            route_field: "id".into(),
        },
    }
}

pub fn field(name: &str, kind: FieldKind, doc_values: bool) -> FieldSpec {
    FieldSpec {
        name: name.into(),
        kind,
        container: Container::Scalar,
        doc_values,
        stored: true,
    }
}

pub fn s(v: &str) -> Value {
    Value::Str(v.into())
}

pub fn i(v: i64) -> Value {
    Value::I64(v)
}

pub fn f(v: f64) -> Value {
    Value::F64(v)
}

pub fn doc(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Пишет сегмент `<shard_dir>/<ns>/<seg>` по схеме из каталога.
pub fn write_segment(
    shard_dir: &Path,
    cat: &Catalog,
    ns: &str,
    seg: &str,
    docs: &[BTreeMap<String, Value>],
) {
    let schema = cat.namespaces.get(ns).expect("namespace in fixture catalog");
    segjson::write_segment(schema, docs, &shard_dir.join(ns).join(seg)).expect("write segment");
}

pub fn engine(shard_dir: &Path, cat: &Catalog) -> QueryEngine {
    engine_with_limits(shard_dir, cat, EngineLimits::default())
}

pub fn engine_with_limits(shard_dir: &Path, cat: &Catalog, limits: EngineLimits) -> QueryEngine {
    let snapshot = Snapshot::open(shard_dir, cat).expect("open snapshot");
    QueryEngine::new(Arc::new(cat.clone()), Arc::new(snapshot), limits)
}

/// Типовой магазинный корпус: три стора, три айтема, i1→s1, i2→s2, i3→s3.
pub fn seed_joined_shard(shard_dir: &Path, cat: &Catalog) {
    write_segment(
        shard_dir,
        cat,
        "store",
        "seg-000",
        &[
            doc(&[("id", s("s1")), ("rating", i(5)), ("menu_id", i(7)), ("city", s("riga"))]),
            doc(&[("id", s("s2")), ("rating", i(3)), ("menu_id", i(9)), ("city", s("riga"))]),
            doc(&[("id", s("s3")), ("rating", i(4)), ("menu_id", i(12)), ("city", s("tartu"))]),
        ],
    );
    write_segment(
        shard_dir,
        cat,
        "item",
        "seg-000",
        &[
            doc(&[
                ("id", s("i1")),
                ("name", s("latte")),
                ("desc", s("smooth latte with oat milk")),
                ("popularity", f(10.0)),
                ("price", i(4)),
                ("store_id", s("s1")),
                ("menu_id", i(7)),
            ]),
            doc(&[
                ("id", s("i2")),
                ("name", s("espresso")),
                ("desc", s("strong espresso shot")),
                ("popularity", f(9.0)),
                ("price", i(3)),
                ("store_id", s("s2")),
                ("menu_id", i(9)),
            ]),
            doc(&[
                ("id", s("i3")),
                ("name", s("flat white")),
                ("desc", s("velvet flat white")),
                ("popularity", f(8.0)),
                ("price", i(5)),
                ("store_id", s("s3")),
                ("menu_id", i(12)),
            ]),
        ],
    );
}
