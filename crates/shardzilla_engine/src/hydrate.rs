// Гидратация: наполнение return_fields у отобранных кандидатов.
// Документы группируются по сегменту и читаются по возрастанию leaf_doc.

use crate::index::IndexReader;
use crate::model::{Document, Value};
use crate::schema::{Container, FieldKind, NamespaceSchema};

/// Пишет значения в request-порядке; отсутствующее поле — не ошибка.
/// Сбой чтения stored-полей роняет только этот документ.
pub fn hydrate(
    index: &dyn IndexReader,
    schema: &NamespaceSchema,
    mut docs: Vec<Document>,
    return_fields: &[String],
) -> (Vec<Document>, u64) {
    if return_fields.is_empty() || docs.is_empty() {
        return (docs, 0);
    }

    let stored_fields: Vec<String> = return_fields
        .iter()
        .filter(|name| {
            schema
                .field(name)
                .map_or(false, |spec| !spec.doc_values && spec.stored)
        })
        .cloned()
        .collect();

    let mut order: Vec<usize> = (0..docs.len()).collect();
    order.sort_by_key(|&i| (docs[i].leaf_ord, docs[i].leaf_doc));

    let leaves = index.leaves();
    let mut failed = vec![false; docs.len()];
    let mut dropped = 0u64;

    for &i in &order {
        let doc = &mut docs[i];
        let Some(seg) = leaves.get(doc.leaf_ord as usize) else {
            failed[i] = true;
            dropped += 1;
            continue;
        };
        let stored = match seg.stored(doc.leaf_doc, &stored_fields) {
            Ok(s) => s,
            Err(_) => {
                failed[i] = true;
                dropped += 1;
                continue;
            }
        };
        let mut fields: Vec<(String, Value)> = Vec::with_capacity(return_fields.len());
        for name in return_fields {
            let Some(spec) = schema.field(name) else {
                continue;
            };
            let value = if spec.doc_values {
                doc_value(seg.as_ref(), spec, doc.leaf_doc)
            } else {
                stored
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
            };
            if let Some(v) = value {
                fields.push((name.clone(), v));
            }
        }
        doc.fields = fields;
    }

    let docs = docs
        .into_iter()
        .zip(failed)
        .filter_map(|(d, bad)| if bad { None } else { Some(d) })
        .collect();
    (docs, dropped)
}

fn doc_value(
    seg: &dyn crate::index::SegmentReader,
    spec: &crate::schema::FieldSpec,
    doc: u32,
) -> Option<Value> {
    match &spec.kind {
        FieldKind::I64 => seg.numeric(&spec.name, doc).map(|v| Value::I64(v as i64)),
        FieldKind::F64 => seg.numeric(&spec.name, doc).map(Value::F64),
        FieldKind::Bool => seg.numeric(&spec.name, doc).map(|v| Value::Bool(v != 0.0)),
        FieldKind::Str => {
            let col = seg.sorted_set(&spec.name)?;
            match spec.container {
                Container::Scalar => col.first_value(doc).map(|s| Value::Str(s.to_string())),
                Container::List => {
                    let vals: Vec<Value> = col
                        .ords(doc)
                        .iter()
                        .filter_map(|&o| col.value_of(o))
                        .map(|s| Value::Str(s.to_string()))
                        .collect();
                    if vals.is_empty() {
                        None
                    } else {
                        Some(Value::List(vals))
                    }
                }
            }
        }
        // Geo и векторы в doc values ядру при гидратации не нужны — stored покрывает.
        FieldKind::Geo | FieldKind::Vector { .. } => None,
    }
}
