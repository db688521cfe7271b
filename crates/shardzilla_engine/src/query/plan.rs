// Валидация и переписывание запроса. Без побочных эффектов: вход не трогаем,
// наружу уходит переписанная копия. Ошибка — InvalidQuery с точным путём.

use crate::collect::facet::FacetKind;
use crate::collect::sort::{Direction, SortKeyRef, SortSpec};
use crate::error::{EngineError, Result};
use crate::model::Value;
use crate::query::ast::{Filter, Join, Occur, SearchQuery};
use crate::schema::{Catalog, FieldKind, NamespaceSchema};

pub fn plan(catalog: &Catalog, query: &SearchQuery, max_depth: usize) -> Result<SearchQuery> {
    let mut q = query.clone();
    plan_node(catalog, &mut q, max_depth, 0, "query")?;
    Ok(q)
}

fn plan_node(
    catalog: &Catalog,
    q: &mut SearchQuery,
    max_depth: usize,
    depth: usize,
    path: &str,
) -> Result<()> {
    if depth > max_depth {
        return Err(EngineError::DepthExceeded(max_depth));
    }
    let schema = catalog
        .namespaces
        .get(&q.namespace)
        .ok_or_else(|| {
            EngineError::invalid(
                format!("{path}.namespace"),
                format!("unknown namespace '{}'", q.namespace),
            )
        })?
        .clone();

    // Сначала join: внутренние запросы нужны для валидации reference-фильтров.
    if let Some(join) = &mut q.join {
        for (i, inner) in join.inner_search_queries.iter_mut().enumerate() {
            plan_node(
                catalog,
                inner,
                max_depth,
                depth + 1,
                &format!("{path}.join.inner[{i}]"),
            )?;
        }
        for (i, inner) in join.inner_search_queries.iter().enumerate() {
            schema.foreign_key_to(&inner.namespace).map_err(|e| {
                EngineError::invalid(format!("{path}.join.inner[{i}]"), e.to_string())
            })?;
        }
    }

    validate_keywords(&schema, q, path)?;
    if let Some(f) = &q.filter {
        validate_filter(
            catalog,
            &schema,
            q.join.as_ref(),
            f,
            &format!("{path}.filter"),
        )?;
    }
    validate_sorts(&schema, q, path)?;
    validate_facets(&schema, q, path)?;
    validate_returns(&schema, q, path)?;
    validate_reorderings(&schema, q, path)?;

    // --- переписывания ---

    // 2/3: схлопывание булей и двойное отрицание.
    if let Some(f) = q.filter.take() {
        q.filter = Some(rewrite_filter(f));
    }

    // 1: namespace-равенство прячется в FILTER-клаузу.
    let ns_clause = (
        Occur::Filter,
        Filter::Term {
            field: crate::schema::NAMESPACE_FIELD.to_string(),
            value: Value::Str(q.namespace.clone()),
        },
    );
    let wrapped = match q.filter.take() {
        Some(f) => Filter::Boolean {
            clauses: vec![ns_clause, (Occur::Must, f)],
            min_should_match: 0,
        },
        None => Filter::Boolean {
            clauses: vec![ns_clause],
            min_should_match: 0,
        },
    };
    q.filter = Some(rewrite_filter(wrapped));

    // Пустая сортировка — score по убыванию; хвостовой тай-брейк по docid
    // добавляют коллектор и мердж.
    if q.sort_by.is_empty() {
        q.sort_by.push(SortSpec {
            key: SortKeyRef::Score,
            direction: Direction::Desc,
        });
    }

    // Ключ группировки обязан доехать до брокера — дотягиваем в return_fields.
    if let Some(g) = &q.group_by {
        if !q.return_fields.contains(&g.field) {
            q.return_fields.push(g.field.clone());
        }
    }
    Ok(())
}

fn value_matches(kind: &FieldKind, v: &Value) -> bool {
    matches!(
        (kind, v),
        (FieldKind::Str, Value::Str(_))
            | (FieldKind::I64, Value::I64(_))
            | (FieldKind::F64, Value::F64(_))
            | (FieldKind::F64, Value::I64(_))
            | (FieldKind::Bool, Value::Bool(_))
    )
}

fn validate_keywords(schema: &NamespaceSchema, q: &SearchQuery, path: &str) -> Result<()> {
    let Some(kw) = &q.keywords else {
        return Ok(());
    };
    for (i, g) in kw.groups.iter().enumerate() {
        let gp = format!("{path}.keywords.groups[{i}]");
        if g.fields.is_empty() || g.terms.is_empty() {
            return Err(EngineError::invalid(gp, "empty fields or terms"));
        }
        for f in &g.fields {
            let spec = schema
                .field(f)
                .ok_or_else(|| EngineError::invalid(&gp, format!("unknown field '{f}'")))?;
            if spec.kind != FieldKind::Str {
                return Err(EngineError::invalid(&gp, format!("field '{f}' is not a string field")));
            }
        }
        let group_size = g.fields.len() * g.terms.len();
        if g.min_should_match > group_size {
            return Err(EngineError::invalid(
                &gp,
                format!("min_should_match {} exceeds group size {group_size}", g.min_should_match),
            ));
        }
    }
    for (i, v) in kw.vector_queries.iter().enumerate() {
        let vp = format!("{path}.keywords.vector_queries[{i}]");
        let spec = schema
            .field(&v.field)
            .ok_or_else(|| EngineError::invalid(&vp, format!("unknown field '{}'", v.field)))?;
        match &spec.kind {
            FieldKind::Vector { dim } => {
                if v.target.len() != *dim {
                    return Err(EngineError::invalid(
                        &vp,
                        format!("target dim {} != field dim {dim}", v.target.len()),
                    ));
                }
            }
            _ => return Err(EngineError::invalid(&vp, format!("field '{}' is not a vector", v.field))),
        }
        if v.k == 0 {
            return Err(EngineError::invalid(&vp, "k must be positive"));
        }
    }
    for (i, f) in kw.fuzzy.iter().enumerate() {
        let fp = format!("{path}.keywords.fuzzy[{i}]");
        let spec = schema
            .field(&f.field)
            .ok_or_else(|| EngineError::invalid(&fp, format!("unknown field '{}'", f.field)))?;
        if spec.kind != FieldKind::Str {
            return Err(EngineError::invalid(&fp, "fuzzy works on string fields"));
        }
        if f.term.is_empty() || !(1..=2).contains(&f.max_edits) {
            return Err(EngineError::invalid(&fp, "term empty or max_edits out of 1..=2"));
        }
    }
    Ok(())
}

fn validate_filter(
    catalog: &Catalog,
    schema: &NamespaceSchema,
    join: Option<&Join>,
    f: &Filter,
    path: &str,
) -> Result<()> {
    match f {
        Filter::Term { field, value } => {
            let spec = known_field(schema, field, path)?;
            if !value_matches(&spec.kind, value) {
                return Err(EngineError::invalid(
                    path,
                    format!("value type does not match field '{field}'"),
                ));
            }
            Ok(())
        }
        Filter::TermInSet { field, values } => {
            let spec = known_field(schema, field, path)?;
            if values.is_empty() {
                return Err(EngineError::invalid(path, "empty value set"));
            }
            for v in values {
                if !value_matches(&spec.kind, v) {
                    return Err(EngineError::invalid(
                        path,
                        format!("value type does not match field '{field}'"),
                    ));
                }
            }
            Ok(())
        }
        Filter::PointRange { field, lo, hi } => {
            let spec = known_field(schema, field, path)?;
            if !spec.kind.is_numeric() {
                return Err(EngineError::invalid(path, format!("field '{field}' is not numeric")));
            }
            let lo_n = lo.as_ref().map(|v| v.as_f64());
            let hi_n = hi.as_ref().map(|v| v.as_f64());
            if matches!(lo_n, Some(None)) || matches!(hi_n, Some(None)) {
                return Err(EngineError::invalid(path, "range bounds must be numeric"));
            }
            if lo.is_none() && hi.is_none() {
                return Err(EngineError::invalid(path, "range needs at least one bound"));
            }
            if let (Some(Some(l)), Some(Some(h))) = (lo_n, hi_n) {
                if l > h {
                    return Err(EngineError::invalid(path, "lo greater than hi"));
                }
            }
            Ok(())
        }
        Filter::GeoDistance {
            field,
            lat,
            lon,
            meters,
        } => {
            let spec = known_field(schema, field, path)?;
            if spec.kind != FieldKind::Geo {
                return Err(EngineError::invalid(path, format!("field '{field}' is not geo")));
            }
            let ok = lat.is_finite()
                && lon.is_finite()
                && (-90.0..=90.0).contains(lat)
                && (-180.0..=180.0).contains(lon)
                && meters.is_finite()
                && *meters > 0.0;
            if !ok {
                return Err(EngineError::invalid(path, "bad geo coordinates or radius"));
            }
            Ok(())
        }
        Filter::Vector {
            field,
            target,
            k,
            filter,
        } => {
            let spec = known_field(schema, field, path)?;
            match &spec.kind {
                FieldKind::Vector { dim } if target.len() == *dim => {}
                FieldKind::Vector { dim } => {
                    return Err(EngineError::invalid(
                        path,
                        format!("target dim {} != field dim {dim}", target.len()),
                    ))
                }
                _ => return Err(EngineError::invalid(path, format!("field '{field}' is not a vector"))),
            }
            if *k == 0 {
                return Err(EngineError::invalid(path, "k must be positive"));
            }
            if let Some(inner) = filter {
                validate_filter(catalog, schema, join, inner, &format!("{path}.filter"))?;
            }
            Ok(())
        }
        Filter::Boolean {
            clauses,
            min_should_match,
        } => {
            let should_count = clauses
                .iter()
                .filter(|(o, _)| *o == Occur::Should)
                .count();
            if *min_should_match > should_count {
                return Err(EngineError::invalid(
                    path,
                    format!("min_should_match {min_should_match} exceeds {should_count} should clauses"),
                ));
            }
            for (i, (_, c)) in clauses.iter().enumerate() {
                validate_filter(catalog, schema, join, c, &format!("{path}.clauses[{i}]"))?;
            }
            Ok(())
        }
        Filter::ReferenceFieldInSet {
            field,
            ref_namespace,
            ref_field,
        } => {
            let spec = known_field(schema, field, path)?;
            let inner = join
                .and_then(|j| {
                    j.inner_search_queries
                        .iter()
                        .find(|q| q.namespace == *ref_namespace)
                })
                .ok_or_else(|| {
                    EngineError::invalid(
                        path,
                        format!("reference namespace '{ref_namespace}' is not joined"),
                    )
                })?;
            let ref_schema = catalog.namespaces.get(ref_namespace).ok_or_else(|| {
                EngineError::invalid(path, format!("unknown namespace '{ref_namespace}'"))
            })?;
            if *ref_field == ref_schema.primary_key {
                return Ok(());
            }
            let ref_spec = ref_schema.field(ref_field).ok_or_else(|| {
                EngineError::invalid(
                    path,
                    format!("unknown field '{ref_field}' in '{ref_namespace}'"),
                )
            })?;
            if !inner.return_fields.iter().any(|f| f == ref_field) {
                return Err(EngineError::invalid(
                    path,
                    format!("'{ref_field}' is not hydrated by the inner query"),
                ));
            }
            if ref_spec.kind != spec.kind {
                return Err(EngineError::invalid(
                    path,
                    format!("'{field}' and '{ref_namespace}.{ref_field}' have different types"),
                ));
            }
            Ok(())
        }
    }
}

fn known_field<'a>(
    schema: &'a NamespaceSchema,
    field: &str,
    path: &str,
) -> Result<&'a crate::schema::FieldSpec> {
    if field.starts_with('_') {
        return Err(EngineError::invalid(path, format!("reserved field '{field}'")));
    }
    schema
        .field(field)
        .ok_or_else(|| EngineError::invalid(path, format!("unknown field '{field}'")))
}

fn validate_sorts(schema: &NamespaceSchema, q: &SearchQuery, path: &str) -> Result<()> {
    for (i, s) in q.sort_by.iter().enumerate() {
        let sp = format!("{path}.sort_by[{i}]");
        match &s.key {
            SortKeyRef::Field(name) => {
                let spec = known_field(schema, name, &sp)?;
                if !spec.doc_values {
                    return Err(EngineError::invalid(&sp, format!("field '{name}' has no doc values")));
                }
                if matches!(spec.kind, FieldKind::Geo | FieldKind::Vector { .. }) {
                    return Err(EngineError::invalid(&sp, format!("field '{name}' is not sortable")));
                }
            }
            SortKeyRef::ContextFeature(name) => {
                if !q.context_features.contains_key(name) {
                    return Err(EngineError::invalid(&sp, format!("unknown context feature '{name}'")));
                }
            }
            SortKeyRef::Score | SortKeyRef::DocId => {}
        }
    }
    Ok(())
}

fn validate_facets(schema: &NamespaceSchema, q: &SearchQuery, path: &str) -> Result<()> {
    for (i, f) in q.facets.iter().enumerate() {
        let fp = format!("{path}.facets[{i}]");
        let spec = known_field(schema, &f.field, &fp)?;
        if !spec.doc_values {
            return Err(EngineError::invalid(&fp, format!("field '{}' has no doc values", f.field)));
        }
        match &f.kind {
            FacetKind::TermCount => {
                if matches!(spec.kind, FieldKind::Geo | FieldKind::Vector { .. }) {
                    return Err(EngineError::invalid(&fp, "term counts need term-like values"));
                }
            }
            FacetKind::Histogram { bounds } => {
                if !spec.kind.is_numeric() {
                    return Err(EngineError::invalid(&fp, "histogram needs a numeric field"));
                }
                if bounds.len() < 2
                    || bounds.windows(2).any(|w| w[0] >= w[1])
                    || bounds.iter().any(|b| !b.is_finite())
                {
                    return Err(EngineError::invalid(&fp, "bounds must be ascending and finite"));
                }
            }
        }
    }
    Ok(())
}

fn validate_returns(schema: &NamespaceSchema, q: &SearchQuery, path: &str) -> Result<()> {
    for (i, name) in q.return_fields.iter().enumerate() {
        known_field(schema, name, &format!("{path}.return_fields[{i}]"))?;
    }
    if let Some(g) = &q.group_by {
        let gp = format!("{path}.group_by");
        let spec = known_field(schema, &g.field, &gp)?;
        if !spec.doc_values || matches!(spec.kind, FieldKind::Geo | FieldKind::Vector { .. }) {
            return Err(EngineError::invalid(&gp, format!("field '{}' cannot group", g.field)));
        }
        if g.group_limit == 0 {
            return Err(EngineError::invalid(&gp, "group_limit must be positive"));
        }
    }
    Ok(())
}

fn validate_reorderings(schema: &NamespaceSchema, q: &SearchQuery, path: &str) -> Result<()> {
    use crate::query::ast::Reordering::*;
    for (i, r) in q.reorderings.iter().enumerate() {
        let rp = format!("{path}.reorderings[{i}]");
        match r {
            WeightFeature { feature, .. } => {
                if !q.context_features.contains_key(feature) {
                    return Err(EngineError::invalid(&rp, format!("unknown context feature '{feature}'")));
                }
            }
            BoostField { field, .. } => {
                known_field(schema, field, &rp)?;
                if !q.return_fields.iter().any(|f| f == field) {
                    return Err(EngineError::invalid(&rp, format!("'{field}' is not in return_fields")));
                }
            }
            Decay { field, scale, .. } => {
                let spec = known_field(schema, field, &rp)?;
                if !spec.kind.is_numeric() {
                    return Err(EngineError::invalid(&rp, format!("'{field}' is not numeric")));
                }
                if !q.return_fields.iter().any(|f| f == field) {
                    return Err(EngineError::invalid(&rp, format!("'{field}' is not in return_fields")));
                }
                if *scale <= 0.0 || !scale.is_finite() {
                    return Err(EngineError::invalid(&rp, "scale must be positive"));
                }
            }
        }
    }
    Ok(())
}

/// Переписывания фильтрового дерева:
/// - (MUST|FILTER, bool без should/msm) — расплющивается вверх,
///   FILTER-контекст гасит скоринг внутренних MUST;
/// - MUST_NOT от MUST_NOT — повышается до MUST;
/// - (SHOULD, bool из одной MUST/SHOULD клаузы) — разворачивается.
pub fn rewrite_filter(f: Filter) -> Filter {
    match f {
        Filter::Boolean {
            clauses,
            min_should_match,
        } => {
            let mut out: Vec<(Occur, Filter)> = Vec::with_capacity(clauses.len());
            for (occ, c) in clauses {
                let c = rewrite_filter(c);
                match (occ, c) {
                    (
                        Occur::MustNot,
                        Filter::Boolean {
                            clauses: mut inner,
                            min_should_match: 0,
                        },
                    ) if inner.len() == 1 && inner[0].0 == Occur::MustNot => {
                        let (_, neg) = inner.pop().expect("len checked");
                        out.push((Occur::Must, neg));
                    }
                    (
                        occ @ (Occur::Must | Occur::Filter),
                        Filter::Boolean {
                            clauses: inner,
                            min_should_match: 0,
                        },
                    ) if inner
                        .iter()
                        .all(|(o, _)| matches!(o, Occur::Must | Occur::Filter | Occur::MustNot)) =>
                    {
                        for (io, ic) in inner {
                            let eff = if occ == Occur::Filter && io == Occur::Must {
                                Occur::Filter
                            } else {
                                io
                            };
                            out.push((eff, ic));
                        }
                    }
                    (
                        Occur::Should,
                        Filter::Boolean {
                            clauses: mut inner,
                            min_should_match: 0,
                        },
                    ) if inner.len() == 1
                        && matches!(inner[0].0, Occur::Must | Occur::Should) =>
                    {
                        let (_, single) = inner.pop().expect("len checked");
                        out.push((Occur::Should, single));
                    }
                    (occ, c) => out.push((occ, c)),
                }
            }
            Filter::Boolean {
                clauses: out,
                min_should_match,
            }
        }
        Filter::Vector {
            field,
            target,
            k,
            filter,
        } => Filter::Vector {
            field,
            target,
            k,
            filter: filter.map(|f| Box::new(rewrite_filter(*f))),
        },
        other => other,
    }
}

/// Чистый фильтр: скоринг не нужен, score схлопывается в константу.
pub fn is_pure_filter(q: &SearchQuery) -> bool {
    if let Some(kw) = &q.keywords {
        let group_scores = kw
            .groups
            .iter()
            .any(|g| matches!(g.occur, Occur::Must | Occur::Should));
        if group_scores || !kw.vector_queries.is_empty() || !kw.fuzzy.is_empty() {
            return false;
        }
    }
    !q.filter.as_ref().map_or(false, filter_scores)
}

fn filter_scores(f: &Filter) -> bool {
    match f {
        Filter::Term { .. } | Filter::Vector { .. } => true,
        Filter::Boolean { clauses, .. } => clauses
            .iter()
            .any(|(o, c)| matches!(o, Occur::Must | Occur::Should) && filter_scores(c)),
        _ => false,
    }
}
