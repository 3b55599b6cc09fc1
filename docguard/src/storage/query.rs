// Filter matching, update-operator application, sorting and projection for
// the embedded backend.

use super::{StorageError, StorageResult};
use bson::{Bson, Document};
use regex::RegexBuilder;
use std::cmp::Ordering;

/// Does `doc` satisfy `filter`? An empty filter matches everything.
pub(crate) fn matches(doc: &Document, filter: &Document) -> StorageResult<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in sub_filters(key, condition)? {
                    if !matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in sub_filters(key, condition)? {
                    if matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for sub in sub_filters(key, condition)? {
                    if matches(doc, sub)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(StorageError::UnsupportedOperator(op.to_string()))
            }
            path => field_matches(lookup(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters<'a>(op: &str, condition: &'a Bson) -> StorageResult<Vec<&'a Document>> {
    let Bson::Array(items) = condition else {
        return Err(StorageError::InvalidQuery(format!("{op} requires an array")));
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Document(d) => Ok(d),
            _ => Err(StorageError::InvalidQuery(format!(
                "{op} entries must be documents"
            ))),
        })
        .collect()
}

fn is_operator_doc(value: &Bson) -> Option<&Document> {
    match value {
        Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')) => Some(d),
        _ => None,
    }
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> StorageResult<bool> {
    let Some(ops) = is_operator_doc(condition) else {
        return Ok(equals_or_contains(value, condition));
    };

    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_or_contains(value, arg),
            "$ne" => !equals_or_contains(value, arg),
            "$gt" => compares(value, arg, |o| o == Ordering::Greater),
            "$gte" => compares(value, arg, |o| o != Ordering::Less),
            "$lt" => compares(value, arg, |o| o == Ordering::Less),
            "$lte" => compares(value, arg, |o| o != Ordering::Greater),
            "$in" => in_list(op, value, arg)?,
            "$nin" => !in_list(op, value, arg)?,
            "$exists" => value.is_some() == truthy(arg),
            "$regex" => regex_matches(value, arg, ops.get_str("$options").unwrap_or(""))?,
            "$options" => true,
            other => return Err(StorageError::UnsupportedOperator(other.to_string())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn equals_or_contains(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(v) if values_equal(v, expected) => true,
        Some(Bson::Array(items)) => items.iter().any(|item| values_equal(item, expected)),
        Some(_) => false,
    }
}

fn compares(value: Option<&Bson>, arg: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    let check = |v: &Bson| comparable(v, arg) && accept(compare_values(v, arg));
    match value {
        Some(Bson::Array(items)) => items.iter().any(check),
        Some(v) => check(v),
        None => false,
    }
}

fn in_list(op: &str, value: Option<&Bson>, arg: &Bson) -> StorageResult<bool> {
    let Bson::Array(candidates) = arg else {
        return Err(StorageError::InvalidQuery(format!("{op} requires an array")));
    };
    Ok(candidates
        .iter()
        .any(|candidate| equals_or_contains(value, candidate)))
}

fn regex_matches(value: Option<&Bson>, pattern: &Bson, options: &str) -> StorageResult<bool> {
    let (source, flags) = match pattern {
        Bson::String(s) => (s.as_str(), options),
        Bson::RegularExpression(r) => (r.pattern.as_str(), r.options.as_str()),
        _ => return Err(StorageError::InvalidQuery("$regex requires a string".into())),
    };
    let re = RegexBuilder::new(source)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .build()
        .map_err(|e| StorageError::InvalidQuery(format!("bad $regex: {e}")))?;
    Ok(match value {
        Some(Bson::String(s)) => re.is_match(s),
        Some(Bson::Array(items)) => items
            .iter()
            .any(|item| matches!(item, Bson::String(s) if re.is_match(s))),
        _ => false,
    })
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        Bson::Null | Bson::Undefined => false,
        _ => true,
    }
}

/// Resolve a dotted path against a document.
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(d) => d.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

/// Integers compare as integers; only a double on either side widens.
fn compare_numbers(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (as_i64(a), as_i64(b)) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        (Some(x), None) => compare_int_double(x, as_f64(b)?),
        (None, Some(y)) => compare_int_double(y, as_f64(a)?).map(Ordering::reverse),
        (None, None) => as_f64(a)?.partial_cmp(&as_f64(b)?),
    }
}

fn compare_int_double(x: i64, y: f64) -> Option<Ordering> {
    if y.is_nan() {
        return None;
    }
    if y.fract() == 0.0 && y >= i64::MIN as f64 && y < i64::MAX as f64 {
        return Some(x.cmp(&(y as i64)));
    }
    (x as f64).partial_cmp(&y)
}

/// Equality with numeric widening (`1 == 1.0 == 1i64`).
pub(crate) fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(_), Some(_)) => compare_numbers(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

fn comparable(a: &Bson, b: &Bson) -> bool {
    type_rank(a) == type_rank(b)
}

/// Total order across values: type rank first, then value.
pub(crate) fn compare_values(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Array(x), Bson::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let o = compare_values(l, r);
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => compare_numbers(a, b).unwrap_or(Ordering::Equal),
    }
}

/// Apply the update operators to `doc`. `inserting` is true when the
/// document is being materialized by an upsert, which activates
/// `$setOnInsert`. Returns whether the document changed.
pub(crate) fn apply_update(
    doc: &mut Document,
    update: &Document,
    inserting: bool,
) -> StorageResult<bool> {
    if update.is_empty() {
        return Err(StorageError::InvalidUpdate("update document is empty".into()));
    }
    if let Some(key) = update.keys().find(|k| !k.starts_with('$')) {
        return Err(StorageError::InvalidUpdate(format!(
            "update document requires atomic operators, found '{key}'"
        )));
    }

    let before = doc.clone();
    let original_id = doc.get("_id").cloned();

    for (op, arg) in update {
        let Bson::Document(fields) = arg else {
            return Err(StorageError::InvalidUpdate(format!(
                "{op} requires a document argument"
            )));
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone())?;
                }
            }
            "$setOnInsert" => {
                if inserting {
                    for (path, value) in fields {
                        set_path(doc, path, value.clone())?;
                    }
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    remove_path(doc, path);
                }
            }
            "$inc" => {
                for (path, amount) in fields {
                    let current = lookup(doc, path).cloned().unwrap_or(Bson::Int32(0));
                    let next = add_numbers(path, &current, amount)?;
                    set_path(doc, path, next)?;
                }
            }
            "$push" => {
                for (path, value) in fields {
                    let mut items = match lookup(doc, path) {
                        None => Vec::new(),
                        Some(Bson::Array(items)) => items.clone(),
                        Some(_) => {
                            return Err(StorageError::InvalidUpdate(format!(
                                "cannot $push to non-array field '{path}'"
                            )))
                        }
                    };
                    items.push(value.clone());
                    set_path(doc, path, Bson::Array(items))?;
                }
            }
            other => return Err(StorageError::UnsupportedOperator(other.to_string())),
        }
    }

    if !inserting {
        if let Some(id) = original_id {
            if doc.get("_id") != Some(&id) {
                return Err(StorageError::InvalidUpdate(
                    "performing an update on the path '_id' would modify the immutable field '_id'"
                        .into(),
                ));
            }
        }
    }

    Ok(*doc != before)
}

fn add_numbers(path: &str, a: &Bson, b: &Bson) -> StorageResult<Bson> {
    if let (Bson::Int32(x), Bson::Int32(y)) = (a, b) {
        return Ok(x
            .checked_add(*y)
            .map(Bson::Int32)
            .unwrap_or(Bson::Int64(*x as i64 + *y as i64)));
    }
    match (as_i64(a), as_i64(b)) {
        (Some(x), Some(y)) => x.checked_add(y).map(Bson::Int64).ok_or_else(|| {
            StorageError::InvalidUpdate(format!("$inc on '{path}' overflows a 64-bit integer"))
        }),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => Ok(Bson::Double(x + y)),
            _ => Err(StorageError::InvalidUpdate(format!(
                "cannot apply $inc to non-numeric field '{path}'"
            ))),
        },
    }
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> StorageResult<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !doc.contains_key(head) {
                doc.insert(head, Document::new());
            }
            match doc.get_mut(head) {
                Some(Bson::Document(child)) => set_path(child, rest, value),
                _ => Err(StorageError::InvalidUpdate(format!(
                    "cannot create field '{rest}' inside non-object '{head}'"
                ))),
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

/// The starting document for an upsert: the filter's plain equality terms.
pub(crate) fn upsert_seed(filter: &Document) -> StorageResult<Document> {
    let mut seed = Document::new();
    for (key, condition) in filter {
        if key.starts_with('$') {
            continue;
        }
        match is_operator_doc(condition) {
            Some(ops) => {
                if let Some(value) = ops.get("$eq") {
                    set_path(&mut seed, key, value.clone())?;
                }
            }
            None => set_path(&mut seed, key, condition.clone())?,
        }
    }
    Ok(seed)
}

/// Stable sort by a `{field: 1 | -1}` spec. Missing fields sort as null.
pub(crate) fn sort_documents(docs: &mut [Document], sort: &Document) {
    let keys: Vec<(&str, bool)> = sort
        .iter()
        .map(|(field, dir)| (field.as_str(), as_f64(dir).map_or(true, |d| d >= 0.0)))
        .collect();
    docs.sort_by(|a, b| {
        for (field, ascending) in &keys {
            let left = lookup(a, field).unwrap_or(&Bson::Null);
            let right = lookup(b, field).unwrap_or(&Bson::Null);
            let o = compare_values(left, right);
            if o != Ordering::Equal {
                return if *ascending { o } else { o.reverse() };
            }
        }
        Ordering::Equal
    });
}

/// Apply an inclusion or exclusion projection to top-level fields.
pub(crate) fn project(doc: Document, projection: &Document) -> Document {
    if projection.is_empty() {
        return doc;
    }
    let inclusion = projection
        .iter()
        .any(|(field, flag)| field != "_id" && truthy(flag));
    let keep_id = projection.get("_id").map_or(true, truthy);

    if inclusion {
        doc.into_iter()
            .filter(|(field, _)| {
                if field == "_id" {
                    keep_id
                } else {
                    projection.get(field).is_some_and(truthy)
                }
            })
            .collect()
    } else {
        doc.into_iter()
            .filter(|(field, _)| projection.get(field).map_or(true, truthy))
            .collect()
    }
}

/// Values of `field` across documents, with array members flattened and
/// duplicates removed. First occurrence order is kept.
pub(crate) fn distinct_values<'a>(
    docs: impl Iterator<Item = &'a Document>,
    field: &str,
) -> Vec<Bson> {
    let mut out: Vec<Bson> = Vec::new();
    let mut push = |value: &Bson| {
        if !out.iter().any(|seen| values_equal(seen, value)) {
            out.push(value.clone());
        }
    };
    for doc in docs {
        match lookup(doc, field) {
            Some(Bson::Array(items)) => items.iter().for_each(&mut push),
            Some(value) => push(value),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn person() -> Document {
        doc! {
            "name": "Ada",
            "age": 36,
            "tags": ["math", "engines"],
            "address": { "city": "London", "zip": "N1" },
        }
    }

    #[test]
    fn test_empty_filter_matches() {
        assert!(matches(&person(), &doc! {}).unwrap());
    }

    #[test]
    fn test_equality_and_dotted_paths() {
        let p = person();
        assert!(matches(&p, &doc! { "name": "Ada" }).unwrap());
        assert!(matches(&p, &doc! { "address.city": "London" }).unwrap());
        assert!(!matches(&p, &doc! { "address.city": "Paris" }).unwrap());
        assert!(matches(&p, &doc! { "age": 36.0 }).unwrap());
    }

    #[test]
    fn test_array_membership() {
        let p = person();
        assert!(matches(&p, &doc! { "tags": "math" }).unwrap());
        assert!(!matches(&p, &doc! { "tags": "poetry" }).unwrap());
    }

    #[test]
    fn test_comparison_operators() {
        let p = person();
        assert!(matches(&p, &doc! { "age": { "$gt": 30, "$lte": 36 } }).unwrap());
        assert!(!matches(&p, &doc! { "age": { "$lt": 36 } }).unwrap());
        assert!(!matches(&p, &doc! { "age": { "$gt": "30" } }).unwrap());
        assert!(matches(&p, &doc! { "name": { "$ne": "Bob" } }).unwrap());
    }

    #[test]
    fn test_in_exists_regex() {
        let p = person();
        assert!(matches(&p, &doc! { "name": { "$in": ["Bob", "Ada"] } }).unwrap());
        assert!(matches(&p, &doc! { "tags": { "$nin": ["poetry"] } }).unwrap());
        assert!(matches(&p, &doc! { "missing": { "$exists": false } }).unwrap());
        assert!(!matches(&p, &doc! { "name": { "$exists": 0 } }).unwrap());
        assert!(matches(&p, &doc! { "name": { "$regex": "^a", "$options": "i" } }).unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let p = person();
        assert!(matches(&p, &doc! { "$or": [{ "name": "Bob" }, { "age": 36 }] }).unwrap());
        assert!(!matches(&p, &doc! { "$and": [{ "name": "Ada" }, { "age": 1 }] }).unwrap());
        assert!(matches(&p, &doc! { "$nor": [{ "name": "Bob" }] }).unwrap());
    }

    #[test]
    fn test_null_matches_missing() {
        assert!(matches(&person(), &doc! { "nickname": Bson::Null }).unwrap());
    }

    #[test]
    fn test_unknown_operator() {
        let err = matches(&person(), &doc! { "age": { "$near": 1 } }).unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedOperator(ref op) if op == "$near"));
    }

    #[test]
    fn test_apply_set_unset_inc_push() {
        let mut p = person();
        let changed = apply_update(
            &mut p,
            &doc! {
                "$set": { "address.city": "Paris", "title": "Countess" },
                "$unset": { "address.zip": "" },
                "$inc": { "age": 1 },
                "$push": { "tags": "poetry" },
            },
            false,
        )
        .unwrap();
        assert!(changed);
        assert_eq!(p.get_document("address").unwrap(), &doc! { "city": "Paris" });
        assert_eq!(p.get_i32("age").unwrap(), 37);
        assert_eq!(p.get_str("title").unwrap(), "Countess");
        assert_eq!(p.get_array("tags").unwrap().len(), 3);
    }

    #[test]
    fn test_large_integers_keep_precision() {
        let big = 9_007_199_254_740_992i64;
        assert!(!values_equal(&Bson::Int64(big), &Bson::Int64(big + 1)));
        assert!(values_equal(&Bson::Int64(big), &Bson::Double(big as f64)));
        assert!(values_equal(&Bson::Int32(1), &Bson::Double(1.0)));
        assert_eq!(
            compare_values(&Bson::Int64(big + 1), &Bson::Int64(big)),
            Ordering::Greater
        );

        let doc = doc! { "v": big + 1 };
        assert!(matches(&doc, &doc! { "v": big + 1 }).unwrap());
        assert!(!matches(&doc, &doc! { "v": big }).unwrap());
        assert!(matches(&doc, &doc! { "v": { "$gt": big } }).unwrap());
    }

    #[test]
    fn test_inc_integers_exactly() {
        let big = 9_007_199_254_740_993i64;
        let mut d = doc! { "v": big };
        let changed = apply_update(&mut d, &doc! { "$inc": { "v": 0i64 } }, false).unwrap();
        assert!(!changed);
        assert_eq!(d.get_i64("v").unwrap(), big);

        apply_update(&mut d, &doc! { "$inc": { "v": 1 } }, false).unwrap();
        assert_eq!(d.get_i64("v").unwrap(), big + 1);

        apply_update(&mut d, &doc! { "$inc": { "v": 0.5 } }, false).unwrap();
        assert!(matches!(d.get("v"), Some(Bson::Double(_))));
    }

    #[test]
    fn test_inc_overflow_and_non_numeric() {
        let mut d = doc! { "v": i64::MAX, "s": "x" };
        let err = apply_update(&mut d, &doc! { "$inc": { "v": 1 } }, false).unwrap_err();
        assert!(matches!(err, StorageError::InvalidUpdate(ref m) if m.contains("overflows")));

        let err = apply_update(&mut d, &doc! { "$inc": { "s": 1 } }, false).unwrap_err();
        assert!(matches!(err, StorageError::InvalidUpdate(ref m) if m.contains("non-numeric")));
    }

    #[test]
    fn test_set_on_insert_only_when_inserting() {
        let mut p = person();
        let changed = apply_update(&mut p, &doc! { "$setOnInsert": { "x": 1 } }, false).unwrap();
        assert!(!changed);
        assert!(!p.contains_key("x"));

        apply_update(&mut p, &doc! { "$setOnInsert": { "x": 1 } }, true).unwrap();
        assert_eq!(p.get_i32("x").unwrap(), 1);
    }

    #[test]
    fn test_replacement_document_rejected() {
        let mut p = person();
        let err = apply_update(&mut p, &doc! { "name": "Bob" }, false).unwrap_err();
        assert!(matches!(err, StorageError::InvalidUpdate(_)));
    }

    #[test]
    fn test_id_is_immutable() {
        let mut p = doc! { "_id": 1, "a": 1 };
        let err = apply_update(&mut p, &doc! { "$set": { "_id": 2 } }, false).unwrap_err();
        assert!(matches!(err, StorageError::InvalidUpdate(_)));
    }

    #[test]
    fn test_upsert_seed() {
        let seed = upsert_seed(&doc! {
            "_id": 5,
            "kind": { "$eq": "a" },
            "age": { "$gt": 3 },
            "$or": [{ "x": 1 }],
        })
        .unwrap();
        assert_eq!(seed, doc! { "_id": 5, "kind": "a" });
    }

    #[test]
    fn test_sort_and_project() {
        let mut docs = vec![
            doc! { "_id": 1, "n": 3, "s": "b" },
            doc! { "_id": 2, "n": 1, "s": "a" },
            doc! { "_id": 3, "s": "c" },
        ];
        sort_documents(&mut docs, &doc! { "n": -1 });
        let ids: Vec<i32> = docs.iter().map(|d| d.get_i32("_id").unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(project(docs[0].clone(), &doc! { "_id": 0 }), doc! { "n": 3, "s": "b" });
        assert_eq!(project(docs[0].clone(), &doc! { "s": 1 }), doc! { "_id": 1, "s": "b" });
        assert_eq!(
            project(docs[0].clone(), &doc! { "s": 1, "_id": 0 }),
            doc! { "s": "b" }
        );
    }

    #[test]
    fn test_distinct_flattens_arrays() {
        let docs = vec![
            doc! { "t": ["a", "b"] },
            doc! { "t": "b" },
            doc! { "t": "c" },
            doc! { "other": 1 },
        ];
        let values = distinct_values(docs.iter(), "t");
        assert_eq!(
            values,
            vec![Bson::from("a"), Bson::from("b"), Bson::from("c")]
        );
    }
}
