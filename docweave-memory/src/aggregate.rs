//! Execution of aggregation stages over in-memory collections.

use bson::{Bson, Document};

use docweave_core::{filter::Projection, pipeline::Stage};

use crate::{
    error::{MemoryResult, MemoryStoreError},
    evaluator::{DocumentEvaluator, TextSearch, sort_documents, text_term, values_equal},
    parse,
    paths::{get_path, remove_path, set_path},
    store::Collections,
};

/// Runs stages against documents of one collection.
///
/// `$lookup` reads sibling collections from the same snapshot. A text
/// `$match` is remembered so later `$sort` stages can order by relevance.
pub(crate) struct Aggregator<'a> {
    collections: &'a Collections,
    text_fields: Vec<String>,
    text: Option<TextSearch>,
}

impl<'a> Aggregator<'a> {
    pub(crate) fn new(collections: &'a Collections, collection: &str) -> Self {
        let text_fields = collections
            .get(collection)
            .map(|c| c.text_fields())
            .unwrap_or_default();
        Self { collections, text_fields, text: None }
    }

    pub(crate) fn run(&mut self, mut documents: Vec<Document>, stages: &[Stage]) -> MemoryResult<Vec<Document>> {
        for stage in stages {
            documents = self.apply(documents, stage)?;
        }
        Ok(documents)
    }

    fn apply(&mut self, documents: Vec<Document>, stage: &Stage) -> MemoryResult<Vec<Document>> {
        match stage {
            Stage::Match(expr) => {
                if let Some(search) = text_term(expr) {
                    self.text = Some(TextSearch::new(&search, &self.text_fields));
                }
                DocumentEvaluator::filter_documents(&documents, Some(expr), &self.text_fields)
            }
            Stage::Sort(keys) => {
                let mut documents = documents;
                sort_documents(&mut documents, keys, self.text.as_ref());
                Ok(documents)
            }
            Stage::Skip(n) => Ok(documents.into_iter().skip(to_usize(*n)).collect()),
            Stage::Limit(n) => Ok(documents.into_iter().take(to_usize(*n)).collect()),
            Stage::Project(projection) => Ok(documents.iter().map(|d| project(d, projection)).collect()),
            Stage::Lookup { from, local_field, foreign_field, as_field } => {
                let foreign = self.collections.get(from).map(|c| c.documents.as_slice()).unwrap_or_default();
                documents
                    .into_iter()
                    .map(|mut document| {
                        let local = get_path(&document, local_field).cloned().unwrap_or(Bson::Null);
                        let joined = foreign
                            .iter()
                            .filter(|candidate| {
                                let value = get_path(candidate, foreign_field).unwrap_or(&Bson::Null);
                                lookup_matches(&local, value)
                            })
                            .cloned()
                            .map(Bson::Document)
                            .collect();
                        set_path(&mut document, as_field, Bson::Array(joined))?;
                        Ok(document)
                    })
                    .collect()
            }
            Stage::Unwind(path) => {
                let mut unwound = Vec::new();
                for document in documents {
                    match get_path(&document, path) {
                        None | Some(Bson::Null) => {}
                        Some(Bson::Array(items)) => {
                            for item in items.clone() {
                                let mut copy = document.clone();
                                set_path(&mut copy, path, item)?;
                                unwound.push(copy);
                            }
                        }
                        Some(_) => unwound.push(document),
                    }
                }
                Ok(unwound)
            }
            Stage::ReplaceRoot(path) => documents
                .iter()
                .map(|document| match get_path(document, path) {
                    Some(Bson::Document(inner)) => Ok(inner.clone()),
                    _ => Err(MemoryStoreError::operand(
                        "$replaceRoot",
                        format!("{path} does not resolve to a document"),
                    )),
                })
                .collect(),
            Stage::Count(field) => {
                if documents.is_empty() {
                    return Ok(Vec::new());
                }
                let n = i64::try_from(documents.len()).unwrap_or(i64::MAX);
                let mut counted = Document::new();
                counted.insert(field.clone(), count_value(n));
                Ok(vec![counted])
            }
            Stage::Facet(facets) => {
                let mut output = Document::new();
                for (name, stages) in facets {
                    let mut nested = Aggregator {
                        collections: self.collections,
                        text_fields: self.text_fields.clone(),
                        text: self.text.clone(),
                    };
                    let results = nested.run(documents.clone(), stages)?;
                    output.insert(name.clone(), results.into_iter().map(Bson::Document).collect::<Vec<_>>());
                }
                Ok(vec![output])
            }
            Stage::Raw(raw) => {
                let stage = parse::stage(raw)?;
                self.apply(documents, &stage)
            }
        }
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// `$count` emits an int32 when the total fits.
fn count_value(n: i64) -> Bson {
    i32::try_from(n).map(Bson::Int32).unwrap_or(Bson::Int64(n))
}

fn lookup_matches(local: &Bson, foreign: &Bson) -> bool {
    match (local, foreign) {
        (Bson::Array(items), _) => items.iter().any(|item| lookup_matches(item, foreign)),
        (_, Bson::Array(items)) => items.iter().any(|item| values_equal(local, item)),
        _ => values_equal(local, foreign),
    }
}

/// Applies a projection; `_id` is kept unless explicitly excluded.
pub(crate) fn project(document: &Document, projection: &Projection) -> Document {
    if projection.include.is_empty() {
        let mut projected = document.clone();
        for path in &projection.exclude {
            remove_path(&mut projected, path);
        }
        return projected;
    }
    let mut projected = Document::new();
    let keep_id = !projection.exclude.iter().any(|f| f == "_id");
    if keep_id {
        if let Some(id) = document.get("_id") {
            projected.insert("_id", id.clone());
        }
    }
    for path in &projection.include {
        if let Some(value) = get_path(document, path) {
            // Parents along a resolved path are documents, so this cannot fail.
            let _ = set_path(&mut projected, path, value.clone());
        }
    }
    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Collection;
    use bson::doc;
    use docweave_core::filter::{Filter, Sort};

    fn collections() -> Collections {
        let mut collections = Collections::new();
        collections.insert(
            "authors".into(),
            Collection::with_documents(vec![
                doc! { "_id": 1, "name": "Ann" },
                doc! { "_id": 2, "name": "Bob" },
            ]),
        );
        collections.insert(
            "links".into(),
            Collection::with_documents(vec![
                doc! { "_id": 10, "parent_id": 7, "child_id": 2 },
                doc! { "_id": 11, "parent_id": 7, "child_id": 1 },
                doc! { "_id": 12, "parent_id": 8, "child_id": 1 },
            ]),
        );
        collections
    }

    #[test]
    fn lookup_unwind_and_replace_root_follow_join_records() {
        let collections = collections();
        let stages = vec![
            Stage::Match(Filter::eq("parent_id", 7)),
            Stage::Lookup {
                from: "authors".into(),
                local_field: "child_id".into(),
                foreign_field: "_id".into(),
                as_field: "__related".into(),
            },
            Stage::Unwind("__related".into()),
            Stage::ReplaceRoot("__related".into()),
            Stage::Sort(vec![Sort::asc("name")]),
        ];
        let documents = collections["links"].documents.clone();
        let output = Aggregator::new(&collections, "links").run(documents, &stages).unwrap();
        assert_eq!(output, vec![doc! { "_id": 1, "name": "Ann" }, doc! { "_id": 2, "name": "Bob" }]);
    }

    #[test]
    fn facets_see_the_same_input() {
        let collections = collections();
        let stages = vec![Stage::Facet(vec![
            ("results".into(), vec![Stage::Skip(1), Stage::Limit(1)]),
            ("total".into(), vec![Stage::Count("count".into())]),
        ])];
        let documents = collections["links"].documents.clone();
        let output = Aggregator::new(&collections, "links").run(documents, &stages).unwrap();
        assert_eq!(
            output,
            vec![doc! {
                "results": [{ "_id": 11, "parent_id": 7, "child_id": 1 }],
                "total": [{ "count": 3 }],
            }]
        );
    }

    #[test]
    fn count_of_nothing_emits_nothing() {
        let collections = Collections::new();
        let output = Aggregator::new(&collections, "missing")
            .run(Vec::new(), &[Stage::Count("n".into())])
            .unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn raw_stages_are_parsed() {
        let collections = collections();
        let stages = vec![
            Stage::Raw(doc! { "$match": { "parent_id": { "$gte": 8 } } }),
            Stage::Raw(doc! { "$project": { "_id": 0, "child_id": 1 } }),
        ];
        let documents = collections["links"].documents.clone();
        let output = Aggregator::new(&collections, "links").run(documents, &stages).unwrap();
        assert_eq!(output, vec![doc! { "child_id": 1 }]);
    }

    #[test]
    fn exclusion_projection_removes_nested_paths() {
        let document = doc! { "_id": 1, "a": { "b": 1, "c": 2 } };
        assert_eq!(project(&document, &Projection::exclude(["a.b"])), doc! { "_id": 1, "a": { "c": 2 } });
    }
}
