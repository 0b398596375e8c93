//! Translation of docweave filters and stages into MongoDB syntax.
//!
//! Filters are rendered by [`MongoQueryTranslator`], a [`QueryVisitor`] over
//! the expression tree. Pipeline stages are rendered by [`render_stage`],
//! which reuses the translator for `$match` stages.

use bson::{Bson, Document, doc};

use docweave_core::{
    error::OdmError,
    filter::{Expr, FieldOp, QueryVisitor, sort_document},
    pipeline::Stage,
};

/// Translates filter expressions into MongoDB query documents.
pub(crate) struct MongoQueryTranslator;

impl MongoQueryTranslator {
    /// Renders an optional filter; `None` matches every document.
    pub(crate) fn translate(filter: Option<&Expr>) -> Result<Document, OdmError> {
        match filter {
            Some(expr) => MongoQueryTranslator.visit_expr(expr),
            None => Ok(Document::new()),
        }
    }
}

/// Escapes regex metacharacters so `text` matches literally.
pub(crate) fn escape_regex(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn string_operand<'a>(op: &str, value: &'a Bson) -> Result<&'a str, OdmError> {
    value
        .as_str()
        .ok_or_else(|| OdmError::validation(format!("{op} requires a string value")))
}

impl QueryVisitor for MongoQueryTranslator {
    type Output = Document;
    type Error = OdmError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        if exprs.is_empty() {
            return Ok(Document::new());
        }
        Ok(doc! {
            "$and": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        // `$or` rejects an empty list; `$nor: [{}]` matches nothing.
        if exprs.is_empty() {
            return Ok(doc! { "$nor": [{}] });
        }
        Ok(doc! {
            "$or": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$nor": [self.visit_expr(expr)?],
        })
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            field: { "$exists": should_exist },
        })
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            field: match op {
                FieldOp::Eq => doc! { "$eq": value },
                FieldOp::Ne => doc! { "$ne": value },
                FieldOp::Gt => doc! { "$gt": value },
                FieldOp::Gte => doc! { "$gte": value },
                FieldOp::Lt => doc! { "$lt": value },
                FieldOp::Lte => doc! { "$lte": value },
                FieldOp::Contains => match value {
                    Bson::String(s) => doc! { "$regex": escape_regex(s) },
                    other => doc! { "$eq": other },
                },
                FieldOp::NotContains => match value {
                    Bson::String(s) => doc! { "$not": { "$regex": escape_regex(s) } },
                    other => doc! { "$ne": other },
                },
                FieldOp::StartsWith => {
                    doc! { "$regex": format!("^{}", escape_regex(string_operand("StartsWith", value)?)) }
                }
                FieldOp::EndsWith => {
                    doc! { "$regex": format!("{}$", escape_regex(string_operand("EndsWith", value)?)) }
                }
                FieldOp::AnyOf => doc! { "$in": value },
                FieldOp::NoneOf => doc! { "$nin": value },
            }
        })
    }

    fn visit_text(&mut self, search: &str) -> Result<Self::Output, Self::Error> {
        Ok(doc! { "$text": { "$search": search } })
    }

    fn visit_raw(&mut self, document: &Document) -> Result<Self::Output, Self::Error> {
        Ok(document.clone())
    }
}

fn count(n: u64) -> Bson {
    i64::try_from(n).map(Bson::Int64).unwrap_or(Bson::Int64(i64::MAX))
}

/// Renders a stage as a native pipeline document.
pub(crate) fn render_stage(stage: &Stage) -> Result<Document, OdmError> {
    Ok(match stage {
        Stage::Match(expr) => doc! { "$match": MongoQueryTranslator.visit_expr(expr)? },
        Stage::Sort(keys) => doc! { "$sort": sort_document(keys) },
        Stage::Skip(n) => doc! { "$skip": count(*n) },
        Stage::Limit(n) => doc! { "$limit": count(*n) },
        Stage::Project(projection) => doc! { "$project": projection.to_document() },
        Stage::Lookup { from, local_field, foreign_field, as_field } => doc! {
            "$lookup": {
                "from": from,
                "localField": local_field,
                "foreignField": foreign_field,
                "as": as_field,
            }
        },
        Stage::Unwind(path) => doc! { "$unwind": format!("${path}") },
        Stage::ReplaceRoot(path) => doc! { "$replaceRoot": { "newRoot": format!("${path}") } },
        Stage::Count(field) => doc! { "$count": field },
        Stage::Facet(facets) => {
            let mut rendered = Document::new();
            for (name, stages) in facets {
                rendered.insert(name.clone(), render_pipeline(stages)?);
            }
            doc! { "$facet": rendered }
        }
        Stage::Raw(document) => document.clone(),
    })
}

pub(crate) fn render_pipeline(stages: &[Stage]) -> Result<Vec<Document>, OdmError> {
    stages.iter().map(render_stage).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use docweave_core::filter::{Filter, Projection, Sort};

    fn translate(expr: &Expr) -> Document {
        MongoQueryTranslator.visit_expr(expr).unwrap()
    }

    #[test]
    fn empty_conjunctions_match_everything() {
        assert_eq!(translate(&Filter::and([])), doc! {});
        assert_eq!(MongoQueryTranslator::translate(None).unwrap(), doc! {});
    }

    #[test]
    fn negation_uses_nor() {
        let expr = Filter::eq("a", 1).not();
        assert_eq!(translate(&expr), doc! { "$nor": [{ "a": { "$eq": 1 } }] });
    }

    #[test]
    fn string_operators_escape_their_operand() {
        assert_eq!(
            translate(&Filter::starts_with("name", "a.b")),
            doc! { "name": { "$regex": "^a\\.b" } }
        );
        assert_eq!(
            translate(&Filter::contains("name", "(x)")),
            doc! { "name": { "$regex": "\\(x\\)" } }
        );
        assert!(MongoQueryTranslator.visit_expr(&Filter::ends_with("name", 3)).is_err());
    }

    #[test]
    fn text_filters_become_text_operators() {
        assert_eq!(translate(&Filter::text("cake")), doc! { "$text": { "$search": "cake" } });
    }

    #[test]
    fn paged_facets_render_natively() {
        let stages = vec![
            Stage::Match(Filter::eq("published", true)),
            Stage::Facet(vec![
                (
                    "results".into(),
                    vec![
                        Stage::Sort(vec![Sort::asc("name")]),
                        Stage::Skip(10),
                        Stage::Limit(10),
                        Stage::Project(Projection::exclude(["body"])),
                    ],
                ),
                ("total".into(), vec![Stage::Count("count".into())]),
            ]),
        ];
        assert_eq!(
            render_pipeline(&stages).unwrap(),
            vec![
                doc! { "$match": { "published": { "$eq": true } } },
                doc! {
                    "$facet": {
                        "results": [
                            { "$sort": { "name": 1 } },
                            { "$skip": 10_i64 },
                            { "$limit": 10_i64 },
                            { "$project": { "body": 0 } },
                        ],
                        "total": [{ "$count": "count" }],
                    }
                },
            ]
        );
    }

    #[test]
    fn unwind_and_replace_root_use_field_references() {
        assert_eq!(render_stage(&Stage::Unwind("__related".into())).unwrap(), doc! { "$unwind": "$__related" });
        assert_eq!(
            render_stage(&Stage::ReplaceRoot("__related".into())).unwrap(),
            doc! { "$replaceRoot": { "newRoot": "$__related" } }
        );
    }
}
