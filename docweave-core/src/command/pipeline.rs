//! Execution of rendered pipeline templates.

use futures::{StreamExt, stream::BoxStream};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    command::race,
    context::Context,
    entity::{Entity, decode},
    error::{OdmError, OdmResult},
    pipeline::{Stage, Template},
};

/// Runs a parameterized aggregation over `E`'s collection, decoding its
/// output as `R`.
///
/// The context's global filters for `E` become a leading `$match`, placed
/// after the template's first stage when that stage is a full-text match
/// (which the store requires to come first).
pub struct PipelineCommand<'a, E, R> {
    ctx: &'a Context,
    template: Template,
    ignore_global: bool,
    token: Option<CancellationToken>,
    _types: PhantomData<fn() -> (E, R)>,
}

impl<'a, E, R> PipelineCommand<'a, E, R>
where
    E: Entity,
    R: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(ctx: &'a Context, template: Template) -> Self {
        Self { ctx, template, ignore_global: false, token: None, _types: PhantomData }
    }

    pub fn ignore_global_filters(mut self) -> Self {
        self.ignore_global = true;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    fn stages(&self) -> OdmResult<Vec<Stage>> {
        let mut stages = self.template.render()?;
        if let Some(global) = self.ctx.scoped_filter(E::type_name(), None, self.ignore_global) {
            let at = usize::from(stages.first().is_some_and(is_text_match));
            stages.insert(at, Stage::Match(global));
        }
        Ok(stages)
    }

    /// Collects every output document.
    pub async fn execute(self) -> OdmResult<Vec<R>> {
        let stages = self.stages()?;
        let collection = self.ctx.collection_name::<E>();
        debug!(collection, stages = stages.len(), "pipeline");
        let session = self.ctx.session().await;
        race(
            self.token.as_ref(),
            self.ctx.backend().aggregate(collection, stages, session),
        )
        .await?
        .into_iter()
        .map(decode)
        .collect()
    }

    /// Streams output documents as the store produces them.
    pub async fn execute_cursor(self) -> OdmResult<BoxStream<'static, OdmResult<R>>> {
        let stages = self.stages()?;
        let collection = self.ctx.collection_name::<E>();
        debug!(collection, stages = stages.len(), "pipeline cursor");
        let session = self.ctx.session().await;
        let cursor = race(
            self.token.as_ref(),
            self.ctx.backend().aggregate_stream(collection, stages, session),
        )
        .await?;
        let cursor = match self.token {
            Some(token) => cursor.take_until(token.cancelled_owned()).boxed(),
            None => cursor,
        };
        Ok(cursor.map(|document| document.and_then(decode)).boxed())
    }

    /// The first output document, if any.
    pub async fn execute_first(self) -> OdmResult<Option<R>> {
        Ok(self.execute().await?.into_iter().next())
    }

    /// The only output document, if any.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] if the pipeline produced several.
    pub async fn execute_single(self) -> OdmResult<Option<R>> {
        let mut output = self.execute().await?;
        if output.len() > 1 {
            return Err(OdmError::validation(format!(
                "expected at most one pipeline result, got {}",
                output.len()
            )));
        }
        Ok(output.pop())
    }
}

fn is_text_match(stage: &Stage) -> bool {
    match stage {
        Stage::Match(expr) => expr.has_text(),
        Stage::Raw(document) => document
            .get_document("$match")
            .is_ok_and(|filter| filter.contains_key("$text")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use bson::doc;

    #[test]
    fn text_match_stages_are_recognised() {
        assert!(is_text_match(&Stage::Raw(doc! { "$match": { "$text": { "$search": "x" } } })));
        assert!(is_text_match(&Stage::Match(Filter::text("x"))));
        assert!(!is_text_match(&Stage::Raw(doc! { "$match": { "age": 1 } })));
        assert!(!is_text_match(&Stage::Limit(1)));
    }
}
