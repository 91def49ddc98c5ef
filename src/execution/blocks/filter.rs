//! `filter`: keeps the rows for which a predicate holds.
//!
//! Rows the predicate cannot be evaluated on (missing column, ordering a
//! number against text) are treated as non-matching.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::data::Table;
use crate::execution::step::{require_input, BlockContext, BlockError, BlockExecutor, BlockOutput};
use crate::workflow::params::FilterConfig;

pub struct FilterBlock {
    config: FilterConfig,
}

impl FilterBlock {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BlockExecutor for FilterBlock {
    async fn execute(&self, input: Option<Arc<Table>>, ctx: &BlockContext) -> Result<BlockOutput, BlockError> {
        let input = require_input(input, ctx)?;
        let predicate = &self.config.predicate;

        let mut output = Table::new(input.columns().to_vec())?;
        let mut unevaluable = 0;
        for (index, row) in input.rows().iter().enumerate() {
            match predicate.evaluate(input.columns(), row) {
                Ok(true) => output.push_row(row.clone())?,
                Ok(false) => {}
                Err(e) => {
                    if unevaluable == 0 {
                        debug!("Row {} does not match '{}': {}", index, predicate.source(), e);
                    }
                    unevaluable += 1;
                }
            }
        }

        if unevaluable > 0 {
            warn!(
                "Filter '{}' could not be evaluated on {} of {} rows; treated as non-matching",
                predicate.source(),
                unevaluable,
                input.len()
            );
        }
        info!("Filter kept {} of {} rows", output.len(), input.len());

        Ok(BlockOutput::table(output, input.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Row, RowError};
    use crate::execution::predicate::Predicate;

    fn filter(condition: &str) -> FilterBlock {
        FilterBlock::new(FilterConfig {
            condition: condition.to_string(),
            predicate: Predicate::parse(condition).unwrap(),
        })
    }

    fn leads() -> Arc<Table> {
        Arc::new(
            Table::from_strings(
                &["company", "employees", "industry"],
                &[
                    vec!["Acme", "250", "Software"],
                    vec!["Globex", "40", "software"],
                    vec!["Initech", "n/a", "Finance"],
                    vec!["Hooli", "900", ""],
                ],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_filter_rows() {
        let ctx = BlockContext::new("job", "filter", ".");
        let output = filter("employees >= 100 and industry icontains 'soft'")
            .execute(Some(leads()), &ctx)
            .await
            .unwrap();

        assert_eq!(output.rows_in, 4);
        assert_eq!(output.rows_out, 1);
        assert_eq!(output.table.unwrap().get(0, "company").unwrap().as_text(), "Acme");
    }

    #[tokio::test]
    async fn test_unevaluable_rows_do_not_match() {
        let ctx = BlockContext::new("job", "filter", ".");

        // "n/a" cannot be ordered against a number
        let output = filter("employees > 10").execute(Some(leads()), &ctx).await.unwrap();
        assert_eq!(output.rows_out, 3);

        let missing = filter("revenue > 10").execute(Some(leads()), &ctx).await.unwrap();
        assert_eq!(missing.rows_out, 0);
        assert_eq!(missing.table.unwrap().columns().len(), 3);
    }

    #[tokio::test]
    async fn test_never_increases_rows() {
        let ctx = BlockContext::new("job", "filter", ".");
        for condition in ["industry is not empty", "not (company == 'Acme')", "employees < 0 or company startswith 'H'"] {
            let output = filter(condition).execute(Some(leads()), &ctx).await.unwrap();
            assert!(output.rows_out <= output.rows_in, "{}", condition);
        }
    }

    #[tokio::test]
    async fn test_row_errors_travel_with_rows() {
        let mut table = Table::from_strings(&["company"], &[vec!["Acme"]]).unwrap();
        table
            .push_row(Row::new(vec![crate::data::Cell::infer("Globex")]).with_error(RowError::new("enrich", "timeout")))
            .unwrap();

        let ctx = BlockContext::new("job", "filter", ".");
        let output = filter("company is not empty").execute(Some(Arc::new(table)), &ctx).await.unwrap();
        assert_eq!(output.rows_out, 2);
        assert_eq!(output.row_errors, 1);
    }

    #[tokio::test]
    async fn test_requires_input() {
        let ctx = BlockContext::new("job", "filter", ".");
        let result = filter("company is empty").execute(None, &ctx).await;
        assert!(matches!(result, Err(BlockError::MissingInput(_))));
    }
}
