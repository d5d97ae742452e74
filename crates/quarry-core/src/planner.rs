//! Turns a requested range into work: gaps to fetch, or covered sub-ranges to
//! clear.

use serde::Serialize;

use crate::{
  Result,
  coverage::CoverageStore,
  interval::{IntervalSet, TimeInterval},
  store::DocumentStore,
};

/// Gaps to fetch for one pair, in chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchPlan {
  pub entity: String,
  pub field:  String,
  pub gaps:   Vec<TimeInterval>,
}

/// Covered sub-ranges to clear for one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalPlan {
  pub entity:  String,
  pub field:   String,
  pub covered: IntervalSet,
}

pub struct CoveragePlanner<'a, S> {
  coverage: &'a CoverageStore<S>,
}

impl<'a, S: DocumentStore> CoveragePlanner<'a, S> {
  pub fn new(coverage: &'a CoverageStore<S>) -> Self { Self { coverage } }

  /// Current coverage of the pair and its gaps within `range`.
  pub async fn gaps(
    &self,
    entity: &str,
    field: &str,
    range: TimeInterval,
  ) -> Result<(IntervalSet, Vec<TimeInterval>)> {
    let current = self.coverage.get(entity, field).await?;
    let gaps = current.gaps(range);
    Ok((current, gaps))
  }

  /// Current coverage of the pair and the part of it inside `range`.
  pub async fn covered(
    &self,
    entity: &str,
    field: &str,
    range: TimeInterval,
  ) -> Result<(IntervalSet, IntervalSet)> {
    let current = self.coverage.get(entity, field).await?;
    let covered = current.intersect(range);
    Ok((current, covered))
  }

  /// Every pair in `entities × fields` that has at least one gap.
  pub async fn plan_fetch(
    &self,
    entities: &[String],
    fields: &[String],
    range: TimeInterval,
  ) -> Result<Vec<FetchPlan>> {
    let mut plans = Vec::new();
    for entity in entities {
      for field in fields {
        let (_, gaps) = self.gaps(entity, field, range).await?;
        if !gaps.is_empty() {
          plans.push(FetchPlan { entity: entity.clone(), field: field.clone(), gaps });
        }
      }
    }
    Ok(plans)
  }

  /// Every pair in `entities × fields` with some coverage inside `range`.
  pub async fn plan_removal(
    &self,
    entities: &[String],
    fields: &[String],
    range: TimeInterval,
  ) -> Result<Vec<RemovalPlan>> {
    let mut plans = Vec::new();
    for entity in entities {
      for field in fields {
        let (_, covered) = self.covered(entity, field, range).await?;
        if !covered.is_empty() {
          plans.push(RemovalPlan { entity: entity.clone(), field: field.clone(), covered });
        }
      }
    }
    Ok(plans)
  }
}
