use nacre_common::{ParamId, Timestamp};
use nacre_storage::{AggregationFunction, ValueFilter};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Semi-open query interval; `from > to` requests a backward scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Timestamp,
    pub to: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderBy {
    #[default]
    Series,
    Time,
}

/// Value-filter bounds as they arrive from the query front-end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct FilterSpec {
    pub gt: Option<f64>,
    pub ge: Option<f64>,
    pub lt: Option<f64>,
    pub le: Option<f64>,
}

impl FilterSpec {
    pub fn to_filter(self) -> Result<ValueFilter, QueryError> {
        let mut filter = ValueFilter::new();
        if let Some(v) = self.gt {
            filter = filter.greater_than(v);
        }
        if let Some(v) = self.ge {
            filter = filter.greater_or_equal(v);
        }
        if let Some(v) = self.lt {
            filter = filter.less_than(v);
        }
        if let Some(v) = self.le {
            filter = filter.less_or_equal(v);
        }
        if !filter.validate() {
            return Err(QueryError::BadRequest("conflicting filter bounds"));
        }
        Ok(filter)
    }
}

/// One join row: the series that populate the tuple columns and the id
/// the resulting tuples are published under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRow {
    pub dest_id: ParamId,
    pub columns: Vec<ParamId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueryKind {
    Scan,
    Aggregate {
        func: AggregationFunction,
    },
    GroupAggregate {
        funcs: Vec<AggregationFunction>,
        step: u64,
    },
    Join {
        rows: Vec<JoinRow>,
    },
}

/// Parsed query request consumed by the plan builder. Series selectors
/// and tags are resolved to concrete id lists by the external matcher
/// before the request reaches the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(flatten)]
    pub kind: QueryKind,
    pub range: TimeRange,
    #[serde(default)]
    pub ids: Vec<ParamId>,
    #[serde(default)]
    pub order_by: OrderBy,
    /// Raw id → synthetic group id (from the group-by clause).
    #[serde(default)]
    pub group_map: Option<FxHashMap<ParamId, ParamId>>,
    #[serde(default)]
    pub filter: Option<FilterSpec>,
}

impl QueryRequest {
    pub fn scan(ids: Vec<ParamId>, range: TimeRange, order_by: OrderBy) -> Self {
        QueryRequest {
            kind: QueryKind::Scan,
            range,
            ids,
            order_by,
            group_map: None,
            filter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_from_json() {
        let raw = r#"{
            "type": "group-aggregate",
            "funcs": ["cnt", "sum"],
            "step": 10,
            "range": { "from": 100, "to": 200 },
            "ids": [1, 2, 3],
            "order_by": "time"
        }"#;
        let req: QueryRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(req.order_by, OrderBy::Time);
        match req.kind {
            QueryKind::GroupAggregate { ref funcs, step } => {
                assert_eq!(step, 10);
                assert_eq!(funcs.len(), 2);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn conflicting_filter_is_rejected() {
        let spec = FilterSpec {
            gt: Some(1.0),
            ge: Some(2.0),
            ..FilterSpec::default()
        };
        assert!(spec.to_filter().is_err());
    }
}
