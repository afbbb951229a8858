//! Chart specs built from query results.
//!
//! A [`VisualizationSpec`] is a typed description of a chart. On the wire it
//! serializes as a Vega-Lite document so front ends can render it directly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};

use super::state::Row;

const VEGA_LITE_SCHEMA: &str = "https://vega.github.io/schema/vega-lite/v5.json";

/// Chart families the planner may ask for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    #[default]
    Bar,
    Line,
    Pie,
    Scatter,
}

impl ChartKind {
    pub const ALL: [ChartKind; 4] = [
        ChartKind::Bar,
        ChartKind::Line,
        ChartKind::Pie,
        ChartKind::Scatter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Bar => "bar",
            ChartKind::Line => "line",
            ChartKind::Pie => "pie",
            ChartKind::Scatter => "scatter",
        }
    }

    /// Vega-Lite mark type
    fn mark(&self) -> &'static str {
        match self {
            ChartKind::Bar => "bar",
            ChartKind::Line => "line",
            ChartKind::Pie => "arc",
            ChartKind::Scatter => "point",
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChartKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        ChartKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| format!("unknown chart kind '{}'", s))
    }
}

/// A chart over a result set
#[derive(Debug, Clone, PartialEq)]
pub struct VisualizationSpec {
    pub kind: ChartKind,
    pub title: String,

    /// Column on the category (or x) axis
    pub category_field: String,

    /// Quantitative column (or y axis)
    pub value_field: String,

    /// The rows being charted, as returned by the data store
    pub data: Vec<Row>,
}

impl VisualizationSpec {
    /// Build a spec by picking axes from the rows.
    ///
    /// Numeric columns hold only numbers (at least one non-null). The value
    /// axis is the last numeric column that is not an identifier, since
    /// aggregates usually close the select list. Scatter plots take the first
    /// two numeric columns; other kinds prefer a text column for the category
    /// axis. Returns `None` when no sensible pair of columns exists.
    pub fn from_rows(kind: ChartKind, title: impl Into<String>, rows: &[Row]) -> Option<Self> {
        let first = rows.first()?;
        let columns: Vec<&String> = first.keys().collect();
        let numeric: Vec<&String> = columns
            .iter()
            .copied()
            .filter(|column| is_numeric_column(rows, column))
            .collect();

        let (category_field, value_field) = match kind {
            ChartKind::Scatter => (numeric.first()?, numeric.get(1)?),
            _ => {
                let value = numeric
                    .iter()
                    .rev()
                    .find(|column| !is_identifier(column))
                    .or_else(|| numeric.last())?;
                let category = columns
                    .iter()
                    .find(|column| *column != value && is_text_column(rows, column))
                    .or_else(|| columns.iter().find(|column| *column != value))?;
                (category, value)
            }
        };

        Some(Self {
            kind,
            title: title.into(),
            category_field: category_field.to_string(),
            value_field: value_field.to_string(),
            data: rows.to_vec(),
        })
    }

    /// Render as a Vega-Lite document
    pub fn to_vega_lite(&self) -> Value {
        let category = self.category_field.as_str();
        let value = self.value_field.as_str();

        let encoding = match self.kind {
            ChartKind::Bar => json!({
                "x": {"field": category, "type": "nominal", "sort": "-y"},
                "y": {"field": value, "type": "quantitative"},
                "tooltip": [{"field": category}, {"field": value}],
            }),
            ChartKind::Line => json!({
                "x": {"field": category, "type": "ordinal"},
                "y": {"field": value, "type": "quantitative"},
                "tooltip": [{"field": category}, {"field": value}],
            }),
            ChartKind::Pie => json!({
                "theta": {"field": value, "type": "quantitative"},
                "color": {"field": category, "type": "nominal"},
                "tooltip": [{"field": category}, {"field": value}],
            }),
            ChartKind::Scatter => json!({
                "x": {"field": category, "type": "quantitative"},
                "y": {"field": value, "type": "quantitative"},
                "tooltip": [{"field": category}, {"field": value}],
            }),
        };

        json!({
            "$schema": VEGA_LITE_SCHEMA,
            "title": self.title,
            "width": "container",
            "height": 300,
            "autosize": {"type": "fit", "contains": "padding"},
            "data": {"values": self.data},
            "mark": {"type": self.kind.mark(), "tooltip": true},
            "encoding": encoding,
        })
    }
}

impl Serialize for VisualizationSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_vega_lite().serialize(serializer)
    }
}

fn is_numeric_column(rows: &[Row], column: &str) -> bool {
    let mut seen_number = false;
    for row in rows {
        match row.get(column) {
            Some(Value::Number(_)) => seen_number = true,
            Some(Value::Null) | None => {}
            Some(_) => return false,
        }
    }
    seen_number
}

fn is_identifier(column: &str) -> bool {
    (column.len() > 2 && column.ends_with("Id")) || column.eq_ignore_ascii_case("id")
}

fn is_text_column(rows: &[Row], column: &str) -> bool {
    rows.iter()
        .all(|row| matches!(row.get(column), Some(Value::String(_)) | Some(Value::Null)))
}
