//! Rendering of executor output as aligned text tables or JSON Lines.

use crate::error::{QueryBookError, Result};
use crate::executor::{ExecutionOutput, Row};
use crate::query::QueryDefinition;
use crate::store::UpdateSummary;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::io::Write;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStyle {
    #[default]
    Tabular,
    Structured,
}

impl FromStr for ReportStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tabular" => Ok(ReportStyle::Tabular),
            "structured" => Ok(ReportStyle::Structured),
            other => Err(format!(
                "unknown report style '{other}' (expected 'tabular' or 'structured')"
            )),
        }
    }
}

impl fmt::Display for ReportStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportStyle::Tabular => "tabular",
            ReportStyle::Structured => "structured",
        })
    }
}

/// Renders one catalog entry's result into a sink.
///
/// A section is assembled in memory and written in one piece, so a failed
/// render leaves nothing half-written behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportFormatter {
    style: ReportStyle,
}

impl ReportFormatter {
    pub fn new(style: ReportStyle) -> Self {
        ReportFormatter { style }
    }

    pub fn style(&self) -> ReportStyle {
        self.style
    }

    /// Render `output` for `definition`. The definition's `headers` are the
    /// fallback columns when a tabular result has no rows.
    pub fn render<W: Write + ?Sized>(
        &self,
        definition: &QueryDefinition,
        output: ExecutionOutput<'_>,
        sink: &mut W,
    ) -> Result<()> {
        let text = match (self.style, output) {
            (ReportStyle::Tabular, ExecutionOutput::Rows(rows)) => {
                let declared = rows.columns().map(<[String]>::to_vec);
                let rows = rows.collect::<Result<Vec<Row>>>()?;
                let table = tabulate(&rows, declared, &definition.headers)?;
                format!("{}{table}\n", heading(definition))
            }
            (ReportStyle::Tabular, ExecutionOutput::Summary(summary)) => {
                let table = summary_table(&summary);
                format!("{}{table}\n", heading(definition))
            }
            (ReportStyle::Structured, ExecutionOutput::Rows(rows)) => {
                let mut lines = String::new();
                for row in rows {
                    let record = json!({"query": definition.id, "record": row?});
                    lines.push_str(&record.to_string());
                    lines.push('\n');
                }
                lines
            }
            (ReportStyle::Structured, ExecutionOutput::Summary(summary)) => {
                format!(
                    "{}\n",
                    json!({"query": definition.id, "summary": summary})
                )
            }
        };
        sink.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Report a failed entry in place of its section.
    pub fn render_error<W: Write + ?Sized>(
        &self,
        id: &str,
        label: &str,
        error: &QueryBookError,
        sink: &mut W,
    ) -> Result<()> {
        let text = match self.style {
            ReportStyle::Tabular => format!("=== {label} ===\nerror: {error}\n\n"),
            ReportStyle::Structured => {
                format!("{}\n", json!({"query": id, "error": error.to_string()}))
            }
        };
        sink.write_all(text.as_bytes())?;
        Ok(())
    }
}

fn heading(definition: &QueryDefinition) -> String {
    match &definition.section {
        Some(section) => format!("=== {} [{section}] ===\n", definition.label()),
        None => format!("=== {} ===\n", definition.label()),
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Columns are the declared ones, else the first row's fields, else the
/// fallback headers. Later rows print blanks for missing columns and drop
/// fields the first row lacks.
fn tabulate(rows: &[Row], declared: Option<Vec<String>>, fallback: &[String]) -> Result<String> {
    let mut columns = declared.unwrap_or_default();
    if columns.is_empty() {
        if let Some(first) = rows.first() {
            columns = first.keys().cloned().collect();
        }
    }
    if columns.is_empty() {
        if fallback.is_empty() {
            return Err(QueryBookError::EmptyResult);
        }
        columns = fallback.to_vec();
    }

    let cells: Vec<Vec<(String, bool)>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|column| match row.get(column) {
                    Some(value) => (cell(value), value.is_number()),
                    None => (String::new(), false),
                })
                .collect()
        })
        .collect();
    Ok(draw(&columns, &cells))
}

fn summary_table(summary: &UpdateSummary) -> String {
    let columns = ["matched".to_string(), "modified".to_string()];
    let cells = vec![vec![
        (summary.matched.to_string(), true),
        (summary.modified.to_string(), true),
    ]];
    draw(&columns, &cells)
}

/// Header, separator rule, rows; numeric cells right-aligned.
fn draw(columns: &[String], cells: &[Vec<(String, bool)>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in cells {
        for (width, (text, _)) in widths.iter_mut().zip(row) {
            *width = (*width).max(text.chars().count());
        }
    }

    let pad = |text: &str, width: usize, right: bool| {
        let fill = " ".repeat(width - text.chars().count());
        if right {
            format!("{fill}{text}")
        } else {
            format!("{text}{fill}")
        }
    };

    let mut out = String::new();
    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, &w)| pad(c, w, false))
        .collect();
    out.push_str(header.join(" | ").trim_end());
    out.push('\n');
    let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    out.push_str(&rule.join("-+-"));
    out.push('\n');
    for row in cells {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|((text, numeric), &w)| pad(text, w, *numeric))
            .collect();
        out.push_str(line.join(" | ").trim_end());
        out.push('\n');
    }
    out.push_str(&match cells.len() {
        1 => "(1 row)\n".to_string(),
        n => format!("({n} rows)\n"),
    });
    out
}
