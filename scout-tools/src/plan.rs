//! Execution-plan summarizer.
//!
//! Walks a SHOWPLAN XML document and reduces it to a small JSON summary the
//! model can reason over: per-statement operator lists with cost estimates,
//! object references and warning tags, plus missing-index hints. An
//! unreadable document degrades to a `raw_plan` excerpt instead of failing
//! the round.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Serialize;

const STATEMENT_TEXT_MAX_CHARS: usize = 200;
const RAW_PLAN_MAX_CHARS: usize = 4000;

#[derive(Debug, Serialize)]
struct PlanSummary {
    statements: Vec<StatementSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_indexes: Option<Vec<MissingIndexHint>>,
}

#[derive(Debug, Serialize)]
struct StatementSummary {
    statement: String,
    estimated_rows: String,
    estimated_cost: String,
    operators: Vec<OperatorSummary>,
}

#[derive(Debug, Serialize)]
struct OperatorSummary {
    operation: String,
    logical_op: String,
    est_rows: String,
    est_cost: String,
    est_cpu: String,
    est_io: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct MissingIndexHint {
    table: String,
    impact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    equality_columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inequality_columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_columns: Option<Vec<String>>,
}

#[derive(Debug)]
enum PlanParseError {
    Xml(quick_xml::Error),
    UnexpectedRoot,
}

impl From<quick_xml::Error> for PlanParseError {
    fn from(e: quick_xml::Error) -> Self {
        Self::Xml(e)
    }
}

/// Reduce a SHOWPLAN XML document to its JSON summary.
pub fn summarize_plan(xml: &str) -> String {
    match parse_plan(xml) {
        Ok(summary) => serde_json::to_string(&summary).unwrap_or_else(|_| raw_fallback(xml)),
        Err(e) => {
            tracing::debug!(error = ?e, "plan document not parseable; returning raw excerpt");
            raw_fallback(xml)
        }
    }
}

fn raw_fallback(xml: &str) -> String {
    let raw: String = xml.chars().take(RAW_PLAN_MAX_CHARS).collect();
    serde_json::json!({ "raw_plan": raw }).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnUsage {
    Equality,
    Inequality,
    Include,
}

#[derive(Debug, Default)]
struct PendingHint {
    schema: String,
    table: String,
    equality: Vec<String>,
    inequality: Vec<String>,
    include: Vec<String>,
}

#[derive(Default)]
struct Walk {
    saw_root: bool,
    statements: Vec<StatementSummary>,
    missing: Vec<MissingIndexHint>,
    stmt: Option<StatementSummary>,
    /// Indices into the current statement's operator list, innermost last.
    op_stack: Vec<usize>,
    warnings_depth: usize,
    group_impact: Option<String>,
    hint: Option<PendingHint>,
    column_usage: Option<ColumnUsage>,
}

fn parse_plan(xml: &str) -> Result<PlanSummary, PlanParseError> {
    let mut reader = Reader::from_str(xml);
    let mut walk = Walk::default();

    loop {
        match reader.read_event()? {
            Event::Start(e) => walk.open(&e)?,
            Event::Empty(e) => {
                walk.open(&e)?;
                walk.close(e.local_name().as_ref());
            }
            Event::End(e) => walk.close(e.local_name().as_ref()),
            Event::Eof => break,
            _ => {}
        }
    }

    if !walk.saw_root {
        return Err(PlanParseError::UnexpectedRoot);
    }
    if let Some(stmt) = walk.stmt.take() {
        walk.statements.push(stmt);
    }
    Ok(PlanSummary {
        statements: walk.statements,
        missing_indexes: if walk.missing.is_empty() {
            None
        } else {
            Some(walk.missing)
        },
    })
}

impl Walk {
    fn open(&mut self, e: &BytesStart<'_>) -> Result<(), PlanParseError> {
        let name = e.local_name();
        let name = name.as_ref();
        if !self.saw_root {
            if name != b"ShowPlanXML" {
                return Err(PlanParseError::UnexpectedRoot);
            }
            self.saw_root = true;
            return Ok(());
        }

        match name {
            b"StmtSimple" => {
                if let Some(prev) = self.stmt.take() {
                    self.statements.push(prev);
                }
                self.op_stack.clear();
                let text: String = attr(e, "StatementText")
                    .unwrap_or_default()
                    .trim()
                    .chars()
                    .take(STATEMENT_TEXT_MAX_CHARS)
                    .collect();
                self.stmt = Some(StatementSummary {
                    statement: text,
                    estimated_rows: attr(e, "StatementEstRows").unwrap_or_default(),
                    estimated_cost: attr(e, "StatementSubTreeCost").unwrap_or_default(),
                    operators: Vec::new(),
                });
            }
            b"RelOp" => {
                if let Some(stmt) = self.stmt.as_mut() {
                    stmt.operators.push(OperatorSummary {
                        operation: attr(e, "PhysicalOp").unwrap_or_default(),
                        logical_op: attr(e, "LogicalOp").unwrap_or_default(),
                        est_rows: attr(e, "EstimateRows").unwrap_or_default(),
                        est_cost: attr(e, "EstimatedTotalSubtreeCost").unwrap_or_default(),
                        est_cpu: attr(e, "EstimateCPU").unwrap_or_default(),
                        est_io: attr(e, "EstimateIO").unwrap_or_default(),
                        schema: None,
                        table: None,
                        index: None,
                        warnings: None,
                    });
                    self.op_stack.push(stmt.operators.len() - 1);
                }
            }
            b"Object" => {
                if let Some(op) = self.current_operator() {
                    op.schema = attr(e, "Schema").map(strip_brackets).filter(|s| !s.is_empty());
                    op.table = attr(e, "Table").map(strip_brackets).filter(|s| !s.is_empty());
                    op.index = attr(e, "Index").map(strip_brackets).filter(|s| !s.is_empty());
                }
            }
            b"Warnings" => {
                if !self.op_stack.is_empty() {
                    self.warnings_depth += 1;
                }
            }
            b"MissingIndexGroup" => {
                self.group_impact = attr(e, "Impact");
            }
            b"MissingIndex" => {
                self.hint = Some(PendingHint {
                    schema: attr(e, "Schema").map(strip_brackets).unwrap_or_default(),
                    table: attr(e, "Table").map(strip_brackets).unwrap_or_default(),
                    ..PendingHint::default()
                });
            }
            b"ColumnGroup" => {
                self.column_usage = match attr(e, "Usage").as_deref() {
                    Some("EQUALITY") => Some(ColumnUsage::Equality),
                    Some("INEQUALITY") => Some(ColumnUsage::Inequality),
                    Some("INCLUDE") => Some(ColumnUsage::Include),
                    _ => None,
                };
            }
            b"Column" => {
                if let (Some(hint), Some(usage)) = (self.hint.as_mut(), self.column_usage) {
                    if let Some(column) = attr(e, "Name").map(strip_brackets) {
                        match usage {
                            ColumnUsage::Equality => hint.equality.push(column),
                            ColumnUsage::Inequality => hint.inequality.push(column),
                            ColumnUsage::Include => hint.include.push(column),
                        }
                    }
                }
            }
            _ => {
                if self.warnings_depth > 0 {
                    let tag = String::from_utf8_lossy(name).into_owned();
                    if let Some(op) = self.current_operator() {
                        op.warnings.get_or_insert_with(Vec::new).push(tag);
                    }
                }
            }
        }
        Ok(())
    }

    fn close(&mut self, name: &[u8]) {
        match name {
            b"StmtSimple" => {
                if let Some(stmt) = self.stmt.take() {
                    self.statements.push(stmt);
                }
                self.op_stack.clear();
            }
            b"RelOp" => {
                self.op_stack.pop();
            }
            b"Warnings" => {
                self.warnings_depth = self.warnings_depth.saturating_sub(1);
            }
            b"MissingIndexGroup" => {
                self.group_impact = None;
            }
            b"MissingIndex" => {
                if let Some(hint) = self.hint.take() {
                    self.missing.push(MissingIndexHint {
                        table: format!("{}.{}", hint.schema, hint.table),
                        impact: self.group_impact.clone().unwrap_or_default(),
                        equality_columns: non_empty(hint.equality),
                        inequality_columns: non_empty(hint.inequality),
                        include_columns: non_empty(hint.include),
                    });
                }
            }
            b"ColumnGroup" => {
                self.column_usage = None;
            }
            _ => {}
        }
    }

    fn current_operator(&mut self) -> Option<&mut OperatorSummary> {
        let idx = *self.op_stack.last()?;
        self.stmt.as_mut()?.operators.get_mut(idx)
    }
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    for a in e.attributes().flatten() {
        if a.key.local_name().as_ref() == name.as_bytes() {
            return a.unescape_value().ok().map(|v| v.into_owned());
        }
    }
    None
}

fn strip_brackets(s: String) -> String {
    s.trim_matches(|c| c == '[' || c == ']').to_string()
}

fn non_empty(columns: Vec<String>) -> Option<Vec<String>> {
    if columns.is_empty() { None } else { Some(columns) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PLAN: &str = r#"<?xml version="1.0" encoding="utf-16"?>
<shp:ShowPlanXML xmlns:shp="http://schemas.microsoft.com/sqlserver/2004/07/showplan" Version="1.539">
  <shp:BatchSequence><shp:Batch><shp:Statements>
    <shp:StmtSimple StatementText="SELECT o.id FROM dbo.orders o WHERE o.customer_id = 42" StatementEstRows="120" StatementSubTreeCost="0.0451">
      <shp:QueryPlan>
        <shp:MissingIndexes>
          <shp:MissingIndexGroup Impact="91.2">
            <shp:MissingIndex Database="[shop]" Schema="[dbo]" Table="[orders]">
              <shp:ColumnGroup Usage="EQUALITY">
                <shp:Column Name="[customer_id]" ColumnId="3"/>
              </shp:ColumnGroup>
              <shp:ColumnGroup Usage="INCLUDE">
                <shp:Column Name="[id]" ColumnId="1"/>
                <shp:Column Name="[created_at]" ColumnId="5"/>
              </shp:ColumnGroup>
            </shp:MissingIndex>
          </shp:MissingIndexGroup>
        </shp:MissingIndexes>
        <shp:RelOp PhysicalOp="Hash Match" LogicalOp="Inner Join" EstimateRows="120" EstimatedTotalSubtreeCost="0.0451" EstimateCPU="0.002" EstimateIO="0">
          <shp:Warnings>
            <shp:SpillToTempDb SpillLevel="1"/>
          </shp:Warnings>
          <shp:RelOp PhysicalOp="Clustered Index Scan" LogicalOp="Clustered Index Scan" EstimateRows="50000" EstimatedTotalSubtreeCost="0.032" EstimateCPU="0.055" EstimateIO="0.028">
            <shp:IndexScan Ordered="false">
              <shp:Object Database="[shop]" Schema="[dbo]" Table="[orders]" Index="[PK_orders]"/>
            </shp:IndexScan>
          </shp:RelOp>
        </shp:RelOp>
      </shp:QueryPlan>
    </shp:StmtSimple>
  </shp:Statements></shp:Batch></shp:BatchSequence>
</shp:ShowPlanXML>"#;

    fn parse(json: &str) -> serde_json::Value {
        serde_json::from_str(json).expect("summary is valid json")
    }

    #[test]
    fn extracts_statements_operators_and_objects() {
        let summary = parse(&summarize_plan(SAMPLE_PLAN));
        let statements = summary["statements"].as_array().expect("statements array");
        assert_eq!(statements.len(), 1);

        let stmt = &statements[0];
        assert_eq!(stmt["estimated_rows"], "120");
        assert_eq!(stmt["estimated_cost"], "0.0451");

        let operators = stmt["operators"].as_array().expect("operators array");
        assert_eq!(operators.len(), 2);
        assert_eq!(operators[0]["operation"], "Hash Match");
        assert_eq!(operators[0]["logical_op"], "Inner Join");
        assert_eq!(
            operators[0]["warnings"],
            serde_json::json!(["SpillToTempDb"])
        );
        // The scan's object belongs to the scan, not the join above it.
        assert!(operators[0].get("table").is_none());
        assert_eq!(operators[1]["operation"], "Clustered Index Scan");
        assert_eq!(operators[1]["schema"], "dbo");
        assert_eq!(operators[1]["table"], "orders");
        assert_eq!(operators[1]["index"], "PK_orders");
        assert_eq!(operators[1]["est_io"], "0.028");
    }

    #[test]
    fn extracts_missing_index_hints_and_collapses_empty_groups() {
        let summary = parse(&summarize_plan(SAMPLE_PLAN));
        let hints = summary["missing_indexes"]
            .as_array()
            .expect("missing_indexes array");
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0]["table"], "dbo.orders");
        assert_eq!(hints[0]["impact"], "91.2");
        assert_eq!(hints[0]["equality_columns"], serde_json::json!(["customer_id"]));
        assert_eq!(
            hints[0]["include_columns"],
            serde_json::json!(["id", "created_at"])
        );
        assert!(hints[0].get("inequality_columns").is_none());
    }

    #[test]
    fn statement_text_is_truncated() {
        let long_text = "SELECT ".to_string() + &"x, ".repeat(200);
        let xml = format!(
            r#"<ShowPlanXML><StmtSimple StatementText="{long_text}" StatementEstRows="1" StatementSubTreeCost="0"/></ShowPlanXML>"#
        );
        let summary = parse(&summarize_plan(&xml));
        let stmt = summary["statements"][0]["statement"]
            .as_str()
            .expect("statement text");
        assert_eq!(stmt.chars().count(), 200);
    }

    #[test]
    fn unexpected_root_degrades_to_raw_excerpt() {
        let summary = parse(&summarize_plan("<NotAPlan><Stuff/></NotAPlan>"));
        assert_eq!(summary["raw_plan"], "<NotAPlan><Stuff/></NotAPlan>");
        assert!(summary.get("statements").is_none());
        assert!(summary.get("missing_indexes").is_none());
    }

    #[test]
    fn malformed_xml_degrades_to_bounded_raw_excerpt() {
        let broken = format!("<ShowPlanXML><StmtSimple {}", "x".repeat(6000));
        let summary = parse(&summarize_plan(&broken));
        let raw = summary["raw_plan"].as_str().expect("raw excerpt");
        assert_eq!(raw.chars().count(), 4000);
        assert!(raw.starts_with("<ShowPlanXML"));
    }

    #[test]
    fn plan_without_statements_yields_empty_statement_list() {
        let summary = parse(&summarize_plan("<ShowPlanXML></ShowPlanXML>"));
        assert_eq!(summary["statements"], serde_json::json!([]));
        assert!(summary.get("missing_indexes").is_none());
    }
}
