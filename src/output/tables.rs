//! In-process registry of shared physical output tables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::models::{AnalysisId, OutputId, ProjectId, Timestamp, Value};

use super::{FieldSpec, LogLevel, LogRecord, OutputError, OutputRow, OutputSink, TableLayout, OUTPUT_TABLE_BASE};

/// A logical output table: one analysis' view of a physical table.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputHandle {
    pub id: OutputId,
    pub analysis: AnalysisId,
    pub project: ProjectId,
    pub name: String,
    pub layout: TableLayout,
}

#[derive(Debug)]
struct PhysicalTable {
    rows: Vec<(OutputId, Vec<Option<Value>>)>,
}

// ---

#[derive(Debug)]
pub struct OutputTables {
    base: String,
    /// Serializes physical table creation.
    create_lock: Mutex<()>,
    next_id: AtomicI64,
    tables: RwLock<HashMap<String, PhysicalTable>>,
    outputs: RwLock<IndexMap<OutputId, OutputHandle>>,
}

impl OutputTables {
    pub fn new() -> Arc<Self> {
        Self::with_base(OUTPUT_TABLE_BASE)
    }

    pub fn with_base(base: &str) -> Arc<Self> {
        Arc::new(Self {
            base: base.to_string(),
            create_lock: Mutex::new(()),
            next_id: AtomicI64::new(0),
            tables: RwLock::new(HashMap::new()),
            outputs: RwLock::new(IndexMap::new()),
        })
    }

    /// Register a logical output table for `analysis`, creating the
    /// physical table on first use and reusing it afterwards.
    pub fn create_output(
        &self,
        project: ProjectId,
        analysis: AnalysisId,
        table_name: &str,
        fields: &FieldSpec,
    ) -> Result<OutputHandle, OutputError> {
        // ---
        if fields.is_empty() {
            return Err(OutputError::EmptyTable(table_name.to_string()));
        }
        let layout = TableLayout::new(&self.base, project, fields);

        {
            let _guard = self.create_lock.lock();
            if !self.tables.read().contains_key(&layout.physical) {
                self.tables
                    .write()
                    .insert(layout.physical.clone(), PhysicalTable { rows: Vec::new() });
                tracing::info!(table = %layout.physical, "created output table");
            }
        }

        let id = OutputId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let handle = OutputHandle {
            id,
            analysis,
            project,
            name: table_name.to_string(),
            layout,
        };
        self.outputs.write().insert(id, handle.clone());
        Ok(handle)
    }

    pub fn physical_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Append already encoded rows under the handle's owner id.
    pub fn insert(&self, handle: &OutputHandle, rows: Vec<Vec<Option<Value>>>) -> Result<usize, OutputError> {
        // ---
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&handle.layout.physical)
            .ok_or_else(|| OutputError::UnknownTable(handle.layout.physical.clone()))?;
        let count = rows.len();
        table.rows.extend(rows.into_iter().map(|values| (handle.id, values)));
        Ok(count)
    }

    /// Rows owned by `handle`, in insertion order.
    pub fn rows(&self, handle: &OutputHandle) -> Vec<OutputRow> {
        // ---
        let tables = self.tables.read();
        let Some(table) = tables.get(&handle.layout.physical) else {
            return Vec::new();
        };
        table
            .rows
            .iter()
            .filter(|(owner, _)| *owner == handle.id)
            .map(|(_, values)| handle.layout.decode(values))
            .collect()
    }

    /// Raw rows of a physical table with their owner ids.
    pub fn physical_rows(&self, physical: &str) -> Vec<(OutputId, Vec<Option<Value>>)> {
        self.tables
            .read()
            .get(physical)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn outputs(&self, analysis: AnalysisId) -> Vec<OutputHandle> {
        self.outputs
            .read()
            .values()
            .filter(|h| h.analysis == analysis)
            .cloned()
            .collect()
    }

    /// Remove every output of `analysis` and the rows it owns. Physical
    /// tables stay, other analyses may share them.
    pub fn delete_analysis(&self, analysis: AnalysisId) -> usize {
        // ---
        let owned: Vec<OutputId> = {
            let mut outputs = self.outputs.write();
            let owned = outputs
                .values()
                .filter(|h| h.analysis == analysis)
                .map(|h| h.id)
                .collect::<Vec<_>>();
            outputs.retain(|id, _| !owned.contains(id));
            owned
        };

        let mut removed = 0;
        for table in self.tables.write().values_mut() {
            let before = table.rows.len();
            table.rows.retain(|(owner, _)| !owned.contains(owner));
            removed += before - table.rows.len();
        }
        removed
    }
}

/// Sink recording into an [`OutputTables`] registry.
pub struct TableOutput {
    tables: Arc<OutputTables>,
    project: ProjectId,
    analysis: AnalysisId,
    handles: IndexMap<String, OutputHandle>,
    pending: IndexMap<String, Vec<Vec<Option<Value>>>>,
    logs: Vec<LogRecord>,
}

impl TableOutput {
    pub fn new(tables: Arc<OutputTables>, project: ProjectId, analysis: AnalysisId) -> Self {
        Self {
            tables,
            project,
            analysis,
            handles: IndexMap::new(),
            pending: IndexMap::new(),
            logs: Vec::new(),
        }
    }

    pub fn handles(&self) -> &IndexMap<String, OutputHandle> {
        &self.handles
    }

    pub fn logs(&self) -> &[LogRecord] {
        &self.logs
    }
}

impl OutputSink for TableOutput {
    fn create_table(&mut self, name: &str, fields: &FieldSpec) -> Result<(), OutputError> {
        // ---
        if self.handles.contains_key(name) {
            return Err(OutputError::DuplicateTable(name.to_string()));
        }
        let handle = self
            .tables
            .create_output(self.project, self.analysis, name, fields)?;
        self.handles.insert(name.to_string(), handle);
        Ok(())
    }

    fn insert_row(&mut self, table: &str, row: OutputRow) -> Result<(), OutputError> {
        // ---
        let handle = self
            .handles
            .get(table)
            .ok_or_else(|| OutputError::UnknownTable(table.to_string()))?;
        let values = handle.layout.encode(table, row)?;
        self.pending.entry(table.to_string()).or_default().push(values);
        Ok(())
    }

    fn log(&mut self, message: &str, level: LogLevel, timestamp: Option<Timestamp>) {
        let record = LogRecord {
            level,
            message: message.to_string(),
            timestamp,
        };
        record.emit();
        self.logs.push(record);
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        // ---
        for (table, rows) in self.pending.drain(..) {
            if let Some(handle) = self.handles.get(&table) {
                self.tables.insert(handle, rows)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::output::ColumnType;
    use chrono::{TimeZone, Utc};
    use std::thread;

    fn time_value() -> FieldSpec {
        FieldSpec::from([
            ("time".to_string(), ColumnType::Timestamp),
            ("value".to_string(), ColumnType::Float),
        ])
    }

    fn row(h: u32, v: f64) -> OutputRow {
        OutputRow::from([
            ("time".to_string(), Some(Value::Datetime(Utc.with_ymd_and_hms(2014, 1, 1, h, 0, 0).unwrap()))),
            ("value".to_string(), Some(Value::Float(v))),
        ])
    }

    #[test]
    fn test_same_shape_shares_physical_table() {
        // ---
        let tables = OutputTables::new();
        let project = ProjectId::new(3);
        let mut a1 = TableOutput::new(tables.clone(), project, AnalysisId::new());
        let mut a2 = TableOutput::new(tables.clone(), project, AnalysisId::new());
        a1.create_table("out", &time_value()).unwrap();
        a2.create_table("out", &time_value()).unwrap();

        let h1 = a1.handles()["out"].clone();
        let h2 = a2.handles()["out"].clone();
        assert_eq!(h1.layout.physical, h2.layout.physical);
        assert_ne!(h1.id, h2.id);
        assert_eq!(tables.physical_tables(), vec!["appoutput_3_1f1t".to_string()]);

        a1.insert_row("out", row(1, 1.0)).unwrap();
        a1.insert_row("out", row(2, 2.0)).unwrap();
        a2.insert_row("out", row(1, 10.0)).unwrap();
        assert!(tables.rows(&h1).is_empty());

        a1.flush().unwrap();
        a2.flush().unwrap();
        assert_eq!(tables.rows(&h1).len(), 2);
        assert_eq!(tables.rows(&h2), vec![row(1, 10.0)]);
        assert_eq!(tables.physical_rows(&h1.layout.physical).len(), 3);
    }

    #[test]
    fn test_projects_do_not_share_tables() {
        // ---
        let tables = OutputTables::new();
        let a = tables
            .create_output(ProjectId::new(1), AnalysisId::new(), "out", &time_value())
            .unwrap();
        let b = tables
            .create_output(ProjectId::new(2), AnalysisId::new(), "out", &time_value())
            .unwrap();
        assert_ne!(a.layout.physical, b.layout.physical);
    }

    #[test]
    fn test_concurrent_creation_yields_one_table() {
        // ---
        let tables = OutputTables::new();
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let tables = tables.clone();
                thread::spawn(move || {
                    tables
                        .create_output(ProjectId::new(1), AnalysisId::new(), "out", &time_value())
                        .map(|h| h.layout.physical)
                })
            })
            .collect();
        for worker in workers {
            assert_eq!(worker.join().unwrap().unwrap(), "appoutput_1_1f1t");
        }
        assert_eq!(tables.physical_tables().len(), 1);
    }

    #[test]
    fn test_unknown_table_and_delete() {
        // ---
        let tables = OutputTables::new();
        let analysis = AnalysisId::new();
        let mut sink = TableOutput::new(tables.clone(), ProjectId::new(1), analysis);
        assert!(matches!(sink.insert_row("nope", row(1, 1.0)), Err(OutputError::UnknownTable(_))));
        assert!(matches!(
            sink.create_table("empty", &FieldSpec::new()),
            Err(OutputError::EmptyTable(_))
        ));

        sink.create_table("out", &time_value()).unwrap();
        assert!(matches!(
            sink.create_table("out", &time_value()),
            Err(OutputError::DuplicateTable(_))
        ));
        sink.insert_row("out", row(1, 1.0)).unwrap();
        sink.log("done", LogLevel::Info, None);
        sink.flush().unwrap();
        assert_eq!(sink.logs().len(), 1);

        assert_eq!(tables.delete_analysis(analysis), 1);
        assert!(tables.outputs(analysis).is_empty());
    }
}
