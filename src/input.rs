use std::collections::HashSet;

use camino::Utf8Path;

use crate::domain::{GeoPoint, ObservationDate, WorkItem};
use crate::error::WildError;
use crate::ledger::{Ledger, is_torn_marker};

pub const ID_COLUMN: &str = "filename";
pub const LATITUDE_COLUMN: &str = "latitude";
pub const LONGITUDE_COLUMN: &str = "longitude";
pub const DATE_COLUMN: &str = "sighting_date";

#[derive(Debug, Clone, Default)]
pub struct InputTable {
    pub items: Vec<WorkItem>,
    /// Rows that can never be enriched (bad coordinates or dates).
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone)]
pub struct RejectedRow {
    pub line: u64,
    pub id: String,
    pub reason: String,
}

impl InputTable {
    pub fn read(path: &Utf8Path) -> Result<Self, WildError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path.as_std_path())?;
        Self::from_reader(reader)
    }

    pub fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self, WildError> {
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let column = |name: &str| {
            headers
                .iter()
                .position(|header| header == name)
                .ok_or_else(|| WildError::MissingColumn(name.to_string()))
        };
        let id_idx = column(ID_COLUMN)?;
        let lat_idx = column(LATITUDE_COLUMN)?;
        let lon_idx = column(LONGITUDE_COLUMN)?;
        let date_idx = column(DATE_COLUMN)?;

        let mut table = InputTable::default();
        let mut seen = HashSet::new();
        let mut records = reader.records().enumerate().peekable();
        while let Some((index, record)) = records.next() {
            let line = index as u64 + 2;
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    table.reject(line, String::new(), err.to_string());
                    continue;
                }
            };
            if is_torn_marker(&record) {
                continue;
            }
            let cell = |idx: usize| record.get(idx).unwrap_or_default().trim();
            let id = cell(id_idx).to_string();
            let torn = records
                .peek()
                .is_some_and(|(_, next)| next.as_ref().is_ok_and(is_torn_marker));
            if torn {
                table.reject(line, id, "row cut off by an interrupted write".to_string());
                continue;
            }
            if id.is_empty() {
                table.reject(line, id, "empty identifier".to_string());
                continue;
            }
            if seen.contains(&id) {
                tracing::debug!(id = %id, line, "duplicate input identifier; keeping first");
                continue;
            }

            let parsed = parse_coordinate(LATITUDE_COLUMN, cell(lat_idx), 90.0).and_then(|lat| {
                let lon = parse_coordinate(LONGITUDE_COLUMN, cell(lon_idx), 180.0)?;
                let date: ObservationDate = cell(date_idx).parse()?;
                Ok((GeoPoint::new(lat, lon), date))
            });
            let (point, date) = match parsed {
                Ok(parsed) => parsed,
                Err(err) => {
                    table.reject(line, id, err.to_string());
                    continue;
                }
            };
            seen.insert(id.clone());

            let fields = headers
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.clone(), record.get(idx).unwrap_or_default().to_string()))
                .collect();
            table.items.push(WorkItem {
                id,
                point,
                date,
                fields,
            });
        }

        for rejected in &table.rejected {
            tracing::warn!(
                line = rejected.line,
                id = %rejected.id,
                reason = %rejected.reason,
                "input row cannot be enriched; skipping"
            );
        }
        Ok(table)
    }

    fn reject(&mut self, line: u64, id: String, reason: String) {
        self.rejected.push(RejectedRow { line, id, reason });
    }

    /// Items missing from the ledger, in input order.
    pub fn pending<'a, L: Ledger + ?Sized>(&'a self, ledger: &L) -> Vec<&'a WorkItem> {
        self.items
            .iter()
            .filter(|item| !ledger.contains(&item.id))
            .collect()
    }
}

fn parse_coordinate(column: &str, value: &str, limit: f64) -> Result<f64, WildError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.abs() <= limit)
        .ok_or_else(|| WildError::InvalidCoordinate {
            column: column.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::ledger::{LedgerEntry, MemoryLedger};

    fn table(csv_text: &str) -> Result<InputTable, WildError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(csv_text.as_bytes());
        InputTable::from_reader(reader)
    }

    #[test]
    fn reads_rows_and_carries_fields() {
        let table = table(
            "filename,scientific_name,latitude,longitude,sighting_date\n\
             img_a.jpg,Lynx lynx,45.1,7.2,2021-06-15\n",
        )
        .unwrap();
        assert_eq!(table.items.len(), 1);
        let item = &table.items[0];
        assert_eq!(item.id, "img_a.jpg");
        assert_eq!(item.fields[1], ("scientific_name".to_string(), "Lynx lynx".to_string()));
        assert_eq!(item.point, GeoPoint::new(45.1, 7.2));
    }

    #[test]
    fn missing_required_column() {
        let err = table("filename,latitude,longitude\nimg_a.jpg,1,2\n").unwrap_err();
        assert_matches!(err, WildError::MissingColumn(column) if column == "sighting_date");
    }

    #[test]
    fn rejects_bad_rows_and_duplicates() {
        let table = table(
            "filename,latitude,longitude,sighting_date\n\
             a,95.0,1.0,2021-01-01\n\
             b,1.0,1.0,not-a-date\n\
             c,1.0,1.0,2021-01-01\n\
             c,2.0,2.0,2021-01-02\n",
        )
        .unwrap();
        assert_eq!(table.items.len(), 1);
        assert_eq!(table.items[0].point.latitude, 1.0);
        assert_eq!(table.rejected.len(), 2);
    }

    #[test]
    fn invalid_row_does_not_shadow_later_valid_duplicate() {
        let table = table(
            "filename,latitude,longitude,sighting_date\n\
             c,1.0,1.0,someday\n\
             c,2.0,2.0,2021-01-02\n",
        )
        .unwrap();
        assert_eq!(table.items.len(), 1);
        assert_eq!(table.items[0].id, "c");
        assert_eq!(table.items[0].point.latitude, 2.0);
        assert_eq!(table.rejected.len(), 1);
        assert_eq!(table.rejected[0].line, 2);
    }

    #[test]
    fn skips_row_marked_torn() {
        let table = table(
            "filename,latitude,longitude,sighting_date\n\
             a,1.0,1.0,2021-01-01\n\
             b,1.0,1.0,2021-01-0\n\
             #torn\n\
             b,1.0,1.0,2021-01-05\n",
        )
        .unwrap();
        let ids: Vec<&str> = table.items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(table.items[1].date.to_string(), "2021-01-05");
        assert_eq!(table.rejected.len(), 1);
    }

    #[test]
    fn pending_excludes_ledger_ids() {
        let table = table(
            "filename,latitude,longitude,sighting_date\n\
             a,1,1,2021-01-01\n\
             b,1,1,2021-01-01\n",
        )
        .unwrap();
        let mut ledger = MemoryLedger::new();
        ledger.append(&LedgerEntry::new("a", Vec::new())).unwrap();
        let pending = table.pending(&ledger);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
    }
}
