//! Vehicle id lists read from CSV.
//!
//! Files come with or without a header. A `Titans` or `Titan` column is used
//! when present; otherwise the first column. A first row that does not look
//! like an id is treated as a header.

use anyhow::{Context, Result, bail};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::info;

const ID_COLUMNS: &[&str] = &["Titans", "Titan"];

/// Reads vehicle ids from the CSV file at `path`.
pub fn load_vehicle_ids(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open vehicle file {}", path.display()))?;
    let ids = parse_vehicle_ids(file)
        .with_context(|| format!("Failed to read vehicle file {}", path.display()))?;

    if ids.is_empty() {
        bail!("Vehicle file {} contains no vehicle ids", path.display());
    }

    info!(path = %path.display(), vehicles = ids.len(), "Vehicle ids loaded");
    Ok(ids)
}

/// Parses vehicle ids from CSV text, skipping blank cells.
pub fn parse_vehicle_ids<R: Read>(reader: R) -> Result<Vec<String>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = rdr.records();
    let Some(first) = rows.next().transpose()? else {
        return Ok(Vec::new());
    };

    let named_column = ID_COLUMNS
        .iter()
        .find_map(|name| first.iter().position(|cell| cell == *name));

    let (column, first_is_header) = match named_column {
        Some(column) => (column, true),
        None => (0, !looks_like_id(first.get(0).unwrap_or(""))),
    };

    let mut ids = Vec::new();
    if !first_is_header {
        push_cell(&mut ids, first.get(column));
    }
    for row in rows {
        let row = row?;
        push_cell(&mut ids, row.get(column));
    }

    Ok(ids)
}

fn push_cell(ids: &mut Vec<String>, cell: Option<&str>) {
    if let Some(cell) = cell.filter(|c| !c.is_empty()) {
        ids.push(cell.to_string());
    }
}

fn looks_like_id(cell: &str) -> bool {
    !cell.is_empty() && cell.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn parse(text: &str) -> Vec<String> {
        parse_vehicle_ids(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_headerless_single_column() {
        assert_eq!(parse("3003\n3007\n"), vec!["3003", "3007"]);
    }

    #[test]
    fn test_titans_column_by_name() {
        assert_eq!(parse("Team,Titans\na,3003\nb,3007\n"), vec!["3003", "3007"]);
    }

    #[test]
    fn test_titan_column_by_name() {
        assert_eq!(parse("Titan\n3010\n"), vec!["3010"]);
    }

    #[test]
    fn test_titans_preferred_over_titan() {
        assert_eq!(parse("Titan,Titans\n1,2\n"), vec!["2"]);
    }

    #[test]
    fn test_unknown_header_uses_first_column() {
        assert_eq!(parse("vehicle,route\n3003,20\n 3007 ,4\n"), vec!["3003", "3007"]);
    }

    #[test]
    fn test_blank_cells_skipped() {
        assert_eq!(parse("3003\n\n3007\n,\n"), vec!["3003", "3007"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let path = env::temp_dir().join("breadcrumb_pipeline_test_no_such_vehicles.csv");
        let _ = fs::remove_file(&path);
        assert!(load_vehicle_ids(&path).is_err());
    }

    #[test]
    fn test_load_header_only_file_is_error() {
        let path = env::temp_dir().join("breadcrumb_pipeline_test_header_only.csv");
        fs::write(&path, "Titans\n").unwrap();
        assert!(load_vehicle_ids(&path).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_vehicle_file() {
        let path = env::temp_dir().join("breadcrumb_pipeline_test_vehicles.csv");
        fs::write(&path, "Titans\n3003\n3007\n").unwrap();
        assert_eq!(load_vehicle_ids(&path).unwrap(), vec!["3003", "3007"]);
        fs::remove_file(&path).unwrap();
    }
}
