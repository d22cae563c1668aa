use crate::repository::{StoredPoint, TokenStats};
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

/// Every currency appearing in any of the fee maps, sorted.
fn currencies<'a>(fee_maps: impl Iterator<Item = &'a BTreeMap<String, f64>>) -> Vec<String> {
    fee_maps
        .flat_map(|fees| fees.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn amount(value: Option<&f64>) -> String {
    value.map_or("N/A".to_string(), |v| format!("{v:.6}"))
}

fn optional(value: Option<u64>) -> String {
    value.map_or("N/A".to_string(), |v| v.to_string())
}

pub fn format_points(points: &[StoredPoint], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => format_points_table(points),
        OutputFormat::Json => {
            serde_json::to_string_pretty(points).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => format_points_csv(points),
    }
}

fn format_points_table(points: &[StoredPoint]) -> String {
    if points.is_empty() {
        return "No points found.".to_string();
    }

    let currencies = currencies(points.iter().map(|p| &p.fees));
    let mut header = vec![
        "Time".to_string(),
        "Token".to_string(),
        "Gas".to_string(),
        "Block".to_string(),
    ];
    header.extend(currencies.iter().map(|c| format!("Fee ({c})")));

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);

    for point in points {
        let mut row = vec![
            Cell::new(point.time.to_rfc3339()),
            Cell::new(&point.token),
            Cell::new(optional(point.gas)),
            Cell::new(optional(point.block)),
        ];
        for currency in &currencies {
            row.push(Cell::new(amount(point.fees.get(currency))));
        }
        table.add_row(row);
    }

    table.to_string()
}

fn format_points_csv(points: &[StoredPoint]) -> String {
    let currencies = currencies(points.iter().map(|p| &p.fees));
    let mut wtr = Writer::from_writer(vec![]);

    let mut header = vec![
        "time".to_string(),
        "token".to_string(),
        "kind".to_string(),
        "gas".to_string(),
        "block".to_string(),
    ];
    header.extend(currencies.iter().map(|c| format!("fee_{c}")));
    let _ = wtr.write_record(&header);

    for point in points {
        let mut record = vec![
            point.time.timestamp().to_string(),
            point.token.clone(),
            point.kind.clone(),
            point.gas.map(|g| g.to_string()).unwrap_or_default(),
            point.block.map(|b| b.to_string()).unwrap_or_default(),
        ];
        record.extend(
            currencies
                .iter()
                .map(|c| point.fees.get(c).map(|v| v.to_string()).unwrap_or_default()),
        );
        let _ = wtr.write_record(&record);
    }

    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

pub fn format_stats(stats: &[TokenStats], format: &OutputFormat) -> String {
    let currencies = currencies(stats.iter().map(|s| &s.average_fees));

    match format {
        OutputFormat::Table => {
            if stats.is_empty() {
                return "No points recorded.".to_string();
            }

            let mut header = vec![
                "Token".to_string(),
                "Points".to_string(),
                "First Block".to_string(),
                "Last Block".to_string(),
            ];
            header.extend(currencies.iter().map(|c| format!("Avg Fee ({c})")));

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(header);

            for entry in stats {
                let mut row = vec![
                    Cell::new(&entry.token),
                    Cell::new(entry.points),
                    Cell::new(optional(entry.first_block)),
                    Cell::new(optional(entry.last_block)),
                ];
                row.extend(
                    currencies
                        .iter()
                        .map(|c| Cell::new(amount(entry.average_fees.get(c)))),
                );
                table.add_row(row);
            }

            table.to_string()
        }
        OutputFormat::Json => {
            serde_json::to_string_pretty(stats).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let mut header = vec![
                "token".to_string(),
                "points".to_string(),
                "first_block".to_string(),
                "last_block".to_string(),
            ];
            header.extend(currencies.iter().map(|c| format!("avg_fee_{c}")));
            let _ = wtr.write_record(&header);

            for entry in stats {
                let mut record = vec![
                    entry.token.clone(),
                    entry.points.to_string(),
                    entry.first_block.map(|b| b.to_string()).unwrap_or_default(),
                    entry.last_block.map(|b| b.to_string()).unwrap_or_default(),
                ];
                record.extend(currencies.iter().map(|c| {
                    entry
                        .average_fees
                        .get(c)
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                }));
                let _ = wtr.write_record(&record);
            }

            String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
        }
    }
}
