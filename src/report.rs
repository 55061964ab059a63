use crate::analyzer::{Category, RsPeriods, RsResult};
use crate::etf::EtfRow;
use crate::refresh_tracker::{RefreshRecord, RefreshStatus};
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table,
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_BORDERS_ONLY,
};

fn base_table(headers: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers);
    table
}

fn header(title: impl Into<String>) -> Cell {
    Cell::new(title.into()).add_attribute(Attribute::Bold)
}

fn numeric_header(title: impl Into<String>) -> Cell {
    header(title).set_alignment(CellAlignment::Right)
}

fn category_color(category: Category) -> Color {
    match category {
        Category::Outperforming => Color::Green,
        Category::Mixed => Color::Yellow,
        Category::Underperforming => Color::Red,
    }
}

fn signed_color(v: f64) -> Color {
    if v > 0.0 {
        Color::Green
    } else if v < 0.0 {
        Color::Red
    } else {
        Color::Grey
    }
}

fn num_cell(v: f64, suffix: &str) -> Cell {
    Cell::new(format!("{v:.2}{suffix}"))
        .fg(signed_color(v))
        .set_alignment(CellAlignment::Right)
}

fn opt_cell(v: Option<f64>, suffix: &str) -> Cell {
    match v {
        Some(v) => num_cell(v, suffix),
        None => Cell::new("-").fg(Color::DarkGrey).set_alignment(CellAlignment::Right),
    }
}

fn price_cell(v: f64) -> Cell {
    Cell::new(format!("{v:.2}")).set_alignment(CellAlignment::Right)
}

fn display_name(r: &RsResult) -> String {
    if r.cached {
        format!("{} (cached)", r.instrument.name)
    } else {
        r.instrument.name.clone()
    }
}

pub fn sector_table(results: &[RsResult], periods: RsPeriods) -> Table {
    let [p1, p2, p3] = periods.as_array();
    let mut table = base_table(vec![
        header("Rank"),
        header("Sector"),
        numeric_header("LTP"),
        numeric_header("% Change"),
        numeric_header(format!("RS {p1}")),
        numeric_header(format!("RS {p2}")),
        numeric_header(format!("RS {p3}")),
        header("Category"),
        header("Summary"),
    ]);

    for (rank, r) in results.iter().enumerate() {
        let color = category_color(r.category);
        table.add_row(vec![
            Cell::new(rank + 1).fg(Color::DarkGrey),
            Cell::new(display_name(r)).fg(if r.cached { Color::DarkGrey } else { Color::Cyan }),
            price_cell(r.ltp),
            num_cell(r.pct_change_from_prev_close, "%"),
            opt_cell(r.short_rs(), ""),
            opt_cell(r.medium_rs(), ""),
            opt_cell(r.long_rs(), ""),
            Cell::new(r.category).fg(color).add_attribute(Attribute::Bold),
            Cell::new(&r.narrative).fg(color),
        ]);
    }
    table
}

pub fn etf_table(rows: &[EtfRow], periods: RsPeriods) -> Table {
    let [p1, p2, p3] = periods.as_array();
    let mut table = base_table(vec![
        header("ETF"),
        header("Theme"),
        numeric_header("LTP"),
        numeric_header("% Change"),
        numeric_header("20 DMA"),
        numeric_header("% vs 20 DMA"),
        numeric_header(format!("RS {p1}")),
        numeric_header(format!("RS {p2}")),
        numeric_header(format!("RS {p3}")),
        header("Outlook"),
    ]);

    for row in rows {
        table.add_row(vec![
            Cell::new(&row.code).fg(Color::Cyan),
            Cell::new(&row.theme).fg(Color::Grey),
            price_cell(row.ltp),
            num_cell(row.pct_change, "%"),
            row.dma_20.map_or_else(|| opt_cell(None, ""), price_cell),
            opt_cell(row.pct_from_dma_20, "%"),
            opt_cell(row.rs_short, ""),
            opt_cell(row.rs_medium, ""),
            opt_cell(row.rs_long, ""),
            Cell::new(&row.outlook),
        ]);
    }
    table
}

fn status_color(status: RefreshStatus) -> Color {
    match status {
        RefreshStatus::Success => Color::Green,
        RefreshStatus::Failed => Color::Red,
        RefreshStatus::Unknown => Color::DarkGrey,
    }
}

/// One row per dataset. `ages` lines up with `records`.
pub fn refresh_status_table(records: &[RefreshRecord], ages: &[i64]) -> Table {
    let mut table = base_table(vec![
        header("Dataset"),
        header("Last Refresh"),
        header("Status"),
        numeric_header("Rows"),
        numeric_header("Age (min)"),
        header("Freshness"),
    ]);

    for (record, age) in records.iter().zip(ages) {
        let status_color = status_color(record.status);
        let age = if *age < 0 { "-".to_string() } else { age.to_string() };
        table.add_row(vec![
            Cell::new(record.dataset).add_attribute(Attribute::Bold),
            Cell::new(&record.last_refresh),
            Cell::new(record.status.as_str()).fg(status_color),
            Cell::new(record.count).set_alignment(CellAlignment::Right),
            Cell::new(age).set_alignment(CellAlignment::Right),
            Cell::new(record.freshness.as_str()),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::evaluate;
    use crate::analyzer::tests::{inst, trend};
    use crate::candles::tests::series;
    use crate::etf::etf_rows;
    use crate::refresh_tracker::DatasetKey;
    use chrono::Utc;

    #[test]
    fn sector_table_lists_every_row_with_period_headers() {
        let periods = RsPeriods::new(2, 5, 10).unwrap();
        let bench = series(&trend(20, 0.5));
        let results: Vec<_> = ["AUTO", "IT"]
            .iter()
            .filter_map(|t| evaluate(&inst(t), &series(&trend(20, 1.0)), &bench, periods, Utc::now()))
            .collect();

        let mut table = sector_table(&results, periods);
        table.set_width(400);
        let rendered = table.to_string();
        assert!(rendered.contains("RS 5"));
        assert!(rendered.contains("AUTO"));
        assert!(rendered.contains("Outperforming"));
        assert_eq!(table.row_iter().count(), 2);

        let mut etfs = etf_table(&etf_rows(&results), periods);
        etfs.set_width(400);
        assert!(etfs.to_string().contains("NIFTY IT"));
    }

    #[test]
    fn status_colours_follow_status_variant() {
        assert_eq!(status_color(RefreshStatus::Success), Color::Green);
        assert_eq!(status_color(RefreshStatus::Failed), Color::Red);
        assert_eq!(status_color(RefreshStatus::Unknown), Color::DarkGrey);
    }

    #[test]
    fn cached_rows_are_marked_in_sector_table() {
        let periods = RsPeriods::new(2, 5, 10).unwrap();
        let bench = series(&trend(20, 0.5));
        let mut row = evaluate(&inst("METAL"), &series(&trend(20, 1.0)), &bench, periods, Utc::now())
            .unwrap();
        row.cached = true;

        let mut table = sector_table(&[row], periods);
        table.set_width(400);
        assert!(table.to_string().contains("METAL (cached)"));
    }

    #[test]
    fn never_refreshed_shows_dash_for_age() {
        let records = vec![RefreshRecord::never(DatasetKey::Sectors)];
        let mut table = refresh_status_table(&records, &[-1]);
        table.set_width(400);
        let rendered = table.to_string();
        assert!(rendered.contains("Never"));
        assert!(rendered.contains("sectors"));
    }
}
