//! Per-nodule CSV table.
//!
//! One line per nodule, in red, green, mixed order:
//!
//! ```text
//! Roi,Area,Color,Red Pixel Count,Green Pixel Count,circularity
//! 1,412,Red,412,0,0.87
//! 2_1,590,Red,590,0,0.31
//! 2_2,590,Red,590,0,0.31
//! 3,388,Green,0,388,0.91
//! 2_3,655,Mixed,301,354,0.74
//! ```
//!
//! ROIs are numbered from 1 across all three tables. A clump expands to
//! one `n_k` line per nodule with the area divided evenly. A clump that
//! lent a nodule to a mixed region loses one line, and that mixed region
//! takes the next `n_k` name instead of a number of its own.
//!
//! This is a pure function with no I/O: it returns a `String`.

use nodule_core::{Channel, ChannelTable, NoduleResult, RegionRow};

/// Column names, in order.
pub const CSV_HEADER: [&str; 6] = [
    "Roi",
    "Area",
    "Color",
    "Red Pixel Count",
    "Green Pixel Count",
    "circularity",
];

/// Errors that can occur while writing a table.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The CSV writer failed.
    #[error("failed to write CSV: {0}")]
    Csv(#[from] csv::Error),

    /// Buffered output could not be flushed.
    #[error("failed to flush CSV output: {0}")]
    Flush(String),

    /// The written bytes were not valid UTF-8.
    #[error("CSV output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// One output line.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    /// ROI label: `"3"` or, for clump members, `"3_2"`.
    pub roi: String,
    /// Area in pixels.
    pub area: u32,
    /// Colour class.
    pub channel: Channel,
    /// Pixels counted as red.
    pub red_pixels: u32,
    /// Pixels counted as green.
    pub green_pixels: u32,
    /// Circularity of the source region, if measured.
    pub circularity: Option<f64>,
}

/// Expand a result into per-nodule lines.
#[must_use]
pub fn rows(result: &NoduleResult) -> Vec<CsvRow> {
    let red_offset = 0;
    let green_offset = result.red.rows.len();
    let mixed_offset = green_offset + result.green.rows.len();

    let mut out = Vec::new();
    expand_channel(&result.red, red_offset, &mut out);
    expand_channel(&result.green, green_offset, &mut out);

    for (i, row) in result.mixed.rows.iter().enumerate() {
        let (red_pixels, green_pixels) = row
            .mixed
            .map_or((0, 0), |m| (m.red_pixels, m.green_pixels));
        out.push(CsvRow {
            roi: mixed_label(result, row, mixed_offset + i + 1, red_offset, green_offset),
            area: row.pixel_area,
            channel: Channel::Mixed,
            red_pixels,
            green_pixels,
            circularity: row.circularity,
        });
    }
    out
}

/// Nodules a row contributes to its own colour, after handing one to a
/// mixed region if it did.
fn own_count(row: &RegionRow) -> u32 {
    match &row.clump {
        Some(clump) if clump.has_mixed => row.nodule_count.saturating_sub(1),
        _ => row.nodule_count,
    }
}

fn expand_channel(table: &ChannelTable, offset: usize, out: &mut Vec<CsvRow>) {
    for (i, row) in table.rows.iter().enumerate() {
        let roi = offset + i + 1;
        let count = own_count(row);
        let line = |label: String, area: u32| {
            let (red_pixels, green_pixels) = match table.channel {
                Channel::Green => (0, area),
                _ => (area, 0),
            };
            CsvRow {
                roi: label,
                area,
                channel: table.channel,
                red_pixels,
                green_pixels,
                circularity: row.circularity,
            }
        };
        if count == 1 {
            out.push(line(roi.to_string(), row.pixel_area));
        } else {
            let area = row.pixel_area.checked_div(count).unwrap_or(0);
            out.extend((1..=count).map(|k| line(format!("{roi}_{k}"), area)));
        }
    }
}

fn mixed_label(
    result: &NoduleResult,
    row: &RegionRow,
    own: usize,
    red_offset: usize,
    green_offset: usize,
) -> String {
    let Some(split) = row.mixed.filter(|m| m.is_linked()) else {
        return own.to_string();
    };
    let (table, link, offset) = if split.red_link > split.green_link {
        (&result.red, split.red_link, red_offset)
    } else {
        (&result.green, split.green_link, green_offset)
    };
    let Some(clump_row) = usize::try_from(link)
        .ok()
        .and_then(|i| table.rows.get(i).map(|r| (i, r)))
    else {
        return own.to_string();
    };
    let (index, linked) = clump_row;
    format!("{}_{}", offset + index + 1, own_count(linked) + 1)
}

/// Serialize a result as CSV text with a [`CSV_HEADER`] line.
///
/// # Errors
///
/// Returns [`ExportError`] if the writer fails, which only happens on
/// allocation failure for an in-memory buffer.
pub fn to_csv(result: &NoduleResult) -> Result<String, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for row in rows(result) {
        writer.write_record([
            row.roi,
            row.area.to_string(),
            color_name(row.channel).to_owned(),
            row.red_pixels.to_string(),
            row.green_pixels.to_string(),
            row.circularity.map(|c| c.to_string()).unwrap_or_default(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Flush(e.to_string()))?;
    Ok(String::from_utf8(bytes)?)
}

const fn color_name(channel: Channel) -> &'static str {
    match channel {
        Channel::Red => "Red",
        Channel::Green => "Green",
        Channel::Mixed => "Mixed",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nodule_core::result::{ClumpRow, MixedSplit};
    use nodule_core::Dimensions;

    fn plain(name: &str, area: u32) -> RegionRow {
        RegionRow {
            name: name.to_owned(),
            nodule_count: 1,
            pixel_area: area,
            circularity: Some(0.5),
            clump: None,
            mixed: None,
        }
    }

    fn table(channel: Channel, rows: Vec<RegionRow>) -> ChannelTable {
        ChannelTable {
            channel,
            total_nodule_count: rows.iter().map(|r| r.nodule_count).sum(),
            rows,
        }
    }

    fn result(red: Vec<RegionRow>, green: Vec<RegionRow>, mixed: Vec<RegionRow>) -> NoduleResult {
        NoduleResult {
            dimensions: Dimensions {
                width: 10,
                height: 10,
            },
            red: table(Channel::Red, red),
            green: table(Channel::Green, green),
            mixed: table(Channel::Mixed, mixed),
        }
    }

    #[test]
    fn header_only_for_empty_result() {
        let csv = to_csv(&result(vec![], vec![], vec![])).unwrap();
        assert_eq!(
            csv,
            "Roi,Area,Color,Red Pixel Count,Green Pixel Count,circularity\n"
        );
    }

    #[test]
    fn singles_are_numbered_across_tables() {
        let out = rows(&result(
            vec![plain("r 0", 400)],
            vec![plain("g 0", 350), plain("g 1", 500)],
            vec![],
        ));
        let labels: Vec<_> = out.iter().map(|r| r.roi.as_str()).collect();
        assert_eq!(labels, ["1", "2", "3"]);
        assert_eq!((out[1].red_pixels, out[1].green_pixels), (0, 350));
        assert_eq!((out[0].red_pixels, out[0].green_pixels), (400, 0));
    }

    #[test]
    fn clump_expands_into_member_lines() {
        let mut clump = plain("r 1", 900);
        clump.nodule_count = 3;
        clump.clump = Some(ClumpRow {
            nodule_count: 3,
            area_per_nodule: 300.0,
            has_mixed: false,
        });
        let out = rows(&result(vec![plain("r 0", 400), clump], vec![], vec![]));
        let labels: Vec<_> = out.iter().map(|r| r.roi.as_str()).collect();
        assert_eq!(labels, ["1", "2_1", "2_2", "2_3"]);
        assert!(out[1..].iter().all(|r| r.area == 300));
    }

    #[test]
    fn linked_mixed_row_continues_clump_numbering() {
        let mut clump = plain("g 0", 900);
        clump.nodule_count = 3;
        clump.clump = Some(ClumpRow {
            nodule_count: 3,
            area_per_nodule: 300.0,
            has_mixed: true,
        });
        let mut mixed = plain("m 0", 500);
        mixed.mixed = Some(MixedSplit {
            red_pixels: 200,
            green_pixels: 300,
            red_link: -1,
            green_link: 0,
        });
        let nodules = result(vec![plain("r 0", 400)], vec![clump], vec![mixed]);
        let out = rows(&nodules);
        assert_eq!(
            usize::try_from(nodules.summary().total()).unwrap(),
            out.len(),
            "one line per counted nodule"
        );
        let labels: Vec<_> = out.iter().map(|r| r.roi.as_str()).collect();
        assert_eq!(labels, ["1", "2_1", "2_2", "2_3"]);
        assert_eq!(out[1].area, 450, "claimed nodule leaves two lines");
        let last = out.last().unwrap();
        assert_eq!(last.channel, Channel::Mixed);
        assert_eq!((last.red_pixels, last.green_pixels), (200, 300));
    }

    #[test]
    fn unlinked_mixed_row_gets_its_own_number() {
        let mut mixed = plain("m 0", 120);
        mixed.mixed = Some(MixedSplit {
            red_pixels: 20,
            green_pixels: 100,
            red_link: -1,
            green_link: -1,
        });
        let csv = to_csv(&result(vec![plain("r 0", 400)], vec![], vec![mixed])).unwrap();
        let last = csv.lines().last().unwrap();
        assert_eq!(last, "2,120,Mixed,20,100,0.5");
    }
}
