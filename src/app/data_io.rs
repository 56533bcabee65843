use std::fs::File;
use std::io::{self, Write};

use serde::Serialize;

use super::store::StoredListing;
use super::types::{DataFormat, Listing};

const CSV_HEADERS: [&str; 4] = ["title", "link", "price", "first_seen_at"];

#[derive(Debug, Clone, Serialize)]
struct ExportRecord<'a> {
    title: &'a str,
    link: &'a str,
    price: i64,
    first_seen_at: &'a str,
}

impl<'a> From<&'a StoredListing> for ExportRecord<'a> {
    fn from(row: &'a StoredListing) -> Self {
        Self {
            title: &row.title,
            link: &row.link,
            price: row.price,
            first_seen_at: &row.first_seen_at,
        }
    }
}

struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let file = File::create(output_path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    fn write_row(&mut self, row: &StoredListing) -> io::Result<()> {
        let rec = ExportRecord::from(row);
        let price = rec.price.to_string();
        self.writer
            .write_record([rec.title, rec.link, price.as_str(), rec.first_seen_at])?;
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct JsonSink {
    file: File,
    first: bool,
    closed: bool,
}

impl JsonSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let mut file = File::create(output_path)?;
        file.write_all(b"[\n")?;
        Ok(Self {
            file,
            first: true,
            closed: false,
        })
    }

    fn write_row(&mut self, row: &StoredListing) -> io::Result<()> {
        if !self.first {
            self.file.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.file, &ExportRecord::from(row)).map_err(io::Error::other)?;
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        if !self.closed {
            if self.first {
                self.file.write_all(b"]\n")?;
            } else {
                self.file.write_all(b"\n]\n")?;
            }
            self.closed = true;
        }
        self.file.flush()
    }
}

impl Drop for JsonSink {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

enum OutputSink {
    Csv(CsvSink),
    Json(JsonSink),
}

impl OutputSink {
    fn new(output_path: &str, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(OutputSink::Csv(CsvSink::new(output_path)?)),
            DataFormat::Json => Ok(OutputSink::Json(JsonSink::new(output_path)?)),
        }
    }

    fn write_row(&mut self, row: &StoredListing) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.write_row(row),
            OutputSink::Json(sink) => sink.write_row(row),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.finalize(),
            OutputSink::Json(sink) => sink.finalize(),
        }
    }
}

pub fn detect_data_format(path: &str, fallback: DataFormat) -> DataFormat {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        DataFormat::Json
    } else if lower.ends_with(".csv") {
        DataFormat::Csv
    } else {
        fallback
    }
}

/// Writes every row to `output_path`, returning how many were written.
pub fn export_listings(
    output_path: &str,
    format: DataFormat,
    rows: &[StoredListing],
) -> io::Result<usize> {
    let mut sink = OutputSink::new(output_path, format)?;
    for row in rows {
        sink.write_row(row)?;
    }
    sink.finalize()?;
    Ok(rows.len())
}

pub fn print_listings(out: &mut impl Write, listings: &[Listing]) -> io::Result<()> {
    for listing in listings {
        writeln!(
            out,
            "Title: {}, Link: {}, Price: {}",
            listing.title, listing.link, listing.price
        )?;
    }
    Ok(())
}
