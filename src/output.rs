use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("could not encode a record as CSV")]
    SerializeCsv,
}

impl Args {
    pub fn to_output(&self, headers: &'static [&'static str]) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match self.format {
            Format::Table => Formatter::Table { comfy: new_table(headers), rows: 0 },
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { wrote_headers: false },
        };
        Ok(Output { path: self.output.clone(), io, headers, formatter })
    }
}

fn new_table(headers: &[&'static str]) -> comfy_table::Table {
    let mut comfy = comfy_table::Table::new();
    comfy
        .set_header(headers.to_vec())
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    comfy
}

/// A stream of records rendered as a table, JSON lines or CSV.
///
/// Table rows are buffered until [`Output::flush`]; the other formats are written as they come.
pub struct Output {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    headers: &'static [&'static str],
    formatter: Formatter,
}

enum Formatter {
    Csv { wrote_headers: bool },
    Table { comfy: comfy_table::Table, rows: usize },
    Jsonl,
}

impl Output {
    pub fn record<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { wrote_headers } => {
                if !*wrote_headers {
                    *wrote_headers = true;
                    let headers = self.headers;
                    self.write_csv_row(headers)?;
                }
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy, rows } => {
                comfy.add_row(table_row());
                *rows += 1;
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record()).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
            }
        }
        Ok(())
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        // Worst case every byte is a quote that gets doubled, plus the surrounding quotes.
        let max_len = 2 + 2 * values.iter().map(|v| v.as_ref().len()).max().unwrap_or(0);
        let mut buffer = vec![0; max_len];
        let mut line = Vec::new();
        let mut writer = csv_core::Writer::new();
        for (index, value) in values.iter().enumerate() {
            if index != 0 {
                let (WriteResult::InputEmpty, n) = writer.delimiter(&mut buffer) else {
                    return Err(Error::SerializeCsv);
                };
                line.extend_from_slice(&buffer[..n]);
            }
            let input = value.as_ref().as_bytes();
            let (WriteResult::InputEmpty, read, n) = writer.field(input, &mut buffer) else {
                return Err(Error::SerializeCsv);
            };
            if read != input.len() {
                return Err(Error::SerializeCsv);
            }
            line.extend_from_slice(&buffer[..n]);
        }
        let (WriteResult::InputEmpty, n) = writer.terminator(&mut buffer) else {
            return Err(Error::SerializeCsv);
        };
        line.extend_from_slice(&buffer[..n]);
        self.io.write_all(&line).map_err(|e| self.write_error(e))
    }

    /// Write out everything produced so far. A table is printed and a fresh one started.
    pub fn flush(&mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy, rows } = &mut self.formatter {
            if *rows != 0 {
                let table = std::mem::replace(comfy, new_table(self.headers));
                *rows = 0;
                writeln!(self.io, "{table}").map_err(|e| self.write_error(e))?;
            }
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        self.flush()
    }
}
