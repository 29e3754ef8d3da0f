//! CSV dialect detection and bounded record reading.
//!
//! A [`CsvFile`] samples the head of a seekable stream to pick a delimiter
//! and decide whether the first line is a header, rewinds, and then hands
//! out decoded records tagged with their source line and byte offset.
//! Oversized lines and undecodable bytes are errors, never silently
//! truncated or replaced.

use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

use thiserror::Error;

pub const DEFAULT_SAMPLE_SIZE: usize = 10_000;
pub const DEFAULT_MAX_LINE_SIZE: usize = 10_000;

/// Candidate delimiters in order of preference when scores tie.
pub const DELIMITERS: [u8; 4] = [b',', b'\t', b'|', b' '];

// ---

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("line {line}: invalid {encoding} data in column {column}")]
    Encoding {
        line: u64,
        column: usize,
        encoding: Encoding,
    },

    #[error("line {line}: {size} bytes exceeds the maximum line size of {max}")]
    LineTooLong { line: u64, size: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encoding::Utf8 => f.write_str("UTF-8"),
            Encoding::Latin1 => f.write_str("Latin-1"),
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Encoding::Latin1),
            other => Err(format!("unsupported encoding '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnifferOptions {
    pub sample_size: usize,
    pub max_line_size: usize,
    pub encoding: Encoding,
}

impl Default for SnifferOptions {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
            max_line_size: DEFAULT_MAX_LINE_SIZE,
            encoding: Encoding::Utf8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub delimiter: u8,
    pub quote: u8,
    pub has_header: bool,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            has_header: false,
        }
    }
}

/// One decoded CSV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvRecord {
    /// 1-based source line on which the record starts.
    pub line_num: u64,
    /// Byte offset of the record start.
    pub byte_position: u64,
    pub fields: Vec<String>,
}

/// Guess the dialect of a decoded sample. `complete` says whether the
/// sample holds the whole file; when it does not, the trailing partial line
/// is ignored.
pub fn sniff(sample: &str, complete: bool) -> Dialect {
    // ---
    let mut lines: Vec<&str> = sample.split('\n').collect();
    if !complete && lines.len() > 1 {
        lines.pop();
    }
    let lines: Vec<&str> = lines
        .into_iter()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return Dialect::default();
    }

    let delimiter = detect_delimiter(&lines);
    let rows: Vec<Vec<&str>> = lines.iter().map(|l| split_quoted(l, delimiter)).collect();
    Dialect {
        delimiter,
        has_header: detect_header(&rows),
        ..Dialect::default()
    }
}

fn count_unquoted(line: &str, delimiter: u8) -> usize {
    // ---
    let mut quoted = false;
    let mut count = 0;
    for b in line.bytes() {
        if b == b'"' {
            quoted = !quoted;
        } else if b == delimiter && !quoted {
            count += 1;
        }
    }
    count
}

fn detect_delimiter(lines: &[&str]) -> u8 {
    // ---
    let mut best = (0.0_f64, b',');
    for &candidate in &DELIMITERS {
        let counts: Vec<usize> = lines.iter().map(|l| count_unquoted(l, candidate)).collect();
        let mut modes = std::collections::BTreeMap::new();
        for &c in counts.iter().filter(|&&c| c > 0) {
            *modes.entry(c).or_insert(0usize) += 1;
        }
        let Some((_, &hits)) = modes.iter().max_by_key(|(count, hits)| (**hits, **count)) else {
            continue;
        };
        let score = hits as f64 / lines.len() as f64;
        if score > best.0 {
            best = (score, candidate);
        }
    }
    best.1
}

fn split_quoted(line: &str, delimiter: u8) -> Vec<&str> {
    // ---
    let mut fields = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, b) in line.bytes().enumerate() {
        if b == b'"' {
            quoted = !quoted;
        } else if b == delimiter && !quoted {
            fields.push(line[start..i].trim().trim_matches('"'));
            start = i + 1;
        }
    }
    fields.push(line[start..].trim().trim_matches('"'));
    fields
}

fn is_number(field: &str) -> bool {
    !field.is_empty() && field.parse::<f64>().is_ok()
}

/// Column-wise vote in the spirit of the classic sniffer: a column votes
/// for a header when its first cell breaks the type or width pattern the
/// remaining cells share.
fn detect_header(rows: &[Vec<&str>]) -> bool {
    // ---
    let first = &rows[0];
    if rows.len() == 1 {
        return first.iter().all(|f| !is_number(f));
    }

    let rest = &rows[1..];
    let mut votes = 0i32;
    for (col, head) in first.iter().enumerate() {
        let cells: Vec<&str> = rest.iter().filter_map(|r| r.get(col).copied()).collect();
        if cells.is_empty() {
            continue;
        }
        if cells.iter().all(|c| is_number(c)) {
            votes += if is_number(head) { -1 } else { 1 };
        } else {
            let width = cells[0].len();
            if cells.iter().all(|c| c.len() == width) {
                votes += if head.len() == width { -1 } else { 1 };
            }
        }
    }
    votes > 0
}

/// A CSV stream with a detected dialect.
pub struct CsvFile<R> {
    stream: R,
    dialect: Dialect,
    options: SnifferOptions,
    size: u64,
}

impl<R: Read + Seek> CsvFile<R> {
    /// Sample, sniff and rewind `stream`.
    pub fn open(mut stream: R, options: &SnifferOptions) -> Result<Self, ParseError> {
        // ---
        let size = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;

        let mut sample = Vec::with_capacity(options.sample_size.min(size as usize));
        (&mut stream)
            .take(options.sample_size as u64)
            .read_to_end(&mut sample)?;
        stream.seek(SeekFrom::Start(0))?;

        let complete = sample.len() as u64 >= size;
        let text = decode_sample(&sample, options.encoding)?;
        let dialect = sniff(text.trim_start_matches('\u{feff}'), complete);
        let delimiter = (dialect.delimiter as char).escape_default().to_string();
        tracing::debug!(
            delimiter = %delimiter,
            has_header = dialect.has_header,
            size,
            "sniffed CSV dialect"
        );

        Ok(Self {
            stream,
            dialect,
            options: options.clone(),
            size,
        })
    }
}

impl<R: Read> CsvFile<R> {
    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// Total size of the underlying stream in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn records(self) -> Records<R> {
        Records {
            reader: BufReader::new(self.stream),
            dialect: self.dialect,
            options: self.options,
            line: 0,
            offset: 0,
            done: false,
        }
    }
}

fn decode_sample(sample: &[u8], encoding: Encoding) -> Result<String, ParseError> {
    // ---
    match encoding {
        Encoding::Latin1 => Ok(sample.iter().map(|&b| b as char).collect()),
        Encoding::Utf8 => match std::str::from_utf8(sample) {
            Ok(text) => Ok(text.to_string()),
            // A multi-byte character cut by the sample boundary is fine.
            Err(e) if e.error_len().is_none() => {
                Ok(String::from_utf8_lossy(&sample[..e.valid_up_to()]).into_owned())
            }
            Err(e) => {
                let line = sample[..e.valid_up_to()].iter().filter(|&&b| b == b'\n').count() as u64 + 1;
                Err(ParseError::Encoding {
                    line,
                    column: 0,
                    encoding,
                })
            }
        },
    }
}

fn has_open_quote(bytes: &[u8], quote: u8) -> bool {
    bytes.iter().filter(|&&b| b == quote).count() % 2 == 1
}

/// Lazily decoded records; stops after the first fatal error. Blank lines
/// are skipped but still counted.
pub struct Records<R> {
    reader: BufReader<R>,
    dialect: Dialect,
    options: SnifferOptions,
    line: u64,
    offset: u64,
    done: bool,
}

impl<R: Read> Records<R> {
    /// Append one physical line to `buf`, reading at most one byte past the
    /// size limit. Returns the number of bytes read.
    fn read_physical_line(&mut self, buf: &mut Vec<u8>) -> Result<usize, ParseError> {
        // ---
        let limit = (self.options.max_line_size + 2).saturating_sub(buf.len()) as u64 + 1;
        let n = (&mut self.reader).take(limit).read_until(b'\n', buf)?;
        if n > 0 {
            self.line += 1;
            self.offset += n as u64;
        }
        Ok(n)
    }

    fn decode(&self, raw: &[u8], line: u64) -> Result<String, ParseError> {
        // ---
        match self.options.encoding {
            Encoding::Latin1 => Ok(raw.iter().map(|&b| b as char).collect()),
            Encoding::Utf8 => std::str::from_utf8(raw).map(str::to_string).map_err(|e| {
                let column = raw[..e.valid_up_to()]
                    .iter()
                    .filter(|&&b| b == self.dialect.delimiter)
                    .count();
                ParseError::Encoding {
                    line,
                    column,
                    encoding: Encoding::Utf8,
                }
            }),
        }
    }

    fn split(&self, text: &str) -> Result<Vec<String>, ParseError> {
        // ---
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.dialect.delimiter)
            .quote(self.dialect.quote)
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let mut record = csv::StringRecord::new();
        reader.read_record(&mut record)?;
        Ok(record.iter().map(str::to_string).collect())
    }

    fn read_next(&mut self) -> Result<Option<CsvRecord>, ParseError> {
        // ---
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let line_num = self.line + 1;
            let byte_position = self.offset;

            if self.read_physical_line(&mut buf)? == 0 {
                return Ok(None);
            }
            // A quoted field may span physical lines.
            while has_open_quote(&buf, self.dialect.quote) && buf.len() <= self.options.max_line_size {
                if self.read_physical_line(&mut buf)? == 0 {
                    break;
                }
            }

            let content_len = buf
                .iter()
                .rposition(|&b| b != b'\n' && b != b'\r')
                .map_or(0, |i| i + 1);
            if content_len > self.options.max_line_size {
                return Err(ParseError::LineTooLong {
                    line: line_num,
                    size: content_len,
                    max: self.options.max_line_size,
                });
            }

            let mut text = self.decode(&buf[..content_len], line_num)?;
            if byte_position == 0 {
                text = text.trim_start_matches('\u{feff}').to_string();
            }
            if text.trim().is_empty() {
                continue;
            }

            let fields = self.split(&text)?;
            return Ok(Some(CsvRecord {
                line_num,
                byte_position,
                fields,
            }));
        }
    }
}

impl<R: Read> Iterator for Records<R> {
    type Item = Result<CsvRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        // ---
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
