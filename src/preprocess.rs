use crate::tokenizer::SpanTokenizer;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Text encoding of the input CSV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum InputEncoding {
    #[default]
    Utf8,
    Latin1,
}

/// Options of the `preprocess` subcommand
#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Zero-based index of the column holding the document text
    pub column: usize,
    pub has_headers: bool,
    pub encoding: InputEncoding,
    pub lowercase: bool,
    /// Keep only documents with at least this many tokens
    pub min_length: Option<usize>,
    pub max_instances: Option<usize>,
    /// Count tokens with this `tokenizer.json` instead of whitespace splitting
    pub tokenizer: Option<PathBuf>,
}

impl PreprocessOptions {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(input: P, output: Q) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            column: 1,
            has_headers: true,
            encoding: InputEncoding::default(),
            lowercase: false,
            min_length: None,
            max_instances: None,
            tokenizer: None,
        }
    }
}

/// Counts of what `preprocess` kept and dropped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreprocessStats {
    pub rows: usize,
    pub written: usize,
    pub empty: usize,
    pub too_short: usize,
    pub missing_column: usize,
}

impl PreprocessStats {
    pub fn print(&self) {
        println!("Preprocessing Statistics:");
        println!("  Rows read: {}", self.rows);
        println!("  Documents written: {}", self.written);
        println!("  Skipped (empty): {}", self.empty);
        println!("  Skipped (too short): {}", self.too_short);
        println!("  Skipped (missing column): {}", self.missing_column);
    }
}

/// Collapse all whitespace runs to single spaces, optionally lowercasing
pub fn sanitize_text(text: &str, lowercase: bool) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if lowercase {
        joined.to_lowercase()
    } else {
        joined
    }
}

fn decode(bytes: &[u8], encoding: InputEncoding) -> String {
    match encoding {
        InputEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        // Latin-1 maps every byte to the code point of the same value
        InputEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
    }
}

enum TokenCounter {
    Whitespace,
    Tokenizer(SpanTokenizer),
}

impl TokenCounter {
    fn count(&self, text: &str) -> Result<usize> {
        match self {
            TokenCounter::Whitespace => Ok(text.split_whitespace().count()),
            TokenCounter::Tokenizer(tokenizer) => Ok(tokenizer.tokenize(text)?.len()),
        }
    }
}

/// Read documents from CSV, clean and filter them
pub fn read_documents<R: Read>(
    reader: R,
    options: &PreprocessOptions,
) -> Result<(Vec<String>, PreprocessStats)> {
    let counter = match (&options.tokenizer, options.min_length) {
        (Some(path), Some(_)) => TokenCounter::Tokenizer(SpanTokenizer::from_pretrained(
            &path.display().to_string(),
            usize::MAX,
        )?),
        _ => TokenCounter::Whitespace,
    };

    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(options.has_headers)
        .flexible(true)
        .from_reader(reader);

    let mut stats = PreprocessStats::default();
    let mut documents = Vec::new();
    for (row, record) in csv_reader.byte_records().enumerate() {
        let record = record.with_context(|| format!("Malformed CSV at record {}", row + 1))?;
        stats.rows += 1;

        let Some(field) = record.get(options.column) else {
            stats.missing_column += 1;
            continue;
        };
        let document = sanitize_text(&decode(field, options.encoding), options.lowercase);
        if document.is_empty() {
            stats.empty += 1;
            continue;
        }
        if let Some(min_length) = options.min_length {
            if counter.count(&document)? < min_length {
                stats.too_short += 1;
                continue;
            }
        }
        if options.max_instances.is_some_and(|max| documents.len() >= max) {
            break;
        }
        documents.push(document);
    }
    stats.written = documents.len();
    Ok((documents, stats))
}

/// Write one document per line, creating parent directories as needed
pub fn write_documents(documents: &[String], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let progress_bar = ProgressBar::new(documents.len() as u64);
    if let Ok(style) =
        ProgressStyle::with_template("💾 Writing [{bar:40.cyan/blue}] {pos}/{len} documents")
    {
        progress_bar.set_style(style.progress_chars("#>-"));
    }
    for document in documents {
        writeln!(writer, "{}", document.trim())?;
        progress_bar.inc(1);
    }
    progress_bar.finish_and_clear();
    writer.flush()?;
    Ok(())
}

/// Run the whole CSV → line-delimited corpus conversion
pub fn preprocess(options: &PreprocessOptions) -> Result<PreprocessStats> {
    let input = File::open(&options.input)
        .with_context(|| format!("Failed to open {}", options.input.display()))?;
    let (documents, stats) = read_documents(input, options)?;
    write_documents(&documents, &options.output)?;
    tracing::info!(
        "Wrote {} documents to {}",
        stats.written,
        options.output.display()
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CSV: &str = "id,text\n\
        1,\"  The  first\tdocument\nspans lines \"\n\
        2,\n\
        3,short\n\
        4,Another Document With Words\n";

    #[test]
    fn test_sanitize_text() {
        assert_eq!(sanitize_text("  a\t b\n\nc  ", false), "a b c");
        assert_eq!(sanitize_text("Hello World", true), "hello world");
        assert_eq!(sanitize_text(" \n\t", false), "");
    }

    #[test]
    fn test_read_documents_filters() -> Result<()> {
        let mut options = PreprocessOptions::new("in.csv", "out.txt");
        options.min_length = Some(2);
        let (documents, stats) = read_documents(CSV.as_bytes(), &options)?;

        assert_eq!(
            documents,
            vec![
                "The first document spans lines".to_string(),
                "Another Document With Words".to_string()
            ]
        );
        assert_eq!(stats.rows, 4);
        assert_eq!(stats.empty, 1);
        assert_eq!(stats.too_short, 1);
        Ok(())
    }

    #[test]
    fn test_max_instances_and_lowercase() -> Result<()> {
        let mut options = PreprocessOptions::new("in.csv", "out.txt");
        options.max_instances = Some(1);
        options.lowercase = true;
        let (documents, _) = read_documents(CSV.as_bytes(), &options)?;
        assert_eq!(documents, vec!["the first document spans lines".to_string()]);
        Ok(())
    }

    #[test]
    fn test_latin1_decoding() -> Result<()> {
        let bytes: &[u8] = b"id,text\n1,caf\xe9 cr\xe8me\n";
        let mut options = PreprocessOptions::new("in.csv", "out.txt");
        options.encoding = InputEncoding::Latin1;
        let (documents, _) = read_documents(bytes, &options)?;
        assert_eq!(documents, vec!["café crème".to_string()]);
        Ok(())
    }

    #[test]
    fn test_preprocess_writes_lines() -> Result<()> {
        let dir = TempDir::new()?;
        let input = dir.path().join("in.csv");
        std::fs::write(&input, CSV)?;
        let output = dir.path().join("nested/train.txt");

        let stats = preprocess(&PreprocessOptions::new(&input, &output))?;
        assert_eq!(stats.written, 3);
        let text = std::fs::read_to_string(&output)?;
        assert_eq!(text.lines().count(), 3);
        assert_eq!(text.lines().nth(1), Some("short"));
        Ok(())
    }
}
