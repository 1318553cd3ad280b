//! Reading job lists and writing results.
//!
//! Job lists may be JSONL or CSV, from a file or standard input. We detect the
//! format from the file extension, or by peeking at the first byte of the
//! input. Results are always written as JSONL.

use std::{pin::Pin, sync::Arc, task::Context};

use futures::{StreamExt as _, TryStreamExt as _, pin_mut};
use peekable::tokio::AsyncPeekable;
use serde_json::Map;
use tokio::{
    fs::File,
    io::{
        AsyncBufRead, AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _,
        BufReader, BufWriter, ReadBuf,
    },
};
use tokio_stream::wrappers::LinesStream;

use crate::prelude::*;

use super::BoxedStream;

/// An async reader that knows whether its input is JSONL or CSV.
pub struct SmartReader {
    /// Does our input look like JSONL?
    is_jsonl: bool,

    /// A human-readable description of the input source, for error messages.
    description: String,

    /// Our reader, pinned because async reads may hold pointers into it.
    reader: Pin<Box<dyn AsyncBufRead + Unpin + Send + Sync + 'static>>,
}

impl SmartReader {
    /// Create a new `SmartReader` from an existing reader, peeking at the
    /// first byte to decide on the format.
    pub async fn new_from_reader(
        description: String,
        reader: impl AsyncRead + Unpin + Send + Sync + 'static,
    ) -> Result<Self> {
        let reader = BufReader::new(reader);
        let mut peekable = AsyncPeekable::new(Box::new(reader));
        let mut buffer = vec![0; 1];
        let is_jsonl = match peekable.peek_exact(&mut buffer).await {
            Ok(_) => buffer[0] == b'{',
            // Empty input. Either format will produce zero records.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => true,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read from {description}"));
            }
        };
        Ok(Self {
            is_jsonl,
            description,
            reader: Box::pin(BufReader::new(peekable)),
        })
    }

    /// Create a new `SmartReader` from a [`Path`], using the extension to
    /// pick a format.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().unwrap_or_default();
        let is_jsonl = ext == "json" || ext == "jsonl";
        let file = File::open(path)
            .await
            .with_context(|| format!("failed to open file at path: {:?}", path))?;
        Ok(Self {
            is_jsonl,
            description: path.to_string_lossy().into_owned(),
            reader: Box::pin(BufReader::new(file)),
        })
    }

    /// Create a new `SmartReader` from either a [`Path`] or standard input.
    pub async fn new_from_path_or_stdin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::new_from_path(path).await,
            None => {
                let stdin = tokio::io::stdin();
                Self::new_from_reader("stdin".to_owned(), stdin).await
            }
        }
    }

    /// Is our input JSONL?
    pub fn is_jsonl(&self) -> bool {
        self.is_jsonl
    }
}

impl AsyncRead for SmartReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::get_mut(self).reader.as_mut().poll_read(cx, buf)
    }
}

impl AsyncBufRead for SmartReader {
    fn poll_fill_buf(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> std::task::Poll<std::io::Result<&[u8]>> {
        Pin::get_mut(self).reader.as_mut().poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::get_mut(self).reader.as_mut().consume(amt)
    }
}

/// Count the records in a JSONL or CSV file, so we can show a real progress
/// bar. Returns `None` for anything that isn't a regular file, such as a named
/// pipe.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn count_records(path: &Path) -> Result<Option<usize>> {
    if !path.is_file() {
        return Ok(None);
    }

    let reader = SmartReader::new_from_path(path).await?;
    let count = if reader.is_jsonl() {
        LinesStream::new(reader.lines())
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
            .try_fold(0, |acc, _line| async move { Ok(acc + 1) })
            .await?
    } else {
        csv_async::AsyncReaderBuilder::new()
            .create_reader(reader)
            .into_byte_records()
            .try_fold(0, |acc, _record| async move { Ok(acc + 1) })
            .await?
    };
    debug!(count, "counted input records");
    Ok(Some(count))
}

/// A stream of JSON values.
pub type JsonStream = BoxedStream<Result<Value>>;

/// Read JSONL or CSV records from a file or stdin, as JSON objects. CSV
/// columns become string-valued fields named after the header row.
pub async fn read_records(path: Option<&Path>) -> Result<JsonStream> {
    let reader = SmartReader::new_from_path_or_stdin(path).await?;
    let description = Arc::new(reader.description.clone());
    if reader.is_jsonl() {
        let lines = LinesStream::new(reader.lines())
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()));
        Ok(Box::pin(lines.map(move |line| -> Result<Value> {
            let line = line.with_context(|| format!("failed to read {description}"))?;
            serde_json::from_str::<Value>(&line).with_context(|| {
                format!("failed to parse JSON from line in {description}: {line:?}")
            })
        })))
    } else {
        let mut reader = csv_async::AsyncReaderBuilder::new().create_reader(reader);
        let headers = Arc::new(
            reader
                .headers()
                .await
                .with_context(|| format!("failed to read CSV headers from {description}"))?
                .to_owned(),
        );
        Ok(Box::pin(reader.into_records().map(move |record| -> Result<Value> {
            let record = record
                .with_context(|| format!("failed to read CSV record from {description}"))?;
            let map: Map<String, Value> = headers
                .iter()
                .zip(record.iter())
                .map(|(header, value)| (header.to_owned(), Value::String(value.to_owned())))
                .collect();
            Ok(Value::Object(map))
        })))
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub(crate) async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a stream of serializable values as JSONL, to a file or stdout.
pub async fn write_jsonl<T, S>(path: Option<&Path>, stream: S) -> Result<()>
where
    T: Serialize,
    S: futures::Stream<Item = Result<T>>,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let json = serde_json::to_string(&item?).context("failed to serialize output")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("failed to write newline to output")?;
    }
    writer.flush().await.context("failed to flush output")?;
    Ok(())
}
