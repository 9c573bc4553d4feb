//! Row-to-columnar conversion.
//!
//! The encoder streams decoded records into Arrow builders, flushes a
//! [`RecordBatch`] every `batch_rows` rows and rolls to a new Parquet file
//! every `max_rows_per_file` rows, so memory stays bounded by one batch per
//! column regardless of input size. Files are written to a per-job staging
//! prefix; [`StagedOutput::publish`] moves them to their final prefix.
//!
//! Cells that do not parse as their column's type are written as null and
//! counted, never raised.

use std::{io::Read, sync::Arc};

use arrow::{
    array::{
        ArrayRef, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder, StringBuilder,
        TimestampMicrosecondBuilder,
    },
    datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::NaiveDate;
use encoding_rs::Encoding;
use log::{debug, info};
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};

use crate::{
    data::{Cell, DateOrder, Value, parse_cell},
    error::{LoaderError, LoaderResult},
    io_utils,
    job::Deadline,
    schema::{ColumnDef, ColumnSchema, ColumnType},
    storage::{ObjectStore, ObjectWriter},
};

const CREATED_BY: &str = concat!("csv-lake ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub batch_rows: usize,
    pub max_rows_per_file: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        EncoderSettings {
            batch_rows: crate::config::DEFAULT_BATCH_ROWS,
            max_rows_per_file: crate::config::DEFAULT_MAX_ROWS_PER_FILE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeStats {
    pub rows_processed: u64,
    /// Rows with at least one cell written as null after failing to parse.
    pub rows_coerced_to_null: u64,
    pub cells_coerced_to_null: u64,
    pub bytes_written: u64,
    pub files_written: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub key: String,
    pub file_name: String,
    pub rows: u64,
    pub bytes: u64,
}

/// Files written by one encode pass, not yet visible at their target.
#[derive(Debug, Clone)]
pub struct StagedOutput {
    pub bucket: String,
    pub staging_prefix: String,
    pub files: Vec<StagedFile>,
    pub stats: EncodeStats,
}

impl StagedOutput {
    /// Moves every staged file under `target_prefix` and returns the final
    /// keys. Objects already under `target_prefix` that this output does not
    /// replace are removed first, so the prefix ends up holding exactly the
    /// new files.
    pub fn publish(&self, store: &dyn ObjectStore, target_prefix: &str) -> LoaderResult<Vec<String>> {
        let targets: Vec<String> = self
            .files
            .iter()
            .map(|file| format!("{target_prefix}{}", file.file_name))
            .collect();
        for existing in store.list(&self.bucket, target_prefix)? {
            if !targets.contains(&existing) {
                store.delete(&self.bucket, &existing)?;
            }
        }
        for (file, target) in self.files.iter().zip(&targets) {
            store.rename(&self.bucket, &file.key, target)?;
        }
        store.delete_prefix(&self.bucket, &self.staging_prefix)?;
        debug!(
            "Published {} file(s) to s3://{}/{target_prefix}",
            targets.len(),
            self.bucket
        );
        Ok(targets)
    }

    /// Removes staged files; failures are ignored.
    pub fn discard(&self, store: &dyn ObjectStore) {
        if let Err(err) = store.delete_prefix(&self.bucket, &self.staging_prefix) {
            debug!("Could not clean staging prefix {}: {err}", self.staging_prefix);
        }
    }
}

pub fn arrow_schema(schema: &ColumnSchema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .columns
        .iter()
        .map(|column| Field::new(&column.name, arrow_type(column.data_type), column.nullable))
        .collect();
    Arc::new(Schema::new(fields))
}

fn arrow_type(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::Text => DataType::Utf8,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
    }
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_created_by(CREATED_BY.to_string())
        .build()
}

enum ColumnBuilder {
    Text(StringBuilder),
    Integer(Int64Builder),
    Float(Float64Builder),
    Boolean(BooleanBuilder),
    Date(Date32Builder, DateOrder),
    Timestamp(TimestampMicrosecondBuilder, DateOrder),
}

impl ColumnBuilder {
    fn new(column: &ColumnDef, capacity: usize) -> Self {
        let order = column.date_order.unwrap_or_default();
        match column.data_type {
            ColumnType::Text => ColumnBuilder::Text(StringBuilder::with_capacity(capacity, capacity * 8)),
            ColumnType::Integer => ColumnBuilder::Integer(Int64Builder::with_capacity(capacity)),
            ColumnType::Float => ColumnBuilder::Float(Float64Builder::with_capacity(capacity)),
            ColumnType::Boolean => ColumnBuilder::Boolean(BooleanBuilder::with_capacity(capacity)),
            ColumnType::Date => ColumnBuilder::Date(Date32Builder::with_capacity(capacity), order),
            ColumnType::Timestamp => {
                ColumnBuilder::Timestamp(TimestampMicrosecondBuilder::with_capacity(capacity), order)
            }
        }
    }

    fn column_type(&self) -> (ColumnType, DateOrder) {
        match self {
            ColumnBuilder::Text(_) => (ColumnType::Text, DateOrder::default()),
            ColumnBuilder::Integer(_) => (ColumnType::Integer, DateOrder::default()),
            ColumnBuilder::Float(_) => (ColumnType::Float, DateOrder::default()),
            ColumnBuilder::Boolean(_) => (ColumnType::Boolean, DateOrder::default()),
            ColumnBuilder::Date(_, order) => (ColumnType::Date, *order),
            ColumnBuilder::Timestamp(_, order) => (ColumnType::Timestamp, *order),
        }
    }

    /// Appends one raw cell; returns `true` when it had to be nulled.
    fn append(&mut self, raw: &str) -> bool {
        if let ColumnBuilder::Text(builder) = self {
            builder.append_value(raw);
            return false;
        }
        let (ty, order) = self.column_type();
        let value = match parse_cell(raw, ty, order) {
            Cell::Value(value) => Some(value),
            Cell::Null => None,
            Cell::Invalid => {
                self.append_null();
                return true;
            }
        };
        match (self, value) {
            (ColumnBuilder::Integer(b), Some(Value::Integer(v))) => b.append_value(v),
            (ColumnBuilder::Float(b), Some(Value::Float(v))) => b.append_value(v),
            (ColumnBuilder::Boolean(b), Some(Value::Boolean(v))) => b.append_value(v),
            (ColumnBuilder::Date(b, _), Some(Value::Date(v))) => b.append_value(days_since_epoch(v)),
            (ColumnBuilder::Timestamp(b, _), Some(Value::Timestamp(v))) => {
                b.append_value(v.and_utc().timestamp_micros())
            }
            (builder, _) => builder.append_null(),
        }
        false
    }

    fn append_null(&mut self) {
        match self {
            ColumnBuilder::Text(b) => b.append_null(),
            ColumnBuilder::Integer(b) => b.append_null(),
            ColumnBuilder::Float(b) => b.append_null(),
            ColumnBuilder::Boolean(b) => b.append_null(),
            ColumnBuilder::Date(b, _) => b.append_null(),
            ColumnBuilder::Timestamp(b, _) => b.append_null(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Text(b) => Arc::new(b.finish()),
            ColumnBuilder::Integer(b) => Arc::new(b.finish()),
            ColumnBuilder::Float(b) => Arc::new(b.finish()),
            ColumnBuilder::Boolean(b) => Arc::new(b.finish()),
            ColumnBuilder::Date(b, _) => Arc::new(b.finish()),
            ColumnBuilder::Timestamp(b, _) => Arc::new(b.finish()),
        }
    }
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let days = date.signed_duration_since(NaiveDate::default()).num_days();
    i32::try_from(days).unwrap_or(if days < 0 { i32::MIN } else { i32::MAX })
}

struct OpenFile {
    writer: ArrowWriter<Box<dyn ObjectWriter>>,
    key: String,
    file_name: String,
    rows: u64,
}

pub struct ColumnarEncoder<'a> {
    store: &'a dyn ObjectStore,
    settings: EncoderSettings,
}

impl<'a> ColumnarEncoder<'a> {
    pub fn new(store: &'a dyn ObjectStore, settings: EncoderSettings) -> Self {
        ColumnarEncoder { store, settings }
    }

    /// Encodes every data record of `reader` into Parquet files under
    /// `bucket/staging_prefix`.
    ///
    /// The reader must be positioned after the header row. On error, files
    /// already staged are removed before returning.
    pub fn encode<R: Read>(
        &self,
        reader: &mut csv::Reader<R>,
        encoding: &'static Encoding,
        schema: &ColumnSchema,
        bucket: &str,
        staging_prefix: &str,
        deadline: Deadline,
    ) -> LoaderResult<StagedOutput> {
        let mut output = StagedOutput {
            bucket: bucket.to_string(),
            staging_prefix: staging_prefix.to_string(),
            files: Vec::new(),
            stats: EncodeStats::default(),
        };
        match self.encode_into(reader, encoding, schema, &mut output, deadline) {
            Ok(()) => Ok(output),
            Err(err) => {
                output.discard(self.store);
                Err(err)
            }
        }
    }

    fn encode_into<R: Read>(
        &self,
        reader: &mut csv::Reader<R>,
        encoding: &'static Encoding,
        schema: &ColumnSchema,
        output: &mut StagedOutput,
        deadline: Deadline,
    ) -> LoaderResult<()> {
        if schema.is_empty() {
            return Err(LoaderError::schema("cannot encode a table without columns"));
        }
        let arrow = arrow_schema(schema);
        let batch_rows = self.settings.batch_rows.max(1);
        let max_rows_per_file = self.settings.max_rows_per_file.max(batch_rows) as u64;
        let mut builders: Vec<ColumnBuilder> = schema
            .columns
            .iter()
            .map(|column| ColumnBuilder::new(column, batch_rows))
            .collect();

        let mut record = csv::ByteRecord::new();
        let mut current: Option<OpenFile> = None;
        let mut pending = 0usize;
        let mut data_row = 0usize;

        while reader.read_byte_record(&mut record)? {
            data_row += 1;
            let row = record
                .position()
                .map(|pos| pos.line() as usize)
                .unwrap_or(data_row + 1);
            let fields = io_utils::decode_record(&record, encoding, row)?;
            let mut coerced = 0u64;
            for (builder, value) in builders.iter_mut().zip(&fields) {
                if builder.append(value) {
                    coerced += 1;
                }
            }
            if coerced > 0 {
                output.stats.rows_coerced_to_null += 1;
                output.stats.cells_coerced_to_null += coerced;
            }
            output.stats.rows_processed += 1;
            pending += 1;

            let file_rows = current.as_ref().map_or(0, |file| file.rows) + pending as u64;
            if pending >= batch_rows || file_rows >= max_rows_per_file {
                deadline.check("encode")?;
                self.flush_batch(&arrow, &mut builders, &mut current, output, pending)?;
                pending = 0;
                if current.as_ref().is_some_and(|file| file.rows >= max_rows_per_file) {
                    self.close_file(&mut current, output)?;
                }
            }
        }

        if pending > 0 || (output.files.is_empty() && current.is_none()) {
            deadline.check("encode")?;
            self.flush_batch(&arrow, &mut builders, &mut current, output, pending)?;
        }
        self.close_file(&mut current, output)?;

        info!(
            "Encoded {} row(s) into {} file(s), {} byte(s); {} row(s) had values coerced to null",
            output.stats.rows_processed,
            output.stats.files_written,
            output.stats.bytes_written,
            output.stats.rows_coerced_to_null
        );
        Ok(())
    }

    fn flush_batch(
        &self,
        arrow: &SchemaRef,
        builders: &mut [ColumnBuilder],
        current: &mut Option<OpenFile>,
        output: &StagedOutput,
        rows: usize,
    ) -> LoaderResult<()> {
        let columns: Vec<ArrayRef> = builders.iter_mut().map(ColumnBuilder::finish).collect();
        let batch = RecordBatch::try_new(Arc::clone(arrow), columns)?;
        if current.is_none() {
            *current = Some(self.open_file(arrow, output)?);
        }
        if let Some(file) = current.as_mut() {
            file.writer.write(&batch)?;
            file.rows += rows as u64;
        }
        Ok(())
    }

    fn open_file(&self, arrow: &SchemaRef, output: &StagedOutput) -> LoaderResult<OpenFile> {
        let file_name = format!("part-{:05}.parquet", output.files.len());
        let key = format!("{}{file_name}", output.staging_prefix);
        let sink = self.store.create(&output.bucket, &key)?;
        let writer = ArrowWriter::try_new(sink, Arc::clone(arrow), Some(writer_properties()))?;
        Ok(OpenFile {
            writer,
            key,
            file_name,
            rows: 0,
        })
    }

    fn close_file(
        &self,
        current: &mut Option<OpenFile>,
        output: &mut StagedOutput,
    ) -> LoaderResult<()> {
        let Some(file) = current.take() else {
            return Ok(());
        };
        let sink = file.writer.into_inner()?;
        let bytes = sink.finish()?;
        debug!("Staged {} ({} rows, {bytes} bytes)", file.key, file.rows);
        output.stats.bytes_written += bytes;
        output.stats.files_written += 1;
        output.files.push(StagedFile {
            key: file.key,
            file_name: file.file_name,
            rows: file.rows,
            bytes,
        });
        Ok(())
    }
}
