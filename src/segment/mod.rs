//! Segment management
//!
//! Segments store sealed window records in columnar Parquet format. The
//! schema is fixed: record id, the normalized vector and the window metadata.

use arrow::array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, Float32Builder, RecordBatch, StringArray,
    StringBuilder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use bytes::Bytes;
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter};
use parquet::file::properties::WriterProperties;
use std::sync::Arc;

use crate::types::{IndexRecord, WindowMetadata};
use crate::{Error, Result};

const STRING_COLUMNS: [&str; 4] = ["name", "start_date", "end_date", "document"];
const INDEX_COLUMNS: [&str; 3] = ["start_idx", "end_idx", "window_size"];

/// Segment writer for creating Parquet files
pub struct SegmentWriter {
    dimension: usize,
    pub arrow_schema: Arc<ArrowSchema>,
}

impl SegmentWriter {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidRequest(
                "segment vector dimension must be positive".into(),
            ));
        }
        Ok(Self {
            dimension,
            arrow_schema: arrow_schema(dimension),
        })
    }

    /// Write records to Parquet format
    pub fn write_parquet(&self, records: &[IndexRecord]) -> Result<Bytes> {
        let batch = self.records_to_record_batch(records)?;

        let mut buffer = Vec::new();
        let props = WriterProperties::builder()
            .set_compression(parquet::basic::Compression::SNAPPY)
            .build();

        let mut writer = ArrowWriter::try_new(&mut buffer, self.arrow_schema.clone(), Some(props))?;

        writer.write(&batch)?;
        writer.close()?;

        Ok(Bytes::from(buffer))
    }

    fn records_to_record_batch(&self, records: &[IndexRecord]) -> Result<RecordBatch> {
        let num_rows = records.len();

        let mut id_builder = StringBuilder::with_capacity(num_rows, num_rows * 36);
        let mut vector_builder = Float32Builder::with_capacity(num_rows * self.dimension);
        let mut string_builders: Vec<StringBuilder> = STRING_COLUMNS
            .iter()
            .map(|_| StringBuilder::with_capacity(num_rows, num_rows * 12))
            .collect();
        let mut index_builders: Vec<UInt64Builder> = INDEX_COLUMNS
            .iter()
            .map(|_| UInt64Builder::with_capacity(num_rows))
            .collect();

        for record in records {
            if record.vector.len() != self.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.dimension,
                    got: record.vector.len(),
                });
            }

            id_builder.append_value(&record.id);
            vector_builder.append_slice(&record.vector);

            let m = &record.metadata;
            for (builder, value) in string_builders
                .iter_mut()
                .zip([&m.name, &m.start_date, &m.end_date, &m.document])
            {
                builder.append_value(value);
            }
            for (builder, value) in index_builders
                .iter_mut()
                .zip([m.start_idx, m.end_idx, m.window_size])
            {
                builder.append_value(value as u64);
            }
        }

        let vector_field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            vector_field,
            self.dimension as i32,
            Arc::new(vector_builder.finish()),
            None,
        )?;

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(id_builder.finish()),
            Arc::new(vector_array),
        ];
        for mut builder in string_builders {
            columns.push(Arc::new(builder.finish()));
        }
        for mut builder in index_builders {
            columns.push(Arc::new(builder.finish()));
        }

        RecordBatch::try_new(self.arrow_schema.clone(), columns)
            .map_err(|e| Error::internal(format!("Failed to create RecordBatch: {}", e)))
    }
}

fn arrow_schema(dimension: usize) -> Arc<ArrowSchema> {
    let mut fields = vec![
        Field::new("id", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, false)),
                dimension as i32,
            ),
            false,
        ),
    ];
    for name in STRING_COLUMNS {
        fields.push(Field::new(name, DataType::Utf8, false));
    }
    for name in INDEX_COLUMNS {
        fields.push(Field::new(name, DataType::UInt64, false));
    }
    Arc::new(ArrowSchema::new(fields))
}

/// Segment reader for Parquet files written by [`SegmentWriter`]
pub struct SegmentReader;

impl SegmentReader {
    /// Read records from Parquet bytes
    pub fn read_parquet(data: Bytes) -> Result<Vec<IndexRecord>> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(data)
            .map_err(|e| Error::internal(format!("Failed to create Parquet reader: {}", e)))?;

        let reader = builder
            .build()
            .map_err(|e| Error::internal(format!("Failed to build Parquet reader: {}", e)))?;

        let mut records = Vec::new();

        for batch_result in reader {
            let batch = batch_result
                .map_err(|e| Error::internal(format!("Failed to read batch: {}", e)))?;
            records.extend(Self::record_batch_to_records(&batch)?);
        }

        Ok(records)
    }

    fn record_batch_to_records(batch: &RecordBatch) -> Result<Vec<IndexRecord>> {
        let ids = string_column(batch, "id")?;
        let names = string_column(batch, "name")?;
        let start_dates = string_column(batch, "start_date")?;
        let end_dates = string_column(batch, "end_date")?;
        let documents = string_column(batch, "document")?;
        let start_idx = u64_column(batch, "start_idx")?;
        let end_idx = u64_column(batch, "end_idx")?;
        let window_size = u64_column(batch, "window_size")?;

        let vectors = batch
            .column_by_name("vector")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
            .ok_or_else(|| Error::internal("Vector column is not FixedSizeListArray"))?;

        let mut records = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let values = vectors.value(row);
            let floats = values
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| Error::internal("Vector values are not Float32Array"))?;

            records.push(IndexRecord {
                id: ids.value(row).to_string(),
                vector: floats.values().to_vec(),
                metadata: WindowMetadata {
                    name: names.value(row).to_string(),
                    start_date: start_dates.value(row).to_string(),
                    end_date: end_dates.value(row).to_string(),
                    start_idx: start_idx.value(row) as usize,
                    end_idx: end_idx.value(row) as usize,
                    window_size: window_size.value(row) as usize,
                    document: documents.value(row).to_string(),
                },
            });
        }

        Ok(records)
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::internal(format!("Column {} is missing or not Utf8", name)))
}

fn u64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
        .ok_or_else(|| Error::internal(format!("Column {} is missing or not UInt64", name)))
}
