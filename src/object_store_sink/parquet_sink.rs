use crate::object_store_sink::general::{build_record_batch, is_supported, validate_row};
use crate::record::FieldValue;
use crate::sink::{Batch, BatchSink, SinkError};
use arrow::datatypes::{Schema, SchemaRef};
use chrono::Utc;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path;
use object_store::ObjectStore;
use parquet::arrow::AsyncArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Writes every batch as one parquet object below `root/target`
#[derive(Clone)]
pub struct ParquetSink {
    object_store: Arc<dyn ObjectStore>,
    schema: SchemaRef,
    pub root_dir: String,
}

impl ParquetSink {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        schema: Schema,
        root_dir: &str,
    ) -> Result<Self, SinkError> {
        if let Some(field) = schema
            .fields()
            .iter()
            .find(|f| !is_supported(f.data_type()))
        {
            return Err(SinkError::SchemaMismatch(format!(
                "column {} has unsupported type {}",
                field.name(),
                field.data_type()
            )));
        }
        Ok(ParquetSink {
            object_store,
            schema: Arc::new(schema),
            root_dir: root_dir.trim_end_matches('/').to_string(),
        })
    }

    /// see the object_store docs for the `AZURE_*` variables
    pub fn azure_from_env(schema: Schema, root_dir: &str) -> Result<Self, SinkError> {
        let store = MicrosoftAzureBuilder::from_env()
            .build()
            .map_err(|e| open_error(root_dir, e))?;
        Self::new(Arc::new(store), schema, root_dir)
    }

    /// see the object_store docs for the `AWS_*` variables
    pub fn amazon_s3_from_env(schema: Schema, root_dir: &str) -> Result<Self, SinkError> {
        let store = AmazonS3Builder::from_env()
            .build()
            .map_err(|e| open_error(root_dir, e))?;
        Self::new(Arc::new(store), schema, root_dir)
    }
}

fn open_error(root_dir: &str, e: object_store::Error) -> SinkError {
    SinkError::OpenBatch {
        target: root_dir.to_string(),
        source: e.into(),
    }
}

impl BatchSink for ParquetSink {
    type Batch = ParquetBatch;

    async fn open_batch(&self, target: &str) -> Result<ParquetBatch, SinkError> {
        Ok(ParquetBatch {
            object_store: self.object_store.clone(),
            schema: self.schema.clone(),
            path: create_path(&self.root_dir, target),
            rows: Vec::new(),
        })
    }
}

pub struct ParquetBatch {
    object_store: Arc<dyn ObjectStore>,
    schema: SchemaRef,
    path: Path,
    rows: Vec<Vec<FieldValue>>,
}

impl ParquetBatch {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Batch for ParquetBatch {
    fn append(&mut self, fields: &[FieldValue]) -> Result<(), SinkError> {
        validate_row(&self.schema, fields)?;
        self.rows.push(fields.to_vec());
        Ok(())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    #[tracing::instrument(skip_all, fields(path = %self.path))]
    async fn send(self) -> Result<(), SinkError> {
        let batch = build_record_batch(self.schema.clone(), &self.rows)?;
        write_parquet(&self.object_store, &self.path, &batch)
            .await
            .map_err(SinkError::Send)
    }
}

fn create_path(root_dir: &str, target: &str) -> Path {
    let ts = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
    let id = Uuid::new_v4();
    Path::from(format!("{}/{}/batch_{}_{}.parquet", root_dir, target, ts, id))
}

async fn write_parquet(
    object_store: &Arc<dyn ObjectStore>,
    path: &Path,
    batch: &arrow::array::RecordBatch,
) -> anyhow::Result<()> {
    debug!("Rows in record batch: {}", batch.num_rows());
    let (id, object_store_writer) = object_store.put_multipart(path).await?;

    // WriterProperties can be used to set Parquet file options
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let written = async move {
        let mut writer =
            AsyncArrowWriter::try_new(object_store_writer, batch.schema(), Some(props))?;
        writer.write(batch).await?;
        // writer must be closed to write footer
        writer.close().await?;
        anyhow::Ok(())
    }
    .await;

    if written.is_err() {
        // nothing of a failed batch may become visible
        if let Err(e) = object_store.abort_multipart(path, &id).await {
            warn!("Failed to abort upload of {}: {}", path, e);
        }
    }
    written
}
