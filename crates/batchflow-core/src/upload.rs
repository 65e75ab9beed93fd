//! Object-storage upload boundary (spec.md §6) and the CSV streaming
//! writer that feeds it (spec.md §4.5 step 4b). Rows are never fully
//! materialized: the procedure's row stream is formatted incrementally
//! into bounded byte chunks and handed to the uploader as a stream.

use crate::error::{BatchflowError, Result, UploadErrorKind};
use crate::export::ExportProcedure;
use crate::model::UnitKey;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

/// A single object-storage object written from a chunked byte stream.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn put_stream(&self, path: &str, chunks: BoxStream<'static, Result<Bytes>>)
        -> Result<()>;
}

/// Target size for one buffered chunk before it is handed off to the
/// uploader. Kept well under typical multipart-upload minimums so the
/// producer side never needs to know the uploader's own chunking scheme.
const CHUNK_TARGET_BYTES: usize = 256 * 1024;

/// Streams every row the export procedure yields for `key` into CSV text
/// and uploads the result as a single object at `path`. Returns once the
/// upload has been durably acknowledged (spec.md §4.5: "the unit is
/// considered successful only after the object-storage upload is durably
/// acknowledged").
pub async fn stream_csv_to_uploader(
    export: &dyn ExportProcedure,
    uploader: &dyn Uploader,
    key: &UnitKey,
    path: &str,
) -> Result<()> {
    let mut rows = export.stream(key).await?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes>>(4);
    let upload = uploader.put_stream(path, ReceiverStream::new(rx).boxed());

    let produce = async move {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::<u8>::new());

        while let Some(row) = rows.next().await {
            match row {
                Ok(row) => {
                    if let Err(e) = writer.write_record(&row.0) {
                        let _ = tx
                            .send(Err(BatchflowError::Upload {
                                kind: UploadErrorKind::ClientError,
                                source: e.into(),
                            }))
                            .await;
                        return;
                    }
                    if writer.get_ref().len() >= CHUNK_TARGET_BYTES {
                        let chunk = std::mem::take(writer.get_mut());
                        if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        if let Err(e) = writer.flush() {
            let _ = tx
                .send(Err(BatchflowError::Upload {
                    kind: UploadErrorKind::ClientError,
                    source: e.into(),
                }))
                .await;
            return;
        }
        let tail = writer.into_inner().unwrap_or_default();
        if !tail.is_empty() {
            let _ = tx.send(Ok(Bytes::from(tail))).await;
        }
    };

    let (_, upload_result) = tokio::join!(produce, upload);
    upload_result
}
