//! The export procedure boundary (spec.md §6): an opaque streaming row
//! source the core never materializes in full.

use crate::error::Result;
use crate::model::UnitKey;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// One row returned by the export procedure. The procedure output is a row
/// set, not a JSON aggregation. The core treats each row as an ordered
/// list of string cells ready for CSV formatting.
#[derive(Debug, Clone)]
pub struct ExportRow(pub Vec<String>);

#[async_trait]
pub trait ExportProcedure: Send + Sync {
    /// Invokes the export procedure for one unit's natural key and returns
    /// a stream of rows. Implementations must stream from the database
    /// cursor rather than collecting into a `Vec` first.
    async fn stream(&self, key: &UnitKey) -> Result<BoxStream<'static, Result<ExportRow>>>;
}
