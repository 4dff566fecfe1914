//! Consumer-group collection lifecycle: the two retry-transport variants
//! (`KafkaCollection`, `KafkaDbCollection`) share this `Collection` trait so
//! `Runner` can treat either uniformly.

pub mod kafka_collection;
pub mod kafka_db_collection;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::RunnerError;

pub use kafka_collection::KafkaCollection;
pub use kafka_db_collection::KafkaDbCollection;

#[async_trait]
pub trait Collection: Send {
    async fn start(
        &mut self,
        cancel: CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<(), RunnerError>;

    fn close(&mut self);
}
