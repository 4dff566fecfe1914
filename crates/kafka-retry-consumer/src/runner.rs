//! Single entry point: selects a retry transport, wires every collaborator,
//! and waits for all workers to exit.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::collection::{Collection, KafkaCollection, KafkaDbCollection};
use crate::config::Config;
use crate::consumer::HandlerMap;
use crate::error::RunnerError;
use crate::retry::{DbRetries, PgRetryRepository, RetryManager};
use crate::topic_chain::{DefaultTopicNameGenerator, TopicChain, TopicNameGenerator};

pub struct Runner;

impl Runner {
    /// Validates configuration and handlers, builds the selected transport's
    /// collaborators, starts every worker, and blocks until `cancel` fires
    /// and every spawned task has exited.
    pub async fn run(
        config: Config,
        handlers: HandlerMap,
        cancel: CancellationToken,
    ) -> Result<(), RunnerError> {
        Self::run_with_name_generator(config, handlers, Arc::new(DefaultTopicNameGenerator), cancel).await
    }

    pub async fn run_with_name_generator(
        config: Config,
        handlers: HandlerMap,
        name_generator: Arc<dyn TopicNameGenerator>,
        cancel: CancellationToken,
    ) -> Result<(), RunnerError> {
        if handlers.is_empty() {
            return Err(RunnerError::NoHandlers);
        }
        if config.source_topics.is_empty() {
            return Err(RunnerError::NoTopicsConfigured);
        }
        config.validate()?;

        let retry_intervals = config
            .retry_intervals_seconds
            .iter()
            .map(|secs| std::time::Duration::from_secs(*secs))
            .collect::<Vec<_>>();

        let chain = Arc::new(TopicChain::new(
            &config.kafka.group,
            &config.source_topics,
            &retry_intervals,
            name_generator,
        )?);
        let handlers = Arc::new(handlers);
        let db_retries = DbRetries::from_config(&config.source_topics, &retry_intervals);

        let tasks = TaskTracker::new();

        let mut collection: Box<dyn Collection> = if config.use_db_for_retry_queue {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .connect(&config.database.connection_string())
                .await?;
            let repo = PgRetryRepository::new(pool);
            let manager = Arc::new(RetryManager::new(repo, db_retries.clone()));
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);

            Box::new(KafkaDbCollection::new(
                config.kafka.clone(),
                chain,
                handlers,
                db_retries,
                manager,
                clock,
                config.maintenance_interval(),
            ))
        } else {
            Box::new(KafkaCollection::new(config.kafka.clone(), chain, handlers))
        };

        collection.start(cancel.clone(), &tasks).await?;

        tasks.close();
        cancel.cancelled().await;
        tasks.wait().await;

        collection.close();
        info!("runner exited cleanly");

        Ok(())
    }
}
