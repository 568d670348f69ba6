use std::sync::Arc;

use tracing::info;
use weft_comm::Communicator;
use weft_engine::Scheduler;
use weft_store::KvStore;

use crate::config::ConnectorConfig;
use crate::error::ConnectorResult;
use crate::file::{File, FileContext};
use crate::progress::ExecContext;

/// Entry point: one participant's view of a store and its peers.
///
/// Every file opened through a connector shares the connector's scheduler
/// and messaging context, so one progress pump drives all of them.
pub struct Connector {
    config: ConnectorConfig,
    store: Arc<dyn KvStore>,
    exec: ExecContext,
}

impl Connector {
    pub fn new(
        config: ConnectorConfig,
        store: Arc<dyn KvStore>,
        comm: Arc<dyn Communicator>,
    ) -> ConnectorResult<Self> {
        config.validate()?;
        info!(
            rank = comm.rank(),
            size = comm.size(),
            group = %config.group,
            "connector initialized"
        );
        let exec = ExecContext::new(Scheduler::new("connector"), comm);
        Ok(Self {
            config,
            store,
            exec,
        })
    }

    /// Open the container `label`, creating it first when `create` is set.
    ///
    /// Collective: every participant must call this together.
    pub fn open_file(&self, label: &str, create: bool) -> ConnectorResult<File> {
        let ctx = FileContext::new(label, self.store.clone(), self.exec.clone(), self.config.clone());
        let mut file = File::new(ctx);
        file.open(create)?;
        Ok(file)
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn exec(&self) -> &ExecContext {
        &self.exec
    }

    pub fn rank(&self) -> usize {
        self.exec.comm().rank()
    }

    pub fn size(&self) -> usize {
        self.exec.comm().size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectorError;
    use uuid::Uuid;
    use weft_comm::SoloComm;
    use weft_store::InMemoryKvStore;
    use weft_types::FailureCode;

    fn config(pool: Uuid) -> ConnectorConfig {
        ConnectorConfig {
            pool,
            ..ConnectorConfig::default()
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let bad = ConnectorConfig {
            key_prefetch_size: 0,
            ..ConnectorConfig::default()
        };
        let err = Connector::new(bad, Arc::new(InMemoryKvStore::new()), Arc::new(SoloComm));
        assert!(matches!(err, Err(ConnectorError::Config(_))));
    }

    #[test]
    fn open_and_close_file() {
        let pool = Uuid::new_v4();
        let store = Arc::new(InMemoryKvStore::with_pool(pool));
        let connector = Connector::new(config(pool), store.clone(), Arc::new(SoloComm)).unwrap();
        assert_eq!((connector.rank(), connector.size()), (0, 1));

        let file = connector.open_file("data", true).unwrap();
        assert_eq!(file.query().unwrap().containers, 1);
        file.close().unwrap();
        assert_eq!(store.open_handles(), 0);
    }

    #[test]
    fn missing_container_fails_open() {
        let pool = Uuid::new_v4();
        let store = Arc::new(InMemoryKvStore::with_pool(pool));
        let connector = Connector::new(config(pool), store.clone(), Arc::new(SoloComm)).unwrap();
        match connector.open_file("absent", false) {
            Err(ConnectorError::OperationFailed { code, task }) => {
                assert!(matches!(code, FailureCode::Store(_)));
                assert_eq!(task, "container open");
            }
            other => panic!("expected a failed open, got {other:?}"),
        }
        // The half-open file gave its pool connection back on drop.
        assert_eq!(store.open_handles(), 0);
    }

    #[test]
    fn nil_pool_is_a_bad_value() {
        let store = Arc::new(InMemoryKvStore::new());
        let connector = Connector::new(ConnectorConfig::default(), store, Arc::new(SoloComm)).unwrap();
        match connector.open_file("data", true) {
            Err(ConnectorError::OperationFailed { code, .. }) => assert_eq!(code, FailureCode::BadValue),
            other => panic!("expected a failed open, got {other:?}"),
        }
    }
}
