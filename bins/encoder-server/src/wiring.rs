use std::sync::Arc;
use std::time::Duration;

use encoder_api::StreamStorage;
use encoder_broker_mqtt::{MqttBroker, MqttSettings};
use encoder_cipher_age::AgeCipher;
use encoder_datastore_http::HttpDatastore;
use encoder_engine::{Collaborators, EncoderConfig, EngineError, StorageKind};
use encoder_storage_memory::MemoryStorage;
use encoder_storage_postgres::PostgresStorage;

use crate::error::ServerError;

/// Build the collaborators named by `config`. Nothing is started here.
pub fn collaborators(config: &EncoderConfig) -> Result<Collaborators, ServerError> {
    let storage: Arc<dyn StreamStorage> = match config.storage.kind {
        StorageKind::Memory => {
            tracing::warn!("memory storage selected, streams will not survive a restart");
            Arc::new(MemoryStorage::new())
        }
        StorageKind::Postgres => {
            let url = config.storage.url.as_deref().ok_or_else(|| {
                EngineError::Config("url is required for postgres storage".into()).with_context("[storage]")
            })?;
            Arc::new(
                PostgresStorage::new(url, config.storage.max_connections)
                    .map_err(ServerError::collaborator("storage-postgres"))?,
            )
        }
    };

    let broker = MqttBroker::new(MqttSettings {
        host: config.broker.host.clone(),
        port: config.broker.port,
        client_id: config.broker.client_id.clone(),
        keep_alive: Duration::from_secs(config.broker.keep_alive_secs),
        dispatch_buffer: config.broker.dispatch_buffer,
        qos: config.broker.qos,
        connect_timeout: config.call_timeout(),
    })
    .map_err(ServerError::collaborator("broker-mqtt"))?;

    let datastore = HttpDatastore::new(
        &config.datastore.endpoint,
        Duration::from_millis(config.datastore.timeout_ms),
    )
    .map_err(ServerError::collaborator("datastore-http"))?;

    tracing::info!(
        storage = ?config.storage.kind,
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        datastore = %config.datastore.endpoint,
        "collaborators built"
    );

    Ok(Collaborators {
        storage,
        broker: Arc::new(broker),
        cipher: Arc::new(AgeCipher::new()),
        datastore: Arc::new(datastore),
    })
}
