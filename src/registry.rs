//! Client registry: one live client per server
//!
//! Owned by the application's composition root rather than held in static
//! state. `find_or_create` runs under a single async lock, so two callers
//! asking for the same server concurrently share one connection.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::client::ReasonerClient;
use crate::config::ClientConfig;
use crate::transport::TransportFactory;
use crate::types::{Result, SessionIdentity};

#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<SessionIdentity, Arc<ReasonerClient>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live client for `config`'s server, connecting one if there is
    /// none or the existing one was closed
    pub async fn find_or_create(
        &self,
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Arc<ReasonerClient>> {
        let identity = config.identity();
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(&identity) {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
            debug!(server = %identity, "Replacing closed client");
        }

        let client = Arc::new(ReasonerClient::connect(config, factory).await?);
        clients.insert(identity.clone(), Arc::clone(&client));
        info!(server = %identity, "Registered reasoning client");
        Ok(client)
    }

    pub async fn get(&self, identity: &SessionIdentity) -> Option<Arc<ReasonerClient>> {
        self.clients
            .lock()
            .await
            .get(identity)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Close and forget the client for `identity`
    pub async fn close(&self, identity: &SessionIdentity) -> bool {
        let removed = self.clients.lock().await.remove(identity);
        match removed {
            Some(client) => {
                client.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let clients: Vec<_> = self.clients.lock().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
