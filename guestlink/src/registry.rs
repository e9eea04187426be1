use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::client::AgentClient;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::transport::AgentAddress;

/// One live client per guest. Registering a guest again replaces and
/// closes the previous client.
pub struct AgentRegistry {
    config: ClientConfig,
    clients: RwLock<HashMap<String, Arc<AgentClient>>>,
}

impl AgentRegistry {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub async fn connect(&self, guest_id: &str, address: &AgentAddress) -> Result<Arc<AgentClient>> {
        let client = AgentClient::connect(address, self.config.clone()).await?;
        info!(guest_id, %address, "guest agent registered");
        Ok(self.insert(guest_id, client).await)
    }

    /// Register an already-built client, closing any it supersedes.
    pub async fn insert(&self, guest_id: &str, client: AgentClient) -> Arc<AgentClient> {
        let client = Arc::new(client);
        let previous = self
            .clients
            .write()
            .await
            .insert(guest_id.to_string(), client.clone());
        if let Some(previous) = previous {
            info!(guest_id, "closing superseded guest agent connection");
            previous.close().await;
        }
        client
    }

    /// The client for `guest_id`, if it is registered and still connected.
    pub async fn get(&self, guest_id: &str) -> Option<Arc<AgentClient>> {
        self.clients
            .read()
            .await
            .get(guest_id)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    pub async fn remove(&self, guest_id: &str) -> bool {
        let removed = self.clients.write().await.remove(guest_id);
        match removed {
            Some(client) => {
                client.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn guests(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
