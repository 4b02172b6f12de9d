//! Open application tabs and the messages posted to them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type ClientId = u64;

/// Messages posted from the agent to open tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Fresh data landed in the cache after a background refresh or sync
  DataUpdated {
    url: String,
    data: Value,
    /// Epoch milliseconds
    timestamp: i64,
  },
}

struct Client {
  url: String,
  controlled: bool,
  tx: mpsc::UnboundedSender<ClientMessage>,
}

/// Tabs of the application currently connected to the agent.
#[derive(Default)]
pub struct ClientRegistry {
  clients: Mutex<BTreeMap<ClientId, Client>>,
  next_id: AtomicU64,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a tab. Tabs opened before activation stay uncontrolled until
  /// `claim` runs.
  pub fn connect(&self, url: impl Into<String>) -> (ClientId, mpsc::UnboundedReceiver<ClientMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let client = Client {
      url: url.into(),
      controlled: false,
      tx,
    };

    match self.clients.lock() {
      Ok(mut clients) => {
        debug!(client = id, url = %client.url, "Client connected");
        clients.insert(id, client);
      }
      Err(e) => warn!("Client registry lock poisoned: {}", e),
    }

    (id, rx)
  }

  pub fn disconnect(&self, id: ClientId) -> bool {
    self
      .clients
      .lock()
      .map(|mut clients| clients.remove(&id).is_some())
      .unwrap_or(false)
  }

  pub fn len(&self) -> usize {
    self.clients.lock().map(|c| c.len()).unwrap_or(0)
  }

  pub fn is_controlled(&self, id: ClientId) -> bool {
    self
      .clients
      .lock()
      .map(|clients| clients.get(&id).is_some_and(|c| c.controlled))
      .unwrap_or(false)
  }

  /// Take control of every connected tab. Returns how many were newly claimed.
  pub fn claim(&self) -> usize {
    let Ok(mut clients) = self.clients.lock() else {
      return 0;
    };
    let mut claimed = 0;
    for client in clients.values_mut().filter(|c| !c.controlled) {
      client.controlled = true;
      claimed += 1;
    }
    claimed
  }

  /// Post `DATA_UPDATED` to every open tab. Tabs that have gone away are
  /// dropped from the registry. Returns the number of tabs reached.
  pub fn notify(&self, url: &str, data: Value) -> usize {
    let message = ClientMessage::DataUpdated {
      url: url.to_string(),
      data,
      timestamp: Utc::now().timestamp_millis(),
    };

    let Ok(mut clients) = self.clients.lock() else {
      return 0;
    };
    clients.retain(|id, client| {
      let delivered = client.tx.send(message.clone()).is_ok();
      if !delivered {
        debug!(client = id, "Client went away, dropping it");
      }
      delivered
    });

    debug!(url, clients = clients.len(), "Posted DATA_UPDATED");
    clients.len()
  }
}
