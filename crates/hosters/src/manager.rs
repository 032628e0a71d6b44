use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::decrypt::{DecryptionClient, DecryptionHealth};
use crate::error::HosterError;
use crate::hoster::Hoster;
use crate::hosters::{Filemoon, Megacloud, Vidplay};
use crate::source::StreamSource;

type HosterConstructor = fn(Client) -> Result<Arc<dyn Hoster>, HosterError>;

macro_rules! hoster_registry {
    ( $( $builder:path ),+ $(,)? ) => {
        &[
            $(
                |client: Client| -> Result<Arc<dyn Hoster>, HosterError> {
                    Ok(Arc::new($builder(client)?))
                },
            )+
        ]
    };
}

// Built-in hosters, in match priority order.
static BUILTIN_HOSTERS: &[HosterConstructor] = hoster_registry![
    Megacloud::new,
    Vidplay::new,
    Filemoon::new,
];

/// Sources decoded from one embed URL.
#[derive(Debug, Clone, Serialize)]
pub struct HosterResolution {
    pub hoster: String,
    pub sources: Vec<StreamSource>,
    /// Origin of the embed page; most CDNs require it as the playback referer.
    pub referer: String,
}

/// Registry of hosters plus the shared decryption client.
pub struct HosterManager {
    client: Client,
    decryptor: Arc<dyn DecryptionClient>,
    hosters: RwLock<Vec<Arc<dyn Hoster>>>,
}

impl HosterManager {
    pub fn new(client: Client, decryptor: Arc<dyn DecryptionClient>) -> Self {
        Self {
            client,
            decryptor,
            hosters: RwLock::new(Vec::new()),
        }
    }

    /// A manager with every built-in hoster registered.
    pub fn with_defaults(
        client: Client,
        decryptor: Arc<dyn DecryptionClient>,
    ) -> Result<Self, HosterError> {
        let manager = Self::new(client, decryptor);
        for constructor in BUILTIN_HOSTERS {
            manager.register(constructor(manager.client.clone())?);
        }
        Ok(manager)
    }

    /// Register a hoster. A hoster with the same id replaces the old one.
    pub fn register(&self, hoster: Arc<dyn Hoster>) {
        let mut hosters = self.hosters.write();
        if let Some(existing) = hosters.iter_mut().find(|h| h.id() == hoster.id()) {
            warn!(hoster = %hoster.id(), "Replacing registered hoster");
            *existing = hoster;
        } else {
            info!(hoster = %hoster.id(), "Registered hoster");
            hosters.push(hoster);
        }
    }

    pub fn hoster_ids(&self) -> Vec<String> {
        self.hosters.read().iter().map(|h| h.id().to_string()).collect()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn find_hoster(&self, url: &Url) -> Option<Arc<dyn Hoster>> {
        self.hosters
            .read()
            .iter()
            .find(|h| h.can_handle(url))
            .cloned()
    }

    pub fn find_hoster_str(&self, url: &str) -> Option<Arc<dyn Hoster>> {
        Url::parse(url).ok().and_then(|u| self.find_hoster(&u))
    }

    /// Resolve an embed URL.
    ///
    /// `Ok(None)` means no registered hoster handles the URL. The hoster's own
    /// timeout applies and `cancel` aborts the call with [`HosterError::Cancelled`].
    pub async fn resolve(
        &self,
        embed: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<HosterResolution>, HosterError> {
        let url = Url::parse(embed).map_err(|e| HosterError::InvalidUrl(format!("{embed}: {e}")))?;

        let Some(hoster) = self.find_hoster(&url) else {
            debug!(url = %url, "No hoster matches embed url");
            return Ok(None);
        };

        let timeout = hoster.config().timeout();
        let timeout_ms = hoster.config().timeout_ms;
        debug!(hoster = %hoster.id(), url = %url, "Resolving embed");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HosterError::Cancelled),
            result = tokio::time::timeout(timeout, hoster.resolve(&url, self.decryptor.as_ref())) => result,
        };

        let sources = result.map_err(|_| HosterError::Timeout {
            hoster: hoster.id().to_string(),
            timeout_ms,
        })??;

        Ok(Some(HosterResolution {
            hoster: hoster.id().to_string(),
            sources,
            referer: format!("{}/", url.origin().ascii_serialization()),
        }))
    }

    pub async fn decryption_health(&self) -> DecryptionHealth {
        self.decryptor.health().await
    }
}
