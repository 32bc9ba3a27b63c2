//! Token store: hands out credentials that stay valid for at least the
//! refresh skew, refreshing through the provider's exchanger when needed.
//!
//! Refresh is single-flight per provider. Callers serialize on a per-provider
//! async mutex and re-read the store under it, so a caller that waited on
//! someone else's refresh reuses the fresh credential.

pub mod exchange;
pub mod google;
pub mod microsoft;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::models::credential::Credential;
use crate::models::provider::ProviderId;
use crate::retry::RetryPolicy;
use crate::store::StateStore;

use self::exchange::{ExchangeError, TokenExchanger};

pub use self::google::GoogleServiceAccountGrant;
pub use self::microsoft::MicrosoftRefreshGrant;

struct ProviderSlot {
    exchanger: Arc<dyn TokenExchanger>,
    refresh_lock: Mutex<()>,
}

pub struct TokenStore {
    store: Arc<dyn StateStore>,
    slots: HashMap<ProviderId, ProviderSlot>,
    refresh_skew: Duration,
    retry: RetryPolicy,
}

impl TokenStore {
    pub fn new(store: Arc<dyn StateStore>, refresh_skew: Duration, retry: RetryPolicy) -> Self {
        Self {
            store,
            slots: HashMap::new(),
            refresh_skew,
            retry,
        }
    }

    pub fn with_exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.slots.insert(
            exchanger.provider(),
            ProviderSlot {
                exchanger,
                refresh_lock: Mutex::new(()),
            },
        );
        self
    }

    fn slot(&self, provider: ProviderId) -> Result<&ProviderSlot, PipelineError> {
        self.slots
            .get(&provider)
            .ok_or_else(|| PipelineError::AuthExpired {
                provider,
                message: "no token exchange configured".to_string(),
            })
    }

    async fn load(&self, provider: ProviderId) -> Result<Option<Credential>, PipelineError> {
        self.store
            .load_credential(provider)
            .await
            .map_err(PipelineError::Store)
    }

    /// Returns a credential valid for at least the refresh skew, refreshing
    /// and persisting first when the stored one is missing or expiring.
    pub async fn get_valid_credential(
        &self,
        provider: ProviderId,
    ) -> Result<Credential, PipelineError> {
        let slot = self.slot(provider)?;
        let _guard = slot.refresh_lock.lock().await;

        let current = self.load(provider).await?;
        if let Some(credential) = &current {
            if credential.is_fresh_at(Utc::now(), self.refresh_skew) {
                return Ok(credential.clone());
            }
        }
        self.refresh_locked(slot, current).await
    }

    /// Refreshes after the provider rejected `rejected`, unless another caller
    /// already replaced it with a fresh credential.
    pub async fn force_refresh(
        &self,
        provider: ProviderId,
        rejected: &Credential,
    ) -> Result<Credential, PipelineError> {
        let slot = self.slot(provider)?;
        let _guard = slot.refresh_lock.lock().await;

        let current = self.load(provider).await?;
        if let Some(credential) = &current {
            if credential.access_token != rejected.access_token
                && credential.is_fresh_at(Utc::now(), self.refresh_skew)
            {
                return Ok(credential.clone());
            }
        }
        warn!("{provider} rejected a live access token, forcing refresh");
        self.refresh_locked(slot, current).await
    }

    /// Destroys the stored credential. Returns whether one existed.
    /// Providers that can bootstrap (the Google service account) mint a new
    /// credential on next use; the others need interactive consent again.
    pub async fn revoke(&self, provider: ProviderId) -> Result<bool, PipelineError> {
        let _guard = match self.slots.get(&provider) {
            Some(slot) => Some(slot.refresh_lock.lock().await),
            None => None,
        };
        let existed = self
            .store
            .delete_credential(provider)
            .await
            .map_err(PipelineError::Store)?;
        if existed {
            info!("Revoked stored {provider} credential");
        }
        Ok(existed)
    }

    /// Stores a refresh token handed over by the out-of-band consent flow.
    /// An existing credential is kept, since its refresh token may have
    /// rotated past the seeded one. Returns whether the seed was stored.
    pub async fn seed_refresh_token(
        &self,
        provider: ProviderId,
        refresh_token: String,
    ) -> Result<bool, PipelineError> {
        let slot = self.slot(provider)?;
        let _guard = slot.refresh_lock.lock().await;
        if self.load(provider).await?.is_some() {
            return Ok(false);
        }
        let credential = Credential {
            provider_id: provider,
            access_token: String::new(),
            refresh_token: Some(refresh_token),
            expiry_timestamp: DateTime::<Utc>::UNIX_EPOCH,
        };
        self.store
            .save_credential(&credential)
            .await
            .map_err(PipelineError::Store)?;
        info!("Seeded {provider} refresh token from consent handoff");
        Ok(true)
    }

    async fn refresh_locked(
        &self,
        slot: &ProviderSlot,
        current: Option<Credential>,
    ) -> Result<Credential, PipelineError> {
        let provider = slot.exchanger.provider();
        if current.is_none() && !slot.exchanger.can_bootstrap() {
            return Err(PipelineError::AuthExpired {
                provider,
                message: "no stored credential; interactive consent required".to_string(),
            });
        }

        let what = format!("{provider} token exchange");
        let exchanger = &slot.exchanger;
        let stored = current.as_ref();
        let grant = self
            .retry
            .run(&what, || exchanger.exchange(stored))
            .await
            .map_err(|e| exchange_failure(provider, e))?;

        let credential = Credential {
            provider_id: provider,
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .or_else(|| current.and_then(|c| c.refresh_token)),
            expiry_timestamp: Utc::now() + Duration::seconds(grant.expires_in_secs),
        };
        self.store
            .save_credential(&credential)
            .await
            .map_err(PipelineError::Store)?;

        info!(
            "Refreshed {provider} credential, valid until {}",
            credential.expiry_timestamp
        );
        Ok(credential)
    }
}

fn exchange_failure(provider: ProviderId, err: ExchangeError) -> PipelineError {
    match err {
        ExchangeError::Rejected { .. } | ExchangeError::Misconfigured(_) => {
            PipelineError::AuthExpired {
                provider,
                message: err.to_string(),
            }
        }
        ExchangeError::Unavailable(_) => PipelineError::ProviderUnavailable {
            provider,
            message: err.to_string(),
        },
        ExchangeError::Protocol(_) => PipelineError::ProviderProtocol {
            provider,
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::exchange::TokenGrant;
    use crate::errors::ErrorKind;
    use crate::store::FileStateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Exchanger that counts calls and replays scripted outcomes.
    pub(crate) struct FakeExchanger {
        pub provider: ProviderId,
        pub bootstrap: bool,
        pub calls: AtomicU32,
        pub outcomes: StdMutex<Vec<Result<TokenGrant, ExchangeError>>>,
    }

    impl FakeExchanger {
        pub(crate) fn new(provider: ProviderId, bootstrap: bool) -> Self {
            Self {
                provider,
                bootstrap,
                calls: AtomicU32::new(0),
                outcomes: StdMutex::new(Vec::new()),
            }
        }

        pub(crate) fn then(self, outcome: Result<TokenGrant, ExchangeError>) -> Self {
            self.outcomes.lock().unwrap().insert(0, outcome);
            self
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenExchanger for FakeExchanger {
        fn provider(&self) -> ProviderId {
            self.provider
        }

        fn can_bootstrap(&self) -> bool {
            self.bootstrap
        }

        async fn exchange(
            &self,
            _current: Option<&Credential>,
        ) -> Result<TokenGrant, ExchangeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.outcomes.lock().unwrap().pop().unwrap_or(Ok(TokenGrant {
                access_token: format!("access-{n}"),
                refresh_token: Some(format!("refresh-{n}")),
                expires_in_secs: 3600,
            }))
        }
    }

    pub(crate) fn credential(provider: ProviderId, token: &str, expires_in_secs: i64) -> Credential {
        Credential {
            provider_id: provider,
            access_token: token.to_string(),
            refresh_token: Some("refresh-0".to_string()),
            expiry_timestamp: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: std::time::Duration::from_millis(1),
            call_timeout: std::time::Duration::from_secs(5),
        }
    }

    async fn setup(
        exchanger: FakeExchanger,
    ) -> (tempfile::TempDir, Arc<FileStateStore>, Arc<FakeExchanger>, TokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
        let exchanger = Arc::new(exchanger);
        let tokens = TokenStore::new(store.clone(), Duration::seconds(120), quick_retry())
            .with_exchanger(exchanger.clone());
        (dir, store, exchanger, tokens)
    }

    #[tokio::test]
    async fn test_fresh_credential_is_returned_without_exchange() {
        let (_dir, store, exchanger, tokens) =
            setup(FakeExchanger::new(ProviderId::Microsoft, false)).await;
        store
            .save_credential(&credential(ProviderId::Microsoft, "live", 3600))
            .await
            .unwrap();

        let got = tokens.get_valid_credential(ProviderId::Microsoft).await.unwrap();
        assert_eq!(got.access_token, "live");
        assert_eq!(exchanger.calls(), 0);
    }

    #[tokio::test]
    async fn test_expiring_credential_is_refreshed_and_persisted() {
        let (_dir, store, exchanger, tokens) =
            setup(FakeExchanger::new(ProviderId::Microsoft, false)).await;
        // Inside the 120s skew.
        store
            .save_credential(&credential(ProviderId::Microsoft, "stale", 60))
            .await
            .unwrap();

        let got = tokens.get_valid_credential(ProviderId::Microsoft).await.unwrap();
        assert_eq!(got.access_token, "access-1");
        assert_eq!(got.refresh_token.as_deref(), Some("refresh-1"));
        assert!(got.is_fresh_at(Utc::now(), Duration::seconds(120)));
        assert_eq!(exchanger.calls(), 1);

        let persisted = store.load_credential(ProviderId::Microsoft).await.unwrap();
        assert_eq!(persisted, Some(got));
    }

    #[tokio::test]
    async fn test_unrotated_refresh_token_is_kept() {
        let (_dir, store, _exchanger, tokens) = setup(
            FakeExchanger::new(ProviderId::Microsoft, false).then(Ok(TokenGrant {
                access_token: "new".to_string(),
                refresh_token: None,
                expires_in_secs: 3600,
            })),
        )
        .await;
        store
            .save_credential(&credential(ProviderId::Microsoft, "stale", 0))
            .await
            .unwrap();

        let got = tokens.get_valid_credential(ProviderId::Microsoft).await.unwrap();
        assert_eq!(got.refresh_token.as_deref(), Some("refresh-0"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let (_dir, store, exchanger, tokens) =
            setup(FakeExchanger::new(ProviderId::Microsoft, false)).await;
        store
            .save_credential(&credential(ProviderId::Microsoft, "stale", 0))
            .await
            .unwrap();
        let tokens = Arc::new(tokens);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tokens = tokens.clone();
            handles.push(tokio::spawn(async move {
                tokens.get_valid_credential(ProviderId::Microsoft).await
            }));
        }
        for handle in handles {
            let credential = handle.await.unwrap().unwrap();
            assert_eq!(credential.access_token, "access-1");
        }
        assert_eq!(exchanger.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_grant_is_auth_expired() {
        let (_dir, store, _exchanger, tokens) = setup(
            FakeExchanger::new(ProviderId::Microsoft, false).then(Err(ExchangeError::Rejected {
                error: "invalid_grant".to_string(),
                description: None,
            })),
        )
        .await;
        store
            .save_credential(&credential(ProviderId::Microsoft, "stale", 0))
            .await
            .unwrap();

        let err = tokens
            .get_valid_credential(ProviderId::Microsoft)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthExpired);
    }

    #[tokio::test]
    async fn test_missing_credential_needs_consent_unless_bootstrappable() {
        let (_dir, _store, exchanger, tokens) =
            setup(FakeExchanger::new(ProviderId::Microsoft, false)).await;
        let err = tokens
            .get_valid_credential(ProviderId::Microsoft)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthExpired);
        assert_eq!(exchanger.calls(), 0);

        let (_dir, _store, exchanger, tokens) =
            setup(FakeExchanger::new(ProviderId::Google, true)).await;
        let got = tokens.get_valid_credential(ProviderId::Google).await.unwrap();
        assert_eq!(got.access_token, "access-1");
        assert_eq!(exchanger.calls(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_endpoint_is_retried_then_surfaced() {
        let (_dir, _store, exchanger, tokens) = setup(
            FakeExchanger::new(ProviderId::Google, true)
                .then(Err(ExchangeError::Unavailable("503".to_string())))
                .then(Err(ExchangeError::Unavailable("503".to_string()))),
        )
        .await;
        let err = tokens
            .get_valid_credential(ProviderId::Google)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_reuses_credential_refreshed_by_another_caller() {
        let (_dir, store, exchanger, tokens) =
            setup(FakeExchanger::new(ProviderId::Microsoft, false)).await;
        let rejected = credential(ProviderId::Microsoft, "rejected", 3600);
        store
            .save_credential(&credential(ProviderId::Microsoft, "already-new", 3600))
            .await
            .unwrap();

        let got = tokens
            .force_refresh(ProviderId::Microsoft, &rejected)
            .await
            .unwrap();
        assert_eq!(got.access_token, "already-new");
        assert_eq!(exchanger.calls(), 0);

        let got = tokens
            .force_refresh(ProviderId::Microsoft, &got)
            .await
            .unwrap();
        assert_eq!(got.access_token, "access-1");
        assert_eq!(exchanger.calls(), 1);
    }

    #[tokio::test]
    async fn test_revoke_destroys_credential() {
        let (_dir, store, _exchanger, tokens) =
            setup(FakeExchanger::new(ProviderId::Microsoft, false)).await;
        store
            .save_credential(&credential(ProviderId::Microsoft, "live", 3600))
            .await
            .unwrap();

        assert!(tokens.revoke(ProviderId::Microsoft).await.unwrap());
        assert!(!tokens.revoke(ProviderId::Microsoft).await.unwrap());
        let err = tokens
            .get_valid_credential(ProviderId::Microsoft)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthExpired);
    }

    #[tokio::test]
    async fn test_revoked_google_credential_is_reissued_on_next_use() {
        let (_dir, store, exchanger, tokens) =
            setup(FakeExchanger::new(ProviderId::Google, true)).await;
        store
            .save_credential(&credential(ProviderId::Google, "live", 3600))
            .await
            .unwrap();

        assert!(tokens.revoke(ProviderId::Google).await.unwrap());
        let got = tokens.get_valid_credential(ProviderId::Google).await.unwrap();
        assert_eq!(got.access_token, "access-1");
        assert_eq!(exchanger.calls(), 1);
        assert!(store.load_credential(ProviderId::Google).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_seeded_refresh_token_is_exchanged_on_first_use() {
        let (_dir, store, exchanger, tokens) =
            setup(FakeExchanger::new(ProviderId::Microsoft, false)).await;

        assert!(tokens
            .seed_refresh_token(ProviderId::Microsoft, "consented".to_string())
            .await
            .unwrap());
        // A second seed never clobbers what is stored.
        assert!(!tokens
            .seed_refresh_token(ProviderId::Microsoft, "older".to_string())
            .await
            .unwrap());

        let got = tokens.get_valid_credential(ProviderId::Microsoft).await.unwrap();
        assert_eq!(got.access_token, "access-1");
        assert_eq!(exchanger.calls(), 1);
        let persisted = store.load_credential(ProviderId::Microsoft).await.unwrap();
        assert_eq!(persisted.unwrap().refresh_token.as_deref(), Some("refresh-1"));
    }
}
