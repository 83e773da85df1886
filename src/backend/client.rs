//! Client for the reader backend.
//!
//! The backend certifies reader authentication keys created in a [SecureArea] after the device
//! proved, through [DeviceCheck], that it registered with the backend. Certified keys are pooled
//! in [Storage] so reader authentication keeps working while the backend is unreachable, and each
//! key is meant to be used for a single presentation.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::device_check::DeviceCheck;
use super::error::{Error, Result};
use super::records::{
    CertifiedKeyRecord, ReaderIdentity, ReaderIdentitySelector, CERTIFIED_KEYS_TABLE,
};
use super::registration::{check_ok, string_field, unexpected_status, RegistrationManager};
use super::rpc::{decode_bytes, RpcStatus, RpcTransport};
use super::secure_area::{CreateKeySettings, KeyInfo, SecureArea};
use super::storage::Storage;
use super::trust::TrustEntry;
use crate::config::ReaderBackendConfig;
use crate::definitions::x509::X5Chain;

/// In-memory view of the certified keys table, keyed by storage row id.
#[derive(Default)]
struct KeyPool {
    loaded: bool,
    keys: BTreeMap<String, CertifiedKeyRecord>,
}

/// Outcome of a single replenishment attempt.
enum Replenishment {
    Done,
    /// The backend forgot our registration, which has been dropped locally.
    RetryNeeded,
}

pub struct ReaderBackendClient {
    config: ReaderBackendConfig,
    storage: Arc<dyn Storage>,
    secure_area: Arc<dyn SecureArea>,
    registration: RegistrationManager,
    pool: Mutex<KeyPool>,
}

impl ReaderBackendClient {
    pub fn new(
        config: ReaderBackendConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn RpcTransport>,
        secure_area: Arc<dyn SecureArea>,
        device_check: Arc<dyn DeviceCheck>,
    ) -> Self {
        Self {
            config,
            registration: RegistrationManager::new(storage.clone(), transport, device_check),
            storage,
            secure_area,
            pool: Mutex::new(KeyPool::default()),
        }
    }

    /// Target size of the key pool.
    pub fn num_keys(&self) -> usize {
        self.config.num_keys
    }

    /// Secure area holding the pooled keys, for signing with a key from [Self::get_key].
    pub fn secure_area(&self) -> &Arc<dyn SecureArea> {
        &self.secure_area
    }

    /// Gets a reader authentication key for `selector`, certified by the backend.
    ///
    /// This may talk to the backend to certify fresh keys and drop expired ones. Failing to reach
    /// the backend is not an error as long as a pooled key is valid at `at`. The oldest valid key
    /// is returned; call [Self::mark_key_as_used] once it has signed something.
    ///
    /// Calling this without using the key primes the pool.
    pub async fn get_key(
        &self,
        selector: &ReaderIdentitySelector,
        at: OffsetDateTime,
    ) -> Result<(KeyInfo, X5Chain)> {
        let mut pool = self.pool.lock().await;
        self.ensure_loaded(&mut pool).await?;

        match self.ensure_replenished(&mut pool, selector, at).await {
            Ok(()) => {}
            Err(e @ Error::ReaderIdentityNotAvailable(_)) => return Err(e),
            Err(e) => tracing::warn!("ignoring error replenishing reader keys: {e}"),
        }

        let record = pool
            .keys
            .values()
            .filter(|record| record.is_valid_at(at))
            .min_by_key(|record| record.valid_from)
            .ok_or(Error::NoValidKeys)?;
        let chain = record.x5chain().map_err(Error::Certificate)?;
        let key_info = self.secure_area.get_key_info(&record.alias).await?;
        Ok((key_info, chain))
    }

    /// Retires a key returned by [Self::get_key].
    ///
    /// The last pooled key is only retired if the pool could be replenished, so a device that
    /// is offline keeps reusing it rather than losing reader authentication.
    pub async fn mark_key_as_used(
        &self,
        key_info: &KeyInfo,
        selector: &ReaderIdentitySelector,
        at: OffsetDateTime,
    ) -> Result<()> {
        let mut pool = self.pool.lock().await;
        self.ensure_loaded(&mut pool).await?;

        let row_id = pool
            .keys
            .iter()
            .find(|(_, record)| record.alias == key_info.alias)
            .map(|(row_id, _)| row_id.clone())
            .ok_or_else(|| Error::NoSuchKey(key_info.alias.clone()))?;

        if pool.keys.len() == 1 {
            if let Err(e) = self.ensure_replenished(&mut pool, selector, at).await {
                tracing::warn!("keeping last reader key, replenishing failed: {e}");
                return Ok(());
            }
        }

        self.delete_pooled(&mut pool, &row_id).await
    }

    /// Snapshot of the pooled keys certified for `selector`.
    pub async fn pooled_keys(
        &self,
        selector: &ReaderIdentitySelector,
    ) -> Result<Vec<CertifiedKeyRecord>> {
        let mut pool = self.pool.lock().await;
        self.ensure_loaded(&mut pool).await?;
        Ok(pool
            .keys
            .values()
            .filter(|record| &record.for_reader_identity == selector)
            .cloned()
            .collect())
    }

    /// Fetches the issuer trust list.
    ///
    /// Returns `None` when the backend has no list or when `current_version` is already the
    /// latest version.
    pub async fn get_trusted_issuers(
        &self,
        current_version: Option<i64>,
    ) -> Result<Option<(i64, Vec<TrustEntry>)>> {
        let mut fields = Map::new();
        if let Some(version) = current_version {
            fields.insert("currentVersion".into(), json!(version));
        }
        let response = self.call_registered("getIssuerList", fields, None).await?;

        let Some(version) = response.get("version").filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        let version = version
            .as_i64()
            .ok_or_else(|| Error::malformed("getIssuerList", "version is not an integer"))?;

        let entries = response
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::malformed("getIssuerList", "missing 'entries'"))?
            .iter()
            .map(|entry| {
                let encoded = entry
                    .as_str()
                    .ok_or_else(|| Error::malformed("getIssuerList", "entry is not a string"))?;
                let bytes = decode_bytes(encoded)
                    .map_err(|e| Error::malformed("getIssuerList", e.to_string()))?;
                Ok(TrustEntry::from_cbor(&bytes)?)
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(version, entries = entries.len(), "received issuer trust list");

        Ok(Some((version, entries)))
    }

    /// A fresh nonce for the identity provider's sign-in flow.
    pub async fn sign_in_get_nonce(&self) -> Result<Vec<u8>> {
        self.registration.get_nonce().await
    }

    /// Signs the account identified by `id_token` in, proving possession over `nonce` which must
    /// come from [Self::sign_in_get_nonce].
    pub async fn sign_in(&self, nonce: &[u8], id_token: &str) -> Result<()> {
        let mut fields = Map::new();
        fields.insert("googleIdTokenString".into(), json!(id_token));
        self.call_registered("signIn", fields, Some(nonce)).await?;
        tracing::info!("signed in to reader backend");
        Ok(())
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.call_registered("signOut", Map::new(), None).await?;
        tracing::info!("signed out of reader backend");
        Ok(())
    }

    /// The reader identities the signed-in account has access to.
    pub async fn get_reader_identities(&self) -> Result<Vec<ReaderIdentity>> {
        const METHOD: &str = "getReaderIdentities";
        let response = self.call_registered(METHOD, Map::new(), None).await?;
        response
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::malformed(METHOD, "missing 'entries'"))?
            .iter()
            .map(|entry| {
                let display_icon = match entry.get("displayIcon").and_then(Value::as_str) {
                    Some(icon) => Some(
                        decode_bytes(icon).map_err(|e| Error::malformed(METHOD, e.to_string()))?,
                    ),
                    None => None,
                };
                Ok(ReaderIdentity {
                    id: string_field(METHOD, entry, "id")?.to_owned(),
                    display_name: string_field(METHOD, entry, "displayName")?.to_owned(),
                    display_icon,
                })
            })
            .collect()
    }

    /// Performs a registration-bound RPC, re-registering once if the backend lost us.
    ///
    /// The assertion is made over `nonce` when given, otherwise over a fresh one.
    async fn call_registered(
        &self,
        method: &'static str,
        fields: Map<String, Value>,
        nonce: Option<&[u8]>,
    ) -> Result<Value> {
        for _ in 0..2 {
            let registration = self.registration.ensure_registered().await?;
            let proof = match nonce {
                Some(nonce) => {
                    self.registration
                        .assert_possession_of(&registration, nonce)
                        .await?
                }
                None => self.registration.assert_nonce_possession(&registration).await?,
            };
            let mut request = proof.request(&registration);
            request.extend(fields.clone());

            let (status, response) = self.registration.call(method, Value::Object(request)).await?;
            if status == RpcStatus::NotFound {
                self.registration.forget().await?;
                continue;
            }
            check_ok(method, status, &response)?;
            return Ok(response);
        }
        Err(Error::RegistrationLost)
    }

    async fn ensure_loaded(&self, pool: &mut KeyPool) -> Result<()> {
        if pool.loaded {
            return Ok(());
        }
        for (row_id, data) in self.storage.enumerate_with_data(&CERTIFIED_KEYS_TABLE).await? {
            pool.keys.insert(row_id, CertifiedKeyRecord::from_bytes(&data)?);
        }
        pool.loaded = true;
        tracing::debug!(keys = pool.keys.len(), "loaded reader key pool");
        Ok(())
    }

    async fn ensure_replenished(
        &self,
        pool: &mut KeyPool,
        selector: &ReaderIdentitySelector,
        at: OffsetDateTime,
    ) -> Result<()> {
        for _ in 0..2 {
            match self.replenish(pool, selector, at).await? {
                Replenishment::Done => return Ok(()),
                Replenishment::RetryNeeded => continue,
            }
        }
        Err(Error::RegistrationLost)
    }

    /// Keeps more than half of the pool valid for `selector`.
    ///
    /// Keys certified for other identities are always evicted. Keys past their refresh time are
    /// only evicted once enough good keys remain or fresh ones have been certified.
    async fn replenish(
        &self,
        pool: &mut KeyPool,
        selector: &ReaderIdentitySelector,
        at: OffsetDateTime,
    ) -> Result<Replenishment> {
        let other_identities: Vec<String> = pool
            .keys
            .iter()
            .filter(|(_, record)| &record.for_reader_identity != selector)
            .map(|(row_id, _)| row_id.clone())
            .collect();
        for row_id in &other_identities {
            self.delete_pooled(pool, row_id).await?;
        }

        let mut stale = Vec::new();
        let mut good = 0;
        for (row_id, record) in &pool.keys {
            if record.needs_refresh_at(at) {
                stale.push(row_id.clone());
            } else if record.is_valid_at(at) {
                good += 1;
            }
        }
        tracing::debug!(
            num_keys = self.config.num_keys,
            good,
            stale = stale.len(),
            "reader key pool status"
        );

        if good > self.config.num_keys / 2 {
            for row_id in &stale {
                self.delete_pooled(pool, row_id).await?;
            }
            return Ok(Replenishment::Done);
        }

        let need = self.config.num_keys - good;
        let Some(chains) = self.certify_new_keys(selector, need).await? else {
            return Ok(Replenishment::RetryNeeded);
        };

        let mut chains = chains.into_iter();
        while let Some((key_info, chain)) = chains.next() {
            if let Err(e) = self.persist(pool, &key_info, &chain, selector).await {
                self.discard(std::iter::once(key_info).chain(chains.map(|(k, _)| k)))
                    .await;
                return Err(e);
            }
        }
        tracing::info!(count = need, identity = %selector, "certified new reader keys");

        for row_id in &stale {
            self.delete_pooled(pool, row_id).await?;
        }
        Ok(Replenishment::Done)
    }

    /// Creates `count` keys and has the backend certify them.
    ///
    /// Returns `None` after dropping the local registration if the backend no longer knows it.
    /// The created keys are deleted on every path that does not return them.
    async fn certify_new_keys(
        &self,
        selector: &ReaderIdentitySelector,
        count: usize,
    ) -> Result<Option<Vec<(KeyInfo, X5Chain)>>> {
        const METHOD: &str = "certifyKeys";

        let registration = self.registration.ensure_registered().await?;
        let proof = self.registration.assert_nonce_possession(&registration).await?;

        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            match self.secure_area.create_key(&CreateKeySettings::default()).await {
                Ok(key_info) => created.push(key_info),
                Err(e) => {
                    self.discard(created).await;
                    return Err(e.into());
                }
            }
        }

        let mut request = proof.request(&registration);
        if let Some(identity) = selector.wire_value() {
            request.insert("readerIdentity".into(), json!(identity));
        }
        let keys = created
            .iter()
            .map(|key_info| serde_json::to_value(key_info.public_key.to_jwk()))
            .collect::<serde_json::Result<Vec<_>>>();
        let keys = match keys {
            Ok(keys) => keys,
            Err(e) => {
                self.discard(created).await;
                return Err(Error::malformed(METHOD, e.to_string()));
            }
        };
        request.insert("keys".into(), Value::Array(keys));

        let (status, response) = match self.registration.call(METHOD, Value::Object(request)).await {
            Ok(result) => result,
            Err(e) => {
                self.discard(created).await;
                return Err(e);
            }
        };
        match status {
            RpcStatus::Ok => {}
            RpcStatus::Forbidden => {
                self.discard(created).await;
                return Err(Error::ReaderIdentityNotAvailable(selector.clone()));
            }
            RpcStatus::NotFound => {
                self.discard(created).await;
                self.registration.forget().await?;
                return Ok(None);
            }
            _ => {
                self.discard(created).await;
                return Err(unexpected_status(METHOD, status, &response));
            }
        }

        match parse_certifications(&response, created.len()) {
            Ok(chains) => Ok(Some(created.into_iter().zip(chains).collect())),
            Err(e) => {
                self.discard(created).await;
                Err(e)
            }
        }
    }

    async fn persist(
        &self,
        pool: &mut KeyPool,
        key_info: &KeyInfo,
        chain: &X5Chain,
        selector: &ReaderIdentitySelector,
    ) -> Result<()> {
        let record = CertifiedKeyRecord::new(key_info.alias.clone(), chain, selector.clone())
            .map_err(Error::Certificate)?;
        let row_id = self
            .storage
            .insert(&CERTIFIED_KEYS_TABLE, None, record.to_bytes()?)
            .await?;
        pool.keys.insert(row_id, record);
        Ok(())
    }

    /// Removes a pooled key: the persisted row first, then the key material.
    async fn delete_pooled(&self, pool: &mut KeyPool, row_id: &str) -> Result<()> {
        self.storage.delete(&CERTIFIED_KEYS_TABLE, row_id).await?;
        if let Some(record) = pool.keys.remove(row_id) {
            self.secure_area.delete_key(&record.alias).await?;
        }
        Ok(())
    }

    /// Best-effort deletion of keys that never made it into the pool.
    async fn discard(&self, keys: impl IntoIterator<Item = KeyInfo>) {
        for key_info in keys {
            if let Err(e) = self.secure_area.delete_key(&key_info.alias).await {
                tracing::warn!(alias = %key_info.alias, "failed to delete uncertified key: {e}");
            }
        }
    }
}

fn parse_certifications(response: &Value, expected: usize) -> Result<Vec<X5Chain>> {
    const METHOD: &str = "certifyKeys";
    let certifications = response
        .get("readerCertifications")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::malformed(METHOD, "missing 'readerCertifications'"))?;
    if certifications.len() != expected {
        return Err(Error::malformed(
            METHOD,
            format!(
                "expected {expected} certifications, got {}",
                certifications.len()
            ),
        ));
    }
    certifications
        .iter()
        .map(|x5c| {
            let x5c = x5c
                .as_array()
                .ok_or_else(|| Error::malformed(METHOD, "certification is not an x5c array"))?
                .iter()
                .map(|cert| {
                    cert.as_str()
                        .ok_or_else(|| Error::malformed(METHOD, "x5c entry is not a string"))
                })
                .collect::<Result<Vec<_>>>()?;
            X5Chain::from_x5c(&x5c).map_err(Error::Certificate)
        })
        .collect()
}
