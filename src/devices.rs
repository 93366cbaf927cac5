// ============================================================================
// Device Registry
// ============================================================================
//
// Trust lifecycle for the multi-device model:
// - a user's first device is trusted automatically
// - later devices register as PENDING and need approval from a trusted one
// - revocation is terminal; a revoked device id never regains trust
//
// Re-registering an existing live device rotates its published pre-key
// instead of creating a new row.
// ============================================================================

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use uuid::Uuid;

use crate::audit;
use crate::error::{AppError, AppResult};
use crate::store::RelayStore;
use crate::types::{DeviceRecord, NewDevice, TrustState};

pub struct DeviceRegistry {
    store: Arc<dyn RelayStore>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }

    /// Register a device, or rotate its pre-key if it is already known.
    /// Returns the record plus whether it came out trusted.
    pub async fn register(&self, device: NewDevice) -> AppResult<(DeviceRecord, bool)> {
        if let Some(existing) = self.store.device(device.device_id).await? {
            if existing.user_id != device.user_id {
                return Err(AppError::Conflict("device id already registered".into()));
            }
            if existing.trust_state == TrustState::Revoked {
                return Err(AppError::DeviceRevoked);
            }
            self.store
                .update_pre_key(device.device_id, &device.public_pre_key)
                .await?;
            let trusted = existing.trust_state == TrustState::Trusted;
            let refreshed = self
                .store
                .device(device.device_id)
                .await?
                .unwrap_or(existing);
            return Ok((refreshed, trusted));
        }

        let existing = self.store.devices_for_user(device.user_id).await?;
        let initial_state = if existing.is_empty() {
            TrustState::Trusted
        } else {
            TrustState::Pending
        };

        self.store.insert_device(&device, initial_state).await?;
        audit::device_registered(
            device.user_id,
            device.device_id,
            initial_state == TrustState::Trusted,
        );

        let record = self
            .store
            .device(device.device_id)
            .await?
            .ok_or_else(|| AppError::Internal("device vanished after insert".into()))?;
        Ok((record, initial_state == TrustState::Trusted))
    }

    /// Approve a PENDING device. The caller must act from one of the user's
    /// trusted devices.
    pub async fn approve(
        &self,
        user_id: Uuid,
        approving_device: Uuid,
        target_device: Uuid,
    ) -> AppResult<()> {
        self.require_trusted(user_id, approving_device).await?;

        if !self.store.approve_device(user_id, target_device).await? {
            return Err(AppError::NotFound(
                "no pending device with that id for this user".into(),
            ));
        }
        audit::device_approved(user_id, target_device);
        Ok(())
    }

    /// Revoke a device. Self-revocation is allowed; revoking another device
    /// requires acting from a trusted one.
    pub async fn revoke(
        &self,
        user_id: Uuid,
        acting_device: Uuid,
        target_device: Uuid,
    ) -> AppResult<()> {
        if acting_device != target_device {
            self.require_trusted(user_id, acting_device).await?;
        }

        if !self.store.revoke_device(user_id, target_device).await? {
            return Err(AppError::NotFound(
                "no device with that id for this user".into(),
            ));
        }
        audit::device_revoked(user_id, target_device);
        Ok(())
    }

    pub async fn list(&self, user_id: Uuid) -> AppResult<Vec<DeviceRecord>> {
        Ok(self.store.devices_for_user(user_id).await?)
    }

    /// Store the symmetric session key for a directional device pair. The
    /// key arrives base64-encoded and must decode to exactly 32 bytes.
    pub async fn establish_session(
        &self,
        user_id: Uuid,
        sender_device: Uuid,
        recipient_device: Uuid,
        key_b64: &str,
    ) -> AppResult<()> {
        self.require_trusted(user_id, sender_device).await?;

        let key = BASE64
            .decode(key_b64)
            .map_err(|_| AppError::Validation("session key is not valid base64".into()))?;
        if key.len() != 32 {
            return Err(AppError::Validation(
                "session key must be 32 bytes".into(),
            ));
        }

        self.store
            .save_session_key(sender_device, recipient_device, &key)
            .await?;
        Ok(())
    }

    async fn require_trusted(&self, user_id: Uuid, device_id: Uuid) -> AppResult<()> {
        let device = self
            .store
            .device(device_id)
            .await?
            .ok_or(AppError::DeviceRevoked)?;
        if device.user_id != user_id || device.trust_state != TrustState::Trusted {
            return Err(AppError::NotAuthorized(
                "action requires a trusted device".into(),
            ));
        }
        Ok(())
    }
}
