// =============================================================================
// Accounts Store — account display records and the active-account pointer
// =============================================================================
//
// Persists `accounts.json`. Records carry only display data and the wallet
// address; API credentials stay in the environment and never touch disk
// here.
// =============================================================================

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state_store::{read_json_or_default, write_json_atomic};

const ACCOUNTS_FILE: &str = "accounts.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub id: String,
    pub label: String,
    /// Lowercased wallet address.
    pub address: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountsFile {
    #[serde(default)]
    pub active_account_id: Option<String>,
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
    #[serde(default)]
    pub has_seen_paper_popup: bool,
}

pub struct AccountsStore {
    path: PathBuf,
    inner: Mutex<AccountsFile>,
}

impl AccountsStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = data_dir.into().join(ACCOUNTS_FILE);
        let file: AccountsFile = read_json_or_default(&path)?;
        debug!(accounts = file.accounts.len(), "accounts loaded");
        Ok(Self {
            path,
            inner: Mutex::new(file),
        })
    }

    /// The currently selected account, if any.
    pub fn active_account(&self) -> Option<AccountRecord> {
        let file = self.inner.lock();
        let id = file.active_account_id.as_deref()?;
        file.accounts.iter().find(|a| a.id == id).cloned()
    }

    pub fn add_account(&self, label: &str, address: &str) -> AccountRecord {
        let record = AccountRecord {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            address: address.to_lowercase(),
            created_at: Utc::now().to_rfc3339(),
        };

        let mut file = self.inner.lock();
        file.accounts.push(record.clone());
        if file.active_account_id.is_none() {
            file.active_account_id = Some(record.id.clone());
        }
        self.persist(&file);
        record
    }

    pub fn set_active(&self, id: &str) -> bool {
        let mut file = self.inner.lock();
        if file.accounts.iter().any(|a| a.id == id) {
            file.active_account_id = Some(id.to_string());
            self.persist(&file);
            true
        } else {
            false
        }
    }

    pub fn mark_paper_popup_seen(&self) {
        let mut file = self.inner.lock();
        if !file.has_seen_paper_popup {
            file.has_seen_paper_popup = true;
            self.persist(&file);
        }
    }

    pub fn snapshot(&self) -> AccountsFile {
        self.inner.lock().clone()
    }

    fn persist(&self, file: &AccountsFile) {
        if let Err(e) = write_json_atomic(&self.path, file) {
            warn!(error = %e, "failed to persist accounts");
        }
    }
}

impl std::fmt::Debug for AccountsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountsStore")
            .field("accounts", &self.inner.lock().accounts.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (AccountsStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("mirror-accounts-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        (AccountsStore::open(&dir).unwrap(), dir)
    }

    #[test]
    fn first_account_becomes_active() {
        let (store, dir) = store();
        let record = store.add_account("Main", "0xABCdef0123456789abcdef0123456789abcdef01");
        assert_eq!(record.address, "0xabcdef0123456789abcdef0123456789abcdef01");

        let active = store.active_account().unwrap();
        assert_eq!(active.id, record.id);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn set_active_requires_known_id() {
        let (store, dir) = store();
        let a = store.add_account("A", "0x1111111111111111111111111111111111111111");
        let b = store.add_account("B", "0x2222222222222222222222222222222222222222");
        assert_eq!(store.active_account().unwrap().id, a.id);

        assert!(store.set_active(&b.id));
        assert_eq!(store.active_account().unwrap().id, b.id);

        assert!(!store.set_active("missing"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn paper_popup_flag_persists() {
        let (store, dir) = store();
        assert!(!store.snapshot().has_seen_paper_popup);
        store.mark_paper_popup_seen();
        drop(store);

        let store = AccountsStore::open(&dir).unwrap();
        assert!(store.snapshot().has_seen_paper_popup);
        let _ = std::fs::remove_dir_all(dir);
    }
}
