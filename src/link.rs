use std::{collections::HashMap, fmt};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::id::AccountId;

const MIN_HANDLE_LEN: usize = 3;
const MAX_HANDLE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("No account behind handle `{0}`")]
    UnknownHandle(String),
    #[error("`{0}` is not a valid handle")]
    InvalidHandle(String),
    #[error("Handle `{0}` is already taken")]
    HandleTaken(PublicHandle),
    #[error("Account `{account}` already has handle `{handle}`")]
    AlreadyIssued {
        account: AccountId,
        handle: PublicHandle,
    },
}

/// Shareable account name used in payment links. Lowercase, so lookups are
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PublicHandle(String);

impl PublicHandle {
    /// Accepts an optional leading `@`.
    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        let handle = raw.trim();
        let handle = handle.strip_prefix('@').unwrap_or(handle).to_lowercase();
        let valid_len = (MIN_HANDLE_LEN..=MAX_HANDLE_LEN).contains(&handle.len());
        let valid_chars = handle
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'));
        if valid_len && valid_chars {
            Ok(Self(handle))
        } else {
            Err(LinkError::InvalidHandle(raw.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct Links {
    by_handle: HashMap<PublicHandle, AccountId>,
    by_account: HashMap<AccountId, PublicHandle>,
}

/// Maps public handles to accounts. A handle never changes once issued, so
/// profile edits cannot break links already shared.
pub struct LinkResolver {
    links: RwLock<Links>,
    handle_length: usize,
    base_url: String,
}

impl LinkResolver {
    pub fn new(handle_length: usize, base_url: impl Into<String>) -> Self {
        Self {
            links: RwLock::new(Links::default()),
            handle_length: handle_length.clamp(MIN_HANDLE_LEN, MAX_HANDLE_LEN),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// Returns the account's handle, generating one on first use.
    pub fn issue(&self, account: &AccountId) -> PublicHandle {
        let mut links = self.links.write();
        if let Some(handle) = links.by_account.get(account) {
            return handle.clone();
        }
        let handle = loop {
            let candidate = Uuid::new_v4().simple().to_string();
            let candidate = PublicHandle(candidate[..self.handle_length].to_owned());
            if !links.by_handle.contains_key(&candidate) {
                break candidate;
            }
        };
        info!(%account, %handle, "public handle issued");
        links.by_handle.insert(handle.clone(), account.clone());
        links.by_account.insert(account.clone(), handle.clone());
        handle
    }

    /// Registers a chosen handle for an account that has none yet.
    pub fn claim(&self, account: &AccountId, handle: &str) -> Result<PublicHandle, LinkError> {
        let handle = PublicHandle::parse(handle)?;
        let mut links = self.links.write();
        if let Some(existing) = links.by_account.get(account) {
            return Err(LinkError::AlreadyIssued {
                account: account.clone(),
                handle: existing.clone(),
            });
        }
        if links.by_handle.contains_key(&handle) {
            return Err(LinkError::HandleTaken(handle));
        }
        info!(%account, %handle, "public handle claimed");
        links.by_handle.insert(handle.clone(), account.clone());
        links.by_account.insert(account.clone(), handle.clone());
        Ok(handle)
    }

    /// Undoes a claim whose account could not be opened. Does nothing if
    /// `handle` is not held by `account`.
    pub fn release(&self, account: &AccountId, handle: &PublicHandle) {
        let mut links = self.links.write();
        if links.by_handle.get(handle) != Some(account) {
            return;
        }
        links.by_handle.remove(handle);
        links.by_account.remove(account);
        info!(%account, %handle, "public handle released");
    }

    pub fn resolve(&self, handle: &str) -> Result<AccountId, LinkError> {
        let parsed =
            PublicHandle::parse(handle).map_err(|_| LinkError::UnknownHandle(handle.to_owned()))?;
        self.links
            .read()
            .by_handle
            .get(&parsed)
            .cloned()
            .ok_or_else(|| LinkError::UnknownHandle(handle.to_owned()))
    }

    pub fn handle_of(&self, account: &AccountId) -> Option<PublicHandle> {
        self.links.read().by_account.get(account).cloned()
    }

    pub fn is_taken(&self, handle: &PublicHandle) -> bool {
        self.links.read().by_handle.contains_key(handle)
    }

    pub fn payment_url(&self, handle: &PublicHandle) -> String {
        format!("{}/pay/{}", self.base_url, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> LinkResolver {
        LinkResolver::new(10, "https://pay.example.com/")
    }

    #[test]
    fn issue_is_stable() {
        let links = resolver();
        let handle = links.issue(&"acc-1".into());
        assert_eq!(handle.as_str().len(), 10);
        assert_eq!(links.issue(&"acc-1".into()), handle);
        assert_ne!(links.issue(&"acc-2".into()), handle);
        assert_eq!(links.resolve(handle.as_str()).unwrap(), "acc-1".into());
        assert_eq!(links.handle_of(&"acc-1".into()), Some(handle));
    }

    #[test]
    fn claim_and_resolve_case_insensitively() {
        let links = resolver();
        let handle = links.claim(&"acc-1".into(), "@AwesomeUser").unwrap();
        assert_eq!(handle.as_str(), "awesomeuser");
        assert_eq!(links.resolve("AWESOMEUSER").unwrap(), "acc-1".into());
        assert_eq!(links.resolve("@awesomeuser").unwrap(), "acc-1".into());
        assert_eq!(
            links.payment_url(&handle),
            "https://pay.example.com/pay/awesomeuser"
        );

        assert!(matches!(
            links.claim(&"acc-2".into(), "awesomeuser"),
            Err(LinkError::HandleTaken(_))
        ));
        assert!(matches!(
            links.claim(&"acc-1".into(), "other"),
            Err(LinkError::AlreadyIssued { .. })
        ));
        assert_eq!(links.issue(&"acc-1".into()), handle);
    }

    #[test]
    fn released_handle_can_be_claimed_again() {
        let links = resolver();
        let handle = links.claim(&"acc-1".into(), "john.doe").unwrap();
        // only the holder can release it
        links.release(&"acc-2".into(), &handle);
        assert!(links.is_taken(&handle));

        links.release(&"acc-1".into(), &handle);
        assert!(!links.is_taken(&handle));
        assert_eq!(links.handle_of(&"acc-1".into()), None);
        assert!(links.resolve("john.doe").is_err());
        links.claim(&"acc-2".into(), "john.doe").unwrap();
        assert_eq!(links.resolve("john.doe").unwrap(), "acc-2".into());
    }

    #[test]
    fn unknown_and_malformed_handles() {
        let links = resolver();
        assert!(matches!(
            links.resolve("nobody"),
            Err(LinkError::UnknownHandle(_))
        ));
        assert!(matches!(
            links.resolve("David Mwaura"),
            Err(LinkError::UnknownHandle(_))
        ));
        assert!(matches!(
            links.claim(&"acc-1".into(), "David Mwaura"),
            Err(LinkError::InvalidHandle(_))
        ));
        assert!(PublicHandle::parse("ab").is_err());
        assert!(PublicHandle::parse("john.doe").is_ok());
    }
}
