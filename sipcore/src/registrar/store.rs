//! The registrar backend port and its in-memory reference store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::headers::CallId;
use crate::message::Uri;
use crate::Q;

/// One bound contact of an address-of-record.
#[derive(Debug, Clone)]
pub struct RegContact {
    /// The bound contact URI.
    pub uri: Uri,
    /// Absolute expiry time.
    pub expires_at: Instant,
    /// When this binding was created or last replaced.
    pub registered_at: Instant,
    /// Call-ID of the registering request.
    pub call_id: CallId,
    /// CSeq of the registering request.
    pub cseq: u32,
    /// Hash of the `+sip.instance` parameter; empty when absent.
    pub instance_id: Arc<str>,
    /// The `reg-id` parameter (RFC 5626 outbound).
    pub reg_id: Option<u32>,
    /// Stable public GRUU, minted when the contact has an instance.
    pub pub_gruu: Option<Uri>,
    /// Latest temporary GRUU for the current Call-ID.
    pub temp_gruu: Option<Uri>,
    /// Path URIs recorded from the REGISTER (RFC 3327).
    pub path: Vec<Uri>,
    /// Contact preference.
    pub q: Option<Q>,
}

impl RegContact {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Remaining lifetime in whole seconds.
    pub fn expires_in(&self, now: Instant) -> u32 {
        self.expires_at.saturating_duration_since(now).as_secs() as u32
    }
}

/// The key a binding is stored under: per RFC 5626 at most one active
/// contact per `(instance, reg-id)`; contacts without an instance fall
/// back to their URI.
pub type BindingTag = String;

/// The registrar backend port. The registrar actor is the only writer.
#[async_trait::async_trait]
pub trait RegStore: Sync + Send + 'static {
    /// Reads one binding.
    async fn get(&self, aor: &str, tag: &str) -> Option<RegContact>;

    /// All bindings of an AOR, insertion order.
    async fn list(&self, aor: &str) -> Vec<(BindingTag, RegContact)>;

    /// Writes one binding; an existing tag is replaced in place.
    async fn put(&self, aor: &str, tag: BindingTag, contact: RegContact);

    /// Deletes one binding.
    async fn del(&self, aor: &str, tag: &str);

    /// Deletes every binding of an AOR.
    async fn del_aor(&self, aor: &str);

    /// Deletes everything.
    async fn del_all(&self);

    /// All registered AORs, for the expiry sweep.
    async fn aors(&self) -> Vec<String>;
}

/// The in-memory reference store.
#[derive(Default)]
pub struct MemoryStore {
    bindings: RwLock<HashMap<String, Vec<(BindingTag, RegContact)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait::async_trait]
impl RegStore for MemoryStore {
    async fn get(&self, aor: &str, tag: &str) -> Option<RegContact> {
        let bindings = self.bindings.read().await;
        bindings
            .get(aor)?
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, c)| c.clone())
    }

    async fn list(&self, aor: &str) -> Vec<(BindingTag, RegContact)> {
        let bindings = self.bindings.read().await;
        bindings.get(aor).cloned().unwrap_or_default()
    }

    async fn put(&self, aor: &str, tag: BindingTag, contact: RegContact) {
        let mut bindings = self.bindings.write().await;
        let entries = bindings.entry(aor.to_string()).or_default();
        match entries.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, existing)) => *existing = contact,
            None => entries.push((tag, contact)),
        }
    }

    async fn del(&self, aor: &str, tag: &str) {
        let mut bindings = self.bindings.write().await;
        if let Some(entries) = bindings.get_mut(aor) {
            entries.retain(|(t, _)| t != tag);
            if entries.is_empty() {
                bindings.remove(aor);
            }
        }
    }

    async fn del_aor(&self, aor: &str) {
        self.bindings.write().await.remove(aor);
    }

    async fn del_all(&self) {
        self.bindings.write().await.clear();
    }

    async fn aors(&self) -> Vec<String> {
        self.bindings.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn contact(uri: &str, cseq: u32) -> RegContact {
        let now = Instant::now();
        RegContact {
            uri: uri.parse().unwrap(),
            expires_at: now + Duration::from_secs(3600),
            registered_at: now,
            call_id: CallId::new("c1"),
            cseq,
            instance_id: "".into(),
            reg_id: None,
            pub_gruu: None,
            temp_gruu: None,
            path: Vec::new(),
            q: None,
        }
    }

    #[tokio::test]
    async fn test_put_replaces_in_place() {
        let store = MemoryStore::new();
        store.put("sip:a@d", "t1".into(), contact("sip:a@1.2.3.4", 1)).await;
        store.put("sip:a@d", "t2".into(), contact("sip:a@5.6.7.8", 1)).await;
        store.put("sip:a@d", "t1".into(), contact("sip:a@9.9.9.9", 2)).await;

        let list = store.list("sip:a@d").await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].0, "t1");
        assert_eq!(list[0].1.uri.to_string(), "sip:a@9.9.9.9");
        assert_eq!(list[1].0, "t2");
    }

    #[tokio::test]
    async fn test_del_removes_empty_aor() {
        let store = MemoryStore::new();
        store.put("sip:a@d", "t1".into(), contact("sip:a@1.2.3.4", 1)).await;
        store.del("sip:a@d", "t1").await;

        assert!(store.list("sip:a@d").await.is_empty());
        assert!(store.aors().await.is_empty());
    }
}
