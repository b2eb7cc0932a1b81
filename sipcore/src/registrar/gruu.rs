//! GRUU minting and resolution (RFC 5627).

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::headers::CallId;
use crate::message::{Host, Uri};

use super::store::BindingTag;

/// Mints the stable public GRUU of `(aor, instance)`:
/// `sip:<user>@<domain>;gr=<hash>`. The hash is deterministic, so the
/// same pair always resolves to the same GRUU.
pub(crate) fn pub_gruu(aor_uri: &Uri, instance_id: &str) -> Uri {
    let mut hasher = DefaultHasher::new();
    aor_uri.aor().hash(&mut hasher);
    instance_id.hash(&mut hasher);
    let gr = format!("{:016x}", hasher.finish());

    let mut gruu = aor_uri.clone();
    gruu.host_port.port = None;
    gruu.gr_param = Some(Some(gr.into()));
    gruu
}

/// Mints a fresh temporary GRUU: `sip:<opaque>@<domain>;gr` with a
/// random opaque user part.
pub(crate) fn temp_gruu(domain: &Host) -> (Arc<str>, Uri) {
    let opaque: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    let opaque: Arc<str> = opaque.into();

    let mut uri = Uri::new(domain.clone(), None);
    uri.user = Some(crate::message::UserInfo::new(opaque.clone()));
    uri.gr_param = Some(None);

    (opaque, uri)
}

/// Where a temporary GRUU points.
#[derive(Debug, Clone)]
pub(crate) struct TempGruuEntry {
    pub aor: String,
    pub tag: BindingTag,
    pub instance_id: Arc<str>,
    pub call_id: CallId,
}

/// The rolling table of temporary GRUUs. All tokens minted under an
/// instance's current Call-ID stay resolvable; a Call-ID change
/// invalidates every prior token of that instance.
#[derive(Default)]
pub(crate) struct TempGruuIndex {
    by_opaque: HashMap<Arc<str>, TempGruuEntry>,
}

impl TempGruuIndex {
    pub fn insert(&mut self, opaque: Arc<str>, entry: TempGruuEntry) {
        self.by_opaque.insert(opaque, entry);
    }

    pub fn resolve(&self, opaque: &str) -> Option<&TempGruuEntry> {
        self.by_opaque.get(opaque)
    }

    /// Drops every token of `(aor, instance)` minted under a Call-ID
    /// other than `current`.
    pub fn invalidate_other_call_ids(&mut self, aor: &str, instance_id: &str, current: &CallId) {
        self.by_opaque.retain(|_, entry| {
            !(entry.aor == aor && &*entry.instance_id == instance_id && &entry.call_id != current)
        });
    }

    /// Drops every token of `(aor, tag)`, for deregistration.
    pub fn invalidate_binding(&mut self, aor: &str, tag: &str) {
        self.by_opaque.retain(|_, entry| !(entry.aor == aor && entry.tag == tag));
    }
}
