//! Server public identity returned by the `identify` pre-session command.

use serde::{Deserialize, Serialize};

use crate::rvid::ShortId;

/// Public identity of a server. Fields the session layer does not interpret
/// (key material, signature, avatar) are carried through untouched so that
/// two identities compare equal only when every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nick: String,
    #[serde(rename = "sigKey")]
    pub sig_key: ShortId,
    pub identity: ShortId,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PublicIdentity {
    pub fn fingerprint(&self) -> String {
        self.identity.to_string()
    }
}
