//! Join authentication.
//!
//! The coordinator consults an [`Authenticator`] before admitting a node. A
//! rejection produces no event and consumes no order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::membership::types::NodeId;

/// Opaque credentials presented by a joining node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub login: Option<String>,
    pub password: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Credentials {
    pub fn new(login: &str, password: &str) -> Self {
        Self {
            login: Some(login.to_string()),
            password: Some(password.to_string()),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject(String),
}

/// Details of the node asking to join, as seen by the authenticator.
#[derive(Debug, Clone)]
pub struct JoinCandidate<'a> {
    pub node_id: &'a NodeId,
    pub consistent_id: &'a str,
    pub attributes: &'a BTreeMap<String, String>,
    pub client: bool,
}

pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, candidate: &JoinCandidate<'_>, credentials: &Credentials) -> AuthDecision;
}

/// Accepts every node.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _candidate: &JoinCandidate<'_>, _credentials: &Credentials) -> AuthDecision {
        AuthDecision::Accept
    }
}

impl<F> Authenticator for F
where
    F: Fn(&JoinCandidate<'_>, &Credentials) -> AuthDecision + Send + Sync + 'static,
{
    fn authenticate(&self, candidate: &JoinCandidate<'_>, credentials: &Credentials) -> AuthDecision {
        self(candidate, credentials)
    }
}
