//! Connected endpoints, pairing codes and pairings.
//!
//! Every operation is a synchronous state transition that returns the
//! envelopes it wants delivered, in order. The websocket layer holds the
//! registry behind one mutex and dispatches the returned [`Delivery`] list
//! after releasing it, so each inbound event is exactly one critical section.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tether_proto::{PeerEnvelope, Role, ServerControl, ServerEnvelope};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AuthPolicy;
use crate::metrics;

pub type ConnectionId = u64;

pub const DEBUG_PAIRING_CODE: &str = "0000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub connection: ConnectionId,
    pub device_id: String,
    pub role: Role,
    pub identity: Option<String>,
    pub paired_with: Option<String>,
    seq: u64,
}

#[derive(Debug, Clone)]
struct PairingCode {
    owner: String,
    expires_at: Instant,
}

/// An envelope addressed to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub connection: ConnectionId,
    pub envelope: ServerEnvelope,
}

impl Delivery {
    fn control(connection: ConnectionId, control: ServerControl) -> Self {
        Self {
            connection,
            envelope: control.into(),
        }
    }
}

/// Outcome of checking the bearer credential that came with `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Absent,
    Valid(String),
    Invalid(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid or expired pairing code")]
    InvalidOrExpiredCode,
    #[error("Device is already paired")]
    AlreadyPaired,
    #[error("Device is not registered")]
    UnknownDevice,
    #[error("Only viewers can redeem a pairing code")]
    NotAViewer,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DeviceCounts {
    pub host: usize,
    pub viewer: usize,
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub code_ttl: Duration,
    pub debug_code: bool,
    pub auth_policy: AuthPolicy,
    /// Path of the login entry point, e.g. `/auth/google`.
    pub login_path: String,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(5 * 60),
            debug_code: false,
            auth_policy: AuthPolicy::Optional,
            login_path: "/auth/google".to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    endpoints: HashMap<String, Endpoint>,
    codes: HashMap<String, PairingCode>,
    next_seq: u64,
    options: RegistryOptions,
}

impl SessionRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            endpoints: HashMap::new(),
            codes: HashMap::new(),
            next_seq: 0,
            options,
        }
    }

    pub fn endpoint(&self, device_id: &str) -> Option<&Endpoint> {
        self.endpoints.get(device_id)
    }

    pub fn device_counts(&self) -> DeviceCounts {
        self.endpoints
            .values()
            .fold(DeviceCounts::default(), |mut counts, endpoint| {
                match endpoint.role {
                    Role::Host => counts.host += 1,
                    Role::Viewer => counts.viewer += 1,
                }
                counts
            })
    }

    pub fn register(
        &mut self,
        connection: ConnectionId,
        device_id: &str,
        role: Role,
        credential: Credential,
        now: Instant,
    ) -> Vec<Delivery> {
        let mut out = Vec::new();

        let identity = match &credential {
            Credential::Valid(identity) => Some(identity.clone()),
            _ => None,
        };

        if let Some(existing) = self.endpoints.get(device_id) {
            let keeps_pairing = existing.connection == connection
                && existing.paired_with.is_some()
                && existing.role == role
                && !matches!(credential, Credential::Invalid(_))
                && existing.identity == identity;
            if keeps_pairing {
                debug!(device = %device_id, "registration refresh keeps pairing");
                out.push(Delivery::control(
                    connection,
                    ServerControl::Registered {
                        pairing_code: None,
                        message: "Registered".into(),
                    },
                ));
                return out;
            }
            if existing.connection != connection {
                info!(
                    device = %device_id,
                    stale_connection = existing.connection,
                    connection,
                    "registration supersedes previous connection"
                );
            }
            self.retire(device_id, &mut out);
        }

        let identity = match credential {
            Credential::Invalid(message) => {
                debug!(device = %device_id, %message, "rejecting credential");
                out.push(Delivery::control(
                    connection,
                    ServerControl::AuthError {
                        message: format!("Authentication failed: {message}"),
                    },
                ));
                return out;
            }
            Credential::Valid(identity) => Some(identity),
            Credential::Absent => None,
        };

        self.next_seq += 1;
        self.endpoints.insert(
            device_id.to_string(),
            Endpoint {
                connection,
                device_id: device_id.to_string(),
                role,
                identity: identity.clone(),
                paired_with: None,
                seq: self.next_seq,
            },
        );
        metrics::REGISTRATIONS
            .with_label_values(&[role.as_str()])
            .inc();

        if identity.is_none() && self.options.auth_policy == AuthPolicy::Required {
            out.push(Delivery::control(
                connection,
                ServerControl::LoginRequired {
                    login_url: self.login_url(device_id, role),
                },
            ));
            return out;
        }

        if identity.is_some() {
            out.push(Delivery::control(
                connection,
                ServerControl::Registered {
                    pairing_code: None,
                    message: "Registered".into(),
                },
            ));
            self.discover(device_id, &mut out);
            return out;
        }

        match role {
            Role::Host => {
                let code = self.issue_code(device_id, now);
                out.push(Delivery::control(
                    connection,
                    ServerControl::Registered {
                        pairing_code: Some(code),
                        message: "Share this code with the viewer".into(),
                    },
                ));
            }
            Role::Viewer => out.push(Delivery::control(
                connection,
                ServerControl::Registered {
                    pairing_code: None,
                    message: "Enter the pairing code shown on the host".into(),
                },
            )),
        }
        out
    }

    pub fn redeem(
        &mut self,
        device_id: &str,
        code: &str,
        dimensions: Option<(u16, u16)>,
        now: Instant,
    ) -> Result<Vec<Delivery>, RegistryError> {
        let redeemer = self
            .endpoints
            .get(device_id)
            .ok_or(RegistryError::UnknownDevice)?;
        if redeemer.role != Role::Viewer {
            return Err(RegistryError::NotAViewer);
        }
        if redeemer.paired_with.is_some() {
            return Err(RegistryError::AlreadyPaired);
        }

        let entry = self
            .codes
            .get(code)
            .ok_or(RegistryError::InvalidOrExpiredCode)?;
        if now >= entry.expires_at {
            self.codes.remove(code);
            return Err(RegistryError::InvalidOrExpiredCode);
        }
        let owner_id = entry.owner.clone();
        let Some(owner) = self.endpoints.get(&owner_id) else {
            self.codes.remove(code);
            return Err(RegistryError::InvalidOrExpiredCode);
        };
        if owner.paired_with.is_some() {
            return Err(RegistryError::AlreadyPaired);
        }
        let owner_connection = owner.connection;

        self.codes.remove(code);
        let mut out = Vec::new();
        // The host sizes its shell from this before it reacts to `paired`.
        if let Some((cols, rows)) = dimensions {
            out.push(Delivery {
                connection: owner_connection,
                envelope: PeerEnvelope::TerminalDimensions { cols, rows }.into(),
            });
        }
        self.establish(&owner_id, device_id, "code", &mut out);
        Ok(out)
    }

    pub fn unregister(&mut self, device_id: &str, connection: ConnectionId) -> Vec<Delivery> {
        let mut out = Vec::new();
        match self.endpoints.get(device_id) {
            Some(endpoint) if endpoint.connection == connection => {
                self.retire(device_id, &mut out);
            }
            Some(_) => debug!(
                device = %device_id,
                connection,
                "ignoring disconnect from superseded connection"
            ),
            None => {}
        }
        out
    }

    pub fn attach_identity(&mut self, device_id: &str, identity: &str) -> Vec<Delivery> {
        let mut out = Vec::new();
        let Some(endpoint) = self.endpoints.get_mut(device_id) else {
            debug!(device = %device_id, "identity for unknown device");
            return out;
        };
        endpoint.identity = Some(identity.to_string());
        let paired = endpoint.paired_with.is_some();
        self.codes.retain(|_, code| code.owner != device_id);
        if !paired {
            self.discover(device_id, &mut out);
        }
        out
    }

    pub fn expire_codes(&mut self, now: Instant) -> Vec<Delivery> {
        let mut expired: Vec<(String, String)> = self
            .codes
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(code, entry)| (code.clone(), entry.owner.clone()))
            .collect();
        expired.sort();

        let mut out = Vec::new();
        for (code, owner) in expired {
            self.codes.remove(&code);
            let Some(endpoint) = self.endpoints.get(&owner) else {
                continue;
            };
            if endpoint.paired_with.is_some() {
                continue;
            }
            debug!(device = %owner, %code, "pairing code expired");
            out.push(Delivery::control(
                endpoint.connection,
                ServerControl::PairingCodeExpired {
                    message: "Pairing code expired, register again for a new one".into(),
                    expired_code: code,
                },
            ));
        }
        out
    }

    fn login_url(&self, device_id: &str, role: Role) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("deviceId", device_id)
            .append_pair("role", role.as_str())
            .finish();
        format!("{}?{}", self.options.login_path, query)
    }

    fn issue_code(&mut self, owner: &str, now: Instant) -> String {
        self.codes.retain(|_, code| code.owner != owner);
        let code = if self.options.debug_code {
            // Debug mode has a single code, so only the latest waiting host
            // can be reached with it.
            if let Some(previous) = self.codes.get(DEBUG_PAIRING_CODE) {
                warn!(
                    displaced = %previous.owner,
                    owner,
                    "debug pairing code reassigned; the earlier host can no longer be paired by code"
                );
            }
            DEBUG_PAIRING_CODE.to_string()
        } else {
            let mut rng = rand::thread_rng();
            loop {
                let candidate = rng.gen_range(100_000..=999_999).to_string();
                if !self.codes.contains_key(&candidate) {
                    break candidate;
                }
            }
        };
        self.codes.insert(
            code.clone(),
            PairingCode {
                owner: owner.to_string(),
                expires_at: now + self.options.code_ttl,
            },
        );
        code
    }

    /// Pair `device_id` with the earliest-registered unpaired endpoint of the
    /// opposite role sharing its identity, or tell it to wait.
    fn discover(&mut self, device_id: &str, out: &mut Vec<Delivery>) {
        let Some(me) = self.endpoints.get(device_id) else {
            return;
        };
        let Some(identity) = me.identity.as_deref() else {
            return;
        };
        if me.paired_with.is_some() {
            return;
        }
        let wanted = me.role.opposite();
        let connection = me.connection;
        let partner = self
            .endpoints
            .values()
            .filter(|other| {
                other.role == wanted
                    && other.paired_with.is_none()
                    && other.identity.as_deref() == Some(identity)
                    && other.device_id != device_id
            })
            .min_by_key(|other| other.seq)
            .map(|other| other.device_id.clone());

        match partner {
            Some(partner) => self.establish(device_id, &partner, "identity", out),
            None => out.push(Delivery::control(
                connection,
                ServerControl::WaitingForPeer {
                    message: format!("Waiting for a {} on this account", wanted),
                },
            )),
        }
    }

    fn establish(&mut self, a: &str, b: &str, method: &str, out: &mut Vec<Delivery>) {
        let (Some(first), Some(second)) = (self.endpoints.get(a), self.endpoints.get(b)) else {
            return;
        };
        let (host, viewer) = if first.role == Role::Host {
            (first.clone(), second.clone())
        } else {
            (second.clone(), first.clone())
        };

        for (me, partner) in [
            (&host.device_id, &viewer.device_id),
            (&viewer.device_id, &host.device_id),
        ] {
            if let Some(endpoint) = self.endpoints.get_mut(me.as_str()) {
                endpoint.paired_with = Some(partner.clone());
            }
        }
        self.codes
            .retain(|_, code| code.owner != host.device_id && code.owner != viewer.device_id);

        info!(host = %host.device_id, viewer = %viewer.device_id, method, "paired");
        metrics::PAIRINGS.with_label_values(&[method]).inc();

        out.push(Delivery::control(
            host.connection,
            ServerControl::Paired {
                peer_id: viewer.device_id.clone(),
                message: "Paired with viewer".into(),
            },
        ));
        out.push(Delivery::control(
            viewer.connection,
            ServerControl::Paired {
                peer_id: host.device_id.clone(),
                message: "Paired with host".into(),
            },
        ));
    }

    /// Remove the record, its codes and its pairing. The record leaves the
    /// table before the partner re-enters discovery so the partner cannot
    /// pair with it again.
    fn retire(&mut self, device_id: &str, out: &mut Vec<Delivery>) {
        self.codes.retain(|_, code| code.owner != device_id);
        let Some(removed) = self.endpoints.remove(device_id) else {
            return;
        };
        let Some(partner_id) = removed.paired_with else {
            return;
        };
        let Some(partner) = self.endpoints.get_mut(&partner_id) else {
            return;
        };
        if partner.paired_with.as_deref() != Some(device_id) {
            return;
        }
        partner.paired_with = None;
        info!(device = %device_id, partner = %partner_id, "pairing torn down");
        out.push(Delivery::control(
            partner.connection,
            ServerControl::PairedDeviceDisconnected {
                message: "Paired device disconnected".into(),
            },
        ));
        self.discover(&partner_id, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(RegistryOptions::default())
    }

    fn code_from(deliveries: &[Delivery]) -> String {
        deliveries
            .iter()
            .find_map(|d| match &d.envelope {
                ServerEnvelope::Control(ServerControl::Registered {
                    pairing_code: Some(code),
                    ..
                }) => Some(code.clone()),
                _ => None,
            })
            .expect("registered with a code")
    }

    fn controls_for(deliveries: &[Delivery], connection: ConnectionId) -> Vec<ServerControl> {
        deliveries
            .iter()
            .filter(|d| d.connection == connection)
            .filter_map(|d| match &d.envelope {
                ServerEnvelope::Control(control) => Some(control.clone()),
                ServerEnvelope::Peer(_) => None,
            })
            .collect()
    }

    fn is_paired_with(control: &ServerControl, peer: &str) -> bool {
        matches!(control, ServerControl::Paired { peer_id, .. } if peer_id == peer)
    }

    fn assert_pairing_invariant(registry: &SessionRegistry) {
        for endpoint in registry.endpoints.values() {
            if let Some(partner) = &endpoint.paired_with {
                let other = registry.endpoint(partner).expect("partner exists");
                assert_eq!(other.paired_with.as_deref(), Some(endpoint.device_id.as_str()));
                assert_ne!(other.role, endpoint.role);
            }
        }
    }

    #[test_timeout::timeout]
    fn anonymous_host_gets_six_digit_code() {
        let mut registry = registry();
        let out = registry.register(1, "host-a", Role::Host, Credential::Absent, Instant::now());
        let code = code_from(&out);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(registry.device_counts(), DeviceCounts { host: 1, viewer: 0 });
    }

    #[test_timeout::timeout]
    fn code_redemption_pairs_both_sides() {
        let now = Instant::now();
        let mut registry = registry();
        let code = code_from(&registry.register(1, "host-a", Role::Host, Credential::Absent, now));
        registry.register(2, "viewer-a", Role::Viewer, Credential::Absent, now);

        let out = registry
            .redeem("viewer-a", &code, Some((120, 40)), now)
            .expect("redeem");

        assert_eq!(
            out[0],
            Delivery {
                connection: 1,
                envelope: PeerEnvelope::TerminalDimensions { cols: 120, rows: 40 }.into(),
            }
        );
        let host = controls_for(&out, 1);
        let viewer = controls_for(&out, 2);
        assert_eq!(host.len(), 1);
        assert_eq!(viewer.len(), 1);
        assert!(is_paired_with(&host[0], "viewer-a"));
        assert!(is_paired_with(&viewer[0], "host-a"));
        assert_eq!(
            registry.endpoint("host-a").unwrap().paired_with.as_deref(),
            Some("viewer-a")
        );
        assert_pairing_invariant(&registry);
    }

    #[test_timeout::timeout]
    fn redeemed_code_cannot_be_reused() {
        let now = Instant::now();
        let mut registry = registry();
        let code = code_from(&registry.register(1, "host-a", Role::Host, Credential::Absent, now));
        registry.register(2, "viewer-a", Role::Viewer, Credential::Absent, now);
        registry.register(3, "viewer-b", Role::Viewer, Credential::Absent, now);
        registry.redeem("viewer-a", &code, None, now).expect("first redeem");

        assert_eq!(
            registry.redeem("viewer-b", &code, None, now),
            Err(RegistryError::InvalidOrExpiredCode)
        );
        assert!(registry.endpoint("viewer-b").unwrap().paired_with.is_none());
        assert_pairing_invariant(&registry);
    }

    #[test_timeout::timeout]
    fn code_is_unusable_after_ttl_without_sweep() {
        let now = Instant::now();
        let mut registry = registry();
        let code = code_from(&registry.register(1, "host-a", Role::Host, Credential::Absent, now));
        registry.register(2, "viewer-a", Role::Viewer, Credential::Absent, now);

        let later = now + Duration::from_secs(5 * 60);
        assert_eq!(
            registry.redeem("viewer-a", &code, None, later),
            Err(RegistryError::InvalidOrExpiredCode)
        );
        assert!(registry.codes.is_empty());
    }

    #[test_timeout::timeout]
    fn reregistering_host_replaces_its_code() {
        let now = Instant::now();
        let mut registry = registry();
        let first = code_from(&registry.register(1, "host-a", Role::Host, Credential::Absent, now));
        let second = code_from(&registry.register(1, "host-a", Role::Host, Credential::Absent, now));
        registry.register(2, "viewer-a", Role::Viewer, Credential::Absent, now);

        if first != second {
            assert_eq!(
                registry.redeem("viewer-a", &first, None, now),
                Err(RegistryError::InvalidOrExpiredCode)
            );
        }
        assert!(registry.redeem("viewer-a", &second, None, now).is_ok());
    }

    #[test_timeout::timeout]
    fn redeem_against_paired_host_is_rejected() {
        let now = Instant::now();
        let mut registry = SessionRegistry::new(RegistryOptions {
            debug_code: true,
            ..RegistryOptions::default()
        });
        let code = code_from(&registry.register(1, "host-a", Role::Host, Credential::Absent, now));
        assert_eq!(code, DEBUG_PAIRING_CODE);
        registry.register(2, "viewer-a", Role::Viewer, Credential::Absent, now);
        registry.register(3, "viewer-b", Role::Viewer, Credential::Absent, now);
        registry.redeem("viewer-a", &code, None, now).expect("redeem");

        // Simulate a second code issued to the same (paired) host.
        registry.codes.insert(
            "0001".into(),
            PairingCode {
                owner: "host-a".into(),
                expires_at: now + Duration::from_secs(60),
            },
        );
        assert_eq!(
            registry.redeem("viewer-b", "0001", None, now),
            Err(RegistryError::AlreadyPaired)
        );
        assert_pairing_invariant(&registry);
    }

    #[test_timeout::timeout]
    fn debug_code_belongs_to_latest_host() {
        let now = Instant::now();
        let mut registry = SessionRegistry::new(RegistryOptions {
            debug_code: true,
            ..RegistryOptions::default()
        });
        registry.register(1, "host-a", Role::Host, Credential::Absent, now);
        let code = code_from(&registry.register(2, "host-b", Role::Host, Credential::Absent, now));
        assert_eq!(code, DEBUG_PAIRING_CODE);
        assert_eq!(registry.codes.len(), 1);

        registry.register(3, "viewer-a", Role::Viewer, Credential::Absent, now);
        registry.redeem("viewer-a", &code, None, now).expect("redeem");
        assert_eq!(
            registry.endpoint("viewer-a").expect("viewer").paired_with.as_deref(),
            Some("host-b")
        );
        assert!(registry.endpoint("host-a").expect("host").paired_with.is_none());
        assert_pairing_invariant(&registry);
    }

    #[test_timeout::timeout]
    fn unregistered_or_host_redeemer_is_rejected() {
        let now = Instant::now();
        let mut registry = registry();
        let code = code_from(&registry.register(1, "host-a", Role::Host, Credential::Absent, now));
        assert_eq!(
            registry.redeem("ghost", &code, None, now),
            Err(RegistryError::UnknownDevice)
        );
        registry.register(2, "host-b", Role::Host, Credential::Absent, now);
        assert_eq!(
            registry.redeem("host-b", &code, None, now),
            Err(RegistryError::NotAViewer)
        );
    }

    #[test_timeout::timeout]
    fn disconnect_notifies_partner_exactly_once() {
        let now = Instant::now();
        let mut registry = registry();
        let code = code_from(&registry.register(1, "host-a", Role::Host, Credential::Absent, now));
        registry.register(2, "viewer-a", Role::Viewer, Credential::Absent, now);
        registry.redeem("viewer-a", &code, None, now).expect("redeem");

        let out = registry.unregister("viewer-a", 2);
        let notices: Vec<_> = controls_for(&out, 1)
            .into_iter()
            .filter(|c| matches!(c, ServerControl::PairedDeviceDisconnected { .. }))
            .collect();
        assert_eq!(notices.len(), 1);
        assert!(registry.endpoint("viewer-a").is_none());
        assert!(registry.endpoint("host-a").unwrap().paired_with.is_none());

        assert!(registry.unregister("viewer-a", 2).is_empty());
    }

    #[test_timeout::timeout]
    fn identity_pairing_scenario() {
        let now = Instant::now();
        let mut registry = registry();
        let user = || Credential::Valid("user-u".into());

        let host_out = registry.register(1, "host-a", Role::Host, user(), now);
        let host_controls = controls_for(&host_out, 1);
        assert!(matches!(
            host_controls.as_slice(),
            [
                ServerControl::Registered { pairing_code: None, .. },
                ServerControl::WaitingForPeer { .. }
            ]
        ));

        let viewer_out = registry.register(2, "viewer-a", Role::Viewer, user(), now);
        let to_host: Vec<_> = controls_for(&viewer_out, 1);
        let to_viewer: Vec<_> = controls_for(&viewer_out, 2);
        assert_eq!(to_host.len(), 1);
        assert!(is_paired_with(&to_host[0], "viewer-a"));
        assert_eq!(
            to_viewer
                .iter()
                .filter(|c| matches!(c, ServerControl::Paired { .. }))
                .count(),
            1
        );
        assert!(to_viewer.iter().any(|c| is_paired_with(c, "host-a")));
        assert_pairing_invariant(&registry);
    }

    #[test_timeout::timeout]
    fn identity_discovery_prefers_earliest_registration() {
        let now = Instant::now();
        let mut registry = registry();
        let user = || Credential::Valid("user-u".into());
        registry.register(1, "host-old", Role::Host, user(), now);
        registry.register(2, "host-new", Role::Host, user(), now);
        registry.register(3, "host-other", Role::Host, Credential::Valid("user-v".into()), now);

        let out = registry.register(4, "viewer-a", Role::Viewer, user(), now);
        assert!(controls_for(&out, 1).iter().any(|c| is_paired_with(c, "viewer-a")));
        assert!(controls_for(&out, 2).is_empty());
        assert!(controls_for(&out, 3).is_empty());
    }

    #[test_timeout::timeout]
    fn partner_rediscovers_after_loss() {
        let now = Instant::now();
        let mut registry = registry();
        let user = || Credential::Valid("user-u".into());
        registry.register(1, "host-a", Role::Host, user(), now);
        registry.register(2, "viewer-a", Role::Viewer, user(), now);
        registry.register(3, "viewer-b", Role::Viewer, user(), now);

        let out = registry.unregister("host-a", 1);
        let first = controls_for(&out, 2);
        assert!(matches!(first[0], ServerControl::PairedDeviceDisconnected { .. }));
        assert!(matches!(first[1], ServerControl::WaitingForPeer { .. }));

        let out = registry.register(5, "host-b", Role::Host, user(), now);
        // viewer-a registered before viewer-b and is now unpaired again
        assert!(controls_for(&out, 2).iter().any(|c| is_paired_with(c, "host-b")));
        assert_pairing_invariant(&registry);
    }

    #[test_timeout::timeout]
    fn supersede_notifies_partner_and_ignores_stale_disconnect() {
        let now = Instant::now();
        let mut registry = registry();
        let code = code_from(&registry.register(1, "host-a", Role::Host, Credential::Absent, now));
        registry.register(2, "viewer-a", Role::Viewer, Credential::Absent, now);
        registry.redeem("viewer-a", &code, None, now).expect("redeem");

        let out = registry.register(7, "host-a", Role::Host, Credential::Absent, now);
        assert!(controls_for(&out, 2)
            .iter()
            .any(|c| matches!(c, ServerControl::PairedDeviceDisconnected { .. })));
        assert!(code_from(&out).len() == 6);
        assert_eq!(registry.endpoint("host-a").unwrap().connection, 7);

        assert!(registry.unregister("host-a", 1).is_empty());
        assert_eq!(registry.endpoint("host-a").unwrap().connection, 7);
        assert_pairing_invariant(&registry);
    }

    #[test_timeout::timeout]
    fn same_connection_refresh_keeps_identity_pairing() {
        let now = Instant::now();
        let mut registry = registry();
        let user = || Credential::Valid("user-u".into());
        registry.register(1, "host-a", Role::Host, user(), now);
        registry.register(2, "viewer-a", Role::Viewer, user(), now);

        let out = registry.register(2, "viewer-a", Role::Viewer, user(), now);
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0].envelope,
            ServerEnvelope::Control(ServerControl::Registered { .. })
        ));
        assert_eq!(
            registry.endpoint("viewer-a").unwrap().paired_with.as_deref(),
            Some("host-a")
        );
    }

    #[test_timeout::timeout]
    fn invalid_credential_stops_registration() {
        let mut registry = registry();
        let out = registry.register(
            1,
            "host-a",
            Role::Host,
            Credential::Invalid("expired".into()),
            Instant::now(),
        );
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0].envelope,
            ServerEnvelope::Control(ServerControl::AuthError { .. })
        ));
        assert!(registry.endpoint("host-a").is_none());
    }

    #[test_timeout::timeout]
    fn required_login_then_identity_attach_pairs() {
        let now = Instant::now();
        let mut registry = SessionRegistry::new(RegistryOptions {
            auth_policy: AuthPolicy::Required,
            ..RegistryOptions::default()
        });
        let out = registry.register(1, "host-a", Role::Host, Credential::Absent, now);
        match &out[0].envelope {
            ServerEnvelope::Control(ServerControl::LoginRequired { login_url }) => {
                assert_eq!(login_url, "/auth/google?deviceId=host-a&role=host");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.codes.is_empty());

        registry.register(2, "viewer-a", Role::Viewer, Credential::Valid("u".into()), now);
        let out = registry.attach_identity("host-a", "u");
        assert!(controls_for(&out, 1).iter().any(|c| is_paired_with(c, "viewer-a")));
        assert!(controls_for(&out, 2).iter().any(|c| is_paired_with(c, "host-a")));
    }

    #[test_timeout::timeout]
    fn sweeper_expires_codes_and_notifies_unpaired_owner() {
        let now = Instant::now();
        let mut registry = SessionRegistry::new(RegistryOptions {
            code_ttl: Duration::from_secs(10),
            ..RegistryOptions::default()
        });
        let code = code_from(&registry.register(1, "host-a", Role::Host, Credential::Absent, now));

        assert!(registry.expire_codes(now + Duration::from_secs(9)).is_empty());
        let out = registry.expire_codes(now + Duration::from_secs(10));
        assert_eq!(
            out,
            vec![Delivery::control(
                1,
                ServerControl::PairingCodeExpired {
                    message: "Pairing code expired, register again for a new one".into(),
                    expired_code: code,
                },
            )]
        );
        assert!(registry.codes.is_empty());
    }
}
